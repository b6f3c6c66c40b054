// Processing options and engine configuration.
//
// `ProcessingConfig` mirrors the submission wire message field for field;
// every field is also exposed to workflow command templates as a
// `%config:<field>%` token.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Compression applied to the final AIP container.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum CompressionAlgorithm {
    #[default]
    Unspecified,
    Uncompressed,
    Tar,
    TarBzip2,
    TarGzip,
    S7Copy,
    S7Bzip2,
    S7Lzma,
}

impl CompressionAlgorithm {
    /// Wire enum value; also the `%config:aip_compression_algorithm%` token.
    pub fn as_i32(self) -> i32 {
        match self {
            CompressionAlgorithm::Unspecified => 0,
            CompressionAlgorithm::Uncompressed => 1,
            CompressionAlgorithm::Tar => 2,
            CompressionAlgorithm::TarBzip2 => 3,
            CompressionAlgorithm::TarGzip => 4,
            CompressionAlgorithm::S7Copy => 5,
            CompressionAlgorithm::S7Bzip2 => 6,
            CompressionAlgorithm::S7Lzma => 7,
        }
    }

    pub fn from_i32(value: i32) -> Self {
        match value {
            1 => CompressionAlgorithm::Uncompressed,
            2 => CompressionAlgorithm::Tar,
            3 => CompressionAlgorithm::TarBzip2,
            4 => CompressionAlgorithm::TarGzip,
            5 => CompressionAlgorithm::S7Copy,
            6 => CompressionAlgorithm::S7Bzip2,
            7 => CompressionAlgorithm::S7Lzma,
            _ => CompressionAlgorithm::Unspecified,
        }
    }
}

/// Per-submission processing options.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProcessingConfig {
    pub assign_uuids_to_directories: bool,
    pub examine_contents: bool,
    pub generate_transfer_structure_report: bool,
    pub document_empty_directories: bool,
    pub extract_packages: bool,
    pub delete_packages_after_extraction: bool,
    pub identify_transfer: bool,
    pub identify_submission_and_metadata: bool,
    pub identify_before_normalization: bool,
    pub normalize: bool,
    pub transcribe_files: bool,
    pub perform_policy_checks_on_originals: bool,
    pub perform_policy_checks_on_preservation_derivatives: bool,
    pub aip_compression_level: i32,
    pub aip_compression_algorithm: CompressionAlgorithm,
}

impl Default for ProcessingConfig {
    fn default() -> Self {
        Self {
            assign_uuids_to_directories: true,
            examine_contents: false,
            generate_transfer_structure_report: true,
            document_empty_directories: true,
            extract_packages: true,
            delete_packages_after_extraction: true,
            identify_transfer: true,
            identify_submission_and_metadata: true,
            identify_before_normalization: true,
            normalize: true,
            transcribe_files: false,
            perform_policy_checks_on_originals: false,
            perform_policy_checks_on_preservation_derivatives: false,
            aip_compression_level: 1,
            aip_compression_algorithm: CompressionAlgorithm::S7Bzip2,
        }
    }
}

impl ProcessingConfig {
    /// Flatten every field into a `(token, value)` pair, named
    /// `config:<snake_name>`. Booleans render as `true`/`false`, the
    /// compression algorithm as its wire value.
    pub fn tokens(&self) -> Vec<(String, String)> {
        fn flag(name: &str, value: bool) -> (String, String) {
            (format!("config:{name}"), value.to_string())
        }

        vec![
            flag(
                "assign_uuids_to_directories",
                self.assign_uuids_to_directories,
            ),
            flag("examine_contents", self.examine_contents),
            flag(
                "generate_transfer_structure_report",
                self.generate_transfer_structure_report,
            ),
            flag(
                "document_empty_directories",
                self.document_empty_directories,
            ),
            flag("extract_packages", self.extract_packages),
            flag(
                "delete_packages_after_extraction",
                self.delete_packages_after_extraction,
            ),
            flag("identify_transfer", self.identify_transfer),
            flag(
                "identify_submission_and_metadata",
                self.identify_submission_and_metadata,
            ),
            flag(
                "identify_before_normalization",
                self.identify_before_normalization,
            ),
            flag("normalize", self.normalize),
            flag("transcribe_files", self.transcribe_files),
            flag(
                "perform_policy_checks_on_originals",
                self.perform_policy_checks_on_originals,
            ),
            flag(
                "perform_policy_checks_on_preservation_derivatives",
                self.perform_policy_checks_on_preservation_derivatives,
            ),
            (
                "config:aip_compression_level".to_string(),
                self.aip_compression_level.to_string(),
            ),
            (
                "config:aip_compression_algorithm".to_string(),
                self.aip_compression_algorithm.as_i32().to_string(),
            ),
        ]
    }
}

/// Shared directory layout the engine operates in.
#[derive(Debug, Clone)]
pub struct SharedDirectories {
    pub shared: PathBuf,
    pub processing: PathBuf,
    pub rejected: PathBuf,
    pub tmp: PathBuf,
}

impl SharedDirectories {
    pub fn under(shared: impl Into<PathBuf>) -> Self {
        let shared = shared.into();
        Self {
            processing: shared.join("currentlyProcessing"),
            rejected: shared.join("rejected"),
            tmp: shared.join("tmp"),
            shared,
        }
    }

    /// Abstract the shared directory prefix as `%sharedPath%` for storage.
    pub fn abstract_path(&self, path: &Path) -> String {
        let path = path.to_string_lossy();
        let shared = self.shared.to_string_lossy();
        match path.strip_prefix(shared.as_ref()) {
            Some(rest) => format!("%sharedPath%{rest}"),
            None => path.into_owned(),
        }
    }

    /// Resolve a stored path, expanding a leading `%sharedPath%`.
    pub fn resolve_path(&self, stored: &str) -> PathBuf {
        match stored.strip_prefix("%sharedPath%") {
            Some(rest) => {
                let rest = rest.trim_start_matches('/');
                self.shared.join(rest)
            }
            None => PathBuf::from(stored),
        }
    }
}

/// Engine-level knobs, normally loaded from the environment by the binary.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub directories: SharedDirectories,
    pub max_concurrent_packages: usize,
    pub max_queued_packages: usize,
    pub worker_threads: usize,
    pub batch_size: usize,
    pub task_timeout: Duration,
    pub shutdown_timeout: Duration,
    pub debug: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            directories: SharedDirectories::under("/var/lib/arcflow/share"),
            max_concurrent_packages: 2,
            max_queued_packages: 4096,
            worker_threads: num_workers(),
            batch_size: 128,
            task_timeout: Duration::from_secs(300),
            shutdown_timeout: Duration::from_secs(5),
            debug: false,
        }
    }
}

impl EngineConfig {
    /// Read configuration from `ARCFLOW_*` environment variables, falling
    /// back to the defaults for anything unset.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(shared) = std::env::var("ARCFLOW_SHARED_DIRECTORY") {
            config.directories = SharedDirectories::under(shared);
        }
        if let Some(n) = env_usize("ARCFLOW_CONCURRENT_PACKAGES") {
            config.max_concurrent_packages = n.max(1);
        }
        if let Some(n) = env_usize("ARCFLOW_MAX_QUEUED_PACKAGES") {
            config.max_queued_packages = n.max(1);
        }
        if let Some(n) = env_usize("ARCFLOW_WORKER_THREADS") {
            config.worker_threads = n.max(1);
        }
        if let Some(n) = env_usize("ARCFLOW_BATCH_SIZE") {
            config.batch_size = n.max(1);
        }
        if let Some(n) = env_usize("ARCFLOW_TASK_TIMEOUT_SECONDS") {
            config.task_timeout = Duration::from_secs(n as u64);
        }
        if let Some(n) = env_usize("ARCFLOW_SHUTDOWN_TIMEOUT_SECONDS") {
            config.shutdown_timeout = Duration::from_secs(n as u64);
        }
        config.debug = std::env::var("ARCFLOW_DEBUG")
            .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
            .unwrap_or(false);
        config
    }
}

fn env_usize(name: &str) -> Option<usize> {
    std::env::var(name).ok().and_then(|v| v.parse().ok())
}

fn num_workers() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_tokens_cover_every_field() {
        let config = ProcessingConfig::default();
        let tokens = config.tokens();
        assert_eq!(tokens.len(), 15);
        assert!(tokens
            .iter()
            .any(|(k, v)| k == "config:normalize" && v == "true"));
        assert!(tokens
            .iter()
            .any(|(k, v)| k == "config:aip_compression_algorithm" && v == "6"));
    }

    #[test]
    fn test_shared_path_round_trip() {
        let dirs = SharedDirectories::under("/srv/share");
        let stored = dirs.abstract_path(Path::new("/srv/share/currentlyProcessing/t1"));
        assert_eq!(stored, "%sharedPath%/currentlyProcessing/t1");
        assert_eq!(
            dirs.resolve_path(&stored),
            PathBuf::from("/srv/share/currentlyProcessing/t1")
        );
        assert_eq!(
            dirs.resolve_path("/elsewhere/x"),
            PathBuf::from("/elsewhere/x")
        );
    }
}
