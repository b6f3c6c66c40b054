// Package: one input bundle flowing through the workflow.
//
// A package wraps a transfer and the SIP produced from it; the stage decides
// which unit id, directory token and replacement mapping apply. State is
// reloaded from the store at every job boundary so path rewrites made by
// prior jobs are visible.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use uuid::Uuid;

use crate::config::{ProcessingConfig, SharedDirectories};
use crate::context::ReplacementContext;
use crate::error::{EngineError, StoreError};
use crate::store::{FileRecord, PackageRecord, StateStore, UnitVariableRecord};

/// Unit variable under which client scripts accumulate context records.
pub const CONTEXT_VARIABLE: &str = "replacements";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Transfer,
    Ingest,
}

impl Stage {
    /// Unit type label used for unit-variable records.
    pub fn unit_type(self) -> &'static str {
        match self {
            Stage::Transfer => "Transfer",
            Stage::Ingest => "SIP",
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Stage::Transfer => "transfer",
            Stage::Ingest => "ingest",
        }
    }

    pub fn from_str_name(name: &str) -> Option<Self> {
        match name {
            "transfer" => Some(Stage::Transfer),
            "ingest" => Some(Stage::Ingest),
            _ => None,
        }
    }
}

/// Queue class of a package; admission priority is DIP > SIP > Transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PackageType {
    Transfer,
    Sip,
    Dip,
}

impl PackageType {
    pub fn as_str(self) -> &'static str {
        match self {
            PackageType::Transfer => "Transfer",
            PackageType::Sip => "SIP",
            PackageType::Dip => "DIP",
        }
    }
}

/// Wire-visible package status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PackageStatus {
    Unspecified,
    Failed,
    Rejected,
    Complete,
    Processing,
}

impl PackageStatus {
    pub fn as_i32(self) -> i32 {
        match self {
            PackageStatus::Unspecified => 0,
            PackageStatus::Failed => 1,
            PackageStatus::Rejected => 2,
            PackageStatus::Complete => 3,
            PackageStatus::Processing => 4,
        }
    }

    pub fn from_i32(value: i32) -> Self {
        match value {
            1 => PackageStatus::Failed,
            2 => PackageStatus::Rejected,
            3 => PackageStatus::Complete,
            4 => PackageStatus::Processing,
            _ => PackageStatus::Unspecified,
        }
    }

    pub fn is_final(self) -> bool {
        matches!(
            self,
            PackageStatus::Failed | PackageStatus::Rejected | PackageStatus::Complete
        )
    }
}

pub struct Package {
    name: String,
    url: String,
    config: ProcessingConfig,
    transfer_id: Uuid,
    sip_id: Uuid,
    stage: Stage,
    kind: PackageType,
    current_path: PathBuf,
    aip_filename: String,
    directories: SharedDirectories,
    created_at: DateTime<Utc>,
}

impl Package {
    pub fn new(
        name: impl Into<String>,
        url: impl Into<String>,
        config: ProcessingConfig,
        directories: SharedDirectories,
    ) -> Self {
        let transfer_id = Uuid::new_v4();
        let sip_id = Uuid::new_v4();
        let current_path = directories
            .processing
            .join("transfer")
            .join(transfer_id.to_string());

        Self {
            name: name.into(),
            url: url.into(),
            config,
            transfer_id,
            sip_id,
            stage: Stage::Transfer,
            kind: PackageType::Transfer,
            current_path,
            aip_filename: String::new(),
            directories,
            created_at: Utc::now(),
        }
    }

    /// Create the working directories and persist the new package.
    pub async fn create(
        store: &dyn StateStore,
        name: impl Into<String>,
        url: impl Into<String>,
        config: ProcessingConfig,
        directories: SharedDirectories,
    ) -> Result<Self, EngineError> {
        let package = Self::new(name, url, config, directories);

        let ingest_dir = package
            .directories
            .processing
            .join("ingest")
            .join(package.sip_id.to_string());
        for dir in [&package.current_path, &ingest_dir] {
            tokio::fs::create_dir_all(dir)
                .await
                .map_err(|e| EngineError::Internal(e.into()))?;
        }

        store.put_package(&package.record()).await?;
        info!(
            package_id = %package.sip_id,
            transfer_id = %package.transfer_id,
            name = %package.name,
            "package created"
        );
        Ok(package)
    }

    pub fn from_record(record: PackageRecord, directories: SharedDirectories) -> Self {
        let kind = match record.stage {
            Stage::Transfer => PackageType::Transfer,
            Stage::Ingest => PackageType::Sip,
        };
        Self {
            name: record.name,
            url: record.url,
            config: record.config,
            transfer_id: record.transfer_id,
            sip_id: record.sip_id,
            stage: record.stage,
            kind,
            current_path: directories.resolve_path(&record.current_path),
            aip_filename: record.aip_filename.unwrap_or_default(),
            directories,
            created_at: record.created_at,
        }
    }

    pub fn record(&self) -> PackageRecord {
        PackageRecord {
            sip_id: self.sip_id,
            transfer_id: self.transfer_id,
            name: self.name.clone(),
            url: self.url.clone(),
            stage: self.stage,
            current_path: self.directories.abstract_path(&self.current_path),
            aip_filename: if self.aip_filename.is_empty() {
                None
            } else {
                Some(self.aip_filename.clone())
            },
            status: PackageStatus::Processing,
            config: self.config.clone(),
            created_at: self.created_at,
        }
    }

    /// The package uuid: the SIP id for its whole lifetime.
    pub fn uuid(&self) -> Uuid {
        self.sip_id
    }

    /// The unit id jobs and variables are recorded against: the transfer id
    /// during Transfer, the SIP id during Ingest.
    pub fn sub_id(&self) -> Uuid {
        match self.stage {
            Stage::Transfer => self.transfer_id,
            Stage::Ingest => self.sip_id,
        }
    }

    pub fn transfer_id(&self) -> Uuid {
        self.transfer_id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn stage(&self) -> Stage {
        self.stage
    }

    pub fn kind(&self) -> PackageType {
        self.kind
    }

    /// Reclassify the package for queue admission. Used by workflow steps
    /// that split a DIP off a SIP.
    pub fn set_kind(&mut self, kind: PackageType) {
        self.kind = kind;
    }

    pub fn config(&self) -> &ProcessingConfig {
        &self.config
    }

    pub fn current_path(&self) -> &Path {
        &self.current_path
    }

    /// Directory token whose meaning tracks the stage.
    pub fn replacement_path_token(&self) -> &'static str {
        match self.stage {
            Stage::Transfer => "transferDirectory",
            Stage::Ingest => "SIPDirectory",
        }
    }

    /// One-way transition into the Ingest stage.
    pub fn start_ingest(&mut self) {
        debug!(package_id = %self.sip_id, "package entering ingest");
        self.stage = Stage::Ingest;
        self.kind = PackageType::Sip;
    }

    /// Refresh path state from the store, making prior jobs' side effects
    /// visible. Called at every job boundary.
    pub async fn reload(&mut self, store: &dyn StateStore) -> Result<(), EngineError> {
        let record = store
            .get_package(self.sip_id)
            .await?
            .ok_or(StoreError::PackageNotFound(self.sip_id))?;
        self.current_path = self.directories.resolve_path(&record.current_path);
        self.aip_filename = record.aip_filename.unwrap_or_default();
        Ok(())
    }

    /// Load the accumulated replacement context for the current unit.
    pub async fn context(&self, store: &dyn StateStore) -> Result<ReplacementContext, EngineError> {
        let mut context = ReplacementContext::new();
        for variable in store.get_unit_variables(self.sub_id()).await? {
            if variable.variable == CONTEXT_VARIABLE {
                context.extend(&ReplacementContext::from_records(&variable.value));
            }
        }
        Ok(context)
    }

    /// Record a processing choice or context addition for the current unit.
    pub async fn set_variable(
        &self,
        store: &dyn StateStore,
        key: impl Into<String>,
        value: impl Into<String>,
        chain_link_id: Option<Uuid>,
    ) -> Result<(), EngineError> {
        let variable = UnitVariableRecord {
            unit_type: self.stage.unit_type().to_string(),
            unit_id: self.sub_id(),
            variable: key.into(),
            value: value.into(),
            chain_link_id,
        };
        info!(
            package_id = %self.sip_id,
            variable = %variable.variable,
            value = %variable.value,
            "unit variable set"
        );
        store.set_unit_variable(&variable).await?;
        Ok(())
    }

    fn base_replacements(&self) -> ReplacementContext {
        let mut mapping = ReplacementContext::new();
        mapping.insert("tmpDirectory", dir_token(&self.directories.tmp));
        mapping.insert("processingDirectory", dir_token(&self.directories.processing));
        mapping.insert("rejectedDirectory", dir_token(&self.directories.rejected));
        mapping
    }

    /// The full token map for the current stage, including flattened
    /// processing-config fields.
    pub fn get_replacement_mapping(&self) -> ReplacementContext {
        let current = self.current_path.to_string_lossy();
        let mut mapping = self.base_replacements();

        mapping.insert("SIPUUID", self.sip_id.to_string());
        mapping.insert("TransferUUID", self.transfer_id.to_string());
        mapping.insert("SIPName", self.name.clone());
        mapping.insert("SIPLogsDirectory", dir_token(&self.current_path.join("logs")));
        mapping.insert(
            "SIPObjectsDirectory",
            dir_token(&self.current_path.join("objects")),
        );
        mapping.insert("SIPDirectory", current.clone());
        mapping.insert(
            "SIPDirectoryBasename",
            self.current_path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default(),
        );
        mapping.insert(
            "relativeLocation",
            self.directories.abstract_path(&self.current_path),
        );

        for (token, value) in self.config.tokens() {
            mapping.insert(token, value);
        }

        mapping.insert("unitType", self.stage.unit_type());
        match self.stage {
            Stage::Ingest => {
                mapping.insert("AIPFilename", self.aip_filename.clone());
            }
            Stage::Transfer => {
                mapping.insert(self.replacement_path_token(), current);
                mapping.insert("URL", self.url.clone());
            }
        }

        mapping
    }

    /// Iterate the files belonging to this package: catalog records first
    /// (skipping ones whose file no longer exists), then a filesystem walk of
    /// the working directory, de-duplicated on absolute path. Each call
    /// restarts iteration.
    pub async fn files(
        &self,
        store: &dyn StateStore,
        filter_subdir: Option<&str>,
    ) -> Result<PackageFiles, EngineError> {
        let mut catalog = store.list_files(self.sub_id()).await?;

        if let Some(subdir) = filter_subdir {
            let prefix = format!("%{}%{}", self.replacement_path_token(), subdir);
            catalog.retain(|f| f.current_location.starts_with(&prefix));
        }

        let start_path = match filter_subdir {
            Some(subdir) => self.current_path.join(subdir),
            None => self.current_path.clone(),
        };

        Ok(PackageFiles {
            catalog: catalog.into_iter(),
            walker: None,
            seen: HashSet::new(),
            unit_dir: self.current_path.clone(),
            start_path,
        })
    }
}

/// Lazy file iteration for one package; see [`Package::files`].
pub struct PackageFiles {
    catalog: std::vec::IntoIter<FileRecord>,
    walker: Option<walkdir::IntoIter>,
    seen: HashSet<PathBuf>,
    unit_dir: PathBuf,
    start_path: PathBuf,
}

impl Iterator for PackageFiles {
    type Item = ReplacementContext;

    fn next(&mut self) -> Option<Self::Item> {
        for file in self.catalog.by_ref() {
            let mapping = file_replacement_mapping(&file, &self.unit_dir);
            let absolute = PathBuf::from(mapping.get("inputFile").unwrap_or_default());
            if !absolute.exists() {
                continue;
            }
            self.seen.insert(absolute);
            return Some(mapping);
        }

        let start_path = self.start_path.clone();
        let walker = self
            .walker
            .get_or_insert_with(|| walkdir::WalkDir::new(start_path).into_iter());
        for entry in walker.by_ref() {
            let Ok(entry) = entry else { continue };
            if !entry.file_type().is_file() {
                continue;
            }
            let path = entry.into_path();
            if self.seen.contains(&path) {
                continue;
            }
            let mut mapping = ReplacementContext::new();
            mapping.insert("relativeLocation", path.to_string_lossy());
            mapping.insert("fileUUID", "None");
            mapping.insert("fileGrpUse", "");
            return Some(mapping);
        }

        None
    }
}

/// Per-file replacement tokens, merged over the package mapping when a
/// standard link runs one task per file.
pub fn file_replacement_mapping(file: &FileRecord, unit_dir: &Path) -> ReplacementContext {
    let unit_dir = dir_token(unit_dir);
    let absolute = file
        .current_location
        .replace("%SIPDirectory%", &unit_dir)
        .replace("%transferDirectory%", &unit_dir);

    let location = Path::new(&file.current_location);
    let dirname = location
        .parent()
        .map(|p| p.to_string_lossy().into_owned())
        .unwrap_or_default();
    let name = location
        .file_stem()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let extension = location
        .extension()
        .map(|e| e.to_string_lossy().into_owned())
        .unwrap_or_default();
    let extension_with_dot = if extension.is_empty() {
        String::new()
    } else {
        format!(".{extension}")
    };

    let mut mapping = ReplacementContext::new();
    mapping.insert("fileUUID", file.id.to_string());
    mapping.insert("originalLocation", file.original_location.clone());
    mapping.insert("currentLocation", file.current_location.clone());
    mapping.insert("fileGrpUse", file.file_group_use.clone());
    mapping.insert("fileDirectory", dirname);
    mapping.insert("fileName", name);
    mapping.insert("fileExtension", extension);
    mapping.insert("fileExtensionWithDot", extension_with_dot);
    mapping.insert("relativeLocation", absolute.clone());
    mapping.insert("inputFile", absolute.clone());
    mapping.insert("fileFullName", absolute);
    mapping
}

/// Render a directory path as a token value with a trailing separator.
fn dir_token(path: &Path) -> String {
    let mut s = path.to_string_lossy().into_owned();
    if !s.ends_with('/') {
        s.push('/');
    }
    s
}
