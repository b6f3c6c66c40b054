// Replacement context: the ordered token map used to instantiate command
// templates. Tokens are written `%name%`; iteration order is insertion order.

use indexmap::IndexMap;
use tracing::warn;

/// Ordered `%token%` → value map.
///
/// Substitution is a single left-to-right pass: a substituted value is not
/// rescanned, and unknown tokens are left literal.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReplacementContext {
    entries: IndexMap<String, String>,
}

impl ReplacementContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a value under `key`. The key may be given with or without the
    /// percent delimiters; it is stored delimited.
    pub fn insert(&mut self, key: impl AsRef<str>, value: impl Into<String>) {
        self.entries.insert(delimit(key.as_ref()), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries.get(&delimit(key)).map(String::as_str)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(&delimit(key))
    }

    /// Merge `other` into `self`; `other`'s values win on key collision.
    pub fn extend(&mut self, other: &ReplacementContext) {
        for (key, value) in &other.entries {
            self.entries.insert(key.clone(), value.clone());
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries
            .iter()
            .map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Substitute all known `%token%` occurrences in `template`.
    pub fn replace(&self, template: &str) -> String {
        let mut out = String::with_capacity(template.len());
        let mut rest = template;

        while let Some(start) = rest.find('%') {
            out.push_str(&rest[..start]);
            let after = &rest[start + 1..];
            match after.find('%') {
                Some(end) => {
                    let token = &rest[start..start + end + 2];
                    if let Some(value) = self.entries.get(token) {
                        out.push_str(value);
                        rest = &after[end + 1..];
                    } else {
                        // Not one of ours; emit the opening '%' and rescan
                        // from the next character so overlapping candidates
                        // are still considered.
                        out.push('%');
                        rest = after;
                    }
                }
                None => {
                    out.push_str(&rest[start..]);
                    rest = "";
                    break;
                }
            }
        }

        out.push_str(rest);
        out
    }

    /// Render the context as GNU-style long options, one `--key=value` pair
    /// per entry, with camelCase token names kebab-cased.
    pub fn to_named_arguments(&self) -> Vec<String> {
        self.entries
            .iter()
            .map(|(key, value)| format!("--{}={}", long_option_name(key), value))
            .collect()
    }

    /// Parse persisted unit-variable records: one `key=value` per line.
    /// Malformed lines are logged and skipped, never executed.
    pub fn from_records(raw: &str) -> Self {
        let mut context = Self::new();
        for line in raw.lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            match line.split_once('=') {
                Some((key, value)) if !key.trim().is_empty() => {
                    context.insert(key.trim(), value.trim());
                }
                _ => warn!(record = line, "skipping malformed context record"),
            }
        }
        context
    }

    /// Serialize for persistence in the format `from_records` accepts.
    pub fn to_records(&self) -> String {
        let mut out = String::new();
        for (key, value) in &self.entries {
            out.push_str(key);
            out.push('=');
            out.push_str(value);
            out.push('\n');
        }
        out
    }
}

impl FromIterator<(String, String)> for ReplacementContext {
    fn from_iter<T: IntoIterator<Item = (String, String)>>(iter: T) -> Self {
        let mut context = Self::new();
        for (key, value) in iter {
            context.insert(key, value);
        }
        context
    }
}

fn delimit(key: &str) -> String {
    if key.starts_with('%') && key.ends_with('%') && key.len() >= 2 {
        key.to_string()
    } else {
        format!("%{key}%")
    }
}

/// `fileUUID` → `file-uuid`, `SIPDirectory` → `sip-directory`.
fn long_option_name(token: &str) -> String {
    let name = token.trim_matches('%');
    let chars: Vec<char> = name.chars().collect();
    let mut out = String::with_capacity(name.len() + 4);

    for (i, &c) in chars.iter().enumerate() {
        if c.is_ascii_uppercase() {
            let prev_lower = i > 0 && chars[i - 1].is_ascii_lowercase();
            let next_lower = i > 0
                && i + 1 < chars.len()
                && chars[i - 1].is_ascii_uppercase()
                && chars[i + 1].is_ascii_lowercase();
            if prev_lower || next_lower {
                out.push('-');
            }
            out.push(c.to_ascii_lowercase());
        } else {
            out.push(c);
        }
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn context() -> ReplacementContext {
        let mut ctx = ReplacementContext::new();
        ctx.insert("fileUUID", "abc-123");
        ctx.insert("%SIPDirectory%", "/var/share/sip/");
        ctx
    }

    #[test]
    fn test_replace_known_tokens() {
        let ctx = context();
        assert_eq!(
            ctx.replace("cp %SIPDirectory%objects %fileUUID%"),
            "cp /var/share/sip/objects abc-123"
        );
    }

    #[test]
    fn test_replace_leaves_unknown_tokens_literal() {
        let ctx = context();
        assert_eq!(ctx.replace("keep %unknown% intact"), "keep %unknown% intact");
    }

    #[test]
    fn test_replace_is_not_recursive() {
        let mut ctx = ReplacementContext::new();
        ctx.insert("a", "%b%");
        ctx.insert("b", "loop");
        assert_eq!(ctx.replace("%a%"), "%b%");
    }

    #[test]
    fn test_replace_overlapping_candidates() {
        let mut ctx = ReplacementContext::new();
        ctx.insert("y", "Y");
        // In "%x%y%" the first candidate token %x% is unknown; the second
        // candidate %y% must still match.
        assert_eq!(ctx.replace("%x%y%"), "%xY");
    }

    #[test]
    fn test_replace_idempotent_when_token_free() {
        let ctx = context();
        let once = ctx.replace("run %fileUUID% now");
        assert_eq!(ctx.replace(&once), once);
    }

    #[test]
    fn test_insertion_order_preserved() {
        let ctx = context();
        let keys: Vec<&str> = ctx.iter().map(|(k, _)| k).collect();
        assert_eq!(keys, vec!["%fileUUID%", "%SIPDirectory%"]);
    }

    #[test]
    fn test_named_arguments() {
        let ctx = context();
        assert_eq!(
            ctx.to_named_arguments(),
            vec![
                "--file-uuid=abc-123".to_string(),
                "--sip-directory=/var/share/sip/".to_string(),
            ]
        );
    }

    #[test]
    fn test_from_records_skips_malformed() {
        let ctx = ReplacementContext::from_records("a=1\nnot a record\n%b%=two\n\n");
        assert_eq!(ctx.len(), 2);
        assert_eq!(ctx.get("a"), Some("1"));
        assert_eq!(ctx.get("b"), Some("two"));
    }

    #[test]
    fn test_records_round_trip() {
        let ctx = context();
        assert_eq!(ReplacementContext::from_records(&ctx.to_records()), ctx);
    }
}
