use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::env;
use std::path::Path;

use crate::error::ErrorCode;
use crate::model::{EntityId, ResourceKey};

/// Per-call-site coordinator settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoordinatorConfig {
    /// Collection name; prefixes resource keys and is always invalidated.
    #[serde(default = "default_collection")]
    pub collection: String,
    /// Send multi-entity batches through the bulk endpoint when available.
    #[serde(default = "default_true")]
    pub bulk_writes: bool,
    /// Drop edits whose value already equals the local value.
    #[serde(default)]
    pub skip_unchanged: bool,
    /// Extra query keys to invalidate after a write (e.g. `"projects"`).
    #[serde(default)]
    pub invalidate: Vec<String>,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            collection: default_collection(),
            bulk_writes: default_true(),
            skip_unchanged: false,
            invalidate: Vec::new(),
        }
    }
}

impl CoordinatorConfig {
    #[must_use]
    pub fn for_collection(collection: impl Into<String>) -> Self {
        Self {
            collection: collection.into(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_invalidate<I, S>(mut self, keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.invalidate.extend(keys.into_iter().map(Into::into));
        self
    }

    #[must_use]
    pub fn resource_key(&self, entity_id: &EntityId) -> ResourceKey {
        ResourceKey::for_entity(&self.collection, entity_id)
    }

    /// Query keys a committed (or conflicted) write to `entity_id` touches:
    /// the collection, the entity's resource key, then the configured extras.
    #[must_use]
    pub fn related_keys(&self, entity_id: &EntityId) -> Vec<String> {
        let mut keys = Vec::with_capacity(2 + self.invalidate.len());
        keys.push(self.collection.clone());
        keys.push(self.resource_key(entity_id).as_str().to_string());
        keys.extend(self.invalidate.iter().cloned());
        keys
    }
}

pub fn load_config(project_root: &Path) -> Result<CoordinatorConfig> {
    let path = project_root.join(".roster/config.toml");
    if !path.exists() {
        return Ok(CoordinatorConfig::default());
    }

    let content = std::fs::read_to_string(&path)
        .with_context(|| format!("Failed to read {}", path.display()))?;

    toml::from_str::<CoordinatorConfig>(&content).with_context(|| {
        let code = ErrorCode::ConfigParseError;
        format!(
            "{code}: Failed to parse {} ({})",
            path.display(),
            code.hint().unwrap_or_else(|| code.message())
        )
    })
}

/// Load the project config, then apply `ROSTER_*` environment overrides.
pub fn resolve_config(project_root: &Path) -> Result<CoordinatorConfig> {
    let config = load_config(project_root)?;
    apply_env_overrides(config, |name| env::var(name).ok())
}

fn apply_env_overrides(
    mut config: CoordinatorConfig,
    lookup: impl Fn(&str) -> Option<String>,
) -> Result<CoordinatorConfig> {
    if let Some(raw) = lookup("ROSTER_BULK_WRITES") {
        config.bulk_writes =
            parse_flag(&raw).with_context(|| format!("Invalid ROSTER_BULK_WRITES: {raw:?}"))?;
    }
    if let Some(raw) = lookup("ROSTER_SKIP_UNCHANGED") {
        config.skip_unchanged =
            parse_flag(&raw).with_context(|| format!("Invalid ROSTER_SKIP_UNCHANGED: {raw:?}"))?;
    }
    Ok(config)
}

fn parse_flag(raw: &str) -> Result<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" | "" => Ok(false),
        other => anyhow::bail!("expected a boolean flag, got {other:?}"),
    }
}

const fn default_true() -> bool {
    true
}

fn default_collection() -> String {
    "assignments".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env_of(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn missing_config_uses_defaults() {
        let root = tempfile::tempdir().expect("temp dir");
        let cfg = load_config(root.path()).expect("load should succeed");
        assert_eq!(cfg, CoordinatorConfig::default());
        assert_eq!(cfg.collection, "assignments");
        assert!(cfg.bulk_writes);
        assert!(!cfg.skip_unchanged);
        assert!(cfg.invalidate.is_empty());
    }

    #[test]
    fn partial_config_fills_defaults() {
        let root = tempfile::tempdir().expect("temp dir");
        std::fs::create_dir_all(root.path().join(".roster")).expect("create .roster");
        std::fs::write(
            root.path().join(".roster/config.toml"),
            r#"
collection = "people"
invalidate = ["projects", "utilization"]
"#,
        )
        .expect("write config");

        let cfg = load_config(root.path()).expect("load should succeed");

        assert_eq!(cfg.collection, "people");
        assert_eq!(cfg.invalidate, ["projects", "utilization"]);
        assert!(cfg.bulk_writes);
        assert!(!cfg.skip_unchanged);
    }

    #[test]
    fn malformed_config_reports_path() {
        let root = tempfile::tempdir().expect("temp dir");
        std::fs::create_dir_all(root.path().join(".roster")).expect("create .roster");
        std::fs::write(root.path().join(".roster/config.toml"), "bulk_writes = \"maybe\"")
            .expect("write config");

        let err = load_config(root.path()).expect_err("should fail");
        let message = err.to_string();
        assert!(message.contains("config.toml"));
        assert!(message.starts_with(ErrorCode::ConfigParseError.code()));
        assert!(message.contains("Fix syntax"));
    }

    #[test]
    fn env_overrides_flags() {
        let cfg = apply_env_overrides(
            CoordinatorConfig::default(),
            env_of(&[("ROSTER_BULK_WRITES", "off"), ("ROSTER_SKIP_UNCHANGED", "Yes")]),
        )
        .expect("resolve should succeed");
        assert!(!cfg.bulk_writes);
        assert!(cfg.skip_unchanged);
    }

    #[test]
    fn invalid_env_flag_is_an_error() {
        let err = apply_env_overrides(
            CoordinatorConfig::default(),
            env_of(&[("ROSTER_BULK_WRITES", "sometimes")]),
        )
        .expect_err("should fail");
        assert!(err.to_string().contains("ROSTER_BULK_WRITES"));
    }

    #[test]
    fn related_keys_cover_collection_entity_and_extras() {
        let cfg = CoordinatorConfig::for_collection("assignments").with_invalidate(["projects"]);
        assert_eq!(
            cfg.related_keys(&EntityId::from("a7")),
            ["assignments", "assignments/a7", "projects"]
        );
    }
}
