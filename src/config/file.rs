//! `.nimp.toml` sections.

use serde::Deserialize;
use std::collections::BTreeMap;

use crate::logging::SummaryConfig;

/// Fully merged configuration, deserialized once every layer is applied.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ConfigFile {
    pub project: ProjectSection,
    pub parameters: BTreeMap<String, toml::Value>,
    pub artifact_collection: BTreeMap<String, String>,
    pub environment: BTreeMap<String, String>,
    pub summary: SummaryConfig,
    pub package: PackageSettings,
    pub symbol_servers: Option<SymbolServerSettings>,
    pub revision_resolver: Option<RevisionResolverSettings>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ProjectSection {
    pub uproject: Option<String>,
    /// Absolute once loaded; relative values are resolved against the
    /// directory of the file that set them.
    pub uproject_dir: Option<String>,
    pub unreal_dir: Option<String>,
    pub editor_name: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PackageSettings {
    pub content_paks: Vec<String>,
    pub content_compression_exclusions: Vec<String>,
    pub no_compile_packaging: bool,
    pub hook_extensions: Vec<String>,
    /// Minimum free space on the project drive before packaging, in GiB.
    pub min_free_space_gb: u64,
    /// Legacy (Engine < 4.24) per-variant settings.
    pub variants: BTreeMap<String, VariantSettings>,
}

impl Default for PackageSettings {
    fn default() -> Self {
        Self {
            content_paks: Vec::new(),
            content_compression_exclusions: Vec::new(),
            no_compile_packaging: false,
            hook_extensions: vec![
                String::new(),
                ".sh".to_string(),
                ".cmd".to_string(),
                ".bat".to_string(),
                ".exe".to_string(),
            ],
            min_free_space_gb: 50,
            variants: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct VariantSettings {
    #[serde(rename = "type")]
    pub package_type: Option<String>,
    pub content_paks: Option<Vec<String>>,
    pub content_compression_exclusions: Option<Vec<String>>,
    pub layout: Option<String>,
    pub ps4_titles: BTreeMap<String, String>,
    pub ignored_errors: Vec<String>,
    pub ignored_warnings: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SymbolServerSettings {
    /// Retention in days for stores without their own value.
    pub expiration: u64,
    pub program: Option<SymbolStoreEntry>,
    pub shaders: Option<SymbolStoreEntry>,
}

impl Default for SymbolServerSettings {
    fn default() -> Self {
        Self {
            expiration: 30,
            program: None,
            shaders: None,
        }
    }
}

/// A store is either a bare path or a table with its own retention.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(untagged)]
pub enum SymbolStoreEntry {
    Path(String),
    Detailed { path: String, expiration: Option<u64> },
}

impl SymbolStoreEntry {
    pub fn path(&self) -> &str {
        match self {
            Self::Path(path) | Self::Detailed { path, .. } => path,
        }
    }

    pub fn expiration(&self, default: u64) -> u64 {
        match self {
            Self::Detailed {
                expiration: Some(days),
                ..
            } => *days,
            _ => default,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RevisionResolverSettings {
    pub host: Option<String>,
    pub access_token: Option<String>,
    pub repo_owner: Option<String>,
    pub repo_name: Option<String>,
    pub branches: Vec<String>,
}

/// Deep-merge `overlay` into `base`: tables merge key by key, everything
/// else is replaced.
pub fn merge_tables(base: &mut toml::Table, overlay: toml::Table) {
    for (key, value) in overlay {
        match (base.get_mut(&key), value) {
            (Some(toml::Value::Table(existing)), toml::Value::Table(incoming)) => {
                merge_tables(existing, incoming);
            }
            (_, value) => {
                base.insert(key, value);
            }
        }
    }
}

/// Render a parameter value as the string bound to placeholders.
pub fn value_to_string(value: &toml::Value) -> String {
    match value {
        toml::Value::String(s) => s.clone(),
        toml::Value::Integer(i) => i.to_string(),
        toml::Value::Float(f) => f.to_string(),
        toml::Value::Boolean(b) => b.to_string(),
        toml::Value::Datetime(d) => d.to_string(),
        other => other.to_string(),
    }
}
