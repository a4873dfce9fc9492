//! Declarative fileset files.
//!
//! A fileset named `foo` lives in `.nimp/filesets/foo.toml` under the root
//! directory or the project directory. Each `[[rule]]` is a chain of steps
//! attached to the node `load_set` was called on:
//!
//! ```toml
//! [[rule]]
//! when = "is_win64"
//! steps = [
//!   { src = "{uproject_dir}/Binaries/{unreal_platform}" },
//!   { to = "{uproject}/Binaries/{unreal_platform}" },
//!   { glob = ["*.exe", "*.dll"] },
//!   "files",
//! ]
//! ```

use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use super::{FileMapper, NodeId};
use crate::config::Variables;
use crate::error::NimpError;

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum OneOrMany {
    One(String),
    Many(Vec<String>),
}

impl OneOrMany {
    pub fn as_slice(&self) -> &[String] {
        match self {
            OneOrMany::One(one) => std::slice::from_ref(one),
            OneOrMany::Many(many) => many,
        }
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum Step {
    Src(String),
    To(String),
    Glob(OneOrMany),
    Recursive,
    Files,
    Exclude(OneOrMany),
    ExcludeIgnoreCase(OneOrMany),
    Replace { pattern: String, with: String },
    Upper,
    Once,
    Newer,
    Override(BTreeMap<String, String>),
    LoadSet(String),
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct Rule {
    #[serde(default)]
    pub when: Option<String>,
    #[serde(default)]
    pub unless: Option<String>,
    pub steps: Vec<Step>,
}

impl Rule {
    fn applies(&self, vars: &Variables) -> bool {
        self.when.as_deref().map_or(true, |key| vars.is_true(key))
            && !self.unless.as_deref().is_some_and(|key| vars.is_true(key))
    }
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct FilesetDefinition {
    #[serde(default, rename = "rule")]
    pub rules: Vec<Rule>,
}

impl FilesetDefinition {
    pub fn parse(content: &str) -> Result<Self> {
        Ok(toml::from_str(content).map_err(NimpError::from)?)
    }

    /// Candidate files for `name`, in lookup order.
    pub fn candidates(name: &str, vars: &Variables) -> Vec<PathBuf> {
        ["root_dir", "uproject_dir"]
            .iter()
            .filter_map(|key| vars.get(key))
            .filter(|dir| !dir.is_empty())
            .map(|dir| Path::new(dir).join(".nimp").join("filesets").join(format!("{}.toml", name)))
            .collect()
    }

    pub fn find_and_load(name: &str, vars: &Variables) -> Result<Self> {
        let candidates = Self::candidates(name, vars);
        let Some(path) = candidates.iter().find(|p| p.is_file()) else {
            return Err(NimpError::NotFound(format!("fileset \"{}\"", name)).into());
        };
        tracing::debug!("Loading fileset {} from {}", name, path.display());
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        Self::parse(&content).with_context(|| format!("Invalid fileset {}", path.display()))
    }

    /// Build every applicable rule as a chain under `parent`.
    pub fn attach(&self, mapper: &mut FileMapper, parent: NodeId) -> Result<()> {
        for rule in &self.rules {
            if !rule.applies(mapper.node(parent).vars()) {
                continue;
            }
            let mut current = parent;
            for step in &rule.steps {
                let node = mapper.node(current);
                current = match step {
                    Step::Src(path) => node.src(path)?.id(),
                    Step::To(path) => node.to(path)?.id(),
                    Step::Glob(patterns) => node.glob(patterns.as_slice())?.id(),
                    Step::Recursive => node.recursive().id(),
                    Step::Files => node.files().id(),
                    Step::Exclude(patterns) => node.exclude(patterns.as_slice())?.id(),
                    Step::ExcludeIgnoreCase(patterns) => node.exclude_ignore_case(patterns.as_slice())?.id(),
                    Step::Replace { pattern, with } => node.replace(pattern, with)?.id(),
                    Step::Upper => node.upper().id(),
                    Step::Once => node.once().id(),
                    Step::Newer => node.newer().id(),
                    Step::Override(overlay) => node.override_vars(overlay).id(),
                    Step::LoadSet(name) => {
                        node.load_set(name)?;
                        current
                    }
                };
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fsutil::standardize_path;
    use tempfile::TempDir;

    const BINARIES: &str = r#"
[[rule]]
when = "is_win64"
steps = [
  { src = "{root_dir}/Binaries" },
  { to = "Game/Binaries" },
  { glob = ["*.exe", "*.dll"] },
  { exclude = "*-Debug.*" },
  "files",
]

[[rule]]
unless = "is_win64"
steps = [{ src = "{root_dir}/Binaries" }, { glob = "*.so" }]
"#;

    fn vars(root: &Path, platform: &str) -> Variables {
        let mut vars = Variables::default();
        vars.set("root_dir", standardize_path(&root.to_string_lossy()));
        vars.set("platform", platform);
        vars.derive();
        vars
    }

    fn setup() -> TempDir {
        let dir = TempDir::new().unwrap();
        let root = dir.path();
        fs::create_dir_all(root.join(".nimp/filesets")).unwrap();
        fs::create_dir_all(root.join("Binaries")).unwrap();
        fs::write(root.join(".nimp/filesets/binaries.toml"), BINARIES).unwrap();
        for name in ["Game.exe", "Game-Debug.exe", "Core.dll", "libcore.so"] {
            fs::write(root.join("Binaries").join(name), b"bin").unwrap();
        }
        dir
    }

    #[test]
    fn test_parse_steps() {
        let def = FilesetDefinition::parse(BINARIES).unwrap();
        assert_eq!(def.rules.len(), 2);
        assert_eq!(def.rules[0].steps[4], Step::Files);
        assert_eq!(def.rules[1].steps[1], Step::Glob(OneOrMany::One("*.so".into())));
    }

    #[test]
    fn test_parse_rejects_unknown_step() {
        assert!(FilesetDefinition::parse("[[rule]]\nsteps = [\"explode\"]\n").is_err());
    }

    #[test]
    fn test_load_set_applies_rules_for_platform() {
        let dir = setup();
        let mut mapper = FileMapper::new(vars(dir.path(), "win64"));
        let leaves = mapper.root().load_set("binaries").unwrap();
        assert_eq!(leaves.len(), 1);

        let dsts: Vec<String> = mapper
            .collect(None, None)
            .unwrap()
            .into_iter()
            .map(|(_, d)| d.unwrap())
            .collect();
        assert_eq!(dsts, vec!["Game/Binaries/Core.dll", "Game/Binaries/Game.exe"]);
    }

    #[test]
    fn test_unless_rule() {
        let dir = setup();
        let mut mapper = FileMapper::new(vars(dir.path(), "linux"));
        mapper.root().load_set("binaries").unwrap();
        let found = mapper.collect(None, None).unwrap();
        assert_eq!(found.len(), 1);
        assert!(found[0].0.ends_with("Binaries/libcore.so"));
    }

    #[test]
    fn test_missing_fileset() {
        let dir = TempDir::new().unwrap();
        let mut mapper = FileMapper::new(vars(dir.path(), "win64"));
        assert!(mapper.root().load_set("nothing").is_err());
    }

    #[test]
    fn test_nested_load_set_and_override() {
        let dir = setup();
        fs::write(
            dir.path().join(".nimp/filesets/outer.toml"),
            "[[rule]]\nsteps = [{ override = { platform = \"win64\" } }, { load_set = \"binaries\" }]\n",
        )
        .unwrap();
        let mut mapper = FileMapper::new(vars(dir.path(), "linux"));
        mapper.root().load_set("outer").unwrap();
        assert_eq!(mapper.collect(None, None).unwrap().len(), 2);
    }
}
