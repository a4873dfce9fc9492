//! Fileset engine: composable `(source, destination)` enumeration.
//!
//! A [`FileMapper`] is a tree of nodes. Each node transforms the pair it
//! receives into zero or more pairs, sorts them by destination (source as
//! tiebreak) and feeds them to its children in insertion order. Leaves
//! report every pair that has a source.
//!
//! Trees are built in code or loaded from declarative files with
//! [`NodeRef::load_set`] (see [`definition`]).
//!
//! ```rust,ignore
//! let mut mapper = FileMapper::from_run(&run);
//! mapper.root()
//!     .src("{uproject_dir}/Binaries/{unreal_platform}")?
//!     .to("{uproject}/Binaries/{unreal_platform}")?
//!     .glob(&["*.exe", "*.dll"])?
//!     .files();
//! for (src, dst) in mapper.to_list(".", ".")? { /* ... */ }
//! ```

pub mod definition;
mod glob;
pub mod stash;

use anyhow::{bail, Result};
use globset::{GlobBuilder, GlobMatcher};
use regex::Regex;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::fs;
use std::path::Path;
use std::sync::Arc;

use crate::config::{RunDescriptor, Variables};
use crate::error::NimpError;
use crate::fsutil::{join, standardize_path};

pub use glob::expand as expand_glob;

/// A pair flowing through the tree.
pub type Pair = (Option<String>, Option<String>);

/// Handle to a node inside a [`FileMapper`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeId(usize);

#[derive(Debug)]
enum Op {
    Identity,
    Src(String),
    To(String),
    Glob(Vec<String>),
    Recursive,
    Files,
    Exclude(Vec<GlobMatcher>),
    Replace(Regex, String),
    Upper,
    Once,
    Newer,
}

#[derive(Debug)]
struct Node {
    op: Op,
    vars: Arc<Variables>,
    children: Vec<NodeId>,
}

/// Arena of fileset nodes; node 0 is the root.
#[derive(Debug)]
pub struct FileMapper {
    nodes: Vec<Node>,
}

impl FileMapper {
    pub fn new(vars: Variables) -> Self {
        Self {
            nodes: vec![Node {
                op: Op::Identity,
                vars: Arc::new(vars),
                children: Vec::new(),
            }],
        }
    }

    pub fn from_run(run: &RunDescriptor) -> Self {
        Self::new(run.vars().clone())
    }

    /// Root mapper with the named fileset attached, bound to `run` plus
    /// `overlay`.
    pub fn load(run: &RunDescriptor, name: &str, overlay: &BTreeMap<String, String>) -> Result<Self> {
        let vars = if overlay.is_empty() {
            run.vars().clone()
        } else {
            run.vars().overlay(overlay.iter())
        };
        let mut mapper = Self::new(vars);
        mapper.root().load_set(name)?;
        Ok(mapper)
    }

    pub fn root(&mut self) -> NodeRef<'_> {
        NodeRef {
            mapper: self,
            id: NodeId(0),
        }
    }

    pub fn node(&mut self, id: NodeId) -> NodeRef<'_> {
        NodeRef { mapper: self, id }
    }

    fn append(&mut self, parent: NodeId, op: Op, vars: Option<Arc<Variables>>) -> NodeId {
        let vars = vars.unwrap_or_else(|| Arc::clone(&self.nodes[parent.0].vars));
        let id = NodeId(self.nodes.len());
        self.nodes.push(Node {
            op,
            vars,
            children: Vec::new(),
        });
        self.nodes[parent.0].children.push(id);
        id
    }

    /// Terminal nodes under `id`, depth-first.
    pub fn leaves(&self, id: NodeId) -> Vec<NodeId> {
        let node = &self.nodes[id.0];
        if node.children.is_empty() {
            return vec![id];
        }
        node.children.iter().flat_map(|child| self.leaves(*child)).collect()
    }

    /// Stream every pair produced from `(src, dst)` to `visitor`.
    pub fn visit<F>(&self, src: Option<&str>, dst: Option<&str>, mut visitor: F) -> Result<()>
    where
        F: FnMut(&str, Option<&str>) -> Result<()>,
    {
        let mut state = EvalState::default();
        self.eval(
            NodeId(0),
            (src.map(str::to_string), dst.map(str::to_string)),
            &mut state,
            &mut visitor,
        )
    }

    /// Every pair produced from `(src, dst)`, in visit order.
    pub fn collect(&self, src: Option<&str>, dst: Option<&str>) -> Result<Vec<(String, Option<String>)>> {
        let mut out = Vec::new();
        self.visit(src, dst, |s, d| {
            out.push((s.to_string(), d.map(str::to_string)));
            Ok(())
        })?;
        Ok(out)
    }

    /// Normalized, deduplicated and sorted pairs. Empty when nothing but
    /// the starting pair came out.
    pub fn to_list(&self, src: &str, dst: &str) -> Result<Vec<(String, String)>> {
        let default = (standardize_path(src), standardize_path(dst));
        let mut all = BTreeSet::new();
        self.visit(Some(src), Some(dst), |s, d| {
            all.insert((standardize_path(s), standardize_path(d.unwrap_or_default())));
            Ok(())
        })?;
        let all: Vec<(String, String)> = all.into_iter().collect();
        if all.len() == 1 && all[0] == default {
            return Ok(Vec::new());
        }
        Ok(all)
    }

    fn eval(
        &self,
        id: NodeId,
        input: Pair,
        state: &mut EvalState,
        visitor: &mut dyn FnMut(&str, Option<&str>) -> Result<()>,
    ) -> Result<()> {
        let node = &self.nodes[id.0];
        let mut results = apply(id, node, input, state)?;
        results.sort_by(|a, b| {
            let key = |p: &Pair| p.1.clone().or_else(|| p.0.clone()).unwrap_or_default();
            key(a).cmp(&key(b)).then_with(|| a.0.cmp(&b.0))
        });

        for result in results {
            if node.children.is_empty() {
                if let Some(src) = &result.0 {
                    visitor(src, result.1.as_deref())?;
                }
                continue;
            }
            for child in &node.children {
                self.eval(*child, result.clone(), state, visitor)?;
            }
        }
        Ok(())
    }
}

/// Per-evaluation state, so that enumerating twice gives the same result.
#[derive(Default)]
struct EvalState {
    seen: HashMap<NodeId, HashSet<String>>,
}

fn apply(id: NodeId, node: &Node, (src, dst): Pair, state: &mut EvalState) -> Result<Vec<Pair>> {
    Ok(match &node.op {
        Op::Identity => vec![(src, dst)],
        Op::Src(from) => {
            let joined = match src {
                None => from.clone(),
                Some(src) => join(&src, from),
            };
            vec![(Some(standardize_path(&joined)), dst)]
        }
        Op::To(to) => {
            let joined = match dst {
                None => to.clone(),
                Some(dst) => join(&dst, to),
            };
            vec![(src, Some(standardize_path(&joined)))]
        }
        Op::Glob(patterns) => glob_pairs(src.as_deref(), dst.as_deref(), patterns)?,
        Op::Recursive => {
            let Some(src) = src else {
                bail!("recursive() called on empty fileset");
            };
            let mut out = Vec::new();
            recurse(&src, dst, &mut out)?;
            out
        }
        Op::Files => match &src {
            Some(path) if Path::new(path).is_file() => vec![(src, dst)],
            _ => Vec::new(),
        },
        Op::Exclude(matchers) => match &src {
            Some(path) if matchers.iter().any(|m| m.is_match(path)) => {
                tracing::debug!("Excluding file {}", path);
                Vec::new()
            }
            _ => vec![(src, dst)],
        },
        Op::Replace(pattern, with) => {
            let Some(dst) = dst else {
                bail!("replace() called with dest = None");
            };
            vec![(src, Some(pattern.replace_all(&dst, with.as_str()).into_owned()))]
        }
        Op::Upper => {
            let Some(dst) = dst else {
                bail!("upper() called with dest = None");
            };
            vec![(src, Some(dst.to_uppercase()))]
        }
        Op::Once => {
            let Some(path) = &src else {
                bail!("once() called on empty fileset");
            };
            if state.seen.entry(id).or_default().insert(path.clone()) {
                vec![(src, dst)]
            } else {
                Vec::new()
            }
        }
        Op::Newer => {
            let (Some(s), Some(d)) = (&src, &dst) else {
                bail!("newer() called on empty fileset");
            };
            if is_newer(Path::new(s), Path::new(d)) {
                vec![(src, dst)]
            } else {
                Vec::new()
            }
        }
    })
}

fn glob_pairs(src: Option<&str>, dst: Option<&str>, patterns: &[String]) -> Result<Vec<Pair>> {
    let src = src.map(standardize_path);
    let skip = match src.as_deref() {
        None | Some(".") => 0,
        Some(path) => path.split('/').filter(|c| !c.is_empty()).count() + usize::from(path.starts_with('/')),
    };

    let mut out = Vec::new();
    for pattern in patterns {
        let glob_path = match &src {
            None => pattern.clone(),
            Some(src) => join(src, pattern),
        };
        let matches = glob::expand(&glob_path)?;
        if matches.is_empty() {
            tracing::info!(
                "No match for \"{}\" in \"{}\"",
                pattern,
                src.as_deref().unwrap_or("None")
            );
        }
        for found in matches {
            let new_dst = dst.map(|dst| {
                let relative = split_components(&found).into_iter().skip(skip).collect::<Vec<_>>().join("/");
                standardize_path(&join(dst, &relative))
            });
            out.push((Some(found), new_dst));
        }
    }
    Ok(out)
}

/// Components the way the source prefix is counted: a leading `/` is one.
fn split_components(path: &str) -> Vec<&str> {
    let mut parts = Vec::new();
    if path.starts_with('/') {
        parts.push("/");
    }
    parts.extend(path.split('/').filter(|c| !c.is_empty()));
    parts
}

fn recurse(src: &str, dst: Option<String>, out: &mut Vec<Pair>) -> Result<()> {
    out.push((Some(src.to_string()), dst.clone()));
    let path = Path::new(src);
    if !path.is_dir() {
        return Ok(());
    }
    let mut names: Vec<String> = fs::read_dir(path)?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.file_name().to_string_lossy().into_owned())
        .collect();
    names.sort();
    for name in names {
        let child_src = standardize_path(&join(src, &name));
        let child_dst = match &dst {
            Some(dst) => standardize_path(&join(dst, &name)),
            None => name.clone(),
        };
        recurse(&child_src, Some(child_dst), out)?;
    }
    Ok(())
}

fn is_newer(src: &Path, dst: &Path) -> bool {
    if !dst.exists() {
        return true;
    }
    let modified = |p: &Path| fs::metadata(p).and_then(|m| m.modified()).ok();
    match (modified(src), modified(dst)) {
        (Some(s), Some(d)) => s > d,
        _ => true,
    }
}

/// `fnmatch` semantics: `*` crosses `/`.
fn fnmatch(pattern: &str, ignore_case: bool) -> Result<GlobMatcher> {
    let glob = GlobBuilder::new(pattern)
        .literal_separator(false)
        .backslash_escape(false)
        .case_insensitive(ignore_case)
        .build()
        .map_err(|e| NimpError::config(format!("Invalid pattern \"{}\": {}", pattern, e)))?;
    Ok(glob.compile_matcher())
}

/// Python-style `\1` group references become `${1}`.
fn convert_replacement(repl: &str) -> String {
    let mut out = String::with_capacity(repl.len());
    let mut chars = repl.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '\\' if chars.peek().is_some_and(|n| n.is_ascii_digit()) => {
                let mut group = String::new();
                while let Some(d) = chars.peek().filter(|d| d.is_ascii_digit()) {
                    group.push(*d);
                    chars.next();
                }
                out.push_str(&format!("${{{}}}", group));
            }
            '$' => out.push_str("$$"),
            other => out.push(other),
        }
    }
    out
}

/// Builder handle: every operation appends a child to this node and
/// returns a handle to it.
pub struct NodeRef<'a> {
    mapper: &'a mut FileMapper,
    id: NodeId,
}

impl<'a> NodeRef<'a> {
    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn vars(&self) -> &Variables {
        &self.mapper.nodes[self.id.0].vars
    }

    fn format(&self, template: &str) -> Result<String> {
        crate::config::format_template(template, self.vars())
    }

    fn push(self, op: Op) -> NodeRef<'a> {
        let id = self.mapper.append(self.id, op, None);
        NodeRef {
            mapper: self.mapper,
            id,
        }
    }

    pub fn src(self, path: &str) -> Result<NodeRef<'a>> {
        let path = self.format(path)?;
        Ok(self.push(Op::Src(path)))
    }

    pub fn to(self, path: &str) -> Result<NodeRef<'a>> {
        let path = self.format(path)?;
        Ok(self.push(Op::To(path)))
    }

    pub fn glob<S: AsRef<str>>(self, patterns: &[S]) -> Result<NodeRef<'a>> {
        let patterns = patterns
            .iter()
            .map(|p| self.format(p.as_ref()))
            .collect::<Result<Vec<_>>>()?;
        Ok(self.push(Op::Glob(patterns)))
    }

    pub fn recursive(self) -> NodeRef<'a> {
        self.push(Op::Recursive)
    }

    pub fn files(self) -> NodeRef<'a> {
        self.push(Op::Files)
    }

    pub fn exclude<S: AsRef<str>>(self, patterns: &[S]) -> Result<NodeRef<'a>> {
        self.exclude_with(patterns, false)
    }

    pub fn exclude_ignore_case<S: AsRef<str>>(self, patterns: &[S]) -> Result<NodeRef<'a>> {
        self.exclude_with(patterns, true)
    }

    fn exclude_with<S: AsRef<str>>(self, patterns: &[S], ignore_case: bool) -> Result<NodeRef<'a>> {
        let matchers = patterns
            .iter()
            .map(|p| fnmatch(&self.format(p.as_ref())?, ignore_case))
            .collect::<Result<Vec<_>>>()?;
        Ok(self.push(Op::Exclude(matchers)))
    }

    pub fn replace(self, pattern: &str, with: &str) -> Result<NodeRef<'a>> {
        let pattern = Regex::new(&self.format(pattern)?).map_err(NimpError::from)?;
        let with = convert_replacement(&self.format(with)?);
        Ok(self.push(Op::Replace(pattern, with)))
    }

    pub fn upper(self) -> NodeRef<'a> {
        self.push(Op::Upper)
    }

    pub fn once(self) -> NodeRef<'a> {
        self.push(Op::Once)
    }

    pub fn newer(self) -> NodeRef<'a> {
        self.push(Op::Newer)
    }

    /// Rebind variables for everything below the returned node.
    pub fn override_vars(self, overlay: &BTreeMap<String, String>) -> NodeRef<'a> {
        let vars = Arc::new(self.vars().overlay(overlay.iter()));
        let id = self.mapper.append(self.id, Op::Identity, Some(vars));
        NodeRef {
            mapper: self.mapper,
            id,
        }
    }

    /// Attach the rules of the named fileset below this node and return
    /// the resulting leaves.
    pub fn load_set(self, name: &str) -> Result<Vec<NodeId>> {
        let name = self.format(name)?;
        let set = definition::FilesetDefinition::find_and_load(&name, self.vars())?;
        let id = self.id;
        set.attach(self.mapper, id)?;
        Ok(self.mapper.leaves(id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn tree() -> TempDir {
        let dir = TempDir::new().unwrap();
        let root = dir.path();
        fs::create_dir_all(root.join("foo/bar")).unwrap();
        fs::write(root.join("qux.ext1"), b"q").unwrap();
        fs::write(root.join("foo/quux.ext1"), b"q").unwrap();
        fs::write(root.join("foo/bar/corge.ext1"), b"c").unwrap();
        fs::write(root.join("foo/bar/corge.ext2"), b"c").unwrap();
        dir
    }

    fn base(dir: &TempDir) -> String {
        standardize_path(&dir.path().to_string_lossy())
    }

    fn mapper(vars: &[(&str, &str)]) -> FileMapper {
        let mut bag = Variables::default();
        for (k, v) in vars {
            bag.set(*k, *v);
        }
        FileMapper::new(bag)
    }

    fn relative(dir: &TempDir, pairs: Vec<(String, Option<String>)>) -> Vec<(String, String)> {
        let prefix = format!("{}/", base(dir));
        pairs
            .into_iter()
            .map(|(s, d)| (s.trim_start_matches(&prefix).to_string(), d.unwrap_or_default()))
            .collect()
    }

    #[test]
    fn test_glob_with_placeholder() {
        let dir = tree();
        let mut files = mapper(&[("qux", "qux.ext1")]);
        files.root().src(&base(&dir)).unwrap().to(".").unwrap().glob(&["{qux}"]).unwrap();
        assert_eq!(
            relative(&dir, files.collect(None, None).unwrap()),
            vec![("qux.ext1".to_string(), "qux.ext1".to_string())]
        );
    }

    #[test]
    fn test_to_translates_destination() {
        let dir = tree();
        let mut files = mapper(&[("dir", "dest")]);
        files.root().src(&base(&dir)).unwrap().to("{dir}").unwrap().glob(&["qux.ext1"]).unwrap();
        assert_eq!(
            relative(&dir, files.collect(None, None).unwrap()),
            vec![("qux.ext1".to_string(), "dest/qux.ext1".to_string())]
        );
    }

    #[test]
    fn test_exclude_and_ignore_case() {
        let dir = tree();
        let mut files = mapper(&[]);
        files
            .root()
            .src(&base(&dir))
            .unwrap()
            .to(".")
            .unwrap()
            .glob(&["foo/bar/corge.ext1", "foo/bar/corge.ext2"])
            .unwrap()
            .exclude_ignore_case(&["*rGE.ext2"])
            .unwrap();
        assert_eq!(
            relative(&dir, files.collect(None, None).unwrap()),
            vec![("foo/bar/corge.ext1".to_string(), "foo/bar/corge.ext1".to_string())]
        );
    }

    #[test]
    fn test_files_drops_directories() {
        let dir = tree();
        let mut files = mapper(&[]);
        files.root().src(&base(&dir)).unwrap().to(".").unwrap().glob(&["foo", "qux.ext1"]).unwrap().files();
        assert_eq!(
            relative(&dir, files.collect(None, None).unwrap()),
            vec![("qux.ext1".to_string(), "qux.ext1".to_string())]
        );
    }

    #[test]
    fn test_recursive_glob_sorted_by_destination() {
        let dir = tree();
        let mut files = mapper(&[]);
        files.root().src(&base(&dir)).unwrap().to(".").unwrap().glob(&["**/*"]).unwrap();
        let dsts: Vec<String> = relative(&dir, files.collect(None, None).unwrap())
            .into_iter()
            .map(|(_, d)| d)
            .collect();
        assert_eq!(
            dsts,
            vec![
                "foo",
                "foo/bar",
                "foo/bar/corge.ext1",
                "foo/bar/corge.ext2",
                "foo/quux.ext1",
                "qux.ext1"
            ]
        );
    }

    #[test]
    fn test_recursive_walks_children() {
        let dir = tree();
        let mut files = mapper(&[]);
        files.root().src(&base(&dir)).unwrap().to("out").unwrap().glob(&["foo"]).unwrap().recursive().files();
        let pairs = relative(&dir, files.collect(None, None).unwrap());
        assert_eq!(
            pairs,
            vec![
                ("foo/bar/corge.ext1".to_string(), "out/foo/bar/corge.ext1".to_string()),
                ("foo/bar/corge.ext2".to_string(), "out/foo/bar/corge.ext2".to_string()),
                ("foo/quux.ext1".to_string(), "out/foo/quux.ext1".to_string()),
            ]
        );
    }

    #[test]
    fn test_replace_and_upper() {
        let dir = tree();
        let mut files = mapper(&[]);
        files
            .root()
            .src(&base(&dir))
            .unwrap()
            .to(".")
            .unwrap()
            .glob(&["qux.ext1"])
            .unwrap()
            .replace(r"(\w+)\.ext1", r"\1.renamed")
            .unwrap()
            .upper();
        assert_eq!(
            relative(&dir, files.collect(None, None).unwrap()),
            vec![("qux.ext1".to_string(), "QUX.RENAMED".to_string())]
        );
    }

    #[test]
    fn test_once_deduplicates_per_enumeration() {
        let dir = tree();
        let mut files = mapper(&[]);
        files.root().src(&base(&dir)).unwrap().to(".").unwrap().glob(&["qux.ext1", "*.ext1"]).unwrap().once();
        let first = files.collect(None, None).unwrap();
        let second = files.collect(None, None).unwrap();
        assert_eq!(first.len(), 1);
        assert_eq!(first, second);
    }

    #[test]
    fn test_newer_skips_up_to_date() {
        let dir = tree();
        let out = TempDir::new().unwrap();
        fs::copy(dir.path().join("qux.ext1"), out.path().join("qux.ext1")).unwrap();
        let mut files = mapper(&[]);
        files
            .root()
            .src(&base(&dir))
            .unwrap()
            .to(&standardize_path(&out.path().to_string_lossy()))
            .unwrap()
            .glob(&["*.ext1"])
            .unwrap()
            .newer();
        assert!(files.collect(None, None).unwrap().is_empty());
    }

    #[test]
    fn test_override_rebinds_subtree() {
        let dir = tree();
        let mut files = mapper(&[("platform", "win64"), ("name", "qux")]);
        let overlay: BTreeMap<String, String> = [("name".to_string(), "foo".to_string())].into();
        let root = files.root().src(&base(&dir)).unwrap().to(".").unwrap();
        root.override_vars(&overlay).glob(&["{name}"]).unwrap();
        assert_eq!(
            relative(&dir, files.collect(None, None).unwrap()),
            vec![("foo".to_string(), "foo".to_string())]
        );
    }

    #[test]
    fn test_enumeration_is_deterministic() {
        let dir = tree();
        let mut files = mapper(&[]);
        files.root().src(&base(&dir)).unwrap().to(".").unwrap().glob(&["**"]).unwrap();
        assert_eq!(files.collect(None, None).unwrap(), files.collect(None, None).unwrap());
    }

    #[test]
    fn test_to_list_empty_when_only_default() {
        let files = mapper(&[]);
        assert!(files.to_list(".", ".").unwrap().is_empty());
    }

    #[test]
    fn test_to_list_standardizes_and_dedups() {
        let dir = tree();
        let mut files = mapper(&[]);
        {
            let root = files.root().to(".").unwrap();
            root.glob(&["qux.ext1", "./qux.ext1"]).unwrap();
        }
        let list = files.to_list(&base(&dir), ".").unwrap();
        assert_eq!(list.len(), 1);
        assert!(list[0].0.ends_with("/qux.ext1"));
        assert_eq!(list[0].1, "qux.ext1");
    }

    #[test]
    fn test_unknown_placeholder_fails_at_build() {
        let mut files = mapper(&[]);
        assert!(files.root().src("{nope}").is_err());
    }

    #[test]
    fn test_convert_replacement() {
        assert_eq!(convert_replacement(r"\1-x"), "${1}-x");
        assert_eq!(convert_replacement("$HOME"), "$$HOME");
    }
}
