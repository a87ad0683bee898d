//! Builder output contract.
//!
//! The container leaves `create.json`, `info.json` and `lock.json` in its
//! output directory; the agent extracts them into a [`BuildOutput`] and the
//! result manager interprets them. `info.json` is opaque to the core.

use std::collections::BTreeMap;
use std::sync::OnceLock;

use regex::Regex;
use serde::Deserialize;

/// Files extracted from the container's output tar, as UTF-8 text.
#[derive(Debug, Clone, Default)]
pub struct BuildOutput {
    pub create: Option<String>,
    pub info: Option<String>,
    pub lock: Option<String>,
}

impl BuildOutput {
    pub fn parse_create(&self) -> Option<serde_json::Result<CreateData>> {
        self.create.as_deref().map(serde_json::from_str)
    }

    pub fn parse_lock(&self) -> Option<serde_json::Result<LockData>> {
        self.lock.as_deref().map(serde_json::from_str)
    }
}

/// Trace of the conan install/create stage.
#[derive(Debug, Clone, Deserialize)]
pub struct CreateData {
    #[serde(default)]
    pub error: bool,
    #[serde(default)]
    pub installed: Vec<InstalledEntry>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct InstalledEntry {
    pub recipe: RecipeData,
    #[serde(default)]
    pub packages: Vec<PackageData>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RecipeData {
    /// Full reference, `name/version(@user/channel)?(#rev)?`.
    pub id: String,
    pub name: String,
    pub version: String,
    #[serde(default)]
    pub user: Option<String>,
    #[serde(default)]
    pub channel: Option<String>,
    /// False for the build's own recipe, true for everything pulled in.
    #[serde(default)]
    pub dependency: bool,
    #[serde(default)]
    pub error: Option<OutputError>,
}

impl RecipeData {
    pub fn is_missing(&self) -> bool {
        self.error.as_ref().is_some_and(OutputError::is_missing)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct PackageData {
    pub id: String,
    #[serde(default)]
    pub error: Option<OutputError>,
}

impl PackageData {
    pub fn is_missing(&self) -> bool {
        self.error.as_ref().is_some_and(OutputError::is_missing)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct OutputError {
    #[serde(rename = "type")]
    pub kind: String,
}

impl OutputError {
    pub fn is_missing(&self) -> bool {
        self.kind == "missing"
    }
}

/// The conan graph lock.
#[derive(Debug, Clone, Deserialize)]
pub struct LockData {
    pub graph_lock: GraphLock,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GraphLock {
    pub nodes: BTreeMap<String, LockNode>,
}

/// Node `"0"` is the root and carries the requirement edges; the other
/// nodes carry the resolved references.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct LockNode {
    #[serde(default)]
    pub requires: Vec<String>,
    #[serde(default)]
    pub build_requires: Vec<String>,
    #[serde(default)]
    pub r#ref: Option<String>,
    #[serde(default)]
    pub package_id: Option<String>,
}

impl GraphLock {
    /// Requirement node keys of the root, `requires` then `build_requires`.
    pub fn root_requirements(&self) -> Vec<&str> {
        let Some(root) = self.nodes.get("0") else {
            return Vec::new();
        };
        root.requires
            .iter()
            .chain(root.build_requires.iter())
            .map(String::as_str)
            .collect()
    }
}

/// A parsed `name/version(@user/channel)?(#rev)?` reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecipeRef {
    pub name: String,
    pub version: String,
    pub user: Option<String>,
    pub channel: Option<String>,
    /// Empty when the reference carries no revision.
    pub revision: String,
}

fn recipe_ref_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^([\w+.-]+)/([\w+.-]+)(?:@(\w+)/(\w+))?(?:#(\w+))?").expect("valid pattern")
    })
}

/// Parse a conan recipe reference; `None` for malformed input.
pub fn parse_recipe_ref(id: &str) -> Option<RecipeRef> {
    let captures = recipe_ref_pattern().captures(id)?;
    Some(RecipeRef {
        name: captures.get(1)?.as_str().to_string(),
        version: captures.get(2)?.as_str().to_string(),
        user: captures.get(3).map(|m| m.as_str().to_string()),
        channel: captures.get(4).map(|m| m.as_str().to_string()),
        revision: captures
            .get(5)
            .map(|m| m.as_str().to_string())
            .unwrap_or_default(),
    })
}

/// Extract only the revision of a reference; `None` for malformed input.
pub fn revision_from_recipe_id(id: &str) -> Option<String> {
    parse_recipe_ref(id).map(|reference| reference.revision)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_bare_reference() {
        let reference = parse_recipe_ref("zlib/1.3").unwrap();
        assert_eq!(reference.name, "zlib");
        assert_eq!(reference.version, "1.3");
        assert_eq!(reference.user, None);
        assert_eq!(reference.channel, None);
        assert_eq!(reference.revision, "");
    }

    #[test]
    fn parses_full_reference() {
        let reference = parse_recipe_ref("app/2.0.1@acme/stable#0123abc").unwrap();
        assert_eq!(reference.name, "app");
        assert_eq!(reference.version, "2.0.1");
        assert_eq!(reference.user.as_deref(), Some("acme"));
        assert_eq!(reference.channel.as_deref(), Some("stable"));
        assert_eq!(reference.revision, "0123abc");
    }

    #[test]
    fn parses_revision_without_user_channel() {
        let reference = parse_recipe_ref("lib/0.1#e4f").unwrap();
        assert_eq!(reference.user, None);
        assert_eq!(reference.revision, "e4f");
    }

    #[test]
    fn rejects_malformed_reference() {
        assert!(parse_recipe_ref("not a reference").is_none());
        assert_eq!(revision_from_recipe_id("???"), None);
    }

    #[test]
    fn create_data_deserializes() {
        let raw = r#"{
            "error": true,
            "installed": [
                {
                    "recipe": {
                        "id": "hello/1.0@acme/stable#ab12",
                        "name": "hello",
                        "version": "1.0",
                        "user": "acme",
                        "channel": "stable",
                        "dependency": false,
                        "error": null
                    },
                    "packages": [{"id": "pkg1", "error": null}]
                },
                {
                    "recipe": {
                        "id": "zlib/1.3",
                        "name": "zlib",
                        "version": "1.3",
                        "dependency": true,
                        "error": {"type": "missing"}
                    },
                    "packages": []
                }
            ]
        }"#;
        let create: CreateData = serde_json::from_str(raw).unwrap();
        assert!(create.error);
        assert_eq!(create.installed.len(), 2);
        assert!(!create.installed[0].recipe.dependency);
        assert!(!create.installed[0].recipe.is_missing());
        assert!(create.installed[1].recipe.is_missing());
    }

    #[test]
    fn lock_root_requirements_combine_requires_and_build_requires() {
        let raw = r#"{
            "graph_lock": {
                "nodes": {
                    "0": {"requires": ["1"], "build_requires": ["2"]},
                    "1": {"ref": "zlib/1.3#aa", "package_id": "p1"},
                    "2": {"ref": "cmake/3.27", "package_id": "p2"}
                }
            }
        }"#;
        let lock: LockData = serde_json::from_str(raw).unwrap();
        assert_eq!(lock.graph_lock.root_requirements(), vec!["1", "2"]);
        assert_eq!(
            lock.graph_lock.nodes["1"].r#ref.as_deref(),
            Some("zlib/1.3#aa")
        );
    }
}
