//! Manifest source
//!
//! The build system that assembles a directory of fragments into manifest
//! objects is an external collaborator behind the [`ManifestSource`] trait.
//! [`DirSource`] is the filesystem implementation the CLI uses: every
//! YAML/JSON document under the root that is not a substitution-definition
//! file, visited in lexicographic path order so discovery is deterministic
//! for a stable layout.

use anyhow::{Context, Result};
use regex::Regex;
use serde::Deserialize;
use serde_yaml_ng::Value;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;
use walkdir::WalkDir;

/// One structured workload document
///
/// Read-only input to the build; substitution produces a new tree.
#[derive(Debug, Clone)]
pub struct Manifest {
    doc: Value,
    path: Option<PathBuf>,
}

impl Manifest {
    pub fn new(doc: Value) -> Self {
        Self { doc, path: None }
    }

    pub fn with_path(doc: Value, path: PathBuf) -> Self {
        Self {
            doc,
            path: Some(path),
        }
    }

    pub fn doc(&self) -> &Value {
        &self.doc
    }

    /// Canonical byte form used for encryption probing
    pub fn as_json_bytes(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(&self.doc).context("serializing manifest to json")
    }

    pub fn as_yaml(&self) -> Result<String> {
        serde_yaml_ng::to_string(&self.doc).context("serializing manifest to yaml")
    }

    pub fn name(&self) -> Option<&str> {
        self.metadata_field("name")
    }

    pub fn namespace(&self) -> Option<&str> {
        self.metadata_field("namespace")
    }

    /// `namespace/name` for logs and diagnostics, falling back to the
    /// source path
    pub fn display_name(&self) -> String {
        match (self.namespace(), self.name()) {
            (Some(namespace), Some(name)) => format!("{}/{}", namespace, name),
            (None, Some(name)) => name.to_string(),
            _ => self
                .path
                .as_ref()
                .map(|p| p.display().to_string())
                .unwrap_or_else(|| "<unnamed>".to_string()),
        }
    }

    fn metadata_field(&self, field: &str) -> Option<&str> {
        self.doc.get("metadata")?.get(field)?.as_str()
    }
}

/// External manifest-assembly collaborator
pub trait ManifestSource: Send + Sync {
    /// Visit every file under the root, in deterministic order
    fn walk(&self, visitor: &mut dyn FnMut(&Path) -> Result<()>) -> Result<()>;

    /// Assemble the manifest objects for one build
    fn build(&self) -> Result<Vec<Manifest>>;
}

/// Filesystem-backed manifest source
pub struct DirSource {
    root: PathBuf,
    file_regex: Regex,
}

impl DirSource {
    pub fn new(root: PathBuf, file_regex: Regex) -> Self {
        Self { root, file_regex }
    }

    fn files(&self) -> Result<Vec<PathBuf>> {
        let mut files = Vec::new();
        for entry in WalkDir::new(&self.root) {
            let entry = entry.with_context(|| format!("walking {}", self.root.display()))?;
            if entry.file_type().is_file() {
                files.push(entry.into_path());
            }
        }
        files.sort();
        Ok(files)
    }
}

impl ManifestSource for DirSource {
    fn walk(&self, visitor: &mut dyn FnMut(&Path) -> Result<()>) -> Result<()> {
        for path in self.files()? {
            visitor(&path)?;
        }
        Ok(())
    }

    fn build(&self) -> Result<Vec<Manifest>> {
        let mut manifests = Vec::new();

        for path in self.files()? {
            let Some(extension) = path.extension().and_then(|e| e.to_str()) else {
                continue;
            };
            if !matches!(extension, "yaml" | "yml" | "json") {
                continue;
            }
            // Substitution-definition files are inputs, not manifests
            if self.file_regex.is_match(&path.display().to_string()) {
                continue;
            }

            let content = fs::read_to_string(&path)
                .with_context(|| format!("reading {}", path.display()))?;

            if extension == "json" {
                let json: serde_json::Value = serde_json::from_str(&content)
                    .with_context(|| format!("parsing {}", path.display()))?;
                let doc = serde_yaml_ng::to_value(json)
                    .with_context(|| format!("converting {}", path.display()))?;
                manifests.push(Manifest::with_path(doc, path));
                continue;
            }

            for document in serde_yaml_ng::Deserializer::from_str(&content) {
                let doc = Value::deserialize(document)
                    .with_context(|| format!("parsing {}", path.display()))?;
                if doc.is_null() {
                    continue;
                }
                manifests.push(Manifest::with_path(doc, path.clone()));
            }
        }

        debug!(
            "{} manifests assembled from {}",
            manifests.len(),
            self.root.display()
        );
        Ok(manifests)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use subr_core::config::DEFAULT_FILE_REGEX;
    use tempfile::TempDir;

    fn source_for(dir: &TempDir) -> DirSource {
        DirSource::new(
            dir.path().to_path_buf(),
            Regex::new(DEFAULT_FILE_REGEX).unwrap(),
        )
    }

    #[test]
    fn test_build_splits_multi_document_yaml() {
        let dir = TempDir::new().unwrap();
        fs::write(
            dir.path().join("all.yaml"),
            "kind: Service\nmetadata:\n  name: a\n---\nkind: Deployment\nmetadata:\n  name: b\n",
        )
        .unwrap();

        let manifests = source_for(&dir).build().unwrap();
        assert_eq!(manifests.len(), 2);
        assert_eq!(manifests[0].name(), Some("a"));
        assert_eq!(manifests[1].name(), Some("b"));
    }

    #[test]
    fn test_build_excludes_substitution_files() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("subst.yaml"), "host: a\n").unwrap();
        fs::write(
            dir.path().join("svc.yaml"),
            "kind: Service\nmetadata:\n  name: svc\n",
        )
        .unwrap();

        let manifests = source_for(&dir).build().unwrap();
        assert_eq!(manifests.len(), 1);
        assert_eq!(manifests[0].name(), Some("svc"));
    }

    #[test]
    fn test_build_reads_json() {
        let dir = TempDir::new().unwrap();
        fs::write(
            dir.path().join("cm.json"),
            r#"{"kind": "ConfigMap", "metadata": {"name": "cm", "namespace": "apps"}}"#,
        )
        .unwrap();

        let manifests = source_for(&dir).build().unwrap();
        assert_eq!(manifests.len(), 1);
        assert_eq!(manifests[0].display_name(), "apps/cm");
    }

    #[test]
    fn test_walk_is_lexicographic() {
        let dir = TempDir::new().unwrap();
        fs::create_dir(dir.path().join("b")).unwrap();
        fs::create_dir(dir.path().join("a")).unwrap();
        fs::write(dir.path().join("b").join("x.yaml"), "x: 1\n").unwrap();
        fs::write(dir.path().join("a").join("y.yaml"), "y: 1\n").unwrap();
        fs::write(dir.path().join("a").join("x.yaml"), "x: 1\n").unwrap();

        let mut visited = Vec::new();
        source_for(&dir)
            .walk(&mut |path| {
                visited.push(path.to_path_buf());
                Ok(())
            })
            .unwrap();

        let mut expected = visited.clone();
        expected.sort();
        assert_eq!(visited, expected);
        assert_eq!(visited.len(), 3);
    }

    #[test]
    fn test_malformed_yaml_is_an_error() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("bad.yaml"), "kind: [unclosed\n").unwrap();
        assert!(source_for(&dir).build().is_err());
    }
}
