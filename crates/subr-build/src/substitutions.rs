//! Substitution set discovery and resolution
//!
//! Walks the manifest source for definition files, merges them in walk
//! order (later files override earlier ones per top-level key), then
//! evaluates the merged set against itself and the exposed environment
//! until a fixpoint is reached. Definition files may themselves be
//! encrypted; they are decrypted through the registry during discovery.

use crate::eval::{self, Scope};
use crate::source::ManifestSource;
use anyhow::{bail, Context, Result};
use regex::Regex;
use serde_yaml_ng::{Mapping, Value};
use std::collections::HashMap;
use std::fs;
use std::path::Path;
use subr_core::{Diagnostics, Stage};
use subr_decrypt::{decrypt_if_encrypted, Decryptor};
use tracing::debug;

/// Bound on self-referential evaluation passes; cross-references between
/// definition files rarely need more than two
const MAX_PASSES: usize = 8;

pub struct SubstitutionsConfig {
    pub file_regex: Regex,
    pub env_regex: Regex,
}

pub struct Substitutions {
    config: SubstitutionsConfig,
    /// Merged and, after [`Substitutions::resolve`], fully evaluated set
    pub values: Mapping,
    environment: HashMap<String, String>,
}

impl Substitutions {
    pub fn new(config: SubstitutionsConfig) -> Self {
        Self {
            config,
            values: Mapping::new(),
            environment: HashMap::new(),
        }
    }

    /// Walk the source and merge every substitution-definition file
    pub fn discover(
        &mut self,
        source: &dyn ManifestSource,
        registry: &[Box<dyn Decryptor>],
        diagnostics: &Diagnostics,
    ) -> Result<()> {
        source.walk(&mut |path| self.ingest(path, registry, diagnostics))
    }

    fn ingest(
        &mut self,
        path: &Path,
        registry: &[Box<dyn Decryptor>],
        diagnostics: &Diagnostics,
    ) -> Result<()> {
        let display_path = path.display().to_string();
        if !self.config.file_regex.is_match(&display_path) {
            return Ok(());
        }
        debug!("substitution file {}", display_path);

        let raw = fs::read(path).with_context(|| format!("reading {}", display_path))?;
        let content = match decrypt_if_encrypted(registry, &raw, diagnostics, &display_path)? {
            Some(plain) => plain,
            None => raw,
        };

        let value: Value = serde_yaml_ng::from_slice(&content)
            .with_context(|| format!("parsing {}", display_path))?;
        let Value::Mapping(mapping) = value else {
            diagnostics.record(Stage::Parse, &display_path, "substitution file is not a mapping");
            return Ok(());
        };

        // Later files override earlier ones per top-level key
        for (key, child) in mapping {
            self.values.insert(key, child);
        }
        Ok(())
    }

    /// Evaluate the set against itself and the exposed environment until a
    /// fixpoint is reached, then adopt one final authoritative pass
    pub fn resolve(&mut self, environment: &HashMap<String, String>) -> Result<()> {
        self.environment = expose_environment(&self.config.env_regex, environment);

        for _ in 0..MAX_PASSES {
            let next = self.evaluate_once()?;
            if next == self.values {
                break;
            }
            self.values = next;
        }
        self.values = self.evaluate_once()?;
        Ok(())
    }

    fn evaluate_once(&self) -> Result<Mapping> {
        let scope = Scope::new(&self.values, &self.environment);
        match eval::evaluate(&Value::Mapping(self.values.clone()), &scope)? {
            Value::Mapping(mapping) => Ok(mapping),
            _ => bail!("substitution set is no longer a mapping"),
        }
    }

    /// Apply the resolved set to one manifest tree, producing a new tree
    pub fn apply(&self, doc: &Value) -> Result<Value> {
        let scope = Scope::new(&self.values, &self.environment);
        eval::evaluate(doc, &scope)
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// Restrict the process environment to names matching the exposure pattern
///
/// Matching variables are exposed under their full name and, when the
/// pattern has a literal prefix, under the prefix-stripped name as well:
/// with `^ARGOCD_ENV_.*$`, `ARGOCD_ENV_REGION` is visible as `REGION`.
/// Everything else is invisible to expression evaluation.
fn expose_environment(
    pattern: &Regex,
    environment: &HashMap<String, String>,
) -> HashMap<String, String> {
    let prefix = literal_prefix(pattern.as_str());
    let mut exposed = HashMap::new();

    for (name, value) in environment {
        if !pattern.is_match(name) {
            continue;
        }
        exposed.insert(name.clone(), value.clone());
        if let Some(prefix) = &prefix {
            if let Some(stripped) = name.strip_prefix(prefix.as_str()) {
                if !stripped.is_empty() {
                    exposed.insert(stripped.to_string(), value.clone());
                }
            }
        }
    }
    exposed
}

/// Longest literal prefix of an anchored pattern
fn literal_prefix(pattern: &str) -> Option<String> {
    let body = pattern.strip_prefix('^')?;
    let literal: String = body
        .chars()
        .take_while(|c| c.is_ascii_alphanumeric() || *c == '_')
        .collect();
    if literal.is_empty() {
        None
    } else {
        Some(literal)
    }
}
