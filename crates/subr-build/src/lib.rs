//! Build orchestration for subr
//!
//! A build run discovers and resolves the substitution set, then fans out
//! one task per manifest: probe for encryption, decrypt when claimed,
//! parse, substitute, and append to the shared output collection. Tasks
//! share only the read-only decryptor registry, the read-only resolved
//! set, and the mutex-guarded collection; a failing manifest is recorded
//! and dropped without disturbing its siblings.

pub mod eval;
pub mod source;
pub mod substitutions;

pub use source::{DirSource, Manifest, ManifestSource};
pub use substitutions::{Substitutions, SubstitutionsConfig};

use anyhow::{Context, Result};
use futures::stream::{self, StreamExt};
use serde_yaml_ng::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use subr_core::{Configuration, Diagnostics, Stage};
use subr_decrypt::{build_registry, decrypt_if_encrypted, Decryptor};
use tracing::{debug, error};

/// One end-to-end build run
pub struct Build {
    config: Configuration,
    source: Arc<dyn ManifestSource>,
    registry: Arc<Vec<Box<dyn Decryptor>>>,
    diagnostics: Diagnostics,
    /// Resolved substitution set, populated by `build_substitutions`
    pub substitutions: Option<Arc<Substitutions>>,
    /// Substituted manifests, populated by `build`; insertion order is
    /// whichever task finishes first
    pub manifests: Vec<Value>,
}

impl Build {
    /// Construct a build run over the configured root directory
    pub async fn new(config: Configuration) -> Result<Self> {
        let diagnostics = Diagnostics::new();
        let registry = build_registry(&config, &diagnostics).await?;
        let source = DirSource::new(config.root_directory.clone(), config.file_regex.clone());
        Ok(Self::assemble(
            config,
            Arc::new(source),
            registry,
            diagnostics,
        ))
    }

    /// Construct with a caller-supplied source and registry
    pub fn with_source(
        config: Configuration,
        source: Arc<dyn ManifestSource>,
        registry: Vec<Box<dyn Decryptor>>,
    ) -> Self {
        Self::assemble(config, source, registry, Diagnostics::new())
    }

    fn assemble(
        config: Configuration,
        source: Arc<dyn ManifestSource>,
        registry: Vec<Box<dyn Decryptor>>,
        diagnostics: Diagnostics,
    ) -> Self {
        Self {
            config,
            source,
            registry: Arc::new(registry),
            diagnostics,
            substitutions: None,
            manifests: Vec::new(),
        }
    }

    pub fn diagnostics(&self) -> &Diagnostics {
        &self.diagnostics
    }

    /// Discover and resolve the substitution set from the process environment
    pub fn build_substitutions(&mut self) -> Result<()> {
        let environment: HashMap<String, String> = std::env::vars().collect();
        self.build_substitutions_with_env(&environment)
    }

    /// Discover and resolve the substitution set against a caller-supplied
    /// environment
    pub fn build_substitutions_with_env(
        &mut self,
        environment: &HashMap<String, String>,
    ) -> Result<()> {
        let mut substitutions = Substitutions::new(SubstitutionsConfig {
            file_regex: self.config.file_regex.clone(),
            env_regex: self.config.env_regex.clone(),
        });
        substitutions.discover(self.source.as_ref(), &self.registry, &self.diagnostics)?;
        substitutions
            .resolve(environment)
            .context("substitution evaluation failed")?;

        if substitutions.is_empty() {
            debug!("no substitutions found");
        } else {
            debug!("loaded {} substitutions", substitutions.values.len());
        }
        self.substitutions = Some(Arc::new(substitutions));
        Ok(())
    }

    /// Decrypt-then-substitute every manifest, in parallel
    ///
    /// Completion is a barrier over all per-manifest tasks. The call
    /// succeeds even when individual manifests failed; those are recorded
    /// as diagnostics and absent from the collection.
    pub async fn build(&mut self) -> Result<()> {
        let Some(substitutions) = self.substitutions.clone() else {
            debug!("no resources to build");
            return Ok(());
        };

        debug!("substitute manifests");
        let manifests = self.source.build().context("building manifest source")?;
        let collected = Arc::new(Mutex::new(Vec::with_capacity(manifests.len())));
        let workers = std::thread::available_parallelism()
            .map(usize::from)
            .unwrap_or(4);

        stream::iter(manifests)
            .for_each_concurrent(workers, |manifest| {
                let registry = Arc::clone(&self.registry);
                let substitutions = Arc::clone(&substitutions);
                let diagnostics = self.diagnostics.clone();
                let collected = Arc::clone(&collected);
                async move {
                    if let Some(doc) =
                        process_manifest(&manifest, &registry, &substitutions, &diagnostics)
                    {
                        // Lock held for the append only
                        collected
                            .lock()
                            .unwrap_or_else(|e| e.into_inner())
                            .push(doc);
                    }
                }
            })
            .await;

        self.manifests = std::mem::take(&mut *collected.lock().unwrap_or_else(|e| e.into_inner()));
        Ok(())
    }
}

/// One manifest through the pipeline: probe, decrypt or pass through,
/// parse, substitute. Failures are recorded and yield `None`.
fn process_manifest(
    manifest: &Manifest,
    registry: &[Box<dyn Decryptor>],
    substitutions: &Substitutions,
    diagnostics: &Diagnostics,
) -> Option<Value> {
    let subject = manifest.display_name();

    let raw = match manifest.as_json_bytes() {
        Ok(bytes) => bytes,
        Err(e) => {
            diagnostics.record(Stage::Parse, &subject, format!("{:#}", e));
            error!("failed to serialize {}: {:#}", subject, e);
            return None;
        }
    };

    let tree = match decrypt_if_encrypted(registry, &raw, diagnostics, &subject) {
        // Decrypted output parses directly; it never goes back through the
        // generic serialization path
        Ok(Some(plain)) => match serde_yaml_ng::from_slice::<Value>(&plain) {
            Ok(doc) => doc,
            Err(e) => {
                diagnostics.record(Stage::Parse, &subject, e.to_string());
                error!("failed to parse decrypted {}: {}", subject, e);
                return None;
            }
        },
        Ok(None) => manifest.doc().clone(),
        Err(e) => {
            diagnostics.record(Stage::Decrypt, &subject, format!("{:#}", e));
            error!("failed to decrypt {}: {:#}", subject, e);
            return None;
        }
    };

    match substitutions.apply(&tree) {
        Ok(doc) => Some(doc),
        Err(e) => {
            diagnostics.record(Stage::Substitute, &subject, format!("{:#}", e));
            error!("substitution failed for {}: {:#}", subject, e);
            None
        }
    }
}
