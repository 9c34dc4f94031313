//! Structured per-run diagnostics
//!
//! Degraded and per-manifest failures are tolerated by design: a missing
//! secret-store client or one undecryptable manifest never aborts the build.
//! Each such event is recorded here in addition to being logged, so callers
//! and tests can assert on what degraded without scraping log output.

use std::fmt;
use std::sync::{Arc, Mutex};
use tracing::debug;

/// Pipeline stage a diagnostic originated from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    /// Constructing the Kubernetes Secret client
    SecretClient,
    /// Loading decryption keys into a decryptor
    KeyLoading,
    /// Probing content for encryption
    Probe,
    /// Decrypting content
    Decrypt,
    /// Parsing manifest or substitution-file content
    Parse,
    /// Applying substitutions to a manifest
    Substitute,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Stage::SecretClient => "secret-client",
            Stage::KeyLoading => "key-loading",
            Stage::Probe => "probe",
            Stage::Decrypt => "decrypt",
            Stage::Parse => "parse",
            Stage::Substitute => "substitute",
        };
        f.write_str(s)
    }
}

/// One recorded degraded or per-item event
#[derive(Debug, Clone)]
pub struct Diagnostic {
    pub stage: Stage,
    /// What the event concerns: a manifest name, file path, or decryptor name
    pub subject: String,
    pub message: String,
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}: {}", self.stage, self.subject, self.message)
    }
}

/// Shared handle to the per-run diagnostics list
///
/// Cheap to clone; concurrent build tasks record through their own clone.
#[derive(Debug, Clone, Default)]
pub struct Diagnostics {
    inner: Arc<Mutex<Vec<Diagnostic>>>,
}

impl Diagnostics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one event; also emits a debug log line
    pub fn record(&self, stage: Stage, subject: impl Into<String>, message: impl Into<String>) {
        let diagnostic = Diagnostic {
            stage,
            subject: subject.into(),
            message: message.into(),
        };
        debug!("{}", diagnostic);
        self.lock().push(diagnostic);
    }

    /// Copy of everything recorded so far
    pub fn snapshot(&self) -> Vec<Diagnostic> {
        self.lock().clone()
    }

    /// Number of events recorded for one stage
    pub fn count(&self, stage: Stage) -> usize {
        self.lock().iter().filter(|d| d.stage == stage).count()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<Diagnostic>> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_and_count() {
        let diagnostics = Diagnostics::new();
        assert!(diagnostics.is_empty());

        diagnostics.record(Stage::Probe, "backend.yaml", "probe failed");
        diagnostics.record(Stage::Decrypt, "secrets.yaml", "no matching key");
        diagnostics.record(Stage::Probe, "frontend.yaml", "probe failed");

        assert_eq!(diagnostics.len(), 3);
        assert_eq!(diagnostics.count(Stage::Probe), 2);
        assert_eq!(diagnostics.count(Stage::Decrypt), 1);
        assert_eq!(diagnostics.count(Stage::Parse), 0);
    }

    #[test]
    fn test_clones_share_state() {
        let diagnostics = Diagnostics::new();
        let clone = diagnostics.clone();
        clone.record(Stage::KeyLoading, "ejson", "secret unavailable");
        assert_eq!(diagnostics.len(), 1);
    }

    #[test]
    fn test_display() {
        let diagnostic = Diagnostic {
            stage: Stage::SecretClient,
            subject: "kube".to_string(),
            message: "connection refused".to_string(),
        };
        assert_eq!(
            diagnostic.to_string(),
            "[secret-client] kube: connection refused"
        );
    }
}
