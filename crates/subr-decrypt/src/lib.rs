//! Decryption backends for subr
//!
//! Each supported encryption scheme implements the [`Decryptor`] trait:
//! probe raw bytes for "is this encrypted under my scheme", decrypt when it
//! is, and optionally load key material from a Kubernetes Secret. A build
//! run constructs its registry once with [`build_registry`]; dispatch is
//! first-match-wins in registry order via [`decrypt_if_encrypted`].

pub mod ejson;
pub mod kube;
pub mod sops;

pub use ejson::EjsonDecryptor;
pub use kube::SecretClient;
pub use sops::SopsDecryptor;

use anyhow::Result;
use async_trait::async_trait;
use subr_core::{Configuration, Diagnostics, Stage};
use tracing::debug;

/// One decryption scheme
///
/// Key material is mutated only during registry construction
/// (`keys_from_secret`); probing and decryption share the instance
/// immutably across concurrent build tasks. Loaded keys are released when
/// the instance drops at the end of the build run.
#[async_trait]
pub trait Decryptor: Send + Sync {
    /// Probe raw serialized content for this scheme
    fn is_encrypted(&self, data: &[u8]) -> Result<bool>;

    /// Reverse the encryption
    ///
    /// With skip-decrypt configured the call returns the input unchanged;
    /// probing still runs so callers can report encryption status.
    fn decrypt(&self, data: &[u8]) -> Result<Vec<u8>>;

    /// Load additional keys from a Kubernetes Secret, best-effort
    async fn keys_from_secret(
        &mut self,
        name: &str,
        namespace: &str,
        client: &SecretClient,
    ) -> Result<()>;

    /// Scheme name for diagnostics and error messages
    fn name(&self) -> &'static str;
}

/// Construct the decryptor registry for one build run
///
/// The EJSON baseline is always first, even with decryption disabled.
/// Secret-store lookup is best-effort end to end: a client that cannot be
/// constructed and a per-decryptor key-loading failure are both recorded as
/// diagnostics and the registry continues with reduced capability.
pub async fn build_registry(
    config: &Configuration,
    diagnostics: &Diagnostics,
) -> Result<Vec<Box<dyn Decryptor>>> {
    let mut registry: Vec<Box<dyn Decryptor>> = Vec::new();

    registry.push(Box::new(EjsonDecryptor::new(
        config.skip_decrypt,
        &config.ejson_keys,
    )?));
    registry.push(Box::new(SopsDecryptor::from_env(config.skip_decrypt)?));

    if !config.skip_decrypt && config.wants_secret_lookup() {
        // wants_secret_lookup guarantees both are set
        let name = config.secret_name.as_deref().unwrap_or_default();
        let namespace = config.secret_namespace.as_deref().unwrap_or_default();

        match SecretClient::connect(config.kubeconfig.as_deref(), config.kube_api.as_deref()).await
        {
            Ok(client) => {
                for decryptor in registry.iter_mut() {
                    if let Err(e) = decryptor.keys_from_secret(name, namespace, &client).await {
                        diagnostics.record(Stage::KeyLoading, decryptor.name(), format!("{:#}", e));
                    }
                }
            }
            Err(e) => {
                diagnostics.record(Stage::SecretClient, "kubernetes", format!("{:#}", e));
            }
        }
    }

    Ok(registry)
}

/// First-match-wins decrypt dispatch
///
/// Probes the registry in construction order. The first decryptor claiming
/// the content gets the only `decrypt` call; later decryptors are never
/// consulted. A probe error is recorded and treated as "not recognized".
/// Returns `Ok(None)` for plaintext; a decrypt failure is the caller's
/// per-item error.
pub fn decrypt_if_encrypted(
    registry: &[Box<dyn Decryptor>],
    data: &[u8],
    diagnostics: &Diagnostics,
    subject: &str,
) -> Result<Option<Vec<u8>>> {
    for decryptor in registry {
        match decryptor.is_encrypted(data) {
            Ok(true) => {
                debug!("{} encrypted with {}", subject, decryptor.name());
                return decryptor.decrypt(data).map(Some);
            }
            Ok(false) => {}
            Err(e) => {
                diagnostics.record(
                    Stage::Probe,
                    subject,
                    format!("{}: {:#}", decryptor.name(), e),
                );
            }
        }
    }
    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct ProbeDecryptor {
        name: &'static str,
        claims: bool,
        probe_fails: bool,
        decrypt_calls: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Decryptor for ProbeDecryptor {
        fn is_encrypted(&self, _data: &[u8]) -> Result<bool> {
            if self.probe_fails {
                return Err(anyhow!("probe exploded"));
            }
            Ok(self.claims)
        }

        fn decrypt(&self, _data: &[u8]) -> Result<Vec<u8>> {
            self.decrypt_calls.fetch_add(1, Ordering::SeqCst);
            Ok(format!("decrypted-by-{}", self.name).into_bytes())
        }

        async fn keys_from_secret(
            &mut self,
            _name: &str,
            _namespace: &str,
            _client: &SecretClient,
        ) -> Result<()> {
            Ok(())
        }

        fn name(&self) -> &'static str {
            self.name
        }
    }

    fn probe(
        name: &'static str,
        claims: bool,
        probe_fails: bool,
    ) -> (Box<dyn Decryptor>, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        (
            Box::new(ProbeDecryptor {
                name,
                claims,
                probe_fails,
                decrypt_calls: calls.clone(),
            }),
            calls,
        )
    }

    #[test]
    fn test_plaintext_never_decrypted() {
        let (first, first_calls) = probe("first", false, false);
        let (second, second_calls) = probe("second", false, false);
        let registry = vec![first, second];
        let diagnostics = Diagnostics::new();

        let result = decrypt_if_encrypted(&registry, b"{}", &diagnostics, "m").unwrap();
        assert!(result.is_none());
        assert_eq!(first_calls.load(Ordering::SeqCst), 0);
        assert_eq!(second_calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_first_match_wins() {
        let (first, first_calls) = probe("first", true, false);
        let (second, second_calls) = probe("second", true, false);
        let registry = vec![first, second];
        let diagnostics = Diagnostics::new();

        let result = decrypt_if_encrypted(&registry, b"{}", &diagnostics, "m")
            .unwrap()
            .unwrap();
        assert_eq!(result, b"decrypted-by-first");
        assert_eq!(first_calls.load(Ordering::SeqCst), 1);
        assert_eq!(second_calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_probe_error_does_not_shadow_later_decryptor() {
        let (first, _) = probe("first", false, true);
        let (second, second_calls) = probe("second", true, false);
        let registry = vec![first, second];
        let diagnostics = Diagnostics::new();

        let result = decrypt_if_encrypted(&registry, b"{}", &diagnostics, "m")
            .unwrap()
            .unwrap();
        assert_eq!(result, b"decrypted-by-second");
        assert_eq!(second_calls.load(Ordering::SeqCst), 1);
        assert_eq!(diagnostics.count(Stage::Probe), 1);
    }

    #[test]
    fn test_all_probes_failing_is_plaintext() {
        let (first, _) = probe("first", false, true);
        let (second, _) = probe("second", false, true);
        let registry = vec![first, second];
        let diagnostics = Diagnostics::new();

        let result = decrypt_if_encrypted(&registry, b"{}", &diagnostics, "m").unwrap();
        assert!(result.is_none());
        assert_eq!(diagnostics.count(Stage::Probe), 2);
    }
}
