//! EJSON decryption
//!
//! The baseline scheme: an EJSON document is a JSON object carrying its
//! keypair's public key under `_public_key`, with every non-underscore
//! string value sealed as `EJ[1:<ephemeral pk>:<nonce>:<box>]` (NaCl box,
//! X25519 + XSalsa20-Poly1305). Private keys arrive via `--ejson-key` or
//! from a Kubernetes Secret whose values are hex-encoded private keys.

use crate::{Decryptor, SecretClient};
use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use crypto_box::{
    aead::{generic_array::GenericArray, Aead},
    PublicKey, SalsaBox, SecretKey,
};
use serde_json::Value;
use std::collections::HashMap;
use tracing::debug;

const PUBLIC_KEY_FIELD: &str = "_public_key";

pub struct EjsonDecryptor {
    skip_decrypt: bool,
    /// Private keys indexed by their hex-encoded public key
    keys: HashMap<String, SecretKey>,
}

impl EjsonDecryptor {
    pub fn new(skip_decrypt: bool, private_keys: &[String]) -> Result<Self> {
        let mut decryptor = Self {
            skip_decrypt,
            keys: HashMap::new(),
        };
        for key in private_keys {
            decryptor.add_key(key)?;
        }
        Ok(decryptor)
    }

    /// Register a hex-encoded private key
    pub fn add_key(&mut self, private_key: &str) -> Result<()> {
        let bytes = hex::decode(private_key.trim()).context("invalid hex in ejson private key")?;
        let bytes: [u8; 32] = bytes
            .try_into()
            .map_err(|_| anyhow!("ejson private key must be 32 bytes"))?;
        let secret = SecretKey::from(bytes);
        let public = hex::encode(secret.public_key().as_bytes());
        self.keys.insert(public, secret);
        Ok(())
    }

    fn decrypt_tree(value: &mut Value, secret: &SecretKey) -> Result<()> {
        match value {
            Value::Object(map) => {
                for (key, child) in map.iter_mut() {
                    // Underscore-prefixed keys are stored in the clear
                    if key.starts_with('_') {
                        continue;
                    }
                    Self::decrypt_tree(child, secret)?;
                }
            }
            Value::Array(items) => {
                for child in items.iter_mut() {
                    Self::decrypt_tree(child, secret)?;
                }
            }
            Value::String(s) => {
                if let Some((ephemeral, nonce, ciphertext)) = parse_boxed(s) {
                    *s = open_box(&ephemeral, &nonce, &ciphertext, secret)?;
                }
            }
            _ => {}
        }
        Ok(())
    }
}

#[async_trait]
impl Decryptor for EjsonDecryptor {
    fn is_encrypted(&self, data: &[u8]) -> Result<bool> {
        let value: Value = match serde_json::from_slice(data) {
            Ok(v) => v,
            Err(_) => return Ok(false),
        };
        Ok(value.get(PUBLIC_KEY_FIELD).is_some_and(Value::is_string))
    }

    fn decrypt(&self, data: &[u8]) -> Result<Vec<u8>> {
        if self.skip_decrypt {
            return Ok(data.to_vec());
        }

        let mut document: Value =
            serde_json::from_slice(data).context("parsing ejson document")?;
        let public = document
            .get(PUBLIC_KEY_FIELD)
            .and_then(Value::as_str)
            .ok_or_else(|| anyhow!("ejson document has no {}", PUBLIC_KEY_FIELD))?
            .to_string();

        let secret = self
            .keys
            .get(&public)
            .ok_or_else(|| anyhow!("no private key known for public key {}", public))?;

        Self::decrypt_tree(&mut document, secret)?;
        serde_json::to_vec(&document).context("serializing decrypted ejson")
    }

    async fn keys_from_secret(
        &mut self,
        name: &str,
        namespace: &str,
        client: &SecretClient,
    ) -> Result<()> {
        let data = client.get_secret(name, namespace).await?;
        for (key, value) in data {
            let Ok(private) = String::from_utf8(value) else {
                debug!("secret entry {} is not utf-8, skipping", key);
                continue;
            };
            if let Err(e) = self.add_key(&private) {
                debug!("secret entry {} is not an ejson key: {:#}", key, e);
            }
        }
        Ok(())
    }

    fn name(&self) -> &'static str {
        "ejson"
    }
}

/// Split `EJ[1:<pk>:<nonce>:<ct>]` into its decoded components
fn parse_boxed(s: &str) -> Option<(Vec<u8>, Vec<u8>, Vec<u8>)> {
    let inner = s.strip_prefix("EJ[1:")?.strip_suffix(']')?;
    let mut parts = inner.splitn(3, ':');
    let ephemeral = BASE64.decode(parts.next()?).ok()?;
    let nonce = BASE64.decode(parts.next()?).ok()?;
    let ciphertext = BASE64.decode(parts.next()?).ok()?;
    Some((ephemeral, nonce, ciphertext))
}

fn open_box(
    ephemeral: &[u8],
    nonce: &[u8],
    ciphertext: &[u8],
    secret: &SecretKey,
) -> Result<String> {
    let ephemeral: [u8; 32] = ephemeral
        .try_into()
        .map_err(|_| anyhow!("boxed value has invalid ephemeral public key"))?;
    if nonce.len() != 24 {
        bail!("boxed value has invalid nonce length {}", nonce.len());
    }
    let salsa_box = SalsaBox::new(&PublicKey::from(ephemeral), secret);
    let plaintext = salsa_box
        .decrypt(GenericArray::from_slice(nonce), ciphertext)
        .map_err(|_| anyhow!("failed to open boxed value (wrong private key?)"))?;
    String::from_utf8(plaintext).context("decrypted value is not utf-8")
}

#[cfg(test)]
mod tests {
    use super::*;

    const TEST_PRIVATE: [u8; 32] = [11u8; 32];

    fn test_keypair() -> (String, String) {
        let secret = SecretKey::from(TEST_PRIVATE);
        (
            hex::encode(secret.public_key().as_bytes()),
            hex::encode(TEST_PRIVATE),
        )
    }

    fn seal(recipient_public_hex: &str, plaintext: &str) -> String {
        let recipient: [u8; 32] = hex::decode(recipient_public_hex)
            .unwrap()
            .try_into()
            .unwrap();
        let ephemeral = SecretKey::from([7u8; 32]);
        let nonce_bytes = [9u8; 24];
        let salsa_box = SalsaBox::new(&PublicKey::from(recipient), &ephemeral);
        let ciphertext = salsa_box
            .encrypt(GenericArray::from_slice(&nonce_bytes), plaintext.as_bytes())
            .unwrap();
        format!(
            "EJ[1:{}:{}:{}]",
            BASE64.encode(ephemeral.public_key().as_bytes()),
            BASE64.encode(nonce_bytes),
            BASE64.encode(&ciphertext)
        )
    }

    fn test_document(public_hex: &str) -> Vec<u8> {
        let doc = serde_json::json!({
            "_public_key": public_hex,
            "database_password": seal(public_hex, "hunter2"),
            "_comment": "plain because of the underscore",
            "nested": { "token": seal(public_hex, "tok-123") },
        });
        serde_json::to_vec(&doc).unwrap()
    }

    #[test]
    fn test_is_encrypted() {
        let (public_hex, private_hex) = test_keypair();
        let decryptor = EjsonDecryptor::new(false, &[private_hex]).unwrap();

        assert!(decryptor.is_encrypted(&test_document(&public_hex)).unwrap());
        assert!(!decryptor.is_encrypted(b"{\"kind\": \"Service\"}").unwrap());
        assert!(!decryptor.is_encrypted(b"plain: yaml").unwrap());
    }

    #[test]
    fn test_decrypt_round_trip() {
        let (public_hex, private_hex) = test_keypair();
        let decryptor = EjsonDecryptor::new(false, &[private_hex]).unwrap();

        let decrypted = decryptor.decrypt(&test_document(&public_hex)).unwrap();
        let value: Value = serde_json::from_slice(&decrypted).unwrap();

        assert_eq!(value["database_password"], "hunter2");
        assert_eq!(value["nested"]["token"], "tok-123");
        assert_eq!(value["_comment"], "plain because of the underscore");
        // The public key marker survives decryption
        assert_eq!(value["_public_key"], public_hex);
    }

    #[test]
    fn test_decrypt_without_matching_key() {
        let (public_hex, _) = test_keypair();
        let decryptor = EjsonDecryptor::new(false, &[hex::encode([3u8; 32])]).unwrap();

        let err = decryptor.decrypt(&test_document(&public_hex)).unwrap_err();
        assert!(err.to_string().contains("no private key known"));
    }

    #[test]
    fn test_skip_decrypt_passes_through() {
        let (public_hex, private_hex) = test_keypair();
        let decryptor = EjsonDecryptor::new(true, &[private_hex]).unwrap();

        let input = test_document(&public_hex);
        // Probing still works, decryption returns the input unchanged
        assert!(decryptor.is_encrypted(&input).unwrap());
        assert_eq!(decryptor.decrypt(&input).unwrap(), input);
    }

    #[test]
    fn test_rejects_malformed_private_key() {
        assert!(EjsonDecryptor::new(false, &["not-hex".to_string()]).is_err());
        assert!(EjsonDecryptor::new(false, &["abcd".to_string()]).is_err());
    }
}
