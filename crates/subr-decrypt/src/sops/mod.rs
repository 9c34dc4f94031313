//! SOPS decryption
//!
//! Recognizes documents carrying a top-level `sops` metadata mapping. The
//! document data key is unwrapped from one of the metadata's age entries
//! using locally held identities, then every `ENC[AES256_GCM,...]` leaf is
//! decrypted with AES-256-GCM keyed by the data key and authenticated
//! against the leaf's path. Master keys wrapped by other backends (PGP,
//! cloud KMS, Vault) parse into their typed variants but cannot unwrap the
//! data key here.
//!
//! SOPS uses 32-byte GCM nonces, so the cipher is instantiated with a
//! non-default nonce size.

pub mod metadata;

pub use metadata::{MasterKey, SopsMetadata};

use crate::{Decryptor, SecretClient};
use aes_gcm::{
    aead::generic_array::{typenum::U32, GenericArray},
    aead::{Aead, KeyInit, Payload},
    aes::Aes256,
    AesGcm,
};
use age::armor::ArmoredReader;
use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use serde_yaml_ng::{Mapping, Value};
use std::io::Read;
use tracing::debug;
use zeroize::Zeroizing;

const METADATA_KEY: &str = "sops";
const AGE_KEY_ENV: &str = "SOPS_AGE_KEY";
const AGE_KEY_FILE_ENV: &str = "SOPS_AGE_KEY_FILE";

type SopsCipher = AesGcm<Aes256, U32>;

pub struct SopsDecryptor {
    skip_decrypt: bool,
    identities: Vec<age::x25519::Identity>,
}

impl SopsDecryptor {
    pub fn new(skip_decrypt: bool) -> Self {
        Self {
            skip_decrypt,
            identities: Vec::new(),
        }
    }

    /// Construct with identities from `SOPS_AGE_KEY` and `SOPS_AGE_KEY_FILE`
    pub fn from_env(skip_decrypt: bool) -> Result<Self> {
        let mut decryptor = Self::new(skip_decrypt);

        if let Ok(keys) = std::env::var(AGE_KEY_ENV) {
            decryptor
                .add_identities(&keys)
                .with_context(|| format!("parsing {}", AGE_KEY_ENV))?;
        }
        if let Ok(path) = std::env::var(AGE_KEY_FILE_ENV) {
            let content = std::fs::read_to_string(&path)
                .with_context(|| format!("reading {} ({})", AGE_KEY_FILE_ENV, path))?;
            decryptor
                .add_identities(&content)
                .with_context(|| format!("parsing {}", path))?;
        }

        Ok(decryptor)
    }

    /// Parse newline-separated age identities; comments and blanks allowed
    pub fn add_identities(&mut self, content: &str) -> Result<()> {
        for line in content.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let identity = line
                .parse::<age::x25519::Identity>()
                .map_err(|e| anyhow!("invalid age identity: {}", e))?;
            self.identities.push(identity);
        }
        Ok(())
    }

    /// Unwrap the document data key from the first age entry we hold an
    /// identity for
    fn unwrap_data_key(&self, master_keys: &[MasterKey]) -> Result<Zeroizing<Vec<u8>>> {
        if self.identities.is_empty() {
            bail!("no age identities available");
        }

        let mut last_error = None;
        let mut other_schemes = Vec::new();

        for key in master_keys {
            let enc = match key {
                MasterKey::Age { enc, .. } => enc,
                other => {
                    other_schemes.push(other.scheme());
                    continue;
                }
            };

            match self.try_unwrap_age(enc) {
                Ok(data_key) => return Ok(data_key),
                Err(e) => last_error = Some(e),
            }
        }

        match last_error {
            Some(e) => Err(e.context("no age master key could be unwrapped")),
            None if !other_schemes.is_empty() => bail!(
                "no age master key present; unsupported backends: {}",
                other_schemes.join(", ")
            ),
            None => bail!("sops metadata lists no master keys"),
        }
    }

    fn try_unwrap_age(&self, enc: &str) -> Result<Zeroizing<Vec<u8>>> {
        let decryptor = age::Decryptor::new(ArmoredReader::new(enc.trim().as_bytes()))
            .map_err(|e| anyhow!("reading age-wrapped data key: {}", e))?;

        let mut reader = decryptor
            .decrypt(self.identities.iter().map(|i| i as &dyn age::Identity))
            .map_err(|e| anyhow!("unwrapping data key: {}", e))?;

        let mut data_key = Zeroizing::new(Vec::new());
        reader
            .read_to_end(&mut data_key)
            .context("reading unwrapped data key")?;

        if data_key.len() != 32 {
            bail!("unwrapped data key has wrong size: {}", data_key.len());
        }
        Ok(data_key)
    }

    fn decrypt_node(value: &Value, path: &str, data_key: &[u8], suffix: &str) -> Result<Value> {
        match value {
            Value::Mapping(mapping) => {
                let mut out = Mapping::new();
                for (key, child) in mapping {
                    let key_string = key
                        .as_str()
                        .map(str::to_string)
                        .unwrap_or_else(|| scalar_to_string(key));
                    if key_string.ends_with(suffix) {
                        out.insert(key.clone(), child.clone());
                        continue;
                    }
                    let child_path = format!("{}{}:", path, key_string);
                    out.insert(
                        key.clone(),
                        Self::decrypt_node(child, &child_path, data_key, suffix)?,
                    );
                }
                Ok(Value::Mapping(out))
            }
            // Sequence elements share the parent path
            Value::Sequence(items) => items
                .iter()
                .map(|item| Self::decrypt_node(item, path, data_key, suffix))
                .collect::<Result<Vec<_>>>()
                .map(Value::Sequence),
            Value::String(s) => match parse_enc(s)? {
                Some(leaf) => decrypt_leaf(&leaf, path, data_key),
                None => Ok(value.clone()),
            },
            other => Ok(other.clone()),
        }
    }
}

#[async_trait]
impl Decryptor for SopsDecryptor {
    fn is_encrypted(&self, data: &[u8]) -> Result<bool> {
        let value: Value = match serde_yaml_ng::from_slice(data) {
            Ok(v) => v,
            Err(_) => return Ok(false),
        };
        Ok(value
            .as_mapping()
            .and_then(|m| m.get(METADATA_KEY))
            .is_some_and(Value::is_mapping))
    }

    fn decrypt(&self, data: &[u8]) -> Result<Vec<u8>> {
        if self.skip_decrypt {
            return Ok(data.to_vec());
        }

        let document: Value =
            serde_yaml_ng::from_slice(data).context("parsing sops document")?;
        let mapping = document
            .as_mapping()
            .ok_or_else(|| anyhow!("sops document is not a mapping"))?;
        let sops = mapping
            .get(METADATA_KEY)
            .ok_or_else(|| anyhow!("document has no sops metadata"))?;

        let metadata = metadata::parse(sops)?;
        let data_key = self.unwrap_data_key(&metadata.master_keys)?;

        let mut stripped = mapping.clone();
        stripped.remove(METADATA_KEY);
        let cleartext = Self::decrypt_node(
            &Value::Mapping(stripped),
            "",
            &data_key,
            &metadata.unencrypted_suffix,
        )?;

        let rendered =
            serde_yaml_ng::to_string(&cleartext).context("serializing decrypted sops document")?;
        Ok(rendered.into_bytes())
    }

    async fn keys_from_secret(
        &mut self,
        name: &str,
        namespace: &str,
        client: &SecretClient,
    ) -> Result<()> {
        let data = client.get_secret(name, namespace).await?;
        for (key, value) in data {
            let Ok(content) = String::from_utf8(value) else {
                debug!("secret entry {} is not utf-8, skipping", key);
                continue;
            };
            for line in content.lines() {
                let line = line.trim();
                if !line.starts_with("AGE-SECRET-KEY-") {
                    continue;
                }
                match line.parse::<age::x25519::Identity>() {
                    Ok(identity) => self.identities.push(identity),
                    Err(e) => debug!("secret entry {} holds an invalid age key: {}", key, e),
                }
            }
        }
        Ok(())
    }

    fn name(&self) -> &'static str {
        "sops"
    }
}

/// One encrypted leaf, decoded from its `ENC[AES256_GCM,...]` form
struct EncryptedLeaf {
    data: Vec<u8>,
    iv: Vec<u8>,
    tag: Vec<u8>,
    value_type: String,
}

fn parse_enc(s: &str) -> Result<Option<EncryptedLeaf>> {
    let Some(inner) = s
        .strip_prefix("ENC[AES256_GCM,")
        .and_then(|rest| rest.strip_suffix(']'))
    else {
        return Ok(None);
    };

    let mut data = None;
    let mut iv = None;
    let mut tag = None;
    let mut value_type = None;

    for field in inner.split(',') {
        let (key, value) = field
            .split_once(':')
            .ok_or_else(|| anyhow!("malformed encrypted value field {:?}", field))?;
        match key {
            "data" => data = Some(BASE64.decode(value).context("decoding data")?),
            "iv" => iv = Some(BASE64.decode(value).context("decoding iv")?),
            "tag" => tag = Some(BASE64.decode(value).context("decoding tag")?),
            "type" => value_type = Some(value.to_string()),
            other => bail!("unknown encrypted value field {:?}", other),
        }
    }

    Ok(Some(EncryptedLeaf {
        data: data.ok_or_else(|| anyhow!("encrypted value missing data"))?,
        iv: iv.ok_or_else(|| anyhow!("encrypted value missing iv"))?,
        tag: tag.ok_or_else(|| anyhow!("encrypted value missing tag"))?,
        value_type: value_type.unwrap_or_else(|| "str".to_string()),
    }))
}

fn decrypt_leaf(leaf: &EncryptedLeaf, path: &str, data_key: &[u8]) -> Result<Value> {
    if leaf.iv.len() != 32 {
        bail!("encrypted value has invalid iv length {}", leaf.iv.len());
    }

    let cipher = SopsCipher::new_from_slice(data_key)
        .map_err(|_| anyhow!("data key has invalid length"))?;
    let nonce = GenericArray::from_slice(&leaf.iv);

    let mut message = leaf.data.clone();
    message.extend_from_slice(&leaf.tag);

    let plaintext = cipher
        .decrypt(
            nonce,
            Payload {
                msg: &message,
                aad: path.as_bytes(),
            },
        )
        .map_err(|_| anyhow!("failed to decrypt value at {}", path))?;
    let plaintext = String::from_utf8(plaintext).context("decrypted value is not utf-8")?;

    match leaf.value_type.as_str() {
        "str" | "comment" => Ok(Value::String(plaintext)),
        "int" => {
            let n: i64 = plaintext.parse().context("decrypted int is malformed")?;
            Ok(Value::Number(n.into()))
        }
        "float" => {
            let f: f64 = plaintext.parse().context("decrypted float is malformed")?;
            Ok(Value::Number(f.into()))
        }
        "bool" => Ok(Value::Bool(plaintext == "True" || plaintext == "true")),
        "bytes" => Ok(Value::String(plaintext)),
        other => bail!("unknown encrypted value type {:?}", other),
    }
}

fn scalar_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        _ => String::new(),
    }
}
