//! SOPS metadata parsing
//!
//! A SOPS document carries a top-level `sops` mapping describing how its
//! data key is wrapped: one entry per master key, grouped by backend. Each
//! group maps to a tagged [`MasterKey`] variant here; a group we do not
//! know about is a reportable parse error, never a runtime panic.

use anyhow::{anyhow, bail, Context, Result};
use serde::Deserialize;
use serde_yaml_ng::Value;

/// Default key suffix marking subtrees that SOPS leaves unencrypted
pub const DEFAULT_UNENCRYPTED_SUFFIX: &str = "_unencrypted";

/// One wrapped copy of the document data key
#[derive(Debug, Clone, PartialEq)]
pub enum MasterKey {
    Age {
        recipient: String,
        enc: String,
    },
    Pgp {
        fingerprint: String,
        enc: String,
    },
    AwsKms {
        arn: String,
        enc: String,
    },
    GcpKms {
        resource_id: String,
        enc: String,
    },
    AzureKeyVault {
        vault_url: String,
        name: String,
        version: String,
        enc: String,
    },
    Vault {
        address: String,
        engine_path: String,
        key_name: String,
        enc: String,
    },
}

impl MasterKey {
    /// Backend label for diagnostics and error messages
    pub fn scheme(&self) -> &'static str {
        match self {
            MasterKey::Age { .. } => "age",
            MasterKey::Pgp { .. } => "pgp",
            MasterKey::AwsKms { .. } => "kms",
            MasterKey::GcpKms { .. } => "gcp_kms",
            MasterKey::AzureKeyVault { .. } => "azure_kv",
            MasterKey::Vault { .. } => "hc_vault",
        }
    }
}

/// Parsed `sops` metadata section
#[derive(Debug, Clone)]
pub struct SopsMetadata {
    pub master_keys: Vec<MasterKey>,
    pub unencrypted_suffix: String,
}

#[derive(Debug, Deserialize)]
struct AgeEntry {
    recipient: String,
    enc: String,
}

#[derive(Debug, Deserialize)]
struct PgpEntry {
    fp: String,
    enc: String,
}

#[derive(Debug, Deserialize)]
struct AwsKmsEntry {
    arn: String,
    enc: String,
}

#[derive(Debug, Deserialize)]
struct GcpKmsEntry {
    resource_id: String,
    enc: String,
}

#[derive(Debug, Deserialize)]
struct AzureKvEntry {
    vault_url: String,
    name: String,
    version: String,
    enc: String,
}

#[derive(Debug, Deserialize)]
struct VaultEntry {
    vault_address: String,
    engine_path: String,
    key_name: String,
    enc: String,
}

/// Scalar metadata fields we recognize but do not act on
const SCALAR_FIELDS: &[&str] = &[
    "mac",
    "lastmodified",
    "version",
    "encrypted_suffix",
    "encrypted_regex",
    "unencrypted_regex",
    "mac_only_encrypted",
    "shamir_threshold",
];

pub fn parse(sops: &Value) -> Result<SopsMetadata> {
    let mapping = sops
        .as_mapping()
        .ok_or_else(|| anyhow!("sops metadata is not a mapping"))?;

    let mut master_keys = Vec::new();
    let mut unencrypted_suffix = DEFAULT_UNENCRYPTED_SUFFIX.to_string();

    for (key, value) in mapping {
        let Some(key) = key.as_str() else { continue };
        match key {
            "age" => {
                for entry in entries::<AgeEntry>(value, key)? {
                    master_keys.push(MasterKey::Age {
                        recipient: entry.recipient,
                        enc: entry.enc,
                    });
                }
            }
            "pgp" => {
                for entry in entries::<PgpEntry>(value, key)? {
                    master_keys.push(MasterKey::Pgp {
                        fingerprint: entry.fp,
                        enc: entry.enc,
                    });
                }
            }
            "kms" => {
                for entry in entries::<AwsKmsEntry>(value, key)? {
                    master_keys.push(MasterKey::AwsKms {
                        arn: entry.arn,
                        enc: entry.enc,
                    });
                }
            }
            "gcp_kms" => {
                for entry in entries::<GcpKmsEntry>(value, key)? {
                    master_keys.push(MasterKey::GcpKms {
                        resource_id: entry.resource_id,
                        enc: entry.enc,
                    });
                }
            }
            "azure_kv" => {
                for entry in entries::<AzureKvEntry>(value, key)? {
                    master_keys.push(MasterKey::AzureKeyVault {
                        vault_url: entry.vault_url,
                        name: entry.name,
                        version: entry.version,
                        enc: entry.enc,
                    });
                }
            }
            "hc_vault" => {
                for entry in entries::<VaultEntry>(value, key)? {
                    master_keys.push(MasterKey::Vault {
                        address: entry.vault_address,
                        engine_path: entry.engine_path,
                        key_name: entry.key_name,
                        enc: entry.enc,
                    });
                }
            }
            "unencrypted_suffix" => {
                if let Some(suffix) = value.as_str() {
                    unencrypted_suffix = suffix.to_string();
                }
            }
            other if SCALAR_FIELDS.contains(&other) => {}
            other => {
                if looks_like_key_group(value) {
                    bail!("unsupported sops master key backend {:?}", other);
                }
            }
        }
    }

    Ok(SopsMetadata {
        master_keys,
        unencrypted_suffix,
    })
}

fn entries<T: serde::de::DeserializeOwned>(value: &Value, group: &str) -> Result<Vec<T>> {
    match value {
        Value::Null => Ok(Vec::new()),
        Value::Sequence(items) => items
            .iter()
            .map(|item| {
                serde_yaml_ng::from_value(item.clone())
                    .with_context(|| format!("invalid sops {} entry", group))
            })
            .collect(),
        _ => bail!("sops {} section is not a sequence", group),
    }
}

/// A sequence of mappings carrying `enc` is a master-key group
fn looks_like_key_group(value: &Value) -> bool {
    match value {
        Value::Sequence(items) => items
            .iter()
            .any(|item| item.as_mapping().is_some_and(|m| m.contains_key("enc"))),
        _ => false,
    }
}
