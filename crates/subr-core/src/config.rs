//! Run configuration loading
//!
//! A run is configured from three layers, lowest precedence first: built-in
//! defaults, an optional YAML configuration file (`--config`), and CLI flag
//! overrides. The merged result is an immutable [`Configuration`] value that
//! is threaded explicitly through every constructor; nothing in subr reads
//! flag state from globals.

use crate::error::{Error, Result};
use regex::Regex;
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// Default pattern for discovering substitution-definition files
pub const DEFAULT_FILE_REGEX: &str = r"(subst\.yaml|.*(ejson))";

/// Default pattern restricting which environment variables substitution
/// expressions may see
pub const DEFAULT_ENV_REGEX: &str = "^ARGOCD_ENV_.*$";

/// Rendered output format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    #[default]
    Yaml,
    Json,
}

impl FromStr for OutputFormat {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "yaml" => Ok(OutputFormat::Yaml),
            "json" => Ok(OutputFormat::Json),
            other => Err(Error::invalid_config(format!(
                "unknown output format {:?} (expected yaml or json)",
                other
            ))),
        }
    }
}

/// Immutable per-run configuration
///
/// Loaded once by [`Configuration::load`] and never mutated afterwards.
#[derive(Debug, Clone)]
pub struct Configuration {
    /// Absolute root directory the build operates on
    pub root_directory: PathBuf,

    /// Paths matching this pattern are substitution-definition files
    pub file_regex: Regex,

    /// Environment variables matching this pattern are exposed to
    /// substitution expressions; all others are invisible
    pub env_regex: Regex,

    /// Output format for rendered manifests
    pub output: OutputFormat,

    /// Probe for encryption but never decrypt
    pub skip_decrypt: bool,

    /// Do not read decryption keys from a Kubernetes Secret
    pub skip_secret_lookup: bool,

    /// Name of the Secret holding decryption keys
    pub secret_name: Option<String>,

    /// Namespace of the Secret holding decryption keys
    pub secret_namespace: Option<String>,

    /// EJSON private keys supplied directly
    pub ejson_keys: Vec<String>,

    /// Path to a kubeconfig file
    pub kubeconfig: Option<PathBuf>,

    /// Kubernetes API URL overriding the kubeconfig server
    pub kube_api: Option<String>,
}

/// CLI flag values layered over the configuration file
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub file_regex: Option<String>,
    pub env_regex: Option<String>,
    pub output: Option<String>,
    pub skip_decrypt: bool,
    pub skip_secret_lookup: bool,
    pub secret_name: Option<String>,
    pub secret_namespace: Option<String>,
    pub ejson_keys: Vec<String>,
    pub kubeconfig: Option<PathBuf>,
    pub kube_api: Option<String>,
}

/// On-disk configuration file shape; every field optional
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
struct ConfigFile {
    file_regex: Option<String>,
    env_regex: Option<String>,
    output: Option<OutputFormat>,
    #[serde(default)]
    skip_decrypt: bool,
    #[serde(default)]
    skip_secret_lookup: bool,
    secret_name: Option<String>,
    secret_namespace: Option<String>,
    #[serde(default)]
    ejson_keys: Vec<String>,
    kubeconfig: Option<PathBuf>,
    kube_api: Option<String>,
}

impl Configuration {
    /// Merge defaults, the optional config file, and CLI overrides into the
    /// immutable per-run configuration.
    ///
    /// `root` is the positional directory argument; it is resolved to an
    /// absolute path and must exist.
    pub fn load(config_path: Option<&Path>, root: &Path, overrides: Overrides) -> Result<Self> {
        let file = match config_path {
            Some(path) => {
                let content = fs::read_to_string(path).map_err(|e| {
                    if e.kind() == std::io::ErrorKind::NotFound {
                        Error::config_not_found(path.display().to_string())
                    } else {
                        Error::Io(e)
                    }
                })?;
                serde_yaml_ng::from_str::<ConfigFile>(&content)?
            }
            None => ConfigFile::default(),
        };

        let root_directory = fs::canonicalize(root).map_err(|e| Error::RootDirectory {
            path: root.display().to_string(),
            source: e,
        })?;

        let file_pattern = overrides
            .file_regex
            .or(file.file_regex)
            .unwrap_or_else(|| DEFAULT_FILE_REGEX.to_string());
        let env_pattern = overrides
            .env_regex
            .or(file.env_regex)
            .unwrap_or_else(|| DEFAULT_ENV_REGEX.to_string());

        let output = match overrides.output {
            Some(s) => s.parse()?,
            None => file.output.unwrap_or_default(),
        };

        let mut ejson_keys = file.ejson_keys;
        ejson_keys.extend(overrides.ejson_keys);

        Ok(Self {
            root_directory,
            file_regex: compile(&file_pattern)?,
            env_regex: compile(&env_pattern)?,
            output,
            skip_decrypt: overrides.skip_decrypt || file.skip_decrypt,
            skip_secret_lookup: overrides.skip_secret_lookup || file.skip_secret_lookup,
            secret_name: overrides.secret_name.or(file.secret_name),
            secret_namespace: overrides.secret_namespace.or(file.secret_namespace),
            ejson_keys,
            kubeconfig: overrides.kubeconfig.or(file.kubeconfig),
            kube_api: overrides.kube_api.or(file.kube_api),
        })
    }

    /// Whether the run is configured to read keys from a Kubernetes Secret
    pub fn wants_secret_lookup(&self) -> bool {
        !self.skip_secret_lookup
            && self.secret_name.as_deref().is_some_and(|s| !s.is_empty())
            && self
                .secret_namespace
                .as_deref()
                .is_some_and(|s| !s.is_empty())
    }
}

fn compile(pattern: &str) -> Result<Regex> {
    Regex::new(pattern).map_err(|e| Error::invalid_pattern(pattern, e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_defaults() {
        let dir = TempDir::new().unwrap();
        let config = Configuration::load(None, dir.path(), Overrides::default()).unwrap();

        assert_eq!(config.file_regex.as_str(), DEFAULT_FILE_REGEX);
        assert_eq!(config.env_regex.as_str(), DEFAULT_ENV_REGEX);
        assert_eq!(config.output, OutputFormat::Yaml);
        assert!(!config.skip_decrypt);
        assert!(!config.wants_secret_lookup());
        assert!(config.file_regex.is_match("overlays/subst.yaml"));
        assert!(config.file_regex.is_match("secrets.ejson"));
        assert!(!config.file_regex.is_match("deployment.yaml"));
    }

    #[test]
    fn test_file_values_apply() {
        let dir = TempDir::new().unwrap();
        let config_path = dir.path().join("subr.yaml");
        std::fs::write(
            &config_path,
            "env-regex: \"^MY_.*$\"\noutput: json\nsecret-name: keys\nsecret-namespace: argocd\n",
        )
        .unwrap();

        let config =
            Configuration::load(Some(&config_path), dir.path(), Overrides::default()).unwrap();
        assert_eq!(config.env_regex.as_str(), "^MY_.*$");
        assert_eq!(config.output, OutputFormat::Json);
        assert!(config.wants_secret_lookup());
    }

    #[test]
    fn test_flags_override_file() {
        let dir = TempDir::new().unwrap();
        let config_path = dir.path().join("subr.yaml");
        std::fs::write(&config_path, "output: json\nejson-keys:\n  - aaaa\n").unwrap();

        let overrides = Overrides {
            output: Some("yaml".to_string()),
            ejson_keys: vec!["bbbb".to_string()],
            ..Overrides::default()
        };
        let config = Configuration::load(Some(&config_path), dir.path(), overrides).unwrap();

        assert_eq!(config.output, OutputFormat::Yaml);
        // File keys come first, flag keys appended
        assert_eq!(config.ejson_keys, vec!["aaaa", "bbbb"]);
    }

    #[test]
    fn test_missing_config_file() {
        let dir = TempDir::new().unwrap();
        let missing = dir.path().join("nope.yaml");
        let err =
            Configuration::load(Some(&missing), dir.path(), Overrides::default()).unwrap_err();
        assert!(matches!(err, Error::ConfigNotFound { .. }));
    }

    #[test]
    fn test_invalid_pattern_rejected() {
        let dir = TempDir::new().unwrap();
        let overrides = Overrides {
            file_regex: Some("([unclosed".to_string()),
            ..Overrides::default()
        };
        let err = Configuration::load(None, dir.path(), overrides).unwrap_err();
        assert!(matches!(err, Error::InvalidPattern { .. }));
    }

    #[test]
    fn test_missing_root_directory() {
        let err = Configuration::load(
            None,
            Path::new("/nonexistent/subr-root"),
            Overrides::default(),
        )
        .unwrap_err();
        assert!(matches!(err, Error::RootDirectory { .. }));
    }

    #[test]
    fn test_unknown_output_format() {
        let dir = TempDir::new().unwrap();
        let overrides = Overrides {
            output: Some("xml".to_string()),
            ..Overrides::default()
        };
        let err = Configuration::load(None, dir.path(), overrides).unwrap_err();
        assert!(err.to_string().contains("unknown output format"));
    }
}
