//! CLI argument parsing with clap

use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use subr_core::Overrides;

/// subr - render manifest trees with substitution and decryption
#[derive(Parser, Debug)]
#[command(name = "subr")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Increase verbosity (-v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Suppress log output
    #[arg(short, long, global = true)]
    pub quiet: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Render the manifest tree with substitutions applied
    Render(RenderArgs),

    /// Show the resolved substitution set
    Substitutions(SubstitutionsArgs),

    /// Show version information
    Version(VersionArgs),
}

/// Flags shared by render and substitutions
#[derive(Args, Debug)]
pub struct CommonArgs {
    /// Root directory to operate on
    #[arg(default_value = ".")]
    pub path: PathBuf,

    /// Config file
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Regex pattern to discover substitution files
    #[arg(long)]
    pub file_regex: Option<String>,

    /// Only expose environment variables that match the given regex
    #[arg(long)]
    pub env_regex: Option<String>,

    /// Output format. One of: yaml, json
    #[arg(long)]
    pub output: Option<String>,

    /// Skip decryption (encryption probing still runs)
    #[arg(long)]
    pub skip_decrypt: bool,

    /// Skip reading decryption keys from a Secret
    #[arg(long)]
    pub skip_secret_lookup: bool,

    /// Secret name (each key within the secret is used as a decryption key)
    #[arg(long)]
    pub secret_name: Option<String>,

    /// Secret namespace
    #[arg(long)]
    pub secret_namespace: Option<String>,

    /// EJSON private key used for decryption; may be given multiple times
    #[arg(long = "ejson-key")]
    pub ejson_key: Vec<String>,

    /// Path to a kubeconfig
    #[arg(long)]
    pub kubeconfig: Option<PathBuf>,

    /// Kubernetes API URL
    #[arg(long)]
    pub kube_api: Option<String>,
}

impl CommonArgs {
    /// Flag values layered over the configuration file
    pub fn overrides(&self) -> Overrides {
        Overrides {
            file_regex: self.file_regex.clone(),
            env_regex: self.env_regex.clone(),
            output: self.output.clone(),
            skip_decrypt: self.skip_decrypt,
            skip_secret_lookup: self.skip_secret_lookup,
            secret_name: self.secret_name.clone(),
            secret_namespace: self.secret_namespace.clone(),
            ejson_keys: self.ejson_key.clone(),
            kubeconfig: self.kubeconfig.clone(),
            kube_api: self.kube_api.clone(),
        }
    }
}

#[derive(Args, Debug)]
pub struct RenderArgs {
    #[command(flatten)]
    pub common: CommonArgs,
}

#[derive(Args, Debug)]
pub struct SubstitutionsArgs {
    #[command(flatten)]
    pub common: CommonArgs,
}

#[derive(Args, Debug)]
pub struct VersionArgs {
    /// Output as JSON
    #[arg(long)]
    pub json: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_render_flags_parse() {
        let cli = Cli::parse_from([
            "subr",
            "render",
            "overlays/prod",
            "--ejson-key",
            "aaaa",
            "--ejson-key",
            "bbbb",
            "--skip-decrypt",
            "--output",
            "json",
        ]);
        let Commands::Render(args) = cli.command else {
            panic!("expected render command");
        };
        assert_eq!(args.common.path, PathBuf::from("overlays/prod"));
        assert_eq!(args.common.ejson_key, vec!["aaaa", "bbbb"]);
        assert!(args.common.skip_decrypt);
        assert_eq!(args.common.output.as_deref(), Some("json"));
    }
}
