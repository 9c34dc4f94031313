//! Substitutions command

use crate::cli::SubstitutionsArgs;
use crate::output;
use anyhow::{Context, Result};
use serde_yaml_ng::Value;
use std::time::Instant;
use subr_build::Build;
use subr_core::{Configuration, OutputFormat};
use tracing::debug;

pub async fn run(args: SubstitutionsArgs) -> Result<()> {
    let start = Instant::now();

    let config = Configuration::load(
        args.common.config.as_deref(),
        &args.common.path,
        args.common.overrides(),
    )
    .context("failed loading configuration")?;
    let output_format = config.output;

    let mut build = Build::new(config).await?;
    build.build_substitutions()?;

    if let Some(substitutions) = &build.substitutions {
        if !substitutions.is_empty() {
            let doc = Value::Mapping(substitutions.values.clone());
            match output_format {
                OutputFormat::Json => output::print_json(&doc)?,
                OutputFormat::Yaml => output::print_yaml(&doc)?,
            }
        }
    }

    debug!("build time for substitutions: {:?}", start.elapsed());
    Ok(())
}
