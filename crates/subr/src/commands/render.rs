//! Render command

use crate::cli::RenderArgs;
use crate::output;
use anyhow::{Context, Result};
use std::time::Instant;
use subr_build::Build;
use subr_core::{Configuration, OutputFormat};
use tracing::debug;

pub async fn run(args: RenderArgs) -> Result<()> {
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
    build.build().await?;

    for doc in &build.manifests {
        match output_format {
            OutputFormat::Json => {
                if let Err(e) = output::print_json(doc) {
                    output::error(&format!("failed to print JSON: {:#}", e));
                }
            }
            OutputFormat::Yaml => {
                if let Err(e) = output::print_yaml(doc) {
                    output::error(&format!("failed to print YAML: {:#}", e));
                }
            }
        }
    }

    let diagnostics = build.diagnostics();
    if !diagnostics.is_empty() {
        debug!("{} degraded events during build", diagnostics.len());
    }
    debug!("build time for rendering: {:?}", start.elapsed());

    Ok(())
}
