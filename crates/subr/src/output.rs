//! Terminal output utilities

use anyhow::Result;
use console::style;
use serde_yaml_ng::Value;

/// Print an error message
pub fn error(msg: &str) {
    eprintln!("{} {}", style("✗").red().bold(), msg);
}

/// Print one document as a YAML stream entry
pub fn print_yaml(doc: &Value) -> Result<()> {
    let rendered = serde_yaml_ng::to_string(doc)?;
    println!("---");
    print!("{}", rendered);
    Ok(())
}

/// Print one document as pretty JSON
pub fn print_json(doc: &Value) -> Result<()> {
    let rendered = serde_json::to_string_pretty(doc)?;
    println!("{}", rendered);
    Ok(())
}
