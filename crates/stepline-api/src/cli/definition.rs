//! Definition commands: publish a YAML document, validate one offline.

use std::path::Path;

use stepline_core::workflow::{load_draft, validate_draft};

use crate::state::AppState;

/// Publish a definition document as the next version of its workflow.
pub async fn publish(state: &AppState, file: &Path, json: bool) -> anyhow::Result<()> {
    let draft = load_draft(file)?;
    let definition = state.definitions.publish(draft).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&definition)?);
    } else {
        println!();
        println!(
            "  {} Published '{}' as version {}",
            console::style("✓").green().bold(),
            console::style(&definition.name).cyan(),
            console::style(definition.version).bold()
        );
        println!("  id: {}", definition.id);
        println!();
    }

    Ok(())
}

/// Validate a definition document offline. Exits non-zero when invalid,
/// printing every violation rather than stopping at the first.
pub fn validate(file: &Path, json: bool) -> anyhow::Result<()> {
    let draft = load_draft(file)?;
    let violations = validate_draft(&draft);

    if json {
        let report = serde_json::json!({
            "file": file.display().to_string(),
            "valid": violations.is_empty(),
            "violations": violations,
        });
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else if violations.is_empty() {
        println!();
        println!(
            "  {} {} is valid",
            console::style("✓").green().bold(),
            console::style(file.display()).cyan()
        );
        println!();
    } else {
        println!();
        println!(
            "  {} {} has {} violation(s):",
            console::style("✗").red().bold(),
            console::style(file.display()).cyan(),
            violations.len()
        );
        println!();
        for violation in &violations {
            println!(
                "  {} {}: {}",
                console::style("-").dim(),
                console::style(&violation.subject).yellow(),
                violation.message
            );
        }
        println!();
    }

    if violations.is_empty() {
        Ok(())
    } else {
        std::process::exit(1);
    }
}
