//! The `mockprep validate` command.

use std::path::PathBuf;

use anyhow::Result;

use mockprep_core::parser;

pub fn execute(plan_path: PathBuf) -> Result<()> {
    let plans = if plan_path.is_dir() {
        parser::load_plan_directory(&plan_path)?
    } else {
        vec![parser::parse_plan(&plan_path)?]
    };

    let mut total_warnings = 0;

    for plan in &plans {
        println!(
            "Plan: {} ({} sections, {} questions)",
            plan.name,
            plan.sections.len(),
            plan.len()
        );

        let warnings = parser::validate_plan(plan);
        for w in &warnings {
            let prefix = w
                .question_id
                .as_ref()
                .map(|id| format!("  [{id}]"))
                .unwrap_or_else(|| "  ".to_string());
            println!("{prefix} WARNING: {}", w.message);
        }
        total_warnings += warnings.len();
    }

    if total_warnings == 0 {
        println!("All plans valid.");
    } else {
        println!("\n{total_warnings} warning(s) found.");
    }

    Ok(())
}
