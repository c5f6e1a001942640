//! The `mockprep init` command.

use anyhow::Result;

pub fn execute() -> Result<()> {
    if std::path::Path::new("mockprep.toml").exists() {
        println!("mockprep.toml already exists, skipping.");
    } else {
        std::fs::write("mockprep.toml", SAMPLE_CONFIG)?;
        println!("Created mockprep.toml");
    }

    std::fs::create_dir_all("plans")?;
    let example_path = std::path::Path::new("plans/example.toml");
    if example_path.exists() {
        println!("plans/example.toml already exists, skipping.");
    } else {
        std::fs::write(example_path, EXAMPLE_PLAN)?;
        println!("Created plans/example.toml");
    }

    println!("\nNext steps:");
    println!("  1. Point [scorer] in mockprep.toml at your scoring service, or keep the mock");
    println!("  2. Run: mockprep validate --plan plans/example.toml");
    println!("  3. Run: mockprep run --plan plans/example.toml");

    Ok(())
}

const SAMPLE_CONFIG: &str = r#"# mockprep configuration

[scorer]
type = "mock"

# [scorer]
# type = "http"
# base_url = "https://scoring.example.com"
# api_key = "${MOCKPREP_SCORER_KEY}"
# timeout_secs = 30

[queue]
base_delay_ms = 2000
max_delay_ms = 60000
max_retries = 8
max_in_flight = 4

[session]
tick_interval_ms = 1000
state_dir = "./mockprep-state"
"#;

const EXAMPLE_PLAN: &str = r#"[plan]
id = "example"
name = "Example Mock Test"
description = "A short writing and reading drill to get started"

[[sections]]
name = "writing"
kind = "writing"
break_after_ms = 30000

[[sections.attempts]]
question_id = "w1-describe-chart"
prep_ms = 10000
answer_ms = 120000

[[sections.attempts]]
question_id = "w2-opinion"
answer_ms = 180000

[[sections]]
name = "reading"
kind = "reading"

[[sections.attempts]]
question_id = "r1-main-idea"
answer_ms = 60000
"#;
