//! TOML test plan parser.
//!
//! Loads test plans from TOML files and directories, and validates them.

use std::collections::HashSet;
use std::path::Path;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::model::{AttemptSpec, PayloadKind, Section, SectionKind, TestPlan};

/// Intermediate TOML structure for parsing plan files.
#[derive(Debug, Deserialize)]
struct TomlPlanFile {
    plan: TomlPlanHeader,
    #[serde(default)]
    sections: Vec<TomlSection>,
}

#[derive(Debug, Deserialize)]
struct TomlPlanHeader {
    id: String,
    name: String,
    #[serde(default)]
    description: String,
}

#[derive(Debug, Deserialize)]
struct TomlSection {
    name: String,
    kind: String,
    #[serde(default)]
    break_after_ms: Option<u64>,
    /// Payload kind for attempts that don't name one.
    #[serde(default)]
    payload: Option<String>,
    #[serde(default)]
    attempts: Vec<TomlAttempt>,
}

#[derive(Debug, Deserialize)]
struct TomlAttempt {
    question_id: String,
    #[serde(default)]
    prep_ms: u64,
    answer_ms: u64,
    #[serde(default)]
    payload: Option<String>,
}

fn default_payload(kind: SectionKind) -> PayloadKind {
    match kind {
        SectionKind::Speaking => PayloadKind::Audio,
        SectionKind::Writing => PayloadKind::Text,
        SectionKind::Reading | SectionKind::Listening => PayloadKind::Structured,
    }
}

/// Parse a single TOML file into a `TestPlan`.
pub fn parse_plan(path: &Path) -> Result<TestPlan> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read plan file: {}", path.display()))?;

    parse_plan_str(&content, path)
}

/// Parse a TOML string into a `TestPlan` (useful for testing).
pub fn parse_plan_str(content: &str, source_path: &Path) -> Result<TestPlan> {
    let parsed: TomlPlanFile = toml::from_str(content)
        .with_context(|| format!("failed to parse TOML: {}", source_path.display()))?;

    let sections = parsed
        .sections
        .into_iter()
        .map(|s| {
            let kind: SectionKind = s
                .kind
                .parse()
                .map_err(|e: String| anyhow::anyhow!("section '{}': {}", s.name, e))?;
            let section_payload = s
                .payload
                .map(|p| p.parse::<PayloadKind>())
                .transpose()
                .map_err(|e| anyhow::anyhow!("section '{}': {}", s.name, e))?
                .unwrap_or_else(|| default_payload(kind));

            let attempts = s
                .attempts
                .into_iter()
                .map(|a| {
                    let payload_kind = a
                        .payload
                        .map(|p| p.parse::<PayloadKind>())
                        .transpose()
                        .map_err(|e| anyhow::anyhow!("question '{}': {}", a.question_id, e))?
                        .unwrap_or(section_payload);
                    Ok(AttemptSpec {
                        question_id: a.question_id,
                        section_kind: kind,
                        prep_duration_ms: a.prep_ms,
                        answer_duration_ms: a.answer_ms,
                        payload_kind,
                    })
                })
                .collect::<Result<Vec<_>>>()?;

            Ok(Section {
                name: s.name,
                kind,
                break_after_ms: s.break_after_ms,
                attempts,
            })
        })
        .collect::<Result<Vec<_>>>()?;

    Ok(TestPlan {
        id: parsed.plan.id,
        name: parsed.plan.name,
        description: parsed.plan.description,
        sections,
    })
}

/// Recursively load all `.toml` plan files from a directory.
pub fn load_plan_directory(dir: &Path) -> Result<Vec<TestPlan>> {
    let mut plans = Vec::new();

    if !dir.is_dir() {
        anyhow::bail!("not a directory: {}", dir.display());
    }

    for entry in std::fs::read_dir(dir)
        .with_context(|| format!("failed to read directory: {}", dir.display()))?
    {
        let entry = entry?;
        let path = entry.path();

        if path.is_dir() {
            plans.extend(load_plan_directory(&path)?);
        } else if path.extension().is_some_and(|ext| ext == "toml") {
            match parse_plan(&path) {
                Ok(plan) => plans.push(plan),
                Err(e) => {
                    tracing::warn!("skipping {}: {}", path.display(), e);
                }
            }
        }
    }

    Ok(plans)
}

/// A warning from plan validation.
#[derive(Debug, Clone)]
pub struct ValidationWarning {
    /// The question ID (if applicable).
    pub question_id: Option<String>,
    /// Warning message.
    pub message: String,
}

/// Validate a test plan for common issues.
pub fn validate_plan(plan: &TestPlan) -> Vec<ValidationWarning> {
    let mut warnings = Vec::new();

    // Question ids key checkpoints, so they must be unique.
    let mut seen_ids = HashSet::new();
    for attempt in plan.attempts() {
        if !seen_ids.insert(&attempt.question_id) {
            warnings.push(ValidationWarning {
                question_id: Some(attempt.question_id.clone()),
                message: format!("duplicate question ID: {}", attempt.question_id),
            });
        }
    }

    for section in &plan.sections {
        if section.attempts.is_empty() {
            warnings.push(ValidationWarning {
                question_id: None,
                message: format!("section '{}' has no questions", section.name),
            });
        }
    }

    for attempt in plan.attempts() {
        if attempt.answer_duration_ms == 0 {
            warnings.push(ValidationWarning {
                question_id: Some(attempt.question_id.clone()),
                message: "answer window is zero; the attempt expires immediately".into(),
            });
        }
    }

    if let Some(last) = plan.sections.last() {
        if last.break_after_ms.is_some_and(|ms| ms > 0) {
            warnings.push(ValidationWarning {
                question_id: None,
                message: format!(
                    "break after final section '{}' will be ignored",
                    last.name
                ),
            });
        }
    }

    warnings
}
