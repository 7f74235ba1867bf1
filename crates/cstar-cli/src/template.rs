//! Starter-document generation.
//!
//! `cstar template generate` writes a minimal, valid document of the
//! requested kind plus a JSON schema next to it, as a starting point
//! for new workplans and blueprints.

use std::path::{Path, PathBuf};
use std::process::ExitCode;

use serde_json::json;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TemplateKind {
    Workplan,
    Blueprint,
}

pub fn parse_kind(s: &str) -> Result<TemplateKind, String> {
    match s.to_lowercase().as_str() {
        "workplan" => Ok(TemplateKind::Workplan),
        "blueprint" => Ok(TemplateKind::Blueprint),
        _ => Err(format!(
            "invalid template type '{s}', expected: workplan, blueprint"
        )),
    }
}

const WORKPLAN_TEMPLATE: &str = "\
name: my-workplan
description: Describe what this workplan does.
state: draft
steps:
  - name: s-00
    application: sleep
    blueprint: blueprint.yaml
  - name: s-01
    application: sleep
    blueprint: blueprint.yaml
    depends_on:
      - s-00
compute_environment:
  queue: wholenode
runtime_vars:
  - CSTAR_RUNID
";

const BLUEPRINT_TEMPLATE: &str = "\
name: my-blueprint
description: Describe what this blueprint simulates.
application: sleep
cpus_needed: 1
runtime_params:
  start_date: '2012-01-01 00:00:00'
  end_date: '2012-02-01 00:00:00'
  output_dir: .
  initial_conditions:
    location: ./initial_conditions.nc
";

fn workplan_schema() -> serde_json::Value {
    json!({
        "$schema": "https://json-schema.org/draft/2020-12/schema",
        "title": "Workplan",
        "type": "object",
        "required": ["name", "description", "steps"],
        "properties": {
            "name": {"type": "string", "minLength": 1},
            "description": {"type": "string", "minLength": 1},
            "state": {"enum": ["draft", "validated"]},
            "steps": {
                "type": "array",
                "minItems": 1,
                "items": {
                    "type": "object",
                    "required": ["name", "application", "blueprint"],
                    "properties": {
                        "name": {"type": "string", "minLength": 1},
                        "application": {"type": "string", "minLength": 1},
                        "blueprint": {"type": "string"},
                        "depends_on": {
                            "type": "array",
                            "items": {"type": "string"},
                            "uniqueItems": true
                        },
                        "blueprint_overrides": {"type": "object"},
                        "compute_overrides": {
                            "type": "object",
                            "additionalProperties": {"type": ["string", "integer"]}
                        },
                        "workflow_overrides": {
                            "type": "object",
                            "additionalProperties": {"type": ["string", "integer"]}
                        }
                    }
                }
            },
            "compute_environment": {
                "type": "object",
                "additionalProperties": {"type": ["string", "integer"]}
            },
            "runtime_vars": {
                "type": "array",
                "items": {"type": "string"},
                "uniqueItems": true
            }
        }
    })
}

fn blueprint_schema() -> serde_json::Value {
    json!({
        "$schema": "https://json-schema.org/draft/2020-12/schema",
        "title": "Blueprint",
        "type": "object",
        "required": ["name", "application", "runtime_params"],
        "properties": {
            "name": {"type": "string", "minLength": 1},
            "application": {"type": "string", "minLength": 1},
            "cpus_needed": {"type": "integer", "minimum": 1},
            "runtime_params": {
                "type": "object",
                "required": ["start_date", "end_date", "output_dir", "initial_conditions"],
                "properties": {
                    "start_date": {
                        "type": "string",
                        "pattern": "^\\d{4}-\\d{2}-\\d{2} \\d{2}:\\d{2}:\\d{2}$"
                    },
                    "end_date": {
                        "type": "string",
                        "pattern": "^\\d{4}-\\d{2}-\\d{2} \\d{2}:\\d{2}:\\d{2}$"
                    },
                    "output_dir": {"type": "string"},
                    "initial_conditions": {
                        "type": "object",
                        "required": ["location"],
                        "properties": {
                            "location": {"type": "string"}
                        }
                    }
                }
            }
        }
    })
}

/// Write the starter document and its schema, returning both paths.
pub fn write_template(kind: TemplateKind, out: &Path) -> std::io::Result<(PathBuf, PathBuf)> {
    let (document, schema) = match kind {
        TemplateKind::Workplan => (WORKPLAN_TEMPLATE, workplan_schema()),
        TemplateKind::Blueprint => (BLUEPRINT_TEMPLATE, blueprint_schema()),
    };

    if let Some(parent) = out.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    std::fs::write(out, document)?;

    let stem = out
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("template");
    let schema_path = out.with_file_name(format!("{stem}.schema.json"));
    std::fs::write(
        &schema_path,
        serde_json::to_string_pretty(&schema).unwrap_or_default(),
    )?;

    Ok((out.to_path_buf(), schema_path))
}

pub fn generate(kind: TemplateKind, out: Option<PathBuf>) -> eyre::Result<ExitCode> {
    let out = out.unwrap_or_else(|| match kind {
        TemplateKind::Workplan => PathBuf::from("workplan.yaml"),
        TemplateKind::Blueprint => PathBuf::from("blueprint.yaml"),
    });

    let (doc_path, schema_path) = write_template(kind, &out)?;
    println!("Template written to: {}", doc_path.display());
    println!("Schema written to:   {}", schema_path.display());
    Ok(ExitCode::SUCCESS)
}
