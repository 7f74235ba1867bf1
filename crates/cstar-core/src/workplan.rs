//! Workplan and step records.
//!
//! A workplan is the user-declared set of steps plus the shared compute
//! configuration needed to run them. Documents are YAML or JSON; see
//! [`crate::serialization`]. Structural checks beyond what serde can
//! express live in [`Workplan::validate`]; cycle detection is the
//! planner's job.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::slug::slugify;
use crate::types::WorkplanState;

/// A scalar configuration value: string or integer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ConfigValue {
    Int(i64),
    Str(String),
}

impl std::fmt::Display for ConfigValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Int(v) => write!(f, "{v}"),
            Self::Str(v) => f.write_str(v),
        }
    }
}

/// Structural validation failures, with the offending field spelled out.
#[derive(Debug, Error)]
pub enum ModelError {
    #[error("field `{0}` must be a non-empty string")]
    EmptyField(&'static str),
    #[error("workplan must declare at least one step")]
    NoSteps,
    #[error("duplicate step name: `{0}`")]
    DuplicateStep(String),
    #[error("step `{step}` depends on unknown step `{dependency}`")]
    UnknownDependency { step: String, dependency: String },
    #[error("step `{step}` depends on itself")]
    SelfDependency { step: String },
    #[error("step `{step}` references missing blueprint `{path}`")]
    MissingBlueprint { step: String, path: PathBuf },
}

/// An individual unit of execution within a workplan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Step {
    /// User-friendly name; unique within the workplan.
    pub name: String,
    /// Application executed by the step; must resolve in the converter
    /// registry for the launcher used.
    pub application: String,
    /// Path to the blueprint executed by this step.
    pub blueprint: PathBuf,
    /// Names of steps that must run before this one.
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub depends_on: BTreeSet<String>,
    /// Overrides merged into the blueprint at plan time. Values may nest
    /// (e.g. `runtime_params.start_date`).
    #[serde(default, skip_serializing_if = "serde_yaml::Mapping::is_empty")]
    pub blueprint_overrides: serde_yaml::Mapping,
    /// Overrides for compute attributes.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub compute_overrides: BTreeMap<String, ConfigValue>,
    /// Overrides for workflow attributes.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub workflow_overrides: BTreeMap<String, ConfigValue>,
    /// Name of the originating step, set on derived child steps.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<String>,
}

impl Step {
    /// A path- and job-name-safe form of the step name.
    pub fn safe_name(&self) -> String {
        slugify(&self.name)
    }
}

/// A set of executable steps and the configuration to run them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Workplan {
    /// User-friendly name of the workplan.
    pub name: String,
    /// User-friendly description.
    pub description: String,
    /// The steps to execute, in declaration order.
    pub steps: Vec<Step>,
    /// Validation state of the document.
    #[serde(default)]
    pub state: WorkplanState,
    /// Defaults applied to every step unless overridden.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub compute_environment: BTreeMap<String, ConfigValue>,
    /// Environment variable names that must be set before execution.
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub runtime_vars: BTreeSet<String>,
}

impl Workplan {
    /// Check the invariants the document format cannot express.
    ///
    /// `base_dir` anchors relative blueprint paths when checking that the
    /// referenced files exist.
    pub fn validate(&self, base_dir: &Path) -> Result<(), ModelError> {
        if self.name.trim().is_empty() {
            return Err(ModelError::EmptyField("name"));
        }
        if self.description.trim().is_empty() {
            return Err(ModelError::EmptyField("description"));
        }
        if self.steps.is_empty() {
            return Err(ModelError::NoSteps);
        }

        let mut seen: BTreeSet<&str> = BTreeSet::new();
        for step in &self.steps {
            if step.name.trim().is_empty() {
                return Err(ModelError::EmptyField("steps[].name"));
            }
            if step.application.trim().is_empty() {
                return Err(ModelError::EmptyField("steps[].application"));
            }
            if !seen.insert(step.name.as_str()) {
                return Err(ModelError::DuplicateStep(step.name.clone()));
            }

            let bp_path = if step.blueprint.is_absolute() {
                step.blueprint.clone()
            } else {
                base_dir.join(&step.blueprint)
            };
            if !bp_path.exists() {
                return Err(ModelError::MissingBlueprint {
                    step: step.name.clone(),
                    path: bp_path,
                });
            }
        }

        for step in &self.steps {
            for dep in &step.depends_on {
                if dep == &step.name {
                    return Err(ModelError::SelfDependency {
                        step: step.name.clone(),
                    });
                }
                if !seen.contains(dep.as_str()) {
                    return Err(ModelError::UnknownDependency {
                        step: step.name.clone(),
                        dependency: dep.clone(),
                    });
                }
            }
        }

        Ok(())
    }

    /// Look up a step by name.
    pub fn step(&self, name: &str) -> Option<&Step> {
        self.steps.iter().find(|s| s.name == name)
    }

    /// Return a copy with the step list replaced.
    pub fn with_steps(&self, steps: Vec<Step>) -> Self {
        Self {
            steps,
            ..self.clone()
        }
    }
}
