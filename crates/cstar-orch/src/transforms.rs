//! Workplan transformation pipeline.
//!
//! Transforms are pure rewrites of `Step -> [Step]` applied over a
//! workplan before planning; the input plan is never mutated. The two
//! reference transforms are the calendar-month time splitter and the
//! override injector that materializes `blueprint_overrides` into
//! derived blueprint files.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock, RwLock};

use chrono::{Datelike, NaiveDate, NaiveDateTime};
use thiserror::Error;
use tracing::debug;

use cstar_core::blueprint::COMPACT_DATE_FORMAT;
use cstar_core::env::{optional, ENV_ORCH_TRX_FREQ};
use cstar_core::serialization::{load, store, PersistenceMode, SerializationError};
use cstar_core::types::APP_ROMS_MARBL;
use cstar_core::{slugify, Blueprint, Step, Workplan};

#[derive(Debug, Error)]
pub enum TransformError {
    #[error(transparent)]
    Serialization(#[from] SerializationError),
    #[error("end_date must be after start_date (got {start} .. {end})")]
    InvalidTimeRange {
        start: NaiveDateTime,
        end: NaiveDateTime,
    },
    #[error("blueprint `{0}` is not a mapping document")]
    NotAMapping(PathBuf),
}

/// A pure rewrite of one step into one or more derived steps.
pub trait Transform: Send + Sync {
    fn apply(&self, step: &Step) -> Result<Vec<Step>, TransformError>;
}

/// Time span selector for the time splitter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SplitFrequency {
    #[default]
    Monthly,
}

impl SplitFrequency {
    /// Read the frequency from `CSTAR_ORCH_TRX_FREQ` (defaults to monthly).
    pub fn from_env() -> Self {
        match optional(ENV_ORCH_TRX_FREQ).as_deref() {
            Some("monthly") | None => Self::Monthly,
            Some(other) => {
                tracing::warn!(value = other, "unknown split frequency; using monthly");
                Self::Monthly
            }
        }
    }
}

fn registry() -> &'static RwLock<HashMap<String, Vec<Arc<dyn Transform>>>> {
    static REGISTRY: OnceLock<RwLock<HashMap<String, Vec<Arc<dyn Transform>>>>> = OnceLock::new();
    REGISTRY.get_or_init(|| {
        let mut map: HashMap<String, Vec<Arc<dyn Transform>>> = HashMap::new();
        map.insert(
            APP_ROMS_MARBL.to_string(),
            vec![Arc::new(TimeSplitter::new(SplitFrequency::from_env()))],
        );
        RwLock::new(map)
    })
}

/// Register a transform for an application.
pub fn register_transform(application: &str, transform: Arc<dyn Transform>) {
    if let Ok(mut map) = registry().write() {
        map.entry(application.to_string()).or_default().push(transform);
    }
}

/// The transforms registered for an application (possibly empty).
pub fn get_transforms(application: &str) -> Vec<Arc<dyn Transform>> {
    registry()
        .read()
        .unwrap_or_else(std::sync::PoisonError::into_inner)
        .get(application)
        .cloned()
        .unwrap_or_default()
}

/// First day of the month after `(year, month)` at midnight.
fn next_month_start(year: i32, month: u32) -> NaiveDateTime {
    let (year, month) = if month == 12 {
        (year + 1, 1)
    } else {
        (year, month + 1)
    };
    NaiveDate::from_ymd_opt(year, month, 1)
        .unwrap_or(NaiveDate::MIN)
        .and_hms_opt(0, 0, 0)
        .unwrap_or_default()
}

/// Partition `[start, end]` into calendar-month slices.
///
/// The first slice begins at `start`, the last ends at `end`; interior
/// boundaries fall on the first of the month at midnight.
pub fn get_time_slices(
    start: NaiveDateTime,
    end: NaiveDateTime,
) -> Result<Vec<(NaiveDateTime, NaiveDateTime)>, TransformError> {
    if end <= start {
        return Err(TransformError::InvalidTimeRange { start, end });
    }

    let mut slices = Vec::new();
    let mut current = NaiveDate::from_ymd_opt(start.year(), start.month(), 1)
        .unwrap_or(NaiveDate::MIN)
        .and_hms_opt(0, 0, 0)
        .unwrap_or_default();

    while current < end {
        let month_end = next_month_start(current.year(), current.month());
        slices.push((current, month_end));
        current = month_end;
    }

    if let Some(first) = slices.first_mut() {
        if start > first.0 {
            first.0 = start;
        }
    }
    if let Some(last) = slices.last_mut() {
        if end < last.1 {
            last.1 = end;
        }
    }

    Ok(slices)
}

/// Splits a time-ranged step into monthly sub-steps with chained restart
/// files.
///
/// Each child carries the slice window and a per-slice output directory
/// in its `blueprint_overrides`, depends on the previous child, and (from
/// the second slice on) reads its initial conditions from the
/// predecessor's restart path.
#[derive(Debug, Clone, Default)]
pub struct TimeSplitter {
    frequency: SplitFrequency,
}

impl TimeSplitter {
    pub fn new(frequency: SplitFrequency) -> Self {
        Self { frequency }
    }

    fn runtime_overrides(
        start: NaiveDateTime,
        end: NaiveDateTime,
        output_dir: &Path,
    ) -> serde_yaml::Mapping {
        let runtime = serde_yaml::to_value(serde_yaml::Mapping::from_iter([
            (
                serde_yaml::Value::from("start_date"),
                serde_yaml::Value::from(start.format(cstar_core::blueprint::DATE_FORMAT).to_string()),
            ),
            (
                serde_yaml::Value::from("end_date"),
                serde_yaml::Value::from(end.format(cstar_core::blueprint::DATE_FORMAT).to_string()),
            ),
            (
                serde_yaml::Value::from("output_dir"),
                serde_yaml::Value::from(output_dir.to_string_lossy().into_owned()),
            ),
        ]))
        .unwrap_or_default();

        serde_yaml::Mapping::from_iter([(serde_yaml::Value::from("runtime_params"), runtime)])
    }

    fn initial_conditions_override(restart: &Path) -> serde_yaml::Mapping {
        let location = serde_yaml::Mapping::from_iter([(
            serde_yaml::Value::from("location"),
            serde_yaml::Value::from(restart.to_string_lossy().into_owned()),
        )]);
        let runtime = serde_yaml::Mapping::from_iter([(
            serde_yaml::Value::from("initial_conditions"),
            serde_yaml::Value::Mapping(location),
        )]);
        serde_yaml::Mapping::from_iter([(
            serde_yaml::Value::from("runtime_params"),
            serde_yaml::Value::Mapping(runtime),
        )])
    }
}

impl Transform for TimeSplitter {
    fn apply(&self, step: &Step) -> Result<Vec<Step>, TransformError> {
        let SplitFrequency::Monthly = self.frequency;

        let blueprint: Blueprint = load(&step.blueprint, PersistenceMode::Auto)?;
        let start = blueprint.runtime_params.start_date;
        let end = blueprint.runtime_params.end_date;
        let output_root = blueprint.runtime_params.output_dir.clone();

        let slices = get_time_slices(start, end)?;

        let mut children = Vec::with_capacity(slices.len());
        let mut depends_on = step.depends_on.clone();
        let mut last_restart: Option<PathBuf> = None;

        for (slice_start, slice_end) in slices {
            let compact_start = slice_start.format(COMPACT_DATE_FORMAT);
            let compact_end = slice_end.format(COMPACT_DATE_FORMAT);
            let child_name = slugify(&format!("{}_{compact_start}-{compact_end}", step.name));
            let child_output = output_root.join(&child_name);

            let mut overrides = serde_yaml::Value::Mapping(step.blueprint_overrides.clone());
            deep_merge(
                &mut overrides,
                &serde_yaml::Value::Mapping(Self::runtime_overrides(
                    slice_start,
                    slice_end,
                    &child_output,
                )),
            );
            if let Some(restart) = &last_restart {
                deep_merge(
                    &mut overrides,
                    &serde_yaml::Value::Mapping(Self::initial_conditions_override(restart)),
                );
            }

            let child = Step {
                name: child_name.clone(),
                depends_on: depends_on.clone(),
                blueprint_overrides: match overrides {
                    serde_yaml::Value::Mapping(m) => m,
                    _ => serde_yaml::Mapping::new(),
                },
                parent: Some(step.name.clone()),
                ..step.clone()
            };

            // Chain: the next slice depends on this one and reads its
            // restart file, stamped with this slice's start date.
            depends_on = [child_name].into_iter().collect();
            last_restart = Some(Blueprint::restart_pattern(&child_output, slice_start));

            children.push(child);
        }

        Ok(children)
    }
}

/// Materializes a step's `blueprint_overrides` into a derived blueprint
/// file and repoints the step at it.
#[derive(Debug, Clone, Default)]
pub struct OverrideTransform;

impl Transform for OverrideTransform {
    fn apply(&self, step: &Step) -> Result<Vec<Step>, TransformError> {
        if step.blueprint_overrides.is_empty() {
            return Ok(vec![step.clone()]);
        }

        let mut document: serde_yaml::Value = load(&step.blueprint, PersistenceMode::Auto)?;
        if !document.is_mapping() {
            return Err(TransformError::NotAMapping(step.blueprint.clone()));
        }
        deep_merge(
            &mut document,
            &serde_yaml::Value::Mapping(step.blueprint_overrides.clone()),
        );

        let derived = derived_path(&step.blueprint, &step.safe_name());
        store(&derived, &document, PersistenceMode::Yaml)?;
        debug!(step = %step.name, blueprint = %derived.display(), "materialized blueprint overrides");

        Ok(vec![Step {
            blueprint: derived,
            blueprint_overrides: serde_yaml::Mapping::new(),
            ..step.clone()
        }])
    }
}

/// Recursively merge `overlay` into `base`; non-mapping values replace.
pub fn deep_merge(base: &mut serde_yaml::Value, overlay: &serde_yaml::Value) {
    match (base, overlay) {
        (serde_yaml::Value::Mapping(base_map), serde_yaml::Value::Mapping(overlay_map)) => {
            for (key, value) in overlay_map {
                match base_map.get_mut(key) {
                    Some(existing) => deep_merge(existing, value),
                    None => {
                        base_map.insert(key.clone(), value.clone());
                    }
                }
            }
        }
        (base, overlay) => *base = overlay.clone(),
    }
}

/// Sibling path derived from `path` with a suffix appended to the stem.
pub fn derived_path(path: &Path, suffix: &str) -> PathBuf {
    let stem = path
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("derived");
    let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("yaml");
    path.with_file_name(format!("{stem}_{suffix}.{ext}"))
}

/// Applies a transform chain over every step of a workplan and emits the
/// result as a new workplan document.
pub struct WorkplanTransformer {
    extra: Vec<Arc<dyn Transform>>,
}

impl WorkplanTransformer {
    /// A transformer that runs each step's registered application
    /// transforms followed by the given extra transforms.
    pub fn new(extra: Vec<Arc<dyn Transform>>) -> Self {
        Self { extra }
    }

    /// The default pipeline: registered transforms, then override
    /// materialization.
    pub fn standard() -> Self {
        Self::new(vec![Arc::new(OverrideTransform)])
    }

    /// Rewrite the workplan. The input is left untouched.
    pub fn apply(&self, workplan: &Workplan) -> Result<Workplan, TransformError> {
        let mut steps = Vec::new();

        for step in &workplan.steps {
            let mut current = vec![step.clone()];
            let chain = get_transforms(&step.application)
                .into_iter()
                .chain(self.extra.iter().cloned());

            for transform in chain {
                let mut next = Vec::new();
                for item in &current {
                    next.extend(transform.apply(item)?);
                }
                current = next;
            }
            steps.extend(current);
        }

        Ok(workplan.with_steps(steps))
    }

    /// Rewrite the workplan and emit it next to `path` with the given
    /// stem suffix, returning the rewritten plan and its new path.
    pub fn apply_and_emit(
        &self,
        workplan: &Workplan,
        path: &Path,
        suffix: &str,
    ) -> Result<(Workplan, PathBuf), TransformError> {
        let transformed = self.apply(workplan)?;
        let out_path = derived_path(path, suffix);
        store(&out_path, &transformed, PersistenceMode::Yaml)?;
        Ok((transformed, out_path))
    }
}
