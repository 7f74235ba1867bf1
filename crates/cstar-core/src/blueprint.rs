//! Typed view over blueprint documents.
//!
//! Blueprints are opaque to the orchestrator except for the handful of
//! attributes read by core logic: the runtime window, the output
//! directory, the initial-conditions location, and the cpu count. All
//! other keys are preserved verbatim so that rewritten blueprints
//! round-trip without loss.

use std::path::{Path, PathBuf};

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};

/// Timestamp format used throughout blueprint documents (second precision).
pub const DATE_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Compact timestamp form used in derived step names and restart files.
pub const COMPACT_DATE_FORMAT: &str = "%Y%m%d%H%M%S";

pub mod date_format {
    //! Serde adapter for `YYYY-mm-dd HH:MM:SS` timestamps.

    use chrono::NaiveDateTime;
    use serde::{self, Deserialize, Deserializer, Serializer};

    use super::DATE_FORMAT;

    pub fn serialize<S: Serializer>(
        date: &NaiveDateTime,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&date.format(DATE_FORMAT).to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<NaiveDateTime, D::Error> {
        let raw = String::deserialize(deserializer)?;
        NaiveDateTime::parse_from_str(&raw, DATE_FORMAT).map_err(serde::de::Error::custom)
    }
}

/// Where a simulation reads its initial state from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InitialConditions {
    /// Local path, glob, or URL of the initial-conditions data.
    pub location: String,
    #[serde(flatten)]
    pub extra: serde_yaml::Mapping,
}

/// The runtime window and output configuration of a simulation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuntimeParams {
    #[serde(with = "date_format")]
    pub start_date: NaiveDateTime,
    #[serde(with = "date_format")]
    pub end_date: NaiveDateTime,
    pub output_dir: PathBuf,
    pub initial_conditions: InitialConditions,
    #[serde(flatten)]
    pub extra: serde_yaml::Mapping,
}

/// The blueprint attributes read by core logic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Blueprint {
    pub name: String,
    pub application: String,
    pub runtime_params: RuntimeParams,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpus_needed: Option<u32>,
    #[serde(flatten)]
    pub extra: serde_yaml::Mapping,
}

impl Blueprint {
    /// Glob matching the restart files a run writes under its output
    /// directory. Restart files are stamped with the compact form of the
    /// run's start date: `<output_dir>/outputs/*_rst.<stamp>.*.nc`.
    pub fn restart_pattern(output_dir: &Path, stamp_at: NaiveDateTime) -> PathBuf {
        let stamp = stamp_at.format(COMPACT_DATE_FORMAT);
        output_dir.join("outputs").join(format!("*_rst.{stamp}.*.nc"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    const SAMPLE: &str = "\
name: test-bp
application: roms_marbl
cpus_needed: 16
runtime_params:
  start_date: '2012-01-03 12:00:00'
  end_date: '2012-04-15 00:00:00'
  output_dir: /data/run
  time_step: 60
  initial_conditions:
    location: http://mockdoc.com/grid
    hash: abc123
grid:
  location: /data/grid.nc
";

    #[test]
    fn parses_core_attributes() {
        let bp: Blueprint = serde_yaml::from_str(SAMPLE).unwrap();
        assert_eq!(bp.name, "test-bp");
        assert_eq!(bp.application, "roms_marbl");
        assert_eq!(bp.cpus_needed, Some(16));
        assert_eq!(
            bp.runtime_params.start_date,
            NaiveDate::from_ymd_opt(2012, 1, 3)
                .unwrap()
                .and_hms_opt(12, 0, 0)
                .unwrap()
        );
        assert_eq!(bp.runtime_params.output_dir, PathBuf::from("/data/run"));
        assert_eq!(
            bp.runtime_params.initial_conditions.location,
            "http://mockdoc.com/grid"
        );
    }

    #[test]
    fn preserves_opaque_keys_on_round_trip() {
        let bp: Blueprint = serde_yaml::from_str(SAMPLE).unwrap();
        let emitted = serde_yaml::to_string(&bp).unwrap();
        let reparsed: Blueprint = serde_yaml::from_str(&emitted).unwrap();

        assert_eq!(bp, reparsed);
        assert!(emitted.contains("grid:"));
        assert!(emitted.contains("time_step: 60"));
        assert!(emitted.contains("hash: abc123"));
    }

    #[test]
    fn dates_serialize_in_document_format() {
        let bp: Blueprint = serde_yaml::from_str(SAMPLE).unwrap();
        let emitted = serde_yaml::to_string(&bp).unwrap();
        assert!(emitted.contains("2012-01-03 12:00:00"));
        assert!(emitted.contains("2012-04-15 00:00:00"));
    }

    #[test]
    fn restart_pattern_uses_compact_stamp() {
        let at = NaiveDate::from_ymd_opt(2012, 2, 1)
            .unwrap()
            .and_hms_opt(0, 0, 0)
            .unwrap();
        let pattern = Blueprint::restart_pattern(Path::new("/data/run"), at);
        assert_eq!(
            pattern,
            PathBuf::from("/data/run/outputs/*_rst.20120201000000.*.nc")
        );
    }

    #[test]
    fn rejects_malformed_dates() {
        let doc = SAMPLE.replace("2012-01-03 12:00:00", "not-a-date");
        assert!(serde_yaml::from_str::<Blueprint>(&doc).is_err());
    }
}
