//! Command converter registry.
//!
//! A two-level table `(launcher class, application)` resolving to a
//! function that materializes a step into the command string the
//! launcher submits. The table is process-wide: defaults are installed
//! on first use and user code never re-registers at runtime. Setting
//! `CSTAR_CMD_CONVERTER_OVERRIDE` to a registered application key
//! substitutes that key's converter globally (debug knob).

use std::collections::HashMap;
use std::sync::{OnceLock, RwLock};

use rand::Rng;
use thiserror::Error;
use tracing::{debug, warn};

use cstar_core::env::{optional, ENV_CMD_CONVERTER_OVERRIDE};
use cstar_core::types::{APP_ROMS_MARBL, APP_SLEEP};
use cstar_core::{LauncherKind, Step};

/// Convert a step into a complete command string.
pub type Converter = fn(&Step) -> String;

#[derive(Debug, Error)]
pub enum ConvertError {
    #[error("no command converter registered for application `{application}` on `{launcher}` launchers")]
    UnknownApplication {
        launcher: &'static str,
        application: String,
    },
}

fn registry() -> &'static RwLock<HashMap<(LauncherKind, String), Converter>> {
    static REGISTRY: OnceLock<RwLock<HashMap<(LauncherKind, String), Converter>>> =
        OnceLock::new();
    REGISTRY.get_or_init(|| {
        let mut map: HashMap<(LauncherKind, String), Converter> = HashMap::new();
        for kind in [LauncherKind::Local, LauncherKind::Slurm, LauncherKind::Managed] {
            map.insert(
                (kind, APP_ROMS_MARBL.to_string()),
                convert_simulation_step as Converter,
            );
            map.insert(
                (kind, APP_SLEEP.to_string()),
                convert_sleep_placeholder as Converter,
            );
        }
        RwLock::new(map)
    })
}

/// Register a converter for an application on a launcher class.
///
/// Registration is idempotent: registering the same key again replaces
/// the entry.
pub fn register_converter(launcher: LauncherKind, application: &str, converter: Converter) {
    if let Ok(mut map) = registry().write() {
        map.insert((launcher, application.to_string()), converter);
    }
}

/// Resolve the converter for `(launcher, application)`.
///
/// When `CSTAR_CMD_CONVERTER_OVERRIDE` names a registered application
/// key, that key's converter is substituted.
pub fn get_converter(
    launcher: LauncherKind,
    application: &str,
) -> Result<Converter, ConvertError> {
    let map = registry().read().unwrap_or_else(std::sync::PoisonError::into_inner);

    let mut converter = map
        .get(&(launcher, application.to_string()))
        .copied()
        .ok_or_else(|| ConvertError::UnknownApplication {
            launcher: launcher.as_str(),
            application: application.to_string(),
        })?;

    if let Some(override_key) = optional(ENV_CMD_CONVERTER_OVERRIDE) {
        match map.get(&(launcher, override_key.clone())) {
            Some(substitute) => {
                debug!(
                    application,
                    %override_key, "substituting overridden step converter"
                );
                converter = *substitute;
            }
            None => {
                warn!(
                    application,
                    %override_key, "converter override is not a registered application key"
                );
            }
        }
    }

    Ok(converter)
}

/// Command invoking the simulation worker with the step's blueprint.
pub fn convert_simulation_step(step: &Step) -> String {
    format!("cstar-worker --blueprint {}", step.blueprint.display())
}

/// Placeholder shell snippet: a short random sleep with verifiable output.
///
/// Used by tests and by the converter override knob.
pub fn convert_sleep_placeholder(step: &Step) -> String {
    let sleep_time = rand::thread_rng().gen_range(1..=10);
    format!(
        "echo \"{name} started at $(date \"+%Y-%m-%d %H:%M:%S\")\";\n\
         sleep {sleep_time};\n\
         echo \"{name} completed at $(date \"+%Y-%m-%d %H:%M:%S\")\";\n",
        name = step.name,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use std::sync::{Mutex, MutexGuard};

    fn env_lock() -> MutexGuard<'static, ()> {
        static LOCK: OnceLock<Mutex<()>> = OnceLock::new();
        LOCK.get_or_init(|| Mutex::new(()))
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn step(application: &str) -> Step {
        Step {
            name: "s-00".to_string(),
            application: application.to_string(),
            blueprint: PathBuf::from("/plans/blueprint.yaml"),
            depends_on: Default::default(),
            blueprint_overrides: serde_yaml::Mapping::new(),
            compute_overrides: Default::default(),
            workflow_overrides: Default::default(),
            parent: None,
        }
    }

    #[test]
    fn defaults_cover_every_launcher_class() {
        let _guard = env_lock();
        std::env::remove_var(ENV_CMD_CONVERTER_OVERRIDE);

        for kind in [LauncherKind::Local, LauncherKind::Slurm, LauncherKind::Managed] {
            get_converter(kind, APP_ROMS_MARBL).unwrap();
            get_converter(kind, APP_SLEEP).unwrap();
        }
    }

    #[test]
    fn unknown_application_is_rejected() {
        let _guard = env_lock();
        std::env::remove_var(ENV_CMD_CONVERTER_OVERRIDE);

        let err = get_converter(LauncherKind::Local, "unknown-app").unwrap_err();
        assert!(matches!(err, ConvertError::UnknownApplication { .. }));
    }

    #[test]
    fn simulation_command_references_blueprint() {
        let cmd = convert_simulation_step(&step(APP_ROMS_MARBL));
        assert_eq!(cmd, "cstar-worker --blueprint /plans/blueprint.yaml");
    }

    #[test]
    fn sleep_placeholder_bounds_duration() {
        let cmd = convert_sleep_placeholder(&step(APP_SLEEP));
        assert!(cmd.contains("s-00 started"));
        assert!(cmd.contains("s-00 completed"));

        let sleep_line = cmd
            .lines()
            .find(|l| l.starts_with("sleep "))
            .expect("sleep line");
        let secs: u32 = sleep_line
            .trim_start_matches("sleep ")
            .trim_end_matches(';')
            .parse()
            .unwrap();
        assert!((1..=10).contains(&secs));
    }

    #[test]
    fn override_substitutes_registered_key() {
        let _guard = env_lock();
        std::env::set_var(ENV_CMD_CONVERTER_OVERRIDE, APP_SLEEP);

        let converter = get_converter(LauncherKind::Slurm, APP_ROMS_MARBL).unwrap();
        let cmd = converter(&step(APP_ROMS_MARBL));
        assert!(cmd.contains("sleep "), "override should emit the placeholder");

        std::env::remove_var(ENV_CMD_CONVERTER_OVERRIDE);
    }

    #[test]
    fn override_ignores_unregistered_key() {
        let _guard = env_lock();
        std::env::set_var(ENV_CMD_CONVERTER_OVERRIDE, "not-an-app");

        let converter = get_converter(LauncherKind::Local, APP_ROMS_MARBL).unwrap();
        let cmd = converter(&step(APP_ROMS_MARBL));
        assert!(cmd.starts_with("cstar-worker"));

        std::env::remove_var(ENV_CMD_CONVERTER_OVERRIDE);
    }

    #[test]
    fn registration_is_idempotent() {
        let _guard = env_lock();
        std::env::remove_var(ENV_CMD_CONVERTER_OVERRIDE);

        fn custom(_: &Step) -> String {
            "custom".to_string()
        }

        register_converter(LauncherKind::Local, "custom-app", custom);
        register_converter(LauncherKind::Local, "custom-app", custom);

        let converter = get_converter(LauncherKind::Local, "custom-app").unwrap();
        assert_eq!(converter(&step("custom-app")), "custom");
    }
}
