pub mod blueprint;
pub mod env;
pub mod layout;
pub mod serialization;
pub mod slug;
pub mod types;
pub mod workplan;

pub use blueprint::{Blueprint, InitialConditions, RuntimeParams};
pub use layout::RunLayout;
pub use serialization::{load, store, PersistenceMode, SerializationError};
pub use slug::slugify;
pub use types::{LauncherKind, RunMode, Status, WorkplanState};
pub use workplan::{ConfigValue, ModelError, Step, Workplan};
