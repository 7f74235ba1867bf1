//! Document loading and storing for workplans and blueprints.
//!
//! YAML is the canonical form; JSON is accepted as an equivalent
//! encoding. `Auto` selects the engine from the file extension.

use std::path::Path;

use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;

/// Supported serialization engines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PersistenceMode {
    Yaml,
    Json,
    #[default]
    Auto,
}

#[derive(Debug, Error)]
pub enum SerializationError {
    #[error("document not found at `{0}`")]
    NotFound(std::path::PathBuf),
    #[error("unable to select a serializer for `{path}` (extension `{extension}`)")]
    UnknownFormat {
        path: std::path::PathBuf,
        extension: String,
    },
    #[error("io error reading `{path}`: {source}")]
    Io {
        path: std::path::PathBuf,
        source: std::io::Error,
    },
    #[error("invalid yaml in `{path}`: {source}")]
    Yaml {
        path: std::path::PathBuf,
        source: serde_yaml::Error,
    },
    #[error("invalid json in `{path}`: {source}")]
    Json {
        path: std::path::PathBuf,
        source: serde_json::Error,
    },
}

fn resolve_mode(path: &Path, mode: PersistenceMode) -> Result<PersistenceMode, SerializationError> {
    if mode != PersistenceMode::Auto {
        return Ok(mode);
    }

    let extension = path
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or_default()
        .to_ascii_lowercase();

    match extension.as_str() {
        "yaml" | "yml" => Ok(PersistenceMode::Yaml),
        "json" => Ok(PersistenceMode::Json),
        _ => Err(SerializationError::UnknownFormat {
            path: path.to_path_buf(),
            extension,
        }),
    }
}

/// Deserialize a document from disk.
pub fn load<T: DeserializeOwned>(
    path: &Path,
    mode: PersistenceMode,
) -> Result<T, SerializationError> {
    if !path.exists() {
        return Err(SerializationError::NotFound(path.to_path_buf()));
    }

    let content = std::fs::read_to_string(path).map_err(|source| SerializationError::Io {
        path: path.to_path_buf(),
        source,
    })?;

    match resolve_mode(path, mode)? {
        PersistenceMode::Json => {
            serde_json::from_str(&content).map_err(|source| SerializationError::Json {
                path: path.to_path_buf(),
                source,
            })
        }
        _ => serde_yaml::from_str(&content).map_err(|source| SerializationError::Yaml {
            path: path.to_path_buf(),
            source,
        }),
    }
}

/// Serialize a document to disk, creating parent directories as needed.
///
/// `Auto` resolves to YAML on store.
pub fn store<T: Serialize>(
    path: &Path,
    model: &T,
    mode: PersistenceMode,
) -> Result<(), SerializationError> {
    let mode = match resolve_mode(path, mode) {
        Ok(m) => m,
        // Extension does not pick an engine; fall back to the canonical form.
        Err(SerializationError::UnknownFormat { .. }) => PersistenceMode::Yaml,
        Err(other) => return Err(other),
    };

    let document = match mode {
        PersistenceMode::Json => {
            serde_json::to_string_pretty(model).map_err(|source| SerializationError::Json {
                path: path.to_path_buf(),
                source,
            })?
        }
        _ => serde_yaml::to_string(model).map_err(|source| SerializationError::Yaml {
            path: path.to_path_buf(),
            source,
        })?,
    };

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|source| SerializationError::Io {
            path: path.to_path_buf(),
            source,
        })?;
    }

    std::fs::write(path, document).map_err(|source| SerializationError::Io {
        path: path.to_path_buf(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use tempfile::TempDir;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Doc {
        name: String,
        count: u32,
    }

    fn doc() -> Doc {
        Doc {
            name: "sample".to_string(),
            count: 3,
        }
    }

    #[test]
    fn yaml_round_trip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("doc.yaml");
        store(&path, &doc(), PersistenceMode::Auto).unwrap();
        let loaded: Doc = load(&path, PersistenceMode::Auto).unwrap();
        assert_eq!(loaded, doc());
    }

    #[test]
    fn json_round_trip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("doc.json");
        store(&path, &doc(), PersistenceMode::Auto).unwrap();
        let loaded: Doc = load(&path, PersistenceMode::Auto).unwrap();
        assert_eq!(loaded, doc());
    }

    #[test]
    fn yml_extension_selects_yaml() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("doc.yml");
        store(&path, &doc(), PersistenceMode::Auto).unwrap();
        let loaded: Doc = load(&path, PersistenceMode::Auto).unwrap();
        assert_eq!(loaded, doc());
    }

    #[test]
    fn missing_file_is_not_found() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("absent.yaml");
        let err = load::<Doc>(&path, PersistenceMode::Auto).unwrap_err();
        assert!(matches!(err, SerializationError::NotFound(_)));
    }

    #[test]
    fn unknown_extension_rejected_on_load() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("doc.txt");
        std::fs::write(&path, "name: sample\ncount: 3\n").unwrap();
        let err = load::<Doc>(&path, PersistenceMode::Auto).unwrap_err();
        assert!(matches!(err, SerializationError::UnknownFormat { .. }));
    }

    #[test]
    fn explicit_mode_overrides_extension() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("doc.txt");
        std::fs::write(&path, "name: sample\ncount: 3\n").unwrap();
        let loaded: Doc = load(&path, PersistenceMode::Yaml).unwrap();
        assert_eq!(loaded, doc());
    }

    #[test]
    fn store_creates_parent_directories() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested/deeper/doc.yaml");
        store(&path, &doc(), PersistenceMode::Auto).unwrap();
        assert!(path.exists());
    }
}
