//! Stack state file management — load, save (atomic), path derivation.

use super::error::StateError;
use super::journal::now_iso8601;
use super::types::StackState;
use std::path::{Path, PathBuf};

/// Derive the state file path for a stack within the state directory.
pub fn state_file_path(state_dir: &Path, stack: &str) -> PathBuf {
    state_dir.join(stack).join("stack.state.yaml")
}

/// Load a stack's state. Returns None if no state has been recorded yet.
pub fn load_state(state_dir: &Path, stack: &str) -> Result<Option<StackState>, StateError> {
    let path = state_file_path(state_dir, stack);
    if !path.exists() {
        return Ok(None);
    }
    let content = std::fs::read_to_string(&path).map_err(|source| StateError::Io {
        path: path.clone(),
        source,
    })?;
    let state: StackState =
        serde_yaml_ng::from_str(&content).map_err(|e| StateError::Corrupt {
            path,
            message: e.to_string(),
        })?;
    Ok(Some(state))
}

/// Save a stack's state atomically (write to temp, then rename).
pub fn save_state(state_dir: &Path, state: &StackState) -> Result<(), StateError> {
    let path = state_file_path(state_dir, &state.stack);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|source| StateError::Io {
            path: parent.to_path_buf(),
            source,
        })?;
    }

    let yaml = serde_yaml_ng::to_string(state).map_err(|e| StateError::Corrupt {
        path: path.clone(),
        message: e.to_string(),
    })?;

    let tmp_path = path.with_extension("yaml.tmp");
    std::fs::write(&tmp_path, &yaml).map_err(|source| StateError::Io {
        path: tmp_path.clone(),
        source,
    })?;
    std::fs::rename(&tmp_path, &path).map_err(|source| StateError::Io { path, source })?;

    Ok(())
}

/// Create a new empty state for a stack.
pub fn new_state(stack: &str) -> StackState {
    StackState {
        schema: "1.0".to_string(),
        stack: stack.to_string(),
        generated_at: now_iso8601(),
        generator: format!("armazon {}", env!("CARGO_PKG_VERSION")),
        resources: indexmap::IndexMap::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::{ResourceRecord, ResourceState};
    use indexmap::IndexMap;

    fn make_state() -> StackState {
        let mut state = new_state("site");
        state.resources.insert(
            "site_bucket".to_string(),
            ResourceRecord {
                resource_type: "storage_bucket".to_string(),
                status: ResourceState::Created,
                physical_id: Some("storage_bucket-0001".to_string()),
                applied_at: Some("2026-08-01T00:00:00Z".to_string()),
                properties_hash: "blake3:abc".to_string(),
                attributes: IndexMap::new(),
            },
        );
        state
    }

    #[test]
    fn test_state_file_path() {
        let p = state_file_path(Path::new("/state"), "site");
        assert_eq!(p, PathBuf::from("/state/site/stack.state.yaml"));
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        save_state(dir.path(), &make_state()).unwrap();

        let loaded = load_state(dir.path(), "site").unwrap().unwrap();
        assert_eq!(loaded.stack, "site");
        assert_eq!(loaded.resources.len(), 1);
        assert_eq!(
            loaded.resources["site_bucket"].status,
            ResourceState::Created
        );
    }

    #[test]
    fn test_load_nonexistent() {
        let dir = tempfile::tempdir().unwrap();
        assert!(load_state(dir.path(), "ghost").unwrap().is_none());
    }

    #[test]
    fn test_atomic_write_leaves_no_temp() {
        let dir = tempfile::tempdir().unwrap();
        save_state(dir.path(), &make_state()).unwrap();

        let tmp = dir.path().join("site").join("stack.state.yaml.tmp");
        assert!(!tmp.exists());
        assert!(state_file_path(dir.path(), "site").exists());
    }

    #[test]
    fn test_corrupt_state_reported() {
        let dir = tempfile::tempdir().unwrap();
        let path = state_file_path(dir.path(), "site");
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, "not: [valid: state").unwrap();
        assert!(matches!(
            load_state(dir.path(), "site"),
            Err(StateError::Corrupt { .. })
        ));
    }

    #[test]
    fn test_roundtrip_preserves_creation_order() {
        let dir = tempfile::tempdir().unwrap();
        let mut state = make_state();
        state.resources.insert(
            "aaa_later".to_string(),
            ResourceRecord {
                resource_type: "dns_record".to_string(),
                status: ResourceState::Created,
                physical_id: Some("dns_record-0002".to_string()),
                applied_at: None,
                properties_hash: "blake3:xyz".to_string(),
                attributes: IndexMap::new(),
            },
        );
        save_state(dir.path(), &state).unwrap();
        let loaded = load_state(dir.path(), "site").unwrap().unwrap();
        let keys: Vec<_> = loaded.resources.keys().collect();
        assert_eq!(keys, vec!["site_bucket", "aaa_later"]);
    }
}
