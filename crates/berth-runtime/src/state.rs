//! The stager's state artifact.
//!
//! Written before any app process exists and rewritten at each milestone,
//! so that a stager that dies between steps leaves a record of how far it
//! got and which processes it had started.

use std::collections::BTreeMap;
use std::path::Path;

use berth_common::error::{BerthError, Result};
use berth_common::types::ContainerId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// How far the bootstrap sequence got.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StagerPhase {
    /// Manifest read, nothing tracked yet.
    Setup,
    /// App tracking populated.
    Populated,
    /// Every app process was started.
    Running,
    /// Apps are being stopped.
    ShuttingDown,
}

/// Tracking record for one app.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppState {
    /// Host PID once started.
    pub pid: Option<u32>,
    /// Exit code once exited.
    pub exit_code: Option<i32>,
}

/// Persistent record of a stager's progress.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StagerState {
    /// Container identifier.
    pub uuid: ContainerId,
    /// Last completed milestone.
    pub phase: StagerPhase,
    /// Per-app tracking, keyed by app name.
    pub apps: BTreeMap<String, AppState>,
    /// Time of the last write.
    pub updated_at: DateTime<Utc>,
}

impl StagerState {
    /// A fresh state in the [`StagerPhase::Setup`] phase.
    #[must_use]
    pub fn new(uuid: ContainerId) -> Self {
        Self {
            uuid,
            phase: StagerPhase::Setup,
            apps: BTreeMap::new(),
            updated_at: Utc::now(),
        }
    }
}

/// Loads a state artifact from disk.
///
/// # Errors
///
/// Returns an error if the file cannot be read or parsed.
pub fn load_state(path: &Path) -> Result<StagerState> {
    tracing::debug!(path = %path.display(), "loading stager state");
    let content = std::fs::read(path).map_err(|e| BerthError::io(path, e))?;
    Ok(serde_json::from_slice(&content)?)
}

/// Persists the state artifact atomically, stamping `updated_at`.
///
/// # Errors
///
/// Returns an error if the file cannot be written.
pub fn save_state(path: &Path, state: &mut StagerState) -> Result<()> {
    state.updated_at = Utc::now();
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, serde_json::to_vec_pretty(state)?).map_err(|e| BerthError::io(&tmp, e))?;
    std::fs::rename(&tmp, path).map_err(|e| BerthError::io(path, e))?;
    tracing::debug!(path = %path.display(), phase = ?state.phase, "stager state saved");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn save_then_load_preserves_tracking() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("state.json");
        let mut state = StagerState::new(ContainerId::new("c1"));
        state.phase = StagerPhase::Running;
        let _ = state.apps.insert(
            "web".into(),
            AppState {
                pid: Some(42),
                exit_code: None,
            },
        );

        save_state(&path, &mut state).expect("save");
        assert!(!dir.path().join("state.json.tmp").exists());

        let loaded = load_state(&path).expect("load");
        assert_eq!(loaded, state);
    }

    #[test]
    fn phase_serializes_kebab_case() {
        let json = serde_json::to_string(&StagerPhase::ShuttingDown).expect("serialize");
        assert_eq!(json, "\"shutting-down\"");
    }

    #[test]
    fn load_missing_state_is_io_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        assert!(matches!(
            load_state(&dir.path().join("state.json")),
            Err(BerthError::Io { .. })
        ));
    }
}
