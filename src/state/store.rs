//! Durable, owner-only snapshot of lease and failure state.

use std::fs;
use std::io::Write;
use std::os::unix::fs::{DirBuilderExt, PermissionsExt};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;
use tracing::{debug, warn};

use super::error::{StateError, StateResult};
use crate::lease::{LeasePair, PortLease};
use crate::recovery::FailureState;

/// Current on-disk format version.
pub const STATE_VERSION: u32 = 1;

/// Everything that survives a restart.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistedState {
    /// Format version.
    pub version: u32,
    /// Last active TCP lease.
    pub tcp_lease: Option<PortLease>,
    /// Last active UDP lease.
    pub udp_lease: Option<PortLease>,
    /// Failure counters.
    #[serde(flatten)]
    pub failures: FailureState,
}

impl Default for PersistedState {
    fn default() -> Self {
        Self {
            version: STATE_VERSION,
            tcp_lease: None,
            udp_lease: None,
            failures: FailureState::default(),
        }
    }
}

impl PersistedState {
    /// The stored pair, if both halves are present and consistent.
    pub fn lease_pair(&self) -> Option<LeasePair> {
        let (tcp, udp) = (self.tcp_lease.clone()?, self.udp_lease.clone()?);
        LeasePair::new(tcp, udp).ok()
    }

    /// Replace the stored pair.
    pub fn set_lease_pair(&mut self, pair: Option<&LeasePair>) {
        self.tcp_lease = pair.map(|p| p.tcp.clone());
        self.udp_lease = pair.map(|p| p.udp.clone());
    }
}

/// Reads and atomically rewrites the state file.
#[derive(Debug, Clone)]
pub struct StateStore {
    path: PathBuf,
}

impl StateStore {
    /// Store backed by `path`.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// State file path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn dir(&self) -> &Path {
        match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        }
    }

    /// Create the state directory with mode 0700, or check an existing one.
    ///
    /// An existing directory is never chmodded: it may be shared (`/tmp`,
    /// the working directory). One open to group or others is refused.
    pub fn prepare(&self) -> StateResult<()> {
        let dir = self.dir();
        let permission = |source| StateError::Permission {
            path: dir.to_path_buf(),
            source,
        };

        match fs::metadata(dir) {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                fs::DirBuilder::new()
                    .recursive(true)
                    .mode(0o700)
                    .create(dir)
                    .map_err(permission)?;
                debug!("Created state directory {:?}", dir);
            }
            Err(e) => return Err(permission(e)),
        }

        let mode = fs::metadata(dir).map_err(permission)?.permissions().mode() & 0o7777;
        if mode & 0o077 != 0 {
            return Err(StateError::InsecureMode {
                path: dir.to_path_buf(),
                mode,
            });
        }
        debug!("State directory {:?} ready", dir);
        Ok(())
    }

    /// Load the state, falling back to a fresh one.
    ///
    /// A missing file is normal on first start. An unreadable, corrupt or
    /// foreign-version file is logged and replaced on the next save.
    pub fn load(&self) -> PersistedState {
        let contents = match fs::read_to_string(&self.path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("No state file at {:?}, starting fresh", self.path);
                return PersistedState::default();
            }
            Err(e) => {
                warn!("Failed to read state file {:?}: {}", self.path, e);
                return PersistedState::default();
            }
        };

        match serde_json::from_str::<PersistedState>(&contents) {
            Ok(state) if state.version == STATE_VERSION => {
                debug!(
                    "Loaded state: port {:?}, {} consecutive failures",
                    state.tcp_lease.as_ref().map(|l| l.external_port),
                    state.failures.consecutive_failures
                );
                state
            }
            Ok(state) => {
                warn!(
                    "State file {:?} has version {}, expected {}; starting fresh",
                    self.path, state.version, STATE_VERSION
                );
                PersistedState::default()
            }
            Err(e) => {
                warn!("Corrupt state file {:?}: {}; starting fresh", self.path, e);
                PersistedState::default()
            }
        }
    }

    /// Write the state atomically with mode 0600.
    pub fn save(&self, state: &PersistedState) -> StateResult<()> {
        let write_err = |source| StateError::Write {
            path: self.path.clone(),
            source,
        };
        let json = serde_json::to_string_pretty(state)?;

        let mut tmp = NamedTempFile::new_in(self.dir()).map_err(write_err)?;
        tmp.as_file()
            .set_permissions(fs::Permissions::from_mode(0o600))
            .map_err(write_err)?;
        tmp.write_all(json.as_bytes()).map_err(write_err)?;
        tmp.as_file().sync_all().map_err(write_err)?;
        tmp.persist(&self.path).map_err(|e| write_err(e.error))?;

        debug!("Saved state to {:?}", self.path);
        Ok(())
    }
}
