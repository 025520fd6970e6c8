//! Single-tenant lease on the sandbox root.
//!
//! A lease is a file in the agent's state directory, created exclusively.
//! The [`LeaseGuard`] returned on acquisition is owned by the connection that
//! asked for it; dropping the guard (explicit release or disconnect) removes
//! the file. Leases never outlive the agent process: [`clear_stale`] runs at
//! startup.

use chrono::Utc;
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use crate::protocol::LeaseGrant;

const LEASE_FILE: &str = "lease.json";

/// Errors acquiring a lease.
#[derive(Debug, thiserror::Error)]
pub(crate) enum LeaseError {
    /// Another session holds the lease.
    #[error("Sandbox is in use by {holder} since {since}")]
    Held { holder: String, since: String },

    /// Lease file could not be created or read.
    #[error("Lease file error at {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: io::Error,
    },
}

impl LeaseError {
    fn io(path: &Path, source: io::Error) -> Self {
        Self::Io {
            path: path.display().to_string(),
            source,
        }
    }
}

/// Held lease. Removes the lease file when dropped.
#[derive(Debug)]
pub(crate) struct LeaseGuard {
    grant: LeaseGrant,
    path: PathBuf,
}

impl LeaseGuard {
    pub fn grant(&self) -> &LeaseGrant {
        &self.grant
    }

    pub fn token(&self) -> &str {
        &self.grant.token
    }
}

impl Drop for LeaseGuard {
    fn drop(&mut self) {
        debug!("Releasing lease held by {}", self.grant.holder);
        if let Err(e) = fs::remove_file(&self.path) {
            if e.kind() != io::ErrorKind::NotFound {
                warn!("Failed to remove lease file {}: {}", self.path.display(), e);
            }
        }
    }
}

/// Acquires the lease in `state_dir` for `holder`.
pub(crate) fn acquire(state_dir: &Path, holder: &str) -> Result<LeaseGuard, LeaseError> {
    fs::create_dir_all(state_dir).map_err(|e| LeaseError::io(state_dir, e))?;
    let path = state_dir.join(LEASE_FILE);

    let grant = LeaseGrant {
        token: uuid::Uuid::new_v4().to_string(),
        holder: holder.to_string(),
        acquired_at: Utc::now(),
    };

    let mut file = match OpenOptions::new().write(true).create_new(true).open(&path) {
        Ok(file) => file,
        Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
            return Err(read_holder(&path));
        }
        Err(e) => return Err(LeaseError::io(&path, e)),
    };

    let body = serde_json::to_vec(&grant).map_err(|e| LeaseError::io(&path, e.into()))?;
    if let Err(e) = file.write_all(&body) {
        let _ = fs::remove_file(&path);
        return Err(LeaseError::io(&path, e));
    }

    Ok(LeaseGuard { grant, path })
}

/// Builds the `Held` error from the current lease file contents.
fn read_holder(path: &Path) -> LeaseError {
    let current = fs::read(path)
        .ok()
        .and_then(|bytes| serde_json::from_slice::<LeaseGrant>(&bytes).ok());

    match current {
        Some(grant) => LeaseError::Held {
            holder: grant.holder,
            since: grant.acquired_at.to_rfc3339(),
        },
        None => LeaseError::Held {
            holder: "unknown".to_string(),
            since: "unknown".to_string(),
        },
    }
}

/// Removes a lease left behind by a previous agent process.
pub(crate) fn clear_stale(state_dir: &Path) -> io::Result<bool> {
    match fs::remove_file(state_dir.join(LEASE_FILE)) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e),
    }
}
