use crate::core::{Result, VaultError};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, PoisonError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PermissionState {
    Granted,
    /// Not decided yet; a request may grant it.
    Prompt,
    Denied,
}

/// A user-chosen directory whose write permission can lapse at any time.
#[async_trait]
pub trait DirectoryAccess: Send + Sync {
    fn root(&self) -> &Path;

    async fn query_permission(&self) -> PermissionState;

    async fn request_permission(&self) -> PermissionState;
}

/// Queries first and requests only when the answer is not already granted.
pub async fn ensure_permission(access: &dyn DirectoryAccess) -> Result<()> {
    if access.query_permission().await == PermissionState::Granted {
        return Ok(());
    }
    match access.request_permission().await {
        PermissionState::Granted => Ok(()),
        _ => Err(VaultError::MirrorPermissionDenied(access.root().display().to_string())),
    }
}

/// Local filesystem directory with a scriptable permission state.
pub struct LocalDirectory {
    root: PathBuf,
    state: Mutex<PermissionState>,
    grant_on_request: AtomicBool,
}

impl LocalDirectory {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            state: Mutex::new(PermissionState::Granted),
            grant_on_request: AtomicBool::new(true),
        }
    }

    /// Drops back to `Prompt`, as after a browser restart.
    pub fn revoke(&self) {
        self.set_state(PermissionState::Prompt);
    }

    pub fn deny(&self) {
        self.set_state(PermissionState::Denied);
    }

    /// Whether a future request is granted.
    pub fn grant_on_request(&self, grant: bool) {
        self.grant_on_request.store(grant, Ordering::Relaxed);
    }

    fn set_state(&self, state: PermissionState) {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner) = state;
    }

    fn state(&self) -> PermissionState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl DirectoryAccess for LocalDirectory {
    fn root(&self) -> &Path {
        &self.root
    }

    async fn query_permission(&self) -> PermissionState {
        match tokio::fs::metadata(&self.root).await {
            Ok(meta) if meta.is_dir() => self.state(),
            _ => PermissionState::Denied,
        }
    }

    async fn request_permission(&self) -> PermissionState {
        if !tokio::fs::metadata(&self.root).await.is_ok_and(|meta| meta.is_dir()) {
            return PermissionState::Denied;
        }
        let current = self.state();
        if current == PermissionState::Granted {
            return current;
        }
        let next = if self.grant_on_request.load(Ordering::Relaxed) {
            PermissionState::Granted
        } else {
            PermissionState::Denied
        };
        self.set_state(next);
        next
    }
}
