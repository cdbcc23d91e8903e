//! Per-chat-key staging directories under one shared root.
//!
//! Each chat key owns exactly one directory, named by an injective encoding of
//! the key, directly under the root. The directory lives from first use until
//! [`WorkspaceManager::reset`] (or shutdown). Executions for the same key are
//! serialized through a per-key async lock held by their [`WorkspaceLease`];
//! different keys never share a lock.

use std::{
    collections::HashMap,
    fmt::Write as _,
    io,
    path::{Path, PathBuf},
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use {
    tokio::sync::OwnedMutexGuard,
    tracing::{debug, info, warn},
};

use crate::error::IntegrityError;

/// Longest encoded directory name accepted (filesystems cap names at 255).
pub const MAX_DIR_NAME_LEN: usize = 200;

#[derive(Debug, thiserror::Error)]
pub enum WorkspaceError {
    #[error("invalid chat key {key:?}: {reason}")]
    InvalidChatKey { key: String, reason: &'static str },
    #[error("workspace io error at {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error(transparent)]
    Integrity(#[from] IntegrityError),
}

impl WorkspaceError {
    fn io(path: &Path, source: io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// Encode a chat key as a single directory name.
///
/// Lowercase ASCII letters, digits, `-` and `_` are kept; every other byte is
/// written as `.` plus two lowercase hex digits. `.` never appears unescaped,
/// so the encoding is injective, and since uppercase letters are escaped it
/// stays injective on case-insensitive filesystems. The result never contains
/// a path separator and is never `.` or `..`.
pub fn workspace_dir_name(chat_key: &str) -> Result<String, WorkspaceError> {
    if chat_key.is_empty() {
        return Err(WorkspaceError::InvalidChatKey {
            key: String::new(),
            reason: "chat key is empty",
        });
    }
    let mut name = String::with_capacity(chat_key.len());
    for byte in chat_key.bytes() {
        if byte.is_ascii_lowercase() || byte.is_ascii_digit() || byte == b'-' || byte == b'_' {
            name.push(char::from(byte));
        } else {
            let _ = write!(name, ".{byte:02x}");
        }
    }
    if name.len() > MAX_DIR_NAME_LEN {
        return Err(WorkspaceError::InvalidChatKey {
            key: chat_key.to_string(),
            reason: "chat key is too long",
        });
    }
    Ok(name)
}

/// Result of [`WorkspaceManager::reset`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResetOutcome {
    Removed,
    NotFound,
}

#[derive(Debug)]
struct Entry {
    dir_name: String,
    path: PathBuf,
    /// Leases (active or waiting) plus one while the session is pinned.
    ref_count: usize,
    pinned: bool,
    unreliable: bool,
    lock: Arc<tokio::sync::Mutex<()>>,
}

#[derive(Debug, Default)]
struct Registry {
    sessions: HashMap<String, Entry>,
    /// Directory name -> owning chat key.
    owners: HashMap<String, String>,
}

impl Registry {
    /// Entry for `chat_key`, created on first use.
    fn track(&mut self, chat_key: &str, dir_name: String, path: &Path) -> &mut Entry {
        self.owners.insert(dir_name.clone(), chat_key.to_string());
        self.sessions
            .entry(chat_key.to_string())
            .or_insert_with(|| Entry {
                dir_name,
                path: path.to_path_buf(),
                ref_count: 0,
                pinned: false,
                unreliable: false,
                lock: Arc::new(tokio::sync::Mutex::new(())),
            })
    }
}

#[derive(Debug)]
struct Shared {
    root: PathBuf,
    registry: Mutex<Registry>,
}

impl Shared {
    fn registry(&self) -> MutexGuard<'_, Registry> {
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn contained_path(&self, dir_name: &str) -> Result<PathBuf, IntegrityError> {
        let path = self.root.join(dir_name);
        if path.parent() != Some(self.root.as_path()) {
            return Err(IntegrityError::ContainmentViolation {
                path,
                root: self.root.clone(),
            });
        }
        Ok(path)
    }

    /// Drop one reference. At zero the entry is forgotten. The directory is
    /// already gone by then: only `reset` deletes, while it holds the key's
    /// lock and a reference of its own.
    fn unref(&self, chat_key: &str) {
        let mut registry = self.registry();
        let Some(entry) = registry.sessions.get_mut(chat_key) else {
            return;
        };
        entry.ref_count = entry.ref_count.saturating_sub(1);
        if entry.ref_count > 0 {
            return;
        }
        if let Some(entry) = registry.sessions.remove(chat_key) {
            registry.owners.remove(&entry.dir_name);
            debug!(chat_key, path = %entry.path.display(), "workspace entry released");
        }
    }
}

async fn remove_dir(path: &Path) -> Result<bool, WorkspaceError> {
    match tokio::fs::remove_dir_all(path).await {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(WorkspaceError::io(path, e)),
    }
}

/// Create `path` if needed and check it is a real directory directly under
/// `root` once symlinks are resolved.
async fn ensure_dir(root: &Path, path: &Path) -> Result<(), WorkspaceError> {
    tokio::fs::create_dir_all(path)
        .await
        .map_err(|e| WorkspaceError::io(path, e))?;
    let meta = tokio::fs::symlink_metadata(path)
        .await
        .map_err(|e| WorkspaceError::io(path, e))?;
    let canonical = tokio::fs::canonicalize(path)
        .await
        .map_err(|e| WorkspaceError::io(path, e))?;
    if meta.file_type().is_symlink() || !meta.is_dir() || canonical.parent() != Some(root) {
        return Err(IntegrityError::ContainmentViolation {
            path: canonical,
            root: root.to_path_buf(),
        }
        .into());
    }
    Ok(())
}

/// One counted reference to a session entry; unrefs on drop.
#[derive(Debug)]
struct Reference {
    shared: Arc<Shared>,
    chat_key: String,
    released: bool,
}

impl Reference {
    fn release(mut self) {
        self.released = true;
        self.shared.unref(&self.chat_key);
    }
}

impl Drop for Reference {
    fn drop(&mut self) {
        if !self.released {
            self.shared.unref(&self.chat_key);
        }
    }
}

/// Exclusive use of one chat key's workspace.
///
/// Holding a lease keeps the workspace referenced and blocks other leases for
/// the same key. Release it with [`WorkspaceManager::release`] or by
/// dropping it.
#[derive(Debug)]
pub struct WorkspaceLease {
    path: PathBuf,
    reference: Reference,
    _guard: OwnedMutexGuard<()>,
}

impl WorkspaceLease {
    pub fn chat_key(&self) -> &str {
        &self.reference.chat_key
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Create the directory if needed and verify containment.
    pub async fn prepare(&self) -> Result<&Path, WorkspaceError> {
        ensure_dir(&self.reference.shared.root, &self.path).await?;
        Ok(&self.path)
    }

    /// Flag the workspace as possibly holding partial writes from a killed
    /// process. Cleared when the next lease for the key is granted.
    pub fn mark_unreliable(&self) {
        let mut registry = self.reference.shared.registry();
        if let Some(entry) = registry.sessions.get_mut(self.chat_key()) {
            entry.unreliable = true;
        }
    }
}

/// Allocates and reclaims per-chat-key workspaces under a shared root.
#[derive(Debug, Clone)]
pub struct WorkspaceManager {
    shared: Arc<Shared>,
}

impl WorkspaceManager {
    /// Create the root if needed. The root is canonicalized so containment
    /// checks compare resolved paths.
    pub fn new(root: impl AsRef<Path>) -> Result<Self, WorkspaceError> {
        let root = root.as_ref();
        std::fs::create_dir_all(root).map_err(|e| WorkspaceError::io(root, e))?;
        let root = std::fs::canonicalize(root).map_err(|e| WorkspaceError::io(root, e))?;
        debug!(root = %root.display(), "workspace root ready");
        Ok(Self {
            shared: Arc::new(Shared {
                root,
                registry: Mutex::new(Registry::default()),
            }),
        })
    }

    pub fn root(&self) -> &Path {
        &self.shared.root
    }

    /// Deterministic workspace path for `chat_key`.
    pub fn path_for(&self, chat_key: &str) -> Result<PathBuf, WorkspaceError> {
        let dir_name = workspace_dir_name(chat_key)?;
        Ok(self.shared.contained_path(&dir_name)?)
    }

    /// Resolve the workspace path, creating the directory on first call.
    ///
    /// Idempotent. Does not take the per-key lock; executions should go
    /// through [`acquire`](Self::acquire).
    pub async fn resolve(&self, chat_key: &str) -> Result<PathBuf, WorkspaceError> {
        let dir_name = workspace_dir_name(chat_key)?;
        let path = self.shared.contained_path(&dir_name)?;
        self.check_owner(&self.shared.registry(), &dir_name, chat_key, &path)?;
        ensure_dir(&self.shared.root, &path).await?;
        Ok(path)
    }

    fn check_owner(
        &self,
        registry: &Registry,
        dir_name: &str,
        chat_key: &str,
        path: &Path,
    ) -> Result<(), IntegrityError> {
        match registry.owners.get(dir_name) {
            Some(owner) if owner != chat_key => Err(IntegrityError::PathCollision {
                existing: owner.clone(),
                incoming: chat_key.to_string(),
                path: path.to_path_buf(),
            }),
            _ => Ok(()),
        }
    }

    /// Count a reference on `chat_key`, tracking it if new, and hand back
    /// the key's lock.
    fn reference(
        &self,
        chat_key: &str,
        dir_name: String,
        path: &Path,
    ) -> Result<(Arc<tokio::sync::Mutex<()>>, Reference), IntegrityError> {
        let mut registry = self.shared.registry();
        self.check_owner(&registry, &dir_name, chat_key, path)?;
        let entry = registry.track(chat_key, dir_name, path);
        entry.ref_count += 1;
        let lock = Arc::clone(&entry.lock);
        let reference = Reference {
            shared: Arc::clone(&self.shared),
            chat_key: chat_key.to_string(),
            released: false,
        };
        Ok((lock, reference))
    }

    /// Take a lease on `chat_key`'s workspace, waiting for any other lease on
    /// the same key. The directory itself is created by
    /// [`WorkspaceLease::prepare`].
    pub async fn acquire(&self, chat_key: &str) -> Result<WorkspaceLease, WorkspaceError> {
        let dir_name = workspace_dir_name(chat_key)?;
        let path = self.shared.contained_path(&dir_name)?;

        // Unrefs if this future is dropped while waiting for the lock.
        let (lock, reference) = self.reference(chat_key, dir_name, &path)?;

        let guard = lock.lock_owned().await;

        {
            let mut registry = self.shared.registry();
            if let Some(entry) = registry.sessions.get_mut(chat_key) {
                if !entry.pinned {
                    entry.pinned = true;
                    entry.ref_count += 1;
                }
                if entry.unreliable {
                    warn!(chat_key, "reusing workspace after a forced termination");
                    entry.unreliable = false;
                }
            }
        }

        debug!(chat_key, path = %path.display(), "workspace lease granted");
        Ok(WorkspaceLease {
            path,
            reference,
            _guard: guard,
        })
    }

    /// Give a lease back. The directory stays until the session is reset.
    pub fn release(&self, lease: WorkspaceLease) {
        let WorkspaceLease {
            reference, _guard, ..
        } = lease;
        reference.release();
        drop(_guard);
    }

    /// Delete a session's workspace and forget it.
    ///
    /// Waits for the key's running execution, if any. A directory left over
    /// from an earlier process is removed as well. The delete runs under the
    /// key's lock only, so other keys are never held up by it.
    pub async fn reset(&self, chat_key: &str) -> Result<ResetOutcome, WorkspaceError> {
        let dir_name = workspace_dir_name(chat_key)?;
        let path = self.shared.contained_path(&dir_name)?;

        let (lock, reference) = self.reference(chat_key, dir_name, &path)?;
        let guard = lock.lock_owned().await;
        let removed = remove_dir(&path).await;
        {
            let mut registry = self.shared.registry();
            if let Some(entry) = registry.sessions.get_mut(chat_key)
                && entry.pinned
            {
                entry.pinned = false;
                entry.ref_count = entry.ref_count.saturating_sub(1);
            }
        }
        reference.release();
        drop(guard);
        let removed = removed?;

        info!(chat_key, removed, "workspace reset");
        Ok(if removed {
            ResetOutcome::Removed
        } else {
            ResetOutcome::NotFound
        })
    }

    /// Reset every tracked session. Returns how many directories were removed.
    pub async fn shutdown(&self) -> Result<usize, WorkspaceError> {
        let keys: Vec<String> = self.shared.registry().sessions.keys().cloned().collect();
        let mut removed = 0;
        for key in keys {
            if self.reset(&key).await? == ResetOutcome::Removed {
                removed += 1;
            }
        }
        info!(removed, "workspaces reclaimed on shutdown");
        Ok(removed)
    }

    /// Current reference count for a key (0 if untracked).
    pub fn ref_count(&self, chat_key: &str) -> usize {
        self.shared
            .registry()
            .sessions
            .get(chat_key)
            .map_or(0, |e| e.ref_count)
    }

    pub fn is_unreliable(&self, chat_key: &str) -> bool {
        self.shared
            .registry()
            .sessions
            .get(chat_key)
            .is_some_and(|e| e.unreliable)
    }
}
