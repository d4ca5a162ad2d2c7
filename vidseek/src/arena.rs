//! Session-scoped temporary artifacts.
//!
//! Every request that touches media opens a [`Session`]: a fresh directory
//! under the arena root with one subdirectory per [`ArtifactKind`]. All
//! paths handed out by a session live under that directory, so concurrent
//! sessions can never collide, and [`Session::release`] (also run on drop)
//! removes everything in one sweep whether the request succeeded, failed, or
//! was cancelled.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::SystemTime;

use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::types::ArtifactKind;

const KINDS: [ArtifactKind; 4] = [
    ArtifactKind::Video,
    ArtifactKind::Audio,
    ArtifactKind::Subtitle,
    ArtifactKind::Frame,
];

/// Allocates sessions under a shared root directory.
#[derive(Debug, Clone)]
pub struct Arena {
    root: PathBuf,
}

impl Arena {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Create a new session directory. This is the only fallible arena
    /// operation; on failure nothing is left behind.
    pub fn open_session(&self) -> Result<Session> {
        let id = uuid::Uuid::new_v4().simple().to_string();
        let root = self.root.join(&id);

        let create = || -> std::io::Result<()> {
            std::fs::create_dir_all(&root)?;
            for kind in KINDS {
                std::fs::create_dir(root.join(kind.dir_name()))?;
            }
            Ok(())
        };

        if let Err(source) = create() {
            if root.exists() {
                let _ = std::fs::remove_dir_all(&root);
            }
            return Err(Error::Allocation { path: root, source });
        }

        debug!(session = %id, root = %root.display(), "session opened");

        Ok(Session {
            id,
            root,
            created_at: SystemTime::now(),
            owned: Mutex::new(Vec::new()),
            released: AtomicBool::new(false),
        })
    }
}

/// The temporary artifacts of one pipeline invocation.
#[derive(Debug)]
pub struct Session {
    id: String,
    root: PathBuf,
    created_at: SystemTime,
    owned: Mutex<Vec<PathBuf>>,
    released: AtomicBool,
}

impl Session {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn created_at(&self) -> SystemTime {
        self.created_at
    }

    /// Directory holding all artifacts of `kind`.
    pub fn dir(&self, kind: ArtifactKind) -> PathBuf {
        self.root.join(kind.dir_name())
    }

    /// Reserve a path for a new artifact. Only the final component of `name`
    /// is used, so the result always stays inside this session.
    pub fn alloc_path(&self, kind: ArtifactKind, name: &str) -> PathBuf {
        let file_name = Path::new(name)
            .file_name()
            .map(|f| f.to_os_string())
            .unwrap_or_else(|| "artifact".into());
        let path = self.dir(kind).join(file_name);

        if self.is_released() {
            warn!(session = %self.id, path = %path.display(), "allocation on released session");
        }

        self.owned_guard().push(path.clone());
        path
    }

    /// Take ownership of a file some external tool wrote into this session.
    pub fn adopt(&self, path: &Path) {
        let mut owned = self.owned_guard();
        if !owned.iter().any(|p| p == path) {
            owned.push(path.to_path_buf());
        }
    }

    /// Delete one artifact ahead of session release.
    pub fn discard(&self, path: &Path) {
        remove_file_logged(&self.id, path);
        self.owned_guard().retain(|p| p != path);
    }

    pub fn owned_paths(&self) -> Vec<PathBuf> {
        self.owned_guard().clone()
    }

    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::Acquire)
    }

    /// Delete every artifact and the session directory. Errors are logged and
    /// swallowed; a second call is a no-op.
    pub fn release(&self) {
        if self.released.swap(true, Ordering::AcqRel) {
            return;
        }

        let owned = std::mem::take(&mut *self.owned_guard());
        for path in &owned {
            remove_file_logged(&self.id, path);
        }

        if self.root.exists() {
            if let Err(e) = std::fs::remove_dir_all(&self.root) {
                warn!(session = %self.id, path = %self.root.display(), error = %e, "failed to remove session dir");
            }
        }

        debug!(session = %self.id, artifacts = owned.len(), "session released");
    }

    fn owned_guard(&self) -> std::sync::MutexGuard<'_, Vec<PathBuf>> {
        self.owned.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.release();
    }
}

fn remove_file_logged(session: &str, path: &Path) {
    match std::fs::remove_file(path) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => {
            warn!(session, path = %path.display(), error = %e, "failed to remove artifact");
        }
    }
}
