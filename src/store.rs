//! Single source of truth for "is this client context authenticated".

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use time::OffsetDateTime;
use tokio::sync::watch;

use crate::error::Error;
use crate::session::Session;

/// Durable backing for a [`SessionStore`].
///
/// Implementations are called synchronously with the store lock held, from
/// whatever task mutates the store. They must not call back into the store
/// and should finish quickly.
pub trait SessionPersistence: Send + Sync + 'static {
    /// Load a previously saved session.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Persistence`] if the backing medium cannot be read.
    fn load(&self) -> Result<Option<Session>, Error>;

    /// Save `session`, replacing whatever was saved before.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Persistence`] if the backing medium cannot be written.
    fn save(&self, session: &Session) -> Result<(), Error>;

    /// Remove the saved session. Removing nothing is not an error.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Persistence`] if the backing medium cannot be written.
    fn remove(&self) -> Result<(), Error>;
}

/// Stores the session as a JSON file readable only by its owner.
///
/// Reads and writes are blocking filesystem calls made under the store
/// lock, once per login, refresh or logout. Use a custom
/// [`SessionPersistence`] for slow media.
#[derive(Debug, Clone)]
pub struct JsonFilePersistence {
    path: PathBuf,
}

impl JsonFilePersistence {
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl SessionPersistence for JsonFilePersistence {
    fn load(&self) -> Result<Option<Session>, Error> {
        let raw = match std::fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(Error::Persistence(format!("{}: {e}", self.path.display()))),
        };
        serde_json::from_str(&raw)
            .map(Some)
            .map_err(|e| Error::Persistence(format!("{}: {e}", self.path.display())))
    }

    fn save(&self, session: &Session) -> Result<(), Error> {
        let json = serde_json::to_vec(session).map_err(|e| Error::Persistence(e.to_string()))?;
        // write-then-rename so a crash never leaves a half-written session
        let tmp = self.path.with_extension("tmp");
        write_private(&tmp, &json)
            .and_then(|()| std::fs::rename(&tmp, &self.path))
            .map_err(|e| Error::Persistence(format!("{}: {e}", self.path.display())))
    }

    fn remove(&self) -> Result<(), Error> {
        match std::fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::Persistence(format!("{}: {e}", self.path.display()))),
        }
    }
}

/// Writes `contents` to `path`, owner read/write only on unix.
fn write_private(path: &Path, contents: &[u8]) -> std::io::Result<()> {
    let mut file = open_private(path)?;
    file.write_all(contents)?;
    file.sync_all()
}

#[cfg(unix)]
fn open_private(path: &Path) -> std::io::Result<File> {
    use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};

    let file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o600)
        .open(path)?;
    // `mode` only applies on creation; a leftover temp file keeps its own
    file.set_permissions(std::fs::Permissions::from_mode(0o600))?;
    Ok(file)
}

#[cfg(not(unix))]
fn open_private(path: &Path) -> std::io::Result<File> {
    OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(path)
}

struct Slot {
    generation: u64,
    session: Option<Session>,
}

/// Holds at most one session for a client context.
///
/// Every mutation replaces the whole session under one lock and bumps a
/// generation counter. Refreshes commit through [`replace_if_current`]
/// so a result computed before a logout can never resurrect the session.
///
/// [`replace_if_current`]: SessionStore::replace_if_current
pub struct SessionStore {
    slot: Mutex<Slot>,
    changes: watch::Sender<u64>,
    persistence: Option<Box<dyn SessionPersistence>>,
}

impl Default for SessionStore {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for SessionStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let slot = self.slot.lock();
        f.debug_struct("SessionStore")
            .field("generation", &slot.generation)
            .field("session", &slot.session)
            .field("persistent", &self.persistence.is_some())
            .finish()
    }
}

impl SessionStore {
    /// Empty in-memory store.
    #[must_use]
    pub fn new() -> Self {
        Self {
            slot: Mutex::new(Slot {
                generation: 0,
                session: None,
            }),
            changes: watch::Sender::new(0),
            persistence: None,
        }
    }

    /// Store mirrored to `persistence`, starting from whatever it holds.
    ///
    /// A saved session that has already expired is still restored; the
    /// refresher decides whether its refresh token is usable.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Persistence`] if the saved session cannot be loaded.
    pub fn with_persistence(persistence: impl SessionPersistence) -> Result<Self, Error> {
        let session = persistence.load()?;
        if session.is_some() {
            tracing::debug!("Restored persisted session");
        }
        Ok(Self {
            slot: Mutex::new(Slot {
                generation: 0,
                session,
            }),
            changes: watch::Sender::new(0),
            persistence: Some(Box::new(persistence)),
        })
    }

    /// Replaces the held session.
    pub fn set(&self, session: Session) {
        let mut slot = self.slot.lock();
        self.commit(&mut slot, Some(session));
    }

    /// The held session, if any.
    #[must_use]
    pub fn get(&self) -> Option<Session> {
        self.slot.lock().session.clone()
    }

    /// Drops the held session. Idempotent.
    pub fn clear(&self) {
        let mut slot = self.slot.lock();
        self.commit(&mut slot, None);
    }

    /// Drops the held session and returns it.
    pub fn take(&self) -> Option<Session> {
        let mut slot = self.slot.lock();
        let held = slot.session.clone();
        self.commit(&mut slot, None);
        held
    }

    /// Current mutation counter.
    #[must_use]
    pub fn generation(&self) -> u64 {
        self.slot.lock().generation
    }

    /// Held session together with the generation it was read at.
    #[must_use]
    pub fn snapshot(&self) -> (u64, Option<Session>) {
        let slot = self.slot.lock();
        (slot.generation, slot.session.clone())
    }

    /// Replaces the session only if nothing changed since `generation`.
    pub fn replace_if_current(&self, generation: u64, session: Session) -> bool {
        let mut slot = self.slot.lock();
        if slot.generation != generation {
            return false;
        }
        self.commit(&mut slot, Some(session));
        true
    }

    /// Clears the session only if nothing changed since `generation` and the
    /// held session still carries `refresh_token`.
    pub fn invalidate(&self, generation: u64, refresh_token: &str) -> bool {
        let mut slot = self.slot.lock();
        let matches = slot
            .session
            .as_ref()
            .is_some_and(|s| s.refresh_token() == refresh_token);
        if slot.generation != generation || !matches {
            return false;
        }
        self.commit(&mut slot, None);
        true
    }

    /// Authenticated iff a session is held and its expiry is in the future.
    #[must_use]
    pub fn is_authenticated(&self) -> bool {
        let now = OffsetDateTime::now_utc();
        self.slot
            .lock()
            .session
            .as_ref()
            .is_some_and(|s| s.is_active_at(now))
    }

    /// Receiver that observes every generation bump.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.changes.subscribe()
    }

    fn commit(&self, slot: &mut Slot, session: Option<Session>) {
        slot.generation += 1;
        if let Some(persistence) = &self.persistence {
            let res = match &session {
                Some(s) => persistence.save(s),
                None => persistence.remove(),
            };
            if let Err(e) = res {
                tracing::warn!(error = %e, "Session persistence failed");
            }
        }
        slot.session = session;
        self.changes.send_replace(slot.generation);
    }
}
