//! Browser sessions: a signed cookie naming an in-memory entry that carries the
//! pending OAuth state and at most one job waiting for authorization.

use std::{
    collections::HashMap,
    time::{Duration, Instant},
};

use parking_lot::Mutex;
use rand_core::{OsRng, RngCore};
use tracing::debug;

use crate::job::UploadJob;

pub const SESSION_COOKIE: &str = "retube_session";
const KEY_CONTEXT: &str = "retube 2024-06 session cookie signing key";
const ID_BYTES: usize = 16;

/// Where a browser session stands in the authorization flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    Unauthenticated,
    PendingCallback,
    Authenticated,
}

/// Progress of one job through the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobPhase {
    Downloading,
    Uploading,
    Done,
    Failed,
}

impl JobPhase {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Downloading => "downloading",
            Self::Uploading => "uploading",
            Self::Done => "done",
            Self::Failed => "failed",
        }
    }
}

/// Signs and verifies session cookie values of the form `<id>.<mac>`.
#[derive(Clone)]
pub struct CookieSigner {
    key: [u8; 32],
}

impl CookieSigner {
    pub fn new(secret: &str) -> Self {
        Self {
            key: blake3::derive_key(KEY_CONTEXT, secret.as_bytes()),
        }
    }

    pub fn sign(&self, id: &str) -> String {
        format!("{id}.{}", blake3::keyed_hash(&self.key, id.as_bytes()).to_hex())
    }

    /// Returns the session id when the MAC checks out.
    pub fn verify(&self, value: &str) -> Option<String> {
        let (id, mac) = value.split_once('.')?;
        let presented = blake3::Hash::from_hex(mac).ok()?;
        // Hash equality is constant time.
        (presented == blake3::keyed_hash(&self.key, id.as_bytes())).then(|| id.to_string())
    }
}

#[derive(Debug)]
struct SessionState {
    oauth_state: Option<String>,
    pending: Option<UploadJob>,
    touched: Instant,
}

impl SessionState {
    fn new() -> Self {
        Self {
            oauth_state: None,
            pending: None,
            touched: Instant::now(),
        }
    }
}

pub struct SessionStore {
    entries: Mutex<HashMap<String, SessionState>>,
    ttl: Duration,
}

impl SessionStore {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            ttl,
        }
    }

    /// Returns `id` when it names a live session, otherwise a fresh id. A fresh
    /// id is only stored once something is written under it.
    pub fn resolve(&self, id: Option<&str>) -> String {
        let mut entries = self.entries.lock();
        self.purge(&mut entries);
        if let Some(id) = id
            && let Some(state) = entries.get_mut(id)
        {
            state.touched = Instant::now();
            return id.to_string();
        }
        new_session_id()
    }

    pub fn contains(&self, id: &str) -> bool {
        let mut entries = self.entries.lock();
        self.purge(&mut entries);
        entries.contains_key(id)
    }

    pub fn set_oauth_state(&self, id: &str, state: String) {
        self.upsert(id, |entry| entry.oauth_state = Some(state));
    }

    /// The state can be checked once; a replayed callback finds nothing.
    pub fn take_oauth_state(&self, id: &str) -> Option<String> {
        self.take(id, |entry| entry.oauth_state.take())
    }

    /// Stashes `job`, replacing any earlier pending one.
    pub fn stash_job(&self, id: &str, job: UploadJob) {
        self.upsert(id, |entry| entry.pending = Some(job));
    }

    pub fn take_job(&self, id: &str) -> Option<UploadJob> {
        self.take(id, |entry| entry.pending.take())
    }

    pub fn phase(&self, id: &str, has_credential: bool) -> SessionPhase {
        if has_credential {
            return SessionPhase::Authenticated;
        }
        let mut entries = self.entries.lock();
        self.purge(&mut entries);
        match entries.get(id) {
            Some(entry) if entry.oauth_state.is_some() => SessionPhase::PendingCallback,
            _ => SessionPhase::Unauthenticated,
        }
    }

    pub fn remove(&self, id: &str) {
        self.entries.lock().remove(id);
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        let mut entries = self.entries.lock();
        self.purge(&mut entries);
        entries.len()
    }

    #[cfg(test)]
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn upsert(&self, id: &str, f: impl FnOnce(&mut SessionState)) {
        let mut entries = self.entries.lock();
        self.purge(&mut entries);
        let entry = entries.entry(id.to_string()).or_insert_with(|| {
            debug!("session created");
            SessionState::new()
        });
        entry.touched = Instant::now();
        f(entry);
    }

    fn take<T>(&self, id: &str, f: impl FnOnce(&mut SessionState) -> Option<T>) -> Option<T> {
        let mut entries = self.entries.lock();
        self.purge(&mut entries);
        let entry = entries.get_mut(id)?;
        entry.touched = Instant::now();
        f(entry)
    }

    fn purge(&self, entries: &mut HashMap<String, SessionState>) {
        let ttl = self.ttl;
        entries.retain(|_, entry| entry.touched.elapsed() < ttl);
    }
}

fn new_session_id() -> String {
    let mut bytes = [0u8; ID_BYTES];
    OsRng.fill_bytes(&mut bytes);
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}
