use metrics::{counter, gauge};
use rand_core::{OsRng, RngCore};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

struct Entry {
    secret_key: i32,
    kill: CancellationToken,
}

struct Table {
    next_pid: i32,
    live: HashMap<i32, Entry>,
}

/// Process-wide table of live sessions, keyed by process id.
///
/// The table never owns a session. It keeps the secret key and the kill
/// signal the session's reader listens on, which is all a cancel request may
/// touch.
pub struct ProcessTable {
    inner: Mutex<Table>,
}

impl Default for ProcessTable {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessTable {
    pub fn new() -> Self {
        Self::starting_at(1)
    }

    /// Starts the pid counter at `pid`.
    pub fn starting_at(pid: i32) -> Self {
        Self {
            inner: Mutex::new(Table {
                next_pid: pid,
                live: HashMap::new(),
            }),
        }
    }

    /// Registers a new session with a fresh pid and a random secret key.
    /// The registration lasts as long as the returned slot.
    pub fn allocate(self: &Arc<Self>) -> ProcessSlot {
        self.allocate_with_key(OsRng.next_u32() as i32)
    }

    pub fn allocate_with_key(self: &Arc<Self>, secret_key: i32) -> ProcessSlot {
        let mut table = self.lock();
        self.register(&mut table, secret_key, CancellationToken::new())
    }

    /// Registers a session that will listen on `kill`, unless `limit`
    /// sessions are already live. A `limit` of 0 means unlimited.
    pub fn try_allocate(
        self: &Arc<Self>,
        limit: usize,
        kill: CancellationToken,
    ) -> Option<ProcessSlot> {
        let mut table = self.lock();
        if limit > 0 && table.live.len() >= limit {
            return None;
        }
        Some(self.register(&mut table, OsRng.next_u32() as i32, kill))
    }

    fn register(
        self: &Arc<Self>,
        table: &mut Table,
        secret_key: i32,
        kill: CancellationToken,
    ) -> ProcessSlot {
        let mut pid = table.next_pid;
        loop {
            if pid <= 0 {
                pid = 1;
            }
            if !table.live.contains_key(&pid) {
                break;
            }
            pid = pid.wrapping_add(1);
        }
        table.next_pid = pid.wrapping_add(1);
        table.live.insert(
            pid,
            Entry {
                secret_key,
                kill: kill.clone(),
            },
        );
        gauge!("pgsession_sessions_live").set(table.live.len() as f64);
        ProcessSlot {
            table: Arc::clone(self),
            pid,
            secret_key,
            kill,
        }
    }

    /// Kills the session `pid` if `secret_key` is its key. Returns whether a
    /// session was killed; cancel requests never get a reply either way.
    pub fn cancel(&self, pid: i32, secret_key: i32) -> bool {
        let table = self.lock();
        let outcome = match table.live.get(&pid) {
            Some(entry) if entry.secret_key == secret_key => {
                entry.kill.cancel();
                info!(pid, "session killed by cancel request");
                "killed"
            }
            Some(_) => {
                warn!(pid, "cancel request with wrong secret key ignored");
                "key_mismatch"
            }
            None => {
                warn!(pid, "cancel request for unknown process ignored");
                "not_found"
            }
        };
        counter!("pgsession_cancel_requests_total", "outcome" => outcome).increment(1);
        outcome == "killed"
    }

    pub fn live_count(&self) -> usize {
        self.lock().live.len()
    }

    pub fn contains(&self, pid: i32) -> bool {
        self.lock().live.contains_key(&pid)
    }

    fn release(&self, pid: i32) {
        let mut table = self.lock();
        table.live.remove(&pid);
        gauge!("pgsession_sessions_live").set(table.live.len() as f64);
    }

    fn lock(&self) -> MutexGuard<'_, Table> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// A session's registration. Dropping it frees the pid.
pub struct ProcessSlot {
    table: Arc<ProcessTable>,
    pid: i32,
    secret_key: i32,
    kill: CancellationToken,
}

impl ProcessSlot {
    pub fn pid(&self) -> i32 {
        self.pid
    }

    pub fn secret_key(&self) -> i32 {
        self.secret_key
    }

    /// Fires when a matching cancel request arrives.
    pub fn kill_signal(&self) -> CancellationToken {
        self.kill.clone()
    }
}

impl Drop for ProcessSlot {
    fn drop(&mut self) {
        self.table.release(self.pid);
    }
}
