//! Registry of detached sessions awaiting resumption.
//!
//! The registry owns every detached session by value: a session is either
//! attached to a stream or stored here, never both. Entries expire once
//! their TTL elapses; a background sweep reclaims them and leaves a
//! tombstone so that a late `<resume/>` is answered with "expired" rather
//! than "not found".

use crate::config::sweep_interval_for;
use crate::error::{DetachError, RegistryError, ResumeError, SessionError};
use crate::session::{ResumptionId, SessionState, StreamManagementSession};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use sm_storage::SequenceValue;
use sm_wire::Namespace;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio::time::{interval, Duration, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

/// A detached session and when it was parked
#[derive(Debug)]
struct DetachedEntry {
    session: StreamManagementSession,
    detached_at: Instant,
    ttl: Duration,
}

impl DetachedEntry {
    fn is_expired(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.detached_at) >= self.ttl
    }
}

/// Read-only view of a detached session
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DetachedSnapshot {
    /// Resumption identifier
    pub resumption_id: ResumptionId,
    /// Namespace negotiated by `<enable/>`
    pub namespace: Option<Namespace>,
    /// Last stanza value sent
    pub outbound_h: SequenceValue,
    /// Stanzas handled from the peer
    pub inbound_h: SequenceValue,
    /// Stanzas awaiting acknowledgment
    pub unacked: usize,
    /// Time spent detached
    pub detached_for: Duration,
    /// Time left before expiry
    pub remaining: Duration,
}

/// Detached sessions keyed by resumption identifier
#[derive(Debug)]
pub struct ResumptionRegistry {
    detached: Arc<DashMap<ResumptionId, DetachedEntry>>,
    /// Identifiers that expired recently, with their expiry time
    expired: Arc<DashMap<ResumptionId, Instant>>,
    ttl: Duration,
    sweep_handle: Arc<RwLock<Option<tokio::task::JoinHandle<()>>>>,
    shut_down: AtomicBool,
}

impl ResumptionRegistry {
    /// Create an empty registry whose entries live for `ttl`
    pub fn new(ttl: Duration) -> Self {
        Self {
            detached: Arc::new(DashMap::new()),
            expired: Arc::new(DashMap::new()),
            ttl,
            sweep_handle: Arc::new(RwLock::new(None)),
            shut_down: AtomicBool::new(false),
        }
    }

    /// Resumption window applied to new entries
    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Start the periodic expiry sweep. Calling it again restarts the task.
    pub fn start_sweeper(&self) {
        let detached = Arc::clone(&self.detached);
        let expired = Arc::clone(&self.expired);
        let ttl = self.ttl;
        let period = sweep_interval_for(ttl);

        let handle = tokio::spawn(async move {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                ticker.tick().await;
                sweep_expired(&detached, &expired, ttl, Instant::now());
            }
        });

        debug!("Resumption sweep started (every {:?})", period);
        if let Ok(mut guard) = self.sweep_handle.try_write() {
            if let Some(previous) = guard.replace(handle) {
                previous.abort();
            }
        }
    }

    /// Park a detached session until it is resumed or expires.
    ///
    /// A refused session is handed back inside the error.
    pub fn detach(&self, session: StreamManagementSession) -> Result<ResumptionId, DetachError> {
        if self.shut_down.load(Ordering::Acquire) {
            return Err(DetachError {
                reason: RegistryError::ShutDown,
                session,
            });
        }
        let state = session.state();
        let id = match (state, session.resumption_id()) {
            (SessionState::Detached, Some(id)) => id.clone(),
            _ => {
                return Err(DetachError {
                    reason: RegistryError::NotResumable { state },
                    session,
                })
            }
        };

        match self.detached.entry(id.clone()) {
            Entry::Occupied(_) => Err(DetachError {
                reason: RegistryError::Duplicate(id),
                session,
            }),
            Entry::Vacant(vacant) => {
                debug!(
                    "[{}] Parked for resumption as {} ({} unacknowledged)",
                    session.label(),
                    id,
                    session.unacked_len()
                );
                vacant.insert(DetachedEntry {
                    session,
                    detached_at: Instant::now(),
                    ttl: self.ttl,
                });
                Ok(id)
            }
        }
    }

    /// Inspect a detached session without taking it
    pub fn lookup(&self, id: &ResumptionId) -> Result<DetachedSnapshot, ResumeError> {
        let now = Instant::now();
        match self.detached.entry(id.clone()) {
            Entry::Occupied(occupied) if occupied.get().is_expired(now) => {
                let (id, entry) = occupied.remove_entry();
                self.bury(id.clone(), entry, now);
                Err(ResumeError::Expired(id))
            }
            Entry::Occupied(occupied) => {
                let entry = occupied.get();
                let detached_for = now.saturating_duration_since(entry.detached_at);
                Ok(DetachedSnapshot {
                    resumption_id: id.clone(),
                    namespace: entry.session.namespace(),
                    outbound_h: entry.session.outbound_h(),
                    inbound_h: entry.session.inbound_h(),
                    unacked: entry.session.unacked_len(),
                    detached_for,
                    remaining: entry.ttl.saturating_sub(detached_for),
                })
            }
            Entry::Vacant(vacant) => {
                drop(vacant);
                Err(self.missing(id))
            }
        }
    }

    /// Take a detached session out of the registry
    pub fn remove(&self, id: &ResumptionId) -> Option<StreamManagementSession> {
        self.detached.remove(id).map(|(_, entry)| entry.session)
    }

    /// Atomically look up, validate and take a detached session.
    ///
    /// `resume` runs while the entry is locked, so two connections racing to
    /// resume the same identifier cannot both succeed. On a non-fatal error
    /// the session stays parked; on a fatal one it is dropped.
    pub fn resume_with<T, F>(&self, id: &ResumptionId, resume: F) -> Result<(StreamManagementSession, T), ResumeError>
    where
        F: FnOnce(&mut StreamManagementSession) -> Result<T, SessionError>,
    {
        let now = Instant::now();
        match self.detached.entry(id.clone()) {
            Entry::Occupied(occupied) if occupied.get().is_expired(now) => {
                let (id, entry) = occupied.remove_entry();
                self.bury(id.clone(), entry, now);
                Err(ResumeError::Expired(id))
            }
            Entry::Occupied(mut occupied) => match resume(&mut occupied.get_mut().session) {
                Ok(value) => {
                    let entry = occupied.remove();
                    Ok((entry.session, value))
                }
                Err(err) if err.is_fatal() => {
                    let entry = occupied.remove();
                    warn!(
                        "[{}] Resumption of {} rejected, session dropped: {}",
                        entry.session.label(),
                        id,
                        err
                    );
                    Err(err.into())
                }
                Err(err) => Err(err.into()),
            },
            Entry::Vacant(vacant) => {
                drop(vacant);
                Err(self.missing(id))
            }
        }
    }

    /// Expire every entry past its TTL, returning how many went
    pub fn sweep(&self) -> usize {
        sweep_expired(&self.detached, &self.expired, self.ttl, Instant::now())
    }

    /// Number of detached sessions
    pub fn len(&self) -> usize {
        self.detached.len()
    }

    /// True when no session is detached
    pub fn is_empty(&self) -> bool {
        self.detached.is_empty()
    }

    /// True if `id` names a detached session
    pub fn contains(&self, id: &ResumptionId) -> bool {
        self.detached.contains_key(id)
    }

    /// Stop the sweep and drop every detached session. Later detaches are refused.
    pub async fn shutdown(&self) {
        self.shut_down.store(true, Ordering::Release);
        if let Some(handle) = self.sweep_handle.write().await.take() {
            handle.abort();
        }

        let mut sessions = 0;
        let mut stanzas = 0;
        self.detached.retain(|_, entry| {
            sessions += 1;
            stanzas += entry.session.close().len();
            false
        });
        self.expired.clear();

        if sessions > 0 {
            info!(
                "Resumption registry shut down, dropped {} detached sessions ({} unacknowledged stanzas)",
                sessions, stanzas
            );
        }
    }

    fn bury(&self, id: ResumptionId, mut entry: DetachedEntry, now: Instant) {
        let dropped = entry.session.expire();
        info!(
            "[{}] Resumption window for {} elapsed, {} unacknowledged stanzas dropped",
            entry.session.label(),
            id,
            dropped.len()
        );
        self.expired.insert(id, now);
    }

    fn missing(&self, id: &ResumptionId) -> ResumeError {
        if self.expired.contains_key(id) {
            ResumeError::Expired(id.clone())
        } else {
            ResumeError::NotFound(id.clone())
        }
    }
}

impl Drop for ResumptionRegistry {
    fn drop(&mut self) {
        // Cancel sweep task
        if let Ok(mut guard) = self.sweep_handle.try_write() {
            if let Some(handle) = guard.take() {
                handle.abort();
            }
        }
    }
}

fn sweep_expired(
    detached: &DashMap<ResumptionId, DetachedEntry>,
    expired: &DashMap<ResumptionId, Instant>,
    ttl: Duration,
    now: Instant,
) -> usize {
    let candidates: Vec<ResumptionId> = detached
        .iter()
        .filter(|entry| entry.value().is_expired(now))
        .map(|entry| entry.key().clone())
        .collect();

    let mut count = 0;
    for id in candidates {
        if let Some((id, mut entry)) = detached.remove_if(&id, |_, entry| entry.is_expired(now)) {
            let dropped = entry.session.expire();
            warn!(
                "[{}] Resumption window for {} elapsed, {} unacknowledged stanzas dropped",
                entry.session.label(),
                id,
                dropped.len()
            );
            expired.insert(id, now);
            count += 1;
        }
    }

    // Tombstones outlive their session by one more TTL
    expired.retain(|_, at| now.saturating_duration_since(*at) < ttl);

    if count > 0 {
        debug!("Expired {} detached sessions ({} still resumable)", count, detached.len());
    }
    count
}
