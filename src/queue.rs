//! At-least-once delivery of job ids to workers.
//!
//! Entries are ordered by (not-before, insertion sequence), giving FIFO order
//! among entries that are due. A dequeued entry is claimed by a lease; the
//! entry only goes away when the lease holder acks it. A lease that isn't
//! acked in time is reclaimed and the job delivered again.
//!
//! The job store stays authoritative: entries whose job isn't pending are
//! passed over rather than delivered.
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::Serialize;
use tokio::select;
use tokio::sync::Notify;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, error, trace, warn};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::store::JobStore;
use crate::types::job::{JobId, JobUpdate};
use crate::types::states::JobStatus;

/// Stand-in for deadlines too far off to represent.
const FAR_FUTURE: Duration = Duration::from_secs(86400 * 365 * 30);

/// How soon a job whose recovery failed is tried again.
const RECOVERY_RETRY: Duration = Duration::from_secs(1);

/// Proof that a worker holds the claim on a delivered entry.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub struct LeaseToken(Uuid);

impl fmt::Display for LeaseToken {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

/// A job handed to a worker by `dequeue`.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Delivery {
    pub job: JobId,
    pub lease: LeaseToken,
}

#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize)]
pub struct QueueStats {
    /// entries due now and not leased, including stale ones
    #[serde(rename = "current-entries-ready")]
    pub ready: u64,
    /// entries waiting out a retry delay
    #[serde(rename = "current-entries-delayed")]
    pub delayed: u64,
    /// entries claimed by a worker
    #[serde(rename = "current-entries-leased")]
    pub leased: u64,
    /// cumulative count of leases that expired before being acked
    #[serde(rename = "lease-timeouts")]
    pub lease_timeouts: u64,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd)]
struct EntryKey {
    not_before: Instant,
    seq: u64,
}

struct Lease {
    token: LeaseToken,
    entry: EntryKey,
    worker: usize,
    expires: Instant,
    /// Expired, but its job couldn't be recovered yet. The holder can no
    /// longer use it; `expires` is when recovery is tried again.
    lapsed: bool,
}

#[derive(Default)]
struct State {
    entries: BTreeMap<EntryKey, JobId>,
    /// At most one lease per job.
    leases: HashMap<JobId, Lease>,
    next_seq: u64,
    lease_timeouts: u64,
}

enum Claim {
    Delivered(Delivery),
    /// Nothing deliverable; try again no later than this.
    Idle(Option<Instant>),
}

pub struct Queue {
    store: Arc<JobStore>,
    state: Mutex<State>,
    notify: Notify,
    lease_timeout: Duration,
}

impl Queue {
    pub fn new(store: Arc<JobStore>, lease_timeout: Duration) -> Self {
        Self {
            store,
            state: Mutex::new(State::default()),
            notify: Notify::new(),
            lease_timeout,
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Rebuilds entries for jobs the store knows about but that have no
    /// entry, e.g. after a restart. Jobs left active by a previous process
    /// are treated as if their lease had expired.
    pub fn recover(&self) -> Result<usize> {
        for id in self.store.ids_with_status(JobStatus::Active) {
            recover_abandoned(&self.store, id)?;
        }

        let pending = self.store.ids_with_status(JobStatus::Pending);
        for &id in &pending {
            self.enqueue(id);
        }
        Ok(pending.len())
    }

    /// Makes a job eligible for delivery now.
    pub fn enqueue(&self, id: JobId) {
        self.enqueue_after(id, Duration::ZERO)
    }

    /// Makes a job eligible for delivery once `delay` has passed.
    pub fn enqueue_after(&self, id: JobId, delay: Duration) {
        {
            let mut state = self.lock();
            insert(&mut state, id, later(Instant::now(), delay));
        }
        trace!(job = %id, ?delay, "enqueued");
        self.notify.notify_waiters();
    }

    /// Claims the earliest due entry whose job is pending, waiting up to
    /// `wait` for one to show up. `Ok(None)` means nothing arrived in time.
    pub async fn dequeue(
        &self,
        worker: usize,
        wait: Duration,
    ) -> Result<Option<Delivery>> {
        let deadline = later(Instant::now(), wait);

        loop {
            // Register for wakeups before looking, so an enqueue between the
            // look and the wait isn't missed.
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let now = Instant::now();
            let next_due = {
                let mut state = self.lock();
                self.reclaim(&mut state, now);
                match self.claim(&mut state, worker, now) {
                    Claim::Delivered(delivery) => {
                        debug!(
                            job = %delivery.job,
                            worker,
                            lease = %delivery.lease,
                            "dequeued"
                        );
                        return Ok(Some(delivery));
                    },
                    Claim::Idle(next_due) => next_due,
                }
            };

            if now >= deadline {
                return Ok(None);
            }

            let wake = next_due.map_or(deadline, |t| t.min(deadline));
            select! {
                _ = &mut notified => {},
                _ = sleep_until(wake) => {},
            }
        }
    }

    /// Removes the leased entry for good.
    pub fn ack(&self, id: JobId, token: LeaseToken) -> Result<()> {
        {
            let mut state = self.lock();
            let lease = valid_lease(&state, id, token)?;
            let entry = lease.entry;
            state.leases.remove(&id);
            state.entries.remove(&entry);
        }
        trace!(job = %id, "acked");
        // A job with a lease is passed over, so this may free up a
        // duplicate entry.
        self.notify.notify_waiters();
        Ok(())
    }

    /// Schedules another delivery of a leased job after `delay`. The lease
    /// itself still has to be acked.
    pub fn requeue(
        &self,
        id: JobId,
        token: LeaseToken,
        delay: Duration,
    ) -> Result<()> {
        {
            let mut state = self.lock();
            valid_lease(&state, id, token)?;
            insert(&mut state, id, later(Instant::now(), delay));
        }
        debug!(job = %id, ?delay, "requeued");
        self.notify.notify_waiters();
        Ok(())
    }

    /// Pushes back the expiry of a live lease by a full lease timeout.
    pub fn touch(&self, id: JobId, token: LeaseToken) -> Result<()> {
        let mut state = self.lock();
        valid_lease(&state, id, token)?;
        if let Some(lease) = state.leases.get_mut(&id) {
            lease.expires = later(Instant::now(), self.lease_timeout);
        }
        Ok(())
    }

    pub fn stats(&self) -> QueueStats {
        let state = self.lock();
        let now = Instant::now();
        let leased_entries: Vec<EntryKey> =
            state.leases.values().map(|l| l.entry).collect();

        let mut stats = QueueStats {
            leased: state.leases.len() as u64,
            lease_timeouts: state.lease_timeouts,
            ..Default::default()
        };
        for key in state.entries.keys() {
            if leased_entries.contains(key) {
                continue;
            }
            if key.not_before <= now {
                stats.ready += 1;
            } else {
                stats.delayed += 1;
            }
        }
        stats
    }

    /// Wakes every waiting `dequeue` so it can notice a shutdown.
    pub fn wake_all(&self) {
        self.notify.notify_waiters();
    }

    fn claim(&self, state: &mut State, worker: usize, now: Instant) -> Claim {
        let mut next_due = state.leases.values().map(|l| l.expires).min();

        let mut chosen = None;
        for (key, &id) in state.entries.iter() {
            if key.not_before > now {
                next_due = Some(next_due.map_or(key.not_before, |t| {
                    t.min(key.not_before)
                }));
                break;
            }
            if state.leases.contains_key(&id) {
                continue;
            }
            // Skipped, not removed: the entry may belong to a job that's
            // mid-requeue and will be pending again shortly.
            if self.store.status(id) != Some(JobStatus::Pending) {
                continue;
            }
            chosen = Some((*key, id));
            break;
        }

        let Some((entry, id)) = chosen else {
            return Claim::Idle(next_due);
        };

        let token = LeaseToken(Uuid::new_v4());
        state.leases.insert(
            id,
            Lease {
                token,
                entry,
                worker,
                expires: later(now, self.lease_timeout),
                lapsed: false,
            },
        );

        Claim::Delivered(Delivery { job: id, lease: token })
    }

    /// Drops expired leases, recovering their jobs, and prunes entries of
    /// jobs that have settled.
    fn reclaim(&self, state: &mut State, now: Instant) {
        let expired: Vec<JobId> = state
            .leases
            .iter()
            .filter(|(_, l)| l.expires <= now)
            .map(|(&id, _)| id)
            .collect();

        for id in expired {
            let Some(lease) = state.leases.get_mut(&id) else {
                continue;
            };
            if !lease.lapsed {
                lease.lapsed = true;
                state.lease_timeouts += 1;
                warn!(
                    job = %id,
                    worker = lease.worker,
                    lease = %lease.token,
                    "lease expired"
                );
            }

            // The lease only goes once its job is settled, so a failed
            // recovery is retried rather than stranding the job as active.
            match recover_abandoned(&self.store, id) {
                Ok(()) => {
                    state.leases.remove(&id);
                },
                Err(error) => {
                    error!(job = %id, %error, "couldn't recover abandoned job");
                    if let Some(lease) = state.leases.get_mut(&id) {
                        lease.expires = later(now, RECOVERY_RETRY);
                    }
                },
            }
        }

        let store = &self.store;
        let leases = &state.leases;
        state.entries.retain(|_, id| {
            leases.contains_key(id)
                || !matches!(store.status(*id), Some(s) if s.is_terminal())
        });
    }
}

/// `now + wait`, clamped far in the future instead of overflowing.
fn later(now: Instant, wait: Duration) -> Instant {
    now.checked_add(wait).unwrap_or_else(|| now + FAR_FUTURE)
}

fn insert(state: &mut State, id: JobId, not_before: Instant) {
    let key = EntryKey {
        not_before,
        seq: state.next_seq,
    };
    state.next_seq += 1;
    state.entries.insert(key, id);
}

fn valid_lease(state: &State, id: JobId, token: LeaseToken) -> Result<&Lease> {
    match state.leases.get(&id) {
        Some(lease)
            if lease.token == token
                && !lease.lapsed
                && lease.expires > Instant::now() =>
        {
            Ok(lease)
        },
        _ => Err(Error::InvalidLease(id)),
    }
}

/// Settles a job whose worker went away mid-attempt. The abandoned attempt
/// counts; the job is retried if it has attempts left. Only fails if the
/// store couldn't record the outcome.
fn recover_abandoned(store: &JobStore, id: JobId) -> Result<()> {
    let Ok(job) = store.get(id) else {
        return Ok(());
    };
    if job.status != JobStatus::Active {
        return Ok(());
    }

    let attempts = job.attempts + 1;
    let to = if attempts >= job.max_attempts {
        JobStatus::Failed
    } else {
        JobStatus::Pending
    };

    match store.transition(
        id,
        JobStatus::Active,
        to,
        JobUpdate::finished(attempts, Some("lease expired".into())),
    ) {
        Ok(_) => {
            warn!(job = %id, %to, attempts, "recovered abandoned job");
            Ok(())
        },
        Err(error @ Error::StaleTransition { .. }) => {
            debug!(job = %id, %error, "abandoned job moved on");
            Ok(())
        },
        Err(error) => Err(error),
    }
}
