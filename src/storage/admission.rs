use std::collections::{HashMap, HashSet, VecDeque};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) enum Access {
    Read,
    Write,
    /// No other operation may be active anywhere on the node.
    Exclusive,
}

/// Node-wide arbitration of local block file access.
///
/// A path is touched by at most one admitted operation at a time, and requests for the same path
/// are admitted in arrival order. Reads and writes are balanced node-wide: while writers are
/// active a read is admitted only if `balance` is below the bound, and symmetrically for writes.
/// Admitting an operation nudges `balance` toward its class; completing it nudges it back toward
/// zero. The counters are node-wide, so operations on unrelated files affect each other.
pub(crate) struct AdmissionControl {
    bound: i32,
    state: Mutex<State>,
    changed: Notify,
}

#[derive(Default)]
struct State {
    readers: usize,
    writers: usize,
    balance: i32,
    busy: HashSet<PathBuf>,
    queued: HashMap<PathBuf, VecDeque<u64>>,
    next_ticket: u64,
}

/// Releases the admission when dropped, whether the operation succeeded or not.
pub(crate) struct AdmissionGuard {
    control: Arc<AdmissionControl>,
    path: PathBuf,
    access: Access,
}

impl AdmissionControl {
    pub(crate) fn new(bound: i32) -> Self {
        AdmissionControl {
            bound,
            state: Mutex::new(State::default()),
            changed: Notify::new(),
        }
    }

    pub(crate) async fn admit(self: &Arc<Self>, path: PathBuf, access: Access) -> AdmissionGuard {
        let mut place = {
            let mut state = self.lock();
            let ticket = state.next_ticket;
            state.next_ticket += 1;
            state.queued.entry(path.clone()).or_default().push_back(ticket);
            PlaceInLine {
                control: self,
                path: &path,
                ticket,
                admitted: false,
            }
        };

        loop {
            // Registered before checking, so a release between the check and the await is not
            // missed.
            let changed = self.changed.notified();
            if self.try_admit(place.path, access, place.ticket) {
                place.admitted = true;
                break;
            }
            changed.await;
        }
        drop(place);

        AdmissionGuard {
            control: self.clone(),
            path,
            access,
        }
    }

    fn try_admit(&self, path: &PathBuf, access: Access, ticket: u64) -> bool {
        let mut state = self.lock();
        let first_in_line = state
            .queued
            .get(path)
            .and_then(|queue| queue.front())
            .map_or(false, |front| *front == ticket);
        if !first_in_line || state.busy.contains(path) {
            return false;
        }

        let admitted = match access {
            Access::Read => state.writers == 0 || state.balance < self.bound,
            Access::Write => state.readers == 0 || state.balance > -self.bound,
            Access::Exclusive => state.readers == 0 && state.writers == 0,
        };
        if !admitted {
            return false;
        }

        if let Some(queue) = state.queued.get_mut(path) {
            queue.pop_front();
            if queue.is_empty() {
                state.queued.remove(path);
            }
        }
        state.busy.insert(path.clone());
        match access {
            Access::Read => {
                state.readers += 1;
                state.balance = (state.balance + 1).min(self.bound);
            }
            Access::Write => {
                state.writers += 1;
                state.balance = (state.balance - 1).max(-self.bound);
            }
            Access::Exclusive => {}
        }

        true
    }

    fn release(&self, path: &PathBuf, access: Access) {
        {
            let mut state = self.lock();
            state.busy.remove(path);
            match access {
                Access::Read => {
                    state.readers -= 1;
                    if state.balance > 0 {
                        state.balance -= 1;
                    }
                }
                Access::Write => {
                    state.writers -= 1;
                    if state.balance < 0 {
                        state.balance += 1;
                    }
                }
                Access::Exclusive => {}
            }
        }

        self.changed.notify_waiters();
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().expect("AdmissionControl mutex guard poison")
    }

    #[cfg(test)]
    fn snapshot(&self) -> (usize, usize, i32) {
        let state = self.lock();
        (state.readers, state.writers, state.balance)
    }
}

/// A queued request. Dropping it before admission (the caller gave up) leaves the queue.
struct PlaceInLine<'a> {
    control: &'a AdmissionControl,
    path: &'a PathBuf,
    ticket: u64,
    admitted: bool,
}

impl Drop for PlaceInLine<'_> {
    fn drop(&mut self) {
        if self.admitted {
            return;
        }
        {
            let mut state = self.control.lock();
            if let Some(queue) = state.queued.get_mut(self.path) {
                queue.retain(|ticket| *ticket != self.ticket);
                if queue.is_empty() {
                    state.queued.remove(self.path);
                }
            }
        }
        self.control.changed.notify_waiters();
    }
}

impl Drop for AdmissionGuard {
    fn drop(&mut self) {
        self.control.release(&self.path, self.access);
    }
}
