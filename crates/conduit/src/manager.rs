use std::{
    collections::HashMap,
    io,
    net::SocketAddr,
    sync::{Arc, Condvar, Mutex, PoisonError, Weak},
    thread,
    time::{Duration, Instant},
};

use rand::Rng;
use tracing::debug;

use crate::{
    comm::Comm,
    error::ErrorKind,
    event::{ConnectionInitializer, DispatchHandler, Event},
    lock,
};

#[derive(Clone, Copy)]
enum EntryState {
    Connecting { since: Instant },
    Connected,
    Waiting { retry_at: Instant },
}

struct Entry {
    handler: Arc<dyn DispatchHandler>,
    initializer: Option<Arc<dyn ConnectionInitializer>>,
    state: EntryState,
    backoff: Duration,
}

struct MgrState {
    entries: HashMap<SocketAddr, Entry>,
    shutdown: bool,
}

struct Shared {
    comm: Arc<Comm>,
    state: Mutex<MgrState>,
    cond: Condvar,
}

/// Keeps a set of peers connected.
///
/// Each managed peer is (re)connected in the background on an exponential
/// backoff schedule (initial and cap from the comm config, ±20 % jitter),
/// with a per-attempt connect timeout that surfaces `CommConnectFailure` to
/// the entry's handler. Connection events flow through to the application
/// handler unchanged.
pub struct ConnectionManager {
    shared: Arc<Shared>,
    thread: Option<thread::JoinHandle<()>>,
}

impl ConnectionManager {
    pub fn new(comm: Arc<Comm>) -> io::Result<Self> {
        let shared = Arc::new(Shared {
            comm,
            state: Mutex::new(MgrState { entries: HashMap::new(), shutdown: false }),
            cond: Condvar::new(),
        });
        let runner = shared.clone();
        let thread =
            thread::Builder::new().name("conduit-connmgr".into()).spawn(move || run(&runner))?;
        Ok(Self { shared, thread: Some(thread) })
    }

    /// Adds `peer` to the managed set; the first connect attempt starts
    /// immediately. Adding an already-managed peer is a no-op.
    pub fn add(&self, peer: SocketAddr, handler: Arc<dyn DispatchHandler>) {
        self.add_with_initializer(peer, handler, None);
    }

    pub fn add_with_initializer(
        &self,
        peer: SocketAddr,
        handler: Arc<dyn DispatchHandler>,
        initializer: Option<Arc<dyn ConnectionInitializer>>,
    ) {
        let mut state = lock::mutex(&self.shared.state);
        if state.entries.contains_key(&peer) {
            return;
        }
        let backoff = self.shared.comm.config().reconnect_initial();
        let _ = state.entries.insert(
            peer,
            Entry {
                handler,
                initializer,
                state: EntryState::Waiting { retry_at: Instant::now() },
                backoff,
            },
        );
        drop(state);
        self.shared.cond.notify_all();
    }

    /// Drops `peer` from the managed set and closes any open connection.
    pub fn remove(&self, peer: SocketAddr) {
        let removed = lock::mutex(&self.shared.state).entries.remove(&peer).is_some();
        if removed {
            let _ = self.shared.comm.close(peer);
            self.shared.cond.notify_all();
        }
    }

    /// Blocks until `peer` reaches the connected state or `max_wait`
    /// elapses. Returns false immediately for unmanaged peers.
    pub fn wait_for_connection(&self, peer: SocketAddr, max_wait: Duration) -> bool {
        let deadline = Instant::now() + max_wait;
        let mut state = lock::mutex(&self.shared.state);
        loop {
            match state.entries.get(&peer) {
                Some(entry) if matches!(entry.state, EntryState::Connected) => return true,
                Some(_) => {}
                None => return false,
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            let (guard, _) = self
                .shared
                .cond
                .wait_timeout(state, deadline - now)
                .unwrap_or_else(PoisonError::into_inner);
            state = guard;
        }
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        lock::mutex(&self.shared.state).shutdown = true;
        self.shared.cond.notify_all();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

/// Wraps the application handler so the manager observes connection state
/// transitions without getting between the app and its events.
struct ManagerHandler {
    shared: Weak<Shared>,
    peer: SocketAddr,
    app: Arc<dyn DispatchHandler>,
}

impl DispatchHandler for ManagerHandler {
    fn handle(&self, event: Event) {
        if let Some(shared) = self.shared.upgrade() {
            match &event {
                Event::Connected { .. } => shared.note_connected(self.peer),
                Event::Disconnected { .. } |
                Event::Error { kind: ErrorKind::CommConnectFailure, .. } => {
                    shared.note_disconnected(self.peer);
                }
                _ => {}
            }
        }
        self.app.handle(event);
    }
}

impl Shared {
    fn note_connected(&self, peer: SocketAddr) {
        let mut state = lock::mutex(&self.state);
        if let Some(entry) = state.entries.get_mut(&peer) {
            entry.state = EntryState::Connected;
            entry.backoff = self.comm.config().reconnect_initial();
        }
        drop(state);
        self.cond.notify_all();
    }

    fn note_disconnected(&self, peer: SocketAddr) {
        let mut state = lock::mutex(&self.state);
        if let Some(entry) = state.entries.get_mut(&peer) {
            // The connect-timeout path may already have scheduled the retry.
            if !matches!(entry.state, EntryState::Waiting { .. }) {
                entry.state = EntryState::Waiting { retry_at: Instant::now() + jittered(entry.backoff) };
                entry.backoff = (entry.backoff * 2).min(self.comm.config().reconnect_max());
            }
        }
        drop(state);
        self.cond.notify_all();
    }
}

fn run(shared: &Arc<Shared>) {
    let connect_timeout = shared.comm.config().connect_timeout();
    let reconnect_max = shared.comm.config().reconnect_max();
    let mut guard = lock::mutex(&shared.state);
    loop {
        if guard.shutdown {
            break;
        }
        let now = Instant::now();
        let mut next_wake: Option<Instant> = None;
        let mut attempts = Vec::new();
        let mut failures = Vec::new();

        for (&peer, entry) in &mut guard.entries {
            match entry.state {
                EntryState::Waiting { retry_at } => {
                    if retry_at <= now {
                        entry.state = EntryState::Connecting { since: now };
                        attempts.push((peer, entry.handler.clone(), entry.initializer.clone()));
                        merge_wake(&mut next_wake, now + connect_timeout);
                    } else {
                        merge_wake(&mut next_wake, retry_at);
                    }
                }
                EntryState::Connecting { since } => {
                    let deadline = since + connect_timeout;
                    if deadline <= now {
                        let retry_at = now + jittered(entry.backoff);
                        entry.state = EntryState::Waiting { retry_at };
                        entry.backoff = (entry.backoff * 2).min(reconnect_max);
                        failures.push((peer, entry.handler.clone()));
                        merge_wake(&mut next_wake, retry_at);
                    } else {
                        merge_wake(&mut next_wake, deadline);
                    }
                }
                EntryState::Connected => {}
            }
        }

        // Connects and handler invocations run without the lock; handlers on
        // reactor threads take it to report state changes.
        if !attempts.is_empty() || !failures.is_empty() {
            drop(guard);
            for (peer, handler, initializer) in attempts {
                let wrapper: Arc<dyn DispatchHandler> =
                    Arc::new(ManagerHandler { shared: Arc::downgrade(shared), peer, app: handler });
                match shared.comm.connect_with_initializer(peer, wrapper, initializer) {
                    Ok(()) => {}
                    Err(ErrorKind::CommAlreadyConnected) => shared.note_connected(peer),
                    Err(err) => {
                        debug!(?err, ?peer, "connect attempt failed");
                        shared.note_disconnected(peer);
                    }
                }
            }
            for (peer, handler) in failures {
                let _ = shared.comm.close(peer);
                handler.handle(Event::Error { peer, kind: ErrorKind::CommConnectFailure });
            }
            guard = lock::mutex(&shared.state);
            continue;
        }

        let wait =
            next_wake.map_or(Duration::from_secs(3600), |at| at.saturating_duration_since(now));
        let (next, _) = shared
            .cond
            .wait_timeout(guard, wait)
            .unwrap_or_else(PoisonError::into_inner);
        guard = next;
    }
}

fn merge_wake(next: &mut Option<Instant>, at: Instant) {
    *next = Some(next.map_or(at, |cur| cur.min(at)));
}

fn jittered(base: Duration) -> Duration {
    base.mul_f64(rand::rng().random_range(0.8..1.2))
}
