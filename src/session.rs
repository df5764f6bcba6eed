/// Session tracking
///
/// Holds the latest session snapshot reported by the auth provider. The
/// snapshot is fetched once at start and then replaced by every change
/// notification until the tracker is closed.
use crate::{backend::AuthProvider, model::Session};
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

struct TrackerState {
    alive: bool,
    /// A change notification arrived; the initial fetch must not overwrite it
    notified: bool,
    session: watch::Sender<Option<Session>>,
}

impl TrackerState {
    fn replace(&mut self, next: Option<Session>) -> bool {
        self.session.send_if_modified(|current| {
            if *current == next {
                false
            } else {
                *current = next;
                true
            }
        })
    }
}

/// Read-only view of a tracker's snapshot, cheap to clone into tasks
#[derive(Clone)]
pub struct SessionReader {
    shared: Arc<Mutex<TrackerState>>,
}

impl SessionReader {
    pub fn current(&self) -> Option<Session> {
        self.shared.lock().session.borrow().clone()
    }

    pub fn changes(&self) -> watch::Receiver<Option<Session>> {
        self.shared.lock().session.subscribe()
    }
}

/// Current-session tracker owned by a view
pub struct SessionTracker {
    shared: Arc<Mutex<TrackerState>>,
    task: Option<JoinHandle<()>>,
}

impl SessionTracker {
    /// Subscribe to session changes, then fetch the current snapshot
    pub async fn start(auth: Arc<dyn AuthProvider>) -> Self {
        let (session, _) = watch::channel(None);
        let shared = Arc::new(Mutex::new(TrackerState {
            alive: true,
            notified: false,
            session,
        }));

        let task = match auth.session_changes().await {
            Ok(mut changes) => {
                let shared = shared.clone();
                Some(tokio::spawn(async move {
                    while let Some(next) = changes.recv().await {
                        let mut state = shared.lock();
                        if !state.alive {
                            break;
                        }
                        state.notified = true;
                        if state.replace(next) {
                            debug!("Session changed");
                        }
                    }
                }))
            }
            Err(e) => {
                warn!("Session change subscription failed: {}", e);
                None
            }
        };

        match auth.get_session().await {
            Ok(snapshot) => {
                let mut state = shared.lock();
                if state.alive && !state.notified {
                    state.replace(snapshot);
                }
            }
            Err(e) => warn!("Session fetch failed: {}", e),
        }

        Self { shared, task }
    }

    pub fn current_session(&self) -> Option<Session> {
        self.shared.lock().session.borrow().clone()
    }

    /// Receiver notified whenever the snapshot is replaced
    pub fn changes(&self) -> watch::Receiver<Option<Session>> {
        self.shared.lock().session.subscribe()
    }

    pub fn reader(&self) -> SessionReader {
        SessionReader {
            shared: self.shared.clone(),
        }
    }

    /// Stop tracking; the snapshot is frozen once this returns
    pub fn close(&mut self) {
        self.shared.lock().alive = false;
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

impl Drop for SessionTracker {
    fn drop(&mut self) {
        self.close();
    }
}
