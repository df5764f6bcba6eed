/// In-process backend
///
/// Implements all three backend interfaces over plain JSON rows held in
/// memory. Every insert and delete fans out to matching realtime
/// subscriptions. Used by the test suite and by the binary's offline mode.
use crate::{
    backend::{
        subscription::forward_watch, AuthProvider, ChangeEvent, ChangeFilter, DataStore, Filter,
        Query, Realtime, Row, Subscription,
    },
    error::{WallError, WallResult},
    model::{Identity, Session, User},
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde_json::Value;
use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use tokio::sync::{mpsc, watch};
use tracing::{debug, warn};
use uuid::Uuid;

const SUBSCRIPTION_BUFFER: usize = 256;

/// Write issued against the store, recorded for inspection
#[derive(Debug, Clone, PartialEq)]
pub enum WriteOp {
    Insert { collection: String, row: Row },
    Delete { collection: String, filters: Vec<Filter> },
}

impl WriteOp {
    pub fn collection(&self) -> &str {
        match self {
            WriteOp::Insert { collection, .. } | WriteOp::Delete { collection, .. } => collection,
        }
    }
}

struct Subscriber {
    id: u64,
    channel: String,
    listeners: Vec<ChangeFilter>,
    sender: mpsc::Sender<ChangeEvent>,
}

#[derive(Default)]
struct MemoryState {
    tables: HashMap<String, Vec<Row>>,
    subscribers: Vec<Subscriber>,
    next_subscriber: u64,
    writes: Vec<WriteOp>,
    failing_writes: Vec<String>,
    failing_selects: Vec<String>,
    outbox: HashMap<String, String>,
}

/// Backend living entirely inside the process
pub struct InMemoryBackend {
    state: Arc<Mutex<MemoryState>>,
    session: watch::Sender<Option<Session>>,
}

impl Default for InMemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryBackend {
    pub fn new() -> Self {
        let (session, _) = watch::channel(None);
        Self {
            state: Arc::new(Mutex::new(MemoryState::default())),
            session,
        }
    }

    /// Store a row as-is, without recording a write or notifying subscribers
    pub fn seed(&self, collection: &str, row: Row) {
        let mut state = self.state.lock();
        state
            .tables
            .entry(collection.to_string())
            .or_default()
            .push(row);
    }

    /// All rows of a collection in insertion order
    pub fn rows(&self, collection: &str) -> Vec<Row> {
        self.state
            .lock()
            .tables
            .get(collection)
            .cloned()
            .unwrap_or_default()
    }

    /// Writes issued so far
    pub fn writes(&self) -> Vec<WriteOp> {
        self.state.lock().writes.clone()
    }

    /// Make the next `count` writes fail with `message`
    pub fn fail_next_writes(&self, count: usize, message: &str) {
        let mut state = self.state.lock();
        state
            .failing_writes
            .extend(std::iter::repeat(message.to_string()).take(count));
    }

    /// Make the next `count` selects fail with `message`
    pub fn fail_next_selects(&self, count: usize, message: &str) {
        let mut state = self.state.lock();
        state
            .failing_selects
            .extend(std::iter::repeat(message.to_string()).take(count));
    }

    /// Replace the row with the same `id` and notify subscribers, as an
    /// edit made by another client would
    pub fn update(&self, collection: &str, row: Row) -> bool {
        let mut state = self.state.lock();
        let Some(id) = row.get("id").cloned() else {
            return false;
        };
        let old = state.tables.get_mut(collection).and_then(|rows| {
            rows.iter_mut()
                .find(|existing| existing.get("id") == Some(&id))
                .map(|existing| std::mem::replace(existing, row.clone()))
        });
        match old {
            Some(old_record) => {
                Self::publish(
                    &mut state,
                    ChangeEvent::Update {
                        collection: collection.to_string(),
                        record: row,
                        old_record,
                    },
                );
                true
            }
            None => false,
        }
    }

    /// Deliver an arbitrary notification to matching subscribers
    pub fn emit(&self, event: ChangeEvent) {
        let mut state = self.state.lock();
        Self::publish(&mut state, event);
    }

    /// Channel names with a live subscription
    pub fn open_channels(&self) -> Vec<String> {
        let mut state = self.state.lock();
        state.subscribers.retain(|s| !s.sender.is_closed());
        state.subscribers.iter().map(|s| s.channel.clone()).collect()
    }

    /// Install a session directly, as a completed sign-in would
    pub fn sign_in_as(&self, user_id: &str, email: Option<&str>) -> Session {
        let session = Session {
            user: User {
                id: Identity::new(user_id),
                email: email.map(str::to_string),
            },
            access_token: format!("memory-{}", Uuid::new_v4()),
        };
        self.session.send_replace(Some(session.clone()));
        session
    }

    /// Number of live session change listeners
    pub fn session_watchers(&self) -> usize {
        self.session.receiver_count()
    }

    /// Code most recently issued to `email` by `send_magic_link`
    pub fn issued_code(&self, email: &str) -> Option<String> {
        self.state.lock().outbox.get(&email.to_lowercase()).cloned()
    }

    fn take_write_failure(state: &mut MemoryState) -> Option<String> {
        if state.failing_writes.is_empty() {
            None
        } else {
            Some(state.failing_writes.remove(0))
        }
    }

    fn publish(state: &mut MemoryState, event: ChangeEvent) {
        state.subscribers.retain(|s| !s.sender.is_closed());
        for subscriber in &state.subscribers {
            if subscriber.listeners.iter().any(|l| l.matches(&event)) {
                if let Err(e) = subscriber.sender.try_send(event.clone()) {
                    warn!(
                        "Dropping change for channel {}: {}",
                        subscriber.channel, e
                    );
                }
            }
        }
    }

    fn unsubscribe(state: &Weak<Mutex<MemoryState>>, id: u64) {
        if let Some(state) = state.upgrade() {
            state.lock().subscribers.retain(|s| s.id != id);
        }
    }
}

/// Order two column values; timestamps compare chronologically
fn compare_values(a: Option<&Value>, b: Option<&Value>) -> Ordering {
    match (a, b) {
        (Some(Value::String(a)), Some(Value::String(b))) => {
            match (
                DateTime::parse_from_rfc3339(a),
                DateTime::parse_from_rfc3339(b),
            ) {
                (Ok(a), Ok(b)) => a.cmp(&b),
                _ => a.cmp(b),
            }
        }
        (Some(Value::Number(a)), Some(Value::Number(b))) => a
            .as_f64()
            .partial_cmp(&b.as_f64())
            .unwrap_or(Ordering::Equal),
        (None, Some(_)) | (Some(Value::Null), Some(_)) => Ordering::Greater,
        (Some(_), None) | (Some(_), Some(Value::Null)) => Ordering::Less,
        _ => Ordering::Equal,
    }
}

#[async_trait]
impl DataStore for InMemoryBackend {
    async fn select(&self, query: &Query) -> WallResult<Vec<Row>> {
        let mut state = self.state.lock();
        if !state.failing_selects.is_empty() {
            let message = state.failing_selects.remove(0);
            return Err(WallError::Transport(message));
        }

        let mut rows: Vec<Row> = state
            .tables
            .get(&query.collection)
            .map(|rows| {
                rows.iter()
                    .filter(|row| query.filters.iter().all(|f| f.matches(row)))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();

        if let Some(order) = &query.order {
            rows.sort_by(|a, b| {
                let ord = compare_values(a.get(&order.column), b.get(&order.column));
                if order.ascending {
                    ord
                } else {
                    ord.reverse()
                }
            });
        }
        if let Some(limit) = query.limit {
            rows.truncate(limit);
        }

        debug!("Memory select {}: {} rows", query.collection, rows.len());
        Ok(rows)
    }

    async fn insert(&self, collection: &str, mut row: Row) -> WallResult<Row> {
        let mut state = self.state.lock();
        state.writes.push(WriteOp::Insert {
            collection: collection.to_string(),
            row: row.clone(),
        });
        if let Some(message) = Self::take_write_failure(&mut state) {
            return Err(WallError::Transport(message));
        }

        let Some(object) = row.as_object_mut() else {
            return Err(WallError::Transport("Row must be a JSON object".to_string()));
        };
        object
            .entry("id")
            .or_insert_with(|| Value::String(Uuid::new_v4().to_string()));
        object
            .entry("created_at")
            .or_insert_with(|| Value::String(Utc::now().to_rfc3339()));

        state
            .tables
            .entry(collection.to_string())
            .or_default()
            .push(row.clone());
        Self::publish(
            &mut state,
            ChangeEvent::Insert {
                collection: collection.to_string(),
                record: row.clone(),
            },
        );
        Ok(row)
    }

    async fn delete(&self, collection: &str, filters: &[Filter]) -> WallResult<()> {
        let mut state = self.state.lock();
        state.writes.push(WriteOp::Delete {
            collection: collection.to_string(),
            filters: filters.to_vec(),
        });
        if let Some(message) = Self::take_write_failure(&mut state) {
            return Err(WallError::Transport(message));
        }

        let removed: Vec<Row> = match state.tables.get_mut(collection) {
            Some(rows) => {
                let (gone, kept): (Vec<Row>, Vec<Row>) = rows
                    .drain(..)
                    .partition(|row| filters.iter().all(|f| f.matches(row)));
                *rows = kept;
                gone
            }
            None => Vec::new(),
        };

        for old_record in removed {
            Self::publish(
                &mut state,
                ChangeEvent::Delete {
                    collection: collection.to_string(),
                    old_record,
                },
            );
        }
        Ok(())
    }
}

#[async_trait]
impl AuthProvider for InMemoryBackend {
    async fn get_session(&self) -> WallResult<Option<Session>> {
        Ok(self.session.borrow().clone())
    }

    async fn session_changes(&self) -> WallResult<Subscription<Option<Session>>> {
        Ok(forward_watch(self.session.subscribe(), SUBSCRIPTION_BUFFER))
    }

    async fn send_magic_link(&self, email: &str, _redirect_to: Option<&str>) -> WallResult<()> {
        let code = format!("{:06}", Uuid::new_v4().as_u128() % 1_000_000);
        self.state.lock().outbox.insert(email.to_lowercase(), code);
        Ok(())
    }

    async fn verify_otp(&self, email: &str, code: &str) -> WallResult<Session> {
        let issued = self.issued_code(email);
        if issued.as_deref() != Some(code) {
            return Err(WallError::Transport("Token has expired or is invalid".to_string()));
        }
        self.state.lock().outbox.remove(&email.to_lowercase());
        let user_id = format!("user:{}", email.to_lowercase());
        Ok(self.sign_in_as(&user_id, Some(email)))
    }

    async fn sign_in_anonymously(&self) -> WallResult<Session> {
        Ok(self.sign_in_as(&Uuid::new_v4().to_string(), None))
    }

    fn oauth_authorize_url(&self, provider: &str, redirect_to: &str) -> WallResult<String> {
        Ok(format!(
            "memory://authorize?provider={}&redirect_to={}",
            urlencoding::encode(provider),
            urlencoding::encode(redirect_to)
        ))
    }

    async fn sign_out(&self) -> WallResult<()> {
        self.session.send_replace(None);
        Ok(())
    }
}

#[async_trait]
impl Realtime for InMemoryBackend {
    async fn subscribe(
        &self,
        channel: &str,
        listeners: Vec<ChangeFilter>,
    ) -> WallResult<Subscription<ChangeEvent>> {
        let (sender, receiver) = mpsc::channel(SUBSCRIPTION_BUFFER);
        let id = {
            let mut state = self.state.lock();
            state.next_subscriber += 1;
            let id = state.next_subscriber;
            state.subscribers.push(Subscriber {
                id,
                channel: channel.to_string(),
                listeners,
                sender,
            });
            id
        };
        debug!("Memory channel {} subscribed", channel);

        let weak = Arc::downgrade(&self.state);
        Ok(Subscription::new(receiver, move || {
            InMemoryBackend::unsubscribe(&weak, id)
        }))
    }
}
