/// Backend interfaces
///
/// The client never owns storage, auth or change delivery. Everything it needs
/// from the hosted backend goes through the three traits below:
/// - `DataStore`: row queries, inserts and deletes
/// - `AuthProvider`: session snapshot, session change stream, sign-in flows
/// - `Realtime`: per-channel row change subscriptions

pub mod memory;
pub mod realtime;
pub mod rest;
pub mod subscription;

pub use memory::InMemoryBackend;
pub use realtime::RealtimeClient;
pub use rest::RestBackend;
pub use subscription::Subscription;

use crate::{
    error::{WallError, WallResult},
    model::Session,
};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde_json::Value;

/// Raw row as returned by the store
pub type Row = Value;

/// Equality predicate on one column
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Filter {
    pub column: String,
    pub value: String,
}

impl Filter {
    pub fn eq(column: impl Into<String>, value: impl ToString) -> Self {
        Self {
            column: column.into(),
            value: value.to_string(),
        }
    }

    /// Whether `row` satisfies this predicate
    pub fn matches(&self, row: &Row) -> bool {
        match row.get(&self.column) {
            Some(Value::String(s)) => *s == self.value,
            Some(Value::Number(n)) => n.to_string() == self.value,
            Some(Value::Bool(b)) => b.to_string() == self.value,
            _ => false,
        }
    }
}

/// Result ordering
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Order {
    pub column: String,
    pub ascending: bool,
}

/// Select over one collection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Query {
    pub collection: String,
    pub filters: Vec<Filter>,
    pub order: Option<Order>,
    pub limit: Option<usize>,
}

impl Query {
    pub fn from(collection: impl Into<String>) -> Self {
        Self {
            collection: collection.into(),
            filters: Vec::new(),
            order: None,
            limit: None,
        }
    }

    pub fn eq(mut self, column: impl Into<String>, value: impl ToString) -> Self {
        self.filters.push(Filter::eq(column, value));
        self
    }

    pub fn order_by(mut self, column: impl Into<String>, ascending: bool) -> Self {
        self.order = Some(Order {
            column: column.into(),
            ascending,
        });
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }
}

/// Kind of row change a subscription listens for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Insert,
    Update,
    Delete,
    /// Any of the above
    All,
}

impl ChangeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeKind::Insert => "INSERT",
            ChangeKind::Update => "UPDATE",
            ChangeKind::Delete => "DELETE",
            ChangeKind::All => "*",
        }
    }

    pub fn accepts(&self, other: ChangeKind) -> bool {
        *self == ChangeKind::All || *self == other
    }
}

/// One listener on a realtime channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeFilter {
    pub event: ChangeKind,
    pub collection: String,
    pub filter: Option<Filter>,
}

impl ChangeFilter {
    pub fn new(event: ChangeKind, collection: impl Into<String>) -> Self {
        Self {
            event,
            collection: collection.into(),
            filter: None,
        }
    }

    pub fn with_filter(mut self, filter: Filter) -> Self {
        self.filter = Some(filter);
        self
    }

    /// Whether a notification has this listener's kind and collection,
    /// leaving the row predicate to the server that evaluated it
    ///
    /// Hosted deletes usually carry only the primary key in `old_record`,
    /// so the row filter cannot be re-checked on the client.
    pub fn covers(&self, event: &ChangeEvent) -> bool {
        match event.kind() {
            Some(kind) => {
                self.event.accepts(kind) && event.collection() == Some(self.collection.as_str())
            }
            None => true,
        }
    }

    /// Whether a change notification falls under this listener
    pub fn matches(&self, event: &ChangeEvent) -> bool {
        let Some(kind) = event.kind() else {
            return true;
        };
        if !self.event.accepts(kind) || event.collection() != Some(self.collection.as_str()) {
            return false;
        }
        match (&self.filter, event.row()) {
            (None, _) => true,
            (Some(filter), Some(row)) => filter.matches(row),
            (Some(_), None) => false,
        }
    }
}

/// Row-level change notification
#[derive(Debug, Clone, PartialEq)]
pub enum ChangeEvent {
    Insert {
        collection: String,
        record: Row,
    },
    Update {
        collection: String,
        record: Row,
        old_record: Row,
    },
    Delete {
        collection: String,
        old_record: Row,
    },
    /// The transport reconnected; anything may have been missed
    Resync,
}

impl ChangeEvent {
    pub fn kind(&self) -> Option<ChangeKind> {
        match self {
            ChangeEvent::Insert { .. } => Some(ChangeKind::Insert),
            ChangeEvent::Update { .. } => Some(ChangeKind::Update),
            ChangeEvent::Delete { .. } => Some(ChangeKind::Delete),
            ChangeEvent::Resync => None,
        }
    }

    pub fn collection(&self) -> Option<&str> {
        match self {
            ChangeEvent::Insert { collection, .. }
            | ChangeEvent::Update { collection, .. }
            | ChangeEvent::Delete { collection, .. } => Some(collection.as_str()),
            ChangeEvent::Resync => None,
        }
    }

    /// Row used for filter matching: the new record, or the old one for deletes
    pub fn row(&self) -> Option<&Row> {
        match self {
            ChangeEvent::Insert { record, .. } | ChangeEvent::Update { record, .. } => Some(record),
            ChangeEvent::Delete { old_record, .. } => Some(old_record),
            ChangeEvent::Resync => None,
        }
    }
}

/// Row query and write interface
#[async_trait]
pub trait DataStore: Send + Sync {
    /// Select rows matching `query`, in the query's order
    async fn select(&self, query: &Query) -> WallResult<Vec<Row>>;

    /// Insert one row and return it as stored
    async fn insert(&self, collection: &str, row: Row) -> WallResult<Row>;

    /// Delete every row matching all `filters`
    async fn delete(&self, collection: &str, filters: &[Filter]) -> WallResult<()>;
}

/// Session and sign-in interface
#[async_trait]
pub trait AuthProvider: Send + Sync {
    async fn get_session(&self) -> WallResult<Option<Session>>;

    /// Stream of session replacements; the current value is not replayed
    async fn session_changes(&self) -> WallResult<Subscription<Option<Session>>>;

    async fn send_magic_link(&self, email: &str, redirect_to: Option<&str>) -> WallResult<()>;

    async fn verify_otp(&self, email: &str, code: &str) -> WallResult<Session>;

    async fn sign_in_anonymously(&self) -> WallResult<Session>;

    fn oauth_authorize_url(&self, provider: &str, redirect_to: &str) -> WallResult<String>;

    async fn sign_out(&self) -> WallResult<()>;
}

/// Row change subscription interface
#[async_trait]
pub trait Realtime: Send + Sync {
    /// Open `channel` with the given listeners; dropping the handle unsubscribes
    async fn subscribe(
        &self,
        channel: &str,
        listeners: Vec<ChangeFilter>,
    ) -> WallResult<Subscription<ChangeEvent>>;
}

/// Decode raw rows into typed entities
pub fn decode_rows<T: DeserializeOwned>(rows: Vec<Row>) -> WallResult<Vec<T>> {
    rows.into_iter()
        .map(|row| serde_json::from_value(row).map_err(WallError::from))
        .collect()
}

/// Decode exactly one row
pub fn decode_row<T: DeserializeOwned>(row: Row) -> WallResult<T> {
    Ok(serde_json::from_value(row)?)
}
