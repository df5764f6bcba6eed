/// Ordered, deduplicated cache of one entity collection
///
/// Reconciles two signal sources for the same scope:
/// - full reloads, which replace the cache wholesale
/// - incremental inserts from the change stream
///
/// Reloads may complete out of order. Each reload takes a ticket when it is
/// issued; a reload finishing after a later-issued one was applied is
/// dropped, and inserts applied after a reload was issued are merged back on
/// top of its result.
use crate::{
    backend::{decode_row, decode_rows, DataStore, Query, Row},
    error::{WallError, WallResult},
    model::{collections, Comment, Identity, Post},
};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use std::cmp::Ordering;
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{debug, warn};

/// Record kept in an entity cache
pub trait Entity: Clone + DeserializeOwned + Send + Sync + 'static {
    fn identity(&self) -> &Identity;
    fn created_at(&self) -> DateTime<Utc>;
}

impl Entity for Post {
    fn identity(&self) -> &Identity {
        &self.id
    }

    fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }
}

impl Entity for Comment {
    fn identity(&self) -> &Identity {
        &self.id
    }

    fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }
}

/// Visible order of a cache; ties always go to the smaller identity
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortOrder {
    NewestFirst,
    OldestFirst,
}

impl SortOrder {
    fn compare<E: Entity>(&self, a: &E, b: &E) -> Ordering {
        let by_time = match self {
            SortOrder::NewestFirst => b.created_at().cmp(&a.created_at()),
            SortOrder::OldestFirst => a.created_at().cmp(&b.created_at()),
        };
        by_time.then_with(|| a.identity().cmp(b.identity()))
    }
}

/// Issue stamp of a full reload
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct LoadTicket(u64);

/// Synchronous cache state; every method runs to completion under the lock
#[derive(Debug)]
pub struct CacheState<E> {
    order: SortOrder,
    entries: Vec<E>,
    clock: u64,
    applied_load: Option<u64>,
    /// Tickets of reloads issued but not yet completed or abandoned
    loads_in_flight: BTreeSet<u64>,
    /// Inserts applied while a reload was in flight
    recent_inserts: Vec<(u64, E)>,
    closed: bool,
}

impl<E: Entity> CacheState<E> {
    pub fn new(order: SortOrder) -> Self {
        Self {
            order,
            entries: Vec::new(),
            clock: 0,
            applied_load: None,
            loads_in_flight: BTreeSet::new(),
            recent_inserts: Vec::new(),
            closed: false,
        }
    }

    pub fn entries(&self) -> &[E] {
        &self.entries
    }

    /// Number of journaled inserts kept for in-flight reloads
    pub fn journal_len(&self) -> usize {
        self.recent_inserts.len()
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn begin_load(&mut self) -> LoadTicket {
        self.clock += 1;
        self.loads_in_flight.insert(self.clock);
        LoadTicket(self.clock)
    }

    /// Forget a reload that will never complete
    pub fn abandon_load(&mut self, ticket: LoadTicket) {
        self.loads_in_flight.remove(&ticket.0);
        self.prune_journal();
    }

    /// Apply a reload result; returns false when it was superseded or the
    /// cache is closed
    pub fn complete_load(&mut self, ticket: LoadTicket, loaded: Vec<E>) -> bool {
        self.loads_in_flight.remove(&ticket.0);
        if self.closed || self.applied_load.is_some_and(|applied| applied > ticket.0) {
            self.prune_journal();
            return false;
        }

        self.entries.clear();
        for entity in loaded {
            self.merge(entity);
        }
        let newer: Vec<E> = self
            .recent_inserts
            .iter()
            .filter(|(stamp, _)| *stamp > ticket.0)
            .map(|(_, entity)| entity.clone())
            .collect();
        for entity in newer {
            self.merge(entity);
        }

        self.applied_load = Some(ticket.0);
        self.prune_journal();
        self.sort();
        true
    }

    /// Merge one entity by identity; idempotent
    pub fn apply_insert(&mut self, entity: E) {
        if self.closed {
            return;
        }
        self.clock += 1;
        if !self.loads_in_flight.is_empty() {
            self.recent_inserts.push((self.clock, entity.clone()));
        }
        self.merge(entity);
        self.sort();
    }

    /// Stop accepting reload results and inserts
    pub fn close(&mut self) {
        self.closed = true;
        self.loads_in_flight.clear();
        self.recent_inserts.clear();
    }

    /// Keep only inserts that a reload still in flight could miss
    fn prune_journal(&mut self) {
        match self.loads_in_flight.first().copied() {
            Some(oldest) => {
                let floor = self.applied_load.map_or(oldest, |applied| applied.max(oldest));
                self.recent_inserts.retain(|(stamp, _)| *stamp > floor);
            }
            None => self.recent_inserts.clear(),
        }
    }

    /// Drop an entity known to be deleted so no pending reload brings it back
    pub fn forget(&mut self, id: &Identity) {
        self.entries.retain(|e| e.identity() != id);
        self.recent_inserts.retain(|(_, e)| e.identity() != id);
    }

    fn merge(&mut self, entity: E) {
        match self
            .entries
            .iter_mut()
            .find(|e| e.identity() == entity.identity())
        {
            Some(existing) => *existing = entity,
            None => self.entries.push(entity),
        }
    }

    fn sort(&mut self) {
        let order = self.order;
        self.entries.sort_by(|a, b| order.compare(a, b));
    }
}

/// Reload ticket that is abandoned unless completed, so a failed or
/// cancelled reload does not keep the insert journal alive
struct PendingLoad<'a, E: Entity> {
    state: &'a Mutex<CacheState<E>>,
    ticket: Option<LoadTicket>,
}

impl<E: Entity> Drop for PendingLoad<'_, E> {
    fn drop(&mut self) {
        if let Some(ticket) = self.ticket.take() {
            self.state.lock().abandon_load(ticket);
        }
    }
}

/// Entity cache bound to a store query
pub struct EntityCache<E> {
    state: Arc<Mutex<CacheState<E>>>,
    scope: Query,
    store: Arc<dyn DataStore>,
}

impl<E> Clone for EntityCache<E> {
    fn clone(&self) -> Self {
        Self {
            state: self.state.clone(),
            scope: self.scope.clone(),
            store: self.store.clone(),
        }
    }
}

impl<E: Entity> EntityCache<E> {
    pub fn new(store: Arc<dyn DataStore>, scope: Query, order: SortOrder) -> Self {
        Self {
            state: Arc::new(Mutex::new(CacheState::new(order))),
            scope,
            store,
        }
    }

    pub fn scope(&self) -> &Query {
        &self.scope
    }

    /// Full reload; on failure the cache keeps its previous contents
    pub async fn load(&self) -> WallResult<Vec<E>> {
        let mut pending = PendingLoad {
            state: &self.state,
            ticket: Some(self.state.lock().begin_load()),
        };

        let loaded = self
            .store
            .select(&self.scope)
            .await
            .and_then(decode_rows::<E>)
            .map_err(WallError::into_fetch);
        let loaded = match loaded {
            Ok(loaded) => loaded,
            Err(e) => {
                warn!("Reload of {} failed: {}", self.scope.collection, e);
                return Err(e);
            }
        };

        let mut state = self.state.lock();
        if let Some(ticket) = pending.ticket.take() {
            if state.complete_load(ticket, loaded) {
                debug!(
                    "Reloaded {}: {} entries",
                    self.scope.collection,
                    state.entries().len()
                );
            } else {
                debug!("Discarded reload of {}", self.scope.collection);
            }
        }
        Ok(state.entries().to_vec())
    }

    pub fn apply_insert(&self, entity: E) {
        self.state.lock().apply_insert(entity);
    }

    /// Decode a change-stream record and merge it
    pub fn apply_insert_row(&self, row: Row) -> WallResult<()> {
        let entity: E = decode_row(row)?;
        self.apply_insert(entity);
        Ok(())
    }

    /// Update and delete notifications carry no reliable pre-image; reload
    pub async fn apply_bulk_replace(&self) -> WallResult<Vec<E>> {
        self.load().await
    }

    pub fn forget(&self, id: &Identity) {
        self.state.lock().forget(id);
    }

    /// Freeze the cache; results of reloads still in flight are dropped
    pub fn close(&self) {
        self.state.lock().close();
    }

    /// Number of inserts journaled for in-flight reloads
    pub fn journal_len(&self) -> usize {
        self.state.lock().journal_len()
    }

    pub fn snapshot(&self) -> Vec<E> {
        self.state.lock().entries().to_vec()
    }

    pub fn ids(&self) -> Vec<Identity> {
        self.state
            .lock()
            .entries()
            .iter()
            .map(|e| e.identity().clone())
            .collect()
    }
}

impl EntityCache<Post> {
    /// Newest-first feed of all posts
    pub fn posts(store: Arc<dyn DataStore>, limit: usize) -> Self {
        Self::new(
            store,
            Query::from(collections::POSTS)
                .order_by("created_at", false)
                .limit(limit),
            SortOrder::NewestFirst,
        )
    }
}

impl EntityCache<Comment> {
    /// Oldest-first comments of one post
    pub fn comments(store: Arc<dyn DataStore>, post_id: &Identity) -> Self {
        Self::new(
            store,
            Query::from(collections::COMMENTS)
                .eq("post_id", post_id)
                .order_by("created_at", true),
            SortOrder::OldestFirst,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn comment(id: &str, minute: u32) -> Comment {
        Comment {
            id: Identity::new(id),
            post_id: Identity::new("p1"),
            user_id: Identity::new("u1"),
            body: format!("comment {}", id),
            display_name: None,
            created_at: Utc.with_ymd_and_hms(2025, 3, 1, 12, minute, 0).unwrap(),
        }
    }

    fn ids(state: &CacheState<Comment>) -> Vec<&str> {
        state.entries().iter().map(|c| c.id.as_str()).collect()
    }

    #[test]
    fn test_insert_is_idempotent() {
        let mut state = CacheState::new(SortOrder::OldestFirst);
        state.apply_insert(comment("a", 1));
        state.apply_insert(comment("b", 2));
        state.apply_insert(comment("a", 1));
        assert_eq!(ids(&state), vec!["a", "b"]);
    }

    #[test]
    fn test_order_and_tie_break() {
        let mut newest = CacheState::new(SortOrder::NewestFirst);
        let mut oldest = CacheState::new(SortOrder::OldestFirst);
        for c in [comment("c", 5), comment("b", 5), comment("a", 1), comment("d", 9)] {
            newest.apply_insert(c.clone());
            oldest.apply_insert(c);
        }
        assert_eq!(ids(&newest), vec!["d", "b", "c", "a"]);
        assert_eq!(ids(&oldest), vec!["a", "b", "c", "d"]);
    }

    #[test]
    fn test_superseded_load_is_discarded() {
        let mut state = CacheState::new(SortOrder::OldestFirst);
        let early = state.begin_load();
        let late = state.begin_load();

        assert!(state.complete_load(late, vec![comment("a", 1), comment("b", 2)]));
        assert!(!state.complete_load(early, vec![comment("a", 1)]));
        assert_eq!(ids(&state), vec!["a", "b"]);
    }

    #[test]
    fn test_insert_after_issue_survives_load() {
        let mut state = CacheState::new(SortOrder::OldestFirst);
        state.apply_insert(comment("old", 0));
        let ticket = state.begin_load();
        state.apply_insert(comment("fresh", 7));

        // The reload was answered before "fresh" existed
        assert!(state.complete_load(ticket, vec![comment("a", 1)]));
        assert_eq!(ids(&state), vec!["a", "fresh"]);

        // Inserts older than an applied load are not replayed again
        let next = state.begin_load();
        assert!(state.complete_load(next, vec![comment("a", 1)]));
        assert_eq!(ids(&state), vec!["a"]);
    }

    #[test]
    fn test_load_deduplicates() {
        let mut state = CacheState::new(SortOrder::NewestFirst);
        let ticket = state.begin_load();
        state.complete_load(ticket, vec![comment("a", 1), comment("a", 1), comment("b", 3)]);
        assert_eq!(ids(&state), vec!["b", "a"]);
    }

    #[test]
    fn test_journal_empty_without_reload_in_flight() {
        let mut state = CacheState::new(SortOrder::NewestFirst);
        let ticket = state.begin_load();
        state.complete_load(ticket, vec![comment("a", 1)]);

        for n in 0..500 {
            state.apply_insert(comment(&format!("live{}", n), (n % 60) as u32));
        }
        assert_eq!(state.entries().len(), 501);
        assert_eq!(state.journal_len(), 0);

        // Only inserts racing a reload are journaled, and only until it lands
        let ticket = state.begin_load();
        state.apply_insert(comment("racing", 2));
        assert_eq!(state.journal_len(), 1);
        state.complete_load(ticket, vec![comment("a", 1)]);
        assert_eq!(state.journal_len(), 0);
        assert_eq!(ids(&state), vec!["racing", "a"]);
    }

    #[test]
    fn test_abandoned_load_releases_journal() {
        let mut state = CacheState::new(SortOrder::OldestFirst);
        let ticket = state.begin_load();
        state.apply_insert(comment("a", 1));
        assert_eq!(state.journal_len(), 1);
        state.abandon_load(ticket);
        assert_eq!(state.journal_len(), 0);
        assert_eq!(ids(&state), vec!["a"]);
    }

    #[test]
    fn test_closed_cache_ignores_late_results() {
        let mut state = CacheState::new(SortOrder::OldestFirst);
        state.apply_insert(comment("a", 1));
        let ticket = state.begin_load();
        state.close();

        assert!(!state.complete_load(ticket, vec![comment("b", 2)]));
        state.apply_insert(comment("c", 3));
        assert_eq!(ids(&state), vec!["a"]);
    }

    #[tokio::test]
    async fn test_failed_load_releases_journal() {
        use crate::backend::InMemoryBackend;
        use serde_json::json;

        let backend = Arc::new(InMemoryBackend::new());
        let cache = EntityCache::comments(backend.clone(), &Identity::new("p1"));
        backend.fail_next_selects(1, "offline");
        assert!(cache.load().await.is_err());

        cache
            .apply_insert_row(json!({
                "id": "c1",
                "post_id": "p1",
                "user_id": "u1",
                "body": "hi",
                "created_at": "2025-03-01T12:00:00Z",
            }))
            .unwrap();
        assert_eq!(cache.journal_len(), 0);
        assert_eq!(cache.ids(), vec![Identity::new("c1")]);
    }

    #[test]
    fn test_forget_prevents_replay() {
        let mut state = CacheState::new(SortOrder::OldestFirst);
        let ticket = state.begin_load();
        state.apply_insert(comment("gone", 4));
        state.forget(&Identity::new("gone"));
        state.complete_load(ticket, vec![comment("a", 1)]);
        assert_eq!(ids(&state), vec!["a"]);
    }
}
