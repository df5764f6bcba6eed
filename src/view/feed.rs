/// Live feed of posts
///
/// Posts arrive on channel `posts-live`:
/// - INSERT merges the new row into the post cache
/// - UPDATE and DELETE reload the whole list
///
/// A post view is kept open for every post currently in the list.
use crate::{
    backend::{ChangeEvent, ChangeFilter, ChangeKind, Subscription},
    cache::EntityCache,
    context::WallContext,
    error::{WallError, WallResult},
    model::{collections, Comment, Identity, Post, ReactionKind},
    session::{SessionReader, SessionTracker},
    view::{
        compose::{compose_feed, ComposedFeed},
        post::{PostHandle, PostView},
        Revision,
    },
};
use futures_util::future::join_all;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Channel carrying post changes
pub const FEED_CHANNEL: &str = "posts-live";

struct FeedState {
    alive: bool,
    loading: bool,
    error: Option<String>,
    views: HashMap<Identity, PostView>,
}

struct FeedInner {
    ctx: WallContext,
    posts: EntityCache<Post>,
    /// Viewer shared by every post view of the feed
    session: SessionReader,
    state: Mutex<FeedState>,
    revision: Revision,
    /// Serializes post view bookkeeping
    sync: tokio::sync::Mutex<()>,
}

impl FeedInner {
    fn is_alive(&self) -> bool {
        self.state.lock().alive
    }

    fn set_error(&self, error: &WallError) {
        let mut state = self.state.lock();
        if state.alive {
            state.error = Some(error.banner());
        }
    }

    async fn reload(&self) {
        match self.posts.load().await {
            Ok(posts) => debug!("Feed holds {} posts", posts.len()),
            Err(e) => self.set_error(&e),
        }
        self.sync_views().await;
    }

    /// Open views for posts that appeared and close views of posts that left
    async fn sync_views(&self) {
        let _sync = self.sync.lock().await;
        let wanted = self.posts.snapshot();

        let missing: Vec<Post> = {
            let state = self.state.lock();
            if !state.alive {
                return;
            }
            wanted
                .iter()
                .filter(|p| !state.views.contains_key(&p.id))
                .cloned()
                .collect()
        };

        let opened = join_all(
            missing
                .into_iter()
                .map(|post| {
                    PostView::open_with_session(
                        self.ctx.clone(),
                        post,
                        self.revision.clone(),
                        self.session.clone(),
                    )
                }),
        )
        .await;

        let closed: Vec<PostView> = {
            let mut state = self.state.lock();
            if !state.alive {
                drop(state);
                drop(opened);
                return;
            }
            for view in opened {
                state.views.insert(view.post().id.clone(), view);
            }
            let keep: HashSet<&Identity> = wanted.iter().map(|p| &p.id).collect();
            let gone: Vec<Identity> = state
                .views
                .keys()
                .filter(|id| !keep.contains(id))
                .cloned()
                .collect();
            gone.iter().filter_map(|id| state.views.remove(id)).collect()
        };
        if !closed.is_empty() {
            debug!("Closed {} post views", closed.len());
        }
        drop(closed);
        self.revision.bump();
    }

    async fn handle_event(&self, event: ChangeEvent) {
        match event {
            ChangeEvent::Insert { record, .. } => {
                if let Err(e) = self.posts.apply_insert_row(record) {
                    warn!("Ignoring post notification: {}", e);
                    return;
                }
                self.sync_views().await;
            }
            ChangeEvent::Update { .. } => {
                if let Err(e) = self.posts.apply_bulk_replace().await {
                    self.set_error(&e);
                }
                self.sync_views().await;
            }
            ChangeEvent::Delete { old_record, .. } => {
                if let Some(id) = old_record
                    .get("id")
                    .cloned()
                    .and_then(|id| serde_json::from_value::<Identity>(id).ok())
                {
                    self.posts.forget(&id);
                }
                if let Err(e) = self.posts.apply_bulk_replace().await {
                    self.set_error(&e);
                }
                self.sync_views().await;
            }
            ChangeEvent::Resync => {
                info!("Feed resync after reconnect");
                self.reload().await;
            }
        }
    }

    async fn run(self: Arc<Self>, mut events: Subscription<ChangeEvent>) {
        while let Some(event) = events.recv().await {
            if !self.is_alive() {
                break;
            }
            self.handle_event(event).await;
        }
        debug!("Feed change stream ended");
    }
}

/// Live view of the whole wall
pub struct FeedView {
    inner: Arc<FeedInner>,
    tracker: SessionTracker,
    changes: watch::Receiver<u64>,
    task: Option<JoinHandle<()>>,
}

impl FeedView {
    /// Subscribe to post changes, then load the feed and open its post views
    pub async fn open(ctx: WallContext) -> Self {
        let tracker = SessionTracker::start(ctx.auth.clone()).await;
        let posts = EntityCache::posts(ctx.store.clone(), ctx.config.feed.post_limit);
        let revision = Revision::new();
        let inner = Arc::new(FeedInner {
            ctx: ctx.clone(),
            posts,
            session: tracker.reader(),
            state: Mutex::new(FeedState {
                alive: true,
                loading: true,
                error: None,
                views: HashMap::new(),
            }),
            revision: revision.clone(),
            sync: tokio::sync::Mutex::new(()),
        });

        let listeners = vec![
            ChangeFilter::new(ChangeKind::Insert, collections::POSTS),
            ChangeFilter::new(ChangeKind::Update, collections::POSTS),
            ChangeFilter::new(ChangeKind::Delete, collections::POSTS),
        ];
        let events = match ctx.realtime.subscribe(FEED_CHANNEL, listeners).await {
            Ok(events) => Some(events),
            Err(e) => {
                warn!("Subscribing to {} failed: {}", FEED_CHANNEL, e);
                inner.set_error(&e);
                None
            }
        };

        inner.reload().await;
        inner.state.lock().loading = false;
        revision.bump();

        let task = events.map(|events| tokio::spawn(inner.clone().run(events)));
        info!("Feed opened");

        Self {
            inner,
            tracker,
            changes: revision.subscribe(),
            task,
        }
    }

    /// Render-ready snapshot of the feed
    pub fn compose(&self) -> ComposedFeed {
        let posts = self.inner.posts.snapshot();
        let state = self.inner.state.lock();
        let details = state
            .views
            .iter()
            .map(|(id, view)| (id.clone(), view.detail()))
            .collect();
        compose_feed(&posts, &details, state.error.clone(), state.loading)
    }

    /// Wait until the composed feed may have changed
    pub async fn changed(&mut self) -> WallResult<()> {
        self.changes
            .changed()
            .await
            .map_err(|_| WallError::Fetch("Feed closed".to_string()))
    }

    pub fn posts(&self) -> Vec<Post> {
        self.inner.posts.snapshot()
    }

    /// Handle to the view of a visible post
    pub fn post(&self, id: &Identity) -> Option<PostHandle> {
        self.inner.state.lock().views.get(id).map(|view| view.handle())
    }

    fn visible(&self, id: &Identity) -> WallResult<PostHandle> {
        self.post(id)
            .ok_or_else(|| WallError::NotFound(format!("Post {} is not on the wall", id)))
    }

    pub async fn react(&self, id: &Identity, kind: ReactionKind) -> WallResult<bool> {
        self.visible(id)?.react(kind).await
    }

    pub async fn submit_comment(
        &self,
        id: &Identity,
        body: &str,
        display_name: &str,
    ) -> WallResult<Comment> {
        self.visible(id)?.submit_comment(body, display_name).await
    }

    pub fn error(&self) -> Option<String> {
        self.inner.state.lock().error.clone()
    }

    pub fn dismiss_error(&self) {
        self.inner.state.lock().error = None;
        self.inner.revision.bump();
    }

    /// Reload the post list
    pub async fn refresh(&self) {
        self.inner.reload().await;
    }

    /// Stop listening and close every post view
    pub fn close(&mut self) {
        let views = {
            let mut state = self.inner.state.lock();
            state.alive = false;
            std::mem::take(&mut state.views)
        };
        self.inner.posts.close();
        self.tracker.close();
        if let Some(task) = self.task.take() {
            task.abort();
        }
        drop(views);
    }
}

impl Drop for FeedView {
    fn drop(&mut self) {
        self.close();
    }
}
