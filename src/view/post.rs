/// Live view of one post
///
/// Owns the post's comment cache and its reaction controller, and reads
/// the viewer from a session tracker. Change notifications for the post's
/// comments and reactions arrive on channel `post-<id>`; any reaction
/// change re-queries the whole reaction set and re-aggregates it.
use crate::{
    aggregate::{aggregate, ReactionTally},
    backend::{decode_row, decode_rows, ChangeEvent, ChangeFilter, ChangeKind, Filter, Query},
    cache::EntityCache,
    context::WallContext,
    error::{WallError, WallResult},
    model::{collections, Comment, Post, Reaction, ReactionKind, Session},
    mutation::ReactionController,
    prefs::display_name_or_default,
    session::{SessionReader, SessionTracker},
    view::{compose::PostDetail, Revision},
};
use parking_lot::Mutex;
use serde_json::json;
use std::ops::Deref;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

struct PostState {
    alive: bool,
    reactions: ReactionController,
    /// Issue stamps of reaction reloads, to drop superseded results
    reaction_loads_issued: u64,
    reaction_load_applied: u64,
    error: Option<String>,
}

struct PostInner {
    ctx: WallContext,
    post: Post,
    comments: EntityCache<Comment>,
    session: SessionReader,
    state: Mutex<PostState>,
    revision: Revision,
}

impl PostInner {
    fn is_alive(&self) -> bool {
        self.state.lock().alive
    }

    fn set_error(&self, error: &WallError) {
        let mut state = self.state.lock();
        if state.alive {
            state.error = Some(error.banner());
        }
    }

    async fn load_comments(&self) {
        if let Err(e) = self.comments.load().await {
            self.set_error(&e);
        }
        self.revision.bump();
    }

    /// Re-query the reaction set and merge the recomputed tally
    async fn refresh_reactions(&self) {
        let stamp = {
            let mut state = self.state.lock();
            state.reaction_loads_issued += 1;
            state.reaction_loads_issued
        };

        let query = Query::from(collections::REACTIONS).eq("post_id", &self.post.id);
        let loaded = self
            .ctx
            .store
            .select(&query)
            .await
            .and_then(decode_rows::<Reaction>)
            .map_err(WallError::into_fetch);

        let reactions = match loaded {
            Ok(reactions) => reactions,
            Err(e) => {
                warn!("Reaction reload for post {} failed: {}", self.post.id, e);
                self.set_error(&e);
                self.revision.bump();
                return;
            }
        };

        let viewer = self.session.current().map(|s| s.user.id);
        let tally = aggregate(&reactions, viewer.as_ref());
        {
            let mut state = self.state.lock();
            if !state.alive || state.reaction_load_applied > stamp {
                return;
            }
            state.reaction_load_applied = stamp;
            state.reactions.apply_remote(tally);
        }
        self.revision.bump();
    }

    async fn handle_event(&self, event: ChangeEvent) {
        match event {
            ChangeEvent::Insert { collection, record } if collection == collections::COMMENTS => {
                if let Err(e) = self.comments.apply_insert_row(record) {
                    warn!("Ignoring comment notification on post {}: {}", self.post.id, e);
                    return;
                }
                self.revision.bump();
            }
            ChangeEvent::Resync => {
                debug!("Resyncing post {}", self.post.id);
                self.load_comments().await;
                self.refresh_reactions().await;
            }
            event if event.collection() == Some(collections::REACTIONS) => {
                self.refresh_reactions().await;
            }
            other => debug!("Ignoring change on post {}: {:?}", self.post.id, other.kind()),
        }
    }

    async fn run(
        self: Arc<Self>,
        mut events: crate::backend::Subscription<ChangeEvent>,
        mut viewer: watch::Receiver<Option<Session>>,
    ) {
        loop {
            tokio::select! {
                event = events.recv() => match event {
                    Some(event) => self.handle_event(event).await,
                    None => {
                        debug!("Change stream for post {} ended", self.post.id);
                        break;
                    }
                },
                changed = viewer.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    self.refresh_reactions().await;
                }
            }
            if !self.is_alive() {
                break;
            }
        }
    }
}

/// Shared handle to a live post view
#[derive(Clone)]
pub struct PostHandle {
    inner: Arc<PostInner>,
}

impl PostHandle {
    pub fn post(&self) -> &Post {
        &self.inner.post
    }

    pub fn comments(&self) -> Vec<Comment> {
        self.inner.comments.snapshot()
    }

    pub fn tally(&self) -> ReactionTally {
        self.inner.state.lock().reactions.tally()
    }

    pub fn is_pending(&self) -> bool {
        self.inner.state.lock().reactions.is_pending()
    }

    pub fn current_session(&self) -> Option<Session> {
        self.inner.session.current()
    }

    /// Transient banner message, if any
    pub fn error(&self) -> Option<String> {
        self.inner.state.lock().error.clone()
    }

    pub fn dismiss_error(&self) {
        self.inner.state.lock().error = None;
        self.inner.revision.bump();
    }

    pub fn detail(&self) -> PostDetail {
        let comments = self.inner.comments.snapshot();
        let state = self.inner.state.lock();
        PostDetail {
            comments,
            tally: state.reactions.tally(),
            pending: state.reactions.is_pending(),
            error: state.error.clone(),
        }
    }

    /// Reload comments and reactions
    pub async fn refresh(&self) {
        self.inner.load_comments().await;
        self.inner.refresh_reactions().await;
    }

    /// React with `kind`
    ///
    /// Returns `Ok(false)` when ignored because an earlier reaction is
    /// still pending. A rejected write is rolled back before the error is
    /// returned.
    pub async fn react(&self, kind: ReactionKind) -> WallResult<bool> {
        let inner = &self.inner;
        let session = inner.session.current();

        let write = {
            let mut state = inner.state.lock();
            if !state.alive {
                return Ok(false);
            }
            let begun = state.reactions.begin(session.as_ref(), kind);
            match begun {
                Ok(Some(write)) => write,
                Ok(None) => return Ok(false),
                Err(e) => {
                    state.error = Some(e.banner());
                    drop(state);
                    inner.revision.bump();
                    return Err(e);
                }
            }
        };
        inner.revision.bump();
        debug!(
            "Reacting {} on post {} as {}",
            kind.as_str(),
            inner.post.id,
            write.user_id
        );

        let outcome = write.execute(inner.ctx.store.as_ref()).await;
        {
            let mut state = inner.state.lock();
            if state.alive {
                state.reactions.settle(&outcome);
                if let Err(e) = &outcome {
                    state.error = Some(e.banner());
                }
            }
        }
        inner.revision.bump();

        let cooldown = inner.ctx.config.feed.reaction_cooldown();
        let cooling = inner.clone();
        tokio::spawn(async move {
            tokio::time::sleep(cooldown).await;
            {
                let mut state = cooling.state.lock();
                if !state.alive {
                    return;
                }
                state.reactions.cooldown_elapsed();
            }
            cooling.revision.bump();
        });

        outcome.map(|_| true)
    }

    /// Post a comment
    ///
    /// The display name is remembered for next time (blank becomes
    /// "Guest") before the insert. The stored comment is merged into the
    /// comment list at once; its realtime echo is then a no-op.
    pub async fn submit_comment(&self, body: &str, display_name: &str) -> WallResult<Comment> {
        let inner = &self.inner;
        let body = body.trim();
        if body.is_empty() {
            return Err(WallError::Validation("Comment cannot be empty.".to_string()));
        }
        let Some(session) = inner.session.current() else {
            let err = WallError::AuthRequired("Please sign in to comment.".to_string());
            inner.set_error(&err);
            inner.revision.bump();
            return Err(err);
        };

        let name = match inner.ctx.preferences.set_display_name(display_name).await {
            Ok(name) => name,
            Err(e) => {
                warn!("Could not save display name: {}", e);
                display_name_or_default(display_name).to_string()
            }
        };

        let row = json!({
            "post_id": inner.post.id,
            "user_id": session.user_id(),
            "body": body,
            "display_name": name,
        });
        let stored = inner
            .ctx
            .store
            .insert(collections::COMMENTS, row)
            .await
            .and_then(decode_row::<Comment>)
            .map_err(WallError::into_persistence);

        match stored {
            Ok(comment) => {
                if inner.is_alive() {
                    inner.comments.apply_insert(comment.clone());
                    inner.revision.bump();
                }
                info!("Comment {} added to post {}", comment.id, inner.post.id);
                Ok(comment)
            }
            Err(e) => {
                inner.set_error(&e);
                inner.revision.bump();
                Err(e)
            }
        }
    }
}

/// Owner of a post view; dropping it tears the view down
pub struct PostView {
    handle: PostHandle,
    /// Tracker owned by a standalone view; views of a feed share the feed's
    tracker: Option<SessionTracker>,
    task: Option<JoinHandle<()>>,
}

impl PostView {
    /// Open a standalone view with its own session tracker
    pub async fn open(ctx: WallContext, post: Post, revision: Revision) -> Self {
        let tracker = SessionTracker::start(ctx.auth.clone()).await;
        let session = tracker.reader();
        let mut view = Self::open_with_session(ctx, post, revision, session).await;
        view.tracker = Some(tracker);
        view
    }

    /// Subscribe to the post's changes, then pull its comments and reactions
    ///
    /// The viewer is read from `session`, typically the feed's tracker.
    pub async fn open_with_session(
        ctx: WallContext,
        post: Post,
        revision: Revision,
        session: SessionReader,
    ) -> Self {
        let viewer = session.changes();
        let comments = EntityCache::comments(ctx.store.clone(), &post.id);
        let channel = format!("post-{}", post.id);
        let listeners = vec![
            ChangeFilter::new(ChangeKind::Insert, collections::COMMENTS)
                .with_filter(Filter::eq("post_id", &post.id)),
            ChangeFilter::new(ChangeKind::All, collections::REACTIONS)
                .with_filter(Filter::eq("post_id", &post.id)),
        ];

        let inner = Arc::new(PostInner {
            ctx: ctx.clone(),
            comments,
            session,
            state: Mutex::new(PostState {
                alive: true,
                reactions: ReactionController::new(post.id.clone()),
                reaction_loads_issued: 0,
                reaction_load_applied: 0,
                error: None,
            }),
            post,
            revision,
        });

        let events = match ctx.realtime.subscribe(&channel, listeners).await {
            Ok(events) => Some(events),
            Err(e) => {
                warn!("Subscribing to {} failed: {}", channel, e);
                inner.set_error(&e);
                None
            }
        };

        inner.load_comments().await;
        inner.refresh_reactions().await;

        let task = events.map(|events| tokio::spawn(inner.clone().run(events, viewer)));
        debug!("Opened view for post {}", inner.post.id);

        Self {
            handle: PostHandle { inner },
            tracker: None,
            task,
        }
    }

    pub fn handle(&self) -> PostHandle {
        self.handle.clone()
    }

    /// Release the change subscription and any owned session tracker;
    /// callbacks still in flight become no-ops
    pub fn close(&mut self) {
        self.handle.inner.state.lock().alive = false;
        self.handle.inner.comments.close();
        if let Some(task) = self.task.take() {
            task.abort();
        }
        if let Some(tracker) = self.tracker.as_mut() {
            tracker.close();
        }
    }
}

impl Deref for PostView {
    type Target = PostHandle;

    fn deref(&self) -> &PostHandle {
        &self.handle
    }
}

impl Drop for PostView {
    fn drop(&mut self) {
        self.close();
    }
}
