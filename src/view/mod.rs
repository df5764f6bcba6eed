/// Live views over the wall
///
/// - `feed`: the post list, one `post` view per visible post
/// - `post`: comments, reaction tally and the reaction control of one post
/// - `compose`: the render-ready join of the two
pub mod compose;
pub mod feed;
pub mod post;

pub use compose::{compose_feed, ComposedFeed, ComposedPost, PostDetail};
pub use feed::FeedView;
pub use post::{PostHandle, PostView};

use std::sync::Arc;
use tokio::sync::watch;

/// Change counter shared by a feed and its post views
///
/// Bumped after every state change that may alter the composed feed.
#[derive(Clone)]
pub struct Revision {
    sender: Arc<watch::Sender<u64>>,
}

impl Default for Revision {
    fn default() -> Self {
        Self::new()
    }
}

impl Revision {
    pub fn new() -> Self {
        let (sender, _) = watch::channel(0);
        Self {
            sender: Arc::new(sender),
        }
    }

    pub fn bump(&self) {
        self.sender.send_modify(|n| *n = n.wrapping_add(1));
    }

    pub fn current(&self) -> u64 {
        *self.sender.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.sender.subscribe()
    }
}
