/// Render-ready feed structure
use crate::{
    aggregate::ReactionTally,
    model::{Comment, Identity, Post},
};
use serde::Serialize;
use std::collections::HashMap;

/// State of one post's subview
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PostDetail {
    pub comments: Vec<Comment>,
    pub tally: ReactionTally,
    /// A reaction is in flight or cooling down
    pub pending: bool,
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ComposedPost {
    pub post: Post,
    pub comments: Vec<Comment>,
    pub tally: ReactionTally,
    pub pending: bool,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ComposedFeed {
    pub posts: Vec<ComposedPost>,
    pub error: Option<String>,
    pub loading: bool,
}

impl ComposedFeed {
    pub fn post(&self, id: &Identity) -> Option<&ComposedPost> {
        self.posts.iter().find(|p| &p.post.id == id)
    }
}

/// Join the ordered post list with per-post subview state
///
/// Posts keep the order given; a post whose subview is not open yet shows
/// no comments and an empty tally.
pub fn compose_feed(
    posts: &[Post],
    details: &HashMap<Identity, PostDetail>,
    error: Option<String>,
    loading: bool,
) -> ComposedFeed {
    let posts = posts
        .iter()
        .map(|post| {
            let detail = details.get(&post.id).cloned().unwrap_or_default();
            ComposedPost {
                post: post.clone(),
                comments: detail.comments,
                tally: detail.tally,
                pending: detail.pending,
                error: detail.error,
            }
        })
        .collect();

    ComposedFeed {
        posts,
        error,
        loading,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ReactionKind;
    use chrono::{TimeZone, Utc};

    fn post(id: &str) -> Post {
        Post {
            id: Identity::new(id),
            user_id: Identity::new("author"),
            topic_id: None,
            question_id: None,
            topic_title: Some("Climate".to_string()),
            question_prompt: None,
            ai_answer: None,
            critique: None,
            rewrite: format!("rewrite {}", id),
            display_name: None,
            created_at: Utc.with_ymd_and_hms(2025, 3, 1, 8, 0, 0).unwrap(),
        }
    }

    #[test]
    fn test_compose_keeps_order_and_fills_gaps() {
        let posts = vec![post("b"), post("a")];
        let mut details = HashMap::new();
        details.insert(
            Identity::new("a"),
            PostDetail {
                tally: ReactionTally::new(1, 0, Some(ReactionKind::Approve)),
                pending: true,
                ..PostDetail::default()
            },
        );

        let feed = compose_feed(&posts, &details, Some("offline".to_string()), false);
        let ids: Vec<&str> = feed.posts.iter().map(|p| p.post.id.as_str()).collect();
        assert_eq!(ids, vec!["b", "a"]);
        assert_eq!(feed.posts[0].tally, ReactionTally::default());
        assert!(feed.post(&Identity::new("a")).unwrap().pending);
        assert_eq!(feed.error.as_deref(), Some("offline"));
    }
}
