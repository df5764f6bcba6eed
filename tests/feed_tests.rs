/// Feed reconciliation tests against the in-process backend
mod common;

use common::{comment_row, context, id, post_row, reaction_row, settle, wait_until};
use serde_json::json;
use std::sync::Arc;
use voice_wall::{
    backend::{ChangeEvent, DataStore, InMemoryBackend},
    model::{collections, ReactionKind},
    view::FeedView,
};

fn ids(feed: &FeedView) -> Vec<String> {
    feed.posts().iter().map(|p| p.id.to_string()).collect()
}

#[tokio::test]
async fn test_feed_loads_newest_first_within_limit() {
    let backend = Arc::new(InMemoryBackend::new());
    backend.seed(collections::POSTS, post_row("p1", 1));
    backend.seed(collections::POSTS, post_row("p3", 3));
    backend.seed(collections::POSTS, post_row("p2", 2));

    let feed = FeedView::open(context(&backend, 2)).await;
    assert_eq!(ids(&feed), vec!["p3", "p2"]);

    let composed = feed.compose();
    assert!(!composed.loading);
    assert!(composed.error.is_none());
    assert_eq!(composed.posts.len(), 2);
    assert!(feed.post(&id("p3")).is_some());
    assert!(feed.post(&id("p1")).is_none());
}

#[tokio::test]
async fn test_realtime_insert_merges_once() {
    let backend = Arc::new(InMemoryBackend::new());
    backend.seed(collections::POSTS, post_row("p1", 1));
    let feed = FeedView::open(context(&backend, 100)).await;

    backend
        .insert(collections::POSTS, post_row("p2", 5))
        .await
        .unwrap();
    wait_until("new post", || feed.post(&id("p2")).is_some()).await;

    // Duplicate delivery of the same row
    backend.emit(ChangeEvent::Insert {
        collection: collections::POSTS.to_string(),
        record: post_row("p2", 5),
    });
    settle().await;

    assert_eq!(ids(&feed), vec!["p2", "p1"]);
    assert!(backend.open_channels().contains(&"post-p2".to_string()));
}

#[tokio::test]
async fn test_equal_timestamps_order_by_identity() {
    let backend = Arc::new(InMemoryBackend::new());
    backend.seed(collections::POSTS, post_row("b", 4));
    backend.seed(collections::POSTS, post_row("a", 4));
    backend.seed(collections::POSTS, post_row("c", 9));

    let feed = FeedView::open(context(&backend, 100)).await;
    assert_eq!(ids(&feed), vec!["c", "a", "b"]);
}

#[tokio::test]
async fn test_update_and_delete_trigger_reload() {
    let backend = Arc::new(InMemoryBackend::new());
    backend.seed(collections::POSTS, post_row("p1", 1));
    backend.seed(collections::POSTS, post_row("p2", 2));
    let feed = FeedView::open(context(&backend, 100)).await;

    let mut edited = post_row("p1", 1);
    edited["rewrite"] = json!("Edited rewrite");
    assert!(backend.update(collections::POSTS, edited));
    wait_until("edited post", || {
        feed.posts()
            .iter()
            .any(|p| p.id == id("p1") && p.rewrite == "Edited rewrite")
    })
    .await;

    backend
        .delete(collections::POSTS, &[voice_wall::backend::Filter::eq("id", "p2")])
        .await
        .unwrap();
    wait_until("deleted post", || ids(&feed) == vec!["p1"]).await;
    wait_until("post view closed", || feed.post(&id("p2")).is_none()).await;
    wait_until("post channel released", || {
        !backend.open_channels().contains(&"post-p2".to_string())
    })
    .await;
}

#[tokio::test]
async fn test_failed_reload_keeps_feed() {
    let backend = Arc::new(InMemoryBackend::new());
    backend.seed(collections::POSTS, post_row("p1", 1));
    let feed = FeedView::open(context(&backend, 100)).await;

    backend.fail_next_selects(1, "upstream timeout");
    feed.refresh().await;

    assert_eq!(ids(&feed), vec!["p1"]);
    assert_eq!(feed.error().as_deref(), Some("upstream timeout"));
    assert_eq!(feed.compose().error.as_deref(), Some("upstream timeout"));

    feed.dismiss_error();
    assert!(feed.error().is_none());
}

#[tokio::test]
async fn test_composed_feed_joins_comments_and_tallies() {
    let backend = Arc::new(InMemoryBackend::new());
    backend.seed(collections::POSTS, post_row("p1", 1));
    backend.seed(collections::COMMENTS, comment_row("c2", "p1", 8, "second"));
    backend.seed(collections::COMMENTS, comment_row("c1", "p1", 3, "first"));
    backend.seed(collections::COMMENTS, comment_row("x1", "other", 2, "elsewhere"));
    backend.seed(collections::REACTIONS, reaction_row("p1", "viewer", "dislike"));
    backend.seed(collections::REACTIONS, reaction_row("p1", "u2", "like"));
    backend.seed(collections::REACTIONS, reaction_row("p1", "u3", "like"));
    backend.sign_in_as("viewer", Some("viewer@example.com"));

    let feed = FeedView::open(context(&backend, 100)).await;
    let composed = feed.compose();
    let entry = composed.post(&id("p1")).unwrap();

    let bodies: Vec<&str> = entry.comments.iter().map(|c| c.body.as_str()).collect();
    assert_eq!(bodies, vec!["first", "second"]);
    assert_eq!(entry.tally.approve, 2);
    assert_eq!(entry.tally.disapprove, 1);
    assert_eq!(entry.tally.viewer_selection, Some(ReactionKind::Disapprove));
    assert!(!entry.pending);
}

#[tokio::test]
async fn test_feed_actions_reach_post_views() {
    let backend = Arc::new(InMemoryBackend::new());
    backend.seed(collections::POSTS, post_row("p1", 1));
    backend.sign_in_as("viewer", None);
    let mut feed = FeedView::open(context(&backend, 100)).await;

    assert!(feed.react(&id("p1"), ReactionKind::Approve).await.unwrap());
    let comment = feed
        .submit_comment(&id("p1"), "Nice one", "Ada")
        .await
        .unwrap();
    assert_eq!(comment.author(), "Ada");

    let entry = feed.compose().post(&id("p1")).cloned().unwrap();
    assert_eq!(entry.tally.approve, 1);
    assert_eq!(entry.comments.len(), 1);

    assert!(feed.react(&id("missing"), ReactionKind::Approve).await.is_err());

    feed.close();
    wait_until("all channels released", || backend.open_channels().is_empty()).await;
}

#[tokio::test]
async fn test_post_views_share_the_feed_session() {
    let backend = Arc::new(InMemoryBackend::new());
    for (n, token) in ["p1", "p2", "p3"].iter().enumerate() {
        backend.seed(collections::POSTS, post_row(token, n as u32));
    }
    backend.seed(collections::REACTIONS, reaction_row("p2", "viewer", "like"));
    let mut feed = FeedView::open(context(&backend, 100)).await;
    assert_eq!(backend.open_channels().len(), 4);
    assert_eq!(backend.session_watchers(), 1);

    backend.sign_in_as("viewer", None);
    wait_until("viewer selection", || {
        feed.compose().post(&id("p2")).map(|p| p.tally.viewer_selection)
            == Some(Some(ReactionKind::Approve))
    })
    .await;

    feed.close();
    wait_until("session listener released", || backend.session_watchers() == 0).await;
}
