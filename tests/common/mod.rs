#![allow(dead_code)]

// Shared fixtures for the integration tests

use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use voice_wall::{
    backend::InMemoryBackend,
    model::{Identity, Post},
    prefs::Preferences,
    ClientConfig, WallContext,
};

pub fn timestamp(minute: u32) -> String {
    format!("2025-03-01T12:{:02}:00Z", minute)
}

pub fn post_row(id: &str, minute: u32) -> Value {
    json!({
        "id": id,
        "user_id": "author",
        "topic_id": 1,
        "question_id": 1,
        "topic_title": "Civics",
        "question_prompt": "What should we build?",
        "ai_answer": "A stadium.",
        "critique": null,
        "rewrite": format!("Rewrite {}", id),
        "display_name": "Robin",
        "created_at": timestamp(minute),
    })
}

pub fn comment_row(id: &str, post_id: &str, minute: u32, body: &str) -> Value {
    json!({
        "id": id,
        "post_id": post_id,
        "user_id": "commenter",
        "body": body,
        "display_name": "Kim",
        "created_at": timestamp(minute),
    })
}

pub fn reaction_row(post_id: &str, user_id: &str, kind: &str) -> Value {
    json!({ "post_id": post_id, "user_id": user_id, "type": kind })
}

pub fn post(id: &str, minute: u32) -> Post {
    serde_json::from_value(post_row(id, minute)).unwrap()
}

pub fn id(token: &str) -> Identity {
    Identity::new(token)
}

/// Context over `backend` with the given post limit
pub fn context(backend: &Arc<InMemoryBackend>, post_limit: usize) -> WallContext {
    let mut config = ClientConfig::in_memory(std::env::temp_dir().join("voice-wall-tests"));
    config.feed.post_limit = post_limit;
    WallContext::with_backend(config, backend.clone(), Arc::new(Preferences::ephemeral()))
}

/// Poll `check` until it holds, failing the test after two seconds
pub async fn wait_until<F: Fn() -> bool>(what: &str, check: F) {
    for _ in 0..200 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {}", what);
}

/// Let spawned tasks drain their queues
pub async fn settle() {
    for _ in 0..5 {
        tokio::task::yield_now().await;
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
