/// Topic and question lookups
use crate::{
    backend::{decode_row, decode_rows, Query},
    context::WallContext,
    error::{WallError, WallResult},
    model::{collections, Identity, Question, Topic},
};
use serde::de::DeserializeOwned;
use tracing::debug;

async fn fetch_all<T: DeserializeOwned>(ctx: &WallContext, query: Query) -> WallResult<Vec<T>> {
    let rows = ctx.store.select(&query).await.map_err(WallError::into_fetch)?;
    decode_rows(rows).map_err(WallError::into_fetch)
}

async fn fetch_one<T: DeserializeOwned>(
    ctx: &WallContext,
    query: Query,
    what: String,
) -> WallResult<T> {
    let rows = ctx
        .store
        .select(&query.limit(1))
        .await
        .map_err(WallError::into_fetch)?;
    match rows.into_iter().next() {
        Some(row) => decode_row(row).map_err(WallError::into_fetch),
        None => Err(WallError::NotFound(what)),
    }
}

/// All topics, alphabetically
pub async fn list_topics(ctx: &WallContext) -> WallResult<Vec<Topic>> {
    let topics: Vec<Topic> = fetch_all(
        ctx,
        Query::from(collections::TOPICS).order_by("title", true),
    )
    .await?;
    debug!("Loaded {} topics", topics.len());
    Ok(topics)
}

pub async fn topic_by_slug(ctx: &WallContext, slug: &str) -> WallResult<Topic> {
    fetch_one(
        ctx,
        Query::from(collections::TOPICS).eq("slug", slug),
        format!("Topic {}", slug),
    )
    .await
}

/// Questions of one topic in creation order
pub async fn questions_for_topic(ctx: &WallContext, topic_id: &Identity) -> WallResult<Vec<Question>> {
    fetch_all(
        ctx,
        Query::from(collections::QUESTIONS)
            .eq("topic_id", topic_id)
            .order_by("id", true),
    )
    .await
}

pub async fn question(ctx: &WallContext, id: &Identity) -> WallResult<Question> {
    fetch_one(
        ctx,
        Query::from(collections::QUESTIONS).eq("id", id),
        format!("Question {}", id),
    )
    .await
}
