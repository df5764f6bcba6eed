/// Voice Wall - terminal wall watcher
///
/// Commands:
/// - `watch` (default): follow the live wall and log it on every change
/// - `topics`: list topics and their questions
/// - `demo`: run a scripted session against the in-process backend

use serde_json::json;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use voice_wall::{
    auth, catalog,
    backend::InMemoryBackend,
    config::BackendConfig,
    model::{collections, ReactionKind},
    prefs::Preferences,
    submit::{submit_rewrite, RewriteDraft},
    view::{ComposedFeed, FeedView},
    ClientConfig, WallContext, WallError, WallResult,
};

#[tokio::main]
async fn main() -> WallResult<()> {
    let config = ClientConfig::from_env();
    let default_level = config
        .as_ref()
        .map(|c| c.logging.level.clone())
        .unwrap_or_else(|_| "voice_wall=debug".to_string());

    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_level.into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Print banner
    print_banner();

    let command = std::env::args().nth(1).unwrap_or_else(|| "watch".to_string());

    match command.as_str() {
        "watch" => watch(WallContext::new(config?).await?).await,
        "topics" => topics(WallContext::new(config?).await?).await,
        "demo" => {
            // The demo never talks to a hosted backend; remote settings are optional
            let config =
                config.unwrap_or_else(|_| ClientConfig::in_memory(PathBuf::from("./data")));
            demo(config).await
        }
        other => Err(WallError::Config(format!(
            "Unknown command '{}', expected watch, topics or demo",
            other
        ))),
    }
}

async fn watch(ctx: WallContext) -> WallResult<()> {
    let mut feed = FeedView::open(ctx).await;
    log_feed(&feed.compose());

    loop {
        tokio::select! {
            changed = feed.changed() => {
                changed?;
                log_feed(&feed.compose());
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Shutting down");
                break;
            }
        }
    }

    feed.close();
    Ok(())
}

async fn topics(ctx: WallContext) -> WallResult<()> {
    for topic in catalog::list_topics(&ctx).await? {
        println!("{} {}", topic.emoji.as_deref().unwrap_or("•"), topic.title);
        for question in catalog::questions_for_topic(&ctx, &topic.id).await? {
            println!("    {}. {}", question.id, question.prompt);
        }
    }
    Ok(())
}

async fn demo(mut config: ClientConfig) -> WallResult<()> {
    config.backend = BackendConfig::Memory;
    let preferences = Arc::new(Preferences::load(&config.storage.preferences_file));

    let backend = Arc::new(InMemoryBackend::new());
    backend.seed(
        collections::TOPICS,
        json!({"id": 1, "slug": "civics", "title": "Civics", "emoji": "🏛️"}),
    );
    backend.seed(
        collections::QUESTIONS,
        json!({
            "id": 1,
            "topic_id": 1,
            "prompt": "How should a city decide what to build next?",
            "ai_answer": "Cities should rely on expert planning committees."
        }),
    );

    let ctx = WallContext::with_backend(config, backend, preferences);
    let mut feed = FeedView::open(ctx.clone()).await;

    let session = auth::sign_in_guest(&ctx).await?;
    let topic = catalog::topic_by_slug(&ctx, "civics").await?;
    let question = catalog::questions_for_topic(&ctx, &topic.id)
        .await?
        .into_iter()
        .next()
        .ok_or_else(|| WallError::NotFound("No question to answer".to_string()))?;

    let draft = RewriteDraft {
        ai_answer: question.ai_answer.clone().unwrap_or_default(),
        critique: "Leaves residents out of the decision.".to_string(),
        rewrite: "Let residents vote on a shortlist drafted with planners.".to_string(),
        display_name: ctx.preferences.display_name().unwrap_or_default(),
    };
    let post = submit_rewrite(&ctx, Some(&session), &question, Some(&topic), &draft).await?;

    let appeared = tokio::time::timeout(Duration::from_secs(5), async {
        while feed.post(&post.id).is_none() {
            feed.changed().await?;
        }
        Ok::<_, WallError>(())
    })
    .await;
    match appeared {
        Ok(result) => result?,
        Err(_) => {
            warn!("Post {} did not reach the wall", post.id);
            return Ok(());
        }
    }

    feed.react(&post.id, ReactionKind::Approve).await?;
    feed.submit_comment(&post.id, "Shortlists keep it practical.", "")
        .await?;
    log_feed(&feed.compose());

    feed.close();
    Ok(())
}

fn log_feed(feed: &ComposedFeed) {
    if feed.loading {
        info!("Loading wall...");
        return;
    }
    if let Some(error) = &feed.error {
        warn!("{}", error);
    }
    info!("{} posts on the wall", feed.posts.len());
    for entry in &feed.posts {
        info!(
            "[{}] {} ({}): 👍 {} 👎 {}{} | {} comments",
            entry.post.created_at.format("%Y-%m-%d %H:%M"),
            entry.post.title(),
            entry.post.display_name.as_deref().unwrap_or("Anonymous"),
            entry.tally.approve,
            entry.tally.disapprove,
            if entry.pending { " …" } else { "" },
            entry.comments.len()
        );
        for comment in &entry.comments {
            info!("    {}: {}", comment.author(), comment.body);
        }
        if let Some(error) = &entry.error {
            warn!("    {}", error);
        }
    }
}

fn print_banner() {
    println!(
        r#"
 _    __      _              _       __      ____
| |  / /___  (_)_______     | |     / /___ _/ / /
| | / / __ \/ / ___/ _ \    | | /| / / __ `/ / /
| |/ / /_/ / / /__/  __/    | |/ |/ / /_/ / / /
|___/\____/_/\___/\___/     |__/|__/\__,_/_/_/

        Realtime wall client v{}
        "#,
        env!("CARGO_PKG_VERSION")
    );
}
