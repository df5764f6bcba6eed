/// Publishing a rewrite to the wall
use crate::{
    backend::decode_row,
    context::WallContext,
    error::{WallError, WallResult},
    model::{collections, Post, Question, Session, Topic},
};
use serde_json::json;
use tracing::info;

/// Longest accepted rewrite, in characters
pub const MAX_REWRITE_CHARS: usize = 4000;

/// Text the user wrote for one question
#[derive(Debug, Clone, Default)]
pub struct RewriteDraft {
    pub ai_answer: String,
    pub critique: String,
    pub rewrite: String,
    pub display_name: String,
}

fn optional(text: &str) -> Option<String> {
    match text.trim() {
        "" => None,
        trimmed => Some(trimmed.to_string()),
    }
}

/// Check the draft's rewrite and return it trimmed
pub fn validate_rewrite(draft: &RewriteDraft) -> WallResult<String> {
    let rewrite = draft.rewrite.trim();
    if rewrite.is_empty() {
        return Err(WallError::Validation(
            "Please write your rewrite before publishing.".to_string(),
        ));
    }
    if rewrite.chars().count() > MAX_REWRITE_CHARS {
        return Err(WallError::Validation(format!(
            "Rewrite is too long (max {} characters).",
            MAX_REWRITE_CHARS
        )));
    }
    Ok(rewrite.to_string())
}

/// Publish `draft` as a new post
pub async fn submit_rewrite(
    ctx: &WallContext,
    session: Option<&Session>,
    question: &Question,
    topic: Option<&Topic>,
    draft: &RewriteDraft,
) -> WallResult<Post> {
    let Some(session) = session else {
        return Err(WallError::AuthRequired(
            "Please sign in to publish.".to_string(),
        ));
    };
    let rewrite = validate_rewrite(draft)?;

    let row = json!({
        "user_id": session.user_id(),
        "topic_id": topic.map(|t| &t.id).unwrap_or(&question.topic_id),
        "question_id": question.id,
        "topic_title": topic.map(|t| t.title.as_str()),
        "question_prompt": question.prompt,
        "ai_answer": optional(&draft.ai_answer),
        "critique": optional(&draft.critique),
        "rewrite": rewrite,
        "display_name": optional(&draft.display_name),
    });

    let stored = ctx
        .store
        .insert(collections::POSTS, row)
        .await
        .map_err(WallError::into_persistence)?;
    let post: Post = decode_row(stored).map_err(WallError::into_persistence)?;
    info!("Published post {} for question {}", post.id, question.id);
    Ok(post)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::InMemoryBackend;
    use crate::model::{Identity, User};
    use std::sync::Arc;

    fn question() -> Question {
        Question {
            id: Identity::new("10"),
            topic_id: Identity::new("1"),
            prompt: "What should change?".to_string(),
            ai_answer: Some("Everything".to_string()),
        }
    }

    fn session() -> Session {
        Session {
            user: User {
                id: Identity::new("u1"),
                email: None,
            },
            access_token: String::new(),
        }
    }

    fn draft(rewrite: &str) -> RewriteDraft {
        RewriteDraft {
            ai_answer: "Everything".to_string(),
            critique: "  ".to_string(),
            rewrite: rewrite.to_string(),
            display_name: " Sam ".to_string(),
        }
    }

    #[tokio::test]
    async fn test_rewrite_length_limits() {
        let backend = Arc::new(InMemoryBackend::new());
        let ctx = WallContext::in_memory(backend.clone());
        let session = session();

        let too_long = "x".repeat(MAX_REWRITE_CHARS + 1);
        for bad in ["   \n ", too_long.as_str()] {
            let err = submit_rewrite(&ctx, Some(&session), &question(), None, &draft(bad))
                .await
                .unwrap_err();
            assert!(matches!(err, WallError::Validation(_)));
        }
        assert!(backend.writes().is_empty());

        // Limit counts characters, not bytes
        let multibyte = "é".repeat(MAX_REWRITE_CHARS);
        assert!(validate_rewrite(&draft(&multibyte)).is_ok());
    }

    #[tokio::test]
    async fn test_session_checked_first() {
        let backend = Arc::new(InMemoryBackend::new());
        let ctx = WallContext::in_memory(backend.clone());
        let err = submit_rewrite(&ctx, None, &question(), None, &draft(""))
            .await
            .unwrap_err();
        assert!(matches!(err, WallError::AuthRequired(_)));
        assert!(backend.writes().is_empty());
    }

    #[tokio::test]
    async fn test_publishes_denormalised_post() {
        let backend = Arc::new(InMemoryBackend::new());
        let ctx = WallContext::in_memory(backend.clone());
        let topic = Topic {
            id: Identity::new("1"),
            slug: "climate".to_string(),
            title: "Climate".to_string(),
            emoji: None,
        };

        let post = submit_rewrite(
            &ctx,
            Some(&session()),
            &question(),
            Some(&topic),
            &draft("  A better answer. "),
        )
        .await
        .unwrap();

        assert_eq!(post.rewrite, "A better answer.");
        assert_eq!(post.title(), "Climate");
        assert_eq!(post.critique, None);
        assert_eq!(post.display_name.as_deref(), Some("Sam"));
        assert_eq!(post.question_prompt.as_deref(), Some("What should change?"));
        assert_eq!(backend.rows(collections::POSTS).len(), 1);
    }

    #[tokio::test]
    async fn test_write_failure_is_persistence() {
        let backend = Arc::new(InMemoryBackend::new());
        let ctx = WallContext::in_memory(backend.clone());
        backend.fail_next_writes(1, "new row violates row-level security policy");
        let err = submit_rewrite(&ctx, Some(&session()), &question(), None, &draft("ok"))
            .await
            .unwrap_err();
        assert!(matches!(err, WallError::Persistence(_)));
    }
}
