/// Row types shared by the feed, the catalog and the backend adapters
use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;

/// Opaque row key issued by the store
///
/// Compared by token text. Numeric keys (bigint columns) are accepted and
/// kept in their decimal form.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(transparent)]
pub struct Identity(String);

impl Identity {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for Identity {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Text(String),
            Number(i64),
        }

        Ok(match Raw::deserialize(deserializer)? {
            Raw::Text(s) => Identity(s),
            Raw::Number(n) => Identity(n.to_string()),
        })
    }
}

/// A published rewrite on the wall
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Post {
    pub id: Identity,
    pub user_id: Identity,
    pub topic_id: Option<Identity>,
    #[serde(default)]
    pub question_id: Option<Identity>,
    #[serde(default)]
    pub topic_title: Option<String>,
    #[serde(default)]
    pub question_prompt: Option<String>,
    #[serde(default)]
    pub ai_answer: Option<String>,
    #[serde(default)]
    pub critique: Option<String>,
    pub rewrite: String,
    #[serde(default)]
    pub display_name: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Post {
    /// Heading shown above the card
    pub fn title(&self) -> &str {
        self.topic_title.as_deref().unwrap_or("Untitled")
    }
}

/// Reaction category
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ReactionKind {
    #[serde(rename = "like")]
    Approve,
    #[serde(rename = "dislike")]
    Disapprove,
}

impl ReactionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReactionKind::Approve => "like",
            ReactionKind::Disapprove => "dislike",
        }
    }
}

/// One user's reaction to one post
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reaction {
    pub post_id: Identity,
    pub user_id: Identity,
    #[serde(rename = "type")]
    pub kind: ReactionKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
}

/// Comment under a post
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Comment {
    pub id: Identity,
    pub post_id: Identity,
    pub user_id: Identity,
    pub body: String,
    #[serde(default)]
    pub display_name: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Comment {
    pub fn author(&self) -> &str {
        self.display_name.as_deref().unwrap_or("Guest")
    }
}

/// Authenticated actor as reported by the auth service
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: Identity,
    #[serde(default)]
    pub email: Option<String>,
}

/// Current session; anonymous sessions carry no email
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    pub user: User,
    #[serde(default, skip_serializing)]
    pub access_token: String,
}

impl Session {
    pub fn user_id(&self) -> &Identity {
        &self.user.id
    }

    pub fn is_anonymous(&self) -> bool {
        self.user.email.is_none()
    }
}

/// Topic a question belongs to
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Topic {
    pub id: Identity,
    pub slug: String,
    pub title: String,
    #[serde(default)]
    pub emoji: Option<String>,
}

/// Prompt users answer and critique
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Question {
    pub id: Identity,
    pub topic_id: Identity,
    pub prompt: String,
    #[serde(default)]
    pub ai_answer: Option<String>,
}

/// Collection names used by the store
pub mod collections {
    pub const POSTS: &str = "posts";
    pub const REACTIONS: &str = "reactions";
    pub const COMMENTS: &str = "comments";
    pub const TOPICS: &str = "topics";
    pub const QUESTIONS: &str = "questions";
}
