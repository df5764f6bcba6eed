/// HTTP adapter for the hosted backend
///
/// Rows go through the REST row API (`/rest/v1/<table>`), sign-in flows
/// through the auth API (`/auth/v1/...`). The current session is kept
/// locally and published to `session_changes` subscribers.
use crate::{
    backend::{
        subscription::forward_watch, AuthProvider, DataStore, Filter, Query, Row, Subscription,
    },
    error::{WallError, WallResult},
    model::{Identity, Session, User},
};
use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Response};
use serde::Deserialize;
use serde_json::{json, Value};
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

const SESSION_BUFFER: usize = 16;

/// Token grant returned by the auth API
#[derive(Debug, Deserialize)]
struct TokenGrant {
    access_token: String,
    user: GrantUser,
}

#[derive(Debug, Deserialize)]
struct GrantUser {
    id: Identity,
    #[serde(default)]
    email: Option<String>,
}

impl From<TokenGrant> for Session {
    fn from(grant: TokenGrant) -> Self {
        Session {
            user: User {
                id: grant.user.id,
                email: grant.user.email.filter(|e| !e.is_empty()),
            },
            access_token: grant.access_token,
        }
    }
}

/// REST client for the hosted backend
pub struct RestBackend {
    http_client: Client,
    base_url: String,
    anon_key: String,
    session: watch::Sender<Option<Session>>,
}

impl RestBackend {
    pub fn new(base_url: &str, anon_key: &str, request_timeout_secs: u64) -> WallResult<Self> {
        let http_client = Client::builder()
            .timeout(Duration::from_secs(request_timeout_secs))
            .build()
            .map_err(|e| WallError::Config(format!("Failed to create HTTP client: {}", e)))?;
        let (session, _) = watch::channel(None);

        Ok(Self {
            http_client,
            base_url: base_url.trim_end_matches('/').to_string(),
            anon_key: anon_key.to_string(),
            session,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn anon_key(&self) -> &str {
        &self.anon_key
    }

    /// Receiver for the locally held session, used by the realtime adapter
    /// to authorize channel joins
    pub fn session_watch(&self) -> watch::Receiver<Option<Session>> {
        self.session.subscribe()
    }

    /// Install a session obtained out of band (e.g. an OAuth redirect)
    pub fn set_session(&self, session: Option<Session>) {
        self.session.send_replace(session);
    }

    fn table_url(&self, collection: &str) -> String {
        format!("{}/rest/v1/{}", self.base_url, collection)
    }

    fn auth_url(&self, path: &str) -> String {
        format!("{}/auth/v1/{}", self.base_url, path)
    }

    fn bearer(&self) -> String {
        self.session
            .borrow()
            .as_ref()
            .map(|s| s.access_token.clone())
            .unwrap_or_else(|| self.anon_key.clone())
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        request
            .header("apikey", &self.anon_key)
            .header("Authorization", format!("Bearer {}", self.bearer()))
    }

    async fn send(&self, request: RequestBuilder) -> WallResult<Response> {
        let response = self
            .authorize(request)
            .send()
            .await
            .map_err(|e| WallError::Transport(format!("Request failed: {}", e)))?;

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let body = response.text().await.unwrap_or_default();
        Err(WallError::Transport(error_message(status.as_u16(), &body)))
    }

    async fn grant(&self, request: RequestBuilder) -> WallResult<Session> {
        let grant: TokenGrant = self
            .send(request)
            .await?
            .json()
            .await
            .map_err(|e| WallError::Transport(format!("Malformed auth response: {}", e)))?;
        let session = Session::from(grant);
        self.session.send_replace(Some(session.clone()));
        Ok(session)
    }
}

/// Query string for a select
fn select_params(query: &Query) -> String {
    let mut params = vec!["select=*".to_string()];
    params.extend(filter_params(&query.filters));
    if let Some(order) = &query.order {
        params.push(format!(
            "order={}.{}",
            order.column,
            if order.ascending { "asc" } else { "desc" }
        ));
    }
    if let Some(limit) = query.limit {
        params.push(format!("limit={}", limit));
    }
    params.join("&")
}

fn filter_params(filters: &[Filter]) -> Vec<String> {
    filters
        .iter()
        .map(|f| format!("{}=eq.{}", f.column, urlencoding::encode(&f.value)))
        .collect()
}

/// Human-readable message from an error response body
fn error_message(status: u16, body: &str) -> String {
    let parsed: Option<Value> = serde_json::from_str(body).ok();
    let message = parsed.as_ref().and_then(|v| {
        ["message", "msg", "error_description", "error"]
            .iter()
            .find_map(|key| v.get(*key).and_then(Value::as_str))
            .map(str::to_string)
    });

    match message {
        Some(message) => message,
        None if body.trim().is_empty() => format!("HTTP {}", status),
        None => format!("HTTP {}: {}", status, body.trim()),
    }
}

#[async_trait]
impl DataStore for RestBackend {
    async fn select(&self, query: &Query) -> WallResult<Vec<Row>> {
        let url = format!("{}?{}", self.table_url(&query.collection), select_params(query));
        debug!("GET {}", url);

        let rows: Vec<Row> = self
            .send(self.http_client.get(&url))
            .await?
            .json()
            .await
            .map_err(|e| WallError::Transport(format!("Malformed rows: {}", e)))?;
        Ok(rows)
    }

    async fn insert(&self, collection: &str, row: Row) -> WallResult<Row> {
        let url = self.table_url(collection);
        debug!("POST {}", url);

        let mut rows: Vec<Row> = self
            .send(
                self.http_client
                    .post(&url)
                    .header("Prefer", "return=representation")
                    .json(&row),
            )
            .await?
            .json()
            .await
            .map_err(|e| WallError::Transport(format!("Malformed rows: {}", e)))?;

        if rows.is_empty() {
            return Err(WallError::Transport(format!(
                "Insert into {} returned no row",
                collection
            )));
        }
        Ok(rows.swap_remove(0))
    }

    async fn delete(&self, collection: &str, filters: &[Filter]) -> WallResult<()> {
        let url = format!(
            "{}?{}",
            self.table_url(collection),
            filter_params(filters).join("&")
        );
        debug!("DELETE {}", url);

        self.send(self.http_client.delete(&url)).await?;
        Ok(())
    }
}

#[async_trait]
impl AuthProvider for RestBackend {
    async fn get_session(&self) -> WallResult<Option<Session>> {
        Ok(self.session.borrow().clone())
    }

    async fn session_changes(&self) -> WallResult<Subscription<Option<Session>>> {
        Ok(forward_watch(self.session.subscribe(), SESSION_BUFFER))
    }

    async fn send_magic_link(&self, email: &str, redirect_to: Option<&str>) -> WallResult<()> {
        let mut url = self.auth_url("otp");
        if let Some(redirect_to) = redirect_to {
            url = format!("{}?redirect_to={}", url, urlencoding::encode(redirect_to));
        }

        self.send(
            self.http_client
                .post(&url)
                .json(&json!({ "email": email, "create_user": true })),
        )
        .await?;
        info!("Magic link requested for {}", email);
        Ok(())
    }

    async fn verify_otp(&self, email: &str, code: &str) -> WallResult<Session> {
        let session = self
            .grant(self.http_client.post(self.auth_url("verify")).json(&json!({
                "type": "email",
                "email": email,
                "token": code,
            })))
            .await?;
        info!("Signed in as {}", session.user_id());
        Ok(session)
    }

    async fn sign_in_anonymously(&self) -> WallResult<Session> {
        let session = self
            .grant(
                self.http_client
                    .post(self.auth_url("signup"))
                    .json(&json!({ "data": {} })),
            )
            .await?;
        info!("Signed in as guest {}", session.user_id());
        Ok(session)
    }

    fn oauth_authorize_url(&self, provider: &str, redirect_to: &str) -> WallResult<String> {
        Ok(format!(
            "{}?provider={}&redirect_to={}",
            self.auth_url("authorize"),
            urlencoding::encode(provider),
            urlencoding::encode(redirect_to)
        ))
    }

    async fn sign_out(&self) -> WallResult<()> {
        let had_session = self.session.borrow().is_some();
        let request = self.authorize(self.http_client.post(self.auth_url("logout")));
        self.session.send_replace(None);

        if !had_session {
            return Ok(());
        }

        // Local session is gone either way; report remote revocation failures
        let response = request
            .send()
            .await
            .map_err(|e| WallError::Transport(format!("Request failed: {}", e)))?;
        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            warn!("Remote sign-out failed with HTTP {}", status);
            return Err(WallError::Transport(error_message(status, &body)));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_select_params() {
        let query = Query::from("comments")
            .eq("post_id", "a b&c")
            .order_by("created_at", true);
        assert_eq!(
            select_params(&query),
            "select=*&post_id=eq.a%20b%26c&order=created_at.asc"
        );

        let feed = Query::from("posts").order_by("created_at", false).limit(100);
        assert_eq!(
            select_params(&feed),
            "select=*&order=created_at.desc&limit=100"
        );
    }

    #[test]
    fn test_error_message_extraction() {
        assert_eq!(
            error_message(401, r#"{"message":"JWT expired"}"#),
            "JWT expired"
        );
        assert_eq!(
            error_message(400, r#"{"error_description":"Token has expired"}"#),
            "Token has expired"
        );
        assert_eq!(error_message(502, ""), "HTTP 502");
        assert_eq!(error_message(500, "boom"), "HTTP 500: boom");
    }

    #[test]
    fn test_token_grant_to_session() {
        let grant: TokenGrant = serde_json::from_value(json!({
            "access_token": "tok",
            "token_type": "bearer",
            "user": {"id": "u1", "email": ""}
        }))
        .unwrap();
        let session = Session::from(grant);
        assert_eq!(session.user_id().as_str(), "u1");
        assert!(session.is_anonymous());
        assert_eq!(session.access_token, "tok");
    }

    #[tokio::test]
    async fn test_urls_and_local_session() {
        let backend = RestBackend::new("https://wall.example.co/", "anon", 5).unwrap();
        assert_eq!(backend.base_url(), "https://wall.example.co");
        assert_eq!(
            backend
                .oauth_authorize_url("github", "https://app.example/topics")
                .unwrap(),
            "https://wall.example.co/auth/v1/authorize?provider=github&redirect_to=https%3A%2F%2Fapp.example%2Ftopics"
        );

        assert_eq!(backend.bearer(), "anon");
        backend.set_session(Some(Session {
            user: User {
                id: Identity::new("u1"),
                email: None,
            },
            access_token: "user-token".to_string(),
        }));
        assert_eq!(backend.bearer(), "user-token");
        assert!(backend.get_session().await.unwrap().is_some());
    }
}
