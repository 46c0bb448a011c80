// HTTP surface: login/relay pages, state issuance, the OAuth callback
// and the JSON attendance API.

pub mod callback;
pub mod pages;

use std::sync::Arc;

use anyhow::{Context, Result};
use axum::{
    extract::State,
    response::Html,
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::auth::cipher::TokenCipher;
use crate::auth::state::{StateTokenService, STATE_EXPIRY_SECONDS};
use crate::config::AppConfig;
use crate::cors::cors_layer;
use crate::error::{AppError, ErrorCode};
use crate::slack::notify::{send_message_as_user, SendAsUserError, WebhookNotifier};
use crate::slack::SlackApi;
use crate::store::{
    LogEntry, RoomKind, StoreError, UserProfile, UserStore, ACTION_ENTER, ACTION_EXIT,
    ACTION_RETURN_KEY, ACTION_TAKE_KEY,
};

const RECENT_LOGS_LIMIT: i64 = 50;

/// Shared per-request context. The crypto services are constructed once
/// at startup and injected, never reached through globals, so tests can
/// run with fixed secrets.
#[derive(Clone)]
pub struct ApiState {
    pub config: Arc<AppConfig>,
    pub state_tokens: Arc<StateTokenService>,
    pub cipher: Arc<TokenCipher>,
    pub slack: Arc<dyn SlackApi>,
    pub store: UserStore,
    pub notifier: Arc<WebhookNotifier>,
    authorize_url: String,
}

impl ApiState {
    pub fn new(config: AppConfig, slack: Arc<dyn SlackApi>, store: UserStore) -> Result<Self> {
        let state_tokens = StateTokenService::new(&config.state_secret)
            .context("state token service failed to initialize")?;
        let cipher = TokenCipher::new(&config.encryption_key)
            .context("token cipher failed to initialize")?;
        let notifier = WebhookNotifier::new(config.slack_webhook_url.clone());
        let authorize_url = config.authorize_url().context("invalid slack authorize URL")?;

        Ok(Self {
            config: Arc::new(config),
            state_tokens: Arc::new(state_tokens),
            cipher: Arc::new(cipher),
            slack,
            store,
            notifier: Arc::new(notifier),
            authorize_url,
        })
    }
}

pub fn router(state: ApiState) -> Router {
    let cors = cors_layer(state.config.cors_origins.clone());

    Router::new()
        .route("/", get(login_page))
        .route("/slack-auth", get(relay_page))
        .route("/auth/slack/state", post(issue_state).layer(cors))
        .route("/auth/slack/callback", get(callback::slack_oauth_callback))
        .route("/api/users", get(list_users))
        .route("/api/logs", get(recent_logs))
        .route("/api/presence", post(set_presence))
        .route("/api/key", post(mutate_key))
        .route("/api/message", post(send_message))
        .with_state(state)
}

async fn login_page(State(api): State<ApiState>) -> Html<String> {
    Html(pages::login_page(&api.authorize_url))
}

async fn relay_page() -> Html<String> {
    Html(pages::relay_page())
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StateIssueResponse {
    success: bool,
    state: String,
    expires_in: i64,
}

async fn issue_state(State(api): State<ApiState>) -> Json<StateIssueResponse> {
    Json(StateIssueResponse {
        success: true,
        state: api.state_tokens.generate(),
        expires_in: STATE_EXPIRY_SECONDS,
    })
}

async fn list_users(State(api): State<ApiState>) -> Result<Json<Vec<UserProfile>>, AppError> {
    Ok(Json(api.store.list_users().await?))
}

async fn recent_logs(State(api): State<ApiState>) -> Result<Json<Vec<LogEntry>>, AppError> {
    Ok(Json(api.store.recent_logs(RECENT_LOGS_LIMIT).await?))
}

#[derive(Debug, Deserialize)]
struct PresenceRequest {
    uid: String,
    room: RoomKind,
    present: bool,
}

#[derive(Debug, Deserialize)]
struct KeyRequest {
    uid: String,
    acquire: bool,
}

#[derive(Debug, Deserialize)]
struct MessageRequest {
    uid: String,
    text: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct MutationResponse {
    success: bool,
}

async fn set_presence(
    State(api): State<ApiState>,
    Json(payload): Json<PresenceRequest>,
) -> Result<Json<MutationResponse>, AppError> {
    validate_uid(&payload.uid)?;
    api.store
        .set_room_presence(&payload.uid, payload.room, payload.present)
        .await?;

    let action = if payload.present { ACTION_ENTER } else { ACTION_EXIT };
    notify_mutation(&api, &payload.uid, action, payload.room.display_name().to_owned(), false)
        .await;

    Ok(Json(MutationResponse { success: true }))
}

async fn mutate_key(
    State(api): State<ApiState>,
    Json(payload): Json<KeyRequest>,
) -> Result<Json<MutationResponse>, AppError> {
    validate_uid(&payload.uid)?;

    let action = if payload.acquire {
        api.store.acquire_key(&payload.uid).await?;
        ACTION_TAKE_KEY
    } else {
        api.store.release_key(&payload.uid).await?;
        ACTION_RETURN_KEY
    };
    notify_mutation(&api, &payload.uid, action, String::new(), payload.acquire).await;

    Ok(Json(MutationResponse { success: true }))
}

async fn send_message(
    State(api): State<ApiState>,
    Json(payload): Json<MessageRequest>,
) -> Result<Json<MutationResponse>, AppError> {
    validate_uid(&payload.uid)?;
    let channel = api.config.slack_channel_id.as_deref().ok_or_else(|| {
        AppError::new(ErrorCode::ValidationFailed, "no slack channel configured for user messages")
    })?;

    send_message_as_user(
        &api.store,
        &api.cipher,
        api.slack.as_ref(),
        &payload.uid,
        channel,
        &payload.text,
    )
    .await?;

    Ok(Json(MutationResponse { success: true }))
}

fn validate_uid(uid: &str) -> Result<(), AppError> {
    if uid.trim().is_empty() {
        return Err(AppError::new(ErrorCode::ValidationFailed, "uid must not be empty"));
    }
    Ok(())
}

/// Fire the webhook notification for a committed mutation. The log row
/// is already durable; delivery happens off the request path and its
/// failures never surface to the caller.
async fn notify_mutation(
    api: &ApiState,
    uid: &str,
    action: &'static str,
    room: String,
    holder_is_actor: bool,
) {
    let Ok(Some(user)) = api.store.get_user(uid).await else {
        return;
    };
    let holder_name = holder_is_actor.then(|| user.name.clone());
    let entry = LogEntry {
        user_id: user.uid,
        user_name: user.name,
        action: action.to_owned(),
        room,
        logged_at: Utc::now(),
    };
    let notifier = Arc::clone(&api.notifier);
    tokio::spawn(async move {
        notifier.notify_log(&entry, holder_name.as_deref()).await;
    });
}

impl From<StoreError> for AppError {
    fn from(error: StoreError) -> Self {
        match error {
            StoreError::UserNotFound(uid) => {
                AppError::new(ErrorCode::NotFound, format!("user {uid} not found"))
            }
            StoreError::Internal(error) => {
                tracing::error!(error = ?error, "store operation failed");
                AppError::from_code(ErrorCode::InternalError)
            }
        }
    }
}

impl From<SendAsUserError> for AppError {
    fn from(error: SendAsUserError) -> Self {
        match error {
            SendAsUserError::NoToken(uid) => {
                AppError::new(ErrorCode::NotFound, format!("no stored slack token for {uid}"))
            }
            SendAsUserError::TokenInvalid => AppError::from_code(ErrorCode::TokenInvalid),
            SendAsUserError::Rejected(reason) => {
                AppError::new(ErrorCode::ProviderRejected, format!("slack error: {reason}"))
            }
            SendAsUserError::Api(error) => {
                tracing::warn!(%error, "slack api call failed");
                AppError::from_code(ErrorCode::ProviderRejected)
            }
            SendAsUserError::Store(error) => AppError::from(error),
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::future::Future;
    use std::net::SocketAddr;
    use std::pin::Pin;
    use std::sync::Arc;

    use axum::{
        body::{to_bytes, Body},
        http::{Method, Request, StatusCode},
        Router,
    };
    use serde_json::{json, Value};
    use tower::ServiceExt;

    use super::{router, ApiState};
    use crate::config::AppConfig;
    use crate::slack::{
        PostMessageResponse, SlackApi, SlackApiError, TokenExchangeResponse, UserInfoResponse,
    };
    use crate::store::UserStore;

    pub(crate) const TEST_ENCRYPTION_KEY: &str =
        "000102030405060708090a0b0c0d0e0f101112131415161718191a1b1c1d1e1f";

    pub(crate) fn test_config() -> AppConfig {
        AppConfig {
            listen_addr: SocketAddr::from(([127, 0, 0, 1], 0)),
            public_base_url: "http://localhost:8080".into(),
            slack_client_id: "test-client-id".into(),
            slack_client_secret: "test-client-secret".into(),
            slack_scope: "users:read".into(),
            slack_api_base: "https://slack.com/api".into(),
            slack_webhook_url: None,
            slack_channel_id: Some("C-TEST".into()),
            encryption_key: TEST_ENCRYPTION_KEY.into(),
            state_secret: "kagiban-test-state-secret".into(),
            database_url: None,
            cors_origins: None,
            allowed_origins: vec!["http://localhost:5173".into()],
            log_filter: "info".into(),
        }
    }

    /// SlackApi stub for routes that never reach Slack.
    pub(crate) struct UnreachableSlackApi;

    impl SlackApi for UnreachableSlackApi {
        fn exchange_code(
            &self,
            _code: &str,
        ) -> Pin<Box<dyn Future<Output = Result<TokenExchangeResponse, SlackApiError>> + Send>>
        {
            Box::pin(async { Err(SlackApiError::Transport("unexpected call".into())) })
        }

        fn user_info(
            &self,
            _user_id: &str,
            _bot_token: &str,
        ) -> Pin<Box<dyn Future<Output = Result<UserInfoResponse, SlackApiError>> + Send>>
        {
            Box::pin(async { Err(SlackApiError::Transport("unexpected call".into())) })
        }

        fn post_message(
            &self,
            _user_token: &str,
            _channel: &str,
            _text: &str,
        ) -> Pin<Box<dyn Future<Output = Result<PostMessageResponse, SlackApiError>> + Send>>
        {
            Box::pin(async { Err(SlackApiError::Transport("unexpected call".into())) })
        }
    }

    fn test_state() -> ApiState {
        ApiState::new(test_config(), Arc::new(UnreachableSlackApi), UserStore::memory())
            .expect("api state should initialize")
    }

    fn test_router() -> (Router, ApiState) {
        let state = test_state();
        (router(state.clone()), state)
    }

    async fn seeded_router() -> (Router, ApiState) {
        let (app, state) = test_router();
        let identity = crate::slack::AppIdentity {
            uid: "slack_U1".into(),
            name: "Taro".into(),
            email: String::new(),
            avatar: String::new(),
            provider: "slack".into(),
            slack_user_id: "U1".into(),
            slack_team_id: "T1".into(),
        };
        state.store.upsert(&identity, "enc").await.expect("seed should succeed");
        (app, state)
    }

    fn json_request(method: Method, uri: &str, payload: Value) -> Request<Body> {
        Request::builder()
            .method(method)
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(payload.to_string()))
            .expect("request should build")
    }

    async fn body_json(response: axum::response::Response) -> Value {
        let body = to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("response body should read");
        serde_json::from_slice(&body).expect("response body should be JSON")
    }

    #[tokio::test]
    async fn state_issuance_returns_valid_token_with_fixed_expiry() {
        let (app, state) = test_router();

        let response = app
            .oneshot(
                Request::builder()
                    .method(Method::POST)
                    .uri("/auth/slack/state")
                    .body(Body::empty())
                    .expect("request should build"),
            )
            .await
            .expect("state request should complete");
        assert_eq!(response.status(), StatusCode::OK);

        let parsed = body_json(response).await;
        assert_eq!(parsed["success"], true);
        assert_eq!(parsed["expiresIn"], 600);
        let token = parsed["state"].as_str().expect("state should be present");
        assert!(state.state_tokens.validate(token));
    }

    #[tokio::test]
    async fn state_issuance_rejects_get() {
        let (app, _) = test_router();
        let response = app
            .oneshot(
                Request::builder()
                    .uri("/auth/slack/state")
                    .body(Body::empty())
                    .expect("request should build"),
            )
            .await
            .expect("request should complete");
        assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);
    }

    #[tokio::test]
    async fn callback_rejects_non_get_methods() {
        let (app, _) = test_router();
        let response = app
            .oneshot(
                Request::builder()
                    .method(Method::POST)
                    .uri("/auth/slack/callback?code=x&state=y")
                    .body(Body::empty())
                    .expect("request should build"),
            )
            .await
            .expect("request should complete");
        assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);
    }

    #[tokio::test]
    async fn presence_mutation_updates_user_and_appends_log() {
        let (app, state) = seeded_router().await;

        let response = app
            .oneshot(json_request(
                Method::POST,
                "/api/presence",
                json!({"uid": "slack_U1", "room": "room2218", "present": true}),
            ))
            .await
            .expect("presence request should complete");
        assert_eq!(response.status(), StatusCode::OK);

        let user = state.store.get_user("slack_U1").await.unwrap().unwrap();
        assert!(user.room2218);
        let logs = state.store.recent_logs(10).await.unwrap();
        assert_eq!(logs[0].action, "入室");
        assert_eq!(logs[0].room, "2218号室");
    }

    #[tokio::test]
    async fn presence_for_unknown_user_is_not_found() {
        let (app, _) = seeded_router().await;
        let response = app
            .oneshot(json_request(
                Method::POST,
                "/api/presence",
                json!({"uid": "slack_missing", "room": "gradRoom", "present": true}),
            ))
            .await
            .expect("presence request should complete");
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        let parsed = body_json(response).await;
        assert_eq!(parsed["error"]["code"], "NOT_FOUND");
    }

    #[tokio::test]
    async fn key_endpoint_acquires_and_releases() {
        let (app, state) = seeded_router().await;

        let response = app
            .clone()
            .oneshot(json_request(
                Method::POST,
                "/api/key",
                json!({"uid": "slack_U1", "acquire": true}),
            ))
            .await
            .expect("key request should complete");
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(state.store.key_holder().await.unwrap().as_deref(), Some("slack_U1"));

        let response = app
            .oneshot(json_request(
                Method::POST,
                "/api/key",
                json!({"uid": "slack_U1", "acquire": false}),
            ))
            .await
            .expect("key request should complete");
        assert_eq!(response.status(), StatusCode::OK);
        assert!(state.store.key_holder().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn blank_uid_is_a_validation_error() {
        let (app, _) = seeded_router().await;
        let response = app
            .oneshot(json_request(
                Method::POST,
                "/api/key",
                json!({"uid": "  ", "acquire": true}),
            ))
            .await
            .expect("key request should complete");
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let parsed = body_json(response).await;
        assert_eq!(parsed["error"]["code"], "VALIDATION_FAILED");
    }

    #[tokio::test]
    async fn user_listing_never_exposes_encrypted_tokens() {
        let (app, _) = seeded_router().await;
        let response = app
            .oneshot(
                Request::builder()
                    .uri("/api/users")
                    .body(Body::empty())
                    .expect("request should build"),
            )
            .await
            .expect("users request should complete");
        assert_eq!(response.status(), StatusCode::OK);

        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let text = String::from_utf8(body.to_vec()).unwrap();
        assert!(text.contains("slack_U1"));
        assert!(!text.contains("encryptedToken"));
        assert!(!text.contains("enc"));
    }

    #[tokio::test]
    async fn login_and_relay_pages_are_served() {
        let (app, _) = test_router();
        let login = app
            .clone()
            .oneshot(Request::builder().uri("/").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(login.status(), StatusCode::OK);
        let body = to_bytes(login.into_body(), usize::MAX).await.unwrap();
        let text = String::from_utf8(body.to_vec()).unwrap();
        assert!(text.contains("Slackでログイン"));
        assert!(text.contains("slack.com/oauth/v2/authorize"));

        let relay = app
            .oneshot(Request::builder().uri("/slack-auth").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(relay.status(), StatusCode::OK);
    }
}
