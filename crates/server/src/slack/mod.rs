// Slack Web API boundary: wire types, the object-safe client trait the
// orchestrator depends on, and the reqwest-backed production client.

pub mod notify;

use std::{future::Future, pin::Pin};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Transport-level failures talking to Slack. Slack-level `ok: false`
/// envelopes are not errors at this layer; callers inspect them because
/// the remediation differs per error string.
#[derive(Debug, Error)]
pub enum SlackApiError {
    #[error("slack request failed: {0}")]
    Transport(String),
    #[error("slack responded with status {0}")]
    Status(u16),
    #[error("slack response could not be decoded: {0}")]
    Decode(String),
}

/// Response envelope of `oauth.v2.access`.
#[derive(Debug, Clone, Deserialize)]
pub struct TokenExchangeResponse {
    pub ok: bool,
    #[serde(default)]
    pub error: Option<String>,
    /// Bot-level access token.
    #[serde(default)]
    pub access_token: Option<String>,
    #[serde(default)]
    pub authed_user: Option<AuthedUserField>,
    #[serde(default)]
    pub team: Option<SlackTeam>,
}

/// The `authed_user` object. Both fields may legitimately be absent
/// depending on how the installation was authorized; see
/// [`extract_authed_user`].
#[derive(Debug, Clone, Deserialize)]
pub struct AuthedUserField {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub access_token: Option<String>,
    #[serde(default)]
    pub scope: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SlackTeam {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
}

/// Response envelope of `users.info`.
#[derive(Debug, Clone, Deserialize)]
pub struct UserInfoResponse {
    pub ok: bool,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub user: Option<SlackUser>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SlackUser {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub profile: Option<SlackProfile>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SlackProfile {
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub real_name: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub image_192: Option<String>,
    #[serde(default)]
    pub image_72: Option<String>,
}

/// Response envelope of `chat.postMessage`.
#[derive(Debug, Clone, Deserialize)]
pub struct PostMessageResponse {
    pub ok: bool,
    #[serde(default)]
    pub error: Option<String>,
}

/// Slack Web API calls used by the OAuth flow and the as-user message
/// path. Boxed futures for object safety so tests can inject mocks.
pub trait SlackApi: Send + Sync {
    fn exchange_code(
        &self,
        code: &str,
    ) -> Pin<Box<dyn Future<Output = Result<TokenExchangeResponse, SlackApiError>> + Send>>;

    fn user_info(
        &self,
        user_id: &str,
        bot_token: &str,
    ) -> Pin<Box<dyn Future<Output = Result<UserInfoResponse, SlackApiError>> + Send>>;

    fn post_message(
        &self,
        user_token: &str,
        channel: &str,
        text: &str,
    ) -> Pin<Box<dyn Future<Output = Result<PostMessageResponse, SlackApiError>> + Send>>;
}

/// Production client over the Slack Web API.
#[derive(Clone)]
pub struct HttpSlackApi {
    http: reqwest::Client,
    api_base: String,
    client_id: String,
    client_secret: String,
}

impl HttpSlackApi {
    pub fn new(api_base: String, client_id: String, client_secret: String) -> Self {
        Self { http: reqwest::Client::new(), api_base, client_id, client_secret }
    }
}

impl SlackApi for HttpSlackApi {
    fn exchange_code(
        &self,
        code: &str,
    ) -> Pin<Box<dyn Future<Output = Result<TokenExchangeResponse, SlackApiError>> + Send>> {
        let http = self.http.clone();
        let url = format!("{}/oauth.v2.access", self.api_base);
        let client_id = self.client_id.clone();
        let client_secret = self.client_secret.clone();
        let code = code.to_owned();

        Box::pin(async move {
            let response = http
                .post(&url)
                .form(&[
                    ("client_id", client_id.as_str()),
                    ("client_secret", client_secret.as_str()),
                    ("code", code.as_str()),
                ])
                .send()
                .await
                .map_err(|error| SlackApiError::Transport(error.to_string()))?;

            if !response.status().is_success() {
                return Err(SlackApiError::Status(response.status().as_u16()));
            }

            response
                .json::<TokenExchangeResponse>()
                .await
                .map_err(|error| SlackApiError::Decode(error.to_string()))
        })
    }

    fn user_info(
        &self,
        user_id: &str,
        bot_token: &str,
    ) -> Pin<Box<dyn Future<Output = Result<UserInfoResponse, SlackApiError>> + Send>> {
        let http = self.http.clone();
        let url = format!("{}/users.info", self.api_base);
        let user_id = user_id.to_owned();
        let bot_token = bot_token.to_owned();

        Box::pin(async move {
            let response = http
                .get(&url)
                .query(&[("user", user_id.as_str())])
                .bearer_auth(bot_token)
                .send()
                .await
                .map_err(|error| SlackApiError::Transport(error.to_string()))?;

            if !response.status().is_success() {
                return Err(SlackApiError::Status(response.status().as_u16()));
            }

            response
                .json::<UserInfoResponse>()
                .await
                .map_err(|error| SlackApiError::Decode(error.to_string()))
        })
    }

    fn post_message(
        &self,
        user_token: &str,
        channel: &str,
        text: &str,
    ) -> Pin<Box<dyn Future<Output = Result<PostMessageResponse, SlackApiError>> + Send>> {
        let http = self.http.clone();
        let url = format!("{}/chat.postMessage", self.api_base);
        let user_token = user_token.to_owned();
        let body = serde_json::json!({ "channel": channel, "text": text });

        Box::pin(async move {
            let response = http
                .post(&url)
                .bearer_auth(user_token)
                .json(&body)
                .send()
                .await
                .map_err(|error| SlackApiError::Transport(error.to_string()))?;

            if !response.status().is_success() {
                return Err(SlackApiError::Status(response.status().as_u16()));
            }

            response
                .json::<PostMessageResponse>()
                .await
                .map_err(|error| SlackApiError::Decode(error.to_string()))
        })
    }
}

/// The authorized user's id and user-level access token, once both are
/// known to be present.
#[derive(Debug, Clone)]
pub struct AuthedUser {
    pub id: String,
    pub access_token: String,
}

/// Extract the authed user from an exchange response, or explain why it
/// cannot be done.
///
/// The `authed_user` fields are absent in distinct, legitimate ways with
/// different remediations, so the failure is a human-readable diagnosis
/// for the operator rather than a generic missing-field error.
pub fn extract_authed_user(response: &TokenExchangeResponse) -> Result<AuthedUser, String> {
    let Some(authed_user) = response.authed_user.as_ref() else {
        return Err(
            "authorization response carried no authed_user object; the app was \
             likely installed by a workspace admin without the user consent flow — \
             reinstall via the user authorization URL"
                .to_owned(),
        );
    };

    match (non_empty(&authed_user.id), non_empty(&authed_user.access_token)) {
        (Some(id), Some(token)) => {
            Ok(AuthedUser { id: id.to_owned(), access_token: token.to_owned() })
        }
        (Some(_), None) => Err(
            "authed_user.access_token is missing; no user-level scopes are \
             configured for this app — add user token scopes to the Slack app \
             configuration"
                .to_owned(),
        ),
        (None, Some(_)) => Err(
            "authed_user.id is missing even though a user token was issued; \
             Slack did not identify the authorizing user"
                .to_owned(),
        ),
        (None, None) => Err(
            "authed_user carried neither id nor access_token; the grant did not \
             include the authorizing user — check the install flow and user scopes"
                .to_owned(),
        ),
    }
}

/// The application-level identity written to the user store and relayed
/// to the opener.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppIdentity {
    pub uid: String,
    pub name: String,
    pub email: String,
    pub avatar: String,
    pub provider: String,
    pub slack_user_id: String,
    pub slack_team_id: String,
}

/// Build the canonical identity from a Slack profile.
///
/// Name preference: display name, real name, account name, then a
/// literal fallback. Avatar preference: high resolution first. Empty
/// strings count as absent throughout.
pub fn build_identity(user: &SlackUser, team_id: &str) -> AppIdentity {
    let profile = user.profile.clone().unwrap_or_default();

    let name = non_empty(&profile.display_name)
        .or_else(|| non_empty(&profile.real_name))
        .or_else(|| non_empty(&user.name))
        .unwrap_or("Unknown User")
        .to_owned();

    let avatar = non_empty(&profile.image_192)
        .or_else(|| non_empty(&profile.image_72))
        .unwrap_or("")
        .to_owned();

    let email = non_empty(&profile.email).unwrap_or("").to_owned();

    AppIdentity {
        uid: format!("slack_{}", user.id),
        name,
        email,
        avatar,
        provider: "slack".to_owned(),
        slack_user_id: user.id.clone(),
        slack_team_id: team_id.to_owned(),
    }
}

fn non_empty(value: &Option<String>) -> Option<&str> {
    value.as_deref().filter(|s| !s.trim().is_empty())
}
