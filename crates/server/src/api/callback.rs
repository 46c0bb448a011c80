// The OAuth exchange orchestrator: Slack's redirect lands here.
//
// Request-scoped and linear, but nearly every step can fail, and every
// failure must end in the error-relay page rather than an uncaught
// error — an opener left without a payload waits out the full relay
// timeout.

use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::Html,
};
use serde::Deserialize;
use tracing::{error, info, warn};

use crate::slack::{build_identity, extract_authed_user, AppIdentity};

use super::{pages, ApiState};

/// Slack error codes meaning "this workspace may not install the app".
/// Translated to a specific localized message; the remediation is on the
/// user's side, not ours.
const WORKSPACE_NOT_PERMITTED_ERRORS: &[&str] =
    &["invalid_team_for_non_distributed_app", "team_not_authorized"];

const WORKSPACE_NOT_PERMITTED_MESSAGE: &str =
    "このSlackワークスペースからはログインできません。研究室のワークスペースからお試しください。";

#[derive(Debug, Deserialize)]
pub struct CallbackQuery {
    pub code: Option<String>,
    pub state: Option<String>,
    /// Slack reports user-side aborts (e.g. access_denied) here instead
    /// of sending a code.
    pub error: Option<String>,
}

struct CallbackFailure {
    status: StatusCode,
    message: String,
    /// Echoed into the error payload only once the state has been
    /// validated, so the opener's re-check can accept it.
    state_echo: Option<String>,
}

impl CallbackFailure {
    fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self { status, message: message.into(), state_echo: None }
    }

    fn with_state(mut self, state: &str) -> Self {
        self.state_echo = Some(state.to_owned());
        self
    }
}

struct CallbackSuccess {
    identity: AppIdentity,
    state: String,
}

/// GET /auth/slack/callback — non-GET methods are rejected by the
/// router's method guard with 405.
pub async fn slack_oauth_callback(
    State(api): State<ApiState>,
    Query(query): Query<CallbackQuery>,
) -> (StatusCode, Html<String>) {
    let origins = &api.config.allowed_origins;
    match run_exchange(&api, query).await {
        Ok(success) => {
            let page = pages::success_page(&success.identity, &success.state, origins);
            (StatusCode::OK, Html(page))
        }
        Err(failure) => {
            let page =
                pages::error_page(&failure.message, failure.state_echo.as_deref(), origins);
            (failure.status, Html(page))
        }
    }
}

async fn run_exchange(
    api: &ApiState,
    query: CallbackQuery,
) -> Result<CallbackSuccess, CallbackFailure> {
    let Some(code) = query.code.as_deref().filter(|code| !code.is_empty()) else {
        if let Some(provider_error) = query.error.as_deref() {
            warn!(%provider_error, "slack redirected without a code");
            return Err(CallbackFailure::new(
                StatusCode::BAD_REQUEST,
                format!("Slack authorization was not granted: {provider_error}"),
            ));
        }
        warn!("callback request is missing the authorization code");
        return Err(CallbackFailure::new(
            StatusCode::BAD_REQUEST,
            "missing authorization code",
        ));
    };

    let Some(state) = query.state.as_deref().filter(|state| !state.is_empty()) else {
        warn!("callback request is missing the state parameter");
        return Err(CallbackFailure::new(StatusCode::BAD_REQUEST, "missing state parameter"));
    };

    // Signature, shape and expiry failures are indistinguishable here;
    // any of them can be a forged redirect.
    if !api.state_tokens.validate(state) {
        error!(
            issued_at = ?api.state_tokens.issued_at(state),
            expired = api.state_tokens.is_expired(state),
            "state validation failed — possible CSRF attempt against the callback"
        );
        return Err(CallbackFailure::new(
            StatusCode::BAD_REQUEST,
            "invalid or expired request",
        ));
    }

    let exchange = api.slack.exchange_code(code).await.map_err(|error| {
        warn!(%error, "slack code exchange failed");
        CallbackFailure::new(StatusCode::BAD_GATEWAY, "Slack token exchange failed")
            .with_state(state)
    })?;

    if !exchange.ok {
        let reason = exchange.error.as_deref().unwrap_or("unknown_error");
        warn!(%reason, "slack rejected the code exchange");
        let message = if WORKSPACE_NOT_PERMITTED_ERRORS.contains(&reason) {
            WORKSPACE_NOT_PERMITTED_MESSAGE.to_owned()
        } else {
            format!("Slack error: {reason}")
        };
        return Err(CallbackFailure::new(StatusCode::BAD_REQUEST, message).with_state(state));
    }

    let bot_token = exchange
        .access_token
        .as_deref()
        .filter(|token| !token.is_empty())
        .ok_or_else(|| {
            warn!("exchange response carried no bot access token");
            CallbackFailure::new(
                StatusCode::BAD_GATEWAY,
                "authorization response carried no bot access token",
            )
            .with_state(state)
        })?;

    let team_id = exchange
        .team
        .as_ref()
        .map(|team| team.id.clone())
        .ok_or_else(|| {
            warn!("exchange response carried no team");
            CallbackFailure::new(
                StatusCode::BAD_GATEWAY,
                "authorization response did not identify the workspace",
            )
            .with_state(state)
        })?;

    // Absent authed_user fields have distinct causes with distinct
    // remediations; surface the diagnosis, not a generic missing-field
    // error.
    let authed_user = extract_authed_user(&exchange).map_err(|reason| {
        warn!(%reason, "authorized user could not be extracted from the exchange");
        CallbackFailure::new(StatusCode::BAD_REQUEST, reason).with_state(state)
    })?;

    let profile = api.slack.user_info(&authed_user.id, bot_token).await.map_err(|error| {
        warn!(%error, user = %authed_user.id, "slack profile fetch failed");
        CallbackFailure::new(StatusCode::BAD_GATEWAY, "Slack user profile fetch failed")
            .with_state(state)
    })?;

    if !profile.ok {
        let reason = profile.error.as_deref().unwrap_or("unknown_error");
        warn!(%reason, user = %authed_user.id, "slack rejected the profile fetch");
        return Err(CallbackFailure::new(
            StatusCode::BAD_GATEWAY,
            format!("Slack error: {reason}"),
        )
        .with_state(state));
    }

    let slack_user = profile.user.as_ref().ok_or_else(|| {
        warn!(user = %authed_user.id, "profile response carried no user object");
        CallbackFailure::new(
            StatusCode::BAD_GATEWAY,
            "Slack profile response carried no user",
        )
        .with_state(state)
    })?;

    let identity = build_identity(slack_user, &team_id);

    let encrypted_token = api.cipher.encrypt(&authed_user.access_token).map_err(|error| {
        error!(%error, "user token encryption failed");
        CallbackFailure::new(StatusCode::INTERNAL_SERVER_ERROR, "internal server error")
            .with_state(state)
    })?;

    let outcome = api.store.upsert(&identity, &encrypted_token).await.map_err(|error| {
        error!(%error, uid = %identity.uid, "user record upsert failed");
        CallbackFailure::new(StatusCode::INTERNAL_SERVER_ERROR, "failed to persist user")
            .with_state(state)
    })?;

    info!(
        uid = %identity.uid,
        team = %identity.slack_team_id,
        is_new_user = outcome.is_new_user,
        "slack login completed"
    );

    Ok(CallbackSuccess { identity, state: state.to_owned() })
}

#[cfg(test)]
mod tests {
    use super::WORKSPACE_NOT_PERMITTED_ERRORS;

    #[test]
    fn workspace_error_list_covers_non_distributed_installs() {
        assert!(WORKSPACE_NOT_PERMITTED_ERRORS.contains(&"invalid_team_for_non_distributed_app"));
        assert!(WORKSPACE_NOT_PERMITTED_ERRORS.contains(&"team_not_authorized"));
        assert!(!WORKSPACE_NOT_PERMITTED_ERRORS.contains(&"invalid_code"));
    }
}
