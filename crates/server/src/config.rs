// Server configuration.
//
// Centralizes environment variable parsing. Slack client credentials and
// the token encryption key have no development defaults: a process without
// them cannot complete a single login, so startup fails instead of every
// callback failing later.

use std::net::SocketAddr;

use anyhow::{bail, Result};
use url::Url;

const DEFAULT_SLACK_API_BASE: &str = "https://slack.com/api";
const DEFAULT_SLACK_SCOPE: &str = "users:read,users:read.email,users.profile:read";

/// Origins the relay pages are allowed to postMessage to when
/// `KAGIBAN_ALLOWED_ORIGINS` is unset.
const DEFAULT_ALLOWED_ORIGINS: &[&str] = &[
    "http://localhost:3001",
    "http://localhost:5173",
    "http://localhost:5174",
    "http://127.0.0.1:5173",
];

/// Core server configuration.
///
/// Constructed via [`AppConfig::from_env`], which reads environment
/// variables once at startup.
#[derive(Debug, Clone)]
pub struct AppConfig {
    /// Listen address (host:port).
    pub listen_addr: SocketAddr,
    /// Base URL at which this server is reachable (used for the OAuth
    /// redirect URI and the relay fallback path).
    pub public_base_url: String,
    /// Slack OAuth client id.
    pub slack_client_id: String,
    /// Slack OAuth client secret.
    pub slack_client_secret: String,
    /// Slack OAuth scopes requested for the user token.
    pub slack_scope: String,
    /// Base URL of the Slack Web API (overridable for tests).
    pub slack_api_base: String,
    /// Incoming webhook URL for attendance notifications.
    pub slack_webhook_url: Option<String>,
    /// Channel for messages posted as the user.
    pub slack_channel_id: Option<String>,
    /// Hex-encoded 256-bit key for token encryption at rest.
    pub encryption_key: String,
    /// Secret for signing OAuth state tokens. Falls back to the
    /// encryption key when unset.
    pub state_secret: String,
    /// PostgreSQL connection string.
    pub database_url: Option<String>,
    /// Comma-separated CORS origins for the state-issuance endpoint.
    pub cors_origins: Option<String>,
    /// Origins the popup result page will attempt to postMessage to.
    pub allowed_origins: Vec<String>,
    /// Log filter directive (e.g. `info`, `kagiban_server=debug`).
    pub log_filter: String,
}

impl AppConfig {
    /// Parse configuration from environment variables.
    ///
    /// | Variable | Default |
    /// |---|---|
    /// | `KAGIBAN_HOST` | `0.0.0.0` |
    /// | `KAGIBAN_PORT` | `8080` |
    /// | `KAGIBAN_PUBLIC_BASE_URL` | `http://localhost:8080` |
    /// | `KAGIBAN_SLACK_CLIENT_ID` | *(required)* |
    /// | `KAGIBAN_SLACK_CLIENT_SECRET` | *(required)* |
    /// | `KAGIBAN_SLACK_SCOPE` | users:read,users:read.email,users.profile:read |
    /// | `KAGIBAN_SLACK_API_BASE` | `https://slack.com/api` |
    /// | `KAGIBAN_SLACK_WEBHOOK_URL` | *(none — notifications skipped)* |
    /// | `KAGIBAN_SLACK_CHANNEL_ID` | *(none)* |
    /// | `KAGIBAN_ENCRYPTION_KEY` | *(required, 64 hex chars)* |
    /// | `KAGIBAN_STATE_SECRET` | falls back to the encryption key |
    /// | `KAGIBAN_DATABASE_URL` | *(none — in-memory store)* |
    /// | `KAGIBAN_CORS_ORIGINS` | *(none — cors.rs uses dev defaults)* |
    /// | `KAGIBAN_ALLOWED_ORIGINS` | localhost dev origins |
    /// | `KAGIBAN_LOG_FILTER` | `info` |
    pub fn from_env() -> Result<Self> {
        Self::from_env_fn(|key| std::env::var(key))
    }

    /// Testable constructor that accepts an environment lookup function.
    pub(crate) fn from_env_fn<F>(env: F) -> Result<Self>
    where
        F: Fn(&str) -> Result<String, std::env::VarError>,
    {
        let host = env("KAGIBAN_HOST").unwrap_or_else(|_| "0.0.0.0".into());
        let port: u16 = env("KAGIBAN_PORT")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(8080);
        let listen_addr = format!("{host}:{port}")
            .parse()
            .unwrap_or_else(|_| SocketAddr::from(([0, 0, 0, 0], port)));

        let public_base_url = env("KAGIBAN_PUBLIC_BASE_URL")
            .unwrap_or_else(|_| "http://localhost:8080".into())
            .trim_end_matches('/')
            .to_string();

        let slack_client_id = require(&env, "KAGIBAN_SLACK_CLIENT_ID")?;
        let slack_client_secret = require(&env, "KAGIBAN_SLACK_CLIENT_SECRET")?;
        let encryption_key = require(&env, "KAGIBAN_ENCRYPTION_KEY")?;

        let state_secret = env("KAGIBAN_STATE_SECRET")
            .ok()
            .filter(|value| !value.trim().is_empty())
            .unwrap_or_else(|| encryption_key.clone());

        let slack_scope =
            env("KAGIBAN_SLACK_SCOPE").unwrap_or_else(|_| DEFAULT_SLACK_SCOPE.into());
        let slack_api_base = env("KAGIBAN_SLACK_API_BASE")
            .unwrap_or_else(|_| DEFAULT_SLACK_API_BASE.into())
            .trim_end_matches('/')
            .to_string();

        let slack_webhook_url = env("KAGIBAN_SLACK_WEBHOOK_URL")
            .ok()
            .filter(|value| !value.trim().is_empty());
        let slack_channel_id = env("KAGIBAN_SLACK_CHANNEL_ID")
            .ok()
            .filter(|value| !value.trim().is_empty());

        let database_url = env("KAGIBAN_DATABASE_URL").ok();
        let cors_origins = env("KAGIBAN_CORS_ORIGINS").ok();

        let allowed_origins = env("KAGIBAN_ALLOWED_ORIGINS")
            .map(|raw| {
                raw.split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(ToOwned::to_owned)
                    .collect::<Vec<_>>()
            })
            .ok()
            .filter(|origins| !origins.is_empty())
            .unwrap_or_else(|| {
                DEFAULT_ALLOWED_ORIGINS.iter().map(|s| (*s).to_string()).collect()
            });

        let log_filter = env("KAGIBAN_LOG_FILTER").unwrap_or_else(|_| "info".into());

        Ok(Self {
            listen_addr,
            public_base_url,
            slack_client_id,
            slack_client_secret,
            slack_scope,
            slack_api_base,
            slack_webhook_url,
            slack_channel_id,
            encryption_key,
            state_secret,
            database_url,
            cors_origins,
            allowed_origins,
            log_filter,
        })
    }

    /// The OAuth redirect URI registered with Slack.
    pub fn redirect_uri(&self) -> String {
        format!("{}/auth/slack/callback", self.public_base_url)
    }

    /// The Slack authorization URL without the `state` parameter; the
    /// opener page appends the freshly issued state before navigating.
    pub fn authorize_url(&self) -> Result<String> {
        let mut url = Url::parse("https://slack.com/oauth/v2/authorize")?;
        {
            let mut pairs = url.query_pairs_mut();
            pairs.append_pair("client_id", &self.slack_client_id);
            pairs.append_pair("scope", &self.slack_scope);
            pairs.append_pair("redirect_uri", &self.redirect_uri());
            pairs.append_pair("response_type", "code");
        }
        Ok(url.to_string())
    }
}

fn require<F>(env: &F, key: &str) -> Result<String>
where
    F: Fn(&str) -> Result<String, std::env::VarError>,
{
    match env(key) {
        Ok(value) if !value.trim().is_empty() => Ok(value),
        _ => bail!("required environment variable {key} is not set"),
    }
}
