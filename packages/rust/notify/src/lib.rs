//! Notification delivery.
//!
//! [`GraphNotifier`] sends mail through Microsoft Graph using the OAuth
//! client credentials flow. [`LogNotifier`] only logs the message and is the
//! default when no mail transport is configured.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use tokio::sync::Mutex;
use tracing::{debug, info, instrument};

use compliance_shared::{ComplianceError, Notifier, NotifyConfig, Result};

/// Refresh the access token this long before it expires.
const TOKEN_EXPIRY_MARGIN: Duration = Duration::from_secs(60);

// ---------------------------------------------------------------------------
// GraphNotifier
// ---------------------------------------------------------------------------

/// Azure AD application credentials.
#[derive(Clone)]
pub struct GraphCredentials {
    pub tenant_id: String,
    pub client_id: String,
    pub client_secret: String,
}

impl std::fmt::Debug for GraphCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GraphCredentials")
            .field("tenant_id", &self.tenant_id)
            .field("client_id", &self.client_id)
            .field("client_secret", &"<redacted>")
            .finish()
    }
}

impl GraphCredentials {
    /// Read credentials from the env vars named in `[notify]`.
    pub fn from_env(config: &NotifyConfig) -> Result<Self> {
        Ok(Self {
            tenant_id: env_value(&config.tenant_id_env)?,
            client_id: env_value(&config.client_id_env)?,
            client_secret: env_value(&config.client_secret_env)?,
        })
    }
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default = "default_expires_in")]
    expires_in: u64,
}

fn default_expires_in() -> u64 {
    3_600
}

struct CachedToken {
    value: String,
    expires_at: Instant,
}

/// Notifier sending mail from a shared mailbox via Microsoft Graph.
pub struct GraphNotifier {
    config: NotifyConfig,
    credentials: GraphCredentials,
    client: Client,
    token: Mutex<Option<CachedToken>>,
}

impl GraphNotifier {
    pub fn new(config: NotifyConfig, credentials: GraphCredentials) -> Result<Self> {
        if config.sender_email.trim().is_empty() {
            return Err(ComplianceError::config(
                "notify.sender_email must be set for the graph notifier",
            ));
        }

        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| {
                ComplianceError::Dependency(format!("failed to build HTTP client: {e}"))
            })?;

        Ok(Self {
            config,
            credentials,
            client,
            token: Mutex::new(None),
        })
    }

    /// Create a notifier with credentials from the environment.
    pub fn from_env(config: NotifyConfig) -> Result<Self> {
        let credentials = GraphCredentials::from_env(&config)?;
        Self::new(config, credentials)
    }

    /// Return a cached access token, acquiring a new one when needed.
    async fn access_token(&self) -> Result<String> {
        let mut cached = self.token.lock().await;
        if let Some(token) = cached.as_ref() {
            if Instant::now() < token.expires_at {
                return Ok(token.value.clone());
            }
        }

        let url = format!(
            "{}/{}/oauth2/v2.0/token",
            self.config.authority_url.trim_end_matches('/'),
            self.credentials.tenant_id
        );
        let scope = format!("{}/.default", self.config.graph_url.trim_end_matches('/'));

        let response = self
            .client
            .post(&url)
            .form(&[
                ("client_id", self.credentials.client_id.as_str()),
                ("client_secret", self.credentials.client_secret.as_str()),
                ("scope", scope.as_str()),
                ("grant_type", "client_credentials"),
            ])
            .send()
            .await
            .map_err(|e| ComplianceError::Transient(format!("token request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(status_error("token request", status, &body));
        }

        let token: TokenResponse = response
            .json()
            .await
            .map_err(|e| ComplianceError::Notification(format!("invalid token response: {e}")))?;

        debug!(expires_in = token.expires_in, "acquired Graph access token");
        let lifetime = Duration::from_secs(token.expires_in).saturating_sub(TOKEN_EXPIRY_MARGIN);
        *cached = Some(CachedToken {
            value: token.access_token.clone(),
            expires_at: Instant::now() + lifetime,
        });

        Ok(token.access_token)
    }
}

#[async_trait]
impl Notifier for GraphNotifier {
    #[instrument(skip_all, fields(contact = %contact))]
    async fn notify(&self, contact: &str, subject: &str, body: &str) -> Result<()> {
        let token = self.access_token().await?;

        let url = format!(
            "{}/v1.0/users/{}/sendMail",
            self.config.graph_url.trim_end_matches('/'),
            self.config.sender_email
        );
        let message = serde_json::json!({
            "message": {
                "subject": subject,
                "body": { "contentType": "HTML", "content": body },
                "toRecipients": [{ "emailAddress": { "address": contact } }]
            },
            "saveToSentItems": true
        });

        let response = self
            .client
            .post(&url)
            .bearer_auth(&token)
            .json(&message)
            .send()
            .await
            .map_err(|e| ComplianceError::Transient(format!("sendMail request failed: {e}")))?;

        let status = response.status();
        if status != StatusCode::ACCEPTED {
            let body = response.text().await.unwrap_or_default();
            if status == StatusCode::UNAUTHORIZED {
                // Token revoked or rotated; the next attempt fetches a fresh one.
                *self.token.lock().await = None;
            }
            return Err(status_error("sendMail", status, &body));
        }

        info!("notification email sent");
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// LogNotifier
// ---------------------------------------------------------------------------

/// Notifier that writes the message to the log instead of sending it.
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, contact: &str, subject: &str, body: &str) -> Result<()> {
        info!(%contact, %subject, body_len = body.len(), "notification (log only)");
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn status_error(what: &str, status: StatusCode, body: &str) -> ComplianceError {
    let detail: String = body.chars().take(200).collect();
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        ComplianceError::Transient(format!("{what}: HTTP {status}: {detail}"))
    } else {
        ComplianceError::Notification(format!("{what}: HTTP {status}: {detail}"))
    }
}

fn env_value(var_name: &str) -> Result<String> {
    std::env::var(var_name)
        .ok()
        .filter(|v| !v.is_empty())
        .ok_or_else(|| {
            ComplianceError::config(format!(
                "Graph credential not found. Set the {var_name} environment variable."
            ))
        })
}
