//! AGS client: token exchange, line items, scores, results.
//!
//! Every platform call obtains a fresh bearer token through the OAuth2
//! `client_credentials` grant, authenticating with a short-lived JWT client
//! assertion signed by the tool key. Tokens are requested with exactly the
//! scopes the call needs and are never cached.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use reqwest::header::{ACCEPT, CONTENT_TYPE, HeaderMap, LINK};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use url::Url;
use uuid::Uuid;

use super::log::{GradeSyncLog, GradeSyncLogEntry};
use super::model::{AgsResult, LineItem, Score, media, scope};
use crate::audit::{self, AuditEvent};
use crate::config::AgsConfig;
use crate::error::UpstreamError;
use crate::lti::{KeyManager, LaunchContext, Platform, PlatformRegistry};
use crate::{Error, Result};

const CLIENT_ASSERTION_TYPE: &str = "urn:ietf:params:oauth:client-assertion-type:jwt-bearer";
const MAX_ERROR_BODY: usize = 512;

/// Bearer token issued by the platform.
#[derive(Debug, Clone, Deserialize)]
pub struct AccessToken {
    /// Bearer value
    pub access_token: String,
    /// Normally `Bearer`
    #[serde(default)]
    pub token_type: Option<String>,
    /// Lifetime in seconds
    #[serde(default)]
    pub expires_in: Option<u64>,
    /// Granted scopes, space separated
    #[serde(default)]
    pub scope: Option<String>,
}

#[derive(Debug, Serialize)]
struct ClientAssertion<'a> {
    iss: &'a str,
    sub: &'a str,
    aud: &'a str,
    iat: i64,
    exp: i64,
    jti: String,
}

/// Where a course's line items live.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineItemContainer<'a> {
    /// Course context id, filled into the platform's registered template
    Context(&'a str),
    /// Container URL granted by a launch (`lineitems` of the AGS endpoint claim)
    Url(&'a str),
}

impl<'a> LineItemContainer<'a> {
    /// The container a launch granted, falling back to its course context.
    ///
    /// `None` when the launch carries neither.
    #[must_use]
    pub fn from_launch(context: &'a LaunchContext) -> Option<Self> {
        context
            .ags_endpoint
            .as_ref()
            .and_then(|ags| ags.lineitems.as_deref())
            .map(Self::Url)
            .or_else(|| context.context_id.as_deref().map(Self::Context))
    }

    /// Absolute container URL on `platform`.
    #[must_use]
    pub fn url_on(self, platform: &Platform) -> String {
        match self {
            Self::Context(context_id) => platform.line_items_url_for(context_id),
            Self::Url(url) => url.to_string(),
        }
    }
}

impl<'a> From<&'a str> for LineItemContainer<'a> {
    fn from(context_id: &'a str) -> Self {
        Self::Context(context_id)
    }
}

/// Client for the Assignment and Grade Services of every registered platform.
pub struct AgsClient {
    http: reqwest::Client,
    keys: Arc<KeyManager>,
    registry: Arc<PlatformRegistry>,
    log: Arc<dyn GradeSyncLog>,
    assertion_ttl: Duration,
}

impl AgsClient {
    /// Create a client.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if the HTTP client cannot be built.
    pub fn new(
        keys: Arc<KeyManager>,
        registry: Arc<PlatformRegistry>,
        log: Arc<dyn GradeSyncLog>,
        config: &AgsConfig,
        allow_insecure_http: bool,
    ) -> Result<Self> {
        let http = reqwest::Client::builder()
            .https_only(!allow_insecure_http)
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| Error::Config(format!("cannot build AGS client: {e}")))?;
        Ok(Self {
            http,
            keys,
            registry,
            log,
            assertion_ttl: config.assertion_ttl,
        })
    }

    /// Sync log shared with the grade sync layer.
    #[must_use]
    pub fn log(&self) -> &Arc<dyn GradeSyncLog> {
        &self.log
    }

    /// Exchange a signed client assertion for a bearer token with `scopes`.
    ///
    /// # Errors
    ///
    /// - [`Error::UnknownPlatform`] when `platform_id` is not registered.
    /// - [`Error::Upstream`] when the token endpoint fails or rejects the grant.
    pub async fn get_access_token(&self, platform_id: &str, scopes: &[&str]) -> Result<AccessToken> {
        let platform = self.registry.lookup(platform_id)?;
        self.access_token(platform, scopes).await
    }

    async fn access_token(&self, platform: &Platform, scopes: &[&str]) -> Result<AccessToken> {
        let iat = Utc::now().timestamp();
        let ttl = i64::try_from(self.assertion_ttl.as_secs()).unwrap_or(300);
        let assertion = self.keys.sign(&ClientAssertion {
            iss: &platform.client_id,
            sub: &platform.client_id,
            aud: &platform.token_url,
            iat,
            exp: iat + ttl,
            jti: Uuid::new_v4().to_string(),
        })?;
        let scope = scopes.join(" ");

        let params = [
            ("grant_type", "client_credentials"),
            ("client_assertion_type", CLIENT_ASSERTION_TYPE),
            ("client_assertion", assertion.as_str()),
            ("scope", scope.as_str()),
        ];

        debug!(platform = %platform.platform_id, scope = %scope, "Requesting AGS access token");
        let response = self
            .http
            .post(&platform.token_url)
            .form(&params)
            .send()
            .await
            .map_err(|e| UpstreamError::transport("token exchange", e))?;
        let response = check_status(response, "token exchange").await?;

        let token: AccessToken = decode_json(response, "token exchange").await?;
        Ok(token)
    }

    /// List the line items of a container, optionally filtered by resource link.
    ///
    /// Follows `Link: <...>; rel="next"` pagination to the end.
    ///
    /// # Errors
    ///
    /// - [`Error::UnknownPlatform`] when `platform_id` is not registered.
    /// - [`Error::Upstream`] on any HTTP failure.
    pub async fn get_line_items<'c>(
        &self,
        platform_id: &str,
        container: impl Into<LineItemContainer<'c>>,
        resource_link_id: Option<&str>,
    ) -> Result<Vec<LineItem>> {
        let platform = self.registry.lookup(platform_id)?;
        let mut url = parse_url(&container.into().url_on(platform))?;
        if let Some(rl) = resource_link_id {
            url.query_pairs_mut().append_pair("resource_link_id", rl);
        }
        self.list_line_items(platform, url).await
    }

    /// Find the line item published for `resource_id`, if the platform has one.
    ///
    /// # Errors
    ///
    /// Same as [`get_line_items`](Self::get_line_items).
    pub async fn find_line_item<'c>(
        &self,
        platform_id: &str,
        container: impl Into<LineItemContainer<'c>>,
        resource_id: &str,
    ) -> Result<Option<LineItem>> {
        let platform = self.registry.lookup(platform_id)?;
        let mut url = parse_url(&container.into().url_on(platform))?;
        url.query_pairs_mut().append_pair("resource_id", resource_id);
        let items = self.list_line_items(platform, url).await?;
        // Not every platform honors the filter.
        Ok(items
            .into_iter()
            .find(|li| li.resource_id.as_deref() == Some(resource_id)))
    }

    async fn list_line_items(&self, platform: &Platform, url: Url) -> Result<Vec<LineItem>> {
        let token = self.access_token(platform, &[scope::LINE_ITEM_READONLY]).await?;
        self.get_paginated(url, &token, media::LINE_ITEM_CONTAINER, "line item listing")
            .await
    }

    /// Create a line item in a course. Never retried.
    ///
    /// # Errors
    ///
    /// - [`Error::UnknownPlatform`] when `platform_id` is not registered.
    /// - [`Error::Upstream`] on any HTTP failure, or when the platform omits the new id.
    pub async fn create_line_item<'c>(
        &self,
        platform_id: &str,
        container: impl Into<LineItemContainer<'c>>,
        line_item: &LineItem,
    ) -> Result<LineItem> {
        let platform = self.registry.lookup(platform_id)?;
        let url = container.into().url_on(platform);
        let token = self.access_token(platform, &[scope::LINE_ITEM]).await?;

        let response = self
            .http
            .post(&url)
            .bearer_auth(&token.access_token)
            .header(CONTENT_TYPE, media::LINE_ITEM)
            .header(ACCEPT, media::LINE_ITEM)
            .body(serde_json::to_vec(line_item)?)
            .send()
            .await
            .map_err(|e| UpstreamError::transport("line item creation", e))?;
        let response = check_status(response, "line item creation").await?;
        let created: LineItem = decode_json(response, "line item creation").await?;

        if created.id.is_empty() {
            return Err(UpstreamError::Decode {
                operation: "line item creation",
                reason: "platform returned a line item without an id".to_string(),
            }
            .into());
        }
        debug!(platform = %platform_id, line_item = %created.id, "Created line item");
        Ok(created)
    }

    /// Publish a score to `line_item_url`. Every call is logged.
    ///
    /// # Errors
    ///
    /// - [`Error::UnknownPlatform`] when `platform_id` is not registered.
    /// - [`Error::Upstream`] on any HTTP failure.
    pub async fn submit_score(&self, platform_id: &str, line_item_url: &str, score: &Score) -> Result<()> {
        self.publish_score(platform_id, line_item_url, score, None, &score.user_id)
            .await
    }

    /// Publish a score and log the attempt under the internal ids.
    pub(crate) async fn publish_score(
        &self,
        platform_id: &str,
        line_item_url: &str,
        score: &Score,
        assignment_id: Option<&str>,
        student_id: &str,
    ) -> Result<()> {
        let outcome = self.post_score(platform_id, line_item_url, score).await;
        self.record(GradeSyncLogEntry::new(
            platform_id,
            assignment_id,
            student_id,
            (score.score_given, score.score_maximum),
            line_item_url,
            outcome.as_ref().map(|_| ()).map_err(ToString::to_string),
        ))
        .await;
        outcome
    }

    async fn post_score(&self, platform_id: &str, line_item_url: &str, score: &Score) -> Result<()> {
        let platform = self.registry.lookup(platform_id)?;
        let url = child_url(line_item_url, "scores")?;
        let token = self.access_token(platform, &[scope::SCORE]).await?;

        let response = self
            .http
            .post(url)
            .bearer_auth(&token.access_token)
            .header(CONTENT_TYPE, media::SCORE)
            .body(serde_json::to_vec(score)?)
            .send()
            .await
            .map_err(|e| UpstreamError::transport("score submission", e))?;
        check_status(response, "score submission").await?;
        Ok(())
    }

    /// Read the results of a line item, optionally for one user.
    ///
    /// # Errors
    ///
    /// - [`Error::UnknownPlatform`] when `platform_id` is not registered.
    /// - [`Error::Upstream`] on any HTTP failure.
    pub async fn get_results(
        &self,
        platform_id: &str,
        line_item_url: &str,
        user_id: Option<&str>,
    ) -> Result<Vec<AgsResult>> {
        let platform = self.registry.lookup(platform_id)?;
        let mut url = child_url(line_item_url, "results")?;
        if let Some(user) = user_id {
            url.query_pairs_mut().append_pair("user_id", user);
        }
        let token = self.access_token(platform, &[scope::RESULT_READONLY]).await?;
        self.get_paginated(url, &token, media::RESULT_CONTAINER, "result listing")
            .await
    }

    /// Append a sync attempt to the log and the audit trail.
    pub(crate) async fn record(&self, entry: GradeSyncLogEntry) {
        audit::emit(&AuditEvent::grade(&entry));
        if !entry.status.is_success() {
            warn!(
                platform = %entry.platform_id,
                student = %entry.student_id,
                error = entry.error_message.as_deref().unwrap_or(""),
                "Grade sync failed"
            );
        }
        self.log.append(entry).await;
    }

    async fn get_paginated<T: serde::de::DeserializeOwned>(
        &self,
        first: Url,
        token: &AccessToken,
        accept: &'static str,
        operation: &'static str,
    ) -> Result<Vec<T>> {
        let mut items = Vec::new();
        let mut next = Some(first);
        while let Some(url) = next.take() {
            let response = self
                .http
                .get(url)
                .bearer_auth(&token.access_token)
                .header(ACCEPT, accept)
                .send()
                .await
                .map_err(|e| UpstreamError::transport(operation, e))?;
            let response = check_status(response, operation).await?;
            next = next_page(response.headers()).map(|u| parse_url(&u)).transpose()?;
            let page: Vec<T> = decode_json(response, operation).await?;
            items.extend(page);
        }
        Ok(items)
    }
}

async fn check_status(
    response: reqwest::Response,
    operation: &'static str,
) -> std::result::Result<reqwest::Response, UpstreamError> {
    if response.status().is_success() {
        return Ok(response);
    }
    let status = response.status().as_u16();
    let mut body = response.text().await.unwrap_or_default();
    if body.len() > MAX_ERROR_BODY {
        let mut cut = MAX_ERROR_BODY;
        while !body.is_char_boundary(cut) {
            cut -= 1;
        }
        body.truncate(cut);
    }
    Err(UpstreamError::Status {
        operation,
        status,
        body,
    })
}

async fn decode_json<T: serde::de::DeserializeOwned>(
    response: reqwest::Response,
    operation: &'static str,
) -> std::result::Result<T, UpstreamError> {
    let bytes = response
        .bytes()
        .await
        .map_err(|e| UpstreamError::transport(operation, e))?;
    serde_json::from_slice(&bytes).map_err(|e| UpstreamError::Decode {
        operation,
        reason: e.to_string(),
    })
}

fn parse_url(raw: &str) -> Result<Url> {
    Url::parse(raw).map_err(|e| Error::InvalidRequest(format!("invalid URL {raw}: {e}")))
}

/// `{line_item}/{segment}`, keeping any query string on the line item URL.
fn child_url(line_item_url: &str, segment: &str) -> Result<Url> {
    let mut url = parse_url(line_item_url)?;
    let path = format!("{}/{segment}", url.path().trim_end_matches('/'));
    url.set_path(&path);
    Ok(url)
}

/// Extract the `rel="next"` target from `Link` headers.
fn next_page(headers: &HeaderMap) -> Option<String> {
    headers
        .get_all(LINK)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .find_map(|link| {
            let mut parts = link.split(';');
            let target = parts.next()?.trim();
            let is_next = parts.any(|p| {
                let p = p.trim();
                p == r#"rel="next""# || p == "rel=next"
            });
            is_next.then(|| target.trim_start_matches('<').trim_end_matches('>').to_string())
        })
}
