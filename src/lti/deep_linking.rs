//! Deep Linking: instructor content selection.
//!
//! A `LtiDeepLinkingRequest` launch is answered with a catalog of content
//! items. Once the instructor picks some, the selection is wrapped in a signed
//! `LtiDeepLinkingResponse` JWT and auto-posted back to the platform's
//! `deep_link_return_url`.
//!
//! The response is only ever built for a stored deep-linking launch: the
//! platform, deployment, return URL and `data` all come from the verified
//! launch, never from the instructor's form.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::debug;

use super::claims::{LTI_VERSION, LaunchContext, MessageType, uri};
use super::keys::KeyManager;
use super::nonce::random_token;
use super::platform::PlatformRegistry;
use super::session::StoredLaunch;
use crate::audit::{self, AuditEvent};
use crate::error::TokenValidationError;
use crate::{Error, Result};

/// Line item the platform should create alongside a resource link.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LineItemTemplate {
    /// Maximum score
    pub score_maximum: f64,
    /// Gradebook column label
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    /// Tool resource id
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_id: Option<String>,
    /// Free-form tag
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tag: Option<String>,
}

/// A selectable content item, in its Deep Linking wire shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ContentItem {
    /// Launchable tool resource
    #[serde(rename = "ltiResourceLink", rename_all = "camelCase")]
    LtiResourceLink {
        /// Display title
        title: String,
        /// Launch URL override
        #[serde(default, skip_serializing_if = "Option::is_none")]
        url: Option<String>,
        /// Description
        #[serde(default, skip_serializing_if = "Option::is_none")]
        text: Option<String>,
        /// Custom parameters passed back on launch
        #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
        custom: BTreeMap<String, String>,
        /// Gradebook column to create
        #[serde(default, skip_serializing_if = "Option::is_none")]
        line_item: Option<LineItemTemplate>,
    },
    /// Plain hyperlink
    #[serde(rename = "link")]
    Link {
        /// Target URL
        url: String,
        /// Display title
        #[serde(default, skip_serializing_if = "Option::is_none")]
        title: Option<String>,
        /// Description
        #[serde(default, skip_serializing_if = "Option::is_none")]
        text: Option<String>,
    },
    /// Downloadable file
    #[serde(rename = "file")]
    File {
        /// Download URL
        url: String,
        /// Display title
        #[serde(default, skip_serializing_if = "Option::is_none")]
        title: Option<String>,
        /// Description
        #[serde(default, skip_serializing_if = "Option::is_none")]
        text: Option<String>,
    },
    /// HTML fragment embedded by the platform
    #[serde(rename = "html")]
    Html {
        /// Markup
        html: String,
        /// Display title
        #[serde(default, skip_serializing_if = "Option::is_none")]
        title: Option<String>,
        /// Description
        #[serde(default, skip_serializing_if = "Option::is_none")]
        text: Option<String>,
    },
}

impl ContentItem {
    /// Wire value of the `type` field.
    #[must_use]
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::LtiResourceLink { .. } => "ltiResourceLink",
            Self::Link { .. } => "link",
            Self::File { .. } => "file",
            Self::Html { .. } => "html",
        }
    }

    /// Display title, when the item has one.
    #[must_use]
    pub fn title(&self) -> Option<&str> {
        match self {
            Self::LtiResourceLink { title, .. } => Some(title),
            Self::Link { title, .. } | Self::File { title, .. } | Self::Html { title, .. } => {
                title.as_deref()
            }
        }
    }
}

/// The `deep_linking_settings` claim.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeepLinkingSettings {
    /// Where the response must be posted
    pub deep_link_return_url: String,
    /// Content item types the platform accepts
    #[serde(default)]
    pub accept_types: Vec<String>,
    /// Presentation targets the platform accepts
    #[serde(default)]
    pub accept_presentation_document_targets: Vec<String>,
    /// Accepted media types for `file` items
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub accept_media_types: Option<String>,
    /// Whether more than one item may be returned
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub accept_multiple: Option<bool>,
    /// Whether the platform creates items without further confirmation
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auto_create: Option<bool>,
    /// Default title
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    /// Default text
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    /// Opaque value that must be echoed back
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<String>,
}

impl DeepLinkingSettings {
    /// `true` when the platform accepts this item's type. An empty
    /// `accept_types` list accepts everything.
    #[must_use]
    pub fn accepts(&self, item: &ContentItem) -> bool {
        self.accept_types.is_empty() || self.accept_types.iter().any(|t| t == item.type_name())
    }
}

/// Source of selectable content.
#[async_trait::async_trait]
pub trait ContentCatalog: Send + Sync + 'static {
    /// Items offered for `context_id` (or globally, when absent).
    async fn items(&self, context_id: Option<&str>) -> Result<Vec<ContentItem>>;
}

/// Catalog backed by a fixed list, typically from configuration.
#[derive(Debug, Clone, Default)]
pub struct StaticCatalog {
    items: Vec<ContentItem>,
}

impl StaticCatalog {
    /// Create a catalog over `items`.
    #[must_use]
    pub fn new(items: Vec<ContentItem>) -> Self {
        Self { items }
    }
}

#[async_trait::async_trait]
impl ContentCatalog for StaticCatalog {
    async fn items(&self, _context_id: Option<&str>) -> Result<Vec<ContentItem>> {
        Ok(self.items.clone())
    }
}

/// A signed Deep Linking response ready to post back.
#[derive(Debug, Clone)]
pub struct DeepLinkingResponse {
    /// Signed `LtiDeepLinkingResponse` JWT
    pub jwt: String,
    /// Platform `deep_link_return_url`
    pub return_url: String,
}

impl DeepLinkingResponse {
    /// HTML page that auto-posts the JWT to the return URL.
    #[must_use]
    pub fn auto_submit_form(&self) -> String {
        format!(
            r#"<!DOCTYPE html>
<html>
<head><meta charset="utf-8"><title>Returning to platform</title></head>
<body onload="document.forms[0].submit()">
<form method="post" action="{action}">
<input type="hidden" name="JWT" value="{jwt}">
<noscript><button type="submit">Continue</button></noscript>
</form>
</body>
</html>
"#,
            action = html_escape(&self.return_url),
            jwt = html_escape(&self.jwt),
        )
    }
}

fn html_escape(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#x27;"),
            c => out.push(c),
        }
    }
    out
}

/// Drives a deep-linking launch from settings to signed response.
pub struct DeepLinkingCoordinator {
    keys: Arc<KeyManager>,
    registry: Arc<PlatformRegistry>,
    catalog: Arc<dyn ContentCatalog>,
    response_ttl: Duration,
}

impl DeepLinkingCoordinator {
    /// Create a coordinator.
    #[must_use]
    pub fn new(
        keys: Arc<KeyManager>,
        registry: Arc<PlatformRegistry>,
        catalog: Arc<dyn ContentCatalog>,
        response_ttl: Duration,
    ) -> Self {
        Self {
            keys,
            registry,
            catalog,
            response_ttl,
        }
    }

    /// Extract the Deep Linking settings from a validated launch.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidRequest`] when the launch is not a deep-linking request.
    /// - [`Error::TokenValidation`] when the settings claim is absent or malformed.
    pub fn parse_request(&self, context: &LaunchContext) -> Result<DeepLinkingSettings> {
        if context.message_type != MessageType::DeepLinkingRequest {
            return Err(Error::InvalidRequest(format!(
                "expected LtiDeepLinkingRequest, got {}",
                context.message_type
            )));
        }
        let raw = context
            .deep_linking_settings
            .clone()
            .ok_or(TokenValidationError::MissingClaim("deep_linking_settings"))?;
        serde_json::from_value(raw).map_err(|e| {
            TokenValidationError::InvalidClaim {
                claim: "deep_linking_settings",
                reason: e.to_string(),
            }
            .into()
        })
    }

    /// Content offered for `context_id`.
    ///
    /// # Errors
    ///
    /// Propagates catalog provider failures.
    pub async fn catalog(&self, context_id: Option<&str>) -> Result<Vec<ContentItem>> {
        self.catalog.items(context_id).await
    }

    /// Pick items from `catalog` by index, in the order given.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ContentSelection`] for an empty selection, an index
    /// past the end of the catalog, or a repeated index.
    pub fn select(catalog: &[ContentItem], indices: &[usize]) -> Result<Vec<ContentItem>> {
        if indices.is_empty() {
            return Err(Error::ContentSelection("no content selected".to_string()));
        }
        let mut seen = BTreeSet::new();
        indices
            .iter()
            .map(|&i| {
                if !seen.insert(i) {
                    return Err(Error::ContentSelection(format!("index {i} selected twice")));
                }
                catalog.get(i).cloned().ok_or_else(|| {
                    Error::ContentSelection(format!(
                        "index {i} out of range for catalog of {}",
                        catalog.len()
                    ))
                })
            })
            .collect()
    }

    /// Reject a selection the platform's settings do not allow: an item
    /// type outside `accept_types`, or several items when
    /// `accept_multiple` is `false`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ContentSelection`] naming the first violation.
    pub fn check_acceptable(settings: &DeepLinkingSettings, items: &[ContentItem]) -> Result<()> {
        if settings.accept_multiple == Some(false) && items.len() > 1 {
            return Err(Error::ContentSelection(format!(
                "platform accepts a single item, {} selected",
                items.len()
            )));
        }
        match items.iter().find(|item| !settings.accepts(item)) {
            Some(item) => Err(Error::ContentSelection(format!(
                "platform does not accept {} items",
                item.type_name()
            ))),
            None => Ok(()),
        }
    }

    /// Answer a stored deep-linking launch with the items at `indices`.
    ///
    /// # Errors
    ///
    /// - [`Error::NotFound`] when the launch has expired.
    /// - [`Error::InvalidRequest`] when the launch is not a deep-linking request.
    /// - [`Error::ContentSelection`] when the selection is empty, out of range
    ///   or not accepted by the platform.
    /// - Anything [`build_response`](Self::build_response) returns.
    pub async fn respond(&self, launch: &StoredLaunch, indices: &[usize]) -> Result<DeepLinkingResponse> {
        if launch.is_expired() {
            return Err(Error::NotFound(format!("launch {} has expired", launch.launch_id)));
        }
        if launch.message_type != MessageType::DeepLinkingRequest {
            return Err(Error::InvalidRequest(format!(
                "launch {} is a {}, not a deep-linking request",
                launch.launch_id, launch.message_type
            )));
        }
        let context = LaunchContext::from_claims(&launch.raw_launch_data)?;
        let settings = self.parse_request(&context)?;

        let catalog = self.catalog(launch.context_id.as_deref()).await?;
        let selected = Self::select(&catalog, indices)?;
        Self::check_acceptable(&settings, &selected)?;

        self.build_response(
            &launch.platform_id,
            &launch.deployment_id,
            &selected,
            &settings.deep_link_return_url,
            settings.data.as_deref(),
        )
    }

    /// Build and sign the `LtiDeepLinkingResponse` for `platform_id`.
    ///
    /// # Errors
    ///
    /// - [`Error::UnknownPlatform`] when `platform_id` is not registered.
    /// - [`Error::InvalidRequest`] when `deployment_id` is not the registered deployment.
    /// - [`Error::Internal`] when signing fails.
    pub fn build_response(
        &self,
        platform_id: &str,
        deployment_id: &str,
        items: &[ContentItem],
        return_url: &str,
        data: Option<&str>,
    ) -> Result<DeepLinkingResponse> {
        let platform = self.registry.lookup(platform_id)?;
        if !platform.deployment_id.is_empty() && deployment_id != platform.deployment_id {
            return Err(Error::InvalidRequest(format!(
                "deployment {deployment_id} is not registered for {platform_id}"
            )));
        }
        let iat = Utc::now().timestamp();
        let ttl = i64::try_from(self.response_ttl.as_secs()).unwrap_or(300);

        let mut claims = json!({
            "iss": platform.client_id,
            "aud": platform.platform_id,
            "iat": iat,
            "exp": iat + ttl,
            "nonce": random_token(),
            (uri::MESSAGE_TYPE): "LtiDeepLinkingResponse",
            (uri::VERSION): LTI_VERSION,
            (uri::DEPLOYMENT_ID): deployment_id,
            (uri::CONTENT_ITEMS): items,
        });
        if let (Some(data), Value::Object(map)) = (data, &mut claims) {
            map.insert(uri::DL_DATA.to_string(), Value::String(data.to_string()));
        }

        let jwt = self.keys.sign(&claims)?;
        debug!(platform = %platform_id, items = items.len(), "Signed deep linking response");
        audit::emit(&AuditEvent::deep_link_responded(platform_id, deployment_id, items.len()));

        Ok(DeepLinkingResponse {
            jwt,
            return_url: return_url.to_string(),
        })
    }
}
