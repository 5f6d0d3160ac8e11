//! LTI claim mapping: verified `id_token` claims to a typed [`LaunchContext`].
//!
//! All knowledge of the IMS claim URIs lives here. A missing or malformed
//! claim fails at [`LaunchContext::from_claims`], never later.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::TokenValidationError;

/// LTI version this tool speaks.
pub const LTI_VERSION: &str = "1.3.0";

/// Claim URI constants.
pub mod uri {
    /// `message_type` claim
    pub const MESSAGE_TYPE: &str = "https://purl.imsglobal.org/spec/lti/claim/message_type";
    /// `version` claim
    pub const VERSION: &str = "https://purl.imsglobal.org/spec/lti/claim/version";
    /// `deployment_id` claim
    pub const DEPLOYMENT_ID: &str = "https://purl.imsglobal.org/spec/lti/claim/deployment_id";
    /// `target_link_uri` claim
    pub const TARGET_LINK_URI: &str = "https://purl.imsglobal.org/spec/lti/claim/target_link_uri";
    /// `resource_link` claim
    pub const RESOURCE_LINK: &str = "https://purl.imsglobal.org/spec/lti/claim/resource_link";
    /// `context` claim
    pub const CONTEXT: &str = "https://purl.imsglobal.org/spec/lti/claim/context";
    /// `roles` claim
    pub const ROLES: &str = "https://purl.imsglobal.org/spec/lti/claim/roles";
    /// `custom` claim
    pub const CUSTOM: &str = "https://purl.imsglobal.org/spec/lti/claim/custom";
    /// `launch_presentation` claim
    pub const LAUNCH_PRESENTATION: &str =
        "https://purl.imsglobal.org/spec/lti/claim/launch_presentation";
    /// Deep Linking request settings
    pub const DEEP_LINKING_SETTINGS: &str =
        "https://purl.imsglobal.org/spec/lti-dl/claim/deep_linking_settings";
    /// Deep Linking response content items
    pub const CONTENT_ITEMS: &str = "https://purl.imsglobal.org/spec/lti-dl/claim/content_items";
    /// Deep Linking opaque data echo
    pub const DL_DATA: &str = "https://purl.imsglobal.org/spec/lti-dl/claim/data";
    /// AGS service endpoint
    pub const AGS_ENDPOINT: &str = "https://purl.imsglobal.org/spec/lti-ags/claim/endpoint";
}

/// Kind of LTI launch message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageType {
    /// Regular resource launch
    #[serde(rename = "LtiResourceLinkRequest")]
    ResourceLinkRequest,
    /// Instructor content selection
    #[serde(rename = "LtiDeepLinkingRequest")]
    DeepLinkingRequest,
}

impl MessageType {
    /// Wire value of the `message_type` claim.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ResourceLinkRequest => "LtiResourceLinkRequest",
            Self::DeepLinkingRequest => "LtiDeepLinkingRequest",
        }
    }

    /// Parse a `message_type` claim value.
    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "LtiResourceLinkRequest" => Some(Self::ResourceLinkRequest),
            "LtiDeepLinkingRequest" => Some(Self::DeepLinkingRequest),
            _ => None,
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Launching user as asserted by the platform.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LaunchUser {
    /// Platform-scoped user id (`sub`)
    pub sub: String,
    /// Display name
    pub name: Option<String>,
    /// Email address
    pub email: Option<String>,
}

/// `launch_presentation` claim.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LaunchPresentation {
    /// `iframe`, `window` or `embed`
    #[serde(default)]
    pub document_target: Option<String>,
    /// Where to send the user when done
    #[serde(default)]
    pub return_url: Option<String>,
    /// BCP 47 locale
    #[serde(default)]
    pub locale: Option<String>,
    /// Frame width
    #[serde(default)]
    pub width: Option<u32>,
    /// Frame height
    #[serde(default)]
    pub height: Option<u32>,
}

/// AGS endpoint claim, present when the platform grants grade services.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgsEndpoint {
    /// Scopes the tool may request
    #[serde(default)]
    pub scope: Vec<String>,
    /// Line-item container URL for the context
    #[serde(default)]
    pub lineitems: Option<String>,
    /// Line item bound to this resource link
    #[serde(default)]
    pub lineitem: Option<String>,
}

/// Typed, immutable result of one successful launch validation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LaunchContext {
    /// Message kind
    pub message_type: MessageType,
    /// LTI version (always `1.3.0`)
    pub version: String,
    /// Issuer that signed the launch
    pub issuer: String,
    /// Deployment the launch came through
    pub deployment_id: String,
    /// Launch target
    pub target_link_uri: Option<String>,
    /// Resource link id (required for resource-link launches)
    pub resource_link_id: Option<String>,
    /// Resource link title
    pub resource_link_title: Option<String>,
    /// Course context id
    pub context_id: Option<String>,
    /// Course context title
    pub context_title: Option<String>,
    /// Launching user
    pub user: LaunchUser,
    /// Role URIs
    pub roles: BTreeSet<String>,
    /// Custom parameters, stringified
    pub custom_params: BTreeMap<String, String>,
    /// Presentation hints
    pub launch_presentation: Option<LaunchPresentation>,
    /// Raw Deep Linking settings (deep-linking launches only)
    pub deep_linking_settings: Option<Value>,
    /// AGS endpoint, when granted
    pub ags_endpoint: Option<AgsEndpoint>,
}

#[derive(Debug, Deserialize)]
struct ResourceLinkClaim {
    id: String,
    #[serde(default)]
    title: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ContextClaim {
    id: String,
    #[serde(default)]
    title: Option<String>,
}

impl LaunchContext {
    /// Map a verified claim set into a context.
    ///
    /// # Errors
    ///
    /// Returns [`TokenValidationError::MissingClaim`] or
    /// [`TokenValidationError::InvalidClaim`] at the first claim that cannot be mapped.
    pub fn from_claims(claims: &Map<String, Value>) -> Result<Self, TokenValidationError> {
        let message_type = required_str(claims, uri::MESSAGE_TYPE, "message_type")?;
        let message_type =
            MessageType::parse(message_type).ok_or_else(|| TokenValidationError::InvalidClaim {
                claim: "message_type",
                reason: format!("unsupported message type {message_type}"),
            })?;

        let version = required_str(claims, uri::VERSION, "version")?;
        if version != LTI_VERSION {
            return Err(TokenValidationError::InvalidClaim {
                claim: "version",
                reason: format!("expected {LTI_VERSION}, got {version}"),
            });
        }

        let issuer = required_str(claims, "iss", "iss")?.to_string();
        let deployment_id = required_str(claims, uri::DEPLOYMENT_ID, "deployment_id")?.to_string();
        let sub = required_str(claims, "sub", "sub")?.to_string();

        let resource_link: Option<ResourceLinkClaim> =
            optional(claims, uri::RESOURCE_LINK, "resource_link")?;
        if message_type == MessageType::ResourceLinkRequest && resource_link.is_none() {
            return Err(TokenValidationError::MissingClaim("resource_link"));
        }
        let context: Option<ContextClaim> = optional(claims, uri::CONTEXT, "context")?;

        let roles: Vec<String> = optional(claims, uri::ROLES, "roles")?.unwrap_or_default();
        let custom: Map<String, Value> = optional(claims, uri::CUSTOM, "custom")?.unwrap_or_default();
        let custom_params = custom
            .into_iter()
            .map(|(k, v)| match v {
                Value::String(s) => (k, s),
                other => (k, other.to_string()),
            })
            .collect();

        let deep_linking_settings = claims.get(uri::DEEP_LINKING_SETTINGS).cloned();
        if message_type == MessageType::DeepLinkingRequest && deep_linking_settings.is_none() {
            return Err(TokenValidationError::MissingClaim("deep_linking_settings"));
        }

        Ok(Self {
            message_type,
            version: version.to_string(),
            issuer,
            deployment_id,
            target_link_uri: claims
                .get(uri::TARGET_LINK_URI)
                .and_then(Value::as_str)
                .map(str::to_string),
            resource_link_id: resource_link.as_ref().map(|r| r.id.clone()),
            resource_link_title: resource_link.and_then(|r| r.title),
            context_id: context.as_ref().map(|c| c.id.clone()),
            context_title: context.and_then(|c| c.title),
            user: LaunchUser {
                sub,
                name: claims.get("name").and_then(Value::as_str).map(str::to_string),
                email: claims.get("email").and_then(Value::as_str).map(str::to_string),
            },
            roles: roles.into_iter().collect(),
            custom_params,
            launch_presentation: optional(claims, uri::LAUNCH_PRESENTATION, "launch_presentation")?,
            deep_linking_settings,
            ags_endpoint: optional(claims, uri::AGS_ENDPOINT, "ags_endpoint")?,
        })
    }

    /// `true` when the user holds an instructor or administrator role.
    #[must_use]
    pub fn is_instructor(&self) -> bool {
        self.roles.iter().any(|r| {
            r.ends_with("membership#Instructor")
                || r.ends_with("membership#ContentDeveloper")
                || r.ends_with("institution/person#Administrator")
        })
    }
}

fn required_str<'a>(
    claims: &'a Map<String, Value>,
    key: &str,
    name: &'static str,
) -> Result<&'a str, TokenValidationError> {
    match claims.get(key) {
        Some(Value::String(s)) if !s.is_empty() => Ok(s),
        Some(_) => Err(TokenValidationError::InvalidClaim {
            claim: name,
            reason: "expected a non-empty string".to_string(),
        }),
        None => Err(TokenValidationError::MissingClaim(name)),
    }
}

fn optional<T: serde::de::DeserializeOwned>(
    claims: &Map<String, Value>,
    key: &str,
    name: &'static str,
) -> Result<Option<T>, TokenValidationError> {
    match claims.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(value) => serde_json::from_value(value.clone())
            .map(Some)
            .map_err(|e| TokenValidationError::InvalidClaim {
                claim: name,
                reason: e.to_string(),
            }),
    }
}
