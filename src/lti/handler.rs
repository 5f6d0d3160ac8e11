//! HTTP handlers for the LTI endpoints.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `GET` | `/lti/jwks` | Tool public key set |
//! | `GET`, `POST` | `/lti/oidc/login` | OIDC login initiation, answers 302 |
//! | `POST` | `/lti/launch` | `id_token` launch (form `id_token`, `state`) |
//! | `POST` | `/lti/deep-linking/response` | Signed Deep Linking response for a stored launch (form `launch_id`, `selected_items[]`), auto-post page |
//! | `GET` | `/health` | Liveness |
//!
//! Every failure is answered with JSON `{"error": <code>, "message": <text>}`
//! and the status from [`Error::status_code`].

use std::sync::Arc;

use axum::{
    Form, Json, Router,
    extract::{Query, State},
    http::{HeaderMap, HeaderValue, StatusCode, header},
    response::{Html, IntoResponse, Response},
    routing::{get, post},
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use subtle::ConstantTimeEq;
use tracing::{info, warn};
use uuid::Uuid;

use super::{ContentItem, DeepLinkingSettings, LoginRequest, LtiService, MessageType, ValidatedLaunch};
use crate::audit::{self, AuditEvent};
use crate::{Error, Result};

/// Cookie carrying the login `state` back to the launch.
pub const STATE_COOKIE: &str = "lti_state";

/// Launch form posted by the platform.
#[derive(Debug, Default, Deserialize)]
pub struct LaunchForm {
    /// Signed platform token
    #[serde(default)]
    pub id_token: Option<String>,
    /// State issued at login
    #[serde(default)]
    pub state: Option<String>,
}

/// Answer to a resource-link launch.
#[derive(Debug, Serialize, Deserialize)]
pub struct ResourceLinkLaunchResponse {
    /// Stored launch id
    pub launch_id: Uuid,
    /// Always `LtiResourceLinkRequest`
    pub message_type: MessageType,
    /// Course context
    pub context_id: Option<String>,
    /// Resource link
    pub resource_link_id: Option<String>,
    /// When the stored launch expires
    pub expires_at: DateTime<Utc>,
}

/// A catalog entry offered for selection, with its selection index.
#[derive(Debug, Serialize, Deserialize)]
pub struct CatalogEntry {
    /// Index to post back in `selected_items[]`
    pub index: usize,
    /// The item
    pub item: ContentItem,
}

/// Answer to a deep-linking launch.
#[derive(Debug, Serialize, Deserialize)]
pub struct DeepLinkingLaunchResponse {
    /// Stored launch id to post back as `launch_id`
    pub launch_id: Uuid,
    /// Issuer the launch came from
    pub platform_id: String,
    /// Deployment the launch came from
    pub deployment_id: String,
    /// Course context
    pub context_id: Option<String>,
    /// Platform Deep Linking settings
    pub settings: DeepLinkingSettings,
    /// Items the platform accepts
    pub catalog: Vec<CatalogEntry>,
    /// When the selection must be posted by
    pub expires_at: DateTime<Utc>,
}

/// Build the LTI routes.
pub fn lti_routes(service: Arc<LtiService>) -> Router {
    Router::new()
        .route("/lti/jwks", get(jwks))
        .route("/lti/oidc/login", get(login_get).post(login_post))
        .route("/lti/launch", post(launch))
        .route("/lti/deep-linking/response", post(deep_linking_response))
        .route("/health", get(health))
        .with_state(service)
}

/// JSON error body with the status the error maps to.
pub fn error_response(err: &Error) -> Response {
    (
        err.status_code(),
        Json(json!({
            "error": err.code(),
            "message": err.to_string(),
        })),
    )
        .into_response()
}

async fn health() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}

async fn jwks(State(service): State<Arc<LtiService>>) -> impl IntoResponse {
    Json(service.keys.public_jwks())
}

async fn login_get(
    State(service): State<Arc<LtiService>>,
    Query(request): Query<LoginRequest>,
) -> Response {
    initiate_login(&service, &request).await
}

async fn login_post(
    State(service): State<Arc<LtiService>>,
    Form(request): Form<LoginRequest>,
) -> Response {
    initiate_login(&service, &request).await
}

async fn initiate_login(service: &LtiService, request: &LoginRequest) -> Response {
    match service.login.initiate(request).await {
        Ok(redirect) => {
            audit::emit(&AuditEvent::login_initiated(
                &redirect.platform_id,
                request.lti_deployment_id.as_deref(),
            ));
            let cookie = format!(
                "{STATE_COOKIE}={}; Path=/; Max-Age=300; HttpOnly; Secure; SameSite=None",
                redirect.state
            );
            let (Ok(location), Ok(cookie)) = (
                HeaderValue::from_str(redirect.url.as_str()),
                HeaderValue::from_str(&cookie),
            ) else {
                return error_response(&Error::Internal("unencodable redirect".to_string()));
            };
            (
                StatusCode::FOUND,
                [(header::LOCATION, location), (header::SET_COOKIE, cookie)],
            )
                .into_response()
        }
        Err(e) => {
            warn!(error = %e, "OIDC login initiation failed");
            error_response(&e)
        }
    }
}

async fn launch(
    State(service): State<Arc<LtiService>>,
    headers: HeaderMap,
    Form(form): Form<LaunchForm>,
) -> Response {
    let id_token = form.id_token.unwrap_or_default();
    let state = form.state.unwrap_or_default();

    if let Some(expected) = state_cookie(&headers) {
        if !bool::from(expected.as_bytes().ct_eq(state.as_bytes())) {
            audit::emit(&AuditEvent::launch_rejected("state does not match login cookie"));
            return error_response(&Error::InvalidRequest(
                "state does not match login".to_string(),
            ));
        }
    }

    let launch = match service.validator.validate(&id_token, &state).await {
        Ok(launch) => launch,
        Err(e) => {
            audit::emit(&AuditEvent::launch_rejected(e.to_string()));
            return error_response(&e);
        }
    };

    let result = match launch.context.message_type {
        MessageType::ResourceLinkRequest => resource_link_launch(&service, &launch).await,
        MessageType::DeepLinkingRequest => deep_linking_launch(&service, &launch).await,
    };
    result.unwrap_or_else(|e| error_response(&e))
}

async fn resource_link_launch(service: &LtiService, launch: &ValidatedLaunch) -> Result<Response> {
    let stored = service.sessions.store(launch).await;
    audit::emit(&AuditEvent::launch_validated(launch, Some(stored.launch_id)));
    Ok(Json(ResourceLinkLaunchResponse {
        launch_id: stored.launch_id,
        message_type: stored.message_type,
        context_id: stored.context_id,
        resource_link_id: stored.resource_link_id,
        expires_at: stored.expires_at,
    })
    .into_response())
}

async fn deep_linking_launch(service: &LtiService, launch: &ValidatedLaunch) -> Result<Response> {
    let coordinator = &service.deep_linking;
    let settings = coordinator.parse_request(&launch.context)?;
    let catalog = coordinator
        .catalog(launch.context.context_id.as_deref())
        .await?
        .into_iter()
        .enumerate()
        .filter(|(_, item)| settings.accepts(item))
        .map(|(index, item)| CatalogEntry { index, item })
        .collect();
    let stored = service.sessions.store(launch).await;
    audit::emit(&AuditEvent::launch_validated(launch, Some(stored.launch_id)));

    Ok(Json(DeepLinkingLaunchResponse {
        launch_id: stored.launch_id,
        platform_id: stored.platform_id,
        deployment_id: stored.deployment_id,
        context_id: stored.context_id,
        settings,
        catalog,
        expires_at: stored.expires_at,
    })
    .into_response())
}

/// Instructor selection, parsed from a urlencoded body with repeated keys.
///
/// Everything except the launch id and the indices is taken from the stored
/// launch; other fields in the body are ignored.
#[derive(Debug, Default)]
struct SelectionForm {
    launch_id: Option<String>,
    selected: Vec<String>,
}

impl SelectionForm {
    fn parse(body: &[u8]) -> Self {
        let mut form = Self::default();
        for (key, value) in url::form_urlencoded::parse(body) {
            let value = value.into_owned();
            match key.as_ref() {
                "selected_items[]" | "selected_items" => form.selected.push(value),
                "launch_id" => form.launch_id = Some(value),
                _ => {}
            }
        }
        form
    }
}

async fn deep_linking_response(State(service): State<Arc<LtiService>>, body: String) -> Response {
    match build_deep_linking_response(&service, body.as_bytes()).await {
        Ok(html) => Html(html).into_response(),
        Err(e) => {
            warn!(error = %e, "Deep linking response rejected");
            error_response(&e)
        }
    }
}

async fn build_deep_linking_response(service: &LtiService, body: &[u8]) -> Result<String> {
    let form = SelectionForm::parse(body);
    let raw_id = required(form.launch_id, "launch_id")?;
    let launch_id = Uuid::parse_str(raw_id.trim())
        .map_err(|_| Error::InvalidRequest(format!("invalid launch_id {raw_id:?}")))?;

    let indices = form
        .selected
        .iter()
        .map(|raw| {
            raw.trim()
                .parse::<usize>()
                .map_err(|_| Error::ContentSelection(format!("invalid item index {raw:?}")))
        })
        .collect::<Result<Vec<_>>>()?;

    let launch = service
        .sessions
        .get(&launch_id)
        .await
        .ok_or_else(|| Error::NotFound(format!("launch {launch_id} not found or expired")))?;
    let response = service.deep_linking.respond(&launch, &indices).await?;
    info!(
        platform = %launch.platform_id,
        launch_id = %launch_id,
        items = indices.len(),
        "Returning deep linking selection"
    );
    Ok(response.auto_submit_form())
}

fn required(value: Option<String>, name: &str) -> Result<String> {
    value
        .filter(|v| !v.trim().is_empty())
        .ok_or_else(|| Error::InvalidRequest(format!("missing required parameter: {name}")))
}

/// Read the login state cookie, if the browser sent it.
fn state_cookie(headers: &HeaderMap) -> Option<String> {
    headers
        .get_all(header::COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(';'))
        .find_map(|pair| {
            let (name, value) = pair.trim().split_once('=')?;
            (name == STATE_COOKIE).then(|| value.to_string())
        })
}
