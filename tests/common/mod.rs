//! Shared fixtures: an in-process fake LMS platform and tool configuration.

#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::{
    Json, Router,
    body::Bytes,
    extract::{Form, Path, Query, State},
    http::{HeaderMap, HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use chrono::Utc;
use lti_bridge::ags::LineItem;
use lti_bridge::config::{Config, PlatformConfig};
use lti_bridge::lti::claims::uri;
use lti_bridge::lti::{ContentItem, KeyManager, LineItemTemplate, LoginRequest};
use serde_json::{Map, Value, json};
use tokio::net::TcpListener;

pub const ISSUER: &str = "https://lms.example.edu";
pub const CLIENT_ID: &str = "tool-client-1";
pub const DEPLOYMENT_ID: &str = "deployment-1";
pub const TARGET_LINK_URI: &str = "https://tool.example.com/lti/launch";
pub const PLATFORM_KID: &str = "platform-key-1";
pub const PAGE_SIZE: usize = 2;

/// Everything the fake platform has seen or stored.
#[derive(Default)]
pub struct FakeState {
    pub base_url: Mutex<String>,
    pub jwks: Mutex<Value>,
    pub jwks_fetches: Mutex<usize>,
    pub token_requests: Mutex<Vec<HashMap<String, String>>>,
    pub line_items: Mutex<Vec<LineItem>>,
    pub scores: Mutex<Vec<(String, Value)>>,
    pub failing_users: Mutex<HashSet<String>>,
    pub score_delay: Mutex<Duration>,
    pub scores_in_flight: AtomicUsize,
    pub peak_scores_in_flight: AtomicUsize,
}

/// An LMS stand-in serving JWKS, token, line item, score and result endpoints.
pub struct FakePlatform {
    pub base_url: String,
    pub keys: KeyManager,
    pub state: Arc<FakeState>,
}

impl FakePlatform {
    pub async fn start() -> Self {
        let keys = KeyManager::generate(PLATFORM_KID).unwrap();
        let state = Arc::new(FakeState::default());
        *state.jwks.lock().unwrap() = serde_json::to_value(keys.public_jwks()).unwrap();

        let app = Router::new()
            .route("/jwks", get(jwks))
            .route("/slow-jwks", get(slow_jwks))
            .route("/token", post(token))
            .route(
                "/api/lti/courses/{context_id}/line_items",
                get(list_line_items).post(create_line_item),
            )
            .route(
                "/api/lti/courses/{context_id}/line_items/{item}/scores",
                post(post_score),
            )
            .route(
                "/api/lti/courses/{context_id}/line_items/{item}/results",
                get(results),
            )
            .with_state(Arc::clone(&state));

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let base_url = format!("http://{}", listener.local_addr().unwrap());
        *state.base_url.lock().unwrap() = base_url.clone();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self {
            base_url,
            keys,
            state,
        }
    }

    /// Sign a platform `id_token` with the platform key.
    pub fn sign<T: serde::Serialize>(&self, claims: &T) -> String {
        self.keys.sign(claims).unwrap()
    }

    /// Make score submissions for `user_id` fail with HTTP 500.
    pub fn fail_scores_for(&self, user_id: &str) {
        self.state.failing_users.lock().unwrap().insert(user_id.to_string());
    }

    /// Hold every score submission open for `delay` before answering.
    pub fn delay_scores(&self, delay: Duration) {
        *self.state.score_delay.lock().unwrap() = delay;
    }

    /// Most score submissions ever open at the same time.
    pub fn peak_scores_in_flight(&self) -> usize {
        self.state.peak_scores_in_flight.load(Ordering::SeqCst)
    }

    /// Add a line item as if an instructor had created it on the platform.
    pub fn seed_line_item(&self, context_id: &str, mut item: LineItem) -> LineItem {
        let mut items = self.state.line_items.lock().unwrap();
        item.id = format!(
            "{}/api/lti/courses/{context_id}/line_items/{}",
            self.base_url,
            items.len() + 1
        );
        items.push(item.clone());
        item
    }

    pub fn line_item_count(&self) -> usize {
        self.state.line_items.lock().unwrap().len()
    }

    pub fn scores(&self) -> Vec<(String, Value)> {
        self.state.scores.lock().unwrap().clone()
    }

    pub fn token_requests(&self) -> Vec<HashMap<String, String>> {
        self.state.token_requests.lock().unwrap().clone()
    }

    pub fn jwks_fetches(&self) -> usize {
        *self.state.jwks_fetches.lock().unwrap()
    }

    pub fn line_items_template(&self) -> String {
        format!("{}/api/lti/courses/{{context_id}}/line_items", self.base_url)
    }
}

async fn jwks(State(state): State<Arc<FakeState>>) -> Json<Value> {
    *state.jwks_fetches.lock().unwrap() += 1;
    Json(state.jwks.lock().unwrap().clone())
}

async fn slow_jwks(State(state): State<Arc<FakeState>>) -> Json<Value> {
    tokio::time::sleep(Duration::from_secs(3)).await;
    Json(state.jwks.lock().unwrap().clone())
}

async fn token(
    State(state): State<Arc<FakeState>>,
    Form(params): Form<HashMap<String, String>>,
) -> Response {
    state.token_requests.lock().unwrap().push(params.clone());
    if params.get("grant_type").map(String::as_str) != Some("client_credentials") {
        return (StatusCode::BAD_REQUEST, Json(json!({"error": "unsupported_grant_type"})))
            .into_response();
    }
    let n = state.token_requests.lock().unwrap().len();
    Json(json!({
        "access_token": format!("access-{n}"),
        "token_type": "Bearer",
        "expires_in": 3600,
        "scope": params.get("scope").cloned().unwrap_or_default(),
    }))
    .into_response()
}

fn bearer_ok(headers: &HeaderMap) -> bool {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.starts_with("Bearer access-"))
}

async fn list_line_items(
    State(state): State<Arc<FakeState>>,
    Path(context_id): Path<String>,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
) -> Response {
    if !bearer_ok(&headers) {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    let base_url = state.base_url.lock().unwrap().clone();
    let prefix = format!("{base_url}/api/lti/courses/{context_id}/line_items/");
    let matching: Vec<LineItem> = state
        .line_items
        .lock()
        .unwrap()
        .iter()
        .filter(|li| li.id.starts_with(&prefix))
        .filter(|li| match query.get("resource_id") {
            Some(rid) => li.resource_id.as_deref() == Some(rid.as_str()),
            None => true,
        })
        .cloned()
        .collect();

    let page: usize = query.get("page").and_then(|p| p.parse().ok()).unwrap_or(0);
    let start = page * PAGE_SIZE;
    let slice: Vec<LineItem> = matching.iter().skip(start).take(PAGE_SIZE).cloned().collect();

    let mut response = Json(slice).into_response();
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/vnd.ims.lis.v2.lineitemcontainer+json"),
    );
    if start + PAGE_SIZE < matching.len() {
        let filter = query
            .get("resource_id")
            .map(|rid| format!("&resource_id={rid}"))
            .unwrap_or_default();
        let next = format!(
            "<{base_url}/api/lti/courses/{context_id}/line_items?page={}{filter}>; rel=\"next\"",
            page + 1
        );
        response
            .headers_mut()
            .insert(header::LINK, HeaderValue::from_str(&next).unwrap());
    }
    response
}

async fn create_line_item(
    State(state): State<Arc<FakeState>>,
    Path(context_id): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    if !bearer_ok(&headers) {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    let Ok(mut item) = serde_json::from_slice::<LineItem>(&body) else {
        return StatusCode::BAD_REQUEST.into_response();
    };
    let base_url = state.base_url.lock().unwrap().clone();
    let mut items = state.line_items.lock().unwrap();
    item.id = format!(
        "{base_url}/api/lti/courses/{context_id}/line_items/{}",
        items.len() + 1
    );
    items.push(item.clone());
    (StatusCode::CREATED, Json(item)).into_response()
}

async fn post_score(
    State(state): State<Arc<FakeState>>,
    Path((_context_id, item)): Path<(String, String)>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    if !bearer_ok(&headers) {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    let in_flight = state.scores_in_flight.fetch_add(1, Ordering::SeqCst) + 1;
    state.peak_scores_in_flight.fetch_max(in_flight, Ordering::SeqCst);
    let delay = *state.score_delay.lock().unwrap();
    tokio::time::sleep(delay).await;
    state.scores_in_flight.fetch_sub(1, Ordering::SeqCst);

    let content_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    if content_type != "application/vnd.ims.lis.v1.score+json" {
        return StatusCode::UNSUPPORTED_MEDIA_TYPE.into_response();
    }
    let Ok(score) = serde_json::from_slice::<Value>(&body) else {
        return StatusCode::BAD_REQUEST.into_response();
    };
    let user = score["userId"].as_str().unwrap_or_default().to_string();
    if state.failing_users.lock().unwrap().contains(&user) {
        return (StatusCode::INTERNAL_SERVER_ERROR, "gradebook unavailable").into_response();
    }
    state.scores.lock().unwrap().push((item, score));
    StatusCode::OK.into_response()
}

async fn results(
    State(state): State<Arc<FakeState>>,
    Path((context_id, item)): Path<(String, String)>,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
) -> Response {
    if !bearer_ok(&headers) {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    let base_url = state.base_url.lock().unwrap().clone();
    let line_item = format!("{base_url}/api/lti/courses/{context_id}/line_items/{item}");
    let results: Vec<Value> = state
        .scores
        .lock()
        .unwrap()
        .iter()
        .filter(|(id, _)| *id == item)
        .filter(|(_, s)| match query.get("user_id") {
            Some(user) => s["userId"] == user.as_str(),
            None => true,
        })
        .enumerate()
        .map(|(i, (_, s))| {
            json!({
                "id": format!("{line_item}/results/{i}"),
                "scoreOf": line_item,
                "userId": s["userId"],
                "resultScore": s["scoreGiven"],
                "resultMaximum": s["scoreMaximum"],
            })
        })
        .collect();
    Json(results).into_response()
}

/// Tool configuration registering the fake platform under [`ISSUER`].
pub fn tool_config(platform: &FakePlatform) -> Config {
    let mut config = Config::default();
    config.platforms = vec![PlatformConfig {
        issuer: ISSUER.to_string(),
        client_id: CLIENT_ID.to_string(),
        deployment_id: DEPLOYMENT_ID.to_string(),
        jwks_url: format!("{}/jwks", platform.base_url),
        token_url: format!("{}/token", platform.base_url),
        auth_login_url: format!("{}/authorize", platform.base_url),
        target_link_uri: TARGET_LINK_URI.to_string(),
        line_items_url: Some(platform.line_items_template()),
    }];
    config.launch.allow_insecure_http = true;
    config.launch.handshake_timeout = Duration::from_secs(5);
    config.ags.request_timeout = Duration::from_secs(5);
    config.deep_linking.catalog = catalog();
    config
}

pub fn catalog() -> Vec<ContentItem> {
    vec![
        ContentItem::LtiResourceLink {
            title: "Week 1 Quiz".to_string(),
            url: Some("https://tool.example.com/quiz/1".to_string()),
            text: Some("Ten questions".to_string()),
            custom: [("quiz_id".to_string(), "1".to_string())].into_iter().collect(),
            line_item: Some(LineItemTemplate {
                score_maximum: 10.0,
                label: Some("Week 1 Quiz".to_string()),
                resource_id: Some("quiz-1".to_string()),
                tag: None,
            }),
        },
        ContentItem::Link {
            url: "https://example.com/reading".to_string(),
            title: Some("Reading".to_string()),
            text: None,
        },
        ContentItem::File {
            url: "https://tool.example.com/files/syllabus.pdf".to_string(),
            title: Some("Syllabus".to_string()),
            text: None,
        },
    ]
}

pub fn login_request() -> LoginRequest {
    LoginRequest {
        iss: Some(ISSUER.to_string()),
        login_hint: Some("user-42".to_string()),
        target_link_uri: Some(TARGET_LINK_URI.to_string()),
        client_id: Some(CLIENT_ID.to_string()),
        lti_deployment_id: Some(DEPLOYMENT_ID.to_string()),
        lti_message_hint: None,
    }
}

/// A complete resource-link claim set carrying `nonce`.
pub fn resource_link_claims(nonce: &str) -> Map<String, Value> {
    let now = Utc::now().timestamp();
    let value = json!({
        "iss": ISSUER,
        "aud": CLIENT_ID,
        "sub": "user-42",
        "iat": now,
        "exp": now + 300,
        "nonce": nonce,
        "name": "Ada Lovelace",
        "email": "ada@example.edu",
        (uri::MESSAGE_TYPE): "LtiResourceLinkRequest",
        (uri::VERSION): "1.3.0",
        (uri::DEPLOYMENT_ID): DEPLOYMENT_ID,
        (uri::TARGET_LINK_URI): TARGET_LINK_URI,
        (uri::RESOURCE_LINK): { "id": "rl-1", "title": "Week 1 Quiz" },
        (uri::CONTEXT): { "id": "course-1", "title": "Analytical Engines 101" },
        (uri::ROLES): ["http://purl.imsglobal.org/vocab/lis/v2/membership#Learner"],
        (uri::CUSTOM): { "quiz_id": "1" },
    });
    match value {
        Value::Object(map) => map,
        _ => unreachable!(),
    }
}

/// A complete deep-linking claim set carrying `nonce`.
pub fn deep_linking_claims(nonce: &str, accept_types: &[&str]) -> Map<String, Value> {
    let mut claims = resource_link_claims(nonce);
    claims.remove(uri::RESOURCE_LINK);
    claims.insert(uri::MESSAGE_TYPE.to_string(), json!("LtiDeepLinkingRequest"));
    claims.insert(
        uri::ROLES.to_string(),
        json!(["http://purl.imsglobal.org/vocab/lis/v2/membership#Instructor"]),
    );
    claims.insert(
        uri::DEEP_LINKING_SETTINGS.to_string(),
        json!({
            "deep_link_return_url": format!("{ISSUER}/deep_links/return"),
            "accept_types": accept_types,
            "accept_presentation_document_targets": ["iframe", "window"],
            "accept_multiple": true,
            "data": "opaque-platform-data",
        }),
    );
    claims
}
