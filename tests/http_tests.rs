//! End-to-end HTTP tests: the tool router served on a local port.

mod common;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use common::{
    CLIENT_ID, DEPLOYMENT_ID, FakePlatform, ISSUER, TARGET_LINK_URI, deep_linking_claims,
    resource_link_claims, tool_config,
};
use jsonwebtoken::{Algorithm, Validation};
use lti_bridge::config::Config;
use lti_bridge::lti::claims::uri;
use lti_bridge::lti::handler::{DeepLinkingLaunchResponse, ResourceLinkLaunchResponse};
use lti_bridge::lti::{KeyManager, LtiService, MessageType};
use lti_bridge::server::create_router;
use pretty_assertions::assert_eq;
use reqwest::{StatusCode, header, redirect};
use serde_json::Value;
use tokio::net::TcpListener;
use url::Url;

struct Tool {
    base_url: String,
    http: reqwest::Client,
    platform: FakePlatform,
    keys: Arc<KeyManager>,
}

/// Login outcome as seen by the browser.
struct Login {
    state: String,
    nonce: String,
    cookie: String,
}

impl Tool {
    async fn start() -> Self {
        Self::start_with(|_| {}).await
    }

    async fn start_with(configure: impl FnOnce(&mut Config)) -> Self {
        let platform = FakePlatform::start().await;
        let mut config = tool_config(&platform);
        configure(&mut config);
        let keys = Arc::new(KeyManager::generate("tool-key").unwrap());
        let service = Arc::new(LtiService::with_keys(&config, Arc::clone(&keys)).unwrap());
        let app = create_router(service, &config);

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let base_url = format!("http://{}", listener.local_addr().unwrap());
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let http = reqwest::Client::builder()
            .redirect(redirect::Policy::none())
            .build()
            .unwrap();
        Self {
            base_url,
            http,
            platform,
            keys,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }

    async fn login(&self) -> Login {
        let response = self
            .http
            .post(self.url("/lti/oidc/login"))
            .form(&[
                ("iss", ISSUER),
                ("login_hint", "user-42"),
                ("target_link_uri", TARGET_LINK_URI),
                ("client_id", CLIENT_ID),
                ("lti_deployment_id", DEPLOYMENT_ID),
            ])
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::FOUND);

        let location = response.headers()[header::LOCATION].to_str().unwrap();
        let query: HashMap<String, String> =
            Url::parse(location).unwrap().query_pairs().into_owned().collect();
        let cookie = response.headers()[header::SET_COOKIE]
            .to_str()
            .unwrap()
            .split(';')
            .next()
            .unwrap()
            .to_string();
        Login {
            state: query["state"].clone(),
            nonce: query["nonce"].clone(),
            cookie,
        }
    }

    async fn launch(&self, login: &Login, id_token: &str) -> reqwest::Response {
        self.http
            .post(self.url("/lti/launch"))
            .header(header::COOKIE, &login.cookie)
            .form(&[("id_token", id_token), ("state", login.state.as_str())])
            .send()
            .await
            .unwrap()
    }

    /// Log in and complete a deep-linking launch accepting `accept_types`.
    async fn deep_linking_launch(&self, accept_types: &[&str]) -> DeepLinkingLaunchResponse {
        let login = self.login().await;
        let id_token = self
            .platform
            .sign(&deep_linking_claims(&login.nonce, accept_types));
        let response = self.launch(&login, &id_token).await;
        assert_eq!(response.status(), StatusCode::OK);
        response.json().await.unwrap()
    }

    async fn respond(&self, form: &[(&str, &str)]) -> reqwest::Response {
        self.http
            .post(self.url("/lti/deep-linking/response"))
            .form(form)
            .send()
            .await
            .unwrap()
    }

    /// Claims of the JWT carried by an auto-submit page, verified with the tool key.
    fn response_claims(&self, html: &str) -> serde_json::Map<String, Value> {
        let (_, rest) = html.split_once(r#"name="JWT" value=""#).unwrap();
        let (jwt, _) = rest.split_once('"').unwrap();
        let mut validation = Validation::new(Algorithm::RS256);
        validation.set_audience(&[ISSUER]);
        validation.set_issuer(&[CLIENT_ID]);
        jsonwebtoken::decode::<serde_json::Map<String, Value>>(jwt, self.keys.decoding_key(), &validation)
            .unwrap()
            .claims
    }
}

#[tokio::test]
async fn test_health() {
    let tool = Tool::start().await;

    let response = tool.http.get(tool.url("/health")).send().await.unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["status"], "ok");
}

#[tokio::test]
async fn test_jwks_publishes_tool_key() {
    let tool = Tool::start().await;

    let body: Value = tool
        .http
        .get(tool.url("/lti/jwks"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();

    let key = &body["keys"][0];
    assert_eq!(key["kid"], "tool-key");
    assert_eq!(key["kty"], "RSA");
    assert_eq!(key["alg"], "RS256");
    assert_eq!(key["use"], "sig");
    assert!(key["n"].as_str().is_some_and(|n| !n.is_empty()));
}

#[tokio::test]
async fn test_login_redirects_to_platform_with_state_cookie() {
    // GIVEN: a running tool
    let tool = Tool::start().await;

    // WHEN: the platform starts a login via GET
    let response = tool
        .http
        .get(tool.url("/lti/oidc/login"))
        .query(&[
            ("iss", ISSUER),
            ("login_hint", "user-42"),
            ("target_link_uri", TARGET_LINK_URI),
            ("client_id", CLIENT_ID),
            ("lti_message_hint", "hint-7"),
        ])
        .send()
        .await
        .unwrap();

    // THEN: the browser is sent to the platform auth endpoint
    assert_eq!(response.status(), StatusCode::FOUND);
    let location = Url::parse(response.headers()[header::LOCATION].to_str().unwrap()).unwrap();
    assert_eq!(
        location.as_str().split('?').next().unwrap(),
        format!("{}/authorize", tool.platform.base_url)
    );
    let query: HashMap<String, String> = location.query_pairs().into_owned().collect();
    assert_eq!(query["scope"], "openid");
    assert_eq!(query["response_type"], "id_token");
    assert_eq!(query["response_mode"], "form_post");
    assert_eq!(query["prompt"], "none");
    assert_eq!(query["client_id"], CLIENT_ID);
    assert_eq!(query["redirect_uri"], TARGET_LINK_URI);
    assert_eq!(query["login_hint"], "user-42");
    assert_eq!(query["lti_message_hint"], "hint-7");

    // AND: the state is pinned to the browser
    let cookie = response.headers()[header::SET_COOKIE].to_str().unwrap();
    assert!(cookie.starts_with(&format!("lti_state={}", query["state"])));
    assert!(cookie.contains("HttpOnly"));
}

#[tokio::test]
async fn test_login_without_login_hint_is_bad_request() {
    let tool = Tool::start().await;

    let response = tool
        .http
        .post(tool.url("/lti/oidc/login"))
        .form(&[("iss", ISSUER), ("target_link_uri", TARGET_LINK_URI)])
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["error"], "invalid_request");
}

#[tokio::test]
async fn test_login_from_unknown_issuer_is_bad_request() {
    let tool = Tool::start().await;

    let response = tool
        .http
        .post(tool.url("/lti/oidc/login"))
        .form(&[
            ("iss", "https://platform.example"),
            ("login_hint", "user-42"),
            ("target_link_uri", TARGET_LINK_URI),
            ("client_id", CLIENT_ID),
        ])
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["error"], "unknown_platform");
}

#[tokio::test]
async fn test_resource_link_launch_end_to_end() {
    // GIVEN: a completed login
    let tool = Tool::start().await;
    let login = tool.login().await;
    let id_token = tool.platform.sign(&resource_link_claims(&login.nonce));

    // WHEN: the platform posts the id_token back through the browser
    let response = tool.launch(&login, &id_token).await;

    // THEN: the launch is stored for 24 hours
    assert_eq!(response.status(), StatusCode::OK);
    let body: ResourceLinkLaunchResponse = response.json().await.unwrap();
    assert_eq!(body.message_type, MessageType::ResourceLinkRequest);
    assert_eq!(body.context_id.as_deref(), Some("course-1"));
    assert_eq!(body.resource_link_id.as_deref(), Some("rl-1"));
    let ttl = body.expires_at - chrono::Utc::now();
    assert!(ttl > chrono::Duration::hours(23) && ttl <= chrono::Duration::hours(24));
}

#[tokio::test]
async fn test_launch_with_mismatched_state_cookie_is_rejected() {
    let tool = Tool::start().await;
    let login = tool.login().await;
    let id_token = tool.platform.sign(&resource_link_claims(&login.nonce));
    let forged = Login {
        state: "attacker-state".to_string(),
        nonce: login.nonce.clone(),
        cookie: login.cookie.clone(),
    };

    let response = tool.launch(&forged, &id_token).await;

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    // The nonce was not spent by the rejected attempt.
    let retry = tool.launch(&login, &id_token).await;
    assert_eq!(retry.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_replayed_launch_is_unauthorized() {
    let tool = Tool::start().await;
    let login = tool.login().await;
    let id_token = tool.platform.sign(&resource_link_claims(&login.nonce));

    let first = tool.launch(&login, &id_token).await;
    let replay = tool.launch(&login, &id_token).await;

    assert_eq!(first.status(), StatusCode::OK);
    assert_eq!(replay.status(), StatusCode::UNAUTHORIZED);
    let body: Value = replay.json().await.unwrap();
    assert_eq!(body["error"], "replayed_nonce");
}

#[tokio::test]
async fn test_launch_without_id_token_is_bad_request() {
    let tool = Tool::start().await;
    let login = tool.login().await;

    let response = tool.launch(&login, "").await;

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_deep_linking_launch_and_response() {
    // GIVEN: a deep-linking launch accepting links and files
    let tool = Tool::start().await;

    // WHEN: launched
    let launch = tool.deep_linking_launch(&["link", "file"]).await;

    // THEN: only accepted items are offered, under their catalog indices
    let indices: Vec<usize> = launch.catalog.iter().map(|entry| entry.index).collect();
    assert_eq!(indices, vec![1, 2]);
    assert_eq!(launch.platform_id, ISSUER);

    // WHEN: the instructor posts the file selection against the launch
    let launch_id = launch.launch_id.to_string();
    let response = tool
        .respond(&[("launch_id", launch_id.as_str()), ("selected_items[]", "2")])
        .await;

    // THEN: an auto-submitting form posts the signed JWT to the platform
    assert_eq!(response.status(), StatusCode::OK);
    let content_type = response.headers()[header::CONTENT_TYPE].to_str().unwrap().to_string();
    assert!(content_type.starts_with("text/html"));
    let html = response.text().await.unwrap();
    assert!(html.contains(r#"action="https://lms.example.edu/deep_links/return""#));
    let claims = tool.response_claims(&html);
    assert_eq!(claims[uri::DL_DATA], "opaque-platform-data");
    assert_eq!(claims[uri::CONTENT_ITEMS][0]["type"], "file");
}

#[tokio::test]
async fn test_deep_linking_response_ignores_posted_platform_fields() {
    // GIVEN: a real deep-linking launch
    let tool = Tool::start().await;
    let launch = tool.deep_linking_launch(&["link"]).await;
    let launch_id = launch.launch_id.to_string();

    // WHEN: the form also carries a foreign deployment, return URL and data
    let response = tool
        .respond(&[
            ("launch_id", launch_id.as_str()),
            ("selected_items[]", "1"),
            ("platform_id", "https://other.example"),
            ("deployment_id", "not-a-registered-deployment"),
            ("return_url", "https://attacker.example/collect"),
            ("data", "forged"),
        ])
        .await;

    // THEN: the response is bound to the launch, not the form
    assert_eq!(response.status(), StatusCode::OK);
    let html = response.text().await.unwrap();
    assert!(!html.contains("attacker.example"));
    assert!(html.contains(r#"action="https://lms.example.edu/deep_links/return""#));
    let claims = tool.response_claims(&html);
    assert_eq!(claims[uri::DEPLOYMENT_ID], DEPLOYMENT_ID);
    assert_eq!(claims[uri::DL_DATA], "opaque-platform-data");
}

#[tokio::test]
async fn test_deep_linking_response_without_launch_is_rejected() {
    let tool = Tool::start().await;

    let response = tool
        .respond(&[
            ("selected_items[]", "0"),
            ("platform_id", ISSUER),
            ("deployment_id", DEPLOYMENT_ID),
            ("return_url", "https://attacker.example/collect"),
        ])
        .await;

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["error"], "invalid_request");
}

#[tokio::test]
async fn test_deep_linking_response_for_unknown_launch_is_not_found() {
    let tool = Tool::start().await;
    let launch_id = uuid::Uuid::new_v4().to_string();

    let response = tool
        .respond(&[("launch_id", launch_id.as_str()), ("selected_items[]", "0")])
        .await;

    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["error"], "not_found");
}

#[tokio::test]
async fn test_deep_linking_response_for_expired_launch_is_not_found() {
    let tool = Tool::start_with(|config| config.launch.session_ttl = Duration::ZERO).await;
    let launch = tool.deep_linking_launch(&["link"]).await;
    let launch_id = launch.launch_id.to_string();

    let response = tool
        .respond(&[("launch_id", launch_id.as_str()), ("selected_items[]", "1")])
        .await;

    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_deep_linking_response_for_resource_link_launch_is_rejected() {
    // GIVEN: a resource-link launch
    let tool = Tool::start().await;
    let login = tool.login().await;
    let id_token = tool.platform.sign(&resource_link_claims(&login.nonce));
    let launch: ResourceLinkLaunchResponse = tool.launch(&login, &id_token).await.json().await.unwrap();
    let launch_id = launch.launch_id.to_string();

    // WHEN: its id is used to answer a deep-linking request
    let response = tool
        .respond(&[("launch_id", launch_id.as_str()), ("selected_items[]", "0")])
        .await;

    // THEN: nothing is signed
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["error"], "invalid_request");
}

#[tokio::test]
async fn test_deep_linking_response_with_unaccepted_type_is_rejected() {
    let tool = Tool::start().await;
    let launch = tool.deep_linking_launch(&["link", "file"]).await;
    let launch_id = launch.launch_id.to_string();

    // Index 0 is the resource link, which this platform does not accept.
    let response = tool
        .respond(&[("launch_id", launch_id.as_str()), ("selected_items[]", "0")])
        .await;

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["error"], "invalid_selection");
}

#[tokio::test]
async fn test_deep_linking_response_with_bad_index_is_rejected() {
    let tool = Tool::start().await;
    let launch = tool.deep_linking_launch(&[]).await;
    let launch_id = launch.launch_id.to_string();

    let response = tool
        .respond(&[("launch_id", launch_id.as_str()), ("selected_items[]", "9")])
        .await;

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["error"], "invalid_selection");
}

#[tokio::test]
async fn test_deep_linking_response_without_selection_is_rejected() {
    let tool = Tool::start().await;
    let launch = tool.deep_linking_launch(&[]).await;
    let launch_id = launch.launch_id.to_string();

    let response = tool.respond(&[("launch_id", launch_id.as_str())]).await;

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}
