//! End-to-end login, logout and identity flows driven through the axum router.

#![cfg(feature = "axum-integration")]

use async_trait::async_trait;
use axum::Router;
use axum::body::{Body, to_bytes};
use axum::http::{Request, Response, StatusCode, header};
use idopt_auth::claims::claim_types;
use idopt_auth::config::AuthConfig;
use idopt_auth::cookie::CookieSchemeConfig;
use idopt_auth::dispatch::{CHALLENGE_UNAVAILABLE_MESSAGE, PROVIDER_DISABLED_MESSAGE, RuntimeEnvironment};
use idopt_auth::errors::{AuthError, Result};
use idopt_auth::integrations::axum::{AppState, build_router};
use idopt_auth::methods::header::{PRINCIPAL_HEADER, PRINCIPAL_IDP_HEADER, encode_principal};
use idopt_auth::server::oidc::{FederatedChallenger, FederatedSchemes, OidcSchemeConfig};
use idopt_auth::session::{MemorySessionStore, Session};
use idopt_auth::storage::MemoryProfileStore;
use idopt_auth::ChallengeProperties;
use std::sync::Arc;
use tower::ServiceExt;

fn local_app() -> Router {
    build_router(AppState::from_config(AuthConfig::default()).unwrap())
}

fn hosted_config() -> AuthConfig {
    AuthConfig {
        site_name: Some("myapp".to_string()),
        environment: Some(RuntimeEnvironment::Hosted),
        cookie: CookieSchemeConfig {
            secret: "integration-test-secret".to_string(),
            secure: true,
            ..Default::default()
        },
        ..Default::default()
    }
}

async fn send(app: &Router, request: Request<Body>) -> Response<Body> {
    app.clone().oneshot(request).await.unwrap()
}

fn get(uri: &str) -> axum::http::request::Builder {
    Request::builder().uri(uri).header(header::HOST, "localhost:8080")
}

fn location(response: &Response<Body>) -> String {
    response
        .headers()
        .get(header::LOCATION)
        .expect("redirect has a location")
        .to_str()
        .unwrap()
        .to_string()
}

fn set_cookies(response: &Response<Body>) -> Vec<String> {
    response
        .headers()
        .get_all(header::SET_COOKIE)
        .iter()
        .map(|v| v.to_str().unwrap().to_string())
        .collect()
}

/// `Cookie` header carrying every live cookie the response set.
fn cookie_header(response: &Response<Body>) -> String {
    set_cookies(response)
        .iter()
        .filter(|c| !c.contains("Max-Age=0"))
        .filter_map(|c| c.split(';').next())
        .collect::<Vec<_>>()
        .join("; ")
}

async fn json(response: Response<Body>) -> serde_json::Value {
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

struct MockChallenger {
    fail: bool,
}

#[async_trait]
impl FederatedChallenger for MockChallenger {
    fn scheme_name(&self) -> &str {
        "AzureB2C"
    }

    async fn challenge(
        &self,
        _session: &Session,
        properties: &ChallengeProperties,
        _origin: &str,
    ) -> Result<String> {
        if self.fail {
            return Err(AuthError::upstream_challenge("AzureB2C", "metadata endpoint down"));
        }
        Ok(format!(
            "https://login.example/authorize?redirect={}",
            properties.redirect_uri.as_deref().unwrap_or_default()
        ))
    }

    async fn sign_out(&self, post_logout_redirect: &str, _origin: &str) -> Result<String> {
        Ok(format!(
            "https://login.example/logout?post_logout_redirect_uri={post_logout_redirect}"
        ))
    }
}

fn federated_app(fail: bool) -> Router {
    let state = AppState::new(
        AuthConfig::default(),
        Arc::new(MemorySessionStore::new()),
        Arc::new(MemoryProfileStore::new()),
        FederatedSchemes::new().with(Arc::new(MockChallenger { fail })),
    )
    .unwrap();
    build_router(state)
}

#[tokio::test]
async fn test_platform_headers_reach_about() {
    let app = local_app();
    let principal = encode_principal(
        Some("u-42"),
        &[
            (claim_types::NAME, "Ada Lovelace"),
            (claim_types::EMAIL, "ada@example.com"),
        ],
    );
    let response = send(
        &app,
        get("/About")
            .header(PRINCIPAL_HEADER, principal)
            .header(PRINCIPAL_IDP_HEADER, "aad")
            .body(Body::empty())
            .unwrap(),
    )
    .await;

    assert_eq!(response.status(), StatusCode::OK);
    let body = json(response).await;
    assert_eq!(body["user_id"], "u-42");
    assert_eq!(body["display_name"], "Ada Lovelace");
    assert_eq!(body["authentication_method"], "header");
    assert_eq!(body["environment"], "local");
    assert_eq!(body["classification"]["family"], "platform");
    assert_eq!(
        body["classification"]["label"],
        "Azure App Service EasyAuth (aad)"
    );
}

#[tokio::test]
async fn test_anonymous_about_redirects_to_login() {
    let app = local_app();
    let response = send(&app, get("/About?tab=claims").body(Body::empty()).unwrap()).await;

    assert_eq!(response.status(), StatusCode::FOUND);
    assert_eq!(location(&response), "/Login?returnUrl=%2FAbout%3Ftab%3Dclaims");
}

#[tokio::test]
async fn test_malformed_principal_falls_through_to_simulation() {
    let app = local_app();
    let response = send(
        &app,
        get("/About?simulate_provider=google")
            .header(PRINCIPAL_HEADER, "!!not-base64!!")
            .body(Body::empty())
            .unwrap(),
    )
    .await;

    assert_eq!(response.status(), StatusCode::OK);
    let body = json(response).await;
    assert_eq!(body["authentication_method"], "simulated");
    assert_eq!(body["display_name"], "Jane Smith");
    assert_eq!(body["email"], "jane.smith@gmail.com");
}

#[tokio::test]
async fn test_local_platform_login_runs_simulation() {
    let app = local_app();

    let response = send(
        &app,
        get("/Login/initiate?provider=google").body(Body::empty()).unwrap(),
    )
    .await;
    assert_eq!(response.status(), StatusCode::FOUND);
    assert_eq!(
        location(&response),
        "/LocalSimulation?provider=google&returnUrl=%2FAbout"
    );
    assert_eq!(
        response.headers().get(header::CACHE_CONTROL).unwrap(),
        "no-cache, no-store, must-revalidate"
    );
    assert!(
        set_cookies(&response)
            .iter()
            .any(|c| c.starts_with(".IdOpt.Identity=") && c.contains("Max-Age=0"))
    );
    let cookies = cookie_header(&response);
    assert!(cookies.contains(".IdOpt.Session="));

    let response = send(
        &app,
        get(&location(&response))
            .header(header::COOKIE, &cookies)
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(response.status(), StatusCode::FOUND);
    let target = location(&response);
    assert!(target.starts_with("/About?simulate_provider=google&simulate_user=google_user_"));

    // The session record alone keeps the user signed in.
    let response = send(
        &app,
        get("/About").header(header::COOKIE, &cookies).body(Body::empty()).unwrap(),
    )
    .await;
    assert_eq!(response.status(), StatusCode::OK);
    let body = json(response).await;
    assert_eq!(body["authentication_method"], "simulated");
    assert_eq!(body["display_name"], "Jane Smith");
    assert!(
        body["user_id"]
            .as_str()
            .unwrap()
            .starts_with("google_user_")
    );

    // Local platform logout clears the session.
    let response = send(
        &app,
        get("/Logout?provider=google")
            .header(header::COOKIE, &cookies)
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(location(&response), "/");
    assert!(
        set_cookies(&response)
            .iter()
            .any(|c| c.starts_with("logout-trigger=") && c.contains("Max-Age=0"))
    );

    let response = send(
        &app,
        get("/About").header(header::COOKIE, &cookies).body(Body::empty()).unwrap(),
    )
    .await;
    assert_eq!(response.status(), StatusCode::FOUND);
}

#[tokio::test]
async fn test_x_dispatches_to_twitter_and_unknown_to_default() {
    let app = local_app();

    let response = send(&app, get("/Login/initiate?provider=X").body(Body::empty()).unwrap()).await;
    assert_eq!(
        location(&response),
        "/LocalSimulation?provider=twitter&returnUrl=%2FAbout"
    );

    let response = send(
        &app,
        get("/Login/initiate?provider=myspace").body(Body::empty()).unwrap(),
    )
    .await;
    assert_eq!(
        location(&response),
        "/LocalSimulation?provider=aad&returnUrl=%2FAbout"
    );
}

#[tokio::test]
async fn test_simulation_ignores_external_return_url() {
    let app = local_app();
    let response = send(
        &app,
        get("/LocalSimulation?provider=aad&returnUrl=https%3A%2F%2Fevil.example%2F")
            .body(Body::empty())
            .unwrap(),
    )
    .await;

    assert_eq!(response.status(), StatusCode::FOUND);
    assert!(location(&response).starts_with("/?simulate_provider=aad&simulate_user=aad_user_"));
}

#[tokio::test]
async fn test_disabled_provider_shows_message() {
    let app = local_app();

    let response = send(
        &app,
        get("/Login/initiate?provider=github").body(Body::empty()).unwrap(),
    )
    .await;
    assert_eq!(response.status(), StatusCode::FOUND);
    assert_eq!(location(&response), "/Login");
    let cookies = cookie_header(&response);

    let response = send(
        &app,
        get("/Login").header(header::COOKIE, &cookies).body(Body::empty()).unwrap(),
    )
    .await;
    let body = json(response).await;
    assert_eq!(body["error_message"], PROVIDER_DISABLED_MESSAGE);
    let providers = body["providers"].as_array().unwrap();
    assert!(providers.iter().any(|p| p == "google"));
    assert!(!providers.iter().any(|p| p == "github"));

    // The message is shown once.
    let response = send(
        &app,
        get("/Login").header(header::COOKIE, &cookies).body(Body::empty()).unwrap(),
    )
    .await;
    assert!(json(response).await["error_message"].is_null());
}

#[tokio::test]
async fn test_hosted_login_and_logout_use_platform_endpoints() {
    let app = build_router(AppState::from_config(hosted_config()).unwrap());
    let hosted = |uri: &str| {
        Request::builder()
            .uri(uri)
            .header(header::HOST, "myapp.azurewebsites.net")
            .header("x-forwarded-proto", "https")
            .body(Body::empty())
            .unwrap()
    };

    let response = send(&app, hosted("/Login/initiate?provider=aad")).await;
    assert!(location(&response).starts_with(
        "https://myapp.azurewebsites.net/.auth/login/aad?post_login_redirect_uri=/About&t="
    ));

    let response = send(&app, hosted("/Logout?provider=aad")).await;
    assert_eq!(response.status(), StatusCode::FOUND);
    assert!(location(&response).starts_with(
        "https://myapp.azurewebsites.net/.auth/logout?post_logout_redirect_uri=/&t="
    ));
    let headers = response.headers();
    assert_eq!(
        headers.get(header::CACHE_CONTROL).unwrap(),
        "no-cache, no-store, must-revalidate"
    );
    assert_eq!(headers.get(header::PRAGMA).unwrap(), "no-cache");
    assert_eq!(headers.get(header::EXPIRES).unwrap(), "0");
    let cookies = set_cookies(&response);
    assert!(cookies.iter().any(|c| c.starts_with("logout-trigger=")));
    assert!(cookies.iter().any(|c| c.starts_with(".IdOpt.Identity=")));

    // No simulation endpoint behind the platform.
    let response = send(&app, hosted("/LocalSimulation?provider=aad")).await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_local_login_issues_identity_cookie() {
    let app = local_app();
    let post = |body: &'static str| {
        Request::post("/LocalLogin")
            .header(header::HOST, "localhost:8080")
            .header(header::CONTENT_TYPE, "application/x-www-form-urlencoded")
            .body(Body::from(body))
            .unwrap()
    };

    let response = send(&app, post("username=ann")).await;
    assert_eq!(response.status(), StatusCode::FOUND);
    assert_eq!(location(&response), "/About?newUser=true");
    let cookies = cookie_header(&response);
    assert!(cookies.contains(".IdOpt.Identity="));

    let response = send(
        &app,
        get("/About?newUser=true")
            .header(header::COOKIE, &cookies)
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(response.status(), StatusCode::OK);
    let body = json(response).await;
    assert_eq!(body["user_id"], "ann");
    assert_eq!(body["email"], "ann@local.com");
    assert_eq!(body["authentication_method"], "cookie");
    assert_eq!(body["new_user"], true);

    let response = send(&app, post("username=ann&email=")).await;
    assert_eq!(location(&response), "/Index");

    let response = send(&app, post("username=++")).await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_simple_logout_clears_auth_cookies() {
    let app = local_app();
    let response = send(
        &app,
        get("/Logout?provider=simple")
            .header(header::COOKIE, ".IdOpt.Identity=abc; AppAuth=1; theme=dark")
            .body(Body::empty())
            .unwrap(),
    )
    .await;

    assert_eq!(location(&response), "/");
    let cookies = set_cookies(&response);
    let cleared = |name: &str| {
        cookies
            .iter()
            .any(|c| c.starts_with(&format!("{name}=")) && c.contains("Max-Age=0"))
    };
    assert!(cleared(".IdOpt.Identity"));
    assert!(cleared("AppAuth"));
    assert!(!cleared("theme"));
    assert!(!cookies.iter().any(|c| c.starts_with("logout-trigger=")));
}

#[tokio::test]
async fn test_federated_login_challenges_scheme() {
    let app = federated_app(false);
    let response = send(&app, get("/Login/initiate?provider=B2C").body(Body::empty()).unwrap()).await;
    assert_eq!(
        location(&response),
        "https://login.example/authorize?redirect=/About"
    );

    let response = send(&app, get("/Logout?provider=b2c").body(Body::empty()).unwrap()).await;
    assert_eq!(
        location(&response),
        "https://login.example/logout?post_logout_redirect_uri=/"
    );
}

#[tokio::test]
async fn test_federated_challenge_failure_returns_to_login() {
    let app = federated_app(true);
    let response = send(&app, get("/Login/initiate?provider=b2c").body(Body::empty()).unwrap()).await;
    assert_eq!(location(&response), "/Login");
    let cookies = cookie_header(&response);

    let response = send(
        &app,
        get("/Login").header(header::COOKIE, &cookies).body(Body::empty()).unwrap(),
    )
    .await;
    let body = json(response).await;
    assert_eq!(body["error_message"], CHALLENGE_UNAVAILABLE_MESSAGE);
}

#[tokio::test]
async fn test_missing_federated_scheme_is_not_fatal() {
    let app = local_app();
    let response = send(&app, get("/Login/initiate?provider=b2c").body(Body::empty()).unwrap()).await;
    assert_eq!(response.status(), StatusCode::FOUND);
    assert_eq!(location(&response), "/Login");
}

#[tokio::test]
async fn test_loopback_host_with_site_name_uses_platform_login() {
    let config = AuthConfig {
        site_name: Some("myapp".to_string()),
        cookie: CookieSchemeConfig {
            secret: "integration-test-secret".to_string(),
            ..Default::default()
        },
        ..Default::default()
    };
    let app = build_router(AppState::from_config(config).unwrap());

    let response = send(
        &app,
        get("/Login/initiate?provider=aad").body(Body::empty()).unwrap(),
    )
    .await;
    assert_eq!(response.status(), StatusCode::FOUND);
    assert!(location(&response).starts_with(
        "http://localhost:8080/.auth/login/aad?post_login_redirect_uri=/About&t="
    ));

    let response = send(&app, get("/Logout?provider=google").body(Body::empty()).unwrap()).await;
    assert!(location(&response).starts_with("http://localhost:8080/.auth/logout?"));
}

fn mint_id_token(claims: serde_json::Value, key: &[u8]) -> String {
    jsonwebtoken::encode(
        &jsonwebtoken::Header::new(jsonwebtoken::Algorithm::HS256),
        &claims,
        &jsonwebtoken::EncodingKey::from_secret(key),
    )
    .unwrap()
}

/// Token endpoint that answers `good-code` with an id token and nothing else.
async fn spawn_token_endpoint() -> String {
    use axum::routing::post;
    use axum::{Form, Json};
    use std::collections::HashMap;

    async fn token(Form(form): Form<HashMap<String, String>>) -> Response<Body> {
        use axum::response::IntoResponse;
        if form.get("grant_type").map(String::as_str) != Some("authorization_code")
            || form.get("code").map(String::as_str) != Some("good-code")
        {
            return (
                StatusCode::BAD_REQUEST,
                Json(serde_json::json!({"error": "invalid_grant"})),
            )
                .into_response();
        }
        let id_token = mint_id_token(
            serde_json::json!({
                "sub": "b2c-user",
                "name": "Ann B2C",
                "tfp": "B2C_1_susi",
                "iss": "https://contoso.b2clogin.com/tenant/v2.0/",
            }),
            b"b2c-signing-key",
        );
        Json(serde_json::json!({ "id_token": id_token })).into_response()
    }

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let address = listener.local_addr().unwrap();
    let app = Router::new().route("/token", post(token));
    tokio::spawn(async move { axum::serve(listener, app).await });
    format!("http://{address}/token")
}

fn oidc_app(token_endpoint: Option<String>) -> Router {
    let config = AuthConfig {
        federated: Some(OidcSchemeConfig {
            instance: "https://contoso.b2clogin.com/".to_string(),
            tenant: "contoso.onmicrosoft.com".to_string(),
            policy: "B2C_1_susi".to_string(),
            client_id: "client-1".to_string(),
            token_endpoint,
            ..Default::default()
        }),
        ..Default::default()
    };
    build_router(AppState::from_config(config).unwrap())
}

fn query_value(location: &str, name: &str) -> String {
    url::Url::parse(location)
        .unwrap()
        .query_pairs()
        .find(|(k, _)| k == name)
        .map(|(_, v)| v.into_owned())
        .unwrap()
}

#[tokio::test]
async fn test_federated_code_flow_signs_in_federated_identity() {
    let app = oidc_app(Some(spawn_token_endpoint().await));

    let response = send(&app, get("/Login/initiate?provider=b2c").body(Body::empty()).unwrap()).await;
    assert_eq!(response.status(), StatusCode::FOUND);
    let authorize = location(&response);
    assert!(authorize.starts_with(
        "https://contoso.b2clogin.com/contoso.onmicrosoft.com/B2C_1_susi/oauth2/v2.0/authorize?"
    ));
    let state = query_value(&authorize, "state");
    let session_cookie = cookie_header(&response);

    let response = send(
        &app,
        get(&format!("/signin-oidc?code=good-code&state={state}"))
            .header(header::COOKIE, &session_cookie)
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(response.status(), StatusCode::FOUND);
    assert_eq!(location(&response), "/About");
    let identity_cookie = cookie_header(&response);
    assert!(identity_cookie.contains(".IdOpt.Identity="));

    let response = send(
        &app,
        get("/About")
            .header(header::COOKIE, format!("{session_cookie}; {identity_cookie}"))
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(response.status(), StatusCode::OK);
    let body = json(response).await;
    assert_eq!(body["user_id"], "b2c-user");
    assert_eq!(body["display_name"], "Ann B2C");
    assert_eq!(body["authentication_method"], "federated");
    assert_eq!(body["classification"]["family"], "b2c");
}

#[tokio::test]
async fn test_front_channel_id_token_does_not_sign_in() {
    let app = oidc_app(None);
    let forged = mint_id_token(
        serde_json::json!({"sub": "victim-admin", "name": "Forged Admin"}),
        b"attacker",
    );

    // No challenge at all.
    let response = send(
        &app,
        get(&format!("/signin-oidc?id_token={forged}")).body(Body::empty()).unwrap(),
    )
    .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert!(
        !set_cookies(&response)
            .iter()
            .any(|c| c.starts_with(".IdOpt.Identity="))
    );

    // A real challenge answered with an id token instead of a code.
    let response = send(&app, get("/Login/initiate?provider=b2c").body(Body::empty()).unwrap()).await;
    let state = query_value(&location(&response), "state");
    let session_cookie = cookie_header(&response);
    let response = send(
        &app,
        get(&format!("/signin-oidc?id_token={forged}&state={state}"))
            .header(header::COOKIE, &session_cookie)
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert!(
        !set_cookies(&response)
            .iter()
            .any(|c| c.starts_with(".IdOpt.Identity=") && !c.contains("Max-Age=0"))
    );

    let response = send(
        &app,
        get("/About")
            .header(header::COOKIE, &session_cookie)
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(response.status(), StatusCode::FOUND);
}
