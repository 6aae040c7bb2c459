//! Axum integration: the HTTP surface of identity resolution and provider dispatch.
//!
//! [`build_router`] mounts the login, logout, simulation, local credential, federated
//! callback and about endpoints, and layers in:
//!
//! - `tower-cookies` cookie management
//! - a server-side session attached to every request ([`attach_session`])
//! - identity resolution through the configured [`AuthenticationScheme`] ([`authenticate`])
//!
//! Handlers then pick the result up through the [`AuthenticatedIdentity`] and
//! [`MaybeIdentity`] extractors.
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use idopt_auth::config::AuthConfig;
//! use idopt_auth::integrations::axum::{AppState, build_router};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let state = AppState::from_config(AuthConfig::from_env()?)?;
//!     let app = build_router(state);
//!
//!     let listener = tokio::net::TcpListener::bind("127.0.0.1:8080").await?;
//!     axum::serve(listener, app).await?;
//!     Ok(())
//! }
//! ```

use crate::auth::{AuthenticationScheme, ChallengeProperties};
use crate::claims::{AuthMethodTag, Claim, Identity, UNKNOWN_SUBJECT};
use crate::classifier::{self, ProviderClassification};
use crate::config::AuthConfig;
use crate::cookie::{CookieIdentityResolver, CookieScheme, removal_cookie};
use crate::dispatch::{
    DispatchOutcome, LOGOUT_TRIGGER_COOKIE, NO_CACHE_HEADERS, ProviderDispatchRouter,
    RequestOrigin, RuntimeEnvironment, is_auth_cookie,
};
use crate::errors::AuthError;
use crate::methods::RequestContext;
use crate::server::oidc::{AuthenticationResponse, FederatedSchemes, OidcScheme};
use crate::session::{ERROR_MESSAGE_KEY, MemorySessionStore, Session, SessionStore};
use crate::storage::{MemoryProfileStore, UserProfileStore};
use axum::{
    Form, Json, Router,
    extract::{FromRef, FromRequestParts, Query, Request, State},
    http::{HeaderMap, HeaderValue, StatusCode, header, request::Parts},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::get,
};
use serde::{Deserialize, Serialize};
use std::convert::Infallible;
use std::sync::Arc;
use tower_cookies::cookie::time::Duration as CookieDuration;
use tower_cookies::cookie::{Cookie, SameSite};
use tower_cookies::{CookieManagerLayer, Cookies};
use tower_http::trace::TraceLayer;

/// Cookie carrying the server-side session id.
pub const SESSION_COOKIE_NAME: &str = ".IdOpt.Session";

/// Session key holding the saved federated token response.
pub const SAVED_TOKENS_KEY: &str = "oidc.tokens";

/// Shared state of the HTTP surface.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AuthConfig>,
    pub scheme: Arc<AuthenticationScheme>,
    pub router: Arc<ProviderDispatchRouter>,
    pub sessions: Arc<dyn SessionStore>,
    pub cookies: Arc<CookieScheme>,
    pub profiles: Arc<dyn UserProfileStore>,
    pub oidc: Option<Arc<OidcScheme>>,
}

impl std::fmt::Debug for AppState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppState")
            .field("scheme", &self.scheme)
            .field("router", &self.router)
            .field("oidc", &self.oidc.is_some())
            .finish()
    }
}

impl AppState {
    /// Validate `config` and wire the resolver chain and dispatch router.
    ///
    /// `federated` lets callers register extra challengers; the configured OIDC
    /// scheme, if any, is registered on top of them.
    pub fn new(
        config: AuthConfig,
        sessions: Arc<dyn SessionStore>,
        profiles: Arc<dyn UserProfileStore>,
        mut federated: FederatedSchemes,
    ) -> Result<Self, AuthError> {
        config.validate()?;

        let cookies = Arc::new(CookieScheme::new(config.cookie.clone())?);
        let oidc = match &config.federated {
            Some(settings) => {
                let scheme = Arc::new(OidcScheme::new(settings.clone())?);
                federated.register(scheme.clone());
                Some(scheme)
            }
            None => None,
        };

        let scheme = AuthenticationScheme::platform(&config.login_path, config.simulation_enabled())
            .with_resolver(Arc::new(CookieIdentityResolver::new(cookies.clone())));
        let router =
            ProviderDispatchRouter::new(config.provider_registry()?, federated, config.dispatch_settings());

        tracing::info!(
            resolvers = ?scheme.resolver_names(),
            simulation = config.simulation_enabled(),
            hosted = config.is_hosted(),
            "Authentication surface configured"
        );

        Ok(Self {
            config: Arc::new(config),
            scheme: Arc::new(scheme),
            router: Arc::new(router),
            sessions,
            cookies,
            profiles,
            oidc,
        })
    }

    /// State backed by the in-memory session and profile stores.
    pub fn from_config(config: AuthConfig) -> Result<Self, AuthError> {
        let sessions = Arc::new(MemorySessionStore::with_idle_timeout(
            config.session_idle_timeout(),
        ));
        Self::new(
            config,
            sessions,
            Arc::new(MemoryProfileStore::new()),
            FederatedSchemes::new(),
        )
    }
}

/// Identity resolved for the current request, inserted by [`authenticate`].
#[derive(Debug, Clone, Default)]
pub struct CurrentIdentity(pub Option<Identity>);

/// Extractor that requires an identity; otherwise the request is redirected to
/// the login page with a return URL.
#[derive(Debug, Clone)]
pub struct AuthenticatedIdentity(pub Identity);

/// Extractor for an identity that may be absent.
#[derive(Debug, Clone)]
pub struct MaybeIdentity(pub Option<Identity>);

/// Extractor for the request's session, absent when [`attach_session`] did not run.
#[derive(Debug, Clone)]
pub struct CurrentSession(pub Option<Session>);

/// Scheme and host the request arrived on, honouring forwarding headers.
#[derive(Debug, Clone)]
pub struct Origin(pub RequestOrigin);

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(str::trim)
        .filter(|v| !v.is_empty())
}

fn request_origin(parts: &Parts) -> RequestOrigin {
    let scheme = header_str(&parts.headers, "x-forwarded-proto")
        .or_else(|| parts.uri.scheme_str())
        .unwrap_or("http");
    let host = header_str(&parts.headers, "x-forwarded-host")
        .or_else(|| header_str(&parts.headers, "host"))
        .or_else(|| parts.uri.host())
        .unwrap_or("localhost");
    RequestOrigin::new(scheme, host)
}

impl<S> FromRequestParts<S> for AuthenticatedIdentity
where
    S: Send + Sync,
    AppState: FromRef<S>,
{
    type Rejection = Response;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        if let Some(CurrentIdentity(Some(identity))) = parts.extensions.get::<CurrentIdentity>() {
            return Ok(Self(identity.clone()));
        }

        let app = AppState::from_ref(state);
        let target = parts
            .uri
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/");
        let location = app
            .scheme
            .challenge(&ChallengeProperties::with_redirect(target));
        tracing::debug!(target, %location, "No identity, challenging");
        Err(found(&location))
    }
}

impl<S: Send + Sync> FromRequestParts<S> for MaybeIdentity {
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        Ok(Self(
            parts
                .extensions
                .get::<CurrentIdentity>()
                .and_then(|current| current.0.clone()),
        ))
    }
}

impl<S: Send + Sync> FromRequestParts<S> for CurrentSession {
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        Ok(Self(parts.extensions.get::<Session>().cloned()))
    }
}

impl<S: Send + Sync> FromRequestParts<S> for Origin {
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        Ok(Self(request_origin(parts)))
    }
}

/// Attach the server-side session, issuing a session cookie on first contact.
pub async fn attach_session(
    State(state): State<AppState>,
    cookies: Cookies,
    mut request: Request,
    next: Next,
) -> Response {
    let session = match cookies.get(SESSION_COOKIE_NAME) {
        Some(cookie) if !cookie.value().is_empty() => {
            Session::new(cookie.value(), state.sessions.clone())
        }
        _ => {
            let session = Session::generate(state.sessions.clone());
            cookies.add(
                Cookie::build((SESSION_COOKIE_NAME, session.id().to_string()))
                    .path("/")
                    .http_only(true)
                    .secure(state.config.cookie.secure)
                    .same_site(SameSite::Lax)
                    .build(),
            );
            session
        }
    };
    request.extensions_mut().insert(session);
    next.run(request).await
}

/// Run the resolver chain and record the result as [`CurrentIdentity`].
pub async fn authenticate(
    State(state): State<AppState>,
    mut request: Request,
    next: Next,
) -> Response {
    let context = RequestContext::new(request.headers().clone())
        .with_raw_query(request.uri().query())
        .with_session(request.extensions().get::<Session>().cloned());
    let identity = state.scheme.authenticate(&context).await.into_identity();
    request.extensions_mut().insert(CurrentIdentity(identity));
    next.run(request).await
}

/// `302 Found` to `location`.
pub fn found(location: &str) -> Response {
    match HeaderValue::from_str(location) {
        Ok(value) => (StatusCode::FOUND, [(header::LOCATION, value)]).into_response(),
        Err(_) => AuthError::internal(format!("invalid redirect location: {location}"))
            .into_response(),
    }
}

/// Turn a dispatch outcome into a redirect, applying its cookie and cache effects.
pub fn apply_outcome(outcome: &DispatchOutcome, cookies: &Cookies, state: &AppState) -> Response {
    let secure = state.cookies.config().secure;
    if outcome.clear_identity_cookie {
        state.cookies.sign_out(cookies);
    }
    if outcome.clear_auth_cookies {
        for cookie in cookies.list() {
            if is_auth_cookie(cookie.name()) && cookie.name() != state.cookies.name() {
                tracing::debug!(cookie = cookie.name(), "Clearing auth cookie");
                cookies.add(removal_cookie(cookie.name(), secure));
            }
        }
    }
    if outcome.expire_logout_trigger {
        cookies.add(
            Cookie::build((LOGOUT_TRIGGER_COOKIE, uuid::Uuid::new_v4().to_string()))
                .path("/")
                .http_only(true)
                .secure(true)
                .same_site(SameSite::Strict)
                .max_age(CookieDuration::ZERO)
                .build(),
        );
    }

    let mut response = found(&outcome.location);
    if outcome.no_cache {
        let headers = response.headers_mut();
        for (name, value) in NO_CACHE_HEADERS {
            headers.insert(name, HeaderValue::from_static(value));
        }
    }
    response
}

impl IntoResponse for AuthError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            AuthError::Unauthorized(_) => (StatusCode::UNAUTHORIZED, "Authentication required"),
            AuthError::ProviderDisabled { .. } => {
                (StatusCode::FORBIDDEN, "Authentication provider disabled")
            }
            AuthError::InvalidInput(_)
            | AuthError::MalformedPrincipalHeader { .. }
            | AuthError::ProtocolValidation(_)
            | AuthError::Session(_) => (StatusCode::BAD_REQUEST, "Bad request"),
            AuthError::UpstreamChallenge { .. } | AuthError::Network(_) => {
                (StatusCode::BAD_GATEWAY, "Authentication service unavailable")
            }
            _ => (StatusCode::INTERNAL_SERVER_ERROR, "Internal server error"),
        };

        let body = if status.is_server_error() {
            tracing::error!(error = %self, "Request failed");
            serde_json::json!({ "error": message })
        } else {
            serde_json::json!({ "error": message, "details": self.to_string() })
        };

        (status, Json(body)).into_response()
    }
}

#[derive(Debug, Deserialize)]
pub struct ProviderQuery {
    pub provider: Option<String>,
    #[serde(rename = "returnUrl")]
    pub return_url: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct LoginPage {
    pub providers: Vec<String>,
    pub default_provider: String,
    pub error_message: Option<String>,
    pub simulation_enabled: bool,
    pub return_url: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct LocalLoginForm {
    pub username: String,
    pub email: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct AboutQuery {
    #[serde(rename = "newUser", default)]
    pub new_user: bool,
}

/// Body of the post-login page.
#[derive(Debug, Serialize)]
pub struct AboutPage {
    pub user_id: String,
    pub display_name: Option<String>,
    pub email: Option<String>,
    pub authentication_method: AuthMethodTag,
    pub claims: Vec<Claim>,
    pub platform_headers: Vec<(String, String)>,
    pub environment: RuntimeEnvironment,
    pub classification: ProviderClassification,
    pub new_user: bool,
}

async fn index(MaybeIdentity(identity): MaybeIdentity) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "authenticated": identity.is_some(),
        "name": identity.as_ref().and_then(|i| i.display_name()),
    }))
}

#[tracing::instrument(skip_all)]
async fn login_page(
    State(state): State<AppState>,
    CurrentSession(session): CurrentSession,
    Query(params): Query<ProviderQuery>,
) -> Json<LoginPage> {
    let error_message = match &session {
        Some(session) => session.take(ERROR_MESSAGE_KEY).await.unwrap_or_else(|e| {
            tracing::warn!(error = %e, "Failed to read the login page message");
            None
        }),
        None => None,
    };

    Json(LoginPage {
        providers: state
            .router
            .registry()
            .enabled_keys()
            .into_iter()
            .map(str::to_string)
            .collect(),
        default_provider: state.config.default_provider.clone(),
        error_message,
        simulation_enabled: state.config.simulation_enabled(),
        return_url: params.return_url,
    })
}

#[tracing::instrument(skip_all, fields(provider = ?params.provider))]
async fn initiate_login(
    State(state): State<AppState>,
    cookies: Cookies,
    CurrentSession(session): CurrentSession,
    Origin(origin): Origin,
    Query(params): Query<ProviderQuery>,
) -> Response {
    let outcome = state
        .router
        .dispatch_login(params.provider.as_deref(), &origin, session.as_ref())
        .await;
    apply_outcome(&outcome, &cookies, &state)
}

#[tracing::instrument(skip_all, fields(provider = ?params.provider))]
async fn logout(
    State(state): State<AppState>,
    cookies: Cookies,
    CurrentSession(session): CurrentSession,
    Origin(origin): Origin,
    Query(params): Query<ProviderQuery>,
) -> Response {
    let outcome = state
        .router
        .dispatch_logout(params.provider.as_deref(), &origin, session.as_ref())
        .await;
    apply_outcome(&outcome, &cookies, &state)
}

#[tracing::instrument(skip_all, fields(provider = ?params.provider))]
async fn local_simulation(
    State(state): State<AppState>,
    CurrentSession(session): CurrentSession,
    Query(params): Query<ProviderQuery>,
) -> Result<Response, AuthError> {
    let location = state
        .router
        .begin_simulation(
            session.as_ref(),
            params.provider.as_deref(),
            params.return_url.as_deref(),
        )
        .await?;
    Ok(found(&location))
}

async fn local_login_page(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "action": state.config.local_login_path,
        "fields": ["username", "email"],
    }))
}

#[tracing::instrument(skip_all, fields(username = %form.username))]
async fn local_login(
    State(state): State<AppState>,
    cookies: Cookies,
    Form(form): Form<LocalLoginForm>,
) -> Result<Response, AuthError> {
    let login = state
        .router
        .local_login(&form.username, form.email.as_deref(), state.profiles.as_ref())
        .await?;
    state.cookies.sign_in(
        &cookies,
        &login.identity,
        &ChallengeProperties::default().persistent(true),
    )?;
    Ok(found(&login.location))
}

#[tracing::instrument(skip_all)]
async fn federated_callback(
    State(state): State<AppState>,
    cookies: Cookies,
    CurrentSession(session): CurrentSession,
    Origin(origin): Origin,
    Query(response): Query<AuthenticationResponse>,
) -> Result<Response, AuthError> {
    let oidc = state
        .oidc
        .as_ref()
        .ok_or_else(|| AuthError::config("No federated scheme is configured"))?;
    let session = session.ok_or_else(|| AuthError::session("Session is not available"))?;

    let sign_in = oidc
        .handle_callback(&session, &response, &origin.base())
        .await?;
    state
        .cookies
        .sign_in(&cookies, &sign_in.identity, &sign_in.properties)?;
    if let Some(tokens) = &sign_in.tokens {
        session
            .set_string(SAVED_TOKENS_KEY, &serde_json::to_string(tokens)?)
            .await?;
    }
    tracing::info!(
        user = sign_in.identity.subject_id().unwrap_or(UNKNOWN_SUBJECT),
        target = %sign_in.redirect_target,
        "Federated sign-in completed"
    );
    Ok(found(&sign_in.redirect_target))
}

#[tracing::instrument(skip_all)]
async fn about(
    State(state): State<AppState>,
    AuthenticatedIdentity(identity): AuthenticatedIdentity,
    Origin(origin): Origin,
    headers: HeaderMap,
    Query(params): Query<AboutQuery>,
) -> Json<AboutPage> {
    let classification = classifier::classify(Some(&identity), &headers);
    Json(AboutPage {
        user_id: identity.subject_id().unwrap_or(UNKNOWN_SUBJECT).to_string(),
        display_name: identity.display_name().map(str::to_string),
        email: identity.email().map(str::to_string),
        authentication_method: identity.method(),
        claims: identity.claims().to_vec(),
        platform_headers: classifier::platform_headers(&headers),
        environment: state.router.environment(&origin),
        classification,
        new_user: params.new_user,
    })
}

/// Build the application router with every authentication endpoint mounted.
pub fn build_router(state: AppState) -> Router {
    let config = state.config.clone();
    let mut router = Router::new()
        .route("/", get(index))
        .route("/Index", get(index))
        .route(&config.login_path, get(login_page))
        .route(&format!("{}/initiate", config.login_path), get(initiate_login))
        .route(&config.logout_path, get(logout).post(logout))
        .route(&config.local_login_path, get(local_login_page).post(local_login))
        .route(&config.post_login_path, get(about));

    if config.simulation_enabled() {
        router = router.route(&config.simulation_path, get(local_simulation));
    }
    if let Some(oidc) = &state.oidc {
        router = router.route(&oidc.config().callback_path, get(federated_callback));
    }

    router
        .layer(middleware::from_fn_with_state(state.clone(), authenticate))
        .layer(middleware::from_fn_with_state(state.clone(), attach_session))
        .layer(CookieManagerLayer::new())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request as HttpRequest;

    fn parts(builder: axum::http::request::Builder) -> Parts {
        builder.body(()).unwrap().into_parts().0
    }

    #[test]
    fn test_origin_prefers_forwarded_headers() {
        let origin = request_origin(&parts(
            HttpRequest::builder()
                .uri("/Login")
                .header("host", "internal:8080")
                .header("x-forwarded-proto", "https, http")
                .header("x-forwarded-host", "app.example.net"),
        ));
        assert_eq!(origin.base(), "https://app.example.net");

        let origin = request_origin(&parts(HttpRequest::builder().uri("/")));
        assert_eq!(origin.base(), "http://localhost");
    }

    #[test]
    fn test_found_sets_location() {
        let response = found("/Login?returnUrl=%2FAbout");
        assert_eq!(response.status(), StatusCode::FOUND);
        assert_eq!(
            response.headers().get(header::LOCATION).unwrap(),
            "/Login?returnUrl=%2FAbout"
        );
    }

    #[tokio::test]
    async fn test_server_errors_hide_details() {
        let response = AuthError::internal("db password is hunter2").into_response();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        assert!(!String::from_utf8_lossy(&body).contains("hunter2"));

        let response = AuthError::session("Session is not available").into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_index_reports_anonymous() {
        use tower::ServiceExt;

        let app = build_router(AppState::from_config(AuthConfig::default()).unwrap());
        let response = app
            .oneshot(HttpRequest::builder().uri("/").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(response.headers().get(header::SET_COOKIE).is_some());
    }
}
