//! Provider dispatch for login and logout.
//!
//! The router turns a provider key plus the runtime environment into a redirect.
//! Decisions are pure ([`ProviderDispatchRouter::decide_login`],
//! [`ProviderDispatchRouter::decide_logout`]); the `dispatch_*` methods carry them
//! out against the session and the federated schemes and report the response side
//! effects as a [`DispatchOutcome`].

use crate::auth::ChallengeProperties;
use crate::claims::{AuthMethodTag, Claim, Identity, claim_types};
use crate::errors::{AuthError, Result};
use crate::providers::{DispatchPolicy, ProviderRegistry};
use crate::server::oidc::FederatedSchemes;
use crate::session::{ERROR_MESSAGE_KEY, Session, SimulationRecord};
use crate::storage::{UserProfileStore, ensure_profile};
use chrono::Utc;
use serde::{Deserialize, Serialize};

/// Shown when a federated challenge could not be started.
pub const CHALLENGE_UNAVAILABLE_MESSAGE: &str =
    "Authentication service unavailable. Please try again later.";

/// Shown when a disabled provider is picked.
pub const PROVIDER_DISABLED_MESSAGE: &str =
    "This authentication provider is not currently available.";

/// Marker cookie expired on platform logout to make browsers refresh their jar.
pub const LOGOUT_TRIGGER_COOKIE: &str = "logout-trigger";

/// Headers that keep login and logout redirects out of every cache.
pub const NO_CACHE_HEADERS: [(&str, &str); 3] = [
    ("cache-control", "no-cache, no-store, must-revalidate"),
    ("pragma", "no-cache"),
    ("expires", "0"),
];

/// Default provider key when a request names none.
pub const DEFAULT_PROVIDER: &str = "EasyAuth";

const UNIX_EPOCH_TICKS: i64 = 621_355_968_000_000_000;

/// Current time in 100ns ticks since 0001-01-01, used as a cache buster and in
/// synthetic user ids.
pub fn ticks() -> i64 {
    let now = Utc::now();
    now.timestamp() * 10_000_000 + i64::from(now.timestamp_subsec_nanos() / 100) + UNIX_EPOCH_TICKS
}

/// Whether `url` stays on this site.
pub fn is_local_path(url: &str) -> bool {
    let bytes = url.as_bytes();
    match bytes {
        [b'/'] => true,
        [b'/', second, ..] => *second != b'/' && *second != b'\\',
        _ => false,
    }
}

/// Cookies cleared by the local credential logout besides the identity cookie.
pub fn is_auth_cookie(name: &str) -> bool {
    name.starts_with(".IdOpt.") || name.contains("Identity") || name.contains("Auth")
}

/// Where the application runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuntimeEnvironment {
    /// Developer machine; platform logins are simulated
    Local,
    /// Behind the hosting platform's authentication front end
    Hosted,
}

impl RuntimeEnvironment {
    /// Local when the host is a loopback name or no hosting site name is set,
    /// unless configuration forces one or the other.
    pub fn detect(host: &str, site_name: Option<&str>, forced: Option<Self>) -> Self {
        if let Some(forced) = forced {
            return forced;
        }
        let host = host.to_ascii_lowercase();
        let no_site = site_name.is_none_or(|s| s.trim().is_empty());
        if host.contains("localhost") || host.starts_with("127.0.0.1") || no_site {
            Self::Local
        } else {
            Self::Hosted
        }
    }

    pub fn is_local(&self) -> bool {
        matches!(self, Self::Local)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Local => "local",
            Self::Hosted => "hosted",
        }
    }
}

/// Scheme and host the request arrived on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestOrigin {
    pub scheme: String,
    pub host: String,
}

impl RequestOrigin {
    pub fn new(scheme: impl Into<String>, host: impl Into<String>) -> Self {
        Self {
            scheme: scheme.into(),
            host: host.into(),
        }
    }

    /// `{scheme}://{host}`
    pub fn base(&self) -> String {
        format!("{}://{}", self.scheme, self.host)
    }
}

/// Paths and environment knobs the router needs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchSettings {
    pub default_provider: String,
    pub login_path: String,
    pub simulation_path: String,
    pub post_login_path: String,
    pub post_logout_path: String,
    pub site_name: Option<String>,
    pub forced_environment: Option<RuntimeEnvironment>,
    /// Whether the simulation page is served; platform logins only go there when it is
    pub simulation_enabled: bool,
    pub federated_sign_out_url: Option<String>,
}

impl Default for DispatchSettings {
    fn default() -> Self {
        Self {
            default_provider: DEFAULT_PROVIDER.to_string(),
            login_path: "/Login".to_string(),
            simulation_path: "/LocalSimulation".to_string(),
            post_login_path: "/About".to_string(),
            post_logout_path: "/".to_string(),
            site_name: None,
            forced_environment: None,
            simulation_enabled: true,
            federated_sign_out_url: None,
        }
    }
}

/// What a login request should do.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoginDecision {
    FederatedChallenge {
        scheme: String,
        properties: ChallengeProperties,
    },
    Redirect {
        location: String,
    },
    Disabled {
        provider: String,
    },
}

/// What a logout request should do.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogoutDecision {
    /// Local credential login: drop every auth cookie
    LocalCookie { location: String },
    /// Redirect to the federated end-session endpoint
    FederatedSignOut { scheme: String, post_logout: String },
    /// Simulated platform login: clear the session
    PlatformLocal { location: String },
    /// Redirect to the platform logout endpoint
    PlatformHosted { location: String },
    Disabled { location: String },
}

/// Response effects of a dispatched login or logout.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DispatchOutcome {
    pub location: String,
    /// User-facing message, also stored in the session when one exists
    pub message: Option<String>,
    pub clear_identity_cookie: bool,
    pub clear_auth_cookies: bool,
    pub expire_logout_trigger: bool,
    pub no_cache: bool,
}

impl DispatchOutcome {
    fn new(location: impl Into<String>) -> Self {
        Self {
            location: location.into(),
            clear_identity_cookie: true,
            no_cache: true,
            ..Self::default()
        }
    }
}

/// Result of a local credential login.
#[derive(Debug, Clone)]
pub struct LocalLogin {
    pub identity: Identity,
    pub new_user: bool,
    pub location: String,
}

/// Routes login and logout requests to the right provider.
#[derive(Debug, Clone)]
pub struct ProviderDispatchRouter {
    registry: ProviderRegistry,
    federated: FederatedSchemes,
    settings: DispatchSettings,
}

impl ProviderDispatchRouter {
    pub fn new(
        registry: ProviderRegistry,
        federated: FederatedSchemes,
        settings: DispatchSettings,
    ) -> Self {
        Self {
            registry,
            federated,
            settings,
        }
    }

    pub fn registry(&self) -> &ProviderRegistry {
        &self.registry
    }

    pub fn settings(&self) -> &DispatchSettings {
        &self.settings
    }

    pub fn environment(&self, origin: &RequestOrigin) -> RuntimeEnvironment {
        RuntimeEnvironment::detect(
            &origin.host,
            self.settings.site_name.as_deref(),
            self.settings.forced_environment,
        )
    }

    /// Whether platform logins and logouts are simulated for this request.
    pub fn simulates(&self, origin: &RequestOrigin) -> bool {
        self.settings.simulation_enabled && self.environment(origin).is_local()
    }

    fn provider_key<'a>(&'a self, provider: Option<&'a str>) -> &'a str {
        provider
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .unwrap_or(&self.settings.default_provider)
    }

    fn platform_login(&self, alias: &str, origin: &RequestOrigin) -> String {
        if self.simulates(origin) {
            format!(
                "{}?provider={}&returnUrl={}",
                self.settings.simulation_path,
                urlencoding::encode(alias),
                urlencoding::encode(&self.settings.post_login_path)
            )
        } else {
            format!(
                "{}/.auth/login/{}?post_login_redirect_uri={}&t={}",
                origin.base(),
                alias,
                self.settings.post_login_path,
                ticks()
            )
        }
    }

    /// Decide what a login with `provider` should do.
    pub fn decide_login(
        &self,
        provider: Option<&str>,
        origin: &RequestOrigin,
    ) -> Result<LoginDecision> {
        let resolved = self.registry.resolve(self.provider_key(provider))?;
        let decision = match resolved.policy {
            DispatchPolicy::FederatedChallenge { scheme } => LoginDecision::FederatedChallenge {
                scheme: scheme.clone(),
                properties: ChallengeProperties::with_redirect(&self.settings.post_login_path)
                    .allow_refresh(true)
                    .persistent(true),
            },
            DispatchPolicy::LocalRedirect { path } => LoginDecision::Redirect {
                location: path.clone(),
            },
            DispatchPolicy::PlatformRedirect { alias } => LoginDecision::Redirect {
                location: self.platform_login(alias, origin),
            },
            DispatchPolicy::Disabled => LoginDecision::Disabled {
                provider: resolved.key.clone(),
            },
        };
        tracing::info!(provider = %resolved.key, fallback = resolved.fallback, ?decision, "Login dispatch decided");
        Ok(decision)
    }

    /// Decide what a logout for `provider` should do.
    pub fn decide_logout(
        &self,
        provider: Option<&str>,
        origin: &RequestOrigin,
    ) -> Result<LogoutDecision> {
        let resolved = self.registry.resolve(self.provider_key(provider))?;
        let home = self.settings.post_logout_path.clone();
        let decision = match resolved.policy {
            DispatchPolicy::LocalRedirect { .. } => LogoutDecision::LocalCookie { location: home },
            DispatchPolicy::FederatedChallenge { scheme } => LogoutDecision::FederatedSignOut {
                scheme: scheme.clone(),
                post_logout: self.settings.federated_sign_out_url.clone().unwrap_or(home),
            },
            DispatchPolicy::PlatformRedirect { .. } if self.simulates(origin) => {
                LogoutDecision::PlatformLocal { location: home }
            }
            DispatchPolicy::PlatformRedirect { .. } => LogoutDecision::PlatformHosted {
                location: format!(
                    "{}/.auth/logout?post_logout_redirect_uri={}&t={}",
                    origin.base(),
                    home,
                    ticks()
                ),
            },
            DispatchPolicy::Disabled => LogoutDecision::Disabled { location: home },
        };
        tracing::info!(provider = %resolved.key, ?decision, "Logout dispatch decided");
        Ok(decision)
    }

    async fn flash(session: Option<&Session>, message: &str) {
        if let Some(session) = session
            && let Err(e) = session.set_string(ERROR_MESSAGE_KEY, message).await
        {
            tracing::warn!(error = %e, "Failed to store the login page message");
        }
    }

    async fn challenge(
        &self,
        scheme: &str,
        session: Option<&Session>,
        properties: &ChallengeProperties,
        origin: &RequestOrigin,
    ) -> Result<String> {
        let challenger = self
            .federated
            .get(scheme)
            .ok_or_else(|| AuthError::upstream_challenge(scheme, "scheme is not configured"))?;
        let session = session.ok_or_else(|| AuthError::session("no session for correlation"))?;
        challenger.challenge(session, properties, &origin.base()).await
    }

    /// Carry out a login. Never fails: problems end on the login page with a message.
    pub async fn dispatch_login(
        &self,
        provider: Option<&str>,
        origin: &RequestOrigin,
        session: Option<&Session>,
    ) -> DispatchOutcome {
        let login_page = |message: &str| DispatchOutcome {
            message: Some(message.to_string()),
            ..DispatchOutcome::new(&self.settings.login_path)
        };

        let outcome = match self.decide_login(provider, origin) {
            Ok(LoginDecision::Redirect { location }) => DispatchOutcome::new(location),
            Ok(LoginDecision::Disabled { provider }) => {
                tracing::warn!(%provider, "Attempted to use disabled provider");
                login_page(PROVIDER_DISABLED_MESSAGE)
            }
            Ok(LoginDecision::FederatedChallenge { scheme, properties }) => {
                match self.challenge(&scheme, session, &properties, origin).await {
                    Ok(location) => DispatchOutcome::new(location),
                    Err(e) => {
                        tracing::error!(%scheme, error = %e, "Federated challenge failed");
                        login_page(CHALLENGE_UNAVAILABLE_MESSAGE)
                    }
                }
            }
            Err(e) => {
                tracing::error!(error = %e, "Login dispatch failed");
                login_page(CHALLENGE_UNAVAILABLE_MESSAGE)
            }
        };

        if let Some(message) = outcome.message.as_deref() {
            Self::flash(session, message).await;
        }
        outcome
    }

    /// Carry out a logout. Always completes; branch failures are logged.
    pub async fn dispatch_logout(
        &self,
        provider: Option<&str>,
        origin: &RequestOrigin,
        session: Option<&Session>,
    ) -> DispatchOutcome {
        let home = self.settings.post_logout_path.clone();
        let decision = match self.decide_logout(provider, origin) {
            Ok(decision) => decision,
            Err(e) => {
                tracing::error!(error = %e, "Logout dispatch failed, signing out locally");
                return DispatchOutcome::new(home);
            }
        };

        match decision {
            LogoutDecision::LocalCookie { location } => DispatchOutcome {
                clear_auth_cookies: true,
                ..DispatchOutcome::new(location)
            },
            LogoutDecision::FederatedSignOut {
                scheme,
                post_logout,
            } => {
                let location = match self.federated.get(&scheme) {
                    Some(challenger) => {
                        match challenger.sign_out(&post_logout, &origin.base()).await {
                            Ok(location) => location,
                            Err(e) => {
                                tracing::error!(%scheme, error = %e, "Federated sign-out failed");
                                home
                            }
                        }
                    }
                    None => {
                        tracing::warn!(%scheme, "Federated scheme not configured, signing out locally");
                        home
                    }
                };
                DispatchOutcome::new(location)
            }
            LogoutDecision::PlatformLocal { location } => {
                Self::clear_session(session).await;
                DispatchOutcome {
                    expire_logout_trigger: true,
                    ..DispatchOutcome::new(location)
                }
            }
            LogoutDecision::PlatformHosted { location } => DispatchOutcome {
                expire_logout_trigger: true,
                ..DispatchOutcome::new(location)
            },
            LogoutDecision::Disabled { location } => {
                Self::clear_session(session).await;
                DispatchOutcome::new(location)
            }
        }
    }

    async fn clear_session(session: Option<&Session>) {
        if let Some(session) = session
            && let Err(e) = session.clear().await
        {
            tracing::warn!(error = %e, "Failed to clear session during logout");
        }
    }

    /// Record a simulated platform login in the session and send the browser back
    /// to `return_url` with the simulation parameters.
    pub async fn begin_simulation(
        &self,
        session: Option<&Session>,
        provider: Option<&str>,
        return_url: Option<&str>,
    ) -> Result<String> {
        let session = session.ok_or_else(|| AuthError::session("Session is not available"))?;
        let provider = provider
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .unwrap_or(crate::providers::DEFAULT_PLATFORM_PROVIDER);
        let return_url = match return_url.filter(|u| !u.is_empty()) {
            Some(url) if is_local_path(url) => url,
            Some(url) => {
                tracing::warn!(return_url = url, "Ignoring non-local return URL");
                "/"
            }
            None => "/",
        };

        let user_id = format!("{provider}_user_{}", ticks());
        let record = SimulationRecord::new(provider, Some(user_id.clone()))
            .ok_or_else(|| AuthError::InvalidInput("provider is required".to_string()))?;
        record.save(session).await?;
        tracing::info!(provider, user_id = %user_id, "Simulated login recorded");

        let separator = if return_url.contains('?') { '&' } else { '?' };
        Ok(format!(
            "{return_url}{separator}simulate_provider={}&simulate_user={}",
            urlencoding::encode(provider),
            urlencoding::encode(&user_id)
        ))
    }

    /// Local credential login for the `simple` provider.
    pub async fn local_login(
        &self,
        username: &str,
        email: Option<&str>,
        profiles: &dyn UserProfileStore,
    ) -> Result<LocalLogin> {
        let username = username.trim();
        if username.is_empty() {
            return Err(AuthError::InvalidInput("Username is required.".to_string()));
        }
        let email = match email.map(str::trim).filter(|e| !e.is_empty()) {
            Some(email) => email.to_string(),
            None if username.contains('@') => username.to_string(),
            None => format!("{username}@local.com"),
        };

        let identity = Identity::new(
            vec![
                Claim::new(claim_types::NAME, username),
                Claim::new(claim_types::EMAIL, email.as_str()),
                Claim::new(claim_types::NAME_IDENTIFIER, username),
            ],
            AuthMethodTag::Cookie,
        );

        let new_user = match ensure_profile(profiles, username, &email).await {
            Ok(created) => created,
            Err(e) => {
                tracing::error!(username, error = %e, "Failed to ensure user profile exists");
                false
            }
        };

        let location = if new_user {
            format!("{}?newUser=true", self.settings.post_login_path)
        } else {
            "/Index".to_string()
        };
        tracing::info!(username, new_user, "Local login succeeded");
        Ok(LocalLogin {
            identity,
            new_user,
            location,
        })
    }
}
