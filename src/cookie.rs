//! Signed identity cookie.
//!
//! The cookie value is `base64url(json payload) "." base64url(hmac-sha256)`. The
//! payload carries the identity's claims and an expiry; a cookie whose signature or
//! expiry does not check out is ignored.

use crate::auth::ChallengeProperties;
use crate::claims::Identity;
use crate::errors::{AuthError, Result};
use crate::methods::{AuthenticationResult, IdentityResolver, RequestContext};
use async_trait::async_trait;
use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use chrono::{Duration, Utc};
use ring::hmac;
use ring::rand::{SecureRandom, SystemRandom};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tower_cookies::cookie::time::Duration as CookieDuration;
use tower_cookies::cookie::{Cookie, SameSite};
use tower_cookies::Cookies;

/// Default name of the identity cookie.
pub const DEFAULT_COOKIE_NAME: &str = ".IdOpt.Identity";

/// Cookie scheme settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CookieSchemeConfig {
    pub name: String,
    /// HMAC key material. Empty means a random per-process key.
    pub secret: String,
    pub lifetime_days: i64,
    pub secure: bool,
    pub login_path: String,
    pub logout_path: String,
}

impl Default for CookieSchemeConfig {
    fn default() -> Self {
        Self {
            name: DEFAULT_COOKIE_NAME.to_string(),
            secret: String::new(),
            lifetime_days: 30,
            secure: false,
            login_path: "/Login".to_string(),
            logout_path: "/Logout".to_string(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct CookiePayload {
    identity: Identity,
    issued_at: i64,
    expires_at: i64,
    #[serde(default)]
    persistent: bool,
}

/// Issues and verifies the identity cookie.
pub struct CookieScheme {
    config: CookieSchemeConfig,
    key: hmac::Key,
}

impl fmt::Debug for CookieScheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CookieScheme")
            .field("name", &self.config.name)
            .field("lifetime_days", &self.config.lifetime_days)
            .finish()
    }
}

impl CookieScheme {
    pub fn new(config: CookieSchemeConfig) -> Result<Self> {
        if config.lifetime_days <= 0 {
            return Err(AuthError::config("Cookie lifetime must be positive"));
        }
        let key = if config.secret.is_empty() {
            tracing::warn!("No cookie secret configured, identity cookies will not survive a restart");
            let mut bytes = [0u8; 32];
            SystemRandom::new()
                .fill(&mut bytes)
                .map_err(|_| AuthError::internal("Failed to generate cookie key"))?;
            hmac::Key::new(hmac::HMAC_SHA256, &bytes)
        } else {
            hmac::Key::new(hmac::HMAC_SHA256, config.secret.as_bytes())
        };
        Ok(Self { config, key })
    }

    pub fn config(&self) -> &CookieSchemeConfig {
        &self.config
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    /// Serialize and sign an identity.
    pub fn encode(&self, identity: &Identity, properties: &ChallengeProperties) -> Result<String> {
        let now = Utc::now();
        let payload = CookiePayload {
            identity: identity.clone(),
            issued_at: now.timestamp(),
            expires_at: (now + Duration::days(self.config.lifetime_days)).timestamp(),
            persistent: properties.is_persistent,
        };
        let body = URL_SAFE_NO_PAD.encode(serde_json::to_vec(&payload)?);
        let tag = hmac::sign(&self.key, body.as_bytes());
        Ok(format!("{body}.{}", URL_SAFE_NO_PAD.encode(tag.as_ref())))
    }

    /// Verify a cookie value, returning the identity it carries.
    pub fn decode(&self, value: &str) -> Result<Identity> {
        let rejected = || AuthError::Unauthorized("identity cookie rejected".to_string());

        let (body, signature) = value.split_once('.').ok_or_else(rejected)?;
        let signature = URL_SAFE_NO_PAD.decode(signature).map_err(|_| rejected())?;
        hmac::verify(&self.key, body.as_bytes(), &signature).map_err(|_| rejected())?;

        let bytes = URL_SAFE_NO_PAD.decode(body).map_err(|_| rejected())?;
        let payload: CookiePayload = serde_json::from_slice(&bytes)?;
        if payload.expires_at <= Utc::now().timestamp() {
            return Err(AuthError::Unauthorized("identity cookie expired".to_string()));
        }
        Ok(payload.identity)
    }

    /// Issue the cookie for an identity.
    pub fn sign_in(
        &self,
        cookies: &Cookies,
        identity: &Identity,
        properties: &ChallengeProperties,
    ) -> Result<()> {
        let value = self.encode(identity, properties)?;
        let mut builder = Cookie::build((self.config.name.clone(), value))
            .path("/")
            .http_only(true)
            .secure(self.config.secure)
            .same_site(SameSite::Lax);
        if properties.is_persistent {
            builder = builder.max_age(CookieDuration::days(self.config.lifetime_days));
        }
        cookies.add(builder.build());
        tracing::info!(
            cookie = %self.config.name,
            user = identity.subject_id().unwrap_or_default(),
            "Identity cookie issued"
        );
        Ok(())
    }

    /// Expire the identity cookie.
    pub fn sign_out(&self, cookies: &Cookies) {
        cookies.add(removal_cookie(&self.config.name, self.config.secure));
    }

    pub fn read(&self, cookies: &Cookies) -> Option<Identity> {
        let cookie = cookies.get(&self.config.name)?;
        self.decode(cookie.value()).ok()
    }
}

/// An already-expired cookie that makes the browser drop `name`.
pub fn removal_cookie(name: &str, secure: bool) -> Cookie<'static> {
    Cookie::build(name.to_string())
        .path("/")
        .http_only(true)
        .secure(secure)
        .same_site(SameSite::Lax)
        .max_age(CookieDuration::ZERO)
        .build()
}

/// Resolves identities from the signed cookie.
#[derive(Debug, Clone)]
pub struct CookieIdentityResolver {
    scheme: Arc<CookieScheme>,
}

impl CookieIdentityResolver {
    pub fn new(scheme: Arc<CookieScheme>) -> Self {
        Self { scheme }
    }

    fn find_value(&self, request: &RequestContext) -> Option<String> {
        request
            .headers()
            .get_all(http::header::COOKIE)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .flat_map(Cookie::split_parse)
            .filter_map(|c| c.ok())
            .find(|c| c.name() == self.scheme.name())
            .map(|c| c.value().to_string())
    }
}

#[async_trait]
impl IdentityResolver for CookieIdentityResolver {
    fn name(&self) -> &str {
        "cookie"
    }

    async fn resolve(&self, request: &RequestContext) -> AuthenticationResult {
        let Some(value) = self.find_value(request) else {
            return AuthenticationResult::NoResult;
        };
        match self.scheme.decode(&value) {
            Ok(identity) => AuthenticationResult::Success(identity),
            Err(e) => AuthenticationResult::Failure(e),
        }
    }
}
