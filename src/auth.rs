//! The authentication scheme adapter.
//!
//! Folds an ordered list of [`IdentityResolver`]s over a request. Platform headers
//! come first so that a genuinely hosted request is never overridden by leftover
//! simulation state in the session.

use crate::claims::UNKNOWN_SUBJECT;
use crate::methods::{
    AuthenticationResult, HeaderIdentityExtractor, IdentityResolver, RequestContext,
    SimulatedIdentityProvider,
};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// Default scheme name for the platform adapter.
pub const PLATFORM_SCHEME: &str = "EasyAuth";

/// Query parameter used to carry the original target through the login page.
pub const RETURN_URL_PARAM: &str = "returnUrl";

/// Properties attached to a challenge or sign-out.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChallengeProperties {
    /// Where the user should land once authenticated
    pub redirect_uri: Option<String>,
    /// Whether the issued session may be refreshed
    pub allow_refresh: bool,
    /// Whether the issued session survives the browser session
    pub is_persistent: bool,
    /// Free-form extra values
    pub items: HashMap<String, String>,
}

impl ChallengeProperties {
    pub fn with_redirect(redirect_uri: impl Into<String>) -> Self {
        Self {
            redirect_uri: Some(redirect_uri.into()),
            ..Self::default()
        }
    }

    pub fn allow_refresh(mut self, allow: bool) -> Self {
        self.allow_refresh = allow;
        self
    }

    pub fn persistent(mut self, persistent: bool) -> Self {
        self.is_persistent = persistent;
        self
    }
}

/// Resolves identities for a request and issues login challenges.
#[derive(Clone)]
pub struct AuthenticationScheme {
    name: String,
    login_path: String,
    resolvers: Vec<Arc<dyn IdentityResolver>>,
}

impl fmt::Debug for AuthenticationScheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthenticationScheme")
            .field("name", &self.name)
            .field("login_path", &self.login_path)
            .field("resolvers", &self.resolver_names())
            .finish()
    }
}

impl AuthenticationScheme {
    /// Create a scheme with no resolvers.
    pub fn new(name: impl Into<String>, login_path: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            login_path: login_path.into(),
            resolvers: Vec::new(),
        }
    }

    /// Platform header extraction, followed by simulation when enabled.
    pub fn platform(login_path: impl Into<String>, simulation_enabled: bool) -> Self {
        let scheme = Self::new(PLATFORM_SCHEME, login_path)
            .with_resolver(Arc::new(HeaderIdentityExtractor::new()));
        if simulation_enabled {
            scheme.with_resolver(Arc::new(SimulatedIdentityProvider::new()))
        } else {
            scheme
        }
    }

    /// Append a resolver to the end of the chain.
    pub fn with_resolver(mut self, resolver: Arc<dyn IdentityResolver>) -> Self {
        self.resolvers.push(resolver);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn login_path(&self) -> &str {
        &self.login_path
    }

    pub fn resolver_names(&self) -> Vec<&str> {
        self.resolvers.iter().map(|r| r.name()).collect()
    }

    /// Resolve the request's identity. The first success wins.
    ///
    /// A failing resolver (a malformed principal header, an unreadable session) is
    /// logged and the next resolver gets its turn.
    pub async fn authenticate(&self, request: &RequestContext) -> AuthenticationResult {
        for resolver in &self.resolvers {
            match resolver.resolve(request).await {
                AuthenticationResult::Success(identity) => {
                    return AuthenticationResult::Success(identity.ensure_subject(UNKNOWN_SUBJECT));
                }
                AuthenticationResult::NoResult => continue,
                AuthenticationResult::Failure(e) => {
                    if e.is_recoverable() {
                        tracing::warn!(
                            scheme = %self.name,
                            resolver = resolver.name(),
                            error = %e,
                            "Resolver failed, trying next mechanism"
                        );
                    } else {
                        tracing::error!(
                            scheme = %self.name,
                            resolver = resolver.name(),
                            error = %e,
                            "Resolver failed, trying next mechanism"
                        );
                    }
                }
            }
        }

        tracing::debug!(scheme = %self.name, "No identity signal found");
        AuthenticationResult::NoResult
    }

    /// Location of the login entry point, carrying the original target when known.
    pub fn challenge(&self, properties: &ChallengeProperties) -> String {
        match properties.redirect_uri.as_deref().filter(|u| !u.is_empty()) {
            Some(target) => format!(
                "{}?{}={}",
                self.login_path,
                RETURN_URL_PARAM,
                urlencoding::encode(target)
            ),
            None => self.login_path.clone(),
        }
    }
}
