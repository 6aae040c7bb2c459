//! Federated OIDC relying party.
//!
//! [`OidcScheme`] implements the authorization code flow against a hosted identity
//! service: it builds the authorize redirect, keeps the correlation data in the
//! session, exchanges the returned code at the token endpoint and validates both
//! responses with a [`RelaxedProtocolValidator`].

use super::validator::{
    AuthenticationResponse, ProtocolValidationPolicy, ProtocolValidator,
    RelaxedProtocolValidator, TokenEndpointResponse, ValidationContext,
};
use crate::auth::ChallengeProperties;
use crate::claims::{AuthMethodTag, Identity, claim_types};
use crate::errors::{AuthError, ProtocolValidationError, Result};
use crate::session::Session;
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use url::Url;

/// Session key prefix for the per-challenge correlation record.
pub const CORRELATION_KEY_PREFIX: &str = "oidc.correlation.";

/// Session key naming the state of the most recent challenge.
pub const PENDING_STATE_KEY: &str = "oidc.pending_state";

/// Default name of the federated B2C scheme.
pub const DEFAULT_SCHEME_NAME: &str = "AzureB2C";

/// Settings for one federated OIDC scheme.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OidcSchemeConfig {
    pub scheme_name: String,
    /// Base URL of the identity service, including the trailing slash
    pub instance: String,
    /// Tenant domain or id
    pub tenant: String,
    /// Sign-up/sign-in user flow
    pub policy: String,
    pub client_id: String,
    pub client_secret: Option<String>,
    pub callback_path: String,
    pub signed_out_callback_path: String,
    /// Where to land after the federated sign-out completes
    pub sign_out_url: Option<String>,
    pub authorization_endpoint: Option<String>,
    pub token_endpoint: Option<String>,
    pub end_session_endpoint: Option<String>,
    pub scopes: Vec<String>,
    /// Keep the raw token response on successful sign-in
    pub save_tokens: bool,
    pub validation: ProtocolValidationPolicy,
    pub request_timeout_secs: u64,
}

impl Default for OidcSchemeConfig {
    fn default() -> Self {
        Self {
            scheme_name: DEFAULT_SCHEME_NAME.to_string(),
            instance: String::new(),
            tenant: String::new(),
            policy: String::new(),
            client_id: String::new(),
            client_secret: None,
            callback_path: "/signin-oidc".to_string(),
            signed_out_callback_path: "/signout-callback-oidc".to_string(),
            sign_out_url: None,
            authorization_endpoint: None,
            token_endpoint: None,
            end_session_endpoint: None,
            scopes: vec!["openid".to_string(), "profile".to_string()],
            save_tokens: false,
            validation: ProtocolValidationPolicy::id_token_only(),
            request_timeout_secs: 30,
        }
    }
}

impl OidcSchemeConfig {
    /// `{instance}{tenant}/{policy}/v2.0/`
    pub fn authority(&self) -> String {
        format!("{}{}/{}/v2.0/", self.instance, self.tenant, self.policy)
    }

    fn derived_endpoint(&self, name: &str) -> String {
        format!(
            "{}{}/{}/oauth2/v2.0/{}",
            self.instance, self.tenant, self.policy, name
        )
    }

    pub fn authorization_endpoint(&self) -> String {
        self.authorization_endpoint
            .clone()
            .unwrap_or_else(|| self.derived_endpoint("authorize"))
    }

    pub fn token_endpoint(&self) -> String {
        self.token_endpoint
            .clone()
            .unwrap_or_else(|| self.derived_endpoint("token"))
    }

    pub fn end_session_endpoint(&self) -> String {
        self.end_session_endpoint
            .clone()
            .unwrap_or_else(|| self.derived_endpoint("logout"))
    }

    pub fn validate(&self) -> Result<()> {
        for (field, value) in [
            ("instance", &self.instance),
            ("tenant", &self.tenant),
            ("policy", &self.policy),
            ("client_id", &self.client_id),
        ] {
            if value.trim().is_empty() {
                return Err(AuthError::config(format!(
                    "Federated scheme '{}' is missing {field}",
                    self.scheme_name
                )));
            }
        }
        if !self.callback_path.starts_with('/') {
            return Err(AuthError::config("callback_path must start with '/'"));
        }
        Url::parse(&self.authorization_endpoint())
            .map_err(|e| AuthError::config(format!("Invalid authorization endpoint: {e}")))?;
        Ok(())
    }
}

/// A scheme the dispatch router can challenge and sign out of.
#[async_trait]
pub trait FederatedChallenger: Send + Sync {
    fn scheme_name(&self) -> &str;

    /// Start a sign-in, returning the location to redirect the browser to.
    async fn challenge(
        &self,
        session: &Session,
        properties: &ChallengeProperties,
        origin: &str,
    ) -> Result<String>;

    /// Location of the federated end-session endpoint.
    async fn sign_out(&self, post_logout_redirect: &str, origin: &str) -> Result<String>;
}

/// Registered federated schemes by name.
#[derive(Clone, Default)]
pub struct FederatedSchemes {
    schemes: HashMap<String, Arc<dyn FederatedChallenger>>,
}

impl fmt::Debug for FederatedSchemes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FederatedSchemes")
            .field("schemes", &self.schemes.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl FederatedSchemes {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, challenger: Arc<dyn FederatedChallenger>) {
        self.schemes
            .insert(challenger.scheme_name().to_string(), challenger);
    }

    pub fn with(mut self, challenger: Arc<dyn FederatedChallenger>) -> Self {
        self.register(challenger);
        self
    }

    pub fn get(&self, name: &str) -> Option<&Arc<dyn FederatedChallenger>> {
        self.schemes.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.schemes.contains_key(name)
    }
}

/// What the challenge stored for the callback to pick up.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct Correlation {
    nonce: String,
    redirect_target: Option<String>,
    redirect_uri: String,
    #[serde(default)]
    persistent: bool,
    #[serde(default)]
    allow_refresh: bool,
}

/// Outcome of a successful callback.
#[derive(Debug, Clone)]
pub struct FederatedSignIn {
    pub identity: Identity,
    /// Where the challenge asked to land afterwards
    pub redirect_target: String,
    pub properties: ChallengeProperties,
    /// Present only when the scheme is configured to save tokens
    pub tokens: Option<TokenEndpointResponse>,
}

#[derive(Debug, Deserialize)]
struct TokenErrorBody {
    error: String,
    error_description: Option<String>,
}

/// Generate a random state parameter for OIDC flows.
pub fn generate_state() -> String {
    use rand::Rng;
    let mut rng = rand::thread_rng();
    (0..32)
        .map(|_| rng.sample(rand::distributions::Alphanumeric) as char)
        .collect()
}

/// Authorization code flow against one hosted identity service.
pub struct OidcScheme<V = RelaxedProtocolValidator> {
    config: OidcSchemeConfig,
    validator: V,
    http: Client,
}

impl<V> fmt::Debug for OidcScheme<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OidcScheme")
            .field("scheme_name", &self.config.scheme_name)
            .field("authority", &self.config.authority())
            .finish()
    }
}

impl OidcScheme {
    /// Build a scheme validated by the policy from its configuration.
    pub fn new(config: OidcSchemeConfig) -> Result<Self> {
        let validator = RelaxedProtocolValidator::new(config.validation);
        Self::with_validator(config, validator)
    }
}

impl<V: ProtocolValidator> OidcScheme<V> {
    pub fn with_validator(config: OidcSchemeConfig, validator: V) -> Result<Self> {
        config.validate()?;
        let http = Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .map_err(|e| AuthError::config(format!("Failed to create HTTP client: {e}")))?;
        Ok(Self {
            config,
            validator,
            http,
        })
    }

    pub fn config(&self) -> &OidcSchemeConfig {
        &self.config
    }

    fn callback_uri(&self, origin: &str) -> String {
        format!("{}{}", origin.trim_end_matches('/'), self.config.callback_path)
    }

    /// Build the authorize URL and remember the correlation under the state.
    pub async fn begin_challenge(
        &self,
        session: &Session,
        properties: &ChallengeProperties,
        origin: &str,
    ) -> Result<String> {
        let state = generate_state();
        let correlation = Correlation {
            nonce: uuid::Uuid::new_v4().simple().to_string(),
            redirect_target: properties.redirect_uri.clone(),
            redirect_uri: self.callback_uri(origin),
            persistent: properties.is_persistent,
            allow_refresh: properties.allow_refresh,
        };

        let mut url = Url::parse(&self.config.authorization_endpoint())
            .map_err(|e| AuthError::config(format!("Invalid authorization endpoint: {e}")))?;
        url.query_pairs_mut()
            .append_pair("client_id", &self.config.client_id)
            .append_pair("response_type", "code")
            .append_pair("response_mode", "query")
            .append_pair("redirect_uri", &correlation.redirect_uri)
            .append_pair("scope", &self.config.scopes.join(" "))
            .append_pair("state", &state)
            .append_pair("nonce", &correlation.nonce);

        session
            .set_string(
                &format!("{CORRELATION_KEY_PREFIX}{state}"),
                &serde_json::to_string(&correlation)?,
            )
            .await?;
        session.set_string(PENDING_STATE_KEY, &state).await?;

        tracing::info!(scheme = %self.config.scheme_name, "Redirecting to federated authorize endpoint");
        Ok(url.into())
    }

    /// Finish the flow started by [`begin_challenge`](Self::begin_challenge).
    ///
    /// Only code-flow responses are accepted: identity claims come from the token
    /// endpoint, never from parameters the browser delivered. The response must
    /// belong to a challenge issued in this session.
    pub async fn handle_callback(
        &self,
        session: &Session,
        response: &AuthenticationResponse,
        origin: &str,
    ) -> Result<FederatedSignIn> {
        let Some((state, correlation)) = self.find_correlation(session, response).await? else {
            self.validator
                .validate_authentication_response(response, &ValidationContext::new(None, None))?;
            tracing::warn!(scheme = %self.config.scheme_name, "No pending challenge for callback");
            return Err(ProtocolValidationError::UnknownCorrelation.into());
        };

        let context = ValidationContext::new(Some(state), Some(correlation.nonce.clone()));
        self.validator
            .validate_authentication_response(response, &context)?;

        let Some(code) = response.code.as_deref().filter(|c| !c.is_empty()) else {
            tracing::warn!(
                scheme = %self.config.scheme_name,
                id_token = response.id_token.is_some(),
                "Rejecting callback without an authorization code"
            );
            return Err(ProtocolValidationError::MissingAuthorizationCode.into());
        };

        tracing::info!(scheme = %self.config.scheme_name, "Authorization code received");
        let redirect_uri = if correlation.redirect_uri.is_empty() {
            self.callback_uri(origin)
        } else {
            correlation.redirect_uri.clone()
        };
        let tokens = self.exchange_code(code, &redirect_uri).await?;
        let claims = self.validator.validate_token_response(&tokens, &context)?;

        let identity = Identity::new(claims.to_claims(), AuthMethodTag::Federated)
            .with_name_claim_type(claim_types::OIDC_NAME);
        tracing::info!(
            scheme = %self.config.scheme_name,
            user = identity.display_name().unwrap_or_default(),
            "Federated token validated"
        );

        let redirect_target = correlation
            .redirect_target
            .unwrap_or_else(|| "/".to_string());
        Ok(FederatedSignIn {
            identity,
            properties: ChallengeProperties::with_redirect(redirect_target.clone())
                .allow_refresh(correlation.allow_refresh)
                .persistent(correlation.persistent),
            redirect_target,
            tokens: Some(tokens).filter(|_| self.config.save_tokens),
        })
    }

    /// Consume the correlation the challenge stored for this response.
    ///
    /// The echoed state selects it. When state enforcement is off, a response whose
    /// state is missing or unknown falls back to the latest pending challenge of the
    /// session; the validator then decides whether the state difference is tolerated.
    async fn find_correlation(
        &self,
        session: &Session,
        response: &AuthenticationResponse,
    ) -> Result<Option<(String, Correlation)>> {
        if let Some(state) = response.state.as_deref().filter(|s| !s.is_empty())
            && let Some(correlation) = self.take_correlation(session, state).await?
        {
            if session.get_string(PENDING_STATE_KEY).await?.as_deref() == Some(state) {
                session.remove(PENDING_STATE_KEY).await?;
            }
            return Ok(Some((state.to_string(), correlation)));
        }

        if self.config.validation.require_state {
            return Ok(None);
        }
        let Some(pending) = session.take(PENDING_STATE_KEY).await? else {
            return Ok(None);
        };
        Ok(self
            .take_correlation(session, &pending)
            .await?
            .map(|correlation| (pending, correlation)))
    }

    async fn take_correlation(&self, session: &Session, state: &str) -> Result<Option<Correlation>> {
        session
            .take(&format!("{CORRELATION_KEY_PREFIX}{state}"))
            .await?
            .map(|raw| serde_json::from_str::<Correlation>(&raw))
            .transpose()
            .map_err(Into::into)
    }

    async fn exchange_code(&self, code: &str, redirect_uri: &str) -> Result<TokenEndpointResponse> {
        let scope = self.config.scopes.join(" ");
        let mut form = vec![
            ("grant_type", "authorization_code"),
            ("code", code),
            ("redirect_uri", redirect_uri),
            ("client_id", self.config.client_id.as_str()),
            ("scope", scope.as_str()),
        ];
        if let Some(secret) = self.config.client_secret.as_deref() {
            form.push(("client_secret", secret));
        }

        let response = self
            .http
            .post(self.config.token_endpoint())
            .form(&form)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            tracing::error!(scheme = %self.config.scheme_name, %status, "Token endpoint rejected the code");
            return Err(match serde_json::from_str::<TokenErrorBody>(&body) {
                Ok(err) => ProtocolValidationError::ProviderError {
                    error: err.error,
                    description: err.error_description,
                }
                .into(),
                Err(_) => AuthError::upstream_challenge(
                    &self.config.scheme_name,
                    format!("token endpoint returned {status}"),
                ),
            });
        }

        let tokens: TokenEndpointResponse = response.json().await?;
        if tokens.access_token.is_none() {
            tracing::info!(scheme = %self.config.scheme_name, "No access token in token response");
        }
        Ok(tokens)
    }

    /// End-session URL carrying the post-logout target.
    pub fn sign_out_url(&self, post_logout_redirect: &str, origin: &str) -> Result<String> {
        let mut url = Url::parse(&self.config.end_session_endpoint())
            .map_err(|e| AuthError::config(format!("Invalid end-session endpoint: {e}")))?;
        let target = if post_logout_redirect.starts_with('/') {
            format!("{}{}", origin.trim_end_matches('/'), post_logout_redirect)
        } else {
            post_logout_redirect.to_string()
        };
        url.query_pairs_mut()
            .append_pair("client_id", &self.config.client_id)
            .append_pair("post_logout_redirect_uri", &target);
        Ok(url.into())
    }
}

#[async_trait]
impl<V: ProtocolValidator + 'static> FederatedChallenger for OidcScheme<V> {
    fn scheme_name(&self) -> &str {
        &self.config.scheme_name
    }

    async fn challenge(
        &self,
        session: &Session,
        properties: &ChallengeProperties,
        origin: &str,
    ) -> Result<String> {
        self.begin_challenge(session, properties, origin).await
    }

    async fn sign_out(&self, post_logout_redirect: &str, origin: &str) -> Result<String> {
        self.sign_out_url(post_logout_redirect, origin)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::MemorySessionStore;
    use jsonwebtoken::{Algorithm, EncodingKey, Header};
    use serde_json::json;

    fn config() -> OidcSchemeConfig {
        OidcSchemeConfig {
            instance: "https://contoso.b2clogin.com/".into(),
            tenant: "contoso.onmicrosoft.com".into(),
            policy: "B2C_1_susi".into(),
            client_id: "client-1".into(),
            ..Default::default()
        }
    }

    fn session() -> Session {
        Session::generate(Arc::new(MemorySessionStore::new()))
    }

    fn query_value(url: &str, name: &str) -> Option<String> {
        Url::parse(url)
            .unwrap()
            .query_pairs()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.into_owned())
    }

    #[test]
    fn test_authority_and_endpoints() {
        let config = config();
        assert_eq!(
            config.authority(),
            "https://contoso.b2clogin.com/contoso.onmicrosoft.com/B2C_1_susi/v2.0/"
        );
        assert_eq!(
            config.token_endpoint(),
            "https://contoso.b2clogin.com/contoso.onmicrosoft.com/B2C_1_susi/oauth2/v2.0/token"
        );
    }

    #[test]
    fn test_validate_requires_fields() {
        assert!(config().validate().is_ok());
        let missing = OidcSchemeConfig {
            client_id: String::new(),
            ..config()
        };
        assert!(matches!(missing.validate(), Err(AuthError::Configuration { .. })));
    }

    #[tokio::test]
    async fn test_challenge_stores_correlation() {
        let scheme = OidcScheme::new(config()).unwrap();
        let session = session();
        let location = scheme
            .begin_challenge(&session, &ChallengeProperties::with_redirect("/About"), "https://app.example")
            .await
            .unwrap();

        assert_eq!(query_value(&location, "response_type").as_deref(), Some("code"));
        assert_eq!(query_value(&location, "scope").as_deref(), Some("openid profile"));
        assert_eq!(
            query_value(&location, "redirect_uri").as_deref(),
            Some("https://app.example/signin-oidc")
        );

        let state = query_value(&location, "state").unwrap();
        let stored = session
            .get_string(&format!("{CORRELATION_KEY_PREFIX}{state}"))
            .await
            .unwrap();
        assert!(stored.unwrap().contains("/About"));
    }

    fn forged_id_token() -> String {
        jsonwebtoken::encode(
            &Header::new(Algorithm::HS256),
            &json!({"sub": "victim-admin", "name": "Forged Admin", "tfp": "B2C_1_susi"}),
            &EncodingKey::from_secret(b"attacker"),
        )
        .unwrap()
    }

    fn protocol_error(result: Result<FederatedSignIn>) -> ProtocolValidationError {
        match result {
            Err(AuthError::ProtocolValidation(err)) => err,
            other => panic!("expected a protocol validation error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_unsolicited_id_token_is_rejected() {
        let scheme = OidcScheme::new(config()).unwrap();
        let response = AuthenticationResponse {
            id_token: Some(forged_id_token()),
            ..Default::default()
        };
        let result = scheme
            .handle_callback(&session(), &response, "https://app.example")
            .await;
        assert!(matches!(
            protocol_error(result),
            ProtocolValidationError::UnknownCorrelation
        ));
    }

    #[tokio::test]
    async fn test_front_channel_id_token_is_rejected() {
        let scheme = OidcScheme::new(config()).unwrap();
        let session = session();
        let location = scheme
            .begin_challenge(&session, &ChallengeProperties::with_redirect("/About"), "https://app.example")
            .await
            .unwrap();
        let state = query_value(&location, "state").unwrap();

        let response = AuthenticationResponse {
            id_token: Some(forged_id_token()),
            state: Some(state.clone()),
            ..Default::default()
        };
        let result = scheme
            .handle_callback(&session, &response, "https://app.example")
            .await;
        assert!(matches!(
            protocol_error(result),
            ProtocolValidationError::MissingAuthorizationCode
        ));

        // The correlation is single use.
        let replay = scheme
            .handle_callback(&session, &response, "https://app.example")
            .await;
        assert!(matches!(
            protocol_error(replay),
            ProtocolValidationError::UnknownCorrelation
        ));
    }

    #[tokio::test]
    async fn test_missing_state_uses_pending_challenge_when_tolerated() {
        let scheme = OidcScheme::new(config()).unwrap();
        let session = session();
        scheme
            .begin_challenge(&session, &ChallengeProperties::with_redirect("/About"), "https://app.example")
            .await
            .unwrap();

        // Correlation found without state, so the failure is about the missing code.
        let response = AuthenticationResponse {
            id_token: Some(forged_id_token()),
            ..Default::default()
        };
        let result = scheme
            .handle_callback(&session, &response, "https://app.example")
            .await;
        assert!(matches!(
            protocol_error(result),
            ProtocolValidationError::MissingAuthorizationCode
        ));
        assert!(session.get_string(PENDING_STATE_KEY).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_unknown_state_fails_when_state_is_required() {
        let scheme = OidcScheme::new(OidcSchemeConfig {
            validation: ProtocolValidationPolicy::strict(),
            ..config()
        })
        .unwrap();
        let session = session();
        scheme
            .begin_challenge(&session, &ChallengeProperties::with_redirect("/About"), "https://app.example")
            .await
            .unwrap();

        let response = AuthenticationResponse {
            code: Some("code-1".into()),
            state: Some("not-the-state".into()),
            ..Default::default()
        };
        let result = scheme
            .handle_callback(&session, &response, "https://app.example")
            .await;
        assert!(protocol_error(result).is_state_failure());
    }

    #[tokio::test]
    async fn test_callback_propagates_provider_error() {
        let scheme = OidcScheme::new(config()).unwrap();
        let response = AuthenticationResponse {
            error: Some("access_denied".into()),
            ..Default::default()
        };
        let result = scheme
            .handle_callback(&session(), &response, "https://app.example")
            .await;
        assert!(matches!(
            result,
            Err(AuthError::ProtocolValidation(ProtocolValidationError::ProviderError { .. }))
        ));
    }

    #[test]
    fn test_sign_out_url_is_absolute() {
        let scheme = OidcScheme::new(config()).unwrap();
        let url = scheme.sign_out_url("/", "https://app.example").unwrap();
        assert!(url.starts_with("https://contoso.b2clogin.com/"));
        assert_eq!(
            query_value(&url, "post_logout_redirect_uri").as_deref(),
            Some("https://app.example/")
        );
    }

    #[test]
    fn test_generate_state() {
        let a = generate_state();
        let b = generate_state();
        assert_eq!(a.len(), 32);
        assert_ne!(a, b);
    }
}
