//! Configuration for identity resolution and provider dispatch.

use crate::cookie::CookieSchemeConfig;
use crate::dispatch::{DEFAULT_PROVIDER, DispatchSettings, RuntimeEnvironment};
use crate::errors::{AuthError, Result};
use crate::providers::{DEFAULT_PLATFORM_PROVIDER, DispatchPolicy, ProviderRegistry};
use crate::server::oidc::{OidcSchemeConfig, ProtocolValidationPolicy};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

/// Environment variable naming a TOML configuration file.
pub const CONFIG_FILE_ENV: &str = "IDOPT_CONFIG";

/// Main configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    /// Provider used when a login request names none
    pub default_provider: String,

    /// Platform provider unregistered keys fall back to
    pub default_platform_provider: String,

    pub login_path: String,
    pub logout_path: String,
    pub local_login_path: String,
    pub simulation_path: String,
    pub post_login_path: String,
    pub post_logout_path: String,

    /// Hosting site name; its absence means a local environment
    pub site_name: Option<String>,

    /// Overrides environment detection
    pub environment: Option<RuntimeEnvironment>,

    /// Enables the simulated provider; defaults to "no hosting site name"
    pub simulation_enabled: Option<bool>,

    /// Provider registrations layered over the built-in table
    pub providers: HashMap<String, DispatchPolicy>,

    /// Federated OIDC scheme settings
    pub federated: Option<OidcSchemeConfig>,

    pub cookie: CookieSchemeConfig,

    pub session_idle_timeout_secs: u64,

    pub log_level: String,

    /// Address the demo server binds to
    pub bind_address: String,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            default_provider: DEFAULT_PROVIDER.to_string(),
            default_platform_provider: DEFAULT_PLATFORM_PROVIDER.to_string(),
            login_path: "/Login".to_string(),
            logout_path: "/Logout".to_string(),
            local_login_path: "/LocalLogin".to_string(),
            simulation_path: "/LocalSimulation".to_string(),
            post_login_path: "/About".to_string(),
            post_logout_path: "/".to_string(),
            site_name: None,
            environment: None,
            simulation_enabled: None,
            providers: HashMap::new(),
            federated: None,
            cookie: CookieSchemeConfig::default(),
            session_idle_timeout_secs: 30 * 60,
            log_level: "info".to_string(),
            bind_address: "127.0.0.1:8080".to_string(),
        }
    }
}

fn parse<T: FromStr>(key: &str, value: String) -> Result<T> {
    value
        .trim()
        .parse()
        .map_err(|_| AuthError::config(format!("Invalid value for {key}: {value}")))
}

impl AuthConfig {
    /// Load from the process environment.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load from `IDOPT_CONFIG` when set, otherwise from the environment.
    pub fn load() -> Result<Self> {
        match std::env::var(CONFIG_FILE_ENV) {
            Ok(path) if !path.is_empty() => Self::from_toml_file(path),
            _ => Self::from_env(),
        }
    }

    /// Load from a TOML file.
    pub fn from_toml_file(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path.as_ref())?;
        let config: Self = toml::from_str(&raw)?;
        Ok(config)
    }

    /// Build from defaults overridden by whatever `lookup` returns.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let mut config = Self::default();

        if let Some(v) = get("AUTH_PROVIDER") {
            config.default_provider = v;
        }
        if let Some(v) = get("AUTH_DEFAULT_PLATFORM_PROVIDER") {
            config.default_platform_provider = v;
        }
        if let Some(v) = get("AUTH_LOGIN_PATH") {
            config.login_path = v;
        }
        if let Some(v) = get("AUTH_LOGOUT_PATH") {
            config.logout_path = v;
        }
        if let Some(v) = get("AUTH_LOCAL_LOGIN_PATH") {
            config.local_login_path = v;
        }
        if let Some(v) = get("AUTH_SIMULATION_PATH") {
            config.simulation_path = v;
        }
        if let Some(v) = get("AUTH_POST_LOGIN_PATH") {
            config.post_login_path = v;
        }
        if let Some(v) = get("AUTH_POST_LOGOUT_PATH") {
            config.post_logout_path = v;
        }
        config.site_name = get("WEBSITE_SITE_NAME");
        if let Some(v) = get("AUTH_ENVIRONMENT") {
            config.environment = Some(match v.to_ascii_lowercase().as_str() {
                "local" => RuntimeEnvironment::Local,
                "hosted" => RuntimeEnvironment::Hosted,
                _ => return Err(AuthError::config(format!("Invalid value for AUTH_ENVIRONMENT: {v}"))),
            });
        }
        if let Some(v) = get("AUTH_SIMULATION_ENABLED") {
            config.simulation_enabled = Some(parse("AUTH_SIMULATION_ENABLED", v)?);
        }

        if let Some(instance) = get("AZURE_AD_B2C_INSTANCE") {
            let mut federated = OidcSchemeConfig {
                instance,
                tenant: get("AZURE_AD_B2C_TENANT_ID").unwrap_or_default(),
                policy: get("AZURE_AD_B2C_POLICY").unwrap_or_default(),
                client_id: get("AZURE_AD_B2C_CLIENT_ID").unwrap_or_default(),
                client_secret: get("AZURE_AD_B2C_CLIENT_SECRET"),
                sign_out_url: get("AZURE_AD_B2C_SIGN_OUT_URL"),
                ..OidcSchemeConfig::default()
            };
            if let Some(v) = get("AZURE_AD_B2C_CALLBACK_PATH") {
                federated.callback_path = v;
            }
            if let Some(v) = get("AZURE_AD_B2C_SAVE_TOKENS") {
                federated.save_tokens = parse("AZURE_AD_B2C_SAVE_TOKENS", v)?;
            }
            if let Some(v) = get("AZURE_AD_B2C_REQUIRE_STATE") {
                federated.validation.require_state = parse("AZURE_AD_B2C_REQUIRE_STATE", v)?;
            }
            if let Some(v) = get("AZURE_AD_B2C_REQUIRE_NONCE") {
                federated.validation.require_nonce = parse("AZURE_AD_B2C_REQUIRE_NONCE", v)?;
            }
            config.federated = Some(federated);
        }

        if let Some(v) = get("AUTH_COOKIE_NAME") {
            config.cookie.name = v;
        }
        if let Some(v) = get("AUTH_COOKIE_SECRET") {
            config.cookie.secret = v;
        }
        if let Some(v) = get("AUTH_COOKIE_LIFETIME_DAYS") {
            config.cookie.lifetime_days = parse("AUTH_COOKIE_LIFETIME_DAYS", v)?;
        }
        if let Some(v) = get("AUTH_COOKIE_SECURE") {
            config.cookie.secure = parse("AUTH_COOKIE_SECURE", v)?;
        }
        if let Some(v) = get("SESSION_IDLE_TIMEOUT_SECS") {
            config.session_idle_timeout_secs = parse("SESSION_IDLE_TIMEOUT_SECS", v)?;
        }
        if let Some(v) = get("LOG_LEVEL") {
            config.log_level = v;
        }
        if let Some(v) = get("BIND_ADDRESS") {
            config.bind_address = v;
        }

        Ok(config)
    }

    /// Whether configuration places the app behind the hosting platform.
    pub fn is_hosted(&self) -> bool {
        match self.environment {
            Some(env) => env == RuntimeEnvironment::Hosted,
            None => self.site_name.as_deref().is_some_and(|s| !s.trim().is_empty()),
        }
    }

    pub fn simulation_enabled(&self) -> bool {
        self.simulation_enabled.unwrap_or_else(|| !self.is_hosted())
    }

    pub fn session_idle_timeout(&self) -> Duration {
        Duration::from_secs(self.session_idle_timeout_secs)
    }

    /// Built-in provider table with the configured registrations applied.
    pub fn provider_registry(&self) -> Result<ProviderRegistry> {
        let mut overrides = self.providers.clone();
        if !overrides.keys().any(|k| k.eq_ignore_ascii_case("simple")) {
            overrides.insert(
                "simple".to_string(),
                DispatchPolicy::local(&self.local_login_path),
            );
        }
        ProviderRegistry::from_overrides(&overrides, &self.default_platform_provider)
    }

    pub fn dispatch_settings(&self) -> DispatchSettings {
        DispatchSettings {
            default_provider: self.default_provider.clone(),
            login_path: self.login_path.clone(),
            simulation_path: self.simulation_path.clone(),
            post_login_path: self.post_login_path.clone(),
            post_logout_path: self.post_logout_path.clone(),
            site_name: self.site_name.clone(),
            forced_environment: self.environment,
            simulation_enabled: self.simulation_enabled(),
            federated_sign_out_url: self
                .federated
                .as_ref()
                .and_then(|f| f.sign_out_url.clone()),
        }
    }

    /// Protocol validation policy of the federated scheme, if one is configured.
    pub fn validation_policy(&self) -> Option<ProtocolValidationPolicy> {
        self.federated.as_ref().map(|f| f.validation)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        for (name, path) in [
            ("login_path", &self.login_path),
            ("logout_path", &self.logout_path),
            ("local_login_path", &self.local_login_path),
            ("simulation_path", &self.simulation_path),
            ("post_login_path", &self.post_login_path),
            ("post_logout_path", &self.post_logout_path),
        ] {
            if !path.starts_with('/') {
                return Err(AuthError::config(format!("{name} must start with '/'")));
            }
        }

        let registry = self.provider_registry()?;

        // Explicitly configured federated policies, and a federated default, need settings.
        let default_policy = registry.resolve(&self.default_provider)?.policy.clone();
        let required = self
            .providers
            .values()
            .chain(std::iter::once(&default_policy))
            .filter_map(|p| match p {
                DispatchPolicy::FederatedChallenge { scheme } => Some(scheme.as_str()),
                _ => None,
            });
        for scheme in required {
            match &self.federated {
                Some(federated) if federated.scheme_name == scheme => federated.validate()?,
                _ => {
                    return Err(AuthError::config(format!(
                        "Federated scheme '{scheme}' is used but not configured"
                    )));
                }
            }
        }
        if let Some(federated) = &self.federated {
            federated.validate()?;
        }

        if self.cookie.lifetime_days <= 0 {
            return Err(AuthError::config("Cookie lifetime must be greater than 0"));
        }
        if self.is_hosted() && self.cookie.secret.is_empty() {
            return Err(AuthError::config(
                "A cookie secret is required when running behind the hosting platform",
            ));
        }
        if self.session_idle_timeout_secs == 0 {
            return Err(AuthError::config("Session idle timeout must be greater than 0"));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults_are_valid_locally() {
        let config = AuthConfig::default();
        assert!(config.validate().is_ok());
        assert!(config.simulation_enabled());
        assert!(!config.is_hosted());
    }

    #[test]
    fn test_from_lookup_reads_values() {
        let config = AuthConfig::from_lookup(lookup(&[
            ("AUTH_PROVIDER", "b2c"),
            ("WEBSITE_SITE_NAME", "idopt-web"),
            ("AZURE_AD_B2C_INSTANCE", "https://contoso.b2clogin.com/"),
            ("AZURE_AD_B2C_TENANT_ID", "contoso.onmicrosoft.com"),
            ("AZURE_AD_B2C_POLICY", "B2C_1_susi"),
            ("AZURE_AD_B2C_CLIENT_ID", "client-1"),
            ("AUTH_COOKIE_SECRET", "s3cret"),
            ("SESSION_IDLE_TIMEOUT_SECS", "60"),
        ]))
        .unwrap();

        assert_eq!(config.default_provider, "b2c");
        assert!(config.is_hosted());
        assert!(!config.simulation_enabled());
        assert_eq!(config.session_idle_timeout(), Duration::from_secs(60));
        let federated = config.federated.as_ref().unwrap();
        assert_eq!(federated.policy, "B2C_1_susi");
        assert!(!federated.validation.require_state);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_from_lookup_reads_every_path() {
        let config = AuthConfig::from_lookup(lookup(&[
            ("AUTH_LOGIN_PATH", "/signin"),
            ("AUTH_LOGOUT_PATH", "/signout"),
            ("AUTH_LOCAL_LOGIN_PATH", "/account/local"),
            ("AUTH_SIMULATION_PATH", "/dev/simulate"),
        ]))
        .unwrap();
        assert_eq!(config.login_path, "/signin");
        assert_eq!(config.logout_path, "/signout");
        assert_eq!(config.local_login_path, "/account/local");
        assert_eq!(config.simulation_path, "/dev/simulate");
        assert_eq!(config.dispatch_settings().simulation_path, "/dev/simulate");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_dispatch_settings_carry_simulation_flag() {
        let hosted = AuthConfig {
            site_name: Some("idopt-web".to_string()),
            ..Default::default()
        };
        assert!(!hosted.dispatch_settings().simulation_enabled);
        assert!(AuthConfig::default().dispatch_settings().simulation_enabled);
    }

    #[test]
    fn test_invalid_numbers_are_rejected() {
        let result = AuthConfig::from_lookup(lookup(&[("AUTH_COOKIE_LIFETIME_DAYS", "soon")]));
        assert!(matches!(result, Err(AuthError::Configuration { .. })));
    }

    #[test]
    fn test_forced_environment() {
        let config = AuthConfig::from_lookup(lookup(&[
            ("WEBSITE_SITE_NAME", "idopt-web"),
            ("AUTH_ENVIRONMENT", "local"),
        ]))
        .unwrap();
        assert!(!config.is_hosted());
        assert!(config.simulation_enabled());
    }

    #[test]
    fn test_federated_default_without_settings_fails() {
        let config = AuthConfig {
            default_provider: "b2c".to_string(),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_hosted_without_cookie_secret_fails() {
        let config = AuthConfig {
            site_name: Some("idopt-web".to_string()),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_toml_round_trip_of_provider_overrides() {
        let raw = r#"
            default_provider = "google"
            [providers.github]
            kind = "platform_redirect"
            alias = "github"
        "#;
        let config: AuthConfig = toml::from_str(raw).unwrap();
        let registry = config.provider_registry().unwrap();
        assert_eq!(registry.get("github"), Some(&DispatchPolicy::platform("github")));
        assert_eq!(config.login_path, "/Login");
    }
}
