//! Provider registration table.
//!
//! Maps a provider key (as it arrives in `?provider=`) to the [`DispatchPolicy`] the
//! dispatch router follows. Built once at startup from defaults plus configuration
//! overrides and read-only afterwards.

use crate::errors::{AuthError, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

/// Key of the default platform provider.
pub const DEFAULT_PLATFORM_PROVIDER: &str = "aad";

/// What to do when a user picks a provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DispatchPolicy {
    /// Challenge a federated OIDC scheme by name
    FederatedChallenge { scheme: String },
    /// Redirect to a local credential page
    LocalRedirect { path: String },
    /// Redirect to the hosting platform's login endpoint for `alias`
    PlatformRedirect { alias: String },
    /// Reject with a user-facing message
    Disabled,
}

impl DispatchPolicy {
    pub fn federated(scheme: impl Into<String>) -> Self {
        Self::FederatedChallenge {
            scheme: scheme.into(),
        }
    }

    pub fn local(path: impl Into<String>) -> Self {
        Self::LocalRedirect { path: path.into() }
    }

    pub fn platform(alias: impl Into<String>) -> Self {
        Self::PlatformRedirect {
            alias: alias.into(),
        }
    }

    pub fn is_platform(&self) -> bool {
        matches!(self, Self::PlatformRedirect { .. })
    }

    pub fn is_disabled(&self) -> bool {
        matches!(self, Self::Disabled)
    }

    fn check(&self, key: &str) -> Result<()> {
        let empty = match self {
            Self::FederatedChallenge { scheme } => scheme.trim().is_empty(),
            Self::LocalRedirect { path } => !path.starts_with('/'),
            Self::PlatformRedirect { alias } => alias.trim().is_empty(),
            Self::Disabled => false,
        };
        if empty {
            return Err(AuthError::config(format!(
                "Provider '{key}' has an incomplete dispatch policy: {self:?}"
            )));
        }
        Ok(())
    }
}

/// A lookup answer: the policy to follow and whether it came from the fallback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedProvider<'a> {
    pub key: String,
    pub policy: &'a DispatchPolicy,
    pub fallback: bool,
}

/// Provider key to dispatch policy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderRegistry {
    entries: BTreeMap<String, DispatchPolicy>,
    default_platform: String,
}

impl Default for ProviderRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

fn normalize_key(key: &str) -> String {
    key.trim().to_ascii_lowercase()
}

impl ProviderRegistry {
    pub fn empty(default_platform: impl Into<String>) -> Self {
        Self {
            entries: BTreeMap::new(),
            default_platform: normalize_key(&default_platform.into()),
        }
    }

    /// The built-in table.
    pub fn with_defaults() -> Self {
        let mut registry = Self::empty(DEFAULT_PLATFORM_PROVIDER);
        registry.register("b2c", DispatchPolicy::federated("AzureB2C"));
        registry.register("simple", DispatchPolicy::local("/LocalLogin"));
        registry.register("aad", DispatchPolicy::platform("aad"));
        registry.register("google", DispatchPolicy::platform("google"));
        registry.register("facebook", DispatchPolicy::platform("facebook"));
        registry.register("x", DispatchPolicy::platform("twitter"));
        registry.register("github", DispatchPolicy::Disabled);
        registry
    }

    /// Defaults with configured entries layered on top, validated.
    pub fn from_overrides(
        overrides: &HashMap<String, DispatchPolicy>,
        default_platform: &str,
    ) -> Result<Self> {
        let mut registry = Self::with_defaults();
        registry.default_platform = normalize_key(default_platform);
        for (key, policy) in overrides {
            registry.register(key, policy.clone());
        }
        registry.validate()?;
        Ok(registry)
    }

    pub fn register(&mut self, key: &str, policy: DispatchPolicy) {
        self.entries.insert(normalize_key(key), policy);
    }

    pub fn validate(&self) -> Result<()> {
        for (key, policy) in &self.entries {
            policy.check(key)?;
        }
        match self.entries.get(&self.default_platform) {
            Some(policy) if policy.is_platform() => Ok(()),
            _ => Err(AuthError::config(format!(
                "Default platform provider '{}' must be registered with a platform redirect",
                self.default_platform
            ))),
        }
    }

    pub fn get(&self, key: &str) -> Option<&DispatchPolicy> {
        self.entries.get(&normalize_key(key))
    }

    pub fn default_platform(&self) -> &str {
        &self.default_platform
    }

    /// Look up a key, falling back to the default platform provider.
    pub fn resolve(&self, key: &str) -> Result<ResolvedProvider<'_>> {
        let key = normalize_key(key);
        if let Some(policy) = self.entries.get(&key) {
            return Ok(ResolvedProvider {
                key,
                policy,
                fallback: false,
            });
        }

        tracing::warn!(
            provider = %key,
            fallback = %self.default_platform,
            "Unregistered provider, using the default platform provider"
        );
        let policy = self.entries.get(&self.default_platform).ok_or_else(|| {
            AuthError::config(format!(
                "Default platform provider '{}' is not registered",
                self.default_platform
            ))
        })?;
        Ok(ResolvedProvider {
            key: self.default_platform.clone(),
            policy,
            fallback: true,
        })
    }

    /// Names of every federated scheme the table challenges.
    pub fn federated_schemes(&self) -> impl Iterator<Item = &str> {
        self.entries.values().filter_map(|p| match p {
            DispatchPolicy::FederatedChallenge { scheme } => Some(scheme.as_str()),
            _ => None,
        })
    }

    /// Enabled provider keys in sorted order.
    pub fn enabled_keys(&self) -> Vec<&str> {
        self.entries
            .iter()
            .filter(|(_, p)| !p.is_disabled())
            .map(|(k, _)| k.as_str())
            .collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &DispatchPolicy)> {
        self.entries.iter().map(|(k, p)| (k.as_str(), p))
    }
}
