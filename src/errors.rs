//! Error types for identity resolution and provider dispatch.

use thiserror::Error;

/// Result type alias for the crate.
pub type Result<T, E = AuthError> = std::result::Result<T, E>;

/// Main error type for identity resolution and provider dispatch.
#[derive(Error, Debug)]
pub enum AuthError {
    /// Configuration errors
    #[error("Configuration error: {message}")]
    Configuration { message: String },

    /// The platform principal header was present but could not be decoded
    #[error("Malformed principal header: {message}")]
    MalformedPrincipalHeader { message: String },

    /// The requested provider is registered as disabled
    #[error("Provider '{provider}' is disabled")]
    ProviderDisabled { provider: String },

    /// Initiating a federated challenge or sign-out failed
    #[error("Upstream challenge failed for scheme '{scheme}': {message}")]
    UpstreamChallenge { scheme: String, message: String },

    /// Protocol validation errors
    #[error("Protocol validation error: {0}")]
    ProtocolValidation(#[from] ProtocolValidationError),

    /// Storage-related errors
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    /// Session-related errors
    #[error("Session error: {0}")]
    Session(String),

    /// Network/HTTP errors
    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    /// JSON parsing errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// TOML parsing errors
    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),

    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Invalid input error
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Authentication is required to reach the resource
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    /// Generic internal errors
    #[error("Internal error: {message}")]
    Internal { message: String },
}

/// Failures raised while validating OIDC authentication and token responses.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolValidationError {
    #[error("State parameter missing from the authentication response")]
    MissingState,

    #[error("State parameter does not match the expected value")]
    StateMismatch,

    #[error("Nonce missing from the id token")]
    MissingNonce,

    #[error("Nonce does not match the expected value")]
    NonceMismatch,

    #[error("Response contains neither an authorization code nor an id token")]
    MissingCodeOrIdToken,

    #[error("Authentication response carries no authorization code")]
    MissingAuthorizationCode,

    #[error("No pending sign-in matches the authentication response")]
    UnknownCorrelation,

    #[error("Token response is missing the id token")]
    MissingIdToken,

    #[error("Token response is missing the access token")]
    MissingAccessToken,

    #[error("Id token is malformed: {message}")]
    MalformedIdToken { message: String },

    #[error("at_hash claim does not match the access token")]
    AccessTokenHashMismatch,

    #[error("Provider returned an error: {error}")]
    ProviderError {
        error: String,
        description: Option<String>,
    },
}

/// Storage-specific errors
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Connection failed: {message}")]
    ConnectionFailed { message: String },

    #[error("Operation failed: {message}")]
    OperationFailed { message: String },

    #[error("Serialization error: {message}")]
    Serialization { message: String },

    #[error("Storage backend not available")]
    BackendUnavailable,
}

impl AuthError {
    /// Create a new configuration error
    pub fn config(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Create a malformed principal header error
    pub fn malformed_principal(message: impl Into<String>) -> Self {
        Self::MalformedPrincipalHeader {
            message: message.into(),
        }
    }

    /// Create a provider disabled error
    pub fn provider_disabled(provider: impl Into<String>) -> Self {
        Self::ProviderDisabled {
            provider: provider.into(),
        }
    }

    /// Create an upstream challenge error
    pub fn upstream_challenge(scheme: impl Into<String>, message: impl Into<String>) -> Self {
        Self::UpstreamChallenge {
            scheme: scheme.into(),
            message: message.into(),
        }
    }

    /// Create a session error
    pub fn session(message: impl Into<String>) -> Self {
        Self::Session(message.into())
    }

    /// Create a new internal error
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Whether this failure should stop an identity resolution chain.
    ///
    /// Decode failures and session hiccups only mean that one mechanism could not
    /// produce an identity, so the next mechanism still gets its turn.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            AuthError::MalformedPrincipalHeader { .. }
                | AuthError::Session(_)
                | AuthError::Storage(_)
        )
    }
}

impl StorageError {
    /// Create a new connection failed error
    pub fn connection_failed(message: impl Into<String>) -> Self {
        Self::ConnectionFailed {
            message: message.into(),
        }
    }

    /// Create a new operation failed error
    pub fn operation_failed(message: impl Into<String>) -> Self {
        Self::OperationFailed {
            message: message.into(),
        }
    }

    /// Create a new serialization error
    pub fn serialization(message: impl Into<String>) -> Self {
        Self::Serialization {
            message: message.into(),
        }
    }
}

impl ProtocolValidationError {
    /// True for the failure classes that state enforcement controls.
    pub fn is_state_failure(&self) -> bool {
        matches!(
            self,
            ProtocolValidationError::MissingState | ProtocolValidationError::StateMismatch
        )
    }
}
