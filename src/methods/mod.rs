//! Identity resolution mechanisms.
//!
//! Each mechanism inspects a request and answers with an [`AuthenticationResult`].
//! `NoResult` means the mechanism found no applicable signal and the next one may
//! try; `Failure` carries a concrete error.

pub mod header;
pub mod simulated;

pub use header::HeaderIdentityExtractor;
pub use simulated::SimulatedIdentityProvider;

use crate::claims::Identity;
use crate::errors::AuthError;
use crate::session::Session;
use async_trait::async_trait;
use http::HeaderMap;
use std::collections::HashMap;

/// Outcome of one resolution attempt.
#[derive(Debug)]
pub enum AuthenticationResult {
    /// An identity was established
    Success(Identity),

    /// No applicable signal; another mechanism may try
    NoResult,

    /// A signal was present but unusable
    Failure(AuthError),
}

impl AuthenticationResult {
    pub fn is_success(&self) -> bool {
        matches!(self, AuthenticationResult::Success(_))
    }

    pub fn is_no_result(&self) -> bool {
        matches!(self, AuthenticationResult::NoResult)
    }

    pub fn identity(&self) -> Option<&Identity> {
        match self {
            AuthenticationResult::Success(identity) => Some(identity),
            _ => None,
        }
    }

    pub fn into_identity(self) -> Option<Identity> {
        match self {
            AuthenticationResult::Success(identity) => Some(identity),
            _ => None,
        }
    }
}

/// Everything a resolver may look at for one inbound request.
#[derive(Debug, Clone, Default)]
pub struct RequestContext {
    headers: HeaderMap,
    query: HashMap<String, String>,
    session: Option<Session>,
}

impl RequestContext {
    pub fn new(headers: HeaderMap) -> Self {
        Self {
            headers,
            query: HashMap::new(),
            session: None,
        }
    }

    pub fn with_query(mut self, query: HashMap<String, String>) -> Self {
        self.query = query;
        self
    }

    /// Parse a raw `a=1&b=2` query string. The first occurrence of a key wins.
    pub fn with_raw_query(mut self, raw: Option<&str>) -> Self {
        if let Some(raw) = raw {
            for (key, value) in url::form_urlencoded::parse(raw.as_bytes()) {
                self.query
                    .entry(key.into_owned())
                    .or_insert_with(|| value.into_owned());
            }
        }
        self
    }

    pub fn with_session(mut self, session: Option<Session>) -> Self {
        self.session = session;
        self
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// Header value as a string, `None` when absent or not visible ASCII.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    /// Non-empty query parameter.
    pub fn query(&self, name: &str) -> Option<&str> {
        self.query
            .get(name)
            .map(String::as_str)
            .filter(|v| !v.is_empty())
    }

    pub fn session(&self) -> Option<&Session> {
        self.session.as_ref()
    }
}

/// A mechanism that can turn a request into an identity.
#[async_trait]
pub trait IdentityResolver: Send + Sync {
    /// Name used in logs.
    fn name(&self) -> &str;

    /// Attempt to resolve an identity from the request.
    async fn resolve(&self, request: &RequestContext) -> AuthenticationResult;
}
