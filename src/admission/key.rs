//! Admission key derivation.
//!
//! A key identifies one rate-limit bucket. It is a SHA-256 digest over the
//! length-prefixed components, so no choice of identity or endpoint string
//! can make two different buckets share a key.

use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

use super::tier::Tier;

const KEY_VERSION: &str = "v1";
const UNKNOWN: &str = "unknown";

/// Errors produced while resolving a key.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum KeyError {
    #[error("subject identity is empty")]
    MalformedIdentity,
    #[error("invalid admission key '{0}'")]
    InvalidKey(String),
}

/// Identity facts supplied by the authentication collaborator.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SubjectIdentity {
    pub user_id: Option<String>,
    pub api_key_id: Option<String>,
    pub source_addr: Option<String>,
}

impl SubjectIdentity {
    pub fn user(id: impl Into<String>) -> Self {
        Self {
            user_id: Some(id.into()),
            ..Default::default()
        }
    }

    pub fn api_key(id: impl Into<String>) -> Self {
        Self {
            api_key_id: Some(id.into()),
            ..Default::default()
        }
    }

    pub fn source(addr: impl Into<String>) -> Self {
        Self {
            source_addr: Some(addr.into()),
            ..Default::default()
        }
    }

    /// Pick the strongest identity: user, then API key, then source address.
    pub fn primary(&self) -> Result<(SubjectKind, &str), KeyError> {
        [
            (SubjectKind::User, &self.user_id),
            (SubjectKind::ApiKey, &self.api_key_id),
            (SubjectKind::Source, &self.source_addr),
        ]
        .into_iter()
        .find_map(|(kind, value)| {
            value
                .as_deref()
                .map(str::trim)
                .filter(|v| !v.is_empty())
                .map(|v| (kind, v))
        })
        .ok_or(KeyError::MalformedIdentity)
    }
}

/// What kind of identity a key was derived from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SubjectKind {
    User,
    ApiKey,
    Source,
}

impl SubjectKind {
    fn as_str(&self) -> &'static str {
        match self {
            SubjectKind::User => "user",
            SubjectKind::ApiKey => "api_key",
            SubjectKind::Source => "source",
        }
    }
}

/// Fixed-length, hex-encoded admission key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AdmissionKey(String);

impl AdmissionKey {
    /// Length of the hex encoding.
    pub const LEN: usize = 64;

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AdmissionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for AdmissionKey {
    type Err = KeyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let valid = s.len() == Self::LEN
            && s.bytes().all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b));
        if valid {
            Ok(AdmissionKey(s.to_string()))
        } else {
            Err(KeyError::InvalidKey(s.to_string()))
        }
    }
}

/// Result of key resolution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedKey {
    pub key: AdmissionKey,
    pub kind: SubjectKind,
    /// Tier actually used; lowered to anonymous on fallback
    pub tier: Tier,
    /// Endpoint actually used; `unknown` when the caller sent none
    pub endpoint_id: String,
    pub fallback: bool,
}

/// Derives admission keys.
#[derive(Debug, Clone, Copy, Default)]
pub struct KeyResolver;

impl KeyResolver {
    pub fn new() -> Self {
        Self
    }

    /// Derive the key for a well-formed identity.
    pub fn resolve(
        &self,
        subject: &SubjectIdentity,
        tier: Tier,
        endpoint_id: &str,
        geo: Option<&str>,
    ) -> Result<AdmissionKey, KeyError> {
        let (kind, id) = subject.primary()?;
        Ok(Self::digest(kind, id, tier, endpoint_id, geo))
    }

    /// Derive a key, degrading malformed input instead of failing.
    ///
    /// A missing identity is keyed by the raw source address under the
    /// anonymous tier; a blank endpoint is keyed as `unknown`.
    pub fn resolve_or_fallback(
        &self,
        subject: &SubjectIdentity,
        tier: Tier,
        endpoint_id: &str,
        geo: Option<&str>,
    ) -> ResolvedKey {
        let endpoint_missing = endpoint_id.trim().is_empty();
        let endpoint = if endpoint_missing {
            UNKNOWN
        } else {
            endpoint_id.trim()
        };
        let geo = geo.map(str::trim).filter(|g| !g.is_empty());

        match subject.primary() {
            Ok((kind, id)) => ResolvedKey {
                key: Self::digest(kind, id, tier, endpoint, geo),
                kind,
                tier,
                endpoint_id: endpoint.to_string(),
                fallback: endpoint_missing,
            },
            Err(_) => {
                let source = subject
                    .source_addr
                    .as_deref()
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .unwrap_or(UNKNOWN);
                ResolvedKey {
                    key: Self::digest(SubjectKind::Source, source, Tier::Anonymous, endpoint, geo),
                    kind: SubjectKind::Source,
                    tier: Tier::Anonymous,
                    endpoint_id: endpoint.to_string(),
                    fallback: true,
                }
            }
        }
    }

    fn digest(
        kind: SubjectKind,
        id: &str,
        tier: Tier,
        endpoint_id: &str,
        geo: Option<&str>,
    ) -> AdmissionKey {
        let mut hasher = Sha256::new();
        let components = [
            KEY_VERSION,
            kind.as_str(),
            id,
            tier.as_str(),
            endpoint_id,
            geo.unwrap_or(""),
        ];
        for component in components {
            hasher.update((component.len() as u64).to_be_bytes());
            hasher.update(component.as_bytes());
        }
        // Distinguish "no geo" from an empty geo tag.
        hasher.update([geo.is_some() as u8]);
        AdmissionKey(hex::encode(hasher.finalize()))
    }
}
