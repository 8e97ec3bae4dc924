//! Participant identity abstraction
//!
//! Calls are addressed by participant identity. The core is generic over the
//! identity scheme; the only requirement is a stable string form, which is
//! what travels in the `from`/`to` fields of negotiation messages and what
//! the session registry keys participants by.

use serde::{Deserialize, Serialize};
use std::fmt::{Debug, Display};
use std::str::FromStr;

/// Trait for participant identity
///
/// The string representation must be stable and unique per participant.
pub trait PeerIdentity:
    Clone + Debug + Display + Serialize + for<'de> Deserialize<'de> + Send + Sync + 'static
{
    /// Convert the identity to a string representation
    fn to_string_repr(&self) -> String;

    /// Try to create an identity from a string representation
    fn from_string_repr(s: &str) -> anyhow::Result<Self>
    where
        Self: Sized;

    /// Key used by the session registry
    fn unique_id(&self) -> String {
        self.to_string_repr()
    }
}

/// Simple string-based participant identity
///
/// Serializes as a bare JSON string, matching the wire format of
/// negotiation messages.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerIdentityString(pub String);

impl PeerIdentityString {
    /// Create a new string-based identity
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    /// Get the inner string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for PeerIdentityString {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl PeerIdentity for PeerIdentityString {
    fn to_string_repr(&self) -> String {
        self.0.clone()
    }

    fn from_string_repr(s: &str) -> anyhow::Result<Self> {
        let trimmed = s.trim();
        if trimmed.is_empty() {
            anyhow::bail!("participant identity cannot be empty");
        }
        if trimmed.chars().any(char::is_whitespace) {
            anyhow::bail!("participant identity cannot contain whitespace: {trimmed:?}");
        }
        Ok(Self(trimmed.to_string()))
    }
}

impl FromStr for PeerIdentityString {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_string_repr(s)
    }
}

impl From<&str> for PeerIdentityString {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for PeerIdentityString {
    fn from(s: String) -> Self {
        Self(s)
    }
}
