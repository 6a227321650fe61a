//! Identity and pre-shared key pairs

use std::fmt;

use threadfree_proto::payload::BOOTSTRAP_IDENTITY;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::{Error, Result};

/// Pre-shared key bytes, wiped on drop and never printed
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct Secret(Vec<u8>);

impl Secret {
    pub fn new(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    pub fn expose(&self) -> &[u8] {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Secret(***)")
    }
}

impl From<Vec<u8>> for Secret {
    fn from(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }
}

impl From<String> for Secret {
    fn from(text: String) -> Self {
        Self(text.into_bytes())
    }
}

impl From<&str> for Secret {
    fn from(text: &str) -> Self {
        Self(text.as_bytes().to_vec())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credential {
    identity: String,
    secret: Secret,
}

impl Credential {
    pub fn new(identity: impl Into<String>, secret: impl Into<Secret>) -> Result<Self> {
        let identity = identity.into();
        if identity.is_empty() {
            return Err(Error::argument("credential identity must not be empty"));
        }
        Ok(Self {
            identity,
            secret: secret.into(),
        })
    }

    /// Credential the hub accepts with its factory security key
    pub fn bootstrap(security_key: impl Into<Secret>) -> Self {
        Self {
            identity: BOOTSTRAP_IDENTITY.to_string(),
            secret: security_key.into(),
        }
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }

    pub fn secret(&self) -> &Secret {
        &self.secret
    }
}
