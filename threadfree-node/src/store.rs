//! Per-hub credential persistence

use std::collections::HashMap;
use std::sync::Mutex;

use data_encoding::BASE64;
use serde::{Deserialize, Serialize};
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use crate::credential::{Credential, Secret};

pub const DEFAULT_SERVICE: &str = "threadfree";

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[cfg(feature = "keychain")]
    #[error("keyring: {0}")]
    Keyring(#[from] keyring::Error),
    #[error("stored credential for {host} is corrupt: {reason}")]
    Corrupt { host: String, reason: String },
    #[error("failed to serialize credential: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("credential store unavailable: {0}")]
    Unavailable(String),
}

/// Maps a hub host to the credential provisioned for it.
///
/// At most one record exists per host. `save` replaces any prior record in a
/// single write, so a reader sees either the old record or the new one.
#[cfg_attr(test, mockall::automock)]
pub trait CredentialStore: Send + Sync {
    /// `Ok(None)` when nothing is stored for `host`
    fn load(&self, host: &str) -> Result<Option<Credential>, StoreError>;

    fn save(&self, host: &str, credential: &Credential) -> Result<(), StoreError>;

    /// Returns whether a record existed
    fn forget(&self, host: &str) -> Result<bool, StoreError>;
}

#[derive(Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
struct StoredRecord {
    identity: String,
    secret: String,
}

fn encode_record(credential: &Credential) -> Result<Zeroizing<String>, StoreError> {
    let record = StoredRecord {
        identity: credential.identity().to_string(),
        secret: BASE64.encode(credential.secret().expose()),
    };
    Ok(Zeroizing::new(serde_json::to_string(&record)?))
}

fn decode_record(host: &str, raw: &str) -> Result<Credential, StoreError> {
    let corrupt = |reason: String| StoreError::Corrupt {
        host: host.to_string(),
        reason,
    };
    let record: StoredRecord = serde_json::from_str(raw).map_err(|e| corrupt(e.to_string()))?;
    let secret = BASE64
        .decode(record.secret.as_bytes())
        .map_err(|e| corrupt(format!("secret: {e}")))?;
    Credential::new(record.identity.clone(), Secret::new(secret))
        .map_err(|_| corrupt("empty identity".to_string()))
}

/// Credentials kept in the OS vault, one entry per hub
#[cfg(feature = "keychain")]
pub struct KeyringStore {
    service: String,
}

#[cfg(feature = "keychain")]
impl KeyringStore {
    pub fn new(service: impl Into<String>) -> Self {
        Self {
            service: service.into(),
        }
    }

    fn entry(&self, host: &str) -> Result<keyring::Entry, StoreError> {
        Ok(keyring::Entry::new(&self.service, host)?)
    }
}

#[cfg(feature = "keychain")]
impl Default for KeyringStore {
    fn default() -> Self {
        Self::new(DEFAULT_SERVICE)
    }
}

#[cfg(feature = "keychain")]
impl CredentialStore for KeyringStore {
    fn load(&self, host: &str) -> Result<Option<Credential>, StoreError> {
        match self.entry(host)?.get_password() {
            Ok(raw) => {
                let raw = Zeroizing::new(raw);
                decode_record(host, &raw).map(Some)
            }
            Err(keyring::Error::NoEntry) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn save(&self, host: &str, credential: &Credential) -> Result<(), StoreError> {
        let encoded = encode_record(credential)?;
        self.entry(host)?.set_password(&encoded)?;
        tracing::debug!(host, service = %self.service, "credential written to keyring");
        Ok(())
    }

    fn forget(&self, host: &str) -> Result<bool, StoreError> {
        match self.entry(host)?.delete_credential() {
            Ok(()) => Ok(true),
            Err(keyring::Error::NoEntry) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }
}

/// Process-local store, nothing survives exit
#[derive(Default)]
pub struct MemoryStore {
    records: Mutex<HashMap<String, Zeroizing<String>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn records(
        &self,
    ) -> Result<std::sync::MutexGuard<'_, HashMap<String, Zeroizing<String>>>, StoreError> {
        self.records
            .lock()
            .map_err(|_| StoreError::Unavailable("memory store lock poisoned".to_string()))
    }

    #[cfg(test)]
    pub(crate) fn insert_raw(&self, host: &str, raw: &str) {
        self.records
            .lock()
            .unwrap()
            .insert(host.to_string(), Zeroizing::new(raw.to_string()));
    }
}

impl CredentialStore for MemoryStore {
    fn load(&self, host: &str) -> Result<Option<Credential>, StoreError> {
        match self.records()?.get(host) {
            Some(raw) => decode_record(host, raw).map(Some),
            None => Ok(None),
        }
    }

    fn save(&self, host: &str, credential: &Credential) -> Result<(), StoreError> {
        let encoded = encode_record(credential)?;
        self.records()?.insert(host.to_string(), encoded);
        Ok(())
    }

    fn forget(&self, host: &str) -> Result<bool, StoreError> {
        Ok(self.records()?.remove(host).is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_missing_is_none() {
        let store = MemoryStore::new();
        assert!(store.load("192.168.1.10").unwrap().is_none());
    }

    #[test]
    fn save_replaces_previous_record() {
        let store = MemoryStore::new();
        let first = Credential::new("ThreadFree", "first").unwrap();
        let second = Credential::new("ThreadFree", "second").unwrap();
        store.save("hub", &first).unwrap();
        store.save("hub", &second).unwrap();

        assert_eq!(store.load("hub").unwrap(), Some(second));
        assert!(store.load("other-hub").unwrap().is_none());
    }

    #[test]
    fn forget_reports_whether_record_existed() {
        let store = MemoryStore::new();
        store
            .save("hub", &Credential::new("ThreadFree", "abc").unwrap())
            .unwrap();
        assert!(store.forget("hub").unwrap());
        assert!(!store.forget("hub").unwrap());
        assert!(store.load("hub").unwrap().is_none());
    }

    #[test]
    fn record_format_is_json_with_base64_secret() {
        let credential = Credential::new("ThreadFree", "abc123").unwrap();
        let encoded = encode_record(&credential).unwrap();
        let value: serde_json::Value = serde_json::from_str(&encoded).unwrap();
        assert_eq!(
            value,
            serde_json::json!({"identity": "ThreadFree", "secret": "YWJjMTIz"})
        );
    }

    #[test]
    fn corrupt_record_is_reported() {
        let store = MemoryStore::new();
        store.insert_raw("hub", "{not json");
        assert!(matches!(store.load("hub"), Err(StoreError::Corrupt { .. })));

        store.insert_raw("hub", r#"{"identity":"ThreadFree","secret":"***"}"#);
        assert!(matches!(store.load("hub"), Err(StoreError::Corrupt { .. })));

        store.insert_raw("hub", r#"{"identity":"","secret":"YWJj"}"#);
        assert!(matches!(store.load("hub"), Err(StoreError::Corrupt { .. })));
    }

    // Needs a running secret service (or the platform keychain).
    #[cfg(feature = "keychain")]
    #[test]
    #[ignore]
    fn keyring_record_outlives_the_store_handle() {
        let service = format!("threadfree-test-{}", std::process::id());
        let credential = Credential::new("ThreadFree", "abc123").unwrap();
        KeyringStore::new(service.clone())
            .save("hub", &credential)
            .unwrap();

        let reopened = KeyringStore::new(service);
        assert_eq!(reopened.load("hub").unwrap(), Some(credential));
        assert!(reopened.forget("hub").unwrap());
        assert!(reopened.load("hub").unwrap().is_none());
    }
}
