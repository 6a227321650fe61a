//! ThreadFree node - pairs with a hub, keeps its credential, drives lights
//!
//! A session starts from a [`CredentialStore`] lookup. When the hub is unknown
//! a [`Provisioner`] mints an application key with the factory security key
//! and stores it. The durable [`HubSession`] channel then carries the
//! [`RampController`] light updates.

pub mod channel;
pub mod credential;
#[cfg(feature = "dtls")]
pub mod dtls;
pub mod error;
pub mod exchange;
pub mod provision;
pub mod ramp;
pub mod session;
pub mod store;

#[cfg(test)]
pub(crate) mod testing;

pub use channel::{Connector, SecureChannel};
pub use credential::{Credential, Secret};
#[cfg(feature = "dtls")]
pub use dtls::{DtlsConfig, DtlsConnector};
pub use error::{Error, Result};
pub use exchange::{CoapExchange, Exchange, Request, Response};
pub use provision::{ProvisionConfig, Provisioner, SecurityKeyPrompt, StdinPrompt};
pub use ramp::{RampConfig, RampController, RampPhase, RampState, RampSummary};
pub use session::HubSession;
#[cfg(feature = "keychain")]
pub use store::KeyringStore;
pub use store::{CredentialStore, MemoryStore, StoreError};

pub use threadfree_proto as proto;
