use crate::store::StoreError;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("{0}")]
    Argument(String),
    #[error("security key: {0}")]
    SecurityKey(String),
    #[error("no reply while getting api key for {application}")]
    ProvisioningTimeout { application: String },
    #[error("{reason}, got keys [{}]", .keys.join(", "))]
    ProvisioningProtocol { reason: String, keys: Vec<String> },
    #[error("credential store: {0}")]
    Store(#[from] StoreError),
    #[error("transport: {0}")]
    Transport(#[from] std::io::Error),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

impl Error {
    pub(crate) fn argument(msg: impl Into<String>) -> Self {
        Error::Argument(msg.into())
    }
}
