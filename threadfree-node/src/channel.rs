use std::io;

use async_trait::async_trait;

use crate::Result;
use crate::credential::Credential;

/// Encrypted datagram session with one hub.
///
/// Dropping the channel releases it. `close` does the same but waits for the
/// peer to be told.
#[async_trait]
pub trait SecureChannel: Send {
    fn peer(&self) -> &str;

    async fn send(&mut self, datagram: &[u8]) -> io::Result<()>;

    /// Next datagram from the peer. Cancelling the future loses nothing.
    async fn recv(&mut self) -> io::Result<Vec<u8>>;

    async fn close(self: Box<Self>) -> io::Result<()>;
}

/// Opens a [`SecureChannel`] authenticated with a pre-shared key
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, host: &str, credential: &Credential) -> Result<Box<dyn SecureChannel>>;
}
