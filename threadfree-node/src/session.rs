use std::io;

use crate::channel::{Connector, SecureChannel};
use crate::credential::Credential;
use crate::provision::Provisioner;
use crate::{Error, Result};

pub(crate) fn check_host(host: &str) -> Result<()> {
    if host.trim().is_empty() {
        return Err(Error::argument("need a hub hostname"));
    }
    Ok(())
}

/// Durable channel to a hub, authenticated with the application credential
pub struct HubSession {
    host: String,
    identity: String,
    channel: Box<dyn SecureChannel>,
}

impl HubSession {
    /// Connect with the stored credential for `host`, pairing first if there
    /// is none
    pub async fn open(host: &str, application_name: &str, provisioner: &Provisioner) -> Result<Self> {
        check_host(host)?;
        let credential = match provisioner.store().load(host)? {
            Some(credential) => {
                tracing::info!(host, identity = credential.identity(), "using stored credential");
                credential
            }
            None => {
                tracing::info!(host, "no stored credential, pairing with hub");
                provisioner.provision(host, application_name).await?
            }
        };
        Self::connect(host, &credential, provisioner.connector()).await
    }

    /// Connect with a credential supplied by the caller, bypassing the store
    pub async fn connect(host: &str, credential: &Credential, connector: &dyn Connector) -> Result<Self> {
        check_host(host)?;
        let channel = connector.connect(host, credential).await?;
        tracing::info!(host, identity = credential.identity(), "session open");
        Ok(Self {
            host: host.to_string(),
            identity: credential.identity().to_string(),
            channel,
        })
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }

    pub fn channel(&mut self) -> &mut dyn SecureChannel {
        self.channel.as_mut()
    }

    pub async fn close(self) -> io::Result<()> {
        tracing::debug!(host = %self.host, "closing session");
        self.channel.close().await
    }
}
