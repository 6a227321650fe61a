//! Minting an application key with the factory security key
//!
//! The hub only accepts its printed security key together with the fixed
//! bootstrap identity, and only for one request: POST the application name to
//! `15011/9063` and read the new key from field `9091` of the reply. That key,
//! paired with the application name, is what every later session uses.

use std::io::{self, BufRead, Write};
use std::sync::Arc;
use std::time::Duration;

use threadfree_proto::FORMAT_JSON;
use threadfree_proto::payload::{PROVISION_PATH, ProvisioningRequest, ProvisioningResponse};
use zeroize::Zeroizing;

use crate::channel::Connector;
use crate::credential::{Credential, Secret};
use crate::exchange::{Exchange, Request, Response};
use crate::session::check_host;
use crate::store::CredentialStore;
use crate::{Error, Result};

pub const PROVISION_TIMEOUT: Duration = Duration::from_millis(2000);

/// Asks the operator for the security key printed on the hub
pub trait SecurityKeyPrompt: Send + Sync {
    fn security_key(&self, host: &str) -> io::Result<String>;
}

/// Prompts on the terminal and reads one line from stdin
pub struct StdinPrompt;

impl SecurityKeyPrompt for StdinPrompt {
    fn security_key(&self, host: &str) -> io::Result<String> {
        let mut stdout = io::stdout().lock();
        writeln!(
            stdout,
            "Please enter the security key (looks like kKskfSHjSkwSsdk) on the back of the hub {host}"
        )?;
        stdout.flush()?;

        let mut line = String::new();
        if io::stdin().lock().read_line(&mut line)? == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "no security key entered",
            ));
        }
        Ok(line.trim().to_string())
    }
}

#[derive(Debug, Clone)]
pub struct ProvisionConfig {
    /// How long to wait for the hub to answer the key request
    pub timeout: Duration,
}

impl Default for ProvisionConfig {
    fn default() -> Self {
        Self {
            timeout: PROVISION_TIMEOUT,
        }
    }
}

pub struct Provisioner {
    connector: Arc<dyn Connector>,
    exchange: Arc<dyn Exchange>,
    store: Arc<dyn CredentialStore>,
    prompt: Arc<dyn SecurityKeyPrompt>,
    config: ProvisionConfig,
}

impl Provisioner {
    pub fn new(
        connector: Arc<dyn Connector>,
        exchange: Arc<dyn Exchange>,
        store: Arc<dyn CredentialStore>,
        prompt: Arc<dyn SecurityKeyPrompt>,
    ) -> Self {
        Self {
            connector,
            exchange,
            store,
            prompt,
            config: ProvisionConfig::default(),
        }
    }

    pub fn with_config(mut self, config: ProvisionConfig) -> Self {
        self.config = config;
        self
    }

    pub fn connector(&self) -> &dyn Connector {
        self.connector.as_ref()
    }

    pub fn store(&self) -> &dyn CredentialStore {
        self.store.as_ref()
    }

    /// Mint and store a credential for `application_name` on `host`.
    ///
    /// Always runs the full exchange. The credential is stored only once the
    /// hub has returned a usable key, so a failure at any step leaves the
    /// store untouched.
    pub async fn provision(&self, host: &str, application_name: &str) -> Result<Credential> {
        check_host(host)?;
        if application_name.is_empty() {
            return Err(Error::argument("application name must not be empty"));
        }

        let security_key = self.ask_security_key(host).await?;
        if security_key.is_empty() {
            return Err(Error::SecurityKey("nothing entered".to_string()));
        }
        let bootstrap = Credential::bootstrap(security_key.as_str());

        tracing::info!(host, application = application_name, "requesting application key");
        let response = self.request_key(host, &bootstrap, application_name).await?;
        let credential = Credential::new(application_name, application_secret(&response)?)?;

        if let Err(e) = self.store.save(host, &credential) {
            tracing::error!(
                host,
                application = application_name,
                "hub issued a key that could not be stored, the next run will pair again: {e}"
            );
            return Err(e.into());
        }
        tracing::info!(host, application = application_name, "application key stored");
        Ok(credential)
    }

    async fn ask_security_key(&self, host: &str) -> Result<Zeroizing<String>> {
        let prompt = self.prompt.clone();
        let host = host.to_string();
        let answer = tokio::task::spawn_blocking(move || prompt.security_key(&host))
            .await
            .map_err(io::Error::other)?;
        match answer {
            Ok(key) => Ok(Zeroizing::new(key.trim().to_string())),
            Err(e) => Err(Error::SecurityKey(format!("cannot read from the operator: {e}"))),
        }
    }

    async fn request_key(
        &self,
        host: &str,
        bootstrap: &Credential,
        application_name: &str,
    ) -> Result<Response> {
        let request = Request::post(PROVISION_PATH).json(&ProvisioningRequest::new(application_name))?;

        let mut channel = self.connector.connect(host, bootstrap).await?;
        let reply = self
            .exchange
            .request(channel.as_mut(), &request, self.config.timeout)
            .await;
        // The bootstrap channel is done either way
        if let Err(e) = channel.close().await {
            tracing::debug!(host, "closing bootstrap channel: {e}");
        }

        reply?.ok_or_else(|| Error::ProvisioningTimeout {
            application: application_name.to_string(),
        })
    }
}

fn application_secret(response: &Response) -> Result<Secret> {
    let protocol = |reason: String, keys: Vec<String>| Error::ProvisioningProtocol { reason, keys };

    if !response.code.is_success() {
        return Err(protocol(format!("hub answered {}", response.code), Vec::new()));
    }
    if let Some(format) = response.content_format
        && format != FORMAT_JSON
    {
        return Err(protocol(
            format!("expected content format {FORMAT_JSON}, got {format}"),
            Vec::new(),
        ));
    }
    ProvisioningResponse::from_json(&response.payload)
        .map(|reply| Secret::from(reply.secret))
        .map_err(|e| protocol(e.to_string(), e.keys().to_vec()))
}
