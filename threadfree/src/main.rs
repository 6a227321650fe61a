use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::{CommandFactory, Parser};
use threadfree_node::{
    CoapExchange, Credential, CredentialStore, DtlsConfig, DtlsConnector, Error, HubSession,
    KeyringStore, MemoryStore, Provisioner, RampConfig, RampController, RampSummary, StdinPrompt,
};
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "threadfree", version)]
#[command(about = "Better wake-up light for TRÅDFRI hubs")]
#[command(long_about = "Better wake-up light for TRÅDFRI hubs.\n\n\
    Fades one lamp from dim red to bright white, like a sunrise, over the \
    given number of seconds. The first run against a hub asks for the \
    security key printed on its back and stores the key the hub issues in \
    the OS keyring.")]
struct Cli {
    /// Hub hostname or IP address
    hub: String,

    /// Lamp id as shown by the hub, e.g. 65537
    lamp_id: u32,

    /// Ramp duration in seconds
    #[arg(default_value_t = 1800)]
    duration: u64,

    /// Application name the hub key is issued for
    #[arg(long, env = "THREADFREE_APP_NAME", default_value = "ThreadFree")]
    app_name: String,

    /// Interval between light updates in milliseconds
    #[arg(long, env = "THREADFREE_TICK_MS", default_value_t = 1000,
          value_parser = clap::value_parser!(u64).range(1..))]
    tick_ms: u64,

    /// How long to wait for each light update, capped at the tick interval
    #[arg(long, env = "THREADFREE_REQUEST_TIMEOUT_MS", default_value_t = 900)]
    request_timeout_ms: u64,

    /// Hub DTLS port
    #[arg(long, env = "THREADFREE_PORT", default_value_t = threadfree_node::dtls::DEFAULT_PORT)]
    port: u16,

    /// Keyring service the credential is stored under
    #[arg(long, env = "THREADFREE_KEYRING_SERVICE", default_value = "threadfree")]
    keyring_service: String,

    /// Use this identity instead of the stored credential
    #[arg(long, env = "THREADFREE_IDENTITY")]
    identity: Option<String>,

    /// Pre-shared key for --identity
    #[arg(long, env = "THREADFREE_KEY", hide_env_values = true)]
    key: Option<String>,

    /// Remove the stored credential first and pair again
    #[arg(long, conflicts_with_all = ["identity", "key"])]
    forget: bool,

    /// Keep the credential in memory only
    #[arg(long, conflicts_with = "forget")]
    no_store: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            let _ = e.print();
            return if e.use_stderr() {
                ExitCode::FAILURE
            } else {
                ExitCode::SUCCESS
            };
        }
    };

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "threadfree=info,threadfree_node=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    match run(cli).await {
        Ok(summary) if summary.failures > 0 => {
            warn!("{} of {} light updates failed", summary.failures, summary.ticks);
            ExitCode::SUCCESS
        }
        Ok(_) => ExitCode::SUCCESS,
        Err(e) => {
            match usage_error(&e) {
                Some(msg) => eprintln!("error: {msg}\n\n{}", Cli::command().render_usage()),
                None => error!("{e}"),
            }
            ExitCode::FAILURE
        }
    }
}

/// Only errors about the command line itself get the usage text
fn usage_error(e: &Error) -> Option<&str> {
    match e {
        Error::Argument(msg) => Some(msg),
        _ => None,
    }
}

async fn run(cli: Cli) -> threadfree_node::Result<RampSummary> {
    let connector = Arc::new(DtlsConnector::new(DtlsConfig {
        port: cli.port,
        ..DtlsConfig::default()
    }));
    let exchange = Arc::new(CoapExchange::new());

    // Nothing after the session opens may return early
    let mut ramp = RampController::new(exchange.clone(), &cli.lamp_id.to_string(), ramp_config(&cli))?;
    let mut session = open_session(cli, connector, exchange).await?;
    let summary = ramp.run(session.channel(), shutdown_signal()).await;

    if let Err(e) = session.close().await {
        warn!("closing session: {e}");
    }
    Ok(summary)
}

fn ramp_config(cli: &Cli) -> RampConfig {
    RampConfig {
        duration: Duration::from_secs(cli.duration),
        tick: Duration::from_millis(cli.tick_ms),
        request_timeout: Duration::from_millis(cli.request_timeout_ms),
    }
}

async fn open_session(
    cli: Cli,
    connector: Arc<DtlsConnector>,
    exchange: Arc<CoapExchange>,
) -> threadfree_node::Result<HubSession> {
    match (cli.identity, cli.key) {
        (Some(identity), Some(key)) => {
            let credential = Credential::new(identity, key)?;
            HubSession::connect(&cli.hub, &credential, connector.as_ref()).await
        }
        (None, None) => {
            let store: Arc<dyn CredentialStore> = if cli.no_store {
                Arc::new(MemoryStore::new())
            } else {
                Arc::new(KeyringStore::new(cli.keyring_service))
            };
            if cli.forget && store.forget(&cli.hub)? {
                info!(hub = %cli.hub, "removed stored credential");
            }
            let provisioner = Provisioner::new(connector, exchange, store, Arc::new(StdinPrompt));
            HubSession::open(&cli.hub, &cli.app_name, &provisioner).await
        }
        _ => Err(Error::Argument(
            "--identity and --key must be given together".to_string(),
        )),
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("cannot listen for ctrl-c: {e}");
        std::future::pending::<()>().await;
    }
    info!("interrupted");
}
