use crate::{bus, ingress, k8s, oidc, reconciler};
use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::net::SocketAddr;
use tokio::time::Duration;
use tracing::{info, warn};

const PING_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Parser)]
#[clap(
    name = "rollout-controller",
    about = "Restarts workloads when CI publishes new image tags",
    version
)]
pub struct Args {
    #[clap(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Authenticates CI events and republishes them on the broker channel.
    Ingress(IngressArgs),

    /// Consumes the event channel and restarts matching workloads.
    Reconciler(ReconcilerArgs),
}

#[derive(Debug, Parser)]
struct CommonArgs {
    #[clap(long, env = "ROLLOUT_LOG_LEVEL", default_value = "info")]
    log_level: kubert::LogFilter,

    #[clap(long, env = "ROLLOUT_LOG_FORMAT", default_value = "plain")]
    log_format: kubert::LogFormat,

    /// Broker address (host:port).
    #[clap(long, env = "ROLLOUT_BROKER_ADDR")]
    broker_addr: Option<String>,

    /// Pub/sub channel carrying validated events.
    #[clap(long, env = "ROLLOUT_BROKER_CHANNEL", default_value = "kuberollouttrigger")]
    broker_channel: String,

    #[clap(long, env = "ROLLOUT_BROKER_USERNAME")]
    broker_username: Option<String>,

    #[clap(long, env = "ROLLOUT_BROKER_PASSWORD", hide_env_values = true)]
    broker_password: Option<String>,

    /// Enables TLS on the broker connection.
    #[clap(long, env = "ROLLOUT_BROKER_TLS")]
    broker_tls: bool,

    /// Required prefix of the envelope image field.
    #[clap(long, env = "ROLLOUT_ALLOWED_PREFIX")]
    allowed_prefix: Option<String>,
}

#[derive(Debug, Parser)]
struct IngressArgs {
    #[clap(flatten)]
    common: CommonArgs,

    /// HTTP listen address.
    #[clap(long, env = "ROLLOUT_LISTEN_ADDR", default_value = "0.0.0.0:8080")]
    listen_addr: SocketAddr,

    /// Required token audience.
    #[clap(long, env = "ROLLOUT_AUDIENCE")]
    audience: Option<String>,

    /// Repository owner allowed to trigger rollouts.
    #[clap(long, env = "ROLLOUT_ALLOWED_OWNER")]
    allowed_owner: Option<String>,

    /// Disables token signature and claim checks. The owner check still
    /// applies. Never enable in production.
    #[clap(long, env = "ROLLOUT_DEV_MODE")]
    dev_mode: bool,
}

#[derive(Debug, Parser)]
struct ReconcilerArgs {
    #[clap(flatten)]
    common: CommonArgs,

    #[clap(flatten)]
    client: kubert::ClientArgs,
}

impl Args {
    #[inline]
    pub async fn parse_and_run() -> Result<()> {
        Self::parse().run().await
    }

    pub async fn run(self) -> Result<()> {
        match self.command {
            Command::Ingress(args) => args.run().await,
            Command::Reconciler(args) => args.run().await,
        }
    }
}

impl IngressArgs {
    async fn run(self) -> Result<()> {
        let Self {
            common,
            listen_addr,
            audience,
            allowed_owner,
            dev_mode,
        } = self;
        let CommonArgs {
            log_level,
            log_format,
            broker_addr,
            broker_channel,
            broker_username,
            broker_password,
            broker_tls,
            allowed_prefix,
        } = common;

        log_format
            .try_init(log_level)
            .expect("must configure logging");

        let mut missing = Vec::new();
        let broker_addr = require(&mut missing, broker_addr, "--broker-addr / ROLLOUT_BROKER_ADDR");
        let audience = require(&mut missing, audience, "--audience / ROLLOUT_AUDIENCE");
        let allowed_owner = require(
            &mut missing,
            allowed_owner,
            "--allowed-owner / ROLLOUT_ALLOWED_OWNER",
        );
        let allowed_prefix = require(
            &mut missing,
            allowed_prefix,
            "--allowed-prefix / ROLLOUT_ALLOWED_PREFIX",
        );
        if !missing.is_empty() {
            bail!("missing required configuration: {}", missing.join(", "));
        }

        if dev_mode {
            warn!(
                "DEV MODE ENABLED: token signature and claim checks are disabled; \
                 do not use in production"
            );
        }

        info!(
            version = env!("CARGO_PKG_VERSION"),
            %listen_addr,
            broker_addr = %broker_addr,
            broker_channel = %broker_channel,
            broker_tls,
            %audience,
            %allowed_owner,
            %allowed_prefix,
            dev_mode,
            "starting ingress",
        );

        let broker = bus::BrokerConfig {
            addr: broker_addr.clone(),
            username: broker_username,
            password: broker_password,
            tls: broker_tls,
            channel: broker_channel,
        };
        let publisher = bus::Publisher::new(&broker)?;
        tokio::time::timeout(PING_TIMEOUT, publisher.ping())
            .await
            .map_err(|_| anyhow::anyhow!("timed out"))
            .and_then(|res| res.map_err(Into::into))
            .with_context(|| format!("failed to connect to broker at {broker_addr}"))?;
        info!(broker = %broker_addr, "connected to broker");

        let validator = oidc::Validator::new(audience, allowed_owner, dev_mode);
        let server = ingress::Ingress::new(validator, publisher, allowed_prefix);

        let (drain_tx, drain_rx) = drain::channel();
        tokio::spawn(async move {
            shutdown_signal().await;
            drain_tx.drain().await;
        });

        ingress::serve(listen_addr, server, drain_rx).await
    }
}

impl ReconcilerArgs {
    async fn run(self) -> Result<()> {
        let Self { common, client } = self;
        let CommonArgs {
            log_level,
            log_format,
            broker_addr,
            broker_channel,
            broker_username,
            broker_password,
            broker_tls,
            allowed_prefix,
        } = common;

        log_format
            .try_init(log_level)
            .expect("must configure logging");

        let mut missing = Vec::new();
        let broker_addr = require(&mut missing, broker_addr, "--broker-addr / ROLLOUT_BROKER_ADDR");
        let allowed_prefix = require(
            &mut missing,
            allowed_prefix,
            "--allowed-prefix / ROLLOUT_ALLOWED_PREFIX",
        );
        if !missing.is_empty() {
            bail!("missing required configuration: {}", missing.join(", "));
        }

        info!(
            version = env!("CARGO_PKG_VERSION"),
            broker_addr = %broker_addr,
            broker_channel = %broker_channel,
            broker_tls,
            %allowed_prefix,
            "starting reconciler",
        );

        let client = client
            .try_client()
            .await
            .context("failed to initialize cluster client")?;
        let restarter = k8s::Restarter::new(client);

        let broker = bus::BrokerConfig {
            addr: broker_addr.clone(),
            username: broker_username,
            password: broker_password,
            tls: broker_tls,
            channel: broker_channel,
        };
        let subscriber = bus::Subscriber::new(&broker)?;
        tokio::time::timeout(PING_TIMEOUT, subscriber.ping())
            .await
            .map_err(|_| anyhow::anyhow!("timed out"))
            .and_then(|res| res.map_err(Into::into))
            .with_context(|| format!("failed to connect to broker at {broker_addr}"))?;
        info!(broker = %broker_addr, "connected to broker");

        let (drain_tx, drain_rx) = drain::channel();
        tokio::spawn(async move {
            shutdown_signal().await;
            drain_tx.drain().await;
        });

        reconciler::run(subscriber, restarter, allowed_prefix, drain_rx).await
    }
}

fn require(missing: &mut Vec<&'static str>, value: Option<String>, name: &'static str) -> String {
    match value {
        Some(value) if !value.is_empty() => value,
        _ => {
            missing.push(name);
            String::new()
        }
    }
}

async fn shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    let mut sigint = signal(SignalKind::interrupt()).expect("must register SIGINT handler");
    let mut sigterm = signal(SignalKind::terminate()).expect("must register SIGTERM handler");
    tokio::select! {
        _ = sigint.recv() => info!("received SIGINT, shutting down"),
        _ = sigterm.recv() => info!("received SIGTERM, shutting down"),
    }
}
