#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

//! The publish/subscribe bridge between the ingress and reconciler halves.
//!
//! Events travel over a single named channel on a Redis-wire broker.
//! Delivery is at-most-once: the broker keeps no queue, so anything published
//! while no subscriber is connected is dropped. The reconciler compensates by
//! reconnecting promptly, not by replay.

use futures::StreamExt;
use thiserror::Error;

/// Broker connection settings shared by both halves.
#[derive(Clone, Debug)]
pub struct BrokerConfig {
    /// `host:port` of the broker.
    pub addr: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub tls: bool,
    /// Channel carrying validated event envelopes.
    pub channel: String,
}

#[derive(Debug, Error)]
pub enum BusError {
    #[error("invalid broker address {0:?} (expected host:port)")]
    Addr(String),

    #[error("failed to connect to broker: {0}")]
    Connect(#[source] redis::RedisError),

    #[error("failed to publish to channel {channel:?}: {source}")]
    Publish {
        channel: String,
        #[source]
        source: redis::RedisError,
    },

    #[error("broker subscription failed: {0}")]
    Subscribe(#[source] redis::RedisError),

    #[error("broker ping failed: {0}")]
    Ping(#[source] redis::RedisError),
}

/// Why a subscription dispatch loop returned.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SubscribeEnd {
    /// The shutdown signal fired; the caller should exit.
    Shutdown,
    /// The broker dropped the connection; the caller should reconnect.
    Disconnected,
}

impl BrokerConfig {
    fn connection_info(&self) -> Result<redis::ConnectionInfo, BusError> {
        let (host, port) = self
            .addr
            .rsplit_once(':')
            .ok_or_else(|| BusError::Addr(self.addr.clone()))?;
        let port: u16 = port.parse().map_err(|_| BusError::Addr(self.addr.clone()))?;

        let addr = if self.tls {
            redis::ConnectionAddr::TcpTls {
                host: host.to_string(),
                port,
                insecure: false,
                tls_params: None,
            }
        } else {
            redis::ConnectionAddr::Tcp(host.to_string(), port)
        };

        Ok(redis::ConnectionInfo {
            addr,
            redis: redis::RedisConnectionInfo {
                username: self.username.clone(),
                password: self.password.clone(),
                ..Default::default()
            },
        })
    }
}

/// Publishes envelopes to the broker channel.
///
/// Holds one multiplexed connection, established lazily and safe for
/// concurrent use. Publishing is fire-and-forget; a failure is reported to
/// the caller, which may retry at its discretion.
pub struct Publisher {
    client: redis::Client,
    channel: String,
    conn: tokio::sync::OnceCell<redis::aio::MultiplexedConnection>,
}

impl Publisher {
    pub fn new(config: &BrokerConfig) -> Result<Self, BusError> {
        let client = redis::Client::open(config.connection_info()?).map_err(BusError::Connect)?;
        Ok(Self {
            client,
            channel: config.channel.clone(),
            conn: tokio::sync::OnceCell::new(),
        })
    }

    async fn connection(&self) -> Result<redis::aio::MultiplexedConnection, BusError> {
        let conn = self
            .conn
            .get_or_try_init(|| self.client.get_multiplexed_async_connection())
            .await
            .map_err(BusError::Connect)?;
        Ok(conn.clone())
    }

    pub async fn publish(&self, payload: &[u8]) -> Result<(), BusError> {
        let mut conn = self.connection().await?;
        let receivers: i64 = redis::cmd("PUBLISH")
            .arg(&self.channel)
            .arg(payload)
            .query_async(&mut conn)
            .await
            .map_err(|source| BusError::Publish {
                channel: self.channel.clone(),
                source,
            })?;
        tracing::debug!(channel = %self.channel, receivers, "published message");
        Ok(())
    }

    pub async fn ping(&self) -> Result<(), BusError> {
        let mut conn = self.connection().await?;
        let _: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(BusError::Ping)?;
        Ok(())
    }
}

/// Consumes the broker channel and hands each message to a handler.
pub struct Subscriber {
    client: redis::Client,
    channel: String,
}

impl Subscriber {
    pub fn new(config: &BrokerConfig) -> Result<Self, BusError> {
        let client = redis::Client::open(config.connection_info()?).map_err(BusError::Connect)?;
        Ok(Self {
            client,
            channel: config.channel.clone(),
        })
    }

    pub async fn ping(&self) -> Result<(), BusError> {
        let mut conn = self
            .client
            .get_multiplexed_async_connection()
            .await
            .map_err(BusError::Connect)?;
        let _: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(BusError::Ping)?;
        Ok(())
    }

    /// Subscribes to the channel and dispatches messages to `handler` one at
    /// a time, in receive order. The next message is not read until the
    /// handler's future resolves, so a slow handler backpressures the
    /// subscription rather than fanning out.
    ///
    /// When `shutdown` fires, the in-flight handler is allowed to finish and
    /// the loop returns [`SubscribeEnd::Shutdown`]. A broker disconnect
    /// returns [`SubscribeEnd::Disconnected`] so the caller can back off and
    /// resubscribe.
    pub async fn subscribe<H, Fut>(
        &self,
        shutdown: drain::Watch,
        mut handler: H,
    ) -> Result<SubscribeEnd, BusError>
    where
        H: FnMut(Vec<u8>) -> Fut,
        Fut: std::future::Future<Output = ()>,
    {
        let mut pubsub = self
            .client
            .get_async_pubsub()
            .await
            .map_err(BusError::Connect)?;
        pubsub
            .subscribe(&self.channel)
            .await
            .map_err(BusError::Subscribe)?;
        tracing::info!(channel = %self.channel, "subscribed to broker channel");

        let mut stream = pubsub.on_message();
        let shutdown = shutdown.signaled();
        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    tracing::info!(channel = %self.channel, "shutting down broker subscriber");
                    return Ok(SubscribeEnd::Shutdown);
                }
                msg = stream.next() => match msg {
                    Some(msg) => handler(msg.get_payload_bytes().to_vec()).await,
                    None => {
                        tracing::warn!(channel = %self.channel, "broker subscription closed");
                        return Ok(SubscribeEnd::Disconnected);
                    }
                },
            }
        }
    }
}
