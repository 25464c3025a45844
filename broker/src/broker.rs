//! MQTT 3.1.1 broker lifecycle.
//!
//! A [`Broker`] owns the topic router, the session registry and the
//! dispatcher. [`Broker::start`] binds the listener and spawns the accept
//! loop and the retry loop; [`Broker::stop`] drains connections and releases
//! the port. A stopped broker can be started again and keeps its sessions
//! and retained messages.
//!
//! ```no_run
//! use std::time::Duration;
//! use shoepad_broker::{Broker, BrokerConfig};
//!
//! # async fn run() -> shoepad_broker::Result<()> {
//! let broker = Broker::builder(BrokerConfig::new("127.0.0.1:1883"))
//!     .on_connect(|id| println!("{} connected", id))
//!     .build();
//! let addr = broker.start().await?;
//! println!("listening on {}", addr);
//! broker.stop(Duration::from_secs(1)).await;
//! # Ok(())
//! # }
//! ```

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::connection;
use crate::dispatcher::{DeliveryConfig, DeliveryFailure, DeliveryReceipt, Dispatcher};
use crate::error::{Error, Result};
use crate::protocol::MAX_PACKET_SIZE;
use crate::router::TopicRouter;
use crate::session::SessionRegistry;
use crate::store::{NoopStore, Store};
use crate::topic::validate_topic;
use crate::types::{AllowAll, Authenticator, Handler, Message, QoS};

/// Callback type alias.
type Callback = Arc<dyn Fn(&str) + Send + Sync>;

/// Broker configuration.
///
/// Deserializable with every field optional, so a config file only needs
/// the values it changes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    /// Listen address (host:port).
    pub addr: String,
    /// Maximum packet size.
    pub max_packet_size: usize,
    /// Enable $SYS event publishing.
    pub sys_events_enabled: bool,
    /// Time allowed between accept and CONNECT.
    pub connect_timeout_ms: u64,
    /// Outbound packets buffered per connection.
    pub outbound_queue_capacity: usize,
    /// Unacknowledged QoS 1/2 deliveries per session.
    pub max_inflight: usize,
    /// Queued messages per session beyond the in-flight window.
    pub max_pending_messages: usize,
    /// Redelivery interval for unacknowledged messages.
    pub retry_interval_ms: u64,
    /// Redeliveries before a message is dropped.
    pub max_delivery_retries: u32,
    /// Time a closing connection gets to flush its queue.
    pub drain_timeout_ms: u64,
    /// Disconnect subscribers whose outbound queue overflows.
    pub disconnect_slow_consumers: bool,
    /// Highest QoS granted to subscriptions.
    pub max_qos: QoS,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            addr: "0.0.0.0:1883".to_string(),
            max_packet_size: MAX_PACKET_SIZE,
            sys_events_enabled: true,
            connect_timeout_ms: 5_000,
            outbound_queue_capacity: 100,
            max_inflight: 32,
            max_pending_messages: 1_000,
            retry_interval_ms: 5_000,
            max_delivery_retries: 5,
            drain_timeout_ms: 1_000,
            disconnect_slow_consumers: false,
            max_qos: QoS::ExactlyOnce,
        }
    }
}

impl BrokerConfig {
    /// Create a new broker config.
    pub fn new(addr: impl Into<String>) -> Self {
        Self {
            addr: addr.into(),
            ..Default::default()
        }
    }

    /// Enable or disable $SYS events.
    pub fn sys_events(mut self, enabled: bool) -> Self {
        self.sys_events_enabled = enabled;
        self
    }

    /// Set the maximum packet size.
    pub fn max_packet_size(mut self, size: usize) -> Self {
        self.max_packet_size = size;
        self
    }

    /// Set the CONNECT timeout.
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout_ms = timeout.as_millis() as u64;
        self
    }

    /// Set the per-connection outbound queue capacity.
    pub fn outbound_queue_capacity(mut self, capacity: usize) -> Self {
        self.outbound_queue_capacity = capacity;
        self
    }

    /// Set the in-flight window.
    pub fn max_inflight(mut self, max: usize) -> Self {
        self.max_inflight = max;
        self
    }

    /// Set the pending queue bound.
    pub fn max_pending_messages(mut self, max: usize) -> Self {
        self.max_pending_messages = max;
        self
    }

    /// Set the redelivery interval.
    pub fn retry_interval(mut self, interval: Duration) -> Self {
        self.retry_interval_ms = interval.as_millis() as u64;
        self
    }

    /// Set the number of redeliveries before a message is dropped.
    pub fn max_delivery_retries(mut self, retries: u32) -> Self {
        self.max_delivery_retries = retries;
        self
    }

    /// Set the per-connection drain timeout.
    pub fn drain_timeout(mut self, timeout: Duration) -> Self {
        self.drain_timeout_ms = timeout.as_millis() as u64;
        self
    }

    /// Disconnect subscribers that cannot keep up.
    pub fn disconnect_slow_consumers(mut self, enabled: bool) -> Self {
        self.disconnect_slow_consumers = enabled;
        self
    }

    /// Cap granted subscription QoS.
    pub fn max_qos(mut self, qos: QoS) -> Self {
        self.max_qos = qos;
        self
    }

    /// Check values that would make the broker misbehave.
    pub fn validate(&self) -> Result<()> {
        if self.addr.is_empty() {
            return Err(Error::InvalidConfig("addr is empty".to_string()));
        }
        if self.outbound_queue_capacity == 0 {
            return Err(Error::InvalidConfig(
                "outbound_queue_capacity must be positive".to_string(),
            ));
        }
        if self.max_inflight == 0 {
            return Err(Error::InvalidConfig("max_inflight must be positive".to_string()));
        }
        if self.max_inflight > usize::from(u16::MAX) {
            return Err(Error::InvalidConfig(format!(
                "max_inflight must not exceed {} packet ids",
                u16::MAX
            )));
        }
        if self.retry_interval_ms == 0 {
            return Err(Error::InvalidConfig(
                "retry_interval_ms must be positive".to_string(),
            ));
        }
        if self.max_packet_size < 2 {
            return Err(Error::InvalidConfig("max_packet_size too small".to_string()));
        }
        Ok(())
    }

    fn delivery(&self) -> DeliveryConfig {
        DeliveryConfig {
            max_inflight: self.max_inflight,
            max_pending: self.max_pending_messages,
            retry_interval: Duration::from_millis(self.retry_interval_ms),
            max_retries: self.max_delivery_retries,
            disconnect_slow_consumers: self.disconnect_slow_consumers,
        }
    }
}

/// Builder for Broker.
pub struct BrokerBuilder {
    config: BrokerConfig,
    authenticator: Option<Arc<dyn Authenticator>>,
    handler: Option<Arc<dyn Handler>>,
    on_connect: Option<Callback>,
    on_disconnect: Option<Callback>,
    on_delivery_failure: Option<Arc<dyn Fn(&DeliveryFailure) + Send + Sync>>,
    store: Option<Arc<dyn Store>>,
}

impl BrokerBuilder {
    /// Create a new broker builder.
    pub fn new(config: BrokerConfig) -> Self {
        Self {
            config,
            authenticator: None,
            handler: None,
            on_connect: None,
            on_disconnect: None,
            on_delivery_failure: None,
            store: None,
        }
    }

    /// Set the authenticator.
    pub fn authenticator<A: Authenticator + 'static>(mut self, auth: A) -> Self {
        self.authenticator = Some(Arc::new(auth));
        self
    }

    /// Set the message handler.
    pub fn handler<H: Handler + 'static>(mut self, handler: H) -> Self {
        self.handler = Some(Arc::new(handler));
        self
    }

    /// Set the on_connect callback.
    pub fn on_connect<F: Fn(&str) + Send + Sync + 'static>(mut self, f: F) -> Self {
        self.on_connect = Some(Arc::new(f));
        self
    }

    /// Set the on_disconnect callback.
    pub fn on_disconnect<F: Fn(&str) + Send + Sync + 'static>(mut self, f: F) -> Self {
        self.on_disconnect = Some(Arc::new(f));
        self
    }

    /// Set the delivery failure callback.
    pub fn on_delivery_failure<F>(mut self, f: F) -> Self
    where
        F: Fn(&DeliveryFailure) + Send + Sync + 'static,
    {
        self.on_delivery_failure = Some(Arc::new(f));
        self
    }

    /// Set the persistence hooks.
    pub fn store<S: Store + 'static>(mut self, store: S) -> Self {
        self.store = Some(Arc::new(store));
        self
    }

    /// Build the broker.
    pub fn build(self) -> Broker {
        let store = self.store.unwrap_or_else(|| Arc::new(NoopStore));
        let router = Arc::new(TopicRouter::new());
        let registry = Arc::new(SessionRegistry::new(Arc::clone(&router), Arc::clone(&store)));

        let mut dispatcher = Dispatcher::new(
            Arc::clone(&router),
            Arc::clone(&registry),
            Arc::clone(&store),
            self.config.delivery(),
        );
        if let Some(on_failure) = self.on_delivery_failure {
            dispatcher = dispatcher.with_failure_callback(on_failure);
        }

        Broker {
            ctx: Arc::new(BrokerContext {
                config: self.config,
                router,
                registry,
                dispatcher: Arc::new(dispatcher),
                authenticator: self.authenticator.unwrap_or_else(|| Arc::new(AllowAll)),
                handler: self.handler,
                on_connect: self.on_connect,
                on_disconnect: self.on_disconnect,
            }),
            store,
            lifecycle: tokio::sync::Mutex::new(None),
            local_addr: Mutex::new(None),
            restored: AtomicBool::new(false),
        }
    }
}

/// State shared by the accept loop and every connection task.
pub(crate) struct BrokerContext {
    pub config: BrokerConfig,
    pub router: Arc<TopicRouter>,
    pub registry: Arc<SessionRegistry>,
    pub dispatcher: Arc<Dispatcher>,
    pub authenticator: Arc<dyn Authenticator>,
    pub handler: Option<Arc<dyn Handler>>,
    pub on_connect: Option<Callback>,
    pub on_disconnect: Option<Callback>,
}

/// Handles of a running broker.
struct Running {
    local_addr: SocketAddr,
    /// Graceful: stop accepting, disconnect clients, flush.
    shutdown: CancellationToken,
    /// Drop remaining sockets.
    force: CancellationToken,
    /// Fired once `stop` has finished.
    stopped: CancellationToken,
    tracker: TaskTracker,
}

/// MQTT 3.1.1 broker.
pub struct Broker {
    ctx: Arc<BrokerContext>,
    store: Arc<dyn Store>,
    /// Serializes start and stop.
    lifecycle: tokio::sync::Mutex<Option<Running>>,
    local_addr: Mutex<Option<SocketAddr>>,
    restored: AtomicBool,
}

impl Broker {
    /// Create a new broker with the given config.
    pub fn new(config: BrokerConfig) -> Self {
        BrokerBuilder::new(config).build()
    }

    /// Create a builder for this broker.
    pub fn builder(config: BrokerConfig) -> BrokerBuilder {
        BrokerBuilder::new(config)
    }

    /// Broker configuration.
    pub fn config(&self) -> &BrokerConfig {
        &self.ctx.config
    }

    /// Topic router.
    pub fn router(&self) -> &Arc<TopicRouter> {
        &self.ctx.router
    }

    /// Session registry.
    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.ctx.registry
    }

    /// Delivery engine.
    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.ctx.dispatcher
    }

    /// Bound address while running.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock()
    }

    pub fn is_running(&self) -> bool {
        self.local_addr.lock().is_some()
    }

    /// Bind the listener and start accepting connections.
    ///
    /// Returns the bound address. Calling `start` on a running broker
    /// returns the current address without rebinding.
    pub async fn start(&self) -> Result<SocketAddr> {
        let mut lifecycle = self.lifecycle.lock().await;
        if let Some(ref running) = *lifecycle {
            return Ok(running.local_addr);
        }

        self.ctx.config.validate()?;
        self.restore();

        let listener = TcpListener::bind(&self.ctx.config.addr)
            .await
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::AddrInUse => Error::AddressInUse {
                    addr: self.ctx.config.addr.clone(),
                    source: e,
                },
                _ => Error::Io(e),
            })?;
        let local_addr = listener.local_addr()?;

        let running = Running {
            local_addr,
            shutdown: CancellationToken::new(),
            force: CancellationToken::new(),
            stopped: CancellationToken::new(),
            tracker: TaskTracker::new(),
        };

        running.tracker.spawn(accept_loop(
            listener,
            Arc::clone(&self.ctx),
            running.shutdown.clone(),
            running.force.clone(),
            running.tracker.clone(),
        ));
        running.tracker.spawn(
            Arc::clone(&self.ctx.dispatcher).run_retry_loop(running.shutdown.clone()),
        );

        info!("Broker listening on {}", local_addr);
        *self.local_addr.lock() = Some(local_addr);
        *lifecycle = Some(running);
        Ok(local_addr)
    }

    /// Stop the broker.
    ///
    /// Stops accepting, asks every connection to disconnect, waits up to
    /// `drain_timeout` for them, then closes the rest. Persistent sessions
    /// are saved to the store. No-op when the broker is not running.
    pub async fn stop(&self, drain_timeout: Duration) {
        let mut lifecycle = self.lifecycle.lock().await;
        let Some(running) = lifecycle.take() else {
            return;
        };

        info!("Stopping broker on {}", running.local_addr);
        running.shutdown.cancel();
        running.tracker.close();

        if tokio::time::timeout(drain_timeout, running.tracker.wait())
            .await
            .is_err()
        {
            warn!(
                "Drain timeout elapsed, closing {} remaining tasks",
                running.tracker.len()
            );
            running.force.cancel();
            running.tracker.wait().await;
        }

        self.ctx.registry.save_persistent();
        *self.local_addr.lock() = None;
        running.stopped.cancel();
        info!("Broker stopped");
    }

    /// Start the broker and wait until it is stopped.
    pub async fn serve(&self) -> Result<()> {
        self.start().await?;
        let stopped = {
            let lifecycle = self.lifecycle.lock().await;
            lifecycle.as_ref().map(|running| running.stopped.clone())
        };
        if let Some(stopped) = stopped {
            stopped.cancelled().await;
        }
        Ok(())
    }

    /// Publish a message from the broker itself.
    pub fn publish(&self, msg: Message) -> Result<DeliveryReceipt> {
        validate_topic(&msg.topic)?;
        Ok(self.ctx.dispatcher.publish(&msg, None))
    }

    /// Load retained messages and persistent sessions on first start.
    fn restore(&self) {
        if self.restored.swap(true, Ordering::SeqCst) {
            return;
        }

        match self.store.load_retained() {
            Ok(messages) => {
                for msg in messages {
                    let topic = msg.topic.clone();
                    self.ctx.router.set_retained(&topic, msg);
                }
            }
            Err(e) => warn!("Failed to load retained messages: {}", e),
        }

        match self.store.load_sessions() {
            Ok(snapshots) => {
                let count = snapshots.len();
                for snapshot in snapshots {
                    self.ctx.registry.restore(snapshot);
                }
                if count > 0 {
                    info!("Restored {} persistent sessions", count);
                }
            }
            Err(e) => warn!("Failed to load sessions: {}", e),
        }
    }
}

async fn accept_loop(
    listener: TcpListener,
    ctx: Arc<BrokerContext>,
    shutdown: CancellationToken,
    force: CancellationToken,
    tracker: TaskTracker,
) {
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, addr)) => {
                    debug!("Accepted connection from {}", addr);
                    let _ = stream.set_nodelay(true);
                    tracker.spawn(connection::serve(
                        Arc::clone(&ctx),
                        stream,
                        addr,
                        shutdown.clone(),
                        force.clone(),
                    ));
                }
                Err(e) => {
                    warn!("Accept failed: {}", e);
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            },
        }
    }
    debug!("Accept loop stopped");
}
