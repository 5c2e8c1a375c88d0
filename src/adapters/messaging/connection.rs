//! BrokerConnection - Owns the process-wide broker connection and channel.
//!
//! ```text
//!                  initialize()                 open ok
//!  Uninitialized ───────────────▶ Initializing ─────────▶ Ready
//!        ▲                           │   ▲                  │
//!        └──── open failed / ────────┘   └── disconnect ────┘
//!              recovery off                 (recovery on)
//!
//!  close(): any state ──▶ Closed (terminal)
//! ```
//!
//! Opening, recovery, and closing are serialized by one async mutex. Once
//! `Ready`, publishers and consumers read the shared channel from a
//! `watch` cell without taking that lock.
//!
//! A link that is replaced is retired, and every retired link is closed
//! (channel, then connection) under the same mutex before the next open
//! and on `close()`.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use tokio::sync::{watch, Mutex};
use tokio_util::sync::CancellationToken;

use crate::config::BrokerConfig;
use crate::ports::{BrokerChannel, BrokerError, BrokerTransport, ConnectOptions};

/// Observable lifecycle state of a [`BrokerConnection`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Uninitialized,
    Initializing,
    Ready,
    Closed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnectionState::Uninitialized => "uninitialized",
            ConnectionState::Initializing => "initializing",
            ConnectionState::Ready => "ready",
            ConnectionState::Closed => "closed",
        };
        write!(f, "{}", s)
    }
}

#[derive(Clone)]
enum Link {
    Uninitialized,
    Initializing,
    Ready(Arc<dyn BrokerChannel>),
    Closed,
}

impl Link {
    fn state(&self) -> ConnectionState {
        match self {
            Link::Uninitialized => ConnectionState::Uninitialized,
            Link::Initializing => ConnectionState::Initializing,
            Link::Ready(_) => ConnectionState::Ready,
            Link::Closed => ConnectionState::Closed,
        }
    }
}

/// Connection settings resolved from [`BrokerConfig`].
#[derive(Debug, Clone)]
pub struct ConnectionSettings {
    pub connect: ConnectOptions,
    pub exchange: String,
    pub automatic_recovery: bool,
    pub recovery_interval: Duration,
}

impl From<&BrokerConfig> for ConnectionSettings {
    fn from(config: &BrokerConfig) -> Self {
        Self {
            connect: config.connect_options(),
            exchange: config.exchange.clone(),
            automatic_recovery: config.automatic_recovery,
            recovery_interval: config.recovery_interval(),
        }
    }
}

struct Inner {
    transport: Arc<dyn BrokerTransport>,
    settings: ConnectionSettings,
    link: watch::Sender<Link>,
    init_lock: Mutex<()>,
    retired: StdMutex<Vec<Arc<dyn BrokerChannel>>>,
    recovering: AtomicBool,
    shutdown: CancellationToken,
}

/// Shared handle to the broker connection. Cloning is cheap; every clone
/// refers to the same connection.
///
/// # Example
///
/// ```ignore
/// let connection = BrokerConnection::new(Arc::new(LapinTransport::new()), &config.broker);
/// connection.initialize(&CancellationToken::new()).await?;
///
/// let publisher = BrokerPublisher::new(connection.clone());
/// let consumer = BrokerConsumer::new(connection.clone());
/// // ...
/// connection.close().await;
/// ```
#[derive(Clone)]
pub struct BrokerConnection {
    inner: Arc<Inner>,
}

impl BrokerConnection {
    pub fn new(transport: Arc<dyn BrokerTransport>, config: &BrokerConfig) -> Self {
        Self::with_settings(transport, ConnectionSettings::from(config))
    }

    pub fn with_settings(transport: Arc<dyn BrokerTransport>, settings: ConnectionSettings) -> Self {
        let (link, _) = watch::channel(Link::Uninitialized);
        Self {
            inner: Arc::new(Inner {
                transport,
                settings,
                link,
                init_lock: Mutex::new(()),
                retired: StdMutex::new(Vec::new()),
                recovering: AtomicBool::new(false),
                shutdown: CancellationToken::new(),
            }),
        }
    }

    /// Name of the shared topic exchange.
    pub fn exchange(&self) -> &str {
        &self.inner.settings.exchange
    }

    pub fn recovery_interval(&self) -> Duration {
        self.inner.settings.recovery_interval
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.link.borrow().state()
    }

    /// Ready and the channel still reports itself open.
    pub fn is_ready(&self) -> bool {
        self.open_channel().is_some()
    }

    /// Opens the connection and channel and declares the exchange.
    ///
    /// Idempotent: returns the existing channel when already `Ready`.
    /// Concurrent callers are serialized; latecomers observe `Ready` and
    /// skip the work. A cancelled or failed attempt closes whatever it
    /// opened before releasing the lock.
    pub async fn initialize(&self, cancel: &CancellationToken) -> Result<Arc<dyn BrokerChannel>, BrokerError> {
        if let Some(channel) = self.open_channel() {
            return Ok(channel);
        }

        let _guard = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(BrokerError::Cancelled),
            guard = self.inner.init_lock.lock() => guard,
        };

        let current = self.inner.link.borrow().clone();
        match current {
            Link::Closed => return Err(BrokerError::Closed),
            Link::Ready(channel) if channel.is_open() => return Ok(channel),
            Link::Ready(stale) => self.retire(stale),
            _ => {}
        }

        self.inner.link.send_replace(Link::Initializing);
        self.close_retired().await;
        tracing::debug!(exchange = %self.inner.settings.exchange, "Opening broker connection");

        match self.open(cancel).await {
            Ok(channel) => {
                self.inner.link.send_replace(Link::Ready(Arc::clone(&channel)));
                tracing::info!(
                    exchange = %self.inner.settings.exchange,
                    automatic_recovery = self.inner.settings.automatic_recovery,
                    recovery_interval_secs = self.inner.settings.recovery_interval.as_secs(),
                    "Broker connection ready"
                );
                Ok(channel)
            }
            Err(err) => {
                let fallback = if self.inner.shutdown.is_cancelled() {
                    Link::Closed
                } else if self.inner.recovering.load(Ordering::SeqCst) {
                    Link::Initializing
                } else {
                    Link::Uninitialized
                };
                self.inner.link.send_replace(fallback);
                tracing::warn!(error = %err, "Broker connection attempt failed");
                Err(err)
            }
        }
    }

    /// The shared channel, initializing it first if needed.
    ///
    /// Makes exactly one initialization attempt. On failure the error is
    /// returned immediately and, with automatic recovery enabled, a
    /// background reconnect loop is started.
    pub async fn ensure_ready(&self, cancel: &CancellationToken) -> Result<Arc<dyn BrokerChannel>, BrokerError> {
        if let Some(channel) = self.open_channel() {
            return Ok(channel);
        }

        match self.initialize(cancel).await {
            Ok(channel) => Ok(channel),
            Err(err) => {
                if err.is_retryable() && self.inner.settings.automatic_recovery {
                    self.spawn_recovery();
                }
                Err(err)
            }
        }
    }

    /// Waits until the connection is `Ready`, without initiating anything.
    pub async fn wait_until_ready(&self, cancel: &CancellationToken) -> Result<Arc<dyn BrokerChannel>, BrokerError> {
        let mut link = self.inner.link.subscribe();
        loop {
            let current = link.borrow_and_update().clone();
            match current {
                Link::Ready(channel) if channel.is_open() => return Ok(channel),
                Link::Closed => return Err(BrokerError::Closed),
                _ => {}
            }

            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(BrokerError::Cancelled),
                changed = link.changed() => {
                    if changed.is_err() {
                        return Err(BrokerError::Closed);
                    }
                }
            }
        }
    }

    /// Reports that `channel` failed with `err`.
    ///
    /// A retryable error or a channel that no longer reports itself open
    /// marks the link as disconnected.
    pub fn report_failure(&self, channel: &Arc<dyn BrokerChannel>, err: &BrokerError) {
        if err.is_retryable() || !channel.is_open() {
            self.report_disconnect(channel);
        }
    }

    /// Marks `channel` as lost. With automatic recovery the link moves to
    /// `Initializing` and a background task reconnects every
    /// `recovery_interval`; otherwise it returns to `Uninitialized` and the
    /// next call reconnects lazily. The lost link is closed in the
    /// background.
    pub fn report_disconnect(&self, channel: &Arc<dyn BrokerChannel>) {
        let recovery = self.inner.settings.automatic_recovery;
        let replaced = self.inner.link.send_if_modified(|link| {
            if !matches!(&*link, Link::Ready(current) if same_channel(current, channel)) {
                return false;
            }
            *link = if recovery {
                Link::Initializing
            } else {
                Link::Uninitialized
            };
            true
        });

        if replaced {
            tracing::warn!(automatic_recovery = recovery, "Broker connection lost");
            self.retire(Arc::clone(channel));
            self.spawn_release();
            if recovery {
                self.spawn_recovery();
            }
        }
    }

    /// Closes the channel, then the connection, and moves to `Closed`.
    ///
    /// Each close step logs and continues on failure. Stops any recovery
    /// loop and makes every later call fail with `BrokerError::Closed`.
    pub async fn close(&self) {
        self.inner.shutdown.cancel();
        let _guard = self.inner.init_lock.lock().await;

        let previous = self.inner.link.send_replace(Link::Closed);
        if let Link::Ready(channel) = previous {
            self.retire(channel);
        }
        self.close_retired().await;
        tracing::info!("Broker connection closed");
    }

    /// Token cancelled when the connection is closed.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.inner.shutdown.clone()
    }

    fn open_channel(&self) -> Option<Arc<dyn BrokerChannel>> {
        match &*self.inner.link.borrow() {
            Link::Ready(channel) if channel.is_open() => Some(Arc::clone(channel)),
            _ => None,
        }
    }

    async fn open(&self, cancel: &CancellationToken) -> Result<Arc<dyn BrokerChannel>, BrokerError> {
        let channel = tokio::select! {
            biased;
            _ = self.stopped(cancel) => return Err(BrokerError::Cancelled),
            result = self.inner.transport.connect(&self.inner.settings.connect) => result?,
        };

        let declared = tokio::select! {
            biased;
            _ = self.stopped(cancel) => Err(BrokerError::Cancelled),
            result = channel.declare_exchange(&self.inner.settings.exchange) => result,
        };

        match declared {
            Ok(()) => Ok(channel),
            Err(err) => {
                unwind(channel.as_ref()).await;
                Err(err)
            }
        }
    }

    fn retire(&self, channel: Arc<dyn BrokerChannel>) {
        self.inner
            .retired
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(channel);
    }

    /// Closes every retired link. Callers hold `init_lock`.
    async fn close_retired(&self) {
        let retired: Vec<_> = self
            .inner
            .retired
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .drain(..)
            .collect();
        for channel in retired {
            unwind(channel.as_ref()).await;
        }
    }

    fn spawn_release(&self) {
        let connection = self.clone();
        tokio::spawn(async move {
            let _guard = connection.inner.init_lock.lock().await;
            connection.close_retired().await;
        });
    }

    /// Resolves when either the caller or `close()` cancels.
    async fn stopped(&self, cancel: &CancellationToken) {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {}
            _ = self.inner.shutdown.cancelled() => {}
        }
    }

    fn spawn_recovery(&self) {
        if self.inner.shutdown.is_cancelled() || self.inner.recovering.swap(true, Ordering::SeqCst) {
            return;
        }
        self.inner.link.send_if_modified(|link| match link {
            Link::Uninitialized => {
                *link = Link::Initializing;
                true
            }
            _ => false,
        });

        let connection = self.clone();
        tokio::spawn(async move {
            connection.recover().await;
            connection.finish_recovery();
        });
    }

    /// Clears the recovery flag, then picks up a disconnect reported while
    /// the flag was still set.
    fn finish_recovery(&self) {
        self.inner.recovering.store(false, Ordering::SeqCst);
        if self.state() == ConnectionState::Initializing {
            self.spawn_recovery();
        }
    }

    async fn recover(&self) {
        let shutdown = self.inner.shutdown.clone();
        let mut attempt: u32 = 0;
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => return,
                _ = tokio::time::sleep(self.inner.settings.recovery_interval) => {}
            }

            attempt += 1;
            match self.initialize(&shutdown).await {
                Ok(_) => {
                    tracing::info!(attempt, "Broker connection recovered");
                    return;
                }
                Err(BrokerError::Closed) | Err(BrokerError::Cancelled) => return,
                Err(err) => {
                    tracing::warn!(attempt, error = %err, "Broker reconnect attempt failed");
                }
            }
        }
    }
}

impl fmt::Debug for BrokerConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BrokerConnection")
            .field("exchange", &self.inner.settings.exchange)
            .field("state", &self.state())
            .finish()
    }
}

/// Closes the channel, then the connection. Each failure is logged and
/// does not stop the next step.
async fn unwind(channel: &dyn BrokerChannel) {
    if let Err(e) = channel.close_channel().await {
        tracing::warn!(error = %e, "Failed to close broker channel");
    }
    if let Err(e) = channel.close_connection().await {
        tracing::warn!(error = %e, "Failed to close broker connection");
    }
}

fn same_channel(a: &Arc<dyn BrokerChannel>, b: &Arc<dyn BrokerChannel>) -> bool {
    std::ptr::eq(
        Arc::as_ptr(a) as *const (),
        Arc::as_ptr(b) as *const (),
    )
}
