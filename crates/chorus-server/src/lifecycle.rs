//! Process lifecycle: `Starting → Ready → Draining → Stopped`.
//!
//! Startup connects the broker, registers the consumer group, binds the
//! listener and starts the relay. Termination moves `Ready → Draining` with a
//! single compare-and-set, so concurrent requests produce exactly one drain.
//! The drain closes every local connection, announces departures to peers,
//! stops the listener and background tasks, and closes the broker, all
//! within `server.drain_timeout_ms`.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chorus_broker::Broker;
use chorus_core::BrokerError;
use chorus_relay::RelayEngine;
use chorus_settings::ChorusSettings;
use parking_lot::Mutex;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::server::{self, AppState};
use crate::shutdown::ShutdownCoordinator;
use crate::transport::TransportConfig;

/// Capacity of the transport → dispatcher queue.
const INBOUND_QUEUE: usize = 1024;

/// Floor for the teardown budget left after the drain itself.
const MIN_TEARDOWN: Duration = Duration::from_millis(250);

/// Where the process is in its life.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum LifecycleState {
    /// Constructed, not yet serving.
    Starting = 0,
    /// Accepting connections.
    Ready = 1,
    /// Termination requested; no new connections.
    Draining = 2,
    /// Drained or failed to start.
    Stopped = 3,
}

impl LifecycleState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Starting,
            1 => Self::Ready,
            2 => Self::Draining,
            _ => Self::Stopped,
        }
    }
}

/// Failures while starting or stopping.
#[derive(Debug, thiserror::Error)]
pub enum LifecycleError {
    /// The broker could not be reached or set up.
    #[error("broker: {0}")]
    Broker(#[from] BrokerError),
    /// The listener could not bind.
    #[error("failed to bind {addr}: {source}")]
    Bind {
        /// Configured listen address.
        addr: String,
        /// Underlying socket error.
        #[source]
        source: std::io::Error,
    },
    /// The call does not fit the current state.
    #[error("cannot {action} while {state:?}")]
    InvalidState {
        /// What was attempted.
        action: &'static str,
        /// Current state.
        state: LifecycleState,
    },
    /// Teardown overran the drain budget.
    #[error("shutdown did not finish within {0:?}")]
    DrainTimeout(Duration),
    /// Installing signal handlers failed.
    #[error("signal handler unavailable: {0}")]
    Signal(#[source] std::io::Error),
}

impl LifecycleError {
    /// Short classification string for logging.
    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::Broker(e) => e.error_kind(),
            Self::Bind { .. } => "bind",
            Self::InvalidState { .. } => "invalid_state",
            Self::DrainTimeout(_) => "shutdown_timeout",
            Self::Signal(_) => "signal",
        }
    }
}

/// Result of a termination request.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DrainOutcome {
    /// This call performed the drain.
    Drained { connections: usize },
    /// Another call is draining or already has.
    AlreadyRequested,
}

struct Running {
    broker: Arc<dyn Broker>,
    engine: Arc<RelayEngine>,
    addr: SocketAddr,
    tasks: Vec<JoinHandle<()>>,
}

/// Owns startup, readiness and the drain of one process.
pub struct Lifecycle {
    settings: ChorusSettings,
    injected_broker: Option<Arc<dyn Broker>>,
    state: AtomicU8,
    shutdown: ShutdownCoordinator,
    /// Cancelled when termination is requested.
    stop: CancellationToken,
    running: Mutex<Option<Running>>,
}

impl Lifecycle {
    /// A process in `Starting` that connects to the configured broker.
    pub fn new(settings: ChorusSettings) -> Self {
        Self {
            settings,
            injected_broker: None,
            state: AtomicU8::new(LifecycleState::Starting as u8),
            shutdown: ShutdownCoordinator::new(),
            stop: CancellationToken::new(),
            running: Mutex::new(None),
        }
    }

    /// Use `broker` instead of connecting to `broker.url`.
    #[must_use]
    pub fn with_broker(mut self, broker: Arc<dyn Broker>) -> Self {
        self.injected_broker = Some(broker);
        self
    }

    /// Current state.
    pub fn state(&self) -> LifecycleState {
        LifecycleState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Settings the process was started with.
    pub fn settings(&self) -> &ChorusSettings {
        &self.settings
    }

    /// Bound address once started.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.running.lock().as_ref().map(|r| r.addr)
    }

    /// Relay engine once started.
    pub fn engine(&self) -> Option<Arc<RelayEngine>> {
        self.running.lock().as_ref().map(|r| r.engine.clone())
    }

    /// Bring the process to `Ready`. Any failure leaves it `Stopped`.
    pub async fn start(&self) -> Result<SocketAddr, LifecycleError> {
        let state = self.state();
        if state != LifecycleState::Starting {
            return Err(LifecycleError::InvalidState { action: "start", state });
        }

        let broker = match &self.injected_broker {
            Some(broker) => broker.clone(),
            None => match chorus_broker::connect(&self.settings.broker).await {
                Ok(broker) => broker,
                Err(e) => {
                    self.set_state(LifecycleState::Stopped);
                    return Err(e.into());
                }
            },
        };

        let running = match self.boot(broker.clone()).await {
            Ok(running) => running,
            Err(e) => {
                self.shutdown.shutdown();
                broker.shutdown().await;
                self.set_state(LifecycleState::Stopped);
                return Err(e);
            }
        };
        let addr = running.addr;
        *self.running.lock() = Some(running);
        self.set_state(LifecycleState::Ready);

        info!(
            %addr,
            node = %self.settings.node.node_id(),
            mode = ?self.settings.delivery.mode,
            broker = broker.name(),
            "chorus ready"
        );
        #[cfg(unix)]
        let _ = crate::notify::notify_ready();
        Ok(addr)
    }

    async fn boot(&self, broker: Arc<dyn Broker>) -> Result<Running, LifecycleError> {
        let token = self.shutdown.token();
        let engine = Arc::new(RelayEngine::from_settings(&self.settings, broker.clone(), token.clone()));
        engine.prepare().await?;

        let addr = format!("{}:{}", self.settings.server.host, self.settings.server.port);
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|source| LifecycleError::Bind { addr: addr.clone(), source })?;
        let local = listener
            .local_addr()
            .map_err(|source| LifecycleError::Bind { addr, source })?;

        let (inbound, rx) = mpsc::channel(INBOUND_QUEUE);
        let mut tasks = engine.start(rx).await?;

        let app = server::router(AppState {
            engine: engine.clone(),
            inbound,
            transport: TransportConfig::from_settings(&self.settings.server),
            shutdown: token.clone(),
        });
        tasks.push(tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, app).with_graceful_shutdown(token.cancelled_owned()).await {
                error!(error = %e, "http server failed");
            }
            debug!("listener closed");
        }));

        Ok(Running {
            broker,
            engine,
            addr: local,
            tasks,
        })
    }

    /// Ask for termination. Returns `true` for the first request.
    pub fn request_stop(&self) -> bool {
        let first = !self.stop.is_cancelled();
        self.stop.cancel();
        first
    }

    /// Drain and stop. Only the caller that wins `Ready → Draining` drains;
    /// every other caller gets [`DrainOutcome::AlreadyRequested`].
    #[instrument(skip_all)]
    pub async fn shutdown(&self) -> Result<DrainOutcome, LifecycleError> {
        let _ = self.request_stop();
        if self
            .state
            .compare_exchange(
                LifecycleState::Ready as u8,
                LifecycleState::Draining as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_err()
        {
            debug!(state = ?self.state(), "termination already requested");
            return Ok(DrainOutcome::AlreadyRequested);
        }

        let running = self.running.lock().take();
        let Some(running) = running else {
            self.set_state(LifecycleState::Stopped);
            return Ok(DrainOutcome::Drained { connections: 0 });
        };

        let budget = self.settings.server.drain_timeout();
        let deadline = Instant::now() + budget;
        info!(budget_ms = self.settings.server.drain_timeout_ms, "draining");

        let drained = tokio::time::timeout(budget, running.engine.drain()).await;
        let teardown = deadline.saturating_duration_since(Instant::now()).max(MIN_TEARDOWN);
        let joined = self.shutdown.graceful_shutdown(running.tasks, teardown).await;
        if tokio::time::timeout(teardown, running.broker.shutdown()).await.is_err() {
            warn!("broker close timed out");
        }
        self.set_state(LifecycleState::Stopped);

        match drained {
            Ok(connections) if joined => {
                info!(connections, "shutdown complete");
                Ok(DrainOutcome::Drained { connections })
            }
            _ => {
                error!(budget_ms = self.settings.server.drain_timeout_ms, "shutdown did not finish in time");
                Err(LifecycleError::DrainTimeout(budget))
            }
        }
    }

    /// Start, serve until SIGINT/SIGTERM or [`request_stop`](Self::request_stop),
    /// then drain.
    pub async fn run(self: &Arc<Self>) -> Result<(), LifecycleError> {
        let signals = self.spawn_signal_listener()?;
        let result: Result<(), LifecycleError> = async {
            let _ = self.start().await?;
            self.stop.cancelled().await;
            let _ = self.shutdown().await?;
            Ok(())
        }
        .await;
        signals.abort();
        result
    }

    fn spawn_signal_listener(self: &Arc<Self>) -> Result<JoinHandle<()>, LifecycleError> {
        let mut signals = Signals::new().map_err(LifecycleError::Signal)?;
        let this = self.clone();
        Ok(tokio::spawn(async move {
            loop {
                let signal = signals.recv().await;
                if this.request_stop() {
                    info!(signal, "termination requested");
                } else {
                    warn!(signal, state = ?this.state(), "termination already in progress, signal ignored");
                }
            }
        }))
    }

    fn set_state(&self, state: LifecycleState) {
        self.state.store(state as u8, Ordering::Release);
    }
}

#[cfg(unix)]
struct Signals {
    interrupt: tokio::signal::unix::Signal,
    terminate: tokio::signal::unix::Signal,
}

#[cfg(unix)]
impl Signals {
    fn new() -> std::io::Result<Self> {
        use tokio::signal::unix::{signal, SignalKind};
        Ok(Self {
            interrupt: signal(SignalKind::interrupt())?,
            terminate: signal(SignalKind::terminate())?,
        })
    }

    async fn recv(&mut self) -> &'static str {
        tokio::select! {
            _ = self.interrupt.recv() => "SIGINT",
            _ = self.terminate.recv() => "SIGTERM",
        }
    }
}

#[cfg(not(unix))]
struct Signals;

#[cfg(not(unix))]
impl Signals {
    fn new() -> std::io::Result<Self> {
        Ok(Self)
    }

    async fn recv(&mut self) -> &'static str {
        let _ = tokio::signal::ctrl_c().await;
        "ctrl-c"
    }
}
