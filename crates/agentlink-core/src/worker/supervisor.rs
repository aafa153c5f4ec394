//! Worker lifecycle supervision
//!
//! A single supervision task owns the worker: it launches a generation,
//! performs the handshake, watches for exit or stream failure, and restarts
//! with backoff. Restarts are therefore serialized and callers only ever see
//! the connection of the generation that is currently `Running`.

use super::backoff::{RestartDecision, RestartTracker};
use super::bus::{typed_subscriber, BusHandler, NotificationBus, Subscriber, SubscriptionToken};
use super::launcher::{ProcessControl, ProcessLauncher, WorkerLauncher};
use super::WORKER_LOG_TARGET;
use crate::config::AgentConfig;
use crate::error::{RpcError, WorkerError};
use crate::rpc::{
    DisconnectReason, Dispatcher, HandlerRegistry, NotificationHandler, RequestHandler, Transport,
    TransportSender,
};
use crate::types::methods::{
    encode_params, DebugMessageNotification, Exit, Initialize, Initialized, Shutdown,
};
use crate::types::{
    ClientInfo, DebugMessage, NotificationMethod, RequestMethod, ServerInfo, StatusEvent, WorkerStatus,
    AGENT_PROTOCOL_VERSION,
};
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{broadcast, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

const STATUS_CHANNEL_CAPACITY: usize = 64;

/// The live link to one worker generation
#[derive(Debug)]
pub struct Connection {
    generation: u64,
    instance_id: Uuid,
    dispatcher: Arc<Dispatcher>,
    server_info: ServerInfo,
    started_at: DateTime<Utc>,
    pid: Option<u32>,
}

impl Connection {
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Unique per launch, useful to correlate log lines
    pub fn instance_id(&self) -> Uuid {
        self.instance_id
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    pub fn server_info(&self) -> &ServerInfo {
        &self.server_info
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }
}

/// Handler template plus the dispatcher it was last installed into
struct HandlerSlot {
    /// Installed into every new generation's dispatcher
    registry: HandlerRegistry,
    /// Dispatcher of the generation being started or running
    live: Option<Arc<Dispatcher>>,
}

struct Shared {
    status: RwLock<WorkerStatus>,
    connection: RwLock<Option<Arc<Connection>>>,
    fatal: RwLock<Option<String>>,
    handlers: Mutex<HandlerSlot>,
    generation: AtomicU64,
    status_tx: broadcast::Sender<StatusEvent>,
}

impl Shared {
    fn transition(&self, event: StatusEvent) {
        *self.status.write() = event.status;
        match &event.detail {
            Some(detail) => info!(
                "Worker status: {} (generation {}): {}",
                event.status, event.generation, detail
            ),
            None => info!("Worker status: {} (generation {})", event.status, event.generation),
        }
        // No subscribers is fine
        let _ = self.status_tx.send(event);
    }

    fn set_connection(&self, connection: Option<Arc<Connection>>) {
        *self.connection.write() = connection;
    }

    /// Build a generation's dispatcher from the current handlers and make it
    /// the target of later registrations, atomically.
    fn attach_dispatcher(&self, generation: u64, sender: TransportSender) -> Arc<Dispatcher> {
        let mut slot = self.handlers.lock();
        let dispatcher = Arc::new(Dispatcher::new(generation, sender, slot.registry.clone()));
        slot.live = Some(Arc::clone(&dispatcher));
        dispatcher
    }

    fn detach_dispatcher(&self) {
        self.handlers.lock().live = None;
    }
}

struct LoopControl {
    shutdown_tx: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

/// Owns the worker process lifecycle and exposes the current connection.
pub struct Supervisor {
    config: AgentConfig,
    launcher: Arc<dyn WorkerLauncher>,
    shared: Arc<Shared>,
    /// One per supervisor, so every client sees every subscription
    bus: Arc<NotificationBus>,
    control: tokio::sync::Mutex<Option<LoopControl>>,
}

impl Supervisor {
    pub fn new(config: AgentConfig, launcher: Arc<dyn WorkerLauncher>) -> Self {
        let (status_tx, _) = broadcast::channel(STATUS_CHANNEL_CAPACITY);
        let supervisor = Self {
            config,
            launcher,
            bus: Arc::new(NotificationBus::new()),
            shared: Arc::new(Shared {
                status: RwLock::new(WorkerStatus::Stopped),
                connection: RwLock::new(None),
                fatal: RwLock::new(None),
                handlers: Mutex::new(HandlerSlot {
                    registry: HandlerRegistry::new(),
                    live: None,
                }),
                generation: AtomicU64::new(0),
                status_tx,
            }),
            control: tokio::sync::Mutex::new(None),
        };
        supervisor.subscribe(
            DebugMessageNotification::METHOD,
            typed_subscriber::<DebugMessageNotification>(log_worker_message),
        );
        supervisor
    }

    /// Supervise a child process launched from `config`
    pub fn with_process_launcher(config: AgentConfig) -> Self {
        let launcher = Arc::new(ProcessLauncher::from_config(&config));
        Self::new(config, launcher)
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    /// Start supervising. Resolves once the first generation is `Running`,
    /// or with the error that made the supervisor give up.
    pub async fn start(&self) -> Result<(), WorkerError> {
        let ready_rx = {
            let mut control = self.control.lock().await;
            if let Some(existing) = control.as_ref() {
                if !existing.handle.is_finished() {
                    return Err(WorkerError::AlreadyRunning);
                }
            }

            *self.shared.fatal.write() = None;
            let (shutdown_tx, shutdown_rx) = watch::channel(false);
            let (ready_tx, ready_rx) = oneshot::channel();
            let runner = Runner {
                config: self.config.clone(),
                launcher: Arc::clone(&self.launcher),
                shared: Arc::clone(&self.shared),
                shutdown: shutdown_rx,
                tracker: RestartTracker::new(self.config.restart.clone()),
                ready: Some(ready_tx),
            };
            let handle = tokio::spawn(runner.run());
            *control = Some(LoopControl {
                shutdown_tx,
                handle,
            });
            ready_rx
        };

        match ready_rx.await {
            Ok(result) => result,
            // Stopped before the first generation came up
            Err(_) => Err(WorkerError::NotRunning),
        }
    }

    /// Gracefully stop the worker and wait for supervision to end
    pub async fn stop(&self) {
        let control = self.control.lock().await.take();
        let Some(control) = control else {
            debug!("Stop requested but supervisor is not running");
            return;
        };

        let _ = control.shutdown_tx.send(true);
        if let Err(e) = control.handle.await {
            error!("Supervision task failed: {}", e);
        }
    }

    pub fn current_status(&self) -> WorkerStatus {
        *self.shared.status.read()
    }

    /// Generation of the most recent launch attempt (0 before the first)
    pub fn generation(&self) -> u64 {
        self.shared.generation.load(Ordering::SeqCst)
    }

    pub fn subscribe_status(&self) -> broadcast::Receiver<StatusEvent> {
        self.shared.status_tx.subscribe()
    }

    /// The running generation's connection, if any
    pub fn connection(&self) -> Option<Arc<Connection>> {
        self.shared.connection.read().clone()
    }

    /// Why the supervisor gave up, if it did
    pub fn fatal_error(&self) -> Option<String> {
        self.shared.fatal.read().clone()
    }

    pub fn register_request_handler(&self, method: impl Into<String>, handler: Arc<dyn RequestHandler>) {
        let method = method.into();
        let mut slot = self.shared.handlers.lock();
        slot.registry.insert_request(method.clone(), Arc::clone(&handler));
        if let Some(dispatcher) = &slot.live {
            dispatcher.register_request_handler(method, handler);
        }
    }

    pub fn register_notification_handler(
        &self,
        method: impl Into<String>,
        handler: Arc<dyn NotificationHandler>,
    ) {
        let method = method.into();
        let mut slot = self.shared.handlers.lock();
        slot.registry.insert_notification(method.clone(), Arc::clone(&handler));
        if let Some(dispatcher) = &slot.live {
            dispatcher.register_notification_handler(method, handler);
        }
    }

    /// Add a subscriber for a worker notification. The first subscriber of a
    /// method routes it into the bus, replacing any handler registered for it.
    pub(crate) fn subscribe(&self, method: &str, subscriber: Subscriber) -> SubscriptionToken {
        let (token, first) = self.bus.subscribe(method, subscriber);
        if first {
            debug!("Routing {} notifications to subscribers", method);
            self.register_notification_handler(
                method,
                Arc::new(BusHandler {
                    bus: Arc::clone(&self.bus),
                    method: method.to_string(),
                }),
            );
        }
        token
    }

    pub fn unsubscribe(&self, token: &SubscriptionToken) -> bool {
        self.bus.unsubscribe(token)
    }

    pub fn notification_bus(&self) -> &Arc<NotificationBus> {
        &self.bus
    }

    pub fn unregister(&self, method: &str) -> bool {
        let mut slot = self.shared.handlers.lock();
        let removed = slot.registry.remove(method);
        if let Some(dispatcher) = &slot.live {
            dispatcher.unregister(method);
        }
        removed
    }
}

impl std::fmt::Debug for Supervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Supervisor")
            .field("command", &self.config.command)
            .field("status", &self.current_status())
            .field("generation", &self.generation())
            .finish()
    }
}

/// A generation that completed its handshake
struct RunningWorker {
    connection: Arc<Connection>,
    control: Box<dyn ProcessControl>,
    dispatch: JoinHandle<DisconnectReason>,
}

enum Launch {
    Running(RunningWorker),
    /// A stop arrived before the handshake finished
    Stopped,
}

enum Outcome {
    Exited(String),
    Disconnected(String),
    StopRequested,
}

struct Runner {
    config: AgentConfig,
    launcher: Arc<dyn WorkerLauncher>,
    shared: Arc<Shared>,
    shutdown: watch::Receiver<bool>,
    tracker: RestartTracker,
    ready: Option<oneshot::Sender<Result<(), WorkerError>>>,
}

impl Runner {
    async fn run(mut self) {
        loop {
            let generation = self.shared.generation.fetch_add(1, Ordering::SeqCst) + 1;
            self.shared
                .transition(StatusEvent::new(WorkerStatus::Starting, generation));

            let crash_detail = match self.start_generation(generation).await {
                Ok(Launch::Running(running)) => match self.supervise(running).await {
                    Some(detail) => detail,
                    None => return,
                },
                Ok(Launch::Stopped) => {
                    self.shared
                        .transition(StatusEvent::new(WorkerStatus::Stopped, generation));
                    return;
                }
                Err(e) if e.is_fatal() => {
                    self.shared.transition(
                        StatusEvent::new(WorkerStatus::Crashed, generation).with_detail(e.to_string()),
                    );
                    self.give_up(generation, e);
                    return;
                }
                Err(e) => {
                    error!("Worker generation {} failed to start: {}", generation, e);
                    e.to_string()
                }
            };

            self.shared.transition(
                StatusEvent::new(WorkerStatus::Crashed, generation).with_detail(crash_detail),
            );

            match self.tracker.record_crash(Instant::now()) {
                RestartDecision::Restart { attempt, delay } => {
                    info!(
                        "Restarting worker in {:?} (crash {} of {} allowed)",
                        delay,
                        attempt,
                        self.tracker.policy().max_restarts
                    );
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = shutdown_requested(&mut self.shutdown) => {
                            self.shared
                                .transition(StatusEvent::new(WorkerStatus::Stopped, generation));
                            return;
                        }
                    }
                }
                RestartDecision::GiveUp { crashes } => {
                    let err = WorkerError::RestartLimitExceeded {
                        restarts: crashes,
                        window: self.tracker.policy().window(),
                    };
                    self.give_up(generation, err);
                    return;
                }
            }
        }
    }

    /// Launch, connect and handshake one generation. A stop request cuts
    /// either phase short.
    async fn start_generation(&mut self, generation: u64) -> Result<Launch, WorkerError> {
        let process = tokio::select! {
            launched = self.launcher.launch(generation) => launched?,
            _ = shutdown_requested(&mut self.shutdown) => return Ok(Launch::Stopped),
        };
        let mut control = process.control;
        let pid = control.id();

        let (sender, stream) = Transport::new(process.reader, process.writer, &self.config.transport());
        let dispatcher = self.shared.attach_dispatcher(generation, sender);
        let dispatch = tokio::spawn({
            let dispatcher = Arc::clone(&dispatcher);
            async move { dispatcher.run(stream).await }
        });

        let handshake = tokio::select! {
            result = Self::handshake(&self.config, &dispatcher) => Some(result),
            _ = shutdown_requested(&mut self.shutdown) => None,
        };

        match handshake {
            Some(Ok(server_info)) => {
                let connection = Arc::new(Connection {
                    generation,
                    instance_id: Uuid::new_v4(),
                    dispatcher,
                    server_info,
                    started_at: Utc::now(),
                    pid,
                });
                Ok(Launch::Running(RunningWorker {
                    connection,
                    control,
                    dispatch,
                }))
            }
            outcome => {
                self.shared.detach_dispatcher();
                dispatcher.fail_all();
                dispatch.abort();
                if outcome.is_none() {
                    self.shared
                        .transition(StatusEvent::new(WorkerStatus::Stopping, generation));
                }
                if let Err(kill_err) = control.kill().await {
                    debug!("Kill of unfinished generation {}: {}", generation, kill_err);
                }
                match outcome {
                    Some(Err(e)) => Err(e),
                    _ => Ok(Launch::Stopped),
                }
            }
        }
    }

    async fn handshake(config: &AgentConfig, dispatcher: &Arc<Dispatcher>) -> Result<ServerInfo, WorkerError> {
        let client_info = ClientInfo {
            workspace_root_uri: config.client.workspace_root_uri.clone(),
            extension_configuration: config.client.extension_configuration.clone(),
            ..ClientInfo::default()
        };
        let params = encode_params(&client_info)
            .map_err(|e| WorkerError::HandshakeFailed(format!("encode initialize: {}", e)))?;

        let result = dispatcher
            .call(Initialize::METHOD, params, config.timeouts.handshake())
            .await
            .map_err(|e| WorkerError::HandshakeFailed(format!("initialize: {}", e)))?;
        let server_info: ServerInfo = serde_json::from_value(result)
            .map_err(|e| WorkerError::HandshakeFailed(format!("invalid initialize result: {}", e)))?;

        if server_info.protocol_version != Some(AGENT_PROTOCOL_VERSION) {
            return Err(WorkerError::VersionMismatch {
                expected: AGENT_PROTOCOL_VERSION,
                actual: server_info.protocol_version,
            });
        }

        dispatcher
            .notify(Initialized::METHOD, None)
            .await
            .map_err(|e| WorkerError::HandshakeFailed(format!("initialized: {}", e)))?;

        Ok(server_info)
    }

    /// Run a healthy generation until it fails or a stop is requested.
    /// Returns the crash detail, or `None` once stopped.
    async fn supervise(&mut self, mut running: RunningWorker) -> Option<String> {
        let generation = running.connection.generation;
        let detail = format!(
            "{} {} (instance {})",
            running.connection.server_info.name,
            running.connection.server_info.version.as_deref().unwrap_or("unknown"),
            running.connection.instance_id
        );

        self.shared.set_connection(Some(Arc::clone(&running.connection)));
        self.shared
            .transition(StatusEvent::new(WorkerStatus::Running, generation).with_detail(detail));
        if let Some(ready) = self.ready.take() {
            let _ = ready.send(Ok(()));
        }

        let outcome = tokio::select! {
            exit = running.control.wait() => match exit {
                Ok(info) => Outcome::Exited(format!("worker exited unexpectedly ({})", info)),
                Err(e) => Outcome::Exited(format!("lost track of worker process: {}", e)),
            },
            reason = &mut running.dispatch => match reason {
                Ok(reason) => Outcome::Disconnected(format!("connection lost: {}", reason)),
                Err(e) => Outcome::Disconnected(format!("dispatch loop failed: {}", e)),
            },
            _ = shutdown_requested(&mut self.shutdown) => Outcome::StopRequested,
        };

        let detail = match outcome {
            Outcome::StopRequested => {
                self.graceful_stop(running).await;
                return None;
            }
            Outcome::Exited(detail) | Outcome::Disconnected(detail) => detail,
        };

        error!("Worker generation {} crashed: {}", generation, detail);
        self.shared.set_connection(None);
        self.shared.detach_dispatcher();
        running.connection.dispatcher.fail_all();
        running.dispatch.abort();
        if let Err(e) = running.control.kill().await {
            debug!("Kill after crash: {}", e);
        }
        Some(detail)
    }

    async fn graceful_stop(&mut self, mut running: RunningWorker) {
        let generation = running.connection.generation;
        let timeout = self.config.timeouts.shutdown();
        let dispatcher = Arc::clone(&running.connection.dispatcher);

        self.shared.set_connection(None);
        self.shared.detach_dispatcher();
        self.shared
            .transition(StatusEvent::new(WorkerStatus::Stopping, generation));

        match dispatcher.call(Shutdown::METHOD, None, timeout).await {
            Ok(_) => debug!("Worker acknowledged shutdown"),
            Err(RpcError::Timeout { .. }) => warn!("Worker did not answer shutdown within {:?}", timeout),
            Err(e) => warn!("Shutdown request failed: {}", e),
        }
        if let Err(e) = dispatcher.notify(Exit::METHOD, None).await {
            debug!("Exit notification not sent: {}", e);
        }

        match tokio::time::timeout(timeout, running.control.wait()).await {
            Ok(Ok(exit)) => info!("Worker exited ({})", exit),
            Ok(Err(e)) => warn!("Failed waiting for worker exit: {}", e),
            Err(_) => {
                warn!("Worker did not exit within {:?}, killing", timeout);
                if let Err(e) = running.control.kill().await {
                    warn!("Failed to kill worker: {}", e);
                }
            }
        }

        dispatcher.fail_all();
        running.dispatch.abort();
        self.shared
            .transition(StatusEvent::new(WorkerStatus::Stopped, generation));
    }

    fn give_up(&mut self, generation: u64, err: WorkerError) {
        error!("Worker supervision stopped: {}", err);
        self.shared.set_connection(None);
        *self.shared.fatal.write() = Some(err.to_string());
        self.shared.transition(
            StatusEvent::new(WorkerStatus::Stopped, generation)
                .with_detail(err.to_string())
                .fatal(),
        );
        if let Some(ready) = self.ready.take() {
            let _ = ready.send(Err(err));
        }
    }
}

fn log_worker_message(message: DebugMessage) {
    if message.is_error() {
        error!(target: WORKER_LOG_TARGET, "[{}] {}", message.channel, message.message);
    } else {
        debug!(target: WORKER_LOG_TARGET, "[{}] {}", message.channel, message.message);
    }
}

/// Resolves once a stop was requested or the supervisor was dropped
async fn shutdown_requested(rx: &mut watch::Receiver<bool>) {
    // A dropped sender means the supervisor is gone; treat it as a stop
    let _ = rx.wait_for(|stop| *stop).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{RestartPolicy, TimeoutConfig};
    use crate::worker::fake::{FakeBehavior, FakeLauncher};
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use std::time::Duration;

    const WAIT: Duration = Duration::from_secs(5);

    fn test_config() -> AgentConfig {
        AgentConfig {
            timeouts: TimeoutConfig {
                handshake_ms: 2_000,
                shutdown_ms: 200,
                interactive_ms: 1_000,
                generation_ms: 2_000,
            },
            restart: RestartPolicy {
                initial_delay_ms: 10,
                max_delay_ms: 50,
                multiplier: 2.0,
                max_restarts: 3,
                window_ms: 60_000,
            },
            ..AgentConfig::default()
        }
    }

    async fn wait_for_status(
        rx: &mut broadcast::Receiver<StatusEvent>,
        status: WorkerStatus,
        generation: u64,
    ) -> StatusEvent {
        tokio::time::timeout(WAIT, async {
            loop {
                let event = rx.recv().await.unwrap();
                if event.status == status && event.generation == generation {
                    return event;
                }
            }
        })
        .await
        .expect("status not reached")
    }

    #[tokio::test]
    async fn test_start_handshake_and_graceful_stop() {
        let launcher = FakeLauncher::new();
        let supervisor = Supervisor::new(test_config(), launcher.clone());
        let mut events = supervisor.subscribe_status();

        supervisor.start().await.unwrap();
        assert_eq!(supervisor.current_status(), WorkerStatus::Running);
        assert_eq!(supervisor.generation(), 1);

        let connection = supervisor.connection().unwrap();
        assert_eq!(connection.generation(), 1);
        assert_eq!(connection.server_info().name, "fake-agent");

        assert_eq!(events.recv().await.unwrap().status, WorkerStatus::Starting);
        assert_eq!(events.recv().await.unwrap().status, WorkerStatus::Running);

        supervisor.stop().await;
        assert_eq!(events.recv().await.unwrap().status, WorkerStatus::Stopping);
        assert_eq!(events.recv().await.unwrap().status, WorkerStatus::Stopped);
        assert_eq!(supervisor.current_status(), WorkerStatus::Stopped);
        assert!(supervisor.connection().is_none());
        assert!(connection.dispatcher().is_closed());

        let seen = launcher.seen();
        assert!(seen.contains(&"initialized".to_string()));
        assert!(seen.contains(&"exit".to_string()));
    }

    #[tokio::test]
    async fn test_second_start_is_rejected() {
        let supervisor = Supervisor::new(test_config(), FakeLauncher::new());
        supervisor.start().await.unwrap();
        assert!(matches!(
            supervisor.start().await,
            Err(WorkerError::AlreadyRunning)
        ));
        supervisor.stop().await;
    }

    #[tokio::test]
    async fn test_crash_fails_in_flight_call_and_restarts() {
        let launcher = FakeLauncher::new();
        let supervisor = Supervisor::new(test_config(), launcher.clone());
        let mut events = supervisor.subscribe_status();
        supervisor.start().await.unwrap();

        let first = supervisor.connection().unwrap();
        let call = tokio::spawn({
            let dispatcher = Arc::clone(first.dispatcher());
            async move {
                dispatcher
                    .call(
                        "command/execute",
                        Some(json!({ "command": "fake.hang" })),
                        WAIT,
                    )
                    .await
            }
        });
        // Let the request reach the worker before it dies
        tokio::time::sleep(Duration::from_millis(50)).await;
        launcher.crash_current(3);

        let result = tokio::time::timeout(WAIT, call).await.unwrap().unwrap();
        assert!(matches!(result, Err(RpcError::ConnectionLost { generation: 1 })));

        let crashed = wait_for_status(&mut events, WorkerStatus::Crashed, 1).await;
        assert!(crashed.detail.unwrap().contains("exit code 3"));
        wait_for_status(&mut events, WorkerStatus::Running, 2).await;

        let second = supervisor.connection().unwrap();
        assert_eq!(second.generation(), 2);
        assert_ne!(first.instance_id(), second.instance_id());
        assert_eq!(launcher.launches(), 2);

        let panel = second
            .dispatcher()
            .call("chat/new", None, WAIT)
            .await
            .unwrap();
        assert_eq!(panel, json!("panel-2"));

        supervisor.stop().await;
    }

    #[tokio::test]
    async fn test_version_mismatch_is_fatal_without_restart() {
        let launcher = FakeLauncher::with_behavior(FakeBehavior {
            protocol_version: Some(AGENT_PROTOCOL_VERSION + 1),
            ..FakeBehavior::default()
        });
        let supervisor = Supervisor::new(test_config(), launcher.clone());

        let err = supervisor.start().await.unwrap_err();
        assert!(matches!(err, WorkerError::VersionMismatch { .. }));
        assert_eq!(launcher.launches(), 1);
        assert_eq!(supervisor.current_status(), WorkerStatus::Stopped);
        assert!(supervisor.fatal_error().is_some());
        assert!(supervisor.connection().is_none());
    }

    #[tokio::test]
    async fn test_missing_protocol_version_is_fatal() {
        let launcher = FakeLauncher::with_behavior(FakeBehavior {
            protocol_version: None,
            ..FakeBehavior::default()
        });
        let supervisor = Supervisor::new(test_config(), launcher);
        assert!(matches!(
            supervisor.start().await,
            Err(WorkerError::VersionMismatch { actual: None, .. })
        ));
    }

    #[tokio::test]
    async fn test_restart_limit_reaches_fatal_stop() {
        let launcher = FakeLauncher::with_behavior(FakeBehavior {
            fail_launch: true,
            ..FakeBehavior::default()
        });
        let supervisor = Supervisor::new(test_config(), launcher.clone());
        let mut events = supervisor.subscribe_status();

        let err = tokio::time::timeout(WAIT, supervisor.start())
            .await
            .unwrap()
            .unwrap_err();
        assert!(matches!(err, WorkerError::RestartLimitExceeded { restarts: 4, .. }));
        // max_restarts = 3: the initial launch plus three restarts
        assert_eq!(launcher.launches(), 4);

        let last = wait_for_status(&mut events, WorkerStatus::Stopped, 4).await;
        assert!(last.fatal);
        assert_eq!(supervisor.current_status(), WorkerStatus::Stopped);
    }

    #[tokio::test]
    async fn test_handshake_timeout_counts_as_crash() {
        let launcher = FakeLauncher::with_behavior(FakeBehavior {
            hang_initialize: true,
            ..FakeBehavior::default()
        });
        let mut config = test_config();
        config.timeouts.handshake_ms = 50;
        config.restart.max_restarts = 1;
        let supervisor = Supervisor::new(config, launcher.clone());

        let err = tokio::time::timeout(WAIT, supervisor.start())
            .await
            .unwrap()
            .unwrap_err();
        assert!(matches!(err, WorkerError::RestartLimitExceeded { .. }));
        assert_eq!(launcher.launches(), 2);
    }

    #[tokio::test]
    async fn test_stop_kills_unresponsive_worker() {
        let launcher = FakeLauncher::with_behavior(FakeBehavior {
            ignore_shutdown: true,
            ..FakeBehavior::default()
        });
        let supervisor = Supervisor::new(test_config(), launcher);
        supervisor.start().await.unwrap();

        tokio::time::timeout(WAIT, supervisor.stop()).await.unwrap();
        assert_eq!(supervisor.current_status(), WorkerStatus::Stopped);
        assert!(supervisor.fatal_error().is_none());
    }

    #[tokio::test]
    async fn test_handlers_survive_restart() {
        use crate::rpc::notification_fn;

        let launcher = FakeLauncher::new();
        let supervisor = Supervisor::new(test_config(), launcher.clone());
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        supervisor.register_notification_handler(
            "debug/message",
            notification_fn(move |params| {
                let _ = tx.send(params);
                Ok(())
            }),
        );
        let mut events = supervisor.subscribe_status();
        supervisor.start().await.unwrap();

        launcher.crash_current(1);
        wait_for_status(&mut events, WorkerStatus::Running, 2).await;

        let connection = supervisor.connection().unwrap();
        connection
            .dispatcher()
            .call(
                "command/execute",
                Some(json!({ "command": "fake.debug", "arguments": [2] })),
                WAIT,
            )
            .await
            .unwrap();

        let params = tokio::time::timeout(WAIT, rx.recv()).await.unwrap().unwrap();
        assert_eq!(params.unwrap()["channel"], json!("Agent"));

        supervisor.stop().await;
    }

    #[tokio::test]
    async fn test_handler_registered_during_handshake_reaches_that_generation() {
        use crate::rpc::notification_fn;
        use tokio::sync::Notify;

        let gate = Arc::new(Notify::new());
        let launcher = FakeLauncher::with_behavior(FakeBehavior {
            initialize_gate: Some(Arc::clone(&gate)),
            ..FakeBehavior::default()
        });
        let supervisor = Arc::new(Supervisor::new(test_config(), launcher.clone()));
        let start = tokio::spawn({
            let supervisor = Arc::clone(&supervisor);
            async move { supervisor.start().await }
        });

        // The dispatcher exists once initialize is on the wire
        tokio::time::timeout(WAIT, async {
            while !launcher.seen().contains(&"initialize".to_string()) {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        assert_eq!(supervisor.current_status(), WorkerStatus::Starting);

        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        supervisor.register_notification_handler(
            "codeLenses/display",
            notification_fn(move |params| {
                let _ = tx.send(params);
                Ok(())
            }),
        );
        gate.notify_one();
        tokio::time::timeout(WAIT, start).await.unwrap().unwrap().unwrap();

        supervisor
            .connection()
            .unwrap()
            .dispatcher()
            .call(
                "command/execute",
                Some(json!({
                    "command": "fake.notify",
                    "arguments": ["codeLenses/display", { "uri": "file:///a.rs" }]
                })),
                WAIT,
            )
            .await
            .unwrap();

        let params = tokio::time::timeout(WAIT, rx.recv()).await.unwrap().unwrap();
        assert_eq!(params, Some(json!({ "uri": "file:///a.rs" })));

        supervisor.stop().await;
    }

    #[tokio::test]
    async fn test_stop_while_starting_returns_promptly_without_crash() {
        let launcher = FakeLauncher::with_behavior(FakeBehavior {
            hang_initialize: true,
            ..FakeBehavior::default()
        });
        let mut config = test_config();
        config.timeouts.handshake_ms = 10_000;
        let supervisor = Arc::new(Supervisor::new(config, launcher.clone()));
        let mut events = supervisor.subscribe_status();

        let start = tokio::spawn({
            let supervisor = Arc::clone(&supervisor);
            async move { supervisor.start().await }
        });
        wait_for_status(&mut events, WorkerStatus::Starting, 1).await;
        tokio::time::sleep(Duration::from_millis(20)).await;

        tokio::time::timeout(Duration::from_secs(1), supervisor.stop())
            .await
            .expect("stop waited on the handshake");

        let result = tokio::time::timeout(WAIT, start).await.unwrap().unwrap();
        assert!(matches!(result, Err(WorkerError::NotRunning)));
        assert_eq!(supervisor.current_status(), WorkerStatus::Stopped);
        assert!(supervisor.fatal_error().is_none());
        assert!(supervisor.connection().is_none());
        assert_eq!(launcher.launches(), 1);

        let mut statuses = Vec::new();
        while let Ok(event) = events.try_recv() {
            statuses.push(event.status);
        }
        assert!(!statuses.contains(&WorkerStatus::Crashed));
        assert_eq!(statuses.last(), Some(&WorkerStatus::Stopped));
    }
}
