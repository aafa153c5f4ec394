//! In-process worker used by tests.
//!
//! Speaks the real wire protocol over a `tokio::io::duplex` pipe, built on the
//! same transport and dispatcher as the client side.

use super::launcher::{ExitInfo, ProcessControl, WorkerLauncher, WorkerProcess};
use crate::error::{RpcError, WorkerError};
use crate::rpc::{
    notification_fn, request_fn, typed_request, Dispatcher, HandlerRegistry, Transport,
    TransportConfig, TransportSender,
};
use crate::types::methods::{
    AutocompleteExecute, ChatNew, ChatSubmitMessage, CommandExecute, Initialize, Shutdown,
};
use crate::types::{
    AutocompleteItem, AutocompleteResult, ChatMessage, DebugMessage, Envelope, ExtensionMessage,
    JsonRpcNotification, Position, Range, RequestMethod, ServerInfo, Speaker,
    AGENT_PROTOCOL_VERSION,
};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Notify};

/// Long enough to outlive any test
const HANG: Duration = Duration::from_secs(60);

#[derive(Debug, Clone)]
pub(crate) struct FakeBehavior {
    pub protocol_version: Option<u32>,
    pub fail_launch: bool,
    pub hang_initialize: bool,
    /// Never answer `shutdown` and never exit on `exit`
    pub ignore_shutdown: bool,
    /// Hold `initialize` open until notified; records "initialize" in `seen` first
    pub initialize_gate: Option<Arc<Notify>>,
}

impl Default for FakeBehavior {
    fn default() -> Self {
        Self {
            protocol_version: Some(AGENT_PROTOCOL_VERSION),
            fail_launch: false,
            hang_initialize: false,
            ignore_shutdown: false,
            initialize_gate: None,
        }
    }
}

type ExitSignal = Arc<watch::Sender<Option<ExitInfo>>>;

#[derive(Default)]
pub(crate) struct FakeLauncher {
    behavior: FakeBehavior,
    launches: AtomicUsize,
    current: Mutex<Option<ExitSignal>>,
    /// Method names of every notification received (and gated `initialize` calls), across generations
    seen: Arc<Mutex<Vec<String>>>,
}

impl FakeLauncher {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn with_behavior(behavior: FakeBehavior) -> Arc<Self> {
        Arc::new(Self {
            behavior,
            ..Self::default()
        })
    }

    pub fn launches(&self) -> usize {
        self.launches.load(Ordering::SeqCst)
    }

    pub fn seen(&self) -> Vec<String> {
        self.seen.lock().clone()
    }

    /// Make the current worker die with `code`
    pub fn crash_current(&self, code: i32) {
        if let Some(exit) = self.current.lock().as_ref() {
            exit.send_replace(Some(ExitInfo {
                code: Some(code),
                success: false,
            }));
        }
    }

    fn handlers(&self, generation: u64, sender: TransportSender, exit: ExitSignal) -> HandlerRegistry {
        let behavior = self.behavior.clone();
        let mut registry = HandlerRegistry::new();

        let initialize_seen = Arc::clone(&self.seen);
        registry.insert_request(
            Initialize::METHOD,
            typed_request::<Initialize, _, _>(move |_client| {
                let behavior = behavior.clone();
                let seen = Arc::clone(&initialize_seen);
                async move {
                    if let Some(gate) = &behavior.initialize_gate {
                        seen.lock().push("initialize".to_string());
                        gate.notified().await;
                    }
                    if behavior.hang_initialize {
                        tokio::time::sleep(HANG).await;
                    }
                    Ok(ServerInfo {
                        name: "fake-agent".to_string(),
                        version: Some("0.0.1".to_string()),
                        protocol_version: behavior.protocol_version,
                        authenticated: Some(true),
                        cody_enabled: Some(true),
                    })
                }
            }),
        );

        let ignore_shutdown = self.behavior.ignore_shutdown;
        registry.insert_request(
            Shutdown::METHOD,
            typed_request::<Shutdown, _, _>(move |()| async move {
                if ignore_shutdown {
                    tokio::time::sleep(HANG).await;
                }
                Ok(Value::Null)
            }),
        );

        registry.insert_request(
            ChatNew::METHOD,
            typed_request::<ChatNew, _, _>(move |()| async move { Ok(format!("panel-{}", generation)) }),
        );

        registry.insert_request(
            ChatSubmitMessage::METHOD,
            typed_request::<ChatSubmitMessage, _, _>(|params| async move {
                let text = params.message.text.unwrap_or_default();
                let human = ChatMessage {
                    speaker: Speaker::Human,
                    text: Some(text.clone()),
                    display_text: None,
                    error: None,
                };
                let assistant = ChatMessage {
                    speaker: Speaker::Assistant,
                    text: Some(format!("echo: {}", text)),
                    display_text: None,
                    error: None,
                };
                Ok(ExtensionMessage {
                    kind: "transcript".to_string(),
                    messages: vec![human, assistant],
                    is_message_in_progress: Some(false),
                    chat_id: Some(params.id),
                })
            }),
        );

        registry.insert_request(
            AutocompleteExecute::METHOD,
            typed_request::<AutocompleteExecute, _, _>(|params| async move {
                if params.uri.contains("slow") {
                    tokio::time::sleep(HANG).await;
                }
                let position = params.position;
                Ok(AutocompleteResult {
                    items: vec![AutocompleteItem {
                        id: "item-1".to_string(),
                        insert_text: "println!(\"hi\");".to_string(),
                        range: Range {
                            start: position,
                            end: Position::new(position.line, position.character + 1),
                        },
                    }],
                })
            }),
        );

        let notifier = sender;
        registry.insert_request(
            CommandExecute::METHOD,
            typed_request::<CommandExecute, _, _>(move |params| {
                let notifier = notifier.clone();
                async move {
                    match params.command.as_str() {
                        "fake.hang" => {
                            tokio::time::sleep(HANG).await;
                            Ok(Value::Null)
                        }
                        "fake.debug" => {
                            let message = DebugMessage {
                                channel: "Agent".to_string(),
                                message: format!("{:?}", params.arguments),
                            };
                            let notification = JsonRpcNotification::new(
                                "debug/message",
                                Some(
                                    serde_json::to_value(message)
                                        .map_err(|e| RpcError::Handler(e.to_string()))?,
                                ),
                            );
                            notifier.send(&Envelope::Notification(notification)).await?;
                            Ok(json!("sent"))
                        }
                        "fake.notify" => {
                            let method = params
                                .arguments
                                .first()
                                .and_then(Value::as_str)
                                .unwrap_or("fake/notice");
                            let notification =
                                JsonRpcNotification::new(method, params.arguments.get(1).cloned());
                            notifier.send(&Envelope::Notification(notification)).await?;
                            Ok(json!("sent"))
                        }
                        "fake.fail" => Err(RpcError::Handler("command failed".to_string())),
                        other => Ok(json!({ "command": other, "arguments": params.arguments })),
                    }
                }
            }),
        );

        for method in [
            "initialized",
            "$/cancelRequest",
            "textDocument/didOpen",
            "textDocument/didChange",
            "textDocument/didFocus",
            "textDocument/didClose",
            "extensionConfiguration/didChange",
        ] {
            let seen = Arc::clone(&self.seen);
            registry.insert_notification(
                method,
                notification_fn(move |_| {
                    seen.lock().push(method.to_string());
                    Ok(())
                }),
            );
        }

        let seen = Arc::clone(&self.seen);
        let ignore_exit = self.behavior.ignore_shutdown;
        registry.insert_notification(
            "exit",
            notification_fn(move |_| {
                seen.lock().push("exit".to_string());
                if !ignore_exit {
                    exit.send_replace(Some(ExitInfo {
                        code: Some(0),
                        success: true,
                    }));
                }
                Ok(())
            }),
        );

        // Untyped echo for raw calls
        registry.insert_request(
            "fake/echo",
            request_fn(|params| async move { Ok(params.unwrap_or(Value::Null)) }),
        );

        registry
    }
}

#[async_trait]
impl WorkerLauncher for FakeLauncher {
    async fn launch(&self, generation: u64) -> Result<WorkerProcess, WorkerError> {
        self.launches.fetch_add(1, Ordering::SeqCst);
        if self.behavior.fail_launch {
            return Err(WorkerError::SpawnFailed("fake launch failure".to_string()));
        }

        let (client_io, worker_io) = tokio::io::duplex(64 * 1024);
        let (client_read, client_write) = tokio::io::split(client_io);
        let (worker_read, worker_write) = tokio::io::split(worker_io);

        let (exit_tx, exit_rx) = watch::channel(None);
        let exit_tx = Arc::new(exit_tx);
        *self.current.lock() = Some(Arc::clone(&exit_tx));

        let (sender, stream) = Transport::new(worker_read, worker_write, &TransportConfig::default());
        let handlers = self.handlers(generation, sender.clone(), Arc::clone(&exit_tx));
        let dispatcher = Dispatcher::new(0, sender, handlers);

        let mut exited = exit_tx.subscribe();
        tokio::spawn(async move {
            tokio::select! {
                _ = dispatcher.run(stream) => {
                    // Client closed our stdin
                    exit_tx.send_replace(Some(ExitInfo { code: Some(0), success: true }));
                }
                _ = exited.wait_for(|exit| exit.is_some()) => {}
            }
            // Dropping the dispatcher closes the pipe
        });

        Ok(WorkerProcess {
            reader: Box::new(client_read),
            writer: Box::new(client_write),
            control: Box::new(FakeControl {
                exit: exit_rx,
                signal: self.current.lock().clone(),
            }),
        })
    }
}

struct FakeControl {
    exit: watch::Receiver<Option<ExitInfo>>,
    signal: Option<ExitSignal>,
}

#[async_trait]
impl ProcessControl for FakeControl {
    async fn wait(&mut self) -> io::Result<ExitInfo> {
        let exit = self
            .exit
            .wait_for(|exit| exit.is_some())
            .await
            .map_err(|_| io::Error::other("fake worker vanished"))?;
        exit.clone().ok_or_else(|| io::Error::other("fake worker vanished"))
    }

    async fn kill(&mut self) -> io::Result<()> {
        if let Some(signal) = &self.signal {
            signal.send_if_modified(|exit| {
                if exit.is_none() {
                    *exit = Some(ExitInfo {
                        code: None,
                        success: false,
                    });
                    true
                } else {
                    false
                }
            });
        }
        Ok(())
    }

    fn id(&self) -> Option<u32> {
        None
    }
}
