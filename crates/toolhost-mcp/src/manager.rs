//! Server process manager: at most one running instance per server name.

use crate::builtin;
use crate::error::McpError;
use crate::process::{self, ExitInfo, SpawnedProcess, StopRequest};
use crate::transport::{InMemoryTransport, Transport};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::io;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use tokio::sync::{oneshot, watch};
use tokio_util::sync::CancellationToken;
use toolhost_config::{ConfigStore, ServerDefinition, ServerKind, TransportKind};
use toolhost_types::{EventBus, HostEvent, ServerState};
use uuid::Uuid;

/// Snapshot of a running server, for listings.
#[derive(Debug, Clone)]
pub struct RunningServerInfo {
    pub name: String,
    pub instance: Uuid,
    pub pid: Option<u32>,
    pub transport: TransportKind,
    pub started_at: DateTime<Utc>,
}

/// The handle for a server that finished starting.
struct RunningServer {
    instance: Uuid,
    pid: Option<u32>,
    kind: TransportKind,
    started_at: DateTime<Utc>,
    transport: Arc<dyn Transport>,
    /// Present for spawned servers; dropping it also stops the process.
    stop_tx: Option<oneshot::Sender<StopRequest>>,
}

impl RunningServer {
    fn info(&self, name: &str) -> RunningServerInfo {
        RunningServerInfo {
            name: name.to_string(),
            instance: self.instance,
            pid: self.pid,
            transport: self.kind,
            started_at: self.started_at,
        }
    }
}

/// Cloneable outcome of a start, shared with every caller awaiting it.
#[derive(Debug, Clone)]
enum StartOutcome {
    Ready,
    SpawnFailed { kind: io::ErrorKind, message: String },
    TimedOut { timeout_ms: u64 },
    Exited { status: String },
}

impl StartOutcome {
    fn into_result(self, name: &str) -> Result<(), McpError> {
        let name = name.to_string();
        match self {
            Self::Ready => Ok(()),
            Self::SpawnFailed { kind, message } => Err(McpError::SpawnFailed {
                name,
                source: io::Error::new(kind, message),
            }),
            Self::TimedOut { timeout_ms } => Err(McpError::StartTimeout { name, timeout_ms }),
            Self::Exited { status } => Err(McpError::StartFailed { name, status }),
        }
    }
}

impl From<McpError> for StartOutcome {
    fn from(err: McpError) -> Self {
        match err {
            McpError::SpawnFailed { source, .. } => Self::SpawnFailed {
                kind: source.kind(),
                message: source.to_string(),
            },
            other => Self::Exited {
                status: other.to_string(),
            },
        }
    }
}

enum Slot {
    /// A start is in progress; callers wait on the receiver.
    Starting {
        instance: Uuid,
        outcome: watch::Receiver<Option<StartOutcome>>,
        cancel: CancellationToken,
    },
    Running(RunningServer),
}

struct Inner {
    config: Arc<ConfigStore>,
    events: EventBus,
    slots: Mutex<HashMap<String, Slot>>,
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, HashMap<String, Slot>> {
        self.slots.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Remove the slot for `name` only if it still belongs to `instance`.
    fn remove_instance(&self, name: &str, instance: Uuid) -> Option<Slot> {
        let mut slots = self.lock();
        let matches = match slots.get(name) {
            Some(Slot::Starting { instance: id, .. }) => *id == instance,
            Some(Slot::Running(running)) => running.instance == instance,
            None => false,
        };
        if matches { slots.remove(name) } else { None }
    }

    fn definition(&self, name: &str) -> Result<ServerDefinition, McpError> {
        let definition = self
            .config
            .definition(name)
            .ok_or_else(|| McpError::NotConfigured {
                name: name.to_string(),
            })?;
        if !definition.enabled {
            return Err(McpError::ServerDisabled {
                name: name.to_string(),
            });
        }
        Ok(definition)
    }
}

/// Starts, stops and tracks server instances.
///
/// Cheap to clone; all clones share the same set of servers.
#[derive(Clone)]
pub struct ServerProcessManager {
    inner: Arc<Inner>,
}

impl ServerProcessManager {
    pub fn new(config: Arc<ConfigStore>, events: EventBus) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                events,
                slots: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn config(&self) -> &Arc<ConfigStore> {
        &self.inner.config
    }

    pub fn events(&self) -> &EventBus {
        &self.inner.events
    }

    /// Start `name` if it is not already running.
    ///
    /// Concurrent calls for the same server share one start.
    pub async fn start(&self, name: &str) -> Result<(), McpError> {
        let mut outcome = {
            let mut slots = self.inner.lock();
            match slots.get(name) {
                Some(Slot::Running(_)) => return Ok(()),
                Some(Slot::Starting { outcome, .. }) => outcome.clone(),
                None => {
                    let definition = self.inner.definition(name)?;
                    match &definition.kind {
                        ServerKind::Remote { .. } => {
                            return Err(McpError::UnsupportedTransport {
                                name: name.to_string(),
                                transport: TransportKind::Remote.as_str().to_string(),
                            });
                        }
                        ServerKind::InMemory(id) => {
                            let server = builtin::create(*id, &definition);
                            let running = RunningServer {
                                instance: Uuid::new_v4(),
                                pid: None,
                                kind: TransportKind::InMemory,
                                started_at: Utc::now(),
                                transport: Arc::new(InMemoryTransport::new(name, server)),
                                stop_tx: None,
                            };
                            slots.insert(name.to_string(), Slot::Running(running));
                            self.emit(HostEvent::status(name, ServerState::Starting));
                            self.emit_started(name);
                            tracing::info!(server = name, builtin = %id, "started in-memory server");
                            return Ok(());
                        }
                        ServerKind::Spawned => {
                            let instance = Uuid::new_v4();
                            let (tx, rx) = watch::channel(None);
                            let cancel = CancellationToken::new();
                            slots.insert(
                                name.to_string(),
                                Slot::Starting {
                                    instance,
                                    outcome: rx.clone(),
                                    cancel: cancel.clone(),
                                },
                            );
                            self.emit(HostEvent::status(name, ServerState::Starting));
                            tokio::spawn(launch(
                                Arc::clone(&self.inner),
                                name.to_string(),
                                instance,
                                definition,
                                Launch { outcome_tx: tx, cancel },
                            ));
                            rx
                        }
                    }
                }
            }
        };

        let result = outcome
            .wait_for(Option::is_some)
            .await
            .map(|outcome| outcome.clone());
        match result {
            Ok(Some(outcome)) => outcome.into_result(name),
            _ => Err(McpError::StartFailed {
                name: name.to_string(),
                status: "start was abandoned".to_string(),
            }),
        }
    }

    /// Stop a running or starting server. Returns false, with no events, if
    /// it was neither.
    ///
    /// A server that is still starting has its launch cancelled and its
    /// process killed; callers awaiting that start fail with `StartFailed`.
    pub async fn stop(&self, name: &str) -> bool {
        let starting = match self.inner.lock().get(name) {
            Some(Slot::Starting { outcome, cancel, .. }) => Some((outcome.clone(), cancel.clone())),
            Some(Slot::Running(_)) => None,
            None => return false,
        };

        let announced = starting.is_some();
        if let Some((mut outcome, cancel)) = starting {
            self.emit(HostEvent::status(name, ServerState::Stopping));
            cancel.cancel();
            let became_ready = outcome
                .wait_for(Option::is_some)
                .await
                .is_ok_and(|outcome| matches!(*outcome, Some(StartOutcome::Ready)));
            // Otherwise the launch task already cleaned up and reported.
            if !became_ready {
                return true;
            }
        }

        let running = {
            let mut slots = self.inner.lock();
            match slots.remove(name) {
                Some(Slot::Running(running)) => running,
                Some(starting) => {
                    slots.insert(name.to_string(), starting);
                    return announced;
                }
                None => return announced,
            }
        };

        if !announced {
            self.emit(HostEvent::status(name, ServerState::Stopping));
        }
        running.transport.close();
        if let Some(stop_tx) = running.stop_tx {
            SpawnedProcess::terminate(stop_tx).await;
        }
        tracing::info!(server = name, "server stopped");
        self.emit(HostEvent::ServerStopped {
            name: name.to_string(),
        });
        self.emit(HostEvent::status(name, ServerState::Stopped));
        true
    }

    /// Stop every running or starting server.
    pub async fn stop_all(&self) {
        let names: Vec<String> = self.inner.lock().keys().cloned().collect();
        for name in names {
            self.stop(&name).await;
        }
    }

    pub fn is_running(&self, name: &str) -> bool {
        matches!(self.inner.lock().get(name), Some(Slot::Running(_)))
    }

    pub fn status(&self, name: &str) -> ServerState {
        match self.inner.lock().get(name) {
            Some(Slot::Running(_)) => ServerState::Running,
            Some(Slot::Starting { .. }) => ServerState::Starting,
            None => ServerState::Stopped,
        }
    }

    /// Running servers, sorted by name.
    pub fn running(&self) -> Vec<RunningServerInfo> {
        let mut list: Vec<RunningServerInfo> = self
            .inner
            .lock()
            .iter()
            .filter_map(|(name, slot)| match slot {
                Slot::Running(running) => Some(running.info(name)),
                Slot::Starting { .. } => None,
            })
            .collect();
        list.sort_by(|a, b| a.name.cmp(&b.name));
        list
    }

    /// The transport of a running server.
    pub fn transport(&self, name: &str) -> Result<Arc<dyn Transport>, McpError> {
        match self.inner.lock().get(name) {
            Some(Slot::Running(running)) => Ok(Arc::clone(&running.transport)),
            _ => Err(McpError::ServerNotRunning {
                name: name.to_string(),
            }),
        }
    }

    fn emit(&self, event: HostEvent) {
        self.inner.events.emit(event);
    }

    fn emit_started(&self, name: &str) {
        emit_started(&self.inner.events, name);
    }
}

fn emit_started(events: &EventBus, name: &str) {
    events.emit(HostEvent::status(name, ServerState::Running));
    events.emit(HostEvent::ServerStarted {
        name: name.to_string(),
    });
}

enum Readiness {
    Ready,
    TimedOut,
    Cancelled,
    Exited(Option<ExitInfo>),
}

/// The launch task's side of a `Starting` slot.
struct Launch {
    outcome_tx: watch::Sender<Option<StartOutcome>>,
    cancel: CancellationToken,
}

/// Spawn the process, wait for readiness, and publish the outcome.
async fn launch(
    inner: Arc<Inner>,
    name: String,
    instance: Uuid,
    definition: ServerDefinition,
    Launch { outcome_tx, cancel }: Launch,
) {
    let mut process = match process::spawn(&name, &definition) {
        Ok(process) => process,
        Err(e) => {
            tracing::warn!(server = %name, "failed to start: {e}");
            inner.remove_instance(&name, instance);
            inner.events.emit(HostEvent::status(&name, ServerState::Stopped));
            outcome_tx.send_replace(Some(StartOutcome::from(e)));
            return;
        }
    };

    let timeout = definition.startup_timeout();
    let timeout_ms = timeout.as_millis() as u64;
    let readiness = tokio::select! {
        _ = process.readiness.wait() => Readiness::Ready,
        _ = tokio::time::sleep(timeout) => Readiness::TimedOut,
        _ = cancel.cancelled() => Readiness::Cancelled,
        exit = process.exit_rx.wait_for(Option::is_some) => {
            Readiness::Exited(exit.ok().and_then(|info| info.clone()))
        }
    };

    let outcome = match readiness {
        Readiness::Ready => {
            let running = RunningServer {
                instance,
                pid: process.pid,
                kind: TransportKind::SpawnedProcess,
                started_at: Utc::now(),
                transport: process.transport,
                stop_tx: Some(process.stop_tx),
            };
            inner
                .lock()
                .insert(name.clone(), Slot::Running(running));
            tracing::info!(server = %name, pid = process.pid, "server ready");
            emit_started(&inner.events, &name);
            tokio::spawn(watch_exit(
                Arc::downgrade(&inner),
                name.clone(),
                instance,
                process.exit_rx,
            ));
            StartOutcome::Ready
        }
        Readiness::TimedOut => {
            tracing::warn!(server = %name, timeout_ms, "no readiness line; killing server");
            process.transport.close();
            SpawnedProcess::terminate(process.stop_tx).await;
            inner.remove_instance(&name, instance);
            inner.events.emit(HostEvent::status(&name, ServerState::Stopped));
            StartOutcome::TimedOut { timeout_ms }
        }
        Readiness::Cancelled => {
            tracing::info!(server = %name, "stopped during startup");
            process.transport.close();
            SpawnedProcess::terminate(process.stop_tx).await;
            inner.remove_instance(&name, instance);
            inner.events.emit(HostEvent::ServerStopped { name: name.clone() });
            inner.events.emit(HostEvent::status(&name, ServerState::Stopped));
            StartOutcome::Exited {
                status: "stopped during startup".to_string(),
            }
        }
        Readiness::Exited(info) => {
            let (code, status) = match info {
                Some(info) => (info.code, info.status),
                None => (None, "unknown exit status".to_string()),
            };
            tracing::warn!(server = %name, %status, "server exited during startup");
            process.transport.close();
            inner.remove_instance(&name, instance);
            inner.events.emit(HostEvent::ServerStatusChanged {
                name: name.clone(),
                state: ServerState::Stopped,
                exit_code: code,
                unexpected: true,
            });
            StartOutcome::Exited { status }
        }
    };
    outcome_tx.send_replace(Some(outcome));
}

/// Clean up after a running server that exits without being stopped.
async fn watch_exit(
    inner: Weak<Inner>,
    name: String,
    instance: Uuid,
    mut exit_rx: watch::Receiver<Option<ExitInfo>>,
) {
    let info = match exit_rx.wait_for(Option::is_some).await {
        Ok(info) => info.clone(),
        Err(_) => None,
    };
    let Some(info) = info else { return };
    if info.requested {
        return;
    }
    let Some(inner) = inner.upgrade() else { return };
    let Some(Slot::Running(running)) = inner.remove_instance(&name, instance) else {
        return;
    };

    tracing::warn!(server = %name, status = %info.status, "server exited unexpectedly");
    running.transport.close();
    inner.events.emit(HostEvent::ServerStatusChanged {
        name,
        state: ServerState::Stopped,
        exit_code: info.code,
        unexpected: true,
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::BUILTIN_READY_PHRASES;
    use tempfile::TempDir;
    use tokio::sync::broadcast;
    use toolhost_config::BuiltinId;

    struct Fixture {
        manager: ServerProcessManager,
        events: broadcast::Receiver<HostEvent>,
        _tmp: TempDir,
    }

    fn fixture(servers: &[(&str, ServerDefinition)]) -> Fixture {
        let tmp = TempDir::new().unwrap();
        let bus = EventBus::new();
        let store = Arc::new(ConfigStore::in_dir(tmp.path(), bus.clone()));
        for (name, def) in servers {
            store.upsert(name, def.clone()).unwrap();
        }
        let events = bus.subscribe();
        Fixture {
            manager: ServerProcessManager::new(store, bus),
            events,
            _tmp: tmp,
        }
    }

    fn sh(script: &str) -> ServerDefinition {
        ServerDefinition::spawned("sh", ["-c", script])
    }

    fn drain(rx: &mut broadcast::Receiver<HostEvent>) -> Vec<HostEvent> {
        let mut out = Vec::new();
        while let Ok(event) = rx.try_recv() {
            out.push(event);
        }
        out
    }

    fn started_count(events: &[HostEvent]) -> usize {
        events
            .iter()
            .filter(|e| matches!(e, HostEvent::ServerStarted { .. }))
            .count()
    }

    #[tokio::test]
    async fn unknown_server_is_not_configured() {
        let f = fixture(&[]);
        assert!(matches!(
            f.manager.start("ghost").await,
            Err(McpError::NotConfigured { .. })
        ));
        assert!(!f.manager.stop("ghost").await);
        assert!(!f.manager.is_running("ghost"));
        assert_eq!(f.manager.status("ghost"), ServerState::Stopped);
    }

    #[tokio::test]
    async fn disabled_and_remote_servers_do_not_start() {
        let mut disabled = sh("echo ready; exec sleep 30");
        disabled.enabled = false;
        let f = fixture(&[
            ("off", disabled),
            ("api", ServerDefinition::remote("https://tools.example.com/mcp")),
        ]);
        assert!(matches!(
            f.manager.start("off").await,
            Err(McpError::ServerDisabled { .. })
        ));
        assert!(matches!(
            f.manager.start("api").await,
            Err(McpError::UnsupportedTransport { .. })
        ));
    }

    #[tokio::test]
    async fn in_memory_start_is_immediate_and_idempotent() {
        let mut f = fixture(&[("prompts", ServerDefinition::in_memory(BuiltinId::Prompts))]);
        f.manager.start("prompts").await.unwrap();
        f.manager.start("prompts").await.unwrap();
        assert!(f.manager.is_running("prompts"));
        let events = drain(&mut f.events);
        assert_eq!(started_count(&events), 1);
        assert_eq!(f.manager.running()[0].transport, TransportKind::InMemory);
    }

    #[tokio::test]
    async fn spawned_lifecycle_emits_state_transitions() {
        let mut f = fixture(&[("echo", sh("echo 'Echo server running on stdio' >&2; exec sleep 30"))]);
        f.manager.start("echo").await.unwrap();
        assert!(f.manager.is_running("echo"));
        assert!(f.manager.running()[0].pid.is_some());

        assert!(f.manager.stop("echo").await);
        assert!(!f.manager.is_running("echo"));
        assert!(!f.manager.stop("echo").await);

        let states: Vec<ServerState> = drain(&mut f.events)
            .into_iter()
            .filter_map(|e| match e {
                HostEvent::ServerStatusChanged { state, .. } => Some(state),
                _ => None,
            })
            .collect();
        assert_eq!(
            states,
            vec![
                ServerState::Starting,
                ServerState::Running,
                ServerState::Stopping,
                ServerState::Stopped
            ]
        );
    }

    #[tokio::test]
    async fn stop_without_start_emits_nothing() {
        let mut f = fixture(&[("echo", sh("echo ready; exec sleep 30"))]);
        assert!(!f.manager.stop("echo").await);
        assert!(drain(&mut f.events).is_empty());
    }

    #[tokio::test]
    async fn missing_ready_line_times_out() {
        let mut def = sh("exec sleep 30");
        def.startup_timeout_ms = Some(200);
        let f = fixture(&[("mute", def)]);
        match f.manager.start("mute").await {
            Err(McpError::StartTimeout { timeout_ms, .. }) => assert_eq!(timeout_ms, 200),
            other => panic!("Expected StartTimeout, got: {other:?}"),
        }
        assert_eq!(f.manager.status("mute"), ServerState::Stopped);
    }

    #[tokio::test]
    async fn exit_during_startup_fails_with_status() {
        let f = fixture(&[("crash", sh("echo booting; exit 3"))]);
        match f.manager.start("crash").await {
            Err(McpError::StartFailed { status, .. }) => assert!(status.contains('3'), "{status}"),
            other => panic!("Expected StartFailed, got: {other:?}"),
        }
        assert!(!f.manager.is_running("crash"));
    }

    #[tokio::test]
    async fn custom_ready_phrase() {
        let mut def = sh("echo 'listening on 127.0.0.1:0'; exec sleep 30");
        def.ready_phrase = Some("Listening".into());
        let f = fixture(&[("custom", def)]);
        f.manager.start("custom").await.unwrap();
        f.manager.stop_all().await;
        assert!(f.manager.running().is_empty());
    }

    #[tokio::test]
    async fn concurrent_starts_spawn_once() {
        let mut f = fixture(&[("slow", sh("sleep 0.3; echo ready; exec sleep 30"))]);
        let (a, b) = tokio::join!(f.manager.start("slow"), f.manager.start("slow"));
        a.unwrap();
        b.unwrap();
        assert_eq!(started_count(&drain(&mut f.events)), 1);
        assert_eq!(f.manager.running().len(), 1);
        f.manager.stop_all().await;
    }

    #[tokio::test]
    async fn stop_during_startup_kills_the_launch() {
        let mut f = fixture(&[("slow", sh("sleep 0.5; echo ready; exec sleep 30"))]);
        let stop = async {
            tokio::time::sleep(std::time::Duration::from_millis(100)).await;
            f.manager.stop("slow").await
        };
        let (started, stopped) = tokio::join!(f.manager.start("slow"), stop);
        assert!(stopped);
        match started {
            Err(McpError::StartFailed { status, .. }) => assert!(status.contains("stopped"), "{status}"),
            other => panic!("Expected StartFailed, got: {other:?}"),
        }

        // Well past the point the script would have printed its ready line.
        tokio::time::sleep(std::time::Duration::from_millis(800)).await;
        assert!(!f.manager.is_running("slow"));
        assert_eq!(f.manager.status("slow"), ServerState::Stopped);

        let events = drain(&mut f.events);
        assert_eq!(started_count(&events), 0);
        assert!(events.contains(&HostEvent::ServerStopped { name: "slow".into() }));
        assert_eq!(
            events.last(),
            Some(&HostEvent::status("slow", ServerState::Stopped))
        );

        // The name is free for a fresh start afterwards.
        f.manager.start("slow").await.unwrap();
        assert!(f.manager.is_running("slow"));
        f.manager.stop_all().await;
    }

    #[tokio::test]
    async fn stop_all_cancels_pending_starts() {
        let f = fixture(&[("slow", sh("sleep 0.5; echo ready; exec sleep 30"))]);
        let stop_all = async {
            tokio::time::sleep(std::time::Duration::from_millis(100)).await;
            f.manager.stop_all().await
        };
        let (started, ()) = tokio::join!(f.manager.start("slow"), stop_all);
        assert!(started.is_err());
        assert!(f.manager.running().is_empty());
        assert_eq!(f.manager.status("slow"), ServerState::Stopped);
    }

    #[tokio::test]
    async fn unexpected_exit_is_reported() {
        let mut f = fixture(&[("flaky", sh("echo ready; sleep 0.3; exit 2"))]);
        f.manager.start("flaky").await.unwrap();
        let event = tokio::time::timeout(std::time::Duration::from_secs(5), async {
            loop {
                match f.events.recv().await.unwrap() {
                    event @ HostEvent::ServerStatusChanged {
                        unexpected: true, ..
                    } => return event,
                    _ => continue,
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(
            event,
            HostEvent::ServerStatusChanged {
                name: "flaky".into(),
                state: ServerState::Stopped,
                exit_code: Some(2),
                unexpected: true,
            }
        );
        assert!(!f.manager.is_running("flaky"));
        assert!(matches!(
            f.manager.transport("flaky"),
            Err(McpError::ServerNotRunning { .. })
        ));
    }

    #[tokio::test]
    async fn restart_after_stop_spawns_fresh_instance() {
        let f = fixture(&[("echo", sh("echo ready; exec sleep 30"))]);
        f.manager.start("echo").await.unwrap();
        let first = f.manager.running()[0].instance;
        f.manager.stop("echo").await;
        f.manager.start("echo").await.unwrap();
        assert_ne!(f.manager.running()[0].instance, first);
        f.manager.stop_all().await;
    }

    #[test]
    fn builtin_phrases_cover_common_banners() {
        assert!(BUILTIN_READY_PHRASES.contains(&"running on stdio"));
        assert!(!BUILTIN_READY_PHRASES.contains(&"ready"));
    }

    #[tokio::test]
    async fn log_line_mentioning_ready_is_not_readiness() {
        let mut def = sh("echo 'cache already initialised'; echo 'not ready yet'; exec sleep 30");
        def.startup_timeout_ms = Some(300);
        let f = fixture(&[("chatty", def)]);
        assert!(matches!(
            f.manager.start("chatty").await,
            Err(McpError::StartTimeout { .. })
        ));
        assert!(!f.manager.is_running("chatty"));
    }
}
