//! End-to-end invocation against a spawned mock MCP server.
//!
//! The mock is a small Python script; every test is skipped when `python3`
//! is not on the PATH.

use serde_json::json;
use std::path::Path;
use std::process::Command;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use toolhost_config::{ConfigStore, ServerDefinition};
use toolhost_core::ToolInvocationService;
use toolhost_mcp::ServerProcessManager;
use toolhost_permissions::Capability;
use toolhost_types::{EventBus, GenericToolCall, HostEvent, ServerState};

const MOCK_SERVER: &str = r#"
import json, os, sys, time

sys.stderr.write("Mock MCP server running on stdio\n")
sys.stderr.flush()

TOOLS = [
    {"name": "echo", "description": "Echo text back",
     "inputSchema": {"type": "object", "properties": {"text": {"type": "string"}}, "required": ["text"]}},
    {"name": "slow", "description": "Sleep, then answer",
     "inputSchema": {"type": "object", "properties": {"seconds": {"type": "number"}}}},
    {"name": "fail", "description": "Always fails", "inputSchema": {"type": "object"}},
    {"name": "crash", "description": "Exit without answering", "inputSchema": {"type": "object"}},
]

def send(message):
    sys.stdout.write(json.dumps(message) + "\n")
    sys.stdout.flush()

while True:
    line = sys.stdin.readline()
    if not line:
        break
    line = line.strip()
    if not line:
        continue
    msg = json.loads(line)
    if "id" not in msg:
        continue
    mid = msg["id"]
    method = msg.get("method")
    params = msg.get("params") or {}

    def reply(result):
        send({"jsonrpc": "2.0", "id": mid, "result": result})

    def text(value, is_error=False):
        reply({"content": [{"type": "text", "text": value}], "isError": is_error})

    if method == "initialize":
        reply({"protocolVersion": "2024-11-05", "capabilities": {"tools": {}},
               "serverInfo": {"name": "mock", "version": "1.0.0"}})
    elif method == "tools/list":
        reply({"tools": TOOLS})
    elif method == "tools/call":
        name = params.get("name")
        args = params.get("arguments") or {}
        if name == "echo":
            text(args.get("text", ""))
        elif name == "slow":
            time.sleep(float(args.get("seconds", 1)))
            text("done")
        elif name == "fail":
            text("boom", True)
        elif name == "crash":
            os._exit(7)
        else:
            send({"jsonrpc": "2.0", "id": mid, "error": {"code": -32601, "message": "unknown tool"}})
    else:
        send({"jsonrpc": "2.0", "id": mid, "error": {"code": -32601, "message": "unknown method"}})
"#;

fn python_available() -> bool {
    Command::new("python3")
        .arg("--version")
        .output()
        .map(|out| out.status.success())
        .unwrap_or(false)
}

macro_rules! require_python {
    () => {
        if !python_available() {
            eprintln!("python3 not found; skipping");
            return;
        }
    };
}

struct Harness {
    service: ToolInvocationService,
    events: broadcast::Receiver<HostEvent>,
    _tmp: TempDir,
}

fn mock_definition(dir: &Path) -> ServerDefinition {
    let script = dir.join("mock_server.py");
    std::fs::write(&script, MOCK_SERVER).unwrap();
    let mut def = ServerDefinition::spawned("python3", ["-u".to_string(), script.display().to_string()]);
    def.request_timeout_ms = Some(5_000);
    def
}

fn harness(approvals: &[Capability]) -> Harness {
    harness_with(approvals, |_| {})
}

fn harness_with(approvals: &[Capability], customize: impl FnOnce(&mut ServerDefinition)) -> Harness {
    let tmp = TempDir::new().unwrap();
    let bus = EventBus::new();
    let config = Arc::new(ConfigStore::in_dir(tmp.path(), bus.clone()));
    let mut def = mock_definition(tmp.path()).with_approvals(approvals.iter().copied());
    customize(&mut def);
    config.upsert("mock", def).unwrap();
    config.set_default("mock").unwrap();
    let events = bus.subscribe();
    let manager = ServerProcessManager::new(Arc::clone(&config), bus);
    Harness {
        service: ToolInvocationService::new(config, manager),
        events,
        _tmp: tmp,
    }
}

fn drain(rx: &mut broadcast::Receiver<HostEvent>) -> Vec<HostEvent> {
    let mut out = Vec::new();
    while let Ok(event) = rx.try_recv() {
        out.push(event);
    }
    out
}

fn call(id: &str, tool: &str, args: serde_json::Value) -> GenericToolCall {
    GenericToolCall::new(id, tool, args.to_string())
}

#[tokio::test]
async fn echo_round_trip() {
    require_python!();
    let mut h = harness(&[Capability::All]);

    let result = h.service.invoke(&call("c1", "echo", json!({"text": "hi"}))).await;
    assert!(!result.is_error, "{}", result.content);
    assert_eq!(result.content, "hi");
    assert_eq!(result.tool_call_id, "c1");

    let events = drain(&mut h.events);
    let states: Vec<ServerState> = events
        .iter()
        .filter_map(|e| match e {
            HostEvent::ServerStatusChanged { state, .. } => Some(*state),
            _ => None,
        })
        .collect();
    assert_eq!(states, vec![ServerState::Starting, ServerState::Running]);
    assert!(events.iter().any(|e| matches!(
        e,
        HostEvent::ToolCallResult { call_id, is_error: false, .. } if call_id == "c1"
    )));

    h.service.shutdown().await;
}

#[tokio::test]
async fn tools_are_listed_with_all_params_required() {
    require_python!();
    let h = harness(&[Capability::All]);
    let tools = h.service.list_all_tools().await.unwrap();
    let names: Vec<&str> = tools.iter().map(|t| t.function.name.as_str()).collect();
    assert_eq!(names, vec!["echo", "slow", "fail", "crash"]);
    // `slow` declares no required params, but every declared one is listed.
    assert_eq!(tools[1].function.parameters["required"], json!(["seconds"]));
    assert_eq!(tools[2].function.parameters["required"], json!([]));
    h.service.shutdown().await;
}

#[tokio::test]
async fn read_only_server_denies_unclassified_tool() {
    require_python!();
    let h = harness(&[Capability::Read]);
    let result = h.service.invoke(&call("c1", "echo", json!({"text": "hi"}))).await;
    assert!(result.is_error);
    assert!(result.content.contains("Permission denied"), "{}", result.content);
    assert!(!h.service.manager().is_running("mock"));
}

#[tokio::test]
async fn tool_error_leaves_server_running() {
    require_python!();
    let h = harness(&[Capability::All]);
    let result = h.service.invoke(&call("c1", "fail", json!({}))).await;
    assert!(result.is_error);
    assert!(result.content.contains("boom"), "{}", result.content);
    assert!(h.service.manager().is_running("mock"));

    let result = h.service.invoke(&call("c2", "echo", json!({"text": "again"}))).await;
    assert_eq!(result.content, "again");
    h.service.shutdown().await;
}

#[tokio::test]
async fn crash_mid_call_resolves_to_error() {
    require_python!();
    let mut h = harness(&[Capability::All]);
    let result = tokio::time::timeout(
        Duration::from_secs(10),
        h.service.invoke(&call("c1", "crash", json!({}))),
    )
    .await
    .unwrap();
    assert!(result.is_error);

    // The supervisor reports the exit and drops the handle.
    let exit = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if let HostEvent::ServerStatusChanged {
                unexpected: true,
                exit_code,
                ..
            } = h.events.recv().await.unwrap()
            {
                return exit_code;
            }
        }
    })
    .await
    .unwrap();
    assert_eq!(exit, Some(7));
    assert!(!h.service.manager().is_running("mock"));

    // The next call starts a fresh process.
    let result = h.service.invoke(&call("c2", "echo", json!({"text": "back"}))).await;
    assert_eq!(result.content, "back");
    h.service.shutdown().await;
}

#[tokio::test]
async fn concurrent_invokes_start_once() {
    require_python!();
    let mut h = harness(&[Capability::All]);
    let a = call("a", "echo", json!({"text": "one"}));
    let b = call("b", "echo", json!({"text": "two"}));
    let (ra, rb) = tokio::join!(h.service.invoke(&a), h.service.invoke(&b));
    assert_eq!(ra.content, "one");
    assert_eq!(rb.content, "two");

    let started = drain(&mut h.events)
        .into_iter()
        .filter(|e| matches!(e, HostEvent::ServerStarted { .. }))
        .count();
    assert_eq!(started, 1);
    assert_eq!(h.service.manager().running().len(), 1);
    h.service.shutdown().await;
}

#[tokio::test]
async fn removing_running_default_stops_it_first() {
    require_python!();
    let mut h = harness(&[Capability::All]);
    h.service.invoke(&call("c1", "echo", json!({"text": "hi"}))).await;
    assert!(h.service.manager().is_running("mock"));
    drain(&mut h.events);

    assert!(h.service.remove_server("mock").await.unwrap());
    assert!(!h.service.manager().is_running("mock"));
    assert!(h.service.config().get().get("mock").is_none());

    let events = drain(&mut h.events);
    let stopped = events
        .iter()
        .position(|e| matches!(e, HostEvent::ServerStopped { .. }))
        .unwrap();
    let changed = events
        .iter()
        .position(|e| matches!(e, HostEvent::ConfigChanged { .. }))
        .unwrap();
    assert!(stopped < changed);
}

#[tokio::test]
async fn removing_server_during_startup_kills_it() {
    require_python!();
    let mut h = harness_with(&[Capability::All], |def| {
        // Hold the ready banner back so the removal lands mid-start.
        let script = def.args[1].clone();
        def.command = "sh".into();
        def.args = vec!["-c".into(), format!("sleep 0.5; exec python3 -u '{script}'")];
    });

    let c1 = call("c1", "echo", json!({"text": "hi"}));
    let invoke = h.service.invoke(&c1);
    let remove = async {
        tokio::time::sleep(Duration::from_millis(100)).await;
        h.service.remove_server("mock").await
    };
    let (result, removed) = tokio::join!(invoke, remove);
    assert!(removed.unwrap());
    assert!(result.is_error, "{}", result.content);
    assert!(h.service.config().definition("mock").is_none());

    // Long after the banner would have appeared, nothing is left running.
    tokio::time::sleep(Duration::from_millis(1_000)).await;
    assert!(!h.service.manager().is_running("mock"));
    assert_eq!(h.service.manager().status("mock"), ServerState::Stopped);

    let events = drain(&mut h.events);
    assert!(!events.iter().any(|e| matches!(e, HostEvent::ServerStarted { .. })));
    let stopped = events
        .iter()
        .position(|e| matches!(e, HostEvent::ServerStopped { .. }))
        .unwrap();
    let changed = events
        .iter()
        .position(|e| matches!(e, HostEvent::ConfigChanged { .. }))
        .unwrap();
    assert!(stopped < changed);
}

#[tokio::test]
async fn request_timeout_is_enforced() {
    require_python!();
    let h = harness_with(&[Capability::All], |def| def.request_timeout_ms = Some(300));
    let result = h
        .service
        .invoke(&call("c1", "slow", json!({"seconds": 2})))
        .await;
    assert!(result.is_error);
    assert!(result.content.contains("timed out"), "{}", result.content);
    h.service.shutdown().await;
}

#[tokio::test]
async fn cancelled_call_returns_promptly() {
    require_python!();
    let h = harness(&[Capability::All]);
    // Warm up so the cancel lands on the call itself.
    h.service.invoke(&call("c0", "echo", json!({"text": "up"}))).await;

    let token = CancellationToken::new();
    let canceller = token.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        canceller.cancel();
    });
    let started = std::time::Instant::now();
    let result = h
        .service
        .invoke_with_cancel(&call("c1", "slow", json!({"seconds": 1})), token)
        .await;
    assert!(result.is_error);
    assert!(result.content.contains("cancelled"), "{}", result.content);
    assert!(started.elapsed() < Duration::from_millis(900));
    assert!(h.service.manager().is_running("mock"));
    h.service.shutdown().await;
}

#[tokio::test]
async fn stop_fails_in_flight_call() {
    require_python!();
    let h = Arc::new(harness(&[Capability::All]));
    h.service.invoke(&call("c0", "echo", json!({"text": "up"}))).await;

    let pending = {
        let h = Arc::clone(&h);
        tokio::spawn(async move {
            h.service
                .invoke(&call("c1", "slow", json!({"seconds": 3})))
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(h.service.manager().stop("mock").await);

    let result = tokio::time::timeout(Duration::from_secs(2), pending)
        .await
        .unwrap()
        .unwrap();
    assert!(result.is_error);
    assert!(result.content.contains("stopped"), "{}", result.content);
}
