//! Control protocol replies, in-process and over TCP

mod common;

use anyhow::{bail, Result};
use collect_agent::agent::control::After;
use collect_agent::{
    AdaptorFactory, AdaptorRegistry, AgentControl, ControlHandler, ControlServer, ShutdownPolicy,
};
use common::{scripted_registry, Sink, SCRIPTED};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::broadcast;

#[derive(Default)]
struct FakeControl {
    reloads: AtomicUsize,
    stops: AtomicUsize,
    broken_collectors: AtomicBool,
}

impl AgentControl for FakeControl {
    fn reload_collectors(&self) -> Result<()> {
        if self.broken_collectors.load(Ordering::SeqCst) {
            bail!("collectors file missing");
        }
        self.reloads.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn request_stop(&self) {
        self.stops.fetch_add(1, Ordering::SeqCst);
    }
}

fn handler() -> (ControlHandler, Arc<AdaptorRegistry>, Arc<FakeControl>) {
    let (registry, _, _) = scripted_registry();
    let control = Arc::new(FakeControl::default());
    let handler = ControlHandler::new(registry.clone(), control.clone(), "test-host");
    (handler, registry, control)
}

#[test]
fn test_add_list_and_shutdown() {
    let (handler, registry, _) = handler();

    let reply = handler.handle("add s = ScriptedAdaptor logs p 7");
    assert_eq!(reply.lines, vec!["OK add completed; new ID is adaptor_s"]);
    assert_eq!(reply.after, After::Continue);

    let reply = handler.handle("LIST");
    assert_eq!(reply.lines, vec!["adaptor_s)  ScriptedAdaptor p 7", ""]);

    let reply = handler.handle("shutdown s");
    assert_eq!(
        reply.lines,
        vec![
            "adaptor names should start with adaptor_; assuming you meant adaptor_s",
            "OK adaptor adaptor_s stopping gracefully at 7",
        ]
    );
    assert_eq!(registry.count(), 0);
}

#[test]
fn test_hard_stop_and_missing_adaptor() {
    let (handler, registry, _) = handler();
    registry.add(Some("x"), SCRIPTED, "logs", "p", 0).unwrap();

    assert_eq!(handler.handle("stop adaptor_x").lines, vec!["OK adaptor adaptor_x stopped"]);
    assert_eq!(
        handler.handle("stop adaptor_x").lines,
        vec!["FAIL: perhaps adaptor adaptor_x does not exist"]
    );
    assert!(handler.handle("shutdown").lines[0].starts_with("FAIL: "));
}

#[test]
fn test_failed_add_reports_reason() {
    let (handler, registry, _) = handler();
    let reply = handler.handle("add NoSuchAdaptor logs p 0");
    assert!(reply.lines[0].starts_with("FAIL: "));
    assert!(reply.lines[0].contains("NoSuchAdaptor"));
    assert_eq!(registry.count(), 0);
}

#[test]
fn test_oversized_const_rate_add_fails_cleanly() {
    // Given: the built-in adaptors
    let registry = Arc::new(AdaptorRegistry::new(
        AdaptorFactory::with_builtin(),
        Arc::new(Sink::default()),
    ));
    let handler = ControlHandler::new(registry.clone(), Arc::new(FakeControl::default()), "h");

    // When: the rate times the interval overflows
    let reply = handler.handle("add ConstRateAdaptor raw 18446744073709551615 1000 0");

    // Then: a failure line comes back and nothing runs
    assert_eq!(reply.lines.len(), 1);
    assert!(reply.lines[0].starts_with("FAIL: "), "{:?}", reply.lines);
    assert_eq!(registry.count(), 0);

    // and a sane rate on the same handler still works
    let reply = handler.handle("add c = ConstRateAdaptor raw 1000 10 0");
    assert_eq!(reply.lines, vec!["OK add completed; new ID is adaptor_c"]);
    registry.stop_all(ShutdownPolicy::HardStop);
}

#[test]
fn test_stopall_and_status() {
    let (handler, registry, _) = handler();
    registry.add(Some("a"), SCRIPTED, "logs", "p", 0).unwrap();
    registry.add(Some("b"), SCRIPTED, "logs", "q", 0).unwrap();

    let status = handler.handle("   ");
    assert!(status.lines[0].starts_with("test-host: collect-agent running, version "));
    assert!(status.lines[0].ends_with("with 2 adaptors"));

    assert_eq!(handler.handle("stopall").lines, vec!["stopped 2 adaptors"]);
    assert_eq!(registry.count(), 0);
}

#[test]
fn test_reload_collectors() {
    let (handler, _, control) = handler();
    assert_eq!(handler.handle("reloadCollectors").lines, vec!["OK reloadCollectors done"]);
    assert_eq!(control.reloads.load(Ordering::SeqCst), 1);

    control.broken_collectors.store(true, Ordering::SeqCst);
    assert_eq!(
        handler.handle("reloadcollectors").lines,
        vec!["FAIL: collectors file missing"]
    );
}

#[test]
fn test_unknown_help_close_and_stopagent() {
    let (handler, _, _) = handler();

    assert_eq!(
        handler.handle("frobnicate now").lines,
        vec!["unknown command frobnicate", "say 'help' for a list of legal commands"]
    );
    assert!(handler.handle("Help").lines.len() > 5);

    let close = handler.handle("close");
    assert!(close.lines.is_empty());
    assert_eq!(close.after, After::Close);

    let stop = handler.handle("stopagent");
    assert_eq!(stop.lines, vec!["stopping agent process."]);
    assert_eq!(stop.after, After::StopAgent);
}

async fn converse(addr: std::net::SocketAddr, script: &str) -> String {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream.write_all(script.as_bytes()).await.unwrap();
    let mut reply = String::new();
    stream.read_to_string(&mut reply).await.unwrap();
    reply
}

#[tokio::test]
async fn test_tcp_session() {
    // Given: a control server on an ephemeral loopback port
    let (registry, _, _) = scripted_registry();
    let control = Arc::new(FakeControl::default());
    let server = ControlServer::bind(registry.clone(), control.clone(), 0, false)
        .await
        .unwrap();
    let addr = server.local_addr().unwrap();
    assert!(addr.ip().is_loopback());
    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
    let task = tokio::spawn(server.run(shutdown_rx));

    // When: a client adds and lists, then closes
    let reply = converse(addr, "add s = ScriptedAdaptor logs p 7\r\nlist\nclose\n").await;

    // Then: replies arrive in order and the connection ends
    assert_eq!(
        reply,
        "OK add completed; new ID is adaptor_s\nadaptor_s)  ScriptedAdaptor p 7\n\n"
    );
    assert_eq!(registry.count(), 1);

    // When: a client asks the agent to stop
    let reply = converse(addr, "stopagent\n").await;
    assert_eq!(reply, "stopping agent process.\n");
    assert_eq!(control.stops.load(Ordering::SeqCst), 1);

    shutdown_tx.send(()).unwrap();
    task.await.unwrap();
}
