use std::io::{BufRead, BufReader, Write};
use std::net::{TcpListener, TcpStream};
use std::path::Path;
use std::process::{Child, Command, Output, Stdio};
use std::time::Duration;

use serde_json::{Value, json};
use serial_test::serial;

fn free_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

fn bin() -> &'static str {
    env!("CARGO_BIN_EXE_vigil")
}

struct Daemon {
    child: Child,
    port: u16,
}

impl Drop for Daemon {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

fn spawn_daemon(temp: &Path) -> Daemon {
    let port = free_port();
    let child = Command::new(bin())
        .arg("run")
        .arg("--state-dir")
        .arg(temp.join("state"))
        .arg("--query-tcp-addr")
        .arg(format!("127.0.0.1:{port}"))
        .arg("--query-uds-path")
        .arg(temp.join("vigil.sock"))
        .env("VIGIL_CONFIG", temp.join("absent.toml"))
        .env("VIGIL_ALERT_EVALUATION_INTERVAL", "1h")
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .unwrap();
    let mut daemon = Daemon { child, port };
    wait_ready(&mut daemon);
    daemon
}

fn wait_ready(daemon: &mut Daemon) {
    for _ in 0..100 {
        assert!(
            daemon.child.try_wait().unwrap().is_none(),
            "vigil exited early"
        );
        if TcpStream::connect(("127.0.0.1", daemon.port)).is_ok() {
            return;
        }
        std::thread::sleep(Duration::from_millis(100));
    }
    panic!("query endpoint not ready");
}

/// Sends one raw JSON-lines request, the way an instrumented service would.
fn send(port: u16, request: Value) -> Value {
    let mut stream = TcpStream::connect(("127.0.0.1", port)).unwrap();
    let mut payload = serde_json::to_vec(&request).unwrap();
    payload.push(b'\n');
    stream.write_all(&payload).unwrap();
    let mut line = String::new();
    BufReader::new(stream).read_line(&mut line).unwrap();
    serde_json::from_str(&line).unwrap()
}

fn cli(port: u16, args: &[&str]) -> Output {
    Command::new(bin())
        .args(args)
        .arg("--addr")
        .arg(format!("127.0.0.1:{port}"))
        .output()
        .unwrap()
}

fn stdout(output: &Output) -> String {
    String::from_utf8_lossy(&output.stdout).into_owned()
}

#[test]
#[serial]
fn e2e_span_ingest_and_trace_queries() {
    let temp = tempfile::tempdir().unwrap();
    let daemon = spawn_daemon(temp.path());

    let root = send(
        daemon.port,
        json!({"StartSpan": {"operation": "GET /users", "service": "api"}}),
    );
    let root = &root["Span"];
    let trace_id = root["trace_id"].as_str().unwrap().to_string();
    let root_id = root["span_id"].as_str().unwrap().to_string();

    let child = send(
        daemon.port,
        json!({"StartSpan": {
            "operation": "SELECT users",
            "service": "db",
            "parent": {"span": {"trace_id": trace_id, "span_id": root_id}},
            "tags": {"db.system": "postgres"}
        }}),
    );
    let child_id = child["Span"]["span_id"].as_str().unwrap().to_string();

    let finished = send(daemon.port, json!({"FinishSpan": {"span_id": child_id}}));
    assert_eq!(finished, json!({"Applied": true}));
    let again = send(daemon.port, json!({"FinishSpan": {"span_id": child_id}}));
    assert_eq!(again, json!({"Applied": false}));
    send(daemon.port, json!({"FinishSpan": {"span_id": root_id}}));

    let traces = stdout(&cli(daemon.port, &["traces", "--service", "db"]));
    assert!(traces.contains(&format!("trace={trace_id}")));
    assert!(traces.contains("-- 1 traces (1 matched) --"));

    let timeline = stdout(&cli(daemon.port, &["timeline", trace_id.as_str()]));
    assert!(timeline.contains("api GET /users"));
    assert!(timeline.contains("  db SELECT users"));

    let graph = stdout(&cli(daemon.port, &["graph"]));
    assert!(graph.contains("api -> db calls=1 errors=0"));

    let export = cli(daemon.port, &["export", "--format", "zipkin"]);
    let spans: Value = serde_json::from_slice(&export.stdout).unwrap();
    assert_eq!(spans.as_array().unwrap().len(), 2);

    let status = cli(daemon.port, &["--json", "status"]);
    let value: Value = serde_json::from_slice(&status.stdout).unwrap();
    assert_eq!(value["Status"]["traces"]["total_traces"], json!(1));
    assert_eq!(value["Status"]["rules"], json!(4));
}

#[test]
#[serial]
fn e2e_metric_report_raises_and_resolves_alert() {
    let temp = tempfile::tempdir().unwrap();
    let daemon = spawn_daemon(temp.path());

    let applied = send(
        daemon.port,
        json!({"Metric": {"metric": "system.cpu.usage", "value": 95.0}}),
    );
    assert_eq!(applied, json!({"Applied": true}));

    let evaluated = stdout(&cli(daemon.port, &["evaluate"]));
    assert!(evaluated.contains("rule=high-cpu-usage"));
    assert!(evaluated.contains("alert="));

    let listed = cli(daemon.port, &["--json", "alerts"]);
    let value: Value = serde_json::from_slice(&listed.stdout).unwrap();
    let alerts = value["Alerts"].as_array().unwrap();
    assert_eq!(alerts.len(), 1);
    assert_eq!(alerts[0]["metadata"]["current_value"], json!(95.0));
    let alert_id = alerts[0]["id"].as_str().unwrap().to_string();

    let ack = cli(daemon.port, &["ack", alert_id.as_str(), "--by", "ops"]);
    assert_eq!(stdout(&ack).trim(), "ok");

    let shown = cli(daemon.port, &["--json", "alerts", alert_id.as_str()]);
    let value: Value = serde_json::from_slice(&shown.stdout).unwrap();
    assert_eq!(value["Alert"]["status"], json!("acknowledged"));
    assert_eq!(value["Alert"]["acknowledged_by"], json!("ops"));

    let resolve = cli(daemon.port, &["resolve", alert_id.as_str()]);
    assert_eq!(stdout(&resolve).trim(), "ok");
    let remaining = stdout(&cli(daemon.port, &["alerts"]));
    assert!(remaining.contains("-- 0 alerts --"));

    let stats = cli(daemon.port, &["--json", "alerts", "--stats"]);
    let value: Value = serde_json::from_slice(&stats.stdout).unwrap();
    assert_eq!(value["AlertStats"]["resolved"], json!(1));
}

#[test]
#[serial]
fn e2e_rules_can_be_disabled() {
    let temp = tempfile::tempdir().unwrap();
    let daemon = spawn_daemon(temp.path());

    let rules = stdout(&cli(daemon.port, &["rules"]));
    assert!(rules.contains("-- 4 rules --"));
    assert!(rules.contains("escalation=standard-escalation"));

    let disabled = cli(daemon.port, &["rules", "--disable", "high-cpu-usage"]);
    assert_eq!(stdout(&disabled).trim(), "ok");

    let listed = cli(daemon.port, &["--json", "rules"]);
    let value: Value = serde_json::from_slice(&listed.stdout).unwrap();
    let cpu = value["Rules"]
        .as_array()
        .unwrap()
        .iter()
        .find(|r| r["id"] == json!("high-cpu-usage"))
        .unwrap();
    assert_eq!(cpu["enabled"], json!(false));
}

#[test]
#[serial]
fn e2e_unknown_trace_exits_nonzero() {
    let temp = tempfile::tempdir().unwrap();
    let daemon = spawn_daemon(temp.path());

    let output = cli(daemon.port, &["trace", "does-not-exist"]);
    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("trace not found"));
}

#[test]
fn cli_without_daemon_fails() {
    let output = Command::new(bin())
        .arg("status")
        .arg("--addr")
        .arg("127.0.0.1:1")
        .output()
        .unwrap();
    assert!(!output.status.success());
}
