use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, UnixListener};
use vigil_alerts::{AlertEngine, SignalBuffer};
use vigil_core::query::StatusResponse;
use vigil_store::TraceStore;

use crate::protocol::{ApiRequest, ApiResponse, SampleDecision};

/// Everything a request can reach: both engines plus the signal buffer the
/// alert evaluators read from.
#[derive(Clone)]
pub struct Daemon {
    pub traces: TraceStore,
    pub alerts: AlertEngine,
    pub signals: Arc<SignalBuffer>,
    pub state_dir: PathBuf,
}

pub async fn run_query_server(
    daemon: Daemon,
    uds_path: PathBuf,
    tcp_addr: SocketAddr,
) -> anyhow::Result<()> {
    if let Some(parent) = uds_path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .context("create uds parent dir")?;
    }

    if tokio::fs::metadata(&uds_path).await.is_ok() {
        let _ = tokio::fs::remove_file(&uds_path).await;
    }

    let uds_listener = UnixListener::bind(&uds_path).context("bind UDS query listener")?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mut perms = tokio::fs::metadata(&uds_path).await?.permissions();
        perms.set_mode(0o600);
        tokio::fs::set_permissions(&uds_path, perms).await?;
    }
    let tcp_listener = TcpListener::bind(tcp_addr)
        .await
        .context("bind TCP query listener")?;

    let uds_task = tokio::spawn(run_uds_loop(uds_listener, daemon.clone()));
    let tcp_task = tokio::spawn(run_tcp_loop(tcp_listener, daemon));

    tokio::select! {
        res = uds_task => {
            res??;
        }
        res = tcp_task => {
            res??;
        }
    }

    Ok(())
}

async fn run_uds_loop(listener: UnixListener, daemon: Daemon) -> anyhow::Result<()> {
    loop {
        let (stream, _) = listener.accept().await?;
        let daemon = daemon.clone();
        tokio::spawn(async move {
            if let Err(err) = handle_stream(BufReader::new(stream), daemon).await {
                tracing::warn!(error = ?err, "uds client request failed");
            }
        });
    }
}

async fn run_tcp_loop(listener: TcpListener, daemon: Daemon) -> anyhow::Result<()> {
    loop {
        let (stream, peer) = listener.accept().await?;
        let daemon = daemon.clone();
        tokio::spawn(async move {
            if let Err(err) = handle_stream(BufReader::new(stream), daemon).await {
                tracing::warn!(error = ?err, %peer, "tcp client request failed");
            }
        });
    }
}

/// One JSON request per line, one JSON response per line, until the client
/// hangs up.
async fn handle_stream<T>(mut stream: BufReader<T>, daemon: Daemon) -> anyhow::Result<()>
where
    T: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    let mut line = String::new();
    loop {
        line.clear();
        let n = stream.read_line(&mut line).await?;
        if n == 0 {
            return Ok(());
        }
        if line.trim().is_empty() {
            continue;
        }

        let response = match serde_json::from_str::<ApiRequest>(&line) {
            Ok(req) => handle_request(req, &daemon).await,
            Err(err) => ApiResponse::Error(format!("invalid request: {err}")),
        };
        let payload = serde_json::to_vec(&response)?;
        stream.get_mut().write_all(&payload).await?;
        stream.get_mut().write_all(b"\n").await?;
        stream.get_mut().flush().await?;
    }
}

pub async fn handle_request(req: ApiRequest, daemon: &Daemon) -> ApiResponse {
    let traces = &daemon.traces;
    let alerts = &daemon.alerts;
    match req {
        ApiRequest::StartSpan(start) => ApiResponse::Span(traces.start_span(start)),
        ApiRequest::FinishSpan(r) => ApiResponse::Applied(traces.finish_span(&r.span_id, r.tags)),
        ApiRequest::AddTags(r) => ApiResponse::Applied(traces.add_tags(&r.span_id, r.tags)),
        ApiRequest::SetStatus(r) => {
            ApiResponse::Applied(traces.set_status(&r.span_id, r.code, r.message))
        }
        ApiRequest::AddLog(r) => ApiResponse::Applied(traces.add_log(&r.span_id, r.tags)),
        ApiRequest::ShouldSample => ApiResponse::Sample(SampleDecision {
            sample: traces.should_sample(),
            rate: traces.sampling_rate(),
        }),
        ApiRequest::SetSampling(update) => {
            if let Some(rate) = update.rate {
                traces.set_sampling_rate(rate);
            }
            if let Some(adaptive) = update.adaptive {
                traces.set_adaptive_sampling(adaptive);
            }
            ApiResponse::Sample(SampleDecision {
                sample: traces.should_sample(),
                rate: traces.sampling_rate(),
            })
        }
        ApiRequest::Metric(m) => {
            daemon
                .signals
                .record_metric(&m.metric, m.service.as_deref(), m.value);
            ApiResponse::Applied(true)
        }
        ApiRequest::Log(l) => {
            daemon.signals.record_log(l.service.as_deref(), &l.line);
            ApiResponse::Applied(true)
        }
        ApiRequest::Health(h) => {
            daemon.signals.record_health(h);
            ApiResponse::Applied(true)
        }
        ApiRequest::Trace(id) => traces
            .get_trace(&id)
            .map(ApiResponse::Trace)
            .unwrap_or_else(|| ApiResponse::Error(format!("trace not found: {id}"))),
        ApiRequest::Traces(query) => ApiResponse::Traces(traces.search_traces(&query)),
        ApiRequest::Timeline(id) => traces
            .trace_timeline(&id)
            .map(ApiResponse::Timeline)
            .unwrap_or_else(|| ApiResponse::Error(format!("trace not found: {id}"))),
        ApiRequest::Graph => ApiResponse::Graph(traces.dependency_graph()),
        ApiRequest::Services => ApiResponse::Services(traces.all_service_metrics()),
        ApiRequest::Export(r) => ApiResponse::Export(traces.export_traces(&r.query, r.format)),
        ApiRequest::Evaluate => ApiResponse::Evaluations(alerts.evaluate_all().await),
        ApiRequest::Alerts => ApiResponse::Alerts(alerts.active_alerts()),
        ApiRequest::Alert(id) => alerts
            .get_alert(&id)
            .map(ApiResponse::Alert)
            .unwrap_or_else(|| ApiResponse::Error(format!("alert not found: {id}"))),
        ApiRequest::Acknowledge(r) => {
            ApiResponse::Applied(alerts.acknowledge(&r.alert_id, r.by.as_deref()))
        }
        ApiRequest::Resolve(r) => ApiResponse::Applied(alerts.resolve(&r.alert_id, r.by.as_deref())),
        ApiRequest::Suppress(r) => ApiResponse::Applied(alerts.suppress(&r.alert_id, r.minutes)),
        ApiRequest::Rules => ApiResponse::Rules(alerts.rules()),
        ApiRequest::SetRuleEnabled(r) => {
            ApiResponse::Applied(alerts.set_rule_enabled(&r.rule_id, r.enabled))
        }
        ApiRequest::AlertStats => ApiResponse::AlertStats(alerts.statistics()),
        ApiRequest::Status => ApiResponse::Status(StatusResponse {
            state_dir: daemon.state_dir.display().to_string(),
            traces: traces.statistics(),
            alerts: alerts.statistics(),
            rules: alerts.rules().len(),
            pending_timers: alerts.pending_timers(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use vigil_alerts::{AlertEngineConfig, EvaluatorRegistry, TransportRegistry};
    use vigil_core::model::span::SpanStatusCode;
    use vigil_store::{StartSpan, TraceStoreConfig};

    use super::*;
    use crate::protocol::{
        AlertLifecycleRequest, MetricReport, SamplingUpdate, SetStatusRequest, SpanTagsRequest,
    };

    fn daemon() -> Daemon {
        let signals = Arc::new(SignalBuffer::new());
        let evaluators =
            EvaluatorRegistry::with_sources(signals.clone(), signals.clone(), signals.clone());
        let alerts = AlertEngine::new(
            AlertEngineConfig::default(),
            evaluators,
            TransportRegistry::default(),
        )
        .with_defaults();
        Daemon {
            traces: TraceStore::new(TraceStoreConfig::default()),
            alerts,
            signals,
            state_dir: PathBuf::from("/tmp/vigil-test"),
        }
    }

    #[tokio::test]
    async fn span_requests_reach_the_store() {
        let daemon = daemon();
        let ApiResponse::Span(span) =
            handle_request(ApiRequest::StartSpan(StartSpan::new("GET /", "api")), &daemon).await
        else {
            panic!("expected span");
        };

        let status = SetStatusRequest {
            span_id: span.span_id.clone(),
            code: SpanStatusCode::Error,
            message: Some("boom".into()),
        };
        assert!(matches!(
            handle_request(ApiRequest::SetStatus(status), &daemon).await,
            ApiResponse::Applied(true)
        ));

        let finish = SpanTagsRequest {
            span_id: span.span_id.clone(),
            tags: Default::default(),
        };
        assert!(matches!(
            handle_request(ApiRequest::FinishSpan(finish.clone()), &daemon).await,
            ApiResponse::Applied(true)
        ));
        assert!(matches!(
            handle_request(ApiRequest::FinishSpan(finish), &daemon).await,
            ApiResponse::Applied(false)
        ));

        let ApiResponse::Trace(trace) =
            handle_request(ApiRequest::Trace(span.trace_id.clone()), &daemon).await
        else {
            panic!("expected trace");
        };
        assert_eq!(trace.error_count, 1);
    }

    #[tokio::test]
    async fn metric_report_triggers_default_cpu_rule() {
        let daemon = daemon();
        let report = MetricReport {
            metric: "system.cpu.usage".into(),
            service: None,
            value: 93.0,
        };
        handle_request(ApiRequest::Metric(report), &daemon).await;
        handle_request(ApiRequest::Evaluate, &daemon).await;

        let ApiResponse::Alerts(active) = handle_request(ApiRequest::Alerts, &daemon).await else {
            panic!("expected alerts");
        };
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].rule_id, "high-cpu-usage");

        let ack = AlertLifecycleRequest {
            alert_id: active[0].id.clone(),
            by: Some("ops".into()),
        };
        assert!(matches!(
            handle_request(ApiRequest::Acknowledge(ack), &daemon).await,
            ApiResponse::Applied(true)
        ));
    }

    #[tokio::test]
    async fn sampling_override_is_clamped() {
        let daemon = daemon();
        let update = SamplingUpdate {
            rate: Some(1.7),
            adaptive: Some(false),
        };
        let ApiResponse::Sample(decision) =
            handle_request(ApiRequest::SetSampling(update), &daemon).await
        else {
            panic!("expected sample decision");
        };
        assert_eq!(decision.rate, 1.0);
        assert!(decision.sample);
    }

    #[tokio::test]
    async fn unknown_ids_are_errors() {
        let daemon = daemon();
        assert!(matches!(
            handle_request(ApiRequest::Trace("nope".into()), &daemon).await,
            ApiResponse::Error(_)
        ));
        assert!(matches!(
            handle_request(ApiRequest::Alert("nope".into()), &daemon).await,
            ApiResponse::Error(_)
        ));
        let ApiResponse::Status(status) = handle_request(ApiRequest::Status, &daemon).await else {
            panic!("expected status");
        };
        assert_eq!(status.rules, 4);
        assert_eq!(status.traces.total_traces, 0);
    }
}
