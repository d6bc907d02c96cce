mod client;
mod output;
mod protocol;
mod query_server;
mod telemetry;

use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use vigil_alerts::{
    AlertEngine, AlertEngineConfig, EvaluatorRegistry, JsonFileStore, SignalBuffer,
    TransportRegistry,
};
use vigil_core::config::Config;
use vigil_core::filter::TagFilter;
use vigil_core::query::{ExportFormat, TraceQuery};
use vigil_core::time::{parse_duration_str, parse_time_or_relative};
use vigil_store::{TraceStore, TraceStoreConfig};

use crate::client::QueryClient;
use crate::output::{
    print_alert_human, print_alert_stats_human, print_alerts_human, print_applied_human,
    print_evaluations_human, print_graph_human, print_rules_human, print_sample_human,
    print_services_human, print_span_human, print_status_human, print_timeline_human,
    print_trace_human, print_traces_human,
};
use crate::protocol::{
    AlertLifecycleRequest, ApiRequest, ApiResponse, ExportRequest, RuleToggleRequest,
    SamplingUpdate, SuppressRequest,
};
use crate::query_server::Daemon;
use crate::telemetry::init_tracing;

#[derive(Parser, Debug)]
#[command(name = "vigil")]
#[command(about = "Local trace aggregation and alerting daemon")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    #[arg(long, global = true)]
    json: bool,

    #[arg(long, global = true)]
    uds: Option<PathBuf>,

    #[arg(long, global = true)]
    addr: Option<String>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    #[command(about = "Run the trace store, alert engine and query API")]
    Run {
        #[arg(long)]
        state_dir: Option<PathBuf>,
        #[arg(long)]
        query_tcp_addr: Option<String>,
        #[arg(long)]
        query_uds_path: Option<PathBuf>,
    },
    #[command(about = "Search traces")]
    Traces {
        #[arg(long)]
        service: Option<String>,
        #[arg(long)]
        operation: Option<String>,
        #[arg(long = "tag")]
        tags: Vec<String>,
        #[arg(long)]
        min_duration: Option<String>,
        #[arg(long)]
        max_duration: Option<String>,
        #[arg(long)]
        since: Option<String>,
        #[arg(long)]
        until: Option<String>,
        #[arg(long)]
        errors: bool,
        #[arg(long, default_value_t = 20)]
        limit: usize,
        #[arg(long, default_value_t = 0)]
        offset: usize,
    },
    #[command(about = "Show one trace as a span tree")]
    Trace { trace_id: String },
    #[command(about = "Show a trace's spans in start order with nesting depth")]
    Timeline { trace_id: String },
    #[command(about = "Show the service dependency graph")]
    Graph,
    #[command(about = "Show per-service latency and error metrics")]
    Services,
    #[command(about = "Export traces as json, jaeger or zipkin")]
    Export {
        #[arg(long, default_value = "json")]
        format: String,
        #[arg(long)]
        service: Option<String>,
        #[arg(long)]
        since: Option<String>,
        #[arg(long, default_value_t = 100)]
        limit: usize,
    },
    #[command(about = "Run one alert evaluation pass now")]
    Evaluate,
    #[command(about = "List active alerts, or show one alert")]
    Alerts {
        alert_id: Option<String>,
        #[arg(long)]
        stats: bool,
    },
    #[command(about = "Acknowledge an active alert")]
    Ack {
        alert_id: String,
        #[arg(long)]
        by: Option<String>,
    },
    #[command(about = "Resolve an alert")]
    Resolve {
        alert_id: String,
        #[arg(long)]
        by: Option<String>,
    },
    #[command(about = "Suppress an active alert for a number of minutes")]
    Suppress {
        alert_id: String,
        #[arg(long, default_value_t = 60)]
        minutes: u64,
    },
    #[command(about = "List alert rules, or enable/disable one")]
    Rules {
        #[arg(long, conflicts_with = "disable")]
        enable: Option<String>,
        #[arg(long)]
        disable: Option<String>,
    },
    #[command(about = "Report the sampling decision, optionally overriding the rate")]
    Sample {
        #[arg(long)]
        rate: Option<f64>,
        #[arg(long)]
        adaptive: Option<bool>,
    },
    #[command(about = "Show daemon status")]
    Status,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing();

    let request = match cli.command {
        Commands::Run {
            state_dir,
            query_tcp_addr,
            query_uds_path,
        } => return run_server(state_dir, query_tcp_addr, query_uds_path).await,
        Commands::Traces {
            service,
            operation,
            tags,
            min_duration,
            max_duration,
            since,
            until,
            errors,
            limit,
            offset,
        } => ApiRequest::Traces(TraceQuery {
            trace_id: None,
            service,
            operation,
            tags: tags
                .iter()
                .map(|t| TagFilter::parse(t))
                .collect::<vigil_core::Result<Vec<_>>>()?,
            min_duration_ms: min_duration.as_deref().map(parse_duration_ms).transpose()?,
            max_duration_ms: max_duration.as_deref().map(parse_duration_ms).transpose()?,
            start_time: since.as_deref().map(parse_time_or_relative).transpose()?,
            end_time: until.as_deref().map(parse_time_or_relative).transpose()?,
            has_errors: errors.then_some(true),
            limit,
            offset,
        }),
        Commands::Trace { trace_id } => ApiRequest::Trace(trace_id),
        Commands::Timeline { trace_id } => ApiRequest::Timeline(trace_id),
        Commands::Graph => ApiRequest::Graph,
        Commands::Services => ApiRequest::Services,
        Commands::Export {
            format,
            service,
            since,
            limit,
        } => ApiRequest::Export(ExportRequest {
            query: TraceQuery {
                service,
                start_time: since.as_deref().map(parse_time_or_relative).transpose()?,
                limit,
                ..TraceQuery::default()
            },
            format: ExportFormat::from_str(&format)?,
        }),
        Commands::Evaluate => ApiRequest::Evaluate,
        Commands::Alerts { alert_id, stats } => match (alert_id, stats) {
            (_, true) => ApiRequest::AlertStats,
            (Some(id), false) => ApiRequest::Alert(id),
            (None, false) => ApiRequest::Alerts,
        },
        Commands::Ack { alert_id, by } => {
            ApiRequest::Acknowledge(AlertLifecycleRequest { alert_id, by })
        }
        Commands::Resolve { alert_id, by } => {
            ApiRequest::Resolve(AlertLifecycleRequest { alert_id, by })
        }
        Commands::Suppress { alert_id, minutes } => {
            ApiRequest::Suppress(SuppressRequest { alert_id, minutes })
        }
        Commands::Rules { enable, disable } => match (enable, disable) {
            (Some(rule_id), _) => ApiRequest::SetRuleEnabled(RuleToggleRequest {
                rule_id,
                enabled: true,
            }),
            (None, Some(rule_id)) => ApiRequest::SetRuleEnabled(RuleToggleRequest {
                rule_id,
                enabled: false,
            }),
            (None, None) => ApiRequest::Rules,
        },
        Commands::Sample { rate, adaptive } => {
            if rate.is_none() && adaptive.is_none() {
                ApiRequest::ShouldSample
            } else {
                ApiRequest::SetSampling(SamplingUpdate { rate, adaptive })
            }
        }
        Commands::Status => ApiRequest::Status,
    };

    let mut client = QueryClient::connect(cli.uds, cli.addr).await?;
    let response = client.request(request).await?;
    let failed = matches!(response, ApiResponse::Error(_));
    print_response(response, cli.json)?;
    if failed {
        std::process::exit(1);
    }
    Ok(())
}

async fn run_server(
    state_dir: Option<PathBuf>,
    query_tcp_addr: Option<String>,
    query_uds_path: Option<PathBuf>,
) -> anyhow::Result<()> {
    let mut cfg = Config::load().context("load config")?;
    if let Some(v) = state_dir {
        cfg.state_dir = v;
    }
    if let Some(v) = query_tcp_addr {
        cfg.query_tcp_addr = v;
    }
    if let Some(v) = query_uds_path {
        cfg.uds_path = v;
    }

    let traces = TraceStore::new(TraceStoreConfig::from(&cfg));
    let signals = Arc::new(SignalBuffer::new());
    let evaluators =
        EvaluatorRegistry::with_sources(signals.clone(), signals.clone(), signals.clone());
    let transports =
        TransportRegistry::with_defaults(cfg.webhook_timeout).context("build transports")?;
    let alerts = AlertEngine::new(AlertEngineConfig::from(&cfg), evaluators, transports)
        .with_state_store(Arc::new(JsonFileStore::new(&cfg.state_dir)))
        .with_defaults();
    alerts.load_state().await;

    eprintln!("vigil run");
    eprintln!("  state: {}", cfg.state_dir.display());
    eprintln!("  query uds: {}", cfg.uds_path.display());
    eprintln!("  query tcp: {}", cfg.query_tcp_addr);
    eprintln!("  rules: {}", alerts.rules().len());

    let engine = alerts.start();

    let query_task = tokio::spawn(query_server::run_query_server(
        Daemon {
            traces: traces.clone(),
            alerts: alerts.clone(),
            signals,
            state_dir: cfg.state_dir.clone(),
        },
        cfg.uds_path.clone(),
        cfg.query_tcp_addr
            .parse()
            .with_context(|| format!("parse query tcp addr {}", cfg.query_tcp_addr))?,
    ));

    let maintenance_task = tokio::spawn({
        let traces = traces.clone();
        let period = cfg.maintenance_interval.max(Duration::from_secs(1));
        async move {
            let mut interval = tokio::time::interval(period);
            interval.tick().await;
            loop {
                interval.tick().await;
                let report = traces.run_maintenance();
                tracing::debug!(?report, "trace maintenance finished");
            }
        }
    });

    let result = tokio::select! {
        res = query_task => res.context("query server task").and_then(|r| r),
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("received ctrl-c, shutting down");
            Ok(())
        }
    };

    maintenance_task.abort();
    engine.shutdown().await;
    result
}

fn parse_duration_ms(input: &str) -> anyhow::Result<i64> {
    let d = parse_duration_str(input)?;
    i64::try_from(d.as_millis()).context("duration out of range")
}

fn print_response(response: ApiResponse, json: bool) -> anyhow::Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(&response)?);
        return Ok(());
    }

    match response {
        ApiResponse::Span(v) => print_span_human(&v),
        ApiResponse::Applied(v) => print_applied_human(v),
        ApiResponse::Sample(v) => print_sample_human(&v),
        ApiResponse::Trace(v) => print_trace_human(&v),
        ApiResponse::Traces(v) => print_traces_human(&v),
        ApiResponse::Timeline(v) => print_timeline_human(&v),
        ApiResponse::Graph(v) => print_graph_human(&v),
        ApiResponse::Services(v) => print_services_human(&v),
        ApiResponse::Export(v) => println!("{}", serde_json::to_string_pretty(&v)?),
        ApiResponse::Evaluations(v) => print_evaluations_human(&v),
        ApiResponse::Alerts(v) => print_alerts_human(&v),
        ApiResponse::Alert(v) => print_alert_human(&v),
        ApiResponse::Rules(v) => print_rules_human(&v),
        ApiResponse::AlertStats(v) => print_alert_stats_human(&v),
        ApiResponse::Status(v) => print_status_human(&v),
        ApiResponse::Error(e) => eprintln!("error: {e}"),
    }
    Ok(())
}
