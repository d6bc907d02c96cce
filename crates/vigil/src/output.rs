use std::collections::HashMap;

use chrono::{DateTime, SecondsFormat, Utc};
use owo_colors::OwoColorize;
use vigil_alerts::{EvaluationOutcome, RuleEvaluation};
use vigil_core::model::alert::{Alert, AlertStatus, Severity};
use vigil_core::model::rule::AlertRule;
use vigil_core::model::span::{Span, SpanStatusCode};
use vigil_core::model::trace::Trace;
use vigil_core::query::{
    AlertStatistics, DependencyGraph, ServiceMetrics, StatusResponse, TimelineEntry,
    TraceSearchResponse,
};

use crate::protocol::SampleDecision;

fn ts(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn severity_label(severity: Severity) -> String {
    match severity {
        Severity::Info => "INFO".blue().to_string(),
        Severity::Warning => "WARNING".yellow().to_string(),
        Severity::Critical => "CRITICAL".red().to_string(),
    }
}

fn status_label(status: AlertStatus) -> String {
    match status {
        AlertStatus::Active => "active".red().to_string(),
        AlertStatus::Acknowledged => "acknowledged".yellow().to_string(),
        AlertStatus::Resolved => "resolved".green().to_string(),
        AlertStatus::Suppressed => "suppressed".dimmed().to_string(),
    }
}

fn span_status_label(code: SpanStatusCode) -> String {
    match code {
        SpanStatusCode::Ok => code.as_str().to_string(),
        _ => code.as_str().red().to_string(),
    }
}

pub fn print_applied_human(applied: bool) {
    if applied {
        println!("ok");
    } else {
        println!("{}", "no change".yellow());
    }
}

pub fn print_sample_human(v: &SampleDecision) {
    println!("sample={} rate={:.3}", v.sample, v.rate);
}

pub fn print_span_human(span: &Span) {
    println!(
        "SPAN {} trace={} service={} operation=\"{}\" started={}",
        span.span_id,
        span.trace_id,
        span.service_name,
        span.operation_name,
        ts(span.start_time)
    );
}

pub fn print_trace_human(trace: &Trace) {
    println!(
        "TRACE {} duration={}ms spans={} errors={} status={} complete={}",
        trace.trace_id,
        trace.duration_ms,
        trace.operations_count,
        trace.error_count,
        trace.status.as_str(),
        trace.complete
    );
    println!("services={}", trace.services.join(","));
    print_span_tree(&trace.spans);
}

fn print_span_tree(spans: &[Span]) {
    let known: Vec<&str> = spans.iter().map(|s| s.span_id.as_str()).collect();
    let mut children: HashMap<Option<&str>, Vec<&Span>> = HashMap::new();
    for span in spans {
        let parent = span
            .parent_span_id
            .as_deref()
            .filter(|p| known.contains(p));
        children.entry(parent).or_default().push(span);
    }
    for kids in children.values_mut() {
        kids.sort_by_key(|s| s.start_time);
    }
    if let Some(roots) = children.get(&None) {
        for root in roots {
            print_node(root, &children, 0);
        }
    }
}

fn print_node(span: &Span, children: &HashMap<Option<&str>, Vec<&Span>>, depth: usize) {
    let indent = "  ".repeat(depth);
    let duration = span
        .duration_ms
        .map(|d| format!("{d}ms"))
        .unwrap_or_else(|| "open".to_string());
    println!(
        "{}{} {} ({}) {}",
        indent,
        span.service_name,
        span.operation_name,
        duration,
        span_status_label(span.status.code)
    );

    if let Some(kids) = children.get(&Some(span.span_id.as_str())) {
        for child in kids {
            print_node(child, children, depth + 1);
        }
    }
}

pub fn print_traces_human(v: &TraceSearchResponse) {
    for trace in &v.traces {
        let root = trace
            .root_span()
            .map(|s| s.operation_name.as_str())
            .unwrap_or("-");
        println!(
            "trace={} start={} duration={}ms spans={} errors={} status={} root=\"{}\"",
            trace.trace_id,
            ts(trace.start_time),
            trace.duration_ms,
            trace.operations_count,
            trace.error_count,
            trace.status.as_str(),
            root
        );
    }
    println!("-- {} traces ({} matched) --", v.traces.len(), v.total);
}

pub fn print_timeline_human(entries: &[TimelineEntry]) {
    for e in entries {
        println!(
            "{:>8}ms {:>6}ms {}{} {} {}",
            e.relative_start_ms,
            e.duration_ms,
            "  ".repeat(e.level),
            e.service_name,
            e.operation_name,
            span_status_label(e.status)
        );
    }
    println!("-- {} spans --", entries.len());
}

pub fn print_graph_human(graph: &DependencyGraph) {
    for node in &graph.nodes {
        println!("node={} type={}", node.id, node.kind);
    }
    for edge in &graph.edges {
        println!(
            "{} -> {} calls={} errors={}",
            edge.from, edge.to, edge.weight, edge.errors
        );
    }
    println!(
        "-- {} services, {} edges --",
        graph.nodes.len(),
        graph.edges.len()
    );
}

pub fn print_services_human(services: &[ServiceMetrics]) {
    for m in services {
        println!(
            "service={} traces={} avg={:.1}ms p50={}ms p90={}ms p95={}ms p99={}ms error_rate={:.3}",
            m.service,
            m.traces_observed,
            m.average_duration_ms,
            m.p50_duration_ms,
            m.p90_duration_ms,
            m.p95_duration_ms,
            m.p99_duration_ms,
            m.error_rate
        );
        if let Some(slowest) = m.slowest_traces.first() {
            println!("  slowest trace={} {}ms", slowest.trace_id, slowest.duration_ms);
        }
    }
    println!("-- {} services --", services.len());
}

pub fn print_evaluations_human(evaluations: &[RuleEvaluation]) {
    for e in evaluations {
        let outcome = match &e.outcome {
            EvaluationOutcome::CoolingDown => "cooling_down".dimmed().to_string(),
            EvaluationOutcome::NotMet { .. } => "not_met".to_string(),
            EvaluationOutcome::Triggered { alert_id: Some(id) } => {
                format!("{} alert={id}", "triggered".red())
            }
            EvaluationOutcome::Triggered { alert_id: None } => "triggered (deduplicated)".to_string(),
        };
        println!("rule={} {}", e.rule_id, outcome);
    }
}

pub fn print_alerts_human(alerts: &[Alert]) {
    for alert in alerts {
        let service = alert.source.service.as_deref().unwrap_or("-");
        println!(
            "{} {} {} rule={} service={} triggered={} | {}",
            alert.id,
            severity_label(alert.severity),
            status_label(alert.status),
            alert.rule_id,
            service,
            ts(alert.triggered_at),
            alert.title
        );
    }
    println!("-- {} alerts --", alerts.len());
}

pub fn print_alert_human(alert: &Alert) {
    println!(
        "ALERT {} {} {} rule={}",
        alert.id,
        severity_label(alert.severity),
        status_label(alert.status),
        alert.rule_id
    );
    println!("title={}", alert.title);
    println!("description={}", alert.description);
    println!("triggered={}", ts(alert.triggered_at));
    if let (Some(at), Some(by)) = (alert.acknowledged_at, &alert.acknowledged_by) {
        println!("acknowledged={} by={by}", ts(at));
    }
    if let (Some(at), Some(by)) = (alert.resolved_at, &alert.resolved_by) {
        println!("resolved={} by={by}", ts(at));
    }
    if let Some(until) = alert.suppressed_until {
        println!("suppressed_until={}", ts(until));
    }
    for (key, value) in &alert.metadata {
        println!("meta.{key}={value}");
    }
    for n in &alert.notifications_sent {
        let result = if n.success {
            "sent".green().to_string()
        } else {
            format!(
                "{} ({})",
                "failed".red(),
                n.error.as_deref().unwrap_or("unknown error")
            )
        };
        println!(
            "notification {} {} to={} retries={} {}",
            ts(n.sent_at),
            n.kind,
            n.recipient,
            n.retry_count,
            result
        );
    }
}

pub fn print_rules_human(rules: &[AlertRule]) {
    for rule in rules {
        let enabled = if rule.enabled {
            "enabled".green().to_string()
        } else {
            "disabled".dimmed().to_string()
        };
        let conditions: Vec<&str> = rule.conditions.iter().map(|c| c.kind.as_str()).collect();
        println!(
            "{} {} {} cooldown={}m conditions={} actions={} escalation={}",
            rule.id,
            severity_label(rule.severity),
            enabled,
            rule.cooldown_minutes,
            conditions.join("+"),
            rule.actions.len(),
            rule.escalation_policy.as_deref().unwrap_or("-")
        );
    }
    println!("-- {} rules --", rules.len());
}

pub fn print_alert_stats_human(v: &AlertStatistics) {
    println!(
        "total={} active={} acknowledged={} resolved={} suppressed={}",
        v.total, v.active, v.acknowledged, v.resolved, v.suppressed
    );
    println!("by_severity={:?}", v.by_severity);
    println!("by_service={:?}", v.by_service);
    println!("average_resolution_ms={:.0}", v.average_resolution_ms);
}

pub fn print_status_human(v: &StatusResponse) {
    println!("state_dir={}", v.state_dir);
    println!(
        "traces={} spans={} open_spans={} services={} error_rate={:.3} sampling_rate={:.3}",
        v.traces.total_traces,
        v.traces.total_spans,
        v.traces.open_spans,
        v.traces.services,
        v.traces.error_rate,
        v.traces.sampling_rate
    );
    println!(
        "rules={} alerts_active={} alerts_total={} pending_timers={}",
        v.rules, v.alerts.active, v.alerts.total, v.pending_timers
    );
}
