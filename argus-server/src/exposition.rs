//! Text exposition of the statistics store for scrapers

use crate::quantile::Summary;
use crate::stats::StatsStore;
use argus_common::config::MetricsConfig;
use std::collections::BTreeMap;
use std::fmt::{self, Write};

/// Render every metric family, recomputing quantiles from fresh snapshots
pub fn render(stats: &StatsStore, config: &MetricsConfig) -> String {
    let mut out = String::new();
    // Writing into a String cannot fail
    let _ = write_families(&mut out, stats, config);
    out
}

fn write_families(out: &mut String, stats: &StatsStore, config: &MetricsConfig) -> fmt::Result {
    let ns = &config.namespace;
    let labels = &config.labels;

    write_counter(out, ns, "requests_total", "Total number of requests", &stats.request_counts(), labels)?;
    write_counter(out, ns, "requests_success", "Total number of successful requests", &stats.success_counts(), labels)?;
    write_counter(out, ns, "requests_failed", "Total number of failed requests", &stats.failure_counts(), labels)?;
    write_counter(out, ns, "tokens_generated_total", "Total number of tokens generated", &stats.token_counts(), labels)?;
    write_counter(out, ns, "prompt_tokens_total", "Total number of prompt tokens", &stats.prompt_token_counts(), labels)?;

    write_gauge(
        out,
        ns,
        "response_duration_seconds",
        "Response duration in seconds",
        &stats.duration_stats(),
        RESPONSE_QUANTILES,
        labels,
    )?;
    write_gauge(
        out,
        ns,
        "model_load_duration_seconds",
        "Model load duration in seconds",
        &stats.load_duration_stats(),
        LOAD_QUANTILES,
        labels,
    )?;

    Ok(())
}

type Quantile = (&'static str, fn(&Summary) -> f64);

const RESPONSE_QUANTILES: &[Quantile] = &[
    ("0.5", |s: &Summary| s.p50),
    ("0.95", |s: &Summary| s.p95),
    ("0.99", |s: &Summary| s.p99),
    ("avg", |s: &Summary| s.avg),
];

const LOAD_QUANTILES: &[Quantile] = &[
    ("0.5", |s: &Summary| s.p50),
    ("0.95", |s: &Summary| s.p95),
    ("avg", |s: &Summary| s.avg),
];

fn write_counter(
    out: &mut String,
    ns: &str,
    name: &str,
    help: &str,
    values: &BTreeMap<String, u64>,
    labels: &BTreeMap<String, String>,
) -> fmt::Result {
    writeln!(out, "# HELP {}_{} {}", ns, name, help)?;
    writeln!(out, "# TYPE {}_{} counter", ns, name)?;
    for (model, value) in values {
        writeln!(out, "{}_{}{{{}}} {}", ns, name, label_set(model, None, labels), value)?;
    }
    Ok(())
}

fn write_gauge(
    out: &mut String,
    ns: &str,
    name: &str,
    help: &str,
    summaries: &BTreeMap<String, Summary>,
    quantiles: &[Quantile],
    labels: &BTreeMap<String, String>,
) -> fmt::Result {
    writeln!(out, "# HELP {}_{} {}", ns, name, help)?;
    writeln!(out, "# TYPE {}_{} gauge", ns, name)?;
    for (model, summary) in summaries {
        for (quantile, value) in quantiles {
            writeln!(
                out,
                "{}_{}{{{}}} {:.6}",
                ns,
                name,
                label_set(model, Some(*quantile), labels),
                value(summary)
            )?;
        }
    }
    Ok(())
}

/// `model="..."[,quantile="..."][,extra="..."]`
fn label_set(model: &str, quantile: Option<&str>, extra: &BTreeMap<String, String>) -> String {
    let mut set = format!("model=\"{}\"", escape_label(model));
    if let Some(q) = quantile {
        set.push_str(&format!(",quantile=\"{}\"", q));
    }
    for (key, value) in extra {
        set.push_str(&format!(",{}=\"{}\"", key, escape_label(value)));
    }
    set
}

fn escape_label(value: &str) -> String {
    value
        .replace('\\', "\\\\")
        .replace('"', "\\\"")
        .replace('\n', "\\n")
}
