//! Benchmark output parsing
//!
//! Turning raw tool output into metrics is delegated to a
//! [`BenchmarkParser`]. [`GenericParser`] handles the common shapes: JSON
//! documents (fio, iperf3 `-J`) and `label: value` text reports (sysbench).

use kvm_bench_common::{Metrics, OutputFormat};
use serde_json::Value;

use crate::error::ParseError;

/// Parser collaborator: raw output to named numeric metrics
pub trait BenchmarkParser: Send + Sync {
    fn parse(&self, benchmark: &str, format: OutputFormat, raw: &str) -> Result<Metrics, ParseError>;
}

/// Format-driven fallback parser
#[derive(Debug, Clone, Copy, Default)]
pub struct GenericParser;

impl BenchmarkParser for GenericParser {
    fn parse(&self, benchmark: &str, format: OutputFormat, raw: &str) -> Result<Metrics, ParseError> {
        let metrics = match format {
            OutputFormat::Json => {
                let value: Value = serde_json::from_str(raw.trim())
                    .map_err(|e| ParseError::new(benchmark, format!("invalid JSON: {e}")))?;
                let mut metrics = Metrics::new();
                flatten_json("", &value, &mut metrics);
                metrics
            }
            OutputFormat::Text => parse_text(raw),
        };

        if metrics.is_empty() {
            return Err(ParseError::new(benchmark, "no numeric metrics found in output"));
        }
        Ok(metrics)
    }
}

/// Collect every numeric leaf under dotted keys (`jobs.0.read.iops`)
fn flatten_json(prefix: &str, value: &Value, out: &mut Metrics) {
    let key = |segment: &str| {
        if prefix.is_empty() {
            segment.to_string()
        } else {
            format!("{prefix}.{segment}")
        }
    };

    match value {
        Value::Number(n) => {
            if let Some(f) = n.as_f64() {
                out.insert(prefix.to_string(), f);
            }
        }
        Value::Object(map) => {
            for (name, child) in map {
                flatten_json(&key(name), child, out);
            }
        }
        Value::Array(items) => {
            for (i, child) in items.iter().enumerate() {
                flatten_json(&key(&i.to_string()), child, out);
            }
        }
        Value::Null | Value::Bool(_) | Value::String(_) => {}
    }
}

/// `label: 123.4unit` lines to snake_case metrics; first occurrence wins
fn parse_text(raw: &str) -> Metrics {
    let mut metrics = Metrics::new();
    for line in raw.lines() {
        let Some((label, rest)) = line.split_once(':') else {
            continue;
        };
        let Some(value) = rest.split_whitespace().next().and_then(leading_number) else {
            continue;
        };
        let name = snake_case(label);
        if !name.is_empty() {
            metrics.entry(name).or_insert(value);
        }
    }
    metrics
}

/// Parse the numeric prefix of a token such as `10.0012s` or `4096.00MiB`
fn leading_number(token: &str) -> Option<f64> {
    let end = token
        .char_indices()
        .find(|(_, c)| !(c.is_ascii_digit() || matches!(c, '.' | '-' | '+' | 'e' | 'E')))
        .map_or(token.len(), |(i, _)| i);
    token[..end].parse().ok().filter(|v: &f64| v.is_finite())
}

fn snake_case(label: &str) -> String {
    let mut out = String::with_capacity(label.len());
    for c in label.trim().chars() {
        if c.is_ascii_alphanumeric() {
            out.push(c.to_ascii_lowercase());
        } else if !out.ends_with('_') {
            out.push('_');
        }
    }
    out.trim_matches('_').to_string()
}
