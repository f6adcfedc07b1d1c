use serde_json::Value;

use crate::PerformanceSnapshot;

/// Standard Web-Vitals thresholds: (good ≤, needs-improvement ≤).
fn vital_thresholds(metric: &str) -> Option<(f64, f64)> {
    match metric {
        "lcp" => Some((2_500.0, 4_000.0)),
        "cls" => Some((0.1, 0.25)),
        "fcp" => Some((1_800.0, 3_000.0)),
        "ttfb" => Some((800.0, 1_800.0)),
        _ => None,
    }
}

/// Rating for a metric's "after" value. Web-Vitals metrics use the standard
/// thresholds; the rest have none, so they are rated by relative movement.
pub(crate) fn rate_metric(metric: &str, before: f64, after: f64) -> &'static str {
    if let Some((good, needs_improvement)) = vital_thresholds(metric) {
        return if after <= good {
            "good"
        } else if after <= needs_improvement {
            "needs_improvement"
        } else {
            "poor"
        };
    }
    if after <= before {
        "good"
    } else if before > 0.0 && (after - before) / before <= 0.10 {
        "needs_improvement"
    } else {
        "poor"
    }
}

fn metric_pairs(snap: &PerformanceSnapshot) -> Vec<(&'static str, Option<f64>)> {
    vec![
        ("ttfb", Some(snap.timing.ttfb)),
        ("fcp", snap.timing.fcp),
        ("lcp", snap.timing.lcp),
        ("cls", snap.cls),
        ("dcl", Some(snap.timing.dcl)),
        ("load", Some(snap.timing.load)),
        ("transfer_size", Some(snap.network.transfer_size as f64)),
        ("request_count", Some(snap.network.request_count as f64)),
    ]
}

/// Relative change below this is noise, not a verdict signal.
const VERDICT_EPSILON: f64 = 0.05;

/// Computes the before/after diff attached to navigation results. The
/// caller guarantees `after` is strictly newer than `before`.
pub(crate) fn compute_perf_diff(before: &PerformanceSnapshot, after: &PerformanceSnapshot) -> Value {
    let before_metrics = metric_pairs(before);
    let after_metrics = metric_pairs(after);

    let mut metrics = serde_json::Map::new();
    let mut improved = 0usize;
    let mut regressed = 0usize;
    let mut summary_parts: Vec<String> = Vec::new();

    for ((name, before_value), (_, after_value)) in before_metrics.iter().zip(after_metrics.iter()) {
        let (Some(b), Some(a)) = (before_value, after_value) else {
            continue;
        };
        let delta = a - b;
        metrics.insert(
            (*name).to_string(),
            serde_json::json!({
                "before": b,
                "after": a,
                "delta": delta,
                "rating": rate_metric(name, *b, *a),
            }),
        );
        let scale = b.abs().max(1.0);
        if delta / scale <= -VERDICT_EPSILON {
            improved += 1;
            summary_parts.push(format!("{name} {delta:+.0}"));
        } else if delta / scale >= VERDICT_EPSILON {
            regressed += 1;
            summary_parts.push(format!("{name} {delta:+.0}"));
        }
    }

    let verdict = if improved > regressed {
        "improved"
    } else if regressed > improved {
        "regressed"
    } else {
        "unchanged"
    };
    let summary = if summary_parts.is_empty() {
        "no significant metric movement".to_string()
    } else {
        format!("{verdict}: {}", summary_parts.join(", "))
    };

    serde_json::json!({
        "verdict": verdict,
        "summary": summary,
        "metrics": Value::Object(metrics),
    })
}

// ── Tests ───────────────────────────────────────────────────────────────
