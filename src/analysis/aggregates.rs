// src/analysis/aggregates.rs
//
// Deterministic numeric sections of the weekly report. Everything here
// is pure: same observations in, same numbers out. Series are keyed
// upstream as `<source>.<series>.<metric>` and arrive deduplicated by
// timestamp in sorted maps.

use serde::Serialize;
use std::collections::BTreeMap;

const SECS_PER_DAY: i64 = 86_400;
/// Correlations are only reported for pairs sharing this many days.
const MIN_CORRELATION_OVERLAP: usize = 3;
/// Series shorter than this skip the extremes scan.
const MIN_EXTREME_POINTS: usize = 8;
/// At most this many extremes are kept per series.
const MAX_EXTREMES_PER_SERIES: usize = 3;

/// Timestamped values for one series, deduplicated by timestamp.
pub type SeriesPoints = BTreeMap<i64, f64>;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SeriesStats {
    pub count: usize,
    pub min: f64,
    pub max: f64,
    pub mean: f64,
    pub std_dev: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Correlation {
    pub a: String,
    pub b: String,
    pub r: f64,
    pub samples: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Extreme {
    pub series: String,
    pub ts: i64,
    pub value: f64,
    pub p95: f64,
}

pub(crate) fn round4(v: f64) -> f64 {
    (v * 10_000.0).round() / 10_000.0
}

/// Summary statistics over one series. Population standard deviation.
pub fn summarize(points: &SeriesPoints) -> Option<SeriesStats> {
    if points.is_empty() {
        return None;
    }
    let n = points.len() as f64;
    let mut min = f64::INFINITY;
    let mut max = f64::NEG_INFINITY;
    let mut sum = 0.0;
    for &v in points.values() {
        min = min.min(v);
        max = max.max(v);
        sum += v;
    }
    let mean = sum / n;
    let var = points.values().map(|&v| (v - mean).powi(2)).sum::<f64>() / n;
    Some(SeriesStats {
        count: points.len(),
        min,
        max,
        mean: round4(mean),
        std_dev: round4(var.sqrt()),
    })
}

/// Collapse a series to one mean value per UTC day.
pub fn daily_means(points: &SeriesPoints) -> SeriesPoints {
    let mut sums: BTreeMap<i64, (f64, u32)> = BTreeMap::new();
    for (&ts, &v) in points {
        let day = ts - ts.rem_euclid(SECS_PER_DAY);
        let e = sums.entry(day).or_insert((0.0, 0));
        e.0 += v;
        e.1 += 1;
    }
    sums.into_iter()
        .map(|(day, (sum, n))| (day, sum / n as f64))
        .collect()
}

/// Pearson correlation coefficient. `None` for short or constant input.
pub fn pearson(a: &[f64], b: &[f64]) -> Option<f64> {
    if a.len() != b.len() || a.len() < 2 {
        return None;
    }
    let n = a.len() as f64;
    let mean_a = a.iter().sum::<f64>() / n;
    let mean_b = b.iter().sum::<f64>() / n;
    let mut cov = 0.0;
    let mut var_a = 0.0;
    let mut var_b = 0.0;
    for (&x, &y) in a.iter().zip(b) {
        cov += (x - mean_a) * (y - mean_b);
        var_a += (x - mean_a).powi(2);
        var_b += (y - mean_b).powi(2);
    }
    if var_a == 0.0 || var_b == 0.0 {
        return None;
    }
    Some(cov / (var_a.sqrt() * var_b.sqrt()))
}

/// Cross-series correlation matrix over aligned daily means. Pairs are
/// emitted in key order, upper triangle only.
pub fn correlations(daily: &BTreeMap<String, SeriesPoints>) -> Vec<Correlation> {
    let keys: Vec<&String> = daily.keys().collect();
    let mut out = Vec::new();
    for (i, a) in keys.iter().enumerate() {
        for b in keys.iter().skip(i + 1) {
            let sa = &daily[*a];
            let sb = &daily[*b];
            let mut xs = Vec::new();
            let mut ys = Vec::new();
            for (day, va) in sa {
                if let Some(vb) = sb.get(day) {
                    xs.push(*va);
                    ys.push(*vb);
                }
            }
            if xs.len() < MIN_CORRELATION_OVERLAP {
                continue;
            }
            if let Some(r) = pearson(&xs, &ys) {
                out.push(Correlation {
                    a: (*a).clone(),
                    b: (*b).clone(),
                    r: round4(r),
                    samples: xs.len(),
                });
            }
        }
    }
    out
}

/// Observations strictly above their series' 95th percentile
/// (nearest-rank). Flat series produce no extremes.
pub fn extremes(series: &BTreeMap<String, SeriesPoints>) -> Vec<Extreme> {
    let mut out = Vec::new();
    for (key, points) in series {
        if points.len() < MIN_EXTREME_POINTS {
            continue;
        }
        let mut values: Vec<f64> = points.values().copied().collect();
        values.sort_by(|x, y| x.total_cmp(y));
        let rank = ((values.len() as f64) * 0.95).ceil() as usize;
        let p95 = values[rank.saturating_sub(1).min(values.len() - 1)];

        let mut hits: Vec<Extreme> = points
            .iter()
            .filter(|(_, &v)| v > p95)
            .map(|(&ts, &v)| Extreme {
                series: key.clone(),
                ts,
                value: v,
                p95,
            })
            .collect();
        hits.sort_by(|x, y| y.value.total_cmp(&x.value).then(x.ts.cmp(&y.ts)));
        hits.truncate(MAX_EXTREMES_PER_SERIES);
        hits.sort_by_key(|e| e.ts);
        out.extend(hits);
    }
    out
}
