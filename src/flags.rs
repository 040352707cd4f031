use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Duration, NaiveDate, Utc};
use tracing::{debug, info};

use crate::config::FlagConfig;
use crate::models::{AthleteMetricSeries, Flag, FlagType, Measurement, Side, TeamNormSet};

/// Runs every rule over `measurements` as of `now` and returns the union of
/// their flags. Output order depends only on the input values.
pub fn run_flags(measurements: &[Measurement], now: DateTime<Utc>, config: &FlagConfig) -> Vec<Flag> {
    let rows: Vec<&Measurement> = measurements
        .iter()
        .filter(|m| config.is_selected(&m.metric))
        .filter(|m| !m.athlete_id.trim().is_empty() && !m.team.trim().is_empty())
        .filter(|m| m.value.is_finite())
        .collect();

    let series = build_series(&rows);
    let mut flags = Vec::new();
    flags.extend(flag_inactivity(&rows, now, config));
    flags.extend(flag_decline(&series, config));
    flags.extend(flag_team_norm(&series, config));
    flags.extend(flag_asymmetry(&rows, config));

    flags.sort_by(|a, b| {
        (&a.athlete_id, a.flag_type, &a.metric, a.detected_at)
            .cmp(&(&b.athlete_id, b.flag_type, &b.metric, b.detected_at))
    });

    info!(
        rows = rows.len(),
        series = series.len(),
        flags = flags.len(),
        "flag run complete"
    );
    flags
}

/// Midnight UTC of `as_of`, or the current time.
pub fn reference_time(as_of: Option<NaiveDate>) -> DateTime<Utc> {
    as_of
        .and_then(|date| date.and_hms_opt(0, 0, 0))
        .map(|naive| naive.and_utc())
        .unwrap_or_else(Utc::now)
}

/// A span too large for chrono never elapses.
pub fn is_inactive(last: DateTime<Utc>, now: DateTime<Utc>, inactivity_days: i64) -> bool {
    Duration::try_days(inactivity_days).is_some_and(|span| now - last > span)
}

/// Fractional drop from `baseline` to `recent`. Positive means the athlete got
/// worse, whichever direction "worse" is for the metric.
pub fn decline_ratio(baseline: f64, recent: f64, lower_is_better: bool) -> Option<f64> {
    if baseline == 0.0 {
        return None;
    }
    let change = if lower_is_better {
        recent - baseline
    } else {
        baseline - recent
    };
    Some(change / baseline.abs())
}

/// Distance from the team mean in standard deviations.
pub fn sd_distance(value: f64, mean: f64, std_dev: f64) -> Option<f64> {
    if !(std_dev > 0.0) {
        return None;
    }
    Some((value - mean).abs() / std_dev)
}

pub fn asymmetry_ratio(left: f64, right: f64) -> Option<f64> {
    let max = left.max(right);
    if !(max > 0.0) || !left.is_finite() || !right.is_finite() {
        return None;
    }
    Some((left - right).abs() / max)
}

fn series_metric(m: &Measurement) -> String {
    match m.side {
        Some(side) => format!("{} ({})", m.metric, side.as_str()),
        None => m.metric.clone(),
    }
}

pub fn build_series(rows: &[&Measurement]) -> Vec<AthleteMetricSeries> {
    let mut grouped: BTreeMap<(String, String), Vec<&Measurement>> = BTreeMap::new();
    for &row in rows {
        grouped
            .entry((row.athlete_id.clone(), series_metric(row)))
            .or_default()
            .push(row);
    }

    grouped
        .into_iter()
        .filter_map(|((athlete_id, metric), mut points)| {
            points.sort_by(|a, b| {
                a.timestamp
                    .cmp(&b.timestamp)
                    .then(a.value.total_cmp(&b.value))
            });
            let team = points.last()?.team.clone();
            let base_metric = points.last()?.metric.clone();
            Some(AthleteMetricSeries {
                athlete_id,
                team,
                metric,
                base_metric,
                points: points.iter().map(|p| (p.timestamp, p.value)).collect(),
            })
        })
        .collect()
}

fn flag_inactivity(rows: &[&Measurement], now: DateTime<Utc>, config: &FlagConfig) -> Vec<Flag> {
    let mut last_seen: BTreeMap<&str, &Measurement> = BTreeMap::new();
    for &row in rows {
        let entry = last_seen.entry(row.athlete_id.as_str()).or_insert(row);
        if (row.timestamp, &row.team) > (entry.timestamp, &entry.team) {
            *entry = row;
        }
    }

    last_seen
        .into_values()
        .filter(|last| is_inactive(last.timestamp, now, config.inactivity_days))
        .map(|last| Flag {
            athlete_id: last.athlete_id.clone(),
            team: last.team.clone(),
            flag_type: FlagType::Inactivity,
            metric: None,
            metric_value: None,
            detected_at: last.timestamp,
            detail: format!(
                "Inactive > {} days ({} days since last test)",
                config.inactivity_days,
                (now - last.timestamp).num_days()
            ),
        })
        .collect()
}

fn mean(values: &[f64]) -> f64 {
    values.iter().sum::<f64>() / values.len() as f64
}

fn flag_decline(series: &[AthleteMetricSeries], config: &FlagConfig) -> Vec<Flag> {
    let needed = config.recent_sessions + config.baseline_sessions;
    let mut flags = Vec::new();
    let mut skipped = 0usize;

    for s in series {
        if s.points.len() < needed {
            skipped += 1;
            continue;
        }
        let values: Vec<f64> = s.points.iter().map(|(_, v)| *v).collect();
        let split = values.len() - config.recent_sessions;
        let recent = mean(&values[split..]);
        let baseline = mean(&values[split - config.baseline_sessions..split]);

        let Some(ratio) = decline_ratio(baseline, recent, config.is_lower_better(&s.base_metric)) else {
            skipped += 1;
            continue;
        };
        if !(ratio > config.decline_threshold) {
            continue;
        }
        let Some((detected_at, _)) = s.latest() else {
            continue;
        };

        flags.push(Flag {
            athlete_id: s.athlete_id.clone(),
            team: s.team.clone(),
            flag_type: FlagType::Decline,
            metric: Some(s.metric.clone()),
            metric_value: Some(format!("{recent:.2}")),
            detected_at,
            detail: format!(
                "Declined > {:.0}% ({:.1}% vs baseline {:.2})",
                config.decline_threshold * 100.0,
                ratio * 100.0,
                baseline
            ),
        });
    }

    debug!(skipped, "decline rule skipped series without enough sessions");
    flags
}

fn flag_team_norm(series: &[AthleteMetricSeries], config: &FlagConfig) -> Vec<Flag> {
    let mut groups: BTreeMap<(&str, &str), Vec<&AthleteMetricSeries>> = BTreeMap::new();
    for s in series {
        groups
            .entry((s.team.as_str(), s.metric.as_str()))
            .or_default()
            .push(s);
    }

    let mut flags = Vec::new();
    for ((team, metric), members) in groups {
        let latest: Vec<(&AthleteMetricSeries, DateTime<Utc>, f64)> = members
            .iter()
            .filter_map(|s| s.latest().map(|(ts, v)| (*s, ts, v)))
            .collect();

        if latest.len() < config.min_team_size {
            debug!(team, metric, size = latest.len(), "team too small for norm");
            continue;
        }

        let norm = TeamNormSet {
            team: team.to_string(),
            metric: metric.to_string(),
            values: latest.iter().map(|(_, _, v)| *v).collect(),
        };
        let (Some(team_mean), Some(team_sd)) = (norm.mean(), norm.std_dev()) else {
            continue;
        };
        debug!(team = %norm.team, metric = %norm.metric, team_mean, team_sd, "team norm");

        for (s, detected_at, value) in latest {
            let Some(distance) = sd_distance(value, team_mean, team_sd) else {
                continue;
            };
            if !(distance > config.team_norm_sd) {
                continue;
            }
            flags.push(Flag {
                athlete_id: s.athlete_id.clone(),
                team: s.team.clone(),
                flag_type: FlagType::OutsideNorm,
                metric: Some(s.metric.clone()),
                metric_value: Some(format!("{value:.2}")),
                detected_at,
                detail: format!(
                    "Outside team norm ±{} SD ({:.1} SD from mean {:.2})",
                    config.team_norm_sd, distance, team_mean
                ),
            });
        }
    }
    flags
}

#[derive(Default)]
struct SideTotals {
    team: String,
    left: (f64, usize),
    right: (f64, usize),
    last: Option<DateTime<Utc>>,
}

impl SideTotals {
    fn add(&mut self, side: Side, row: &Measurement) {
        let slot = match side {
            Side::Left => &mut self.left,
            Side::Right => &mut self.right,
        };
        slot.0 += row.value;
        slot.1 += 1;
        let newer = match self.last {
            None => true,
            Some(last) => (row.timestamp, &row.team) > (last, &self.team),
        };
        if newer {
            self.last = Some(row.timestamp);
            self.team = row.team.clone();
        }
    }

    fn means(&self) -> Option<(f64, f64)> {
        if self.left.1 == 0 || self.right.1 == 0 {
            return None;
        }
        Some((
            self.left.0 / self.left.1 as f64,
            self.right.0 / self.right.1 as f64,
        ))
    }
}

fn flag_asymmetry(rows: &[&Measurement], config: &FlagConfig) -> Vec<Flag> {
    let mut totals: BTreeMap<(String, String), SideTotals> = BTreeMap::new();

    for &row in rows {
        let keyed = match row.side {
            Some(side) => Some((row.metric.clone(), side)),
            None => config
                .pair_for(&row.metric)
                .map(|(pair, side)| (pair.label(), side)),
        };
        if let Some((label, side)) = keyed {
            totals
                .entry((row.athlete_id.clone(), label))
                .or_default()
                .add(side, row);
        }
    }

    let mut flags = Vec::new();
    let mut incomplete = BTreeSet::new();
    for ((athlete_id, label), sides) in totals {
        let Some((left, right)) = sides.means() else {
            incomplete.insert(label);
            continue;
        };
        let Some(ratio) = asymmetry_ratio(left, right) else {
            continue;
        };
        if !(ratio > config.asymmetry_threshold) {
            continue;
        }
        let Some(detected_at) = sides.last else {
            continue;
        };
        flags.push(Flag {
            athlete_id,
            team: sides.team,
            flag_type: FlagType::Asymmetry,
            metric: Some(label),
            metric_value: Some(format!("{left:.2}/{right:.2}")),
            detected_at,
            detail: format!(
                "Asymmetry > {:.0}% ({:.1}%)",
                config.asymmetry_threshold * 100.0,
                ratio * 100.0
            ),
        });
    }

    if !incomplete.is_empty() {
        debug!(?incomplete, "asymmetry skipped pairs missing a side");
    }
    flags
}
