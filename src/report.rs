use std::collections::{BTreeMap, BTreeSet};
use std::fmt::Write as _;
use std::io::Write;

use anyhow::Context;
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::models::{Flag, FlagType, FlagTypeSummary, Measurement, TeamSufficiency};

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum ExportFormat {
    Csv,
    Json,
}

#[derive(Serialize)]
struct FlagRow<'a> {
    athlete_id: &'a str,
    team: &'a str,
    flag_type: &'a str,
    metric: Option<&'a str>,
    metric_value: Option<&'a str>,
    detected_at: String,
    detail: &'a str,
}

impl<'a> From<&'a Flag> for FlagRow<'a> {
    fn from(flag: &'a Flag) -> Self {
        Self {
            athlete_id: &flag.athlete_id,
            team: &flag.team,
            flag_type: flag.flag_type.as_str(),
            metric: flag.metric.as_deref(),
            metric_value: flag.metric_value.as_deref(),
            detected_at: flag.detected_at.to_rfc3339(),
            detail: &flag.detail,
        }
    }
}

/// One row per flag. The header is written even when there are no flags.
pub fn write_flags_csv<W: Write>(writer: W, flags: &[Flag]) -> anyhow::Result<()> {
    let mut writer = csv::Writer::from_writer(writer);
    if flags.is_empty() {
        writer.write_record([
            "athlete_id",
            "team",
            "flag_type",
            "metric",
            "metric_value",
            "detected_at",
            "detail",
        ])?;
    }
    for flag in flags {
        writer.serialize(FlagRow::from(flag))?;
    }
    writer.flush().context("failed to flush flag export")?;
    Ok(())
}

pub fn write_flags_json<W: Write>(writer: W, flags: &[Flag]) -> anyhow::Result<()> {
    let rows: Vec<FlagRow> = flags.iter().map(FlagRow::from).collect();
    serde_json::to_writer_pretty(writer, &rows)?;
    Ok(())
}

pub fn export_flags(path: &std::path::Path, flags: &[Flag], format: ExportFormat) -> anyhow::Result<()> {
    let file = std::fs::File::create(path)
        .with_context(|| format!("failed to create {}", path.display()))?;
    let writer = std::io::BufWriter::new(file);
    match format {
        ExportFormat::Csv => write_flags_csv(writer, flags),
        ExportFormat::Json => write_flags_json(writer, flags),
    }
}

pub fn summarize_by_type(flags: &[Flag]) -> Vec<FlagTypeSummary> {
    let mut map: BTreeMap<FlagType, (usize, BTreeSet<&str>)> = BTreeMap::new();

    for flag in flags {
        let entry = map.entry(flag.flag_type).or_default();
        entry.0 += 1;
        entry.1.insert(flag.athlete_id.as_str());
    }

    let mut summaries: Vec<FlagTypeSummary> = map
        .into_iter()
        .map(|(flag_type, (count, athletes))| FlagTypeSummary {
            flag_type,
            count,
            athlete_count: athletes.len(),
        })
        .collect();

    summaries.sort_by(|a, b| b.count.cmp(&a.count).then(a.flag_type.cmp(&b.flag_type)));
    summaries
}

pub fn team_sufficiency(
    measurements: &[Measurement],
    min_measurements: usize,
) -> Vec<TeamSufficiency> {
    let mut counts: BTreeMap<&str, BTreeMap<&str, usize>> = BTreeMap::new();
    for m in measurements {
        *counts
            .entry(m.team.as_str())
            .or_default()
            .entry(m.athlete_id.as_str())
            .or_default() += 1;
    }

    counts
        .into_iter()
        .map(|(team, athletes)| TeamSufficiency {
            team: team.to_string(),
            total_athletes: athletes.len(),
            athletes_with_min: athletes.values().filter(|n| **n >= min_measurements).count(),
        })
        .collect()
}

pub fn median_rows_per_athlete(measurements: &[Measurement]) -> Option<f64> {
    let mut per_athlete: BTreeMap<&str, usize> = BTreeMap::new();
    for m in measurements {
        *per_athlete.entry(m.athlete_id.as_str()).or_default() += 1;
    }
    let mut counts: Vec<usize> = per_athlete.into_values().collect();
    if counts.is_empty() {
        return None;
    }
    counts.sort_unstable();
    let mid = counts.len() / 2;
    Some(if counts.len() % 2 == 0 {
        (counts[mid - 1] + counts[mid]) as f64 / 2.0
    } else {
        counts[mid] as f64
    })
}

pub fn build_sufficiency(measurements: &[Measurement], min_measurements: usize) -> String {
    let mut output = String::new();
    let teams = team_sufficiency(measurements, min_measurements);

    if teams.is_empty() {
        let _ = writeln!(output, "No measurements loaded.");
        return output;
    }

    let _ = writeln!(
        output,
        "| Team | Athletes | With ≥ {min_measurements} tests | % |"
    );
    let _ = writeln!(output, "|------|----------|-------------|---|");
    for team in &teams {
        let _ = writeln!(
            output,
            "| {} | {} | {} | {:.1} |",
            team.team,
            team.total_athletes,
            team.athletes_with_min,
            team.pct_with_min()
        );
    }

    let athletes: BTreeSet<&str> = measurements.iter().map(|m| m.athlete_id.as_str()).collect();
    let _ = writeln!(output);
    let _ = writeln!(output, "Total rows: {}", measurements.len());
    let _ = writeln!(output, "Total athletes: {}", athletes.len());
    if let Some(median) = median_rows_per_athlete(measurements) {
        let _ = writeln!(output, "Median rows per athlete: {median:.2}");
    }
    output
}

pub fn build_report(
    as_of: DateTime<Utc>,
    measurements: &[Measurement],
    flags: &[Flag],
    min_measurements: usize,
) -> String {
    let summaries = summarize_by_type(flags);

    let mut output = String::new();

    let _ = writeln!(output, "# Athlete Flag Report");
    let _ = writeln!(
        output,
        "Generated as of {} over {} measurements",
        as_of.format("%Y-%m-%d %H:%M UTC"),
        measurements.len()
    );
    let _ = writeln!(output);
    let _ = writeln!(output, "## Flag Mix");

    if summaries.is_empty() {
        let _ = writeln!(output, "No flags raised for this run.");
    } else {
        for summary in summaries.iter() {
            let _ = writeln!(
                output,
                "- {}: {} flags across {} athletes",
                summary.flag_type, summary.count, summary.athlete_count
            );
        }
    }

    let mut by_athlete: BTreeMap<(&str, &str), Vec<FlagType>> = BTreeMap::new();
    for flag in flags {
        by_athlete
            .entry((flag.athlete_id.as_str(), flag.team.as_str()))
            .or_default()
            .push(flag.flag_type);
    }
    let mut athletes: Vec<_> = by_athlete.into_iter().collect();
    athletes.sort_by(|a, b| b.1.len().cmp(&a.1.len()).then(a.0.cmp(&b.0)));

    let _ = writeln!(output);
    let _ = writeln!(output, "## Flagged Athletes");

    if athletes.is_empty() {
        let _ = writeln!(output, "No athletes flagged.");
    } else {
        for ((athlete_id, team), types) in athletes.iter() {
            let kinds: BTreeSet<&str> = types.iter().map(|t| t.as_str()).collect();
            let kinds: Vec<&str> = kinds.into_iter().collect();
            let _ = writeln!(
                output,
                "- {} ({}) {} flags: {}",
                athlete_id,
                team,
                types.len(),
                kinds.join(", ")
            );
        }
    }

    let mut recent: Vec<&Flag> = flags.iter().collect();
    recent.sort_by(|a, b| b.detected_at.cmp(&a.detected_at).then(a.athlete_id.cmp(&b.athlete_id)));
    let _ = writeln!(output);
    let _ = writeln!(output, "## Recent Flag Notes");

    if recent.is_empty() {
        let _ = writeln!(output, "No flags raised for this run.");
    } else {
        for flag in recent.iter().take(10) {
            let _ = writeln!(
                output,
                "- {} ({}) on {}: {}",
                flag.athlete_id,
                flag.metric.as_deref().unwrap_or(flag.flag_type.as_str()),
                flag.detected_at.date_naive(),
                flag.detail
            );
        }
    }

    let _ = writeln!(output);
    let _ = writeln!(output, "## Data Sufficiency");
    output.push_str(&build_sufficiency(measurements, min_measurements));

    output
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap()
    }

    fn flag(athlete: &str, flag_type: FlagType, metric: Option<&str>) -> Flag {
        Flag {
            athlete_id: athlete.to_string(),
            team: "Soccer".to_string(),
            flag_type,
            metric: metric.map(str::to_string),
            metric_value: metric.map(|_| "85.00".to_string()),
            detected_at: now() - Duration::days(3),
            detail: "Declined > 10% (15.0% vs baseline 100.00)".to_string(),
        }
    }

    fn measurement(athlete: &str, team: &str) -> Measurement {
        Measurement {
            athlete_id: athlete.to_string(),
            team: team.to_string(),
            metric: "distance_total".to_string(),
            side: None,
            timestamp: now(),
            value: 4200.0,
            data_source: None,
        }
    }

    #[test]
    fn csv_export_has_one_row_per_flag() {
        let flags = vec![
            flag("Avery Lee", FlagType::Decline, Some("Jump Height(m)")),
            flag("Avery Lee", FlagType::Inactivity, None),
        ];
        let mut buffer = Vec::new();
        write_flags_csv(&mut buffer, &flags).unwrap();
        let text = String::from_utf8(buffer).unwrap();
        let lines: Vec<&str> = text.lines().collect();

        assert_eq!(
            lines[0],
            "athlete_id,team,flag_type,metric,metric_value,detected_at,detail"
        );
        assert_eq!(lines.len(), 3);
        assert!(lines[1].starts_with("Avery Lee,Soccer,decline,Jump Height(m),85.00,"));
        assert!(lines[2].starts_with("Avery Lee,Soccer,inactivity,,,"));
    }

    #[test]
    fn csv_export_writes_header_without_flags() {
        let mut buffer = Vec::new();
        write_flags_csv(&mut buffer, &[]).unwrap();
        let text = String::from_utf8(buffer).unwrap();
        assert_eq!(
            text.trim_end(),
            "athlete_id,team,flag_type,metric,metric_value,detected_at,detail"
        );
    }

    #[test]
    fn json_export_uses_snake_case_types() {
        let mut buffer = Vec::new();
        write_flags_json(&mut buffer, &[flag("Kiara", FlagType::OutsideNorm, Some("accel_load_accum"))])
            .unwrap();
        let value: serde_json::Value = serde_json::from_slice(&buffer).unwrap();
        assert_eq!(value[0]["flag_type"], "outside_norm");
        assert_eq!(value[0]["metric"], "accel_load_accum");
    }

    #[test]
    fn summary_counts_flags_and_athletes() {
        let flags = vec![
            flag("Avery", FlagType::Decline, Some("a")),
            flag("Avery", FlagType::Decline, Some("b")),
            flag("Jules", FlagType::Decline, Some("a")),
            flag("Jules", FlagType::Asymmetry, Some("l/r")),
        ];
        let summaries = summarize_by_type(&flags);
        assert_eq!(summaries[0].flag_type, FlagType::Decline);
        assert_eq!(summaries[0].count, 3);
        assert_eq!(summaries[0].athlete_count, 2);
        assert_eq!(summaries[1].flag_type, FlagType::Asymmetry);
    }

    #[test]
    fn sufficiency_counts_athletes_per_team() {
        let mut rows: Vec<Measurement> = (0..5).map(|_| measurement("Avery", "Soccer")).collect();
        rows.push(measurement("Jules", "Soccer"));
        rows.push(measurement("Kiara", "Track"));

        let teams = team_sufficiency(&rows, 5);
        assert_eq!(teams.len(), 2);
        assert_eq!(teams[0].team, "Soccer");
        assert_eq!(teams[0].total_athletes, 2);
        assert_eq!(teams[0].athletes_with_min, 1);
        assert_eq!(teams[1].athletes_with_min, 0);
        assert_eq!(median_rows_per_athlete(&rows), Some(1.0));
        assert_eq!(median_rows_per_athlete(&[]), None);
    }

    #[test]
    fn report_lists_sections() {
        let rows = vec![measurement("Avery Lee", "Soccer")];
        let flags = vec![flag("Avery Lee", FlagType::Decline, Some("Jump Height(m)"))];
        let report = build_report(now(), &rows, &flags, 5);

        assert!(report.starts_with("# Athlete Flag Report"));
        assert!(report.contains("- decline: 1 flags across 1 athletes"));
        assert!(report.contains("- Avery Lee (Soccer) 1 flags: decline"));
        assert!(report.contains("## Data Sufficiency"));
    }

    #[test]
    fn empty_report_says_so() {
        let report = build_report(now(), &[], &[], 5);
        assert!(report.contains("No flags raised for this run."));
        assert!(report.contains("No athletes flagged."));
        assert!(report.contains("No measurements loaded."));
    }
}
