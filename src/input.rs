use std::io::Read;
use std::path::Path;

use anyhow::{anyhow, bail, Context};
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde::Deserialize;

use crate::models::{Measurement, Side};

#[derive(Debug, Deserialize)]
pub struct CsvMeasurement {
    pub athlete_id: String,
    pub team: String,
    pub metric: String,
    pub timestamp: String,
    pub value: f64,
    #[serde(default)]
    pub side: Option<String>,
    #[serde(default)]
    pub data_source: Option<String>,
    #[serde(default)]
    pub source_key: Option<String>,
    /// Line the record starts on; quoted fields may span several lines.
    #[serde(skip)]
    pub line: u64,
}

impl CsvMeasurement {
    pub fn into_measurement(self) -> anyhow::Result<Measurement> {
        if !self.value.is_finite() {
            bail!("value {} is not a finite number", self.value);
        }
        let side = match self.side.as_deref().map(str::trim) {
            None | Some("") => None,
            Some(raw) => Some(Side::parse(raw).ok_or_else(|| anyhow!("unknown side {raw:?}"))?),
        };
        Ok(Measurement {
            timestamp: parse_timestamp(&self.timestamp)?,
            athlete_id: self.athlete_id.trim().to_string(),
            team: self.team.trim().to_string(),
            metric: self.metric.trim().to_string(),
            side,
            value: self.value,
            data_source: self.data_source.filter(|s| !s.trim().is_empty()),
        })
    }
}

/// Accepts RFC 3339, `YYYY-MM-DD HH:MM:SS[.f]` (UTC) and bare dates (midnight UTC).
pub fn parse_timestamp(raw: &str) -> anyhow::Result<DateTime<Utc>> {
    let raw = raw.trim();
    if let Ok(parsed) = DateTime::parse_from_rfc3339(raw) {
        return Ok(parsed.with_timezone(&Utc));
    }
    for format in ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f"] {
        if let Ok(parsed) = NaiveDateTime::parse_from_str(raw, format) {
            return Ok(parsed.and_utc());
        }
    }
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .ok()
        .and_then(|date| date.and_hms_opt(0, 0, 0))
        .map(|naive| naive.and_utc())
        .ok_or_else(|| anyhow!("unrecognised timestamp {raw:?}"))
}

pub fn read_csv_records<R: Read>(reader: R) -> anyhow::Result<Vec<CsvMeasurement>> {
    let mut reader = csv::ReaderBuilder::new().trim(csv::Trim::All).from_reader(reader);
    let headers = reader.headers().context("failed to read CSV header")?.clone();
    let mut raw = csv::StringRecord::new();
    let mut records = Vec::new();

    while reader.read_record(&mut raw).context("failed to read CSV row")? {
        let line = raw.position().map_or(0, |p| p.line());
        let mut record: CsvMeasurement = raw
            .deserialize(Some(&headers))
            .with_context(|| format!("malformed row at line {line}"))?;
        record.line = line;
        records.push(record);
    }
    Ok(records)
}

pub fn read_measurements<R: Read>(reader: R) -> anyhow::Result<Vec<Measurement>> {
    read_csv_records(reader)?
        .into_iter()
        .map(|record| {
            let line = record.line;
            record
                .into_measurement()
                .with_context(|| format!("invalid row at line {line}"))
        })
        .collect()
}

pub fn load_csv(path: &Path) -> anyhow::Result<Vec<Measurement>> {
    let file = std::fs::File::open(path)
        .with_context(|| format!("failed to open {}", path.display()))?;
    let measurements = read_measurements(file)?;
    tracing::info!(path = %path.display(), rows = measurements.len(), "loaded measurements");
    Ok(measurements)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn reads_required_and_optional_columns() {
        let data = "\
athlete_id,team,metric,timestamp,value,side,data_source
Avery Lee,Soccer,Jump Height(m),2024-04-01 09:30:00,0.42,,hawkins
Avery Lee,Soccer,MaxForce,2024-04-01,1850.5,Left,vald
";
        let rows = read_measurements(data.as_bytes()).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].athlete_id, "Avery Lee");
        assert_eq!(rows[0].side, None);
        assert_eq!(rows[0].data_source.as_deref(), Some("hawkins"));
        assert_eq!(
            rows[0].timestamp,
            Utc.with_ymd_and_hms(2024, 4, 1, 9, 30, 0).unwrap()
        );
        assert_eq!(rows[1].side, Some(Side::Left));
        assert_eq!(rows[1].value, 1850.5);
    }

    #[test]
    fn optional_columns_may_be_absent() {
        let data = "\
athlete_id,team,metric,timestamp,value
Jules Moreno,Track,distance_total,2024-04-02T10:00:00Z,5120
";
        let rows = read_measurements(data.as_bytes()).unwrap();
        assert_eq!(rows[0].data_source, None);
        assert_eq!(rows[0].value, 5120.0);
    }

    #[test]
    fn bad_timestamp_reports_line() {
        let data = "\
athlete_id,team,metric,timestamp,value
Jules Moreno,Track,distance_total,2024-04-02,5120
Jules Moreno,Track,distance_total,last tuesday,5120
";
        let err = read_measurements(data.as_bytes()).unwrap_err();
        assert!(format!("{err:#}").contains("line 3"));
    }

    #[test]
    fn line_numbers_follow_multiline_fields() {
        let data = "\
athlete_id,team,metric,timestamp,value
Avery Lee,\"Women's
Soccer\",distance_total,2024-04-02,5120
Jules Moreno,Track,distance_total,2024-04-02,oops
";
        let err = read_measurements(data.as_bytes()).unwrap_err();
        assert!(format!("{err:#}").contains("line 4"), "{err:#}");

        let data = "\
athlete_id,team,metric,timestamp,value
Avery Lee,\"Women's
Soccer\",distance_total,2024-04-02,5120
Jules Moreno,Track,distance_total,yesterday,5120
";
        let err = read_measurements(data.as_bytes()).unwrap_err();
        assert!(format!("{err:#}").contains("line 4"), "{err:#}");
    }

    #[test]
    fn non_finite_values_are_rejected() {
        for value in ["NaN", "inf", "-inf"] {
            let data = format!(
                "athlete_id,team,metric,timestamp,value\nAvery Lee,Soccer,rightMaxForce,2024-04-02,{value}\n"
            );
            let err = read_measurements(data.as_bytes()).unwrap_err();
            assert!(format!("{err:#}").contains("not a finite number"), "{err:#}");
        }
    }

    #[test]
    fn non_numeric_value_is_rejected() {
        let data = "\
athlete_id,team,metric,timestamp,value
Jules Moreno,Track,distance_total,2024-04-02,n/a
";
        assert!(read_measurements(data.as_bytes()).is_err());
    }

    #[test]
    fn parses_offset_timestamps() {
        let ts = parse_timestamp("2024-05-01T08:00:00-05:00").unwrap();
        assert_eq!(ts, Utc.with_ymd_and_hms(2024, 5, 1, 13, 0, 0).unwrap());
    }
}
