use anyhow::Context;
use chrono::{DateTime, Duration, Utc};
use sqlx::{PgPool, Row};
use uuid::Uuid;

use crate::input;
use crate::models::{Measurement, Side};

pub async fn init_db(pool: &PgPool) -> anyhow::Result<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

async fn insert_measurement(
    pool: &PgPool,
    measurement: &Measurement,
    source_key: &str,
) -> anyhow::Result<bool> {
    let result = sqlx::query(
        r#"
        INSERT INTO athlete_flags.measurements
        (id, athlete_id, team, metric, side, value, recorded_at, data_source, source_key)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
        ON CONFLICT (source_key) DO NOTHING
        "#,
    )
    .bind(Uuid::new_v4())
    .bind(&measurement.athlete_id)
    .bind(&measurement.team)
    .bind(&measurement.metric)
    .bind(measurement.side.map(|s| s.as_str()))
    .bind(measurement.value)
    .bind(measurement.timestamp)
    .bind(measurement.data_source.as_deref())
    .bind(source_key)
    .execute(pool)
    .await?;

    Ok(result.rows_affected() > 0)
}

fn natural_key(m: &Measurement) -> String {
    format!(
        "{}|{}|{}|{}",
        m.athlete_id,
        m.metric,
        m.side.map(|s| s.as_str()).unwrap_or("-"),
        m.timestamp.to_rfc3339()
    )
}

pub async fn seed(pool: &PgPool) -> anyhow::Result<usize> {
    let today = Utc::now();
    let at = |days_ago: i64| -> DateTime<Utc> { today - Duration::days(days_ago) };

    // (athlete, team, metric, source, [(days_ago, value)])
    let series: Vec<(&str, &str, &str, &str, Vec<(i64, f64)>)> = vec![
        (
            "Avery Lee",
            "Women's Soccer",
            "Jump Height(m)",
            "hawkins",
            vec![(40, 0.41), (33, 0.42), (26, 0.41), (5, 0.34)],
        ),
        (
            "Jules Moreno",
            "Women's Soccer",
            "Jump Height(m)",
            "hawkins",
            vec![(38, 0.44), (24, 0.45), (10, 0.44), (3, 0.45)],
        ),
        (
            "Kiara Patel",
            "Women's Soccer",
            "Jump Height(m)",
            "hawkins",
            vec![(70, 0.39), (55, 0.40), (45, 0.40)],
        ),
        (
            "Avery Lee",
            "Women's Soccer",
            "distance_total",
            "kinexon",
            vec![(12, 6120.0), (8, 5980.0), (4, 6050.0)],
        ),
        (
            "Jules Moreno",
            "Women's Soccer",
            "leftMaxForce",
            "vald",
            vec![(10, 1510.0), (3, 1495.0)],
        ),
        (
            "Jules Moreno",
            "Women's Soccer",
            "rightMaxForce",
            "vald",
            vec![(10, 1250.0), (3, 1262.0)],
        ),
        (
            "Avery Lee",
            "Women's Soccer",
            "leftMaxForce",
            "vald",
            vec![(6, 1402.0)],
        ),
        (
            "Avery Lee",
            "Women's Soccer",
            "rightMaxForce",
            "vald",
            vec![(6, 1371.0)],
        ),
    ];

    let mut inserted = 0usize;
    for (athlete, team, metric, source, points) in series {
        for (days_ago, value) in points {
            let measurement = Measurement {
                athlete_id: athlete.to_string(),
                team: team.to_string(),
                metric: metric.to_string(),
                side: None,
                timestamp: at(days_ago),
                value,
                data_source: Some(source.to_string()),
            };
            let source_key = format!("seed|{athlete}|{metric}|{days_ago}");
            if insert_measurement(pool, &measurement, &source_key).await? {
                inserted += 1;
            }
        }
    }

    Ok(inserted)
}

/// Loads measurements for `metrics` (all metrics when empty), skipping rows
/// without an athlete or team.
pub async fn fetch_measurements(
    pool: &PgPool,
    metrics: &[String],
    team: Option<&str>,
) -> anyhow::Result<Vec<Measurement>> {
    let mut query = String::from(
        "SELECT athlete_id, team, metric, side, value, recorded_at, data_source \
         FROM athlete_flags.measurements \
         WHERE TRIM(athlete_id) <> '' AND TRIM(team) <> '' \
         AND (cardinality($1::text[]) = 0 OR metric = ANY($1))",
    );

    if team.is_some() {
        query.push_str(" AND team = $2");
    }
    query.push_str(" ORDER BY athlete_id, metric, recorded_at");

    let mut rows = sqlx::query(&query).bind(metrics);
    if let Some(value) = team {
        rows = rows.bind(value);
    }

    let records = rows.fetch_all(pool).await.context("failed to load measurements")?;
    let mut measurements = Vec::with_capacity(records.len());

    let mut non_finite = 0usize;
    for row in records {
        let value: f64 = row.get("value");
        if !value.is_finite() {
            non_finite += 1;
            continue;
        }
        let side: Option<String> = row.get("side");
        measurements.push(Measurement {
            athlete_id: row.get("athlete_id"),
            team: row.get("team"),
            metric: row.get("metric"),
            side: side.as_deref().and_then(Side::parse),
            timestamp: row.get("recorded_at"),
            value,
            data_source: row.get("data_source"),
        });
    }

    if non_finite > 0 {
        tracing::warn!(non_finite, "skipped measurements with non-finite values");
    }

    Ok(measurements)
}

pub async fn import_csv(pool: &PgPool, csv_path: &std::path::Path) -> anyhow::Result<usize> {
    let file = std::fs::File::open(csv_path)
        .with_context(|| format!("failed to open {}", csv_path.display()))?;
    let records = input::read_csv_records(file)?;
    let mut inserted = 0usize;

    for record in records {
        let source_key = record.source_key.clone();
        let line = record.line;
        let measurement = record
            .into_measurement()
            .with_context(|| format!("invalid row at line {line}"))?;
        let source_key = source_key.unwrap_or_else(|| natural_key(&measurement));

        if insert_measurement(pool, &measurement, &source_key).await? {
            inserted += 1;
        }
    }

    Ok(inserted)
}
