use std::collections::HashSet;

use sqlx::{PgPool, QueryBuilder, Row};

use crate::models::partition::Partition;

// Keeps IN-list queries below Postgres parameter limits.
const LOOKUP_CHUNK: usize = 1000;

/// Record keys as processed. Duplicate markers are no-ops, so retries and
/// replays are safe.
pub async fn mark_processed(
    pool: &PgPool,
    partition: &Partition,
    keys: &[String],
) -> Result<(), sqlx::Error> {
    if keys.is_empty() {
        return Ok(());
    }

    let mut builder = QueryBuilder::new(
        "INSERT INTO processed_image (image_key, cutoff_date, env, race_id) ",
    );
    builder.push_values(keys, |mut row, key| {
        row.push_bind(key)
            .push_bind(partition.cutoff_date)
            .push_bind(&partition.env)
            .push_bind(&partition.race_id);
    });
    builder.push(" ON CONFLICT (image_key, cutoff_date, env) DO NOTHING");

    builder.build().execute(pool).await?;
    Ok(())
}

/// Which of `keys` already completed processing in this partition.
pub async fn already_processed(
    pool: &PgPool,
    partition: &Partition,
    keys: &[String],
) -> Result<HashSet<String>, sqlx::Error> {
    let mut processed = HashSet::new();

    for chunk in keys.chunks(LOOKUP_CHUNK) {
        let rows = sqlx::query(
            r#"
            SELECT image_key
            FROM processed_image
            WHERE image_key = ANY($1)
              AND cutoff_date = $2 AND env = $3
              AND race_id IS NOT DISTINCT FROM $4
            "#,
        )
        .bind(chunk)
        .bind(partition.cutoff_date)
        .bind(&partition.env)
        .bind(&partition.race_id)
        .fetch_all(pool)
        .await?;

        for row in rows {
            processed.insert(row.try_get("image_key")?);
        }
    }

    Ok(processed)
}

/// Total processed markers in a partition, for the run summary.
pub async fn processed_count(pool: &PgPool, partition: &Partition) -> Result<i64, sqlx::Error> {
    let row = sqlx::query(
        r#"
        SELECT COUNT(*) AS count
        FROM processed_image
        WHERE cutoff_date = $1 AND env = $2
          AND race_id IS NOT DISTINCT FROM $3
        "#,
    )
    .bind(partition.cutoff_date)
    .bind(&partition.env)
    .bind(&partition.race_id)
    .fetch_one(pool)
    .await?;

    row.try_get("count")
}
