use sqlx::{PgPool, QueryBuilder, Row};

use crate::models::partition::Partition;
use crate::models::record::{ExtractionRecord, ReportRow};

/// Batched idempotent upsert of extraction records. The unique constraint
/// on `(eid, cid, photonum, tag, cutoff_date, env)` makes replays touch
/// only `modified_at`.
pub async fn upsert_batch(
    pool: &PgPool,
    partition: &Partition,
    records: &[ExtractionRecord],
) -> Result<(), sqlx::Error> {
    if records.is_empty() {
        return Ok(());
    }

    let mut builder = QueryBuilder::new(
        "INSERT INTO bib_number_detection \
         (eid, cid, photonum, tag, cutoff_date, env, race_id) ",
    );
    builder.push_values(records, |mut row, record| {
        row.push_bind(record.eid)
            .push_bind(record.cid)
            .push_bind(record.photonum)
            .push_bind(&record.tag)
            .push_bind(partition.cutoff_date)
            .push_bind(&partition.env)
            .push_bind(&partition.race_id);
    });
    builder.push(
        " ON CONFLICT (eid, cid, photonum, tag, cutoff_date, env) \
         DO UPDATE SET modified_at = NOW()",
    );

    builder.build().execute(pool).await?;
    Ok(())
}

/// Detection rows with a non-empty tag for the end-of-run report.
pub async fn fetch_report(
    pool: &PgPool,
    partition: &Partition,
) -> Result<Vec<ReportRow>, sqlx::Error> {
    let rows = sqlx::query(
        r#"
        SELECT eid, cid, photonum, tag
        FROM bib_number_detection
        WHERE cutoff_date = $1 AND env = $2
          AND race_id IS NOT DISTINCT FROM $3
          AND tag <> ''
        ORDER BY eid, cid, photonum
        "#,
    )
    .bind(partition.cutoff_date)
    .bind(&partition.env)
    .bind(&partition.race_id)
    .fetch_all(pool)
    .await?;

    rows.into_iter()
        .map(|r| {
            Ok(ReportRow {
                eid: r.try_get("eid")?,
                cid: r.try_get("cid")?,
                photonum: r.try_get("photonum")?,
                tag: r.try_get("tag")?,
            })
        })
        .collect()
}
