//! The persistent study ledger.
//!
//! The ledger is the only writable shared state of the pipeline. It records
//! every admitted study, owns the pseudonymous identifiers, and carries the
//! export timestamp which makes delivery exactly-once from the point of view
//! of downstream consumers. All writes run inside transactions; admission uses
//! serializable isolation with a bounded retry on serialization failure.

use std::collections::HashSet;

use chrono::{DateTime, NaiveDate, Utc};
use patient_queue::Message;
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Row};

#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    #[error("image already exported")]
    AlreadyExported,
    #[error("no image with pseudo study uid '{0}'")]
    UnknownStudy(String),
    #[error("no image for (mrn, accession) ({0}, {1})")]
    UnknownImage(String, String),
    #[error("transaction retries exhausted")]
    RetriesExhausted,
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
    #[error(transparent)]
    Migrate(#[from] sqlx::migrate::MigrateError),
}

/// Bounded retry for serialization failures; persistent failure is fatal.
const TXN_ATTEMPTS: u32 = 3;

/// A ledger row joined to its extract, as surfaced to the CLI and the
/// radiology export.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct ExportedImage {
    pub mrn: String,
    pub accession_number: String,
    pub pseudo_study_uid: String,
    pub pseudo_patient_id: Option<String>,
    pub exported_at: DateTime<Utc>,
}

#[derive(Clone)]
pub struct Ledger {
    pool: PgPool,
}

impl Ledger {
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self, LedgerError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Apply in-crate schema migrations.
    pub async fn run_migrations(&self) -> Result<(), LedgerError> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }

    /// Liveness probe for `pixl check-env`.
    pub async fn heart_beat(&self) -> Result<(), LedgerError> {
        sqlx::query("select 1").execute(&self.pool).await?;
        Ok(())
    }

    /// Admit a batch: create or fetch the extract, insert previously-unknown
    /// images, and return the work items still eligible for export. Items
    /// whose (mrn, accession, study_date) is already recorded as exported are
    /// dropped. One serializable transaction per batch.
    pub async fn admit(
        &self,
        extract_slug: &str,
        items: &[Message],
    ) -> Result<Vec<Message>, LedgerError> {
        let deduped = dedupe_batch(items);

        for attempt in 1..=TXN_ATTEMPTS {
            match self.admit_once(extract_slug, &deduped).await {
                Err(LedgerError::Sqlx(error)) if is_serialization_failure(&error) => {
                    tracing::warn!(attempt, "admission serialization failure; retrying");
                }
                other => return other,
            }
        }
        Err(LedgerError::RetriesExhausted)
    }

    async fn admit_once(
        &self,
        extract_slug: &str,
        items: &[Message],
    ) -> Result<Vec<Message>, LedgerError> {
        let mut txn = self.pool.begin().await?;
        sqlx::query("set transaction isolation level serializable")
            .execute(&mut txn)
            .await?;

        let extract_id: i64 = sqlx::query_scalar(
            r#"
            insert into extract (slug) values ($1)
            on conflict (slug) do update set slug = excluded.slug
            returning extract_id
            "#,
        )
        .bind(extract_slug)
        .fetch_one(&mut txn)
        .await?;

        for item in items {
            sqlx::query(
                r#"
                insert into image (extract_id, mrn, accession_number, study_uid, study_date)
                values ($1, $2, $3, $4, $5)
                on conflict (extract_id, mrn, accession_number) do nothing
                "#,
            )
            .bind(extract_id)
            .bind(&item.mrn)
            .bind(&item.accession_number)
            .bind(&item.study_uid)
            .bind(item.study_date)
            .execute(&mut txn)
            .await?;
        }

        let exported = sqlx::query(
            r#"
            select mrn, accession_number, study_date
            from image
            where extract_id = $1 and exported_at is not null
            "#,
        )
        .bind(extract_id)
        .fetch_all(&mut txn)
        .await?;
        txn.commit().await?;

        let exported: HashSet<(String, String, NaiveDate)> = exported
            .into_iter()
            .map(|row| (row.get("mrn"), row.get("accession_number"), row.get("study_date")))
            .collect();

        Ok(filter_admitted(items, &exported))
    }

    /// Whether the study behind this pseudonym has already been delivered.
    pub async fn already_exported(&self, pseudo_study_uid: &str) -> Result<bool, LedgerError> {
        let exported: bool = sqlx::query_scalar(
            r#"
            select exists (
                select 1 from image
                where pseudo_study_uid = $1 and exported_at is not null
            )
            "#,
        )
        .bind(pseudo_study_uid)
        .fetch_one(&self.pool)
        .await?;
        Ok(exported)
    }

    /// Idempotently assign the study's pseudonymous UID. An existing value is
    /// returned untouched; otherwise `generate` supplies candidates until one
    /// passes the ledger-wide uniqueness constraint.
    pub async fn assign_pseudo_study_uid(
        &self,
        extract_slug: &str,
        mrn: &str,
        accession_number: &str,
        generate: impl Fn() -> String,
    ) -> Result<String, LedgerError> {
        for _attempt in 1..=TXN_ATTEMPTS {
            if let Some(existing) = self
                .fetch_pseudo_study_uid(extract_slug, mrn, accession_number)
                .await?
            {
                return Ok(existing);
            }

            let candidate = generate();
            let updated = sqlx::query(
                r#"
                update image set pseudo_study_uid = $1
                from extract
                where image.extract_id = extract.extract_id
                  and extract.slug = $2 and image.mrn = $3 and image.accession_number = $4
                  and image.pseudo_study_uid is null
                "#,
            )
            .bind(&candidate)
            .bind(extract_slug)
            .bind(mrn)
            .bind(accession_number)
            .execute(&self.pool)
            .await;

            match updated {
                Ok(result) if result.rows_affected() > 0 => return Ok(candidate),
                // Zero rows: a concurrent writer won; loop re-reads its value.
                Ok(_) => continue,
                // Collision on the unique constraint: generate a fresh UID.
                Err(error) if is_unique_violation(&error) => continue,
                Err(error) => return Err(error.into()),
            }
        }
        Err(LedgerError::RetriesExhausted)
    }

    async fn fetch_pseudo_study_uid(
        &self,
        extract_slug: &str,
        mrn: &str,
        accession_number: &str,
    ) -> Result<Option<String>, LedgerError> {
        let row = sqlx::query(
            r#"
            select image.pseudo_study_uid
            from image join extract using (extract_id)
            where extract.slug = $1 and image.mrn = $2 and image.accession_number = $3
            "#,
        )
        .bind(extract_slug)
        .bind(mrn)
        .bind(accession_number)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            None => Err(LedgerError::UnknownImage(
                mrn.to_string(),
                accession_number.to_string(),
            )),
            Some(row) => Ok(row.get("pseudo_study_uid")),
        }
    }

    /// Idempotently assign the patient pseudonym within an extract: the first
    /// assignment wins and is reused for every later study of the same
    /// patient. `hashed_candidate` is deterministic in (project, mrn), so
    /// concurrent assignments converge on the same value anyway.
    pub async fn assign_or_get_pseudo_patient_id(
        &self,
        extract_slug: &str,
        mrn: &str,
        hashed_candidate: &str,
    ) -> Result<String, LedgerError> {
        let existing: Option<String> = sqlx::query_scalar(
            r#"
            select image.pseudo_patient_id
            from image join extract using (extract_id)
            where extract.slug = $1 and image.mrn = $2 and image.pseudo_patient_id is not null
            limit 1
            "#,
        )
        .bind(extract_slug)
        .bind(mrn)
        .fetch_optional(&self.pool)
        .await?;

        if let Some(existing) = existing {
            return Ok(existing);
        }

        sqlx::query(
            r#"
            update image set pseudo_patient_id = $1
            from extract
            where image.extract_id = extract.extract_id
              and extract.slug = $2 and image.mrn = $3
              and image.pseudo_patient_id is null
            "#,
        )
        .bind(hashed_candidate)
        .bind(extract_slug)
        .bind(mrn)
        .execute(&self.pool)
        .await?;

        Ok(hashed_candidate.to_string())
    }

    /// Record delivery. The timestamp transitions from NULL to `when` exactly
    /// once; a second call is rejected without side-effect.
    pub async fn mark_exported(
        &self,
        pseudo_study_uid: &str,
        when: DateTime<Utc>,
    ) -> Result<(), LedgerError> {
        let updated = sqlx::query(
            r#"
            update image set exported_at = $2
            where pseudo_study_uid = $1 and exported_at is null
            "#,
        )
        .bind(pseudo_study_uid)
        .bind(when)
        .execute(&self.pool)
        .await?;

        if updated.rows_affected() == 1 {
            return Ok(());
        }

        let exists: bool =
            sqlx::query_scalar("select exists (select 1 from image where pseudo_study_uid = $1)")
                .bind(pseudo_study_uid)
                .fetch_one(&self.pool)
                .await?;
        if exists {
            Err(LedgerError::AlreadyExported)
        } else {
            Err(LedgerError::UnknownStudy(pseudo_study_uid.to_string()))
        }
    }

    /// Count of delivered studies for a project; drives the stability loop.
    pub async fn exported_count(&self, extract_slug: &str) -> Result<i64, LedgerError> {
        let count: i64 = sqlx::query_scalar(
            r#"
            select count(*)
            from image join extract using (extract_id)
            where extract.slug = $1 and image.exported_at is not null
            "#,
        )
        .bind(extract_slug)
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }

    /// Every delivered study of a project, for report linking.
    pub async fn exported_images(
        &self,
        extract_slug: &str,
    ) -> Result<Vec<ExportedImage>, LedgerError> {
        let rows = sqlx::query_as::<_, ExportedImage>(
            r#"
            select image.mrn, image.accession_number, image.pseudo_study_uid,
                   image.pseudo_patient_id, image.exported_at
            from image join extract using (extract_id)
            where extract.slug = $1 and image.exported_at is not null
            order by image.image_id
            "#,
        )
        .bind(extract_slug)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }
}

/// Keep the first occurrence of each (mrn, accession) within a batch.
fn dedupe_batch(items: &[Message]) -> Vec<Message> {
    let mut seen = HashSet::new();
    items
        .iter()
        .filter(|item| seen.insert((item.mrn.clone(), item.accession_number.clone())))
        .cloned()
        .collect()
}

/// The admitted set: the input minus items already recorded as exported.
fn filter_admitted(
    items: &[Message],
    exported: &HashSet<(String, String, NaiveDate)>,
) -> Vec<Message> {
    items
        .iter()
        .filter(|item| {
            !exported.contains(&(
                item.mrn.clone(),
                item.accession_number.clone(),
                item.study_date,
            ))
        })
        .cloned()
        .collect()
}

fn is_serialization_failure(error: &sqlx::Error) -> bool {
    matches!(
        error,
        sqlx::Error::Database(db) if matches!(db.code().as_deref(), Some("40001") | Some("40P01"))
    )
}

fn is_unique_violation(error: &sqlx::Error) -> bool {
    matches!(
        error,
        sqlx::Error::Database(db) if db.code().as_deref() == Some("23505")
    )
}

#[cfg(test)]
mod test {
    use super::*;
    use chrono::TimeZone;

    fn item(mrn: &str, accession: &str, day: u32) -> Message {
        Message {
            mrn: mrn.to_string(),
            accession_number: accession.to_string(),
            study_uid: String::new(),
            study_date: NaiveDate::from_ymd_opt(2023, 1, day).unwrap(),
            procedure_occurrence_id: 1,
            project_name: "test-extract".to_string(),
            extract_generated_timestamp: Utc.with_ymd_and_hms(2023, 12, 7, 14, 8, 0).unwrap(),
        }
    }

    #[test]
    fn test_dedupe_keeps_first_occurrence() {
        let items = vec![item("a", "1", 1), item("a", "1", 2), item("b", "1", 1)];
        let deduped = dedupe_batch(&items);
        assert_eq!(deduped.len(), 2);
        assert_eq!(deduped[0].study_date.to_string(), "2023-01-01");
    }

    #[test]
    fn test_filter_admitted_drops_exported_triples() {
        let items = vec![item("a", "1", 1), item("b", "2", 2)];
        let exported = HashSet::from([(
            "a".to_string(),
            "1".to_string(),
            NaiveDate::from_ymd_opt(2023, 1, 1).unwrap(),
        )]);

        let admitted = filter_admitted(&items, &exported);
        assert_eq!(admitted.len(), 1);
        assert_eq!(admitted[0].mrn, "b");
    }

    #[test]
    fn test_filter_admitted_keeps_same_key_on_other_date() {
        // An exported study on a different date does not shadow this one.
        let items = vec![item("a", "1", 2)];
        let exported = HashSet::from([(
            "a".to_string(),
            "1".to_string(),
            NaiveDate::from_ymd_opt(2023, 1, 1).unwrap(),
        )]);
        assert_eq!(filter_admitted(&items, &exported).len(), 1);
    }
}
