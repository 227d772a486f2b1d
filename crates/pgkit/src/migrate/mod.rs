//! Ordered, locked, transactional schema migrations.
//!
//! A run takes a database-held advisory lock, validates the candidate list
//! against the applied history, and applies each pending migration in its own
//! transaction. Per-migration transactions are deliberate: a failure aborts
//! the run but keeps everything already applied in this run committed, which
//! maximizes forward progress across iterative deploys. The lock is
//! transaction-scoped, so a crashed runner cannot leak it.

use crate::error::{PgError, Result};
use crate::pool::{Pg, Querier};
use crate::sql::raw;
use crate::transaction::Transaction;
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use futures::FutureExt;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, error, info};

/// Advisory lock key shared by every runner targeting the same database.
/// Stable across deployments; changing it would let two runner versions
/// migrate concurrently.
pub const MIGRATE_LOCK_ID: i64 = 27_031_991;

type ApplyFn = Arc<dyn Fn(Transaction) -> BoxFuture<'static, Result<()>> + Send + Sync>;

/// A single migration: positive id, non-empty name, and a body that issues
/// statements through the transaction it is given.
#[derive(Clone)]
pub struct Migration {
    pub id: i32,
    pub name: String,
    apply: ApplyFn,
}

impl Migration {
    pub fn new<F, Fut>(id: i32, name: impl Into<String>, apply: F) -> Self
    where
        F: Fn(Transaction) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        Migration {
            id,
            name: name.into(),
            apply: Arc::new(move |t| apply(t).boxed()),
        }
    }
}

impl fmt::Debug for Migration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Migration({}, {})", self.id, self.name)
    }
}

/// One row of the bookkeeping table: a successfully applied migration.
#[derive(Debug, Clone, PartialEq)]
pub struct MigrationRecord {
    pub id: i32,
    pub name: String,
    pub created_at: DateTime<Utc>,
}

/// Applies a list of migrations to the database exactly once, safely under
/// concurrent runner instances.
pub struct MigrationRunner {
    pg: Arc<Pg>,
    table: String,
}

impl MigrationRunner {
    pub fn new(pg: Arc<Pg>) -> Self {
        MigrationRunner::with_table(pg, "migrations")
    }

    /// Use a non-default bookkeeping table name.
    pub fn with_table(pg: Arc<Pg>, table: impl Into<String>) -> Self {
        MigrationRunner {
            pg,
            table: table.into(),
        }
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    /// Bring the database to the state described by `migrations`.
    ///
    /// Fails fast with [`PgError::LockContention`] if another runner holds
    /// the advisory lock; there is no queueing. Candidate validation and
    /// history cross-checks happen before any migration body runs.
    pub async fn run(&self, migrations: &[Migration]) -> Result<()> {
        self.pg
            .transaction(|t| async move {
                self.acquire_lock(&t).await?;
                self.ensure_table().await?;

                let candidates = validate_sequence(migrations)?;
                if candidates.is_empty() {
                    info!("no migrations");
                    return Ok(());
                }
                debug!(count = candidates.len(), "migration list validated");

                let applied = self.fetch_applied(&t).await?;
                if applied.is_empty() {
                    info!("no migrations have been applied yet");
                } else {
                    debug!(count = applied.len(), "loaded applied migrations");
                }

                check_history(&applied, &candidates)?;

                let pending = pending_suffix(&applied, candidates);
                if pending.is_empty() {
                    info!("migrations are up to date");
                    return Ok(());
                }

                info!(count = pending.len(), "applying pending migrations");
                for migration in &pending {
                    self.apply_one(migration).await?;
                }

                info!("successfully ran migrations");
                Ok(())
            })
            .await
    }

    /// Read the applied-migration ledger, ordered by id ascending.
    pub async fn applied(&self) -> Result<Vec<MigrationRecord>> {
        self.fetch_applied(self.pg.master()).await
    }

    /// Same as [`applied`](Self::applied), but through an open transaction.
    pub async fn applied_in(&self, t: &Transaction) -> Result<Vec<MigrationRecord>> {
        self.fetch_applied(t).await
    }

    async fn fetch_applied(&self, q: &dyn Querier) -> Result<Vec<MigrationRecord>> {
        let query = crate::sql!(
            "SELECT \"id\", \"name\", \"created_at\" FROM \"" {raw(&self.table)}
            "\" ORDER BY \"id\" ASC"
        );

        let rows = q.rows(&query).await?;
        rows.iter()
            .map(|row| {
                Ok(MigrationRecord {
                    id: row.try_get("id")?,
                    name: row.try_get("name")?,
                    created_at: row.try_get("created_at")?,
                })
            })
            .collect()
    }

    /// Take the transaction-scoped advisory lock, or fail immediately.
    async fn acquire_lock(&self, t: &Transaction) -> Result<()> {
        let query = crate::sql!(
            "SELECT pg_try_advisory_xact_lock(" {MIGRATE_LOCK_ID} ") AS \"locked\""
        );

        let rows = t.sql(&query).await?;
        let locked = rows
            .first()
            .map(|row| row.get::<_, bool>("locked"))
            .unwrap_or(false);

        if !locked {
            error!("failed to acquire migration lock");
            return Err(PgError::LockContention);
        }

        debug!("migration lock acquired");
        Ok(())
    }

    /// Idempotent existence probe, then conditional CREATE. Runs through the
    /// pool rather than the lock transaction so the table commits even if a
    /// later validation step fails.
    async fn ensure_table(&self) -> Result<()> {
        let exists_query = crate::sql!(r#"
            SELECT EXISTS (
                SELECT FROM "information_schema"."tables"
                WHERE "table_schema" = 'public'
                AND "table_name" = "# {self.table.as_str()} r#"
            ) AS "exists"
        "#);

        let rows = self.pg.sql(&exists_query).await?;
        let exists = rows
            .first()
            .map(|row| row.get::<_, bool>("exists"))
            .unwrap_or(false);

        if exists {
            debug!(table = %self.table, "migration table exists, skipping creation");
            return Ok(());
        }

        info!(table = %self.table, "creating migration table");
        let create = crate::sql!(
            "CREATE TABLE IF NOT EXISTS \"" {raw(&self.table)} "\" ("
            "\"id\" int PRIMARY KEY, "
            "\"name\" text NOT NULL, "
            "\"created_at\" timestamptz NOT NULL DEFAULT clock_timestamp()"
            ")"
        );
        self.pg.sql(&create).await?;
        Ok(())
    }

    /// Apply one migration and insert its record, both in one fresh
    /// transaction separate from the lock-holding one.
    async fn apply_one(&self, migration: &Migration) -> Result<()> {
        let label = format!("[{:03}] {}", migration.id, migration.name);
        info!(migration = %label, "applying migration");

        let apply = Arc::clone(&migration.apply);
        let record = crate::sql!(
            "INSERT INTO \"" {raw(&self.table)} "\" (\"id\", \"name\") VALUES ("
            {migration.id} ", " {migration.name.as_str()} ")"
        );

        let result = self
            .pg
            .transaction(|t| async move {
                apply(t.clone()).await?;
                t.sql(&record).await?;
                Ok(())
            })
            .await;

        result.map_err(|err| {
            error!(migration = %label, error = %err, "unable to apply migration");
            PgError::apply(migration.id, migration.name.clone(), err)
        })
    }
}

/// Sort candidates by id and require positive ids, non-empty names and a
/// strictly consecutive sequence (each id one more than its predecessor).
fn validate_sequence(migrations: &[Migration]) -> Result<Vec<Migration>> {
    let mut sorted = migrations.to_vec();
    sorted.sort_by_key(|m| m.id);

    for migration in &sorted {
        if migration.id <= 0 {
            return Err(PgError::SequenceViolation(format!(
                "{:?} has a non-positive id",
                migration
            )));
        }
        if migration.name.is_empty() {
            return Err(PgError::SequenceViolation(format!(
                "migration {} has an empty name",
                migration.id
            )));
        }
    }

    for pair in sorted.windows(2) {
        if pair[1].id != pair[0].id + 1 {
            return Err(PgError::SequenceViolation(format!(
                "ids are not strictly consecutive: {:?} is followed by {:?}",
                pair[0], pair[1]
            )));
        }
    }

    Ok(sorted)
}

/// Position-wise comparison of the applied history against the sorted
/// candidate list. Catches renames, reorders and history that diverged from
/// the source tree.
fn check_history(applied: &[MigrationRecord], candidates: &[Migration]) -> Result<()> {
    for (i, record) in applied.iter().enumerate() {
        let Some(candidate) = candidates.get(i) else {
            return Err(PgError::HistoryMismatch(format!(
                "applied Migration({}, {}) is missing from the migration list",
                record.id, record.name
            )));
        };
        if candidate.id != record.id {
            return Err(PgError::HistoryMismatch(format!(
                "migration #{} expected to be Migration({}, {}), got {:?}",
                i, record.id, record.name, candidate
            )));
        }
        if candidate.name != record.name {
            return Err(PgError::HistoryMismatch(format!(
                "migration #{} name changed: got {:?}, expected Migration({}, {})",
                i, candidate, record.id, record.name
            )));
        }
    }
    Ok(())
}

/// Candidates with an id strictly greater than the last applied id. With no
/// history, everything is pending.
fn pending_suffix(applied: &[MigrationRecord], candidates: Vec<Migration>) -> Vec<Migration> {
    match applied.last() {
        None => candidates,
        Some(last) => candidates.into_iter().filter(|m| m.id > last.id).collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn migration(id: i32, name: &str) -> Migration {
        Migration::new(id, name, |_t| async { Ok(()) })
    }

    fn record(id: i32, name: &str) -> MigrationRecord {
        MigrationRecord {
            id,
            name: name.to_string(),
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_validate_sequence_sorts() {
        let sorted = validate_sequence(&[
            migration(2, "createOrders"),
            migration(1, "createUsers"),
            migration(3, "createRoles"),
        ])
        .unwrap();

        let ids: Vec<i32> = sorted.iter().map(|m| m.id).collect();
        assert_eq!(ids, vec![1, 2, 3]);
    }

    #[test]
    fn test_validate_sequence_empty_is_ok() {
        assert!(validate_sequence(&[]).unwrap().is_empty());
    }

    #[test]
    fn test_validate_sequence_rejects_gap() {
        let err = validate_sequence(&[
            migration(1, "createUsers"),
            migration(2, "createOrders"),
            migration(4, "createRoles"),
        ])
        .unwrap_err();

        assert!(matches!(err, PgError::SequenceViolation(_)));
    }

    #[test]
    fn test_validate_sequence_rejects_duplicate_id() {
        let err =
            validate_sequence(&[migration(1, "createUsers"), migration(1, "createOrders")])
                .unwrap_err();

        assert!(matches!(err, PgError::SequenceViolation(_)));
    }

    #[test]
    fn test_validate_sequence_rejects_non_positive_id() {
        let err = validate_sequence(&[migration(0, "zero")]).unwrap_err();
        assert!(matches!(err, PgError::SequenceViolation(_)));
    }

    #[test]
    fn test_validate_sequence_rejects_empty_name() {
        let err = validate_sequence(&[migration(1, "")]).unwrap_err();
        assert!(matches!(err, PgError::SequenceViolation(_)));
    }

    #[test]
    fn test_validate_sequence_allows_name_clash() {
        let sorted =
            validate_sequence(&[migration(1, "createUsers"), migration(2, "createUsers")])
                .unwrap();
        assert_eq!(sorted.len(), 2);
    }

    #[test]
    fn test_check_history_matches() {
        let applied = vec![record(1, "createUsers"), record(2, "createOrders")];
        let candidates = vec![
            migration(1, "createUsers"),
            migration(2, "createOrders"),
            migration(3, "createRoles"),
        ];

        assert!(check_history(&applied, &candidates).is_ok());
    }

    #[test]
    fn test_check_history_rejects_missing_candidate() {
        let applied = vec![record(1, "createUsers"), record(2, "createOrders")];
        let candidates = vec![migration(1, "createUsers")];

        let err = check_history(&applied, &candidates).unwrap_err();
        assert!(matches!(err, PgError::HistoryMismatch(_)));
    }

    #[test]
    fn test_check_history_rejects_id_shift() {
        // History starts at 1 but the list starts at 2.
        let applied = vec![record(1, "createUsers")];
        let candidates = vec![migration(2, "createOrders")];

        let err = check_history(&applied, &candidates).unwrap_err();
        assert!(matches!(err, PgError::HistoryMismatch(_)));
    }

    #[test]
    fn test_check_history_rejects_rename() {
        let applied = vec![record(1, "createUsers")];
        let candidates = vec![migration(1, "createAccounts")];

        let err = check_history(&applied, &candidates).unwrap_err();
        assert!(matches!(err, PgError::HistoryMismatch(_)));
    }

    #[test]
    fn test_pending_suffix_without_history() {
        let candidates = vec![migration(1, "createUsers"), migration(2, "createOrders")];
        let pending = pending_suffix(&[], candidates);

        assert_eq!(pending.len(), 2);
    }

    #[test]
    fn test_pending_suffix_after_history() {
        let applied = vec![record(1, "createUsers"), record(2, "createOrders")];
        let candidates = vec![
            migration(1, "createUsers"),
            migration(2, "createOrders"),
            migration(3, "createRoles"),
        ];

        let pending = pending_suffix(&applied, candidates);
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id, 3);
    }

    #[test]
    fn test_pending_suffix_fully_applied() {
        let applied = vec![record(1, "createUsers")];
        let candidates = vec![migration(1, "createUsers")];

        assert!(pending_suffix(&applied, candidates).is_empty());
    }
}
