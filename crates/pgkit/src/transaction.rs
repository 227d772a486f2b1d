//! Transaction scope bound to exactly one lazily acquired connection.

use crate::error::{PgError, Result};
use crate::sql::SqlFragment;
use deadpool_postgres::{Object, Pool};
use futures::future::BoxFuture;
use std::fmt;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio_postgres::types::ToSql;
use tokio_postgres::Row;
use tracing::debug;

/// Transaction isolation levels. `ReadCommitted` is the server default and
/// issues no extra statement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IsolationLevel {
    ReadUncommitted,
    ReadCommitted,
    RepeatableRead,
    Serializable,
}

impl IsolationLevel {
    pub fn as_sql(&self) -> &'static str {
        match self {
            IsolationLevel::ReadUncommitted => "READ UNCOMMITTED",
            IsolationLevel::ReadCommitted => "READ COMMITTED",
            IsolationLevel::RepeatableRead => "REPEATABLE READ",
            IsolationLevel::Serializable => "SERIALIZABLE",
        }
    }
}

/// Options for an explicit transaction scope.
#[derive(Debug, Clone, Copy, Default)]
pub struct TxOptions {
    pub isolation: Option<IsolationLevel>,
}

impl TxOptions {
    pub fn isolation(level: IsolationLevel) -> Self {
        TxOptions {
            isolation: Some(level),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TxState {
    NotStarted,
    Active,
    Committed,
    RolledBack,
}

struct TxCore {
    state: TxState,
    client: Option<Object>,
}

struct TxInner {
    pool: Pool,
    options: TxOptions,
    core: Mutex<TxCore>,
}

/// A transaction scope. Cheap to clone; all clones share the single
/// underlying connection.
///
/// The physical connection is acquired lazily on the first statement and
/// `BEGIN` is issued as part of that acquisition. Concurrent first callers
/// serialize on the internal lock and end up on the same connection, so a
/// scope never holds more than one connection. If `BEGIN` fails the scope
/// never becomes active and commit/rollback are no-ops.
#[derive(Clone)]
pub struct Transaction {
    inner: Arc<TxInner>,
}

impl Transaction {
    pub(crate) fn new(pool: Pool, options: TxOptions) -> Self {
        Transaction {
            inner: Arc::new(TxInner {
                pool,
                options,
                core: Mutex::new(TxCore {
                    state: TxState::NotStarted,
                    client: None,
                }),
            }),
        }
    }

    /// Run `f` against the transaction's connection, acquiring it (and
    /// issuing `BEGIN`) on first use.
    pub async fn connect<T, F>(&self, f: F) -> Result<T>
    where
        F: for<'c> FnOnce(&'c tokio_postgres::Client) -> BoxFuture<'c, Result<T>>,
    {
        let mut core = self.inner.core.lock().await;
        self.ensure_active(&mut core).await?;
        let Some(client) = core.client.as_ref() else {
            return Err(PgError::Internal(
                "transaction active without a connection".to_string(),
            ));
        };
        f(client).await
    }

    /// Execute one statement in this transaction and return its rows.
    pub async fn query(&self, text: &str, params: &[&(dyn ToSql + Sync)]) -> Result<Vec<Row>> {
        let mut core = self.inner.core.lock().await;
        self.ensure_active(&mut core).await?;
        let Some(client) = core.client.as_ref() else {
            return Err(PgError::Internal(
                "transaction active without a connection".to_string(),
            ));
        };
        Ok(client.query(text, params).await?)
    }

    /// Execute a built fragment in this transaction and return its rows.
    pub async fn sql(&self, fragment: &SqlFragment) -> Result<Vec<Row>> {
        self.query(fragment.text(), &fragment.params()).await
    }

    /// Commit if the scope ever became active, then release the connection.
    /// A scope that never ran a statement commits as a no-op.
    pub async fn commit(&self) -> Result<()> {
        let client = {
            let mut core = self.inner.core.lock().await;
            match core.state {
                TxState::Committed | TxState::RolledBack => return Ok(()),
                TxState::NotStarted => {
                    core.state = TxState::Committed;
                    return Ok(());
                }
                TxState::Active => {
                    core.state = TxState::Committed;
                    core.client.take()
                }
            }
        };

        if let Some(client) = client {
            // The client goes back to the pool when dropped, even on error.
            client.batch_execute("COMMIT").await?;
        }
        Ok(())
    }

    /// Roll back if the scope ever became active, then release the connection.
    pub async fn rollback(&self) -> Result<()> {
        let client = {
            let mut core = self.inner.core.lock().await;
            match core.state {
                TxState::Committed | TxState::RolledBack => return Ok(()),
                TxState::NotStarted => {
                    core.state = TxState::RolledBack;
                    return Ok(());
                }
                TxState::Active => {
                    core.state = TxState::RolledBack;
                    core.client.take()
                }
            }
        };

        if let Some(client) = client {
            client.batch_execute("ROLLBACK").await?;
        }
        Ok(())
    }

    async fn ensure_active(&self, core: &mut TxCore) -> Result<()> {
        match core.state {
            TxState::Committed | TxState::RolledBack => Err(PgError::TransactionClosed),
            TxState::Active => Ok(()),
            TxState::NotStarted => {
                let client = self.inner.pool.get().await?;
                client.batch_execute("BEGIN").await?;

                if let Some(level) = self.inner.options.isolation {
                    if level != IsolationLevel::ReadCommitted {
                        let set = format!("SET TRANSACTION ISOLATION LEVEL {}", level.as_sql());
                        if let Err(err) = client.batch_execute(&set).await {
                            // Close out the opened transaction so the
                            // connection goes back to the pool clean.
                            let _ = client.batch_execute("ROLLBACK").await;
                            return Err(err.into());
                        }
                    }
                }

                debug!(isolation = ?self.inner.options.isolation, "transaction started");
                core.client = Some(client);
                core.state = TxState::Active;
                Ok(())
            }
        }
    }
}

impl fmt::Debug for Transaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transaction").finish_non_exhaustive()
    }
}
