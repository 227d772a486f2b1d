//! Pooled connections with master/replica routing.

use crate::config::{NodeConfig, PgOptions};
use crate::error::{PgError, Result};
use crate::sql::SqlFragment;
use crate::transaction::{Transaction, TxOptions};
use async_trait::async_trait;
use deadpool_postgres::{Manager, ManagerConfig, Object, Pool, RecyclingMethod};
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio_postgres::types::ToSql;
use tokio_postgres::{NoTls, Row};
use tracing::{debug, warn};

/// A connection checked out from a node's pool. Dropping it returns the
/// connection to the pool.
pub type PooledClient = Object;

/// Anything that can execute a built statement: a pool node or an open
/// transaction. Lets callers write helpers that run either inside or outside
/// a transaction.
#[async_trait]
pub trait Querier: Send + Sync {
    async fn rows(&self, fragment: &SqlFragment) -> Result<Vec<Row>>;
}

/// One physical connection pool against a single database node.
#[derive(Clone)]
pub struct PgNode {
    pool: Pool,
    name: Arc<str>,
}

impl PgNode {
    /// Build a pool for one node. The pool is lazy; no connection is opened
    /// until first use. Broken idle connections are detected and discarded
    /// by the pool's recycle check at checkout.
    pub fn from_config(
        config: &NodeConfig,
        application_name: Option<&str>,
        name: &str,
    ) -> Result<Self> {
        let pg_config = config.to_pg_config(application_name)?;

        let mgr_config = ManagerConfig {
            recycling_method: RecyclingMethod::Fast,
        };
        let mgr = Manager::from_config(pg_config, NoTls, mgr_config);
        let pool = Pool::builder(mgr)
            .max_size(config.max_connections())
            .build()
            .map_err(|e| PgError::Config(format!("failed to build pool: {}", e)))?;

        debug!(node = name, max_size = config.max_connections(), "pool created");

        Ok(PgNode {
            pool,
            name: Arc::from(name),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Check out one connection, run `f` with it, and return it to the pool
    /// when the closure's client handle drops, regardless of outcome.
    pub async fn connect<T, F, Fut>(&self, f: F) -> Result<T>
    where
        F: FnOnce(PooledClient) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let client = self.pool.get().await?;
        f(client).await
    }

    /// Execute exactly one statement and return its rows.
    pub async fn query(&self, text: &str, params: &[&(dyn ToSql + Sync)]) -> Result<Vec<Row>> {
        let client = self.pool.get().await?;
        Ok(client.query(text, params).await?)
    }

    /// Execute a built fragment and return its rows.
    pub async fn sql(&self, fragment: &SqlFragment) -> Result<Vec<Row>> {
        self.query(fragment.text(), &fragment.params()).await
    }

    /// Run `f` inside a transaction: commit on `Ok`, roll back on `Err`. The
    /// underlying connection is acquired lazily on the first statement inside
    /// `f` and is always released exactly once afterward.
    pub async fn transaction<T, F, Fut>(&self, f: F) -> Result<T>
    where
        F: FnOnce(Transaction) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.transaction_with(TxOptions::default(), f).await
    }

    /// Like [`transaction`](Self::transaction) with explicit options.
    pub async fn transaction_with<T, F, Fut>(&self, options: TxOptions, f: F) -> Result<T>
    where
        F: FnOnce(Transaction) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let tx = Transaction::new(self.pool.clone(), options);

        match f(tx.clone()).await {
            Ok(value) => {
                tx.commit().await?;
                Ok(value)
            }
            Err(error) => {
                if let Err(rollback_error) = tx.rollback().await {
                    // The original error is the one the caller needs.
                    warn!(error = %rollback_error, "rollback failed");
                }
                Err(error)
            }
        }
    }

    /// Probe the node with a trivial statement.
    pub async fn check(&self) -> Result<()> {
        let client = self.pool.get().await?;
        client.simple_query("SELECT 1").await?;
        Ok(())
    }

    /// Close the pool. Outstanding connections are dropped on return.
    pub fn close(&self) {
        self.pool.close();
    }
}

#[async_trait]
impl Querier for PgNode {
    async fn rows(&self, fragment: &SqlFragment) -> Result<Vec<Row>> {
        self.sql(fragment).await
    }
}

#[async_trait]
impl Querier for Transaction {
    async fn rows(&self, fragment: &SqlFragment) -> Result<Vec<Row>> {
        self.sql(fragment).await
    }
}

/// Master pool plus zero or more read replicas.
///
/// All writes and explicit transactions go to the master; [`Pg::readonly`]
/// rotates read-only convenience calls across the master and the replicas.
/// The rotation counter is owned by this instance, not process-global.
pub struct Pg {
    master: PgNode,
    replicas: Vec<PgNode>,
    nodes: Vec<PgNode>,
    counter: AtomicUsize,
}

impl Pg {
    pub fn new(options: PgOptions) -> Result<Self> {
        let application_name = options.application_name.as_deref();
        let master = PgNode::from_config(&options.master, application_name, "master")?;

        let mut replicas = Vec::new();
        for (i, node_config) in options.replica_nodes().iter().enumerate() {
            replicas.push(PgNode::from_config(
                node_config,
                application_name,
                &format!("replica-{}", i),
            )?);
        }

        let mut nodes = vec![master.clone()];
        nodes.extend(replicas.iter().cloned());

        Ok(Pg {
            master,
            replicas,
            nodes,
            counter: AtomicUsize::new(0),
        })
    }

    /// Shorthand for a master-only pool from a connection URL.
    pub fn from_url(url: &str) -> Result<Self> {
        Pg::new(PgOptions::from_url(url))
    }

    pub fn master(&self) -> &PgNode {
        &self.master
    }

    pub fn replicas(&self) -> &[PgNode] {
        &self.replicas
    }

    /// The next node for a read-only call, round-robin over the master and
    /// all replicas. With no replicas configured this is always the master.
    pub fn readonly(&self) -> &PgNode {
        let i = self.counter.fetch_add(1, Ordering::Relaxed);
        &self.nodes[i % self.nodes.len()]
    }

    pub async fn connect<T, F, Fut>(&self, f: F) -> Result<T>
    where
        F: FnOnce(PooledClient) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.master.connect(f).await
    }

    pub async fn query(&self, text: &str, params: &[&(dyn ToSql + Sync)]) -> Result<Vec<Row>> {
        self.master.query(text, params).await
    }

    pub async fn sql(&self, fragment: &SqlFragment) -> Result<Vec<Row>> {
        self.master.sql(fragment).await
    }

    pub async fn transaction<T, F, Fut>(&self, f: F) -> Result<T>
    where
        F: FnOnce(Transaction) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.master.transaction(f).await
    }

    pub async fn transaction_with<T, F, Fut>(&self, options: TxOptions, f: F) -> Result<T>
    where
        F: FnOnce(Transaction) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.master.transaction_with(options, f).await
    }

    /// Probe every node.
    pub async fn check(&self) -> Result<()> {
        for node in &self.nodes {
            node.check().await?;
        }
        Ok(())
    }

    /// Close every pool.
    pub fn close(&self) {
        for node in &self.nodes {
            node.close();
        }
    }
}

#[async_trait]
impl Querier for Pg {
    async fn rows(&self, fragment: &SqlFragment) -> Result<Vec<Row>> {
        self.master.sql(fragment).await
    }
}
