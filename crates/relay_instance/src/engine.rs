//! Storage engines an instance executes queries against.

use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use relay_core::ResultSet;
use tokio::sync::Mutex;
use tokio_postgres::{Client, NoTls, SimpleQueryMessage};

/// "Execute SQL, return rows" over whatever database backs this instance.
#[async_trait]
pub trait StorageEngine: Send + Sync + 'static {
    async fn execute(&self, sql: &str) -> anyhow::Result<ResultSet>;

    /// Probe the engine with a trivial statement.
    async fn health_check(&self) -> anyhow::Result<()> {
        self.execute("SELECT 1").await.map(|_| ())
    }
}

/// PostgreSQL engine using the simple-query protocol, so every value comes
/// back as text.
pub struct PostgresEngine {
    url: String,
    client: Mutex<Option<Arc<Client>>>,
}

impl PostgresEngine {
    /// The connection is opened lazily and reopened after it drops.
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            client: Mutex::new(None),
        }
    }

    async fn client(&self) -> anyhow::Result<Arc<Client>> {
        let mut slot = self.client.lock().await;
        if let Some(client) = slot.as_ref().filter(|c| !c.is_closed()) {
            return Ok(client.clone());
        }

        let (client, connection) = tokio_postgres::connect(&self.url, NoTls)
            .await
            .context("connect to storage database")?;
        tokio::spawn(async move {
            if let Err(err) = connection.await {
                tracing::warn!(error = ?err, "storage database connection closed");
            }
        });
        tracing::info!("storage database connected");
        let client = Arc::new(client);
        *slot = Some(client.clone());
        Ok(client)
    }
}

#[async_trait]
impl StorageEngine for PostgresEngine {
    async fn execute(&self, sql: &str) -> anyhow::Result<ResultSet> {
        let client = self.client().await?;
        let messages = client.simple_query(sql).await?;
        Ok(collect_rows(messages))
    }
}

/// Keep the rows of the last statement that produced a row description.
fn collect_rows(messages: Vec<SimpleQueryMessage>) -> ResultSet {
    let mut result = ResultSet::empty();
    for message in messages {
        match message {
            SimpleQueryMessage::RowDescription(columns) => {
                result = ResultSet {
                    columns: columns.iter().map(|c| c.name().to_string()).collect(),
                    rows: Vec::new(),
                };
            }
            SimpleQueryMessage::Row(row) => {
                if result.columns.is_empty() {
                    result.columns = row.columns().iter().map(|c| c.name().to_string()).collect();
                }
                let values = (0..row.len())
                    .map(|idx| row.get(idx).map(str::to_string))
                    .collect();
                result.rows.push(values);
            }
            _ => {}
        }
    }
    result
}
