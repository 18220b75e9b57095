//! Per-connection protocol state machine.
//!
//! Answers the startup handshake, then serves simple and extended query
//! messages by classifying the SQL and handing it to the router. After an
//! error in the extended protocol, messages are discarded until `Sync`, as a
//! PostgreSQL server would.

use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use relay_core::{classify, result_columns, QueryDraft, ResultSet};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::Framed;

use crate::codec::{
    command_tag, BackendMessage, BindValue, DescribeTarget, FrontendMessage, PgCodec, TEXT_OID,
};
use crate::params;
use crate::router::{InstanceRouter, RouteOutcome};

#[derive(Clone, Debug)]
pub struct SessionConfig {
    /// Reported to clients as `server_version`.
    pub server_version: String,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            server_version: "15.4".to_string(),
        }
    }
}

/// The statement from the last Parse plus whatever Bind/Describe added.
#[derive(Debug, Default)]
struct ActiveQuery {
    sql: String,
    params: Vec<BindValue>,
    bound: bool,
    /// Result routed early by a portal Describe, consumed by Execute.
    cached: Option<ResultSet>,
}

const SQLSTATE_NO_SYNCED_INSTANCE: &str = "57P03";
const SQLSTATE_ROUTING_FAILED: &str = "58000";
const SQLSTATE_PROTOCOL_VIOLATION: &str = "08P01";
const SQLSTATE_FEATURE_NOT_SUPPORTED: &str = "0A000";

/// Failure to answer a query, reported to the client as an ErrorResponse.
struct QueryError {
    code: &'static str,
    message: String,
}

impl QueryError {
    fn new(code: &'static str, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    fn into_message(self) -> BackendMessage {
        BackendMessage::error(self.code, self.message)
    }
}

pub struct Session<S> {
    framed: Framed<S, PgCodec>,
    router: Arc<InstanceRouter>,
    config: Arc<SessionConfig>,
    connection_id: String,
    active: Option<ActiveQuery>,
    discard_until_sync: bool,
}

impl<S> Session<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(
        stream: S,
        router: Arc<InstanceRouter>,
        config: Arc<SessionConfig>,
        connection_id: String,
    ) -> Self {
        Self {
            framed: Framed::new(stream, PgCodec::new()),
            router,
            config,
            connection_id,
            active: None,
            discard_until_sync: false,
        }
    }

    /// Serve the connection until the client terminates or disconnects.
    pub async fn run(mut self) -> anyhow::Result<()> {
        while let Some(msg) = self.framed.next().await {
            let msg = msg?;
            if !self.handle(msg).await? {
                break;
            }
        }
        tracing::debug!(connection_id = %self.connection_id, "session closed");
        Ok(())
    }

    async fn send(&mut self, msg: BackendMessage) -> anyhow::Result<()> {
        self.framed.feed(msg).await
    }

    async fn flush(&mut self) -> anyhow::Result<()> {
        <Framed<S, PgCodec> as SinkExt<BackendMessage>>::flush(&mut self.framed).await
    }

    /// Returns `false` when the connection should close.
    async fn handle(&mut self, msg: FrontendMessage) -> anyhow::Result<bool> {
        if self.discard_until_sync && !matches!(msg, FrontendMessage::Sync | FrontendMessage::Terminate) {
            return Ok(true);
        }

        match msg {
            FrontendMessage::SslRequest | FrontendMessage::GssEncRequest => {
                self.send(BackendMessage::EncryptionRefused).await?;
                self.flush().await?;
            }
            FrontendMessage::CancelRequest => return Ok(false),
            FrontendMessage::Startup { params, .. } => {
                tracing::debug!(
                    connection_id = %self.connection_id,
                    user = params.get("user").map(String::as_str).unwrap_or(""),
                    database = params.get("database").map(String::as_str).unwrap_or(""),
                    "client startup"
                );
                self.send(BackendMessage::AuthenticationOk).await?;
                let server_version = self.config.server_version.clone();
                for (name, value) in [
                    ("server_version", server_version.as_str()),
                    ("client_encoding", "UTF8"),
                    ("DateStyle", "ISO, MDY"),
                    ("integer_datetimes", "on"),
                    ("standard_conforming_strings", "on"),
                ] {
                    self.send(BackendMessage::ParameterStatus {
                        name: name.to_string(),
                        value: value.to_string(),
                    })
                    .await?;
                }
                self.send(BackendMessage::ReadyForQuery).await?;
                self.flush().await?;
            }
            FrontendMessage::Query(sql) => {
                self.simple_query(&sql).await?;
                self.send(BackendMessage::ReadyForQuery).await?;
                self.flush().await?;
            }
            FrontendMessage::Parse { query, .. } => {
                self.active = Some(ActiveQuery {
                    sql: query,
                    ..ActiveQuery::default()
                });
                self.send(BackendMessage::ParseComplete).await?;
            }
            FrontendMessage::Bind { params, .. } => match self.active.as_mut() {
                Some(active) => {
                    active.params = params;
                    active.bound = true;
                    active.cached = None;
                    self.send(BackendMessage::BindComplete).await?;
                }
                None => {
                    self.fail(QueryError::new(
                        SQLSTATE_PROTOCOL_VIOLATION,
                        "bind without a prepared statement",
                    ))
                    .await?;
                }
            },
            FrontendMessage::Describe { target, .. } => {
                if let Err(err) = self.describe(target).await? {
                    self.fail(err).await?;
                }
            }
            FrontendMessage::Execute { .. } => {
                if let Err(err) = self.execute().await? {
                    self.fail(err).await?;
                }
            }
            FrontendMessage::Close { target, .. } => {
                if target == DescribeTarget::Statement {
                    self.active = None;
                }
                self.send(BackendMessage::CloseComplete).await?;
            }
            FrontendMessage::Sync => {
                self.discard_until_sync = false;
                self.send(BackendMessage::ReadyForQuery).await?;
                self.flush().await?;
            }
            FrontendMessage::Flush => self.flush().await?,
            FrontendMessage::Terminate => return Ok(false),
        }
        Ok(true)
    }

    /// Report an extended-protocol error and skip to the next Sync.
    async fn fail(&mut self, err: QueryError) -> anyhow::Result<()> {
        tracing::debug!(connection_id = %self.connection_id, code = err.code, error = %err.message, "query failed");
        self.send(err.into_message()).await?;
        self.discard_until_sync = true;
        Ok(())
    }

    async fn simple_query(&mut self, sql: &str) -> anyhow::Result<()> {
        if sql.trim().trim_end_matches(';').trim().is_empty() {
            return self.send(BackendMessage::EmptyQueryResponse).await;
        }
        match self.route(sql).await {
            Ok(result) => {
                if !result.columns.is_empty() {
                    self.send(BackendMessage::RowDescription {
                        columns: result.columns.clone(),
                    })
                    .await?;
                }
                self.send_rows(result, sql).await
            }
            Err(err) => {
                tracing::debug!(connection_id = %self.connection_id, code = err.code, error = %err.message, "query failed");
                self.send(err.into_message()).await
            }
        }
    }

    async fn send_rows(&mut self, result: ResultSet, sql: &str) -> anyhow::Result<()> {
        for values in result.rows {
            self.send(BackendMessage::DataRow { values }).await?;
        }
        self.send(BackendMessage::CommandComplete {
            tag: command_tag(sql),
        })
        .await
    }

    async fn route(&self, sql: &str) -> Result<ResultSet, QueryError> {
        let classification = classify(sql);
        let draft = QueryDraft {
            sql: sql.to_string(),
            kind: classification.kind,
            tables: classification.tables,
            connection_id: self.connection_id.clone(),
        };
        match self.router.route(draft).await {
            Ok(RouteOutcome::Rows(result)) => Ok(result),
            Ok(RouteOutcome::NoSyncedInstance) => Err(QueryError::new(
                SQLSTATE_NO_SYNCED_INSTANCE,
                "no synced instance available",
            )),
            Err(err) => {
                tracing::warn!(connection_id = %self.connection_id, error = %format!("{err:#}"), "routing failed");
                Err(QueryError::new(SQLSTATE_ROUTING_FAILED, format!("{err:#}")))
            }
        }
    }

    fn bound_sql(&self) -> Result<String, QueryError> {
        let active = self.active.as_ref().ok_or_else(|| {
            QueryError::new(SQLSTATE_PROTOCOL_VIOLATION, "no prepared statement")
        })?;
        params::substitute(&active.sql, &active.params)
            .map_err(|err| QueryError::new(SQLSTATE_FEATURE_NOT_SUPPORTED, err.to_string()))
    }

    async fn describe(&mut self, target: DescribeTarget) -> anyhow::Result<Result<(), QueryError>> {
        let Some(active) = self.active.as_ref() else {
            return Ok(Err(QueryError::new(
                SQLSTATE_PROTOCOL_VIOLATION,
                "describe without a prepared statement",
            )));
        };

        match target {
            DescribeTarget::Statement => {
                let count = params::placeholder_count(&active.sql);
                let columns = result_columns(&active.sql).unwrap_or_default();
                self.send(BackendMessage::ParameterDescription {
                    type_oids: vec![TEXT_OID; count],
                })
                .await?;
                self.send_description(columns).await?;
            }
            DescribeTarget::Portal => {
                if !active.bound {
                    return Ok(Err(QueryError::new(
                        SQLSTATE_PROTOCOL_VIOLATION,
                        "describe of an unbound portal",
                    )));
                }
                let sql = match self.bound_sql() {
                    Ok(sql) => sql,
                    Err(err) => return Ok(Err(err)),
                };
                let result = match self.route(&sql).await {
                    Ok(result) => result,
                    Err(err) => return Ok(Err(err)),
                };
                let columns = result.columns.clone();
                if let Some(active) = self.active.as_mut() {
                    active.cached = Some(result);
                }
                self.send_description(columns).await?;
            }
        }
        Ok(Ok(()))
    }

    async fn send_description(&mut self, columns: Vec<String>) -> anyhow::Result<()> {
        if columns.is_empty() {
            self.send(BackendMessage::NoData).await
        } else {
            self.send(BackendMessage::RowDescription { columns }).await
        }
    }

    async fn execute(&mut self) -> anyhow::Result<Result<(), QueryError>> {
        let sql = match self.bound_sql() {
            Ok(sql) => sql,
            Err(err) => return Ok(Err(err)),
        };
        let cached = self.active.as_mut().and_then(|active| {
            active.bound = false;
            active.params.clear();
            active.cached.take()
        });
        let result = match cached {
            Some(result) => result,
            None => match self.route(&sql).await {
                Ok(result) => result,
                Err(err) => return Ok(Err(err)),
            },
        };
        self.send_rows(result, &sql).await?;
        Ok(Ok(()))
    }
}
