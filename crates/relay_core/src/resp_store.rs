//! Tracking store backed by a Redis-protocol server.
//!
//! Connections are pooled: a command takes an idle connection (or dials a new
//! one), runs one request/response round trip under a deadline and returns the
//! connection to the pool only if the round trip completed.

use std::collections::BTreeSet;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use redis_protocol::codec::Resp2;
use redis_protocol::resp2::types::{BytesFrame, Resp2Frame};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::time;
use tokio_util::codec::Framed;

use crate::store::TrackingStore;

type Conn = Framed<TcpStream, Resp2>;

#[derive(Clone, Debug)]
pub struct RespStoreConfig {
    /// `host:port` of the store.
    pub addr: String,
    pub password: Option<String>,
    /// Deadline for dialing and for each command round trip.
    pub command_timeout: Duration,
    /// Idle connections kept for reuse.
    pub max_idle: usize,
}

impl RespStoreConfig {
    pub fn new(addr: impl Into<String>) -> Self {
        Self {
            addr: addr.into(),
            password: None,
            command_timeout: Duration::from_secs(2),
            max_idle: 16,
        }
    }
}

pub struct RespStore {
    config: RespStoreConfig,
    idle: Mutex<Vec<Conn>>,
}

impl RespStore {
    pub fn new(config: RespStoreConfig) -> Self {
        Self {
            config,
            idle: Mutex::new(Vec::new()),
        }
    }

    /// Check that the store answers `PING`.
    pub async fn ping(&self) -> anyhow::Result<()> {
        match self.command(vec![Bytes::from_static(b"PING")]).await? {
            BytesFrame::SimpleString(_) | BytesFrame::BulkString(_) => Ok(()),
            other => anyhow::bail!("unexpected PING reply: {other:?}"),
        }
    }

    async fn dial(&self) -> anyhow::Result<Conn> {
        let addr = self.config.addr.as_str();
        let stream = time::timeout(self.config.command_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| anyhow::anyhow!("connect to tracking store {addr} timed out"))?
            .with_context(|| format!("connect to tracking store {addr}"))?;
        stream.set_nodelay(true)?;
        let mut conn = Framed::new(stream, Resp2::default());

        if let Some(password) = self.config.password.as_deref().filter(|p| !p.is_empty()) {
            let auth = command_frame(vec![
                Bytes::from_static(b"AUTH"),
                Bytes::from(password.to_string()),
            ]);
            let reply = time::timeout(self.config.command_timeout, round_trip(&mut conn, auth))
                .await
                .map_err(|_| anyhow::anyhow!("tracking store AUTH timed out"))??;
            if let BytesFrame::Error(msg) = reply {
                anyhow::bail!("tracking store rejected AUTH: {msg}");
            }
        }
        tracing::debug!(addr, "tracking store connection opened");
        Ok(conn)
    }

    async fn command(&self, args: Vec<Bytes>) -> anyhow::Result<BytesFrame> {
        let pooled = self.idle.lock().await.pop();
        let mut conn = match pooled {
            Some(conn) => conn,
            None => self.dial().await?,
        };

        let request = command_frame(args);
        let reply = time::timeout(self.config.command_timeout, round_trip(&mut conn, request))
            .await
            .map_err(|_| anyhow::anyhow!("tracking store command timed out"))??;

        {
            let mut idle = self.idle.lock().await;
            if idle.len() < self.config.max_idle {
                idle.push(conn);
            }
        }

        if let BytesFrame::Error(msg) = reply {
            anyhow::bail!("tracking store error: {msg}");
        }
        Ok(reply)
    }
}

fn command_frame(args: Vec<Bytes>) -> BytesFrame {
    BytesFrame::Array(args.into_iter().map(BytesFrame::BulkString).collect())
}

async fn round_trip(conn: &mut Conn, request: BytesFrame) -> anyhow::Result<BytesFrame> {
    conn.send(request).await?;
    let reply = conn
        .next()
        .await
        .ok_or_else(|| anyhow::anyhow!("tracking store closed the connection"))??;
    Ok(reply)
}

fn arg(value: &str) -> Bytes {
    Bytes::from(value.to_string())
}

fn expect_integer(reply: BytesFrame, cmd: &str) -> anyhow::Result<i64> {
    match reply {
        BytesFrame::Integer(n) => Ok(n),
        other => anyhow::bail!("unexpected {cmd} reply: {other:?}"),
    }
}

#[async_trait]
impl TrackingStore for RespStore {
    async fn get(&self, key: &str) -> anyhow::Result<Option<Vec<u8>>> {
        match self.command(vec![Bytes::from_static(b"GET"), arg(key)]).await? {
            BytesFrame::Null => Ok(None),
            BytesFrame::BulkString(value) | BytesFrame::SimpleString(value) => {
                Ok(Some(value.to_vec()))
            }
            other => anyhow::bail!("unexpected GET reply: {other:?}"),
        }
    }

    async fn set(&self, key: &str, value: Vec<u8>) -> anyhow::Result<()> {
        let reply = self
            .command(vec![Bytes::from_static(b"SET"), arg(key), Bytes::from(value)])
            .await?;
        match reply {
            BytesFrame::SimpleString(_) => Ok(()),
            other => anyhow::bail!("unexpected SET reply: {other:?}"),
        }
    }

    async fn sadd(&self, key: &str, member: &str) -> anyhow::Result<()> {
        let reply = self
            .command(vec![Bytes::from_static(b"SADD"), arg(key), arg(member)])
            .await?;
        expect_integer(reply, "SADD").map(|_| ())
    }

    async fn smembers(&self, key: &str) -> anyhow::Result<BTreeSet<String>> {
        let reply = self
            .command(vec![Bytes::from_static(b"SMEMBERS"), arg(key)])
            .await?;
        let BytesFrame::Array(items) = reply else {
            anyhow::bail!("unexpected SMEMBERS reply: {reply:?}");
        };
        items
            .iter()
            .map(|item| {
                item.as_str()
                    .map(str::to_string)
                    .ok_or_else(|| anyhow::anyhow!("non-text set member: {item:?}"))
            })
            .collect()
    }

    async fn srem(&self, key: &str, member: &str) -> anyhow::Result<()> {
        let reply = self
            .command(vec![Bytes::from_static(b"SREM"), arg(key), arg(member)])
            .await?;
        expect_integer(reply, "SREM").map(|_| ())
    }

    async fn del(&self, keys: &[String]) -> anyhow::Result<()> {
        if keys.is_empty() {
            return Ok(());
        }
        let mut args = Vec::with_capacity(keys.len() + 1);
        args.push(Bytes::from_static(b"DEL"));
        args.extend(keys.iter().map(|k| arg(k)));
        let reply = self.command(args).await?;
        expect_integer(reply, "DEL").map(|_| ())
    }
}
