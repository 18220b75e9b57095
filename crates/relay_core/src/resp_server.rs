//! Minimal Redis-protocol server over a [`MemoryStore`].
//!
//! Serves exactly the commands the tracker uses, which is enough to run a
//! development cluster without an external Redis.

use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use redis_protocol::codec::Resp2;
use redis_protocol::resp2::types::{BytesFrame, Resp2Frame};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::codec::Framed;

use crate::store::{MemoryStore, TrackingStore};

#[derive(Clone, Debug, PartialEq, Eq)]
enum StoreOp {
    Ping,
    Auth { password: String },
    Get { key: String },
    Set { key: String, value: Vec<u8> },
    SAdd { key: String, members: Vec<String> },
    SMembers { key: String },
    SRem { key: String, members: Vec<String> },
    Del { keys: Vec<String> },
}

pub struct RespServerState {
    store: Arc<MemoryStore>,
    password: Option<String>,
}

impl RespServerState {
    pub fn new(store: Arc<MemoryStore>, password: Option<String>) -> Self {
        Self {
            store,
            password: password.filter(|p| !p.is_empty()),
        }
    }
}

pub async fn run(addr: SocketAddr, state: Arc<RespServerState>) -> anyhow::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    tracing::info!(addr = %listener.local_addr()?, "tracking store listening");
    serve(listener, state).await
}

pub async fn serve(listener: TcpListener, state: Arc<RespServerState>) -> anyhow::Result<()> {
    loop {
        let (socket, peer) = listener.accept().await?;
        let state = state.clone();
        tokio::spawn(async move {
            if let Err(err) = handle_conn(socket, state).await {
                tracing::debug!(error = ?err, %peer, "store connection closed");
            }
        });
    }
}

async fn handle_conn(socket: TcpStream, state: Arc<RespServerState>) -> anyhow::Result<()> {
    socket.set_nodelay(true)?;
    let mut framed = Framed::new(socket, Resp2::default());
    let mut authenticated = state.password.is_none();

    while let Some(frame) = framed.next().await {
        let frame = frame?;
        let resp = match parse_command(frame) {
            Ok(None) => continue,
            Ok(Some(StoreOp::Auth { password })) => {
                if state.password.as_deref() == Some(password.as_str()) {
                    authenticated = true;
                    ok()
                } else {
                    BytesFrame::Error("WRONGPASS invalid password".into())
                }
            }
            Ok(Some(_)) if !authenticated => {
                BytesFrame::Error("NOAUTH Authentication required.".into())
            }
            Ok(Some(op)) => match execute(&state.store, op).await {
                Ok(resp) => resp,
                Err(err) => BytesFrame::Error(format!("ERR {err}").into()),
            },
            Err(err) => BytesFrame::Error(format!("ERR {err}").into()),
        };
        framed.send(resp).await?;
    }
    Ok(())
}

fn ok() -> BytesFrame {
    BytesFrame::SimpleString(Bytes::from_static(b"OK"))
}

async fn execute(store: &MemoryStore, op: StoreOp) -> anyhow::Result<BytesFrame> {
    let resp = match op {
        StoreOp::Ping => BytesFrame::SimpleString(Bytes::from_static(b"PONG")),
        StoreOp::Auth { .. } => ok(),
        StoreOp::Get { key } => match store.get(&key).await? {
            Some(value) => BytesFrame::BulkString(Bytes::from(value)),
            None => BytesFrame::Null,
        },
        StoreOp::Set { key, value } => {
            store.set(&key, value).await?;
            ok()
        }
        StoreOp::SAdd { key, members } => {
            let before = store.smembers(&key).await?;
            for member in &members {
                store.sadd(&key, member).await?;
            }
            let added = members
                .iter()
                .filter(|m| !before.contains(*m))
                .collect::<std::collections::BTreeSet<_>>()
                .len();
            BytesFrame::Integer(added as i64)
        }
        StoreOp::SMembers { key } => BytesFrame::Array(
            store
                .smembers(&key)
                .await?
                .into_iter()
                .map(|m| BytesFrame::BulkString(Bytes::from(m)))
                .collect(),
        ),
        StoreOp::SRem { key, members } => {
            let before = store.smembers(&key).await?;
            for member in &members {
                store.srem(&key, member).await?;
            }
            let removed = members.iter().filter(|m| before.contains(*m)).count();
            BytesFrame::Integer(removed as i64)
        }
        StoreOp::Del { keys } => {
            let mut existing = 0;
            for key in &keys {
                if store.contains_key(key) {
                    existing += 1;
                }
            }
            store.del(&keys).await?;
            BytesFrame::Integer(existing)
        }
    };
    Ok(resp)
}

fn parse_command(frame: BytesFrame) -> anyhow::Result<Option<StoreOp>> {
    let BytesFrame::Array(parts) = frame else {
        anyhow::bail!("expected array frame");
    };

    if parts.is_empty() {
        return Ok(None);
    }

    let cmd = frame_str_upper(&parts[0]).ok_or_else(|| anyhow::anyhow!("invalid command"))?;
    let args = &parts[1..];
    match cmd.as_str() {
        "PING" => Ok(Some(StoreOp::Ping)),
        "AUTH" => {
            // AUTH [username] password
            anyhow::ensure!(matches!(args.len(), 1 | 2), "AUTH expects 1 or 2 arguments");
            let password = frame_string(&args[args.len() - 1])?;
            Ok(Some(StoreOp::Auth { password }))
        }
        "GET" => {
            anyhow::ensure!(args.len() == 1, "GET expects 1 argument");
            Ok(Some(StoreOp::Get {
                key: frame_string(&args[0])?,
            }))
        }
        "SET" => {
            anyhow::ensure!(args.len() == 2, "SET expects 2 arguments");
            let value = frame_bytes(&args[1]).ok_or_else(|| anyhow::anyhow!("invalid value"))?;
            Ok(Some(StoreOp::Set {
                key: frame_string(&args[0])?,
                value,
            }))
        }
        "SADD" | "SREM" => {
            anyhow::ensure!(args.len() >= 2, "{cmd} expects at least 2 arguments");
            let key = frame_string(&args[0])?;
            let members = args[1..]
                .iter()
                .map(frame_string)
                .collect::<anyhow::Result<Vec<_>>>()?;
            if cmd == "SADD" {
                Ok(Some(StoreOp::SAdd { key, members }))
            } else {
                Ok(Some(StoreOp::SRem { key, members }))
            }
        }
        "SMEMBERS" => {
            anyhow::ensure!(args.len() == 1, "SMEMBERS expects 1 argument");
            Ok(Some(StoreOp::SMembers {
                key: frame_string(&args[0])?,
            }))
        }
        "DEL" => {
            anyhow::ensure!(!args.is_empty(), "DEL expects at least 1 argument");
            let keys = args
                .iter()
                .map(frame_string)
                .collect::<anyhow::Result<Vec<_>>>()?;
            Ok(Some(StoreOp::Del { keys }))
        }
        other => anyhow::bail!("unknown command {other}"),
    }
}

fn frame_str_upper(frame: &BytesFrame) -> Option<String> {
    frame.as_str().map(|s| s.to_ascii_uppercase())
}

fn frame_bytes(frame: &BytesFrame) -> Option<Vec<u8>> {
    match frame {
        BytesFrame::BulkString(b) | BytesFrame::SimpleString(b) => Some(b.to_vec()),
        _ => None,
    }
}

fn frame_string(frame: &BytesFrame) -> anyhow::Result<String> {
    let bytes = frame_bytes(frame).ok_or_else(|| anyhow::anyhow!("invalid argument"))?;
    String::from_utf8(bytes).map_err(|_| anyhow::anyhow!("argument is not valid UTF-8"))
}
