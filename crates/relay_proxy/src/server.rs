//! Accept loop for client connections.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::{TcpListener, TcpStream};

use crate::router::InstanceRouter;
use crate::session::{Session, SessionConfig};

#[derive(Clone)]
pub struct ProxyServer {
    router: Arc<InstanceRouter>,
    config: Arc<SessionConfig>,
}

impl ProxyServer {
    pub fn new(router: Arc<InstanceRouter>, config: SessionConfig) -> Self {
        Self {
            router,
            config: Arc::new(config),
        }
    }

    pub async fn run(self, addr: SocketAddr) -> anyhow::Result<()> {
        let listener = TcpListener::bind(addr).await?;
        tracing::info!(addr = %listener.local_addr()?, "pg listener started");
        self.serve(listener).await
    }

    /// Serve an already bound listener; each connection gets its own task.
    pub async fn serve(self, listener: TcpListener) -> anyhow::Result<()> {
        loop {
            let (socket, peer) = listener.accept().await?;
            let server = self.clone();
            tokio::spawn(async move {
                let connection_id = uuid::Uuid::new_v4().to_string();
                tracing::debug!(%peer, connection_id = %connection_id, "client connected");
                if let Err(err) = server.handle_conn(socket, connection_id.clone()).await {
                    tracing::debug!(error = ?err, %peer, connection_id = %connection_id, "client connection closed");
                }
            });
        }
    }

    async fn handle_conn(&self, socket: TcpStream, connection_id: String) -> anyhow::Result<()> {
        socket.set_nodelay(true)?;
        Session::new(socket, self.router.clone(), self.config.clone(), connection_id)
            .run()
            .await
    }
}
