//! TCP transport: one connection per session.
//!
//! Frame: `u32` little-endian body length, then a MessagePack body.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use cairn_core::{
    config::{NetworkConfig, SessionConfig},
    error::{Error, Result},
    protocol, NodeId, Request, Response, SessionId,
};

use crate::channel::{Channel, SessionTable};
use crate::node::ShardNode;
use crate::session::run_session;

/// Read one frame body. `None` on a clean end of stream.
pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R, max_frame_size: u32) -> Result<Option<Vec<u8>>> {
    let len = match reader.read_u32_le().await {
        Ok(len) => len,
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    if len > max_frame_size {
        return Err(Error::Protocol {
            message: format!("frame of {} bytes exceeds limit {}", len, max_frame_size),
        });
    }
    let mut body = vec![0u8; len as usize];
    reader.read_exact(&mut body).await?;
    Ok(Some(body))
}

pub async fn write_frame<W: AsyncWrite + Unpin>(writer: &mut W, body: &[u8], max_frame_size: u32) -> Result<()> {
    if body.len() > max_frame_size as usize {
        return Err(Error::Protocol {
            message: format!("frame of {} bytes exceeds limit {}", body.len(), max_frame_size),
        });
    }
    writer.write_u32_le(body.len() as u32).await?;
    writer.write_all(body).await?;
    writer.flush().await?;
    Ok(())
}

/// Accepts connections and runs a session for each.
pub struct TcpServer {
    node: Arc<ShardNode>,
    listener: TcpListener,
    max_frame_size: u32,
    queue_capacity: usize,
}

impl TcpServer {
    pub async fn bind(node: Arc<ShardNode>, addr: &str) -> Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        let config = &node.context().config;
        let max_frame_size = config.network.max_frame_size;
        let queue_capacity = config.session.queue_capacity.max(1);
        Ok(Self {
            node,
            listener,
            max_frame_size,
            queue_capacity,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Serve until `shutdown` turns true.
    pub async fn serve(self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        info!("{} listening on {}", self.node.id(), self.local_addr()?);
        loop {
            tokio::select! {
                accepted = self.listener.accept() => {
                    let (stream, peer) = match accepted {
                        Ok(accepted) => accepted,
                        Err(e) => {
                            warn!("accept failed: {}", e);
                            continue;
                        }
                    };
                    let node = Arc::clone(&self.node);
                    let max_frame_size = self.max_frame_size;
                    let queue_capacity = self.queue_capacity;
                    tokio::spawn(async move {
                        if let Err(e) = serve_connection(node, stream, max_frame_size, queue_capacity).await {
                            debug!("connection from {} ended: {}", peer, e);
                        }
                    });
                }
                _ = shutdown.changed() => {
                    info!("{} stopped listening", self.node.id());
                    return Ok(());
                }
            }
        }
    }
}

async fn serve_connection(
    node: Arc<ShardNode>,
    stream: TcpStream,
    max_frame_size: u32,
    queue_capacity: usize,
) -> Result<()> {
    stream.set_nodelay(true)?;
    let (mut reader, mut writer) = stream.into_split();
    let (request_tx, request_rx) = mpsc::channel(queue_capacity);
    let (response_tx, mut response_rx) = mpsc::channel::<Response>(queue_capacity);

    let session = node.next_session_id();
    tokio::spawn(run_session(node, session, request_rx, response_tx));

    let writer_task = tokio::spawn(async move {
        while let Some(response) = response_rx.recv().await {
            let body = protocol::encode(&response)?;
            write_frame(&mut writer, &body, max_frame_size).await?;
        }
        Ok::<_, Error>(())
    });

    let read_result = async {
        while let Some(body) = read_frame(&mut reader, max_frame_size).await? {
            let request: Request = protocol::decode(&body)?;
            if request_tx.send(request).await.is_err() {
                break;
            }
        }
        Ok::<_, Error>(())
    }
    .await;
    // closing the request queue ends the session and then the writer
    drop(request_tx);

    let write_result = writer_task.await.map_err(|e| Error::Internal {
        message: format!("writer task failed: {}", e),
    })?;
    read_result.and(write_result)
}

/// Channel to a remote node, one TCP connection per session.
pub struct TcpChannel {
    node_id: NodeId,
    addr: String,
    sessions: SessionTable,
    next_session: AtomicU64,
    max_frame_size: u32,
    queue_capacity: usize,
}

impl TcpChannel {
    pub fn new(node_id: NodeId, addr: impl Into<String>, network: &NetworkConfig, session: &SessionConfig) -> Self {
        Self {
            node_id,
            addr: addr.into(),
            sessions: SessionTable::new(session.response_timeout),
            next_session: AtomicU64::new(1),
            max_frame_size: network.max_frame_size,
            queue_capacity: session.queue_capacity.max(1),
        }
    }
}

#[async_trait]
impl Channel for TcpChannel {
    fn node_id(&self) -> NodeId {
        self.node_id
    }

    async fn begin_session(&self) -> Result<SessionId> {
        let stream = TcpStream::connect(&self.addr).await.map_err(|e| Error::Io {
            message: format!("cannot connect to {} at {}", self.node_id, self.addr),
            source: e,
        })?;
        stream.set_nodelay(true)?;
        let (mut reader, mut writer) = stream.into_split();
        let (request_tx, mut request_rx) = mpsc::channel::<Request>(self.queue_capacity);
        let (response_tx, response_rx) = mpsc::channel(self.queue_capacity);
        let max_frame_size = self.max_frame_size;

        tokio::spawn(async move {
            while let Some(request) = request_rx.recv().await {
                let sent = match protocol::encode(&request) {
                    Ok(body) => write_frame(&mut writer, &body, max_frame_size).await,
                    Err(e) => Err(e),
                };
                if let Err(e) = sent {
                    warn!("dropping session connection: {}", e);
                    break;
                }
            }
            let _ = writer.shutdown().await;
        });

        tokio::spawn(async move {
            loop {
                let response = match read_frame(&mut reader, max_frame_size).await {
                    Ok(Some(body)) => protocol::decode::<Response>(&body),
                    Ok(None) => break,
                    Err(e) => Err(e),
                };
                match response {
                    Ok(response) => {
                        if response_tx.send(response).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        warn!("bad frame from node: {}", e);
                        break;
                    }
                }
            }
        });

        let session = SessionId(self.next_session.fetch_add(1, Ordering::Relaxed));
        self.sessions.insert(session, request_tx, response_rx);
        Ok(session)
    }

    async fn end_session(&self, session: SessionId) -> Result<()> {
        self.sessions.remove(session);
        Ok(())
    }

    async fn push_request(&self, session: SessionId, request: Request) -> Result<()> {
        self.sessions.push(session, request).await
    }

    async fn get_response(&self, session: SessionId) -> Result<Response> {
        self.sessions.next(session).await
    }

    async fn continue_session(&self, session: SessionId, should_continue: bool) -> Result<()> {
        self.sessions.decide(session, should_continue).await
    }
}
