//! # Channels
//!
//! Client side of the session protocol, independent of the transport.
//!
//! ```text
//!  begin_session ─► push_request ─► get_response* ─┬─► end_session
//!                                                  │
//!                         Ready(txn) ─► continue_session(commit?)
//! ```
//!
//! A logical call may yield several responses; `call` collects them up to
//! the terminal one.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use cairn_core::{
    error::{Error, Result},
    protocol::ContinueRequest,
    NodeId, Request, Response, SessionId, TransactionId,
};

use crate::node::ShardNode;
use crate::session::run_session;

#[async_trait]
pub trait Channel: Send + Sync {
    /// The node on the other end.
    fn node_id(&self) -> NodeId;

    async fn begin_session(&self) -> Result<SessionId>;

    /// Close the session. Anything it still holds on the node is released.
    async fn end_session(&self, session: SessionId) -> Result<()>;

    /// Queue a request without waiting for its answer.
    async fn push_request(&self, session: SessionId, request: Request) -> Result<()>;

    /// Next response of the session, bounded by the response timeout.
    async fn get_response(&self, session: SessionId) -> Result<Response>;

    /// Answer the `Ready` the session last received.
    async fn continue_session(&self, session: SessionId, should_continue: bool) -> Result<()>;

    /// Send one request and collect its responses, terminal one last.
    async fn call(&self, session: SessionId, request: Request) -> Result<Vec<Response>> {
        self.push_request(session, request).await?;
        let mut responses = Vec::new();
        loop {
            let response = self.get_response(session).await?;
            let done = response.is_terminal();
            responses.push(response);
            if done {
                return Ok(responses);
            }
        }
    }
}

/// Both queue ends of one open session.
pub(crate) struct SessionEnds {
    requests: mpsc::Sender<Request>,
    responses: tokio::sync::Mutex<mpsc::Receiver<Response>>,
    pending: Mutex<Option<TransactionId>>,
}

/// Open sessions of one channel.
pub(crate) struct SessionTable {
    sessions: Mutex<HashMap<SessionId, Arc<SessionEnds>>>,
    response_timeout: Duration,
}

impl SessionTable {
    pub(crate) fn new(response_timeout: Duration) -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            response_timeout,
        }
    }

    pub(crate) fn insert(
        &self,
        session: SessionId,
        requests: mpsc::Sender<Request>,
        responses: mpsc::Receiver<Response>,
    ) {
        let ends = SessionEnds {
            requests,
            responses: tokio::sync::Mutex::new(responses),
            pending: Mutex::new(None),
        };
        self.sessions.lock().insert(session, Arc::new(ends));
    }

    fn get(&self, session: SessionId) -> Result<Arc<SessionEnds>> {
        self.sessions
            .lock()
            .get(&session)
            .cloned()
            .ok_or_else(|| Error::Protocol {
                message: format!("{} is not open", session),
            })
    }

    /// Dropping the request sender lets the server side wind down.
    pub(crate) fn remove(&self, session: SessionId) -> bool {
        self.sessions.lock().remove(&session).is_some()
    }

    pub(crate) async fn push(&self, session: SessionId, request: Request) -> Result<()> {
        let ends = self.get(session)?;
        ends.requests.send(request).await.map_err(|_| Error::Protocol {
            message: format!("{} was closed by the node", session),
        })
    }

    pub(crate) async fn next(&self, session: SessionId) -> Result<Response> {
        let ends = self.get(session)?;
        let mut responses = ends.responses.lock().await;
        let response = match tokio::time::timeout(self.response_timeout, responses.recv()).await {
            Ok(Some(response)) => response,
            Ok(None) => {
                return Err(Error::Protocol {
                    message: format!("{} was closed by the node", session),
                })
            }
            Err(_) => {
                return Err(Error::SessionTimeout {
                    message: format!(
                        "no response on {} within {:?}",
                        session, self.response_timeout
                    ),
                })
            }
        };
        if let Response::Ready { transaction_id } = &response {
            *ends.pending.lock() = Some(*transaction_id);
        }
        Ok(response)
    }

    pub(crate) async fn decide(&self, session: SessionId, should_commit: bool) -> Result<()> {
        let ends = self.get(session)?;
        let transaction_id = ends.pending.lock().take().ok_or_else(|| Error::Protocol {
            message: format!("{} has no transaction waiting for a decision", session),
        })?;
        self.push(
            session,
            Request::Continue(ContinueRequest {
                transaction_id,
                should_commit,
            }),
        )
        .await?;
        loop {
            match self.next(session).await? {
                Response::Data(_) => continue,
                Response::Exception(exception) => return Err(exception.into_error()),
                _ => return Ok(()),
            }
        }
    }
}

/// Channel to a node living in the same process.
pub struct InProcessChannel {
    node: Arc<ShardNode>,
    sessions: SessionTable,
    queue_capacity: usize,
}

impl InProcessChannel {
    pub fn new(node: Arc<ShardNode>) -> Self {
        let session = &node.context().config.session;
        let sessions = SessionTable::new(session.response_timeout);
        let queue_capacity = session.queue_capacity.max(1);
        Self {
            node,
            sessions,
            queue_capacity,
        }
    }

    pub fn node(&self) -> &Arc<ShardNode> {
        &self.node
    }
}

#[async_trait]
impl Channel for InProcessChannel {
    fn node_id(&self) -> NodeId {
        self.node.id()
    }

    async fn begin_session(&self) -> Result<SessionId> {
        let session = self.node.next_session_id();
        let (request_tx, request_rx) = mpsc::channel(self.queue_capacity);
        let (response_tx, response_rx) = mpsc::channel(self.queue_capacity);
        tokio::spawn(run_session(
            Arc::clone(&self.node),
            session,
            request_rx,
            response_tx,
        ));
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
