//! # Transaction Coordinator
//!
//! Client-side driver of the two-stage protocol.
//!
//! ```text
//!  Created ──stage pieces on every node──► Staged ──all Ready──► ReadyToCommit
//!     │                                      │                       │
//!     └──────── any failure / timeout ───────┴──► RolledBack         ▼
//!                                                               Committed
//! ```
//!
//! Pieces are staged concurrently. The decision is sent only after every
//! participant answered, and is the same for all of them. Commits go out
//! concurrently, and only while the earliest `Ready` is younger than the
//! decision window; past it a participant may already have aborted on its
//! own, so the transaction rolls back instead.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use cairn_core::{
    error::{Error, Result},
    config::SessionConfig,
    protocol::{AdminRequest, DataRequest, DataResponse, NodeReport, UniqueIdRequest},
    ObjectKey, Operation, Request, Response, SessionId, TransactionId,
};
use cairn_txn::{InFlightTable, KeyRouter, TransactionState};

use crate::channel::Channel;

/// Sequence on the first node that hands out transaction ids.
pub const TRANSACTION_SEQUENCE: &str = "txn";

/// A participant that answered the staging request.
struct StagedPiece {
    node: usize,
    session: SessionId,
}

pub struct TransactionCoordinator {
    channels: Vec<Arc<dyn Channel>>,
    router: KeyRouter,
    in_flight: InFlightTable,
    /// Longest wait between the first `Ready` and the commit decision.
    decision_window: Duration,
}

impl TransactionCoordinator {
    pub fn new(channels: Vec<Arc<dyn Channel>>) -> Result<Self> {
        let router = KeyRouter::new(channels.len())?;
        Ok(Self {
            channels,
            router,
            in_flight: InFlightTable::new(),
            decision_window: SessionConfig::default().continue_timeout,
        })
    }

    /// Match the window to the nodes' `session.continue_timeout`.
    pub fn with_decision_window(mut self, window: Duration) -> Self {
        self.decision_window = window;
        self
    }

    pub fn decision_window(&self) -> Duration {
        self.decision_window
    }

    pub fn router(&self) -> &KeyRouter {
        &self.router
    }

    pub fn channels(&self) -> &[Arc<dyn Channel>] {
        &self.channels
    }

    /// Transactions that have not reached a decision everywhere.
    pub fn unresolved(&self) -> Vec<(TransactionId, TransactionState)> {
        self.in_flight.unresolved()
    }

    /// Run `operations` atomically across every node they route to.
    pub async fn execute(&self, operations: Vec<Operation>) -> Result<TransactionId> {
        if operations.is_empty() {
            return Err(Error::Protocol {
                message: "a transaction needs at least one operation".to_string(),
            });
        }

        let id = self.next_transaction_id().await?;
        self.in_flight.register(id, &operations)?;
        let pieces = self.router.partition(&operations);
        let participants = pieces.keys().map(|&n| self.channels[n].node_id()).collect();
        self.in_flight.set_participants(id, participants)?;
        debug!("{}: {} operations on {} nodes", id, operations.len(), pieces.len());

        let (staged, failure) = self.stage_all(id, pieces).await;
        let outcome = match failure {
            None => self.commit_all(id, &staged).await,
            Some(reason) => {
                self.abort_all(&staged).await;
                self.in_flight.fail(id, reason.clone())?;
                info!("{} rolled back: {}", id, reason);
                Err(Error::TransactionAborted {
                    transaction_id: id.0,
                    reason,
                })
            }
        };

        for piece in &staged {
            if let Err(e) = self.channels[piece.node].end_session(piece.session).await {
                warn!("{}: failed to close session on node {}: {}", id, piece.node, e);
            }
        }
        self.in_flight.finish(id);
        outcome
    }

    async fn stage_all(
        &self,
        id: TransactionId,
        pieces: BTreeMap<usize, Vec<Operation>>,
    ) -> (Vec<StagedPiece>, Option<String>) {
        let mut tasks = JoinSet::new();
        for (node, operations) in pieces {
            let channel = Arc::clone(&self.channels[node]);
            tasks.spawn(async move {
                let session = match channel.begin_session().await {
                    Ok(session) => session,
                    Err(e) => return (node, None, Err(e)),
                };
                let request = Request::DataAccess(DataRequest::Transaction {
                    transaction_id: id,
                    operations,
                });
                let answer = match channel.call(session, request).await {
                    Ok(responses) => match responses.into_iter().last() {
                        Some(Response::Ready { transaction_id }) if transaction_id == id => {
                            Ok(Instant::now())
                        }
                        Some(Response::Exception(exception)) => Err(exception.into_error()),
                        other => Err(Error::Protocol {
                            message: format!("expected Ready, got {:?}", other),
                        }),
                    },
                    Err(e) => Err(e),
                };
                (node, Some(session), answer)
            });
        }

        let mut staged = Vec::new();
        let mut failure = None;
        let mut first_ready: Option<Instant> = None;
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((node, session, answer)) => {
                    if let Some(session) = session {
                        staged.push(StagedPiece { node, session });
                    }
                    match answer {
                        Ok(at) => {
                            first_ready = Some(first_ready.map_or(at, |t| t.min(at)));
                        }
                        Err(e) => {
                            failure.get_or_insert_with(|| format!("node {}: {}", node, e));
                        }
                    }
                }
                Err(e) => {
                    failure.get_or_insert_with(|| format!("staging task failed: {}", e));
                }
            }
        }

        if failure.is_none() {
            if let Some(waited) = first_ready.map(|t| t.elapsed()) {
                if waited >= self.decision_window {
                    failure = Some(format!(
                        "participants were ready {:?} apart, past the decision window of {:?}",
                        waited, self.decision_window
                    ));
                }
            }
        }
        if failure.is_none() {
            if let Err(e) = self.in_flight.transition(id, TransactionState::Staged) {
                failure = Some(e.to_string());
            }
        }
        (staged, failure)
    }

    async fn commit_all(&self, id: TransactionId, staged: &[StagedPiece]) -> Result<TransactionId> {
        self.in_flight.transition(id, TransactionState::ReadyToCommit)?;

        let mut tasks = JoinSet::new();
        for piece in staged {
            let channel = Arc::clone(&self.channels[piece.node]);
            let (node, session) = (piece.node, piece.session);
            tasks.spawn(async move { (node, channel.continue_session(session, true).await) });
        }

        let mut first_error = None;
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((_, Ok(()))) => {}
                Ok((node, Err(e))) => {
                    error!("{}: commit on node {} failed: {}", id, node, e);
                    first_error.get_or_insert(e);
                }
                Err(e) => {
                    error!("{}: commit task failed: {}", id, e);
                    first_error.get_or_insert(Error::Internal {
                        message: format!("commit task failed: {}", e),
                    });
                }
            }
        }
        if let Some(e) = first_error {
            // stays unresolved in the in-flight table
            return Err(e);
        }

        self.in_flight.transition(id, TransactionState::Committed)?;
        debug!("{} committed on {} nodes", id, staged.len());
        Ok(id)
    }

    async fn abort_all(&self, staged: &[StagedPiece]) {
        for piece in staged {
            let channel = &self.channels[piece.node];
            // a piece that failed to stage has nothing waiting for a decision
            match channel.continue_session(piece.session, false).await {
                Ok(()) | Err(Error::Protocol { .. }) => {}
                Err(e) => warn!("abort on node {} failed: {}", piece.node, e),
            }
        }
    }

    async fn next_transaction_id(&self) -> Result<TransactionId> {
        let request = Request::UniqueId(UniqueIdRequest::Generate {
            name: TRANSACTION_SEQUENCE.to_string(),
            count: 1,
        });
        let responses = self.call_node(0, request).await?;
        responses
            .into_iter()
            .find_map(|r| match r {
                Response::Data(DataResponse::Ids(ids)) => ids.first().copied(),
                _ => None,
            })
            .map(TransactionId)
            .ok_or_else(|| Error::Protocol {
                message: "id service returned no transaction id".to_string(),
            })
    }

    /// One request on a fresh session. An `Exception` becomes an error.
    pub async fn call_node(&self, node: usize, request: Request) -> Result<Vec<Response>> {
        let channel = self.channels.get(node).ok_or_else(|| Error::Protocol {
            message: format!("no node {}", node),
        })?;
        let session = channel.begin_session().await?;
        let result = channel.call(session, request).await;
        channel.end_session(session).await?;

        let mut responses = result?;
        match responses.pop() {
            Some(Response::Exception(exception)) => Err(exception.into_error()),
            Some(last) => {
                responses.push(last);
                Ok(responses)
            }
            None => Ok(responses),
        }
    }

    /// Send the same request to every node, in node order.
    pub async fn broadcast(&self, request: Request) -> Result<Vec<Vec<Response>>> {
        let mut all = Vec::with_capacity(self.channels.len());
        for node in 0..self.channels.len() {
            all.push(self.call_node(node, request.clone()).await?);
        }
        Ok(all)
    }

    pub async fn declare_collection(&self, name: &str) -> Result<()> {
        self.broadcast(Request::Admin(AdminRequest::DeclareCollection {
            name: name.to_string(),
        }))
        .await?;
        Ok(())
    }

    /// Read objects from the nodes that own them. Missing keys are absent
    /// from the result.
    pub async fn get(&self, collection: &str, keys: &[String]) -> Result<Vec<(ObjectKey, Bytes)>> {
        let object_keys: Vec<ObjectKey> = keys
            .iter()
            .map(|k| ObjectKey::new(collection, k.as_str()))
            .collect();

        let mut objects = Vec::new();
        for (node, node_keys) in self.router.partition_keys(&object_keys) {
            let request = Request::DataAccess(DataRequest::Get {
                collection: collection.to_string(),
                keys: node_keys.into_iter().map(|k| k.key).collect(),
            });
            objects.extend(collect_objects(self.call_node(node, request).await?));
        }
        objects.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(objects)
    }

    /// Every live object of a collection across the cluster.
    pub async fn scan_collection(&self, collection: &str) -> Result<Vec<(ObjectKey, Bytes)>> {
        let request = Request::DataAccess(DataRequest::Get {
            collection: collection.to_string(),
            keys: Vec::new(),
        });
        let mut objects: Vec<_> = self
            .broadcast(request)
            .await?
            .into_iter()
            .flat_map(collect_objects)
            .collect();
        objects.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(objects)
    }

    pub async fn analyze(&self) -> Result<Vec<NodeReport>> {
        let reports = self
            .broadcast(Request::Admin(AdminRequest::Analyze))
            .await?
            .into_iter()
            .flatten()
            .filter_map(|r| match r {
                Response::Data(DataResponse::Report(report)) => Some(report),
                _ => None,
            })
            .collect();
        Ok(reports)
    }
}

fn collect_objects(responses: Vec<Response>) -> Vec<(ObjectKey, Bytes)> {
    responses
        .into_iter()
        .filter_map(|r| match r {
            Response::Data(DataResponse::Objects(objects)) => Some(objects),
            _ => None,
        })
        .flatten()
        .collect()
}
