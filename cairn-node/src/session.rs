//! Server side of one session: a request queue in, a response queue out.
//!
//! After a `Ready` answer the session only accepts the matching `Continue`.
//! If none arrives within the continue timeout the staged transaction is
//! aborted and its locks are released.

use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, warn};

use cairn_core::{
    error::Error,
    protocol::{ContinueRequest, ExceptionResponse},
    Request, Response, SessionId, TransactionId,
};

use crate::node::ShardNode;

pub async fn run_session(
    node: Arc<ShardNode>,
    session: SessionId,
    mut requests: mpsc::Receiver<Request>,
    responses: mpsc::Sender<Response>,
) {
    let continue_timeout = node.context().config.session.continue_timeout;
    node.context().metrics.session_opened();
    debug!("{} opened {}", node.id(), session);

    let mut pending: Option<TransactionId> = None;
    loop {
        let next = match pending {
            None => requests.recv().await,
            Some(transaction_id) => match tokio::time::timeout(continue_timeout, requests.recv()).await {
                Ok(next) => next,
                Err(_) => {
                    warn!(
                        "{} {}: no decision for {} within {:?}, aborting",
                        node.id(),
                        session,
                        transaction_id,
                        continue_timeout
                    );
                    abort(&node, transaction_id);
                    pending = None;
                    continue;
                }
            },
        };
        let Some(request) = next else {
            break;
        };

        let answer = match (pending, &request) {
            (Some(expected), Request::Continue(ContinueRequest { transaction_id, .. }))
                if *transaction_id != expected =>
            {
                abort(&node, expected);
                Some(protocol_error(format!(
                    "expected a decision for {}, got one for {}",
                    expected, transaction_id
                )))
            }
            (Some(_), Request::Continue(_)) => None,
            (Some(expected), _) => {
                abort(&node, expected);
                Some(protocol_error(format!(
                    "{} is waiting for a commit decision on {}",
                    session, expected
                )))
            }
            (None, _) => None,
        };

        let answers = match answer {
            Some(exception) => vec![exception],
            None => node.dispatch(session, request).await,
        };
        pending = match answers.last() {
            Some(Response::Ready { transaction_id }) => Some(*transaction_id),
            _ => None,
        };

        let mut closed = false;
        for response in answers {
            if responses.send(response).await.is_err() {
                closed = true;
                break;
            }
        }
        if closed {
            break;
        }
    }

    if let Some(transaction_id) = pending {
        abort(&node, transaction_id);
    }
    node.end_session(session);
    node.context().metrics.session_closed();
    debug!("{} closed {}", node.id(), session);
}

fn abort(node: &ShardNode, transaction_id: TransactionId) {
    if let Err(e) = node.continue_transaction(transaction_id, false) {
        warn!("{} failed to abort {}: {}", node.id(), transaction_id, e);
    }
}

fn protocol_error(message: String) -> Response {
    Response::Exception(ExceptionResponse::from_error(
        &Error::Protocol { message },
        Vec::new(),
    ))
}
