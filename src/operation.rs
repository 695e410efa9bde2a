//! Typed operations and their queue semantics.
//!
//! Every server interaction is an operation: enqueued by the scheduler,
//! started once no earlier operation shares its conflict signature, and
//! finished when its response arrives. A started operation re-sends its
//! exact request (same closure, same payload) on timeout and after a
//! reconnect, so retries are idempotent from the server's point of view.

use tokio::sync::oneshot;
use uuid::Uuid;

use crate::acl::Acl;
use crate::error::ClientError;
use crate::key::KeyExpr;
use crate::protocol::Request;

pub(crate) type OperationId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ActionKind {
    Publish,
    Subscribe,
    Unsubscribe,
    GetAcls,
    Advance,
    Fetch,
}

/// What an operation does, with its variant-specific request parameters.
#[derive(Debug, Clone)]
pub(crate) enum Action {
    Publish {
        key: KeyExpr,
        data: Option<String>,
        delete_path: bool,
        acl: Option<Acl>,
        cts: u64,
    },
    Subscribe {
        key: KeyExpr,
    },
    Unsubscribe {
        key: KeyExpr,
    },
    GetAcls,
    /// `rvts` is snapshotted from the sync state when the operation starts,
    /// not when it is enqueued.
    Advance {
        pattern: KeyExpr,
        rvts: u64,
    },
    Fetch {
        pattern: KeyExpr,
        vts: Vec<u64>,
        rvts_prime: u64,
    },
}

impl Action {
    pub fn kind(&self) -> ActionKind {
        match self {
            Action::Publish { .. } => ActionKind::Publish,
            Action::Subscribe { .. } => ActionKind::Subscribe,
            Action::Unsubscribe { .. } => ActionKind::Unsubscribe,
            Action::GetAcls => ActionKind::GetAcls,
            Action::Advance { .. } => ActionKind::Advance,
            Action::Fetch { .. } => ActionKind::Fetch,
        }
    }

    /// The key this operation is serialized on, if any.
    pub fn key(&self) -> Option<&KeyExpr> {
        match self {
            Action::Publish { key, .. }
            | Action::Subscribe { key }
            | Action::Unsubscribe { key } => Some(key),
            Action::GetAcls => None,
            Action::Advance { pattern, .. } | Action::Fetch { pattern, .. } => Some(pattern),
        }
    }

    pub fn build_request(&self) -> Request {
        match self {
            Action::Publish {
                key,
                data,
                delete_path,
                acl,
                cts,
            } => Request::Pub {
                path: key.components().to_vec(),
                delete_path: *delete_path,
                cts: *cts,
                data: data.clone(),
                assume_acl: *acl,
            },
            Action::Subscribe { key } => Request::Sub {
                path: key.components().to_vec(),
            },
            Action::Unsubscribe { key } => Request::Unsub {
                path: key.components().to_vec(),
            },
            Action::GetAcls => Request::GetAcls {},
            Action::Advance { pattern, rvts } => Request::Advance {
                pattern: pattern.components().to_vec(),
                rvts: *rvts,
            },
            Action::Fetch { vts, .. } => Request::Fetch { vts: vts.clone() },
        }
    }
}

/// The single completion handle an operation closes over.
#[derive(Debug)]
pub(crate) enum Completion {
    None,
    Ack(oneshot::Sender<Result<(), ClientError>>),
    Acls(oneshot::Sender<Result<Vec<String>, ClientError>>),
}

impl Completion {
    pub fn resolve_ack(self, result: Result<(), ClientError>) {
        match self {
            Completion::None => {}
            Completion::Ack(tx) => {
                let _ = tx.send(result);
            }
            Completion::Acls(tx) => {
                let _ = tx.send(result.map(|_| Vec::new()));
            }
        }
    }

    pub fn resolve_acls(self, result: Result<Vec<String>, ClientError>) {
        match self {
            Completion::None => {}
            Completion::Ack(tx) => {
                let _ = tx.send(result.map(|_| ()));
            }
            Completion::Acls(tx) => {
                let _ = tx.send(result);
            }
        }
    }
}

#[derive(Debug)]
pub(crate) struct Operation {
    pub id: OperationId,
    /// Correlation id; stable across re-sends.
    pub closure: String,
    pub action: Action,
    pub started: bool,
    /// The encoded frame captured at start and replayed verbatim.
    pub encoded: Option<String>,
    pub completion: Completion,
}

impl Operation {
    pub fn new(id: OperationId, action: Action, completion: Completion) -> Self {
        Self {
            id,
            closure: Uuid::new_v4().to_string(),
            action,
            started: false,
            encoded: None,
            completion,
        }
    }

    /// Conflict signature: operations sharing it execute in FIFO order.
    pub fn signature(&self) -> (ActionKind, Option<&str>) {
        (
            self.action.kind(),
            self.action.key().map(KeyExpr::as_str),
        )
    }
}
