//! The scheduler: a single task owning the operation queue, the listener
//! registry, and the sync state.
//!
//! Facades talk to it over a command channel; the transport feeds it
//! session events and inbound frames; timers post internal events. All
//! state mutation happens on this task, so conflict checks, queue moves,
//! and sync-state updates never race.

use std::collections::HashMap;

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, trace, warn};
use uuid::Uuid;

use crate::acl::Acl;
use crate::config::Config;
use crate::error::ClientError;
use crate::key::KeyExpr;
use crate::operation::{Action, Completion, Operation, OperationId};
use crate::protocol::{self, Response, Value};
use crate::transport::{AuthParams, SessionInfo, TransportEvent, TransportHandle};

use super::sync::{SyncState, rvts_slot};
use super::{AuthData, ListenerEvent};

/// Requests from the `App`/`Key` facades.
pub(crate) enum Command {
    Authenticate {
        provider: String,
        token: String,
        reply: oneshot::Sender<Result<AuthData, ClientError>>,
    },
    Unauth {
        reply: oneshot::Sender<Result<(), ClientError>>,
    },
    Publish {
        key: KeyExpr,
        data: Option<String>,
        delete_path: bool,
        acl: Option<Acl>,
        reply: oneshot::Sender<Result<(), ClientError>>,
    },
    FetchAcls {
        reply: oneshot::Sender<Result<Vec<String>, ClientError>>,
    },
    Listen {
        key_id: Uuid,
        pattern: KeyExpr,
        sink: mpsc::UnboundedSender<ListenerEvent>,
    },
    Unlisten {
        key_id: Uuid,
    },
}

/// Timer wake-ups posted back to the scheduler task.
pub(crate) enum InternalEvent {
    OperationTimeout(OperationId),
    AdvanceDue(String),
}

struct ListenerEntry {
    key_id: Uuid,
    pattern: KeyExpr,
    /// Highest VTS delivered to this listener, per concrete key.
    delivered: HashMap<String, u64>,
    sink: mpsc::UnboundedSender<ListenerEvent>,
}

pub(crate) struct Core {
    config: Config,
    transport: TransportHandle,
    internal_tx: mpsc::UnboundedSender<InternalEvent>,
    queue: Vec<Operation>,
    next_operation_id: OperationId,
    listeners: Vec<ListenerEntry>,
    sync: SyncState,
    acls: Option<Vec<String>>,
    auth: Option<AuthParams>,
    session: Option<SessionInfo>,
    pending_auth: Vec<oneshot::Sender<Result<AuthData, ClientError>>>,
    draining: Option<oneshot::Sender<Result<(), ClientError>>>,
}

impl Core {
    pub(crate) fn new(
        config: Config,
        transport: TransportHandle,
        internal_tx: mpsc::UnboundedSender<InternalEvent>,
    ) -> Core {
        Core {
            config,
            transport,
            internal_tx,
            queue: Vec::new(),
            next_operation_id: 1,
            listeners: Vec::new(),
            sync: SyncState::new(),
            acls: None,
            auth: None,
            session: None,
            pending_auth: Vec::new(),
            draining: None,
        }
    }

    pub(crate) async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut events: mpsc::UnboundedReceiver<TransportEvent>,
        mut internal: mpsc::UnboundedReceiver<InternalEvent>,
    ) {
        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(command) => self.handle_command(command),
                    // All facades are gone; the app is done.
                    None => break,
                },
                Some(event) = events.recv() => self.handle_transport_event(event),
                Some(event) = internal.recv() => self.handle_internal_event(event),
            }
        }
        self.transport.end_session();
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::Authenticate {
                provider,
                token,
                reply,
            } => self.authenticate(provider, token, reply),
            Command::Unauth { reply } => self.unauth(reply),
            Command::Publish {
                key,
                data,
                delete_path,
                acl,
                reply,
            } => self.publish(key, data, delete_path, acl, reply),
            Command::FetchAcls { reply } => self.fetch_acls(reply),
            Command::Listen {
                key_id,
                pattern,
                sink,
            } => self.add_listener(key_id, pattern, sink),
            Command::Unlisten { key_id } => self.remove_listener(key_id),
        }
    }

    fn handle_transport_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::SessionUp(info) => self.session_up(info),
            TransportEvent::SessionDown(error) => self.session_down(error),
            TransportEvent::Inbound { closure, response } => self.inbound(closure, response),
        }
    }

    fn handle_internal_event(&mut self, event: InternalEvent) {
        match event {
            InternalEvent::OperationTimeout(id) => self.operation_timed_out(id),
            InternalEvent::AdvanceDue(pattern) => self.advance_due(&pattern),
        }
    }

    // ---- facade commands ----

    fn authenticate(
        &mut self,
        provider: String,
        token: String,
        reply: oneshot::Sender<Result<AuthData, ClientError>>,
    ) {
        if self.draining.is_some() {
            let _ = reply.send(Err(draining_error()));
            return;
        }
        let auth = AuthParams { provider, token };
        self.auth = Some(auth.clone());
        self.transport.set_auth(Some(auth));
        if let Some(session) = self.session.clone() {
            let _ = reply.send(Ok(self.auth_data(&session)));
            return;
        }
        self.pending_auth.push(reply);
        self.transport.ensure_session();
    }

    fn unauth(&mut self, reply: oneshot::Sender<Result<(), ClientError>>) {
        if self.draining.is_some() {
            let _ = reply.send(Err(draining_error()));
            return;
        }
        debug!(target: "tidepool::facade", "tearing down session");
        // Snapshot first: removal mutates the registry.
        let ids: Vec<Uuid> = self.listeners.iter().map(|entry| entry.key_id).collect();
        for key_id in ids {
            self.remove_listener(key_id);
        }
        for pending in self.pending_auth.drain(..) {
            let _ = pending.send(Err(draining_error()));
        }
        self.draining = Some(reply);
        self.maybe_finish_drain();
    }

    fn publish(
        &mut self,
        key: KeyExpr,
        data: Option<String>,
        delete_path: bool,
        acl: Option<Acl>,
        reply: oneshot::Sender<Result<(), ClientError>>,
    ) {
        if self.draining.is_some() {
            let _ = reply.send(Err(draining_error()));
            return;
        }
        let cts = self.sync.next_cts();
        debug!(
            target: "tidepool::facade",
            key = key.as_str(),
            delete = delete_path,
            cts,
            "queueing publish"
        );
        self.enqueue(
            Action::Publish {
                key,
                data,
                delete_path,
                acl,
                cts,
            },
            Completion::Ack(reply),
        );
    }

    fn fetch_acls(&mut self, reply: oneshot::Sender<Result<Vec<String>, ClientError>>) {
        if self.draining.is_some() {
            let _ = reply.send(Err(draining_error()));
            return;
        }
        if let Some(acls) = &self.acls {
            let _ = reply.send(Ok(acls.clone()));
            return;
        }
        self.enqueue(Action::GetAcls, Completion::Acls(reply));
    }

    fn add_listener(
        &mut self,
        key_id: Uuid,
        pattern: KeyExpr,
        sink: mpsc::UnboundedSender<ListenerEvent>,
    ) {
        if self.draining.is_some() {
            let _ = sink.send(ListenerEvent::Error(draining_error()));
            return;
        }
        // A Key instance re-registering replaces its previous listener.
        self.listeners.retain(|entry| entry.key_id != key_id);
        let first_for_key = !self
            .listeners
            .iter()
            .any(|entry| entry.pattern.as_str() == pattern.as_str());
        debug!(
            target: "tidepool::facade",
            pattern = pattern.as_str(),
            first_for_key,
            "adding listener"
        );
        if first_for_key {
            self.enqueue(
                Action::Subscribe {
                    key: pattern.clone(),
                },
                Completion::None,
            );
        }
        let mut entry = ListenerEntry {
            key_id,
            pattern,
            delivered: HashMap::new(),
            sink,
        };
        // Prime from the local store so the listener sees the current
        // snapshot without waiting for the next advance round.
        for value in self.sync.values() {
            if !value.exists {
                continue;
            }
            let Ok(concrete) = KeyExpr::parse(&value.key) else {
                continue;
            };
            if entry.pattern.matches(&concrete) {
                entry.delivered.insert(value.key.clone(), value.vts);
                let _ = entry.sink.send(ListenerEvent::Value(value.clone()));
            }
        }
        let pattern = entry.pattern.clone();
        self.listeners.push(entry);
        self.start_advance(&pattern);
    }

    fn remove_listener(&mut self, key_id: Uuid) {
        let Some(position) = self
            .listeners
            .iter()
            .position(|entry| entry.key_id == key_id)
        else {
            return;
        };
        let entry = self.listeners.remove(position);
        let still_listened = self
            .listeners
            .iter()
            .any(|other| other.pattern.as_str() == entry.pattern.as_str());
        debug!(
            target: "tidepool::facade",
            pattern = entry.pattern.as_str(),
            still_listened,
            "removing listener"
        );
        if !still_listened {
            self.enqueue(
                Action::Unsubscribe { key: entry.pattern },
                Completion::None,
            );
        }
    }

    fn start_advance(&mut self, pattern: &KeyExpr) {
        let slot = rvts_slot(pattern.as_str());
        if !self.sync.begin_advance(&slot) {
            return;
        }
        trace!(
            target: "tidepool::operation",
            pattern = pattern.as_str(),
            "starting advance loop"
        );
        self.enqueue(
            Action::Advance {
                pattern: pattern.clone(),
                rvts: 0,
            },
            Completion::None,
        );
    }

    // ---- queue ----

    fn enqueue(&mut self, action: Action, completion: Completion) {
        let id = self.next_operation_id;
        self.next_operation_id += 1;
        let operation = Operation::new(id, action, completion);
        trace!(
            target: "tidepool::operation",
            id,
            kind = ?operation.action.kind(),
            "queued"
        );
        self.queue.push(operation);
        self.try_start_operations();
    }

    /// Starts every queued operation that is the earliest holder of its
    /// conflict signature.
    fn try_start_operations(&mut self) {
        for index in 0..self.queue.len() {
            if self.queue[index].started {
                continue;
            }
            let blocked = {
                let signature = self.queue[index].signature();
                self.queue[..index]
                    .iter()
                    .any(|earlier| earlier.signature() == signature)
            };
            if !blocked {
                self.start_operation(index);
            }
        }
    }

    fn start_operation(&mut self, index: usize) {
        // Advance snapshots its checkpoint at start time, not enqueue time.
        let checkpoint = match &self.queue[index].action {
            Action::Advance { pattern, .. } => {
                Some(self.sync.rvts_for(&rvts_slot(pattern.as_str())))
            }
            _ => None,
        };
        let operation = &mut self.queue[index];
        if let (Some(current), Action::Advance { rvts, .. }) = (checkpoint, &mut operation.action)
        {
            *rvts = current;
        }
        let request = operation.action.build_request();
        let frame = protocol::encode_request(&request, &operation.closure);
        operation.encoded = Some(frame.clone());
        operation.started = true;
        trace!(
            target: "tidepool::operation",
            id = operation.id,
            kind = request.kind(),
            closure = %operation.closure,
            "started"
        );
        let id = operation.id;
        self.transport.send(frame);
        self.arm_timeout(id);
    }

    fn arm_timeout(&self, id: OperationId) {
        let internal = self.internal_tx.clone();
        let timeout = self.config.operation_timeout;
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let _ = internal.send(InternalEvent::OperationTimeout(id));
        });
    }

    fn operation_timed_out(&mut self, id: OperationId) {
        // A timeout for a finished operation is stale; ignore it.
        let Some(operation) = self.queue.iter().find(|op| op.id == id) else {
            return;
        };
        if !operation.started {
            return;
        }
        debug!(
            target: "tidepool::operation",
            id,
            closure = %operation.closure,
            "timed out, re-sending"
        );
        if let Some(frame) = operation.encoded.clone() {
            self.transport.send(frame);
        }
        self.arm_timeout(id);
    }

    // ---- transport events ----

    fn session_up(&mut self, info: SessionInfo) {
        self.session = Some(info.clone());
        let data = self.auth_data(&info);
        for pending in self.pending_auth.drain(..) {
            let _ = pending.send(Ok(data.clone()));
        }
        // Replay everything in flight on the fresh session.
        let frames: Vec<String> = self
            .queue
            .iter()
            .filter(|op| op.started)
            .filter_map(|op| op.encoded.clone())
            .collect();
        if !frames.is_empty() {
            debug!(
                target: "tidepool::operation",
                count = frames.len(),
                "replaying started operations"
            );
        }
        for frame in frames {
            self.transport.send(frame);
        }
    }

    fn session_down(&mut self, error: Option<ClientError>) {
        self.session = None;
        if let Some(error) = error {
            for pending in self.pending_auth.drain(..) {
                let _ = pending.send(Err(error.clone()));
            }
        }
    }

    fn inbound(&mut self, closure: Option<String>, response: Response) {
        if let Some(closure) = closure {
            if let Some(index) = self.queue.iter().position(|op| op.closure == closure) {
                self.operation_responded(index, response);
            } else {
                trace!(
                    target: "tidepool::response",
                    closure = %closure,
                    kind = response.kind(),
                    "response for unknown closure"
                );
            }
            return;
        }
        match response {
            Response::Data(value) => self.deliver(value),
            other => {
                warn!(
                    target: "tidepool::response",
                    kind = other.kind(),
                    "unsolicited message ignored"
                );
            }
        }
    }

    fn operation_responded(&mut self, index: usize, response: Response) {
        let Operation {
            id,
            action,
            completion,
            ..
        } = self.queue.remove(index);
        trace!(target: "tidepool::operation", id, kind = ?action.kind(), "responded");
        match action {
            Action::Publish { key, .. } => {
                let result = ack_result(response);
                if let Err(err) = &result {
                    warn!(
                        target: "tidepool::operation",
                        key = key.as_str(),
                        error = %err,
                        "publish rejected"
                    );
                }
                completion.resolve_ack(result);
            }
            Action::Subscribe { key } => {
                // A rejected subscribe does not fail the listener.
                if let Err(err) = ack_result(response) {
                    warn!(
                        target: "tidepool::operation",
                        key = key.as_str(),
                        error = %err,
                        "subscribe rejected"
                    );
                }
                completion.resolve_ack(Ok(()));
            }
            Action::Unsubscribe { key } => {
                if let Err(err) = ack_result(response) {
                    warn!(
                        target: "tidepool::operation",
                        key = key.as_str(),
                        error = %err,
                        "unsubscribe rejected"
                    );
                }
                completion.resolve_ack(Ok(()));
            }
            Action::GetAcls => {
                let result = match response {
                    Response::GetAcls { acls } => {
                        self.acls = Some(acls.clone());
                        Ok(acls)
                    }
                    other => Err(ack_result(other).err().unwrap_or_else(|| {
                        ClientError::Internal("unexpected getAcls response".into())
                    })),
                };
                completion.resolve_acls(result);
            }
            Action::Advance { pattern, rvts } => self.advance_responded(pattern, rvts, response),
            Action::Fetch {
                pattern,
                rvts_prime,
                ..
            } => self.fetch_responded(pattern, rvts_prime, response),
        }
        self.try_start_operations();
        self.maybe_finish_drain();
    }

    // ---- advance/fetch loop ----

    fn advance_responded(&mut self, pattern: KeyExpr, issued_rvts: u64, response: Response) {
        let slot = rvts_slot(pattern.as_str());
        match response {
            Response::Advance { vts, maxvts } => {
                let mut missing = Vec::new();
                for version in &vts {
                    match self.sync.covering(*version).cloned() {
                        // Known version: re-deliver the cached value so
                        // listeners added since the last round see it.
                        Some(value) => self.fan_out(value),
                        None => missing.push(*version),
                    }
                }
                let rvts_prime = maxvts.unwrap_or_else(|| {
                    vts.iter()
                        .copied()
                        .max()
                        .map_or(issued_rvts, |highest| issued_rvts.max(highest))
                });
                if !missing.is_empty() {
                    trace!(
                        target: "tidepool::operation",
                        pattern = pattern.as_str(),
                        count = missing.len(),
                        "fetching missing versions"
                    );
                    self.enqueue(
                        Action::Fetch {
                            pattern,
                            vts: missing,
                            rvts_prime,
                        },
                        Completion::None,
                    );
                } else {
                    self.sync.commit_rvts(&slot, rvts_prime);
                    self.schedule_advance(pattern.as_str());
                }
            }
            other => {
                if let Err(err) = ack_result(other) {
                    warn!(
                        target: "tidepool::operation",
                        pattern = pattern.as_str(),
                        error = %err,
                        "advance failed"
                    );
                }
                self.schedule_advance(pattern.as_str());
            }
        }
    }

    fn fetch_responded(&mut self, pattern: KeyExpr, rvts_prime: u64, response: Response) {
        let slot = rvts_slot(pattern.as_str());
        match response {
            Response::Fetch { response: values } => {
                for value in values {
                    self.deliver(value);
                }
                self.sync.commit_rvts(&slot, rvts_prime);
            }
            other => {
                if let Err(err) = ack_result(other) {
                    warn!(
                        target: "tidepool::operation",
                        pattern = pattern.as_str(),
                        error = %err,
                        "fetch failed"
                    );
                }
            }
        }
        self.schedule_advance(pattern.as_str());
    }

    fn schedule_advance(&self, pattern: &str) {
        let internal = self.internal_tx.clone();
        let delay = self.config.advance_delay;
        let pattern = pattern.to_owned();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = internal.send(InternalEvent::AdvanceDue(pattern));
        });
    }

    fn advance_due(&mut self, pattern_str: &str) {
        let pattern = self
            .listeners
            .iter()
            .find(|entry| entry.pattern.as_str() == pattern_str)
            .map(|entry| entry.pattern.clone());
        match pattern {
            Some(pattern) if self.draining.is_none() => {
                self.enqueue(Action::Advance { pattern, rvts: 0 }, Completion::None);
            }
            _ => {
                trace!(
                    target: "tidepool::operation",
                    pattern = pattern_str,
                    "advance loop stopped"
                );
                self.sync.end_advance(&rvts_slot(pattern_str));
            }
        }
    }

    // ---- delivery ----

    fn deliver(&mut self, value: Value) {
        let Ok(concrete) = KeyExpr::parse(&value.key) else {
            warn!(target: "tidepool::response", key = %value.key, "dropping value with invalid key");
            return;
        };
        if concrete.is_pattern() {
            warn!(target: "tidepool::response", key = %value.key, "dropping value addressed to a pattern");
            return;
        }
        if !self.sync.record(value.clone()) {
            trace!(
                target: "tidepool::response",
                key = %value.key,
                vts = value.vts,
                "stale version dropped"
            );
            return;
        }
        self.fan_out(value);
    }

    /// Hands a value to every matching listener that has not yet seen this
    /// VTS for its key. Does not touch the store; callers decide whether
    /// the value is fresh.
    fn fan_out(&mut self, value: Value) {
        let Ok(concrete) = KeyExpr::parse(&value.key) else {
            return;
        };
        for listener in &mut self.listeners {
            if !listener.pattern.matches(&concrete) {
                continue;
            }
            if let Some(seen) = listener.delivered.get(&value.key) {
                if value.vts <= *seen {
                    continue;
                }
            }
            listener.delivered.insert(value.key.clone(), value.vts);
            let _ = listener.sink.send(ListenerEvent::Value(value.clone()));
        }
    }

    // ---- teardown ----

    fn maybe_finish_drain(&mut self) {
        if !self.queue.is_empty() {
            return;
        }
        let Some(reply) = self.draining.take() else {
            return;
        };
        self.auth = None;
        self.acls = None;
        self.session = None;
        self.transport.set_auth(None);
        self.transport.end_session();
        debug!(target: "tidepool::facade", "session torn down");
        let _ = reply.send(Ok(()));
    }

    fn auth_data(&self, session: &SessionInfo) -> AuthData {
        AuthData {
            uid: session.uid.clone(),
            provider: self
                .auth
                .as_ref()
                .map(|auth| auth.provider.clone())
                .unwrap_or_default(),
            token: self
                .auth
                .as_ref()
                .map(|auth| auth.token.clone())
                .unwrap_or_default(),
            expires: session.expires,
        }
    }
}

fn ack_result(response: Response) -> Result<(), ClientError> {
    match response {
        Response::Happy { code: 0, .. } => Ok(()),
        Response::Happy { code, msg } => Err(ClientError::request(code, msg)),
        Response::Error { msg } => Err(ClientError::Internal(format!("server error: {msg}"))),
        other => Err(ClientError::Internal(format!(
            "unexpected {} response",
            other.kind()
        ))),
    }
}

fn draining_error() -> ClientError {
    ClientError::InvalidRequest("session teardown in progress".into())
}
