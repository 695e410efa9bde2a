//! In-process store server speaking the wire protocol, scripted enough to
//! drive the client end to end: it assigns VTS, tracks per-connection
//! subscriptions, pushes `data` frames, and answers advance/fetch rounds.

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio_tungstenite::accept_hdr_async;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::handshake::server::{
    ErrorResponse, Request as HandshakeRequest, Response as HandshakeResponse,
};

use crate::acl::Acl;
use crate::key::KeyExpr;
use crate::protocol::{self, Request, Response, Value};

#[derive(Default)]
struct StoreState {
    next_vts: u64,
    /// Latest value per concrete key.
    records: HashMap<String, Value>,
    /// Every assigned version, by VTS.
    history: HashMap<u64, Value>,
    /// Publishes already applied, for idempotent re-sends.
    applied_pubs: HashSet<String>,
    /// Requests to drop without answering.
    swallow: usize,
    /// Every request seen: (kind, closure).
    request_log: Vec<(String, String)>,
}

pub struct TestServer {
    addr: SocketAddr,
    state: Arc<Mutex<StoreState>>,
    reset_tx: broadcast::Sender<()>,
    accept_task: tokio::task::JoinHandle<()>,
}

impl TestServer {
    pub async fn start() -> TestServer {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("local addr");
        let state: Arc<Mutex<StoreState>> = Arc::default();
        let (reset_tx, _) = broadcast::channel(4);

        let accept_state = state.clone();
        let accept_reset = reset_tx.clone();
        let accept_task = tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    break;
                };
                let state = accept_state.clone();
                let reset = accept_reset.subscribe();
                tokio::spawn(serve_connection(stream, state, reset));
            }
        });

        TestServer {
            addr,
            state,
            reset_tx,
            accept_task,
        }
    }

    pub fn host(&self) -> String {
        self.addr.ip().to_string()
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    /// Abruptly drops every open connection.
    pub fn drop_connections(&self) {
        let _ = self.reset_tx.send(());
    }

    /// Drops the next `count` requests without answering them.
    pub fn swallow_requests(&self, count: usize) {
        self.state.lock().unwrap().swallow = count;
    }

    pub fn request_log(&self) -> Vec<(String, String)> {
        self.state.lock().unwrap().request_log.clone()
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.accept_task.abort();
    }
}

async fn serve_connection(
    stream: TcpStream,
    state: Arc<Mutex<StoreState>>,
    mut reset: broadcast::Receiver<()>,
) {
    let query: Arc<Mutex<String>> = Arc::default();
    let capture = query.clone();
    let callback = move |request: &HandshakeRequest,
                         response: HandshakeResponse|
          -> Result<HandshakeResponse, ErrorResponse> {
        *capture.lock().unwrap() = request.uri().query().unwrap_or("").to_owned();
        Ok(response)
    };
    let Ok(socket) = accept_hdr_async(stream, callback).await else {
        return;
    };
    let (mut sink, mut frames) = socket.split();

    let params = parse_query(&query.lock().unwrap());
    let session_id = params.get("sessionId").cloned().unwrap_or_default();
    let uid = match params.get("token") {
        Some(token) => format!("uid-{token}"),
        None => "anon".to_owned(),
    };
    let connect = Response::Connect {
        uuid: session_id,
        uid: uid.clone(),
        expires: Some(4_102_444_800_000),
    };
    if sink
        .send(Message::Text(protocol::encode_response(&connect, None)))
        .await
        .is_err()
    {
        return;
    }

    let mut subscriptions: Vec<KeyExpr> = Vec::new();
    loop {
        tokio::select! {
            _ = reset.recv() => return,
            frame = frames.next() => {
                let Some(Ok(message)) = frame else { return };
                let Message::Text(text) = message else { continue };
                let Ok((closure, request)) = protocol::decode_request(&text) else { continue };
                let closure = closure.unwrap_or_default();
                {
                    let mut state = state.lock().unwrap();
                    state.request_log.push((request.kind().to_owned(), closure.clone()));
                    if state.swallow > 0 {
                        state.swallow -= 1;
                        continue;
                    }
                }
                let outbound = handle_request(&state, &mut subscriptions, &uid, request, &closure);
                for (response, closure) in outbound {
                    let frame = protocol::encode_response(&response, closure.as_deref());
                    if sink.send(Message::Text(frame)).await.is_err() {
                        return;
                    }
                }
            }
        }
    }
}

/// Applies one request and returns the frames to emit: the correlated
/// reply plus any `data` pushes for matching subscriptions.
fn handle_request(
    state: &Mutex<StoreState>,
    subscriptions: &mut Vec<KeyExpr>,
    uid: &str,
    request: Request,
    closure: &str,
) -> Vec<(Response, Option<String>)> {
    let mut state = state.lock().unwrap();
    let mut outbound = Vec::new();
    match request {
        Request::Pub {
            path,
            delete_path,
            cts,
            data,
            assume_acl,
        } => {
            if state.applied_pubs.contains(closure) {
                outbound.push((happy(0, ""), Some(closure.to_owned())));
                return outbound;
            }
            let target = match KeyExpr::parse(&path.join(".")) {
                Ok(target) => target,
                Err(_) => {
                    outbound.push((happy(2, "invalid path"), Some(closure.to_owned())));
                    return outbound;
                }
            };
            if delete_path {
                let matched: Vec<Value> = state
                    .records
                    .values()
                    .filter(|value| {
                        value.exists
                            && KeyExpr::parse(&value.key)
                                .map(|key| target.matches(&key))
                                .unwrap_or(false)
                    })
                    .cloned()
                    .collect();
                for existing in matched {
                    state.next_vts += 1;
                    let tombstone = Value {
                        key: existing.key.clone(),
                        exists: false,
                        data: None,
                        acl_id: existing.acl_id.clone(),
                        creator: uid.to_owned(),
                        cts,
                        vts: state.next_vts,
                        stable: true,
                    };
                    store(&mut state, tombstone.clone());
                    push(subscriptions, &tombstone, &mut outbound);
                }
            } else {
                if target.is_pattern() || target.is_root() {
                    outbound.push((happy(3, "invalid write target"), Some(closure.to_owned())));
                    return outbound;
                }
                state.next_vts += 1;
                let value = Value {
                    key: target.as_str().to_owned(),
                    exists: true,
                    data,
                    acl_id: assume_acl
                        .map(|acl| acl.as_str().to_owned())
                        .unwrap_or_else(|| Acl::PublicCreate.as_str().to_owned()),
                    creator: uid.to_owned(),
                    cts,
                    vts: state.next_vts,
                    stable: true,
                };
                store(&mut state, value.clone());
                push(subscriptions, &value, &mut outbound);
            }
            state.applied_pubs.insert(closure.to_owned());
            outbound.push((happy(0, ""), Some(closure.to_owned())));
        }
        Request::Sub { path } => {
            if let Ok(pattern) = KeyExpr::parse(&path.join(".")) {
                subscriptions.push(pattern);
            }
            outbound.push((happy(0, ""), Some(closure.to_owned())));
        }
        Request::Unsub { path } => {
            let text = path.join(".");
            subscriptions.retain(|pattern| pattern.as_str() != text);
            outbound.push((happy(0, ""), Some(closure.to_owned())));
        }
        Request::GetAcls {} => {
            outbound.push((
                Response::GetAcls {
                    acls: Acl::ALL.iter().map(|acl| acl.as_str().to_owned()).collect(),
                },
                Some(closure.to_owned()),
            ));
        }
        Request::Advance { pattern, rvts } => {
            let response = match KeyExpr::parse(&pattern.join(".")) {
                Ok(pattern) => {
                    let mut vts: Vec<u64> = state
                        .history
                        .iter()
                        .filter(|(version, value)| {
                            **version > rvts
                                && KeyExpr::parse(&value.key)
                                    .map(|key| pattern.matches(&key))
                                    .unwrap_or(false)
                        })
                        .map(|(version, _)| *version)
                        .collect();
                    vts.sort_unstable();
                    Response::Advance {
                        vts,
                        maxvts: Some(state.next_vts),
                    }
                }
                Err(_) => happy(4, "invalid pattern"),
            };
            outbound.push((response, Some(closure.to_owned())));
        }
        Request::Fetch { vts } => {
            let response = vts
                .iter()
                .filter_map(|version| state.history.get(version).cloned())
                .collect();
            outbound.push((
                Response::Fetch { response },
                Some(closure.to_owned()),
            ));
        }
    }
    outbound
}

fn store(state: &mut StoreState, value: Value) {
    state.history.insert(value.vts, value.clone());
    state.records.insert(value.key.clone(), value);
}

fn push(
    subscriptions: &[KeyExpr],
    value: &Value,
    outbound: &mut Vec<(Response, Option<String>)>,
) {
    let Ok(key) = KeyExpr::parse(&value.key) else {
        return;
    };
    if subscriptions.iter().any(|pattern| pattern.matches(&key)) {
        outbound.push((Response::Data(value.clone()), None));
    }
}

fn happy(code: i64, msg: &str) -> Response {
    Response::Happy {
        code,
        msg: msg.to_owned(),
    }
}

fn parse_query(query: &str) -> HashMap<String, String> {
    query
        .split('&')
        .filter_map(|pair| {
            let (name, value) = pair.split_once('=')?;
            Some((name.to_owned(), value.to_owned()))
        })
        .collect()
}
