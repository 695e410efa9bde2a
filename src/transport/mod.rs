//! Session transport: one full-duplex framed connection per app.
//!
//! The connection task walks `Idle → Connecting → Open → Idle`. A session
//! is only considered open once the server has answered the handshake with
//! a `connectResponse`; everything after that is frame dispatch. A send
//! requested while idle is dropped by contract — it forces a session
//! attempt, and the operation layer's timeout re-sends once the session is
//! up.

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use crate::error::ClientError;
use crate::protocol::{self, DecodeError, Response};

pub mod config;

pub use config::{AuthParams, TransportConfig};

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;
type WsStream = SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>;

/// Session identity reported by the server's `connectResponse`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionInfo {
    pub uuid: String,
    pub uid: String,
    pub expires: Option<u64>,
}

#[derive(Debug)]
pub(crate) enum TransportCmd {
    EnsureSession,
    Send(String),
    SetAuth(Option<AuthParams>),
    EndSession,
}

#[derive(Debug)]
pub(crate) enum TransportEvent {
    SessionUp(SessionInfo),
    SessionDown(Option<ClientError>),
    Inbound {
        closure: Option<String>,
        response: Response,
    },
}

/// Cheap handle through which the scheduler drives the connection task.
#[derive(Clone)]
pub(crate) struct TransportHandle {
    cmd_tx: mpsc::UnboundedSender<TransportCmd>,
}

impl TransportHandle {
    pub fn spawn(
        config: TransportConfig,
        events: mpsc::UnboundedSender<TransportEvent>,
    ) -> TransportHandle {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let task = ConnectionTask {
            config,
            cmd_rx,
            events,
            auth: None,
        };
        tokio::spawn(task.run());
        TransportHandle { cmd_tx }
    }

    /// Handle wired to nothing, for scheduler tests that never touch the
    /// network.
    #[cfg(test)]
    pub fn disconnected() -> TransportHandle {
        let (cmd_tx, _cmd_rx) = mpsc::unbounded_channel();
        TransportHandle { cmd_tx }
    }

    pub fn ensure_session(&self) {
        let _ = self.cmd_tx.send(TransportCmd::EnsureSession);
    }

    pub fn send(&self, frame: String) {
        let _ = self.cmd_tx.send(TransportCmd::Send(frame));
    }

    pub fn set_auth(&self, auth: Option<AuthParams>) {
        let _ = self.cmd_tx.send(TransportCmd::SetAuth(auth));
    }

    pub fn end_session(&self) {
        let _ = self.cmd_tx.send(TransportCmd::EndSession);
    }
}

struct ConnectionTask {
    config: TransportConfig,
    cmd_rx: mpsc::UnboundedReceiver<TransportCmd>,
    events: mpsc::UnboundedSender<TransportEvent>,
    auth: Option<AuthParams>,
}

struct Connection {
    sink: WsSink,
    stream: WsStream,
}

impl ConnectionTask {
    async fn run(mut self) {
        loop {
            // Idle: only a command can start a session.
            let Some(cmd) = self.cmd_rx.recv().await else {
                return;
            };
            match cmd {
                TransportCmd::SetAuth(auth) => self.auth = auth,
                TransportCmd::EndSession => {}
                TransportCmd::EnsureSession | TransportCmd::Send(_) => {
                    match self.open_session().await {
                        Ok(conn) => {
                            if self.serve(conn).await {
                                return;
                            }
                        }
                        Err(err) => {
                            warn!(target: "tidepool::transport", error = %err, "session attempt failed");
                            let _ = self.events.send(TransportEvent::SessionDown(Some(err)));
                        }
                    }
                }
            }
        }
    }

    /// Connecting: dial, then wait for the server's `connectResponse`.
    async fn open_session(&mut self) -> Result<Connection, ClientError> {
        let session_id = Uuid::new_v4().to_string();
        let url = self.config.session_url(&session_id, self.auth.as_ref())?;
        debug!(
            target: "tidepool::transport",
            host = %self.config.host,
            port = self.config.port,
            session_id = %session_id,
            "opening session"
        );
        let (socket, _) = timeout(self.config.connect_timeout, connect_async(url.as_str()))
            .await
            .map_err(|_| ClientError::Internal("connect timed out".into()))?
            .map_err(|err| ClientError::Internal(format!("connect failed: {err}")))?;
        let (sink, stream) = socket.split();
        let mut conn = Connection { sink, stream };
        let info = timeout(self.config.connect_timeout, conn.await_session())
            .await
            .map_err(|_| ClientError::Internal("session handshake timed out".into()))??;
        info!(target: "tidepool::transport", uid = %info.uid, "session established");
        let _ = self.events.send(TransportEvent::SessionUp(info));
        Ok(conn)
    }

    /// Open: pump commands out and frames in until either side ends the
    /// session. Returns true when the scheduler is gone and the task should
    /// exit.
    async fn serve(&mut self, mut conn: Connection) -> bool {
        loop {
            tokio::select! {
                cmd = self.cmd_rx.recv() => match cmd {
                    None => {
                        let _ = conn.sink.close().await;
                        return true;
                    }
                    Some(TransportCmd::SetAuth(auth)) => self.auth = auth,
                    Some(TransportCmd::EnsureSession) => {}
                    Some(TransportCmd::Send(frame)) => {
                        trace!(target: "tidepool::transport", bytes = frame.len(), "outbound frame");
                        if let Err(err) = conn.sink.send(Message::Text(frame)).await {
                            warn!(target: "tidepool::transport", error = %err, "send failed, dropping session");
                            let _ = self.events.send(TransportEvent::SessionDown(None));
                            return false;
                        }
                    }
                    Some(TransportCmd::EndSession) => {
                        debug!(target: "tidepool::transport", "ending session");
                        let _ = conn.sink.close().await;
                        let _ = self.events.send(TransportEvent::SessionDown(None));
                        return false;
                    }
                },
                frame = conn.stream.next() => match frame {
                    Some(Ok(Message::Text(text))) => self.dispatch(&text),
                    Some(Ok(Message::Close(_))) | None => {
                        debug!(target: "tidepool::transport", "connection closed by peer");
                        let _ = self.events.send(TransportEvent::SessionDown(None));
                        return false;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(err)) => {
                        warn!(target: "tidepool::transport", error = %err, "connection error");
                        let _ = self.events.send(TransportEvent::SessionDown(None));
                        return false;
                    }
                },
            }
        }
    }

    fn dispatch(&self, text: &str) {
        match protocol::decode_response(text) {
            Ok((closure, response)) => {
                trace!(
                    target: "tidepool::response",
                    kind = response.kind(),
                    closure = closure.as_deref().unwrap_or("-"),
                    "inbound frame"
                );
                let _ = self
                    .events
                    .send(TransportEvent::Inbound { closure, response });
            }
            Err(DecodeError::UnknownKind(kind)) => {
                warn!(target: "tidepool::response", kind = %kind, "ignoring unknown message kind");
            }
            Err(err) => {
                warn!(target: "tidepool::response", error = %err, "ignoring malformed frame");
            }
        }
    }
}

impl Connection {
    async fn await_session(&mut self) -> Result<SessionInfo, ClientError> {
        while let Some(frame) = self.stream.next().await {
            match frame {
                Ok(Message::Text(text)) => match protocol::decode_response(&text) {
                    Ok((_, Response::Connect { uuid, uid, expires })) => {
                        return Ok(SessionInfo { uuid, uid, expires });
                    }
                    Ok((_, Response::Error { msg })) => {
                        return Err(ClientError::Internal(format!(
                            "server rejected session: {msg}"
                        )));
                    }
                    Ok((_, other)) => {
                        trace!(
                            target: "tidepool::transport",
                            kind = other.kind(),
                            "frame before session established"
                        );
                    }
                    Err(err) => {
                        warn!(target: "tidepool::transport", error = %err, "undecodable handshake frame");
                    }
                },
                Ok(Message::Close(_)) => break,
                Ok(_) => {}
                Err(err) => {
                    return Err(ClientError::Internal(format!("connection failed: {err}")));
                }
            }
        }
        Err(ClientError::Internal(
            "connection closed during session handshake".into(),
        ))
    }
}
