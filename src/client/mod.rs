//! Public client surface: the `App` handle and the `Key` value object.
//!
//! An `App` is a cheap handle onto a scheduler task that owns every piece
//! of mutable client state. `Key`s are bound to their app and carry an
//! instance id, so two `Key`s for the same string hold independent
//! listener registrations.

use tokio::sync::{mpsc, oneshot};
use tracing::debug;
use uuid::Uuid;

use crate::acl::Acl;
use crate::config::Config;
use crate::error::ClientError;
use crate::key::{KeyError, KeyExpr, validate_component};
use crate::protocol::Value;
use crate::transport::{TransportConfig, TransportHandle};

pub(crate) mod core;
pub(crate) mod sync;

use self::core::{Command, Core};

/// Opens an app handle for the given endpoint. No network traffic happens
/// until the first operation needs a session.
///
/// Must be called within a Tokio runtime.
pub fn connect(host: &str, port: u16, use_tls: bool) -> Result<App, ClientError> {
    App::with_config(Config::new(host, port).with_tls(use_tls))
}

/// Session identity returned by [`App::authenticate`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthData {
    pub uid: String,
    pub provider: String,
    pub token: String,
    pub expires: Option<u64>,
}

/// Payload accepted by [`Key::write`]: either opaque text sent verbatim,
/// or a structured value serialized to JSON text by the client.
#[derive(Debug, Clone)]
pub enum WriteData {
    Text(String),
    Json(serde_json::Value),
}

impl WriteData {
    fn into_text(self) -> Result<String, ClientError> {
        match self {
            WriteData::Text(text) => Ok(text),
            WriteData::Json(serde_json::Value::String(text)) => Ok(text),
            WriteData::Json(
                value @ (serde_json::Value::Object(_) | serde_json::Value::Array(_)),
            ) => Ok(value.to_string()),
            WriteData::Json(other) => Err(ClientError::InvalidRequest(format!(
                "unsupported write payload `{other}`; use a string or a structured value"
            ))),
        }
    }
}

impl From<&str> for WriteData {
    fn from(text: &str) -> Self {
        WriteData::Text(text.to_owned())
    }
}

impl From<String> for WriteData {
    fn from(text: String) -> Self {
        WriteData::Text(text)
    }
}

impl From<serde_json::Value> for WriteData {
    fn from(value: serde_json::Value) -> Self {
        WriteData::Json(value)
    }
}

/// Receives values and errors for one listener registration.
///
/// Callbacks run on a dedicated dispatch task, never inside the scheduler,
/// so a listener may freely call back into the client. Values for one
/// concrete key arrive in strictly increasing VTS order, each VTS at most
/// once.
pub trait ValueListener: Send + 'static {
    fn on_value(&mut self, value: Value);
    fn on_error(&mut self, error: ClientError);
}

impl<F> ValueListener for F
where
    F: FnMut(Result<Value, ClientError>) + Send + 'static,
{
    fn on_value(&mut self, value: Value) {
        self(Ok(value));
    }

    fn on_error(&mut self, error: ClientError) {
        self(Err(error));
    }
}

#[derive(Debug)]
pub(crate) enum ListenerEvent {
    Value(Value),
    Error(ClientError),
}

/// Handle to one client app. Clones share the underlying session and
/// state.
#[derive(Clone, Debug)]
pub struct App {
    cmd_tx: mpsc::UnboundedSender<Command>,
}

impl App {
    /// Builds an app from an explicit [`Config`].
    pub fn with_config(config: Config) -> Result<App, ClientError> {
        if config.host.trim().is_empty() {
            return Err(ClientError::InvalidRequest("host must not be empty".into()));
        }
        if config.port == 0 {
            return Err(ClientError::InvalidRequest("port must not be zero".into()));
        }
        debug!(
            target: "tidepool::facade",
            host = %config.host,
            port = config.port,
            tls = config.tls,
            "creating app"
        );
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let transport = TransportHandle::spawn(TransportConfig::from_config(&config), event_tx);
        let (internal_tx, internal_rx) = mpsc::unbounded_channel();
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let core = Core::new(config, transport, internal_tx);
        tokio::spawn(core.run(cmd_rx, event_rx, internal_rx));
        Ok(App { cmd_tx })
    }

    /// Establishes the session with the given identity provider and token.
    /// Resolves once the server acknowledges the session.
    pub async fn authenticate(&self, provider: &str, token: &str) -> Result<AuthData, ClientError> {
        let (reply, response) = oneshot::channel();
        self.send(Command::Authenticate {
            provider: provider.to_owned(),
            token: token.to_owned(),
            reply,
        })?;
        response.await.map_err(|_| terminated())?
    }

    /// Removes every listener, drains the operation queue, clears cached
    /// credentials, and ends the session.
    pub async fn unauth(&self) -> Result<(), ClientError> {
        let (reply, response) = oneshot::channel();
        self.send(Command::Unauth { reply })?;
        response.await.map_err(|_| terminated())?
    }

    /// The static ACL identifiers the server offers. Cached after the
    /// first round trip.
    pub async fn fetch_acls(&self) -> Result<Vec<String>, ClientError> {
        let (reply, response) = oneshot::channel();
        self.send(Command::FetchAcls { reply })?;
        response.await.map_err(|_| terminated())?
    }

    /// Binds a key by its string form. Validity is checked lazily: an
    /// invalid key is returned and reports through [`Key::error`].
    pub fn key(&self, path: &str) -> Key {
        Key::bind(self.clone(), path.to_owned())
    }

    /// Binds a key from pre-split components.
    pub fn key_from_components<I, S>(&self, components: I) -> Key
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let text = components
            .into_iter()
            .map(|c| c.as_ref().to_owned())
            .collect::<Vec<_>>()
            .join(".");
        Key::bind(self.clone(), text)
    }

    /// The root key.
    pub fn root(&self) -> Key {
        self.key("")
    }

    fn send(&self, command: Command) -> Result<(), ClientError> {
        self.cmd_tx.send(command).map_err(|_| terminated())
    }
}

fn terminated() -> ClientError {
    ClientError::Internal("client task terminated".into())
}

/// A hierarchical key bound to an [`App`].
///
/// A `Key` is a value object; navigation returns fresh instances. Each
/// instance owns at most one listener registration, keyed by an instance
/// id that clones share.
#[derive(Clone)]
pub struct Key {
    app: App,
    id: Uuid,
    text: String,
    parsed: Result<KeyExpr, KeyError>,
}

impl Key {
    fn bind(app: App, text: String) -> Key {
        let parsed = KeyExpr::parse(&text);
        Key {
            app,
            id: Uuid::new_v4(),
            text,
            parsed,
        }
    }

    pub fn as_str(&self) -> &str {
        &self.text
    }

    /// The validity error for this key, if any.
    pub fn error(&self) -> Option<KeyError> {
        self.parsed.as_ref().err().copied()
    }

    pub fn is_pattern(&self) -> bool {
        self.parsed
            .as_ref()
            .map(KeyExpr::is_pattern)
            .unwrap_or(false)
    }

    /// The final component, or `None` for the root.
    pub fn last_component(&self) -> Option<&str> {
        if self.text.is_empty() {
            None
        } else {
            self.text.rsplit('.').next()
        }
    }

    /// The key one level up. The parent of the root is the root. Works on
    /// the string form, so it is defined even for invalid keys.
    pub fn parent(&self) -> Key {
        let text = match self.text.rfind('.') {
            Some(index) => self.text[..index].to_owned(),
            None => String::new(),
        };
        Key::bind(self.app.clone(), text)
    }

    /// The key one level down. The component must be a single token; an
    /// embedded `.` or an empty string makes the child invalid rather than
    /// re-splitting. The result may be invalid either way; check
    /// [`Key::error`].
    pub fn child(&self, component: &str) -> Key {
        let text = if self.text.is_empty() {
            component.to_owned()
        } else {
            format!("{}.{component}", self.text)
        };
        match validate_component(component, true) {
            Ok(()) => Key::bind(self.app.clone(), text),
            Err(err) => Key {
                app: self.app.clone(),
                id: Uuid::new_v4(),
                text,
                parsed: Err(err),
            },
        }
    }

    /// A child under a freshly generated unique component.
    pub fn child_unique(&self) -> Key {
        self.child(&Uuid::new_v4().to_string())
    }

    /// Writes a value to this concrete key. Resolves on server ack; the
    /// resulting version arrives through listeners.
    pub async fn write(&self, data: impl Into<WriteData>) -> Result<(), ClientError> {
        let text = data.into().into_text()?;
        self.publish(Some(text), false, None).await
    }

    /// Writes with an explicit ACL instead of the inherited one.
    pub async fn write_with_acl(
        &self,
        data: impl Into<WriteData>,
        acl: Acl,
    ) -> Result<(), ClientError> {
        let text = data.into().into_text()?;
        self.publish(Some(text), false, Some(acl)).await
    }

    /// Deletes this key. Wildcards are allowed; the server decides what
    /// the pattern reaches.
    pub async fn delete(&self) -> Result<(), ClientError> {
        self.publish(None, true, None).await
    }

    async fn publish(
        &self,
        data: Option<String>,
        delete_path: bool,
        acl: Option<Acl>,
    ) -> Result<(), ClientError> {
        let key = self.parsed.clone()?;
        if !delete_path && key.is_pattern() {
            return Err(ClientError::rejected(format!(
                "cannot write to pattern key `{}`",
                self.text
            )));
        }
        let (reply, response) = oneshot::channel();
        self.app.send(Command::Publish {
            key,
            data,
            delete_path,
            acl,
            reply,
        })?;
        response.await.map_err(|_| terminated())?
    }

    /// Registers a listener for this key or pattern. A key instance holds
    /// at most one registration; listening again replaces it. An invalid
    /// key fails through the listener's `on_error`.
    pub fn listen(&self, listener: impl ValueListener) {
        let (sink, mut events) = mpsc::unbounded_channel::<ListenerEvent>();
        let mut listener = listener;
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                match event {
                    ListenerEvent::Value(value) => listener.on_value(value),
                    ListenerEvent::Error(error) => listener.on_error(error),
                }
            }
        });
        match &self.parsed {
            Ok(pattern) => {
                let _ = self.app.cmd_tx.send(Command::Listen {
                    key_id: self.id,
                    pattern: pattern.clone(),
                    sink,
                });
            }
            Err(err) => {
                let _ = sink.send(ListenerEvent::Error(ClientError::from(*err)));
            }
        }
    }

    /// Drops this key instance's listener registration, if any.
    pub fn unlisten(&self) {
        let _ = self.app.cmd_tx.send(Command::Unlisten { key_id: self.id });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn app() -> App {
        App::with_config(Config::new("127.0.0.1", 4404)).unwrap()
    }

    #[test]
    fn connect_requires_host_and_port() {
        assert_eq!(connect("", 4404, false).unwrap_err().code(), 3);
        assert_eq!(connect("localhost", 0, false).unwrap_err().code(), 3);
    }

    #[tokio::test]
    async fn key_reports_validity() {
        let app = app();
        assert!(app.key("a.b.c").error().is_none());
        assert!(app.root().error().is_none());
        assert_eq!(
            app.key("a..b").error(),
            Some(crate::key::KeyError::EmptyComponent)
        );
    }

    #[tokio::test]
    async fn key_navigation_follows_the_string_form() {
        let app = app();
        let key = app.key("a.b.c");
        assert_eq!(key.parent().as_str(), "a.b");
        assert_eq!(key.child("d").as_str(), "a.b.c.d");
        assert_eq!(key.last_component(), Some("c"));
        assert_eq!(app.root().parent().as_str(), "");
        assert_eq!(app.root().child("x").as_str(), "x");
        assert_eq!(app.root().last_component(), None);
    }

    #[tokio::test]
    async fn child_component_must_be_a_single_token() {
        let app = app();
        let split = app.key("x").child("a.b");
        assert_eq!(split.as_str(), "x.a.b");
        assert_eq!(
            split.error(),
            Some(crate::key::KeyError::InvalidCharacter)
        );
        assert_eq!(
            app.root().child("").error(),
            Some(crate::key::KeyError::EmptyComponent)
        );
        assert_eq!(
            app.key("a").child("").error(),
            Some(crate::key::KeyError::EmptyComponent)
        );
    }

    #[tokio::test]
    async fn child_unique_produces_a_valid_child() {
        let app = app();
        let child = app.key("tests").child_unique();
        assert!(child.error().is_none());
        assert_eq!(child.parent().as_str(), "tests");
    }

    #[tokio::test]
    async fn key_from_components_joins() {
        let app = app();
        let key = app.key_from_components(["a", "b"]);
        assert_eq!(key.as_str(), "a.b");
        assert!(key.error().is_none());
    }

    #[tokio::test]
    async fn pattern_flag() {
        let app = app();
        assert!(app.key("a.*").is_pattern());
        assert!(app.key("a.#").is_pattern());
        assert!(!app.key("a.b").is_pattern());
    }

    #[test]
    fn write_data_conversions() {
        assert!(matches!(WriteData::from("x"), WriteData::Text(_)));
        assert_eq!(WriteData::from("x").into_text().unwrap(), "x");
        assert_eq!(
            WriteData::from(json!({"v": 1})).into_text().unwrap(),
            "{\"v\":1}"
        );
        assert_eq!(
            WriteData::from(json!(["a", 1])).into_text().unwrap(),
            "[\"a\",1]"
        );
        // A JSON string is a string: sent verbatim, unquoted.
        assert_eq!(WriteData::from(json!("raw")).into_text().unwrap(), "raw");
    }

    #[test]
    fn primitive_write_data_rejected() {
        for value in [json!(null), json!(true), json!(4)] {
            let err = WriteData::from(value).into_text().unwrap_err();
            assert_eq!(err.code(), 3);
        }
    }

    #[tokio::test]
    async fn write_to_pattern_is_rejected_locally() {
        let app = app();
        let err = app.key("a.*").write("x").await.unwrap_err();
        assert_eq!(err.code(), 4);
    }

    #[tokio::test]
    async fn write_to_invalid_key_fails_with_key_error() {
        let app = app();
        let err = app.key("a..b").write("x").await.unwrap_err();
        assert_eq!(err.code(), 2);
    }

    #[tokio::test]
    async fn listen_on_invalid_key_reports_through_listener() {
        let app = app();
        let (tx, mut rx) = mpsc::unbounded_channel();
        app.key("bad key").listen(move |event: Result<Value, ClientError>| {
            let _ = tx.send(event);
        });
        let event = rx.recv().await.unwrap();
        assert_eq!(event.unwrap_err().code(), 2);
    }
}
