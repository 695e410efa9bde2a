//! Client core for the Tidepool real-time hierarchical key/value
//! synchronization service.
//!
//! An [`App`] maintains one authenticated session with a remote store,
//! tracks listener registrations on concrete keys and wildcard patterns,
//! and converges each listener on the latest value per concrete key with
//! strictly increasing version order per key. Reconciliation runs the
//! subscribe → advance → fetch protocol behind the scenes; user code only
//! sees keys, writes, and listener callbacks.
//!
//! ```no_run
//! # async fn demo() -> Result<(), tidepool::ClientError> {
//! let app = tidepool::connect("pool.example.com", 4404, true)?;
//! app.authenticate("demo", "token").await?;
//!
//! let inbox = app.key("chat.inbox.#");
//! inbox.listen(|event: Result<tidepool::Value, tidepool::ClientError>| {
//!     if let Ok(value) = event {
//!         println!("{} -> {:?}", value.key, value.data);
//!     }
//! });
//!
//! app.key("chat.inbox.hello").write("{\"text\":\"hi\"}").await?;
//! # Ok(())
//! # }
//! ```
//!
//! Verbose logging is organized by `tracing` target: `tidepool::facade`,
//! `tidepool::transport`, `tidepool::operation`, and `tidepool::response`
//! can be enabled individually through the subscriber's filter.

pub mod acl;
pub mod client;
pub mod config;
pub mod error;
pub mod key;
pub mod operation;
pub mod protocol;
pub mod transport;

pub use acl::Acl;
pub use client::{App, AuthData, Key, ValueListener, WriteData, connect};
pub use config::Config;
pub use error::ClientError;
pub use key::{KeyError, KeyExpr};
pub use protocol::Value;

#[cfg(test)]
mod tests;
