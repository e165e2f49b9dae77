//! An asynchronous client-side implementation of the D-Bus wire protocol.
//!
//! The crate is built from three layers:
//!
//! * A signature-driven codec: [`ByteWriter`], [`ByteReader`] and the
//!   dynamic [`Value`] model, implementing the D-Bus marshaling rules with
//!   strict natural alignment.
//! * Message framing: [`Header`] and [`Message`], the fixed-layout header
//!   plus the header-field array and the signature-decoded body.
//! * The session: [`Client`], which authenticates with the `EXTERNAL`
//!   mechanism, demultiplexes the inbound stream, correlates method replies
//!   by serial and dispatches signals and method calls to subscribers.
//!
//! # Examples
//!
//! ```no_run
//! use busio::Client;
//!
//! # #[tokio::main] async fn main() -> busio::Result<()> {
//! let client = Client::session_bus().await?;
//!
//! for name in client.list_names().await? {
//!     println!("{name}");
//! }
//!
//! let mut signals = client
//!     .signal_stream(None, Some("org.freedesktop.DBus"), Some("NameOwnerChanged"), None)
//!     .await?;
//!
//! while let Some(signal) = signals.next().await {
//!     println!("{:?}", signal.body);
//! }
//! # Ok(()) }
//! ```

#[doc(inline)]
pub use self::error::{Error, Result};
mod error;

#[doc(inline)]
pub use self::proto::{Endianness, FieldCode, Flags, MessageType};
mod proto;

#[doc(inline)]
pub use self::signature::SignatureError;
mod signature;

#[doc(inline)]
pub use self::value::Value;
mod value;

#[doc(inline)]
pub use self::writer::ByteWriter;
mod writer;

#[doc(inline)]
pub use self::reader::ByteReader;
mod reader;

#[doc(inline)]
pub use self::message::{Fields, Header, Message};
mod message;

mod address;

mod auth;

#[doc(inline)]
pub use self::client::{
    Client, MethodCallStream, Pattern, SignalStream, DEFAULT_CALL_TIMEOUT,
};
mod client;

#[doc(inline)]
pub use self::match_rule::{has_namespace, is_path_match, path_has_namespace, ArgMatch, MatchRule};
mod match_rule;

pub mod org_freedesktop_dbus;

mod utils;
