//! Asterisk Manager Interface (AMI) client for Rust
//!
//! This crate provides an async Rust client for the Asterisk manager
//! protocol, allowing applications to connect to a telephony server, execute
//! actions, and receive events.
//!
//! # Architecture
//!
//! The library uses a split reader/writer design:
//! - [`AmiClient`] (Clone + Send) — send actions from any task; each action
//!   gets its own completion signal, correlated by `ActionID`
//! - [`AmiEventStream`] — receive events from a background reader task
//!
//! # Examples
//!
//! ## Connect and send an action
//!
//! ```rust,no_run
//! use asterisk_ami_tokio::{Action, AmiClient, AmiError};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), AmiError> {
//!     let (client, mut events) = AmiClient::connect(
//!         "localhost", 5038, "manager", "secret",
//!     ).await?;
//!
//!     let done = client
//!         .run_action(Action::new("CoreStatus", [("marker", "demo")])?)
//!         .await?;
//!     println!("ok={} message={}", done.ok, done.response.message());
//!
//!     while let Some(Ok(event)) = events.recv().await {
//!         println!("{}", event.signature());
//!     }
//!     Ok(())
//! }
//! ```
//!
//! ## Concurrent actions
//!
//! Responses are matched by `ActionID`, so in-flight actions are independent —
//! the server may answer them in any order:
//!
//! ```rust,no_run
//! # async fn example(client: &asterisk_ami_tokio::AmiClient) -> Result<(), asterisk_ami_tokio::AmiError> {
//! use asterisk_ami_tokio::Action;
//!
//! let first = client.send_action(Action::new("Ping", [("marker", "1")])?).await?;
//! let second = client.send_action(Action::new("Ping", [("marker", "2")])?).await?;
//! let (a, b) = tokio::join!(first.wait(), second.wait());
//! assert!(a?.ok && b?.ok);
//! # Ok(())
//! # }
//! ```
//!
//! ## Filtered event handlers
//!
//! Handlers are bound with an optional [`Filter`] and run as independent
//! tasks; a handler with no filter sees every event. Filters come from the
//! builder API or the textual language:
//!
//! ```rust,no_run
//! # async fn example(client: &asterisk_ami_tokio::AmiClient, events: asterisk_ami_tokio::AmiEventStream) -> Result<(), Box<dyn std::error::Error>> {
//! use asterisk_ami_tokio::filter::parse_filter;
//!
//! let filter = parse_filter("event == DialBegin and exists event.Channel")?;
//! client.on_event(Some(filter), |event| async move {
//!     println!("dial begin on {}", event.get("channel").unwrap_or("?"));
//! });
//!
//! // Push mode: handlers do all the work, this just pumps the queue.
//! events.run_dispatch_loop().await;
//! # Ok(())
//! # }
//! ```
//!
//! ## Typed event schemas
//!
//! Event names can be bound to declared field sets; the parser coerces the
//! declared fields and rejects events missing a required one:
//!
//! ```rust,no_run
//! use asterisk_ami_tokio::{AmiConnectOptions, EventRegistry, EventSchema, FieldType};
//! use std::sync::Arc;
//!
//! let mut registry = EventRegistry::new();
//! registry.register(
//!     EventSchema::new("Hangup")
//!         .required("channel", FieldType::Str)
//!         .required("cause", FieldType::Int)
//!         .optional("cause-txt", FieldType::Str),
//! );
//! let options = AmiConnectOptions {
//!     registry: Arc::new(registry),
//!     ..Default::default()
//! };
//! ```

#[macro_use]
mod macros;

pub mod action;
pub mod connection;
pub mod constants;
pub mod error;
pub mod event;
pub mod fields;
pub mod filter;
pub mod packet;
pub mod protocol;

pub(crate) mod buffer;

pub use action::{Action, ActionHandle, CompletedAction, Response};
pub use connection::{
    AmiClient, AmiConnectOptions, AmiEventStream, ConnectionStatus, DisconnectReason,
};
pub use constants::DEFAULT_AMI_PORT;
pub use error::{AmiError, AmiResult};
pub use event::{Event, EventRegistry, EventSchema, FieldType, FieldValue, MissingOptional};
pub use fields::EventField;
pub use filter::{Filter, ParseFilterError};
pub use packet::{Packet, PacketKind};
pub use protocol::{parse_server_signature, serialize_packet, IncomingPacket, Parser, ServerSignature};
