#![forbid(unsafe_code)]
//! Async OpenFlow controller framework over an external protocol engine.
//!
//! The heavy lifting of the OpenFlow wire protocol lives in a separate
//! engine process (an `oftr`-style tool speaking line-delimited JSON-RPC
//! over stdio). This crate supplies everything around it: the event
//! dispatch loop, request/reply correlation with multipart and timeout
//! support, per-datapath task scoping, and an orderly startup/shutdown
//! sequence.
//!
//! ## Writing an app
//!
//! Apps implement [`App`] and receive events through `on_*` handlers.
//! Handlers are synchronous; longer work is spawned with
//! [`Datapath::create_task`] (cancelled automatically when that switch
//! disconnects) or [`ControllerHandle::create_task`].
//!
//! ```rust,no_run
//! use ofkit::{App, Controller, ControllerHandle, Datapath, Event, HandlerResult};
//! use serde_json::json;
//!
//! struct Switch;
//!
//! impl App for Switch {
//!     fn on_channel_up(
//!         &mut self,
//!         _controller: &ControllerHandle,
//!         dp: &Datapath,
//!         _event: &Event,
//!     ) -> HandlerResult {
//!         dp.send(Event::message("FLOW_MOD").with("msg", json!({"table_id": 0})))?;
//!         Ok(())
//!     }
//! }
//!
//! # #[tokio::main]
//! # async fn main() {
//! let status = Controller::builder().app(Switch).build().run().await;
//! std::process::exit(status);
//! # }
//! ```
//!
//! ## Requests and replies
//!
//! [`Datapath::request`] and [`ControllerHandle::request`] return a
//! [`ReplyHandle`]. Await a single reply with [`ReplyHandle::next`], or
//! drain a multipart reply with [`ReplyHandle::recv`] in a `while let`
//! loop. Errors, delivery failures, and timeouts all arrive through the
//! same handle as terminal [`ReplyError`] values.
//!
//! ## Lifecycle
//!
//! `INIT → PRESTART → START → STOP → POSTSTOP`. After the engine opens,
//! the controller checks the engine description, installs the TLS identity
//! when configured, and starts listening; apps then get `on_start`. Events
//! dispatch until an `EXIT` event arrives (signal, engine EOF, or
//! [`ControllerHandle::shutdown`]); remaining tasks are cancelled and
//! drained before `on_stop`.

mod app;
mod config;
mod controller;
mod datapath;
mod dispatch;
mod error;
mod event;
pub mod ofmatch;
mod packet;
mod reply;
mod rpc;
mod tasklist;
mod transport;

pub use app::{App, HandlerError, HandlerResult};
pub use config::{BackendConfig, Configuration, ExitSignal, TlsConfig};
pub use controller::{Controller, ControllerBuilder, ControllerHandle, Phase};
pub use datapath::{Datapath, DatapathId};
pub use error::{ControllerError, EXIT_STATUS_ERROR, EXIT_STATUS_OK};
pub use event::{Event, EventKind};
pub use reply::{ReplyError, ReplyHandle};
pub use tasklist::TaskRef;
pub use transport::{SubprocessTransport, Transport, TransportLink};

#[cfg(test)]
mod tests;
