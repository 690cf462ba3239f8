//! # ngr-daemon
//!
//! The nago runner agent. It keeps one Linux node's application landscape in
//! sync with the central control plane:
//!
//! - [`bus`]: the persistent, auto-reconnecting websocket event bus.
//! - [`dispatch`]: routes inbound events to their handlers.
//! - [`reconcile`]: turns the declared [`ngr_core::Runner`] into unit files,
//!   executables and service-manager state, idempotently.
//! - [`proxy`]: renders the reverse-proxy configuration and reloads it.
//! - [`blob`]: the content-addressed blob store client.
//! - [`backup`]: the backup/restore engine on top of it.
//! - [`telemetry`]: the periodic statistics publisher.
//! - [`remote_fs`] and [`journal`]: the remote-administration handlers.
//! - [`setup`]: settings loading and the thin install bootstrap.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod backup;
pub mod blob;
pub mod bus;
pub mod dispatch;
pub mod journal;
pub mod layout;
pub mod proxy;
pub mod reconcile;
pub mod remote_fs;
pub mod runcmd;
pub mod setup;
pub mod sysmgr;
pub mod telemetry;

pub use layout::Layout;
