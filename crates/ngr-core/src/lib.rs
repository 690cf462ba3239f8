//! # ngr-core
//!
//! Core library for the nago runner agent. It contains everything the agent
//! needs that does not talk to the network:
//!
//! - **Configuration model**: the declarative [`config::Runner`] document the
//!   control plane hands out, down to every systemd sandbox knob.
//! - **Wire events**: the tagged [`events::Event`] envelope exchanged over the
//!   runner websocket.
//! - **Settings**: the on-disk agent settings and derived control-plane
//!   [`settings::Endpoints`].
//! - **Hashing & atomic I/O**: SHA3-512 content addressing and the
//!   write-tmp-then-rename discipline every agent-owned file goes through.
//! - **Unit files**: rendering a [`config::ServiceUnit`] to systemd unit text
//!   with the embedded ownership header, and parsing it back.
//! - **Proc sampling**: `/proc` readers for the telemetry snapshot.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod events;
pub mod hashio;
pub mod manifest;
pub mod proc;
pub mod settings;
pub mod unit;

pub use config::{Application, Runner, ServiceUnit};
pub use events::Event;
pub use settings::{Endpoints, Settings};
pub use unit::{Service, ServicePaths};
