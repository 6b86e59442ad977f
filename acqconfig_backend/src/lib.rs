//! # Acquisition configuration backend
//!
//! Configuration model shared by every part of a synchronized multi-channel acquisition:
//!
//! - [`controller`]: the capability interface of controller plugins and trigger/gate elements,
//! - [`element`]: acquirable elements, states and readout values,
//! - [`channel`]: per-cycle channel handles,
//! - [`config`]: the measurement configuration and its split by trigger modality,
//! - [`synch`]: synchronization descriptions and integration times,
//! - [`registry`]: binding of declarative descriptions to live controllers and elements.
//!
//! This crate performs no hardware access and spawns no thread; the acquisition loops live in
//! `acqctrl_backend`.

pub mod channel;
pub mod config;
pub mod controller;
pub mod element;
pub mod error;
pub mod registry;
pub mod synch;

#[cfg(test)]
mod testing;

pub use channel::*;
pub use config::*;
pub use controller::*;
pub use element::*;
pub use error::*;
pub use registry::*;
pub use synch::*;
