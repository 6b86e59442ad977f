//! # Acquisition control backend
//!
//! Runs the acquisitions described with `acqconfig_backend`. One request to the
//! [`AcquisitionCoordinator`](coordinator::AcquisitionCoordinator) is split by trigger
//! modality and fanned out to:
//!
//! - a hardware-triggered acquisition, started right away ([`acquisition`]),
//! - a software-triggered acquisition and a ZeroD integrator ([`zerod`]), cycled on the
//!   events of the trigger generation ([`tggeneration`]) through a worker pool
//!   ([`worker_pool`]) and debounced by [`busy_gate`],
//! - the trigger generation itself.
//!
//! Every timer- or monitor-driven cycle is loaded and started by the [`sequencer`] (master
//! controller last) and followed by a [`poll`] loop which converges every channel to its final
//! value and state. The common action skeleton lives in [`action`].
//!
//! [`sim`] provides simulated controllers and elements, used by the tests and by the demo
//! binary.

pub mod acquisition;
pub mod action;
pub mod busy_gate;
pub mod channel_set;
pub mod coordinator;
pub mod error;
pub mod poll;
pub mod sequencer;
pub mod settings;
pub mod sim;
pub mod tggeneration;
pub mod utils;
pub mod worker_pool;
pub mod zerod;

pub use crate::coordinator::AcquisitionCoordinator;
pub use crate::error::{AcqError, AcqResult};
pub use crate::settings::AcqSettings;
