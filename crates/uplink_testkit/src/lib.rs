//! # Uplink Testkit
//!
//! Test utilities for the uplink engine.
//!
//! This crate provides:
//! - Loopback clients that carry every transport to an in-process service
//! - Rigs that drive an uplink and the service on one manual timeline
//! - Property-based test generators using proptest
//! - Scripted simulations with faults and outages
//!
//! ## Usage
//!
//! ```rust
//! use std::time::Duration;
//! use uplink_testkit::prelude::*;
//!
//! let mut rig = Rig::http();
//! rig.uplink.set_snapshot([("temperature", "21.5")]);
//! rig.step(Duration::from_secs(1)).unwrap();
//! assert_eq!(rig.remote_value("temperature").as_deref(), Some("21.5"));
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod fixtures;
pub mod generators;
pub mod loopback;
pub mod simulation;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::fixtures::*;
    pub use crate::generators::*;
    pub use crate::loopback::*;
    pub use crate::simulation::*;
}

pub use fixtures::*;
pub use generators::*;
pub use loopback::*;
pub use simulation::*;
