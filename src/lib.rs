//! Driver for the Cadence HPNFC NAND flash controller.
//!
//! [`Controller`] probes the controller through a [`platform::Platform`], identifies the flash
//! behind it and then serves page, spare and erase requests ([`nand::EccOps`]) plus the legacy
//! byte-stream interface ([`nand::LegacyOps`]). [`sim::SimPlatform`] models the controller and
//! its flash in memory.

pub mod command;
pub mod config;
pub mod controller;
pub mod descriptor;
pub mod error;
pub mod geometry;
pub mod nand;
pub mod onfi;
pub mod platform;
pub mod poll;
pub mod randomizer;
pub mod regs;
pub mod sim;
pub mod sync;

pub use controller::Controller;
pub use error::{Error, Result};
