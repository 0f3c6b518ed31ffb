//! Device link and firmware tooling for C88xx access chipsets.
//!
//! [`agent`] talks to a device (raw Ethernet frames or ASCII lines over UDP), [`register`]
//! and [`dbgc`] build typed register access and debug-core captures on top of it, and
//! [`firmware`] edits flash images offline.

pub mod agent;
pub mod dbgc;
pub mod firmware;
pub mod frame;
pub mod proto;
pub mod register;
pub mod retry;
pub mod session;
pub mod sim;
pub mod stats;
pub mod transport;
