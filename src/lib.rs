//! Octo bed controller
//!
//! Drives an Octo adjustable bed over BLE: address discovery, PIN handshake,
//! timed movement streams with dead-reckoned positions, calibration, keep-alive
//! and a diagnostic opcode scanner, all behind [`coordinator::Coordinator`].

pub mod console;
pub mod coordinator;
pub mod domain;
pub mod infrastructure;
