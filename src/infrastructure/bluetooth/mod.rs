//! Bluetooth Module
//!
//! BLE plumbing for the bed.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                 Coordinator (crate::coordinator)          │
//! └───────┬──────────────────┬───────────────────┬───────────┘
//!         │                  │                   │
//!         ▼                  ▼                   ▼
//! ┌──────────────┐  ┌─────────────────┐  ┌──────────────┐
//! │   Scanner    │  │   Connection    │  │     Auth     │
//! │ - address    │  │ - gate          │  │ - PIN frames │
//! │   resolution │  │ - retry/backoff │  │ - outcomes   │
//! └──────┬───────┘  └────────┬────────┘  └──────────────┘
//!        └─────────┬─────────┘
//!                  ▼
//!        ┌───────────────────┐      ┌──────────────┐
//!        │ Transport traits  │◀─────│   btleplug   │
//!        └───────────────────┘      └──────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`] - Frame layouts, commands and notification parsing
//! - [`transport`] - Backend/link traits the rest of the crate talks to
//! - [`btleplug_backend`] - Real adapter access
//! - [`scanner`] - Address resolution
//! - [`connection`] - Connection gate and retry policy
//! - [`auth`] - PIN handshake

pub mod auth;
pub mod btleplug_backend;
pub mod connection;
pub mod error;
pub mod protocol;
pub mod scanner;
pub mod transport;

#[cfg(test)]
pub mod fake;

pub use btleplug_backend::BtleplugBackend;
