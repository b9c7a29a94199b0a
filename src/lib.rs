//! Arena sync - authoritative state synchronization for a 2D arena shooter
//!
//! The server side runs fixed-tick rooms that own all player state, rewind
//! history for lag-compensated hits and per-client delta snapshots. The
//! client side ([`client`]) carries the matching netcode: input sequencing,
//! prediction with reconciliation, and snapshot interpolation.

pub mod app;
pub mod client;
pub mod config;
pub mod game;
pub mod http;
pub mod net;
pub mod sim;
pub mod util;
pub mod ws;
