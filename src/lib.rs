//! Wakegate - A wake-on-demand gateway for a game server
//!
//! The gateway listens where players expect the game server and:
//! - Answers server-list pings with a status built from the control plane
//!   and a direct liveness probe of the backend
//! - Starts the server through the control plane when a player tries to
//!   join while it is offline or unresponsive
//! - Sends at most one start command per cooldown window, however many
//!   players try to join at once
//! - Tells players to connect to the server directly once it is up

pub mod admin;
pub mod composer;
pub mod config;
pub mod control_plane;
pub mod engine;
pub mod error;
pub mod gate;
pub mod probe;
pub mod protocol;
pub mod server;
pub mod status;
