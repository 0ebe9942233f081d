//! Server implementations
//!
//! - connection_server: session key validation and player hand-off

pub mod connection;
