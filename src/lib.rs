//! SOE connection server
//!
//! A reliable UDP transport (the SOE protocol) with an application message
//! dispatch layer, and the connection server built on top of it.

// ============================================
// Core Modules
// ============================================

/// Server configuration
pub mod config;
/// SWG application messages
pub mod messages;
/// Byte buffers, checksums, SOE transport, message dispatch
pub mod network;
/// Server implementations (connection)
pub mod servers;
