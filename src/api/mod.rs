// =============================================================================
// HTTP API
// =============================================================================

pub mod auth;
pub mod rest;
pub mod ws;
