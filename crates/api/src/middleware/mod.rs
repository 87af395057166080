//! Request guards.
//!
//! - [`gateway::GatewayAuth`] -- Requires the shared gateway token on management routes.

pub mod gateway;
