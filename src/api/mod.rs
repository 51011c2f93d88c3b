//! Application API
//!
//! The facade an outer service layer (HTTP, RPC) calls into.
//!
//! # Operations
//!
//! ## Connections
//! - `get_connection_status` - bridge status and peer count
//! - `establish_connection` - dial a peer by `host:port`
//!
//! ## Sync
//! - `sync_knowledge_to_peer`, `share_experience_with_peer`,
//!   `report_error_to_peer`, `request_support_from_peer`
//!
//! ## Broadcast
//! - `share_milestone`, `sync_facility_update`, `request_emergency_support`
//!
//! ## Introspection
//! - `check_network_health`, `get_bridge_config`

pub mod handlers;

pub use handlers::{ApiError, ApiResult, BridgeApi, BridgeConfigView, ConnectionStatus};
