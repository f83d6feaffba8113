//! Shared building blocks for the `mcp_relay` workspace.

/// Mutex-guarded state with atomic transitions.
pub mod state_machine;

pub use state_machine::StateMachine;
