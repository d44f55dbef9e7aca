// ABOUTME: Root library module for the parley tool server
// ABOUTME: MCP tool façade, HTTP server wiring, and platform providers on top of parley-core

pub mod mcp;
pub mod platform;
pub mod server;

// Re-export platform-agnostic modules from parley-core
pub use parley_core::backlog;
pub use parley_core::config;
pub use parley_core::error;
pub use parley_core::filter;
pub use parley_core::metrics;
pub use parley_core::paths;
pub use parley_core::session;
pub use parley_core::traits;
pub use parley_core::waiter;
pub use parley_core::watermark;
