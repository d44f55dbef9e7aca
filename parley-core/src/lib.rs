// ABOUTME: Platform-agnostic core for bridging AI agents to chat platforms
// ABOUTME: Session lifecycle, event waiting, and backlog reconciliation behind a connection-provider seam

pub mod backlog;
pub mod config;
pub mod error;
pub mod filter;
pub mod memory;
pub mod metrics;
pub mod paths;
pub mod session;
pub mod traits;
pub mod waiter;
pub mod watermark;

pub use backlog::{BacklogReconciler, BatchOrigin, Scope, UnreadBatch};
pub use error::{BacklogError, FilterError, ProviderError, RelayError, SessionEstablishmentError};
pub use filter::MessageFilter;
pub use session::{Session, SessionLease, SessionManager, SessionMode, SessionState};
pub use waiter::{PendingWait, WaitOutcome, WaiterRegistry};
pub use watermark::{AdvanceOutcome, MemoryWatermarkStore, SqliteWatermarkStore, WatermarkStore};

// Re-export core traits for convenient access
pub use traits::{
    Connection, ConnectionProvider, Credential, EventStream, HistoryQuery, IdentityKey,
    IncomingMessage,
};
