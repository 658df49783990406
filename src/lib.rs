//! # Shmstore - Schema-Driven Shared Memory Object Store
//!
//! Shmstore compiles a JSON-style schema description into a fixed binary
//! layout inside a named POSIX shared-memory segment. Any number of
//! cooperating processes attach to the segment by name and read/write
//! strongly-typed fields by hierarchical path (dot- or slash-delimited),
//! protected by named semaphores.
//!
//! ## Features
//!
//! - **Schema-compiled layout**: nested field descriptions become stable
//!   byte offsets in type-segregated pools
//! - **First-writer initialization**: a validity header lets late attachers
//!   discover a fully defaulted segment
//! - **Typed path access**: coercing reads/writes with per-field update
//!   timestamps and a wait-for-change primitive
//! - **Change mirroring**: a private in-process copy that computes
//!   structured deltas with per-field hysteresis
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────┐
//! │                 Shmstore Core                    │
//! ├──────────────────────────────────────────────────┤
//! │  Schema compiler   │  Shared segment             │
//! │  - layout planner  │  - header + handshake       │
//! │  - prefix index    │  - typed pools              │
//! │  - directory       │  - named semaphores         │
//! └──────────────────────────────────────────────────┘
//!            │                      │
//!            ▼                      ▼
//! ┌──────────────────┐   ┌─────────────────────────┐
//! │   SharedStore    │   │      StoreMirror        │
//! │ (typed access)   │   │ (poll-and-diff deltas)  │
//! └──────────────────┘   └─────────────────────────┘
//! ```

// Core modules
pub mod access;
pub mod clock;
pub mod error;
pub mod layout;
pub mod mirror;
pub mod schema;
pub mod segment;
pub mod sem;
pub mod store;
pub mod tree;

// Main API re-exports
pub use error::{Result, StoreError};
pub use layout::{Directory, LayoutNode, NodeKind};
pub use mirror::StoreMirror;
pub use schema::{DefaultValue, SchemaKind, SchemaNode};
pub use segment::SharedSegment;
pub use sem::NamedSemaphore;
pub use store::SharedStore;

// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default configuration constants
pub mod config {
    /// Size of the segment header preceding the payload
    pub const HEADER_SIZE: u32 = 0x30;

    /// Bounded wait for an in-progress initializer (milliseconds)
    pub const INIT_WAIT_MS: u64 = 400;

    /// Poll interval used by `wait_for_update` (microseconds)
    pub const UPDATE_POLL_US: u64 = 50;

    /// Declared size assumed for `int` fields without a `size` key (bytes)
    pub const DEFAULT_INT_SIZE: u32 = 4;

    /// Declared size assumed for `string` fields without a `size` key (bytes)
    pub const DEFAULT_STRING_SIZE: u32 = 16;

    /// Prefix for per-container named semaphores
    pub const SEM_NAME_PREFIX: &str = "/snSem_";
}
