//! INOS shared-memory coordination core.
//!
//! One contiguous byte buffer is mapped identically by three heterogeneous
//! layers (host, orchestration kernel, compute modules). This crate owns the
//! parts of that contract that live at the memory level:
//!
//! - a compile-time **layout catalogue** of region offsets and sizes,
//! - the **atomic flags array** (epochs, dirty bits, the arena bump word),
//! - the **epoch waiter** — wake-on-change with timeouts, blocking or async,
//! - a lock-free **MPMC ring transport** (length-prefixed byte frames),
//! - **region guards** enforcing per-region write ownership,
//! - an **arena bump allocator**.
//!
//! No pointers ever cross a layer boundary — only offsets into the shared
//! region, resolved through bounds-checked accessors.
//!
//! # Example
//!
//! ```
//! use inos_shm::{layout, EpochFlags, RingBuffer, SharedRegion};
//! use std::sync::Arc;
//!
//! let shm = Arc::new(SharedRegion::new(4096));
//! let flags = Arc::new(EpochFlags::new(Arc::clone(&shm)));
//! let ring = RingBuffer::new(
//!     Arc::clone(&shm),
//!     Arc::clone(&flags),
//!     layout::RegionId::Inbox,
//!     256,        // header offset
//!     8 + 256,    // header + payload arena
//!     layout::INBOX_DIRTY,
//!     false,
//! );
//!
//! ring.enqueue(b"hello").unwrap();
//! assert_eq!(ring.dequeue().unwrap(), b"hello");
//!
//! // Committing to a ring beats both its dirty flag and the master heartbeat.
//! assert_eq!(flags.read(layout::INBOX_DIRTY), 1);
//! assert_eq!(flags.read(layout::SYSTEM_EPOCH), 1);
//! ```

mod arena;
mod config;
mod error;
mod flags;
mod guard;
mod invariants;
pub mod layout;
mod metrics;
mod region;
mod ring;

pub use arena::ArenaAllocator;
pub use config::{ShmConfig, SizeTier};
pub use error::{GuardError, RingError, ShmError};
pub use flags::{EpochFlags, WaitOutcome};
pub use guard::{GuardTable, WriteGuard};
pub use layout::{AccessClass, RegionId, RegionSpec, Role};
pub use metrics::{MetricsSnapshot, TransportMetrics};
pub use region::SharedRegion;
pub use ring::RingBuffer;
