//! conntrack: bounded connection-tracking admission with priority fairness.
//!
//! An [`Instance`] caps how many distinct [`Entry`]s may be tracked at once.
//! Callers [`wait`](Instance::wait) for an entry and receive an
//! [`EntryHandle`]; releasing it with [`EntryHandle::done`] keeps the slot
//! reserved for a per-entry linger period before it is freed, the way a kernel
//! conntrack table holds on to recently closed flows.

mod handle;
mod instance;
mod registry;
mod store;

pub mod cancel;
pub mod config;
pub mod entry;
pub mod status;

pub use cancel::{CancellationToken, cancel_after};
pub use config::{Capacity, ConfigError, ConntrackConfig};
pub use entry::{Entry, Priority};
pub use handle::EntryHandle;
pub use instance::Instance;
pub use status::{HandleStatus, ReasonCount, StatusSnapshot};
