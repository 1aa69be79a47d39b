//! rdmsync destination contract
//!
//! The destination is the research-data repository holding the canonical
//! dataset. Implementations:
//! - Memory (testing)
//! - Local directory

pub mod destination;
pub mod local;
pub mod memory;

pub use destination::{Destination, DestinationCapabilities, Registration};
pub use local::LocalDestination;
pub use memory::{DestinationStats, MemoryDestination};
