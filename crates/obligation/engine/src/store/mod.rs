//! Obligation storage seam.
//!
//! The engine never owns persistence. It reads and writes through
//! [`ObligationStore`]; [`InMemoryStore`] backs tests and the daemon.

mod memory;
mod traits;

pub use memory::InMemoryStore;
pub use traits::{ObligationFilter, ObligationStore, ObligationStream};
