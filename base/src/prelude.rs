//! The prelude exports the value types which are used throughout the
//! emulator.  Providing this prelude is the main purpose of the base
//! crate.
pub use super::collections::pq::KeyedReversePriorityQueue;
pub use super::pa;
pub use super::types::*;
