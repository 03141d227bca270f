//! Collection types used by the emulator.
pub mod pq;
