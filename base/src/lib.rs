//! The `base` crate defines the machine-related value types which
//! are useful both in the emulator core and in any associated tools
//! (a debugger or a loader for example).  Such a tool would depend on
//! the base crate without needing the emulator library itself.

mod types;

pub mod collections;
pub mod prelude;

pub use crate::types::*;

/// Build a [`PhysicalAddress`] from a constant, checking at compile
/// time that it fits in 22 bits.
#[macro_export]
macro_rules! pa {
    ($n:expr) => {
        $crate::prelude::PhysicalAddress::new::<{ $n }>()
    };
}

#[test]
fn test_pa() {
    use prelude::PhysicalAddress;
    let p: PhysicalAddress = pa!(0o17777572);
    let q: PhysicalAddress =
        PhysicalAddress::try_from(0o17777572_u32).expect("test data should be in range");
    assert_eq!(p, q);
    assert!(p.is_in_io_page());
}
