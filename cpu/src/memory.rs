//! Installed main memory.
//!
//! Memory occupies physical addresses from 0 up to the configured
//! size, in 16-bit words.  Byte references select the low byte (even
//! addresses) or high byte (odd addresses) of a word.  A word
//! reference to an odd address is treated as a reference to the
//! containing word; processors which check for odd addresses do so
//! before the reference reaches memory.
//!
//! Parity is not emulated; the emulator behaves as if memory parity
//! errors never occur.
use std::fmt::{self, Debug, Formatter};
use std::num::TryFromIntError;

use tracing::{event, Level};

use base::prelude::*;

use crate::fault::BusFault;

pub struct MemoryUnit {
    words: Vec<u16>,
}

impl MemoryUnit {
    /// Fails only on hosts whose `usize` cannot count the words.
    pub fn new(size_bytes: u32) -> Result<MemoryUnit, TryFromIntError> {
        let words = usize::try_from(size_bytes / 2)?;
        event!(
            Level::DEBUG,
            "installing {} bytes ({} words) of memory",
            size_bytes,
            words
        );
        Ok(MemoryUnit {
            words: vec![0; words],
        })
    }

    pub fn size_bytes(&self) -> u32 {
        // The constructor took the size as a u32, so this cannot
        // overflow.
        (self.words.len() * 2) as u32
    }

    fn word_index(&self, pa: PhysicalAddress) -> Option<usize> {
        let index = usize::try_from(pa.bits() >> 1).ok()?;
        if index < self.words.len() {
            Some(index)
        } else {
            None
        }
    }

    pub fn contains(&self, pa: PhysicalAddress) -> bool {
        self.word_index(pa).is_some()
    }

    pub fn read(&self, pa: PhysicalAddress, width: Width) -> Result<u16, BusFault> {
        match self.word_index(pa) {
            Some(index) => Ok(width.extract(pa.is_odd(), self.words[index])),
            None => Err(BusFault::NonExistentResource(pa)),
        }
    }

    pub fn write(&mut self, pa: PhysicalAddress, width: Width, value: u16) -> Result<(), BusFault> {
        match self.word_index(pa) {
            Some(index) => {
                let word = &mut self.words[index];
                *word = width.merge(pa.is_odd(), *word, value);
                Ok(())
            }
            None => Err(BusFault::NonExistentResource(pa)),
        }
    }

    /// Copy `image` into memory starting at `origin`, as a loader
    /// would.  Fails without modifying memory if the image does not
    /// fit.
    pub fn load_bytes(&mut self, origin: PhysicalAddress, image: &[u8]) -> Result<(), BusFault> {
        let len = u32::try_from(image.len())
            .map_err(|_| BusFault::NonExistentResource(PhysicalAddress::MAX))?;
        if len > 0 {
            let last = origin
                .checked_add(len - 1)
                .ok_or(BusFault::NonExistentResource(PhysicalAddress::MAX))?;
            if !self.contains(last) {
                return Err(BusFault::NonExistentResource(last));
            }
        }
        for (pa, byte) in (origin.bits()..).map(PhysicalAddress::masked).zip(image) {
            self.write(pa, Width::Byte, u16::from(*byte))?;
        }
        Ok(())
    }
}

impl Debug for MemoryUnit {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), fmt::Error> {
        f.debug_struct("MemoryUnit")
            .field("size_bytes", &self.size_bytes())
            .finish_non_exhaustive()
    }
}

#[test]
fn test_byte_and_word_lanes() {
    let mut mem = MemoryUnit::new(0o1000).expect("memory fits");
    let pa = pa!(0o100);
    mem.write(pa, Width::Word, 0o123456).expect("in range");
    assert_eq!(mem.read(pa, Width::Word), Ok(0o123456));
    assert_eq!(mem.read(pa!(0o101), Width::Byte), Ok(0o247));
    mem.write(pa!(0o101), Width::Byte, 0o001).expect("in range");
    assert_eq!(mem.read(pa, Width::Word), Ok(0o000456));
}

#[test]
fn test_references_beyond_installed_memory_fail() {
    let mut mem = MemoryUnit::new(0o1000).expect("memory fits");
    assert_eq!(mem.size_bytes(), 0o1000);
    assert!(mem.contains(pa!(0o777)));
    assert_eq!(
        mem.read(pa!(0o1000), Width::Word),
        Err(BusFault::NonExistentResource(pa!(0o1000)))
    );
    assert!(mem.write(pa!(0o1000), Width::Byte, 1).is_err());
}

#[test]
fn test_load_bytes_is_all_or_nothing() {
    let mut mem = MemoryUnit::new(8).expect("memory fits");
    assert!(mem.load_bytes(pa!(6), &[1, 2, 3]).is_err());
    assert_eq!(mem.read(pa!(6), Width::Word), Ok(0));
    mem.load_bytes(pa!(4), &[0o001, 0o002, 0o003, 0o004])
        .expect("image fits");
    assert_eq!(mem.read(pa!(4), Width::Word), Ok(0o001001));
    assert_eq!(mem.read(pa!(6), Width::Word), Ok(0o002003));
}
