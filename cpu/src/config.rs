//! Construction-time configuration of the processor and its bus.
use std::error::Error;
use std::fmt::{self, Display, Formatter};
use std::str::FromStr;

use base::prelude::*;

use crate::bus::RegistrationError;

/// How many bits of physical address the processor implements.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PhysicalWidth {
    /// 18-bit physical addresses (256KiB, of which the top 8KiB is
    /// the I/O page).  Extended addressing cannot be enabled.
    Legacy18,
    /// 22-bit physical addresses.  Software must enable extended
    /// addressing in SR3 before addresses above 18 bits are formed.
    Extended22,
}

impl PhysicalWidth {
    /// The largest amount of memory which can be installed below the
    /// I/O page.
    pub const fn max_memory_bytes(&self) -> u32 {
        match self {
            PhysicalWidth::Legacy18 => LEGACY_IO_PAGE_BASE,
            PhysicalWidth::Extended22 => IO_PAGE_BASE,
        }
    }

    /// Mask of the implemented bits of a page relocation register.
    pub const fn relocation_mask(&self) -> u16 {
        match self {
            PhysicalWidth::Legacy18 => 0o7777,
            PhysicalWidth::Extended22 => 0o177777,
        }
    }
}

impl Display for PhysicalWidth {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), fmt::Error> {
        f.write_str(match self {
            PhysicalWidth::Legacy18 => "18-bit",
            PhysicalWidth::Extended22 => "22-bit",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CpuConfiguration {
    /// When set, word references to odd addresses trap.
    pub odd_address_traps: bool,
    pub physical_width: PhysicalWidth,
    /// Installed memory, in bytes, starting at physical address 0.
    pub memory_bytes: u32,
    /// Number of priority levels (the processor priority field is
    /// three bits wide so at most 8).
    pub priority_levels: u8,
    /// Number of vector slots in each priority level.
    pub slots_per_level: u8,
    /// Levels below this carry no device interrupt requests.
    pub lowest_device_level: u8,
}

impl CpuConfiguration {
    pub const MAX_SLOTS_PER_LEVEL: u8 = 64;

    pub fn validate(&self) -> Result<(), ConfigurationError> {
        if self.priority_levels == 0 || self.priority_levels > 8 {
            return Err(ConfigurationError::PriorityLevels(self.priority_levels));
        }
        if self.slots_per_level == 0 || self.slots_per_level > Self::MAX_SLOTS_PER_LEVEL {
            return Err(ConfigurationError::SlotsPerLevel(self.slots_per_level));
        }
        if self.lowest_device_level == 0 || self.lowest_device_level >= self.priority_levels {
            return Err(ConfigurationError::LowestDeviceLevel {
                lowest: self.lowest_device_level,
                levels: self.priority_levels,
            });
        }
        if self.memory_bytes % 2 != 0 || self.memory_bytes > self.physical_width.max_memory_bytes()
        {
            return Err(ConfigurationError::MemorySize {
                bytes: self.memory_bytes,
                width: self.physical_width,
            });
        }
        Ok(())
    }
}

impl Default for CpuConfiguration {
    fn default() -> CpuConfiguration {
        CpuModel::Pdp11_70.configuration()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigurationError {
    PriorityLevels(u8),
    SlotsPerLevel(u8),
    LowestDeviceLevel { lowest: u8, levels: u8 },
    MemorySize { bytes: u32, width: PhysicalWidth },
    /// The processor's own registers could not be placed in the I/O
    /// page.
    RegisterSpace(RegistrationError),
}

impl Display for ConfigurationError {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), fmt::Error> {
        match self {
            ConfigurationError::PriorityLevels(n) => {
                write!(f, "{n} priority levels requested, but 1 to 8 are supported")
            }
            ConfigurationError::SlotsPerLevel(n) => write!(
                f,
                "{n} vector slots per level requested, but 1 to {} are supported",
                CpuConfiguration::MAX_SLOTS_PER_LEVEL
            ),
            ConfigurationError::LowestDeviceLevel { lowest, levels } => write!(
                f,
                "lowest device interrupt level {lowest} must be between 1 and {}",
                levels.saturating_sub(1)
            ),
            ConfigurationError::MemorySize { bytes, width } => write!(
                f,
                "{bytes} bytes of memory cannot be installed on a processor with {width} physical addresses (limit {} bytes, even sizes only)",
                width.max_memory_bytes()
            ),
            ConfigurationError::RegisterSpace(e) => {
                write!(f, "cannot lay out processor registers: {e}")
            }
        }
    }
}

impl Error for ConfigurationError {}

/// Presets for the processor models we know about.
#[allow(non_camel_case_types)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CpuModel {
    Pdp11_34,
    Pdp11_45,
    Pdp11_70,
}

impl CpuModel {
    pub const fn all_models() -> [CpuModel; 3] {
        [CpuModel::Pdp11_34, CpuModel::Pdp11_45, CpuModel::Pdp11_70]
    }

    pub fn configuration(&self) -> CpuConfiguration {
        let (physical_width, memory_bytes) = match self {
            CpuModel::Pdp11_34 | CpuModel::Pdp11_45 => (PhysicalWidth::Legacy18, 256 * 1024 - 8192),
            CpuModel::Pdp11_70 => (PhysicalWidth::Extended22, 1024 * 1024),
        };
        CpuConfiguration {
            odd_address_traps: true,
            physical_width,
            memory_bytes,
            priority_levels: 8,
            slots_per_level: 32,
            lowest_device_level: 4,
        }
    }
}

impl Display for CpuModel {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), fmt::Error> {
        f.write_str(match self {
            CpuModel::Pdp11_34 => "11/34",
            CpuModel::Pdp11_45 => "11/45",
            CpuModel::Pdp11_70 => "11/70",
        })
    }
}

#[derive(Debug)]
pub struct UnknownModelName(String);

impl Display for UnknownModelName {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), fmt::Error> {
        write!(f, "unknown processor model '{}'", self.0)
    }
}

impl Error for UnknownModelName {}

impl FromStr for CpuModel {
    type Err = UnknownModelName;
    fn from_str(s: &str) -> Result<CpuModel, UnknownModelName> {
        match s.trim_start_matches("pdp").trim_start_matches('-') {
            "11/34" | "1134" => Ok(CpuModel::Pdp11_34),
            "11/45" | "1145" => Ok(CpuModel::Pdp11_45),
            "11/70" | "1170" => Ok(CpuModel::Pdp11_70),
            _ => Err(UnknownModelName(s.to_owned())),
        }
    }
}

#[test]
fn test_model_name_round_trip() {
    for model in CpuModel::all_models() {
        let name = model.to_string();
        match name.parse::<CpuModel>() {
            Ok(m) => assert_eq!(m, model),
            Err(e) => panic!("unable to round-trip model {model:?}: {e}"),
        }
    }
    assert_eq!("pdp-11/45".parse::<CpuModel>().ok(), Some(CpuModel::Pdp11_45));
    assert!("11/20".parse::<CpuModel>().is_err());
}

#[test]
fn test_presets_are_valid() {
    for model in CpuModel::all_models() {
        assert_eq!(model.configuration().validate(), Ok(()), "model {model}");
    }
}

#[test]
fn test_validate_rejects_bad_configurations() {
    let good = CpuConfiguration::default();
    let too_much_memory = CpuConfiguration {
        physical_width: PhysicalWidth::Legacy18,
        memory_bytes: LEGACY_IO_PAGE_BASE + 2,
        ..good.clone()
    };
    assert!(matches!(
        too_much_memory.validate(),
        Err(ConfigurationError::MemorySize { .. })
    ));
    let no_device_levels = CpuConfiguration {
        lowest_device_level: 8,
        ..good.clone()
    };
    assert!(matches!(
        no_device_levels.validate(),
        Err(ConfigurationError::LowestDeviceLevel { .. })
    ));
    let too_many_slots = CpuConfiguration {
        slots_per_level: 65,
        ..good
    };
    assert_eq!(
        too_many_slots.validate(),
        Err(ConfigurationError::SlotsPerLevel(65))
    );
}
