//! Ownership of the register address space.
//!
//! Every window of register addresses belongs either to the
//! processor (status registers, page descriptor registers and so on)
//! or to one attached device.  Windows never overlap, and an attempt
//! to attach a device whose window would overlap an existing one, or
//! which cannot be given the interrupt vectors it asks for, changes
//! nothing.
use std::collections::BTreeMap;
use std::error::Error;
use std::fmt::{self, Debug, Display, Formatter};

use tracing::{event, Level};

use base::prelude::*;

use crate::interrupt::{InterruptFabric, InterruptRequest, VectorTable};
use crate::io::Device;
use crate::registers::ProcessorRegister;

/// Identifies an attached device for as long as it stays attached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DeviceId(u16);

impl DeviceId {
    pub const fn new(n: u16) -> DeviceId {
        DeviceId(n)
    }
}

impl Display for DeviceId {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), fmt::Error> {
        write!(f, "device #{}", self.0)
    }
}

/// A contiguous range of register addresses, `[base, base + len)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Window {
    base: PhysicalAddress,
    len: u32,
}

impl Window {
    pub const fn new(base: PhysicalAddress, len: u32) -> Window {
        Window { base, len }
    }

    pub fn base(&self) -> PhysicalAddress {
        self.base
    }

    pub fn len(&self) -> u32 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    fn end(&self) -> u32 {
        self.base.bits().saturating_add(self.len)
    }

    pub fn overlaps(&self, other: &Window) -> bool {
        self.base.bits() < other.end() && other.base.bits() < self.end()
    }

    /// The offset of `pa` within the window, if it is inside.
    pub fn offset_of(&self, pa: PhysicalAddress) -> Option<u32> {
        pa.offset_from(self.base).filter(|off| *off < self.len)
    }
}

impl Display for Window {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), fmt::Error> {
        write!(f, "[{:o}, {:o})", self.base.bits(), self.end())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistrationError {
    Overlap { requested: Window, existing: Window },
    SlotsExhausted { level: PriorityLevel, wanted: u8 },
    LevelNotInterruptCapable(PriorityLevel),
    OutsideRegisterSpace(Window),
}

impl Display for RegistrationError {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), fmt::Error> {
        match self {
            RegistrationError::Overlap {
                requested,
                existing,
            } => write!(
                f,
                "register window {requested} overlaps already-registered window {existing}"
            ),
            RegistrationError::SlotsExhausted { level, wanted } => write!(
                f,
                "priority level {level} does not have {wanted} contiguous free vector slots"
            ),
            RegistrationError::LevelNotInterruptCapable(level) => {
                write!(f, "devices cannot interrupt at priority level {level}")
            }
            RegistrationError::OutsideRegisterSpace(w) => {
                write!(f, "register window {w} is not within the I/O page")
            }
        }
    }
}

impl Error for RegistrationError {}

/// Who answers for a window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WindowOwner {
    Processor(ProcessorRegister),
    Device(DeviceId),
}

pub(crate) struct AttachedDevice {
    pub(crate) device: Box<dyn Device>,
    pub(crate) window: Window,
    pub(crate) vectors: Option<VectorTable>,
}

impl Debug for AttachedDevice {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), fmt::Error> {
        f.debug_struct("AttachedDevice")
            .field("device", &format_args!("<device: {}>", self.device.name()))
            .field("window", &self.window)
            .field("vectors", &self.vectors)
            .finish()
    }
}

#[derive(Debug, Default)]
pub struct DeviceRegistry {
    /// Windows, keyed by base address.
    windows: BTreeMap<u32, (Window, WindowOwner)>,
    devices: BTreeMap<DeviceId, AttachedDevice>,
    next_id: u16,
}

impl DeviceRegistry {
    pub fn new() -> DeviceRegistry {
        DeviceRegistry::default()
    }

    fn check_free(&self, window: Window) -> Result<(), RegistrationError> {
        match self
            .windows
            .values()
            .find(|(existing, _)| existing.overlaps(&window) || existing.base == window.base)
        {
            Some((existing, _)) => {
                event!(
                    Level::WARN,
                    "refusing window {window}: overlaps {existing}"
                );
                Err(RegistrationError::Overlap {
                    requested: window,
                    existing: *existing,
                })
            }
            None => Ok(()),
        }
    }

    /// Claim a window for one of the processor's own registers.
    pub(crate) fn reserve_processor(
        &mut self,
        window: Window,
        register: ProcessorRegister,
    ) -> Result<(), RegistrationError> {
        self.check_free(window)?;
        self.windows
            .insert(window.base.bits(), (window, WindowOwner::Processor(register)));
        Ok(())
    }

    /// Attach a device.  On failure nothing is changed: no window is
    /// claimed and no vector slot is assigned.
    pub fn register(
        &mut self,
        window: Window,
        device: Box<dyn Device>,
        interrupt: Option<InterruptRequest>,
        fabric: &mut InterruptFabric,
    ) -> Result<DeviceId, RegistrationError> {
        self.check_free(window)?;
        let id = DeviceId(self.next_id);
        let vectors = match interrupt {
            Some(request) => Some(fabric.reserve(id, request).inspect_err(|e| {
                event!(Level::WARN, "cannot attach {}: {e}", device.name());
            })?),
            None => None,
        };
        self.next_id += 1;
        event!(
            Level::INFO,
            "attached {} as {id} at {window}{}",
            device.name(),
            match &vectors {
                Some(v) => format!(
                    ", level {} vectors {}",
                    v.level,
                    v.vectors
                        .iter()
                        .map(|vector| format!("{vector:o}"))
                        .collect::<Vec<_>>()
                        .join("/")
                ),
                None => String::new(),
            }
        );
        self.windows
            .insert(window.base.bits(), (window, WindowOwner::Device(id)));
        self.devices.insert(
            id,
            AttachedDevice {
                device,
                window,
                vectors,
            },
        );
        Ok(id)
    }

    /// Detach a device, freeing its window and vector slots.
    pub fn remove(&mut self, id: DeviceId, fabric: &mut InterruptFabric) -> Option<Box<dyn Device>> {
        let attached = self.devices.remove(&id)?;
        self.windows.remove(&attached.window.base.bits());
        fabric.release(id);
        event!(Level::INFO, "detached {id} ({})", attached.device.name());
        Some(attached.device)
    }

    /// Find the owner of the window containing `pa`, and the offset
    /// of `pa` within it.
    pub fn lookup(&self, pa: PhysicalAddress) -> Option<(WindowOwner, u32)> {
        let (_, (window, owner)) = self.windows.range(..=pa.bits()).next_back()?;
        window.offset_of(pa).map(|offset| (*owner, offset))
    }

    pub fn window_of(&self, id: DeviceId) -> Option<Window> {
        self.devices.get(&id).map(|a| a.window)
    }

    pub fn vectors_of(&self, id: DeviceId) -> Option<&VectorTable> {
        self.devices.get(&id).and_then(|a| a.vectors.as_ref())
    }

    pub fn device_ids(&self) -> Vec<DeviceId> {
        self.devices.keys().copied().collect()
    }

    pub fn device(&self, id: DeviceId) -> Option<&dyn Device> {
        self.devices.get(&id).map(|a| a.device.as_ref())
    }

    pub(crate) fn attached_mut(&mut self, id: DeviceId) -> Option<&mut AttachedDevice> {
        self.devices.get_mut(&id)
    }
}
