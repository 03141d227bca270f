use std::error::Error;
use std::fmt::{self, Display, Formatter};

use crate::bus::DeviceId;

/// Input from the host's user interface to an attached device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InputEvent {
    ConsoleKeyboardInput { data: Vec<u8> },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InputEventError {
    /// The device cannot accept any more input until the guest has
    /// consumed some of what it already holds.
    BufferUnavailable,

    /// InputOnUnattachedDevice means that the user has generated
    /// input for a device which has not been attached (or has since
    /// been detached).  This would likely be due to some
    /// configuration inconsistency between the user interface and the
    /// emulator core.
    InputOnUnattachedDevice(DeviceId),

    InputEventNotValidForDevice,
}

impl Display for InputEventError {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), fmt::Error> {
        match self {
            InputEventError::BufferUnavailable => f.write_str("buffer unavailable"),
            InputEventError::InputOnUnattachedDevice(id) => {
                write!(f, "input on {id}, which is not attached")
            }
            InputEventError::InputEventNotValidForDevice => {
                f.write_str("input event is not valid for this device")
            }
        }
    }
}

impl Error for InputEventError {}

/// Output from an attached device, for the host to display.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutputEvent {
    ConsolePrint { device: DeviceId, byte: u8 },
}
