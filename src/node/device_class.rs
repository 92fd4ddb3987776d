use std::fmt;

use serde::{Serialize, Deserialize};

use crate::commandclass::CommandClassKind;

/// Role of a device in the network
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BasicClass {
    Controller,
    StaticController,
    Slave,
    RoutingSlave,
    Unknown,
}

impl BasicClass {
    pub fn from_code(code: u8) -> Self {
        match code {
            0x01 => BasicClass::Controller,
            0x02 => BasicClass::StaticController,
            0x03 => BasicClass::Slave,
            0x04 => BasicClass::RoutingSlave,
            _ => BasicClass::Unknown,
        }
    }
}

/// Functional family of a device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum GenericClass {
    GenericController,
    StaticController,
    AvController,
    Display,
    Thermostat,
    WindowCovering,
    RepeaterSlave,
    BinarySwitch,
    MultilevelSwitch,
    RemoteSwitch,
    ToggleSwitch,
    SensorBinary,
    SensorMultilevel,
    Meter,
    EntryControl,
    SemiInteroperable,
    NonInteroperable,
    Unknown,
}

impl GenericClass {
    pub fn from_code(code: u8) -> Self {
        match code {
            0x01 => GenericClass::GenericController,
            0x02 => GenericClass::StaticController,
            0x03 => GenericClass::AvController,
            0x06 => GenericClass::Display,
            0x08 => GenericClass::Thermostat,
            0x09 => GenericClass::WindowCovering,
            0x0F => GenericClass::RepeaterSlave,
            0x10 => GenericClass::BinarySwitch,
            0x11 => GenericClass::MultilevelSwitch,
            0x12 => GenericClass::RemoteSwitch,
            0x13 => GenericClass::ToggleSwitch,
            0x20 => GenericClass::SensorBinary,
            0x21 => GenericClass::SensorMultilevel,
            0x31 => GenericClass::Meter,
            0x40 => GenericClass::EntryControl,
            0x50 => GenericClass::SemiInteroperable,
            0xFF => GenericClass::NonInteroperable,
            _ => GenericClass::Unknown,
        }
    }

    /// Classes every device of this family must support
    pub fn mandatory_command_classes(&self) -> &'static [CommandClassKind] {
        match self {
            GenericClass::BinarySwitch => &[CommandClassKind::SwitchBinary],
            _ => &[],
        }
    }
}

/// Basic, generic and specific device class reported by identify-node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeviceClass {
    pub basic: BasicClass,
    pub generic: GenericClass,
    pub specific: u8,
}

impl DeviceClass {
    pub fn new(basic: u8, generic: u8, specific: u8) -> Self {
        DeviceClass {
            basic: BasicClass::from_code(basic),
            generic: GenericClass::from_code(generic),
            specific,
        }
    }

    /// Whether both basic and generic class were recognized
    pub fn is_known(&self) -> bool {
        self.basic != BasicClass::Unknown && self.generic != GenericClass::Unknown
    }
}

impl Default for DeviceClass {
    fn default() -> Self {
        DeviceClass {
            basic: BasicClass::Unknown,
            generic: GenericClass::Unknown,
            specific: 0,
        }
    }
}

impl fmt::Display for DeviceClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}/{:?}/0x{:02X}", self.basic, self.generic, self.specific)
    }
}
