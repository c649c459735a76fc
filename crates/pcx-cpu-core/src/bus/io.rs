use std::collections::HashSet;
use std::ops::RangeInclusive;

use tracing::warn;

use crate::fault::ConfigError;

/// A device decoding a range of I/O ports.
///
/// Ports are byte-wide; 16- and 32-bit accesses reach the device as consecutive byte accesses.
pub trait IoDevice {
    fn read_u8(&mut self, port: u16) -> u8;
    fn write_u8(&mut self, port: u16, value: u8);

    /// Name used in diagnostics.
    fn name(&self) -> &'static str;

    /// Return to the power-on state.
    fn reset(&mut self) {}
}

/// Handle to a device registered with an [`IoBus`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct IoDeviceId(usize);

struct PortRange {
    start: u16,
    end: u16,
    device: usize,
}

/// Port I/O dispatch.
///
/// Registrations may not overlap; reads of unclaimed ports float high (0xFF) and are logged
/// once per port since they usually point at a missing device in the machine wiring.
#[derive(Default)]
pub struct IoBus {
    devices: Vec<Box<dyn IoDevice>>,
    /// Sorted by `start`, non-overlapping.
    ranges: Vec<PortRange>,
    warned: HashSet<u16>,
}

impl IoBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &mut self,
        ports: RangeInclusive<u16>,
        device: Box<dyn IoDevice>,
    ) -> Result<IoDeviceId, ConfigError> {
        let (start, end) = (*ports.start(), *ports.end());
        if start > end {
            return Err(ConfigError::PortConflict {
                first: start,
                last: end,
                owner: device.name(),
            });
        }

        let idx = self.ranges.partition_point(|r| r.start < start);
        let conflict = [idx.checked_sub(1), Some(idx)]
            .into_iter()
            .flatten()
            .filter_map(|i| self.ranges.get(i))
            .find(|r| r.start <= end && start <= r.end);
        if let Some(existing) = conflict {
            return Err(ConfigError::PortConflict {
                first: start,
                last: end,
                owner: self.devices[existing.device].name(),
            });
        }

        self.devices.push(device);
        let id = self.devices.len() - 1;
        self.ranges.insert(
            idx,
            PortRange {
                start,
                end,
                device: id,
            },
        );
        Ok(IoDeviceId(id))
    }

    pub fn device_mut(&mut self, id: IoDeviceId) -> &mut dyn IoDevice {
        self.devices[id.0].as_mut()
    }

    pub fn reset(&mut self) {
        for device in &mut self.devices {
            device.reset();
        }
    }

    fn lookup(&self, port: u16) -> Option<usize> {
        let idx = self.ranges.partition_point(|r| r.start <= port);
        let range = self.ranges.get(idx.checked_sub(1)?)?;
        (port <= range.end).then_some(range.device)
    }

    fn unclaimed(&mut self, port: u16, write: bool) {
        if self.warned.insert(port) {
            warn!(port, write, "access to unregistered I/O port");
        }
    }

    pub fn read_u8(&mut self, port: u16) -> u8 {
        match self.lookup(port) {
            Some(device) => self.devices[device].read_u8(port),
            None => {
                self.unclaimed(port, false);
                0xff
            }
        }
    }

    pub fn write_u8(&mut self, port: u16, value: u8) {
        match self.lookup(port) {
            Some(device) => self.devices[device].write_u8(port, value),
            None => self.unclaimed(port, true),
        }
    }

    pub fn read_u16(&mut self, port: u16) -> u16 {
        u16::from_le_bytes([self.read_u8(port), self.read_u8(port.wrapping_add(1))])
    }

    pub fn read_u32(&mut self, port: u16) -> u32 {
        let mut bytes = [0u8; 4];
        for (i, byte) in bytes.iter_mut().enumerate() {
            *byte = self.read_u8(port.wrapping_add(i as u16));
        }
        u32::from_le_bytes(bytes)
    }

    pub fn write_u16(&mut self, port: u16, value: u16) {
        for (i, byte) in value.to_le_bytes().into_iter().enumerate() {
            self.write_u8(port.wrapping_add(i as u16), byte);
        }
    }

    pub fn write_u32(&mut self, port: u16, value: u32) {
        for (i, byte) in value.to_le_bytes().into_iter().enumerate() {
            self.write_u8(port.wrapping_add(i as u16), byte);
        }
    }
}
