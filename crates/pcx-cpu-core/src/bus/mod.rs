//! Physical memory map and port I/O.

mod io;
mod memory;

pub use io::{IoBus, IoDevice, IoDeviceId};
pub use memory::{range_is_dirty, CodeWatch, MmioHandler, ParagraphBitmap, PhysicalMemory};
