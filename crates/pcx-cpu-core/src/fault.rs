use pcx_mmu::PageFault;
use thiserror::Error;

/// A guest-visible processor exception raised while executing an instruction.
///
/// Handlers return these instead of touching the IDT themselves; the engine delivers them at a
/// single point after restoring EIP to the faulting instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum Fault {
    #[error("#DE divide error")]
    DivideError,
    #[error("#DB debug")]
    Debug,
    #[error("#BP breakpoint")]
    Breakpoint,
    #[error("#OF overflow")]
    Overflow,
    #[error("#BR bound range exceeded")]
    BoundRange,
    #[error("#UD invalid opcode")]
    InvalidOpcode,
    #[error("#NM device not available")]
    DeviceNotAvailable,
    #[error("#DF double fault")]
    DoubleFault,
    #[error("#TS invalid TSS (selector {0:#06x})")]
    InvalidTss(u16),
    #[error("#NP segment not present (selector {0:#06x})")]
    SegmentNotPresent(u16),
    #[error("#SS stack fault (selector {0:#06x})")]
    StackFault(u16),
    #[error("#GP general protection (selector {0:#06x})")]
    GeneralProtection(u16),
    #[error("#PF page fault at {addr:#010x} (error code {code:#x})")]
    PageFault { addr: u32, code: u32 },
    #[error("#MF x87 floating point error")]
    FloatingPoint,
    #[error("#AC alignment check")]
    AlignmentCheck,
}

/// Shorthand for `#GP(0)`.
pub const GP0: Fault = Fault::GeneralProtection(0);

impl Fault {
    pub const fn vector(self) -> u8 {
        match self {
            Fault::DivideError => 0,
            Fault::Debug => 1,
            Fault::Breakpoint => 3,
            Fault::Overflow => 4,
            Fault::BoundRange => 5,
            Fault::InvalidOpcode => 6,
            Fault::DeviceNotAvailable => 7,
            Fault::DoubleFault => 8,
            Fault::InvalidTss(_) => 10,
            Fault::SegmentNotPresent(_) => 11,
            Fault::StackFault(_) => 12,
            Fault::GeneralProtection(_) => 13,
            Fault::PageFault { .. } => 14,
            Fault::FloatingPoint => 16,
            Fault::AlignmentCheck => 17,
        }
    }

    /// The error code pushed on a protected-mode delivery, if this exception has one.
    pub const fn error_code(self) -> Option<u32> {
        match self {
            Fault::DoubleFault | Fault::AlignmentCheck => Some(0),
            Fault::InvalidTss(sel)
            | Fault::SegmentNotPresent(sel)
            | Fault::StackFault(sel)
            | Fault::GeneralProtection(sel) => Some(sel as u32),
            Fault::PageFault { code, .. } => Some(code),
            _ => None,
        }
    }

    pub(crate) fn class(self) -> FaultClass {
        match self {
            Fault::PageFault { .. } => FaultClass::PageFault,
            Fault::DoubleFault => FaultClass::DoubleFault,
            Fault::DivideError
            | Fault::InvalidTss(_)
            | Fault::SegmentNotPresent(_)
            | Fault::StackFault(_)
            | Fault::GeneralProtection(_) => FaultClass::Contributory,
            _ => FaultClass::Benign,
        }
    }
}

impl From<PageFault> for Fault {
    fn from(pf: PageFault) -> Self {
        Fault::PageFault {
            addr: pf.addr,
            code: pf.error_code,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FaultClass {
    Benign,
    Contributory,
    PageFault,
    DoubleFault,
}

/// Whether `second`, raised while delivering `first`, escalates to a double fault.
pub(crate) fn should_double_fault(first: Fault, second: Fault) -> bool {
    use FaultClass as C;
    matches!(
        (first.class(), second.class()),
        (C::Contributory, C::Contributory | C::PageFault)
            | (C::PageFault, C::Contributory | C::PageFault)
    )
}

/// Host-side wiring errors, reported while a machine is being assembled.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConfigError {
    #[error("memory region {base:#010x}+{len:#x} overlaps an existing mapping")]
    MemoryOverlap { base: u32, len: u32 },

    #[error("memory region {base:#010x}+{len:#x} is not aligned to {alignment:#x}")]
    Misaligned { base: u32, len: u32, alignment: u32 },

    #[error("memory region {base:#010x}+{len:#x} is outside the 4 GiB physical space")]
    OutOfRange { base: u32, len: u64 },

    #[error("I/O ports {first:#06x}..={last:#06x} are already claimed by {owner}")]
    PortConflict {
        first: u16,
        last: u16,
        owner: &'static str,
    },

    #[error("invalid RAM size {0:#x}")]
    InvalidRamSize(usize),

    #[error("invalid base frequency {0} Hz")]
    InvalidFrequency(f64),

    #[error("REP iteration budget must be at least 1")]
    InvalidRepBudget,

    #[error("code cache sweep interval must be at least one cycle")]
    InvalidSweepInterval,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vectors_and_error_codes() {
        assert_eq!(Fault::DivideError.vector(), 0);
        assert_eq!(Fault::DivideError.error_code(), None);
        assert_eq!(Fault::GeneralProtection(0x1b).error_code(), Some(0x1b));
        assert_eq!(Fault::DoubleFault.error_code(), Some(0));
        let pf = Fault::from(PageFault {
            addr: 0x1234,
            error_code: 0b111,
        });
        assert_eq!(pf.vector(), 14);
        assert_eq!(pf.error_code(), Some(7));
    }

    #[test]
    fn double_fault_classes() {
        let pf = Fault::PageFault { addr: 0, code: 0 };
        assert!(should_double_fault(GP0, Fault::InvalidTss(8)));
        assert!(should_double_fault(GP0, pf));
        assert!(should_double_fault(pf, pf));
        assert!(should_double_fault(pf, Fault::StackFault(0)));
        assert!(!should_double_fault(pf, Fault::InvalidOpcode));
        assert!(!should_double_fault(Fault::Breakpoint, GP0));
        assert!(!should_double_fault(GP0, Fault::Debug));
    }

    #[test]
    fn messages_name_the_exception() {
        assert_eq!(
            Fault::GeneralProtection(0x10).to_string(),
            "#GP general protection (selector 0x0010)"
        );
    }
}
