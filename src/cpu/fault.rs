//! Guest fault taxonomy
//!
//! Every fault a guest program can induce is funneled through one of
//! these codes. The numeric values are a frozen ABI: compiled game
//! binaries and host tooling both interpret them, so codes are only
//! ever appended, never renumbered.

use serde::{Serialize, Deserialize};

/// Reason the runtime stopped executing guest code.
///
/// Faults are guest-induced and recoverable by a debugger; `Breakpoint`
/// and `Exit` are control transfers, not errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stop {
    Fault(FaultCode),
    Breakpoint,
    Exit,
}

/// Guest-induced fault codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum FaultCode {
    Unknown = 0x00,
    /// Call or SP adjustment pushed the stack below its limit
    StackOverflow = 0x01,
    /// SP-relative access outside the RAM window
    BadStack = 0x02,
    /// Branch or call target failed code validation
    BadCodeAddress = 0x03,
    /// Syscall number out of range or unassigned
    BadSyscall = 0x04,
    /// Load from an unmapped address
    LoadAddress = 0x05,
    /// Store to an unmapped or read-only address
    StoreAddress = 0x06,
    /// Misaligned load
    LoadAlignment = 0x07,
    /// Misaligned store
    StoreAlignment = 0x08,
    /// Instruction fetch from an unmapped address
    CodeFetch = 0x09,
    /// Misaligned branch target
    CodeAlignment = 0x0a,
    /// Reserved SVC encoding
    ReservedSvc = 0x0b,
    /// Reserved address-operation encoding
    ReservedAddrop = 0x0c,
    /// Guest requested abort
    Abort = 0x0d,
    /// Long-form SP-relative load out of range
    LongStackLoad = 0x0e,
    /// Long-form SP-relative store out of range
    LongStackStore = 0x0f,
    /// Preload hint with an invalid flash address
    PreloadAddress = 0x10,
    /// Saved frame pointer failed validation on return
    ReturnFrame = 0x11,
    /// Log syscall could not fetch its message data
    LogFetch = 0x12,
    /// Undefined instruction encoding
    ReservedInstr = 0x13,
    /// Syscall argument outside its legal domain
    SyscallParam = 0x14,
}

impl FaultCode {
    /// Stable numeric code, as persisted in fault records and reported
    /// over the debugger protocol.
    pub fn code(&self) -> u8 {
        *self as u8
    }

    /// Reconstruct a fault code from its numeric value.
    pub fn from_code(code: u8) -> Self {
        match code {
            0x01 => FaultCode::StackOverflow,
            0x02 => FaultCode::BadStack,
            0x03 => FaultCode::BadCodeAddress,
            0x04 => FaultCode::BadSyscall,
            0x05 => FaultCode::LoadAddress,
            0x06 => FaultCode::StoreAddress,
            0x07 => FaultCode::LoadAlignment,
            0x08 => FaultCode::StoreAlignment,
            0x09 => FaultCode::CodeFetch,
            0x0a => FaultCode::CodeAlignment,
            0x0b => FaultCode::ReservedSvc,
            0x0c => FaultCode::ReservedAddrop,
            0x0d => FaultCode::Abort,
            0x0e => FaultCode::LongStackLoad,
            0x0f => FaultCode::LongStackStore,
            0x10 => FaultCode::PreloadAddress,
            0x11 => FaultCode::ReturnFrame,
            0x12 => FaultCode::LogFetch,
            0x13 => FaultCode::ReservedInstr,
            0x14 => FaultCode::SyscallParam,
            _ => FaultCode::Unknown,
        }
    }

    /// Short human-readable label for the panic display.
    pub fn label(&self) -> &'static str {
        match self {
            FaultCode::Unknown => "unknown",
            FaultCode::StackOverflow => "stack overflow",
            FaultCode::BadStack => "bad stack address",
            FaultCode::BadCodeAddress => "bad code address",
            FaultCode::BadSyscall => "bad syscall number",
            FaultCode::LoadAddress => "bad load address",
            FaultCode::StoreAddress => "bad store address",
            FaultCode::LoadAlignment => "misaligned load",
            FaultCode::StoreAlignment => "misaligned store",
            FaultCode::CodeFetch => "code fetch fault",
            FaultCode::CodeAlignment => "misaligned code address",
            FaultCode::ReservedSvc => "reserved svc encoding",
            FaultCode::ReservedAddrop => "reserved address op",
            FaultCode::Abort => "aborted",
            FaultCode::LongStackLoad => "long stack load fault",
            FaultCode::LongStackStore => "long stack store fault",
            FaultCode::PreloadAddress => "bad preload address",
            FaultCode::ReturnFrame => "bad saved frame pointer",
            FaultCode::LogFetch => "log fetch fault",
            FaultCode::ReservedInstr => "undefined instruction",
            FaultCode::SyscallParam => "bad syscall argument",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_code_round_trip() {
        for code in 0u8..=0x14 {
            let fault = FaultCode::from_code(code);
            assert_eq!(fault.code(), code);
        }
    }

    #[test]
    fn test_unknown_codes_map_to_unknown() {
        assert_eq!(FaultCode::from_code(0xff), FaultCode::Unknown);
        assert_eq!(FaultCode::from_code(0x40), FaultCode::Unknown);
    }
}
