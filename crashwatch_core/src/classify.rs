use std::process::ExitStatus;

/// A named status code that denotes a memory-safety or control-flow fault.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CatalogEntry {
    pub code: u32,
    pub name: &'static str,
}

const fn entry(code: u32, name: &'static str) -> CatalogEntry {
    CatalogEntry { code, name }
}

/// Every termination code that counts as a crash. Nothing outside this table
/// is ever classified as one.
pub const EXCEPTION_CATALOG: &[CatalogEntry] = &[
    entry(0x8000_0001, "STATUS_GUARD_PAGE_VIOLATION"),
    entry(0x8000_0002, "EXCEPTION_DATATYPE_MISALIGNMENT"),
    entry(0x8000_0005, "STATUS_BUFFER_OVERFLOW"),
    entry(0xC000_0005, "STATUS_ACCESS_VIOLATION"),
    entry(0xC000_0009, "STATUS_BAD_INITIAL_STACK"),
    entry(0xC000_000A, "STATUS_BAD_INITIAL_PC"),
    entry(0xC000_001D, "STATUS_ILLEGAL_INSTRUCTION"),
    entry(0xC000_0025, "EXCEPTION_NONCONTINUABLE_EXCEPTION"),
    entry(0xC000_0026, "EXCEPTION_INVALID_DISPOSITION"),
    entry(0xC000_008C, "EXCEPTION_ARRAY_BOUNDS_EXCEEDED"),
    entry(0xC000_008D, "STATUS_FLOAT_DENORMAL_OPERAND"),
    entry(0xC000_008E, "EXCEPTION_FLT_DIVIDE_BY_ZERO"),
    entry(0xC000_008F, "EXCEPTION_FLOAT_INEXACT_RESULT"),
    entry(0xC000_0090, "EXCEPTION_FLT_INVALID_OPERATION"),
    entry(0xC000_0091, "EXCEPTION_FLT_OVERFLOW"),
    entry(0xC000_0092, "EXCEPTION_FLT_STACK_CHECK"),
    entry(0xC000_0093, "EXCEPTION_FLT_UNDERFLOW"),
    entry(0xC000_0094, "EXCEPTION_INT_DIVIDE_BY_ZERO"),
    entry(0xC000_0095, "EXCEPTION_INT_OVERFLOW"),
    entry(0xC000_0096, "STATUS_PRIVILEGED_INSTRUCTION"),
    entry(0xC000_00FD, "STATUS_STACK_OVERFLOW"),
    entry(0xC000_02B4, "STATUS_FLOAT_MULTIPLE_FAULTS"),
    entry(0xC000_02B5, "STATUS_FLOAT_MULTIPLE_TRAPS"),
    entry(0xC000_02C5, "STATUS_DATATYPE_MISALIGNMENT_ERROR"),
    entry(0xC000_02C9, "STATUS_REG_NAT_CONSUMPTION"),
];

/// Verdict for a single termination code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Crash(&'static CatalogEntry),
    NotCrash,
}

impl Verdict {
    pub fn is_crash(&self) -> bool {
        matches!(self, Verdict::Crash(_))
    }
}

/// Maps an unsigned 32-bit termination code onto a verdict.
pub fn classify(code: u32) -> Verdict {
    match EXCEPTION_CATALOG.iter().find(|e| e.code == code) {
        Some(e) => Verdict::Crash(e),
        None => Verdict::NotCrash,
    }
}

/// Reinterprets a reported exit code as unsigned. Status codes such as
/// 0xC0000005 surface as negative `i32` values on some platforms.
pub fn reinterpret_code(raw: i32) -> u32 {
    raw as u32
}

#[cfg(unix)]
fn signal_code(signal: i32) -> u32 {
    use nix::sys::signal::Signal;

    match Signal::try_from(signal) {
        Ok(Signal::SIGSEGV) => 0xC000_0005,
        Ok(Signal::SIGILL) => 0xC000_001D,
        Ok(Signal::SIGFPE) => 0xC000_0094,
        Ok(Signal::SIGBUS) => 0x8000_0002,
        _ => 128u32.wrapping_add(signal as u32),
    }
}

/// The raw termination code for an exited process, reinterpreted as `u32`.
///
/// On Unix a signal death has no exit code; fatal signals are mapped onto the
/// catalog code with the same meaning and every other signal onto the
/// shell convention `128 + N`.
pub fn termination_code(status: &ExitStatus) -> u32 {
    if let Some(code) = status.code() {
        return reinterpret_code(code);
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return signal_code(signal);
        }
    }
    // Neither an exit code nor a signal; report a generic failure.
    1
}
