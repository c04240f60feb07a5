//! Raw collaborator status codes
//!
//! The remote-core driver, SharedRegion and MessageQ services all report a
//! signed 32-bit status. Negative values are failures; bits 16..=30 name the
//! reporting module and the low 16 bits carry the module-local code.

use std::fmt;

/// Module identifiers embedded in a status word
pub mod module {
    pub const MULTIPROC: u16 = 0x0A;
    pub const SHAREDREGION: u16 = 0x0B;
    pub const MESSAGEQ: u16 = 0x0C;
    pub const PROCMGR: u16 = 0x0E;
}

/// Signed status word returned by a collaborator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Status(i32);

impl Status {
    pub const SUCCESS: Status = Status(0);

    pub const PROCMGR_E_FAIL: Status = Status::failure(module::PROCMGR, 0x01);
    pub const PROCMGR_E_INVALIDARG: Status = Status::failure(module::PROCMGR, 0x02);
    pub const PROCMGR_E_HANDLE: Status = Status::failure(module::PROCMGR, 0x05);
    pub const PROCMGR_E_INUSE: Status = Status::failure(module::PROCMGR, 0x0B);

    pub const MESSAGEQ_E_FAIL: Status = Status::failure(module::MESSAGEQ, 0x01);
    pub const MESSAGEQ_E_NOTFOUND: Status = Status::failure(module::MESSAGEQ, 0x06);
    pub const MESSAGEQ_E_TIMEOUT: Status = Status::failure(module::MESSAGEQ, 0x07);

    pub const SHAREDREGION_E_FAIL: Status = Status::failure(module::SHAREDREGION, 0x01);
    pub const SHAREDREGION_E_ALREADYEXISTS: Status = Status::failure(module::SHAREDREGION, 0x04);

    /// Build a failure status for `module` with module-local `code`
    pub const fn failure(module: u16, code: u16) -> Self {
        let raw = 0x8000_0000u32 | (((module as u32) & 0x7FFF) << 16) | code as u32;
        Self(raw as i32)
    }

    /// Wrap a raw status word
    pub const fn from_raw(raw: i32) -> Self {
        Self(raw)
    }

    /// Check a raw return value: non-negative values are successful results
    pub fn check(raw: i32) -> Result<u32, Self> {
        if raw >= 0 {
            Ok(raw as u32)
        } else {
            Err(Self(raw))
        }
    }

    pub const fn raw(self) -> i32 {
        self.0
    }

    pub const fn is_failure(self) -> bool {
        self.0 < 0
    }

    pub const fn module(self) -> u16 {
        (((self.0 as u32) >> 16) & 0x7FFF) as u16
    }

    pub const fn code(self) -> u16 {
        ((self.0 as u32) & 0xFFFF) as u16
    }

    fn module_name(self) -> &'static str {
        match self.module() {
            module::MULTIPROC => "multiproc",
            module::SHAREDREGION => "sharedregion",
            module::MESSAGEQ => "messageq",
            module::PROCMGR => "procmgr",
            _ => "unknown",
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{:#x} ({:#010x})",
            self.module_name(),
            self.code(),
            self.0 as u32
        )
    }
}
