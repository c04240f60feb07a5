//! Remote core identifiers

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Processor identifier on the SoC
///
/// `AppM3` is a logical alias: it shares the Ducati subsystem (and its
/// driver handle) with `SysM3`. Use [`CoreId::physical`] before opening a
/// handle or mapping memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum CoreId {
    /// Host control core
    #[serde(rename = "MPU")]
    Mpu,
    /// DSP
    Tesla,
    /// Ducati core 0
    SysM3,
    /// Ducati core 1
    AppM3,
}

impl CoreId {
    pub const ALL: [CoreId; 4] = [CoreId::Mpu, CoreId::Tesla, CoreId::SysM3, CoreId::AppM3];

    /// Physical core that backs this id
    pub fn physical(self) -> CoreId {
        match self {
            CoreId::AppM3 => CoreId::SysM3,
            other => other,
        }
    }

    pub fn is_alias(self) -> bool {
        self.physical() != self
    }

    /// MultiProc processor number
    pub fn proc_id(self) -> u16 {
        match self {
            CoreId::Tesla => 0,
            CoreId::AppM3 => 1,
            CoreId::SysM3 => 2,
            CoreId::Mpu => 3,
        }
    }

    /// MultiProc name
    pub fn name(self) -> &'static str {
        match self {
            CoreId::Mpu => "MPU",
            CoreId::Tesla => "Tesla",
            CoreId::SysM3 => "SysM3",
            CoreId::AppM3 => "AppM3",
        }
    }
}

impl fmt::Display for CoreId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for CoreId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        CoreId::ALL
            .into_iter()
            .find(|core| core.name().eq_ignore_ascii_case(s))
            .ok_or_else(|| Error::InvalidArgument(format!("unknown processor name: {}", s)))
    }
}
