use std::fmt;
use std::str::FromStr;

/// Where the model runs.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum DeviceMap {
    ForceCpu,
    Ordinal(usize),
}

impl Default for DeviceMap {
    fn default() -> Self {
        Self::Ordinal(0)
    }
}

impl fmt::Display for DeviceMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceMap::ForceCpu => f.write_str("cpu"),
            DeviceMap::Ordinal(ordinal) => write!(f, "{ordinal}"),
        }
    }
}

/// Accepts `cpu` or an accelerator ordinal.
impl FromStr for DeviceMap {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.eq_ignore_ascii_case("cpu") {
            return Ok(DeviceMap::ForceCpu);
        }
        s.parse()
            .map(DeviceMap::Ordinal)
            .map_err(|_| format!("expected `cpu` or a device ordinal, got `{s}`"))
    }
}
