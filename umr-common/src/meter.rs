//! Meter kinds shared by configuration and the reading pipeline

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Kind of physical utility meter
///
/// Serialized lowercase (`"water"`, `"electric"`, `"gas"`), which is also the
/// prefix of the per-type reading log file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MeterType {
    Water,
    Electric,
    Gas,
}

impl MeterType {
    /// All meter types, in a fixed order
    pub const ALL: [MeterType; 3] = [MeterType::Water, MeterType::Electric, MeterType::Gas];

    pub fn as_str(&self) -> &'static str {
        match self {
            MeterType::Water => "water",
            MeterType::Electric => "electric",
            MeterType::Gas => "gas",
        }
    }

    /// Display unit for readings of this meter type
    pub fn default_unit(&self) -> &'static str {
        match self {
            MeterType::Water => "m³",
            MeterType::Electric => "kWh",
            MeterType::Gas => "m³",
        }
    }
}

impl fmt::Display for MeterType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MeterType {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "water" => Ok(MeterType::Water),
            "electric" => Ok(MeterType::Electric),
            "gas" => Ok(MeterType::Gas),
            other => Err(crate::Error::InvalidInput(format!(
                "Invalid meter type '{}'. Must be one of: water, electric, gas",
                other
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_is_case_insensitive() {
        assert_eq!("Water".parse::<MeterType>().unwrap(), MeterType::Water);
        assert_eq!(" GAS ".parse::<MeterType>().unwrap(), MeterType::Gas);
        assert!("steam".parse::<MeterType>().is_err());
    }

    #[test]
    fn test_serde_lowercase() {
        #[derive(Deserialize)]
        struct Wrapper {
            kind: MeterType,
        }
        let w: Wrapper = toml::from_str("kind = \"electric\"").unwrap();
        assert_eq!(w.kind, MeterType::Electric);
    }
}
