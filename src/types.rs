//! Core types shared across the control plane

use serde::{Deserialize, Serialize, Serializer, de};
use std::fmt;
use std::str::FromStr;

/// An HTB class handle of the form `major:minor`, both 16-bit.
///
/// One major is reserved per NIC queue; minors 1 and 2 are reserved for the
/// queue-root class and the default (catchall) class. Rendered and persisted
/// in the same `0xM:0xm` form that keys qdisc stats dumps, so a stored
/// handle can be matched directly against `tc -j -s` output.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TcHandle {
    /// HTB major handle (one per NIC queue, 1-based)
    pub major: u16,
    /// HTB minor handle within the major
    pub minor: u16,
}

impl TcHandle {
    /// Create a handle from its two halves
    pub fn new(major: u16, minor: u16) -> Self {
        Self { major, minor }
    }

    /// Full class id string, e.g. `0x3:0x5`
    pub fn class_string(&self) -> String {
        format!("0x{:x}:0x{:x}", self.major, self.minor)
    }

    /// The parent string used when this handle's major is a queue root,
    /// e.g. `0x3:`
    pub fn major_string(&self) -> String {
        format!("0x{:x}:", self.major)
    }

    /// Minor half alone, e.g. `0x5` (the classid form used in emitted
    /// class commands, resolved by tc against the parent's major)
    pub fn minor_string(&self) -> String {
        format!("0x{:x}", self.minor)
    }
}

impl fmt::Display for TcHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:x}:0x{:x}", self.major, self.minor)
    }
}

/// Parse error for [`TcHandle`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseTcHandleError(String);

impl fmt::Display for ParseTcHandleError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid tc handle: {}", self.0)
    }
}

impl std::error::Error for ParseTcHandleError {}

impl FromStr for TcHandle {
    type Err = ParseTcHandleError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (major, minor) = s
            .split_once(':')
            .ok_or_else(|| ParseTcHandleError(s.to_string()))?;
        let parse_half = |half: &str| -> Result<u16, ParseTcHandleError> {
            let digits = half.strip_prefix("0x").unwrap_or(half);
            u16::from_str_radix(digits, 16).map_err(|_| ParseTcHandleError(s.to_string()))
        };
        Ok(TcHandle {
            major: parse_half(major)?,
            minor: parse_half(minor)?,
        })
    }
}

impl Serialize for TcHandle {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.class_string())
    }
}

impl<'de> Deserialize<'de> for TcHandle {
    fn deserialize<D: de::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(de::Error::custom)
    }
}

/// Traffic direction relative to the subscriber.
///
/// Interface A (egress toward subscribers) carries download shaping;
/// interface B (egress toward upstream) carries upload shaping.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Direction {
    /// Toward the subscriber (interface A)
    Download,
    /// Toward the upstream (interface B)
    Upload,
}

impl Direction {
    /// Both directions, download first (matching interface declaration order)
    pub const BOTH: [Direction; 2] = [Direction::Download, Direction::Upload];

    /// Tag/field suffix used in persisted stats and emitted points
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Download => "Download",
            Direction::Upload => "Upload",
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A CAKE diffserv4 traffic tin.
///
/// Order matches the `tins` array in qdisc stats dumps.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Tin {
    /// Background bulk traffic
    Bulk,
    /// Default tin
    BestEffort,
    /// Streaming video
    Video,
    /// Latency-sensitive voice
    Voice,
}

impl Tin {
    /// All four tins in qdisc dump order
    pub const ALL: [Tin; 4] = [Tin::Bulk, Tin::BestEffort, Tin::Video, Tin::Voice];

    /// Tag value used in emitted points and persisted stats
    pub fn as_str(&self) -> &'static str {
        match self {
            Tin::Bulk => "Bulk",
            Tin::BestEffort => "BestEffort",
            Tin::Video => "Video",
            Tin::Voice => "Voice",
        }
    }
}

impl fmt::Display for Tin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
