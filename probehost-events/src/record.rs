use std::{fmt, str::FromStr};

use anyhow::Result;

/// Hook-point kind a handler is attached to: the entry or the return of a
/// kernel function.
#[derive(
    Clone, Copy, Debug, Eq, Hash, PartialEq, serde::Deserialize, serde::Serialize,
)]
#[serde(rename_all = "lowercase")]
pub enum HookKind {
    Entry,
    Return,
}

impl HookKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            HookKind::Entry => "entry",
            HookKind::Return => "return",
        }
    }
}

impl fmt::Display for HookKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Error of converting a string into a HookKind.
#[derive(thiserror::Error, Debug, PartialEq)]
#[error("invalid hook kind '{0}' (expected 'entry' or 'return')")]
pub struct ParseHookKindError(String);

impl FromStr for HookKind {
    type Err = ParseHookKindError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "entry" => Ok(HookKind::Entry),
            "return" => Ok(HookKind::Return),
            x => Err(ParseHookKindError(x.to_string())),
        }
    }
}

/// Single trace record, produced by one invocation of an attached handler.
#[derive(Clone, Debug, serde::Deserialize, serde::Serialize)]
pub struct TraceRecord {
    /// Name of the handler that fired.
    pub handler: String,
    /// Hook-point kind the handler was attached to.
    pub kind: HookKind,
    /// Per-handler sequence number. Strictly increasing; a gap means records
    /// were dropped.
    pub seq: u64,
    /// Monotonic timestamp of the emission, in nanoseconds.
    pub timestamp: u64,
    /// Formatted trace line, e.g.
    /// `[entry] my_kprobe: GLOBAL_u8=0x2A, GLOBAL_u32=0xDEADBEEF`.
    pub message: String,
}

impl TraceRecord {
    /// Create a TraceRecord from a json string.
    pub fn from_json(line: &str) -> Result<TraceRecord> {
        Ok(serde_json::from_str(line)?)
    }

    pub fn to_json(&self) -> Result<serde_json::Value> {
        Ok(serde_json::to_value(self)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hook_kind_from_str() {
        assert_eq!("entry".parse::<HookKind>().unwrap(), HookKind::Entry);
        assert_eq!("return".parse::<HookKind>().unwrap(), HookKind::Return);
        assert!("kprobe".parse::<HookKind>().is_err());
        assert!("".parse::<HookKind>().is_err());
    }

    #[test]
    fn json_round_trip() {
        let record = TraceRecord {
            handler: "my_kprobe".to_string(),
            kind: HookKind::Entry,
            seq: 3,
            timestamp: 1234567890,
            message: "[entry] my_kprobe: GLOBAL_u8=0x2A".to_string(),
        };

        let json = record.to_json().unwrap();
        let back = TraceRecord::from_json(&json.to_string()).unwrap();

        assert_eq!(back.handler, record.handler);
        assert_eq!(back.kind, record.kind);
        assert_eq!(back.seq, record.seq);
        assert_eq!(back.timestamp, record.timestamp);
        assert_eq!(back.message, record.message);
    }
}
