//! Sensor Frame Parser
//!
//! The sensor board prints one line per sample: N delimiter-separated
//! readings terminated by `\r\n`, e.g. `312,288,140,97,201,455`.
//!
//! A line is accepted only if it carries exactly N finite numeric tokens.
//! Anything else is rejected with a [`FrameError`] so the caller can log it and
//! keep reading; partial frames never reach the aggregator.

use crate::types::{ChannelSet, SensorFrame};
use thiserror::Error;

/// Reasons a line is not a valid frame. Never fatal to acquisition.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum FrameError {
    #[error("empty line")]
    Empty,

    #[error("malformed frame: expected {expected} values, got {found}")]
    WrongWidth { expected: usize, found: usize },

    #[error("malformed frame: value {index} ({token:?}) is not a number")]
    NotNumeric { index: usize, token: String },

    #[error("malformed frame: value {index} ({token:?}) is not finite")]
    NonFinite { index: usize, token: String },
}

/// Parses raw transport lines against a fixed channel set.
#[derive(Debug, Clone)]
pub struct FrameParser {
    channels: ChannelSet,
    delimiter: char,
}

impl FrameParser {
    pub fn new(channels: ChannelSet, delimiter: char) -> Self {
        Self {
            channels,
            delimiter,
        }
    }

    pub fn channels(&self) -> &ChannelSet {
        &self.channels
    }

    /// Parse raw bytes from the transport. Invalid UTF-8 is replaced rather
    /// than rejected; the numeric checks below catch any damage.
    pub fn parse_bytes(&self, raw: &[u8]) -> Result<SensorFrame, FrameError> {
        self.parse(&String::from_utf8_lossy(raw))
    }

    /// Parse one text line into a frame.
    ///
    /// A single trailing delimiter (`1,2,3,`) is tolerated; empty tokens
    /// anywhere else are rejected.
    pub fn parse(&self, line: &str) -> Result<SensorFrame, FrameError> {
        let line = line.trim();
        if line.is_empty() {
            return Err(FrameError::Empty);
        }
        let line = line.strip_suffix(self.delimiter).unwrap_or(line);

        let tokens: Vec<&str> = line.split(self.delimiter).map(str::trim).collect();
        let expected = self.channels.len();
        if tokens.len() != expected {
            return Err(FrameError::WrongWidth {
                expected,
                found: tokens.len(),
            });
        }

        let mut values = Vec::with_capacity(expected);
        for (index, token) in tokens.into_iter().enumerate() {
            let value: f64 = token.parse().map_err(|_| FrameError::NotNumeric {
                index,
                token: token.to_string(),
            })?;
            if !value.is_finite() {
                return Err(FrameError::NonFinite {
                    index,
                    token: token.to_string(),
                });
            }
            values.push(value);
        }

        Ok(SensorFrame::from_values(values))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parser() -> FrameParser {
        FrameParser::new(ChannelSet::new(["MQ2", "MQ3", "MQ135", "MQ136"]), ',')
    }

    #[test]
    fn test_valid_frame() {
        let frame = parser().parse("312, 288,140.5 ,97\r\n").unwrap();
        assert_eq!(frame.values(), &[312.0, 288.0, 140.5, 97.0]);
    }

    #[test]
    fn test_trailing_delimiter_tolerated() {
        let frame = parser().parse("1,2,3,4,").unwrap();
        assert_eq!(frame.len(), 4);
    }

    #[test]
    fn test_wrong_width_rejected() {
        assert_eq!(
            parser().parse("1,2,3"),
            Err(FrameError::WrongWidth { expected: 4, found: 3 })
        );
        assert_eq!(
            parser().parse("1,2,3,4,5"),
            Err(FrameError::WrongWidth { expected: 4, found: 5 })
        );
    }

    #[test]
    fn test_non_numeric_rejected() {
        let err = parser().parse("1,2,abc,4").unwrap_err();
        assert_eq!(
            err,
            FrameError::NotNumeric {
                index: 2,
                token: "abc".to_string()
            }
        );
        assert!(matches!(
            parser().parse("1,,3,4"),
            Err(FrameError::NotNumeric { index: 1, .. })
        ));
    }

    #[test]
    fn test_non_finite_rejected() {
        assert!(matches!(
            parser().parse("1,NaN,3,4"),
            Err(FrameError::NonFinite { index: 1, .. })
        ));
        assert!(matches!(
            parser().parse("inf,2,3,4"),
            Err(FrameError::NonFinite { index: 0, .. })
        ));
    }

    #[test]
    fn test_empty_and_lossy_bytes() {
        assert_eq!(parser().parse("  \r\n"), Err(FrameError::Empty));
        // Boot noise from the board resetting after the port opens
        assert!(parser().parse_bytes(&[0xff, 0xfe, b'1', b'\n']).is_err());
        assert!(parser().parse_bytes(b"5,6,7,8\n").is_ok());
    }

    #[test]
    fn test_custom_delimiter() {
        let p = FrameParser::new(ChannelSet::new(["A", "B"]), ';');
        assert_eq!(p.parse("1.5;2").unwrap().values(), &[1.5, 2.0]);
        assert!(p.parse("1.5,2").is_err());
    }
}
