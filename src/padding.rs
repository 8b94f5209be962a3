use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::TemplateError;

/// Which side of the digits receives the fill characters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PadSide {
    /// Right-justify the digits, fill prepended.
    #[default]
    Left,
    /// Left-justify the digits, fill appended.
    Right,
}

impl FromStr for PadSide {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "left" => Ok(PadSide::Left),
            "right" => Ok(PadSide::Right),
            other => Err(format!("unknown pad side {other:?}, expected left or right")),
        }
    }
}

impl fmt::Display for PadSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PadSide::Left => f.write_str("left"),
            PadSide::Right => f.write_str("right"),
        }
    }
}

/// What to do when a number has more digits than the pad width.
///
/// `Truncate` keeps the trailing digits for left padding and the leading
/// digits for right padding. Distinct values can then render identically
/// (2345 and 99992345 both become `2345` at width 4), so hosts that need
/// unique codes should use `Reject`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OverflowPolicy {
    #[default]
    Truncate,
    Reject,
}

impl FromStr for OverflowPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "truncate" => Ok(OverflowPolicy::Truncate),
            "reject" => Ok(OverflowPolicy::Reject),
            other => Err(format!(
                "unknown overflow policy {other:?}, expected truncate or reject"
            )),
        }
    }
}

/// Widest `{number}` field accepted anywhere. A u64 has at most 20 digits.
pub const MAX_PAD_WIDTH: usize = 64;

/// Rejects widths that are zero or larger than [`MAX_PAD_WIDTH`].
pub fn check_pad_width(width: usize) -> Result<(), TemplateError> {
    if width == 0 {
        return Err(TemplateError::ZeroPadWidth);
    }
    if width > MAX_PAD_WIDTH {
        return Err(TemplateError::PadWidthTooLarge {
            width,
            max: MAX_PAD_WIDTH,
        });
    }
    Ok(())
}

/// Full padding configuration for the `{number}` placeholder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PadSpec {
    pub width: usize,
    pub fill: char,
    pub side: PadSide,
    pub overflow: OverflowPolicy,
}

impl PadSpec {
    pub fn new(width: usize, fill: char, side: PadSide) -> Self {
        PadSpec {
            width,
            fill,
            side,
            overflow: OverflowPolicy::Truncate,
        }
    }

    pub fn with_overflow(mut self, overflow: OverflowPolicy) -> Self {
        self.overflow = overflow;
        self
    }

    pub fn validate(&self) -> Result<(), TemplateError> {
        check_pad_width(self.width)
    }

    /// Largest counter value this spec renders without error.
    ///
    /// Unbounded under `Truncate`; `10^width - 1` under `Reject`.
    pub fn max_value(&self) -> u64 {
        match self.overflow {
            OverflowPolicy::Truncate => u64::MAX,
            OverflowPolicy::Reject => u32::try_from(self.width)
                .ok()
                .and_then(|w| 10u64.checked_pow(w))
                .map_or(u64::MAX, |limit| limit - 1),
        }
    }

    /// Pads `value` according to this spec, honoring the overflow policy.
    pub fn apply(&self, value: u64) -> Result<String, TemplateError> {
        self.validate()?;
        if self.overflow == OverflowPolicy::Reject && digit_count(value) > self.width {
            return Err(TemplateError::NumberOverflow {
                value,
                width: self.width,
            });
        }
        Ok(pad(value, self.width, self.fill, self.side))
    }
}

impl Default for PadSpec {
    fn default() -> Self {
        PadSpec::new(4, '0', PadSide::Left)
    }
}

/// Formats `value` into exactly `width` characters.
///
/// Overflowing values are truncated: the last `width` digits survive on the
/// left side, the first `width` digits on the right side. The width is not
/// bounded here; [`PadSpec::validate`] is.
pub fn pad(value: u64, width: usize, fill: char, side: PadSide) -> String {
    let digits = value.to_string();
    let len = digits.len();

    if len >= width {
        return match side {
            PadSide::Left => digits[len - width..].to_string(),
            PadSide::Right => digits[..width].to_string(),
        };
    }

    let filler: String = std::iter::repeat(fill).take(width - len).collect();
    match side {
        PadSide::Left => filler + &digits,
        PadSide::Right => digits + &filler,
    }
}

fn digit_count(value: u64) -> usize {
    value.checked_ilog10().map_or(1, |log| log as usize + 1)
}
