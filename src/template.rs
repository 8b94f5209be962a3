use std::fmt;
use std::str::FromStr;
use std::sync::OnceLock;

use chrono::{Datelike, NaiveDateTime, Timelike};
use regex::Regex;

use crate::error::TemplateError;
use crate::padding::{PadSide, PadSpec};

const VALID_PLACEHOLDERS: &str = "Y, y, m, d, H, M, S, number";

fn placeholder_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\{([^{}]*)\}").expect("placeholder regex is valid"))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Placeholder {
    Year,
    ShortYear,
    Month,
    Day,
    Hour,
    Minute,
    Second,
    Number,
}

impl FromStr for Placeholder {
    type Err = TemplateError;

    fn from_str(token: &str) -> Result<Self, Self::Err> {
        match token {
            "Y" => Ok(Placeholder::Year),
            "y" => Ok(Placeholder::ShortYear),
            "m" => Ok(Placeholder::Month),
            "d" => Ok(Placeholder::Day),
            "H" => Ok(Placeholder::Hour),
            "M" => Ok(Placeholder::Minute),
            "S" => Ok(Placeholder::Second),
            "number" => Ok(Placeholder::Number),
            other => Err(TemplateError::UnknownPlaceholder {
                token: other.to_string(),
                valid: VALID_PLACEHOLDERS,
            }),
        }
    }
}

impl fmt::Display for Placeholder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let token = match self {
            Placeholder::Year => "Y",
            Placeholder::ShortYear => "y",
            Placeholder::Month => "m",
            Placeholder::Day => "d",
            Placeholder::Hour => "H",
            Placeholder::Minute => "M",
            Placeholder::Second => "S",
            Placeholder::Number => "number",
        };
        write!(f, "{{{token}}}")
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Token(Placeholder),
}

/// A parsed pattern such as `INV-{Y}-{number}`.
///
/// Parsing validates every placeholder and delimiter up front, so rendering
/// can only fail on the number itself (overflow under a reject policy).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Template {
    pattern: String,
    segments: Vec<Segment>,
}

impl Template {
    pub fn parse(pattern: &str) -> Result<Self, TemplateError> {
        let mut segments = Vec::new();
        let mut cursor = 0;

        for capture in placeholder_regex().captures_iter(pattern) {
            let Some(whole) = capture.get(0) else {
                continue;
            };
            push_literal(&mut segments, pattern, cursor, whole.start())?;
            let token = capture.get(1).map_or("", |m| m.as_str());
            segments.push(Segment::Token(token.parse()?));
            cursor = whole.end();
        }
        push_literal(&mut segments, pattern, cursor, pattern.len())?;

        Ok(Template {
            pattern: pattern.to_string(),
            segments,
        })
    }

    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    pub fn placeholders(&self) -> impl Iterator<Item = Placeholder> + '_ {
        self.segments.iter().filter_map(|segment| match segment {
            Segment::Token(p) => Some(*p),
            Segment::Literal(_) => None,
        })
    }

    pub fn render(
        &self,
        number: u64,
        timestamp: NaiveDateTime,
        pad: &PadSpec,
    ) -> Result<String, TemplateError> {
        pad.validate()?;
        let mut out = String::with_capacity(self.pattern.len().saturating_add(pad.width));
        for segment in &self.segments {
            match segment {
                Segment::Literal(text) => out.push_str(text),
                Segment::Token(Placeholder::Year) => {
                    out.push_str(&format!("{:04}", timestamp.year()))
                }
                Segment::Token(Placeholder::ShortYear) => {
                    out.push_str(&format!("{:02}", timestamp.year().rem_euclid(100)))
                }
                Segment::Token(Placeholder::Month) => {
                    out.push_str(&format!("{:02}", timestamp.month()))
                }
                Segment::Token(Placeholder::Day) => {
                    out.push_str(&format!("{:02}", timestamp.day()))
                }
                Segment::Token(Placeholder::Hour) => {
                    out.push_str(&format!("{:02}", timestamp.hour()))
                }
                Segment::Token(Placeholder::Minute) => {
                    out.push_str(&format!("{:02}", timestamp.minute()))
                }
                Segment::Token(Placeholder::Second) => {
                    out.push_str(&format!("{:02}", timestamp.second()))
                }
                Segment::Token(Placeholder::Number) => out.push_str(&pad.apply(number)?),
            }
        }
        Ok(out)
    }
}

impl FromStr for Template {
    type Err = TemplateError;

    fn from_str(pattern: &str) -> Result<Self, Self::Err> {
        Template::parse(pattern)
    }
}

fn push_literal(
    segments: &mut Vec<Segment>,
    pattern: &str,
    start: usize,
    end: usize,
) -> Result<(), TemplateError> {
    let text = &pattern[start..end];
    if let Some(offset) = text.find('{') {
        return Err(TemplateError::UnclosedDelimiter {
            pattern: pattern.to_string(),
            position: start + offset,
        });
    }
    if let Some(offset) = text.find('}') {
        return Err(TemplateError::UnmatchedDelimiter {
            pattern: pattern.to_string(),
            position: start + offset,
        });
    }
    if !text.is_empty() {
        segments.push(Segment::Literal(text.to_string()));
    }
    Ok(())
}

/// One-shot render of `pattern` with truncating padding.
pub fn render(
    pattern: &str,
    number: u64,
    timestamp: NaiveDateTime,
    pad_width: usize,
    pad_char: char,
    pad_side: PadSide,
) -> Result<String, TemplateError> {
    Template::parse(pattern)?.render(
        number,
        timestamp,
        &PadSpec::new(pad_width, pad_char, pad_side),
    )
}
