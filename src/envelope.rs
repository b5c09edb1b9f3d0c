//! Envelope Parser - Staged Recovery of `{xml, commentary}`
//!
//! Model output is free text that should contain one JSON object. Parsing
//! tries a direct decode first and then two cumulative textual recovery
//! passes, over a small list of candidate slices of the input.

use std::sync::OnceLock;

use log::{debug, warn};
use regex::{Captures, Regex};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::EnvelopeConfig;

const DEFAULT_COMMENTARY: &str = "Generated diagram";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    pub xml: String,
    pub commentary: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Envelope could not be recovered: {detail}")]
pub struct ParseFailure {
    pub detail: String,
}

/// Which attempt produced the envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryStage {
    Direct,
    EscapedLineBreaks,
    EscapedBackslashes,
    BareMarkup,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Recovered {
    pub envelope: Envelope,
    pub stage: RecoveryStage,
}

#[derive(Deserialize)]
struct WireEnvelope {
    xml: String,
    commentary: String,
}

fn string_span() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r#"(?s)"(?:[^"\\]|\\.)*""#).expect("string span pattern must compile")
    })
}

fn bare_document() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?s)<mxfile(?:\s[^>]*)?>.*</mxfile>").expect("document pattern must compile")
    })
}

#[derive(Debug, Clone, Default)]
pub struct EnvelopeParser {
    bare_markup_fallback: bool,
}

impl EnvelopeParser {
    pub fn new(config: &EnvelopeConfig) -> Self {
        Self {
            bare_markup_fallback: config.bare_markup_fallback,
        }
    }

    pub fn parse(&self, raw: &str) -> Result<Envelope, ParseFailure> {
        self.recover(raw).map(|r| r.envelope)
    }

    /// Parse `raw`, reporting which recovery stage succeeded.
    pub fn recover(&self, raw: &str) -> Result<Recovered, ParseFailure> {
        let mut first_error = None;
        let mut saw_object = false;

        for candidate in candidates(raw) {
            let line_breaks = escape_line_breaks(&candidate);
            let backslashes = escape_stray_backslashes(&line_breaks);
            let attempts = [
                (RecoveryStage::Direct, candidate.as_str()),
                (RecoveryStage::EscapedLineBreaks, line_breaks.as_str()),
                (RecoveryStage::EscapedBackslashes, backslashes.as_str()),
            ];

            for (stage, text) in attempts {
                match decode(text) {
                    Ok(envelope) => {
                        if stage != RecoveryStage::Direct {
                            warn!(stage:? = stage; "envelope recovered after escaping");
                        }
                        return Ok(Recovered { envelope, stage });
                    }
                    Err(detail) => {
                        debug!(stage:? = stage, detail:% = detail; "envelope attempt failed");
                        saw_object |= is_json_object(text);
                        first_error.get_or_insert(detail);
                    }
                }
            }
        }

        // An object with bad fields is a broken envelope, not bare markup.
        if self.bare_markup_fallback && !saw_object {
            if let Some(envelope) = salvage_bare_markup(raw) {
                warn!("no envelope found, using bare document from response");
                return Ok(Recovered {
                    envelope,
                    stage: RecoveryStage::BareMarkup,
                });
            }
        }

        Err(ParseFailure {
            detail: first_error.unwrap_or_else(|| "empty input".to_string()),
        })
    }
}

/// Drop the first and last line of inputs with at least three lines (the
/// fence markers the model was asked for); otherwise trim.
pub fn strip_fences(raw: &str) -> String {
    let lines: Vec<&str> = raw.lines().collect();
    if lines.len() >= 3 {
        lines[1..lines.len() - 1].join("\n")
    } else {
        raw.trim().to_string()
    }
}

fn candidates(raw: &str) -> Vec<String> {
    let mut list = vec![strip_fences(raw)];

    let trimmed = raw.trim();
    if !list.iter().any(|c| c == trimmed) {
        list.push(trimmed.to_string());
    }

    if let (Some(open), Some(close)) = (trimmed.find('{'), trimmed.rfind('}')) {
        if open < close {
            let object = &trimmed[open..=close];
            if !list.iter().any(|c| c == object) {
                list.push(object.to_string());
            }
        }
    }

    list
}

fn decode(text: &str) -> Result<Envelope, String> {
    let wire: WireEnvelope = serde_json::from_str(text).map_err(|e| e.to_string())?;
    if wire.xml.is_empty() {
        return Err("field `xml` is empty".to_string());
    }
    if wire.commentary.is_empty() {
        return Err("field `commentary` is empty".to_string());
    }
    Ok(Envelope {
        xml: wire.xml,
        commentary: wire.commentary,
    })
}

fn is_json_object(text: &str) -> bool {
    serde_json::from_str::<serde_json::Map<String, serde_json::Value>>(text).is_ok()
}

/// Escape raw line breaks and tabs inside quoted spans only.
pub fn escape_line_breaks(text: &str) -> String {
    string_span()
        .replace_all(text, |caps: &Captures<'_>| {
            caps[0]
                .replace('\n', "\\n")
                .replace('\r', "\\r")
                .replace('\t', "\\t")
        })
        .into_owned()
}

/// Double every backslash that does not start a valid JSON escape. `\u`
/// counts only when four hex digits follow it.
pub fn escape_stray_backslashes(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut chars = text.chars().peekable();

    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.peek().copied() {
            Some(next @ ('n' | 'r' | 't' | '"' | '\\' | '/' | 'b' | 'f')) => {
                out.push('\\');
                out.push(next);
                chars.next();
            }
            Some('u') if is_unicode_escape(chars.clone()) => {
                out.push('\\');
                out.push('u');
                chars.next();
            }
            _ => out.push_str("\\\\"),
        }
    }

    out
}

/// `rest` starts at the `u` following a backslash.
fn is_unicode_escape(mut rest: impl Iterator<Item = char>) -> bool {
    rest.next();
    (0..4).all(|_| rest.next().is_some_and(|c| c.is_ascii_hexdigit()))
}

/// Pull an `<mxfile>` document out of unstructured text, keeping the rest
/// of the text as commentary.
fn salvage_bare_markup(raw: &str) -> Option<Envelope> {
    let (start, end) = match bare_document().find(raw) {
        Some(m) => (m.start(), m.end()),
        None => {
            let start = raw.find("<?xml")?;
            let end = raw.rfind("</mxfile>")? + "</mxfile>".len();
            if end <= start {
                return None;
            }
            (start, end)
        }
    };

    let outside = format!("{}\n{}", &raw[..start], &raw[end..]);
    let commentary = outside
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with("```"))
        .collect::<Vec<_>>()
        .join(" ");

    Some(Envelope {
        xml: raw[start..end].to_string(),
        commentary: if commentary.is_empty() {
            DEFAULT_COMMENTARY.to_string()
        } else {
            commentary
        },
    })
}
