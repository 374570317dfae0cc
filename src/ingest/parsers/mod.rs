//! Resumable record parsers.
//!
//! Every format implements [`RecordParser`]: it walks an in-memory copy of a
//! file from a saved [`ParserState`], yields one [`ParseEvent`] per record,
//! and can hand back a checkpoint after any event. Rebuilding a parser from
//! that checkpoint over the same bytes continues with the identical remaining
//! sequence.

pub mod binary;
pub mod cspp;
pub mod jsonl;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::config::ParserConfig;
use crate::error::{Result, TidewaterError};
use crate::state::{ParserState, PARSER_STATE_VERSION};

/// Whether a particle describes the file or carries a measurement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParticleKind {
    Metadata,
    Instrument,
}

/// One decoded record with its provenance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Particle {
    pub source_key: String,
    pub filename: String,
    pub kind: ParticleKind,
    pub stream: String,
    /// Byte offset just past the record.
    pub position: u64,
    pub payload: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ParseEvent {
    Particle(Particle),
    /// A record that could not be decoded; it has been skipped.
    Malformed { position: u64, detail: String },
}

/// Identifies the file being parsed; copied into every particle.
#[derive(Debug, Clone)]
pub struct ParseContext {
    pub source_key: String,
    pub filename: String,
}

impl ParseContext {
    fn particle(
        &self,
        kind: ParticleKind,
        stream: &str,
        position: u64,
        payload: serde_json::Value,
    ) -> Particle {
        Particle {
            source_key: self.source_key.clone(),
            filename: self.filename.clone(),
            kind,
            stream: stream.to_string(),
            position,
            payload,
        }
    }
}

/// Resumable parsing contract shared by all formats.
pub trait RecordParser: Send {
    /// Next record, `None` once no complete record is left.
    ///
    /// Errors are unrecoverable for the file; malformed records come back as
    /// [`ParseEvent::Malformed`] instead.
    fn next_event(&mut self) -> Result<Option<ParseEvent>>;

    /// State to resume right after the last returned event.
    fn checkpoint(&self) -> ParserState;

    /// Bytes consumed so far.
    fn position(&self) -> u64;
}

/// Build the parser selected by `config`.
///
/// `is_final` tells the parser that the file is no longer being written, so a
/// trailing record without its terminator is complete. A `state` that does not
/// belong to this format or does not fit `data` is rejected with
/// [`TidewaterError::ParserStateCorrupt`].
pub fn build_parser(
    config: &ParserConfig,
    state: Option<&ParserState>,
    data: Vec<u8>,
    is_final: bool,
    context: ParseContext,
) -> Result<Box<dyn RecordParser>> {
    let format = config.format_name();
    Ok(match config {
        ParserConfig::Cspp(opts) => {
            let state = decode_state(state, format)?;
            Box::new(cspp::CsppParser::new(opts.clone(), state, data, is_final, context)?)
        }
        ParserConfig::JsonLines(opts) => {
            let state = decode_state(state, format)?;
            Box::new(jsonl::JsonLinesParser::new(opts.clone(), state, data, is_final, context)?)
        }
        ParserConfig::Binary(opts) => {
            let sync = opts.sync_bytes().map_err(TidewaterError::Config)?;
            let state = decode_state(state, format)?;
            Box::new(binary::BinaryParser::new(
                opts.clone(),
                sync,
                state,
                data,
                is_final,
                context,
            )?)
        }
    })
}

fn decode_state<T: DeserializeOwned>(state: Option<&ParserState>, format: &str) -> Result<Option<T>> {
    let Some(state) = state else {
        return Ok(None);
    };
    if state.version != PARSER_STATE_VERSION {
        return Err(TidewaterError::ParserStateCorrupt(format!(
            "unsupported state version {}",
            state.version
        )));
    }
    if state.format != format {
        return Err(TidewaterError::ParserStateCorrupt(format!(
            "state was written by the {:?} parser, not {:?}",
            state.format, format
        )));
    }
    serde_json::from_value(state.body.clone())
        .map(Some)
        .map_err(|e| TidewaterError::ParserStateCorrupt(e.to_string()))
}

fn encode_state<T: Serialize>(format: &str, body: &T) -> ParserState {
    // Plain structs of integers and booleans always serialize.
    let body = serde_json::to_value(body).unwrap_or(serde_json::Value::Null);
    ParserState::new(format, body)
}

/// Check that a resume position of a line-oriented format is a line start.
fn check_line_boundary(data: &[u8], position: u64) -> Result<usize> {
    let pos = usize::try_from(position)
        .map_err(|_| TidewaterError::ParserStateCorrupt(format!("position {} out of range", position)))?;
    if pos > data.len() {
        return Err(TidewaterError::ParserStateCorrupt(format!(
            "position {} is past the end of the file ({} bytes)",
            pos,
            data.len()
        )));
    }
    if pos != 0 && pos != data.len() && data[pos - 1] != b'\n' {
        return Err(TidewaterError::ParserStateCorrupt(format!(
            "position {} is not at the start of a line",
            pos
        )));
    }
    Ok(pos)
}

/// A line found by [`next_line`].
struct Line<'a> {
    /// Content without the line terminator.
    text: &'a [u8],
    /// Offset of the next line.
    next: usize,
}

/// The line starting at `pos`, if it is complete.
///
/// A final line without `\n` only counts when `is_final` is set.
fn next_line(data: &[u8], pos: usize, is_final: bool) -> Option<Line<'_>> {
    if pos >= data.len() {
        return None;
    }
    let rest = &data[pos..];
    let (mut text, next) = match rest.iter().position(|&b| b == b'\n') {
        Some(i) => (&rest[..i], pos + i + 1),
        None if is_final => (rest, data.len()),
        None => return None,
    };
    if let Some(stripped) = text.strip_suffix(b"\r") {
        text = stripped;
    }
    Some(Line { text, next })
}

/// Typed value of one text field: integer, then float, then string.
fn field_value(raw: &str) -> serde_json::Value {
    if let Ok(i) = raw.parse::<i64>() {
        return serde_json::Value::from(i);
    }
    if let Ok(f) = raw.parse::<f64>() {
        if let Some(n) = serde_json::Number::from_f64(f) {
            return serde_json::Value::Number(n);
        }
    }
    serde_json::Value::String(raw.to_string())
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CsppOptions, JsonLinesOptions};
    use serde_json::json;

    #[test]
    fn test_next_line_waits_for_terminator() {
        let data = b"a\r\nbc";
        let first = next_line(data, 0, false).unwrap();
        assert_eq!(first.text, b"a");
        assert_eq!(first.next, 3);
        assert!(next_line(data, 3, false).is_none());

        let last = next_line(data, 3, true).unwrap();
        assert_eq!(last.text, b"bc");
        assert_eq!(last.next, 5);
        assert!(next_line(data, 5, true).is_none());
    }

    #[test]
    fn test_field_value_typing() {
        assert_eq!(field_value("42"), json!(42));
        assert_eq!(field_value("-1.5"), json!(-1.5));
        assert_eq!(field_value("2014/05/08"), json!("2014/05/08"));
        assert_eq!(field_value("NaN"), json!("NaN"));
    }

    #[test]
    fn test_state_from_other_format_is_corrupt() {
        let state = ParserState::new("binary", json!({"position": 0, "records": 0}));
        let config = ParserConfig::JsonLines(JsonLinesOptions::default());
        let err = build_parser(&config, Some(&state), Vec::new(), false, test_support::context())
            .err()
            .unwrap();
        assert!(matches!(err, TidewaterError::ParserStateCorrupt(_)));
    }

    #[test]
    fn test_state_with_wrong_version_is_corrupt() {
        let mut state = ParserState::new("cspp", json!({"position": 0, "metadata_extracted": false}));
        state.version = 0;
        let config = ParserConfig::Cspp(CsppOptions::default());
        let err = build_parser(&config, Some(&state), Vec::new(), false, test_support::context())
            .err()
            .unwrap();
        assert!(matches!(err, TidewaterError::ParserStateCorrupt(_)));
    }

    #[test]
    fn test_line_boundary_check() {
        let data = b"ab\ncd\n";
        assert_eq!(check_line_boundary(data, 0).unwrap(), 0);
        assert_eq!(check_line_boundary(data, 3).unwrap(), 3);
        assert_eq!(check_line_boundary(data, 6).unwrap(), 6);
        assert!(check_line_boundary(data, 4).is_err());
        assert!(check_line_boundary(data, 7).is_err());
    }
}
