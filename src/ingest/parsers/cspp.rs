//! CSPP text files: a `key: value` header, one column-name line, then one
//! delimited data row per line.
//!
//! ```text
//! Source File: C:\data\11079364.PD0
//! Processed: 05/16/2014 14:16:36
//! Timestamp (seconds)	Depth (m)	PAR (µE/m^2/s)
//! 1399550268.767	35.426	2733.98
//! ```
//!
//! The header becomes one metadata particle, every data row an instrument particle.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::{
    check_line_boundary, encode_state, field_value, next_line, ParseContext, ParseEvent,
    ParticleKind, RecordParser,
};
use crate::config::CsppOptions;
use crate::error::{Result, TidewaterError};
use crate::state::ParserState;

const FORMAT: &str = "cspp";

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub(super) struct CsppState {
    position: u64,
    metadata_extracted: bool,
}

#[derive(Debug)]
struct Header {
    fields: Map<String, Value>,
    columns: Vec<String>,
    /// Offset of the first data line.
    end: usize,
}

pub struct CsppParser {
    opts: CsppOptions,
    data: Vec<u8>,
    is_final: bool,
    context: ParseContext,
    pos: usize,
    metadata_extracted: bool,
    columns: Vec<String>,
}

impl CsppParser {
    pub(super) fn new(
        opts: CsppOptions,
        state: Option<CsppState>,
        data: Vec<u8>,
        is_final: bool,
        context: ParseContext,
    ) -> Result<Self> {
        let state = state.unwrap_or_default();
        let pos = check_line_boundary(&data, state.position)?;

        let mut columns = Vec::new();
        if state.metadata_extracted {
            let header = read_header(&data, true, opts.delimiter)
                .map_err(|e| TidewaterError::ParserStateCorrupt(e.to_string()))?
                .ok_or_else(|| {
                    TidewaterError::ParserStateCorrupt("metadata marked extracted but no header found".into())
                })?;
            if header.end > pos {
                return Err(TidewaterError::ParserStateCorrupt(format!(
                    "position {} lies inside the header",
                    pos
                )));
            }
            columns = header.columns;
        } else if pos != 0 {
            return Err(TidewaterError::ParserStateCorrupt(format!(
                "position {} without extracted metadata",
                pos
            )));
        }

        Ok(Self {
            opts,
            data,
            is_final,
            context,
            pos,
            metadata_extracted: state.metadata_extracted,
            columns,
        })
    }

    fn metadata_event(&mut self) -> Result<Option<ParseEvent>> {
        let Some(header) = read_header(&self.data, self.is_final, self.opts.delimiter)? else {
            return Ok(None);
        };
        self.pos = header.end;
        self.metadata_extracted = true;

        let mut payload = Map::new();
        payload.insert("header".to_string(), Value::Object(header.fields));
        payload.insert(
            "columns".to_string(),
            Value::Array(header.columns.iter().cloned().map(Value::String).collect()),
        );
        self.columns = header.columns;

        Ok(Some(ParseEvent::Particle(self.context.particle(
            ParticleKind::Metadata,
            &self.opts.metadata_stream,
            self.pos as u64,
            Value::Object(payload),
        ))))
    }
}

impl RecordParser for CsppParser {
    fn next_event(&mut self) -> Result<Option<ParseEvent>> {
        if !self.metadata_extracted {
            return self.metadata_event();
        }

        while let Some(line) = next_line(&self.data, self.pos, self.is_final) {
            self.pos = line.next;
            let position = self.pos as u64;

            let text = match std::str::from_utf8(line.text) {
                Ok(t) => t,
                Err(e) => {
                    return Ok(Some(ParseEvent::Malformed {
                        position,
                        detail: format!("data line is not valid UTF-8: {}", e),
                    }))
                }
            };
            if text.trim().is_empty() {
                continue;
            }

            let fields = split_fields(text, self.opts.delimiter);
            if fields.len() != self.columns.len() {
                return Ok(Some(ParseEvent::Malformed {
                    position,
                    detail: format!(
                        "expected {} fields, found {}: {:?}",
                        self.columns.len(),
                        fields.len(),
                        text
                    ),
                }));
            }

            let payload: Map<String, Value> = self
                .columns
                .iter()
                .zip(fields)
                .map(|(column, raw)| (column.clone(), field_value(raw)))
                .collect();

            return Ok(Some(ParseEvent::Particle(self.context.particle(
                ParticleKind::Instrument,
                &self.opts.instrument_stream,
                position,
                Value::Object(payload),
            ))));
        }

        Ok(None)
    }

    fn checkpoint(&self) -> ParserState {
        encode_state(
            FORMAT,
            &CsppState {
                position: self.pos as u64,
                metadata_extracted: self.metadata_extracted,
            },
        )
    }

    fn position(&self) -> u64 {
        self.pos as u64
    }
}

/// Read the header and column line, `None` while they are still incomplete.
fn read_header(data: &[u8], is_final: bool, delimiter: Option<char>) -> Result<Option<Header>> {
    let mut fields = Map::new();
    let mut pos = 0;

    while let Some(line) = next_line(data, pos, is_final) {
        pos = line.next;
        let text = std::str::from_utf8(line.text)
            .map_err(|e| TidewaterError::Parse(format!("header is not valid UTF-8: {}", e)))?;
        if text.trim().is_empty() {
            continue;
        }

        if let Some((key, value)) = header_field(text, delimiter) {
            fields.insert(key.to_string(), Value::String(value.to_string()));
            continue;
        }

        let columns = split_fields(text, delimiter)
            .into_iter()
            .map(str::to_string)
            .collect();
        return Ok(Some(Header {
            fields,
            columns,
            end: pos,
        }));
    }

    if is_final && (!fields.is_empty() || data.iter().any(|b| !b.is_ascii_whitespace())) {
        return Err(TidewaterError::Parse(
            "file ended before the column header line".to_string(),
        ));
    }
    Ok(None)
}

/// `key: value`, where the key holds no column delimiter.
fn header_field(text: &str, delimiter: Option<char>) -> Option<(&str, &str)> {
    let (key, value) = text.split_once(':')?;
    let key = key.trim();
    if key.is_empty() || key.contains('\t') {
        return None;
    }
    if let Some(d) = delimiter {
        if !d.is_whitespace() && key.contains(d) {
            return None;
        }
    }
    Some((key, value.trim()))
}

fn split_fields(text: &str, delimiter: Option<char>) -> Vec<&str> {
    match delimiter {
        None => text.split_whitespace().collect(),
        Some(d) => text.split(d).map(str::trim).collect(),
    }
}
