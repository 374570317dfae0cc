//! Fixed-size binary records, optionally starting with a sync marker.
//!
//! Bytes that do not start with the marker are reported as one malformed
//! record and skipped up to the next marker.

use base64::Engine;
use serde::{Deserialize, Serialize};
use serde_json::json;

use super::{encode_state, ParseContext, ParseEvent, ParticleKind, RecordParser};
use crate::config::BinaryOptions;
use crate::error::{Result, TidewaterError};
use crate::state::ParserState;

const FORMAT: &str = "binary";

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub(super) struct BinaryState {
    position: u64,
    /// Records emitted so far; numbers the next particle.
    records: u64,
}

pub struct BinaryParser {
    opts: BinaryOptions,
    sync: Option<Vec<u8>>,
    data: Vec<u8>,
    is_final: bool,
    context: ParseContext,
    pos: usize,
    records: u64,
}

impl BinaryParser {
    pub(super) fn new(
        opts: BinaryOptions,
        sync: Option<Vec<u8>>,
        state: Option<BinaryState>,
        data: Vec<u8>,
        is_final: bool,
        context: ParseContext,
    ) -> Result<Self> {
        let state = state.unwrap_or_default();
        let pos = usize::try_from(state.position)
            .ok()
            .filter(|&p| p <= data.len())
            .ok_or_else(|| {
                TidewaterError::ParserStateCorrupt(format!(
                    "position {} is past the end of the file ({} bytes)",
                    state.position,
                    data.len()
                ))
            })?;
        Ok(Self {
            opts,
            sync,
            data,
            is_final,
            context,
            pos,
            records: state.records,
        })
    }

    fn malformed_until(&mut self, end: usize, detail: String) -> ParseEvent {
        self.pos = end;
        ParseEvent::Malformed {
            position: end as u64,
            detail,
        }
    }
}

impl RecordParser for BinaryParser {
    fn next_event(&mut self) -> Result<Option<ParseEvent>> {
        let remaining = self.data.len() - self.pos;
        if remaining == 0 {
            return Ok(None);
        }

        if let Some(sync) = self.sync.clone() {
            if remaining < sync.len() && !self.is_final {
                return Ok(None);
            }
            if !self.data[self.pos..].starts_with(&sync) {
                let start = self.pos;
                return Ok(match find(&self.data[start + 1..], &sync) {
                    Some(offset) => Some(self.malformed_until(
                        start + 1 + offset,
                        format!("{} bytes without sync marker at offset {}", offset + 1, start),
                    )),
                    None if self.is_final => Some(self.malformed_until(
                        self.data.len(),
                        format!("{} trailing bytes without sync marker at offset {}", remaining, start),
                    )),
                    None => None,
                });
            }
        }

        let size = self.opts.record_size;
        if remaining < size {
            if !self.is_final {
                return Ok(None);
            }
            let start = self.pos;
            return Ok(Some(self.malformed_until(
                self.data.len(),
                format!("truncated record of {} bytes at offset {}", remaining, start),
            )));
        }

        let record = &self.data[self.pos..self.pos + size];
        let payload = json!({
            "index": self.records,
            "data": base64::engine::general_purpose::STANDARD.encode(record),
        });
        self.pos += size;
        self.records += 1;

        Ok(Some(ParseEvent::Particle(self.context.particle(
            ParticleKind::Instrument,
            &self.opts.stream,
            self.pos as u64,
            payload,
        ))))
    }

    fn checkpoint(&self) -> ParserState {
        encode_state(
            FORMAT,
            &BinaryState {
                position: self.pos as u64,
                records: self.records,
            },
        )
    }

    fn position(&self) -> u64 {
        self.pos as u64
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}
