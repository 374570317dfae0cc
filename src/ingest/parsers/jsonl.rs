//! JSON lines: one JSON object per line, each an instrument particle.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{
    check_line_boundary, encode_state, next_line, ParseContext, ParseEvent, ParticleKind,
    RecordParser,
};
use crate::config::JsonLinesOptions;
use crate::error::Result;
use crate::state::ParserState;

const FORMAT: &str = "json_lines";

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub(super) struct JsonLinesState {
    position: u64,
}

pub struct JsonLinesParser {
    opts: JsonLinesOptions,
    data: Vec<u8>,
    is_final: bool,
    context: ParseContext,
    pos: usize,
}

impl JsonLinesParser {
    pub(super) fn new(
        opts: JsonLinesOptions,
        state: Option<JsonLinesState>,
        data: Vec<u8>,
        is_final: bool,
        context: ParseContext,
    ) -> Result<Self> {
        let state = state.unwrap_or_default();
        let pos = check_line_boundary(&data, state.position)?;
        Ok(Self {
            opts,
            data,
            is_final,
            context,
            pos,
        })
    }
}

impl RecordParser for JsonLinesParser {
    fn next_event(&mut self) -> Result<Option<ParseEvent>> {
        while let Some(line) = next_line(&self.data, self.pos, self.is_final) {
            self.pos = line.next;
            let position = self.pos as u64;

            if line.text.iter().all(u8::is_ascii_whitespace) {
                continue;
            }

            let event = match serde_json::from_slice::<Value>(line.text) {
                Ok(value @ Value::Object(_)) => ParseEvent::Particle(self.context.particle(
                    ParticleKind::Instrument,
                    &self.opts.stream,
                    position,
                    value,
                )),
                Ok(other) => ParseEvent::Malformed {
                    position,
                    detail: format!("expected a JSON object, found {}", other),
                },
                Err(e) => ParseEvent::Malformed {
                    position,
                    detail: format!("invalid JSON: {}", e),
                },
            };
            return Ok(Some(event));
        }

        Ok(None)
    }

    fn checkpoint(&self) -> ParserState {
        encode_state(
            FORMAT,
            &JsonLinesState {
                position: self.pos as u64,
            },
        )
    }

    fn position(&self) -> u64 {
        self.pos as u64
    }
}
