//! Line-oriented SSE decoding.
//!
//! The backend writes one `data: <json>` line per event. Chunks arrive at
//! arbitrary boundaries, so the decoder keeps the trailing partial line as raw
//! bytes until the next chunk completes it. Anything that does not decode into
//! a known event is dropped here and never reaches the reducer.

use crate::protocol::{ConfirmationPayload, DoneInfo, Envelope, Event, EventKind, SqlResult};
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, trace};

#[derive(Debug, Default)]
pub struct EventDecoder {
    carry: Vec<u8>,
    // Bytes of `carry` already known to hold no newline.
    scanned: usize,
}

#[derive(Debug, Deserialize)]
struct RawFrame {
    #[serde(rename = "type")]
    kind: Option<EventKind>,
    #[serde(default)]
    content: Value,
    conversation_id: Option<i64>,
    user_message_id: Option<i64>,
    assistant_message_id: Option<i64>,
    message: Option<String>,
    error: Option<String>,
    seq: Option<u64>,
}

impl EventDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Decodes every complete line in `chunk`, holding back the remainder.
    pub fn decode(&mut self, chunk: &[u8]) -> Vec<Envelope> {
        self.carry.extend_from_slice(chunk);

        let mut envelopes = Vec::new();
        while let Some(offset) = self.carry[self.scanned..].iter().position(|byte| *byte == b'\n') {
            let idx = self.scanned + offset;
            let line: Vec<u8> = self.carry.drain(..=idx).collect();
            self.scanned = 0;
            if let Some(envelope) = decode_line(&line[..idx]) {
                envelopes.push(envelope);
            }
        }
        self.scanned = self.carry.len();
        envelopes
    }

    /// Flushes a final line that was not newline-terminated.
    pub fn finish(&mut self) -> Vec<Envelope> {
        let line = std::mem::take(&mut self.carry);
        self.scanned = 0;
        decode_line(&line).into_iter().collect()
    }

    pub fn pending_bytes(&self) -> usize {
        self.carry.len()
    }
}

fn decode_line(raw: &[u8]) -> Option<Envelope> {
    let line = String::from_utf8_lossy(raw);
    let line = line.trim_end_matches('\r');
    let data = line.strip_prefix("data:")?.trim_start();
    if data.is_empty() {
        return None;
    }

    let frame: RawFrame = match serde_json::from_str(data) {
        Ok(frame) => frame,
        Err(err) => {
            debug!("skipping undecodable frame: {err}");
            trace!("frame body: {data}");
            return None;
        }
    };

    let seq = frame.seq;
    match frame_to_event(frame) {
        Ok(Some(event)) => Some(Envelope { seq, event }),
        Ok(None) => {
            debug!("skipping frame without a type");
            None
        }
        Err(err) => {
            debug!("skipping frame with malformed payload: {err}");
            None
        }
    }
}

fn frame_to_event(frame: RawFrame) -> Result<Option<Event>, serde_json::Error> {
    let Some(kind) = frame.kind else {
        // Untyped `{"error": ...}` frames are how the backend reports failures.
        return Ok(frame.error.map(Event::Error));
    };

    let event = match kind {
        EventKind::AiResponse => Event::AiResponse(text(frame.content)?),
        EventKind::SqlQuery => Event::SqlQuery(text(frame.content)?),
        EventKind::StepIndicator => Event::StepIndicator(text(frame.content)?),
        EventKind::BriefReasoning => Event::BriefReasoning(text(frame.content)?),
        EventKind::SqlResult => {
            Event::SqlResult(serde_json::from_value::<SqlResult>(frame.content)?)
        }
        EventKind::ChartConfig => Event::ChartConfig(frame.content),
        EventKind::FinalAnswerChunk => Event::FinalAnswerChunk(text(frame.content)?),
        EventKind::FinalAnswerComplete => Event::FinalAnswerComplete(text(frame.content)?),
        EventKind::FinalAnswer => Event::FinalAnswer(text(frame.content)?),
        EventKind::GraphDecision => Event::GraphDecision(frame.content),
        EventKind::ConfirmationRequired => Event::ConfirmationRequired(
            serde_json::from_value::<ConfirmationPayload>(frame.content)?,
        ),
        EventKind::Cancelled => Event::Cancelled {
            message: frame.message.or_else(|| frame.content.as_str().map(str::to_string)),
        },
        EventKind::Loading => Event::Loading(text(frame.content)?),
        EventKind::Error => Event::Error(
            frame
                .error
                .or(frame.message)
                .or_else(|| frame.content.as_str().map(str::to_string))
                .unwrap_or_else(|| "unknown backend error".to_string()),
        ),
        EventKind::Done => Event::Done(DoneInfo {
            conversation_id: frame.conversation_id,
            user_message_id: frame.user_message_id,
            assistant_message_id: frame.assistant_message_id,
        }),
    };
    Ok(Some(event))
}

fn text(content: Value) -> Result<String, serde_json::Error> {
    serde_json::from_value(content)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn events(envelopes: Vec<Envelope>) -> Vec<Event> {
        envelopes.into_iter().map(|envelope| envelope.event).collect()
    }

    #[test]
    fn malformed_line_is_skipped() {
        let mut decoder = EventDecoder::new();
        let chunk = b"data: {not json\ndata: {\"type\":\"loading\",\"content\":\"Processing...\"}\n";
        let decoded = events(decoder.decode(chunk));
        assert_eq!(decoded, vec![Event::Loading("Processing...".to_string())]);
        assert_eq!(decoder.pending_bytes(), 0);
    }

    #[test]
    fn partial_line_is_carried_to_next_chunk() {
        let mut decoder = EventDecoder::new();
        assert!(decoder.decode(b"data: {\"type\":\"sql_qu").is_empty());
        assert!(decoder.pending_bytes() > 0);
        let decoded = events(decoder.decode(b"ery\",\"content\":\"SELECT 1\"}\n\n"));
        assert_eq!(decoded, vec![Event::SqlQuery("SELECT 1".to_string())]);
    }

    #[test]
    fn long_line_fed_byte_by_byte_decodes_once() {
        let line = format!(
            "data: {{\"type\":\"final_answer\",\"content\":\"{}\"}}\n",
            "x".repeat(4096)
        );
        let mut decoder = EventDecoder::new();
        let mut decoded = Vec::new();
        for byte in line.as_bytes() {
            decoded.extend(events(decoder.decode(std::slice::from_ref(byte))));
        }
        assert_eq!(decoded, vec![Event::FinalAnswer("x".repeat(4096))]);
        assert_eq!(decoder.pending_bytes(), 0);

        let decoded = events(decoder.decode(b"data: {\"type\":\"loading\",\"content\":\"a\"}\n"));
        assert_eq!(decoded, vec![Event::Loading("a".to_string())]);
    }

    #[test]
    fn split_multibyte_character_survives() {
        let line = "data: {\"type\":\"final_answer_chunk\",\"content\":\"caf\u{e9} \u{1f4a1}\"}\n";
        let bytes = line.as_bytes();
        let split = line.find('\u{1f4a1}').unwrap() + 2;

        let mut decoder = EventDecoder::new();
        assert!(decoder.decode(&bytes[..split]).is_empty());
        let decoded = events(decoder.decode(&bytes[split..]));
        assert_eq!(
            decoded,
            vec![Event::FinalAnswerChunk("caf\u{e9} \u{1f4a1}".to_string())]
        );
    }

    #[test]
    fn unknown_types_and_non_data_lines_are_ignored() {
        let mut decoder = EventDecoder::new();
        let chunk = concat!(
            ": keep-alive\n",
            "event: message\n",
            "data: {\"type\":\"telemetry\",\"content\":\"x\"}\n",
            "data: {\"content\":\"no type\"}\n",
            "data: {\"type\":\"sql_result\",\"content\":\"not an object\"}\n",
            "data: {\"type\":\"done\",\"conversation_id\":12}\r\n",
        );
        let decoded = events(decoder.decode(chunk.as_bytes()));
        assert_eq!(
            decoded,
            vec![Event::Done(DoneInfo {
                conversation_id: Some(12),
                ..DoneInfo::default()
            })]
        );
    }

    #[test]
    fn error_frames_and_cancel_messages_decode() {
        let mut decoder = EventDecoder::new();
        let chunk = concat!(
            "data: {\"error\": \"Conversation not found\"}\n",
            "data: {\"type\":\"cancelled\",\"message\":\"Operation cancelled by user\"}\n",
        );
        let decoded = events(decoder.decode(chunk.as_bytes()));
        assert_eq!(
            decoded,
            vec![
                Event::Error("Conversation not found".to_string()),
                Event::Cancelled {
                    message: Some("Operation cancelled by user".to_string())
                },
            ]
        );
    }

    #[test]
    fn sequence_numbers_are_preserved() {
        let mut decoder = EventDecoder::new();
        let decoded =
            decoder.decode(b"data: {\"type\":\"final_answer_chunk\",\"content\":\"a\",\"seq\":4}\n");
        assert_eq!(decoded.len(), 1);
        assert_eq!(decoded[0].seq, Some(4));
    }

    #[test]
    fn finish_flushes_unterminated_line() {
        let mut decoder = EventDecoder::new();
        assert!(
            decoder
                .decode(b"data: {\"type\":\"confirmation_required\",\"content\":{\"operation\":\"DELETE\",\"sql\":\"DELETE FROM t\",\"message\":\"DELETE operation\"}}")
                .is_empty()
        );
        let decoded = events(decoder.finish());
        assert_eq!(
            decoded,
            vec![Event::ConfirmationRequired(ConfirmationPayload {
                operation: "DELETE".to_string(),
                sql: "DELETE FROM t".to_string(),
                message: "DELETE operation".to_string(),
            })]
        );
        assert!(decoder.finish().is_empty());
    }
}
