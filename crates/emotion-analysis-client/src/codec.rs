//! Wire protocol decoding.
//!
//! Every function here is pure and infallible: input that does not fit the
//! protocol comes back as a `Malformed` variant carrying the raw text so the
//! caller can log it and keep the stream alive.

use std::collections::BTreeMap;

use serde::Deserialize;
use serde_json::Value;

use crate::model::{Aggregate, ClipMetadata, Emotion, EmotionScores, PartialResult};
use crate::sse::SseFrame;

/// Event name the server uses for the terminal frame of a job stream.
pub const COMPLETE_EVENT: &str = "complete";

/// Typed job stream events.
#[derive(Clone, Debug, PartialEq)]
pub enum StreamEvent {
    /// Position update without a payload.
    Progress { current: u32, total: u32 },
    /// A scored segment.
    Result {
        result: PartialResult,
        current: u32,
        total: u32,
    },
    /// The server failed one segment; the job continues.
    Error {
        current: u32,
        total: u32,
        message: String,
    },
    /// Terminal frame.
    Complete {
        aggregate: Option<Aggregate>,
        errors: Vec<String>,
    },
    /// Keep-alive; carries nothing.
    Heartbeat,
    /// Frame that did not decode.
    Malformed { raw: String, reason: String },
}

impl StreamEvent {
    fn malformed(raw: &str, reason: impl Into<String>) -> Self {
        Self::Malformed {
            raw: raw.to_string(),
            reason: reason.into(),
        }
    }
}

/// Decodes one job stream frame.
pub fn decode(frame: &SseFrame) -> StreamEvent {
    match frame.event_name() {
        "message" => decode_message(&frame.data),
        COMPLETE_EVENT => decode_complete(&frame.data),
        other => StreamEvent::malformed(&frame.data, format!("unexpected event `{other}`")),
    }
}

#[derive(Deserialize)]
struct WireMessage {
    current: Option<u32>,
    total: Option<u32>,
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Deserialize)]
struct WireResult {
    #[serde(default)]
    emotion: Option<String>,
    #[serde(default)]
    confidence: Option<f64>,
    probabilities: BTreeMap<String, f64>,
    #[serde(flatten)]
    metadata: ClipMetadata,
}

/// Decodes the data of a default (`message`) event.
pub fn decode_message(data: &str) -> StreamEvent {
    let trimmed = data.trim();
    if is_heartbeat(trimmed) {
        return StreamEvent::Heartbeat;
    }
    let wire: WireMessage = match serde_json::from_str(trimmed) {
        Ok(wire) => wire,
        Err(e) => return StreamEvent::malformed(data, format!("invalid message frame: {e}")),
    };
    let (current, total) = match (wire.current, wire.total) {
        (Some(current), Some(total)) if current >= 1 && total >= 1 && current <= total => {
            (current, total)
        }
        (Some(current), Some(total)) => {
            return StreamEvent::malformed(data, format!("position {current}/{total} out of range"));
        }
        _ => return StreamEvent::malformed(data, "frame is missing `current`/`total`"),
    };

    if let Some(message) = wire.error {
        return StreamEvent::Error {
            current,
            total,
            message,
        };
    }
    match wire.result {
        None | Some(Value::Null) => StreamEvent::Progress { current, total },
        Some(payload) => match decode_result(payload, current, total) {
            Ok(result) => StreamEvent::Result {
                result,
                current,
                total,
            },
            Err(reason) => StreamEvent::malformed(data, reason),
        },
    }
}

fn decode_result(payload: Value, current: u32, total: u32) -> Result<PartialResult, String> {
    // the server sometimes sends the result as a JSON-encoded string
    let payload = match payload {
        Value::String(encoded) => serde_json::from_str::<Value>(&encoded)
            .map_err(|e| format!("result string is not JSON: {e}"))?,
        other => other,
    };
    let wire: WireResult =
        serde_json::from_value(payload).map_err(|e| format!("invalid result payload: {e}"))?;
    let scores = EmotionScores::from_wire(&wire.probabilities)?;
    if scores.is_empty() {
        return Err("result has no probabilities".into());
    }

    let (top, top_score) = scores.dominant();
    let label = match wire.emotion {
        Some(name) => name.parse::<Emotion>()?,
        None => top,
    };
    let confidence = wire.confidence.unwrap_or(top_score);
    if !confidence.is_finite() || !(0.0..=1.0).contains(&confidence) {
        return Err(format!("confidence out of range: {confidence}"));
    }

    Ok(PartialResult {
        sequence: current,
        total,
        label,
        confidence,
        scores,
        metadata: wire.metadata,
    })
}

#[derive(Deserialize)]
struct WireComplete {
    #[serde(default)]
    emotion_scores: Option<BTreeMap<String, f64>>,
    #[serde(default)]
    errors: Vec<String>,
}

/// Decodes the data of a `complete` event.
///
/// The frame type is already known from the event name, so an unreadable
/// payload still completes the job; the problem is reported in `errors`.
pub fn decode_complete(data: &str) -> StreamEvent {
    let trimmed = data.trim();
    if is_heartbeat(trimmed) {
        return StreamEvent::Complete {
            aggregate: None,
            errors: Vec::new(),
        };
    }
    let wire: WireComplete = match serde_json::from_str(trimmed) {
        Ok(wire) => wire,
        Err(e) => {
            return StreamEvent::Complete {
                aggregate: None,
                errors: vec![format!("unreadable completion payload: {e}")],
            };
        }
    };
    let mut errors = wire.errors;
    let aggregate = match wire.emotion_scores {
        Some(raw) => match EmotionScores::from_wire(&raw) {
            Ok(scores) => Some(scores),
            Err(reason) => {
                errors.push(format!("unreadable final scores: {reason}"));
                None
            }
        },
        None => None,
    };
    StreamEvent::Complete { aggregate, errors }
}

fn is_heartbeat(trimmed: &str) -> bool {
    trimmed.is_empty() || trimmed == "{}"
}

/// Events on the upload side channel.
#[derive(Clone, Debug, PartialEq)]
pub enum SubmissionEvent {
    Progress { percent: f64, message: String },
    Complete {
        percent: f64,
        message: String,
        result: Option<Value>,
    },
    Failed { message: String },
    Heartbeat,
    Malformed { raw: String, reason: String },
}

#[derive(Deserialize)]
struct WireSubmission {
    #[serde(default)]
    progress: f64,
    #[serde(default)]
    message: String,
    #[serde(default)]
    complete: bool,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    result: Option<Value>,
}

/// Decodes one side-channel frame. Percentages are clamped to `0..=100`.
pub fn decode_submission(data: &str) -> SubmissionEvent {
    let trimmed = data.trim();
    if is_heartbeat(trimmed) {
        return SubmissionEvent::Heartbeat;
    }
    let wire: WireSubmission = match serde_json::from_str(trimmed) {
        Ok(wire) => wire,
        Err(e) => {
            return SubmissionEvent::Malformed {
                raw: data.to_string(),
                reason: format!("invalid progress frame: {e}"),
            };
        }
    };
    if let Some(message) = wire.error.filter(|m| !m.trim().is_empty()) {
        return SubmissionEvent::Failed { message };
    }
    let percent = if wire.progress.is_finite() {
        wire.progress.clamp(0.0, 100.0)
    } else {
        0.0
    };
    if wire.complete {
        SubmissionEvent::Complete {
            percent,
            message: wire.message,
            result: wire.result,
        }
    } else {
        SubmissionEvent::Progress {
            percent,
            message: wire.message,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_object_is_heartbeat() {
        assert_eq!(decode(&SseFrame::message("{}")), StreamEvent::Heartbeat);
        assert_eq!(decode_message("  {}\n"), StreamEvent::Heartbeat);
        assert_eq!(decode_message(""), StreamEvent::Heartbeat);
    }

    #[test]
    fn object_result_decodes_to_partial_result() {
        let frame = SseFrame::message(
            r#"{"current":2,"total":5,"result":{"emotion":"anger","confidence":0.61,
                "probabilities":{"anger":0.61,"neutral":0.39},"start_time":4.0,"end_time":6.0}}"#,
        );
        let StreamEvent::Result { result, current, total } = decode(&frame) else {
            panic!("expected result");
        };
        assert_eq!((current, total), (2, 5));
        assert_eq!(result.sequence, 2);
        assert_eq!(result.label, Emotion::Anger);
        assert_eq!(result.metadata.start, Some(4.0));
        assert_eq!(result.scores.get(Emotion::Neutral), Some(0.39));
    }

    #[test]
    fn string_encoded_result_gets_second_decode_pass() {
        let inner = serde_json::json!({
            "probabilities": {"happiness": 0.8, "sadness": 0.2},
            "transcript": "great day"
        })
        .to_string();
        let data = serde_json::json!({"current": 1, "total": 3, "result": inner}).to_string();
        let StreamEvent::Result { result, .. } = decode_message(&data) else {
            panic!("expected result");
        };
        assert_eq!(result.label, Emotion::Happiness);
        assert_eq!(result.confidence, 0.8);
        assert_eq!(result.metadata.text.as_deref(), Some("great day"));
    }

    #[test]
    fn error_frame_keeps_position() {
        let event = decode_message(r#"{"current":3,"total":4,"error":"no face detected"}"#);
        assert_eq!(
            event,
            StreamEvent::Error {
                current: 3,
                total: 4,
                message: "no face detected".into()
            }
        );
    }

    #[test]
    fn bare_position_is_progress() {
        assert_eq!(
            decode_message(r#"{"current":1,"total":9}"#),
            StreamEvent::Progress { current: 1, total: 9 }
        );
    }

    #[test]
    fn malformed_frames_retain_raw_text() {
        for raw in [
            r#"{"current": "x"}"#,
            "not json",
            "[1,2]",
            r#"{"current":4,"total":3}"#,
            r#"{"current":1,"total":2,"result":{"probabilities":{"boredom":0.5}}}"#,
            r#"{"current":1,"total":2,"result":{"probabilities":{"anger":1.5}}}"#,
            r#"{"current":1,"total":2,"result":"{broken"}"#,
        ] {
            match decode_message(raw) {
                StreamEvent::Malformed { raw: kept, .. } => assert_eq!(kept, raw),
                other => panic!("{raw} decoded as {other:?}"),
            }
        }
    }

    #[test]
    fn complete_with_scores_and_errors() {
        let frame = SseFrame::named(
            COMPLETE_EVENT,
            r#"{"emotion_scores":{"happiness":0.7,"sadness":0.3},"errors":["clip 4 skipped"]}"#,
        );
        let StreamEvent::Complete { aggregate, errors } = decode(&frame) else {
            panic!("expected complete");
        };
        let aggregate = aggregate.expect("aggregate");
        assert_eq!(aggregate.dominant().0, Emotion::Happiness);
        assert_eq!(errors, vec!["clip 4 skipped".to_string()]);
    }

    #[test]
    fn empty_complete_and_unreadable_complete_still_complete() {
        assert_eq!(
            decode(&SseFrame::named(COMPLETE_EVENT, "{}")),
            StreamEvent::Complete { aggregate: None, errors: vec![] }
        );
        let StreamEvent::Complete { aggregate, errors } = decode_complete("oops") else {
            panic!("expected complete");
        };
        assert!(aggregate.is_none());
        assert_eq!(errors.len(), 1);
    }

    #[test]
    fn unknown_event_name_is_malformed() {
        assert!(matches!(
            decode(&SseFrame::named("status", "{}")),
            StreamEvent::Malformed { .. }
        ));
    }

    #[test]
    fn submission_frames() {
        assert_eq!(
            decode_submission(r#"{"progress":140,"message":"splitting","complete":false}"#),
            SubmissionEvent::Progress { percent: 100.0, message: "splitting".into() }
        );
        assert!(matches!(
            decode_submission(r#"{"progress":50,"message":"","complete":false,"error":"ffmpeg failed"}"#),
            SubmissionEvent::Failed { .. }
        ));
        assert!(matches!(
            decode_submission(r#"{"progress":100,"message":"done","complete":true,"result":{"split_folder":"x"}}"#),
            SubmissionEvent::Complete { result: Some(_), .. }
        ));
        assert_eq!(decode_submission("{}"), SubmissionEvent::Heartbeat);
        assert!(matches!(decode_submission("nope"), SubmissionEvent::Malformed { .. }));
    }
}
