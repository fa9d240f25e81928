//! The OCR child-process wire protocol: newline-delimited JSON over stdin/stdout.
//! Three message shapes: the readiness handshake, the request line the
//! supervisor writes, and the response line the child writes back.

use serde::{Deserialize, Serialize};

/// First line the child ever emits. `{"ready": true}` or
/// `{"ready": false, "error": "..."}`.
#[derive(Debug, Deserialize)]
pub struct ReadyMessage {
    pub ready: bool,
    #[serde(default)]
    pub error: Option<String>,
}

/// One line the supervisor writes per request: `{"id": "...", "pdf_path": "..."}`.
#[derive(Debug, Serialize)]
pub struct RequestMessage {
    pub id: String,
    pub pdf_path: String,
}

/// One line the child writes per response, correlated by `id`.
#[derive(Debug, Deserialize)]
pub struct ResponseMessage {
    pub id: String,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub page_count: Option<u32>,
    #[serde(default)]
    pub error: Option<String>,
}

/// Either readiness handshake or a correlated response — the two shapes the
/// supervisor may see on a child's stdout. Malformed lines deserialize into
/// neither and are discarded by the caller.
#[derive(Debug)]
pub enum IncomingLine {
    Ready(ReadyMessage),
    Response(ResponseMessage),
}

/// Parse one line of the child's stdout. Returns `None` for malformed JSON
/// or JSON that matches neither known shape — callers log and discard.
pub fn parse_incoming_line(line: &str) -> Option<IncomingLine> {
    let value: serde_json::Value = serde_json::from_str(line).ok()?;
    if value.get("ready").is_some() {
        serde_json::from_value(value).ok().map(IncomingLine::Ready)
    } else if value.get("id").is_some() {
        serde_json::from_value(value)
            .ok()
            .map(IncomingLine::Response)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_ready_true() {
        match parse_incoming_line(r#"{"ready": true}"#) {
            Some(IncomingLine::Ready(msg)) => {
                assert!(msg.ready);
                assert!(msg.error.is_none());
            }
            other => panic!("expected Ready, got {other:?}"),
        }
    }

    #[test]
    fn parses_ready_false_with_error() {
        match parse_incoming_line(r#"{"ready": false, "error": "model load failed"}"#) {
            Some(IncomingLine::Ready(msg)) => {
                assert!(!msg.ready);
                assert_eq!(msg.error.as_deref(), Some("model load failed"));
            }
            other => panic!("expected Ready, got {other:?}"),
        }
    }

    #[test]
    fn parses_success_response() {
        match parse_incoming_line(r#"{"id": "abcd1234", "text": "hello", "page_count": 2}"#) {
            Some(IncomingLine::Response(msg)) => {
                assert_eq!(msg.id, "abcd1234");
                assert_eq!(msg.text.as_deref(), Some("hello"));
                assert_eq!(msg.page_count, Some(2));
                assert!(msg.error.is_none());
            }
            other => panic!("expected Response, got {other:?}"),
        }
    }

    #[test]
    fn parses_failure_response() {
        match parse_incoming_line(r#"{"id": "abcd1234", "error": "oom"}"#) {
            Some(IncomingLine::Response(msg)) => {
                assert_eq!(msg.error.as_deref(), Some("oom"));
                assert!(msg.text.is_none());
            }
            other => panic!("expected Response, got {other:?}"),
        }
    }

    #[test]
    fn malformed_line_is_discarded() {
        assert!(parse_incoming_line("not json at all").is_none());
        assert!(parse_incoming_line(r#"{"unrelated": 1}"#).is_none());
    }

    #[test]
    fn request_message_serializes_to_single_line_object() {
        let msg = RequestMessage {
            id: "deadbeefcafebabe".into(),
            pdf_path: "/tmp/x/in.pdf".into(),
        };
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains("\"id\":\"deadbeefcafebabe\""));
        assert!(json.contains("\"pdf_path\":\"/tmp/x/in.pdf\""));
        assert!(!json.contains('\n'));
    }
}
