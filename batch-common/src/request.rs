//! Wire formats for batch input and output files.
//!
//! Input files are line-delimited JSON in the OpenAI batch shape: one
//! `RequestLine` per line, each wrapping a chat-completion body. Output files
//! hold one `ResultLine` per input request.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::error::{ErrorKind, InputError};

pub const CHAT_COMPLETIONS_URL: &str = "/v1/chat/completions";

/// One line of an input file. Unknown fields are rejected so that typos in
/// client payloads fail loudly at admission instead of being silently dropped.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RequestLine {
    pub custom_id: String,
    pub method: String,
    pub url: String,
    pub body: ChatCompletionBody,
}

/// An OpenAI-shaped chat-completion request body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ChatCompletionBody {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seed: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

/// One line of an output file: either a successful response or a per-request
/// error. Exactly one of `response` / `error` is present.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultLine {
    pub custom_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response: Option<ResultResponse>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ResultError>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultResponse {
    pub status_code: u16,
    pub body: CompletionBody,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletionBody {
    pub choices: Vec<Choice>,
    pub usage: Usage,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Choice {
    pub message: ChoiceMessage,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChoiceMessage {
    pub content: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Usage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultError {
    pub kind: ErrorKind,
    pub message: String,
}

impl ResultLine {
    pub fn success(custom_id: String, body: CompletionBody) -> Self {
        Self {
            custom_id,
            response: Some(ResultResponse {
                status_code: 200,
                body,
            }),
            error: None,
        }
    }

    pub fn failure(custom_id: String, kind: ErrorKind, message: String) -> Self {
        Self {
            custom_id,
            response: None,
            error: Some(ResultError { kind, message }),
        }
    }
}

/// Parse and validate a whole input file.
///
/// Returns the ordered request list, or the first validation problem found.
/// Every error here surfaces as an `invalid_input` admission rejection.
pub fn parse_input(raw: &[u8], max_requests: usize) -> Result<Vec<RequestLine>, InputError> {
    let text = std::str::from_utf8(raw).map_err(|e| InputError::MalformedLine {
        line: 0,
        message: format!("not utf-8: {}", e),
    })?;

    let mut requests = Vec::new();
    let mut seen_ids: HashSet<String> = HashSet::new();

    for (index, line) in text.lines().enumerate() {
        let line_no = index + 1;
        if line.trim().is_empty() {
            continue;
        }

        let request: RequestLine =
            serde_json::from_str(line).map_err(|e| InputError::MalformedLine {
                line: line_no,
                message: e.to_string(),
            })?;

        if request.method != "POST" {
            return Err(InputError::InvalidMethod {
                line: line_no,
                method: request.method,
            });
        }
        if request.url != CHAT_COMPLETIONS_URL {
            return Err(InputError::InvalidUrl {
                line: line_no,
                url: request.url,
            });
        }
        if !seen_ids.insert(request.custom_id.clone()) {
            return Err(InputError::DuplicateCustomId(request.custom_id));
        }

        requests.push(request);

        if requests.len() > max_requests {
            // Bail before buffering an arbitrarily oversized file.
            return Err(InputError::TooManyRequests {
                count: requests.len(),
                max: max_requests,
            });
        }
    }

    if requests.is_empty() {
        return Err(InputError::Empty);
    }

    Ok(requests)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn line(custom_id: &str) -> String {
        format!(
            r#"{{"custom_id": "{}", "method": "POST", "url": "/v1/chat/completions", "body": {{"model": "test-model", "messages": [{{"role": "user", "content": "2+2?"}}], "max_tokens": 16}}}}"#,
            custom_id
        )
    }

    #[test]
    fn test_parse_valid_input() {
        let raw = format!("{}\n{}\n{}\n", line("a"), line("b"), line("c"));
        let requests = parse_input(raw.as_bytes(), 100).unwrap();

        assert_eq!(requests.len(), 3);
        assert_eq!(requests[0].custom_id, "a");
        assert_eq!(requests[2].custom_id, "c");
        assert_eq!(requests[0].body.messages[0].content, "2+2?");
        assert_eq!(requests[0].body.max_tokens, Some(16));
    }

    #[test]
    fn test_blank_lines_are_skipped() {
        let raw = format!("{}\n\n{}\n", line("a"), line("b"));
        let requests = parse_input(raw.as_bytes(), 100).unwrap();
        assert_eq!(requests.len(), 2);
    }

    #[test]
    fn test_malformed_line_is_rejected_with_line_number() {
        let raw = format!("{}\nnot json\n", line("a"));
        let err = parse_input(raw.as_bytes(), 100).unwrap_err();
        assert!(matches!(err, InputError::MalformedLine { line: 2, .. }));
    }

    #[test]
    fn test_unknown_field_is_rejected() {
        let raw = r#"{"custom_id": "a", "method": "POST", "url": "/v1/chat/completions", "surprise": 1, "body": {"model": "m", "messages": []}}"#;
        let err = parse_input(raw.as_bytes(), 100).unwrap_err();
        assert!(matches!(err, InputError::MalformedLine { line: 1, .. }));
    }

    #[test]
    fn test_duplicate_custom_id_is_rejected() {
        let raw = format!("{}\n{}\n", line("a"), line("a"));
        let err = parse_input(raw.as_bytes(), 100).unwrap_err();
        match err {
            InputError::DuplicateCustomId(id) => assert_eq!(id, "a"),
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn test_line_cap_is_enforced() {
        let raw = format!("{}\n{}\n{}\n", line("a"), line("b"), line("c"));
        let err = parse_input(raw.as_bytes(), 2).unwrap_err();
        assert!(matches!(
            err,
            InputError::TooManyRequests { count: 3, max: 2 }
        ));
    }

    #[test]
    fn test_empty_file_is_rejected() {
        assert!(matches!(parse_input(b"", 100), Err(InputError::Empty)));
        assert!(matches!(parse_input(b"\n\n", 100), Err(InputError::Empty)));
    }

    #[test]
    fn test_non_post_method_is_rejected() {
        let raw = r#"{"custom_id": "a", "method": "GET", "url": "/v1/chat/completions", "body": {"model": "m", "messages": []}}"#;
        let err = parse_input(raw.as_bytes(), 100).unwrap_err();
        assert!(matches!(err, InputError::InvalidMethod { line: 1, .. }));
    }

    #[test]
    fn test_result_line_serializes_one_arm_only() {
        let ok = ResultLine::success(
            "a".to_string(),
            CompletionBody {
                choices: vec![Choice {
                    message: ChoiceMessage {
                        content: "4".to_string(),
                    },
                }],
                usage: Usage {
                    prompt_tokens: 3,
                    completion_tokens: 1,
                },
            },
        );
        let json = serde_json::to_string(&ok).unwrap();
        assert!(json.contains("\"response\""));
        assert!(!json.contains("\"error\""));

        let failed = ResultLine::failure(
            "b".to_string(),
            ErrorKind::RequestFailed,
            "engine rejected prompt".to_string(),
        );
        let json = serde_json::to_string(&failed).unwrap();
        assert!(!json.contains("\"response\""));
        assert!(json.contains("\"request_failed\""));
    }
}
