//! PACK1 envelope: the textual response wrapper every tool call
//! returns. The wire format of the payload itself is treated as opaque —
//! callers hand this module a rendered string and get back the JSON shape
//! a session writes onto the transport.

use serde::Serialize;

/// One `content` entry in a tool result. PACK1 only ever produces `text`
/// entries here; the variant exists so the shape matches the external
/// interface literally (`{content:[{type:"text", text:...}]}`).
#[derive(Serialize, Debug, Clone)]
pub struct ContentItem {
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub text: String,
}

#[derive(Serialize, Debug, Clone)]
pub struct ToolResult {
    pub content: Vec<ContentItem>,
}

/// Wraps an already-rendered PACK1 payload for a successful tool call.
pub fn wrap(payload: String) -> ToolResult {
    ToolResult { content: vec![ContentItem { kind: "text", text: payload }] }
}

#[derive(Serialize, Debug, Clone)]
pub struct ToolError {
    pub code: i64,
    pub message: String,
}

#[derive(Serialize, Debug, Clone)]
pub struct ErrorResult {
    #[serde(rename = "isError")]
    pub is_error: bool,
    pub error: ToolError,
}

pub fn wrap_error(code: i64, message: String) -> ErrorResult {
    ErrorResult { is_error: true, error: ToolError { code, message } }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wrap_produces_single_text_content_item() {
        let result = wrap("hello".to_string());
        assert_eq!(result.content.len(), 1);
        assert_eq!(result.content[0].kind, "text");
        assert_eq!(result.content[0].text, "hello");
    }

    #[test]
    fn wrap_error_sets_is_error_flag() {
        let result = wrap_error(-32602, "bad args".to_string());
        assert!(result.is_error);
        assert_eq!(result.error.code, -32602);
    }

    #[test]
    fn serializes_to_expected_shape() {
        let result = wrap("x".to_string());
        let v = serde_json::to_value(&result).unwrap();
        assert_eq!(v["content"][0]["type"], "text");
        assert_eq!(v["content"][0]["text"], "x");
    }
}
