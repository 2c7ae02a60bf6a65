use once_cell::sync::Lazy;
use serde_json::Value;
use tiktoken_rs::CoreBPE;

/// Process-wide cl100k_base tokenizer. Loading the vocabulary takes tens of
/// milliseconds, so it happens once.
static BPE: Lazy<CoreBPE> =
    Lazy::new(|| tiktoken_rs::cl100k_base().expect("cl100k_base vocabulary is bundled"));

/// Estimates the token count of a chat-completion payload.
///
/// Concatenates every `content` field in `messages`; non-string content
/// (tool results, multi-part arrays) is stringified as compact JSON before
/// tokenizing. Missing or malformed parts never fail — the count covers
/// whatever was extractable, down to 0.
pub fn estimate_tokens(payload: &Value) -> u64 {
    let Some(messages) = payload.get("messages").and_then(Value::as_array) else {
        return 0;
    };

    let mut text = String::new();
    for message in messages {
        match message.get("content") {
            Some(Value::String(s)) => text.push_str(s),
            Some(Value::Null) | None => {}
            Some(other) => {
                if let Ok(rendered) = serde_json::to_string(other) {
                    text.push_str(&rendered);
                }
            }
        }
    }

    if text.is_empty() {
        return 0;
    }
    BPE.encode_with_special_tokens(&text).len() as u64
}
