//! SSE framing helpers and the deep-reasoning thought stripper.

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::json;

/// Inline tags the deep-reasoning family leaks into its answers.
static CLEANUP_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
  [
    r"(?i)</?thought[^>]*>",
    r"(?i)</?think[^>]*>",
    r"(?i)</?ref[^>]*>",
    r"(?i)</?span[^>]*>",
    r"(?i)\[?\|?endofturn\|?\]?",
    r"<신설\s*\d*\?*>",
  ]
  .iter()
  .map(|p| Regex::new(p).expect("static cleanup pattern"))
  .collect()
});

const THOUGHT_END: &str = "</thought>";
/// Tail kept while waiting for `</thought>`; long enough that the marker can
/// never be lost across chunk boundaries.
const STRIP_BUFFER_TAIL: usize = 64;

pub fn clean_tags(content: &str) -> String {
  let mut out = content.to_string();
  for pattern in CLEANUP_PATTERNS.iter() {
    out = pattern.replace_all(&out, "").into_owned();
  }
  out
}

/// Pulls the delta content out of one SSE line.
///
/// Returns `None` for non-data lines, empty payloads and the `[DONE]`
/// sentinel (those are forwarded verbatim by the caller).
pub fn extract_content_from_sse(line: &str) -> Option<String> {
  let json_str = line.strip_prefix("data:")?.trim();
  if json_str.is_empty() || json_str == "[DONE]" {
    return None;
  }
  let data: serde_json::Value = serde_json::from_str(json_str).ok()?;
  let delta = data.get("choices")?.get(0)?.get("delta")?;
  delta
    .get("content")
    .and_then(|c| c.as_str())
    .map(str::to_string)
}

/// Builds a synthetic delta frame for content produced after stripping.
pub fn content_chunk(content: &str) -> String {
  let data = json!({
    "choices": [{
      "delta": {"content": content},
      "index": 0
    }]
  });
  format!("data: {data}\n\n")
}

/// Stateful `<thought>` prelude removal for deep-reasoning streams.
///
/// Buffers incoming content and emits nothing until `</thought>` is seen;
/// the remainder of that chunk is flushed (tag-cleaned) and every later
/// chunk passes straight through after tag cleanup. If the marker never
/// arrives the stream produces no content at all.
#[derive(Debug, Default)]
pub struct ThoughtStripper {
  buffer: String,
  ended: bool,
}

impl ThoughtStripper {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn push(&mut self, content: &str) -> Option<String> {
    if self.ended {
      let cleaned = clean_tags(content);
      if cleaned.is_empty() {
        return None;
      }
      return Some(cleaned);
    }

    self.buffer.push_str(content);
    if let Some(idx) = self.buffer.find(THOUGHT_END) {
      self.ended = true;
      let after = self.buffer[idx + THOUGHT_END.len()..].to_string();
      self.buffer = String::new();
      let cleaned = clean_tags(&after);
      if cleaned.trim().is_empty() {
        return None;
      }
      return Some(cleaned);
    }

    // Only the tail can still complete the marker; drop the rest.
    if self.buffer.len() > STRIP_BUFFER_TAIL {
      let keep_from = self
        .buffer
        .char_indices()
        .rev()
        .nth(STRIP_BUFFER_TAIL - 1)
        .map(|(i, _)| i)
        .unwrap_or(0);
      self.buffer.drain(..keep_from);
    }
    None
  }
}

/// One-shot variant for non-streaming responses: drops everything up to and
/// including the first `</thought>`, then cleans inline tags.
pub fn strip_thought_block(content: &str) -> String {
  let body = match content.split_once(THOUGHT_END) {
    Some((_, after)) => after,
    None => content,
  };
  clean_tags(body).trim().to_string()
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn extracts_delta_content() {
    let line = r#"data: {"choices":[{"delta":{"content":"안녕"},"index":0}]}"#;
    assert_eq!(extract_content_from_sse(line).as_deref(), Some("안녕"));
    assert_eq!(extract_content_from_sse("data: [DONE]"), None);
    assert_eq!(extract_content_from_sse(": keep-alive"), None);
    assert_eq!(extract_content_from_sse("data: "), None);
  }

  #[test]
  fn stripper_buffers_until_thought_ends() {
    // Scenario: chunks "<thought>solve", " in english</thought>안녕", "하세요."
    let mut stripper = ThoughtStripper::new();
    assert_eq!(stripper.push("<thought>solve"), None);
    assert_eq!(stripper.push(" in english</thought>안녕").as_deref(), Some("안녕"));
    assert_eq!(stripper.push("하세요.").as_deref(), Some("하세요."));
  }

  #[test]
  fn stripper_handles_marker_split_across_chunks() {
    let mut stripper = ThoughtStripper::new();
    assert_eq!(stripper.push("reasoning</thou"), None);
    assert_eq!(stripper.push("ght>답변"), Some("답변".to_string()));
  }

  #[test]
  fn stripper_emits_nothing_without_marker() {
    let mut stripper = ThoughtStripper::new();
    for _ in 0..1000 {
      assert_eq!(stripper.push("reasoning forever "), None);
    }
    // Bounded: buffer never exceeds the retained tail plus one chunk.
    assert!(stripper.buffer.len() <= STRIP_BUFFER_TAIL + "reasoning forever ".len());
  }

  #[test]
  fn stripper_cleans_tags_after_thought() {
    let mut stripper = ThoughtStripper::new();
    assert_eq!(
      stripper.push("x</thought><ref>제3조</ref> 내용[|endofturn|]"),
      Some("제3조 내용".to_string())
    );
  }

  #[test]
  fn one_shot_strip() {
    let raw = "<thought>\nlong english reasoning\n</thought>\n실제 답변입니다.<span>";
    assert_eq!(strip_thought_block(raw), "실제 답변입니다.");
    // Without a marker the content is only tag-cleaned.
    assert_eq!(strip_thought_block("그냥 답변"), "그냥 답변");
  }

  #[test]
  fn content_chunk_roundtrips() {
    let chunk = content_chunk("하세요.");
    assert!(chunk.starts_with("data: "));
    assert!(chunk.ends_with("\n\n"));
    assert_eq!(
      extract_content_from_sse(chunk.trim_end()).as_deref(),
      Some("하세요.")
    );
  }
}
