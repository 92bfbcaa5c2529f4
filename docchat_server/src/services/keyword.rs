//! Query-keyword extraction and per-document matching.
//!
//! Extraction approximates noun selection over Korean text: Hangul-aware
//! tokenization, trailing-particle stripping, a small interrogative/pronoun
//! stoplist and a 2-char minimum. Deterministic: the same (query, text)
//! always yields the same keywords.

use docchat_core::RetrievedDoc;

use crate::services::bm25::tokenize;

/// Interrogatives, pronouns and bound nouns that never make useful keywords.
const EXCLUDE_WORDS: &[&str] = &[
  "무엇", "뭐", "뭘", "어떻게", "왜", "언제", "어디", "누구", "어떤",
  "이거", "저거", "그거", "이것", "저것", "그것",
  "것", "수", "때", "곳", "데",
  "등", "및",
];

const MIN_KEYWORD_LENGTH: usize = 2;

/// Two-syllable particles tried before the single-syllable set.
const PARTICLES_TWO: &[&str] = &[
  "에서", "으로", "부터", "까지", "에게", "한테", "보다", "처럼", "마다", "조차", "마저", "이란", "란",
];
const PARTICLES_ONE: &[char] = &[
  '은', '는', '이', '가', '을', '를', '에', '의', '로', '와', '과', '도', '만',
];

fn is_hangul(c: char) -> bool {
  ('가'..='힣').contains(&c)
}

/// Strips one trailing particle from a Hangul token, keeping at least two
/// syllables so content words like "나이" survive intact.
fn strip_particle(token: &str) -> &str {
  if !token.chars().all(is_hangul) {
    return token;
  }
  let char_count = token.chars().count();
  for particle in PARTICLES_TWO {
    if let Some(stem) = token.strip_suffix(particle) {
      if stem.chars().count() >= MIN_KEYWORD_LENGTH {
        return stem;
      }
    }
  }
  if char_count > MIN_KEYWORD_LENGTH {
    let last = token.chars().last().unwrap_or(' ');
    if PARTICLES_ONE.contains(&last) {
      let cut = token.char_indices().last().map(|(i, _)| i).unwrap_or(0);
      return &token[..cut];
    }
  }
  token
}

/// Keywords of a query, deduped in order of appearance.
pub fn extract_keywords_from_query(query: &str) -> Vec<String> {
  let mut keywords = Vec::new();
  for token in tokenize(query) {
    if token.chars().all(|c| c.is_ascii_digit()) {
      continue;
    }
    let stem = strip_particle(&token).to_string();
    if stem.chars().count() < MIN_KEYWORD_LENGTH {
      continue;
    }
    if EXCLUDE_WORDS.contains(&stem.as_str()) {
      continue;
    }
    if !keywords.contains(&stem) {
      keywords.push(stem);
    }
  }
  keywords
}

/// Query keywords that occur in the text. A keyword followed by a particle
/// ("환불을", "환불이") still counts, since the match is on the stem.
pub fn find_matching_keywords(text: &str, query_keywords: &[String]) -> Vec<String> {
  if text.is_empty() || query_keywords.is_empty() {
    return Vec::new();
  }
  let lowered = text.to_lowercase();
  query_keywords
    .iter()
    .filter(|kw| lowered.contains(&kw.to_lowercase()))
    .cloned()
    .collect()
}

/// Attaches `keywords` to every document.
pub fn extract_keywords_for_documents(query: &str, documents: &mut [RetrievedDoc]) {
  let query_keywords = extract_keywords_from_query(query);
  for doc in documents.iter_mut() {
    let text = doc.text();
    doc.keywords = Some(if text.is_empty() || query_keywords.is_empty() {
      Vec::new()
    } else {
      find_matching_keywords(text, &query_keywords)
    });
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  #[test]
  fn extraction_strips_particles_and_stoplist() {
    let keywords = extract_keywords_from_query("환불 규정은 무엇인가요?");
    assert!(keywords.contains(&"환불".to_string()));
    assert!(keywords.contains(&"규정".to_string()));
    assert!(!keywords.iter().any(|k| k == "무엇"));
  }

  #[test]
  fn extraction_keeps_short_stems_intact() {
    // "나이" ends with a particle character but must not shrink below two
    // syllables.
    let keywords = extract_keywords_from_query("나이 제한");
    assert!(keywords.contains(&"나이".to_string()));
    assert!(keywords.contains(&"제한".to_string()));
  }

  #[test]
  fn extraction_is_deterministic() {
    let query = "계약 해지 절차와 위약금 규정을 알려줘";
    let first = extract_keywords_from_query(query);
    for _ in 0..10 {
      assert_eq!(extract_keywords_from_query(query), first);
    }
  }

  #[test]
  fn matching_allows_particle_variants() {
    let keywords = vec!["환불".to_string(), "배송".to_string()];
    let matched = find_matching_keywords("환불을 원하시면 고객센터로 연락하세요", &keywords);
    assert_eq!(matched, vec!["환불"]);
  }

  #[test]
  fn documents_get_keyword_lists() {
    let mut docs = vec![
      RetrievedDoc::new("a", 0.9, json!({"text": "환불 규정 안내"})),
      RetrievedDoc::new("b", 0.8, json!({"text": "전혀 다른 내용"})),
      RetrievedDoc::new("c", 0.7, json!({})),
    ];
    extract_keywords_for_documents("환불 규정", &mut docs);
    assert_eq!(docs[0].keywords.as_ref().unwrap().len(), 2);
    assert!(docs[1].keywords.as_ref().unwrap().is_empty());
    assert!(docs[2].keywords.as_ref().unwrap().is_empty());
  }
}
