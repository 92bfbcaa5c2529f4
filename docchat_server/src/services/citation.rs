//! Quote/article-reference extraction between an answer and its sources.
//!
//! Three matching strategies, union of hits, at most 5 phrases per source:
//! statute-style article references, quoted phrases, and a greedy
//! longest-common-substring fallback used only when the first two found
//! nothing anywhere. This module never fails; a source without matches gets
//! an empty list.

use once_cell::sync::Lazy;
use regex::Regex;
use tracing::debug;

use docchat_core::RetrievedDoc;

/// Minimum phrase length (chars) for quote and article-sentence matches.
const MIN_MATCH_LENGTH: usize = 10;
/// Minimum length for the LCS fallback.
const NGRAM_MIN_LENGTH: usize = 15;
/// Longest substring the greedy scan will extend to.
const NGRAM_MAX_SPAN: usize = 200;
const MAX_PHRASES_PER_SOURCE: usize = 5;
const MAX_NGRAM_PHRASES: usize = 2;

static ARTICLE_PATTERN: Lazy<Regex> = Lazy::new(|| {
  Regex::new(r"제\s*(\d+)\s*조(?:\s*제?\s*(\d+)\s*항)?(?:\s*제?\s*(\d+)\s*호)?")
    .expect("static article pattern")
});

static QUOTE_PATTERN: Lazy<Regex> =
  Lazy::new(|| Regex::new(r#"["“”'‘’](.*?)["“”'‘’]"#).expect("static quote pattern"));

static WHITESPACE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+").expect("static ws pattern"));

fn normalize_whitespace(text: &str) -> String {
  WHITESPACE.replace_all(text.trim(), " ").into_owned()
}

fn char_len(s: &str) -> usize {
  s.chars().count()
}

/// `제N조 [제M항 [제K호]]` references mentioned in the answer, deduped in
/// order of appearance.
pub fn extract_article_references(text: &str) -> Vec<String> {
  let mut references = Vec::new();
  for caps in ARTICLE_PATTERN.captures_iter(text) {
    let mut reference = format!("제{}조", &caps[1]);
    if let Some(paragraph) = caps.get(2) {
      reference.push_str(&format!(" 제{}항", paragraph.as_str()));
    }
    if let Some(clause) = caps.get(3) {
      reference.push_str(&format!(" 제{}호", clause.as_str()));
    }
    if !references.contains(&reference) {
      references.push(reference);
    }
  }
  references
}

/// Substrings inside matched quote pairs, length ≥ 10 chars.
pub fn extract_quoted_phrases(text: &str) -> Vec<String> {
  let mut phrases = Vec::new();
  for caps in QUOTE_PATTERN.captures_iter(text) {
    let phrase = caps[1].trim().to_string();
    if char_len(&phrase) >= MIN_MATCH_LENGTH && !phrases.contains(&phrase) {
      phrases.push(phrase);
    }
  }
  phrases
}

/// Splits on `.`, `?`, `!` followed by whitespace, except after a digit
/// (keeps "제10조 제2항." style enumerations intact).
fn split_sentences(text: &str) -> Vec<&str> {
  let chars: Vec<(usize, char)> = text.char_indices().collect();
  let mut sentences = Vec::new();
  let mut start = 0usize;
  for i in 0..chars.len() {
    let (_, c) = chars[i];
    if matches!(c, '.' | '?' | '!') {
      let prev_is_digit = i > 0 && chars[i - 1].1.is_ascii_digit();
      let next_is_ws = chars
        .get(i + 1)
        .map(|(_, n)| n.is_whitespace())
        .unwrap_or(false);
      if !prev_is_digit && next_is_ws {
        let (byte_idx, _) = chars[i];
        sentences.push(&text[start..byte_idx]);
        start = byte_idx + c.len_utf8();
      }
    }
  }
  if start < text.len() {
    sentences.push(&text[start..]);
  }
  sentences
}

/// Sentences of the source that mention every component of the reference.
pub fn find_article_in_source(article_ref: &str, source_text: &str) -> Vec<String> {
  let Some(caps) = ARTICLE_PATTERN.captures(article_ref) else {
    return Vec::new();
  };

  let mut patterns = vec![Regex::new(&format!(r"제\s*{}\s*조", &caps[1])).ok()];
  if let Some(paragraph) = caps.get(2) {
    patterns.push(Regex::new(&format!(r"제\s*{}\s*항", paragraph.as_str())).ok());
  }
  let patterns: Vec<Regex> = patterns.into_iter().flatten().collect();

  let mut sentences = Vec::new();
  for sentence in split_sentences(source_text) {
    let sentence = sentence.trim();
    if sentence.is_empty() || char_len(sentence) < MIN_MATCH_LENGTH {
      continue;
    }
    if patterns.iter().all(|p| p.is_match(sentence)) {
      let owned = sentence.to_string();
      if !sentences.contains(&owned) {
        sentences.push(owned);
      }
    }
  }
  sentences
}

/// Greedy longest-common-substring scan between answer and source, both
/// whitespace-normalized. O(n·m)-ish; only invoked as the last resort.
pub fn find_matching_sentences(
  response_text: &str,
  source_text: &str,
  min_length: usize,
) -> Vec<String> {
  let response = normalize_whitespace(response_text);
  let source = normalize_whitespace(source_text);
  let response_chars: Vec<char> = response.chars().collect();
  let response_len = response_chars.len();

  let mut matched = Vec::new();
  let mut i = 0usize;
  while i + min_length < response_len {
    let mut best_match = String::new();
    let max_end = (i + NGRAM_MAX_SPAN).min(response_len);
    for end in (i + min_length)..=max_end {
      let candidate: String = response_chars[i..end].iter().collect();
      if source.contains(&candidate) {
        best_match = candidate;
      } else {
        break;
      }
    }

    if char_len(&best_match) >= min_length {
      let advance = char_len(&best_match);
      let trimmed = best_match.trim().to_string();
      if char_len(&trimmed) >= min_length && !matched.contains(&trimmed) {
        matched.push(trimmed);
      }
      i += advance;
    } else {
      i += 1;
    }
  }
  matched
}

/// Attaches `cited_phrases` to every source. Runs after the full answer is
/// known.
pub fn extract_citations_for_sources(llm_response: &str, sources: &mut [RetrievedDoc]) {
  if llm_response.is_empty() {
    for source in sources.iter_mut() {
      source.cited_phrases.get_or_insert_with(Vec::new);
    }
    return;
  }

  let article_refs = extract_article_references(llm_response);
  let quoted_phrases = extract_quoted_phrases(llm_response);
  debug!(
    articles = article_refs.len(),
    quotes = quoted_phrases.len(),
    "extracted citation candidates"
  );

  for source in sources.iter_mut() {
    let source_text = source.text().to_string();
    if source_text.is_empty() {
      source.cited_phrases = Some(Vec::new());
      continue;
    }

    let mut cited: Vec<String> = Vec::new();

    for article_ref in &article_refs {
      for sentence in find_article_in_source(article_ref, &source_text) {
        if !cited.contains(&sentence) {
          cited.push(sentence);
        }
      }
    }

    for phrase in &quoted_phrases {
      if source_text.contains(phrase.as_str()) && !cited.contains(phrase) {
        cited.push(phrase.clone());
      }
    }

    // LCS fallback only when neither strategy produced anything at all.
    if cited.is_empty() && article_refs.is_empty() && quoted_phrases.is_empty() {
      for phrase in find_matching_sentences(llm_response, &source_text, NGRAM_MIN_LENGTH)
        .into_iter()
        .take(MAX_NGRAM_PHRASES)
      {
        if !cited.contains(&phrase) {
          cited.push(phrase);
        }
      }
    }

    cited.truncate(MAX_PHRASES_PER_SOURCE);
    source.cited_phrases = Some(cited);
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  fn doc(text: &str) -> RetrievedDoc {
    RetrievedDoc::new("d", 0.8, json!({ "text": text }))
  }

  #[test]
  fn article_references() {
    let refs = extract_article_references("제10조 제2항에 따르면, 그리고 제3조를 보면");
    assert_eq!(refs, vec!["제10조 제2항", "제3조"]);
    let refs = extract_article_references("제 5 조 제 1 항 제 2 호");
    assert_eq!(refs, vec!["제5조 제1항 제2호"]);
  }

  #[test]
  fn quoted_phrases_need_min_length() {
    let phrases = extract_quoted_phrases("그는 \"환불은 칠일 이내에 처리한다\"라고 했고 \"짧다\"고 했다");
    assert_eq!(phrases, vec!["환불은 칠일 이내에 처리한다"]);
  }

  #[test]
  fn citation_matching_across_strategies() {
    // Answer cites an article and quotes a phrase present in the source.
    let answer = "제10조 제2항에 따르면 \"환불은 7일 이내에\" 가능합니다.";
    let mut sources = vec![doc("제10조 제2항에 따라 환불은 7일 이내에 처리한다. 기타 조항은 별도로 정한다.")];
    extract_citations_for_sources(answer, &mut sources);

    let cited = sources[0].cited_phrases.as_ref().unwrap();
    assert!(cited.iter().any(|p| p == "환불은 7일 이내에"));
    assert!(cited.iter().any(|p| p.contains("제10조 제2항에 따라")));
    assert!(cited.len() <= 5);
  }

  #[test]
  fn every_cited_phrase_is_substring_of_source() {
    let answer = "제10조 제2항에 따르면 \"환불은 7일 이내에\" 가능합니다.";
    let source_text = "제10조 제2항에 따라 환불은 7일 이내에 처리한다.";
    let mut sources = vec![doc(source_text)];
    extract_citations_for_sources(answer, &mut sources);
    let normalized_source = normalize_whitespace(source_text);
    for phrase in sources[0].cited_phrases.as_ref().unwrap() {
      assert!(
        normalized_source.contains(&normalize_whitespace(phrase)),
        "phrase '{phrase}' not found in source"
      );
    }
  }

  #[test]
  fn ngram_fallback_only_without_refs_or_quotes() {
    let answer = "환불 절차는 고객센터 접수 후 영업일 기준 칠일 안에 완료됩니다";
    let mut sources = vec![doc("환불 절차는 고객센터 접수 후 영업일 기준 칠일 안에 완료됩니다. 자세한 사항은 약관 참조.")];
    extract_citations_for_sources(answer, &mut sources);
    let cited = sources[0].cited_phrases.as_ref().unwrap();
    assert!(!cited.is_empty());
    assert!(cited.len() <= MAX_NGRAM_PHRASES);
  }

  #[test]
  fn unmatched_source_gets_empty_list() {
    let answer = "제10조 제2항에 따르면 가능합니다.";
    let mut sources = vec![doc("전혀 관련 없는 배송 안내 문서입니다. 배송은 이틀 걸립니다.")];
    extract_citations_for_sources(answer, &mut sources);
    assert_eq!(sources[0].cited_phrases.as_ref().unwrap().len(), 0);
  }

  #[test]
  fn sentence_split_keeps_numeric_periods() {
    let sentences = split_sentences("제1.5조는 다르다. 두번째 문장이다. 숫자 3. 다음");
    assert!(sentences[0].contains("제1.5조는 다르다"));
    // "숫자 3."의 마침표는 숫자 뒤라 분리되지 않는다.
    assert!(sentences.iter().any(|s| s.contains("숫자 3. 다음")));
  }

  #[test]
  fn empty_answer_attaches_empty_lists() {
    let mut sources = vec![doc("본문")];
    extract_citations_for_sources("", &mut sources);
    assert_eq!(sources[0].cited_phrases.as_ref().unwrap().len(), 0);
  }
}
