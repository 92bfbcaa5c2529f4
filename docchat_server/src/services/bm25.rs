//! Okapi BM25 over a tokenized corpus.
//!
//! Constants match the classical formulation: k1 = 1.5, b = 0.75, and
//! negative IDF values are floored at epsilon times the average IDF so rare
//! corpus shapes cannot produce negative term weights.

use std::collections::HashMap;

const K1: f64 = 1.5;
const B: f64 = 0.75;
const EPSILON: f64 = 0.25;

/// Unicode-aware tokenizer shared by indexing and querying: lowercase,
/// anything outside word characters / whitespace / Hangul syllables becomes
/// a space, split on whitespace.
pub fn tokenize(text: &str) -> Vec<String> {
  text
    .to_lowercase()
    .chars()
    .map(|c| {
      if c.is_alphanumeric() || c == '_' || c.is_whitespace() || ('가'..='힣').contains(&c) {
        c
      } else {
        ' '
      }
    })
    .collect::<String>()
    .split_whitespace()
    .map(str::to_string)
    .collect()
}

#[derive(Debug)]
pub struct Bm25Okapi {
  corpus_size: usize,
  avgdl: f64,
  doc_freqs: Vec<HashMap<String, usize>>,
  doc_len: Vec<usize>,
  idf: HashMap<String, f64>,
}

impl Bm25Okapi {
  pub fn new(corpus: &[Vec<String>]) -> Self {
    let corpus_size = corpus.len();
    let mut doc_freqs = Vec::with_capacity(corpus_size);
    let mut doc_len = Vec::with_capacity(corpus_size);
    let mut nd: HashMap<String, usize> = HashMap::new();
    let mut total_len = 0usize;

    for document in corpus {
      doc_len.push(document.len());
      total_len += document.len();

      let mut frequencies: HashMap<String, usize> = HashMap::new();
      for token in document {
        *frequencies.entry(token.clone()).or_insert(0) += 1;
      }
      for token in frequencies.keys() {
        *nd.entry(token.clone()).or_insert(0) += 1;
      }
      doc_freqs.push(frequencies);
    }

    let avgdl = if corpus_size > 0 {
      total_len as f64 / corpus_size as f64
    } else {
      0.0
    };

    // IDF with the negative-value floor.
    let mut idf: HashMap<String, f64> = HashMap::with_capacity(nd.len());
    let mut idf_sum = 0.0;
    let mut negative: Vec<String> = Vec::new();
    for (token, freq) in &nd {
      let value = ((corpus_size as f64 - *freq as f64 + 0.5) / (*freq as f64 + 0.5)).ln();
      idf_sum += value;
      if value < 0.0 {
        negative.push(token.clone());
      }
      idf.insert(token.clone(), value);
    }
    let average_idf = if idf.is_empty() {
      0.0
    } else {
      idf_sum / idf.len() as f64
    };
    let floor = EPSILON * average_idf;
    for token in negative {
      idf.insert(token, floor);
    }

    Self {
      corpus_size,
      avgdl,
      doc_freqs,
      doc_len,
      idf,
    }
  }

  pub fn is_empty(&self) -> bool {
    self.corpus_size == 0
  }

  /// BM25 score of the query against every document, in corpus order.
  pub fn get_scores(&self, query_tokens: &[String]) -> Vec<f64> {
    let mut scores = vec![0.0; self.corpus_size];
    for token in query_tokens {
      let Some(idf) = self.idf.get(token) else {
        continue;
      };
      for (i, frequencies) in self.doc_freqs.iter().enumerate() {
        let freq = *frequencies.get(token).unwrap_or(&0) as f64;
        if freq == 0.0 {
          continue;
        }
        let denominator = freq + K1 * (1.0 - B + B * self.doc_len[i] as f64 / self.avgdl);
        scores[i] += idf * (freq * (K1 + 1.0)) / denominator;
      }
    }
    scores
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn corpus(texts: &[&str]) -> Vec<Vec<String>> {
    texts.iter().map(|t| tokenize(t)).collect()
  }

  #[test]
  fn tokenizer_keeps_hangul_and_words() {
    assert_eq!(
      tokenize("환불 규정(제10조)을 알려줘! Refund-Policy"),
      vec!["환불", "규정", "제10조", "을", "알려줘", "refund", "policy"]
    );
    assert!(tokenize("!!!???").is_empty());
  }

  #[test]
  fn matching_document_ranks_first() {
    let corpus = corpus(&[
      "환불 규정은 제10조에 따라 처리한다",
      "배송 안내 및 교환 절차",
      "회원 가입과 탈퇴 절차",
    ]);
    let index = Bm25Okapi::new(&corpus);
    let scores = index.get_scores(&tokenize("환불 규정"));
    assert!(scores[0] > scores[1]);
    assert!(scores[0] > scores[2]);
    assert_eq!(scores[1], 0.0);
  }

  #[test]
  fn unknown_terms_score_zero() {
    let index = Bm25Okapi::new(&corpus(&["가 나 다", "라 마 바"]));
    let scores = index.get_scores(&tokenize("없는단어"));
    assert!(scores.iter().all(|s| *s == 0.0));
  }

  #[test]
  fn empty_corpus_is_empty() {
    let index = Bm25Okapi::new(&[]);
    assert!(index.is_empty());
    assert!(index.get_scores(&tokenize("질문")).is_empty());
  }

  #[test]
  fn idf_floor_prevents_negative_scores() {
    // A term present in every document would get a negative IDF without the
    // floor; scores must stay non-negative.
    let index = Bm25Okapi::new(&corpus(&["공통 단어 하나", "공통 단어 둘", "공통 단어 셋"]));
    let scores = index.get_scores(&tokenize("공통"));
    assert!(scores.iter().all(|s| *s >= 0.0));
  }
}
