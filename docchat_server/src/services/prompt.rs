//! Collection → system-prompt resolution with mtime-guarded caching.
//!
//! Layout: `prompts/` holds one Markdown template per domain plus
//! `mapping.json` keyed by collection name. Fallback chain: mapping entry →
//! mapping's `default_prompt` → `default.md` → hardcoded default. Stale
//! cache entries are acceptable for a brief window after an edit.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::SystemTime;

use serde::Deserialize;
use tracing::{info, warn};

use docchat_core::models::{ModelFamily, ReasoningLevel};

const DEFAULT_PROMPT_FILE: &str = "default.md";
const CASUAL_PROMPT_FILE: &str = "casual.md";
const REASONING_PLACEHOLDER: &str = "{reasoning_instruction}";

#[derive(Debug, Clone, Default, Deserialize)]
struct Mapping {
  #[serde(default)]
  collection_prompts: HashMap<String, CollectionPrompt>,
  #[serde(default)]
  default_prompt: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct CollectionPrompt {
  prompt_file: Option<String>,
  #[serde(default)]
  #[allow(dead_code)]
  description: Option<String>,
}

pub struct PromptLoader {
  prompts_dir: PathBuf,
  file_cache: Mutex<HashMap<String, (String, SystemTime)>>,
  mapping_cache: Mutex<Option<(Mapping, SystemTime)>>,
}

impl PromptLoader {
  pub fn new(prompts_dir: impl Into<PathBuf>) -> Self {
    let prompts_dir = prompts_dir.into();
    if !prompts_dir.exists() {
      warn!("prompts directory does not exist, creating: {}", prompts_dir.display());
      let _ = fs::create_dir_all(&prompts_dir);
    }
    Self {
      prompts_dir,
      file_cache: Mutex::new(HashMap::new()),
      mapping_cache: Mutex::new(None),
    }
  }

  /// System prompt for a collection with the `{reasoning_instruction}`
  /// placeholder substituted. An unbound collection means casual mode.
  pub fn get_system_prompt(
    &self,
    collection_name: Option<&str>,
    reasoning_level: ReasoningLevel,
    model_key: Option<&str>,
  ) -> String {
    let prompt_file = self.prompt_file_for(collection_name);
    let content = self.read_prompt_file(&prompt_file);
    let instruction = reasoning_instruction(
      reasoning_level,
      model_key.map(ModelFamily::of_key).unwrap_or(ModelFamily::Generic),
    );
    content.replace(REASONING_PLACEHOLDER, instruction)
  }

  fn prompt_file_for(&self, collection_name: Option<&str>) -> String {
    let Some(collection_name) = collection_name.filter(|c| !c.is_empty()) else {
      return CASUAL_PROMPT_FILE.to_string();
    };

    let mapping = self.load_mapping();
    if let Some(entry) = mapping.collection_prompts.get(collection_name) {
      if let Some(file) = &entry.prompt_file {
        return file.clone();
      }
    }
    mapping
      .default_prompt
      .unwrap_or_else(|| DEFAULT_PROMPT_FILE.to_string())
  }

  fn load_mapping(&self) -> Mapping {
    let mapping_path = self.prompts_dir.join("mapping.json");
    let Ok(metadata) = fs::metadata(&mapping_path) else {
      return Mapping::default();
    };
    let mtime = metadata.modified().unwrap_or(SystemTime::UNIX_EPOCH);

    {
      let cache = self.mapping_cache.lock().expect("mapping cache lock");
      if let Some((cached, cached_mtime)) = cache.as_ref() {
        if *cached_mtime == mtime {
          return cached.clone();
        }
      }
    }

    match fs::read_to_string(&mapping_path)
      .map_err(|e| e.to_string())
      .and_then(|raw| serde_json::from_str::<Mapping>(&raw).map_err(|e| e.to_string()))
    {
      Ok(mapping) => {
        info!(
          "loaded mapping.json ({} collections)",
          mapping.collection_prompts.len()
        );
        *self.mapping_cache.lock().expect("mapping cache lock") = Some((mapping.clone(), mtime));
        mapping
      }
      Err(e) => {
        warn!("failed to load mapping.json: {e}");
        Mapping::default()
      }
    }
  }

  fn read_prompt_file(&self, filename: &str) -> String {
    let path = self.prompts_dir.join(filename);
    match self.read_with_cache(&path, filename) {
      Some(content) => content,
      None => {
        if filename != DEFAULT_PROMPT_FILE {
          warn!("prompt file '{filename}' unavailable, falling back to {DEFAULT_PROMPT_FILE}");
          self.read_prompt_file(DEFAULT_PROMPT_FILE)
        } else {
          warn!("{DEFAULT_PROMPT_FILE} unavailable, using hardcoded default prompt");
          hardcoded_default_prompt().to_string()
        }
      }
    }
  }

  fn read_with_cache(&self, path: &Path, filename: &str) -> Option<String> {
    let metadata = fs::metadata(path).ok()?;
    let mtime = metadata.modified().unwrap_or(SystemTime::UNIX_EPOCH);

    {
      let cache = self.file_cache.lock().expect("prompt cache lock");
      if let Some((content, cached_mtime)) = cache.get(filename) {
        if *cached_mtime == mtime {
          return Some(content.clone());
        }
      }
    }

    let content = fs::read_to_string(path).ok()?;
    info!("loaded prompt file: {filename} ({} chars)", content.chars().count());
    self
      .file_cache
      .lock()
      .expect("prompt cache lock")
      .insert(filename.to_string(), (content.clone(), mtime));
    Some(content)
  }

  /// Clears every cache so edited templates apply immediately.
  pub fn reload(&self) {
    self.file_cache.lock().expect("prompt cache lock").clear();
    *self.mapping_cache.lock().expect("mapping cache lock") = None;
    info!("all prompt caches cleared");
  }
}

/// Per-family reasoning instruction tables.
pub fn reasoning_instruction(level: ReasoningLevel, family: ModelFamily) -> &'static str {
  match family {
    ModelFamily::GptOss => match level {
      ReasoningLevel::Low => "Reasoning: low",
      ReasoningLevel::Medium => "Reasoning: medium",
      ReasoningLevel::High => "Reasoning: high",
    },
    ModelFamily::Exaone => match level {
      ReasoningLevel::Low => "간결하게 답변하세요.",
      ReasoningLevel::Medium => "",
      ReasoningLevel::High => {
        "Please reason step by step. 단계별로 깊이 분석하여 상세하게 답변하세요."
      }
    },
    ModelFamily::Generic => match level {
      ReasoningLevel::Low => "답변은 간단하고 명확하게 작성하세요.",
      ReasoningLevel::Medium => "답변은 적절한 수준의 설명과 함께 작성하세요.",
      ReasoningLevel::High => "답변은 깊이 있는 분석과 추론을 포함하여 상세하게 작성하세요.",
    },
  }
}

fn hardcoded_default_prompt() -> &'static str {
  "당신은 문서 기반 질의응답을 수행하는 AI 어시스턴트입니다.\n\n\
다음 규칙을 따라주세요:\n\
1. 제공된 문서의 내용만을 기반으로 답변하세요.\n\
2. 문서에 없는 내용은 추측하지 말고, \"문서에서 관련 정보를 찾을 수 없습니다\"라고 답하세요.\n\
3. 답변 시 관련 문서 번호를 인용하세요 (예: [문서 1], [문서 2]).\n\
4. {reasoning_instruction}\n"
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::fs;
  use tempfile::tempdir;

  fn write(dir: &Path, name: &str, content: &str) {
    fs::write(dir.join(name), content).unwrap();
  }

  #[test]
  fn resolves_mapping_and_substitutes_placeholder() {
    let tmp = tempdir().unwrap();
    write(tmp.path(), "default.md", "기본. {reasoning_instruction}");
    write(tmp.path(), "regulation.md", "규정 안내. {reasoning_instruction}");
    write(
      tmp.path(),
      "mapping.json",
      r#"{"collection_prompts": {"regs": {"prompt_file": "regulation.md"}}, "default_prompt": "default.md"}"#,
    );

    let loader = PromptLoader::new(tmp.path());
    let prompt = loader.get_system_prompt(Some("regs"), ReasoningLevel::High, Some("gpt-oss-20b"));
    assert!(prompt.starts_with("규정 안내."));
    assert!(prompt.contains("Reasoning: high"));
    assert!(!prompt.contains(REASONING_PLACEHOLDER));

    // Unknown collection falls back to default_prompt.
    let prompt = loader.get_system_prompt(Some("unknown"), ReasoningLevel::Low, None);
    assert!(prompt.starts_with("기본."));
    assert!(prompt.contains("간단하고 명확하게"));
  }

  #[test]
  fn casual_mode_uses_casual_template() {
    let tmp = tempdir().unwrap();
    write(tmp.path(), "casual.md", "일상 대화. {reasoning_instruction}");
    write(tmp.path(), "default.md", "기본.");
    let loader = PromptLoader::new(tmp.path());
    let prompt = loader.get_system_prompt(None, ReasoningLevel::Medium, None);
    assert!(prompt.starts_with("일상 대화."));
  }

  #[test]
  fn missing_files_fall_back_to_hardcoded_default() {
    let tmp = tempdir().unwrap();
    let loader = PromptLoader::new(tmp.path());
    let prompt = loader.get_system_prompt(Some("any"), ReasoningLevel::Medium, None);
    assert!(prompt.contains("AI 어시스턴트"));
    assert!(prompt.contains("적절한 수준의 설명"));
  }

  #[test]
  fn mtime_cache_reloads_after_edit() {
    let tmp = tempdir().unwrap();
    write(tmp.path(), "default.md", "버전1 {reasoning_instruction}");
    let loader = PromptLoader::new(tmp.path());
    assert!(loader
      .get_system_prompt(Some("c"), ReasoningLevel::Medium, None)
      .starts_with("버전1"));

    // Rewrite with a strictly newer mtime.
    std::thread::sleep(std::time::Duration::from_millis(1100));
    write(tmp.path(), "default.md", "버전2 {reasoning_instruction}");
    assert!(loader
      .get_system_prompt(Some("c"), ReasoningLevel::Medium, None)
      .starts_with("버전2"));
  }

  #[test]
  fn exaone_medium_instruction_is_empty() {
    assert_eq!(
      reasoning_instruction(ReasoningLevel::Medium, ModelFamily::Exaone),
      ""
    );
    assert_eq!(
      reasoning_instruction(ReasoningLevel::Low, ModelFamily::GptOss),
      "Reasoning: low"
    );
  }

  #[test]
  fn reload_clears_caches() {
    let tmp = tempdir().unwrap();
    write(tmp.path(), "default.md", "내용");
    let loader = PromptLoader::new(tmp.path());
    let _ = loader.get_system_prompt(Some("c"), ReasoningLevel::Medium, None);
    loader.reload();
    assert!(loader.file_cache.lock().unwrap().is_empty());
  }
}
