//! Log-shard path scheme.
//!
//! Shards live under a `yyyy/mm` hierarchy (`logs/data/2025/12/2025-12-27.jsonl`);
//! lookups fall back to the legacy flat layout and probe the `.gz` variant.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use chrono::NaiveDate;

pub fn date_directory(base_dir: &Path, date: NaiveDate) -> PathBuf {
  base_dir
    .join(date.format("%Y").to_string())
    .join(date.format("%m").to_string())
}

pub fn ensure_date_directory(base_dir: &Path, date: NaiveDate) -> io::Result<PathBuf> {
  let dir = date_directory(base_dir, date);
  fs::create_dir_all(&dir)?;
  Ok(dir)
}

/// Canonical (hierarchy) path for a date, regardless of existence.
pub fn file_path_for_date(base_dir: &Path, date: NaiveDate, prefix: &str) -> PathBuf {
  date_directory(base_dir, date).join(format!("{prefix}{}.jsonl", date.format("%Y-%m-%d")))
}

fn find_file(base_dir: &Path, filename: &str, date: NaiveDate) -> Option<PathBuf> {
  let hierarchy = date_directory(base_dir, date).join(filename);
  if hierarchy.exists() {
    return Some(hierarchy);
  }
  let flat = base_dir.join(filename);
  if flat.exists() {
    return Some(flat);
  }
  None
}

/// Finds the shard for a date: hierarchy first, then flat, then the same
/// chain with `.gz` appended.
pub fn find_file_for_date(base_dir: &Path, date: NaiveDate, prefix: &str) -> Option<PathBuf> {
  let filename = format!("{prefix}{}.jsonl", date.format("%Y-%m-%d"));
  if let Some(found) = find_file(base_dir, &filename, date) {
    return Some(found);
  }
  find_file(base_dir, &format!("{filename}.gz"), date)
}

/// All shard files under a base dir, flat and hierarchical.
pub fn iter_all_files(base_dir: &Path) -> Vec<PathBuf> {
  let mut files = Vec::new();
  collect_files(base_dir, 0, &mut files);
  files.sort();
  files
}

fn collect_files(dir: &Path, depth: usize, out: &mut Vec<PathBuf>) {
  let Ok(entries) = fs::read_dir(dir) else {
    return;
  };
  for entry in entries.flatten() {
    let path = entry.path();
    if path.is_dir() {
      // yyyy/mm only, two levels deep
      if depth < 2 {
        collect_files(&path, depth + 1, out);
      }
    } else if path
      .file_name()
      .and_then(|n| n.to_str())
      .is_some_and(|n| n.contains(".jsonl"))
    {
      out.push(path);
    }
  }
}

/// Parses the date out of a shard filename.
///
/// Handles `2025-12-27.jsonl`, `overflow_2025-12-27.jsonl`,
/// `2025-12-27.jsonl.gz` and `emergency_20251227_153000.jsonl`.
pub fn parse_date_from_filename(filename: &str) -> Option<NaiveDate> {
  let mut name = filename;
  for ext in [".jsonl.gz", ".jsonl", ".gz"] {
    if let Some(stripped) = name.strip_suffix(ext) {
      name = stripped;
      break;
    }
  }
  for prefix in ["overflow_", "emergency_"] {
    if let Some(stripped) = name.strip_prefix(prefix) {
      name = stripped;
      break;
    }
  }

  if name.len() == 10 && name.matches('-').count() == 2 {
    return NaiveDate::parse_from_str(name, "%Y-%m-%d").ok();
  }
  // YYYYMMDD_HHMMSS emergency stamps
  if let Some((date_part, _)) = name.split_once('_') {
    if date_part.len() == 8 && date_part.chars().all(|c| c.is_ascii_digit()) {
      return NaiveDate::parse_from_str(date_part, "%Y%m%d").ok();
    }
  }
  None
}

pub fn is_emergency_file(path: &Path) -> bool {
  path
    .file_name()
    .and_then(|n| n.to_str())
    .is_some_and(|n| n.starts_with("emergency_"))
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::fs::File;
  use tempfile::tempdir;

  fn date(y: i32, m: u32, d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(y, m, d).unwrap()
  }

  #[test]
  fn hierarchy_path_shape() {
    let path = file_path_for_date(Path::new("logs/data"), date(2025, 3, 7), "");
    assert_eq!(path, PathBuf::from("logs/data/2025/03/2025-03-07.jsonl"));
  }

  #[test]
  fn lookup_prefers_hierarchy_then_flat_then_gz() {
    let tmp = tempdir().unwrap();
    let base = tmp.path();
    let d = date(2025, 3, 7);

    assert!(find_file_for_date(base, d, "").is_none());

    File::create(base.join("2025-03-07.jsonl")).unwrap();
    let found = find_file_for_date(base, d, "").unwrap();
    assert_eq!(found, base.join("2025-03-07.jsonl"));

    let dir = ensure_date_directory(base, d).unwrap();
    File::create(dir.join("2025-03-07.jsonl")).unwrap();
    let found = find_file_for_date(base, d, "").unwrap();
    assert_eq!(found, dir.join("2025-03-07.jsonl"));
  }

  #[test]
  fn lookup_falls_back_to_gz() {
    let tmp = tempdir().unwrap();
    let d = date(2025, 3, 8);
    let dir = ensure_date_directory(tmp.path(), d).unwrap();
    File::create(dir.join("2025-03-08.jsonl.gz")).unwrap();
    let found = find_file_for_date(tmp.path(), d, "").unwrap();
    assert!(found.to_string_lossy().ends_with(".jsonl.gz"));
  }

  #[test]
  fn filename_date_parsing() {
    assert_eq!(
      parse_date_from_filename("2025-12-27.jsonl"),
      Some(date(2025, 12, 27))
    );
    assert_eq!(
      parse_date_from_filename("overflow_2025-12-27.jsonl"),
      Some(date(2025, 12, 27))
    );
    assert_eq!(
      parse_date_from_filename("2025-12-27.jsonl.gz"),
      Some(date(2025, 12, 27))
    );
    assert_eq!(
      parse_date_from_filename("emergency_20251227_153000.jsonl"),
      Some(date(2025, 12, 27))
    );
    assert_eq!(parse_date_from_filename("notes.txt"), None);
  }

  #[test]
  fn iter_finds_flat_and_nested() {
    let tmp = tempdir().unwrap();
    File::create(tmp.path().join("2025-01-01.jsonl")).unwrap();
    let dir = ensure_date_directory(tmp.path(), date(2025, 2, 2)).unwrap();
    File::create(dir.join("2025-02-02.jsonl")).unwrap();
    let files = iter_all_files(tmp.path());
    assert_eq!(files.len(), 2);
  }
}
