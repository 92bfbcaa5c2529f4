//! Shard compression and retention sweeps.
//!
//! Shards older than the compression window become `.jsonl.gz` (gzip level
//! 6); shards older than the retention window are deleted. Emergency dumps
//! are never compressed. File age comes from the date in the filename, not
//! filesystem mtime.

use std::fs::File;
use std::io::{self, BufRead, BufReader, Read, Write};
use std::path::Path;

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use tracing::{error, info};

use docchat_core::{kst, logpath};

/// Gzips every `.jsonl` shard dated at or before `today - days`. Returns
/// the number of files compressed.
pub fn compress_older_than(dir: &Path, days: i64) -> usize {
  let cutoff = kst::today() - chrono::Duration::days(days);
  let mut compressed = 0usize;

  for path in logpath::iter_all_files(dir) {
    let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
      continue;
    };
    if !name.ends_with(".jsonl") || logpath::is_emergency_file(&path) {
      continue;
    }
    let Some(file_date) = logpath::parse_date_from_filename(name) else {
      continue;
    };
    if file_date > cutoff {
      continue;
    }

    match compress_file(&path) {
      Ok(()) => {
        compressed += 1;
        info!("compressed shard: {}", path.display());
      }
      Err(e) => error!("failed to compress {}: {e}", path.display()),
    }
  }
  compressed
}

fn compress_file(path: &Path) -> io::Result<()> {
  let gz_path = path.with_extension("jsonl.gz");
  let mut input = File::open(path)?;
  let output = File::create(&gz_path)?;
  let mut encoder = GzEncoder::new(output, Compression::new(6));
  io::copy(&mut input, &mut encoder)?;
  encoder.finish()?.sync_all().ok();
  std::fs::remove_file(path)
}

/// Deletes every shard (plain or gzipped, emergency included) dated before
/// `today - days`. Returns the number of files deleted.
pub fn delete_older_than(dir: &Path, days: i64) -> usize {
  let cutoff = kst::today() - chrono::Duration::days(days);
  let mut deleted = 0usize;

  for path in logpath::iter_all_files(dir) {
    let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
      continue;
    };
    let Some(file_date) = logpath::parse_date_from_filename(name) else {
      continue;
    };
    if file_date >= cutoff {
      continue;
    }
    match std::fs::remove_file(&path) {
      Ok(()) => {
        deleted += 1;
        info!("deleted expired shard: {}", path.display());
      }
      Err(e) => error!("failed to delete {}: {e}", path.display()),
    }
  }
  deleted
}

/// Reads all lines from a shard, transparently gunzipping `.gz` files.
pub fn read_lines(path: &Path) -> io::Result<Vec<String>> {
  let file = File::open(path)?;
  let reader: Box<dyn Read> = if path.extension().is_some_and(|e| e == "gz") {
    Box::new(GzDecoder::new(file))
  } else {
    Box::new(file)
  };
  BufReader::new(reader)
    .lines()
    .collect::<Result<Vec<_>, _>>()
}

/// Appends one line to a plain text file (tests and tooling).
pub fn append_line(path: &Path, line: &str) -> io::Result<()> {
  let mut file = std::fs::OpenOptions::new().append(true).create(true).open(path)?;
  writeln!(file, "{line}")
}

#[cfg(test)]
mod tests {
  use super::*;
  use chrono::Duration;
  use tempfile::tempdir;

  fn shard_for(dir: &Path, date: chrono::NaiveDate, lines: &[&str]) -> std::path::PathBuf {
    let subdir = logpath::ensure_date_directory(dir, date).unwrap();
    let path = subdir.join(format!("{}.jsonl", kst::format_date(date)));
    std::fs::write(&path, lines.join("\n") + "\n").unwrap();
    path
  }

  #[test]
  fn compresses_old_shards_and_roundtrips_content() {
    let tmp = tempdir().unwrap();
    let old_date = kst::today() - Duration::days(10);
    let path = shard_for(tmp.path(), old_date, &[r#"{"a":1}"#, r#"{"b":2}"#]);

    let compressed = compress_older_than(tmp.path(), 7);
    assert_eq!(compressed, 1);
    assert!(!path.exists());

    let gz_path = path.with_extension("jsonl.gz");
    assert!(gz_path.exists());
    let lines = read_lines(&gz_path).unwrap();
    assert_eq!(lines, vec![r#"{"a":1}"#, r#"{"b":2}"#]);
  }

  #[test]
  fn recent_shards_stay_uncompressed() {
    let tmp = tempdir().unwrap();
    let path = shard_for(tmp.path(), kst::today(), &[r#"{"a":1}"#]);
    assert_eq!(compress_older_than(tmp.path(), 7), 0);
    assert!(path.exists());
  }

  #[test]
  fn emergency_files_never_compress() {
    let tmp = tempdir().unwrap();
    let path = tmp.path().join("emergency_20200101_010101.jsonl");
    std::fs::write(&path, "{}\n").unwrap();
    assert_eq!(compress_older_than(tmp.path(), 7), 0);
    assert!(path.exists());
    // But retention still deletes them.
    assert_eq!(delete_older_than(tmp.path(), 30), 1);
  }

  #[test]
  fn deletes_expired_shards_only() {
    let tmp = tempdir().unwrap();
    let old = shard_for(tmp.path(), kst::today() - Duration::days(40), &["{}"]);
    let fresh = shard_for(tmp.path(), kst::today() - Duration::days(5), &["{}"]);
    assert_eq!(delete_older_than(tmp.path(), 30), 1);
    assert!(!old.exists());
    assert!(fresh.exists());
  }
}
