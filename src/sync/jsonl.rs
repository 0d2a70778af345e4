//! JSONL reading, hashing and atomic writing
//!
//! One JSON object per line, stable-sorted by issue ID, trailing newline
//! after every record, file mode 0600. All writes go through a sibling temp
//! file and an atomic rename so readers only ever observe a complete file.

use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::Path;

use anyhow::{Context, Result};

use crate::domain::{Issue, IssueId};

/// A parsed JSONL line; malformed lines carry their error instead of
/// aborting the whole file
#[derive(Debug)]
pub enum ParsedLine {
    Record(Box<Issue>),
    Malformed { line_no: usize, error: String },
}

/// Reads every non-empty line of a JSONL file
///
/// The reader is line-buffered with no length cap, so multi-megabyte records
/// (large descriptions, long comment threads) parse fine.
pub fn read_lines(path: &Path) -> Result<Vec<ParsedLine>> {
    let file = File::open(path)
        .with_context(|| format!("Failed to open JSONL: {}", path.display()))?;
    let mut reader = BufReader::new(file);

    let mut out = Vec::new();
    let mut buf = String::new();
    let mut line_no = 0;

    loop {
        buf.clear();
        let read = reader
            .read_line(&mut buf)
            .with_context(|| format!("Failed to read line {} of {}", line_no + 1, path.display()))?;
        if read == 0 {
            break;
        }
        line_no += 1;

        let line = buf.trim();
        if line.is_empty() {
            continue;
        }

        match serde_json::from_str::<Issue>(line) {
            Ok(issue) => out.push(ParsedLine::Record(Box::new(issue))),
            Err(e) => out.push(ParsedLine::Malformed {
                line_no,
                error: e.to_string(),
            }),
        }
    }

    Ok(out)
}

/// Reads a JSONL file into an ID-keyed map, silently dropping malformed lines
///
/// Merge inputs go through this; diagnostics for bad lines belong to the
/// import path, which uses [`read_lines`] directly.
pub fn read_records(path: &Path) -> Result<BTreeMap<IssueId, Issue>> {
    let mut map = BTreeMap::new();
    for parsed in read_lines(path)? {
        if let ParsedLine::Record(issue) = parsed {
            map.insert(issue.id.clone(), *issue);
        }
    }
    Ok(map)
}

/// Counts records without fully deserializing them
pub fn count_records(path: &Path) -> Result<usize> {
    if !path.exists() {
        return Ok(0);
    }
    let file = File::open(path)
        .with_context(|| format!("Failed to open JSONL: {}", path.display()))?;
    let mut reader = BufReader::new(file);

    let mut count = 0;
    let mut buf = String::new();
    loop {
        buf.clear();
        if reader.read_line(&mut buf)? == 0 {
            break;
        }
        if !buf.trim().is_empty() {
            count += 1;
        }
    }
    Ok(count)
}

/// Hash of the normalized record lines (trimmed, joined by newlines)
///
/// Insensitive to trailing whitespace and blank lines, so `touch` or an
/// editor saving an extra newline does not read as a content change.
pub fn content_hash(path: &Path) -> Result<String> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("Failed to read JSONL: {}", path.display()))?;

    let mut hasher = blake3::Hasher::new();
    for line in raw.lines() {
        let line = line.trim();
        if !line.is_empty() {
            hasher.update(line.as_bytes());
            hasher.update(b"\n");
        }
    }
    Ok(hasher.finalize().to_hex().to_string())
}

/// Hash of the raw file bytes
pub fn file_hash(path: &Path) -> Result<String> {
    let bytes = fs::read(path)
        .with_context(|| format!("Failed to read JSONL: {}", path.display()))?;
    Ok(blake3::hash(&bytes).to_hex().to_string())
}

/// Serializes one record the way the export file stores it
pub fn record_line(issue: &Issue) -> Result<String> {
    serde_json::to_string(issue).context("Failed to serialize issue")
}

/// Writes pre-serialized lines through a temp file and atomic rename
///
/// Lines must already be in their final order; a trailing newline is added
/// after each. The file ends up with mode 0600.
pub fn write_lines_atomic(path: &Path, lines: &[String]) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
    }

    let temp_path = path.with_extension("jsonl.tmp");

    {
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&temp_path)
            .with_context(|| format!("Failed to create temp file: {}", temp_path.display()))?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let perms = fs::Permissions::from_mode(0o600);
            file.set_permissions(perms)
                .context("Failed to set JSONL permissions")?;
        }

        let mut writer = BufWriter::new(&file);
        for line in lines {
            writeln!(writer, "{}", line).context("Failed to write record")?;
        }
        writer.flush().context("Failed to flush JSONL")?;
        file.sync_all().context("Failed to sync JSONL")?;
    }

    fs::rename(&temp_path, path).with_context(|| {
        format!(
            "Failed to rename {} to {}",
            temp_path.display(),
            path.display()
        )
    })?;

    Ok(())
}

/// Writes raw pre-formatted content through the same temp-file + rename path
pub fn write_raw_atomic(path: &Path, content: &str) -> Result<()> {
    let lines: Vec<String> = content
        .lines()
        .filter(|l| !l.trim().is_empty())
        .map(|l| l.to_string())
        .collect();
    write_lines_atomic(path, &lines)
}

/// Serializes and writes issues sorted by ID
pub fn write_issues_atomic(path: &Path, issues: &[Issue]) -> Result<()> {
    let mut sorted: Vec<&Issue> = issues.iter().collect();
    sorted.sort_by(|a, b| a.id.cmp(&b.id));

    let lines = sorted
        .iter()
        .map(|issue| record_line(issue))
        .collect::<Result<Vec<_>>>()?;
    write_lines_atomic(path, &lines)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn make_issue(id: &str, title: &str) -> Issue {
        Issue::new(id.parse().unwrap(), title)
    }

    #[test]
    fn write_and_read_roundtrip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("issues.jsonl");

        let issues = vec![make_issue("br-bbb", "two"), make_issue("br-aaa", "one")];
        write_issues_atomic(&path, &issues).unwrap();

        let records = read_records(&path).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records.get(&"br-aaa".parse().unwrap()).unwrap().title, "one");
    }

    #[test]
    fn output_is_sorted_by_id() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("issues.jsonl");

        write_issues_atomic(
            &path,
            &[
                make_issue("br-ccc", "c"),
                make_issue("br-aaa", "a"),
                make_issue("br-bbb", "b"),
            ],
        )
        .unwrap();

        let raw = fs::read_to_string(&path).unwrap();
        let ids: Vec<String> = raw
            .lines()
            .map(|l| {
                let v: serde_json::Value = serde_json::from_str(l).unwrap();
                v["id"].as_str().unwrap().to_string()
            })
            .collect();
        assert_eq!(ids, vec!["br-aaa", "br-bbb", "br-ccc"]);
    }

    #[test]
    fn every_record_ends_with_newline() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("issues.jsonl");
        write_issues_atomic(&path, &[make_issue("br-aaa", "a")]).unwrap();

        let raw = fs::read_to_string(&path).unwrap();
        assert!(raw.ends_with('\n'));
        assert_eq!(raw.lines().count(), 1);
    }

    #[test]
    fn no_temp_file_left_behind() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("issues.jsonl");
        write_issues_atomic(&path, &[make_issue("br-aaa", "a")]).unwrap();

        assert!(!path.with_extension("jsonl.tmp").exists());
    }

    #[cfg(unix)]
    #[test]
    fn file_mode_is_0600() {
        use std::os::unix::fs::PermissionsExt;

        let dir = TempDir::new().unwrap();
        let path = dir.path().join("issues.jsonl");
        write_issues_atomic(&path, &[make_issue("br-aaa", "a")]).unwrap();

        let mode = fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[test]
    fn malformed_lines_are_reported_not_fatal() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("issues.jsonl");

        let good = record_line(&make_issue("br-aaa", "good")).unwrap();
        fs::write(&path, format!("{}\nnot json at all\n\n{}\n", good, good)).unwrap();

        let lines = read_lines(&path).unwrap();
        assert_eq!(lines.len(), 3);
        assert!(matches!(lines[0], ParsedLine::Record(_)));
        assert!(matches!(
            lines[1],
            ParsedLine::Malformed { line_no: 2, .. }
        ));
    }

    #[test]
    fn count_skips_blank_lines() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("issues.jsonl");

        let line = record_line(&make_issue("br-aaa", "a")).unwrap();
        fs::write(&path, format!("{}\n\n{}\n", line, line)).unwrap();

        assert_eq!(count_records(&path).unwrap(), 2);
        assert_eq!(count_records(&dir.path().join("missing.jsonl")).unwrap(), 0);
    }

    #[test]
    fn large_lines_parse() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("issues.jsonl");

        let mut issue = make_issue("br-big", "big");
        issue.description = "x".repeat(2 * 1024 * 1024 + 17);
        write_issues_atomic(&path, &[issue.clone()]).unwrap();

        let records = read_records(&path).unwrap();
        assert_eq!(
            records.get(&issue.id).unwrap().description.len(),
            issue.description.len()
        );
    }

    #[test]
    fn content_hash_ignores_trailing_blank_lines() {
        let dir = TempDir::new().unwrap();
        let path_a = dir.path().join("a.jsonl");
        let path_b = dir.path().join("b.jsonl");

        let line = record_line(&make_issue("br-aaa", "a")).unwrap();
        fs::write(&path_a, format!("{}\n", line)).unwrap();
        fs::write(&path_b, format!("{}\n\n\n", line)).unwrap();

        assert_eq!(content_hash(&path_a).unwrap(), content_hash(&path_b).unwrap());
        // The raw file hash does see the difference
        assert_ne!(file_hash(&path_a).unwrap(), file_hash(&path_b).unwrap());
    }

    #[test]
    fn content_hash_tracks_record_changes() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("issues.jsonl");

        write_issues_atomic(&path, &[make_issue("br-aaa", "one")]).unwrap();
        let h1 = content_hash(&path).unwrap();

        write_issues_atomic(&path, &[make_issue("br-aaa", "two")]).unwrap();
        let h2 = content_hash(&path).unwrap();

        assert_ne!(h1, h2);
    }
}
