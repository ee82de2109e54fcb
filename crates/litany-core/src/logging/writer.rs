//! Per-instance JSONL files.
//!
//! Each process appends to `logs/raw/<date>_<instance>.jsonl` and nothing
//! else, so concurrent processes never contend for a file.

use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use parking_lot::Mutex;

use super::entry::{JsonLogEntry, LogInstance};

/// Appends log entries to one instance's JSONL file
pub struct InstanceLogWriter {
    instance: String,
    writer: Mutex<BufWriter<File>>,
    path: PathBuf,
}

impl InstanceLogWriter {
    /// Open (or create) today's file for `instance` under `logs_dir/raw`.
    pub fn new(logs_dir: impl AsRef<Path>, instance: LogInstance) -> std::io::Result<Self> {
        let instance = instance.to_string();
        let raw_dir = logs_dir.as_ref().join("raw");
        fs::create_dir_all(&raw_dir)?;

        let date = chrono::Local::now().format("%Y-%m-%d");
        let path = raw_dir.join(format!("{}_{}.jsonl", date, instance));

        let file = OpenOptions::new().create(true).append(true).open(&path)?;

        Ok(Self {
            instance,
            writer: Mutex::new(BufWriter::new(file)),
            path,
        })
    }

    pub fn instance(&self) -> &str {
        &self.instance
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one entry and flush it.
    pub fn write(&self, entry: &JsonLogEntry) -> std::io::Result<()> {
        let json = entry
            .to_json_line()
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;

        let mut writer = self.writer.lock();
        writeln!(writer, "{}", json)?;
        writer.flush()
    }

    pub fn flush(&self) -> std::io::Result<()> {
        self.writer.lock().flush()
    }
}

impl Drop for InstanceLogWriter {
    fn drop(&mut self) {
        let _ = self.flush();
    }
}

/// Read every instance file under `logs_dir/raw`, merged by timestamp.
///
/// Lines that fail to parse are skipped.
pub fn read_all_entries(logs_dir: impl AsRef<Path>) -> std::io::Result<Vec<JsonLogEntry>> {
    read_matching(logs_dir.as_ref(), |_| true)
}

/// Read the entries of one instance, across all dates.
pub fn read_instance_entries(
    logs_dir: impl AsRef<Path>,
    instance: LogInstance,
) -> std::io::Result<Vec<JsonLogEntry>> {
    let suffix = format!("_{}.jsonl", instance);
    read_matching(logs_dir.as_ref(), |name| name.ends_with(&suffix))
}

fn read_matching(logs_dir: &Path, accept: impl Fn(&str) -> bool) -> std::io::Result<Vec<JsonLogEntry>> {
    let raw_dir = logs_dir.join("raw");
    if !raw_dir.exists() {
        return Ok(Vec::new());
    }

    let mut entries = Vec::new();

    for dir_entry in fs::read_dir(&raw_dir)? {
        let path = dir_entry?.path();
        let Some(name) = path.file_name().and_then(|f| f.to_str()) else {
            continue;
        };
        if !name.ends_with(".jsonl") || !accept(name) {
            continue;
        }

        let content = fs::read_to_string(&path)?;
        entries.extend(
            content
                .lines()
                .map(str::trim)
                .filter(|line| !line.is_empty())
                .filter_map(|line| JsonLogEntry::from_json_line(line).ok()),
        );
    }

    entries.sort_by(|a, b| a.ts.cmp(&b.ts));
    Ok(entries)
}
