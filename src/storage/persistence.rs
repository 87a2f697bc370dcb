//! PersistenceStore — durable CSV files consumed downstream
//!
//! Four files share one schema, `Label,<channel names>`:
//! - **Raw log**: one row per accepted frame of the active phase. Truncated
//!   when a phase starts, flushed after every row.
//! - **Mean record**: exactly one data row, the latest finalized mean.
//!   Replaced atomically (temp file, fsync, rename, directory fsync) before
//!   `write_mean` returns, since the classifier reads it immediately.
//! - **Mean log**: append-only history of finalized means, fsynced per row.
//! - **Trial log**: finalized means keyed by `Baseline` / `Trial <n>`. A
//!   re-run replaces the rows for its own key and leaves every other line
//!   byte-identical.
//!
//! The store itself holds no open handles. Raw rows go through a
//! [`RawLogWriter`] owned by the acquisition worker; the other files are only
//! written from the controller task, so each logical file has one writer.

use std::fs::{self, File, OpenOptions};
use std::io::{self, BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::acquisition::FrameParser;
use crate::types::{ChannelSet, SensorFrame};

/// Persistence errors
#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("I/O error on {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("{} has header {found:?}, expected {expected:?}", .path.display())]
    SchemaMismatch {
        path: PathBuf,
        expected: String,
        found: String,
    },

    #[error("{} line {line}: {message}", .path.display())]
    Corrupt {
        path: PathBuf,
        line: usize,
        message: String,
    },
}

fn io_error(path: &Path) -> impl FnOnce(io::Error) -> PersistenceError + '_ {
    move |source| PersistenceError::Io {
        path: path.to_path_buf(),
        source,
    }
}

// ============================================================================
// Rows & Paths
// ============================================================================

/// One persisted row: a label followed by N channel values.
#[derive(Debug, Clone, PartialEq)]
pub struct PersistedRow {
    pub label: String,
    pub values: Vec<f64>,
}

impl PersistedRow {
    pub fn new(label: impl Into<String>, values: Vec<f64>) -> Self {
        Self {
            label: label.into(),
            values,
        }
    }

    pub fn to_csv(&self) -> String {
        let mut line = self.label.clone();
        for v in &self.values {
            line.push(',');
            line.push_str(&v.to_string());
        }
        line
    }
}

/// Locations of every file the store writes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoragePaths {
    pub data_dir: PathBuf,
    pub raw_log: PathBuf,
    pub mean_record: PathBuf,
    pub mean_log: PathBuf,
    pub trial_log: PathBuf,
}

impl StoragePaths {
    /// Standard file names under `data_dir`.
    pub fn in_dir(data_dir: impl Into<PathBuf>) -> Self {
        use crate::config::defaults::{
            DEFAULT_MEAN_LOG_FILE, DEFAULT_MEAN_RECORD_FILE, DEFAULT_RAW_LOG_FILE,
            DEFAULT_TRIAL_LOG_FILE,
        };
        let data_dir = data_dir.into();
        Self {
            raw_log: data_dir.join(DEFAULT_RAW_LOG_FILE),
            mean_record: data_dir.join(DEFAULT_MEAN_RECORD_FILE),
            mean_log: data_dir.join(DEFAULT_MEAN_LOG_FILE),
            trial_log: data_dir.join(DEFAULT_TRIAL_LOG_FILE),
            data_dir,
        }
    }
}

// ============================================================================
// Persistence Store
// ============================================================================

/// Trial log rewrite built ahead of the commit.
struct TrialUpdate {
    contents: String,
    replaced: usize,
}

pub struct PersistenceStore {
    paths: StoragePaths,
    channels: ChannelSet,
    header: String,
}

impl PersistenceStore {
    /// Create the store, making sure the data directory exists.
    pub fn open(paths: StoragePaths, channels: ChannelSet) -> Result<Self, PersistenceError> {
        fs::create_dir_all(&paths.data_dir).map_err(io_error(&paths.data_dir))?;
        let header = channels.csv_header();
        Ok(Self {
            paths,
            channels,
            header,
        })
    }

    pub fn paths(&self) -> &StoragePaths {
        &self.paths
    }

    pub fn header(&self) -> &str {
        &self.header
    }

    /// Truncate the raw log, write its header and hand out the writer.
    pub fn begin_raw(&self, label: &str) -> Result<RawLogWriter, PersistenceError> {
        let path = self.paths.raw_log.clone();
        let file = File::create(&path).map_err(io_error(&path))?;
        let mut writer = RawLogWriter {
            file: BufWriter::new(file),
            path,
            label: label.to_string(),
            rows: 0,
        };
        writer.write_line(&self.header)?;
        debug!(path = %writer.path.display(), label = %label, "Raw log started");
        Ok(writer)
    }

    /// Replace the latest-mean record. Durable on return.
    pub fn write_mean(&self, row: &PersistedRow) -> Result<(), PersistenceError> {
        let contents = format!("{}\n{}\n", self.header, row.to_csv());
        write_atomic(&self.paths.mean_record, contents.as_bytes())?;
        info!(
            path = %self.paths.mean_record.display(),
            label = %row.label,
            "Mean record written"
        );
        Ok(())
    }

    /// Read back the latest-mean record, if one exists.
    pub fn read_mean(&self) -> Result<Option<PersistedRow>, PersistenceError> {
        let path = &self.paths.mean_record;
        if !path.exists() {
            return Ok(None);
        }
        let rows = self.read_rows(path)?;
        Ok(rows.into_iter().next().map(|(_, row)| row))
    }

    /// Append a finalized mean to the mean log. Durable on return.
    pub fn append_mean_log(&self, row: &PersistedRow) -> Result<(), PersistenceError> {
        let path = &self.paths.mean_log;
        let needs_header = match fs::metadata(path) {
            Ok(meta) => meta.len() == 0,
            Err(e) if e.kind() == io::ErrorKind::NotFound => true,
            Err(e) => return Err(io_error(path)(e)),
        };
        if !needs_header {
            self.check_header(path)?;
        }

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(io_error(path))?;
        let mut contents = String::new();
        if needs_header {
            contents.push_str(&self.header);
            contents.push('\n');
        }
        contents.push_str(&row.to_csv());
        contents.push('\n');
        file.write_all(contents.as_bytes()).map_err(io_error(path))?;
        file.sync_all().map_err(io_error(path))?;
        Ok(())
    }

    /// Insert or replace the rows for `row.label` in the trial log.
    ///
    /// Lines belonging to other labels are carried over verbatim.
    pub fn upsert_trial(&self, row: &PersistedRow) -> Result<(), PersistenceError> {
        let update = self.prepare_trial(row)?;
        self.apply_trial(row, update)
    }

    /// Persist a finalized phase mean: mean record, trial log (when
    /// `trial_keyed`), then the mean log.
    ///
    /// Every existing file is checked against the channel header and the
    /// trial log rewrite is built before anything is written, so a schema
    /// mismatch leaves all three files untouched.
    pub fn commit_mean(&self, row: &PersistedRow, trial_keyed: bool) -> Result<(), PersistenceError> {
        self.check_existing_header(&self.paths.mean_log)?;
        let trial = if trial_keyed {
            Some(self.prepare_trial(row)?)
        } else {
            None
        };

        self.write_mean(row)?;
        if let Some(update) = trial {
            self.apply_trial(row, update)?;
        }
        self.append_mean_log(row)
    }

    /// New trial log contents with `row` replacing any rows of its label.
    fn prepare_trial(&self, row: &PersistedRow) -> Result<TrialUpdate, PersistenceError> {
        let path = &self.paths.trial_log;
        let mut contents = String::new();
        let mut replaced = 0usize;

        match fs::read_to_string(path) {
            Ok(existing) if !existing.trim().is_empty() => {
                let mut lines = existing.lines();
                let header = lines.next().unwrap_or_default();
                if header.trim() != self.header {
                    return Err(PersistenceError::SchemaMismatch {
                        path: path.clone(),
                        expected: self.header.clone(),
                        found: header.to_string(),
                    });
                }
                contents.push_str(header);
                contents.push('\n');
                for line in lines {
                    if line.split(',').next() == Some(row.label.as_str()) {
                        replaced += 1;
                        continue;
                    }
                    contents.push_str(line);
                    contents.push('\n');
                }
            }
            Ok(_) => {
                contents.push_str(&self.header);
                contents.push('\n');
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                contents.push_str(&self.header);
                contents.push('\n');
            }
            Err(e) => return Err(io_error(path)(e)),
        }

        contents.push_str(&row.to_csv());
        contents.push('\n');
        Ok(TrialUpdate { contents, replaced })
    }

    fn apply_trial(&self, row: &PersistedRow, update: TrialUpdate) -> Result<(), PersistenceError> {
        write_atomic(&self.paths.trial_log, update.contents.as_bytes())?;
        if update.replaced > 0 {
            info!(label = %row.label, replaced = update.replaced, "Trial log entry replaced");
        } else {
            info!(label = %row.label, "Trial log entry added");
        }
        Ok(())
    }

    /// All rows of the trial log, in file order.
    pub fn read_trials(&self) -> Result<Vec<PersistedRow>, PersistenceError> {
        let path = &self.paths.trial_log;
        if !path.exists() {
            return Ok(Vec::new());
        }
        Ok(self.read_rows(path)?.into_iter().map(|(_, row)| row).collect())
    }

    /// Re-parse the flushed raw log into frames.
    ///
    /// Used to recover the mean when the acquisition worker misses its join
    /// window. Undecodable rows are skipped with a warning.
    pub fn read_raw_frames(&self) -> Result<Vec<SensorFrame>, PersistenceError> {
        let path = &self.paths.raw_log;
        // Rows are always comma-separated, whatever the wire delimiter
        let parser = FrameParser::new(self.channels.clone(), ',');
        let file = File::open(path).map_err(io_error(path))?;
        let mut frames = Vec::new();

        for (idx, line) in BufReader::new(file).lines().enumerate() {
            let line = line.map_err(io_error(path))?;
            if idx == 0 {
                continue;
            }
            // Drop the label column, parse the rest as a frame
            let Some((_, values)) = line.split_once(',') else {
                continue;
            };
            match parser.parse(values) {
                Ok(frame) => frames.push(frame),
                Err(e) => warn!(line = idx + 1, error = %e, "Skipping undecodable raw log row"),
            }
        }
        Ok(frames)
    }

    /// Like `check_header`, but a missing or empty file passes.
    fn check_existing_header(&self, path: &Path) -> Result<(), PersistenceError> {
        match fs::metadata(path) {
            Ok(meta) if meta.len() > 0 => self.check_header(path),
            Ok(_) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(io_error(path)(e)),
        }
    }

    fn check_header(&self, path: &Path) -> Result<(), PersistenceError> {
        let file = File::open(path).map_err(io_error(path))?;
        let mut first = String::new();
        BufReader::new(file)
            .read_line(&mut first)
            .map_err(io_error(path))?;
        if first.trim() != self.header {
            return Err(PersistenceError::SchemaMismatch {
                path: path.to_path_buf(),
                expected: self.header.clone(),
                found: first.trim().to_string(),
            });
        }
        Ok(())
    }

    /// Parse a `Label,<values>` file, returning `(line_number, row)` pairs.
    fn read_rows(&self, path: &Path) -> Result<Vec<(usize, PersistedRow)>, PersistenceError> {
        let contents = fs::read_to_string(path).map_err(io_error(path))?;
        let mut lines = contents.lines();
        let header = lines.next().unwrap_or_default();
        if header.trim() != self.header {
            return Err(PersistenceError::SchemaMismatch {
                path: path.to_path_buf(),
                expected: self.header.clone(),
                found: header.to_string(),
            });
        }

        let mut rows = Vec::new();
        for (idx, line) in lines.enumerate() {
            let line_no = idx + 2;
            if line.trim().is_empty() {
                continue;
            }
            let mut fields = line.split(',');
            let label = fields.next().unwrap_or_default().to_string();
            let values = fields
                .map(|f| f.trim().parse::<f64>())
                .collect::<Result<Vec<_>, _>>()
                .map_err(|e| PersistenceError::Corrupt {
                    path: path.to_path_buf(),
                    line: line_no,
                    message: e.to_string(),
                })?;
            if values.len() != self.channels.len() {
                return Err(PersistenceError::Corrupt {
                    path: path.to_path_buf(),
                    line: line_no,
                    message: format!(
                        "expected {} values, found {}",
                        self.channels.len(),
                        values.len()
                    ),
                });
            }
            rows.push((line_no, PersistedRow { label, values }));
        }
        Ok(rows)
    }
}

// ============================================================================
// Raw Log Writer
// ============================================================================

/// Append-only writer for the active phase's raw log.
///
/// Every row is flushed to the OS before `write_raw` returns, so a crash
/// loses at most the row being written.
pub struct RawLogWriter {
    file: BufWriter<File>,
    path: PathBuf,
    label: String,
    rows: u64,
}

impl RawLogWriter {
    /// Append one frame under the phase label.
    pub fn write_raw(&mut self, frame: &SensorFrame) -> Result<(), PersistenceError> {
        let row = PersistedRow::new(self.label.clone(), frame.values().to_vec());
        self.write_line(&row.to_csv())?;
        self.rows += 1;
        Ok(())
    }

    /// Rows written so far (header excluded).
    pub fn rows(&self) -> u64 {
        self.rows
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn write_line(&mut self, line: &str) -> Result<(), PersistenceError> {
        writeln!(self.file, "{line}").map_err(io_error(&self.path))?;
        self.file.flush().map_err(io_error(&self.path))
    }

    /// Flush and fsync. Called when the phase stops.
    pub fn finish(mut self) -> Result<u64, PersistenceError> {
        self.file.flush().map_err(io_error(&self.path))?;
        self.file.get_ref().sync_all().map_err(io_error(&self.path))?;
        Ok(self.rows)
    }
}

// ============================================================================
// Atomic Replace
// ============================================================================

/// Write `contents` to `path` via a synced temp file and rename.
///
/// Readers see either the old file or the complete new one.
fn write_atomic(path: &Path, contents: &[u8]) -> Result<(), PersistenceError> {
    let tmp_path = path.with_extension("csv.tmp");
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(io_error(parent))?;
    }

    let mut tmp = File::create(&tmp_path).map_err(io_error(&tmp_path))?;
    tmp.write_all(contents).map_err(io_error(&tmp_path))?;
    tmp.sync_all().map_err(io_error(&tmp_path))?;
    drop(tmp);

    fs::rename(&tmp_path, path).map_err(io_error(path))?;
    sync_parent_dir(path)
}

#[cfg(unix)]
fn sync_parent_dir(path: &Path) -> Result<(), PersistenceError> {
    match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => File::open(dir)
            .and_then(|d| d.sync_all())
            .map_err(io_error(dir)),
        _ => Ok(()),
    }
}

#[cfg(not(unix))]
fn sync_parent_dir(_path: &Path) -> Result<(), PersistenceError> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn store(dir: &Path) -> PersistenceStore {
        PersistenceStore::open(StoragePaths::in_dir(dir), ChannelSet::new(["A", "B"])).unwrap()
    }

    fn frame(values: &[f64]) -> SensorFrame {
        SensorFrame::from_values(values.to_vec())
    }

    #[test]
    fn test_raw_log_rows_in_order() {
        let dir = tempdir().unwrap();
        let store = store(dir.path());

        let mut raw = store.begin_raw("Unknown").unwrap();
        raw.write_raw(&frame(&[1.0, 2.0])).unwrap();
        raw.write_raw(&frame(&[3.5, 4.0])).unwrap();
        assert_eq!(raw.rows(), 2);

        // Flushed per row: readable before finish()
        let contents = fs::read_to_string(&store.paths().raw_log).unwrap();
        assert_eq!(contents, "Label,A,B\nUnknown,1,2\nUnknown,3.5,4\n");
        assert_eq!(raw.finish().unwrap(), 2);
    }

    #[test]
    fn test_begin_raw_truncates_previous_phase() {
        let dir = tempdir().unwrap();
        let store = store(dir.path());

        let mut raw = store.begin_raw("Trial 1").unwrap();
        raw.write_raw(&frame(&[1.0, 1.0])).unwrap();
        drop(raw);

        let raw = store.begin_raw("Trial 2").unwrap();
        drop(raw);
        let contents = fs::read_to_string(&store.paths().raw_log).unwrap();
        assert_eq!(contents, "Label,A,B\n");
    }

    #[test]
    fn test_write_mean_replaces_record() {
        let dir = tempdir().unwrap();
        let store = store(dir.path());
        assert!(store.read_mean().unwrap().is_none());

        store.write_mean(&PersistedRow::new("Trial 1", vec![1.0, 2.0])).unwrap();
        store.write_mean(&PersistedRow::new("Unknown", vec![3.0, 4.0])).unwrap();

        let contents = fs::read_to_string(&store.paths().mean_record).unwrap();
        assert_eq!(contents, "Label,A,B\nUnknown,3,4\n");
        assert_eq!(
            store.read_mean().unwrap(),
            Some(PersistedRow::new("Unknown", vec![3.0, 4.0]))
        );
        // No temp file left behind
        assert!(!store.paths().mean_record.with_extension("csv.tmp").exists());
    }

    #[test]
    fn test_mean_log_appends() {
        let dir = tempdir().unwrap();
        let store = store(dir.path());

        store.append_mean_log(&PersistedRow::new("Unknown", vec![1.0, 2.0])).unwrap();
        store.append_mean_log(&PersistedRow::new("Trial 3", vec![5.0, 6.0])).unwrap();

        let contents = fs::read_to_string(&store.paths().mean_log).unwrap();
        assert_eq!(contents, "Label,A,B\nUnknown,1,2\nTrial 3,5,6\n");
    }

    #[test]
    fn test_upsert_trial_replaces_only_own_key() {
        let dir = tempdir().unwrap();
        let store = store(dir.path());

        store.upsert_trial(&PersistedRow::new("Trial 1", vec![1.25, 2.0])).unwrap();
        store.upsert_trial(&PersistedRow::new("Trial 2", vec![3.0, 4.0])).unwrap();
        let before = fs::read_to_string(&store.paths().trial_log).unwrap();
        let trial1_line = before.lines().nth(1).unwrap().to_string();

        store.upsert_trial(&PersistedRow::new("Trial 2", vec![9.0, 9.5])).unwrap();

        let after = fs::read_to_string(&store.paths().trial_log).unwrap();
        assert_eq!(after.lines().nth(1).unwrap(), trial1_line);
        assert_eq!(after.matches("Trial 2").count(), 1);

        let rows = store.read_trials().unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[1], PersistedRow::new("Trial 2", vec![9.0, 9.5]));
    }

    #[test]
    fn test_upsert_trial_does_not_confuse_prefixes() {
        let dir = tempdir().unwrap();
        let store = store(dir.path());

        store.upsert_trial(&PersistedRow::new("Trial 1", vec![1.0, 1.0])).unwrap();
        store.upsert_trial(&PersistedRow::new("Trial 12", vec![2.0, 2.0])).unwrap();
        store.upsert_trial(&PersistedRow::new("Trial 1", vec![3.0, 3.0])).unwrap();

        let labels: Vec<String> = store.read_trials().unwrap().into_iter().map(|r| r.label).collect();
        assert_eq!(labels, vec!["Trial 12", "Trial 1"]);
    }

    #[test]
    fn test_schema_mismatch_detected() {
        let dir = tempdir().unwrap();
        let store = store(dir.path());
        fs::write(&store.paths().trial_log, "Label,X,Y,Z\nTrial 1,1,2,3\n").unwrap();

        let err = store
            .upsert_trial(&PersistedRow::new("Trial 2", vec![1.0, 2.0]))
            .unwrap_err();
        assert!(matches!(err, PersistenceError::SchemaMismatch { .. }));
        // Untouched on failure
        let contents = fs::read_to_string(&store.paths().trial_log).unwrap();
        assert_eq!(contents, "Label,X,Y,Z\nTrial 1,1,2,3\n");
    }

    #[test]
    fn test_commit_mean_writes_all_three_files() {
        let dir = tempdir().unwrap();
        let store = store(dir.path());

        store
            .commit_mean(&PersistedRow::new("Trial 3", vec![1.0, 2.0]), true)
            .unwrap();
        store
            .commit_mean(&PersistedRow::new("Unknown", vec![5.0, 6.0]), false)
            .unwrap();

        let record = fs::read_to_string(&store.paths().mean_record).unwrap();
        assert_eq!(record, "Label,A,B\nUnknown,5,6\n");
        let log = fs::read_to_string(&store.paths().mean_log).unwrap();
        assert_eq!(log, "Label,A,B\nTrial 3,1,2\nUnknown,5,6\n");
        let trials = fs::read_to_string(&store.paths().trial_log).unwrap();
        assert_eq!(trials, "Label,A,B\nTrial 3,1,2\n");
    }

    #[test]
    fn test_commit_mean_leaves_files_untouched_on_trial_schema_mismatch() {
        let dir = tempdir().unwrap();
        let store = store(dir.path());
        store
            .commit_mean(&PersistedRow::new("Unknown", vec![0.5, 0.5]), false)
            .unwrap();
        let record_before = fs::read_to_string(&store.paths().mean_record).unwrap();
        let log_before = fs::read_to_string(&store.paths().mean_log).unwrap();
        fs::write(&store.paths().trial_log, "Label,X,Y,Z\n").unwrap();

        for _ in 0..2 {
            let err = store
                .commit_mean(&PersistedRow::new("Trial 2", vec![1.0, 2.0]), true)
                .unwrap_err();
            assert!(matches!(err, PersistenceError::SchemaMismatch { .. }));
        }

        assert_eq!(fs::read_to_string(&store.paths().mean_record).unwrap(), record_before);
        assert_eq!(fs::read_to_string(&store.paths().mean_log).unwrap(), log_before);
    }

    #[test]
    fn test_commit_mean_checks_mean_log_header_first() {
        let dir = tempdir().unwrap();
        let store = store(dir.path());
        fs::write(&store.paths().mean_log, "Label,X\nold,1\n").unwrap();

        let err = store
            .commit_mean(&PersistedRow::new("Trial 1", vec![1.0, 2.0]), true)
            .unwrap_err();
        assert!(matches!(err, PersistenceError::SchemaMismatch { .. }));
        assert!(!store.paths().mean_record.exists());
        assert!(!store.paths().trial_log.exists());
    }

    #[test]
    fn test_read_raw_frames_recovers_flushed_rows() {
        let dir = tempdir().unwrap();
        let store = store(dir.path());
        let mut raw = store.begin_raw("Unknown").unwrap();
        raw.write_raw(&frame(&[1.0, 2.0])).unwrap();
        raw.write_raw(&frame(&[3.0, 4.0])).unwrap();

        let frames = store.read_raw_frames().unwrap();
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[1].values(), &[3.0, 4.0]);
    }
}
