//! CSV file storage implementation
//!
//! One `<table>.csv` file per logical table under `storage.csv-path`.
//! Writes flush every `chunk-size-write` rows; files larger than
//! `large-file-threshold-bytes` are streamed in `chunk-size-read` batches and
//! never held in memory whole. Rewrites (column widening, overwrite merges)
//! go through a sibling temporary file and an atomic rename.

use crate::config::{StorageConfig, StorageType, TextEncoding};
use crate::storage::schema::quote_identifier;
use crate::storage::traits::{RecordStore, StorageError, StorageResult};
use crate::storage::{
    coerce_cell, collect_columns, render_cell, AppendOutcome, DuplicatePolicy, Record, RowFilter,
    TableInfo, UniqueKey,
};
use chrono::{DateTime, Local, Utc};
use csv::{ReaderBuilder, StringRecord, WriterBuilder};
use std::collections::{HashMap, HashSet};
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

const UTF8_BOM: &[u8] = b"\xEF\xBB\xBF";

/// CSV file storage backend
pub struct CsvStore {
    root: PathBuf,
    backup_root: PathBuf,
    encoding: TextEncoding,
    chunk_size_write: usize,
    chunk_size_read: usize,
    large_file_threshold: u64,
    policy: DuplicatePolicy,
    /// One lock per table file; appends to different tables run in parallel
    table_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl CsvStore {
    pub fn new(config: &StorageConfig) -> StorageResult<Self> {
        let root = PathBuf::from(&config.csv_path);
        fs::create_dir_all(&root)?;

        Ok(Self {
            root,
            backup_root: PathBuf::from(&config.backup_path),
            encoding: config.encoding,
            chunk_size_write: config.chunk_size_write.max(1),
            chunk_size_read: config.chunk_size_read.max(1),
            large_file_threshold: config.large_file_threshold_bytes,
            policy: config.duplicate_policy,
            table_locks: Mutex::new(HashMap::new()),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn table_path(&self, table: &str) -> StorageResult<PathBuf> {
        quote_identifier(table)?;
        Ok(self.root.join(format!("{}.csv", table)))
    }

    fn table_lock(&self, table: &str) -> Arc<Mutex<()>> {
        let mut locks = self
            .table_locks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        locks
            .entry(table.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Visits the rows of `path` in batches
    ///
    /// Small files are decoded in one pass; files above the size threshold
    /// are streamed `chunk_size_read` rows at a time. Returns the header row,
    /// or `None` when the file is absent or has no header.
    fn scan<F>(&self, path: &Path, mut visit: F) -> StorageResult<Option<Vec<String>>>
    where
        F: FnMut(&[String], &[StringRecord]) -> StorageResult<()>,
    {
        if !path.exists() {
            return Ok(None);
        }

        let size = fs::metadata(path)?.len();
        if size > self.large_file_threshold {
            tracing::debug!(path = %path.display(), size, "Streaming large file");
            let mut reader = BufReader::new(File::open(path)?);
            skip_bom(&mut reader)?;
            let mut csv_reader = ReaderBuilder::new().flexible(true).from_reader(reader);
            let headers = header_names(csv_reader.headers()?);
            if headers.is_empty() {
                return Ok(None);
            }

            let mut chunk = Vec::with_capacity(self.chunk_size_read.min(65_536));
            for row in csv_reader.records() {
                chunk.push(row?);
                if chunk.len() >= self.chunk_size_read {
                    visit(&headers, &chunk)?;
                    chunk.clear();
                }
            }
            if !chunk.is_empty() {
                visit(&headers, &chunk)?;
            }
            return Ok(Some(headers));
        }

        let bytes = fs::read(path)?;
        let data = bytes.strip_prefix(UTF8_BOM).unwrap_or(&bytes);
        let mut csv_reader = ReaderBuilder::new().flexible(true).from_reader(data);
        let headers = header_names(csv_reader.headers()?);
        if headers.is_empty() {
            return Ok(None);
        }
        let rows = csv_reader
            .records()
            .collect::<Result<Vec<_>, _>>()?;
        if !rows.is_empty() {
            visit(&headers, &rows)?;
        }
        Ok(Some(headers))
    }

    fn read_headers(&self, path: &Path) -> StorageResult<Option<Vec<String>>> {
        if !path.exists() {
            return Ok(None);
        }
        let mut reader = BufReader::new(File::open(path)?);
        skip_bom(&mut reader)?;
        let mut csv_reader = ReaderBuilder::new().flexible(true).from_reader(reader);
        let headers = header_names(csv_reader.headers()?);
        Ok(if headers.is_empty() { None } else { Some(headers) })
    }

    /// Returns which of `wanted` already have a row in the file
    fn existing_keys(
        &self,
        path: &Path,
        key: &UniqueKey,
        wanted: &HashSet<Vec<String>>,
    ) -> StorageResult<HashSet<Vec<String>>> {
        let mut found = HashSet::new();
        self.scan(path, |headers, rows| {
            let Some(indices) = key_indices(headers, key) else {
                return Ok(());
            };
            for row in rows {
                let value = row_key(row, &indices);
                if wanted.contains(&value) {
                    found.insert(value);
                }
            }
            Ok(())
        })?;
        Ok(found)
    }

    fn open_writer(&self, path: &Path, headers: &[String]) -> StorageResult<ChunkedWriter> {
        let is_new = !path.exists() || fs::metadata(path)?.len() == 0;
        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(path)?;
        if is_new && self.encoding == TextEncoding::Utf8Bom {
            file.write_all(UTF8_BOM)?;
        }
        if !is_new && !ends_with_newline(&mut file)? {
            // Left behind by an interrupted append
            tracing::warn!(path = %path.display(), "Terminating unfinished last row");
            file.write_all(b"\n")?;
        }

        let mut writer = WriterBuilder::new().has_headers(false).from_writer(file);
        if is_new {
            writer.write_record(headers)?;
        }

        Ok(ChunkedWriter {
            writer,
            headers: headers.to_vec(),
            pending: 0,
            chunk_size: self.chunk_size_write,
        })
    }

    /// Rewrites the file with `headers` (a superset of the current header),
    /// substituting rows whose key appears in `replacements`
    ///
    /// Returns the number of stored rows replaced.
    fn rewrite(
        &self,
        path: &Path,
        headers: &[String],
        key: Option<&UniqueKey>,
        replacements: &HashMap<Vec<String>, &Record>,
    ) -> StorageResult<usize> {
        let tmp_path = path.with_extension("csv.tmp");
        if tmp_path.exists() {
            fs::remove_file(&tmp_path)?;
        }

        let mut out = self.open_writer(&tmp_path, headers)?;
        let mut replaced = HashSet::new();

        self.scan(path, |old_headers, rows| {
            let positions: Vec<Option<usize>> = headers
                .iter()
                .map(|h| old_headers.iter().position(|o| o == h))
                .collect();
            let indices = key.and_then(|k| key_indices(old_headers, k));

            for row in rows {
                if let Some(indices) = &indices {
                    let value = row_key(row, indices);
                    if let Some(record) = replacements.get(&value) {
                        if replaced.insert(value) {
                            out.write_record(record)?;
                        }
                        continue;
                    }
                }
                out.write_fields(
                    positions
                        .iter()
                        .map(|p| p.and_then(|i| row.get(i)).unwrap_or("")),
                )?;
            }
            Ok(())
        })?;

        out.finish()?;
        fs::rename(&tmp_path, path)?;
        Ok(replaced.len())
    }

    /// Appends rows, widening the header first if they carry new columns
    fn append_rows(&self, path: &Path, records: &[&Record]) -> StorageResult<usize> {
        if records.is_empty() {
            return Ok(0);
        }

        let incoming = collect_columns(records.iter().copied());
        let headers = match self.read_headers(path)? {
            None => incoming,
            Some(existing) => {
                let mut merged = existing.clone();
                for column in incoming {
                    if !merged.contains(&column) {
                        merged.push(column);
                    }
                }
                if merged.len() > existing.len() {
                    tracing::debug!(
                        path = %path.display(),
                        added = merged.len() - existing.len(),
                        "Widening CSV header"
                    );
                    self.rewrite(path, &merged, None, &HashMap::new())?;
                }
                merged
            }
        };

        let mut writer = self.open_writer(path, &headers)?;
        for record in records {
            writer.write_record(record)?;
        }
        writer.finish()?;
        Ok(records.len())
    }
}

/// Buffered CSV writer that flushes every `chunk_size` rows
struct ChunkedWriter {
    writer: csv::Writer<File>,
    headers: Vec<String>,
    pending: usize,
    chunk_size: usize,
}

impl ChunkedWriter {
    fn write_record(&mut self, record: &Record) -> StorageResult<()> {
        let fields: Vec<String> = self
            .headers
            .iter()
            .map(|h| record.get(h).map(render_cell).unwrap_or_default())
            .collect();
        self.write_fields(fields.iter().map(String::as_str))
    }

    fn write_fields<'a>(&mut self, fields: impl Iterator<Item = &'a str>) -> StorageResult<()> {
        self.writer.write_record(fields)?;
        self.pending += 1;
        if self.pending >= self.chunk_size {
            self.writer.flush()?;
            self.pending = 0;
        }
        Ok(())
    }

    fn finish(mut self) -> StorageResult<()> {
        self.writer.flush()?;
        Ok(())
    }
}

fn ends_with_newline(file: &mut File) -> StorageResult<bool> {
    let mut last = [0u8; 1];
    file.seek(SeekFrom::End(-1))?;
    file.read_exact(&mut last)?;
    Ok(last[0] == b'\n')
}

fn skip_bom<R: BufRead>(reader: &mut R) -> StorageResult<()> {
    if reader.fill_buf()?.starts_with(UTF8_BOM) {
        reader.consume(UTF8_BOM.len());
    }
    Ok(())
}

fn header_names(record: &StringRecord) -> Vec<String> {
    let headers: Vec<String> = record.iter().map(|h| h.trim().to_string()).collect();
    if headers.iter().all(String::is_empty) {
        Vec::new()
    } else {
        headers
    }
}

fn key_indices(headers: &[String], key: &UniqueKey) -> Option<Vec<usize>> {
    key.columns()
        .iter()
        .map(|c| headers.iter().position(|h| h == c))
        .collect()
}

fn row_key(row: &StringRecord, indices: &[usize]) -> Vec<String> {
    indices
        .iter()
        .map(|&i| row.get(i).unwrap_or("").to_string())
        .collect()
}

fn to_record(headers: &[String], row: &StringRecord) -> Record {
    headers
        .iter()
        .enumerate()
        .map(|(i, h)| (h.clone(), coerce_cell(row.get(i).unwrap_or(""))))
        .collect()
}

impl RecordStore for CsvStore {
    fn kind(&self) -> StorageType {
        StorageType::File
    }

    fn save(&self, records: &[Record], table: &str) -> StorageResult<usize> {
        let path = self.table_path(table)?;
        let lock = self.table_lock(table);
        let _guard = lock.lock().unwrap_or_else(|poisoned| poisoned.into_inner());

        let refs: Vec<&Record> = records.iter().collect();
        let saved = self.append_rows(&path, &refs)?;
        tracing::debug!(table, rows = saved, "Saved rows");
        Ok(saved)
    }

    fn append_deduplicated(
        &self,
        records: &[Record],
        table: &str,
        key: &UniqueKey,
    ) -> StorageResult<AppendOutcome> {
        let mut outcome = AppendOutcome::default();
        if records.is_empty() {
            return Ok(outcome);
        }

        // Resolve duplicates inside the batch first: skip keeps the first
        // occurrence, overwrite keeps the last but at the first position.
        let mut order: Vec<Vec<String>> = Vec::new();
        let mut batch: HashMap<Vec<String>, &Record> = HashMap::new();
        for record in records {
            let value = key.render(table, record)?;
            if batch.contains_key(&value) {
                outcome.skipped_duplicates += 1;
                if self.policy == DuplicatePolicy::Overwrite {
                    batch.insert(value, record);
                }
            } else {
                order.push(value.clone());
                batch.insert(value, record);
            }
        }
        if self.policy == DuplicatePolicy::Overwrite {
            // Later in-batch occurrences replace, they are not skipped
            outcome.replaced += outcome.skipped_duplicates;
            outcome.skipped_duplicates = 0;
        }

        let path = self.table_path(table)?;
        let lock = self.table_lock(table);
        let _guard = lock.lock().unwrap_or_else(|poisoned| poisoned.into_inner());

        let wanted: HashSet<Vec<String>> = batch.keys().cloned().collect();
        let existing = self.existing_keys(&path, key, &wanted)?;

        let fresh: Vec<&Record> = order
            .iter()
            .filter(|k| !existing.contains(*k))
            .filter_map(|k| batch.get(k).copied())
            .collect();

        match self.policy {
            DuplicatePolicy::Skip => {
                outcome.skipped_duplicates += existing.len();
            }
            DuplicatePolicy::Overwrite if !existing.is_empty() => {
                let replacements: HashMap<Vec<String>, &Record> = existing
                    .iter()
                    .filter_map(|k| batch.get(k).map(|r| (k.clone(), *r)))
                    .collect();

                let mut headers = self.read_headers(&path)?.unwrap_or_default();
                for column in collect_columns(replacements.values().copied()) {
                    if !headers.contains(&column) {
                        headers.push(column);
                    }
                }
                outcome.replaced += self.rewrite(&path, &headers, Some(key), &replacements)?;
            }
            DuplicatePolicy::Overwrite => {}
        }

        outcome.inserted = self.append_rows(&path, &fresh)?;

        tracing::debug!(
            table,
            inserted = outcome.inserted,
            skipped = outcome.skipped_duplicates,
            replaced = outcome.replaced,
            "Merged batch"
        );
        Ok(outcome)
    }

    fn read(&self, table: &str, filter: &RowFilter) -> StorageResult<Vec<Record>> {
        let path = self.table_path(table)?;
        let mut rows = Vec::new();
        self.scan(&path, |headers, chunk| {
            rows.extend(
                chunk
                    .iter()
                    .map(|row| to_record(headers, row))
                    .filter(|record| filter.matches(record)),
            );
            Ok(())
        })?;
        Ok(rows)
    }

    fn exists(&self, table: &str) -> StorageResult<bool> {
        Ok(self.table_path(table)?.exists())
    }

    fn describe(&self, table: &str) -> StorageResult<TableInfo> {
        let path = self.table_path(table)?;
        let mut rows = 0u64;
        self.scan(&path, |_, chunk| {
            rows += chunk.len() as u64;
            Ok(())
        })?;

        let metadata = fs::metadata(&path).ok();
        Ok(TableInfo {
            table: table.to_string(),
            exists: metadata.is_some(),
            rows,
            size_bytes: metadata.as_ref().map(|m| m.len()).unwrap_or(0),
            location: path.display().to_string(),
            modified: metadata
                .and_then(|m| m.modified().ok())
                .map(DateTime::<Utc>::from),
        })
    }

    fn backup(&self, table: &str) -> StorageResult<PathBuf> {
        let path = self.table_path(table)?;
        let lock = self.table_lock(table);
        let _guard = lock.lock().unwrap_or_else(|poisoned| poisoned.into_inner());

        if !path.exists() {
            return Err(StorageError::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("no file for table {}", table),
            )));
        }

        fs::create_dir_all(&self.backup_root)?;
        let stamp = Local::now().format("%Y%m%d_%H%M%S");
        let target = self.backup_root.join(format!("{}_{}.csv", table, stamp));
        fs::copy(&path, &target)?;
        tracing::info!(table, backup = %target.display(), "Backed up table");
        Ok(target)
    }
}
