use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};
use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Instant;

use competitive_analysis_core::{
    format_rfc3339, now_utc, AnalysisRecord, AnalysisTable, FieldValue, FormKind,
    FormSubmission, LedgerError, RecordId, UpsertOutcome, RECORD_ID_COLUMN,
};
use serde::Serialize;
use tracing::{debug, info, warn};
use ulid::Ulid;

pub const DEFAULT_BUCKET: &str = "Scooter";
pub const DEFAULT_KEY: &str = "competitiveanalyses.csv";

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum StoreError {
    #[error("object not found: {bucket}/{key}")]
    NotFound { bucket: String, key: String },
    #[error("backend unavailable: {0}")]
    Unavailable(String),
    #[error("corrupt dataset: {0}")]
    Corrupt(String),
}

/// Minimal object-storage surface: whole-object reads and writes.
///
/// `put` must replace the object atomically, so a failed write leaves the
/// previous object readable.
pub trait BlobStore {
    fn backend_tag(&self) -> &'static str;

    /// # Errors
    /// Returns [`StoreError::NotFound`] when the object is absent and
    /// [`StoreError::Unavailable`] when the backend cannot be read.
    fn get(&self, bucket: &str, key: &str) -> Result<Vec<u8>, StoreError>;

    /// # Errors
    /// Returns [`StoreError::Unavailable`] when the object cannot be written.
    fn put(&self, bucket: &str, key: &str, bytes: &[u8]) -> Result<(), StoreError>;
}

/// Buckets are directories under `root`, keys are files inside them.
#[derive(Debug, Clone)]
pub struct LocalFsBlobStore {
    root: PathBuf,
}

impl LocalFsBlobStore {
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn object_path(&self, bucket: &str, key: &str) -> Result<PathBuf, StoreError> {
        validate_path_segment("bucket", bucket)?;
        validate_path_segment("key", key)?;
        Ok(self.root.join(bucket).join(key))
    }
}

fn validate_path_segment(label: &str, value: &str) -> Result<(), StoreError> {
    if value.is_empty()
        || value == "."
        || value == ".."
        || value.contains(['/', '\\'])
        || value.contains('\0')
    {
        return Err(StoreError::Unavailable(format!(
            "invalid {label} name {value:?}"
        )));
    }
    Ok(())
}

impl BlobStore for LocalFsBlobStore {
    fn backend_tag(&self) -> &'static str {
        "local_fs"
    }

    fn get(&self, bucket: &str, key: &str) -> Result<Vec<u8>, StoreError> {
        let path = self.object_path(bucket, key)?;
        fs::read(&path).map_err(|err| match err.kind() {
            ErrorKind::NotFound => StoreError::NotFound {
                bucket: bucket.to_string(),
                key: key.to_string(),
            },
            _ => StoreError::Unavailable(format!("failed to read {}: {err}", path.display())),
        })
    }

    fn put(&self, bucket: &str, key: &str, bytes: &[u8]) -> Result<(), StoreError> {
        let path = self.object_path(bucket, key)?;
        let dir = self.root.join(bucket);
        fs::create_dir_all(&dir).map_err(|err| {
            StoreError::Unavailable(format!("failed to create {}: {err}", dir.display()))
        })?;

        let tmp = dir.join(format!(".{key}.{}.tmp", Ulid::new()));
        if let Err(err) = write_and_sync(&tmp, bytes) {
            let _ = fs::remove_file(&tmp);
            return Err(err);
        }
        fs::rename(&tmp, &path).map_err(|err| {
            let _ = fs::remove_file(&tmp);
            StoreError::Unavailable(format!("failed to replace {}: {err}", path.display()))
        })
    }
}

fn write_and_sync(path: &Path, bytes: &[u8]) -> Result<(), StoreError> {
    let io_err =
        |err: std::io::Error| StoreError::Unavailable(format!("failed to write {}: {err}", path.display()));
    let mut file = OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)
        .map_err(io_err)?;
    file.write_all(bytes).map_err(io_err)?;
    file.sync_all().map_err(io_err)
}

/// Process-local backend with switchable failures.
#[derive(Debug, Default)]
pub struct InMemoryBlobStore {
    objects: Mutex<BTreeMap<(String, String), Vec<u8>>>,
    fail_reads: AtomicBool,
    fail_writes: AtomicBool,
}

impl InMemoryBlobStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_object(self, bucket: &str, key: &str, bytes: impl Into<Vec<u8>>) -> Self {
        if let Ok(mut objects) = self.objects.lock() {
            objects.insert((bucket.to_string(), key.to_string()), bytes.into());
        }
        self
    }

    #[must_use]
    pub fn object(&self, bucket: &str, key: &str) -> Option<Vec<u8>> {
        self.objects
            .lock()
            .ok()
            .and_then(|objects| objects.get(&(bucket.to_string(), key.to_string())).cloned())
    }

    pub fn set_fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }
}

impl BlobStore for InMemoryBlobStore {
    fn backend_tag(&self) -> &'static str {
        "in_memory"
    }

    fn get(&self, bucket: &str, key: &str) -> Result<Vec<u8>, StoreError> {
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("simulated read failure".to_string()));
        }
        let objects = self
            .objects
            .lock()
            .map_err(|_| StoreError::Unavailable("in-memory store lock poisoned".to_string()))?;
        objects
            .get(&(bucket.to_string(), key.to_string()))
            .cloned()
            .ok_or_else(|| StoreError::NotFound {
                bucket: bucket.to_string(),
                key: key.to_string(),
            })
    }

    fn put(&self, bucket: &str, key: &str, bytes: &[u8]) -> Result<(), StoreError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("simulated write failure".to_string()));
        }
        let mut objects = self
            .objects
            .lock()
            .map_err(|_| StoreError::Unavailable("in-memory store lock poisoned".to_string()))?;
        objects.insert((bucket.to_string(), key.to_string()), bytes.to_vec());
        Ok(())
    }
}

/// Serializes the whole table as CSV: header row in column order, one line
/// per record, null cells empty.
///
/// # Errors
/// Returns [`StoreError::Corrupt`] when the CSV writer rejects a row.
pub fn encode_table(table: &AnalysisTable) -> Result<Vec<u8>, StoreError> {
    let mut writer = csv::WriterBuilder::new()
        .terminator(csv::Terminator::Any(b'\n'))
        .from_writer(Vec::new());

    writer
        .write_record(table.columns())
        .map_err(|err| StoreError::Corrupt(format!("failed to encode header: {err}")))?;
    for record in table.records() {
        writer
            .write_record(
                table
                    .columns()
                    .iter()
                    .map(|column| AnalysisTable::cell(record, column)),
            )
            .map_err(|err| {
                StoreError::Corrupt(format!(
                    "failed to encode record {}: {err}",
                    record.record_id
                ))
            })?;
    }

    writer
        .into_inner()
        .map_err(|err| StoreError::Corrupt(format!("failed to flush encoded dataset: {err}")))
}

/// Parses a CSV dataset back into a table.
///
/// A header without `Record ID` is treated as a legacy dataset and rows are
/// numbered `1..=n` in file order.
///
/// # Errors
/// Returns [`StoreError::Corrupt`] for unreadable CSV, ragged rows, duplicate
/// headers, and blank, zero, non-integer, or repeated record ids.
pub fn decode_table(bytes: &[u8]) -> Result<AnalysisTable, StoreError> {
    if bytes.iter().all(u8::is_ascii_whitespace) {
        return Ok(AnalysisTable::empty());
    }

    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .flexible(false)
        .from_reader(bytes);
    let headers = reader
        .headers()
        .map_err(|err| StoreError::Corrupt(format!("unreadable header: {err}")))?
        .iter()
        .map(str::to_string)
        .collect::<Vec<_>>();

    let id_index = headers.iter().position(|column| column == RECORD_ID_COLUMN);
    if id_index.is_none() {
        warn!(
            columns = headers.len(),
            "dataset has no {RECORD_ID_COLUMN:?} column; numbering rows in file order"
        );
    }

    let mut records = Vec::new();
    for (row_index, row) in reader.records().enumerate() {
        let line = row_index + 1;
        let row = row.map_err(|err| StoreError::Corrupt(format!("row {line}: {err}")))?;

        let record_id = match id_index {
            Some(index) => row
                .get(index)
                .unwrap_or_default()
                .parse::<RecordId>()
                .map_err(|err| StoreError::Corrupt(format!("row {line}: {err}")))?,
            None => RecordId(
                u64::try_from(line)
                    .map_err(|err| StoreError::Corrupt(format!("row {line}: {err}")))?,
            ),
        };

        let mut record = AnalysisRecord::new(record_id);
        for (column, raw) in headers.iter().zip(row.iter()) {
            if column == RECORD_ID_COLUMN {
                continue;
            }
            if let Some(value) = FieldValue::infer(raw) {
                record.fields.insert(column.clone(), value);
            }
        }
        records.push(record);
    }

    AnalysisTable::from_parts(headers, records).map_err(|err| StoreError::Corrupt(err.to_string()))
}

#[derive(Debug, Clone, Serialize, Eq, PartialEq)]
pub struct ObjectLocation {
    pub bucket: String,
    pub key: String,
}

impl ObjectLocation {
    #[must_use]
    pub fn new(bucket: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            key: key.into(),
        }
    }
}

impl Default for ObjectLocation {
    fn default() -> Self {
        Self::new(DEFAULT_BUCKET, DEFAULT_KEY)
    }
}

impl Display for ObjectLocation {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.bucket, self.key)
    }
}

#[derive(Debug, Clone, Serialize, Eq, PartialEq)]
pub struct SaveReceipt {
    pub bucket: String,
    pub key: String,
    pub bytes: usize,
    pub rows: usize,
    pub columns: usize,
    pub saved_at: String,
}

/// Loads and saves the dataset as a single object.
pub struct RecordStore<B> {
    backend: B,
    location: ObjectLocation,
}

impl<B: BlobStore> RecordStore<B> {
    pub fn new(backend: B, location: ObjectLocation) -> Self {
        Self { backend, location }
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn location(&self) -> &ObjectLocation {
        &self.location
    }

    /// Reads the dataset; an absent object is an empty table.
    ///
    /// # Errors
    /// Propagates backend failures other than [`StoreError::NotFound`] and
    /// returns [`StoreError::Corrupt`] when the object does not decode.
    pub fn load(&self) -> Result<AnalysisTable, StoreError> {
        let started = Instant::now();
        match self.backend.get(&self.location.bucket, &self.location.key) {
            Ok(bytes) => {
                let table = decode_table(&bytes)?;
                debug!(
                    backend = self.backend.backend_tag(),
                    location = %self.location,
                    bytes = bytes.len(),
                    rows = table.len(),
                    columns = table.columns().len(),
                    elapsed_ms = started.elapsed().as_millis(),
                    "loaded dataset"
                );
                Ok(table)
            }
            Err(StoreError::NotFound { .. }) => {
                debug!(
                    backend = self.backend.backend_tag(),
                    location = %self.location,
                    "dataset object absent; starting from an empty table"
                );
                Ok(AnalysisTable::empty())
            }
            Err(err) => Err(err),
        }
    }

    /// Writes the whole table over the stored object.
    ///
    /// # Errors
    /// Returns [`StoreError::Unavailable`] when the backend rejects the write;
    /// the previously stored object is left in place.
    pub fn save(&self, table: &AnalysisTable) -> Result<SaveReceipt, StoreError> {
        let started = Instant::now();
        let bytes = encode_table(table)?;
        let saved_at =
            format_rfc3339(now_utc()).map_err(|err| StoreError::Unavailable(err.to_string()))?;

        self.backend
            .put(&self.location.bucket, &self.location.key, &bytes)?;
        debug!(
            backend = self.backend.backend_tag(),
            location = %self.location,
            bytes = bytes.len(),
            rows = table.len(),
            elapsed_ms = started.elapsed().as_millis(),
            "saved dataset"
        );

        Ok(SaveReceipt {
            bucket: self.location.bucket.clone(),
            key: self.location.key.clone(),
            bytes: bytes.len(),
            rows: table.len(),
            columns: table.columns().len(),
            saved_at,
        })
    }
}

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum SubmissionError {
    #[error(transparent)]
    Ledger(#[from] LedgerError),
    #[error("storage unavailable: {0}")]
    StorageUnavailable(#[from] StoreError),
}

#[derive(Debug, Clone, Serialize, Eq, PartialEq)]
pub struct SubmissionReceipt {
    pub form: FormKind,
    pub outcome: UpsertOutcome,
    pub save: SaveReceipt,
}

/// Per-user state: the store plus the last table this session loaded or
/// wrote. The caller decides when to reuse the cached table and when to
/// reload it.
///
/// Writers are not coordinated. Two sessions submitting against the same
/// object race and the later save wins for the whole table.
pub struct AnalysisSession<B> {
    store: RecordStore<B>,
    cached: Option<AnalysisTable>,
}

impl<B: BlobStore> AnalysisSession<B> {
    pub fn new(store: RecordStore<B>) -> Self {
        Self {
            store,
            cached: None,
        }
    }

    pub fn store(&self) -> &RecordStore<B> {
        &self.store
    }

    pub fn cached(&self) -> Option<&AnalysisTable> {
        self.cached.as_ref()
    }

    /// Returns the cached table, loading it on first use.
    ///
    /// # Errors
    /// Propagates [`RecordStore::load`] failures.
    pub fn table(&mut self) -> Result<&AnalysisTable, StoreError> {
        let table = match self.cached.take() {
            Some(table) => table,
            None => self.store.load()?,
        };
        Ok(&*self.cached.insert(table))
    }

    /// Replaces the cached table with a fresh load. On failure the previous
    /// cache is kept.
    ///
    /// # Errors
    /// Propagates [`RecordStore::load`] failures.
    pub fn reload(&mut self) -> Result<&AnalysisTable, StoreError> {
        let table = self.store.load()?;
        Ok(&*self.cached.insert(table))
    }

    /// One load-validate-merge-save cycle.
    ///
    /// Validation runs before any storage access. The merged table only
    /// replaces the cache after the save succeeds.
    ///
    /// # Errors
    /// Returns [`SubmissionError::Ledger`] for validation, percentage-sum, and
    /// unknown-record failures, and [`SubmissionError::StorageUnavailable`]
    /// when the load or save fails.
    pub fn submit(
        &mut self,
        submission: &FormSubmission,
    ) -> Result<SubmissionReceipt, SubmissionError> {
        submission.validate()?;

        let mut table = self.store.load()?;
        let outcome = table.apply(
            submission.record_id,
            &submission.fields,
            submission.form.allows_create(),
        )?;

        let save = match self.store.save(&table) {
            Ok(receipt) => receipt,
            Err(err) => {
                warn!(
                    form = %submission.form,
                    record_id = %outcome.record_id,
                    error = %err,
                    "dataset save failed; cached table left unchanged"
                );
                return Err(err.into());
            }
        };

        info!(
            form = %submission.form,
            record_id = %outcome.record_id,
            action = ?outcome.action,
            rows = table.len(),
            "submission saved"
        );
        self.cached = Some(table);

        Ok(SubmissionReceipt {
            form: submission.form,
            outcome,
            save,
        })
    }
}
