//! Streaming CSV parser for uploaded import files.
//!
//! Rows are read one record at a time from any `AsyncRead`; nothing beyond the
//! current record and the read buffer is held in memory. Problems confined to
//! a single row come back as [`ParsedRow::Malformed`]; problems with the file
//! itself (encoding, header, I/O) are a [`FileError`] and end the job.

use csv_async::{AsyncReader, AsyncReaderBuilder, ByteRecord};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};

use crate::models::job::Checkpoint;
use crate::services::storage::{BlobReader, BlobStore, StorageError};

const READ_BUFFER: usize = 64 * 1024;
const UTF8_BOM: &[u8] = &[0xEF, 0xBB, 0xBF];

/// Fatal, file-level parse failure.
#[derive(Debug, thiserror::Error)]
pub enum FileError {
    #[error("File is empty or has no header row")]
    MissingHeader,

    #[error("Unsupported file encoding: {0}")]
    Encoding(String),

    #[error("Invalid header: {0}")]
    InvalidHeader(String),

    #[error("Could not read file: {0}")]
    Read(String),

    #[error("Could not open file: {0}")]
    Storage(#[from] StorageError),
}

impl From<std::io::Error> for FileError {
    fn from(e: std::io::Error) -> Self {
        FileError::Read(e.to_string())
    }
}

impl From<csv_async::Error> for FileError {
    fn from(e: csv_async::Error) -> Self {
        FileError::Read(e.to_string())
    }
}

/// Normalize a header cell into the key mappers look columns up by.
pub fn normalize_key(name: &str) -> String {
    name.trim()
        .to_lowercase()
        .chars()
        .map(|c| if c.is_whitespace() || c == '-' { '_' } else { c })
        .collect()
}

/// Header of an import file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Columns {
    names: Vec<String>,
    keys: Vec<String>,
}

impl Columns {
    pub fn from_headers(names: Vec<String>) -> Result<Self, FileError> {
        if names.iter().all(|n| n.trim().is_empty()) {
            return Err(FileError::MissingHeader);
        }

        let names: Vec<String> = names.into_iter().map(|n| n.trim().to_string()).collect();
        let mut keys: Vec<String> = Vec::with_capacity(names.len());
        for (idx, name) in names.iter().enumerate() {
            let key = normalize_key(name);
            if key.is_empty() {
                return Err(FileError::InvalidHeader(format!(
                    "column {} has no name",
                    idx + 1
                )));
            }
            if keys.contains(&key) {
                return Err(FileError::InvalidHeader(format!(
                    "duplicate column '{}'",
                    name
                )));
            }
            keys.push(key);
        }

        Ok(Self { names, keys })
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    /// Header cells as written in the file (trimmed).
    pub fn names(&self) -> &[String] {
        &self.names
    }

    pub fn keys(&self) -> &[String] {
        &self.keys
    }

    pub fn contains(&self, key: &str) -> bool {
        self.position(key).is_some()
    }

    pub fn position(&self, key: &str) -> Option<usize> {
        self.keys.iter().position(|k| k == key)
    }
}

/// One well-formed data row.
#[derive(Debug, Clone)]
pub struct Row {
    number: i64,
    columns: Arc<Columns>,
    values: Vec<String>,
}

impl Row {
    pub fn new(number: i64, columns: Arc<Columns>, values: Vec<String>) -> Self {
        Self {
            number,
            columns,
            values,
        }
    }

    /// 1-based data-row number (the header is not counted).
    pub fn number(&self) -> i64 {
        self.number
    }

    /// Raw value of a column by normalized key.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.columns
            .position(key)
            .and_then(|idx| self.values.get(idx))
            .map(String::as_str)
    }

    pub fn values(&self) -> &[String] {
        &self.values
    }

    /// Header → raw value, as stored alongside row errors.
    pub fn snapshot(&self) -> serde_json::Value {
        let map = self
            .columns
            .names()
            .iter()
            .zip(&self.values)
            .map(|(name, value)| (name.clone(), serde_json::Value::String(value.clone())))
            .collect();
        serde_json::Value::Object(map)
    }
}

/// A row that could not be split into the header's columns.
#[derive(Debug, Clone, PartialEq)]
pub struct MalformedRow {
    pub number: i64,
    pub message: String,
    pub row_data: serde_json::Value,
}

#[derive(Debug, Clone)]
pub enum ParsedRow {
    Valid(Row),
    Malformed(MalformedRow),
}

impl ParsedRow {
    pub fn number(&self) -> i64 {
        match self {
            ParsedRow::Valid(row) => row.number(),
            ParsedRow::Malformed(row) => row.number,
        }
    }
}

fn reader_builder(has_headers: bool) -> AsyncReaderBuilder {
    let mut builder = AsyncReaderBuilder::new();
    builder
        .has_headers(has_headers)
        .flexible(true)
        .buffer_capacity(READ_BUFFER);
    builder
}

/// Reject encodings we cannot parse, judged from the first buffered chunk.
/// Returns the length of a UTF-8 byte order mark to skip.
fn inspect_prefix(chunk: &[u8]) -> Result<usize, FileError> {
    if chunk.starts_with(&[0xFF, 0xFE]) || chunk.starts_with(&[0xFE, 0xFF]) {
        return Err(FileError::Encoding(
            "UTF-16 byte order mark found, save the file as UTF-8".to_string(),
        ));
    }
    if chunk.starts_with(&[0x00, 0x00, 0xFE, 0xFF]) {
        return Err(FileError::Encoding(
            "UTF-32 byte order mark found, save the file as UTF-8".to_string(),
        ));
    }
    if chunk.contains(&0) {
        return Err(FileError::Encoding(
            "file contains NUL bytes and is not a text CSV".to_string(),
        ));
    }

    let bom = if chunk.starts_with(UTF8_BOM) {
        UTF8_BOM.len()
    } else {
        0
    };

    match std::str::from_utf8(&chunk[bom..]) {
        Ok(_) => Ok(bom),
        // A multi-byte character cut off by the buffer boundary is fine.
        Err(e) if e.error_len().is_none() => Ok(bom),
        Err(e) => Err(FileError::Encoding(format!(
            "invalid UTF-8 at byte {}",
            bom + e.valid_up_to()
        ))),
    }
}

fn lossy_snapshot(columns: &Columns, record: &ByteRecord) -> serde_json::Value {
    let mut map = serde_json::Map::new();
    let mut extra = Vec::new();
    for (idx, field) in record.iter().enumerate() {
        let value = serde_json::Value::String(String::from_utf8_lossy(field).into_owned());
        match columns.names().get(idx) {
            Some(name) => {
                map.insert(name.clone(), value);
            }
            None => extra.push(value),
        }
    }
    if !extra.is_empty() {
        map.insert("_extra".to_string(), serde_json::Value::Array(extra));
    }
    serde_json::Value::Object(map)
}

/// Lazy, in-order sequence of rows from one import file.
pub struct CsvRowStream<R> {
    reader: AsyncReader<BufReader<R>>,
    columns: Arc<Columns>,
    /// Absolute file offset at which `reader` started.
    base_offset: u64,
    next_row: i64,
    offset: u64,
    record: ByteRecord,
}

impl<R> CsvRowStream<R>
where
    R: AsyncRead + Unpin + Send,
{
    /// Start reading a file from its first byte, validating encoding and header.
    pub async fn open(input: R) -> Result<Self, FileError> {
        let mut input = BufReader::with_capacity(READ_BUFFER, input);
        let chunk = input.fill_buf().await?;
        let bom = inspect_prefix(chunk)?;
        input.consume(bom);

        let mut reader = reader_builder(true).create_reader(input);
        let header = reader.byte_headers().await?.clone();
        let names = header
            .iter()
            .map(|cell| {
                std::str::from_utf8(cell)
                    .map(str::to_string)
                    .map_err(|_| FileError::Encoding("header row is not valid UTF-8".to_string()))
            })
            .collect::<Result<Vec<_>, _>>()?;
        let columns = Columns::from_headers(names)?;

        let base_offset = bom as u64;
        let offset = base_offset + reader.position().byte();
        Ok(Self {
            reader,
            columns: Arc::new(columns),
            base_offset,
            next_row: 1,
            offset,
            record: ByteRecord::new(),
        })
    }

    /// Continue a file from a checkpoint. `input` must start at
    /// `checkpoint.offset`; the header comes from an earlier [`Self::open`].
    pub fn resume(input: R, columns: Arc<Columns>, checkpoint: Checkpoint) -> Self {
        let input = BufReader::with_capacity(READ_BUFFER, input);
        let base_offset = checkpoint.offset.max(0) as u64;
        Self {
            reader: reader_builder(false).create_reader(input),
            columns,
            base_offset,
            next_row: checkpoint.row + 1,
            offset: base_offset,
            record: ByteRecord::new(),
        }
    }

    pub fn columns(&self) -> &Arc<Columns> {
        &self.columns
    }

    /// Absolute byte offset just past the last row returned (or the header).
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Number the next returned row will carry.
    pub fn next_row_number(&self) -> i64 {
        self.next_row
    }

    async fn advance(&mut self) -> Result<bool, FileError> {
        if !self.reader.read_byte_record(&mut self.record).await? {
            return Ok(false);
        }
        self.offset = self.base_offset + self.reader.position().byte();
        Ok(true)
    }

    pub async fn next_row(&mut self) -> Result<Option<ParsedRow>, FileError> {
        if !self.advance().await? {
            return Ok(None);
        }
        let number = self.next_row;
        self.next_row += 1;
        Ok(Some(self.decode(number)))
    }

    /// Read past rows up to and including `row` without decoding them.
    pub async fn skip_through(&mut self, row: i64) -> Result<(), FileError> {
        while self.next_row <= row {
            if !self.advance().await? {
                break;
            }
            self.next_row += 1;
        }
        Ok(())
    }

    fn decode(&self, number: i64) -> ParsedRow {
        if self.record.len() != self.columns.len() {
            return ParsedRow::Malformed(MalformedRow {
                number,
                message: format!(
                    "expected {} columns, found {}",
                    self.columns.len(),
                    self.record.len()
                ),
                row_data: lossy_snapshot(&self.columns, &self.record),
            });
        }

        let mut values = Vec::with_capacity(self.record.len());
        for (idx, field) in self.record.iter().enumerate() {
            match std::str::from_utf8(field) {
                Ok(value) => values.push(value.to_string()),
                Err(_) => {
                    return ParsedRow::Malformed(MalformedRow {
                        number,
                        message: format!(
                            "column '{}' is not valid UTF-8",
                            self.columns.names()[idx]
                        ),
                        row_data: lossy_snapshot(&self.columns, &self.record),
                    })
                }
            }
        }

        ParsedRow::Valid(Row::new(number, self.columns.clone(), values))
    }
}

/// Count data rows without keeping any of them.
pub async fn count_rows<R>(input: R) -> Result<i64, FileError>
where
    R: AsyncRead + Unpin + Send,
{
    let mut stream = CsvRowStream::open(input).await?;
    let mut count = 0;
    while stream.advance().await? {
        count += 1;
    }
    Ok(count)
}

/// Open a stored import file positioned just after `checkpoint`.
///
/// Only the header is read from the start of the file; the rows are read
/// from a second handle opened at the checkpoint's byte offset.
pub async fn open_import_file(
    store: &dyn BlobStore,
    key: &str,
    checkpoint: Checkpoint,
) -> Result<CsvRowStream<BlobReader>, FileError> {
    let mut head = CsvRowStream::open(store.open(key, 0).await?).await?;
    if checkpoint.row <= 0 {
        return Ok(head);
    }

    if checkpoint.offset > 0 && checkpoint.offset as u64 >= head.offset() {
        let tail = store.open(key, checkpoint.offset as u64).await?;
        return Ok(CsvRowStream::resume(tail, head.columns().clone(), checkpoint));
    }

    tracing::warn!(
        key = %key,
        checkpoint_row = checkpoint.row,
        checkpoint_offset = checkpoint.offset,
        "Checkpoint offset unusable, skipping rows from the start of the file"
    );
    head.skip_through(checkpoint.row).await?;
    Ok(head)
}
