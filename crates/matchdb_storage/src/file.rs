//! File-based table engine for persistent storage.
//!
//! The engine keeps one append-only log file per store. Every mutation is
//! written as a framed record and becomes visible only once a commit record
//! follows it, so a crash between the two leaves the mutation invisible on
//! replay. Row blobs are not held in memory: the in-memory index maps each
//! key to the blob's offset in the log, and `fetch` reads it back on demand.

use crate::engine::{BatchOp, TableEngine};
use crate::error::{StorageError, StorageResult};
use parking_lot::{Mutex, RwLock};
use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

/// Magic bytes prefixing every log record.
const LOG_MAGIC: [u8; 4] = *b"MLOG";

/// Current log format version.
const LOG_VERSION: u16 = 1;

/// Record header size: magic (4) + version (2) + type (1) + length (4).
const HEADER_SIZE: usize = 11;

/// CRC size.
const CRC_SIZE: usize = 4;

const TYPE_CREATE_TABLE: u8 = 1;
const TYPE_PUT: u8 = 2;
const TYPE_DELETE: u8 = 3;
const TYPE_COMMIT: u8 = 4;

/// Location of a row blob inside the log file.
#[derive(Debug, Clone, Copy)]
struct BlobRef {
    offset: u64,
    len: u32,
}

type TableIndex = BTreeMap<String, BlobRef>;

/// Index mutation staged between a record write and its commit.
#[derive(Debug)]
enum Staged {
    CreateTable(String),
    Put(String, String, BlobRef),
    Delete(String, String),
}

/// A persistent, log-structured table engine.
///
/// # Durability
///
/// Single-row mutations and batches are flushed and fsynced before the call
/// returns. Records written without a trailing commit record (a torn batch)
/// are discarded on replay.
///
/// # Thread Safety
///
/// This engine is thread-safe; the owning backend additionally serializes
/// all calls through its connection gate.
#[derive(Debug)]
pub struct FileEngine {
    path: PathBuf,
    file: Mutex<File>,
    /// Append offset; replay truncates a torn tail so this is also file size.
    size: Mutex<u64>,
    tables: RwLock<Vec<(String, TableIndex)>>,
}

impl FileEngine {
    /// Opens or creates a log file at the given path and replays it.
    ///
    /// A corrupt or torn tail is discarded: the file is truncated back to the
    /// last committed record boundary.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be opened or a committed record is
    /// structurally invalid.
    pub fn open(path: &Path) -> StorageResult<Self> {
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;

        let (tables, committed_size) = Self::replay(&mut file)?;

        // Drop anything after the last committed record.
        if file.metadata()?.len() > committed_size {
            file.set_len(committed_size)?;
            file.sync_all()?;
        }

        Ok(Self {
            path: path.to_path_buf(),
            file: Mutex::new(file),
            size: Mutex::new(committed_size),
            tables: RwLock::new(tables),
        })
    }

    /// Opens a log file, creating parent directories if needed.
    ///
    /// # Errors
    ///
    /// Returns an error if directories cannot be created or the file cannot
    /// be opened.
    pub fn open_with_create_dirs(path: &Path) -> StorageResult<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        Self::open(path)
    }

    /// Returns the path to the underlying log file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Replays the log, returning the recovered tables and the offset just
    /// past the last committed record.
    fn replay(file: &mut File) -> StorageResult<(Vec<(String, TableIndex)>, u64)> {
        let mut data = Vec::new();
        file.seek(SeekFrom::Start(0))?;
        file.read_to_end(&mut data)?;

        let mut tables: Vec<(String, TableIndex)> = Vec::new();
        let mut staged: Vec<Staged> = Vec::new();
        let mut cursor = 0usize;
        let mut committed = 0u64;

        while cursor + HEADER_SIZE + CRC_SIZE <= data.len() {
            let header = &data[cursor..cursor + HEADER_SIZE];
            if header[0..4] != LOG_MAGIC {
                break; // torn tail
            }
            let version = u16::from_le_bytes([header[4], header[5]]);
            if version > LOG_VERSION {
                return Err(StorageError::corrupted(format!(
                    "unsupported log version: {version}"
                )));
            }
            let record_type = header[6];
            let payload_len =
                u32::from_le_bytes([header[7], header[8], header[9], header[10]]) as usize;

            let record_end = cursor + HEADER_SIZE + payload_len + CRC_SIZE;
            if record_end > data.len() {
                break; // torn tail
            }

            let stored_crc = u32::from_le_bytes(
                data[record_end - CRC_SIZE..record_end]
                    .try_into()
                    .map_err(|_| StorageError::corrupted("invalid crc"))?,
            );
            if compute_crc32(&data[cursor..record_end - CRC_SIZE]) != stored_crc {
                break; // torn tail
            }

            let payload = &data[cursor + HEADER_SIZE..record_end - CRC_SIZE];
            let payload_offset = (cursor + HEADER_SIZE) as u64;

            match record_type {
                TYPE_CREATE_TABLE => {
                    let (table, _) = read_string(payload, 0)?;
                    staged.push(Staged::CreateTable(table));
                }
                TYPE_PUT => {
                    let (table, at) = read_string(payload, 0)?;
                    let (key, at) = read_string(payload, at)?;
                    if at + 4 > payload.len() {
                        return Err(StorageError::corrupted("truncated put record"));
                    }
                    let blob_len = u32::from_le_bytes(
                        payload[at..at + 4]
                            .try_into()
                            .map_err(|_| StorageError::corrupted("invalid blob length"))?,
                    );
                    if at + 4 + blob_len as usize != payload.len() {
                        return Err(StorageError::corrupted("trailing bytes in put record"));
                    }
                    let blob = BlobRef {
                        offset: payload_offset + at as u64 + 4,
                        len: blob_len,
                    };
                    staged.push(Staged::Put(table, key, blob));
                }
                TYPE_DELETE => {
                    let (table, at) = read_string(payload, 0)?;
                    let (key, _) = read_string(payload, at)?;
                    staged.push(Staged::Delete(table, key));
                }
                TYPE_COMMIT => {
                    for op in staged.drain(..) {
                        apply_staged(&mut tables, op);
                    }
                    committed = record_end as u64;
                }
                other => {
                    return Err(StorageError::corrupted(format!(
                        "unknown record type: {other}"
                    )));
                }
            }

            cursor = record_end;
        }

        Ok((tables, committed))
    }

    fn position(&self, table: &str) -> Option<usize> {
        self.tables
            .read()
            .iter()
            .position(|(name, _)| name.eq_ignore_ascii_case(table))
    }

    fn require(&self, table: &str) -> StorageResult<usize> {
        self.position(table)
            .ok_or_else(|| StorageError::unknown_table(table))
    }

    /// Appends a framed record and returns the absolute offset of its payload.
    fn append_record(
        &self,
        file: &mut File,
        size: &mut u64,
        record_type: u8,
        payload: &[u8],
    ) -> StorageResult<u64> {
        let mut data = Vec::with_capacity(HEADER_SIZE + payload.len() + CRC_SIZE);
        data.extend_from_slice(&LOG_MAGIC);
        data.extend_from_slice(&LOG_VERSION.to_le_bytes());
        data.push(record_type);
        let len = u32::try_from(payload.len())
            .map_err(|_| StorageError::corrupted("record payload too large"))?;
        data.extend_from_slice(&len.to_le_bytes());
        data.extend_from_slice(payload);
        let crc = compute_crc32(&data);
        data.extend_from_slice(&crc.to_le_bytes());

        file.seek(SeekFrom::Start(*size))?;
        file.write_all(&data)?;
        let payload_offset = *size + HEADER_SIZE as u64;
        *size += data.len() as u64;
        Ok(payload_offset)
    }

    /// Writes the given records plus a commit record, syncs, and applies the
    /// staged index updates.
    fn commit_records(&self, records: Vec<(u8, Vec<u8>, StagedShape)>) -> StorageResult<()> {
        let mut file = self.file.lock();
        let mut size = self.size.lock();
        let start = *size;

        let mut staged = Vec::with_capacity(records.len());
        let result = (|| -> StorageResult<()> {
            for (record_type, payload, shape) in records {
                let payload_offset =
                    self.append_record(&mut file, &mut size, record_type, &payload)?;
                staged.push(shape.into_staged(payload_offset));
            }
            self.append_record(&mut file, &mut size, TYPE_COMMIT, &[])?;
            file.flush()?;
            file.sync_all()?;
            Ok(())
        })();

        if let Err(e) = result {
            // Roll the append offset back so the torn tail is overwritten by
            // the next write, matching what replay would discard.
            *size = start;
            let _ = file.set_len(start);
            return Err(e);
        }

        let mut tables = self.tables.write();
        for op in staged {
            apply_staged(&mut tables, op);
        }
        Ok(())
    }

    fn read_blob(&self, blob: BlobRef) -> StorageResult<Vec<u8>> {
        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(blob.offset))?;
        let mut buf = vec![0u8; blob.len as usize];
        file.read_exact(&mut buf)?;
        Ok(buf)
    }
}

/// Shape of a staged index update before the blob offset is known.
#[derive(Debug)]
enum StagedShape {
    CreateTable(String),
    Put {
        table: String,
        key: String,
        blob_skip: u64,
        blob_len: u32,
    },
    Delete(String, String),
}

impl StagedShape {
    fn into_staged(self, payload_offset: u64) -> Staged {
        match self {
            Self::CreateTable(table) => Staged::CreateTable(table),
            Self::Put {
                table,
                key,
                blob_skip,
                blob_len,
            } => Staged::Put(
                table,
                key,
                BlobRef {
                    offset: payload_offset + blob_skip,
                    len: blob_len,
                },
            ),
            Self::Delete(table, key) => Staged::Delete(table, key),
        }
    }
}

fn apply_staged(tables: &mut Vec<(String, TableIndex)>, op: Staged) {
    match op {
        Staged::CreateTable(table) => {
            if !tables
                .iter()
                .any(|(name, _)| name.eq_ignore_ascii_case(&table))
            {
                tables.push((table, TableIndex::new()));
            }
        }
        Staged::Put(table, key, blob) => {
            if let Some(entry) = tables
                .iter_mut()
                .find(|(name, _)| name.eq_ignore_ascii_case(&table))
            {
                entry.1.insert(key, blob);
            }
        }
        Staged::Delete(table, key) => {
            if let Some(entry) = tables
                .iter_mut()
                .find(|(name, _)| name.eq_ignore_ascii_case(&table))
            {
                entry.1.remove(&key);
            }
        }
    }
}

fn write_string(buf: &mut Vec<u8>, value: &str) {
    let bytes = value.as_bytes();
    let len = u16::try_from(bytes.len()).unwrap_or(u16::MAX);
    buf.extend_from_slice(&len.to_le_bytes());
    buf.extend_from_slice(&bytes[..len as usize]);
}

fn read_string(payload: &[u8], at: usize) -> StorageResult<(String, usize)> {
    if at + 2 > payload.len() {
        return Err(StorageError::corrupted("truncated string length"));
    }
    let len = u16::from_le_bytes([payload[at], payload[at + 1]]) as usize;
    let start = at + 2;
    if start + len > payload.len() {
        return Err(StorageError::corrupted("truncated string"));
    }
    let value = std::str::from_utf8(&payload[start..start + len])
        .map_err(|_| StorageError::corrupted("invalid utf-8 string"))?
        .to_string();
    Ok((value, start + len))
}

fn put_payload(table: &str, key: &str, blob: &[u8]) -> (Vec<u8>, u64) {
    let mut payload = Vec::with_capacity(table.len() + key.len() + blob.len() + 8);
    write_string(&mut payload, table);
    write_string(&mut payload, key);
    let blob_skip = payload.len() as u64 + 4;
    payload.extend_from_slice(&(blob.len() as u32).to_le_bytes());
    payload.extend_from_slice(blob);
    (payload, blob_skip)
}

fn name_payload(table: &str) -> Vec<u8> {
    let mut payload = Vec::with_capacity(table.len() + 2);
    write_string(&mut payload, table);
    payload
}

fn pair_payload(table: &str, key: &str) -> Vec<u8> {
    let mut payload = Vec::with_capacity(table.len() + key.len() + 4);
    write_string(&mut payload, table);
    write_string(&mut payload, key);
    payload
}

impl TableEngine for FileEngine {
    fn create_table(&self, table: &str) -> StorageResult<()> {
        if self.position(table).is_some() {
            return Err(StorageError::TableExists {
                table: table.to_string(),
            });
        }
        self.commit_records(vec![(
            TYPE_CREATE_TABLE,
            name_payload(table),
            StagedShape::CreateTable(table.to_string()),
        )])
    }

    fn has_table(&self, table: &str) -> StorageResult<bool> {
        Ok(self.position(table).is_some())
    }

    fn table_names(&self) -> StorageResult<Vec<String>> {
        Ok(self
            .tables
            .read()
            .iter()
            .map(|(name, _)| name.clone())
            .collect())
    }

    fn insert(&self, table: &str, key: &str, blob: &[u8]) -> StorageResult<()> {
        let pos = self.require(table)?;
        if self.tables.read()[pos].1.contains_key(key) {
            return Err(StorageError::duplicate_key(table, key));
        }
        let (payload, blob_skip) = put_payload(table, key, blob);
        self.commit_records(vec![(
            TYPE_PUT,
            payload,
            StagedShape::Put {
                table: table.to_string(),
                key: key.to_string(),
                blob_skip,
                blob_len: blob.len() as u32,
            },
        )])
    }

    fn update(&self, table: &str, key: &str, blob: &[u8]) -> StorageResult<()> {
        let pos = self.require(table)?;
        if !self.tables.read()[pos].1.contains_key(key) {
            return Ok(());
        }
        let (payload, blob_skip) = put_payload(table, key, blob);
        self.commit_records(vec![(
            TYPE_PUT,
            payload,
            StagedShape::Put {
                table: table.to_string(),
                key: key.to_string(),
                blob_skip,
                blob_len: blob.len() as u32,
            },
        )])
    }

    fn delete(&self, table: &str, key: &str) -> StorageResult<()> {
        let pos = self.require(table)?;
        if !self.tables.read()[pos].1.contains_key(key) {
            return Ok(());
        }
        self.commit_records(vec![(
            TYPE_DELETE,
            pair_payload(table, key),
            StagedShape::Delete(table.to_string(), key.to_string()),
        )])
    }

    fn fetch(&self, table: &str, key: &str) -> StorageResult<Option<Vec<u8>>> {
        let pos = self.require(table)?;
        let blob = self.tables.read()[pos].1.get(key).copied();
        match blob {
            Some(blob) => Ok(Some(self.read_blob(blob)?)),
            None => Ok(None),
        }
    }

    fn scan(&self, table: &str) -> StorageResult<Vec<(String, Vec<u8>)>> {
        let pos = self.require(table)?;
        let refs: Vec<(String, BlobRef)> = self.tables.read()[pos]
            .1
            .iter()
            .map(|(k, v)| (k.clone(), *v))
            .collect();
        let mut rows = Vec::with_capacity(refs.len());
        for (key, blob) in refs {
            rows.push((key, self.read_blob(blob)?));
        }
        Ok(rows)
    }

    fn keys(&self, table: &str) -> StorageResult<Vec<String>> {
        let pos = self.require(table)?;
        Ok(self.tables.read()[pos].1.keys().cloned().collect())
    }

    fn row_count(&self, table: &str) -> StorageResult<u64> {
        let pos = self.require(table)?;
        Ok(self.tables.read()[pos].1.len() as u64)
    }

    fn apply_batch(&self, table: &str, ops: &[BatchOp]) -> StorageResult<()> {
        let pos = self.require(table)?;
        {
            let tables = self.tables.read();
            let rows = &tables[pos].1;
            for op in ops {
                if let BatchOp::Insert { key, .. } = op {
                    if rows.contains_key(key) {
                        return Err(StorageError::duplicate_key(table, key.clone()));
                    }
                }
            }
        }

        let mut records = Vec::with_capacity(ops.len());
        for op in ops {
            match op {
                BatchOp::Insert { key, blob } | BatchOp::Update { key, blob } => {
                    let (payload, blob_skip) = put_payload(table, key, blob);
                    records.push((
                        TYPE_PUT,
                        payload,
                        StagedShape::Put {
                            table: table.to_string(),
                            key: key.clone(),
                            blob_skip,
                            blob_len: blob.len() as u32,
                        },
                    ));
                }
                BatchOp::Delete { key } => {
                    records.push((
                        TYPE_DELETE,
                        pair_payload(table, key),
                        StagedShape::Delete(table.to_string(), key.clone()),
                    ));
                }
            }
        }
        self.commit_records(records)
    }

    fn close(&self) -> StorageResult<()> {
        let file = self.file.lock();
        file.sync_all()?;
        Ok(())
    }
}

/// Computes a CRC32 (IEEE) checksum.
fn compute_crc32(data: &[u8]) -> u32 {
    const CRC32_TABLE: [u32; 256] = {
        let mut table = [0u32; 256];
        let mut i = 0;
        while i < 256 {
            let mut crc = i as u32;
            let mut bit = 0;
            while bit < 8 {
                if crc & 1 != 0 {
                    crc = (crc >> 1) ^ 0xEDB8_8320;
                } else {
                    crc >>= 1;
                }
                bit += 1;
            }
            table[i] = crc;
            i += 1;
        }
        table
    };

    let mut crc = 0xFFFF_FFFF_u32;
    for &byte in data {
        let index = ((crc ^ u32::from(byte)) & 0xFF) as usize;
        crc = (crc >> 8) ^ CRC32_TABLE[index];
    }
    !crc
}
