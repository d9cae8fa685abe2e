//! Durable list of the series keys of one shard
//!
//! Every record is `len (u32) | bincode(KeyEntry) | crc32 (u32)`. New series
//! are appended; eviction rewrites the whole file.

use crate::{Category, Result, SeriesId, TideError};
use bytes::{Buf, BufMut, BytesMut};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

const KEY_LIST_FILE: &str = "keys.list";

/// One series known to the shard
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyEntry {
    pub id: SeriesId,
    pub key: String,
    pub category: Category,
}

impl KeyEntry {
    fn encode(&self) -> Result<BytesMut> {
        let body = bincode::serialize(self).map_err(|e| TideError::InvalidFormat(e.to_string()))?;
        let mut buf = BytesMut::with_capacity(body.len() + 8);
        buf.put_u32_le(body.len() as u32);
        buf.put_slice(&body);
        buf.put_u32_le(crc32fast::hash(&body));
        Ok(buf)
    }

    /// Decode one record, `None` for a torn tail
    fn decode(data: &[u8]) -> Result<Option<(Self, usize)>> {
        if data.len() < 4 {
            return Ok(None);
        }
        let len = (&data[..4]).get_u32_le() as usize;
        if data.len() < 8 + len {
            return Ok(None);
        }

        let body = &data[4..4 + len];
        let expected = (&data[4 + len..8 + len]).get_u32_le();
        let actual = crc32fast::hash(body);
        if expected != actual {
            return Err(TideError::ChecksumMismatch { expected, actual });
        }

        let entry = bincode::deserialize(body).map_err(|e| TideError::InvalidFormat(e.to_string()))?;
        Ok(Some((entry, 8 + len)))
    }
}

/// Append-only key list file
pub struct KeyList {
    path: PathBuf,
    file: Mutex<BufWriter<File>>,
}

impl KeyList {
    /// Open the key list in `dir`, creating it if missing
    pub fn open(dir: &Path) -> Result<Self> {
        fs::create_dir_all(dir)?;
        let path = dir.join(KEY_LIST_FILE);
        let file = Self::open_append(&path)?;
        Ok(Self {
            path,
            file: Mutex::new(BufWriter::new(file)),
        })
    }

    /// Read every intact entry. Reading stops at the first damaged record,
    /// which is cut off along with everything after it.
    pub fn read_all(&self) -> Result<Vec<KeyEntry>> {
        let data = match fs::read(&self.path) {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut entries = Vec::new();
        let mut offset = 0;
        while offset < data.len() {
            match KeyEntry::decode(&data[offset..]) {
                Ok(Some((entry, consumed))) => {
                    entries.push(entry);
                    offset += consumed;
                }
                Ok(None) => {
                    warn!("Torn key list record at offset {} in {:?}", offset, self.path);
                    break;
                }
                Err(e) => {
                    warn!("Damaged key list record at offset {} in {:?}: {}", offset, self.path, e);
                    break;
                }
            }
        }

        if offset < data.len() {
            let _file = self.file.lock();
            OpenOptions::new()
                .write(true)
                .open(&self.path)?
                .set_len(offset as u64)?;
        }
        Ok(entries)
    }

    /// Append one entry
    pub fn append(&self, entry: &KeyEntry) -> Result<()> {
        let record = entry.encode()?;
        let mut file = self.file.lock();
        file.write_all(&record)?;
        file.flush()?;
        Ok(())
    }

    /// Replace the file contents with `entries`
    pub fn rewrite(&self, entries: &[KeyEntry]) -> Result<()> {
        let mut file = self.file.lock();
        file.flush()?;

        let tmp_path = self.path.with_extension("list.tmp");
        {
            let mut writer = BufWriter::new(File::create(&tmp_path)?);
            for entry in entries {
                writer.write_all(&entry.encode()?)?;
            }
            writer.flush()?;
            writer.get_ref().sync_all()?;
        }
        fs::rename(&tmp_path, &self.path)?;

        *file = BufWriter::new(Self::open_append(&self.path)?);
        debug!("Rewrote key list {:?} with {} keys", self.path, entries.len());
        Ok(())
    }

    /// Sync appended entries to disk
    pub fn sync(&self) -> Result<()> {
        let mut file = self.file.lock();
        file.flush()?;
        file.get_ref().sync_data()?;
        Ok(())
    }

    fn open_append(path: &Path) -> Result<File> {
        Ok(OpenOptions::new().create(true).append(true).open(path)?)
    }
}
