//! Per-chunk spill files
//!
//! Records are streamed one at a time, so a chunk never has to exist as a
//! single serialized blob. Writes land in a temporary sibling file that is
//! renamed into place once the header carries the final counts and CRC.

use super::compression::CompressionConfig;
use super::format::{ChunkFileHeader, CHUNK_FILE_EXTENSION};
use crate::errors::{CacheError, RecoveryHint, Result, SerializationOp};
use crate::queue::FeatureItem;
use bytes::Bytes;
use crc32c::crc32c_append;
use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

/// Outcome of one spill or load
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChunkFileStats {
    pub records: u64,
    pub payload_bytes: u64,
    pub file_bytes: u64,
}

/// Reads and writes `<dir>/<prefix><chunk_idx>.fea` files
#[derive(Debug, Clone)]
pub struct ChunkFileStore {
    dir: PathBuf,
    prefix: String,
    compression: CompressionConfig,
}

impl ChunkFileStore {
    pub fn new(dir: PathBuf, prefix: String, compression: CompressionConfig) -> Self {
        Self {
            dir,
            prefix,
            compression,
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn chunk_path(&self, chunk_idx: usize) -> PathBuf {
        self.dir.join(format!(
            "{}{}.{}",
            self.prefix, chunk_idx, CHUNK_FILE_EXTENSION
        ))
    }

    pub fn contains(&self, chunk_idx: usize) -> bool {
        self.chunk_path(chunk_idx).is_file()
    }

    /// Serialize `records` as the file for `chunk_idx`, replacing any previous one.
    ///
    /// The records are borrowed so a failed spill leaves the caller holding them.
    pub fn write_chunk(&self, chunk_idx: usize, records: &[FeatureItem]) -> Result<ChunkFileStats> {
        fs::create_dir_all(&self.dir).map_err(|e| CacheError::Io {
            path: self.dir.clone(),
            operation: "create storage directory",
            source: e,
            recovery_hint: RecoveryHint::CheckPermissions {
                path: self.dir.clone(),
            },
        })?;

        let path = self.chunk_path(chunk_idx);
        let temp_path = path.with_extension(format!(
            "{}.tmp.{}",
            CHUNK_FILE_EXTENSION,
            uuid::Uuid::new_v4()
        ));

        match self.write_temp(&temp_path, chunk_idx, records) {
            Ok(stats) => match fs::rename(&temp_path, &path) {
                Ok(()) => Ok(stats),
                Err(e) => {
                    let _ = fs::remove_file(&temp_path);
                    Err(CacheError::Io {
                        path,
                        operation: "atomic rename",
                        source: e,
                        recovery_hint: RecoveryHint::CheckDiskSpace,
                    })
                }
            },
            Err(e) => {
                let _ = fs::remove_file(&temp_path);
                Err(e)
            }
        }
    }

    fn write_temp(
        &self,
        temp_path: &Path,
        chunk_idx: usize,
        records: &[FeatureItem],
    ) -> Result<ChunkFileStats> {
        let io_err = |operation: &'static str| {
            let path = temp_path.to_path_buf();
            move |e: io::Error| CacheError::Io {
                path,
                operation,
                source: e,
                recovery_hint: RecoveryHint::CheckDiskSpace,
            }
        };

        let compressed = self.compression.enabled;
        let file = File::create(temp_path).map_err(io_err("create chunk file"))?;
        let mut writer = BufWriter::new(file);

        let placeholder = ChunkFileHeader::placeholder(chunk_idx as u64, compressed);
        encode_header(&mut writer, &placeholder, temp_path)?;

        let (payload_crc, payload_bytes) = if compressed {
            let mut encoder = zstd::stream::write::Encoder::new(&mut writer, self.compression.level)
                .map_err(|e| CacheError::Compression {
                    operation: "start zstd stream",
                    source: e,
                    recovery_hint: RecoveryHint::UpdateConfiguration,
                })?;
            let written = write_records(&mut encoder, records).map_err(io_err("write records"))?;
            encoder.finish().map_err(|e| CacheError::Compression {
                operation: "finish zstd stream",
                source: e,
                recovery_hint: RecoveryHint::CheckDiskSpace,
            })?;
            written
        } else {
            write_records(&mut writer, records).map_err(io_err("write records"))?
        };

        let mut file = writer
            .into_inner()
            .map_err(|e| io_err("flush chunk file")(e.into_error()))?;

        let header = ChunkFileHeader::new(
            chunk_idx as u64,
            records.len() as u64,
            payload_bytes,
            payload_crc,
            compressed,
        );
        file.seek(SeekFrom::Start(0))
            .map_err(io_err("rewind chunk file"))?;
        encode_header(&mut file, &header, temp_path)?;
        file.sync_data().map_err(io_err("sync chunk file"))?;

        let file_bytes = file
            .metadata()
            .map(|m| m.len())
            .map_err(io_err("stat chunk file"))?;

        Ok(ChunkFileStats {
            records: records.len() as u64,
            payload_bytes,
            file_bytes,
        })
    }

    /// Decode the file for `chunk_idx` without removing it
    pub fn read_chunk(&self, chunk_idx: usize) -> Result<Vec<FeatureItem>> {
        let path = self.chunk_path(chunk_idx);
        let file = File::open(&path).map_err(|e| CacheError::Io {
            path: path.clone(),
            operation: "open chunk file",
            source: e,
            recovery_hint: RecoveryHint::DiscardChunk,
        })?;
        let mut reader = BufReader::new(file);

        let header: ChunkFileHeader =
            bincode::deserialize_from(&mut reader).map_err(|e| CacheError::Serialization {
                path: path.clone(),
                operation: SerializationOp::Decode,
                source: e,
                recovery_hint: RecoveryHint::DiscardChunk,
            })?;
        header.validate(&path)?;

        if header.chunk_idx != chunk_idx as u64 {
            return Err(corruption(
                &path,
                format!(
                    "file belongs to chunk {}, expected {}",
                    header.chunk_idx, chunk_idx
                ),
            ));
        }

        if header.is_compressed() {
            let mut decoder =
                zstd::stream::read::Decoder::with_buffer(reader).map_err(|e| {
                    CacheError::Compression {
                        operation: "start zstd decoder",
                        source: e,
                        recovery_hint: RecoveryHint::DiscardChunk,
                    }
                })?;
            read_records(&mut decoder, &header, &path)
        } else {
            read_records(&mut reader, &header, &path)
        }
    }

    /// Decode and delete the file for `chunk_idx`. `Ok(None)` when no file exists.
    ///
    /// A file that decodes but cannot be deleted still yields its records; the
    /// leftover is overwritten by the next spill or removed by `clear_all`.
    pub fn load_chunk(
        &self,
        chunk_idx: usize,
    ) -> Result<Option<(Vec<FeatureItem>, ChunkFileStats)>> {
        let path = self.chunk_path(chunk_idx);
        let file_bytes = match fs::metadata(&path) {
            Ok(meta) => meta.len(),
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(CacheError::Io {
                    path,
                    operation: "stat chunk file",
                    source: e,
                    recovery_hint: RecoveryHint::DiscardChunk,
                })
            }
        };

        let records = self.read_chunk(chunk_idx)?;
        if let Err(e) = self.remove_chunk(chunk_idx) {
            tracing::warn!("Loaded chunk {} but could not delete its file: {}", chunk_idx, e);
        }

        let stats = ChunkFileStats {
            records: records.len() as u64,
            payload_bytes: records.iter().map(|r| r.len() as u64).sum(),
            file_bytes,
        };
        Ok(Some((records, stats)))
    }

    /// Delete the file for `chunk_idx`; a missing file is not an error
    pub fn remove_chunk(&self, chunk_idx: usize) -> Result<bool> {
        let path = self.chunk_path(chunk_idx);
        match fs::remove_file(&path) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(CacheError::Io {
                path: path.clone(),
                operation: "remove chunk file",
                source: e,
                recovery_hint: RecoveryHint::CheckPermissions { path },
            }),
        }
    }

    /// Delete the files of chunks `[0, chunk_num)`, returning how many existed
    pub fn clear_all(&self, chunk_num: usize) -> usize {
        let mut removed = 0;
        for chunk_idx in 0..chunk_num {
            match self.remove_chunk(chunk_idx) {
                Ok(true) => removed += 1,
                Ok(false) => {}
                Err(e) => tracing::warn!("Failed to remove chunk file {}: {}", chunk_idx, e),
            }
        }
        removed
    }
}

fn corruption(path: &Path, reason: String) -> CacheError {
    CacheError::Corruption {
        path: path.to_path_buf(),
        reason,
        recovery_hint: RecoveryHint::DiscardChunk,
    }
}

fn encode_header<W: Write>(out: &mut W, header: &ChunkFileHeader, path: &Path) -> Result<()> {
    bincode::serialize_into(out, header).map_err(|e| CacheError::Serialization {
        path: path.to_path_buf(),
        operation: SerializationOp::Encode,
        source: e,
        recovery_hint: RecoveryHint::CheckDiskSpace,
    })
}

/// Write length-prefixed records, returning (stream CRC, payload bytes)
fn write_records<W: Write>(out: &mut W, records: &[FeatureItem]) -> io::Result<(u32, u64)> {
    let mut crc = 0u32;
    let mut payload_bytes = 0u64;
    for record in records {
        let len = (record.len() as u64).to_le_bytes();
        out.write_all(&len)?;
        out.write_all(record)?;
        crc = crc32c_append(crc, &len);
        crc = crc32c_append(crc, record);
        payload_bytes += record.len() as u64;
    }
    Ok((crc, payload_bytes))
}

fn read_records<R: Read>(
    input: &mut R,
    header: &ChunkFileHeader,
    path: &Path,
) -> Result<Vec<FeatureItem>> {
    let truncated = |e: io::Error| {
        if e.kind() == io::ErrorKind::UnexpectedEof {
            corruption(path, "record stream is truncated".to_string())
        } else {
            CacheError::Io {
                path: path.to_path_buf(),
                operation: "read records",
                source: e,
                recovery_hint: RecoveryHint::DiscardChunk,
            }
        }
    };

    let mut crc = 0u32;
    let mut remaining = header.payload_bytes;
    let mut records = Vec::with_capacity(header.record_count.min(1 << 20) as usize);

    for _ in 0..header.record_count {
        let mut len_buf = [0u8; 8];
        input.read_exact(&mut len_buf).map_err(truncated)?;
        let len = u64::from_le_bytes(len_buf);
        if len > remaining {
            return Err(corruption(
                path,
                format!("record of {len} bytes exceeds remaining payload of {remaining}"),
            ));
        }
        remaining -= len;

        let len = usize::try_from(len)
            .map_err(|_| corruption(path, format!("record of {len} bytes is not addressable")))?;
        let mut record = vec![0u8; len];
        input.read_exact(&mut record).map_err(truncated)?;

        crc = crc32c_append(crc, &len_buf);
        crc = crc32c_append(crc, &record);
        records.push(Bytes::from(record));
    }

    if remaining != 0 {
        return Err(corruption(
            path,
            format!("{remaining} payload bytes missing after last record"),
        ));
    }

    let mut probe = [0u8; 1];
    if input.read(&mut probe).map_err(truncated)? != 0 {
        return Err(corruption(path, "trailing data after last record".to_string()));
    }

    if crc != header.payload_crc {
        return Err(corruption(
            path,
            format!(
                "Payload CRC mismatch: expected {:08x}, got {:08x}",
                header.payload_crc, crc
            ),
        ));
    }

    Ok(records)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn records() -> Vec<FeatureItem> {
        (0..16u8)
            .map(|i| Bytes::from(vec![i; 64 + i as usize]))
            .collect()
    }

    fn store(dir: &TempDir, compression: CompressionConfig) -> ChunkFileStore {
        ChunkFileStore::new(dir.path().to_path_buf(), "feature_cache_".to_string(), compression)
    }

    #[test]
    fn test_chunk_path_layout() {
        let temp_dir = TempDir::new().unwrap();
        let store = store(&temp_dir, CompressionConfig::default());
        assert_eq!(
            store.chunk_path(12),
            temp_dir.path().join("feature_cache_12.fea")
        );
    }

    #[test]
    fn test_load_removes_file() {
        let temp_dir = TempDir::new().unwrap();
        let store = store(&temp_dir, CompressionConfig::default());
        let original = records();

        let written = store.write_chunk(4, &original).unwrap();
        assert_eq!(written.records, 16);
        assert!(store.contains(4));

        let (loaded, stats) = store.load_chunk(4).unwrap().unwrap();
        assert_eq!(loaded, original);
        assert_eq!(stats.payload_bytes, written.payload_bytes);
        assert!(!store.contains(4));
        assert!(store.load_chunk(4).unwrap().is_none());
    }

    #[test]
    fn test_compressed_stream() {
        let temp_dir = TempDir::new().unwrap();
        let store = store(&temp_dir, CompressionConfig::zstd(3));
        let original: Vec<FeatureItem> = (0..8).map(|_| Bytes::from(vec![0u8; 10_000])).collect();

        let written = store.write_chunk(0, &original).unwrap();
        assert!(written.file_bytes < written.payload_bytes);
        assert_eq!(store.read_chunk(0).unwrap(), original);
    }

    #[test]
    fn test_empty_chunk() {
        let temp_dir = TempDir::new().unwrap();
        let store = store(&temp_dir, CompressionConfig::default());
        store.write_chunk(1, &[]).unwrap();
        assert!(store.read_chunk(1).unwrap().is_empty());
    }

    #[test]
    fn test_corrupted_payload_detected() {
        let temp_dir = TempDir::new().unwrap();
        let store = store(&temp_dir, CompressionConfig::default());
        store.write_chunk(2, &records()).unwrap();

        let path = store.chunk_path(2);
        let mut data = std::fs::read(&path).unwrap();
        let offset = ChunkFileHeader::encoded_len() as usize + 8 + 3;
        data[offset] ^= 0xFF;
        std::fs::write(&path, data).unwrap();

        match store.read_chunk(2) {
            Err(CacheError::Corruption { .. }) => {}
            other => panic!("expected corruption, got {other:?}"),
        }
    }

    #[test]
    fn test_truncated_file_detected() {
        let temp_dir = TempDir::new().unwrap();
        let store = store(&temp_dir, CompressionConfig::default());
        store.write_chunk(3, &records()).unwrap();

        let path = store.chunk_path(3);
        let data = std::fs::read(&path).unwrap();
        std::fs::write(&path, &data[..data.len() - 10]).unwrap();

        assert!(matches!(
            store.read_chunk(3),
            Err(CacheError::Corruption { .. })
        ));
    }

    #[test]
    fn test_file_for_other_chunk_rejected() {
        let temp_dir = TempDir::new().unwrap();
        let store = store(&temp_dir, CompressionConfig::default());
        store.write_chunk(5, &records()).unwrap();
        std::fs::rename(store.chunk_path(5), store.chunk_path(6)).unwrap();

        assert!(matches!(
            store.read_chunk(6),
            Err(CacheError::Corruption { .. })
        ));
    }

    #[cfg(unix)]
    #[test]
    fn test_load_keeps_records_when_delete_fails() {
        use std::os::unix::fs::PermissionsExt;

        let temp_dir = TempDir::new().unwrap();
        let chunk_dir = temp_dir.path().join("chunks");
        let store = ChunkFileStore::new(
            chunk_dir.clone(),
            "feature_cache_".to_string(),
            CompressionConfig::default(),
        );
        let original = records();
        store.write_chunk(7, &original).unwrap();

        let set_mode = |mode| {
            std::fs::set_permissions(&chunk_dir, std::fs::Permissions::from_mode(mode)).unwrap()
        };
        set_mode(0o555);
        // Privileged users ignore directory permissions
        if std::fs::File::create(chunk_dir.join("writable")).is_ok() {
            set_mode(0o755);
            return;
        }

        let loaded = store.load_chunk(7);
        set_mode(0o755);

        let (records, stats) = loaded.unwrap().unwrap();
        assert_eq!(records, original);
        assert_eq!(stats.records, 16);
        assert!(store.contains(7));
        assert_eq!(store.clear_all(8), 1);
    }

    #[test]
    fn test_clear_all_is_idempotent() {
        let temp_dir = TempDir::new().unwrap();
        let store = store(&temp_dir, CompressionConfig::default());
        store.write_chunk(0, &records()).unwrap();
        store.write_chunk(2, &records()).unwrap();

        assert_eq!(store.clear_all(3), 2);
        assert_eq!(store.clear_all(3), 0);
        assert!(!store.contains(0));
        assert!(!store.contains(2));
    }
}
