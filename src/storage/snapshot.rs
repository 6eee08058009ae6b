use std::fs;
use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use crate::storage::memory::BackendImage;

/// snapshot 文件 Header
const MAGIC: u32 = 0x5C1D_0001;
const VERSION_CURRENT: u32 = 1;
const STATE_COMMITTED: u32 = 0x0000_0001;
const STATE_INCOMPLETE: u32 = 0xFFFF_FFFF;
const HEADER_SIZE: usize = 4 + 4 + 4 + 4 + 4; // magic + version + state + data_len + checksum

/// 后端状态的原子快照存储
///
/// 落盘流程：
/// 1) 写 `<path>.tmp` 的 INCOMPLETE header（len/checksum 先置 0）
/// 2) `bincode::serialize_into` 流式写 body，同时累计 CRC32 与长度
/// 3) seek 回开头覆盖 COMMITTED header
/// 4) fsync(tmpfile)
/// 5) rename(tmp, target)
/// 6) fsync(dir)
///
/// 加载时校验 magic + version + state + data_len + checksum，任何不一致都视为没有快照。
pub struct SnapshotStore {
    path: PathBuf,
}

struct ChecksumWriter<'a, W: Write> {
    inner: &'a mut W,
    hasher: crc32fast::Hasher,
    bytes: u64,
}

impl<'a, W: Write> ChecksumWriter<'a, W> {
    fn new(inner: &'a mut W) -> Self {
        Self {
            inner,
            hasher: crc32fast::Hasher::new(),
            bytes: 0,
        }
    }

    fn finish(self) -> (u64, u32) {
        (self.bytes, self.hasher.finalize())
    }
}

impl<'a, W: Write> Write for ChecksumWriter<'a, W> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.hasher.update(&buf[..n]);
        self.bytes += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.inner.flush()
    }
}

fn header(state: u32, data_len: u32, checksum: u32) -> [u8; HEADER_SIZE] {
    let mut h = [0u8; HEADER_SIZE];
    h[0..4].copy_from_slice(&MAGIC.to_le_bytes());
    h[4..8].copy_from_slice(&VERSION_CURRENT.to_le_bytes());
    h[8..12].copy_from_slice(&state.to_le_bytes());
    h[12..16].copy_from_slice(&data_len.to_le_bytes());
    h[16..20].copy_from_slice(&checksum.to_le_bytes());
    h
}

impl SnapshotStore {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn load_if_valid(&self) -> anyhow::Result<Option<BackendImage>> {
        if !self.path.exists() {
            return Ok(None);
        }

        let data = fs::read(&self.path)?;
        if data.len() < HEADER_SIZE {
            tracing::warn!("Snapshot too small, ignoring");
            return Ok(None);
        }

        let magic = u32::from_le_bytes(data[0..4].try_into()?);
        let version = u32::from_le_bytes(data[4..8].try_into()?);
        let state = u32::from_le_bytes(data[8..12].try_into()?);
        let data_len = u32::from_le_bytes(data[12..16].try_into()?) as usize;
        let stored_checksum = u32::from_le_bytes(data[16..20].try_into()?);

        if magic != MAGIC {
            tracing::warn!("Snapshot magic mismatch: {:#x} != {:#x}", magic, MAGIC);
            return Ok(None);
        }
        if version != VERSION_CURRENT {
            tracing::warn!(
                "Snapshot version mismatch: {} != {}",
                version,
                VERSION_CURRENT
            );
            return Ok(None);
        }
        if state != STATE_COMMITTED {
            tracing::warn!("Snapshot state INCOMPLETE, ignoring");
            return Ok(None);
        }

        let body = &data[HEADER_SIZE..];
        if body.len() != data_len {
            tracing::warn!("Snapshot data length mismatch");
            return Ok(None);
        }

        let computed = crc32fast::hash(body);
        if computed != stored_checksum {
            tracing::warn!(
                "Snapshot checksum mismatch: {:#x} != {:#x}",
                computed,
                stored_checksum
            );
            return Ok(None);
        }

        match bincode::deserialize::<BackendImage>(body) {
            Ok(image) => Ok(Some(image)),
            Err(e) => {
                tracing::warn!("Snapshot deserialize failed: {}", e);
                Ok(None)
            }
        }
    }

    pub fn write_atomic(&self, image: &BackendImage) -> anyhow::Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }

        let tmp_path = self.path.with_extension("tmp");
        let mut file = fs::File::create(&tmp_path)?;
        file.write_all(&header(STATE_INCOMPLETE, 0, 0))?;

        let (data_len, checksum) = {
            let mut cw = ChecksumWriter::new(&mut file);
            bincode::serialize_into(&mut cw, image)?;
            cw.finish()
        };
        let data_len: u32 = data_len
            .try_into()
            .map_err(|_| anyhow::anyhow!("Snapshot too large (>{} bytes)", u32::MAX))?;

        file.seek(SeekFrom::Start(0))?;
        file.write_all(&header(STATE_COMMITTED, data_len, checksum))?;
        file.sync_all()?;

        fs::rename(&tmp_path, &self.path)?;

        if let Some(parent) = self.path.parent() {
            if let Ok(dir) = fs::File::open(parent) {
                let _ = dir.sync_all();
            }
        }

        tracing::info!(
            "Snapshot written: {} collections, {} docs, {} bytes",
            image.collections.len(),
            image.doc_count(),
            HEADER_SIZE + data_len as usize
        );
        Ok(())
    }
}
