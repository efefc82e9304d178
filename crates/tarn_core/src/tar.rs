//! Tar container files holding immutable segments.
//!
//! Segments are archived into plain ustar files, one archive entry per
//! segment with the segment id as the entry name. The format is
//! deliberately boring: a store directory can be inspected or unpacked
//! with stock `tar` when debugging. Entries are only ever appended;
//! once a container reaches its size cap a new one is started.

use crate::config::Config;
use crate::error::CoreResult;
use crate::types::SegmentId;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tarn_storage::{FileBackend, MmapBackend, StorageBackend};
use tracing::warn;

/// Size of a tar block; headers and entry data are block aligned.
const BLOCK_SIZE: usize = 512;

/// A single append-only tar container.
pub(crate) struct TarFile {
    path: PathBuf,
    backend: Box<dyn StorageBackend>,
    /// Segment id to (data offset, data length) within the file.
    index: HashMap<SegmentId, (u64, u64)>,
    /// Insertion order, oldest first.
    order: Vec<SegmentId>,
    size: u64,
}

impl TarFile {
    /// Opens or creates a container, scanning existing entries into the
    /// in-memory index.
    ///
    /// # Errors
    ///
    /// Fails on I/O errors.
    pub(crate) fn open(path: &Path, config: &Config) -> CoreResult<Self> {
        let backend: Box<dyn StorageBackend> = if config.memory_mapping {
            Box::new(MmapBackend::open(path)?)
        } else {
            Box::new(FileBackend::open(path)?)
        };

        let mut tar = Self {
            path: path.to_path_buf(),
            backend,
            index: HashMap::new(),
            order: Vec::new(),
            size: 0,
        };
        tar.scan()?;
        Ok(tar)
    }

    #[cfg(test)]
    pub(crate) fn with_backend(backend: Box<dyn StorageBackend>) -> CoreResult<Self> {
        let mut tar = Self {
            path: PathBuf::from("<memory>"),
            backend,
            index: HashMap::new(),
            order: Vec::new(),
            size: 0,
        };
        tar.scan()?;
        Ok(tar)
    }

    /// Scans existing entries into the index.
    ///
    /// A malformed or truncated entry at the tail is a torn append from
    /// a crash: the container is rewound to the last complete entry and
    /// the open succeeds. The journal only ever names flushed records,
    /// so nothing reachable is lost with the dropped bytes.
    fn scan(&mut self) -> CoreResult<()> {
        let file_size = self.backend.size()?;
        let mut offset = 0u64;

        while offset + BLOCK_SIZE as u64 <= file_size {
            let header = self.backend.read_at(offset, BLOCK_SIZE)?;
            if header.iter().all(|&b| b == 0) {
                break;
            }

            let Some((id, len)) = parse_name(&header).zip(parse_octal(&header[124..136])) else {
                break;
            };

            let data_offset = offset + BLOCK_SIZE as u64;
            if data_offset + len > file_size {
                break;
            }

            self.index.insert(id, (data_offset, len));
            self.order.push(id);
            offset = data_offset + padded(len);
        }

        if offset < file_size {
            warn!(
                container = %self.path.display(),
                dropped = file_size - offset,
                "dropping torn bytes at container tail"
            );
            self.backend.truncate(offset)?;
        }
        self.size = offset;
        Ok(())
    }

    /// Returns the current container size in bytes.
    pub(crate) fn size(&self) -> u64 {
        self.size
    }

    /// Returns the size the container would have after appending an
    /// entry with `data_len` bytes of data.
    pub(crate) fn size_after(&self, data_len: usize) -> u64 {
        self.size + BLOCK_SIZE as u64 + padded(data_len as u64)
    }

    /// Returns whether the container holds the given segment.
    pub(crate) fn contains(&self, id: SegmentId) -> bool {
        self.index.contains_key(&id)
    }

    /// Returns the archived segment ids, oldest first.
    pub(crate) fn ids(&self) -> &[SegmentId] {
        &self.order
    }

    /// Appends a segment entry.
    ///
    /// # Errors
    ///
    /// Fails on I/O errors. A partially appended entry is rewound so
    /// the tracked size, the index and the file never diverge.
    pub(crate) fn write_entry(&mut self, id: SegmentId, data: &[u8]) -> CoreResult<()> {
        let start = self.size;
        if let Err(err) = self.append_blocks(id, data) {
            let _ = self.backend.truncate(start);
            return Err(err);
        }

        self.index
            .insert(id, (start + BLOCK_SIZE as u64, data.len() as u64));
        self.order.push(id);
        self.size = start + entry_size(data.len());
        Ok(())
    }

    fn append_blocks(&mut self, id: SegmentId, data: &[u8]) -> CoreResult<()> {
        let header = build_header(id, data.len() as u64);
        self.backend.append(&header)?;
        self.backend.append(data)?;

        let pad = (padded(data.len() as u64) - data.len() as u64) as usize;
        if pad > 0 {
            self.backend.append(&vec![0u8; pad])?;
        }
        Ok(())
    }

    /// Reads a segment's data, or `None` if this container does not hold
    /// it.
    ///
    /// # Errors
    ///
    /// Fails on I/O errors.
    pub(crate) fn read_entry(&self, id: SegmentId) -> CoreResult<Option<Vec<u8>>> {
        match self.index.get(&id) {
            Some(&(offset, len)) => Ok(Some(self.backend.read_at(offset, len as usize)?)),
            None => Ok(None),
        }
    }

    /// Flushes buffered writes to the operating system.
    pub(crate) fn flush(&mut self) -> CoreResult<()> {
        self.backend.flush()?;
        Ok(())
    }

    /// Forces written data to durable storage.
    pub(crate) fn sync(&mut self) -> CoreResult<()> {
        self.backend.sync()?;
        Ok(())
    }
}

impl std::fmt::Debug for TarFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TarFile")
            .field("path", &self.path)
            .field("entries", &self.order.len())
            .field("size", &self.size)
            .finish()
    }
}

/// Returns the container footprint of an entry with `data_len` bytes
/// of data: one header block plus the block-padded data.
pub(crate) fn entry_size(data_len: usize) -> u64 {
    BLOCK_SIZE as u64 + padded(data_len as u64)
}

/// Rounds a data length up to the next block boundary.
fn padded(len: u64) -> u64 {
    len.div_ceil(BLOCK_SIZE as u64) * BLOCK_SIZE as u64
}

/// Builds a ustar header block for an entry named by the segment id.
fn build_header(id: SegmentId, data_len: u64) -> [u8; BLOCK_SIZE] {
    let mut header = [0u8; BLOCK_SIZE];

    let name = id.to_string();
    header[..name.len()].copy_from_slice(name.as_bytes());

    header[100..107].copy_from_slice(b"0000644"); // mode
    header[108..115].copy_from_slice(b"0000000"); // uid
    header[116..123].copy_from_slice(b"0000000"); // gid

    let size = format!("{data_len:011o}");
    header[124..135].copy_from_slice(size.as_bytes());
    header[136..147].copy_from_slice(b"00000000000"); // mtime

    header[156] = b'0'; // regular file
    header[257..262].copy_from_slice(b"ustar");
    header[263..265].copy_from_slice(b"00");

    // Checksum is computed with the checksum field itself blanked out.
    header[148..156].copy_from_slice(b"        ");
    let sum: u32 = header.iter().map(|&b| u32::from(b)).sum();
    let chksum = format!("{sum:06o}\0 ");
    header[148..156].copy_from_slice(chksum.as_bytes());

    header
}

fn parse_name(header: &[u8]) -> Option<SegmentId> {
    let end = header[..100].iter().position(|&b| b == 0)?;
    std::str::from_utf8(&header[..end]).ok()?.parse().ok()
}

fn parse_octal(field: &[u8]) -> Option<u64> {
    let text = field
        .iter()
        .take_while(|&&b| b != 0 && b != b' ')
        .map(|&b| b as char)
        .collect::<String>();
    u64::from_str_radix(&text, 8).ok()
}

/// Names the `index`-th container of a segment family, e.g.
/// `data00000.tar`.
pub(crate) fn container_name(family: &str, index: usize) -> String {
    format!("{family}{index:05}.tar")
}
