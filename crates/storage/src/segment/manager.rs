//! Owns the backing file(s), grows the segment chain, and hands out
//! typed views into mapped segments (C3).

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::{debug, info};

use vtm_core::address::{FarAddress, SegmentIndex};
use vtm_core::error::{Error, Result};
use vtm_core::limits::MIN_SEGMENT_SIZE;

use super::block::{BlockHint, ReadonlyBlock, WritableBlock};
use super::header::{SegmentHeader, SEGMENT_HEADER_SIZE};
use super::mapped::MappedSegment;

/// Fired when the segment manager allocates or opens a segment, so callers
/// layered on top (the heap allocator, the topology) can format or validate
/// their reserved region before the segment is handed to ordinary traffic.
pub trait SegmentEventListener: Send + Sync {
    /// Called exactly once, right after a brand-new segment's header has
    /// been written and the region is mapped, before it is used.
    fn on_segment_allocated(&self, _segment: &MappedSegment) {}

    /// Called when a pre-existing segment is mapped back in on open, after
    /// its header has been validated.
    fn on_segment_opening(&self, _segment: &MappedSegment) {}
}

/// Owns the growable chain of fixed-size segments backing one database.
///
/// Segments are appended to a single backing file, back to back: segment `i`
/// occupies file bytes `[i * segment_size, (i + 1) * segment_size)`. Mapping
/// is lazy and memoized in `open_segments` so repeated access is a cache hit.
pub struct SegmentManager {
    file: Mutex<File>,
    path: PathBuf,
    segment_size: u32,
    segment_count: AtomicU32,
    open_segments: DashMap<SegmentIndex, Arc<MappedSegment>>,
    listeners: Mutex<Vec<Arc<dyn SegmentEventListener>>>,
}

impl SegmentManager {
    /// Create a brand-new backing file with one initial segment.
    pub fn create_new<P: AsRef<Path>>(path: P, segment_size: u32) -> Result<Self> {
        if segment_size < MIN_SEGMENT_SIZE {
            return Err(Error::InvalidState(format!(
                "segment_size {segment_size} is below the minimum of {MIN_SEGMENT_SIZE}"
            )));
        }
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(&path)?;
        info!(path = %path.display(), segment_size, "creating new segment file");
        let manager = SegmentManager {
            file: Mutex::new(file),
            path,
            segment_size,
            segment_count: AtomicU32::new(0),
            open_segments: DashMap::new(),
            listeners: Mutex::new(Vec::new()),
        };
        manager.grow_and_map(0)?;
        Ok(manager)
    }

    /// Reopen a previously created backing file, mapping segment 0 to learn
    /// the configured segment size.
    pub fn open_existing<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new().read(true).write(true).open(&path)?;
        let len = file.metadata()?.len();
        if len < SEGMENT_HEADER_SIZE as u64 {
            return Err(Error::Corruption(format!(
                "backing file {} is smaller than a segment header",
                path.display()
            )));
        }
        let mut header_bytes = [0u8; SEGMENT_HEADER_SIZE as usize];
        read_exact_at(&file, 0, &mut header_bytes)?;
        let header = SegmentHeader::from_bytes(&header_bytes)?;
        let segment_size = header.segment_size();
        if segment_size == 0 || len % segment_size as u64 != 0 {
            return Err(Error::Corruption(format!(
                "backing file length {len} is not a multiple of segment_size {segment_size}"
            )));
        }
        let segment_count = (len / segment_size as u64) as u32;
        info!(path = %path.display(), segment_size, segment_count, "opening existing segment file");
        let manager = SegmentManager {
            file: Mutex::new(file),
            path,
            segment_size,
            segment_count: AtomicU32::new(0),
            open_segments: DashMap::new(),
            listeners: Mutex::new(Vec::new()),
        };
        for i in 0..segment_count {
            manager.open_and_map(i)?;
        }
        Ok(manager)
    }

    /// Register a listener for segment allocation/open events.
    pub fn subscribe_event_listener(&self, listener: Arc<dyn SegmentEventListener>) {
        self.listeners.lock().push(listener);
    }

    /// The fixed size every segment is formatted to.
    pub fn segment_size(&self) -> u32 {
        self.segment_size
    }

    /// How many segments currently exist.
    pub fn segment_count(&self) -> SegmentIndex {
        self.segment_count.load(Ordering::Acquire)
    }

    /// Path of the backing file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Make sure segment `index` exists, growing the backing file and
    /// mapping/formatting a new segment if necessary.
    pub fn ensure_segment(&self, index: SegmentIndex) -> Result<Arc<MappedSegment>> {
        if let Some(existing) = self.open_segments.get(&index) {
            return Ok(existing.clone());
        }
        if index < self.segment_count() {
            return self.open_and_map(index);
        }
        if index != self.segment_count() {
            return Err(Error::InvalidState(format!(
                "segments must be allocated contiguously: requested {index}, have {}",
                self.segment_count()
            )));
        }
        self.grow_and_map(index)
    }

    fn grow_and_map(&self, index: SegmentIndex) -> Result<Arc<MappedSegment>> {
        let file_offset = index as u64 * self.segment_size as u64;
        {
            let file = self.file.lock();
            file.set_len(file_offset + self.segment_size as u64)?;
        }
        let segment = {
            let file = self.file.lock();
            MappedSegment::map(&file, index, file_offset, self.segment_size)?
        };
        segment
            .slice_mut(0, SEGMENT_HEADER_SIZE)?
            .copy_from_slice(&SegmentHeader::new(self.segment_size).to_bytes());
        let segment = Arc::new(segment);
        for listener in self.listeners.lock().iter() {
            listener.on_segment_allocated(&segment);
        }
        self.open_segments.insert(index, segment.clone());
        self.segment_count.fetch_max(index + 1, Ordering::AcqRel);
        debug!(index, "allocated new segment");
        Ok(segment)
    }

    fn open_and_map(&self, index: SegmentIndex) -> Result<Arc<MappedSegment>> {
        if let Some(existing) = self.open_segments.get(&index) {
            return Ok(existing.clone());
        }
        let file_offset = index as u64 * self.segment_size as u64;
        let segment = {
            let file = self.file.lock();
            MappedSegment::map(&file, index, file_offset, self.segment_size)?
        };
        let header_bytes = segment.slice(0, SEGMENT_HEADER_SIZE)?;
        SegmentHeader::from_bytes(header_bytes)?;
        let segment = Arc::new(segment);
        for listener in self.listeners.lock().iter() {
            listener.on_segment_opening(&segment);
        }
        self.open_segments.insert(index, segment.clone());
        self.segment_count.fetch_max(index + 1, Ordering::AcqRel);
        Ok(segment)
    }

    /// Borrow `len` bytes at `addr` read-only.
    pub fn readonly_block(&self, addr: FarAddress, len: u32) -> Result<ReadonlyBlock> {
        let segment = self.ensure_segment(addr.segment())?;
        ReadonlyBlock::new(segment, addr, len)
    }

    /// Borrow `len` bytes at `addr` for writing. `hint` only affects callers
    /// layered on top of a transaction; plain segment access ignores it.
    pub fn writable_block(
        &self,
        addr: FarAddress,
        len: u32,
        _hint: BlockHint,
    ) -> Result<WritableBlock> {
        let segment = self.ensure_segment(addr.segment())?;
        WritableBlock::new(segment, addr, len)
    }

    /// Upgrade an existing read-only block to writable.
    pub fn upgrade_to_writable(&self, block: ReadonlyBlock) -> Result<WritableBlock> {
        block.upgrade()
    }

    /// Typed read at `addr`.
    pub fn view<T>(&self, addr: FarAddress) -> Result<ReadonlyBlock> {
        self.readonly_block(addr, std::mem::size_of::<T>() as u32)
    }

    /// Typed write at `addr`.
    pub fn wr_at<T>(&self, addr: FarAddress, hint: BlockHint) -> Result<WritableBlock> {
        self.writable_block(addr, std::mem::size_of::<T>() as u32, hint)
    }

    /// Run `f` over every currently-mapped segment, in index order.
    pub fn foreach_segment<F: FnMut(&Arc<MappedSegment>) -> Result<()>>(
        &self,
        mut f: F,
    ) -> Result<()> {
        for i in 0..self.segment_count() {
            let segment = self.ensure_segment(i)?;
            f(&segment)?;
        }
        Ok(())
    }

    /// Flush every mapped segment to disk.
    pub fn flush_all(&self, asynchronous: bool) -> Result<()> {
        self.foreach_segment(|segment| segment.flush(asynchronous))
    }
}

fn read_exact_at(file: &File, offset: u64, buf: &mut [u8]) -> Result<()> {
    use std::io::{Read, Seek, SeekFrom};
    let mut file = file.try_clone()?;
    file.seek(SeekFrom::Start(offset))?;
    file.read_exact(buf)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_new_formats_first_segment() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("db.vtm");
        let manager = SegmentManager::create_new(&path, MIN_SEGMENT_SIZE).unwrap();
        assert_eq!(manager.segment_count(), 1);
        assert_eq!(manager.segment_size(), MIN_SEGMENT_SIZE);
    }

    #[test]
    fn ensure_segment_grows_contiguously() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("db.vtm");
        let manager = SegmentManager::create_new(&path, MIN_SEGMENT_SIZE).unwrap();
        manager.ensure_segment(1).unwrap();
        manager.ensure_segment(2).unwrap();
        assert_eq!(manager.segment_count(), 3);
        assert!(manager.ensure_segment(10).is_err());
    }

    #[test]
    fn reopen_recovers_segment_count() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("db.vtm");
        {
            let manager = SegmentManager::create_new(&path, MIN_SEGMENT_SIZE).unwrap();
            manager.ensure_segment(1).unwrap();
            manager.flush_all(false).unwrap();
        }
        let reopened = SegmentManager::open_existing(&path).unwrap();
        assert_eq!(reopened.segment_count(), 2);
        assert_eq!(reopened.segment_size(), MIN_SEGMENT_SIZE);
    }

    #[test]
    fn writable_then_readonly_block_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("db.vtm");
        let manager = SegmentManager::create_new(&path, MIN_SEGMENT_SIZE).unwrap();
        let addr = FarAddress::new(0, SEGMENT_HEADER_SIZE);
        {
            let mut block = manager
                .writable_block(addr, 8, BlockHint::New)
                .unwrap();
            block.as_mut_slice().copy_from_slice(&42u64.to_ne_bytes());
        }
        let block = manager.readonly_block(addr, 8).unwrap();
        assert_eq!(u64::from_ne_bytes(block.as_slice().try_into().unwrap()), 42);
    }

    #[test]
    fn open_existing_rejects_corrupt_header() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("db.vtm");
        {
            let file = OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .open(&path)
                .unwrap();
            file.set_len(MIN_SEGMENT_SIZE as u64).unwrap();
        }
        assert!(SegmentManager::open_existing(&path).is_err());
    }
}
