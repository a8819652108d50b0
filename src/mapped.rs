//! Growable memory-mapped byte region.
//!
//! The read side of the lock is held for every access, including writes to
//! bytes inside the mapped range; the write side is taken only to grow the
//! file, since growing requires an unmap/remap that invalidates every
//! pointer into the region. Exclusivity of overlapping byte ranges is the
//! caller's responsibility (reserved append offsets, per-node locks).

use std::fs::{File, OpenOptions};
use std::path::Path;
use std::ptr;

use memmap2::MmapMut;
use parking_lot::RwLock;
use tracing::debug;

use crate::error::{Result, StoreError};

pub struct MappedFile {
    grow_increment: u64,
    state: RwLock<MapState>,
}

struct MapState {
    file: File,
    map: MmapMut,
    size: u64,
}

impl MapState {
    fn base(&self) -> *mut u8 {
        self.map.as_ptr() as *mut u8
    }
}

impl MappedFile {
    /// Opens (creating if absent) and maps the file, padding it to at least
    /// `grow_increment` bytes so an empty file is mappable.
    pub fn open(path: &Path, grow_increment: u64) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;
        let grow_increment = grow_increment.max(4096);
        let mut size = file.metadata()?.len();
        if size < grow_increment {
            file.set_len(grow_increment)?;
            size = grow_increment;
        }
        let map = unsafe { MmapMut::map_mut(&file)? };
        Ok(Self {
            grow_increment,
            state: RwLock::new(MapState { file, map, size }),
        })
    }

    /// Currently mapped length. The logical end of the data inside the
    /// region is tracked by the metadata store, not here.
    pub fn size(&self) -> u64 {
        self.state.read().size
    }

    /// Copies `data` into the region at `off`, growing first if the range
    /// is not yet mapped.
    pub fn write(&self, off: u64, data: &[u8]) -> Result<()> {
        if data.is_empty() {
            return Ok(());
        }
        let end = range_end(off, data.len() as u64)?;
        loop {
            {
                let state = self.state.read();
                if end <= state.size {
                    // Safety: the range is inside the mapping and the
                    // caller guarantees no overlapping writer.
                    unsafe {
                        ptr::copy_nonoverlapping(
                            data.as_ptr(),
                            state.base().add(off as usize),
                            data.len(),
                        );
                    }
                    return Ok(());
                }
            }
            self.grow_to(end)?;
        }
    }

    /// Copies bytes out of the region into `buf`. Unlike [`write`], a range
    /// past the mapped size is an error: readers only follow offsets handed
    /// out by the metadata store, so an out-of-range read means the
    /// metadata and the file disagree.
    ///
    /// [`write`]: MappedFile::write
    pub fn read_into(&self, off: u64, buf: &mut [u8]) -> Result<()> {
        if buf.is_empty() {
            return Ok(());
        }
        let end = range_end(off, buf.len() as u64)?;
        let state = self.state.read();
        if end > state.size {
            return Err(StoreError::Corruption(format!(
                "read of [{off}, {end}) past mapped end {}",
                state.size
            )));
        }
        unsafe {
            ptr::copy_nonoverlapping(state.base().add(off as usize), buf.as_mut_ptr(), buf.len());
        }
        Ok(())
    }

    /// Runs `f` with a raw pointer to `len` bytes at `off`, growing the
    /// region first if needed. The pointer is valid only for the duration
    /// of the closure; the read lock pins the mapping meanwhile.
    pub fn with_range<R>(&self, off: u64, len: u64, f: impl FnOnce(*mut u8) -> R) -> Result<R> {
        let end = range_end(off, len)?;
        loop {
            {
                let state = self.state.read();
                if end <= state.size {
                    return Ok(f(unsafe { state.base().add(off as usize) }));
                }
            }
            self.grow_to(end)?;
        }
    }

    pub fn flush(&self) -> Result<()> {
        self.state.read().map.flush()?;
        Ok(())
    }

    fn grow_to(&self, needed: u64) -> Result<()> {
        let mut state = self.state.write();
        if needed <= state.size {
            return Ok(());
        }
        // Geometric doubling with a floor amortizes the remap cost.
        let mut new_size = state
            .size
            .saturating_mul(2)
            .max(state.size + self.grow_increment);
        if new_size < needed {
            new_size = needed + self.grow_increment;
        }
        state.file.set_len(new_size)?;
        state.map = unsafe { MmapMut::map_mut(&state.file)? };
        state.size = new_size;
        debug!(new_size, "grew mapped file");
        Ok(())
    }
}

fn range_end(off: u64, len: u64) -> Result<u64> {
    off.checked_add(len)
        .ok_or(StoreError::InvalidParameter("offset range overflows u64"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    #[test]
    fn write_then_read_roundtrip() {
        let tmp = NamedTempFile::new().expect("temp file");
        let mf = MappedFile::open(tmp.path(), 4096).expect("open");
        mf.write(10, b"hello mapped world").expect("write");

        let mut buf = [0u8; 18];
        mf.read_into(10, &mut buf).expect("read");
        assert_eq!(&buf, b"hello mapped world");
    }

    #[test]
    fn write_past_end_grows_the_file() {
        let tmp = NamedTempFile::new().expect("temp file");
        let mf = MappedFile::open(tmp.path(), 4096).expect("open");
        assert_eq!(mf.size(), 4096);

        mf.write(100_000, &[7u8; 16]).expect("write far out");
        assert!(mf.size() >= 100_016);

        let mut buf = [0u8; 16];
        mf.read_into(100_000, &mut buf).expect("read back");
        assert_eq!(buf, [7u8; 16]);
    }

    #[test]
    fn read_past_end_is_corruption() {
        let tmp = NamedTempFile::new().expect("temp file");
        let mf = MappedFile::open(tmp.path(), 4096).expect("open");
        let mut buf = [0u8; 8];
        let err = mf.read_into(1 << 20, &mut buf).unwrap_err();
        assert!(matches!(err, StoreError::Corruption(_)));
    }

    #[test]
    fn contents_survive_reopen() {
        let tmp = NamedTempFile::new().expect("temp file");
        {
            let mf = MappedFile::open(tmp.path(), 4096).expect("open");
            mf.write(0, b"persist me").expect("write");
            mf.flush().expect("flush");
        }
        let mf = MappedFile::open(tmp.path(), 4096).expect("reopen");
        let mut buf = [0u8; 10];
        mf.read_into(0, &mut buf).expect("read");
        assert_eq!(&buf, b"persist me");
    }
}
