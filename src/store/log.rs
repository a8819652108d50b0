//! Append-only record data log.
//!
//! Record bytes are written once at a caller-reserved offset and never
//! rewritten. Offset reservation is serialized by the metadata lock; this
//! type only moves bytes.

use std::path::Path;

use crate::error::Result;
use crate::mapped::MappedFile;
use crate::model::Doff;

pub(crate) struct DataLog {
    file: MappedFile,
}

impl DataLog {
    pub fn open(path: &Path, grow_increment: u64) -> Result<Self> {
        Ok(Self {
            file: MappedFile::open(path, grow_increment)?,
        })
    }

    pub fn append(&self, doff: Doff, bytes: &[u8]) -> Result<()> {
        self.file.write(doff, bytes)
    }

    pub fn read(&self, doff: Doff, dlen: u64) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; dlen as usize];
        self.file.read_into(doff, &mut buf)?;
        Ok(buf)
    }

    pub fn size(&self) -> u64 {
        self.file.size()
    }

    pub fn flush(&self) -> Result<()> {
        self.file.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn append_and_read_at_reserved_offsets() {
        let dir = TempDir::new().expect("temp dir");
        let log = DataLog::open(&dir.path().join("records.log"), 4096).expect("open");

        log.append(0, b"first record").expect("append");
        log.append(12, b"second").expect("append");

        assert_eq!(log.read(0, 12).expect("read"), b"first record");
        assert_eq!(log.read(12, 6).expect("read"), b"second");
    }
}
