use log::warn;

use std::{
    convert::TryFrom,
    ffi, fs,
    io::{Read, Seek, SeekFrom},
};

use crate::{err_at, heap::META_HEAP_FILE, read_file, util, write_file, Error, Result};

// Metadata heap, a fixed-record binary file with no header. The
// record layout lives in the schema, persisted separately; record
// size `R` changes only through a full rewrite of the heap.
pub struct MetaHeap {
    loc: ffi::OsString,
    fd: fs::File,
    reclen: usize,
}

impl MetaHeap {
    /// Open the metadata heap under `dir`, creating it if absent.
    /// `reclen` is the record size derived from the current schema.
    pub fn open(dir: &ffi::OsStr, reclen: usize) -> Result<MetaHeap> {
        let loc = util::to_location(dir, META_HEAP_FILE);
        MetaHeap::open_at(loc, reclen, false)
    }

    /// Create a fresh heap at `loc`, truncating any existing file.
    /// Used while rewriting the heap for a schema change; the caller
    /// renames the file into place afterwards.
    pub fn create_at(loc: ffi::OsString, reclen: usize) -> Result<MetaHeap> {
        MetaHeap::open_at(loc, reclen, true)
    }

    fn open_at(loc: ffi::OsString, reclen: usize, truncate: bool) -> Result<MetaHeap> {
        if reclen == 0 {
            err_at!(Fatal, msg: "zero record length for meta-heap")?
        }
        let fd = util::open_file_cw(&loc)?;
        if truncate {
            err_at!(IOError, fd.set_len(0))?;
        }

        let mut heap = MetaHeap { loc, fd, reclen };
        heap.truncate_tail()?;
        Ok(heap)
    }

    // drop a partial record at the tail, if any.
    fn truncate_tail(&mut self) -> Result<()> {
        let len = err_at!(IOError, self.fd.metadata())?.len();
        let reclen = u64::try_from(self.reclen).unwrap();
        let rem = len % reclen;
        if rem != 0 {
            warn!(target: "metaheap", "truncating partial tail {} bytes in {:?}", rem, self.loc);
            err_at!(IOError, self.fd.set_len(len - rem))?;
            err_at!(IOError, self.fd.sync_all())?;
        }
        Ok(())
    }

    /// Append a packed record, return the byte offset of its first
    /// byte. Synced to disk before returning.
    pub fn append(&mut self, record: &[u8]) -> Result<u64> {
        if record.len() != self.reclen {
            err_at!(Fatal, msg: "meta record {}/{}", record.len(), self.reclen)?
        }

        let fpos = err_at!(IOError, self.fd.seek(SeekFrom::End(0)))?;
        write_file!(self.fd, record, &self.loc, "meta-heap record")?;
        err_at!(IOError, self.fd.sync_data())?;

        Ok(fpos)
    }

    /// Read back the packed record at `offset`.
    pub fn read(&mut self, offset: u64) -> Result<Vec<u8>> {
        self.validate_offset(offset)?;
        let reclen = self.reclen;
        read_file!(self.fd, SeekFrom::Start(offset), reclen, "meta-heap record")
    }

    /// Overwrite the record at `offset` in place. Record size does
    /// not change outside a schema rewrite.
    pub fn overwrite(&mut self, offset: u64, record: &[u8]) -> Result<()> {
        if record.len() != self.reclen {
            err_at!(Fatal, msg: "meta record {}/{}", record.len(), self.reclen)?
        }
        self.validate_offset(offset)?;

        err_at!(IOError, self.fd.seek(SeekFrom::Start(offset)))?;
        write_file!(self.fd, record, &self.loc, "meta-heap record")?;
        err_at!(IOError, self.fd.sync_data())?;

        Ok(())
    }

    /// Check that `offset` names a well-formed record in this heap.
    pub fn validate_offset(&self, offset: u64) -> Result<()> {
        let len = err_at!(IOError, self.fd.metadata())?.len();
        let reclen = u64::try_from(self.reclen).unwrap();
        if (offset % reclen != 0) || (offset + reclen > len) {
            err_at!(Integrity, msg: "meta-heap offset {} len {} reclen {}", offset, len, reclen)?
        }
        Ok(())
    }

    /// Number of records in the heap, deleted ones included.
    pub fn count(&self) -> Result<u64> {
        let len = err_at!(IOError, self.fd.metadata())?.len();
        Ok(len / u64::try_from(self.reclen).unwrap())
    }
}

#[cfg(test)]
#[path = "meta_test.rs"]
mod meta_test;
