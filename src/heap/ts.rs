use log::warn;

use std::{
    convert::{TryFrom, TryInto},
    ffi, fs,
    io::{Read, Seek, SeekFrom},
};

use crate::{err_at, heap::TS_HEAP_FILE, read_file, util, write_file, Error, Result, TimeSeries};

// Series heap, an append-only fixed-record binary file.
//
// Layout: 8-byte little-endian record length `L`, followed by records
// of 16*L bytes each, two back-to-back arrays of L doubles, times
// then values.
pub struct TsHeap {
    loc: ffi::OsString,
    fd: fs::File,
    ts_length: usize,
}

impl TsHeap {
    /// Open the series heap under `dir`, creating it if absent. An
    /// existing heap whose header disagrees with `ts_length` fails
    /// with SchemaMismatch.
    pub fn open(dir: &ffi::OsStr, ts_length: usize) -> Result<TsHeap> {
        let loc = util::to_location(dir, TS_HEAP_FILE);
        let is_new = fs::metadata(&loc).is_err();
        let mut fd = util::open_file_cw(&loc)?;

        let mut heap = if is_new {
            let header = u64::try_from(ts_length).unwrap().to_le_bytes();
            write_file!(fd, &header, &loc, "ts-heap header")?;
            err_at!(IOError, fd.sync_all())?;
            TsHeap { loc, fd, ts_length }
        } else {
            let buf = read_file!(fd, SeekFrom::Start(0), 8, "ts-heap header")?;
            let l = u64::from_le_bytes(buf.as_slice().try_into().unwrap());
            if l != u64::try_from(ts_length).unwrap() {
                err_at!(SchemaMismatch, msg: "ts-heap length {}/{}", l, ts_length)?
            }
            TsHeap { loc, fd, ts_length }
        };

        heap.truncate_tail()?;
        Ok(heap)
    }

    // drop a partial record at the tail, if any.
    fn truncate_tail(&mut self) -> Result<()> {
        let len = err_at!(IOError, self.fd.metadata())?.len();
        let stride = u64::try_from(self.stride()).unwrap();
        let rem = len.saturating_sub(8) % stride;
        if rem != 0 {
            warn!(target: "tsheap", "truncating partial tail {} bytes in {:?}", rem, self.loc);
            err_at!(IOError, self.fd.set_len(len - rem))?;
            err_at!(IOError, self.fd.sync_all())?;
        }
        Ok(())
    }

    #[inline]
    fn stride(&self) -> usize {
        16 * self.ts_length
    }

    /// Append `ts` at the end of the heap, return the byte offset of
    /// the record's first byte. The record is synced to disk before
    /// returning, an offset handed out refers to durable bytes.
    pub fn append(&mut self, ts: &TimeSeries) -> Result<u64> {
        if ts.len() != self.ts_length {
            err_at!(InvalidArgument, msg: "series length {}/{}", ts.len(), self.ts_length)?
        }

        let mut buf = Vec::with_capacity(self.stride());
        for t in ts.as_times() {
            buf.extend_from_slice(&t.to_le_bytes());
        }
        for v in ts.as_values() {
            buf.extend_from_slice(&v.to_le_bytes());
        }

        let fpos = err_at!(IOError, self.fd.seek(SeekFrom::End(0)))?;
        write_file!(self.fd, &buf, &self.loc, "ts-heap record")?;
        err_at!(IOError, self.fd.sync_data())?;

        Ok(fpos)
    }

    /// Read back the record at `offset`.
    pub fn read(&mut self, offset: u64) -> Result<TimeSeries> {
        self.validate_offset(offset)?;

        let stride = self.stride();
        let buf = read_file!(self.fd, SeekFrom::Start(offset), stride, "ts-heap record")?;

        let mut times = Vec::with_capacity(self.ts_length);
        let mut values = Vec::with_capacity(self.ts_length);
        for i in 0..self.ts_length {
            let a = i * 8;
            times.push(f64::from_le_bytes(buf[a..a + 8].try_into().unwrap()));
        }
        let base = self.ts_length * 8;
        for i in 0..self.ts_length {
            let a = base + i * 8;
            values.push(f64::from_le_bytes(buf[a..a + 8].try_into().unwrap()));
        }

        // times were validated on the way in.
        Ok(TimeSeries::new(times, values)?)
    }

    /// Check that `offset` names a well-formed record in this heap.
    pub fn validate_offset(&self, offset: u64) -> Result<()> {
        let len = err_at!(IOError, self.fd.metadata())?.len();
        let stride = u64::try_from(self.stride()).unwrap();
        let ok = (offset >= 8)
            && ((offset - 8) % stride == 0)
            && (offset + stride <= len);
        if !ok {
            err_at!(Integrity, msg: "ts-heap offset {} len {} stride {}", offset, len, stride)?
        }
        Ok(())
    }

    /// Number of records in the heap, deleted ones included.
    pub fn count(&self) -> Result<u64> {
        let len = err_at!(IOError, self.fd.metadata())?.len();
        Ok(len.saturating_sub(8) / u64::try_from(self.stride()).unwrap())
    }
}

#[cfg(test)]
#[path = "ts_test.rs"]
mod ts_test;
