//! Module implement common utility functions and types.

use cbordata::{Cbor, FromCbor, IntoCbor};
use crc::{Crc, CRC_32_ISCSI};
use lazy_static::lazy_static;

use std::{
    convert::{TryFrom, TryInto},
    ffi, fs, path,
};

use crate::{err_at, Error, Result};

lazy_static! {
    /// Every snapshot file starts with this marker.
    pub static ref SNAP_MARKER: Vec<u8> = {
        let marker = "யாதும் ஊரே யாவரும் கேளிர்";
        marker.as_bytes().to_vec()
    };
}

const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISCSI);

#[macro_export]
macro_rules! read_file {
    ($fd:expr, $seek:expr, $n:expr, $msg:expr) => {{
        use std::convert::TryFrom;

        match $fd.seek($seek) {
            Ok(_) => {
                let mut buf = vec![0; usize::try_from($n).unwrap()];
                match $fd.read(&mut buf) {
                    Ok(n) if buf.len() == n => Ok(buf),
                    Ok(n) => {
                        let m = buf.len();
                        err_at!(Fatal, msg: concat!($msg, " {}/{} at {:?}"), m, n, $seek)
                    }
                    Err(err) => err_at!(IOError, Err(err)),
                }
            }
            Err(err) => err_at!(IOError, Err(err)),
        }
    }};
}

#[macro_export]
macro_rules! write_file {
    ($fd:expr, $buffer:expr, $file:expr, $msg:expr) => {{
        use std::io::Write;

        match err_at!(IOError, $fd.write($buffer))? {
            n if $buffer.len() == n => Ok(n),
            n => err_at!(
                Fatal, msg: "partial-wr {}, {:?}, {}/{}", $msg, $file, $buffer.len(), n
            ),
        }
    }};
}

/// Helper function to serialize value `T` implementing IntoCbor, into byte-string.
pub fn into_cbor_bytes<T>(val: T) -> Result<Vec<u8>>
where
    T: IntoCbor,
{
    let mut data: Vec<u8> = vec![];
    let n = err_at!(
        FailCbor,
        err_at!(FailCbor, val.into_cbor())?.encode(&mut data)
    )?;
    if n != data.len() {
        err_at!(Fatal, msg: "cbor encoding len mistmatch {} {}", n, data.len())
    } else {
        Ok(data)
    }
}

/// Helper function to deserialize value `T` implementing FromCbor, from byte-string.
/// Return (value, bytes-consumed)
pub fn from_cbor_bytes<T>(mut data: &[u8]) -> Result<(T, usize)>
where
    T: FromCbor,
{
    let (val, n) = err_at!(FailCbor, Cbor::decode(&mut data))?;
    Ok((err_at!(FailCbor, T::from_cbor(val))?, n))
}

/// Compose the location of file `file` under directory `dir`.
pub fn to_location(dir: &ffi::OsStr, file: &str) -> ffi::OsString {
    let loc: path::PathBuf = [dir, ffi::OsStr::new(file)].iter().collect();
    loc.into_os_string()
}

// open file for reading and writing, create if missing.
pub fn open_file_cw(file: &ffi::OsStr) -> Result<fs::File> {
    let os_file = path::Path::new(file);
    let mut opts = fs::OpenOptions::new();
    Ok(err_at!(
        IOError,
        opts.read(true).write(true).create(true).open(os_file)
    )?)
}

/// Write `payload` as a checksummed snapshot file at `loc`.
///
/// Layout: marker-bytes, 4-byte crc32c over payload, 8-byte payload
/// length, payload. The snapshot is staged in a `.tmp` sibling and
/// renamed into place, the rename is the visibility point.
pub fn write_snapshot(loc: &ffi::OsStr, payload: &[u8]) -> Result<()> {
    use std::io::Write;

    let tmp = {
        let mut tmp = loc.to_os_string();
        tmp.push(".tmp");
        tmp
    };

    let mut buf: Vec<u8> = vec![];
    buf.extend_from_slice(&SNAP_MARKER);
    buf.extend_from_slice(&CRC32.checksum(payload).to_le_bytes());
    buf.extend_from_slice(&u64::try_from(payload.len()).unwrap().to_le_bytes());
    buf.extend_from_slice(payload);

    let mut fd = {
        let mut opts = fs::OpenOptions::new();
        err_at!(IOError, opts.write(true).create(true).truncate(true).open(&tmp))?
    };
    err_at!(IOError, fd.write_all(&buf))?;
    err_at!(IOError, fd.sync_all())?;
    err_at!(IOError, fs::rename(&tmp, loc))?;

    Ok(())
}

/// Read back a snapshot file written by [write_snapshot], verifying
/// its marker and checksum. Return the payload.
pub fn read_snapshot(loc: &ffi::OsStr) -> Result<Vec<u8>> {
    let data = err_at!(IOError, fs::read(loc))?;

    let m = SNAP_MARKER.len();
    if data.len() < (m + 12) {
        err_at!(Integrity, msg: "snapshot {:?} too short {}", loc, data.len())?
    }
    if &data[..m] != SNAP_MARKER.as_slice() {
        err_at!(Integrity, msg: "snapshot {:?} bad marker", loc)?
    }
    let crc = u32::from_le_bytes(data[m..m + 4].try_into().unwrap());
    let n = u64::from_le_bytes(data[m + 4..m + 12].try_into().unwrap());
    let payload = &data[m + 12..];
    if u64::try_from(payload.len()).unwrap() != n {
        err_at!(Integrity, msg: "snapshot {:?} length {}/{}", loc, payload.len(), n)?
    }
    if CRC32.checksum(payload) != crc {
        err_at!(Integrity, msg: "snapshot {:?} checksum mismatch", loc)?
    }

    Ok(payload.to_vec())
}

#[cfg(test)]
#[path = "util_test.rs"]
mod util_test;
