//! Module `config` define the database-creation parameters.

use std::{ffi, path};

use crate::{err_at, Error, Result};

/// Default log-flush cadence, in operations.
pub const FLUSH_EVERY: usize = 10;
/// Default SAX word length `w`, must divide the series length.
pub const WORD_LEN: usize = 4;
/// Default SAX alphabet cardinality `c`, must be a power of two.
pub const CARDINALITY: usize = 8;
/// Default iSAX terminal-node threshold.
pub const THRESHOLD: usize = 10;

/// Configuration for a [Tsdms] database instance.
///
/// `ts_length`, `word_len`, `cardinality` and `threshold` are fixed at
/// database creation and persisted in the database descriptor;
/// subsequent opens verify against the persisted values.
///
/// [Tsdms]: crate::Tsdms
#[derive(Debug, Clone)]
pub struct Config {
    /// Root directory under which databases are created.
    pub dir: ffi::OsString,
    /// Database name, a sub-directory under `dir`.
    pub name: String,
    /// Fixed series length `L` for every series in this database.
    pub ts_length: usize,
    /// Snapshot the primary index and truncate the log every
    /// `flush_every` operations.
    ///
    /// Default: [FLUSH_EVERY]
    pub flush_every: usize,
    /// SAX word length `w`.
    ///
    /// Default: [WORD_LEN]
    pub word_len: usize,
    /// SAX alphabet cardinality `c`.
    ///
    /// Default: [CARDINALITY]
    pub cardinality: usize,
    /// iSAX terminal-node threshold.
    ///
    /// Default: [THRESHOLD]
    pub threshold: usize,
}

impl Config {
    pub fn new(dir: &ffi::OsStr, name: &str, ts_length: usize) -> Config {
        Config {
            dir: dir.to_os_string(),
            name: name.to_string(),
            ts_length,
            flush_every: FLUSH_EVERY,
            word_len: WORD_LEN,
            cardinality: CARDINALITY,
            threshold: THRESHOLD,
        }
    }

    pub fn set_flush_every(&mut self, flush_every: usize) -> &mut Self {
        self.flush_every = flush_every;
        self
    }

    pub fn set_word_len(&mut self, word_len: usize) -> &mut Self {
        self.word_len = word_len;
        self
    }

    pub fn set_cardinality(&mut self, cardinality: usize) -> &mut Self {
        self.cardinality = cardinality;
        self
    }

    pub fn set_threshold(&mut self, threshold: usize) -> &mut Self {
        self.threshold = threshold;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if crate::types::validate_pk(&self.name).is_err() {
            err_at!(InvalidArgument, msg: "invalid db name {:?}", self.name)?
        }
        if self.ts_length == 0 {
            err_at!(InvalidArgument, msg: "ts_length must be positive")?
        }
        if self.flush_every == 0 {
            err_at!(InvalidArgument, msg: "flush_every must be positive")?
        }
        if (self.word_len == 0) || ((self.ts_length % self.word_len) != 0) {
            err_at!(
                InvalidArgument,
                msg: "word_len {} must divide ts_length {}", self.word_len, self.ts_length
            )?
        }
        if !self.cardinality.is_power_of_two() || self.cardinality < 2 || self.cardinality > 256 {
            err_at!(
                InvalidArgument,
                msg: "cardinality {} must be a power of two in 2..=256", self.cardinality
            )?
        }
        if self.threshold == 0 {
            err_at!(InvalidArgument, msg: "threshold must be positive")?
        }
        Ok(())
    }

    /// Compose the database directory, `<dir>/<name>`.
    pub fn to_db_dir(&self) -> ffi::OsString {
        let loc: path::PathBuf = [self.dir.as_os_str(), ffi::OsStr::new(&self.name)]
            .iter()
            .collect();
        loc.into_os_string()
    }
}

impl<'a> arbitrary::Arbitrary<'a> for Config {
    fn arbitrary(u: &mut arbitrary::Unstructured) -> arbitrary::Result<Self> {
        use std::env;

        let dir = env::temp_dir().into_os_string();
        let ts_length = *u.choose(&[8, 16, 32, 64, 100, 128])?;

        let mut config = Config::new(&dir, "arbitrary-db", ts_length);
        config
            .set_flush_every(*u.choose(&[1, 2, 10, 100])?)
            .set_word_len(*u.choose(&[2, 4])?)
            .set_cardinality(*u.choose(&[2, 4, 8, 16])?)
            .set_threshold(*u.choose(&[2, 5, 10, 50])?);
        Ok(config)
    }
}

#[cfg(test)]
#[path = "config_test.rs"]
mod config_test;
