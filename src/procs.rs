//! Module `procs` implement the procedure registry.
//!
//! Procedures are pure functions over a series and an optional
//! numeric argument, returning a positioned tuple of values. They
//! run as trigger actions and under `augmented_select`, their
//! outputs are assigned to the caller-named target fields. The
//! registry is an explicit handle owned by the storage manager, not
//! process-wide state.

use std::collections::BTreeMap;

use crate::{err_at, vpoint, Error, Result, TimeSeries, Value};

/// A registered procedure.
pub type Proc = fn(&TimeSeries, Option<&[f64]>) -> Result<Vec<Value>>;

/// Mapping of procedure name to implementation. [Registry::default]
/// carries the built-in `stats` and `corr` procedures.
pub struct Registry {
    procs: BTreeMap<String, Proc>,
}

impl Default for Registry {
    fn default() -> Registry {
        let mut registry = Registry::new();
        registry.register("stats", stats);
        registry.register("corr", corr);
        registry
    }
}

impl Registry {
    pub fn new() -> Registry {
        Registry {
            procs: BTreeMap::new(),
        }
    }

    /// Register `proc` under `name`, replacing any previous binding.
    pub fn register(&mut self, name: &str, proc: Proc) {
        self.procs.insert(name.to_string(), proc);
    }

    pub fn get(&self, name: &str) -> Option<Proc> {
        self.procs.get(name).copied()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.procs.contains_key(name)
    }

    pub fn names(&self) -> Vec<String> {
        self.procs.keys().cloned().collect()
    }
}

// mean and population standard deviation of the value sequence.
fn stats(ts: &TimeSeries, _arg: Option<&[f64]>) -> Result<Vec<Value>> {
    let values = ts.as_values();
    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    let std = (values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n).sqrt();
    Ok(vec![Value::Float(mean), Value::Float(std)])
}

// cross-correlation distance from the series to a reference value
// sequence passed as the argument.
fn corr(ts: &TimeSeries, arg: Option<&[f64]>) -> Result<Vec<Value>> {
    let arg = match arg {
        Some(arg) => arg,
        None => err_at!(InvalidArgument, msg: "corr needs a reference sequence")?,
    };
    let d = vpoint::distance_values(ts.as_values(), arg)?;
    Ok(vec![Value::Float(d)])
}

#[cfg(test)]
#[path = "procs_test.rs"]
mod procs_test;
