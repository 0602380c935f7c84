//! Module `schema` implement the ordered description of metadata
//! fields governing the metadata-heap's record layout.

use cbordata::Cborize;

use std::{
    cmp,
    collections::BTreeMap,
    convert::{TryFrom, TryInto},
    fmt,
};

use crate::{err_at, Error, Result};

/// Implicit field, set to true when a series is logically deleted.
pub const DELETED_FIELD: &str = "deleted";
/// Implicit field, set to true when a series is a vantage point.
pub const VP_FIELD: &str = "vp";
/// Prefix for the implicit per-vantage-point distance fields.
pub const D_VP_PREFIX: &str = "d_vp_";

/// This value must change only when the shape of the persisted schema
/// changes. High 16-bits identify the type and lower 16-bits the version.
const SCHEMA_VER: u32 = 0x00010001;

/// Compose the distance-field name for vantage point `pk`.
pub fn d_vp_field(pk: &str) -> String {
    format!("{}{}", D_VP_PREFIX, pk)
}

/// Return true for field names managed by the storage layer itself.
pub fn is_implicit(name: &str) -> bool {
    name == DELETED_FIELD || name == VP_FIELD || name.starts_with(D_VP_PREFIX)
}

/// Type of a metadata field.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FieldType {
    Int,
    Float,
    Bool,
    /// Variable-length string with a fixed maximum byte-length.
    Str(usize),
}

impl FieldType {
    /// On-disk size of one value of this type, in bytes.
    pub fn size(&self) -> usize {
        match self {
            FieldType::Int => 8,
            FieldType::Float => 8,
            FieldType::Bool => 1,
            FieldType::Str(max) => 2 + max,
        }
    }
}

/// A metadata field value.
#[derive(Clone, Debug)]
pub enum Value {
    Int(i64),
    Float(f64),
    Bool(bool),
    Str(String),
}

impl Value {
    fn rank(&self) -> u8 {
        match self {
            Value::Int(_) => 0,
            Value::Float(_) => 1,
            Value::Bool(_) => 2,
            Value::Str(_) => 3,
        }
    }

    /// Return true if this value inhabits `ftype`.
    pub fn matches(&self, ftype: &FieldType) -> bool {
        matches!(
            (self, ftype),
            (Value::Int(_), FieldType::Int)
                | (Value::Float(_), FieldType::Float)
                | (Value::Bool(_), FieldType::Bool)
                | (Value::Str(_), FieldType::Str(_))
        )
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Float(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(v) => Some(*v),
            _ => None,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Value::Int(v) => write!(f, "{}", v),
            Value::Float(v) => write!(f, "{}", v),
            Value::Bool(v) => write!(f, "{}", v),
            Value::Str(v) => write!(f, "{:?}", v),
        }
    }
}

// Total ordering over values: floats order by total_cmp, variants of
// different types order by rank. Consistent with PartialEq below.
impl Ord for Value {
    fn cmp(&self, other: &Self) -> cmp::Ordering {
        match (self, other) {
            (Value::Int(a), Value::Int(b)) => a.cmp(b),
            (Value::Float(a), Value::Float(b)) => a.total_cmp(b),
            (Value::Bool(a), Value::Bool(b)) => a.cmp(b),
            (Value::Str(a), Value::Str(b)) => a.cmp(b),
            (a, b) => a.rank().cmp(&b.rank()),
        }
    }
}

impl PartialOrd for Value {
    fn partial_cmp(&self, other: &Self) -> Option<cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == cmp::Ordering::Equal
    }
}

impl Eq for Value {}

/// Index declaration for a metadata field.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IndexKind {
    /// No secondary index on this field.
    None,
    /// Ordered-tree index, for high-cardinality fields.
    Ordered,
    /// Bitmap index, for low-cardinality fields.
    Bitmap,
}

/// A single metadata field descriptor.
#[derive(Clone, Debug, PartialEq)]
pub struct Field {
    pub name: String,
    pub ftype: FieldType,
    pub default: Value,
    pub index: IndexKind,
}

impl Field {
    pub fn new(name: &str, ftype: FieldType, default: Value, index: IndexKind) -> Result<Field> {
        if crate::types::validate_pk(name).is_err() {
            err_at!(InvalidArgument, msg: "invalid field name {:?}", name)?
        }
        if !default.matches(&ftype) {
            err_at!(
                SchemaMismatch,
                msg: "default {} does not match type of field {:?}", default, name
            )?
        }
        if let FieldType::Str(max) = ftype {
            if max == 0 || max > (u16::MAX as usize) {
                err_at!(InvalidArgument, msg: "string width {} for field {:?}", max, name)?
            }
        }
        Ok(Field {
            name: name.to_string(),
            ftype,
            default,
            index,
        })
    }
}

/// Ordered list of field descriptors. The metadata-heap's record
/// layout, of size [Schema::size] bytes, is derived from it.
///
/// Two fields are implicit and always present: `deleted` and `vp`,
/// both bitmap-indexed booleans. Vantage-point distance fields
/// (`d_vp_<pk>`, ordered-indexed floats) come and go with
/// vantage-point insertion and deletion.
#[derive(Clone, Debug, PartialEq)]
pub struct Schema {
    fields: Vec<Field>,
}

impl Default for Schema {
    fn default() -> Schema {
        Schema::new()
    }
}

impl Schema {
    pub fn new() -> Schema {
        let fields = vec![
            Field {
                name: DELETED_FIELD.to_string(),
                ftype: FieldType::Bool,
                default: Value::Bool(false),
                index: IndexKind::Bitmap,
            },
            Field {
                name: VP_FIELD.to_string(),
                ftype: FieldType::Bool,
                default: Value::Bool(false),
                index: IndexKind::Bitmap,
            },
        ];
        Schema { fields }
    }

    /// Append `field` to the schema. Field names are unique.
    pub fn add_field(&mut self, field: Field) -> Result<()> {
        if self.field(&field.name).is_some() {
            err_at!(AlreadyExists, msg: "field {:?}", field.name)?
        }
        self.fields.push(field);
        Ok(())
    }

    /// Remove field `name` from the schema, return its descriptor.
    pub fn remove_field(&mut self, name: &str) -> Result<Field> {
        match self.fields.iter().position(|f| f.name == name) {
            Some(off) => Ok(self.fields.remove(off)),
            None => err_at!(SchemaMismatch, msg: "unknown field {:?}", name),
        }
    }

    /// Record size `R`, in bytes, for the current schema.
    pub fn size(&self) -> usize {
        self.fields.iter().map(|f| f.ftype.size()).sum()
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn as_fields(&self) -> &[Field] {
        &self.fields
    }

    /// Lookup field `name`, return its position and descriptor.
    pub fn field(&self, name: &str) -> Option<(usize, &Field)> {
        self.fields
            .iter()
            .enumerate()
            .find(|(_, f)| f.name == name)
    }

    /// A record with every field at its default value.
    pub fn default_record(&self) -> Vec<Value> {
        self.fields.iter().map(|f| f.default.clone()).collect()
    }

    /// Encode `record`, a tuple in schema order, into its packed
    /// binary layout.
    pub fn encode(&self, record: &[Value]) -> Result<Vec<u8>> {
        if record.len() != self.fields.len() {
            err_at!(
                SchemaMismatch,
                msg: "record arity {}/{}", record.len(), self.fields.len()
            )?
        }

        let mut buf = Vec::with_capacity(self.size());
        for (field, value) in self.fields.iter().zip(record.iter()) {
            if !value.matches(&field.ftype) {
                err_at!(
                    SchemaMismatch,
                    msg: "value {} for field {:?}", value, field.name
                )?
            }
            match (value, &field.ftype) {
                (Value::Int(v), _) => buf.extend_from_slice(&v.to_le_bytes()),
                (Value::Float(v), _) => buf.extend_from_slice(&v.to_le_bytes()),
                (Value::Bool(v), _) => buf.push(*v as u8),
                (Value::Str(v), FieldType::Str(max)) => {
                    let bytes = v.as_bytes();
                    if bytes.len() > *max {
                        err_at!(
                            InvalidArgument,
                            msg: "string {}/{} for field {:?}", bytes.len(), max, field.name
                        )?
                    }
                    buf.extend_from_slice(&u16::try_from(bytes.len()).unwrap().to_le_bytes());
                    buf.extend_from_slice(bytes);
                    buf.resize(buf.len() + (max - bytes.len()), 0);
                }
                _ => unreachable!(),
            }
        }

        Ok(buf)
    }

    /// Decode a packed record, the inverse of [Schema::encode].
    pub fn decode(&self, buf: &[u8]) -> Result<Vec<Value>> {
        if buf.len() != self.size() {
            err_at!(Integrity, msg: "record size {}/{}", buf.len(), self.size())?
        }

        let mut record = Vec::with_capacity(self.fields.len());
        let mut off = 0;
        for field in self.fields.iter() {
            let value = match field.ftype {
                FieldType::Int => {
                    let v = i64::from_le_bytes(buf[off..off + 8].try_into().unwrap());
                    Value::Int(v)
                }
                FieldType::Float => {
                    let v = f64::from_le_bytes(buf[off..off + 8].try_into().unwrap());
                    Value::Float(v)
                }
                FieldType::Bool => match buf[off] {
                    0 => Value::Bool(false),
                    1 => Value::Bool(true),
                    n => err_at!(Integrity, msg: "bool byte {} field {:?}", n, field.name)?,
                },
                FieldType::Str(max) => {
                    let n = u16::from_le_bytes(buf[off..off + 2].try_into().unwrap()) as usize;
                    if n > max {
                        err_at!(Integrity, msg: "string len {}/{} field {:?}", n, max, field.name)?
                    }
                    let v = err_at!(
                        FailConvert,
                        std::str::from_utf8(&buf[off + 2..off + 2 + n])
                    )?;
                    Value::Str(v.to_string())
                }
            };
            off += field.ftype.size();
            record.push(value);
        }

        Ok(record)
    }

    /// Present `record` as a field-name keyed map.
    pub fn to_map(&self, record: &[Value]) -> BTreeMap<String, Value> {
        self.fields
            .iter()
            .zip(record.iter())
            .map(|(f, v)| (f.name.clone(), v.clone()))
            .collect()
    }
}

// Disk representation, all snapshots go through cbor.

#[derive(Clone, Debug, Cborize)]
pub(crate) struct DiskValue {
    kind: u64,
    ival: i64,
    fbits: u64, // f64 bit-pattern, keeps round-trips bitwise
    bval: bool,
    sval: String,
}

impl DiskValue {
    const ID: u32 = SCHEMA_VER;
}

impl From<Value> for DiskValue {
    fn from(value: Value) -> DiskValue {
        let mut dv = DiskValue {
            kind: 0,
            ival: 0,
            fbits: 0,
            bval: false,
            sval: String::default(),
        };
        match value {
            Value::Int(v) => dv.ival = v,
            Value::Float(v) => {
                dv.kind = 1;
                dv.fbits = v.to_bits();
            }
            Value::Bool(v) => {
                dv.kind = 2;
                dv.bval = v;
            }
            Value::Str(v) => {
                dv.kind = 3;
                dv.sval = v;
            }
        }
        dv
    }
}

impl TryFrom<DiskValue> for Value {
    type Error = Error;

    fn try_from(dv: DiskValue) -> Result<Value> {
        match dv.kind {
            0 => Ok(Value::Int(dv.ival)),
            1 => Ok(Value::Float(f64::from_bits(dv.fbits))),
            2 => Ok(Value::Bool(dv.bval)),
            3 => Ok(Value::Str(dv.sval)),
            kind => err_at!(Integrity, msg: "value kind {}", kind),
        }
    }
}

#[derive(Clone, Debug, Cborize)]
pub(crate) struct DiskField {
    name: String,
    ftype: u64,
    max: u64,
    default: DiskValue,
    index: u64,
}

impl DiskField {
    const ID: u32 = SCHEMA_VER;
}

#[derive(Clone, Debug, Cborize)]
pub(crate) struct DiskSchema {
    fields: Vec<DiskField>,
}

impl DiskSchema {
    const ID: u32 = SCHEMA_VER;
}

impl From<Schema> for DiskSchema {
    fn from(schema: Schema) -> DiskSchema {
        let fields = schema
            .fields
            .into_iter()
            .map(|f| {
                let (ftype, max) = match f.ftype {
                    FieldType::Int => (0, 0),
                    FieldType::Float => (1, 0),
                    FieldType::Bool => (2, 0),
                    FieldType::Str(max) => (3, max as u64),
                };
                let index = match f.index {
                    IndexKind::None => 0,
                    IndexKind::Ordered => 1,
                    IndexKind::Bitmap => 2,
                };
                DiskField {
                    name: f.name,
                    ftype,
                    max,
                    default: f.default.into(),
                    index,
                }
            })
            .collect();
        DiskSchema { fields }
    }
}

impl TryFrom<DiskSchema> for Schema {
    type Error = Error;

    fn try_from(ds: DiskSchema) -> Result<Schema> {
        let mut fields = Vec::with_capacity(ds.fields.len());
        for df in ds.fields.into_iter() {
            let ftype = match df.ftype {
                0 => FieldType::Int,
                1 => FieldType::Float,
                2 => FieldType::Bool,
                3 => FieldType::Str(err_at!(FailConvert, usize::try_from(df.max))?),
                n => err_at!(Integrity, msg: "field type {}", n)?,
            };
            let index = match df.index {
                0 => IndexKind::None,
                1 => IndexKind::Ordered,
                2 => IndexKind::Bitmap,
                n => err_at!(Integrity, msg: "index kind {}", n)?,
            };
            fields.push(Field {
                name: df.name,
                ftype,
                default: Value::try_from(df.default)?,
                index,
            });
        }
        Ok(Schema { fields })
    }
}

#[cfg(test)]
#[path = "schema_test.rs"]
mod schema_test;
