//! The typed, indexed Object Dictionary data model.
//!
//! Unlike the code-generated, `'static`-bound object model this was grown from, an
//! [`ObjectDictionary`] here is an ordinary owned, heap-allocated value: it is built once at
//! runtime (by hand, or eventually from a parsed EDS/DCF file, which is outside this crate) and
//! then shared by reference between a [`Node`](crate::node_id) and its SDO/PDO subsystems.

use std::collections::BTreeMap;
use std::sync::RwLock;

use snafu::Snafu;

use crate::codec::{self, BitPositions, CodecError, DataType, Value};

/// Access rights for a Variable
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AccessType {
    /// Read-only
    Ro,
    /// Write-only
    Wo,
    /// Read-write
    Rw,
    /// Read-only, and the value never changes after construction
    Const,
}

impl AccessType {
    /// True if an SDO upload (read) is permitted
    pub fn readable(self) -> bool {
        !matches!(self, AccessType::Wo)
    }

    /// True if an SDO download (write) is permitted
    pub fn writable(self) -> bool {
        matches!(self, AccessType::Wo | AccessType::Rw)
    }
}

/// Which direction an access was attempted in, for reporting which abort code applies
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AccessDirection {
    /// An SDO upload (read) was attempted against a write-only object
    Read,
    /// An SDO download (write) was attempted against a read-only or const object
    Write,
}

/// Failures reported by Object Dictionary lookups and accesses
#[derive(Debug, Clone, PartialEq, Snafu)]
pub enum OdError {
    /// No object exists at this index
    #[snafu(display("no object at index 0x{index:04X}"))]
    NoSuchObject {
        /// The missing index
        index: u16,
    },
    /// The index exists, but not this sub-index
    #[snafu(display("no sub-index {sub} at index 0x{index:04X}"))]
    NoSuchSubIndex {
        /// The index that was found
        index: u16,
        /// The sub-index that was not
        sub: u8,
    },
    /// The requested operation isn't permitted by the object's access type
    #[snafu(display("access violation ({direction:?}) at 0x{index:04X}:{sub}"))]
    AccessViolation {
        /// Object index
        index: u16,
        /// Object sub-index
        sub: u8,
        /// Which direction was attempted
        direction: AccessDirection,
    },
    /// The raw bytes didn't decode/encode cleanly against the declared data type
    Codec {
        /// Underlying codec failure
        source: CodecError,
    },
}

/// A single typed, indexed leaf value
#[derive(Debug)]
pub struct Variable {
    /// Object index
    pub index: u16,
    /// Sub-index within the parent Record/Array (0 for a standalone Variable)
    pub subindex: u8,
    /// Human-readable name, unique within its parent scope
    pub name: String,
    /// Wire data type
    pub data_type: DataType,
    /// Access rights
    pub access_type: AccessType,
    /// Engineering unit label, informational only
    pub unit: Option<String>,
    /// Scale factor applied by `encode_phys`/`decode_phys`
    pub factor: f64,
    /// Minimum representable physical value, if bounded
    pub min: Option<f64>,
    /// Maximum representable physical value, if bounded
    pub max: Option<f64>,
    /// Named integer -> description mappings, for `encode_desc`/`decode_desc`
    pub value_descriptions: BTreeMap<i64, String>,
    /// Named bit fields, each an ordered list of bit positions within the raw value
    pub bit_definitions: BTreeMap<String, BitPositions>,
    data: RwLock<Vec<u8>>,
}

impl Variable {
    /// Construct a new Variable, initialized to `default`
    pub fn new(index: u16, subindex: u8, name: impl Into<String>, data_type: DataType, access_type: AccessType, default: Value) -> Self {
        let data = codec::encode_raw(data_type, &default).expect("default value must encode");
        Self {
            index,
            subindex,
            name: name.into(),
            data_type,
            access_type,
            unit: None,
            factor: 1.0,
            min: None,
            max: None,
            value_descriptions: BTreeMap::new(),
            bit_definitions: BTreeMap::new(),
            data: RwLock::new(data),
        }
    }

    /// Set the scale factor used by `encode_phys`/`decode_phys`
    pub fn with_factor(mut self, factor: f64) -> Self {
        self.factor = factor;
        self
    }

    /// Set the unit label
    pub fn with_unit(mut self, unit: impl Into<String>) -> Self {
        self.unit = Some(unit.into());
        self
    }

    /// Set the representable range
    pub fn with_range(mut self, min: f64, max: f64) -> Self {
        self.min = Some(min);
        self.max = Some(max);
        self
    }

    /// Add a value -> description mapping
    pub fn with_description(mut self, value: i64, description: impl Into<String>) -> Self {
        self.value_descriptions.insert(value, description.into());
        self
    }

    /// Add a named bit field
    pub fn with_bit_field(mut self, name: impl Into<String>, bits: BitPositions) -> Self {
        self.bit_definitions.insert(name.into(), bits);
        self
    }

    /// Read the raw byte encoding of the current value
    pub fn encode_raw(&self) -> Vec<u8> {
        self.data.read().unwrap().clone()
    }

    /// Overwrite the raw byte encoding of the value
    pub fn decode_raw(&self, bytes: &[u8]) -> Result<(), CodecError> {
        // Validate before committing, so a bad write never corrupts stored state.
        codec::decode_raw(self.data_type, bytes)?;
        *self.data.write().unwrap() = bytes.to_vec();
        Ok(())
    }

    /// Decode the current raw value into a typed [`Value`]
    pub fn value(&self) -> Value {
        codec::decode_raw(self.data_type, &self.data.read().unwrap()).expect("stored value always decodes")
    }

    /// Read the physical (scaled) value
    pub fn decode_phys(&self) -> f64 {
        codec::decode_phys(&self.value(), self.factor)
    }

    /// Write a physical (scaled) value, applying rounding for integer types
    pub fn encode_phys(&self, phys_value: f64) -> Result<(), CodecError> {
        let value = codec::encode_phys(self.data_type, phys_value, self.factor);
        let bytes = codec::encode_raw(self.data_type, &value)?;
        *self.data.write().unwrap() = bytes;
        Ok(())
    }

    /// Read the current value's description, if one is registered
    pub fn encode_desc(&self) -> Option<&str> {
        self.value_descriptions
            .get(&self.value().as_i64())
            .map(|s| s.as_str())
    }

    /// Write by description, looking up the matching integer value
    pub fn decode_desc(&self, description: &str) -> Result<(), CodecError> {
        let (&value, _) = self
            .value_descriptions
            .iter()
            .find(|(_, d)| d.as_str() == description)
            .ok_or(CodecError::UnknownDescription {
                value: 0,
            })?;
        let bytes = codec::encode_raw(self.data_type, &Value::Int(value))?;
        *self.data.write().unwrap() = bytes;
        Ok(())
    }

    /// Read a named bit field as a right-justified integer
    pub fn read_bits(&self, name: &str) -> Result<u64, CodecError> {
        let bits = self
            .bit_definitions
            .get(name)
            .ok_or_else(|| CodecError::UnknownBitField { name: name.to_string() })?;
        Ok(codec::read_bits(self.value().as_i64() as u64, bits))
    }

    /// Write a named bit field from a right-justified integer, leaving other bits untouched
    pub fn write_bits(&self, name: &str, value: u64) -> Result<(), CodecError> {
        let bits = self
            .bit_definitions
            .get(name)
            .ok_or_else(|| CodecError::UnknownBitField { name: name.to_string() })?;
        let current = self.value().as_i64() as u64;
        let updated = codec::write_bits(current, bits, value);
        let encoded = codec::encode_raw(self.data_type, &Value::Int(updated as i64))?;
        *self.data.write().unwrap() = encoded;
        Ok(())
    }
}

/// An Object Dictionary entry: a standalone Variable, a heterogeneous Record, or a homogeneous
/// Array.
pub enum Object {
    /// A single leaf value at subindex 0
    Variable(Variable),
    /// A heterogeneous group; subindex 0 holds the member count
    Record(Vec<Variable>),
    /// A homogeneous sequence sharing a template; subindex 0 holds the length
    Array(Vec<Variable>),
}

impl Object {
    /// Find the Variable occupying the given sub-index, if any
    pub fn sub(&self, sub: u8) -> Option<&Variable> {
        match self {
            Object::Variable(v) => (sub == 0).then_some(v),
            Object::Record(vars) | Object::Array(vars) => vars.iter().find(|v| v.subindex == sub),
        }
    }

    /// Count of defined sub-indices (including sub-index 0)
    pub fn len(&self) -> usize {
        match self {
            Object::Variable(_) => 1,
            Object::Record(vars) | Object::Array(vars) => vars.len(),
        }
    }

    /// True if this object has no sub-entries (never true for a well-formed object)
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// The typed, indexed data model every other subsystem reads and writes.
///
/// Constructed once (by code, or eventually from a parsed configuration file) and thereafter
/// treated as read-only by convention: its shape never changes, though the raw bytes behind each
/// Variable do.
#[derive(Default)]
pub struct ObjectDictionary {
    objects: BTreeMap<u16, Object>,
    names: std::collections::HashMap<String, (u16, u8)>,
}

impl ObjectDictionary {
    /// Create an empty dictionary
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a standalone Variable at its own index
    pub fn insert_variable(&mut self, var: Variable) {
        self.names.insert(var.name.clone(), (var.index, var.subindex));
        self.objects.insert(var.index, Object::Variable(var));
    }

    /// Insert a Record: `count` is the read-only subindex-0 count, `members` the subindex 1..N
    /// Variables.
    pub fn insert_record(&mut self, index: u16, count: Variable, members: Vec<Variable>) {
        let mut vars = vec![count];
        for m in &members {
            self.names.insert(m.name.clone(), (index, m.subindex));
        }
        vars.extend(members);
        self.objects.insert(index, Object::Record(vars));
    }

    /// Insert an Array: `length` is the subindex-0 length, `elements` the subindex 1..N Variables
    /// derived from a shared template.
    pub fn insert_array(&mut self, index: u16, length: Variable, elements: Vec<Variable>) {
        let mut vars = vec![length];
        for e in &elements {
            self.names.insert(e.name.clone(), (index, e.subindex));
        }
        vars.extend(elements);
        self.objects.insert(index, Object::Array(vars));
    }

    /// Look up an object by index
    pub fn object(&self, index: u16) -> Option<&Object> {
        self.objects.get(&index)
    }

    /// Look up a Variable by index and sub-index
    pub fn variable(&self, index: u16, sub: u8) -> Result<&Variable, OdError> {
        let obj = self.objects.get(&index).ok_or(OdError::NoSuchObject { index })?;
        obj.sub(sub).ok_or(OdError::NoSuchSubIndex { index, sub })
    }

    /// Look up a Variable's (index, subindex) by its unique name
    pub fn index_by_name(&self, name: &str) -> Option<(u16, u8)> {
        self.names.get(name).copied()
    }

    /// Look up a Variable by its unique name
    pub fn variable_by_name(&self, name: &str) -> Option<&Variable> {
        let (index, sub) = self.index_by_name(name)?;
        self.variable(index, sub).ok()
    }

    /// Read the raw bytes stored at `index:sub`, enforcing the Variable's access type
    pub fn raw_read(&self, index: u16, sub: u8) -> Result<Vec<u8>, OdError> {
        let var = self.variable(index, sub)?;
        if !var.access_type.readable() {
            return Err(OdError::AccessViolation { index, sub, direction: AccessDirection::Read });
        }
        Ok(var.encode_raw())
    }

    /// Write raw bytes to `index:sub`, enforcing the Variable's access type
    pub fn raw_write(&self, index: u16, sub: u8, data: &[u8]) -> Result<(), OdError> {
        let var = self.variable(index, sub)?;
        if !var.access_type.writable() {
            return Err(OdError::AccessViolation { index, sub, direction: AccessDirection::Write });
        }
        var.decode_raw(data).map_err(|source| OdError::Codec { source })
    }

    /// Iterate over every defined index
    pub fn indices(&self) -> impl Iterator<Item = u16> + '_ {
        self.objects.keys().copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn variable_roundtrip() {
        let var = Variable::new(0x1018, 1, "vendor_id", DataType::Unsigned32, AccessType::Ro, Value::Uint(4));
        assert_eq!(var.encode_raw(), 4u32.to_le_bytes());
        var.decode_raw(&9u32.to_le_bytes()).unwrap();
        assert_eq!(var.value(), Value::Uint(9));
    }

    #[test]
    fn access_violation_on_ro_write() {
        let mut od = ObjectDictionary::new();
        od.insert_variable(Variable::new(0x1018, 1, "vendor_id", DataType::Unsigned32, AccessType::Ro, Value::Uint(4)));
        let err = od.raw_write(0x1018, 1, &9u32.to_le_bytes()).unwrap_err();
        assert!(matches!(err, OdError::AccessViolation { direction: AccessDirection::Write, .. }));
    }

    #[test]
    fn access_violation_on_wo_read() {
        let mut od = ObjectDictionary::new();
        od.insert_variable(Variable::new(0x2000, 0, "command", DataType::Unsigned8, AccessType::Wo, Value::Uint(0)));
        let err = od.raw_read(0x2000, 0).unwrap_err();
        assert!(matches!(err, OdError::AccessViolation { direction: AccessDirection::Read, .. }));
    }

    #[test]
    fn bit_field_roundtrip() {
        let var = Variable::new(0x6000, 0, "status", DataType::Unsigned16, AccessType::Rw, Value::Uint(0))
            .with_bit_field("low_nibble", vec![0, 1, 2, 3]);
        var.write_bits("low_nibble", 0b1010).unwrap();
        assert_eq!(var.read_bits("low_nibble").unwrap(), 0b1010);
    }

    #[test]
    fn lookup_by_name() {
        let mut od = ObjectDictionary::new();
        od.insert_variable(Variable::new(0x1017, 0, "producer_heartbeat_time", DataType::Unsigned16, AccessType::Rw, Value::Uint(0)));
        assert_eq!(od.index_by_name("producer_heartbeat_time"), Some((0x1017, 0)));
    }
}
