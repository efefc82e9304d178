//! Node records: the tree data serialized into segments.
//!
//! A node record holds a property map and a child map; children are
//! references to other node records by [`RecordId`], which is what gives
//! snapshots their structural sharing: an unchanged subtree is carried
//! into a new snapshot by reference, never rewritten.

mod builder;
mod rebase;
mod state;

pub use builder::NodeBuilder;
pub use rebase::CONFLICT_NAME;
pub use state::NodeState;

pub(crate) use rebase::rebase_node;

use crate::error::{CoreError, CoreResult};
use crate::types::{RecordId, SegmentId};
use std::collections::BTreeMap;

/// Small binary values are inlined into the node record; anything at or
/// above this size is written to its own bulk segment and referenced.
pub(crate) const INLINE_BINARY_MAX: usize = 4096;

const TAG_STRING: u8 = 1;
const TAG_LONG: u8 = 2;
const TAG_BINARY: u8 = 3;
const TAG_BINARY_REF: u8 = 4;

/// A property value on a node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PropertyValue {
    /// A UTF-8 string.
    String(String),
    /// A 64-bit signed integer.
    Long(i64),
    /// A binary value stored inline in the node record.
    Binary(Vec<u8>),
    /// A large binary value stored in a bulk segment.
    BinaryRef {
        /// Address of the bulk segment holding the value.
        id: RecordId,
        /// Length of the value in bytes.
        len: u64,
    },
}

impl PropertyValue {
    /// Convenience constructor for string values.
    pub fn string(value: impl Into<String>) -> Self {
        Self::String(value.into())
    }
}

/// A decoded node record: properties plus child references.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Node {
    pub(crate) properties: BTreeMap<String, PropertyValue>,
    pub(crate) children: BTreeMap<String, RecordId>,
}

impl Node {
    /// Creates an empty node.
    #[must_use]
    pub fn empty() -> Self {
        Self::default()
    }

    /// Returns the value of the named property.
    #[must_use]
    pub fn property(&self, name: &str) -> Option<&PropertyValue> {
        self.properties.get(name)
    }

    /// Sets a property.
    pub fn set_property(&mut self, name: impl Into<String>, value: PropertyValue) {
        self.properties.insert(name.into(), value);
    }

    /// Removes a property, returning its previous value.
    pub fn remove_property(&mut self, name: &str) -> Option<PropertyValue> {
        self.properties.remove(name)
    }

    /// Returns the record id of the named child, if present.
    #[must_use]
    pub fn child(&self, name: &str) -> Option<RecordId> {
        self.children.get(name).copied()
    }

    /// Sets a child reference.
    pub fn set_child(&mut self, name: impl Into<String>, id: RecordId) {
        self.children.insert(name.into(), id);
    }

    /// Returns the property names in order.
    pub fn property_names(&self) -> impl Iterator<Item = &str> {
        self.properties.keys().map(String::as_str)
    }

    /// Returns the child names in order.
    pub fn child_names(&self) -> impl Iterator<Item = &str> {
        self.children.keys().map(String::as_str)
    }

    /// Returns the number of children.
    #[must_use]
    pub fn child_count(&self) -> usize {
        self.children.len()
    }

    /// Encodes the node into a record payload.
    ///
    /// # Errors
    ///
    /// Returns `InvalidOperation` if a name or value exceeds the format's
    /// length fields.
    pub fn encode(&self) -> CoreResult<Vec<u8>> {
        let mut buf = Vec::new();

        buf.extend_from_slice(&(self.properties.len() as u32).to_le_bytes());
        for (name, value) in &self.properties {
            encode_name(&mut buf, name)?;
            match value {
                PropertyValue::String(s) => {
                    buf.push(TAG_STRING);
                    let len = u32::try_from(s.len()).map_err(|_| {
                        CoreError::invalid_operation("string property too large")
                    })?;
                    buf.extend_from_slice(&len.to_le_bytes());
                    buf.extend_from_slice(s.as_bytes());
                }
                PropertyValue::Long(v) => {
                    buf.push(TAG_LONG);
                    buf.extend_from_slice(&v.to_le_bytes());
                }
                PropertyValue::Binary(bytes) => {
                    buf.push(TAG_BINARY);
                    let len = u32::try_from(bytes.len()).map_err(|_| {
                        CoreError::invalid_operation("inline binary property too large")
                    })?;
                    buf.extend_from_slice(&len.to_le_bytes());
                    buf.extend_from_slice(bytes);
                }
                PropertyValue::BinaryRef { id, len } => {
                    buf.push(TAG_BINARY_REF);
                    buf.extend_from_slice(&id.segment_id.to_bytes());
                    buf.extend_from_slice(&id.offset.to_le_bytes());
                    buf.extend_from_slice(&len.to_le_bytes());
                }
            }
        }

        buf.extend_from_slice(&(self.children.len() as u32).to_le_bytes());
        for (name, id) in &self.children {
            encode_name(&mut buf, name)?;
            buf.extend_from_slice(&id.segment_id.to_bytes());
            buf.extend_from_slice(&id.offset.to_le_bytes());
        }

        Ok(buf)
    }

    /// Decodes a node from a record payload.
    pub fn decode(data: &[u8]) -> CoreResult<Self> {
        let mut reader = Reader::new(data);
        let mut node = Self::empty();

        let property_count = reader.u32()?;
        for _ in 0..property_count {
            let name = reader.name()?;
            let value = match reader.u8()? {
                TAG_STRING => {
                    let len = reader.u32()? as usize;
                    let bytes = reader.take(len)?;
                    let s = std::str::from_utf8(bytes).map_err(|_| {
                        CoreError::segment_corruption("string property is not UTF-8")
                    })?;
                    PropertyValue::String(s.to_string())
                }
                TAG_LONG => PropertyValue::Long(reader.i64()?),
                TAG_BINARY => {
                    let len = reader.u32()? as usize;
                    PropertyValue::Binary(reader.take(len)?.to_vec())
                }
                TAG_BINARY_REF => {
                    let id = reader.record_id()?;
                    let len = reader.u64()?;
                    PropertyValue::BinaryRef { id, len }
                }
                tag => {
                    return Err(CoreError::segment_corruption(format!(
                        "unknown property tag {tag}"
                    )))
                }
            };
            node.properties.insert(name, value);
        }

        let child_count = reader.u32()?;
        for _ in 0..child_count {
            let name = reader.name()?;
            let id = reader.record_id()?;
            node.children.insert(name, id);
        }

        if !reader.is_empty() {
            return Err(CoreError::segment_corruption(format!(
                "trailing bytes in node record: {} left",
                reader.remaining()
            )));
        }

        Ok(node)
    }
}

fn encode_name(buf: &mut Vec<u8>, name: &str) -> CoreResult<()> {
    let len = u16::try_from(name.len())
        .map_err(|_| CoreError::invalid_operation(format!("name too long: {name:.32}...")))?;
    buf.extend_from_slice(&len.to_le_bytes());
    buf.extend_from_slice(name.as_bytes());
    Ok(())
}

/// Cursor over a record payload.
struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn take(&mut self, len: usize) -> CoreResult<&'a [u8]> {
        if self.pos + len > self.data.len() {
            return Err(CoreError::segment_corruption("truncated node record"));
        }
        let slice = &self.data[self.pos..self.pos + len];
        self.pos += len;
        Ok(slice)
    }

    fn u8(&mut self) -> CoreResult<u8> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> CoreResult<u16> {
        let b = self.take(2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    fn u32(&mut self) -> CoreResult<u32> {
        let b = self.take(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn u64(&mut self) -> CoreResult<u64> {
        let b = self.take(8)?;
        Ok(u64::from_le_bytes([
            b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7],
        ]))
    }

    fn i64(&mut self) -> CoreResult<i64> {
        Ok(self.u64()? as i64)
    }

    fn name(&mut self) -> CoreResult<String> {
        let len = self.u16()? as usize;
        let bytes = self.take(len)?;
        std::str::from_utf8(bytes)
            .map(str::to_string)
            .map_err(|_| CoreError::segment_corruption("name is not UTF-8"))
    }

    fn record_id(&mut self) -> CoreResult<RecordId> {
        let id_bytes: [u8; 16] = self
            .take(16)?
            .try_into()
            .map_err(|_| CoreError::segment_corruption("truncated record id"))?;
        let offset = self.u32()?;
        Ok(RecordId::new(SegmentId::from_bytes(id_bytes), offset))
    }

    fn is_empty(&self) -> bool {
        self.pos == self.data.len()
    }

    fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }
}
