use std::io::{Cursor, Read, Write};

use anyhow::{Context as _, Result, bail};
use indexmap::IndexMap;
use serde::Serialize;
use serde_with::serde_as;
use strum::FromRepr;
use tracing::instrument;

use crate::ser::{ReadExt, Readable};

struct Ctx<R: Read> {
    inner: R,
    read: usize,
}
impl<R: Read> Ctx<R> {
    fn new(inner: R) -> Self {
        Self { inner, read: 0 }
    }
}
impl<R: Read> Read for Ctx<R> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        self.inner.read(buf).inspect(|size| self.read += size)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, FromRepr)]
#[repr(u8)]
enum ECbFieldType {
    None = 0x00,
    Null = 0x01,
    Object = 0x02,
    UniformObject = 0x03,
    Array = 0x04,
    UniformArray = 0x05,
    Binary = 0x06,
    String = 0x07,
    IntegerPositive = 0x08,
    IntegerNegative = 0x09,
    Float32 = 0x0a,
    Float64 = 0x0b,
    BoolFalse = 0x0c,
    BoolTrue = 0x0d,
    ObjectAttachment = 0x0e,
    BinaryAttachment = 0x0f,
    Hash = 0x10,
    Uuid = 0x11,
    DateTime = 0x12,
    TimeSpan = 0x13,
    ObjectId = 0x14,
    CustomById = 0x1e,
    CustomByName = 0x1f,
}

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy)]
    struct ECbFieldTypeFlags : u8 {
        const Type = 0b1_1111;
        const Reserved = 0x20;
        const HasFieldType = 0x40;
        const HasFieldName = 0x80;
    }
}
impl Readable for ECbFieldTypeFlags {
    #[instrument(skip_all, name = "ECbFieldType")]
    fn de<S: Read>(stream: &mut S) -> Result<Self> {
        Self::from_bits(stream.de::<u8>()?).context("invalid ECbFieldType")
    }
}
impl ECbFieldTypeFlags {
    fn get_type(self) -> Result<ECbFieldType> {
        ECbFieldType::from_repr(self.bits() & Self::Type.bits()).with_context(|| format!("unknown compact binary field type {:#x}", self.bits()))
    }
    fn has_field_name(self) -> bool {
        self.contains(ECbFieldTypeFlags::HasFieldName)
    }
    fn has_field_type(self) -> bool {
        self.contains(ECbFieldTypeFlags::HasFieldType)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Field {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(flatten)]
    pub value: FieldValue,
}

/// Decoded compact binary value. Uniform containers are folded into their plain counterparts.
#[serde_as]
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum FieldValue {
    Null,
    Object(IndexMap<String, FieldValue>),
    Array(Vec<FieldValue>),
    Binary(#[serde_as(as = "serde_with::hex::Hex")] Vec<u8>),
    String(String),
    IntegerPositive(u64),
    IntegerNegative(i64),
    Float64(f64),
    Bool(bool),
    ObjectAttachment(#[serde_as(as = "serde_with::hex::Hex")] [u8; 20]),
    BinaryAttachment(#[serde_as(as = "serde_with::hex::Hex")] [u8; 20]),
    Hash(#[serde_as(as = "serde_with::hex::Hex")] [u8; 20]),
    ObjectId(#[serde_as(as = "serde_with::hex::Hex")] [u8; 12]),
}
macro_rules! field_accessor {
    ($func_name:ident, $variant:ident, $type:ty) => {
        impl FieldValue {
            pub fn $func_name(&self) -> Option<&$type> {
                match self {
                    FieldValue::$variant(value) => Some(value),
                    _ => None,
                }
            }
        }
    };
}
field_accessor!(as_object, Object, IndexMap<String, FieldValue>);
field_accessor!(as_array, Array, Vec<FieldValue>);
field_accessor!(as_binary, Binary, Vec<u8>);
field_accessor!(as_string, String, String);
field_accessor!(as_hash, Hash, [u8; 20]);

impl FieldValue {
    /// Looks up a named field when this value is an object
    pub fn get(&self, name: &str) -> Option<&FieldValue> {
        self.as_object().and_then(|o| o.get(name))
    }
    pub fn as_u64(&self) -> Option<u64> {
        match *self {
            FieldValue::IntegerPositive(v) => Some(v),
            _ => None,
        }
    }
    pub fn as_u32(&self) -> Option<u32> {
        self.as_u64().and_then(|v| v.try_into().ok())
    }
    pub fn as_i64(&self) -> Option<i64> {
        match *self {
            FieldValue::IntegerPositive(v) => v.try_into().ok(),
            FieldValue::IntegerNegative(v) => Some(v),
            _ => None,
        }
    }
    pub fn as_bool(&self) -> Option<bool> {
        match *self {
            FieldValue::Bool(v) => Some(v),
            _ => None,
        }
    }
    /// Array items, treating an absent field as empty
    pub fn array_or_empty(value: Option<&FieldValue>) -> &[FieldValue] {
        value.and_then(FieldValue::as_array).map(Vec::as_slice).unwrap_or(&[])
    }
}

#[instrument(skip_all)]
fn read_string<S: Read>(stream: &mut S) -> Result<String> {
    let size = read_var_uint(stream)? as usize;
    Ok(String::from_utf8(stream.de_ctx(size)?)?)
}

#[instrument(skip_all)]
pub fn read_compact_binary<S: Read>(stream: &mut S) -> Result<Field> {
    read_field(&mut Ctx::new(stream), ECbFieldTypeFlags::HasFieldType)
}

/// Parses a complete buffer holding a single top level field
pub fn load_compact_binary(data: &[u8]) -> Result<FieldValue> {
    let mut cur = Cursor::new(data);
    let field = read_compact_binary(&mut cur)?;
    if cur.position() as usize != data.len() {
        bail!("trailing data after compact binary field ({} of {} bytes read)", cur.position(), data.len());
    }
    Ok(field.value)
}

#[instrument(skip_all)]
fn read_field<S: Read>(stream: &mut Ctx<S>, mut tag: ECbFieldTypeFlags) -> Result<Field> {
    if tag.has_field_type() {
        tag = stream.de()?;
    }
    let name = if tag.has_field_name() {
        Some(read_string(stream)?)
    } else {
        None
    };

    let read_object = |stream: &mut Ctx<S>, uniform: bool| -> Result<FieldValue> {
        let size = read_var_uint(stream)? as usize;
        let mut fields = IndexMap::new();
        if size > 0 {
            let start = stream.read;
            let tag = if uniform { stream.de()? } else { ECbFieldTypeFlags::HasFieldType };
            while stream.read < start + size {
                let field = read_field(stream, tag)?;
                let name = field.name.context("object field without name")?;
                fields.insert(name, field.value);
            }
        }
        Ok(FieldValue::Object(fields))
    };
    let read_array = |stream: &mut Ctx<S>, uniform: bool| -> Result<FieldValue> {
        let _size = read_var_uint(stream)?;
        let count = read_var_uint(stream)?;
        let tag = if uniform && count > 0 { stream.de()? } else { ECbFieldTypeFlags::HasFieldType };
        let mut fields = vec![];
        for _ in 0..count {
            fields.push(read_field(stream, tag)?.value);
        }
        Ok(FieldValue::Array(fields))
    };

    Ok(Field {
        name,
        value: match tag.get_type()? {
            ECbFieldType::Null => FieldValue::Null,
            ECbFieldType::Object => read_object(stream, false)?,
            ECbFieldType::UniformObject => read_object(stream, true)?,
            ECbFieldType::Array => read_array(stream, false)?,
            ECbFieldType::UniformArray => read_array(stream, true)?,
            ECbFieldType::Binary => {
                let size = read_var_uint(stream)? as usize;
                FieldValue::Binary(stream.de_ctx(size)?)
            }
            ECbFieldType::String => FieldValue::String(read_string(stream)?),
            ECbFieldType::IntegerPositive => FieldValue::IntegerPositive(read_var_uint(stream)?),
            ECbFieldType::IntegerNegative => FieldValue::IntegerNegative(!(read_var_uint(stream)? as i64)),
            ECbFieldType::Float64 => FieldValue::Float64(f64::from_be_bytes(stream.de()?)),
            ECbFieldType::BoolFalse => FieldValue::Bool(false),
            ECbFieldType::BoolTrue => FieldValue::Bool(true),
            ECbFieldType::ObjectAttachment => FieldValue::ObjectAttachment(stream.de()?),
            ECbFieldType::BinaryAttachment => FieldValue::BinaryAttachment(stream.de()?),
            ECbFieldType::Hash => FieldValue::Hash(stream.de()?),
            ECbFieldType::ObjectId => FieldValue::ObjectId(stream.de()?),
            other => bail!("unsupported compact binary field type {other:?}"),
        },
    })
}

struct WriterFrame {
    name: Option<String>,
    value: FieldValue,
}

/// Builds a compact binary document in memory. Fields added inside an object need
/// a name, fields added inside an array must pass an empty name.
#[derive(Default)]
pub struct CbWriter {
    stack: Vec<WriterFrame>,
    root: Option<(Option<String>, FieldValue)>,
}
impl CbWriter {
    pub fn new() -> Self {
        Self::default()
    }
    pub fn begin_object(&mut self, name: &str) {
        self.stack.push(WriterFrame { name: field_name(name), value: FieldValue::Object(IndexMap::new()) });
    }
    pub fn end_object(&mut self) -> Result<()> {
        self.end_container(|v| matches!(v, FieldValue::Object(_)))
    }
    pub fn begin_array(&mut self, name: &str) {
        self.stack.push(WriterFrame { name: field_name(name), value: FieldValue::Array(vec![]) });
    }
    pub fn end_array(&mut self) -> Result<()> {
        self.end_container(|v| matches!(v, FieldValue::Array(_)))
    }
    fn end_container(&mut self, is_kind: impl Fn(&FieldValue) -> bool) -> Result<()> {
        let frame = self.stack.pop().context("end of container without matching begin")?;
        if !is_kind(&frame.value) {
            bail!("mismatched end of container");
        }
        if self.stack.is_empty() {
            if self.root.is_some() {
                bail!("compact binary writer already holds a root field");
            }
            self.root = Some((frame.name, frame.value));
            Ok(())
        } else {
            self.add(frame.name.as_deref().unwrap_or(""), frame.value)
        }
    }
    pub fn add(&mut self, name: &str, value: FieldValue) -> Result<()> {
        let frame = self.stack.last_mut().context("field added outside of any container")?;
        match &mut frame.value {
            FieldValue::Object(fields) => {
                if name.is_empty() {
                    bail!("object field requires a name");
                }
                if fields.insert(name.to_string(), value).is_some() {
                    bail!("duplicate object field {name:?}");
                }
            }
            FieldValue::Array(items) => {
                if !name.is_empty() {
                    bail!("array item {name:?} must not be named");
                }
                items.push(value);
            }
            _ => unreachable!("writer frames are always containers"),
        }
        Ok(())
    }
    pub fn add_string(&mut self, name: &str, value: &str) -> Result<()> {
        self.add(name, FieldValue::String(value.to_string()))
    }
    pub fn add_u64(&mut self, name: &str, value: u64) -> Result<()> {
        self.add(name, FieldValue::IntegerPositive(value))
    }
    pub fn add_bool(&mut self, name: &str, value: bool) -> Result<()> {
        self.add(name, FieldValue::Bool(value))
    }
    pub fn add_hash(&mut self, name: &str, value: [u8; 20]) -> Result<()> {
        self.add(name, FieldValue::Hash(value))
    }
    pub fn add_binary(&mut self, name: &str, value: &[u8]) -> Result<()> {
        self.add(name, FieldValue::Binary(value.to_vec()))
    }
    /// Encodes the finished document
    pub fn save(self) -> Result<Vec<u8>> {
        if !self.stack.is_empty() {
            bail!("compact binary writer has {} unclosed containers", self.stack.len());
        }
        let (name, value) = self.root.context("compact binary writer is empty")?;
        let mut out = vec![];
        write_field(&mut out, name.as_deref(), &value, true)?;
        Ok(out)
    }
}

fn field_name(name: &str) -> Option<String> {
    (!name.is_empty()).then(|| name.to_string())
}

fn field_type(value: &FieldValue) -> ECbFieldType {
    match value {
        FieldValue::Null => ECbFieldType::Null,
        FieldValue::Object(_) => ECbFieldType::Object,
        FieldValue::Array(_) => ECbFieldType::Array,
        FieldValue::Binary(_) => ECbFieldType::Binary,
        FieldValue::String(_) => ECbFieldType::String,
        FieldValue::IntegerPositive(_) => ECbFieldType::IntegerPositive,
        FieldValue::IntegerNegative(_) => ECbFieldType::IntegerNegative,
        FieldValue::Float64(_) => ECbFieldType::Float64,
        FieldValue::Bool(false) => ECbFieldType::BoolFalse,
        FieldValue::Bool(true) => ECbFieldType::BoolTrue,
        FieldValue::ObjectAttachment(_) => ECbFieldType::ObjectAttachment,
        FieldValue::BinaryAttachment(_) => ECbFieldType::BinaryAttachment,
        FieldValue::Hash(_) => ECbFieldType::Hash,
        FieldValue::ObjectId(_) => ECbFieldType::ObjectId,
    }
}

#[instrument(skip_all)]
fn write_field<W: Write>(out: &mut W, name: Option<&str>, value: &FieldValue, with_type: bool) -> Result<()> {
    if with_type {
        let mut tag = field_type(value) as u8;
        if name.is_some() {
            tag |= ECbFieldTypeFlags::HasFieldName.bits();
        }
        out.write_all(&[tag])?;
    }
    if let Some(name) = name {
        write_var_uint(out, name.len() as u64)?;
        out.write_all(name.as_bytes())?;
    }
    match value {
        FieldValue::Null | FieldValue::Bool(_) => {}
        FieldValue::Object(fields) => {
            let mut payload = vec![];
            for (name, field) in fields {
                write_field(&mut payload, Some(name), field, true)?;
            }
            write_var_uint(out, payload.len() as u64)?;
            out.write_all(&payload)?;
        }
        FieldValue::Array(items) => {
            let mut payload = vec![];
            write_var_uint(&mut payload, items.len() as u64)?;
            for item in items {
                write_field(&mut payload, None, item, true)?;
            }
            write_var_uint(out, payload.len() as u64)?;
            out.write_all(&payload)?;
        }
        FieldValue::Binary(data) => {
            write_var_uint(out, data.len() as u64)?;
            out.write_all(data)?;
        }
        FieldValue::String(s) => {
            write_var_uint(out, s.len() as u64)?;
            out.write_all(s.as_bytes())?;
        }
        FieldValue::IntegerPositive(v) => write_var_uint(out, *v)?,
        FieldValue::IntegerNegative(v) => write_var_uint(out, !*v as u64)?,
        FieldValue::Float64(v) => out.write_all(&v.to_be_bytes())?,
        FieldValue::ObjectAttachment(h) | FieldValue::BinaryAttachment(h) | FieldValue::Hash(h) => out.write_all(h)?,
        FieldValue::ObjectId(id) => out.write_all(id)?,
    }
    Ok(())
}


pub use varint::*;
mod varint {
    use super::*;

    #[instrument(skip_all)]
    pub fn read_var_uint<S: Read>(stream: &mut S) -> Result<u64> {
        let lead: u8 = stream.de()?;
        let byte_count = lead.leading_ones();

        let mut value = (lead & (0xff_u16 >> byte_count) as u8) as u64;
        for _ in 0..byte_count {
            value <<= 8;
            value |= stream.de::<u8>()? as u64;
        }
        Ok(value)
    }

    pub fn measure_var_uint(value: u64) -> usize {
        if value == 0 { 1 } else { ((63 - value.leading_zeros()) / 7 + 1).min(9) as usize }
    }

    pub fn write_var_uint<W: Write>(stream: &mut W, mut value: u64) -> Result<()> {
        let byte_count = measure_var_uint(value);
        let mut buf = [0u8; 9];
        for i in (1..byte_count).rev() {
            buf[i] = value as u8;
            value >>= 8;
        }
        buf[0] = (0xff_u16 << (9 - byte_count)) as u8 | value as u8;
        stream.write_all(&buf[..byte_count])?;
        Ok(())
    }

}
