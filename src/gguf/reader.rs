//! Bounds-checked GGUF header walker
//!
//! Every read checks `offset + size <= len` before touching the buffer, so a
//! truncated or corrupted file simply ends the walk. Values are decoded lazily:
//! a walked entry only records the byte span of its payload.

use std::borrow::Cow;

/// ASCII magic at offset 0 of every GGUF file
pub const GGUF_MAGIC: &[u8; 4] = b"GGUF";

/// Nested arrays deeper than this are treated as malformed.
const MAX_ARRAY_DEPTH: u32 = 4;

/// GGML caps tensors at 4 dimensions; anything far beyond that is garbage.
const MAX_TENSOR_DIMS: u32 = 16;

/// GGUF metadata value types (tag values from `gguf.h`)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueType {
    U8,
    I8,
    U16,
    I16,
    U32,
    I32,
    F32,
    Bool,
    String,
    Array,
    U64,
    I64,
    F64,
}

impl ValueType {
    pub fn from_tag(tag: u32) -> Option<Self> {
        Some(match tag {
            0 => Self::U8,
            1 => Self::I8,
            2 => Self::U16,
            3 => Self::I16,
            4 => Self::U32,
            5 => Self::I32,
            6 => Self::F32,
            7 => Self::Bool,
            8 => Self::String,
            9 => Self::Array,
            10 => Self::U64,
            11 => Self::I64,
            12 => Self::F64,
            _ => return None,
        })
    }

    /// Encoded size of a fixed-width value, `None` for strings and arrays.
    pub fn scalar_size(self) -> Option<usize> {
        match self {
            Self::U8 | Self::I8 | Self::Bool => Some(1),
            Self::U16 | Self::I16 => Some(2),
            Self::U32 | Self::I32 | Self::F32 => Some(4),
            Self::U64 | Self::I64 | Self::F64 => Some(8),
            Self::String | Self::Array => None,
        }
    }
}

/// Sequential little-endian reader over a byte slice
#[derive(Debug, Clone)]
pub(crate) struct Cursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    pub(crate) fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    pub(crate) fn position(&self) -> usize {
        self.pos
    }

    pub(crate) fn take(&mut self, len: usize) -> Option<&'a [u8]> {
        let end = self.pos.checked_add(len)?;
        let bytes = self.buf.get(self.pos..end)?;
        self.pos = end;
        Some(bytes)
    }

    fn skip(&mut self, len: u64) -> Option<()> {
        self.take(usize::try_from(len).ok()?).map(|_| ())
    }

    fn read_array<const N: usize>(&mut self) -> Option<[u8; N]> {
        self.take(N)?.try_into().ok()
    }

    pub(crate) fn read_u32(&mut self) -> Option<u32> {
        self.read_array().map(u32::from_le_bytes)
    }

    pub(crate) fn read_u64(&mut self) -> Option<u64> {
        self.read_array().map(u64::from_le_bytes)
    }

    /// u64 length prefix followed by that many bytes
    fn read_string(&mut self) -> Option<&'a [u8]> {
        let len = self.read_u64()?;
        self.take(usize::try_from(len).ok()?)
    }

    fn read_value(&mut self, ty: ValueType, depth: u32) -> Option<Value<'a>> {
        match ty {
            ValueType::String => self.read_string().map(Value::Str),
            ValueType::Array => {
                if depth >= MAX_ARRAY_DEPTH {
                    return None;
                }
                let elem = ValueType::from_tag(self.read_u32()?)?;
                let len = self.read_u64()?;
                let start = self.pos;
                self.skip_elements(elem, len, depth + 1)?;
                Some(Value::Array(ArrayValue {
                    elem,
                    len,
                    depth: depth + 1,
                    data: self.buf.get(start..self.pos)?,
                }))
            }
            scalar => {
                let size = scalar.scalar_size()?;
                self.take(size).map(|bytes| Value::Scalar(scalar, bytes))
            }
        }
    }

    /// Advance over `count` array elements. Strings and nested arrays carry
    /// their own length prefixes and are walked one element at a time.
    fn skip_elements(&mut self, elem: ValueType, count: u64, depth: u32) -> Option<()> {
        match elem.scalar_size() {
            Some(size) => self.skip(count.checked_mul(size as u64)?),
            None => {
                for _ in 0..count {
                    self.read_value(elem, depth)?;
                }
                Some(())
            }
        }
    }
}

/// A lazily decoded metadata value borrowing from the file buffer
#[derive(Debug, Clone, Copy)]
pub enum Value<'a> {
    Scalar(ValueType, &'a [u8]),
    Str(&'a [u8]),
    Array(ArrayValue<'a>),
}

impl<'a> Value<'a> {
    pub fn value_type(&self) -> ValueType {
        match self {
            Value::Scalar(ty, _) => *ty,
            Value::Str(_) => ValueType::String,
            Value::Array(_) => ValueType::Array,
        }
    }

    /// Integer scalars as u64; negative signed values and floats yield `None`.
    pub fn as_u64(&self) -> Option<u64> {
        let Value::Scalar(ty, bytes) = *self else {
            return None;
        };
        match ty {
            ValueType::U8 => bytes.first().map(|b| u64::from(*b)),
            ValueType::I8 => u64::try_from(i8::from_le_bytes(bytes.try_into().ok()?)).ok(),
            ValueType::U16 => Some(u64::from(u16::from_le_bytes(bytes.try_into().ok()?))),
            ValueType::I16 => u64::try_from(i16::from_le_bytes(bytes.try_into().ok()?)).ok(),
            ValueType::U32 => Some(u64::from(u32::from_le_bytes(bytes.try_into().ok()?))),
            ValueType::I32 => u64::try_from(i32::from_le_bytes(bytes.try_into().ok()?)).ok(),
            ValueType::U64 => Some(u64::from_le_bytes(bytes.try_into().ok()?)),
            ValueType::I64 => u64::try_from(i64::from_le_bytes(bytes.try_into().ok()?)).ok(),
            _ => None,
        }
    }

    pub fn as_u32(&self) -> Option<u32> {
        self.as_u64().and_then(|v| u32::try_from(v).ok())
    }

    pub fn as_bool(&self) -> Option<bool> {
        match *self {
            Value::Scalar(ValueType::Bool, bytes) => bytes.first().map(|b| *b != 0),
            _ => None,
        }
    }

    /// String payload, with invalid UTF-8 replaced.
    pub fn as_str(&self) -> Option<Cow<'a, str>> {
        match *self {
            Value::Str(bytes) => Some(String::from_utf8_lossy(bytes)),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<ArrayValue<'a>> {
        match *self {
            Value::Array(array) => Some(array),
            _ => None,
        }
    }

    /// A scalar as u32, or the largest integer element of an array.
    pub fn max_u32(&self) -> Option<u32> {
        match self {
            Value::Array(array) => array.iter().filter_map(|v| v.as_u32()).max(),
            other => other.as_u32(),
        }
    }
}

/// Array payload: element type, element count and the exact element bytes
#[derive(Debug, Clone, Copy)]
pub struct ArrayValue<'a> {
    elem: ValueType,
    len: u64,
    depth: u32,
    data: &'a [u8],
}

impl<'a> ArrayValue<'a> {
    pub fn element_type(&self) -> ValueType {
        self.elem
    }

    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn iter(&self) -> ArrayIter<'a> {
        ArrayIter {
            cursor: Cursor::new(self.data),
            elem: self.elem,
            depth: self.depth,
            remaining: self.len,
        }
    }

    /// String elements, skipping anything that is not a string.
    pub fn strings(&self) -> impl Iterator<Item = Cow<'a, str>> + 'a {
        self.iter().filter_map(|v| v.as_str())
    }
}

pub struct ArrayIter<'a> {
    cursor: Cursor<'a>,
    elem: ValueType,
    depth: u32,
    remaining: u64,
}

impl<'a> Iterator for ArrayIter<'a> {
    type Item = Value<'a>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.remaining == 0 {
            return None;
        }
        self.remaining -= 1;
        let value = self.cursor.read_value(self.elem, self.depth);
        if value.is_none() {
            self.remaining = 0;
        }
        value
    }
}

/// Fixed-size file header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GgufHeader {
    pub version: u32,
    pub tensor_count: u64,
    pub kv_count: u64,
}

impl GgufHeader {
    pub fn parse(buf: &[u8]) -> Option<Self> {
        GgufReader::new(buf).map(|reader| reader.header)
    }
}

/// Entry point for walking a GGUF buffer from offset 0
#[derive(Debug, Clone)]
pub struct GgufReader<'a> {
    buf: &'a [u8],
    header: GgufHeader,
    kv_offset: usize,
}

impl<'a> GgufReader<'a> {
    /// Validate the magic and read the header; `None` if the buffer is not GGUF.
    pub fn new(buf: &'a [u8]) -> Option<Self> {
        let mut cursor = Cursor::new(buf);
        if cursor.take(GGUF_MAGIC.len())? != GGUF_MAGIC {
            return None;
        }
        let header = GgufHeader {
            version: cursor.read_u32()?,
            tensor_count: cursor.read_u64()?,
            kv_count: cursor.read_u64()?,
        };
        Some(Self {
            buf,
            header,
            kv_offset: cursor.position(),
        })
    }

    pub fn header(&self) -> &GgufHeader {
        &self.header
    }

    pub fn kvs(&self) -> KvWalker<'a> {
        let mut cursor = Cursor::new(self.buf);
        cursor.pos = self.kv_offset;
        KvWalker {
            cursor,
            remaining: self.header.kv_count,
            tensor_count: self.header.tensor_count,
            failed: false,
        }
    }

    /// Walk the whole KV section and return the tensor directory behind it.
    pub fn tensors(&self) -> Option<TensorWalker<'a>> {
        let mut kvs = self.kvs();
        kvs.by_ref().for_each(drop);
        kvs.into_tensors()
    }
}

/// One metadata entry
#[derive(Debug, Clone)]
pub struct KvEntry<'a> {
    pub key: Cow<'a, str>,
    pub value: Value<'a>,
}

/// Iterator over the KV section. Stops early, and records the failure, on the
/// first entry that does not fit in the buffer.
#[derive(Debug, Clone)]
pub struct KvWalker<'a> {
    cursor: Cursor<'a>,
    remaining: u64,
    tensor_count: u64,
    failed: bool,
}

impl<'a> KvWalker<'a> {
    /// True once every declared entry was walked without a bounds violation.
    pub fn completed(&self) -> bool {
        self.remaining == 0 && !self.failed
    }

    pub fn failed(&self) -> bool {
        self.failed
    }

    /// Byte offset of the cursor, i.e. the end of the last walked entry.
    pub fn offset(&self) -> usize {
        self.cursor.position()
    }

    /// Continue into the tensor directory. Requires a completed KV walk.
    pub fn into_tensors(self) -> Option<TensorWalker<'a>> {
        if !self.completed() {
            return None;
        }
        Some(TensorWalker {
            cursor: self.cursor,
            remaining: self.tensor_count,
            failed: false,
        })
    }

    fn read_entry(&mut self) -> Option<KvEntry<'a>> {
        let key = self.cursor.read_string()?;
        let ty = ValueType::from_tag(self.cursor.read_u32()?)?;
        let value = self.cursor.read_value(ty, 0)?;
        Some(KvEntry {
            key: String::from_utf8_lossy(key),
            value,
        })
    }
}

impl<'a> Iterator for KvWalker<'a> {
    type Item = KvEntry<'a>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.remaining == 0 || self.failed {
            return None;
        }
        match self.read_entry() {
            Some(entry) => {
                self.remaining -= 1;
                Some(entry)
            }
            None => {
                self.failed = true;
                None
            }
        }
    }
}

/// One tensor directory record
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TensorInfo<'a> {
    pub name: Cow<'a, str>,
    pub dims: Vec<u64>,
    pub dtype: u32,
    pub offset: u64,
}

#[derive(Debug, Clone)]
pub struct TensorWalker<'a> {
    cursor: Cursor<'a>,
    remaining: u64,
    failed: bool,
}

impl<'a> TensorWalker<'a> {
    pub fn completed(&self) -> bool {
        self.remaining == 0 && !self.failed
    }

    pub fn failed(&self) -> bool {
        self.failed
    }

    fn read_tensor(&mut self) -> Option<TensorInfo<'a>> {
        let name = self.cursor.read_string()?;
        let n_dims = self.cursor.read_u32()?;
        if n_dims > MAX_TENSOR_DIMS {
            return None;
        }
        let mut dims = Vec::new();
        for _ in 0..n_dims {
            dims.push(self.cursor.read_u64()?);
        }
        Some(TensorInfo {
            name: String::from_utf8_lossy(name),
            dims,
            dtype: self.cursor.read_u32()?,
            offset: self.cursor.read_u64()?,
        })
    }
}

impl<'a> Iterator for TensorWalker<'a> {
    type Item = TensorInfo<'a>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.remaining == 0 || self.failed {
            return None;
        }
        match self.read_tensor() {
            Some(tensor) => {
                self.remaining -= 1;
                Some(tensor)
            }
            None => {
                self.failed = true;
                None
            }
        }
    }
}

/// Quick magic check without walking anything else.
pub fn is_gguf(buf: &[u8]) -> bool {
    buf.starts_with(GGUF_MAGIC)
}
