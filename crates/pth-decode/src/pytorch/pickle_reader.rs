//! Just enough pickle support to be able to read PyTorch checkpoints.
//!
//! This is a scoped interpreter for the pickle virtual machine (protocols 0 to 5). It never
//! imports anything: `GLOBAL` opcodes are classified through [`GlobalKind::lookup`] and
//! calls to the three structural PyTorch callables build local stand-ins (storage,
//! tensor, rebuild function). Every other call is kept as an inert [`Object::Reduce`].
//!
//! Persistent ids are handed to a [`PersistentLoader`], which decides how storages are
//! resolved.
use std::borrow::Cow;
use std::collections::HashMap;
use std::io::{self, BufRead, Cursor, Read};
use std::rc::Rc;

use byteorder::{BigEndian, LittleEndian, ReadBytesExt};
use serde::{Deserialize, Serialize};

use super::storage::StorageRecord;
use super::tensor::TensorRecord;

/// Error type for pickle operations
#[derive(Debug, thiserror::Error)]
pub enum PickleError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Invalid pickle opcode: 0x{0:02x} - the file may be corrupted")]
    InvalidOpCode(u8),

    #[error("Invalid or unsupported pickle protocol version: {0}. Supported versions are 0-5.")]
    InvalidProtocol(u8),

    #[error("Unexpected pickle opcode {0:?} in current context")]
    UnexpectedOpCode(OpCode),

    #[error("Invalid data in pickle file: {0}")]
    InvalidData(String),

    #[error("Pickle data was truncated: needed {needed} bytes, {remaining} remaining")]
    Truncated { needed: usize, remaining: usize },

    #[error("String payload is not valid {encoding}")]
    Encoding { encoding: StringEncoding },

    #[error("Pickle stack underflow - the file may be corrupted")]
    StackUnderflow,

    #[error("Pickle mark not found - the file may be corrupted")]
    MarkNotFound,

    #[error("Pickle memo reference {0} not found - the file may be corrupted")]
    MemoNotFound(u32),
}

type Result<T> = std::result::Result<T, PickleError>;

// https://github.com/python/cpython/blob/main/Lib/pickletools.py
#[repr(u8)]
#[derive(Debug, Eq, PartialEq, Clone, Copy)]
pub enum OpCode {
    Mark = b'(',
    Stop = b'.',
    Pop = b'0',
    PopMark = b'1',
    Dup = b'2',
    Float = b'F',
    Int = b'I',
    BinInt = b'J',
    BinInt1 = b'K',
    Long = b'L',
    BinInt2 = b'M',
    None = b'N',
    PersId = b'P',
    BinPersId = b'Q',
    Reduce = b'R',
    String = b'S',
    BinString = b'T',
    ShortBinString = b'U',
    Unicode = b'V',
    BinUnicode = b'X',
    Append = b'a',
    Build = b'b',
    Global = b'c',
    Dict = b'd',
    EmptyDict = b'}',
    Appends = b'e',
    Get = b'g',
    BinGet = b'h',
    LongBinGet = b'j',
    List = b'l',
    EmptyList = b']',
    Put = b'p',
    BinPut = b'q',
    LongBinPut = b'r',
    SetItem = b's',
    Tuple = b't',
    EmptyTuple = b')',
    SetItems = b'u',
    BinFloat = b'G',
    BinBytes = b'B',
    ShortBinBytes = b'C',
    Proto = 0x80,
    NewObj = 0x81,
    Tuple1 = 0x85,
    Tuple2 = 0x86,
    Tuple3 = 0x87,
    NewTrue = 0x88,
    NewFalse = 0x89,
    Long1 = 0x8a,
    Long4 = 0x8b,
    ShortBinUnicode = 0x8c,
    BinUnicode8 = 0x8d,
    BinBytes8 = 0x8e,
    EmptySet = 0x8f,
    AddItems = 0x90,
    FrozenSet = 0x91,
    StackGlobal = 0x93,
    Memoize = 0x94,
    Frame = 0x95,
    ByteArray8 = 0x96,
}

impl TryFrom<u8> for OpCode {
    type Error = u8;
    fn try_from(value: u8) -> std::result::Result<Self, Self::Error> {
        Ok(match value {
            b'(' => Self::Mark,
            b'.' => Self::Stop,
            b'0' => Self::Pop,
            b'1' => Self::PopMark,
            b'2' => Self::Dup,
            b'F' => Self::Float,
            b'I' => Self::Int,
            b'J' => Self::BinInt,
            b'K' => Self::BinInt1,
            b'L' => Self::Long,
            b'M' => Self::BinInt2,
            b'N' => Self::None,
            b'P' => Self::PersId,
            b'Q' => Self::BinPersId,
            b'R' => Self::Reduce,
            b'S' => Self::String,
            b'T' => Self::BinString,
            b'U' => Self::ShortBinString,
            b'V' => Self::Unicode,
            b'X' => Self::BinUnicode,
            b'a' => Self::Append,
            b'b' => Self::Build,
            b'c' => Self::Global,
            b'd' => Self::Dict,
            b'}' => Self::EmptyDict,
            b'e' => Self::Appends,
            b'g' => Self::Get,
            b'h' => Self::BinGet,
            b'j' => Self::LongBinGet,
            b'l' => Self::List,
            b']' => Self::EmptyList,
            b'p' => Self::Put,
            b'q' => Self::BinPut,
            b'r' => Self::LongBinPut,
            b's' => Self::SetItem,
            b't' => Self::Tuple,
            b')' => Self::EmptyTuple,
            b'u' => Self::SetItems,
            b'G' => Self::BinFloat,
            b'B' => Self::BinBytes,
            b'C' => Self::ShortBinBytes,
            0x80 => Self::Proto,
            0x81 => Self::NewObj,
            0x85 => Self::Tuple1,
            0x86 => Self::Tuple2,
            0x87 => Self::Tuple3,
            0x88 => Self::NewTrue,
            0x89 => Self::NewFalse,
            0x8a => Self::Long1,
            0x8b => Self::Long4,
            0x8c => Self::ShortBinUnicode,
            0x8d => Self::BinUnicode8,
            0x8e => Self::BinBytes8,
            0x8f => Self::EmptySet,
            0x90 => Self::AddItems,
            0x91 => Self::FrozenSet,
            0x93 => Self::StackGlobal,
            0x94 => Self::Memoize,
            0x95 => Self::Frame,
            0x96 => Self::ByteArray8,
            value => return Err(value),
        })
    }
}

/// How Python 2 `str` payloads (`STRING`, `BINSTRING`, `SHORT_BINSTRING`) are decoded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StringEncoding {
    /// Every byte maps to the code point of the same value; never fails.
    Latin1,
    /// Bytes above 0x7f are rejected.
    Ascii,
    /// Payloads are kept as raw bytes.
    Bytes,
}

impl std::fmt::Display for StringEncoding {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Latin1 => "latin1",
            Self::Ascii => "ascii",
            Self::Bytes => "bytes",
        })
    }
}

impl StringEncoding {
    fn decode(self, data: Vec<u8>) -> Result<Object> {
        match self {
            Self::Latin1 => Ok(Object::String(data.iter().map(|&b| b as char).collect())),
            Self::Ascii => {
                if data.is_ascii() {
                    Ok(Object::String(data.iter().map(|&b| b as char).collect()))
                } else {
                    Err(PickleError::Encoding { encoding: self })
                }
            }
            Self::Bytes => Ok(Object::Bytes(data)),
        }
    }
}

/// What a `GLOBAL` reference turns into when called.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GlobalKind {
    /// `torch.*Storage`
    Storage,
    /// `torch.Tensor` and friends
    Tensor,
    /// `torch._utils._rebuild_tensor_v2`
    RebuildTensor,
    /// `torch._utils._rebuild_parameter`
    RebuildParameter,
    /// `torch._tensor._rebuild_from_type_v2`
    RebuildFromType,
    /// `collections.OrderedDict`
    OrderedDict,
    /// Anything else; calls are recorded, never executed.
    Other,
}

impl GlobalKind {
    pub fn lookup(module: &str, name: &str) -> Self {
        if module.starts_with("torch") {
            if name.ends_with("Storage") {
                Self::Storage
            } else if matches!(name, "Tensor" | "Parameter" | "LongTensor" | "FloatTensor") {
                Self::Tensor
            } else if matches!(name, "_rebuild_tensor_v2" | "_rebuild_tensor") {
                Self::RebuildTensor
            } else if name == "_rebuild_parameter" {
                Self::RebuildParameter
            } else if name == "_rebuild_from_type_v2" {
                Self::RebuildFromType
            } else {
                Self::Other
            }
        } else if module == "collections" && name == "OrderedDict" {
            Self::OrderedDict
        } else {
            Self::Other
        }
    }
}

/// A `module.name` reference pushed by `GLOBAL` / `STACK_GLOBAL`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Global {
    pub module: String,
    pub name: String,
    pub kind: GlobalKind,
}

impl Global {
    pub fn new(module: impl Into<String>, name: impl Into<String>) -> Self {
        let module = module.into();
        let name = name.into();
        let kind = GlobalKind::lookup(&module, &name);
        Self { module, name, kind }
    }
}

impl std::fmt::Display for Global {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.module, self.name)
    }
}

#[derive(Debug, Clone)]
pub enum Object {
    Global(Global),
    String(String),
    Bytes(Vec<u8>),
    Int(i64),
    /// Integer that does not fit `i64`, as little-endian two's complement.
    Long(Vec<u8>),
    Float(f64),
    Bool(bool),
    None,
    Tuple(Vec<Object>),
    List(Vec<Object>),
    /// Key/value pairs in insertion order.
    Dict(Vec<(Object, Object)>),
    Storage(Rc<StorageRecord>),
    Tensor(TensorRecord),
    Reduce {
        callable: Box<Object>,
        args: Box<Object>,
    },
    Build {
        object: Box<Object>,
        state: Box<Object>,
    },
}

impl Object {
    /// Text content of a string, or of bytes that happen to be UTF-8.
    pub fn as_text(&self) -> Option<Cow<'_, str>> {
        match self {
            Object::String(s) => Some(Cow::Borrowed(s.as_str())),
            Object::Bytes(b) => std::str::from_utf8(b).ok().map(Cow::Borrowed),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Object::Int(i) => Some(*i),
            Object::Bool(b) => Some(*b as i64),
            _ => None,
        }
    }

    /// Name of the variant, for diagnostics.
    pub fn type_name(&self) -> &'static str {
        match self {
            Object::Global(_) => "global",
            Object::String(_) => "str",
            Object::Bytes(_) => "bytes",
            Object::Int(_) | Object::Long(_) => "int",
            Object::Float(_) => "float",
            Object::Bool(_) => "bool",
            Object::None => "None",
            Object::Tuple(_) => "tuple",
            Object::List(_) => "list",
            Object::Dict(_) => "dict",
            Object::Storage(_) => "storage",
            Object::Tensor(_) => "tensor",
            Object::Reduce { .. } => "reduce",
            Object::Build { .. } => "build",
        }
    }

    fn same_key(&self, other: &Object) -> bool {
        match (self, other) {
            (Object::String(a), Object::String(b)) => a == b,
            (Object::Bytes(a), Object::Bytes(b)) => a == b,
            (Object::Int(a), Object::Int(b)) => a == b,
            (Object::Bool(a), Object::Bool(b)) => a == b,
            (Object::None, Object::None) => true,
            _ => false,
        }
    }
}

fn dict_insert(entries: &mut Vec<(Object, Object)>, key: Object, value: Object) {
    match entries.iter_mut().find(|(k, _)| k.same_key(&key)) {
        Some(entry) => entry.1 = value,
        None => entries.push((key, value)),
    }
}

/// Resolves persistent ids (`PERSID`, `BINPERSID`) during replay.
pub trait PersistentLoader {
    fn persistent_load(&mut self, pid: Object) -> Result<Object>;
}

fn tuple_items(args: Object) -> Vec<Object> {
    match args {
        Object::Tuple(items) | Object::List(items) => items,
        Object::None => Vec::new(),
        other => vec![other],
    }
}

fn int_list(obj: &Object, what: &str) -> Result<Vec<i64>> {
    match obj {
        Object::Tuple(items) | Object::List(items) => items
            .iter()
            .map(|item| {
                item.as_int().ok_or_else(|| {
                    PickleError::InvalidData(format!(
                        "{what} must contain ints, found {}",
                        item.type_name()
                    ))
                })
            })
            .collect(),
        other => Err(PickleError::InvalidData(format!(
            "{what} must be a tuple, found {}",
            other.type_name()
        ))),
    }
}

fn shape_of(obj: &Object) -> Result<Vec<usize>> {
    int_list(obj, "shape")?
        .into_iter()
        .map(|dim| {
            usize::try_from(dim)
                .map_err(|_| PickleError::InvalidData(format!("negative dimension {dim}")))
        })
        .collect()
}

/// Builds a tensor stand-in from `(storage, offset, shape, stride, requires_grad, ...)`.
fn rebuild_tensor(args: Object) -> Result<Object> {
    let args = tuple_items(args);
    if args.len() < 4 {
        return Err(PickleError::InvalidData(format!(
            "rebuild_tensor: expected at least 4 args, got {}",
            args.len()
        )));
    }

    let storage = match &args[0] {
        Object::Storage(storage) => Some(storage.clone()),
        _ => None,
    };
    let storage_offset = args[1]
        .as_int()
        .and_then(|offset| usize::try_from(offset).ok())
        .unwrap_or(0);
    let shape = shape_of(&args[2])?;
    // The stride is kept for fidelity only; storages are read row-major.
    let stride = int_list(&args[3], "stride").unwrap_or_default();
    let requires_grad = matches!(args.get(4), Some(Object::Bool(true)));

    Ok(Object::Tensor(TensorRecord::new(
        storage,
        storage_offset,
        shape,
        stride,
        requires_grad,
    )))
}

/// `Tensor(storage=None, storage_offset=0, size=None, stride=None, requires_grad=False)`
fn construct_tensor(args: Object) -> Result<Object> {
    let args = tuple_items(args);
    let storage = match args.first() {
        Some(Object::Storage(storage)) => Some(storage.clone()),
        _ => None,
    };
    let storage_offset = args
        .get(1)
        .and_then(Object::as_int)
        .and_then(|offset| usize::try_from(offset).ok())
        .unwrap_or(0);
    let shape = match args.get(2) {
        Some(Object::None) | None => Vec::new(),
        Some(shape) => shape_of(shape)?,
    };
    let stride = args
        .get(3)
        .and_then(|stride| int_list(stride, "stride").ok())
        .unwrap_or_default();
    let requires_grad = matches!(args.get(4), Some(Object::Bool(true)));

    Ok(Object::Tensor(TensorRecord::new(
        storage,
        storage_offset,
        shape,
        stride,
        requires_grad,
    )))
}

/// Applies `callable` to `args` the way the pickled program would, using stand-ins.
fn call(callable: Object, args: Object) -> Result<Object> {
    let global = match &callable {
        Object::Global(global) => global.clone(),
        _ => {
            return Ok(Object::Reduce {
                callable: Box::new(callable),
                args: Box::new(args),
            });
        }
    };

    match global.kind {
        GlobalKind::RebuildTensor => rebuild_tensor(args),
        GlobalKind::Tensor => construct_tensor(args),
        GlobalKind::Storage => {
            let id = tuple_items(args)
                .first()
                .and_then(|id| id.as_text().map(|id| id.into_owned()))
                .unwrap_or_default();
            let element_type = super::storage::ElementType::from_storage_tag(&global.name);
            Ok(Object::Storage(Rc::new(StorageRecord::unresolved(
                id,
                element_type,
            ))))
        }
        GlobalKind::RebuildParameter => {
            // (data, requires_grad, backward_hooks)
            let data = tuple_items(args).into_iter().next().ok_or_else(|| {
                PickleError::InvalidData("rebuild_parameter: empty args".to_string())
            })?;
            Ok(data)
        }
        GlobalKind::RebuildFromType => {
            // (func, new_type, args, state)
            let mut items = tuple_items(args).into_iter();
            let func = items.next().ok_or_else(|| {
                PickleError::InvalidData("rebuild_from_type_v2: empty args".to_string())
            })?;
            let inner = items.nth(1).unwrap_or(Object::Tuple(Vec::new()));
            call(func, inner)
        }
        GlobalKind::OrderedDict => {
            let mut entries = Vec::new();
            if let Some(Object::List(pairs)) = tuple_items(args).into_iter().next() {
                for pair in pairs {
                    if let Object::Tuple(mut kv) | Object::List(mut kv) = pair
                        && kv.len() == 2
                    {
                        let value = kv.pop().unwrap_or(Object::None);
                        let key = kv.pop().unwrap_or(Object::None);
                        dict_insert(&mut entries, key, value);
                    }
                }
            }
            Ok(Object::Dict(entries))
        }
        GlobalKind::Other => Ok(Object::Reduce {
            callable: Box::new(callable),
            args: Box::new(args),
        }),
    }
}

fn decode_long(data: &[u8]) -> Object {
    if data.is_empty() {
        return Object::Int(0);
    }
    if data.len() > 8 {
        return Object::Long(data.to_vec());
    }
    let negative = data[data.len() - 1] & 0x80 != 0;
    let mut bytes = if negative { [0xffu8; 8] } else { [0u8; 8] };
    bytes[..data.len()].copy_from_slice(data);
    Object::Int(i64::from_le_bytes(bytes))
}

/// Undoes Python's `repr` escaping for protocol 0 `STRING` payloads.
fn unescape(data: &[u8]) -> Result<Vec<u8>> {
    let mut out = Vec::with_capacity(data.len());
    let mut iter = data.iter().copied();
    while let Some(b) = iter.next() {
        if b != b'\\' {
            out.push(b);
            continue;
        }
        match iter.next() {
            Some(b'n') => out.push(b'\n'),
            Some(b'r') => out.push(b'\r'),
            Some(b't') => out.push(b'\t'),
            Some(b'0') => out.push(0),
            Some(b'x') => {
                let hi = iter.next();
                let lo = iter.next();
                let hex = match (hi, lo) {
                    (Some(hi), Some(lo)) => [hi, lo],
                    _ => {
                        return Err(PickleError::InvalidData(
                            "truncated \\x escape".to_string(),
                        ));
                    }
                };
                let value = std::str::from_utf8(&hex)
                    .ok()
                    .and_then(|hex| u8::from_str_radix(hex, 16).ok())
                    .ok_or_else(|| PickleError::InvalidData("invalid \\x escape".to_string()))?;
                out.push(value);
            }
            Some(other) => out.push(other),
            None => out.push(b'\\'),
        }
    }
    Ok(out)
}

/// Decodes `raw-unicode-escape`, the payload format of protocol 0 `UNICODE`.
fn raw_unicode_unescape(data: &[u8]) -> Result<String> {
    let mut out = String::with_capacity(data.len());
    let mut i = 0;
    while i < data.len() {
        let b = data[i];
        let width = match (b, data.get(i + 1)) {
            (b'\\', Some(b'u')) => 4,
            (b'\\', Some(b'U')) => 8,
            _ => 0,
        };
        if width > 0 && i + 2 + width <= data.len() {
            let hex = std::str::from_utf8(&data[i + 2..i + 2 + width])
                .ok()
                .and_then(|hex| u32::from_str_radix(hex, 16).ok())
                .and_then(char::from_u32);
            if let Some(c) = hex {
                out.push(c);
                i += 2 + width;
                continue;
            }
        }
        out.push(b as char);
        i += 1;
    }
    Ok(out)
}

fn ascii_line(line: &[u8]) -> Result<&str> {
    std::str::from_utf8(line)
        .map(str::trim)
        .map_err(|e| PickleError::InvalidData(format!("Invalid text line: {e}")))
}

/// Deepest container nesting a pickle may build.
///
/// Converting and dropping an [`Object`] recurses once per level, so deeper graphs are
/// rejected while they are built.
pub const MAX_NESTING_DEPTH: usize = 256;

fn too_deep() -> PickleError {
    PickleError::InvalidData(format!(
        "containers nested deeper than {MAX_NESTING_DEPTH} levels"
    ))
}

/// The pickle virtual machine.
///
/// One `Unpickler` can read several pickles stored back to back; each [`Unpickler::load`]
/// call runs until the next `STOP`.
pub struct Unpickler<'a, 'l, L: PersistentLoader> {
    reader: Cursor<&'a [u8]>,
    stack: Vec<Object>,
    /// Nesting depth of each stack entry.
    depths: Vec<usize>,
    marks: Vec<usize>,
    memo: HashMap<u32, (Object, usize)>,
    /// Memo entries whose object is still on the stack, as `(slot, index)` sorted by slot.
    ///
    /// `GET` reads these from the stack, so items added after `PUT` are visible.
    live: Vec<(usize, u32)>,
    encoding: StringEncoding,
    loader: &'l mut L,
}

impl<'a, 'l, L: PersistentLoader> Unpickler<'a, 'l, L> {
    pub fn new(data: &'a [u8], encoding: StringEncoding, loader: &'l mut L) -> Self {
        Self {
            reader: Cursor::new(data),
            stack: Vec::new(),
            depths: Vec::new(),
            marks: Vec::new(),
            memo: HashMap::new(),
            live: Vec::new(),
            encoding,
            loader,
        }
    }

    /// Byte offset of the next unread opcode.
    pub fn position(&self) -> usize {
        self.reader.position() as usize
    }

    pub fn loader(&self) -> &L {
        &*self.loader
    }

    fn remaining(&self) -> usize {
        self.reader.get_ref().len().saturating_sub(self.position())
    }

    fn read_vec(&mut self, len: u64) -> Result<Vec<u8>> {
        let remaining = self.remaining();
        let len = usize::try_from(len).unwrap_or(usize::MAX);
        if len > remaining {
            return Err(PickleError::Truncated {
                needed: len,
                remaining,
            });
        }
        let mut data = vec![0u8; len];
        self.reader.read_exact(&mut data)?;
        Ok(data)
    }

    fn read_line(&mut self) -> Result<Vec<u8>> {
        let mut data: Vec<u8> = Vec::with_capacity(32);
        self.reader.read_until(b'\n', &mut data)?;
        if data.pop() != Some(b'\n') {
            return Err(PickleError::Truncated {
                needed: 1,
                remaining: 0,
            });
        }
        if data.last() == Some(&b'\r') {
            data.pop();
        }
        Ok(data)
    }

    /// Pushes a scalar or an empty container.
    fn push(&mut self, o: Object) {
        self.stack.push(o);
        self.depths.push(0);
    }

    fn push_nested(&mut self, o: Object, depth: usize) -> Result<()> {
        if depth > MAX_NESTING_DEPTH {
            return Err(too_deep());
        }
        self.stack.push(o);
        self.depths.push(depth);
        Ok(())
    }

    /// True when nothing sits above the innermost mark.
    fn at_mark(&self) -> bool {
        self.marks
            .last()
            .is_some_and(|&mark| self.stack.len() <= mark)
    }

    fn pop_entry(&mut self) -> Result<(Object, usize)> {
        // Objects below the innermost mark belong to an enclosing frame.
        if self.stack.is_empty() || self.at_mark() {
            return Err(PickleError::StackUnderflow);
        }
        self.settle(self.stack.len() - 1);
        let obj = self.stack.pop().ok_or(PickleError::StackUnderflow)?;
        let depth = self.depths.pop().unwrap_or(0);
        Ok((obj, depth))
    }

    fn pop(&mut self) -> Result<Object> {
        self.pop_entry().map(|(obj, _)| obj)
    }

    fn top(&self) -> Result<(Object, usize)> {
        let obj = self.stack.last().cloned().ok_or(PickleError::StackUnderflow)?;
        Ok((obj, self.depths.last().copied().unwrap_or(0)))
    }

    fn last_mut(&mut self) -> Result<&mut Object> {
        self.stack.last_mut().ok_or(PickleError::StackUnderflow)
    }

    /// Records that the top container now holds children up to `child_depth` deep.
    fn deepen_top(&mut self, child_depth: usize) -> Result<()> {
        let depth = child_depth + 1;
        if depth > MAX_NESTING_DEPTH {
            return Err(too_deep());
        }
        if let Some(top) = self.depths.last_mut() {
            *top = (*top).max(depth);
        }
        Ok(())
    }

    /// Pops everything above the innermost mark, with the deepest nesting among them.
    fn pop_to_marker(&mut self) -> Result<(Vec<Object>, usize)> {
        let mark = self.marks.pop().ok_or(PickleError::MarkNotFound)?;
        if mark > self.stack.len() {
            return Err(PickleError::StackUnderflow);
        }
        self.settle(mark);
        let depth = self.depths.split_off(mark).into_iter().max().unwrap_or(0);
        Ok((self.stack.split_off(mark), depth))
    }

    /// Freezes the memo entries of every stack slot from `len` up, before they are popped.
    fn settle(&mut self, len: usize) {
        while let Some(&(slot, idx)) = self.live.last() {
            if slot < len {
                break;
            }
            self.live.pop();
            if let (Some(obj), Some(&depth)) = (self.stack.get(slot), self.depths.get(slot)) {
                self.memo.insert(idx, (obj.clone(), depth));
            }
        }
    }

    fn memo_get(&self, idx: u32) -> Result<(Object, usize)> {
        let live = self.live.iter().rev().find(|&&(_, live)| live == idx);
        if let Some(&(slot, _)) = live
            && let (Some(obj), Some(&depth)) = (self.stack.get(slot), self.depths.get(slot))
        {
            return Ok((obj.clone(), depth));
        }
        self.memo
            .get(&idx)
            .cloned()
            .ok_or(PickleError::MemoNotFound(idx))
    }

    fn memo_put(&mut self, idx: u32) -> Result<()> {
        let slot = self
            .stack
            .len()
            .checked_sub(1)
            .ok_or(PickleError::StackUnderflow)?;
        self.live.retain(|&(_, live)| live != idx);
        self.live.push((slot, idx));
        // Filled in by `settle` once the object leaves the stack.
        self.memo.insert(idx, (Object::None, 0));
        Ok(())
    }

    fn push_memo(&mut self, idx: u32) -> Result<()> {
        let (obj, depth) = self.memo_get(idx)?;
        self.push_nested(obj, depth)
    }

    fn push_string(&mut self, data: Vec<u8>) -> Result<()> {
        let s = String::from_utf8(data)
            .map_err(|e| PickleError::InvalidData(format!("Invalid UTF-8: {e}")))?;
        self.push(Object::String(s));
        Ok(())
    }

    fn push_py2_string(&mut self, data: Vec<u8>) -> Result<()> {
        let obj = self.encoding.decode(data)?;
        self.push(obj);
        Ok(())
    }

    fn persistent(&mut self, pid: Object, depth: usize) -> Result<()> {
        let obj = self.loader.persistent_load(pid)?;
        self.push_nested(obj, depth)
    }

    fn extend_top(&mut self, items: Vec<Object>, depth: usize, op_code: OpCode) -> Result<()> {
        match self.last_mut()? {
            Object::List(list) => list.extend(items),
            _ => return Err(PickleError::UnexpectedOpCode(op_code)),
        }
        self.deepen_top(depth)
    }

    fn set_items(&mut self, items: Vec<Object>, depth: usize, op_code: OpCode) -> Result<()> {
        if items.len() % 2 != 0 {
            return Err(PickleError::InvalidData(
                "setitems requires even number of objects".to_string(),
            ));
        }
        match self.last_mut()? {
            Object::Dict(dict) => {
                let mut items = items.into_iter();
                while let (Some(key), Some(value)) = (items.next(), items.next()) {
                    dict_insert(dict, key, value);
                }
            }
            _ => return Err(PickleError::UnexpectedOpCode(op_code)),
        }
        self.deepen_top(depth)
    }

    /// Runs the machine until `STOP` and returns the object left on the stack.
    pub fn load(&mut self) -> Result<Object> {
        self.stack.clear();
        self.depths.clear();
        self.marks.clear();
        self.memo.clear();
        self.live.clear();

        loop {
            let op_code = self.reader.read_u8()?;
            let op_code = OpCode::try_from(op_code).map_err(PickleError::InvalidOpCode)?;
            match op_code {
                OpCode::Proto => {
                    let version = self.reader.read_u8()?;
                    if version > 5 {
                        return Err(PickleError::InvalidProtocol(version));
                    }
                }
                OpCode::Frame => {
                    // Framing only groups opcodes for buffered readers.
                    let _frame_len = self.reader.read_u64::<LittleEndian>()?;
                }
                OpCode::Stop => break,
                OpCode::Mark => self.marks.push(self.stack.len()),
                OpCode::Pop => {
                    // With nothing above the innermost mark, POP discards the mark itself.
                    if self.at_mark() {
                        self.pop_to_marker()?;
                    } else {
                        self.pop()?;
                    }
                }
                OpCode::PopMark => {
                    self.pop_to_marker()?;
                }
                OpCode::Dup => {
                    let (obj, depth) = self.top()?;
                    self.push_nested(obj, depth)?;
                }

                OpCode::None => self.push(Object::None),
                OpCode::NewTrue => self.push(Object::Bool(true)),
                OpCode::NewFalse => self.push(Object::Bool(false)),
                OpCode::Int => {
                    let line = self.read_line()?;
                    let s = ascii_line(&line)?;
                    let obj = match s {
                        "01" => Object::Bool(true),
                        "00" => Object::Bool(false),
                        s => Object::Int(s.parse::<i64>().map_err(|e| {
                            PickleError::InvalidData(format!("Invalid INT value '{s}': {e}"))
                        })?),
                    };
                    self.push(obj);
                }
                OpCode::BinInt => {
                    let v = self.reader.read_i32::<LittleEndian>()?;
                    self.push(Object::Int(v as i64));
                }
                OpCode::BinInt1 => {
                    let v = self.reader.read_u8()?;
                    self.push(Object::Int(v as i64));
                }
                OpCode::BinInt2 => {
                    let v = self.reader.read_u16::<LittleEndian>()?;
                    self.push(Object::Int(v as i64));
                }
                OpCode::Long => {
                    let line = self.read_line()?;
                    let s = ascii_line(&line)?;
                    let digits = s.trim_end_matches('L');
                    let v = digits.parse::<i64>().map_err(|e| {
                        PickleError::InvalidData(format!("Invalid LONG value '{s}': {e}"))
                    })?;
                    self.push(Object::Int(v));
                }
                OpCode::Long1 => {
                    let len = self.reader.read_u8()?;
                    let data = self.read_vec(len as u64)?;
                    self.push(decode_long(&data));
                }
                OpCode::Long4 => {
                    let len = self.reader.read_i32::<LittleEndian>()?;
                    let len = u64::try_from(len).map_err(|_| {
                        PickleError::InvalidData(format!("negative LONG4 length {len}"))
                    })?;
                    let data = self.read_vec(len)?;
                    self.push(decode_long(&data));
                }
                OpCode::Float => {
                    let line = self.read_line()?;
                    let s = ascii_line(&line)?;
                    let v = s.parse::<f64>().map_err(|e| {
                        PickleError::InvalidData(format!("Invalid FLOAT value '{s}': {e}"))
                    })?;
                    self.push(Object::Float(v));
                }
                OpCode::BinFloat => {
                    // Python's BINFLOAT uses big-endian encoding
                    let v = self.reader.read_f64::<BigEndian>()?;
                    self.push(Object::Float(v));
                }

                OpCode::String => {
                    let line = self.read_line()?;
                    let quoted = match line.as_slice() {
                        [q, inner @ .., end] if (*q == b'\'' || *q == b'"') && q == end => inner,
                        _ => {
                            return Err(PickleError::InvalidData(
                                "STRING payload is not quoted".to_string(),
                            ));
                        }
                    };
                    let data = unescape(quoted)?;
                    self.push_py2_string(data)?;
                }
                OpCode::BinString => {
                    let len = self.reader.read_i32::<LittleEndian>()?;
                    let len = u64::try_from(len).map_err(|_| {
                        PickleError::InvalidData(format!("negative BINSTRING length {len}"))
                    })?;
                    let data = self.read_vec(len)?;
                    self.push_py2_string(data)?;
                }
                OpCode::ShortBinString => {
                    let len = self.reader.read_u8()?;
                    let data = self.read_vec(len as u64)?;
                    self.push_py2_string(data)?;
                }
                OpCode::Unicode => {
                    let line = self.read_line()?;
                    let s = raw_unicode_unescape(&line)?;
                    self.push(Object::String(s));
                }
                OpCode::BinUnicode => {
                    let len = self.reader.read_u32::<LittleEndian>()?;
                    let data = self.read_vec(len as u64)?;
                    self.push_string(data)?;
                }
                OpCode::ShortBinUnicode => {
                    let len = self.reader.read_u8()?;
                    let data = self.read_vec(len as u64)?;
                    self.push_string(data)?;
                }
                OpCode::BinUnicode8 => {
                    let len = self.reader.read_u64::<LittleEndian>()?;
                    let data = self.read_vec(len)?;
                    self.push_string(data)?;
                }
                OpCode::BinBytes => {
                    let len = self.reader.read_u32::<LittleEndian>()?;
                    let data = self.read_vec(len as u64)?;
                    self.push(Object::Bytes(data));
                }
                OpCode::ShortBinBytes => {
                    let len = self.reader.read_u8()?;
                    let data = self.read_vec(len as u64)?;
                    self.push(Object::Bytes(data));
                }
                OpCode::BinBytes8 | OpCode::ByteArray8 => {
                    let len = self.reader.read_u64::<LittleEndian>()?;
                    let data = self.read_vec(len)?;
                    self.push(Object::Bytes(data));
                }

                OpCode::EmptyTuple => self.push(Object::Tuple(Vec::new())),
                OpCode::Tuple => {
                    let (objs, depth) = self.pop_to_marker()?;
                    self.push_nested(Object::Tuple(objs), depth + 1)?;
                }
                OpCode::Tuple1 => {
                    let (obj, depth) = self.pop_entry()?;
                    self.push_nested(Object::Tuple(vec![obj]), depth + 1)?;
                }
                OpCode::Tuple2 => {
                    let (obj2, d2) = self.pop_entry()?;
                    let (obj1, d1) = self.pop_entry()?;
                    self.push_nested(Object::Tuple(vec![obj1, obj2]), d1.max(d2) + 1)?;
                }
                OpCode::Tuple3 => {
                    let (obj3, d3) = self.pop_entry()?;
                    let (obj2, d2) = self.pop_entry()?;
                    let (obj1, d1) = self.pop_entry()?;
                    let depth = d1.max(d2).max(d3) + 1;
                    self.push_nested(Object::Tuple(vec![obj1, obj2, obj3]), depth)?;
                }
                // Sets only ever hold plain values in checkpoints; keep them as lists.
                OpCode::EmptyList | OpCode::EmptySet => self.push(Object::List(Vec::new())),
                OpCode::List | OpCode::FrozenSet => {
                    let (objs, depth) = self.pop_to_marker()?;
                    self.push_nested(Object::List(objs), depth + 1)?;
                }
                OpCode::Append => {
                    let (value, depth) = self.pop_entry()?;
                    self.extend_top(vec![value], depth, op_code)?;
                }
                OpCode::Appends | OpCode::AddItems => {
                    let (objs, depth) = self.pop_to_marker()?;
                    self.extend_top(objs, depth, op_code)?;
                }
                OpCode::EmptyDict => self.push(Object::Dict(Vec::new())),
                OpCode::Dict => {
                    let (objs, depth) = self.pop_to_marker()?;
                    self.push(Object::Dict(Vec::new()));
                    self.set_items(objs, depth, op_code)?;
                }
                OpCode::SetItem => {
                    let (value, dv) = self.pop_entry()?;
                    let (key, dk) = self.pop_entry()?;
                    self.set_items(vec![key, value], dk.max(dv), op_code)?;
                }
                OpCode::SetItems => {
                    let (objs, depth) = self.pop_to_marker()?;
                    self.set_items(objs, depth, op_code)?;
                }

                OpCode::Put => {
                    let line = self.read_line()?;
                    let s = ascii_line(&line)?;
                    let idx = s.parse::<u32>().map_err(|e| {
                        PickleError::InvalidData(format!("Invalid PUT index '{s}': {e}"))
                    })?;
                    self.memo_put(idx)?;
                }
                OpCode::BinPut => {
                    let idx = self.reader.read_u8()? as u32;
                    self.memo_put(idx)?;
                }
                OpCode::LongBinPut => {
                    let idx = self.reader.read_u32::<LittleEndian>()?;
                    self.memo_put(idx)?;
                }
                OpCode::Memoize => {
                    // The memo index is the current number of items in the memo
                    let idx = self.memo.len() as u32;
                    self.memo_put(idx)?;
                }
                OpCode::Get => {
                    let line = self.read_line()?;
                    let s = ascii_line(&line)?;
                    let idx = s.parse::<u32>().map_err(|e| {
                        PickleError::InvalidData(format!("Invalid GET index '{s}': {e}"))
                    })?;
                    self.push_memo(idx)?;
                }
                OpCode::BinGet => {
                    let idx = self.reader.read_u8()? as u32;
                    self.push_memo(idx)?;
                }
                OpCode::LongBinGet => {
                    let idx = self.reader.read_u32::<LittleEndian>()?;
                    self.push_memo(idx)?;
                }

                OpCode::Global => {
                    let module = self.read_line()?;
                    let name = self.read_line()?;
                    let module = ascii_line(&module)?.to_string();
                    let name = ascii_line(&name)?.to_string();
                    self.push(Object::Global(Global::new(module, name)));
                }
                OpCode::StackGlobal => {
                    let name = self.pop()?;
                    let module = self.pop()?;
                    match (module.as_text(), name.as_text()) {
                        (Some(module), Some(name)) => {
                            let global = Global::new(module.into_owned(), name.into_owned());
                            self.push(Object::Global(global));
                        }
                        _ => {
                            return Err(PickleError::InvalidData(format!(
                                "STACK_GLOBAL expects two strings, got {} and {}",
                                module.type_name(),
                                name.type_name()
                            )));
                        }
                    }
                }
                OpCode::PersId => {
                    let line = self.read_line()?;
                    let id = String::from_utf8(line).map_err(|e| {
                        PickleError::InvalidData(format!("Invalid persistent id: {e}"))
                    })?;
                    self.persistent(Object::String(id), 0)?;
                }
                OpCode::BinPersId => {
                    let (pid, depth) = self.pop_entry()?;
                    self.persistent(pid, depth)?;
                }
                OpCode::Reduce | OpCode::NewObj => {
                    let (args, da) = self.pop_entry()?;
                    let (callable, dc) = self.pop_entry()?;
                    let obj = call(callable, args)?;
                    self.push_nested(obj, da.max(dc) + 1)?;
                }
                OpCode::Build => {
                    let (state, ds) = self.pop_entry()?;
                    let (obj, dobj) = self.pop_entry()?;
                    let built = match obj {
                        // State of an `OrderedDict` or a tensor holds Python attributes
                        // such as `_metadata`, never items.
                        obj @ (Object::Dict(_) | Object::Tensor(_)) => obj,
                        obj => Object::Build {
                            object: Box::new(obj),
                            state: Box::new(state),
                        },
                    };
                    self.push_nested(built, ds.max(dobj) + 1)?;
                }
            }
        }

        if !self.marks.is_empty() {
            return Err(PickleError::InvalidData(
                "unbalanced mark at STOP".to_string(),
            ));
        }
        self.live.clear();
        self.depths.clear();
        self.stack.pop().ok_or(PickleError::StackUnderflow)
    }
}

/// Replays a single pickle with no storage side channel.
///
/// Persistent ids resolve to unresolved or zero-filled storage stand-ins.
pub fn read_pickle(data: &[u8], encoding: StringEncoding) -> Result<Object> {
    let mut table = super::storage::StorageTable::detached();
    Unpickler::new(data, encoding, &mut table).load()
}
