#![allow(dead_code)]

use std::io::{Cursor, Write};

use zip::write::SimpleFileOptions;

/// Writes pickle streams opcode by opcode.
#[derive(Default)]
pub struct PickleWriter {
    buf: Vec<u8>,
}

impl PickleWriter {
    pub fn new(protocol: u8) -> Self {
        Self {
            buf: vec![0x80, protocol],
        }
    }

    /// A protocol 0/1 stream, which has no `PROTO` header.
    pub fn unversioned() -> Self {
        Self::default()
    }

    pub fn op(mut self, op: u8) -> Self {
        self.buf.push(op);
        self
    }

    pub fn mark(self) -> Self {
        self.op(b'(')
    }

    pub fn empty_dict(self) -> Self {
        self.op(b'}')
    }

    pub fn empty_list(self) -> Self {
        self.op(b']')
    }

    pub fn empty_tuple(self) -> Self {
        self.op(b')')
    }

    pub fn tuple(self) -> Self {
        self.op(b't')
    }

    pub fn set_items(self) -> Self {
        self.op(b'u')
    }

    pub fn appends(self) -> Self {
        self.op(b'e')
    }

    pub fn reduce(self) -> Self {
        self.op(b'R')
    }

    pub fn bin_pers_id(self) -> Self {
        self.op(b'Q')
    }

    pub fn none(self) -> Self {
        self.op(b'N')
    }

    pub fn boolean(self, value: bool) -> Self {
        self.op(if value { 0x88 } else { 0x89 })
    }

    pub fn int(mut self, value: i32) -> Self {
        self.buf.push(b'J');
        self.buf.extend_from_slice(&value.to_le_bytes());
        self
    }

    pub fn float(mut self, value: f64) -> Self {
        self.buf.push(b'G');
        self.buf.extend_from_slice(&value.to_be_bytes());
        self
    }

    pub fn long1(mut self, bytes: &[u8]) -> Self {
        self.buf.push(0x8a);
        self.buf.push(bytes.len() as u8);
        self.buf.extend_from_slice(bytes);
        self
    }

    pub fn unicode(mut self, value: &str) -> Self {
        self.buf.push(b'X');
        self.buf.extend_from_slice(&(value.len() as u32).to_le_bytes());
        self.buf.extend_from_slice(value.as_bytes());
        self
    }

    /// Python 2 `str`, decoded according to the legacy string encoding.
    pub fn short_binstring(mut self, value: &[u8]) -> Self {
        self.buf.push(b'U');
        self.buf.push(value.len() as u8);
        self.buf.extend_from_slice(value);
        self
    }

    pub fn global(mut self, module: &str, name: &str) -> Self {
        self.buf.push(b'c');
        self.buf.extend_from_slice(module.as_bytes());
        self.buf.push(b'\n');
        self.buf.extend_from_slice(name.as_bytes());
        self.buf.push(b'\n');
        self
    }

    /// Protocol 0 persistent id, read as a bare storage key.
    pub fn pers_id(mut self, key: &str) -> Self {
        self.buf.push(b'P');
        self.buf.extend_from_slice(key.as_bytes());
        self.buf.push(b'\n');
        self
    }

    pub fn repeat(mut self, op: u8, times: usize) -> Self {
        self.buf.extend(std::iter::repeat_n(op, times));
        self
    }

    pub fn bin_put(mut self, idx: u8) -> Self {
        self.buf.push(b'q');
        self.buf.push(idx);
        self
    }

    pub fn bin_get(mut self, idx: u8) -> Self {
        self.buf.push(b'h');
        self.buf.push(idx);
        self
    }

    pub fn ints(self, values: &[usize]) -> Self {
        let mut writer = self.mark();
        for &value in values {
            writer = writer.int(value as i32);
        }
        writer.tuple()
    }

    /// `('storage', torch.<storage>, key, 'cpu', numel)` as a persistent id.
    pub fn storage_ref(self, storage: &str, key: &str, numel: usize) -> Self {
        self.mark()
            .unicode("storage")
            .global("torch", storage)
            .unicode(key)
            .unicode("cpu")
            .int(numel as i32)
            .tuple()
            .bin_pers_id()
    }

    /// `torch._utils._rebuild_tensor_v2(storage, offset, shape, stride, False, OrderedDict())`
    pub fn tensor(self, tensor: &TensorSpec) -> Self {
        self.global("torch._utils", "_rebuild_tensor_v2")
            .mark()
            .storage_ref(tensor.storage, tensor.key, tensor.numel)
            .int(tensor.offset as i32)
            .ints(tensor.shape)
            .ints(&contiguous_stride(tensor.shape))
            .boolean(false)
            .global("collections", "OrderedDict")
            .empty_tuple()
            .reduce()
            .tuple()
            .reduce()
    }

    pub fn value(self, value: &Value) -> Self {
        match value {
            Value::Tensor(spec) => self.tensor(spec),
            Value::Int(v) => self.int(*v),
            Value::Float(v) => self.float(*v),
            Value::Str(s) => self.unicode(s),
        }
    }

    pub fn stop(mut self) -> Vec<u8> {
        self.buf.push(b'.');
        self.buf
    }
}

/// A tensor entry of a test checkpoint.
#[derive(Clone, Copy)]
pub struct TensorSpec<'a> {
    pub key: &'a str,
    pub storage: &'a str,
    pub numel: usize,
    pub offset: usize,
    pub shape: &'a [usize],
}

impl<'a> TensorSpec<'a> {
    pub fn float(key: &'a str, shape: &'a [usize]) -> Self {
        Self {
            key,
            storage: "FloatStorage",
            numel: shape.iter().product(),
            offset: 0,
            shape,
        }
    }

    pub fn with_storage(mut self, storage: &'a str) -> Self {
        self.storage = storage;
        self
    }

    pub fn with_numel(mut self, numel: usize) -> Self {
        self.numel = numel;
        self
    }

    pub fn with_offset(mut self, offset: usize) -> Self {
        self.offset = offset;
        self
    }
}

pub enum Value<'a> {
    Tensor(TensorSpec<'a>),
    Int(i32),
    Float(f64),
    Str(&'a str),
}

fn contiguous_stride(shape: &[usize]) -> Vec<usize> {
    let mut stride = vec![1; shape.len()];
    for i in (0..shape.len().saturating_sub(1)).rev() {
        stride[i] = stride[i + 1] * shape[i + 1];
    }
    stride
}

/// A protocol 2 pickle of `{name: value, ...}` as `torch.save(state_dict)` writes it.
pub fn state_dict(entries: &[(&str, Value)]) -> Vec<u8> {
    let mut writer = PickleWriter::new(2)
        .global("collections", "OrderedDict")
        .empty_tuple()
        .reduce()
        .mark();
    for (name, value) in entries {
        writer = writer.unicode(name).value(value);
    }
    writer.set_items().stop()
}

pub fn f32_bytes(values: &[f32]) -> Vec<u8> {
    values.iter().flat_map(|v| v.to_le_bytes()).collect()
}

pub fn i64_bytes(values: &[i64]) -> Vec<u8> {
    values.iter().flat_map(|v| v.to_le_bytes()).collect()
}

pub fn zip_archive(entries: &[(&str, &[u8])]) -> Vec<u8> {
    let mut writer = zip::ZipWriter::new(Cursor::new(Vec::new()));
    let options = SimpleFileOptions::default().compression_method(zip::CompressionMethod::Stored);
    for (name, data) in entries {
        writer.start_file(*name, options).unwrap();
        writer.write_all(data).unwrap();
    }
    writer.finish().unwrap().into_inner()
}

/// A pre-1.6 `torch.save` file: magic number, protocol version, system info, the root
/// pickle, the storage keys, then one `(numel, bytes)` blob per key.
pub fn legacy_file(root: &[u8], storages: &[(&str, usize, &[u8])]) -> Vec<u8> {
    let magic = [0x6c, 0xfc, 0x9c, 0x46, 0xf9, 0x20, 0x6a, 0xa8, 0x50, 0x19];
    let mut out = PickleWriter::new(2).long1(&magic).stop();
    out.extend(PickleWriter::new(2).int(1001).stop());
    out.extend(
        PickleWriter::new(2)
            .empty_dict()
            .mark()
            .unicode("little_endian")
            .boolean(true)
            .set_items()
            .stop(),
    );
    out.extend_from_slice(root);

    let mut keys = PickleWriter::new(2).empty_list().mark();
    for (key, _, _) in storages {
        keys = keys.unicode(key);
    }
    out.extend(keys.appends().stop());

    for (_, numel, bytes) in storages {
        out.extend_from_slice(&(*numel as i64).to_le_bytes());
        out.extend_from_slice(bytes);
    }
    out
}
