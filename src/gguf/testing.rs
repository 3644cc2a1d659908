//! Synthetic GGUF buffers for tests

pub(crate) struct GgufBuilder {
    kvs: Vec<u8>,
    kv_count: u64,
    tensors: Vec<u8>,
    tensor_count: u64,
}

fn put_string(out: &mut Vec<u8>, s: &str) {
    out.extend_from_slice(&(s.len() as u64).to_le_bytes());
    out.extend_from_slice(s.as_bytes());
}

impl GgufBuilder {
    pub(crate) fn new() -> Self {
        Self {
            kvs: Vec::new(),
            kv_count: 0,
            tensors: Vec::new(),
            tensor_count: 0,
        }
    }

    /// Key, tag and an already-encoded payload.
    pub(crate) fn raw(mut self, key: &str, tag: u32, payload: &[u8]) -> Self {
        put_string(&mut self.kvs, key);
        self.kvs.extend_from_slice(&tag.to_le_bytes());
        self.kvs.extend_from_slice(payload);
        self.kv_count += 1;
        self
    }

    pub(crate) fn u8(self, key: &str, value: u8) -> Self {
        self.raw(key, 0, &[value])
    }

    pub(crate) fn bool(self, key: &str, value: bool) -> Self {
        self.raw(key, 7, &[u8::from(value)])
    }

    pub(crate) fn u32(self, key: &str, value: u32) -> Self {
        self.raw(key, 4, &value.to_le_bytes())
    }

    pub(crate) fn i32(self, key: &str, value: i32) -> Self {
        self.raw(key, 5, &value.to_le_bytes())
    }

    pub(crate) fn f32(self, key: &str, value: f32) -> Self {
        self.raw(key, 6, &value.to_le_bytes())
    }

    pub(crate) fn u64(self, key: &str, value: u64) -> Self {
        self.raw(key, 10, &value.to_le_bytes())
    }

    pub(crate) fn string(self, key: &str, value: &str) -> Self {
        let mut payload = Vec::new();
        put_string(&mut payload, value);
        self.raw(key, 8, &payload)
    }

    pub(crate) fn string_array(self, key: &str, values: &[&str]) -> Self {
        let mut payload = Vec::new();
        payload.extend_from_slice(&8u32.to_le_bytes());
        payload.extend_from_slice(&(values.len() as u64).to_le_bytes());
        for value in values {
            put_string(&mut payload, value);
        }
        self.raw(key, 9, &payload)
    }

    pub(crate) fn u32_array(self, key: &str, values: &[u32]) -> Self {
        let mut payload = Vec::new();
        payload.extend_from_slice(&4u32.to_le_bytes());
        payload.extend_from_slice(&(values.len() as u64).to_le_bytes());
        for value in values {
            payload.extend_from_slice(&value.to_le_bytes());
        }
        self.raw(key, 9, &payload)
    }

    pub(crate) fn nested_u32_arrays(self, key: &str, rows: &[&[u32]]) -> Self {
        let mut payload = Vec::new();
        payload.extend_from_slice(&9u32.to_le_bytes());
        payload.extend_from_slice(&(rows.len() as u64).to_le_bytes());
        for row in rows {
            payload.extend_from_slice(&4u32.to_le_bytes());
            payload.extend_from_slice(&(row.len() as u64).to_le_bytes());
            for value in *row {
                payload.extend_from_slice(&value.to_le_bytes());
            }
        }
        self.raw(key, 9, &payload)
    }

    pub(crate) fn tensor(mut self, name: &str, dims: &[u64]) -> Self {
        put_string(&mut self.tensors, name);
        self.tensors
            .extend_from_slice(&(dims.len() as u32).to_le_bytes());
        for dim in dims {
            self.tensors.extend_from_slice(&dim.to_le_bytes());
        }
        // dtype F32, offset 0
        self.tensors.extend_from_slice(&0u32.to_le_bytes());
        self.tensors.extend_from_slice(&0u64.to_le_bytes());
        self.tensor_count += 1;
        self
    }

    pub(crate) fn build(&self) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(b"GGUF");
        out.extend_from_slice(&3u32.to_le_bytes());
        out.extend_from_slice(&self.tensor_count.to_le_bytes());
        out.extend_from_slice(&self.kv_count.to_le_bytes());
        out.extend_from_slice(&self.kvs);
        out.extend_from_slice(&self.tensors);
        out
    }
}
