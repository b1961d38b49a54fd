// Auxiliary buffer and loader plumbing.
//
// LuaBuffer is a growable byte buffer with an inline first segment, the
// usual pattern for building strings piecewise before committing them to
// the VM. The loaders stream bytes from a Reader and hand the result to
// the dump loader (which also resolves the envelope and the frontend
// seam).

use std::fs::File;
use std::io::Read as _;

use crate::lua_value::{LuaValue, Reader};
use crate::lua_vm::{LuaError, LuaResult, LuaVM};

const INLINE_CAP: usize = 64;

/// Byte buffer with small-buffer optimization.
pub struct LuaBuffer {
    inline: [u8; INLINE_CAP],
    len: usize,
    spill: Option<Vec<u8>>,
}

impl LuaBuffer {
    pub fn new() -> Self {
        LuaBuffer { inline: [0; INLINE_CAP], len: 0, spill: None }
    }

    pub fn len(&self) -> usize {
        match &self.spill {
            Some(v) => v.len(),
            None => self.len,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn spill_mut(&mut self) -> &mut Vec<u8> {
        if self.spill.is_none() {
            let mut v = Vec::with_capacity(INLINE_CAP * 2);
            v.extend_from_slice(&self.inline[..self.len]);
            self.spill = Some(v);
        }
        self.spill.as_mut().unwrap()
    }

    pub fn push_byte(&mut self, b: u8) {
        if self.spill.is_none() && self.len < INLINE_CAP {
            self.inline[self.len] = b;
            self.len += 1;
        } else {
            self.spill_mut().push(b);
        }
    }

    pub fn push_char(&mut self, c: char) {
        let mut buf = [0u8; 4];
        self.push_bytes(c.encode_utf8(&mut buf).as_bytes());
    }

    pub fn push_bytes(&mut self, bytes: &[u8]) {
        if self.spill.is_none() && self.len + bytes.len() <= INLINE_CAP {
            self.inline[self.len..self.len + bytes.len()].copy_from_slice(bytes);
            self.len += bytes.len();
        } else {
            self.spill_mut().extend_from_slice(bytes);
        }
    }

    pub fn push_str(&mut self, s: &str) {
        self.push_bytes(s.as_bytes());
    }

    /// Render a value the way `tostring` would and append it.
    pub fn push_value(&mut self, vm: &LuaVM, v: &LuaValue) {
        if let Some(bytes) = vm.value_str(v) {
            let owned = bytes.to_vec();
            self.push_bytes(&owned);
        } else if let Some(i) = v.as_integer() {
            let mut b = itoa::Buffer::new();
            self.push_str(b.format(i));
        } else {
            self.push_str(&vm.display_value(v));
        }
    }

    pub fn push_fmt(&mut self, args: std::fmt::Arguments<'_>) {
        use std::fmt::Write;
        let mut s = String::new();
        let _ = s.write_fmt(args);
        self.push_str(&s);
    }

    pub fn as_bytes(&self) -> &[u8] {
        match &self.spill {
            Some(v) => v,
            None => &self.inline[..self.len],
        }
    }

    /// Finalize into an interned string value.
    pub fn commit(self, vm: &mut LuaVM) -> LuaValue {
        vm.intern(self.as_bytes())
    }
}

impl Default for LuaBuffer {
    fn default() -> Self {
        Self::new()
    }
}

// ---- readers ----

/// One-shot reader over an in-memory chunk.
pub struct StringReader<'a> {
    data: Option<&'a [u8]>,
}

impl<'a> StringReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        StringReader { data: Some(data) }
    }
}

impl Reader for StringReader<'_> {
    fn read(&mut self) -> LuaResult<Option<Vec<u8>>> {
        Ok(self.data.take().map(|d| d.to_vec()))
    }
}

/// Chunked file reader.
pub struct FileReader {
    file: File,
    done: bool,
}

impl FileReader {
    pub fn open(path: &str) -> std::io::Result<Self> {
        Ok(FileReader { file: File::open(path)?, done: false })
    }
}

impl Reader for FileReader {
    fn read(&mut self) -> LuaResult<Option<Vec<u8>>> {
        if self.done {
            return Ok(None);
        }
        let mut chunk = vec![0u8; 4096];
        match self.file.read(&mut chunk) {
            Ok(0) => {
                self.done = true;
                Ok(None)
            }
            Ok(n) => {
                chunk.truncate(n);
                Ok(Some(chunk))
            }
            Err(_) => Err(LuaError::IOError),
        }
    }
}

impl LuaVM {
    /// Stream a chunk from `reader` and load it (envelope, dump, or source
    /// via the frontend). Returns the resulting closure.
    pub fn load_reader(&mut self, reader: &mut dyn Reader, chunkname: &str) -> LuaResult<LuaValue> {
        let mut blob = Vec::new();
        while let Some(chunk) = reader.read()? {
            blob.extend_from_slice(&chunk);
        }
        crate::dump::load(self, &blob, chunkname)
    }

    pub fn load_bytes(&mut self, blob: &[u8], chunkname: &str) -> LuaResult<LuaValue> {
        let mut r = StringReader::new(blob);
        self.load_reader(&mut r, chunkname)
    }

    pub fn load_file(&mut self, path: &str) -> LuaResult<LuaValue> {
        let mut r = FileReader::open(path).map_err(|e| {
            let msg = format!("cannot open {}: {}", path, e);
            self.raise_plain(LuaError::IOError, msg)
        })?;
        let chunkname = format!("@{}", path);
        self.load_reader(&mut r, &chunkname)
    }

    /// Dump a closure with options; see `dump::DumpOptions` for defaults
    /// (the envelope is on unless turned off).
    pub fn dump_function(
        &mut self,
        f: LuaValue,
        opts: &crate::dump::DumpOptions,
    ) -> LuaResult<Vec<u8>> {
        crate::dump::dump_closure(self, f, opts)
    }
}
