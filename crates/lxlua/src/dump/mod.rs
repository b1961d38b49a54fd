// Dump / undump: prototype serialization.
//
// Wire format: a 4-byte signature (ESC "Lua"), an 8-byte version/size
// header, then the top-level prototype tree. Constants are tagged; debug
// info is omitted when stripping. Integer constants may travel through a
// reversible encoding (the state-encoding obfuscation pass); the header
// carries the flag and the seed so the reader can undo it.

pub mod envelope;
pub mod obfuscate;

use std::io::{Cursor, Read};
use std::rc::Rc;

use crate::lua_value::{AbsLineInfo, LocVar, LuaValue, Proto, UpvalueDesc};
use crate::lua_vm::{LuaError, LuaResult, LuaVM};

pub use obfuscate::ObfFlags;

pub const DUMP_SIGNATURE: &[u8] = b"\x1bLua";
const DUMP_MAJOR: u8 = 5;
const DUMP_MINOR: u8 = 5;
const DUMP_FORMAT: u8 = 0x4C; // this runtime's private format tag
const FLAG_LITTLE_ENDIAN: u8 = 1 << 0;
const FLAG_INT_FLOAT_DISTINCT: u8 = 1 << 1;

// constant tags
const K_NIL: u8 = 0;
const K_FALSE: u8 = 1;
const K_TRUE: u8 = 2;
const K_INT: u8 = 3;
const K_FLOAT: u8 = 4;
const K_SHRSTR: u8 = 5;
const K_LNGSTR: u8 = 6;

/// Options for `dump_closure`; the envelope defaults to on.
#[derive(Debug, Clone)]
pub struct DumpOptions {
    pub strip: bool,
    pub obfuscate: ObfFlags,
    pub seed: u64,
    pub envelop: bool,
}

impl Default for DumpOptions {
    fn default() -> Self {
        DumpOptions {
            strip: false,
            obfuscate: ObfFlags::empty(),
            seed: 0,
            envelop: true,
        }
    }
}

struct Writer<'vm> {
    vm: &'vm LuaVM,
    buf: Vec<u8>,
    strip: bool,
    enc_key: Option<u64>,
}

impl<'vm> Writer<'vm> {
    fn u8(&mut self, v: u8) {
        self.buf.push(v);
    }

    fn u32(&mut self, v: u32) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    fn u64(&mut self, v: u64) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    fn i64(&mut self, v: i64) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    fn bytes(&mut self, b: &[u8]) {
        self.u32(b.len() as u32);
        self.buf.extend_from_slice(b);
    }

    fn opt_str(&mut self, s: Option<&str>) {
        match s {
            Some(s) => {
                self.u8(1);
                self.bytes(s.as_bytes());
            }
            None => self.u8(0),
        }
    }

    fn constant(&mut self, k: &LuaValue) -> LuaResult<()> {
        if k.is_nil() {
            self.u8(K_NIL);
        } else if let Some(b) = k.as_boolean() {
            self.u8(if b { K_TRUE } else { K_FALSE });
        } else if let Some(i) = k.as_integer() {
            self.u8(K_INT);
            let coded = match self.enc_key {
                Some(key) => obfuscate::encode_int(i, key),
                None => i,
            };
            self.i64(coded);
        } else if let Some(f) = k.as_float() {
            self.u8(K_FLOAT);
            self.u64(f.to_bits());
        } else if let Some(id) = k.as_string_id() {
            let bytes = self.vm.pool.string_bytes(id).to_vec();
            self.u8(if k.is_short_string() { K_SHRSTR } else { K_LNGSTR });
            self.bytes(&bytes);
        } else {
            return Err(LuaError::DumpError);
        }
        Ok(())
    }

    fn proto(&mut self, p: &Proto) -> LuaResult<()> {
        if self.strip {
            self.opt_str(None);
        } else {
            self.opt_str(p.source.as_deref());
        }
        self.u32(p.linedefined);
        self.u32(p.lastlinedefined);
        self.u8(p.numparams);
        self.u8(p.is_vararg as u8);
        self.u8(p.maxstacksize);
        self.u8(p.nodiscard as u8);
        self.u8(p.difierline_mode);
        self.u32(p.difierline_magicnum);
        self.u32(p.difierline_data);

        self.u32(p.code.len() as u32);
        for &inst in &p.code {
            self.u32(inst);
        }

        self.u32(p.constants.len() as u32);
        for k in &p.constants {
            self.constant(k)?;
        }

        self.u32(p.upvalue_descs.len() as u32);
        for d in &p.upvalue_descs {
            self.u8(d.instack as u8);
            self.u8(d.idx);
            self.u8(d.kind);
        }

        if self.strip {
            // dense line info, anchors, locals, upvalue names all omitted
            self.u32(0);
            self.u32(0);
            self.u32(0);
            self.u32(0);
        } else {
            self.u32(p.line_info.len() as u32);
            for &d in &p.line_info {
                self.u8(d as u8);
            }
            self.u32(p.abs_line_info.len() as u32);
            for a in &p.abs_line_info {
                self.u32(a.pc);
                self.u32(a.line);
            }
            self.u32(p.locvars.len() as u32);
            for lv in &p.locvars {
                self.bytes(lv.name.as_bytes());
                self.u32(lv.startpc);
                self.u32(lv.endpc);
            }
            self.u32(p.upvalue_descs.len() as u32);
            for d in &p.upvalue_descs {
                self.opt_str(d.name.as_deref());
            }
        }

        self.u32(p.protos.len() as u32);
        for child in &p.protos {
            self.proto(child)?;
        }
        Ok(())
    }
}

/// Serialize a prototype tree.
pub fn dump_proto(vm: &LuaVM, proto: &Proto, opts: &DumpOptions) -> LuaResult<Vec<u8>> {
    let enc_key = if opts.obfuscate.state_encoding() {
        Some(obfuscate::derive_enc_key(opts.seed))
    } else {
        None
    };

    let mut w = Writer { vm, buf: Vec::with_capacity(512), strip: opts.strip, enc_key };
    w.buf.extend_from_slice(DUMP_SIGNATURE);
    let mut flags = FLAG_LITTLE_ENDIAN | FLAG_INT_FLOAT_DISTINCT;
    if opts.obfuscate.state_encoding() {
        flags |= 1 << 2;
    }
    w.buf.extend_from_slice(&[
        DUMP_MAJOR,
        DUMP_MINOR,
        DUMP_FORMAT,
        8, // native integer size
        8, // native float size
        flags,
        opts.strip as u8,
        0,
    ]);
    if opts.obfuscate.state_encoding() {
        w.u64(opts.seed);
    }
    w.proto(proto)?;
    Ok(w.buf)
}

/// Dump a Lua closure: apply the requested obfuscation passes, serialize,
/// and wrap in the envelope when asked (the default).
pub fn dump_closure(vm: &mut LuaVM, f: LuaValue, opts: &DumpOptions) -> LuaResult<Vec<u8>> {
    let Some(fid) = f.as_function_id() else {
        return Err(vm.raise_plain(LuaError::DumpError, "unable to dump given function"));
    };
    let proto = match vm.pool.get_function(fid).map(|g| &g.kind) {
        Some(crate::gc::ClosureKind::Lua { proto, .. }) => proto.clone(),
        _ => {
            return Err(vm.raise_plain(LuaError::DumpError, "unable to dump given function"));
        }
    };

    let transformed: Rc<Proto> = if opts.obfuscate.has_code_passes() {
        Rc::new(obfuscate::apply(&proto, opts.obfuscate, opts.seed))
    } else {
        proto
    };

    let payload = dump_proto(vm, &transformed, opts).map_err(|e| {
        vm.raise_plain(e, "unable to dump given function")
    })?;
    if opts.envelop {
        Ok(envelope::envelop(&payload))
    } else {
        Ok(payload)
    }
}

struct Reader<'a, 'vm> {
    vm: &'vm mut LuaVM,
    cur: Cursor<&'a [u8]>,
    strip: bool,
    enc_key: Option<u64>,
}

impl<'a, 'vm> Reader<'a, 'vm> {
    fn fail(&mut self, what: &str) -> LuaError {
        let msg = format!("invalid dump: {}", what);
        self.vm.raise_plain(LuaError::DumpError, msg)
    }

    fn u8(&mut self) -> LuaResult<u8> {
        let mut b = [0u8; 1];
        self.cur.read_exact(&mut b).map_err(|_| self.fail("truncated"))?;
        Ok(b[0])
    }

    fn u32(&mut self) -> LuaResult<u32> {
        let mut b = [0u8; 4];
        self.cur.read_exact(&mut b).map_err(|_| self.fail("truncated"))?;
        Ok(u32::from_le_bytes(b))
    }

    fn u64(&mut self) -> LuaResult<u64> {
        let mut b = [0u8; 8];
        self.cur.read_exact(&mut b).map_err(|_| self.fail("truncated"))?;
        Ok(u64::from_le_bytes(b))
    }

    fn bytes(&mut self) -> LuaResult<Vec<u8>> {
        let len = self.u32()? as usize;
        if len > 1 << 28 {
            return Err(self.fail("unreasonable length"));
        }
        let mut out = vec![0u8; len];
        self.cur.read_exact(&mut out).map_err(|_| self.fail("truncated"))?;
        Ok(out)
    }

    fn opt_str(&mut self) -> LuaResult<Option<String>> {
        if self.u8()? == 0 {
            return Ok(None);
        }
        let b = self.bytes()?;
        Ok(Some(String::from_utf8_lossy(&b).into_owned()))
    }

    fn constant(&mut self) -> LuaResult<LuaValue> {
        match self.u8()? {
            K_NIL => Ok(LuaValue::nil()),
            K_FALSE => Ok(LuaValue::boolean(false)),
            K_TRUE => Ok(LuaValue::boolean(true)),
            K_INT => {
                let raw = self.u64()? as i64;
                let v = match self.enc_key {
                    Some(key) => obfuscate::decode_int(raw, key),
                    None => raw,
                };
                Ok(LuaValue::integer(v))
            }
            K_FLOAT => {
                let bits = self.u64()?;
                Ok(LuaValue::float(f64::from_bits(bits)))
            }
            K_SHRSTR | K_LNGSTR => {
                let b = self.bytes()?;
                Ok(self.vm.intern(&b))
            }
            _ => Err(self.fail("bad constant tag")),
        }
    }

    fn proto(&mut self) -> LuaResult<Proto> {
        let mut p = Proto::new();
        p.source = self.opt_str()?;
        p.linedefined = self.u32()?;
        p.lastlinedefined = self.u32()?;
        p.numparams = self.u8()?;
        p.is_vararg = self.u8()? != 0;
        p.maxstacksize = self.u8()?;
        p.nodiscard = self.u8()? != 0;
        p.difierline_mode = self.u8()?;
        p.difierline_magicnum = self.u32()?;
        p.difierline_data = self.u32()?;

        let ncode = self.u32()? as usize;
        if ncode > 1 << 26 {
            return Err(self.fail("unreasonable code size"));
        }
        p.code.reserve(ncode);
        for _ in 0..ncode {
            p.code.push(self.u32()?);
        }

        let nk = self.u32()? as usize;
        for _ in 0..nk {
            let k = self.constant()?;
            p.constants.push(k);
        }

        let nup = self.u32()? as usize;
        for _ in 0..nup {
            p.upvalue_descs.push(UpvalueDesc {
                name: None,
                instack: self.u8()? != 0,
                idx: self.u8()?,
                kind: self.u8()?,
            });
        }

        let nline = self.u32()? as usize;
        for _ in 0..nline {
            p.line_info.push(self.u8()? as i8);
        }
        let nabs = self.u32()? as usize;
        for _ in 0..nabs {
            let pc = self.u32()?;
            let line = self.u32()?;
            p.abs_line_info.push(AbsLineInfo { pc, line });
        }
        let nloc = self.u32()? as usize;
        for _ in 0..nloc {
            let name = String::from_utf8_lossy(&self.bytes()?).into_owned();
            let startpc = self.u32()?;
            let endpc = self.u32()?;
            p.locvars.push(LocVar { name, startpc, endpc });
        }
        let nupnames = self.u32()? as usize;
        for i in 0..nupnames {
            let name = self.opt_str()?;
            if let Some(d) = p.upvalue_descs.get_mut(i) {
                d.name = name;
            }
        }

        let nprotos = self.u32()? as usize;
        for _ in 0..nprotos {
            let child = self.proto()?;
            p.protos.push(Rc::new(child));
        }
        Ok(p)
    }
}

/// Whether a chunk of bytes looks like a binary dump.
pub fn is_dump(blob: &[u8]) -> bool {
    blob.starts_with(DUMP_SIGNATURE)
}

/// Deserialize a dump blob (already un-enveloped) into a prototype tree.
pub fn undump(vm: &mut LuaVM, blob: &[u8]) -> LuaResult<Rc<Proto>> {
    if !is_dump(blob) {
        return Err(vm.raise_plain(LuaError::DumpError, "invalid dump: bad signature"));
    }
    if blob.len() < 12 {
        return Err(vm.raise_plain(LuaError::DumpError, "invalid dump: truncated header"));
    }
    let header = &blob[4..12];
    if header[0] != DUMP_MAJOR || header[1] != DUMP_MINOR {
        return Err(vm.raise_plain(LuaError::DumpError, "invalid dump: version mismatch"));
    }
    if header[2] != DUMP_FORMAT {
        return Err(vm.raise_plain(LuaError::DumpError, "invalid dump: unknown format"));
    }
    if header[3] != 8 || header[4] != 8 {
        return Err(vm.raise_plain(LuaError::DumpError, "invalid dump: size mismatch"));
    }
    let flags = header[5];
    if flags & FLAG_LITTLE_ENDIAN == 0 {
        return Err(vm.raise_plain(LuaError::DumpError, "invalid dump: endianness mismatch"));
    }

    let mut r = Reader {
        vm,
        cur: Cursor::new(&blob[12..]),
        strip: header[6] != 0,
        enc_key: None,
    };
    if flags & (1 << 2) != 0 {
        let seed = r.u64()?;
        r.enc_key = Some(obfuscate::derive_enc_key(seed));
    }
    let _ = r.strip;
    let p = r.proto()?;
    Ok(Rc::new(p))
}

/// Load a blob that may be enveloped, a raw dump, or source text (which
/// goes to the registered frontend).
pub fn load(vm: &mut LuaVM, blob: &[u8], chunkname: &str) -> LuaResult<LuaValue> {
    let proto = if envelope::is_enveloped(blob) {
        let inner = envelope::unenvelop(vm, blob)?;
        if !is_dump(&inner) {
            return Err(vm.raise_plain(LuaError::DumpError, "invalid dump: bad envelope payload"));
        }
        undump(vm, &inner)?
    } else if is_dump(blob) {
        undump(vm, blob)?
    } else {
        let source = String::from_utf8_lossy(blob).into_owned();
        vm.compile_source(&source, chunkname)?
    };
    Ok(vm.closure_from_proto(proto))
}
