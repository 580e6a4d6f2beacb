//! The C4R relocatable-object loader (spec.md §4.3, wire format in §6.1).
//!
//! Reads with `byteorder`'s `LittleEndian` helpers over a `Cursor`, the mirror image of
//! `multitool::cart::Cart`'s incremental byte-packing writer. Parse failures become a typed
//! `LoadError` rather than `anyhow`, matching the split the teacher keeps between `multitool`
//! (anyhow at the binary) and its lower-level modules.

#[cfg(any(test, feature = "test-support"))]
pub mod writer;

use std::io::{Cursor, Read};

use byteorder::{LittleEndian, ReadBytesExt};
use c4rt_abi::format::{self, PatchType};
use c4rt_abi::Word;

use crate::mem::{Memory, WORD_SIZE};

#[derive(Debug, thiserror::Error)]
pub enum LoadError {
    #[error("bad signature: expected {:?}", format::MAGIC)]
    BadSignature,
    #[error("unsupported format version {found} (this loader understands up to {max})")]
    UnsupportedVersion { found: u8, max: u8 },
    #[error("word size mismatch: module is {found}-bit, this build is {expected}-bit")]
    WordSizeMismatch { found: u8, expected: u8 },
    #[error("truncated file: expected {expected} more bytes, found {found}")]
    Truncated { expected: usize, found: usize },
    #[error("desynced segment: expected marker {expected:?}, found {found:?}")]
    BadMarker { expected: char, found: char },
    #[error("unknown patch type {0}")]
    BadPatchType(i64),
    #[error("patch address {0:#x} lies outside the code segment")]
    PatchOutOfRange(i64),
    #[error(transparent)]
    Mem(#[from] crate::mem::MemError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// A diagnostic-only symbol table entry (`original_source/load-c4r.c` supplement, spec.md §6.1
/// `S` segment): never consulted by the running VM, only by the fault reporter's stack walk.
#[derive(Clone, Debug)]
pub struct Symbol {
    pub id: i64,
    pub kind: i64,
    pub class: i64,
    pub attr: i64,
    pub name: String,
    pub value: i64,
}

/// One loaded module: code and data live in the kernel's shared [`Memory`] arena at `code_base`/
/// `data_base`; this struct is just the bookkeeping needed to run and eventually free it.
pub struct Module {
    pub code_base: u64,
    pub code_len: usize,
    pub data_base: u64,
    pub data_len: usize,
    /// Absolute code address of the entry point, or `None` for a library module.
    pub entry: Option<u64>,
    pub ctors: Vec<u64>,
    pub dtors: Vec<u64>,
    pub symbols: Vec<Symbol>,
}

impl Module {
    /// Parse a C4R image, allocating its code and data into `mem`, relocating every patch, and
    /// leaving the two regions ready to execute. Does not run constructors; see [`Module::run`].
    pub fn parse(bytes: &[u8], mem: &mut Memory) -> Result<Module, LoadError> {
        let mut c = Cursor::new(bytes);

        let mut magic = [0u8; 3];
        read_exact(&mut c, &mut magic)?;
        if magic != format::MAGIC {
            return Err(LoadError::BadSignature);
        }

        let version = read_u8(&mut c)?;
        if version > format::VERSION {
            return Err(LoadError::UnsupportedVersion {
                found: version,
                max: format::VERSION,
            });
        }

        let word_bits = read_u8(&mut c)?;
        if word_bits != format::WORD_BITS {
            return Err(LoadError::WordSizeMismatch {
                found: word_bits,
                expected: format::WORD_BITS,
            });
        }

        let entry_raw = read_word(&mut c)?;
        let code_len = read_word(&mut c)? as usize;
        let data_len = read_word(&mut c)? as usize;
        let patch_count = read_word(&mut c)? as usize;
        let symbol_count = read_word(&mut c)? as usize;
        let ctor_count = read_word(&mut c)? as usize;
        let dtor_count = read_word(&mut c)? as usize;

        expect_marker(&mut c, format::MARKER_CODE)?;
        let code_base = mem.alloc((code_len * WORD_SIZE) as u64, WORD_SIZE as u64)?;
        for i in 0..code_len {
            let w = read_word(&mut c)?;
            mem.write_word(code_base + (i * WORD_SIZE) as u64, w)?;
        }

        expect_marker(&mut c, format::MARKER_DATA)?;
        let data_base = mem.alloc(data_len as u64, WORD_SIZE as u64)?;
        let mut data_bytes = vec![0u8; data_len];
        read_exact(&mut c, &mut data_bytes)?;
        mem.write_slice(data_base, &data_bytes)?;

        expect_marker(&mut c, format::MARKER_PATCH)?;
        for _ in 0..patch_count {
            let kind = read_word(&mut c)?;
            let address = read_word(&mut c)?;
            let value = read_word(&mut c)?;
            apply_patch(mem, code_base, data_base, code_len, kind, address, value)?;
        }

        expect_marker(&mut c, format::MARKER_CTORS)?;
        let mut ctors = Vec::with_capacity(ctor_count);
        for _ in 0..ctor_count {
            ctors.push(code_base + (read_word(&mut c)? as u64) * WORD_SIZE as u64);
        }

        expect_marker(&mut c, format::MARKER_DTORS)?;
        let mut dtors = Vec::with_capacity(dtor_count);
        for _ in 0..dtor_count {
            dtors.push(code_base + (read_word(&mut c)? as u64) * WORD_SIZE as u64);
        }

        expect_marker(&mut c, format::MARKER_SYMBOLS)?;
        let mut symbols = Vec::with_capacity(symbol_count);
        for _ in 0..symbol_count {
            let id = read_word(&mut c)?;
            let kind = read_word(&mut c)?;
            let class = read_word(&mut c)?;
            let attr = read_word(&mut c)?;
            let name_len = read_u8(&mut c)? as usize;
            let mut name_bytes = vec![0u8; name_len];
            read_exact(&mut c, &mut name_bytes)?;
            let value = read_word(&mut c)?;
            symbols.push(Symbol {
                id,
                kind,
                class,
                attr,
                name: String::from_utf8_lossy(&name_bytes).into_owned(),
                value,
            });
        }

        let entry = if entry_raw == format::NO_ENTRY {
            None
        } else {
            Some(code_base + (entry_raw as u64) * WORD_SIZE as u64)
        };

        Ok(Module {
            code_base,
            code_len,
            data_base,
            data_len,
            entry,
            ctors,
            dtors,
            symbols,
        })
    }

    /// Find the symbol whose value is the largest one not exceeding `pc`'s code offset, for
    /// best-effort fault diagnostics (spec.md §7 "nearest preceding symbol").
    pub fn symbol_for_pc(&self, pc: u64) -> Option<&Symbol> {
        if pc < self.code_base {
            return None;
        }
        let offset = ((pc - self.code_base) / WORD_SIZE as u64) as i64;
        self.symbols
            .iter()
            .filter(|s| s.value <= offset)
            .max_by_key(|s| s.value)
    }

    /// Release this module's code and data back to the arena (spec.md §4.3 "owns all allocations
    /// it performs and exposes a single *free* operation").
    pub fn free(&self, mem: &mut Memory) {
        mem.free(self.code_base, (self.code_len * WORD_SIZE) as u64);
        mem.free(self.data_base, self.data_len as u64);
    }
}

fn apply_patch(
    mem: &mut Memory,
    code_base: u64,
    data_base: u64,
    code_len: usize,
    kind: i64,
    address: i64,
    value: i64,
) -> Result<(), LoadError> {
    if address < 0 || address as usize >= code_len {
        return Err(LoadError::PatchOutOfRange(address));
    }
    let slot = code_base + (address as u64) * WORD_SIZE as u64;

    match PatchType::from_raw(kind) {
        Some(PatchType::Code) => {
            mem.write_word(slot, code_base as Word + value)?;
        }
        Some(PatchType::Data) => {
            mem.write_word(slot, data_base as Word + value)?;
        }
        Some(PatchType::Symbol(_)) => {
            // Unresolved externals are deferred; this core links monolithically and never
            // resolves them at runtime (spec.md §4.3 step 4).
        }
        None => return Err(LoadError::BadPatchType(kind)),
    }
    Ok(())
}

fn read_exact(c: &mut Cursor<&[u8]>, buf: &mut [u8]) -> Result<(), LoadError> {
    let remaining = (c.get_ref().len() as u64).saturating_sub(c.position()) as usize;
    if remaining < buf.len() {
        return Err(LoadError::Truncated {
            expected: buf.len(),
            found: remaining,
        });
    }
    c.read_exact(buf).map_err(LoadError::from)
}

fn read_u8(c: &mut Cursor<&[u8]>) -> Result<u8, LoadError> {
    c.read_u8().map_err(LoadError::from)
}

fn read_word(c: &mut Cursor<&[u8]>) -> Result<Word, LoadError> {
    c.read_i64::<LittleEndian>().map_err(LoadError::from)
}

fn expect_marker(c: &mut Cursor<&[u8]>, expected: u8) -> Result<(), LoadError> {
    let found = read_u8(c)?;
    if found != expected {
        return Err(LoadError::BadMarker {
            expected: expected as char,
            found: found as char,
        });
    }
    Ok(())
}
