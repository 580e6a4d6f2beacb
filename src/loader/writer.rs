//! A C4R writer used only to build in-process test fixtures (spec.md §6.1 [ADD]); the inverse of
//! [`super::Module::parse`]. Grounded on `multitool::cart::Cart`'s incremental buffer writes
//! (`add_op`/`copy_data`-style length-prefixed packing) rather than on any real compiler backend —
//! this crate has no compiler front-end, so fixtures are assembled directly as `Op` sequences.

use byteorder::{LittleEndian, WriteBytesExt};
use c4rt_abi::format;
use c4rt_abi::opcode::{self, Op};
use c4rt_abi::Word;

/// One relocation patch, mirroring `c4rt_abi::format::RawPatch` but built up incrementally.
#[derive(Copy, Clone)]
pub struct Patch {
    pub kind: i64,
    pub address: i64,
    pub value: i64,
}

#[derive(Clone)]
pub struct SymbolEntry {
    pub id: i64,
    pub kind: i64,
    pub class: i64,
    pub attr: i64,
    pub name: String,
    pub value: i64,
}

/// Incrementally builds a code stream and emits a complete C4R image.
#[derive(Default)]
pub struct ModuleWriter {
    code: Vec<Word>,
    data: Vec<u8>,
    patches: Vec<Patch>,
    ctors: Vec<Word>,
    dtors: Vec<Word>,
    symbols: Vec<SymbolEntry>,
    entry: Option<Word>,
}

impl ModuleWriter {
    pub fn new() -> ModuleWriter {
        ModuleWriter::default()
    }

    /// Append one bare opcode, returning its word offset in the code stream.
    pub fn op(&mut self, op: Op) -> Word {
        let at = self.code.len() as Word;
        self.code.push(opcode::encode(op));
        at
    }

    /// Append an opcode that takes an immediate operand.
    pub fn op_imm(&mut self, op: Op, imm: Word) -> Word {
        let at = self.code.len() as Word;
        self.code.push(opcode::encode(op));
        self.code.push(imm);
        at
    }

    /// Append a raw code word (used for hand-built illegal-opcode fixtures).
    pub fn raw(&mut self, word: Word) -> Word {
        let at = self.code.len() as Word;
        self.code.push(word);
        at
    }

    pub fn here(&self) -> Word {
        self.code.len() as Word
    }

    pub fn set_entry(&mut self, offset: Word) {
        self.entry = Some(offset);
    }

    pub fn add_data(&mut self, bytes: &[u8]) -> Word {
        let at = self.data.len() as Word;
        self.data.extend_from_slice(bytes);
        at
    }

    pub fn add_code_patch(&mut self, address: Word, value: Word) {
        self.patches.push(Patch {
            kind: format::PATCH_CODE,
            address,
            value,
        });
    }

    pub fn add_data_patch(&mut self, address: Word, value: Word) {
        self.patches.push(Patch {
            kind: format::PATCH_DATA,
            address,
            value,
        });
    }

    pub fn add_ctor(&mut self, offset: Word) {
        self.ctors.push(offset);
    }

    pub fn add_dtor(&mut self, offset: Word) {
        self.dtors.push(offset);
    }

    pub fn add_symbol(&mut self, sym: SymbolEntry) {
        self.symbols.push(sym);
    }

    /// Serialize to a complete C4R byte image.
    pub fn finish(&self) -> Vec<u8> {
        let mut out = Vec::new();

        out.extend_from_slice(&format::MAGIC);
        out.push(format::VERSION);
        out.push(format::WORD_BITS);

        let mut w = |v: Word| out.write_i64::<LittleEndian>(v).unwrap();
        w(self.entry.unwrap_or(format::NO_ENTRY));
        w(self.code.len() as Word);
        w(self.data.len() as Word);
        w(self.patches.len() as Word);
        w(self.symbols.len() as Word);
        w(self.ctors.len() as Word);
        w(self.dtors.len() as Word);

        out.push(format::MARKER_CODE);
        for &word in &self.code {
            out.write_i64::<LittleEndian>(word).unwrap();
        }

        out.push(format::MARKER_DATA);
        out.extend_from_slice(&self.data);

        out.push(format::MARKER_PATCH);
        for p in &self.patches {
            out.write_i64::<LittleEndian>(p.kind).unwrap();
            out.write_i64::<LittleEndian>(p.address).unwrap();
            out.write_i64::<LittleEndian>(p.value).unwrap();
        }

        out.push(format::MARKER_CTORS);
        for &c in &self.ctors {
            out.write_i64::<LittleEndian>(c).unwrap();
        }

        out.push(format::MARKER_DTORS);
        for &d in &self.dtors {
            out.write_i64::<LittleEndian>(d).unwrap();
        }

        out.push(format::MARKER_SYMBOLS);
        for s in &self.symbols {
            out.write_i64::<LittleEndian>(s.id).unwrap();
            out.write_i64::<LittleEndian>(s.kind).unwrap();
            out.write_i64::<LittleEndian>(s.class).unwrap();
            out.write_i64::<LittleEndian>(s.attr).unwrap();
            out.push(s.name.len() as u8);
            out.extend_from_slice(s.name.as_bytes());
            out.write_i64::<LittleEndian>(s.value).unwrap();
        }

        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mem::Memory;

    #[test]
    fn round_trips_through_the_parser() {
        let mut w = ModuleWriter::new();
        w.set_entry(0);
        w.op_imm(Op::Imm, 42);
        w.op(Op::Exit);
        let bytes = w.finish();

        let mut mem = Memory::new(4096);
        let module = super::super::Module::parse(&bytes, &mut mem).unwrap();
        assert_eq!(module.code_len, 3);
        assert!(module.entry.is_some());
    }
}
