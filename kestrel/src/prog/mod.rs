//! Program model: instructions, memory image and process.
//!
//! A [`Process`] is produced by a loader plug-in and owns the memory image
//! and the instruction table of one task. Instructions are immutable for
//! the whole process lifetime.

pub mod loader;

use crate::error::{Error, Result};
use ahash::AHashMap;
use serde::{Deserialize, Serialize};

/// Machine address.
pub type Address = u64;

/// Register identifier inside the platform register bank.
pub type Register = u16;

/// Instruction kind bit set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct InstKind(pub u32);

impl InstKind {
    pub const NONE: InstKind = InstKind(0);
    /// Transfers control (branch, call or return).
    pub const CONTROL: InstKind = InstKind(1 << 0);
    /// Function call.
    pub const CALL: InstKind = InstKind(1 << 1);
    /// Function return.
    pub const RETURN: InstKind = InstKind(1 << 2);
    /// Reads memory.
    pub const LOAD: InstKind = InstKind(1 << 3);
    /// Writes memory.
    pub const STORE: InstKind = InstKind(1 << 4);
    /// Guarded by a condition (predicated or conditional branch).
    pub const COND: InstKind = InstKind(1 << 5);
    /// Expands to several memory accesses (load/store multiple).
    pub const MULTI: InstKind = InstKind(1 << 6);
    /// Target or semantics unknown to the loader.
    pub const UNKNOWN: InstKind = InstKind(1 << 7);
    /// Last slot of a VLIW bundle.
    pub const BUNDLE_END: InstKind = InstKind(1 << 8);
    /// Integer/float computation using an execution unit.
    pub const ALU: InstKind = InstKind(1 << 9);
    /// Multiplication/division class, usually on a dedicated unit.
    pub const MUL: InstKind = InstKind(1 << 10);
    /// Floating-point class.
    pub const FLOAT: InstKind = InstKind(1 << 11);
    /// Guard lowered to a no-op by the conditional restructurer; annulled
    /// slots occupy the pipeline but produce no events.
    pub const ANNULLED: InstKind = InstKind(1 << 15);

    pub fn contains(self, other: InstKind) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn is_control(self) -> bool {
        self.contains(Self::CONTROL)
    }

    pub fn is_call(self) -> bool {
        self.contains(Self::CALL)
    }

    pub fn is_return(self) -> bool {
        self.contains(Self::RETURN)
    }

    /// Plain branch: control transfer that is neither call nor return.
    pub fn is_branch(self) -> bool {
        self.is_control() && !self.is_call() && !self.is_return()
    }

    pub fn is_cond(self) -> bool {
        self.contains(Self::COND)
    }

    pub fn is_load(self) -> bool {
        self.contains(Self::LOAD)
    }

    pub fn is_store(self) -> bool {
        self.contains(Self::STORE)
    }

    pub fn is_mem(self) -> bool {
        self.is_load() || self.is_store()
    }

    pub fn is_unknown(self) -> bool {
        self.contains(Self::UNKNOWN)
    }

    pub fn is_annulled(self) -> bool {
        self.contains(Self::ANNULLED)
    }
}

impl std::ops::BitOr for InstKind {
    type Output = InstKind;
    fn bitor(self, rhs: InstKind) -> InstKind {
        InstKind(self.0 | rhs.0)
    }
}

/// One decoded instruction. Immutable once the process is built.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Inst {
    address: Address,
    size: u32,
    kind: InstKind,
    /// Branch/call target when the loader could resolve it.
    target: Option<Address>,
    /// Registers read, when the loader supports register usage.
    reads: Option<Vec<Register>>,
    /// Registers written, when the loader supports register usage.
    writes: Option<Vec<Register>>,
}

impl Inst {
    pub fn new(address: Address, size: u32, kind: InstKind) -> Self {
        Self {
            address,
            size,
            kind,
            target: None,
            reads: None,
            writes: None,
        }
    }

    pub fn with_target(mut self, target: Address) -> Self {
        self.target = Some(target);
        self
    }

    pub fn with_regs(mut self, reads: Vec<Register>, writes: Vec<Register>) -> Self {
        self.reads = Some(reads);
        self.writes = Some(writes);
        self
    }

    pub fn address(&self) -> Address {
        self.address
    }

    pub fn size(&self) -> u32 {
        self.size
    }

    /// Address of the next sequential instruction.
    pub fn top_address(&self) -> Address {
        self.address + self.size as Address
    }

    pub fn kind(&self) -> InstKind {
        self.kind
    }

    pub fn target(&self) -> Option<Address> {
        self.target
    }

    /// Registers read by this instruction.
    ///
    /// Fails with [`Error::Unsupported`] when the loader did not provide
    /// register usage; the caller may fall back to a dependency-free model.
    pub fn reads(&self) -> Result<&[Register]> {
        self.reads.as_deref().ok_or_else(|| {
            Error::Unsupported(format!("register read set at {:#x}", self.address))
        })
    }

    pub fn writes(&self) -> Result<&[Register]> {
        self.writes.as_deref().ok_or_else(|| {
            Error::Unsupported(format!("register write set at {:#x}", self.address))
        })
    }

    /// Register usage without the capability check, for analyses that
    /// degrade gracefully.
    pub fn reads_opt(&self) -> Option<&[Register]> {
        self.reads.as_deref()
    }

    pub fn writes_opt(&self) -> Option<&[Register]> {
        self.writes.as_deref()
    }
}

/// Kind of a symbol table entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SymbolKind {
    Function,
    Label,
    Data,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Symbol {
    pub name: String,
    pub address: Address,
    pub size: u64,
    pub kind: SymbolKind,
}

/// One contiguous piece of the memory image.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Segment {
    pub name: String,
    pub base: Address,
    pub data: Vec<u8>,
    pub executable: bool,
}

impl Segment {
    pub fn contains(&self, addr: Address) -> bool {
        addr >= self.base && addr < self.base + self.data.len() as Address
    }
}

/// Source line information, when the loader provides it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceLine {
    pub file: String,
    pub line: u32,
}

/// The loaded task: memory image, instruction table and symbols.
pub struct Process {
    name: String,
    start: Address,
    segments: Vec<Segment>,
    insts: Vec<Inst>,
    by_address: AHashMap<Address, usize>,
    symbols: Vec<Symbol>,
    by_name: AHashMap<String, usize>,
    lines: AHashMap<Address, SourceLine>,
}

impl Process {
    pub fn builder(name: impl Into<String>) -> ProcessBuilder {
        ProcessBuilder {
            name: name.into(),
            start: 0,
            segments: Vec::new(),
            insts: Vec::new(),
            symbols: Vec::new(),
            lines: AHashMap::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Program entry point.
    pub fn start(&self) -> Address {
        self.start
    }

    /// Instruction at exactly the given address.
    pub fn inst_at(&self, addr: Address) -> Option<&Inst> {
        self.by_address.get(&addr).map(|&i| &self.insts[i])
    }

    pub fn insts(&self) -> &[Inst] {
        &self.insts
    }

    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    pub fn symbols(&self) -> &[Symbol] {
        &self.symbols
    }

    pub fn symbol_by_name(&self, name: &str) -> Option<&Symbol> {
        self.by_name.get(name).map(|&i| &self.symbols[i])
    }

    /// Innermost symbol covering the given address.
    pub fn symbol_at(&self, addr: Address) -> Option<&Symbol> {
        self.symbols
            .iter()
            .filter(|s| addr >= s.address && (s.size == 0 || addr < s.address + s.size))
            .min_by_key(|s| s.size)
    }

    pub fn source_line(&self, addr: Address) -> Option<&SourceLine> {
        self.lines.get(&addr)
    }

    fn segment_for(&self, addr: Address) -> Result<&Segment> {
        self.segments
            .iter()
            .find(|s| s.contains(addr))
            .ok_or_else(|| Error::Unsupported(format!("no segment maps address {:#x}", addr)))
    }

    /// Typed little-endian memory reads over the image.
    pub fn read_u8(&self, addr: Address) -> Result<u8> {
        let seg = self.segment_for(addr)?;
        Ok(seg.data[(addr - seg.base) as usize])
    }

    pub fn read_u16(&self, addr: Address) -> Result<u16> {
        Ok(u16::from_le_bytes([self.read_u8(addr)?, self.read_u8(addr + 1)?]))
    }

    pub fn read_u32(&self, addr: Address) -> Result<u32> {
        let mut bytes = [0u8; 4];
        for (i, b) in bytes.iter_mut().enumerate() {
            *b = self.read_u8(addr + i as Address)?;
        }
        Ok(u32::from_le_bytes(bytes))
    }

    pub fn read_u64(&self, addr: Address) -> Result<u64> {
        let mut bytes = [0u8; 8];
        for (i, b) in bytes.iter_mut().enumerate() {
            *b = self.read_u8(addr + i as Address)?;
        }
        Ok(u64::from_le_bytes(bytes))
    }
}

/// Incremental construction of a process by a loader.
pub struct ProcessBuilder {
    name: String,
    start: Address,
    segments: Vec<Segment>,
    insts: Vec<Inst>,
    symbols: Vec<Symbol>,
    lines: AHashMap<Address, SourceLine>,
}

impl ProcessBuilder {
    pub fn start(mut self, addr: Address) -> Self {
        self.start = addr;
        self
    }

    pub fn segment(mut self, seg: Segment) -> Self {
        self.segments.push(seg);
        self
    }

    pub fn inst(mut self, inst: Inst) -> Self {
        self.insts.push(inst);
        self
    }

    pub fn insts(mut self, insts: impl IntoIterator<Item = Inst>) -> Self {
        self.insts.extend(insts);
        self
    }

    pub fn symbol(mut self, sym: Symbol) -> Self {
        self.symbols.push(sym);
        self
    }

    pub fn line(mut self, addr: Address, line: SourceLine) -> Self {
        self.lines.insert(addr, line);
        self
    }

    pub fn build(mut self) -> Process {
        self.insts.sort_by_key(|i| i.address());
        let by_address = self
            .insts
            .iter()
            .enumerate()
            .map(|(i, inst)| (inst.address(), i))
            .collect();
        let by_name = self
            .symbols
            .iter()
            .enumerate()
            .map(|(i, s)| (s.name.clone(), i))
            .collect();
        Process {
            name: self.name,
            start: self.start,
            segments: self.segments,
            insts: self.insts,
            by_address,
            symbols: self.symbols,
            by_name,
            lines: self.lines,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_process() -> Process {
        Process::builder("sample")
            .start(0x1000)
            .segment(Segment {
                name: ".text".into(),
                base: 0x1000,
                data: vec![0xde, 0xad, 0xbe, 0xef, 0x00, 0x11, 0x22, 0x33],
                executable: true,
            })
            .inst(Inst::new(0x1000, 4, InstKind::ALU))
            .inst(Inst::new(0x1004, 4, InstKind::CONTROL | InstKind::RETURN))
            .symbol(Symbol {
                name: "main".into(),
                address: 0x1000,
                size: 8,
                kind: SymbolKind::Function,
            })
            .build()
    }

    #[test]
    fn test_inst_lookup() {
        let proc = sample_process();
        assert!(proc.inst_at(0x1000).is_some());
        assert!(proc.inst_at(0x1002).is_none());
        assert_eq!(proc.inst_at(0x1004).unwrap().kind().is_return(), true);
    }

    #[test]
    fn test_typed_reads() {
        let proc = sample_process();
        assert_eq!(proc.read_u8(0x1000).unwrap(), 0xde);
        assert_eq!(proc.read_u32(0x1004).unwrap(), 0x33221100);
        assert!(proc.read_u8(0x2000).is_err());
    }

    #[test]
    fn test_symbol_resolution() {
        let proc = sample_process();
        assert_eq!(proc.symbol_by_name("main").unwrap().address, 0x1000);
        assert_eq!(proc.symbol_at(0x1004).unwrap().name, "main");
    }

    #[test]
    fn test_register_capability() {
        let bare = Inst::new(0x1000, 4, InstKind::ALU);
        assert!(bare.reads().is_err());

        let full = Inst::new(0x1000, 4, InstKind::ALU).with_regs(vec![1, 2], vec![0]);
        assert_eq!(full.reads().unwrap(), &[1, 2]);
        assert_eq!(full.writes().unwrap(), &[0]);
    }

    #[test]
    fn test_kind_predicates() {
        let call = InstKind::CONTROL | InstKind::CALL;
        assert!(call.is_control());
        assert!(call.is_call());
        assert!(!call.is_branch());

        let branch = InstKind::CONTROL | InstKind::COND;
        assert!(branch.is_branch());
        assert!(branch.is_cond());
    }
}
