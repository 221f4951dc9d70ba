//! Arena representation of the normalized program IR.
//!
//! The detector consumes an already-lowered view of the target program: a
//! [`Module`] owning functions, which own basic blocks and instructions.
//! All cross-references are integer handles ([`FuncId`], [`BlockId`],
//! [`InstrId`], [`GlobalId`]) resolved through the owning arena, so traces
//! and analyses can hold references to IR freely without lifetime webs.
//!
//! The whole representation is serde-serializable; the CLI loads a module
//! from a JSON file produced by the IR front end.

pub mod build;
pub mod cfg;
pub mod model;
pub mod summary;

use std::fmt;

use fnv::FnvHashMap;
use serde::{Deserialize, Serialize};

/// Handle to a function in a [`Module`].
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(transparent)]
pub struct FuncId(pub u32);

/// Handle to a basic block within its owning function.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(transparent)]
pub struct BlockId(pub u32);

/// Handle to an instruction within its owning function's arena.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(transparent)]
pub struct InstrId(pub u32);

/// Handle to a module-level global variable.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(transparent)]
pub struct GlobalId(pub u32);

/// A value operand. `Instr` and `Arg` are only meaningful within their
/// owning function; use [`Module::value_key`] for module-wide identity.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Value {
    Global(GlobalId),
    Instr(InstrId),
    Arg(u32),
    Func(FuncId),
    Const(i64),
}

/// Module-wide identity for a value, qualified by the owning function where
/// the handle alone is ambiguous. Used as lock identity and as the key for
/// points-to roots.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ValueKey {
    Global(GlobalId),
    Func(FuncId),
    Local(FuncId, InstrId),
    Arg(FuncId, u32),
    Const(i64),
}

/// Source location carried on instructions and surfaced in race reports.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SourceLoc {
    pub file: String,
    pub line: u32,
    pub col: u32,
}

impl fmt::Display for SourceLoc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.file, self.line, self.col)
    }
}

/// An instruction site: function plus instruction handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct InstrSite {
    pub func: FuncId,
    pub instr: InstrId,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    SDiv,
    SRem,
    And,
    Or,
    Xor,
    Shl,
    LShr,
    AShr,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CastOp {
    SExt,
    ZExt,
    Trunc,
    Bitcast,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CmpPred {
    Eq,
    Ne,
    Slt,
    Sle,
    Sgt,
    Sge,
}

/// Closed set of normalized instruction kinds. One arm per kind keeps the
/// match sites exhaustive; an unanticipated construct is a front-end bug,
/// not a silent fallthrough.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub enum InstrKind {
    Load {
        ptr: Value,
        #[serde(default)]
        atomic: bool,
        #[serde(default)]
        volatile: bool,
    },
    Store {
        ptr: Value,
        value: Value,
        #[serde(default)]
        atomic: bool,
        #[serde(default)]
        volatile: bool,
    },
    /// One index per node; multi-dimensional accesses chain through `base`.
    /// `elem_size` is the byte size of the indexed element, so the address
    /// contribution of this level is `index * elem_size`.
    Gep {
        base: Value,
        index: Value,
        #[serde(default = "default_elem_size")]
        elem_size: u64,
    },
    BinOp {
        op: BinOp,
        lhs: Value,
        rhs: Value,
    },
    Cast {
        op: CastOp,
        value: Value,
    },
    Phi {
        incoming: Vec<(BlockId, Value)>,
    },
    Cmp {
        pred: CmpPred,
        lhs: Value,
        rhs: Value,
    },
    Branch {
        cond: Option<Value>,
        then_blk: BlockId,
        else_blk: Option<BlockId>,
    },
    Switch {
        value: Value,
        default: BlockId,
        cases: Vec<(i64, BlockId)>,
    },
    Call {
        /// `None` marks an indirect call through a value.
        callee: Option<String>,
        #[serde(default)]
        args: Vec<Value>,
    },
    Alloca,
    Return {
        #[serde(default)]
        value: Option<Value>,
    },
}

fn default_elem_size() -> u64 {
    1
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Instr {
    pub kind: InstrKind,
    #[serde(default)]
    pub loc: Option<SourceLoc>,
}

/// A basic block: ordered instruction handles into the function arena.
/// Successors are derived from the block's terminator.
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct Block {
    pub instrs: Vec<InstrId>,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Function {
    pub name: String,
    #[serde(default)]
    pub params: u32,
    #[serde(default)]
    pub is_external: bool,
    #[serde(default)]
    pub blocks: Vec<Block>,
    #[serde(default)]
    pub instrs: Vec<Instr>,

    // Built by `Module::freeze`, not part of the wire format.
    #[serde(skip)]
    instr_blocks: Vec<BlockId>,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Global {
    pub name: String,
    #[serde(default)]
    pub thread_local: bool,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct Module {
    #[serde(default)]
    pub globals: Vec<Global>,
    #[serde(default)]
    pub functions: Vec<Function>,

    #[serde(skip)]
    func_names: FnvHashMap<String, FuncId>,
}

impl Function {
    /// Define a function from its block/instruction arenas.
    pub fn define(name: impl Into<String>, params: u32, blocks: Vec<Block>, instrs: Vec<Instr>) -> Self {
        let mut func = Function {
            name: name.into(),
            params,
            is_external: false,
            blocks,
            instrs,
            instr_blocks: Vec::new(),
        };
        func.build_instr_blocks();
        func
    }

    /// Declare an external (body-less) function.
    pub fn declare(name: impl Into<String>, params: u32) -> Self {
        Function {
            name: name.into(),
            params,
            is_external: true,
            blocks: Vec::new(),
            instrs: Vec::new(),
            instr_blocks: Vec::new(),
        }
    }

    pub fn instr(&self, id: InstrId) -> &Instr {
        &self.instrs[id.0 as usize]
    }

    pub fn block(&self, id: BlockId) -> &Block {
        &self.blocks[id.0 as usize]
    }

    /// Parent block of an instruction. Valid only after `Module::freeze`.
    pub fn block_of(&self, id: InstrId) -> BlockId {
        self.instr_blocks[id.0 as usize]
    }

    /// Position of an instruction within its parent block.
    pub fn index_in_block(&self, id: InstrId) -> usize {
        let block = self.block(self.block_of(id));
        block
            .instrs
            .iter()
            .position(|&i| i == id)
            .expect("instruction not present in its parent block")
    }

    /// The instruction immediately after `id` in the same block, if any.
    pub fn next_in_block(&self, id: InstrId) -> Option<InstrId> {
        let block = self.block(self.block_of(id));
        let pos = self.index_in_block(id);
        block.instrs.get(pos + 1).copied()
    }

    /// Successor blocks derived from the terminator.
    pub fn successors(&self, block: BlockId) -> Vec<BlockId> {
        let Some(&term) = self.block(block).instrs.last() else {
            return Vec::new();
        };
        match &self.instr(term).kind {
            InstrKind::Branch {
                then_blk, else_blk, ..
            } => {
                let mut succs = vec![*then_blk];
                if let Some(e) = else_blk {
                    if e != then_blk {
                        succs.push(*e);
                    }
                }
                succs
            }
            InstrKind::Switch { default, cases, .. } => {
                let mut succs = vec![*default];
                for (_, target) in cases {
                    if !succs.contains(target) {
                        succs.push(*target);
                    }
                }
                succs
            }
            _ => Vec::new(),
        }
    }

    /// Instructions of the whole function in block order.
    pub fn instrs_in_order(&self) -> impl Iterator<Item = InstrId> + '_ {
        self.blocks.iter().flat_map(|b| b.instrs.iter().copied())
    }

    /// All instructions that use `value` as an operand.
    pub fn users(&self, value: Value) -> Vec<InstrId> {
        let mut users = Vec::new();
        for id in self.instrs_in_order() {
            if self.instr(id).kind.operands().contains(&value) {
                users.push(id);
            }
        }
        users
    }

    fn build_instr_blocks(&mut self) {
        self.instr_blocks = vec![BlockId(0); self.instrs.len()];
        for (bidx, block) in self.blocks.iter().enumerate() {
            for &instr in &block.instrs {
                self.instr_blocks[instr.0 as usize] = BlockId(bidx as u32);
            }
        }
    }
}

impl InstrKind {
    /// Value operands of this instruction (excluding block targets).
    pub fn operands(&self) -> Vec<Value> {
        match self {
            InstrKind::Load { ptr, .. } => vec![*ptr],
            InstrKind::Store { ptr, value, .. } => vec![*ptr, *value],
            InstrKind::Gep { base, index, .. } => vec![*base, *index],
            InstrKind::BinOp { lhs, rhs, .. } | InstrKind::Cmp { lhs, rhs, .. } => {
                vec![*lhs, *rhs]
            }
            InstrKind::Cast { value, .. } | InstrKind::Switch { value, .. } => vec![*value],
            InstrKind::Phi { incoming } => incoming.iter().map(|(_, v)| *v).collect(),
            InstrKind::Branch { cond, .. } => cond.iter().copied().collect(),
            InstrKind::Call { args, .. } => args.clone(),
            InstrKind::Return { value } => value.iter().copied().collect(),
            InstrKind::Alloca => Vec::new(),
        }
    }
}

impl Module {
    /// Assemble a module and build its handle indexes.
    pub fn assemble(globals: Vec<Global>, functions: Vec<Function>) -> Self {
        let mut module = Module {
            globals,
            functions,
            func_names: Default::default(),
        };
        module.freeze();
        module
    }

    /// Build handle indexes. Must be called once after construction or
    /// deserialization, before any analysis runs.
    pub fn freeze(&mut self) {
        self.func_names = self
            .functions
            .iter()
            .enumerate()
            .map(|(i, f)| (f.name.clone(), FuncId(i as u32)))
            .collect();
        for func in &mut self.functions {
            func.build_instr_blocks();
        }
    }

    /// Load a module from its JSON wire format.
    pub fn from_json(data: &str) -> serde_json::Result<Self> {
        let mut module: Module = serde_json::from_str(data)?;
        module.freeze();
        Ok(module)
    }

    pub fn function(&self, id: FuncId) -> &Function {
        &self.functions[id.0 as usize]
    }

    pub fn func_by_name(&self, name: &str) -> Option<FuncId> {
        self.func_names.get(name).copied()
    }

    pub fn global(&self, id: GlobalId) -> &Global {
        &self.globals[id.0 as usize]
    }

    pub fn instr_at(&self, site: InstrSite) -> &Instr {
        self.function(site.func).instr(site.instr)
    }

    pub fn loc_of(&self, site: InstrSite) -> Option<&SourceLoc> {
        self.instr_at(site).loc.as_ref()
    }

    /// Module-wide identity of a value handle.
    pub fn value_key(&self, func: FuncId, value: Value) -> ValueKey {
        match value {
            Value::Global(g) => ValueKey::Global(g),
            Value::Func(f) => ValueKey::Func(f),
            Value::Instr(i) => ValueKey::Local(func, i),
            Value::Arg(a) => ValueKey::Arg(func, a),
            Value::Const(c) => ValueKey::Const(c),
        }
    }

    /// Strip pointer casts and bitcasts off a value, mirroring the front
    /// end's `stripPointerCasts`.
    pub fn strip_casts(&self, func: FuncId, mut value: Value) -> Value {
        while let Value::Instr(id) = value {
            match &self.function(func).instr(id).kind {
                InstrKind::Cast { value: inner, .. } => value = *inner,
                _ => break,
            }
        }
        value
    }
}
