//! Programmatic module construction.
//!
//! The JSON loader covers the batch path; this builder is the in-process
//! path, used by front ends embedding the detector and heavily by the test
//! suite to assemble small programs.

use crate::ir::{
    BinOp, Block, BlockId, CastOp, CmpPred, FuncId, Function, Global, GlobalId, Instr, InstrId,
    InstrKind, Module, SourceLoc, Value,
};

#[derive(Default)]
pub struct ModuleBuilder {
    globals: Vec<Global>,
    functions: Vec<Function>,
}

impl ModuleBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn global(&mut self, name: &str) -> GlobalId {
        self.globals.push(Global {
            name: name.to_string(),
            thread_local: false,
        });
        GlobalId(self.globals.len() as u32 - 1)
    }

    pub fn thread_local_global(&mut self, name: &str) -> GlobalId {
        let id = self.global(name);
        self.globals[id.0 as usize].thread_local = true;
        id
    }

    /// Declare an external function (body-less).
    pub fn declare(&mut self, name: &str, params: u32) -> FuncId {
        self.functions.push(Function::declare(name, params));
        FuncId(self.functions.len() as u32 - 1)
    }

    pub fn define(&mut self, func: Function) -> FuncId {
        self.functions.push(func);
        FuncId(self.functions.len() as u32 - 1)
    }

    pub fn finish(self) -> Module {
        Module::assemble(self.globals, self.functions)
    }
}

/// Builds one function, one block at a time. Instructions append to the
/// current block; `loc` sets the source location stamped on subsequent
/// instructions.
pub struct FuncBuilder {
    name: String,
    params: u32,
    blocks: Vec<Block>,
    instrs: Vec<Instr>,
    current: usize,
    loc: Option<SourceLoc>,
}

impl FuncBuilder {
    pub fn new(name: &str, params: u32) -> Self {
        FuncBuilder {
            name: name.to_string(),
            params,
            blocks: vec![Block::default()],
            instrs: Vec::new(),
            current: 0,
            loc: None,
        }
    }

    /// Append a new (empty) block without switching to it.
    pub fn new_block(&mut self) -> BlockId {
        self.blocks.push(Block::default());
        BlockId(self.blocks.len() as u32 - 1)
    }

    pub fn switch_to(&mut self, block: BlockId) {
        self.current = block.0 as usize;
    }

    /// Set the source location applied to instructions pushed after this.
    pub fn loc(&mut self, file: &str, line: u32, col: u32) {
        self.loc = Some(SourceLoc {
            file: file.to_string(),
            line,
            col,
        });
    }

    pub fn push(&mut self, kind: InstrKind) -> Value {
        let id = InstrId(self.instrs.len() as u32);
        self.instrs.push(Instr {
            kind,
            loc: self.loc.clone(),
        });
        self.blocks[self.current].instrs.push(id);
        Value::Instr(id)
    }

    pub fn alloca(&mut self) -> Value {
        self.push(InstrKind::Alloca)
    }

    pub fn load(&mut self, ptr: Value) -> Value {
        self.push(InstrKind::Load {
            ptr,
            atomic: false,
            volatile: false,
        })
    }

    pub fn store(&mut self, ptr: Value, value: Value) -> Value {
        self.push(InstrKind::Store {
            ptr,
            value,
            atomic: false,
            volatile: false,
        })
    }

    pub fn gep(&mut self, base: Value, index: Value) -> Value {
        self.gep_scaled(base, index, 1)
    }

    pub fn gep_scaled(&mut self, base: Value, index: Value, elem_size: u64) -> Value {
        self.push(InstrKind::Gep {
            base,
            index,
            elem_size,
        })
    }

    pub fn binop(&mut self, op: BinOp, lhs: Value, rhs: Value) -> Value {
        self.push(InstrKind::BinOp { op, lhs, rhs })
    }

    pub fn cast(&mut self, op: CastOp, value: Value) -> Value {
        self.push(InstrKind::Cast { op, value })
    }

    pub fn phi(&mut self, incoming: Vec<(BlockId, Value)>) -> Value {
        self.push(InstrKind::Phi { incoming })
    }

    pub fn cmp(&mut self, pred: CmpPred, lhs: Value, rhs: Value) -> Value {
        self.push(InstrKind::Cmp { pred, lhs, rhs })
    }

    pub fn br(&mut self, target: BlockId) -> Value {
        self.push(InstrKind::Branch {
            cond: None,
            then_blk: target,
            else_blk: None,
        })
    }

    pub fn br_cond(&mut self, cond: Value, then_blk: BlockId, else_blk: BlockId) -> Value {
        self.push(InstrKind::Branch {
            cond: Some(cond),
            then_blk,
            else_blk: Some(else_blk),
        })
    }

    pub fn switch(&mut self, value: Value, default: BlockId, cases: Vec<(i64, BlockId)>) -> Value {
        self.push(InstrKind::Switch {
            value,
            default,
            cases,
        })
    }

    pub fn call(&mut self, callee: &str, args: Vec<Value>) -> Value {
        self.push(InstrKind::Call {
            callee: Some(callee.to_string()),
            args,
        })
    }

    pub fn call_indirect(&mut self, args: Vec<Value>) -> Value {
        self.push(InstrKind::Call { callee: None, args })
    }

    pub fn ret(&mut self) -> Value {
        self.push(InstrKind::Return { value: None })
    }

    pub fn finish(self) -> Function {
        Function::define(self.name, self.params, self.blocks, self.instrs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_assembles_blocks_and_locs() {
        let mut f = FuncBuilder::new("main", 0);
        let exit = f.new_block();
        f.loc("main.c", 4, 2);
        let x = f.alloca();
        f.store(x, Value::Const(1));
        f.br(exit);
        f.switch_to(exit);
        f.ret();

        let mut m = ModuleBuilder::new();
        let g = m.global("shared");
        assert_eq!(g, GlobalId(0));
        let fid = m.define(f.finish());
        let module = m.finish();

        let func = module.function(fid);
        assert_eq!(func.blocks.len(), 2);
        assert_eq!(func.block_of(InstrId(3)), exit);
        let loc = func.instr(InstrId(0)).loc.as_ref().unwrap();
        assert_eq!((loc.line, loc.col), (4, 2));
    }
}
