//! Reference Interpreter
//!
//! Executes IR directly so tests can check that a transformed module
//! still computes what the original did. Memory is a flat
//! little-endian byte array; allocas bump-allocate and are released
//! when their frame returns; globals are materialized up front.
//!
//! Everything the obfuscation passes emit is supported. Inline-asm
//! calls, invokes and block addresses trap, and execution is
//! fuel-limited so runaway dispatch loops fail deterministically.

use rustc_hash::FxHashMap;
use thiserror::Error;

use crate::basic_block::BlockId;
use crate::function::Function;
use crate::instruction::{BinOp, Callee, CastOp, InstKind, IntPredicate};
use crate::module::{FuncId, GlobalId, Module};
use crate::types::Type;
use crate::value::{mask_to_width, sign_extend, Constant, Value};

const MEM_SIZE: usize = 1 << 20;
const NULL_GUARD: u64 = 64;
const FUNC_ADDR_BASE: u64 = 0xF000_0000_0000;
const DEFAULT_FUEL: u64 = 10_000_000;
const MAX_DEPTH: usize = 128;

#[derive(Debug, Error)]
pub enum Trap {
    #[error("executed unreachable")]
    Unreachable,
    #[error("executed inline assembly")]
    InlineAsm,
    #[error("out of fuel")]
    OutOfFuel,
    #[error("memory access out of bounds")]
    OutOfBounds,
    #[error("division by zero")]
    DivByZero,
    #[error("call stack overflow")]
    StackOverflow,
    #[error("called a declaration: {0}")]
    MissingDefinition(String),
    #[error("no such function: {0}")]
    NoSuchFunction(String),
    #[error("unsupported: {0}")]
    Unsupported(&'static str),
}

/// An interpreter instance over one module.
pub struct Interpreter<'m> {
    module: &'m Module,
    mem: Vec<u8>,
    stack_top: u64,
    global_addrs: FxHashMap<GlobalId, u64>,
    fuel: u64,
    steps: u64,
}

impl<'m> Interpreter<'m> {
    pub fn new(module: &'m Module) -> Self {
        Self::with_fuel(module, DEFAULT_FUEL)
    }

    pub fn with_fuel(module: &'m Module, fuel: u64) -> Self {
        let mut interp = Self {
            module,
            mem: vec![0; MEM_SIZE],
            stack_top: NULL_GUARD,
            global_addrs: FxHashMap::default(),
            fuel,
            steps: 0,
        };
        interp.layout_globals();
        interp
    }

    fn layout_globals(&mut self) {
        for (id, g) in self.module.globals() {
            let size = g.ty.byte_size().max(1);
            let addr = self.stack_top;
            self.stack_top += (size + 7) & !7;
            self.global_addrs.insert(id, addr);
        }
        // Initializers may reference other globals, so write them
        // after every address is fixed.
        for (id, g) in self.module.globals() {
            if let Some(init) = g.init {
                let addr = self.global_addrs[&id];
                let size = g.ty.byte_size().max(1) as usize;
                let raw = match init {
                    Value::Const(Constant::Int { value, .. }) => value,
                    Value::Const(Constant::Float { bits, .. }) => bits,
                    Value::Const(Constant::Null) => 0,
                    Value::Global(other) => self.global_addrs[&other],
                    Value::Func(f) => FUNC_ADDR_BASE + f.0 as u64,
                    _ => 0,
                };
                let bytes = raw.to_le_bytes();
                let n = size.min(8);
                self.mem[addr as usize..addr as usize + n].copy_from_slice(&bytes[..n]);
            }
        }
    }

    /// Address of a global, for tests that want to pass pointers in.
    pub fn global_addr(&self, id: GlobalId) -> u64 {
        self.global_addrs[&id]
    }

    /// Allocate and initialize a block of memory; returns its address.
    /// Useful for building pointer arguments in tests.
    pub fn alloc_bytes(&mut self, bytes: &[u8]) -> u64 {
        let addr = self.stack_top;
        self.stack_top += ((bytes.len() as u64) + 7) & !7;
        self.mem[addr as usize..addr as usize + bytes.len()].copy_from_slice(bytes);
        addr
    }

    /// Read back memory, for checking out-parameters.
    pub fn read_bytes(&self, addr: u64, len: usize) -> &[u8] {
        &self.mem[addr as usize..addr as usize + len]
    }

    /// Run a function by name. Arguments and the result are raw,
    /// zero-extended 64-bit values.
    pub fn call_by_name(&mut self, name: &str, args: &[u64]) -> Result<Option<u64>, Trap> {
        let id = self
            .module
            .get_function(name)
            .ok_or_else(|| Trap::NoSuchFunction(name.to_string()))?;
        self.call(id, args)
    }

    pub fn call(&mut self, id: FuncId, args: &[u64]) -> Result<Option<u64>, Trap> {
        self.exec_function(id, args, 0)
    }

    fn burn(&mut self) -> Result<(), Trap> {
        self.steps += 1;
        if self.steps > self.fuel {
            return Err(Trap::OutOfFuel);
        }
        Ok(())
    }

    fn exec_function(
        &mut self,
        id: FuncId,
        args: &[u64],
        depth: usize,
    ) -> Result<Option<u64>, Trap> {
        if depth >= MAX_DEPTH {
            return Err(Trap::StackOverflow);
        }
        let func = self.module.func(id);
        if func.is_declaration() {
            return Err(Trap::MissingDefinition(func.name().to_string()));
        }
        let nregs = func.inst_ids().map(|i| i.index() + 1).max().unwrap_or(0);
        let mut regs: Vec<u64> = vec![0; nregs];
        let frame_base = self.stack_top;

        let mut block = func.entry();
        let mut prev: Option<BlockId> = None;
        'blocks: loop {
            // Phi nodes evaluate in parallel against the predecessor.
            let end_phi = func.first_insertion_pt(block);
            if end_phi > 0 {
                let pred = prev.ok_or(Trap::Unsupported("phi in entry block"))?;
                let mut staged: Vec<(usize, u64)> = Vec::new();
                for &id in &func.block_insts(block)[..end_phi] {
                    if let InstKind::Phi { incoming } = &func.inst(id).kind {
                        let (v, _) = incoming
                            .iter()
                            .find(|(_, b)| *b == pred)
                            .ok_or(Trap::Unsupported("phi missing incoming edge"))?;
                        staged.push((id.index(), self.eval(func, &regs, args, *v)?));
                    }
                }
                for (slot, v) in staged {
                    regs[slot] = v;
                }
            }

            for &inst in &func.block_insts(block)[end_phi..] {
                self.burn()?;
                let data = func.inst(inst);
                match &data.kind {
                    InstKind::Phi { .. } => return Err(Trap::Unsupported("phi after non-phi")),
                    InstKind::Alloca { allocated } => {
                        let size = allocated.byte_size().max(1);
                        let addr = self.stack_top;
                        let next = addr + ((size + 7) & !7);
                        if next as usize > self.mem.len() {
                            return Err(Trap::OutOfBounds);
                        }
                        self.mem[addr as usize..next as usize].fill(0);
                        self.stack_top = next;
                        regs[inst.index()] = addr;
                    }
                    InstKind::Load { ptr } => {
                        let addr = self.eval(func, &regs, args, *ptr)?;
                        regs[inst.index()] = self.load_typed(addr, &data.ty)?;
                    }
                    InstKind::Store { value, ptr } => {
                        let v = self.eval(func, &regs, args, *value)?;
                        let addr = self.eval(func, &regs, args, *ptr)?;
                        let ty = func.value_type(*value);
                        self.store_typed(addr, &ty, v)?;
                    }
                    InstKind::Gep { elem_ty, base, indices } => {
                        let mut addr = self.eval(func, &regs, args, *base)?;
                        let mut cur = elem_ty.clone();
                        for (k, idx) in indices.iter().enumerate() {
                            let raw = self.eval(func, &regs, args, *idx)?;
                            let w = func
                                .value_type(*idx)
                                .int_width()
                                .ok_or(Trap::Unsupported("non-integer gep index"))?;
                            let off = sign_extend(raw, w);
                            if k == 0 {
                                addr = addr
                                    .wrapping_add((off as u64).wrapping_mul(cur.byte_size()));
                            } else {
                                match cur.clone() {
                                    Type::Array(a) => {
                                        addr = addr.wrapping_add(
                                            (off as u64).wrapping_mul(a.element.byte_size()),
                                        );
                                        cur = a.element.clone();
                                    }
                                    _ => return Err(Trap::Unsupported("gep into scalar")),
                                }
                            }
                        }
                        regs[inst.index()] = addr;
                    }
                    InstKind::Binary { op, lhs, rhs } => {
                        let w = func
                            .value_type(*lhs)
                            .int_width()
                            .ok_or(Trap::Unsupported("binary on non-integer"))?;
                        let a = self.eval(func, &regs, args, *lhs)?;
                        let b = self.eval(func, &regs, args, *rhs)?;
                        regs[inst.index()] = eval_binop(*op, a, b, w)?;
                    }
                    InstKind::ICmp { pred, lhs, rhs } => {
                        let w = func
                            .value_type(*lhs)
                            .int_width()
                            .unwrap_or(64);
                        let a = self.eval(func, &regs, args, *lhs)?;
                        let b = self.eval(func, &regs, args, *rhs)?;
                        regs[inst.index()] = eval_icmp(*pred, a, b, w) as u64;
                    }
                    InstKind::Cast { op, value } => {
                        let v = self.eval(func, &regs, args, *value)?;
                        let src_w = func.value_type(*value).int_width().unwrap_or(64);
                        let dst_w = data.ty.int_width().unwrap_or(64);
                        regs[inst.index()] = match op {
                            CastOp::Trunc => mask_to_width(v, dst_w),
                            CastOp::ZExt => v,
                            CastOp::SExt => mask_to_width(sign_extend(v, src_w) as u64, dst_w),
                            CastOp::PtrToInt => mask_to_width(v, dst_w),
                            CastOp::IntToPtr | CastOp::BitCast => v,
                        };
                    }
                    InstKind::Select { cond, if_true, if_false } => {
                        let c = self.eval(func, &regs, args, *cond)? & 1;
                        let v = if c != 0 {
                            self.eval(func, &regs, args, *if_true)?
                        } else {
                            self.eval(func, &regs, args, *if_false)?
                        };
                        regs[inst.index()] = v;
                    }
                    InstKind::Call { callee, args: call_args, .. } => {
                        let f = match callee {
                            Callee::Func(f) => *f,
                            Callee::Asm(_) => return Err(Trap::InlineAsm),
                        };
                        let mut vals = Vec::with_capacity(call_args.len());
                        for a in call_args {
                            vals.push(self.eval(func, &regs, args, *a)?);
                        }
                        let r = self.exec_function(f, &vals, depth + 1)?;
                        regs[inst.index()] = r.unwrap_or(0);
                    }
                    InstKind::Br { dest } => {
                        prev = Some(block);
                        block = *dest;
                        continue 'blocks;
                    }
                    InstKind::CondBr { cond, if_true, if_false } => {
                        let c = self.eval(func, &regs, args, *cond)? & 1;
                        prev = Some(block);
                        block = if c != 0 { *if_true } else { *if_false };
                        continue 'blocks;
                    }
                    InstKind::Switch { cond, default, cases } => {
                        let w = func.value_type(*cond).int_width().unwrap_or(64);
                        let c = mask_to_width(self.eval(func, &regs, args, *cond)?, w);
                        prev = Some(block);
                        block = cases
                            .iter()
                            .find(|(v, _)| *v == c)
                            .map(|(_, b)| *b)
                            .unwrap_or(*default);
                        continue 'blocks;
                    }
                    InstKind::Ret { value } => {
                        let out = match value {
                            Some(v) => Some(self.eval(func, &regs, args, *v)?),
                            None => None,
                        };
                        self.stack_top = frame_base;
                        return Ok(out);
                    }
                    InstKind::Invoke { .. } => return Err(Trap::Unsupported("invoke")),
                    InstKind::Unreachable => return Err(Trap::Unreachable),
                }
            }
            return Err(Trap::Unsupported("block without terminator"));
        }
    }

    fn eval(
        &self,
        func: &Function,
        regs: &[u64],
        args: &[u64],
        v: Value,
    ) -> Result<u64, Trap> {
        Ok(match v {
            Value::Const(Constant::Int { value, .. }) => value,
            Value::Const(Constant::Float { bits, .. }) => bits,
            Value::Const(Constant::Null) => 0,
            Value::Const(Constant::BlockAddress { .. }) => {
                return Err(Trap::Unsupported("blockaddress"))
            }
            Value::Arg(i) => {
                let w = func.params()[i as usize].ty.int_width().unwrap_or(64);
                mask_to_width(args[i as usize], w)
            }
            Value::Inst(id) => regs[id.index()],
            Value::Global(g) => self.global_addrs[&g],
            Value::Func(f) => FUNC_ADDR_BASE + f.0 as u64,
        })
    }

    fn bounds(&self, addr: u64, size: u64) -> Result<(usize, usize), Trap> {
        if addr < NULL_GUARD {
            return Err(Trap::OutOfBounds);
        }
        let start = addr as usize;
        let end = start.checked_add(size as usize).ok_or(Trap::OutOfBounds)?;
        if end > self.mem.len() {
            return Err(Trap::OutOfBounds);
        }
        Ok((start, end))
    }

    fn load_typed(&self, addr: u64, ty: &Type) -> Result<u64, Trap> {
        let size = ty.byte_size();
        let (start, end) = self.bounds(addr, size)?;
        let mut bytes = [0u8; 8];
        bytes[..(end - start)].copy_from_slice(&self.mem[start..end]);
        let raw = u64::from_le_bytes(bytes);
        Ok(match ty.int_width() {
            Some(w) => mask_to_width(raw, w),
            None => raw,
        })
    }

    fn store_typed(&mut self, addr: u64, ty: &Type, value: u64) -> Result<(), Trap> {
        let size = ty.byte_size();
        let (start, end) = self.bounds(addr, size)?;
        let bytes = value.to_le_bytes();
        self.mem[start..end].copy_from_slice(&bytes[..(end - start)]);
        Ok(())
    }
}

fn eval_binop(op: BinOp, a: u64, b: u64, w: u32) -> Result<u64, Trap> {
    let sa = sign_extend(a, w);
    let sb = sign_extend(b, w);
    let raw = match op {
        BinOp::Add => a.wrapping_add(b),
        BinOp::Sub => a.wrapping_sub(b),
        BinOp::Mul => a.wrapping_mul(b),
        BinOp::UDiv => {
            if b == 0 {
                return Err(Trap::DivByZero);
            }
            a / b
        }
        BinOp::SDiv => {
            if sb == 0 {
                return Err(Trap::DivByZero);
            }
            sa.wrapping_div(sb) as u64
        }
        BinOp::URem => {
            if b == 0 {
                return Err(Trap::DivByZero);
            }
            a % b
        }
        BinOp::SRem => {
            if sb == 0 {
                return Err(Trap::DivByZero);
            }
            sa.wrapping_rem(sb) as u64
        }
        BinOp::Shl => {
            if b >= w as u64 {
                0
            } else {
                a << b
            }
        }
        BinOp::LShr => {
            if b >= w as u64 {
                0
            } else {
                a >> b
            }
        }
        BinOp::AShr => {
            if b >= w as u64 {
                (sa >> 63) as u64
            } else {
                (sa >> b) as u64
            }
        }
        BinOp::And => a & b,
        BinOp::Or => a | b,
        BinOp::Xor => a ^ b,
    };
    Ok(mask_to_width(raw, w))
}

fn eval_icmp(pred: IntPredicate, a: u64, b: u64, w: u32) -> bool {
    let sa = sign_extend(a, w);
    let sb = sign_extend(b, w);
    match pred {
        IntPredicate::EQ => a == b,
        IntPredicate::NE => a != b,
        IntPredicate::UGT => a > b,
        IntPredicate::UGE => a >= b,
        IntPredicate::ULT => a < b,
        IntPredicate::ULE => a <= b,
        IntPredicate::SGT => sa > sb,
        IntPredicate::SGE => sa >= sb,
        IntPredicate::SLT => sa < sb,
        IntPredicate::SLE => sa <= sb,
    }
}
