//! MIL interpreter
//!
//! Direct evaluation of a program, used by `milc run` and by tests that
//! compare observable behavior before and after optimization or lowering.
//! The observable trace is the sequence of `printWord` outputs.
//!
//! Word arithmetic delegates to the same folding functions the rewriter
//! uses, so the optimizer and the interpreter cannot disagree about a
//! constant. Division by zero and `halt` are failures; runaway programs
//! are cut off by a step budget.

use crate::mil::{Atom, BlockId, CfunId, ClosId, Code, Program, Tail, Temp};
use crate::prims::PrimOp;
use crate::rewrite::{fold_relation, fold_word_binop};
use std::collections::HashMap;

#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Word(i64),
    Flag(bool),
    Data(CfunId, Vec<Value>),
    Clos(ClosId, Vec<Value>),
}

impl Value {
    fn as_word(&self) -> Result<i64, String> {
        match self {
            Value::Word(w) => Ok(*w),
            other => Err(format!("expected a word, got {:?}", other)),
        }
    }

    fn as_flag(&self) -> Result<bool, String> {
        match self {
            Value::Flag(b) => Ok(*b),
            other => Err(format!("expected a flag, got {:?}", other)),
        }
    }
}

/// Result of a complete run: the `printWord` trace and the entry block's
/// result tuple.
#[derive(Debug, PartialEq)]
pub struct RunResult {
    pub trace: Vec<i64>,
    pub result: Vec<Value>,
}

const DEFAULT_MAX_STEPS: u64 = 1_000_000;

/// Static areas live in one flat byte memory starting above the null page.
const AREA_BASE: i64 = 0x1000;

pub struct Interp<'a> {
    prog: &'a Program,
    mem: Vec<u8>,
    area_base: Vec<i64>,
    tops: Vec<Option<Vec<Value>>>,
    trace: Vec<i64>,
    steps: u64,
    max_steps: u64,
}

type Env = HashMap<Temp, Value>;

impl<'a> Interp<'a> {
    pub fn new(prog: &'a Program) -> Self {
        let mut area_base = Vec::new();
        let mut next = AREA_BASE;
        for area in &prog.areas {
            area_base.push(next);
            // 16-byte alignment between areas.
            next += ((area.size as i64) + 15) & !15;
        }
        let mem_size = (next - AREA_BASE) as usize;
        Interp {
            prog,
            mem: vec![0; mem_size],
            area_base,
            tops: vec![None; prog.tops.len()],
            trace: Vec::new(),
            steps: 0,
            max_steps: DEFAULT_MAX_STEPS,
        }
    }

    pub fn with_max_steps(mut self, max_steps: u64) -> Self {
        self.max_steps = max_steps;
        self
    }

    /// Evaluate top-levels in declaration order, then run the `main` block.
    pub fn run(mut self) -> Result<RunResult, String> {
        for i in 0..self.prog.tops.len() {
            let tail = self.prog.tops[i].tail.clone();
            let vals = self.eval_tail(&Env::new(), &tail)?;
            self.tops[i] = Some(vals);
        }
        let main = self
            .prog
            .find_block("main")
            .ok_or_else(|| "no main block defined".to_string())?;
        if !self.prog.block(main).params.is_empty() {
            return Err("main block must take no parameters".to_string());
        }
        let result = self.run_block(main, Vec::new())?;
        Ok(RunResult {
            trace: self.trace,
            result,
        })
    }

    fn tick(&mut self) -> Result<(), String> {
        self.steps += 1;
        if self.steps > self.max_steps {
            return Err("step budget exceeded".to_string());
        }
        Ok(())
    }

    fn eval_atom(&self, env: &Env, a: &Atom) -> Result<Value, String> {
        match a {
            Atom::Temp(t) => env
                .get(t)
                .cloned()
                .ok_or_else(|| format!("temporary {} unbound at runtime", t)),
            Atom::Int(i) => Ok(Value::Word(*i)),
            Atom::Flag(b) => Ok(Value::Flag(*b)),
            Atom::Top(t, n) => {
                let vals = self.tops[t.0 as usize]
                    .as_ref()
                    .ok_or_else(|| format!("top-level {} read before evaluation", t.0))?;
                vals.get(*n)
                    .cloned()
                    .ok_or_else(|| format!("top-level component {} out of range", n))
            }
            Atom::Area(a) => Ok(Value::Word(self.area_base[a.0 as usize])),
        }
    }

    fn eval_atoms(&self, env: &Env, atoms: &[Atom]) -> Result<Vec<Value>, String> {
        atoms.iter().map(|a| self.eval_atom(env, a)).collect()
    }

    /// Run a block, looping rather than recursing on tail transfers.
    fn run_block(&mut self, mut block: BlockId, mut args: Vec<Value>) -> Result<Vec<Value>, String> {
        'blocks: loop {
            self.tick()?;
            let def = self.prog.block(block);
            if args.len() != def.params.len() {
                return Err(format!(
                    "block {} called with {} arguments, expects {}",
                    def.name,
                    args.len(),
                    def.params.len()
                ));
            }
            let mut env: Env = def.params.iter().copied().zip(args).collect();
            let mut code = def.body.clone();
            loop {
                self.tick()?;
                match code {
                    Code::Bind(vs, t, next) => {
                        let vals = self.eval_tail(&env, &t)?;
                        if vals.len() != vs.len() {
                            return Err(format!(
                                "bind of {} temporaries received {} values",
                                vs.len(),
                                vals.len()
                            ));
                        }
                        for (v, val) in vs.into_iter().zip(vals) {
                            env.insert(v, val);
                        }
                        code = *next;
                    }
                    Code::Done(Tail::BlockCall(b, call_args)) => {
                        args = self.eval_atoms(&env, &call_args)?;
                        block = b;
                        continue 'blocks;
                    }
                    Code::Done(t) => {
                        return self.eval_tail(&env, &t);
                    }
                    Code::If(a, jt, je) => {
                        let flag = self.eval_atom(&env, &a)?.as_flag()?;
                        let j = if flag { jt } else { je };
                        args = self.eval_atoms(&env, &j.args)?;
                        block = j.block;
                        continue 'blocks;
                    }
                    Code::Case(a, alts, def_jump) => {
                        let scrutinee = self.eval_atom(&env, &a)?;
                        let Value::Data(cf, _) = &scrutinee else {
                            return Err(format!("case on a non-data value: {:?}", scrutinee));
                        };
                        let jump = alts
                            .iter()
                            .find(|(c, _)| c == cf)
                            .map(|(_, j)| j)
                            .or(def_jump.as_ref())
                            .ok_or_else(|| {
                                format!("case fell through all alternatives for {:?}", cf)
                            })?;
                        args = self.eval_atoms(&env, &jump.args)?;
                        block = jump.block;
                        continue 'blocks;
                    }
                }
            }
        }
    }

    fn eval_tail(&mut self, env: &Env, tail: &Tail) -> Result<Vec<Value>, String> {
        self.tick()?;
        match tail {
            Tail::Return(atoms) => self.eval_atoms(env, atoms),
            Tail::Prim(p, args) => {
                let vals = self.eval_atoms(env, args)?;
                self.eval_prim(*p, vals)
            }
            Tail::BlockCall(b, args) => {
                let vals = self.eval_atoms(env, args)?;
                self.run_block(*b, vals)
            }
            Tail::DataAlloc(cf, args) => {
                let vals = self.eval_atoms(env, args)?;
                Ok(vec![Value::Data(*cf, vals)])
            }
            Tail::ClosAlloc(k, args) => {
                let vals = self.eval_atoms(env, args)?;
                Ok(vec![Value::Clos(*k, vals)])
            }
            Tail::Enter(f, args) => {
                let fval = self.eval_atom(env, f)?;
                let Value::Clos(k, caps) = fval else {
                    return Err(format!("enter on a non-closure value: {:?}", fval));
                };
                let argvals = self.eval_atoms(env, args)?;
                let c = self.prog.closure(k);
                if caps.len() != c.stored.len() || argvals.len() != c.params.len() {
                    return Err(format!("closure {} applied with wrong arity", c.name));
                }
                let mut cenv: Env = c.stored.iter().copied().zip(caps).collect();
                cenv.extend(c.params.iter().copied().zip(argvals));
                let body = c.body.clone();
                self.eval_tail(&cenv, &body)
            }
            Tail::Sel(cf, n, a) => {
                let val = self.eval_atom(env, a)?;
                let Value::Data(have, fields) = val else {
                    return Err(format!("sel on a non-data value: {:?}", val));
                };
                if have != *cf {
                    return Err(format!(
                        "sel {}.{} applied to a {} value",
                        self.prog.cfun(*cf).name,
                        n,
                        self.prog.cfun(have).name
                    ));
                }
                fields
                    .get(*n)
                    .cloned()
                    .map(|v| vec![v])
                    .ok_or_else(|| format!("sel field {} out of range", n))
            }
        }
    }

    fn eval_prim(&mut self, p: crate::prims::PrimId, vals: Vec<Value>) -> Result<Vec<Value>, String> {
        let Some(op) = self.prog.prims.op(p) else {
            return Err(format!(
                "primitive {} has no interpretation",
                self.prog.prims.get(p).name
            ));
        };
        match op {
            PrimOp::Add
            | PrimOp::Sub
            | PrimOp::Mul
            | PrimOp::Div
            | PrimOp::And
            | PrimOp::Or
            | PrimOp::Xor
            | PrimOp::Shl
            | PrimOp::Lshr
            | PrimOp::Ashr => {
                let (x, y) = (vals[0].as_word()?, vals[1].as_word()?);
                if op == PrimOp::Div && y == 0 {
                    return Err("division by zero".to_string());
                }
                let r = fold_word_binop(op, x, y)
                    .ok_or_else(|| "unfoldable word operation".to_string())?;
                Ok(vec![Value::Word(r)])
            }
            PrimOp::Eq | PrimOp::Neq | PrimOp::Lt | PrimOp::Lte | PrimOp::Gt | PrimOp::Gte => {
                let (x, y) = (vals[0].as_word()?, vals[1].as_word()?);
                let r = fold_relation(op, x, y)
                    .ok_or_else(|| "unfoldable relation".to_string())?;
                Ok(vec![Value::Flag(r)])
            }
            PrimOp::Neg => Ok(vec![Value::Word(vals[0].as_word()?.wrapping_neg())]),
            PrimOp::Not => Ok(vec![Value::Word(!vals[0].as_word()?)]),
            PrimOp::BNot => Ok(vec![Value::Flag(!vals[0].as_flag()?)]),
            PrimOp::FlagToWord => Ok(vec![Value::Word(vals[0].as_flag()? as i64)]),
            PrimOp::PrintWord => {
                self.trace.push(vals[0].as_word()?);
                Ok(Vec::new())
            }
            PrimOp::Halt => Err("halt executed".to_string()),
            PrimOp::Loop => Err("loop primitive entered".to_string()),
            PrimOp::Load => {
                let addr = self.effective_address(&vals)?;
                let size = vals[0].as_word()?;
                let bytes = self.mem_slice(addr, size)?;
                let mut word = [0u8; 8];
                word[..bytes.len()].copy_from_slice(bytes);
                Ok(vec![Value::Word(i64::from_le_bytes(word))])
            }
            PrimOp::Store => {
                let addr = self.effective_address(&vals)?;
                let size = vals[0].as_word()?;
                let value = vals[5].as_word()?;
                let offset = self.mem_offset(addr, size)?;
                let bytes = value.to_le_bytes();
                self.mem[offset..offset + size as usize].copy_from_slice(&bytes[..size as usize]);
                Ok(Vec::new())
            }
        }
    }

    /// `base + offset + index * mult` over the addressing vector
    /// `(size, base, offset, index, mult, ...)`.
    fn effective_address(&self, vals: &[Value]) -> Result<i64, String> {
        let base = vals[1].as_word()?;
        let offset = vals[2].as_word()?;
        let index = vals[3].as_word()?;
        let mult = vals[4].as_word()?;
        Ok(base
            .wrapping_add(offset)
            .wrapping_add(index.wrapping_mul(mult)))
    }

    fn mem_offset(&self, addr: i64, size: i64) -> Result<usize, String> {
        if !matches!(size, 1 | 2 | 4 | 8) {
            return Err(format!("unsupported access size {}", size));
        }
        let start = addr - AREA_BASE;
        if start < 0 || (start + size) as usize > self.mem.len() {
            return Err(format!("memory access out of bounds at {:#x}", addr));
        }
        Ok(start as usize)
    }

    fn mem_slice(&self, addr: i64, size: i64) -> Result<&[u8], String> {
        let start = self.mem_offset(addr, size)?;
        Ok(&self.mem[start..start + size as usize])
    }
}

/// Convenience entry: interpret `prog` from its `main` block.
pub fn run_program(prog: &Program) -> Result<RunResult, String> {
    Interp::new(prog).run()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::Parser;

    fn run(src: &str) -> RunResult {
        let prog = Parser::new(src).parse().unwrap();
        run_program(&prog).unwrap()
    }

    #[test]
    fn test_arithmetic_and_trace() {
        let out = run(
            "block main() {\n\
             \x20 t <- add(40, 2)\n\
             \x20 _ <- printWord(t)\n\
             \x20 return t\n\
             }\n",
        );
        assert_eq!(out.trace, vec![42]);
        assert_eq!(out.result, vec![Value::Word(42)]);
    }

    #[test]
    fn test_branching_and_tail_calls() {
        // Count down from 3, printing each value.
        let out = run(
            "block main() { loopb(3) }\n\
             block loopb(n: word) {\n\
             \x20 _ <- printWord(n)\n\
             \x20 f <- primEq(n, 0)\n\
             \x20 if f then fin() else again(n)\n\
             }\n\
             block again(n: word) {\n\
             \x20 m <- sub(n, 1)\n\
             \x20 loopb(m)\n\
             }\n\
             block fin() { return }\n",
        );
        assert_eq!(out.trace, vec![3, 2, 1, 0]);
    }

    #[test]
    fn test_division_by_zero_fails() {
        let prog = Parser::new(
            "block main() {\n\
             \x20 t <- div(1, 0)\n\
             \x20 return t\n\
             }\n",
        )
        .parse()
        .unwrap();
        let err = run_program(&prog).unwrap_err();
        assert!(err.contains("division by zero"), "{}", err);
    }

    #[test]
    fn test_halt_fails() {
        let prog = Parser::new("block main() { halt() }").parse().unwrap();
        let err = run_program(&prog).unwrap_err();
        assert!(err.contains("halt"), "{}", err);
    }

    #[test]
    fn test_infinite_loop_hits_budget() {
        let prog = Parser::new("block main() { main() }").parse().unwrap();
        let err = Interp::new(&prog).with_max_steps(1000).run().unwrap_err();
        assert!(err.contains("step budget"), "{}", err);
    }

    #[test]
    fn test_load_store_roundtrip() {
        let out = run(
            "area buf[16]\n\
             block main() {\n\
             \x20 _ <- store(8, buf, 0, 0, 0, 1234)\n\
             \x20 v <- load(8, buf, 0, 0, 0)\n\
             \x20 _ <- printWord(v)\n\
             \x20 return v\n\
             }\n",
        );
        assert_eq!(out.trace, vec![1234]);
    }

    #[test]
    fn test_load_with_index_and_mult() {
        let out = run(
            "area tab[32]\n\
             block main() {\n\
             \x20 _ <- store(4, tab, 8, 0, 0, 7)\n\
             \x20 v <- load(4, tab, 0, 2, 4)\n\
             \x20 return v\n\
             }\n",
        );
        assert_eq!(out.result, vec![Value::Word(7)]);
    }

    #[test]
    fn test_data_and_case() {
        let out = run(
            "bitdata Shape / 8 {\n\
             \x20 Circle [ 0b0 : 1 | r : 7 ]\n\
             \x20 Square [ 0b1 : 1 | s : 7 ]\n\
             }\n\
             block main() {\n\
             \x20 v <- new Square(5)\n\
             \x20 case v of {\n\
             \x20   Circle -> isc()\n\
             \x20   Square -> iss(v)\n\
             \x20 }\n\
             }\n\
             block isc() { return 0 }\n\
             block iss(v: Shape) {\n\
             \x20 s <- sel Square.0(v)\n\
             \x20 return s\n\
             }\n",
        );
        assert_eq!(out.result, vec![Value::Word(5)]);
    }

    #[test]
    fn test_closure_enter() {
        let out = run(
            "closure adder(n: word | x: word) = add(n, x)\n\
             block main() {\n\
             \x20 k <- clos adder(40)\n\
             \x20 enter k(2)\n\
             }\n",
        );
        assert_eq!(out.result, vec![Value::Word(2 + 40)]);
    }

    #[test]
    fn test_tops_evaluate_once_in_order() {
        let out = run(
            "top base = return 10\n\
             top next = add(base, 1)\n\
             block main() { return next }\n",
        );
        assert_eq!(out.result, vec![Value::Word(11)]);
    }
}
