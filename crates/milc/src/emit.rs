//! LLVM IR emission
//!
//! Walks the lowered program and prints textual LLVM IR. Every MIL block
//! becomes a function; multi-result blocks return literal struct
//! aggregates; `if` becomes `br i1` with each arm tail-calling its target.
//! Emitted modules are self-contained: a small prelude defines the word
//! printer over `printf`, guarded division and shifts, and the trap path
//! over `abort`, so the output links with nothing but libc.
//!
//! The emitter expects representation lowering to have run: any surviving
//! `DataAlloc`, `Sel`, `ClosAlloc`, `Enter`, or `Case` is a logic error,
//! not something to paper over.
//!
//! Generated IR uses opaque pointers and therefore needs LLVM 15+.

use crate::check::BlockTypes;
use crate::mil::{Atom, BlockId, Code, JumpTo, Program, Tail, Temp};
use crate::prims::PrimOp;
use crate::types::Type;
use std::collections::HashMap;
use std::fmt::Write as _;

/// Failure while printing LLVM IR.
///
/// `Logic` is for programs the emitter refuses: MIL constructs that
/// lowering was supposed to remove, or inconsistencies discovered while
/// walking the blocks. `Format` wraps the `std::fmt` errors that
/// `writeln!` into the output buffer can raise. Wrapping both in one enum
/// lets every emission function bail out with `?`.
#[derive(Debug)]
pub enum EmitError {
    /// The program cannot be emitted as given
    Logic(String),
    /// Writing to the output buffer failed
    Format(std::fmt::Error),
}

impl std::fmt::Display for EmitError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EmitError::Logic(s) => write!(f, "{}", s),
            EmitError::Format(e) => write!(f, "could not write LLVM IR for MIL program: {}", e),
        }
    }
}

impl std::error::Error for EmitError {}

impl From<String> for EmitError {
    fn from(s: String) -> Self {
        EmitError::Logic(s)
    }
}

impl From<std::fmt::Error> for EmitError {
    fn from(e: std::fmt::Error) -> Self {
        EmitError::Format(e)
    }
}

pub struct Emitter<'a> {
    prog: &'a Program,
    blocks: BlockTypes,
    out: String,
    tmp: usize,
}

type ValEnv = HashMap<Temp, (String, Type)>;

/// Emit a complete LLVM module for the program.
pub fn emit_program(prog: &Program) -> Result<String, EmitError> {
    let blocks = BlockTypes::resolve(prog)?;
    let mut e = Emitter {
        prog,
        blocks,
        out: String::new(),
        tmp: 0,
    };
    e.emit_module()?;
    Ok(e.out)
}

fn lltype(ty: &Type) -> &'static str {
    match ty {
        Type::Flag => "i1",
        _ => "i64",
    }
}

fn ret_type(tys: Option<&Vec<Type>>) -> String {
    match tys {
        None => "void".to_string(),
        Some(tys) if tys.is_empty() => "void".to_string(),
        Some(tys) if tys.len() == 1 => lltype(&tys[0]).to_string(),
        Some(tys) => {
            let parts: Vec<&str> = tys.iter().map(lltype).collect();
            format!("{{ {} }}", parts.join(", "))
        }
    }
}

impl<'a> Emitter<'a> {
    fn fresh(&mut self) -> String {
        self.tmp += 1;
        format!("%v{}", self.tmp)
    }

    fn fresh_label(&mut self, stem: &str) -> String {
        self.tmp += 1;
        format!("{}{}", stem, self.tmp)
    }

    fn block_symbol(&self, b: BlockId) -> String {
        format!("blk_{}", self.prog.block(b).name)
    }

    fn emit_module(&mut self) -> Result<(), EmitError> {
        writeln!(self.out, "; ModuleID = 'mil'")?;
        writeln!(self.out)?;
        self.emit_prelude()?;
        self.emit_globals()?;
        self.emit_top_init()?;

        for b in self.prog.block_ids() {
            self.emit_block(b)?;
        }
        self.emit_main_wrapper()?;
        Ok(())
    }

    fn emit_prelude(&mut self) -> Result<(), EmitError> {
        let p = &mut self.out;
        writeln!(p, "declare i32 @printf(ptr, ...)")?;
        writeln!(p, "declare void @abort() noreturn")?;
        writeln!(p)?;
        writeln!(p, "@fmt_word = private constant [6 x i8] c\"%lld\\0A\\00\"")?;
        writeln!(p)?;
        writeln!(p, "define void @mil_print_word(i64 %w) {{")?;
        writeln!(p, "  call i32 (ptr, ...) @printf(ptr @fmt_word, i64 %w)")?;
        writeln!(p, "  ret void")?;
        writeln!(p, "}}")?;
        writeln!(p)?;
        writeln!(p, "define void @mil_halt() noreturn {{")?;
        writeln!(p, "  call void @abort()")?;
        writeln!(p, "  unreachable")?;
        writeln!(p, "}}")?;
        writeln!(p)?;
        writeln!(p, "define void @mil_loop() noreturn {{")?;
        writeln!(p, "entry:")?;
        writeln!(p, "  br label %spin")?;
        writeln!(p, "spin:")?;
        writeln!(p, "  br label %spin")?;
        writeln!(p, "}}")?;
        writeln!(p)?;
        writeln!(p, "define i64 @mil_udiv(i64 %a, i64 %b) {{")?;
        writeln!(p, "  %z = icmp eq i64 %b, 0")?;
        writeln!(p, "  br i1 %z, label %trap, label %ok")?;
        writeln!(p, "trap:")?;
        writeln!(p, "  call void @abort()")?;
        writeln!(p, "  unreachable")?;
        writeln!(p, "ok:")?;
        writeln!(p, "  %q = udiv i64 %a, %b")?;
        writeln!(p, "  ret i64 %q")?;
        writeln!(p, "}}")?;
        writeln!(p)?;
        // Shift amounts at or beyond the word size are absorbed rather
        // than poison.
        for (name, op, over) in [
            ("mil_shl", "shl", "0"),
            ("mil_lshr", "lshr", "0"),
        ] {
            writeln!(p, "define i64 @{}(i64 %a, i64 %b) {{", name)?;
            writeln!(p, "  %big = icmp uge i64 %b, 64")?;
            writeln!(p, "  %s = {} i64 %a, %b", op)?;
            writeln!(p, "  %r = select i1 %big, i64 {}, i64 %s", over)?;
            writeln!(p, "  ret i64 %r")?;
            writeln!(p, "}}")?;
            writeln!(p)?;
        }
        writeln!(p, "define i64 @mil_ashr(i64 %a, i64 %b) {{")?;
        writeln!(p, "  %big = icmp uge i64 %b, 64")?;
        writeln!(p, "  %amt = select i1 %big, i64 63, i64 %b")?;
        writeln!(p, "  %r = ashr i64 %a, %amt")?;
        writeln!(p, "  ret i64 %r")?;
        writeln!(p, "}}")?;
        writeln!(p)?;
        Ok(())
    }

    fn emit_globals(&mut self) -> Result<(), EmitError> {
        for area in &self.prog.areas {
            writeln!(
                self.out,
                "@area_{} = global [{} x i8] zeroinitializer, align 16",
                area.name, area.size
            )?;
        }
        for (i, top) in self.prog.tops.iter().enumerate() {
            for (n, ty) in top.types.iter().enumerate() {
                writeln!(
                    self.out,
                    "@top_{}_{} = global {} {}",
                    i,
                    n,
                    lltype(ty),
                    if *ty == Type::Flag { "false" } else { "0" }
                )?;
            }
        }
        writeln!(self.out)?;
        Ok(())
    }

    /// Top-levels evaluate once, in declaration order, before main runs.
    fn emit_top_init(&mut self) -> Result<(), EmitError> {
        writeln!(self.out, "define void @mil_init_tops() {{")?;
        for i in 0..self.prog.tops.len() {
            let top = &self.prog.tops[i];
            let env = ValEnv::new();
            let vals = self.tail_values(&env, &top.tail)?;
            if vals.len() != top.types.len() {
                return Err(EmitError::Logic(format!(
                    "top-level {}: produced {} values, declares {}",
                    top.name,
                    vals.len(),
                    top.types.len()
                )));
            }
            for (n, (val, ty)) in vals.iter().zip(top.types.iter().map(lltype)).enumerate() {
                writeln!(self.out, "  store {} {}, ptr @top_{}_{}", ty, val.0, i, n)?;
            }
        }
        writeln!(self.out, "  ret void")?;
        writeln!(self.out, "}}")?;
        writeln!(self.out)?;
        Ok(())
    }

    fn emit_main_wrapper(&mut self) -> Result<(), EmitError> {
        let main = self
            .prog
            .find_block("main")
            .ok_or_else(|| EmitError::Logic("no main block defined".to_string()))?;
        if !self.prog.block(main).params.is_empty() {
            return Err(EmitError::Logic(
                "main block must take no parameters".to_string(),
            ));
        }
        let rty = ret_type(self.blocks.of(main));
        writeln!(self.out, "define i32 @main() {{")?;
        writeln!(self.out, "  call void @mil_init_tops()")?;
        if rty == "void" {
            writeln!(self.out, "  call void @{}()", self.block_symbol(main))?;
        } else {
            writeln!(self.out, "  call {} @{}()", rty, self.block_symbol(main))?;
        }
        writeln!(self.out, "  ret i32 0")?;
        writeln!(self.out, "}}")?;
        Ok(())
    }

    fn emit_block(&mut self, b: BlockId) -> Result<(), EmitError> {
        let def = self.prog.block(b);
        let rty = ret_type(self.blocks.of(b));
        let mut env = ValEnv::new();
        let mut params = Vec::new();
        for (t, ty) in def.params.iter().zip(def.ptypes.iter()) {
            let name = format!("%p{}", t.0);
            params.push(format!("{} {}", lltype(ty), name));
            env.insert(*t, (name, ty.clone()));
        }
        writeln!(
            self.out,
            "define {} @{}({}) {{",
            rty,
            self.block_symbol(b),
            params.join(", ")
        )?;
        let body = def.body.clone();
        self.emit_code(&mut env, &rty, &body)?;
        writeln!(self.out, "}}")?;
        writeln!(self.out)?;
        Ok(())
    }

    fn emit_code(&mut self, env: &mut ValEnv, rty: &str, code: &Code) -> Result<(), EmitError> {
        match code {
            Code::Bind(vs, t, next) => {
                let vals = self.tail_values(env, t)?;
                if vals.len() != vs.len() {
                    return Err(EmitError::Logic(format!(
                        "bind arity mismatch: {} binders, {} values",
                        vs.len(),
                        vals.len()
                    )));
                }
                for (v, val) in vs.iter().zip(vals) {
                    env.insert(*v, val);
                }
                self.emit_code(env, rty, next)
            }
            Code::Done(Tail::BlockCall(b, args)) => {
                self.emit_transfer(env, rty, &JumpTo::new(*b, args.clone()))
            }
            Code::Done(Tail::Prim(p, _))
                if matches!(self.prog.prims.op(*p), Some(PrimOp::Halt)) =>
            {
                writeln!(self.out, "  call void @mil_halt()")?;
                writeln!(self.out, "  unreachable")?;
                Ok(())
            }
            Code::Done(Tail::Prim(p, _))
                if matches!(self.prog.prims.op(*p), Some(PrimOp::Loop)) =>
            {
                writeln!(self.out, "  call void @mil_loop()")?;
                writeln!(self.out, "  unreachable")?;
                Ok(())
            }
            Code::Done(t) => {
                let vals = self.tail_values(env, t)?;
                self.emit_ret(&vals)
            }
            Code::If(a, jt, je) => {
                let (cond, _) = self.atom_value(env, a)?;
                let lt = self.fresh_label("then");
                let le = self.fresh_label("else");
                writeln!(self.out, "  br i1 {}, label %{}, label %{}", cond, lt, le)?;
                writeln!(self.out, "{}:", lt)?;
                self.emit_transfer(env, rty, jt)?;
                writeln!(self.out, "{}:", le)?;
                self.emit_transfer(env, rty, je)?;
                Ok(())
            }
            Code::Case(..) => Err(EmitError::Logic(
                "case dispatch survived representation lowering".to_string(),
            )),
        }
    }

    /// A tail-position transfer: call the target and return its result.
    fn emit_transfer(&mut self, env: &ValEnv, rty: &str, j: &JumpTo) -> Result<(), EmitError> {
        let callee_rty = ret_type(self.blocks.of(j.block));
        let mut args = Vec::new();
        for (a, ty) in j.args.iter().zip(self.prog.block(j.block).ptypes.iter()) {
            let (val, _) = self.atom_value(env, a)?;
            args.push(format!("{} {}", lltype(ty), val));
        }
        let callee = self.block_symbol(j.block);
        if callee_rty == "void" {
            writeln!(self.out, "  call void @{}({})", callee, args.join(", "))?;
            if rty == "void" {
                writeln!(self.out, "  ret void")?;
            } else {
                // The callee diverges; this point is unreachable.
                writeln!(self.out, "  unreachable")?;
            }
        } else {
            let r = self.fresh();
            writeln!(
                self.out,
                "  {} = tail call {} @{}({})",
                r,
                callee_rty,
                callee,
                args.join(", ")
            )?;
            if rty == callee_rty {
                writeln!(self.out, "  ret {} {}", rty, r)?;
            } else if rty == "void" {
                writeln!(self.out, "  ret void")?;
            } else {
                return Err(EmitError::Logic(format!(
                    "tail call result type {} does not match {}",
                    callee_rty, rty
                )));
            }
        }
        Ok(())
    }

    fn emit_ret(&mut self, vals: &[(String, Type)]) -> Result<(), EmitError> {
        match vals.len() {
            0 => writeln!(self.out, "  ret void")?,
            1 => writeln!(self.out, "  ret {} {}", lltype(&vals[0].1), vals[0].0)?,
            _ => {
                let tys: Vec<&str> = vals.iter().map(|(_, t)| lltype(t)).collect();
                let agg_ty = format!("{{ {} }}", tys.join(", "));
                let mut agg = "undef".to_string();
                for (i, (val, ty)) in vals.iter().enumerate() {
                    let next = self.fresh();
                    writeln!(
                        self.out,
                        "  {} = insertvalue {} {}, {} {}, {}",
                        next,
                        agg_ty,
                        agg,
                        lltype(ty),
                        val,
                        i
                    )?;
                    agg = next;
                }
                writeln!(self.out, "  ret {} {}", agg_ty, agg)?;
            }
        }
        Ok(())
    }

    /// Value and type of an atom, emitting conversion instructions when a
    /// static reference needs materializing.
    fn atom_value(&mut self, env: &ValEnv, a: &Atom) -> Result<(String, Type), EmitError> {
        match a {
            Atom::Temp(t) => env.get(t).cloned().ok_or_else(|| {
                EmitError::Logic(format!("temporary {} unbound at emission", t))
            }),
            Atom::Int(i) => Ok((i.to_string(), Type::Word)),
            Atom::Flag(b) => Ok((b.to_string(), Type::Flag)),
            Atom::Top(t, n) => {
                let ty = self.prog.top(*t).types[*n].clone();
                let v = self.fresh();
                writeln!(
                    self.out,
                    "  {} = load {}, ptr @top_{}_{}",
                    v,
                    lltype(&ty),
                    t.0,
                    n
                )?;
                Ok((v, ty))
            }
            Atom::Area(area) => {
                let v = self.fresh();
                writeln!(
                    self.out,
                    "  {} = ptrtoint ptr @area_{} to i64",
                    v,
                    self.prog.area(*area).name
                )?;
                Ok((v, Type::Addr))
            }
        }
    }

    /// Emit a tail and name its result values.
    fn tail_values(&mut self, env: &ValEnv, t: &Tail) -> Result<Vec<(String, Type)>, EmitError> {
        match t {
            Tail::Return(atoms) => atoms.iter().map(|a| self.atom_value(env, a)).collect(),
            Tail::Prim(p, args) => self.prim_values(*p, args, env),
            Tail::BlockCall(b, args) => {
                let callee_rty = ret_type(self.blocks.of(*b));
                let rtys = self.blocks.of(*b).cloned().unwrap_or_default();
                let mut argv = Vec::new();
                for (a, ty) in args.iter().zip(self.prog.block(*b).ptypes.iter()) {
                    let (val, _) = self.atom_value(env, a)?;
                    argv.push(format!("{} {}", lltype(ty), val));
                }
                let callee = self.block_symbol(*b);
                match rtys.len() {
                    0 => {
                        writeln!(self.out, "  call void @{}({})", callee, argv.join(", "))?;
                        Ok(Vec::new())
                    }
                    1 => {
                        let r = self.fresh();
                        writeln!(
                            self.out,
                            "  {} = call {} @{}({})",
                            r,
                            callee_rty,
                            callee,
                            argv.join(", ")
                        )?;
                        Ok(vec![(r, rtys[0].clone())])
                    }
                    _ => {
                        let agg = self.fresh();
                        writeln!(
                            self.out,
                            "  {} = call {} @{}({})",
                            agg,
                            callee_rty,
                            callee,
                            argv.join(", ")
                        )?;
                        let mut out = Vec::new();
                        for (i, ty) in rtys.iter().enumerate() {
                            let r = self.fresh();
                            writeln!(
                                self.out,
                                "  {} = extractvalue {} {}, {}",
                                r, callee_rty, agg, i
                            )?;
                            out.push((r, ty.clone()));
                        }
                        Ok(out)
                    }
                }
            }
            Tail::DataAlloc(..) | Tail::Sel(..) => Err(EmitError::Logic(
                "constructor or selector survived representation lowering".to_string(),
            )),
            Tail::ClosAlloc(..) | Tail::Enter(..) => Err(EmitError::Logic(
                "closure not eliminated before emission; enable the optimizer \
                 or rewrite the program without unknown closures"
                    .to_string(),
            )),
        }
    }

    fn prim_values(
        &mut self,
        p: crate::prims::PrimId,
        args: &[Atom],
        env: &ValEnv,
    ) -> Result<Vec<(String, Type)>, EmitError> {
        let op = self.prog.prims.op(p).ok_or_else(|| {
            EmitError::Logic(format!(
                "primitive {} has no emission rule",
                self.prog.prims.get(p).name
            ))
        })?;
        let mut word_args = Vec::new();
        for a in args {
            word_args.push(self.atom_value(env, a)?);
        }
        let bin = |e: &mut Self, instr: &str, a: &str, b: &str| -> Result<String, EmitError> {
            let r = e.fresh();
            writeln!(e.out, "  {} = {} i64 {}, {}", r, instr, a, b)?;
            Ok(r)
        };
        match op {
            PrimOp::Add | PrimOp::Sub | PrimOp::Mul | PrimOp::And | PrimOp::Or | PrimOp::Xor => {
                let instr = match op {
                    PrimOp::Add => "add",
                    PrimOp::Sub => "sub",
                    PrimOp::Mul => "mul",
                    PrimOp::And => "and",
                    PrimOp::Or => "or",
                    _ => "xor",
                };
                let (a, b) = (word_args[0].0.clone(), word_args[1].0.clone());
                let r = bin(self, instr, &a, &b)?;
                Ok(vec![(r, Type::Word)])
            }
            PrimOp::Div | PrimOp::Shl | PrimOp::Lshr | PrimOp::Ashr => {
                let helper = match op {
                    PrimOp::Div => "mil_udiv",
                    PrimOp::Shl => "mil_shl",
                    PrimOp::Lshr => "mil_lshr",
                    _ => "mil_ashr",
                };
                let r = self.fresh();
                writeln!(
                    self.out,
                    "  {} = call i64 @{}(i64 {}, i64 {})",
                    r, helper, word_args[0].0, word_args[1].0
                )?;
                Ok(vec![(r, Type::Word)])
            }
            PrimOp::Neg => {
                let r = bin(self, "sub", "0", &word_args[0].0.clone())?;
                Ok(vec![(r, Type::Word)])
            }
            PrimOp::Not => {
                let r = bin(self, "xor", &word_args[0].0.clone(), "-1")?;
                Ok(vec![(r, Type::Word)])
            }
            PrimOp::Eq | PrimOp::Neq | PrimOp::Lt | PrimOp::Lte | PrimOp::Gt | PrimOp::Gte => {
                let cc = match op {
                    PrimOp::Eq => "eq",
                    PrimOp::Neq => "ne",
                    PrimOp::Lt => "slt",
                    PrimOp::Lte => "sle",
                    PrimOp::Gt => "sgt",
                    _ => "sge",
                };
                let r = self.fresh();
                writeln!(
                    self.out,
                    "  {} = icmp {} i64 {}, {}",
                    r, cc, word_args[0].0, word_args[1].0
                )?;
                Ok(vec![(r, Type::Flag)])
            }
            PrimOp::BNot => {
                let r = self.fresh();
                writeln!(self.out, "  {} = xor i1 {}, true", r, word_args[0].0)?;
                Ok(vec![(r, Type::Flag)])
            }
            PrimOp::FlagToWord => {
                let r = self.fresh();
                writeln!(self.out, "  {} = zext i1 {} to i64", r, word_args[0].0)?;
                Ok(vec![(r, Type::Word)])
            }
            PrimOp::PrintWord => {
                writeln!(
                    self.out,
                    "  call void @mil_print_word(i64 {})",
                    word_args[0].0
                )?;
                Ok(Vec::new())
            }
            PrimOp::Halt | PrimOp::Loop => Err(EmitError::Logic(
                "halt/loop in a value position".to_string(),
            )),
            PrimOp::Load | PrimOp::Store => {
                let Atom::Int(size) = args[0] else {
                    return Err(EmitError::Logic(
                        "memory access size must be a constant".to_string(),
                    ));
                };
                let elem = match size {
                    1 => "i8",
                    2 => "i16",
                    4 => "i32",
                    8 => "i64",
                    other => {
                        return Err(EmitError::Logic(format!(
                            "unsupported access size {}",
                            other
                        )));
                    }
                };
                // base + offset + index * mult, then inttoptr.
                let scaled = bin(self, "mul", &word_args[3].0.clone(), &word_args[4].0.clone())?;
                let partial = bin(self, "add", &word_args[1].0.clone(), &word_args[2].0.clone())?;
                let addr = bin(self, "add", &partial, &scaled)?;
                let ptr = self.fresh();
                writeln!(self.out, "  {} = inttoptr i64 {} to ptr", ptr, addr)?;
                if op == PrimOp::Load {
                    let raw = self.fresh();
                    writeln!(self.out, "  {} = load {}, ptr {}", raw, elem, ptr)?;
                    let val = if elem == "i64" {
                        raw
                    } else {
                        let z = self.fresh();
                        writeln!(self.out, "  {} = zext {} {} to i64", z, elem, raw)?;
                        z
                    };
                    Ok(vec![(val, Type::Word)])
                } else {
                    let val = if elem == "i64" {
                        word_args[5].0.clone()
                    } else {
                        let tr = self.fresh();
                        writeln!(
                            self.out,
                            "  {} = trunc i64 {} to {}",
                            tr, word_args[5].0, elem
                        )?;
                        tr
                    };
                    writeln!(self.out, "  store {} {}, ptr {}", elem, val, ptr)?;
                    Ok(Vec::new())
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::Parser;

    fn emit(src: &str) -> String {
        let mut prog = Parser::new(src).parse().unwrap();
        crate::repr::lower_program(&mut prog).unwrap();
        emit_program(&prog).unwrap()
    }

    #[test]
    fn test_emit_simple_module() {
        let ir = emit(
            "block main() {\n\
             \x20 t <- add(40, 2)\n\
             \x20 _ <- printWord(t)\n\
             \x20 return t\n\
             }\n",
        );
        assert!(ir.contains("define i64 @blk_main()"), "{}", ir);
        assert!(ir.contains("add i64 40, 2"), "{}", ir);
        assert!(ir.contains("call void @mil_print_word"), "{}", ir);
        assert!(ir.contains("define i32 @main()"), "{}", ir);
        assert!(ir.contains("declare i32 @printf"), "{}", ir);
    }

    #[test]
    fn test_emit_branch_and_calls() {
        let ir = emit(
            "block main() { check(5) }\n\
             block check(n: word) {\n\
             \x20 f <- primLt(n, 10)\n\
             \x20 if f then small(n) else big(n)\n\
             }\n\
             block small(n: word) { return 0 }\n\
             block big(n: word) { return 1 }\n",
        );
        assert!(ir.contains("icmp slt i64"), "{}", ir);
        assert!(ir.contains("br i1"), "{}", ir);
        assert!(ir.contains("tail call i64 @blk_small"), "{}", ir);
    }

    #[test]
    fn test_emit_areas_and_memory() {
        let ir = emit(
            "area buf[64]\n\
             block main() {\n\
             \x20 _ <- store(8, buf, 0, 0, 0, 7)\n\
             \x20 v <- load(8, buf, 0, 0, 0)\n\
             \x20 return v\n\
             }\n",
        );
        assert!(
            ir.contains("@area_buf = global [64 x i8] zeroinitializer"),
            "{}",
            ir
        );
        assert!(ir.contains("ptrtoint ptr @area_buf to i64"), "{}", ir);
        assert!(ir.contains("inttoptr i64"), "{}", ir);
    }

    #[test]
    fn test_emit_lowered_bitdata() {
        let ir = emit(
            "bitdata Status / 8 {\n\
             \x20 Ok [ 0b10 : 2 | payload : 6 ]\n\
             }\n\
             block main() {\n\
             \x20 v <- new Ok(42)\n\
             \x20 return v\n\
             }\n",
        );
        // The constructor became a generated block; no data remains.
        assert!(ir.contains("@blk_mk_Ok"), "{}", ir);
    }

    #[test]
    fn test_emit_rejects_surviving_closures() {
        let mut prog = Parser::new(
            "closure k(n: word | x: word) = add(n, x)\n\
             block main(f: k) {\n\
             \x20 enter f(1)\n\
             }\n",
        )
        .parse()
        .unwrap();
        crate::repr::lower_program(&mut prog).unwrap();
        let err = emit_program(&prog).unwrap_err();
        assert!(matches!(err, EmitError::Logic(_)), "{:?}", err);
    }

    #[test]
    fn test_emit_multi_result_blocks() {
        let ir = emit(
            "block pair() { return 1, 2 }\n\
             block main() {\n\
             \x20 a, b <- pair()\n\
             \x20 s <- add(a, b)\n\
             \x20 return s\n\
             }\n",
        );
        assert!(ir.contains("define { i64, i64 } @blk_pair()"), "{}", ir);
        assert!(ir.contains("insertvalue { i64, i64 }"), "{}", ir);
        assert!(ir.contains("extractvalue { i64, i64 }"), "{}", ir);
    }

    #[test]
    fn test_emit_halt_is_unreachable() {
        let ir = emit("block main() { halt() }\n");
        assert!(ir.contains("call void @mil_halt()"), "{}", ir);
        assert!(ir.contains("unreachable"), "{}", ir);
    }
}
