//! IR well-formedness checking
//!
//! MIL reaching this crate is already typed, so this is a consistency
//! check, not inference: every temp used must be bound by an enclosing
//! bind or parameter, every primitive call must be saturated, every bind
//! must match the arity of its tail, and block calls must agree with the
//! callee's parameter and result types. Passes are expected to preserve
//! all of this; the driver re-checks after each pass in debug builds.
//!
//! Violations are internal errors: the result is an `Err` that aborts the
//! enclosing pass, never a silent no-op.

use crate::mil::{Atom, BlockId, Code, DataDef, JumpTo, Program, Tail, Temp};
use crate::prims::PrimOp;
use crate::types::Type;
use std::collections::HashMap;

type Env = HashMap<Temp, Type>;

/// Result types per block, resolved iteratively so chains of tail calls
/// settle. A block whose every exit is divergent stays unresolved.
pub struct BlockTypes {
    rtypes: Vec<Option<Vec<Type>>>,
}

impl BlockTypes {
    pub fn resolve(prog: &Program) -> Result<BlockTypes, String> {
        let mut bt = BlockTypes {
            rtypes: vec![None; prog.blocks.len()],
        };
        // Result types flow backwards along tail calls; iterate until the
        // assignment is stable.
        loop {
            let mut changed = false;
            for id in prog.block_ids() {
                if bt.rtypes[id.0 as usize].is_some() {
                    continue;
                }
                let block = prog.block(id);
                let mut env = Env::new();
                for (t, ty) in block.params.iter().zip(block.ptypes.iter()) {
                    env.insert(*t, ty.clone());
                }
                if let Some(tys) = bt.try_terminal(prog, &block.body, &mut env) {
                    bt.rtypes[id.0 as usize] = Some(tys);
                    changed = true;
                }
            }
            if !changed {
                return Ok(bt);
            }
        }
    }

    pub fn of(&self, id: BlockId) -> Option<&Vec<Type>> {
        self.rtypes[id.0 as usize].as_ref()
    }

    /// Best-effort result types of a code spine under a growing env.
    fn try_terminal(&self, prog: &Program, code: &Code, env: &mut Env) -> Option<Vec<Type>> {
        match code {
            Code::Bind(vs, t, next) => {
                if let Ok(tys) = tail_types(prog, env, t, self) {
                    for (v, ty) in vs.iter().zip(tys) {
                        env.insert(*v, ty);
                    }
                }
                self.try_terminal(prog, next, env)
            }
            Code::Done(Tail::BlockCall(b, _)) => self.of(*b).cloned(),
            Code::Done(t) => tail_types(prog, env, t, self).ok(),
            Code::If(_, jt, je) => self
                .of(jt.block)
                .or_else(|| self.of(je.block))
                .cloned(),
            Code::Case(_, alts, def) => alts
                .iter()
                .map(|(_, j)| j.block)
                .chain(def.iter().map(|j| j.block))
                .find_map(|b| self.of(b))
                .cloned(),
        }
    }
}

/// Type of one atom under the current scope.
pub fn atom_type(prog: &Program, env: &Env, a: &Atom) -> Result<Type, String> {
    match a {
        Atom::Temp(t) => env
            .get(t)
            .cloned()
            .ok_or_else(|| format!("temporary {} used out of scope", t)),
        Atom::Int(_) => Ok(Type::Word),
        Atom::Flag(_) => Ok(Type::Flag),
        Atom::Top(t, n) => {
            let top = prog.top(*t);
            top.types
                .get(*n)
                .cloned()
                .ok_or_else(|| format!("component {} out of range for top-level {}", n, top.name))
        }
        Atom::Area(_) => Ok(Type::Addr),
    }
}

fn is_wordy(ty: &Type) -> bool {
    matches!(ty, Type::Word | Type::Addr)
}

/// Result tuple type of a tail. `Err` on scope, arity, or type violations;
/// `Ok` with the tuple type otherwise. Calls to blocks whose result type
/// is still unresolved (divergent loops) report the callee's params only.
pub fn tail_types(
    prog: &Program,
    env: &Env,
    tail: &Tail,
    blocks: &BlockTypes,
) -> Result<Vec<Type>, String> {
    match tail {
        Tail::Return(atoms) => atoms.iter().map(|a| atom_type(prog, env, a)).collect(),
        Tail::Prim(p, args) => {
            let prim = prog.prims.get(*p);
            if args.len() != prim.arity() {
                return Err(format!(
                    "primitive {} applied to {} arguments, expects {}",
                    prim.name,
                    args.len(),
                    prim.arity()
                ));
            }
            let atys: Vec<Type> = args
                .iter()
                .map(|a| atom_type(prog, env, a))
                .collect::<Result<_, _>>()?;
            match prog.prims.op(*p) {
                // Address arithmetic: add may carry an address on either
                // side, sub on the left; address minus address is a width.
                Some(PrimOp::Add) => {
                    if !atys.iter().all(is_wordy) {
                        return Err(format!("{}: word or addr operands required", prim.name));
                    }
                    let out = if atys.contains(&Type::Addr) {
                        Type::Addr
                    } else {
                        Type::Word
                    };
                    Ok(vec![out])
                }
                Some(PrimOp::Sub) => {
                    if !atys.iter().all(is_wordy) {
                        return Err(format!("{}: word or addr operands required", prim.name));
                    }
                    let out = match (&atys[0], &atys[1]) {
                        (Type::Addr, Type::Word) => Type::Addr,
                        (Type::Addr, Type::Addr) => Type::Word,
                        (Type::Word, Type::Addr) => {
                            return Err("sub: cannot subtract an addr from a word".to_string());
                        }
                        _ => Type::Word,
                    };
                    Ok(vec![out])
                }
                // The addressing vector mixes words with an optional base;
                // the slots are checked for machine representation only.
                Some(PrimOp::Load | PrimOp::Store) => {
                    if !atys.iter().all(is_wordy) {
                        return Err(format!("{}: machine-typed operands required", prim.name));
                    }
                    Ok(prim.block_type.rng.clone())
                }
                _ => {
                    for (i, (have, want)) in atys.iter().zip(prim.block_type.dom.iter()).enumerate()
                    {
                        let ok = have == want || (is_wordy(have) && is_wordy(want));
                        if !ok {
                            return Err(format!(
                                "primitive {}: argument {} has type {}, expects {}",
                                prim.name, i, have, want
                            ));
                        }
                    }
                    Ok(prim.block_type.rng.clone())
                }
            }
        }
        Tail::BlockCall(b, args) => {
            check_jump_args(prog, env, *b, args)?;
            match blocks.of(*b) {
                Some(tys) => Ok(tys.clone()),
                // Divergent callee: no result tuple to disagree with.
                None => Ok(Vec::new()),
            }
        }
        Tail::DataAlloc(cf, args) => {
            let cfun = prog.cfun(*cf);
            let nfields = match prog.data(cfun.data) {
                DataDef::Bitdata { layouts, .. } => layouts[cfun.tag].fields.len(),
                DataDef::Struct { fields, .. } => fields.len(),
            };
            if args.len() != nfields {
                return Err(format!(
                    "constructor {} applied to {} arguments, expects {}",
                    cfun.name,
                    args.len(),
                    nfields
                ));
            }
            for a in args {
                atom_type(prog, env, a)?;
            }
            Ok(vec![Type::Data(cfun.data)])
        }
        Tail::ClosAlloc(k, args) => {
            let c = prog.closure(*k);
            if args.len() != c.stored.len() {
                return Err(format!(
                    "closure {} allocated with {} captures, expects {}",
                    c.name,
                    args.len(),
                    c.stored.len()
                ));
            }
            for a in args {
                atom_type(prog, env, a)?;
            }
            Ok(vec![Type::Clos(*k)])
        }
        Tail::Enter(f, args) => {
            let fty = atom_type(prog, env, f)?;
            for a in args {
                atom_type(prog, env, a)?;
            }
            match fty {
                Type::Clos(k) => {
                    let c = prog.closure(k);
                    if args.len() != c.params.len() {
                        return Err(format!(
                            "enter {}: {} arguments, expects {}",
                            c.name,
                            args.len(),
                            c.params.len()
                        ));
                    }
                    Ok(c.rtypes.clone())
                }
                // A closure flowing through a word-typed position (e.g. a
                // higher-order parameter) is applied dynamically; arity is
                // the interpreter's problem and the result is one word.
                Type::Word => Ok(vec![Type::Word]),
                other => Err(format!("enter: expected a closure, got {}", other)),
            }
        }
        Tail::Sel(cf, n, a) => {
            let cfun = prog.cfun(*cf);
            let aty = atom_type(prog, env, a)?;
            if aty != Type::Data(cfun.data) {
                return Err(format!(
                    "sel {}.{}: selected from a value of type {}",
                    cfun.name, n, aty
                ));
            }
            match prog.data(cfun.data) {
                DataDef::Bitdata { layouts, .. } => {
                    if *n >= layouts[cfun.tag].fields.len() {
                        return Err(format!("sel {}.{}: field out of range", cfun.name, n));
                    }
                    Ok(vec![Type::Word])
                }
                DataDef::Struct { fields, .. } => fields
                    .get(*n)
                    .map(|t| vec![t.clone()])
                    .ok_or_else(|| format!("sel {}.{}: field out of range", cfun.name, n)),
            }
        }
    }
}

fn check_jump_args(prog: &Program, env: &Env, b: BlockId, args: &[Atom]) -> Result<(), String> {
    let callee = prog.block(b);
    if args.len() != callee.params.len() {
        return Err(format!(
            "call to {}: {} arguments, expects {}",
            callee.name,
            args.len(),
            callee.params.len()
        ));
    }
    for (i, (a, want)) in args.iter().zip(callee.ptypes.iter()).enumerate() {
        let have = atom_type(prog, env, a)?;
        // Closures may travel through word-typed positions; they re-emerge
        // at a (dynamic) enter.
        let ok = have == *want
            || (is_wordy(&have) && is_wordy(want))
            || (matches!(have, Type::Clos(_)) && *want == Type::Word);
        if !ok {
            return Err(format!(
                "call to {}: argument {} has type {}, expects {}",
                callee.name, i, have, want
            ));
        }
    }
    Ok(())
}

fn check_jump(prog: &Program, env: &Env, j: &JumpTo) -> Result<(), String> {
    check_jump_args(prog, env, j.block, &j.args)
}

fn check_code(
    prog: &Program,
    env: &mut Env,
    code: &Code,
    blocks: &BlockTypes,
) -> Result<(), String> {
    match code {
        Code::Bind(vs, t, next) => {
            let tys = tail_types(prog, env, t, blocks)?;
            let diverges = matches!(t, Tail::BlockCall(b, _) if blocks.of(*b).is_none());
            if diverges {
                // The continuation is unreachable; give the binders a
                // placeholder so the scope check can still walk it.
                for v in vs {
                    env.insert(*v, Type::Word);
                }
            } else {
                if vs.len() != tys.len() {
                    return Err(format!(
                        "bind of {} temporaries to a tail producing {}",
                        vs.len(),
                        tys.len()
                    ));
                }
                for (v, ty) in vs.iter().zip(tys) {
                    if env.insert(*v, ty).is_some() {
                        return Err(format!("temporary {} bound twice", v));
                    }
                }
            }
            check_code(prog, env, next, blocks)
        }
        Code::Done(t) => {
            tail_types(prog, env, t, blocks)?;
            Ok(())
        }
        Code::If(a, jt, je) => {
            if atom_type(prog, env, a)? != Type::Flag {
                return Err("if: scrutinee must be a flag".to_string());
            }
            check_jump(prog, env, jt)?;
            check_jump(prog, env, je)
        }
        Code::Case(a, alts, def) => {
            let aty = atom_type(prog, env, a)?;
            let Type::Data(d) = aty else {
                return Err(format!("case: scrutinee has type {}, expected data", aty));
            };
            for (cf, j) in alts {
                if prog.cfun(*cf).data != d {
                    return Err(format!(
                        "case: alternative {} belongs to another data type",
                        prog.cfun(*cf).name
                    ));
                }
                check_jump(prog, env, j)?;
            }
            if let Some(j) = def {
                check_jump(prog, env, j)?;
            }
            Ok(())
        }
    }
}

/// Check scope, arity, and type consistency of a whole program.
pub fn check_program(prog: &Program) -> Result<(), String> {
    let blocks = BlockTypes::resolve(prog)?;

    for id in prog.block_ids() {
        let block = prog.block(id);
        if block.params.len() != block.ptypes.len() {
            return Err(format!("block {}: parameter type arity mismatch", block.name));
        }
        let mut env = Env::new();
        for (t, ty) in block.params.iter().zip(block.ptypes.iter()) {
            env.insert(*t, ty.clone());
        }
        check_code(prog, &mut env, &block.body, &blocks)
            .map_err(|e| format!("block {}: {}", block.name, e))?;
    }

    for id in prog.top_ids() {
        let top = prog.top(id);
        let env = Env::new();
        let tys = tail_types(prog, &env, &top.tail, &blocks)
            .map_err(|e| format!("top-level {}: {}", top.name, e))?;
        if tys.len() != top.types.len() {
            return Err(format!(
                "top-level {}: declares {} components, tail produces {}",
                top.name,
                top.types.len(),
                tys.len()
            ));
        }
    }

    for c in &prog.closures {
        let mut env = Env::new();
        for (t, ty) in c.stored.iter().zip(c.stypes.iter()) {
            env.insert(*t, ty.clone());
        }
        for (t, ty) in c.params.iter().zip(c.ptypes.iter()) {
            env.insert(*t, ty.clone());
        }
        tail_types(prog, &env, &c.body, &blocks)
            .map_err(|e| format!("closure {}: {}", c.name, e))?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mil::BlockDef;

    fn block(prog: &mut Program, name: &str, nparams: usize, body: impl FnOnce(&[Temp]) -> Code) {
        let params = prog.fresh_temps(nparams);
        let body = body(&params);
        prog.add_block(BlockDef {
            name: name.into(),
            ptypes: vec![Type::Word; nparams],
            params,
            body,
        });
    }

    #[test]
    fn test_well_formed_block_passes() {
        let mut prog = Program::new();
        let add = prog.prims.add();
        let t = prog.fresh_temp();
        block(&mut prog, "b", 2, |ps| {
            Code::Bind(
                vec![t],
                Tail::Prim(add, vec![Atom::Temp(ps[0]), Atom::Temp(ps[1])]),
                Box::new(Code::Done(Tail::Return(vec![Atom::Temp(t)]))),
            )
        });
        assert!(check_program(&prog).is_ok());
    }

    #[test]
    fn test_out_of_scope_temp_rejected() {
        let mut prog = Program::new();
        block(&mut prog, "b", 0, |_| {
            Code::Done(Tail::Return(vec![Atom::Temp(Temp(999))]))
        });
        let err = check_program(&prog).unwrap_err();
        assert!(err.contains("out of scope"), "{}", err);
    }

    #[test]
    fn test_prim_arity_mismatch_rejected() {
        let mut prog = Program::new();
        let add = prog.prims.add();
        block(&mut prog, "b", 1, |ps| {
            Code::Done(Tail::Prim(add, vec![Atom::Temp(ps[0])]))
        });
        let err = check_program(&prog).unwrap_err();
        assert!(err.contains("expects 2"), "{}", err);
    }

    #[test]
    fn test_bind_arity_mismatch_rejected() {
        let mut prog = Program::new();
        let add = prog.prims.add();
        let (t, u) = (Temp(50), Temp(51));
        block(&mut prog, "b", 2, |ps| {
            Code::Bind(
                vec![t, u],
                Tail::Prim(add, vec![Atom::Temp(ps[0]), Atom::Temp(ps[1])]),
                Box::new(Code::Done(Tail::Return(vec![Atom::Temp(t)]))),
            )
        });
        let err = check_program(&prog).unwrap_err();
        assert!(err.contains("bind of 2"), "{}", err);
    }

    #[test]
    fn test_if_scrutinee_must_be_flag() {
        let mut prog = Program::new();
        block(&mut prog, "target", 0, |_| {
            Code::Done(Tail::Return(vec![]))
        });
        let target = prog.find_block("target").unwrap();
        block(&mut prog, "b", 1, |ps| {
            Code::If(
                Atom::Temp(ps[0]),
                JumpTo::new(target, vec![]),
                JumpTo::new(target, vec![]),
            )
        });
        let err = check_program(&prog).unwrap_err();
        assert!(err.contains("flag"), "{}", err);
    }

    #[test]
    fn test_result_types_follow_tail_calls() {
        let mut prog = Program::new();
        block(&mut prog, "leaf", 0, |_| {
            Code::Done(Tail::Return(vec![Atom::Int(1), Atom::Int(2)]))
        });
        let leaf = prog.find_block("leaf").unwrap();
        block(&mut prog, "mid", 0, |_| {
            Code::Done(Tail::BlockCall(leaf, vec![]))
        });
        let mid = prog.find_block("mid").unwrap();
        assert!(check_program(&prog).is_ok());

        let bt = BlockTypes::resolve(&prog).unwrap();
        assert_eq!(bt.of(leaf), Some(&vec![Type::Word, Type::Word]));
        assert_eq!(bt.of(mid), Some(&vec![Type::Word, Type::Word]));
    }
}
