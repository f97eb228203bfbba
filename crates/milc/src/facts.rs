//! Fact tables for the peephole rewriter
//!
//! A fact for temporary `t` is the tail that defined it, recorded only when
//! that tail is repeatable: the rewriter may then reason about `t` as if the
//! defining computation happened at the point of use. Facts are collected
//! along a single linear `Code` spine and never survive a block boundary;
//! nothing from a sibling branch is ever visible.
//!
//! The walker in `passes.rs` extends the table between rewrites; the
//! rewriter itself only consults it.

use crate::mil::{Atom, Program, Tail, Temp};
use crate::prims::PrimOp;
use crate::types::Type;
use std::collections::HashMap;

#[derive(Debug, Default)]
pub struct Facts {
    defs: HashMap<Temp, Tail>,
    types: HashMap<Temp, Type>,
}

impl Facts {
    pub fn new() -> Self {
        Facts::default()
    }

    /// Record that `t` was bound by `tail`. Non-repeatable tails are not
    /// recorded: a fact must be safe to re-associate with any later use.
    pub fn add_fact(&mut self, prog: &Program, t: Temp, tail: &Tail) {
        if tail.is_repeatable(prog) {
            self.defs.insert(t, tail.clone());
        }
    }

    /// Record the (single-result) type of a bound temporary or parameter.
    pub fn set_type(&mut self, t: Temp, ty: Type) {
        self.types.insert(t, ty);
    }

    /// The repeatable tail that defined this atom, if it is a temp with one.
    pub fn lookup_fact(&self, a: &Atom) -> Option<&Tail> {
        match a {
            Atom::Temp(t) => self.defs.get(t),
            _ => None,
        }
    }

    /// The argument list of `tail` iff it is a call to a primitive whose
    /// recognized operation is `op`.
    pub fn is_prim<'a>(&self, prog: &Program, tail: &'a Tail, op: PrimOp) -> Option<&'a [Atom]> {
        match tail {
            Tail::Prim(p, args) if prog.prims.op(*p) == Some(op) => Some(args),
            _ => None,
        }
    }

    /// Combined lookup: the arguments of the `op` call that defined `a`.
    pub fn prim_fact(&self, prog: &Program, a: &Atom, op: PrimOp) -> Option<&[Atom]> {
        self.lookup_fact(a)
            .and_then(|tail| self.is_prim(prog, tail, op))
    }

    /// Type of an atom under the facts collected so far.
    pub fn type_of(&self, prog: &Program, a: &Atom) -> Option<Type> {
        match a {
            Atom::Temp(t) => self.types.get(t).cloned(),
            Atom::Int(_) => Some(Type::Word),
            Atom::Flag(_) => Some(Type::Flag),
            Atom::Top(t, n) => prog.top(*t).types.get(*n).cloned(),
            Atom::Area(_) => Some(Type::Addr),
        }
    }

    /// True when the atom denotes an address usable as the base slot of a
    /// load/store addressing vector.
    pub fn is_base(&self, prog: &Program, a: &Atom) -> bool {
        matches!(self.type_of(prog, a), Some(Type::Addr))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mil::AreaDef;

    #[test]
    fn test_facts_record_only_repeatable_tails() {
        let prog = Program::new();
        let mut facts = Facts::new();
        let t = Temp(0);
        let u = Temp(1);

        let add = Tail::Prim(prog.prims.add(), vec![Atom::Int(1), Atom::Int(2)]);
        facts.add_fact(&prog, t, &add);
        assert!(facts.lookup_fact(&Atom::Temp(t)).is_some());

        let store = Tail::Prim(prog.prims.store(), vec![]);
        facts.add_fact(&prog, u, &store);
        assert!(facts.lookup_fact(&Atom::Temp(u)).is_none());
    }

    #[test]
    fn test_prim_fact_matches_operation() {
        let prog = Program::new();
        let mut facts = Facts::new();
        let t = Temp(0);
        let tail = Tail::Prim(prog.prims.add(), vec![Atom::Int(1), Atom::Temp(Temp(9))]);
        facts.add_fact(&prog, t, &tail);

        let args = facts.prim_fact(&prog, &Atom::Temp(t), PrimOp::Add).unwrap();
        assert_eq!(args, &[Atom::Int(1), Atom::Temp(Temp(9))]);
        assert!(facts.prim_fact(&prog, &Atom::Temp(t), PrimOp::Mul).is_none());
        assert!(facts.prim_fact(&prog, &Atom::Int(3), PrimOp::Add).is_none());
    }

    #[test]
    fn test_is_base() {
        let mut prog = Program::new();
        let a = prog.add_area(AreaDef {
            name: "buf".into(),
            size: 64,
        });
        let mut facts = Facts::new();
        facts.set_type(Temp(0), Type::Addr);
        facts.set_type(Temp(1), Type::Word);

        assert!(facts.is_base(&prog, &Atom::Area(a)));
        assert!(facts.is_base(&prog, &Atom::Temp(Temp(0))));
        assert!(!facts.is_base(&prog, &Atom::Temp(Temp(1))));
        assert!(!facts.is_base(&prog, &Atom::Int(0)));
    }
}
