//! MIL intermediate representation
//!
//! The IR is a set of named blocks, top-level definitions, closure
//! definitions, data definitions, and static areas, all owned by a
//! `Program` arena and referenced by integer ids. Code inside a block is a
//! linear spine of bindings terminated by a tail, a two-way branch, or a
//! constructor dispatch.
//!
//! Temporaries have identity equality and are bound exactly once; a temp
//! bound by `Bind(vs, t, c)` is in scope only in `c`, and block parameters
//! only in the block body. Passes build new `Code` trees rather than
//! mutating in place.

use crate::prims::{PrimId, Purity};
use crate::types::Type;
use std::collections::HashSet;

/// A local temporary. Identity is the id; names from source are not kept.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Temp(pub u32);

impl std::fmt::Display for Temp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "t{}", self.0)
    }
}

macro_rules! arena_id {
    ($($(#[$doc:meta])* $name:ident),+ $(,)?) => {
        $(
            $(#[$doc])*
            #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
            pub struct $name(pub u32);
        )+
    };
}

arena_id! {
    /// Index of a block in the program arena.
    BlockId,
    /// Index of a top-level definition.
    TopId,
    /// Index of a closure definition.
    ClosId,
    /// Index of a data definition (bitdata or struct).
    DataId,
    /// Index of a constructor function.
    CfunId,
    /// Index of a static area.
    AreaId,
}

/// An operand: a temporary, a constant, or a static reference. Atoms are
/// freely copyable and carry no ownership of what they name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Atom {
    Temp(Temp),
    Int(i64),
    Flag(bool),
    /// Component `n` of a top-level tuple definition
    Top(TopId, usize),
    /// Address of a static area
    Area(AreaId),
}

impl Atom {
    pub fn as_temp(&self) -> Option<Temp> {
        match self {
            Atom::Temp(t) => Some(*t),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Atom::Int(i) => Some(*i),
            _ => None,
        }
    }
}

impl From<Temp> for Atom {
    fn from(t: Temp) -> Atom {
        Atom::Temp(t)
    }
}

/// A tail-position transfer: target block plus arguments.
#[derive(Debug, Clone, PartialEq)]
pub struct JumpTo {
    pub block: BlockId,
    pub args: Vec<Atom>,
}

impl JumpTo {
    pub fn new(block: BlockId, args: Vec<Atom>) -> Self {
        JumpTo { block, args }
    }
}

/// A computation producing a result tuple.
#[derive(Debug, Clone, PartialEq)]
pub enum Tail {
    /// Yield the argument tuple unchanged
    Return(Vec<Atom>),
    /// Invoke a primitive
    Prim(PrimId, Vec<Atom>),
    /// Call a block (tail position inside `Done`/`If`/`Case`; elsewhere a
    /// non-tail call bound by `Bind`)
    BlockCall(BlockId, Vec<Atom>),
    /// Allocate a constructed value
    DataAlloc(CfunId, Vec<Atom>),
    /// Allocate a closure capturing the given atoms
    ClosAlloc(ClosId, Vec<Atom>),
    /// Force a closure and apply it
    Enter(Atom, Vec<Atom>),
    /// Extract field `n` of a value built by the given constructor
    Sel(CfunId, usize, Atom),
}

impl Tail {
    /// Effect classification of this tail. Allocation is pure here: MIL
    /// values are immutable and identity is not observable.
    pub fn purity(&self, prog: &Program) -> Purity {
        match self {
            Tail::Return(_) | Tail::DataAlloc(..) | Tail::ClosAlloc(..) | Tail::Sel(..) => {
                Purity::Pure
            }
            Tail::Prim(p, _) => prog.prims.get(*p).purity,
            // Calls may do anything until proven otherwise.
            Tail::BlockCall(..) | Tail::Enter(..) => Purity::Impure,
        }
    }

    pub fn is_repeatable(&self, prog: &Program) -> bool {
        self.purity(prog).is_repeatable()
    }

    pub fn has_no_effect(&self, prog: &Program) -> bool {
        self.purity(prog).has_no_effect()
    }

    /// Number of results, where it can be read off the tail alone.
    /// `BlockCall` and `Enter` need the checker's type environment.
    pub fn outity(&self, prog: &Program) -> Option<usize> {
        match self {
            Tail::Return(atoms) => Some(atoms.len()),
            Tail::Prim(p, _) => Some(prog.prims.get(*p).outity()),
            Tail::DataAlloc(..) | Tail::ClosAlloc(..) | Tail::Sel(..) => Some(1),
            Tail::BlockCall(b, _) => prog.block_outity(*b),
            Tail::Enter(..) => None,
        }
    }

    /// Visit every atom in this tail.
    pub fn for_each_atom(&self, f: &mut impl FnMut(&Atom)) {
        match self {
            Tail::Return(atoms)
            | Tail::Prim(_, atoms)
            | Tail::BlockCall(_, atoms)
            | Tail::DataAlloc(_, atoms)
            | Tail::ClosAlloc(_, atoms) => atoms.iter().for_each(f),
            Tail::Enter(fun, args) => {
                f(fun);
                args.iter().for_each(f);
            }
            Tail::Sel(_, _, a) => f(a),
        }
    }

    /// Rebuild this tail with every atom passed through `f`.
    pub fn map_atoms(&self, f: &mut impl FnMut(&Atom) -> Atom) -> Tail {
        let map = |atoms: &[Atom], f: &mut dyn FnMut(&Atom) -> Atom| {
            atoms.iter().map(|a| f(a)).collect::<Vec<_>>()
        };
        match self {
            Tail::Return(atoms) => Tail::Return(map(atoms, f)),
            Tail::Prim(p, atoms) => Tail::Prim(*p, map(atoms, f)),
            Tail::BlockCall(b, atoms) => Tail::BlockCall(*b, map(atoms, f)),
            Tail::DataAlloc(c, atoms) => Tail::DataAlloc(*c, map(atoms, f)),
            Tail::ClosAlloc(c, atoms) => Tail::ClosAlloc(*c, map(atoms, f)),
            Tail::Enter(fun, args) => Tail::Enter(f(fun), map(args, f)),
            Tail::Sel(c, n, a) => Tail::Sel(*c, *n, f(a)),
        }
    }
}

/// A linear spine of bindings ending in a tail, branch, or dispatch.
#[derive(Debug, Clone, PartialEq)]
pub enum Code {
    /// Bind temporaries to the result tuple of a tail, then continue
    Bind(Vec<Temp>, Tail, Box<Code>),
    /// Terminal tail
    Done(Tail),
    /// Two-way branch on a flag
    If(Atom, JumpTo, JumpTo),
    /// Constructor dispatch with optional default
    Case(Atom, Vec<(CfunId, JumpTo)>, Option<JumpTo>),
}

impl Code {
    /// Replace the terminal `Done(t)` of this spine by `f(t)`. The spine
    /// must end in `Done`; rewriter fragments always do.
    pub fn append(self, f: impl FnOnce(Tail) -> Code) -> Code {
        match self {
            Code::Done(t) => f(t),
            Code::Bind(vs, t, next) => Code::Bind(vs, t, Box::new(next.append(f))),
            other => other,
        }
    }

    /// Visit every atom in this code (not descending into called blocks).
    pub fn for_each_atom(&self, f: &mut impl FnMut(&Atom)) {
        match self {
            Code::Bind(_, t, next) => {
                t.for_each_atom(f);
                next.for_each_atom(f);
            }
            Code::Done(t) => t.for_each_atom(f),
            Code::If(a, jt, je) => {
                f(a);
                jt.args.iter().for_each(&mut *f);
                je.args.iter().for_each(f);
            }
            Code::Case(a, alts, def) => {
                f(a);
                for (_, j) in alts {
                    j.args.iter().for_each(&mut *f);
                }
                if let Some(j) = def {
                    j.args.iter().for_each(f);
                }
            }
        }
    }

    /// All temporaries referenced (free or bound) by atoms in this code.
    pub fn used_temps(&self) -> HashSet<Temp> {
        let mut used = HashSet::new();
        self.for_each_atom(&mut |a| {
            if let Atom::Temp(t) = a {
                used.insert(*t);
            }
        });
        used
    }

    pub fn uses_any(&self, temps: &[Temp]) -> bool {
        let mut found = false;
        self.for_each_atom(&mut |a| {
            if let Atom::Temp(t) = a {
                if temps.contains(t) {
                    found = true;
                }
            }
        });
        found
    }
}

/// A named code with explicit parameters, the unit of control flow.
#[derive(Debug, Clone)]
pub struct BlockDef {
    pub name: String,
    pub params: Vec<Temp>,
    pub ptypes: Vec<Type>,
    pub body: Code,
}

/// A named, parameter-less tuple-valued definition evaluated once.
#[derive(Debug, Clone)]
pub struct TopDef {
    pub name: String,
    /// Component names of the left-hand side tuple
    pub lhs: Vec<String>,
    pub types: Vec<Type>,
    pub tail: Tail,
}

impl TopDef {
    pub fn outity(&self) -> usize {
        self.types.len()
    }
}

/// A closure: captured atoms, entry parameters, and a body tail.
#[derive(Debug, Clone)]
pub struct ClosureDef {
    pub name: String,
    pub stored: Vec<Temp>,
    pub stypes: Vec<Type>,
    pub params: Vec<Temp>,
    pub ptypes: Vec<Type>,
    pub rtypes: Vec<Type>,
    pub body: Tail,
}

/// A constructor function, introducing one variant of a data type.
#[derive(Debug, Clone)]
pub struct Cfun {
    pub name: String,
    pub data: DataId,
    pub tag: usize,
}

/// One field of a bitdata constructor layout.
#[derive(Debug, Clone, PartialEq)]
pub struct BitField {
    pub name: String,
    pub offset: u32,
    pub width: u32,
}

impl BitField {
    pub fn mask(&self) -> u64 {
        if self.width >= 64 {
            u64::MAX
        } else {
            ((1u64 << self.width) - 1) << self.offset
        }
    }
}

/// Layout of one bitdata constructor: fixed tag bits under a mask, plus
/// payload fields at assigned offsets.
#[derive(Debug, Clone, PartialEq)]
pub struct BitdataLayout {
    pub tag_bits: u64,
    pub tag_mask: u64,
    pub fields: Vec<BitField>,
}

/// A data definition. Bitdata packs into a single word; structs are
/// single-constructor records flattened to word tuples by the
/// representation transform.
#[derive(Debug, Clone)]
pub enum DataDef {
    Bitdata {
        name: String,
        width: u32,
        /// Parallel to the constructor tag indices of this data type
        layouts: Vec<BitdataLayout>,
        cfuns: Vec<CfunId>,
    },
    Struct {
        name: String,
        fields: Vec<Type>,
        cfun: CfunId,
    },
}

impl DataDef {
    pub fn name(&self) -> &str {
        match self {
            DataDef::Bitdata { name, .. } | DataDef::Struct { name, .. } => name,
        }
    }
}

/// A named static memory region usable as a `load`/`store` base.
#[derive(Debug, Clone)]
pub struct AreaDef {
    pub name: String,
    pub size: u64,
}

/// The arena owning every definition of a compilation unit. All
/// IR-internal references are ids into these tables.
#[derive(Debug, Clone)]
pub struct Program {
    pub prims: crate::prims::PrimSet,
    pub blocks: Vec<BlockDef>,
    pub tops: Vec<TopDef>,
    pub closures: Vec<ClosureDef>,
    pub datas: Vec<DataDef>,
    pub cfuns: Vec<Cfun>,
    pub areas: Vec<AreaDef>,
    next_temp: u32,
}

impl Program {
    pub fn new() -> Self {
        Program {
            prims: crate::prims::PrimSet::standard(),
            blocks: Vec::new(),
            tops: Vec::new(),
            closures: Vec::new(),
            datas: Vec::new(),
            cfuns: Vec::new(),
            areas: Vec::new(),
            next_temp: 0,
        }
    }

    pub fn fresh_temp(&mut self) -> Temp {
        let t = Temp(self.next_temp);
        self.next_temp += 1;
        t
    }

    pub fn fresh_temps(&mut self, n: usize) -> Vec<Temp> {
        (0..n).map(|_| self.fresh_temp()).collect()
    }

    pub fn add_block(&mut self, block: BlockDef) -> BlockId {
        let id = BlockId(self.blocks.len() as u32);
        self.blocks.push(block);
        id
    }

    pub fn add_top(&mut self, top: TopDef) -> TopId {
        let id = TopId(self.tops.len() as u32);
        self.tops.push(top);
        id
    }

    pub fn add_closure(&mut self, c: ClosureDef) -> ClosId {
        let id = ClosId(self.closures.len() as u32);
        self.closures.push(c);
        id
    }

    pub fn add_area(&mut self, a: AreaDef) -> AreaId {
        let id = AreaId(self.areas.len() as u32);
        self.areas.push(a);
        id
    }

    pub fn block(&self, id: BlockId) -> &BlockDef {
        &self.blocks[id.0 as usize]
    }

    pub fn block_mut(&mut self, id: BlockId) -> &mut BlockDef {
        &mut self.blocks[id.0 as usize]
    }

    pub fn top(&self, id: TopId) -> &TopDef {
        &self.tops[id.0 as usize]
    }

    pub fn closure(&self, id: ClosId) -> &ClosureDef {
        &self.closures[id.0 as usize]
    }

    pub fn data(&self, id: DataId) -> &DataDef {
        &self.datas[id.0 as usize]
    }

    pub fn cfun(&self, id: CfunId) -> &Cfun {
        &self.cfuns[id.0 as usize]
    }

    pub fn area(&self, id: AreaId) -> &AreaDef {
        &self.areas[id.0 as usize]
    }

    pub fn find_block(&self, name: &str) -> Option<BlockId> {
        self.blocks
            .iter()
            .position(|b| b.name == name)
            .map(|i| BlockId(i as u32))
    }

    pub fn find_top(&self, name: &str) -> Option<TopId> {
        self.tops
            .iter()
            .position(|t| t.name == name)
            .map(|i| TopId(i as u32))
    }

    pub fn find_cfun(&self, name: &str) -> Option<CfunId> {
        self.cfuns
            .iter()
            .position(|c| c.name == name)
            .map(|i| CfunId(i as u32))
    }

    pub fn find_area(&self, name: &str) -> Option<AreaId> {
        self.areas
            .iter()
            .position(|a| a.name == name)
            .map(|i| AreaId(i as u32))
    }

    pub fn block_ids(&self) -> impl Iterator<Item = BlockId> + use<> {
        (0..self.blocks.len() as u32).map(BlockId)
    }

    pub fn top_ids(&self) -> impl Iterator<Item = TopId> + use<> {
        (0..self.tops.len() as u32).map(TopId)
    }

    /// Result arity of a block, following terminal tails. Cycles with no
    /// grounding terminal (e.g. a self-loop) have no defined outity.
    pub fn block_outity(&self, id: BlockId) -> Option<usize> {
        fn walk(prog: &Program, id: BlockId, visited: &mut HashSet<BlockId>) -> Option<usize> {
            if !visited.insert(id) {
                return None;
            }
            terminal(prog, &prog.block(id).body, visited)
        }
        fn terminal(prog: &Program, code: &Code, visited: &mut HashSet<BlockId>) -> Option<usize> {
            match code {
                Code::Bind(_, _, next) => terminal(prog, next, visited),
                Code::Done(Tail::BlockCall(b, _)) => walk(prog, *b, visited),
                Code::Done(t) => t.outity(prog),
                Code::If(_, jt, je) => {
                    walk(prog, jt.block, visited).or_else(|| walk(prog, je.block, visited))
                }
                Code::Case(_, alts, def) => alts
                    .iter()
                    .map(|(_, j)| j.block)
                    .chain(def.iter().map(|j| j.block))
                    .find_map(|b| walk(prog, b, visited)),
            }
        }
        walk(self, id, &mut HashSet::new())
    }
}

impl Default for Program {
    fn default() -> Self {
        Program::new()
    }
}

// ---------------------------------------------------------------------------
// Summaries
//
// A summary is a hash over the shape of a tail or code fragment such that
// alpha-equivalent fragments always receive the same summary. Temporaries
// therefore contribute a fixed marker; their positions are distinguished by
// the positional fold below.
// ---------------------------------------------------------------------------

const SUMMARY_MIX: u64 = 0x2545_F491_4F6C_DD1D;

fn mix(h: u64, v: u64) -> u64 {
    h.wrapping_mul(SUMMARY_MIX).wrapping_add(v)
}

pub fn atom_summary(a: &Atom) -> u64 {
    match a {
        Atom::Temp(_) => t_fallback(),
        Atom::Int(i) => mix(1, *i as u64),
        Atom::Flag(false) => 2,
        Atom::Flag(true) => 3,
        Atom::Top(t, n) => mix(mix(4, t.0 as u64), *n as u64),
        Atom::Area(a) => mix(5, a.0 as u64),
    }
}

// Marker shared by all temps so that renaming cannot change a summary.
const fn t_fallback() -> u64 {
    0x7
}

fn atoms_summary(h: u64, atoms: &[Atom]) -> u64 {
    atoms.iter().fold(h, |h, a| mix(h, atom_summary(a)))
}

pub fn tail_summary(t: &Tail) -> u64 {
    match t {
        Tail::Return(atoms) => atoms_summary(11, atoms),
        Tail::Prim(p, atoms) => atoms_summary(mix(13, p.0 as u64), atoms),
        Tail::BlockCall(b, atoms) => atoms_summary(mix(17, b.0 as u64), atoms),
        Tail::DataAlloc(c, atoms) => atoms_summary(mix(19, c.0 as u64), atoms),
        Tail::ClosAlloc(c, atoms) => atoms_summary(mix(23, c.0 as u64), atoms),
        Tail::Enter(f, args) => atoms_summary(mix(29, atom_summary(f)), args),
        Tail::Sel(c, n, a) => mix(mix(mix(31, c.0 as u64), *n as u64), atom_summary(a)),
    }
}

pub fn code_summary(c: &Code) -> u64 {
    match c {
        Code::Bind(vs, t, next) => mix(
            mix(mix(37, vs.len() as u64), tail_summary(t)),
            code_summary(next),
        ),
        Code::Done(t) => mix(41, tail_summary(t)),
        Code::If(a, jt, je) => {
            let h = mix(43, atom_summary(a));
            let h = atoms_summary(mix(h, jt.block.0 as u64), &jt.args);
            atoms_summary(mix(h, je.block.0 as u64), &je.args)
        }
        Code::Case(a, alts, def) => {
            let mut h = mix(47, atom_summary(a));
            for (cf, j) in alts {
                h = atoms_summary(mix(mix(h, cf.0 as u64), j.block.0 as u64), &j.args);
            }
            if let Some(j) = def {
                h = atoms_summary(mix(h, j.block.0 as u64), &j.args);
            }
            h
        }
    }
}

// ---------------------------------------------------------------------------
// Alpha equivalence
//
// Structural equality modulo renaming of temporaries. `vs1` and `vs2` are
// parallel lists of temporaries considered equivalent; bindings extend the
// lists as the comparison descends.
// ---------------------------------------------------------------------------

fn alpha_atom(a1: &Atom, vs1: &[Temp], a2: &Atom, vs2: &[Temp]) -> bool {
    match (a1, a2) {
        (Atom::Temp(t1), Atom::Temp(t2)) => {
            // Most recent binding wins; temps are bound once per block, so a
            // reverse search finds the innermost correspondence.
            let p1 = vs1.iter().rposition(|v| v == t1);
            let p2 = vs2.iter().rposition(|v| v == t2);
            match (p1, p2) {
                (Some(i), Some(j)) => i == j,
                (None, None) => t1 == t2,
                _ => false,
            }
        }
        _ => a1 == a2,
    }
}

fn alpha_atoms(a1: &[Atom], vs1: &[Temp], a2: &[Atom], vs2: &[Temp]) -> bool {
    a1.len() == a2.len()
        && a1
            .iter()
            .zip(a2.iter())
            .all(|(x, y)| alpha_atom(x, vs1, y, vs2))
}

fn alpha_jump(j1: &JumpTo, vs1: &[Temp], j2: &JumpTo, vs2: &[Temp]) -> bool {
    j1.block == j2.block && alpha_atoms(&j1.args, vs1, &j2.args, vs2)
}

/// Structural equality of two tails modulo renaming of the parallel temp
/// lists `vs1`/`vs2`.
pub fn alpha_tail(t1: &Tail, vs1: &[Temp], t2: &Tail, vs2: &[Temp]) -> bool {
    match (t1, t2) {
        (Tail::Return(x), Tail::Return(y)) => alpha_atoms(x, vs1, y, vs2),
        (Tail::Prim(p, x), Tail::Prim(q, y)) => p == q && alpha_atoms(x, vs1, y, vs2),
        (Tail::BlockCall(b, x), Tail::BlockCall(c, y)) => b == c && alpha_atoms(x, vs1, y, vs2),
        (Tail::DataAlloc(b, x), Tail::DataAlloc(c, y)) => b == c && alpha_atoms(x, vs1, y, vs2),
        (Tail::ClosAlloc(b, x), Tail::ClosAlloc(c, y)) => b == c && alpha_atoms(x, vs1, y, vs2),
        (Tail::Enter(f, x), Tail::Enter(g, y)) => {
            alpha_atom(f, vs1, g, vs2) && alpha_atoms(x, vs1, y, vs2)
        }
        (Tail::Sel(b, m, x), Tail::Sel(c, n, y)) => b == c && m == n && alpha_atom(x, vs1, y, vs2),
        _ => false,
    }
}

/// Alpha equivalence on code spines, extending the temp lists at each bind.
pub fn alpha_code(c1: &Code, vs1: &[Temp], c2: &Code, vs2: &[Temp]) -> bool {
    match (c1, c2) {
        (Code::Bind(bs1, t1, n1), Code::Bind(bs2, t2, n2)) => {
            if bs1.len() != bs2.len() || !alpha_tail(t1, vs1, t2, vs2) {
                return false;
            }
            let mut xs1 = vs1.to_vec();
            let mut xs2 = vs2.to_vec();
            xs1.extend_from_slice(bs1);
            xs2.extend_from_slice(bs2);
            alpha_code(n1, &xs1, n2, &xs2)
        }
        (Code::Done(t1), Code::Done(t2)) => alpha_tail(t1, vs1, t2, vs2),
        (Code::If(a1, jt1, je1), Code::If(a2, jt2, je2)) => {
            alpha_atom(a1, vs1, a2, vs2)
                && alpha_jump(jt1, vs1, jt2, vs2)
                && alpha_jump(je1, vs1, je2, vs2)
        }
        (Code::Case(a1, alts1, d1), Code::Case(a2, alts2, d2)) => {
            if !alpha_atom(a1, vs1, a2, vs2) || alts1.len() != alts2.len() {
                return false;
            }
            let alts_ok = alts1
                .iter()
                .zip(alts2.iter())
                .all(|((c1, j1), (c2, j2))| c1 == c2 && alpha_jump(j1, vs1, j2, vs2));
            let def_ok = match (d1, d2) {
                (Some(j1), Some(j2)) => alpha_jump(j1, vs1, j2, vs2),
                (None, None) => true,
                _ => false,
            };
            alts_ok && def_ok
        }
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn prog() -> Program {
        Program::new()
    }

    #[test]
    fn test_temps_are_unique() {
        let mut p = prog();
        let a = p.fresh_temp();
        let b = p.fresh_temp();
        assert_ne!(a, b);
    }

    #[test]
    fn test_tail_purity() {
        let p = prog();
        let add = p.prims.add();
        let store = p.prims.store();
        assert!(Tail::Prim(add, vec![Atom::Int(1), Atom::Int(2)]).is_repeatable(&p));
        assert!(!Tail::Prim(store, vec![]).has_no_effect(&p));
        assert!(Tail::Return(vec![]).is_repeatable(&p));
    }

    #[test]
    fn test_append_splices_under_binds() {
        let mut p = prog();
        let add = p.prims.add();
        let t = p.fresh_temp();
        let frag = Code::Bind(
            vec![t],
            Tail::Prim(add, vec![Atom::Int(1), Atom::Int(2)]),
            Box::new(Code::Done(Tail::Return(vec![Atom::Temp(t)]))),
        );
        let spliced = frag.append(|tail| {
            Code::Bind(
                vec![Temp(99)],
                tail,
                Box::new(Code::Done(Tail::Return(vec![Atom::Temp(Temp(99))]))),
            )
        });
        match spliced {
            Code::Bind(_, _, next) => match *next {
                Code::Bind(vs, Tail::Return(_), _) => assert_eq!(vs, vec![Temp(99)]),
                other => panic!("unexpected spine: {:?}", other),
            },
            other => panic!("unexpected spine: {:?}", other),
        }
    }

    #[test]
    fn test_alpha_tail_modulo_renaming() {
        let p = prog();
        let add = p.prims.add();
        let (x, y) = (Temp(0), Temp(1));
        let (u, v) = (Temp(10), Temp(11));
        let t1 = Tail::Prim(add, vec![Atom::Temp(x), Atom::Temp(y)]);
        let t2 = Tail::Prim(add, vec![Atom::Temp(u), Atom::Temp(v)]);
        assert!(alpha_tail(&t1, &[x, y], &t2, &[u, v]));
        // Swapped correspondence is not equivalent.
        assert!(!alpha_tail(&t1, &[x, y], &t2, &[v, u]));
        // Unlisted temps must be identical.
        assert!(!alpha_tail(&t1, &[], &t2, &[]));
        assert!(alpha_tail(&t1, &[], &t1, &[]));
    }

    #[test]
    fn test_summary_respects_alpha_equivalence() {
        let p = prog();
        let add = p.prims.add();
        let mk = |a: Temp, b: Temp| {
            Code::Bind(
                vec![b],
                Tail::Prim(add, vec![Atom::Temp(a), Atom::Int(3)]),
                Box::new(Code::Done(Tail::Return(vec![Atom::Temp(b)]))),
            )
        };
        let c1 = mk(Temp(0), Temp(1));
        let c2 = mk(Temp(7), Temp(8));
        assert!(alpha_code(&c1, &[Temp(0)], &c2, &[Temp(7)]));
        assert_eq!(code_summary(&c1), code_summary(&c2));
    }

    #[test]
    fn test_summary_distinguishes_shapes() {
        let p = prog();
        let add = p.prims.add();
        let sub = p.prims.sub();
        let t1 = Tail::Prim(add, vec![Atom::Int(1), Atom::Int(2)]);
        let t2 = Tail::Prim(sub, vec![Atom::Int(1), Atom::Int(2)]);
        let t3 = Tail::Prim(add, vec![Atom::Int(2), Atom::Int(1)]);
        assert_ne!(tail_summary(&t1), tail_summary(&t2));
        // Positional fold distinguishes argument order.
        assert_ne!(tail_summary(&t1), tail_summary(&t3));
    }

    #[test]
    fn test_block_outity_follows_calls() {
        let mut p = prog();
        let leaf = p.add_block(BlockDef {
            name: "leaf".into(),
            params: vec![],
            ptypes: vec![],
            body: Code::Done(Tail::Return(vec![Atom::Int(1), Atom::Int(2)])),
        });
        let caller = p.add_block(BlockDef {
            name: "caller".into(),
            params: vec![],
            ptypes: vec![],
            body: Code::Done(Tail::BlockCall(leaf, vec![])),
        });
        assert_eq!(p.block_outity(leaf), Some(2));
        assert_eq!(p.block_outity(caller), Some(2));

        let spin = p.add_block(BlockDef {
            name: "spin".into(),
            params: vec![],
            ptypes: vec![],
            body: Code::Done(Tail::BlockCall(BlockId(2), vec![])),
        });
        assert_eq!(p.block_outity(spin), None);
    }
}
