//! LC to MIL translation
//!
//! Lowers a lifted LC program onto the MIL substrate. Supercombinators
//! with parameters become blocks; zero-parameter definitions become
//! top-levels (with a generated init block when the body needs bindings).
//! Saturated applications of known definitions become block calls;
//! functional values become closures over wrapper definitions and are
//! applied with `enter`.
//!
//! Conditionals linearize in continuation style: each arm becomes its own
//! block, and a non-tail `if` sends both arms to a generated join block
//! whose parameters carry the result plus everything the continuation
//! still needs. LC is word-typed; flags exist only between a comparison
//! and the branch (or a `flagToWord` coercion) that consumes it.

use crate::lc::Expr;
use crate::lift::{LiftedProgram, Super};
use crate::mil::{
    Atom, BlockDef, BlockId, ClosId, ClosureDef, Code, JumpTo, Program, Tail, Temp, TopDef, TopId,
};
use crate::prims::PrimId;
use crate::types::Type;
use std::collections::HashMap;

#[derive(Debug, Clone, Copy)]
enum GlobalRef {
    Block(BlockId, usize),
    Top(TopId),
}

type Env = HashMap<String, Atom>;
type K = Box<dyn FnOnce(&mut Lowerer, Atom) -> Result<Code, String>>;

pub struct Lowerer {
    prog: Program,
    globals: HashMap<String, GlobalRef>,
    /// Types of generated temps, where more precise than `word`.
    types: HashMap<Temp, Type>,
    block_wrappers: HashMap<BlockId, ClosId>,
    prim_wrappers: HashMap<PrimId, ClosId>,
}

/// Translate a lifted program into MIL.
pub fn lower_program(lifted: &LiftedProgram) -> Result<Program, String> {
    let mut lw = Lowerer {
        prog: Program::new(),
        globals: HashMap::new(),
        types: HashMap::new(),
        block_wrappers: HashMap::new(),
        prim_wrappers: HashMap::new(),
    };

    // Declare everything first; bodies may refer forward.
    for s in &lifted.supers {
        if lw.globals.contains_key(&s.name) {
            return Err(format!("definition {} lifted twice", s.name));
        }
        if s.params.is_empty() && s.name != "main" {
            let id = lw.prog.add_top(TopDef {
                name: s.name.clone(),
                lhs: vec![s.name.clone()],
                types: vec![Type::Word],
                tail: Tail::Return(vec![Atom::Int(0)]),
            });
            lw.globals.insert(s.name.clone(), GlobalRef::Top(id));
        } else {
            let params = lw.prog.fresh_temps(s.params.len());
            let id = lw.prog.add_block(BlockDef {
                name: s.name.clone(),
                ptypes: vec![Type::Word; params.len()],
                params,
                body: Code::Done(Tail::Return(vec![])),
            });
            lw.globals
                .insert(s.name.clone(), GlobalRef::Block(id, s.params.len()));
        }
    }

    for s in &lifted.supers {
        lw.lower_super(s)?;
    }
    lw.finalize_top_types()?;
    Ok(lw.prog)
}

impl Lowerer {
    fn lower_super(&mut self, s: &Super) -> Result<(), String> {
        match self.globals[&s.name] {
            GlobalRef::Block(id, _) => {
                let params = self.prog.block(id).params.clone();
                let mut env = Env::new();
                for (name, t) in s.params.iter().zip(params.iter()) {
                    env.insert(name.clone(), Atom::Temp(*t));
                }
                let body = self.lower_tail(&s.body, &env)?;
                self.prog.block_mut(id).body = body;
                Ok(())
            }
            GlobalRef::Top(id) => {
                let code = self.lower_tail(&s.body, &Env::new())?;
                let tail = match code {
                    Code::Done(t) => t,
                    // The body needed bindings or branches: house them in
                    // an init block and call it once.
                    other => {
                        let b = self.prog.add_block(BlockDef {
                            name: format!("{}_init", s.name),
                            params: Vec::new(),
                            ptypes: Vec::new(),
                            body: other,
                        });
                        Tail::BlockCall(b, Vec::new())
                    }
                };
                self.prog.tops[id.0 as usize].tail = tail;
                Ok(())
            }
        }
    }

    /// Top result types settle after every body exists.
    fn finalize_top_types(&mut self) -> Result<(), String> {
        let bt = crate::check::BlockTypes::resolve(&self.prog)?;
        for i in 0..self.prog.tops.len() {
            let tail = self.prog.tops[i].tail.clone();
            if let Ok(tys) = crate::check::tail_types(&self.prog, &HashMap::new(), &tail, &bt) {
                if tys.len() == 1 {
                    self.prog.tops[i].types = tys;
                }
            }
        }
        Ok(())
    }

    // -- expression lowering ------------------------------------------------

    /// Lower `e` in tail position: the produced code returns its value.
    fn lower_tail(&mut self, e: &Expr, env: &Env) -> Result<Code, String> {
        match e {
            Expr::If(c, t, el) => {
                let (t, el) = (t.as_ref().clone(), el.as_ref().clone());
                let env2 = env.clone();
                self.lower_flag(c, env, move |lw, flag| {
                    let then_code = lw.lower_tail(&t, &env2)?;
                    let else_code = lw.lower_tail(&el, &env2)?;
                    let jt = lw.seal_block("iftrue", then_code);
                    let je = lw.seal_block("iffalse", else_code);
                    Ok(Code::If(flag, jt, je))
                })
            }
            Expr::Let(bindings, body) => {
                let body = body.as_ref().clone();
                let bindings = bindings.clone();
                self.lower_let(&bindings, env, move |lw, env2| lw.lower_tail(&body, &env2))
            }
            Expr::App(..) => {
                // Saturated known calls stay in tail position.
                let (head, args) = flatten_app(e);
                if let Expr::Var(name) = head {
                    if env.get(name).is_none() {
                        if let Some(GlobalRef::Block(b, arity)) = self.globals.get(name).copied() {
                            if args.len() == arity {
                                let args: Vec<Expr> = args.into_iter().cloned().collect();
                                return self.lower_many(&args, env, move |_lw, atoms| {
                                    Ok(Code::Done(Tail::BlockCall(b, atoms)))
                                });
                            }
                        }
                        if let Some(p) = self.lookup_prim(name) {
                            let prim = self.prog.prims.get(p);
                            // Flag results still widen on the way out, so
                            // they take the bind-and-coerce path below.
                            if args.len() == prim.arity()
                                && prim.block_type.rng.first() != Some(&Type::Flag)
                            {
                                let args: Vec<Expr> = args.into_iter().cloned().collect();
                                return self.lower_many(&args, env, move |_lw, atoms| {
                                    Ok(Code::Done(Tail::Prim(p, atoms)))
                                });
                            }
                        }
                    }
                }
                self.lower_atom(e, env, Box::new(|lw, a| Ok(lw.return_word(a))))
            }
            _ => self.lower_atom(e, env, Box::new(|lw, a| Ok(lw.return_word(a)))),
        }
    }

    /// Lower `e` to an atom and hand it to the continuation.
    fn lower_atom(&mut self, e: &Expr, env: &Env, k: K) -> Result<Code, String> {
        match e {
            Expr::Lit(i) => k(self, Atom::Int(*i)),
            Expr::Var(name) => {
                let atom = self.var_atom(name, env)?;
                match atom {
                    VarAtom::Plain(a) => k(self, a),
                    VarAtom::NeedsClosure(tail, ty) => {
                        let t = self.prog.fresh_temp();
                        self.types.insert(t, ty);
                        let rest = k(self, Atom::Temp(t))?;
                        Ok(Code::Bind(vec![t], tail, Box::new(rest)))
                    }
                }
            }
            Expr::Lam(..) => Err("internal error: lambda survived lifting".to_string()),
            Expr::Let(bindings, body) => {
                let body = body.as_ref().clone();
                let bindings = bindings.clone();
                self.lower_let(&bindings, env, move |lw, env2| {
                    lw.lower_atom(&body, &env2, k)
                })
            }
            Expr::If(c, t, el) => {
                let (t, el) = (t.as_ref().clone(), el.as_ref().clone());
                let env2 = env.clone();
                self.lower_flag(c, env, move |lw, flag| {
                    // Build the continuation as a join block; both arms
                    // feed it their result.
                    let jr = lw.prog.fresh_temp();
                    let rest = k(lw, Atom::Temp(jr))?;
                    let join = lw.seal_join(jr, rest);

                    let env3 = env2.clone();
                    let jo = join.clone();
                    let then_code = lw.lower_atom(&t, &env2, Box::new(move |lw2, a| {
                        Ok(jo.jump(lw2, a))
                    }))?;
                    let jo = join.clone();
                    let else_code = lw.lower_atom(&el, &env3, Box::new(move |lw2, a| {
                        Ok(jo.jump(lw2, a))
                    }))?;
                    let jt = lw.seal_block("iftrue", then_code);
                    let je = lw.seal_block("iffalse", else_code);
                    Ok(Code::If(flag, jt, je))
                })
            }
            Expr::App(..) => {
                let (head, args) = flatten_app(e);
                let args: Vec<Expr> = args.into_iter().cloned().collect();
                self.lower_call(head, &args, env, k)
            }
        }
    }

    fn lower_call(&mut self, head: &Expr, args: &[Expr], env: &Env, k: K) -> Result<Code, String> {
        if let Expr::Var(name) = head {
            if env.get(name).is_none() {
                if let Some(GlobalRef::Block(b, arity)) = self.globals.get(name).copied() {
                    if args.len() != arity {
                        return Err(format!(
                            "{} applied to {} arguments, expects {} \
                             (partial application is not supported; eta-expand)",
                            name,
                            args.len(),
                            arity
                        ));
                    }
                    return self.lower_many(args, env, move |lw, atoms| {
                        let t = lw.prog.fresh_temp();
                        let rest = k(lw, Atom::Temp(t))?;
                        Ok(Code::Bind(
                            vec![t],
                            Tail::BlockCall(b, atoms),
                            Box::new(rest),
                        ))
                    });
                }
                if let Some(p) = self.lookup_prim(name) {
                    let prim = self.prog.prims.get(p);
                    let (arity, outity) = (prim.arity(), prim.outity());
                    let flag_result = prim.block_type.rng.first() == Some(&Type::Flag);
                    if args.len() != arity {
                        return Err(format!(
                            "primitive {} applied to {} arguments, expects {}",
                            name,
                            args.len(),
                            arity
                        ));
                    }
                    return self.lower_many(args, env, move |lw, atoms| {
                        if outity == 0 {
                            // Unit-valued: the expression's value is zero.
                            let rest = k(lw, Atom::Int(0))?;
                            return Ok(Code::Bind(
                                Vec::new(),
                                Tail::Prim(p, atoms),
                                Box::new(rest),
                            ));
                        }
                        let t = lw.prog.fresh_temp();
                        if flag_result {
                            lw.types.insert(t, Type::Flag);
                        }
                        let rest = k(lw, Atom::Temp(t))?;
                        Ok(Code::Bind(vec![t], Tail::Prim(p, atoms), Box::new(rest)))
                    });
                }
            }
        }
        // General case: evaluate the head to a closure value and enter it.
        let head = head.clone();
        let args: Vec<Expr> = args.to_vec();
        let env2 = env.clone();
        self.lower_atom(&head, env, Box::new(move |lw, f| {
            lw.lower_many(&args, &env2, move |lw2, atoms| {
                let t = lw2.prog.fresh_temp();
                let rest = k(lw2, Atom::Temp(t))?;
                Ok(Code::Bind(vec![t], Tail::Enter(f, atoms), Box::new(rest)))
            })
        }))
    }

    /// Lower a residual (value) binding group, then continue with the
    /// extended environment.
    fn lower_let(
        &mut self,
        bindings: &[crate::lc::Binding],
        env: &Env,
        k: impl FnOnce(&mut Self, Env) -> Result<Code, String> + 'static,
    ) -> Result<Code, String> {
        match bindings {
            [] => k(self, env.clone()),
            [b, rest @ ..] => {
                let name = b.name.clone();
                let rest: Vec<crate::lc::Binding> = rest.to_vec();
                let env2 = env.clone();
                self.lower_atom(&b.expr, env, Box::new(move |lw, a| {
                    let mut env3 = env2;
                    env3.insert(name, a);
                    lw.lower_let(&rest, &env3, k)
                }))
            }
        }
    }

    /// Lower a list of expressions left to right.
    fn lower_many(
        &mut self,
        exprs: &[Expr],
        env: &Env,
        k: impl FnOnce(&mut Self, Vec<Atom>) -> Result<Code, String> + 'static,
    ) -> Result<Code, String> {
        fn go(
            lw: &mut Lowerer,
            exprs: &[Expr],
            env: &Env,
            mut acc: Vec<Atom>,
            k: Box<dyn FnOnce(&mut Lowerer, Vec<Atom>) -> Result<Code, String>>,
        ) -> Result<Code, String> {
            match exprs {
                [] => k(lw, acc),
                [e, rest @ ..] => {
                    let rest: Vec<Expr> = rest.to_vec();
                    let env2 = env.clone();
                    lw.lower_atom(e, env, Box::new(move |lw2, a| {
                        acc.push(a);
                        go(lw2, &rest, &env2, acc, k)
                    }))
                }
            }
        }
        go(self, exprs, env, Vec::new(), Box::new(k))
    }

    /// Lower a condition to a flag atom. Comparisons are used directly;
    /// anything else is tested against zero.
    fn lower_flag(
        &mut self,
        e: &Expr,
        env: &Env,
        k: impl FnOnce(&mut Self, Atom) -> Result<Code, String> + 'static,
    ) -> Result<Code, String> {
        self.lower_atom(e, env, Box::new(move |lw, a| {
            let is_flag = matches!(a, Atom::Flag(_))
                || matches!(a, Atom::Temp(t) if lw.types.get(&t) == Some(&Type::Flag));
            if is_flag {
                return k(lw, a);
            }
            let neq = lw.prog.prims.prim_neq();
            let f = lw.prog.fresh_temp();
            lw.types.insert(f, Type::Flag);
            let rest = k(lw, Atom::Temp(f))?;
            Ok(Code::Bind(
                vec![f],
                Tail::Prim(neq, vec![a, Atom::Int(0)]),
                Box::new(rest),
            ))
        }))
    }

    // -- helpers ------------------------------------------------------------

    fn lookup_prim(&self, name: &str) -> Option<PrimId> {
        self.prog.prims.by_name(name)
    }

    fn var_atom(&mut self, name: &str, env: &Env) -> Result<VarAtom, String> {
        if let Some(a) = env.get(name) {
            return Ok(VarAtom::Plain(*a));
        }
        match self.globals.get(name).copied() {
            Some(GlobalRef::Top(t)) => Ok(VarAtom::Plain(Atom::Top(t, 0))),
            Some(GlobalRef::Block(b, _)) => {
                // A definition used as a value closes over nothing.
                let k = self.block_wrapper(b);
                Ok(VarAtom::NeedsClosure(
                    Tail::ClosAlloc(k, Vec::new()),
                    Type::Clos(k),
                ))
            }
            None => match self.lookup_prim(name) {
                Some(p) => {
                    let k = self.prim_wrapper(p);
                    Ok(VarAtom::NeedsClosure(
                        Tail::ClosAlloc(k, Vec::new()),
                        Type::Clos(k),
                    ))
                }
                None => Err(format!("unknown name '{}'", name)),
            },
        }
    }

    fn block_wrapper(&mut self, b: BlockId) -> ClosId {
        if let Some(k) = self.block_wrappers.get(&b) {
            return *k;
        }
        let arity = self.prog.block(b).params.len();
        let params = self.prog.fresh_temps(arity);
        let args = params.iter().map(|t| Atom::Temp(*t)).collect();
        let name = format!("{}_val", self.prog.block(b).name);
        let k = self.prog.add_closure(ClosureDef {
            name,
            stored: Vec::new(),
            stypes: Vec::new(),
            ptypes: vec![Type::Word; arity],
            params,
            rtypes: vec![Type::Word],
            body: Tail::BlockCall(b, args),
        });
        self.block_wrappers.insert(b, k);
        k
    }

    fn prim_wrapper(&mut self, p: PrimId) -> ClosId {
        if let Some(k) = self.prim_wrappers.get(&p) {
            return *k;
        }
        let prim = self.prog.prims.get(p);
        let (arity, name) = (prim.arity(), format!("{}_val", prim.name));
        let ptypes = prim.block_type.dom.clone();
        let rtypes = prim.block_type.rng.clone();
        let params = self.prog.fresh_temps(arity);
        let args = params.iter().map(|t| Atom::Temp(*t)).collect();
        let k = self.prog.add_closure(ClosureDef {
            name,
            stored: Vec::new(),
            stypes: Vec::new(),
            params,
            ptypes,
            rtypes,
            body: Tail::Prim(p, args),
        });
        self.prim_wrappers.insert(p, k);
        k
    }

    /// Flag-typed values widen to words when they escape into a word
    /// position.
    fn ensure_word(&mut self, a: Atom) -> AtomOrCode {
        let is_flag = matches!(a, Atom::Flag(_))
            || matches!(a, Atom::Temp(t) if self.types.get(&t) == Some(&Type::Flag));
        if !is_flag {
            return AtomOrCode::Plain(a);
        }
        let f2w = self.prog.prims.flag_to_word();
        let t = self.prog.fresh_temp();
        AtomOrCode::Coerced(Code::Bind(
            vec![t],
            Tail::Prim(f2w, vec![a]),
            Box::new(Code::Done(Tail::Return(vec![Atom::Temp(t)]))),
        ))
    }

    /// Return an atom from tail position, widening flags to words.
    fn return_word(&mut self, a: Atom) -> Code {
        match self.ensure_word(a) {
            AtomOrCode::Plain(a) => Code::Done(Tail::Return(vec![a])),
            AtomOrCode::Coerced(code) => code,
        }
    }

    /// Turn loose code into a block over its free temporaries, renamed to
    /// fresh parameters, and return the jump that reaches it.
    fn seal_block(&mut self, stem: &str, code: Code) -> JumpTo {
        let free = free_temps(&code);
        let params = self.prog.fresh_temps(free.len());
        let map: HashMap<Temp, Atom> = free
            .iter()
            .copied()
            .zip(params.iter().map(|t| Atom::Temp(*t)))
            .collect();
        let ptypes: Vec<Type> = free
            .iter()
            .map(|t| self.types.get(t).cloned().unwrap_or(Type::Word))
            .collect();
        for (p, ty) in params.iter().zip(ptypes.iter()) {
            self.types.insert(*p, ty.clone());
        }
        let body = map_code_atoms(&code, &map);
        let name = format!("{}_{}", stem, self.prog.blocks.len());
        let b = self.prog.add_block(BlockDef {
            name,
            params,
            ptypes,
            body,
        });
        JumpTo::new(b, free.into_iter().map(Atom::Temp).collect())
    }

    /// Seal the continuation of a non-tail `if` into a join block taking
    /// the result first.
    fn seal_join(&mut self, result: Temp, rest: Code) -> Join {
        let mut free = free_temps(&rest);
        free.retain(|t| *t != result);
        let params = self.prog.fresh_temps(free.len() + 1);
        let mut map: HashMap<Temp, Atom> = HashMap::new();
        map.insert(result, Atom::Temp(params[0]));
        let mut ptypes = vec![Type::Word];
        for (t, p) in free.iter().zip(params.iter().skip(1)) {
            map.insert(*t, Atom::Temp(*p));
            ptypes.push(self.types.get(t).cloned().unwrap_or(Type::Word));
        }
        for (p, ty) in params.iter().zip(ptypes.iter()) {
            self.types.insert(*p, ty.clone());
        }
        let body = map_code_atoms(&rest, &map);
        let name = format!("join_{}", self.prog.blocks.len());
        let b = self.prog.add_block(BlockDef {
            name,
            params,
            ptypes,
            body,
        });
        Join { block: b, free }
    }
}

#[derive(Clone)]
struct Join {
    block: BlockId,
    free: Vec<Temp>,
}

impl Join {
    /// The arm-side transfer into the join: result first, captures after.
    /// Flag results widen on the way in.
    fn jump(&self, lw: &mut Lowerer, a: Atom) -> Code {
        let mk = |a: Atom| {
            let mut args = vec![a];
            args.extend(self.free.iter().map(|t| Atom::Temp(*t)));
            Code::Done(Tail::BlockCall(self.block, args))
        };
        match lw.ensure_word(a) {
            AtomOrCode::Plain(a) => mk(a),
            // The coercion returns the widened value; rebind it into the
            // jump instead.
            AtomOrCode::Coerced(Code::Bind(vs, t, _)) => {
                let v = vs[0];
                Code::Bind(vs, t, Box::new(mk(Atom::Temp(v))))
            }
            AtomOrCode::Coerced(other) => other,
        }
    }
}

enum VarAtom {
    Plain(Atom),
    NeedsClosure(Tail, Type),
}

enum AtomOrCode {
    Plain(Atom),
    Coerced(Code),
}

fn flatten_app(e: &Expr) -> (&Expr, Vec<&Expr>) {
    match e {
        Expr::App(f, args) => {
            let (head, mut inner) = flatten_app(f);
            inner.extend(args.iter());
            (head, inner)
        }
        other => (other, Vec::new()),
    }
}

/// Temporaries used by `code` but not bound within it, in id order.
fn free_temps(code: &Code) -> Vec<Temp> {
    fn walk(code: &Code, bound: &mut Vec<Temp>, free: &mut Vec<Temp>) {
        let mut note = |a: &Atom, bound: &Vec<Temp>, free: &mut Vec<Temp>| {
            if let Atom::Temp(t) = a {
                if !bound.contains(t) && !free.contains(t) {
                    free.push(*t);
                }
            }
        };
        match code {
            Code::Bind(vs, t, next) => {
                t.for_each_atom(&mut |a| note(a, bound, free));
                let mark = bound.len();
                bound.extend_from_slice(vs);
                walk(next, bound, free);
                bound.truncate(mark);
            }
            Code::Done(t) => t.for_each_atom(&mut |a| note(a, bound, free)),
            Code::If(a, jt, je) => {
                note(a, bound, free);
                for arg in jt.args.iter().chain(je.args.iter()) {
                    note(arg, bound, free);
                }
            }
            Code::Case(a, alts, def) => {
                note(a, bound, free);
                for (_, j) in alts {
                    for arg in &j.args {
                        note(arg, bound, free);
                    }
                }
                if let Some(j) = def {
                    for arg in &j.args {
                        note(arg, bound, free);
                    }
                }
            }
        }
    }
    let mut free = Vec::new();
    walk(code, &mut Vec::new(), &mut free);
    free.sort_unstable();
    free
}

fn map_code_atoms(code: &Code, map: &HashMap<Temp, Atom>) -> Code {
    let subst = |a: &Atom| -> Atom {
        match a {
            Atom::Temp(t) => map.get(t).copied().unwrap_or(*a),
            _ => *a,
        }
    };
    match code {
        Code::Bind(vs, t, next) => Code::Bind(
            vs.clone(),
            t.map_atoms(&mut |a| subst(a)),
            Box::new(map_code_atoms(next, map)),
        ),
        Code::Done(t) => Code::Done(t.map_atoms(&mut |a| subst(a))),
        Code::If(a, jt, je) => Code::If(
            subst(a),
            JumpTo::new(jt.block, jt.args.iter().map(&subst).collect()),
            JumpTo::new(je.block, je.args.iter().map(&subst).collect()),
        ),
        Code::Case(a, alts, def) => Code::Case(
            subst(a),
            alts.iter()
                .map(|(cf, j)| (*cf, JumpTo::new(j.block, j.args.iter().map(&subst).collect())))
                .collect(),
            def.as_ref()
                .map(|j| JumpTo::new(j.block, j.args.iter().map(&subst).collect())),
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interp::{run_program, Value};
    use crate::lc::LcParser;
    use crate::lift::lift_program;

    fn compile(src: &str) -> Program {
        let lc = LcParser::new(src).parse().unwrap();
        let lifted = lift_program(&lc, &[]).unwrap();
        let prog = lower_program(&lifted).unwrap();
        crate::check::check_program(&prog).unwrap();
        prog
    }

    fn run(src: &str) -> Vec<Value> {
        run_program(&compile(src)).unwrap().result
    }

    #[test]
    fn test_lower_arithmetic() {
        assert_eq!(run("def main = add 40 2\n"), vec![Value::Word(42)]);
    }

    #[test]
    fn test_lower_nested_calls() {
        assert_eq!(
            run("def inc x = add x 1\ndef main = inc (inc 40)\n"),
            vec![Value::Word(42)]
        );
    }

    #[test]
    fn test_lower_if_tail_position() {
        assert_eq!(
            run("def main = if primLt 1 2 then 10 else 20\n"),
            vec![Value::Word(10)]
        );
    }

    #[test]
    fn test_lower_if_in_argument_position() {
        // The conditional feeds a surrounding call through a join block.
        assert_eq!(
            run("def main = add (if primLt 2 1 then 10 else 20) 7\n"),
            vec![Value::Word(27)]
        );
    }

    #[test]
    fn test_lower_word_condition() {
        // Non-flag conditions test against zero.
        assert_eq!(
            run("def main = if 5 then 1 else 0\n"),
            vec![Value::Word(1)]
        );
        assert_eq!(
            run("def main = if 0 then 1 else 0\n"),
            vec![Value::Word(0)]
        );
    }

    #[test]
    fn test_lower_recursion() {
        let src = "def fact n = if primEq n 0 then 1 else mul n (fact (sub n 1))\n\
                   def main = fact 5\n";
        assert_eq!(run(src), vec![Value::Word(120)]);
    }

    #[test]
    fn test_lower_higher_order_function() {
        let src = "def twice f x = f (f x)\n\
                   def main = twice (\\y -> mul y 3) 2\n";
        assert_eq!(run(src), vec![Value::Word(18)]);
    }

    #[test]
    fn test_lower_lifted_capture() {
        let src = "def addTo n = let bump x = add x n in bump 2\n\
                   def main = addTo 40\n";
        assert_eq!(run(src), vec![Value::Word(42)]);
    }

    #[test]
    fn test_lower_top_values() {
        let src = "def base = add 30 10\n\
                   def main = add base 2\n";
        assert_eq!(run(src), vec![Value::Word(42)]);
    }

    #[test]
    fn test_lower_mutual_recursion() {
        let src = "def main =\n\
                   \x20 let even n = if primEq n 0 then 1 else odd (sub n 1)\n\
                   \x20 and odd n = if primEq n 0 then 0 else even (sub n 1)\n\
                   \x20 in even 10\n";
        assert_eq!(run(src), vec![Value::Word(1)]);
    }

    #[test]
    fn test_lower_flag_escaping_to_word() {
        // A comparison used as a value widens via flagToWord.
        let src = "def main = primLt 1 2\n";
        assert_eq!(run(src), vec![Value::Word(1)]);
    }

    #[test]
    fn test_lowered_programs_optimize_and_emit() {
        let src = "def double x = mul x 2\n\
                   def main = double (double 8)\n";
        let mut prog = compile(src);
        let before = run_program(&prog).unwrap().result;
        crate::passes::optimize(&mut prog, &crate::config::CompilerConfig::default()).unwrap();
        let after = run_program(&prog).unwrap().result;
        assert_eq!(before, after);
        crate::repr::lower_program(&mut prog).unwrap();
        let ir = crate::emit::emit_program(&prog).unwrap();
        assert!(ir.contains("define i32 @main()"), "{}", ir);
    }

    #[test]
    fn test_partial_application_reports_error() {
        let lc = LcParser::new("def addBoth x y = add x y\ndef main = addBoth 1\n")
            .parse()
            .unwrap();
        let lifted = lift_program(&lc, &[]).unwrap();
        let err = lower_program(&lifted).unwrap_err();
        assert!(err.contains("partial application"), "{}", err);
    }
}
