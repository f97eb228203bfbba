//! The optimizer pass driver
//!
//! Four passes run to a joint fixpoint: `inline` unfolds trivial block
//! calls, `flow` walks each block extending a fact table and rewriting
//! tails (with dead-binding pruning on the way back up), `dedup` merges
//! alpha-equivalent definitions found through their summaries, and
//! `unused_args` drops parameter positions no block body reads.
//!
//! Iteration order is fixed: definitions in declaration order, blocks
//! reachable from the entry points first, and within a block the walk
//! proceeds from the outermost bind inward, so a rewrite at any point
//! sees exactly the facts bound earlier on its own spine.

use crate::check;
use crate::config::CompilerConfig;
use crate::facts::Facts;
use crate::mil::{
    alpha_code, code_summary, tail_summary, Atom, BlockId, Code, JumpTo, Program, Tail, Temp,
    TopId,
};
use crate::prims::PrimOp;
use crate::rewrite;
use crate::types::Type;
use std::collections::{HashMap, HashSet, VecDeque};
use tracing::{debug, trace};

/// Run the optimizer to a fixpoint (bounded by `max_iterations`).
pub fn optimize(prog: &mut Program, config: &CompilerConfig) -> Result<(), String> {
    for iteration in 1..=config.max_iterations {
        let mut changed = false;
        if config.passes.inline {
            let c = inline_pass(prog);
            trace!(pass = "inline", changed = c, "pass finished");
            changed |= c;
        }
        if config.passes.flow {
            let c = flow_pass(prog)?;
            trace!(pass = "flow", changed = c, "pass finished");
            changed |= c;
        }
        if config.passes.dedup {
            let c = dedup_pass(prog);
            trace!(pass = "dedup", changed = c, "pass finished");
            changed |= c;
        }
        if config.passes.unused_args {
            let c = unused_args_pass(prog);
            trace!(pass = "unused_args", changed = c, "pass finished");
            changed |= c;
        }
        debug!(iteration, changed, "optimizer iteration");
        if config.dump_passes {
            debug!("\n{}", crate::display::print_program(prog));
        }
        if cfg!(debug_assertions) {
            check::check_program(prog)?;
        }
        if !changed {
            return Ok(());
        }
    }
    Ok(())
}

/// Blocks reachable from the entry points (the `main` block plus anything
/// referenced from top-levels or closures) first, in discovery order, then
/// the remainder in declaration order.
fn block_order(prog: &Program) -> Vec<BlockId> {
    let mut queue: VecDeque<BlockId> = VecDeque::new();
    let mut seen: HashSet<BlockId> = HashSet::new();
    let mut push = |b: BlockId, queue: &mut VecDeque<BlockId>, seen: &mut HashSet<BlockId>| {
        if seen.insert(b) {
            queue.push_back(b);
        }
    };

    if let Some(main) = prog.find_block("main") {
        push(main, &mut queue, &mut seen);
    }
    for top in &prog.tops {
        if let Tail::BlockCall(b, _) = &top.tail {
            push(*b, &mut queue, &mut seen);
        }
    }
    for c in &prog.closures {
        if let Tail::BlockCall(b, _) = &c.body {
            push(*b, &mut queue, &mut seen);
        }
    }

    let mut order = Vec::new();
    while let Some(b) = queue.pop_front() {
        order.push(b);
        for callee in callees_of(&prog.block(b).body) {
            push(callee, &mut queue, &mut seen);
        }
    }
    for b in prog.block_ids() {
        if !seen.contains(&b) {
            order.push(b);
        }
    }
    order
}

fn callees_of(code: &Code) -> Vec<BlockId> {
    let mut out = Vec::new();
    fn walk(code: &Code, out: &mut Vec<BlockId>) {
        match code {
            Code::Bind(_, t, next) => {
                if let Tail::BlockCall(b, _) = t {
                    out.push(*b);
                }
                walk(next, out);
            }
            Code::Done(Tail::BlockCall(b, _)) => out.push(*b),
            Code::Done(_) => {}
            Code::If(_, jt, je) => {
                out.push(jt.block);
                out.push(je.block);
            }
            Code::Case(_, alts, def) => {
                out.extend(alts.iter().map(|(_, j)| j.block));
                out.extend(def.iter().map(|j| j.block));
            }
        }
    }
    walk(code, &mut out);
    out
}

// ---------------------------------------------------------------------------
// Inlining
// ---------------------------------------------------------------------------

/// A callee whose whole body is a single `Done` can be unfolded at every
/// call site by substituting arguments for parameters. This also skips
/// over goto chains: jumps targeting such a block whose tail is itself a
/// block call are retargeted.
fn inline_pass(prog: &mut Program) -> bool {
    // Collect the trivially inlinable bodies first; the substitution below
    // runs over every definition.
    let mut trivial: HashMap<BlockId, (Vec<Temp>, Tail)> = HashMap::new();
    for id in prog.block_ids() {
        let block = prog.block(id);
        if let Code::Done(t) = &block.body {
            trivial.insert(id, (block.params.clone(), t.clone()));
        }
    }

    // Chase through trivial callees; a revisited block means a goto cycle
    // (a divergent program) and is left untouched.
    let inline_tail = |t: &Tail| -> Option<Tail> {
        let mut cur = t.clone();
        let mut visited: HashSet<BlockId> = HashSet::new();
        let mut unfolded = false;
        while let Tail::BlockCall(b, args) = &cur {
            if !visited.insert(*b) {
                return None;
            }
            let Some((params, body)) = trivial.get(b) else {
                break;
            };
            cur = subst_params(body, params, args);
            unfolded = true;
        }
        unfolded.then_some(cur)
    };

    let retarget_jump = |j: &JumpTo| -> Option<JumpTo> {
        let mut cur = j.clone();
        let mut visited: HashSet<BlockId> = HashSet::new();
        let mut moved = false;
        loop {
            if !visited.insert(cur.block) {
                return None;
            }
            let Some((params, body)) = trivial.get(&cur.block) else {
                break;
            };
            let Tail::BlockCall(callee, cargs) = body else {
                break;
            };
            match subst_params(&Tail::BlockCall(*callee, cargs.clone()), params, &cur.args) {
                Tail::BlockCall(b, args) => {
                    cur = JumpTo::new(b, args);
                    moved = true;
                }
                _ => break,
            }
        }
        moved.then_some(cur)
    };

    let mut changed = false;
    for id in prog.block_ids() {
        let mut body = prog.block(id).body.clone();
        rewrite_code_tails(&mut body, &mut |t| inline_tail(t));
        rewrite_code_jumps(&mut body, &mut |j| retarget_jump(j));
        if body != prog.block(id).body {
            prog.block_mut(id).body = body;
            changed = true;
        }
    }

    for i in 0..prog.tops.len() {
        if let Some(t) = inline_tail(&prog.tops[i].tail) {
            prog.tops[i].tail = t;
            changed = true;
        }
    }
    for i in 0..prog.closures.len() {
        if let Some(t) = inline_tail(&prog.closures[i].body) {
            prog.closures[i].body = t;
            changed = true;
        }
    }
    changed
}

fn subst_params(tail: &Tail, params: &[Temp], args: &[Atom]) -> Tail {
    tail.map_atoms(&mut |a| match a {
        Atom::Temp(t) => match params.iter().position(|p| p == t) {
            Some(i) => args[i],
            None => *a,
        },
        _ => *a,
    })
}

/// Apply `f` to every tail in a code tree (both bind right-hand sides and
/// terminals).
fn rewrite_code_tails(code: &mut Code, f: &mut impl FnMut(&Tail) -> Option<Tail>) {
    match code {
        Code::Bind(_, t, next) => {
            if let Some(t2) = f(t) {
                *t = t2;
            }
            rewrite_code_tails(next, f);
        }
        Code::Done(t) => {
            if let Some(t2) = f(t) {
                *t = t2;
            }
        }
        Code::If(..) | Code::Case(..) => {}
    }
}

fn rewrite_code_jumps(code: &mut Code, f: &mut impl FnMut(&JumpTo) -> Option<JumpTo>) {
    match code {
        Code::Bind(_, _, next) => rewrite_code_jumps(next, f),
        Code::Done(_) => {}
        Code::If(_, jt, je) => {
            if let Some(j) = f(jt) {
                *jt = j;
            }
            if let Some(j) = f(je) {
                *je = j;
            }
        }
        Code::Case(_, alts, def) => {
            for (_, j) in alts.iter_mut() {
                if let Some(j2) = f(j) {
                    *j = j2;
                }
            }
            if let Some(j) = def {
                if let Some(j2) = f(j) {
                    *j = j2;
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Flow: facts, rewriting, liveness pruning
// ---------------------------------------------------------------------------

fn flow_pass(prog: &mut Program) -> Result<bool, String> {
    let mut changed = false;
    for id in block_order(prog) {
        let placeholder = Code::Done(Tail::Return(vec![]));
        let body = std::mem::replace(&mut prog.block_mut(id).body, placeholder);

        let mut facts = Facts::new();
        {
            let block = prog.block(id);
            for (t, ty) in block.params.iter().zip(block.ptypes.iter()) {
                facts.set_type(*t, ty.clone());
            }
        }
        let mut subst: HashMap<Temp, Atom> = HashMap::new();
        let (body, c) = flow_code(prog, &mut facts, &mut subst, body);
        prog.block_mut(id).body = body;
        changed |= c;
    }

    // Top-level tails see no facts, but literal folds still apply when the
    // rewriter needs no extra bindings to express the result.
    let facts = Facts::new();
    for i in 0..prog.tops.len() {
        let tail = prog.tops[i].tail.clone();
        if let Some(Code::Done(t)) = rewrite::rewrite(prog, &tail, &facts) {
            if t != prog.tops[i].tail {
                prog.tops[i].tail = t;
                changed = true;
            }
        }
    }
    Ok(changed)
}

fn flow_code(
    prog: &mut Program,
    facts: &mut Facts,
    subst: &mut HashMap<Temp, Atom>,
    code: Code,
) -> (Code, bool) {
    let apply = |subst: &HashMap<Temp, Atom>, a: &Atom| -> Atom {
        match a {
            Atom::Temp(t) => subst.get(t).copied().unwrap_or(*a),
            _ => *a,
        }
    };
    match code {
        Code::Bind(vs, t, next) => {
            let t = t.map_atoms(&mut |a| apply(subst, a));
            if let Some(frag) = rewrite::rewrite(prog, &t, facts) {
                let spliced = frag.append(|last| Code::Bind(vs, last, next));
                let (out, _) = flow_code(prog, facts, subst, spliced);
                return (out, true);
            }
            // Copy propagation: a bind of a bare tuple renames its sources.
            if let Tail::Return(atoms) = &t {
                if atoms.len() == vs.len() {
                    for (v, a) in vs.iter().zip(atoms.iter()) {
                        subst.insert(*v, *a);
                    }
                    let (out, _) = flow_code(prog, facts, subst, *next);
                    return (out, true);
                }
            }
            if vs.len() == 1 {
                facts.add_fact(prog, vs[0], &t);
            }
            record_bind_types(prog, facts, &vs, &t);
            let (next, inner_changed) = flow_code(prog, facts, subst, *next);
            // Liveness pruning on the way back up: a binding whose results
            // are dead and whose tail has no effect disappears.
            if t.has_no_effect(prog) && !next.uses_any(&vs) {
                return (next, true);
            }
            (Code::Bind(vs, t, Box::new(next)), inner_changed)
        }
        Code::Done(t) => {
            let t = t.map_atoms(&mut |a| apply(subst, a));
            if let Some(frag) = rewrite::rewrite(prog, &t, facts) {
                let (out, _) = flow_code(prog, facts, subst, frag);
                return (out, true);
            }
            (Code::Done(t), false)
        }
        Code::If(a, mut jt, mut je) => {
            let a = apply(subst, &a);
            for arg in jt.args.iter_mut().chain(je.args.iter_mut()) {
                *arg = apply(subst, arg);
            }
            // A decided branch becomes a direct transfer.
            if let Atom::Flag(b) = a {
                let j = if b { jt } else { je };
                return (Code::Done(Tail::BlockCall(j.block, j.args)), true);
            }
            // A negated scrutinee swaps the branches instead.
            if let Some(&[x]) = facts.prim_fact(prog, &a, PrimOp::BNot) {
                return (Code::If(x, je, jt), true);
            }
            (Code::If(a, jt, je), false)
        }
        Code::Case(a, mut alts, mut def) => {
            let a = apply(subst, &a);
            for (_, j) in alts.iter_mut() {
                for arg in j.args.iter_mut() {
                    *arg = apply(subst, arg);
                }
            }
            if let Some(j) = def.as_mut() {
                for arg in j.args.iter_mut() {
                    *arg = apply(subst, arg);
                }
            }
            // A dispatch with nothing to dispatch on is its default.
            if alts.is_empty() {
                if let Some(j) = &def {
                    return (
                        Code::Done(Tail::BlockCall(j.block, j.args.clone())),
                        true,
                    );
                }
            }
            // A scrutinee with a known constructor selects its arm now.
            if let Some(Tail::DataAlloc(cf, _)) = facts.lookup_fact(&a) {
                let cf = *cf;
                let hit = alts
                    .iter()
                    .find(|(c, _)| *c == cf)
                    .map(|(_, j)| j.clone())
                    .or_else(|| def.clone());
                if let Some(j) = hit {
                    return (Code::Done(Tail::BlockCall(j.block, j.args)), true);
                }
            }
            (Code::Case(a, alts, def), false)
        }
    }
}

/// Give the rewriter type visibility for bound temps where the tail makes
/// the result type evident. Calls stay untyped here; that only costs the
/// addressing rules a base they cannot prove.
fn record_bind_types(prog: &Program, facts: &mut Facts, vs: &[Temp], t: &Tail) {
    let tys: Option<Vec<Type>> = match t {
        Tail::Prim(p, args) => match prog.prims.op(*p) {
            Some(PrimOp::Add) => {
                let addr = args
                    .iter()
                    .any(|a| facts.type_of(prog, a) == Some(Type::Addr));
                Some(vec![if addr { Type::Addr } else { Type::Word }])
            }
            Some(PrimOp::Sub) => {
                let lhs = facts.type_of(prog, &args[0]);
                let rhs = facts.type_of(prog, &args[1]);
                let out = match (lhs, rhs) {
                    (Some(Type::Addr), Some(Type::Addr)) => Type::Word,
                    (Some(Type::Addr), _) => Type::Addr,
                    _ => Type::Word,
                };
                Some(vec![out])
            }
            _ => Some(prog.prims.get(*p).block_type.rng.clone()),
        },
        Tail::DataAlloc(cf, _) => Some(vec![Type::Data(prog.cfun(*cf).data)]),
        Tail::ClosAlloc(k, _) => Some(vec![Type::Clos(*k)]),
        Tail::Sel(..) => Some(vec![Type::Word]),
        Tail::Return(_) | Tail::BlockCall(..) | Tail::Enter(..) => None,
    };
    if let Some(tys) = tys {
        if tys.len() == vs.len() {
            for (v, ty) in vs.iter().zip(tys) {
                facts.set_type(*v, ty);
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Duplicate elimination
// ---------------------------------------------------------------------------

/// Find alpha-equivalent block bodies (resp. top-level tails) through
/// their summaries, and forward later definitions to earlier ones.
fn dedup_pass(prog: &mut Program) -> bool {
    let mut changed = false;

    // Blocks: bucket by summary, confirm by alpha equivalence.
    let mut buckets: HashMap<u64, Vec<BlockId>> = HashMap::new();
    let mut redirect: HashMap<BlockId, BlockId> = HashMap::new();
    for id in prog.block_ids() {
        let block = prog.block(id);
        // A forwarder left by an earlier round stays as it is.
        if is_forwarder(prog, id) {
            continue;
        }
        let summary = code_summary(&block.body).wrapping_add(block.params.len() as u64);
        let bucket = buckets.entry(summary).or_default();
        let mut merged = false;
        for &prev in bucket.iter() {
            let pb = prog.block(prev);
            if pb.ptypes == block.ptypes
                && alpha_code(&pb.body, &pb.params, &block.body, &block.params)
            {
                redirect.insert(id, prev);
                merged = true;
                break;
            }
        }
        if !merged {
            bucket.push(id);
        }
    }
    for (&from, &to) in &redirect {
        let params = prog.block(from).params.clone();
        let args = params.iter().map(|t| Atom::Temp(*t)).collect();
        prog.block_mut(from).body = Code::Done(Tail::BlockCall(to, args));
        changed = true;
    }

    // Top-levels: equal tails make the later one a projection of the
    // earlier. Top tails bind no temps, so summary plus plain equality is
    // exactly alpha equivalence here.
    let mut tops_seen: HashMap<u64, Vec<TopId>> = HashMap::new();
    for id in prog.top_ids() {
        let top = prog.top(id);
        if matches!(&top.tail, Tail::Return(atoms)
            if atoms.iter().all(|a| matches!(a, Atom::Top(..))))
        {
            continue;
        }
        let summary = tail_summary(&top.tail);
        let bucket = tops_seen.entry(summary).or_default();
        let mut merged = None;
        for &prev in bucket.iter() {
            let pt = prog.top(prev);
            if pt.types == top.types && crate::mil::alpha_tail(&pt.tail, &[], &top.tail, &[]) {
                merged = Some(prev);
                break;
            }
        }
        match merged {
            Some(prev) => {
                let atoms = (0..prog.top(prev).outity())
                    .map(|i| Atom::Top(prev, i))
                    .collect();
                prog.tops[id.0 as usize].tail = Tail::Return(atoms);
                changed = true;
            }
            None => bucket.push(id),
        }
    }

    changed
}

fn is_forwarder(prog: &Program, id: BlockId) -> bool {
    let block = prog.block(id);
    match &block.body {
        Code::Done(Tail::BlockCall(b, args)) if *b != id => {
            args.len() == block.params.len()
                && args
                    .iter()
                    .zip(block.params.iter())
                    .all(|(a, p)| *a == Atom::Temp(*p))
        }
        _ => false,
    }
}

// ---------------------------------------------------------------------------
// Unused-argument removal
// ---------------------------------------------------------------------------

/// Parameters a block never reads are dropped from its signature and from
/// every caller; likewise for captures a closure never uses.
fn unused_args_pass(prog: &mut Program) -> bool {
    // keep[b] lists the surviving parameter positions of b.
    let mut keep: HashMap<BlockId, Vec<usize>> = HashMap::new();
    for id in prog.block_ids() {
        let block = prog.block(id);
        if block.params.is_empty() {
            continue;
        }
        let used = block.body.used_temps();
        let kept: Vec<usize> = (0..block.params.len())
            .filter(|&i| used.contains(&block.params[i]))
            .collect();
        if kept.len() < block.params.len() {
            keep.insert(id, kept);
        }
    }

    let mut clos_keep: HashMap<usize, Vec<usize>> = HashMap::new();
    for (i, c) in prog.closures.iter().enumerate() {
        if c.stored.is_empty() {
            continue;
        }
        let mut used = HashSet::new();
        c.body.for_each_atom(&mut |a| {
            if let Atom::Temp(t) = a {
                used.insert(*t);
            }
        });
        let kept: Vec<usize> = (0..c.stored.len())
            .filter(|&j| used.contains(&c.stored[j]))
            .collect();
        if kept.len() < c.stored.len() {
            clos_keep.insert(i, kept);
        }
    }

    if keep.is_empty() && clos_keep.is_empty() {
        return false;
    }

    // Rewrite signatures.
    for (&id, kept) in &keep {
        let block = prog.block_mut(id);
        let params: Vec<Temp> = kept.iter().map(|&i| block.params[i]).collect();
        let ptypes: Vec<Type> = kept.iter().map(|&i| block.ptypes[i].clone()).collect();
        block.params = params;
        block.ptypes = ptypes;
    }
    for (&i, kept) in &clos_keep {
        let c = &mut prog.closures[i];
        let stored: Vec<Temp> = kept.iter().map(|&j| c.stored[j]).collect();
        let stypes: Vec<Type> = kept.iter().map(|&j| c.stypes[j].clone()).collect();
        c.stored = stored;
        c.stypes = stypes;
    }

    // Rewrite every call site program-wide.
    let fix_tail = |t: &mut Tail| match t {
        Tail::BlockCall(b, args) => {
            if let Some(kept) = keep.get(b) {
                let new: Vec<Atom> = kept.iter().map(|&i| args[i]).collect();
                *args = new;
            }
        }
        Tail::ClosAlloc(k, args) => {
            if let Some(kept) = clos_keep.get(&(k.0 as usize)) {
                let new: Vec<Atom> = kept.iter().map(|&i| args[i]).collect();
                *args = new;
            }
        }
        _ => {}
    };
    let fix_jump = |j: &mut JumpTo| {
        if let Some(kept) = keep.get(&j.block) {
            let new: Vec<Atom> = kept.iter().map(|&i| j.args[i]).collect();
            j.args = new;
        }
    };
    for block in prog.blocks.iter_mut() {
        fix_code(&mut block.body, &fix_tail, &fix_jump);
    }
    for top in prog.tops.iter_mut() {
        fix_tail(&mut top.tail);
    }
    for c in prog.closures.iter_mut() {
        fix_tail(&mut c.body);
    }
    true
}

fn fix_code(code: &mut Code, ft: &impl Fn(&mut Tail), fj: &impl Fn(&mut JumpTo)) {
    match code {
        Code::Bind(_, t, next) => {
            ft(t);
            fix_code(next, ft, fj);
        }
        Code::Done(t) => ft(t),
        Code::If(_, jt, je) => {
            fj(jt);
            fj(je);
        }
        Code::Case(_, alts, def) => {
            for (_, j) in alts.iter_mut() {
                fj(j);
            }
            if let Some(j) = def {
                fj(j);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mil::BlockDef;

    fn word_block(prog: &mut Program, name: &str, nparams: usize) -> (BlockId, Vec<Temp>) {
        let params = prog.fresh_temps(nparams);
        let id = prog.add_block(BlockDef {
            name: name.into(),
            ptypes: vec![Type::Word; nparams],
            params: params.clone(),
            body: Code::Done(Tail::Return(vec![])),
        });
        (id, params)
    }

    #[test]
    fn test_flow_constant_folding() {
        // x <- add(3, 4); return x    ==>    return 7
        let mut prog = Program::new();
        let add = prog.prims.add();
        let (b, _) = word_block(&mut prog, "main", 0);
        let x = prog.fresh_temp();
        prog.block_mut(b).body = Code::Bind(
            vec![x],
            Tail::Prim(add, vec![Atom::Int(3), Atom::Int(4)]),
            Box::new(Code::Done(Tail::Return(vec![Atom::Temp(x)]))),
        );

        assert!(flow_pass(&mut prog).unwrap());
        assert_eq!(
            prog.block(b).body,
            Code::Done(Tail::Return(vec![Atom::Int(7)]))
        );
    }

    #[test]
    fn test_flow_involution_through_facts() {
        // y <- bnot(x0); z <- bnot(y); return z    ==>    return x0
        let mut prog = Program::new();
        let bnot = prog.prims.bnot();
        let params = prog.fresh_temps(1);
        let x0 = params[0];
        let y = prog.fresh_temp();
        let z = prog.fresh_temp();
        let b = prog.add_block(BlockDef {
            name: "main".into(),
            ptypes: vec![Type::Flag],
            params,
            body: Code::Bind(
                vec![y],
                Tail::Prim(bnot, vec![Atom::Temp(x0)]),
                Box::new(Code::Bind(
                    vec![z],
                    Tail::Prim(bnot, vec![Atom::Temp(y)]),
                    Box::new(Code::Done(Tail::Return(vec![Atom::Temp(z)]))),
                )),
            ),
        });

        assert!(flow_pass(&mut prog).unwrap());
        assert_eq!(
            prog.block(b).body,
            Code::Done(Tail::Return(vec![Atom::Temp(x0)]))
        );
    }

    #[test]
    fn test_flow_redistribution_end_to_end() {
        // a <- add(u, 3); b <- add(v, 4); c <- add(a, b); return c
        // ==> t <- add(u, v); c <- add(t, 7); return c
        let mut prog = Program::new();
        let add = prog.prims.add();
        let params = prog.fresh_temps(2);
        let (u, v) = (params[0], params[1]);
        let (a, b, c) = (prog.fresh_temp(), prog.fresh_temp(), prog.fresh_temp());
        let blk = prog.add_block(BlockDef {
            name: "main".into(),
            ptypes: vec![Type::Word, Type::Word],
            params,
            body: Code::Bind(
                vec![a],
                Tail::Prim(add, vec![Atom::Temp(u), Atom::Int(3)]),
                Box::new(Code::Bind(
                    vec![b],
                    Tail::Prim(add, vec![Atom::Temp(v), Atom::Int(4)]),
                    Box::new(Code::Bind(
                        vec![c],
                        Tail::Prim(add, vec![Atom::Temp(a), Atom::Temp(b)]),
                        Box::new(Code::Done(Tail::Return(vec![Atom::Temp(c)]))),
                    )),
                )),
            ),
        });

        assert!(flow_pass(&mut prog).unwrap());
        // After pruning, the spine is add(u,v) then add(_, 7).
        match &prog.block(blk).body {
            Code::Bind(vs1, t1, rest) => {
                assert_eq!(t1, &Tail::Prim(add, vec![Atom::Temp(u), Atom::Temp(v)]));
                match rest.as_ref() {
                    Code::Bind(vs2, t2, last) => {
                        assert_eq!(
                            t2,
                            &Tail::Prim(add, vec![Atom::Temp(vs1[0]), Atom::Int(7)])
                        );
                        assert_eq!(
                            last.as_ref(),
                            &Code::Done(Tail::Return(vec![Atom::Temp(vs2[0])]))
                        );
                    }
                    other => panic!("unexpected spine: {:?}", other),
                }
            }
            other => panic!("unexpected body: {:?}", other),
        }
    }

    #[test]
    fn test_flow_prunes_dead_bindings() {
        let mut prog = Program::new();
        let mul = prog.prims.mul();
        let params = prog.fresh_temps(1);
        let x = params[0];
        let dead = prog.fresh_temp();
        let b = prog.add_block(BlockDef {
            name: "main".into(),
            ptypes: vec![Type::Word],
            params,
            body: Code::Bind(
                vec![dead],
                Tail::Prim(mul, vec![Atom::Temp(x), Atom::Temp(x)]),
                Box::new(Code::Done(Tail::Return(vec![Atom::Temp(x)]))),
            ),
        });

        assert!(flow_pass(&mut prog).unwrap());
        assert_eq!(
            prog.block(b).body,
            Code::Done(Tail::Return(vec![Atom::Temp(x)]))
        );
    }

    #[test]
    fn test_flow_keeps_effectful_dead_bindings() {
        let mut prog = Program::new();
        let print = prog.prims.print_word();
        let (b, _) = word_block(&mut prog, "main", 0);
        prog.block_mut(b).body = Code::Bind(
            vec![],
            Tail::Prim(print, vec![Atom::Int(1)]),
            Box::new(Code::Done(Tail::Return(vec![Atom::Int(0)]))),
        );
        flow_pass(&mut prog).unwrap();
        assert!(matches!(prog.block(b).body, Code::Bind(..)));
    }

    #[test]
    fn test_flow_folds_known_branches() {
        let mut prog = Program::new();
        let (t1, _) = word_block(&mut prog, "yes", 0);
        let (_t2, _) = word_block(&mut prog, "no", 0);
        let (b, _) = word_block(&mut prog, "main", 0);
        prog.block_mut(b).body = Code::If(
            Atom::Flag(true),
            JumpTo::new(t1, vec![]),
            JumpTo::new(_t2, vec![]),
        );
        assert!(flow_pass(&mut prog).unwrap());
        assert_eq!(
            prog.block(b).body,
            Code::Done(Tail::BlockCall(t1, vec![]))
        );
    }

    #[test]
    fn test_inline_unfolds_trivial_blocks() {
        let mut prog = Program::new();
        let add = prog.prims.add();
        // leaf(x) = add(x, 1)
        let params = prog.fresh_temps(1);
        let x = params[0];
        let leaf = prog.add_block(BlockDef {
            name: "leaf".into(),
            ptypes: vec![Type::Word],
            params,
            body: Code::Done(Tail::Prim(add, vec![Atom::Temp(x), Atom::Int(1)])),
        });
        // main() = leaf(41)
        let (main, _) = word_block(&mut prog, "main", 0);
        prog.block_mut(main).body = Code::Done(Tail::BlockCall(leaf, vec![Atom::Int(41)]));

        assert!(inline_pass(&mut prog));
        assert_eq!(
            prog.block(main).body,
            Code::Done(Tail::Prim(add, vec![Atom::Int(41), Atom::Int(1)]))
        );
    }

    #[test]
    fn test_dedup_merges_alpha_equivalent_blocks() {
        let mut prog = Program::new();
        let add = prog.prims.add();
        let mk = |prog: &mut Program, name: &str| {
            let params = prog.fresh_temps(1);
            let x = params[0];
            let t = prog.fresh_temp();
            prog.add_block(BlockDef {
                name: name.into(),
                ptypes: vec![Type::Word],
                params,
                body: Code::Bind(
                    vec![t],
                    Tail::Prim(add, vec![Atom::Temp(x), Atom::Int(1)]),
                    Box::new(Code::Done(Tail::Return(vec![Atom::Temp(t)]))),
                ),
            })
        };
        let b1 = mk(&mut prog, "first");
        let b2 = mk(&mut prog, "second");

        assert!(dedup_pass(&mut prog));
        // The later block forwards to the earlier one.
        match &prog.block(b2).body {
            Code::Done(Tail::BlockCall(target, args)) => {
                assert_eq!(*target, b1);
                assert_eq!(args.len(), 1);
            }
            other => panic!("expected forwarder, got {:?}", other),
        }
        // Idempotent: the forwarder is not "deduplicated" again.
        assert!(!dedup_pass(&mut prog));
    }

    #[test]
    fn test_dedup_merges_top_levels() {
        let mut prog = Program::new();
        let add = prog.prims.add();
        for name in ["a", "b"] {
            prog.add_top(crate::mil::TopDef {
                name: name.into(),
                lhs: vec![name.into()],
                types: vec![Type::Word],
                tail: Tail::Prim(add, vec![Atom::Int(20), Atom::Int(22)]),
            });
        }
        assert!(dedup_pass(&mut prog));
        let a = prog.find_top("a").unwrap();
        assert_eq!(
            prog.top(prog.find_top("b").unwrap()).tail,
            Tail::Return(vec![Atom::Top(a, 0)])
        );
        assert!(!dedup_pass(&mut prog));
    }

    #[test]
    fn test_unused_args_dropped_at_definition_and_call_sites() {
        let mut prog = Program::new();
        // callee(x, y) = return y   -- x unused
        let params = prog.fresh_temps(2);
        let y = params[1];
        let callee = prog.add_block(BlockDef {
            name: "callee".into(),
            ptypes: vec![Type::Word, Type::Word],
            params,
            body: Code::Done(Tail::Return(vec![Atom::Temp(y)])),
        });
        let (main, _) = word_block(&mut prog, "main", 0);
        prog.block_mut(main).body =
            Code::Done(Tail::BlockCall(callee, vec![Atom::Int(1), Atom::Int(2)]));

        assert!(unused_args_pass(&mut prog));
        assert_eq!(prog.block(callee).params.len(), 1);
        assert_eq!(
            prog.block(main).body,
            Code::Done(Tail::BlockCall(callee, vec![Atom::Int(2)]))
        );
        assert!(!unused_args_pass(&mut prog));
    }

    #[test]
    fn test_optimize_reaches_fixpoint() {
        let mut prog = Program::new();
        let add = prog.prims.add();
        let mul = prog.prims.mul();
        let params = prog.fresh_temps(1);
        let x = params[0];
        let (a, b) = (prog.fresh_temp(), prog.fresh_temp());
        let blk = prog.add_block(BlockDef {
            name: "main".into(),
            ptypes: vec![Type::Word],
            params,
            body: Code::Bind(
                vec![a],
                Tail::Prim(mul, vec![Atom::Temp(x), Atom::Int(8)]),
                Box::new(Code::Bind(
                    vec![b],
                    Tail::Prim(add, vec![Atom::Temp(a), Atom::Int(0)]),
                    Box::new(Code::Done(Tail::Return(vec![Atom::Temp(b)]))),
                )),
            ),
        });

        optimize(&mut prog, &CompilerConfig::default()).unwrap();
        // mul by 8 becomes a shift; the add-zero and its binding vanish.
        let shl = prog.prims.shl();
        assert_eq!(
            prog.block(blk).body,
            Code::Bind(
                vec![a],
                Tail::Prim(shl, vec![Atom::Temp(x), Atom::Int(3)]),
                Box::new(Code::Done(Tail::Return(vec![Atom::Temp(a)])))
            )
        );
    }
}
