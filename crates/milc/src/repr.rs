//! Representation lowering
//!
//! Replaces high-level data with machine words. Bitdata values collapse to
//! single words: constructor allocations become calls to generated blocks
//! that OR tag bits with shifted fields, selectors become generated
//! mask-and-shift blocks, and constructor dispatch becomes a chain of
//! generated mask tests that short-circuits on the first match. Structs
//! (single-constructor records) flatten into word tuples carried in
//! registers, with signatures rewritten in parallel.
//!
//! Closures are left to the optimizer: a known `enter` unfolds during
//! flow, and the emitter rejects any that remain.

use crate::check::{tail_types, BlockTypes};
use crate::mil::{
    Atom, BitdataLayout, BlockDef, BlockId, CfunId, Code, DataDef, DataId, JumpTo, Program, Tail,
    Temp, TopId,
};
use crate::types::Type;
use std::collections::HashMap;

/// Run the full lowering: bitdata, then structs, then signature retyping.
pub fn lower_program(prog: &mut Program) -> Result<(), String> {
    lower_bitdata(prog)?;
    flatten_structs(prog)?;
    retype_bitdata(prog);
    Ok(())
}

fn is_bitdata(prog: &Program, d: DataId) -> bool {
    matches!(prog.data(d), DataDef::Bitdata { .. })
}

fn bitdata_layout(prog: &Program, cf: CfunId) -> Option<BitdataLayout> {
    let cfun = prog.cfun(cf);
    match prog.data(cfun.data) {
        DataDef::Bitdata { layouts, .. } => Some(layouts[cfun.tag].clone()),
        DataDef::Struct { .. } => None,
    }
}

/// Words-per-value of a type once lowering is done.
fn repr_len(prog: &Program, ty: &Type) -> usize {
    match ty {
        Type::Data(d) => match prog.data(*d) {
            DataDef::Bitdata { .. } => 1,
            DataDef::Struct { fields, .. } => fields.iter().map(|f| repr_len(prog, f)).sum(),
        },
        _ => 1,
    }
}

/// The flattened machine types of a type.
fn repr_vec(prog: &Program, ty: &Type) -> Vec<Type> {
    match ty {
        Type::Data(d) => match prog.data(*d) {
            DataDef::Bitdata { .. } => vec![Type::Word],
            DataDef::Struct { fields, .. } => {
                fields.iter().flat_map(|f| repr_vec(prog, f)).collect()
            }
        },
        other => vec![other.clone()],
    }
}

/// Per-bind result types for one block body, mirroring the checker's walk.
fn body_type_env(prog: &Program, bt: &BlockTypes, block: BlockId) -> HashMap<Temp, Type> {
    let def = prog.block(block);
    let mut env: HashMap<Temp, Type> = def
        .params
        .iter()
        .copied()
        .zip(def.ptypes.iter().cloned())
        .collect();
    let mut code = &def.body;
    loop {
        match code {
            Code::Bind(vs, t, next) => {
                if let Ok(tys) = tail_types(prog, &env, t, bt) {
                    for (v, ty) in vs.iter().zip(tys) {
                        env.insert(*v, ty);
                    }
                }
                code = next;
            }
            _ => return env,
        }
    }
}

// ---------------------------------------------------------------------------
// Bitdata
// ---------------------------------------------------------------------------

struct BitdataLowering {
    mk_blocks: HashMap<CfunId, BlockId>,
    sel_blocks: HashMap<(CfunId, usize), BlockId>,
    fail_block: Option<BlockId>,
}

fn lower_bitdata(prog: &mut Program) -> Result<(), String> {
    let bt = BlockTypes::resolve(prog)?;
    let mut ctx = BitdataLowering {
        mk_blocks: HashMap::new(),
        sel_blocks: HashMap::new(),
        fail_block: None,
    };

    let ids: Vec<BlockId> = prog.block_ids().collect();
    for id in ids {
        let env = body_type_env(prog, &bt, id);
        let body = prog.block(id).body.clone();
        let body = lower_bitdata_code(prog, &mut ctx, &env, body)?;
        prog.block_mut(id).body = body;
    }
    for i in 0..prog.tops.len() {
        let tail = prog.tops[i].tail.clone();
        if let Some(t) = lower_bitdata_tail(prog, &mut ctx, &tail) {
            prog.tops[i].tail = t;
        }
    }
    for i in 0..prog.closures.len() {
        let tail = prog.closures[i].body.clone();
        if let Some(t) = lower_bitdata_tail(prog, &mut ctx, &tail) {
            prog.closures[i].body = t;
        }
    }
    Ok(())
}

fn lower_bitdata_tail(
    prog: &mut Program,
    ctx: &mut BitdataLowering,
    tail: &Tail,
) -> Option<Tail> {
    match tail {
        Tail::DataAlloc(cf, args) => {
            bitdata_layout(prog, *cf)?;
            let mk = mk_block(prog, ctx, *cf);
            Some(Tail::BlockCall(mk, args.clone()))
        }
        Tail::Sel(cf, n, a) => {
            bitdata_layout(prog, *cf)?;
            let sel = sel_block(prog, ctx, *cf, *n);
            Some(Tail::BlockCall(sel, vec![*a]))
        }
        _ => None,
    }
}

fn lower_bitdata_code(
    prog: &mut Program,
    ctx: &mut BitdataLowering,
    env: &HashMap<Temp, Type>,
    code: Code,
) -> Result<Code, String> {
    match code {
        Code::Bind(vs, t, next) => {
            let t = lower_bitdata_tail(prog, ctx, &t).unwrap_or(t);
            let next = lower_bitdata_code(prog, ctx, env, *next)?;
            Ok(Code::Bind(vs, t, Box::new(next)))
        }
        Code::Done(t) => {
            let t = lower_bitdata_tail(prog, ctx, &t).unwrap_or(t);
            Ok(Code::Done(t))
        }
        Code::If(a, jt, je) => Ok(Code::If(a, jt, je)),
        Code::Case(a, alts, def) => {
            let on_bitdata = alts
                .first()
                .map(|(cf, _)| is_bitdata(prog, prog.cfun(*cf).data))
                .unwrap_or(false);
            if !on_bitdata {
                return Ok(Code::Case(a, alts, def));
            }
            lower_masktest(prog, ctx, env, a, alts, def)
        }
    }
}

/// Turn a bitdata `case` into a chain of generated test blocks, each
/// ANDing the scrutinee with one constructor's tag mask and comparing
/// against its tag bits, short-circuiting to the arm on a match.
fn lower_masktest(
    prog: &mut Program,
    ctx: &mut BitdataLowering,
    env: &HashMap<Temp, Type>,
    scrutinee: Atom,
    alts: Vec<(CfunId, JumpTo)>,
    def: Option<JumpTo>,
) -> Result<Code, String> {
    // Every temp the arms need travels through the whole chain.
    let mut extras: Vec<Temp> = Vec::new();
    let mut note = |args: &[Atom], extras: &mut Vec<Temp>| {
        for a in args {
            if let Atom::Temp(t) = a {
                if !extras.contains(t) {
                    extras.push(*t);
                }
            }
        }
    };
    for (_, j) in &alts {
        note(&j.args, &mut extras);
    }
    if let Some(j) = &def {
        note(&j.args, &mut extras);
    }
    let extra_types: Vec<Type> = extras
        .iter()
        .map(|t| env.get(t).cloned().unwrap_or(Type::Word))
        .collect();

    // Build the chain back to front.
    let mut next: Option<BlockId> = None;
    for (cf, jump) in alts.iter().rev() {
        let layout = bitdata_layout(prog, *cf)
            .ok_or_else(|| "mixed bitdata and struct alternatives in case".to_string())?;
        let vp = prog.fresh_temp();
        let eps = prog.fresh_temps(extras.len());
        let remap: HashMap<Temp, Atom> = extras
            .iter()
            .copied()
            .zip(eps.iter().map(|t| Atom::Temp(*t)))
            .chain(scrutinee.as_temp().map(|t| (t, Atom::Temp(vp))))
            .collect();
        let rejump = |j: &JumpTo, remap: &HashMap<Temp, Atom>| JumpTo {
            block: j.block,
            args: j
                .args
                .iter()
                .map(|a| match a {
                    Atom::Temp(t) => remap.get(t).copied().unwrap_or(*a),
                    _ => *a,
                })
                .collect(),
        };
        let hit = rejump(jump, &remap);
        let miss = match next {
            Some(b) => {
                let mut args = vec![Atom::Temp(vp)];
                args.extend(eps.iter().map(|t| Atom::Temp(*t)));
                JumpTo::new(b, args)
            }
            None => match &def {
                Some(j) => rejump(j, &remap),
                // No default and no remaining alternatives: trap.
                None => JumpTo::new(fail_block(prog, ctx), Vec::new()),
            },
        };
        let masked = prog.fresh_temp();
        let flag = prog.fresh_temp();
        let and = prog.prims.and();
        let eq = prog.prims.prim_eq();
        let body = Code::Bind(
            vec![masked],
            Tail::Prim(and, vec![Atom::Temp(vp), Atom::Int(layout.tag_mask as i64)]),
            Box::new(Code::Bind(
                vec![flag],
                Tail::Prim(eq, vec![Atom::Temp(masked), Atom::Int(layout.tag_bits as i64)]),
                Box::new(Code::If(Atom::Temp(flag), hit, miss)),
            )),
        );
        let mut params = vec![vp];
        params.extend(eps);
        let mut ptypes = vec![Type::Word];
        ptypes.extend(extra_types.iter().cloned());
        let name = format!(
            "masktest_{}_{}",
            prog.cfun(*cf).name,
            prog.blocks.len()
        );
        let b = prog.add_block(BlockDef {
            name,
            params,
            ptypes,
            body,
        });
        next = Some(b);
    }

    let entry = next.ok_or_else(|| "case with no alternatives".to_string())?;
    let mut args = vec![scrutinee];
    args.extend(extras.iter().map(|t| Atom::Temp(*t)));
    Ok(Code::Done(Tail::BlockCall(entry, args)))
}

/// Constructor block: OR the tag bits with each masked field shifted to
/// its offset.
fn mk_block(prog: &mut Program, ctx: &mut BitdataLowering, cf: CfunId) -> BlockId {
    if let Some(b) = ctx.mk_blocks.get(&cf) {
        return *b;
    }
    let layout = bitdata_layout(prog, cf).expect("mk_block on non-bitdata");
    let nfields = layout.fields.len();
    let params = prog.fresh_temps(nfields);
    let and = prog.prims.and();
    let shl = prog.prims.shl();
    let or = prog.prims.or();

    let mut acc = Atom::Int(layout.tag_bits as i64);
    let mut binds: Vec<(Temp, Tail)> = Vec::new();
    for (i, field) in layout.fields.iter().enumerate() {
        let fmask = if field.width >= 64 {
            u64::MAX
        } else {
            (1u64 << field.width) - 1
        };
        let masked = prog.fresh_temp();
        binds.push((
            masked,
            Tail::Prim(and, vec![Atom::Temp(params[i]), Atom::Int(fmask as i64)]),
        ));
        let positioned = if field.offset > 0 {
            let shifted = prog.fresh_temp();
            binds.push((
                shifted,
                Tail::Prim(shl, vec![Atom::Temp(masked), Atom::Int(field.offset as i64)]),
            ));
            Atom::Temp(shifted)
        } else {
            Atom::Temp(masked)
        };
        let merged = prog.fresh_temp();
        binds.push((merged, Tail::Prim(or, vec![acc, positioned])));
        acc = Atom::Temp(merged);
    }

    let mut body = Code::Done(Tail::Return(vec![acc]));
    for (v, t) in binds.into_iter().rev() {
        body = Code::Bind(vec![v], t, Box::new(body));
    }
    let name = format!("mk_{}", prog.cfun(cf).name);
    let b = prog.add_block(BlockDef {
        name,
        params,
        ptypes: vec![Type::Word; nfields],
        body,
    });
    ctx.mk_blocks.insert(cf, b);
    b
}

/// Selector block: shift the field down to bit zero and mask its width.
fn sel_block(prog: &mut Program, ctx: &mut BitdataLowering, cf: CfunId, n: usize) -> BlockId {
    if let Some(b) = ctx.sel_blocks.get(&(cf, n)) {
        return *b;
    }
    let layout = bitdata_layout(prog, cf).expect("sel_block on non-bitdata");
    let field = layout.fields[n].clone();
    let fmask = if field.width >= 64 {
        u64::MAX
    } else {
        (1u64 << field.width) - 1
    };
    let vp = prog.fresh_temp();
    let lshr = prog.prims.lshr();
    let and = prog.prims.and();
    let shifted = prog.fresh_temp();
    let out = prog.fresh_temp();
    let body = Code::Bind(
        vec![shifted],
        Tail::Prim(lshr, vec![Atom::Temp(vp), Atom::Int(field.offset as i64)]),
        Box::new(Code::Bind(
            vec![out],
            Tail::Prim(and, vec![Atom::Temp(shifted), Atom::Int(fmask as i64)]),
            Box::new(Code::Done(Tail::Return(vec![Atom::Temp(out)]))),
        )),
    );
    let name = format!("sel_{}_{}", prog.cfun(cf).name, n);
    let b = prog.add_block(BlockDef {
        name,
        params: vec![vp],
        ptypes: vec![Type::Word],
        body,
    });
    ctx.sel_blocks.insert((cf, n), b);
    b
}

/// Shared trap target for defaultless cases that fall through.
fn fail_block(prog: &mut Program, ctx: &mut BitdataLowering) -> BlockId {
    if let Some(b) = ctx.fail_block {
        return b;
    }
    let halt = prog.prims.halt();
    let b = prog.add_block(BlockDef {
        name: "case_fail".to_string(),
        params: Vec::new(),
        ptypes: Vec::new(),
        body: Code::Done(Tail::Prim(halt, Vec::new())),
    });
    ctx.fail_block = Some(b);
    b
}

/// After lowering, bitdata types are plain words everywhere.
fn retype_bitdata(prog: &mut Program) {
    let bitdatas: Vec<DataId> = (0..prog.datas.len() as u32)
        .map(DataId)
        .filter(|d| is_bitdata(prog, *d))
        .collect();
    let fix = |ty: &mut Type| {
        if let Type::Data(d) = ty {
            if bitdatas.contains(d) {
                *ty = Type::Word;
            }
        }
    };
    for b in prog.blocks.iter_mut() {
        b.ptypes.iter_mut().for_each(fix);
    }
    for t in prog.tops.iter_mut() {
        t.types.iter_mut().for_each(fix);
    }
    for c in prog.closures.iter_mut() {
        c.stypes.iter_mut().for_each(fix);
        c.ptypes.iter_mut().for_each(fix);
        c.rtypes.iter_mut().for_each(fix);
    }
    for d in prog.datas.iter_mut() {
        if let DataDef::Struct { fields, .. } = d {
            for f in fields.iter_mut() {
                if let Type::Data(inner) = f {
                    if bitdatas.contains(inner) {
                        *f = Type::Word;
                    }
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Structs
// ---------------------------------------------------------------------------

fn flatten_structs(prog: &mut Program) -> Result<(), String> {
    let needs_work = prog.datas.iter().any(|d| matches!(d, DataDef::Struct { .. }));
    if !needs_work {
        return Ok(());
    }
    let bt = BlockTypes::resolve(prog)?;

    // Remap top components first so atom expansion can consult it.
    let mut top_remap: HashMap<(TopId, usize), (usize, usize)> = HashMap::new();
    for (i, top) in prog.tops.iter().enumerate() {
        let mut at = 0usize;
        for (n, ty) in top.types.iter().enumerate() {
            let len = repr_len(prog, ty);
            top_remap.insert((TopId(i as u32), n), (at, len));
            at += len;
        }
    }

    // Type environments must come from the unflattened program: once a
    // callee's signature widens, re-deriving them would fail.
    let ids: Vec<BlockId> = prog.block_ids().collect();
    let envs: HashMap<BlockId, HashMap<Temp, Type>> = ids
        .iter()
        .map(|id| (*id, body_type_env(prog, &bt, *id)))
        .collect();
    for id in ids {
        flatten_block(prog, &envs[&id], &top_remap, id)?;
    }

    // Top-level signatures and tails.
    for i in 0..prog.tops.len() {
        let top = &prog.tops[i];
        let mut lhs = Vec::new();
        let mut types = Vec::new();
        for (name, ty) in top.lhs.iter().zip(top.types.iter()) {
            let parts = repr_vec(prog, ty);
            if parts.len() == 1 {
                lhs.push(name.clone());
            } else {
                for k in 0..parts.len() {
                    lhs.push(format!("{}_{}", name, k));
                }
            }
            types.extend(parts);
        }
        let tail = expand_tail(prog, &top.tail, &HashMap::new(), &top_remap)?;
        let top = &mut prog.tops[i];
        top.lhs = lhs;
        top.types = types;
        top.tail = tail;
    }

    // Closures: captures and parameters flatten like block parameters.
    for i in 0..prog.closures.len() {
        let stored_in = prog.closures[i].stored.clone();
        let stypes_in = prog.closures[i].stypes.clone();
        let params_in = prog.closures[i].params.clone();
        let ptypes_in = prog.closures[i].ptypes.clone();
        let rtypes_in = prog.closures[i].rtypes.clone();
        let body_in = prog.closures[i].body.clone();

        let mut expansion = Expansion::new();
        let (stored, stypes) = flatten_params(prog, &stored_in, &stypes_in, &mut expansion);
        let (params, ptypes) = flatten_params(prog, &params_in, &ptypes_in, &mut expansion);
        let rtypes = rtypes_in
            .iter()
            .flat_map(|t| repr_vec(prog, t))
            .collect::<Vec<_>>();
        let body = expand_tail(prog, &body_in, &expansion, &top_remap)?;

        let c = &mut prog.closures[i];
        c.stored = stored;
        c.stypes = stypes;
        c.params = params;
        c.ptypes = ptypes;
        c.rtypes = rtypes;
        c.body = body;
    }
    Ok(())
}

type Expansion = HashMap<Temp, Vec<Atom>>;

/// Widen a parameter list: struct-typed entries become runs of fresh
/// temps, recorded in the expansion map.
fn flatten_params(
    prog: &mut Program,
    params: &[Temp],
    ptypes: &[Type],
    expansion: &mut Expansion,
) -> (Vec<Temp>, Vec<Type>) {
    let mut out_params = Vec::new();
    let mut out_types = Vec::new();
    for (t, ty) in params.iter().zip(ptypes.iter()) {
        let parts = repr_vec(prog, ty);
        if parts.len() == 1 {
            out_params.push(*t);
            out_types.push(parts.into_iter().next().unwrap());
        } else {
            let fresh = prog.fresh_temps(parts.len());
            expansion.insert(*t, fresh.iter().map(|f| Atom::Temp(*f)).collect());
            out_params.extend(fresh);
            out_types.extend(parts);
        }
    }
    (out_params, out_types)
}

fn flatten_block(
    prog: &mut Program,
    env: &HashMap<Temp, Type>,
    top_remap: &HashMap<(TopId, usize), (usize, usize)>,
    id: BlockId,
) -> Result<(), String> {
    let old_params = prog.block(id).params.clone();
    let old_ptypes = prog.block(id).ptypes.clone();
    let body = prog.block(id).body.clone();

    let mut expansion = Expansion::new();
    let (params, ptypes) = flatten_params(prog, &old_params, &old_ptypes, &mut expansion);
    let body = flatten_code(prog, env, top_remap, &mut expansion, body)?;

    let def = prog.block_mut(id);
    def.params = params;
    def.ptypes = ptypes;
    def.body = body;
    Ok(())
}

fn expand_atom(
    a: &Atom,
    expansion: &Expansion,
    top_remap: &HashMap<(TopId, usize), (usize, usize)>,
) -> Vec<Atom> {
    match a {
        Atom::Temp(t) => expansion.get(t).cloned().unwrap_or_else(|| vec![*a]),
        Atom::Top(t, n) => match top_remap.get(&(*t, *n)) {
            Some((start, len)) => (*start..start + len).map(|i| Atom::Top(*t, i)).collect(),
            None => vec![*a],
        },
        _ => vec![*a],
    }
}

fn expand_atoms(
    atoms: &[Atom],
    expansion: &Expansion,
    top_remap: &HashMap<(TopId, usize), (usize, usize)>,
) -> Vec<Atom> {
    atoms
        .iter()
        .flat_map(|a| expand_atom(a, expansion, top_remap))
        .collect()
}

fn expand_tail(
    prog: &Program,
    t: &Tail,
    expansion: &Expansion,
    top_remap: &HashMap<(TopId, usize), (usize, usize)>,
) -> Result<Tail, String> {
    Ok(match t {
        Tail::Return(atoms) => Tail::Return(expand_atoms(atoms, expansion, top_remap)),
        Tail::Prim(p, atoms) => Tail::Prim(*p, expand_atoms(atoms, expansion, top_remap)),
        Tail::BlockCall(b, atoms) => {
            Tail::BlockCall(*b, expand_atoms(atoms, expansion, top_remap))
        }
        Tail::ClosAlloc(k, atoms) => {
            Tail::ClosAlloc(*k, expand_atoms(atoms, expansion, top_remap))
        }
        Tail::Enter(f, atoms) => {
            let fs = expand_atom(f, expansion, top_remap);
            if fs.len() != 1 {
                return Err("enter on a flattened struct value".to_string());
            }
            Tail::Enter(fs[0], expand_atoms(atoms, expansion, top_remap))
        }
        Tail::DataAlloc(cf, atoms) if struct_cfun(prog, *cf) => {
            // A struct allocation in tail position returns its word tuple.
            Tail::Return(expand_atoms(atoms, expansion, top_remap))
        }
        Tail::DataAlloc(cf, atoms) => {
            Tail::DataAlloc(*cf, expand_atoms(atoms, expansion, top_remap))
        }
        Tail::Sel(cf, n, a) if struct_cfun(prog, *cf) => {
            let av = expand_atom(a, expansion, top_remap);
            let (start, len) = struct_field_slice(prog, *cf, *n);
            Tail::Return(av[start..start + len].to_vec())
        }
        Tail::Sel(cf, n, a) => {
            let av = expand_atom(a, expansion, top_remap);
            Tail::Sel(*cf, *n, av[0])
        }
    })
}

fn struct_cfun(prog: &Program, cf: CfunId) -> bool {
    matches!(prog.data(prog.cfun(cf).data), DataDef::Struct { .. })
}

fn struct_field_slice(prog: &Program, cf: CfunId, n: usize) -> (usize, usize) {
    match prog.data(prog.cfun(cf).data) {
        DataDef::Struct { fields, .. } => {
            let start = fields[..n].iter().map(|f| repr_len(prog, f)).sum();
            (start, repr_len(prog, &fields[n]))
        }
        DataDef::Bitdata { .. } => (0, 1),
    }
}

fn flatten_code(
    prog: &mut Program,
    env: &HashMap<Temp, Type>,
    top_remap: &HashMap<(TopId, usize), (usize, usize)>,
    expansion: &mut Expansion,
    code: Code,
) -> Result<Code, String> {
    match code {
        Code::Bind(vs, t, next) => {
            // Struct allocations and selections dissolve into pure atom
            // plumbing: record the expansion and drop the bind.
            match &t {
                Tail::DataAlloc(cf, args) if struct_cfun(prog, *cf) && vs.len() == 1 => {
                    let atoms = expand_atoms(args, expansion, top_remap);
                    expansion.insert(vs[0], atoms);
                    return flatten_code(prog, env, top_remap, expansion, *next);
                }
                Tail::Sel(cf, n, a) if struct_cfun(prog, *cf) && vs.len() == 1 => {
                    let av = expand_atom(a, expansion, top_remap);
                    let (start, len) = struct_field_slice(prog, *cf, *n);
                    expansion.insert(vs[0], av[start..start + len].to_vec());
                    return flatten_code(prog, env, top_remap, expansion, *next);
                }
                _ => {}
            }
            let t = expand_tail(prog, &t, expansion, top_remap)?;
            // Results of struct type widen the binder list.
            let mut new_vs = Vec::new();
            for v in &vs {
                let len = env.get(v).map_or(1, |ty| repr_len(prog, ty));
                if len == 1 {
                    new_vs.push(*v);
                } else {
                    let fresh = prog.fresh_temps(len);
                    expansion.insert(*v, fresh.iter().map(|f| Atom::Temp(*f)).collect());
                    new_vs.extend(fresh);
                }
            }
            let next = flatten_code(prog, env, top_remap, expansion, *next)?;
            Ok(Code::Bind(new_vs, t, Box::new(next)))
        }
        Code::Done(t) => Ok(Code::Done(expand_tail(prog, &t, expansion, top_remap)?)),
        Code::If(a, jt, je) => {
            let a = expand_atom(&a, expansion, top_remap)[0];
            Ok(Code::If(
                a,
                expand_jump(&jt, expansion, top_remap),
                expand_jump(&je, expansion, top_remap),
            ))
        }
        Code::Case(a, alts, def) => {
            // A single-constructor struct dispatch is no dispatch at all.
            if alts.len() == 1 && struct_cfun(prog, alts[0].0) {
                let j = expand_jump(&alts[0].1, expansion, top_remap);
                return Ok(Code::Done(Tail::BlockCall(j.block, j.args)));
            }
            let a = expand_atom(&a, expansion, top_remap)[0];
            let alts = alts
                .iter()
                .map(|(cf, j)| (*cf, expand_jump(j, expansion, top_remap)))
                .collect();
            let def = def.map(|j| expand_jump(&j, expansion, top_remap));
            Ok(Code::Case(a, alts, def))
        }
    }
}

fn expand_jump(
    j: &JumpTo,
    expansion: &Expansion,
    top_remap: &HashMap<(TopId, usize), (usize, usize)>,
) -> JumpTo {
    JumpTo {
        block: j.block,
        args: expand_atoms(&j.args, expansion, top_remap),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interp::{run_program, Value};
    use crate::parser::Parser;

    fn lower(src: &str) -> Program {
        let mut prog = Parser::new(src).parse().unwrap();
        crate::check::check_program(&prog).unwrap();
        lower_program(&mut prog).unwrap();
        prog
    }

    #[test]
    fn test_bitdata_constructor_value() {
        // Tag 0b10 in the top two bits, payload 0x2A below: word 0xAA.
        let prog = lower(
            "bitdata Status / 8 {\n\
             \x20 Ok [ 0b10 : 2 | payload : 6 ]\n\
             }\n\
             block main() {\n\
             \x20 v <- new Ok(0x2A)\n\
             \x20 _ <- printWord(v)\n\
             \x20 return v\n\
             }\n",
        );
        let out = run_program(&prog).unwrap();
        assert_eq!(out.trace, vec![0xAA]);
        assert_eq!(out.result, vec![Value::Word(0xAA)]);
    }

    #[test]
    fn test_masktest_accepts_and_rejects() {
        // Dispatch on the lowered word: 0xAA matches Ok, 0x6A does not
        // (its top bits are 0b01).
        let src_for = |w: i64| {
            format!(
                "bitdata Status / 8 {{\n\
                 \x20 Ok  [ 0b10 : 2 | payload : 6 ]\n\
                 \x20 Bad [ 0b01 : 2 | other : 6 ]\n\
                 }}\n\
                 block main() {{\n\
                 \x20 check({})\n\
                 }}\n\
                 block check(v: Status) {{\n\
                 \x20 case v of {{\n\
                 \x20   Ok -> yes()\n\
                 \x20   _ -> no()\n\
                 \x20 }}\n\
                 }}\n\
                 block yes() {{ return 1 }}\n\
                 block no() {{ return 0 }}\n",
                w
            )
        };
        // The scrutinee arrives as a raw word once lowering has run.
        let prog = lower(&src_for(0xAA));
        assert_eq!(run_program(&prog).unwrap().result, vec![Value::Word(1)]);
        let prog = lower(&src_for(0x6A));
        assert_eq!(run_program(&prog).unwrap().result, vec![Value::Word(0)]);
    }

    #[test]
    fn test_bitdata_selector() {
        let prog = lower(
            "bitdata Status / 8 {\n\
             \x20 Ok [ 0b10 : 2 | payload : 6 ]\n\
             }\n\
             block main() {\n\
             \x20 v <- new Ok(0x2A)\n\
             \x20 p <- sel Ok.0(v)\n\
             \x20 return p\n\
             }\n",
        );
        assert_eq!(run_program(&prog).unwrap().result, vec![Value::Word(0x2A)]);
    }

    #[test]
    fn test_no_high_level_data_survives() {
        let prog = lower(
            "bitdata Status / 8 {\n\
             \x20 Ok [ 0b10 : 2 | payload : 6 ]\n\
             }\n\
             struct Pair { word, word }\n\
             block main() {\n\
             \x20 v <- new Ok(1)\n\
             \x20 p <- new Pair(v, 2)\n\
             \x20 a <- sel Pair.0(p)\n\
             \x20 b <- sel Ok.0(a)\n\
             \x20 return b\n\
             }\n",
        );
        for block in &prog.blocks {
            let mut bad = false;
            let mut walk = |t: &Tail| {
                if matches!(t, Tail::DataAlloc(..) | Tail::Sel(..)) {
                    bad = true;
                }
            };
            fn each_tail(c: &Code, f: &mut impl FnMut(&Tail)) {
                match c {
                    Code::Bind(_, t, next) => {
                        f(t);
                        each_tail(next, f);
                    }
                    Code::Done(t) => f(t),
                    _ => {}
                }
            }
            each_tail(&block.body, &mut walk);
            assert!(!bad, "high-level data survived in {}", block.name);
        }
        assert_eq!(run_program(&prog).unwrap().result, vec![Value::Word(1)]);
    }

    #[test]
    fn test_struct_flattening_through_calls() {
        let prog = lower(
            "struct Pair { word, word }\n\
             block main() {\n\
             \x20 p <- new Pair(3, 4)\n\
             \x20 use(p)\n\
             }\n\
             block use(p: Pair) {\n\
             \x20 a <- sel Pair.0(p)\n\
             \x20 b <- sel Pair.1(p)\n\
             \x20 s <- add(a, b)\n\
             \x20 return s\n\
             }\n",
        );
        // The callee's signature widened to two words.
        let use_b = prog.find_block("use").unwrap();
        assert_eq!(prog.block(use_b).params.len(), 2);
        assert_eq!(run_program(&prog).unwrap().result, vec![Value::Word(7)]);
    }

    #[test]
    fn test_lowering_preserves_observable_trace() {
        let src = "bitdata Status / 8 {\n\
                   \x20 Ok  [ 0b10 : 2 | payload : 6 ]\n\
                   \x20 Bad [ 0b01 : 2 | other : 6 ]\n\
                   }\n\
                   block main() {\n\
                   \x20 v <- new Ok(9)\n\
                   \x20 p <- sel Ok.0(v)\n\
                   \x20 _ <- printWord(p)\n\
                   \x20 case v of {\n\
                   \x20   Ok -> yes()\n\
                   \x20   Bad -> no()\n\
                   \x20 }\n\
                   }\n\
                   block yes() { _ <- printWord(1) return }\n\
                   block no() { _ <- printWord(0) return }\n";
        let before = {
            let prog = Parser::new(src).parse().unwrap();
            run_program(&prog).unwrap().trace
        };
        let after = {
            let mut prog = Parser::new(src).parse().unwrap();
            lower_program(&mut prog).unwrap();
            run_program(&prog).unwrap().trace
        };
        assert_eq!(before, after);
    }
}
