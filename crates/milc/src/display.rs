//! MIL pretty-printing
//!
//! The inverse of `parser.rs` and the format used by `--dump` and the
//! trace-level pass dumps. Temporaries print with canonical `t<N>` names;
//! re-parsing a dump yields a program equal to the original up to temp
//! renaming.

use crate::mil::{Atom, Code, DataDef, JumpTo, Program, Tail};
use crate::types::Type;
use std::fmt::Write as _;

pub fn print_program(prog: &Program) -> String {
    let mut out = String::new();
    for area in &prog.areas {
        let _ = writeln!(out, "area {}[{}]", area.name, area.size);
    }
    if !prog.areas.is_empty() {
        out.push('\n');
    }

    for data in &prog.datas {
        match data {
            DataDef::Bitdata {
                name,
                width,
                layouts,
                cfuns,
            } => {
                let _ = writeln!(out, "bitdata {} / {} {{", name, width);
                for (layout, cf) in layouts.iter().zip(cfuns.iter()) {
                    let _ = write!(out, "  {} [ ", prog.cfun(*cf).name);
                    let segs = layout_segments(layout, *width);
                    let _ = write!(out, "{}", segs.join(" | "));
                    let _ = writeln!(out, " ]");
                }
                let _ = writeln!(out, "}}\n");
            }
            DataDef::Struct { name, fields, .. } => {
                let fs: Vec<String> = fields.iter().map(|t| type_name(prog, t)).collect();
                let _ = writeln!(out, "struct {} {{ {} }}\n", name, fs.join(", "));
            }
        }
    }

    for top in &prog.tops {
        if top.lhs.len() == 1 {
            let _ = writeln!(out, "top {} = {}", top.lhs[0], tail_str(prog, &top.tail));
        } else {
            let _ = writeln!(
                out,
                "top ({}) = {}",
                top.lhs.join(", "),
                tail_str(prog, &top.tail)
            );
        }
    }
    if !prog.tops.is_empty() {
        out.push('\n');
    }

    for c in &prog.closures {
        let stored: Vec<String> = c
            .stored
            .iter()
            .zip(c.stypes.iter())
            .map(|(t, ty)| format!("{}: {}", t, type_name(prog, ty)))
            .collect();
        let params: Vec<String> = c
            .params
            .iter()
            .zip(c.ptypes.iter())
            .map(|(t, ty)| format!("{}: {}", t, type_name(prog, ty)))
            .collect();
        let _ = writeln!(
            out,
            "closure {}({} | {}) = {}",
            c.name,
            stored.join(", "),
            params.join(", "),
            tail_str(prog, &c.body)
        );
    }
    if !prog.closures.is_empty() {
        out.push('\n');
    }

    for block in &prog.blocks {
        let params: Vec<String> = block
            .params
            .iter()
            .zip(block.ptypes.iter())
            .map(|(t, ty)| format!("{}: {}", t, type_name(prog, ty)))
            .collect();
        let _ = writeln!(out, "block {}({}) {{", block.name, params.join(", "));
        print_code(prog, &block.body, &mut out);
        let _ = writeln!(out, "}}\n");
    }
    out
}

fn layout_segments(layout: &crate::mil::BitdataLayout, width: u32) -> Vec<String> {
    // Reconstruct the MSB-first segment list from tag mask and fields.
    #[derive(Clone)]
    enum Seg {
        Tag(u64, u32, u32),   // bits, width, offset
        Field(String, u32, u32),
    }
    let mut segs: Vec<Seg> = layout
        .fields
        .iter()
        .map(|f| Seg::Field(f.name.clone(), f.width, f.offset))
        .collect();
    // Contiguous runs of tag bits become literal segments.
    let mut bit = width;
    while bit > 0 {
        bit -= 1;
        if layout.tag_mask >> bit & 1 == 1 {
            let hi = bit;
            let mut lo = bit;
            while lo > 0 && layout.tag_mask >> (lo - 1) & 1 == 1 {
                lo -= 1;
            }
            let w = hi - lo + 1;
            let mask = if w >= 64 { u64::MAX } else { (1u64 << w) - 1 };
            let bits = (layout.tag_bits >> lo) & mask;
            segs.push(Seg::Tag(bits, w, lo));
            bit = lo;
        }
    }
    segs.sort_by_key(|s| {
        std::cmp::Reverse(match s {
            Seg::Tag(_, _, off) | Seg::Field(_, _, off) => *off,
        })
    });
    segs.iter()
        .map(|s| match s {
            Seg::Tag(bits, w, _) => format!("0b{:0width$b} : {}", bits, w, width = *w as usize),
            Seg::Field(name, w, _) => format!("{} : {}", name, w),
        })
        .collect()
}

pub fn type_name(prog: &Program, ty: &Type) -> String {
    match ty {
        Type::Word => "word".to_string(),
        Type::Flag => "flag".to_string(),
        Type::Addr => "addr".to_string(),
        Type::Data(d) => prog.data(*d).name().to_string(),
        Type::Clos(k) => prog.closure(*k).name.clone(),
    }
}

pub fn atom_str(prog: &Program, a: &Atom) -> String {
    match a {
        Atom::Temp(t) => t.to_string(),
        Atom::Int(i) => i.to_string(),
        Atom::Flag(b) => b.to_string(),
        Atom::Top(t, n) => {
            let top = prog.top(*t);
            top.lhs
                .get(*n)
                .cloned()
                .unwrap_or_else(|| format!("{}.{}", top.name, n))
        }
        Atom::Area(a) => prog.area(*a).name.clone(),
    }
}

fn atoms_str(prog: &Program, atoms: &[Atom]) -> String {
    atoms
        .iter()
        .map(|a| atom_str(prog, a))
        .collect::<Vec<_>>()
        .join(", ")
}

pub fn tail_str(prog: &Program, t: &Tail) -> String {
    match t {
        Tail::Return(atoms) => {
            if atoms.is_empty() {
                "return".to_string()
            } else {
                format!("return {}", atoms_str(prog, atoms))
            }
        }
        Tail::Prim(p, args) => {
            format!("{}({})", prog.prims.get(*p).name, atoms_str(prog, args))
        }
        Tail::BlockCall(b, args) => {
            format!("{}({})", prog.block(*b).name, atoms_str(prog, args))
        }
        Tail::DataAlloc(cf, args) => {
            format!("new {}({})", prog.cfun(*cf).name, atoms_str(prog, args))
        }
        Tail::ClosAlloc(k, args) => {
            format!("clos {}({})", prog.closure(*k).name, atoms_str(prog, args))
        }
        Tail::Enter(f, args) => {
            format!("enter {}({})", atom_str(prog, f), atoms_str(prog, args))
        }
        Tail::Sel(cf, n, a) => {
            format!("sel {}.{}({})", prog.cfun(*cf).name, n, atom_str(prog, a))
        }
    }
}

fn jump_str(prog: &Program, j: &JumpTo) -> String {
    format!("{}({})", prog.block(j.block).name, atoms_str(prog, &j.args))
}

fn print_code(prog: &Program, code: &Code, out: &mut String) {
    match code {
        Code::Bind(vs, t, next) => {
            let lhs = vs
                .iter()
                .map(|v| v.to_string())
                .collect::<Vec<_>>()
                .join(", ");
            if vs.is_empty() {
                let _ = writeln!(out, "  _ <- {}", tail_str(prog, t));
            } else {
                let _ = writeln!(out, "  {} <- {}", lhs, tail_str(prog, t));
            }
            print_code(prog, next, out);
        }
        Code::Done(t) => {
            let _ = writeln!(out, "  {}", tail_str(prog, t));
        }
        Code::If(a, jt, je) => {
            let _ = writeln!(
                out,
                "  if {} then {} else {}",
                atom_str(prog, a),
                jump_str(prog, jt),
                jump_str(prog, je)
            );
        }
        Code::Case(a, alts, def) => {
            let _ = writeln!(out, "  case {} of {{", atom_str(prog, a));
            for (cf, j) in alts {
                let _ = writeln!(out, "    {} -> {}", prog.cfun(*cf).name, jump_str(prog, j));
            }
            if let Some(j) = def {
                let _ = writeln!(out, "    _ -> {}", jump_str(prog, j));
            }
            let _ = writeln!(out, "  }}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mil::{BlockDef, Temp, TopDef};

    #[test]
    fn test_print_simple_block() {
        let mut prog = Program::new();
        let add = prog.prims.add();
        let params = prog.fresh_temps(2);
        let (x, y) = (params[0], params[1]);
        let t = prog.fresh_temp();
        prog.add_block(BlockDef {
            name: "main".into(),
            ptypes: vec![Type::Word, Type::Word],
            params,
            body: Code::Bind(
                vec![t],
                Tail::Prim(add, vec![Atom::Temp(x), Atom::Temp(y)]),
                Box::new(Code::Done(Tail::Return(vec![Atom::Temp(t)]))),
            ),
        });
        let text = print_program(&prog);
        assert!(text.contains("block main(t0: word, t1: word) {"), "{}", text);
        assert!(text.contains("t2 <- add(t0, t1)"), "{}", text);
        assert!(text.contains("return t2"), "{}", text);
    }

    #[test]
    fn test_print_top_component_names() {
        let mut prog = Program::new();
        prog.add_top(TopDef {
            name: "pair".into(),
            lhs: vec!["q".into(), "r".into()],
            types: vec![Type::Word, Type::Word],
            tail: Tail::Return(vec![Atom::Int(1), Atom::Int(2)]),
        });
        let text = print_program(&prog);
        assert!(text.contains("top (q, r) = return 1, 2"), "{}", text);
    }

    #[test]
    fn test_temp_display() {
        assert_eq!(Temp(17).to_string(), "t17");
    }
}
