//! Parser for the MIL textual dialect
//!
//! Syntax:
//! ```text
//! area buf[64]
//!
//! bitdata Status / 8 {
//!   Ok  [ 0b10 : 2 | payload : 6 ]
//!   Err [ 0b11 : 2 | code : 6 ]
//! }
//!
//! struct Pair { word, word }
//!
//! top answer = add(40, 2)
//!
//! closure adder(n: word | x: word) = add(n, x)
//!
//! block main() {
//!   t <- add(3, 4)
//!   _ <- printWord(t)
//!   return t
//! }
//! ```
//!
//! Blocks may refer to each other in any order; the parser collects
//! declarations first and resolves bodies afterwards. `#` starts a line
//! comment.

use crate::check::{tail_types, BlockTypes};
use crate::mil::{
    AreaDef, Atom, BitField, BitdataLayout, BlockDef, Cfun, CfunId, ClosureDef, Code, DataDef,
    DataId, JumpTo, Program, Tail, Temp, TopDef,
};
use crate::types::Type;
use std::collections::HashMap;

/// A token with source position information.
#[derive(Debug, Clone)]
pub struct Token {
    pub text: String,
    pub line: usize,
}

impl PartialEq<&str> for Token {
    fn eq(&self, other: &&str) -> bool {
        self.text == *other
    }
}

fn tokenize(source: &str) -> Vec<Token> {
    let mut tokens = Vec::new();
    for (line_no, line) in source.lines().enumerate() {
        let mut chars = line.chars().peekable();
        let mut buf = String::new();
        let flush = |buf: &mut String, tokens: &mut Vec<Token>| {
            if !buf.is_empty() {
                tokens.push(Token {
                    text: std::mem::take(buf),
                    line: line_no,
                });
            }
        };
        while let Some(c) = chars.next() {
            match c {
                '#' => break,
                c if c.is_whitespace() => flush(&mut buf, &mut tokens),
                '(' | ')' | '{' | '}' | '[' | ']' | ',' | ':' | '|' | '=' | '.' | '/' => {
                    flush(&mut buf, &mut tokens);
                    tokens.push(Token {
                        text: c.to_string(),
                        line: line_no,
                    });
                }
                '<' if chars.peek() == Some(&'-') => {
                    chars.next();
                    flush(&mut buf, &mut tokens);
                    tokens.push(Token {
                        text: "<-".to_string(),
                        line: line_no,
                    });
                }
                '-' if chars.peek() == Some(&'>') => {
                    chars.next();
                    flush(&mut buf, &mut tokens);
                    tokens.push(Token {
                        text: "->".to_string(),
                        line: line_no,
                    });
                }
                '-' => {
                    // Only negative literals use '-'; it glues to digits.
                    flush(&mut buf, &mut tokens);
                    buf.push('-');
                }
                _ => buf.push(c),
            }
        }
        flush(&mut buf, &mut tokens);
    }
    tokens
}

// ---------------------------------------------------------------------------
// Surface declarations, resolved into a Program after all names are known
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
enum SAtom {
    Ident(String),
    Int(i64),
    Flag(bool),
}

#[derive(Debug, Clone)]
enum STail {
    Return(Vec<SAtom>),
    Call(String, Vec<SAtom>),
    New(String, Vec<SAtom>),
    Clos(String, Vec<SAtom>),
    Enter(SAtom, Vec<SAtom>),
    Sel(String, usize, SAtom),
}

#[derive(Debug, Clone)]
struct SJump {
    target: String,
    args: Vec<SAtom>,
}

#[derive(Debug)]
enum SCode {
    Bind(Vec<String>, STail, Box<SCode>),
    Done(STail),
    If(SAtom, SJump, SJump),
    Case(SAtom, Vec<(String, SJump)>, Option<SJump>),
}

type SParam = (String, Option<String>);

#[derive(Debug)]
struct SBlock {
    name: String,
    params: Vec<SParam>,
    body: SCode,
}

#[derive(Debug)]
struct STop {
    lhs: Vec<String>,
    tail: STail,
}

#[derive(Debug)]
struct SClos {
    name: String,
    stored: Vec<SParam>,
    params: Vec<SParam>,
    body: STail,
}

#[derive(Debug)]
enum BSeg {
    Tag(u64, u32),
    Field(String, u32),
}

#[derive(Debug)]
enum SData {
    Bitdata {
        name: String,
        width: u32,
        ctors: Vec<(String, Vec<BSeg>)>,
    },
    Struct {
        name: String,
        fields: Vec<String>,
    },
}

pub struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    pub fn new(source: &str) -> Self {
        Parser {
            tokens: tokenize(source),
            pos: 0,
        }
    }

    pub fn parse(&mut self) -> Result<Program, String> {
        let mut areas = Vec::new();
        let mut datas = Vec::new();
        let mut tops = Vec::new();
        let mut closures = Vec::new();
        let mut blocks = Vec::new();

        while !self.is_at_end() {
            let kw = self.peek_text().to_string();
            match kw.as_str() {
                "area" => areas.push(self.parse_area()?),
                "bitdata" => datas.push(self.parse_bitdata()?),
                "struct" => datas.push(self.parse_struct()?),
                "top" => tops.push(self.parse_top()?),
                "closure" => closures.push(self.parse_closure()?),
                "block" => blocks.push(self.parse_block()?),
                other => {
                    return Err(format!(
                        "line {}: expected a declaration, found '{}'",
                        self.peek_line() + 1,
                        other
                    ));
                }
            }
        }

        Resolver::build(areas, datas, tops, closures, blocks)
    }

    // -- token plumbing ----------------------------------------------------

    fn is_at_end(&self) -> bool {
        self.pos >= self.tokens.len()
    }

    fn peek_text(&self) -> &str {
        self.tokens.get(self.pos).map_or("", |t| t.text.as_str())
    }

    fn peek_line(&self) -> usize {
        self.tokens.get(self.pos).map_or(0, |t| t.line)
    }

    fn advance(&mut self) -> Option<&Token> {
        let t = self.tokens.get(self.pos);
        if t.is_some() {
            self.pos += 1;
        }
        t
    }

    fn expect(&mut self, text: &str) -> Result<(), String> {
        let line = self.peek_line();
        match self.advance() {
            Some(t) if t == &text => Ok(()),
            Some(t) => Err(format!(
                "line {}: expected '{}', found '{}'",
                t.line + 1,
                text,
                t.text
            )),
            None => Err(format!(
                "line {}: expected '{}', found end of input",
                line + 1,
                text
            )),
        }
    }

    fn check(&mut self, text: &str) -> bool {
        if self.peek_text() == text {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn ident(&mut self) -> Result<String, String> {
        let line = self.peek_line();
        match self.advance() {
            Some(t) if is_ident(&t.text) => Ok(t.text.clone()),
            Some(t) => Err(format!(
                "line {}: expected an identifier, found '{}'",
                t.line + 1,
                t.text
            )),
            None => Err(format!(
                "line {}: expected an identifier, found end of input",
                line + 1
            )),
        }
    }

    fn number(&mut self) -> Result<i64, String> {
        let line = self.peek_line();
        match self.advance() {
            Some(t) => parse_int(&t.text)
                .ok_or_else(|| format!("line {}: expected a number, found '{}'", t.line + 1, t.text)),
            None => Err(format!(
                "line {}: expected a number, found end of input",
                line + 1
            )),
        }
    }

    // -- declarations ------------------------------------------------------

    fn parse_area(&mut self) -> Result<AreaDef, String> {
        self.expect("area")?;
        let name = self.ident()?;
        self.expect("[")?;
        let size = self.number()?;
        self.expect("]")?;
        if size < 0 {
            return Err(format!("area {}: negative size", name));
        }
        Ok(AreaDef {
            name,
            size: size as u64,
        })
    }

    fn parse_bitdata(&mut self) -> Result<SData, String> {
        self.expect("bitdata")?;
        let name = self.ident()?;
        self.expect("/")?;
        let width = self.number()?;
        if !(1..=64).contains(&width) {
            return Err(format!("bitdata {}: width must be 1..=64", name));
        }
        self.expect("{")?;
        let mut ctors = Vec::new();
        while !self.check("}") {
            let cname = self.ident()?;
            self.expect("[")?;
            let mut segs = Vec::new();
            loop {
                let tok = self
                    .advance()
                    .ok_or_else(|| format!("bitdata {}: unterminated layout", name))?
                    .clone();
                self.expect(":")?;
                let w = self.number()?;
                if w <= 0 {
                    return Err(format!("bitdata {}: segment width must be positive", name));
                }
                if let Some(bits) = parse_bits(&tok.text) {
                    segs.push(BSeg::Tag(bits, w as u32));
                } else if is_ident(&tok.text) {
                    segs.push(BSeg::Field(tok.text, w as u32));
                } else {
                    return Err(format!(
                        "line {}: expected tag bits or field name, found '{}'",
                        tok.line + 1,
                        tok.text
                    ));
                }
                if self.check("]") {
                    break;
                }
                self.expect("|")?;
            }
            ctors.push((cname, segs));
        }
        Ok(SData::Bitdata {
            name,
            width: width as u32,
            ctors,
        })
    }

    fn parse_struct(&mut self) -> Result<SData, String> {
        self.expect("struct")?;
        let name = self.ident()?;
        self.expect("{")?;
        let mut fields = Vec::new();
        while !self.check("}") {
            if !fields.is_empty() {
                self.expect(",")?;
            }
            fields.push(self.ident()?);
        }
        Ok(SData::Struct { name, fields })
    }

    fn parse_top(&mut self) -> Result<STop, String> {
        self.expect("top")?;
        let lhs = if self.check("(") {
            let mut names = vec![self.ident()?];
            while self.check(",") {
                names.push(self.ident()?);
            }
            self.expect(")")?;
            names
        } else {
            vec![self.ident()?]
        };
        self.expect("=")?;
        let tail = self.parse_tail()?;
        Ok(STop { lhs, tail })
    }

    fn parse_closure(&mut self) -> Result<SClos, String> {
        self.expect("closure")?;
        let name = self.ident()?;
        self.expect("(")?;
        let stored = self.parse_params("|")?;
        let params = self.parse_params(")")?;
        self.expect("=")?;
        let body = self.parse_tail()?;
        Ok(SClos {
            name,
            stored,
            params,
            body,
        })
    }

    fn parse_block(&mut self) -> Result<SBlock, String> {
        self.expect("block")?;
        let name = self.ident()?;
        self.expect("(")?;
        let params = self.parse_params(")")?;
        self.expect("{")?;
        let body = self.parse_code()?;
        self.expect("}")?;
        Ok(SBlock { name, params, body })
    }

    /// Comma-separated `name[: type]` list up to (and consuming) `close`.
    fn parse_params(&mut self, close: &str) -> Result<Vec<SParam>, String> {
        let mut params = Vec::new();
        if self.check(close) {
            return Ok(params);
        }
        loop {
            let name = self.ident()?;
            let ty = if self.check(":") {
                Some(self.ident()?)
            } else {
                None
            };
            params.push((name, ty));
            if self.check(close) {
                return Ok(params);
            }
            self.expect(",")?;
        }
    }

    // -- code and tails ----------------------------------------------------

    fn parse_code(&mut self) -> Result<SCode, String> {
        if self.peek_text() == "if" {
            self.expect("if")?;
            let scrutinee = self.parse_atom()?;
            self.expect("then")?;
            let jt = self.parse_jump()?;
            self.expect("else")?;
            let je = self.parse_jump()?;
            return Ok(SCode::If(scrutinee, jt, je));
        }
        if self.peek_text() == "case" {
            self.expect("case")?;
            let scrutinee = self.parse_atom()?;
            self.expect("of")?;
            self.expect("{")?;
            let mut alts = Vec::new();
            let mut def = None;
            while !self.check("}") {
                if self.check("_") {
                    self.expect("->")?;
                    def = Some(self.parse_jump()?);
                } else {
                    let cname = self.ident()?;
                    self.expect("->")?;
                    alts.push((cname, self.parse_jump()?));
                }
            }
            return Ok(SCode::Case(scrutinee, alts, def));
        }

        // A line is either `vs <- tail` followed by more code, or a
        // terminal tail.
        let mark = self.pos;
        if let Ok(vs) = self.parse_bind_lhs() {
            let tail = self.parse_tail()?;
            let rest = self.parse_code()?;
            return Ok(SCode::Bind(vs, tail, Box::new(rest)));
        }
        self.pos = mark;
        Ok(SCode::Done(self.parse_tail()?))
    }

    /// `v1, v2 <- ` or `_ <- `; fails (restoring nothing) when the line is
    /// not a bind.
    fn parse_bind_lhs(&mut self) -> Result<Vec<String>, String> {
        let mark = self.pos;
        if self.check("_") {
            if self.check("<-") {
                return Ok(Vec::new());
            }
            self.pos = mark;
            return Err("not a bind".to_string());
        }
        let mut vs = Vec::new();
        loop {
            match self.advance() {
                Some(t) if is_ident(&t.text) => vs.push(t.text.clone()),
                _ => {
                    self.pos = mark;
                    return Err("not a bind".to_string());
                }
            }
            if self.check("<-") {
                return Ok(vs);
            }
            if !self.check(",") {
                self.pos = mark;
                return Err("not a bind".to_string());
            }
        }
    }

    fn parse_jump(&mut self) -> Result<SJump, String> {
        let target = self.ident()?;
        self.expect("(")?;
        let args = self.parse_atoms(")")?;
        Ok(SJump { target, args })
    }

    fn parse_tail(&mut self) -> Result<STail, String> {
        if self.check("return") {
            // Atoms up to the end of the expression; `return` with no
            // arguments yields the empty tuple.
            let mut atoms = Vec::new();
            if self.at_atom() {
                atoms.push(self.parse_atom()?);
                while self.check(",") {
                    atoms.push(self.parse_atom()?);
                }
            }
            return Ok(STail::Return(atoms));
        }
        if self.check("new") {
            let cname = self.ident()?;
            self.expect("(")?;
            let args = self.parse_atoms(")")?;
            return Ok(STail::New(cname, args));
        }
        if self.check("clos") {
            let kname = self.ident()?;
            self.expect("(")?;
            let args = self.parse_atoms(")")?;
            return Ok(STail::Clos(kname, args));
        }
        if self.check("enter") {
            let f = self.parse_atom()?;
            self.expect("(")?;
            let args = self.parse_atoms(")")?;
            return Ok(STail::Enter(f, args));
        }
        if self.check("sel") {
            let cname = self.ident()?;
            self.expect(".")?;
            let n = self.number()?;
            self.expect("(")?;
            let a = self.parse_atom()?;
            self.expect(")")?;
            return Ok(STail::Sel(cname, n as usize, a));
        }
        let name = self.ident()?;
        self.expect("(")?;
        let args = self.parse_atoms(")")?;
        Ok(STail::Call(name, args))
    }

    fn parse_atoms(&mut self, close: &str) -> Result<Vec<SAtom>, String> {
        let mut atoms = Vec::new();
        if self.check(close) {
            return Ok(atoms);
        }
        loop {
            atoms.push(self.parse_atom()?);
            if self.check(close) {
                return Ok(atoms);
            }
            self.expect(",")?;
        }
    }

    fn at_atom(&self) -> bool {
        let t = self.peek_text();
        !t.is_empty() && (is_ident(t) || parse_int(t).is_some())
    }

    fn parse_atom(&mut self) -> Result<SAtom, String> {
        let line = self.peek_line();
        let t = self
            .advance()
            .ok_or_else(|| format!("line {}: expected an atom, found end of input", line + 1))?;
        if let Some(i) = parse_int(&t.text) {
            return Ok(SAtom::Int(i));
        }
        match t.text.as_str() {
            "true" => Ok(SAtom::Flag(true)),
            "false" => Ok(SAtom::Flag(false)),
            s if is_ident(s) => Ok(SAtom::Ident(s.to_string())),
            s => Err(format!("line {}: expected an atom, found '{}'", t.line + 1, s)),
        }
    }
}

fn is_ident(s: &str) -> bool {
    let mut chars = s.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
        && !matches!(
            s,
            "return" | "new" | "clos" | "enter" | "sel" | "if" | "then" | "else" | "case" | "of"
        )
}

fn parse_int(s: &str) -> Option<i64> {
    if let Some(hex) = s.strip_prefix("0x") {
        return u64::from_str_radix(hex, 16).ok().map(|v| v as i64);
    }
    if let Some(bin) = s.strip_prefix("0b") {
        return u64::from_str_radix(bin, 2).ok().map(|v| v as i64);
    }
    s.parse::<i64>().ok()
}

/// Tag-bit literals in bitdata layouts: `0b10`, `0x3`, or decimal.
fn parse_bits(s: &str) -> Option<u64> {
    if let Some(bin) = s.strip_prefix("0b") {
        return u64::from_str_radix(bin, 2).ok();
    }
    if let Some(hex) = s.strip_prefix("0x") {
        return u64::from_str_radix(hex, 16).ok();
    }
    if s.chars().all(|c| c.is_ascii_digit()) {
        return s.parse().ok();
    }
    None
}

// ---------------------------------------------------------------------------
// Resolution
// ---------------------------------------------------------------------------

struct Resolver {
    prog: Program,
}

impl Resolver {
    fn build(
        areas: Vec<AreaDef>,
        datas: Vec<SData>,
        tops: Vec<STop>,
        closures: Vec<SClos>,
        blocks: Vec<SBlock>,
    ) -> Result<Program, String> {
        let mut r = Resolver {
            prog: Program::new(),
        };

        for a in areas {
            if r.prog.find_area(&a.name).is_some() {
                return Err(format!("area {} defined twice", a.name));
            }
            r.prog.add_area(a);
        }
        for d in &datas {
            r.declare_data(d)?;
        }

        // Shells first so types and calls can refer to anything by name.
        for c in &closures {
            if r.prog.closures.iter().any(|x| x.name == c.name) {
                return Err(format!("closure {} defined twice", c.name));
            }
            r.prog.add_closure(ClosureDef {
                name: c.name.clone(),
                stored: Vec::new(),
                stypes: Vec::new(),
                params: Vec::new(),
                ptypes: Vec::new(),
                rtypes: Vec::new(),
                body: Tail::Return(Vec::new()),
            });
        }
        for b in &blocks {
            if r.prog.find_block(&b.name).is_some() {
                return Err(format!("block {} defined twice", b.name));
            }
            r.prog.add_block(BlockDef {
                name: b.name.clone(),
                params: Vec::new(),
                ptypes: Vec::new(),
                body: Code::Done(Tail::Return(Vec::new())),
            });
        }

        // Signatures.
        for (i, c) in closures.iter().enumerate() {
            let (stored, stypes) = r.fresh_params(&c.stored)?;
            let (params, ptypes) = r.fresh_params(&c.params)?;
            let def = &mut r.prog.closures[i];
            def.stored = stored;
            def.stypes = stypes;
            def.params = params;
            def.ptypes = ptypes;
        }
        for (i, b) in blocks.iter().enumerate() {
            let (params, ptypes) = r.fresh_params(&b.params)?;
            let def = &mut r.prog.blocks[i];
            def.params = params;
            def.ptypes = ptypes;
        }

        // Top-levels resolve in order; a top may refer to earlier tops.
        for t in &tops {
            let tail = r.resolve_tail(&t.tail, &HashMap::new())?;
            let name = t.lhs.join("_");
            for n in &t.lhs {
                if r.top_component(n).is_some() {
                    return Err(format!("top-level component {} defined twice", n));
                }
            }
            r.prog.add_top(TopDef {
                name,
                lhs: t.lhs.clone(),
                types: Vec::new(),
                tail,
            });
        }

        // Bodies.
        for (i, c) in closures.iter().enumerate() {
            let mut env = HashMap::new();
            let def = &r.prog.closures[i];
            for ((n, _), t) in c.stored.iter().zip(def.stored.iter()) {
                env.insert(n.clone(), *t);
            }
            for ((n, _), t) in c.params.iter().zip(def.params.iter()) {
                env.insert(n.clone(), *t);
            }
            let body = r.resolve_tail(&c.body, &env)?;
            r.prog.closures[i].body = body;
        }
        for (i, b) in blocks.iter().enumerate() {
            let mut env = HashMap::new();
            for ((n, _), t) in b.params.iter().zip(r.prog.blocks[i].params.iter()) {
                env.insert(n.clone(), *t);
            }
            let body = r.resolve_code(&b.body, &mut env)?;
            r.prog.blocks[i].body = body;
        }

        r.finalize_types()?;
        Ok(r.prog)
    }

    fn declare_data(&mut self, d: &SData) -> Result<(), String> {
        match d {
            SData::Bitdata { name, width, ctors } => {
                let data_id = DataId(self.prog.datas.len() as u32);
                let mut layouts = Vec::new();
                let mut cfun_ids = Vec::new();
                for (tag, (cname, segs)) in ctors.iter().enumerate() {
                    if self.prog.find_cfun(cname).is_some() {
                        return Err(format!("constructor {} defined twice", cname));
                    }
                    let total: u32 = segs
                        .iter()
                        .map(|s| match s {
                            BSeg::Tag(_, w) | BSeg::Field(_, w) => *w,
                        })
                        .sum();
                    if total != *width {
                        return Err(format!(
                            "bitdata {}: constructor {} covers {} bits, expected {}",
                            name, cname, total, width
                        ));
                    }
                    let mut layout = BitdataLayout {
                        tag_bits: 0,
                        tag_mask: 0,
                        fields: Vec::new(),
                    };
                    // Segments are written most-significant first.
                    let mut remaining = *width;
                    for seg in segs {
                        match seg {
                            BSeg::Tag(bits, w) => {
                                remaining -= w;
                                let mask = if *w >= 64 { u64::MAX } else { (1u64 << w) - 1 };
                                if *bits & !mask != 0 {
                                    return Err(format!(
                                        "bitdata {}: tag bits of {} exceed segment width",
                                        name, cname
                                    ));
                                }
                                layout.tag_bits |= bits << remaining;
                                layout.tag_mask |= mask << remaining;
                            }
                            BSeg::Field(fname, w) => {
                                remaining -= w;
                                layout.fields.push(BitField {
                                    name: fname.clone(),
                                    offset: remaining,
                                    width: *w,
                                });
                            }
                        }
                    }
                    layouts.push(layout);
                    let cf = CfunId(self.prog.cfuns.len() as u32);
                    self.prog.cfuns.push(Cfun {
                        name: cname.clone(),
                        data: data_id,
                        tag,
                    });
                    cfun_ids.push(cf);
                }
                self.prog.datas.push(DataDef::Bitdata {
                    name: name.clone(),
                    width: *width,
                    layouts,
                    cfuns: cfun_ids,
                });
                Ok(())
            }
            SData::Struct { name, fields } => {
                if self.prog.find_cfun(name).is_some() {
                    return Err(format!("constructor {} defined twice", name));
                }
                let data_id = DataId(self.prog.datas.len() as u32);
                let ftypes = fields
                    .iter()
                    .map(|f| self.type_by_name(f))
                    .collect::<Result<Vec<_>, _>>()?;
                let cf = CfunId(self.prog.cfuns.len() as u32);
                self.prog.cfuns.push(Cfun {
                    name: name.clone(),
                    data: data_id,
                    tag: 0,
                });
                self.prog.datas.push(DataDef::Struct {
                    name: name.clone(),
                    fields: ftypes,
                    cfun: cf,
                });
                Ok(())
            }
        }
    }

    fn type_by_name(&self, name: &str) -> Result<Type, String> {
        match name {
            "word" => Ok(Type::Word),
            "flag" => Ok(Type::Flag),
            "addr" => Ok(Type::Addr),
            _ => {
                if let Some(i) = self.prog.datas.iter().position(|d| d.name() == name) {
                    return Ok(Type::Data(DataId(i as u32)));
                }
                if let Some(i) = self.prog.closures.iter().position(|c| c.name == name) {
                    return Ok(Type::Clos(crate::mil::ClosId(i as u32)));
                }
                Err(format!("unknown type '{}'", name))
            }
        }
    }

    fn fresh_params(&mut self, params: &[SParam]) -> Result<(Vec<Temp>, Vec<Type>), String> {
        let mut temps = Vec::new();
        let mut types = Vec::new();
        for (_, ty) in params {
            temps.push(self.prog.fresh_temp());
            types.push(match ty {
                Some(name) => self.type_by_name(name)?,
                None => Type::Word,
            });
        }
        Ok((temps, types))
    }

    fn top_component(&self, name: &str) -> Option<Atom> {
        for (i, top) in self.prog.tops.iter().enumerate() {
            if let Some(n) = top.lhs.iter().position(|l| l == name) {
                return Some(Atom::Top(crate::mil::TopId(i as u32), n));
            }
        }
        None
    }

    fn resolve_atom(&self, a: &SAtom, env: &HashMap<String, Temp>) -> Result<Atom, String> {
        match a {
            SAtom::Int(i) => Ok(Atom::Int(*i)),
            SAtom::Flag(b) => Ok(Atom::Flag(*b)),
            SAtom::Ident(name) => {
                if let Some(t) = env.get(name) {
                    return Ok(Atom::Temp(*t));
                }
                if let Some(a) = self.top_component(name) {
                    return Ok(a);
                }
                if let Some(area) = self.prog.find_area(name) {
                    return Ok(Atom::Area(area));
                }
                Err(format!("unknown name '{}'", name))
            }
        }
    }

    fn resolve_atoms(
        &self,
        atoms: &[SAtom],
        env: &HashMap<String, Temp>,
    ) -> Result<Vec<Atom>, String> {
        atoms.iter().map(|a| self.resolve_atom(a, env)).collect()
    }

    fn resolve_tail(&self, t: &STail, env: &HashMap<String, Temp>) -> Result<Tail, String> {
        match t {
            STail::Return(atoms) => Ok(Tail::Return(self.resolve_atoms(atoms, env)?)),
            STail::Call(name, args) => {
                let args = self.resolve_atoms(args, env)?;
                if let Some(b) = self.prog.find_block(name) {
                    return Ok(Tail::BlockCall(b, args));
                }
                if let Some(p) = self.prog.prims.by_name(name) {
                    return Ok(Tail::Prim(p, args));
                }
                Err(format!("unknown block or primitive '{}'", name))
            }
            STail::New(cname, args) => {
                let cf = self
                    .prog
                    .find_cfun(cname)
                    .ok_or_else(|| format!("unknown constructor '{}'", cname))?;
                Ok(Tail::DataAlloc(cf, self.resolve_atoms(args, env)?))
            }
            STail::Clos(kname, args) => {
                let k = self
                    .prog
                    .closures
                    .iter()
                    .position(|c| c.name == *kname)
                    .ok_or_else(|| format!("unknown closure '{}'", kname))?;
                Ok(Tail::ClosAlloc(
                    crate::mil::ClosId(k as u32),
                    self.resolve_atoms(args, env)?,
                ))
            }
            STail::Enter(f, args) => Ok(Tail::Enter(
                self.resolve_atom(f, env)?,
                self.resolve_atoms(args, env)?,
            )),
            STail::Sel(cname, n, a) => {
                let cf = self
                    .prog
                    .find_cfun(cname)
                    .ok_or_else(|| format!("unknown constructor '{}'", cname))?;
                Ok(Tail::Sel(cf, *n, self.resolve_atom(a, env)?))
            }
        }
    }

    fn resolve_jump(&self, j: &SJump, env: &HashMap<String, Temp>) -> Result<JumpTo, String> {
        let block = self
            .prog
            .find_block(&j.target)
            .ok_or_else(|| format!("unknown block '{}'", j.target))?;
        Ok(JumpTo::new(block, self.resolve_atoms(&j.args, env)?))
    }

    fn resolve_code(
        &mut self,
        code: &SCode,
        env: &mut HashMap<String, Temp>,
    ) -> Result<Code, String> {
        match code {
            SCode::Bind(vs, t, next) => {
                let tail = self.resolve_tail(t, env)?;
                let mut temps = Vec::new();
                for v in vs {
                    let t = self.prog.fresh_temp();
                    env.insert(v.clone(), t);
                    temps.push(t);
                }
                let rest = self.resolve_code(next, env)?;
                Ok(Code::Bind(temps, tail, Box::new(rest)))
            }
            SCode::Done(t) => Ok(Code::Done(self.resolve_tail(t, env)?)),
            SCode::If(a, jt, je) => Ok(Code::If(
                self.resolve_atom(a, env)?,
                self.resolve_jump(jt, env)?,
                self.resolve_jump(je, env)?,
            )),
            SCode::Case(a, alts, def) => {
                let scrutinee = self.resolve_atom(a, env)?;
                let alts = alts
                    .iter()
                    .map(|(cname, j)| {
                        let cf = self
                            .prog
                            .find_cfun(cname)
                            .ok_or_else(|| format!("unknown constructor '{}'", cname))?;
                        Ok((cf, self.resolve_jump(j, env)?))
                    })
                    .collect::<Result<Vec<_>, String>>()?;
                let def = match def {
                    Some(j) => Some(self.resolve_jump(j, env)?),
                    None => None,
                };
                Ok(Code::Case(scrutinee, alts, def))
            }
        }
    }

    /// Fill in top-level and closure result types once bodies exist. Two
    /// rounds let closure results that depend on block results settle.
    fn finalize_types(&mut self) -> Result<(), String> {
        for _ in 0..2 {
            let bt = BlockTypes::resolve(&self.prog)?;
            for i in 0..self.prog.tops.len() {
                let tail = self.prog.tops[i].tail.clone();
                if let Ok(tys) = tail_types(&self.prog, &HashMap::new(), &tail, &bt) {
                    let top = &mut self.prog.tops[i];
                    if tys.len() != top.lhs.len() {
                        return Err(format!(
                            "top-level {}: {} components declared, tail produces {}",
                            top.name,
                            top.lhs.len(),
                            tys.len()
                        ));
                    }
                    top.types = tys;
                }
            }
            for i in 0..self.prog.closures.len() {
                let c = &self.prog.closures[i];
                let mut env = HashMap::new();
                for (t, ty) in c.stored.iter().zip(c.stypes.iter()) {
                    env.insert(*t, ty.clone());
                }
                for (t, ty) in c.params.iter().zip(c.ptypes.iter()) {
                    env.insert(*t, ty.clone());
                }
                if let Ok(tys) = tail_types(&self.prog, &env, &c.body.clone(), &bt) {
                    self.prog.closures[i].rtypes = tys;
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mil::DataDef;

    fn parse(source: &str) -> Program {
        Parser::new(source).parse().unwrap()
    }

    #[test]
    fn test_parse_simple_block() {
        let prog = parse(
            "block main() {\n\
             \x20 t <- add(3, 4)\n\
             \x20 _ <- printWord(t)\n\
             \x20 return t\n\
             }\n",
        );
        let main = prog.find_block("main").unwrap();
        match &prog.block(main).body {
            Code::Bind(vs, Tail::Prim(p, args), _) => {
                assert_eq!(vs.len(), 1);
                assert_eq!(prog.prims.get(*p).name, "add");
                assert_eq!(args, &[Atom::Int(3), Atom::Int(4)]);
            }
            other => panic!("unexpected body: {:?}", other),
        }
    }

    #[test]
    fn test_parse_forward_references() {
        let prog = parse(
            "block a() { b() }\n\
             block b() { return 1 }\n",
        );
        let a = prog.find_block("a").unwrap();
        let b = prog.find_block("b").unwrap();
        assert_eq!(prog.block(a).body, Code::Done(Tail::BlockCall(b, vec![])));
    }

    #[test]
    fn test_parse_if_and_typed_params() {
        let prog = parse(
            "block loop(n: word, f: flag) {\n\
             \x20 if f then done(n) else loop(n, f)\n\
             }\n\
             block done(n: word) { return n }\n",
        );
        let l = prog.find_block("loop").unwrap();
        assert_eq!(prog.block(l).ptypes, vec![Type::Word, Type::Flag]);
        assert!(matches!(prog.block(l).body, Code::If(..)));
    }

    #[test]
    fn test_parse_bitdata_layout() {
        // Tag 0b10 in the top two bits, six-bit payload below.
        let prog = parse(
            "bitdata Status / 8 {\n\
             \x20 Ok [ 0b10 : 2 | payload : 6 ]\n\
             }\n",
        );
        match &prog.datas[0] {
            DataDef::Bitdata {
                width, layouts, ..
            } => {
                assert_eq!(*width, 8);
                let l = &layouts[0];
                assert_eq!(l.tag_bits, 0b10 << 6);
                assert_eq!(l.tag_mask, 0b11 << 6);
                assert_eq!(l.fields.len(), 1);
                assert_eq!(l.fields[0].offset, 0);
                assert_eq!(l.fields[0].width, 6);
            }
            other => panic!("unexpected data: {:?}", other),
        }
    }

    #[test]
    fn test_parse_case_and_constructor() {
        let prog = parse(
            "bitdata Status / 8 {\n\
             \x20 Ok  [ 0b10 : 2 | payload : 6 ]\n\
             \x20 Err [ 0b11 : 2 | code : 6 ]\n\
             }\n\
             block classify(s: Status) {\n\
             \x20 case s of {\n\
             \x20   Ok -> yes()\n\
             \x20   _ -> no()\n\
             \x20 }\n\
             }\n\
             block yes() { return 1 }\n\
             block no() { return 0 }\n",
        );
        let c = prog.find_block("classify").unwrap();
        match &prog.block(c).body {
            Code::Case(_, alts, def) => {
                assert_eq!(alts.len(), 1);
                assert_eq!(prog.cfun(alts[0].0).name, "Ok");
                assert!(def.is_some());
            }
            other => panic!("unexpected body: {:?}", other),
        }
    }

    #[test]
    fn test_parse_tops_and_areas() {
        let prog = parse(
            "area buf[64]\n\
             top answer = add(40, 2)\n\
             top (q, r) = return 1, 2\n\
             block main() { return answer, q }\n",
        );
        assert_eq!(prog.areas.len(), 1);
        assert_eq!(prog.tops.len(), 2);
        let main = prog.find_block("main").unwrap();
        match &prog.block(main).body {
            Code::Done(Tail::Return(atoms)) => {
                assert!(matches!(atoms[0], Atom::Top(t, 0) if prog.top(t).name == "answer"));
                assert!(matches!(atoms[1], Atom::Top(t, 0) if prog.top(t).lhs[0] == "q"));
            }
            other => panic!("unexpected body: {:?}", other),
        }
        // Inferred component types.
        assert_eq!(prog.tops[0].types, vec![Type::Word]);
        assert_eq!(prog.tops[1].types, vec![Type::Word, Type::Word]);
    }

    #[test]
    fn test_parse_closure() {
        let prog = parse(
            "closure adder(n: word | x: word) = add(n, x)\n\
             block main() {\n\
             \x20 k <- clos adder(40)\n\
             \x20 enter k(2)\n\
             }\n",
        );
        assert_eq!(prog.closures.len(), 1);
        let c = &prog.closures[0];
        assert_eq!(c.stored.len(), 1);
        assert_eq!(c.params.len(), 1);
        assert_eq!(c.rtypes, vec![Type::Word]);
        let main = prog.find_block("main").unwrap();
        assert!(matches!(
            &prog.block(main).body,
            Code::Bind(_, Tail::ClosAlloc(..), _)
        ));
    }

    #[test]
    fn test_parse_errors_are_reported() {
        assert!(Parser::new("block main( { }").parse().is_err());
        assert!(Parser::new("block main() { frobnicate(1) }").parse().is_err());
        assert!(Parser::new("junk").parse().is_err());
    }

    #[test]
    fn test_roundtrip_through_printer() {
        let src = "area buf[8]\n\
                   top answer = return 42\n\
                   block main(x: word) {\n\
                   \x20 t <- add(x, answer)\n\
                   \x20 return t\n\
                   }\n";
        let prog = parse(src);
        let printed = crate::display::print_program(&prog);
        let reparsed = Parser::new(&printed).parse().unwrap();
        let b1 = prog.find_block("main").unwrap();
        let b2 = reparsed.find_block("main").unwrap();
        assert!(crate::mil::alpha_code(
            &prog.block(b1).body,
            &prog.block(b1).params,
            &reparsed.block(b2).body,
            &reparsed.block(b2).params,
        ));
    }
}
