//! LC surface language
//!
//! A small functional layer above MIL: variables, literals, applications,
//! lambdas, recursive `let` groups, and conditionals. Kind and type
//! inference happen upstream of this crate; LC terms here are word-typed,
//! with flags arising only from comparison primitives.
//!
//! Concrete syntax:
//! ```text
//! def compose f g x = f (g x)
//!
//! def main =
//!   let double x = mul x 2
//!   and quad x = double (double x)
//!   in quad 4
//! ```
//! `\x -> e` introduces a lambda, `let ... and ... in e` a recursive
//! binding group, and application is juxtaposition. `#` starts a comment.

use std::collections::{BTreeSet, HashMap, HashSet};

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Var(String),
    Lit(i64),
    /// Application of a function expression to arguments
    App(Box<Expr>, Vec<Expr>),
    Lam(Vec<String>, Box<Expr>),
    /// A mutually recursive binding group scoping over the body
    Let(Vec<Binding>, Box<Expr>),
    If(Box<Expr>, Box<Expr>, Box<Expr>),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Binding {
    pub name: String,
    pub expr: Expr,
}

/// A program: named definitions (a single recursive group) ending with a
/// `main` definition.
#[derive(Debug, Clone, PartialEq)]
pub struct LcProgram {
    pub defs: Vec<Binding>,
}

impl Expr {
    /// Free variables, in deterministic (sorted) order.
    pub fn free_vars(&self) -> BTreeSet<String> {
        let mut out = BTreeSet::new();
        let mut bound = HashSet::new();
        self.collect_free(&mut bound, &mut out);
        out
    }

    fn collect_free(&self, bound: &mut HashSet<String>, out: &mut BTreeSet<String>) {
        match self {
            Expr::Var(n) => {
                if !bound.contains(n) {
                    out.insert(n.clone());
                }
            }
            Expr::Lit(_) => {}
            Expr::App(f, args) => {
                f.collect_free(bound, out);
                for a in args {
                    a.collect_free(bound, out);
                }
            }
            Expr::Lam(params, body) => {
                let added: Vec<&String> =
                    params.iter().filter(|p| bound.insert((*p).clone())).collect();
                body.collect_free(bound, out);
                for p in added {
                    bound.remove(p);
                }
            }
            Expr::Let(bindings, body) => {
                let added: Vec<&String> = bindings
                    .iter()
                    .map(|b| &b.name)
                    .filter(|n| bound.insert((*n).clone()))
                    .collect();
                for b in bindings {
                    b.expr.collect_free(bound, out);
                }
                body.collect_free(bound, out);
                for n in added {
                    bound.remove(n);
                }
            }
            Expr::If(c, t, e) => {
                c.collect_free(bound, out);
                t.collect_free(bound, out);
                e.collect_free(bound, out);
            }
        }
    }

    /// Capture-avoiding-enough substitution: the replacement expressions
    /// used by the lifter only mention outer-scope variables, so plain
    /// shadowing respect suffices.
    pub fn substitute(&self, map: &HashMap<String, Expr>) -> Expr {
        if map.is_empty() {
            return self.clone();
        }
        match self {
            Expr::Var(n) => map.get(n).cloned().unwrap_or_else(|| self.clone()),
            Expr::Lit(_) => self.clone(),
            Expr::App(f, args) => Expr::App(
                Box::new(f.substitute(map)),
                args.iter().map(|a| a.substitute(map)).collect(),
            ),
            Expr::Lam(params, body) => {
                let inner = shadowed(map, params.iter());
                Expr::Lam(params.clone(), Box::new(body.substitute(&inner)))
            }
            Expr::Let(bindings, body) => {
                let inner = shadowed(map, bindings.iter().map(|b| &b.name));
                Expr::Let(
                    bindings
                        .iter()
                        .map(|b| Binding {
                            name: b.name.clone(),
                            expr: b.expr.substitute(&inner),
                        })
                        .collect(),
                    Box::new(body.substitute(&inner)),
                )
            }
            Expr::If(c, t, e) => Expr::If(
                Box::new(c.substitute(map)),
                Box::new(t.substitute(map)),
                Box::new(e.substitute(map)),
            ),
        }
    }
}

fn shadowed<'a>(
    map: &HashMap<String, Expr>,
    names: impl Iterator<Item = &'a String>,
) -> HashMap<String, Expr> {
    let mut inner = map.clone();
    for n in names {
        inner.remove(n);
    }
    inner
}

// ---------------------------------------------------------------------------
// Parsing
// ---------------------------------------------------------------------------

pub struct LcParser {
    tokens: Vec<String>,
    pos: usize,
}

const KEYWORDS: &[&str] = &["def", "let", "and", "in", "if", "then", "else"];

impl LcParser {
    pub fn new(source: &str) -> Self {
        LcParser {
            tokens: lc_tokenize(source),
            pos: 0,
        }
    }

    pub fn parse(&mut self) -> Result<LcProgram, String> {
        let mut defs = Vec::new();
        while !self.at_end() {
            defs.push(self.parse_def()?);
        }
        if !defs.iter().any(|d| d.name == "main") {
            return Err("no main definition".to_string());
        }
        Ok(LcProgram { defs })
    }

    fn at_end(&self) -> bool {
        self.pos >= self.tokens.len()
    }

    fn peek(&self) -> &str {
        self.tokens.get(self.pos).map_or("", |s| s.as_str())
    }

    fn bump(&mut self) -> String {
        let t = self.tokens.get(self.pos).cloned().unwrap_or_default();
        self.pos += 1;
        t
    }

    fn expect(&mut self, tok: &str) -> Result<(), String> {
        let t = self.bump();
        if t == tok {
            Ok(())
        } else {
            Err(format!("expected '{}', found '{}'", tok, t))
        }
    }

    fn ident(&mut self) -> Result<String, String> {
        let t = self.bump();
        if is_lc_ident(&t) {
            Ok(t)
        } else {
            Err(format!("expected an identifier, found '{}'", t))
        }
    }

    fn parse_def(&mut self) -> Result<Binding, String> {
        self.expect("def")?;
        self.parse_binding()
    }

    /// `name params... = expr`, with parameters sugaring to a lambda.
    fn parse_binding(&mut self) -> Result<Binding, String> {
        let name = self.ident()?;
        let mut params = Vec::new();
        while is_lc_ident(self.peek()) {
            params.push(self.bump());
        }
        self.expect("=")?;
        let body = self.parse_expr()?;
        let expr = if params.is_empty() {
            body
        } else {
            Expr::Lam(params, Box::new(body))
        };
        Ok(Binding { name, expr })
    }

    fn parse_expr(&mut self) -> Result<Expr, String> {
        match self.peek() {
            "\\" => {
                self.bump();
                let mut params = vec![self.ident()?];
                while is_lc_ident(self.peek()) {
                    params.push(self.bump());
                }
                self.expect("->")?;
                let body = self.parse_expr()?;
                Ok(Expr::Lam(params, Box::new(body)))
            }
            "let" => {
                self.bump();
                let mut bindings = vec![self.parse_binding()?];
                while self.peek() == "and" {
                    self.bump();
                    bindings.push(self.parse_binding()?);
                }
                self.expect("in")?;
                let body = self.parse_expr()?;
                Ok(Expr::Let(bindings, Box::new(body)))
            }
            "if" => {
                self.bump();
                let c = self.parse_expr()?;
                self.expect("then")?;
                let t = self.parse_expr()?;
                self.expect("else")?;
                let e = self.parse_expr()?;
                Ok(Expr::If(Box::new(c), Box::new(t), Box::new(e)))
            }
            _ => self.parse_app(),
        }
    }

    /// Juxtaposition application, left-associated into one `App`.
    fn parse_app(&mut self) -> Result<Expr, String> {
        let head = self.parse_atom()?;
        let mut args = Vec::new();
        while self.at_atom() {
            args.push(self.parse_atom()?);
        }
        if args.is_empty() {
            Ok(head)
        } else {
            Ok(Expr::App(Box::new(head), args))
        }
    }

    fn at_atom(&self) -> bool {
        let t = self.peek();
        t == "(" || is_lc_ident(t) || t.parse::<i64>().is_ok()
    }

    fn parse_atom(&mut self) -> Result<Expr, String> {
        let t = self.bump();
        if t == "(" {
            let e = self.parse_expr()?;
            self.expect(")")?;
            return Ok(e);
        }
        if let Ok(i) = t.parse::<i64>() {
            return Ok(Expr::Lit(i));
        }
        if is_lc_ident(&t) {
            return Ok(Expr::Var(t));
        }
        Err(format!("expected an expression, found '{}'", t))
    }
}

fn is_lc_ident(s: &str) -> bool {
    let mut chars = s.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
        && !KEYWORDS.contains(&s)
}

fn lc_tokenize(source: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    for line in source.lines() {
        let mut chars = line.chars().peekable();
        let mut buf = String::new();
        while let Some(c) = chars.next() {
            match c {
                '#' => break,
                c if c.is_whitespace() => {
                    if !buf.is_empty() {
                        tokens.push(std::mem::take(&mut buf));
                    }
                }
                '(' | ')' | '\\' | '=' => {
                    if !buf.is_empty() {
                        tokens.push(std::mem::take(&mut buf));
                    }
                    tokens.push(c.to_string());
                }
                '-' if chars.peek() == Some(&'>') => {
                    chars.next();
                    if !buf.is_empty() {
                        tokens.push(std::mem::take(&mut buf));
                    }
                    tokens.push("->".to_string());
                }
                _ => buf.push(c),
            }
        }
        if !buf.is_empty() {
            tokens.push(buf);
        }
    }
    tokens
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(src: &str) -> LcProgram {
        LcParser::new(src).parse().unwrap()
    }

    #[test]
    fn test_parse_def_with_params() {
        let p = parse("def inc x = add x 1\ndef main = inc 41\n");
        assert_eq!(p.defs.len(), 2);
        match &p.defs[0].expr {
            Expr::Lam(params, body) => {
                assert_eq!(params, &["x".to_string()]);
                assert!(matches!(body.as_ref(), Expr::App(..)));
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_parse_let_group_and_if() {
        let p = parse(
            "def main =\n\
             \x20 let even n = if primEq n 0 then 1 else odd (sub n 1)\n\
             \x20 and odd n = if primEq n 0 then 0 else even (sub n 1)\n\
             \x20 in even 10\n",
        );
        match &p.defs[0].expr {
            Expr::Let(bindings, body) => {
                assert_eq!(bindings.len(), 2);
                assert_eq!(bindings[0].name, "even");
                assert_eq!(bindings[1].name, "odd");
                assert!(matches!(body.as_ref(), Expr::App(..)));
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_parse_lambda() {
        let p = parse("def main = (\\x y -> add x y) 1 2\n");
        match &p.defs[0].expr {
            Expr::App(f, args) => {
                assert!(matches!(f.as_ref(), Expr::Lam(params, _) if params.len() == 2));
                assert_eq!(args.len(), 2);
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_free_vars() {
        let p = parse("def main = let f x = add x y in f z\n");
        let free = p.defs[0].expr.free_vars();
        assert!(free.contains("add"));
        assert!(free.contains("y"));
        assert!(free.contains("z"));
        assert!(!free.contains("f"));
        assert!(!free.contains("x"));
    }

    #[test]
    fn test_substitute_respects_shadowing() {
        let mut map = HashMap::new();
        map.insert("x".to_string(), Expr::Lit(7));
        let e = LcParser::new("def main = add x (let x = 1 in x)\n")
            .parse()
            .unwrap()
            .defs[0]
            .expr
            .clone();
        let s = e.substitute(&map);
        match s {
            Expr::App(_, args) => {
                assert_eq!(args[0], Expr::Lit(7));
                // The let-bound x is untouched.
                match &args[1] {
                    Expr::Let(_, body) => assert_eq!(body.as_ref(), &Expr::Var("x".to_string())),
                    other => panic!("unexpected: {:?}", other),
                }
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_missing_main_rejected() {
        assert!(LcParser::new("def f x = x\n").parse().is_err());
    }
}
