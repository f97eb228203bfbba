//! Lambda lifting
//!
//! Rewrites nested and mutually recursive local bindings into top-level
//! supercombinators taking their captured free variables as extra leading
//! parameters. Binding groups are split into strongly connected
//! components first; components are processed in dependency order, so by
//! the time a group is lifted, every binding it refers to has already
//! been replaced by an application of its new top-level to its extra
//! variables, and the extra-variable sets close transitively through
//! plain free-variable analysis.
//!
//! Value bindings (non-lambdas) are left in place when non-recursive;
//! a recursive value binding has no lifted form and is an error.

use crate::lc::{Binding, Expr, LcProgram};
use std::collections::{HashMap, HashSet};

/// A lifted definition: zero parameters means a once-evaluated value.
#[derive(Debug, Clone, PartialEq)]
pub struct Super {
    pub name: String,
    pub params: Vec<String>,
    pub body: Expr,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LiftedProgram {
    pub supers: Vec<Super>,
}

pub fn lift_program(prog: &LcProgram, known_globals: &[String]) -> Result<LiftedProgram, String> {
    let mut lifter = Lifter {
        globals: known_globals.iter().cloned().collect(),
        supers: Vec::new(),
        counter: 0,
    };
    for def in &prog.defs {
        lifter.globals.insert(def.name.clone());
    }
    for def in &prog.defs {
        let (params, body) = match &def.expr {
            Expr::Lam(params, body) => (params.clone(), body.as_ref().clone()),
            other => (Vec::new(), other.clone()),
        };
        let body = lifter.lift_expr(&body, &HashMap::new())?;
        lifter.supers.push(Super {
            name: def.name.clone(),
            params,
            body,
        });
    }
    Ok(LiftedProgram {
        supers: lifter.supers,
    })
}

/// Pass-through used when lifting is disabled: definitions become supers
/// unchanged. Nested lambdas then surface as lowering errors.
pub fn skip_lift(prog: &LcProgram) -> LiftedProgram {
    let supers = prog
        .defs
        .iter()
        .map(|def| match &def.expr {
            Expr::Lam(params, body) => Super {
                name: def.name.clone(),
                params: params.clone(),
                body: body.as_ref().clone(),
            },
            other => Super {
                name: def.name.clone(),
                params: Vec::new(),
                body: other.clone(),
            },
        })
        .collect();
    LiftedProgram { supers }
}

struct Lifter {
    globals: HashSet<String>,
    supers: Vec<Super>,
    counter: usize,
}

impl Lifter {
    fn fresh_name(&mut self, stem: &str) -> String {
        loop {
            self.counter += 1;
            let name = format!("{}_{}", stem, self.counter);
            if !self.globals.contains(&name) {
                self.globals.insert(name.clone());
                return name;
            }
        }
    }

    /// The application of a lifted name to its extra variables (or the
    /// bare name when nothing is captured).
    fn lifted_call(name: &str, extras: &[String]) -> Expr {
        if extras.is_empty() {
            Expr::Var(name.to_string())
        } else {
            Expr::App(
                Box::new(Expr::Var(name.to_string())),
                extras.iter().map(|e| Expr::Var(e.clone())).collect(),
            )
        }
    }

    fn lift_expr(&mut self, e: &Expr, subst: &HashMap<String, Expr>) -> Result<Expr, String> {
        match e {
            Expr::Var(_) | Expr::Lit(_) => Ok(e.substitute(subst)),
            Expr::App(f, args) => Ok(Expr::App(
                Box::new(self.lift_expr(f, subst)?),
                args.iter()
                    .map(|a| self.lift_expr(a, subst))
                    .collect::<Result<_, _>>()?,
            )),
            Expr::If(c, t, el) => Ok(Expr::If(
                Box::new(self.lift_expr(c, subst)?),
                Box::new(self.lift_expr(t, subst)?),
                Box::new(self.lift_expr(el, subst)?),
            )),
            Expr::Lam(params, body) => {
                // An anonymous lambda is a one-binding group of its own.
                let inner = without(subst, params.iter());
                let body = self.lift_expr(body, &inner)?;
                let lam = Expr::Lam(params.clone(), Box::new(body));
                let extras: Vec<String> = lam
                    .free_vars()
                    .into_iter()
                    .filter(|v| !self.globals.contains(v))
                    .collect();
                let name = self.fresh_name("lam");
                let Expr::Lam(params, body) = lam else {
                    unreachable!()
                };
                let mut all_params = extras.clone();
                all_params.extend(params);
                self.supers.push(Super {
                    name: name.clone(),
                    params: all_params,
                    body: *body,
                });
                Ok(Self::lifted_call(&name, &extras))
            }
            Expr::Let(bindings, body) => self.lift_let(bindings, body, subst),
        }
    }

    fn lift_let(
        &mut self,
        bindings: &[Binding],
        body: &Expr,
        subst: &HashMap<String, Expr>,
    ) -> Result<Expr, String> {
        let names: Vec<String> = bindings.iter().map(|b| b.name.clone()).collect();
        // Outer substitutions for the lifted siblings do not apply to the
        // shadowing group names.
        let subst = without(subst, names.iter());

        // Components in dependency order: a group is emitted only after
        // everything it refers to.
        let sccs = binding_sccs(bindings);

        let mut subst = subst;
        let mut residual: Vec<Binding> = Vec::new();
        for group in sccs {
            let group_bindings: Vec<&Binding> =
                group.iter().map(|&i| &bindings[i]).collect();
            let group_names: HashSet<&String> =
                group_bindings.iter().map(|b| &b.name).collect();
            let is_lambda_group = group_bindings
                .iter()
                .all(|b| matches!(b.expr, Expr::Lam(..)));
            let recursive = group.len() > 1
                || group_bindings[0]
                    .expr
                    .free_vars()
                    .contains(&group_bindings[0].name);

            if !is_lambda_group {
                if recursive {
                    return Err(format!(
                        "recursive value binding '{}' cannot be lifted",
                        group_bindings[0].name
                    ));
                }
                // A plain value stays as a residual local binding.
                let lifted = self.lift_expr(&group_bindings[0].expr, &subst)?;
                residual.push(Binding {
                    name: group_bindings[0].name.clone(),
                    expr: lifted,
                });
                continue;
            }

            // Extra variables: free variables of the group after the
            // outer substitution, minus the group itself and globals.
            // Substituting first is what closes the set across earlier
            // liftings; residual locals in view are captured like any
            // other outer name.
            let mut extras: Vec<String> = Vec::new();
            for b in &group_bindings {
                for v in b.expr.substitute(&subst).free_vars() {
                    if !self.globals.contains(&v)
                        && !group_names.contains(&v)
                        && !extras.contains(&v)
                    {
                        extras.push(v);
                    }
                }
            }
            extras.sort();

            // Record the liftings, then rewrite each body so co-recursive
            // occurrences call the new top-levels.
            let mut new_names: HashMap<String, String> = HashMap::new();
            for b in &group_bindings {
                let top = if self.globals.contains(&b.name) {
                    self.fresh_name(&b.name)
                } else {
                    self.globals.insert(b.name.clone());
                    b.name.clone()
                };
                new_names.insert(b.name.clone(), top);
            }
            let mut group_subst = subst.clone();
            for (orig, top) in &new_names {
                group_subst.insert(orig.clone(), Self::lifted_call(top, &extras));
            }
            for b in &group_bindings {
                let Expr::Lam(params, lam_body) = &b.expr else {
                    unreachable!()
                };
                let inner = without(&group_subst, params.iter());
                let lifted_body = self.lift_expr(lam_body, &inner)?;
                let mut all_params = extras.clone();
                all_params.extend(params.iter().cloned());
                self.supers.push(Super {
                    name: new_names[&b.name].clone(),
                    params: all_params,
                    body: lifted_body,
                });
            }
            for (orig, top) in &new_names {
                subst.insert(orig.clone(), Self::lifted_call(top, &extras));
            }
        }

        let body = self.lift_expr(body, &subst)?;
        Ok(residual
            .into_iter()
            .rev()
            .fold(body, |acc, b| Expr::Let(vec![b], Box::new(acc))))
    }
}

fn without<'a>(
    map: &HashMap<String, Expr>,
    names: impl Iterator<Item = &'a String>,
) -> HashMap<String, Expr> {
    let mut out = map.clone();
    for n in names {
        out.remove(n);
    }
    out
}

/// Strongly connected components of a binding group, via Tarjan's
/// algorithm, emitted with referenced components before referencing ones.
fn binding_sccs(bindings: &[Binding]) -> Vec<Vec<usize>> {
    let index_of: HashMap<&str, usize> = bindings
        .iter()
        .enumerate()
        .map(|(i, b)| (b.name.as_str(), i))
        .collect();
    let edges: Vec<Vec<usize>> = bindings
        .iter()
        .map(|b| {
            b.expr
                .free_vars()
                .iter()
                .filter_map(|v| index_of.get(v.as_str()).copied())
                .collect()
        })
        .collect();

    struct State {
        index_counter: usize,
        stack: Vec<usize>,
        on_stack: Vec<bool>,
        indices: Vec<Option<usize>>,
        lowlinks: Vec<usize>,
        sccs: Vec<Vec<usize>>,
    }

    fn visit(v: usize, edges: &[Vec<usize>], st: &mut State) {
        let index = st.index_counter;
        st.index_counter += 1;
        st.indices[v] = Some(index);
        st.lowlinks[v] = index;
        st.stack.push(v);
        st.on_stack[v] = true;

        for &w in &edges[v] {
            if st.indices[w].is_none() {
                visit(w, edges, st);
                st.lowlinks[v] = st.lowlinks[v].min(st.lowlinks[w]);
            } else if st.on_stack[w] {
                st.lowlinks[v] = st.lowlinks[v].min(st.indices[w].unwrap());
            }
        }

        if Some(st.lowlinks[v]) == st.indices[v] {
            let mut scc = Vec::new();
            loop {
                let w = st.stack.pop().unwrap();
                st.on_stack[w] = false;
                scc.push(w);
                if w == v {
                    break;
                }
            }
            scc.sort_unstable();
            st.sccs.push(scc);
        }
    }

    let n = bindings.len();
    let mut st = State {
        index_counter: 0,
        stack: Vec::new(),
        on_stack: vec![false; n],
        indices: vec![None; n],
        lowlinks: vec![0; n],
        sccs: Vec::new(),
    };
    for v in 0..n {
        if st.indices[v].is_none() {
            visit(v, &edges, &mut st);
        }
    }
    st.sccs
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lc::LcParser;

    fn lift(src: &str) -> LiftedProgram {
        let prog = LcParser::new(src).parse().unwrap();
        lift_program(&prog, &["add".into(), "sub".into(), "mul".into(), "primEq".into()])
            .unwrap()
    }

    fn find<'a>(p: &'a LiftedProgram, name: &str) -> &'a Super {
        p.supers.iter().find(|s| s.name == name).unwrap()
    }

    #[test]
    fn test_simple_capture() {
        // double captures nothing; addTo captures its outer parameter.
        let p = lift(
            "def addTo n =\n\
             \x20 let bump x = add x n\n\
             \x20 in bump 1\n\
             def main = addTo 41\n",
        );
        let bump = find(&p, "bump");
        assert_eq!(bump.params, vec!["n".to_string(), "x".to_string()]);
        // The body of addTo now applies bump to its extra variable.
        let add_to = find(&p, "addTo");
        assert_eq!(
            add_to.body,
            Expr::App(
                Box::new(Expr::App(
                    Box::new(Expr::Var("bump".into())),
                    vec![Expr::Var("n".into())]
                )),
                vec![Expr::Lit(1)]
            )
        );
    }

    #[test]
    fn test_mutual_recursion_shares_extras() {
        let p = lift(
            "def parity k =\n\
             \x20 let even n = if primEq n 0 then k else odd (sub n 1)\n\
             \x20 and odd n = if primEq n 0 then 0 else even (sub n 1)\n\
             \x20 in even 4\n\
             def main = parity 1\n",
        );
        let even = find(&p, "even");
        let odd = find(&p, "odd");
        // Both members of the cycle take the captured k first.
        assert_eq!(even.params, vec!["k".to_string(), "n".to_string()]);
        assert_eq!(odd.params, vec!["k".to_string(), "n".to_string()]);
        // Co-recursive occurrences apply the lifted name to the extras.
        let body = format!("{:?}", odd.body);
        assert!(body.contains("Var(\"even\")"), "{}", body);
        assert!(body.contains("Var(\"k\")"), "{}", body);
    }

    #[test]
    fn test_transitive_capture_through_lifting() {
        // inner refers to outer, which captures a; inner's extras must
        // close over a as well.
        let p = lift(
            "def f a =\n\
             \x20 let outer x = add x a\n\
             \x20 in let inner y = outer y\n\
             \x20 in inner 1\n\
             def main = f 2\n",
        );
        let inner = find(&p, "inner");
        assert_eq!(inner.params, vec!["a".to_string(), "y".to_string()]);
    }

    #[test]
    fn test_anonymous_lambda_lifted() {
        let p = lift("def main = (\\x -> add x 1) 41\n");
        let lam = p
            .supers
            .iter()
            .find(|s| s.name.starts_with("lam_"))
            .unwrap();
        assert_eq!(lam.params, vec!["x".to_string()]);
    }

    #[test]
    fn test_value_bindings_stay_residual() {
        let p = lift(
            "def main =\n\
             \x20 let base = add 1 2\n\
             \x20 in let scaled x = mul x base\n\
             \x20 in scaled 3\n",
        );
        // base stays a local value; scaled captures it.
        let scaled = find(&p, "scaled");
        assert_eq!(scaled.params, vec!["base".to_string(), "x".to_string()]);
        let main = find(&p, "main");
        assert!(matches!(main.body, Expr::Let(..)));
    }

    #[test]
    fn test_recursive_value_binding_rejected() {
        let prog = LcParser::new("def main = let x = add x 1 in x\n")
            .parse()
            .unwrap();
        let err = lift_program(&prog, &["add".into()]).unwrap_err();
        assert!(err.contains("recursive value binding"), "{}", err);
    }

    #[test]
    fn test_no_lambdas_survive() {
        let p = lift(
            "def twice f x = f (f x)\n\
             def main = twice (\\y -> mul y 3) 2\n",
        );
        fn has_lam(e: &Expr) -> bool {
            match e {
                Expr::Lam(..) => true,
                Expr::App(f, args) => has_lam(f) || args.iter().any(has_lam),
                Expr::If(c, t, e) => has_lam(c) || has_lam(t) || has_lam(e),
                Expr::Let(bs, b) => bs.iter().any(|x| has_lam(&x.expr)) || has_lam(b),
                _ => false,
            }
        }
        for s in &p.supers {
            assert!(!has_lam(&s.body), "lambda survived in {}", s.name);
        }
    }
}
