//! Factory-string front end.
//!
//! Parses the compact workspace syntax into a [`ModelSpec`]:
//!
//! ```text
//! Gaussian::gpdf(x[0,20], m1[10,0,20], s1[2,0.1,10])
//! Exponential::epdf(x, rate[0.1,0.001,1])
//! SUM::model(ns[2000,0,1e6]*gpdf, nb[8000,0,1e6]*epdf)
//! ```
//!
//! Statements may be separated by `;` or whitespace. Inline declarations are
//! `name[lo,hi]` (observable range, or a free parameter starting at the
//! midpoint), `name[value,lo,hi]` (free parameter) and `name[value]`
//! (constant). A bare name refers to a declaration made anywhere in the
//! string; unresolved names are left for [`crate::ModelBuilder`] to reject.
//! `SUM` builds an extended sum whose coefficients are yields. Only the root
//! may be extended, so a `SUM` nested inside another is rejected at build time.

use crate::spec::{
    ModelSpec, NodeKindSpec, NodeSpec, ObservableSpec, ParameterSpec, SumTermSpec,
};
use vf_core::{Error, Result};

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Ident(String),
    Number(f64),
    Sym(char),
    Scope,
}

fn factory_err(msg: impl std::fmt::Display) -> Error {
    Error::Validation(format!("factory: {msg}"))
}

fn tokenize(src: &str) -> Result<Vec<Token>> {
    let chars: Vec<char> = src.chars().collect();
    let mut out = Vec::new();
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        let starts_number = c.is_ascii_digit()
            || c == '.'
            || ((c == '-' || c == '+')
                && chars.get(i + 1).is_some_and(|n| n.is_ascii_digit() || *n == '.'));
        if c.is_whitespace() {
            i += 1;
        } else if c.is_ascii_alphabetic() || c == '_' {
            let start = i;
            while i < chars.len() && (chars[i].is_ascii_alphanumeric() || chars[i] == '_') {
                i += 1;
            }
            out.push(Token::Ident(chars[start..i].iter().collect()));
        } else if starts_number {
            let start = i;
            i += 1;
            while i < chars.len() {
                let d = chars[i];
                let exp_sign = (d == '-' || d == '+') && matches!(chars[i - 1], 'e' | 'E');
                if d.is_ascii_digit() || d == '.' || d == 'e' || d == 'E' || exp_sign {
                    i += 1;
                } else {
                    break;
                }
            }
            let text: String = chars[start..i].iter().collect();
            let v = text.parse::<f64>().map_err(|_| factory_err(format!("bad number '{text}'")))?;
            out.push(Token::Number(v));
        } else if c == ':' && chars.get(i + 1) == Some(&':') {
            out.push(Token::Scope);
            i += 2;
        } else if "()[]{},*;".contains(c) {
            out.push(Token::Sym(c));
            i += 1;
        } else {
            return Err(factory_err(format!("unexpected character '{c}' at offset {i}")));
        }
    }
    Ok(out)
}

/// One argument: a name with an optional inline range, or a literal.
#[derive(Debug, Clone)]
enum Term {
    Name { name: String, decl: Option<Vec<f64>> },
    Literal(f64),
}

#[derive(Debug, Clone)]
enum Arg {
    Single(Term),
    Product(Term, Term),
    List(Vec<Arg>),
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
    spec: ModelSpec,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<Token> {
        let t = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        t
    }

    fn expect_sym(&mut self, c: char) -> Result<()> {
        match self.next() {
            Some(Token::Sym(s)) if s == c => Ok(()),
            other => Err(factory_err(format!("expected '{c}', found {other:?}"))),
        }
    }

    fn ident(&mut self) -> Result<String> {
        match self.next() {
            Some(Token::Ident(s)) => Ok(s),
            other => Err(factory_err(format!("expected identifier, found {other:?}"))),
        }
    }

    fn term(&mut self) -> Result<Term> {
        match self.next() {
            Some(Token::Number(v)) => Ok(Term::Literal(v)),
            Some(Token::Ident(name)) => {
                if self.peek() != Some(&Token::Sym('[')) {
                    return Ok(Term::Name { name, decl: None });
                }
                self.pos += 1;
                let mut nums = Vec::new();
                loop {
                    match self.next() {
                        Some(Token::Number(v)) => nums.push(v),
                        other => {
                            return Err(factory_err(format!(
                                "expected number in '{name}[...]', found {other:?}"
                            )));
                        }
                    }
                    match self.next() {
                        Some(Token::Sym(',')) => continue,
                        Some(Token::Sym(']')) => break,
                        other => {
                            return Err(factory_err(format!(
                                "expected ',' or ']' in '{name}[...]', found {other:?}"
                            )));
                        }
                    }
                }
                if nums.len() > 3 {
                    return Err(factory_err(format!("'{name}' declares {} numbers", nums.len())));
                }
                Ok(Term::Name { name, decl: Some(nums) })
            }
            other => Err(factory_err(format!("expected argument, found {other:?}"))),
        }
    }

    fn arg(&mut self) -> Result<Arg> {
        if self.peek() == Some(&Token::Sym('{')) {
            self.pos += 1;
            let mut items = Vec::new();
            if self.peek() == Some(&Token::Sym('}')) {
                self.pos += 1;
                return Ok(Arg::List(items));
            }
            loop {
                items.push(self.arg()?);
                match self.next() {
                    Some(Token::Sym(',')) => continue,
                    Some(Token::Sym('}')) => return Ok(Arg::List(items)),
                    other => return Err(factory_err(format!("expected ',' or '}}', found {other:?}"))),
                }
            }
        }
        let first = self.term()?;
        if self.peek() == Some(&Token::Sym('*')) {
            self.pos += 1;
            let second = self.term()?;
            return Ok(Arg::Product(first, second));
        }
        Ok(Arg::Single(first))
    }

    fn statement(&mut self) -> Result<()> {
        let kind = self.ident()?;
        match self.next() {
            Some(Token::Scope) => {}
            other => return Err(factory_err(format!("expected '::' after '{kind}', found {other:?}"))),
        }
        let name = self.ident()?;
        self.expect_sym('(')?;
        let mut args = Vec::new();
        if self.peek() != Some(&Token::Sym(')')) {
            loop {
                args.push(self.arg()?);
                match self.next() {
                    Some(Token::Sym(',')) => continue,
                    Some(Token::Sym(')')) => break,
                    other => {
                        return Err(factory_err(format!(
                            "expected ',' or ')' in '{name}', found {other:?}"
                        )));
                    }
                }
            }
        } else {
            self.pos += 1;
        }
        if self.peek() == Some(&Token::Sym(';')) {
            self.pos += 1;
        }
        self.node(&kind, name, args)
    }

    fn declare_observable(&mut self, term: Term, node: &str) -> Result<String> {
        match term {
            Term::Name { name, decl: None } => Ok(name),
            Term::Name { name, decl: Some(nums) } => {
                let bounds = match nums.as_slice() {
                    [lo, hi] | [_, lo, hi] => (*lo, *hi),
                    _ => {
                        return Err(factory_err(format!(
                            "observable '{name}' in '{node}' needs [lo,hi]"
                        )));
                    }
                };
                self.spec.observables.push(ObservableSpec { name: name.clone(), bounds });
                Ok(name)
            }
            Term::Literal(v) => Err(factory_err(format!("'{node}': observable cannot be {v}"))),
        }
    }

    fn declare_parameter(&mut self, term: Term, node: &str, position: usize) -> Result<String> {
        match term {
            Term::Name { name, decl: None } => Ok(name),
            Term::Name { name, decl: Some(nums) } => {
                let (value, bounds) = match nums.as_slice() {
                    [v] => (*v, None),
                    [lo, hi] => (0.5 * (lo + hi), Some((*lo, *hi))),
                    [v, lo, hi] => (*v, Some((*lo, *hi))),
                    _ => return Err(factory_err(format!("'{name}' has an empty declaration"))),
                };
                self.spec.parameters.push(ParameterSpec { name: name.clone(), value, bounds });
                Ok(name)
            }
            Term::Literal(value) => {
                let name = format!("{node}_c{position}");
                self.spec.parameters.push(ParameterSpec { name: name.clone(), value, bounds: None });
                Ok(name)
            }
        }
    }

    fn scalar_params(&mut self, args: Vec<Arg>, node: &str) -> Result<Vec<String>> {
        let mut flat = Vec::new();
        for a in args {
            match a {
                Arg::Single(t) => flat.push(t),
                Arg::List(items) => {
                    for item in items {
                        match item {
                            Arg::Single(t) => flat.push(t),
                            _ => return Err(factory_err(format!("'{node}': nested lists"))),
                        }
                    }
                }
                Arg::Product(..) => {
                    return Err(factory_err(format!("'{node}': products are only valid in SUM")));
                }
            }
        }
        flat.into_iter().enumerate().map(|(i, t)| self.declare_parameter(t, node, i)).collect()
    }

    fn node(&mut self, kind: &str, name: String, mut args: Vec<Arg>) -> Result<()> {
        let kind_lc = kind.to_ascii_lowercase();
        let body = if kind_lc == "sum" {
            let mut terms = Vec::with_capacity(args.len());
            for (i, a) in args.into_iter().enumerate() {
                let Arg::Product(coef, child) = a else {
                    return Err(factory_err(format!("SUM '{name}' expects coef*pdf terms")));
                };
                let coefficient = self.declare_parameter(coef, &name, i)?;
                let node = match child {
                    Term::Name { name, decl: None } => name,
                    _ => return Err(factory_err(format!("SUM '{name}': term {i} is not a pdf"))),
                };
                terms.push(SumTermSpec { coefficient, node });
            }
            NodeKindSpec::Sum { terms, extended: true }
        } else {
            if args.is_empty() {
                return Err(factory_err(format!("'{name}' has no observable")));
            }
            let observable = match args.remove(0) {
                Arg::Single(t) => self.declare_observable(t, &name)?,
                _ => return Err(factory_err(format!("'{name}': first argument must be observable"))),
            };
            let mut p = self.scalar_params(args, &name)?;
            let arity = |n: usize, p: &Vec<String>| -> Result<()> {
                if p.len() == n {
                    Ok(())
                } else {
                    Err(factory_err(format!("{kind}::{name} takes {n} parameters, got {}", p.len())))
                }
            };
            match kind_lc.as_str() {
                "gaussian" => {
                    arity(2, &p)?;
                    let sigma = p.remove(1);
                    NodeKindSpec::Gaussian { observable, mean: p.remove(0), sigma }
                }
                "exponential" => {
                    arity(1, &p)?;
                    NodeKindSpec::Exponential { observable, rate: p.remove(0) }
                }
                "polynomial" => NodeKindSpec::Polynomial { observable, coefficients: p },
                "gamma" => {
                    arity(3, &p)?;
                    let mu = p.remove(2);
                    let beta = p.remove(1);
                    NodeKindSpec::Gamma { observable, gamma: p.remove(0), beta, mu }
                }
                _ => return Err(factory_err(format!("unknown pdf kind '{kind}'"))),
            }
        };
        self.spec.nodes.push(NodeSpec { name, kind: body });
        Ok(())
    }
}

/// Parse one or more factory statements into a spec. The last statement is the root.
pub fn parse(src: &str) -> Result<ModelSpec> {
    parse_into(ModelSpec::default(), src)
}

/// Append the statements in `src` to an existing spec.
pub fn parse_into(spec: ModelSpec, src: &str) -> Result<ModelSpec> {
    let mut parser = Parser { tokens: tokenize(src)?, pos: 0, spec };
    while parser.peek().is_some() {
        if parser.peek() == Some(&Token::Sym(';')) {
            parser.pos += 1;
            continue;
        }
        parser.statement()?;
    }
    parser.spec.root = parser.spec.nodes.last().map(|n| n.name.clone());
    Ok(parser.spec)
}
