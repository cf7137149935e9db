//! Prerequisite & Output: boolean expressions over task outputs.
//!
//! Grounded in `original_source/lib/cylc/prerequisites/prerequisites.py`
//! (`all_satisfied`, `satisfy_me`, `get_satisfied_by`, `dump`,
//! `get_target_points`) and in `knhk-workflow-engine/src/patterns.rs`'s
//! expression-registry idiom for the boolean tree itself.

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::cycle::{CyclePoint, Interval};
use crate::error::{SchedulerError, SchedulerResult};

/// Something a `TaskDefinition` registry can answer about task/output
/// existence, without `prerequisite.rs` depending on the registry type.
pub trait OutputValidator {
    fn task_exists(&self, task_name: &str) -> bool;
    fn output_exists(&self, task_name: &str, output: &str) -> bool;
}

/// A single `<task-name>[<offset>]:<output-name>` reference.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Atom {
    pub task_name: String,
    pub offset: Option<Interval>,
    pub output: String,
}

impl fmt::Display for Atom {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.offset {
            Some(off) if !off.is_zero() => write!(f, "{}[{}]:{}", self.task_name, off, self.output),
            _ => write!(f, "{}:{}", self.task_name, self.output),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct AtomState {
    atom: Atom,
    target_point: CyclePoint,
    satisfied: bool,
    satisfied_by: Option<String>,
}

/// A boolean expression tree over atom indices into `Prerequisite::atoms`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Expr {
    Atom(usize),
    And(Vec<Expr>),
    Or(Vec<Expr>),
}

impl Expr {
    /// Flatten nested same-kind combinators and drop single-child wrappers.
    /// `a & (b & c)` becomes `a & b & c`; `And(vec![x])` becomes `x`.
    pub fn simplify(self) -> Expr {
        match self {
            Expr::Atom(i) => Expr::Atom(i),
            Expr::And(children) => {
                let mut flat = Vec::new();
                for c in children {
                    match c.simplify() {
                        Expr::And(inner) => flat.extend(inner),
                        other => flat.push(other),
                    }
                }
                if flat.len() == 1 {
                    flat.pop().unwrap()
                } else {
                    Expr::And(flat)
                }
            }
            Expr::Or(children) => {
                let mut flat = Vec::new();
                for c in children {
                    match c.simplify() {
                        Expr::Or(inner) => flat.extend(inner),
                        other => flat.push(other),
                    }
                }
                if flat.len() == 1 {
                    flat.pop().unwrap()
                } else {
                    Expr::Or(flat)
                }
            }
        }
    }

    fn eval(&self, atoms: &[AtomState]) -> bool {
        match self {
            Expr::Atom(i) => atoms[*i].satisfied,
            Expr::And(children) => children.iter().all(|c| c.eval(atoms)),
            Expr::Or(children) => children.iter().any(|c| c.eval(atoms)),
        }
    }
}

/// A parsed, stateful prerequisite for one TaskProxy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Prerequisite {
    expr: Expr,
    atoms: Vec<AtomState>,
}

impl Prerequisite {
    /// Parse a graph-style dependency expression (`&`/`|`, left-to-right with
    /// `&` binding tighter, optional parens) relative to `base_point`, then
    /// elide any atom whose resolved target point precedes `icp` (a point
    /// that cannot exist is trivially satisfied — it will never run).
    pub fn parse(
        text: &str,
        base_point: &CyclePoint,
        icp: Option<&CyclePoint>,
        validator: &dyn OutputValidator,
    ) -> SchedulerResult<Self> {
        let mut parser = ExprParser {
            tokens: tokenize(text),
            pos: 0,
            base_point,
            validator,
            atoms: Vec::new(),
        };
        let expr = parser.parse_or()?;
        if parser.pos != parser.tokens.len() {
            return Err(SchedulerError::Input(format!(
                "trailing tokens in prerequisite expression: {text}"
            )));
        }
        let mut atoms = parser.atoms;
        if let Some(icp) = icp {
            for a in &mut atoms {
                if a.target_point.compare(icp)? == std::cmp::Ordering::Less {
                    a.satisfied = true;
                    a.satisfied_by = Some("(pre-initial)".to_string());
                }
            }
        }
        Ok(Prerequisite {
            expr: expr.simplify(),
            atoms,
        })
    }

    pub fn all_satisfied(&self) -> bool {
        self.expr.eval(&self.atoms)
    }

    /// Mark every atom matching `(task_name, point, output)` as satisfied.
    /// Returns whether any atom matched; an unmatched message is not an
    /// error (the proxy may simply not depend on that output).
    pub fn satisfy(&mut self, task_name: &str, point: &CyclePoint, output: &str, completer_id: &str) -> bool {
        let mut matched = false;
        for a in &mut self.atoms {
            if a.atom.task_name == task_name
                && a.atom.output == output
                && a.target_point.compare(point).map(|o| o == std::cmp::Ordering::Equal).unwrap_or(false)
            {
                a.satisfied = true;
                a.satisfied_by = Some(completer_id.to_string());
                matched = true;
            }
        }
        matched
    }

    pub fn satisfied_by(&self) -> HashMap<String, String> {
        self.atoms
            .iter()
            .filter_map(|a| a.satisfied_by.clone().map(|by| (a.atom.to_string(), by)))
            .collect()
    }

    pub fn dump(&self) -> Vec<String> {
        self.atoms
            .iter()
            .map(|a| {
                format!(
                    "{} {}",
                    a.atom,
                    if a.satisfied { "satisfied" } else { "unsatisfied" }
                )
            })
            .collect()
    }

    pub fn target_points(&self) -> Vec<CyclePoint> {
        self.atoms.iter().map(|a| a.target_point).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.atoms.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Ident(String),
    And,
    Or,
    LParen,
    RParen,
}

fn tokenize(text: &str) -> Vec<Token> {
    let mut tokens = Vec::new();
    let mut cur = String::new();
    let flush = |cur: &mut String, tokens: &mut Vec<Token>| {
        if !cur.is_empty() {
            tokens.push(Token::Ident(cur.clone()));
            cur.clear();
        }
    };
    for c in text.chars() {
        match c {
            '&' => {
                flush(&mut cur, &mut tokens);
                tokens.push(Token::And);
            }
            '|' => {
                flush(&mut cur, &mut tokens);
                tokens.push(Token::Or);
            }
            '(' => {
                flush(&mut cur, &mut tokens);
                tokens.push(Token::LParen);
            }
            ')' => {
                flush(&mut cur, &mut tokens);
                tokens.push(Token::RParen);
            }
            c if c.is_whitespace() => flush(&mut cur, &mut tokens),
            c => cur.push(c),
        }
    }
    flush(&mut cur, &mut tokens);
    tokens
}

struct ExprParser<'a> {
    tokens: Vec<Token>,
    pos: usize,
    base_point: &'a CyclePoint,
    validator: &'a dyn OutputValidator,
    atoms: Vec<AtomState>,
}

impl<'a> ExprParser<'a> {
    fn parse_or(&mut self) -> SchedulerResult<Expr> {
        let mut children = vec![self.parse_and()?];
        while self.tokens.get(self.pos) == Some(&Token::Or) {
            self.pos += 1;
            children.push(self.parse_and()?);
        }
        Ok(if children.len() == 1 {
            children.pop().unwrap()
        } else {
            Expr::Or(children)
        })
    }

    fn parse_and(&mut self) -> SchedulerResult<Expr> {
        let mut children = vec![self.parse_primary()?];
        while self.tokens.get(self.pos) == Some(&Token::And) {
            self.pos += 1;
            children.push(self.parse_primary()?);
        }
        Ok(if children.len() == 1 {
            children.pop().unwrap()
        } else {
            Expr::And(children)
        })
    }

    fn parse_primary(&mut self) -> SchedulerResult<Expr> {
        match self.tokens.get(self.pos) {
            Some(Token::LParen) => {
                self.pos += 1;
                let inner = self.parse_or()?;
                if self.tokens.get(self.pos) != Some(&Token::RParen) {
                    return Err(SchedulerError::Input("unbalanced parentheses in prerequisite".into()));
                }
                self.pos += 1;
                Ok(inner)
            }
            Some(Token::Ident(s)) => {
                let s = s.clone();
                self.pos += 1;
                self.push_atom(&s)
            }
            _ => Err(SchedulerError::Input("expected an output reference".into())),
        }
    }

    fn push_atom(&mut self, token: &str) -> SchedulerResult<Expr> {
        let atom = parse_atom_text(token)?;
        if !self.validator.task_exists(&atom.task_name) {
            return Err(SchedulerError::UnknownTask(atom.task_name.clone()));
        }
        if !self.validator.output_exists(&atom.task_name, &atom.output) {
            return Err(SchedulerError::UnknownOutput {
                task: atom.task_name.clone(),
                output: atom.output.clone(),
            });
        }
        let target_point = match &atom.offset {
            Some(off) => self.base_point.add(off)?,
            None => *self.base_point,
        };
        if let Some(idx) = self.atoms.iter().position(|a| {
            a.atom.task_name == atom.task_name
                && a.atom.output == atom.output
                && a.target_point.compare(&target_point).map(|o| o == std::cmp::Ordering::Equal).unwrap_or(false)
        }) {
            return Ok(Expr::Atom(idx));
        }
        self.atoms.push(AtomState {
            atom,
            target_point,
            satisfied: false,
            satisfied_by: None,
        });
        Ok(Expr::Atom(self.atoms.len() - 1))
    }
}

fn parse_atom_text(token: &str) -> SchedulerResult<Atom> {
    let (name_and_offset, output) = match token.rsplit_once(':') {
        Some((n, o)) => (n, o.to_string()),
        None => (token, "succeeded".to_string()),
    };
    let (task_name, offset) = match name_and_offset.split_once('[') {
        Some((name, rest)) => {
            let off_text = rest.strip_suffix(']').ok_or_else(|| {
                SchedulerError::Input(format!("unclosed offset bracket: {token}"))
            })?;
            (name.to_string(), Some(parse_offset(off_text)?))
        }
        None => (name_and_offset.to_string(), None),
    };
    if task_name.is_empty() {
        return Err(SchedulerError::Input(format!("missing task name in: {token}")));
    }
    Ok(Atom {
        task_name,
        offset,
        output,
    })
}

fn parse_offset(text: &str) -> SchedulerResult<Interval> {
    if let Some(rest) = text.strip_prefix('-') {
        Ok(Interval::parse(rest)?.negate())
    } else if let Some(rest) = text.strip_prefix('+') {
        Interval::parse(rest)
    } else {
        Interval::parse(text)
    }
}
