//! Treatment expressions
//!
//! Storage and junction nodes may treat pollutants with small arithmetic
//! expressions over the hydraulic state (`HRT`, `DT`, `FLOW`, `DEPTH`,
//! `AREA`), inflow concentrations (`C_name`), and other pollutants'
//! removals (`R_name`). Expressions are parsed once into an AST,
//! compiled to a postfix program, and evaluated on a small stack.
//! `R_` references order evaluation by topological sort of the
//! dependency graph; a cycle is a fatal start-time error.

use crate::error::{EngineError, Result};
use serde::{Deserialize, Serialize};

/// Whether an expression yields a removal fraction or an effluent
/// concentration.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TreatmentKind {
    /// expression value is the removal fraction 0..1
    Removal,
    /// expression value is the outflow concentration
    Concentration,
}

/// One treatment assignment at a node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Treatment {
    pub node: String,
    pub pollutant: String,
    pub kind: TreatmentKind,
    /// expression text, e.g. `1.0 - exp(-0.2*HRT)`
    pub expr: String,

    #[serde(skip)]
    pub node_index: usize,
    #[serde(skip)]
    pub pollut_index: usize,
    #[serde(skip)]
    pub program: Option<Program>,
}

/// Hydraulic quantities visible to an expression.
#[derive(Debug, Clone, Copy, Default)]
pub struct TreatmentContext {
    /// hydraulic residence time, hours
    pub hrt: f64,
    /// routing time step, s
    pub dt: f64,
    /// node inflow, cfs
    pub flow: f64,
    /// node depth, ft
    pub depth: f64,
    /// node surface area, ft²
    pub area: f64,
}

/// A parsed expression token.
#[derive(Debug, Clone, PartialEq)]
enum Token {
    Num(f64),
    Ident(String),
    Op(char),
    LParen,
    RParen,
    Comma,
}

/// Expression tree.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Num(f64),
    /// HRT, DT, FLOW, DEPTH, AREA
    Hydraulic(HydraulicVar),
    /// inflow concentration of pollutant i
    Conc(usize),
    /// computed removal of pollutant i
    Removal(usize),
    Neg(Box<Expr>),
    Add(Box<Expr>, Box<Expr>),
    Sub(Box<Expr>, Box<Expr>),
    Mul(Box<Expr>, Box<Expr>),
    Div(Box<Expr>, Box<Expr>),
    Pow(Box<Expr>, Box<Expr>),
    Call(Func, Box<Expr>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HydraulicVar {
    Hrt,
    Dt,
    Flow,
    Depth,
    Area,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Func {
    Exp,
    Ln,
    Log10,
    Sqrt,
    Abs,
}

/// A postfix instruction.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Instr {
    Push(f64),
    LoadHydraulic(HydraulicVar),
    LoadConc(usize),
    LoadRemoval(usize),
    Neg,
    Add,
    Sub,
    Mul,
    Div,
    Pow,
    Call(Func),
}

/// A compiled expression.
#[derive(Debug, Clone, Default)]
pub struct Program {
    code: Vec<Instr>,
    /// pollutant indices whose removal this expression reads
    pub removal_deps: Vec<usize>,
}

fn tokenize(src: &str) -> Result<Vec<Token>> {
    let mut tokens = Vec::new();
    let bytes: Vec<char> = src.chars().collect();
    let mut i = 0;
    while i < bytes.len() {
        let c = bytes[i];
        match c {
            ' ' | '\t' => i += 1,
            '0'..='9' | '.' => {
                let start = i;
                while i < bytes.len()
                    && (bytes[i].is_ascii_digit()
                        || bytes[i] == '.'
                        || bytes[i] == 'e'
                        || bytes[i] == 'E'
                        || ((bytes[i] == '+' || bytes[i] == '-')
                            && i > start
                            && (bytes[i - 1] == 'e' || bytes[i - 1] == 'E')))
                {
                    i += 1;
                }
                let text: String = bytes[start..i].iter().collect();
                let value = text
                    .parse::<f64>()
                    .map_err(|_| EngineError::InvalidNumber(text.clone()))?;
                tokens.push(Token::Num(value));
            }
            'a'..='z' | 'A'..='Z' | '_' => {
                let start = i;
                while i < bytes.len() && (bytes[i].is_ascii_alphanumeric() || bytes[i] == '_') {
                    i += 1;
                }
                tokens.push(Token::Ident(bytes[start..i].iter().collect()));
            }
            '+' | '-' | '*' | '/' | '^' => {
                tokens.push(Token::Op(c));
                i += 1;
            }
            '(' => {
                tokens.push(Token::LParen);
                i += 1;
            }
            ')' => {
                tokens.push(Token::RParen);
                i += 1;
            }
            ',' => {
                tokens.push(Token::Comma);
                i += 1;
            }
            _ => {
                return Err(EngineError::InputFormat(format!(
                    "unexpected character {c:?} in expression"
                )))
            }
        }
    }
    Ok(tokens)
}

/// Recursive-descent parser with ordinary precedence.
struct Parser<'a> {
    tokens: &'a [Token],
    pos: usize,
    pollutants: &'a dyn Fn(&str) -> Option<usize>,
}

impl<'a> Parser<'a> {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn bump(&mut self) -> Option<Token> {
        let t = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        t
    }

    fn fail(&self, why: &str) -> EngineError {
        EngineError::InputFormat(format!("expression parse error: {why}"))
    }

    fn expr(&mut self) -> Result<Expr> {
        let mut lhs = self.term()?;
        while let Some(Token::Op(op @ ('+' | '-'))) = self.peek() {
            let op = *op;
            self.bump();
            let rhs = self.term()?;
            lhs = match op {
                '+' => Expr::Add(Box::new(lhs), Box::new(rhs)),
                _ => Expr::Sub(Box::new(lhs), Box::new(rhs)),
            };
        }
        Ok(lhs)
    }

    fn term(&mut self) -> Result<Expr> {
        let mut lhs = self.power()?;
        while let Some(Token::Op(op @ ('*' | '/'))) = self.peek() {
            let op = *op;
            self.bump();
            let rhs = self.power()?;
            lhs = match op {
                '*' => Expr::Mul(Box::new(lhs), Box::new(rhs)),
                _ => Expr::Div(Box::new(lhs), Box::new(rhs)),
            };
        }
        Ok(lhs)
    }

    fn power(&mut self) -> Result<Expr> {
        let base = self.unary()?;
        if let Some(Token::Op('^')) = self.peek() {
            self.bump();
            // right-associative
            let exp = self.power()?;
            return Ok(Expr::Pow(Box::new(base), Box::new(exp)));
        }
        Ok(base)
    }

    fn unary(&mut self) -> Result<Expr> {
        match self.peek() {
            Some(Token::Op('-')) => {
                self.bump();
                Ok(Expr::Neg(Box::new(self.unary()?)))
            }
            Some(Token::Op('+')) => {
                self.bump();
                self.unary()
            }
            _ => self.atom(),
        }
    }

    fn atom(&mut self) -> Result<Expr> {
        match self.bump() {
            Some(Token::Num(v)) => Ok(Expr::Num(v)),
            Some(Token::LParen) => {
                let inner = self.expr()?;
                match self.bump() {
                    Some(Token::RParen) => Ok(inner),
                    _ => Err(self.fail("missing closing parenthesis")),
                }
            }
            Some(Token::Ident(name)) => self.ident(name),
            other => Err(self.fail(&format!("unexpected token {other:?}"))),
        }
    }

    fn ident(&mut self, name: String) -> Result<Expr> {
        let upper = name.to_ascii_uppercase();
        if let Some(func) = match upper.as_str() {
            "EXP" => Some(Func::Exp),
            "LN" => Some(Func::Ln),
            "LOG" | "LOG10" => Some(Func::Log10),
            "SQRT" => Some(Func::Sqrt),
            "ABS" => Some(Func::Abs),
            _ => None,
        } {
            match self.bump() {
                Some(Token::LParen) => {}
                _ => return Err(self.fail("function call needs parentheses")),
            }
            let arg = self.expr()?;
            match self.bump() {
                Some(Token::RParen) => {}
                _ => return Err(self.fail("missing closing parenthesis")),
            }
            return Ok(Expr::Call(func, Box::new(arg)));
        }
        match upper.as_str() {
            "HRT" => return Ok(Expr::Hydraulic(HydraulicVar::Hrt)),
            "DT" => return Ok(Expr::Hydraulic(HydraulicVar::Dt)),
            "FLOW" => return Ok(Expr::Hydraulic(HydraulicVar::Flow)),
            "DEPTH" => return Ok(Expr::Hydraulic(HydraulicVar::Depth)),
            "AREA" => return Ok(Expr::Hydraulic(HydraulicVar::Area)),
            _ => {}
        }
        if let Some(rest) = name.strip_prefix("R_").or_else(|| name.strip_prefix("r_")) {
            let idx = (self.pollutants)(rest).ok_or_else(|| {
                EngineError::UndefinedName {
                    kind: "pollutant",
                    name: rest.to_string(),
                }
            })?;
            return Ok(Expr::Removal(idx));
        }
        if let Some(rest) = name.strip_prefix("C_").or_else(|| name.strip_prefix("c_")) {
            let idx = (self.pollutants)(rest).ok_or_else(|| {
                EngineError::UndefinedName {
                    kind: "pollutant",
                    name: rest.to_string(),
                }
            })?;
            return Ok(Expr::Conc(idx));
        }
        // a bare pollutant name reads its inflow concentration
        if let Some(idx) = (self.pollutants)(&name) {
            return Ok(Expr::Conc(idx));
        }
        Err(self.fail(&format!("unknown identifier {name}")))
    }
}

fn emit(expr: &Expr, program: &mut Program) {
    match expr {
        Expr::Num(v) => program.code.push(Instr::Push(*v)),
        Expr::Hydraulic(v) => program.code.push(Instr::LoadHydraulic(*v)),
        Expr::Conc(i) => program.code.push(Instr::LoadConc(*i)),
        Expr::Removal(i) => {
            if !program.removal_deps.contains(i) {
                program.removal_deps.push(*i);
            }
            program.code.push(Instr::LoadRemoval(*i));
        }
        Expr::Neg(a) => {
            emit(a, program);
            program.code.push(Instr::Neg);
        }
        Expr::Add(a, b) => {
            emit(a, program);
            emit(b, program);
            program.code.push(Instr::Add);
        }
        Expr::Sub(a, b) => {
            emit(a, program);
            emit(b, program);
            program.code.push(Instr::Sub);
        }
        Expr::Mul(a, b) => {
            emit(a, program);
            emit(b, program);
            program.code.push(Instr::Mul);
        }
        Expr::Div(a, b) => {
            emit(a, program);
            emit(b, program);
            program.code.push(Instr::Div);
        }
        Expr::Pow(a, b) => {
            emit(a, program);
            emit(b, program);
            program.code.push(Instr::Pow);
        }
        Expr::Call(f, a) => {
            emit(a, program);
            program.code.push(Instr::Call(*f));
        }
    }
}

/// Parse and compile an expression. `pollutants` resolves names to
/// indices.
pub fn compile(src: &str, pollutants: &dyn Fn(&str) -> Option<usize>) -> Result<Program> {
    let tokens = tokenize(src)?;
    let mut parser = Parser {
        tokens: &tokens,
        pos: 0,
        pollutants,
    };
    let expr = parser.expr()?;
    if parser.pos != tokens.len() {
        return Err(EngineError::InputFormat(
            "trailing tokens in expression".into(),
        ));
    }
    let mut program = Program::default();
    emit(&expr, &mut program);
    Ok(program)
}

impl Program {
    /// Evaluate against the hydraulic context, inflow concentrations, and
    /// removals computed so far.
    pub fn eval(&self, ctx: &TreatmentContext, conc: &[f64], removals: &[f64]) -> f64 {
        let mut stack: Vec<f64> = Vec::with_capacity(8);
        for instr in &self.code {
            match *instr {
                Instr::Push(v) => stack.push(v),
                Instr::LoadHydraulic(v) => stack.push(match v {
                    HydraulicVar::Hrt => ctx.hrt,
                    HydraulicVar::Dt => ctx.dt,
                    HydraulicVar::Flow => ctx.flow,
                    HydraulicVar::Depth => ctx.depth,
                    HydraulicVar::Area => ctx.area,
                }),
                Instr::LoadConc(i) => stack.push(conc.get(i).copied().unwrap_or(0.0)),
                Instr::LoadRemoval(i) => stack.push(removals.get(i).copied().unwrap_or(0.0)),
                Instr::Neg => {
                    let a = stack.pop().unwrap_or(0.0);
                    stack.push(-a);
                }
                Instr::Add | Instr::Sub | Instr::Mul | Instr::Div | Instr::Pow => {
                    let b = stack.pop().unwrap_or(0.0);
                    let a = stack.pop().unwrap_or(0.0);
                    stack.push(match instr {
                        Instr::Add => a + b,
                        Instr::Sub => a - b,
                        Instr::Mul => a * b,
                        Instr::Div => {
                            if b.abs() > 0.0 {
                                a / b
                            } else {
                                0.0
                            }
                        }
                        _ => a.powf(b),
                    });
                }
                Instr::Call(f) => {
                    let a = stack.pop().unwrap_or(0.0);
                    stack.push(match f {
                        Func::Exp => a.exp(),
                        Func::Ln => {
                            if a > 0.0 {
                                a.ln()
                            } else {
                                0.0
                            }
                        }
                        Func::Log10 => {
                            if a > 0.0 {
                                a.log10()
                            } else {
                                0.0
                            }
                        }
                        Func::Sqrt => a.max(0.0).sqrt(),
                        Func::Abs => a.abs(),
                    });
                }
            }
        }
        stack.pop().unwrap_or(0.0)
    }
}

/// Order treatments at one node so every `R_` reference is computed
/// before it is read. Returns positions into `treatments`; a dependency
/// cycle is fatal.
pub fn evaluation_order(node_id: &str, treatments: &[&Treatment]) -> Result<Vec<usize>> {
    let n = treatments.len();
    // edges: dependency pollutant -> dependent treatment
    let mut order = Vec::with_capacity(n);
    let mut state = vec![0u8; n]; // 0 unvisited, 1 in progress, 2 done
    fn visit(
        i: usize,
        treatments: &[&Treatment],
        state: &mut [u8],
        order: &mut Vec<usize>,
        node_id: &str,
    ) -> Result<()> {
        if state[i] == 2 {
            return Ok(());
        }
        if state[i] == 1 {
            return Err(EngineError::CyclicTreatment(node_id.to_string()));
        }
        state[i] = 1;
        let deps = treatments[i]
            .program
            .as_ref()
            .map(|p| p.removal_deps.clone())
            .unwrap_or_default();
        for dep in deps {
            if let Some(j) = treatments.iter().position(|t| t.pollut_index == dep) {
                visit(j, treatments, state, order, node_id)?;
            }
        }
        state[i] = 2;
        order.push(i);
        Ok(())
    }
    for i in 0..n {
        visit(i, treatments, &mut state, &mut order, node_id)?;
    }
    Ok(order)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn pollutants(name: &str) -> Option<usize> {
        match name.to_ascii_uppercase().as_str() {
            "TSS" => Some(0),
            "LEAD" => Some(1),
            _ => None,
        }
    }

    fn treatment(pollut_index: usize, expr: &str) -> Treatment {
        let program = compile(expr, &pollutants).unwrap();
        Treatment {
            node: "SU1".into(),
            pollutant: String::new(),
            kind: TreatmentKind::Removal,
            expr: expr.into(),
            node_index: 0,
            pollut_index,
            program: Some(program),
        }
    }

    #[test]
    fn first_order_removal_expression_evaluates() {
        let p = compile("1.0 - exp(-0.2*HRT)", &pollutants).unwrap();
        let ctx = TreatmentContext {
            hrt: 5.0,
            ..Default::default()
        };
        assert_relative_eq!(p.eval(&ctx, &[], &[]), 1.0 - (-1.0_f64).exp());
    }

    #[test]
    fn precedence_and_power_are_conventional() {
        let p = compile("2 + 3 * 2 ^ 2", &pollutants).unwrap();
        assert_relative_eq!(p.eval(&Default::default(), &[], &[]), 14.0);
        let p = compile("-2^2", &pollutants).unwrap();
        // unary minus binds tighter than the power operator
        assert_relative_eq!(p.eval(&Default::default(), &[], &[]), 4.0);
    }

    #[test]
    fn removal_references_are_tracked_as_dependencies() {
        let p = compile("0.5 * R_TSS", &pollutants).unwrap();
        assert_eq!(p.removal_deps, vec![0]);
        assert_relative_eq!(p.eval(&Default::default(), &[], &[0.8]), 0.4);
    }

    #[test]
    fn dependent_treatments_evaluate_after_their_source() {
        let lead = treatment(1, "0.5 * R_TSS");
        let tss = treatment(0, "0.9");
        let list = [&lead, &tss];
        let order = evaluation_order("SU1", &list).unwrap();
        assert_eq!(order, vec![1, 0]);
    }

    #[test]
    fn cyclic_removal_references_are_fatal() {
        let a = treatment(0, "0.5 * R_LEAD");
        let b = treatment(1, "0.5 * R_TSS");
        let list = [&a, &b];
        assert!(matches!(
            evaluation_order("SU1", &list),
            Err(EngineError::CyclicTreatment(_))
        ));
    }

    #[test]
    fn unknown_identifier_is_a_parse_error() {
        assert!(compile("FOO + 1", &pollutants).is_err());
    }
}
