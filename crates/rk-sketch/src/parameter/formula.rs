//! Formula grammar
//!
//! A small recursive-descent parser producing an owned [`Expr`] tree.
//! Parameter names are resolved while tokenizing and stored as id
//! references, so renaming a parameter never breaks a formula.
//!
//! Grammar (lowest to highest precedence):
//!
//! ```text
//! expr    := term (('+' | '-') term)*
//! term    := unary (('*' | '/') unary)*
//! unary   := ('-' | '+') unary | power
//! power   := primary ('^' unary)?
//! primary := number | reference | function '(' args ')' | 'pi' | '(' expr ')'
//! ```

use std::collections::HashSet;
use std::f64::consts::PI;
use thiserror::Error;
use uuid::Uuid;

/// Errors raised while parsing or evaluating a formula
#[derive(Debug, Clone, PartialEq, Error)]
pub enum FormulaError {
    #[error("Formula may not reference its own parameter '{0}'")]
    SelfReference(String),
    #[error("Unknown name '{0}' in formula")]
    UnknownName(String),
    #[error("Unresolved parameter reference {0}")]
    UnresolvedReference(Uuid),
    #[error("Unknown function '{0}'")]
    UnknownFunction(String),
    #[error("Syntax error at {position}: {message}")]
    Syntax { position: usize, message: String },
    #[error("Function '{function}' takes {expected} argument(s), got {found}")]
    WrongArity {
        function: String,
        expected: usize,
        found: usize,
    },
    #[error("Formula would create a dependency cycle through '{0}'")]
    Cycle(String),
    #[error("Formula is empty")]
    Empty,
}

/// Result type for formula operations
pub type FormulaResult<T> = Result<T, FormulaError>;

/// Binary operator
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Pow,
}

impl BinaryOp {
    fn symbol(self) -> char {
        match self {
            BinaryOp::Add => '+',
            BinaryOp::Sub => '-',
            BinaryOp::Mul => '*',
            BinaryOp::Div => '/',
            BinaryOp::Pow => '^',
        }
    }

    fn precedence(self) -> u8 {
        match self {
            BinaryOp::Add | BinaryOp::Sub => 1,
            BinaryOp::Mul | BinaryOp::Div => 2,
            BinaryOp::Pow => 4,
        }
    }

    fn apply(self, lhs: f64, rhs: f64) -> f64 {
        match self {
            BinaryOp::Add => lhs + rhs,
            BinaryOp::Sub => lhs - rhs,
            BinaryOp::Mul => lhs * rhs,
            BinaryOp::Div => lhs / rhs,
            BinaryOp::Pow => lhs.powf(rhs),
        }
    }
}

/// Unary operator
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Neg,
}

const UNARY_PRECEDENCE: u8 = 3;
const ATOM_PRECEDENCE: u8 = 5;

/// Built-in function
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Function {
    Sin,
    Cos,
    Tan,
    Asin,
    Acos,
    Atan,
    Atan2,
    Sqrt,
    Abs,
    Pi,
    Log,
    Log10,
}

impl Function {
    /// Look up a function by its formula name
    pub fn from_name(name: &str) -> Option<Self> {
        Some(match name {
            "sin" => Function::Sin,
            "cos" => Function::Cos,
            "tan" => Function::Tan,
            "asin" => Function::Asin,
            "acos" => Function::Acos,
            "atan" => Function::Atan,
            "atan2" => Function::Atan2,
            "sqrt" => Function::Sqrt,
            "abs" => Function::Abs,
            "pi" => Function::Pi,
            "log" => Function::Log,
            "log10" => Function::Log10,
            _ => return None,
        })
    }

    /// Formula name
    pub fn name(self) -> &'static str {
        match self {
            Function::Sin => "sin",
            Function::Cos => "cos",
            Function::Tan => "tan",
            Function::Asin => "asin",
            Function::Acos => "acos",
            Function::Atan => "atan",
            Function::Atan2 => "atan2",
            Function::Sqrt => "sqrt",
            Function::Abs => "abs",
            Function::Pi => "pi",
            Function::Log => "log",
            Function::Log10 => "log10",
        }
    }

    /// Number of arguments
    pub fn arity(self) -> usize {
        match self {
            Function::Pi => 0,
            Function::Atan2 => 2,
            _ => 1,
        }
    }

    /// Arguments missing from a hand-built call read as NaN
    fn apply(self, args: &[f64]) -> f64 {
        let x = args.first().copied().unwrap_or(f64::NAN);
        match self {
            Function::Sin => x.sin(),
            Function::Cos => x.cos(),
            Function::Tan => x.tan(),
            Function::Asin => x.asin(),
            Function::Acos => x.acos(),
            Function::Atan => x.atan(),
            Function::Atan2 => x.atan2(args.get(1).copied().unwrap_or(f64::NAN)),
            Function::Sqrt => x.sqrt(),
            Function::Abs => x.abs(),
            Function::Pi => PI,
            Function::Log => x.ln(),
            Function::Log10 => x.log10(),
        }
    }
}

/// Formula syntax tree
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Number(f64),
    /// Reference to a parameter by ID
    Reference(Uuid),
    /// Name that no longer resolves (its parameter was deleted)
    Unresolved(String),
    Unary {
        op: UnaryOp,
        operand: Box<Expr>,
    },
    Binary {
        op: BinaryOp,
        lhs: Box<Expr>,
        rhs: Box<Expr>,
    },
    Call {
        function: Function,
        args: Vec<Expr>,
    },
}

impl Expr {
    fn precedence(&self) -> u8 {
        match self {
            Expr::Binary { op, .. } => op.precedence(),
            Expr::Unary { .. } => UNARY_PRECEDENCE,
            // A negative literal renders with a leading minus
            Expr::Number(n) if n.is_sign_negative() => UNARY_PRECEDENCE,
            _ => ATOM_PRECEDENCE,
        }
    }

    fn evaluate(&self, lookup: &dyn Fn(Uuid) -> Option<f64>) -> FormulaResult<f64> {
        match self {
            Expr::Number(n) => Ok(*n),
            Expr::Reference(id) => lookup(*id).ok_or(FormulaError::UnresolvedReference(*id)),
            Expr::Unresolved(name) => Err(FormulaError::UnknownName(name.clone())),
            Expr::Unary {
                op: UnaryOp::Neg,
                operand,
            } => Ok(-operand.evaluate(lookup)?),
            Expr::Binary { op, lhs, rhs } => {
                Ok(op.apply(lhs.evaluate(lookup)?, rhs.evaluate(lookup)?))
            }
            Expr::Call { function, args } => {
                let values = args
                    .iter()
                    .map(|a| a.evaluate(lookup))
                    .collect::<FormulaResult<Vec<_>>>()?;
                Ok(function.apply(&values))
            }
        }
    }

    fn collect_references(&self, out: &mut Vec<Uuid>) {
        match self {
            Expr::Reference(id) => {
                if !out.contains(id) {
                    out.push(*id);
                }
            }
            Expr::Unary { operand, .. } => operand.collect_references(out),
            Expr::Binary { lhs, rhs, .. } => {
                lhs.collect_references(out);
                rhs.collect_references(out);
            }
            Expr::Call { args, .. } => args.iter().for_each(|a| a.collect_references(out)),
            Expr::Number(_) | Expr::Unresolved(_) => {}
        }
    }

    fn map_leaves(&self, f: &dyn Fn(&Expr) -> Option<Expr>) -> Expr {
        if let Some(replaced) = f(self) {
            return replaced;
        }
        match self {
            Expr::Unary { op, operand } => Expr::Unary {
                op: *op,
                operand: Box::new(operand.map_leaves(f)),
            },
            Expr::Binary { op, lhs, rhs } => Expr::Binary {
                op: *op,
                lhs: Box::new(lhs.map_leaves(f)),
                rhs: Box::new(rhs.map_leaves(f)),
            },
            Expr::Call { function, args } => Expr::Call {
                function: *function,
                args: args.iter().map(|a| a.map_leaves(f)).collect(),
            },
            leaf => leaf.clone(),
        }
    }

    fn render(&self, out: &mut String, names: &Names) {
        match self {
            Expr::Number(n) => out.push_str(&format_number(*n)),
            Expr::Reference(id) => out.push_str(&(names.reference)(*id)),
            Expr::Unresolved(name) if names.internal => {
                out.push('[');
                out.push_str(name);
                out.push(']');
            }
            Expr::Unresolved(name) => out.push_str(name),
            Expr::Unary {
                op: UnaryOp::Neg,
                operand,
            } => {
                out.push('-');
                render_child(operand, operand.precedence() < UNARY_PRECEDENCE, out, names);
            }
            Expr::Binary { op, lhs, rhs } => {
                let prec = op.precedence();
                let (lhs_parens, rhs_parens) = match op {
                    BinaryOp::Pow => (
                        lhs.precedence() <= prec,
                        rhs.precedence() < UNARY_PRECEDENCE,
                    ),
                    BinaryOp::Sub | BinaryOp::Div => {
                        (lhs.precedence() < prec, rhs.precedence() <= prec)
                    }
                    BinaryOp::Add | BinaryOp::Mul => {
                        (lhs.precedence() < prec, rhs.precedence() < prec)
                    }
                };
                render_child(lhs, lhs_parens, out, names);
                out.push(op.symbol());
                render_child(rhs, rhs_parens, out, names);
            }
            Expr::Call { function, args } => {
                out.push_str(function.name());
                out.push('(');
                for (i, arg) in args.iter().enumerate() {
                    if i > 0 {
                        out.push(',');
                    }
                    arg.render(out, names);
                }
                out.push(')');
            }
        }
    }
}

/// How leaves are written when rendering
struct Names<'a> {
    reference: &'a dyn Fn(Uuid) -> String,
    internal: bool,
}

fn render_child(expr: &Expr, parens: bool, out: &mut String, names: &Names) {
    if parens {
        out.push('(');
    }
    expr.render(out, names);
    if parens {
        out.push(')');
    }
}

fn format_number(n: f64) -> String {
    if n.is_finite() {
        format!("{}", n)
    } else if n.is_nan() {
        "(0/0)".to_string()
    } else if n > 0.0 {
        "(1/0)".to_string()
    } else {
        "(-1/0)".to_string()
    }
}

/// A parsed formula
#[derive(Debug, Clone, PartialEq)]
pub struct Formula {
    expr: Expr,
}

impl Formula {
    /// Parse user-facing formula text.
    ///
    /// `names` lists every visible parameter name with the ID it resolves to
    /// from the owning scope. Names are matched longest first.
    pub fn parse(text: &str, names: &[(String, Uuid)]) -> FormulaResult<Self> {
        let mut sorted: Vec<&(String, Uuid)> = names.iter().filter(|(n, _)| !n.is_empty()).collect();
        sorted.sort_by(|a, b| b.0.len().cmp(&a.0.len()));
        let tokens = Lexer::new(text, LexMode::User(&sorted)).tokenize()?;
        Parser::new(tokens).parse()
    }

    /// Parse the internal form, where references are written `{uuid}`.
    ///
    /// Identifiers that are not functions become unresolved names.
    pub fn parse_internal(text: &str) -> FormulaResult<Self> {
        let tokens = Lexer::new(text, LexMode::Internal).tokenize()?;
        Parser::new(tokens).parse()
    }

    /// A formula that is just a number
    pub fn literal(value: f64) -> Self {
        Self {
            expr: Expr::Number(value),
        }
    }

    /// Get the syntax tree
    pub fn expr(&self) -> &Expr {
        &self.expr
    }

    /// Check if the formula is a plain number
    pub fn is_literal(&self) -> bool {
        matches!(self.expr, Expr::Number(_))
    }

    /// Referenced parameter IDs in first-use order
    pub fn references(&self) -> Vec<Uuid> {
        let mut out = Vec::new();
        self.expr.collect_references(&mut out);
        out
    }

    /// Check if the formula references a parameter
    pub fn references_parameter(&self, id: Uuid) -> bool {
        self.references().contains(&id)
    }

    /// Evaluate with current parameter values
    pub fn evaluate(&self, lookup: &dyn Fn(Uuid) -> Option<f64>) -> FormulaResult<f64> {
        self.expr.evaluate(lookup)
    }

    /// Render with parameter names
    pub fn display(&self, name_of: &dyn Fn(Uuid) -> String) -> String {
        let mut out = String::new();
        self.expr.render(
            &mut out,
            &Names {
                reference: name_of,
                internal: false,
            },
        );
        out
    }

    /// Render in internal form with `{uuid}` references and `[name]` unresolved names
    pub fn internal_text(&self) -> String {
        let mut out = String::new();
        self.expr.render(
            &mut out,
            &Names {
                reference: &|id| format!("{{{}}}", id),
                internal: true,
            },
        );
        out
    }

    /// Replace references to `id` with an unresolved `name`
    pub fn detach_reference(&self, id: Uuid, name: &str) -> Self {
        Self {
            expr: self.expr.map_leaves(&|e| match e {
                Expr::Reference(r) if *r == id => Some(Expr::Unresolved(name.to_string())),
                _ => None,
            }),
        }
    }

    /// Copy of this formula with every numeric literal multiplied by `factor`
    pub fn factored(&self, factor: f64) -> Self {
        Self {
            expr: self.expr.map_leaves(&|e| match e {
                Expr::Number(n) => Some(Expr::Number(n * factor)),
                _ => None,
            }),
        }
    }
}

// ============== Lexer ==============

#[derive(Debug, Clone, PartialEq)]
enum TokenKind {
    Number(f64),
    Reference(Uuid),
    Unresolved(String),
    Ident(String),
    Plus,
    Minus,
    Star,
    Slash,
    Caret,
    LParen,
    RParen,
    Comma,
    End,
}

#[derive(Debug, Clone)]
struct Token {
    kind: TokenKind,
    position: usize,
}

#[derive(Clone, Copy)]
enum LexMode<'a> {
    User(&'a [&'a (String, Uuid)]),
    Internal,
}

struct Lexer<'a> {
    text: &'a str,
    pos: usize,
    mode: LexMode<'a>,
}

fn is_ident_start(c: char) -> bool {
    c.is_alphabetic() || c == '_'
}

fn is_ident_char(c: char) -> bool {
    c.is_alphanumeric() || c == '_' || c == '.'
}

impl<'a> Lexer<'a> {
    fn new(text: &'a str, mode: LexMode<'a>) -> Self {
        Self { text, pos: 0, mode }
    }

    fn rest(&self) -> &'a str {
        &self.text[self.pos..]
    }

    fn peek(&self) -> Option<char> {
        self.rest().chars().next()
    }

    fn syntax(&self, message: impl Into<String>) -> FormulaError {
        FormulaError::Syntax {
            position: self.pos,
            message: message.into(),
        }
    }

    fn tokenize(mut self) -> FormulaResult<Vec<Token>> {
        let mut tokens = Vec::new();
        loop {
            while self.peek().is_some_and(char::is_whitespace) {
                self.pos += self.peek().map_or(0, char::len_utf8);
            }
            let position = self.pos;
            let Some(c) = self.peek() else {
                tokens.push(Token {
                    kind: TokenKind::End,
                    position,
                });
                return Ok(tokens);
            };
            let kind = match c {
                '+' => self.single(TokenKind::Plus),
                '-' => self.single(TokenKind::Minus),
                '*' => self.single(TokenKind::Star),
                '/' => self.single(TokenKind::Slash),
                '^' => self.single(TokenKind::Caret),
                '(' => self.single(TokenKind::LParen),
                ')' => self.single(TokenKind::RParen),
                ',' => self.single(TokenKind::Comma),
                '{' => self.reference()?,
                '[' => self.unresolved()?,
                c if c.is_ascii_digit() || c == '.' => self.number()?,
                c if is_ident_start(c) => self.identifier()?,
                other => return Err(self.syntax(format!("unexpected character '{}'", other))),
            };
            tokens.push(Token { kind, position });
        }
    }

    fn single(&mut self, kind: TokenKind) -> TokenKind {
        self.pos += 1;
        kind
    }

    fn number(&mut self) -> FormulaResult<TokenKind> {
        let bytes = self.text.as_bytes();
        let start = self.pos;
        let mut end = start;
        while end < bytes.len() && (bytes[end].is_ascii_digit() || bytes[end] == b'.') {
            end += 1;
        }
        // Exponent part, only if followed by digits
        if end < bytes.len() && (bytes[end] == b'e' || bytes[end] == b'E') {
            let mut exp = end + 1;
            if exp < bytes.len() && (bytes[exp] == b'+' || bytes[exp] == b'-') {
                exp += 1;
            }
            if exp < bytes.len() && bytes[exp].is_ascii_digit() {
                while exp < bytes.len() && bytes[exp].is_ascii_digit() {
                    exp += 1;
                }
                end = exp;
            }
        }
        let literal = &self.text[start..end];
        let value = literal
            .parse::<f64>()
            .map_err(|_| self.syntax(format!("invalid number '{}'", literal)))?;
        self.pos = end;
        Ok(TokenKind::Number(value))
    }

    fn reference(&mut self) -> FormulaResult<TokenKind> {
        let Some(close) = self.rest().find('}') else {
            return Err(self.syntax("unterminated reference"));
        };
        let inner = &self.rest()[1..close];
        let id = Uuid::parse_str(inner)
            .map_err(|_| self.syntax(format!("invalid reference '{}'", inner)))?;
        self.pos += close + 1;
        Ok(TokenKind::Reference(id))
    }

    fn unresolved(&mut self) -> FormulaResult<TokenKind> {
        let Some(close) = self.rest().find(']') else {
            return Err(self.syntax("unterminated name"));
        };
        let name = self.rest()[1..close].to_string();
        self.pos += close + 1;
        Ok(TokenKind::Unresolved(name))
    }

    fn next_non_space_is_paren(&self, offset: usize) -> bool {
        self.text[offset..].trim_start().starts_with('(')
    }

    fn identifier(&mut self) -> FormulaResult<TokenKind> {
        if let LexMode::User(names) = self.mode {
            for (name, id) in names.iter().map(|entry| (&entry.0, entry.1)) {
                if !self.rest().starts_with(name.as_str()) {
                    continue;
                }
                let end = self.pos + name.len();
                if self.text[end..].chars().next().is_some_and(is_ident_char) {
                    continue;
                }
                // "sin(" stays a call even if a parameter is named "sin"
                if Function::from_name(name).is_some() && self.next_non_space_is_paren(end) {
                    break;
                }
                self.pos = end;
                return Ok(TokenKind::Reference(id));
            }
        }

        let word_len = self
            .rest()
            .char_indices()
            .find(|(_, c)| !is_ident_char(*c))
            .map_or(self.rest().len(), |(i, _)| i);
        let word = &self.rest()[..word_len];
        let end = self.pos + word_len;

        if Function::from_name(word).is_some() {
            self.pos = end;
            return Ok(TokenKind::Ident(word.to_string()));
        }
        if self.next_non_space_is_paren(end) {
            return Err(FormulaError::UnknownFunction(word.to_string()));
        }
        match self.mode {
            LexMode::User(_) => Err(FormulaError::UnknownName(word.to_string())),
            LexMode::Internal => {
                self.pos = end;
                Ok(TokenKind::Ident(word.to_string()))
            }
        }
    }
}

// ============== Parser ==============

struct Parser {
    tokens: Vec<Token>,
    index: usize,
}

impl Parser {
    fn new(tokens: Vec<Token>) -> Self {
        Self { tokens, index: 0 }
    }

    fn peek(&self) -> &Token {
        // The lexer always terminates the stream with an End token
        &self.tokens[self.index.min(self.tokens.len() - 1)]
    }

    fn advance(&mut self) -> Token {
        let token = self.peek().clone();
        if self.index < self.tokens.len() - 1 {
            self.index += 1;
        }
        token
    }

    fn error(&self, message: impl Into<String>) -> FormulaError {
        FormulaError::Syntax {
            position: self.peek().position,
            message: message.into(),
        }
    }

    fn expect(&mut self, kind: TokenKind, what: &str) -> FormulaResult<()> {
        if self.peek().kind == kind {
            self.advance();
            Ok(())
        } else {
            Err(self.error(format!("expected {}", what)))
        }
    }

    fn parse(mut self) -> FormulaResult<Formula> {
        if self.peek().kind == TokenKind::End {
            return Err(FormulaError::Empty);
        }
        let expr = self.expr()?;
        match self.peek().kind {
            TokenKind::End => Ok(Formula { expr }),
            TokenKind::RParen => Err(self.error("unbalanced ')'")),
            _ => Err(self.error("unexpected trailing input")),
        }
    }

    fn expr(&mut self) -> FormulaResult<Expr> {
        let mut lhs = self.term()?;
        loop {
            let op = match self.peek().kind {
                TokenKind::Plus => BinaryOp::Add,
                TokenKind::Minus => BinaryOp::Sub,
                _ => return Ok(lhs),
            };
            self.advance();
            let rhs = self.term()?;
            lhs = binary(op, lhs, rhs);
        }
    }

    fn term(&mut self) -> FormulaResult<Expr> {
        let mut lhs = self.unary()?;
        loop {
            let op = match self.peek().kind {
                TokenKind::Star => BinaryOp::Mul,
                TokenKind::Slash => BinaryOp::Div,
                _ => return Ok(lhs),
            };
            self.advance();
            let rhs = self.unary()?;
            lhs = binary(op, lhs, rhs);
        }
    }

    fn unary(&mut self) -> FormulaResult<Expr> {
        match self.peek().kind {
            TokenKind::Minus => {
                self.advance();
                let operand = self.unary()?;
                Ok(Expr::Unary {
                    op: UnaryOp::Neg,
                    operand: Box::new(operand),
                })
            }
            TokenKind::Plus => {
                self.advance();
                self.unary()
            }
            _ => self.power(),
        }
    }

    fn power(&mut self) -> FormulaResult<Expr> {
        let base = self.primary()?;
        if self.peek().kind == TokenKind::Caret {
            self.advance();
            let exponent = self.unary()?;
            return Ok(binary(BinaryOp::Pow, base, exponent));
        }
        Ok(base)
    }

    fn primary(&mut self) -> FormulaResult<Expr> {
        let token = self.advance();
        match token.kind {
            TokenKind::Number(n) => Ok(Expr::Number(n)),
            TokenKind::Reference(id) => Ok(Expr::Reference(id)),
            TokenKind::Unresolved(name) => Ok(Expr::Unresolved(name)),
            TokenKind::LParen => {
                let inner = self.expr()?;
                self.expect(TokenKind::RParen, "')'")?;
                Ok(inner)
            }
            TokenKind::Ident(name) => self.call(name),
            TokenKind::End => Err(FormulaError::Syntax {
                position: token.position,
                message: "unexpected end of formula".into(),
            }),
            other => Err(FormulaError::Syntax {
                position: token.position,
                message: format!("unexpected token {:?}", other),
            }),
        }
    }

    fn call(&mut self, name: String) -> FormulaResult<Expr> {
        let Some(function) = Function::from_name(&name) else {
            return Ok(Expr::Unresolved(name));
        };
        if self.peek().kind != TokenKind::LParen {
            // Bare "pi"
            if function == Function::Pi {
                return Ok(Expr::Call {
                    function,
                    args: Vec::new(),
                });
            }
            return Err(self.error(format!("expected '(' after {}", name)));
        }
        self.advance();

        let mut args = Vec::new();
        if self.peek().kind != TokenKind::RParen {
            loop {
                args.push(self.expr()?);
                if self.peek().kind == TokenKind::Comma {
                    self.advance();
                } else {
                    break;
                }
            }
        }
        self.expect(TokenKind::RParen, "')'")?;

        if args.len() != function.arity() {
            return Err(FormulaError::WrongArity {
                function: name,
                expected: function.arity(),
                found: args.len(),
            });
        }
        Ok(Expr::Call { function, args })
    }
}

fn binary(op: BinaryOp, lhs: Expr, rhs: Expr) -> Expr {
    Expr::Binary {
        op,
        lhs: Box::new(lhs),
        rhs: Box::new(rhs),
    }
}

/// Collect the distinct IDs referenced by several formulas
pub(crate) fn union_references<'a>(formulas: impl IntoIterator<Item = &'a Formula>) -> Vec<Uuid> {
    let mut seen = HashSet::new();
    let mut out = Vec::new();
    for formula in formulas {
        for id in formula.references() {
            if seen.insert(id) {
                out.push(id);
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn eval(text: &str) -> f64 {
        Formula::parse(text, &[]).unwrap().evaluate(&|_| None).unwrap()
    }

    #[test]
    fn test_precedence() {
        assert_relative_eq!(eval("1 + 2 * 3"), 7.0);
        assert_relative_eq!(eval("(1 + 2) * 3"), 9.0);
        assert_relative_eq!(eval("2 ^ 3 ^ 2"), 512.0);
        assert_relative_eq!(eval("-2 ^ 2"), -4.0);
        assert_relative_eq!(eval("2 ^ -1"), 0.5);
        assert_relative_eq!(eval("10 - 4 - 3"), 3.0);
        assert_relative_eq!(eval("1.5e2 / 3"), 50.0);
    }

    #[test]
    fn test_functions() {
        assert_relative_eq!(eval("sin(pi / 2)"), 1.0);
        assert_relative_eq!(eval("pi()"), PI);
        assert_relative_eq!(eval("atan2(1, 1)"), PI / 4.0);
        assert_relative_eq!(eval("sqrt(16) + abs(-2)"), 6.0);
        assert_relative_eq!(eval("log10(1000)"), 3.0, epsilon = 1e-12);
        assert_relative_eq!(eval("acos(0)"), PI / 2.0);
    }

    #[test]
    fn test_short_call_evaluates_to_nan() {
        let call = Expr::Call {
            function: Function::Atan2,
            args: vec![Expr::Number(1.0)],
        };
        assert!(call.evaluate(&|_| None).unwrap().is_nan());

        let empty = Expr::Call {
            function: Function::Sqrt,
            args: vec![],
        };
        assert!(empty.evaluate(&|_| None).unwrap().is_nan());
    }

    #[test]
    fn test_names_resolve_longest_first() {
        let width = Uuid::new_v4();
        let width_total = Uuid::new_v4();
        let names = vec![
            ("width".to_string(), width),
            ("width_total".to_string(), width_total),
        ];
        let formula = Formula::parse("width_total - width", &names).unwrap();
        assert_eq!(formula.references(), vec![width_total, width]);

        let value = formula
            .evaluate(&|id| if id == width { Some(2.0) } else { Some(10.0) })
            .unwrap();
        assert_relative_eq!(value, 8.0);
    }

    #[test]
    fn test_names_with_spaces() {
        let id = Uuid::new_v4();
        let names = vec![("new parameter".to_string(), id)];
        let formula = Formula::parse("new parameter * 2", &names).unwrap();
        assert_eq!(formula.references(), vec![id]);
    }

    #[test]
    fn test_errors() {
        assert_eq!(
            Formula::parse("foo + 1", &[]),
            Err(FormulaError::UnknownName("foo".into()))
        );
        assert_eq!(
            Formula::parse("bar(1)", &[]),
            Err(FormulaError::UnknownFunction("bar".into()))
        );
        assert!(matches!(
            Formula::parse("(1 + 2", &[]),
            Err(FormulaError::Syntax { .. })
        ));
        assert!(matches!(
            Formula::parse("1 + 2)", &[]),
            Err(FormulaError::Syntax { .. })
        ));
        assert!(matches!(
            Formula::parse("atan2(1)", &[]),
            Err(FormulaError::WrongArity { expected: 2, found: 1, .. })
        ));
        assert_eq!(Formula::parse("   ", &[]), Err(FormulaError::Empty));
    }

    #[test]
    fn test_division_by_zero_is_not_rejected() {
        assert!(eval("1 / 0").is_infinite());
        assert!(eval("sqrt(-1)").is_nan());
    }

    #[test]
    fn test_display_uses_current_names() {
        let id = Uuid::new_v4();
        let names = vec![("a".to_string(), id)];
        let formula = Formula::parse("(a + 1) * 2 - (3 - a)", &names).unwrap();

        assert_eq!(formula.display(&|_| "a".to_string()), "(a+1)*2-(3-a)");
        assert_eq!(formula.display(&|_| "renamed".to_string()), "(renamed+1)*2-(3-renamed)");
    }

    #[test]
    fn test_internal_text_round_trip() {
        let id = Uuid::new_v4();
        let names = vec![("len".to_string(), id)];
        let formula = Formula::parse("-len ^ 2 + cos(len / 2)", &names).unwrap();

        let internal = formula.internal_text();
        assert!(internal.contains(&format!("{{{}}}", id)));
        let reparsed = Formula::parse_internal(&internal).unwrap();
        assert_eq!(reparsed, formula);
    }

    #[test]
    fn test_detach_reference() {
        let id = Uuid::new_v4();
        let names = vec![("wall height".to_string(), id)];
        let formula = Formula::parse("wall height * 2", &names)
            .unwrap()
            .detach_reference(id, "wall height");

        assert!(formula.references().is_empty());
        assert_eq!(formula.display(&|_| String::new()), "wall height*2");
        assert_eq!(
            formula.evaluate(&|_| Some(1.0)),
            Err(FormulaError::UnknownName("wall height".into()))
        );
        // The unresolved name survives the internal form
        let reparsed = Formula::parse_internal(&formula.internal_text()).unwrap();
        assert_eq!(reparsed, formula);
    }

    #[test]
    fn test_factored() {
        let id = Uuid::new_v4();
        let names = vec![("x".to_string(), id)];
        let formula = Formula::parse("x * 2 + 0.5", &names).unwrap();
        assert_eq!(formula.factored(10.0).display(&|_| "x".into()), "x*20+5");
    }
}
