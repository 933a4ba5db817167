//! Arithmetic formulas over named signals.
//!
//! Supports `+ - * / **` with the usual precedence (`**` binds tightest and is right-associative,
//! so `-x**2` is `-(x**2)`), unary minus, parentheses, numeric literals with exponents
//! (`10e6`, `3.3e8`), identifiers and the functions `sqrt`, `arcsin`, `arctan`, `deg2rad` and
//! `rad2deg`.
use crate::signals::error::{EvalError, ExpressionError};
use indexmap::{IndexMap, IndexSet};
use rayon::prelude::*;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Pow,
}

impl BinaryOp {
    fn symbol(&self) -> &'static str {
        match self {
            BinaryOp::Add => "+",
            BinaryOp::Sub => "-",
            BinaryOp::Mul => "*",
            BinaryOp::Div => "/",
            BinaryOp::Pow => "**",
        }
    }

    fn apply(&self, a: f64, b: f64) -> Result<f64, EvalError> {
        match self {
            BinaryOp::Add => Ok(a + b),
            BinaryOp::Sub => Ok(a - b),
            BinaryOp::Mul => Ok(a * b),
            BinaryOp::Div if b == 0.0 => Err(EvalError::DivisionByZero),
            BinaryOp::Div => Ok(a / b),
            // A negative base only has real powers for integral exponents
            BinaryOp::Pow if a < 0.0 && b.fract() != 0.0 => Err(EvalError::Domain {
                function: self.symbol().to_string(),
                value: a,
            }),
            BinaryOp::Pow => Ok(a.powf(b)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Function {
    Sqrt,
    Arcsin,
    Arctan,
    Deg2Rad,
    Rad2Deg,
}

impl Function {
    fn from_name(name: &str) -> Option<Function> {
        match name {
            "sqrt" => Some(Function::Sqrt),
            "arcsin" => Some(Function::Arcsin),
            "arctan" => Some(Function::Arctan),
            "deg2rad" => Some(Function::Deg2Rad),
            "rad2deg" => Some(Function::Rad2Deg),
            _ => None,
        }
    }

    fn name(&self) -> &'static str {
        match self {
            Function::Sqrt => "sqrt",
            Function::Arcsin => "arcsin",
            Function::Arctan => "arctan",
            Function::Deg2Rad => "deg2rad",
            Function::Rad2Deg => "rad2deg",
        }
    }

    fn apply(&self, x: f64) -> Result<f64, EvalError> {
        match self {
            Function::Sqrt if x < 0.0 => Err(self.domain_error(x)),
            Function::Sqrt => Ok(x.sqrt()),
            Function::Arcsin if !(-1.0..=1.0).contains(&x) => Err(self.domain_error(x)),
            Function::Arcsin => Ok(x.asin()),
            Function::Arctan => Ok(x.atan()),
            Function::Deg2Rad => Ok(x.to_radians()),
            Function::Rad2Deg => Ok(x.to_degrees()),
        }
    }

    fn domain_error(&self, value: f64) -> EvalError {
        EvalError::Domain {
            function: self.name().to_string(),
            value,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Number(f64),
    Name(String),
    Neg(Box<Expr>),
    Binary {
        op: BinaryOp,
        lhs: Box<Expr>,
        rhs: Box<Expr>,
    },
    Call {
        function: Function,
        arg: Box<Expr>,
    },
}

impl FromStr for Expr {
    type Err = ExpressionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let tokens = tokenize(s)?;
        let mut parser = Parser { tokens, pos: 0 };
        let expr = parser.expr()?;
        match parser.peek() {
            None => Ok(expr),
            Some((token, pos)) => Err(ExpressionError::UnexpectedToken {
                found: token.describe(),
                pos: *pos,
            }),
        }
    }
}

impl Expr {
    /// Identifiers the expression reads, in order of first appearance.
    pub fn referenced_names(&self) -> IndexSet<&str> {
        let mut names = IndexSet::new();
        self.collect_names(&mut names);
        names
    }

    fn collect_names<'a>(&'a self, names: &mut IndexSet<&'a str>) {
        match self {
            Expr::Number(_) => {}
            Expr::Name(name) => {
                names.insert(name);
            }
            Expr::Neg(inner) => inner.collect_names(names),
            Expr::Binary { lhs, rhs, .. } => {
                lhs.collect_names(names);
                rhs.collect_names(names);
            }
            Expr::Call { arg, .. } => arg.collect_names(names),
        }
    }

    /// Value of the expression at record `index`.
    pub fn eval_at(&self, index: usize, scope: &Scope) -> Result<f64, EvalError> {
        match self {
            Expr::Number(v) => Ok(*v),
            Expr::Name(name) => scope.value(name, index),
            Expr::Neg(inner) => Ok(-inner.eval_at(index, scope)?),
            Expr::Binary { op, lhs, rhs } => {
                let a = lhs.eval_at(index, scope)?;
                let b = rhs.eval_at(index, scope)?;
                let value = op.apply(a, b)?;
                if !value.is_finite() && a.is_finite() && b.is_finite() {
                    return Err(EvalError::NotFinite {
                        operation: op.symbol().to_string(),
                        index,
                    });
                }
                Ok(value)
            }
            Expr::Call { function, arg } => function.apply(arg.eval_at(index, scope)?),
        }
    }

    /// Evaluates the expression on every record of `scope`, in parallel.
    ///
    /// # Errors
    /// Will return the first `EvalError` met on any record.
    pub fn evaluate(&self, scope: &Scope) -> Result<Vec<f64>, EvalError> {
        let len = scope.record_count()?;
        (0..len)
            .into_par_iter()
            .map(|i| self.eval_at(i, scope))
            .collect()
    }
}

/// Named series and constants a formula is evaluated against.
#[derive(Debug, Default, Clone)]
pub struct Scope<'a> {
    series: IndexMap<&'a str, &'a [f64]>,
    constants: IndexMap<&'a str, f64>,
}

impl<'a> Scope<'a> {
    pub fn new() -> Scope<'a> {
        Scope::default()
    }

    pub fn series(mut self, name: &'a str, values: &'a [f64]) -> Self {
        self.series.insert(name, values);
        self
    }

    pub fn constant(mut self, name: &'a str, value: f64) -> Self {
        self.constants.insert(name, value);
        self
    }

    /// Common length of every series, 0 if there are none.
    ///
    /// # Errors
    /// Will return `Err` if two series differ in length.
    pub fn record_count(&self) -> Result<usize, EvalError> {
        let mut series = self.series.iter();
        let expected = match series.next() {
            Some((_, values)) => values.len(),
            None => return Ok(0),
        };
        for (name, values) in series {
            if values.len() != expected {
                return Err(EvalError::LengthMismatch {
                    name: name.to_string(),
                    len: values.len(),
                    expected,
                });
            }
        }
        Ok(expected)
    }

    fn value(&self, name: &str, index: usize) -> Result<f64, EvalError> {
        if let Some(values) = self.series.get(name) {
            return values
                .get(index)
                .copied()
                .ok_or_else(|| EvalError::LengthMismatch {
                    name: name.to_string(),
                    len: values.len(),
                    expected: index + 1,
                });
        }
        self.constants
            .get(name)
            .copied()
            .ok_or_else(|| EvalError::UnknownName(name.to_string()))
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Number(f64),
    Ident(String),
    Plus,
    Minus,
    Star,
    StarStar,
    Slash,
    LParen,
    RParen,
}

impl Token {
    fn describe(&self) -> String {
        match self {
            Token::Number(v) => format!("number {v}"),
            Token::Ident(name) => format!("identifier '{name}'"),
            Token::Plus => "'+'".to_string(),
            Token::Minus => "'-'".to_string(),
            Token::Star => "'*'".to_string(),
            Token::StarStar => "'**'".to_string(),
            Token::Slash => "'/'".to_string(),
            Token::LParen => "'('".to_string(),
            Token::RParen => "')'".to_string(),
        }
    }
}

fn tokenize(source: &str) -> Result<Vec<(Token, usize)>, ExpressionError> {
    let chars: Vec<char> = source.chars().collect();
    let mut tokens = vec![];
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        let start = i;
        let token = match c {
            c if c.is_whitespace() => {
                i += 1;
                continue;
            }
            '+' => Token::Plus,
            '-' => Token::Minus,
            '/' => Token::Slash,
            '(' => Token::LParen,
            ')' => Token::RParen,
            '*' if chars.get(i + 1) == Some(&'*') => {
                i += 1;
                Token::StarStar
            }
            '*' => Token::Star,
            '^' => return Err(ExpressionError::CaretPower(i)),
            c if c.is_ascii_digit() || c == '.' => {
                while i + 1 < chars.len() && (chars[i + 1].is_ascii_digit() || chars[i + 1] == '.')
                {
                    i += 1;
                }
                // Exponent part, only when followed by digits
                if matches!(chars.get(i + 1), Some('e') | Some('E')) {
                    let mut j = i + 2;
                    if matches!(chars.get(j), Some('+') | Some('-')) {
                        j += 1;
                    }
                    if chars.get(j).map_or(false, char::is_ascii_digit) {
                        i = j;
                        while i + 1 < chars.len() && chars[i + 1].is_ascii_digit() {
                            i += 1;
                        }
                    }
                }
                let text: String = chars[start..=i].iter().collect();
                let value = text
                    .parse::<f64>()
                    .map_err(|_| ExpressionError::InvalidNumber(text.clone()))?;
                Token::Number(value)
            }
            c if c.is_alphabetic() || c == '_' => {
                while i + 1 < chars.len() && (chars[i + 1].is_alphanumeric() || chars[i + 1] == '_')
                {
                    i += 1;
                }
                Token::Ident(chars[start..=i].iter().collect())
            }
            ch => return Err(ExpressionError::UnexpectedChar { ch, pos: i }),
        };
        tokens.push((token, start));
        i += 1;
    }
    Ok(tokens)
}

/// Recursive descent over the token list.
struct Parser {
    tokens: Vec<(Token, usize)>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&(Token, usize)> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Result<(Token, usize), ExpressionError> {
        let token = self
            .tokens
            .get(self.pos)
            .cloned()
            .ok_or(ExpressionError::UnexpectedEnd)?;
        self.pos += 1;
        Ok(token)
    }

    fn eat(&mut self, expected: &Token) -> bool {
        match self.peek() {
            Some((token, _)) if token == expected => {
                self.pos += 1;
                true
            }
            _ => false,
        }
    }

    fn expr(&mut self) -> Result<Expr, ExpressionError> {
        let mut lhs = self.term()?;
        loop {
            let op = if self.eat(&Token::Plus) {
                BinaryOp::Add
            } else if self.eat(&Token::Minus) {
                BinaryOp::Sub
            } else {
                return Ok(lhs);
            };
            let rhs = self.term()?;
            lhs = binary(op, lhs, rhs);
        }
    }

    fn term(&mut self) -> Result<Expr, ExpressionError> {
        let mut lhs = self.unary()?;
        loop {
            let op = if self.eat(&Token::Star) {
                BinaryOp::Mul
            } else if self.eat(&Token::Slash) {
                BinaryOp::Div
            } else {
                return Ok(lhs);
            };
            let rhs = self.unary()?;
            lhs = binary(op, lhs, rhs);
        }
    }

    fn unary(&mut self) -> Result<Expr, ExpressionError> {
        if self.eat(&Token::Minus) {
            Ok(Expr::Neg(Box::new(self.unary()?)))
        } else if self.eat(&Token::Plus) {
            self.unary()
        } else {
            self.power()
        }
    }

    fn power(&mut self) -> Result<Expr, ExpressionError> {
        let base = self.primary()?;
        if self.eat(&Token::StarStar) {
            // Right-associative, exponent may carry its own sign
            let exponent = self.unary()?;
            Ok(binary(BinaryOp::Pow, base, exponent))
        } else {
            Ok(base)
        }
    }

    fn primary(&mut self) -> Result<Expr, ExpressionError> {
        let (token, pos) = self.next()?;
        match token {
            Token::Number(v) => Ok(Expr::Number(v)),
            Token::Ident(name) => {
                if !self.eat(&Token::LParen) {
                    return Ok(Expr::Name(name));
                }
                let function = Function::from_name(&name)
                    .ok_or_else(|| ExpressionError::UnknownFunction(name.clone()))?;
                let arg = self.expr()?;
                self.close_paren()?;
                Ok(Expr::Call {
                    function,
                    arg: Box::new(arg),
                })
            }
            Token::LParen => {
                let inner = self.expr()?;
                self.close_paren()?;
                Ok(inner)
            }
            other => Err(ExpressionError::UnexpectedToken {
                found: other.describe(),
                pos,
            }),
        }
    }

    fn close_paren(&mut self) -> Result<(), ExpressionError> {
        match self.next()? {
            (Token::RParen, _) => Ok(()),
            (other, pos) => Err(ExpressionError::UnexpectedToken {
                found: other.describe(),
                pos,
            }),
        }
    }
}

fn binary(op: BinaryOp, lhs: Expr, rhs: Expr) -> Expr {
    Expr::Binary {
        op,
        lhs: Box::new(lhs),
        rhs: Box::new(rhs),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use is_close::is_close;

    fn eval(source: &str) -> f64 {
        source
            .parse::<Expr>()
            .unwrap()
            .eval_at(0, &Scope::new())
            .unwrap()
    }

    #[test]
    fn precedence_and_associativity() {
        assert!(is_close!(eval("1 + 2 * 3"), 7.0));
        assert!(is_close!(eval("(1 + 2) * 3"), 9.0));
        assert!(is_close!(eval("2 ** 3 ** 2"), 512.0));
        assert!(is_close!(eval("-2 ** 2"), -4.0));
        assert!(is_close!(eval("2 ** -1"), 0.5));
        assert!(is_close!(eval("10 - 4 - 3"), 3.0));
        assert!(is_close!(eval("12 / 3 / 2"), 2.0));
    }

    #[test]
    fn scientific_literals() {
        assert!(is_close!(eval("10e6"), 1.0e7));
        assert!(is_close!(eval("3.3e8"), 3.3e8));
        assert!(is_close!(eval("2.5E-1"), 0.25));
    }

    #[test]
    fn functions() {
        assert!(is_close!(eval("sqrt(16)"), 4.0));
        assert!(is_close!(eval("rad2deg(arcsin(1))"), 90.0));
        assert!(is_close!(eval("deg2rad(180)"), std::f64::consts::PI));
        assert!(is_close!(eval("arctan(0)"), 0.0));
    }

    #[test]
    fn caret_is_rejected() {
        assert_eq!(
            "x^2".parse::<Expr>(),
            Err(ExpressionError::CaretPower(1))
        );
    }

    #[test]
    fn malformed_expressions() {
        assert_eq!("1 +".parse::<Expr>(), Err(ExpressionError::UnexpectedEnd));
        assert!(matches!(
            "(1 + 2".parse::<Expr>(),
            Err(ExpressionError::UnexpectedEnd)
        ));
        assert!(matches!(
            "1 2".parse::<Expr>(),
            Err(ExpressionError::UnexpectedToken { pos: 2, .. })
        ));
        assert_eq!(
            "cos(1)".parse::<Expr>(),
            Err(ExpressionError::UnknownFunction("cos".to_string()))
        );
        assert!(matches!(
            "a $ b".parse::<Expr>(),
            Err(ExpressionError::UnexpectedChar { ch: '$', .. })
        ));
    }

    #[test]
    fn referenced_names_in_order() {
        let expr: Expr = "180-arcsin(PBeam_kW*1000/BeamCurrent/CavVolt_kV)*180/pi"
            .parse()
            .unwrap();
        assert_eq!(
            expr.referenced_names().into_iter().collect::<Vec<_>>(),
            vec!["PBeam_kW", "BeamCurrent", "CavVolt_kV", "pi"]
        );
    }

    #[test]
    fn evaluation_errors() {
        let scope = Scope::new().constant("zero", 0.0);
        let div: Expr = "1 / zero".parse().unwrap();
        assert_eq!(div.eval_at(0, &scope), Err(EvalError::DivisionByZero));
        let asin: Expr = "arcsin(2)".parse().unwrap();
        assert!(matches!(
            asin.eval_at(0, &scope),
            Err(EvalError::Domain { .. })
        ));
        let unknown: Expr = "missing + 1".parse().unwrap();
        assert_eq!(
            unknown.eval_at(0, &scope),
            Err(EvalError::UnknownName("missing".to_string()))
        );
    }

    #[test]
    fn power_domain_and_overflow() {
        let x = [-4.0];
        let scope = Scope::new().series("x", &x);
        let root: Expr = "x ** 0.5".parse().unwrap();
        assert_eq!(
            root.evaluate(&scope),
            Err(EvalError::Domain {
                function: "**".to_string(),
                value: -4.0
            })
        );
        let square: Expr = "x ** 2".parse().unwrap();
        assert_eq!(square.evaluate(&scope).unwrap(), vec![16.0]);
        let overflow: Expr = "10 ** 400".parse().unwrap();
        assert_eq!(
            overflow.eval_at(0, &scope),
            Err(EvalError::NotFinite {
                operation: "**".to_string(),
                index: 0
            })
        );
    }

    #[test]
    fn elementwise_over_series() {
        let a = [1.0, 2.0, 3.0];
        let b = [10.0, 20.0, 30.0];
        let scope = Scope::new().series("a", &a).series("b", &b).constant("k", 2.0);
        let expr: Expr = "a * k + b".parse().unwrap();
        assert_eq!(expr.evaluate(&scope).unwrap(), vec![12.0, 24.0, 36.0]);
    }

    #[test]
    fn mismatched_series_lengths() {
        let a = [1.0, 2.0];
        let b = [1.0];
        let scope = Scope::new().series("a", &a).series("b", &b);
        let expr: Expr = "a + b".parse().unwrap();
        assert!(matches!(
            expr.evaluate(&scope),
            Err(EvalError::LengthMismatch { .. })
        ));
    }
}
