//! Statement grammar understood by [`super::PatternQueryEngine`]:
//!
//! ```text
//! SELECT <operand> [<op> <operand>] [;]
//! operand := 'text' | $n
//! op      := ~ | ~* | !~ | !~* | =
//! ```

use crate::classify::SqlState;
use crate::engine::EngineError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operand {
    Literal(String),
    /// One-based parameter index.
    Param(usize),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchOp {
    Regex {
        case_insensitive: bool,
        negated: bool,
    },
    Equal,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Expr {
    Value(Operand),
    Compare {
        left: Operand,
        op: MatchOp,
        right: Operand,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Statement {
    pub expr: Expr,
}

impl Statement {
    /// Number of parameters the statement takes: the highest `$n` it mentions.
    pub fn param_count(&self) -> usize {
        let index = |operand: &Operand| match operand {
            Operand::Param(n) => *n,
            Operand::Literal(_) => 0,
        };
        match &self.expr {
            Expr::Value(operand) => index(operand),
            Expr::Compare { left, right, .. } => index(left).max(index(right)),
        }
    }
}

fn syntax_error(near: Option<&str>) -> EngineError {
    let message = match near {
        Some(token) => format!("syntax error at or near \"{token}\""),
        None => "syntax error at end of input".to_string(),
    };
    EngineError::new(SqlState::SYNTAX_ERROR, message)
}

struct Lexer<'q> {
    src: &'q str,
    pos: usize,
}

impl<'q> Lexer<'q> {
    fn skip_whitespace(&mut self) {
        let rest = &self.src[self.pos..];
        self.pos += rest.len() - rest.trim_start().len();
    }

    fn rest(&self) -> &'q str {
        &self.src[self.pos..]
    }

    fn at_end(&mut self) -> bool {
        self.skip_whitespace();
        self.pos == self.src.len()
    }

    /// The next whitespace-delimited chunk, for error messages.
    fn next_token(&mut self) -> Option<&'q str> {
        self.skip_whitespace();
        let rest = self.rest();
        let end = rest.find(char::is_whitespace).unwrap_or(rest.len());
        (end > 0).then(|| &rest[..end])
    }

    fn keyword(&mut self, word: &str) -> Result<(), EngineError> {
        self.skip_whitespace();
        let rest = self.rest();
        let matches = rest.len() >= word.len()
            && rest[..word.len()].eq_ignore_ascii_case(word)
            && !rest[word.len()..].starts_with(|c: char| c.is_alphanumeric() || c == '_');
        if !matches {
            return Err(syntax_error(self.next_token()));
        }
        self.pos += word.len();
        Ok(())
    }

    fn operand(&mut self) -> Result<Operand, EngineError> {
        self.skip_whitespace();
        let rest = self.rest();
        if let Some(body) = rest.strip_prefix('\'') {
            return self.literal(body);
        }
        if let Some(digits) = rest.strip_prefix('$') {
            let len = digits.find(|c: char| !c.is_ascii_digit()).unwrap_or(digits.len());
            if len == 0 {
                return Err(syntax_error(self.next_token()));
            }
            let index: usize = digits[..len]
                .parse()
                .map_err(|_| syntax_error(Some(&rest[..len + 1])))?;
            if index == 0 {
                return Err(EngineError::new(
                    SqlState::UNDEFINED_PARAMETER,
                    "there is no parameter $0",
                ));
            }
            self.pos += len + 1;
            return Ok(Operand::Param(index));
        }
        Err(syntax_error(self.next_token()))
    }

    /// Parses the body of a quoted literal; `''` is an escaped quote.
    fn literal(&mut self, body: &str) -> Result<Operand, EngineError> {
        let mut value = String::new();
        let mut chars = body.char_indices().peekable();
        while let Some((i, c)) = chars.next() {
            if c != '\'' {
                value.push(c);
                continue;
            }
            if chars.peek().is_some_and(|&(_, next)| next == '\'') {
                chars.next();
                value.push('\'');
                continue;
            }
            self.pos += 1 + i + 1;
            return Ok(Operand::Literal(value));
        }
        Err(EngineError::new(
            SqlState::SYNTAX_ERROR,
            "unterminated quoted string",
        ))
    }

    fn operator(&mut self) -> Option<MatchOp> {
        self.skip_whitespace();
        let table: [(&str, MatchOp); 5] = [
            (
                "!~*",
                MatchOp::Regex {
                    case_insensitive: true,
                    negated: true,
                },
            ),
            (
                "!~",
                MatchOp::Regex {
                    case_insensitive: false,
                    negated: true,
                },
            ),
            (
                "~*",
                MatchOp::Regex {
                    case_insensitive: true,
                    negated: false,
                },
            ),
            (
                "~",
                MatchOp::Regex {
                    case_insensitive: false,
                    negated: false,
                },
            ),
            ("=", MatchOp::Equal),
        ];
        let (symbol, op) = table
            .iter()
            .find(|(symbol, _)| self.rest().starts_with(symbol))?;
        self.pos += symbol.len();
        Some(*op)
    }
}

pub fn parse_statement(src: &str) -> Result<Statement, EngineError> {
    let mut lexer = Lexer { src, pos: 0 };
    lexer.keyword("select")?;
    let left = lexer.operand()?;
    let expr = match lexer.operator() {
        Some(op) => Expr::Compare {
            left,
            op,
            right: lexer.operand()?,
        },
        None => Expr::Value(left),
    };
    lexer.skip_whitespace();
    if lexer.rest().starts_with(';') {
        lexer.pos += 1;
    }
    if !lexer.at_end() {
        return Err(syntax_error(lexer.next_token()));
    }
    Ok(Statement { expr })
}
