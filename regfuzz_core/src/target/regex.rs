//! A small backtracking regular expression engine.
//!
//! Patterns are parsed into a syntax tree, compiled into a flat instruction list,
//! and run with a bit-state backtracker: every (instruction, position) pair is
//! explored at most once, so a match costs at most `program length * (text + 1)`
//! steps. The matcher charges its working memory to an [`Arena`] and polls a
//! cancellation callback on every step.

use crate::arena::Arena;
use std::mem::size_of;
use thiserror::Error;

/// Largest repetition bound accepted in `{m,n}`.
pub const DUPMAX: u32 = 255;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RegexError {
    #[error("parentheses () not balanced")]
    UnbalancedParens,
    #[error("brackets [] not balanced")]
    UnbalancedBrackets,
    #[error("braces {{}} not balanced")]
    UnbalancedBraces,
    #[error("invalid repetition count(s)")]
    BadRepetition,
    #[error("quantifier operand invalid")]
    BadQuantifierOperand,
    #[error("invalid escape \\ sequence")]
    BadEscape,
    #[error("invalid character range")]
    BadRange,
    #[error("invalid character class")]
    BadClass,
    #[error("regular expression is too complex")]
    TooComplex,
    #[error("regular expression has too many distinct states")]
    TooManyStates,
    #[error("out of memory")]
    OutOfMemory,
    #[error("operation cancelled")]
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegexLimits {
    /// Deepest group nesting the parser accepts.
    pub max_nesting: usize,
    /// Largest compiled program.
    pub max_states: usize,
    /// Largest visited bitmap a single match may allocate.
    pub max_match_bytes: usize,
}

impl Default for RegexLimits {
    fn default() -> Self {
        Self {
            max_nesting: 100,
            max_states: 100_000,
            max_match_bytes: 16 * 1024 * 1024,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Builtin {
    Alpha,
    Digit,
    Alnum,
    Space,
    Upper,
    Lower,
    Punct,
    XDigit,
    Word,
}

impl Builtin {
    fn from_posix(name: &str) -> Option<Self> {
        Some(match name {
            "alpha" => Builtin::Alpha,
            "digit" => Builtin::Digit,
            "alnum" => Builtin::Alnum,
            "space" => Builtin::Space,
            "upper" => Builtin::Upper,
            "lower" => Builtin::Lower,
            "punct" => Builtin::Punct,
            "xdigit" => Builtin::XDigit,
            _ => return None,
        })
    }

    fn matches(self, c: char) -> bool {
        match self {
            Builtin::Alpha => c.is_alphabetic(),
            Builtin::Digit => c.is_ascii_digit(),
            Builtin::Alnum => c.is_alphanumeric(),
            Builtin::Space => c.is_whitespace(),
            Builtin::Upper => c.is_uppercase(),
            Builtin::Lower => c.is_lowercase(),
            Builtin::Punct => c.is_ascii_punctuation(),
            Builtin::XDigit => c.is_ascii_hexdigit(),
            Builtin::Word => c.is_alphanumeric() || c == '_',
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClassItem {
    Range(char, char),
    Builtin { class: Builtin, negated: bool },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassSet {
    pub negated: bool,
    pub items: Vec<ClassItem>,
}

impl ClassSet {
    fn builtin(class: Builtin, negated: bool) -> Self {
        Self {
            negated,
            items: vec![ClassItem::Builtin {
                class,
                negated: false,
            }],
        }
    }

    fn contains(&self, c: char) -> bool {
        let hit = self.items.iter().any(|item| match *item {
            ClassItem::Range(lo, hi) => lo <= c && c <= hi,
            ClassItem::Builtin { class, negated } => class.matches(c) != negated,
        });
        hit != self.negated
    }

    fn matches(&self, c: char, case_insensitive: bool) -> bool {
        if !case_insensitive {
            return self.contains(c);
        }
        self.contains(c)
            || c.to_lowercase().any(|l| self.contains(l))
            || c.to_uppercase().any(|u| self.contains(u))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Node {
    Empty,
    Literal(char),
    Any,
    Class(ClassSet),
    Start,
    End,
    Concat(Vec<Node>),
    Alternate(Vec<Node>),
    Group(Box<Node>),
    Repeat {
        node: Box<Node>,
        min: u32,
        max: Option<u32>,
        greedy: bool,
    },
}

pub fn parse(pattern: &str, limits: &RegexLimits) -> Result<Node, RegexError> {
    let mut parser = Parser {
        chars: pattern.chars().collect(),
        pos: 0,
        depth: 0,
        max_nesting: limits.max_nesting,
    };
    let node = parser.alternation()?;
    if parser.pos < parser.chars.len() {
        // Only a stray ')' stops the top-level alternation early.
        return Err(RegexError::UnbalancedParens);
    }
    Ok(node)
}

struct Parser {
    chars: Vec<char>,
    pos: usize,
    depth: usize,
    max_nesting: usize,
}

impl Parser {
    fn peek(&self) -> Option<char> {
        self.chars.get(self.pos).copied()
    }

    fn bump(&mut self) -> Option<char> {
        let c = self.peek()?;
        self.pos += 1;
        Some(c)
    }

    fn eat(&mut self, expected: char) -> bool {
        if self.peek() == Some(expected) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn alternation(&mut self) -> Result<Node, RegexError> {
        let mut branches = vec![self.concat()?];
        while self.eat('|') {
            branches.push(self.concat()?);
        }
        Ok(if branches.len() == 1 {
            branches.remove(0)
        } else {
            Node::Alternate(branches)
        })
    }

    fn concat(&mut self) -> Result<Node, RegexError> {
        let mut items = Vec::new();
        while let Some(c) = self.peek() {
            if c == '|' || c == ')' {
                break;
            }
            let atom = self.atom()?;
            items.push(self.quantified(atom)?);
        }
        Ok(match items.len() {
            0 => Node::Empty,
            1 => items.remove(0),
            _ => Node::Concat(items),
        })
    }

    fn quantified(&mut self, atom: Node) -> Result<Node, RegexError> {
        let Some(c) = self.peek() else {
            return Ok(atom);
        };
        let (min, max) = match c {
            '*' => (0, None),
            '+' => (1, None),
            '?' => (0, Some(1)),
            '{' => {
                self.bump();
                self.bounds()?
            }
            _ => return Ok(atom),
        };
        if c != '{' {
            self.bump();
        }
        if matches!(atom, Node::Start | Node::End) {
            return Err(RegexError::BadQuantifierOperand);
        }
        let greedy = !self.eat('?');
        if matches!(self.peek(), Some('*' | '+' | '?' | '{')) {
            return Err(RegexError::BadQuantifierOperand);
        }
        Ok(Node::Repeat {
            node: Box::new(atom),
            min,
            max,
            greedy,
        })
    }

    fn number(&mut self) -> Result<Option<u32>, RegexError> {
        let start = self.pos;
        let mut value: u32 = 0;
        while let Some(d) = self.peek().and_then(|c| c.to_digit(10)) {
            self.pos += 1;
            value = value.saturating_mul(10).saturating_add(d);
        }
        if self.pos == start {
            return Ok(None);
        }
        if value > DUPMAX {
            return Err(RegexError::BadRepetition);
        }
        Ok(Some(value))
    }

    /// Parses `m}`, `m,}` or `m,n}` after an opening brace.
    fn bounds(&mut self) -> Result<(u32, Option<u32>), RegexError> {
        let min = self.number()?.ok_or(RegexError::BadRepetition)?;
        let max = if self.eat(',') {
            self.number()?
        } else {
            Some(min)
        };
        if !self.eat('}') {
            return Err(RegexError::UnbalancedBraces);
        }
        if max.is_some_and(|max| max < min) {
            return Err(RegexError::BadRepetition);
        }
        Ok((min, max))
    }

    fn atom(&mut self) -> Result<Node, RegexError> {
        let Some(c) = self.bump() else {
            return Ok(Node::Empty);
        };
        match c {
            '(' => self.group(),
            '[' => self.class().map(Node::Class),
            '.' => Ok(Node::Any),
            '^' => Ok(Node::Start),
            '$' => Ok(Node::End),
            '\\' => self.escape(),
            '*' | '+' | '?' | '{' => Err(RegexError::BadQuantifierOperand),
            c => Ok(Node::Literal(c)),
        }
    }

    fn group(&mut self) -> Result<Node, RegexError> {
        self.depth += 1;
        if self.depth > self.max_nesting {
            return Err(RegexError::TooComplex);
        }
        if self.peek() == Some('?') {
            self.bump();
            if !self.eat(':') {
                return Err(RegexError::BadQuantifierOperand);
            }
        }
        let inner = self.alternation()?;
        if !self.eat(')') {
            return Err(RegexError::UnbalancedParens);
        }
        self.depth -= 1;
        Ok(Node::Group(Box::new(inner)))
    }

    fn escape(&mut self) -> Result<Node, RegexError> {
        let c = self.bump().ok_or(RegexError::BadEscape)?;
        let node = match c {
            'd' => Node::Class(ClassSet::builtin(Builtin::Digit, false)),
            'D' => Node::Class(ClassSet::builtin(Builtin::Digit, true)),
            'w' => Node::Class(ClassSet::builtin(Builtin::Word, false)),
            'W' => Node::Class(ClassSet::builtin(Builtin::Word, true)),
            's' => Node::Class(ClassSet::builtin(Builtin::Space, false)),
            'S' => Node::Class(ClassSet::builtin(Builtin::Space, true)),
            other => Node::Literal(simple_escape(other)?),
        };
        Ok(node)
    }

    fn class(&mut self) -> Result<ClassSet, RegexError> {
        let negated = self.eat('^');
        let mut items = Vec::new();
        let mut first = true;
        loop {
            let c = self.bump().ok_or(RegexError::UnbalancedBrackets)?;
            if c == ']' && !first {
                break;
            }
            first = false;

            let lo = match c {
                '[' if self.eat(':') => {
                    items.push(self.posix_class()?);
                    continue;
                }
                '\\' => match self.bump().ok_or(RegexError::UnbalancedBrackets)? {
                    'd' => Err(Builtin::Digit),
                    'w' => Err(Builtin::Word),
                    's' => Err(Builtin::Space),
                    other => Ok(simple_escape(other)?),
                },
                c => Ok(c),
            };
            let lo = match lo {
                Ok(lo) => lo,
                Err(class) => {
                    items.push(ClassItem::Builtin {
                        class,
                        negated: false,
                    });
                    continue;
                }
            };

            let is_range = self.peek() == Some('-')
                && self.chars.get(self.pos + 1).is_some_and(|&next| next != ']');
            if is_range {
                self.bump();
                let hi = match self.bump().ok_or(RegexError::UnbalancedBrackets)? {
                    '\\' => simple_escape(self.bump().ok_or(RegexError::UnbalancedBrackets)?)?,
                    hi => hi,
                };
                if hi < lo {
                    return Err(RegexError::BadRange);
                }
                items.push(ClassItem::Range(lo, hi));
            } else {
                items.push(ClassItem::Range(lo, lo));
            }
        }
        Ok(ClassSet { negated, items })
    }

    /// Parses the rest of `[:name:]` after `[:`.
    fn posix_class(&mut self) -> Result<ClassItem, RegexError> {
        let mut name = String::new();
        loop {
            match self.bump() {
                Some(':') if self.eat(']') => break,
                Some(c) if c.is_ascii_alphabetic() => name.push(c),
                Some(_) => return Err(RegexError::BadClass),
                None => return Err(RegexError::UnbalancedBrackets),
            }
        }
        let class = Builtin::from_posix(&name).ok_or(RegexError::BadClass)?;
        Ok(ClassItem::Builtin {
            class,
            negated: false,
        })
    }
}

fn simple_escape(c: char) -> Result<char, RegexError> {
    match c {
        'n' => Ok('\n'),
        't' => Ok('\t'),
        'r' => Ok('\r'),
        'f' => Ok('\u{c}'),
        'v' => Ok('\u{b}'),
        c if c.is_alphanumeric() => Err(RegexError::BadEscape),
        c => Ok(c),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Inst {
    Char(char),
    Any,
    Class(usize),
    Start,
    End,
    Split(usize, usize),
    Jmp(usize),
    Match,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Program {
    insts: Vec<Inst>,
    classes: Vec<ClassSet>,
    case_insensitive: bool,
}

fn fold(c: char) -> char {
    c.to_lowercase().next().unwrap_or(c)
}

struct Compiler {
    insts: Vec<Inst>,
    classes: Vec<ClassSet>,
    case_insensitive: bool,
    max_states: usize,
    steps: usize,
}

impl Compiler {
    fn emit(&mut self, inst: Inst) -> Result<usize, RegexError> {
        if self.insts.len() >= self.max_states {
            return Err(RegexError::TooManyStates);
        }
        self.insts.push(inst);
        Ok(self.insts.len() - 1)
    }

    fn patch_split(&mut self, at: usize, first: usize, second: usize) {
        self.insts[at] = Inst::Split(first, second);
    }

    fn compile(&mut self, node: &Node) -> Result<(), RegexError> {
        // Repetitions of empty groups emit nothing, so count visits too.
        self.steps += 1;
        if self.steps > self.max_states.saturating_mul(4) {
            return Err(RegexError::TooComplex);
        }
        match node {
            Node::Empty => {}
            Node::Literal(c) => {
                let c = if self.case_insensitive { fold(*c) } else { *c };
                self.emit(Inst::Char(c))?;
            }
            Node::Any => {
                self.emit(Inst::Any)?;
            }
            Node::Class(set) => {
                self.classes.push(set.clone());
                self.emit(Inst::Class(self.classes.len() - 1))?;
            }
            Node::Start => {
                self.emit(Inst::Start)?;
            }
            Node::End => {
                self.emit(Inst::End)?;
            }
            Node::Concat(items) => {
                for item in items {
                    self.compile(item)?;
                }
            }
            Node::Group(inner) => self.compile(inner)?,
            Node::Alternate(branches) => {
                let mut exits = Vec::new();
                for (i, branch) in branches.iter().enumerate() {
                    if i + 1 == branches.len() {
                        self.compile(branch)?;
                    } else {
                        let split = self.emit(Inst::Split(0, 0))?;
                        self.compile(branch)?;
                        exits.push(self.emit(Inst::Jmp(0))?);
                        let next = self.insts.len();
                        self.patch_split(split, split + 1, next);
                    }
                }
                let end = self.insts.len();
                for exit in exits {
                    self.insts[exit] = Inst::Jmp(end);
                }
            }
            Node::Repeat {
                node,
                min,
                max,
                greedy,
            } => {
                for _ in 0..*min {
                    self.compile(node)?;
                }
                match max {
                    None => {
                        let split = self.emit(Inst::Split(0, 0))?;
                        self.compile(node)?;
                        self.emit(Inst::Jmp(split))?;
                        let end = self.insts.len();
                        self.order_split(split, end, *greedy);
                    }
                    Some(max) => {
                        let mut splits = Vec::new();
                        for _ in *min..*max {
                            splits.push(self.emit(Inst::Split(0, 0))?);
                            self.compile(node)?;
                        }
                        let end = self.insts.len();
                        for split in splits {
                            self.order_split(split, end, *greedy);
                        }
                    }
                }
            }
        }
        Ok(())
    }

    fn order_split(&mut self, split: usize, end: usize, greedy: bool) {
        if greedy {
            self.patch_split(split, split + 1, end);
        } else {
            self.patch_split(split, end, split + 1);
        }
    }
}

impl Program {
    pub fn compile(
        pattern: &str,
        case_insensitive: bool,
        limits: &RegexLimits,
    ) -> Result<Program, RegexError> {
        let tree = parse(pattern, limits)?;
        let mut compiler = Compiler {
            insts: Vec::new(),
            classes: Vec::new(),
            case_insensitive,
            max_states: limits.max_states,
            steps: 0,
        };
        compiler.compile(&tree)?;
        compiler.emit(Inst::Match)?;
        Ok(Program {
            insts: compiler.insts,
            classes: compiler.classes,
            case_insensitive,
        })
    }

    pub fn len(&self) -> usize {
        self.insts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.insts.is_empty()
    }

    /// Approximate bytes the compiled program occupies.
    pub fn footprint(&self) -> usize {
        self.insts.len() * size_of::<Inst>()
            + self
                .classes
                .iter()
                .map(|c| size_of::<ClassSet>() + c.items.len() * size_of::<ClassItem>())
                .sum::<usize>()
    }

    fn char_matches(&self, want: char, got: char) -> bool {
        if self.case_insensitive {
            fold(got) == want
        } else {
            got == want
        }
    }

    /// Searches `text` for a match anywhere. `cancel` is polled once per step;
    /// when it returns `true` the search stops with [`RegexError::Cancelled`].
    pub fn is_match(
        &self,
        text: &str,
        arena: &Arena,
        limits: &RegexLimits,
        cancel: &mut dyn FnMut() -> bool,
    ) -> Result<bool, RegexError> {
        let chars: Vec<char> = text.chars().collect();
        let width = chars.len() + 1;
        let bits = self.insts.len().saturating_mul(width);
        let bitmap_bytes = bits.div_ceil(8);
        if bitmap_bytes > limits.max_match_bytes {
            return Err(RegexError::OutOfMemory);
        }
        arena.allocate(bitmap_bytes + chars.len() * size_of::<char>());

        let mut visited = vec![0u64; bits.div_ceil(64)];
        let mut stack: Vec<(usize, usize)> = Vec::new();
        let mut charged_slots = 0usize;

        for start in 0..width {
            stack.push((0, start));
            while let Some((pc, pos)) = stack.pop() {
                if cancel() {
                    return Err(RegexError::Cancelled);
                }
                let key = pc * width + pos;
                let (word, bit) = (key / 64, 1u64 << (key % 64));
                if visited[word] & bit != 0 {
                    continue;
                }
                visited[word] |= bit;

                match self.insts[pc] {
                    Inst::Char(want) => {
                        if chars.get(pos).is_some_and(|&got| self.char_matches(want, got)) {
                            stack.push((pc + 1, pos + 1));
                        }
                    }
                    Inst::Any => {
                        if pos < chars.len() {
                            stack.push((pc + 1, pos + 1));
                        }
                    }
                    Inst::Class(i) => {
                        if chars
                            .get(pos)
                            .is_some_and(|&c| self.classes[i].matches(c, self.case_insensitive))
                        {
                            stack.push((pc + 1, pos + 1));
                        }
                    }
                    Inst::Start => {
                        if pos == 0 {
                            stack.push((pc + 1, pos));
                        }
                    }
                    Inst::End => {
                        if pos == chars.len() {
                            stack.push((pc + 1, pos));
                        }
                    }
                    Inst::Split(first, second) => {
                        stack.push((second, pos));
                        stack.push((first, pos));
                    }
                    Inst::Jmp(target) => stack.push((target, pos)),
                    Inst::Match => return Ok(true),
                }

                if stack.len() > charged_slots {
                    let grow = stack.len().max(64);
                    arena.allocate(grow * size_of::<(usize, usize)>());
                    charged_slots += grow;
                }
            }
        }
        Ok(false)
    }
}
