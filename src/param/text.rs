//! Human-readable text format for parameter messages
//!
//! ```text
//! # comment
//! base_lr: 0.01
//! lr_policy: "step"
//! solver_mode: CPU
//! net_param {
//!   layer { name: "data" type: "MemoryData" }
//! }
//! ```
//!
//! Parsing produces a tree of [`Entry`] values that each message type maps
//! onto its own fields through [`TextFormat`].

use std::fmt::Display;

use super::ParamError;

/// Deepest `{ ... }` nesting accepted, as in protobuf's text parser.
pub const MAX_DEPTH: usize = 100;

/// A message with a text representation.
pub trait TextFormat: Default {
    /// Apply one parsed entry; unknown names are an error.
    fn merge_entry(&mut self, entry: Entry) -> Result<(), ParamError>;

    fn print(&self, out: &mut Printer);

    fn from_text(text: &str) -> Result<Self, ParamError> {
        let mut msg = Self::default();
        for entry in parse(text)? {
            msg.merge_entry(entry)?;
        }
        Ok(msg)
    }

    fn to_text(&self) -> String {
        let mut out = Printer::new();
        self.print(&mut out);
        out.finish()
    }
}

/// One `name: value` or `name { ... }` item
#[derive(Debug, Clone, PartialEq)]
pub struct Entry {
    pub name: String,
    pub value: Value,
    pub line: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    /// Quoted string, unescaped
    Str(String),
    /// Number, identifier or boolean literal
    Word(String),
    Message(Vec<Entry>),
}

impl Entry {
    fn error(&self, message: impl Into<String>) -> ParamError {
        ParamError::Text {
            line: self.line,
            message: format!("{}: {}", self.name, message.into()),
        }
    }

    fn word(&self) -> Result<&str, ParamError> {
        match &self.value {
            Value::Word(w) => Ok(w),
            _ => Err(self.error("expected a scalar value")),
        }
    }

    pub fn string(&self) -> Result<String, ParamError> {
        match &self.value {
            Value::Str(s) => Ok(s.clone()),
            _ => Err(self.error("expected a quoted string")),
        }
    }

    pub fn i32(&self) -> Result<i32, ParamError> {
        let w = self.word()?;
        w.parse().map_err(|_| self.error(format!("invalid int32 '{}'", w)))
    }

    pub fn u32(&self) -> Result<u32, ParamError> {
        let w = self.word()?;
        w.parse().map_err(|_| self.error(format!("invalid uint32 '{}'", w)))
    }

    pub fn i64(&self) -> Result<i64, ParamError> {
        let w = self.word()?;
        w.parse().map_err(|_| self.error(format!("invalid int64 '{}'", w)))
    }

    pub fn f32(&self) -> Result<f32, ParamError> {
        let w = self.word()?;
        let trimmed = w.strip_suffix(['f', 'F']).filter(|s| !s.is_empty() && !s.ends_with(['n', 'N']));
        trimmed
            .unwrap_or(w)
            .parse()
            .map_err(|_| self.error(format!("invalid float '{}'", w)))
    }

    pub fn bool(&self) -> Result<bool, ParamError> {
        match self.word()? {
            "true" | "True" | "t" | "1" => Ok(true),
            "false" | "False" | "f" | "0" => Ok(false),
            other => Err(self.error(format!("invalid bool '{}'", other))),
        }
    }

    /// Enum value given as an identifier.
    pub fn ident(&self) -> Result<&str, ParamError> {
        self.word()
    }

    pub fn message<M: TextFormat>(self) -> Result<M, ParamError> {
        let mut msg = M::default();
        self.merge_message(&mut msg)?;
        Ok(msg)
    }

    pub fn merge_message<M: TextFormat>(self, target: &mut M) -> Result<(), ParamError> {
        match self.value {
            Value::Message(entries) => {
                for entry in entries {
                    target.merge_entry(entry)?;
                }
                Ok(())
            }
            _ => Err(ParamError::Text {
                line: self.line,
                message: format!("{}: expected a {{ ... }} block", self.name),
            }),
        }
    }

    /// Error for a field name the message does not define.
    pub fn unknown(&self, message: &str) -> ParamError {
        ParamError::Text {
            line: self.line,
            message: format!("message {} has no field named \"{}\"", message, self.name),
        }
    }
}

// =============================================================================
// Lexer
// =============================================================================

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Word(String),
    Str(String),
    Colon,
    Open,
    Close,
}

struct Lexer<'a> {
    chars: std::iter::Peekable<std::str::Chars<'a>>,
    line: usize,
}

impl<'a> Lexer<'a> {
    fn new(text: &'a str) -> Self {
        Self {
            chars: text.chars().peekable(),
            line: 1,
        }
    }

    fn error(&self, message: impl Into<String>) -> ParamError {
        ParamError::Text {
            line: self.line,
            message: message.into(),
        }
    }

    fn next_token(&mut self) -> Result<Option<(Token, usize)>, ParamError> {
        loop {
            match self.chars.peek().copied() {
                None => return Ok(None),
                Some('\n') => {
                    self.line += 1;
                    self.chars.next();
                }
                Some(c) if c.is_whitespace() || c == ',' || c == ';' => {
                    self.chars.next();
                }
                Some('#') => {
                    while let Some(&c) = self.chars.peek() {
                        if c == '\n' {
                            break;
                        }
                        self.chars.next();
                    }
                }
                Some(_) => break,
            }
        }

        let line = self.line;
        let c = match self.chars.next() {
            Some(c) => c,
            None => return Ok(None),
        };
        let token = match c {
            ':' => Token::Colon,
            '{' | '<' => Token::Open,
            '}' | '>' => Token::Close,
            '"' | '\'' => Token::Str(self.quoted(c)?),
            c if is_word_char(c) => {
                let mut word = String::from(c);
                while let Some(&c) = self.chars.peek() {
                    if !is_word_char(c) {
                        break;
                    }
                    word.push(c);
                    self.chars.next();
                }
                Token::Word(word)
            }
            other => return Err(self.error(format!("unexpected character '{}'", other))),
        };
        Ok(Some((token, line)))
    }

    fn quoted(&mut self, quote: char) -> Result<String, ParamError> {
        let mut out = String::new();
        loop {
            match self.chars.next() {
                None | Some('\n') => return Err(self.error("unterminated string")),
                Some(c) if c == quote => return Ok(out),
                Some('\\') => match self.chars.next() {
                    Some('n') => out.push('\n'),
                    Some('t') => out.push('\t'),
                    Some('r') => out.push('\r'),
                    Some('\\') => out.push('\\'),
                    Some('"') => out.push('"'),
                    Some('\'') => out.push('\''),
                    Some(other) => return Err(self.error(format!("unsupported escape '\\{}'", other))),
                    None => return Err(self.error("unterminated string")),
                },
                Some(c) => out.push(c),
            }
        }
    }
}

fn is_word_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-' | '+')
}

// =============================================================================
// Parser
// =============================================================================

/// Parse text into top-level entries.
pub fn parse(text: &str) -> Result<Vec<Entry>, ParamError> {
    let mut lexer = Lexer::new(text);
    parse_block(&mut lexer, 0)
}

fn parse_block(lexer: &mut Lexer<'_>, depth: usize) -> Result<Vec<Entry>, ParamError> {
    if depth > MAX_DEPTH {
        return Err(lexer.error(format!("message nesting exceeds {} levels", MAX_DEPTH)));
    }
    let nested = depth > 0;
    let mut entries = Vec::new();
    loop {
        let (token, line) = match lexer.next_token()? {
            Some(t) => t,
            None if nested => return Err(lexer.error("missing '}'")),
            None => return Ok(entries),
        };

        let name = match token {
            Token::Word(w) => w,
            Token::Close if nested => return Ok(entries),
            other => {
                return Err(ParamError::Text {
                    line,
                    message: format!("expected a field name, found {:?}", other),
                })
            }
        };

        let mut next = lexer.next_token()?;
        let has_colon = matches!(next, Some((Token::Colon, _)));
        if has_colon {
            next = lexer.next_token()?;
        }

        let value = match next {
            Some((Token::Open, _)) => Value::Message(parse_block(lexer, depth + 1)?),
            Some((Token::Word(w), _)) if has_colon => Value::Word(w),
            Some((Token::Str(s), _)) if has_colon => Value::Str(s),
            _ => {
                return Err(ParamError::Text {
                    line,
                    message: format!("{}: expected ':' and a value, or a {{ ... }} block", name),
                })
            }
        };

        entries.push(Entry { name, value, line });
    }
}

// =============================================================================
// Printer
// =============================================================================

/// Writes messages back out in the same format `parse` accepts.
#[derive(Debug, Default)]
pub struct Printer {
    out: String,
    indent: usize,
}

impl Printer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn finish(self) -> String {
        self.out
    }

    fn line(&mut self, name: &str, value: impl Display) {
        for _ in 0..self.indent {
            self.out.push_str("  ");
        }
        self.out.push_str(&format!("{}: {}\n", name, value));
    }

    pub fn scalar(&mut self, name: &str, value: impl Display) {
        self.line(name, value);
    }

    pub fn string(&mut self, name: &str, value: &str) {
        self.line(name, escape(value));
    }

    pub fn message<M: TextFormat>(&mut self, name: &str, value: &M) {
        for _ in 0..self.indent {
            self.out.push_str("  ");
        }
        self.out.push_str(name);
        self.out.push_str(" {\n");
        self.indent += 1;
        value.print(self);
        self.indent -= 1;
        for _ in 0..self.indent {
            self.out.push_str("  ");
        }
        self.out.push_str("}\n");
    }
}

fn escape(value: &str) -> String {
    let mut out = String::with_capacity(value.len() + 2);
    out.push('"');
    for c in value.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\t' => out.push_str("\\t"),
            '\r' => out.push_str("\\r"),
            c => out.push(c),
        }
    }
    out.push('"');
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_flat_entries() {
        let entries = parse("base_lr: 0.01\n# comment\nnet: \"a b.prototxt\" max_iter:100").unwrap();
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0].f32().unwrap(), 0.01);
        assert_eq!(entries[1].string().unwrap(), "a b.prototxt");
        assert_eq!(entries[1].line, 3);
        assert_eq!(entries[2].i32().unwrap(), 100);
    }

    #[test]
    fn test_nested_blocks() {
        let entries = parse("net_param { layer { name: 'x' } layer: { name: \"y\" } }").unwrap();
        assert_eq!(entries.len(), 1);
        match &entries[0].value {
            Value::Message(inner) => {
                assert_eq!(inner.len(), 2);
                assert_eq!(inner[0].name, "layer");
            }
            other => panic!("expected block, got {:?}", other),
        }
    }

    #[test]
    fn test_escapes() {
        let entries = parse(r#"s: "a\"b\\c\n""#).unwrap();
        assert_eq!(entries[0].string().unwrap(), "a\"b\\c\n");
        assert_eq!(escape("a\"b\\c\n"), r#""a\"b\\c\n""#);
    }

    #[test]
    fn test_float_forms() {
        for (text, expected) in [("1e-8", 1e-8f32), ("0.5f", 0.5), ("-2", -2.0), ("3.", 3.0)] {
            let entries = parse(&format!("x: {}", text)).unwrap();
            assert_eq!(entries[0].f32().unwrap(), expected, "{}", text);
        }
        let entries = parse("x: inf").unwrap();
        assert!(entries[0].f32().unwrap().is_infinite());
    }

    #[test]
    fn test_errors_carry_line() {
        let err = parse("a: 1\nb 2\n").unwrap_err();
        assert!(matches!(err, ParamError::Text { line: 2, .. }), "{:?}", err);

        let err = parse("a { b: 1\n").unwrap_err();
        assert!(matches!(err, ParamError::Text { .. }));

        let err = parse("a: \"open\n").unwrap_err();
        assert!(matches!(err, ParamError::Text { line: 1, .. }));
    }

    #[test]
    fn test_nesting_limit() {
        let at_limit = format!("{}{}", "a {".repeat(MAX_DEPTH), "}".repeat(MAX_DEPTH));
        assert!(parse(&at_limit).is_ok());

        let too_deep = format!("{}{}", "a {".repeat(MAX_DEPTH + 1), "}".repeat(MAX_DEPTH + 1));
        let err = parse(&too_deep).unwrap_err();
        assert!(err.to_string().contains("nesting exceeds 100 levels"), "{}", err);

        // Unterminated input stops at the limit instead of recursing further.
        assert!(parse(&"a{".repeat(1_000_000)).is_err());
        assert!(parse(&"a<".repeat(1_000_000)).is_err());
    }

    #[test]
    fn test_type_mismatch() {
        let entries = parse("x: \"12\" y: abc").unwrap();
        assert!(entries[0].i32().is_err());
        assert!(entries[1].string().is_err());
        assert!(entries[1].bool().is_err());
    }
}
