//! Token cursor with peek / eat / match

use crate::error::CommandError;

use super::tokens::DELIMITERS;

/// Split a command on tabs and spaces, dropping empty tokens.
pub fn tokenize(command: &str) -> Vec<&str> {
    command.split(DELIMITERS).filter(|t| !t.is_empty()).collect()
}

/// Read position over the tokens of one command.
#[derive(Debug, Clone)]
pub struct Cursor<'a> {
    tokens: Vec<&'a str>,
    pos: usize,
}

impl<'a> Cursor<'a> {
    pub fn new(command: &'a str) -> Self {
        Self {
            tokens: tokenize(command),
            pos: 0,
        }
    }

    /// First remaining token.
    pub fn peek(&self) -> Result<&'a str, CommandError> {
        self.tokens.get(self.pos).copied().ok_or(CommandError::NoArgument)
    }

    /// Drop the first remaining token. No-op at the end.
    pub fn eat(&mut self) {
        if self.pos < self.tokens.len() {
            self.pos += 1;
        }
    }

    /// Consume the next token if it equals `expected` exactly.
    pub fn match_token(&mut self, expected: &str) -> Result<bool, CommandError> {
        if self.peek()? == expected {
            self.eat();
            Ok(true)
        } else {
            Ok(false)
        }
    }

    /// Peek and eat.
    pub fn next_token(&mut self) -> Result<&'a str, CommandError> {
        let token = self.peek()?;
        self.eat();
        Ok(token)
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn remaining(&self) -> &[&'a str] {
        &self.tokens[self.pos..]
    }

    pub fn is_empty(&self) -> bool {
        self.pos >= self.tokens.len()
    }
}
