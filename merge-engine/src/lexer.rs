//! Tokenizers for script and XML sources.
//!
//! Whitespace and comments never become tokens, but every token keeps its
//! byte span so node text can be sliced from the original source with
//! formatting intact.

use std::ops::Range;

use crate::parser::ParseError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenKind {
    Ident,
    /// `$Name`
    Macro,
    Number,
    Str,
    Punct,
    /// XML character data or a CDATA section, surrounding whitespace trimmed.
    Text,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Token {
    pub kind: TokenKind,
    pub start: usize,
    pub end: usize,
    pub line: usize,
    pub column: usize,
}

const TWO_CHAR_PUNCT: &[&str] = &["::", "&&", "||", "==", "!=", "<=", ">="];
const ONE_CHAR_PUNCT: &str = "(){}[];,=.!~?:+-*/%&|<>^";

/// Source text plus its token stream, shared by every node of a tree.
#[derive(Debug)]
pub struct TokenSource {
    text: String,
    tokens: Vec<Token>,
}

impl TokenSource {
    pub fn tokenize(text: impl Into<String>) -> Result<Self, ParseError> {
        let text = text.into();
        let tokens = Lexer::new(&text).run()?;
        Ok(Self { text, tokens })
    }

    /// Tokenize XML markup: `<`, `</`, `>`, `/>` and `=` are punctuation,
    /// names are identifiers, quoted attribute values are strings. Comments,
    /// the prolog and `<!...>` declarations are skipped.
    pub fn tokenize_xml(text: impl Into<String>) -> Result<Self, ParseError> {
        let text = text.into();
        let tokens = Lexer::new(&text).run_xml()?;
        Ok(Self { text, tokens })
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn tokens(&self) -> &[Token] {
        &self.tokens
    }

    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }

    pub fn token(&self, index: usize) -> Option<&Token> {
        self.tokens.get(index)
    }

    pub fn token_text(&self, index: usize) -> &str {
        match self.tokens.get(index) {
            Some(t) => &self.text[t.start..t.end],
            None => "",
        }
    }

    /// Byte range covered by the tokens in `tokens`. An empty token range
    /// maps to an empty byte range at the next token (or end of text).
    pub fn byte_range(&self, tokens: Range<usize>) -> Range<usize> {
        if tokens.start >= tokens.end {
            let at = self
                .tokens
                .get(tokens.start)
                .map(|t| t.start)
                .unwrap_or(self.text.len());
            return at..at;
        }
        let start = self.tokens[tokens.start].start;
        let end = self.tokens[tokens.end - 1].end;
        start..end
    }

    /// Token texts concatenated with nothing in between.
    pub fn joined(&self, tokens: Range<usize>) -> String {
        tokens.map(|i| self.token_text(i)).collect()
    }

    /// Token-by-token equality of two ranges, possibly from different sources.
    pub fn same_tokens(&self, ours: Range<usize>, other: &TokenSource, theirs: Range<usize>) -> bool {
        ours.len() == theirs.len()
            && ours
                .zip(theirs)
                .all(|(a, b)| {
                    self.tokens[a].kind == other.tokens[b].kind
                        && self.token_text(a) == other.token_text(b)
                })
    }
}

struct Lexer<'a> {
    text: &'a str,
    bytes: &'a [u8],
    pos: usize,
    line: usize,
    line_start: usize,
}

impl<'a> Lexer<'a> {
    fn new(text: &'a str) -> Self {
        Self {
            text,
            bytes: text.as_bytes(),
            pos: 0,
            line: 1,
            line_start: 0,
        }
    }

    fn run(mut self) -> Result<Vec<Token>, ParseError> {
        let mut tokens = Vec::new();
        loop {
            self.skip_trivia()?;
            let Some(c) = self.peek_char() else {
                break;
            };
            let start = self.pos;
            let line = self.line;
            let column = self.column();

            let kind = if c == '"' {
                self.string(line, column)?;
                TokenKind::Str
            } else if c.is_ascii_digit()
                || (c == '.' && self.byte_at(self.pos + 1).is_some_and(|b| b.is_ascii_digit()))
            {
                self.number();
                TokenKind::Number
            } else if c == '$' {
                self.pos += 1;
                self.eat_while(is_ident_continue);
                if self.pos == start + 1 {
                    return Err(ParseError::UnexpectedChar { ch: c, line, column });
                }
                TokenKind::Macro
            } else if is_ident_start(c) {
                self.eat_while(is_ident_continue);
                TokenKind::Ident
            } else if let Some(p) = TWO_CHAR_PUNCT
                .iter()
                .find(|p| self.text[self.pos..].starts_with(**p))
            {
                self.pos += p.len();
                TokenKind::Punct
            } else if ONE_CHAR_PUNCT.contains(c) {
                self.pos += 1;
                TokenKind::Punct
            } else {
                return Err(ParseError::UnexpectedChar { ch: c, line, column });
            };

            tokens.push(Token {
                kind,
                start,
                end: self.pos,
                line,
                column,
            });
        }
        Ok(tokens)
    }

    fn run_xml(mut self) -> Result<Vec<Token>, ParseError> {
        let mut tokens = Vec::new();
        loop {
            self.eat_while(char::is_whitespace);
            if self.pos >= self.text.len() {
                break;
            }
            let line = self.line;
            let column = self.column();
            let rest = &self.text[self.pos..];

            if rest.starts_with("<!--") {
                if !self.skip_past("-->") {
                    return Err(ParseError::UnterminatedComment { line, column });
                }
            } else if rest.starts_with("<![CDATA[") {
                let start = self.pos;
                if !self.skip_past("]]>") {
                    return Err(ParseError::UnterminatedString { line, column });
                }
                tokens.push(Token {
                    kind: TokenKind::Text,
                    start,
                    end: self.pos,
                    line,
                    column,
                });
            } else if rest.starts_with("<?") {
                if !self.skip_past("?>") {
                    return Err(ParseError::UnexpectedEof {
                        expected: "'?>'".into(),
                    });
                }
            } else if rest.starts_with("<!") {
                if !self.skip_past(">") {
                    return Err(ParseError::UnexpectedEof {
                        expected: "'>'".into(),
                    });
                }
            } else if rest.starts_with('<') {
                let len = if rest.starts_with("</") { 2 } else { 1 };
                self.pos += len;
                tokens.push(Token {
                    kind: TokenKind::Punct,
                    start: self.pos - len,
                    end: self.pos,
                    line,
                    column,
                });
                self.xml_tag(&mut tokens)?;
            } else {
                tokens.push(self.char_data());
            }
        }
        Ok(tokens)
    }

    /// Attributes up to and including the tag's `>` or `/>`.
    fn xml_tag(&mut self, tokens: &mut Vec<Token>) -> Result<(), ParseError> {
        loop {
            self.eat_while(char::is_whitespace);
            let start = self.pos;
            let line = self.line;
            let column = self.column();
            let Some(c) = self.peek_char() else {
                return Err(ParseError::UnexpectedEof {
                    expected: "'>'".into(),
                });
            };

            let mut closed = false;
            let kind = match c {
                '>' => {
                    self.pos += 1;
                    closed = true;
                    TokenKind::Punct
                }
                '/' if self.byte_at(self.pos + 1) == Some(b'>') => {
                    self.pos += 2;
                    closed = true;
                    TokenKind::Punct
                }
                '=' => {
                    self.pos += 1;
                    TokenKind::Punct
                }
                '"' | '\'' => {
                    self.quoted(c, line, column)?;
                    TokenKind::Str
                }
                c if is_name_start(c) => {
                    self.eat_while(is_name_char);
                    TokenKind::Ident
                }
                c => return Err(ParseError::UnexpectedChar { ch: c, line, column }),
            };
            tokens.push(Token {
                kind,
                start,
                end: self.pos,
                line,
                column,
            });
            if closed {
                return Ok(());
            }
        }
    }

    /// Attribute value in `quote`s. XML has no escapes inside them.
    fn quoted(&mut self, quote: char, line: usize, column: usize) -> Result<(), ParseError> {
        self.bump();
        loop {
            match self.bump() {
                Some(c) if c == quote => return Ok(()),
                Some(_) => {}
                None => return Err(ParseError::UnterminatedString { line, column }),
            }
        }
    }

    /// Text up to the next `<`. Starts on a non-whitespace character.
    fn char_data(&mut self) -> Token {
        let start = self.pos;
        let line = self.line;
        let column = self.column();
        let mut end = self.pos;
        while let Some(c) = self.peek_char() {
            if c == '<' {
                break;
            }
            self.bump();
            if !c.is_whitespace() {
                end = self.pos;
            }
        }
        Token {
            kind: TokenKind::Text,
            start,
            end,
            line,
            column,
        }
    }

    /// Advance past the next `end`. False when the text runs out first.
    fn skip_past(&mut self, end: &str) -> bool {
        loop {
            if self.text[self.pos..].starts_with(end) {
                self.pos += end.len();
                return true;
            }
            if self.bump().is_none() {
                return false;
            }
        }
    }

    fn peek_char(&self) -> Option<char> {
        self.text[self.pos..].chars().next()
    }

    fn byte_at(&self, index: usize) -> Option<u8> {
        self.bytes.get(index).copied()
    }

    fn column(&self) -> usize {
        self.text[self.line_start..self.pos].chars().count() + 1
    }

    fn bump(&mut self) -> Option<char> {
        let c = self.peek_char()?;
        self.pos += c.len_utf8();
        if c == '\n' {
            self.line += 1;
            self.line_start = self.pos;
        }
        Some(c)
    }

    fn eat_while(&mut self, pred: impl Fn(char) -> bool) {
        while let Some(c) = self.peek_char() {
            if !pred(c) {
                break;
            }
            self.bump();
        }
    }

    fn skip_trivia(&mut self) -> Result<(), ParseError> {
        loop {
            match (self.byte_at(self.pos), self.byte_at(self.pos + 1)) {
                (Some(b), _) if b.is_ascii_whitespace() => {
                    self.bump();
                }
                (Some(b'/'), Some(b'/')) => {
                    self.eat_while(|c| c != '\n');
                }
                (Some(b'/'), Some(b'*')) => {
                    let line = self.line;
                    let column = self.column();
                    self.pos += 2;
                    loop {
                        if self.text[self.pos..].starts_with("*/") {
                            self.pos += 2;
                            break;
                        }
                        if self.bump().is_none() {
                            return Err(ParseError::UnterminatedComment { line, column });
                        }
                    }
                }
                (Some(_), _) if self.peek_char().is_some_and(char::is_whitespace) => {
                    self.bump();
                }
                _ => return Ok(()),
            }
        }
    }

    fn string(&mut self, line: usize, column: usize) -> Result<(), ParseError> {
        self.bump();
        loop {
            match self.bump() {
                Some('"') => return Ok(()),
                Some('\\') => {
                    self.bump();
                }
                Some(_) => {}
                None => return Err(ParseError::UnterminatedString { line, column }),
            }
        }
    }

    /// Integers, decimals, exponents and trailing type suffixes (`1.5f`, `0x1F`).
    fn number(&mut self) {
        let mut prev = '\0';
        while let Some(c) = self.peek_char() {
            let take = c.is_ascii_alphanumeric()
                || c == '_'
                || (c == '.'
                    && self
                        .byte_at(self.pos + 1)
                        .is_some_and(|b| b.is_ascii_digit()))
                || ((c == '+' || c == '-') && (prev == 'e' || prev == 'E'));
            if !take {
                break;
            }
            prev = c;
            self.bump();
        }
    }
}

fn is_ident_start(c: char) -> bool {
    c == '_' || c.is_alphabetic()
}

fn is_ident_continue(c: char) -> bool {
    c == '_' || c.is_alphanumeric()
}

fn is_name_start(c: char) -> bool {
    c == '_' || c == ':' || c.is_alphabetic()
}

fn is_name_char(c: char) -> bool {
    is_name_start(c) || c == '-' || c == '.' || c.is_alphanumeric()
}
