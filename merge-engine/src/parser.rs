//! Recursive-descent parser producing signature-addressed trees.
//!
//! Signatures by construct:
//!
//! | construct | signature |
//! |---|---|
//! | `import "p"` | `import:p` |
//! | `export T n = e` | `export:n` |
//! | `sub n(...) {}` | `sub:n` |
//! | `n(args) {}` | `funBlock:n[:args]` |
//! | `T n = e` | `variable:T:n` |
//! | `extern T n` | `extern:T:n` |
//! | `$M(e)` | `macro:$M` |
//! | `!n(args)` | `directive:n[:args]` |
//! | `use n(args)` | `use:n:args` |
//! | `n(args)` | `funCall:n` |
//! | `a::b(args)` | `methodReference:a:b` |
//! | `if`, `else if`, `else` | `if`, `elseif`, `else` |
//!
//! Argument text is the concatenation of token texts, so whitespace and
//! comments never reach a signature.
//!
//! Calls and conditionals may legally repeat inside one block. They keep the
//! plain signature until a sibling collides; at that point the earlier
//! sibling is re-keyed in place and the tag is remembered as repeatable for
//! the rest of that block. Calls are keyed by their first argument,
//! conditionals by position. A key that still collides gets a `#n` suffix.

use std::collections::HashSet;
use std::fmt;
use std::ops::Range;
use std::sync::Arc;

use crate::lexer::{Token, TokenKind, TokenSource};
use crate::types::{ChildMap, NodeKind, ScriptNode, ScriptTree};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    UnexpectedChar { ch: char, line: usize, column: usize },
    UnterminatedString { line: usize, column: usize },
    UnterminatedComment { line: usize, column: usize },
    UnexpectedToken {
        found: String,
        expected: String,
        line: usize,
        column: usize,
    },
    UnexpectedEof { expected: String },
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParseError::UnexpectedChar { ch, line, column } => {
                write!(f, "unexpected character {:?} at {}:{}", ch, line, column)
            }
            ParseError::UnterminatedString { line, column } => {
                write!(f, "unterminated string starting at {}:{}", line, column)
            }
            ParseError::UnterminatedComment { line, column } => {
                write!(f, "unterminated comment starting at {}:{}", line, column)
            }
            ParseError::UnexpectedToken {
                found,
                expected,
                line,
                column,
            } => write!(
                f,
                "expected {} but found {:?} at {}:{}",
                expected, found, line, column
            ),
            ParseError::UnexpectedEof { expected } => {
                write!(f, "expected {} but reached end of file", expected)
            }
        }
    }
}

impl std::error::Error for ParseError {}

/// Grammar a file is read with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Syntax {
    Script,
    Xml,
}

impl Syntax {
    pub fn parse(self, text: &str) -> Result<ScriptTree, ParseError> {
        match self {
            Syntax::Script => parse(text),
            Syntax::Xml => crate::xml::parse_xml(text),
        }
    }
}

/// Parse script text into a tree. Identical input gives identical trees.
pub fn parse(text: &str) -> Result<ScriptTree, ParseError> {
    let source = Arc::new(TokenSource::tokenize(text)?);
    let mut parser = Parser {
        source: Arc::clone(&source),
        pos: 0,
    };

    let mut children = ChildMap::default();
    let mut scope = BlockScope::default();
    while !parser.at_end() {
        parser.statement(&mut children, &mut scope)?;
    }

    let root = ScriptNode::container(
        String::new(),
        NodeKind::Root,
        0..source.len(),
        &source,
        children,
        None,
    );
    Ok(ScriptTree::new(root))
}

/// Tags found to repeat within one container being built.
#[derive(Debug, Default)]
struct BlockScope {
    repeatable: HashSet<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Repeat {
    /// A collision is a redefinition: the later construct replaces the earlier.
    Never,
    /// Keyed by first argument once repeated.
    Call,
    /// Keyed by position once repeated.
    Conditional,
}

const BINARY_OPS: &[&str] = &[
    "+", "-", "*", "/", "%", "&", "|", "^", "&&", "||", "==", "!=", "<", ">", "<=", ">=",
];
const UNARY_OPS: &[&str] = &["~", "!", "-", "+"];

struct Parser {
    source: Arc<TokenSource>,
    pos: usize,
}

impl Parser {
    fn statement(&mut self, children: &mut ChildMap, scope: &mut BlockScope) -> Result<(), ParseError> {
        let start = self.pos;
        let Some(token) = self.peek() else {
            return Err(ParseError::UnexpectedEof {
                expected: "statement".into(),
            });
        };

        let source = Arc::clone(&self.source);
        match (token.kind, source.token_text(start)) {
            (TokenKind::Punct, ";") => {
                self.pos += 1;
                Ok(())
            }
            (TokenKind::Punct, "!") => self.directive(children, scope),
            (TokenKind::Macro, _) => self.macro_call(children, scope),
            (TokenKind::Ident, "import") => self.import(children, scope),
            (TokenKind::Ident, "export") => self.export(children, scope),
            (TokenKind::Ident, "extern") => self.extern_decl(children, scope),
            (TokenKind::Ident, "sub") => self.sub(children, scope),
            (TokenKind::Ident, "use") => self.use_decl(children, scope),
            (TokenKind::Ident, "if") => self.conditional(children, scope),
            (TokenKind::Ident, "else") => Err(self.unexpected("statement")),
            (TokenKind::Ident, _) => match self.peek_at(1).map(|t| (t.kind, source.token_text(start + 1))) {
                Some((TokenKind::Ident, _)) => self.variable(children, scope),
                Some((TokenKind::Punct, "::")) => self.method_reference(children, scope),
                Some((TokenKind::Punct, "(")) => self.call_or_block(children, scope),
                _ => {
                    self.pos += 1;
                    Err(self.unexpected("declaration, call or block"))
                }
            },
            _ => Err(self.unexpected("statement")),
        }
    }

    fn import(&mut self, children: &mut ChildMap, scope: &mut BlockScope) -> Result<(), ParseError> {
        let start = self.pos;
        self.pos += 1;
        let path = self.expect_kind(TokenKind::Str, "import path")?;
        self.eat_punct(";");
        let literal = self.text(path);
        let literal = &literal[1..literal.len() - 1];
        let node = self.leaf(format!("import:{}", literal), NodeKind::Import, start);
        attach(children, scope, node, Repeat::Never);
        Ok(())
    }

    fn export(&mut self, children: &mut ChildMap, scope: &mut BlockScope) -> Result<(), ParseError> {
        let start = self.pos;
        self.pos += 1;
        self.expect_kind(TokenKind::Ident, "export type")?;
        let name = self.expect_kind(TokenKind::Ident, "export name")?;
        self.expect_punct("=")?;
        self.expression()?;
        self.eat_punct(";");
        let node = self.leaf(format!("export:{}", self.text(name)), NodeKind::Export, start);
        attach(children, scope, node, Repeat::Never);
        Ok(())
    }

    fn extern_decl(&mut self, children: &mut ChildMap, scope: &mut BlockScope) -> Result<(), ParseError> {
        let start = self.pos;
        self.pos += 1;
        let ty = self.expect_kind(TokenKind::Ident, "extern type")?;
        let name = self.expect_kind(TokenKind::Ident, "extern name")?;
        self.eat_punct(";");
        let signature = format!("extern:{}:{}", self.text(ty), self.text(name));
        let node = self.leaf(signature, NodeKind::Extern, start);
        attach(children, scope, node, Repeat::Never);
        Ok(())
    }

    fn variable(&mut self, children: &mut ChildMap, scope: &mut BlockScope) -> Result<(), ParseError> {
        let start = self.pos;
        let ty = self.expect_kind(TokenKind::Ident, "type")?;
        let name = self.expect_kind(TokenKind::Ident, "variable name")?;
        if self.eat_punct("=") {
            self.expression()?;
        }
        self.eat_punct(";");
        let signature = format!("variable:{}:{}", self.text(ty), self.text(name));
        let node = self.leaf(signature, NodeKind::Variable, start);
        attach(children, scope, node, Repeat::Never);
        Ok(())
    }

    fn sub(&mut self, children: &mut ChildMap, scope: &mut BlockScope) -> Result<(), ParseError> {
        let start = self.pos;
        self.pos += 1;
        let name = self.expect_kind(TokenKind::Ident, "sub name")?;
        self.expect_punct("(")?;
        self.params()?;
        self.expect_punct(")")?;
        let signature = format!("sub:{}", self.text(name));
        let node = self.block_node(signature, NodeKind::Sub, start)?;
        attach(children, scope, node, Repeat::Never);
        Ok(())
    }

    fn use_decl(&mut self, children: &mut ChildMap, scope: &mut BlockScope) -> Result<(), ParseError> {
        let start = self.pos;
        self.pos += 1;
        let name = self.expect_kind(TokenKind::Ident, "use name")?;
        self.expect_punct("(")?;
        let args = self.values(")")?;
        self.expect_punct(")")?;
        self.eat_punct(";");
        let signature = format!("use:{}:{}", self.text(name), self.source.joined(args.all));
        let node = self.leaf(signature, NodeKind::Use, start);
        attach(children, scope, node, Repeat::Never);
        Ok(())
    }

    fn directive(&mut self, children: &mut ChildMap, scope: &mut BlockScope) -> Result<(), ParseError> {
        let start = self.pos;
        self.pos += 1;
        let name = self.expect_kind(TokenKind::Ident, "directive name")?;
        self.expect_punct("(")?;
        let args = self.values(")")?;
        self.expect_punct(")")?;
        self.eat_punct(";");
        let signature = with_args(format!("directive:{}", self.text(name)), &self.source.joined(args.all));
        let node = self.leaf(signature, NodeKind::Directive, start);
        attach(children, scope, node, Repeat::Never);
        Ok(())
    }

    fn macro_call(&mut self, children: &mut ChildMap, scope: &mut BlockScope) -> Result<(), ParseError> {
        let start = self.pos;
        self.pos += 1;
        self.expect_punct("(")?;
        if !self.check_punct(")") {
            self.expression()?;
        }
        self.expect_punct(")")?;
        self.eat_punct(";");
        let node = self.leaf(format!("macro:{}", self.text(start)), NodeKind::Macro, start);
        attach(children, scope, node, Repeat::Never);
        Ok(())
    }

    fn method_reference(&mut self, children: &mut ChildMap, scope: &mut BlockScope) -> Result<(), ParseError> {
        let start = self.pos;
        let receiver = self.expect_kind(TokenKind::Ident, "receiver")?;
        self.expect_punct("::")?;
        let method = self.expect_kind(TokenKind::Ident, "method name")?;
        self.expect_punct("(")?;
        self.values(")")?;
        self.expect_punct(")")?;
        self.eat_punct(";");
        let signature = format!(
            "methodReference:{}:{}",
            self.text(receiver),
            self.text(method)
        );
        let node = self.leaf(signature, NodeKind::MethodReference, start);
        attach(children, scope, node, Repeat::Never);
        Ok(())
    }

    /// `name(args);` or `name(args) { ... }`, told apart by what follows `)`.
    fn call_or_block(&mut self, children: &mut ChildMap, scope: &mut BlockScope) -> Result<(), ParseError> {
        let start = self.pos;
        let name = self.expect_kind(TokenKind::Ident, "name")?;
        self.expect_punct("(")?;
        let args = self.values(")")?;
        self.expect_punct(")")?;
        let name = self.text(name).to_string();

        if self.check_punct("{") {
            let signature = with_args(format!("funBlock:{}", name), &self.source.joined(args.all));
            let node = self.block_node(signature, NodeKind::FunBlock, start)?;
            attach(children, scope, node, Repeat::Never);
            return Ok(());
        }

        self.eat_punct(";");
        let mut node = self.leaf(format!("funCall:{}", name), NodeKind::FunCall, start);
        node.first_arg = args.first.map(|r| self.source.joined(r));
        attach(children, scope, node, Repeat::Call);
        Ok(())
    }

    /// `if (c) {} else if (c) {} else {}`. Clauses become children of the
    /// `if` node, sharing its scope with the statements of its body.
    fn conditional(&mut self, children: &mut ChildMap, scope: &mut BlockScope) -> Result<(), ParseError> {
        let start = self.pos;
        self.pos += 1;
        self.condition()?;

        let mut own = ChildMap::default();
        let mut own_scope = BlockScope::default();
        let braces = self.block_into(&mut own, &mut own_scope)?;

        while self.check_ident("else") {
            let clause_start = self.pos;
            self.pos += 1;
            if self.check_ident("if") {
                self.pos += 1;
                self.condition()?;
                let clause = self.block_node("elseif".into(), NodeKind::ElseIf, clause_start)?;
                attach(&mut own, &mut own_scope, clause, Repeat::Conditional);
                continue;
            }
            if self.eat_punct("(") {
                self.values(")")?;
                self.expect_punct(")")?;
            }
            let clause = self.block_node("else".into(), NodeKind::Else, clause_start)?;
            attach(&mut own, &mut own_scope, clause, Repeat::Never);
            break;
        }

        let node = ScriptNode::container(
            "if".into(),
            NodeKind::If,
            start..self.pos,
            &self.source,
            own,
            Some(braces),
        );
        attach(children, scope, node, Repeat::Conditional);
        Ok(())
    }

    fn condition(&mut self) -> Result<(), ParseError> {
        self.expect_punct("(")?;
        self.expression()?;
        self.expect_punct(")")?;
        Ok(())
    }

    /// Parse a `{ ... }` body and wrap it in a container spanning from `start`.
    fn block_node(&mut self, signature: String, kind: NodeKind, start: usize) -> Result<ScriptNode, ParseError> {
        let mut children = ChildMap::default();
        let mut scope = BlockScope::default();
        let braces = self.block_into(&mut children, &mut scope)?;
        Ok(ScriptNode::container(
            signature,
            kind,
            start..self.pos,
            &self.source,
            children,
            Some(braces),
        ))
    }

    fn block_into(&mut self, children: &mut ChildMap, scope: &mut BlockScope) -> Result<(usize, usize), ParseError> {
        let open = self.expect_punct("{")?;
        loop {
            if self.check_punct("}") {
                let close = self.pos;
                self.pos += 1;
                return Ok((open, close));
            }
            if self.at_end() {
                return Err(ParseError::UnexpectedEof {
                    expected: "`}`".into(),
                });
            }
            self.statement(children, scope)?;
        }
    }

    /// `type name (= default)?` separated by commas.
    fn params(&mut self) -> Result<(), ParseError> {
        while !self.check_punct(")") {
            self.expect_kind(TokenKind::Ident, "parameter type")?;
            if self.peek().is_some_and(|t| t.kind == TokenKind::Ident) {
                self.pos += 1;
            }
            if self.eat_punct("=") {
                self.expression()?;
            }
            if !self.eat_punct(",") {
                break;
            }
        }
        Ok(())
    }

    /// Comma-separated values up to (not including) `close`.
    fn values(&mut self, close: &str) -> Result<Values, ParseError> {
        let start = self.pos;
        let mut first = None;
        while !self.check_punct(close) {
            let value_start = self.pos;
            let named = self.peek().is_some_and(|t| t.kind == TokenKind::Ident)
                && self.peek_at(1).is_some_and(|t| t.kind == TokenKind::Punct)
                && self.text(self.pos + 1) == "=";
            if named {
                self.pos += 2;
            }
            self.expression()?;
            if first.is_none() {
                first = Some(value_start..self.pos);
            }
            if !self.eat_punct(",") {
                break;
            }
        }
        Ok(Values {
            all: start..self.pos,
            first,
        })
    }

    fn expression(&mut self) -> Result<(), ParseError> {
        self.unary()?;
        while self
            .peek()
            .is_some_and(|t| t.kind == TokenKind::Punct && BINARY_OPS.contains(&self.text(self.pos)))
        {
            self.pos += 1;
            self.unary()?;
        }
        if self.eat_punct("?") {
            self.expression()?;
            self.expect_punct(":")?;
            self.expression()?;
        }
        Ok(())
    }

    fn unary(&mut self) -> Result<(), ParseError> {
        while self
            .peek()
            .is_some_and(|t| t.kind == TokenKind::Punct && UNARY_OPS.contains(&self.text(self.pos)))
        {
            self.pos += 1;
        }
        self.primary()?;
        loop {
            if self.eat_punct(".") {
                self.expect_kind(TokenKind::Ident, "field name")?;
            } else if self.eat_punct("(") {
                self.values(")")?;
                self.expect_punct(")")?;
            } else if self.eat_punct("[") {
                self.expression()?;
                self.expect_punct("]")?;
            } else {
                return Ok(());
            }
        }
    }

    fn primary(&mut self) -> Result<(), ParseError> {
        let Some(token) = self.peek() else {
            return Err(ParseError::UnexpectedEof {
                expected: "expression".into(),
            });
        };
        match token.kind {
            TokenKind::Number | TokenKind::Str | TokenKind::Macro => {
                self.pos += 1;
                Ok(())
            }
            TokenKind::Ident => {
                self.pos += 1;
                if self.eat_punct("::") {
                    self.expect_kind(TokenKind::Ident, "member name")?;
                }
                Ok(())
            }
            TokenKind::Punct => {
                if self.eat_punct("(") {
                    self.expression()?;
                    self.expect_punct(")")?;
                } else if self.eat_punct("[") {
                    self.values("]")?;
                    self.expect_punct("]")?;
                } else {
                    return Err(self.unexpected("expression"));
                }
                Ok(())
            }
            TokenKind::Text => Err(self.unexpected("expression")),
        }
    }

    fn leaf(&self, signature: String, kind: NodeKind, start: usize) -> ScriptNode {
        ScriptNode::leaf(signature, kind, start..self.pos, &self.source)
    }

    fn at_end(&self) -> bool {
        self.pos >= self.source.len()
    }

    fn peek(&self) -> Option<Token> {
        self.source.token(self.pos).copied()
    }

    fn peek_at(&self, offset: usize) -> Option<Token> {
        self.source.token(self.pos + offset).copied()
    }

    fn text(&self, index: usize) -> &str {
        self.source.token_text(index)
    }

    fn check_punct(&self, punct: &str) -> bool {
        self.peek().is_some_and(|t| t.kind == TokenKind::Punct) && self.text(self.pos) == punct
    }

    fn check_ident(&self, ident: &str) -> bool {
        self.peek().is_some_and(|t| t.kind == TokenKind::Ident) && self.text(self.pos) == ident
    }

    fn eat_punct(&mut self, punct: &str) -> bool {
        if self.check_punct(punct) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect_punct(&mut self, punct: &str) -> Result<usize, ParseError> {
        if self.check_punct(punct) {
            self.pos += 1;
            Ok(self.pos - 1)
        } else {
            Err(self.unexpected(&format!("`{}`", punct)))
        }
    }

    fn expect_kind(&mut self, kind: TokenKind, what: &str) -> Result<usize, ParseError> {
        if self.peek().is_some_and(|t| t.kind == kind) {
            self.pos += 1;
            Ok(self.pos - 1)
        } else {
            Err(self.unexpected(what))
        }
    }

    fn unexpected(&self, expected: &str) -> ParseError {
        match self.peek() {
            Some(token) => ParseError::UnexpectedToken {
                found: self.text(self.pos).to_string(),
                expected: expected.to_string(),
                line: token.line,
                column: token.column,
            },
            None => ParseError::UnexpectedEof {
                expected: expected.to_string(),
            },
        }
    }
}

struct Values {
    all: Range<usize>,
    first: Option<Range<usize>>,
}

fn with_args(signature: String, args: &str) -> String {
    if args.is_empty() {
        signature
    } else {
        format!("{}:{}", signature, args)
    }
}

/// Insert `node` under a sibling-unique signature.
fn attach(children: &mut ChildMap, scope: &mut BlockScope, mut node: ScriptNode, repeat: Repeat) {
    let base = node.signature().to_string();
    let key = match repeat {
        Repeat::Never => base,
        Repeat::Call => call_key(children, scope, &base, node.first_arg.as_deref()),
        Repeat::Conditional => conditional_key(children, scope, &base),
    };
    let key = if repeat == Repeat::Never {
        key
    } else {
        free_key(children, key)
    };
    node.set_signature(key);

    if let Some(previous) = children.insert(node) {
        tracing::debug!(
            signature = %previous.signature(),
            line = previous.line(),
            "Construct redefined in the same block, keeping the later one"
        );
    }
}

fn call_key(children: &mut ChildMap, scope: &mut BlockScope, base: &str, arg: Option<&str>) -> String {
    let prefix = format!("{}:", base);
    if scope.repeatable.contains(base) {
        return match arg {
            Some(arg) => format!("{}{}", prefix, arg),
            None => format!("{}{}", prefix, children.count_prefixed(&prefix)),
        };
    }
    let Some(existing) = children.get(base) else {
        return base.to_string();
    };

    let existing_key = format!("{}{}", prefix, existing.first_arg.as_deref().unwrap_or("0"));
    let existing_key = free_key(children, existing_key);
    children.rekey(base, &existing_key);
    tracing::debug!(from = %base, to = %existing_key, "Call repeats in block, re-keyed earlier sibling");
    scope.repeatable.insert(base.to_string());

    match arg {
        Some(arg) => format!("{}{}", prefix, arg),
        None => format!("{}1", prefix),
    }
}

fn conditional_key(children: &mut ChildMap, scope: &mut BlockScope, base: &str) -> String {
    let prefix = format!("{}:", base);
    if scope.repeatable.contains(base) {
        return format!("{}{}", prefix, children.count_prefixed(&prefix));
    }
    if !children.contains(base) {
        return base.to_string();
    }

    let existing_key = free_key(children, format!("{}0", prefix));
    children.rekey(base, &existing_key);
    tracing::debug!(from = %base, to = %existing_key, "Conditional repeats in block, re-keyed earlier sibling");
    scope.repeatable.insert(base.to_string());
    format!("{}1", prefix)
}

/// `key`, or `key#n` with the smallest free `n` when `key` is taken.
pub(crate) fn free_key(children: &ChildMap, key: String) -> String {
    if !children.contains(&key) {
        return key;
    }
    let mut n = 1;
    loop {
        let candidate = format!("{}#{}", key, n);
        if !children.contains(&candidate) {
            tracing::debug!(signature = %key, suffixed = %candidate, "Indexed signature collides, adding ordinal");
            return candidate;
        }
        n += 1;
    }
}
