//! Signature-addressed script trees.
//!
//! Every construct of a script becomes a [`ScriptNode`] keyed by its
//! signature, a string that stays stable across formatting edits so the same
//! construct can be matched between independently parsed files. Signatures
//! are unique among siblings only.

use std::collections::HashMap;
use std::fmt;
use std::ops::Range;
use std::sync::{Arc, OnceLock};

use crate::lexer::TokenSource;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NodeKind {
    Root,
    Import,
    Export,
    Sub,
    FunBlock,
    Variable,
    Extern,
    Macro,
    Directive,
    Use,
    FunCall,
    MethodReference,
    If,
    ElseIf,
    Else,
    /// XML element.
    Element,
}

impl NodeKind {
    pub fn as_str(&self) -> &str {
        match self {
            NodeKind::Root => "root",
            NodeKind::Import => "import",
            NodeKind::Export => "export",
            NodeKind::Sub => "sub",
            NodeKind::FunBlock => "funBlock",
            NodeKind::Variable => "variable",
            NodeKind::Extern => "extern",
            NodeKind::Macro => "macro",
            NodeKind::Directive => "directive",
            NodeKind::Use => "use",
            NodeKind::FunCall => "funCall",
            NodeKind::MethodReference => "methodReference",
            NodeKind::If => "if",
            NodeKind::ElseIf => "elseif",
            NodeKind::Else => "else",
            NodeKind::Element => "element",
        }
    }

    /// `elseif`/`else` clauses hang off their `if` rather than the block.
    pub fn is_clause(&self) -> bool {
        matches!(self, NodeKind::ElseIf | NodeKind::Else)
    }
}

impl fmt::Display for NodeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone)]
pub enum NodeBody {
    Leaf,
    Container {
        children: ChildMap,
        /// Token indices of this node's own `{` and `}`. `None` for the root.
        braces: Option<(usize, usize)>,
    },
}

#[derive(Debug, Clone)]
pub struct ScriptNode {
    signature: String,
    kind: NodeKind,
    /// Half-open token range, trailing `;` included.
    tokens: Range<usize>,
    line: usize,
    source: Arc<TokenSource>,
    text: OnceLock<String>,
    /// First call argument, used to key repeated calls.
    pub(crate) first_arg: Option<String>,
    body: NodeBody,
}

impl ScriptNode {
    pub(crate) fn leaf(
        signature: String,
        kind: NodeKind,
        tokens: Range<usize>,
        source: &Arc<TokenSource>,
    ) -> Self {
        let line = source.token(tokens.start).map(|t| t.line).unwrap_or(1);
        Self {
            signature,
            kind,
            tokens,
            line,
            source: Arc::clone(source),
            text: OnceLock::new(),
            first_arg: None,
            body: NodeBody::Leaf,
        }
    }

    pub(crate) fn container(
        signature: String,
        kind: NodeKind,
        tokens: Range<usize>,
        source: &Arc<TokenSource>,
        children: ChildMap,
        braces: Option<(usize, usize)>,
    ) -> Self {
        let mut node = Self::leaf(signature, kind, tokens, source);
        node.body = NodeBody::Container { children, braces };
        node
    }

    pub fn signature(&self) -> &str {
        &self.signature
    }

    pub fn kind(&self) -> NodeKind {
        self.kind
    }

    pub fn line(&self) -> usize {
        self.line
    }

    pub fn token_range(&self) -> Range<usize> {
        self.tokens.clone()
    }

    pub fn source(&self) -> &Arc<TokenSource> {
        &self.source
    }

    /// Byte span of this node in its source text.
    pub fn span(&self) -> Range<usize> {
        self.source.byte_range(self.tokens.clone())
    }

    /// Source slice of this node, computed on first access.
    pub fn text(&self) -> &str {
        self.text
            .get_or_init(|| self.source.text()[self.span()].to_string())
    }

    pub fn is_container(&self) -> bool {
        matches!(self.body, NodeBody::Container { .. })
    }

    pub fn children(&self) -> Option<&ChildMap> {
        match &self.body {
            NodeBody::Container { children, .. } => Some(children),
            NodeBody::Leaf => None,
        }
    }

    pub fn child(&self, signature: &str) -> Option<&ScriptNode> {
        self.children().and_then(|c| c.get(signature))
    }

    pub fn braces(&self) -> Option<(usize, usize)> {
        match &self.body {
            NodeBody::Container { braces, .. } => *braces,
            NodeBody::Leaf => None,
        }
    }

    pub(crate) fn set_signature(&mut self, signature: String) {
        self.signature = signature;
    }

    /// Tokens before the body's `{`: the part of a container that is not
    /// made of children.
    fn header(&self) -> Range<usize> {
        match self.braces() {
            Some((open, _)) => self.tokens.start..open,
            None => self.tokens.start..self.tokens.start,
        }
    }

    /// Whether two nodes mean the same thing. Whitespace and comments are
    /// ignored, and children are matched by signature so reordering is not
    /// a change.
    pub fn same_content(&self, other: &ScriptNode) -> bool {
        match (self.children(), other.children()) {
            (None, None) => {
                self.source
                    .same_tokens(self.tokens.clone(), &other.source, other.tokens.clone())
            }
            (Some(ours), Some(theirs)) => {
                self.header_matches(other)
                    && ours.len() == theirs.len()
                    && ours.iter().all(|child| {
                        theirs
                            .get(child.signature())
                            .is_some_and(|twin| child.same_content(twin))
                    })
            }
            _ => false,
        }
    }

    pub(crate) fn header_matches(&self, other: &ScriptNode) -> bool {
        self.source
            .same_tokens(self.header(), &other.source, other.header())
    }
}

/// Children of a container in insertion order, indexed by signature.
#[derive(Debug, Clone, Default)]
pub struct ChildMap {
    nodes: Vec<ScriptNode>,
    index: HashMap<String, usize>,
}

impl ChildMap {
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn get(&self, signature: &str) -> Option<&ScriptNode> {
        self.index.get(signature).map(|&i| &self.nodes[i])
    }

    pub fn contains(&self, signature: &str) -> bool {
        self.index.contains_key(signature)
    }

    pub fn iter(&self) -> impl Iterator<Item = &ScriptNode> {
        self.nodes.iter()
    }

    pub fn signatures(&self) -> impl Iterator<Item = &str> {
        self.nodes.iter().map(|n| n.signature())
    }

    /// Position of `signature` in insertion order.
    pub fn position(&self, signature: &str) -> Option<usize> {
        self.index.get(signature).copied()
    }

    pub fn at(&self, position: usize) -> Option<&ScriptNode> {
        self.nodes.get(position)
    }

    /// Insert `node` under its signature. An existing child with the same
    /// signature is replaced in place and returned.
    pub fn insert(&mut self, node: ScriptNode) -> Option<ScriptNode> {
        match self.index.get(node.signature()) {
            Some(&i) => Some(std::mem::replace(&mut self.nodes[i], node)),
            None => {
                self.index.insert(node.signature().to_string(), self.nodes.len());
                self.nodes.push(node);
                None
            }
        }
    }

    /// Move the child at `from` to key `to`, keeping its position.
    /// Returns false when `from` is absent or `to` is taken.
    pub fn rekey(&mut self, from: &str, to: &str) -> bool {
        if self.index.contains_key(to) {
            return false;
        }
        let Some(i) = self.index.remove(from) else {
            return false;
        };
        self.nodes[i].set_signature(to.to_string());
        self.index.insert(to.to_string(), i);
        true
    }

    /// Number of children whose signature starts with `prefix`.
    pub fn count_prefixed(&self, prefix: &str) -> usize {
        self.nodes
            .iter()
            .filter(|n| n.signature().starts_with(prefix))
            .count()
    }
}

/// A parsed script: the root container plus the shared token source.
#[derive(Debug, Clone)]
pub struct ScriptTree {
    root: ScriptNode,
}

impl ScriptTree {
    pub(crate) fn new(root: ScriptNode) -> Self {
        Self { root }
    }

    pub fn root(&self) -> &ScriptNode {
        &self.root
    }

    pub fn source(&self) -> &Arc<TokenSource> {
        self.root.source()
    }

    pub fn text(&self) -> &str {
        self.root.source().text()
    }

    /// Follow a signature path from the root.
    pub fn find(&self, path: &[String]) -> Option<&ScriptNode> {
        path.iter()
            .try_fold(&self.root, |node, signature| node.child(signature))
    }

    /// Indented signature listing, one node per line.
    pub fn outline(&self) -> String {
        fn walk(node: &ScriptNode, depth: usize, out: &mut String) {
            if let Some(children) = node.children() {
                for child in children.iter() {
                    out.push_str(&"  ".repeat(depth));
                    out.push_str(child.signature());
                    out.push_str(&format!("  (line {})\n", child.line()));
                    walk(child, depth + 1, out);
                }
            }
        }
        let mut out = String::new();
        walk(&self.root, 0, &mut out);
        out
    }
}
