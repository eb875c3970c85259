//! Element trees for XML game data.
//!
//! Elements become the same signature-addressed nodes scripts do, so
//! comparison and materialization work on both unchanged. An element is
//! keyed `element:<tag>:<id>` when it has a non-empty `id` attribute and
//! `element:<tag>:<n>` otherwise, `n` being its position among its sibling
//! elements.
//!
//! An element with child elements is a container: its header is the start
//! tag and its body sits between the start tag's `>` and the `</` of the end
//! tag. Text next to child elements makes the element a leaf so the text is
//! still compared.

use std::sync::Arc;

use crate::lexer::{Token, TokenKind, TokenSource};
use crate::parser::{ParseError, free_key};
use crate::types::{ChildMap, NodeKind, ScriptNode, ScriptTree};

/// Parse an XML document into an element tree. Top-level elements hang off
/// an unnamed root.
pub fn parse_xml(text: &str) -> Result<ScriptTree, ParseError> {
    let source = Arc::new(TokenSource::tokenize_xml(text)?);
    let mut builder = Builder {
        source: Arc::clone(&source),
        pos: 0,
    };

    let mut children = ChildMap::default();
    let mut index = 0;
    while builder.peek().is_some() {
        if !builder.check_punct("<") {
            return Err(builder.unexpected("element"));
        }
        let node = builder.element(index)?;
        attach(&mut children, node);
        index += 1;
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

fn signature(tag: &str, id: Option<&str>, index: usize) -> String {
    match id {
        Some(id) if !id.is_empty() => format!("element:{}:{}", tag, id),
        _ => format!("element:{}:{}", tag, index),
    }
}

/// Repeated ids or tags keep every sibling under an ordinal suffix.
fn attach(children: &mut ChildMap, mut node: ScriptNode) {
    let key = free_key(children, node.signature().to_string());
    node.set_signature(key);
    children.insert(node);
}

fn unquote(value: &str) -> &str {
    value.get(1..value.len().saturating_sub(1)).unwrap_or(value)
}

struct Builder {
    source: Arc<TokenSource>,
    pos: usize,
}

impl Builder {
    /// One element starting at its `<`; `index` is its position among the
    /// sibling elements.
    fn element(&mut self, index: usize) -> Result<ScriptNode, ParseError> {
        let source = Arc::clone(&self.source);
        let start = self.pos;
        self.expect_punct("<")?;
        let tag = self.expect(TokenKind::Ident, "element name")?;
        let tag = source.token_text(tag).to_string();

        let mut id = None;
        let open = loop {
            if self.eat_punct("/>") {
                let signature = signature(&tag, id.as_deref(), index);
                return Ok(ScriptNode::leaf(
                    signature,
                    NodeKind::Element,
                    start..self.pos,
                    &source,
                ));
            }
            if self.check_punct(">") {
                let open = self.pos;
                self.pos += 1;
                break open;
            }
            let name = self.expect(TokenKind::Ident, "attribute, '>' or '/>'")?;
            self.expect_punct("=")?;
            let value = self.expect(TokenKind::Str, "attribute value")?;
            if source.token_text(name) == "id" {
                id = Some(unquote(source.token_text(value)).to_string());
            }
        };

        let mut children = ChildMap::default();
        let mut has_text = false;
        let mut child_index = 0;
        let close = loop {
            let Some(token) = self.peek() else {
                return Err(ParseError::UnexpectedEof {
                    expected: format!("</{}>", tag),
                });
            };
            match (token.kind, source.token_text(self.pos)) {
                (TokenKind::Punct, "</") => break self.pos,
                (TokenKind::Punct, "<") => {
                    let child = self.element(child_index)?;
                    attach(&mut children, child);
                    child_index += 1;
                }
                (TokenKind::Text, _) => {
                    has_text = true;
                    self.pos += 1;
                }
                _ => return Err(self.unexpected("element, text or end tag")),
            }
        };

        self.pos += 1;
        let closing = self.expect(TokenKind::Ident, "end tag name")?;
        if source.token_text(closing) != tag {
            self.pos = closing;
            return Err(self.unexpected(&format!("</{}>", tag)));
        }
        self.expect_punct(">")?;

        let signature = signature(&tag, id.as_deref(), index);
        let tokens = start..self.pos;
        if children.is_empty() || has_text {
            Ok(ScriptNode::leaf(signature, NodeKind::Element, tokens, &source))
        } else {
            Ok(ScriptNode::container(
                signature,
                NodeKind::Element,
                tokens,
                &source,
                children,
                Some((open, close)),
            ))
        }
    }

    fn peek(&self) -> Option<Token> {
        self.source.token(self.pos).copied()
    }

    fn check_punct(&self, punct: &str) -> bool {
        self.peek().is_some_and(|t| t.kind == TokenKind::Punct)
            && self.source.token_text(self.pos) == punct
    }

    fn eat_punct(&mut self, punct: &str) -> bool {
        if self.check_punct(punct) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect_punct(&mut self, punct: &str) -> Result<(), ParseError> {
        if self.eat_punct(punct) {
            Ok(())
        } else {
            Err(self.unexpected(&format!("'{}'", punct)))
        }
    }

    fn expect(&mut self, kind: TokenKind, expected: &str) -> Result<usize, ParseError> {
        match self.peek() {
            Some(t) if t.kind == kind => {
                self.pos += 1;
                Ok(self.pos - 1)
            }
            _ => Err(self.unexpected(expected)),
        }
    }

    fn unexpected(&self, expected: &str) -> ParseError {
        match self.peek() {
            Some(t) => ParseError::UnexpectedToken {
                found: self.source.token_text(self.pos).to_string(),
                expected: expected.to_string(),
                line: t.line,
                column: t.column,
            },
            None => ParseError::UnexpectedEof {
                expected: expected.to_string(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comparator::{ConflictType, SourceNames, UserChoice, compare, diff};
    use crate::resolver::materialize;

    const SKILLS: &str = r#"<?xml version="1.0" encoding="utf-8"?>
<!-- player skills -->
<skills>
    <skill id="Jump" cat="agility">
        <prop n="Height" v="1.5"/>
        <prop n="Stamina" v="10"/>
    </skill>
    <skill id="Sprint">
        <prop n="Speed" v="2.0"/>
    </skill>
    <group>
        <name>Combat</name>
    </group>
</skills>
"#;

    fn path(parts: &[&str]) -> Vec<String> {
        parts.iter().map(|p| p.to_string()).collect()
    }

    #[test]
    fn test_element_signatures() {
        let tree = parse_xml(SKILLS).unwrap();
        assert_eq!(
            tree.outline(),
            "element:skills:0  (line 3)\n\
             \x20 element:skill:Jump  (line 4)\n\
             \x20   element:prop:0  (line 5)\n\
             \x20   element:prop:1  (line 6)\n\
             \x20 element:skill:Sprint  (line 8)\n\
             \x20   element:prop:0  (line 9)\n\
             \x20 element:group:2  (line 11)\n\
             \x20   element:name:0  (line 12)\n"
        );
    }

    #[test]
    fn test_containers_and_leaves() {
        let tree = parse_xml(SKILLS).unwrap();
        let jump = tree
            .find(&path(&["element:skills:0", "element:skill:Jump"]))
            .unwrap();
        assert!(jump.is_container());
        assert_eq!(jump.kind(), NodeKind::Element);

        let name = tree
            .find(&path(&["element:skills:0", "element:group:2", "element:name:0"]))
            .unwrap();
        assert!(!name.is_container());
        assert_eq!(name.text(), "<name>Combat</name>");

        let prop = tree
            .find(&path(&["element:skills:0", "element:skill:Sprint", "element:prop:0"]))
            .unwrap();
        assert_eq!(prop.text(), r#"<prop n="Speed" v="2.0"/>"#);
    }

    #[test]
    fn test_repeated_ids_keep_every_sibling() {
        let tree = parse_xml(r#"<a><b id="x"/><b id='x'/><b id=""/></a>"#).unwrap();
        let a = tree.find(&path(&["element:a:0"])).unwrap();
        let order: Vec<_> = a.children().unwrap().signatures().collect();
        assert_eq!(order, vec!["element:b:x", "element:b:x#1", "element:b:2"]);
    }

    #[test]
    fn test_text_beside_children_makes_a_leaf() {
        let tree = parse_xml("<p>Hello <b>world</b></p>").unwrap();
        let p = tree.find(&path(&["element:p:0"])).unwrap();
        assert!(!p.is_container());
    }

    #[test]
    fn test_formatting_is_not_a_change() {
        let base = parse_xml(SKILLS).unwrap();
        let reformatted = parse_xml(
            "<skills><skill id=\"Jump\"   cat=\"agility\"><prop n=\"Height\" v=\"1.5\" />\
             <!-- tweak later --><prop n=\"Stamina\" v=\"10\"/></skill>\
             <skill id=\"Sprint\"><prop n=\"Speed\" v=\"2.0\"/></skill>\
             <group><name>Combat</name></group></skills>",
        )
        .unwrap();
        assert!(compare(&base, &reformatted, &SourceNames::default()).is_empty());
    }

    #[test]
    fn test_attribute_change_and_new_element_merge() {
        let base = parse_xml(
            "<skills>\n  <skill id=\"Jump\">\n    <prop n=\"Height\" v=\"1.5\"/>\n  </skill>\n</skills>\n",
        )
        .unwrap();
        let modded_text = "<skills>\n  <skill id=\"Jump\">\n    <prop n=\"Height\" v=\"3.0\"/>\n    <prop n=\"Boost\" v=\"1\"/>\n  </skill>\n</skills>\n";
        let modded = parse_xml(modded_text).unwrap();

        let mut result = diff(&base, &modded, &SourceNames::default());
        assert_eq!(result.conflicts.len(), 1);
        assert_eq!(result.additions.len(), 1);
        let record = &mut result.conflicts[0];
        assert_eq!(record.conflict_type, ConflictType::Modification);
        assert_eq!(
            record.location(),
            "element:skills:0 > element:skill:Jump > element:prop:0"
        );
        record.resolution = Some(UserChoice::MergeMod);

        assert_eq!(materialize(&base, &result).unwrap(), modded_text);
    }

    #[test]
    fn test_start_tag_change_is_one_conflict() {
        let base = parse_xml(r#"<s><k id="a" cat="x"><v/></k></s>"#).unwrap();
        let modded = parse_xml(r#"<s><k id="a" cat="y"><v/></k></s>"#).unwrap();
        let records = compare(&base, &modded, &SourceNames::default());
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].signature, "element:k:a");
    }

    #[test]
    fn test_malformed_documents() {
        assert!(matches!(
            parse_xml("<a><b></a>"),
            Err(ParseError::UnexpectedToken { ref found, ref expected, .. })
                if found == "a" && expected == "</b>"
        ));
        assert!(matches!(
            parse_xml("<a><b/>"),
            Err(ParseError::UnexpectedEof { ref expected }) if expected == "</a>"
        ));
        assert!(matches!(
            parse_xml("stray <a/>"),
            Err(ParseError::UnexpectedToken { .. })
        ));
        assert!(matches!(
            parse_xml("<a x>"),
            Err(ParseError::UnexpectedToken { .. })
        ));
    }
}
