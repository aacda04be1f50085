//! Relation expressions: ordered trees of relation names.
//!
//! An expression such as `[children.[pets, toys], parent]` names the relations
//! to eager-load, or the relations a caller allows a graph to touch. The same
//! tree is derived from the shape of graph input by [`RelationExpression::from_records`].

use std::fmt;
use std::str::FromStr;

use indexmap::IndexMap;
use serde_json::Value;

use crate::error::CoreError;
use crate::record::Record;
use crate::schema::Schema;

/// An ordered tree of relation names.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RelationExpression {
    children: IndexMap<String, RelationExpression>,
}

impl RelationExpression {
    /// The empty expression `[]`.
    pub fn new() -> Self {
        RelationExpression::default()
    }

    /// Parses an expression such as `[children.[pets, toys], parent]` or `a.b`.
    pub fn parse(input: &str) -> Result<Self, CoreError> {
        let mut parser = Parser {
            input,
            chars: input.chars().collect(),
            pos: 0,
        };
        let expr = parser.parse_root()?;
        parser.skip_ws();
        if parser.pos < parser.chars.len() {
            return Err(parser.error("unexpected trailing input"));
        }
        Ok(expr)
    }

    /// Derives the expression covered by `records` of type `record_type`.
    ///
    /// Every relation key present is included, also those holding null.
    pub fn from_records<'a, I>(schema: &Schema, record_type: &str, records: I) -> Result<Self, CoreError>
    where
        I: IntoIterator<Item = &'a Record>,
    {
        let mut expr = RelationExpression::new();
        for record in records {
            expr.collect_record(schema, record_type, record)?;
        }
        Ok(expr)
    }

    fn collect_record(&mut self, schema: &Schema, record_type: &str, record: &Record) -> Result<(), CoreError> {
        let ty = schema.record_type(record_type)?;
        for (key, value) in record {
            let Some(relation) = ty.relation(key) else {
                continue;
            };
            let child = self.insert(key);
            match value {
                Value::Object(nested) => child.collect_record(schema, &relation.related, nested)?,
                Value::Array(items) => {
                    for item in items {
                        if let Value::Object(nested) = item {
                            child.collect_record(schema, &relation.related, nested)?;
                        }
                    }
                }
                _ => {}
            }
        }
        Ok(())
    }

    /// Adds `name` as a child (if missing) and returns it.
    pub fn insert(&mut self, name: &str) -> &mut RelationExpression {
        self.children.entry(name.to_string()).or_default()
    }

    /// Merges every path of `other` into `self`.
    pub fn merge(&mut self, other: &RelationExpression) {
        for (name, sub) in &other.children {
            self.insert(name).merge(sub);
        }
    }

    pub fn child(&self, name: &str) -> Option<&RelationExpression> {
        self.children.get(name)
    }

    pub fn children(&self) -> impl Iterator<Item = (&str, &RelationExpression)> {
        self.children.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn is_empty(&self) -> bool {
        self.children.is_empty()
    }

    /// Returns `true` when every path of `other` also exists in `self`.
    pub fn is_sub_expression(&self, other: &RelationExpression) -> bool {
        other.children.iter().all(|(name, sub)| {
            self.children
                .get(name)
                .is_some_and(|mine| mine.is_sub_expression(sub))
        })
    }

    /// Every relation path in the tree, dotted, parents before children.
    pub fn paths(&self) -> Vec<String> {
        let mut out = Vec::new();
        self.collect_paths("", &mut out);
        out
    }

    fn collect_paths(&self, prefix: &str, out: &mut Vec<String>) {
        for (name, sub) in &self.children {
            let path = if prefix.is_empty() {
                name.clone()
            } else {
                format!("{prefix}.{name}")
            };
            out.push(path.clone());
            sub.collect_paths(&path, out);
        }
    }
}

impl fmt::Display for RelationExpression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[")?;
        for (i, (name, sub)) in self.children.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{name}")?;
            if !sub.is_empty() {
                write!(f, ".{sub}")?;
            }
        }
        write!(f, "]")
    }
}

impl FromStr for RelationExpression {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        RelationExpression::parse(s)
    }
}

// ---------------------------------------------------------------------------
// Parser
// ---------------------------------------------------------------------------

// expr  := list | chain
// list  := '[' (chain (',' chain)*)? ']'
// chain := name ('.' (name-chain | list))?
struct Parser<'a> {
    input: &'a str,
    chars: Vec<char>,
    pos: usize,
}

impl Parser<'_> {
    fn error(&self, reason: &str) -> CoreError {
        CoreError::InvalidExpression {
            input: self.input.to_string(),
            reason: format!("{reason} at offset {}", self.pos),
        }
    }

    fn skip_ws(&mut self) {
        while self.chars.get(self.pos).is_some_and(|c| c.is_whitespace()) {
            self.pos += 1;
        }
    }

    fn peek(&mut self) -> Option<char> {
        self.skip_ws();
        self.chars.get(self.pos).copied()
    }

    fn expect(&mut self, c: char) -> Result<(), CoreError> {
        if self.peek() == Some(c) {
            self.pos += 1;
            Ok(())
        } else {
            Err(self.error(&format!("expected '{c}'")))
        }
    }

    fn parse_root(&mut self) -> Result<RelationExpression, CoreError> {
        match self.peek() {
            Some('[') => self.parse_list(),
            Some(_) => {
                let mut expr = RelationExpression::new();
                self.parse_chain(&mut expr)?;
                Ok(expr)
            }
            None => Err(self.error("empty expression")),
        }
    }

    fn parse_list(&mut self) -> Result<RelationExpression, CoreError> {
        self.expect('[')?;
        let mut expr = RelationExpression::new();
        if self.peek() == Some(']') {
            self.pos += 1;
            return Ok(expr);
        }
        loop {
            self.parse_chain(&mut expr)?;
            match self.peek() {
                Some(',') => self.pos += 1,
                Some(']') => {
                    self.pos += 1;
                    return Ok(expr);
                }
                _ => return Err(self.error("expected ',' or ']'")),
            }
        }
    }

    fn parse_chain(&mut self, into: &mut RelationExpression) -> Result<(), CoreError> {
        let name = self.parse_name()?;
        let child = into.insert(&name);
        if self.peek() == Some('.') {
            self.pos += 1;
            if self.peek() == Some('[') {
                let list = self.parse_list()?;
                child.merge(&list);
            } else {
                self.parse_chain(child)?;
            }
        }
        Ok(())
    }

    fn parse_name(&mut self) -> Result<String, CoreError> {
        self.skip_ws();
        let start = self.pos;
        while self
            .chars
            .get(self.pos)
            .is_some_and(|c| c.is_alphanumeric() || *c == '_' || *c == '$')
        {
            self.pos += 1;
        }
        if start == self.pos {
            return Err(self.error("expected relation name"));
        }
        Ok(self.chars[start..self.pos].iter().collect())
    }
}
