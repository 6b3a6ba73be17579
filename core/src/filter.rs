//! Tag filtering: the per-session predicate that selects the outbound
//! subset.
//!
//! Two request forms exist. `tags=a,b,c` is a plain OR over tag names.
//! `tag-filter=<expr>` is a boolean expression with this grammar:
//!
//! ```text
//! expr  := or
//! or    := and ( ( "," | "OR" )  and )*          // OR binds loosest
//! and   := unary ( ( "+" | "AND" ) unary
//!                | "-" unary )*                  // "a-b" is a AND NOT b
//! unary := ( "!" | "NOT" ) unary | atom | "(" expr ")"
//! atom  := [A-Za-z0-9_]+                          // hyphen is an operator here
//! ```
//!
//! Both the symbolic (`+`, `,`, `!`, `-`) and word (`AND`, `OR`, `NOT`,
//! uppercase) spellings are accepted. Because `-` acts as the NOT-connector
//! inside expressions, hyphenated tag names are only reachable through the
//! simple `tags=` form or a preset document.

use std::collections::BTreeSet;
use std::fmt;

use crate::config::validate_tag;
use crate::error::ProxyError;

/// The resolved per-session filter.
#[derive(Debug, Clone, PartialEq)]
pub enum FilterContext {
    /// No filtering: every outbound server is admitted.
    None,
    /// OR semantics: a server is admitted when it carries at least one of
    /// these tags.
    Simple(BTreeSet<String>),
    /// Boolean expression over tag names.
    Expression(TagExpr),
    /// A named preset, bound with the document that was current at session
    /// setup. Preset edits re-bind the session.
    Preset {
        name: String,
        document: crate::preset::PresetDocument,
    },
}

impl FilterContext {
    /// Whether a server with `tags` is admitted.
    pub fn admits(&self, tags: &BTreeSet<String>) -> bool {
        match self {
            FilterContext::None => true,
            FilterContext::Simple(wanted) => wanted.iter().any(|t| tags.contains(t)),
            FilterContext::Expression(expr) => expr.eval(tags),
            FilterContext::Preset { document, .. } => document.eval(tags),
        }
    }

    /// Every tag name the filter mentions (negated ones included).
    pub fn referenced_tags(&self) -> BTreeSet<String> {
        match self {
            FilterContext::None => BTreeSet::new(),
            FilterContext::Simple(tags) => tags.clone(),
            FilterContext::Expression(expr) => {
                let mut tags = BTreeSet::new();
                expr.collect_tags(&mut tags);
                tags
            }
            FilterContext::Preset { document, .. } => document.referenced_tags(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum TagExpr {
    Tag(String),
    And(Box<TagExpr>, Box<TagExpr>),
    Or(Box<TagExpr>, Box<TagExpr>),
    Not(Box<TagExpr>),
}

impl TagExpr {
    pub fn eval(&self, tags: &BTreeSet<String>) -> bool {
        match self {
            TagExpr::Tag(name) => tags.contains(name),
            TagExpr::And(a, b) => a.eval(tags) && b.eval(tags),
            TagExpr::Or(a, b) => a.eval(tags) || b.eval(tags),
            TagExpr::Not(e) => !e.eval(tags),
        }
    }

    fn collect_tags(&self, out: &mut BTreeSet<String>) {
        match self {
            TagExpr::Tag(name) => {
                out.insert(name.clone());
            }
            TagExpr::And(a, b) | TagExpr::Or(a, b) => {
                a.collect_tags(out);
                b.collect_tags(out);
            }
            TagExpr::Not(e) => e.collect_tags(out),
        }
    }
}

/// Printed form reparses to a semantically identical expression.
impl fmt::Display for TagExpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TagExpr::Tag(name) => write!(f, "{name}"),
            TagExpr::And(a, b) => {
                write_and_operand(f, a)?;
                write!(f, "+")?;
                write_and_operand(f, b)
            }
            TagExpr::Or(a, b) => write!(f, "{a},{b}"),
            TagExpr::Not(e) => match &**e {
                TagExpr::Tag(_) => write!(f, "!{e}"),
                _ => write!(f, "!({e})"),
            },
        }
    }
}

fn write_and_operand(f: &mut fmt::Formatter<'_>, e: &TagExpr) -> fmt::Result {
    match e {
        TagExpr::Or(..) => write!(f, "({e})"),
        _ => write!(f, "{e}"),
    }
}

// ---------------------------------------------------------------------------
// Parsing
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Atom(String),
    And,
    Or,
    Not,
    AndNot,
    LParen,
    RParen,
}

fn tokenize(input: &str) -> Result<Vec<Token>, ProxyError> {
    let mut tokens = Vec::new();
    let mut chars = input.char_indices().peekable();
    while let Some((start, c)) = chars.next() {
        match c {
            ' ' | '\t' => {}
            '+' => tokens.push(Token::And),
            ',' => tokens.push(Token::Or),
            '!' => tokens.push(Token::Not),
            '-' => tokens.push(Token::AndNot),
            '(' => tokens.push(Token::LParen),
            ')' => tokens.push(Token::RParen),
            c if c.is_ascii_alphanumeric() || c == '_' => {
                let mut end = start + c.len_utf8();
                while let Some((i, c2)) = chars.peek().copied() {
                    if c2.is_ascii_alphanumeric() || c2 == '_' {
                        end = i + c2.len_utf8();
                        chars.next();
                    } else {
                        break;
                    }
                }
                let word = &input[start..end];
                match word {
                    "AND" => tokens.push(Token::And),
                    "OR" => tokens.push(Token::Or),
                    "NOT" => tokens.push(Token::Not),
                    atom => {
                        validate_tag(atom)?;
                        tokens.push(Token::Atom(atom.to_string()));
                    }
                }
            }
            other => {
                return Err(ProxyError::validation(format!(
                    "unexpected character `{other}` in tag filter"
                )));
            }
        }
    }
    Ok(tokens)
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        if token.is_some() {
            self.pos += 1;
        }
        token
    }

    fn parse_or(&mut self) -> Result<TagExpr, ProxyError> {
        let mut left = self.parse_and()?;
        while self.peek() == Some(&Token::Or) {
            self.next();
            let right = self.parse_and()?;
            left = TagExpr::Or(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_and(&mut self) -> Result<TagExpr, ProxyError> {
        let mut left = self.parse_unary()?;
        loop {
            match self.peek() {
                Some(Token::And) => {
                    self.next();
                    let right = self.parse_unary()?;
                    left = TagExpr::And(Box::new(left), Box::new(right));
                }
                Some(Token::AndNot) => {
                    self.next();
                    let right = self.parse_unary()?;
                    left = TagExpr::And(Box::new(left), Box::new(TagExpr::Not(Box::new(right))));
                }
                _ => break,
            }
        }
        Ok(left)
    }

    fn parse_unary(&mut self) -> Result<TagExpr, ProxyError> {
        match self.next() {
            Some(Token::Not) => Ok(TagExpr::Not(Box::new(self.parse_unary()?))),
            // A leading "-" negates like "!".
            Some(Token::AndNot) => Ok(TagExpr::Not(Box::new(self.parse_unary()?))),
            Some(Token::Atom(name)) => Ok(TagExpr::Tag(name)),
            Some(Token::LParen) => {
                let expr = self.parse_or()?;
                match self.next() {
                    Some(Token::RParen) => Ok(expr),
                    _ => Err(ProxyError::validation("unbalanced parenthesis in tag filter")),
                }
            }
            other => Err(ProxyError::validation(format!(
                "expected a tag, got {other:?}"
            ))),
        }
    }
}

/// Parse a `tag-filter` expression.
pub fn parse_tag_filter(input: &str) -> Result<TagExpr, ProxyError> {
    let tokens = tokenize(input)?;
    if tokens.is_empty() {
        return Err(ProxyError::validation("empty tag filter"));
    }
    let mut parser = Parser { tokens, pos: 0 };
    let expr = parser.parse_or()?;
    if parser.pos != parser.tokens.len() {
        return Err(ProxyError::validation(format!(
            "trailing tokens in tag filter `{input}`"
        )));
    }
    Ok(expr)
}

/// Parse a `tags=a,b,c` list. Tags are validated and duplicates rejected.
pub fn parse_simple_tags(input: &str) -> Result<BTreeSet<String>, ProxyError> {
    let mut tags = BTreeSet::new();
    for raw in input.split(',') {
        let tag = raw.trim();
        if tag.is_empty() {
            return Err(ProxyError::validation("empty tag in tag list"));
        }
        validate_tag(tag)?;
        if !tags.insert(tag.to_string()) {
            return Err(ProxyError::validation(format!("duplicate tag `{tag}`")));
        }
    }
    Ok(tags)
}

/// Convert OAuth scopes to the granted-tag set: `tag:<name>` contributes
/// `<name>`, every other scope is permitted but ignored.
pub fn scopes_to_tags(scopes: &[String]) -> BTreeSet<String> {
    scopes
        .iter()
        .filter_map(|scope| scope.strip_prefix("tag:"))
        .filter(|tag| validate_tag(tag).is_ok())
        .map(str::to_string)
        .collect()
}

/// Intersect a requested filter with the granted-tag set.
///
/// With no grant (auth disabled) the request passes through. With a grant,
/// naming any ungranted tag fails with [`ProxyError::InsufficientScope`], and
/// an unfiltered request narrows to the granted set.
pub fn resolve_with_grant(
    requested: FilterContext,
    granted: Option<&BTreeSet<String>>,
) -> Result<FilterContext, ProxyError> {
    let Some(granted) = granted else {
        return Ok(requested);
    };

    let outside: Vec<String> = requested
        .referenced_tags()
        .into_iter()
        .filter(|tag| !granted.contains(tag))
        .collect();
    if !outside.is_empty() {
        return Err(ProxyError::InsufficientScope { tags: outside });
    }

    match requested {
        FilterContext::None => Ok(FilterContext::Simple(granted.clone())),
        other => Ok(other),
    }
}
