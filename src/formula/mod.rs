// src/formula/mod.rs

//! Dependency formula parsing and evaluation
//!
//! A formula is a comma-separated list of clauses; items within a clause are
//! alternatives separated by `|`. Each item names a package and may constrain
//! it with version operators (`>= <= != = > <`) and option predicates
//! (`+OPT` requires the option on, `-OPT` off):
//!
//! ```text
//! foo >= 1.0, bar | baz +SSL -X11 = 2
//! ```
//!
//! Parsing is a hand-written state machine; the output drives repository
//! lookup by synthesising SQL `WHERE` fragments, with option predicates
//! applied as a post-filter against each candidate's options table.

use std::collections::BTreeMap;
use std::fmt;

use crate::error::{Error, Result};

/// Version comparison operator inside a formula item
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum VersionOp {
    /// No constraint
    #[default]
    Any,
    Eq,
    Ge,
    Le,
    Lt,
    Gt,
    Not,
}

impl VersionOp {
    pub fn as_str(&self) -> &'static str {
        match self {
            VersionOp::Any => "",
            VersionOp::Eq => "=",
            VersionOp::Ge => ">=",
            VersionOp::Le => "<=",
            VersionOp::Lt => "<",
            VersionOp::Gt => ">",
            VersionOp::Not => "!=",
        }
    }

    /// Parse an operator token; unknown tokens mean "no constraint"
    pub fn from_token(tok: &str) -> Self {
        match tok {
            "=" | "==" => VersionOp::Eq,
            ">=" => VersionOp::Ge,
            "<=" => VersionOp::Le,
            "<" => VersionOp::Lt,
            ">" => VersionOp::Gt,
            "!" | "!=" => VersionOp::Not,
            _ => VersionOp::Any,
        }
    }

    /// Apply the operator to a three-way comparison result
    pub fn matches(&self, ord: std::cmp::Ordering) -> bool {
        use std::cmp::Ordering::*;
        match self {
            VersionOp::Any => true,
            VersionOp::Eq => ord == Equal,
            VersionOp::Ge => ord != Less,
            VersionOp::Le => ord != Greater,
            VersionOp::Lt => ord == Less,
            VersionOp::Gt => ord == Greater,
            VersionOp::Not => ord != Equal,
        }
    }
}

/// A single `(op, version)` pair constraining an item
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionConstraint {
    pub op: VersionOp,
    pub version: String,
}

/// A single `+OPT` / `-OPT` predicate on an item
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OptionPredicate {
    pub option: String,
    pub on: bool,
}

/// One alternative inside a clause: a package name plus constraints
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Item {
    pub name: String,
    pub versions: Vec<VersionConstraint>,
    pub options: Vec<OptionPredicate>,
}

/// One AND-connected group of alternatives
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Clause {
    pub items: Vec<Item>,
}

/// A parsed dependency formula
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Formula {
    pub clauses: Vec<Clause>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    DepName,
    AfterName,
    VerOp,
    AfterOp,
    VersionNumber,
    AfterVersion,
    OptionStart,
    Option,
    AfterOption,
    Comma,
    Or,
    SkipSpaces,
}

fn is_token_char(c: u8) -> bool {
    c.is_ascii_alphanumeric() || c == b'-' || c == b'_'
}

fn is_version_char(c: u8) -> bool {
    is_token_char(c) || c == b'.'
}

/// Characters that terminate a package name. `+` and `-` do not: they occur
/// inside real package names, so option predicates must be space-separated.
fn is_name_end(c: u8) -> bool {
    c.is_ascii_whitespace()
        || matches!(c, b'\0' | b',' | b'|' | b'>' | b'<' | b'=' | b'!')
}

impl Formula {
    /// Parse a formula string
    ///
    /// The machine walks the input one byte at a time, treating end of input
    /// as a virtual NUL so that terminal states fire once more at EOF. A
    /// pending item at EOF is finalised through the same path a comma takes.
    /// Any input that does not leave the machine in the space-skipping state
    /// is rejected.
    pub fn parse(input: &str) -> Result<Self> {
        let bytes = input.as_bytes();
        let fail = || Error::Parse(input.to_string());

        let mut clauses: Vec<Clause> = Vec::new();
        let mut cur_clause: Option<Clause> = None;
        let mut cur_item: Option<Item> = None;
        let mut cur_op = VersionOp::Any;
        let mut opt_on = false;

        let mut state = State::SkipSpaces;
        let mut next_state = State::DepName;
        let mut p = 0usize;
        let mut c = 0usize;

        // NUL at one-past-the-end stands in for EOF
        let byte = |i: usize| -> u8 { if i < bytes.len() { bytes[i] } else { b'\0' } };

        while p <= bytes.len() {
            match state {
                State::DepName => {
                    let ch = byte(p);
                    if is_name_end(ch) {
                        if p == c {
                            // Nothing pending and nothing started: clean EOF
                            // (empty input, or input ending in a comma)
                            if ch == b'\0' && cur_item.is_none() && cur_clause.is_none() {
                                p += 1;
                                state = State::SkipSpaces;
                            } else {
                                return Err(fail());
                            }
                        } else {
                            cur_item = Some(Item {
                                name: input[c..p].to_string(),
                                ..Item::default()
                            });
                            if ch.is_ascii_whitespace() {
                                state = State::SkipSpaces;
                                next_state = State::AfterName;
                            } else {
                                state = State::AfterName;
                            }
                        }
                    } else if !ch.is_ascii_graphic() {
                        return Err(fail());
                    } else {
                        p += 1;
                    }
                }

                State::AfterName | State::AfterVersion | State::AfterOption => {
                    match byte(p) {
                        b',' | b'\0' => state = State::Comma,
                        b'|' => state = State::Or,
                        b'+' | b'-' => {
                            c = p;
                            state = State::OptionStart;
                        }
                        b'>' | b'<' | b'=' | b'!' => {
                            c = p;
                            cur_op = VersionOp::Any;
                            state = State::VerOp;
                        }
                        _ => return Err(fail()),
                    }
                }

                State::VerOp => match byte(p) {
                    b'>' | b'<' | b'=' | b'!' => p += 1,
                    _ => {
                        cur_op = VersionOp::from_token(&input[c..p]);
                        if cur_op == VersionOp::Any {
                            return Err(fail());
                        }
                        state = State::SkipSpaces;
                        next_state = State::AfterOp;
                    }
                },

                State::AfterOp => {
                    if cur_op == VersionOp::Any {
                        return Err(fail());
                    }
                    state = State::VersionNumber;
                }

                State::VersionNumber => {
                    if is_version_char(byte(p)) {
                        p += 1;
                    } else if p > c {
                        let item = cur_item.as_mut().ok_or_else(fail)?;
                        item.versions.push(VersionConstraint {
                            op: cur_op,
                            version: input[c..p].to_string(),
                        });
                        state = State::SkipSpaces;
                        next_state = State::AfterVersion;
                    } else {
                        return Err(fail());
                    }
                }

                State::OptionStart => {
                    opt_on = byte(p) == b'+';
                    p += 1;
                    c = p;
                    state = State::Option;
                }

                State::Option => {
                    if is_token_char(byte(p)) {
                        p += 1;
                    } else if p > c {
                        let item = cur_item.as_mut().ok_or_else(fail)?;
                        item.options.push(OptionPredicate {
                            option: input[c..p].to_string(),
                            on: opt_on,
                        });
                        state = State::SkipSpaces;
                        next_state = State::AfterOption;
                    } else {
                        return Err(fail());
                    }
                }

                State::Comma => {
                    let item = cur_item.take().ok_or_else(fail)?;
                    let mut clause = cur_clause.take().unwrap_or_default();
                    clause.items.push(item);
                    clauses.push(clause);
                    p += 1;
                    state = State::SkipSpaces;
                    next_state = State::DepName;
                }

                State::Or => {
                    let item = cur_item.take().ok_or_else(fail)?;
                    cur_clause
                        .get_or_insert_with(Clause::default)
                        .items
                        .push(item);
                    p += 1;
                    state = State::SkipSpaces;
                    next_state = State::DepName;
                }

                State::SkipSpaces => {
                    if byte(p).is_ascii_whitespace() {
                        p += 1;
                    } else {
                        c = p;
                        state = next_state;
                    }
                }
            }
        }

        if state != State::SkipSpaces || cur_item.is_some() || cur_clause.is_some() {
            return Err(fail());
        }

        Ok(Formula { clauses })
    }
}

impl fmt::Display for VersionConstraint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.op.as_str(), self.version)
    }
}

impl fmt::Display for OptionPredicate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", if self.on { '+' } else { '-' }, self.option)
    }
}

impl fmt::Display for Item {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name)?;
        for v in &self.versions {
            write!(f, " {}", v)?;
        }
        for o in &self.options {
            write!(f, " {}", o)?;
        }
        Ok(())
    }
}

impl fmt::Display for Clause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, item) in self.items.iter().enumerate() {
            if i > 0 {
                write!(f, " | ")?;
            }
            write!(f, "{}", item)?;
        }
        Ok(())
    }
}

impl fmt::Display for Formula {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, clause) in self.clauses.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}", clause)?;
        }
        Ok(())
    }
}

fn sql_quote(s: &str) -> String {
    s.replace('\'', "''")
}

impl Item {
    /// Produce a parenthesised `WHERE` fragment selecting candidate rows for
    /// this item, e.g. `(name = 'foo' AND vercmp('>=','1.0',version))`.
    /// Option predicates are not expressible here; callers apply
    /// [`Item::options_match`] as a post-filter.
    pub fn to_sql(&self) -> String {
        let mut out = format!("(name = '{}'", sql_quote(&self.name));
        for v in &self.versions {
            out.push_str(&format!(
                " AND vercmp('{}','{}',version)",
                v.op.as_str(),
                sql_quote(&v.version)
            ));
        }
        out.push(')');
        out
    }

    /// Check this item's option predicates against a candidate's options
    /// (option name → "on"/"off" value)
    pub fn options_match(&self, options: &BTreeMap<String, String>) -> bool {
        for pred in &self.options {
            if let Some(value) = options.get(&pred.option) {
                if (value != "on" && pred.on) || (value != "off" && !pred.on) {
                    return false;
                }
            }
        }
        true
    }
}
