//! Dotted identifier keys for variable lookup
//!
//! A `Variable` is an ordered sequence of identifier parts (`a.b.c`) plus
//! flags describing how the reference was written: contextualized (`$api`),
//! coalesced (`x ?? default`, so a missing lookup is non-fatal), or
//! define-scoped (refers to a `#define` identifier).

use crate::error::Result;
use crate::syntax::token::Keyword;

/// An immutable variable key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Variable {
    parts: Vec<String>,
    contextualized: bool,
    coalesced: bool,
    define_scoped: bool,
}

impl Variable {
    /// A plain, atomic variable from a single identifier part.
    pub fn atom(part: impl Into<String>) -> Result<Self> {
        let part = part.into();
        validate_identifier(&part)?;
        Ok(Self {
            parts: vec![part],
            contextualized: false,
            coalesced: false,
            define_scoped: false,
        })
    }

    /// A contextualized scope root such as `$api`.
    pub fn scope(part: impl Into<String>) -> Result<Self> {
        let mut var = Self::atom(part)?;
        var.contextualized = true;
        Ok(var)
    }

    /// Extend the path by one member part.
    pub fn extended(&self, part: impl Into<String>) -> Result<Self> {
        let part = part.into();
        validate_identifier(&part)?;
        let mut next = self.clone();
        next.parts.push(part);
        Ok(next)
    }

    /// Mark the variable as coalesced (`??` was applied to it).
    pub fn coalesce(mut self) -> Self {
        self.coalesced = true;
        self
    }

    /// Mark the variable as referring to a `#define` identifier.
    pub fn define_scope(mut self) -> Self {
        self.define_scoped = true;
        self
    }

    pub fn parts(&self) -> &[String] {
        &self.parts
    }

    pub fn is_contextualized(&self) -> bool {
        self.contextualized
    }

    pub fn is_coalesced(&self) -> bool {
        self.coalesced
    }

    pub fn is_define_scoped(&self) -> bool {
        self.define_scoped
    }

    /// Root-most part of the path.
    pub fn ancestor(&self) -> &str {
        &self.parts[0]
    }

    /// The key one part shorter, or `None` for an atomic key.
    pub fn parent(&self) -> Option<Variable> {
        if self.parts.len() < 2 {
            return None;
        }
        let mut parent = self.clone();
        parent.parts.pop();
        Some(parent)
    }

    pub fn last_part(&self) -> &str {
        self.parts.last().map(String::as_str).unwrap_or_default()
    }

    pub fn is_pathed(&self) -> bool {
        self.parts.len() > 1
    }

    pub fn is_atomic(&self) -> bool {
        self.parts.len() == 1
    }

    /// The joined dotted path without the scope sigil.
    pub fn flat_path(&self) -> String {
        self.parts.join(".")
    }
}

impl std::fmt::Display for Variable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.contextualized {
            write!(f, "$")?;
        }
        write!(f, "{}", self.parts.join("."))
    }
}

/// An identifier part must begin with a letter or underscore, consist of
/// identifier-safe characters, and not shadow a reserved keyword.
pub fn validate_identifier(part: &str) -> Result<()> {
    let invalid = |reason: &str| {
        crate::error::Error::unknown(format!("invalid identifier \"{}\": {}", part, reason))
    };
    let mut chars = part.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        Some(_) => return Err(invalid("must begin with a letter or underscore")),
        None => return Err(invalid("empty")),
    }
    if !chars.all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return Err(invalid("contains identifier-unsafe characters"));
    }
    if Keyword::from_identifier(part).is_some() {
        return Err(invalid("reserved keyword"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_derived_queries() {
        let var = Variable::atom("a")
            .unwrap()
            .extended("b")
            .unwrap()
            .extended("c")
            .unwrap();
        assert_eq!(var.ancestor(), "a");
        assert_eq!(var.last_part(), "c");
        assert!(var.is_pathed());
        assert!(!var.is_atomic());
        assert_eq!(var.parent().unwrap().flat_path(), "a.b");
        assert_eq!(var.to_string(), "a.b.c");
    }

    #[test]
    fn test_scope_display() {
        let var = Variable::scope("api").unwrap().extended("key").unwrap();
        assert_eq!(var.to_string(), "$api.key");
        assert!(var.is_contextualized());
    }

    #[test]
    fn test_identifier_validation() {
        assert!(Variable::atom("good_name2").is_ok());
        assert!(Variable::atom("_lead").is_ok());
        assert!(Variable::atom("2bad").is_err());
        assert!(Variable::atom("bad-dash").is_err());
        assert!(Variable::atom("").is_err());
        // keywords are reserved
        assert!(Variable::atom("true").is_err());
        assert!(Variable::atom("in").is_err());
    }

    #[test]
    fn test_flags() {
        let var = Variable::atom("x").unwrap().coalesce().define_scope();
        assert!(var.is_coalesced());
        assert!(var.is_define_scoped());
    }
}
