use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Position of a token or diagnostic within a named template source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceLocation {
    pub template: String,
    pub line: usize,
    pub column: usize,
}

impl SourceLocation {
    pub fn new(template: impl Into<String>, line: usize, column: usize) -> Self {
        Self {
            template: template.into(),
            line,
            column,
        }
    }
}

impl std::fmt::Display for SourceLocation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}:{}", self.template, self.line, self.column)
    }
}

/// Main error type for the Stencil engine
#[derive(Error, Debug)]
pub enum Error {
    #[error("no template exists for \"{0}\"")]
    NoTemplateExists(String),

    #[error("illegal access of {path}: {limitation}")]
    IllegalAccess { path: String, limitation: String },

    #[error("cyclical reference to \"{name}\" via {}", chain.join(" -> "))]
    CyclicalReference { name: String, chain: Vec<String> },

    #[error("no sources registered with the engine")]
    NoSources,

    #[error("no source named \"{0}\" is registered")]
    NoSourceForKey(String),

    #[error("parse error at {location}: {message}")]
    Parse {
        message: String,
        location: SourceLocation,
    },

    #[error("serialize error: {0}")]
    Serialize(String),

    #[error("raw file \"{0}\" is required but was not provided")]
    MissingRaw(String),

    #[error("render exceeded timeout of {0:.3}s")]
    Timeout(f64),

    #[error("encoding error: {0}")]
    Encoding(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("unknown error: {0}")]
    Unknown(String),
}

impl Error {
    pub fn parse(message: impl Into<String>, location: SourceLocation) -> Self {
        Self::Parse {
            message: message.into(),
            location,
        }
    }

    pub fn serialize(msg: impl Into<String>) -> Self {
        Self::Serialize(msg.into())
    }

    pub fn illegal_access(path: impl Into<String>, limitation: impl Into<String>) -> Self {
        Self::IllegalAccess {
            path: path.into(),
            limitation: limitation.into(),
        }
    }

    pub fn cyclical(name: impl Into<String>, chain: Vec<String>) -> Self {
        Self::CyclicalReference {
            name: name.into(),
            chain,
        }
    }

    pub fn encoding(msg: impl Into<String>) -> Self {
        Self::Encoding(msg.into())
    }

    pub fn unknown(msg: impl Into<String>) -> Self {
        Self::Unknown(msg.into())
    }

    /// Stable code for host-side classification of render failures.
    pub fn error_code(&self) -> &'static str {
        match self {
            Error::NoTemplateExists(_) => "E_NO_TEMPLATE",
            Error::IllegalAccess { .. } => "E_ILLEGAL_ACCESS",
            Error::CyclicalReference { .. } => "E_CYCLICAL_REFERENCE",
            Error::NoSources => "E_NO_SOURCES",
            Error::NoSourceForKey(_) => "E_NO_SOURCE_FOR_KEY",
            Error::Parse { .. } => "E_PARSE",
            Error::Serialize(_) => "E_SERIALIZE",
            Error::MissingRaw(_) => "E_MISSING_RAW",
            Error::Timeout(_) => "E_TIMEOUT",
            Error::Encoding(_) => "E_ENCODING",
            Error::Io(_) => "E_IO",
            Error::Json(_) => "E_JSON",
            Error::Unknown(_) => "E_UNKNOWN",
        }
    }

    /// Parse and resolve errors always abort a render; serialize-stage
    /// errors may decay to `trueNil` depending on the options in force.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Error::Serialize(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes_are_stable() {
        assert_eq!(
            Error::NoTemplateExists("a".into()).error_code(),
            "E_NO_TEMPLATE"
        );
        assert_eq!(Error::Timeout(0.5).error_code(), "E_TIMEOUT");
        assert_eq!(
            Error::cyclical("a", vec!["a".into(), "b".into()]).error_code(),
            "E_CYCLICAL_REFERENCE"
        );
    }

    #[test]
    fn test_cyclical_display_includes_chain() {
        let err = Error::cyclical("a", vec!["a".into(), "b".into(), "a".into()]);
        let message = err.to_string();
        assert!(message.contains("a -> b -> a"));
    }

    #[test]
    fn test_parse_error_carries_location() {
        let err = Error::parse("unexpected token", SourceLocation::new("index", 3, 14));
        assert!(err.to_string().contains("index:3:14"));
    }
}
