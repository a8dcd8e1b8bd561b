//! Lexer for template sources
//!
//! Converts a named source buffer into an ordered token stream. The outer
//! state machine walks `raw -> tag mark -> tag name -> parameter scan ->
//! block mark -> raw`. A backslash immediately before the tag mark escapes
//! it into the raw stream, and a tag mark not followed by a valid
//! identifier or `(` decays back into raw output.

use super::token::{Keyword, Operator, ParameterToken, Token, TokenKind};
use crate::error::{Error, Result, SourceLocation};
use crate::runtime;
use crate::value::TemplateData;
use std::collections::HashMap;

pub struct Lexer {
    template: String,
    input: Vec<char>,
    position: usize,
    line: usize,
    column: usize,
    tag: char,
    tokens: Vec<Token>,
}

impl Lexer {
    pub fn new(template: impl Into<String>, source: &str) -> Self {
        Self {
            template: template.into(),
            input: source.chars().collect(),
            position: 0,
            line: 1,
            column: 1,
            tag: runtime::tag_indicator() as char,
            tokens: Vec::new(),
        }
    }

    fn location(&self) -> SourceLocation {
        SourceLocation::new(self.template.clone(), self.line, self.column)
    }

    fn current(&self) -> Option<char> {
        self.input.get(self.position).copied()
    }

    fn peek(&self) -> Option<char> {
        self.input.get(self.position + 1).copied()
    }

    fn advance(&mut self) {
        if self.current() == Some('\n') {
            self.line += 1;
            self.column = 1;
        } else {
            self.column += 1;
        }
        self.position += 1;
    }

    fn emit(&mut self, kind: TokenKind, location: SourceLocation) {
        self.tokens.push(Token::new(kind, location));
    }

    /// Tokenize the entire input.
    pub fn tokenize(mut self) -> Result<Vec<Token>> {
        let mut raw = String::new();
        let mut raw_start = self.location();

        while let Some(ch) = self.current() {
            if ch == '\\' && self.peek() == Some(self.tag) {
                // Escaped tag mark joins the raw stream.
                raw.push(self.tag);
                self.advance();
                self.advance();
                continue;
            }
            if ch == self.tag {
                let follows = self.peek();
                let opens_tag = matches!(follows, Some(c) if c == '(' || c.is_ascii_alphabetic() || c == '_');
                if !opens_tag {
                    // Decayed mark: not a tag after all.
                    raw.push(ch);
                    self.advance();
                    continue;
                }
                if !raw.is_empty() {
                    self.emit(TokenKind::Raw(std::mem::take(&mut raw)), raw_start.clone());
                }
                self.lex_tag()?;
                raw_start = self.location();
                continue;
            }
            raw.push(ch);
            self.advance();
        }

        if !raw.is_empty() {
            self.emit(TokenKind::Raw(raw), raw_start);
        }
        Ok(self.tokens)
    }

    /// Lex one tag: mark, optional name, optional parameters, optional
    /// block mark.
    fn lex_tag(&mut self) -> Result<()> {
        let mark_location = self.location();
        self.advance(); // consume the tag indicator
        self.emit(TokenKind::TagMark, mark_location);

        let name_location = self.location();
        let name = self.read_identifier();
        if name.is_empty() {
            self.emit(TokenKind::Tag(None), name_location);
        } else {
            self.emit(TokenKind::Tag(Some(name)), name_location);
        }

        if self.current() == Some('(') {
            self.lex_parameters()?;
        }

        if self.current() == Some(':') {
            let location = self.location();
            self.advance();
            self.emit(TokenKind::BlockMark, location);
        }
        Ok(())
    }

    fn read_identifier(&mut self) -> String {
        let mut word = String::new();
        while let Some(ch) = self.current() {
            if ch.is_ascii_alphanumeric() || ch == '_' {
                word.push(ch);
                self.advance();
            } else {
                break;
            }
        }
        word
    }

    /// Scan a parameter list, including nested parentheses, until the
    /// matching close. Whitespace is preserved as tokens so the parser can
    /// distinguish subscripts (`a[i]`) from array literals (`a [i]`).
    fn lex_parameters(&mut self) -> Result<()> {
        let open_location = self.location();
        self.advance(); // consume '('
        self.emit(TokenKind::ParamsStart, open_location.clone());
        let mut depth = 1usize;

        // True right after `(` or `,`; an identifier lexed there may turn a
        // following `:` into a label mark instead of a ternary separator.
        let mut at_argument_start = true;
        let mut label_candidate = false;

        while depth > 0 {
            let Some(ch) = self.current() else {
                return Err(Error::parse("unterminated parameter list", open_location));
            };
            let location = self.location();

            if ch.is_whitespace() {
                while matches!(self.current(), Some(c) if c.is_whitespace()) {
                    self.advance();
                }
                self.emit(TokenKind::Whitespace, location);
                continue;
            }

            match ch {
                '(' => {
                    depth += 1;
                    self.advance();
                    self.emit(TokenKind::ParamsStart, location);
                    at_argument_start = true;
                    label_candidate = false;
                }
                ')' => {
                    depth -= 1;
                    self.advance();
                    self.emit(TokenKind::ParamsEnd, location);
                    at_argument_start = false;
                    label_candidate = false;
                }
                ',' => {
                    self.advance();
                    self.emit(TokenKind::ParamDelimiter, location);
                    at_argument_start = true;
                    label_candidate = false;
                }
                '"' => {
                    let literal = self.lex_string()?;
                    self.emit(
                        TokenKind::Parameter(ParameterToken::Literal(literal)),
                        location,
                    );
                    at_argument_start = false;
                    label_candidate = false;
                }
                ':' if label_candidate => {
                    self.advance();
                    self.emit(TokenKind::LabelMark, location);
                    label_candidate = false;
                }
                '[' if self.peek() == Some(']') => {
                    self.advance();
                    self.advance();
                    self.emit(
                        TokenKind::Parameter(ParameterToken::Literal(TemplateData::array(
                            Vec::new(),
                        ))),
                        location,
                    );
                    at_argument_start = false;
                    label_candidate = false;
                }
                '[' if self.peek() == Some(':') && self.input.get(self.position + 2) == Some(&']') =>
                {
                    self.advance();
                    self.advance();
                    self.advance();
                    self.emit(
                        TokenKind::Parameter(ParameterToken::Literal(TemplateData::dictionary(
                            HashMap::new(),
                        ))),
                        location,
                    );
                    at_argument_start = false;
                    label_candidate = false;
                }
                c if c.is_ascii_digit() => {
                    let literal = self.lex_number();
                    self.emit(
                        TokenKind::Parameter(ParameterToken::Literal(literal)),
                        location,
                    );
                    at_argument_start = false;
                    label_candidate = false;
                }
                c if c.is_ascii_alphabetic() || c == '_' => {
                    let word = self.read_identifier();
                    if self.current() == Some('(') {
                        self.emit(
                            TokenKind::Parameter(ParameterToken::Function(word)),
                            location,
                        );
                    } else if let Some(keyword) = Keyword::from_identifier(&word) {
                        self.emit(
                            TokenKind::Parameter(ParameterToken::Keyword(keyword)),
                            location,
                        );
                        label_candidate = false;
                        at_argument_start = false;
                        continue;
                    } else {
                        label_candidate = at_argument_start;
                        self.emit(
                            TokenKind::Parameter(ParameterToken::Variable(word)),
                            location,
                        );
                        at_argument_start = false;
                        continue;
                    }
                    at_argument_start = false;
                    label_candidate = false;
                }
                _ => {
                    let operator = self.lex_operator().ok_or_else(|| {
                        Error::parse(format!("unexpected character {:?}", ch), location.clone())
                    })?;
                    self.emit(
                        TokenKind::Parameter(ParameterToken::Operator(operator)),
                        location,
                    );
                    // `[` opens a collection literal whose first element may
                    // carry a label (`[k: v]`).
                    at_argument_start = operator == Operator::SubOpen;
                    label_candidate = false;
                }
            }
        }
        Ok(())
    }

    /// Longest-match scan against the operator vocabulary.
    fn lex_operator(&mut self) -> Option<Operator> {
        for (symbol, operator) in Operator::lexing_table() {
            let length = symbol.chars().count();
            let matches = symbol
                .chars()
                .enumerate()
                .all(|(i, c)| self.input.get(self.position + i) == Some(&c));
            if matches {
                for _ in 0..length {
                    self.advance();
                }
                return Some(*operator);
            }
        }
        None
    }

    /// Integer `[0-9]+` or double `[0-9]+\.[0-9]+`.
    fn lex_number(&mut self) -> TemplateData {
        let mut digits = String::new();
        while matches!(self.current(), Some(c) if c.is_ascii_digit()) {
            digits.push(self.current().unwrap_or_default());
            self.advance();
        }
        if self.current() == Some('.') && matches!(self.peek(), Some(c) if c.is_ascii_digit()) {
            digits.push('.');
            self.advance();
            while matches!(self.current(), Some(c) if c.is_ascii_digit()) {
                digits.push(self.current().unwrap_or_default());
                self.advance();
            }
            digits.parse::<f64>().map(TemplateData::from).unwrap_or_else(|_| {
                TemplateData::error(format!("unreadable double literal {}", digits))
            })
        } else {
            digits.parse::<i64>().map(TemplateData::from).unwrap_or_else(|_| {
                TemplateData::error(format!("unreadable integer literal {}", digits))
            })
        }
    }

    /// Double-quoted string with `\n \t \" \\` escapes.
    fn lex_string(&mut self) -> Result<TemplateData> {
        let open_location = self.location();
        self.advance(); // consume '"'
        let mut literal = String::new();
        loop {
            let Some(ch) = self.current() else {
                return Err(Error::parse("unterminated string literal", open_location));
            };
            match ch {
                '"' => {
                    self.advance();
                    return Ok(TemplateData::from(literal));
                }
                '\\' => {
                    let escape_location = self.location();
                    self.advance();
                    let escaped = match self.current() {
                        Some('n') => '\n',
                        Some('t') => '\t',
                        Some('"') => '"',
                        Some('\\') => '\\',
                        other => {
                            return Err(Error::parse(
                                format!(
                                    "invalid escape \\{}",
                                    other.map(String::from).unwrap_or_default()
                                ),
                                escape_location,
                            ))
                        }
                    };
                    literal.push(escaped);
                    self.advance();
                }
                _ => {
                    literal.push(ch);
                    self.advance();
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lex(source: &str) -> Vec<TokenKind> {
        Lexer::new("test", source)
            .tokenize()
            .unwrap()
            .into_iter()
            .map(|t| t.kind)
            .collect()
    }

    #[test]
    fn test_plain_raw() {
        let tokens = lex("Hello World");
        assert_eq!(tokens, vec![TokenKind::Raw("Hello World".into())]);
    }

    #[test]
    fn test_anonymous_expression() {
        let tokens = lex("Todo: #(todo.title)");
        assert_eq!(tokens[0], TokenKind::Raw("Todo: ".into()));
        assert_eq!(tokens[1], TokenKind::TagMark);
        assert_eq!(tokens[2], TokenKind::Tag(None));
        assert_eq!(tokens[3], TokenKind::ParamsStart);
        assert_eq!(
            tokens[4],
            TokenKind::Parameter(ParameterToken::Variable("todo".into()))
        );
        assert_eq!(
            tokens[5],
            TokenKind::Parameter(ParameterToken::Operator(Operator::ScopeMember))
        );
        assert_eq!(
            tokens[6],
            TokenKind::Parameter(ParameterToken::Variable("title".into()))
        );
        assert_eq!(tokens[7], TokenKind::ParamsEnd);
    }

    #[test]
    fn test_escaped_tag_mark_joins_raw() {
        let tokens = lex(r"a \#(b) c");
        assert_eq!(tokens, vec![TokenKind::Raw("a #(b) c".into())]);
    }

    #[test]
    fn test_decayed_tag_mark() {
        let tokens = lex("1 # 2 #!");
        assert_eq!(tokens, vec![TokenKind::Raw("1 # 2 #!".into())]);
    }

    #[test]
    fn test_block_mark_after_params() {
        let tokens = lex("#if(x):body#endif");
        assert!(tokens.contains(&TokenKind::BlockMark));
        assert!(tokens.contains(&TokenKind::Tag(Some("if".into()))));
        assert!(tokens.contains(&TokenKind::Tag(Some("endif".into()))));
        assert!(tokens.contains(&TokenKind::Raw("body".into())));
    }

    #[test]
    fn test_literals() {
        let tokens = lex(r#"#f(1, 2.5, "a\nb", [], [:])"#);
        let literals: Vec<&TemplateData> = tokens
            .iter()
            .filter_map(|t| match t {
                TokenKind::Parameter(ParameterToken::Literal(v)) => Some(v),
                _ => None,
            })
            .collect();
        assert_eq!(literals.len(), 5);
        assert_eq!(literals[0].as_int(), Some(1));
        assert_eq!(literals[1].as_double(), Some(2.5));
        assert_eq!(literals[2].as_string().as_deref(), Some("a\nb"));
        assert!(literals[3].is_collection());
        assert!(literals[4].is_collection());
    }

    #[test]
    fn test_invalid_escape_is_error() {
        let result = Lexer::new("test", r#"#f("a\qb")"#).tokenize();
        assert!(matches!(result, Err(Error::Parse { .. })));
    }

    #[test]
    fn test_unterminated_parameter_list() {
        let result = Lexer::new("test", "#if(a").tokenize();
        assert!(matches!(result, Err(Error::Parse { .. })));
    }

    #[test]
    fn test_label_mark_versus_ternary() {
        let tokens = lex(r#"#inline("file", as: template)"#);
        assert!(tokens.contains(&TokenKind::LabelMark));

        let tokens = lex("#(a ? b : c)");
        assert!(!tokens.contains(&TokenKind::LabelMark));
        assert!(tokens.contains(&TokenKind::Parameter(ParameterToken::Operator(
            Operator::TernaryFalse
        ))));
    }

    #[test]
    fn test_whitespace_preserved_in_params() {
        let subscript = lex("#(a[0])");
        assert!(!subscript.contains(&TokenKind::Whitespace));
        let spaced = lex("#(a [0])");
        assert!(spaced.contains(&TokenKind::Whitespace));
    }

    #[test]
    fn test_operator_longest_match() {
        let tokens = lex("#(a ?? b)");
        assert!(tokens.contains(&TokenKind::Parameter(ParameterToken::Operator(
            Operator::NilCoalesce
        ))));
        let tokens = lex("#(a != b)");
        assert!(tokens.contains(&TokenKind::Parameter(ParameterToken::Operator(
            Operator::NotEqual
        ))));
    }

    #[test]
    fn test_keywords_lexed() {
        let tokens = lex("#for(a in b)");
        assert!(tokens.contains(&TokenKind::Parameter(ParameterToken::Keyword(Keyword::In))));
    }

    #[test]
    fn test_function_identifier() {
        let tokens = lex("#(count(a))");
        assert!(tokens.contains(&TokenKind::Parameter(ParameterToken::Function(
            "count".into()
        ))));
    }

    #[test]
    fn test_locations_track_lines() {
        let tokens = Lexer::new("test", "line one\n#(x)").tokenize().unwrap();
        let tag = tokens
            .iter()
            .find(|t| t.kind == TokenKind::TagMark)
            .unwrap();
        assert_eq!(tag.location.line, 2);
        assert_eq!(tag.location.column, 1);
    }
}
