//! Lexing and parsing: source text to compiled AST

pub mod lexer;
pub mod parameter;
pub mod parser;
pub mod token;

pub use lexer::Lexer;
pub use parameter::{Expression, ExpressionForm, FunctionCall, Parameter, ResolvedCall, Tuple};
pub use parser::Parser;
pub use token::{Keyword, Operator, OperatorForm, ParameterToken, Token, TokenKind};
