//! Parser: token stream to AST
//!
//! Accumulates scope tables into the AST arena. Each tag opens either a
//! block (a `:` after the parameters starts a new scope table) or an atomic
//! expression. Expression assembly runs a precedence pass over the operator
//! table; call parameters are validated against the entity registry, and a
//! call is frozen to one implementation as soon as exactly one overload
//! matches.

use super::lexer::Lexer;
use super::parameter::{Expression, ExpressionForm, FunctionCall, Parameter, ResolvedCall, Tuple};
use super::token::{Keyword, Operator, ParameterToken, Token, TokenKind};
use crate::ast::{Ast, AstInfo, AstKey, MetaBlock, ScopeRef, Syntax};
use crate::entities;
use crate::error::{Error, Result, SourceLocation};
use crate::value::TemplateData;
use crate::variable::Variable;
use std::collections::HashMap;

/// An open scope awaiting its end tag.
struct OpenScope {
    table: usize,
    /// Block name that opened the scope, for chain continuation checks.
    opened_by: Option<String>,
    /// Name expected after `end`; chain siblings inherit the head's.
    end_name: String,
    /// `(table, index)` of the syntax node whose scope pointer to patch.
    patch: (usize, usize),
}

/// Closing token of a nested parameter region.
#[derive(Clone, Copy, PartialEq)]
enum Terminator {
    Paren,
    Bracket,
}

pub struct Parser {
    tokens: Vec<Token>,
    position: usize,
    template: String,
    scopes: Vec<Vec<Syntax>>,
    open: Vec<OpenScope>,
    info: AstInfo,
    /// Root-context entries marked literal, inlinable at parse.
    literals: HashMap<String, TemplateData>,
    /// Strip one newline from the next raw span (set after structural tags).
    trim_newline: bool,
}

impl Parser {
    pub fn new(template: impl Into<String>, source: &str) -> Result<Self> {
        let template = template.into();
        let tokens = Lexer::new(template.clone(), source).tokenize()?;
        Ok(Self {
            tokens,
            position: 0,
            template,
            scopes: vec![Vec::new()],
            open: Vec::new(),
            info: AstInfo::default(),
            literals: HashMap::new(),
            trim_newline: false,
        })
    }

    /// Provide root-context literal entries for parse-time inlining.
    pub fn with_literals(mut self, literals: HashMap<String, TemplateData>) -> Self {
        self.literals = literals;
        self
    }

    /// Parse the whole token stream into an AST under `key`.
    pub fn parse(mut self, key: AstKey) -> Result<Ast> {
        while self.position < self.tokens.len() {
            self.parse_statement()?;
        }
        if let Some(scope) = self.open.last() {
            return Err(Error::parse(
                format!("missing #end{}", scope.end_name),
                self.eof_location(),
            ));
        }
        self.info.max_depth = self.info.max_depth.max(1);
        Ok(Ast::new(key, self.scopes, self.info))
    }

    // Token cursor helpers

    fn eof_location(&self) -> SourceLocation {
        self.tokens
            .last()
            .map(|t| t.location.clone())
            .unwrap_or_else(|| SourceLocation::new(self.template.clone(), 1, 1))
    }

    fn here(&self) -> SourceLocation {
        self.tokens
            .get(self.position)
            .map(|t| t.location.clone())
            .unwrap_or_else(|| self.eof_location())
    }

    fn peek_kind(&self) -> Option<&TokenKind> {
        self.tokens.get(self.position).map(|t| &t.kind)
    }

    fn bump(&mut self) -> Option<TokenKind> {
        let kind = self.tokens.get(self.position).map(|t| t.kind.clone());
        if kind.is_some() {
            self.position += 1;
        }
        kind
    }

    fn eat(&mut self, kind: &TokenKind) -> bool {
        if self.peek_kind() == Some(kind) {
            self.position += 1;
            true
        } else {
            false
        }
    }

    fn current_table(&mut self) -> &mut Vec<Syntax> {
        let index = self.open.last().map(|s| s.table).unwrap_or(0);
        &mut self.scopes[index]
    }

    fn push_syntax(&mut self, syntax: Syntax) {
        if let Syntax::Passthrough(param) = &syntax {
            self.note_symbols(param);
        }
        self.current_table().push(syntax);
    }

    fn note_symbols(&mut self, param: &Parameter) {
        for symbol in param.symbols() {
            if !symbol.is_define_scoped() {
                self.info.required_vars.insert(symbol);
            }
        }
    }

    // Statements

    fn parse_statement(&mut self) -> Result<()> {
        let location = self.here();
        match self.bump() {
            Some(TokenKind::Raw(mut text)) => {
                if std::mem::take(&mut self.trim_newline) {
                    if let Some(stripped) = text.strip_prefix('\n') {
                        text = stripped.to_string();
                    }
                }
                if !text.is_empty() {
                    self.info.underestimated_size += text.len();
                    self.push_syntax(Syntax::Raw(text));
                }
                Ok(())
            }
            Some(TokenKind::TagMark) => self.parse_tag(),
            Some(other) => Err(Error::parse(
                format!("unexpected token {:?} at statement level", other),
                location,
            )),
            None => Ok(()),
        }
    }

    fn parse_tag(&mut self) -> Result<()> {
        let location = self.here();
        let name = match self.bump() {
            Some(TokenKind::Tag(name)) => name,
            other => {
                return Err(Error::parse(
                    format!("expected tag name, found {:?}", other),
                    location,
                ))
            }
        };

        match name.as_deref() {
            None => {
                let param = self.parse_tag_params(&location)?.ok_or_else(|| {
                    Error::parse("anonymous expression requires parameters", location.clone())
                })?;
                if self.eat(&TokenKind::BlockMark) {
                    return Err(Error::parse(
                        "anonymous expressions cannot open a body",
                        location,
                    ));
                }
                self.push_syntax(Syntax::Passthrough(self.inline_literals(param)));
                Ok(())
            }
            Some(name) if name.len() > 3 && name.starts_with("end") => {
                self.close_scope(&name[3..], &location)
            }
            Some("define") => self.parse_define(&location),
            Some("evaluate") => self.parse_evaluate(&location),
            Some("inline") => self.parse_inline(&location),
            Some("raw") => self.parse_raw_switch(&location),
            Some("var") | Some("let") => {
                let keyword = if name.as_deref() == Some("var") {
                    Keyword::Var
                } else {
                    Keyword::Let
                };
                self.parse_declaration(keyword, &location)
            }
            Some(tag) => {
                let tag = tag.to_string();
                self.parse_named_tag(tag, &location)
            }
        }
    }

    /// A tag's parenthesized parameter region reduced to one parameter.
    fn parse_tag_params(&mut self, location: &SourceLocation) -> Result<Option<Parameter>> {
        let tuple = match self.parse_optional_tuple()? {
            Some(tuple) => tuple,
            None => return Ok(None),
        };
        if tuple.len() != 1 || !tuple.labels().is_empty() {
            return Err(Error::parse(
                "expected a single expression",
                location.clone(),
            ));
        }
        Ok(tuple.values().first().cloned())
    }

    fn parse_optional_tuple(&mut self) -> Result<Option<Tuple>> {
        if self.eat(&TokenKind::ParamsStart) {
            Ok(Some(self.parse_tuple(Terminator::Paren, false)?))
        } else {
            Ok(None)
        }
    }

    /// A named tag: block entity, or a value-producing function call.
    fn parse_named_tag(&mut self, name: String, location: &SourceLocation) -> Result<()> {
        let params = self.parse_optional_tuple()?.unwrap_or_default();

        if self.eat(&TokenKind::BlockMark) {
            return self.open_block(name, params, location);
        }

        let factory_exists =
            entities::with_registry(|e| e.block_factory(&name).is_some())?;
        if factory_exists {
            return Err(Error::parse(
                format!("block #{} requires a body", name),
                location.clone(),
            ));
        }

        let call = self.build_function_call(name, params, location)?;
        self.push_syntax(Syntax::Passthrough(self.inline_literals(call)));
        Ok(())
    }

    // Blocks and scopes

    fn open_block(
        &mut self,
        name: String,
        params: Tuple,
        location: &SourceLocation,
    ) -> Result<()> {
        let (chains_to, call) = entities::with_registry(|e| {
            let chains_to = e
                .block_factory(&name)
                .map(|f| f.chains_to.clone())
                .unwrap_or_default();
            (chains_to, e.validate_block(&name, &params, location))
        })?;
        let (instance, call) = call?;

        let mut end_name = name.clone();
        if !chains_to.is_empty() {
            // A chain continuation closes its antecedent's scope and opens
            // a sibling in the same parent table.
            let antecedent = self
                .open
                .last()
                .and_then(|scope| scope.opened_by.clone())
                .filter(|opened_by| chains_to.contains(opened_by));
            let Some(_) = antecedent else {
                return Err(Error::parse(
                    format!(
                        "#{} must directly follow {}",
                        name,
                        chains_to
                            .iter()
                            .map(|c| format!("#{}", c))
                            .collect::<Vec<_>>()
                            .join(" or ")
                    ),
                    location.clone(),
                ));
            };
            let closed = self.pop_scope();
            end_name = closed;
        }

        for value in call.values() {
            self.note_symbols(value);
        }

        let table = self.open.last().map(|s| s.table).unwrap_or(0);
        let index = self.scopes[table].len();
        self.scopes[table].push(Syntax::Block {
            name: name.clone(),
            instance,
            call,
            scope: ScopeRef::Unset,
        });
        self.begin_scope(Some(name), end_name, (table, index));
        Ok(())
    }

    fn begin_scope(&mut self, opened_by: Option<String>, end_name: String, patch: (usize, usize)) {
        self.scopes.push(Vec::new());
        let table = self.scopes.len() - 1;
        self.open.push(OpenScope {
            table,
            opened_by,
            end_name,
            patch,
        });
        self.info.max_depth = self.info.max_depth.max(self.open.len() + 1);
        self.trim_newline = true;
    }

    /// Pop the innermost scope, patch its opener, return its end name.
    fn pop_scope(&mut self) -> String {
        let Some(scope) = self.open.pop() else {
            return String::new();
        };
        let reference = if self.scopes[scope.table].len() == 1 {
            ScopeRef::Atomic(scope.table)
        } else {
            ScopeRef::Table(scope.table)
        };
        let (patch_table, patch_index) = scope.patch;
        match self.scopes[patch_table].get_mut(patch_index) {
            Some(Syntax::Block { scope, .. }) => *scope = reference,
            Some(Syntax::Meta(MetaBlock::Define { scope, .. })) => *scope = reference,
            Some(Syntax::Meta(MetaBlock::RawSwitch { scope, .. })) => *scope = reference,
            _ => {}
        }
        scope.end_name
    }

    fn close_scope(&mut self, end_name: &str, location: &SourceLocation) -> Result<()> {
        let Some(open_name) = self.open.last().map(|scope| scope.end_name.clone()) else {
            return Err(Error::parse(
                format!("#end{} without an open block", end_name),
                location.clone(),
            ));
        };
        if open_name != end_name {
            return Err(Error::parse(
                format!("found #end{} while #{} is open", end_name, open_name),
                location.clone(),
            ));
        }
        self.pop_scope();
        self.trim_newline = true;
        Ok(())
    }

    // Meta-blocks

    fn parse_define(&mut self, location: &SourceLocation) -> Result<()> {
        let param = self.parse_tag_params(location)?.ok_or_else(|| {
            Error::parse("#define requires an identifier", location.clone())
        })?;

        match param {
            // #define(id): body #enddefine
            Parameter::Variable(var) if var.is_atomic() && !var.is_contextualized() => {
                if !self.eat(&TokenKind::BlockMark) {
                    return Err(Error::parse(
                        "#define with a bare identifier requires a body",
                        location.clone(),
                    ));
                }
                let table = self.open.last().map(|s| s.table).unwrap_or(0);
                let index = self.scopes[table].len();
                self.scopes[table].push(Syntax::Meta(MetaBlock::Define {
                    id: var.ancestor().to_string(),
                    value: None,
                    scope: ScopeRef::Unset,
                }));
                self.begin_scope(None, "define".to_string(), (table, index));
                Ok(())
            }
            // #define(id = expr)
            Parameter::Expression(expression)
                if expression.form() == ExpressionForm::Assignment =>
            {
                let [Parameter::Variable(target), Parameter::Operator(Operator::Assignment), value] =
                    expression.elements()
                else {
                    return Err(Error::parse(
                        "#define accepts only a plain assignment",
                        location.clone(),
                    ));
                };
                if !target.is_atomic() {
                    return Err(Error::parse(
                        "#define identifier must be atomic",
                        location.clone(),
                    ));
                }
                self.note_symbols(value);
                self.push_syntax(Syntax::Meta(MetaBlock::Define {
                    id: target.ancestor().to_string(),
                    value: Some(value.clone()),
                    scope: ScopeRef::Unset,
                }));
                self.trim_newline = true;
                Ok(())
            }
            _ => Err(Error::parse(
                "#define expects an identifier or identifier = expression",
                location.clone(),
            )),
        }
    }

    fn parse_evaluate(&mut self, location: &SourceLocation) -> Result<()> {
        let param = self.parse_tag_params(location)?.ok_or_else(|| {
            Error::parse("#evaluate requires an identifier", location.clone())
        })?;
        let (id, default) = destructure_evaluate(&param, location)?;
        self.push_syntax(Syntax::Meta(MetaBlock::Evaluate { id, default }));
        Ok(())
    }

    fn parse_inline(&mut self, location: &SourceLocation) -> Result<()> {
        let tuple = self.parse_optional_tuple()?.ok_or_else(|| {
            Error::parse("#inline requires a file name", location.clone())
        })?;
        let name = match tuple.get(0) {
            Some(Parameter::Value(v)) if v.kind() == crate::value::DataKind::String => v
                .as_string()
                .ok_or_else(|| Error::parse("#inline file name unreadable", location.clone()))?,
            _ => {
                return Err(Error::parse(
                    "#inline requires a literal file name",
                    location.clone(),
                ))
            }
        };
        if tuple.len() > 2 || (tuple.len() == 2 && tuple.labeled("as").is_none()) {
            return Err(Error::parse(
                "#inline accepts a file name and an optional as: mode",
                location.clone(),
            ));
        }

        let syntax = match tuple.labeled("as") {
            None | Some(Parameter::Keyword(Keyword::Template)) => {
                self.info.required_asts.insert(name.clone());
                Syntax::Meta(MetaBlock::InlineTemplate { name })
            }
            Some(Parameter::Variable(handler)) if handler.is_atomic() => {
                let handler = handler.ancestor().to_string();
                entities::with_registry(|e| e.validate_raw(&handler))?.map_err(|_| {
                    Error::parse(
                        format!("unknown raw handler \"{}\"", handler),
                        location.clone(),
                    )
                })?;
                self.info.required_raws.insert(name.clone());
                Syntax::Meta(MetaBlock::InlineRaw { name, handler })
            }
            _ => {
                return Err(Error::parse(
                    "#inline mode must be template, raw, or a raw handler name",
                    location.clone(),
                ))
            }
        };
        self.push_syntax(syntax);
        self.trim_newline = true;
        Ok(())
    }

    fn parse_raw_switch(&mut self, location: &SourceLocation) -> Result<()> {
        if let Some(tuple) = self.parse_optional_tuple()? {
            if !tuple.is_empty() {
                // Preserved behavior of the original engine.
                return Err(Error::parse(
                    "raw switching blocks not yet supported",
                    location.clone(),
                ));
            }
        }
        if !self.eat(&TokenKind::BlockMark) {
            return Err(Error::parse("#raw requires a body", location.clone()));
        }
        let table = self.open.last().map(|s| s.table).unwrap_or(0);
        let index = self.scopes[table].len();
        self.scopes[table].push(Syntax::Meta(MetaBlock::RawSwitch {
            handler: entities::DEFAULT_RAW.to_string(),
            scope: ScopeRef::Unset,
        }));
        self.begin_scope(None, "raw".to_string(), (table, index));
        Ok(())
    }

    /// `#var(x)` / `#var(x = expr)` decay to a declaration expression.
    fn parse_declaration(&mut self, keyword: Keyword, location: &SourceLocation) -> Result<()> {
        let param = self.parse_tag_params(location)?.ok_or_else(|| {
            Error::parse(
                format!("#{} requires an identifier", keyword),
                location.clone(),
            )
        })?;
        let elements = match param {
            Parameter::Variable(var) if var.is_atomic() && !var.is_contextualized() => {
                vec![Parameter::Keyword(keyword), Parameter::Variable(var)]
            }
            Parameter::Expression(expression)
                if expression.form() == ExpressionForm::Assignment
                    && expression.operator() == Some(Operator::Assignment) =>
            {
                let [target @ Parameter::Variable(var), _, value] = expression.elements() else {
                    return Err(Error::parse(
                        format!("#{} expects identifier = expression", keyword),
                        location.clone(),
                    ));
                };
                if !var.is_atomic() {
                    return Err(Error::parse(
                        "declared variable names must be atomic",
                        location.clone(),
                    ));
                }
                self.note_symbols(value);
                vec![
                    Parameter::Keyword(keyword),
                    target.clone(),
                    self.inline_literals(value.clone()),
                ]
            }
            _ => {
                return Err(Error::parse(
                    format!("#{} expects identifier = expression", keyword),
                    location.clone(),
                ))
            }
        };
        self.push_syntax(Syntax::Passthrough(Parameter::Expression(Box::new(
            Expression::custom(elements),
        ))));
        self.trim_newline = true;
        Ok(())
    }

    // Tuples and arguments

    fn parse_tuple(&mut self, end: Terminator, collection: bool) -> Result<Tuple> {
        let mut tuple = Tuple::new();
        tuple.collection = collection;
        loop {
            while self.eat(&TokenKind::Whitespace) {}
            if self.eat_terminator(end) {
                return Ok(tuple);
            }
            let label = self.parse_label();
            let param = self.parse_argument(end)?;
            tuple.push(label, param);
            while self.eat(&TokenKind::Whitespace) {}
            if self.eat(&TokenKind::ParamDelimiter) {
                continue;
            }
            if self.eat_terminator(end) {
                return Ok(tuple);
            }
            return Err(Error::parse("expected , or end of parameters", self.here()));
        }
    }

    fn eat_terminator(&mut self, end: Terminator) -> bool {
        match end {
            Terminator::Paren => self.eat(&TokenKind::ParamsEnd),
            Terminator::Bracket => self.eat(&TokenKind::Parameter(ParameterToken::Operator(
                Operator::SubClose,
            ))),
        }
    }

    fn at_terminator(&self, end: Terminator) -> bool {
        match (end, self.peek_kind()) {
            (Terminator::Paren, Some(TokenKind::ParamsEnd)) => true,
            (
                Terminator::Bracket,
                Some(TokenKind::Parameter(ParameterToken::Operator(Operator::SubClose))),
            ) => true,
            _ => false,
        }
    }

    fn parse_label(&mut self) -> Option<String> {
        if let (
            Some(TokenKind::Parameter(ParameterToken::Variable(word))),
            Some(TokenKind::LabelMark),
        ) = (
            self.peek_kind().cloned().as_ref(),
            self.tokens.get(self.position + 1).map(|t| &t.kind),
        ) {
            let label = word.clone();
            self.position += 2;
            return Some(label);
        }
        None
    }

    /// One argument: everything up to a delimiter or the closing token.
    /// Whitespace tokens drop out here; their disambiguating work (subscript
    /// versus collection literal) already happened through token adjacency.
    fn parse_argument(&mut self, end: Terminator) -> Result<Parameter> {
        let location = self.here();
        let mut units: Vec<Parameter> = Vec::new();

        loop {
            if self.at_terminator(end)
                || matches!(self.peek_kind(), Some(TokenKind::ParamDelimiter) | None)
            {
                break;
            }
            match self.peek_kind().cloned() {
                Some(TokenKind::Whitespace) => {
                    self.position += 1;
                }
                Some(TokenKind::ParamsStart) => {
                    self.position += 1;
                    let inner = self.parse_argument(Terminator::Paren)?;
                    if !self.eat(&TokenKind::ParamsEnd) {
                        return Err(Error::parse("expected )", self.here()));
                    }
                    let chained = self.parse_operand_chain(inner, &location)?;
                    units.push(chained);
                }
                Some(TokenKind::Parameter(token)) => {
                    self.position += 1;
                    self.parse_unit(token, &mut units, &location)?;
                }
                Some(other) => {
                    return Err(Error::parse(
                        format!("unexpected {:?} in expression", other),
                        self.here(),
                    ))
                }
                None => break,
            }
        }

        if units.is_empty() {
            return Err(Error::parse("empty expression", location));
        }
        self.shape(units, &location)
    }

    fn parse_unit(
        &mut self,
        token: ParameterToken,
        units: &mut Vec<Parameter>,
        location: &SourceLocation,
    ) -> Result<()> {
        let param = match token {
            ParameterToken::Literal(value) => {
                let base = Parameter::Value(value);
                self.parse_operand_chain(base, location)?
            }
            ParameterToken::Keyword(keyword) => match keyword {
                Keyword::True | Keyword::Yes => Parameter::Value(true.into()),
                Keyword::False | Keyword::No => Parameter::Value(false.into()),
                Keyword::Nil => Parameter::Value(TemplateData::true_nil()),
                other => Parameter::Keyword(other),
            },
            ParameterToken::Variable(word) => {
                let variable = Variable::atom(word)
                    .map_err(|e| Error::parse(e.to_string(), location.clone()))?;
                self.parse_variable_chain(variable, location)?
            }
            ParameterToken::Function(name) => {
                if !self.eat(&TokenKind::ParamsStart) {
                    return Err(Error::parse("expected ( after function name", self.here()));
                }
                let args = self.parse_tuple(Terminator::Paren, false)?;
                let call = self.build_function_call(name, args, location)?;
                self.parse_operand_chain(call, location)?
            }
            ParameterToken::Operator(Operator::ScopeRoot) => {
                let Some(TokenKind::Parameter(ParameterToken::Variable(word))) =
                    self.peek_kind().cloned()
                else {
                    return Err(Error::parse("expected scope name after $", self.here()));
                };
                self.position += 1;
                let variable = Variable::scope(word)
                    .map_err(|e| Error::parse(e.to_string(), location.clone()))?;
                self.parse_variable_chain(variable, location)?
            }
            ParameterToken::Operator(Operator::SubOpen) => {
                // Whitespace (or argument start) means a collection literal;
                // directly after an operand it would have been consumed by
                // the operand chain as a subscript.
                let tuple = self.parse_tuple(Terminator::Bracket, true)?;
                self.parse_operand_chain(Parameter::Tuple(Box::new(tuple)), location)?
            }
            ParameterToken::Operator(op) => {
                if !op.parseable() {
                    return Err(Error::parse(
                        format!("operator {} cannot appear here", op),
                        location.clone(),
                    ));
                }
                Parameter::Operator(op)
            }
        };
        units.push(param);
        Ok(())
    }

    /// Collapse `a.b.c`, methods and subscripts starting from a variable.
    fn parse_variable_chain(
        &mut self,
        mut variable: Variable,
        location: &SourceLocation,
    ) -> Result<Parameter> {
        loop {
            match (self.peek_kind(), self.tokens.get(self.position + 1).map(|t| &t.kind)) {
                (
                    Some(TokenKind::Parameter(ParameterToken::Operator(Operator::ScopeMember))),
                    Some(TokenKind::Parameter(ParameterToken::Variable(word))),
                ) => {
                    let word = word.clone();
                    self.position += 2;
                    variable = variable
                        .extended(word)
                        .map_err(|e| Error::parse(e.to_string(), location.clone()))?;
                }
                (
                    Some(TokenKind::Parameter(ParameterToken::Operator(Operator::ScopeMember))),
                    Some(TokenKind::Parameter(ParameterToken::Function(name))),
                ) => {
                    let name = name.clone();
                    self.position += 2;
                    if !self.eat(&TokenKind::ParamsStart) {
                        return Err(Error::parse("expected ( after method name", self.here()));
                    }
                    let args = self.parse_tuple(Terminator::Paren, false)?;
                    let call = self.build_method_call(
                        name,
                        Parameter::Variable(variable),
                        args,
                        location,
                    )?;
                    return self.parse_operand_chain(call, location);
                }
                (
                    Some(TokenKind::Parameter(ParameterToken::Operator(Operator::SubOpen))),
                    _,
                ) => {
                    return self.parse_operand_chain(Parameter::Variable(variable), location);
                }
                _ => return Ok(Parameter::Variable(variable)),
            }
        }
    }

    /// Continue member access, subscripts and method calls on any operand.
    fn parse_operand_chain(
        &mut self,
        mut operand: Parameter,
        location: &SourceLocation,
    ) -> Result<Parameter> {
        loop {
            match (self.peek_kind(), self.tokens.get(self.position + 1).map(|t| &t.kind)) {
                (
                    Some(TokenKind::Parameter(ParameterToken::Operator(Operator::SubOpen))),
                    _,
                ) => {
                    self.position += 1;
                    let index = self.parse_argument(Terminator::Bracket)?;
                    if !self.eat_terminator(Terminator::Bracket) {
                        return Err(Error::parse("expected ]", self.here()));
                    }
                    operand = Parameter::Expression(Box::new(Expression::infix(
                        operand,
                        Operator::Subscript,
                        index,
                    )));
                }
                (
                    Some(TokenKind::Parameter(ParameterToken::Operator(Operator::ScopeMember))),
                    Some(TokenKind::Parameter(ParameterToken::Variable(word))),
                ) => {
                    let member = word.clone();
                    self.position += 2;
                    operand = Parameter::Expression(Box::new(Expression::infix(
                        operand,
                        Operator::Subscript,
                        Parameter::Value(member.into()),
                    )));
                }
                (
                    Some(TokenKind::Parameter(ParameterToken::Operator(Operator::ScopeMember))),
                    Some(TokenKind::Parameter(ParameterToken::Function(name))),
                ) => {
                    let name = name.clone();
                    self.position += 2;
                    if !self.eat(&TokenKind::ParamsStart) {
                        return Err(Error::parse("expected ( after method name", self.here()));
                    }
                    let args = self.parse_tuple(Terminator::Paren, false)?;
                    operand = self.build_method_call(name, operand, args, location)?;
                }
                _ => return Ok(operand),
            }
        }
    }

    // Call resolution

    /// `evaluate(...)` in expression position reads the define namespace.
    fn build_evaluate_reference(
        &self,
        args: &Tuple,
        location: &SourceLocation,
    ) -> Result<Parameter> {
        if args.len() != 1 {
            return Err(Error::parse(
                "evaluate expects a single identifier",
                location.clone(),
            ));
        }
        let (id, default) = destructure_evaluate(
            args.values().first().ok_or_else(|| {
                Error::parse("evaluate expects a single identifier", location.clone())
            })?,
            location,
        )?;
        let variable = Variable::atom(id)
            .map_err(|e| Error::parse(e.to_string(), location.clone()))?
            .define_scope();
        Ok(match default {
            Some(default) => Parameter::Expression(Box::new(Expression::infix(
                Parameter::Variable(variable.coalesce()),
                Operator::NilCoalesce,
                default,
            ))),
            None => Parameter::Variable(variable),
        })
    }

    fn build_function_call(
        &mut self,
        name: String,
        args: Tuple,
        location: &SourceLocation,
    ) -> Result<Parameter> {
        if name == "evaluate" {
            return self.build_evaluate_reference(&args, location);
        }

        let matches = entities::with_registry(|e| e.validate_function(&name, &args))?
            .map_err(|e| Error::parse(e.to_string(), location.clone()))?;

        let call = if matches.len() == 1 {
            let (entity, normalized) = matches.into_iter().next().ok_or_else(|| {
                Error::parse("overload selection failed", location.clone())
            })?;
            FunctionCall {
                name,
                resolved: Some(ResolvedCall::Function(entity)),
                params: normalized,
                operand: None,
            }
        } else {
            FunctionCall {
                name,
                resolved: None,
                params: args,
                operand: None,
            }
        };
        Ok(Parameter::Function(call))
    }

    fn build_method_call(
        &mut self,
        name: String,
        operand: Parameter,
        args: Tuple,
        location: &SourceLocation,
    ) -> Result<Parameter> {
        let operand_kind = operand.base_type();
        let matches =
            entities::with_registry(|e| e.validate_method(&name, operand_kind, &args))?
                .map_err(|e| Error::parse(e.to_string(), location.clone()))?;

        let bound_variable = match &operand {
            Parameter::Variable(var) if !var.is_define_scoped() => Some(var.clone()),
            _ => None,
        };

        let (resolved, params) = if matches.len() == 1 {
            let (entity, normalized) = matches.into_iter().next().ok_or_else(|| {
                Error::parse("overload selection failed", location.clone())
            })?;
            if entity.mutating && bound_variable.is_none() {
                return Err(Error::parse(
                    format!("mutating method \"{}\" requires an assignable operand", name),
                    location.clone(),
                ));
            }
            (Some(ResolvedCall::Method(entity)), normalized)
        } else {
            (None, args)
        };

        // A variable operand stays bound so mutating methods can write the
        // replacement operand back; anything else rides as params[0].
        let (operand_slot, params) = match bound_variable {
            Some(var) => (Some(Some(var)), params),
            None => {
                let mut with_operand = Tuple::new();
                with_operand.push(None, operand);
                for (index, value) in params.values().iter().enumerate() {
                    with_operand.push(
                        params.label_of(index).map(str::to_string),
                        value.clone(),
                    );
                }
                (Some(None), with_operand)
            }
        };

        Ok(Parameter::Function(FunctionCall {
            name,
            resolved,
            params,
            operand: operand_slot,
        }))
    }

    // Expression shaping

    /// Assemble an argument's units into a single parameter.
    fn shape(&self, mut units: Vec<Parameter>, location: &SourceLocation) -> Result<Parameter> {
        // A lone unit stands as-is; labeled keyword arguments like
        // `as: template` arrive here as one keyword.
        if units.len() == 1 {
            return Ok(self.inline_literals(units.remove(0)));
        }

        // A structural keyword turns the run into a custom expression the
        // consuming entity pattern-matches (e.g. `x in xs`).
        let structural = units.iter().any(|u| {
            matches!(u, Parameter::Keyword(k) if !k.is_evaluable() || *k == Keyword::Discard)
        });
        if structural {
            return Ok(Parameter::Expression(Box::new(Expression::custom(units))));
        }

        self.shape_params(units, location)
    }

    fn shape_params(
        &self,
        params: Vec<Parameter>,
        location: &SourceLocation,
    ) -> Result<Parameter> {
        if params.is_empty() {
            return Err(Error::parse("empty expression", location.clone()));
        }
        if params.len() == 1 {
            let mut single = params;
            return Ok(single.remove(0));
        }

        // Ternary: cond ? a : b at top level, right-associative.
        if let Some(question) = params
            .iter()
            .position(|p| matches!(p, Parameter::Operator(Operator::TernaryTrue)))
        {
            let colon = params[question + 1..]
                .iter()
                .position(|p| matches!(p, Parameter::Operator(Operator::TernaryFalse)))
                .map(|i| i + question + 1)
                .ok_or_else(|| Error::parse("ternary missing :", location.clone()))?;
            let condition = self.shape_params(params[..question].to_vec(), location)?;
            let when_true = self.shape_params(params[question + 1..colon].to_vec(), location)?;
            let when_false = self.shape_params(params[colon + 1..].to_vec(), location)?;
            return Ok(Parameter::Expression(Box::new(Expression::ternary(
                condition, when_true, when_false,
            ))));
        }

        // Assignment requires an l-value variable on the left.
        if let Some(index) = find_operator(&params, |op| op.is_assignment()) {
            let operator = match params[index] {
                Parameter::Operator(op) => op,
                _ => Operator::Assignment,
            };
            if index != 1 {
                return Err(Error::parse(
                    "assignment requires a single variable on the left",
                    location.clone(),
                ));
            }
            let Parameter::Variable(target) = &params[0] else {
                return Err(Error::parse(
                    "assignment target must be a variable",
                    location.clone(),
                ));
            };
            if target.is_contextualized() {
                return Err(Error::parse(
                    "context scopes are read-only",
                    location.clone(),
                ));
            }
            let value = self.shape_params(params[2..].to_vec(), location)?;
            return Ok(Parameter::Expression(Box::new(Expression::assignment(
                target.clone(),
                operator,
                self.inline_literals(value),
            ))));
        }

        // Binary operators, lowest precedence first, splitting at the
        // rightmost occurrence for left associativity.
        let mut lowest: Option<(u8, usize)> = None;
        let mut expecting_operand = true;
        for (index, param) in params.iter().enumerate() {
            match param {
                Parameter::Operator(op) if !expecting_operand && op.is_infix() => {
                    if let Some(precedence) = op.precedence() {
                        if lowest.map(|(p, _)| precedence <= p).unwrap_or(true) {
                            lowest = Some((precedence, index));
                        }
                    }
                    expecting_operand = true;
                }
                Parameter::Operator(op) if expecting_operand && op.is_unary_prefix() => {}
                _ => expecting_operand = false,
            }
        }

        if let Some((_, index)) = lowest {
            let operator = match params[index] {
                Parameter::Operator(op) => op,
                _ => {
                    return Err(Error::parse("malformed expression", location.clone()));
                }
            };
            let lhs = self.shape_params(params[..index].to_vec(), location)?;
            let rhs = self.shape_params(params[index + 1..].to_vec(), location)?;
            let lhs = if operator == Operator::NilCoalesce {
                coalesce_target(lhs)
            } else {
                lhs
            };
            return Ok(Parameter::Expression(Box::new(Expression::infix(
                self.inline_literals(lhs),
                operator,
                self.inline_literals(rhs),
            ))));
        }

        // Unary prefix: `!x`, and `-x` rewritten as `x * -1`.
        if let Parameter::Operator(op) = &params[0] {
            if op.is_unary_prefix() && params.len() >= 2 {
                let operand = self.shape_params(params[1..].to_vec(), location)?;
                let operand = self.inline_literals(operand);
                return Ok(match op {
                    Operator::Not => {
                        Parameter::Expression(Box::new(Expression::prefix(Operator::Not, operand)))
                    }
                    Operator::Minus => Parameter::Expression(Box::new(Expression::infix(
                        operand,
                        Operator::Multiply,
                        Parameter::Value((-1i64).into()),
                    ))),
                    _ => {
                        return Err(Error::parse(
                            format!("operator {} is not prefix", op),
                            location.clone(),
                        ))
                    }
                });
            }
        }

        Err(Error::parse("malformed expression", location.clone()))
    }

    /// Replace literal-marked root context variables with their values.
    fn inline_literals(&self, param: Parameter) -> Parameter {
        if self.literals.is_empty() {
            return param;
        }
        match param {
            Parameter::Variable(var)
                if var.is_atomic()
                    && !var.is_contextualized()
                    && !var.is_define_scoped() =>
            {
                match self.literals.get(var.ancestor()) {
                    Some(value) => Parameter::Value(value.clone()),
                    None => Parameter::Variable(var),
                }
            }
            other => other,
        }
    }
}

/// Rightmost top-level operator satisfying the predicate.
fn find_operator(params: &[Parameter], pred: impl Fn(Operator) -> bool) -> Option<usize> {
    params.iter().rposition(|p| match p {
        Parameter::Operator(op) => pred(*op),
        _ => false,
    })
}

/// Mark `??` targets coalesced so missing lookups stay non-fatal.
fn coalesce_target(param: Parameter) -> Parameter {
    match param {
        Parameter::Variable(var) => Parameter::Variable(var.coalesce()),
        other => other,
    }
}

/// Split `id` / `id ?? default` used by evaluate in both positions.
fn destructure_evaluate(
    param: &Parameter,
    location: &SourceLocation,
) -> Result<(String, Option<Parameter>)> {
    match param {
        Parameter::Variable(var) if var.is_atomic() && !var.is_contextualized() => {
            Ok((var.ancestor().to_string(), None))
        }
        Parameter::Expression(expression)
            if expression.operator() == Some(Operator::NilCoalesce) =>
        {
            let [Parameter::Variable(var), _, default] = expression.elements() else {
                return Err(Error::parse(
                    "evaluate expects identifier ?? default",
                    location.clone(),
                ));
            };
            if !var.is_atomic() {
                return Err(Error::parse(
                    "evaluate identifier must be atomic",
                    location.clone(),
                ));
            }
            Ok((var.ancestor().to_string(), Some(default.clone())))
        }
        _ => Err(Error::parse(
            "evaluate expects an identifier",
            location.clone(),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::MetaBlock;

    fn parse(source: &str) -> Ast {
        Parser::new("test", source)
            .unwrap()
            .parse(AstKey::searched("test"))
            .unwrap()
    }

    fn parse_err(source: &str) -> Error {
        Parser::new("test", source)
            .unwrap()
            .parse(AstKey::searched("test"))
            .unwrap_err()
    }

    #[test]
    fn test_raw_and_passthrough() {
        let ast = parse("Todo: #(todo.title)");
        assert_eq!(ast.scopes.len(), 1);
        assert!(matches!(&ast.scopes[0][0], Syntax::Raw(s) if s == "Todo: "));
        assert!(matches!(&ast.scopes[0][1], Syntax::Passthrough(_)));
        assert!(ast
            .info
            .required_vars
            .iter()
            .any(|v| v.flat_path() == "todo.title"));
    }

    #[test]
    fn test_block_with_scope() {
        let ast = parse("#if(a):yes#endif");
        let Syntax::Block { name, scope, .. } = &ast.scopes[0][0] else {
            panic!("expected block");
        };
        assert_eq!(name, "if");
        // single-statement body encodes atomically
        assert!(matches!(scope, ScopeRef::Atomic(1)));
        assert!(matches!(&ast.scopes[1][0], Syntax::Raw(s) if s == "yes"));
    }

    #[test]
    fn test_chain_parses_as_siblings() {
        let ast = parse("#if(a):1#elseif(b):2#else:3#endif");
        let names: Vec<&str> = ast.scopes[0]
            .iter()
            .filter_map(|s| match s {
                Syntax::Block { name, .. } => Some(name.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(names, vec!["if", "elseif", "else"]);
    }

    #[test]
    fn test_broken_chain_is_error() {
        let error = parse_err("#else:3#endif");
        assert!(error.to_string().contains("must directly follow"));
    }

    #[test]
    fn test_mismatched_end_is_error() {
        let error = parse_err("#if(a):x#endfor");
        assert!(error.to_string().contains("#endfor"));
    }

    #[test]
    fn test_missing_end_is_error() {
        let error = parse_err("#if(a):x");
        assert!(error.to_string().contains("missing #endif"));
    }

    #[test]
    fn test_unknown_block_is_error() {
        let error = parse_err("#bogus(a):x#endbogus");
        assert!(error.to_string().contains("unknown block"));
    }

    #[test]
    fn test_for_in_signature() {
        let ast = parse("#for(a in b):#(a)#endfor");
        let Syntax::Block { name, call, .. } = &ast.scopes[0][0] else {
            panic!("expected block");
        };
        assert_eq!(name, "for");
        assert_eq!(call.len(), 1);
        assert!(ast.info.required_vars.iter().any(|v| v.flat_path() == "b"));
    }

    #[test]
    fn test_define_forms() {
        let ast = parse("#define(x = 1)#define(y):body#enddefine");
        assert!(matches!(
            &ast.scopes[0][0],
            Syntax::Meta(MetaBlock::Define { id, value: Some(_), .. }) if id == "x"
        ));
        assert!(matches!(
            &ast.scopes[0][1],
            Syntax::Meta(MetaBlock::Define { id, value: None, scope: ScopeRef::Atomic(_), .. }) if id == "y"
        ));
    }

    #[test]
    fn test_evaluate_with_default() {
        let ast = parse("#evaluate(x ?? false)");
        let Syntax::Meta(MetaBlock::Evaluate { id, default }) = &ast.scopes[0][0] else {
            panic!("expected evaluate");
        };
        assert_eq!(id, "x");
        assert!(default.is_some());
    }

    #[test]
    fn test_inline_modes() {
        let ast = parse(r#"#inline("a")#inline("b", as: template)#inline("c", as: raw)"#);
        assert!(ast.info.required_asts.contains("a"));
        assert!(ast.info.required_asts.contains("b"));
        assert!(ast.info.required_raws.contains("c"));
    }

    #[test]
    fn test_raw_switching_not_supported() {
        let error = parse_err("#raw(other):x#endraw");
        assert!(error.to_string().contains("not yet supported"));
        // the default buffer form parses
        let ast = parse("#raw:x#endraw");
        assert!(matches!(
            &ast.scopes[0][0],
            Syntax::Meta(MetaBlock::RawSwitch { .. })
        ));
    }

    #[test]
    fn test_var_declaration_decays_to_expression() {
        let ast = parse("#var(x = 1)#(x)");
        let Syntax::Passthrough(Parameter::Expression(expression)) = &ast.scopes[0][0] else {
            panic!("expected declaration expression");
        };
        assert_eq!(expression.form(), ExpressionForm::Custom);
        assert!(matches!(
            expression.elements().first(),
            Some(Parameter::Keyword(Keyword::Var))
        ));
    }

    #[test]
    fn test_ternary_form() {
        let ast = parse("#(a ? 1 : 2)");
        let Syntax::Passthrough(Parameter::Expression(expression)) = &ast.scopes[0][0] else {
            panic!("expected expression");
        };
        assert_eq!(expression.form(), ExpressionForm::Ternary);
        assert_eq!(expression.elements().len(), 3);
    }

    #[test]
    fn test_assignment_requires_lvalue() {
        let error = parse_err("#(1 = 2)");
        assert!(error.to_string().contains("must be a variable"));
    }

    #[test]
    fn test_prefix_minus_rewrites() {
        let ast = parse("#(-a)");
        let Syntax::Passthrough(Parameter::Expression(expression)) = &ast.scopes[0][0] else {
            panic!("expected expression");
        };
        assert_eq!(expression.operator(), Some(Operator::Multiply));
    }

    #[test]
    fn test_precedence_multiplication_binds_tighter() {
        // 1 + 2 * 3 must split at +
        let ast = parse("#(1 + 2 * 3)");
        let Syntax::Passthrough(Parameter::Expression(expression)) = &ast.scopes[0][0] else {
            panic!("expected expression");
        };
        assert_eq!(expression.operator(), Some(Operator::Plus));
    }

    #[test]
    fn test_coalesced_variable_flag() {
        let ast = parse("#(a ?? 1)");
        let Syntax::Passthrough(Parameter::Expression(expression)) = &ast.scopes[0][0] else {
            panic!("expected expression");
        };
        let Parameter::Variable(var) = &expression.elements()[0] else {
            panic!("expected variable lhs");
        };
        assert!(var.is_coalesced());
    }

    #[test]
    fn test_subscript_versus_collection_literal() {
        let ast = parse("#(a[0])");
        let Syntax::Passthrough(Parameter::Expression(expression)) = &ast.scopes[0][0] else {
            panic!("expected subscript expression");
        };
        assert_eq!(expression.operator(), Some(Operator::Subscript));

        let ast = parse("#([1, 2])");
        assert!(matches!(
            &ast.scopes[0][0],
            Syntax::Passthrough(Parameter::Tuple(t)) if t.collection
        ));
    }

    #[test]
    fn test_known_function_freezes() {
        let ast = parse(r#"#(count("abc"))"#);
        let Syntax::Passthrough(Parameter::Function(call)) = &ast.scopes[0][0] else {
            panic!("expected function call");
        };
        assert!(call.resolved.is_some());
        assert!(call.operand.is_none());
    }

    #[test]
    fn test_unknown_function_is_parse_error() {
        let error = parse_err("#(nonesuch(1))");
        assert!(error.to_string().contains("unknown function"));
    }

    #[test]
    fn test_method_call_binds_variable_operand() {
        let ast = parse(r#"#(name.hasPrefix("a"))"#);
        let Syntax::Passthrough(Parameter::Function(call)) = &ast.scopes[0][0] else {
            panic!("expected method call");
        };
        assert!(matches!(&call.operand, Some(Some(var)) if var.flat_path() == "name"));
    }

    #[test]
    fn test_mutating_method_requires_variable() {
        let error = parse_err("#([1, 2].append(3))");
        assert!(error.to_string().contains("assignable operand"));
    }

    #[test]
    fn test_newline_trim_after_structural_tags() {
        let ast = parse("#define(x = 1)\nnext");
        assert!(matches!(&ast.scopes[0][1], Syntax::Raw(s) if s == "next"));
        // expression tags keep their newline
        let ast = parse("#(1)\nnext");
        assert!(matches!(&ast.scopes[0][1], Syntax::Raw(s) if s == "\nnext"));
    }

    #[test]
    fn test_literal_inlining() {
        let mut literals = HashMap::new();
        literals.insert("version".to_string(), TemplateData::from("1.0"));
        let ast = Parser::new("test", "#(version)")
            .unwrap()
            .with_literals(literals)
            .parse(AstKey::searched("test"))
            .unwrap();
        assert!(matches!(
            &ast.scopes[0][0],
            Syntax::Passthrough(Parameter::Value(v)) if v.as_string().as_deref() == Some("1.0")
        ));
    }

    #[test]
    fn test_contextualized_variable() {
        let ast = parse("#($api.key)");
        let Syntax::Passthrough(Parameter::Variable(var)) = &ast.scopes[0][0] else {
            panic!("expected variable");
        };
        assert!(var.is_contextualized());
        assert_eq!(var.flat_path(), "api.key");
    }
}
