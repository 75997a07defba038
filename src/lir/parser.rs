use hashbrown::HashMap;

use super::{
    BlockId, Function, Immediate, Instruction, Module, Opcode, Operand, RegisterId,
    lexer::{Keyword, Lexer, Token, TokenKind},
};
use crate::{error::ParseError, index::Index};

pub struct Parser<'source> {
    lexer: Lexer<'source>,
}

/// Name resolution state for the function currently being parsed. Blocks may
/// be referenced before they are defined.
struct FunctionScope {
    function: Function,
    blocks: HashMap<String, BlockId>,
    defined: Vec<BlockId>,
    first_reference: HashMap<BlockId, Token>,
}

impl<'source> Parser<'source> {
    pub fn parse_module(source: &'source str) -> Result<Module, ParseError> {
        let mut parser = Self {
            lexer: Lexer::new(source),
        };

        let mut module = Module::default();

        while parser.lexer.peek()?.is_some() {
            module.functions.push(parser.parse_function()?);
        }

        Ok(module)
    }

    fn error_at(&self, token: Token, message: impl Into<String>) -> ParseError {
        ParseError {
            line: token.span.line,
            column: token.span.column,
            message: message.into(),
        }
    }

    fn expect_peek(&mut self, expecting: &str) -> Result<Token, ParseError> {
        match self.lexer.peek()? {
            Some(token) => Ok(token),
            None => Err(self
                .lexer
                .error_here(format!("Expected {expecting} but reached end of file"))),
        }
    }

    fn expect_next(&mut self, expecting: &str) -> Result<Token, ParseError> {
        match self.lexer.next()? {
            Some(token) => Ok(token),
            None => Err(self
                .lexer
                .error_here(format!("Expected {expecting} but reached end of file"))),
        }
    }

    fn expect_next_to_be(&mut self, kind: TokenKind) -> Result<Token, ParseError> {
        let token = self.expect_next(&format!("{kind:?}"))?;

        if token.kind != kind {
            return Err(self.error_at(
                token,
                format!(
                    "Expected {:?} but found {:?} ({})",
                    kind,
                    token.kind,
                    self.lexer.value_of_span(token.span)
                ),
            ));
        }

        Ok(token)
    }

    fn expect_keyword(&mut self, keyword: Keyword) -> Result<Token, ParseError> {
        self.expect_next_to_be(TokenKind::Keyword(keyword))
    }

    fn next_is(&mut self, kind: TokenKind) -> Result<bool, ParseError> {
        Ok(self.lexer.peek()?.is_some_and(|token| token.kind == kind))
    }

    /// Consumes the next token if it has the given kind
    fn eat(&mut self, kind: TokenKind) -> Result<bool, ParseError> {
        let matches = self.next_is(kind)?;

        if matches {
            self.lexer.next()?;
        }

        Ok(matches)
    }

    fn parse_register(&mut self) -> Result<RegisterId, ParseError> {
        let token = self.expect_next_to_be(TokenKind::Register)?;
        let digits = &self.lexer.value_of_span(token.span)[1..];

        digits
            .parse::<usize>()
            .map(RegisterId::new)
            .map_err(|_| self.error_at(token, format!("Invalid register `%{digits}`")))
    }

    fn parse_integer(&mut self) -> Result<i64, ParseError> {
        let token = self.expect_next_to_be(TokenKind::IntegerLiteral)?;
        let value = self.lexer.value_of_span(token.span);

        value
            .parse()
            .map_err(|_| self.error_at(token, format!("Integer literal `{value}` out of range")))
    }

    /// fn name(%0, %1) { blocks }
    fn parse_function(&mut self) -> Result<Function, ParseError> {
        self.expect_keyword(Keyword::Fn)?;

        let name = self.expect_next_to_be(TokenKind::Identifier)?;
        let name = self.lexer.value_of_span(name.span).to_owned();

        self.expect_next_to_be(TokenKind::OpenParen)?;

        let mut arguments = Vec::new();

        if !self.eat(TokenKind::CloseParen)? {
            loop {
                arguments.push(self.parse_register()?);

                if self.eat(TokenKind::CloseParen)? {
                    break;
                }

                self.expect_next_to_be(TokenKind::Comma)?;
            }
        }

        let mut scope = FunctionScope {
            function: Function::new(name, arguments),
            blocks: HashMap::new(),
            defined: Vec::new(),
            first_reference: HashMap::new(),
        };

        self.expect_next_to_be(TokenKind::OpenBrace)?;

        let mut current = None;

        loop {
            let token = self.expect_peek("block label, instruction, or close brace")?;

            if token.kind == TokenKind::CloseBrace {
                self.lexer.next()?;
                break;
            }

            let is_label = token.kind == TokenKind::Identifier
                && self
                    .lexer
                    .peek_nth(1)?
                    .is_some_and(|next| next.kind == TokenKind::Colon);

            if is_label {
                current = Some(self.parse_block_label(&mut scope)?);
                continue;
            }

            let Some(block) = current else {
                return Err(self.error_at(token, "Expected block label before first instruction"));
            };

            let instruction = self.parse_instruction(&mut scope)?;

            if let Some(destination) = instruction.destination() {
                scope.function.reserve_register(destination);
            }

            scope.function.push_instruction(block, instruction);
        }

        for (block, token) in &scope.first_reference {
            if !scope.defined.contains(block) {
                return Err(self.error_at(
                    *token,
                    format!(
                        "Reference to undefined block `{}`",
                        scope.function.block_name(*block)
                    ),
                ));
            }
        }

        let mut function = scope.function;
        function.layout = scope.defined;

        for argument in function.arguments.clone() {
            function.reserve_register(argument);
        }

        Ok(function)
    }

    fn parse_block_label(&mut self, scope: &mut FunctionScope) -> Result<BlockId, ParseError> {
        let token = self.expect_next_to_be(TokenKind::Identifier)?;
        self.expect_next_to_be(TokenKind::Colon)?;

        let block = scope.block(self.lexer.value_of_span(token.span));

        if scope.defined.contains(&block) {
            return Err(self.error_at(
                token,
                format!("Block `{}` defined twice", scope.function.block_name(block)),
            ));
        }

        scope.defined.push(block);
        Ok(block)
    }

    fn parse_block_reference(&mut self, scope: &mut FunctionScope) -> Result<BlockId, ParseError> {
        let token = self.expect_next_to_be(TokenKind::Identifier)?;
        let block = scope.block(self.lexer.value_of_span(token.span));

        scope.first_reference.entry(block).or_insert(token);

        Ok(block)
    }

    fn parse_instruction(&mut self, scope: &mut FunctionScope) -> Result<Instruction, ParseError> {
        let token = self.expect_peek("instruction")?;

        match token.kind {
            TokenKind::Register => {
                let destination = self.parse_register()?;
                self.expect_next_to_be(TokenKind::Equals)?;

                let token = self.expect_peek("phi, call, or opcode")?;

                match token.kind {
                    TokenKind::Keyword(Keyword::Phi) => self.parse_phi(scope, destination),
                    TokenKind::Keyword(Keyword::Call) => self.parse_call(scope, Some(destination)),
                    _ => self.parse_operation(scope, Some(destination)),
                }
            }
            TokenKind::Keyword(Keyword::Call) => self.parse_call(scope, None),
            TokenKind::Keyword(Keyword::Jmp) => {
                self.lexer.next()?;

                Ok(Instruction::Jump {
                    destination: self.parse_block_reference(scope)?,
                })
            }
            TokenKind::Keyword(Keyword::Br) => {
                self.lexer.next()?;

                let condition = self.parse_operand(scope)?;
                self.expect_next_to_be(TokenKind::Comma)?;
                let positive = self.parse_block_reference(scope)?;
                self.expect_next_to_be(TokenKind::Comma)?;
                let negative = self.parse_block_reference(scope)?;

                Ok(Instruction::Branch {
                    condition,
                    positive,
                    negative,
                })
            }
            TokenKind::Keyword(Keyword::Switch) => self.parse_switch(scope),
            TokenKind::Keyword(Keyword::Ret) => {
                self.lexer.next()?;

                let starts_operand = self
                    .lexer
                    .peek()?
                    .is_some_and(|token| token.kind.starts_operand());

                let value = if starts_operand {
                    Some(self.parse_operand(scope)?)
                } else {
                    None
                };

                Ok(Instruction::Return { value })
            }
            TokenKind::Keyword(Keyword::Unreachable) => {
                self.lexer.next()?;
                Ok(Instruction::Unreachable)
            }
            TokenKind::Identifier => self.parse_operation(scope, None),
            _ => Err(self.error_at(
                token,
                format!(
                    "Expected instruction but found {:?} ({})",
                    token.kind,
                    self.lexer.value_of_span(token.span)
                ),
            )),
        }
    }

    /// phi(block -> operand, ...)
    fn parse_phi(
        &mut self,
        scope: &mut FunctionScope,
        destination: RegisterId,
    ) -> Result<Instruction, ParseError> {
        self.expect_keyword(Keyword::Phi)?;
        self.expect_next_to_be(TokenKind::OpenParen)?;

        let mut sources = Vec::new();

        if !self.eat(TokenKind::CloseParen)? {
            loop {
                let block = self.parse_block_reference(scope)?;
                self.expect_next_to_be(TokenKind::Arrow)?;
                let value = self.parse_operand(scope)?;

                sources.push((block, value));

                if self.eat(TokenKind::CloseParen)? {
                    break;
                }

                self.expect_next_to_be(TokenKind::Comma)?;
            }
        }

        Ok(Instruction::Phi {
            destination,
            sources,
        })
    }

    /// call @name(operand, ...)
    fn parse_call(
        &mut self,
        scope: &mut FunctionScope,
        destination: Option<RegisterId>,
    ) -> Result<Instruction, ParseError> {
        self.expect_keyword(Keyword::Call)?;

        let callee = self.expect_next_to_be(TokenKind::Global)?;
        let callee = self.lexer.value_of_span(callee.span)[1..].to_owned();

        self.expect_next_to_be(TokenKind::OpenParen)?;

        let mut arguments = Vec::new();

        if !self.eat(TokenKind::CloseParen)? {
            loop {
                arguments.push(self.parse_operand(scope)?);

                if self.eat(TokenKind::CloseParen)? {
                    break;
                }

                self.expect_next_to_be(TokenKind::Comma)?;
            }
        }

        Ok(Instruction::Call {
            callee,
            arguments,
            destination,
        })
    }

    /// opcode operand, ...
    fn parse_operation(
        &mut self,
        scope: &mut FunctionScope,
        destination: Option<RegisterId>,
    ) -> Result<Instruction, ParseError> {
        let token = self.expect_next_to_be(TokenKind::Identifier)?;
        let name = self.lexer.value_of_span(token.span);

        let opcode: Opcode = name
            .parse()
            .map_err(|_| self.error_at(token, format!("Unknown opcode `{name}`")))?;

        let mut operands = Vec::new();

        let starts_operand = self
            .lexer
            .peek()?
            .is_some_and(|token| token.kind.starts_operand());

        if starts_operand {
            loop {
                operands.push(self.parse_operand(scope)?);

                if !self.eat(TokenKind::Comma)? {
                    break;
                }
            }
        }

        Ok(Instruction::Operation {
            opcode,
            destination,
            operands,
        })
    }

    /// switch operand, default, [value: block, ...]
    fn parse_switch(&mut self, scope: &mut FunctionScope) -> Result<Instruction, ParseError> {
        self.expect_keyword(Keyword::Switch)?;

        let condition = self.parse_operand(scope)?;
        self.expect_next_to_be(TokenKind::Comma)?;
        let default = self.parse_block_reference(scope)?;
        self.expect_next_to_be(TokenKind::Comma)?;
        self.expect_next_to_be(TokenKind::OpenBracket)?;

        let mut cases = Vec::new();

        if !self.eat(TokenKind::CloseBracket)? {
            loop {
                let value = self.parse_integer()?;
                self.expect_next_to_be(TokenKind::Colon)?;
                let target = self.parse_block_reference(scope)?;

                cases.push((value, target));

                if self.eat(TokenKind::CloseBracket)? {
                    break;
                }

                self.expect_next_to_be(TokenKind::Comma)?;
            }
        }

        Ok(Instruction::Switch {
            condition,
            default,
            cases,
        })
    }

    fn parse_operand(&mut self, scope: &mut FunctionScope) -> Result<Operand, ParseError> {
        let token = self.expect_peek("operand")?;

        match token.kind {
            TokenKind::Register => Ok(Operand::Register(self.parse_register()?)),
            TokenKind::IntegerLiteral => {
                Ok(Operand::Immediate(Immediate::Int(self.parse_integer()?)))
            }
            TokenKind::BooleanLiteral => {
                self.lexer.next()?;
                let value = self.lexer.value_of_span(token.span) == "true";
                Ok(Operand::Immediate(Immediate::Bool(value)))
            }
            TokenKind::Keyword(Keyword::Undef) => {
                self.lexer.next()?;
                Ok(Operand::UNDEF)
            }
            TokenKind::Keyword(Keyword::Label) => {
                self.lexer.next()?;
                Ok(Operand::Label(self.parse_block_reference(scope)?))
            }
            _ => Err(self.error_at(
                token,
                format!(
                    "Expected operand but found {:?} ({})",
                    token.kind,
                    self.lexer.value_of_span(token.span)
                ),
            )),
        }
    }
}

impl FunctionScope {
    fn block(&mut self, name: &str) -> BlockId {
        if let Some(block) = self.blocks.get(name) {
            return *block;
        }

        let block = self.function.create_block(name);
        self.blocks.insert(name.to_owned(), block);
        block
    }
}

#[cfg(test)]
mod tests {
    use indoc::indoc;
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn parses_blocks_in_definition_order() {
        let module = Parser::parse_module(indoc! {"
            fn select(%0) {
            entry:
                br %0, then, done
            done:
                %2 = phi(entry -> 0, then -> %1)
                ret %2
            then:
                %1 = add %0, 1
                jmp done
            }
        "})
        .unwrap();

        let function = &module.functions[0];
        let names = function
            .layout
            .iter()
            .map(|block| function.block_name(*block))
            .collect::<Vec<_>>();

        assert_eq!(names, vec!["entry", "done", "then"]);

        let done = function.block_by_name("done").unwrap();
        let then = function.block_by_name("then").unwrap();
        let entry = function.block_by_name("entry").unwrap();

        assert_eq!(
            function.instruction(function.phis(done)[0]),
            &Instruction::Phi {
                destination: RegisterId::new(2),
                sources: vec![
                    (entry, Operand::Immediate(Immediate::Int(0))),
                    (then, Operand::Register(RegisterId::new(1))),
                ],
            }
        );
    }

    #[test]
    fn parses_switch_and_calls() {
        let module = Parser::parse_module(indoc! {"
            fn dispatch(%0) {
            entry:
                call @cfg.selection_merge(label exit)
                switch %0, exit, [1: exit, -2: exit]
            exit:
                %1 = call @compute(%0, true, undef)
                store %0, %1
                ret
            }
        "})
        .unwrap();

        let function = &module.functions[0];
        let entry = function.block_by_name("entry").unwrap();
        let exit = function.block_by_name("exit").unwrap();

        assert_eq!(function.predecessors(exit), vec![entry, entry, entry]);
        assert_eq!(function.block(exit).instructions.len(), 3);
    }

    #[test]
    fn fresh_registers_follow_parsed_ones() {
        let mut module = Parser::parse_module(indoc! {"
            fn f(%4) {
            entry:
                %7 = add %4, 1
                ret %7
            }
        "})
        .unwrap();

        assert_eq!(module.functions[0].create_register(), RegisterId::new(8));
    }

    #[test]
    fn rejects_undefined_blocks() {
        let error = Parser::parse_module(indoc! {"
            fn f() {
            entry:
                jmp nowhere
            }
        "})
        .unwrap_err();

        assert_eq!(error.line, 3);
        assert!(error.message.contains("nowhere"));
    }

    #[test]
    fn rejects_unknown_opcodes() {
        let error = Parser::parse_module("fn f() { entry: %0 = frobnicate 1 ret }").unwrap_err();

        assert!(error.message.contains("frobnicate"));
    }
}
