use crate::frontend::lexer::{Span, Spanned};
use crate::frontend::parser_error::ParserError;
use crate::frontend::token::Token;
use crate::lang::ast::{BinaryOp, Expr, ExprKind, LogicalOp, Program, Stmt, StmtKind, UnaryOp};

const I64_MIN_MAGNITUDE: u64 = 1 << 63;

/// Recursive-descent parser with Pratt-style binary expressions.
///
/// Statements are separated by newlines or `;`. Newlines are insignificant
/// after an operator, an opening delimiter or a comma, so long expressions
/// and literals can span lines.
pub struct Parser {
    tokens: Vec<Spanned>,
    pos: usize,
    /// Span of the most recently consumed token.
    ///
    /// Used to provide stable source locations for errors that occur at
    /// end-of-file.
    last_span: Option<Span>,
}

impl Parser {
    /// Creates a new parser from lexer output. Comments are dropped here;
    /// newlines are kept as statement separators.
    pub fn new(tokens: Vec<Spanned>) -> Self {
        let tokens: Vec<Spanned> = tokens
            .into_iter()
            .filter(|t| !matches!(t.token, Token::Comment(_)))
            .collect();
        Parser {
            tokens,
            pos: 0,
            last_span: None,
        }
    }

    fn current(&self) -> Option<&Spanned> {
        self.tokens.get(self.pos)
    }

    fn advance(&mut self) -> Option<&Spanned> {
        let token = self.tokens.get(self.pos);
        if let Some(s) = token {
            self.last_span = Some(s.span);
        }
        self.pos += 1;
        token
    }

    fn peek(&self) -> &Token {
        self.tokens.get(self.pos).map(|s| &s.token).unwrap_or(&Token::Eof)
    }

    fn peek_next(&self) -> &Token {
        self.tokens.get(self.pos + 1).map(|s| &s.token).unwrap_or(&Token::Eof)
    }

    fn span(&self) -> Span {
        match self.current() {
            Some(s) => s.span,
            None => self.last_span.unwrap_or(Span { line: 1, col: 1 }),
        }
    }

    /// Constructs a `ParserError` at the most relevant location: the current
    /// token, or the last consumed one when input has run out.
    fn error(&self, message: &str) -> ParserError {
        let span = match self.current() {
            Some(s) if !matches!(s.token, Token::Eof) => s.span,
            _ => self.last_span.unwrap_or(Span { line: 1, col: 1 }),
        };
        ParserError {
            message: message.to_string(),
            line: span.line,
            col: span.col,
        }
    }

    fn check(&self, token: &Token) -> bool {
        self.peek() == token
    }

    fn eat(&mut self, token: &Token) -> bool {
        if self.check(token) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn expect(&mut self, token: Token, context: &str) -> Result<(), ParserError> {
        if self.eat(&token) {
            Ok(())
        } else {
            Err(self.error(&format!("expected '{}' {}, found {}", token, context, self.describe_current())))
        }
    }

    fn expect_ident(&mut self, context: &str) -> Result<String, ParserError> {
        match self.peek().clone() {
            Token::Ident(name) => {
                self.advance();
                Ok(name)
            }
            _ => Err(self.error(&format!("expected identifier {}, found {}", context, self.describe_current()))),
        }
    }

    fn describe_current(&self) -> String {
        match self.peek() {
            Token::Eof => "end of input".to_string(),
            Token::Newline => "newline".to_string(),
            other => format!("'{}'", other),
        }
    }

    fn skip_newlines(&mut self) {
        while self.check(&Token::Newline) {
            self.advance();
        }
    }

    fn skip_separators(&mut self) {
        while matches!(self.peek(), Token::Newline | Token::Semicolon) {
            self.advance();
        }
    }

    /// Parses a complete chunk until `Token::Eof`.
    pub fn parse(&mut self) -> Result<Program, ParserError> {
        let mut statements = Vec::new();
        loop {
            self.skip_separators();
            if self.check(&Token::Eof) || self.current().is_none() {
                break;
            }
            statements.push(self.parse_statement()?);
            self.end_statement()?;
        }
        Ok(Program { statements })
    }

    fn end_statement(&mut self) -> Result<(), ParserError> {
        match self.peek() {
            Token::Newline | Token::Semicolon => {
                self.advance();
                Ok(())
            }
            Token::RBrace | Token::Eof => Ok(()),
            _ => Err(self.error(&format!(
                "expected newline or ';' after statement, found {}",
                self.describe_current()
            ))),
        }
    }

    fn parse_block(&mut self) -> Result<Vec<Stmt>, ParserError> {
        self.expect(Token::LBrace, "to open block")?;
        let mut statements = Vec::new();
        loop {
            self.skip_separators();
            match self.peek() {
                Token::RBrace => {
                    self.advance();
                    return Ok(statements);
                }
                Token::Eof => return Err(self.error("expected '}' to close block")),
                _ => {
                    statements.push(self.parse_statement()?);
                    self.end_statement()?;
                }
            }
        }
    }

    fn parse_statement(&mut self) -> Result<Stmt, ParserError> {
        let span = self.span();
        let kind = match self.peek() {
            Token::Var => {
                self.advance();
                let name = self.expect_ident("after 'var'")?;
                self.expect(Token::Assign, "in variable declaration")?;
                self.skip_newlines();
                let value = self.parse_expr()?;
                StmtKind::Var { name, value }
            }
            Token::Func if matches!(self.peek_next(), Token::Ident(_)) => {
                self.advance();
                let name = self.expect_ident("after 'func'")?;
                let params = self.parse_params()?;
                let body = self.parse_block()?;
                StmtKind::FuncDef { name, params, body }
            }
            Token::Return => {
                self.advance();
                if self.peek().is_terminator() {
                    StmtKind::Return(None)
                } else {
                    StmtKind::Return(Some(self.parse_expr()?))
                }
            }
            Token::If => return self.parse_if(),
            Token::While => {
                self.advance();
                let cond = self.parse_expr()?;
                let body = self.parse_block()?;
                StmtKind::While { cond, body }
            }
            Token::Break => {
                self.advance();
                StmtKind::Break
            }
            Token::Continue => {
                self.advance();
                StmtKind::Continue
            }
            Token::Print => {
                self.advance();
                StmtKind::Print(self.parse_expr()?)
            }
            Token::Del => {
                self.advance();
                let target = self.parse_expr()?;
                match target.kind {
                    ExprKind::Index { object, index } => StmtKind::Del {
                        object: *object,
                        key: *index,
                    },
                    _ => return Err(self.error("'del' expects a subscript expression such as m[key]")),
                }
            }
            Token::Ident(_) if matches!(self.peek_next(), Token::Declare) => {
                let name = self.expect_ident("in declaration")?;
                self.advance();
                self.skip_newlines();
                let value = self.parse_expr()?;
                StmtKind::Var { name, value }
            }
            _ => {
                let expr = self.parse_expr()?;
                if self.check(&Token::Assign) {
                    if !expr.is_assignable() {
                        return Err(self.error("invalid assignment target"));
                    }
                    self.advance();
                    self.skip_newlines();
                    let value = self.parse_expr()?;
                    StmtKind::Assign { target: expr, value }
                } else {
                    StmtKind::Expr(expr)
                }
            }
        };
        Ok(Stmt::new(kind, span))
    }

    fn parse_if(&mut self) -> Result<Stmt, ParserError> {
        let span = self.span();
        self.expect(Token::If, "")?;
        let cond = self.parse_expr()?;
        let then_body = self.parse_block()?;
        let else_body = if self.eat(&Token::Else) {
            if self.check(&Token::If) {
                Some(vec![self.parse_if()?])
            } else {
                Some(self.parse_block()?)
            }
        } else {
            None
        };
        Ok(Stmt::new(
            StmtKind::If {
                cond,
                then_body,
                else_body,
            },
            span,
        ))
    }

    fn parse_params(&mut self) -> Result<Vec<String>, ParserError> {
        self.expect(Token::LParen, "to open parameter list")?;
        let mut params = Vec::new();
        self.skip_newlines();
        while !self.check(&Token::RParen) {
            let name = self.expect_ident("in parameter list")?;
            if params.contains(&name) {
                return Err(self.error(&format!("duplicate parameter '{}'", name)));
            }
            params.push(name);
            self.skip_newlines();
            if !self.eat(&Token::Comma) {
                break;
            }
            self.skip_newlines();
        }
        self.expect(Token::RParen, "to close parameter list")?;
        Ok(params)
    }

    // Expressions

    pub fn parse_expr(&mut self) -> Result<Expr, ParserError> {
        self.parse_binary(1)
    }

    fn infix(token: &Token) -> Option<(u8, Infix)> {
        use Infix::*;
        Some(match token {
            Token::OrOr => (1, Logical(LogicalOp::Or)),
            Token::AndAnd => (2, Logical(LogicalOp::And)),
            Token::EqEq => (3, Binary(BinaryOp::Eq)),
            Token::NotEq => (3, Binary(BinaryOp::NotEq)),
            Token::Lt => (4, Binary(BinaryOp::Lt)),
            Token::LtEq => (4, Binary(BinaryOp::LtEq)),
            Token::Gt => (4, Binary(BinaryOp::Gt)),
            Token::GtEq => (4, Binary(BinaryOp::GtEq)),
            Token::Pipe => (5, Binary(BinaryOp::BitOr)),
            Token::Caret => (6, Binary(BinaryOp::BitXor)),
            Token::Amp => (7, Binary(BinaryOp::BitAnd)),
            Token::Shl => (8, Binary(BinaryOp::Shl)),
            Token::Shr => (8, Binary(BinaryOp::Shr)),
            Token::Plus => (9, Binary(BinaryOp::Add)),
            Token::Minus => (9, Binary(BinaryOp::Sub)),
            Token::Star => (10, Binary(BinaryOp::Mul)),
            Token::Slash => (10, Binary(BinaryOp::Div)),
            Token::Percent => (10, Binary(BinaryOp::Mod)),
            _ => return None,
        })
    }

    fn parse_binary(&mut self, min_bp: u8) -> Result<Expr, ParserError> {
        let mut left = self.parse_unary()?;
        while let Some((bp, infix)) = Self::infix(self.peek()) {
            if bp < min_bp {
                break;
            }
            let span = self.span();
            self.advance();
            self.skip_newlines();
            let right = Box::new(self.parse_binary(bp + 1)?);
            let left_box = Box::new(left);
            let kind = match infix {
                Infix::Binary(op) => ExprKind::Binary {
                    op,
                    left: left_box,
                    right,
                },
                Infix::Logical(op) => ExprKind::Logical {
                    op,
                    left: left_box,
                    right,
                },
            };
            left = Expr::new(kind, span);
        }
        Ok(left)
    }

    fn parse_unary(&mut self) -> Result<Expr, ParserError> {
        let span = self.span();
        let op = match self.peek() {
            Token::Minus => UnaryOp::Neg,
            Token::Plus => UnaryOp::Plus,
            Token::Bang => UnaryOp::Not,
            Token::Tilde => UnaryOp::Invert,
            _ => return self.parse_power(),
        };
        self.advance();
        // `-9223372036854775808` is the one literal whose magnitude is not an i64.
        if op == UnaryOp::Neg && *self.peek() == Token::Integer(I64_MIN_MAGNITUDE) && *self.peek_next() != Token::StarStar {
            self.advance();
            return Ok(Expr::new(ExprKind::Int(i64::MIN), span));
        }
        let operand = Box::new(self.parse_unary()?);
        Ok(Expr::new(ExprKind::Unary { op, operand }, span))
    }

    fn parse_power(&mut self) -> Result<Expr, ParserError> {
        let base = self.parse_postfix()?;
        if self.check(&Token::StarStar) {
            let span = self.span();
            self.advance();
            self.skip_newlines();
            // right-associative, and `2 ** -1` is allowed
            let exponent = self.parse_unary()?;
            return Ok(Expr::new(
                ExprKind::Binary {
                    op: BinaryOp::Pow,
                    left: Box::new(base),
                    right: Box::new(exponent),
                },
                span,
            ));
        }
        Ok(base)
    }

    fn parse_postfix(&mut self) -> Result<Expr, ParserError> {
        let mut expr = self.parse_primary()?;
        loop {
            let span = self.span();
            match self.peek() {
                Token::LParen => {
                    self.advance();
                    let args = self.parse_expr_list(Token::RParen, "to close argument list")?;
                    expr = Expr::new(
                        ExprKind::Call {
                            callee: Box::new(expr),
                            args,
                        },
                        span,
                    );
                }
                Token::LBracket => {
                    self.advance();
                    self.skip_newlines();
                    let index = self.parse_expr()?;
                    self.skip_newlines();
                    self.expect(Token::RBracket, "to close subscript")?;
                    expr = Expr::new(
                        ExprKind::Index {
                            object: Box::new(expr),
                            index: Box::new(index),
                        },
                        span,
                    );
                }
                Token::Dot => {
                    self.advance();
                    let name = self.expect_ident("after '.'")?;
                    expr = Expr::new(
                        ExprKind::Attr {
                            object: Box::new(expr),
                            name,
                        },
                        span,
                    );
                }
                _ => return Ok(expr),
            }
        }
    }

    /// Comma-separated expressions up to `close`; the opening delimiter is
    /// already consumed. A trailing comma is allowed.
    fn parse_expr_list(&mut self, close: Token, context: &str) -> Result<Vec<Expr>, ParserError> {
        let mut items = Vec::new();
        self.skip_newlines();
        while !self.check(&close) {
            items.push(self.parse_expr()?);
            self.skip_newlines();
            if !self.eat(&Token::Comma) {
                break;
            }
            self.skip_newlines();
        }
        self.expect(close, context)?;
        Ok(items)
    }

    fn parse_primary(&mut self) -> Result<Expr, ParserError> {
        let span = self.span();
        let kind = match self.peek().clone() {
            Token::Integer(n) => {
                let n = i64::try_from(n).map_err(|_| self.error(&format!("integer literal {} is too large", n)))?;
                self.advance();
                ExprKind::Int(n)
            }
            Token::Float(n) => {
                self.advance();
                ExprKind::Float(n)
            }
            Token::String(s) => {
                self.advance();
                ExprKind::Str(s)
            }
            Token::True => {
                self.advance();
                ExprKind::Bool(true)
            }
            Token::False => {
                self.advance();
                ExprKind::Bool(false)
            }
            Token::Nil => {
                self.advance();
                ExprKind::Nil
            }
            Token::Ident(name) => {
                self.advance();
                ExprKind::Ident(name)
            }
            Token::LParen => {
                self.advance();
                self.skip_newlines();
                let inner = self.parse_expr()?;
                self.skip_newlines();
                self.expect(Token::RParen, "to close parenthesized expression")?;
                return Ok(inner);
            }
            Token::LBracket => {
                self.advance();
                ExprKind::List(self.parse_expr_list(Token::RBracket, "to close list literal")?)
            }
            Token::LBrace => {
                self.advance();
                self.parse_brace_literal()?
            }
            Token::Func => {
                self.advance();
                let params = self.parse_params()?;
                let body = self.parse_block()?;
                ExprKind::Func { params, body }
            }
            _ => {
                return Err(self.error(&format!("unexpected {}", self.describe_current())));
            }
        };
        Ok(Expr::new(kind, span))
    }

    /// `{}` is an empty map; `{k: v, ...}` a map; `{a, b}` a set.
    fn parse_brace_literal(&mut self) -> Result<ExprKind, ParserError> {
        self.skip_newlines();
        if self.eat(&Token::RBrace) {
            return Ok(ExprKind::Map(Vec::new()));
        }

        let first = self.parse_expr()?;
        self.skip_newlines();
        if !self.eat(&Token::Colon) {
            let mut items = vec![first];
            if self.eat(&Token::Comma) {
                items.extend(self.parse_expr_list(Token::RBrace, "to close set literal")?);
            } else {
                self.expect(Token::RBrace, "to close set literal")?;
            }
            return Ok(ExprKind::Set(items));
        }

        self.skip_newlines();
        let mut entries = vec![(first, self.parse_expr()?)];
        self.skip_newlines();
        while self.eat(&Token::Comma) {
            self.skip_newlines();
            if self.check(&Token::RBrace) {
                break;
            }
            let key = self.parse_expr()?;
            self.skip_newlines();
            self.expect(Token::Colon, "between map key and value")?;
            self.skip_newlines();
            entries.push((key, self.parse_expr()?));
            self.skip_newlines();
        }
        self.expect(Token::RBrace, "to close map literal")?;
        Ok(ExprKind::Map(entries))
    }
}

#[derive(Debug, Clone, Copy)]
enum Infix {
    Binary(BinaryOp),
    Logical(LogicalOp),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frontend::lexer::Lexer;

    fn parse(source: &str) -> Program {
        let tokens = Lexer::new(source).tokenize().unwrap();
        Parser::new(tokens).parse().unwrap()
    }

    fn parse_err(source: &str) -> ParserError {
        let tokens = Lexer::new(source).tokenize().unwrap();
        Parser::new(tokens).parse().unwrap_err()
    }

    fn expr(source: &str) -> ExprKind {
        let program = parse(source);
        match program.statements.into_iter().next().map(|s| s.kind) {
            Some(StmtKind::Expr(e)) => e.kind,
            other => panic!("expected expression statement, got {:?}", other),
        }
    }

    fn binary_op(kind: &ExprKind) -> BinaryOp {
        match kind {
            ExprKind::Binary { op, .. } => *op,
            other => panic!("expected binary, got {:?}", other),
        }
    }

    #[test]
    fn test_statements_split_by_newline_and_semicolon() {
        let program = parse("x := 1; y := 2\nprint x + y");
        assert_eq!(program.statements.len(), 3);
        assert!(matches!(program.statements[2].kind, StmtKind::Print(_)));
    }

    #[test]
    fn test_precedence_mul_over_add() {
        let ExprKind::Binary { op, right, .. } = expr("1 + 2 * 3") else {
            panic!("expected binary");
        };
        assert_eq!(op, BinaryOp::Add);
        assert_eq!(binary_op(&right.kind), BinaryOp::Mul);
    }

    #[test]
    fn test_left_associative_subtraction() {
        let ExprKind::Binary { left, .. } = expr("10 - 3 - 2") else {
            panic!("expected binary");
        };
        assert_eq!(binary_op(&left.kind), BinaryOp::Sub);
    }

    #[test]
    fn test_power_is_right_associative_and_binds_over_unary() {
        let ExprKind::Unary { op, operand } = expr("-2 ** 3 ** 2") else {
            panic!("expected unary");
        };
        assert_eq!(op, UnaryOp::Neg);
        let ExprKind::Binary { right, .. } = operand.kind else {
            panic!("expected power");
        };
        assert_eq!(binary_op(&right.kind), BinaryOp::Pow);
    }

    #[test]
    fn test_logical_lowest() {
        assert!(matches!(
            expr("a == 1 || b < 2 && c"),
            ExprKind::Logical { op: LogicalOp::Or, .. }
        ));
    }

    #[test]
    fn test_postfix_chain() {
        let ExprKind::Call { callee, args } = expr("math.max(xs[0], 2)") else {
            panic!("expected call");
        };
        assert_eq!(args.len(), 2);
        assert!(matches!(callee.kind, ExprKind::Attr { ref name, .. } if name == "max"));
    }

    #[test]
    fn test_collection_literals() {
        assert!(matches!(expr("{}"), ExprKind::Map(ref e) if e.is_empty()));
        assert!(matches!(expr(r#"{"a": 1, "b": 2,}"#), ExprKind::Map(ref e) if e.len() == 2));
        assert!(matches!(expr("{1, 2, 3}"), ExprKind::Set(ref s) if s.len() == 3));
        assert!(matches!(expr("[1,\n 2,\n]"), ExprKind::List(ref l) if l.len() == 2));
    }

    #[test]
    fn test_func_definition_and_literal() {
        let program = parse("func add(a, b) {\n  return a + b\n}\nf := func() { return }");
        match &program.statements[0].kind {
            StmtKind::FuncDef { name, params, body } => {
                assert_eq!(name, "add");
                assert_eq!(params, &["a".to_string(), "b".to_string()]);
                assert_eq!(body.len(), 1);
            }
            other => panic!("expected func def, got {:?}", other),
        }
        assert!(matches!(
            &program.statements[1].kind,
            StmtKind::Var { value: Expr { kind: ExprKind::Func { .. }, .. }, .. }
        ));
    }

    #[test]
    fn test_if_else_if_chain() {
        let program = parse("if a { x = 1 } else if b { x = 2 } else { x = 3 }");
        let StmtKind::If { else_body: Some(else_body), .. } = &program.statements[0].kind else {
            panic!("expected if");
        };
        assert!(matches!(else_body[0].kind, StmtKind::If { else_body: Some(_), .. }));
    }

    #[test]
    fn test_assignment_targets() {
        let program = parse("xs[0] = 1\nm.key = 2\nx = 3");
        assert!(program
            .statements
            .iter()
            .all(|s| matches!(s.kind, StmtKind::Assign { .. })));
    }

    #[test]
    fn test_del_statement() {
        let program = parse("del m[\"k\"]");
        assert!(matches!(program.statements[0].kind, StmtKind::Del { .. }));
    }

    #[test]
    fn test_invalid_assignment_target() {
        let err = parse_err("1 + 2 = 3");
        assert!(err.message.contains("invalid assignment target"));
    }

    #[test]
    fn test_del_requires_subscript() {
        assert!(parse_err("del x").message.contains("subscript"));
    }

    #[test]
    fn test_missing_close_brace_reports_last_token() {
        let err = parse_err("func f() {\n  return 1\n");
        assert!(err.message.contains("'}'"));
        assert_eq!(err.line, 2);
    }

    #[test]
    fn test_two_expressions_on_one_line() {
        let err = parse_err("x y");
        assert!(err.message.contains("expected newline or ';'"));
        assert_eq!((err.line, err.col), (1, 3));
    }

    #[test]
    fn test_unexpected_token_position() {
        let err = parse_err("x = )");
        assert_eq!((err.line, err.col), (1, 5));
        assert!(err.message.contains("unexpected ')'"));
    }

    #[test]
    fn test_duplicate_parameter() {
        assert!(parse_err("func f(a, a) {}").message.contains("duplicate parameter"));
    }

    #[test]
    fn test_most_negative_integer_literal() {
        assert_eq!(expr("-9223372036854775808"), ExprKind::Int(i64::MIN));
        assert!(matches!(expr("-9223372036854775807"), ExprKind::Unary { op: UnaryOp::Neg, .. }));
    }

    #[test]
    fn test_integer_literal_out_of_range() {
        let err = parse_err("x := 9223372036854775808");
        assert!(err.message.contains("integer literal 9223372036854775808 is too large"));
        assert_eq!((err.line, err.col), (1, 6));
        assert!(parse_err("0xffffffffffffffff").message.contains("too large"));
    }
}
