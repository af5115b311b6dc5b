use thiserror::Error;

use crate::frontend::token::Token;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Span {
    pub line: usize,
    pub col: usize,
}

#[derive(Debug, Clone)]
pub struct Spanned {
    pub token: Token,
    pub span: Span,
}

#[derive(Debug, Clone, Error)]
#[error("{line}:{col}: {message}")]
pub struct LexerError {
    pub message: String,
    pub line: usize,
    pub col: usize,
}

pub struct Lexer {
    source: Vec<char>,
    pos: usize,
    line: usize,
    col: usize,
}

impl Lexer {
    pub fn new(source: &str) -> Self {
        Lexer {
            source: source.chars().collect(),
            pos: 0,
            line: 1,
            col: 1,
        }
    }

    fn current(&self) -> Option<char> {
        self.source.get(self.pos).copied()
    }

    fn peek(&self) -> Option<char> {
        self.source.get(self.pos + 1).copied()
    }

    fn advance(&mut self) -> Option<char> {
        let ch = self.current();
        if ch == Some('\n') {
            self.line += 1;
            self.col = 1;
        } else {
            self.col += 1;
        }
        self.pos += 1;
        ch
    }

    fn span(&self) -> Span {
        Span {
            line: self.line,
            col: self.col,
        }
    }

    fn error(&self, message: impl Into<String>, line: usize, col: usize) -> LexerError {
        LexerError {
            message: message.into(),
            line,
            col,
        }
    }

    fn skip_whitespace(&mut self) {
        while let Some(ch) = self.current() {
            if ch == ' ' || ch == '\t' || ch == '\r' {
                self.advance();
            } else {
                break;
            }
        }
    }

    fn read_comment(&mut self) -> Token {
        self.advance();
        self.advance();
        let mut comment = String::new();
        while let Some(ch) = self.current() {
            if ch == '\n' {
                break;
            }
            comment.push(ch);
            self.advance();
        }
        Token::Comment(comment.trim().to_string())
    }

    fn read_string(&mut self) -> Result<Token, LexerError> {
        let start_line = self.line;
        let start_col = self.col;
        self.advance();

        let mut string = String::new();
        loop {
            match self.current() {
                Some('"') => {
                    self.advance();
                    return Ok(Token::String(string));
                }
                Some('\\') => {
                    self.advance();
                    match self.current() {
                        Some('n') => string.push('\n'),
                        Some('t') => string.push('\t'),
                        Some('r') => string.push('\r'),
                        Some('\\') => string.push('\\'),
                        Some('"') => string.push('"'),
                        Some('0') => string.push('\0'),
                        Some(ch) => {
                            return Err(self.error(format!("unknown escape sequence: \\{}", ch), self.line, self.col));
                        }
                        None => {
                            return Err(self.error("unexpected EOF in escape sequence", self.line, self.col));
                        }
                    }
                    self.advance();
                }
                Some('\n') => {
                    return Err(self.error(
                        "unterminated string (newline before closing quote)",
                        start_line,
                        start_col,
                    ));
                }
                Some(ch) => {
                    string.push(ch);
                    self.advance();
                }
                None => {
                    return Err(self.error("unterminated string literal", start_line, start_col));
                }
            }
        }
    }

    fn read_number(&mut self) -> Result<Token, LexerError> {
        let start_line = self.line;
        let start_col = self.col;

        // Hex: 0x... or 0X...
        if self.current() == Some('0') && matches!(self.peek(), Some('x') | Some('X')) {
            self.advance();
            self.advance();

            let mut hex = String::new();
            while let Some(ch) = self.current() {
                if ch.is_ascii_hexdigit() {
                    hex.push(ch);
                    self.advance();
                } else {
                    break;
                }
            }

            if hex.is_empty() {
                return Err(self.error("expected hex digits after 0x", start_line, start_col));
            }

            let value = u64::from_str_radix(&hex, 16)
                .map_err(|_| self.error(format!("invalid hex number: 0x{}", hex), start_line, start_col))?;
            return Ok(Token::Integer(value));
        }

        let mut digits = String::new();
        let mut has_dot = false;

        while let Some(ch) = self.current() {
            if ch.is_ascii_digit() {
                digits.push(ch);
                self.advance();
            } else if ch == '.' && !has_dot {
                // `1.foo` stays an attribute access
                if self.peek().map(|c| c.is_ascii_digit()).unwrap_or(false) {
                    has_dot = true;
                    digits.push('.');
                    self.advance();
                } else {
                    break;
                }
            } else {
                break;
            }
        }

        if has_dot {
            let value: f64 = digits
                .parse()
                .map_err(|_| self.error(format!("invalid float: {}", digits), start_line, start_col))?;
            Ok(Token::Float(value))
        } else {
            let value: u64 = digits
                .parse()
                .map_err(|_| self.error(format!("invalid integer: {}", digits), start_line, start_col))?;
            Ok(Token::Integer(value))
        }
    }

    fn read_identifier(&mut self) -> Token {
        let mut ident = String::new();
        while let Some(ch) = self.current() {
            if ch.is_alphanumeric() || ch == '_' {
                ident.push(ch);
                self.advance();
            } else {
                break;
            }
        }
        Token::keyword(&ident).unwrap_or(Token::Ident(ident))
    }

    fn read_operator(&mut self) -> Option<Token> {
        let ch = self.current()?;
        let next = self.peek();

        let (token, width) = match (ch, next) {
            ('*', Some('*')) => (Token::StarStar, 2),
            ('=', Some('=')) => (Token::EqEq, 2),
            ('!', Some('=')) => (Token::NotEq, 2),
            ('<', Some('=')) => (Token::LtEq, 2),
            ('>', Some('=')) => (Token::GtEq, 2),
            ('<', Some('<')) => (Token::Shl, 2),
            ('>', Some('>')) => (Token::Shr, 2),
            ('&', Some('&')) => (Token::AndAnd, 2),
            ('|', Some('|')) => (Token::OrOr, 2),
            (':', Some('=')) => (Token::Declare, 2),
            ('+', _) => (Token::Plus, 1),
            ('-', _) => (Token::Minus, 1),
            ('*', _) => (Token::Star, 1),
            ('/', _) => (Token::Slash, 1),
            ('%', _) => (Token::Percent, 1),
            ('&', _) => (Token::Amp, 1),
            ('|', _) => (Token::Pipe, 1),
            ('^', _) => (Token::Caret, 1),
            ('~', _) => (Token::Tilde, 1),
            ('!', _) => (Token::Bang, 1),
            ('=', _) => (Token::Assign, 1),
            ('<', _) => (Token::Lt, 1),
            ('>', _) => (Token::Gt, 1),
            ('.', _) => (Token::Dot, 1),
            (':', _) => (Token::Colon, 1),
            (',', _) => (Token::Comma, 1),
            (';', _) => (Token::Semicolon, 1),
            ('(', _) => (Token::LParen, 1),
            (')', _) => (Token::RParen, 1),
            ('[', _) => (Token::LBracket, 1),
            (']', _) => (Token::RBracket, 1),
            ('{', _) => (Token::LBrace, 1),
            ('}', _) => (Token::RBrace, 1),
            _ => return None,
        };

        for _ in 0..width {
            self.advance();
        }
        Some(token)
    }

    pub fn tokenize(&mut self) -> Result<Vec<Spanned>, LexerError> {
        let mut tokens = Vec::new();

        loop {
            self.skip_whitespace();
            let span = self.span();

            let token = match self.current() {
                None => {
                    tokens.push(Spanned {
                        token: Token::Eof,
                        span,
                    });
                    break;
                }
                Some('\n') => {
                    self.advance();
                    Token::Newline
                }
                Some('/') if self.peek() == Some('/') => self.read_comment(),
                Some('"') => self.read_string()?,
                Some(ch) if ch.is_ascii_digit() => self.read_number()?,
                Some(ch) if ch.is_alphabetic() || ch == '_' => self.read_identifier(),
                Some(ch) => match self.read_operator() {
                    Some(token) => token,
                    None => {
                        return Err(self.error(format!("unexpected character: '{}'", ch), self.line, self.col));
                    }
                },
            };
            tokens.push(Spanned { token, span });
        }

        Ok(tokens)
    }

    pub fn tokenize_clean(&mut self) -> Result<Vec<Spanned>, LexerError> {
        let tokens = self.tokenize()?;
        Ok(tokens
            .into_iter()
            .filter(|t| !matches!(t.token, Token::Comment(_) | Token::Newline))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tokens(source: &str) -> Vec<Token> {
        let mut lexer = Lexer::new(source);
        lexer
            .tokenize_clean()
            .unwrap()
            .into_iter()
            .map(|s| s.token)
            .filter(|t| !matches!(t, Token::Eof))
            .collect()
    }

    fn tokens_raw(source: &str) -> Vec<Token> {
        let mut lexer = Lexer::new(source);
        lexer.tokenize().unwrap().into_iter().map(|s| s.token).collect()
    }

    fn lex_err(source: &str) -> LexerError {
        Lexer::new(source).tokenize().unwrap_err()
    }

    #[test]
    fn test_declaration() {
        assert_eq!(
            tokens("var x = 42"),
            vec![
                Token::Var,
                Token::Ident("x".to_string()),
                Token::Assign,
                Token::Integer(42)
            ]
        );
        assert_eq!(
            tokens("y := 1.5"),
            vec![Token::Ident("y".to_string()), Token::Declare, Token::Float(1.5)]
        );
    }

    #[test]
    fn test_two_char_operators() {
        assert_eq!(
            tokens("** == != <= >= << >> && ||"),
            vec![
                Token::StarStar,
                Token::EqEq,
                Token::NotEq,
                Token::LtEq,
                Token::GtEq,
                Token::Shl,
                Token::Shr,
                Token::AndAnd,
                Token::OrOr
            ]
        );
    }

    #[test]
    fn test_single_char_operators() {
        assert_eq!(
            tokens("+ - * / % & | ^ ~ ! < > . : , ;"),
            vec![
                Token::Plus,
                Token::Minus,
                Token::Star,
                Token::Slash,
                Token::Percent,
                Token::Amp,
                Token::Pipe,
                Token::Caret,
                Token::Tilde,
                Token::Bang,
                Token::Lt,
                Token::Gt,
                Token::Dot,
                Token::Colon,
                Token::Comma,
                Token::Semicolon
            ]
        );
    }

    #[test]
    fn test_keywords_vs_identifiers() {
        assert_eq!(
            tokens("func funcs nil print del while_x"),
            vec![
                Token::Func,
                Token::Ident("funcs".to_string()),
                Token::Nil,
                Token::Print,
                Token::Del,
                Token::Ident("while_x".to_string())
            ]
        );
    }

    #[test]
    fn test_minus_is_an_operator() {
        assert_eq!(tokens("a-1"), vec![Token::Ident("a".to_string()), Token::Minus, Token::Integer(1)]);
    }

    #[test]
    fn test_hex_numbers() {
        assert_eq!(tokens("0xff 0X10"), vec![Token::Integer(255), Token::Integer(16)]);
    }

    #[test]
    fn test_dot_after_integer() {
        assert_eq!(
            tokens("1.x"),
            vec![Token::Integer(1), Token::Dot, Token::Ident("x".to_string())]
        );
    }

    #[test]
    fn test_string_escapes() {
        assert_eq!(
            tokens(r#""a\n\t\"b\\\0""#),
            vec![Token::String("a\n\t\"b\\\0".to_string())]
        );
    }

    #[test]
    fn test_comments_newlines_eof_raw() {
        assert_eq!(
            tokens_raw("x // note\ny"),
            vec![
                Token::Ident("x".to_string()),
                Token::Comment("note".to_string()),
                Token::Newline,
                Token::Ident("y".to_string()),
                Token::Eof
            ]
        );
    }

    #[test]
    fn test_spans_are_one_based() {
        let toks = Lexer::new("a\n  bc").tokenize().unwrap();
        assert_eq!(toks[0].span, Span { line: 1, col: 1 });
        assert_eq!(toks[2].span, Span { line: 2, col: 3 });
    }

    #[test]
    fn test_unterminated_string_newline_error() {
        let err = lex_err("\"abc\ndef\"");
        assert!(err.message.contains("unterminated string"));
        assert_eq!((err.line, err.col), (1, 1));
    }

    #[test]
    fn test_unknown_escape_error() {
        let err = lex_err(r#""\q""#);
        assert!(err.message.contains("unknown escape"));
    }

    #[test]
    fn test_invalid_hex_error() {
        assert!(lex_err("0x").message.contains("expected hex digits"));
    }

    #[test]
    fn test_unexpected_character() {
        let err = lex_err("x = @");
        assert_eq!(err.to_string(), "1:5: unexpected character: '@'");
    }

    #[test]
    fn test_integer_overflow_error() {
        assert!(lex_err("99999999999999999999").message.contains("invalid integer"));
        assert_eq!(tokens("9223372036854775808"), vec![Token::Integer(1 << 63)]);
    }
}
