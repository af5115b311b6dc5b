use std::fmt::Write;

use crate::frontend::lexer::Spanned;
use crate::frontend::token::Token;

pub struct TokenDumper {
    pub color: bool,
    pub show_debug_repr: bool, // if false, prints source text instead of Debug
}

impl Default for TokenDumper {
    fn default() -> Self {
        Self {
            color: true,
            show_debug_repr: true,
        }
    }
}

impl TokenDumper {
    // ANSI colors
    const RESET: &'static str = "\x1b[0m";
    const DIM: &'static str = "\x1b[2m";
    const GRN: &'static str = "\x1b[32m";
    const YEL: &'static str = "\x1b[33m";
    const CYN: &'static str = "\x1b[36m";
    const MAG: &'static str = "\x1b[35m";
    const BLU: &'static str = "\x1b[34m";

    pub fn new() -> Self {
        Self::default()
    }

    pub fn no_color(mut self) -> Self {
        self.color = false;
        self
    }

    pub fn pretty(mut self) -> Self {
        self.show_debug_repr = false;
        self
    }

    pub fn dump(&self, tokens: &[Spanned]) {
        print!("{}", self.render(tokens));
    }

    pub fn render(&self, tokens: &[Spanned]) -> String {
        let mut out = String::new();
        for s in tokens {
            self.render_one(&mut out, s);
        }
        out
    }

    fn render_one(&self, out: &mut String, s: &Spanned) {
        let line = s.span.line;
        let col = s.span.col;

        let kind = self.kind(&s.token);
        let colr = if self.color { self.color(&s.token) } else { "" };
        let reset = if self.color { Self::RESET } else { "" };

        let text = if self.show_debug_repr {
            format!("{:?}", s.token)
        } else {
            match &s.token {
                Token::Comment(c) => format!("// {}", c.trim()),
                Token::Newline => "\\n".to_string(),
                Token::Eof => "<eof>".to_string(),
                other => other.to_string(),
            }
        };
        let _ = writeln!(out, "[{:02}:{:02}] {}{:<8} {}{}", line, col, colr, kind, text, reset);
    }

    fn kind(&self, t: &Token) -> &'static str {
        use Token::*;
        match t {
            Newline => "NEWLINE",
            Comment(_) => "COMMENT",
            Eof => "EOF",

            Integer(_) => "INT",
            Float(_) => "FLOAT",
            String(_) => "STRING",

            Ident(_) => "IDENT",

            LParen | RParen | LBracket | RBracket | LBrace | RBrace | Comma | Colon | Semicolon => "PUNCT",
            Assign | Declare => "ASSIGN",

            EqEq | NotEq | Lt | LtEq | Gt | GtEq => "CMP",
            AndAnd | OrOr | Bang => "LOGIC",
            Plus | Minus | Star | Slash | Percent | StarStar | Amp | Pipe | Caret | Tilde | Shl | Shr | Dot => "OP",

            _ => "KEYWORD",
        }
    }

    fn color(&self, t: &Token) -> &'static str {
        use Token::*;
        match t {
            Newline | Comment(_) | Eof => Self::DIM,
            String(_) => Self::GRN,
            Integer(_) | Float(_) | True | False | Nil => Self::CYN,
            Ident(_) => Self::YEL,
            t if t.is_keyword() => Self::BLU,
            LParen | RParen | LBracket | RBracket | LBrace | RBrace | Comma | Colon | Semicolon => Self::RESET,
            _ => Self::MAG,
        }
    }
}
