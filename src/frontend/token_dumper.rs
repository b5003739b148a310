use crate::frontend::lexer::Spanned;
use crate::frontend::token::Token;

/// Prints a token stream, one token per line, for `--tokens`.
pub struct TokenDumper {
    pub color: bool,
    pub show_debug_repr: bool, // if false, prints the source text of each token
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
        for s in tokens {
            println!("{}", self.format_one(s));
        }
    }

    pub fn format_one(&self, s: &Spanned) -> String {
        let kind = Self::kind(&s.token);
        let colr = if self.color { Self::color(&s.token) } else { "" };
        let reset = if self.color { Self::RESET } else { "" };

        let text = if self.show_debug_repr {
            format!("{:?}", s.token)
        } else {
            s.token.text()
        };
        format!(
            "[{:02}:{:02}] {}{:<9} {}{}",
            s.span.line, s.span.col, colr, kind, text, reset
        )
    }

    fn kind(t: &Token) -> &'static str {
        use Token::*;
        match t {
            Eof => "EOF",
            Number(_) => "NUMBER",
            Ident(_) => "IDENT",
            Directive(_) => "DIRECTIVE",

            LParen | RParen | LBrace | RBrace | LBracket | RBracket => "BRACKET",
            Comma | Semicolon | Dot | Assign => "PUNCT",

            Lt | Gt | LtEq | GtEq | EqEq | NotEq => "CMP",
            Plus | Minus | Star | Slash | Ampersand | Pipe | Caret | Bang => "OP",

            If | Then | Else | While | For | Return => "KEYWORD",
        }
    }

    fn color(t: &Token) -> &'static str {
        use Token::*;
        match t {
            Eof | Directive(_) => Self::DIM,
            Number(_) => Self::CYN,
            Ident(_) => Self::YEL,
            If | Then | Else | While | For | Return => Self::GRN,
            t if t.operator().is_some() => Self::MAG,
            _ => Self::RESET,
        }
    }
}
