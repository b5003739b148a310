use crate::frontend::token::Token;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Span {
    pub line: usize,
    pub col: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Spanned {
    pub token: Token,
    pub span: Span,
}

#[derive(Debug, thiserror::Error)]
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
    /// True until a non-whitespace character is seen on the current line.
    line_start: bool,
}

impl Lexer {
    pub fn new(source: &str) -> Self {
        Lexer {
            source: source.chars().collect(),
            pos: 0,
            line: 1,
            col: 1,
            line_start: true,
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
            self.line_start = true;
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

    fn error(&self, message: impl Into<String>, span: Span) -> LexerError {
        LexerError {
            message: message.into(),
            line: span.line,
            col: span.col,
        }
    }

    fn skip_whitespace(&mut self) {
        while let Some(ch) = self.current() {
            if ch.is_whitespace() {
                self.advance();
            } else {
                break;
            }
        }
    }

    /// Skips `//` and `/* */` comments. Returns true when a comment was consumed.
    fn skip_comment(&mut self) -> Result<bool, LexerError> {
        match (self.current(), self.peek()) {
            (Some('/'), Some('/')) => {
                while let Some(ch) = self.current() {
                    if ch == '\n' {
                        break;
                    }
                    self.advance();
                }
                Ok(true)
            }
            (Some('/'), Some('*')) => {
                let start = self.span();
                self.advance();
                self.advance();
                loop {
                    match (self.current(), self.peek()) {
                        (Some('*'), Some('/')) => {
                            self.advance();
                            self.advance();
                            return Ok(true);
                        }
                        (Some(_), _) => {
                            self.advance();
                        }
                        (None, _) => {
                            return Err(self.error("unterminated block comment", start));
                        }
                    }
                }
            }
            _ => Ok(false),
        }
    }

    fn read_directive(&mut self) -> Token {
        self.advance(); // '#'
        let mut text = String::new();
        while let Some(ch) = self.current() {
            if ch == '\n' {
                break;
            }
            text.push(ch);
            self.advance();
        }
        Token::Directive(text.trim().to_string())
    }

    /// Reads a numeric identifier: digits, a decimal point, an exponent with
    /// optional sign and an optional `f` suffix.
    fn read_number(&mut self) -> Result<Token, LexerError> {
        let start = self.span();
        let mut text = String::new();

        while let Some(ch) = self.current() {
            if ch.is_ascii_alphanumeric() || ch == '_' || ch == '.' {
                text.push(ch);
                self.advance();
                if (ch == 'e' || ch == 'E') && matches!(self.current(), Some('+') | Some('-')) {
                    if let Some(sign) = self.advance() {
                        text.push(sign);
                    }
                }
            } else {
                break;
            }
        }

        let digits = text
            .strip_suffix('f')
            .or_else(|| text.strip_suffix('F'))
            .unwrap_or(&text)
            .replace('_', "");
        digits
            .parse::<f32>()
            .map(Token::Number)
            .map_err(|_| self.error(format!("invalid number: {}", text), start))
    }

    fn read_identifier(&mut self) -> Token {
        let mut ident = String::new();
        while let Some(ch) = self.current() {
            if is_identifier_char(ch) {
                ident.push(ch);
                self.advance();
            } else {
                break;
            }
        }
        Token::keyword(&ident).unwrap_or(Token::Ident(ident))
    }

    fn read_reserved(&mut self) -> Option<Token> {
        let ch = self.current()?;
        let next = self.peek();

        let (token, width) = match (ch, next) {
            ('<', Some('=')) => (Token::LtEq, 2),
            ('>', Some('=')) => (Token::GtEq, 2),
            ('=', Some('=')) => (Token::EqEq, 2),
            ('!', Some('=')) => (Token::NotEq, 2),
            ('+', _) => (Token::Plus, 1),
            ('-', _) => (Token::Minus, 1),
            ('*', _) => (Token::Star, 1),
            ('/', _) => (Token::Slash, 1),
            ('&', _) => (Token::Ampersand, 1),
            ('|', _) => (Token::Pipe, 1),
            ('^', _) => (Token::Caret, 1),
            ('!', _) => (Token::Bang, 1),
            ('<', _) => (Token::Lt, 1),
            ('>', _) => (Token::Gt, 1),
            ('=', _) => (Token::Assign, 1),
            ('(', _) => (Token::LParen, 1),
            (')', _) => (Token::RParen, 1),
            ('{', _) => (Token::LBrace, 1),
            ('}', _) => (Token::RBrace, 1),
            ('[', _) => (Token::LBracket, 1),
            (']', _) => (Token::RBracket, 1),
            (',', _) => (Token::Comma, 1),
            (';', _) => (Token::Semicolon, 1),
            ('.', _) => (Token::Dot, 1),
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
            if self.skip_comment()? {
                continue;
            }

            let span = self.span();
            let Some(ch) = self.current() else {
                tokens.push(Spanned {
                    token: Token::Eof,
                    span,
                });
                break;
            };
            let at_line_start = self.line_start;
            self.line_start = false;

            let token = if ch == '#' {
                if !at_line_start {
                    return Err(self.error("directive must start a line", span));
                }
                self.read_directive()
            } else if ch.is_ascii_digit() {
                self.read_number()?
            } else if let Some(token) = self.read_reserved() {
                token
            } else if is_identifier_char(ch) {
                self.read_identifier()
            } else {
                return Err(self.error(format!("unexpected character '{}'", ch), span));
            };

            tokens.push(Spanned { token, span });
        }

        Ok(tokens)
    }
}

fn is_identifier_char(ch: char) -> bool {
    ch.is_alphanumeric() || ch == '_'
}

/// Sorted, deduplicated names of all identifiers in `tokens`.
pub fn identifier_table(tokens: &[Spanned]) -> Vec<String> {
    let mut names: Vec<String> = tokens
        .iter()
        .filter_map(|s| match &s.token {
            Token::Ident(name) => Some(name.clone()),
            _ => None,
        })
        .collect();
    names.sort();
    names.dedup();
    names
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lex(source: &str) -> Vec<Token> {
        Lexer::new(source)
            .tokenize()
            .unwrap()
            .into_iter()
            .map(|s| s.token)
            .collect()
    }

    #[test]
    fn test_assignment_tokens() {
        assert_eq!(
            lex("a = 1 + 2.5;"),
            vec![
                Token::Ident("a".to_string()),
                Token::Assign,
                Token::Number(1.0),
                Token::Plus,
                Token::Number(2.5),
                Token::Semicolon,
                Token::Eof,
            ]
        );
    }

    #[test]
    fn test_two_char_operators() {
        assert_eq!(
            lex("<= >= == != < >"),
            vec![
                Token::LtEq,
                Token::GtEq,
                Token::EqEq,
                Token::NotEq,
                Token::Lt,
                Token::Gt,
                Token::Eof,
            ]
        );
    }

    #[test]
    fn test_exponent_and_suffix() {
        assert_eq!(lex("1e-3"), vec![Token::Number(0.001), Token::Eof]);
        assert_eq!(lex("2.5E+2"), vec![Token::Number(250.0), Token::Eof]);
        assert_eq!(lex("0.5f"), vec![Token::Number(0.5), Token::Eof]);
    }

    #[test]
    fn test_keywords_and_indexer() {
        assert_eq!(
            lex("IF v.x"),
            vec![
                Token::If,
                Token::Ident("v".to_string()),
                Token::Dot,
                Token::Ident("x".to_string()),
                Token::Eof,
            ]
        );
    }

    #[test]
    fn test_comments_are_skipped() {
        assert_eq!(
            lex("a // line\n/* block\n comment */ b"),
            vec![
                Token::Ident("a".to_string()),
                Token::Ident("b".to_string()),
                Token::Eof,
            ]
        );
    }

    #[test]
    fn test_unterminated_block_comment() {
        let err = Lexer::new("a = 1;\n  /* open").tokenize().unwrap_err();
        assert_eq!((err.line, err.col), (2, 3));
    }

    #[test]
    fn test_directive_at_line_start() {
        assert_eq!(
            lex("  #input a 3\nb"),
            vec![
                Token::Directive("input a 3".to_string()),
                Token::Ident("b".to_string()),
                Token::Eof,
            ]
        );
        assert!(Lexer::new("a #define").tokenize().is_err());
    }

    #[test]
    fn test_invalid_character() {
        let err = Lexer::new("a = @;").tokenize().unwrap_err();
        assert_eq!((err.line, err.col), (1, 5));
        assert!(Lexer::new("a = \"x\";").tokenize().is_err());
        assert!(Lexer::new("a = 1x2;").tokenize().is_err());
    }

    #[test]
    fn test_identifier_table() {
        let tokens = Lexer::new("b = a + b; c = a;").tokenize().unwrap();
        assert_eq!(identifier_table(&tokens), vec!["a", "b", "c"]);
    }
}
