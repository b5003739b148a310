use crate::bytecode::op::ScriptOp;

#[derive(Debug, Clone, PartialEq)]
pub enum Token {
    // Literals
    Number(f32),

    // Operators
    Plus,
    Minus,
    Star,
    Slash,
    Ampersand,
    Pipe,
    Caret,
    Bang,
    Lt,
    Gt,
    LtEq,
    GtEq,
    EqEq,
    NotEq,

    // Punctuation
    Assign,
    LParen,
    RParen,
    LBrace,
    RBrace,
    LBracket,
    RBracket,
    Comma,
    Semicolon,
    Dot,

    // Keywords
    If,
    Then,
    Else,
    While,
    For,
    Return,

    // Identifier (variable, function or constant name)
    Ident(String),

    // `#...` line, without the leading '#'
    Directive(String),

    Eof,
}

impl Token {
    /// Keyword for `word`, ignoring case.
    pub fn keyword(word: &str) -> Option<Token> {
        let token = match word.to_ascii_lowercase().as_str() {
            "if" => Token::If,
            "then" => Token::Then,
            "else" => Token::Else,
            "while" => Token::While,
            "for" => Token::For,
            "return" => Token::Return,
            _ => return None,
        };
        Some(token)
    }

    /// Operator byte for tokens that may appear between operands.
    pub fn operator(&self) -> Option<ScriptOp> {
        let op = match self {
            Token::Plus => ScriptOp::Add,
            Token::Minus => ScriptOp::Substract,
            Token::Star => ScriptOp::Multiply,
            Token::Slash => ScriptOp::Divide,
            Token::Ampersand => ScriptOp::And,
            Token::Pipe => ScriptOp::Or,
            Token::Caret => ScriptOp::Xor,
            Token::Bang => ScriptOp::Not,
            Token::Lt => ScriptOp::Smaller,
            Token::Gt => ScriptOp::Greater,
            Token::LtEq => ScriptOp::SmallerEquals,
            Token::GtEq => ScriptOp::GreaterEquals,
            Token::EqEq => ScriptOp::Equals,
            Token::NotEq => ScriptOp::NotEquals,
            _ => return None,
        };
        Some(op)
    }

    pub fn is_keyword(&self) -> bool {
        matches!(
            self,
            Token::If | Token::Then | Token::Else | Token::While | Token::For | Token::Return
        )
    }

    /// Source text of fixed tokens, used in error messages.
    pub fn text(&self) -> String {
        let s = match self {
            Token::Number(n) => return format!("{}", n),
            Token::Ident(name) => return name.clone(),
            Token::Directive(d) => return format!("#{}", d),
            Token::Plus => "+",
            Token::Minus => "-",
            Token::Star => "*",
            Token::Slash => "/",
            Token::Ampersand => "&",
            Token::Pipe => "|",
            Token::Caret => "^",
            Token::Bang => "!",
            Token::Lt => "<",
            Token::Gt => ">",
            Token::LtEq => "<=",
            Token::GtEq => ">=",
            Token::EqEq => "==",
            Token::NotEq => "!=",
            Token::Assign => "=",
            Token::LParen => "(",
            Token::RParen => ")",
            Token::LBrace => "{",
            Token::RBrace => "}",
            Token::LBracket => "[",
            Token::RBracket => "]",
            Token::Comma => ",",
            Token::Semicolon => ";",
            Token::Dot => ".",
            Token::If => "if",
            Token::Then => "then",
            Token::Else => "else",
            Token::While => "while",
            Token::For => "for",
            Token::Return => "return",
            Token::Eof => "end of input",
        };
        s.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keywords_ignore_case() {
        assert_eq!(Token::keyword("WHILE"), Some(Token::While));
        assert_eq!(Token::keyword("Then"), Some(Token::Then));
        assert_eq!(Token::keyword("whilst"), None);
    }

    #[test]
    fn test_operator_mapping() {
        assert_eq!(Token::Minus.operator(), Some(ScriptOp::Substract));
        assert_eq!(Token::NotEq.operator(), Some(ScriptOp::NotEquals));
        assert_eq!(Token::Assign.operator(), None);
    }
}
