//! Tokenizer for route conditions

use super::{CompilationError, ErrorPosition, ErrorRange};

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum TokenKind {
    /// Application property or function name
    Identifier(String),
    /// `$name`
    SystemProperty(String),
    /// `$body` (None) or `$body.<path>` (Some(path))
    Body(Option<String>),
    Number(f64),
    Str(String),
    True,
    False,
    Null,
    And,
    Or,
    Not,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    LParen,
    RParen,
    Comma,
    Eof,
}

impl TokenKind {
    pub(crate) fn describe(&self) -> String {
        match self {
            TokenKind::Identifier(name) => format!("identifier '{}'", name),
            TokenKind::SystemProperty(name) => format!("'${}'", name),
            TokenKind::Body(_) => "'$body'".to_string(),
            TokenKind::Number(n) => format!("number {}", n),
            TokenKind::Str(s) => format!("string '{}'", s),
            TokenKind::True => "'true'".to_string(),
            TokenKind::False => "'false'".to_string(),
            TokenKind::Null => "'null'".to_string(),
            TokenKind::And => "'AND'".to_string(),
            TokenKind::Or => "'OR'".to_string(),
            TokenKind::Not => "'NOT'".to_string(),
            TokenKind::Eq => "'='".to_string(),
            TokenKind::Ne => "'!='".to_string(),
            TokenKind::Lt => "'<'".to_string(),
            TokenKind::Le => "'<='".to_string(),
            TokenKind::Gt => "'>'".to_string(),
            TokenKind::Ge => "'>='".to_string(),
            TokenKind::LParen => "'('".to_string(),
            TokenKind::RParen => "')'".to_string(),
            TokenKind::Comma => "','".to_string(),
            TokenKind::Eof => "end of condition".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Token {
    pub kind: TokenKind,
    pub range: ErrorRange,
}

struct Cursor {
    chars: Vec<char>,
    pos: usize,
    line: usize,
    column: usize,
}

impl Cursor {
    fn new(text: &str) -> Self {
        Self {
            chars: text.chars().collect(),
            pos: 0,
            line: 1,
            column: 1,
        }
    }

    fn peek(&self) -> Option<char> {
        self.chars.get(self.pos).copied()
    }

    fn peek_next(&self) -> Option<char> {
        self.chars.get(self.pos + 1).copied()
    }

    fn position(&self) -> ErrorPosition {
        ErrorPosition::new(self.line, self.column)
    }

    fn bump(&mut self) -> Option<char> {
        let c = self.peek()?;
        self.pos += 1;
        if c == '\n' {
            self.line += 1;
            self.column = 1;
        } else {
            self.column += 1;
        }
        Some(c)
    }

    fn eat_while(&mut self, mut predicate: impl FnMut(char) -> bool) -> String {
        let mut out = String::new();
        while let Some(c) = self.peek() {
            if !predicate(c) {
                break;
            }
            out.push(c);
            self.bump();
        }
        out
    }
}

fn is_identifier_start(c: char) -> bool {
    c.is_alphabetic() || c == '_'
}

fn is_identifier_char(c: char) -> bool {
    c.is_alphanumeric() || c == '_' || c == '-'
}

/// Characters that end a `$body` path outside brackets
fn ends_body_path(c: char) -> bool {
    c.is_whitespace() || matches!(c, '(' | ')' | ',' | '=' | '<' | '>' | '!')
}

/// Split a condition into tokens, collecting every lexical error
pub(crate) fn tokenize(text: &str) -> Result<Vec<Token>, Vec<CompilationError>> {
    let mut cursor = Cursor::new(text);
    let mut tokens = Vec::new();
    let mut errors = Vec::new();

    while let Some(c) = cursor.peek() {
        if c.is_whitespace() {
            cursor.bump();
            continue;
        }

        let start = cursor.position();
        let kind = match c {
            '(' => {
                cursor.bump();
                TokenKind::LParen
            }
            ')' => {
                cursor.bump();
                TokenKind::RParen
            }
            ',' => {
                cursor.bump();
                TokenKind::Comma
            }
            '=' => {
                cursor.bump();
                if cursor.peek() == Some('=') {
                    cursor.bump();
                }
                TokenKind::Eq
            }
            '!' => {
                cursor.bump();
                if cursor.peek() == Some('=') {
                    cursor.bump();
                    TokenKind::Ne
                } else {
                    errors.push(CompilationError::error(
                        "unexpected '!'; use NOT or '!='",
                        ErrorRange::new(start, cursor.position()),
                    ));
                    continue;
                }
            }
            '<' => {
                cursor.bump();
                match cursor.peek() {
                    Some('=') => {
                        cursor.bump();
                        TokenKind::Le
                    }
                    Some('>') => {
                        cursor.bump();
                        TokenKind::Ne
                    }
                    _ => TokenKind::Lt,
                }
            }
            '>' => {
                cursor.bump();
                if cursor.peek() == Some('=') {
                    cursor.bump();
                    TokenKind::Ge
                } else {
                    TokenKind::Gt
                }
            }
            '\'' | '"' => match lex_string(&mut cursor, c) {
                Some(value) => TokenKind::Str(value),
                None => {
                    errors.push(CompilationError::error(
                        "unterminated string literal",
                        ErrorRange::new(start, cursor.position()),
                    ));
                    continue;
                }
            },
            '$' => {
                cursor.bump();
                let name = cursor.eat_while(is_identifier_char);
                if name.is_empty() {
                    errors.push(CompilationError::error(
                        "expected a system property name after '$'",
                        ErrorRange::new(start, cursor.position()),
                    ));
                    continue;
                }
                if name.eq_ignore_ascii_case("body") {
                    lex_body_path(&mut cursor)
                } else {
                    TokenKind::SystemProperty(name)
                }
            }
            c if c.is_ascii_digit()
                || (c == '-' && cursor.peek_next().is_some_and(|n| n.is_ascii_digit())) =>
            {
                let mut literal = String::new();
                if c == '-' {
                    cursor.bump();
                    literal.push('-');
                }
                literal.push_str(&cursor.eat_while(|c| c.is_ascii_digit() || c == '.'));
                if matches!(cursor.peek(), Some('e') | Some('E')) {
                    literal.push_str(&cursor.eat_while(|c| {
                        c.is_ascii_digit() || matches!(c, 'e' | 'E' | '+' | '-')
                    }));
                }
                match literal.parse::<f64>() {
                    Ok(n) => TokenKind::Number(n),
                    Err(_) => {
                        errors.push(CompilationError::error(
                            format!("invalid number '{}'", literal),
                            ErrorRange::new(start, cursor.position()),
                        ));
                        continue;
                    }
                }
            }
            c if is_identifier_start(c) => {
                let word = cursor.eat_while(is_identifier_char);
                keyword(&word).unwrap_or(TokenKind::Identifier(word))
            }
            other => {
                cursor.bump();
                errors.push(CompilationError::error(
                    format!("unexpected character '{}'", other),
                    ErrorRange::new(start, cursor.position()),
                ));
                continue;
            }
        };

        tokens.push(Token {
            kind,
            range: ErrorRange::new(start, cursor.position()),
        });
    }

    if !errors.is_empty() {
        return Err(errors);
    }

    let end = cursor.position();
    tokens.push(Token {
        kind: TokenKind::Eof,
        range: ErrorRange::new(end, end),
    });
    Ok(tokens)
}

fn keyword(word: &str) -> Option<TokenKind> {
    let kind = match word.to_ascii_uppercase().as_str() {
        "AND" => TokenKind::And,
        "OR" => TokenKind::Or,
        "NOT" => TokenKind::Not,
        "TRUE" => TokenKind::True,
        "FALSE" => TokenKind::False,
        "NULL" => TokenKind::Null,
        _ => return None,
    };
    Some(kind)
}

/// Quoted literal; a doubled quote stands for one quote character
fn lex_string(cursor: &mut Cursor, quote: char) -> Option<String> {
    cursor.bump();
    let mut value = String::new();
    loop {
        let c = cursor.bump()?;
        if c == quote {
            if cursor.peek() == Some(quote) {
                cursor.bump();
                value.push(quote);
            } else {
                return Some(value);
            }
        } else {
            value.push(c);
        }
    }
}

/// Everything after `$body`, up to whitespace or an operator outside brackets.
/// Validation happens in the parser so the error can point at the whole reference.
fn lex_body_path(cursor: &mut Cursor) -> TokenKind {
    if !matches!(cursor.peek(), Some('.') | Some('[')) {
        return TokenKind::Body(None);
    }

    let mut raw = String::new();
    let mut in_brackets = false;
    while let Some(c) = cursor.peek() {
        if !in_brackets && ends_body_path(c) {
            break;
        }
        match c {
            '[' => in_brackets = true,
            ']' => in_brackets = false,
            _ => {}
        }
        raw.push(c);
        cursor.bump();
    }

    let path = raw.strip_prefix('.').unwrap_or(&raw).to_string();
    TokenKind::Body(Some(path))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(text: &str) -> Vec<TokenKind> {
        tokenize(text).unwrap().into_iter().map(|t| t.kind).collect()
    }

    #[test]
    fn test_tokenizes_operators_and_literals() {
        assert_eq!(
            kinds("a <> -1.5 and $messageId = 'x''y'"),
            vec![
                TokenKind::Identifier("a".to_string()),
                TokenKind::Ne,
                TokenKind::Number(-1.5),
                TokenKind::And,
                TokenKind::SystemProperty("messageId".to_string()),
                TokenKind::Eq,
                TokenKind::Str("x'y".to_string()),
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    fn test_body_paths_keep_bracket_contents() {
        assert_eq!(
            kinds("$body.a['b c'] = 1"),
            vec![
                TokenKind::Body(Some("a['b c']".to_string())),
                TokenKind::Eq,
                TokenKind::Number(1.0),
                TokenKind::Eof,
            ]
        );
        assert_eq!(kinds("$BODY")[0], TokenKind::Body(None));
    }

    #[test]
    fn test_token_ranges() {
        let tokens = tokenize("ab >= 10").unwrap();
        assert_eq!(tokens[1].range.start, ErrorPosition::new(1, 4));
        assert_eq!(tokens[1].range.end, ErrorPosition::new(1, 6));
    }

    #[test]
    fn test_collects_lexical_errors() {
        let errors = tokenize("a # 1 AND b = 'open").unwrap_err();
        assert_eq!(errors.len(), 2);
    }
}
