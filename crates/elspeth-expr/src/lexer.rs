use crate::error::ExprError;

#[derive(Debug, Clone, PartialEq)]
pub enum Token {
    Ident(String),
    Str(String),
    Num(f64),
    True,
    False,
    Null,
    Plus,
    Minus,
    Star,
    Slash,
    SlashSlash,
    Percent,
    Lt,
    Le,
    Gt,
    Ge,
    EqEq,
    NotEq,
    And,
    Or,
    Not,
    In,
    If,
    Else,
    Dot,
    Comma,
    Colon,
    LParen,
    RParen,
    LBracket,
    RBracket,
    Eof,
}

/// Keywords whose mere presence signals an attempt to escape the
/// sandbox — rejected as `ExprError::Security` rather than a generic
/// syntax error, per the forbidden-construct list.
const FORBIDDEN_KEYWORDS: &[&str] = &[
    "lambda", "import", "yield", "await", "def", "class", "assert", "global", "nonlocal", "del", "async", "with",
    "for", "while", "try", "except", "raise", "from", "as", "exec", "eval",
];

pub fn lex(input: &str) -> Result<Vec<Token>, ExprError> {
    let chars: Vec<char> = input.chars().collect();
    let mut i = 0usize;
    let mut tokens = Vec::new();

    while i < chars.len() {
        let c = chars[i];
        if c.is_whitespace() {
            i += 1;
            continue;
        }
        match c {
            '(' => {
                tokens.push(Token::LParen);
                i += 1;
            }
            ')' => {
                tokens.push(Token::RParen);
                i += 1;
            }
            '[' => {
                tokens.push(Token::LBracket);
                i += 1;
            }
            ']' => {
                tokens.push(Token::RBracket);
                i += 1;
            }
            '.' => {
                tokens.push(Token::Dot);
                i += 1;
            }
            ',' => {
                tokens.push(Token::Comma);
                i += 1;
            }
            ':' => {
                if matches!(chars.get(i + 1), Some(':')) {
                    return Err(ExprError::Security("slice syntax is forbidden".to_string()));
                }
                tokens.push(Token::Colon);
                i += 1;
            }
            '+' => {
                tokens.push(Token::Plus);
                i += 1;
            }
            '-' => {
                tokens.push(Token::Minus);
                i += 1;
            }
            '*' => {
                tokens.push(Token::Star);
                i += 1;
            }
            '/' => {
                if matches!(chars.get(i + 1), Some('/')) {
                    tokens.push(Token::SlashSlash);
                    i += 2;
                } else {
                    tokens.push(Token::Slash);
                    i += 1;
                }
            }
            '%' => {
                tokens.push(Token::Percent);
                i += 1;
            }
            '<' => {
                if matches!(chars.get(i + 1), Some('=')) {
                    tokens.push(Token::Le);
                    i += 2;
                } else {
                    tokens.push(Token::Lt);
                    i += 1;
                }
            }
            '>' => {
                if matches!(chars.get(i + 1), Some('=')) {
                    tokens.push(Token::Ge);
                    i += 2;
                } else {
                    tokens.push(Token::Gt);
                    i += 1;
                }
            }
            '=' => {
                if matches!(chars.get(i + 1), Some('=')) {
                    tokens.push(Token::EqEq);
                    i += 2;
                } else {
                    return Err(ExprError::Security("assignment is forbidden".to_string()));
                }
            }
            '!' => {
                if matches!(chars.get(i + 1), Some('=')) {
                    tokens.push(Token::NotEq);
                    i += 2;
                } else {
                    return Err(ExprError::Syntax("unexpected '!'".to_string()));
                }
            }
            '\'' | '"' => {
                let quote = c;
                let mut s = String::new();
                i += 1;
                let mut closed = false;
                while i < chars.len() {
                    if chars[i] == quote {
                        closed = true;
                        i += 1;
                        break;
                    }
                    if chars[i] == '{' {
                        return Err(ExprError::Security("formatted strings are forbidden".to_string()));
                    }
                    s.push(chars[i]);
                    i += 1;
                }
                if !closed {
                    return Err(ExprError::Syntax("unterminated string literal".to_string()));
                }
                tokens.push(Token::Str(s));
            }
            _ if c.is_ascii_digit() => {
                let start = i;
                while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                    i += 1;
                }
                let text: String = chars[start..i].iter().collect();
                let n: f64 = text
                    .parse()
                    .map_err(|_| ExprError::Syntax(format!("invalid number literal '{text}'")))?;
                tokens.push(Token::Num(n));
            }
            _ if c.is_alphabetic() || c == '_' => {
                let start = i;
                while i < chars.len() && (chars[i].is_alphanumeric() || chars[i] == '_') {
                    i += 1;
                }
                let word: String = chars[start..i].iter().collect();
                if FORBIDDEN_KEYWORDS.contains(&word.as_str()) {
                    return Err(ExprError::Security(format!("'{word}' is forbidden")));
                }
                let tok = match word.as_str() {
                    "true" | "True" => Token::True,
                    "false" | "False" => Token::False,
                    "null" | "None" => Token::Null,
                    "and" => Token::And,
                    "or" => Token::Or,
                    "not" => Token::Not,
                    "in" => Token::In,
                    "if" => Token::If,
                    "else" => Token::Else,
                    "row" => Token::Ident(word),
                    other => {
                        return Err(ExprError::Security(format!(
                            "name '{other}' is forbidden; only 'row' may be referenced"
                        )))
                    }
                };
                tokens.push(tok);
            }
            other => return Err(ExprError::Syntax(format!("unexpected character '{other}'"))),
        }
    }
    tokens.push(Token::Eof);
    Ok(tokens)
}
