//! Tokenizer for one formula line

#[derive(Debug, Clone, PartialEq)]
pub enum Token {
    Number(f64),
    Ident(String),
    Plus,
    Minus,
    Star,
    StarStar,
    Slash,
    Percent,
    LParen,
    RParen,
    Comma,
    Dot,
    Question,
    Colon,
    Semicolon,
    Assign,
    EqEq,
    NotEq,
    Lt,
    Le,
    Gt,
    Ge,
    Bang,
    AndAnd,
    OrOr,
}

impl Token {
    /// Source-like rendering used in syntax error messages
    pub fn describe(&self) -> String {
        let text = match self {
            Token::Number(n) => return n.to_string(),
            Token::Ident(name) => return name.clone(),
            Token::Plus => "+",
            Token::Minus => "-",
            Token::Star => "*",
            Token::StarStar => "**",
            Token::Slash => "/",
            Token::Percent => "%",
            Token::LParen => "(",
            Token::RParen => ")",
            Token::Comma => ",",
            Token::Dot => ".",
            Token::Question => "?",
            Token::Colon => ":",
            Token::Semicolon => ";",
            Token::Assign => "=",
            Token::EqEq => "==",
            Token::NotEq => "!=",
            Token::Lt => "<",
            Token::Le => "<=",
            Token::Gt => ">",
            Token::Ge => ">=",
            Token::Bang => "!",
            Token::AndAnd => "&&",
            Token::OrOr => "||",
        };
        text.to_string()
    }
}

/// Drop a trailing `//` comment
pub fn strip_comment(line: &str) -> &str {
    match line.find("//") {
        Some(idx) => &line[..idx],
        None => line,
    }
}

fn is_ident_start(c: char) -> bool {
    c.is_ascii_alphabetic() || c == '_' || c == '$'
}

fn is_ident_continue(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_' || c == '$'
}

/// Split one line into tokens
///
/// `===` and `!==` collapse into `==` and `!=`: every value is a number, so
/// strict and loose equality agree.
pub fn tokenize(line: &str) -> Result<Vec<Token>, String> {
    let mut tokens = Vec::new();
    let mut chars = line.chars().peekable();

    while let Some(&c) = chars.peek() {
        if c.is_whitespace() {
            chars.next();
            continue;
        }

        if c.is_ascii_digit() || c == '.' {
            let mut literal = String::new();
            while let Some(&d) = chars.peek() {
                if d.is_ascii_digit() || d == '.' {
                    literal.push(d);
                    chars.next();
                } else {
                    break;
                }
            }

            // A lone '.' is member access, not a number
            if literal == "." {
                tokens.push(Token::Dot);
                continue;
            }

            if let Some(&e) = chars.peek() {
                if e == 'e' || e == 'E' {
                    literal.push(e);
                    chars.next();
                    if let Some(&sign) = chars.peek() {
                        if sign == '+' || sign == '-' {
                            literal.push(sign);
                            chars.next();
                        }
                    }
                    while let Some(&d) = chars.peek() {
                        if d.is_ascii_digit() {
                            literal.push(d);
                            chars.next();
                        } else {
                            break;
                        }
                    }
                }
            }

            let value = literal
                .parse::<f64>()
                .map_err(|_| format!("invalid number '{}'", literal))?;
            tokens.push(Token::Number(value));
            continue;
        }

        if is_ident_start(c) {
            let mut name = String::new();
            while let Some(&d) = chars.peek() {
                if is_ident_continue(d) {
                    name.push(d);
                    chars.next();
                } else {
                    break;
                }
            }
            tokens.push(Token::Ident(name));
            continue;
        }

        chars.next();
        let token = match c {
            '+' => Token::Plus,
            '-' => Token::Minus,
            '*' => {
                if chars.peek() == Some(&'*') {
                    chars.next();
                    Token::StarStar
                } else {
                    Token::Star
                }
            }
            '/' => Token::Slash,
            '%' => Token::Percent,
            '(' => Token::LParen,
            ')' => Token::RParen,
            ',' => Token::Comma,
            '?' => Token::Question,
            ':' => Token::Colon,
            ';' => Token::Semicolon,
            '=' => {
                if chars.peek() == Some(&'=') {
                    chars.next();
                    if chars.peek() == Some(&'=') {
                        chars.next();
                    }
                    Token::EqEq
                } else {
                    Token::Assign
                }
            }
            '!' => {
                if chars.peek() == Some(&'=') {
                    chars.next();
                    if chars.peek() == Some(&'=') {
                        chars.next();
                    }
                    Token::NotEq
                } else {
                    Token::Bang
                }
            }
            '<' => {
                if chars.peek() == Some(&'=') {
                    chars.next();
                    Token::Le
                } else {
                    Token::Lt
                }
            }
            '>' => {
                if chars.peek() == Some(&'=') {
                    chars.next();
                    Token::Ge
                } else {
                    Token::Gt
                }
            }
            '&' if chars.peek() == Some(&'&') => {
                chars.next();
                Token::AndAnd
            }
            '|' if chars.peek() == Some(&'|') => {
                chars.next();
                Token::OrOr
            }
            other => return Err(format!("unexpected character '{}'", other)),
        };
        tokens.push(token);
    }

    Ok(tokens)
}

/// Identifiers shaped like variable names (`v1`, `v12`) mentioned by a formula
pub fn referenced_variables(formula: &str) -> Vec<String> {
    let mut found = Vec::new();
    for line in formula.lines() {
        let Ok(tokens) = tokenize(strip_comment(line)) else {
            continue;
        };
        for token in tokens {
            if let Token::Ident(name) = token {
                let is_variable = name.len() > 1
                    && name.starts_with('v')
                    && name[1..].chars().all(|c| c.is_ascii_digit());
                if is_variable && !found.contains(&name) {
                    found.push(name);
                }
            }
        }
    }
    found
}
