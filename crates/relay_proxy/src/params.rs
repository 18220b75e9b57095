//! Positional parameter handling for the extended query protocol.
//!
//! Instances only accept SQL text, so bound values are inlined as quoted
//! literals before routing. Placeholders inside string literals, quoted
//! identifiers, dollar-quoted bodies and comments are left alone.

use crate::codec::BindValue;

enum Token<'a> {
    Text(&'a str),
    Placeholder(usize),
}

fn tokenize(sql: &str) -> Vec<Token<'_>> {
    let bytes = sql.as_bytes();
    let mut tokens = Vec::new();
    let mut start = 0;
    let mut i = 0;

    while i < bytes.len() {
        match bytes[i] {
            quote @ (b'\'' | b'"') => {
                i += 1;
                while i < bytes.len() {
                    if bytes[i] == quote {
                        // Doubled quote is an escaped quote.
                        if bytes.get(i + 1) == Some(&quote) {
                            i += 2;
                            continue;
                        }
                        break;
                    }
                    i += 1;
                }
                i += 1;
            }
            b'-' if bytes.get(i + 1) == Some(&b'-') => {
                while i < bytes.len() && bytes[i] != b'\n' {
                    i += 1;
                }
            }
            b'/' if bytes.get(i + 1) == Some(&b'*') => {
                i += 2;
                while i < bytes.len() && !(bytes[i] == b'*' && bytes.get(i + 1) == Some(&b'/')) {
                    i += 1;
                }
                i += 2;
            }
            // Inside an identifier such as `col$1`, `$` is an ordinary character.
            b'$' if i > 0 && is_ident_byte(bytes[i - 1]) => i += 1,
            b'$' => {
                let digits = bytes[i + 1..]
                    .iter()
                    .take_while(|b| b.is_ascii_digit())
                    .count();
                if digits > 0 {
                    let n = sql[i + 1..i + 1 + digits].parse::<usize>().unwrap_or(0);
                    tokens.push(Token::Text(&sql[start..i]));
                    tokens.push(Token::Placeholder(n));
                    i += 1 + digits;
                    start = i;
                    continue;
                }
                // Dollar-quoted body: $tag$ ... $tag$
                let tag_len = bytes[i + 1..]
                    .iter()
                    .take_while(|b| b.is_ascii_alphanumeric() || **b == b'_')
                    .count();
                if bytes.get(i + 1 + tag_len) == Some(&b'$') {
                    let tag = &sql[i..i + tag_len + 2];
                    let body_start = i + tag.len();
                    i = match sql[body_start..].find(tag) {
                        Some(end) => body_start + end + tag.len(),
                        None => bytes.len(),
                    };
                    continue;
                }
                i += 1;
            }
            _ => i += 1,
        }
    }
    if start < sql.len() {
        tokens.push(Token::Text(&sql[start..]));
    }
    tokens
}

fn is_ident_byte(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b == b'_' || b == b'$' || !b.is_ascii()
}

/// Highest `$n` placeholder referenced by `sql`.
pub fn placeholder_count(sql: &str) -> usize {
    tokenize(sql)
        .iter()
        .filter_map(|t| match t {
            Token::Placeholder(n) => Some(*n),
            Token::Text(_) => None,
        })
        .max()
        .unwrap_or(0)
}

fn quote_literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

/// Replace `$n` placeholders with the bound values as SQL literals.
pub fn substitute(sql: &str, params: &[BindValue]) -> anyhow::Result<String> {
    let mut out = String::with_capacity(sql.len());
    for token in tokenize(sql) {
        match token {
            Token::Text(text) => out.push_str(text),
            Token::Placeholder(n) => {
                let value = n
                    .checked_sub(1)
                    .and_then(|idx| params.get(idx))
                    .ok_or_else(|| anyhow::anyhow!("there is no parameter ${n}"))?;
                match value {
                    BindValue::Text(text) => out.push_str(&quote_literal(text)),
                    BindValue::Null => out.push_str("NULL"),
                    BindValue::Binary(_) => {
                        anyhow::bail!("binary format for parameter ${n} is not supported")
                    }
                }
            }
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn substitutes_text_and_null() {
        let sql = "INSERT INTO users (id, name, email) VALUES ($1, $2, $3)";
        let out = substitute(
            sql,
            &[
                BindValue::Text("u1".into()),
                BindValue::Text("O'Brien".into()),
                BindValue::Null,
            ],
        )
        .unwrap();
        assert_eq!(
            out,
            "INSERT INTO users (id, name, email) VALUES ('u1', 'O''Brien', NULL)"
        );
    }

    #[test]
    fn leaves_quoted_placeholders_alone() {
        let sql = "SELECT '$1', \"$2\", $$ $1 $$, $1 -- $2\n";
        assert_eq!(placeholder_count(sql), 1);
        let out = substitute(sql, &[BindValue::Text("x".into())]).unwrap();
        assert_eq!(out, "SELECT '$1', \"$2\", $$ $1 $$, 'x' -- $2\n");
    }

    #[test]
    fn dollar_inside_identifier_is_not_a_placeholder() {
        let sql = "SELECT col$1, t$x$y FROM t$2 WHERE a = $1";
        assert_eq!(placeholder_count(sql), 1);
        let out = substitute(sql, &[BindValue::Text("v".into())]).unwrap();
        assert_eq!(out, "SELECT col$1, t$x$y FROM t$2 WHERE a = 'v'");
        // Operators and punctuation before `$` still allow a placeholder.
        assert_eq!(placeholder_count("SELECT 1+$2,($1)"), 2);
    }

    #[test]
    fn repeated_and_out_of_order_placeholders() {
        let sql = "SELECT $2, $1, $2";
        assert_eq!(placeholder_count(sql), 2);
        let out = substitute(
            sql,
            &[BindValue::Text("a".into()), BindValue::Text("b".into())],
        )
        .unwrap();
        assert_eq!(out, "SELECT 'b', 'a', 'b'");
    }

    #[test]
    fn missing_or_binary_parameter_is_an_error() {
        assert!(substitute("SELECT $1", &[]).is_err());
        assert!(substitute("SELECT $0", &[BindValue::Null]).is_err());
        assert!(substitute("SELECT $1", &[BindValue::Binary(vec![1])]).is_err());
        assert_eq!(substitute("SELECT 1", &[]).unwrap(), "SELECT 1");
    }
}
