//! Item key parsing.
//!
//! A key is a metric name optionally followed by a bracketed, comma
//! separated parameter list: `vfs.fs.size[/,pused]`. Parameters may be
//! quoted (`"a, b"`, with `\"` escaping a quote) or be a bracketed array
//! (`[a,b]`), which is returned unparsed without the outer brackets.

/// Errors produced while parsing an item key.
///
/// # Examples
///
/// ```
/// use hostmon_common::itemutil::{parse_key, KeyError};
///
/// assert_eq!(parse_key(""), Err(KeyError::Empty));
/// assert!(parse_key("cpu[1").unwrap_err().to_string().contains("unterminated"));
/// ```
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum KeyError {
    #[error("key is empty")]
    Empty,

    #[error("invalid character '{ch}' at position {pos} in key '{key}'")]
    InvalidChar { key: String, ch: char, pos: usize },

    #[error("unterminated parameter list in key '{0}'")]
    Unterminated(String),

    #[error("unexpected data after parameter list in key '{0}'")]
    TrailingData(String),
}

pub type Result<T> = std::result::Result<T, KeyError>;

fn is_name_char(c: u8) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, b'.' | b'_' | b'-')
}

/// Splits `key` into its metric name and parameters.
///
/// # Examples
///
/// ```
/// use hostmon_common::itemutil::parse_key;
///
/// let (name, params) = parse_key(r#"net.if.in[eth0,"bytes"]"#).unwrap();
/// assert_eq!(name, "net.if.in");
/// assert_eq!(params, vec!["eth0", "bytes"]);
/// ```
pub fn parse_key(key: &str) -> Result<(String, Vec<String>)> {
    let bytes = key.as_bytes();
    let name_len = bytes.iter().take_while(|b| is_name_char(**b)).count();
    if name_len == 0 {
        return match key.chars().next() {
            None => Err(KeyError::Empty),
            Some(ch) => Err(KeyError::InvalidChar {
                key: key.to_string(),
                ch,
                pos: 0,
            }),
        };
    }

    let name = key[..name_len].to_string();
    if name_len == bytes.len() {
        return Ok((name, Vec::new()));
    }
    if bytes[name_len] != b'[' {
        return Err(KeyError::InvalidChar {
            key: key.to_string(),
            ch: key[name_len..].chars().next().unwrap_or('?'),
            pos: name_len,
        });
    }

    let params = parse_params(key, name_len + 1)?;
    Ok((name, params))
}

/// Parses the parameter list starting right after the opening bracket.
fn parse_params(key: &str, start: usize) -> Result<Vec<String>> {
    let bytes = key.as_bytes();
    let unterminated = || KeyError::Unterminated(key.to_string());
    let mut params = Vec::new();
    let mut pos = start;

    loop {
        while pos < bytes.len() && bytes[pos] == b' ' {
            pos += 1;
        }
        if pos >= bytes.len() {
            return Err(unterminated());
        }

        let param = match bytes[pos] {
            b'"' => {
                let mut value = String::new();
                pos += 1;
                loop {
                    match bytes.get(pos) {
                        None => return Err(unterminated()),
                        Some(b'\\') if bytes.get(pos + 1) == Some(&b'"') => {
                            value.push('"');
                            pos += 2;
                        }
                        Some(b'"') => {
                            pos += 1;
                            break;
                        }
                        Some(_) => {
                            let ch = key[pos..].chars().next().ok_or_else(unterminated)?;
                            value.push(ch);
                            pos += ch.len_utf8();
                        }
                    }
                }
                while pos < bytes.len() && bytes[pos] == b' ' {
                    pos += 1;
                }
                value
            }
            b'[' => {
                let open = pos + 1;
                let mut quoted = false;
                pos = open;
                loop {
                    match bytes.get(pos) {
                        None => return Err(unterminated()),
                        Some(b'\\') if quoted && bytes.get(pos + 1) == Some(&b'"') => pos += 2,
                        Some(b'"') => {
                            quoted = !quoted;
                            pos += 1;
                        }
                        Some(b']') if !quoted => break,
                        Some(_) => pos += 1,
                    }
                }
                let value = key[open..pos].to_string();
                pos += 1;
                while pos < bytes.len() && bytes[pos] == b' ' {
                    pos += 1;
                }
                value
            }
            _ => {
                let begin = pos;
                while pos < bytes.len() && bytes[pos] != b',' && bytes[pos] != b']' {
                    pos += 1;
                }
                key[begin..pos].to_string()
            }
        };
        params.push(param);

        match bytes.get(pos) {
            Some(b',') => pos += 1,
            Some(b']') => {
                if pos + 1 != bytes.len() {
                    return Err(KeyError::TrailingData(key.to_string()));
                }
                return Ok(params);
            }
            Some(_) => {
                return Err(KeyError::InvalidChar {
                    key: key.to_string(),
                    ch: key[pos..].chars().next().unwrap_or('?'),
                    pos,
                })
            }
            None => return Err(unterminated()),
        }
    }
}
