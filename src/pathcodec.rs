//! Reversible escaping of relative resource paths into flat keys.
//!
//! Kubernetes object keys and the JSON resource bag cannot carry `/`, so every
//! character outside `[a-zA-Z.-]` is written as `_<hex code point>_`. The
//! delimiter `_` is itself outside the unreserved set, which keeps the mapping
//! injective: a literal underscore always becomes `_5f_`.

use crate::errors::ConfigSourceError;

fn is_unreserved(c: char) -> bool {
    c.is_ascii_alphabetic() || c == '-' || c == '.'
}

/// Escape a relative path, e.g. `templates/en/translation.json` becomes
/// `templates_2f_en_2f_translation.json`.
pub fn escape_path(path: &str) -> String {
    let mut out = String::with_capacity(path.len());
    for c in path.chars() {
        if is_unreserved(c) {
            out.push(c);
        } else {
            out.push_str(&format!("_{:x}_", c as u32));
        }
    }
    out
}

/// Reverse [`escape_path`].
pub fn unescape_path(key: &str) -> Result<String, ConfigSourceError> {
    let mut out = String::with_capacity(key.len());
    let mut chars = key.char_indices();

    while let Some((start, c)) = chars.next() {
        if c != '_' {
            out.push(c);
            continue;
        }

        let mut hex = String::new();
        let mut terminated = false;
        for (_, h) in chars.by_ref() {
            if h == '_' {
                terminated = true;
                break;
            }
            hex.push(h);
        }

        if !terminated {
            return Err(invalid(key, start, "unterminated escape sequence"));
        }
        if hex.is_empty() || !hex.chars().all(|h| h.is_ascii_hexdigit()) {
            return Err(invalid(key, start, "escape sequence is not hexadecimal"));
        }
        let code = u32::from_str_radix(&hex, 16)
            .map_err(|_| invalid(key, start, "escape sequence is out of range"))?;
        let decoded = char::from_u32(code)
            .ok_or_else(|| invalid(key, start, "escape sequence is not a valid code point"))?;
        out.push(decoded);
    }

    Ok(out)
}

fn invalid(key: &str, offset: usize, reason: &str) -> ConfigSourceError {
    ConfigSourceError::InvalidEscape {
        key: key.to_string(),
        reason: format!("{reason} at byte {offset}"),
    }
}
