//! Textual parameter binding for prepared statements.
//!
//! Placeholders are `$n`, 1-based, recognised outside single-quoted literals
//! only. There is no SQL parser here: a `$n` that sits outside quotes is a
//! placeholder even where SQL would read it differently (dollar-quoted
//! strings, for instance).

use pgsession_core::{Charset, ErrorReport, SqlState};
use pgsession_protocol::FormatCode;

/// Substitutes `params[n - 1]` for every `$n` outside quotes, in one pass.
///
/// Every parameter must be used at least once, and no `$k` with `k` one past
/// the last parameter may remain. Other out-of-range placeholders, such as
/// `$0`, are left as written.
pub fn bind(sql: &str, params: &[String]) -> Result<String, ErrorReport> {
    let mut out = String::with_capacity(sql.len());
    let mut used = vec![false; params.len()];
    let mut dangling = false;
    let mut quoted = false;
    let mut chars = sql.char_indices().peekable();

    while let Some((_, c)) = chars.next() {
        if c == '\'' {
            quoted = !quoted;
        }
        if c != '$' || quoted {
            out.push(c);
            continue;
        }
        let mut digits = String::new();
        while let Some(&(_, d)) = chars.peek() {
            if !d.is_ascii_digit() {
                break;
            }
            digits.push(d);
            chars.next();
        }
        match digits.parse::<usize>() {
            Ok(n) if (1..=params.len()).contains(&n) => {
                out.push_str(&params[n - 1]);
                used[n - 1] = true;
            }
            Ok(n) => {
                if n == params.len() + 1 {
                    dangling = true;
                }
                out.push('$');
                out.push_str(&digits);
            }
            Err(_) => {
                out.push('$');
                out.push_str(&digits);
            }
        }
    }

    if let Some(unused) = used.iter().position(|u| !u) {
        return Err(ErrorReport::error(
            SqlState::ProtocolViolation,
            format!("missing placeholder for parameter number {}", unused + 1),
        ));
    }
    if dangling {
        return Err(ErrorReport::error(
            SqlState::ProtocolViolation,
            format!(
                "missing parameter for placeholder number {}",
                params.len() + 1
            ),
        ));
    }
    Ok(out)
}

/// Renders one Bind parameter as an SQL literal.
///
/// Text values are quoted with embedded quotes doubled. Binary values are
/// read as big-endian integers of one to four bytes; four bytes are signed.
pub fn parameter_literal(
    format: FormatCode,
    value: Option<&[u8]>,
    charset: Charset,
) -> Result<String, ErrorReport> {
    let Some(bytes) = value else {
        return Ok("NULL".to_string());
    };
    match format {
        FormatCode::Text => {
            let text = charset.decode(bytes);
            Ok(format!("'{}'", text.replace('\'', "''")))
        }
        FormatCode::Binary => match bytes.len() {
            0 => Err(ErrorReport::error(
                SqlState::InvalidBinaryRepresentation,
                "binary parameter has no bytes",
            )),
            4 => Ok(i32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]).to_string()),
            n if n < 4 => Ok(bytes
                .iter()
                .fold(0u32, |acc, &b| (acc << 8) | u32::from(b))
                .to_string()),
            n => Err(ErrorReport::unsupported(format!(
                "binary parameter of {n} bytes"
            ))),
        },
    }
}

/// True when `;` ends a statement that is followed by another one.
pub fn is_multi_statement(sql: &str) -> bool {
    let mut quoted = false;
    let mut ended = false;
    for c in sql.chars() {
        if ended && !c.is_whitespace() && c != ';' {
            return true;
        }
        match c {
            '\'' => quoted = !quoted,
            ';' if !quoted => ended = true,
            _ => {}
        }
    }
    false
}
