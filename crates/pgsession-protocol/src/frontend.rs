use crate::messages::{
    CloseTarget, DescribeTarget, FrontendMessage, StartupRequest, CANCEL_REQUEST_CODE,
    GSSENC_REQUEST_CODE, PROTOCOL_VERSION, SSL_REQUEST_CODE,
};
use crate::reader::{FramedReader, RawReader};
use pgsession_core::{SessionError, SessionResult};
use std::collections::HashMap;
use tokio::io::AsyncRead;
use tracing::debug;

/// PostgreSQL itself refuses startup packets above this size.
const MAX_STARTUP_PACKET: i32 = 10_000;

/// Reads the untagged first packet. A protocol version other than 3.0 is
/// reported as `UnrecognizedVersion` without consuming the parameters.
pub async fn read_startup<R: AsyncRead + Unpin>(
    raw: &mut RawReader<R>,
) -> SessionResult<StartupRequest> {
    let len = raw.read_i32().await?;
    let code = raw.read_i32().await?;
    match (len, code) {
        (8, SSL_REQUEST_CODE) => return Ok(StartupRequest::SslRequest),
        (8, GSSENC_REQUEST_CODE) => return Ok(StartupRequest::GssEncRequest),
        (16, CANCEL_REQUEST_CODE) => {
            let process_id = raw.read_i32().await?;
            let secret_key = raw.read_i32().await?;
            return Ok(StartupRequest::CancelRequest {
                process_id,
                secret_key,
            });
        }
        _ => {}
    }
    if code != PROTOCOL_VERSION {
        debug!(len, code, "startup with unsupported protocol version");
        return Err(SessionError::UnrecognizedVersion(code));
    }
    if !(9..=MAX_STARTUP_PACKET).contains(&len) {
        return Err(SessionError::protocol(format!(
            "invalid startup packet length {len}"
        )));
    }
    let strings = raw.read_string_list(len as usize - 8).await?;
    Ok(StartupRequest::Startup {
        protocol_version: code,
        params: pair_params(strings)?,
    })
}

fn pair_params(strings: Vec<String>) -> SessionResult<HashMap<String, String>> {
    let mut params = HashMap::new();
    let mut iter = strings.into_iter();
    while let Some(key) = iter.next() {
        if key.is_empty() {
            break;
        }
        let value = iter
            .next()
            .ok_or_else(|| SessionError::protocol(format!("startup parameter {key} has no value")))?;
        params.insert(key, value);
    }
    Ok(params)
}

/// Reads the PasswordMessage demanded after AuthenticationCleartextPassword.
/// The declared length must match the bytes the password took on the wire.
pub async fn read_password<R: AsyncRead + Unpin>(raw: &mut RawReader<R>) -> SessionResult<String> {
    let tag = raw.read_u8().await?;
    if tag != b'p' {
        return Err(SessionError::protocol(format!(
            "expected password message, got {:?}",
            tag as char
        )));
    }
    let len = raw.read_i32().await?;
    if len < 5 {
        return Err(SessionError::sync(format!(
            "password message declares length {len}"
        )));
    }
    let body = len as usize - 4;
    let password = raw.read_cstring(body.min(raw.max_message_size())).await?;
    if password.wire_len != body {
        return Err(SessionError::sync(format!(
            "password message declares {body} bytes but carried {}",
            password.wire_len
        )));
    }
    Ok(password.text)
}

/// Reads one tagged message. The caller checks `check_exhausted` afterwards.
pub async fn read_message<R: AsyncRead + Unpin>(
    reader: &mut FramedReader<R>,
) -> SessionResult<FrontendMessage> {
    let tag = reader.read_command().await?;
    let msg = match tag {
        b'Q' => FrontendMessage::Query {
            sql: reader.read_cstring().await?,
        },
        b'P' => {
            let statement_name = reader.read_cstring().await?;
            let query = reader.read_cstring().await?;
            let count = read_count(reader).await?;
            let mut param_oids = Vec::with_capacity(count);
            for _ in 0..count {
                param_oids.push(reader.read_i32().await?);
            }
            FrontendMessage::Parse {
                statement_name,
                query,
                param_oids,
            }
        }
        b'B' => {
            let portal_name = reader.read_cstring().await?;
            let statement_name = reader.read_cstring().await?;
            let param_format_codes = read_i16_list(reader).await?;
            let count = read_count(reader).await?;
            let mut param_values = Vec::with_capacity(count);
            for _ in 0..count {
                param_values.push(read_nullable(reader).await?);
            }
            let result_format_codes = read_i16_list(reader).await?;
            FrontendMessage::Bind {
                portal_name,
                statement_name,
                param_format_codes,
                param_values,
                result_format_codes,
            }
        }
        b'D' => {
            let target = match reader.read_u8().await? {
                b'S' => DescribeTarget::Statement,
                b'P' => DescribeTarget::Portal,
                other => {
                    return Err(SessionError::protocol(format!(
                        "unrecognized describe target {:?}",
                        other as char
                    )))
                }
            };
            FrontendMessage::Describe {
                target,
                name: reader.read_cstring().await?,
            }
        }
        b'E' => FrontendMessage::Execute {
            portal_name: reader.read_cstring().await?,
            max_rows: reader.read_i32().await?,
        },
        b'C' => {
            let target = match reader.read_u8().await? {
                b'S' => CloseTarget::Statement,
                b'P' => CloseTarget::Portal,
                other => {
                    return Err(SessionError::protocol(format!(
                        "unrecognized close target {:?}",
                        other as char
                    )))
                }
            };
            FrontendMessage::Close {
                target,
                name: reader.read_cstring().await?,
            }
        }
        b'H' => FrontendMessage::Flush,
        b'S' => FrontendMessage::Sync,
        b'F' => {
            let object_id = reader.read_i32().await?;
            let arg_format_codes = read_i16_list(reader).await?;
            let count = read_count(reader).await?;
            let mut args = Vec::with_capacity(count);
            for _ in 0..count {
                args.push(read_nullable(reader).await?);
            }
            FrontendMessage::FunctionCall {
                object_id,
                arg_format_codes,
                args,
                result_format: reader.read_i16().await?,
            }
        }
        b'd' => FrontendMessage::CopyData {
            data: reader.read_rest().await?,
        },
        b'c' => FrontendMessage::CopyDone,
        b'f' => FrontendMessage::CopyFail {
            message: reader.read_cstring().await?,
        },
        b'X' => FrontendMessage::Terminate,
        other => {
            debug!(tag = other, remaining = reader.remaining(), "unknown frontend command");
            return Err(SessionError::UnknownCommand(other));
        }
    };
    Ok(msg)
}

async fn read_count<R: AsyncRead + Unpin>(reader: &mut FramedReader<R>) -> SessionResult<usize> {
    let count = reader.read_i16().await?;
    usize::try_from(count)
        .map_err(|_| SessionError::protocol(format!("negative element count {count}")))
}

async fn read_i16_list<R: AsyncRead + Unpin>(
    reader: &mut FramedReader<R>,
) -> SessionResult<Vec<i16>> {
    let count = read_count(reader).await?;
    let mut codes = Vec::with_capacity(count);
    for _ in 0..count {
        codes.push(reader.read_i16().await?);
    }
    Ok(codes)
}

/// A length-prefixed value; length -1 is SQL NULL.
async fn read_nullable<R: AsyncRead + Unpin>(
    reader: &mut FramedReader<R>,
) -> SessionResult<Option<Vec<u8>>> {
    let len = reader.read_i32().await?;
    match len {
        -1 => Ok(None),
        n if n < 0 => Err(SessionError::protocol(format!("invalid value length {n}"))),
        n => Ok(Some(reader.read_bytes(n as usize).await?)),
    }
}
