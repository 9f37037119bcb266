use crate::messages::BackendMessage;
use crate::writer::MessageBuilder;
use pgsession_core::{SessionError, SessionResult};

impl BackendMessage {
    pub fn tag(&self) -> u8 {
        match self {
            BackendMessage::AuthenticationOk
            | BackendMessage::AuthenticationCleartextPassword
            | BackendMessage::AuthenticationMd5Password { .. } => b'R',
            BackendMessage::ParameterStatus { .. } => b'S',
            BackendMessage::BackendKeyData { .. } => b'K',
            BackendMessage::ReadyForQuery { .. } => b'Z',
            BackendMessage::ParseComplete => b'1',
            BackendMessage::BindComplete => b'2',
            BackendMessage::CloseComplete => b'3',
            BackendMessage::NoData => b'n',
            BackendMessage::EmptyQueryResponse => b'I',
            BackendMessage::PortalSuspended => b's',
            BackendMessage::ParameterDescription { .. } => b't',
            BackendMessage::RowDescription { .. } => b'T',
            BackendMessage::DataRow { .. } => b'D',
            BackendMessage::CommandComplete { .. } => b'C',
            BackendMessage::ErrorResponse(_) => b'E',
            BackendMessage::NoticeResponse { .. } => b'N',
            BackendMessage::NotificationResponse { .. } => b'A',
            BackendMessage::CopyInResponse { .. } => b'G',
            BackendMessage::CopyOutResponse { .. } => b'H',
            BackendMessage::CopyBothResponse { .. } => b'W',
            BackendMessage::CopyData { .. } => b'd',
            BackendMessage::CopyDone => b'c',
            BackendMessage::FunctionCallResponse { .. } => b'V',
        }
    }

    /// Writes the message body; the builder adds tag and length.
    pub fn encode(&self, buf: &mut MessageBuilder) -> SessionResult<()> {
        match self {
            BackendMessage::AuthenticationOk => buf.put_i32(0)?,
            BackendMessage::AuthenticationCleartextPassword => buf.put_i32(3)?,
            BackendMessage::AuthenticationMd5Password { salt } => {
                buf.put_i32(5)?;
                buf.put_bytes(salt)?;
            }
            BackendMessage::ParameterStatus { key, value } => {
                buf.put_cstring(key)?;
                buf.put_cstring(value)?;
            }
            BackendMessage::BackendKeyData { pid, secret } => {
                buf.put_i32(*pid)?;
                buf.put_i32(*secret)?;
            }
            BackendMessage::ReadyForQuery { state } => buf.put_u8(state.wire_byte())?,
            BackendMessage::ParseComplete
            | BackendMessage::BindComplete
            | BackendMessage::CloseComplete
            | BackendMessage::NoData
            | BackendMessage::EmptyQueryResponse
            | BackendMessage::PortalSuspended
            | BackendMessage::CopyDone => {}
            BackendMessage::ParameterDescription { type_oids } => {
                put_count(buf, type_oids.len(), "parameter types")?;
                for oid in type_oids {
                    buf.put_i32(*oid)?;
                }
            }
            BackendMessage::RowDescription { fields } => {
                put_count(buf, fields.len(), "columns")?;
                for field in fields {
                    buf.put_cstring(&field.name)?;
                    buf.put_i32(0)?; // table oid
                    buf.put_i16(0)?; // column attribute number
                    buf.put_i32(field.type_oid)?;
                    buf.put_i16(-1)?; // variable width
                    buf.put_i32(-1)?; // type modifier
                    buf.put_i16(0)?; // text format
                }
            }
            BackendMessage::DataRow { values } => {
                put_count(buf, values.len(), "columns")?;
                for value in values {
                    put_nullable(buf, value.as_deref())?;
                }
            }
            BackendMessage::CommandComplete { tag } => buf.put_cstring(tag)?,
            BackendMessage::ErrorResponse(report) => {
                buf.put_u8(b'S')?;
                buf.put_cstring(report.severity.as_str())?;
                buf.put_u8(b'V')?;
                buf.put_cstring(report.severity.as_str())?;
                buf.put_u8(b'C')?;
                buf.put_cstring(report.sql_state.code())?;
                buf.put_u8(b'M')?;
                buf.put_cstring(&report.message)?;
                buf.put_u8(0)?;
            }
            BackendMessage::NoticeResponse { fields } => {
                for field in fields {
                    buf.put_u8(field.code)?;
                    buf.put_cstring(&field.value)?;
                }
                buf.put_u8(0)?;
            }
            BackendMessage::NotificationResponse {
                pid,
                channel,
                payload,
            } => {
                buf.put_i32(*pid)?;
                buf.put_cstring(channel)?;
                buf.put_cstring(payload)?;
            }
            BackendMessage::CopyInResponse {
                format,
                column_formats,
            }
            | BackendMessage::CopyOutResponse {
                format,
                column_formats,
            }
            | BackendMessage::CopyBothResponse {
                format,
                column_formats,
            } => {
                buf.put_i8(*format)?;
                put_count(buf, column_formats.len(), "column formats")?;
                for code in column_formats {
                    buf.put_i16(*code)?;
                }
            }
            BackendMessage::CopyData { data } => buf.put_bytes(data)?,
            BackendMessage::FunctionCallResponse { result } => {
                put_nullable(buf, result.as_deref())?;
            }
        }
        Ok(())
    }
}

fn put_nullable(buf: &mut MessageBuilder, value: Option<&[u8]>) -> SessionResult<()> {
    match value {
        Some(bytes) => {
            let len = i32::try_from(bytes.len())
                .map_err(|_| SessionError::protocol(format!("value of {} bytes", bytes.len())))?;
            buf.put_i32(len)?;
            buf.put_bytes(bytes)
        }
        None => buf.put_i32(-1),
    }
}

/// Counts are int16 on the wire.
fn put_count(buf: &mut MessageBuilder, len: usize, what: &str) -> SessionResult<()> {
    let count = i16::try_from(len)
        .map_err(|_| SessionError::protocol(format!("{len} {what} exceed the wire limit")))?;
    buf.put_i16(count)
}
