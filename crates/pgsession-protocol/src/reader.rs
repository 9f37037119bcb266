use pgsession_core::{Charset, SessionError, SessionResult};
use std::future::Future;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, BufReader};
use tokio_util::sync::CancellationToken;

/// Upper bound for any single message or unframed string.
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;

/// A decoded null-terminated string together with the number of bytes it
/// occupied on the wire, terminator included.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CString {
    pub text: String,
    pub wire_len: usize,
}

/// Reads the protocol's primitive types from a transport.
///
/// Every read blocks until the requested bytes arrive. A read fails with a
/// stream error when the transport is exhausted, when the kill signal fires
/// or when the idle timeout elapses.
pub struct RawReader<R> {
    inner: BufReader<R>,
    charset: Charset,
    kill: CancellationToken,
    idle_timeout: Option<Duration>,
    max_message_size: usize,
}

impl<R: AsyncRead + Unpin> RawReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner: BufReader::new(inner),
            charset: Charset::default(),
            kill: CancellationToken::new(),
            idle_timeout: None,
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
        }
    }

    pub fn with_kill_signal(mut self, kill: CancellationToken) -> Self {
        self.kill = kill;
        self
    }

    pub fn with_idle_timeout(mut self, idle_timeout: Option<Duration>) -> Self {
        self.idle_timeout = idle_timeout;
        self
    }

    pub fn with_charset(mut self, charset: Charset) -> Self {
        self.charset = charset;
        self
    }

    pub fn charset(&self) -> Charset {
        self.charset
    }

    /// The token that interrupts this reader's blocking reads.
    pub fn kill_signal(&self) -> CancellationToken {
        self.kill.clone()
    }

    pub fn set_charset(&mut self, charset: Charset) {
        self.charset = charset;
    }

    pub fn max_message_size(&self) -> usize {
        self.max_message_size
    }

    pub async fn read_i32(&mut self) -> SessionResult<i32> {
        let mut buf = [0u8; 4];
        self.fill(&mut buf).await?;
        Ok(i32::from_be_bytes(buf))
    }

    pub async fn read_i16(&mut self) -> SessionResult<i16> {
        let mut buf = [0u8; 2];
        self.fill(&mut buf).await?;
        Ok(i16::from_be_bytes(buf))
    }

    pub async fn read_i8(&mut self) -> SessionResult<i8> {
        Ok(self.read_u8().await? as i8)
    }

    /// One raw byte, e.g. a message tag or a selector character.
    pub async fn read_u8(&mut self) -> SessionResult<u8> {
        let mut buf = [0u8; 1];
        self.fill(&mut buf).await?;
        Ok(buf[0])
    }

    pub async fn read_bytes(&mut self, len: usize) -> SessionResult<Vec<u8>> {
        if len > self.max_message_size {
            return Err(SessionError::protocol(format!(
                "refusing to read {len} bytes"
            )));
        }
        let mut buf = vec![0u8; len];
        self.fill(&mut buf).await?;
        Ok(buf)
    }

    /// Reads a null-terminated string of at most `limit` bytes including the
    /// terminator. Running into the limit without a terminator is a framing
    /// violation: the string would cross the message boundary.
    pub async fn read_cstring(&mut self, limit: usize) -> SessionResult<CString> {
        let Self {
            inner,
            kill,
            idle_timeout,
            charset,
            ..
        } = self;
        let mut bytes = Vec::new();
        let mut limited = (&mut *inner).take(limit as u64);
        guarded(kill, *idle_timeout, limited.read_until(0, &mut bytes)).await?;
        if bytes.last() != Some(&0) {
            if bytes.len() == limit {
                return Err(SessionError::sync(format!(
                    "string not terminated within {limit} bytes"
                )));
            }
            return Err(SessionError::Stream(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "stream ended inside a string",
            )));
        }
        let wire_len = bytes.len();
        bytes.pop();
        Ok(CString {
            text: charset.decode(&bytes).into_owned(),
            wire_len,
        })
    }

    /// Reads `len` bytes holding consecutive null-terminated strings. Only used
    /// for the startup parameter block, whose last byte must be a terminator.
    pub async fn read_string_list(&mut self, len: usize) -> SessionResult<Vec<String>> {
        let buf = self.read_bytes(len).await?;
        if buf.last() != Some(&0) {
            return Err(SessionError::protocol(
                "startup parameters are not null terminated",
            ));
        }
        Ok(buf[..buf.len() - 1]
            .split(|&b| b == 0)
            .map(|s| self.charset.decode(s).into_owned())
            .collect())
    }

    async fn fill(&mut self, buf: &mut [u8]) -> SessionResult<()> {
        let Self {
            inner,
            kill,
            idle_timeout,
            ..
        } = self;
        guarded(kill, *idle_timeout, inner.read_exact(buf)).await?;
        Ok(())
    }
}

async fn guarded<T, F>(kill: &CancellationToken, idle: Option<Duration>, read: F) -> SessionResult<T>
where
    F: Future<Output = std::io::Result<T>>,
{
    let bounded = async {
        match idle {
            Some(limit) => match tokio::time::timeout(limit, read).await {
                Ok(res) => res.map_err(SessionError::Stream),
                Err(_) => Err(SessionError::IdleTimeout(limit.as_secs())),
            },
            None => read.await.map_err(SessionError::Stream),
        }
    };
    tokio::select! {
        biased;
        _ = kill.cancelled() => Err(SessionError::Killed),
        res = bounded => res,
    }
}

/// Reads the fields of tagged messages while accounting for every byte.
///
/// `read_command` seeds a remaining-byte counter from the declared length.
/// Each field read is checked against it before touching the transport, so a
/// handler can never read into the next message, and `check_exhausted`
/// rejects a handler that left bytes behind.
pub struct FramedReader<R> {
    raw: RawReader<R>,
    remaining: usize,
}

impl<R: AsyncRead + Unpin> FramedReader<R> {
    pub fn new(raw: RawReader<R>) -> Self {
        Self { raw, remaining: 0 }
    }

    pub fn raw_mut(&mut self) -> &mut RawReader<R> {
        &mut self.raw
    }

    pub fn remaining(&self) -> usize {
        self.remaining
    }

    pub fn charset(&self) -> Charset {
        self.raw.charset()
    }

    pub fn kill_signal(&self) -> CancellationToken {
        self.raw.kill_signal()
    }

    /// Reads a tag and a declared length; returns the tag.
    pub async fn read_command(&mut self) -> SessionResult<u8> {
        let tag = self.raw.read_u8().await?;
        let len = self.raw.read_i32().await?;
        if len < 4 {
            return Err(SessionError::sync(format!(
                "message {:?} declares length {len}",
                tag as char
            )));
        }
        let body = len as usize - 4;
        if body > self.raw.max_message_size() {
            return Err(SessionError::protocol(format!(
                "message {:?} of {body} bytes exceeds the size limit",
                tag as char
            )));
        }
        self.remaining = body;
        Ok(tag)
    }

    pub async fn read_i32(&mut self) -> SessionResult<i32> {
        self.consume(4)?;
        self.raw.read_i32().await
    }

    pub async fn read_i16(&mut self) -> SessionResult<i16> {
        self.consume(2)?;
        self.raw.read_i16().await
    }

    pub async fn read_i8(&mut self) -> SessionResult<i8> {
        self.consume(1)?;
        self.raw.read_i8().await
    }

    pub async fn read_u8(&mut self) -> SessionResult<u8> {
        self.consume(1)?;
        self.raw.read_u8().await
    }

    pub async fn read_cstring(&mut self) -> SessionResult<String> {
        if self.remaining == 0 {
            return Err(SessionError::sync("no bytes left for a string"));
        }
        let s = self.raw.read_cstring(self.remaining).await?;
        self.remaining -= s.wire_len;
        Ok(s.text)
    }

    pub async fn read_bytes(&mut self, len: usize) -> SessionResult<Vec<u8>> {
        self.consume(len)?;
        self.raw.read_bytes(len).await
    }

    /// Everything left in the current message.
    pub async fn read_rest(&mut self) -> SessionResult<Vec<u8>> {
        let len = self.remaining;
        self.read_bytes(len).await
    }

    pub fn check_exhausted(&self) -> SessionResult<()> {
        if self.remaining != 0 {
            return Err(SessionError::sync(format!(
                "{} unread bytes at end of message",
                self.remaining
            )));
        }
        Ok(())
    }

    fn consume(&mut self, len: usize) -> SessionResult<()> {
        if len > self.remaining {
            return Err(SessionError::sync(format!(
                "read of {len} bytes past message boundary ({} left)",
                self.remaining
            )));
        }
        self.remaining -= len;
        Ok(())
    }
}
