use crate::messages::BackendMessage;
use bytes::{BufMut, BytesMut};
use pgsession_core::{Charset, SessionError, SessionResult};
use std::time::Duration;
use tokio::io::{AsyncWrite, AsyncWriteExt};

/// Accumulates the fields of one outbound message.
///
/// The builder is single-use: once `finish` has produced the frame, further
/// field writes fail with `BuilderFlushed` and `finish` yields nothing.
/// Strings are encoded in the builder's charset.
#[derive(Debug)]
pub struct MessageBuilder {
    tag: Option<u8>,
    body: BytesMut,
    flushed: bool,
    charset: Charset,
}

impl MessageBuilder {
    pub fn new(tag: Option<u8>) -> Self {
        Self::with_charset(tag, Charset::default())
    }

    pub fn with_charset(tag: Option<u8>, charset: Charset) -> Self {
        Self {
            tag,
            body: BytesMut::new(),
            flushed: false,
            charset,
        }
    }

    pub fn put_i32(&mut self, value: i32) -> SessionResult<()> {
        self.writable()?.put_i32(value);
        Ok(())
    }

    pub fn put_i16(&mut self, value: i16) -> SessionResult<()> {
        self.writable()?.put_i16(value);
        Ok(())
    }

    pub fn put_i8(&mut self, value: i8) -> SessionResult<()> {
        self.writable()?.put_i8(value);
        Ok(())
    }

    pub fn put_u8(&mut self, value: u8) -> SessionResult<()> {
        self.writable()?.put_u8(value);
        Ok(())
    }

    pub fn put_bytes(&mut self, value: &[u8]) -> SessionResult<()> {
        self.writable()?.extend_from_slice(value);
        Ok(())
    }

    /// Text after an interior NUL is dropped: the client would read it as
    /// the start of the next field.
    pub fn put_cstring(&mut self, value: &str) -> SessionResult<()> {
        let charset = self.charset;
        let text = value.split('\0').next().unwrap_or_default();
        let body = self.writable()?;
        body.extend_from_slice(&charset.encode(text));
        body.put_u8(0);
        Ok(())
    }

    pub fn is_flushed(&self) -> bool {
        self.flushed
    }

    /// Produces the framed bytes: tag (when present), then the length of the
    /// length field plus body, then the body. `None` once already finished.
    pub fn finish(&mut self) -> Option<BytesMut> {
        if self.flushed {
            return None;
        }
        self.flushed = true;
        let body = std::mem::take(&mut self.body);
        let mut frame = BytesMut::with_capacity(body.len() + 5);
        if let Some(tag) = self.tag {
            frame.put_u8(tag);
        }
        frame.put_i32((body.len() + 4) as i32);
        frame.extend_from_slice(&body);
        Some(frame)
    }

    fn writable(&mut self) -> SessionResult<&mut BytesMut> {
        if self.flushed {
            return Err(SessionError::BuilderFlushed);
        }
        Ok(&mut self.body)
    }
}

/// The outbound half of a session's transport.
///
/// With a write timeout set, a frame the peer does not take within the
/// limit fails with `IdleTimeout`.
pub struct BackendWriter<W> {
    inner: W,
    charset: Charset,
    write_timeout: Option<Duration>,
}

impl<W: AsyncWrite + Unpin> BackendWriter<W> {
    pub fn new(inner: W) -> Self {
        Self {
            inner,
            charset: Charset::default(),
            write_timeout: None,
        }
    }

    pub fn with_write_timeout(mut self, write_timeout: Option<Duration>) -> Self {
        self.write_timeout = write_timeout;
        self
    }

    pub fn charset(&self) -> Charset {
        self.charset
    }

    pub fn set_charset(&mut self, charset: Charset) {
        self.charset = charset;
    }

    /// Builds one message with `build` and writes it. The frame is flushed
    /// whether `build` succeeds or not; its error is returned afterwards.
    pub async fn message<F>(&mut self, tag: Option<u8>, build: F) -> SessionResult<()>
    where
        F: FnOnce(&mut MessageBuilder) -> SessionResult<()>,
    {
        let mut builder = MessageBuilder::with_charset(tag, self.charset);
        let built = build(&mut builder);
        self.flush_builder(&mut builder).await?;
        built
    }

    pub async fn write_message(&mut self, msg: &BackendMessage) -> SessionResult<()> {
        self.message(Some(msg.tag()), |builder| msg.encode(builder))
            .await
    }

    /// A single unframed byte, as used to refuse SSL/GSS encryption.
    pub async fn write_raw_byte(&mut self, byte: u8) -> SessionResult<()> {
        self.send_bytes(&[byte]).await
    }

    pub async fn flush(&mut self) -> SessionResult<()> {
        self.inner.flush().await?;
        Ok(())
    }

    pub async fn shutdown(&mut self) -> SessionResult<()> {
        self.inner.shutdown().await?;
        Ok(())
    }

    async fn flush_builder(&mut self, builder: &mut MessageBuilder) -> SessionResult<()> {
        match builder.finish() {
            Some(frame) => self.send_bytes(&frame).await,
            None => Ok(()),
        }
    }

    async fn send_bytes(&mut self, bytes: &[u8]) -> SessionResult<()> {
        let Self {
            inner,
            write_timeout,
            ..
        } = self;
        let write = async {
            inner.write_all(bytes).await?;
            inner.flush().await
        };
        match *write_timeout {
            Some(limit) => match tokio::time::timeout(limit, write).await {
                Ok(res) => res?,
                Err(_) => return Err(SessionError::IdleTimeout(limit.as_secs())),
            },
            None => write.await?,
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_rejects_writes_after_finish() {
        let mut builder = MessageBuilder::new(Some(b'C'));
        builder.put_cstring("SELECT 1").expect("put");
        let frame = builder.finish().expect("frame");
        assert_eq!(&frame[..], b"C\0\0\0\x0dSELECT 1\0");
        assert!(builder.is_flushed());
        assert!(matches!(
            builder.put_i32(1),
            Err(SessionError::BuilderFlushed)
        ));
        assert!(builder.finish().is_none());
    }

    #[test]
    fn untagged_frame_has_only_length() {
        let mut builder = MessageBuilder::new(None);
        builder.put_i32(196608).expect("put");
        let frame = builder.finish().expect("frame");
        assert_eq!(&frame[..], &[0, 0, 0, 8, 0, 3, 0, 0]);
    }

    #[tokio::test]
    async fn failed_build_still_flushes_partial_message() {
        let mut out = Vec::new();
        let mut writer = BackendWriter::new(&mut out);
        let res = writer
            .message(Some(b'N'), |builder| {
                builder.put_u8(b'M')?;
                Err(SessionError::protocol("stop"))
            })
            .await;
        assert!(matches!(res, Err(SessionError::Protocol(_))));
        assert_eq!(out, vec![b'N', 0, 0, 0, 5, b'M']);
    }

    #[test]
    fn strings_use_builder_charset() {
        let mut builder = MessageBuilder::with_charset(Some(b'C'), Charset::Latin1);
        builder.put_cstring("caf\u{e9}").expect("put");
        let frame = builder.finish().expect("frame");
        assert_eq!(&frame[..], &[b'C', 0, 0, 0, 9, b'c', b'a', b'f', 0xe9, 0]);

        let mut builder = MessageBuilder::new(Some(b'C'));
        builder.put_cstring("caf\u{e9}").expect("put");
        let frame = builder.finish().expect("frame");
        assert_eq!(&frame[5..], "caf\u{e9}\0".as_bytes());
    }

    #[test]
    fn interior_nul_ends_string() {
        let mut builder = MessageBuilder::new(Some(b'C'));
        builder.put_cstring("bad\0tail").expect("put");
        builder.put_i16(7).expect("put");
        let frame = builder.finish().expect("frame");
        assert_eq!(&frame[..], &[b'C', 0, 0, 0, 10, b'b', b'a', b'd', 0, 0, 7]);
    }

    #[tokio::test(start_paused = true)]
    async fn stalled_peer_times_out_write() {
        let (_client, server) = tokio::io::duplex(8);
        let mut writer =
            BackendWriter::new(server).with_write_timeout(Some(Duration::from_secs(3)));
        let res = writer
            .message(Some(b'C'), |builder| builder.put_cstring("SELECT 12345"))
            .await;
        assert!(matches!(res, Err(SessionError::IdleTimeout(3))));
    }
}
