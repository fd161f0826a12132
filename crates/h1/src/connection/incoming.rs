use std::fmt;
use std::io;

use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::trace;

/// Bytes reserved for each read from the transport.
const READ_SIZE: usize = 8 * 1024;

/// The read half of the transport with the bytes received but not parsed yet.
///
/// Request heads and bodies are decoded straight out of [`Incoming::buffer_mut`]; bytes past the
/// current message stay there for the next pipelined request.
pub struct Incoming {
    io: Box<dyn AsyncRead + Send + Unpin>,
    buf: BytesMut,
    eof: bool,
}

impl Incoming {
    pub fn new<R>(io: R) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
    {
        Self { io: Box::new(io), buf: BytesMut::new(), eof: false }
    }

    pub fn buffer(&self) -> &BytesMut {
        &self.buf
    }

    pub fn buffer_mut(&mut self) -> &mut BytesMut {
        &mut self.buf
    }

    /// Whether the peer closed its sending side.
    pub fn is_eof(&self) -> bool {
        self.eof
    }

    /// Reads more bytes from the transport, returning how many arrived. `0` means end of stream.
    ///
    /// With no spare capacity left, a zero-length read waits for the transport to become
    /// readable before memory is reserved for the real read.
    pub async fn fill(&mut self) -> io::Result<usize> {
        if self.eof {
            return Ok(0);
        }

        if self.buf.len() == self.buf.capacity() {
            let mut probe = [0u8; 0];
            let _ = self.io.read(&mut probe).await?;
        }

        self.buf.reserve(READ_SIZE);
        let n = self.io.read_buf(&mut self.buf).await?;
        trace!(n, buffered = self.buf.len(), "read from transport");
        if n == 0 {
            self.eof = true;
        }
        Ok(n)
    }
}

impl fmt::Debug for Incoming {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Incoming").field("buffered", &self.buf.len()).field("eof", &self.eof).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::pin::Pin;
    use std::sync::{Arc, Mutex};
    use std::task::{Context, Poll};
    use tokio::io::{AsyncWriteExt, ReadBuf};

    /// Serves `data` and records the buffer size of every read it sees.
    struct RecordingReader {
        data: Vec<u8>,
        reads: Arc<Mutex<Vec<usize>>>,
    }

    impl AsyncRead for RecordingReader {
        fn poll_read(self: Pin<&mut Self>, _cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
            let this = self.get_mut();
            this.reads.lock().unwrap().push(buf.remaining());
            let n = buf.remaining().min(this.data.len());
            buf.put_slice(&this.data[..n]);
            this.data.drain(..n);
            Poll::Ready(Ok(()))
        }
    }

    #[tokio::test]
    async fn zero_length_read_comes_before_reserving() {
        let reads = Arc::new(Mutex::new(Vec::new()));
        let reader = RecordingReader { data: b"GET / HTTP/1.1\r\n\r\n".to_vec(), reads: Arc::clone(&reads) };
        let mut incoming = Incoming::new(reader);

        assert_eq!(incoming.fill().await.unwrap(), 18);
        {
            let reads = reads.lock().unwrap();
            assert_eq!(reads.len(), 2);
            assert_eq!(reads[0], 0);
            assert!(reads[1] >= READ_SIZE);
        }

        // spare capacity left, no probe this time
        assert_eq!(incoming.fill().await.unwrap(), 0);
        let reads = reads.lock().unwrap();
        assert_eq!(reads.len(), 3);
        assert!(reads[2] > 0);
    }

    #[tokio::test]
    async fn fill_appends_until_eof() {
        let (mut client, server) = tokio::io::duplex(64);
        let mut incoming = Incoming::new(server);

        client.write_all(b"GET / HTTP/1.1\r\n").await.unwrap();
        let n = incoming.fill().await.unwrap();
        assert_eq!(n, 16);

        client.write_all(b"\r\n").await.unwrap();
        incoming.fill().await.unwrap();
        assert_eq!(&incoming.buffer()[..], b"GET / HTTP/1.1\r\n\r\n");

        drop(client);
        assert_eq!(incoming.fill().await.unwrap(), 0);
        assert!(incoming.is_eof());
        assert_eq!(incoming.fill().await.unwrap(), 0);
    }
}
