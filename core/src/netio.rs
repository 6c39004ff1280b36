/*
 * netio.rs
 * Copyright (C) 2026 Chris Burdess
 *
 * This file is part of Bastione, an SMTP server and client suite.
 *
 * Bastione is free software: you can redistribute it and/or modify
 * it under the terms of the GNU General Public License as published by
 * the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * Bastione is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
 * GNU General Public License for more details.
 *
 * You should have received a copy of the GNU General Public License
 * along with Bastione.  If not, see <http://www.gnu.org/licenses/>.
 */

//! SMTP line I/O: strict CRLF framing, 1000-char line ceiling, binary reads
//! for BDAT, timed reads and writes. TLS (server or client side) is a
//! transparent substitute for the plain socket once negotiated.

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll, RawWaker, RawWakerVTable, Waker};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::net::TcpStream;

/// Maximum SMTP line length excluding the CRLF terminator (RFC 5321 text line).
pub const MAX_LINE: usize = 1000;

/// Line buffer capacity: the line plus its CRLF.
const LINE_BUF: usize = MAX_LINE + 2;

/// Network layer error. Timeout and PeerClosed are terminal for the session.
#[derive(Debug)]
pub enum NetError {
    /// No data within the configured window.
    Timeout,
    /// Read returned zero bytes: the peer dropped the connection.
    PeerClosed,
    /// Lone CR or lone LF, or CR not followed by LF.
    BadCrlf,
    /// More than MAX_LINE characters before the CRLF; input has been drained
    /// up to the next line terminator.
    LineTooLong,
    Io(io::Error),
}

impl std::fmt::Display for NetError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NetError::Timeout => write!(f, "connection timed out"),
            NetError::PeerClosed => write!(f, "connection died"),
            NetError::BadCrlf => write!(f, "bad <CRLF> sequence"),
            NetError::LineTooLong => write!(f, "line too long"),
            NetError::Io(e) => write!(f, "{}", e),
        }
    }
}

impl std::error::Error for NetError {}

impl From<io::Error> for NetError {
    fn from(e: io::Error) -> Self {
        NetError::Io(e)
    }
}

/// The transport under a session: plain TCP, or TLS in either role.
/// `Closed` is the placeholder while a STARTTLS handshake owns the socket.
pub enum SmtpStream {
    Plain(TcpStream),
    ServerTls(Box<tokio_rustls::server::TlsStream<TcpStream>>),
    ClientTls(Box<tokio_rustls::client::TlsStream<TcpStream>>),
    Closed,
}

impl SmtpStream {
    pub fn is_encrypted(&self) -> bool {
        matches!(self, SmtpStream::ServerTls(_) | SmtpStream::ClientTls(_))
    }
}

impl AsyncRead for SmtpStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            SmtpStream::Plain(s) => Pin::new(s).poll_read(cx, buf),
            SmtpStream::ServerTls(s) => Pin::new(s.as_mut()).poll_read(cx, buf),
            SmtpStream::ClientTls(s) => Pin::new(s.as_mut()).poll_read(cx, buf),
            SmtpStream::Closed => Poll::Ready(Err(io::Error::new(
                io::ErrorKind::NotConnected,
                "stream closed",
            ))),
        }
    }
}

impl AsyncWrite for SmtpStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            SmtpStream::Plain(s) => Pin::new(s).poll_write(cx, buf),
            SmtpStream::ServerTls(s) => Pin::new(s.as_mut()).poll_write(cx, buf),
            SmtpStream::ClientTls(s) => Pin::new(s.as_mut()).poll_write(cx, buf),
            SmtpStream::Closed => Poll::Ready(Err(io::Error::new(
                io::ErrorKind::NotConnected,
                "stream closed",
            ))),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            SmtpStream::Plain(s) => Pin::new(s).poll_flush(cx),
            SmtpStream::ServerTls(s) => Pin::new(s.as_mut()).poll_flush(cx),
            SmtpStream::ClientTls(s) => Pin::new(s.as_mut()).poll_flush(cx),
            SmtpStream::Closed => Poll::Ready(Ok(())),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            SmtpStream::Plain(s) => Pin::new(s).poll_shutdown(cx),
            SmtpStream::ServerTls(s) => Pin::new(s.as_mut()).poll_shutdown(cx),
            SmtpStream::ClientTls(s) => Pin::new(s.as_mut()).poll_shutdown(cx),
            SmtpStream::Closed => Poll::Ready(Ok(())),
        }
    }
}

/// Buffered SMTP connection. Owns the stream, the carry-over buffer for
/// pipelined input, and the session timeout.
pub struct Conn {
    stream: SmtpStream,
    /// Bytes already read from the socket that belong to later lines.
    pending: Vec<u8>,
    timeout: Duration,
}

impl Conn {
    pub fn new(stream: SmtpStream, timeout: Duration) -> Self {
        Self {
            stream,
            pending: Vec::with_capacity(LINE_BUF),
            timeout,
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = timeout;
    }

    pub fn is_encrypted(&self) -> bool {
        self.stream.is_encrypted()
    }

    /// Take the raw stream out for a TLS handshake; leaves `Closed` behind.
    pub fn take_stream(&mut self) -> SmtpStream {
        std::mem::replace(&mut self.stream, SmtpStream::Closed)
    }

    /// Install the post-handshake stream. The carry-over buffer is discarded:
    /// after STARTTLS nothing read before the handshake may survive.
    pub fn set_stream(&mut self, stream: SmtpStream) {
        self.stream = stream;
        self.pending.clear();
    }

    /// True if input is already buffered or readable right now without
    /// blocking. Used to detect pipelining violations.
    pub fn data_pending(&mut self) -> bool {
        if !self.pending.is_empty() {
            return true;
        }
        // Nonblocking probe: poll the stream once with a no-op waker and
        // stash whatever is ready into the carry-over buffer.
        let mut probe = [0u8; 512];
        let mut buf = ReadBuf::new(&mut probe);
        let waker = noop_waker();
        let mut cx = Context::from_waker(&waker);
        match Pin::new(&mut self.stream).poll_read(&mut cx, &mut buf) {
            Poll::Ready(Ok(())) if !buf.filled().is_empty() => {
                self.pending.extend_from_slice(buf.filled());
                true
            }
            _ => false,
        }
    }

    /// Drop all buffered input (after the pipelining guard replied 550).
    pub fn discard_pending(&mut self) {
        self.pending.clear();
    }

    async fn fill(&mut self) -> Result<usize, NetError> {
        let mut buf = [0u8; LINE_BUF];
        let n = match tokio::time::timeout(self.timeout, self.stream.read(&mut buf)).await {
            Err(_) => return Err(NetError::Timeout),
            Ok(Err(e)) => {
                if e.kind() == io::ErrorKind::ConnectionReset {
                    return Err(NetError::PeerClosed);
                }
                return Err(NetError::Io(e));
            }
            Ok(Ok(n)) => n,
        };
        if n == 0 {
            return Err(NetError::PeerClosed);
        }
        self.pending.extend_from_slice(&buf[..n]);
        Ok(n)
    }

    /// Read one line terminated by CRLF exactly; returns the payload without
    /// the terminator. Lone CR or LF is `BadCrlf`; a payload longer than
    /// MAX_LINE drains input up to the next LF and fails with `LineTooLong`
    /// so the session can resynchronize.
    pub async fn read_line(&mut self) -> Result<Vec<u8>, NetError> {
        loop {
            if let Some(i) = self.pending.iter().position(|&b| b == b'\n') {
                if i == 0 || self.pending[i - 1] != b'\r' {
                    self.pending.drain(..=i);
                    return Err(NetError::BadCrlf);
                }
                let mut line: Vec<u8> = self.pending.drain(..=i).collect();
                line.truncate(line.len() - 2);
                if line.len() > MAX_LINE {
                    return Err(NetError::LineTooLong);
                }
                // CR may only appear as part of the terminator
                if line.contains(&b'\r') {
                    return Err(NetError::BadCrlf);
                }
                return Ok(line);
            }
            // a CR at the end of the buffer may still be completed by an LF
            if let Some(i) = self.pending.iter().position(|&b| b == b'\r') {
                if i + 1 < self.pending.len() {
                    self.pending.drain(..=i);
                    return Err(NetError::BadCrlf);
                }
            }
            if self.pending.len() > MAX_LINE + 1 {
                self.drain_to_lf().await?;
                return Err(NetError::LineTooLong);
            }
            self.fill().await?;
        }
    }

    /// Swallow input until an LF went by, so the next read_line starts on a
    /// line boundary.
    async fn drain_to_lf(&mut self) -> Result<(), NetError> {
        loop {
            if let Some(i) = self.pending.iter().position(|&b| b == b'\n') {
                self.pending.drain(..=i);
                return Ok(());
            }
            self.pending.clear();
            self.fill().await?;
        }
    }

    /// Read one LF-terminated line of up to `max` bytes without the SMTP
    /// line-length ceiling (AUTH exchanges may carry long Base64 blobs).
    /// Returns the payload without CR/LF.
    pub async fn read_until_lf(&mut self, max: usize) -> Result<Vec<u8>, NetError> {
        loop {
            if let Some(i) = self.pending.iter().position(|&b| b == b'\n') {
                let mut line: Vec<u8> = self.pending.drain(..=i).collect();
                line.pop();
                if line.last() == Some(&b'\r') {
                    line.pop();
                }
                if line.len() > max {
                    return Err(NetError::LineTooLong);
                }
                return Ok(line);
            }
            if self.pending.len() > max + 1 {
                self.drain_to_lf().await?;
                return Err(NetError::LineTooLong);
            }
            self.fill().await?;
        }
    }

    /// Read exactly `want` raw bytes (BDAT chunk body). Buffered input is
    /// consumed first.
    pub async fn read_binary(&mut self, want: usize, out: &mut Vec<u8>) -> Result<(), NetError> {
        let mut remaining = want;
        if !self.pending.is_empty() {
            let take = remaining.min(self.pending.len());
            out.extend(self.pending.drain(..take));
            remaining -= take;
        }
        let mut buf = [0u8; 4096];
        while remaining > 0 {
            let cap = remaining.min(buf.len());
            let n = match tokio::time::timeout(self.timeout, self.stream.read(&mut buf[..cap]))
                .await
            {
                Err(_) => return Err(NetError::Timeout),
                Ok(Err(e)) => return Err(NetError::Io(e)),
                Ok(Ok(n)) => n,
            };
            if n == 0 {
                return Err(NetError::PeerClosed);
            }
            out.extend_from_slice(&buf[..n]);
            remaining -= n;
        }
        Ok(())
    }

    /// Timed write of the whole buffer.
    pub async fn write_all(&mut self, data: &[u8]) -> Result<(), NetError> {
        match tokio::time::timeout(self.timeout, async {
            self.stream.write_all(data).await?;
            self.stream.flush().await
        })
        .await
        {
            Err(_) => Err(NetError::Timeout),
            Ok(Err(e)) => Err(NetError::Io(e)),
            Ok(Ok(())) => Ok(()),
        }
    }

    /// Write one line followed by CRLF.
    pub async fn write_line(&mut self, line: &str) -> Result<(), NetError> {
        let mut out = Vec::with_capacity(line.len() + 2);
        out.extend_from_slice(line.as_bytes());
        out.extend_from_slice(b"\r\n");
        self.write_all(&out).await
    }

    /// Write a multi-line SMTP reply: every line but the last uses the
    /// `CODE-text` form, the last uses `CODE text`.
    pub async fn write_multiline(&mut self, code: u16, lines: &[&str]) -> Result<(), NetError> {
        let mut out = String::new();
        for (i, l) in lines.iter().enumerate() {
            let sep = if i + 1 == lines.len() { ' ' } else { '-' };
            out.push_str(&format!("{}{}{}\r\n", code, sep, l));
        }
        self.write_all(out.as_bytes()).await
    }

    /// Orderly shutdown of the transport.
    pub async fn shutdown(&mut self) {
        let _ = self.stream.shutdown().await;
    }
}

fn noop_waker() -> Waker {
    const VTABLE: RawWakerVTable = RawWakerVTable::new(|_| RAW, |_| {}, |_| {}, |_| {});
    const RAW: RawWaker = RawWaker::new(std::ptr::null(), &VTABLE);
    // no state, no wakeups: the probe either succeeds immediately or not at all
    unsafe { Waker::from_raw(RAW) }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;
    use tokio::net::TcpListener;

    async fn pair() -> (Conn, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).await.unwrap();
        let (server, _) = listener.accept().await.unwrap();
        (
            Conn::new(SmtpStream::Plain(server), Duration::from_secs(5)),
            client,
        )
    }

    #[tokio::test]
    async fn reads_single_line() {
        let (mut conn, mut client) = pair().await;
        client.write_all(b"EHLO example.net\r\n").await.unwrap();
        let line = conn.read_line().await.unwrap();
        assert_eq!(line, b"EHLO example.net");
    }

    #[tokio::test]
    async fn pipelined_lines_are_buffered() {
        let (mut conn, mut client) = pair().await;
        client
            .write_all(b"MAIL FROM:<a@b.example>\r\nRCPT TO:<c@d.example>\r\n")
            .await
            .unwrap();
        assert_eq!(conn.read_line().await.unwrap(), b"MAIL FROM:<a@b.example>");
        assert!(conn.data_pending());
        assert_eq!(conn.read_line().await.unwrap(), b"RCPT TO:<c@d.example>");
    }

    #[tokio::test]
    async fn line_split_across_packets() {
        let (mut conn, mut client) = pair().await;
        client.write_all(b"NO").await.unwrap();
        client.flush().await.unwrap();
        let read = tokio::spawn(async move { conn.read_line().await.map(|l| l.to_vec()) });
        tokio::time::sleep(Duration::from_millis(20)).await;
        client.write_all(b"OP\r\n").await.unwrap();
        assert_eq!(read.await.unwrap().unwrap(), b"NOOP");
    }

    #[tokio::test]
    async fn lone_lf_is_rejected() {
        let (mut conn, mut client) = pair().await;
        client.write_all(b"NOOP\n").await.unwrap();
        assert!(matches!(conn.read_line().await, Err(NetError::BadCrlf)));
    }

    #[tokio::test]
    async fn embedded_cr_is_rejected() {
        let (mut conn, mut client) = pair().await;
        client.write_all(b"NO\rOP\r\n").await.unwrap();
        assert!(matches!(conn.read_line().await, Err(NetError::BadCrlf)));
    }

    #[tokio::test]
    async fn overlong_line_resynchronizes() {
        let (mut conn, mut client) = pair().await;
        let mut long = vec![b'x'; MAX_LINE + 10];
        long.extend_from_slice(b"\r\nNOOP\r\n");
        client.write_all(&long).await.unwrap();
        assert!(matches!(conn.read_line().await, Err(NetError::LineTooLong)));
        assert_eq!(conn.read_line().await.unwrap(), b"NOOP");
    }

    #[tokio::test]
    async fn binary_read_consumes_buffered_input_first() {
        let (mut conn, mut client) = pair().await;
        client.write_all(b"BDAT 4\r\nabcdrest").await.unwrap();
        assert_eq!(conn.read_line().await.unwrap(), b"BDAT 4");
        let mut chunk = Vec::new();
        conn.read_binary(4, &mut chunk).await.unwrap();
        assert_eq!(chunk, b"abcd");
        let mut rest = Vec::new();
        conn.read_binary(4, &mut rest).await.unwrap();
        assert_eq!(rest, b"rest");
    }

    #[tokio::test]
    async fn peer_close_is_detected() {
        let (mut conn, client) = pair().await;
        drop(client);
        assert!(matches!(conn.read_line().await, Err(NetError::PeerClosed)));
    }

    #[tokio::test]
    async fn multiline_reply_format() {
        let (mut conn, mut client) = pair().await;
        conn.write_multiline(250, &["first", "second", "last"])
            .await
            .unwrap();
        let mut buf = vec![0u8; 128];
        use tokio::io::AsyncReadExt;
        let n = client.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"250-first\r\n250-second\r\n250 last\r\n");
    }
}
