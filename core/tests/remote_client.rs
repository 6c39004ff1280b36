/*
 * remote_client.rs
 * Copyright (C) 2026 Chris Burdess
 *
 * Integration tests for the outbound relay client against a scripted
 * SMTP server on localhost: envelope negotiation, quoted-printable
 * recoding for 7bit-only peers, and chunked transfer.
 *
 * Run with:
 *   cargo test -p bastione_core --test remote_client
 */

use std::collections::HashMap;
use std::net::{Ipv4Addr, Ipv6Addr};
use std::path::PathBuf;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use bastione_core::dns::{DnsError, MxHost, Resolver};
use bastione_core::remote::{deliver, RemoteConfig};

#[derive(Default, Clone)]
struct StubDns {
    addrs: HashMap<String, Vec<Ipv6Addr>>,
}

impl Resolver for StubDns {
    async fn mx(&self, _name: &str) -> Result<Vec<MxHost>, DnsError> {
        Err(DnsError::NxDomain)
    }

    async fn addrs(&self, name: &str) -> Result<Vec<Ipv6Addr>, DnsError> {
        self.addrs.get(name).cloned().ok_or(DnsError::NxDomain)
    }

    async fn a(&self, name: &str) -> Result<Vec<Ipv4Addr>, DnsError> {
        match self.addrs.get(name) {
            Some(a) => Ok(a.iter().filter_map(|ip| ip.to_ipv4_mapped()).collect()),
            None => Err(DnsError::NxDomain),
        }
    }

    async fn ptr(&self, _ip: &Ipv6Addr) -> Result<Vec<String>, DnsError> {
        Err(DnsError::NxDomain)
    }

    async fn txt(&self, _name: &str) -> Result<Vec<String>, DnsError> {
        Err(DnsError::NxDomain)
    }
}

fn stub_dns() -> StubDns {
    let mut dns = StubDns::default();
    dns.addrs.insert(
        "relay.test.example".to_string(),
        vec![Ipv4Addr::new(127, 0, 0, 1).to_ipv6_mapped()],
    );
    dns
}

struct Fixture {
    _dir: tempfile::TempDir,
    base: PathBuf,
}

impl Fixture {
    fn new(port: u16) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().to_path_buf();
        std::fs::create_dir_all(base.join("control")).unwrap();
        std::fs::write(base.join("control/me"), b"mx.example.org\n").unwrap();
        std::fs::write(
            base.join("control/smtproutes"),
            format!("test.example:relay.test.example:{}\n", port),
        )
        .unwrap();
        Self { _dir: dir, base }
    }

    fn config(&self) -> RemoteConfig {
        RemoteConfig::load(&self.base).unwrap()
    }
}

async fn server_read_line(stream: &mut TcpStream) -> String {
    let mut buf = Vec::new();
    loop {
        let mut b = [0u8; 1];
        let n = stream.read(&mut b).await.unwrap();
        if n == 0 || b[0] == b'\n' {
            break;
        }
        if b[0] != b'\r' {
            buf.push(b[0]);
        }
    }
    String::from_utf8_lossy(&buf).into_owned()
}

async fn expect_line(stream: &mut TcpStream, prefix: &str) -> String {
    let line = server_read_line(stream).await;
    assert!(line.starts_with(prefix), "expected {}: got {}", prefix, line);
    line
}

async fn reply(stream: &mut TcpStream, text: &str) {
    stream.write_all(text.as_bytes()).await.unwrap();
    stream.write_all(b"\r\n").await.unwrap();
}

#[tokio::test]
async fn seven_bit_peer_gets_quoted_printable() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let fixture = Fixture::new(port);
    let cfg = fixture.config();
    let dns = stub_dns();
    let msg = b"Subject: test\r\n\r\nsch\xc3\xb6n\r\n".to_vec();

    let server = async {
        let (mut s, _) = listener.accept().await.unwrap();
        reply(&mut s, "220 fake ESMTP").await;
        expect_line(&mut s, "EHLO mx.example.org").await;
        s.write_all(b"250-fake\r\n250-SIZE 10000000\r\n250-PIPELINING\r\n250 HELP\r\n")
            .await
            .unwrap();
        // pipelined envelope arrives in one go
        let mail = expect_line(&mut s, "MAIL FROM:<sender@example.org>").await;
        assert!(mail.contains(" SIZE="), "SIZE missing: {}", mail);
        assert!(!mail.contains("BODY="), "no BODY without 8BITMIME: {}", mail);
        expect_line(&mut s, "RCPT TO:<rcpt@test.example>").await;
        reply(&mut s, "250 sender ok").await;
        reply(&mut s, "250 rcpt ok").await;
        expect_line(&mut s, "DATA").await;
        reply(&mut s, "354 go ahead").await;
        let mut body = Vec::new();
        loop {
            let line = server_read_line(&mut s).await;
            if line == "." {
                break;
            }
            body.extend_from_slice(line.as_bytes());
            body.push(b'\n');
        }
        reply(&mut s, "250 accepted").await;
        expect_line(&mut s, "QUIT").await;
        reply(&mut s, "221 bye").await;
        body
    };

    let rcpts = ["rcpt@test.example".to_string()];
    let client = deliver(
        &cfg,
        &dns,
        "test.example",
        "sender@example.org",
        &rcpts,
        &msg,
    );

    let (body, ()) = tokio::join!(server, client);
    let text = String::from_utf8_lossy(&body);
    assert!(
        text.contains("Content-Transfer-Encoding: quoted-printable (recoded by:"),
        "missing recode header: {}",
        text
    );
    assert!(text.contains("sch=C3=B6n"), "body not recoded: {}", text);
    assert!(text.contains("Subject: test"));
}

#[tokio::test]
async fn eight_bit_peer_gets_the_message_verbatim() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let fixture = Fixture::new(port);
    let cfg = fixture.config();
    let dns = stub_dns();
    let msg = b"Subject: test\r\n\r\nsch\xc3\xb6n\r\n".to_vec();

    let server = async {
        let (mut s, _) = listener.accept().await.unwrap();
        reply(&mut s, "220 fake ESMTP").await;
        expect_line(&mut s, "EHLO mx.example.org").await;
        s.write_all(b"250-fake\r\n250-8BITMIME\r\n250 SIZE\r\n")
            .await
            .unwrap();
        let mail = expect_line(&mut s, "MAIL FROM:<sender@example.org>").await;
        assert!(mail.contains("BODY=8BITMIME"), "{}", mail);
        reply(&mut s, "250 sender ok").await;
        expect_line(&mut s, "RCPT TO:<rcpt@test.example>").await;
        reply(&mut s, "250 rcpt ok").await;
        expect_line(&mut s, "DATA").await;
        reply(&mut s, "354 go ahead").await;
        let mut body = Vec::new();
        loop {
            let line = server_read_line(&mut s).await;
            if line == "." {
                break;
            }
            body.extend_from_slice(line.as_bytes());
            body.push(b'\n');
        }
        reply(&mut s, "250 accepted").await;
        expect_line(&mut s, "QUIT").await;
        reply(&mut s, "221 bye").await;
        body
    };

    let rcpts = ["rcpt@test.example".to_string()];
    let client = deliver(
        &cfg,
        &dns,
        "test.example",
        "sender@example.org",
        &rcpts,
        &msg,
    );

    let (body, ()) = tokio::join!(server, client);
    let text = String::from_utf8_lossy(&body);
    assert!(text.contains("sch\u{f6}n") || body.windows(4).any(|w| w == b"ch\xc3\xb6"),
        "8bit body must pass through: {:?}", body);
    assert!(!text.contains("quoted-printable"));
}

#[tokio::test]
async fn chunking_peer_gets_bdat() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let fixture = Fixture::new(port);
    let cfg = fixture.config();
    let dns = stub_dns();
    let msg = b"Subject: chunked\r\n\r\nbody line\r\n".to_vec();

    let server = async {
        let (mut s, _) = listener.accept().await.unwrap();
        reply(&mut s, "220 fake ESMTP").await;
        expect_line(&mut s, "EHLO mx.example.org").await;
        s.write_all(b"250-fake\r\n250-8BITMIME\r\n250-CHUNKING\r\n250 SIZE\r\n")
            .await
            .unwrap();
        expect_line(&mut s, "MAIL FROM:<sender@example.org>").await;
        reply(&mut s, "250 sender ok").await;
        expect_line(&mut s, "RCPT TO:<rcpt@test.example>").await;
        reply(&mut s, "250 rcpt ok").await;
        // BDAT chunks until LAST
        let mut body = Vec::new();
        loop {
            let line = server_read_line(&mut s).await;
            assert!(line.starts_with("BDAT "), "{}", line);
            let last = line.ends_with(" LAST");
            let n: usize = line
                .trim_start_matches("BDAT ")
                .trim_end_matches(" LAST")
                .parse()
                .unwrap();
            let mut chunk = vec![0u8; n];
            s.read_exact(&mut chunk).await.unwrap();
            body.extend_from_slice(&chunk);
            reply(&mut s, "250 chunk ok").await;
            if last {
                break;
            }
        }
        expect_line(&mut s, "QUIT").await;
        reply(&mut s, "221 bye").await;
        body
    };

    let rcpts = ["rcpt@test.example".to_string()];
    let client = deliver(
        &cfg,
        &dns,
        "test.example",
        "sender@example.org",
        &rcpts,
        &msg,
    );

    let (body, ()) = tokio::join!(server, client);
    assert_eq!(body, msg, "BDAT must deliver the message byte for byte");
}

#[tokio::test]
async fn bad_greeting_gives_up_cleanly() {
    let bad = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = bad.local_addr().unwrap().port();
    let fixture = Fixture::new(port);
    let cfg = fixture.config();
    let dns = stub_dns();
    let msg = b"Subject: x\r\n\r\nbody\r\n".to_vec();

    let server = async {
        // first connection: refuse with a 554 greeting; the client must
        // QUIT and, with no other host left, give up
        let (mut s, _) = bad.accept().await.unwrap();
        reply(&mut s, "554 go away").await;
        expect_line(&mut s, "QUIT").await;
        reply(&mut s, "221 bye").await;
    };

    let rcpts = ["rcpt@test.example".to_string()];
    let client = deliver(
        &cfg,
        &dns,
        "test.example",
        "sender@example.org",
        &rcpts,
        &msg,
    );
    let ((), ()) = tokio::join!(server, client);
}
