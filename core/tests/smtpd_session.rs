/*
 * smtpd_session.rs
 * Copyright (C) 2026 Chris Burdess
 *
 * Integration tests for the inbound SMTP session: full conversations over
 * a real socket, a stub resolver, and a capture script standing in for
 * the queue writer. The session future and the scripted client run on the
 * same task, matching the cooperative single-threaded model.
 *
 * Run with:
 *   cargo test -p bastione_core --test smtpd_session
 */

use std::collections::HashMap;
use std::net::{Ipv4Addr, Ipv6Addr};
use std::path::PathBuf;
use std::sync::{Mutex, OnceLock};
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use bastione_core::dns::{DnsError, MxHost, Resolver};
use bastione_core::netio::{Conn, SmtpStream};
use bastione_core::smtpd::{Session, SessionEnd, SmtpdConfig, TransferState};

/// Canned DNS data; anything not listed does not exist.
#[derive(Default, Clone)]
struct StubDns {
    txt: HashMap<String, Vec<String>>,
    addrs: HashMap<String, Vec<Ipv6Addr>>,
}

impl Resolver for StubDns {
    async fn mx(&self, name: &str) -> Result<Vec<MxHost>, DnsError> {
        match self.addrs.get(name) {
            Some(a) => Ok(a
                .iter()
                .map(|&addr| MxHost {
                    addr,
                    priority: bastione_core::dns::PRIO_IMPLICIT,
                    name: name.to_string(),
                })
                .collect()),
            None => Err(DnsError::NxDomain),
        }
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

    async fn txt(&self, name: &str) -> Result<Vec<String>, DnsError> {
        self.txt.get(name).cloned().ok_or(DnsError::NxDomain)
    }
}

fn env_lock() -> &'static Mutex<()> {
    static LOCK: OnceLock<Mutex<()>> = OnceLock::new();
    LOCK.get_or_init(|| Mutex::new(()))
}

struct Fixture {
    _dir: tempfile::TempDir,
    base: PathBuf,
}

impl Fixture {
    fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().to_path_buf();
        std::fs::create_dir_all(base.join("control")).unwrap();
        std::fs::write(base.join("control/me"), b"mx.example.org\n").unwrap();
        std::fs::write(base.join("control/rcpthosts"), b"example.org\n").unwrap();
        Self { _dir: dir, base }
    }

    fn write_control(&self, name: &str, content: &[u8]) {
        std::fs::write(self.base.join("control").join(name), content).unwrap();
    }

    fn config(&self) -> SmtpdConfig {
        let mut cfg = SmtpdConfig::load(&self.base).unwrap();
        cfg.timeout = Duration::from_secs(20);
        cfg
    }

    /// Install a fake queue writer capturing body and envelope.
    fn capture_queue(&self) -> (PathBuf, PathBuf) {
        let body = self.base.join("captured-body");
        let envelope = self.base.join("captured-envelope");
        let script = self.base.join("fakequeue.sh");
        std::fs::write(
            &script,
            format!(
                "#!/bin/sh\ncat >{}\ncat <&1 >{}\nexit 0\n",
                body.display(),
                envelope.display()
            ),
        )
        .unwrap();
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();
        std::env::set_var("QMAILQUEUE", script.display().to_string());
        (body, envelope)
    }
}

fn state() -> TransferState {
    TransferState::new(
        Ipv4Addr::new(192, 0, 2, 1).to_ipv6_mapped(),
        "192.0.2.1".to_string(),
        "198.51.100.25".to_string(),
        true,
        String::new(),
    )
}

async fn session_pair(cfg: SmtpdConfig, dns: StubDns) -> (Session<StubDns>, TcpStream) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let client = TcpStream::connect(addr).await.unwrap();
    let (server, _) = listener.accept().await.unwrap();
    let conn = Conn::new(SmtpStream::Plain(server), cfg.timeout);
    (Session::new(conn, cfg, dns, state()), client)
}

/// Read one full reply (all continuation lines included).
async fn read_reply(client: &mut TcpStream) -> String {
    let mut buf = Vec::new();
    let mut line_start = 0;
    loop {
        let mut b = [0u8; 1];
        let n = client.read(&mut b).await.unwrap();
        if n == 0 {
            break;
        }
        buf.push(b[0]);
        if buf.ends_with(b"\r\n") {
            let line = &buf[line_start..];
            if line.len() >= 4 && line[3] == b' ' {
                break;
            }
            line_start = buf.len();
        }
    }
    String::from_utf8_lossy(&buf).into_owned()
}

async fn command(client: &mut TcpStream, cmd: &str) -> String {
    client.write_all(cmd.as_bytes()).await.unwrap();
    client.write_all(b"\r\n").await.unwrap();
    read_reply(client).await
}

#[tokio::test]
async fn plain_local_delivery() {
    let _guard = env_lock().lock().unwrap();
    let fixture = Fixture::new();
    let (body_file, envelope_file) = fixture.capture_queue();
    let (mut session, mut client) = session_pair(fixture.config(), StubDns::default()).await;

    let (end, ()) = tokio::join!(session.run(), async {
        let banner = read_reply(&mut client).await;
        assert!(banner.starts_with("220 mx.example.org"), "banner: {}", banner);

        let ehlo = command(&mut client, "EHLO client.example.net").await;
        assert!(ehlo.contains("250-PIPELINING"));
        assert!(ehlo.contains("250-8BITMIME"));
        assert!(ehlo.contains("250-CHUNKING"));
        assert!(ehlo.contains("250-ENHANCEDSTATUSCODES"));
        assert!(ehlo.lines().last().unwrap().starts_with("250 SIZE"));

        let mail = command(&mut client, "MAIL FROM:<a@b.example>").await;
        assert!(mail.starts_with("250 2.1.5 sender <a@b.example>"), "{}", mail);

        let rcpt = command(&mut client, "RCPT TO:<foo@example.org>").await;
        assert!(
            rcpt.starts_with("250 2.1.0 recipient <foo@example.org> OK"),
            "{}",
            rcpt
        );

        let data = command(&mut client, "DATA").await;
        assert!(data.starts_with("354 "), "{}", data);
        client
            .write_all(b"Subject: x\r\n\r\ntest\r\n.\r\n")
            .await
            .unwrap();
        let done = read_reply(&mut client).await;
        assert!(
            done.starts_with("250 2.5.0 accepted message for delivery"),
            "{}",
            done
        );
        let quit = command(&mut client, "QUIT").await;
        assert!(quit.starts_with("221 2.0.0 mx.example.org"));
    });
    assert_eq!(end, SessionEnd::Quit);
    std::env::remove_var("QMAILQUEUE");

    let envelope = std::fs::read(&envelope_file).unwrap();
    assert_eq!(envelope, b"Fa@b.example\0Tfoo@example.org\0\0");

    let body = std::fs::read_to_string(&body_file).unwrap();
    assert!(
        body.starts_with("Received-SPF: None"),
        "body: {}",
        body
    );
    assert!(body.contains("\nReceived: from unknown ([192.0.2.1] HELO client.example.net)"));
    assert!(body.contains("with ESMTP"));
    assert!(body.contains("for <foo@example.org>;"));
    assert!(body.ends_with("\nSubject: x\n\ntest\n"));
}

#[tokio::test]
async fn bad_bounce_rejects_second_recipient() {
    let fixture = Fixture::new();
    let (mut session, mut client) = session_pair(fixture.config(), StubDns::default()).await;

    let (end, ()) = tokio::join!(session.run(), async {
        read_reply(&mut client).await;
        command(&mut client, "EHLO client.example.net").await;
        let mail = command(&mut client, "MAIL FROM:<>").await;
        assert!(mail.starts_with("250 "), "{}", mail);
        let first = command(&mut client, "RCPT TO:<a@example.org>").await;
        assert!(first.starts_with("250 "), "{}", first);

        // pipeline the rest so the tarpit has no reason to sleep
        client
            .write_all(b"RCPT TO:<b@example.org>\r\nDATA\r\nQUIT\r\n")
            .await
            .unwrap();
        let second = read_reply(&mut client).await;
        assert!(
            second.starts_with("550 5.5.3 bounce messages must not have more than one recipient"),
            "{}",
            second
        );
        let data = read_reply(&mut client).await;
        assert!(data.starts_with("554 5.1.1 no valid recipients"), "{}", data);
        let quit = read_reply(&mut client).await;
        assert!(quit.starts_with("221 "), "{}", quit);
    });
    assert_eq!(end, SessionEnd::Quit);
}

#[tokio::test]
async fn spf_fail_blocks_recipient_by_policy() {
    let fixture = Fixture::new();
    fixture.write_control("filterconf", b"spfpolicy=3\n");
    let mut dns = StubDns::default();
    dns.txt.insert(
        "spammy.example".to_string(),
        vec!["v=spf1 -all".to_string()],
    );
    let (mut session, mut client) = session_pair(fixture.config(), dns).await;

    let (end, ()) = tokio::join!(session.run(), async {
        read_reply(&mut client).await;
        command(&mut client, "EHLO client.example.net").await;
        let mail = command(&mut client, "MAIL FROM:<evil@spammy.example>").await;
        assert!(mail.starts_with("250 "), "{}", mail);

        client
            .write_all(b"RCPT TO:<foo@example.org>\r\nQUIT\r\n")
            .await
            .unwrap();
        let rcpt = read_reply(&mut client).await;
        assert!(
            rcpt.starts_with("501 5.7.1 mail denied by SPF policy"),
            "{}",
            rcpt
        );
        let quit = read_reply(&mut client).await;
        assert!(quit.starts_with("221 "), "{}", quit);
    });
    assert_eq!(end, SessionEnd::Quit);
}

#[tokio::test]
async fn chunked_transfer_preserves_bytes() {
    let _guard = env_lock().lock().unwrap();
    let fixture = Fixture::new();
    let (body_file, envelope_file) = fixture.capture_queue();
    let (mut session, mut client) = session_pair(fixture.config(), StubDns::default()).await;

    let (end, ()) = tokio::join!(session.run(), async {
        read_reply(&mut client).await;
        command(&mut client, "EHLO client.example.net").await;
        command(&mut client, "MAIL FROM:<a@b.example>").await;
        let rcpt = command(&mut client, "RCPT TO:<foo@example.org>").await;
        assert!(rcpt.starts_with("250 "), "{}", rcpt);

        client.write_all(b"BDAT 4\r\nabcd").await.unwrap();
        let chunk = read_reply(&mut client).await;
        assert!(chunk.starts_with("250 2.5.0 4 octets received"), "{}", chunk);
        client.write_all(b"BDAT 3 LAST\r\nxyz").await.unwrap();
        let done = read_reply(&mut client).await;
        assert!(
            done.starts_with("250 2.5.0 accepted message for delivery"),
            "{}",
            done
        );
        command(&mut client, "QUIT").await;
    });
    assert_eq!(end, SessionEnd::Quit);
    std::env::remove_var("QMAILQUEUE");

    let envelope = std::fs::read(&envelope_file).unwrap();
    assert_eq!(envelope, b"Fa@b.example\0Tfoo@example.org\0\0");
    let body = std::fs::read(&body_file).unwrap();
    // exactly the seven chunk octets after the synthesized header
    assert!(body.ends_with(b"\nabcdxyz"), "body: {:?}", body);
    let text = String::from_utf8_lossy(&body);
    assert!(text.contains("with (chunked) ESMTP"));
}

#[tokio::test]
async fn http_proxy_is_dropped_before_banner() {
    let fixture = Fixture::new();
    let (mut session, mut client) = session_pair(fixture.config(), StubDns::default()).await;

    client.write_all(b"POST / HTTP/1.0\r\n").await.unwrap();
    // give the bytes time to arrive so the pre-banner probe sees them
    tokio::time::sleep(Duration::from_millis(100)).await;
    let end = session.run().await;
    assert_eq!(end, SessionEnd::HttpProxy);
    drop(session);

    let mut buf = [0u8; 64];
    let n = client.read(&mut buf).await.unwrap();
    assert_eq!(n, 0, "no banner may be sent to an HTTP proxy");
}

#[tokio::test]
async fn too_many_bad_commands_kills_the_session() {
    let fixture = Fixture::new();
    let (mut session, mut client) = session_pair(fixture.config(), StubDns::default()).await;

    let (end, ()) = tokio::join!(session.run(), async {
        read_reply(&mut client).await;
        // six garbage commands in one write: the pipelining keeps the
        // tarpit quiet and the counter runs out
        client
            .write_all(b"FROB\r\nFROB\r\nFROB\r\nFROB\r\nFROB\r\nFROB\r\n")
            .await
            .unwrap();
        let mut all = String::new();
        let mut buf = [0u8; 512];
        loop {
            let n = client.read(&mut buf).await.unwrap();
            if n == 0 {
                break;
            }
            all.push_str(&String::from_utf8_lossy(&buf[..n]));
        }
        assert!(all.contains("500 5.5.2 command syntax error"), "{}", all);
        assert!(all.contains("550 5.7.1 die slow and painful"), "{}", all);
    });
    assert_eq!(end, SessionEnd::TooManyBadCommands);
}

#[tokio::test]
async fn relaying_denied_without_auth() {
    let fixture = Fixture::new();
    let (mut session, mut client) = session_pair(fixture.config(), StubDns::default()).await;

    let (end, ()) = tokio::join!(session.run(), async {
        read_reply(&mut client).await;
        command(&mut client, "EHLO client.example.net").await;
        command(&mut client, "MAIL FROM:<a@b.example>").await;
        client
            .write_all(b"RCPT TO:<someone@elsewhere.example>\r\nQUIT\r\n")
            .await
            .unwrap();
        let rcpt = read_reply(&mut client).await;
        assert!(rcpt.starts_with("551 5.7.1 relaying denied"), "{}", rcpt);
        read_reply(&mut client).await;
    });
    assert_eq!(end, SessionEnd::Quit);
}

#[tokio::test]
async fn mail_needs_helo_first() {
    let fixture = Fixture::new();
    let (mut session, mut client) = session_pair(fixture.config(), StubDns::default()).await;

    let (end, ()) = tokio::join!(session.run(), async {
        read_reply(&mut client).await;
        client
            .write_all(b"MAIL FROM:<a@b.example>\r\nQUIT\r\n")
            .await
            .unwrap();
        let reply = read_reply(&mut client).await;
        assert!(
            reply.starts_with("503 5.5.1 Bad sequence of commands"),
            "{}",
            reply
        );
        read_reply(&mut client).await;
    });
    assert_eq!(end, SessionEnd::Quit);
}
