/*
 * queue.rs
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

//! The bridge to the external queue writer: one child per transaction,
//! message body on its fd 0, envelope on its fd 1, and the fixed mapping
//! from its exit code onto an SMTP reply.

use std::io::Write;
use std::process::Stdio;

use tokio::io::AsyncWriteExt;
use tracing::error;

/// A running queue-writer child with both pipes still open.
pub struct QueueChild {
    child: tokio::process::Child,
    body: Option<tokio::process::ChildStdin>,
    envelope: Option<std::io::PipeWriter>,
}

/// Pick the queue program: QMAILQUEUEAUTH for authenticated sessions,
/// QMAILQUEUE otherwise, bin/qmail-queue as the compiled-in default.
fn queue_program(authenticated: bool) -> String {
    if authenticated {
        if let Ok(q) = std::env::var("QMAILQUEUEAUTH") {
            if !q.is_empty() {
                return q;
            }
        }
    }
    if let Ok(q) = std::env::var("QMAILQUEUE") {
        if !q.is_empty() {
            return q;
        }
    }
    "bin/qmail-queue".to_string()
}

impl QueueChild {
    pub fn spawn(authenticated: bool) -> std::io::Result<Self> {
        let (env_read, env_write) = std::io::pipe()?;
        let prog = queue_program(authenticated);
        let child = tokio::process::Command::new(&prog)
            .stdin(Stdio::piped())
            .stdout(Stdio::from(env_read))
            .spawn()?;
        let mut child = child;
        let body = child.stdin.take();
        Ok(Self {
            child,
            body,
            envelope: Some(env_write),
        })
    }

    pub async fn write_body(&mut self, data: &[u8]) -> std::io::Result<()> {
        match self.body.as_mut() {
            Some(b) => b.write_all(data).await,
            None => Err(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "body pipe closed",
            )),
        }
    }

    /// Close the body pipe; nothing may be written after this.
    pub async fn finish_body(&mut self) -> std::io::Result<()> {
        if let Some(mut b) = self.body.take() {
            b.shutdown().await?;
        }
        Ok(())
    }

    /// Write `F<sender>\0` then `T<rcpt>\0` for each recipient, then the
    /// final NUL, and close the envelope pipe.
    pub fn write_envelope(
        &mut self,
        sender: &str,
        recipients: impl Iterator<Item = String>,
    ) -> std::io::Result<()> {
        let mut pipe = self.envelope.take().ok_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::BrokenPipe, "envelope pipe closed")
        })?;
        let mut buf = Vec::new();
        buf.push(b'F');
        buf.extend_from_slice(sender.as_bytes());
        buf.push(0);
        for r in recipients {
            buf.push(b'T');
            buf.extend_from_slice(r.as_bytes());
            buf.push(0);
        }
        buf.push(0);
        pipe.write_all(&buf)?;
        pipe.flush()
    }

    /// Wait for the child and return its exit code (120 when it died from
    /// a signal, mirroring the child-side catch-all).
    pub async fn wait(mut self) -> std::io::Result<i32> {
        drop(self.body.take());
        drop(self.envelope.take());
        let status = self.child.wait().await?;
        Ok(status.code().unwrap_or(120))
    }

    /// Abort: close both pipes and collect the child.
    pub async fn abort(mut self) {
        drop(self.body.take());
        drop(self.envelope.take());
        if let Err(e) = self.child.wait().await {
            error!(error = %e, "waitpid(queue writer) went wrong");
        }
    }
}

/// Translate the queue writer's exit code into the SMTP reply. Zero is
/// not handled here; the caller reports acceptance itself.
pub fn exit_reply(code: i32) -> &'static str {
    match code {
        11 => "554 5.1.3 envelope address too long for qq",
        31 => "554 5.3.0 mail server permanently rejected message",
        51 => "451 4.3.0 qq out of memory",
        52 => "451 4.3.0 qq timeout",
        53 => "451 4.3.0 qq write error or disk full",
        54 => "451 4.3.0 qq read error",
        55 => "451 4.3.0 qq unable to read configuration",
        56 => "451 4.3.0 qq trouble making network connection",
        61 => "451 4.3.0 qq trouble in home directory",
        62..=66 => "451 4.3.0 qq trouble creating files in queue",
        71 => "451 4.3.0 mail server temporarily rejected message",
        72 => "451 4.4.1 connection to mail server timed out",
        73 => "451 4.4.1 connection to mail server rejected",
        74 => "451 4.4.2 communication with mail server failed",
        81 | 91 => "451 4.3.0 qq internal bug",
        11..=40 => "554 5.3.0 qq permanent problem",
        _ => "451 4.3.0 qq temporary problem",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_code_table() {
        assert!(exit_reply(11).starts_with("554 5.1.3"));
        assert!(exit_reply(31).starts_with("554 5.3.0"));
        assert!(exit_reply(51).starts_with("451 4.3.0 qq out of memory"));
        assert!(exit_reply(64).contains("creating files"));
        assert!(exit_reply(91).contains("internal bug"));
        // unknown permanent range
        assert!(exit_reply(22).starts_with("554"));
        // unknown temporary
        assert!(exit_reply(99).starts_with("451"));
    }

    #[tokio::test]
    async fn envelope_reaches_the_child() {
        // `cat <&0 >/dev/null` style child: read body from fd 0 and the
        // envelope from fd 1 (sh reads fd 1 via redirection)
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("envelope");
        let script = dir.path().join("fakequeue.sh");
        std::fs::write(
            &script,
            format!("#!/bin/sh\ncat >/dev/null\ncat <&1 >{}\nexit 0\n", out.display()),
        )
        .unwrap();
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();
        }
        std::env::set_var("QMAILQUEUE", script.display().to_string());
        let mut q = QueueChild::spawn(false).unwrap();
        q.write_body(b"Subject: x\n\ntest\n").await.unwrap();
        q.finish_body().await.unwrap();
        q.write_envelope(
            "a@b.example",
            vec!["foo@example.org".to_string()].into_iter(),
        )
        .unwrap();
        let code = q.wait().await.unwrap();
        std::env::remove_var("QMAILQUEUE");
        assert_eq!(code, 0);
        let envelope = std::fs::read(&out).unwrap();
        assert_eq!(envelope, b"Fa@b.example\0Tfoo@example.org\0\0");
    }
}
