/*
 * Copyright Stalwart Labs Ltd.
 *
 * Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
 * https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
 * <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
 * option. This file may not be copied, modified, or distributed
 * except according to those terms.
 */

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};

use crate::{mime::Envelope, Error, SmtpClient};

use super::{AssertReply, SessionState};

impl<T: AsyncRead + AsyncWrite + Unpin> SmtpClient<T> {
    /// Submits a message over an authenticated session.
    pub async fn submit(&mut self, envelope: &Envelope) -> crate::Result<()> {
        self.require(SessionState::Authenticated, "authenticated")?;
        let message = envelope.write_to_vec()?;
        let result = self.transaction(envelope, &message).await;
        self.track(result)?;
        self.state = SessionState::MessageSubmitted;
        log::info!(
            "Message accepted for {} recipient(s) ({} bytes)",
            envelope.to().len(),
            message.len()
        );
        Ok(())
    }

    async fn transaction(&mut self, envelope: &Envelope, message: &[u8]) -> crate::Result<()> {
        self.mail_from(envelope.from()).await?;
        for rcpt in envelope.to() {
            self.rcpt_to(rcpt).await?;
        }
        self.data(message).await
    }

    /// Sends a MAIL FROM command to the server.
    pub async fn mail_from(&mut self, addr: &str) -> crate::Result<()> {
        self.cmd(format!("MAIL FROM:<{}>\r\n", addr).as_bytes())
            .await?
            .assert_positive_completion(Error::SubmissionRejected)
            .map(|_| ())
    }

    /// Sends a RCPT TO command to the server.
    pub async fn rcpt_to(&mut self, addr: &str) -> crate::Result<()> {
        self.cmd(format!("RCPT TO:<{}>\r\n", addr).as_bytes())
            .await?
            .assert_positive_completion(Error::SubmissionRejected)
            .map(|_| ())
    }

    /// Sends a DATA command to the server.
    pub async fn data(&mut self, message: impl AsRef<[u8]>) -> crate::Result<()> {
        self.cmd(b"DATA\r\n")
            .await?
            .assert_code(354, Error::SubmissionRejected)?;
        log::debug!("C: <{} bytes of message data>", message.as_ref().len());
        tokio::time::timeout(self.timeout, async {
            // Write message
            self.write_message(message.as_ref()).await?;
            self.stream.flush().await?;
            self.read().await
        })
        .await
        .map_err(|_| crate::Error::Timeout)??
        .assert_positive_completion(Error::SubmissionRejected)
        .map(|_| ())
    }

    /// Writes the message followed by the end-of-data marker. Lines starting
    /// with a period get an extra one.
    pub(crate) async fn write_message(&mut self, message: &[u8]) -> tokio::io::Result<()> {
        // Transparency procedure
        #[derive(Debug)]
        enum State {
            Cr,
            CrLf,
            Init,
        }

        let mut state = State::CrLf;
        let mut last_pos = 0;
        for (pos, byte) in message.iter().enumerate() {
            if *byte == b'.' && matches!(state, State::CrLf) {
                if let Some(bytes) = message.get(last_pos..pos) {
                    self.stream.write_all(bytes).await?;
                    self.stream.write_all(b".").await?;
                    last_pos = pos;
                }
                state = State::Init;
            } else if *byte == b'\r' {
                state = State::Cr;
            } else if *byte == b'\n' && matches!(state, State::Cr) {
                state = State::CrLf;
            } else {
                state = State::Init;
            }
        }
        if let Some(bytes) = message.get(last_pos..) {
            self.stream.write_all(bytes).await?;
        }
        if message.ends_with(b"\r\n") {
            self.stream.write_all(b".\r\n").await
        } else {
            self.stream.write_all(b"\r\n.\r\n").await
        }
    }
}
