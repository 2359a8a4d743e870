/*
 * Copyright Stalwart Labs Ltd.
 *
 * Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
 * https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
 * <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
 * option. This file may not be copied, modified, or distributed
 * except according to those terms.
 */

use std::time::Duration;

use smtp_proto::{response::parser::ResponseReceiver, EhloResponse, Response, EXT_START_TLS};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::SmtpClient;

use super::{auth::AuthFraming, AssertReply, SessionState};

impl<T: AsyncRead + AsyncWrite + Unpin> SmtpClient<T> {
    /// Wraps an open stream. The greeting has not been read yet.
    pub fn new(stream: T, timeout: Duration) -> Self {
        SmtpClient {
            stream,
            timeout,
            state: SessionState::Unconnected,
            capabilities: None,
            framing: AuthFraming::default(),
            tls_accepted: false,
        }
    }

    /// Sets how challenge-response payloads are framed.
    pub fn auth_framing(mut self, framing: AuthFraming) -> Self {
        self.framing = framing;
        self
    }

    pub fn state(&self) -> &SessionState {
        &self.state
    }

    /// Capabilities from the last EHLO in the current encryption context.
    pub fn capabilities(&self) -> Option<&EhloResponse<String>> {
        self.capabilities.as_ref()
    }

    /// Whether the last EHLO advertised STARTTLS.
    pub fn start_tls_offered(&self) -> bool {
        self.capabilities
            .as_ref()
            .map_or(false, |capabilities| capabilities.has_capability(EXT_START_TLS))
    }

    /// Moves the session to `Failed` when `result` is an error other than a
    /// misuse of the session API.
    pub(crate) fn track<R>(&mut self, result: crate::Result<R>) -> crate::Result<R> {
        if let Err(err) = &result {
            if !matches!(err, crate::Error::InvalidState { .. }) {
                self.state = SessionState::Failed(err.to_string());
            }
        }
        result
    }

    pub(crate) fn require(
        &self,
        state: SessionState,
        expected: &'static str,
    ) -> crate::Result<()> {
        if self.state == state {
            Ok(())
        } else {
            Err(crate::Error::InvalidState {
                expected,
                found: self.state.clone(),
            })
        }
    }

    pub(crate) async fn read(&mut self) -> crate::Result<Response<String>> {
        let mut buf = vec![0u8; 1024];
        let mut parser = ResponseReceiver::default();

        loop {
            let br = self.stream.read(&mut buf).await?;

            if br == 0 {
                return Err(crate::Error::UnparseableReply);
            }

            match parser.parse(&mut buf[..br].iter()) {
                Ok(reply) => {
                    log::debug!("S: {} {}", reply.code(), reply.message());
                    return Ok(reply);
                }
                Err(err) => match err {
                    smtp_proto::Error::NeedsMoreData { .. } => (),
                    _ => {
                        return Err(crate::Error::UnparseableReply);
                    }
                },
            }
        }
    }

    /// Sends a command to the SMTP server and waits for a reply.
    pub async fn cmd(&mut self, cmd: impl AsRef<[u8]>) -> crate::Result<Response<String>> {
        let cmd = cmd.as_ref();
        log::debug!("C: {}", String::from_utf8_lossy(cmd).trim_end());
        self.send(cmd).await
    }

    /// Same as [`SmtpClient::cmd`] but keeps the payload out of the log.
    pub(crate) async fn cmd_sensitive(
        &mut self,
        cmd: impl AsRef<[u8]>,
    ) -> crate::Result<Response<String>> {
        let cmd = cmd.as_ref();
        match String::from_utf8_lossy(cmd)
            .strip_prefix("AUTH ")
            .and_then(|rest| rest.split_once(' '))
        {
            Some((mechanism, _)) => log::debug!("C: AUTH {} <redacted>", mechanism),
            None => log::debug!("C: <redacted>"),
        }
        self.send(cmd).await
    }

    async fn send(&mut self, cmd: &[u8]) -> crate::Result<Response<String>> {
        tokio::time::timeout(self.timeout, async {
            self.stream.write_all(cmd).await?;
            self.stream.flush().await?;
            self.read().await
        })
        .await
        .map_err(|_| crate::Error::Timeout)?
    }

    /// Reads the server greeting.
    pub async fn read_greeting(&mut self) -> crate::Result<()> {
        self.require(SessionState::Unconnected, "unconnected")?;
        let result = tokio::time::timeout(self.timeout, self.read())
            .await
            .map_err(|_| crate::Error::Timeout)
            .and_then(|reply| reply)
            .and_then(|reply| reply.assert_positive_completion(crate::Error::GreetingRejected));
        let reply = self.track(result)?;
        log::info!("Connected: {}", reply.message());
        self.state = SessionState::Greeted;
        Ok(())
    }

    /// Ends the session with QUIT and closes the stream. Never fails, errors
    /// are only logged.
    pub async fn close(mut self) {
        if self.state != SessionState::Unconnected && !self.tls_accepted {
            match self.cmd(b"QUIT\r\n").await {
                Ok(reply) => log::debug!("Session closed: {}", reply.code()),
                Err(err) => log::debug!("QUIT failed: {}", err),
            }
        }
        if let Err(err) = self.stream.shutdown().await {
            log::debug!("Failed to shut down stream: {}", err);
        }
    }
}
