/*
 * Copyright Stalwart Labs Ltd. See the COPYING
 * file at the top-level directory of this distribution.
 *
 * Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
 * https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
 * <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
 * option. This file may not be copied, modified, or distributed
 * except according to those terms.
 */

//! Test doubles shared by the session and delivery tests.

use std::{
    collections::VecDeque,
    pin::Pin,
    sync::{Arc, Mutex},
    task::{Context, Poll},
};

use smtp_proto::{response::parser::ResponseReceiver, Response};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

use crate::{
    smtp::{
        auth::{ChallengeResponse, Credentials},
        tls::TlsUpgrade,
    },
    SmtpClient,
};

pub(crate) fn reply(text: &str) -> Response<String> {
    ResponseReceiver::default()
        .parse(&mut text.as_bytes().iter())
        .unwrap()
}

pub(crate) fn client<T: AsyncRead + AsyncWrite + Unpin>(stream: T) -> SmtpClient<T> {
    SmtpClient::new(stream, std::time::Duration::from_secs(5))
}

/// Serves canned replies in order regardless of what is written, and keeps
/// a copy of everything the client sends.
pub(crate) struct ScriptedStream {
    replies: VecDeque<Vec<u8>>,
    transcript: Transcript,
    stall: bool,
}

#[derive(Clone, Default)]
pub(crate) struct Transcript(Arc<Mutex<Vec<u8>>>);

impl ScriptedStream {
    pub(crate) fn new<'x>(replies: impl IntoIterator<Item = &'x str>) -> Self {
        ScriptedStream {
            replies: replies
                .into_iter()
                .map(|reply| reply.as_bytes().to_vec())
                .collect(),
            transcript: Transcript::default(),
            stall: false,
        }
    }

    /// Never answers once the scripted replies are used up, instead of
    /// reporting a closed connection.
    pub(crate) fn then_stall(mut self) -> Self {
        self.stall = true;
        self
    }

    pub(crate) fn transcript(&self) -> Transcript {
        self.transcript.clone()
    }
}

impl Transcript {
    pub(crate) fn text(&self) -> String {
        String::from_utf8_lossy(&self.0.lock().unwrap()).into_owned()
    }

    pub(crate) fn lines(&self) -> Vec<String> {
        self.text()
            .split("\r\n")
            .filter(|line| !line.is_empty())
            .map(str::to_string)
            .collect()
    }
}

impl AsyncRead for ScriptedStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        if let Some(mut reply) = self.replies.pop_front() {
            let len = reply.len().min(buf.remaining());
            buf.put_slice(&reply[..len]);
            if len < reply.len() {
                reply.drain(..len);
                self.replies.push_front(reply);
            }
        } else if self.stall {
            return Poll::Pending;
        }
        Poll::Ready(Ok(()))
    }
}

impl AsyncWrite for ScriptedStream {
    fn poll_write(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<Result<usize, std::io::Error>> {
        self.transcript.0.lock().unwrap().extend_from_slice(buf);
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), std::io::Error>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
    ) -> Poll<Result<(), std::io::Error>> {
        Poll::Ready(Ok(()))
    }
}

/// Completes the encryption upgrade without a handshake.
pub(crate) struct Passthrough;

impl<T: AsyncRead + AsyncWrite + Unpin> TlsUpgrade<T> for Passthrough {
    type Stream = T;

    async fn upgrade(&self, stream: T, _hostname: &str) -> crate::Result<T> {
        Ok(stream)
    }
}

/// Challenge-response mechanism with fixed payloads.
pub(crate) struct FixedBlobs {
    pub negotiate: &'static [u8],
    pub authenticate: &'static [u8],
}

impl ChallengeResponse for FixedBlobs {
    fn mechanism(&self) -> &str {
        "NTLM"
    }

    fn begin_negotiation(&self, credentials: &Credentials<'_>) -> crate::Result<Vec<u8>> {
        if credentials.username().is_empty() {
            return Err(crate::Error::MissingCredentials);
        }
        Ok(self.negotiate.to_vec())
    }

    fn complete_challenge(
        &self,
        challenge: &[u8],
        _credentials: &Credentials<'_>,
    ) -> crate::Result<Vec<u8>> {
        if challenge.is_empty() {
            return Err(crate::ntlm::Error::Truncated.into());
        }
        Ok(self.authenticate.to_vec())
    }
}
