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

use std::fmt::Display;

use smtp_proto::Response;

pub mod auth;
pub mod builder;
pub mod client;
pub mod ehlo;
pub mod envelope;
#[cfg(test)]
pub(crate) mod mock;
pub mod tls;

/// Session lifecycle. States only move forward, any failure ends in
/// [`SessionState::Failed`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
    Unconnected,
    Greeted,
    EncryptionNegotiated,
    Authenticating(AuthRound),
    Authenticated,
    MessageSubmitted,
    Failed(String),
}

/// Round of a challenge-response exchange in progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthRound {
    Negotiate,
    Authenticate,
}

impl Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionState::Unconnected => f.write_str("unconnected"),
            SessionState::Greeted => f.write_str("greeted"),
            SessionState::EncryptionNegotiated => f.write_str("encrypted"),
            SessionState::Authenticating(AuthRound::Negotiate) => {
                f.write_str("authenticating (negotiate)")
            }
            SessionState::Authenticating(AuthRound::Authenticate) => {
                f.write_str("authenticating (authenticate)")
            }
            SessionState::Authenticated => f.write_str("authenticated"),
            SessionState::MessageSubmitted => f.write_str("submitted"),
            SessionState::Failed(reason) => write!(f, "failed ({})", reason),
        }
    }
}

pub trait AssertReply: Sized {
    fn is_positive_completion(&self) -> bool;
    fn assert_positive_completion(
        self,
        on_error: fn(Response<String>) -> crate::Error,
    ) -> crate::Result<Self>;
    fn assert_code(
        self,
        code: u16,
        on_error: fn(Response<String>) -> crate::Error,
    ) -> crate::Result<Self>;
}

impl AssertReply for Response<String> {
    /// Returns `true` if the reply is a positive completion.
    #[inline(always)]
    fn is_positive_completion(&self) -> bool {
        (200..=299).contains(&self.code())
    }

    /// Returns the reply if it is a positive completion, otherwise wraps it
    /// with `on_error`.
    fn assert_positive_completion(
        self,
        on_error: fn(Response<String>) -> crate::Error,
    ) -> crate::Result<Self> {
        if self.is_positive_completion() {
            Ok(self)
        } else {
            Err(on_error(self))
        }
    }

    /// Returns the reply if it carries `code`, otherwise wraps it with
    /// `on_error`.
    fn assert_code(
        self,
        code: u16,
        on_error: fn(Response<String>) -> crate::Error,
    ) -> crate::Result<Self> {
        if self.code() == code {
            Ok(self)
        } else {
            Err(on_error(self))
        }
    }
}
