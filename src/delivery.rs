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

//! Runs one delivery from a [`DeliveryConfig`]: build the envelope, connect,
//! upgrade to TLS, authenticate, submit and close.

use std::{fmt::Display, path::PathBuf};

use chrono::{DateTime, Local};
use tokio::io::{AsyncRead, AsyncWrite};

use crate::{
    config::{DeliveryConfig, EnvSecret, SecretProvider},
    mime::Envelope,
    ntlm::NtlmAuthenticator,
    smtp::{auth::Credentials, tls::TlsUpgrade, SessionState},
    Error, SmtpClient, SmtpClientBuilder,
};

pub struct Delivery<S: SecretProvider = EnvSecret> {
    config: DeliveryConfig,
    secrets: S,
}

/// Summary of a successful delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivered {
    pub recipients: usize,
    pub attachments: usize,
    pub skipped: Vec<PathBuf>,
}

/// A failed delivery and the last state the session reached.
#[derive(Debug)]
pub struct Failure {
    pub reached: SessionState,
    pub error: Error,
}

struct Plan {
    envelope: Envelope,
    credentials: Credentials<'static>,
    authenticator: Option<NtlmAuthenticator>,
    helo_host: String,
}

impl Delivery<EnvSecret> {
    pub fn new(config: DeliveryConfig) -> Self {
        Delivery {
            config,
            secrets: EnvSecret::default(),
        }
    }
}

impl<S: SecretProvider> Delivery<S> {
    /// Replaces the source used when the configuration has no password.
    pub fn with_secrets<P: SecretProvider>(self, secrets: P) -> Delivery<P> {
        Delivery {
            config: self.config,
            secrets,
        }
    }

    pub fn config(&self) -> &DeliveryConfig {
        &self.config
    }

    /// Connects to the configured relay and delivers the message.
    pub async fn send(&self) -> Result<Delivered, Failure> {
        let plan = self.plan(Local::now()).map_err(Failure::unconnected)?;
        let builder = SmtpClientBuilder::new(self.config.smtp_server.as_str(), self.config.smtp_port)
            .timeout(self.config.timeout())
            .allow_invalid_certs(self.config.allow_invalid_certs);
        let stream = builder.open().await.map_err(Failure::unconnected)?;

        self.run(plan, stream, &builder.tls_connector).await
    }

    /// Delivers over an already open stream, upgrading it with `upgrader`.
    pub async fn send_over<T, U>(&self, stream: T, upgrader: &U) -> Result<Delivered, Failure>
    where
        T: AsyncRead + AsyncWrite + Unpin,
        U: TlsUpgrade<T>,
    {
        let plan = self.plan(Local::now()).map_err(Failure::unconnected)?;
        self.run(plan, stream, upgrader).await
    }

    async fn run<T, U>(&self, plan: Plan, stream: T, upgrader: &U) -> Result<Delivered, Failure>
    where
        T: AsyncRead + AsyncWrite + Unpin,
        U: TlsUpgrade<T>,
    {
        let mut reached = SessionState::Unconnected;
        let session = self.session(&plan, stream, upgrader, &mut reached);
        let result = match self.config.deadline() {
            Some(deadline) => tokio::time::timeout(deadline, session)
                .await
                .unwrap_or(Err(Error::Timeout)),
            None => session.await,
        };

        match result {
            Ok(()) => Ok(Delivered {
                recipients: plan.envelope.to().len(),
                attachments: plan.envelope.attachments().len(),
                skipped: plan.envelope.skipped().to_vec(),
            }),
            Err(error) => Err(Failure { reached, error }),
        }
    }

    async fn session<T, U>(
        &self,
        plan: &Plan,
        stream: T,
        upgrader: &U,
        reached: &mut SessionState,
    ) -> crate::Result<()>
    where
        T: AsyncRead + AsyncWrite + Unpin,
        U: TlsUpgrade<T>,
    {
        let mut client = SmtpClient::new(stream, self.config.timeout())
            .auth_framing(self.config.auth_framing);

        let result = async {
            client.read_greeting().await?;
            *reached = SessionState::Greeted;
            client.ehlo(&plan.helo_host).await?;
            client.start_tls().await
        }
        .await;
        if let Err(err) = result {
            client.close().await;
            return Err(err);
        }

        let mut client = client
            .into_tls(upgrader, &self.config.smtp_server)
            .await?;
        *reached = SessionState::EncryptionNegotiated;

        let result = async {
            client.ehlo(&plan.helo_host).await?;
            match &plan.authenticator {
                Some(authenticator) => {
                    client
                        .authenticate_challenge_response(authenticator, &plan.credentials)
                        .await?
                }
                None => client.authenticate_plain(&plan.credentials).await?,
            }
            *reached = SessionState::Authenticated;
            client.submit(&plan.envelope).await?;
            *reached = SessionState::MessageSubmitted;
            Ok::<_, Error>(())
        }
        .await;
        client.close().await;
        result
    }

    /// Everything that can be checked before the network is touched.
    fn plan(&self, now: DateTime<Local>) -> crate::Result<Plan> {
        let config = &self.config;
        if config.sender.trim().is_empty() {
            return Err(Error::MissingMailFrom);
        }
        if config.recipients.is_empty() {
            return Err(Error::MissingRcptTo);
        }

        let secret = config
            .password
            .clone()
            .filter(|password| !password.is_empty())
            .or_else(|| self.secrets.secret())
            .ok_or(Error::MissingCredentials)?;
        let credentials =
            Credentials::new(config.sender.clone(), secret).domain(config.domain.clone());

        let authenticator = if config.use_challenge_response_auth {
            let authenticator = NtlmAuthenticator::new(config.auth_compatibility_level)?;
            Some(match &config.workstation {
                Some(workstation) => authenticator.workstation(workstation.as_str()),
                None => authenticator,
            })
        } else {
            None
        };

        let body = if config.include_timestamp {
            stamp_body(&config.message, now)
        } else {
            config.message.clone()
        };

        let envelope = Envelope::builder()
            .from(config.sender.as_str())
            .to(config.recipients.iter().map(String::as_str))
            .subject(config.subject.as_str())
            .body(body)
            .attachment_paths(config.attachments.iter())
            .build()?;

        Ok(Plan {
            envelope,
            credentials,
            authenticator,
            helo_host: config.helo_host.clone().unwrap_or_else(|| {
                gethostname::gethostname()
                    .to_str()
                    .unwrap_or("[127.0.0.1]")
                    .to_string()
            }),
        })
    }
}

/// Appends the local send time to the message body.
pub fn stamp_body(message: &str, now: DateTime<Local>) -> String {
    format!("{}\n\nTime: {}", message, now.format("%Y-%m-%d %H:%M:%S"))
}

impl Failure {
    fn unconnected(error: Error) -> Self {
        Failure {
            reached: SessionState::Unconnected,
            error,
        }
    }
}

impl Display for Failure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} ({}, last state: {})",
            self.error,
            self.error.kind(),
            self.reached
        )
    }
}

impl std::error::Error for Failure {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.error)
    }
}

#[cfg(test)]
mod test {
    use chrono::TimeZone;

    use crate::{
        smtp::{
            mock::{Passthrough, ScriptedStream},
            SessionState,
        },
        DeliveryConfig, Error, ErrorKind,
    };

    use super::{stamp_body, Delivery};

    fn config(json: &str) -> DeliveryConfig {
        DeliveryConfig::from_json(json).unwrap()
    }

    const PLAIN_CONFIG: &str = r#"{
        "smtp_server": "mx.example.com",
        "sender": "a@x.com",
        "password": "secret",
        "recipients": ["b@y.com"],
        "subject": "Report",
        "message": "hello",
        "use_challenge_response_auth": false,
        "helo_host": "client.test"
    }"#;

    #[tokio::test]
    async fn plain_delivery() {
        let stream = ScriptedStream::new([
            "220 mx.example.com ESMTP\r\n",
            "250-mx.example.com\r\n250-AUTH PLAIN LOGIN\r\n250 STARTTLS\r\n",
            "220 2.0.0 Ready to start TLS\r\n",
            "250-mx.example.com\r\n250 AUTH PLAIN LOGIN\r\n",
            "235 2.7.0 Authentication successful\r\n",
            "250 2.1.0 Sender OK\r\n",
            "250 2.1.5 Recipient OK\r\n",
            "354 Start mail input\r\n",
            "250 2.6.0 Queued\r\n",
            "221 2.0.0 Bye\r\n",
        ]);
        let transcript = stream.transcript();

        let delivered = Delivery::new(config(PLAIN_CONFIG))
            .send_over(stream, &Passthrough)
            .await
            .unwrap();
        assert_eq!(delivered.recipients, 1);
        assert_eq!(delivered.attachments, 0);

        let lines = transcript.lines();
        assert_eq!(
            &lines[..6],
            &[
                "EHLO client.test",
                "STARTTLS",
                "EHLO client.test",
                "AUTH PLAIN AGFAeC5jb20Ac2VjcmV0",
                "MAIL FROM:<a@x.com>",
                "RCPT TO:<b@y.com>",
            ]
        );
        assert_eq!(lines.last().map(String::as_str), Some("QUIT"));
    }

    #[tokio::test]
    async fn challenge_response_delivery_fails_on_bad_challenge() {
        let stream = ScriptedStream::new([
            "220 mx.example.com ESMTP\r\n",
            "250-mx.example.com\r\n250 STARTTLS\r\n",
            "220 2.0.0 Ready to start TLS\r\n",
            "250-mx.example.com\r\n250 AUTH NTLM\r\n",
            "334 \r\n",
            "334 bm90IGFuIE5UTE0gY2hhbGxlbmdl\r\n",
            "501 5.7.0 Cancelled\r\n",
            "221 2.0.0 Bye\r\n",
        ]);
        let transcript = stream.transcript();

        let failure = Delivery::new(config(
            r#"{
                "smtp_server": "mx.example.com",
                "sender": "a@x.com",
                "password": "secret",
                "recipients": ["b@y.com"],
                "domain": "CORP",
                "helo_host": "client.test"
            }"#,
        ))
        .send_over(stream, &Passthrough)
        .await
        .unwrap_err();
        assert_eq!(failure.error.kind(), ErrorKind::AuthProtocol);
        assert_eq!(failure.reached, SessionState::EncryptionNegotiated);
        assert!(!transcript.text().contains("MAIL FROM"));
        assert_eq!(transcript.lines().last().map(String::as_str), Some("QUIT"));
    }

    #[tokio::test]
    async fn rejected_greeting_never_authenticates() {
        let stream = tokio_test::io::Builder::new()
            .read(b"530 5.7.0 Not now\r\n")
            .write(b"QUIT\r\n")
            .read(b"221 2.0.0 Bye\r\n")
            .build();

        let failure = Delivery::new(config(PLAIN_CONFIG))
            .send_over(stream, &Passthrough)
            .await
            .unwrap_err();
        assert_eq!(failure.error.kind(), ErrorKind::Protocol);
        assert_eq!(failure.reached, SessionState::Unconnected);
        assert_eq!(failure.error.reply().map(|reply| reply.code()), Some(530));
    }

    #[tokio::test]
    async fn rejected_submission_is_distinguishable() {
        let stream = ScriptedStream::new([
            "220 mx.example.com ESMTP\r\n",
            "250-mx.example.com\r\n250 STARTTLS\r\n",
            "220 2.0.0 Ready to start TLS\r\n",
            "250-mx.example.com\r\n250 AUTH PLAIN\r\n",
            "235 2.7.0 Authentication successful\r\n",
            "550 5.7.1 Sender not allowed\r\n",
            "221 2.0.0 Bye\r\n",
        ]);

        let failure = Delivery::new(config(PLAIN_CONFIG))
            .send_over(stream, &Passthrough)
            .await
            .unwrap_err();
        assert_eq!(failure.error.kind(), ErrorKind::Submission);
        assert_eq!(failure.reached, SessionState::Authenticated);
        let message = failure.to_string();
        assert!(message.contains("550"), "{}", message);
        assert!(message.contains("authenticated"), "{}", message);
    }

    #[tokio::test]
    async fn configuration_errors_before_network() {
        for (json, kind) in [
            (
                r#"{"smtp_server": "mx", "recipients": ["b@y.com"], "password": "x"}"#,
                ErrorKind::Config,
            ),
            (
                r#"{"smtp_server": "mx", "sender": "a@x.com", "password": "x"}"#,
                ErrorKind::Config,
            ),
            (
                r#"{"smtp_server": "mx", "sender": "a@x.com", "recipients": ["b@y.com"],
                    "password": "x", "auth_compatibility_level": 9}"#,
                ErrorKind::AuthSetup,
            ),
            (
                r#"{"smtp_server": "mx", "sender": "a@x.com", "recipients": ["b@y.com"]}"#,
                ErrorKind::AuthSetup,
            ),
        ] {
            let stream = tokio_test::io::Builder::new().build();
            let failure = Delivery::new(config(json))
                .with_secrets(None::<String>)
                .send_over(stream, &Passthrough)
                .await
                .unwrap_err();
            assert_eq!(failure.error.kind(), kind, "{}", json);
            assert_eq!(failure.reached, SessionState::Unconnected);
        }
    }

    #[tokio::test]
    async fn secret_from_provider() {
        let stream = ScriptedStream::new([
            "220 mx.example.com ESMTP\r\n",
            "250-mx.example.com\r\n250 STARTTLS\r\n",
            "220 2.0.0 Ready to start TLS\r\n",
            "250-mx.example.com\r\n250 AUTH PLAIN\r\n",
            "535 5.7.8 Bad credentials\r\n",
            "221 2.0.0 Bye\r\n",
        ]);
        let transcript = stream.transcript();

        let failure = Delivery::new(config(
            r#"{
                "smtp_server": "mx.example.com",
                "sender": "a@x.com",
                "recipients": ["b@y.com"],
                "use_ntlm": false,
                "helo_host": "client.test"
            }"#,
        ))
        .with_secrets(Some("fromenv".to_string()))
        .send_over(stream, &Passthrough)
        .await
        .unwrap_err();
        assert_eq!(failure.error.kind(), ErrorKind::Authentication);
        assert_eq!(failure.reached, SessionState::EncryptionNegotiated);
        // base64("\0a@x.com\0fromenv")
        assert!(transcript
            .text()
            .contains("AUTH PLAIN AGFAeC5jb20AZnJvbWVudg==\r\n"));
    }

    #[tokio::test]
    async fn challenge_response_delivery() {
        // MS-NLMP 4.2.4.3 CHALLENGE_MESSAGE
        const CHALLENGE: &str = concat!(
            "TlRMTVNTUAACAAAADAAMADgAAAAzgoriASNFZ4mrze8AAAAAAAAAACQAJABEAAAABgBwFwAAAA9T",
            "AGUAcgB2AGUAcgACAAwARABvAG0AYQBpAG4AAQAMAFMAZQByAHYAZQByAAAAAAA="
        );
        let challenge = format!("334 {}\r\n", CHALLENGE);
        let stream = ScriptedStream::new([
            "220 mx.example.com ESMTP\r\n",
            "250-mx.example.com\r\n250 STARTTLS\r\n",
            "220 2.0.0 Ready to start TLS\r\n",
            "250-mx.example.com\r\n250 AUTH NTLM\r\n",
            "334 \r\n",
            challenge.as_str(),
            "235 2.7.0 Authentication successful\r\n",
            "250 2.1.0 Sender OK\r\n",
            "250 2.1.5 Recipient OK\r\n",
            "354 Start mail input\r\n",
            "250 2.6.0 Queued\r\n",
            "221 2.0.0 Bye\r\n",
        ]);
        let transcript = stream.transcript();

        let delivered = Delivery::new(config(
            r#"{
                "smtp_server": "mx.example.com",
                "sender": "a@x.com",
                "password": "secret",
                "recipients": ["b@y.com"],
                "domain": "CORP",
                "helo_host": "client.test"
            }"#,
        ))
        .send_over(stream, &Passthrough)
        .await
        .unwrap();
        assert_eq!(delivered.recipients, 1);

        let lines = transcript.lines();
        assert_eq!(&lines[2..4], &["EHLO client.test", "AUTH NTLM"]);
        assert!(lines[4].starts_with("TlRMTVNTUAAB"), "{}", lines[4]);
        assert!(lines[5].starts_with("TlRMTVNTUAAD"), "{}", lines[5]);
        assert_eq!(lines[6], "MAIL FROM:<a@x.com>");
        assert_eq!(lines.last().map(String::as_str), Some("QUIT"));
    }

    #[tokio::test]
    async fn deadline_reports_last_state() {
        let stream = ScriptedStream::new([
            "220 mx.example.com ESMTP\r\n",
            "250-mx.example.com\r\n250 STARTTLS\r\n",
        ])
        .then_stall();

        let failure = Delivery::new(config(
            r#"{
                "smtp_server": "mx.example.com",
                "sender": "a@x.com",
                "password": "secret",
                "recipients": ["b@y.com"],
                "helo_host": "client.test",
                "timeout_secs": 30,
                "deadline_secs": 1
            }"#,
        ))
        .send_over(stream, &Passthrough)
        .await
        .unwrap_err();
        assert!(matches!(failure.error, Error::Timeout), "{:?}", failure.error);
        assert_eq!(failure.error.kind(), ErrorKind::Connection);
        assert_eq!(failure.reached, SessionState::Greeted);
    }

    #[test]
    fn timestamp_line() {
        let now = chrono::Local
            .with_ymd_and_hms(2024, 3, 9, 14, 5, 7)
            .single()
            .unwrap();
        assert_eq!(
            stamp_body("hello", now),
            "hello\n\nTime: 2024-03-09 14:05:07"
        );
    }

    #[test]
    fn timestamped_body() {
        let delivery = Delivery::new(config(
            r#"{
                "smtp_server": "mx.example.com",
                "sender": "a@x.com",
                "password": "secret",
                "recipients": ["b@y.com"],
                "message": "hello",
                "include_timestamp": true
            }"#,
        ));
        let plan = delivery.plan(chrono::Local::now()).unwrap();
        let body = plan.envelope.body_text();

        let stamp = body.strip_prefix("hello\n\nTime: ").unwrap();
        assert!(
            chrono::NaiveDateTime::parse_from_str(stamp, "%Y-%m-%d %H:%M:%S").is_ok(),
            "{}",
            body
        );
    }
}
