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

use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;

use crate::{SmtpClient, SmtpClientBuilder};

use super::{auth::AuthFraming, tls::build_tls_connector};

impl<T: AsRef<str> + PartialEq + Eq> SmtpClientBuilder<T> {
    pub fn new(hostname: T, port: u16) -> Self {
        SmtpClientBuilder {
            addr: format!("{}:{}", hostname.as_ref(), port),
            timeout: Duration::from_secs(10),
            tls_connector: build_tls_connector(false),
            tls_hostname: hostname,
            framing: AuthFraming::default(),
            local_host: gethostname::gethostname()
                .to_str()
                .unwrap_or("[127.0.0.1]")
                .to_string(),
        }
    }

    /// Allow invalid TLS certificates
    pub fn allow_invalid_certs(mut self, allow_invalid_certs: bool) -> Self {
        self.tls_connector = build_tls_connector(allow_invalid_certs);
        self
    }

    /// Set the EHLO hostname
    pub fn helo_host(mut self, host: impl Into<String>) -> Self {
        self.local_host = host.into();
        self
    }

    /// Sets the SMTP connection timeout
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Sets how challenge-response payloads are framed
    pub fn auth_framing(mut self, framing: AuthFraming) -> Self {
        self.framing = framing;
        self
    }

    /// Opens the TCP connection and reads the greeting.
    pub async fn connect(&self) -> crate::Result<SmtpClient<TcpStream>> {
        let stream = self.open().await?;
        let mut client = SmtpClient::new(stream, self.timeout).auth_framing(self.framing);
        match client.read_greeting().await {
            Ok(()) => Ok(client),
            Err(err) => {
                client.close().await;
                Err(err)
            }
        }
    }

    /// Connects, upgrades with STARTTLS and re-announces with EHLO, leaving
    /// the session ready to authenticate.
    pub async fn connect_tls(&self) -> crate::Result<SmtpClient<TlsStream<TcpStream>>> {
        let mut client = self.connect().await?;
        let result = async {
            client.ehlo(&self.local_host).await?;
            client.start_tls().await
        }
        .await;
        if let Err(err) = result {
            client.close().await;
            return Err(err);
        }

        let mut client = client
            .into_tls(&self.tls_connector, self.tls_hostname.as_ref())
            .await?;
        let result = client.ehlo(&self.local_host).await.map(|_| ());
        match result {
            Ok(()) => Ok(client),
            Err(err) => {
                client.close().await;
                Err(err)
            }
        }
    }

    /// Opens the TCP connection without reading from it.
    pub async fn open(&self) -> crate::Result<TcpStream> {
        log::debug!("Connecting to {}", self.addr);
        tokio::time::timeout(self.timeout, TcpStream::connect(&self.addr))
            .await
            .map_err(|_| crate::Error::Timeout)?
            .map_err(crate::Error::Connect)
    }
}
