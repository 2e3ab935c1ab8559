// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright © 2024 RemasteredArch
//
// This file is part of smtp_intake.
//
// smtp_intake is free software: you can redistribute it and/or modify it under the terms of the
// GNU Affero General Public License as published by the Free Software Foundation, either version
// 3 of the License, or (at your option) any later version.
//
// smtp_intake is distributed in the hope that it will be useful, but WITHOUT ANY WARRANTY;
// without even the implied warranty of MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See
// the GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License along with
// smtp_intake. If not, see <https://www.gnu.org/licenses/>.

//! End-to-end tests over TCP, and helpers shared by tests across the crate.

use std::{
    error::Error,
    io,
    net::SocketAddr,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
    thread,
    time::Duration,
};

use futures_util::{pin_mut, StreamExt};
use rustls::{pki_types::CertificateDer, pki_types::ServerName, ClientConfig, RootCertStore};
use tokio::{
    io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader, DuplexStream},
    net::{TcpListener, TcpStream},
    task::JoinHandle,
};
use tokio_rustls::{TlsAcceptor, TlsConnector};

use crate::{
    admission::{Admission, Listener},
    config::ServerConfig,
    connection::{self, CloseReason},
    context::{ConnectionId, ServerContext},
    envelope::{Address, Envelope},
    error::{BackendError, TlsError},
    persistence::{backend::NullBackend, Backend, PersistenceGateway, WorkerPool},
    timeouts, tls,
};


type Result = std::result::Result<(), Box<dyn Error>>;

/// A complete message with a known sender and recipient.
pub fn envelope() -> Envelope {
    Envelope {
        connection_id: ConnectionId::new(1),
        mail_from: Address {
            user: "a".to_string(),
            host: "b.com".to_string(),
        },
        rcpt_to: Address {
            user: "c".to_string(),
            host: "d.com".to_string(),
        },
        subject: "Hello".to_string(),
        body: b"Subject: Hello\r\n\r\nHi\r\n".to_vec(),
        hash: "00112233445566778899aabbccddeeff".to_string(),
        remote_addr: "192.0.2.1:5000".to_string(),
        helo: "client.example".to_string(),
        tls_on: false,
    }
}

/// A backend that keeps what it saves, optionally failing, stalling, or panicking once.
#[derive(Debug, Default)]
pub struct Recording {
    saved: Mutex<Vec<Envelope>>,
    pub fail: bool,
    pub delay: Option<Duration>,
    pub panic_once: AtomicBool,
}

impl Recording {
    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::default()
        }
    }

    pub fn stalling(delay: Duration) -> Self {
        Self {
            delay: Some(delay),
            ..Self::default()
        }
    }

    /// Panics on its first save, then records normally.
    pub fn panicking() -> Self {
        Self {
            panic_once: true.into(),
            ..Self::default()
        }
    }

    pub fn saved(&self) -> Vec<Envelope> {
        self.saved.lock().unwrap().clone()
    }
}

impl Backend for Recording {
    fn name(&self) -> &'static str {
        "recording"
    }

    fn save(&self, envelope: &Envelope) -> std::result::Result<(), BackendError> {
        assert!(
            !self.panic_once.swap(false, Ordering::SeqCst),
            "backend failure"
        );
        if let Some(delay) = self.delay {
            thread::sleep(delay);
        }
        if self.fail {
            return Err(BackendError::Storage("disk full".to_string()));
        }

        self.saved.lock().unwrap().push(envelope.clone());
        Ok(())
    }
}

/// Build a context with two persistence workers running `backend`.
pub fn build_context(
    config: ServerConfig,
    tls: Option<TlsAcceptor>,
    backend: Arc<dyn Backend>,
    ack_timeout: Duration,
) -> Arc<ServerContext> {
    let (gateway, queue) = PersistenceGateway::new(2, ack_timeout);
    // Workers exit once the context, and with it the gateway, is dropped.
    WorkerPool::spawn(&queue, &backend, 2).unwrap();

    let admission = Admission::new(config.max_clients);

    Arc::new(ServerContext::new(config, tls, gateway, admission))
}

/// A plaintext context that discards messages.
pub fn context(config: ServerConfig) -> Arc<ServerContext> {
    build_context(
        config,
        None,
        Arc::new(NullBackend),
        timeouts::SAVE_ACKNOWLEDGEMENT,
    )
}

/// A context with `identity` loaded that discards messages.
pub fn context_with_tls(
    config: ServerConfig,
    identity: &SelfSigned,
) -> std::result::Result<Arc<ServerContext>, TlsError> {
    Ok(build_context(
        config,
        Some(identity.acceptor()?),
        Arc::new(NullBackend),
        timeouts::SAVE_ACKNOWLEDGEMENT,
    ))
}

/// A throwaway certificate for `localhost`.
pub struct SelfSigned {
    certificate_pem: String,
    key_pem: String,
    certificate_der: CertificateDer<'static>,
}

impl SelfSigned {
    pub fn new() -> std::result::Result<Self, rcgen::Error> {
        let rcgen::CertifiedKey { cert, key_pair } =
            rcgen::generate_simple_self_signed(vec!["localhost".to_string()])?;

        Ok(Self {
            certificate_pem: cert.pem(),
            key_pem: key_pair.serialize_pem(),
            certificate_der: cert.der().clone(),
        })
    }

    pub fn certificate_pem(&self) -> &[u8] {
        self.certificate_pem.as_bytes()
    }

    pub fn key_pem(&self) -> &[u8] {
        self.key_pem.as_bytes()
    }

    pub const fn certificate_der(&self) -> &CertificateDer<'static> {
        &self.certificate_der
    }

    pub fn acceptor(&self) -> std::result::Result<TlsAcceptor, TlsError> {
        tls::acceptor_from_pem(self.certificate_pem(), self.key_pem(), None)
    }

    /// Write the certificate and key to temporary files, deleted when the handles drop.
    pub fn write_to_temp_files(
        &self,
    ) -> io::Result<(tempfile::NamedTempFile, tempfile::NamedTempFile)> {
        use std::io::Write;

        let mut certificate = tempfile::NamedTempFile::new()?;
        certificate.write_all(self.certificate_pem())?;

        let mut key = tempfile::NamedTempFile::new()?;
        key.write_all(self.key_pem())?;

        Ok((certificate, key))
    }
}

/// Run the client side of a TLS handshake, trusting only `certificate`.
pub async fn tls_client<S>(
    stream: S,
    certificate: &CertificateDer<'static>,
) -> std::result::Result<tokio_rustls::client::TlsStream<S>, Box<dyn Error + Send + Sync>>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut roots = RootCertStore::empty();
    roots.add(certificate.clone())?;

    let config = ClientConfig::builder_with_provider(Arc::new(
        rustls::crypto::ring::default_provider(),
    ))
    .with_safe_default_protocol_versions()?
    .with_root_certificates(roots)
    .with_no_client_auth();

    let connector = TlsConnector::from(Arc::new(config));

    Ok(connector
        .connect(ServerName::try_from("localhost")?, stream)
        .await?)
}

/// The client end of an SMTP session.
pub struct Client<S> {
    stream: BufReader<S>,
}

impl<S: AsyncRead + AsyncWrite + Unpin> Client<S> {
    pub fn new(stream: S) -> Self {
        Self {
            stream: BufReader::new(stream),
        }
    }

    /// Send `line` followed by `CRLF`.
    pub async fn send(&mut self, line: &str) -> io::Result<()> {
        self.send_raw(format!("{line}\r\n").as_bytes()).await
    }

    pub async fn send_raw(&mut self, bytes: &[u8]) -> io::Result<()> {
        self.stream.write_all(bytes).await?;
        self.stream.flush().await
    }

    /// Read one complete reply, all lines of a multiline one included.
    pub async fn reply(&mut self) -> io::Result<String> {
        let mut reply = String::new();

        loop {
            let mut line = String::new();
            let read = tokio::time::timeout(timeouts::EXPECTED, self.stream.read_line(&mut line))
                .await
                .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "no reply"))??;

            if read == 0 {
                return Err(io::ErrorKind::UnexpectedEof.into());
            }

            reply.push_str(&line);

            if line.as_bytes().get(3) != Some(&b'-') {
                return Ok(reply);
            }
        }
    }

    /// Send `line` and read the reply to it.
    pub async fn command(&mut self, line: &str) -> io::Result<String> {
        self.send(line).await?;
        self.reply().await
    }

    /// Whether the server closes the stream without sending anything else.
    pub async fn is_closed(&mut self) -> bool {
        let mut rest = Vec::new();

        match tokio::time::timeout(timeouts::EXPECTED, self.stream.read_to_end(&mut rest)).await {
            Ok(Ok(_)) => rest.is_empty(),
            Ok(Err(_)) => true,
            Err(_elapsed) => false,
        }
    }

    /// Get the stream back, for a TLS handshake. Nothing may be buffered.
    pub fn into_inner(self) -> S {
        assert!(self.stream.buffer().is_empty());
        self.stream.into_inner()
    }
}

/// Start a session over an in-memory stream.
pub fn session(context: Arc<ServerContext>) -> (Client<DuplexStream>, JoinHandle<CloseReason>) {
    let (client, server) = tokio::io::duplex(64 * 1024);
    let peer: SocketAddr = "192.0.2.1:5000".parse().unwrap();

    (
        Client::new(client),
        tokio::spawn(connection::handle(server, peer, context)),
    )
}

/// Bind a loopback listener sharing `context`'s admission pool and serve it.
async fn spawn_server(context: Arc<ServerContext>) -> io::Result<(SocketAddr, JoinHandle<()>)> {
    let listener = Listener::new(
        TcpListener::bind("127.0.0.1:0").await?,
        context.admission().clone(),
    );
    let address = listener.local_addr()?;

    Ok((address, tokio::spawn(crate::serve(listener, context))))
}

// 4.5.1 Minimum Implementation:
//
// - [x] `EHLO`
// - [x] `HELO`
// - [x] `MAIL`
// - [x] `RCPT`
// - [x] `DATA`
// - [x] `RSET`
// - [x] `NOOP`
// - [ ] `VRFY`
// - [x] `QUIT`
//
// <https://www.rfc-editor.org/rfc/rfc5321.html#section-4.5.1>
#[tokio::test]
async fn test_listen() -> Result {
    let backend = Arc::new(Recording::default());
    let context = build_context(
        ServerConfig::default(),
        None,
        backend.clone(),
        timeouts::SAVE_ACKNOWLEDGEMENT,
    );

    let listener = Listener::new(
        TcpListener::bind("127.0.0.1:0").await?,
        context.admission().clone(),
    );
    let address = listener.local_addr()?;
    let stream = crate::listen(listener, context);

    // Can be bound to a variable which exposes `.abort()`
    let sessions = tokio::spawn(async move {
        pin_mut!(stream);

        // Get the `Next`, unwrap the accept, and await the session's `JoinHandle`.
        stream.next().await.unwrap().unwrap().await.unwrap()
    });

    let mut client = Client::new(TcpStream::connect(address).await?);

    assert!(is_valid_response::server_greeting(&client.reply().await?));
    assert!(is_valid_response::ehlo(&client.command("EHLO test").await?));
    assert_eq!(client.command("MAIL FROM:<a@b.com>").await?, "250 OK\r\n");
    assert_eq!(client.command("RCPT TO:<c@d.com>").await?, "250 Accepted\r\n");
    assert!(client.command("DATA").await?.starts_with("354"));

    client
        .send_raw(b"Subject: Hello\r\n World\r\n\r\nHi there.\r\n.\r\n")
        .await?;
    assert!(is_valid_response::queued(&client.reply().await?));

    // Still open for more.
    assert_eq!(client.command("NOOP").await?, "250 OK\r\n");
    assert!(is_valid_response::quit(&client.command("QUIT").await?));

    assert_eq!(sessions.await?, CloseReason::Quit);

    let saved = backend.saved();
    assert_eq!(saved.len(), 1);
    assert_eq!(saved[0].subject, "Hello World");
    assert_eq!(saved[0].body, b"Subject: Hello\r\n World\r\n\r\nHi there.\r\n");
    assert_eq!(saved[0].helo, "test");

    Ok(())
}

#[tokio::test]
async fn test_admission_bound() -> Result {
    let context = context(ServerConfig {
        max_clients: 1,
        ..ServerConfig::default()
    });
    let (address, server) = spawn_server(context).await?;

    let mut first = Client::new(TcpStream::connect(address).await?);
    assert!(is_valid_response::server_greeting(&first.reply().await?));

    // The kernel completes the handshake, but the server does not accept it yet.
    let mut second = Client::new(TcpStream::connect(address).await?);
    let early = tokio::time::timeout(Duration::from_millis(200), second.reply()).await;
    assert!(early.is_err(), "second connection was served: {early:?}");

    assert!(is_valid_response::quit(&first.command("QUIT").await?));

    assert!(is_valid_response::server_greeting(&second.reply().await?));
    assert!(is_valid_response::quit(&second.command("QUIT").await?));

    server.abort();
    Ok(())
}

#[tokio::test]
async fn test_serve_stops_when_admission_closes() -> Result {
    let context = context(ServerConfig::default());
    let admission = context.admission().clone();
    let (_, server) = spawn_server(context).await?;

    admission.close();

    tokio::time::timeout(timeouts::EXPECTED, server).await??;
    Ok(())
}

#[tokio::test]
async fn test_connection_ids_increase() -> Result {
    let context = context(ServerConfig::default());
    let (address, server) = spawn_server(context).await?;

    for expected in ["#1 ", "#2 "] {
        let mut client = Client::new(TcpStream::connect(address).await?);
        let greeting = client.reply().await?;
        assert!(greeting.contains(expected), "{greeting}");

        client.command("QUIT").await?;
    }

    server.abort();
    Ok(())
}
