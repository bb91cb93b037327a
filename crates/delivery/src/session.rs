/*
 * Petrel mail delivery agent
 *
 * Copyright (C) 2003 - viridIT SAS
 * Licensed under the Elastic License 2.0
 *
 * You should have received a copy of the Elastic License 2.0 along with
 * this program. If not, see https://www.elastic.co/licensing/elastic-license.
 *
 */

use crate::config::{DeliveryConfig, Protocol};
use crate::tls::Requirement;
use petrel_common::extensions::Extension;
use petrel_common::response::Ehlo;
use petrel_common::transfer_error::{Lookup, Protocol as ProtocolError, Transfer, Transport};
use petrel_protocol::{command, rustls, tokio_rustls};
use petrel_protocol::{Reader, Reply, Severity, Transcript, Writer};

type TlsStream = tokio_rustls::client::TlsStream<tokio::net::TcpStream>;

enum SessionIo {
    Plain {
        reader: Reader<tokio::net::tcp::OwnedReadHalf>,
        writer: Writer<tokio::net::tcp::OwnedWriteHalf>,
    },
    Tls {
        reader: Reader<tokio::io::ReadHalf<TlsStream>>,
        writer: Writer<tokio::io::WriteHalf<TlsStream>>,
    },
}

/// An established session with a destination server, greeted and upgraded,
/// holding everything learned during the handshake.
pub struct Session {
    io: SessionIo,
    peer: std::net::SocketAddr,
    ehlo: Ehlo,
    transcript: Transcript,
    /// Deliveries this session has completed so far.
    deliveries: usize,
    /// The server broke protocol at some point; never park such a session.
    bad: bool,
    keep_open: bool,
}

async fn timed_reply<R: tokio::io::AsyncRead + Unpin + Send>(
    reader: &mut Reader<R>,
    transcript: &mut Transcript,
    timeout: std::time::Duration,
    during: &str,
) -> Result<Reply, Transfer> {
    match tokio::time::timeout(timeout, reader.read_reply(transcript)).await {
        Ok(Ok(reply)) => Ok(reply),
        Ok(Err(error)) => Err(Transport::from_io(&error, during).into()),
        Err(_elapsed) => Err(Transport::Timeout {
            during: during.to_owned(),
        }
        .into()),
    }
}

/// Host name the greeting banner announces, the token right after the code.
fn greeted_name(banner: &Reply) -> Option<&str> {
    let first = banner.lines().next()?;
    let rest = first.get(3..)?;
    let rest = rest
        .strip_prefix(|token: char| token == '-' || token == ' ')
        .unwrap_or(rest);
    rest.split_whitespace().next()
}

fn tls_connector() -> tokio_rustls::TlsConnector {
    let mut root_store = rustls::RootCertStore::empty();

    root_store.add_trust_anchors(webpki_roots::TLS_SERVER_ROOTS.iter().map(|ta| {
        rustls::OwnedTrustAnchor::from_subject_spki_name_constraints(
            ta.subject,
            ta.spki,
            ta.name_constraints,
        )
    }));

    let config = rustls::ClientConfig::builder()
        .with_safe_defaults()
        .with_root_certificates(root_store)
        .with_no_client_auth();

    tokio_rustls::TlsConnector::from(std::sync::Arc::new(config))
}

/// Send `EHLO`/`LHLO` and parse what came back. An old server may reject
/// `EHLO` outright, in which case `helo_fallback` is tried before giving up.
async fn hello_exchange<R, W>(
    reader: &mut Reader<R>,
    writer: &mut Writer<W>,
    transcript: &mut Transcript,
    timeout: std::time::Duration,
    hello: &str,
    helo_fallback: Option<&str>,
) -> Result<Ehlo, Transfer>
where
    R: tokio::io::AsyncRead + Unpin + Send,
    W: tokio::io::AsyncWrite + Unpin + Send,
{
    transcript.command(hello);
    writer
        .write_all(hello)
        .await
        .map_err(|error| Transport::from_io(&error, "sending EHLO"))?;
    writer
        .flush()
        .await
        .map_err(|error| Transport::from_io(&error, "sending EHLO"))?;

    let mut reply = timed_reply(reader, transcript, timeout, "reading the EHLO reply").await?;

    if let Some(helo) = helo_fallback {
        if matches!(reply.severity(), Severity::PermanentNegative) {
            tracing::debug!(%reply, "EHLO rejected, trying HELO");

            transcript.command(helo);
            writer
                .write_all(helo)
                .await
                .map_err(|error| Transport::from_io(&error, "sending HELO"))?;
            writer
                .flush()
                .await
                .map_err(|error| Transport::from_io(&error, "sending HELO"))?;

            reply =
                timed_reply(reader, transcript, timeout, "reading the HELO reply").await?;
        }
    }

    Ok(Ehlo::try_from(reply)?)
}

/// A connection attempt that did not produce a usable session, with the
/// transcript of however far the handshake got.
pub(crate) struct ConnectFailure {
    pub(crate) error: Transfer,
    pub(crate) transcript: Transcript,
}

impl Session {
    /// Open a session: connect, read the greeting, introduce ourselves and
    /// upgrade to TLS as configured.
    ///
    /// `destination` is the nexthop as addressed, only used to report loops;
    /// `name` is the host the `address` belongs to and becomes the TLS
    /// server name.
    ///
    /// # Errors
    ///
    /// * the server was unreachable, unwilling or spoke garbage
    /// * the greeting banner carried our own name, mail would loop
    pub(crate) async fn connect(
        config: &DeliveryConfig,
        destination: &str,
        name: &str,
        address: std::net::IpAddr,
        port: u16,
    ) -> Result<Self, ConnectFailure> {
        let mut transcript = Transcript::new(config.transcript_limit);
        match Self::establish(config, destination, name, address, port, &mut transcript).await {
            Ok(session) => Ok(session),
            Err(error) => Err(ConnectFailure { error, transcript }),
        }
    }

    async fn establish(
        config: &DeliveryConfig,
        destination: &str,
        name: &str,
        address: std::net::IpAddr,
        port: u16,
        transcript: &mut Transcript,
    ) -> Result<Self, Transfer> {
        let target = format!("{name}[{address}]:{port}");
        tracing::debug!(%target, "connecting");

        let socket = match tokio::time::timeout(
            config.timeouts.connect,
            tokio::net::TcpStream::connect((address, port)),
        )
        .await
        {
            Ok(Ok(socket)) => socket,
            Ok(Err(error)) => {
                return Err(Transport::Connect {
                    target,
                    message: error.to_string(),
                }
                .into())
            }
            Err(_elapsed) => {
                return Err(Transport::Connect {
                    target,
                    message: "connection timeout reached".to_owned(),
                }
                .into())
            }
        };

        let peer = std::net::SocketAddr::new(address, port);
        let (read, write) = socket.into_split();
        let mut reader = Reader::new(read, config.reply_text_cap);
        let mut writer = Writer::new(write);

        let greeting = timed_reply(
            &mut reader,
            transcript,
            config.timeouts.greeting,
            "reading the greeting",
        )
        .await?;

        if greeting.is_protocol_error() {
            return Err(ProtocolError::MalformedReply {
                during: "reading the greeting".to_owned(),
                reply: greeting,
            }
            .into());
        }
        if !matches!(greeting.severity(), Severity::PositiveCompletion) {
            return Err(ProtocolError::ServerReject {
                request: "connection attempt".to_owned(),
                reply: greeting,
            }
            .into());
        }

        let helo_name = config.helo_name.to_string();
        if greeted_name(&greeting)
            .is_some_and(|greeted| greeted.eq_ignore_ascii_case(&helo_name))
        {
            tracing::warn!(%target, "the server greeted us with our own name");
            return Err(Lookup::Loop {
                destination: destination.to_owned(),
            }
            .into());
        }

        let hello = match config.protocol {
            Protocol::Smtp => command::ehlo(&config.helo_name),
            Protocol::Lmtp => command::lhlo(&config.helo_name),
        };
        let helo_fallback = match config.protocol {
            Protocol::Smtp => Some(command::helo(&config.helo_name)),
            Protocol::Lmtp => None,
        };

        let ehlo = hello_exchange(
            &mut reader,
            &mut writer,
            transcript,
            config.timeouts.helo,
            &hello,
            helo_fallback.as_deref(),
        )
        .await?;

        let upgrade = match config.tls.starttls {
            Requirement::Required if !ehlo.contains(Extension::StartTls) => {
                return Err(Transport::Io {
                    message: format!("TLS is required, but was not offered by {target}"),
                }
                .into())
            }
            Requirement::Optional if !ehlo.contains(Extension::StartTls) => false,
            Requirement::Required | Requirement::Optional => true,
            Requirement::Disabled => false,
        };

        if !upgrade {
            return Ok(Self {
                io: SessionIo::Plain { reader, writer },
                peer,
                ehlo,
                transcript: std::mem::take(transcript),
                deliveries: 0,
                bad: false,
                keep_open: false,
            });
        }

        transcript.command(command::STARTTLS);
        writer
            .write_all(command::STARTTLS)
            .await
            .map_err(|error| Transport::from_io(&error, "sending STARTTLS"))?;
        writer
            .flush()
            .await
            .map_err(|error| Transport::from_io(&error, "sending STARTTLS"))?;

        let go_ahead = timed_reply(
            &mut reader,
            transcript,
            config.timeouts.starttls,
            "reading the STARTTLS reply",
        )
        .await?;
        if go_ahead.code().value() != 220 {
            return Err(ProtocolError::ServerReject {
                request: "STARTTLS command".to_owned(),
                reply: go_ahead,
            }
            .into());
        }

        let stream = writer
            .into_inner()
            .reunite(reader.into_inner())
            .expect("valid stream/sink pair");

        let sni = rustls::ServerName::try_from(name).map_err(|error| Transport::Io {
            message: format!("invalid TLS server name '{name}': {error}"),
        })?;

        let stream = tls_connector()
            .connect(sni, stream)
            .await
            .map_err(|error| Transport::Io {
                message: format!("TLS handshake with {target} failed: {error}"),
            })?;

        let (read, write) = tokio::io::split(stream);
        let mut reader = Reader::new(read, config.reply_text_cap);
        let mut writer = Writer::new(write);

        // what the server offers may have changed now that the channel is
        // private, RFC 3207 section 4.2.
        let ehlo = hello_exchange(
            &mut reader,
            &mut writer,
            transcript,
            config.timeouts.helo,
            &hello,
            None,
        )
        .await?;

        Ok(Self {
            io: SessionIo::Tls { reader, writer },
            peer,
            ehlo,
            transcript: std::mem::take(transcript),
            deliveries: 0,
            bad: false,
            keep_open: false,
        })
    }

    pub(crate) const fn ehlo(&self) -> &Ehlo {
        &self.ehlo
    }

    pub(crate) const fn peer(&self) -> std::net::SocketAddr {
        self.peer
    }

    pub(crate) const fn transcript(&self) -> &Transcript {
        &self.transcript
    }

    pub(crate) const fn is_bad(&self) -> bool {
        self.bad
    }

    pub(crate) fn mark_bad(&mut self) {
        self.bad = true;
    }

    pub(crate) const fn keep_open(&self) -> bool {
        self.keep_open
    }

    pub(crate) fn set_keep_open(&mut self, keep_open: bool) {
        self.keep_open = keep_open;
    }

    pub(crate) const fn deliveries(&self) -> usize {
        self.deliveries
    }

    pub(crate) fn record_delivery(&mut self) {
        self.deliveries += 1;
        self.keep_open = false;
    }

    /// Record a command in the transcript without sending anything, for
    /// commands accumulated into a pipelined batch.
    pub(crate) fn note_command(&mut self, command: &str) {
        self.transcript.command(command);
    }

    /// Send one command, transcribed.
    pub(crate) async fn write_all(&mut self, command: &str) -> std::io::Result<()> {
        self.transcript.command(command);
        self.write_all_bytes(command.as_bytes()).await
    }

    /// Send a line whose content must not end up in the transcript.
    pub(crate) async fn write_sensitive(&mut self, line: &str) -> std::io::Result<()> {
        self.transcript.command("(authentication data withheld)");
        self.write_all_bytes(line.as_bytes()).await
    }

    /// Send raw bytes, not transcribed; batches are transcribed as they are
    /// built and message content has no place in a transcript.
    pub(crate) async fn write_all_bytes(&mut self, bytes: &[u8]) -> std::io::Result<()> {
        match &mut self.io {
            SessionIo::Plain { writer, .. } => writer.write_all_bytes(bytes).await,
            SessionIo::Tls { writer, .. } => writer.write_all_bytes(bytes).await,
        }
    }

    pub(crate) async fn flush(&mut self) -> std::io::Result<()> {
        match &mut self.io {
            SessionIo::Plain { writer, .. } => writer.flush().await,
            SessionIo::Tls { writer, .. } => writer.flush().await,
        }
    }

    pub(crate) async fn read_reply(&mut self) -> std::io::Result<Reply> {
        match &mut self.io {
            SessionIo::Plain { reader, .. } => reader.read_reply(&mut self.transcript).await,
            SessionIo::Tls { reader, .. } => reader.read_reply(&mut self.transcript).await,
        }
    }
}
