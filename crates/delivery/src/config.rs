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

use crate::tls::Tls;
use petrel_common::dns::AddressFamily;
use petrel_common::request::SiteName;
use petrel_common::transfer_error::NotifyClass;
use petrel_protocol::auth::Credentials;
use petrel_protocol::{ClientName, ProtocolState};

/// Protocol spoken with the destination server.
#[derive(
    Debug,
    Default,
    Copy,
    Clone,
    PartialEq,
    Eq,
    strum::Display,
    serde::Serialize,
    serde::Deserialize,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "UPPERCASE")]
pub enum Protocol {
    #[default]
    Smtp,
    Lmtp,
}

impl Protocol {
    #[must_use]
    pub const fn is_lmtp(self) -> bool {
        matches!(self, Self::Lmtp)
    }
}

/// How long to wait for the reply expected in each protocol state.
///
/// Replies to pipelined commands are drained at sync points, so the timer for
/// a state only starts once its reply becomes the next one to read.
#[derive(Debug, Copy, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StateTimeouts {
    /// TCP connection establishment.
    #[serde(default = "StateTimeouts::default_connect", with = "humantime_serde")]
    pub connect: std::time::Duration,
    /// Greeting banner after the connection is up.
    #[serde(default = "StateTimeouts::default_greeting", with = "humantime_serde")]
    pub greeting: std::time::Duration,
    /// `HELO`, `EHLO` or `LHLO` reply.
    #[serde(default = "StateTimeouts::default_helo", with = "humantime_serde")]
    pub helo: std::time::Duration,
    /// `STARTTLS` go-ahead, not the handshake itself.
    #[serde(default = "StateTimeouts::default_starttls", with = "humantime_serde")]
    pub starttls: std::time::Duration,
    /// Either of the two `XFORWARD` replies.
    #[serde(default = "StateTimeouts::default_xforward", with = "humantime_serde")]
    pub xforward: std::time::Duration,
    /// `MAIL FROM` reply.
    #[serde(default = "StateTimeouts::default_mail", with = "humantime_serde")]
    pub mail: std::time::Duration,
    /// Each `RCPT TO` reply.
    #[serde(default = "StateTimeouts::default_rcpt", with = "humantime_serde")]
    pub rcpt: std::time::Duration,
    /// `DATA` go-ahead.
    #[serde(default = "StateTimeouts::default_data_init", with = "humantime_serde")]
    pub data_init: std::time::Duration,
    /// Each write while streaming the message body.
    #[serde(default = "StateTimeouts::default_data_block", with = "humantime_serde")]
    pub data_block: std::time::Duration,
    /// Reply to the final dot.
    #[serde(default = "StateTimeouts::default_data_done", with = "humantime_serde")]
    pub data_done: std::time::Duration,
    /// `RSET` reply.
    #[serde(default = "StateTimeouts::default_rset", with = "humantime_serde")]
    pub rset: std::time::Duration,
    /// `QUIT` reply, when one is awaited at all.
    #[serde(default = "StateTimeouts::default_quit", with = "humantime_serde")]
    pub quit: std::time::Duration,
}

impl StateTimeouts {
    const fn default_connect() -> std::time::Duration {
        std::time::Duration::from_secs(30)
    }

    const fn default_greeting() -> std::time::Duration {
        std::time::Duration::from_secs(300)
    }

    const fn default_helo() -> std::time::Duration {
        std::time::Duration::from_secs(300)
    }

    const fn default_starttls() -> std::time::Duration {
        std::time::Duration::from_secs(300)
    }

    const fn default_xforward() -> std::time::Duration {
        std::time::Duration::from_secs(300)
    }

    const fn default_mail() -> std::time::Duration {
        std::time::Duration::from_secs(300)
    }

    const fn default_rcpt() -> std::time::Duration {
        std::time::Duration::from_secs(300)
    }

    const fn default_data_init() -> std::time::Duration {
        std::time::Duration::from_secs(120)
    }

    const fn default_data_block() -> std::time::Duration {
        std::time::Duration::from_secs(180)
    }

    const fn default_data_done() -> std::time::Duration {
        std::time::Duration::from_secs(600)
    }

    const fn default_rset() -> std::time::Duration {
        std::time::Duration::from_secs(20)
    }

    const fn default_quit() -> std::time::Duration {
        std::time::Duration::from_secs(300)
    }

    /// Timeout applied while waiting for the reply of the given state.
    #[must_use]
    pub const fn for_state(&self, state: ProtocolState) -> std::time::Duration {
        match state {
            ProtocolState::XfwdNameAddr | ProtocolState::XfwdProtoHelo => self.xforward,
            ProtocolState::Mail => self.mail,
            ProtocolState::Rcpt => self.rcpt,
            ProtocolState::Data => self.data_init,
            ProtocolState::Dot => self.data_done,
            ProtocolState::Abort | ProtocolState::Rset => self.rset,
            ProtocolState::Quit | ProtocolState::Last => self.quit,
        }
    }
}

impl Default for StateTimeouts {
    fn default() -> Self {
        Self {
            connect: Self::default_connect(),
            greeting: Self::default_greeting(),
            helo: Self::default_helo(),
            starttls: Self::default_starttls(),
            xforward: Self::default_xforward(),
            mail: Self::default_mail(),
            rcpt: Self::default_rcpt(),
            data_init: Self::default_data_init(),
            data_block: Self::default_data_block(),
            data_done: Self::default_data_done(),
            rset: Self::default_rset(),
            quit: Self::default_quit(),
        }
    }
}

/// Everything a delivery attempt needs to know besides the message itself.
///
/// The configuration is read once per attempt and never changes while the
/// attempt runs.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DeliveryConfig {
    /// Name announced in `HELO`/`EHLO`/`LHLO`.
    #[serde(default = "DeliveryConfig::default_helo_name")]
    pub helo_name: ClientName,
    #[serde(default)]
    pub protocol: Protocol,
    /// Port used when the destination does not carry one. 25.
    #[serde(default = "DeliveryConfig::default_port")]
    pub port: u16,
    /// Send the upstream client attributes via `XFORWARD` when offered.
    #[serde(default)]
    pub send_xforward: bool,
    #[serde(default)]
    pub tls: Tls,
    /// Handed to the `AUTH` callback when the server offers authentication.
    #[serde(default)]
    pub credentials: Option<Credentials>,
    #[serde(default)]
    pub timeouts: StateTimeouts,
    /// How long a pipelined session may stay quiet before pending replies
    /// are drained anyway.
    #[serde(
        default = "DeliveryConfig::default_pipeline_stall_limit",
        with = "humantime_serde"
    )]
    pub pipeline_stall_limit: std::time::Duration,
    /// Pipelined commands are flushed once the batch reaches this size.
    #[serde(default = "DeliveryConfig::default_send_buffer_size")]
    pub send_buffer_size: usize,
    /// Longest reply text kept in memory; the rest is discarded.
    #[serde(default = "DeliveryConfig::default_reply_text_cap")]
    pub reply_text_cap: usize,
    /// Transcript lines kept for postmaster copies.
    #[serde(default = "DeliveryConfig::default_transcript_limit")]
    pub transcript_limit: usize,
    /// Body lines longer than this are folded on output. 0 disables folding.
    #[serde(default = "DeliveryConfig::default_line_length_limit")]
    pub line_length_limit: usize,
    /// Addresses tried per destination before giving up. 0 removes the cap.
    #[serde(default = "DeliveryConfig::default_address_attempt_cap")]
    pub address_attempt_cap: usize,
    /// Sessions opened in total for one delivery attempt.
    #[serde(default = "DeliveryConfig::default_session_attempt_cap")]
    pub session_attempt_cap: usize,
    /// Deliveries a cached session may carry before it is closed.
    /// 0 disables session reuse.
    #[serde(default)]
    pub session_reuse_limit: usize,
    /// Destinations tried after every address of the primary one failed
    /// with a soft error.
    #[serde(default)]
    pub fallback_relays: Vec<SiteName>,
    /// Transport the message is handed back to when this instance turns out
    /// to be the preferred MX for the destination.
    #[serde(default)]
    pub best_mx_transport: Option<String>,
    /// Send `QUIT` and close without waiting for the reply.
    #[serde(default = "DeliveryConfig::default_skip_quit_response")]
    pub skip_quit_response: bool,
    /// Fall back to the destination host itself when the MX lookup fails
    /// with a transient error.
    #[serde(default)]
    pub tolerate_mx_errors: bool,
    /// Treat every destination as a host name, skipping MX lookups.
    #[serde(default)]
    pub disable_dns: bool,
    #[serde(default)]
    pub address_family: AddressFamily,
    /// Addresses this instance answers on, used to detect delivery loops.
    #[serde(default)]
    pub local_addresses: Vec<std::net::IpAddr>,
    /// Failure classes which produce a postmaster copy of the transcript.
    #[serde(default = "DeliveryConfig::default_notify_classes")]
    pub notify_classes: Vec<NotifyClass>,
}

impl DeliveryConfig {
    fn default_helo_name() -> ClientName {
        hostname::get()
            .ok()
            .and_then(|name| name.into_string().ok())
            .and_then(|name| name.parse().ok())
            .unwrap_or(ClientName::Ip4(std::net::Ipv4Addr::LOCALHOST))
    }

    const fn default_port() -> u16 {
        25
    }

    const fn default_pipeline_stall_limit() -> std::time::Duration {
        std::time::Duration::from_secs(2)
    }

    const fn default_send_buffer_size() -> usize {
        4096
    }

    const fn default_reply_text_cap() -> usize {
        4096
    }

    const fn default_transcript_limit() -> usize {
        petrel_protocol::Transcript::DEFAULT_LIMIT
    }

    const fn default_line_length_limit() -> usize {
        998
    }

    const fn default_address_attempt_cap() -> usize {
        5
    }

    const fn default_session_attempt_cap() -> usize {
        2
    }

    const fn default_skip_quit_response() -> bool {
        true
    }

    fn default_notify_classes() -> Vec<NotifyClass> {
        vec![NotifyClass::Resource, NotifyClass::Protocol]
    }
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            helo_name: Self::default_helo_name(),
            protocol: Protocol::default(),
            port: Self::default_port(),
            send_xforward: false,
            tls: Tls::default(),
            credentials: None,
            timeouts: StateTimeouts::default(),
            pipeline_stall_limit: Self::default_pipeline_stall_limit(),
            send_buffer_size: Self::default_send_buffer_size(),
            reply_text_cap: Self::default_reply_text_cap(),
            transcript_limit: Self::default_transcript_limit(),
            line_length_limit: Self::default_line_length_limit(),
            address_attempt_cap: Self::default_address_attempt_cap(),
            session_attempt_cap: Self::default_session_attempt_cap(),
            session_reuse_limit: 0,
            fallback_relays: vec![],
            best_mx_transport: None,
            skip_quit_response: Self::default_skip_quit_response(),
            tolerate_mx_errors: false,
            disable_dns: false,
            address_family: AddressFamily::default(),
            local_addresses: vec![],
            notify_classes: Self::default_notify_classes(),
        }
    }
}
