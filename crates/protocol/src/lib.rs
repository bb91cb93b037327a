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

//! Client side of the SMTP/LMTP wire protocol: command builders, reply
//! parsing and the transaction state machine, with no policy attached.

pub mod command;
mod reader;
mod state;
mod transcript;
mod writer;

pub mod auth {
    mod credentials;

    pub use credentials::Credentials;
}

mod types {
    pub mod address;
    pub mod client_name;
    pub mod domain;
    pub mod reply;
    pub mod reply_code;
}

pub use command::{
    BodyType, DsnReturn, MailParams, NotifyOn, OriginalRecipient, XforwardAttrs, XforwardParams,
};
pub use reader::Reader;
pub use state::ProtocolState;
pub use tokio_rustls;
pub use tokio_rustls::rustls;
pub use transcript::Transcript;
pub use types::{
    address::Address, client_name::ClientName, domain::Domain, reply::Reply,
    reply_code::{ReplyCode, Severity},
};
pub use writer::{BodyEncoder, Writer};
