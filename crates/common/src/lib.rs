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

//! Types shared by everything that prepares or performs a delivery:
//! the delivery request, recipient bookkeeping, server feature sets,
//! error taxonomy and the DNS client.

pub mod dns;
pub mod extensions;
pub mod faker;
pub mod outcome;
pub mod request;
pub mod response;
pub mod transfer_error;

pub use trust_dns_resolver;
pub use uuid;

use crate::faker::MailboxFaker;
use petrel_protocol::{Address, Domain, NotifyOn, OriginalRecipient};

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize, fake::Dummy)]
pub struct Mailbox(#[dummy(faker = "MailboxFaker { domain: None }")] pub Address);

impl std::fmt::Display for Mailbox {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Mailbox {
    #[must_use]
    pub fn local_part(&self) -> &str {
        self.0.local_part()
    }

    #[must_use]
    pub fn domain(&self) -> Domain {
        self.0.domain()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Recipient {
    pub forward_path: Mailbox,
    /// rfc 3461
    pub original_forward_path: Option<OriginalRecipient>,
    /// rfc 3461
    pub notify_on: NotifyOn,
}
