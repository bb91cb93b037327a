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

//! Fabricated model values for tests.

use crate::{Mailbox, Recipient};
use fake::{
    faker::{
        internet::en::FreeEmailProvider,
        name::en::{FirstName, LastName},
    },
    Fake,
};
use petrel_protocol::{Address, Domain, NotifyOn, OriginalRecipient};

pub struct NameFaker;

impl fake::Dummy<NameFaker> for Domain {
    fn dummy_with_rng<R: rand::Rng + ?Sized>(_: &NameFaker, rng: &mut R) -> Self {
        FreeEmailProvider()
            .fake_with_rng::<String, _>(rng)
            .parse()
            .unwrap()
    }
}

/// `first.last@domain`, on the given domain or a fabricated one.
pub struct MailboxFaker {
    pub domain: Option<Domain>,
}

impl fake::Dummy<MailboxFaker> for Address {
    fn dummy_with_rng<R: rand::Rng + ?Sized>(config: &MailboxFaker, rng: &mut R) -> Self {
        let first: String = FirstName().fake_with_rng(rng);
        let last: String = LastName().fake_with_rng(rng);
        let domain = config
            .domain
            .clone()
            .unwrap_or_else(|| NameFaker.fake_with_rng(rng));

        format!("{first}.{last}@{domain}").parse().unwrap()
    }
}

pub struct NotifyOnFaker;

impl fake::Dummy<NotifyOnFaker> for NotifyOn {
    fn dummy_with_rng<R: rand::Rng + ?Sized>(_: &NotifyOnFaker, rng: &mut R) -> Self {
        if rng.gen_bool(0.2) {
            return Self::Never;
        }
        Self::Some {
            success: rng.gen_bool(0.4),
            failure: rng.gen_bool(0.8),
            delay: rng.gen_bool(0.2),
        }
    }
}

impl fake::Dummy<fake::Faker> for Recipient {
    fn dummy_with_rng<R: rand::Rng + ?Sized>(config: &fake::Faker, rng: &mut R) -> Self {
        Self {
            forward_path: Mailbox::dummy_with_rng(config, rng),
            original_forward_path: rng.gen_bool(0.1).then(|| OriginalRecipient {
                addr_type: "rfc822".to_string(),
                mailbox: MailboxFaker { domain: None }.fake_with_rng(rng),
            }),
            notify_on: NotifyOnFaker.fake_with_rng(rng),
        }
    }
}
