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

//! Outbound SMTP/LMTP delivery.
//!
//! The [`send::SmtpClient`] takes a [`petrel_common::request::DeliveryRequest`],
//! resolves where it should go, and runs the wire conversation until every
//! recipient has a final disposition. The caller plugs in through
//! [`handler::DeliveryHandler`]: it provides the message content and gets
//! told what happened to whom.
//!
//! ```no_run
//! # use std::sync::Arc;
//! use petrel_common::dns::{DnsClient, DnsResolver};
//! use petrel_common::request::DeliveryRequest;
//! use petrel_delivery::config::DeliveryConfig;
//! use petrel_delivery::send::SmtpClient;
//! # async fn example(
//! #     request: DeliveryRequest,
//! #     mut handler: impl petrel_delivery::handler::DeliveryHandler,
//! # ) {
//! let dns: Arc<dyn DnsClient> = Arc::new(DnsResolver::google());
//! let client = SmtpClient::new(DeliveryConfig::default(), dns);
//! let outcome = client.deliver(request, &mut handler).await;
//! # }
//! ```

pub mod cache;
pub mod config;
pub mod handler;
pub mod resolver;
pub mod send;
pub mod tls;

mod engine;
mod session;

pub use send::SmtpClient;
pub use session::Session;
pub use tls::{Requirement, Tls};
