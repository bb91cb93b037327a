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

//! Delivery of one request: destination resolution, connection management,
//! failover across exchanges and relays.

use std::sync::Arc;

use crate::cache::{CacheKey, SessionCache};
use crate::config::DeliveryConfig;
use crate::engine::{Engine, SessionEntry};
use crate::handler::{AuthExchange, DeliveryHandler};
use crate::resolver::Resolver;
use crate::session::{ConnectFailure, Session};
use petrel_common::dns::DnsClient;
use petrel_common::extensions::Extension;
use petrel_common::outcome::{Action, DeliveryOutcome, RecipientState, Verdict};
use petrel_common::request::DeliveryRequest;
use petrel_common::transfer_error::{ErrorClass, Lookup, Transfer, Transport};
use petrel_protocol::{command, Transcript};

/// How definitive an error is. When several hosts fail differently, the
/// recipients left over hear about the most conclusive failure, ties going
/// to the most recent one.
fn rank(error: &Transfer) -> u8 {
    match error.class() {
        ErrorClass::Soft => 0,
        ErrorClass::Loop => 1,
        ErrorClass::Hard => 2,
    }
}

fn remember(last: &mut Option<Transfer>, error: Transfer) {
    if last.as_ref().map_or(true, |kept| rank(&error) >= rank(kept)) {
        *last = Some(error);
    }
}

fn marked(recipients: &[RecipientState]) -> usize {
    recipients
        .iter()
        .filter(|state| !state.is_unmarked())
        .count()
}

/// Show the postmaster what the server said, when the failure is of a class
/// the configuration wants heard about and there is anything to show.
async fn consider_postmaster_copy<H: DeliveryHandler>(
    config: &DeliveryConfig,
    handler: &mut H,
    error: &Transfer,
    transcript: &Transcript,
) {
    if transcript.is_empty() {
        return;
    }
    let class = error.notify_class();
    if config.notify_classes.contains(&class) {
        handler
            .on_postmaster_copy(class, &error.to_string(), &transcript.render())
            .await;
    }
}

/// Every recipient still undecided gets `verdict`.
async fn settle_unmarked<H: DeliveryHandler>(
    recipients: &mut [RecipientState],
    handler: &mut H,
    keep: bool,
    verdict: &Verdict,
) {
    for state in recipients.iter_mut() {
        let recorded = if keep {
            state.mark_keep(verdict.clone())
        } else {
            state.mark_drop(verdict.clone())
        };
        if recorded {
            handler
                .on_disposition(state.recipient(), state.disposition())
                .await;
        }
    }
}

/// SMTP/LMTP delivery client.
///
/// One instance serves any number of requests; the configuration, the DNS
/// client and the optional session cache are shared by all of them.
pub struct SmtpClient {
    config: DeliveryConfig,
    dns: Arc<dyn DnsClient>,
    cache: Option<Arc<dyn SessionCache>>,
}

impl SmtpClient {
    #[must_use]
    pub fn new(config: DeliveryConfig, dns: Arc<dyn DnsClient>) -> Self {
        Self {
            config,
            dns,
            cache: None,
        }
    }

    /// Park healthy sessions in `cache` after use and look there before
    /// connecting anywhere.
    #[must_use]
    pub fn with_cache(mut self, cache: Arc<dyn SessionCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    #[must_use]
    pub const fn config(&self) -> &DeliveryConfig {
        &self.config
    }

    /// Deliver one request, walking the destination's exchanges and the
    /// configured fallback relays until every recipient has a fate.
    ///
    /// This never fails as such: anything that goes wrong along the way is
    /// folded into the per-recipient dispositions of the outcome. The only
    /// outcome that leaves recipients undecided is a reroute, which asks the
    /// caller to hand the whole request to another transport.
    #[tracing::instrument(skip_all, fields(message = %request.uuid, nexthop = %request.nexthop))]
    pub async fn deliver<H: DeliveryHandler>(
        &self,
        request: DeliveryRequest,
        handler: &mut H,
    ) -> DeliveryOutcome {
        let mut recipients: Vec<_> = request
            .rcpt_to
            .iter()
            .cloned()
            .map(RecipientState::new)
            .collect();

        let resolver = Resolver::new(self.dns.clone(), &self.config);
        let mut last_error: Option<Transfer> = None;
        let mut sessions = 0_usize;

        'sites: for site in
            std::iter::once(&request.nexthop).chain(self.config.fallback_relays.iter())
        {
            if recipients.iter().all(|state| !state.is_unmarked()) {
                break;
            }

            let resolved = match resolver.resolve(site).await {
                Ok(resolved) => resolved,
                Err(error @ Lookup::Loop { .. }) => {
                    // relaying anywhere else would still come back to us
                    remember(&mut last_error, error.into());
                    break 'sites;
                }
                Err(error) => {
                    tracing::debug!(destination = %site, %error, "destination did not resolve");
                    remember(&mut last_error, error.into());
                    continue 'sites;
                }
            };

            if resolved.best_is_local {
                if let Some(transport) = &self.config.best_mx_transport {
                    tracing::info!(destination = %site, transport, "we are the best exchange, rerouting");
                    return DeliveryOutcome::Reroute {
                        transport: transport.clone(),
                        recipients,
                    };
                }
                remember(
                    &mut last_error,
                    Lookup::Loop {
                        destination: site.to_string(),
                    }
                    .into(),
                );
                break 'sites;
            }

            let port = site.port().unwrap_or(self.config.port);

            for candidate in &resolved.candidates {
                if recipients.iter().all(|state| !state.is_unmarked()) {
                    break 'sites;
                }
                if self.config.session_attempt_cap > 0
                    && sessions >= self.config.session_attempt_cap
                {
                    tracing::debug!(
                        cap = self.config.session_attempt_cap,
                        "giving up, session cap reached"
                    );
                    break 'sites;
                }

                let key = CacheKey {
                    service: self.config.protocol.to_string(),
                    address: candidate.address,
                    port,
                    helo_name: self.config.helo_name.to_string(),
                };

                let mut force_fresh = false;
                loop {
                    let cached = if force_fresh {
                        None
                    } else {
                        self.checkout(&key).await
                    };
                    let (mut session, entry) = match cached {
                        Some(session) => (session, SessionEntry::Reused),
                        None => {
                            let fresh = Session::connect(
                                &self.config,
                                &site.to_string(),
                                &candidate.name,
                                candidate.address,
                                port,
                            )
                            .await;
                            match fresh {
                                Ok(session) => (session, SessionEntry::Fresh),
                                Err(ConnectFailure { error, transcript }) => {
                                    tracing::debug!(host = %candidate.name, address = %candidate.address, %error, "connection failed");
                                    consider_postmaster_copy(
                                        &self.config,
                                        handler,
                                        &error,
                                        &transcript,
                                    )
                                    .await;
                                    remember(&mut last_error, error);
                                    break;
                                }
                            }
                        }
                    };
                    sessions += 1;

                    // cached sessions authenticated when first opened
                    if entry == SessionEntry::Fresh {
                        if let Err(error) = self.authenticate(&mut session, handler).await {
                            tracing::debug!(host = %candidate.name, %error, "authentication failed");
                            consider_postmaster_copy(
                                &self.config,
                                handler,
                                &error,
                                session.transcript(),
                            )
                            .await;
                            remember(&mut last_error, error);
                            break;
                        }
                    }

                    if let Some(limit) = session.ehlo().size_limit() {
                        if limit > 0 && request.size_estimate > limit {
                            // no point asking any other server to take it
                            let verdict = Verdict {
                                action: Action::Failed,
                                status: "5.3.4".to_owned(),
                                diagnostic: format!(
                                    "message size {} exceeds size limit {} of server {}",
                                    request.size_estimate, limit, candidate.name
                                ),
                            };
                            settle_unmarked(&mut recipients, handler, false, &verdict).await;
                            let _ = session.write_all(command::QUIT).await;
                            let _ = session.flush().await;
                            break 'sites;
                        }
                    }

                    let marks_before = marked(&recipients);
                    let outcome = Engine::new(
                        &self.config,
                        &mut session,
                        handler,
                        &request,
                        &mut recipients,
                        self.cache.is_some(),
                    )
                    .run(entry)
                    .await;

                    match outcome {
                        Ok(()) => {
                            if session.keep_open() && !session.is_bad() {
                                if let Some(cache) = &self.cache {
                                    session.record_delivery();
                                    tracing::debug!(peer = %session.peer(), "parking the session for reuse");
                                    cache.store(key.clone(), session).await;
                                }
                            }
                            break;
                        }
                        Err(error) => {
                            tracing::debug!(host = %candidate.name, %error, "session failed");
                            consider_postmaster_copy(
                                &self.config,
                                handler,
                                &error,
                                session.transcript(),
                            )
                            .await;
                            let stale = entry == SessionEntry::Reused
                                && marked(&recipients) == marks_before
                                && !matches!(error, Transfer::Content(_));
                            remember(&mut last_error, error);
                            if stale {
                                // dead on the shelf; the candidate deserves
                                // a live connection before we move on
                                force_fresh = true;
                                continue;
                            }
                            break;
                        }
                    }
                }
            }
        }

        // whoever is still undecided shares the fate of the last failure
        if recipients.iter().any(RecipientState::is_unmarked) {
            let error = last_error.unwrap_or_else(|| {
                Transport::Io {
                    message: "delivery ended with no usable destination".to_owned(),
                }
                .into()
            });
            let verdict = Verdict::from_transfer(&error);
            let keep = error.class() == ErrorClass::Soft;
            settle_unmarked(&mut recipients, handler, keep, &verdict).await;
        }
        debug_assert!(recipients.iter().all(|state| !state.is_unmarked()));

        DeliveryOutcome::Completed { recipients }
    }

    async fn checkout(&self, key: &CacheKey) -> Option<Session> {
        let cache = self.cache.as_ref()?;
        let session = cache.retrieve(key).await?;
        tracing::debug!(peer = %session.peer(), deliveries = session.deliveries(), "reusing a cached session");
        Some(session)
    }

    async fn authenticate<H: DeliveryHandler>(
        &self,
        session: &mut Session,
        handler: &mut H,
    ) -> Result<(), Transfer> {
        let Some(credentials) = self.config.credentials.as_ref() else {
            return Ok(());
        };
        let Some(mechanisms) = session.ehlo().parameters(Extension::Auth).map(str::to_owned)
        else {
            tracing::debug!("credentials configured but the server offers no AUTH");
            return Ok(());
        };
        handler
            .authenticate(
                &mechanisms,
                credentials,
                AuthExchange::new(session, self.config.timeouts.helo),
            )
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use petrel_protocol::Domain;

    fn soft() -> Transfer {
        Transport::Eof.into()
    }

    fn hard() -> Transfer {
        let domain: Domain = "example.com".parse().unwrap();
        Lookup::NotFound { domain }.into()
    }

    #[test]
    fn harder_errors_replace_softer_ones() {
        let mut last = None;
        remember(&mut last, soft());
        remember(&mut last, hard());
        assert!(matches!(last, Some(Transfer::Lookup(_))));
    }

    #[test]
    fn decided_errors_survive_later_noise() {
        let mut last = None;
        remember(&mut last, hard());
        remember(&mut last, soft());
        assert!(matches!(last, Some(Transfer::Lookup(_))));
    }

    #[test]
    fn ties_go_to_the_most_recent() {
        let mut last = None;
        remember(
            &mut last,
            Transport::Timeout {
                during: "reading the greeting".to_owned(),
            }
            .into(),
        );
        remember(&mut last, soft());
        assert!(matches!(last, Some(Transfer::Transport(Transport::Eof))));
    }
}
