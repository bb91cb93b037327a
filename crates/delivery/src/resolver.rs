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

use crate::config::DeliveryConfig;
use petrel_common::dns::{AddressFamily, DnsClient, MxRecord};
use petrel_common::request::{SiteHost, SiteName};
use petrel_common::transfer_error::Lookup;
use petrel_protocol::Domain;

/// One address a delivery may be attempted at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DestinationCandidate {
    /// Host the address belongs to, for logs and error reports.
    pub name: String,
    pub address: std::net::IpAddr,
    /// MX preference, 0 when the destination bypassed MX lookups.
    pub preference: u16,
}

/// Candidates of one destination, in attempt order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedDestination {
    pub candidates: Vec<DestinationCandidate>,
    /// This instance is the destination's best remaining mail exchange, so
    /// delivering over SMTP would loop. Always comes with no candidates.
    pub best_is_local: bool,
}

/// Turns a destination name into the addresses to try, with MX handling and
/// loop prevention.
pub struct Resolver {
    dns: std::sync::Arc<dyn DnsClient>,
    family: AddressFamily,
    local_addresses: Vec<std::net::IpAddr>,
    disable_dns: bool,
    tolerate_mx_errors: bool,
    address_cap: usize,
}

fn display_name(host: &Domain) -> String {
    let mut name = host.to_string();
    if name.len() > 1 && name.ends_with('.') {
        name.pop();
    }
    name
}

impl Resolver {
    #[must_use]
    pub fn new(dns: std::sync::Arc<dyn DnsClient>, config: &DeliveryConfig) -> Self {
        Self {
            dns,
            family: config.address_family,
            local_addresses: config.local_addresses.clone(),
            disable_dns: config.disable_dns,
            tolerate_mx_errors: config.tolerate_mx_errors,
            address_cap: config.address_attempt_cap,
        }
    }

    /// Resolve one destination.
    ///
    /// Domains go through MX records unless the destination is bracketed or
    /// DNS is disabled; a domain without MX records routes to itself
    /// (RFC 5321 section 5.1); a null MX (RFC 7505) refuses the mail
    /// outright. When one of our own addresses shows up in the list, it and
    /// everything at a worse preference are removed.
    ///
    /// # Errors
    ///
    /// * [`Lookup`] when the destination has no usable address
    pub async fn resolve(&self, site: &SiteName) -> Result<ResolvedDestination, Lookup> {
        tracing::trace!(destination = %site, "resolving destination");

        let mut resolved = match site.host() {
            SiteHost::Ip(address) => Ok(ResolvedDestination {
                candidates: vec![DestinationCandidate {
                    name: address.to_string(),
                    address: *address,
                    preference: 0,
                }],
                best_is_local: false,
            }),
            SiteHost::Domain(domain) if site.wants_mx() && !self.disable_dns => {
                self.domain_candidates(domain).await
            }
            SiteHost::Domain(domain) => self.host_candidates(domain).await,
        }?;

        if self.address_cap > 0 {
            resolved.candidates.truncate(self.address_cap);
        }
        Ok(resolved)
    }

    /// MX route of a domain destination.
    async fn domain_candidates(&self, domain: &Domain) -> Result<ResolvedDestination, Lookup> {
        let mut exchanges = match self.dns.mx(domain).await {
            Ok(records) => records,
            // a name with no MX record at all is its own mail exchange
            // (RFC 5321 section 5.1)
            Err(Lookup::NotFound { .. }) => vec![],
            Err(error @ (Lookup::Fail { .. } | Lookup::Retry { .. }))
                if self.tolerate_mx_errors =>
            {
                tracing::debug!(%domain, %error, "ignoring failed MX lookup");
                vec![]
            }
            Err(error) => return Err(error),
        };

        if exchanges.is_empty() {
            exchanges.push(MxRecord {
                preference: 0,
                exchange: domain.clone(),
            });
        } else {
            exchanges.retain(|mx| !mx.is_null());
            if exchanges.is_empty() {
                return Err(Lookup::NullMx {
                    domain: domain.clone(),
                });
            }
            // stable, so equal preferences keep their response order
            exchanges.sort_by_key(|mx| mx.preference);
        }

        let mut candidates = vec![];
        let mut seen = std::collections::HashMap::<String, Vec<std::net::IpAddr>>::new();
        let mut saw_retry = false;

        for mx in &exchanges {
            let name = display_name(&mx.exchange);

            if !seen.contains_key(&name) {
                let addresses = match self.host_addresses(&mx.exchange).await {
                    Ok(addresses) => addresses,
                    Err(error) => {
                        tracing::debug!(exchange = %name, %error, "skipping mail exchange");
                        saw_retry |= !matches!(error, Lookup::NotFound { .. });
                        vec![]
                    }
                };
                seen.insert(name.clone(), addresses);
            }

            for address in seen.get(&name).into_iter().flatten() {
                candidates.push(DestinationCandidate {
                    name: name.clone(),
                    address: *address,
                    preference: mx.preference,
                });
            }
        }

        if let Some(own_preference) = self.truncate_self(&mut candidates) {
            if candidates.is_empty() {
                let best_preference = exchanges.first().map_or(own_preference, |mx| mx.preference);
                if best_preference == own_preference {
                    return Ok(ResolvedDestination {
                        candidates,
                        best_is_local: true,
                    });
                }
                // A better exchange exists in the records but yielded no
                // usable address; relaying to ourselves or worse would loop.
                return Err(Lookup::Retry {
                    domain: domain.clone(),
                    message: "unable to find the primary mail relay".to_owned(),
                });
            }
        } else if candidates.is_empty() {
            return Err(if saw_retry {
                Lookup::Retry {
                    domain: domain.clone(),
                    message: "unable to look up any usable mail exchange address".to_owned(),
                }
            } else {
                Lookup::NotFound {
                    domain: domain.clone(),
                }
            });
        }

        Ok(ResolvedDestination {
            candidates,
            best_is_local: false,
        })
    }

    /// Direct route of a bracketed or DNS-disabled destination.
    async fn host_candidates(&self, domain: &Domain) -> Result<ResolvedDestination, Lookup> {
        let name = display_name(domain);
        let mut candidates: Vec<_> = self
            .host_addresses(domain)
            .await?
            .into_iter()
            .map(|address| DestinationCandidate {
                name: name.clone(),
                address,
                preference: 0,
            })
            .collect();

        if candidates.is_empty() {
            return Err(Lookup::NotFound {
                domain: domain.clone(),
            });
        }

        // No preferences on a direct route, finding ourselves empties the
        // list and makes us the best there is.
        let best_is_local = self.truncate_self(&mut candidates).is_some();
        Ok(ResolvedDestination {
            candidates,
            best_is_local,
        })
    }

    /// Every address of `host` in the configured families, IPv4 first.
    async fn host_addresses(&self, host: &Domain) -> Result<Vec<std::net::IpAddr>, Lookup> {
        let mut addresses = vec![];
        if self.family.wants_ipv4() {
            addresses.extend(
                self.dns
                    .ipv4(host)
                    .await?
                    .into_iter()
                    .map(std::net::IpAddr::from),
            );
        }
        if self.family.wants_ipv6() {
            addresses.extend(
                self.dns
                    .ipv6(host)
                    .await?
                    .into_iter()
                    .map(std::net::IpAddr::from),
            );
        }
        Ok(addresses)
    }

    /// Drop our own addresses and every candidate at their preference or
    /// worse, returning the preference we were listed at.
    fn truncate_self(&self, candidates: &mut Vec<DestinationCandidate>) -> Option<u16> {
        let own_preference = candidates
            .iter()
            .filter(|candidate| self.local_addresses.contains(&candidate.address))
            .map(|candidate| candidate.preference)
            .min()?;

        tracing::debug!(preference = own_preference, "found ourselves in the mail exchange list");
        candidates.retain(|candidate| candidate.preference < own_preference);
        Some(own_preference)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[derive(Default)]
    struct MockDns {
        mx: std::collections::HashMap<String, Result<Vec<(u16, &'static str)>, Lookup>>,
        a: std::collections::HashMap<String, Result<Vec<std::net::Ipv4Addr>, Lookup>>,
        aaaa: std::collections::HashMap<String, Result<Vec<std::net::Ipv6Addr>, Lookup>>,
    }

    impl MockDns {
        fn with_mx(mut self, domain: &str, records: &[(u16, &'static str)]) -> Self {
            self.mx.insert(domain.to_owned(), Ok(records.to_vec()));
            self
        }

        fn with_mx_error(mut self, domain: &str, error: Lookup) -> Self {
            self.mx.insert(domain.to_owned(), Err(error));
            self
        }

        fn with_a(mut self, host: &str, addresses: &[&str]) -> Self {
            self.a.insert(
                host.to_owned(),
                Ok(addresses.iter().map(|ip| ip.parse().unwrap()).collect()),
            );
            self
        }

        fn with_a_error(mut self, host: &str, error: Lookup) -> Self {
            self.a.insert(host.to_owned(), Err(error));
            self
        }

        fn with_aaaa(mut self, host: &str, addresses: &[&str]) -> Self {
            self.aaaa.insert(
                host.to_owned(),
                Ok(addresses.iter().map(|ip| ip.parse().unwrap()).collect()),
            );
            self
        }
    }

    #[async_trait::async_trait]
    impl DnsClient for MockDns {
        async fn mx(&self, domain: &Domain) -> Result<Vec<MxRecord>, Lookup> {
            self.mx
                .get(&display_name(domain))
                .cloned()
                .unwrap_or(Ok(vec![]))
                .map(|records| {
                    records
                        .into_iter()
                        .map(|(preference, exchange)| MxRecord {
                            preference,
                            exchange: exchange.parse().unwrap(),
                        })
                        .collect()
                })
        }

        async fn ipv4(&self, host: &Domain) -> Result<Vec<std::net::Ipv4Addr>, Lookup> {
            self.a
                .get(&display_name(host))
                .cloned()
                .unwrap_or(Ok(vec![]))
        }

        async fn ipv6(&self, host: &Domain) -> Result<Vec<std::net::Ipv6Addr>, Lookup> {
            self.aaaa
                .get(&display_name(host))
                .cloned()
                .unwrap_or(Ok(vec![]))
        }
    }

    fn resolver(dns: MockDns, config: &DeliveryConfig) -> Resolver {
        Resolver::new(std::sync::Arc::new(dns), config)
    }

    fn addresses(resolved: &ResolvedDestination) -> Vec<String> {
        resolved
            .candidates
            .iter()
            .map(|candidate| candidate.address.to_string())
            .collect()
    }

    #[test_log::test(tokio::test)]
    async fn address_literal_needs_no_lookup() {
        let resolver = resolver(MockDns::default(), &DeliveryConfig::default());

        let resolved = resolver.resolve(&"[192.0.2.7]:2525".parse().unwrap()).await.unwrap();

        assert!(!resolved.best_is_local);
        assert_eq!(
            resolved.candidates,
            [DestinationCandidate {
                name: "192.0.2.7".to_owned(),
                address: "192.0.2.7".parse().unwrap(),
                preference: 0,
            }]
        );
    }

    #[test_log::test(tokio::test)]
    async fn domain_without_mx_routes_to_itself() {
        let dns = MockDns::default().with_a("example.com", &["192.0.2.1"]);
        let resolver = resolver(dns, &DeliveryConfig::default());

        let resolved = resolver.resolve(&"example.com".parse().unwrap()).await.unwrap();

        assert_eq!(addresses(&resolved), ["192.0.2.1"]);
        assert_eq!(resolved.candidates[0].name, "example.com");
    }

    #[test_log::test(tokio::test)]
    async fn missing_mx_record_falls_back_to_the_host() {
        let domain: Domain = "example.com".parse().unwrap();
        let dns = MockDns::default()
            .with_mx_error("example.com", Lookup::NotFound { domain })
            .with_a("example.com", &["192.0.2.1"]);
        let resolver = resolver(dns, &DeliveryConfig::default());

        let resolved = resolver.resolve(&"example.com".parse().unwrap()).await.unwrap();

        assert_eq!(addresses(&resolved), ["192.0.2.1"]);
        assert_eq!(resolved.candidates[0].preference, 0);
    }

    #[test_log::test(tokio::test)]
    async fn null_mx_refuses_the_mail() {
        let dns = MockDns::default().with_mx("example.com", &[(0, ".")]);
        let resolver = resolver(dns, &DeliveryConfig::default());

        let error = resolver.resolve(&"example.com".parse().unwrap()).await.unwrap_err();

        assert!(matches!(error, Lookup::NullMx { .. }));
    }

    #[test_log::test(tokio::test)]
    async fn unknown_domain_is_reported_as_such() {
        let domain: Domain = "nowhere.example.com".parse().unwrap();
        let dns = MockDns::default().with_mx_error(
            "nowhere.example.com",
            Lookup::NotFound {
                domain: domain.clone(),
            },
        );
        let resolver = resolver(dns, &DeliveryConfig::default());

        let error = resolver.resolve(&"nowhere.example.com".parse().unwrap()).await.unwrap_err();

        assert_eq!(error, Lookup::NotFound { domain });
    }

    #[test_log::test(tokio::test)]
    async fn candidates_follow_preference_then_response_order() {
        let dns = MockDns::default()
            .with_mx(
                "example.com",
                &[(20, "fallback.example.com"), (10, "mx2.example.com"), (10, "mx1.example.com")],
            )
            .with_a("mx1.example.com", &["192.0.2.11"])
            .with_a("mx2.example.com", &["192.0.2.12"])
            .with_a("fallback.example.com", &["192.0.2.20"]);
        let resolver = resolver(dns, &DeliveryConfig::default());

        let resolved = resolver.resolve(&"example.com".parse().unwrap()).await.unwrap();

        assert_eq!(addresses(&resolved), ["192.0.2.12", "192.0.2.11", "192.0.2.20"]);
    }

    #[test_log::test(tokio::test)]
    async fn exchanges_without_addresses_are_skipped() {
        let missing: Domain = "gone.example.com".parse().unwrap();
        let dns = MockDns::default()
            .with_mx(
                "example.com",
                &[(10, "gone.example.com"), (20, "mx2.example.com")],
            )
            .with_a_error("gone.example.com", Lookup::NotFound { domain: missing })
            .with_a("mx2.example.com", &["192.0.2.12"]);
        let resolver = resolver(dns, &DeliveryConfig::default());

        let resolved = resolver.resolve(&"example.com".parse().unwrap()).await.unwrap();

        assert_eq!(addresses(&resolved), ["192.0.2.12"]);
    }

    #[test_log::test(tokio::test)]
    async fn failing_exchange_lookups_defer_rather_than_bounce() {
        let host: Domain = "mx1.example.com".parse().unwrap();
        let dns = MockDns::default()
            .with_mx("example.com", &[(10, "mx1.example.com")])
            .with_a_error(
                "mx1.example.com",
                Lookup::Retry {
                    domain: host,
                    message: "server failure".to_owned(),
                },
            );
        let resolver = resolver(dns, &DeliveryConfig::default());

        let error = resolver.resolve(&"example.com".parse().unwrap()).await.unwrap_err();

        assert!(matches!(error, Lookup::Retry { .. }), "{error}");
    }

    #[test_log::test(tokio::test)]
    async fn backup_mx_only_relays_to_better_exchanges() {
        let dns = MockDns::default()
            .with_mx(
                "example.com",
                &[(10, "primary.example.com"), (20, "backup.example.com")],
            )
            .with_a("primary.example.com", &["192.0.2.1"])
            .with_a("backup.example.com", &["198.51.100.2"]);
        let config = DeliveryConfig {
            local_addresses: vec!["198.51.100.2".parse().unwrap()],
            ..DeliveryConfig::default()
        };
        let resolver = resolver(dns, &config);

        let resolved = resolver.resolve(&"example.com".parse().unwrap()).await.unwrap();

        assert!(!resolved.best_is_local);
        assert_eq!(addresses(&resolved), ["192.0.2.1"]);
    }

    #[test_log::test(tokio::test)]
    async fn best_exchange_being_ourselves_is_flagged() {
        let dns = MockDns::default()
            .with_mx(
                "example.com",
                &[(10, "us.example.com"), (20, "backup.example.com")],
            )
            .with_a("us.example.com", &["198.51.100.2"])
            .with_a("backup.example.com", &["198.51.100.3"]);
        let config = DeliveryConfig {
            local_addresses: vec!["198.51.100.2".parse().unwrap()],
            ..DeliveryConfig::default()
        };
        let resolver = resolver(dns, &config);

        let resolved = resolver.resolve(&"example.com".parse().unwrap()).await.unwrap();

        assert!(resolved.best_is_local);
        assert!(resolved.candidates.is_empty());
    }

    #[test_log::test(tokio::test)]
    async fn unreachable_primary_defers_instead_of_looping() {
        // We are the backup and the primary has no usable address right now.
        // Mail must wait for the primary to come back, not bounce and not
        // count as a loop.
        let missing: Domain = "primary.example.com".parse().unwrap();
        let dns = MockDns::default()
            .with_mx(
                "example.com",
                &[(10, "primary.example.com"), (20, "us.example.com")],
            )
            .with_a_error("primary.example.com", Lookup::NotFound { domain: missing })
            .with_a("us.example.com", &["198.51.100.2"]);
        let config = DeliveryConfig {
            local_addresses: vec!["198.51.100.2".parse().unwrap()],
            ..DeliveryConfig::default()
        };
        let resolver = resolver(dns, &config);

        let error = resolver.resolve(&"example.com".parse().unwrap()).await.unwrap_err();

        assert_eq!(
            error,
            Lookup::Retry {
                domain: "example.com".parse().unwrap(),
                message: "unable to find the primary mail relay".to_owned(),
            }
        );
    }

    #[test_log::test(tokio::test)]
    async fn family_restriction_filters_addresses() {
        let dns = MockDns::default()
            .with_a("example.com", &["192.0.2.1"])
            .with_aaaa("example.com", &["2001:db8::1"]);
        let config = DeliveryConfig {
            address_family: AddressFamily::Ipv6,
            ..DeliveryConfig::default()
        };
        let resolver = resolver(dns, &config);

        let resolved = resolver.resolve(&"example.com".parse().unwrap()).await.unwrap();

        assert_eq!(addresses(&resolved), ["2001:db8::1"]);
    }

    #[test_log::test(tokio::test)]
    async fn candidate_count_is_capped() {
        let dns = MockDns::default()
            .with_mx("example.com", &[(10, "mx1.example.com")])
            .with_a(
                "mx1.example.com",
                &["192.0.2.1", "192.0.2.2", "192.0.2.3", "192.0.2.4"],
            );
        let config = DeliveryConfig {
            address_attempt_cap: 2,
            ..DeliveryConfig::default()
        };
        let resolver = resolver(dns, &config);

        let resolved = resolver.resolve(&"example.com".parse().unwrap()).await.unwrap();

        assert_eq!(addresses(&resolved), ["192.0.2.1", "192.0.2.2"]);
    }

    #[test_log::test(tokio::test)]
    async fn bracketed_domain_skips_mx_records() {
        // MX would point elsewhere; brackets go to the host itself.
        let dns = MockDns::default()
            .with_mx("example.com", &[(10, "mx1.example.com")])
            .with_a("mx1.example.com", &["192.0.2.11"])
            .with_a("example.com", &["192.0.2.1"]);
        let resolver = resolver(dns, &DeliveryConfig::default());

        let resolved = resolver.resolve(&"[example.com]".parse().unwrap()).await.unwrap();

        assert_eq!(addresses(&resolved), ["192.0.2.1"]);
    }

    #[test_log::test(tokio::test)]
    async fn tolerated_mx_failure_falls_back_to_the_host() {
        let domain: Domain = "example.com".parse().unwrap();
        let dns = MockDns::default()
            .with_mx_error(
                "example.com",
                Lookup::Retry {
                    domain,
                    message: "server failure".to_owned(),
                },
            )
            .with_a("example.com", &["192.0.2.1"]);
        let config = DeliveryConfig {
            tolerate_mx_errors: true,
            ..DeliveryConfig::default()
        };
        let resolver = resolver(dns, &config);

        let resolved = resolver.resolve(&"example.com".parse().unwrap()).await.unwrap();

        assert_eq!(addresses(&resolved), ["192.0.2.1"]);
    }
}
