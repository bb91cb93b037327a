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

use crate::transfer_error::Lookup;
use petrel_protocol::Domain;
use trust_dns_resolver::proto::op::ResponseCode;

/// One `MX` record of a destination domain.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct MxRecord {
    pub preference: u16,
    pub exchange: Domain,
}

impl MxRecord {
    /// A "null MX" (RFC 7505), the domain declines all mail.
    #[must_use]
    pub fn is_null(&self) -> bool {
        self.exchange.is_root()
    }
}

/// Which address records a destination may be contacted over.
#[derive(
    Debug,
    Default,
    Clone,
    Copy,
    PartialEq,
    Eq,
    strum::Display,
    strum::EnumString,
    serde_with::DeserializeFromStr,
    serde_with::SerializeDisplay,
    fake::Dummy,
)]
#[strum(serialize_all = "snake_case")]
pub enum AddressFamily {
    #[default]
    Any,
    Ipv4,
    Ipv6,
}

impl AddressFamily {
    #[must_use]
    pub const fn wants_ipv4(self) -> bool {
        matches!(self, Self::Any | Self::Ipv4)
    }

    #[must_use]
    pub const fn wants_ipv6(self) -> bool {
        matches!(self, Self::Any | Self::Ipv6)
    }
}

/// The queries the destination resolver needs, with errors already
/// sorted into retriable and fatal.
#[async_trait::async_trait]
pub trait DnsClient: Send + Sync {
    async fn mx(&self, domain: &Domain) -> Result<Vec<MxRecord>, Lookup>;
    async fn ipv4(&self, host: &Domain) -> Result<Vec<std::net::Ipv4Addr>, Lookup>;
    async fn ipv6(&self, host: &Domain) -> Result<Vec<std::net::Ipv6Addr>, Lookup>;
}

/// `NoError` with an empty record set means the name exists but has no
/// record of the requested type, which is an answer, not a failure.
fn no_data(error: &trust_dns_resolver::error::ResolveError) -> bool {
    matches!(
        error.kind(),
        trust_dns_resolver::error::ResolveErrorKind::NoRecordsFound {
            response_code: ResponseCode::NoError,
            ..
        }
    )
}

fn classify(error: &trust_dns_resolver::error::ResolveError, domain: &Domain) -> Lookup {
    use trust_dns_resolver::error::ResolveErrorKind;

    let domain = domain.clone();
    match error.kind() {
        // an authoritative "no such name" is final, a server failure is not.
        ResolveErrorKind::NoRecordsFound { response_code, .. } => match response_code {
            ResponseCode::ServFail => Lookup::Retry {
                domain,
                message: "server failure".to_owned(),
            },
            _ => Lookup::NotFound { domain },
        },
        ResolveErrorKind::Timeout => Lookup::Retry {
            domain,
            message: "timed out".to_owned(),
        },
        ResolveErrorKind::NoConnections | ResolveErrorKind::Io(_) => Lookup::Retry {
            domain,
            message: error.to_string(),
        },
        ResolveErrorKind::Proto(_)
        | ResolveErrorKind::Message(_)
        | ResolveErrorKind::Msg(_) => Lookup::Fail {
            domain,
            message: error.to_string(),
        },
        // NOTE: non_exhaustive
        _ => Lookup::Fail {
            domain,
            message: error.to_string(),
        },
    }
}

#[allow(dead_code)]
#[derive(Debug, Clone, serde::Serialize)]
pub struct DnsResolver {
    config: trust_dns_resolver::config::ResolverConfig,
    option: trust_dns_resolver::config::ResolverOpts,
    #[serde(skip)]
    pub resolver: trust_dns_resolver::TokioAsyncResolver,
}

impl DnsResolver {
    #[must_use]
    pub fn google() -> Self {
        let config = trust_dns_resolver::config::ResolverConfig::google();
        let option = trust_dns_resolver::config::ResolverOpts::default();

        Self {
            config: config.clone(),
            option: option.clone(),
            resolver: trust_dns_resolver::TokioAsyncResolver::tokio(config, option),
        }
    }
}

#[async_trait::async_trait]
impl DnsClient for DnsResolver {
    async fn mx(&self, domain: &Domain) -> Result<Vec<MxRecord>, Lookup> {
        match self.resolver.mx_lookup(domain.clone()).await {
            Ok(records) => Ok(records
                .iter()
                .map(|mx| MxRecord {
                    preference: mx.preference(),
                    exchange: mx.exchange().clone(),
                })
                .collect()),
            Err(error) if no_data(&error) => Ok(vec![]),
            Err(error) => Err(classify(&error, domain)),
        }
    }

    async fn ipv4(&self, host: &Domain) -> Result<Vec<std::net::Ipv4Addr>, Lookup> {
        match self.resolver.ipv4_lookup(host.clone()).await {
            Ok(records) => Ok(records.iter().map(|a| a.0).collect()),
            Err(error) if no_data(&error) => Ok(vec![]),
            Err(error) => Err(classify(&error, host)),
        }
    }

    async fn ipv6(&self, host: &Domain) -> Result<Vec<std::net::Ipv6Addr>, Lookup> {
        match self.resolver.ipv6_lookup(host.clone()).await {
            Ok(records) => Ok(records.iter().map(|aaaa| aaaa.0).collect()),
            Err(error) if no_data(&error) => Ok(vec![]),
            Err(error) => Err(classify(&error, host)),
        }
    }
}

impl<'de> serde::Deserialize<'de> for DnsResolver {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let Inner { config, option } = Inner::deserialize(deserializer)?;
        Ok(Self {
            config: config.clone(),
            option: option.clone(),
            resolver: trust_dns_resolver::TokioAsyncResolver::tokio(config, option),
        })
    }
}

#[derive(serde::Deserialize)]
#[serde(deny_unknown_fields)]
struct Inner {
    #[serde(default, deserialize_with = "deserialize_config")]
    config: trust_dns_resolver::config::ResolverConfig,
    #[serde(default)]
    option: trust_dns_resolver::config::ResolverOpts,
}

fn deserialize_config<'de, D>(
    deserialize: D,
) -> Result<trust_dns_resolver::config::ResolverConfig, D::Error>
where
    D: serde::Deserializer<'de>,
{
    struct Visitor;

    impl<'de> serde::de::Visitor<'de> for Visitor {
        type Value = trust_dns_resolver::config::ResolverConfig;

        fn expecting(
            &self,
            fmt: &mut std::fmt::Formatter<'_>,
        ) -> std::result::Result<(), std::fmt::Error> {
            write!(
                fmt,
                "either a build-in config among '{}' or a map following the `ResolverConfig` scheme",
                <BuildIn as strum::VariantNames>::VARIANTS.join("|")
            )
        }

        fn visit_str<E>(self, v: &str) -> Result<Self::Value, E>
        where
            E: serde::de::Error,
        {
            <BuildIn as std::str::FromStr>::from_str(v)
                .map(Self::Value::from)
                .map_err(serde::de::Error::custom)
        }

        fn visit_map<A>(self, map: A) -> Result<Self::Value, A::Error>
        where
            A: serde::de::MapAccess<'de>,
        {
            <trust_dns_resolver::config::ResolverConfig as serde::Deserialize>::deserialize(
                serde::de::value::MapAccessDeserializer::new(map),
            )
        }
    }

    deserialize.deserialize_any(Visitor)
}

#[derive(strum::EnumString, strum::EnumVariantNames)]
#[strum(serialize_all = "snake_case")]
enum BuildIn {
    Google,
    Cloudflare,
    CloudflareTls,
    Quad9,
    Quad9Tls,
}

impl From<BuildIn> for trust_dns_resolver::config::ResolverConfig {
    fn from(val: BuildIn) -> Self {
        match val {
            BuildIn::Google => Self::google(),
            BuildIn::Cloudflare => Self::cloudflare(),
            BuildIn::CloudflareTls => Self::cloudflare_tls(),
            BuildIn::Quad9 => Self::quad9(),
            BuildIn::Quad9Tls => Self::quad9_tls(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn build_in_config() {
        let resolver = serde_json::from_str::<DnsResolver>(r#"{ "config": "cloudflare" }"#).unwrap();
        assert_eq!(
            resolver.config.domain(),
            trust_dns_resolver::config::ResolverConfig::cloudflare().domain()
        );
    }

    #[test]
    fn null_mx_record() {
        let null = MxRecord {
            preference: 0,
            exchange: Domain::root(),
        };
        assert!(null.is_null());

        let regular = MxRecord {
            preference: 10,
            exchange: "mx.example.com".parse().unwrap(),
        };
        assert!(!regular.is_null());
    }
}
