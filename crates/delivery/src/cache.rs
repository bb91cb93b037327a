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

use crate::session::Session;

/// Identity of a reusable session.
///
/// Sessions are interchangeable only when every component matches: the
/// logical delivery service, where the socket goes, and the name announced
/// in `EHLO`. A session opened under another name may have been granted
/// different extensions.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub service: String,
    pub address: std::net::IpAddr,
    pub port: u16,
    pub helo_name: String,
}

/// Parking lot for sessions which finished a delivery in good standing.
#[async_trait::async_trait]
pub trait SessionCache: Send + Sync {
    /// Park a session for later reuse. The cache owns it from here and may
    /// drop it at any time.
    async fn store(&self, key: CacheKey, session: Session);

    /// Hand back a parked session, if one is still around. The caller must
    /// probe it before trusting it; the server may have hung up since.
    async fn retrieve(&self, key: &CacheKey) -> Option<Session>;
}

/// Process-local cache. Parked sessions expire after `ttl`; the freshest
/// one is handed out first.
pub struct InMemoryCache {
    ttl: std::time::Duration,
    slots: tokio::sync::Mutex<
        std::collections::HashMap<CacheKey, Vec<(std::time::Instant, Session)>>,
    >,
}

impl InMemoryCache {
    #[must_use]
    pub fn new(ttl: std::time::Duration) -> Self {
        Self {
            ttl,
            slots: tokio::sync::Mutex::default(),
        }
    }
}

#[async_trait::async_trait]
impl SessionCache for InMemoryCache {
    async fn store(&self, key: CacheKey, session: Session) {
        let mut slots = self.slots.lock().await;
        let parked = slots.entry(key).or_default();
        parked.retain(|(since, _)| since.elapsed() <= self.ttl);
        parked.push((std::time::Instant::now(), session));
    }

    async fn retrieve(&self, key: &CacheKey) -> Option<Session> {
        let mut slots = self.slots.lock().await;
        let parked = slots.get_mut(key)?;

        while let Some((since, session)) = parked.pop() {
            if since.elapsed() <= self.ttl {
                return Some(session);
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_ne;

    fn key() -> CacheKey {
        CacheKey {
            service: "relay".to_owned(),
            address: "192.0.2.25".parse().unwrap(),
            port: 25,
            helo_name: "mta.example.com".to_owned(),
        }
    }

    #[test]
    fn every_component_tells_keys_apart() {
        let base = key();

        assert_ne!(
            base,
            CacheKey {
                service: "fallback".to_owned(),
                ..base.clone()
            }
        );
        assert_ne!(
            base,
            CacheKey {
                port: 2525,
                ..base.clone()
            }
        );
        assert_ne!(
            base,
            CacheKey {
                address: "198.51.100.2".parse().unwrap(),
                ..base.clone()
            }
        );
        assert_ne!(
            base,
            CacheKey {
                helo_name: "other.example.com".to_owned(),
                ..base.clone()
            }
        );
    }
}
