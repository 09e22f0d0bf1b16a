//! Accept-time connection filtering.

use std::collections::HashSet;
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::warn;

use crate::config::ServerConfig;

pub type AdmissionPredicate = Arc<dyn Fn(SocketAddr) -> bool + Send + Sync>;

/// Why a connection was refused.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Rejection {
    Blacklisted,
    NotWhitelisted,
    TooManyConnections { max: usize },
    Banned { until: DateTime<Utc> },
    Refused,
}

impl fmt::Display for Rejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Blacklisted => write!(f, "address is blacklisted"),
            Self::NotWhitelisted => write!(f, "address is not whitelisted"),
            Self::TooManyConnections { max } => write!(f, "connection limit {max} reached"),
            Self::Banned { until } => write!(f, "banned until {until}"),
            Self::Refused => write!(f, "refused by admission predicate"),
        }
    }
}

/// Rules checked, in order, before an accepted socket joins the live set.
#[derive(Clone, Default)]
pub struct AdmissionPolicy {
    blacklist: HashSet<IpAddr>,
    whitelist: HashSet<IpAddr>,
    max_connections: Option<usize>,
    predicate: Option<AdmissionPredicate>,
}

impl AdmissionPolicy {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from the `network` and `security` sections; unparsable
    /// addresses are skipped with a warning.
    pub fn from_config(config: &ServerConfig) -> Self {
        let parse = |list: &[String]| -> HashSet<IpAddr> {
            list.iter()
                .filter_map(|raw| match raw.trim().parse::<IpAddr>() {
                    Ok(ip) => Some(ip),
                    Err(_) => {
                        warn!(address = %raw, "ignoring invalid address in admission list");
                        None
                    }
                })
                .collect()
        };
        Self {
            blacklist: parse(&config.security.blacklist),
            whitelist: parse(&config.security.whitelist),
            max_connections: (config.network.max_connections > 0)
                .then_some(config.network.max_connections),
            predicate: None,
        }
    }

    pub fn deny(mut self, ip: IpAddr) -> Self {
        self.blacklist.insert(ip);
        self
    }

    pub fn allow(mut self, ip: IpAddr) -> Self {
        self.whitelist.insert(ip);
        self
    }

    pub fn with_max_connections(mut self, max: usize) -> Self {
        self.max_connections = Some(max);
        self
    }

    /// Extra check run last; returning `false` refuses the peer.
    pub fn with_predicate<F>(mut self, predicate: F) -> Self
    where
        F: Fn(SocketAddr) -> bool + Send + Sync + 'static,
    {
        self.predicate = Some(Arc::new(predicate));
        self
    }

    pub fn max_connections(&self) -> Option<usize> {
        self.max_connections
    }

    /// Decide on `peer` given the current live count and a ban lookup
    /// keyed by peer IP.
    pub fn check(
        &self,
        peer: SocketAddr,
        live: usize,
        banned_until: impl Fn(&str) -> Option<DateTime<Utc>>,
    ) -> Result<(), Rejection> {
        let ip = peer.ip();
        if self.blacklist.contains(&ip) {
            return Err(Rejection::Blacklisted);
        }
        if !self.whitelist.is_empty() && !self.whitelist.contains(&ip) {
            return Err(Rejection::NotWhitelisted);
        }
        if let Some(max) = self.max_connections {
            if live >= max {
                return Err(Rejection::TooManyConnections { max });
            }
        }
        if let Some(until) = banned_until(&ip.to_string()) {
            if until > Utc::now() {
                return Err(Rejection::Banned { until });
            }
        }
        if let Some(predicate) = &self.predicate {
            if !predicate(peer) {
                return Err(Rejection::Refused);
            }
        }
        Ok(())
    }
}

impl fmt::Debug for AdmissionPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AdmissionPolicy")
            .field("blacklist", &self.blacklist)
            .field("whitelist", &self.whitelist)
            .field("max_connections", &self.max_connections)
            .field("predicate", &self.predicate.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer(ip: &str) -> SocketAddr {
        SocketAddr::new(ip.parse().unwrap(), 5000)
    }

    fn no_bans(_: &str) -> Option<DateTime<Utc>> {
        None
    }

    #[test]
    fn open_policy_admits() {
        assert!(AdmissionPolicy::new().check(peer("10.0.0.1"), 10_000, no_bans).is_ok());
    }

    #[test]
    fn lists_are_enforced() {
        let policy = AdmissionPolicy::new()
            .deny("10.0.0.2".parse().unwrap())
            .allow("10.0.0.1".parse().unwrap());
        assert!(policy.check(peer("10.0.0.1"), 0, no_bans).is_ok());
        assert_eq!(
            policy.check(peer("10.0.0.2"), 0, no_bans),
            Err(Rejection::Blacklisted)
        );
        assert_eq!(
            policy.check(peer("10.0.0.3"), 0, no_bans),
            Err(Rejection::NotWhitelisted)
        );
    }

    #[test]
    fn limit_and_bans() {
        let policy = AdmissionPolicy::new().with_max_connections(2);
        assert_eq!(
            policy.check(peer("10.0.0.1"), 2, no_bans),
            Err(Rejection::TooManyConnections { max: 2 })
        );

        let until = Utc::now() + chrono::Duration::hours(1);
        let banned = |ip: &str| (ip == "10.0.0.1").then_some(until);
        assert_eq!(
            policy.check(peer("10.0.0.1"), 0, banned),
            Err(Rejection::Banned { until })
        );
        assert!(policy.check(peer("10.0.0.9"), 0, banned).is_ok());

        let lapsed = |_: &str| Some(Utc::now() - chrono::Duration::minutes(1));
        assert!(policy.check(peer("10.0.0.1"), 0, lapsed).is_ok());
    }

    #[test]
    fn predicate_runs_last() {
        let policy = AdmissionPolicy::new().with_predicate(|addr| addr.port() != 5000);
        assert_eq!(
            policy.check(peer("10.0.0.1"), 0, no_bans),
            Err(Rejection::Refused)
        );
    }

    #[test]
    fn from_config_skips_bad_addresses() {
        let mut config = ServerConfig::default();
        config.security.blacklist = vec!["10.0.0.5".into(), "not-an-ip".into()];
        config.network.max_connections = 3;
        let policy = AdmissionPolicy::from_config(&config);
        assert_eq!(policy.max_connections(), Some(3));
        assert_eq!(
            policy.check(peer("10.0.0.5"), 0, no_bans),
            Err(Rejection::Blacklisted)
        );
    }
}
