use std::collections::HashSet;
use std::fs;
use std::io;
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

/// Name of the synthetic filter gating the engine's own DNS lookups.
pub(crate) const SELF_FILTER_NAME: &str = "self";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Read(#[source] io::Error),
    #[error("failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("\"inboundDNSQueue\" must be set")]
    MissingInboundQueue,
    #[error("at least one filter must be configured")]
    NoFilters,
    #[error("\"selfDNSQueue\" must not be 0")]
    ZeroSelfQueue,
    #[error("\"selfDNSQueue\" must differ from \"inboundDNSQueue\"")]
    SelfQueueClash,
    #[error("\"selfDNSQueue\" must be set when a filter uses \"lookupUnknownIPs\" or \"cachedHostnames\"")]
    MissingSelfQueue,
    #[error("\"selfDNSQueue\" must not be set unless a filter uses \"lookupUnknownIPs\" or \"cachedHostnames\"")]
    UnusedSelfQueue,
    #[error("filter names must be unique, {0:?} is repeated")]
    DuplicateName(String),
    #[error("queue {0} is used more than once")]
    DuplicateQueue(u16),
    #[error("filter {filter:?}: {reason}")]
    Filter {
        filter: String,
        reason: &'static str,
    },
}

/// Validated top-level configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Queue delivering DNS replies for all filters.
    #[serde(rename = "inboundDNSQueue", default)]
    pub inbound_dns_queue: u16,
    /// Queue carrying the engine's own DNS lookups.
    #[serde(rename = "selfDNSQueue", default)]
    pub self_dns_queue: Option<u16>,
    /// Family of every queue; a filter never mixes families.
    #[serde(default)]
    pub ipv6: bool,
    #[serde(default)]
    pub filters: Vec<FilterConfig>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub struct FilterConfig {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub dns_queue: Option<u16>,
    #[serde(default)]
    pub traffic_queue: Option<u16>,
    #[serde(default)]
    pub allow_all_hostnames: bool,
    #[serde(default, deserialize_with = "duration::option")]
    pub allow_answers_for: Option<Duration>,
    #[serde(default)]
    pub allowed_hostnames: Vec<String>,
    #[serde(default)]
    pub cached_hostnames: Vec<String>,
    #[serde(default, deserialize_with = "duration::option")]
    pub re_cache_every: Option<Duration>,
    #[serde(rename = "lookupUnknownIPs", default)]
    pub lookup_unknown_ips: bool,
}

impl Config {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = fs::read_to_string(path).map_err(ConfigError::Read)?;
        raw.parse()
    }

    /// The synthetic filter gating the engine's own DNS lookups, prepended
    /// to the filter list when `selfDNSQueue` is configured. Its allow-list
    /// is the union of the reverse-lookup zones (when any filter resolves
    /// unknown IPs) and every filter's cached hostnames.
    pub(crate) fn self_filter(&self) -> Option<FilterConfig> {
        let dns_queue = self.self_dns_queue?;

        let mut allowed_hostnames = Vec::new();
        if self.filters.iter().any(|f| f.lookup_unknown_ips) {
            allowed_hostnames.push("in-addr.arpa".to_string());
            allowed_hostnames.push("ip6.arpa".to_string());
        }
        allowed_hostnames.extend(
            self.filters
                .iter()
                .flat_map(|f| f.cached_hostnames.iter().cloned()),
        );

        Some(FilterConfig {
            name: SELF_FILTER_NAME.to_string(),
            dns_queue: Some(dns_queue),
            allowed_hostnames,
            ..FilterConfig::default()
        })
    }

    fn normalize(&mut self) {
        for filter in &mut self.filters {
            for hostname in filter
                .allowed_hostnames
                .iter_mut()
                .chain(filter.cached_hostnames.iter_mut())
            {
                *hostname = hostname.trim_end_matches('.').to_ascii_lowercase();
            }
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.inbound_dns_queue == 0 {
            return Err(ConfigError::MissingInboundQueue);
        }
        if self.filters.is_empty() {
            return Err(ConfigError::NoFilters);
        }

        let needs_self_queue = self
            .filters
            .iter()
            .any(|f| f.lookup_unknown_ips || !f.cached_hostnames.is_empty());
        match self.self_dns_queue {
            Some(0) => return Err(ConfigError::ZeroSelfQueue),
            Some(queue) if queue == self.inbound_dns_queue => {
                return Err(ConfigError::SelfQueueClash)
            }
            Some(_) if !needs_self_queue => return Err(ConfigError::UnusedSelfQueue),
            None if needs_self_queue => return Err(ConfigError::MissingSelfQueue),
            _ => {}
        }

        let mut names = HashSet::new();
        let mut queues = HashSet::new();
        queues.insert(self.inbound_dns_queue);
        if let Some(queue) = self.self_dns_queue {
            queues.insert(queue);
        }

        for filter in &self.filters {
            filter.validate()?;
            if !names.insert(filter.name.as_str()) {
                return Err(ConfigError::DuplicateName(filter.name.clone()));
            }
            for queue in [filter.dns_queue, filter.traffic_queue]
                .into_iter()
                .flatten()
            {
                if !queues.insert(queue) {
                    return Err(ConfigError::DuplicateQueue(queue));
                }
            }
        }

        Ok(())
    }
}

impl std::str::FromStr for Config {
    type Err = ConfigError;

    fn from_str(raw: &str) -> Result<Self, ConfigError> {
        let mut config: Config = toml::from_str(raw)?;
        config.normalize();
        config.validate()?;
        Ok(config)
    }
}

impl FilterConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        let fail = |reason: &'static str| ConfigError::Filter {
            filter: self.name.clone(),
            reason,
        };

        if self.name.is_empty() {
            return Err(fail("\"name\" must be set"));
        }
        if self.name == SELF_FILTER_NAME {
            return Err(fail("\"self\" is reserved"));
        }
        if self.dns_queue == Some(0) || self.traffic_queue == Some(0) {
            return Err(fail("queue numbers must not be 0"));
        }
        if self
            .allowed_hostnames
            .iter()
            .chain(&self.cached_hostnames)
            .any(String::is_empty)
        {
            return Err(fail("hostnames must not be empty"));
        }

        if !self.cached_hostnames.is_empty() && self.re_cache_every.is_none() {
            return Err(fail("\"reCacheEvery\" must be set with \"cachedHostnames\""));
        }
        if self.cached_hostnames.is_empty() && self.re_cache_every.is_some() {
            return Err(fail(
                "\"reCacheEvery\" must not be set without \"cachedHostnames\"",
            ));
        }

        if self.allow_all_hostnames {
            if !self.allowed_hostnames.is_empty() {
                return Err(fail(
                    "\"allowAllHostnames\" and \"allowedHostnames\" are mutually exclusive",
                ));
            }
            if !self.cached_hostnames.is_empty() {
                return Err(fail(
                    "\"allowAllHostnames\" and \"cachedHostnames\" are mutually exclusive",
                ));
            }
            if self.allow_answers_for.is_some() {
                return Err(fail(
                    "\"allowAnswersFor\" must not be set with \"allowAllHostnames\"",
                ));
            }
            if self.traffic_queue.is_some() {
                return Err(fail(
                    "\"trafficQueue\" must not be set with \"allowAllHostnames\"",
                ));
            }
            if self.lookup_unknown_ips {
                return Err(fail(
                    "\"lookupUnknownIPs\" must not be set with \"allowAllHostnames\"",
                ));
            }
            if self.dns_queue.is_none() {
                return Err(fail("\"dnsQueue\" must be set"));
            }
            return Ok(());
        }

        if !self.allowed_hostnames.is_empty() {
            if self.dns_queue.is_none() {
                return Err(fail("\"dnsQueue\" must be set"));
            }
            if self.allow_answers_for.is_none() {
                return Err(fail(
                    "\"allowAnswersFor\" must be set with \"allowedHostnames\"",
                ));
            }
        } else {
            if !self.lookup_unknown_ips && self.cached_hostnames.is_empty() {
                return Err(fail(
                    "filter must configure \"allowedHostnames\", \"allowAllHostnames\", \"cachedHostnames\" or \"lookupUnknownIPs\"",
                ));
            }
            if self.dns_queue.is_some() {
                return Err(fail(
                    "\"dnsQueue\" must not be set when only \"cachedHostnames\" and/or \"lookupUnknownIPs\" are set",
                ));
            }
            if self.allow_answers_for.is_some() {
                return Err(fail(
                    "\"allowAnswersFor\" must not be set without \"allowedHostnames\"",
                ));
            }
        }

        // The only effect of these two options is populating the allowed-IP
        // cache, which exists only alongside a traffic queue.
        if self.lookup_unknown_ips && self.traffic_queue.is_none() {
            return Err(fail("\"trafficQueue\" must be set with \"lookupUnknownIPs\""));
        }
        if !self.cached_hostnames.is_empty() && self.traffic_queue.is_none() {
            return Err(fail("\"trafficQueue\" must be set with \"cachedHostnames\""));
        }

        if self.dns_queue.is_some() && self.dns_queue == self.traffic_queue {
            return Err(fail("\"dnsQueue\" and \"trafficQueue\" must differ"));
        }

        Ok(())
    }
}

mod duration {
    use serde::{Deserialize, Deserializer};
    use std::time::Duration;

    pub(super) fn option<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = Option::<String>::deserialize(deserializer)?;
        raw.map(|raw| humantime::parse_duration(&raw).map_err(serde::de::Error::custom))
            .transpose()
    }
}
