use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use hickory_proto::op::Message;
use hickory_proto::rr::RData;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;

use crate::cache::TimedCache;
use crate::config::FilterConfig;
use crate::packet::{decode_dns, decode_endpoints, normalize_hostname, ConnectionId, Family};
use crate::queue::{PacketHandler, QueuedPacket, Verdict};
use crate::resolver::Resolver;

/// How long an allowed DNS request waits for its reply before the pending
/// entry expires.
pub(crate) const DNS_QUERY_TIMEOUT: Duration = Duration::from_secs(60);

/// Extra validity granted to pre-cached entries beyond the refresh
/// interval, so they survive a slow refresh cycle.
const PRECACHE_TTL_SLACK: Duration = Duration::from_secs(60);

/// Runtime instance of one configured filter policy.
pub(crate) struct Filter {
    pub(crate) name: String,
    pub(crate) family: Family,
    pub(crate) is_self: bool,
    pub(crate) allow_all_hostnames: bool,
    pub(crate) allowed_hostnames: Vec<String>,
    pub(crate) allow_answers_for: Option<Duration>,
    /// DNS requests allowed through but not yet answered.
    pub(crate) pending: TimedCache<ConnectionId>,
    /// IPs traffic may flow to, learned from answers, reverse lookups and
    /// pre-caching. Present iff the filter owns a traffic queue.
    pub(crate) allowed_ips: Option<TimedCache<IpAddr>>,
    /// Names learned from CNAME/SRV answers. The self-filter never has one.
    pub(crate) additional_hostnames: Option<TimedCache<String>>,
}

impl Filter {
    pub(crate) fn new(config: &FilterConfig, family: Family, is_self: bool) -> Self {
        let gates_traffic = config.traffic_queue.is_some();

        Self {
            name: config.name.clone(),
            family,
            is_self,
            allow_all_hostnames: config.allow_all_hostnames,
            allowed_hostnames: config.allowed_hostnames.clone(),
            allow_answers_for: config.allow_answers_for,
            pending: TimedCache::new(),
            allowed_ips: gates_traffic.then(TimedCache::new),
            additional_hostnames: (gates_traffic && !is_self).then(TimedCache::new),
        }
    }

    /// Whether a (normalized) name matches the allow rules: equal to a
    /// configured hostname, below it with a `.` separator, or learned from
    /// a previous answer.
    pub(crate) fn hostname_allowed(&self, name: &str) -> bool {
        if self.allowed_hostnames.iter().any(|allowed| {
            name == allowed
                || name
                    .strip_suffix(allowed.as_str())
                    .is_some_and(|prefix| prefix.ends_with('.'))
        }) {
            return true;
        }

        self.additional_hostnames
            .as_ref()
            .is_some_and(|learned| learned.exists(name))
    }

    /// Validate every question of a message; a single failing question
    /// rejects the whole packet, as does an empty question section.
    pub(crate) fn questions_allowed(&self, message: &Message) -> bool {
        let queries = message.queries();
        if queries.is_empty() {
            tracing::warn!(filter = %self.name, "dropping DNS message without questions");
            return false;
        }

        queries.iter().all(|query| {
            let name = normalize_hostname(query.name());
            let allowed = self.hostname_allowed(&name);
            if !allowed {
                tracing::warn!(filter = %self.name, %name, "question does not match any allowed hostname");
            }
            allowed
        })
    }

    /// Feed a validated reply's answers into the allow caches. The cache
    /// TTL is `allowAnswersFor`, not the answer's own TTL, so exposure
    /// stays bounded regardless of what the server chose.
    pub(crate) fn record_answers(&self, message: &Message) {
        let Some(ttl) = self.allow_answers_for else {
            return;
        };

        for record in message.answers() {
            match record.data() {
                Some(RData::A(a)) => self.allow_ip(IpAddr::V4(a.0), ttl),
                Some(RData::AAAA(aaaa)) => self.allow_ip(IpAddr::V6(aaaa.0), ttl),
                Some(RData::CNAME(cname)) => self.allow_name(normalize_hostname(&cname.0), ttl),
                Some(RData::SRV(srv)) => self.allow_name(normalize_hostname(srv.target()), ttl),
                _ => {}
            }
        }
    }

    pub(crate) fn stop(&self) {
        self.pending.stop();
        if let Some(cache) = &self.allowed_ips {
            cache.stop();
        }
        if let Some(cache) = &self.additional_hostnames {
            cache.stop();
        }
    }

    fn allow_ip(&self, ip: IpAddr, ttl: Duration) {
        if let Some(allowed) = &self.allowed_ips {
            tracing::debug!(filter = %self.name, %ip, "allowing answered IP");
            allowed.add(ip, ttl);
        }
    }

    fn allow_name(&self, name: String, ttl: Duration) {
        if let Some(learned) = &self.additional_hostnames {
            tracing::debug!(filter = %self.name, %name, "allowing answered hostname");
            learned.add(name, ttl);
        }
    }
}

/// Handler for a filter's DNS request queue.
pub(crate) struct DnsRequestHandler {
    pub(crate) filter: Arc<Filter>,
}

#[async_trait]
impl PacketHandler for DnsRequestHandler {
    async fn decide(&self, packet: &QueuedPacket) -> Option<Verdict> {
        let filter = &self.filter;

        let Some(state) = packet.state else {
            return None;
        };
        if packet.payload.is_empty() {
            return None;
        }
        if !state.is_tracked() {
            tracing::warn!(filter = %filter.name, ?state, "dropping DNS request with unexpected conntrack state");
            return Some(Verdict::Drop);
        }
        if state.is_reply() {
            // Clients re-using a UDP socket query on a connection the
            // kernel already considers answered; allowed, but worth
            // keeping an eye on.
            tracing::debug!(filter = %filter.name, ?state, "DNS request on a reply-direction connection");
        }

        let request = match decode_dns(&packet.payload, filter.family, false) {
            Ok(request) => request,
            Err(err) => {
                tracing::warn!(filter = %filter.name, "failed to decode DNS request: {err}");
                return None;
            }
        };

        if request.message.answer_count() > 0 {
            tracing::warn!(filter = %filter.name, connection = %request.connection, "dropping DNS request carrying answers");
            return Some(Verdict::Drop);
        }

        if !filter.allow_all_hostnames && !filter.questions_allowed(&request.message) {
            return Some(Verdict::Drop);
        }

        // Recorded before the verdict goes out, so the reply can never
        // reach the response queue ahead of the pending entry.
        filter.pending.add(request.connection, DNS_QUERY_TIMEOUT);
        tracing::debug!(filter = %filter.name, connection = %request.connection, "allowing DNS request");

        Some(Verdict::Accept)
    }

    async fn verdict_failed(&self, packet: &QueuedPacket, verdict: Verdict) {
        if verdict != Verdict::Accept {
            return;
        }
        // The kernel never saw the accept; retract the pending entry so a
        // reply cannot match a request that was not delivered.
        if let Ok(request) = decode_dns(&packet.payload, self.filter.family, false) {
            self.filter.pending.remove(&request.connection);
        }
    }
}

/// Handler for a filter's traffic queue.
pub(crate) struct TrafficHandler {
    pub(crate) filter: Arc<Filter>,
    /// Reverse-lookup fallback, present when `lookupUnknownIPs` is enabled.
    pub(crate) ptr: Option<PtrFallback>,
}

pub(crate) struct PtrFallback {
    pub(crate) resolver: Arc<Resolver>,
}

#[async_trait]
impl PacketHandler for TrafficHandler {
    async fn decide(&self, packet: &QueuedPacket) -> Option<Verdict> {
        let filter = &self.filter;

        if packet.payload.is_empty() {
            return None;
        }

        let (src, dst) = match decode_endpoints(&packet.payload, filter.family) {
            Ok(endpoints) => endpoints,
            Err(err) => {
                tracing::warn!(filter = %filter.name, "failed to decode packet: {err}");
                return None;
            }
        };

        let Some(allowed) = &filter.allowed_ips else {
            // Traffic handlers only exist for filters with a traffic queue.
            return Some(Verdict::Drop);
        };

        // Destination first, outbound being the common case.
        if allowed.exists(&dst) || allowed.exists(&src) {
            return Some(Verdict::Accept);
        }

        let Some(ptr) = &self.ptr else {
            tracing::debug!(filter = %filter.name, %src, %dst, "dropping traffic between unknown IPs");
            return Some(Verdict::Drop);
        };

        for ip in [dst, src] {
            if is_private(ip) {
                continue;
            }
            let names = match ptr.resolver.reverse(ip).await {
                Ok(names) => names,
                Err(err) => {
                    tracing::warn!(filter = %filter.name, %ip, "reverse lookup failed: {err}");
                    return Some(Verdict::Drop);
                }
            };
            if let Some(name) = names.iter().find(|name| filter.hostname_allowed(name)) {
                tracing::debug!(filter = %filter.name, %ip, %name, "allowing IP via reverse lookup");
                if let Some(ttl) = filter.allow_answers_for {
                    allowed.add(ip, ttl);
                }
                return Some(Verdict::Accept);
            }
        }

        tracing::debug!(filter = %filter.name, %src, %dst, "dropping traffic between unknown IPs");
        Some(Verdict::Drop)
    }
}

/// Periodically resolve a filter's `cachedHostnames` and refresh its
/// allowed IPs. The lookups themselves traverse `selfDNSQueue`, so they are
/// subject to the self-filter like any other query.
pub(crate) async fn precache_hostnames(
    filter: Arc<Filter>,
    resolver: Arc<Resolver>,
    hostnames: Vec<String>,
    every: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut tick = tokio::time::interval(every);
    tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let ttl = every + PRECACHE_TTL_SLACK;

    loop {
        tokio::select! {
            _ = tick.tick() => {}
            _ = shutdown.wait_for(|stop| *stop) => return,
        }

        let Some(allowed) = &filter.allowed_ips else {
            return;
        };

        for hostname in &hostnames {
            let addrs = match resolver.addrs(hostname, filter.family).await {
                Ok(addrs) => addrs,
                Err(err) => {
                    tracing::warn!(filter = %filter.name, %hostname, "failed to resolve cached hostname: {err}");
                    continue;
                }
            };

            for ip in addrs {
                tracing::debug!(filter = %filter.name, %hostname, %ip, "pre-caching resolved IP");
                allowed.add(ip, ttl);
                if let IpAddr::V6(v6) = ip {
                    if let Some(v4) = v6.to_ipv4_mapped() {
                        allowed.add(IpAddr::V4(v4), ttl);
                    }
                }
            }
        }
    }
}

/// Whether `ip` sits in a private or link-scoped range that reverse DNS
/// could never vouch for.
fn is_private(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => v4.is_private() || v4.is_loopback() || v4.is_link_local(),
        IpAddr::V6(v6) => {
            v6.is_loopback()
                // fc00::/7, unique local
                || (v6.segments()[0] & 0xfe00) == 0xfc00
                // fe80::/10, link local
                || (v6.segments()[0] & 0xffc0) == 0xfe80
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::testpkt;
    use crate::queue::ConnState;
    use hickory_proto::rr::RecordType;
    use std::net::Ipv4Addr;

    const CLIENT: (Ipv4Addr, u16) = (Ipv4Addr::new(10, 0, 0, 2), 34000);
    const SERVER: (Ipv4Addr, u16) = (Ipv4Addr::new(9, 9, 9, 9), 53);

    fn filter_for(hostnames: &[&str]) -> Arc<Filter> {
        Arc::new(Filter::new(
            &FilterConfig {
                name: "test".to_string(),
                dns_queue: Some(1000),
                traffic_queue: Some(1001),
                allow_answers_for: Some(Duration::from_secs(30)),
                allowed_hostnames: hostnames.iter().map(|h| h.to_string()).collect(),
                ..FilterConfig::default()
            },
            Family::Ipv4,
            false,
        ))
    }

    fn request(name: &str, state: Option<ConnState>) -> QueuedPacket {
        QueuedPacket {
            state,
            payload: testpkt::udp4(&testpkt::query(7, name, RecordType::A), CLIENT, SERVER),
        }
    }

    #[test]
    fn hostname_matching_rules() {
        let filter = filter_for(&["example.com"]);

        assert!(filter.hostname_allowed("example.com"));
        assert!(filter.hostname_allowed("a.b.example.com"));
        // The suffix must be separated by a dot.
        assert!(!filter.hostname_allowed("fooexample.com"));
        assert!(!filter.hostname_allowed("example.com.evil.org"));
        assert!(!filter.hostname_allowed("other.org"));
    }

    #[tokio::test]
    async fn learned_hostnames_match() {
        let filter = filter_for(&["example.com"]);

        assert!(!filter.hostname_allowed("cdn.example-edge.net"));
        filter
            .additional_hostnames
            .as_ref()
            .unwrap()
            .add("cdn.example-edge.net".to_string(), Duration::from_secs(30));
        assert!(filter.hostname_allowed("cdn.example-edge.net"));
    }

    #[tokio::test]
    async fn allowed_request_is_accepted_and_recorded() {
        let filter = filter_for(&["example.com"]);
        let handler = DnsRequestHandler {
            filter: filter.clone(),
        };

        let packet = request("a.b.example.com.", Some(ConnState::New));
        assert_eq!(handler.decide(&packet).await, Some(Verdict::Accept));

        let connection = decode_dns(&packet.payload, Family::Ipv4, false)
            .unwrap()
            .connection;
        assert!(filter.pending.exists(&connection));
    }

    #[tokio::test]
    async fn non_suffix_request_is_dropped() {
        let filter = filter_for(&["example.com"]);
        let handler = DnsRequestHandler {
            filter: filter.clone(),
        };

        let packet = request("fakeexample.com.", Some(ConnState::New));
        assert_eq!(handler.decide(&packet).await, Some(Verdict::Drop));

        let connection = decode_dns(&packet.payload, Family::Ipv4, false)
            .unwrap()
            .connection;
        assert!(!filter.pending.exists(&connection));
    }

    #[tokio::test]
    async fn request_without_conntrack_info_gets_no_verdict() {
        let handler = DnsRequestHandler {
            filter: filter_for(&["example.com"]),
        };

        let packet = request("example.com.", None);
        assert_eq!(handler.decide(&packet).await, None);
    }

    #[tokio::test]
    async fn untracked_request_is_dropped() {
        let handler = DnsRequestHandler {
            filter: filter_for(&["example.com"]),
        };

        let packet = request("example.com.", Some(ConnState::Unknown));
        assert_eq!(handler.decide(&packet).await, Some(Verdict::Drop));
    }

    #[tokio::test]
    async fn reply_on_request_queue_is_dropped() {
        let handler = DnsRequestHandler {
            filter: filter_for(&["example.com"]),
        };

        let reply = testpkt::reply_with_a(7, "example.com.", Ipv4Addr::new(1, 2, 3, 4), 300);
        let packet = QueuedPacket {
            state: Some(ConnState::New),
            payload: testpkt::udp4(&reply, CLIENT, SERVER),
        };

        assert_eq!(handler.decide(&packet).await, Some(Verdict::Drop));
    }

    #[tokio::test]
    async fn questionless_request_is_dropped() {
        let handler = DnsRequestHandler {
            filter: filter_for(&["example.com"]),
        };

        let packet = QueuedPacket {
            state: Some(ConnState::New),
            payload: testpkt::udp4(&hickory_proto::op::Message::new(), CLIENT, SERVER),
        };

        assert_eq!(handler.decide(&packet).await, Some(Verdict::Drop));
    }

    #[tokio::test]
    async fn allow_all_skips_question_validation() {
        let filter = Arc::new(Filter::new(
            &FilterConfig {
                name: "open".to_string(),
                dns_queue: Some(1000),
                allow_all_hostnames: true,
                ..FilterConfig::default()
            },
            Family::Ipv4,
            false,
        ));
        let handler = DnsRequestHandler { filter };

        let packet = request("anything.at.all.", Some(ConnState::New));
        assert_eq!(handler.decide(&packet).await, Some(Verdict::Accept));
    }

    #[tokio::test]
    async fn failed_verdict_retracts_pending_entry() {
        let filter = filter_for(&["example.com"]);
        let handler = DnsRequestHandler {
            filter: filter.clone(),
        };

        let packet = request("example.com.", Some(ConnState::New));
        let verdict = handler.decide(&packet).await.unwrap();
        let connection = decode_dns(&packet.payload, Family::Ipv4, false)
            .unwrap()
            .connection;
        assert!(filter.pending.exists(&connection));

        handler.verdict_failed(&packet, verdict).await;
        assert!(!filter.pending.exists(&connection));
    }

    #[tokio::test]
    async fn traffic_is_gated_by_allowed_ips() {
        let filter = filter_for(&["example.com"]);
        let handler = TrafficHandler {
            filter: filter.clone(),
            ptr: None,
        };

        let payload = testpkt::ipv4(6, &[0u8; 24], CLIENT.0, Ipv4Addr::new(1, 2, 3, 4));
        let packet = QueuedPacket {
            state: Some(ConnState::New),
            payload,
        };

        assert_eq!(handler.decide(&packet).await, Some(Verdict::Drop));

        filter
            .allowed_ips
            .as_ref()
            .unwrap()
            .add(IpAddr::V4(Ipv4Addr::new(1, 2, 3, 4)), Duration::from_secs(30));
        assert_eq!(handler.decide(&packet).await, Some(Verdict::Accept));
    }

    #[tokio::test]
    async fn inbound_traffic_matches_on_source() {
        let filter = filter_for(&["example.com"]);
        let handler = TrafficHandler {
            filter: filter.clone(),
            ptr: None,
        };

        filter
            .allowed_ips
            .as_ref()
            .unwrap()
            .add(IpAddr::V4(Ipv4Addr::new(1, 2, 3, 4)), Duration::from_secs(30));

        let payload = testpkt::ipv4(6, &[0u8; 24], Ipv4Addr::new(1, 2, 3, 4), CLIENT.0);
        let packet = QueuedPacket {
            state: Some(ConnState::Established),
            payload,
        };

        assert_eq!(handler.decide(&packet).await, Some(Verdict::Accept));
    }

    #[test]
    fn private_ranges_are_recognized() {
        assert!(is_private("10.1.2.3".parse().unwrap()));
        assert!(is_private("192.168.0.1".parse().unwrap()));
        assert!(is_private("127.0.0.1".parse().unwrap()));
        assert!(is_private("fd00::1".parse().unwrap()));
        assert!(is_private("fe80::1".parse().unwrap()));
        assert!(!is_private("93.184.216.34".parse().unwrap()));
        assert!(!is_private("2606:2800:220:1::1".parse().unwrap()));
    }

    #[test]
    fn self_filter_has_no_learned_names() {
        let filter = Filter::new(
            &FilterConfig {
                name: "self".to_string(),
                dns_queue: Some(101),
                allowed_hostnames: vec!["in-addr.arpa".to_string()],
                ..FilterConfig::default()
            },
            Family::Ipv4,
            true,
        );

        assert!(filter.additional_hostnames.is_none());
        assert!(filter.allowed_ips.is_none());
    }
}
