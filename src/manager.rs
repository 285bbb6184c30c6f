use std::sync::{Arc, OnceLock};

use async_trait::async_trait;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::config::{Config, FilterConfig};
use crate::error::Error;
use crate::filter::{precache_hostnames, DnsRequestHandler, Filter, PtrFallback, TrafficHandler};
use crate::packet::{decode_dns, Family};
use crate::queue::{PacketHandler, QueueWorker, QueuedPacket, Verdict};
use crate::resolver::Resolver;

/// Handler for the inbound DNS-reply queue shared by all filters.
struct DnsResponseHandler {
    filters: Arc<OnceLock<Vec<Arc<Filter>>>>,
    family: Family,
}

#[async_trait]
impl PacketHandler for DnsResponseHandler {
    async fn decide(&self, packet: &QueuedPacket) -> Option<Verdict> {
        let Some(state) = packet.state else {
            return None;
        };
        if packet.payload.is_empty() {
            return None;
        }
        // Only replies on connections the kernel saw the query of are
        // honoured; anything else could be a locally forged answer trying
        // to unlock arbitrary destinations.
        if !state.is_established() {
            tracing::warn!(?state, "dropping DNS reply with unexpected conntrack state");
            return Some(Verdict::Drop);
        }

        let reply = match decode_dns(&packet.payload, self.family, true) {
            Ok(reply) => reply,
            Err(err) => {
                tracing::warn!("failed to decode DNS reply: {err}");
                return None;
            }
        };

        let filters = self.filters.get()?;

        let Some(filter) = filters
            .iter()
            .find(|filter| filter.pending.exists(&reply.connection))
        else {
            tracing::warn!(connection = %reply.connection, "dropping DNS reply without matching request");
            return Some(Verdict::Drop);
        };

        filter.pending.remove(&reply.connection);

        if !filter.allow_all_hostnames {
            if !filter.questions_allowed(&reply.message) {
                return Some(Verdict::Drop);
            }
            if !filter.is_self && reply.message.answer_count() > 0 {
                filter.record_answers(&reply.message);
            }
        }

        tracing::debug!(filter = %filter.name, connection = %reply.connection, "allowing DNS reply");
        Some(Verdict::Accept)
    }
}

/// Owns every filter, their queue workers and background tasks.
pub struct FilterManager {
    filters: Arc<OnceLock<Vec<Arc<Filter>>>>,
    response_worker: Option<JoinHandle<()>>,
    filter_workers: Vec<JoinHandle<()>>,
    precache_tasks: Vec<JoinHandle<()>>,
    ready: watch::Sender<bool>,
    shutdown: watch::Sender<bool>,
}

impl FilterManager {
    /// Open every configured queue and start filtering.
    ///
    /// Startup order matters: the reply queue opens first so pre-cache
    /// lookups started during filter setup find it running; each filter
    /// wires its traffic queue, then its DNS queue, then its pre-cache task
    /// and signals its local readiness; the manager-wide readiness fires
    /// last, releasing the response handler.
    pub async fn start(config: &Config) -> Result<Self, Error> {
        let mut manager = Self {
            filters: Arc::new(OnceLock::new()),
            response_worker: None,
            filter_workers: Vec::new(),
            precache_tasks: Vec::new(),
            ready: watch::channel(false).0,
            shutdown: watch::channel(false).0,
        };

        if let Err(err) = manager.start_filters(config).await {
            manager.stop().await;
            return Err(err);
        }

        Ok(manager)
    }

    /// Stop all workers and background tasks, then tear down the caches.
    pub async fn stop(mut self) {
        let _ = self.shutdown.send(true);

        // Reverse of startup: the reply queue goes first, then per-filter
        // work, then the caches.
        if let Some(worker) = self.response_worker.take() {
            let _ = worker.await;
        }
        for task in self.precache_tasks.drain(..) {
            let _ = task.await;
        }
        for worker in self.filter_workers.drain(..) {
            let _ = worker.await;
        }

        if let Some(filters) = self.filters.get() {
            for filter in filters {
                filter.stop();
            }
        }

        tracing::info!("filters stopped");
    }

    async fn start_filters(&mut self, config: &Config) -> Result<(), Error> {
        let family = if config.ipv6 {
            Family::Ipv6
        } else {
            Family::Ipv4
        };

        let resolver = match config.self_dns_queue {
            Some(_) => Some(Arc::new(Resolver::from_system_conf()?)),
            None => None,
        };

        let response_handler = DnsResponseHandler {
            filters: self.filters.clone(),
            family,
        };
        let worker = QueueWorker::open(
            config.inbound_dns_queue,
            response_handler,
            self.ready.subscribe(),
            self.shutdown.subscribe(),
        )?;
        self.response_worker = Some(tokio::spawn(worker.run()));

        let synthetic = config.self_filter();
        let mut plan: Vec<(&FilterConfig, bool)> = Vec::new();
        if let Some(synthetic) = &synthetic {
            plan.push((synthetic, true));
        }
        plan.extend(config.filters.iter().map(|filter| (filter, false)));

        let mut filters = Vec::with_capacity(plan.len());
        for (filter_config, is_self) in plan {
            let filter = Arc::new(Filter::new(filter_config, family, is_self));
            // Released once the filter is fully wired, closing the race
            // where the kernel delivers a packet first.
            let (filter_ready, _) = watch::channel(false);

            if let Some(queue) = filter_config.traffic_queue {
                let handler = TrafficHandler {
                    filter: filter.clone(),
                    ptr: filter_config.lookup_unknown_ips.then(|| PtrFallback {
                        resolver: resolver
                            .clone()
                            .expect("validated config pairs lookupUnknownIPs with selfDNSQueue"),
                    }),
                };
                let worker = QueueWorker::open(
                    queue,
                    handler,
                    filter_ready.subscribe(),
                    self.shutdown.subscribe(),
                )?;
                self.filter_workers.push(tokio::spawn(worker.run()));
            }

            if let Some(queue) = filter_config.dns_queue {
                let handler = DnsRequestHandler {
                    filter: filter.clone(),
                };
                let worker = QueueWorker::open(
                    queue,
                    handler,
                    filter_ready.subscribe(),
                    self.shutdown.subscribe(),
                )?;
                self.filter_workers.push(tokio::spawn(worker.run()));
            }

            if !filter_config.cached_hostnames.is_empty() {
                self.precache_tasks.push(tokio::spawn(precache_hostnames(
                    filter.clone(),
                    resolver
                        .clone()
                        .expect("validated config pairs cachedHostnames with selfDNSQueue"),
                    filter_config.cached_hostnames.clone(),
                    filter_config
                        .re_cache_every
                        .expect("validated config pairs cachedHostnames with reCacheEvery"),
                    self.shutdown.subscribe(),
                )));
            }

            let _ = filter_ready.send(true);
            tracing::info!(filter = %filter.name, "filter started");
            filters.push(filter);
        }

        let _ = self.filters.set(filters);
        let _ = self.ready.send(true);

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::DNS_QUERY_TIMEOUT;
    use crate::packet::testpkt;
    use crate::queue::ConnState;
    use hickory_proto::rr::RecordType;
    use std::net::{IpAddr, Ipv4Addr};
    use std::time::Duration;
    use tokio::time::advance;

    const CLIENT: (Ipv4Addr, u16) = (Ipv4Addr::new(10, 0, 0, 2), 34000);
    const SERVER: (Ipv4Addr, u16) = (Ipv4Addr::new(9, 9, 9, 9), 53);

    fn test_filter(allow_answers_for: Duration) -> Arc<Filter> {
        Arc::new(Filter::new(
            &FilterConfig {
                name: "test".to_string(),
                dns_queue: Some(1000),
                traffic_queue: Some(1001),
                allow_answers_for: Some(allow_answers_for),
                allowed_hostnames: vec!["example.com".to_string()],
                ..FilterConfig::default()
            },
            Family::Ipv4,
            false,
        ))
    }

    fn handler_for(filters: Vec<Arc<Filter>>) -> DnsResponseHandler {
        let slot = Arc::new(OnceLock::new());
        assert!(slot.set(filters).is_ok());
        DnsResponseHandler {
            filters: slot,
            family: Family::Ipv4,
        }
    }

    /// Simulate the request path: record the pending entry the request
    /// handler would have recorded for this query.
    fn record_pending(filter: &Filter, name: &str) -> crate::packet::ConnectionId {
        let query = testpkt::udp4(&testpkt::query(7, name, RecordType::A), CLIENT, SERVER);
        let connection = decode_dns(&query, Family::Ipv4, false).unwrap().connection;
        filter.pending.add(connection, DNS_QUERY_TIMEOUT);
        connection
    }

    fn reply_packet(message: &hickory_proto::op::Message) -> QueuedPacket {
        QueuedPacket {
            state: Some(ConnState::EstablishedReply),
            payload: testpkt::udp4(message, SERVER, CLIENT),
        }
    }

    #[tokio::test]
    async fn matched_reply_populates_allowed_ips() {
        let filter = test_filter(Duration::from_secs(30));
        let handler = handler_for(vec![filter.clone()]);

        let connection = record_pending(&filter, "a.b.example.com.");
        let reply = testpkt::reply_with_a(7, "a.b.example.com.", Ipv4Addr::new(1, 2, 3, 4), 300);

        assert_eq!(
            handler.decide(&reply_packet(&reply)).await,
            Some(Verdict::Accept)
        );
        assert!(!filter.pending.exists(&connection));
        assert!(filter
            .allowed_ips
            .as_ref()
            .unwrap()
            .exists(&IpAddr::V4(Ipv4Addr::new(1, 2, 3, 4))));
    }

    #[tokio::test]
    async fn forged_reply_is_dropped() {
        let filter = test_filter(Duration::from_secs(30));
        let handler = handler_for(vec![filter.clone()]);

        // No pending request for this connection.
        let reply = testpkt::reply_with_a(7, "example.com.", Ipv4Addr::new(9, 9, 9, 9), 300);

        assert_eq!(
            handler.decide(&reply_packet(&reply)).await,
            Some(Verdict::Drop)
        );
        assert!(!filter
            .allowed_ips
            .as_ref()
            .unwrap()
            .exists(&IpAddr::V4(Ipv4Addr::new(9, 9, 9, 9))));
    }

    #[tokio::test]
    async fn unestablished_reply_is_dropped() {
        let filter = test_filter(Duration::from_secs(30));
        let handler = handler_for(vec![filter.clone()]);

        record_pending(&filter, "example.com.");
        let reply = testpkt::reply_with_a(7, "example.com.", Ipv4Addr::new(1, 2, 3, 4), 300);
        let packet = QueuedPacket {
            state: Some(ConnState::New),
            payload: testpkt::udp4(&reply, SERVER, CLIENT),
        };

        assert_eq!(handler.decide(&packet).await, Some(Verdict::Drop));
    }

    #[tokio::test(start_paused = true)]
    async fn answer_ttl_is_clamped_to_allow_answers_for() {
        let filter = test_filter(Duration::from_secs(5));
        let handler = handler_for(vec![filter.clone()]);

        record_pending(&filter, "example.com.");
        // The record's own TTL is an hour; the clamp must win.
        let reply = testpkt::reply_with_a(7, "example.com.", Ipv4Addr::new(1, 2, 3, 4), 3600);
        handler.decide(&reply_packet(&reply)).await;

        let ip = IpAddr::V4(Ipv4Addr::new(1, 2, 3, 4));
        let allowed = filter.allowed_ips.as_ref().unwrap();

        advance(Duration::from_secs(4)).await;
        assert!(allowed.exists(&ip));

        advance(Duration::from_secs(2)).await;
        assert!(!allowed.exists(&ip));
    }

    #[tokio::test]
    async fn cname_answers_become_additional_hostnames() {
        let filter = test_filter(Duration::from_secs(30));
        let handler = handler_for(vec![filter.clone()]);

        record_pending(&filter, "example.com.");
        let reply = testpkt::reply_with_cname(7, "example.com.", "cdn.example-edge.net.");

        assert_eq!(
            handler.decide(&reply_packet(&reply)).await,
            Some(Verdict::Accept)
        );
        assert!(filter.hostname_allowed("cdn.example-edge.net"));
    }

    #[tokio::test]
    async fn reply_with_disallowed_question_is_dropped() {
        let filter = test_filter(Duration::from_secs(30));
        let handler = handler_for(vec![filter.clone()]);

        record_pending(&filter, "fakeexample.com.");
        let reply = testpkt::reply_with_a(7, "fakeexample.com.", Ipv4Addr::new(1, 2, 3, 4), 300);

        assert_eq!(
            handler.decide(&reply_packet(&reply)).await,
            Some(Verdict::Drop)
        );
        assert!(!filter
            .allowed_ips
            .as_ref()
            .unwrap()
            .exists(&IpAddr::V4(Ipv4Addr::new(1, 2, 3, 4))));
    }

    #[tokio::test]
    async fn self_filter_reply_skips_answer_recording() {
        let synthetic = Arc::new(Filter::new(
            &FilterConfig {
                name: "self".to_string(),
                dns_queue: Some(101),
                allowed_hostnames: vec!["deb.debian.org".to_string()],
                ..FilterConfig::default()
            },
            Family::Ipv4,
            true,
        ));
        let handler = handler_for(vec![synthetic.clone()]);

        record_pending(&synthetic, "deb.debian.org.");
        let reply = testpkt::reply_with_a(7, "deb.debian.org.", Ipv4Addr::new(1, 2, 3, 4), 300);

        // Accepted, but nothing is recorded: the self-filter has no allow
        // caches to populate.
        assert_eq!(
            handler.decide(&reply_packet(&reply)).await,
            Some(Verdict::Accept)
        );
        assert!(synthetic.allowed_ips.is_none());
        assert!(synthetic.additional_hostnames.is_none());
    }

    #[tokio::test]
    async fn reply_without_conntrack_info_gets_no_verdict() {
        let filter = test_filter(Duration::from_secs(30));
        let handler = handler_for(vec![filter]);

        let reply = testpkt::reply_with_a(7, "example.com.", Ipv4Addr::new(1, 2, 3, 4), 300);
        let packet = QueuedPacket {
            state: None,
            payload: testpkt::udp4(&reply, SERVER, CLIENT),
        };

        assert_eq!(handler.decide(&packet).await, None);
    }

    #[tokio::test]
    async fn first_matching_filter_owns_the_reply() {
        let first = test_filter(Duration::from_secs(30));
        let second = test_filter(Duration::from_secs(30));
        let handler = handler_for(vec![first.clone(), second.clone()]);

        record_pending(&first, "example.com.");
        let reply = testpkt::reply_with_a(7, "example.com.", Ipv4Addr::new(1, 2, 3, 4), 300);

        assert_eq!(
            handler.decide(&reply_packet(&reply)).await,
            Some(Verdict::Accept)
        );
        assert!(first
            .allowed_ips
            .as_ref()
            .unwrap()
            .exists(&IpAddr::V4(Ipv4Addr::new(1, 2, 3, 4))));
        assert!(!second
            .allowed_ips
            .as_ref()
            .unwrap()
            .exists(&IpAddr::V4(Ipv4Addr::new(1, 2, 3, 4))));
    }
}
