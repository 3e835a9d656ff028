//! Statsd client wrapper, trimmed to the counters and timers the quota
//! engine actually emits: probe overflow and fetch-failure counts, gate
//! hits tagged by quota category, and the per-epoch refresh timer.

use std::collections::HashMap;
use std::net::UdpSocket;
use std::sync::Arc;
use std::time::Instant;

use cadence::{
    BufferedUdpMetricSink, Counted, NopMetricSink, QueuingMetricSink, StatsdClient, Timed,
};

use crate::{Oid, QuotaType};

pub use cadence::MetricError;

#[derive(Clone, Debug)]
struct Timer {
    label: String,
    started: Instant,
    tags: HashMap<String, String>,
}

#[derive(Clone, Debug, Default)]
pub struct Metrics {
    client: Option<Arc<StatsdClient>>,
    tags: HashMap<String, String>,
    timer: Option<Timer>,
}

impl Metrics {
    /// A metrics handle that accepts everything and sends nothing; the
    /// standard instance for tests and the mock cluster.
    pub fn noop() -> Self {
        Metrics {
            client: Some(Arc::new(StatsdClient::builder("", NopMetricSink).build())),
            tags: HashMap::default(),
            timer: None,
        }
    }

    pub fn incr(&self, label: &str) {
        self.send_count(label, 1, &[]);
    }

    pub fn incr_with_tag(&self, label: &str, key: &str, value: &str) {
        self.send_count(label, 1, &[(key, value)]);
    }

    /// Gate and evaluator counters are split by the quota category that
    /// tripped, so dashboards can tell schema blocks from role blocks.
    pub fn incr_quota_type(&self, label: &str, quota_type: QuotaType) {
        let category = quota_type.to_string();
        self.send_count(label, 1, &[("quota_type", &category)]);
    }

    pub fn count(&self, label: &str, value: i64) {
        self.send_count(label, value, &[]);
    }

    /// A handle that times one refresh epoch of `db`'s worker, reported
    /// when it drops at the end of the epoch.
    pub fn refresh_timer(&self, db: Oid) -> Metrics {
        let mut timed = self.clone();
        timed.timer = Some(Timer {
            label: "worker.refresh".to_owned(),
            started: Instant::now(),
            tags: HashMap::from([("database".to_owned(), db.to_string())]),
        });
        timed
    }

    fn send_count(&self, label: &str, value: i64, extra: &[(&str, &str)]) {
        let Some(client) = self.client.as_ref() else {
            return;
        };
        let mut builder = client.count_with_tags(label, value);
        for (key, val) in self.tags.iter() {
            builder = builder.with_tag(key, val);
        }
        for (key, val) in extra {
            builder = builder.with_tag(key, val);
        }
        if let Err(e) = builder.try_send() {
            // eat the metric, but log the error
            warn!("metric {} not sent: {:?}", label, e);
        }
    }
}

impl Drop for Metrics {
    fn drop(&mut self) {
        let Some(timer) = self.timer.take() else {
            return;
        };
        let Some(client) = self.client.as_ref() else {
            return;
        };
        let lapse = timer.started.elapsed().as_millis() as u64;
        let mut builder = client.time_with_tags(&timer.label, lapse);
        for (key, val) in timer.tags.iter() {
            builder = builder.with_tag(key, val);
        }
        if let Err(e) = builder.try_send() {
            warn!("timer {} not sent: {:?}", timer.label, e);
        }
    }
}

impl From<&Arc<StatsdClient>> for Metrics {
    fn from(client: &Arc<StatsdClient>) -> Self {
        Metrics {
            client: Some(client.clone()),
            tags: HashMap::default(),
            timer: None,
        }
    }
}

/// Build the shared statsd client from the daemon settings; without a host
/// every metric lands in a no-op sink.
pub fn metrics_from_opts(
    label: &str,
    host: Option<&str>,
    port: u16,
) -> Result<Arc<StatsdClient>, MetricError> {
    let builder = match host {
        Some(host) => {
            let socket = UdpSocket::bind("0.0.0.0:0")?;
            socket.set_nonblocking(true)?;
            let udp_sink = BufferedUdpMetricSink::from((host, port), socket)?;
            StatsdClient::builder(label, QueuingMetricSink::from(udp_sink))
        }
        None => StatsdClient::builder(label, NopMetricSink),
    };
    Ok(Arc::new(
        builder
            .with_error_handler(|err| {
                warn!("metric sink error: {:?}", err);
            })
            .build(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn noop_metrics_swallow_everything() {
        let metrics = Metrics::noop();
        metrics.incr("probe.active_table_overflow");
        metrics.incr_quota_type("quota.at_limit", QuotaType::Schema);
        metrics.count("evaluator.blocked_relations", 3);
        let timed = metrics.refresh_timer(5);
        drop(timed);
    }
}
