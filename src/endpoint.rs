//! Source endpoint health and ranking
//!
//! Every URI that can serve byte ranges of the content is a source endpoint.
//! The pool tracks observed throughput and consecutive failures per endpoint
//! so the coordinator can hand work to the fastest healthy source and stop
//! using sources that keep failing.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::protocol::EndpointHealth;

/// Weight of the newest sample in the throughput moving average
const THROUGHPUT_ALPHA: f64 = 0.2;

/// One source of the content
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceEndpoint {
    pub uri: String,
    /// Exponential moving average of observed bytes/sec
    pub throughput: f64,
    pub health: EndpointHealth,
    pub consecutive_failures: u32,
    pub bytes_served: u64,
}

impl SourceEndpoint {
    pub fn new(uri: impl Into<String>) -> Self {
        Self {
            uri: uri.into(),
            throughput: 0.0,
            health: EndpointHealth::Healthy,
            consecutive_failures: 0,
            bytes_served: 0,
        }
    }

    fn observe(&mut self, bytes: u64, elapsed: Duration) {
        self.bytes_served += bytes;
        let secs = elapsed.as_secs_f64();
        if secs <= 0.0 || bytes == 0 {
            return;
        }
        let rate = bytes as f64 / secs;
        self.throughput = if self.throughput == 0.0 {
            rate
        } else {
            THROUGHPUT_ALPHA * rate + (1.0 - THROUGHPUT_ALPHA) * self.throughput
        };
    }
}

/// All endpoints of one session, owned by its coordinator
#[derive(Debug, Clone)]
pub struct EndpointPool {
    endpoints: Vec<SourceEndpoint>,
    failure_threshold: u32,
}

impl EndpointPool {
    pub fn new<I, S>(uris: I, failure_threshold: u32) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            endpoints: uris.into_iter().map(SourceEndpoint::new).collect(),
            failure_threshold: failure_threshold.max(1),
        }
    }

    pub fn len(&self) -> usize {
        self.endpoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.endpoints.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&SourceEndpoint> {
        self.endpoints.get(index)
    }

    pub fn is_usable(&self, index: usize) -> bool {
        self.endpoints
            .get(index)
            .is_some_and(|e| e.health.is_usable())
    }

    /// Number of endpoints that are not dead
    pub fn usable_count(&self) -> usize {
        self.endpoints
            .iter()
            .filter(|e| e.health.is_usable())
            .count()
    }

    /// Usable endpoint indices, healthiest then fastest first
    pub fn ranked(&self) -> Vec<usize> {
        let mut indices: Vec<usize> = (0..self.endpoints.len())
            .filter(|&i| self.endpoints[i].health.is_usable())
            .collect();
        indices.sort_by(|&a, &b| {
            let (ea, eb) = (&self.endpoints[a], &self.endpoints[b]);
            ea.health
                .cmp(&eb.health)
                .then_with(|| eb.throughput.total_cmp(&ea.throughput))
                .then_with(|| a.cmp(&b))
        });
        indices
    }

    /// Best usable endpoint not in `excluded`
    pub fn best_excluding(&self, excluded: &[usize]) -> Option<usize> {
        self.ranked().into_iter().find(|i| !excluded.contains(i))
    }

    /// Record a verified segment; returns the new health if it changed
    pub fn report_success(
        &mut self,
        index: usize,
        bytes: u64,
        elapsed: Duration,
    ) -> Option<EndpointHealth> {
        let endpoint = self.endpoints.get_mut(index)?;
        endpoint.observe(bytes, elapsed);
        endpoint.consecutive_failures = 0;
        if endpoint.health == EndpointHealth::Degraded {
            endpoint.health = EndpointHealth::Healthy;
            tracing::info!("Endpoint {} recovered", endpoint.uri);
            return Some(EndpointHealth::Healthy);
        }
        None
    }

    /// Record a permanent segment failure; returns the new health if it changed
    ///
    /// The first failure degrades an endpoint, `failure_threshold`
    /// consecutive failures kill it. Dead endpoints stay dead.
    pub fn report_failure(&mut self, index: usize) -> Option<EndpointHealth> {
        let threshold = self.failure_threshold;
        let endpoint = self.endpoints.get_mut(index)?;
        if endpoint.health == EndpointHealth::Dead {
            return None;
        }
        endpoint.consecutive_failures += 1;

        let next = if endpoint.consecutive_failures >= threshold {
            EndpointHealth::Dead
        } else {
            EndpointHealth::Degraded
        };
        if next == endpoint.health {
            return None;
        }
        endpoint.health = next;
        tracing::warn!(
            "Endpoint {} is now {} after {} consecutive failure(s)",
            endpoint.uri,
            next,
            endpoint.consecutive_failures
        );
        Some(next)
    }

    /// Cloned view of every endpoint
    pub fn snapshot(&self) -> Vec<SourceEndpoint> {
        self.endpoints.clone()
    }
}
