//! Per-client admission limits.

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::Serialize;

const RATE_WINDOW: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Allowed,
    RateLimited,
    ConcurrencyLimitExceeded,
}

#[derive(Default)]
struct ClientUsage {
    in_flight: u32,
    recent: VecDeque<Instant>,
}

impl ClientUsage {
    fn prune(&mut self, now: Instant) {
        while let Some(&oldest) = self.recent.front() {
            if now.duration_since(oldest) >= RATE_WINDOW {
                self.recent.pop_front();
            } else {
                break;
            }
        }
    }

    fn is_idle(&self) -> bool {
        self.in_flight == 0 && self.recent.is_empty()
    }
}

#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ClientStats {
    pub client_id: String,
    pub in_flight: u32,
    pub submissions_last_minute: usize,
}

/// Tracks admitted-but-unfinished submissions and the one-minute submission rate per client
pub struct QuotaTracker {
    clients: Mutex<HashMap<String, ClientUsage>>,
    rate_per_minute: u32,
    max_in_flight: u32,
}

impl QuotaTracker {
    pub fn new(rate_per_minute: u32, max_in_flight: u32) -> Self {
        Self {
            clients: Mutex::new(HashMap::new()),
            rate_per_minute,
            max_in_flight,
        }
    }

    pub fn try_admit(&self, client_id: &str) -> Admission {
        self.try_admit_at(client_id, Instant::now())
    }

    pub fn try_admit_at(&self, client_id: &str, now: Instant) -> Admission {
        let mut clients = self.clients.lock();
        // Rejected clients never get an entry
        let admission = match clients.get_mut(client_id) {
            Some(usage) => {
                usage.prune(now);
                self.check(usage)
            }
            None => self.check(&ClientUsage::default()),
        };

        if admission == Admission::Allowed {
            let usage = clients.entry(client_id.to_string()).or_default();
            usage.in_flight += 1;
            usage.recent.push_back(now);
        }
        admission
    }

    fn check(&self, usage: &ClientUsage) -> Admission {
        if usage.in_flight >= self.max_in_flight {
            Admission::ConcurrencyLimitExceeded
        } else if usage.recent.len() >= self.rate_per_minute as usize {
            Admission::RateLimited
        } else {
            Admission::Allowed
        }
    }

    /// Undoes the most recent admission of a client that was rejected further down
    pub fn rollback(&self, client_id: &str) {
        let mut clients = self.clients.lock();
        if let Some(usage) = clients.get_mut(client_id) {
            usage.in_flight = usage.in_flight.saturating_sub(1);
            usage.recent.pop_back();
            if usage.is_idle() {
                clients.remove(client_id);
            }
        }
    }

    /// Called once per admitted submission when it reaches a terminal state
    pub fn release(&self, client_id: &str) {
        let mut clients = self.clients.lock();
        match clients.get_mut(client_id) {
            Some(usage) if usage.in_flight > 0 => {
                usage.in_flight -= 1;
                usage.prune(Instant::now());
                if usage.is_idle() {
                    clients.remove(client_id);
                }
            }
            _ => log::warn!("Quota release for client {client_id} without a matching admission"),
        }
    }

    pub fn in_flight(&self, client_id: &str) -> u32 {
        self.clients
            .lock()
            .get(client_id)
            .map_or(0, |usage| usage.in_flight)
    }

    /// Drops clients with nothing in flight and no submissions inside the rate window
    pub fn prune_idle(&self, now: Instant) -> usize {
        let mut clients = self.clients.lock();
        let before = clients.len();
        clients.retain(|_, usage| {
            usage.prune(now);
            !usage.is_idle()
        });
        before - clients.len()
    }

    pub fn client_count(&self) -> usize {
        self.clients.lock().len()
    }

    pub fn snapshot(&self) -> Vec<ClientStats> {
        self.prune_idle(Instant::now());
        let clients = self.clients.lock();
        let mut stats: Vec<_> = clients
            .iter()
            .map(|(client_id, usage)| ClientStats {
                client_id: client_id.clone(),
                in_flight: usage.in_flight,
                submissions_last_minute: usage.recent.len(),
            })
            .collect();
        stats.sort_by(|a, b| a.client_id.cmp(&b.client_id));
        stats
    }
}
