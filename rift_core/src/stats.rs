//! Moving-average counters for the server.
//!
//! The collector is the server's counter sink: request and session
//! open/close events bump gauges, and per-payload byte counts feed
//! per-second moving averages that a background task flushes once a second.

use std::{
    collections::VecDeque,
    sync::Mutex,
    time::{SystemTime, UNIX_EPOCH},
};

use serde::Serialize;

const DEFAULT_PERIOD: usize = 10;

/// A windowed moving average over per-second buckets.
#[derive(Debug)]
pub struct MovingAverage {
    period: usize,
    window: VecDeque<i64>,
    sum: i64,
    accumulator: i64,
    last_average: f64,
}

impl MovingAverage {
    /// Create an average over `period` buckets; `0` selects the default.
    #[must_use]
    pub fn new(period: usize) -> Self {
        let period = if period == 0 { DEFAULT_PERIOD } else { period };
        Self {
            period,
            window: VecDeque::with_capacity(period + 1),
            sum: 0,
            accumulator: 0,
            last_average: 0.0,
        }
    }

    fn add(&mut self, n: i64) {
        self.accumulator += n;
    }

    /// Roll the accumulator into the window and recompute the average.
    fn flush(&mut self) {
        let bucket = std::mem::take(&mut self.accumulator);
        self.window.push_back(bucket);
        self.sum += bucket;

        if self.window.len() > self.period {
            if let Some(evicted) = self.window.pop_front() {
                self.sum -= evicted;
            }
        }

        self.last_average = if self.window.is_empty() {
            0.0
        } else {
            self.sum as f64 / self.window.len() as f64
        };
    }

    /// The average as of the last flush.
    #[must_use]
    pub fn last_average(&self) -> f64 {
        self.last_average
    }
}

/// A point-in-time dump of the collector.
#[derive(Debug, Clone, Serialize)]
pub struct StatsSnapshot {
    /// Collector start time, unix seconds.
    pub start_time: u64,
    /// High-water mark of concurrent sessions.
    pub max_sessions: i64,
    /// Sessions currently being served.
    pub active_sessions: i64,
    /// High-water mark of concurrent requests.
    pub max_connections: i64,
    /// Requests currently in flight.
    pub active_connections: i64,
    /// Requests per second over the window.
    pub connections_ps: f64,
    /// Payload bytes sent per second over the window.
    pub packets_sent_ps: f64,
    /// Payload bytes received per second over the window.
    pub packets_recv_ps: f64,
}

#[derive(Debug)]
struct Inner {
    max_sessions: i64,
    active_sessions: i64,
    max_connections: i64,
    active_connections: i64,
    connections_ps: MovingAverage,
    packets_sent_ps: MovingAverage,
    packets_recv_ps: MovingAverage,
}

/// Thread-safe counter sink for the server.
#[derive(Debug)]
pub struct StatsCollector {
    start_time: u64,
    inner: Mutex<Inner>,
}

impl StatsCollector {
    /// Create a collector. The owner is responsible for driving
    /// [`StatsCollector::flush`] about once a second.
    #[must_use]
    pub fn new() -> Self {
        let start_time = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or_default();
        Self {
            start_time,
            inner: Mutex::new(Inner {
                max_sessions: 0,
                active_sessions: 0,
                max_connections: 0,
                active_connections: 0,
                connections_ps: MovingAverage::new(0),
                packets_sent_ps: MovingAverage::new(0),
                packets_recv_ps: MovingAverage::new(0),
            }),
        }
    }

    /// An HTTP request entered the server.
    pub fn connection_opened(&self) {
        let mut inner = self.lock();
        inner.active_connections += 1;
        inner.max_connections = inner.max_connections.max(inner.active_connections);
        inner.connections_ps.add(1);
    }

    /// An HTTP request finished.
    pub fn connection_closed(&self) {
        self.lock().active_connections -= 1;
    }

    /// A request was routed into a live session.
    pub fn session_opened(&self) {
        let mut inner = self.lock();
        inner.active_sessions += 1;
        inner.max_sessions = inner.max_sessions.max(inner.active_sessions);
    }

    /// A session request finished.
    pub fn session_closed(&self) {
        self.lock().active_sessions -= 1;
    }

    /// `n` payload bytes went out to a peer.
    pub fn on_packets_sent(&self, n: i64) {
        self.lock().packets_sent_ps.add(n);
    }

    /// `n` payload bytes arrived from a peer.
    pub fn on_packets_recv(&self, n: i64) {
        self.lock().packets_recv_ps.add(n);
    }

    /// Roll the per-second buckets.
    pub fn flush(&self) {
        let mut inner = self.lock();
        inner.connections_ps.flush();
        inner.packets_sent_ps.flush();
        inner.packets_recv_ps.flush();
    }

    /// Dump the current counters.
    #[must_use]
    pub fn dump(&self) -> StatsSnapshot {
        let inner = self.lock();
        StatsSnapshot {
            start_time: self.start_time,
            max_sessions: inner.max_sessions,
            active_sessions: inner.active_sessions,
            max_connections: inner.max_connections,
            active_connections: inner.active_connections,
            connections_ps: inner.connections_ps.last_average(),
            packets_sent_ps: inner.packets_sent_ps.last_average(),
            packets_recv_ps: inner.packets_recv_ps.last_average(),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().expect("stats lock poisoned")
    }
}

impl Default for StatsCollector {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn moving_average_over_window() {
        let mut avg = MovingAverage::new(2);
        avg.add(4);
        avg.flush();
        assert!((avg.last_average() - 4.0).abs() < f64::EPSILON);

        avg.add(8);
        avg.flush();
        assert!((avg.last_average() - 6.0).abs() < f64::EPSILON);

        // Window of two: the first bucket falls out.
        avg.add(10);
        avg.flush();
        assert!((avg.last_average() - 9.0).abs() < f64::EPSILON);
    }

    #[test]
    fn session_gauges_track_high_water_mark() {
        let stats = StatsCollector::new();
        stats.session_opened();
        stats.session_opened();
        stats.session_closed();
        stats.session_opened();

        let snapshot = stats.dump();
        assert_eq!(snapshot.active_sessions, 2);
        assert_eq!(snapshot.max_sessions, 2);
    }

    #[test]
    fn byte_counters_average_after_flush() {
        let stats = StatsCollector::new();
        stats.on_packets_sent(100);
        stats.on_packets_sent(50);
        stats.flush();

        let snapshot = stats.dump();
        assert!((snapshot.packets_sent_ps - 150.0).abs() < f64::EPSILON);
        assert!((snapshot.packets_recv_ps - 0.0).abs() < f64::EPSILON);
    }
}
