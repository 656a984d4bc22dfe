use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Mutex;

/// Byte counters and last-error bookkeeping for the HTTP client, surfaced so
/// an operator can see adaptive chunking behave: chunk halving shows up as a
/// drop in send throughput rather than as a counter of its own.
#[derive(Default)]
pub struct HttpStats {
    bytes_sent: AtomicI64,
    bytes_recv: AtomicI64,
    last_error: Mutex<Option<String>>,
}

impl HttpStats {
    pub fn on_send(&self, n: i64) {
        if n <= 0 {
            return;
        }
        self.bytes_sent.fetch_add(n, Ordering::Relaxed);
    }

    pub fn on_recv(&self, n: i64) {
        if n <= 0 {
            return;
        }
        self.bytes_recv.fetch_add(n, Ordering::Relaxed);
    }

    pub fn set_last_error(&self, err: impl ToString) {
        let mut g = self.last_error.lock().unwrap();
        *g = Some(err.to_string());
    }

    pub fn snapshot(&self) -> HttpStatsSnapshot {
        let last_error = self.last_error.lock().unwrap().clone().unwrap_or_default();
        HttpStatsSnapshot {
            bytes_sent_total: self.bytes_sent.load(Ordering::Relaxed),
            bytes_recv_total: self.bytes_recv.load(Ordering::Relaxed),
            last_error,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HttpStatsSnapshot {
    pub bytes_sent_total: i64,
    pub bytes_recv_total: i64,
    pub last_error: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_accumulate_and_ignore_non_positive() {
        let stats = HttpStats::default();
        stats.on_send(100);
        stats.on_send(0);
        stats.on_send(-5);
        stats.on_recv(40);
        let snap = stats.snapshot();
        assert_eq!(snap.bytes_sent_total, 100);
        assert_eq!(snap.bytes_recv_total, 40);
        assert_eq!(snap.last_error, "");
    }

    #[test]
    fn last_error_is_recorded() {
        let stats = HttpStats::default();
        stats.set_last_error("connection reset");
        assert_eq!(stats.snapshot().last_error, "connection reset");
    }
}
