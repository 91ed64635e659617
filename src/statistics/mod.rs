//! Per-stream traffic counters.
//!
//! Counters are atomics updated by whichever side owns the number (read
//! task for receive counts, lane jobs for send counts), snapshotted lock-free
//! for reporting.

use {
    chrono::{DateTime, Local},
    serde::Serialize,
    std::sync::atomic::{AtomicU64, Ordering},
    crate::media::MediaKind,
};

#[derive(Debug)]
pub struct StreamStatistics {
    start_time: DateTime<Local>,
    recv_bytes: AtomicU64,
    send_bytes: AtomicU64,
    audio_samples: AtomicU64,
    video_samples: AtomicU64,
    data_samples: AtomicU64,
    rejected_writes: AtomicU64,
}

impl Default for StreamStatistics {
    fn default() -> Self {
        Self::new()
    }
}

impl StreamStatistics {
    #[must_use]
    pub fn new() -> Self {
        Self {
            start_time: Local::now(),
            recv_bytes: AtomicU64::new(0),
            send_bytes: AtomicU64::new(0),
            audio_samples: AtomicU64::new(0),
            video_samples: AtomicU64::new(0),
            data_samples: AtomicU64::new(0),
            rejected_writes: AtomicU64::new(0),
        }
    }

    pub fn add_recv_bytes(&self, n: u64) {
        self.recv_bytes.fetch_add(n, Ordering::Relaxed);
    }

    pub fn add_send_bytes(&self, n: u64) {
        self.send_bytes.fetch_add(n, Ordering::Relaxed);
    }

    pub fn count_sample(&self, kind: MediaKind) {
        let counter = match kind {
            MediaKind::Audio => &self.audio_samples,
            MediaKind::Video => &self.video_samples,
            MediaKind::Data => &self.data_samples,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn count_rejected_write(&self) {
        self.rejected_writes.fetch_add(1, Ordering::Relaxed);
    }

    #[must_use]
    pub fn snapshot(&self) -> StatisticsSnapshot {
        StatisticsSnapshot {
            start_time: self.start_time,
            recv_bytes: self.recv_bytes.load(Ordering::Relaxed),
            send_bytes: self.send_bytes.load(Ordering::Relaxed),
            audio_samples: self.audio_samples.load(Ordering::Relaxed),
            video_samples: self.video_samples.load(Ordering::Relaxed),
            data_samples: self.data_samples.load(Ordering::Relaxed),
            rejected_writes: self.rejected_writes.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct StatisticsSnapshot {
    pub start_time: DateTime<Local>,
    pub recv_bytes: u64,
    pub send_bytes: u64,
    pub audio_samples: u64,
    pub video_samples: u64,
    pub data_samples: u64,
    pub rejected_writes: u64,
}

impl StatisticsSnapshot {
    #[must_use]
    pub fn json(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }
}
