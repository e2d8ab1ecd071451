/// Returns the monotonic clock in nanoseconds.
///
/// Reads `CLOCK_MONOTONIC` directly; unlike `std::time::Instant` the raw
/// u64 can be stored in a pipe payload and subtracted on another thread.
#[cfg(unix)]
#[inline(never)]
pub fn mono_time_ns() -> u64 {
    use libc::{CLOCK_MONOTONIC, clock_gettime, timespec};
    unsafe {
        let mut ts = timespec {
            tv_sec: 0,
            tv_nsec: 0,
        };
        clock_gettime(CLOCK_MONOTONIC, &mut ts);
        (ts.tv_sec as u64) * 1_000_000_000 + (ts.tv_nsec as u64)
    }
}

/// Fixed-capacity recorder for nanosecond latency samples.
///
/// Recording never allocates once constructed; samples past the capacity
/// are dropped so a hot loop cannot stall on a `Vec` growth. Call
/// [`sort`](Samples::sort) once recording is finished, then read the
/// order statistics.
pub struct Samples {
    samples: Vec<u64>,
    dropped: usize,
}

impl Samples {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            samples: Vec::with_capacity(capacity),
            dropped: 0,
        }
    }

    /// Records one sample, or counts it as dropped when full.
    #[inline(always)]
    pub fn record(&mut self, nanos: u64) {
        if self.samples.len() < self.samples.capacity() {
            self.samples.push(nanos);
        } else {
            self.dropped += 1;
        }
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn sort(&mut self) {
        self.samples.sort_unstable();
    }

    /// The `p`-quantile by nearest-rank, `0.0 <= p <= 1.0`.
    ///
    /// Requires a prior [`sort`](Samples::sort) and at least one sample.
    pub fn percentile(&self, p: f64) -> u64 {
        let n = self.samples.len();
        assert!(n > 0);
        assert!((0.0..=1.0).contains(&p));
        let idx = ((n - 1) as f64 * p).round() as usize;
        self.samples[idx]
    }

    /// One-line order-statistics summary, suitable for `println!`.
    pub fn summary(&self, label: &str) -> String {
        format!(
            "{}: n={} dropped={} min={} p50={} p90={} p99={} p99.9={} max={}",
            label,
            self.len(),
            self.dropped,
            self.percentile(0.0),
            self.percentile(0.5),
            self.percentile(0.9),
            self.percentile(0.99),
            self.percentile(0.999),
            self.percentile(1.0),
        )
    }
}
