// SPDX-License-Identifier: AGPL-3.0-only

//! Shared helpers for the latency benchmarks.

use std::time::Duration;

/// Sorted latency samples.
#[derive(Debug, Clone)]
pub struct Latencies {
    sorted_us: Vec<f64>,
}

impl Latencies {
    /// Collect samples; `None` if there are none.
    pub fn new(samples: &[Duration]) -> Option<Self> {
        if samples.is_empty() {
            return None;
        }
        let mut sorted_us: Vec<f64> = samples.iter().map(|d| d.as_secs_f64() * 1e6).collect();
        sorted_us.sort_by(f64::total_cmp);
        Some(Self { sorted_us })
    }

    /// Mean in microseconds.
    #[allow(clippy::cast_precision_loss)]
    pub fn mean(&self) -> f64 {
        self.sorted_us.iter().sum::<f64>() / self.sorted_us.len() as f64
    }

    /// Nearest-rank percentile, `p` in 0..=100.
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss, clippy::cast_precision_loss)]
    pub fn percentile(&self, p: f64) -> f64 {
        let last = self.sorted_us.len() - 1;
        let rank = ((p / 100.0) * last as f64).round() as usize;
        self.sorted_us[rank.min(last)]
    }

    /// Print the usual summary block.
    pub fn print(&self, title: &str) {
        println!("{title}");
        println!("{}", "-".repeat(title.len()));
        println!("  mean : {:.1} µs", self.mean());
        println!("  min  : {:.1} µs", self.percentile(0.0));
        println!("  p50  : {:.1} µs", self.percentile(50.0));
        println!("  p95  : {:.1} µs", self.percentile(95.0));
        println!("  p99  : {:.1} µs", self.percentile(99.0));
        println!("  max  : {:.1} µs", self.percentile(100.0));
        println!();
    }
}

/// `--flag value` lookup with a default.
pub fn parse_arg<T: std::str::FromStr>(args: &[String], flag: &str, default: T) -> T {
    args.windows(2)
        .find(|w| w[0] == flag)
        .and_then(|w| w[1].parse().ok())
        .unwrap_or(default)
}
