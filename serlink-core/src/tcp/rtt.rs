//! Round-trip time estimation and the retransmission timeout (RFC 6298).

use std::time::Duration;

/// Lower clamp on the RTO.
const MIN_RTO: Duration = Duration::from_secs(1);
/// Upper clamp on the RTO, also the backoff ceiling.
const MAX_RTO: Duration = Duration::from_secs(60);
/// Floor on the variance term, standing in for clock granularity.
const MIN_VARIANCE: Duration = Duration::from_millis(100);

/// Smoothed RTT state for one connection.
#[derive(Debug, Clone)]
pub struct RttEstimator {
    srtt: Duration,
    rttvar: Duration,
    rto: Duration,
    has_sample: bool,
}

impl RttEstimator {
    pub fn new() -> Self {
        Self {
            srtt: Duration::ZERO,
            rttvar: Duration::ZERO,
            rto: MIN_RTO,
            has_sample: false,
        }
    }

    /// Fold in a fresh sample. Only segments transmitted exactly once may
    /// produce samples (Karn's rule); enforcing that is the caller's job.
    pub fn update(&mut self, sample: Duration) {
        if self.has_sample {
            // RFC 6298 section 2: beta = 1/4, alpha = 1/8.
            let deviation = if self.srtt > sample {
                self.srtt - sample
            } else {
                sample - self.srtt
            };
            self.rttvar = (self.rttvar * 3 + deviation) / 4;
            self.srtt = (self.srtt * 7 + sample) / 8;
        } else {
            self.srtt = sample;
            self.rttvar = sample / 2;
            self.has_sample = true;
        }
        self.rto = (self.srtt + (self.rttvar * 4).max(MIN_VARIANCE)).clamp(MIN_RTO, MAX_RTO);
    }

    pub fn rto(&self) -> Duration {
        self.rto
    }

    /// Exponential backoff after a retransmission timeout.
    pub fn backoff(&mut self) {
        self.rto = (self.rto * 2).min(MAX_RTO);
    }
}

impl Default for RttEstimator {
    fn default() -> Self {
        Self::new()
    }
}
