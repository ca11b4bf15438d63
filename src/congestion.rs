use crate::messages::ClientAck;
use std::cmp::{max, min};
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::{interval, Duration};
use tracing::{debug, trace};

const INITIAL_RATE: u32 = 1000;
const RATE_FLOOR: u32 = 1;
const ADDITIVE_INCREMENT: u32 = 10;

/// Send permits are granted in 100ms slices of the current rate rather than
///  one ticker wakeup per packet, which keeps the ticker cheap at high rates.
const TICK: Duration = Duration::from_millis(100);
const TICKS_PER_SECOND: u32 = 10;

#[derive(Debug)]
struct RateInner {
    /// congestion-controlled send rate in packets per second
    cong_rate: u32,
    /// send permits remaining in the current tick window
    available: u32,
}

/// Additive-increase / multiplicative-decrease pacing governor for one
///  session's outgoing packets.
///
/// Acks that show plain progress grow the rate linearly; acks carrying resend
///  entries (the peer is missing data) halve it. A `maxTransmissionRate`
///  advertised by the peer acts as a ceiling the rate converges under but
///  never exceeds.
pub struct AimdRateController {
    inner: Arc<Mutex<RateInner>>,
    replenished: Arc<Notify>,
    ticker: Mutex<Option<JoinHandle<()>>>,
}

impl Drop for AimdRateController {
    fn drop(&mut self) {
        self.stop();
    }
}

impl AimdRateController {
    pub fn new() -> AimdRateController {
        Self::with_rate(INITIAL_RATE)
    }

    pub fn with_rate(cong_rate: u32) -> AimdRateController {
        let cong_rate = max(cong_rate, RATE_FLOOR);
        AimdRateController {
            inner: Arc::new(Mutex::new(RateInner {
                cong_rate,
                available: max(1, cong_rate / TICKS_PER_SECOND),
            })),
            replenished: Arc::new(Notify::new()),
            ticker: Mutex::new(None),
        }
    }

    /// Start replenishing send permits. Idempotent.
    pub fn start(&self) {
        let mut ticker = self.ticker.lock().unwrap();
        if ticker.is_some() {
            return;
        }

        let inner = self.inner.clone();
        let replenished = self.replenished.clone();
        *ticker = Some(tokio::spawn(async move {
            let mut tick = interval(TICK);
            loop {
                tick.tick().await;
                {
                    let mut inner = inner.lock().unwrap();
                    inner.available = max(1, inner.cong_rate / TICKS_PER_SECOND);
                }
                replenished.notify_waiters();
            }
        }));
    }

    pub fn stop(&self) {
        if let Some(handle) = self.ticker.lock().unwrap().take() {
            handle.abort();
        }
    }

    pub fn rate(&self) -> u32 {
        self.inner.lock().unwrap().cong_rate
    }

    /// Consume one send permit.
    pub fn on_send(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.available = inner.available.saturating_sub(1);
    }

    pub fn is_available(&self) -> bool {
        self.inner.lock().unwrap().available > 0
    }

    /// Resolves once a send permit is available, possibly immediately.
    pub async fn await_available(&self) {
        loop {
            let notified = self.replenished.notified();
            if self.is_available() {
                return;
            }
            notified.await;
        }
    }

    /// Fold one ack into the rate: halve on resend entries or when the peer
    ///  advertises a lower rate than we are running at, grow additively
    ///  otherwise. Never below the floor, never above an advertised rate.
    pub fn on_ack(&self, ack: &ClientAck) {
        let mut inner = self.inner.lock().unwrap();

        let advertised = ack.max_transmission_rate;
        let congested = !ack.resend_entries.is_empty()
            || (advertised > 0 && advertised < inner.cong_rate);

        if congested {
            inner.cong_rate = max(RATE_FLOOR, inner.cong_rate / 2);
            debug!(
                "congestion signal ({} resend entries, advertised rate {}) - rate down to {} pps",
                ack.resend_entries.len(),
                advertised,
                inner.cong_rate
            );
        } else {
            inner.cong_rate += ADDITIVE_INCREMENT;
            trace!("progress ack - rate up to {} pps", inner.cong_rate);
        }

        if advertised > 0 {
            inner.cong_rate = max(RATE_FLOOR, min(inner.cong_rate, advertised));
        }
    }

    #[cfg(test)]
    fn set_internals(&self, cong_rate: u32, available: u32) {
        let mut inner = self.inner.lock().unwrap();
        inner.cong_rate = cong_rate;
        inner.available = available;
    }
}

impl Default for AimdRateController {
    fn default() -> Self {
        Self::new()
    }
}
