use crate::frame::{FrameQueues, OutboundFrame, TryEnqueueError};
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::time::{interval_at, Duration, Instant, Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

/// Manufactures outbound liveness traffic on fixed tickers.
///
/// Pings carry the current unix time in milliseconds. The optional pong
/// ticker serves exchanges that expect unsolicited pongs as keep-alives.
/// Probes are enqueued without waiting: a full queue skips the tick.
pub(crate) struct HeartbeatScheduler {
    ping_interval: Option<Duration>,
    pong_interval: Option<Duration>,
    queues: FrameQueues,
    cancel: CancellationToken,
    label: String,
}

impl HeartbeatScheduler {
    /// A zero or missing interval disables that ticker.
    pub(crate) fn new(
        ping_interval: Option<Duration>,
        pong_interval: Option<Duration>,
        queues: FrameQueues,
        cancel: CancellationToken,
        label: String,
    ) -> Self {
        Self {
            ping_interval: ping_interval.filter(|d| !d.is_zero()),
            pong_interval: pong_interval.filter(|d| !d.is_zero()),
            queues,
            cancel,
            label,
        }
    }

    pub(crate) async fn run(self) {
        let mut ping_ticker = self.ping_interval.map(ticker);
        let mut pong_ticker = self.pong_interval.map(ticker);

        if ping_ticker.is_none() && pong_ticker.is_none() {
            debug!("[{}] Heartbeat disabled", self.label);
        }

        loop {
            let probe = tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = tick(&mut ping_ticker) => OutboundFrame::Ping(unix_millis().into_bytes()),
                _ = tick(&mut pong_ticker) => OutboundFrame::Pong(unix_millis().into_bytes()),
            };

            let tag = probe.tag();
            match self.queues.try_enqueue(probe) {
                Ok(()) => trace!("[{}] Heartbeat {} queued", self.label, tag),
                Err(TryEnqueueError::Full) => {
                    debug!("[{}] {} queue full, skipping heartbeat", self.label, tag)
                }
                Err(TryEnqueueError::Closed) => break,
            }
        }

        debug!("[{}] Heartbeat stopped", self.label);
    }
}

fn ticker(period: Duration) -> Interval {
    let mut interval = interval_at(Instant::now() + period, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    interval
}

/// Wait for the next tick; a disabled ticker never fires.
async fn tick(ticker: &mut Option<Interval>) {
    match ticker {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}

fn unix_millis() -> String {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or_default()
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{frame_queues, FrameReceivers};

    fn drain(rx: &mut FrameReceivers) -> (usize, usize) {
        let mut pings = 0;
        while rx.ping.try_recv().is_ok() {
            pings += 1;
        }
        let mut pongs = 0;
        while rx.pong.try_recv().is_ok() {
            pongs += 1;
        }
        (pings, pongs)
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_interval_never_pings() {
        let (queues, mut rx) = frame_queues(32);
        let cancel = CancellationToken::new();
        let scheduler =
            HeartbeatScheduler::new(Some(Duration::ZERO), None, queues, cancel.clone(), "hb".into());
        let task = tokio::spawn(scheduler.run());

        tokio::time::sleep(Duration::from_secs(600)).await;
        assert_eq!(drain(&mut rx), (0, 0));

        cancel.cancel();
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_pings_on_every_interval() {
        let (queues, mut rx) = frame_queues(32);
        let cancel = CancellationToken::new();
        let scheduler = HeartbeatScheduler::new(
            Some(Duration::from_secs(1)),
            None,
            queues,
            cancel.clone(),
            "hb".into(),
        );
        let task = tokio::spawn(scheduler.run());

        // First tick is one full interval after start
        tokio::time::sleep(Duration::from_millis(3500)).await;
        assert_eq!(drain(&mut rx), (3, 0));

        cancel.cancel();
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_ping_payload_is_unix_millis() {
        let (queues, mut rx) = frame_queues(4);
        let cancel = CancellationToken::new();
        let scheduler = HeartbeatScheduler::new(
            Some(Duration::from_secs(1)),
            None,
            queues,
            cancel.clone(),
            "hb".into(),
        );
        let task = tokio::spawn(scheduler.run());

        let payload = rx.ping.recv().await.unwrap();
        let millis: u128 = String::from_utf8(payload).unwrap().parse().unwrap();
        assert!(millis > 0);

        cancel.cancel();
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_pong_keepalive_runs_alongside_pings() {
        let (queues, mut rx) = frame_queues(32);
        let cancel = CancellationToken::new();
        let scheduler = HeartbeatScheduler::new(
            Some(Duration::from_secs(2)),
            Some(Duration::from_secs(1)),
            queues,
            cancel.clone(),
            "hb".into(),
        );
        let task = tokio::spawn(scheduler.run());

        tokio::time::sleep(Duration::from_millis(4500)).await;
        assert_eq!(drain(&mut rx), (2, 4));

        cancel.cancel();
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_full_queue_skips_ticks() {
        let (queues, mut rx) = frame_queues(1);
        let cancel = CancellationToken::new();
        let scheduler = HeartbeatScheduler::new(
            Some(Duration::from_secs(1)),
            None,
            queues,
            cancel.clone(),
            "hb".into(),
        );
        let task = tokio::spawn(scheduler.run());

        tokio::time::sleep(Duration::from_millis(5500)).await;
        assert_eq!(drain(&mut rx), (1, 0));

        cancel.cancel();
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_stops_when_queues_closed() {
        let (queues, rx) = frame_queues(4);
        rx.close();
        let scheduler = HeartbeatScheduler::new(
            Some(Duration::from_secs(1)),
            None,
            queues,
            CancellationToken::new(),
            "hb".into(),
        );

        // Returns on the first tick instead of running forever
        scheduler.run().await;
    }
}
