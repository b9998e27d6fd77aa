use tokio::time::{Duration, Instant};

/// Sliding read deadline for a single transport.
///
/// Every inbound frame (data, ping, pong) pushes the deadline out by the
/// configured window. The reader treats reaching the deadline as a read failure.
#[derive(Debug)]
pub(crate) struct Liveness {
    window: Duration,
    deadline: Instant,
    last_inbound: Option<Instant>,
}

impl Liveness {
    /// Start a window now (called right after the handshake)
    pub(crate) fn new(window: Duration) -> Self {
        Self {
            window,
            deadline: Instant::now() + window,
            last_inbound: None,
        }
    }

    /// Record inbound traffic and extend the deadline
    pub(crate) fn extend(&mut self) {
        let now = Instant::now();
        self.last_inbound = Some(now);
        self.deadline = now + self.window;
    }

    /// Current deadline
    pub(crate) fn deadline(&self) -> Instant {
        self.deadline
    }

    /// Time since the last inbound frame, if any
    pub(crate) fn since_last_inbound(&self) -> Option<Duration> {
        self.last_inbound.map(|t| t.elapsed())
    }

    pub(crate) fn window(&self) -> Duration {
        self.window
    }
}
