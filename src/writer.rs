use crate::config::WriteFailurePolicy;
use crate::error::Error;
use crate::frame::{FrameReceivers, OutboundFrame};
use crate::handler::ErrorReporter;
use crate::metrics::Metrics;
use futures_util::{Sink, SinkExt};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{timeout, Duration};
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

/// Upper bound on the best-effort close handshake of a retired sink
const SINK_CLOSE_TIMEOUT: Duration = Duration::from_secs(1);

/// A single frame write that makes no progress for this long is a write failure
pub(crate) const WRITE_TIMEOUT: Duration = Duration::from_secs(5);

/// Instructions from the reader, which owns transport replacement.
pub(crate) enum WriterCommand<S> {
    /// Start writing to a freshly connected transport
    Attach { sink: S, generation: u64 },
    /// Close and release the current sink; acknowledged once it is gone
    Detach { done: oneshot::Sender<()> },
}

/// A write failure reported back to the reader
#[derive(Debug, Clone)]
pub(crate) struct FailureSignal {
    pub(crate) generation: u64,
    pub(crate) error: String,
}

/// Channels connecting the writer to the reader and the dispatcher
pub(crate) struct WriterLinks<S> {
    pub(crate) commands: mpsc::Receiver<WriterCommand<S>>,
    pub(crate) failures: mpsc::Sender<FailureSignal>,
    pub(crate) errors: ErrorReporter,
}

/// The only task that writes to the transport.
///
/// Drains the four outbound queues with no priority between them; when
/// several are ready `select!` picks one at random, so none is starved.
/// Queues are only polled while a sink is attached, so frames enqueued during
/// a reconnect wait for the new transport.
pub(crate) struct FrameWriter<S> {
    receivers: FrameReceivers,
    commands: mpsc::Receiver<WriterCommand<S>>,
    failures: mpsc::Sender<FailureSignal>,
    errors: ErrorReporter,
    policy: WriteFailurePolicy,
    metrics: Arc<Metrics>,
    cancel: CancellationToken,
    label: String,
    sink: Option<S>,
    generation: u64,
}

enum Step<S> {
    Stop,
    Command(WriterCommand<S>),
    Write(OutboundFrame),
}

impl<S> FrameWriter<S>
where
    S: Sink<Message, Error = tungstenite::Error> + Unpin + Send,
{
    pub(crate) fn new(
        receivers: FrameReceivers,
        links: WriterLinks<S>,
        policy: WriteFailurePolicy,
        metrics: Arc<Metrics>,
        cancel: CancellationToken,
        label: String,
    ) -> Self {
        Self {
            receivers,
            commands: links.commands,
            failures: links.failures,
            errors: links.errors,
            policy,
            metrics,
            cancel,
            label,
            sink: None,
            generation: 0,
        }
    }

    pub(crate) async fn run(mut self) {
        loop {
            let attached = self.sink.is_some();
            let step = tokio::select! {
                _ = self.cancel.cancelled() => Step::Stop,
                command = self.commands.recv() => match command {
                    Some(command) => Step::Command(command),
                    None => Step::Stop,
                },
                Some(text) = self.receivers.text.recv(), if attached => {
                    Step::Write(OutboundFrame::Text(text))
                }
                Some(data) = self.receivers.ping.recv(), if attached => {
                    Step::Write(OutboundFrame::Ping(data))
                }
                Some(data) = self.receivers.pong.recv(), if attached => {
                    Step::Write(OutboundFrame::Pong(data))
                }
                Some(data) = self.receivers.close.recv(), if attached => {
                    Step::Write(OutboundFrame::Close(data))
                }
            };

            match step {
                Step::Stop => break,
                Step::Command(command) => self.apply(command).await,
                Step::Write(frame) => self.write(frame).await,
            }
        }

        self.retire_sink().await;
        self.receivers.close();
        debug!("[{}] Writer stopped", self.label);
    }

    async fn apply(&mut self, command: WriterCommand<S>) {
        match command {
            WriterCommand::Attach { sink, generation } => {
                self.retire_sink().await;
                self.sink = Some(sink);
                self.generation = generation;
                debug!("[{}] Writer attached to generation {}", self.label, generation);
            }
            WriterCommand::Detach { done } => {
                self.retire_sink().await;
                let _ = done.send(());
            }
        }
    }

    async fn write(&mut self, frame: OutboundFrame) {
        let Some(sink) = self.sink.as_mut() else {
            return;
        };

        let tag = frame.tag();
        let is_close = matches!(frame, OutboundFrame::Close(_));
        let result = tokio::select! {
            _ = self.cancel.cancelled() => return,
            sent = timeout(WRITE_TIMEOUT, sink.send(frame.into_message())) => match sent {
                Ok(result) => result.map_err(|e| e.to_string()),
                Err(_) => Err(format!("no progress within {:?}", WRITE_TIMEOUT)),
            },
        };

        match result {
            Ok(()) => {
                self.metrics.record_message_sent();
                match tag {
                    "ping" => self.metrics.record_ping(),
                    "pong" => self.metrics.record_pong_sent(),
                    _ => {}
                }
                trace!("[{}] Sent {} frame", self.label, tag);

                if is_close {
                    // Nothing may follow a close frame on this transport
                    info!("[{}] Close frame sent", self.label);
                    self.sink = None;
                }
            }
            Err(cause) => {
                self.metrics.record_write_error();
                warn!("[{}] Failed to send {} frame: {}", self.label, tag, cause);
                self.errors
                    .report(Error::Write(format!("{} frame: {}", tag, cause)));

                if self.policy == WriteFailurePolicy::Reconnect {
                    self.sink = None;
                    let signal = FailureSignal {
                        generation: self.generation,
                        error: cause,
                    };
                    // A full channel already holds a pending failure
                    let _ = self.failures.try_send(signal);
                }
            }
        }
    }

    async fn retire_sink(&mut self) {
        if let Some(mut sink) = self.sink.take() {
            match timeout(SINK_CLOSE_TIMEOUT, sink.close()).await {
                Ok(Ok(())) => trace!("[{}] Sink closed", self.label),
                Ok(Err(e)) => trace!("[{}] Sink close failed: {}", self.label, e),
                Err(_) => trace!("[{}] Sink close timed out", self.label),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::frame::{frame_queues, FrameQueues};
    use crate::handler::Dispatch;
    use futures_util::stream::{SplitSink, StreamExt};
    use std::pin::Pin;
    use std::task::{Context, Poll};
    use tokio::io::DuplexStream;
    use tokio_tungstenite::tungstenite::protocol::Role;
    use tokio_tungstenite::WebSocketStream;

    type TestSink = SplitSink<WebSocketStream<DuplexStream>, Message>;

    async fn ws_pair() -> (WebSocketStream<DuplexStream>, WebSocketStream<DuplexStream>) {
        let (client, server) = tokio::io::duplex(64 * 1024);
        (
            WebSocketStream::from_raw_socket(client, Role::Client, None).await,
            WebSocketStream::from_raw_socket(server, Role::Server, None).await,
        )
    }

    /// A sink whose peer stopped reading: it never accepts another frame.
    struct StalledSink;

    impl Sink<Message> for StalledSink {
        type Error = tungstenite::Error;

        fn poll_ready(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
            Poll::Pending
        }

        fn start_send(self: Pin<&mut Self>, _item: Message) -> Result<(), Self::Error> {
            Ok(())
        }

        fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
            Poll::Pending
        }

        fn poll_close(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
            Poll::Ready(Ok(()))
        }
    }

    struct Harness<S> {
        queues: FrameQueues,
        commands: mpsc::Sender<WriterCommand<S>>,
        failures: mpsc::Receiver<FailureSignal>,
        errors: mpsc::Receiver<Dispatch>,
        metrics: Arc<Metrics>,
        cancel: CancellationToken,
        task: tokio::task::JoinHandle<()>,
    }

    fn spawn_writer(policy: WriteFailurePolicy) -> Harness<TestSink> {
        spawn_writer_for(policy)
    }

    fn spawn_writer_for<S>(policy: WriteFailurePolicy) -> Harness<S>
    where
        S: Sink<Message, Error = tungstenite::Error> + Unpin + Send + 'static,
    {
        let (queues, receivers) = frame_queues(8);
        let (command_tx, command_rx) = mpsc::channel(4);
        let (failure_tx, failure_rx) = mpsc::channel(4);
        let (error_tx, error_rx) = mpsc::channel(4);
        let metrics = Arc::new(Metrics::new());
        let cancel = CancellationToken::new();

        let writer = FrameWriter::new(
            receivers,
            WriterLinks {
                commands: command_rx,
                failures: failure_tx,
                errors: ErrorReporter::new(error_tx, "writer".into()),
            },
            policy,
            metrics.clone(),
            cancel.clone(),
            "writer".into(),
        );
        Harness {
            queues,
            commands: command_tx,
            failures: failure_rx,
            errors: error_rx,
            metrics,
            cancel,
            task: tokio::spawn(writer.run()),
        }
    }

    fn expect_write_error(item: Option<Dispatch>) -> String {
        match item {
            Some(Dispatch::Error(error)) => {
                assert_eq!(error.kind(), ErrorKind::Write);
                error.to_string()
            }
            other => panic!("expected a write error report, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_text_frames_written_in_order() {
        let harness = spawn_writer(WriteFailurePolicy::Reconnect);
        let (client, mut server) = ws_pair().await;
        let (sink, _source) = client.split();
        harness
            .commands
            .send(WriterCommand::Attach { sink, generation: 1 })
            .await
            .unwrap();

        for text in ["a", "b", "c"] {
            harness.queues.enqueue(OutboundFrame::Text(text.into())).await.unwrap();
        }

        for expected in ["a", "b", "c"] {
            let msg = server.next().await.unwrap().unwrap();
            assert_eq!(msg, Message::Text(expected.into()));
        }
        assert_eq!(harness.metrics.messages_sent(), 3);

        harness.cancel.cancel();
        harness.task.await.unwrap();
    }

    #[tokio::test]
    async fn test_frames_wait_for_attach() {
        let harness = spawn_writer(WriteFailurePolicy::Reconnect);
        harness.queues.enqueue(OutboundFrame::Ping(b"early".to_vec())).await.unwrap();
        tokio::task::yield_now().await;
        assert_eq!(harness.metrics.messages_sent(), 0);

        let (client, mut server) = ws_pair().await;
        let (sink, _source) = client.split();
        harness
            .commands
            .send(WriterCommand::Attach { sink, generation: 1 })
            .await
            .unwrap();

        let msg = server.next().await.unwrap().unwrap();
        assert_eq!(msg, Message::Ping(b"early".to_vec()));
        assert_eq!(harness.metrics.pings_sent(), 1);

        harness.cancel.cancel();
        harness.task.await.unwrap();
    }

    #[tokio::test]
    async fn test_write_failure_signals_reconnect() {
        let mut harness = spawn_writer(WriteFailurePolicy::Reconnect);
        let (client, server) = ws_pair().await;
        let (sink, _source) = client.split();
        harness
            .commands
            .send(WriterCommand::Attach { sink, generation: 7 })
            .await
            .unwrap();
        drop(server);

        harness.queues.enqueue(OutboundFrame::Text("lost".into())).await.unwrap();

        let signal = harness.failures.recv().await.unwrap();
        assert_eq!(signal.generation, 7);
        assert_eq!(harness.metrics.write_errors(), 1);

        let reported = expect_write_error(harness.errors.recv().await);
        assert!(reported.starts_with("Write failed: text frame"));

        harness.cancel.cancel();
        harness.task.await.unwrap();
    }

    #[tokio::test]
    async fn test_write_failure_logged_and_continued() {
        let mut harness = spawn_writer(WriteFailurePolicy::LogAndContinue);
        let (client, server) = ws_pair().await;
        let (sink, _source) = client.split();
        harness
            .commands
            .send(WriterCommand::Attach { sink, generation: 1 })
            .await
            .unwrap();
        drop(server);

        harness.queues.enqueue(OutboundFrame::Text("one".into())).await.unwrap();
        harness.queues.enqueue(OutboundFrame::Text("two".into())).await.unwrap();

        while harness.metrics.write_errors() < 2 {
            tokio::task::yield_now().await;
        }
        assert!(harness.failures.try_recv().is_err());
        assert!(!harness.task.is_finished());

        // Each failure still reaches the handler
        expect_write_error(harness.errors.recv().await);
        expect_write_error(harness.errors.recv().await);

        harness.cancel.cancel();
        harness.task.await.unwrap();
    }

    #[tokio::test]
    async fn test_detach_closes_sink() {
        let harness = spawn_writer(WriteFailurePolicy::Reconnect);
        let (client, mut server) = ws_pair().await;
        let (sink, _source) = client.split();
        harness
            .commands
            .send(WriterCommand::Attach { sink, generation: 1 })
            .await
            .unwrap();

        let (done_tx, done_rx) = oneshot::channel();
        harness
            .commands
            .send(WriterCommand::Detach { done: done_tx })
            .await
            .unwrap();
        done_rx.await.unwrap();

        // The peer sees the close handshake
        assert!(matches!(server.next().await, Some(Ok(Message::Close(_)))));

        harness.cancel.cancel();
        harness.task.await.unwrap();
    }

    #[tokio::test]
    async fn test_cancel_closes_queues() {
        let harness = spawn_writer(WriteFailurePolicy::Reconnect);
        harness.cancel.cancel();
        harness.task.await.unwrap();

        assert!(harness
            .queues
            .enqueue(OutboundFrame::Text("late".into()))
            .await
            .is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stalled_write_times_out() {
        let mut harness = spawn_writer_for::<StalledSink>(WriteFailurePolicy::Reconnect);
        harness
            .commands
            .send(WriterCommand::Attach {
                sink: StalledSink,
                generation: 3,
            })
            .await
            .unwrap();

        let started = tokio::time::Instant::now();
        harness.queues.enqueue(OutboundFrame::Text("stuck".into())).await.unwrap();

        let signal = harness.failures.recv().await.unwrap();
        assert_eq!(signal.generation, 3);
        assert!(signal.error.contains("no progress"));
        assert!(started.elapsed() >= WRITE_TIMEOUT);
        assert_eq!(harness.metrics.write_errors(), 1);
        assert_eq!(harness.metrics.messages_sent(), 0);
        expect_write_error(harness.errors.recv().await);

        // The writer let go of the stalled sink, so a detach completes at once
        let (done_tx, done_rx) = oneshot::channel();
        harness
            .commands
            .send(WriterCommand::Detach { done: done_tx })
            .await
            .unwrap();
        done_rx.await.unwrap();

        harness.cancel.cancel();
        harness.task.await.unwrap();
    }
}
