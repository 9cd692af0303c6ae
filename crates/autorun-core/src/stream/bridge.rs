use std::pin::Pin;
use std::time::Duration;

use futures::Stream;
use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use autorun_types::{now_ms, StreamEvent};

use super::{Coalescer, StepSequence, StopCheck};
use crate::config::StreamConfig;
use crate::pulse::PulseSink;

pub type EventStream = Pin<Box<dyn Stream<Item = StreamEvent> + Send>>;

enum WorkerMessage {
    Item(StreamEvent),
    Finished,
    Failed(String),
}

enum Wake {
    Message(Option<WorkerMessage>),
    Pulse(String),
    Flush,
    Tick,
}

struct CancelOnDrop(CancellationToken);

impl Drop for CancelOnDrop {
    fn drop(&mut self) {
        self.0.cancel();
    }
}

/// Drains `sequence` on a worker task and delivers its events as a stream.
///
/// The consumer side ticks on its own schedule to enforce the idle timeout,
/// emit heartbeats and poll `stop`. Dropping the stream, or cancelling
/// `cancel`, stops the worker and closes the sequence.
pub fn bridge<S>(
    mut sequence: S,
    config: StreamConfig,
    stop: Option<StopCheck>,
    cancel: CancellationToken,
) -> EventStream
where
    S: StepSequence + 'static,
{
    let (pulse, mut pulse_rx) = PulseSink::channel();
    sequence.bind_pulse(pulse);
    let (tx, mut rx) = mpsc::channel::<WorkerMessage>(64);

    let worker_cancel = cancel.clone();
    let worker = tokio::spawn(async move {
        loop {
            let next = tokio::select! {
                biased;
                _ = worker_cancel.cancelled() => break,
                next = sequence.next_event() => next,
            };
            let message = match next {
                Some(Ok(event)) => WorkerMessage::Item(event),
                Some(Err(err)) => WorkerMessage::Failed(err.to_string()),
                None => WorkerMessage::Finished,
            };
            let last = !matches!(message, WorkerMessage::Item(_));
            if tx.send(message).await.is_err() || last {
                break;
            }
        }
        sequence.close().await;
    });

    let tick = Duration::from_millis(config.tick_ms.max(1));
    let idle_timeout = Duration::from_millis(config.idle_timeout_ms);
    let heartbeat = Duration::from_millis(config.heartbeat_ms);
    let close_grace = Duration::from_millis(config.close_grace_ms);
    let coalesce = Duration::from_millis(config.coalesce_ms);

    Box::pin(async_stream::stream! {
        let _guard = CancelOnDrop(cancel.clone());
        let mut coalescer = Coalescer::new(coalesce);
        let mut ticker = tokio::time::interval(tick);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut last_item = Instant::now();
        let mut last_sent = Instant::now();

        loop {
            let flush_at = coalescer.deadline();
            let wake = tokio::select! {
                biased;
                message = rx.recv() => Wake::Message(message),
                Some(label) = pulse_rx.recv() => Wake::Pulse(label),
                _ = sleep_until(flush_at), if flush_at.is_some() => Wake::Flush,
                _ = ticker.tick() => Wake::Tick,
            };

            match wake {
                Wake::Message(Some(WorkerMessage::Item(event))) => {
                    let now = Instant::now();
                    last_item = now;
                    for event in coalescer.push(event, now) {
                        last_sent = Instant::now();
                        yield event;
                    }
                }
                Wake::Message(Some(WorkerMessage::Finished)) => {
                    for event in coalescer.flush() {
                        yield event;
                    }
                    break;
                }
                Wake::Message(Some(WorkerMessage::Failed(message))) => {
                    for event in coalescer.flush() {
                        yield event;
                    }
                    tracing::warn!(error = %message, "step sequence failed");
                    yield StreamEvent::Error { message };
                    break;
                }
                Wake::Message(None) => {
                    // The worker dropped its sender without a final message.
                    for event in coalescer.flush() {
                        yield event;
                    }
                    tracing::error!("stream worker exited without completing");
                    yield StreamEvent::Error {
                        message: "worker exited without completing".to_string(),
                    };
                    break;
                }
                Wake::Pulse(label) => {
                    tracing::debug!(pulse = %label, "stream pulse");
                    last_item = Instant::now();
                    last_sent = last_item;
                    yield StreamEvent::Heartbeat { ts_ms: now_ms() };
                }
                Wake::Flush => {
                    for event in coalescer.flush() {
                        last_sent = Instant::now();
                        yield event;
                    }
                }
                Wake::Tick => {
                    if stop.as_ref().map(|check| check()).unwrap_or(false) {
                        for event in coalescer.flush() {
                            yield event;
                        }
                        tracing::info!("stream stopped by external stop check");
                        yield StreamEvent::Error {
                            message: "run stopped by request".to_string(),
                        };
                        break;
                    }
                    if last_item.elapsed() >= idle_timeout {
                        tracing::warn!(
                            idle_ms = last_item.elapsed().as_millis() as u64,
                            "stream idle timeout"
                        );
                        yield StreamEvent::Error {
                            message: format!(
                                "no progress for {} ms",
                                idle_timeout.as_millis()
                            ),
                        };
                        break;
                    }
                    if last_sent.elapsed() >= heartbeat {
                        last_sent = Instant::now();
                        yield StreamEvent::Heartbeat { ts_ms: now_ms() };
                    }
                }
            }
        }

        cancel.cancel();
        match tokio::time::timeout(close_grace, worker).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => tracing::warn!(error = %err, "stream worker panicked"),
            Err(_) => tracing::warn!(
                grace_ms = close_grace.as_millis() as u64,
                "stream worker did not close in time"
            ),
        }
    })
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    use async_trait::async_trait;
    use futures::StreamExt;
    use tokio::sync::oneshot;

    use autorun_types::{PauseKind, PlanItemChange, StepStatus};

    struct FakeSequence {
        events: VecDeque<(Duration, anyhow::Result<StreamEvent>)>,
        hang: bool,
        closed: Option<oneshot::Sender<()>>,
    }

    impl FakeSequence {
        fn new(events: Vec<StreamEvent>) -> Self {
            Self {
                events: events.into_iter().map(|e| (Duration::ZERO, Ok(e))).collect(),
                hang: false,
                closed: None,
            }
        }

        fn hanging(mut self) -> Self {
            self.hang = true;
            self
        }

        fn on_close(mut self) -> (Self, oneshot::Receiver<()>) {
            let (tx, rx) = oneshot::channel();
            self.closed = Some(tx);
            (self, rx)
        }
    }

    #[async_trait]
    impl StepSequence for FakeSequence {
        async fn next_event(&mut self) -> Option<anyhow::Result<StreamEvent>> {
            match self.events.pop_front() {
                Some((delay, item)) => {
                    if !delay.is_zero() {
                        tokio::time::sleep(delay).await;
                    }
                    Some(item)
                }
                None if self.hang => std::future::pending().await,
                None => None,
            }
        }

        async fn close(&mut self) {
            if let Some(tx) = self.closed.take() {
                let _ = tx.send(());
            }
        }
    }

    fn config() -> StreamConfig {
        StreamConfig {
            tick_ms: 1_000,
            idle_timeout_ms: 600_000,
            heartbeat_ms: 600_000,
            coalesce_ms: 60_000,
            close_grace_ms: 5_000,
        }
    }

    fn status_change(status: StepStatus) -> StreamEvent {
        StreamEvent::PlanDelta {
            changes: vec![PlanItemChange {
                id: "step_1".to_string(),
                step_order: 0,
                status: Some(status),
                brief: None,
                title: None,
            }],
        }
    }

    #[tokio::test(start_paused = true)]
    async fn burst_of_deltas_collapses_before_need_input() {
        let mut events: Vec<StreamEvent> = (0..99)
            .map(|i| {
                status_change(if i % 2 == 0 {
                    StepStatus::Running
                } else {
                    StepStatus::Pending
                })
            })
            .collect();
        events.push(status_change(StepStatus::Waiting));
        events.push(StreamEvent::NeedInput {
            question: "which directory?".to_string(),
            kind: PauseKind::UserInput,
        });

        let out: Vec<StreamEvent> = bridge(
            FakeSequence::new(events),
            config(),
            None,
            CancellationToken::new(),
        )
        .collect()
        .await;

        let names: Vec<&str> = out.iter().map(StreamEvent::name).collect();
        assert_eq!(names, vec!["plan_delta", "need_input"]);
        match &out[0] {
            StreamEvent::PlanDelta { changes } => {
                assert_eq!(changes.len(), 1);
                assert_eq!(changes[0].status, Some(StepStatus::Waiting));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn dropping_the_stream_closes_the_sequence() {
        let (sequence, closed) = FakeSequence::new(vec![StreamEvent::delta("first")])
            .hanging()
            .on_close();
        let mut stream = bridge(sequence, config(), None, CancellationToken::new());
        let first = stream.next().await;
        assert_eq!(first.map(|e| e.name()), Some("delta"));
        drop(stream);

        tokio::time::timeout(Duration::from_secs(2), closed)
            .await
            .expect("sequence closed in time")
            .expect("close signalled");
    }

    #[tokio::test(start_paused = true)]
    async fn silent_sequence_hits_idle_timeout() {
        let (sequence, closed) = FakeSequence::new(vec![StreamEvent::delta("started")])
            .hanging()
            .on_close();
        let mut config = config();
        config.idle_timeout_ms = 5_000;

        let out: Vec<StreamEvent> = bridge(sequence, config, None, CancellationToken::new())
            .collect()
            .await;
        assert_eq!(out.first().map(StreamEvent::name), Some("delta"));
        match out.last() {
            Some(StreamEvent::Error { message }) => assert!(message.contains("no progress")),
            other => panic!("unexpected {:?}", other),
        }
        assert!(closed.await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn slow_step_gets_heartbeats() {
        let mut sequence = FakeSequence::new(vec![StreamEvent::delta("planning")]);
        sequence.events.push_back((
            Duration::from_secs(20),
            Ok(StreamEvent::Done {
                output: Some("ok".to_string()),
            }),
        ));
        let mut config = config();
        config.heartbeat_ms = 5_000;

        let out: Vec<StreamEvent> = bridge(sequence, config, None, CancellationToken::new())
            .collect()
            .await;
        let names: Vec<&str> = out.iter().map(StreamEvent::name).collect();
        assert_eq!(names.first(), Some(&"delta"));
        assert_eq!(names.last(), Some(&"done"));
        assert!(names.iter().filter(|n| **n == "heartbeat").count() >= 2);
    }

    #[tokio::test(start_paused = true)]
    async fn stop_check_aborts_a_stuck_step() {
        let (sequence, closed) = FakeSequence::new(Vec::new()).hanging().on_close();
        let flag = Arc::new(AtomicBool::new(false));
        let check_flag = flag.clone();
        let check: StopCheck = Arc::new(move || check_flag.load(Ordering::SeqCst));

        let mut stream = bridge(sequence, config(), Some(check), CancellationToken::new());
        flag.store(true, Ordering::SeqCst);
        match stream.next().await {
            Some(StreamEvent::Error { message }) => assert!(message.contains("stopped")),
            other => panic!("unexpected {:?}", other),
        }
        assert!(stream.next().await.is_none());
        assert!(closed.await.is_ok());
    }

    #[tokio::test]
    async fn sequence_error_becomes_error_event() {
        let mut sequence = FakeSequence::new(vec![status_change(StepStatus::Running)]);
        sequence
            .events
            .push_back((Duration::ZERO, Err(anyhow::anyhow!("store unavailable"))));
        let out: Vec<StreamEvent> = bridge(sequence, config(), None, CancellationToken::new())
            .collect()
            .await;
        let names: Vec<&str> = out.iter().map(StreamEvent::name).collect();
        assert_eq!(names, vec!["plan_delta", "error"]);
    }
}
