//! Event publisher: at-least-once, in-order delivery of crossings.
//!
//! Payloads are delivered one at a time in queue order. A failed delivery is
//! retried after a fixed delay until the collector answers 2xx, which blocks
//! every later crossing behind it. The shared pending counter only drops once
//! a delivery has been acknowledged.

use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
    thread,
    time::{Duration, Instant},
};

use anyhow::{Context, Result};
use crossbeam_channel::{Receiver, SendError, Sender};
use reqwest::blocking::{
    Client,
    multipart::{Form, Part},
};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::vision::{data::EncodedCrossing, telemetry};

/// Granularity of the interruptible retry sleep.
const ABANDON_POLL: Duration = Duration::from_millis(50);

#[derive(Debug, Error)]
pub(crate) enum DeliveryError {
    #[error("transport failure: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("collector answered HTTP {0}")]
    Status(u16),
}

/// Remote end receiving crossing payloads.
pub(crate) trait Collector: Send {
    fn deliver(&mut self, payload: &EncodedCrossing) -> Result<(), DeliveryError>;
}

/// Multipart `POST {base}/lap/{id}` with the timestamp and three JPEGs.
pub(crate) struct HttpCollector {
    client: Client,
    endpoint: String,
}

impl HttpCollector {
    pub(crate) fn new(base_url: &str, lap_id: &str, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .context("failed to build collector HTTP client")?;
        Ok(Self {
            client,
            endpoint: format!("{}/lap/{}", base_url.trim_end_matches('/'), lap_id),
        })
    }

    pub(crate) fn endpoint(&self) -> &str {
        &self.endpoint
    }

    fn form(payload: &EncodedCrossing) -> Result<Form, DeliveryError> {
        let jpeg = |bytes: &[u8], name: &'static str| {
            Part::bytes(bytes.to_vec())
                .file_name(name)
                .mime_str("image/jpeg")
        };
        Ok(Form::new()
            .text("time", payload.time.clone())
            .part("image", jpeg(&payload.previous_jpeg, "previous.jpg")?)
            .part("image", jpeg(&payload.current_jpeg, "current.jpg")?)
            .part("image", jpeg(&payload.stack_jpeg, "stack.jpg")?))
    }
}

impl Collector for HttpCollector {
    fn deliver(&mut self, payload: &EncodedCrossing) -> Result<(), DeliveryError> {
        let form = Self::form(payload)?;
        let response = self.client.post(&self.endpoint).multipart(form).send()?;
        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            Err(DeliveryError::Status(status.as_u16()))
        }
    }
}

/// Producer side of the publisher queue.
#[derive(Clone)]
pub(crate) struct PublishQueue {
    tx: Sender<EncodedCrossing>,
    pending: Arc<AtomicUsize>,
}

impl PublishQueue {
    pub(crate) fn push(&self, payload: EncodedCrossing) -> Result<(), SendError<EncodedCrossing>> {
        let pending = self.pending.fetch_add(1, Ordering::SeqCst) + 1;
        if let Err(err) = self.tx.send(payload) {
            self.pending.fetch_sub(1, Ordering::SeqCst);
            return Err(err);
        }
        metrics::gauge!("linecam_publish_pending").set(pending as f64);
        Ok(())
    }

    /// Crossings queued or in flight but not yet acknowledged.
    pub(crate) fn pending_counter(&self) -> Arc<AtomicUsize> {
        self.pending.clone()
    }
}

pub(crate) fn publish_channel() -> (PublishQueue, Receiver<EncodedCrossing>) {
    let (tx, rx) = crossbeam_channel::unbounded();
    let queue = PublishQueue {
        tx,
        pending: Arc::new(AtomicUsize::new(0)),
    };
    (queue, rx)
}

/// Spawn the publisher. It drains the queue until the producers hang up, or
/// stops early once `abandon` is raised.
pub(crate) fn spawn_publisher(
    payloads: Receiver<EncodedCrossing>,
    pending: Arc<AtomicUsize>,
    mut collector: Box<dyn Collector>,
    retry_delay: Duration,
    abandon: Arc<AtomicBool>,
) -> thread::JoinHandle<()> {
    telemetry::spawn_thread("linecam-publisher", move || {
        let worker_span = tracing::info_span!(
            "publisher.worker",
            retry_secs = retry_delay.as_secs_f64()
        );
        let _worker_guard = worker_span.enter();
        for payload in payloads.iter() {
            if abandon.load(Ordering::SeqCst) {
                break;
            }
            let started = Instant::now();
            if !deliver_with_retry(collector.as_mut(), &payload, retry_delay, &abandon) {
                break;
            }
            let remaining = pending.fetch_sub(1, Ordering::SeqCst).saturating_sub(1);
            metrics::gauge!("linecam_publish_pending").set(remaining as f64);
            metrics::histogram!("linecam_stage_latency_seconds", "stage" => "publish")
                .record(started.elapsed().as_secs_f64());
            info!(time = %payload.time, remaining, "Crossing delivered");
        }

        let left = pending.load(Ordering::SeqCst);
        if left > 0 {
            warn!("Publisher stopped with {left} crossing(s) undelivered");
        } else {
            debug!("Publisher drained");
        }
    })
    .expect("failed to spawn publisher thread")
}

/// Deliver `payload`, retrying on a fixed delay. Returns `false` only when
/// delivery was abandoned.
pub(crate) fn deliver_with_retry(
    collector: &mut dyn Collector,
    payload: &EncodedCrossing,
    retry_delay: Duration,
    abandon: &AtomicBool,
) -> bool {
    let mut attempt: u32 = 0;
    loop {
        attempt = attempt.saturating_add(1);
        match collector.deliver(payload) {
            Ok(()) => {
                metrics::counter!("linecam_publish_attempts_total", "outcome" => "success")
                    .increment(1);
                return true;
            }
            Err(err) => {
                metrics::counter!("linecam_publish_attempts_total", "outcome" => "failure")
                    .increment(1);
                warn!(
                    time = %payload.time,
                    attempt,
                    "Crossing delivery failed: {err}; retrying in {:?}",
                    retry_delay
                );
            }
        }
        if !sleep_unless(retry_delay, abandon) {
            return false;
        }
    }
}

/// Sleep for `delay`, waking early if `flag` is raised. Returns whether the
/// full delay elapsed.
fn sleep_unless(delay: Duration, flag: &AtomicBool) -> bool {
    let deadline = Instant::now() + delay;
    loop {
        if flag.load(Ordering::SeqCst) {
            return false;
        }
        let now = Instant::now();
        if now >= deadline {
            return true;
        }
        thread::sleep(ABANDON_POLL.min(deadline - now));
    }
}

#[cfg(test)]
mod tests {
    use std::{collections::VecDeque, net::TcpListener, sync::Mutex};

    use super::*;
    use crate::vision::data::CrossingDirection;

    fn payload(time: &str) -> EncodedCrossing {
        EncodedCrossing {
            time: time.into(),
            direction: CrossingDirection::Right,
            previous_jpeg: vec![0xFF, 0xD8, 1],
            current_jpeg: vec![0xFF, 0xD8, 2],
            stack_jpeg: vec![0xFF, 0xD8, 3],
        }
    }

    /// Answers from a script and records what it saw on every attempt.
    struct ScriptedCollector {
        responses: VecDeque<Result<(), u16>>,
        pending: Arc<AtomicUsize>,
        attempts: Arc<Mutex<Vec<(String, usize)>>>,
    }

    impl Collector for ScriptedCollector {
        fn deliver(&mut self, payload: &EncodedCrossing) -> Result<(), DeliveryError> {
            self.attempts
                .lock()
                .unwrap()
                .push((payload.time.clone(), self.pending.load(Ordering::SeqCst)));
            match self.responses.pop_front().unwrap_or(Ok(())) {
                Ok(()) => Ok(()),
                Err(status) => Err(DeliveryError::Status(status)),
            }
        }
    }

    #[test]
    fn failed_delivery_is_retried_until_acknowledged() {
        let (queue, rx) = publish_channel();
        let pending = queue.pending_counter();
        let attempts = Arc::new(Mutex::new(Vec::new()));
        let collector = ScriptedCollector {
            responses: VecDeque::from([Err(500), Err(503), Ok(()), Ok(())]),
            pending: pending.clone(),
            attempts: attempts.clone(),
        };

        queue.push(payload("first")).unwrap();
        queue.push(payload("second")).unwrap();
        drop(queue);
        let started = Instant::now();
        let publisher = spawn_publisher(
            rx,
            pending.clone(),
            Box::new(collector),
            Duration::from_millis(20),
            Arc::new(AtomicBool::new(false)),
        );
        publisher.join().unwrap();

        let attempts = attempts.lock().unwrap().clone();
        assert_eq!(
            attempts,
            vec![
                ("first".to_string(), 2),
                ("first".to_string(), 2),
                ("first".to_string(), 2),
                ("second".to_string(), 1),
            ]
        );
        assert_eq!(pending.load(Ordering::SeqCst), 0);
        assert!(started.elapsed() >= Duration::from_millis(40));
    }

    #[test]
    fn abandon_interrupts_the_retry_sleep() {
        let (queue, rx) = publish_channel();
        let pending = queue.pending_counter();
        let abandon = Arc::new(AtomicBool::new(false));
        let collector = ScriptedCollector {
            responses: VecDeque::from(vec![Err(502); 100]),
            pending: pending.clone(),
            attempts: Arc::new(Mutex::new(Vec::new())),
        };
        queue.push(payload("stuck")).unwrap();

        let publisher = spawn_publisher(
            rx,
            pending.clone(),
            Box::new(collector),
            Duration::from_secs(30),
            abandon.clone(),
        );
        thread::sleep(Duration::from_millis(100));
        let started = Instant::now();
        abandon.store(true, Ordering::SeqCst);
        publisher.join().unwrap();

        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(pending.load(Ordering::SeqCst), 1);
        drop(queue);
    }

    #[test]
    fn endpoint_follows_collector_route() {
        let collector =
            HttpCollector::new("http://10.0.0.5:8080/", "7", Duration::from_secs(10)).unwrap();
        assert_eq!(collector.endpoint(), "http://10.0.0.5:8080/lap/7");
    }

    #[test]
    fn unreachable_collector_is_a_transport_error() {
        let port = TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port();
        let mut collector = HttpCollector::new(
            &format!("http://127.0.0.1:{port}"),
            "1",
            Duration::from_secs(2),
        )
        .unwrap();
        let err = collector.deliver(&payload("t")).unwrap_err();
        assert!(matches!(err, DeliveryError::Transport(_)));
    }
}
