//! Foreground bridge loop. Polls the radio for sensor readings and forwards
//! them to the twin as reported state, pacing itself on a fixed reporting
//! period and backing off after errors. The loop never terminates on a
//! transient error, only on the shutdown signal.

use anyhow::{Context, Result};
use serde_json::{Map, Value};
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio::time::{self, Instant};
use tracing::{debug, info, instrument, trace, warn};

use crate::radio::Radio;
use crate::session::{ConnectionState, ReportSink};
use crate::shadow;

/// Pacing intervals for the bridge loop
#[derive(Debug, Clone)]
pub struct BridgeTiming {
    /// Wait between reports after a reading was forwarded
    pub report_interval: Duration,
    /// Wait when disconnected or when the radio had nothing for us
    pub idle_interval: Duration,
    /// Wait after an error before resuming
    pub recovery_interval: Duration,
}

pub struct Bridge<R, S> {
    radio: R,
    sink: S,
    state_rx: watch::Receiver<ConnectionState>,
    timing: BridgeTiming,
}

impl<R: Radio, S: ReportSink> Bridge<R, S> {
    pub fn new(
        radio: R,
        sink: S,
        state_rx: watch::Receiver<ConnectionState>,
        timing: BridgeTiming,
    ) -> Self {
        Self {
            radio,
            sink,
            state_rx,
            timing,
        }
    }

    /// Runs the loop until the shutdown signal arrives, then exits cleanly
    /// without a final flush
    #[instrument(name = "bridge", skip_all, err)]
    pub async fn run(mut self, mut shutdown_rx: broadcast::Receiver<()>) -> Result<()> {
        let status = self.radio.setup().await.context("radio setup failed")?;
        info!(?status, "radio ready");

        let mut next_tick = Instant::now();
        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => {
                    info!("interrupted, shutting down");
                    return Ok(());
                }
                _ = time::sleep_until(next_tick) => {
                    let wait = self.step().await;
                    next_tick = Instant::now() + wait;
                }
            }
        }
    }

    /// One loop iteration; returns how long to wait before the next one
    async fn step(&mut self) -> Duration {
        // No radio read is attempted while disconnected
        if *self.state_rx.borrow() != ConnectionState::Connected {
            trace!("not connected, waiting");
            return self.timing.idle_interval;
        }

        match self.forward_reading().await {
            Ok(true) => self.timing.report_interval,
            Ok(false) => self.timing.idle_interval,
            Err(e) => {
                warn!("bridge iteration failed: {e:#}");
                self.timing.recovery_interval
            }
        }
    }

    /// Reads one radio message and reports it; returns whether a reading
    /// was forwarded
    async fn forward_reading(&mut self) -> Result<bool> {
        let payload = self
            .radio
            .read_message()
            .await
            .context("radio read failed")?;
        let status = self.radio.status();
        trace!(?status, "radio polled");

        if payload.is_empty() {
            return Ok(false);
        }

        // The decoded radio payload is authoritative for the reported state
        let reading: Map<String, Value> =
            serde_json::from_slice(&payload).context("sensor payload is not a JSON object")?;
        let document = shadow::encode_reported(reading);

        debug!(
            "reporting sensor state: {}",
            serde_json::to_string(&document).unwrap_or_default()
        );
        self.sink
            .publish_reported(&document)
            .await
            .context("failed to publish sensor report")?;
        info!("sensor state reported");

        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::radio::{RadioError, RadioStatus};
    use crate::session::PublishError;
    use crate::shadow::ShadowDocument;
    use async_trait::async_trait;
    use bytes::Bytes;
    use serde_json::json;
    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex};

    #[derive(Default)]
    struct FakeRadio {
        frames: VecDeque<Bytes>,
        reads: Arc<Mutex<usize>>,
    }

    impl FakeRadio {
        fn scripted(frames: Vec<&'static [u8]>) -> Self {
            Self {
                frames: frames.into_iter().map(Bytes::from_static).collect(),
                reads: Arc::default(),
            }
        }
    }

    #[async_trait]
    impl Radio for FakeRadio {
        async fn setup(&mut self) -> Result<RadioStatus, RadioError> {
            Ok(RadioStatus::Ready)
        }

        async fn read_message(&mut self) -> Result<Bytes, RadioError> {
            *self.reads.lock().unwrap() += 1;
            Ok(self.frames.pop_front().unwrap_or_default())
        }

        fn status(&self) -> RadioStatus {
            RadioStatus::Ready
        }
    }

    #[derive(Clone, Default)]
    struct RecordingSink {
        sent: Arc<Mutex<Vec<ShadowDocument>>>,
    }

    #[async_trait]
    impl ReportSink for RecordingSink {
        async fn publish_reported(&self, document: &ShadowDocument) -> Result<(), PublishError> {
            self.sent.lock().unwrap().push(document.clone());
            Ok(())
        }
    }

    fn timing() -> BridgeTiming {
        BridgeTiming {
            report_interval: Duration::from_millis(300),
            idle_interval: Duration::from_millis(10),
            recovery_interval: Duration::from_millis(100),
        }
    }

    fn bridge(
        radio: FakeRadio,
        sink: RecordingSink,
        state: ConnectionState,
    ) -> Bridge<FakeRadio, RecordingSink> {
        // The receiver keeps the last value even after the sender drops
        let (_tx, rx) = watch::channel(state);
        Bridge::new(radio, sink, rx, timing())
    }

    #[tokio::test]
    async fn it_forwards_a_sensor_reading_as_reported_state() {
        let radio =
            FakeRadio::scripted(vec![br#"{"temperature":27.3,"humidity":88}"# as &[u8]]);
        let sink = RecordingSink::default();
        let mut bridge = bridge(radio, sink.clone(), ConnectionState::Connected);

        let wait = bridge.step().await;
        assert_eq!(wait, timing().report_interval);

        let sent = sink.sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert_eq!(
            serde_json::to_value(&sent[0]).unwrap(),
            json!({"state": {"reported": {"temperature": 27.3, "humidity": 88}}})
        );
    }

    #[tokio::test]
    async fn it_neither_reads_nor_publishes_while_disconnected() {
        let radio = FakeRadio::scripted(vec![br#"{"temperature":27.3}"# as &[u8]]);
        let reads = radio.reads.clone();
        let sink = RecordingSink::default();
        let mut bridge = bridge(radio, sink.clone(), ConnectionState::Disconnected);

        let wait = bridge.step().await;
        assert_eq!(wait, timing().idle_interval);
        assert_eq!(*reads.lock().unwrap(), 0);
        assert!(sink.sent.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn an_empty_read_idles_without_publishing() {
        let radio = FakeRadio::default();
        let sink = RecordingSink::default();
        let mut bridge = bridge(radio, sink.clone(), ConnectionState::Connected);

        let wait = bridge.step().await;
        assert_eq!(wait, timing().idle_interval);
        assert!(sink.sent.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn a_bad_payload_triggers_recovery_and_the_loop_resumes() {
        let radio = FakeRadio::scripted(vec![b"not json" as &[u8], br#"{"humidity":88}"#]);
        let sink = RecordingSink::default();
        let mut bridge = bridge(radio, sink.clone(), ConnectionState::Connected);

        let wait = bridge.step().await;
        assert_eq!(wait, timing().recovery_interval);
        assert!(sink.sent.lock().unwrap().is_empty());

        // The next reading still goes through
        let wait = bridge.step().await;
        assert_eq!(wait, timing().report_interval);
        assert_eq!(sink.sent.lock().unwrap().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn run_exits_cleanly_on_shutdown() {
        let radio = FakeRadio::default();
        let sink = RecordingSink::default();
        let bridge = bridge(radio, sink, ConnectionState::Connected);

        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let handle = tokio::spawn(bridge.run(shutdown_rx));

        tokio::time::sleep(Duration::from_millis(50)).await;
        shutdown_tx.send(()).unwrap();

        let result = handle.await.unwrap();
        assert!(result.is_ok());
    }
}
