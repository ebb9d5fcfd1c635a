//! Transport session component. Owns the MQTT connection to the device-twin
//! service, tracks connection state and keeps the session alive in a
//! background task with bounded backoff between reconnection attempts.

use async_trait::async_trait;
use bytes::Bytes;
use rumqttc::{
    AsyncClient, ConnectReturnCode, ConnectionError, Event, Incoming, MqttOptions, QoS,
    TlsConfiguration, Transport,
};
use std::time::Duration;
use thiserror::Error;
use tokio::fs;
use tokio::sync::{broadcast, mpsc, watch};
use tracing::{debug, error, info, instrument, warn};

use anyhow::{Context, Result};

use crate::config::Config;
use crate::identity::DeviceIdentity;
use crate::shadow::ShadowDocument;

/// Connection state of the transport session.
///
/// Written only by the session's background task, observed by the bridge
/// loop before any publish attempt. A reader seeing a stale Connected for
/// up to one polling interval costs a failed publish and a log line, not a
/// correctness violation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Raw inbound notification delivered by the broker
#[derive(Debug, Clone)]
pub struct Notification {
    pub topic: String,
    pub payload: Bytes,
}

/// Errors raised when queueing an outbound reported-state update
#[derive(Debug, Error)]
pub enum PublishError {
    #[error("failed to serialize shadow document: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("failed to queue publish: {0}")]
    Client(#[from] rumqttc::ClientError),
}

/// Outbound seam for reported-state updates. The session provides the real
/// implementation; tests inject recording fakes.
#[async_trait]
pub trait ReportSink: Send + Sync {
    async fn publish_reported(&self, document: &ShadowDocument) -> Result<(), PublishError>;
}

/// Cheap clonable handle for publishing reported-state documents.
///
/// Publishing is fire-and-forget: the message is queued on the client and
/// delivered at most once by the underlying transport.
#[derive(Clone)]
pub struct PublishHandle {
    client: AsyncClient,
    topic: String,
}

#[async_trait]
impl ReportSink for PublishHandle {
    async fn publish_reported(&self, document: &ShadowDocument) -> Result<(), PublishError> {
        let payload = serde_json::to_vec(document)?;
        self.client
            .publish(self.topic.as_str(), QoS::AtMostOnce, false, payload)
            .await?;
        debug!(topic = %self.topic, "queued reported-state update");
        Ok(())
    }
}

/// Bounded exponential backoff between reconnection attempts.
///
/// Each delay carries random jitter on top of the current base; the base
/// doubles up to the configured cap and resets on a successful connect.
#[derive(Debug, Clone)]
pub struct Backoff {
    current: Duration,
    min: Duration,
    max: Duration,
}

impl Backoff {
    pub fn new(min: Duration, max: Duration) -> Self {
        Self {
            current: min,
            min,
            max,
        }
    }

    /// Returns the next delay and advances the base towards the cap
    pub fn next_delay(&mut self) -> Duration {
        let jitter_ms = rand::random_range(0..=self.min.as_millis() as u64);
        let delay = self.current + Duration::from_millis(jitter_ms);
        self.current = (self.current * 2).min(self.max);
        delay
    }

    pub fn reset(&mut self) {
        self.current = self.min;
    }
}

/// Tracks consecutive authentication refusals so a misconfigured credential
/// set is surfaced loudly instead of looping silently forever
#[derive(Debug)]
struct AuthMonitor {
    consecutive: u32,
    threshold: u32,
}

impl AuthMonitor {
    fn new(threshold: u32) -> Self {
        Self {
            consecutive: 0,
            threshold,
        }
    }

    /// Records a refusal; returns true exactly once per failure streak,
    /// when the threshold is first crossed
    fn record_failure(&mut self) -> bool {
        self.consecutive += 1;
        self.consecutive == self.threshold
    }

    fn reset(&mut self) {
        self.consecutive = 0;
    }
}

fn is_authentication_failure(err: &ConnectionError) -> bool {
    match err {
        ConnectionError::ConnectionRefused(code) => matches!(
            code,
            ConnectReturnCode::BadUserNamePassword
                | ConnectReturnCode::NotAuthorized
                | ConnectReturnCode::BadClientId
        ),
        ConnectionError::Tls(_) => true,
        _ => false,
    }
}

/// Transport session service.
///
/// Holds the client handle and the connection-state watch; the network
/// event loop runs in a background task that reconnects on its own and
/// resubscribes after every successful connect (subscriptions do not
/// survive a disconnect). Dropping the service shuts the task down.
pub struct SessionService {
    client: AsyncClient,
    update_topic: String,
    state_rx: watch::Receiver<ConnectionState>,
    shutdown_tx: broadcast::Sender<()>,
}

impl SessionService {
    /// Creates the MQTT session and starts the background event loop.
    ///
    /// Credentials are read eagerly so a missing or unreadable file fails
    /// fast; a broker-side rejection is handled by the reconnection loop
    /// and escalated through the authentication alarm.
    pub async fn connect(
        config: &Config,
        identity: &DeviceIdentity,
    ) -> Result<(Self, mpsc::UnboundedReceiver<Notification>)> {
        let credentials = &config.credentials;
        let root_ca = fs::read(&credentials.root_ca).await.with_context(|| {
            format!("failed to read root CA {}", credentials.root_ca.display())
        })?;
        let certificate = fs::read(&credentials.certificate).await.with_context(|| {
            format!(
                "failed to read client certificate {}",
                credentials.certificate.display()
            )
        })?;
        let private_key = fs::read(&credentials.private_key).await.with_context(|| {
            format!(
                "failed to read private key {}",
                credentials.private_key.display()
            )
        })?;

        // Client id must be unique per broker session, the broker will
        // disconnect any duplicates
        let mut options = MqttOptions::new(
            identity.twin_id.to_string(),
            config.broker.host.clone(),
            config.broker.port,
        );
        options.set_keep_alive(config.broker.keep_alive);
        // rustls rejects anything below TLS 1.2, an older broker is a
        // configuration error rather than a fallback
        options.set_transport(Transport::Tls(TlsConfiguration::Simple {
            ca: root_ca,
            alpn: None,
            client_auth: Some((certificate, private_key)),
        }));

        let (client, eventloop) = AsyncClient::new(options, 10);
        let (state_tx, state_rx) = watch::channel(ConnectionState::Connecting);
        let (notify_tx, notify_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);

        info!(
            host = %config.broker.host,
            port = config.broker.port,
            "connecting to device-twin service"
        );

        tokio::spawn(Self::background_task(
            eventloop,
            client.clone(),
            identity.accepted_topic(),
            state_tx,
            notify_tx,
            shutdown_rx,
            Backoff::new(config.timing.min_backoff, config.timing.max_backoff),
            AuthMonitor::new(config.timing.auth_alarm_threshold),
        ));

        let service = Self {
            client,
            update_topic: identity.update_topic(),
            state_rx,
            shutdown_tx,
        };

        Ok((service, notify_rx))
    }

    /// Watch receiver over the session's connection state
    pub fn state_receiver(&self) -> watch::Receiver<ConnectionState> {
        self.state_rx.clone()
    }

    /// Handle for publishing reported-state documents to the update topic
    pub fn publisher(&self) -> PublishHandle {
        PublishHandle {
            client: self.client.clone(),
            topic: self.update_topic.clone(),
        }
    }

    #[allow(clippy::too_many_arguments)]
    #[instrument(name = "session", skip_all)]
    async fn background_task(
        mut eventloop: rumqttc::EventLoop,
        client: AsyncClient,
        accepted_topic: String,
        state_tx: watch::Sender<ConnectionState>,
        notify_tx: mpsc::UnboundedSender<Notification>,
        mut shutdown_rx: broadcast::Receiver<()>,
        mut backoff: Backoff,
        mut auth: AuthMonitor,
    ) {
        loop {
            let event = tokio::select! {
                _ = shutdown_rx.recv() => break,
                event = eventloop.poll() => event,
            };

            match event {
                Ok(Event::Incoming(Incoming::ConnAck(_))) => {
                    backoff.reset();
                    auth.reset();
                    state_tx.send_replace(ConnectionState::Connected);
                    info!("connected to device-twin service");

                    // Subscriptions do not survive a disconnect, re-issue
                    // on every successful connect
                    match client
                        .subscribe(accepted_topic.as_str(), QoS::AtMostOnce)
                        .await
                    {
                        Ok(()) => info!(topic = %accepted_topic, "subscribed to desired-state updates"),
                        Err(e) => warn!(topic = %accepted_topic, "failed to subscribe: {e}"),
                    }
                }
                Ok(Event::Incoming(Incoming::Publish(publish))) => {
                    debug!(topic = %publish.topic, "received notification");
                    // The receiver side runs actuation, which may hold for
                    // seconds; forwarding keeps this task unblocked
                    if notify_tx
                        .send(Notification {
                            topic: publish.topic,
                            payload: publish.payload,
                        })
                        .is_err()
                    {
                        debug!("notification channel closed");
                    }
                }
                Ok(_) => {}
                Err(err) => {
                    state_tx.send_replace(ConnectionState::Disconnected);

                    if is_authentication_failure(&err) {
                        warn!("authentication with device-twin service failed: {err}");
                        if auth.record_failure() {
                            error!(
                                "persistent authentication failure, check client \
                                 certificate and private key; will keep retrying"
                            );
                        }
                    } else {
                        auth.reset();
                        warn!("connection to device-twin service lost: {err}");
                    }

                    let delay = backoff.next_delay();
                    debug!("reconnecting in {delay:?}");
                    tokio::select! {
                        _ = shutdown_rx.recv() => break,
                        _ = tokio::time::sleep(delay) => {}
                    }
                    state_tx.send_replace(ConnectionState::Connecting);
                }
            }
        }

        debug!("session task stopped");
    }
}

impl Drop for SessionService {
    fn drop(&mut self) {
        let _ = self.shutdown_tx.send(());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_up_to_the_cap() {
        let min = Duration::from_millis(100);
        let max = Duration::from_millis(500);
        let mut backoff = Backoff::new(min, max);

        let first = backoff.next_delay();
        assert!(first >= min && first <= min * 2, "first delay {first:?}");

        let second = backoff.next_delay();
        assert!(second >= min * 2, "second delay {second:?}");

        // Base is capped at max regardless of how many failures pile up
        for _ in 0..10 {
            backoff.next_delay();
        }
        let capped = backoff.next_delay();
        assert!(capped <= max + min, "capped delay {capped:?}");
    }

    #[test]
    fn backoff_resets_to_the_minimum() {
        let min = Duration::from_millis(100);
        let mut backoff = Backoff::new(min, Duration::from_secs(10));
        backoff.next_delay();
        backoff.next_delay();
        backoff.reset();

        let delay = backoff.next_delay();
        assert!(delay >= min && delay <= min * 2, "delay {delay:?}");
    }

    #[test]
    fn auth_monitor_fires_once_per_streak() {
        let mut auth = AuthMonitor::new(3);
        assert!(!auth.record_failure());
        assert!(!auth.record_failure());
        assert!(auth.record_failure());
        // Still failing, but the alarm already fired for this streak
        assert!(!auth.record_failure());

        auth.reset();
        assert!(!auth.record_failure());
        assert!(!auth.record_failure());
        assert!(auth.record_failure());
    }

    #[test]
    fn credential_refusals_classify_as_authentication_failures() {
        assert!(is_authentication_failure(
            &ConnectionError::ConnectionRefused(ConnectReturnCode::NotAuthorized)
        ));
        assert!(is_authentication_failure(
            &ConnectionError::ConnectionRefused(ConnectReturnCode::BadUserNamePassword)
        ));
        assert!(!is_authentication_failure(
            &ConnectionError::ConnectionRefused(ConnectReturnCode::ServiceUnavailable)
        ));
        assert!(!is_authentication_failure(&ConnectionError::NetworkTimeout));
    }
}
