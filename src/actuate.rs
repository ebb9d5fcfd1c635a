//! Actuation dispatch. Interprets desired-state deltas, drives the physical
//! outputs and confirms each completed action with a reported-state update.

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;
use tokio::fs;
use tracing::{debug, info, warn};

use crate::session::{Notification, ReportSink};
use crate::shadow::{self, TIMESTAMP_ATTRIBUTE};

/// A desired (attribute, value) pair that cannot be acted on. Recoverable:
/// the attribute is skipped and the cloud-side desired state remains
/// unreconciled until corrected.
#[derive(Debug, Error)]
pub enum UnsupportedActuationError {
    #[error("no actuator for attribute {0:?}")]
    UnknownAttribute(String),

    #[error("don't know how to set {attribute:?} to {value:?}")]
    UnknownValue { attribute: String, value: String },
}

/// Errors surfaced by a single dispatch call
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error(transparent)]
    Unsupported(#[from] UnsupportedActuationError),

    #[error("actuator output failed: {0:#}")]
    Output(anyhow::Error),
}

/// Trait for abstracting a physical on/off output to enable dependency
/// injection
#[async_trait]
pub trait Actuator {
    /// Drive the output active or inactive
    async fn set_active(&mut self, active: bool) -> Result<()>;
}

/// LED exposed through the sysfs leds class
pub struct SysfsLed {
    brightness_path: PathBuf,
}

impl SysfsLed {
    pub fn new(brightness_path: impl Into<PathBuf>) -> Self {
        Self {
            brightness_path: brightness_path.into(),
        }
    }
}

#[async_trait]
impl Actuator for SysfsLed {
    async fn set_active(&mut self, active: bool) -> Result<()> {
        let value = if active { "1" } else { "0" };
        fs::write(&self.brightness_path, value)
            .await
            .with_context(|| {
                format!("failed to write {}", self.brightness_path.display())
            })
    }
}

/// Dispatcher mapping desired attributes onto physical actuators.
///
/// Every completed action is confirmed on the wire with a reported-state
/// update carrying the attribute, the applied value and a timestamp.
pub struct Dispatcher<S> {
    actuators: HashMap<String, Box<dyn Actuator + Send>>,
    sink: S,
    flash_hold: Duration,
}

impl<S: ReportSink> Dispatcher<S> {
    pub fn new(sink: S, flash_hold: Duration) -> Self {
        Self {
            actuators: HashMap::new(),
            sink,
            flash_hold,
        }
    }

    pub fn with_actuator(
        mut self,
        attribute: impl Into<String>,
        actuator: Box<dyn Actuator + Send>,
    ) -> Self {
        self.actuators.insert(attribute.into(), actuator);
        self
    }

    /// Decodes a raw inbound notification and actuates its desired state.
    ///
    /// A malformed payload is logged with the topic and an excerpt and
    /// dropped; it never aborts later notifications.
    pub async fn handle_notification(&mut self, notification: &Notification) {
        match shadow::decode_desired(&notification.payload) {
            Ok(desired) => self.handle_desired(desired).await,
            Err(e) => {
                let excerpt: String = String::from_utf8_lossy(&notification.payload)
                    .chars()
                    .take(128)
                    .collect();
                warn!(
                    topic = %notification.topic,
                    payload = %excerpt,
                    "discarding malformed notification: {e}"
                );
            }
        }
    }

    /// Actuates each attribute of a desired-state mapping independently, in
    /// the iteration order of the mapping. A failure on one attribute never
    /// aborts processing of the others.
    pub async fn handle_desired(&mut self, desired: Map<String, Value>) {
        for (attribute, value) in &desired {
            // The timestamp attribute is informational only
            if attribute == TIMESTAMP_ATTRIBUTE {
                debug!("skipping timestamp attribute");
                continue;
            }

            let Some(value) = value.as_str() else {
                warn!(attribute = %attribute, "desired value is not a string, skipping");
                continue;
            };

            if let Err(e) = self.dispatch(attribute, value).await {
                warn!("actuation failed: {e}");
            }
        }
    }

    /// Drives the actuator for one (attribute, value) pair and confirms the
    /// outcome. `flash1` is a compound action: active, confirm "on", hold,
    /// inactive, confirm "off", hold again.
    pub async fn dispatch(&mut self, attribute: &str, value: &str) -> Result<(), DispatchError> {
        let actuator = self
            .actuators
            .get_mut(attribute)
            .ok_or_else(|| UnsupportedActuationError::UnknownAttribute(attribute.to_string()))?;

        info!(attribute = %attribute, value = %value, "actuating");
        match value {
            "on" => {
                actuator.set_active(true).await.map_err(DispatchError::Output)?;
                Self::confirm(&self.sink, attribute, "on").await;
            }
            "off" => {
                actuator.set_active(false).await.map_err(DispatchError::Output)?;
                Self::confirm(&self.sink, attribute, "off").await;
            }
            "flash1" => {
                actuator.set_active(true).await.map_err(DispatchError::Output)?;
                Self::confirm(&self.sink, attribute, "on").await;
                tokio::time::sleep(self.flash_hold).await;

                let actuator = self
                    .actuators
                    .get_mut(attribute)
                    .expect("actuator cannot disappear mid-dispatch");
                actuator.set_active(false).await.map_err(DispatchError::Output)?;
                Self::confirm(&self.sink, attribute, "off").await;
                tokio::time::sleep(self.flash_hold).await;
            }
            _ => {
                return Err(UnsupportedActuationError::UnknownValue {
                    attribute: attribute.to_string(),
                    value: value.to_string(),
                }
                .into());
            }
        }

        Ok(())
    }

    /// Reports the actuation outcome back to the twin. A publish failure
    /// only costs a log line; the physical action already happened.
    async fn confirm(sink: &S, attribute: &str, value: &str) {
        let timestamp = chrono::Utc::now().to_rfc3339();
        let document = shadow::encode_confirmation(attribute, value, timestamp);
        if let Err(e) = sink.publish_reported(&document).await {
            warn!(attribute = %attribute, "failed to report actuation outcome: {e}");
        }
    }
}
