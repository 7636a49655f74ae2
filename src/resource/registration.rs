//! Registration stream.
//!
//! A running program describes its desired resources as a sequence of
//! registration events terminated by [`RegistrationEvent::Complete`]. The
//! stream is consumed by a single coordinator; producers may be in-process
//! (through a channel) or external (JSON lines on a pipe).

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::property::PropertyMap;
use super::state::ProviderReference;
use super::urn::Urn;
use crate::error::{EngineError, PlanError, Result};

/// Options attached to a registration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "snake_case")]
pub struct ResourceOptions {
    /// Refuse delete and replace.
    pub protect: bool,
    /// Forget instead of deleting.
    pub retain_on_delete: bool,
    /// Explicit provider; the package's default provider is used if absent.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provider: Option<ProviderReference>,
    /// Replacement ordering override.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub delete_before_replace: Option<bool>,
    /// Parent resource.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent: Option<Urn>,
    /// Output keys to store as secrets.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub additional_secret_outputs: Vec<String>,
}

/// A desired resource.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct Registration {
    /// Stable identifier.
    pub urn: Urn,
    /// True for provider-managed resources, false for components.
    #[serde(default = "default_custom")]
    pub custom: bool,
    /// Desired inputs.
    #[serde(default)]
    pub inputs: PropertyMap,
    /// Resources whose outputs the inputs refer to.
    #[serde(default)]
    pub dependencies: Vec<Urn>,
    /// Resource options.
    #[serde(default)]
    pub options: ResourceOptions,
}

const fn default_custom() -> bool {
    true
}

impl Registration {
    /// Creates a custom resource registration with default options.
    #[must_use]
    pub fn new(urn: Urn, inputs: PropertyMap) -> Self {
        Self {
            urn,
            custom: true,
            inputs,
            dependencies: Vec::new(),
            options: ResourceOptions::default(),
        }
    }

    /// Adds a dependency.
    #[must_use]
    pub fn depends_on(mut self, urn: Urn) -> Self {
        self.dependencies.push(urn);
        self
    }

    /// Replaces the options.
    #[must_use]
    pub fn with_options(mut self, options: ResourceOptions) -> Self {
        self.options = options;
        self
    }

    /// Marks the registration as a component.
    #[must_use]
    pub const fn component(mut self) -> Self {
        self.custom = false;
        self
    }
}

/// A request to adopt an existing resource by id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct ReadRegistration {
    /// Urn to record the resource under.
    pub urn: Urn,
    /// Physical id of the existing resource.
    pub id: String,
    /// Lookup hints passed to the provider's read.
    #[serde(default)]
    pub inputs: PropertyMap,
    /// Resources whose outputs the hints refer to.
    #[serde(default)]
    pub dependencies: Vec<Urn>,
    /// Explicit provider; the package's default provider is used if absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider: Option<ProviderReference>,
    /// Parent resource.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<Urn>,
}

/// One event on the registration stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum RegistrationEvent {
    /// Declare a resource.
    Register(Registration),
    /// Adopt an external resource.
    Read(ReadRegistration),
    /// The program has declared everything.
    Complete,
}

impl RegistrationEvent {
    /// Returns the urn the event is about, if any.
    #[must_use]
    pub const fn urn(&self) -> Option<&Urn> {
        match self {
            Self::Register(registration) => Some(&registration.urn),
            Self::Read(read) => Some(&read.urn),
            Self::Complete => None,
        }
    }
}

/// Sending half of an in-process registration stream.
#[derive(Debug, Clone)]
pub struct RegistrationSender {
    tx: mpsc::Sender<Result<RegistrationEvent>>,
}

impl RegistrationSender {
    /// Sends one event.
    ///
    /// # Errors
    ///
    /// Returns an error if the stream has been dropped.
    pub async fn send(&self, event: RegistrationEvent) -> Result<()> {
        self.tx
            .send(Ok(event))
            .await
            .map_err(|_| EngineError::internal("registration stream closed"))
    }

    /// Registers a resource.
    ///
    /// # Errors
    ///
    /// Returns an error if the stream has been dropped.
    pub async fn register(&self, registration: Registration) -> Result<()> {
        self.send(RegistrationEvent::Register(registration)).await
    }

    /// Sends the completion marker.
    ///
    /// # Errors
    ///
    /// Returns an error if the stream has been dropped.
    pub async fn complete(&self) -> Result<()> {
        self.send(RegistrationEvent::Complete).await
    }
}

/// Receiving half consumed by the deployment coordinator.
#[derive(Debug)]
pub struct RegistrationStream {
    rx: mpsc::Receiver<Result<RegistrationEvent>>,
}

impl RegistrationStream {
    /// Creates a channel-backed stream.
    #[must_use]
    pub fn channel(buffer: usize) -> (RegistrationSender, Self) {
        let (tx, rx) = mpsc::channel(buffer.max(1));
        (RegistrationSender { tx }, Self { rx })
    }

    /// Creates a stream over a fixed list of events.
    ///
    /// The list is delivered as given; append [`RegistrationEvent::Complete`]
    /// to mark it finished.
    #[must_use]
    pub fn from_events(events: Vec<RegistrationEvent>) -> Self {
        let (tx, rx) = mpsc::channel(events.len().max(1));
        for event in events {
            // Capacity covers every event.
            let _ = tx.try_send(Ok(event));
        }
        Self { rx }
    }

    /// Decodes newline-delimited JSON events from a reader.
    ///
    /// Blank lines are ignored. A line that fails to decode is delivered as
    /// an error and ends the stream.
    #[must_use]
    pub fn from_json_lines<R>(reader: R) -> Self
    where
        R: AsyncBufRead + Unpin + Send + 'static,
    {
        let (tx, rx) = mpsc::channel(64);
        tokio::spawn(async move {
            let mut lines = reader.lines();
            let mut line_number = 0usize;
            loop {
                line_number += 1;
                let line = match lines.next_line().await {
                    Ok(Some(line)) => line,
                    Ok(None) => break,
                    Err(e) => {
                        let _ = tx.send(Err(EngineError::Io(e))).await;
                        break;
                    }
                };
                if line.trim().is_empty() {
                    continue;
                }
                match serde_json::from_str::<RegistrationEvent>(&line) {
                    Ok(event) => {
                        debug!("Decoded registration event on line {}", line_number);
                        if tx.send(Ok(event)).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        warn!("Invalid registration on line {}: {}", line_number, e);
                        let _ = tx
                            .send(Err(EngineError::internal(format!(
                                "invalid registration on line {line_number}: {e}"
                            ))))
                            .await;
                        break;
                    }
                }
            }
        });
        Self { rx }
    }

    /// Receives the next event, or `None` once every sender is gone.
    pub async fn next(&mut self) -> Option<Result<RegistrationEvent>> {
        self.rx.recv().await
    }

    /// Drains the stream up to its completion marker.
    ///
    /// # Errors
    ///
    /// Returns [`PlanError::IncompleteStream`] if the stream closes before
    /// the marker, or the first decode error.
    pub async fn collect(mut self) -> Result<Vec<RegistrationEvent>> {
        let mut events = Vec::new();
        while let Some(event) = self.next().await {
            match event? {
                RegistrationEvent::Complete => return Ok(events),
                other => events.push(other),
            }
        }
        Err(PlanError::IncompleteStream.into())
    }
}
