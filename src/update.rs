//! # `update` channel.
//!
//! Only the shape lives here: two commands, six events, and the seams a
//! real updater plugs into. Checking, downloading and polling policy are the
//! [`UpdateService`] implementation's business.
//!
//! ```text
//!   UI                             privileged
//!   UpdateClient ── checkForUpdates ──────────► UpdateChannel ─► UpdateService
//!                ◄─ updateAvailable / ... ───── (filtered UpdateEvent stream)
//! ```
//!
//! Native updaters with an add/remove-listener interface are adapted with
//! [`native_update_events`].

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::base::{Event, ExternalSource};
use crate::error::ChannelError;
use crate::ipc::{Channel, ConnectionId, ServerChannel};

/// Channel name.
pub const UPDATE_CHANNEL: &str = "update";

/// Update channel commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UpdateCommand {
    /// Check without notifying the user.
    CheckForUpdates,
    /// Check and let the updater notify the user.
    CheckForUpdatesAndNotify,
}

impl UpdateCommand {
    /// Wire name.
    pub fn as_str(self) -> &'static str {
        match self {
            UpdateCommand::CheckForUpdates => "checkForUpdates",
            UpdateCommand::CheckForUpdatesAndNotify => "checkForUpdatesAndNotify",
        }
    }
}

impl FromStr for UpdateCommand {
    type Err = ChannelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "checkForUpdates" => Ok(UpdateCommand::CheckForUpdates),
            "checkForUpdatesAndNotify" => Ok(UpdateCommand::CheckForUpdatesAndNotify),
            other => Err(ChannelError::unknown_command(UPDATE_CHANNEL, other)),
        }
    }
}

/// Release metadata.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateInfo {
    /// Offered version.
    pub version: String,
    /// Human-readable release title.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub release_name: Option<String>,
    /// Publication date as reported by the feed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub release_date: Option<String>,
    /// Release notes, passed through unformatted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub release_notes: Option<String>,
}

/// Download progress snapshot.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressInfo {
    /// Size of the download in bytes.
    pub total: u64,
    /// Bytes received so far.
    pub transferred: u64,
    /// Bytes received since the previous snapshot.
    pub delta: u64,
    /// `transferred` as a percentage of `total`.
    pub percent: f64,
    /// Current transfer rate.
    pub bytes_per_second: u64,
}

/// Names of the six update events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UpdateEventKind {
    /// The updater failed (`error`).
    Error,
    /// A check started (`checkingForUpdate`).
    CheckingForUpdate,
    /// A newer release exists (`updateAvailable`).
    UpdateAvailable,
    /// The running version is current (`updateNotAvailable`).
    UpdateNotAvailable,
    /// Download progress (`downloadProgress`).
    DownloadProgress,
    /// A release is downloaded and ready to install (`updateDownloaded`).
    UpdateDownloaded,
}

impl UpdateEventKind {
    /// Every kind.
    pub const ALL: [UpdateEventKind; 6] = [
        UpdateEventKind::Error,
        UpdateEventKind::CheckingForUpdate,
        UpdateEventKind::UpdateAvailable,
        UpdateEventKind::UpdateNotAvailable,
        UpdateEventKind::DownloadProgress,
        UpdateEventKind::UpdateDownloaded,
    ];

    /// Channel event name.
    pub fn as_str(self) -> &'static str {
        match self {
            UpdateEventKind::Error => "error",
            UpdateEventKind::CheckingForUpdate => "checkingForUpdate",
            UpdateEventKind::UpdateAvailable => "updateAvailable",
            UpdateEventKind::UpdateNotAvailable => "updateNotAvailable",
            UpdateEventKind::DownloadProgress => "downloadProgress",
            UpdateEventKind::UpdateDownloaded => "updateDownloaded",
        }
    }

    /// Event name used by native updaters.
    pub fn native_name(self) -> &'static str {
        match self {
            UpdateEventKind::Error => "error",
            UpdateEventKind::CheckingForUpdate => "checking-for-update",
            UpdateEventKind::UpdateAvailable => "update-available",
            UpdateEventKind::UpdateNotAvailable => "update-not-available",
            UpdateEventKind::DownloadProgress => "download-progress",
            UpdateEventKind::UpdateDownloaded => "update-downloaded",
        }
    }
}

impl fmt::Display for UpdateEventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for UpdateEventKind {
    type Err = ChannelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        UpdateEventKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| ChannelError::unknown_event(UPDATE_CHANNEL, s))
    }
}

/// One updater notification.
#[derive(Debug, Clone, PartialEq)]
pub enum UpdateEvent {
    /// Failure message from the updater.
    Error(String),
    /// A check started.
    CheckingForUpdate,
    /// The release that will be downloaded.
    UpdateAvailable(UpdateInfo),
    /// The release the feed reported as latest.
    UpdateNotAvailable(UpdateInfo),
    /// Download progress snapshot.
    DownloadProgress(ProgressInfo),
    /// The downloaded release.
    UpdateDownloaded(UpdateInfo),
}

impl UpdateEvent {
    /// Kind of this event.
    pub fn kind(&self) -> UpdateEventKind {
        match self {
            UpdateEvent::Error(_) => UpdateEventKind::Error,
            UpdateEvent::CheckingForUpdate => UpdateEventKind::CheckingForUpdate,
            UpdateEvent::UpdateAvailable(_) => UpdateEventKind::UpdateAvailable,
            UpdateEvent::UpdateNotAvailable(_) => UpdateEventKind::UpdateNotAvailable,
            UpdateEvent::DownloadProgress(_) => UpdateEventKind::DownloadProgress,
            UpdateEvent::UpdateDownloaded(_) => UpdateEventKind::UpdateDownloaded,
        }
    }

    /// Wire payload.
    pub fn payload(&self) -> Value {
        let encoded = match self {
            UpdateEvent::Error(message) => Ok(Value::String(message.clone())),
            UpdateEvent::CheckingForUpdate => Ok(Value::Null),
            UpdateEvent::UpdateAvailable(info)
            | UpdateEvent::UpdateNotAvailable(info)
            | UpdateEvent::UpdateDownloaded(info) => serde_json::to_value(info),
            UpdateEvent::DownloadProgress(progress) => serde_json::to_value(progress),
        };
        encoded.unwrap_or(Value::Null)
    }

    /// Rebuilds an event from its kind and payload.
    pub fn from_parts(kind: UpdateEventKind, payload: Value) -> Result<Self, ChannelError> {
        Ok(match kind {
            UpdateEventKind::Error => UpdateEvent::Error(match payload {
                Value::String(message) => message,
                other => other.to_string(),
            }),
            UpdateEventKind::CheckingForUpdate => UpdateEvent::CheckingForUpdate,
            UpdateEventKind::UpdateAvailable => UpdateEvent::UpdateAvailable(serde_json::from_value(payload)?),
            UpdateEventKind::UpdateNotAvailable => UpdateEvent::UpdateNotAvailable(serde_json::from_value(payload)?),
            UpdateEventKind::DownloadProgress => UpdateEvent::DownloadProgress(serde_json::from_value(payload)?),
            UpdateEventKind::UpdateDownloaded => UpdateEvent::UpdateDownloaded(serde_json::from_value(payload)?),
        })
    }
}

/// # Update checking backend.
#[async_trait]
pub trait UpdateService: Send + Sync + 'static {
    /// Checks for an update; `None` when no updater is configured.
    async fn check_for_updates(&self) -> anyhow::Result<Option<UpdateInfo>>;

    /// Checks for an update and lets the updater notify the user.
    async fn check_for_updates_and_notify(&self) -> anyhow::Result<Option<UpdateInfo>>;

    /// Every notification the updater emits.
    fn events(&self) -> Event<UpdateEvent>;
}

/// Serves an [`UpdateService`] as the `update` channel.
pub struct UpdateChannel<S> {
    service: Arc<S>,
}

impl<S: UpdateService> UpdateChannel<S> {
    /// Wraps `service`.
    pub fn new(service: Arc<S>) -> Self {
        Self { service }
    }
}

#[async_trait]
impl<S: UpdateService> ServerChannel for UpdateChannel<S> {
    async fn call(&self, ctx: ConnectionId, command: &str, _arg: Value) -> Result<Value, ChannelError> {
        let command: UpdateCommand = command.parse()?;
        tracing::debug!(target: "splithost::update", %ctx, command = command.as_str(), "update request");

        let outcome = match command {
            UpdateCommand::CheckForUpdates => self.service.check_for_updates().await,
            UpdateCommand::CheckForUpdatesAndNotify => self.service.check_for_updates_and_notify().await,
        };
        match outcome {
            Ok(info) => Ok(serde_json::to_value(info)?),
            Err(err) => {
                tracing::warn!(target: "splithost::update", error = %format!("{err:#}"), "update check failed");
                Err(ChannelError::Remote {
                    message: format!("{err:#}"),
                })
            }
        }
    }

    fn listen(&self, _ctx: ConnectionId, event: &str, _arg: Value) -> Result<Event<Value>, ChannelError> {
        let kind: UpdateEventKind = event.parse()?;
        Ok(self
            .service
            .events()
            .filter(move |event| event.kind() == kind)
            .map(UpdateEvent::payload))
    }
}

/// Caller-side view of the `update` channel.
#[derive(Debug, Clone)]
pub struct UpdateClient {
    channel: Channel,
}

impl UpdateClient {
    /// Wraps a proxy for the `update` channel.
    pub fn new(channel: Channel) -> Self {
        Self { channel }
    }

    /// See [`UpdateService::check_for_updates`].
    pub async fn check_for_updates(&self) -> Result<Option<UpdateInfo>, ChannelError> {
        self.channel
            .call_as(UpdateCommand::CheckForUpdates.as_str(), ())
            .await
    }

    /// See [`UpdateService::check_for_updates_and_notify`].
    pub async fn check_for_updates_and_notify(&self) -> Result<Option<UpdateInfo>, ChannelError> {
        self.channel
            .call_as(UpdateCommand::CheckForUpdatesAndNotify.as_str(), ())
            .await
    }

    /// Streams one kind of update event.
    pub fn on(&self, kind: UpdateEventKind) -> Event<Result<UpdateEvent, ChannelError>> {
        self.channel
            .listen(kind.as_str(), Value::Null)
            .map(move |item| item.clone().and_then(|payload| UpdateEvent::from_parts(kind, payload)))
    }
}

/// Merges a native updater's six named events into one [`UpdateEvent`] stream.
///
/// Payloads that do not decode surface as [`UpdateEvent::Error`].
pub fn native_update_events<S>(updater: Arc<S>) -> Event<UpdateEvent>
where
    S: ExternalSource<Value>,
{
    Event::any(UpdateEventKind::ALL.into_iter().map(|kind| {
        Event::from_source(Arc::clone(&updater), kind.native_name(), move |payload: &Value| {
            UpdateEvent::from_parts(kind, payload.clone()).unwrap_or_else(|err| UpdateEvent::Error(err.to_string()))
        })
    }))
}
