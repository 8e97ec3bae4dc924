//! Local media devices
//!
//! Capture devices are exclusive: a second acquisition of a held microphone
//! or camera fails fast with [`MediaError::DeviceBusy`]. Sessions hold their
//! devices through a [`MediaGuard`], which releases them exactly once,
//! either explicitly or on drop.

use crate::types::MediaConstraints;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use uuid::Uuid;

/// Media-related errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MediaError {
    /// Device held by another session or application
    #[error("Device busy: {0}")]
    DeviceBusy(String),

    /// Device not found
    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    /// Access refused by the platform
    #[error("Permission denied: {0}")]
    PermissionDenied(String),
}

/// Kind of media device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceKind {
    /// Audio input
    Microphone,
    /// Audio output
    Speaker,
    /// Video input
    Camera,
}

impl DeviceKind {
    /// Capture devices can only be held by one session at a time
    pub fn is_capture(self) -> bool {
        matches!(self, Self::Microphone | Self::Camera)
    }
}

impl fmt::Display for DeviceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Microphone => "microphone",
            Self::Speaker => "speaker",
            Self::Camera => "camera",
        };
        f.write_str(s)
    }
}

/// Media device
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceInfo {
    /// Device identifier
    pub id: String,
    /// Device name
    pub name: String,
    /// Kind
    pub kind: DeviceKind,
    /// Used when constraints name no device of this kind
    pub is_default: bool,
}

/// Devices held for one session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaHandle {
    /// Handle identifier
    pub id: Uuid,
    /// Microphone in use
    pub audio_input: Option<String>,
    /// Speaker in use
    pub audio_output: Option<String>,
    /// Camera in use
    pub video_input: Option<String>,
}

impl MediaHandle {
    /// Capture device ids this handle holds
    pub fn capture_devices(&self) -> impl Iterator<Item = &str> {
        self.audio_input
            .as_deref()
            .into_iter()
            .chain(self.video_input.as_deref())
    }
}

/// Host device access
///
/// `release` is synchronous so it can run from [`MediaGuard`]'s `Drop`.
#[async_trait]
pub trait MediaDevices: Send + Sync + 'static {
    /// List available devices
    ///
    /// # Errors
    ///
    /// Returns error if the platform refuses enumeration.
    async fn enumerate(&self) -> Result<Vec<DeviceInfo>, MediaError>;

    /// Open the devices `constraints` ask for
    ///
    /// # Errors
    ///
    /// Returns `DeviceBusy` if a capture device is already held and
    /// `DeviceNotFound` if a named device does not exist.
    async fn acquire(&self, constraints: &MediaConstraints) -> Result<MediaHandle, MediaError>;

    /// Close the devices behind `handle`
    fn release(&self, handle: &MediaHandle);
}

/// Holds a [`MediaHandle`] and releases it exactly once
pub struct MediaGuard {
    devices: Arc<dyn MediaDevices>,
    handle: Option<MediaHandle>,
}

impl MediaGuard {
    /// Acquire devices for `constraints`
    ///
    /// # Errors
    ///
    /// Propagates the device layer's error.
    pub async fn acquire(
        devices: Arc<dyn MediaDevices>,
        constraints: &MediaConstraints,
    ) -> Result<Self, MediaError> {
        let handle = devices.acquire(constraints).await?;
        tracing::debug!(handle = %handle.id, "Media acquired");
        Ok(Self {
            devices,
            handle: Some(handle),
        })
    }

    /// Held handle, until released
    pub fn handle(&self) -> Option<&MediaHandle> {
        self.handle.as_ref()
    }

    /// Devices still held
    pub fn is_held(&self) -> bool {
        self.handle.is_some()
    }

    /// Release now; returns false if already released
    pub fn release(&mut self) -> bool {
        match self.handle.take() {
            Some(handle) => {
                self.devices.release(&handle);
                tracing::debug!(handle = %handle.id, "Media released");
                true
            }
            None => false,
        }
    }
}

impl Drop for MediaGuard {
    fn drop(&mut self) {
        self.release();
    }
}

impl fmt::Debug for MediaGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MediaGuard")
            .field("handle", &self.handle)
            .finish_non_exhaustive()
    }
}

#[cfg(feature = "simulation")]
pub use simulated::SimulatedDevices;

#[cfg(feature = "simulation")]
mod simulated {
    use super::*;
    use parking_lot::Mutex;
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// In-process device set with exclusive capture devices
    #[derive(Debug)]
    pub struct SimulatedDevices {
        devices: Vec<DeviceInfo>,
        held: Mutex<HashSet<String>>,
        acquisitions: AtomicUsize,
        releases: AtomicUsize,
    }

    impl SimulatedDevices {
        /// One default microphone, speaker and camera
        pub fn new() -> Self {
            Self::with_devices(vec![
                DeviceInfo {
                    id: "mic-0".to_string(),
                    name: "Built-in Microphone".to_string(),
                    kind: DeviceKind::Microphone,
                    is_default: true,
                },
                DeviceInfo {
                    id: "spk-0".to_string(),
                    name: "Built-in Speaker".to_string(),
                    kind: DeviceKind::Speaker,
                    is_default: true,
                },
                DeviceInfo {
                    id: "cam-0".to_string(),
                    name: "Built-in Camera".to_string(),
                    kind: DeviceKind::Camera,
                    is_default: true,
                },
            ])
        }

        /// Custom device set
        pub fn with_devices(devices: Vec<DeviceInfo>) -> Self {
            Self {
                devices,
                held: Mutex::new(HashSet::new()),
                acquisitions: AtomicUsize::new(0),
                releases: AtomicUsize::new(0),
            }
        }

        /// Capture devices currently held
        pub fn held_count(&self) -> usize {
            self.held.lock().len()
        }

        /// Successful acquisitions so far
        pub fn acquisition_count(&self) -> usize {
            self.acquisitions.load(Ordering::SeqCst)
        }

        /// Handle releases so far
        pub fn release_count(&self) -> usize {
            self.releases.load(Ordering::SeqCst)
        }

        fn resolve(
            &self,
            kind: DeviceKind,
            requested: Option<&str>,
        ) -> Result<Option<String>, MediaError> {
            let found = match requested {
                Some(id) => self.devices.iter().find(|d| d.kind == kind && d.id == id),
                None => self
                    .devices
                    .iter()
                    .find(|d| d.kind == kind && d.is_default)
                    .or_else(|| self.devices.iter().find(|d| d.kind == kind)),
            };
            match (found, requested) {
                (Some(device), _) => Ok(Some(device.id.clone())),
                (None, Some(id)) => Err(MediaError::DeviceNotFound(id.to_string())),
                (None, None) => Err(MediaError::DeviceNotFound(format!("no {kind}"))),
            }
        }
    }

    impl Default for SimulatedDevices {
        fn default() -> Self {
            Self::new()
        }
    }

    #[async_trait]
    impl MediaDevices for SimulatedDevices {
        async fn enumerate(&self) -> Result<Vec<DeviceInfo>, MediaError> {
            Ok(self.devices.clone())
        }

        async fn acquire(&self, constraints: &MediaConstraints) -> Result<MediaHandle, MediaError> {
            let (audio_input, audio_output) = if constraints.has_audio() {
                (
                    self.resolve(DeviceKind::Microphone, constraints.audio_input.as_deref())?,
                    self.resolve(DeviceKind::Speaker, constraints.audio_output.as_deref())?,
                )
            } else {
                (None, None)
            };
            let video_input = if constraints.has_video() {
                self.resolve(DeviceKind::Camera, constraints.video_input.as_deref())?
            } else {
                None
            };

            let handle = MediaHandle {
                id: Uuid::new_v4(),
                audio_input,
                audio_output,
                video_input,
            };

            let mut held = self.held.lock();
            if let Some(busy) = handle.capture_devices().find(|id| held.contains(*id)) {
                return Err(MediaError::DeviceBusy(busy.to_string()));
            }
            held.extend(handle.capture_devices().map(str::to_string));
            self.acquisitions.fetch_add(1, Ordering::SeqCst);
            Ok(handle)
        }

        fn release(&self, handle: &MediaHandle) {
            let mut held = self.held.lock();
            for id in handle.capture_devices() {
                held.remove(id);
            }
            self.releases.fetch_add(1, Ordering::SeqCst);
        }
    }
}
