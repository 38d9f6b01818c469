//! Audio input device registry.
//!
//! Holds the last enumerated device list as an immutable snapshot and the
//! currently selected device id. Enumeration replaces the snapshot
//! wholesale; readers holding an older snapshot keep seeing it unchanged.

use std::sync::Arc;

use parking_lot::RwLock;
use serde::Serialize;
use tracing::{debug, info, warn};

use super::capture::CaptureProvider;
use crate::error::SessionError;

/// One audio input device as reported by the capture provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AudioDevice {
    pub id: String,
    pub label: String,
}

impl AudioDevice {
    pub fn new(id: impl Into<String>, label: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            label: label.into(),
        }
    }
}

/// Immutable, cheaply cloneable view of one enumeration.
///
/// Iterating is lazy and can be restarted any number of times.
#[derive(Debug, Clone, Default)]
pub struct DeviceSnapshot(Arc<[AudioDevice]>);

impl DeviceSnapshot {
    pub fn iter(&self) -> std::slice::Iter<'_, AudioDevice> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.0.iter().any(|d| d.id == id)
    }

    pub fn first(&self) -> Option<&AudioDevice> {
        self.0.first()
    }

    pub fn to_vec(&self) -> Vec<AudioDevice> {
        self.0.to_vec()
    }
}

impl<'a> IntoIterator for &'a DeviceSnapshot {
    type Item = &'a AudioDevice;
    type IntoIter = std::slice::Iter<'a, AudioDevice>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

fn list_or_empty(provider: &dyn CaptureProvider) -> Vec<AudioDevice> {
    match provider.input_devices() {
        Ok(devices) => devices,
        Err(e) => {
            warn!("Input device enumeration failed: {}", e);
            Vec::new()
        }
    }
}

#[derive(Debug, Default)]
struct RegistryInner {
    devices: DeviceSnapshot,
    selected: Option<String>,
}

/// Tracks the available input devices and the selected one.
#[derive(Debug, Default)]
pub struct DeviceRegistry {
    inner: RwLock<RegistryInner>,
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enumerate devices from the provider and replace the current list.
    ///
    /// Failure (permission denied, no audio host) yields an empty list.
    pub fn enumerate(&self, provider: &dyn CaptureProvider) -> DeviceSnapshot {
        self.install(list_or_empty(provider), false)
    }

    /// Like [`enumerate`](Self::enumerate) but never touches the selection.
    /// Used while a session holds the selected device.
    pub fn enumerate_locked(&self, provider: &dyn CaptureProvider) -> DeviceSnapshot {
        self.install(list_or_empty(provider), true)
    }

    /// Install a new device list.
    ///
    /// Blank labels become "Microphone N". The selection survives if its id
    /// is still present, otherwise it moves to the first device (or clears
    /// when the list is empty).
    pub fn replace(&self, devices: Vec<AudioDevice>) -> DeviceSnapshot {
        self.install(devices, false)
    }

    fn install(&self, devices: Vec<AudioDevice>, selection_locked: bool) -> DeviceSnapshot {
        let devices: Vec<AudioDevice> = devices
            .into_iter()
            .enumerate()
            .map(|(i, mut d)| {
                if d.label.trim().is_empty() {
                    d.label = format!("Microphone {}", i + 1);
                }
                d
            })
            .collect();
        let snapshot = DeviceSnapshot(devices.into());

        let mut inner = self.inner.write();
        let keep = inner
            .selected
            .as_deref()
            .map(|id| snapshot.contains(id))
            .unwrap_or(false);
        if !keep && !selection_locked {
            inner.selected = snapshot.first().map(|d| d.id.clone());
        }
        inner.devices = snapshot.clone();

        info!(
            count = snapshot.len(),
            selected = ?inner.selected,
            "Input devices enumerated"
        );
        snapshot
    }

    /// The last enumerated list.
    pub fn devices(&self) -> DeviceSnapshot {
        self.inner.read().devices.clone()
    }

    pub fn selected(&self) -> Option<String> {
        self.inner.read().selected.clone()
    }

    /// Select a device by id.
    ///
    /// With an empty device list any request clears the selection.
    pub fn select(&self, id: &str) -> Result<(), SessionError> {
        let mut inner = self.inner.write();
        if inner.devices.is_empty() {
            debug!(id, "No devices enumerated, clearing selection");
            inner.selected = None;
            return Ok(());
        }
        if !inner.devices.contains(id) {
            return Err(SessionError::InvalidDevice(id.to_string()));
        }
        inner.selected = Some(id.to_string());
        info!(device = id, "Input device selected");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::capture::{CaptureStream, FrameSink};

    struct ListOnly(anyhow::Result<Vec<AudioDevice>>);

    impl CaptureProvider for ListOnly {
        fn input_devices(&self) -> anyhow::Result<Vec<AudioDevice>> {
            match &self.0 {
                Ok(list) => Ok(list.clone()),
                Err(e) => Err(anyhow::anyhow!("{e}")),
            }
        }

        fn open(
            &self,
            _device_id: Option<&str>,
            _sink: FrameSink,
        ) -> anyhow::Result<Box<dyn CaptureStream>> {
            anyhow::bail!("not used")
        }
    }

    fn ab() -> Vec<AudioDevice> {
        vec![AudioDevice::new("a", "Desk mic"), AudioDevice::new("b", "Headset")]
    }

    #[test]
    fn test_select_unknown_rejected_known_accepted() {
        let registry = DeviceRegistry::new();
        registry.replace(ab());
        assert_eq!(registry.selected().as_deref(), Some("a"));

        let err = registry.select("c").unwrap_err();
        assert_eq!(err, SessionError::InvalidDevice("c".into()));
        assert_eq!(registry.selected().as_deref(), Some("a"));

        registry.select("b").unwrap();
        assert_eq!(registry.selected().as_deref(), Some("b"));
    }

    #[test]
    fn test_select_on_empty_list_clears_selection() {
        let registry = DeviceRegistry::new();
        registry.replace(ab());
        registry.replace(Vec::new());
        assert_eq!(registry.selected(), None);
        registry.select("anything").unwrap();
        assert_eq!(registry.selected(), None);
    }

    #[test]
    fn test_enumeration_failure_yields_empty_list() {
        let registry = DeviceRegistry::new();
        registry.replace(ab());
        let snapshot = registry.enumerate(&ListOnly(Err(anyhow::anyhow!("permission denied"))));
        assert!(snapshot.is_empty());
        assert!(registry.devices().is_empty());
        assert_eq!(registry.selected(), None);
    }

    #[test]
    fn test_blank_labels_get_positional_names() {
        let registry = DeviceRegistry::new();
        let snapshot = registry.enumerate(&ListOnly(Ok(vec![
            AudioDevice::new("x", ""),
            AudioDevice::new("y", "USB"),
            AudioDevice::new("z", "  "),
        ])));
        let labels: Vec<&str> = snapshot.iter().map(|d| d.label.as_str()).collect();
        assert_eq!(labels, vec!["Microphone 1", "USB", "Microphone 3"]);
    }

    #[test]
    fn test_selection_survives_reenumeration_when_present() {
        let registry = DeviceRegistry::new();
        registry.replace(ab());
        registry.select("b").unwrap();
        registry.replace(vec![AudioDevice::new("b", "Headset"), AudioDevice::new("d", "Dock")]);
        assert_eq!(registry.selected().as_deref(), Some("b"));

        registry.replace(vec![AudioDevice::new("d", "Dock")]);
        assert_eq!(registry.selected().as_deref(), Some("d"));
    }

    #[test]
    fn test_locked_enumeration_keeps_selection() {
        let registry = DeviceRegistry::new();
        registry.replace(ab());
        registry.select("b").unwrap();
        registry.enumerate_locked(&ListOnly(Ok(vec![AudioDevice::new("a", "Desk mic")])));
        assert_eq!(registry.devices().len(), 1);
        assert_eq!(registry.selected().as_deref(), Some("b"));
    }

    #[test]
    fn test_snapshot_is_restartable_and_isolated() {
        let registry = DeviceRegistry::new();
        let old = registry.replace(ab());
        registry.replace(vec![AudioDevice::new("d", "Dock")]);

        let first: Vec<_> = old.iter().map(|d| d.id.clone()).collect();
        let second: Vec<_> = (&old).into_iter().map(|d| d.id.clone()).collect();
        assert_eq!(first, vec!["a", "b"]);
        assert_eq!(first, second);
        assert_eq!(registry.devices().len(), 1);
    }
}
