//! The set of connected boards.

use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::time::Duration;

use parking_lot::Mutex;

use crate::config::{BoardConfig, DEFAULT_SECTION};
use crate::device::Device;
use crate::transport::{NetworkLink, NetworkOptions, SerialLink, SerialOptions};
use crate::{Error, Result};

#[derive(Debug, Default)]
struct Inner {
    devices: Vec<Arc<Device>>,
    default: Option<Arc<Device>>,
}

/// Connected devices in connection order, plus a default device.
///
/// No two devices share a name. The registry is owned by the caller and
/// passed by reference; every lookup and mutation takes one lock.
#[derive(Debug)]
pub struct ConnectionRegistry {
    inner: Mutex<Inner>,
    config: Arc<dyn BoardConfig>,
}

impl ConnectionRegistry {
    /// Creates an empty registry whose devices share `config`.
    pub fn new(config: Arc<dyn BoardConfig>) -> Self {
        Self {
            inner: Mutex::default(),
            config,
        }
    }

    /// Board configuration handed to new devices.
    pub fn config(&self) -> &Arc<dyn BoardConfig> {
        &self.config
    }

    /// Adds a connected device.
    ///
    /// A device already registered on the same link is replaced. A name
    /// taken by another device gets a `-2`, `-3`… suffix. The first device
    /// added becomes the default.
    pub fn add(&self, mut device: Device) -> Arc<Device> {
        let mut inner = self.inner.lock();

        let stale = inner
            .devices
            .iter()
            .position(|d| d.endpoint().same_link(device.endpoint()))
            .map(|pos| inner.devices.remove(pos));
        if let Some(stale) = &stale {
            tracing::debug!(board = stale.name(), endpoint = %stale.endpoint(), "replacing");
            if inner.default.as_ref().is_some_and(|d| Arc::ptr_eq(d, stale)) {
                inner.default = None;
            }
        }

        let taken = |name: &str| inner.devices.iter().any(|d| d.name() == name);
        if taken(device.name()) {
            let base = device.name().to_owned();
            let name = (2..)
                .map(|n| format!("{base}-{n}"))
                .find(|candidate| !taken(candidate.as_str()))
                .unwrap_or(base);
            tracing::info!(board = %name, "name already in use, renamed");
            device.set_name(name);
        }

        let device = Arc::new(device);
        inner.devices.push(Arc::clone(&device));
        if inner.default.is_none() {
            inner.default = Some(Arc::clone(&device));
        }
        drop(inner);

        // Outside the registry lock: a call in flight may hold the device.
        if let Some(stale) = stale {
            stale.close();
        }
        device
    }

    /// Looks a device up by name; the empty name means the default device.
    pub fn find_by_name(&self, name: &str) -> Option<Arc<Device>> {
        let inner = self.inner.lock();
        if name.is_empty() {
            return inner.default.clone();
        }
        inner.devices.iter().find(|d| d.name() == name).cloned()
    }

    /// Looks a device up by serial path, host name or IP address.
    pub fn find_by_endpoint(&self, id: &str) -> Option<Arc<Device>> {
        self.inner
            .lock()
            .devices
            .iter()
            .find(|d| d.endpoint().matches(id))
            .cloned()
    }

    /// Drops `device` from the registry, clearing the default if it was it.
    /// Returns `false` if it was not registered.
    pub fn remove(&self, device: &Arc<Device>) -> bool {
        let mut inner = self.inner.lock();
        let before = inner.devices.len();
        inner.devices.retain(|d| !Arc::ptr_eq(d, device));
        if inner.default.as_ref().is_some_and(|d| Arc::ptr_eq(d, device)) {
            inner.default = None;
        }
        inner.devices.len() != before
    }

    /// Number of registered devices.
    pub fn count(&self) -> usize {
        self.inner.lock().devices.len()
    }

    /// Registered devices in connection order.
    pub fn list(&self) -> Vec<Arc<Device>> {
        self.inner.lock().devices.clone()
    }

    /// The default device, if any.
    pub fn default_device(&self) -> Option<Arc<Device>> {
        self.inner.lock().default.clone()
    }

    /// Makes the device called `name` the default.
    pub fn set_default(&self, name: &str) -> Result<Arc<Device>> {
        let mut inner = self.inner.lock();
        let device = inner
            .devices
            .iter()
            .find(|d| d.name() == name)
            .cloned()
            .ok_or(Error::NoDevice)?;
        inner.default = Some(Arc::clone(&device));
        Ok(device)
    }

    /// Opens the serial port at `path` and registers the board behind it.
    ///
    /// Baud rate and the time to wait for the port come from the default
    /// configuration section. Setting `abort` gives up waiting.
    pub fn connect_serial(&self, path: &str, abort: Option<Arc<AtomicBool>>) -> Result<Arc<Device>> {
        tracing::info!("connecting to {path}");
        let cfg = self.config.as_ref();
        let baud = cfg.get_u64(DEFAULT_SECTION, "baudrate", 115_200);
        let wait = cfg.get_u64(DEFAULT_SECTION, "wait", 0);
        let mut opts = SerialOptions::new(u32::try_from(baud).unwrap_or(115_200))
            .wait(Duration::from_secs(wait));
        if let Some(flag) = abort {
            opts = opts.abort(flag);
        }
        let link = SerialLink::open(path, &opts)?;
        let device = Device::open(Box::new(link), Arc::clone(&self.config), DEFAULT_SECTION)?;
        Ok(self.add(device))
    }

    /// Logs into the telnet server at `host` and registers the board.
    ///
    /// Credentials come from the default configuration section.
    pub fn connect_network(&self, host: &str) -> Result<Arc<Device>> {
        tracing::info!("connecting to telnet://{host}");
        let cfg = self.config.as_ref();
        let defaults = NetworkOptions::default();
        let opts = NetworkOptions {
            user: cfg.get_str(DEFAULT_SECTION, "user", &defaults.user),
            password: cfg.get_str(DEFAULT_SECTION, "password", &defaults.password),
            ..defaults
        };
        let link = NetworkLink::open(host, &opts)?;
        let device = Device::open(Box::new(link), Arc::clone(&self.config), DEFAULT_SECTION)?;
        Ok(self.add(device))
    }

    /// Splits `path` into the device it lives on and the path on that
    /// device. Local paths yield `None`.
    ///
    /// Paths under a root directory of the default device (`/flash/…`)
    /// belong to it; `/<name>/…` routes to the device called `name`.
    pub fn resolve_path(&self, path: &str) -> (Option<Arc<Device>>, String) {
        let inner = self.inner.lock();
        if let Some(dev) = inner.default.as_ref().filter(|d| d.is_root_path(path)) {
            return (Some(Arc::clone(dev)), path.to_owned());
        }
        let probe = format!("{path}/");
        for dev in &inner.devices {
            let prefix = dev.name_path();
            if probe.starts_with(&prefix) {
                let rest = &path[prefix.len() - 1..];
                let rest = if rest.is_empty() { "/" } else { rest };
                return (Some(Arc::clone(dev)), rest.to_owned());
            }
        }
        (None, path.to_owned())
    }
}
