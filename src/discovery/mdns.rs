use super::{MASTER_SERVICE_TYPE, WORKER_SERVICE_TYPE, local_ipv4};
use crate::error::DiscoveryError;
use mdns_sd::{ServiceDaemon, ServiceEvent, ServiceInfo};
use std::collections::HashMap;
use std::time::Duration;

/// Holds the mDNS daemon and registration for as long as the master
/// advertises its presence. Dropping or calling `stop` unregisters it.
pub struct MasterAdvertiser {
    daemon: ServiceDaemon,
    fullname: String,
}

impl MasterAdvertiser {
    pub fn start(id: &str, name: &str, base_url: &str, port: u16) -> Result<Self, DiscoveryError> {
        let daemon = ServiceDaemon::new()?;
        let ip = local_ipv4()?;
        let host = format!("{id}.local.");
        let mut properties = HashMap::new();
        properties.insert("id".to_string(), id.to_string());
        properties.insert("name".to_string(), name.to_string());
        properties.insert("base_url".to_string(), base_url.to_string());

        let info = ServiceInfo::new(MASTER_SERVICE_TYPE, id, &host, ip, port, Some(properties))?
            .enable_addr_auto();
        let fullname = info.get_fullname().to_string();
        daemon.register(info)?;
        tracing::info!(%fullname, %base_url, "advertising master over mDNS");
        Ok(Self { daemon, fullname })
    }

    pub fn stop(self) -> Result<(), DiscoveryError> {
        self.daemon.unregister(&self.fullname).map_err(DiscoveryError::from)?;
        self.daemon.shutdown()?;
        Ok(())
    }
}

/// Worker-side counterpart: advertises this worker under
/// `_ffarm._tcp.local.` with the same `id`/`name`/`base_url` TXT shape.
pub struct WorkerAdvertiser {
    daemon: ServiceDaemon,
    fullname: String,
}

impl WorkerAdvertiser {
    pub fn start(id: &str, name: &str, base_url: &str, port: u16) -> Result<Self, DiscoveryError> {
        let daemon = ServiceDaemon::new()?;
        let ip = local_ipv4()?;
        let host = format!("{id}.local.");
        let mut properties = HashMap::new();
        properties.insert("id".to_string(), id.to_string());
        properties.insert("name".to_string(), name.to_string());
        properties.insert("base_url".to_string(), base_url.to_string());

        let info = ServiceInfo::new(WORKER_SERVICE_TYPE, id, &host, ip, port, Some(properties))?
            .enable_addr_auto();
        let fullname = info.get_fullname().to_string();
        daemon.register(info)?;
        Ok(Self { daemon, fullname })
    }

    pub fn stop(self) -> Result<(), DiscoveryError> {
        self.daemon.unregister(&self.fullname).map_err(DiscoveryError::from)?;
        self.daemon.shutdown()?;
        Ok(())
    }
}

/// One-shot convenience wrapper matching `WorkerAdvertiser::start`, for
/// callers that only need a guard to hold and drop at shutdown.
pub fn advertise_worker(id: &str, name: &str, base_url: &str, port: u16) -> Result<WorkerAdvertiser, DiscoveryError> {
    WorkerAdvertiser::start(id, name, base_url, port)
}

/// Browse for a master advertisement, returning its `base_url` from the
/// first response seen within `timeout`, or `None` if nothing answers.
/// Mirrors the reference implementation's `discover_master(timeout=10.0)`.
pub fn discover_master(timeout: Duration) -> Result<Option<String>, DiscoveryError> {
    let daemon = ServiceDaemon::new()?;
    let receiver = daemon.browse(MASTER_SERVICE_TYPE)?;
    let deadline = std::time::Instant::now() + timeout;

    let result = loop {
        let remaining = deadline.saturating_duration_since(std::time::Instant::now());
        if remaining.is_zero() {
            break None;
        }
        match receiver.recv_timeout(remaining) {
            Ok(ServiceEvent::ServiceResolved(info)) => {
                if let Some(base_url) = info.get_property_val_str("base_url") {
                    break Some(base_url.to_string());
                }
            }
            Ok(_) => continue,
            Err(_) => break None,
        }
    };

    let _ = daemon.stop_browse(MASTER_SERVICE_TYPE);
    let _ = daemon.shutdown();
    Ok(result)
}
