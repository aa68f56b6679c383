//! Devices as the work subsystem sees them.
//!
//! Drivers live outside this crate. They register a [`Device`] with what it
//! can hash, ask for work through a [`WorkHandle`], report nonces through
//! [`MiningContext::submit_nonce`] and send heartbeats with
//! [`MiningContext::report_device_alive`].
//!
//! Work requests are messages. A device waiting for work costs one parked
//! task in the work service, never a blocked driver thread.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;

use crate::context::MiningContext;
use crate::goal::Algorithm;
use crate::stats::ShareCounters;
use crate::tracing::prelude::*;
use crate::work::Work;
use crate::work::staging::DeviceCapability;

#[derive(Debug)]
pub struct Device {
    id: usize,
    name: String,
    capability: DeviceCapability,
    threads: usize,
    pub stats: ShareCounters,
    last_alive: Mutex<Instant>,
    works: AtomicU64,
    /// Already reported as silent by the watchdog.
    silent: AtomicBool,
}

impl Device {
    pub fn id(&self) -> usize {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn capability(&self) -> &DeviceCapability {
        &self.capability
    }

    pub fn threads(&self) -> usize {
        self.threads
    }

    /// Work items handed to this device so far.
    pub fn works(&self) -> u64 {
        self.works.load(Ordering::Relaxed)
    }

    pub(crate) fn note_work(&self) {
        self.works.fetch_add(1, Ordering::Relaxed);
        self.heartbeat();
    }

    pub fn heartbeat(&self) {
        *self.last_alive.lock() = Instant::now();
        if self.silent.swap(false, Ordering::Relaxed) {
            info!(device = %self.name, "Device responding again.");
        }
    }

    pub fn silent_for(&self) -> Duration {
        self.last_alive.lock().elapsed()
    }

    /// Flag the device as silent. True only on the first call of a silent
    /// spell.
    pub(crate) fn mark_silent(&self) -> bool {
        !self.silent.swap(true, Ordering::Relaxed)
    }
}

#[derive(Debug, Default)]
pub struct DeviceRegistry {
    devices: RwLock<Vec<Arc<Device>>>,
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &self,
        name: &str,
        capability: DeviceCapability,
        threads: usize,
    ) -> Arc<Device> {
        let mut devices = self.devices.write();
        let device = Arc::new(Device {
            id: devices.len(),
            name: name.to_string(),
            capability,
            threads: threads.max(1),
            stats: ShareCounters::default(),
            last_alive: Mutex::new(Instant::now()),
            works: AtomicU64::new(0),
            silent: AtomicBool::new(false),
        });
        devices.push(device.clone());
        info!(
            device = name,
            id = device.id,
            algorithm = %capability.algorithm,
            threads = device.threads,
            "Device registered."
        );
        device
    }

    pub fn get(&self, id: usize) -> Option<Arc<Device>> {
        self.devices.read().get(id).cloned()
    }

    pub fn all(&self) -> Vec<Arc<Device>> {
        self.devices.read().clone()
    }

    pub fn len(&self) -> usize {
        self.devices.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.read().is_empty()
    }

    /// Mining threads across all devices.
    pub fn thread_count(&self) -> usize {
        self.devices.read().iter().map(|d| d.threads).sum()
    }

    /// Algorithms at least one device hashes, in registration order.
    pub fn algorithms(&self) -> Vec<Algorithm> {
        let mut algorithms = Vec::new();
        for device in self.devices.read().iter() {
            if !algorithms.contains(&device.capability.algorithm) {
                algorithms.push(device.capability.algorithm);
            }
        }
        algorithms
    }

    pub fn heartbeat(&self, id: usize) {
        if let Some(device) = self.get(id) {
            device.heartbeat();
        }
    }
}

/// A device asking for work.
#[derive(Debug)]
pub struct WorkRequest {
    pub device: usize,
    pub reply: oneshot::Sender<Work>,
}

/// The device side of the work service.
#[derive(Debug, Clone)]
pub struct WorkHandle {
    tx: mpsc::Sender<WorkRequest>,
}

impl WorkHandle {
    /// Wait for work. `None` once the service has stopped.
    pub async fn get_work(&self, device: usize) -> Option<Work> {
        let (reply, rx) = oneshot::channel();
        self.tx.send(WorkRequest { device, reply }).await.ok()?;
        rx.await.ok()
    }
}

pub fn work_channel() -> (WorkHandle, mpsc::Receiver<WorkRequest>) {
    let (tx, rx) = mpsc::channel(64);
    (WorkHandle { tx }, rx)
}

/// Answer work requests from the staging queue until shutdown.
pub async fn work_service(ctx: Arc<MiningContext>, mut requests: mpsc::Receiver<WorkRequest>) {
    loop {
        let request = tokio::select! {
            request = requests.recv() => match request {
                Some(request) => request,
                None => break,
            },
            _ = ctx.shutdown.cancelled() => break,
        };
        let Some(device) = ctx.devices.get(request.device) else {
            warn!(device = request.device, "Work request from unknown device.");
            continue;
        };

        let tasks = ctx.tasks.clone();
        let ctx = ctx.clone();
        tasks.spawn(async move {
            let work = tokio::select! {
                work = ctx.pop_work(&device) => work,
                _ = ctx.shutdown.cancelled() => None,
            };
            if let Some(work) = work
                && let Err(mut work) = request.reply.send(work)
            {
                // Requester went away
                work.device = None;
                ctx.stage_work(work);
            }
        });
    }
    debug!("Work service stopped.");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{test_context, work_on};

    #[test]
    fn test_registry_counts() {
        let registry = DeviceRegistry::new();
        registry.register("a", DeviceCapability::new(Algorithm::Sha256d), 4);
        registry.register("b", DeviceCapability::new(Algorithm::Scrypt), 0);
        registry.register("c", DeviceCapability::new(Algorithm::Sha256d), 2);

        assert_eq!(registry.len(), 3);
        assert_eq!(registry.thread_count(), 7, "zero threads counts as one");
        assert_eq!(
            registry.algorithms(),
            vec![Algorithm::Sha256d, Algorithm::Scrypt]
        );
        assert_eq!(registry.get(2).unwrap().name(), "c");
        assert!(registry.get(3).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_silence_tracking() {
        let registry = DeviceRegistry::new();
        let device = registry.register("a", DeviceCapability::new(Algorithm::Sha256d), 1);

        tokio::time::advance(Duration::from_secs(61)).await;
        assert!(device.silent_for() > Duration::from_secs(60));
        assert!(device.mark_silent());
        assert!(!device.mark_silent(), "reported once per spell");

        registry.heartbeat(device.id());
        assert!(device.silent_for() < Duration::from_secs(1));
        assert!(device.mark_silent(), "a new spell after a heartbeat");
    }

    #[tokio::test]
    async fn test_work_service_answers_requests() {
        let ctx = test_context(1);
        let pool = ctx.pools.pool(0).unwrap();
        let device = ctx
            .devices
            .register("dev0", DeviceCapability::new(Algorithm::Sha256d), 1);
        let (handle, rx) = work_channel();
        let service = tokio::spawn(work_service(ctx.clone(), rx));

        let waiter = tokio::spawn({
            let handle = handle.clone();
            let id = device.id();
            async move { handle.get_work(id).await }
        });
        tokio::task::yield_now().await;

        let work = work_on(&ctx, &pool, [1u8; 32]);
        let id = work.id();
        ctx.stage_work(work);

        let got = waiter.await.unwrap().unwrap();
        assert_eq!(got.id(), id);
        assert_eq!(got.device, Some(device.id()));
        assert_eq!(device.works(), 1);

        ctx.shutdown.cancel();
        service.await.unwrap();
        assert!(handle.get_work(device.id()).await.is_none());
    }
}
