//! Ownership of the process-wide generative pipeline.
//!
//! The pipeline is built at most once and lives inside a mutex owned by
//! [`ModelManager`]. [`ModelManager::acquire`] hands out a [`PipelineLease`],
//! an exclusive guard over the loaded handle, so the acquire-then-infer
//! sequence of concurrent requests is serialized and a second construction
//! can never race the first. A failed load leaves the slot empty and the
//! next `acquire` retries from scratch.

use std::ops::{Deref, DerefMut};
use std::sync::{Mutex, MutexGuard, PoisonError, RwLock};
use std::time::Instant;

use anyhow::{Context, Result};
use serde::Serialize;
use tracing::{error, info};

use crate::{
    preferred_device_kind, select_best_device, DeviceKind, DeviceMap, ExecutionProfile,
    GenerateError, Loader, Pipeline, PipelineCall, PipelineOutput,
};

/// The loaded pipeline together with the execution profile it was built for.
pub struct PipelineHandle {
    pipeline: Box<dyn Pipeline>,
    profile: ExecutionProfile,
    load_id: u64,
}

impl PipelineHandle {
    pub fn profile(&self) -> &ExecutionProfile {
        &self.profile
    }

    /// Sequence number of the load that produced this handle.
    pub fn load_id(&self) -> u64 {
        self.load_id
    }

    pub fn run(&mut self, call: PipelineCall<'_>) -> Result<PipelineOutput> {
        self.pipeline.run(call)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineState {
    Absent,
    Loading,
    Ready,
    LoadFailed,
}

/// Snapshot for health reporting. Readable while an inference holds the lease.
#[derive(Clone, Debug, Serialize)]
pub struct ManagerStatus {
    pub state: PipelineState,
    pub device: DeviceKind,
    pub load_attempts: u64,
    pub last_error: Option<String>,
}

impl ManagerStatus {
    pub fn is_loaded(&self) -> bool {
        self.state == PipelineState::Ready
    }
}

pub struct ModelManager {
    loader: Box<dyn Loader>,
    device_map: DeviceMap,
    slot: Mutex<Option<PipelineHandle>>,
    status: RwLock<ManagerStatus>,
}

/// Exclusive access to the loaded pipeline; other requests queue until it drops.
pub struct PipelineLease<'a> {
    guard: MutexGuard<'a, Option<PipelineHandle>>,
}

impl Deref for PipelineLease<'_> {
    type Target = PipelineHandle;

    fn deref(&self) -> &PipelineHandle {
        match self.guard.as_ref() {
            Some(handle) => handle,
            None => unreachable!("lease is only created over a loaded pipeline"),
        }
    }
}

impl DerefMut for PipelineLease<'_> {
    fn deref_mut(&mut self) -> &mut PipelineHandle {
        match self.guard.as_mut() {
            Some(handle) => handle,
            None => unreachable!("lease is only created over a loaded pipeline"),
        }
    }
}

/// Marks an interrupted load as failed, so a loader panic never leaves
/// the status stuck at `Loading`.
struct LoadingStatus<'a>(&'a RwLock<ManagerStatus>);

impl Drop for LoadingStatus<'_> {
    fn drop(&mut self) {
        let mut status = self.0.write().unwrap_or_else(PoisonError::into_inner);
        if status.state == PipelineState::Loading {
            status.state = PipelineState::LoadFailed;
            status.last_error = Some("pipeline load was interrupted".to_string());
        }
    }
}

impl ModelManager {
    pub fn new(loader: impl Loader + 'static, device_map: DeviceMap) -> Self {
        let status = ManagerStatus {
            state: PipelineState::Absent,
            device: preferred_device_kind(device_map),
            load_attempts: 0,
            last_error: None,
        };
        Self {
            loader: Box::new(loader),
            device_map,
            slot: Mutex::new(None),
            status: RwLock::new(status),
        }
    }

    /// Returns the loaded pipeline, building it first if needed.
    ///
    /// Blocks while another caller holds the lease or is loading.
    pub fn acquire(&self) -> Result<PipelineLease<'_>, GenerateError> {
        let mut guard = self.slot.lock().unwrap_or_else(PoisonError::into_inner);
        if guard.is_none() {
            let handle = self.load().map_err(|e| {
                let message = format!("{e:#}");
                error!("failed to load pipeline: {message}");
                self.update_status(|s| {
                    s.state = PipelineState::LoadFailed;
                    s.last_error = Some(message.clone());
                });
                GenerateError::ModelUnavailable(message)
            })?;
            *guard = Some(handle);
        }
        Ok(PipelineLease { guard })
    }

    pub fn status(&self) -> ManagerStatus {
        self.status
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn is_loaded(&self) -> bool {
        self.status().is_loaded()
    }

    fn load(&self) -> Result<PipelineHandle> {
        let mut load_id = 0;
        self.update_status(|s| {
            s.state = PipelineState::Loading;
            s.load_attempts += 1;
            load_id = s.load_attempts;
        });
        let _loading = LoadingStatus(&self.status);

        let device = select_best_device(self.device_map).context("failed to set up device")?;
        let profile = ExecutionProfile::for_device(device);
        info!(
            device = %profile.kind,
            dtype = ?profile.dtype,
            attention_slicing = profile.attention_slicing,
            latent_slicing = profile.latent_slicing,
            "loading pipeline (attempt {load_id})"
        );
        if !profile.kind.is_accelerator() {
            info!("running on CPU, generation will be slow");
        }

        let start = Instant::now();
        let pipeline = self.loader.load(&profile)?;
        info!("pipeline loaded in {:.1}s", start.elapsed().as_secs_f64());

        self.update_status(|s| {
            s.state = PipelineState::Ready;
            s.device = profile.kind;
            s.last_error = None;
        });
        Ok(PipelineHandle {
            pipeline,
            profile,
            load_id,
        })
    }

    fn update_status(&self, f: impl FnOnce(&mut ManagerStatus)) {
        let mut status = self.status.write().unwrap_or_else(PoisonError::into_inner);
        f(&mut status);
    }
}
