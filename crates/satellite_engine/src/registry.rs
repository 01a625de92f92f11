//! Process registry.
//!
//! Holds at most one running satellite per database name. Starting is
//! single-flight: concurrent callers of [`Registry::ensure_started`] for the
//! same name share one construction and one `start`.

use crate::error::{SatelliteError, SatelliteResult};
use crate::process::Satellite;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};

type Slot = Arc<OnceCell<Arc<dyn Satellite>>>;

/// Satellites by database name.
#[derive(Default)]
pub struct Registry {
    processes: Mutex<HashMap<String, Slot>>,
}

impl Registry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds an already started satellite under its database name.
    pub fn register(&self, satellite: Arc<dyn Satellite>) -> SatelliteResult<()> {
        let db_name = satellite.db_name().to_string();
        let mut processes = self.processes.lock();
        if processes.contains_key(&db_name) {
            return Err(SatelliteError::AlreadyRunning(db_name));
        }
        debug!(db = %db_name, "registered satellite");
        processes.insert(db_name, Arc::new(OnceCell::from(satellite)));
        Ok(())
    }

    /// Returns the satellite for `db_name`, creating and starting it with
    /// `factory` if none is running.
    ///
    /// If creation or start fails the name is free again and the error is
    /// returned to every caller that was waiting on this attempt.
    pub async fn ensure_started<F>(&self, db_name: &str, factory: F) -> SatelliteResult<Arc<dyn Satellite>>
    where
        F: FnOnce() -> SatelliteResult<Arc<dyn Satellite>>,
    {
        let slot = Arc::clone(
            self.processes
                .lock()
                .entry(db_name.to_string())
                .or_default(),
        );
        let started = slot
            .get_or_try_init(|| async move {
                let satellite = factory()?;
                if satellite.db_name() != db_name {
                    return Err(SatelliteError::DatabaseMismatch {
                        expected: db_name.to_string(),
                        actual: satellite.db_name().to_string(),
                    });
                }
                satellite.start().await?;
                info!(db = %db_name, "satellite registered and started");
                Ok::<_, SatelliteError>(satellite)
            })
            .await;
        match started {
            Ok(satellite) => Ok(Arc::clone(satellite)),
            Err(err) => {
                warn!(db = %db_name, error = %err, "satellite failed to start");
                let mut processes = self.processes.lock();
                let stale = processes
                    .get(db_name)
                    .is_some_and(|current| Arc::ptr_eq(current, &slot) && !current.initialized());
                if stale {
                    processes.remove(db_name);
                }
                Err(err)
            }
        }
    }

    /// The running satellite for `db_name`.
    pub fn get(&self, db_name: &str) -> Option<Arc<dyn Satellite>> {
        self.processes
            .lock()
            .get(db_name)
            .and_then(|slot| slot.get().cloned())
    }

    /// Stops the satellite for `db_name` and frees the name.
    pub async fn stop(&self, db_name: &str) -> SatelliteResult<()> {
        let satellite = self
            .unregister(db_name)
            .ok_or_else(|| SatelliteError::NotRunning(db_name.to_string()))?;
        satellite.stop().await
    }

    /// Frees the name without stopping the satellite.
    pub fn unregister(&self, db_name: &str) -> Option<Arc<dyn Satellite>> {
        let slot = self.processes.lock().remove(db_name)?;
        slot.get().cloned()
    }

    /// Stops every satellite. Returns the first error, after trying all.
    pub async fn shutdown_all(&self) -> SatelliteResult<()> {
        let slots: Vec<(String, Slot)> = self.processes.lock().drain().collect();
        let mut first_error = None;
        for (db_name, slot) in slots {
            let Some(satellite) = slot.get() else { continue };
            if let Err(err) = satellite.stop().await {
                warn!(db = %db_name, error = %err, "failed to stop satellite");
                first_error.get_or_insert(err);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    /// Number of registered names, including ones still starting.
    pub fn len(&self) -> usize {
        self.processes.lock().len()
    }

    /// True when nothing is registered.
    pub fn is_empty(&self) -> bool {
        self.processes.lock().is_empty()
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.processes.lock().keys().cloned().collect();
        names.sort();
        names
    }
}
