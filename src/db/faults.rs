//! Deterministic failure injection at named storage points.
//!
//! Nothing fires unless a fault has been armed, so production code pays one
//! uncontended lock per check.

use std::os::raw::c_int;
use std::sync::{Arc, Mutex};

use rusqlite::ffi;
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FaultPoint {
    Open,
    QuickCheck,
    RecipeRead,
    RecipeWrite,
    IngredientDelete,
    IngredientInsert,
    BackupCopy,
}

#[derive(Debug, Clone)]
struct ArmedFault {
    point: FaultPoint,
    skip: usize,
    code: c_int,
}

#[derive(Debug, Clone, Default)]
pub struct FaultInjector {
    armed: Arc<Mutex<Vec<ArmedFault>>>,
}

impl FaultInjector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next check at `point` with `code`.
    pub fn arm(&self, point: FaultPoint, code: c_int) -> &Self {
        self.arm_after(point, 0, code)
    }

    /// Let `skip` checks at `point` pass, then fail the next one with `code`.
    pub fn arm_after(&self, point: FaultPoint, skip: usize, code: c_int) -> &Self {
        self.armed
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(ArmedFault { point, skip, code });
        self
    }

    pub fn pending(&self) -> usize {
        self.armed.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Returns the injected error when an armed fault fires at `point`.
    pub fn check(&self, point: FaultPoint) -> rusqlite::Result<()> {
        let mut armed = self.armed.lock().unwrap_or_else(|e| e.into_inner());
        let Some(index) = armed.iter().position(|fault| fault.point == point) else {
            return Ok(());
        };
        if armed[index].skip > 0 {
            armed[index].skip -= 1;
            return Ok(());
        }
        let fault = armed.remove(index);
        drop(armed);

        warn!(
            target: "pantry",
            event = "fault_injected",
            point = ?fault.point,
            code = fault.code
        );
        Err(rusqlite::Error::SqliteFailure(
            ffi::Error::new(fault.code),
            Some(format!("injected fault at {:?}", fault.point)),
        ))
    }
}
