//! The global pause flag: a single mutex-guarded bool, shared by every
//! request handler, that tells workers to stop requesting new leases
//! without touching any in-flight job.

use std::sync::Mutex;

#[derive(Debug, Default)]
pub struct PauseState {
    paused: Mutex<bool>,
}

impl PauseState {
    pub fn new() -> Self {
        Self { paused: Mutex::new(false) }
    }

    pub fn is_paused(&self) -> bool {
        *self.paused.lock().unwrap()
    }

    pub fn set(&self, paused: bool) {
        *self.paused.lock().unwrap() = paused;
    }
}
