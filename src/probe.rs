//! Memory availability probes
//!
//! Stores and the merge engine never query the operating system directly.
//! They ask a [`MemoryProbe`], so callers and tests can substitute fixed
//! numbers for the live system state.

use std::sync::Mutex;

use sysinfo::System;

/// Reports how much memory is currently free for buffering.
pub trait MemoryProbe: Send + Sync {
    /// Free host memory in bytes.
    fn available_memory(&self) -> u64;

    /// Free accelerator memory in bytes, if an accelerator is attached.
    fn available_device_memory(&self) -> Option<u64> {
        None
    }
}

/// Probe backed by live system memory statistics
pub struct SystemMemoryProbe {
    system: Mutex<System>,
}

impl SystemMemoryProbe {
    pub fn new() -> Self {
        Self {
            system: Mutex::new(System::new()),
        }
    }
}

impl Default for SystemMemoryProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryProbe for SystemMemoryProbe {
    fn available_memory(&self) -> u64 {
        match self.system.lock() {
            Ok(mut system) => {
                system.refresh_memory();
                system.available_memory()
            }
            // A poisoned lock only means another thread panicked mid-refresh
            Err(poisoned) => {
                let mut system = poisoned.into_inner();
                system.refresh_memory();
                system.available_memory()
            }
        }
    }
}

/// Probe that always reports the same numbers
#[derive(Clone, Copy, Debug)]
pub struct FixedMemoryProbe {
    pub host: u64,
    pub device: Option<u64>,
}

impl FixedMemoryProbe {
    pub fn new(host: u64) -> Self {
        Self { host, device: None }
    }

    pub fn with_device(host: u64, device: u64) -> Self {
        Self {
            host,
            device: Some(device),
        }
    }
}

impl MemoryProbe for FixedMemoryProbe {
    fn available_memory(&self) -> u64 {
        self.host
    }

    fn available_device_memory(&self) -> Option<u64> {
        self.device
    }
}
