// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Resource Guard
//!
//! Cooperative circuit breaker consulted after every delivery. When resident
//! memory goes over the caller's ceiling the guard returns a fatal
//! [`AmqpError::MemoryExceeded`], which ends consumption so an external
//! supervisor can restart the process.

use crate::errors::AmqpError;
#[cfg(test)]
use mockall::automock;
use sysinfo::{ProcessExt, System, SystemExt};
use tracing::{debug, error, warn};

/// Source of the process resident memory.
#[cfg_attr(test, automock)]
pub trait MemoryProbe: Send + Sync {
    /// Current resident memory in bytes.
    fn resident_memory(&self) -> Result<u64, AmqpError>;
}

/// Reads the resident memory of the current process through `sysinfo`.
#[derive(Debug, Default)]
pub struct SysinfoProbe;

impl MemoryProbe for SysinfoProbe {
    fn resident_memory(&self) -> Result<u64, AmqpError> {
        let pid = sysinfo::get_current_pid()
            .map_err(|err| AmqpError::InternalError(err.to_owned()))?;

        let mut system = System::new();
        system.refresh_process(pid);

        system
            .process(pid)
            .map(|process| process.memory())
            .ok_or_else(|| AmqpError::InternalError("current process not found".to_owned()))
    }
}

pub struct ResourceGuard {
    probe: Box<dyn MemoryProbe>,
}

impl Default for ResourceGuard {
    fn default() -> Self {
        ResourceGuard::new(Box::new(SysinfoProbe))
    }
}

impl ResourceGuard {
    pub fn new(probe: Box<dyn MemoryProbe>) -> ResourceGuard {
        ResourceGuard { probe }
    }

    /// No-op without a ceiling. A probe failure is logged and does not stop
    /// consumption.
    pub fn check(&self, max_allowed_memory: Option<u64>) -> Result<(), AmqpError> {
        let Some(limit) = max_allowed_memory else {
            return Ok(());
        };

        let current = match self.probe.resident_memory() {
            Ok(current) => current,
            Err(err) => {
                warn!(error = err.to_string(), "unable to read resident memory");
                return Ok(());
            }
        };

        debug!(memory = current, "resident memory");

        if current > limit {
            error!(critical = true, memory = current, limit, "memory limit exceeded");
            return Err(AmqpError::MemoryExceeded { current, limit });
        }

        Ok(())
    }
}
