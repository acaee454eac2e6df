//! Port pool shared by all sandboxes.
//!
//! Allocation and release are linearized behind one async mutex. Callers hold
//! an `Arc<PortAllocator>` handle; there is no global pool.

use std::collections::BTreeMap;
use tokio::sync::Mutex;

use neural_bridge_core::config::PortPoolConfig;
use neural_bridge_core::{Error, Result, SandboxId};

/// A held port and the sandbox holding it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortLease {
    pub port: u16,
    pub held_by: SandboxId,
}

pub struct PortAllocator {
    start: u16,
    end: u16,
    held: Mutex<BTreeMap<u16, SandboxId>>,
}

impl PortAllocator {
    /// Pool covering `start..=end`.
    pub fn new(start: u16, end: u16) -> Result<Self> {
        if start == 0 || end < start {
            return Err(Error::config(format!(
                "invalid port range {}..={}",
                start, end
            )));
        }
        Ok(Self {
            start,
            end,
            held: Mutex::new(BTreeMap::new()),
        })
    }

    pub fn from_config(config: &PortPoolConfig) -> Result<Self> {
        let end = config.end().ok_or_else(|| {
            Error::config(format!(
                "port range start={} size={} overflows",
                config.start, config.size
            ))
        })?;
        Self::new(config.start, end)
    }

    pub fn capacity(&self) -> usize {
        usize::from(self.end - self.start) + 1
    }

    /// Lease the lowest free port to `holder`.
    ///
    /// A holder may hold at most one port.
    pub async fn allocate(&self, holder: &SandboxId) -> Result<u16> {
        let mut held = self.held.lock().await;

        if let Some((port, _)) = held.iter().find(|(_, h)| *h == holder) {
            return Err(Error::internal(format!(
                "sandbox {} already holds port {}",
                holder, port
            )));
        }

        let free = (self.start..=self.end).find(|p| !held.contains_key(p));
        let Some(port) = free else {
            tracing::warn!(capacity = self.capacity(), "Port pool exhausted");
            return Err(Error::PoolExhausted {
                capacity: self.capacity(),
            });
        };

        held.insert(port, holder.clone());
        metrics::gauge!("nb_ports_free").set((self.capacity() - held.len()) as f64);
        tracing::debug!(port = port, sandbox_id = %holder, "Port leased");
        Ok(port)
    }

    /// Return `port` to the pool. Releasing a free port is a logged no-op.
    ///
    /// Returns whether the port was held.
    pub async fn release(&self, port: u16) -> bool {
        let mut held = self.held.lock().await;
        match held.remove(&port) {
            Some(holder) => {
                metrics::gauge!("nb_ports_free").set((self.capacity() - held.len()) as f64);
                tracing::debug!(port = port, sandbox_id = %holder, "Port released");
                true
            }
            None => {
                tracing::warn!(port = port, "Release of a port that is not leased; ignoring");
                false
            }
        }
    }

    /// Return `port` only while it is still leased to `holder`.
    ///
    /// A second reclaim of the same sandbox is a no-op even if the port has
    /// since been leased to someone else.
    pub async fn release_held(&self, port: u16, holder: &SandboxId) -> bool {
        let mut held = self.held.lock().await;
        if held.get(&port) != Some(holder) {
            tracing::debug!(port = port, sandbox_id = %holder, "Port not leased to sandbox; nothing to release");
            return false;
        }
        held.remove(&port);
        metrics::gauge!("nb_ports_free").set((self.capacity() - held.len()) as f64);
        tracing::debug!(port = port, sandbox_id = %holder, "Port released");
        true
    }

    /// Port currently leased to `holder`, if any.
    pub async fn port_of(&self, holder: &SandboxId) -> Option<u16> {
        self.held
            .lock()
            .await
            .iter()
            .find(|(_, h)| *h == holder)
            .map(|(p, _)| *p)
    }

    pub async fn available(&self) -> usize {
        self.capacity() - self.held.lock().await.len()
    }

    /// Snapshot of all current leases, ordered by port.
    pub async fn leases(&self) -> Vec<PortLease> {
        self.held
            .lock()
            .await
            .iter()
            .map(|(port, holder)| PortLease {
                port: *port,
                held_by: holder.clone(),
            })
            .collect()
    }
}
