use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use log::debug;

use crate::connection::{Connection, PendingGauge};
use crate::error::Result;
use crate::orb::OrbOptions;

type Slot = Arc<tokio::sync::Mutex<Option<Arc<Connection>>>>;

/// Outbound connection pool keyed by `(host, port)`. One live connection per
/// target; concurrent first requests to the same target collapse onto a
/// single in-flight connect through the per-slot lock.
pub struct Pool {
    options: Arc<OrbOptions>,
    gauge: Arc<PendingGauge>,
    entries: Mutex<HashMap<(String, u16), Slot>>,
}

impl Pool {
    pub fn new(options: Arc<OrbOptions>, gauge: Arc<PendingGauge>) -> Pool {
        Pool {
            options,
            gauge,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Returns the pooled connection for the target, establishing it first
    /// if none is registered or the registered one has died.
    pub async fn checkout(&self, host: &str, port: u16) -> Result<Arc<Connection>> {
        let slot = {
            let mut entries = self.entries.lock().unwrap();
            entries
                .entry((host.to_string(), port))
                .or_default()
                .clone()
        };
        let mut guard = slot.lock().await;
        if let Some(conn) = guard.as_ref() {
            if !conn.is_closed() {
                return Ok(conn.clone());
            }
            debug!("pooled connection to {host}:{port} is dead, reconnecting");
        }
        let conn =
            Connection::connect(host, port, self.options.clone(), self.gauge.clone(), None).await?;
        *guard = Some(conn.clone());
        Ok(conn)
    }

    /// Drops the pooled entry so the next request re-establishes.
    pub fn evict(&self, host: &str, port: u16) {
        self.entries
            .lock()
            .unwrap()
            .remove(&(host.to_string(), port));
    }

    pub async fn close_all(&self) {
        let slots: Vec<Slot> = {
            let mut entries = self.entries.lock().unwrap();
            entries.drain().map(|(_, slot)| slot).collect()
        };
        for slot in slots {
            if let Some(conn) = slot.lock().await.take() {
                conn.close().await;
            }
        }
    }
}
