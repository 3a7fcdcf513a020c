//! Deterministic port-range allocation for concurrent work orders.
//!
//! The TCP space [9000, 9200) is partitioned into 20 slots of 10 consecutive
//! ports. A work order's id hashes to a stable initial slot, so a given work
//! order lands on the same ports across runs (handy when reading logs or
//! reattaching to a half-finished sandbox); probing then walks slots until
//! one with enough free ports turns up.

use std::{
    collections::hash_map::DefaultHasher,
    hash::{Hash as _, Hasher as _},
    io::Write as _,
    net::TcpListener,
    path::Path,
};

use crate::errors::WorkOrderError;

pub const PORT_RANGE_SIZE: u16 = 10;
pub const PORT_BASE: u16 = 9000;
pub const MAX_SLOTS: u16 = 20;

/// A slot's port range plus which of its ports actually bound.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortRange {
    pub start: u16,
    pub end: u16,
    pub available: Vec<u16>,
}

/// Stable slot index (0..20) for a work order id: the first up-to-8
/// alphanumeric chars interpreted as base 36, falling back to a plain hash
/// when that isn't parseable (e.g. an all-punctuation id).
fn slot_for(work_order_id: &str) -> u16 {
    let digits: String = work_order_id
        .chars()
        .take(8)
        .filter(|c| c.is_ascii_alphanumeric())
        .collect();
    match u64::from_str_radix(&digits, 36) {
        Ok(n) => (n % MAX_SLOTS as u64) as u16,
        Err(_) => {
            let mut hasher = DefaultHasher::new();
            work_order_id.hash(&mut hasher);
            (hasher.finish() % MAX_SLOTS as u64) as u16
        }
    }
}

/// The (start, end) port pair the id's initial slot maps to, before any
/// availability probing.
pub fn port_range_for(work_order_id: &str) -> (u16, u16) {
    let start = PORT_BASE + slot_for(work_order_id) * PORT_RANGE_SIZE;
    (start, start + PORT_RANGE_SIZE - 1)
}

/// Whether we can bind the port on the loopback interface right now.
pub fn is_port_available(port: u16) -> bool {
    TcpListener::bind(("127.0.0.1", port)).is_ok()
}

/// Find a usable port range for the work order.
///
/// Starting from the id's slot, walk up to 20 slots in modular order and
/// accept the first whose range has at least half its ports free. Tolerating
/// a few occupied ports avoids churning through slots because of one stale
/// listener left over from an earlier run.
pub fn find_available_port_range(work_order_id: &str) -> Result<PortRange, WorkOrderError> {
    let base_slot = slot_for(work_order_id);
    for offset in 0..MAX_SLOTS {
        let slot = (base_slot + offset) % MAX_SLOTS;
        let start = PORT_BASE + slot * PORT_RANGE_SIZE;
        let end = start + PORT_RANGE_SIZE - 1;
        let available: Vec<u16> = (start..=end).filter(|p| is_port_available(*p)).collect();
        if available.len() >= (PORT_RANGE_SIZE / 2) as usize {
            return Ok(PortRange {
                start,
                end,
                available,
            });
        }
    }
    Err(WorkOrderError::SandboxSetup(format!(
        "no port range available for {work_order_id} after {MAX_SLOTS} slot attempts; \
         stop other services or wait for running work orders to finish"
    )))
}

/// Write the `.ports.env` file into the worktree so whatever the agent
/// builds in there can pick non-conflicting ports.
pub fn write_ports_env(worktree_path: &Path, range: &PortRange) -> std::io::Result<()> {
    let mut contents = String::new();
    contents.push_str("# Port range allocated to this work order\n\n");
    contents.push_str(&format!("PORT_RANGE_START={}\n", range.start));
    contents.push_str(&format!("PORT_RANGE_END={}\n", range.end));
    contents.push_str(&format!(
        "PORT_RANGE_SIZE={}\n\n",
        range.end - range.start + 1
    ));
    contents.push_str("# Individual free ports\n");
    for (i, port) in range.available.iter().enumerate() {
        contents.push_str(&format!("PORT_{i}={port}\n"));
    }
    contents.push_str("\n# Convenience aliases\n");
    if let Some(first) = range.available.first() {
        contents.push_str(&format!("BACKEND_PORT={first}\n"));
        if let Some(second) = range.available.get(1) {
            contents.push_str(&format!("FRONTEND_PORT={second}\n"));
            contents.push_str(&format!("VITE_BACKEND_URL=http://localhost:{first}\n"));
        }
    }

    let mut file = std::fs::File::create(worktree_path.join(".ports.env"))?;
    file.write_all(contents.as_bytes())?;
    Ok(())
}
