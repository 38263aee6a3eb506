use serde::Serialize;
use std::sync::{Mutex, OnceLock};
use sysinfo::{MemoryRefreshKind, RefreshKind, System};

const MB: u64 = 1024 * 1024;

/// Host memory figures attached to progress updates, in MB.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MemoryStats {
    pub total_mb: u64,
    pub used_mb: u64,
    pub avail_mb: u64,
}

impl MemoryStats {
    fn from_bytes(total: u64, available: u64) -> Self {
        let total_mb = total / MB;
        let avail_mb = available / MB;
        Self {
            total_mb,
            used_mb: total_mb.saturating_sub(avail_mb),
            avail_mb,
        }
    }
}

fn ram_only() -> MemoryRefreshKind {
    MemoryRefreshKind::nothing().with_ram()
}

fn system() -> &'static Mutex<System> {
    static SYSTEM: OnceLock<Mutex<System>> = OnceLock::new();
    SYSTEM.get_or_init(|| {
        Mutex::new(System::new_with_specifics(
            RefreshKind::nothing().with_memory(ram_only()),
        ))
    })
}

/// Refresh and read host memory. A poisoned lock reports zeros.
pub fn memory_stats_mb() -> MemoryStats {
    match system().lock() {
        Ok(mut sys) => {
            sys.refresh_memory_specifics(ram_only());
            MemoryStats::from_bytes(sys.total_memory(), sys.available_memory())
        }
        Err(_) => MemoryStats::default(),
    }
}
