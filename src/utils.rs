use std::io;
use std::time::Instant;

use once_cell::sync::Lazy;
use tracing::{debug, warn};

/// Process-wide origin of the monotonic tick clock
static CLOCK_EPOCH: Lazy<Instant> = Lazy::new(Instant::now);

/// Monotonic timestamp in nanoseconds since the first call in this process
pub fn monotonic_ticks() -> u64 {
    CLOCK_EPOCH.elapsed().as_nanos() as u64
}

/// Scheduling priority for a stage worker thread
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ThreadPriority {
    #[default]
    Normal,
    /// Device-facing acquisition, to minimize frame drops
    Elevated,
}

/// Raise the calling thread's scheduling priority.
///
/// On Linux `setpriority(PRIO_PROCESS, 0, ..)` applies to the calling thread
/// only. Usually requires CAP_SYS_NICE.
#[cfg(target_os = "linux")]
pub fn elevate_current_thread() -> io::Result<()> {
    // SAFETY: plain syscall wrapper, no pointers involved
    let rc = unsafe { libc::setpriority(libc::PRIO_PROCESS, 0, -10) };
    if rc == 0 {
        Ok(())
    } else {
        Err(io::Error::last_os_error())
    }
}

#[cfg(not(target_os = "linux"))]
pub fn elevate_current_thread() -> io::Result<()> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "thread priority elevation is only implemented on Linux",
    ))
}

/// Pin the calling thread to the given core. Returns false if the core does
/// not exist or the OS refused.
pub fn pin_current_thread(core: usize) -> bool {
    let Some(ids) = core_affinity::get_core_ids() else {
        return false;
    };
    match ids.into_iter().find(|id| id.id == core) {
        Some(id) => core_affinity::set_for_current(id),
        None => false,
    }
}

/// Apply priority and pinning to the current worker thread. Failures only
/// degrade latency, so they are logged and otherwise ignored.
pub fn configure_current_thread(priority: ThreadPriority, core: Option<usize>) {
    if priority == ThreadPriority::Elevated {
        match elevate_current_thread() {
            Ok(()) => debug!("Elevated worker thread priority"),
            Err(e) => warn!("Could not elevate worker thread priority: {}", e),
        }
    }

    if let Some(core) = core {
        if pin_current_thread(core) {
            debug!("Pinned worker thread to core {}", core);
        } else {
            warn!("Could not pin worker thread to core {}", core);
        }
    }
}
