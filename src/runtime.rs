//! Thread placement and scheduling
//!
//! CPU pinning, real-time scheduling with graceful degradation, and
//! memory locking for the packet-path threads. Every failure here is
//! a warning, never fatal: the run continues at reduced priority.

use log::{debug, warn};

/// Pin the calling thread to a single CPU.
pub fn pin_current_thread(cpu: usize) {
    unsafe {
        let mut set: libc::cpu_set_t = std::mem::zeroed();
        libc::CPU_ZERO(&mut set);
        libc::CPU_SET(cpu, &mut set);
        let rc = libc::sched_setaffinity(0, std::mem::size_of::<libc::cpu_set_t>(), &set);
        if rc != 0 {
            warn!(
                "Failed to pin thread to CPU {}: {}",
                cpu,
                std::io::Error::last_os_error()
            );
        } else {
            debug!("Pinned thread to CPU {}", cpu);
        }
    }
}

/// Request SCHED_FIFO for the calling thread, trying priority 99,
/// then 50, then staying on the default scheduler.
pub fn set_realtime_priority() {
    for priority in [99, 50] {
        let param = libc::sched_param {
            sched_priority: priority,
        };
        let rc = unsafe { libc::sched_setscheduler(0, libc::SCHED_FIFO, &param) };
        if rc == 0 {
            debug!("SCHED_FIFO priority {} acquired", priority);
            return;
        }
    }
    warn!(
        "Real-time scheduling unavailable ({}); continuing with default scheduler",
        std::io::Error::last_os_error()
    );
}

/// Lock current and future pages into RAM to avoid page faults on the
/// packet path.
pub fn lock_memory() {
    let rc = unsafe { libc::mlockall(libc::MCL_CURRENT | libc::MCL_FUTURE) };
    if rc != 0 {
        warn!(
            "mlockall failed ({}); page faults may add jitter",
            std::io::Error::last_os_error()
        );
    }
}

/// Standard entry for a packet-path thread: pin if a CPU was given,
/// then request real-time priority.
pub fn enter_hot_thread(cpu: Option<usize>) {
    if let Some(cpu) = cpu {
        pin_current_thread(cpu);
    }
    set_realtime_priority();
}
