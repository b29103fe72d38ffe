//! Platform-specific thread facilities.

use std::time::Duration;

/// CPU time consumed by the calling thread.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub(crate) struct CpuTimes {
    pub(crate) user: Duration,
    pub(crate) kernel: Duration,
}

#[cfg(target_os = "linux")]
pub(crate) fn thread_cpu_times() -> CpuTimes {
    fn to_duration(tv: libc::timeval) -> Duration {
        Duration::from_secs(tv.tv_sec.max(0) as u64) + Duration::from_micros(tv.tv_usec.max(0) as u64)
    }

    // SAFETY: `rusage` is plain old data and `getrusage` only writes to the
    // provided struct.
    let mut usage: libc::rusage = unsafe { std::mem::zeroed() };
    let rc = unsafe { libc::getrusage(libc::RUSAGE_THREAD, &mut usage) };
    if rc != 0 {
        return CpuTimes::default();
    }

    CpuTimes {
        user: to_duration(usage.ru_utime),
        kernel: to_duration(usage.ru_stime),
    }
}

#[cfg(not(target_os = "linux"))]
pub(crate) fn thread_cpu_times() -> CpuTimes {
    CpuTimes::default()
}

/// Raises the niceness of the calling thread; returns `false` if the OS
/// refused.
#[cfg(target_os = "linux")]
pub(crate) fn set_thread_niceness(nice: i32) -> bool {
    if nice == 0 {
        return true;
    }

    // SAFETY: both calls only act on the calling thread.
    unsafe {
        let tid = libc::syscall(libc::SYS_gettid) as libc::id_t;
        libc::setpriority(libc::PRIO_PROCESS, tid, nice) == 0
    }
}

#[cfg(not(target_os = "linux"))]
pub(crate) fn set_thread_niceness(_nice: i32) -> bool {
    false
}
