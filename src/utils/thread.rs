use crate::queue::QosClass;

// Nice values per class. Negative values need CAP_SYS_NICE and are applied
// best-effort.
#[cfg(target_os = "linux")]
fn nice_value(qos: QosClass) -> libc::c_int {
    match qos {
        QosClass::Lowest => 19,
        QosClass::Low => 10,
        QosClass::Normal => 0,
        QosClass::High => -5,
        QosClass::Max => -10,
    }
}

/// Applies a queue's priority hint to the calling thread.
///
/// Linux maps the hint to a per-thread nice value through `setpriority` on
/// the thread id. Failures are ignored: the hint is advisory and raising
/// priority above normal is usually not permitted for unprivileged
/// processes.
#[cfg(target_os = "linux")]
pub(crate) fn set_current_thread_qos(qos: QosClass) {
    let nice = nice_value(qos);

    unsafe {
        // With PRIO_PROCESS a thread id narrows the scope to that thread.
        let tid = libc::syscall(libc::SYS_gettid) as libc::id_t;
        libc::setpriority(libc::PRIO_PROCESS as _, tid, nice);
    }
}

#[cfg(not(target_os = "linux"))]
pub(crate) fn set_current_thread_qos(_qos: QosClass) {}
