//! Thread naming and priority, best effort on every platform.

use std::io;

/// Scheduling priority for the loop and helper threads.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(crate) enum Priority {
    Normal,
    High,
    TimeCritical,
}

/// Names the current thread for debuggers and `/proc`.
#[cfg(unix)]
pub(crate) fn set_name(name: &str) {
    // The kernel truncates to 15 bytes plus NUL.
    let mut buf = [0u8; 16];
    let len = name.len().min(15);
    buf[..len].copy_from_slice(&name.as_bytes()[..len]);
    unsafe {
        libc::prctl(libc::PR_SET_NAME, buf.as_ptr() as libc::c_ulong, 0, 0, 0);
    }
}

#[cfg(windows)]
pub(crate) fn set_name(_name: &str) {
    // SetThreadDescription needs a dynamic lookup on older SDKs; the
    // thread name is already set through `thread::Builder` where it matters.
}

/// Adjusts the current thread's scheduling priority.
///
/// Raising the priority commonly requires elevated privileges; callers log
/// and continue when this fails.
#[cfg(unix)]
pub(crate) fn set_priority(priority: Priority) -> io::Result<()> {
    let nice = match priority {
        Priority::Normal => 0,
        Priority::High => -10,
        Priority::TimeCritical => -20,
    };

    let tid = unsafe { libc::syscall(libc::SYS_gettid) };
    let rc = unsafe { libc::setpriority(libc::PRIO_PROCESS as _, tid as _, nice) };

    if rc != 0 {
        return Err(io::Error::last_os_error());
    }

    Ok(())
}

#[cfg(windows)]
pub(crate) fn set_priority(priority: Priority) -> io::Result<()> {
    use windows_sys::Win32::System::Threading::{
        GetCurrentThread, SetThreadPriority, THREAD_PRIORITY_ABOVE_NORMAL,
        THREAD_PRIORITY_NORMAL, THREAD_PRIORITY_TIME_CRITICAL,
    };

    let value = match priority {
        Priority::Normal => THREAD_PRIORITY_NORMAL,
        Priority::High => THREAD_PRIORITY_ABOVE_NORMAL,
        Priority::TimeCritical => THREAD_PRIORITY_TIME_CRITICAL,
    };

    let rc = unsafe { SetThreadPriority(GetCurrentThread(), value) };
    if rc == 0 {
        return Err(io::Error::last_os_error());
    }

    Ok(())
}
