use crate::util::address::Address;
use crate::util::os::imp::unix_common;
use crate::util::os::*;
use std::io::Result;
use std::os::fd::{FromRawFd, OwnedFd};
use std::sync::atomic::AtomicU32;
use std::time::Duration;

pub fn set_vma_name(start: Address, size: usize, annotation: &MmapAnnotation) {
    // `PR_SET_VMA` is new in Linux 5.17.  On older kernels `prctl` returns `EINVAL`.  `prctl` may
    // also return `EINVAL` if the formatted name is longer than 80 bytes.  Since this prctl is
    // used for debugging, we log the error instead of panicking.
    let anno_str = annotation.to_string();
    let Ok(anno_cstr) = std::ffi::CString::new(anno_str) else {
        return;
    };
    let result = unix_common::wrap_libc_call(
        &|| unsafe {
            libc::prctl(
                libc::PR_SET_VMA,
                libc::PR_SET_VMA_ANON_NAME,
                start.to_ptr::<libc::c_void>(),
                size,
                anno_cstr.as_ptr(),
            )
        },
        0,
    );
    if let Err(e) = result {
        debug!("Error while calling prctl: {e}");
    }
}

/// Create an anonymous file that can be mapped shared and whose descriptor can be handed to
/// another process.
pub fn create_shared_fd(name: &str) -> Result<OwnedFd> {
    let name = std::ffi::CString::new(name)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidInput, e))?;
    let fd = unsafe { libc::memfd_create(name.as_ptr(), libc::MFD_CLOEXEC) };
    if fd < 0 {
        Err(std::io::Error::last_os_error())
    } else {
        Ok(unsafe { OwnedFd::from_raw_fd(fd) })
    }
}

/// The kernel thread id. Unique across processes, so it can identify a lock owner in shared
/// memory.
pub fn current_thread_id() -> u32 {
    unsafe { libc::syscall(libc::SYS_gettid) as u32 }
}

// Futex words live in memory shared with another process, so only the non-private operations
// work here. Private futexes are keyed per address space.

pub fn futex_wait(word: &AtomicU32, expected: u32, timeout: Option<Duration>) {
    let ts = timeout.map(|d| libc::timespec {
        tv_sec: d.as_secs() as libc::time_t,
        tv_nsec: d.subsec_nanos() as libc::c_long,
    });
    let ts_ptr = ts
        .as_ref()
        .map_or(std::ptr::null(), |ts| ts as *const libc::timespec);
    let ret = unsafe {
        libc::syscall(
            libc::SYS_futex,
            word.as_ptr(),
            libc::FUTEX_WAIT,
            expected,
            ts_ptr,
        )
    };
    if ret != 0 {
        // EAGAIN (value changed), EINTR and ETIMEDOUT all count as a wakeup. Callers re-check.
        let err = std::io::Error::last_os_error();
        match err.raw_os_error() {
            Some(libc::EAGAIN) | Some(libc::EINTR) | Some(libc::ETIMEDOUT) => {}
            _ => fatal!("futex wait on {:p} failed: {}", word.as_ptr(), err),
        }
    }
}

pub fn futex_wake(word: &AtomicU32, count: u32) -> usize {
    let count = count.min(i32::MAX as u32) as libc::c_int;
    let ret = unsafe { libc::syscall(libc::SYS_futex, word.as_ptr(), libc::FUTEX_WAKE, count) };
    if ret < 0 {
        fatal!(
            "futex wake on {:p} failed: {}",
            word.as_ptr(),
            std::io::Error::last_os_error()
        );
    }
    ret as usize
}
