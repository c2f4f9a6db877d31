use crate::util::address::Address;
use crate::util::os::*;
use std::io::Result;
use std::os::fd::RawFd;

impl MmapStrategy {
    /// get the flags for POSIX mmap.
    pub fn get_posix_mmap_flags(&self) -> i32 {
        let mut flags = libc::MAP_ANONYMOUS;
        if self.shared {
            flags |= libc::MAP_SHARED;
        } else {
            flags |= libc::MAP_PRIVATE;
        }
        if !self.reserve {
            flags |= libc::MAP_NORESERVE;
        }
        flags
    }
}

/// Map `size` bytes of anonymous, zero-filled memory wherever the kernel likes.
pub fn mmap_anonymous(size: usize, strategy: MmapStrategy) -> Result<Address> {
    let prot = strategy.prot.get_native_flags();
    let flags = strategy.get_posix_mmap_flags();
    let ptr = unsafe { libc::mmap(std::ptr::null_mut(), size, prot, flags, -1, 0) };
    if ptr == libc::MAP_FAILED {
        Err(std::io::Error::last_os_error())
    } else {
        Ok(Address::from_mut_ptr(ptr))
    }
}

/// Map `size` bytes of the file `fd` starting at `offset`, shared with every other mapping of it.
pub fn mmap_fd(fd: RawFd, offset: usize, size: usize, prot: MmapProtection) -> Result<Address> {
    let ptr = unsafe {
        libc::mmap(
            std::ptr::null_mut(),
            size,
            prot.get_native_flags(),
            libc::MAP_SHARED,
            fd,
            offset as libc::off_t,
        )
    };
    if ptr == libc::MAP_FAILED {
        Err(std::io::Error::last_os_error())
    } else {
        Ok(Address::from_mut_ptr(ptr))
    }
}

pub fn munmap(start: Address, size: usize) -> Result<()> {
    wrap_libc_call(&|| unsafe { libc::munmap(start.to_mut_ptr(), size) }, 0)
}

pub fn mprotect(start: Address, size: usize, prot: MmapProtection) -> Result<()> {
    wrap_libc_call(
        &|| unsafe { libc::mprotect(start.to_mut_ptr(), size, prot.get_native_flags()) },
        0,
    )
}

pub fn ftruncate(fd: RawFd, size: usize) -> Result<()> {
    wrap_libc_call(&|| unsafe { libc::ftruncate(fd, size as libc::off_t) }, 0)
}

pub fn wrap_libc_call<T: PartialEq>(f: &dyn Fn() -> T, expect: T) -> Result<()> {
    let ret = f();
    if ret == expect {
        Ok(())
    } else {
        Err(std::io::Error::last_os_error())
    }
}
