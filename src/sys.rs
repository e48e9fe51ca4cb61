//! Platform module: every interaction with the OS lives here.
//!
//! Large anonymous mappings, prefaulting, best-effort NUMA binding, NUMA
//! node discovery and worker pinning. On non-unix hosts the mapping
//! primitives degrade to the global allocator and the NUMA calls become
//! no-ops; nothing else in the crate needs to care.

use std::ptr::NonNull;

/// Smallest OS page; prefault loops touch one byte per this stride.
pub const OS_PAGE_SIZE: usize = 4096;

#[cfg(unix)]
mod imp {
    use super::OS_PAGE_SIZE;
    use std::ptr::{self, NonNull};

    pub fn map_pages(len: usize) -> Option<NonNull<u8>> {
        debug_assert!(len % OS_PAGE_SIZE == 0);
        let ptr = unsafe {
            libc::mmap(
                ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_NORESERVE,
                -1,
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return None;
        }
        #[cfg(target_os = "linux")]
        unsafe {
            // advisory only; transparent huge pages if the kernel has them
            libc::madvise(ptr, len, libc::MADV_HUGEPAGE);
        }
        NonNull::new(ptr as *mut u8)
    }

    pub fn unmap_pages(ptr: NonNull<u8>, len: usize) {
        unsafe {
            libc::munmap(ptr.as_ptr().cast(), len);
        }
    }

    #[cfg(target_os = "linux")]
    pub fn bind_to_node(ptr: NonNull<u8>, len: usize, node: usize) -> bool {
        const MPOL_BIND: usize = 2;
        if node >= 64 {
            return false;
        }
        let nodemask: u64 = 1 << node;
        let rc = unsafe {
            libc::syscall(
                libc::SYS_mbind,
                ptr.as_ptr(),
                len,
                MPOL_BIND,
                &nodemask as *const u64,
                64usize + 1,
                0usize,
            )
        };
        rc == 0
    }

    #[cfg(not(target_os = "linux"))]
    pub fn bind_to_node(_ptr: NonNull<u8>, _len: usize, _node: usize) -> bool {
        false
    }

    #[cfg(target_os = "linux")]
    pub fn num_numa_nodes() -> usize {
        let Ok(entries) = std::fs::read_dir("/sys/devices/system/node") else {
            return 1;
        };
        let n = entries
            .filter_map(|e| e.ok())
            .filter(|e| {
                let name = e.file_name();
                let name = name.to_string_lossy();
                name.strip_prefix("node")
                    .is_some_and(|rest| rest.chars().all(|c| c.is_ascii_digit()))
            })
            .count();
        n.max(1)
    }

    #[cfg(not(target_os = "linux"))]
    pub fn num_numa_nodes() -> usize {
        1
    }
}

#[cfg(not(unix))]
mod imp {
    use super::OS_PAGE_SIZE;
    use std::{
        alloc::{self, Layout},
        ptr::NonNull,
    };

    pub fn map_pages(len: usize) -> Option<NonNull<u8>> {
        let layout = Layout::from_size_align(len, OS_PAGE_SIZE).ok()?;
        NonNull::new(unsafe { alloc::alloc_zeroed(layout) })
    }

    pub fn unmap_pages(ptr: NonNull<u8>, len: usize) {
        let layout = Layout::from_size_align(len, OS_PAGE_SIZE).unwrap();
        unsafe { alloc::dealloc(ptr.as_ptr(), layout) };
    }

    pub fn bind_to_node(_ptr: NonNull<u8>, _len: usize, _node: usize) -> bool {
        false
    }

    pub fn num_numa_nodes() -> usize {
        1
    }
}

pub use imp::{bind_to_node, map_pages, num_numa_nodes, unmap_pages};

/// Touches one byte per `stride` to force the block into physical memory.
///
/// Fresh anonymous mappings are zero-filled, so writing zero is
/// content-preserving.
pub fn prefault(ptr: NonNull<u8>, len: usize, stride: usize) {
    let base = ptr.as_ptr();
    let mut off = 0;
    while off < len {
        unsafe { base.add(off).write_volatile(0) };
        off += stride;
    }
}

/// Number of online CPUs
pub fn online_cpus() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

/// Pins the calling thread to the given CPU index. Best effort.
pub fn pin_to_cpu(cpu: usize) -> bool {
    core_affinity::set_for_current(core_affinity::CoreId { id: cpu })
}
