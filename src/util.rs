//! Small OS helpers shared across the crate.

/// The kernel id of the calling thread (`gettid(2)`).
///
/// Unlike [`std::thread::ThreadId`] this is stable across the process and is
/// what scheduler task pinning keys on.
#[inline(always)]
pub fn thread_id() -> u64 {
    unsafe { libc::syscall(libc::SYS_gettid) as u64 }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn thread_ids_differ_between_threads() {
        let here = thread_id();
        assert_ne!(here, 0);
        let there = std::thread::spawn(thread_id).join().unwrap();
        assert_ne!(here, there);
        assert_eq!(here, thread_id());
    }
}
