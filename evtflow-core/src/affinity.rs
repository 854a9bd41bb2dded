//! CPU affinity for worker processes

use std::mem::MaybeUninit;

/// Pin the calling thread to `cpu`. Workers are single-threaded, so this pins the whole worker.
pub fn pin_to_cpu(cpu: usize) -> Result<(), std::io::Error> {
    unsafe {
        let mut set = MaybeUninit::<libc::cpu_set_t>::zeroed();
        let set_ref = set.assume_init_mut();

        libc::CPU_ZERO(set_ref);
        libc::CPU_SET(cpu, set_ref);

        if libc::sched_setaffinity(0, std::mem::size_of::<libc::cpu_set_t>(), set_ref) == 0 {
            Ok(())
        } else {
            Err(std::io::Error::last_os_error())
        }
    }
}

/// CPUs the calling process may run on, in ascending order
pub fn available_cpus() -> Vec<usize> {
    unsafe {
        let mut set = MaybeUninit::<libc::cpu_set_t>::zeroed();
        let set_ref = set.assume_init_mut();
        if libc::sched_getaffinity(0, std::mem::size_of::<libc::cpu_set_t>(), set_ref) != 0 {
            return vec![0];
        }
        (0..libc::CPU_SETSIZE as usize)
            .filter(|&cpu| libc::CPU_ISSET(cpu, set_ref))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_available_cpus_nonempty() {
        let cpus = available_cpus();
        assert!(!cpus.is_empty());
        assert!(cpus.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn test_pin_in_child_thread() {
        // Affinity is per thread on Linux; pinning a scratch thread leaves the test runner alone
        let cpu = available_cpus()[0];
        std::thread::spawn(move || pin_to_cpu(cpu))
            .join()
            .unwrap()
            .unwrap();
    }
}
