/// Cross-process mutual exclusion living in the first cache line of the
/// shared segment.
///
/// On Linux a single `u32` word encodes three states (unlocked, locked,
/// locked with waiters). The uncontended path is one CAS; contended
/// callers sleep on a shared (non-private) futex. Elsewhere the word is
/// replaced by a process-shared pthread mutex.
///
/// A process that dies while holding the lock leaves it held forever.
/// There is no robust-mutex recovery.
use super::layout::LOCK_SIZE;
use crate::error::Result;

pub use imp::ShmLock;

/// RAII guard: the lock is released when this is dropped.
pub struct ShmLockGuard<'a> {
    lock: &'a ShmLock,
}

impl ShmLock {
    /// Acquire the lock, blocking until it is available. Not reentrant.
    #[inline]
    pub fn lock(&self) -> ShmLockGuard<'_> {
        self.acquire();
        ShmLockGuard { lock: self }
    }
}

impl Drop for ShmLockGuard<'_> {
    #[inline]
    fn drop(&mut self) {
        self.lock.release();
    }
}

/// Initialize a fresh lock at `ptr`.
///
/// # Safety
/// `ptr` must point to `LOCK_SIZE` writable bytes of shared memory that no
/// other process is using yet.
pub unsafe fn init(ptr: *mut u8) -> Result<ShmLock> {
    std::ptr::write_bytes(ptr, 0, LOCK_SIZE);
    ShmLock::init(ptr)
}

/// Attach to a lock previously set up by [`init`].
///
/// # Safety
/// `ptr` must point to an initialized lock that outlives the returned value.
pub unsafe fn from_existing(ptr: *mut u8) -> ShmLock {
    ShmLock::from_existing(ptr)
}

#[cfg(target_os = "linux")]
mod imp {
    use std::sync::atomic::{AtomicU32, Ordering};

    use crate::error::Result;

    const UNLOCKED: u32 = 0;
    const LOCKED: u32 = 1;
    const CONTENDED: u32 = 2;

    /// Loads to spin on before going to sleep in the kernel.
    const SPIN_LIMIT: u32 = 64;

    pub struct ShmLock {
        word: *const AtomicU32,
    }

    unsafe impl Send for ShmLock {}
    unsafe impl Sync for ShmLock {}

    impl ShmLock {
        pub(super) unsafe fn init(ptr: *mut u8) -> Result<Self> {
            let lock = Self::from_existing(ptr);
            lock.word().store(UNLOCKED, Ordering::Release);
            Ok(lock)
        }

        pub(super) unsafe fn from_existing(ptr: *mut u8) -> Self {
            ShmLock {
                word: ptr as *const AtomicU32,
            }
        }

        #[inline]
        fn word(&self) -> &AtomicU32 {
            unsafe { &*self.word }
        }

        pub(super) fn acquire(&self) {
            let word = self.word();
            let mut state = match word.compare_exchange(
                UNLOCKED,
                LOCKED,
                Ordering::Acquire,
                Ordering::Relaxed,
            ) {
                Ok(_) => return,
                Err(state) => state,
            };

            // Short TTAS phase before paying for a syscall.
            for _ in 0..SPIN_LIMIT {
                if state == UNLOCKED {
                    match word.compare_exchange_weak(
                        UNLOCKED,
                        LOCKED,
                        Ordering::Acquire,
                        Ordering::Relaxed,
                    ) {
                        Ok(_) => return,
                        Err(s) => state = s,
                    }
                } else {
                    std::hint::spin_loop();
                    state = word.load(Ordering::Relaxed);
                }
            }

            if state != CONTENDED {
                state = word.swap(CONTENDED, Ordering::Acquire);
            }
            while state != UNLOCKED {
                futex_wait(word, CONTENDED);
                state = word.swap(CONTENDED, Ordering::Acquire);
            }
        }

        pub(super) fn release(&self) {
            let word = self.word();
            if word.fetch_sub(1, Ordering::Release) != LOCKED {
                // There were waiters.
                word.store(UNLOCKED, Ordering::Release);
                futex_wake_one(word);
            }
        }
    }

    fn futex_wait(word: &AtomicU32, expected: u32) {
        // EAGAIN and EINTR both just mean "re-check the word".
        unsafe {
            libc::syscall(
                libc::SYS_futex,
                word as *const AtomicU32,
                libc::FUTEX_WAIT,
                expected,
                std::ptr::null::<libc::timespec>(),
                std::ptr::null::<u32>(),
                0u32,
            );
        }
    }

    fn futex_wake_one(word: &AtomicU32) {
        unsafe {
            libc::syscall(
                libc::SYS_futex,
                word as *const AtomicU32,
                libc::FUTEX_WAKE,
                1i32,
                std::ptr::null::<libc::timespec>(),
                std::ptr::null::<u32>(),
                0u32,
            );
        }
    }
}

#[cfg(not(target_os = "linux"))]
mod imp {
    use std::mem::MaybeUninit;

    use super::LOCK_SIZE;
    use crate::error::{Result, ShctxError};

    const _: () = assert!(std::mem::size_of::<libc::pthread_mutex_t>() <= LOCK_SIZE);

    pub struct ShmLock {
        mutex: *mut libc::pthread_mutex_t,
    }

    unsafe impl Send for ShmLock {}
    unsafe impl Sync for ShmLock {}

    fn check(call: &'static str, code: libc::c_int) -> Result<()> {
        if code == 0 {
            Ok(())
        } else {
            Err(ShctxError::LibCall { call, code })
        }
    }

    impl ShmLock {
        pub(super) unsafe fn init(ptr: *mut u8) -> Result<Self> {
            let mutex = ptr as *mut libc::pthread_mutex_t;
            let mut attr = MaybeUninit::<libc::pthread_mutexattr_t>::uninit();
            check(
                "pthread_mutexattr_init",
                libc::pthread_mutexattr_init(attr.as_mut_ptr()),
            )?;
            let result = check(
                "pthread_mutexattr_setpshared",
                libc::pthread_mutexattr_setpshared(
                    attr.as_mut_ptr(),
                    libc::PTHREAD_PROCESS_SHARED,
                ),
            )
            .and_then(|_| {
                check(
                    "pthread_mutex_init",
                    libc::pthread_mutex_init(mutex, attr.as_ptr()),
                )
            });
            libc::pthread_mutexattr_destroy(attr.as_mut_ptr());
            result.map(|_| ShmLock { mutex })
        }

        pub(super) unsafe fn from_existing(ptr: *mut u8) -> Self {
            ShmLock {
                mutex: ptr as *mut libc::pthread_mutex_t,
            }
        }

        pub(super) fn acquire(&self) {
            unsafe {
                libc::pthread_mutex_lock(self.mutex);
            }
        }

        pub(super) fn release(&self) {
            unsafe {
                libc::pthread_mutex_unlock(self.mutex);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Arc;
    use std::thread;

    /// Heap stand-in for the shared lock line, 8-byte aligned and leaked so
    /// every thread can address it like a mapping.
    fn lock_line() -> usize {
        let line: &'static mut [u64] = Box::leak(vec![0u64; LOCK_SIZE / 8].into_boxed_slice());
        line.as_mut_ptr() as usize
    }

    #[test]
    fn lock_unlock_uncontended() {
        let line = lock_line();
        let lock = unsafe { init(line as *mut u8).unwrap() };
        {
            let _guard = lock.lock();
        }
        // Released: can be taken again.
        let _guard = lock.lock();
    }

    #[test]
    fn separate_handles_exclude_each_other() {
        let line = lock_line();
        unsafe { init(line as *mut u8).unwrap() };

        // The read-modify-write is split so missing exclusion shows up as
        // lost updates.
        let counter = Arc::new(AtomicU64::new(0));
        let threads = 4;
        let rounds = 10_000;

        let handles: Vec<_> = (0..threads)
            .map(|_| {
                let counter = Arc::clone(&counter);
                thread::spawn(move || {
                    let lock = unsafe { from_existing(line as *mut u8) };
                    for _ in 0..rounds {
                        let _guard = lock.lock();
                        let v = counter.load(Ordering::Relaxed);
                        std::hint::spin_loop();
                        counter.store(v + 1, Ordering::Relaxed);
                    }
                })
            })
            .collect();

        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(counter.load(Ordering::Relaxed), threads * rounds);
    }
}
