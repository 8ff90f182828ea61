//! Single-writer / multi-reader lock encoded in two atomic words living
//! inside the index region, with futex-style wait/wake so blocked
//! contexts sleep instead of spinning — see `spec.md` §5.
//!
//! Acquisition follows the exact protocol the spec lays out rather than a
//! textbook-hardened rwlock: readers bump `read_count` after observing the
//! state is not write-locked, writers CAS `lock_state` from unlocked to
//! write-locked. The spec calls this out as unfair under sustained reader
//! load; we don't try to fix that here.

use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, Instant};

use crate::error::{StoreError, StoreResult};
use crate::layout::lock_state;
use crate::region::Region;

pub const DEFAULT_TIMEOUT: Duration = Duration::from_millis(500);

/// A lock view over a region's `lock_state`/`read_count` words.
pub struct RwLock<'a> {
    region: &'a Region,
    lock_state_offset: usize,
    read_count_offset: usize,
    timeout: Duration,
}

impl<'a> RwLock<'a> {
    pub fn new(region: &'a Region, lock_state_offset: usize, read_count_offset: usize) -> Self {
        RwLock {
            region,
            lock_state_offset,
            read_count_offset,
            timeout: DEFAULT_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    fn state_word(&self) -> &AtomicU32 {
        self.region.atomic_ref_u32(self.lock_state_offset)
    }

    fn read_count_word(&self) -> &AtomicU32 {
        self.region.atomic_ref_u32(self.read_count_offset)
    }

    /// Acquire the read lock, blocking up to `self.timeout`. No-op when
    /// the backing region is process-local (degraded mode, spec.md §5).
    pub fn acquire_read(&self) -> StoreResult<ReadGuard<'_, 'a>> {
        if !self.region.is_shared() {
            return Ok(ReadGuard { lock: self, active: false });
        }
        let deadline = Instant::now() + self.timeout;
        loop {
            let state = self.state_word().load(Ordering::Acquire);
            if state == lock_state::WRITE_LOCKED {
                wait_u32(self.state_word(), lock_state::WRITE_LOCKED, deadline, self.timeout)?;
                continue;
            }
            let prev = self.read_count_word().fetch_add(1, Ordering::AcqRel);
            if prev == 0 {
                self.state_word().store(lock_state::READ_LOCKED, Ordering::Release);
            }
            tracing::trace!(offset = self.lock_state_offset, "read lock acquired");
            return Ok(ReadGuard { lock: self, active: true });
        }
    }

    fn release_read(&self) {
        let prev = self.read_count_word().fetch_sub(1, Ordering::AcqRel);
        if prev == 1 {
            self.state_word().store(lock_state::UNLOCKED, Ordering::Release);
            wake_all(self.state_word());
        }
    }

    /// Acquire the write lock, blocking up to `self.timeout`. No-op when
    /// the backing region is process-local.
    pub fn acquire_write(&self) -> StoreResult<WriteGuard<'_, 'a>> {
        if !self.region.is_shared() {
            return Ok(WriteGuard { lock: self, active: false });
        }
        let deadline = Instant::now() + self.timeout;
        loop {
            match self.state_word().compare_exchange(
                lock_state::UNLOCKED,
                lock_state::WRITE_LOCKED,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    tracing::trace!(offset = self.lock_state_offset, "write lock acquired");
                    return Ok(WriteGuard { lock: self, active: true });
                }
                Err(observed) => {
                    wait_u32(self.state_word(), observed, deadline, self.timeout)?;
                }
            }
        }
    }

    fn release_write(&self) {
        self.state_word().store(lock_state::UNLOCKED, Ordering::Release);
        wake_all(self.state_word());
    }
}

pub struct ReadGuard<'lock, 'region> {
    lock: &'lock RwLock<'region>,
    active: bool,
}

impl Drop for ReadGuard<'_, '_> {
    fn drop(&mut self) {
        if self.active {
            self.lock.release_read();
        }
    }
}

pub struct WriteGuard<'lock, 'region> {
    lock: &'lock RwLock<'region>,
    active: bool,
}

impl Drop for WriteGuard<'_, '_> {
    fn drop(&mut self) {
        if self.active {
            self.lock.release_write();
        }
    }
}

fn remaining(deadline: Instant) -> Option<Duration> {
    let now = Instant::now();
    if now >= deadline {
        None
    } else {
        Some(deadline - now)
    }
}

/// Block until `word` no longer equals `expected`, the OS wakes us, or the
/// deadline passes.
fn wait_u32(word: &AtomicU32, expected: u32, deadline: Instant, total_timeout: Duration) -> StoreResult<()> {
    let Some(budget) = remaining(deadline) else {
        return Err(StoreError::LockTimeout(total_timeout));
    };
    if word.load(Ordering::Acquire) != expected {
        return Ok(());
    }
    futex_wait(word, expected, budget);
    if remaining(deadline).is_none() && word.load(Ordering::Acquire) == expected {
        return Err(StoreError::LockTimeout(total_timeout));
    }
    Ok(())
}

#[cfg(target_os = "linux")]
fn futex_wait(word: &AtomicU32, expected: u32, timeout: Duration) {
    let ts = libc::timespec {
        tv_sec: timeout.as_secs() as libc::time_t,
        tv_nsec: timeout.subsec_nanos() as libc::c_long,
    };
    unsafe {
        libc::syscall(
            libc::SYS_futex,
            word as *const AtomicU32 as *const u32,
            libc::FUTEX_WAIT,
            expected,
            &ts as *const libc::timespec,
        );
    }
    // We don't inspect the result: either the word changed, we were woken,
    // we timed out, or we got spuriously interrupted — all of these are
    // handled by the caller's loop re-checking the word against `deadline`.
}

#[cfg(target_os = "linux")]
fn wake_all(word: &AtomicU32) {
    unsafe {
        libc::syscall(
            libc::SYS_futex,
            word as *const AtomicU32 as *const u32,
            libc::FUTEX_WAKE,
            i32::MAX,
        );
    }
}

/// Non-Linux fallback: no native futex syscall exposed by `libc`, so we
/// back off with short sleeps instead of truly parking. Correctness is
/// identical; only the sleep-vs-park efficiency differs.
#[cfg(not(target_os = "linux"))]
fn futex_wait(word: &AtomicU32, expected: u32, timeout: Duration) {
    let step = Duration::from_micros(50);
    let deadline = Instant::now() + timeout;
    while word.load(Ordering::Acquire) == expected {
        if Instant::now() >= deadline {
            return;
        }
        std::thread::sleep(step);
    }
}

#[cfg(not(target_os = "linux"))]
fn wake_all(_word: &AtomicU32) {
    // Waiters on the fallback path re-poll on their own; nothing to signal.
}
