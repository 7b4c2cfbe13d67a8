//! Exclusive sections guarding the heap state.
//!
//! The heap never locks anything itself. Every operation that reads or
//! mutates the free list or the counters runs between
//! [`ExclusiveSection::enter`] and [`ExclusiveSection::exit`] of the section
//! the heap was built with, through an [`Exclusive`] guard.
//!
//! Which primitive provides the exclusion depends on the environment:
//!
//! | Section | Exclusion | Use |
//! |---------|-----------|-----|
//! | [`SuspendAll`] | scheduler suspended | task context |
//! | [`InterruptMask`] | interrupts masked | interrupt context, single core |
//! | [`SpinSection`] | spin lock | hosted targets, tests |
//! | [`Unsynchronized`] | none, heap is `!Sync` | single task |

use core::{
    cell::{Cell, UnsafeCell},
    fmt, hint,
    marker::PhantomData,
    sync::atomic::{AtomicBool, AtomicUsize, Ordering},
};

/// A primitive that keeps every other context away from the heap state
/// between `enter` and `exit`.
///
/// # Safety
///
/// Implementors must guarantee that once `enter` returns, no other context
/// returns from `enter` on the same section (or runs code that touches the
/// guarded state) until the matching `exit` has been called.
pub unsafe trait ExclusiveSection {
    fn enter(&self);

    /// Leaves the section.
    ///
    /// # Safety
    ///
    /// Must be paired with a preceding `enter` from the same context.
    unsafe fn exit(&self);
}

unsafe impl<S> ExclusiveSection for &S
where
    S: ExclusiveSection + ?Sized,
{
    fn enter(&self) {
        (**self).enter();
    }

    unsafe fn exit(&self) {
        unsafe { (**self).exit() }
    }
}

/// RAII guard for an entered [`ExclusiveSection`].
#[derive(Debug)]
pub struct Exclusive<'a, S>
where
    S: ExclusiveSection + ?Sized,
{
    section: &'a S,
    _not_send: PhantomData<*mut ()>,
}

impl<'a, S> Exclusive<'a, S>
where
    S: ExclusiveSection + ?Sized,
{
    pub fn enter(section: &'a S) -> Self {
        section.enter();
        Self {
            section,
            _not_send: PhantomData,
        }
    }
}

impl<S> Drop for Exclusive<'_, S>
where
    S: ExclusiveSection + ?Sized,
{
    fn drop(&mut self) {
        unsafe { self.section.exit() }
    }
}

/// Scheduler collaborator able to stop and restart task switching.
///
/// # Safety
///
/// Between `suspend_all` and the matching `resume_all` no other task may run.
/// Nested suspensions must be counted by the scheduler: only the outermost
/// `resume_all` restarts task switching.
pub unsafe trait TaskScheduler {
    fn suspend_all(&self);
    fn resume_all(&self);
}

/// Exclusion by suspending the task scheduler.
///
/// Stronger than a lock: no other task runs at all while the section is held,
/// whether or not it uses the heap. Interrupt handlers still run and must not
/// touch a heap guarded this way.
#[derive(Debug, Default)]
pub struct SuspendAll<T> {
    scheduler: T,
}

impl<T> SuspendAll<T> {
    pub const fn new(scheduler: T) -> Self {
        Self { scheduler }
    }

    pub fn scheduler(&self) -> &T {
        &self.scheduler
    }
}

unsafe impl<T> ExclusiveSection for SuspendAll<T>
where
    T: TaskScheduler,
{
    fn enter(&self) {
        self.scheduler.suspend_all();
    }

    unsafe fn exit(&self) {
        self.scheduler.resume_all();
    }
}

/// Interrupt controller collaborator of the current core.
///
/// # Safety
///
/// After `read_and_disable` returns, no interrupt handler may run on the
/// current core until an enabled state is restored.
pub unsafe trait InterruptControl {
    /// Saved interrupt-enable state.
    type State: Copy;

    /// Disables interrupts and returns the state that was active before.
    fn read_and_disable(&self) -> Self::State;

    fn is_enabled(&self) -> bool;

    /// Restores a state returned by `read_and_disable`.
    ///
    /// # Safety
    ///
    /// `state` must come from the outermost `read_and_disable` of the current
    /// nesting.
    unsafe fn restore(&self, state: Self::State);
}

/// Exclusion by masking interrupts on a single core.
///
/// Sections nest: only the outermost `exit` restores the interrupt state that
/// was active before the outermost `enter`.
pub struct InterruptMask<I>
where
    I: InterruptControl,
{
    control: I,
    disabled_depth: AtomicUsize,
    initial_state: UnsafeCell<Option<I::State>>,
}

// Only sound on a single core: the depth and the saved state are touched with
// interrupts disabled.
unsafe impl<I> Sync for InterruptMask<I> where I: InterruptControl + Sync {}

impl<I> fmt::Debug for InterruptMask<I>
where
    I: InterruptControl,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InterruptMask")
            .field("disabled_depth", &self.disabled_depth.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl<I> InterruptMask<I>
where
    I: InterruptControl,
{
    pub const fn new(control: I) -> Self {
        Self {
            control,
            disabled_depth: AtomicUsize::new(0),
            initial_state: UnsafeCell::new(None),
        }
    }

    pub fn control(&self) -> &I {
        &self.control
    }

    pub fn disabled_depth(&self) -> usize {
        self.disabled_depth.load(Ordering::Relaxed)
    }
}

unsafe impl<I> ExclusiveSection for InterruptMask<I>
where
    I: InterruptControl,
{
    fn enter(&self) {
        let state = self.control.read_and_disable();
        let depth = self.disabled_depth.fetch_add(1, Ordering::Acquire);
        if depth == 0 {
            unsafe {
                *self.initial_state.get() = Some(state);
            }
        }
    }

    unsafe fn exit(&self) {
        assert!(!self.control.is_enabled());
        let depth = self.disabled_depth.fetch_sub(1, Ordering::Release);
        assert_ne!(depth, 0, "InterruptMask exited without being entered");
        if depth == 1 {
            let state = unsafe { (*self.initial_state.get()).take() };
            if let Some(state) = state {
                unsafe { self.control.restore(state) }
            }
        }
    }
}

/// Exclusion by a spin lock.
///
/// Not reentrant: entering twice from the same context deadlocks.
pub struct SpinSection {
    locked: AtomicBool,
}

impl Default for SpinSection {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for SpinSection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SpinSection")
            .field("locked", &self.is_locked())
            .finish()
    }
}

impl SpinSection {
    pub const fn new() -> Self {
        Self {
            locked: AtomicBool::new(false),
        }
    }

    pub fn is_locked(&self) -> bool {
        self.locked.load(Ordering::Relaxed)
    }
}

unsafe impl ExclusiveSection for SpinSection {
    fn enter(&self) {
        while self.locked.swap(true, Ordering::Acquire) {
            hint::spin_loop();
        }
    }

    unsafe fn exit(&self) {
        assert!(self.is_locked(), "SpinSection exited without being entered");
        self.locked.store(false, Ordering::Release);
    }
}

/// No exclusion at all.
///
/// The section is `!Sync`, so a heap built on it cannot be shared between
/// contexts.
#[derive(Debug, Default)]
pub struct Unsynchronized {
    _not_sync: PhantomData<Cell<()>>,
}

impl Unsynchronized {
    pub const fn new() -> Self {
        Self {
            _not_sync: PhantomData,
        }
    }
}

unsafe impl ExclusiveSection for Unsynchronized {
    fn enter(&self) {}

    unsafe fn exit(&self) {}
}

#[cfg_attr(coverage_nightly, coverage(off))]
#[cfg(test)]
mod tests {
    extern crate std;

    use std::{sync::Arc, thread, vec::Vec};

    use super::*;

    #[derive(Debug, Default)]
    struct CountingScheduler {
        suspended: AtomicUsize,
        suspend_calls: AtomicUsize,
    }

    unsafe impl TaskScheduler for CountingScheduler {
        fn suspend_all(&self) {
            self.suspended.fetch_add(1, Ordering::Relaxed);
            self.suspend_calls.fetch_add(1, Ordering::Relaxed);
        }

        fn resume_all(&self) {
            let prev = self.suspended.fetch_sub(1, Ordering::Relaxed);
            assert_ne!(prev, 0, "resume without suspend");
        }
    }

    #[derive(Debug, Default)]
    struct FakeInterrupts {
        enabled: Cell<bool>,
        restores: Cell<usize>,
    }

    unsafe impl InterruptControl for FakeInterrupts {
        type State = bool;

        fn read_and_disable(&self) -> bool {
            self.enabled.replace(false)
        }

        fn is_enabled(&self) -> bool {
            self.enabled.get()
        }

        unsafe fn restore(&self, state: bool) {
            self.restores.set(self.restores.get() + 1);
            self.enabled.set(state);
        }
    }

    #[test]
    fn test_suspend_all_pairs_calls() {
        let section = SuspendAll::new(CountingScheduler::default());
        {
            let _outer = Exclusive::enter(&section);
            assert_eq!(section.scheduler().suspended.load(Ordering::Relaxed), 1);
            {
                let _inner = Exclusive::enter(&section);
                assert_eq!(section.scheduler().suspended.load(Ordering::Relaxed), 2);
            }
            assert_eq!(section.scheduler().suspended.load(Ordering::Relaxed), 1);
        }
        assert_eq!(section.scheduler().suspended.load(Ordering::Relaxed), 0);
        assert_eq!(section.scheduler().suspend_calls.load(Ordering::Relaxed), 2);
    }

    #[test]
    fn test_interrupt_mask_restores_outermost_state() {
        let section = InterruptMask::new(FakeInterrupts::default());
        section.control().enabled.set(true);
        {
            let _outer = Exclusive::enter(&section);
            assert!(!section.control().is_enabled());
            {
                let _inner = Exclusive::enter(&section);
                assert_eq!(section.disabled_depth(), 2);
            }
            assert!(!section.control().is_enabled());
            assert_eq!(section.control().restores.get(), 0);
        }
        assert!(section.control().is_enabled());
        assert_eq!(section.control().restores.get(), 1);
        assert_eq!(section.disabled_depth(), 0);
    }

    #[test]
    fn test_interrupt_mask_keeps_disabled_state() {
        let section = InterruptMask::new(FakeInterrupts::default());
        {
            let _guard = Exclusive::enter(&section);
        }
        assert!(!section.control().is_enabled());
        assert_eq!(section.control().restores.get(), 1);
    }

    #[test]
    fn test_spin_section_excludes() {
        let section = Arc::new(SpinSection::new());
        let counter = Arc::new(AtomicUsize::new(0));

        let handles = (0..4)
            .map(|_| {
                let section = Arc::clone(&section);
                let counter = Arc::clone(&counter);
                thread::spawn(move || {
                    for _ in 0..1000 {
                        let _guard = Exclusive::enter(&*section);
                        // non-atomic read-modify-write under the section
                        let value = counter.load(Ordering::Relaxed);
                        hint::spin_loop();
                        counter.store(value + 1, Ordering::Relaxed);
                    }
                })
            })
            .collect::<Vec<_>>();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(counter.load(Ordering::Relaxed), 4000);
        assert!(!section.is_locked());
    }

    #[test]
    #[should_panic(expected = "SpinSection exited without being entered")]
    fn test_spin_section_unbalanced_exit() {
        let section = SpinSection::new();
        unsafe { section.exit() }
    }
}
