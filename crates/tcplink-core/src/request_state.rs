//! Lock-free request coordination cell
//!
//! `RequestState` is the small atomic state machine that decides, for every
//! suspend/resume boundary, which side owns the link: the worker currently
//! bound to it, or an external waker (selector readiness, reaper timeout,
//! application completion).
//!
//! ```text
//!            to_accept               to_keepalive_start
//!   INIT ──────────────► REQUEST ─────────────────────► KEEPALIVE_START
//!    ▲                    │  ▲                            │         │
//!    │ to_idle            │  │ keepalive_resume    wake   │         │ keepalive_suspend
//!    └────────────────────┘  └──── KEEPALIVE_WAKE ◄───────┘         ▼
//!                         │               ▲               KEEPALIVE_SUSPEND
//!                         │               └──────── wake ───────────┘
//!                         │ async_start
//!                         ▼       wake                 async_suspend
//!                    ASYNC_START ──────► ASYNC_WAKE    ASYNC_START ──► SUSPEND
//!                         ▲  async_resume   │          SUSPEND ──wake──► ASYNC_WAKE
//!                         └─────────────────┘
//!
//!   any ──to_destroy──► DESTROY   (terminal, idempotent)
//! ```
//!
//! # Protocol
//!
//! Every operation is one compare-and-swap from the observed state. When the
//! CAS loses, the operation re-reads the state and re-evaluates the table from
//! what it actually sees. Whoever loses a suspend/wake race finds out from
//! the return value:
//!
//! - a waker that gets `true` must schedule the resume task
//! - an owner whose suspend returns `false` must keep going (or schedule the
//!   resume itself) instead of detaching
//!
//! Exactly one side ends up responsible for the next dispatch.
//!
//! # Primitive
//!
//! Backed by a single `AtomicU8` with `AcqRel` CAS and `Acquire` loads. The
//! retry loop is lock-free but not fair: a thread can in principle lose the
//! CAS repeatedly, although each loss means another thread made progress.

use core::fmt;
use std::sync::atomic::{AtomicU8, Ordering};

use crate::error::{IllegalTransition, Machine};

/// Coordination state of one link
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RequestState {
    /// Idle, not claimed by any connection
    Init = 0,

    /// A worker owns the link and is processing
    Request = 1,

    /// Owner is registering the link with the selector
    KeepaliveStart = 2,

    /// Selector (or timeout) fired; a keepalive task is due
    KeepaliveWake = 3,

    /// Owner detached; the selector holds the link
    KeepaliveSuspend = 4,

    /// Owner entered an async (comet) cycle
    AsyncStart = 5,

    /// Async cycle was woken; a resume is due
    AsyncWake = 6,

    /// Owner detached; waiting for an async wake or the reaper
    Suspend = 7,

    /// Terminal
    Destroy = 8,
}

impl RequestState {
    pub const fn name(&self) -> &'static str {
        match self {
            RequestState::Init => "INIT",
            RequestState::Request => "REQUEST",
            RequestState::KeepaliveStart => "KEEPALIVE_START",
            RequestState::KeepaliveWake => "KEEPALIVE_WAKE",
            RequestState::KeepaliveSuspend => "KEEPALIVE_SUSPEND",
            RequestState::AsyncStart => "ASYNC_START",
            RequestState::AsyncWake => "ASYNC_WAKE",
            RequestState::Suspend => "SUSPEND",
            RequestState::Destroy => "DESTROY",
        }
    }

    /// No worker is bound; the next dispatch is up to whoever wakes it
    #[inline]
    pub const fn is_detached(&self) -> bool {
        matches!(
            self,
            RequestState::Init | RequestState::KeepaliveSuspend | RequestState::Suspend
        )
    }

    #[inline]
    pub const fn is_async(&self) -> bool {
        matches!(
            self,
            RequestState::AsyncStart | RequestState::AsyncWake | RequestState::Suspend
        )
    }

    #[inline]
    pub const fn is_keepalive(&self) -> bool {
        matches!(
            self,
            RequestState::KeepaliveStart
                | RequestState::KeepaliveWake
                | RequestState::KeepaliveSuspend
        )
    }

    #[inline]
    pub const fn is_destroyed(&self) -> bool {
        matches!(self, RequestState::Destroy)
    }
}

impl From<u8> for RequestState {
    fn from(v: u8) -> Self {
        match v {
            0 => RequestState::Init,
            1 => RequestState::Request,
            2 => RequestState::KeepaliveStart,
            3 => RequestState::KeepaliveWake,
            4 => RequestState::KeepaliveSuspend,
            5 => RequestState::AsyncStart,
            6 => RequestState::AsyncWake,
            7 => RequestState::Suspend,
            _ => RequestState::Destroy,
        }
    }
}

impl fmt::Display for RequestState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Result of `to_destroy`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DestroyOutcome {
    /// Someone else already destroyed the link
    AlreadyDestroyed,
    /// A worker owns the link and will see DESTROY when it finishes
    Owned,
    /// Nobody owns the link; the caller must tear it down
    Detached,
}

#[derive(Debug, Clone, Copy)]
enum Op {
    Accept,
    KeepaliveStart,
    KeepaliveCancel,
    KeepaliveWake,
    KeepaliveSuspend,
    KeepaliveResume,
    AsyncStart,
    AsyncWake,
    AsyncSuspend,
    AsyncResume,
    AsyncComplete,
    Idle,
}

impl Op {
    const fn name(&self) -> &'static str {
        match self {
            Op::Accept => "to_accept",
            Op::KeepaliveStart => "to_keepalive_start",
            Op::KeepaliveCancel => "to_keepalive_cancel",
            Op::KeepaliveWake => "to_wake_keepalive",
            Op::KeepaliveSuspend => "to_keepalive_suspend",
            Op::KeepaliveResume => "to_keepalive_resume",
            Op::AsyncStart => "to_async_start",
            Op::AsyncWake => "to_async_wake",
            Op::AsyncSuspend => "to_async_suspend",
            Op::AsyncResume => "to_async_resume",
            Op::AsyncComplete => "to_async_complete",
            Op::Idle => "to_idle",
        }
    }
}

enum Step {
    Goto(RequestState, bool),
    Stay(bool),
    Illegal,
}

/// The whole transition table
fn step(op: Op, from: RequestState) -> Step {
    use RequestState::*;

    if from == Destroy {
        return Step::Stay(false);
    }

    match (op, from) {
        (Op::Accept, Init) => Step::Goto(Request, true),
        (Op::Accept, _) => Step::Stay(false),

        (Op::KeepaliveStart, Request) => Step::Goto(KeepaliveStart, true),

        // Owner could not register; it absorbs any wake that already landed
        (Op::KeepaliveCancel, KeepaliveStart | KeepaliveWake) => Step::Goto(Request, true),

        // Owner still holds the thread and will notice the wake itself
        (Op::KeepaliveWake, KeepaliveStart) => Step::Goto(KeepaliveWake, false),
        (Op::KeepaliveWake, KeepaliveSuspend) => Step::Goto(KeepaliveWake, true),
        // Stale wakes after the link moved on are dropped
        (Op::KeepaliveWake, _) => Step::Stay(false),

        (Op::KeepaliveSuspend, KeepaliveStart) => Step::Goto(KeepaliveSuspend, true),
        (Op::KeepaliveSuspend, KeepaliveWake) => Step::Stay(false),

        (Op::KeepaliveResume, KeepaliveWake) => Step::Goto(Request, true),

        (Op::AsyncStart, Request) => Step::Goto(AsyncStart, true),
        (Op::AsyncStart, AsyncStart | AsyncWake) => Step::Stay(true),

        (Op::AsyncWake, AsyncStart) => Step::Goto(AsyncWake, false),
        (Op::AsyncWake, Suspend) => Step::Goto(AsyncWake, true),
        (Op::AsyncWake, _) => Step::Stay(false),

        (Op::AsyncSuspend, AsyncStart) => Step::Goto(Suspend, true),
        (Op::AsyncSuspend, AsyncWake) => Step::Stay(false),

        (Op::AsyncResume, AsyncWake) => Step::Goto(AsyncStart, true),
        (Op::AsyncResume, AsyncStart) => Step::Stay(true),

        (Op::AsyncComplete, AsyncStart | AsyncWake) => Step::Goto(Request, true),
        (Op::AsyncComplete, Request) => Step::Stay(true),

        (Op::Idle, Request | AsyncStart | AsyncWake | KeepaliveStart | KeepaliveWake) => {
            Step::Goto(Init, true)
        }
        (Op::Idle, Init) => Step::Stay(true),

        _ => Step::Illegal,
    }
}

/// Atomic cell holding a [`RequestState`]
#[derive(Debug)]
pub struct RequestStateCell {
    state: AtomicU8,
}

impl Default for RequestStateCell {
    fn default() -> Self {
        Self::new()
    }
}

impl RequestStateCell {
    pub const fn new() -> Self {
        Self {
            state: AtomicU8::new(RequestState::Init as u8),
        }
    }

    #[inline]
    pub fn get(&self) -> RequestState {
        RequestState::from(self.state.load(Ordering::Acquire))
    }

    #[inline]
    pub fn is_destroyed(&self) -> bool {
        self.get().is_destroyed()
    }

    fn apply(&self, op: Op) -> Result<bool, IllegalTransition> {
        let mut current = self.state.load(Ordering::Acquire);

        loop {
            let from = RequestState::from(current);

            match step(op, from) {
                Step::Stay(ret) => return Ok(ret),
                Step::Illegal => {
                    return Err(IllegalTransition {
                        machine: Machine::Request,
                        from: from.name(),
                        event: op.name(),
                    })
                }
                Step::Goto(to, ret) => {
                    match self.state.compare_exchange(
                        current,
                        to as u8,
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    ) {
                        Ok(_) => return Ok(ret),
                        Err(actual) => current = actual,
                    }
                }
            }
        }
    }

    /// Claim an idle link for a new connection. `false` if someone else won.
    pub fn to_accept(&self) -> bool {
        // Accept never faults
        self.apply(Op::Accept).unwrap_or(false)
    }

    /// Owner is about to register with the selector
    pub fn to_keepalive_start(&self) -> Result<bool, IllegalTransition> {
        self.apply(Op::KeepaliveStart)
    }

    /// Owner gave up on selector registration and keeps the thread
    pub fn to_keepalive_cancel(&self) -> Result<bool, IllegalTransition> {
        self.apply(Op::KeepaliveCancel)
    }

    /// External wake of a keepalive link.
    ///
    /// `true`: the link was detached and the caller must schedule the
    /// keepalive task. `false`: the owner will handle it, or the wake is stale.
    pub fn to_wake_keepalive(&self) -> bool {
        self.apply(Op::KeepaliveWake).unwrap_or(false)
    }

    /// Owner detaches after a successful selector registration.
    ///
    /// `false` means a wake already arrived and the owner must schedule the
    /// keepalive task itself.
    pub fn to_keepalive_suspend(&self) -> Result<bool, IllegalTransition> {
        self.apply(Op::KeepaliveSuspend)
    }

    /// Keepalive task start: KEEPALIVE_WAKE back to REQUEST
    pub fn to_keepalive_resume(&self) -> Result<bool, IllegalTransition> {
        self.apply(Op::KeepaliveResume)
    }

    pub fn to_async_start(&self) -> Result<bool, IllegalTransition> {
        self.apply(Op::AsyncStart)
    }

    /// External wake of an async cycle. `true`: caller schedules the resume.
    pub fn to_async_wake(&self) -> bool {
        self.apply(Op::AsyncWake).unwrap_or(false)
    }

    /// Owner detaches from an async cycle. `false`: already woken, keep going.
    pub fn to_async_suspend(&self) -> Result<bool, IllegalTransition> {
        self.apply(Op::AsyncSuspend)
    }

    /// Resume start: consume a pending wake
    pub fn to_async_resume(&self) -> Result<bool, IllegalTransition> {
        self.apply(Op::AsyncResume)
    }

    /// Async cycle finished; back to plain request processing
    pub fn to_async_complete(&self) -> Result<bool, IllegalTransition> {
        self.apply(Op::AsyncComplete)
    }

    /// Owner releases the link back to INIT
    pub fn to_idle(&self) -> Result<bool, IllegalTransition> {
        self.apply(Op::Idle)
    }

    /// Move to DESTROY from anywhere. Idempotent.
    pub fn to_destroy(&self) -> DestroyOutcome {
        let mut current = self.state.load(Ordering::Acquire);

        loop {
            let from = RequestState::from(current);
            if from.is_destroyed() {
                return DestroyOutcome::AlreadyDestroyed;
            }

            match self.state.compare_exchange(
                current,
                RequestState::Destroy as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) if from.is_detached() => return DestroyOutcome::Detached,
                Ok(_) => return DestroyOutcome::Owned,
                Err(actual) => current = actual,
            }
        }
    }

    /// Force INIT. Only valid while the caller holds the link exclusively
    /// (pool reuse).
    pub fn reset(&self) {
        self.state.store(RequestState::Init as u8, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::{Arc, Barrier};
    use std::thread;

    fn cell_in(state: RequestState) -> RequestStateCell {
        let cell = RequestStateCell::new();
        cell.state.store(state as u8, Ordering::SeqCst);
        cell
    }

    #[test]
    fn test_accept_claims_once() {
        let cell = RequestStateCell::new();
        assert!(cell.to_accept());
        assert!(!cell.to_accept());
        assert_eq!(cell.get(), RequestState::Request);
    }

    #[test]
    fn test_keepalive_cycle() {
        let cell = cell_in(RequestState::Request);
        assert_eq!(cell.to_keepalive_start(), Ok(true));
        assert_eq!(cell.to_keepalive_suspend(), Ok(true));
        assert_eq!(cell.get(), RequestState::KeepaliveSuspend);

        assert!(cell.to_wake_keepalive());
        assert!(!cell.to_wake_keepalive(), "second wake must not reschedule");
        assert_eq!(cell.to_keepalive_resume(), Ok(true));
        assert_eq!(cell.get(), RequestState::Request);
    }

    #[test]
    fn test_wake_before_suspend_keeps_owner() {
        let cell = cell_in(RequestState::KeepaliveStart);
        assert!(!cell.to_wake_keepalive());
        assert_eq!(cell.get(), RequestState::KeepaliveWake);
        assert_eq!(cell.to_keepalive_suspend(), Ok(false));
        assert_eq!(cell.get(), RequestState::KeepaliveWake);
    }

    #[test]
    fn test_async_cycle() {
        let cell = cell_in(RequestState::Request);
        assert_eq!(cell.to_async_start(), Ok(true));
        assert_eq!(cell.to_async_suspend(), Ok(true));
        assert!(cell.to_async_wake());
        assert_eq!(cell.to_async_resume(), Ok(true));
        assert_eq!(cell.to_async_complete(), Ok(true));
        assert_eq!(cell.get(), RequestState::Request);
        assert_eq!(cell.to_idle(), Ok(true));
        assert_eq!(cell.get(), RequestState::Init);
    }

    #[test]
    fn test_async_wake_before_suspend() {
        let cell = cell_in(RequestState::AsyncStart);
        assert!(!cell.to_async_wake());
        assert_eq!(cell.to_async_suspend(), Ok(false));
        assert_eq!(cell.get(), RequestState::AsyncWake);
    }

    #[test]
    fn test_illegal_transition() {
        let cell = cell_in(RequestState::Suspend);
        let err = cell.to_keepalive_start().unwrap_err();
        assert_eq!(err.from, "SUSPEND");
        assert_eq!(err.event, "to_keepalive_start");
        assert_eq!(cell.get(), RequestState::Suspend);

        assert!(cell.to_idle().is_err());
    }

    #[test]
    fn test_destroy_outcomes() {
        assert_eq!(cell_in(RequestState::Init).to_destroy(), DestroyOutcome::Detached);
        assert_eq!(cell_in(RequestState::Suspend).to_destroy(), DestroyOutcome::Detached);
        assert_eq!(cell_in(RequestState::Request).to_destroy(), DestroyOutcome::Owned);

        let cell = cell_in(RequestState::AsyncWake);
        assert_eq!(cell.to_destroy(), DestroyOutcome::Owned);
        assert_eq!(cell.to_destroy(), DestroyOutcome::AlreadyDestroyed);
    }

    #[test]
    fn test_destroy_absorbs_everything() {
        let cell = cell_in(RequestState::Destroy);
        assert!(!cell.to_accept());
        assert!(!cell.to_wake_keepalive());
        assert!(!cell.to_async_wake());
        assert_eq!(cell.to_keepalive_start(), Ok(false));
        assert_eq!(cell.to_keepalive_suspend(), Ok(false));
        assert_eq!(cell.to_async_start(), Ok(false));
        assert_eq!(cell.to_async_suspend(), Ok(false));
        assert_eq!(cell.to_async_complete(), Ok(false));
        assert_eq!(cell.to_idle(), Ok(false));
        assert_eq!(cell.get(), RequestState::Destroy);
    }

    #[test]
    fn test_concurrent_destroy_is_terminal() {
        const THREADS: usize = 8;

        for _ in 0..200 {
            let cell = Arc::new(RequestStateCell::new());
            let barrier = Arc::new(Barrier::new(THREADS));
            let destroyers = Arc::new(AtomicUsize::new(0));

            let handles: Vec<_> = (0..THREADS)
                .map(|i| {
                    let cell = Arc::clone(&cell);
                    let barrier = Arc::clone(&barrier);
                    let destroyers = Arc::clone(&destroyers);
                    thread::spawn(move || {
                        barrier.wait();
                        for round in 0..50 {
                            match (i + round) % 6 {
                                0 => {
                                    cell.to_accept();
                                }
                                1 => {
                                    let _ = cell.to_keepalive_start();
                                }
                                2 => {
                                    cell.to_wake_keepalive();
                                }
                                3 => {
                                    let _ = cell.to_async_start();
                                    cell.to_async_wake();
                                }
                                4 => {
                                    let _ = cell.to_idle();
                                }
                                _ => {
                                    if cell.to_destroy() != DestroyOutcome::AlreadyDestroyed {
                                        destroyers.fetch_add(1, Ordering::SeqCst);
                                    }
                                }
                            }
                        }
                    })
                })
                .collect();

            for h in handles {
                h.join().unwrap();
            }

            assert_eq!(cell.get(), RequestState::Destroy);
            assert_eq!(destroyers.load(Ordering::SeqCst), 1);
        }
    }

    #[test]
    fn test_wake_timeout_race_schedules_once() {
        for _ in 0..2000 {
            let cell = Arc::new(cell_in(RequestState::KeepaliveStart));
            let barrier = Arc::new(Barrier::new(3));
            let schedules = Arc::new(AtomicUsize::new(0));

            let wakers: Vec<_> = (0..2)
                .map(|_| {
                    let cell = Arc::clone(&cell);
                    let barrier = Arc::clone(&barrier);
                    let schedules = Arc::clone(&schedules);
                    thread::spawn(move || {
                        barrier.wait();
                        if cell.to_wake_keepalive() {
                            schedules.fetch_add(1, Ordering::SeqCst);
                        }
                    })
                })
                .collect();

            barrier.wait();
            if !cell.to_keepalive_suspend().unwrap() {
                schedules.fetch_add(1, Ordering::SeqCst);
            }

            for w in wakers {
                w.join().unwrap();
            }

            assert_eq!(schedules.load(Ordering::SeqCst), 1);
            assert_eq!(cell.get(), RequestState::KeepaliveWake);
        }
    }

    #[test]
    fn test_comet_wake_race_schedules_once() {
        for _ in 0..2000 {
            let cell = Arc::new(cell_in(RequestState::AsyncStart));
            let schedules = Arc::new(AtomicUsize::new(0));

            let waker = {
                let cell = Arc::clone(&cell);
                let schedules = Arc::clone(&schedules);
                thread::spawn(move || {
                    if cell.to_async_wake() {
                        schedules.fetch_add(1, Ordering::SeqCst);
                    }
                })
            };

            if !cell.to_async_suspend().unwrap() {
                schedules.fetch_add(1, Ordering::SeqCst);
            }
            waker.join().unwrap();

            assert_eq!(schedules.load(Ordering::SeqCst), 1);
        }
    }
}
