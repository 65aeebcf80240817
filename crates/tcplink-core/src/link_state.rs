//! Per-link phase machine
//!
//! `LinkState` tracks which phase a connection is in. Unlike
//! [`RequestState`](crate::request_state::RequestState) it is only mutated by
//! the worker that owns the link (under the link's state lock), so it is a
//! plain value with a pure transition function.
//!
//! ```text
//! INIT ─► ACCEPT ─► REQUEST_ACTIVE ─► KEEPALIVE ─► KEEPALIVE_SELECT ─┐
//!   ▲                 ▲   │  │  ▲          └──(thread wait)──────────┤
//!   │                 │   │  │  └────────────────────────────────────┘
//!   │                 │   │  └─► COMET_ACTIVE ─► COMET_SUSPEND ─┐
//!   │                 └───┼──────────────────────────────────────┘
//!   │                     └─► DUPLEX ◄─► DUPLEX_ACTIVE
//!   │
//!   └── CLOSED ◄── (any)          (any) ──► DESTROYED
//! ```
//!
//! Each transition also reports its side effects on two port-wide
//! resources: the keepalive slot budget and the suspended-link set. The
//! caller applies them while still holding the state lock, so the counts
//! never drift from the states.

use core::fmt;

use crate::error::{IllegalTransition, Machine};

/// Phase of a link
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum LinkState {
    #[default]
    Init,
    Accept,
    RequestActive { keepalive: bool },
    Keepalive,
    KeepaliveSelect,
    CometActive { keepalive: bool },
    CometSuspend { keepalive: bool },
    Duplex,
    DuplexActive,
    Closed,
    Destroyed,
}

/// Events driving [`LinkState`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkEvent {
    ToInit,
    ToAccept,
    ToActive { keepalive_allowed: bool },
    KillKeepalive,
    ToKeepalive,
    ToKeepaliveSelect,
    ToComet,
    ToCometSuspend,
    ToCometResume,
    ToDuplex,
    ToDuplexActive,
    ToClosed,
    ToDestroy,
}

impl LinkEvent {
    pub const fn name(&self) -> &'static str {
        match self {
            LinkEvent::ToInit => "to_init",
            LinkEvent::ToAccept => "to_accept",
            LinkEvent::ToActive { .. } => "to_active",
            LinkEvent::KillKeepalive => "kill_keepalive",
            LinkEvent::ToKeepalive => "to_keepalive",
            LinkEvent::ToKeepaliveSelect => "to_keepalive_select",
            LinkEvent::ToComet => "to_comet",
            LinkEvent::ToCometSuspend => "to_comet_suspend",
            LinkEvent::ToCometResume => "to_comet_resume",
            LinkEvent::ToDuplex => "to_duplex",
            LinkEvent::ToDuplexActive => "to_duplex_active",
            LinkEvent::ToClosed => "to_closed",
            LinkEvent::ToDestroy => "to_destroy",
        }
    }

    /// Every event, for exhaustive table walks
    pub const ALL: [LinkEvent; 14] = [
        LinkEvent::ToInit,
        LinkEvent::ToAccept,
        LinkEvent::ToActive { keepalive_allowed: true },
        LinkEvent::ToActive { keepalive_allowed: false },
        LinkEvent::KillKeepalive,
        LinkEvent::ToKeepalive,
        LinkEvent::ToKeepaliveSelect,
        LinkEvent::ToComet,
        LinkEvent::ToCometSuspend,
        LinkEvent::ToCometResume,
        LinkEvent::ToDuplex,
        LinkEvent::ToDuplexActive,
        LinkEvent::ToClosed,
        LinkEvent::ToDestroy,
    ];
}

/// Effect of a transition on a port-wide resource
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Slot {
    Keep,
    Acquire,
    Release,
}

/// Outcome of [`LinkState::next`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub next: LinkState,
    /// Keepalive slot budget
    pub keepalive: Slot,
    /// Membership in the suspended-link set
    pub suspend: Slot,
}

impl Transition {
    const fn to(next: LinkState) -> Self {
        Self {
            next,
            keepalive: Slot::Keep,
            suspend: Slot::Keep,
        }
    }

    const fn keepalive(mut self, slot: Slot) -> Self {
        self.keepalive = slot;
        self
    }

    const fn suspend(mut self, slot: Slot) -> Self {
        self.suspend = slot;
        self
    }
}

impl LinkState {
    pub const fn name(&self) -> &'static str {
        match self {
            LinkState::Init => "INIT",
            LinkState::Accept => "ACCEPT",
            LinkState::RequestActive { keepalive: false } => "REQUEST_ACTIVE",
            LinkState::RequestActive { keepalive: true } => "REQUEST_ACTIVE_KA",
            LinkState::Keepalive => "KEEPALIVE",
            LinkState::KeepaliveSelect => "KEEPALIVE_SELECT",
            LinkState::CometActive { keepalive: false } => "COMET_ACTIVE",
            LinkState::CometActive { keepalive: true } => "COMET_ACTIVE_KA",
            LinkState::CometSuspend { keepalive: false } => "COMET_SUSPEND",
            LinkState::CometSuspend { keepalive: true } => "COMET_SUSPEND_KA",
            LinkState::Duplex => "DUPLEX",
            LinkState::DuplexActive => "DUPLEX_ACTIVE",
            LinkState::Closed => "CLOSED",
            LinkState::Destroyed => "DESTROYED",
        }
    }

    /// Handler code may be running
    #[inline]
    pub const fn is_active(&self) -> bool {
        matches!(
            self,
            LinkState::RequestActive { .. } | LinkState::CometActive { .. } | LinkState::DuplexActive
        )
    }

    /// This link holds one of the port's keepalive slots
    #[inline]
    pub const fn is_keepalive_allocated(&self) -> bool {
        matches!(
            self,
            LinkState::RequestActive { keepalive: true }
                | LinkState::Keepalive
                | LinkState::KeepaliveSelect
                | LinkState::CometActive { keepalive: true }
                | LinkState::CometSuspend { keepalive: true }
        )
    }

    /// Waiting for the next request on a kept-alive connection
    #[inline]
    pub const fn is_keepalive(&self) -> bool {
        matches!(self, LinkState::Keepalive | LinkState::KeepaliveSelect)
    }

    #[inline]
    pub const fn is_comet(&self) -> bool {
        matches!(
            self,
            LinkState::CometActive { .. } | LinkState::CometSuspend { .. }
        )
    }

    #[inline]
    pub const fn is_comet_suspend(&self) -> bool {
        matches!(self, LinkState::CometSuspend { .. })
    }

    #[inline]
    pub const fn is_duplex(&self) -> bool {
        matches!(self, LinkState::Duplex | LinkState::DuplexActive)
    }

    #[inline]
    pub const fn is_closed(&self) -> bool {
        matches!(self, LinkState::Closed | LinkState::Destroyed)
    }

    #[inline]
    pub const fn is_destroyed(&self) -> bool {
        matches!(self, LinkState::Destroyed)
    }

    /// May be parked in the idle pool
    #[inline]
    pub const fn allows_idle(&self) -> bool {
        matches!(self, LinkState::Init | LinkState::Closed)
    }

    /// The transition table
    pub fn next(self, event: LinkEvent) -> Result<Transition, IllegalTransition> {
        use LinkEvent as E;
        use LinkState as S;

        let t = match (self, event) {
            (S::Destroyed, E::ToClosed | E::ToDestroy) => Transition::to(S::Destroyed),

            (S::Init | S::Closed, E::ToInit) => Transition::to(S::Init),
            (S::Init | S::Closed, E::ToAccept) => Transition::to(S::Accept),

            (S::Accept, E::ToActive { keepalive_allowed }) => {
                let slot = if keepalive_allowed { Slot::Acquire } else { Slot::Keep };
                Transition::to(S::RequestActive { keepalive: keepalive_allowed }).keepalive(slot)
            }
            (S::Keepalive | S::KeepaliveSelect, E::ToActive { keepalive_allowed }) => {
                let slot = if keepalive_allowed { Slot::Keep } else { Slot::Release };
                Transition::to(S::RequestActive { keepalive: keepalive_allowed }).keepalive(slot)
            }
            (S::RequestActive { keepalive }, E::ToActive { keepalive_allowed }) => {
                let slot = match (keepalive, keepalive_allowed) {
                    (true, false) => Slot::Release,
                    (false, true) => Slot::Acquire,
                    _ => Slot::Keep,
                };
                Transition::to(S::RequestActive { keepalive: keepalive_allowed }).keepalive(slot)
            }

            (S::RequestActive { keepalive: true }, E::KillKeepalive)
            | (S::Keepalive | S::KeepaliveSelect, E::KillKeepalive) => {
                Transition::to(S::RequestActive { keepalive: false }).keepalive(Slot::Release)
            }
            (S::CometActive { keepalive: true }, E::KillKeepalive) => {
                Transition::to(S::CometActive { keepalive: false }).keepalive(Slot::Release)
            }
            (S::CometSuspend { keepalive: true }, E::KillKeepalive) => {
                Transition::to(S::CometSuspend { keepalive: false }).keepalive(Slot::Release)
            }
            (state, E::KillKeepalive) => Transition::to(state),

            (S::RequestActive { keepalive: true }, E::ToKeepalive) => {
                Transition::to(S::Keepalive)
            }
            // Spurious selector wake: wait again
            (S::KeepaliveSelect, E::ToKeepalive) => Transition::to(S::Keepalive),
            (S::Keepalive, E::ToKeepaliveSelect) => Transition::to(S::KeepaliveSelect),

            (S::RequestActive { keepalive }, E::ToComet)
            | (S::CometActive { keepalive }, E::ToComet) => {
                Transition::to(S::CometActive { keepalive })
            }
            (S::CometActive { keepalive }, E::ToCometSuspend) => {
                Transition::to(S::CometSuspend { keepalive }).suspend(Slot::Acquire)
            }
            (S::CometSuspend { keepalive }, E::ToCometResume) => {
                Transition::to(S::RequestActive { keepalive }).suspend(Slot::Release)
            }
            (S::CometActive { keepalive }, E::ToCometResume) => {
                Transition::to(S::RequestActive { keepalive })
            }

            (S::RequestActive { keepalive }, E::ToDuplex) => {
                let slot = if keepalive { Slot::Release } else { Slot::Keep };
                Transition::to(S::Duplex).keepalive(slot)
            }
            (S::DuplexActive, E::ToDuplex) => Transition::to(S::Duplex),
            (S::Duplex | S::DuplexActive, E::ToDuplexActive) => Transition::to(S::DuplexActive),

            (state, E::ToClosed | E::ToDestroy) => {
                let next = if event == E::ToDestroy { S::Destroyed } else { S::Closed };
                let keepalive = if state.is_keepalive_allocated() { Slot::Release } else { Slot::Keep };
                let suspend = if state.is_comet_suspend() { Slot::Release } else { Slot::Keep };
                Transition::to(next).keepalive(keepalive).suspend(suspend)
            }

            (from, event) => {
                return Err(IllegalTransition {
                    machine: Machine::Link,
                    from: from.name(),
                    event: event.name(),
                })
            }
        };

        Ok(t)
    }
}

impl fmt::Display for LinkState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn walk(state: LinkState, events: &[LinkEvent]) -> LinkState {
        events
            .iter()
            .fold(state, |s, e| s.next(*e).unwrap().next)
    }

    #[test]
    fn test_request_keepalive_path() {
        let s = walk(
            LinkState::Init,
            &[
                LinkEvent::ToAccept,
                LinkEvent::ToActive { keepalive_allowed: true },
                LinkEvent::ToKeepalive,
                LinkEvent::ToKeepaliveSelect,
            ],
        );
        assert_eq!(s, LinkState::KeepaliveSelect);
        assert!(s.is_keepalive_allocated());

        let t = s.next(LinkEvent::ToActive { keepalive_allowed: false }).unwrap();
        assert_eq!(t.next, LinkState::RequestActive { keepalive: false });
        assert_eq!(t.keepalive, Slot::Release);
    }

    #[test]
    fn test_comet_suspend_registers() {
        let s = LinkState::RequestActive { keepalive: true };
        let t = s.next(LinkEvent::ToComet).unwrap();
        assert_eq!(t.next, LinkState::CometActive { keepalive: true });

        let t = t.next.next(LinkEvent::ToCometSuspend).unwrap();
        assert_eq!(t.suspend, Slot::Acquire);
        assert!(t.next.is_comet_suspend());

        let closed = t.next.next(LinkEvent::ToClosed).unwrap();
        assert_eq!(closed.next, LinkState::Closed);
        assert_eq!(closed.suspend, Slot::Release);
        assert_eq!(closed.keepalive, Slot::Release);
    }

    #[test]
    fn test_duplex_drops_keepalive() {
        let t = LinkState::RequestActive { keepalive: true }
            .next(LinkEvent::ToDuplex)
            .unwrap();
        assert_eq!(t.next, LinkState::Duplex);
        assert_eq!(t.keepalive, Slot::Release);

        // One-way: no path back to request processing
        assert!(LinkState::Duplex
            .next(LinkEvent::ToActive { keepalive_allowed: true })
            .is_err());
        assert!(LinkState::DuplexActive.next(LinkEvent::ToComet).is_err());
    }

    #[test]
    fn test_illegal() {
        let err = LinkState::Init.next(LinkEvent::ToKeepalive).unwrap_err();
        assert_eq!(err.from, "INIT");
        assert_eq!(err.event, "to_keepalive");

        // Keepalive requires an allocated slot
        assert!(LinkState::RequestActive { keepalive: false }
            .next(LinkEvent::ToKeepalive)
            .is_err());
    }

    #[test]
    fn test_destroyed_is_terminal() {
        for event in LinkEvent::ALL {
            match LinkState::Destroyed.next(event) {
                Ok(t) => {
                    assert_eq!(t.next, LinkState::Destroyed);
                    assert_eq!(t.keepalive, Slot::Keep);
                    assert_eq!(t.suspend, Slot::Keep);
                }
                Err(_) => {}
            }
        }
    }

    /// Walk every legal event sequence up to a fixed depth and check that
    /// the reported slot effects always match the state predicates.
    #[test]
    fn test_slot_accounting_never_drifts() {
        fn explore(state: LinkState, keepalive: i32, suspend: i32, depth: usize) {
            assert_eq!(keepalive, state.is_keepalive_allocated() as i32, "{state}");
            assert_eq!(suspend, state.is_comet_suspend() as i32, "{state}");

            if depth == 0 {
                return;
            }

            for event in LinkEvent::ALL {
                if let Ok(t) = state.next(event) {
                    let delta = |slot| match slot {
                        Slot::Keep => 0,
                        Slot::Acquire => 1,
                        Slot::Release => -1,
                    };
                    explore(
                        t.next,
                        keepalive + delta(t.keepalive),
                        suspend + delta(t.suspend),
                        depth - 1,
                    );
                }
            }
        }

        explore(LinkState::Init, 0, 0, 6);
    }
}
