//! two-phase optimistic writes
//!
//! ```text
//! Idle ──begin──▶ Pending ──commit───▶ Committed
//!                    │
//!                    └──rollback──▶ RolledBack (slot restored)
//! ```
//!
//! `begin` applies the tentative value to the slot right away and remembers
//! the prior one; only one write may be pending per field.

#[derive(Debug, Clone, PartialEq, Default)]
pub enum WritePhase<T> {
    #[default]
    Idle,
    Pending {
        prior: T,
    },
    Committed,
    RolledBack,
}

#[derive(Debug, Clone, Default)]
pub struct TwoPhaseWrite<T> {
    phase: WritePhase<T>,
}

impl<T: Clone> TwoPhaseWrite<T> {
    pub fn new() -> Self {
        Self { phase: WritePhase::Idle }
    }

    pub fn phase(&self) -> &WritePhase<T> {
        &self.phase
    }

    pub fn is_pending(&self) -> bool {
        matches!(self.phase, WritePhase::Pending { .. })
    }

    /// returns false, leaving the slot untouched, if a write is already pending
    pub fn begin(&mut self, slot: &mut T, tentative: T) -> bool {
        if self.is_pending() {
            return false;
        }
        self.phase = WritePhase::Pending { prior: slot.clone() };
        *slot = tentative;
        true
    }

    pub fn commit(&mut self) {
        if self.is_pending() {
            self.phase = WritePhase::Committed;
        }
    }

    pub fn rollback(&mut self, slot: &mut T) {
        match std::mem::replace(&mut self.phase, WritePhase::Idle) {
            WritePhase::Pending { prior } => {
                *slot = prior;
                self.phase = WritePhase::RolledBack;
            }
            other => self.phase = other,
        }
    }
}
