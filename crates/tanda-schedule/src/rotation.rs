//! Rotation order and claim eligibility.

use crate::cycle::Cycle;
use crate::error::{Result, ScheduleError};

/// How many claims happen before `position` gets its turn, counting from the
/// current recipient (who is zero positions ahead).
///
/// Both indices must be below `count`.
pub const fn positions_ahead(position: usize, current_recipient: usize, count: usize) -> usize {
    if position >= current_recipient {
        position - current_recipient
    } else {
        count - current_recipient + position
    }
}

/// The participant order of a pool together with whose turn it is.
#[derive(Debug, Clone, Copy)]
pub struct Rotation<'a, S> {
    participants: &'a [S],
    current_recipient: usize,
}

impl<'a, S: AsRef<str>> Rotation<'a, S> {
    /// Create a rotation. Rejects an empty participant list and an
    /// out-of-range recipient index.
    pub fn new(participants: &'a [S], current_recipient: usize) -> Result<Self> {
        if participants.is_empty() {
            return Err(ScheduleError::EmptyRotation);
        }
        if current_recipient >= participants.len() {
            return Err(ScheduleError::RecipientOutOfRange {
                index: current_recipient,
                count: participants.len(),
            });
        }
        Ok(Self {
            participants,
            current_recipient,
        })
    }

    /// Number of participants in the rotation.
    pub fn len(&self) -> usize {
        self.participants.len()
    }

    /// Always false; an empty rotation cannot be constructed.
    pub fn is_empty(&self) -> bool {
        self.participants.is_empty()
    }

    /// Index of the current recipient.
    pub fn current_recipient_index(&self) -> usize {
        self.current_recipient
    }

    /// The participant whose turn it is.
    pub fn current_recipient(&self) -> &'a S {
        let participants: &'a [S] = self.participants;
        &participants[self.current_recipient]
    }

    /// Rotation position of `participant` (case-insensitive).
    pub fn position_of(&self, participant: &str) -> Option<usize> {
        self.participants
            .iter()
            .position(|p| p.as_ref().eq_ignore_ascii_case(participant))
    }

    /// Claims ahead of the participant at `position`.
    pub fn positions_ahead(&self, position: usize) -> usize {
        positions_ahead(position, self.current_recipient, self.participants.len())
    }

    /// Participants in rotation order.
    pub fn participants(&self) -> &'a [S] {
        self.participants
    }
}

/// A cycle plus a rotation: everything needed to answer timing questions.
#[derive(Debug, Clone, Copy)]
pub struct Schedule<'a, S> {
    cycle: Cycle,
    rotation: Rotation<'a, S>,
    all_have_paid: bool,
}

impl<'a, S: AsRef<str>> Schedule<'a, S> {
    /// Combine observed cycle state.
    pub fn new(cycle: Cycle, rotation: Rotation<'a, S>, all_have_paid: bool) -> Self {
        Self {
            cycle,
            rotation,
            all_have_paid,
        }
    }

    /// The underlying cycle.
    pub fn cycle(&self) -> Cycle {
        self.cycle
    }

    /// The underlying rotation.
    pub fn rotation(&self) -> &Rotation<'a, S> {
        &self.rotation
    }

    /// Whether every participant has paid into the current cycle.
    pub fn all_have_paid(&self) -> bool {
        self.all_have_paid
    }

    /// See [`Cycle::next_payment_due`].
    pub fn next_payment_due(&self, now: u64) -> Result<u64> {
        self.cycle.next_payment_due(now)
    }

    /// Claim instant for whoever is outside the rotation: now once everyone
    /// has paid, otherwise the end of the cycle.
    pub fn default_claim_at(&self, now: u64) -> Result<u64> {
        if self.all_have_paid {
            Ok(now)
        } else {
            self.cycle.end()
        }
    }

    /// Claim instant of the participant at rotation `position`.
    ///
    /// May be in the past: that means the participant can claim now.
    pub fn claim_at_position(&self, position: usize) -> Result<u64> {
        let k = self.rotation.positions_ahead(position) as u64;
        self.cycle
            .boundary(k.checked_add(1).ok_or(ScheduleError::Overflow)?)
    }

    /// When `participant` may claim the vault.
    pub fn claim_eligible_at(&self, participant: &str, now: u64) -> Result<u64> {
        match self.rotation.position_of(participant) {
            Some(position) => self.claim_at_position(position),
            None => self.default_claim_at(now),
        }
    }

    /// Claim instants for every participant, in rotation order.
    pub fn claim_schedule(&self) -> Result<Vec<(&'a S, u64)>> {
        self.rotation
            .participants()
            .iter()
            .enumerate()
            .map(|(position, participant)| Ok((participant, self.claim_at_position(position)?)))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn names(n: usize) -> Vec<String> {
        (0..n).map(|i| format!("p{}", i)).collect()
    }

    #[test]
    fn empty_rotation_rejected() {
        let empty: [&str; 0] = [];
        assert!(matches!(
            Rotation::new(&empty, 0),
            Err(ScheduleError::EmptyRotation)
        ));
    }

    #[test]
    fn recipient_out_of_range_rejected() {
        let participants = ["a", "b"];
        assert!(matches!(
            Rotation::new(&participants, 2),
            Err(ScheduleError::RecipientOutOfRange { index: 2, count: 2 })
        ));
    }

    #[test]
    fn claims_follow_rotation_from_first_recipient() {
        let participants = names(5);
        let schedule = Schedule::new(
            Cycle::new(1_000, 10).unwrap(),
            Rotation::new(&participants, 0).unwrap(),
            false,
        );
        assert_eq!(schedule.claim_eligible_at("p2", 0).unwrap(), 1_030);
        assert_eq!(schedule.claim_eligible_at("p0", 0).unwrap(), 1_010);
    }

    #[test]
    fn claims_wrap_around() {
        let participants = names(4);
        let rotation = Rotation::new(&participants, 3).unwrap();
        assert_eq!(rotation.positions_ahead(1), 2);

        let schedule = Schedule::new(Cycle::new(1_000, 10).unwrap(), rotation, false);
        assert_eq!(schedule.claim_eligible_at("p1", 0).unwrap(), 1_030);
        assert_eq!(schedule.claim_eligible_at("p3", 0).unwrap(), 1_010);
    }

    #[test]
    fn lookup_is_case_insensitive() {
        let participants = ["0xAbC", "0xDEF"];
        let rotation = Rotation::new(&participants, 0).unwrap();
        assert_eq!(rotation.position_of("0xdef"), Some(1));
        assert_eq!(rotation.position_of("0xABC"), Some(0));
    }

    #[test]
    fn outsider_uses_default_claim() {
        let participants = ["a", "b"];
        let cycle = Cycle::new(1_000, 10).unwrap();

        let unpaid = Schedule::new(cycle, Rotation::new(&participants, 0).unwrap(), false);
        assert_eq!(unpaid.claim_eligible_at("z", 5_000).unwrap(), 1_010);

        let paid = Schedule::new(cycle, Rotation::new(&participants, 0).unwrap(), true);
        assert_eq!(paid.claim_eligible_at("z", 5_000).unwrap(), 5_000);
    }

    #[test]
    fn past_claims_are_not_clamped() {
        let participants = ["a", "b"];
        let schedule = Schedule::new(
            Cycle::new(1_000, 10).unwrap(),
            Rotation::new(&participants, 0).unwrap(),
            false,
        );
        // Long after the cycle: still the literal boundary, in the past.
        assert_eq!(schedule.claim_eligible_at("b", 99_999).unwrap(), 1_020);
    }

    #[test]
    fn full_schedule_in_rotation_order() {
        let participants = ["a", "b", "c"];
        let schedule = Schedule::new(
            Cycle::new(0, 7).unwrap(),
            Rotation::new(&participants, 1).unwrap(),
            false,
        );
        let claims: Vec<(&str, u64)> = schedule
            .claim_schedule()
            .unwrap()
            .into_iter()
            .map(|(p, at)| (*p, at))
            .collect();
        assert_eq!(claims, vec![("a", 21), ("b", 7), ("c", 14)]);
    }

    proptest! {
        #[test]
        fn every_boundary_claimed_once(n in 1usize..40, r_seed in 0usize..1000) {
            let participants = names(n);
            let r = r_seed % n;
            let schedule = Schedule::new(
                Cycle::new(0, 1).unwrap(),
                Rotation::new(&participants, r).unwrap(),
                false,
            );
            let mut claims: Vec<u64> = schedule
                .claim_schedule()
                .unwrap()
                .into_iter()
                .map(|(_, at)| at)
                .collect();
            claims.sort_unstable();
            let expected: Vec<u64> = (1..=n as u64).collect();
            prop_assert_eq!(claims, expected);
        }

        #[test]
        fn positions_ahead_in_range(
            n in 1usize..100,
            p_seed in 0usize..1000,
            r_seed in 0usize..1000,
        ) {
            let (p, r) = (p_seed % n, r_seed % n);
            let k = positions_ahead(p, r, n);
            prop_assert!(k < n);
            prop_assert_eq!((r + k) % n, p);
        }
    }
}
