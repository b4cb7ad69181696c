use std::cmp::Ordering;
use std::fmt;

use huddle_signal::ParticipantId;
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NegotiationRole {
    /// Yields to the peer's offer during a collision.
    Polite,
    /// Keeps its own offer during a collision and sends the first offer.
    Impolite,
}

impl NegotiationRole {
    pub fn is_polite(self) -> bool {
        matches!(self, NegotiationRole::Polite)
    }

    pub fn complement(self) -> Self {
        match self {
            NegotiationRole::Polite => NegotiationRole::Impolite,
            NegotiationRole::Impolite => NegotiationRole::Polite,
        }
    }
}

impl fmt::Display for NegotiationRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            NegotiationRole::Polite => "polite",
            NegotiationRole::Impolite => "impolite",
        })
    }
}

/// The lower id is polite. Both ends compute this locally and always
/// arrive at complementary roles. Equal ids have no role.
pub fn resolve_role(self_id: &ParticipantId, peer_id: &ParticipantId) -> Option<NegotiationRole> {
    match self_id.cmp(peer_id) {
        Ordering::Less => Some(NegotiationRole::Polite),
        Ordering::Greater => Some(NegotiationRole::Impolite),
        Ordering::Equal => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lower_id_is_polite() {
        let one = ParticipantId::from(1u64);
        let two = ParticipantId::from(2u64);
        assert_eq!(resolve_role(&one, &two), Some(NegotiationRole::Polite));
        assert_eq!(resolve_role(&two, &one), Some(NegotiationRole::Impolite));
    }

    #[test]
    fn exactly_one_polite_per_pair() {
        let ids: Vec<ParticipantId> = vec![
            1u64.into(),
            2u64.into(),
            10u64.into(),
            "10".into(),
            "alice".into(),
            "bob".into(),
            "9z".into(),
        ];
        for a in &ids {
            for b in &ids {
                match (resolve_role(a, b), resolve_role(b, a)) {
                    (None, None) => assert_eq!(a, b),
                    (Some(mine), Some(theirs)) => {
                        assert_ne!(a, b);
                        assert_eq!(mine.complement(), theirs, "{a} vs {b}");
                    }
                    other => panic!("asymmetric resolution for {a} vs {b}: {other:?}"),
                }
            }
        }
    }

    #[test]
    fn numeric_ids_compare_by_value() {
        let nine = ParticipantId::from("9");
        let ten = ParticipantId::from("10");
        assert_eq!(resolve_role(&nine, &ten), Some(NegotiationRole::Polite));
    }

    #[test]
    fn self_pairing_has_no_role() {
        let id = ParticipantId::from("alice");
        assert_eq!(resolve_role(&id, &id.clone()), None);
    }
}
