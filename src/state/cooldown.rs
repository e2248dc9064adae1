use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use crate::types::Tier;

/// Result of trying to stamp a (market, tier) cooldown.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClaimOutcome {
    /// Entry stamped with the new trigger time. `previous` is what it replaced,
    /// kept so a failed alert write can put it back.
    Claimed { previous: Option<DateTime<Utc>> },
    /// Still inside the cooldown window that started at `last`.
    Cooling { last: DateTime<Utc> },
}

// ---------------------------------------------------------------------------
// CooldownLedger
// ---------------------------------------------------------------------------

/// In-memory cooldown ledger, one entry per (market, tier).
///
/// Check-then-write happens under the DashMap shard lock of the key, so two
/// detections for the same market and tier can never both pass. Different
/// markets land on independent keys and proceed in parallel.
pub struct CooldownLedger {
    entries: DashMap<(String, Tier), DateTime<Utc>>,
}

impl CooldownLedger {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Rehydrate from persisted entries. Later timestamps win on duplicates.
    pub fn load(&self, entries: impl IntoIterator<Item = (String, Tier, DateTime<Utc>)>) {
        for (market_id, tier, at) in entries {
            self.entries
                .entry((market_id, tier))
                .and_modify(|cur| {
                    if at > *cur {
                        *cur = at;
                    }
                })
                .or_insert(at);
        }
    }

    pub fn try_claim(
        &self,
        market_id: &str,
        tier: Tier,
        now: DateTime<Utc>,
        cooldown: Duration,
    ) -> ClaimOutcome {
        match self.entries.entry((market_id.to_string(), tier)) {
            Entry::Occupied(mut e) => {
                let last = *e.get();
                if now - last < cooldown {
                    ClaimOutcome::Cooling { last }
                } else {
                    e.insert(now);
                    ClaimOutcome::Claimed { previous: Some(last) }
                }
            }
            Entry::Vacant(v) => {
                v.insert(now);
                ClaimOutcome::Claimed { previous: None }
            }
        }
    }

    /// Undo a claim whose alert could not be persisted. Only reverts if the
    /// entry still holds the claimed timestamp.
    pub fn release(
        &self,
        market_id: &str,
        tier: Tier,
        claimed_at: DateTime<Utc>,
        previous: Option<DateTime<Utc>>,
    ) {
        let key = (market_id.to_string(), tier);
        if let Entry::Occupied(mut e) = self.entries.entry(key) {
            if *e.get() != claimed_at {
                return;
            }
            match previous {
                Some(prev) => {
                    e.insert(prev);
                }
                None => {
                    e.remove();
                }
            }
        }
    }

    pub fn last_triggered(&self, market_id: &str, tier: Tier) -> Option<DateTime<Utc>> {
        self.entries
            .get(&(market_id.to_string(), tier))
            .map(|r| *r.value())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }
}

impl Default for CooldownLedger {
    fn default() -> Self {
        Self {
            entries: DashMap::new(),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::from_unix;

    const T0: i64 = 1_767_600_000;

    #[test]
    fn first_claim_succeeds_and_second_inside_window_is_rejected() {
        let ledger = CooldownLedger::new();
        let cooldown = Duration::minutes(30);

        let first = ledger.try_claim("m1", Tier::Confirmed, from_unix(T0), cooldown);
        assert_eq!(first, ClaimOutcome::Claimed { previous: None });

        let second = ledger.try_claim("m1", Tier::Confirmed, from_unix(T0 + 600), cooldown);
        assert_eq!(second, ClaimOutcome::Cooling { last: from_unix(T0) });
        assert_eq!(ledger.last_triggered("m1", Tier::Confirmed), Some(from_unix(T0)));
    }

    #[test]
    fn claim_allowed_exactly_at_cooldown_boundary() {
        let ledger = CooldownLedger::new();
        let cooldown = Duration::minutes(30);
        ledger.try_claim("m1", Tier::Confirmed, from_unix(T0), cooldown);
        let outcome = ledger.try_claim("m1", Tier::Confirmed, from_unix(T0 + 1_800), cooldown);
        assert_eq!(outcome, ClaimOutcome::Claimed { previous: Some(from_unix(T0)) });
    }

    #[test]
    fn tiers_are_independent() {
        let ledger = CooldownLedger::new();
        let cooldown = Duration::minutes(30);
        ledger.try_claim("m1", Tier::Confirmed, from_unix(T0), cooldown);
        let fast = ledger.try_claim("m1", Tier::Fast, from_unix(T0 + 60), cooldown);
        assert!(matches!(fast, ClaimOutcome::Claimed { .. }));
    }

    #[test]
    fn release_restores_previous_entry() {
        let ledger = CooldownLedger::new();
        let cooldown = Duration::minutes(30);
        ledger.try_claim("m1", Tier::Confirmed, from_unix(T0), cooldown);
        let now = from_unix(T0 + 3_600);
        let ClaimOutcome::Claimed { previous } = ledger.try_claim("m1", Tier::Confirmed, now, cooldown)
        else {
            panic!("expected claim");
        };
        ledger.release("m1", Tier::Confirmed, now, previous);
        assert_eq!(ledger.last_triggered("m1", Tier::Confirmed), Some(from_unix(T0)));

        ledger.try_claim("m2", Tier::Fast, now, cooldown);
        ledger.release("m2", Tier::Fast, now, None);
        assert!(ledger.last_triggered("m2", Tier::Fast).is_none());
    }

    #[test]
    fn concurrent_claims_for_same_key_admit_exactly_one() {
        let ledger = CooldownLedger::new();
        let handles: Vec<_> = (0..16)
            .map(|_| {
                let ledger = Arc::clone(&ledger);
                std::thread::spawn(move || {
                    ledger.try_claim("hot", Tier::Confirmed, from_unix(T0), Duration::minutes(30))
                })
            })
            .collect();
        let claimed = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|o| matches!(o, ClaimOutcome::Claimed { .. }))
            .count();
        assert_eq!(claimed, 1);
    }

    #[test]
    fn load_keeps_latest_timestamp() {
        let ledger = CooldownLedger::new();
        ledger.load(vec![
            ("m1".to_string(), Tier::Confirmed, from_unix(T0)),
            ("m1".to_string(), Tier::Confirmed, from_unix(T0 + 60)),
            ("m1".to_string(), Tier::Confirmed, from_unix(T0 - 60)),
        ]);
        assert_eq!(ledger.last_triggered("m1", Tier::Confirmed), Some(from_unix(T0 + 60)));
        assert_eq!(ledger.len(), 1);
    }
}
