//! Draw engine: bet persistence glue and the one-time winners computation.

use std::collections::HashMap;

use crate::protocol::{AgencyId, Bet, Document};
use crate::server::BetStore;
use crate::utils::TallyError;

/// Winning documents grouped per agency, in store insertion order.
pub type WinnersMap = HashMap<AgencyId, Vec<Document>>;

/// Rule deciding whether a bet wins the draw.
pub trait WinRule: Send {
    fn has_won(&self, bet: &Bet) -> bool;
}

/// A bet wins iff it played exactly this number.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LuckyNumber(pub u16);

impl LuckyNumber {
    /// Number drawn when none is configured.
    pub const DEFAULT: u16 = 7574;
}

impl Default for LuckyNumber {
    fn default() -> Self {
        LuckyNumber(Self::DEFAULT)
    }
}

impl WinRule for LuckyNumber {
    fn has_won(&self, bet: &Bet) -> bool {
        bet.number == self.0
    }
}

/// Owns the bet store and the win rule.
pub struct DrawEngine {
    store: Box<dyn BetStore>,
    rule: Box<dyn WinRule>,
    drawn: bool,
}

impl DrawEngine {
    pub fn new(store: Box<dyn BetStore>, rule: Box<dyn WinRule>) -> Self {
        DrawEngine {
            store,
            rule,
            drawn: false,
        }
    }

    /// Whether `compute_winners()` has already run.
    pub fn drawn(&self) -> bool {
        self.drawn
    }

    /// Appends the given bets to the store, keeping their order. No
    /// deduplication is done.
    pub async fn store(&mut self, bets: &[Bet]) -> Result<(), TallyError> {
        self.store.append(bets).await
    }

    /// Loads every stored bet and groups the winning ones' documents by
    /// agency. Agencies without winners get no entry. Can only run once.
    pub async fn compute_winners(&mut self) -> Result<WinnersMap, TallyError> {
        if self.drawn {
            return logged_err!("draw already performed");
        }
        self.drawn = true;

        let bets = self.store.load_all().await?;
        let mut winners = WinnersMap::new();
        for bet in bets.iter().filter(|bet| self.rule.has_won(bet)) {
            winners.entry(bet.agency).or_default().push(bet.document);
        }

        pf_info!(
            "draw done over {} bets: {} winners across {} agencies",
            bets.len(),
            winners.values().map(Vec::len).sum::<usize>(),
            winners.len()
        );
        Ok(winners)
    }
}

#[cfg(test)]
mod draw_tests {
    use super::*;
    use crate::server::MemoryBetStore;

    fn bet(agency: AgencyId, document: Document, number: u16) -> Bet {
        Bet {
            agency,
            first_name: "Valentina".into(),
            last_name: "Ruiz".into(),
            document,
            birthdate: "1988-01-05".into(),
            number,
        }
    }

    /// Wins on even documents.
    struct EvenDocument;

    impl WinRule for EvenDocument {
        fn has_won(&self, bet: &Bet) -> bool {
            bet.document % 2 == 0
        }
    }

    #[test]
    fn lucky_number_rule() {
        let rule = LuckyNumber::default();
        assert!(rule.has_won(&bet(1, 1, 7574)));
        assert!(!rule.has_won(&bet(1, 1, 7575)));
        assert!(LuckyNumber(12).has_won(&bet(1, 1, 12)));
    }

    #[tokio::test]
    async fn winners_grouped_in_order() -> Result<(), TallyError> {
        let mut engine = DrawEngine::new(
            Box::new(MemoryBetStore::new()),
            Box::new(EvenDocument),
        );
        engine.store(&[bet(1, 8, 0), bet(2, 3, 0), bet(1, 2, 0)]).await?;
        engine.store(&[bet(3, 5, 0), bet(2, 4, 0), bet(1, 6, 0)]).await?;
        let winners = engine.compute_winners().await?;
        assert_eq!(winners.len(), 2);
        assert_eq!(winners[&1], vec![8, 2, 6]);
        assert_eq!(winners[&2], vec![4]);
        assert!(!winners.contains_key(&3));
        Ok(())
    }

    #[tokio::test]
    async fn draw_only_once() -> Result<(), TallyError> {
        let mut engine = DrawEngine::new(
            Box::new(MemoryBetStore::new()),
            Box::new(LuckyNumber::default()),
        );
        assert!(!engine.drawn());
        assert!(engine.compute_winners().await?.is_empty());
        assert!(engine.drawn());
        assert!(engine.compute_winners().await.is_err());
        Ok(())
    }
}
