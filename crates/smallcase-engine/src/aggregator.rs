//! Netting of planned legs into one book per (broker mode, symbol) and the
//! split of executed quantity back onto the legs.

use crate::planner::{floor_to_scale, PlannedLeg};
use broker_trait::BrokerMode;
use portfolio_manager::TradeSide;
use rust_decimal::Decimal;
use std::collections::BTreeMap;

/// Position of a leg inside the batch: request index, then leg index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LegRef {
    pub request: usize,
    pub leg: usize,
}

#[derive(Debug, Clone)]
pub struct SymbolBook {
    pub mode: BrokerMode,
    pub symbol: String,
    pub quote: Decimal,
    pub buys: Vec<(LegRef, Decimal)>,
    pub sells: Vec<(LegRef, Decimal)>,
}

impl SymbolBook {
    pub fn new(mode: BrokerMode, symbol: &str, quote: Decimal) -> Self {
        Self {
            mode,
            symbol: symbol.to_string(),
            quote,
            buys: Vec::new(),
            sells: Vec::new(),
        }
    }

    pub fn buy_total(&self) -> Decimal {
        self.buys.iter().map(|(_, q)| *q).sum()
    }

    pub fn sell_total(&self) -> Decimal {
        self.sells.iter().map(|(_, q)| *q).sum()
    }

    /// Quantity matched between users without touching the broker
    pub fn crossed(&self) -> Decimal {
        self.buy_total().min(self.sell_total())
    }

    /// The residual order for the broker, if any
    pub fn net(&self) -> Option<(TradeSide, Decimal)> {
        let buys = self.buy_total();
        let sells = self.sell_total();
        if buys > sells {
            Some((TradeSide::Buy, buys - sells))
        } else if sells > buys {
            Some((TradeSide::Sell, sells - buys))
        } else {
            None
        }
    }

    /// Executed quantity per leg given what the broker filled on the net
    /// order. The side with no residual is always filled in full from the
    /// crossed quantity; the other side shares crossed plus broker fill.
    pub fn fills(&self, broker_filled: Decimal, scale: u32) -> Vec<(LegRef, Decimal)> {
        let full = |legs: &[(LegRef, Decimal)]| legs.to_vec();
        let share = |legs: &[(LegRef, Decimal)], total: Decimal| {
            let requested: Vec<Decimal> = legs.iter().map(|(_, q)| *q).collect();
            legs.iter()
                .map(|(r, _)| *r)
                .zip(allocate(total, &requested, scale))
                .collect::<Vec<_>>()
        };

        match self.net() {
            None => {
                let mut all = full(&self.buys);
                all.extend(full(&self.sells));
                all
            }
            Some((TradeSide::Buy, net)) => {
                let executed = self.crossed() + broker_filled.clamp(Decimal::ZERO, net);
                let mut all = share(&self.buys, executed);
                all.extend(full(&self.sells));
                all
            }
            Some((TradeSide::Sell, net)) => {
                let executed = self.crossed() + broker_filled.clamp(Decimal::ZERO, net);
                let mut all = full(&self.buys);
                all.extend(share(&self.sells, executed));
                all
            }
        }
    }
}

/// Group legs into books ordered by (mode, symbol).
pub fn aggregate<'a>(
    legs: impl IntoIterator<Item = (LegRef, BrokerMode, &'a PlannedLeg)>,
) -> Vec<SymbolBook> {
    let mut books: BTreeMap<(BrokerMode, String), SymbolBook> = BTreeMap::new();
    for (leg_ref, mode, leg) in legs {
        if leg.quantity <= Decimal::ZERO {
            continue;
        }
        let book = books
            .entry((mode, leg.symbol.clone()))
            .or_insert_with(|| SymbolBook::new(mode, &leg.symbol, leg.quote));
        match leg.side {
            TradeSide::Buy => book.buys.push((leg_ref, leg.quantity)),
            TradeSide::Sell => book.sells.push((leg_ref, leg.quantity)),
        }
    }
    books.into_values().collect()
}

/// Pro-rata split of `total` over `requested`, in increments of the
/// quantity scale. Floors every share, then hands the leftover increments
/// to the largest remainders, earlier entries winning ties. No share
/// exceeds its request and the shares never sum past `total`.
pub fn allocate(total: Decimal, requested: &[Decimal], scale: u32) -> Vec<Decimal> {
    let sum: Decimal = requested.iter().sum();
    if total >= sum {
        return requested.to_vec();
    }
    let total = floor_to_scale(total, scale);
    if total <= Decimal::ZERO || sum <= Decimal::ZERO {
        return vec![Decimal::ZERO; requested.len()];
    }

    let unit = Decimal::new(1, scale);
    let mut shares = Vec::with_capacity(requested.len());
    let mut remainders = Vec::with_capacity(requested.len());
    for (i, want) in requested.iter().enumerate() {
        let exact = total * *want / sum;
        let floored = floor_to_scale(exact, scale).min(*want);
        shares.push(floored);
        remainders.push((exact - floored, i));
    }

    let mut leftover = total - shares.iter().sum::<Decimal>();
    remainders.sort_by(|a, b| b.0.cmp(&a.0).then(a.1.cmp(&b.1)));
    for (_, i) in remainders {
        if leftover < unit {
            break;
        }
        if shares[i] + unit <= requested[i] {
            shares[i] += unit;
            leftover -= unit;
        }
    }
    shares
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn leg(symbol: &str, side: TradeSide, quantity: Decimal) -> PlannedLeg {
        PlannedLeg {
            symbol: symbol.to_string(),
            side,
            quantity,
            quote: dec!(100),
        }
    }

    fn at(request: usize) -> LegRef {
        LegRef { request, leg: 0 }
    }

    #[test]
    fn test_aggregate_groups_by_mode_and_symbol() {
        let legs = [
            leg("INFY", TradeSide::Buy, dec!(6)),
            leg("INFY", TradeSide::Buy, dec!(13)),
            leg("INFY", TradeSide::Sell, dec!(4)),
            leg("INFY", TradeSide::Buy, dec!(2)),
            leg("TCS", TradeSide::Buy, dec!(0)),
        ];
        let modes = [
            BrokerMode::Paper,
            BrokerMode::Paper,
            BrokerMode::Paper,
            BrokerMode::Live,
            BrokerMode::Paper,
        ];
        let books = aggregate(
            legs.iter()
                .zip(modes)
                .enumerate()
                .map(|(i, (l, m))| (at(i), m, l)),
        );

        assert_eq!(books.len(), 2);
        let paper = &books[0];
        assert_eq!(paper.mode, BrokerMode::Paper);
        assert_eq!(paper.buy_total(), dec!(19));
        assert_eq!(paper.crossed(), dec!(4));
        assert_eq!(paper.net(), Some((TradeSide::Buy, dec!(15))));
        assert_eq!(books[1].mode, BrokerMode::Live);
        assert_eq!(books[1].net(), Some((TradeSide::Buy, dec!(2))));
    }

    #[test]
    fn test_fully_crossed_book_needs_no_order() {
        let legs = [
            leg("INFY", TradeSide::Sell, dec!(6)),
            leg("INFY", TradeSide::Buy, dec!(6)),
        ];
        let books = aggregate(legs.iter().enumerate().map(|(i, l)| (at(i), BrokerMode::Paper, l)));
        assert_eq!(books[0].net(), None);
        assert_eq!(books[0].fills(dec!(0), 0), vec![(at(1), dec!(6)), (at(0), dec!(6))]);
    }

    #[test]
    fn test_allocate_largest_remainder() {
        assert_eq!(allocate(dec!(10), &[dec!(6), dec!(13)], 0), vec![dec!(3), dec!(7)]);
        assert_eq!(allocate(dec!(2), &[dec!(1), dec!(1), dec!(1)], 0), vec![dec!(1), dec!(1), dec!(0)]);
        assert_eq!(allocate(dec!(0), &[dec!(4), dec!(2)], 0), vec![dec!(0), dec!(0)]);
        assert_eq!(allocate(dec!(50), &[dec!(4), dec!(2)], 0), vec![dec!(4), dec!(2)]);
        assert_eq!(allocate(dec!(1.5), &[dec!(1), dec!(2)], 1), vec![dec!(0.5), dec!(1.0)]);
    }

    #[test]
    fn test_allocate_never_over_allocates() {
        let requested = [dec!(7), dec!(3), dec!(11), dec!(1), dec!(5)];
        for total in 0..27 {
            let total = Decimal::from(total);
            let shares = allocate(total, &requested, 0);
            assert_eq!(shares.iter().sum::<Decimal>(), total);
            for (share, want) in shares.iter().zip(requested.iter()) {
                assert!(share <= want);
            }
        }
    }

    #[test]
    fn test_partial_broker_fill_shared_by_buyers() {
        let legs = [
            leg("INFY", TradeSide::Buy, dec!(6)),
            leg("INFY", TradeSide::Buy, dec!(13)),
            leg("INFY", TradeSide::Sell, dec!(4)),
        ];
        let books = aggregate(legs.iter().enumerate().map(|(i, l)| (at(i), BrokerMode::Paper, l)));
        // 4 crossed + 6 of the 15 net from the broker
        let fills = books[0].fills(dec!(6), 0);
        assert_eq!(fills, vec![(at(0), dec!(3)), (at(1), dec!(7)), (at(2), dec!(4))]);
    }
}
