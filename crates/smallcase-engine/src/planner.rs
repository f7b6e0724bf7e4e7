//! Turns one request into the stock legs it needs. Everything here is pure:
//! callers load holdings, weights and quotes beforehand.

use crate::error::Rejection;
use portfolio_manager::smallcases::TOTAL_WEIGHT;
use portfolio_manager::{Constituent, Holding, TradeSide};
use rust_decimal::{Decimal, RoundingStrategy};
use std::collections::{BTreeMap, HashMap};

#[derive(Debug, Clone, PartialEq)]
pub struct PlannedLeg {
    pub symbol: String,
    pub side: TradeSide,
    pub quantity: Decimal,
    /// Quote used for sizing and for the cash check
    pub quote: Decimal,
}

impl PlannedLeg {
    pub fn notional(&self) -> Decimal {
        self.quantity * self.quote
    }
}

/// Round a quantity down to the tradable increment.
pub fn floor_to_scale(quantity: Decimal, scale: u32) -> Decimal {
    quantity
        .round_dp_with_strategy(scale, RoundingStrategy::ToZero)
        .normalize()
}

fn quote_for(prices: &HashMap<String, Decimal>, symbol: &str) -> Result<Decimal, Rejection> {
    match prices.get(symbol) {
        Some(price) if *price > Decimal::ZERO => Ok(*price),
        _ => Err(Rejection::MissingQuote(symbol.to_string())),
    }
}

/// Split `amount` across the constituents by weight and buy whole
/// increments of each. Constituents too expensive for their slice are
/// skipped; if every one is skipped the request is too small.
pub fn plan_investment(
    constituents: &[Constituent],
    prices: &HashMap<String, Decimal>,
    amount: Decimal,
    scale: u32,
) -> Result<Vec<PlannedLeg>, Rejection> {
    let mut legs = Vec::new();
    for constituent in constituents {
        let quote = quote_for(prices, &constituent.symbol)?;
        let target = amount * constituent.weight / TOTAL_WEIGHT;
        let quantity = floor_to_scale(target / quote, scale);
        if quantity > Decimal::ZERO {
            legs.push(PlannedLeg {
                symbol: constituent.symbol.clone(),
                side: TradeSide::Buy,
                quantity,
                quote,
            });
        }
    }

    if legs.is_empty() {
        return Err(Rejection::InvestmentTooSmall(amount));
    }
    Ok(legs)
}

/// Sell every holding of an investment at its full quantity.
pub fn plan_exit(
    holdings: &[Holding],
    prices: &HashMap<String, Decimal>,
) -> Result<Vec<PlannedLeg>, Rejection> {
    holdings
        .iter()
        .filter(|h| h.quantity > Decimal::ZERO)
        .map(|h| {
            Ok(PlannedLeg {
                symbol: h.symbol.clone(),
                side: TradeSide::Sell,
                quantity: h.quantity,
                quote: quote_for(prices, &h.symbol)?,
            })
        })
        .collect()
}

/// Move an investment to the target weights at current quotes. Holdings
/// outside the new basket are sold in full. Sells come first so the
/// settlement credits proceeds before debiting buys.
pub fn plan_rebalance(
    holdings: &[Holding],
    constituents: &[Constituent],
    prices: &HashMap<String, Decimal>,
    scale: u32,
) -> Result<Vec<PlannedLeg>, Rejection> {
    let mut current: BTreeMap<&str, Decimal> = BTreeMap::new();
    for holding in holdings {
        *current.entry(holding.symbol.as_str()).or_default() += holding.quantity;
    }

    let mut value = Decimal::ZERO;
    for (symbol, quantity) in &current {
        value += *quantity * quote_for(prices, symbol)?;
    }

    let mut target: BTreeMap<&str, Decimal> = BTreeMap::new();
    for constituent in constituents {
        let quote = quote_for(prices, &constituent.symbol)?;
        let slice = value * constituent.weight / TOTAL_WEIGHT;
        target.insert(constituent.symbol.as_str(), floor_to_scale(slice / quote, scale));
    }

    let mut sells = Vec::new();
    let mut buys = Vec::new();
    let symbols: std::collections::BTreeSet<&str> =
        current.keys().chain(target.keys()).copied().collect();

    for symbol in symbols {
        let have = current.get(symbol).copied().unwrap_or_default();
        let want = target.get(symbol).copied().unwrap_or_default();
        let quote = quote_for(prices, symbol)?;
        if want > have {
            buys.push(PlannedLeg {
                symbol: symbol.to_string(),
                side: TradeSide::Buy,
                quantity: want - have,
                quote,
            });
        } else if have > want {
            sells.push(PlannedLeg {
                symbol: symbol.to_string(),
                side: TradeSide::Sell,
                quantity: have - want,
                quote,
            });
        }
    }

    if sells.is_empty() && buys.is_empty() {
        return Err(Rejection::AlreadyBalanced);
    }
    sells.extend(buys);
    Ok(sells)
}

/// One direct stock trade.
pub fn plan_trade(
    symbol: &str,
    side: TradeSide,
    quantity: Decimal,
    prices: &HashMap<String, Decimal>,
    scale: u32,
) -> Result<Vec<PlannedLeg>, Rejection> {
    let quote = quote_for(prices, symbol)?;
    let quantity = floor_to_scale(quantity, scale);
    if quantity <= Decimal::ZERO {
        return Err(Rejection::InsufficientQuantity {
            symbol: symbol.to_string(),
            required: quantity,
            available: Decimal::ZERO,
        });
    }
    Ok(vec![PlannedLeg {
        symbol: symbol.to_string(),
        side,
        quantity,
        quote,
    }])
}

/// Cash a set of legs may consume: buys padded by `headroom`, sells
/// discounted by `haircut`. Never negative.
pub fn cash_required(
    legs: &[PlannedLeg],
    headroom: Decimal,
    haircut: Decimal,
) -> Result<Decimal, Rejection> {
    let mut buys = Decimal::ZERO;
    let mut sells = Decimal::ZERO;
    for leg in legs {
        let (factor, total) = match leg.side {
            TradeSide::Buy => (headroom, &mut buys),
            TradeSide::Sell => (haircut, &mut sells),
        };
        *total = leg
            .quantity
            .checked_mul(leg.quote)
            .and_then(|n| n.checked_mul(factor))
            .and_then(|n| total.checked_add(n))
            .ok_or(Rejection::ValueOutOfRange)?;
    }
    Ok((buys - sells).max(Decimal::ZERO).round_dp(2))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use rust_decimal_macros::dec;
    use uuid::Uuid;

    fn prices() -> HashMap<String, Decimal> {
        HashMap::from([
            ("INFY".to_string(), dec!(1500)),
            ("TCS".to_string(), dec!(3800)),
            ("WIPRO".to_string(), dec!(450)),
        ])
    }

    fn weights(pairs: &[(&str, Decimal)]) -> Vec<Constituent> {
        pairs
            .iter()
            .map(|(s, w)| Constituent {
                symbol: s.to_string(),
                weight: *w,
            })
            .collect()
    }

    fn holding(symbol: &str, quantity: Decimal) -> Holding {
        Holding {
            id: Uuid::new_v4(),
            portfolio_id: Uuid::nil(),
            investment_id: Some(Uuid::nil()),
            symbol: symbol.to_string(),
            quantity,
            avg_cost: dec!(1),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn test_floor_to_scale() {
        assert_eq!(floor_to_scale(dec!(6.999), 0), dec!(6));
        assert_eq!(floor_to_scale(dec!(2.6315), 2), dec!(2.63));
        assert_eq!(floor_to_scale(dec!(-1.5), 0), dec!(-1));
    }

    #[test]
    fn test_plan_investment_by_weight() {
        let legs = plan_investment(
            &weights(&[("INFY", dec!(50)), ("TCS", dec!(50))]),
            &prices(),
            dec!(20000),
            0,
        )
        .unwrap();

        assert_eq!(legs.len(), 2);
        assert_eq!((legs[0].symbol.as_str(), legs[0].quantity), ("INFY", dec!(6)));
        assert_eq!((legs[1].symbol.as_str(), legs[1].quantity), ("TCS", dec!(2)));
        assert!(legs.iter().all(|l| l.side == TradeSide::Buy));
    }

    #[test]
    fn test_plan_investment_skips_unaffordable() {
        let basket = weights(&[("WIPRO", dec!(50)), ("TCS", dec!(50))]);
        let legs = plan_investment(&basket, &prices(), dec!(2000), 0).unwrap();
        assert_eq!(legs.len(), 1);
        assert_eq!(legs[0].symbol, "WIPRO");
        assert_eq!(legs[0].quantity, dec!(2));

        let err = plan_investment(&basket, &prices(), dec!(100), 0).unwrap_err();
        assert_eq!(err, Rejection::InvestmentTooSmall(dec!(100)));
    }

    #[test]
    fn test_plan_requires_quotes() {
        let basket = weights(&[("HDFC", dec!(100))]);
        let err = plan_investment(&basket, &prices(), dec!(5000), 0).unwrap_err();
        assert_eq!(err, Rejection::MissingQuote("HDFC".to_string()));
    }

    #[test]
    fn test_plan_exit_sells_everything() {
        let legs = plan_exit(&[holding("INFY", dec!(6)), holding("TCS", dec!(2))], &prices()).unwrap();
        assert_eq!(legs.len(), 2);
        assert!(legs.iter().all(|l| l.side == TradeSide::Sell));
        assert_eq!(legs[1].notional(), dec!(7600));
    }

    #[test]
    fn test_plan_rebalance_to_new_weights() {
        let holdings = [holding("INFY", dec!(6)), holding("TCS", dec!(2))];
        let basket = weights(&[("INFY", dec!(40)), ("TCS", dec!(40)), ("WIPRO", dec!(20))]);
        let legs = plan_rebalance(&holdings, &basket, &prices(), 0).unwrap();

        let summary: Vec<(&str, TradeSide, Decimal)> = legs
            .iter()
            .map(|l| (l.symbol.as_str(), l.side, l.quantity))
            .collect();
        assert_eq!(
            summary,
            vec![
                ("INFY", TradeSide::Sell, dec!(2)),
                ("TCS", TradeSide::Sell, dec!(1)),
                ("WIPRO", TradeSide::Buy, dec!(7)),
            ]
        );
        assert_eq!(cash_required(&legs, dec!(1.005), dec!(0.995)).unwrap(), dec!(0));
    }

    #[test]
    fn test_plan_rebalance_drops_removed_symbols() {
        let holdings = [holding("INFY", dec!(6)), holding("WIPRO", dec!(10))];
        let basket = weights(&[("INFY", dec!(100))]);
        let legs = plan_rebalance(&holdings, &basket, &prices(), 0).unwrap();
        assert_eq!(legs[0].symbol, "WIPRO");
        assert_eq!(legs[0].side, TradeSide::Sell);
        assert_eq!(legs[0].quantity, dec!(10));
        assert_eq!(legs[1].side, TradeSide::Buy);
        assert_eq!(legs[1].quantity, dec!(3));
    }

    #[test]
    fn test_plan_rebalance_already_balanced() {
        let holdings = [holding("INFY", dec!(6)), holding("TCS", dec!(2))];
        let basket = weights(&[("INFY", dec!(50)), ("TCS", dec!(50))]);
        // value 16600 -> 8300 each -> INFY 5, TCS 2
        let legs = plan_rebalance(&holdings, &basket, &prices(), 0).unwrap();
        assert_eq!(legs.len(), 1);

        let holdings = [holding("INFY", dec!(10))];
        let basket = weights(&[("INFY", dec!(100))]);
        let err = plan_rebalance(&holdings, &basket, &prices(), 0).unwrap_err();
        assert_eq!(err, Rejection::AlreadyBalanced);
    }

    #[test]
    fn test_cash_required_with_buffer() {
        let legs = plan_trade("INFY", TradeSide::Buy, dec!(2), &prices(), 0).unwrap();
        assert_eq!(cash_required(&legs, dec!(1.005), dec!(0.995)).unwrap(), dec!(3015));

        let fractional = plan_trade("INFY", TradeSide::Buy, dec!(0.4), &prices(), 0);
        assert!(fractional.is_err());
    }

    #[test]
    fn test_cash_required_overflow_is_rejected() {
        let legs = vec![PlannedLeg {
            symbol: "INFY".to_string(),
            side: TradeSide::Buy,
            quantity: Decimal::from_scientific("5e28").unwrap(),
            quote: dec!(1500),
        }];
        assert_eq!(
            cash_required(&legs, dec!(1.005), dec!(0.995)),
            Err(Rejection::ValueOutOfRange)
        );
    }
}
