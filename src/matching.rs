use std::collections::HashMap;

use rust_decimal::Decimal;

use crate::registry::{OrderType, VenueClient};
use crate::types::{BalanceMap, Level, OrderBookSnapshot, Side};

const MATCH_EPSILON: &str = "0.000001";

fn epsilon() -> Decimal {
    MATCH_EPSILON.parse().unwrap()
}

fn round8(value: Decimal) -> Decimal {
    value.round_dp(8)
}

/// One leg of a match sequence: which venue client to consult for fees,
/// which side, and a mutable copy of the ladder to walk.
pub struct Operation<'a> {
    pub venue_id: String,
    pub client: &'a dyn VenueClient,
    pub side: Side,
    pub snapshot: OrderBookSnapshot,
}

#[derive(Debug, Clone, Default)]
pub struct MatchResult {
    pub final_balances: BalanceMap,
    pub costs: HashMap<String, HashMap<String, Decimal>>,
    pub profit_coin: String,
    pub profit: Decimal,
    pub profit_percentage: Decimal,
    /// Total base volume matched at each operation's index, across every
    /// outer-loop iteration that touched it. Index-aligned with the input
    /// operations.
    pub matched_base: Vec<Decimal>,
    /// Total quote notional matched at each operation's index (price × base
    /// at the time of each fill, summed). Index-aligned with `matched_base`.
    pub matched_quote: Vec<Decimal>,
}

struct Ladder {
    levels: Vec<Level>,
}

impl Ladder {
    fn from_snapshot(snapshot: &OrderBookSnapshot, side: Side) -> Self {
        let levels = match side {
            Side::Buy => snapshot.asks.clone(),
            Side::Sell => snapshot.bids.clone(),
        };
        Ladder { levels }
    }

    /// Skips non-positive entries at the head and returns the usable head,
    /// dropping everything before it.
    fn head(&mut self) -> Option<Level> {
        while let Some(level) = self.levels.first().copied() {
            if level.price > Decimal::ZERO && level.volume > Decimal::ZERO {
                return Some(level);
            }
            self.levels.remove(0);
        }
        None
    }

    fn reduce_head(&mut self, matched: Decimal) {
        if let Some(level) = self.levels.first_mut() {
            level.volume -= matched;
        }
    }
}

/// Computes the cumulative rate across all operations at their current
/// ladder heads: product of `1/price` for buys, `price` for sells. Returns
/// `None` if any ladder is currently empty.
fn cumulative_rate(ladders: &mut [Ladder], sides: &[Side]) -> Option<Decimal> {
    let mut rate = Decimal::ONE;
    for (ladder, side) in ladders.iter_mut().zip(sides) {
        let head = ladder.head()?;
        rate *= match side {
            Side::Buy => Decimal::ONE / head.price,
            Side::Sell => head.price,
        };
    }
    Some(rate)
}

/// Executes one match step at `index` against the single shared balance
/// pool, mutating the ladder and recording any fee into `costs`. Returns the
/// matched base volume and whether this operation remains ready to advance
/// again (it stays ready after any successful fill and only drops out once
/// its ladder is exhausted or a fill would be smaller than the
/// matched-volume epsilon).
///
/// Balances are kept coin-keyed, not venue-keyed: a chain of operations
/// models one arbitrageur moving through venues, and base coin bought at
/// one venue is assumed already staged at the next (the same flat-pool
/// assumption the original pair-deal matcher made; here it is shared with
/// the triangular path too, since a triangular cycle never leaves a single
/// venue anyway).
fn match_step(
    operation: &Operation,
    ladder: &mut Ladder,
    balances: &mut BalanceMap,
    costs: &mut HashMap<String, HashMap<String, Decimal>>,
) -> (Decimal, Decimal, bool) {
    let Some(head) = ladder.head() else {
        return (Decimal::ZERO, Decimal::ZERO, false);
    };
    let price = round8(head.price);

    let (base_coin, quote_coin) = operation
        .snapshot
        .symbol
        .split_coin()
        .unwrap_or(("", ""));

    let available_base = match operation.side {
        Side::Buy => {
            let available_quote = balances.get(quote_coin);
            round8(available_quote / price)
        }
        Side::Sell => balances.get(base_coin),
    };

    let hypothetical_fee = operation.client.calculate_fee(
        &operation.snapshot.symbol,
        OrderType::Limit,
        operation.side,
        available_base,
        price,
    );
    let hypothetical_fee_in_base = if hypothetical_fee.fee_coin_is_quote {
        hypothetical_fee.amount / price
    } else {
        hypothetical_fee.amount
    };
    let available_base = round8(available_base - hypothetical_fee_in_base);

    let matched = round8(available_base.min(head.volume));
    if matched < epsilon() {
        return (Decimal::ZERO, Decimal::ZERO, false);
    }

    let fee = operation.client.calculate_fee(
        &operation.snapshot.symbol,
        OrderType::Limit,
        operation.side,
        matched,
        price,
    );

    let matched_quote = round8(matched * price);
    match operation.side {
        Side::Buy => {
            balances.sub(quote_coin, matched_quote);
            balances.add(base_coin, matched);
            if fee.fee_coin_is_quote {
                balances.sub(quote_coin, fee.amount);
            } else {
                balances.sub(base_coin, fee.amount);
            }
        }
        Side::Sell => {
            balances.sub(base_coin, matched);
            balances.add(quote_coin, matched_quote);
            if fee.fee_coin_is_quote {
                balances.sub(quote_coin, fee.amount);
            } else {
                balances.sub(base_coin, fee.amount);
            }
        }
    }

    let fee_coin = if fee.fee_coin_is_quote { quote_coin } else { base_coin };
    let venue_costs = costs
        .entry(operation.venue_id.clone())
        .or_insert_with(HashMap::new);
    *venue_costs.entry(fee_coin.to_string()).or_insert(Decimal::ZERO) += fee.amount;

    ladder.reduce_head(matched);
    (matched, matched_quote, true)
}

/// Walks a sequence of buy/sell operations against a single shared balance
/// pool, right-to-left, until no operation is ready to advance. Pure and
/// synchronous: the only suspension-shaped point is the caller's fee
/// lookup, which the venue client must answer without blocking.
///
/// Rejects a chain where an operation's snapshot was fetched from a
/// different venue than the one it is tagged with — mixing those up is a
/// construction bug in the caller, not a runtime condition to recover from.
pub fn match_operations(
    initial_balances: BalanceMap,
    operations: Vec<Operation>,
) -> crate::error::Result<MatchResult> {
    let n = operations.len();
    if n == 0 {
        return Ok(MatchResult::default());
    }

    for operation in &operations {
        if operation.venue_id != operation.snapshot.venue {
            return Err(crate::error::EngineError::SnapshotVenueMismatch {
                expected: operation.venue_id.clone(),
                actual: operation.snapshot.venue.clone(),
            });
        }
    }

    let sides: Vec<Side> = operations.iter().map(|o| o.side).collect();
    let mut ladders: Vec<Ladder> = operations
        .iter()
        .map(|o| Ladder::from_snapshot(&o.snapshot, o.side))
        .collect();

    let mut balances = initial_balances.clone();
    let mut costs: HashMap<String, HashMap<String, Decimal>> = HashMap::new();
    let mut ready = vec![false; n];
    ready[0] = true;
    let mut matched_base = vec![Decimal::ZERO; n];
    let mut matched_quote = vec![Decimal::ZERO; n];

    loop {
        match cumulative_rate(&mut ladders, &sides) {
            Some(rate) if rate >= Decimal::ONE => {}
            _ => break,
        }

        let Some(index) = ready.iter().rposition(|&r| r) else {
            break;
        };

        let (matched, matched_quote_amount, still_ready) =
            match_step(&operations[index], &mut ladders[index], &mut balances, &mut costs);
        ready[index] = still_ready;
        matched_base[index] += matched;
        matched_quote[index] += matched_quote_amount;

        if matched > Decimal::ZERO && index + 1 < n {
            ready[index + 1] = true;
        }

        if !ready.iter().any(|&r| r) {
            break;
        }
    }

    let first = &operations[0];
    let profit_coin = match first.side {
        Side::Buy => first.snapshot.symbol.quote().unwrap_or("").to_string(),
        Side::Sell => first.snapshot.symbol.base().unwrap_or("").to_string(),
    };

    let initial_amount = initial_balances.get(&profit_coin);
    let final_amount = balances.get(&profit_coin);
    let profit = round8(final_amount - initial_amount);
    let profit_percentage = if initial_amount.is_zero() {
        Decimal::ZERO
    } else {
        round8(profit / initial_amount * Decimal::from(100))
    };

    Ok(MatchResult {
        final_balances: balances,
        costs,
        profit_coin,
        profit,
        profit_percentage,
        matched_base,
        matched_quote,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Symbol;
    use async_trait::async_trait;
    use chrono::Utc;
    use std::collections::HashMap as Map;

    struct NoFeeClient {
        id: String,
    }

    #[async_trait]
    impl VenueClient for NoFeeClient {
        fn id(&self) -> &str {
            &self.id
        }
        fn is_authenticated(&self) -> bool {
            false
        }
        async fn load_markets(&self) -> crate::error::Result<Vec<Symbol>> {
            Ok(vec![])
        }
        async fn fetch_order_book(
            &self,
            _symbol: &Symbol,
        ) -> crate::error::Result<OrderBookSnapshot> {
            unimplemented!()
        }
        async fn watch_order_book_for_symbols(
            &self,
            _symbols: &[Symbol],
        ) -> crate::error::Result<Vec<OrderBookSnapshot>> {
            unimplemented!()
        }
        async fn fetch_order_books(&self) -> crate::error::Result<Vec<OrderBookSnapshot>> {
            unimplemented!()
        }
        fn calculate_fee(
            &self,
            _symbol: &Symbol,
            _order_type: OrderType,
            _side: Side,
            _amount: Decimal,
            _price: Decimal,
        ) -> crate::types::FeeQuote {
            crate::types::FeeQuote {
                amount: Decimal::ZERO,
                fee_coin_is_quote: true,
            }
        }
        async fn fetch_balance(&self) -> crate::error::Result<Map<String, Decimal>> {
            Ok(Map::new())
        }
        async fn create_order(
            &self,
            _symbol: &Symbol,
            _side: Side,
            _amount: Decimal,
            _price: Decimal,
        ) -> crate::error::Result<()> {
            Ok(())
        }
        async fn fetch_deposit_address(&self, _coin: &str) -> crate::error::Result<String> {
            Ok(String::new())
        }
        async fn withdraw(
            &self,
            _coin: &str,
            _amount: Decimal,
            _address: &str,
        ) -> crate::error::Result<()> {
            Ok(())
        }
    }

    fn level(price: &str, volume: &str) -> Level {
        Level {
            price: price.parse().unwrap(),
            volume: volume.parse().unwrap(),
        }
    }

    fn snapshot(venue: &str, symbol: &str, asks: Vec<Level>, bids: Vec<Level>) -> OrderBookSnapshot {
        OrderBookSnapshot {
            symbol: Symbol::new(symbol),
            venue: venue.to_string(),
            asks,
            bids,
            received_at: Utc::now(),
        }
    }

    fn balance(coin: &str, amount: &str) -> BalanceMap {
        let mut b = BalanceMap::default();
        b.set(coin, amount.parse().unwrap());
        b
    }

    /// Charges a fixed, configurable fee regardless of the amount and price
    /// it is asked about, so a test can pin down both the quote- and
    /// base-denominated fee branches exactly.
    struct FeeClient {
        id: String,
        fee_amount: Decimal,
        fee_coin_is_quote: bool,
    }

    #[async_trait]
    impl VenueClient for FeeClient {
        fn id(&self) -> &str {
            &self.id
        }
        fn is_authenticated(&self) -> bool {
            false
        }
        async fn load_markets(&self) -> crate::error::Result<Vec<Symbol>> {
            Ok(vec![])
        }
        async fn fetch_order_book(
            &self,
            _symbol: &Symbol,
        ) -> crate::error::Result<OrderBookSnapshot> {
            unimplemented!()
        }
        async fn watch_order_book_for_symbols(
            &self,
            _symbols: &[Symbol],
        ) -> crate::error::Result<Vec<OrderBookSnapshot>> {
            unimplemented!()
        }
        async fn fetch_order_books(&self) -> crate::error::Result<Vec<OrderBookSnapshot>> {
            unimplemented!()
        }
        fn calculate_fee(
            &self,
            _symbol: &Symbol,
            _order_type: OrderType,
            _side: Side,
            _amount: Decimal,
            _price: Decimal,
        ) -> crate::types::FeeQuote {
            crate::types::FeeQuote {
                amount: self.fee_amount,
                fee_coin_is_quote: self.fee_coin_is_quote,
            }
        }
        async fn fetch_balance(&self) -> crate::error::Result<Map<String, Decimal>> {
            Ok(Map::new())
        }
        async fn create_order(
            &self,
            _symbol: &Symbol,
            _side: Side,
            _amount: Decimal,
            _price: Decimal,
        ) -> crate::error::Result<()> {
            Ok(())
        }
        async fn fetch_deposit_address(&self, _coin: &str) -> crate::error::Result<String> {
            Ok(String::new())
        }
        async fn withdraw(
            &self,
            _coin: &str,
            _amount: Decimal,
            _address: &str,
        ) -> crate::error::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn noop_under_spread() {
        let a = NoFeeClient { id: "a".into() };
        let b = NoFeeClient { id: "b".into() };
        let ops = vec![
            Operation {
                venue_id: "a".into(),
                client: &a,
                side: Side::Buy,
                snapshot: snapshot("a", "BTC/USDT", vec![level("100", "1")], vec![]),
            },
            Operation {
                venue_id: "b".into(),
                client: &b,
                side: Side::Sell,
                snapshot: snapshot("b", "BTC/USDT", vec![], vec![level("99", "1")]),
            },
        ];
        let result = match_operations(balance("USDT", "100000"), ops).unwrap();
        assert_eq!(result.profit, Decimal::ZERO);
    }

    // The buy/sell levels below are sized to a hair above what the balance
    // actually consumes (by less than MATCH_EPSILON). That lets the chain
    // advance past the buy leg without the ladder reading as exhausted
    // (which would abort the whole match before the sell ever ran), while
    // the leftover is too small to fund a second, ping-ponging round trip.
    #[test]
    fn open_transition_profit() {
        let a = NoFeeClient { id: "a".into() };
        let b = NoFeeClient { id: "b".into() };
        let ops = vec![
            Operation {
                venue_id: "a".into(),
                client: &a,
                side: Side::Buy,
                snapshot: snapshot("a", "BTC/USDT", vec![level("100", "10.0000005")], vec![]),
            },
            Operation {
                venue_id: "b".into(),
                client: &b,
                side: Side::Sell,
                snapshot: snapshot("b", "BTC/USDT", vec![], vec![level("105", "10.0000005")]),
            },
        ];
        let result = match_operations(balance("USDT", "1000"), ops).unwrap();
        assert_eq!(result.profit, "50".parse().unwrap());
        assert_eq!(result.profit_coin, "USDT");
    }

    #[test]
    fn balance_cap_limits_matched_volume() {
        let a = NoFeeClient { id: "a".into() };
        let b = NoFeeClient { id: "b".into() };
        let ops = vec![
            Operation {
                venue_id: "a".into(),
                client: &a,
                side: Side::Buy,
                snapshot: snapshot("a", "BTC/USDT", vec![level("100", "1.5000005")], vec![]),
            },
            Operation {
                venue_id: "b".into(),
                client: &b,
                side: Side::Sell,
                snapshot: snapshot("b", "BTC/USDT", vec![], vec![level("110", "1.5000005")]),
            },
        ];
        let result = match_operations(balance("USDT", "150"), ops).unwrap();
        assert_eq!(result.profit, "15".parse().unwrap());
        assert_eq!(result.profit_percentage, "10".parse().unwrap());
    }

    #[test]
    fn triangular_break_even_executes_nothing() {
        let a = NoFeeClient { id: "a".into() };
        let ops = vec![
            Operation {
                venue_id: "a".into(),
                client: &a,
                side: Side::Buy,
                snapshot: snapshot("a", "BTC/USDT", vec![level("50000", "1")], vec![]),
            },
            Operation {
                venue_id: "a".into(),
                client: &a,
                side: Side::Sell,
                snapshot: snapshot("a", "BTC/ETH", vec![], vec![level("20", "1")]),
            },
            Operation {
                venue_id: "a".into(),
                client: &a,
                side: Side::Sell,
                snapshot: snapshot("a", "ETH/USDT", vec![], vec![level("2490", "20")]),
            },
        ];
        let result = match_operations(balance("USDT", "100000"), ops).unwrap();
        assert_eq!(result.profit, Decimal::ZERO);
    }

    #[test]
    fn triangular_profitable_cycle() {
        let a = NoFeeClient { id: "a".into() };
        let ops = vec![
            Operation {
                venue_id: "a".into(),
                client: &a,
                side: Side::Buy,
                snapshot: snapshot("a", "BTC/USDT", vec![level("50000", "2.0000005")], vec![]),
            },
            Operation {
                venue_id: "a".into(),
                client: &a,
                side: Side::Sell,
                snapshot: snapshot("a", "BTC/ETH", vec![], vec![level("20", "2.0000005")]),
            },
            Operation {
                venue_id: "a".into(),
                client: &a,
                side: Side::Sell,
                snapshot: snapshot("a", "ETH/USDT", vec![], vec![level("2600", "40.0000005")]),
            },
        ];
        let result = match_operations(balance("USDT", "100000"), ops).unwrap();
        assert_eq!(result.profit, "4000".parse().unwrap());
    }

    #[test]
    fn fee_quote_denominated_converts_to_base() {
        let a = FeeClient {
            id: "a".into(),
            fee_amount: "10".parse().unwrap(),
            fee_coin_is_quote: true,
        };
        let b = FeeClient {
            id: "b".into(),
            fee_amount: "11".parse().unwrap(),
            fee_coin_is_quote: true,
        };
        let ops = vec![
            Operation {
                venue_id: "a".into(),
                client: &a,
                side: Side::Buy,
                snapshot: snapshot("a", "BTC/USDT", vec![level("100", "10")], vec![]),
            },
            Operation {
                venue_id: "b".into(),
                client: &b,
                side: Side::Sell,
                snapshot: snapshot("b", "BTC/USDT", vec![], vec![level("110", "10")]),
            },
        ];
        let result = match_operations(balance("USDT", "2000"), ops).unwrap();
        assert_eq!(result.matched_base, vec!["10".parse().unwrap(), "9.9".parse().unwrap()]);
        assert_eq!(result.matched_quote, vec!["1000".parse().unwrap(), "1089".parse().unwrap()]);
        assert_eq!(result.profit, "68".parse().unwrap());
        assert_eq!(result.profit_percentage, "3.4".parse().unwrap());
    }

    #[test]
    fn fee_base_denominated_subtracted_directly() {
        let a = FeeClient {
            id: "a".into(),
            fee_amount: "0.5".parse().unwrap(),
            fee_coin_is_quote: false,
        };
        let b = FeeClient {
            id: "b".into(),
            fee_amount: "0.45".parse().unwrap(),
            fee_coin_is_quote: false,
        };
        let ops = vec![
            Operation {
                venue_id: "a".into(),
                client: &a,
                side: Side::Buy,
                snapshot: snapshot("a", "BTC/USDT", vec![level("100", "10")], vec![]),
            },
            Operation {
                venue_id: "b".into(),
                client: &b,
                side: Side::Sell,
                snapshot: snapshot("b", "BTC/USDT", vec![], vec![level("110", "10")]),
            },
        ];
        let result = match_operations(balance("USDT", "2000"), ops).unwrap();
        assert_eq!(result.matched_base, vec!["10".parse().unwrap(), "9.05".parse().unwrap()]);
        assert_eq!(result.matched_quote, vec!["1000".parse().unwrap(), "995.5".parse().unwrap()]);
        assert_eq!(result.profit, "-4.5".parse().unwrap());
        assert_eq!(result.profit_percentage, "-0.225".parse().unwrap());
    }

    #[test]
    fn mismatched_snapshot_venue_is_rejected() {
        let a = NoFeeClient { id: "a".into() };
        let ops = vec![Operation {
            venue_id: "a".into(),
            client: &a,
            side: Side::Buy,
            snapshot: snapshot("b", "BTC/USDT", vec![level("100", "1")], vec![]),
        }];
        let err = match_operations(balance("USDT", "1000"), ops).unwrap_err();
        assert!(matches!(
            err,
            crate::error::EngineError::SnapshotVenueMismatch { expected, actual }
                if expected == "a" && actual == "b"
        ));
    }
}
