//! Account state source (balance and positions)

use async_trait::async_trait;
use rust_decimal::Decimal;
use tokio::sync::Mutex;
use tracing::debug;

use crate::types::{BalanceSnapshot, Position, TradeRecord, TradeSide};

/// Where the cache layer gets balances and positions from
#[async_trait]
pub trait AccountSource: Send + Sync {
    async fn fetch_balance(&self) -> anyhow::Result<BalanceSnapshot>;
    async fn fetch_positions(&self) -> anyhow::Result<Vec<Position>>;
}

struct PaperState {
    cash: Decimal,
    positions: Vec<Position>,
}

impl PaperState {
    fn fill(&mut self, symbol: &str, side: TradeSide, quantity: Decimal, price: Decimal) {
        let notional = quantity * price;
        match side {
            TradeSide::Buy => {
                self.cash -= notional;
                match self.positions.iter_mut().find(|p| p.symbol == symbol) {
                    Some(pos) => {
                        let total = pos.quantity + quantity;
                        if total > Decimal::ZERO {
                            pos.entry_price = (pos.entry_price * pos.quantity + notional) / total;
                        }
                        pos.quantity = total;
                    }
                    None => self.positions.push(Position {
                        symbol: symbol.to_string(),
                        quantity,
                        entry_price: price,
                    }),
                }
            }
            TradeSide::Sell => {
                self.cash += notional;
                if let Some(pos) = self.positions.iter_mut().find(|p| p.symbol == symbol) {
                    pos.quantity -= quantity;
                }
                self.positions.retain(|p| p.quantity > Decimal::ZERO);
            }
        }
    }
}

/// In-memory account that applies reported fills to a starting balance
pub struct PaperAccount {
    state: Mutex<PaperState>,
}

impl PaperAccount {
    pub fn new(starting_capital: Decimal) -> Self {
        Self {
            state: Mutex::new(PaperState {
                cash: starting_capital,
                positions: Vec::new(),
            }),
        }
    }

    /// Apply an opening or closing fill. Buys spend cash and grow the
    /// position, sells do the reverse.
    pub async fn apply_fill(&self, symbol: &str, side: TradeSide, quantity: Decimal, price: Decimal) {
        let mut state = self.state.lock().await;
        state.fill(symbol, side, quantity, price);
        debug!(symbol, side = side.as_str(), %quantity, %price, cash = %state.cash, "Paper fill applied");
    }

    /// Book a closed round trip. A long whose entry was applied as a fill is
    /// sold at the exit price; otherwise only the realized PnL moves cash.
    pub async fn settle(&self, trade: &TradeRecord) {
        let mut state = self.state.lock().await;
        let held = trade.side == TradeSide::Buy
            && state
                .positions
                .iter()
                .any(|p| p.symbol == trade.symbol && p.quantity >= trade.quantity);
        if held {
            state.fill(&trade.symbol, TradeSide::Sell, trade.quantity, trade.exit_price);
        } else {
            state.cash += trade.pnl;
        }
        debug!(
            strategy = %trade.strategy_id,
            pnl = %trade.pnl,
            closed_position = held,
            cash = %state.cash,
            "Paper trade settled"
        );
    }

    pub async fn deposit(&self, amount: Decimal) {
        self.state.lock().await.cash += amount;
    }

    pub async fn withdraw(&self, amount: Decimal) {
        self.state.lock().await.cash -= amount;
    }
}

#[async_trait]
impl AccountSource for PaperAccount {
    async fn fetch_balance(&self) -> anyhow::Result<BalanceSnapshot> {
        let state = self.state.lock().await;
        let invested: Decimal = state
            .positions
            .iter()
            .map(|p| p.quantity * p.entry_price)
            .sum();
        Ok(BalanceSnapshot {
            total: state.cash + invested,
            available: state.cash.max(Decimal::ZERO),
        })
    }

    async fn fetch_positions(&self) -> anyhow::Result<Vec<Position>> {
        Ok(self.state.lock().await.positions.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use rust_decimal_macros::dec;

    #[tokio::test]
    async fn test_fills_move_cash_and_positions() {
        let account = PaperAccount::new(dec!(1000));
        account.apply_fill("BTCUSDT", TradeSide::Buy, dec!(2), dec!(100)).await;
        account.apply_fill("BTCUSDT", TradeSide::Buy, dec!(2), dec!(200)).await;

        let balance = account.fetch_balance().await.unwrap();
        assert_eq!(balance.available, dec!(400));
        assert_eq!(balance.total, dec!(1000));

        let positions = account.fetch_positions().await.unwrap();
        assert_eq!(positions.len(), 1);
        assert_eq!(positions[0].quantity, dec!(4));
        assert_eq!(positions[0].entry_price, dec!(150));

        account.apply_fill("BTCUSDT", TradeSide::Sell, dec!(4), dec!(160)).await;
        assert!(account.fetch_positions().await.unwrap().is_empty());
        assert_eq!(account.fetch_balance().await.unwrap().available, dec!(1040));
    }

    #[tokio::test]
    async fn test_settle_books_realized_pnl() {
        let account = PaperAccount::new(dec!(1000));
        let now = Utc::now();
        let loss = TradeRecord {
            id: None,
            strategy_id: "S1".to_string(),
            symbol: "ETHUSDT".to_string(),
            side: TradeSide::Buy,
            entry_price: dec!(2000),
            exit_price: dec!(1900),
            quantity: dec!(0.5),
            pnl: dec!(-50),
            pnl_pct: -5.0,
            opened_at: now,
            closed_at: now,
        };
        account.settle(&loss).await;
        assert_eq!(account.fetch_balance().await.unwrap().available, dec!(950));
        assert!(account.fetch_positions().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_settle_closes_position_opened_by_entry_fill() {
        let account = PaperAccount::new(dec!(1000));
        account.apply_fill("BTCUSDT", TradeSide::Buy, dec!(2), dec!(100)).await;
        assert_eq!(account.fetch_positions().await.unwrap().len(), 1);
        assert_eq!(account.fetch_balance().await.unwrap().available, dec!(800));

        let now = Utc::now();
        let win = TradeRecord {
            id: None,
            strategy_id: "S1".to_string(),
            symbol: "BTCUSDT".to_string(),
            side: TradeSide::Buy,
            entry_price: dec!(100),
            exit_price: dec!(110),
            quantity: dec!(2),
            pnl: dec!(20),
            pnl_pct: 10.0,
            opened_at: now,
            closed_at: now,
        };
        account.settle(&win).await;

        assert!(account.fetch_positions().await.unwrap().is_empty());
        assert_eq!(account.fetch_balance().await.unwrap().available, dec!(1020));
    }

    #[tokio::test]
    async fn test_deposit_and_withdraw() {
        let account = PaperAccount::new(dec!(100));
        account.deposit(dec!(50)).await;
        account.withdraw(dec!(20)).await;
        assert_eq!(account.fetch_balance().await.unwrap().available, dec!(130));
    }
}
