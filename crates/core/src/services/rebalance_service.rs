use crate::errors::CoreError;
use crate::models::holding::Holdings;
use crate::models::model_portfolio::{ModelTarget, RebalanceAdjustment};
use crate::services::market_cache::MarketDataCache;
use crate::utils::round2;

/// Compares a model portfolio against what has actually been invested.
pub struct RebalanceService;

impl RebalanceService {
    pub fn new() -> Self {
        Self
    }

    /// One adjustment per target, in target order.
    ///
    /// Invested amount is cost basis (quantity × transaction price), so sells
    /// reduce it at their sale price. Every target instrument needs a latest
    /// price.
    pub async fn rebalance(
        &self,
        targets: &[ModelTarget],
        holdings: &Holdings,
        total_target_amount: f64,
        cache: &MarketDataCache,
    ) -> Result<Vec<RebalanceAdjustment>, CoreError> {
        let mut adjustments = Vec::with_capacity(targets.len());

        for target in targets {
            if target.reasonable_price == 0.0 {
                return Err(CoreError::DivisionByZero(format!(
                    "distance from reasonable price of {}",
                    target.instrument_id
                )));
            }

            let latest_price = cache
                .latest(&target.instrument_id)
                .await?
                .map(|p| p.close)
                .ok_or_else(|| CoreError::PriceUnavailable {
                    instrument: target.instrument_id.clone(),
                    date: "latest".into(),
                })?;

            let desired = target.target_allocation_pct / 100.0 * total_target_amount;
            let invested: f64 = holdings
                .for_instrument(&target.instrument_id)
                .map(|h| h.acquisition_value())
                .sum();

            adjustments.push(RebalanceAdjustment {
                instrument_id: target.instrument_id.clone(),
                desired_amount: round2(desired),
                invested_amount: round2(invested),
                adjusted_amount: round2(desired - invested),
                latest_price,
                reasonable_price: target.reasonable_price,
                percent_below_reasonable: round2(
                    (target.reasonable_price - latest_price) / target.reasonable_price * 100.0,
                ),
                below_reasonable_price: latest_price < target.reasonable_price,
            });
        }

        tracing::debug!(targets = targets.len(), "Computed rebalance adjustments");
        Ok(adjustments)
    }
}

impl Default for RebalanceService {
    fn default() -> Self {
        Self::new()
    }
}
