use serde::{Deserialize, Serialize};

use crate::error::SwapError;
use crate::exchange::SwapDirection;
use crate::lightning::ChannelBalance;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TargetStrategy {
    /// Remote balance should reach `percentage` of the node's channel capacity.
    InboundLiquidityNodePercent,
    /// Local balance should reach `percentage` of the node's channel capacity.
    OutboundLiquidityNodePercent,
}

impl TargetStrategy {
    pub fn direction(self) -> SwapDirection {
        match self {
            Self::InboundLiquidityNodePercent => SwapDirection::Reverse,
            Self::OutboundLiquidityNodePercent => SwapDirection::Submarine,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LiquidityTarget {
    #[serde(rename = "target")]
    pub strategy: TargetStrategy,
    pub percentage: f64,
}

impl LiquidityTarget {
    /// Parses `{"target": "<strategy>", "percentage": <0..=100>}`.
    pub fn parse(raw: &[u8]) -> Result<Self, SwapError> {
        let target: Self = serde_json::from_slice(raw)
            .map_err(|e| SwapError::InvalidArgument(format!("malformed target: {e}")))?;
        if !target.percentage.is_finite() || !(0.0..=100.0).contains(&target.percentage) {
            return Err(SwapError::InvalidArgument(format!(
                "percentage must be within 0..=100, got {}",
                target.percentage
            )));
        }
        Ok(target)
    }

    pub fn plan(&self, balance: &ChannelBalance) -> LiquidityPlan {
        let capacity_sats = balance.capacity_sats();
        let target_sats = (capacity_sats as f64 * self.percentage / 100.0).round() as u64;
        let current_sats = match self.strategy {
            TargetStrategy::InboundLiquidityNodePercent => balance.remote_sats,
            TargetStrategy::OutboundLiquidityNodePercent => balance.local_sats,
        };

        LiquidityPlan {
            direction: self.strategy.direction(),
            capacity_sats,
            target_sats,
            current_sats,
            deficit_sats: target_sats.saturating_sub(current_sats),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LiquidityPlan {
    pub direction: SwapDirection,
    pub capacity_sats: u64,
    pub target_sats: u64,
    pub current_sats: u64,
    pub deficit_sats: u64,
}

impl LiquidityPlan {
    pub fn is_satisfied(&self) -> bool {
        self.deficit_sats == 0
    }

    /// Sizes one swap against the exchange limits. The amount is the exact
    /// deficit unless the maximum caps it; it never exceeds the deficit.
    pub fn sizing(&self, min_sats: u64, max_sats: u64) -> SwapSizing {
        let deficit = self.deficit_sats;
        if self.is_satisfied() {
            SwapSizing::Satisfied
        } else if deficit < min_sats {
            SwapSizing::BelowMinimum { deficit }
        } else if deficit > max_sats {
            SwapSizing::Capped {
                amount: max_sats,
                shortfall: deficit - max_sats,
            }
        } else {
            SwapSizing::Exact(deficit)
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SwapSizing {
    Satisfied,
    Exact(u64),
    /// One swap of `amount` leaves the target `shortfall` sats short.
    Capped { amount: u64, shortfall: u64 },
    BelowMinimum { deficit: u64 },
}
