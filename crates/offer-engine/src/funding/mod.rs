pub mod calculator;
pub mod watcher;

pub use calculator::{
    FundingEstimate, SwapFundingState, adjusted_tx_fee, buyers_input, buyers_payout,
    estimate_required, estimate_vsize, sellers_input, sellers_payout,
};
pub use watcher::{FundingEdge, FundingWatchers, SwapFundingWatcher};
