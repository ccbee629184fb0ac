pub mod account;
pub mod asset;
pub mod candle;
pub mod drift;
pub mod errors;
pub mod order;
pub mod position;
pub mod symbol;
pub mod timeframe;

pub use account::{AccountState, Trade};
pub use asset::{AssetType, Fees};
pub use candle::Candle;
pub use drift::{Drift, DriftSeverity, DriftThresholds};
pub use order::{Order, OrderResult, OrderSide, OrderStatus, OrderType, TimeInForce};
pub use position::{CompletedTier, Position, Tier};
pub use symbol::{Symbol, SymbolMap};
pub use timeframe::Timeframe;
