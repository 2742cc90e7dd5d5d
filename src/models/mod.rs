pub mod changes;
pub mod identity;
pub mod prices;
pub mod registry;
pub mod tags;
pub mod trade;
pub mod transfer;
pub mod valuation;

pub use changes::Changes;
pub use identity::Identity;
pub use prices::{PriceBook, NATIVE_PRICE_ID};
pub use registry::{AddressType, KnownAddress, KnownAddresses};
pub use tags::{Tag, ALWAYS_RECORD_TAGS, COUNTABLE_TAGS, DEX_LP_TAGS, DEX_TRADE_TAGS, KILL_TAGS};
pub use trade::Trade;
pub use transfer::{Chain, ContractCall, LpChange, Meta, Transfer};
pub use valuation::{aggregate_dex_trades, calculate_usd_price, calculate_usd_value, DexAggregate};
