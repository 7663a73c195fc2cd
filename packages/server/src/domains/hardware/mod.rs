// Hardware value domain: listings, ratios, refresh routine and its listeners
pub mod listeners;
pub mod models;
pub mod refresh;
pub mod source;
pub mod store;

pub use listeners::{register_listeners, PriceDropListener, StoreValuesListener, SummaryListener};
pub use models::{rank, value_ratio, HardwareKind, HardwareValue, Listing, UnknownHardwareKind};
pub use refresh::{KindFailure, PriceDrop, RefreshReport, RefreshValues, VALUES_REFRESHED};
pub use source::{Catalogue, CatalogueSource, HardwareSource};
pub use store::{Snapshot, ValueStore};
