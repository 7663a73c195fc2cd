use std::rc::Rc;

use tickwork::{Dispatcher, Event, Listener, ListenerResult};
use tracing::info;

use super::refresh::{PriceDrop, RefreshReport, VALUES_REFRESHED};
use super::store::ValueStore;

pub const STORE_PRIORITY: i32 = 10;
pub const PRICE_DROP_PRIORITY: i32 = 0;
pub const SUMMARY_PRIORITY: i32 = -10;

/// Register the refresh listeners in their standard order.
pub fn register_listeners(dispatcher: &Dispatcher<RefreshReport>, store: &ValueStore) {
    dispatcher.add_listener(
        VALUES_REFRESHED,
        StoreValuesListener::new(store.clone()),
        STORE_PRIORITY,
    );
    dispatcher.add_listener(VALUES_REFRESHED, PriceDropListener, PRICE_DROP_PRIORITY);
    dispatcher.add_listener(VALUES_REFRESHED, SummaryListener, SUMMARY_PRIORITY);
}

/// Publishes fresh values and records the prices they replaced.
pub struct StoreValuesListener {
    store: ValueStore,
}

impl StoreValuesListener {
    pub fn new(store: ValueStore) -> Self {
        Self { store }
    }
}

impl Listener<RefreshReport> for StoreValuesListener {
    fn name(&self) -> &str {
        "store_values"
    }

    fn handle(
        &self,
        event: &Rc<Event<RefreshReport>>,
        _name: &str,
        _dispatcher: &Dispatcher<RefreshReport>,
    ) -> ListenerResult {
        let previous = {
            let report = event.detail();
            self.store
                .publish(&report.values, &report.failed_kinds(), report.fetched_at)
        };
        event.detail_mut().previous_prices = previous;
        Ok(None)
    }
}

/// Compares fresh prices against the replaced ones.
pub struct PriceDropListener;

impl Listener<RefreshReport> for PriceDropListener {
    fn name(&self) -> &str {
        "price_drops"
    }

    fn handle(
        &self,
        event: &Rc<Event<RefreshReport>>,
        _name: &str,
        _dispatcher: &Dispatcher<RefreshReport>,
    ) -> ListenerResult {
        let mut report = event.detail_mut();
        let drops: Vec<PriceDrop> = report
            .values
            .values()
            .flatten()
            .filter_map(|value| {
                let previous_price = *report.previous_prices.get(&value.id)?;
                (value.price < previous_price).then(|| PriceDrop {
                    id: value.id.clone(),
                    name: value.name.clone(),
                    previous_price,
                    price: value.price,
                })
            })
            .collect();

        for price_drop in &drops {
            info!(
                id = %price_drop.id,
                name = %price_drop.name,
                previous_price = price_drop.previous_price,
                price = price_drop.price,
                "price dropped"
            );
        }
        report.price_drops = drops;
        Ok(None)
    }
}

/// Logs one line per refresh.
pub struct SummaryListener;

impl Listener<RefreshReport> for SummaryListener {
    fn name(&self) -> &str {
        "summary"
    }

    fn handle(
        &self,
        event: &Rc<Event<RefreshReport>>,
        name: &str,
        _dispatcher: &Dispatcher<RefreshReport>,
    ) -> ListenerResult {
        let report = event.detail();
        let best: Vec<String> = report
            .values
            .iter()
            .filter_map(|(kind, values)| values.first().map(|v| format!("{kind}={}", v.name)))
            .collect();
        info!(
            event = name,
            listings = report.listing_count(),
            failed = report.failures.len(),
            price_drops = report.price_drops.len(),
            best = %best.join(", "),
            "hardware values refreshed"
        );
        Ok(None)
    }
}
