//! The refresh unit of work.
//!
//! One cycle:
//!
//! ```text
//! for each kind ──► retry(attempt ──► issuer turn ──► source.fetch(kind, attempt))
//!                        │
//!      all_settled ◄─────┘
//!          │
//!          ├─ every kind failed ──► reject (routine logs the retry chain)
//!          │
//!          └─► compute ratios ──► dispatch "hardware.values_refreshed"
//!                                      │
//!                       cycle settles when the listeners are done
//! ```

use std::collections::{BTreeMap, HashMap};
use std::rc::Rc;

use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tickwork::{all_settled, Dispatcher, Promise, RetryAssistant, TimeIssuer, UnitOfWork};
use tracing::{info, warn};

use super::models::{rank, HardwareKind, HardwareValue, Listing};
use super::source::HardwareSource;

/// Event name dispatched after every successful refresh.
pub const VALUES_REFRESHED: &str = "hardware.values_refreshed";

/// A kind that could not be fetched this cycle
#[derive(Debug, Clone, Serialize)]
pub struct KindFailure {
    pub kind: HardwareKind,
    pub error: String,
}

/// A listing that became cheaper since the previous refresh
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PriceDrop {
    pub id: String,
    pub name: String,
    pub previous_price: f64,
    pub price: f64,
}

/// Payload of [`VALUES_REFRESHED`].
///
/// Listeners fill in `previous_prices` and `price_drops` as the event moves
/// through them.
#[derive(Debug, Clone, Serialize)]
pub struct RefreshReport {
    pub fetched_at: DateTime<Utc>,
    pub values: BTreeMap<HardwareKind, Vec<HardwareValue>>,
    pub failures: Vec<KindFailure>,
    /// Listings dropped for having no usable ratio
    pub skipped: usize,
    pub previous_prices: HashMap<String, f64>,
    pub price_drops: Vec<PriceDrop>,
}

impl RefreshReport {
    /// Build a report from per-kind fetch outcomes.
    pub fn from_outcomes(outcomes: Vec<(HardwareKind, Result<Vec<Listing>>)>) -> Self {
        let mut values = BTreeMap::new();
        let mut failures = Vec::new();
        let mut skipped = 0;

        for (kind, outcome) in outcomes {
            match outcome {
                Ok(listings) => {
                    let total = listings.len();
                    let computed: Vec<HardwareValue> =
                        listings.iter().filter_map(HardwareValue::from_listing).collect();
                    skipped += total - computed.len();
                    values.insert(kind, rank(computed));
                }
                Err(err) => failures.push(KindFailure {
                    kind,
                    error: format!("{err:#}"),
                }),
            }
        }

        Self {
            fetched_at: Utc::now(),
            values,
            failures,
            skipped,
            previous_prices: HashMap::new(),
            price_drops: Vec::new(),
        }
    }

    pub fn failed_kinds(&self) -> Vec<HardwareKind> {
        self.failures.iter().map(|failure| failure.kind).collect()
    }

    pub fn listing_count(&self) -> usize {
        self.values.values().map(Vec::len).sum()
    }
}

/// Fetches every kind through the issuer and retry assistant, then
/// dispatches the report.
pub struct RefreshValues {
    source: Rc<dyn HardwareSource>,
    issuer: TimeIssuer,
    retry: RetryAssistant,
    dispatcher: Dispatcher<RefreshReport>,
    kinds: Vec<HardwareKind>,
}

impl RefreshValues {
    pub fn new(
        source: impl HardwareSource,
        issuer: TimeIssuer,
        retry: RetryAssistant,
        dispatcher: Dispatcher<RefreshReport>,
    ) -> Self {
        Self {
            source: Rc::new(source),
            issuer,
            retry,
            dispatcher,
            kinds: HardwareKind::ALL.to_vec(),
        }
    }

    /// Restrict the kinds fetched each cycle.
    pub fn with_kinds(mut self, kinds: Vec<HardwareKind>) -> Self {
        self.kinds = kinds;
        self
    }

    fn fetch_kind(&self, kind: HardwareKind) -> Promise<Vec<Listing>> {
        let source = self.source.clone();
        let issuer = self.issuer.clone();
        self.retry.retry(move |attempt| {
            let source = source.clone();
            Ok(issuer.with_turn(move || source.fetch(kind, attempt)))
        })
    }
}

impl UnitOfWork for RefreshValues {
    fn name(&self) -> &str {
        "refresh_hardware_values"
    }

    fn run(&self) -> Result<Promise<()>> {
        if self.kinds.is_empty() {
            return Err(anyhow!("no hardware kinds configured for refresh"));
        }

        let kinds = self.kinds.clone();
        let fetches = kinds.iter().map(|&kind| self.fetch_kind(kind)).collect();
        let dispatcher = self.dispatcher.clone();
        let source = self.source.name().to_string();

        Ok(all_settled(fetches).and_then(move |outcomes| {
            let outcomes: Vec<(HardwareKind, Result<Vec<Listing>>)> =
                kinds.into_iter().zip(outcomes).collect();

            if outcomes.iter().all(|(_, outcome)| outcome.is_err()) {
                let first = outcomes.into_iter().find_map(|(_, outcome)| outcome.err());
                let err = first.unwrap_or_else(|| anyhow!("no fetch outcomes"));
                return Promise::rejected(err.context(format!(
                    "Refresh from {source} failed for every hardware kind"
                )));
            }

            let report = RefreshReport::from_outcomes(outcomes);
            for failure in &report.failures {
                warn!(
                    source = %source,
                    kind = %failure.kind,
                    error = %failure.error,
                    "hardware kind could not be refreshed"
                );
            }
            info!(
                source = %source,
                listings = report.listing_count(),
                skipped = report.skipped,
                failed = report.failures.len(),
                "hardware listings fetched"
            );

            let (_event, done) = dispatcher.dispatch(VALUES_REFRESHED, report);
            done
        }))
    }
}
