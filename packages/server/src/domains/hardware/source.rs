//! Where listings come from.
//!
//! Scraping itself lives outside this crate. A source only has to produce
//! a promise of listings for one hardware kind; the catalogue source serves
//! a JSON catalogue through the reactor with a simulated latency so the
//! refresh routine behaves as it would against a live site.

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;
use tickwork::{Promise, Reactor};
use tracing::debug;

use super::models::{HardwareKind, Listing};

const SEED_CATALOGUE: &str = include_str!("seed_catalogue.json");

/// Produces listings for one hardware kind per call.
///
/// `attempt` is the retry attempt index, starting at 0. Returning `Err`
/// means the request could not even be issued.
pub trait HardwareSource: 'static {
    fn name(&self) -> &str;

    fn fetch(&self, kind: HardwareKind, attempt: u32) -> Result<Promise<Vec<Listing>>>;
}

/// A fixed set of listings.
#[derive(Debug, Clone, Deserialize)]
pub struct Catalogue {
    pub listings: Vec<Listing>,
}

impl Catalogue {
    /// The catalogue bundled with the server.
    pub fn seed() -> Result<Self> {
        Self::from_json(SEED_CATALOGUE).context("Bundled seed catalogue is invalid")
    }

    pub fn from_json(raw: &str) -> Result<Self> {
        serde_json::from_str(raw).context("Failed to parse catalogue JSON")
    }

    pub fn from_path(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read catalogue at {}", path.display()))?;
        Self::from_json(&raw).with_context(|| format!("Invalid catalogue at {}", path.display()))
    }

    pub fn for_kind(&self, kind: HardwareKind) -> Vec<Listing> {
        self.listings
            .iter()
            .filter(|listing| listing.kind == kind)
            .cloned()
            .collect()
    }
}

/// Serves a [`Catalogue`] after a delay on the reactor.
pub struct CatalogueSource {
    reactor: Reactor,
    catalogue: Catalogue,
    latency: Duration,
}

impl CatalogueSource {
    pub fn new(reactor: &Reactor, catalogue: Catalogue) -> Self {
        Self {
            reactor: reactor.clone(),
            catalogue,
            latency: Duration::ZERO,
        }
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }
}

impl HardwareSource for CatalogueSource {
    fn name(&self) -> &str {
        "catalogue"
    }

    fn fetch(&self, kind: HardwareKind, attempt: u32) -> Result<Promise<Vec<Listing>>> {
        let listings = self.catalogue.for_kind(kind);
        debug!(
            source = self.name(),
            kind = %kind,
            attempt,
            listings = listings.len(),
            "fetching listings"
        );
        Ok(self.reactor.delay(self.latency).map(move |()| listings))
    }
}
