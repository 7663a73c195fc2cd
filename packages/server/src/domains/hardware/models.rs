use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Hardware categories the refresh routine tracks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HardwareKind {
    Cpu,
    Gpu,
}

impl HardwareKind {
    pub const ALL: [HardwareKind; 2] = [HardwareKind::Cpu, HardwareKind::Gpu];

    pub fn as_str(&self) -> &'static str {
        match self {
            HardwareKind::Cpu => "cpu",
            HardwareKind::Gpu => "gpu",
        }
    }
}

impl fmt::Display for HardwareKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
#[error("unknown hardware kind '{0}', expected 'cpu' or 'gpu'")]
pub struct UnknownHardwareKind(pub String);

impl FromStr for HardwareKind {
    type Err = UnknownHardwareKind;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "cpu" => Ok(HardwareKind::Cpu),
            "gpu" => Ok(HardwareKind::Gpu),
            other => Err(UnknownHardwareKind(other.to_string())),
        }
    }
}

/// A product as reported by a source: a price and a benchmark score
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Listing {
    pub id: String,
    pub name: String,
    pub kind: HardwareKind,
    pub price: f64,
    pub benchmark: f64,
}

/// A listing with its computed value ratio (benchmark points per currency unit)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HardwareValue {
    pub id: String,
    pub name: String,
    pub kind: HardwareKind,
    pub price: f64,
    pub benchmark: f64,
    pub ratio: f64,
}

impl HardwareValue {
    /// Returns `None` when the listing has no usable ratio.
    pub fn from_listing(listing: &Listing) -> Option<Self> {
        let ratio = value_ratio(listing.benchmark, listing.price)?;
        Some(Self {
            id: listing.id.clone(),
            name: listing.name.clone(),
            kind: listing.kind,
            price: listing.price,
            benchmark: listing.benchmark,
            ratio,
        })
    }
}

/// `benchmark / price` rounded to four decimals.
///
/// `None` when the price is not strictly positive or either input is not
/// finite.
pub fn value_ratio(benchmark: f64, price: f64) -> Option<f64> {
    if !benchmark.is_finite() || !price.is_finite() || price <= 0.0 {
        return None;
    }
    let ratio = benchmark / price;
    ratio.is_finite().then(|| (ratio * 10_000.0).round() / 10_000.0)
}

/// Best value first; equal ratios ordered by name.
pub fn rank(mut values: Vec<HardwareValue>) -> Vec<HardwareValue> {
    values.sort_by(|a, b| {
        b.ratio
            .partial_cmp(&a.ratio)
            .unwrap_or(Ordering::Equal)
            .then_with(|| a.name.cmp(&b.name))
    });
    values
}

#[cfg(test)]
mod tests {
    use super::*;

    fn value(name: &str, ratio: f64) -> HardwareValue {
        HardwareValue {
            id: name.to_lowercase(),
            name: name.to_string(),
            kind: HardwareKind::Cpu,
            price: 100.0,
            benchmark: ratio * 100.0,
            ratio,
        }
    }

    #[test]
    fn test_value_ratio_rounds_to_four_decimals() {
        assert_eq!(value_ratio(1000.0, 3.0), Some(333.3333));
        assert_eq!(value_ratio(38_000.0, 289.99), Some(131.0390));
    }

    #[test]
    fn test_value_ratio_rejects_unusable_prices() {
        assert_eq!(value_ratio(1000.0, 0.0), None);
        assert_eq!(value_ratio(1000.0, -5.0), None);
        assert_eq!(value_ratio(f64::NAN, 10.0), None);
        assert_eq!(value_ratio(1000.0, f64::INFINITY), None);
    }

    #[test]
    fn test_rank_orders_by_ratio_then_name() {
        let ranked = rank(vec![value("Zen", 50.0), value("Atom", 80.0), value("Core", 50.0)]);
        let names: Vec<&str> = ranked.iter().map(|v| v.name.as_str()).collect();
        assert_eq!(names, vec!["Atom", "Core", "Zen"]);
    }

    #[test]
    fn test_kind_parsing_and_serde() {
        assert_eq!("GPU".parse::<HardwareKind>().unwrap(), HardwareKind::Gpu);
        assert!("ram".parse::<HardwareKind>().is_err());
        assert_eq!(serde_json::to_string(&HardwareKind::Cpu).unwrap(), "\"cpu\"");
    }

    #[test]
    fn test_from_listing_skips_free_items() {
        let listing = Listing {
            id: "x".into(),
            name: "Giveaway".into(),
            kind: HardwareKind::Gpu,
            price: 0.0,
            benchmark: 9000.0,
        };
        assert!(HardwareValue::from_listing(&listing).is_none());
    }
}
