//! Resource quantities.
//!
//! A [`Quantity`] is stored in milli-units so CPU-style fractions ("500m")
//! and whole-unit resources ("8" GPUs, "64Gi" memory) share one integer
//! representation. All arithmetic saturates; quantities are never negative.

use std::collections::BTreeMap;
use std::fmt;
use std::ops::{Add, AddAssign};
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::ValidationError;

const MILLI: u128 = 1000;

/// Non-negative resource amount in milli-units.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Quantity(u64);

impl Quantity {
    pub const ZERO: Quantity = Quantity(0);

    /// Whole units, e.g. `Quantity::units(8)` for eight GPUs.
    pub const fn units(n: u64) -> Self {
        Self(n.saturating_mul(1000))
    }

    pub const fn from_milli(milli: u64) -> Self {
        Self(milli)
    }

    pub const fn as_milli(self) -> u64 {
        self.0
    }

    pub const fn is_zero(self) -> bool {
        self.0 == 0
    }

    pub fn saturating_sub(self, other: Quantity) -> Quantity {
        Quantity(self.0.saturating_sub(other.0))
    }

    pub fn scaled(self, factor: u32) -> Quantity {
        Quantity(self.0.saturating_mul(u64::from(factor)))
    }

    /// How many times `per_unit` fits into `self` (floor division).
    ///
    /// A zero `per_unit` never bounds the result.
    pub fn fits(self, per_unit: Quantity) -> u64 {
        if per_unit.0 == 0 {
            u64::MAX
        } else {
            self.0 / per_unit.0
        }
    }
}

impl Add for Quantity {
    type Output = Quantity;

    fn add(self, rhs: Quantity) -> Quantity {
        Quantity(self.0.saturating_add(rhs.0))
    }
}

impl AddAssign for Quantity {
    fn add_assign(&mut self, rhs: Quantity) {
        self.0 = self.0.saturating_add(rhs.0);
    }
}

impl fmt::Display for Quantity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0 % 1000 == 0 {
            write!(f, "{}", self.0 / 1000)
        } else {
            write!(f, "{}m", self.0)
        }
    }
}

impl FromStr for Quantity {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let input = s.trim();
        let invalid = |reason: &str| ValidationError::Quantity {
            input: s.to_string(),
            reason: reason.to_string(),
        };

        let split = input
            .find(|c: char| c.is_ascii_alphabetic())
            .unwrap_or(input.len());
        let (number, suffix) = input.split_at(split);
        if number.is_empty() {
            return Err(invalid("missing numeric part"));
        }

        let multiplier: u128 = match suffix {
            "" => MILLI,
            "m" => 1,
            "k" => MILLI * 1_000,
            "M" => MILLI * 1_000_000,
            "G" => MILLI * 1_000_000_000,
            "T" => MILLI * 1_000_000_000_000,
            "Ki" => MILLI << 10,
            "Mi" => MILLI << 20,
            "Gi" => MILLI << 30,
            "Ti" => MILLI << 40,
            _ => return Err(invalid("unknown suffix")),
        };

        let (whole, fraction) = match number.split_once('.') {
            Some((w, f)) => (w, f),
            None => (number, ""),
        };
        if whole.is_empty() && fraction.is_empty() {
            return Err(invalid("missing digits"));
        }
        if !whole.chars().all(|c| c.is_ascii_digit())
            || !fraction.chars().all(|c| c.is_ascii_digit())
        {
            return Err(invalid("not a non-negative decimal number"));
        }
        if fraction.len() > 9 {
            return Err(invalid("too many fractional digits"));
        }

        let whole: u128 = if whole.is_empty() {
            0
        } else {
            whole.parse().map_err(|_| invalid("number too large"))?
        };
        let mut milli = whole
            .checked_mul(multiplier)
            .ok_or_else(|| invalid("number too large"))?;

        if !fraction.is_empty() {
            let frac: u128 = fraction.parse().map_err(|_| invalid("bad fraction"))?;
            let scale = u32::try_from(fraction.len())
                .ok()
                .and_then(|digits| 10u128.checked_pow(digits))
                .ok_or_else(|| invalid("fraction too long"))?;
            // Sub-milli remainders round up, as the orchestrator does.
            milli = frac
                .checked_mul(multiplier)
                .map(|scaled| scaled.div_ceil(scale))
                .and_then(|part| milli.checked_add(part))
                .ok_or_else(|| invalid("number too large"))?;
        }

        u64::try_from(milli)
            .map(Quantity)
            .map_err(|_| invalid("number too large"))
    }
}

impl Serialize for Quantity {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum QuantityRepr {
    Units(u64),
    Float(f64),
    Text(String),
}

impl<'de> Deserialize<'de> for Quantity {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        match QuantityRepr::deserialize(deserializer)? {
            QuantityRepr::Units(n) => Ok(Quantity::units(n)),
            QuantityRepr::Float(f) if f.is_finite() && f >= 0.0 => {
                Ok(Quantity((f * 1000.0).ceil() as u64))
            }
            QuantityRepr::Float(f) => Err(serde::de::Error::custom(format!(
                "invalid quantity {f}"
            ))),
            QuantityRepr::Text(s) => s.parse().map_err(serde::de::Error::custom),
        }
    }
}

// ── ResourceList ───────────────────────────────────────────────────

/// Resource name → quantity, ordered by name.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResourceList(BTreeMap<String, Quantity>);

impl ResourceList {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert.
    pub fn with(mut self, resource: impl Into<String>, quantity: Quantity) -> Self {
        self.0.insert(resource.into(), quantity);
        self
    }

    pub fn insert(&mut self, resource: impl Into<String>, quantity: Quantity) {
        self.0.insert(resource.into(), quantity);
    }

    /// Quantity for `resource`, zero when absent.
    pub fn get(&self, resource: &str) -> Quantity {
        self.0.get(resource).copied().unwrap_or_default()
    }

    pub fn contains(&self, resource: &str) -> bool {
        self.0.contains_key(resource)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Quantity)> {
        self.0.iter()
    }

    pub fn names(&self) -> impl Iterator<Item = &String> {
        self.0.keys()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// True when every quantity is zero (or the list is empty).
    pub fn is_zero(&self) -> bool {
        self.0.values().all(|q| q.is_zero())
    }

    /// Add every entry of `other` into `self`.
    pub fn add(&mut self, other: &ResourceList) {
        for (name, qty) in &other.0 {
            *self.0.entry(name.clone()).or_default() += *qty;
        }
    }

    /// Entry-wise `self - other`, floored at zero. Keys of `self` are kept.
    pub fn saturating_sub(&self, other: &ResourceList) -> ResourceList {
        ResourceList(
            self.0
                .iter()
                .map(|(name, qty)| (name.clone(), qty.saturating_sub(other.get(name))))
                .collect(),
        )
    }

    /// Every entry multiplied by `factor`.
    pub fn scaled(&self, factor: u32) -> ResourceList {
        ResourceList(
            self.0
                .iter()
                .map(|(name, qty)| (name.clone(), qty.scaled(factor)))
                .collect(),
        )
    }

    /// True when `self` can be carved out of `available`.
    pub fn fits_within(&self, available: &ResourceList) -> bool {
        self.0.iter().all(|(name, qty)| *qty <= available.get(name))
    }

    /// How many copies of `per_replica` fit into `self`.
    ///
    /// The minimum over requested resources of `floor(available / request)`.
    /// Zero-valued requests don't bound the result; an empty request yields
    /// `u32::MAX`.
    pub fn max_replicas(&self, per_replica: &ResourceList) -> u32 {
        per_replica
            .0
            .iter()
            .map(|(name, qty)| self.get(name).fits(*qty))
            .min()
            .unwrap_or(u64::MAX)
            .min(u64::from(u32::MAX)) as u32
    }
}

impl FromIterator<(String, Quantity)> for ResourceList {
    fn from_iter<I: IntoIterator<Item = (String, Quantity)>>(iter: I) -> Self {
        ResourceList(iter.into_iter().collect())
    }
}

impl<'a> IntoIterator for &'a ResourceList {
    type Item = (&'a String, &'a Quantity);
    type IntoIter = std::collections::btree_map::Iter<'a, String, Quantity>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}
