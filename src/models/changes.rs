use rust_decimal::Decimal;
use serde::de::{MapAccess, Visitor};
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;

/// Address to signed balance delta, in insertion order.
///
/// Addresses are unique; `add` accumulates into an existing entry.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Changes(Vec<(String, Decimal)>);

impl Changes {
    pub fn new() -> Self {
        Self(Vec::new())
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn get(&self, addr: &str) -> Option<Decimal> {
        self.0.iter().find(|(a, _)| a == addr).map(|(_, v)| *v)
    }

    pub fn contains(&self, addr: &str) -> bool {
        self.0.iter().any(|(a, _)| a == addr)
    }

    /// Adds `delta` to `addr`, inserting it at the end when new
    pub fn add(&mut self, addr: &str, delta: Decimal) {
        match self.0.iter_mut().find(|(a, _)| a == addr) {
            Some((_, value)) => *value += delta,
            None => self.0.push((addr.to_string(), delta)),
        }
    }

    pub fn set(&mut self, addr: &str, value: Decimal) {
        match self.0.iter_mut().find(|(a, _)| a == addr) {
            Some((_, current)) => *current = value,
            None => self.0.push((addr.to_string(), value)),
        }
    }

    pub fn remove(&mut self, addr: &str) -> Option<Decimal> {
        let pos = self.0.iter().position(|(a, _)| a == addr)?;
        Some(self.0.remove(pos).1)
    }

    pub fn retain_non_zero(&mut self) {
        self.0.retain(|(_, v)| !v.is_zero());
    }

    pub fn negate(&mut self) {
        for (_, value) in self.0.iter_mut() {
            *value = -*value;
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, Decimal)> + '_ {
        self.0.iter().map(|(a, v)| (a.as_str(), *v))
    }

    pub fn addresses(&self) -> impl Iterator<Item = &str> + '_ {
        self.0.iter().map(|(a, _)| a.as_str())
    }

    pub fn sum(&self) -> Decimal {
        self.0.iter().map(|(_, v)| *v).sum()
    }
}

impl FromIterator<(String, Decimal)> for Changes {
    fn from_iter<I: IntoIterator<Item = (String, Decimal)>>(iter: I) -> Self {
        let mut changes = Changes::new();
        for (addr, delta) in iter {
            changes.add(&addr, delta);
        }
        changes
    }
}

impl Serialize for Changes {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.0.len()))?;
        for (addr, value) in &self.0 {
            map.serialize_entry(addr, &value.to_string())?;
        }
        map.end()
    }
}

struct ChangesVisitor;

impl<'de> Visitor<'de> for ChangesVisitor {
    type Value = Changes;

    fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("a map of address to decimal amount")
    }

    fn visit_map<M: MapAccess<'de>>(self, mut access: M) -> Result<Changes, M::Error> {
        let mut changes = Changes::new();
        while let Some((addr, value)) = access.next_entry::<String, Decimal>()? {
            changes.add(&addr, value);
        }
        Ok(changes)
    }
}

impl<'de> Deserialize<'de> for Changes {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        deserializer.deserialize_map(ChangesVisitor)
    }
}
