use serde::{Deserialize, Serialize};

/// A "City, Country" location as stored on profiles and orders.
/// Event locations are often just a country guess ("us"), so `city` is optional.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Location {
    pub city: Option<String>,
    pub country: String,
}

impl Location {
    /// Parses "City, Country" (or a bare country). Returns `None` for blank input.
    /// Only the first two parts count: "Austin, Texas, US" is city Austin, country Texas.
    pub fn parse(raw: &str) -> Option<Self> {
        let parts: Vec<&str> = raw
            .split(',')
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .collect();
        match parts.as_slice() {
            [] => None,
            [country] => Some(Self {
                city: None,
                country: (*country).to_string(),
            }),
            [city, country, ..] => Some(Self {
                city: Some((*city).to_string()),
                country: (*country).to_string(),
            }),
        }
    }

    /// Case-insensitive comparison. City only counts when both sides carry one.
    pub fn differs_from(&self, other: &Location) -> bool {
        if !self.country.eq_ignore_ascii_case(&other.country) {
            return true;
        }
        match (&self.city, &other.city) {
            (Some(a), Some(b)) => !a.eq_ignore_ascii_case(b),
            _ => false,
        }
    }
}
