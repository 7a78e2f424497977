//! ISO 13616 IBAN checks for EU/EEA accounts.

use std::fmt;
use std::str::FromStr;

use thiserror::Error;

/// EU member states plus the EEA (NO, IS, LI).
pub const SUPPORTED_COUNTRIES: &[&str] = &[
    "AT", "BE", "BG", "HR", "CY", "CZ", "DK", "EE", "FI", "FR", "DE", "GR", "HU", "IE", "IT",
    "LV", "LT", "LU", "MT", "NL", "PL", "PT", "RO", "SK", "SI", "ES", "SE", "NO", "IS", "LI",
];

const MIN_LEN: usize = 15;
const MAX_LEN: usize = 34;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IbanError {
    #[error("IBAN must be {MIN_LEN} to {MAX_LEN} characters, got {0}")]
    Length(usize),
    #[error("IBAN contains invalid characters")]
    Format,
    #[error("IBAN country {0} is not in the EU/EEA")]
    Country(String),
    #[error("IBAN checksum is invalid")]
    Checksum,
}

/// Normalised IBAN: uppercase, no spaces.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Iban(String);

impl Iban {
    pub fn parse(input: &str) -> Result<Self, IbanError> {
        let cleaned: String = input
            .chars()
            .filter(|c| !c.is_whitespace())
            .map(|c| c.to_ascii_uppercase())
            .collect();
        if !cleaned.chars().all(|c| c.is_ascii_alphanumeric()) {
            return Err(IbanError::Format);
        }
        if cleaned.len() < MIN_LEN || cleaned.len() > MAX_LEN {
            return Err(IbanError::Length(cleaned.len()));
        }
        let bytes = cleaned.as_bytes();
        if !bytes[..2].iter().all(u8::is_ascii_alphabetic) || !bytes[2..4].iter().all(u8::is_ascii_digit) {
            return Err(IbanError::Format);
        }
        let country = &cleaned[..2];
        if !SUPPORTED_COUNTRIES.contains(&country) {
            return Err(IbanError::Country(country.to_string()));
        }
        if mod97(&cleaned) != 1 {
            return Err(IbanError::Checksum);
        }
        Ok(Self(cleaned))
    }

    pub fn country(&self) -> &str {
        &self.0[..2]
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Remainder of the rearranged IBAN, letters expanded to 10..=35.
/// Folded digit by digit so no big integer is needed.
fn mod97(iban: &str) -> u32 {
    let (head, tail) = iban.split_at(4);
    tail.chars().chain(head.chars()).fold(0u32, |acc, c| match c.to_digit(36) {
        Some(v) if v >= 10 => (acc * 100 + v) % 97,
        Some(v) => (acc * 10 + v) % 97,
        None => acc,
    })
}

impl FromStr for Iban {
    type Err = IbanError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Iban::parse(s)
    }
}

/// Printed in groups of four.
impl fmt::Display for Iban {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let grouped = self
            .0
            .as_bytes()
            .chunks(4)
            .map(|c| String::from_utf8_lossy(c).into_owned())
            .collect::<Vec<_>>()
            .join(" ");
        f.write_str(&grouped)
    }
}
