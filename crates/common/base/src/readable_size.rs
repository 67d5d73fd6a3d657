// Copyright 2025 Crrow
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//      http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Byte sizes that read and write as `512KiB`, `20MiB`, `1GiB`.

use std::{fmt, str::FromStr};

use serde::{Deserialize, Deserializer, Serialize, Serializer, de};
use snafu::Snafu;

const KIB: u64 = 1024;
const MIB: u64 = KIB * 1024;
const GIB: u64 = MIB * 1024;

#[derive(Debug, Snafu, PartialEq, Eq)]
#[snafu(display("invalid size '{input}': {reason}"))]
pub struct ParseSizeError {
    input:  String,
    reason: &'static str,
}

/// A byte count with binary-unit constructors and a human readable form.
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, derive_more::From,
)]
pub struct ReadableSize(pub u64);

impl ReadableSize {
    #[must_use]
    pub const fn kb(count: u64) -> Self { Self(count * KIB) }

    #[must_use]
    pub const fn mb(count: u64) -> Self { Self(count * MIB) }

    #[must_use]
    pub const fn gb(count: u64) -> Self { Self(count * GIB) }

    #[must_use]
    pub const fn as_bytes(self) -> u64 { self.0 }

    /// Byte count as `usize`, saturating on 32-bit targets.
    #[must_use]
    pub fn as_usize(self) -> usize { usize::try_from(self.0).unwrap_or(usize::MAX) }
}

impl fmt::Display for ReadableSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let size = self.0;
        if size >= GIB && size % GIB == 0 {
            write!(f, "{}GiB", size / GIB)
        } else if size >= MIB && size % MIB == 0 {
            write!(f, "{}MiB", size / MIB)
        } else if size >= KIB && size % KIB == 0 {
            write!(f, "{}KiB", size / KIB)
        } else {
            write!(f, "{size}B")
        }
    }
}

impl FromStr for ReadableSize {
    type Err = ParseSizeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let input = s.trim();
        let split = input
            .find(|c: char| !c.is_ascii_digit())
            .unwrap_or(input.len());
        let (number, unit) = input.split_at(split);
        let number: u64 = number.parse().map_err(|_| ParseSizeError {
            input:  s.to_string(),
            reason: "missing numeric part",
        })?;

        let multiplier = match unit.trim().to_ascii_lowercase().as_str() {
            "" | "b" => 1,
            "k" | "kb" | "kib" => KIB,
            "m" | "mb" | "mib" => MIB,
            "g" | "gb" | "gib" => GIB,
            _ => {
                return ParseSizeSnafu {
                    input:  s.to_string(),
                    reason: "unknown unit",
                }
                .fail();
            }
        };

        number
            .checked_mul(multiplier)
            .map(Self)
            .ok_or_else(|| ParseSizeError {
                input:  s.to_string(),
                reason: "overflow",
            })
    }
}

impl Serialize for ReadableSize {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for ReadableSize {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Bytes(u64),
            Text(String),
        }

        match Raw::deserialize(deserializer)? {
            Raw::Bytes(bytes) => Ok(Self(bytes)),
            Raw::Text(text) => text.parse().map_err(de::Error::custom),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_constructors() {
        assert_eq!(ReadableSize::kb(512).as_bytes(), 524_288);
        assert_eq!(ReadableSize::mb(1).as_bytes(), 1_048_576);
        assert_eq!(ReadableSize::gb(2).as_bytes(), 2 * 1_073_741_824);
    }

    #[test]
    fn test_parse_and_display() {
        assert_eq!("512KiB".parse::<ReadableSize>().unwrap(), ReadableSize::kb(512));
        assert_eq!("20mb".parse::<ReadableSize>().unwrap(), ReadableSize::mb(20));
        assert_eq!("42".parse::<ReadableSize>().unwrap(), ReadableSize(42));
        assert_eq!(ReadableSize::kb(512).to_string(), "512KiB");
        assert_eq!(ReadableSize(1000).to_string(), "1000B");
        assert!("lots".parse::<ReadableSize>().is_err());
        assert!("12parsecs".parse::<ReadableSize>().is_err());
    }

    #[test]
    fn test_serde() {
        let json = serde_json::to_string(&ReadableSize::mb(20)).unwrap();
        assert_eq!(json, "\"20MiB\"");
        let from_text: ReadableSize = serde_json::from_str("\"4KiB\"").unwrap();
        let from_number: ReadableSize = serde_json::from_str("4096").unwrap();
        assert_eq!(from_text, from_number);
    }
}
