//! Interval tokens for RECENT file time windows.
//!
//! An interval is `<count><unit>` with unit one of `s m h d W M Q Y`,
//! or the bare token `Z` meaning "infinite" (retain everything).

use std::{cmp::Ordering, fmt, str::FromStr};

use serde::{Deserialize, Deserializer, Serialize, Serializer, de};

use crate::error::Error;

/// A single time unit with its length in seconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Unit {
   Second,
   Minute,
   Hour,
   Day,
   Week,
   Month,
   Quarter,
   Year,
}

impl Unit {
   pub fn secs(self) -> u64 {
      match self {
         Unit::Second => 1,
         Unit::Minute => 60,
         Unit::Hour => 3600,
         Unit::Day => 86_400,
         Unit::Week => 604_800,
         Unit::Month => 2_592_000,
         Unit::Quarter => 7_776_000,
         Unit::Year => 31_557_600,
      }
   }

   fn symbol(self) -> char {
      match self {
         Unit::Second => 's',
         Unit::Minute => 'm',
         Unit::Hour => 'h',
         Unit::Day => 'd',
         Unit::Week => 'W',
         Unit::Month => 'M',
         Unit::Quarter => 'Q',
         Unit::Year => 'Y',
      }
   }

   fn from_symbol(c: char) -> Option<Self> {
      match c {
         's' => Some(Unit::Second),
         'm' => Some(Unit::Minute),
         'h' => Some(Unit::Hour),
         'd' => Some(Unit::Day),
         'W' => Some(Unit::Week),
         'M' => Some(Unit::Month),
         'Q' => Some(Unit::Quarter),
         'Y' => Some(Unit::Year),
         _ => None,
      }
   }
}

/// A RECENT file time window.
#[derive(Debug, Clone, Copy)]
pub enum Interval {
   Finite { count: u32, unit: Unit },
   Infinite,
}

// Equality follows duration so that Eq stays consistent with Ord:
// `1h` and `60m` name the same window.
impl PartialEq for Interval {
   fn eq(&self, other: &Self) -> bool {
      self.secs() == other.secs()
   }
}

impl Eq for Interval {}

impl Interval {
   /// Window length in seconds. The infinite interval saturates to
   /// `u64::MAX` so duration comparisons order it last.
   pub fn secs(self) -> u64 {
      match self {
         Interval::Finite { count, unit } => u64::from(count) * unit.secs(),
         Interval::Infinite => u64::MAX,
      }
   }

   pub fn is_infinite(self) -> bool {
      matches!(self, Interval::Infinite)
   }
}

impl fmt::Display for Interval {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      match self {
         Interval::Finite { count, unit } => write!(f, "{count}{}", unit.symbol()),
         Interval::Infinite => f.write_str("Z"),
      }
   }
}

impl FromStr for Interval {
   type Err = Error;

   fn from_str(s: &str) -> Result<Self, Error> {
      if s == "Z" {
         return Ok(Interval::Infinite);
      }

      let mut chars = s.chars();
      let Some(last) = chars.next_back() else {
         return Err(Error::InvalidInterval(s.to_string()));
      };
      let Some(unit) = Unit::from_symbol(last) else {
         return Err(Error::InvalidInterval(s.to_string()));
      };

      let digits = chars.as_str();
      let count = if digits.is_empty() {
         1
      } else {
         digits
            .parse::<u32>()
            .map_err(|_| Error::InvalidInterval(s.to_string()))?
      };

      Ok(Interval::Finite { count, unit })
   }
}

impl PartialOrd for Interval {
   fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
      Some(self.cmp(other))
   }
}

impl Ord for Interval {
   fn cmp(&self, other: &Self) -> Ordering {
      self.secs().cmp(&other.secs())
   }
}

impl Serialize for Interval {
   fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
      serializer.collect_str(self)
   }
}

impl<'de> Deserialize<'de> for Interval {
   fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
      let s = String::deserialize(deserializer)?;
      s.parse().map_err(de::Error::custom)
   }
}

#[cfg(test)]
mod tests {
   use super::*;

   #[test]
   fn parses_standard_tokens() {
      assert_eq!("1h".parse::<Interval>().unwrap().secs(), 3600);
      assert_eq!("6h".parse::<Interval>().unwrap().secs(), 21_600);
      assert_eq!("1d".parse::<Interval>().unwrap().secs(), 86_400);
      assert_eq!("1W".parse::<Interval>().unwrap().secs(), 604_800);
      assert_eq!("1M".parse::<Interval>().unwrap().secs(), 2_592_000);
      assert_eq!("1Q".parse::<Interval>().unwrap().secs(), 7_776_000);
      assert_eq!("1Y".parse::<Interval>().unwrap().secs(), 31_557_600);
      assert_eq!("30m".parse::<Interval>().unwrap().secs(), 1800);
   }

   #[test]
   fn bare_unit_defaults_to_one() {
      assert_eq!("h".parse::<Interval>().unwrap().secs(), 3600);
   }

   #[test]
   fn z_is_infinite() {
      let z: Interval = "Z".parse().unwrap();
      assert!(z.is_infinite());
      assert_eq!(z.secs(), u64::MAX);
   }

   #[test]
   fn rejects_garbage() {
      assert!("".parse::<Interval>().is_err());
      assert!("1x".parse::<Interval>().is_err());
      assert!("h1".parse::<Interval>().is_err());
      assert!("1.5h".parse::<Interval>().is_err());
   }

   #[test]
   fn ordering_follows_duration() {
      let mut intervals: Vec<Interval> = ["1d", "Z", "1h", "6h", "1W"]
         .iter()
         .map(|s| s.parse().unwrap())
         .collect();
      intervals.sort();
      let rendered: Vec<String> = intervals.iter().map(|i| i.to_string()).collect();
      assert_eq!(rendered, ["1h", "6h", "1d", "1W", "Z"]);
   }

   #[test]
   fn display_round_trip() {
      for token in ["1h", "6h", "1d", "1W", "1M", "1Q", "1Y", "Z", "30m"] {
         let interval: Interval = token.parse().unwrap();
         assert_eq!(interval.to_string(), token);
      }
   }
}
