//! Quantized high-precision timestamps.
//!
//! An [`Epoch`] is Unix seconds stored as an `f64` and quantized to
//! 10-microsecond ticks. JSON numbers carry roughly 15-16 significant
//! decimal digits; without quantization two distinct high-precision
//! epochs can collide after a serialization round trip, which would
//! break the strict descending order of a RECENT file.

use std::{
   fmt,
   time::{SystemTime, UNIX_EPOCH},
};

use serde::{Deserialize, Deserializer, Serialize, Serializer, de};

/// Seconds per 10-microsecond tick, inverted (ticks per second).
const TICKS_PER_SEC: f64 = 1e5;

/// A point in time as fractional Unix seconds, quantized to 10 µs.
///
/// An epoch of 0 is the sentinel "unset".
#[derive(Debug, Clone, Copy, Default, PartialEq, PartialOrd)]
pub struct Epoch(f64);

impl Epoch {
   pub const ZERO: Epoch = Epoch(0.0);

   /// The current time, quantized.
   pub fn now() -> Self {
      let micros = SystemTime::now()
         .duration_since(UNIX_EPOCH)
         .unwrap_or_default()
         .as_micros() as i64;
      Self::from_ticks(micros / 10)
   }

   /// Wraps a raw float without quantizing. Values read from disk keep
   /// whatever precision they were written with; fsck repair quantizes.
   pub fn from_secs(secs: f64) -> Self {
      Epoch(secs)
   }

   pub fn from_system_time(t: SystemTime) -> Self {
      let micros = t.duration_since(UNIX_EPOCH).unwrap_or_default().as_micros() as i64;
      Self::from_ticks(micros / 10)
   }

   fn from_ticks(ticks: i64) -> Self {
      Epoch(ticks as f64 / TICKS_PER_SEC)
   }

   fn ticks(self) -> i64 {
      (self.0 * TICKS_PER_SEC).round() as i64
   }

   pub fn as_secs(self) -> f64 {
      self.0
   }

   pub fn is_zero(&self) -> bool {
      self.0 == 0.0
   }

   /// The epoch one 10 µs tick later. Used to break collisions while
   /// keeping values exactly representable with 5 fractional digits.
   pub fn increase_a_bit(self) -> Self {
      Self::from_ticks(self.ticks() + 1)
   }

   /// Snaps the value onto the 10 µs grid.
   pub fn quantized(self) -> Self {
      Self::from_ticks(self.ticks())
   }

   /// True when the value already sits on the 10 µs grid.
   pub fn is_quantized(self) -> bool {
      self == self.quantized()
   }

   pub fn max(self, other: Self) -> Self {
      if self >= other { self } else { other }
   }

   pub fn min(self, other: Self) -> Self {
      if self <= other { self } else { other }
   }

   /// The epoch `secs` seconds earlier.
   pub fn sub_secs(self, secs: f64) -> Self {
      Epoch(self.0 - secs)
   }

   /// Raw float bit pattern, for exact-equality collision sets.
   pub fn to_bits(self) -> u64 {
      self.0.to_bits()
   }
}

impl fmt::Display for Epoch {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      write!(f, "{}", self.0)
   }
}

impl Serialize for Epoch {
   fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
      serializer.serialize_f64(self.0)
   }
}

impl<'de> Deserialize<'de> for Epoch {
   fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
      struct EpochVisitor;

      impl de::Visitor<'_> for EpochVisitor {
         type Value = Epoch;

         fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str("a number or numeric string")
         }

         fn visit_f64<E: de::Error>(self, v: f64) -> Result<Epoch, E> {
            Ok(Epoch(v))
         }

         fn visit_u64<E: de::Error>(self, v: u64) -> Result<Epoch, E> {
            Ok(Epoch(v as f64))
         }

         fn visit_i64<E: de::Error>(self, v: i64) -> Result<Epoch, E> {
            Ok(Epoch(v as f64))
         }

         // Files written by older producers quote the epoch.
         fn visit_str<E: de::Error>(self, v: &str) -> Result<Epoch, E> {
            v.parse::<f64>()
               .map(Epoch)
               .map_err(|_| E::invalid_value(de::Unexpected::Str(v), &self))
         }
      }

      deserializer.deserialize_any(EpochVisitor)
   }
}

#[cfg(test)]
mod tests {
   use super::*;

   #[test]
   fn now_is_quantized() {
      let e = Epoch::now();
      assert!(e.is_quantized());
      assert!(e.as_secs() > 1.7e9);
   }

   #[test]
   fn increase_a_bit_steps_one_tick() {
      let e = Epoch::from_secs(1700000000.5);
      let next = e.increase_a_bit();
      assert!(next > e);
      assert!((next.as_secs() - e.as_secs() - 1e-5).abs() < 1e-9);
   }

   #[test]
   fn repeated_increments_stay_distinct() {
      let mut e = Epoch::now();
      let mut prev = e;
      for _ in 0..1000 {
         e = e.increase_a_bit();
         assert!(e > prev);
         assert!(e.is_quantized());
         prev = e;
      }
   }

   #[test]
   fn quantized_drops_sub_tick_precision() {
      let raw = Epoch::from_secs(1700000000.123456789);
      let q = raw.quantized();
      assert!(q.is_quantized());
      assert!((q.as_secs() - 1700000000.12346).abs() < 1e-9);
      assert!(!raw.is_quantized());
   }

   #[test]
   fn zero_is_sentinel() {
      assert!(Epoch::ZERO.is_zero());
      assert!(!Epoch::now().is_zero());
   }

   #[test]
   fn deserializes_numbers_and_strings() {
      let from_number: Epoch = serde_json::from_str("1700000000.98731").unwrap();
      let from_string: Epoch = serde_json::from_str("\"1700000000.98731\"").unwrap();
      assert_eq!(from_number, from_string);

      let from_int: Epoch = serde_json::from_str("1700000000").unwrap();
      assert_eq!(from_int.as_secs(), 1700000000.0);
   }

   #[test]
   fn serializes_with_five_fractional_digits() {
      let e = Epoch::from_secs(1700000000.0).increase_a_bit();
      let json = serde_json::to_string(&e).unwrap();
      assert_eq!(json, "1700000000.00001");
   }

   #[test]
   fn round_trip_preserves_equality() {
      let e = Epoch::now();
      let json = serde_json::to_string(&e).unwrap();
      let back: Epoch = serde_json::from_str(&json).unwrap();
      assert_eq!(e, back);
   }

   #[test]
   fn min_max_compare() {
      let a = Epoch::from_secs(10.0);
      let b = Epoch::from_secs(20.0);
      assert_eq!(a.max(b), b);
      assert_eq!(a.min(b), a);
      assert!(a < b && b > a && a <= a && b >= b);
   }
}
