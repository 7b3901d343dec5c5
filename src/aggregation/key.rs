//! Composite keys for bucket deduplication and series grouping.
//!
//! A key is an ordered tuple of heterogeneous parts with structural
//! equality: two keys match iff they have the same length and every part
//! matches pairwise. Numeric parts compare and hash by bit pattern, which
//! is exact for the already-smoothed values that end up in keys.

use std::fmt;

/// One element of a composite key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum KeyPart {
    /// A string label (event name, user id, `field:value` group label).
    Label(String),
    /// A smoothed numeric value, stored as bits so the part is `Eq + Hash`.
    Num(FloatBits),
    /// A boolean flag (debug device).
    Flag(bool),
}

impl KeyPart {
    pub fn label(s: impl Into<String>) -> Self {
        KeyPart::Label(s.into())
    }

    pub fn num(v: f32) -> Self {
        KeyPart::Num(FloatBits::from(v))
    }
}

/// An `f32` wrapped for structural equality. `-0.0` is normalized to `0.0`
/// so smoothing output that straddles zero still collapses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FloatBits(u32);

impl From<f32> for FloatBits {
    fn from(v: f32) -> Self {
        let v = if v == 0.0 { 0.0 } else { v };
        FloatBits(v.to_bits())
    }
}

impl FloatBits {
    pub fn value(self) -> f32 {
        f32::from_bits(self.0)
    }
}

/// An ordered tuple of key parts, usable as a hash-map key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CompositeKey(Vec<KeyPart>);

impl CompositeKey {
    pub fn new(parts: Vec<KeyPart>) -> Self {
        CompositeKey(parts)
    }
}

/// Group keys render as `~`-joined labels, e.g. `PlayerPosition~user:abc`.
impl fmt::Display for CompositeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, part) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, "~")?;
            }
            match part {
                KeyPart::Label(s) => write!(f, "{}", s)?,
                KeyPart::Num(bits) => write!(f, "{}", bits.value())?,
                KeyPart::Flag(b) => write!(f, "{}", b)?,
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_structural_equality() {
        let a = CompositeKey::new(vec![KeyPart::label("PlayerPosition"), KeyPart::num(1.0)]);
        let b = CompositeKey::new(vec![KeyPart::label("PlayerPosition"), KeyPart::num(1.0)]);
        assert_eq!(a, b);
    }

    #[test]
    fn test_order_sensitive() {
        let a = CompositeKey::new(vec![KeyPart::num(1.0), KeyPart::num(2.0)]);
        let b = CompositeKey::new(vec![KeyPart::num(2.0), KeyPart::num(1.0)]);
        assert_ne!(a, b);
    }

    #[test]
    fn test_length_sensitive() {
        let a = CompositeKey::new(vec![KeyPart::num(1.0)]);
        let b = CompositeKey::new(vec![KeyPart::num(1.0), KeyPart::num(0.0)]);
        assert_ne!(a, b);
    }

    #[test]
    fn test_negative_zero_collapses() {
        let a = CompositeKey::new(vec![KeyPart::num(0.0)]);
        let b = CompositeKey::new(vec![KeyPart::num(-0.0)]);
        assert_eq!(a, b);
    }

    #[test]
    fn test_usable_as_map_key() {
        let mut map = HashMap::new();
        let key = CompositeKey::new(vec![KeyPart::label("e"), KeyPart::num(3.5)]);
        map.insert(key.clone(), 1);
        *map.get_mut(&key).unwrap() += 1;
        assert_eq!(map[&key], 2);
        assert_eq!(map.len(), 1);
    }

    #[test]
    fn test_display_joins_with_tilde() {
        let key = CompositeKey::new(vec![
            KeyPart::label("PlayerPosition"),
            KeyPart::label("user:abc"),
        ]);
        assert_eq!(key.to_string(), "PlayerPosition~user:abc");
    }
}
