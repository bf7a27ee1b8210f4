//! DeviceId - Cheap-to-clone device identifier
//!
//! Uses Arc<str> internally so the local sink can key sessions by it and
//! hand copies to log fields without reallocating.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::borrow::Borrow;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::ops::Deref;
use std::sync::Arc;

/// Identifier substituted for frames that arrive without a device id.
pub const ZERO_DEVICE_ID: &str = "000000000000";

/// Hex device identifier with cheap cloning.
///
/// # Examples
/// ```
/// use contracts::DeviceId;
///
/// let id: DeviceId = "a4c138f0e2b1".into();
/// assert_eq!(id.as_str(), "a4c138f0e2b1");
/// assert_eq!(DeviceId::from("  ").normalized(), "000000000000");
/// ```
#[derive(Clone, Default)]
pub struct DeviceId(Arc<str>);

impl DeviceId {
    /// Create a new DeviceId from a string slice.
    #[inline]
    pub fn new(s: &str) -> Self {
        Self(Arc::from(s))
    }

    /// The canonical all-zero identifier.
    pub fn zero() -> Self {
        Self::new(ZERO_DEVICE_ID)
    }

    /// Get the underlying string slice.
    #[inline]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns `true` when the id carries no usable characters.
    pub fn is_blank(&self) -> bool {
        self.0.trim().is_empty()
    }

    /// Never-empty form of this id; blank ids become [`ZERO_DEVICE_ID`].
    pub fn normalized(&self) -> Self {
        if self.is_blank() {
            Self::zero()
        } else {
            self.clone()
        }
    }
}

impl Deref for DeviceId {
    type Target = str;

    #[inline]
    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl AsRef<str> for DeviceId {
    #[inline]
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl Borrow<str> for DeviceId {
    #[inline]
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl From<&str> for DeviceId {
    #[inline]
    fn from(s: &str) -> Self {
        Self(Arc::from(s))
    }
}

impl From<String> for DeviceId {
    #[inline]
    fn from(s: String) -> Self {
        Self(Arc::from(s))
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Debug for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DeviceId({:?})", self.0)
    }
}

impl PartialEq for DeviceId {
    #[inline]
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0) || self.0 == other.0
    }
}

impl Eq for DeviceId {}

impl PartialEq<str> for DeviceId {
    #[inline]
    fn eq(&self, other: &str) -> bool {
        self.0.as_ref() == other
    }
}

impl PartialEq<&str> for DeviceId {
    #[inline]
    fn eq(&self, other: &&str) -> bool {
        self.0.as_ref() == *other
    }
}

// Same as str hash so maps keyed by DeviceId can be queried with &str
impl Hash for DeviceId {
    #[inline]
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.0.hash(state)
    }
}

impl Serialize for DeviceId {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for DeviceId {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Ok(Self::from(s))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_blank_ids_normalize_to_zero() {
        assert_eq!(DeviceId::from("").normalized(), ZERO_DEVICE_ID);
        assert_eq!(DeviceId::from(" \t").normalized(), ZERO_DEVICE_ID);
        assert_eq!(DeviceId::from("0a1b").normalized(), "0a1b");
    }

    #[test]
    fn test_normalized_shares_allocation() {
        let id: DeviceId = "c0ffee".into();
        let norm = id.normalized();
        assert_eq!(id.as_str().as_ptr(), norm.as_str().as_ptr());
    }

    #[test]
    fn test_hashmap_key() {
        let mut map: HashMap<DeviceId, i32> = HashMap::new();
        map.insert("dev1".into(), 1);
        assert_eq!(map.get("dev1"), Some(&1));
        assert_eq!(map.get("dev2"), None);
    }
}
