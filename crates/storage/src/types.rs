//! Common types used across storage operations.

use bytes::Bytes;

/// Key-value pair returned from prefix scans.
///
/// # Examples
///
/// ```
/// use bytes::Bytes;
/// use signet_storage::KeyValue;
///
/// let kv = KeyValue::new(Bytes::from("keyusage/1/ab12"), Bytes::from(r#"{"count":3}"#));
/// assert_eq!(kv.key, Bytes::from("keyusage/1/ab12"));
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyValue {
    /// The key identifying this entry.
    pub key: Bytes,

    /// The value stored at this key.
    pub value: Bytes,
}

impl KeyValue {
    /// Creates a new key-value pair.
    pub fn new(key: Bytes, value: Bytes) -> Self {
        Self { key, value }
    }
}

/// Macro to define a newtype wrapper around `i64` with standard trait
/// implementations.
///
/// Each generated type:
/// - Is a transparent wrapper around `i64` (zero runtime cost)
/// - Derives `Copy`, `Clone`, `Debug`, `PartialEq`, `Eq`, `Hash`, `PartialOrd`, `Ord`
/// - Derives `Serialize` and `Deserialize` (transparent)
/// - Implements `From<i64>` and `Into<i64>`
/// - Implements `Display` that outputs the inner value
macro_rules! define_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(
            Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord,
            serde::Serialize, serde::Deserialize,
        )]
        #[serde(transparent)]
        pub struct $name(pub i64);

        impl From<i64> for $name {
            fn from(value: i64) -> Self {
                Self(value)
            }
        }

        impl From<$name> for i64 {
            fn from(id: $name) -> Self {
                id.0
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

define_id!(
    /// Stable numeric identity of a configured worker.
    ///
    /// Owned by the worker configuration. Every per-worker resource (crypto
    /// token state, cached activation secret, key usage counter) is keyed by
    /// this id.
    ///
    /// # Examples
    ///
    /// ```
    /// use signet_storage::WorkerId;
    ///
    /// let worker = WorkerId::from(5802);
    /// assert_eq!(i64::from(worker), 5802);
    /// assert_eq!(worker.to_string(), "5802");
    /// ```
    WorkerId
);
