//! # Typed Identifiers
//!
//! Zero-cost `u64` wrappers for the identifiers that cross component and
//! persistence boundaries. Distinct types keep an instance id from ever being
//! passed where a position id is expected.
//!
//! ```rust
//! use types::{InstanceId, PositionId};
//!
//! let instance = InstanceId::new(7);
//! let position = PositionId::generate();
//!
//! fn archive(instance: InstanceId, position: PositionId) { /* ... */ }
//! archive(instance, position); // ✅ Correct
//! // archive(position, instance); // ❌ Compile error!
//! ```

/// Macro for generating zero-cost typed ID wrappers
///
/// Creates a new type that wraps `u64` with complete type safety while maintaining
/// identical runtime performance and memory layout.
#[macro_export]
macro_rules! define_typed_id {
    (
        $(#[$meta:meta])*
        $name:ident
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
        #[repr(transparent)]
        pub struct $name(pub u64);

        impl $name {
            /// Create a new typed ID
            #[inline(always)]
            pub const fn new(id: u64) -> Self {
                Self(id)
            }

            /// Create a new typed ID, rejecting the null value
            #[inline]
            pub fn new_validated(id: u64) -> Result<Self, $crate::errors::ValidationError> {
                if id == 0 {
                    return Err($crate::errors::ValidationError::NullId);
                }
                Ok(Self(id))
            }

            /// Generate a random, non-null ID
            pub fn generate() -> Self {
                loop {
                    let id = uuid::Uuid::new_v4().as_u128() as u64;
                    if id != 0 {
                        return Self(id);
                    }
                }
            }

            /// Extract the inner u64 value
            #[inline(always)]
            pub const fn inner(&self) -> u64 {
                self.0
            }

            /// Check if this is a null/zero ID
            #[inline(always)]
            pub fn is_null(&self) -> bool {
                self.0 == 0
            }

            /// Create a null/zero ID
            #[inline(always)]
            pub const fn null() -> Self {
                Self(0)
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}({})", stringify!($name), self.0)
            }
        }

        impl From<u64> for $name {
            #[inline(always)]
            fn from(id: u64) -> Self {
                Self(id)
            }
        }

        impl From<$name> for u64 {
            #[inline(always)]
            fn from(id: $name) -> u64 {
                id.0
            }
        }

        // Serializes as raw u64
        impl serde::Serialize for $name {
            fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
            where
                S: serde::Serializer,
            {
                self.0.serialize(serializer)
            }
        }

        impl<'de> serde::Deserialize<'de> for $name {
            fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
            where
                D: serde::Deserializer<'de>,
            {
                u64::deserialize(deserializer).map(Self)
            }
        }
    };
}

define_typed_id!(
    /// Unique identifier for a strategy instance
    InstanceId
);

define_typed_id!(
    /// Unique identifier for a position
    PositionId
);

define_typed_id!(
    /// Unique identifier for a trading signal
    SignalId
);

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::ValidationError;

    #[test]
    fn test_typed_id_display_and_conversion() {
        let id = InstanceId::new(42);
        assert_eq!(id.to_string(), "InstanceId(42)");
        assert_eq!(u64::from(id), 42);
        assert_eq!(InstanceId::from(42u64), id);
    }

    #[test]
    fn test_validated_rejects_null() {
        assert_eq!(PositionId::new_validated(0), Err(ValidationError::NullId));
        assert!(PositionId::new_validated(5).is_ok());
    }

    #[test]
    fn test_generated_ids_are_distinct_and_non_null() {
        let a = SignalId::generate();
        let b = SignalId::generate();
        assert!(!a.is_null());
        assert_ne!(a, b);
    }

    #[test]
    fn test_serializes_as_raw_u64() {
        let json = serde_json::to_string(&PositionId::new(9)).unwrap();
        assert_eq!(json, "9");
        let back: PositionId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, PositionId::new(9));
    }
}
