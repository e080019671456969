//! Macros for defining typed ID types.

/// Macro to define a typed ID with a specific kind name.
///
/// This generates a newtype wrapper around a UUID with:
/// - A `KIND` constant used in error messages
/// - `new()` to generate a fresh random ID
/// - `parse()` to parse from string
/// - `compact()` to produce a short lower-case hex fragment
/// - `Display` and `FromStr` implementations
/// - `Serialize` and `Deserialize` implementations
/// - `Ord`, `Hash`, and other standard traits
///
/// # Example
///
/// ```ignore
/// define_id!(RunId, "run");
///
/// let run_id = RunId::new();
/// let parsed: RunId = "1f0c6a52-8d7e-4c1b-9a33-5e0b2f7c9d14".parse()?;
/// ```
#[macro_export]
macro_rules! define_id {
    ($name:ident, $kind:literal) => {
        /// A typed ID for this resource type.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
        pub struct $name($crate::Uuid);

        impl $name {
            /// The resource kind for this ID type.
            pub const KIND: &'static str = $kind;

            /// Creates a new ID with a fresh random UUID.
            #[must_use]
            pub fn new() -> Self {
                Self($crate::Uuid::new_v4())
            }

            /// Creates an ID from a raw UUID.
            #[must_use]
            pub const fn from_uuid(uuid: $crate::Uuid) -> Self {
                Self(uuid)
            }

            /// Returns the underlying UUID.
            #[must_use]
            pub const fn uuid(&self) -> $crate::Uuid {
                self.0
            }

            /// Parses an ID from a string.
            ///
            /// Accepts hyphenated, simple, braced, and URN UUID forms.
            pub fn parse(s: &str) -> Result<Self, $crate::IdError> {
                let trimmed = s.trim();
                if trimmed.is_empty() {
                    return Err($crate::IdError::Empty { kind: Self::KIND });
                }

                let uuid = $crate::Uuid::parse_str(trimmed).map_err(|e| {
                    $crate::IdError::InvalidUuid {
                        kind: Self::KIND,
                        input: trimmed.to_string(),
                        message: e.to_string(),
                    }
                })?;

                Ok(Self(uuid))
            }

            /// Returns the first `len` characters of the simple (unhyphenated)
            /// lower-case hex form.
            #[must_use]
            pub fn compact(&self, len: usize) -> String {
                $crate::compact(&self.0.simple().to_string(), len)
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0.hyphenated())
            }
        }

        impl std::str::FromStr for $name {
            type Err = $crate::IdError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Self::parse(s)
            }
        }

        impl From<$crate::Uuid> for $name {
            fn from(uuid: $crate::Uuid) -> Self {
                Self(uuid)
            }
        }

        impl From<$name> for $crate::Uuid {
            fn from(id: $name) -> Self {
                id.0
            }
        }

        impl serde::Serialize for $name {
            fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
            where
                S: serde::Serializer,
            {
                serializer.serialize_str(&self.to_string())
            }
        }

        impl<'de> serde::Deserialize<'de> for $name {
            fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
            where
                D: serde::Deserializer<'de>,
            {
                let s = String::deserialize(deserializer)?;
                Self::parse(&s).map_err(serde::de::Error::custom)
            }
        }

        impl AsRef<$crate::Uuid> for $name {
            fn as_ref(&self) -> &$crate::Uuid {
                &self.0
            }
        }
    };
}
