//! Macros for defining integer-coded wire enums.

/// Define an enum that travels as an integer code on the wire.
///
/// This generates:
/// - The listed variants plus `Unrecognized(i32)` for codes this build does not know
/// - `code()`, `from_code()`, `as_str()` and `from_name()`
/// - `Default` (the variant with code 0) and `Display` (the upper-case name)
/// - `Serialize` as the integer code, `Deserialize` from either the code or the name
///
/// # Example
///
/// ```ignore
/// wire_enum! {
///     /// Change kind.
///     ChangeType {
///         None = 0 => "NONE",
///         Set = 1 => "SET",
///     }
/// }
/// ```
macro_rules! wire_enum {
    (
        $(#[$meta:meta])*
        $name:ident {
            $( $(#[$vmeta:meta])* $variant:ident = $code:literal => $label:literal ),+ $(,)?
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
        pub enum $name {
            $( $(#[$vmeta])* $variant, )+
            /// A code not known to this build.
            Unrecognized(i32),
        }

        impl $name {
            /// The integer code used on the wire.
            #[must_use]
            pub const fn code(self) -> i32 {
                match self {
                    $( Self::$variant => $code, )+
                    Self::Unrecognized(code) => code,
                }
            }

            /// Map a wire code to a variant.
            #[must_use]
            pub const fn from_code(code: i32) -> Self {
                match code {
                    $( $code => Self::$variant, )+
                    other => Self::Unrecognized(other),
                }
            }

            /// The scheduler's upper-case name for this value.
            #[must_use]
            pub const fn as_str(self) -> &'static str {
                match self {
                    $( Self::$variant => $label, )+
                    Self::Unrecognized(_) => "UNRECOGNIZED",
                }
            }

            /// Look a variant up by its upper-case name.
            pub fn from_name(name: &str) -> Option<Self> {
                match name {
                    $( $label => Some(Self::$variant), )+
                    _ => None,
                }
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::from_code(0)
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                match self {
                    Self::Unrecognized(code) => write!(f, "UNRECOGNIZED({code})"),
                    other => f.write_str(other.as_str()),
                }
            }
        }

        impl serde::Serialize for $name {
            fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
                serializer.serialize_i32(self.code())
            }
        }

        impl<'de> serde::Deserialize<'de> for $name {
            fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
                match <crate::event::WireCode as serde::Deserialize>::deserialize(deserializer)? {
                    crate::event::WireCode::Code(code) => Ok(Self::from_code(code)),
                    crate::event::WireCode::Name(name) => Self::from_name(&name).ok_or_else(|| {
                        serde::de::Error::custom(format!(
                            "unknown {} name: {name}",
                            stringify!($name)
                        ))
                    }),
                }
            }
        }
    };
}
