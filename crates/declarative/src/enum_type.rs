//! Declarative enumerations stored as string columns.
//!
//! ```ignore
//! declarative_enum! {
//!     pub enum OrderStatus {
//!         Pending = ("p", "Pending"),
//!         Shipped = ("s", "Shipped"),
//!     }
//! }
//!
//! let status = OrderStatus::from_string("s")?;
//! assert_eq!(status.description(), "Shipped");
//! let column = Column::new("status", OrderStatus::db_type());
//! ```

use serde_json::{json, Value as JsonValue};

use crate::error::{ModelError, ModelResult};
use crate::schema::{ColumnType, EnumColumnType};

/// A fixed set of symbols, each with a stored value and a description.
pub trait DeclarativeEnum: Copy + Sized + 'static {
    /// Type name used in errors and the check constraint name
    const TYPE_NAME: &'static str;

    /// Every symbol in declaration order.
    fn symbols() -> &'static [Self];

    /// Symbol name as declared.
    fn name(&self) -> &'static str;

    /// Value stored in the database.
    fn value(&self) -> &'static str;

    fn description(&self) -> &'static str;

    /// Look up a symbol by stored value. Surrounding whitespace is ignored.
    fn from_string(value: &str) -> ModelResult<Self> {
        let needle = value.trim();
        Self::symbols()
            .iter()
            .copied()
            .find(|symbol| symbol.value() == needle)
            .ok_or_else(|| ModelError::InvalidEnumValue {
                enum_name: Self::TYPE_NAME.to_string(),
                value: value.to_string(),
            })
    }

    fn values() -> Vec<&'static str> {
        Self::symbols().iter().map(|symbol| symbol.value()).collect()
    }

    fn iter() -> std::iter::Copied<std::slice::Iter<'static, Self>> {
        Self::symbols().iter().copied()
    }

    fn to_dict(&self) -> JsonValue {
        json!({"value": self.value(), "description": self.description()})
    }

    /// Column type storing this enum.
    fn db_type() -> ColumnType {
        ColumnType::Enum(EnumColumnType::new(Self::TYPE_NAME, Self::values()))
    }
}

/// Define a [`DeclarativeEnum`].
///
/// Each variant is given as `Name = ("stored value", "description")`. The
/// generated type serializes as its stored value and converts into a
/// [`DatabaseValue`](crate::value::DatabaseValue).
#[macro_export]
macro_rules! declarative_enum {
    (
        $(#[$meta:meta])*
        $vis:vis enum $name:ident {
            $($variant:ident = ($value:expr, $description:expr)),+ $(,)?
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        $vis enum $name {
            $($variant),+
        }

        impl $crate::enum_type::DeclarativeEnum for $name {
            const TYPE_NAME: &'static str = stringify!($name);

            fn symbols() -> &'static [Self] {
                &[$($name::$variant),+]
            }

            fn name(&self) -> &'static str {
                match self {
                    $($name::$variant => stringify!($variant)),+
                }
            }

            fn value(&self) -> &'static str {
                match self {
                    $($name::$variant => $value),+
                }
            }

            fn description(&self) -> &'static str {
                match self {
                    $($name::$variant => $description),+
                }
            }
        }

        impl ::std::fmt::Display for $name {
            fn fmt(&self, f: &mut ::std::fmt::Formatter<'_>) -> ::std::fmt::Result {
                f.write_str($crate::enum_type::DeclarativeEnum::name(self))
            }
        }

        impl $crate::__private::serde::Serialize for $name {
            fn serialize<S: $crate::__private::serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
                serializer.serialize_str($crate::enum_type::DeclarativeEnum::value(self))
            }
        }

        impl<'de> $crate::__private::serde::Deserialize<'de> for $name {
            fn deserialize<D: $crate::__private::serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
                let raw = <String as $crate::__private::serde::Deserialize>::deserialize(deserializer)?;
                <$name as $crate::enum_type::DeclarativeEnum>::from_string(&raw)
                    .map_err($crate::__private::serde::de::Error::custom)
            }
        }

        impl From<$name> for $crate::value::DatabaseValue {
            fn from(symbol: $name) -> Self {
                $crate::value::DatabaseValue::String(
                    $crate::enum_type::DeclarativeEnum::value(&symbol).to_string(),
                )
            }
        }
    };
}
