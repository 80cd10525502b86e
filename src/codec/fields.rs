//! Positional field access for described-list composites.
//!
//! Every AMQP composite is a described list whose trailing null fields may be
//! omitted. [`FieldReader`] walks the list in index order so that the first
//! mandatory field found missing is the one reported.

use bytes::Bytes;

use super::{
    definitions::canonical_code,
    error::DecodeError,
    value::{Symbol, Value},
};

/// Annotations and properties maps keyed by symbol.
pub type Fields = Vec<(Symbol, Value)>;

/// Conversion from a decoded [`Value`] into a typed field.
pub(crate) trait FromValue: Sized {
    /// Convert `value`, naming `field` of `composite` in any error.
    fn from_value(
        value: Value,
        field: &'static str,
        composite: &'static str,
    ) -> Result<Self, DecodeError>;
}

macro_rules! from_value_variant {
    ($ty:ty, $($variant:ident),+) => {
        impl FromValue for $ty {
            fn from_value(
                value: Value,
                field: &'static str,
                composite: &'static str,
            ) -> Result<Self, DecodeError> {
                match value {
                    $(Value::$variant(v) => Ok(v.into()),)+
                    _ => Err(DecodeError::invalid_type(field, composite)),
                }
            }
        }
    };
}

from_value_variant!(bool, Bool);
from_value_variant!(u8, Ubyte);
from_value_variant!(u16, Ushort);
from_value_variant!(u32, Uint);
from_value_variant!(u64, Ulong);
from_value_variant!(String, String);
from_value_variant!(Symbol, Symbol);
from_value_variant!(Bytes, Binary);

impl FromValue for Value {
    fn from_value(value: Value, _: &'static str, _: &'static str) -> Result<Self, DecodeError> {
        Ok(value)
    }
}

/// `multiple` symbol fields may arrive as a single symbol or as an array.
impl FromValue for Vec<Symbol> {
    fn from_value(
        value: Value,
        field: &'static str,
        composite: &'static str,
    ) -> Result<Self, DecodeError> {
        match value {
            Value::Symbol(symbol) => Ok(vec![symbol]),
            Value::Array(items) | Value::List(items) => items
                .into_iter()
                .map(|item| Symbol::from_value(item, field, composite))
                .collect(),
            _ => Err(DecodeError::invalid_type(field, composite)),
        }
    }
}

impl FromValue for Fields {
    fn from_value(
        value: Value,
        field: &'static str,
        composite: &'static str,
    ) -> Result<Self, DecodeError> {
        let Value::Map(entries) = value else {
            return Err(DecodeError::invalid_type(field, composite));
        };
        entries
            .into_iter()
            .map(|(key, val)| Ok((Symbol::from_value(key, field, composite)?, val)))
            .collect()
    }
}

/// Reads composite fields by position.
pub(crate) struct FieldReader {
    composite: &'static str,
    fields: std::vec::IntoIter<Value>,
}

impl FieldReader {
    /// Start reading the fields of `composite`.
    pub(crate) fn new(composite: &'static str, fields: Vec<Value>) -> Self {
        Self {
            composite,
            fields: fields.into_iter(),
        }
    }

    /// Unwrap a described list carrying one of the accepted descriptors.
    pub(crate) fn described(
        composite: &'static str,
        code: u64,
        value: Value,
    ) -> Result<Self, DecodeError> {
        let Value::Described(descriptor, body) = value else {
            return Err(DecodeError::NotAComposite(composite));
        };
        if canonical_code(&descriptor) != Some(code) {
            return Err(DecodeError::UnknownDescriptor(descriptor.to_string()));
        }
        match *body {
            Value::List(fields) => Ok(Self::new(composite, fields)),
            _ => Err(DecodeError::NotAComposite(composite)),
        }
    }

    /// Next field, treating omission and null alike.
    fn advance(&mut self) -> Option<Value> { self.fields.next().filter(|v| !v.is_null()) }

    /// Read a mandatory field.
    pub(crate) fn required<T: FromValue>(&mut self, field: &'static str) -> Result<T, DecodeError> {
        let value = self
            .advance()
            .ok_or(DecodeError::missing(field, self.composite))?;
        T::from_value(value, field, self.composite)
    }

    /// Read an optional field.
    pub(crate) fn optional<T: FromValue>(
        &mut self,
        field: &'static str,
    ) -> Result<Option<T>, DecodeError> {
        self.advance()
            .map(|value| T::from_value(value, field, self.composite))
            .transpose()
    }

    /// Read an optional field, falling back to the type's default.
    pub(crate) fn or_default<T: FromValue + Default>(
        &mut self,
        field: &'static str,
    ) -> Result<T, DecodeError> {
        Ok(self.optional(field)?.unwrap_or_default())
    }
}

/// Builds the field list of a composite, dropping trailing nulls on finish.
#[derive(Default)]
pub(crate) struct ListBuilder(Vec<Value>);

impl ListBuilder {
    pub(crate) fn new() -> Self { Self::default() }

    /// Append a field.
    pub(crate) fn push(mut self, value: impl Into<Value>) -> Self {
        self.0.push(value.into());
        self
    }

    /// Append an optional field; `None` becomes null.
    pub(crate) fn opt(self, value: Option<impl Into<Value>>) -> Self {
        self.push(value.map_or(Value::Null, Into::into))
    }

    /// Wrap the fields in a described list.
    pub(crate) fn describe(mut self, code: u64) -> Value {
        while self.0.last().is_some_and(Value::is_null) {
            self.0.pop();
        }
        Value::described(code, Value::List(self.0))
    }
}

macro_rules! into_value {
    ($ty:ty, $variant:ident) => {
        impl From<$ty> for Value {
            fn from(value: $ty) -> Self { Self::$variant(value) }
        }
    };
}

into_value!(bool, Bool);
into_value!(u8, Ubyte);
into_value!(u16, Ushort);
into_value!(u32, Uint);
into_value!(u64, Ulong);
into_value!(String, String);
into_value!(Symbol, Symbol);
into_value!(Bytes, Binary);

impl From<&str> for Value {
    fn from(value: &str) -> Self { Self::String(value.to_owned()) }
}

impl From<Vec<Symbol>> for Value {
    fn from(value: Vec<Symbol>) -> Self {
        Self::Array(value.into_iter().map(Self::Symbol).collect())
    }
}

impl From<Fields> for Value {
    fn from(value: Fields) -> Self {
        Self::Map(
            value
                .into_iter()
                .map(|(key, val)| (Self::Symbol(key), val))
                .collect(),
        )
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[test]
    fn first_missing_mandatory_field_is_reported() {
        let mut reader = FieldReader::new("Begin", vec![Value::Null, Value::Uint(1)]);
        let _: Option<u16> = reader.optional("remote-channel").ok().flatten();
        let present = reader.required::<u32>("next-outgoing-id").err();
        assert!(present.is_none());
        let missing = reader.required::<u32>("incoming-window").err();
        assert_eq!(
            missing.map(|e| e.to_string()).as_deref(),
            Some("The incoming-window field cannot be omitted from the Begin")
        );
    }

    #[test]
    fn explicit_null_counts_as_missing() {
        let mut reader = FieldReader::new("Open", vec![Value::Null]);
        assert_eq!(
            reader.required::<String>("container-id"),
            Err(DecodeError::missing("container-id", "Open"))
        );
    }

    #[rstest]
    #[case(Value::Uint(70_000), Some(70_000))]
    #[case(Value::Ushort(300), None)]
    #[case(Value::Ubyte(3), None)]
    #[case(Value::Ulong(3), None)]
    #[case(Value::String("x".to_owned()), None)]
    fn uint_fields_take_only_uint(#[case] value: Value, #[case] expected: Option<u32>) {
        assert_eq!(u32::from_value(value, "f", "C").ok(), expected);
    }

    #[test]
    fn narrower_code_for_a_uint_field_is_a_type_error() {
        let mut reader = FieldReader::new("Attach", vec![Value::Ushort(1)]);
        assert_eq!(
            reader.required::<u32>("handle"),
            Err(DecodeError::invalid_type("handle", "Attach"))
        );
    }

    #[test]
    fn single_symbol_is_accepted_as_multiple() {
        let symbols = Vec::<Symbol>::from_value(Value::Symbol(Symbol::from("a")), "f", "C");
        assert_eq!(symbols, Ok(vec![Symbol::from("a")]));
    }

    #[test]
    fn builder_drops_trailing_nulls() {
        let value = ListBuilder::new()
            .push("id")
            .opt(None::<u32>)
            .opt(None::<u32>)
            .describe(0x10);
        assert_eq!(
            value,
            Value::described(0x10, Value::List(vec![Value::String("id".to_owned())]))
        );
    }
}
