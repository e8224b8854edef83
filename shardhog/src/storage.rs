//! Storage-class coercion between caller values and persisted payloads.

use std::fmt;
use std::sync::Arc;

use bytes::Bytes;

use crate::context::Registry;
use crate::Error;

/// How a context stores its value columns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageClass {
    Null,
    Int,
    Str,
    Utf8,
    Serial,
}

/// A caller-facing value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Int(i64),
    Str(Bytes),
    Utf8(String),
    Serial(serde_json::Value),
}

/// The persisted form of a value: what actually lands in the row.
#[derive(Debug, Clone, PartialEq)]
pub enum Stored {
    Null,
    Int(i64),
    Bytes(Bytes),
}

/// Optional validation/transformation layer for SERIAL contexts.
///
/// `transform` runs before encoding on the way in; `reverse` runs
/// after decoding on the way out.
pub trait SerialSchema: fmt::Debug + Send + Sync {
    fn transform(&self, value: &serde_json::Value) -> Result<serde_json::Value, String>;
    fn reverse(&self, value: serde_json::Value) -> serde_json::Value;
}

/// Enforce the storage class of `ctx` on a caller value.
pub fn storage_wrap(registry: &Registry, ctx: i32, value: &Value) -> Result<Stored, Error> {
    let class = registry.storage(ctx).ok_or(Error::BadContext(ctx))?;

    match (class, value) {
        (StorageClass::Null, Value::Null) => Ok(Stored::Null),
        (StorageClass::Null, _) => Err(Error::StorageClass("NULL storage requires null".into())),

        (StorageClass::Int, Value::Int(int)) => Ok(Stored::Int(*int)),
        (StorageClass::Int, _) => Err(Error::StorageClass("INT storage requires an integer".into())),

        (StorageClass::Str, Value::Str(bytes)) => Ok(Stored::Bytes(bytes.clone())),
        (StorageClass::Str, _) => {
            Err(Error::StorageClass("STR storage requires a byte string".into()))
        }

        (StorageClass::Utf8, Value::Utf8(text)) => {
            Ok(Stored::Bytes(Bytes::from(text.clone().into_bytes())))
        }
        (StorageClass::Utf8, _) => Err(Error::StorageClass("UTF8 storage requires text".into())),

        (StorageClass::Serial, Value::Serial(json)) => {
            serial_encode(registry.schema(ctx), json).map(|bytes| Stored::Bytes(Bytes::from(bytes)))
        }
        (StorageClass::Serial, _) => Err(Error::StorageClass(
            "SERIAL storage requires a serializable value".into(),
        )),
    }
}

/// Inverse of [`storage_wrap`].
pub fn storage_unwrap(registry: &Registry, ctx: i32, stored: &Stored) -> Result<Value, Error> {
    let class = registry.storage(ctx).ok_or(Error::BadContext(ctx))?;

    match (class, stored) {
        (StorageClass::Null, Stored::Null) => Ok(Value::Null),

        (StorageClass::Int, Stored::Int(int)) => Ok(Value::Int(*int)),

        (StorageClass::Str, Stored::Bytes(bytes)) => Ok(Value::Str(bytes.clone())),

        (StorageClass::Utf8, Stored::Bytes(bytes)) => String::from_utf8(bytes.to_vec())
            .map(Value::Utf8)
            .map_err(|_| Error::StorageClass("stored value is not valid UTF-8".into())),

        (StorageClass::Serial, Stored::Bytes(bytes)) => {
            serial_decode(registry.schema(ctx), bytes).map(Value::Serial)
        }

        (class, stored) => Err(Error::StorageClass(format!(
            "stored value {:?} doesn't match storage class {:?}",
            stored, class
        ))),
    }
}

fn serial_encode(
    schema: Option<&Arc<dyn SerialSchema>>,
    json: &serde_json::Value,
) -> Result<Vec<u8>, Error> {
    let transformed = match schema {
        Some(schema) => schema
            .transform(json)
            .map_err(|err| Error::StorageClass(format!("schema validation failed: {}", err)))?,
        None => json.clone(),
    };

    rmp_serde::to_vec(&transformed)
        .map_err(|err| Error::StorageClass(format!("serial encode failed: {}", err)))
}

fn serial_decode(
    schema: Option<&Arc<dyn SerialSchema>>,
    bytes: &Bytes,
) -> Result<serde_json::Value, Error> {
    let decoded: serde_json::Value = rmp_serde::from_slice(bytes)
        .map_err(|err| Error::StorageClass(format!("serial decode failed: {}", err)))?;

    Ok(match schema {
        Some(schema) => schema.reverse(decoded),
        None => decoded,
    })
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::context::ContextMeta;
    use serde_json::json;

    fn registry_with(ctx: i32, storage: StorageClass) -> Registry {
        let mut registry = Registry::new();
        registry
            .set_context(
                ctx,
                ContextMeta::Node {
                    base_ctx: None,
                    storage,
                    schema: None,
                },
            )
            .unwrap();
        registry
    }

    #[test]
    fn test_round_trip_all_classes() {
        let cases = [
            (StorageClass::Null, Value::Null),
            (StorageClass::Int, Value::Int(-42)),
            (StorageClass::Str, Value::Str(Bytes::from_static(b"\x00\xff"))),
            (StorageClass::Utf8, Value::Utf8("héllo".into())),
            (
                StorageClass::Serial,
                Value::Serial(json!({"a": [1, 2, 3], "b": "c"})),
            ),
        ];

        for (class, value) in cases {
            let registry = registry_with(1, class);
            let stored = storage_wrap(&registry, 1, &value).unwrap();
            let back = storage_unwrap(&registry, 1, &stored).unwrap();
            assert_eq!(back, value, "{:?}", class);
        }
    }

    #[test]
    fn test_class_mismatch() {
        let registry = registry_with(1, StorageClass::Int);
        let err = storage_wrap(&registry, 1, &Value::Utf8("nope".into()));
        assert!(matches!(err, Err(Error::StorageClass(_))));
    }

    #[test]
    fn test_schema_transform() {
        #[derive(Debug)]
        struct Doubler;

        impl SerialSchema for Doubler {
            fn transform(&self, value: &serde_json::Value) -> Result<serde_json::Value, String> {
                let int = value.as_i64().ok_or("expected an integer")?;
                Ok(json!(int * 2))
            }

            fn reverse(&self, value: serde_json::Value) -> serde_json::Value {
                json!(value.as_i64().unwrap() / 2)
            }
        }

        let mut registry = Registry::new();
        registry
            .set_context(
                1,
                ContextMeta::Node {
                    base_ctx: None,
                    storage: StorageClass::Serial,
                    schema: Some(Arc::new(Doubler)),
                },
            )
            .unwrap();

        let stored = storage_wrap(&registry, 1, &Value::Serial(json!(21))).unwrap();
        let back = storage_unwrap(&registry, 1, &stored).unwrap();
        assert_eq!(back, Value::Serial(json!(21)));

        let err = storage_wrap(&registry, 1, &Value::Serial(json!("nope")));
        assert!(matches!(err, Err(Error::StorageClass(_))));
    }
}
