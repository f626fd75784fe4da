//! Schema validation: decide whether a coerced JSON value is an invoice.
//!
//! The schema is a set of static tables that mirror the JSON shape shown to
//! the model in [`crate::prompts`]; the two must change together.
//!
//! Validation never stops at the first problem: the whole value is walked
//! and every broken rule is returned as a [`Violation`].

use crate::error::InvoiceError;
use crate::output::InvoiceRecord;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

// ── Schema vocabulary ────────────────────────────────────────────────────────

/// JSON value categories used by the schema tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JsonType {
    Null,
    Boolean,
    Number,
    String,
    Array,
    Object,
}

impl JsonType {
    pub fn of(value: &Value) -> Self {
        match value {
            Value::Null => JsonType::Null,
            Value::Bool(_) => JsonType::Boolean,
            Value::Number(_) => JsonType::Number,
            Value::String(_) => JsonType::String,
            Value::Array(_) => JsonType::Array,
            Value::Object(_) => JsonType::Object,
        }
    }
}

impl fmt::Display for JsonType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            JsonType::Null => "null",
            JsonType::Boolean => "boolean",
            JsonType::Number => "number",
            JsonType::String => "string",
            JsonType::Array => "array",
            JsonType::Object => "object",
        };
        f.write_str(s)
    }
}

/// String formats checked on top of the type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Format {
    /// `YYYY-MM-DD`
    IsoDate,
}

impl Format {
    fn matches(self, s: &str) -> bool {
        match self {
            Format::IsoDate => is_iso_date(s),
        }
    }
}

impl fmt::Display for Format {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Format::IsoDate => f.write_str("YYYY-MM-DD date"),
        }
    }
}

/// A real calendar date written as zero-padded `YYYY-MM-DD`.
fn is_iso_date(s: &str) -> bool {
    let b = s.as_bytes();
    // chrono accepts unpadded fields and longer years; the layout is fixed here.
    b.len() == 10
        && b[4] == b'-'
        && b[7] == b'-'
        && b.iter().enumerate().all(|(i, c)| i == 4 || i == 7 || c.is_ascii_digit())
        && NaiveDate::parse_from_str(s, "%Y-%m-%d").is_ok()
}

/// What a field's value must look like.
#[derive(Debug)]
pub enum Shape {
    /// A leaf value of one of the listed types.
    Scalar(&'static [JsonType]),
    /// A nested object validated against its own table.
    Object(&'static ObjectSchema),
    /// An array (possibly empty) whose every element is an object.
    ArrayOf(&'static ObjectSchema),
}

#[derive(Debug)]
pub struct FieldSchema {
    pub name: &'static str,
    pub shape: Shape,
    /// Required keys must be present, even when their value is `null`.
    pub required: bool,
    pub format: Option<Format>,
}

#[derive(Debug)]
pub struct ObjectSchema {
    pub fields: &'static [FieldSchema],
}

const STRING_OR_NULL: &[JsonType] = &[JsonType::String, JsonType::Null];
const NUMBER_OR_NULL: &[JsonType] = &[JsonType::Number, JsonType::Null];

pub static SELLER_SCHEMA: ObjectSchema = ObjectSchema {
    fields: &[
        FieldSchema {
            name: "name",
            shape: Shape::Scalar(&[JsonType::String]),
            required: true,
            format: None,
        },
        FieldSchema {
            name: "tax_id",
            shape: Shape::Scalar(STRING_OR_NULL),
            required: true,
            format: None,
        },
        FieldSchema {
            name: "address",
            shape: Shape::Scalar(STRING_OR_NULL),
            required: false,
            format: None,
        },
    ],
};

pub static ITEM_SCHEMA: ObjectSchema = ObjectSchema {
    fields: &[
        FieldSchema {
            name: "name",
            shape: Shape::Scalar(&[JsonType::String]),
            required: true,
            format: None,
        },
        FieldSchema {
            name: "quantity",
            shape: Shape::Scalar(NUMBER_OR_NULL),
            required: true,
            format: None,
        },
        FieldSchema {
            name: "unit_price",
            shape: Shape::Scalar(NUMBER_OR_NULL),
            required: true,
            format: None,
        },
        FieldSchema {
            name: "amount",
            shape: Shape::Scalar(NUMBER_OR_NULL),
            required: true,
            format: None,
        },
    ],
};

/// The canonical invoice schema.
pub static INVOICE_SCHEMA: ObjectSchema = ObjectSchema {
    fields: &[
        FieldSchema {
            name: "invoice_number",
            shape: Shape::Scalar(STRING_OR_NULL),
            required: true,
            format: None,
        },
        FieldSchema {
            name: "date",
            shape: Shape::Scalar(STRING_OR_NULL),
            required: true,
            format: Some(Format::IsoDate),
        },
        FieldSchema {
            name: "total_amount",
            shape: Shape::Scalar(&[JsonType::Number]),
            required: true,
            format: None,
        },
        FieldSchema {
            name: "seller",
            shape: Shape::Object(&SELLER_SCHEMA),
            required: true,
            format: None,
        },
        FieldSchema {
            name: "items",
            shape: Shape::ArrayOf(&ITEM_SCHEMA),
            required: true,
            format: None,
        },
    ],
};

// ── Violations ───────────────────────────────────────────────────────────────

/// One failed rule, addressed by a dotted path such as `items[2].name`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Violation {
    pub path: String,
    pub kind: ViolationKind,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "rule", rename_all = "snake_case")]
pub enum ViolationKind {
    /// A required key is absent.
    Missing,
    /// The value has the wrong JSON type.
    WrongType {
        expected: Vec<JsonType>,
        found: JsonType,
    },
    /// A string does not match its declared format.
    InvalidFormat { format: Format, value: String },
}

impl Violation {
    pub fn new(path: impl Into<String>, kind: ViolationKind) -> Self {
        Self {
            path: path.into(),
            kind,
        }
    }
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let path = if self.path.is_empty() { "$" } else { &self.path };
        match &self.kind {
            ViolationKind::Missing => write!(f, "{path}: required key is missing"),
            ViolationKind::WrongType { expected, found } => {
                let expected = expected
                    .iter()
                    .map(|t| t.to_string())
                    .collect::<Vec<_>>()
                    .join(" or ");
                write!(f, "{path}: expected {expected}, found {found}")
            }
            ViolationKind::InvalidFormat { format, value } => {
                write!(f, "{path}: {value:?} is not a valid {format}")
            }
        }
    }
}

// ── Validation ───────────────────────────────────────────────────────────────

/// Every rule `value` breaks against [`INVOICE_SCHEMA`], in document order.
pub fn violations(value: &Value) -> Vec<Violation> {
    let mut out = Vec::new();
    match value {
        Value::Object(map) => check_object(map, &INVOICE_SCHEMA, "", &mut out),
        other => out.push(Violation::new(
            "",
            ViolationKind::WrongType {
                expected: vec![JsonType::Object],
                found: JsonType::of(other),
            },
        )),
    }
    out
}

/// Validate without consuming the value.
pub fn validate(value: &Value) -> Result<(), InvoiceError> {
    let violations = violations(value);
    if violations.is_empty() {
        Ok(())
    } else {
        Err(InvoiceError::SchemaValidation { violations })
    }
}

/// Validate and wrap the value as an accepted [`InvoiceRecord`].
pub fn accept(value: Value) -> Result<InvoiceRecord, InvoiceError> {
    validate(&value)?;
    Ok(InvoiceRecord::new_unchecked(value))
}

fn join(prefix: &str, key: &str) -> String {
    if prefix.is_empty() {
        key.to_string()
    } else {
        format!("{prefix}.{key}")
    }
}

fn check_object(
    map: &Map<String, Value>,
    schema: &ObjectSchema,
    prefix: &str,
    out: &mut Vec<Violation>,
) {
    for field in schema.fields {
        let path = join(prefix, field.name);
        match map.get(field.name) {
            None if field.required => out.push(Violation::new(path, ViolationKind::Missing)),
            None => {}
            Some(value) => check_field(value, field, &path, out),
        }
    }
}

fn check_field(value: &Value, field: &FieldSchema, path: &str, out: &mut Vec<Violation>) {
    match (&field.shape, value) {
        (Shape::Scalar(allowed), v) => {
            let found = JsonType::of(v);
            if !allowed.contains(&found) {
                out.push(Violation::new(
                    path,
                    ViolationKind::WrongType {
                        expected: allowed.to_vec(),
                        found,
                    },
                ));
                return;
            }
            if let (Some(format), Value::String(s)) = (field.format, v) {
                if !format.matches(s) {
                    out.push(Violation::new(
                        path,
                        ViolationKind::InvalidFormat {
                            format,
                            value: s.clone(),
                        },
                    ));
                }
            }
        }
        (Shape::Object(schema), Value::Object(map)) => check_object(map, schema, path, out),
        (Shape::ArrayOf(schema), Value::Array(elements)) => {
            for (i, element) in elements.iter().enumerate() {
                let elem_path = format!("{path}[{i}]");
                match element {
                    Value::Object(map) => check_object(map, schema, &elem_path, out),
                    other => out.push(Violation::new(
                        elem_path,
                        ViolationKind::WrongType {
                            expected: vec![JsonType::Object],
                            found: JsonType::of(other),
                        },
                    )),
                }
            }
        }
        (Shape::Object(_), other) => out.push(Violation::new(
            path,
            ViolationKind::WrongType {
                expected: vec![JsonType::Object],
                found: JsonType::of(other),
            },
        )),
        (Shape::ArrayOf(_), other) => out.push(Violation::new(
            path,
            ViolationKind::WrongType {
                expected: vec![JsonType::Array],
                found: JsonType::of(other),
            },
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn valid_invoice() -> Value {
        json!({
            "invoice_number": "AB123456",
            "date": "2024-02-26",
            "total_amount": 100,
            "seller": { "name": "測試商店", "tax_id": "12345678" },
            "items": [
                { "name": "測試商品", "quantity": 1, "unit_price": 100, "amount": 100 }
            ]
        })
    }

    #[test]
    fn accepts_valid_invoice() {
        assert!(violations(&valid_invoice()).is_empty());
        assert!(validate(&valid_invoice()).is_ok());
    }

    #[test]
    fn empty_items_is_valid() {
        let mut v = valid_invoice();
        v["items"] = json!([]);
        assert!(validate(&v).is_ok());
    }

    #[test]
    fn missing_items_is_reported() {
        let mut v = valid_invoice();
        v.as_object_mut().unwrap().remove("items");
        let found = violations(&v);
        assert_eq!(found, vec![Violation::new("items", ViolationKind::Missing)]);
    }

    #[test]
    fn null_items_is_wrong_type() {
        let mut v = valid_invoice();
        v["items"] = Value::Null;
        let found = violations(&v);
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].path, "items");
        assert!(matches!(found[0].kind, ViolationKind::WrongType { found: JsonType::Null, .. }));
    }

    #[test]
    fn nullable_fields_accept_null_but_must_be_present() {
        let mut v = valid_invoice();
        v["invoice_number"] = Value::Null;
        v["date"] = Value::Null;
        v["seller"]["tax_id"] = Value::Null;
        v["items"][0]["quantity"] = Value::Null;
        v["items"][0]["unit_price"] = Value::Null;
        assert!(validate(&v).is_ok());

        v["items"][0].as_object_mut().unwrap().remove("amount");
        let found = violations(&v);
        assert_eq!(found, vec![Violation::new("items[0].amount", ViolationKind::Missing)]);
    }

    #[test]
    fn accumulates_every_violation() {
        let v = json!({
            "date": "26/02/2024",
            "total_amount": "100",
            "seller": { "tax_id": 12345678 },
            "items": [ { "quantity": 1 }, "not an object" ]
        });
        let found = violations(&v);
        let paths: Vec<&str> = found.iter().map(|v| v.path.as_str()).collect();
        assert_eq!(
            paths,
            vec![
                "invoice_number",
                "date",
                "total_amount",
                "seller.name",
                "seller.tax_id",
                "items[0].name",
                "items[0].unit_price",
                "items[0].amount",
                "items[1]",
            ]
        );
    }

    #[test]
    fn optional_address_is_type_checked_when_present() {
        let mut v = valid_invoice();
        v["seller"]["address"] = json!(42);
        let found = violations(&v);
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].path, "seller.address");
    }

    #[test]
    fn unknown_keys_are_allowed() {
        let mut v = valid_invoice();
        v["currency"] = json!("TWD");
        v["items"][0]["tax_rate"] = json!("5%");
        assert!(validate(&v).is_ok());
    }

    #[test]
    fn non_object_root_is_rejected() {
        let found = violations(&json!([1, 2, 3]));
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].to_string(), "$: expected object, found array");
    }

    #[test]
    fn date_format_rule() {
        assert!(Format::IsoDate.matches("2024-02-26"));
        assert!(Format::IsoDate.matches("2024-02-29"));
        assert!(!Format::IsoDate.matches("2024-13-01"));
        assert!(!Format::IsoDate.matches("2024/02/26"));
        assert!(!Format::IsoDate.matches("113-02-26"));
        assert!(!Format::IsoDate.matches("2024-2-26"));
        assert!(!Format::IsoDate.matches("+2024-02-26"));
    }

    #[test]
    fn impossible_calendar_dates_are_rejected() {
        for date in ["2023-02-29", "2024-02-30", "2024-04-31", "2024-00-10"] {
            assert!(!Format::IsoDate.matches(date), "{date}");
            let mut v = valid_invoice();
            v["date"] = json!(date);
            assert_eq!(
                violations(&v),
                vec![Violation::new(
                    "date",
                    ViolationKind::InvalidFormat {
                        format: Format::IsoDate,
                        value: date.to_string(),
                    },
                )]
            );
        }
    }

    #[test]
    fn accept_preserves_value() {
        let record = accept(valid_invoice()).expect("valid invoice");
        assert_eq!(record.as_value(), &valid_invoice());
    }

    #[test]
    fn violation_display() {
        let v = Violation::new(
            "total_amount",
            ViolationKind::WrongType {
                expected: vec![JsonType::Number],
                found: JsonType::String,
            },
        );
        assert_eq!(v.to_string(), "total_amount: expected number, found string");
    }
}
