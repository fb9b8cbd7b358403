//! Declarative field descriptions and their compilation into tables.
//!
//! A [`Schema`] is an ordered list of fields. Each [`FieldSpec`] names an
//! element type, optionally a structural `datatype`, and any number of extra
//! attributes (units, waveform geometry, storage hints). The field order is
//! preserved from construction or from the configuration file.
//!
//! # Example
//! ```rust
//! use daq_core::DType;
//! use daq_storage::schema::{FieldSpec, Schema};
//!
//! let schema = Schema::new()
//!     .with_field("packet_id", FieldSpec::scalar(DType::U32))
//!     .with_field("waveform", FieldSpec::waveform(DType::U16, 1024, 16.0));
//! let table = schema.allocate(128).unwrap();
//! assert_eq!(table.size(), 128);
//! assert_eq!(table.waveform("waveform").unwrap().wf_len(), 1024);
//! ```

use crate::table::{Array, Attrs, Column, FixedArray, RaggedArray, Table, WaveformTable};
use daq_core::{DType, SchemaError};
use serde::de::{MapAccess, Visitor};
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;
use std::fmt;

pub const DATATYPE_WAVEFORM: &str = "waveform";
pub const DATATYPE_FIXED_PREFIX: &str = "array_of_equalsized_arrays";
pub const DATATYPE_RAGGED_PREFIX: &str = "array<1>{array<1>{";

/// Description of one field.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FieldSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dtype: Option<DType>,

    /// Structural kind; absent for flat per-row columns.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub datatype: Option<String>,

    #[serde(flatten)]
    pub attrs: Attrs,
}

impl FieldSpec {
    /// A flat column.
    pub fn scalar(dtype: DType) -> Self {
        Self {
            dtype: Some(dtype),
            ..Default::default()
        }
    }

    /// A waveform with `dt_ns` sample spacing and nanosecond units.
    pub fn waveform(dtype: DType, wf_len: usize, dt_ns: f64) -> Self {
        Self {
            dtype: Some(dtype),
            datatype: Some(DATATYPE_WAVEFORM.to_string()),
            ..Default::default()
        }
        .with_attr("wf_len", wf_len)
        .with_attr("dt", dt_ns)
        .with_attr("dt_units", "ns")
        .with_attr("t0_units", "ns")
    }

    /// A dense `length`-wide row.
    pub fn fixed(dtype: DType, length: usize) -> Self {
        Self {
            dtype: Some(dtype),
            datatype: Some(format!("{}<1,1>{{real}}", DATATYPE_FIXED_PREFIX)),
            ..Default::default()
        }
        .with_attr("length", length)
    }

    /// A variable-length row with an arena sized for `length_guess` elements per row.
    pub fn ragged(dtype: DType, length_guess: Option<usize>) -> Self {
        let spec = Self {
            dtype: Some(dtype),
            datatype: Some("array<1>{array<1>{real}}".to_string()),
            ..Default::default()
        };
        match length_guess {
            Some(guess) => spec.with_attr("length_guess", guess),
            None => spec,
        }
    }

    pub fn with_attr(mut self, name: &str, value: impl Into<Value>) -> Self {
        self.attrs.insert(name.to_string(), value.into());
        self
    }

    pub fn attr(&self, name: &str) -> Option<&Value> {
        self.attrs.get(name)
    }

    /// Compile this field into a column of `size` rows.
    pub fn compile(&self, field: &str, size: usize) -> Result<Column, SchemaError> {
        let dtype = self.dtype.ok_or_else(|| SchemaError::MissingDType {
            field: field.to_string(),
        })?;
        let mut attrs = self.attrs.clone();

        let Some(datatype) = self.datatype.as_deref() else {
            let mut array = Array::new(dtype, size);
            if let Some(kind) = attrs.remove("kind") {
                let kind = kind.as_str().map(str::to_string).unwrap_or_else(|| kind.to_string());
                array.datatype = format!("array<1>{{{}}}", kind);
            }
            array.attrs = attrs;
            return Ok(Column::Array(array));
        };

        if datatype == DATATYPE_WAVEFORM {
            let t0_units = take_str(&mut attrs, field, datatype, "t0_units")?;
            let dt = take_f64(&mut attrs, field, datatype, "dt")?;
            let dt_units = take_str(&mut attrs, field, datatype, "dt_units")?;
            let wf_len = take_usize(&mut attrs, field, datatype, "wf_len")?;
            let compression = attrs.remove("compression");
            let hdf5_settings = attrs.remove("hdf5_settings");

            let mut waveform = WaveformTable::new(dtype, size, wf_len, &t0_units, dt, &dt_units);
            for (hint, settings) in [("compression", compression), ("hdf5_settings", hdf5_settings)] {
                let Some(settings) = settings else { continue };
                let Value::Object(per_column) = settings else {
                    return Err(SchemaError::InvalidAttribute {
                        field: field.to_string(),
                        attribute: hint.to_string(),
                        reason: "expected a map keyed by values, t0 or dt".to_string(),
                    });
                };
                for (column, setting) in per_column {
                    if let Some(target) = waveform.sub_attrs_mut(&column) {
                        target.insert(hint.to_string(), setting);
                    }
                }
            }
            waveform.attrs = attrs;
            return Ok(Column::Waveform(waveform));
        }

        if datatype.starts_with(DATATYPE_FIXED_PREFIX) {
            let length = take_usize(&mut attrs, field, datatype, "length")?;
            let mut fixed = FixedArray::new(dtype, size, length);
            fixed.datatype = datatype.to_string();
            fixed.attrs = attrs;
            return Ok(Column::Fixed(fixed));
        }

        if datatype.starts_with(DATATYPE_RAGGED_PREFIX) {
            let length_guess = if attrs.contains_key("length_guess") {
                take_usize(&mut attrs, field, datatype, "length_guess")?
            } else {
                size
            };
            let mut ragged = RaggedArray::new(dtype, size, length_guess);
            ragged.datatype = datatype.to_string();
            ragged.attrs = attrs;
            return Ok(Column::Ragged(ragged));
        }

        Err(SchemaError::UnsupportedSchema {
            field: field.to_string(),
            datatype: datatype.to_string(),
        })
    }
}

fn take(attrs: &mut Attrs, field: &str, datatype: &str, name: &str) -> Result<Value, SchemaError> {
    attrs.remove(name).ok_or_else(|| SchemaError::MissingAttribute {
        field: field.to_string(),
        datatype: datatype.to_string(),
        attribute: name.to_string(),
    })
}

fn invalid(field: &str, name: &str, reason: &str) -> SchemaError {
    SchemaError::InvalidAttribute {
        field: field.to_string(),
        attribute: name.to_string(),
        reason: reason.to_string(),
    }
}

fn take_str(attrs: &mut Attrs, field: &str, datatype: &str, name: &str) -> Result<String, SchemaError> {
    match take(attrs, field, datatype, name)? {
        Value::String(s) => Ok(s),
        _ => Err(invalid(field, name, "expected a string")),
    }
}

fn take_f64(attrs: &mut Attrs, field: &str, datatype: &str, name: &str) -> Result<f64, SchemaError> {
    take(attrs, field, datatype, name)?
        .as_f64()
        .ok_or_else(|| invalid(field, name, "expected a number"))
}

fn take_usize(attrs: &mut Attrs, field: &str, datatype: &str, name: &str) -> Result<usize, SchemaError> {
    take(attrs, field, datatype, name)?
        .as_u64()
        .map(|v| v as usize)
        .ok_or_else(|| invalid(field, name, "expected a non-negative integer"))
}

// =============================================================================
// Schema
// =============================================================================

/// Ordered mapping of field name to [`FieldSpec`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Schema {
    fields: Vec<(String, FieldSpec)>,
}

impl Schema {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_field(mut self, name: impl Into<String>, spec: FieldSpec) -> Self {
        self.insert(name, spec);
        self
    }

    /// Insert or replace a field. Replacing keeps the original position.
    pub fn insert(&mut self, name: impl Into<String>, spec: FieldSpec) {
        let name = name.into();
        match self.fields.iter_mut().find(|(n, _)| *n == name) {
            Some((_, existing)) => *existing = spec,
            None => self.fields.push((name, spec)),
        }
    }

    /// Append every field of `other`, replacing same-named fields.
    pub fn extend(&mut self, other: &Schema) {
        for (name, spec) in other.iter() {
            self.insert(name, spec.clone());
        }
    }

    pub fn get(&self, name: &str) -> Option<&FieldSpec> {
        self.fields.iter().find(|(n, _)| n == name).map(|(_, s)| s)
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut FieldSpec> {
        self.fields
            .iter_mut()
            .find(|(n, _)| n == name)
            .map(|(_, s)| s)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &FieldSpec)> {
        self.fields.iter().map(|(n, s)| (n.as_str(), s))
    }

    /// Compile every field into a table of `size` rows.
    pub fn allocate(&self, size: usize) -> Result<Table, SchemaError> {
        let mut table = Table::new(size);
        for (name, spec) in &self.fields {
            table.add_field(name.clone(), spec.compile(name, size)?);
        }
        Ok(table)
    }
}

impl Serialize for Schema {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.fields.len()))?;
        for (name, spec) in &self.fields {
            map.serialize_entry(name, spec)?;
        }
        map.end()
    }
}

impl<'de> Deserialize<'de> for Schema {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct SchemaVisitor;

        impl<'de> Visitor<'de> for SchemaVisitor {
            type Value = Schema;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("a map of field name to field description")
            }

            fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> Result<Schema, A::Error> {
                let mut schema = Schema::new();
                while let Some((name, spec)) = access.next_entry::<String, FieldSpec>()? {
                    schema.insert(name, spec);
                }
                Ok(schema)
            }
        }

        deserializer.deserialize_map(SchemaVisitor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use daq_core::Scalar;
    use serde_json::json;

    #[test]
    fn test_flat_field_rows_and_dtype() {
        let schema = Schema::new().with_field("energy", FieldSpec::scalar(DType::F32));
        let table = schema.allocate(100).unwrap();
        let energy = table.array("energy").unwrap();
        assert_eq!(energy.len(), 100);
        assert_eq!(energy.data.dtype(), DType::F32);
        assert_eq!(energy.datatype, "array<1>{real}");
    }

    #[test]
    fn test_kind_sets_datatype_label() {
        let schema = Schema::new().with_field(
            "timestamp",
            FieldSpec::scalar(DType::U64)
                .with_attr("kind", "real")
                .with_attr("units", "clock_ticks"),
        );
        let table = schema.allocate(4).unwrap();
        let column = table.array("timestamp").unwrap();
        assert_eq!(column.datatype, "array<1>{real}");
        assert_eq!(column.attrs["units"], "clock_ticks");
        assert!(!column.attrs.contains_key("kind"));
    }

    #[test]
    fn test_missing_dtype_is_rejected() {
        let schema = Schema::new().with_field("broken", FieldSpec::default());
        assert_eq!(
            schema.allocate(1).unwrap_err(),
            SchemaError::MissingDType {
                field: "broken".into()
            }
        );
    }

    #[test]
    fn test_waveform_with_independent_hints() {
        let spec = FieldSpec::waveform(DType::U16, 1000, 16.0)
            .with_attr("compression", json!({"values": "radware-sigcompress", "t0": "gzip"}))
            .with_attr("hdf5_settings", json!({"dt": {"shuffle": true}}));
        let table = Schema::new().with_field("waveform", spec).allocate(8).unwrap();
        let wf = table.waveform("waveform").unwrap();
        assert_eq!(wf.values.data.len(), 8 * 1000);
        assert_eq!(wf.wf_len(), 1000);
        assert_eq!(wf.dt.data.get(7), Some(Scalar::Float(16.0)));
        assert_eq!(wf.values.attrs["compression"], "radware-sigcompress");
        assert_eq!(wf.t0.attrs["compression"], "gzip");
        assert!(!wf.dt.attrs.contains_key("compression"));
        assert_eq!(wf.dt.attrs["hdf5_settings"], json!({"shuffle": true}));
        assert!(!wf.values.attrs.contains_key("hdf5_settings"));
    }

    #[test]
    fn test_waveform_requires_geometry() {
        let mut spec = FieldSpec::waveform(DType::U16, 10, 4.0);
        spec.attrs.remove("dt_units");
        let err = Schema::new().with_field("wf", spec).allocate(1).unwrap_err();
        assert!(matches!(
            err,
            SchemaError::MissingAttribute { ref attribute, .. } if attribute == "dt_units"
        ));
    }

    #[test]
    fn test_fixed_and_ragged_fields() {
        let schema = Schema::new()
            .with_field("pattern", FieldSpec::fixed(DType::U8, 16))
            .with_field("tracelist", FieldSpec::ragged(DType::U16, Some(4)))
            .with_field("hits", FieldSpec::ragged(DType::U32, None));
        let table = schema.allocate(10).unwrap();
        assert_eq!(table.fixed("pattern").unwrap().data.len(), 160);
        assert_eq!(table.ragged("tracelist").unwrap().flattened.len(), 40);
        assert_eq!(table.ragged("hits").unwrap().flattened.len(), 100);
        assert_eq!(table.ragged("hits").unwrap().cumulative_length.len(), 10);

        let missing = Schema::new().with_field(
            "pattern",
            FieldSpec {
                dtype: Some(DType::U8),
                datatype: Some("array_of_equalsized_arrays<1,1>{real}".into()),
                ..Default::default()
            },
        );
        assert!(matches!(
            missing.allocate(1),
            Err(SchemaError::MissingAttribute { .. })
        ));
    }

    #[test]
    fn test_unsupported_datatype() {
        let spec = FieldSpec {
            dtype: Some(DType::U8),
            datatype: Some("struct{a,b}".into()),
            ..Default::default()
        };
        assert!(matches!(
            Schema::new().with_field("x", spec).allocate(1),
            Err(SchemaError::UnsupportedSchema { .. })
        ));
    }

    #[test]
    fn test_allocation_is_deterministic() {
        let schema = Schema::new()
            .with_field("a", FieldSpec::scalar(DType::I16))
            .with_field("wf", FieldSpec::waveform(DType::U16, 32, 8.0));
        assert_eq!(schema.allocate(16).unwrap(), schema.allocate(16).unwrap());
    }

    #[test]
    fn test_deserialize_preserves_order() {
        let schema: Schema = serde_json::from_str(
            r#"{
                "zeta": {"dtype": "uint32"},
                "alpha": {"dtype": "float64", "units": "ns"},
                "wf": {"dtype": "uint16", "datatype": "waveform", "wf_len": 4,
                       "dt": 10, "dt_units": "ns", "t0_units": "ns"}
            }"#,
        )
        .unwrap();
        let names: Vec<&str> = schema.iter().map(|(n, _)| n).collect();
        assert_eq!(names, vec!["zeta", "alpha", "wf"]);
        assert_eq!(schema.get("alpha").unwrap().attr("units"), Some(&json!("ns")));
        let table = schema.allocate(2).unwrap();
        assert_eq!(table.waveform("wf").unwrap().dt.data.get(0), Some(Scalar::Float(10.0)));
    }
}
