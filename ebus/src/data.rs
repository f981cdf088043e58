//! Named fields within a message's data payload.

use crate::{DataType, Error, OutputFormat, Result};
use std::{collections::BTreeMap, sync::Arc};

/// Separator between field values in decoded output and value input.
pub const FIELD_SEPARATOR: char = ';';

/// The frame part a field lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartType {
    MasterData,
    SlaveData,
}

/// A single named field.
#[derive(Debug, Clone)]
pub struct Field {
    pub name: String,
    pub part: PartType,
    data_type: Arc<dyn DataType>,
    pub length: usize,
    pub values: BTreeMap<u32, String>,
    pub unit: String,
    pub comment: String,
}

impl Field {
    pub fn new(
        name: &str,
        part: PartType,
        data_type: Arc<dyn DataType>,
        length: Option<usize>,
        divisor: i32,
        values: BTreeMap<u32, String>,
        unit: &str,
        comment: &str,
    ) -> Result<Self> {
        let length = match length {
            Some(len) => {
                if len == 0 || len * 8 > data_type.bit_count().max(8) && data_type.is_adjustable() {
                    return Err(Error::OutOfRange);
                }
                if !data_type.is_adjustable() && len != data_type.length() {
                    return Err(Error::OutOfRange);
                }
                len
            }
            None => data_type.length(),
        };
        let data_type = if divisor == 0 || divisor == 1 {
            data_type
        } else if let Some(number) = data_type.as_number() {
            Arc::new(number.derive(divisor)?) as Arc<dyn DataType>
        } else {
            data_type
        };
        Ok(Self {
            name: name.into(),
            part,
            data_type,
            length,
            values,
            unit: unit.into(),
            comment: comment.into(),
        })
    }

    pub fn data_type(&self) -> &Arc<dyn DataType> {
        &self.data_type
    }

    pub fn is_ignored(&self) -> bool {
        self.data_type.is_ignored()
    }

    /// Decode this field from the part data and append the formatted
    /// value to `out`.
    pub fn read(&self, data: &[u8], offset: usize, format: OutputFormat, out: &mut String) -> Result<()> {
        if self.is_ignored() {
            return Ok(());
        }
        if format.contains(OutputFormat::NAMES) {
            out.push_str(&self.name);
            out.push('=');
        }
        if let Some(number) = self.data_type.as_number() {
            let raw = number.read_raw(data, offset, self.length)?;
            match self.values.get(&raw) {
                Some(name) if !format.contains(OutputFormat::NUMERIC) => {
                    if format.contains(OutputFormat::VALUE_NAME) {
                        number.format_value(raw, self.length, out);
                        out.push('=');
                    }
                    out.push_str(name);
                }
                _ => number.format_value(raw, self.length, out),
            }
        } else {
            self.data_type.read(data, offset, self.length, out)?;
        }
        if format.contains(OutputFormat::UNITS) && !self.unit.is_empty() {
            out.push(' ');
            out.push_str(&self.unit);
        }
        if format.contains(OutputFormat::COMMENTS) && !self.comment.is_empty() {
            out.push_str(" [");
            out.push_str(&self.comment);
            out.push(']');
        }
        Ok(())
    }

    /// Encode the input value and append the raw symbols to `out`.
    pub fn write(&self, input: &str, out: &mut Vec<u8>) -> Result<()> {
        if self.is_ignored() {
            return self.data_type.write("", self.length, out);
        }
        if let Some(number) = self.data_type.as_number() {
            if !self.values.is_empty() {
                if let Some((&raw, _)) = self.values.iter().find(|(_, name)| name.as_str() == input) {
                    return number.write_raw(raw, self.length, out);
                }
            }
            return number.write(input, self.length, out);
        }
        self.data_type.write(input, self.length, out)
    }
}

/// The ordered fields of one message definition.
#[derive(Debug, Clone, Default)]
pub struct FieldList {
    fields: Vec<Field>,
}

impl FieldList {
    pub fn new(fields: Vec<Field>) -> Self {
        Self { fields }
    }

    pub fn push(&mut self, field: Field) {
        self.fields.push(field);
    }

    pub fn fields(&self) -> &[Field] {
        &self.fields
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    /// Total symbol count of the fields in the given part.
    pub fn part_length(&self, part: PartType) -> usize {
        self.fields
            .iter()
            .filter(|f| f.part == part)
            .map(|f| f.length)
            .sum()
    }

    /// Decode all fields (or a single selected one) from the given part
    /// data regions.
    ///
    /// `field_filter` selects by name, with an optional 0-based index
    /// among same-named fields.
    pub fn decode(
        &self,
        master_data: &[u8],
        slave_data: &[u8],
        field_filter: Option<(&str, isize)>,
        format: OutputFormat,
        out: &mut String,
    ) -> Result<()> {
        let mut master_offset = 0;
        let mut slave_offset = 0;
        let mut found = false;
        let mut name_hits: isize = -1;
        let mut first = true;
        for field in &self.fields {
            let (data, offset) = match field.part {
                PartType::MasterData => (master_data, master_offset),
                PartType::SlaveData => (slave_data, slave_offset),
            };
            let selected = match field_filter {
                None => true,
                Some((name, index)) => {
                    if field.name.eq_ignore_ascii_case(name) {
                        name_hits += 1;
                        index < 0 || index == name_hits
                    } else {
                        false
                    }
                }
            };
            if selected && !field.is_ignored() {
                if !first {
                    out.push(FIELD_SEPARATOR);
                }
                field.read(data, offset, format, out)?;
                first = false;
                found = true;
            }
            match field.part {
                PartType::MasterData => master_offset += field.length,
                PartType::SlaveData => slave_offset += field.length,
            }
        }
        if field_filter.is_some() && !found {
            return Err(Error::NotFound);
        }
        Ok(())
    }

    /// Encode the `;`-separated input values into the raw symbols of the
    /// given part. Missing values fall back to the replacement value.
    pub fn encode(&self, part: PartType, input: &str, out: &mut Vec<u8>) -> Result<()> {
        let mut values = input.split(FIELD_SEPARATOR);
        for field in self.fields.iter().filter(|f| f.part == part) {
            let value = if field.is_ignored() {
                ""
            } else {
                values.next().unwrap_or("-").trim()
            };
            let value = if value.is_empty() && !field.is_ignored() {
                "-"
            } else {
                value
            };
            field.write(value, out)?;
        }
        Ok(())
    }
}

/// Named reusable field definitions.
///
/// A manufacturer-scoped table inherits the global one at creation time.
#[derive(Debug, Clone, Default)]
pub struct FieldTemplates {
    templates: BTreeMap<String, Field>,
}

impl FieldTemplates {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_parent(parent: &FieldTemplates) -> Self {
        Self {
            templates: parent.templates.clone(),
        }
    }

    pub fn add(&mut self, field: Field, replace: bool) -> Result<()> {
        let name = field.name.to_lowercase();
        if !replace && self.templates.contains_key(&name) {
            return Err(Error::Duplicate);
        }
        self.templates.insert(name, field);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&Field> {
        self.templates.get(&name.to_lowercase())
    }

    pub fn len(&self) -> usize {
        self.templates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.templates.is_empty()
    }

    pub fn clear(&mut self) {
        self.templates.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::DataTypeList;

    fn temp_field(name: &str) -> Field {
        let types = DataTypeList::new();
        Field::new(
            name,
            PartType::SlaveData,
            types.get("D2C").unwrap(),
            None,
            0,
            BTreeMap::new(),
            "°C",
            "temperature",
        )
        .unwrap()
    }

    #[test]
    fn decode_single_field() {
        let fields = FieldList::new(vec![temp_field("temp")]);
        let mut out = String::new();
        fields
            .decode(&[], &[0x41, 0x0c], None, OutputFormat::NONE, &mut out)
            .unwrap();
        assert_eq!(out, "196.06");

        out.clear();
        fields
            .decode(
                &[],
                &[0x41, 0x0c],
                None,
                OutputFormat::NAMES | OutputFormat::UNITS,
                &mut out,
            )
            .unwrap();
        assert_eq!(out, "temp=196.06 °C");
    }

    #[test]
    fn decode_field_filter() {
        let fields = FieldList::new(vec![temp_field("temp"), temp_field("temp")]);
        let mut out = String::new();
        fields
            .decode(
                &[],
                &[0x41, 0x0c, 0x00, 0x01],
                Some(("temp", 1)),
                OutputFormat::NONE,
                &mut out,
            )
            .unwrap();
        assert_eq!(out, "16.00");
        assert_eq!(
            fields.decode(&[], &[0x41, 0x0c, 0x00, 0x01], Some(("other", -1)), OutputFormat::NONE, &mut out),
            Err(Error::NotFound)
        );
    }

    #[test]
    fn value_list_lookup() {
        let types = DataTypeList::new();
        let mut values = BTreeMap::new();
        values.insert(0u32, "off".to_string());
        values.insert(1u32, "on".to_string());
        let field = Field::new(
            "state",
            PartType::SlaveData,
            types.get("UCH").unwrap(),
            None,
            0,
            values,
            "",
            "",
        )
        .unwrap();
        let fields = FieldList::new(vec![field]);
        let mut out = String::new();
        fields
            .decode(&[], &[0x01], None, OutputFormat::NONE, &mut out)
            .unwrap();
        assert_eq!(out, "on");
        out.clear();
        fields
            .decode(&[], &[0x01], None, OutputFormat::NUMERIC, &mut out)
            .unwrap();
        assert_eq!(out, "1");
        out.clear();
        fields
            .decode(&[], &[0x01], None, OutputFormat::VALUE_NAME, &mut out)
            .unwrap();
        assert_eq!(out, "1=on");

        let mut raw = Vec::new();
        fields.encode(PartType::SlaveData, "on", &mut raw).unwrap();
        assert_eq!(raw, vec![0x01]);
    }

    #[test]
    fn encode_multiple_fields() {
        let fields = FieldList::new(vec![temp_field("a"), temp_field("b")]);
        let mut raw = Vec::new();
        fields
            .encode(PartType::SlaveData, "196.06;16.00", &mut raw)
            .unwrap();
        assert_eq!(raw, vec![0x41, 0x0c, 0x00, 0x01]);

        // missing values fall back to the replacement
        raw.clear();
        fields.encode(PartType::SlaveData, "196.06", &mut raw).unwrap();
        assert_eq!(raw, vec![0x41, 0x0c, 0x00, 0x80]);
    }

    #[test]
    fn templates_inherit() {
        let mut global = FieldTemplates::new();
        global.add(temp_field("temp"), false).unwrap();
        let scoped = FieldTemplates::with_parent(&global);
        assert!(scoped.get("TEMP").is_some());
        let mut scoped = scoped;
        assert_eq!(scoped.add(temp_field("temp"), false), Err(Error::Duplicate));
        scoped.add(temp_field("temp"), true).unwrap();
    }
}
