//! Line oriented reading of message definitions from CSV files.
//!
//! Rows are comma separated with optional double quotes. `#` starts a
//! comment, `*` a defaults or condition row, `!` an instruction row.
//! Message rows use the columns
//! `type,circuit,level,name,comment,QQ,ZZ,PBSB,ID` followed by groups of
//! `field,part,type,divisor/values,unit,comment`.

use crate::{
    data::{Field, FieldList, FieldTemplates, PartType},
    message::{Condition, Direction, Instruction, Message, MessageCatalog},
    symbol::SYN,
    Error, Result,
};
use std::collections::BTreeMap;

/// Values extracted from a configuration file name, plus the matched
/// address/version constraints.
#[derive(Debug, Clone, Default)]
pub struct FilenameDefaults {
    /// The destination address the file applies to.
    pub dest: Option<u8>,
    /// The identification prefix, if present.
    pub ident: Option<String>,
    /// Circuit name suffixes past the ident.
    pub suffixes: Vec<String>,
    /// Software version constraint from a `SWxxxx` part.
    pub sw: Option<u32>,
    /// Hardware version constraint from a `HWxxxx` part.
    pub hw: Option<u32>,
}

/// Parse `ZZ[.IDENT[.SUFFIX]*][.SWxxxx][.HWxxxx].csv`.
pub fn extract_defaults_from_filename(filename: &str) -> Option<FilenameDefaults> {
    let base = filename.strip_suffix(".csv")?;
    let mut parts = base.split('.');
    let first = parts.next()?;
    if first.len() != 2 {
        return None;
    }
    let dest = u8::from_str_radix(first, 16).ok()?;
    let mut defaults = FilenameDefaults {
        dest: Some(dest),
        ..FilenameDefaults::default()
    };
    for part in parts {
        if part.len() == 6 && (part.starts_with("SW") || part.starts_with("HW")) {
            if let Ok(version) = part[2..].parse::<u32>() {
                if part.starts_with("SW") {
                    defaults.sw = Some(version);
                } else {
                    defaults.hw = Some(version);
                }
                continue;
            }
        }
        if defaults.ident.is_none() {
            defaults.ident = Some(part.to_lowercase());
        } else {
            defaults.suffixes.push(part.to_lowercase());
        }
    }
    Some(defaults)
}

/// Split a CSV line honoring double quotes.
pub fn split_fields(line: &str) -> Vec<String> {
    let mut fields = Vec::new();
    let mut field = String::new();
    let mut quoted = false;
    let mut chars = line.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '"' => {
                if quoted && chars.peek() == Some(&'"') {
                    field.push('"');
                    chars.next();
                } else {
                    quoted = !quoted;
                }
            }
            ',' if !quoted => {
                fields.push(field.trim().to_string());
                field.clear();
            }
            _ => field.push(c),
        }
    }
    fields.push(field.trim().to_string());
    fields
}

fn column(row: &[String], index: usize) -> &str {
    row.get(index).map(String::as_str).unwrap_or("")
}

fn parse_address(text: &str) -> Result<u8> {
    if text.is_empty() {
        return Ok(SYN);
    }
    u8::from_str_radix(text, 16).map_err(|_| Error::InvalidAddress)
}

fn parse_hex_bytes(text: &str) -> Result<Vec<u8>> {
    let text: String = text.chars().filter(|c| !c.is_whitespace()).collect();
    if text.len() % 2 != 0 {
        return Err(Error::InvalidArgument);
    }
    (0..text.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&text[i..i + 2], 16).map_err(|_| Error::InvalidArgument))
        .collect()
}

/// Accumulated defaults from `*` rows, keyed by the type token.
#[derive(Debug, Clone, Default)]
struct TypeDefaults {
    circuit: String,
    level: String,
    src: String,
    dst: String,
    pbsb: String,
    id: String,
}

/// Outcome of loading one definition file.
#[derive(Debug, Default)]
pub struct LoadResult {
    pub messages: usize,
    /// Files referenced by `!include` rows, to be loaded by the caller.
    pub includes: Vec<String>,
}

fn parse_divisor_values(text: &str) -> Result<(i32, BTreeMap<u32, String>)> {
    let text = text.trim();
    if text.is_empty() {
        return Ok((0, BTreeMap::new()));
    }
    if text.contains('=') {
        let mut values = BTreeMap::new();
        for pair in text.split(';').map(str::trim).filter(|p| !p.is_empty()) {
            let (raw, name) = pair.split_once('=').ok_or(Error::InvalidList)?;
            let raw: u32 = raw.trim().parse().map_err(|_| Error::InvalidList)?;
            values.insert(raw, name.trim().to_string());
        }
        if values.is_empty() {
            return Err(Error::InvalidList);
        }
        return Ok((0, values));
    }
    let divisor: i32 = text.parse().map_err(|_| Error::InvalidNumber)?;
    Ok((divisor, BTreeMap::new()))
}

fn parse_field(
    row: &[String],
    group: usize,
    direction: Direction,
    templates: &FieldTemplates,
    catalog: &MessageCatalog,
) -> Result<Field> {
    let base = 9 + group * 6;
    let name = column(row, base);
    let part = match column(row, base + 1) {
        "" => {
            if direction.is_write() {
                PartType::MasterData
            } else {
                PartType::SlaveData
            }
        }
        "m" => PartType::MasterData,
        "s" => PartType::SlaveData,
        _ => return Err(Error::InvalidArgument),
    };
    let type_spec = column(row, base + 2);
    let (divisor, values) = parse_divisor_values(column(row, base + 3))?;
    let unit = column(row, base + 4);
    let comment = column(row, base + 5);
    if type_spec.is_empty() {
        // bare template reference
        let template = templates.get(name).ok_or(Error::NotFound)?;
        let mut field = template.clone();
        field.part = part;
        return Ok(field);
    }
    if let Some(template) = templates.get(type_spec) {
        let mut field = template.clone();
        if !name.is_empty() {
            field.name = name.to_string();
        }
        field.part = part;
        if !unit.is_empty() {
            field.unit = unit.to_string();
        }
        if !comment.is_empty() {
            field.comment = comment.to_string();
        }
        return Ok(field);
    }
    let (data_type, length) = resolve_type(type_spec, catalog)?;
    Field::new(name, part, data_type, length, divisor, values, unit, comment)
}

fn resolve_type(
    spec: &str,
    catalog: &MessageCatalog,
) -> Result<(std::sync::Arc<dyn crate::DataType>, Option<usize>)> {
    let types = catalog.types();
    if let Some(data_type) = types.get(spec) {
        return Ok((data_type, None));
    }
    if let Some((base, length)) = spec.split_once(':') {
        let data_type = types.get(base).ok_or(Error::NotFound)?;
        if length == "*" {
            return Ok((data_type, None));
        }
        let length: usize = length.parse().map_err(|_| Error::InvalidNumber)?;
        return Ok((data_type, Some(length)));
    }
    Err(Error::NotFound)
}

/// Load message definitions from the CSV `content` into the catalog.
///
/// Parse failures are reported with `file:line` annotation and abort the
/// file; previously added rows stay registered.
pub fn load_definitions(
    catalog: &mut MessageCatalog,
    templates: &FieldTemplates,
    content: &str,
    filename: &str,
    file_defaults: Option<&FilenameDefaults>,
) -> Result<LoadResult> {
    let mut result = LoadResult::default();
    let mut type_defaults: BTreeMap<String, TypeDefaults> = BTreeMap::new();
    let mut condition_names: BTreeMap<String, usize> = BTreeMap::new();
    for (line_no, line) in content.lines().enumerate() {
        let line_no = line_no + 1;
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let row = split_fields(line);
        let first = column(&row, 0);
        let outcome = if let Some(rest) = first.strip_prefix('!') {
            parse_instruction(rest, &row, catalog, &mut result)
        } else if let Some(rest) = first.strip_prefix('*') {
            if rest.starts_with('[') {
                parse_condition_row(rest, &row, catalog, &mut condition_names)
            } else {
                type_defaults.insert(
                    rest.to_lowercase(),
                    TypeDefaults {
                        circuit: column(&row, 1).to_string(),
                        level: column(&row, 2).to_string(),
                        src: column(&row, 5).to_string(),
                        dst: column(&row, 6).to_string(),
                        pbsb: column(&row, 7).to_string(),
                        id: column(&row, 8).to_string(),
                    },
                );
                Ok(())
            }
        } else {
            parse_message_row(
                &row,
                catalog,
                templates,
                &type_defaults,
                &condition_names,
                file_defaults,
            )
            .map(|_| result.messages += 1)
        };
        if let Err(e) = outcome {
            log::error!("{}:{}: {}", filename, line_no, e);
            return Err(e);
        }
    }
    Ok(result)
}

fn parse_instruction(
    verb: &str,
    row: &[String],
    catalog: &mut MessageCatalog,
    result: &mut LoadResult,
) -> Result<()> {
    match verb.to_lowercase().as_str() {
        "include" => {
            let file = column(row, 1);
            if file.is_empty() {
                return Err(Error::InvalidArgument);
            }
            result.includes.push(file.to_string());
            Ok(())
        }
        "read" => {
            let circuit = column(row, 1);
            let name = column(row, 2);
            if name.is_empty() {
                return Err(Error::InvalidArgument);
            }
            catalog.add_instruction(Instruction::Read {
                circuit: circuit.to_string(),
                name: name.to_string(),
            });
            Ok(())
        }
        _ => Err(Error::InvalidArgument),
    }
}

fn parse_condition_row(
    first: &str,
    row: &[String],
    catalog: &mut MessageCatalog,
    condition_names: &mut BTreeMap<String, usize>,
) -> Result<()> {
    let name = first
        .strip_prefix('[')
        .and_then(|s| s.strip_suffix(']'))
        .ok_or(Error::InvalidArgument)?;
    if name.is_empty() || condition_names.contains_key(name) {
        return Err(Error::Duplicate);
    }
    let condition = Condition::new(
        name,
        column(row, 1),
        column(row, 2),
        column(row, 3),
        column(row, 4),
    )?;
    let index = catalog.add_condition(condition);
    condition_names.insert(name.to_string(), index);
    Ok(())
}

fn parse_message_row(
    row: &[String],
    catalog: &mut MessageCatalog,
    templates: &FieldTemplates,
    type_defaults: &BTreeMap<String, TypeDefaults>,
    condition_names: &BTreeMap<String, usize>,
    file_defaults: Option<&FilenameDefaults>,
) -> Result<usize> {
    let mut type_token = column(row, 0).to_string();
    let mut condition = None;
    if let Some(end) = type_token.find(']') {
        if type_token.starts_with('[') {
            let name = type_token[1..end].to_string();
            condition = Some(*condition_names.get(&name).ok_or(Error::NotFound)?);
            type_token = type_token[end + 1..].to_string();
        }
    }
    let (direction, poll_priority) = Direction::parse(&type_token)?;
    let token_key = type_token.to_lowercase();
    let base_key: String = token_key.trim_end_matches(|c: char| c.is_ascii_digit()).to_string();
    let defaults = type_defaults.get(&token_key).or_else(|| type_defaults.get(&base_key));
    let pick = |row_value: &str, default: Option<&str>| -> String {
        if !row_value.is_empty() {
            row_value.to_string()
        } else {
            default.unwrap_or("").to_string()
        }
    };
    let mut circuit = pick(column(row, 1), defaults.map(|d| d.circuit.as_str()));
    if circuit.is_empty() {
        if let Some(fd) = file_defaults {
            circuit = fd.ident.clone().unwrap_or_default();
        }
    }
    let level = pick(column(row, 2), defaults.map(|d| d.level.as_str()));
    let name = column(row, 3).to_string();
    if name.is_empty() {
        return Err(Error::InvalidArgument);
    }
    let comment = column(row, 4).to_string();
    let src = parse_address(&pick(column(row, 5), defaults.map(|d| d.src.as_str())))?;
    let mut dst = parse_address(&pick(column(row, 6), defaults.map(|d| d.dst.as_str())))?;
    if dst == SYN {
        if let Some(fd) = file_defaults {
            if let Some(dest) = fd.dest {
                dst = dest;
            }
        }
    }
    let pbsb = parse_hex_bytes(&pick(column(row, 7), defaults.map(|d| d.pbsb.as_str())))?;
    if pbsb.len() != 2 {
        return Err(Error::InvalidArgument);
    }
    let mut id = pbsb;
    id.extend(parse_hex_bytes(defaults.map(|d| d.id.as_str()).unwrap_or(""))?);
    id.extend(parse_hex_bytes(column(row, 8))?);

    let mut fields = FieldList::default();
    let mut group = 0;
    while 9 + group * 6 < row.len() {
        if column(row, 9 + group * 6).is_empty() && column(row, 9 + group * 6 + 2).is_empty() {
            group += 1;
            continue;
        }
        fields.push(parse_field(row, group, direction, templates, catalog)?);
        group += 1;
    }

    let mut message = Message::new(&circuit, &name, direction, &level, src, dst, id, fields)?;
    message.comment = comment;
    message.poll_priority = poll_priority;
    message.condition = condition;
    catalog.add(message)
}

/// Load field templates from the CSV `content`.
///
/// Template rows use the columns `name,type,divisor/values,unit,comment`.
pub fn load_templates(
    templates: &mut FieldTemplates,
    catalog: &MessageCatalog,
    content: &str,
    filename: &str,
) -> Result<()> {
    for (line_no, line) in content.lines().enumerate() {
        let line_no = line_no + 1;
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let row = split_fields(line);
        let outcome = (|| -> Result<()> {
            let name = column(&row, 0);
            if name.is_empty() {
                return Err(Error::InvalidArgument);
            }
            let (data_type, length) = resolve_type(column(&row, 1), catalog)?;
            let (divisor, values) = parse_divisor_values(column(&row, 2))?;
            let field = Field::new(
                name,
                PartType::SlaveData,
                data_type,
                length,
                divisor,
                values,
                column(&row, 3),
                column(&row, 4),
            )?;
            templates.add(field, true)
        })();
        if let Err(e) = outcome {
            log::error!("{}:{}: {}", filename, line_no, e);
            return Err(e);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{DataTypeList, OutputFormat};
    use std::sync::Arc;

    fn catalog() -> MessageCatalog {
        MessageCatalog::new(Arc::new(DataTypeList::new()))
    }

    #[test]
    fn filename_defaults() {
        let d = extract_defaults_from_filename("08.ehp.SW0100.HW0064.csv").unwrap();
        assert_eq!(d.dest, Some(0x08));
        assert_eq!(d.ident.as_deref(), Some("ehp"));
        assert_eq!(d.sw, Some(100));
        assert_eq!(d.hw, Some(64));

        let d = extract_defaults_from_filename("15.csv").unwrap();
        assert_eq!(d.dest, Some(0x15));
        assert!(d.ident.is_none());

        assert!(extract_defaults_from_filename("_templates.csv").is_none());
        assert!(extract_defaults_from_filename("broadcast.csv").is_none());
    }

    #[test]
    fn split_quoted_fields() {
        assert_eq!(split_fields("a,b,c"), vec!["a", "b", "c"]);
        assert_eq!(split_fields("a,\"b,c\",d"), vec!["a", "b,c", "d"]);
        assert_eq!(split_fields("\"say \"\"hi\"\"\",x"), vec!["say \"hi\"", "x"]);
    }

    #[test]
    fn load_simple_definition() {
        let mut catalog = catalog();
        let templates = FieldTemplates::new();
        let content = "\
# type,circuit,level,name,comment,QQ,ZZ,PBSB,ID,field,part,type,divisor/values,unit,comment
r,heat,,flow,flow temperature,,08,b509,0d,temp,s,D2C,,°C,temperature
w,heat,,flow,,,08,b509,0e,temp,m,D2C,,°C,
";
        let result =
            load_definitions(&mut catalog, &templates, content, "test.csv", None).unwrap();
        assert_eq!(result.messages, 2);
        let read = catalog.find_by_name("heat", "flow", "*", false).unwrap();
        let message = catalog.get(read).unwrap();
        assert_eq!(message.dst, 0x08);
        assert_eq!(message.id(), [0xb5, 0x09, 0x0d]);
        assert_eq!(message.fields.len(), 1);
        catalog.find_by_name("heat", "flow", "*", true).unwrap();
    }

    #[test]
    fn defaults_row_applies() {
        let mut catalog = catalog();
        let templates = FieldTemplates::new();
        let content = "\
*r,main,,,,,15,b509,0d
r,,,outside,,,,,01,temp,s,D2B,,°C,
";
        load_definitions(&mut catalog, &templates, content, "test.csv", None).unwrap();
        let index = catalog.find_by_name("main", "outside", "*", false).unwrap();
        let message = catalog.get(index).unwrap();
        assert_eq!(message.dst, 0x15);
        assert_eq!(message.id(), [0xb5, 0x09, 0x0d, 0x01]);
    }

    #[test]
    fn poll_priority_and_level() {
        let mut catalog = catalog();
        let templates = FieldTemplates::new();
        let content = "r5,heat,install,yield,,,08,b503,,kwh,s,ULG,,kWh,\n";
        load_definitions(&mut catalog, &templates, content, "test.csv", None).unwrap();
        assert!(catalog.find_by_name("heat", "yield", "", false).is_none());
        let index = catalog.find_by_name("heat", "yield", "install", false).unwrap();
        assert_eq!(catalog.get(index).unwrap().poll_priority, 5);
    }

    #[test]
    fn template_reference() {
        let mut catalog = catalog();
        let mut templates = FieldTemplates::new();
        load_templates(
            &mut templates,
            &catalog,
            "temp,D2C,,°C,outside temperature\n",
            "_templates.csv",
        )
        .unwrap();
        let content = "r,heat,,flow,,,08,b509,0d,temp,s,,,,\n";
        load_definitions(&mut catalog, &templates, content, "test.csv", None).unwrap();
        let index = catalog.find_by_name("heat", "flow", "*", false).unwrap();
        let message = catalog.get(index).unwrap();
        assert_eq!(message.fields.fields()[0].unit, "°C");
    }

    #[test]
    fn conditional_definition() {
        let mut catalog = catalog();
        let templates = FieldTemplates::new();
        let content = "\
*[hasmode],heat,mode,,1
u,heat,,mode,,,08,b510,,mode,m,UCH,,,
[hasmode]r,heat,,flow,,,08,b509,0d,temp,s,D2C,,,
";
        load_definitions(&mut catalog, &templates, content, "test.csv", None).unwrap();
        catalog.resolve_conditions().unwrap();
        let index = catalog.find_by_name("heat", "flow", "*", false);
        assert!(index.is_none(), "conditional message starts inactive");

        let gate = catalog
            .find_all(&FindOptionsExt::named("heat", "mode"))
            .into_iter()
            .next()
            .unwrap();
        let master = crate::MasterFrame::parse_hex("3108b5100101").unwrap();
        let slave = crate::SlaveFrame::parse_hex("00").unwrap();
        catalog.store_last_data(gate, &master, &slave).unwrap();
        catalog.resolve_conditions().unwrap();
        let index = catalog.find_by_name("heat", "flow", "*", false).unwrap();
        let mut out = String::new();
        assert!(catalog
            .get(index)
            .unwrap()
            .decode_last_data(None, OutputFormat::NONE, &mut out)
            .is_err());
    }

    #[test]
    fn bad_row_is_annotated() {
        let mut catalog = catalog();
        let templates = FieldTemplates::new();
        let content = "r,heat,,flow,,,08,b5,0d,temp,s,D2C,,,\n";
        assert_eq!(
            load_definitions(&mut catalog, &templates, content, "test.csv", None),
            Err(Error::InvalidArgument)
        );
    }

    #[test]
    fn instruction_rows() {
        let mut catalog = catalog();
        let templates = FieldTemplates::new();
        let content = "\
!include,extra.csv
!read,heat,flow
r,heat,,flow,,,08,b509,0d,temp,s,D2C,,,
";
        let result =
            load_definitions(&mut catalog, &templates, content, "test.csv", None).unwrap();
        assert_eq!(result.includes, vec!["extra.csv"]);
        let mut reads = Vec::new();
        catalog
            .execute_instructions(|circuit, name| reads.push((circuit.to_string(), name.to_string())))
            .unwrap();
        assert_eq!(reads, vec![("heat".to_string(), "flow".to_string())]);
    }

    // helper mirroring the daemon's typical find_all usage
    struct FindOptionsExt;
    impl FindOptionsExt {
        fn named(circuit: &str, name: &str) -> crate::FindOptions {
            let mut options = crate::FindOptions::all();
            options.circuit = circuit.into();
            options.name = name.into();
            options
        }
    }
}
