//! Persona tables in CSV form.
//!
//! Columns are matched by header name; unknown columns are ignored. List
//! columns hold `;`-separated values.

use std::collections::HashMap;
use std::io::{Read, Write};
use std::path::Path;

use super::{split_semicolons, PersonaError, PersonaSpec};

pub fn personas_from_csv_path(path: &Path) -> Result<Vec<PersonaSpec>, PersonaError> {
    let file = std::fs::File::open(path).map_err(|source| PersonaError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    personas_from_reader(file, &path.display().to_string())
}

pub fn personas_from_csv_str(text: &str) -> Result<Vec<PersonaSpec>, PersonaError> {
    personas_from_reader(text.as_bytes(), "inline persona CSV")
}

fn personas_from_reader<R: Read>(
    reader: R,
    source_name: &str,
) -> Result<Vec<PersonaSpec>, PersonaError> {
    let csv_err = |source| PersonaError::Csv {
        source_name: source_name.to_string(),
        source,
    };

    let mut rdr = ::csv::ReaderBuilder::new()
        .flexible(true)
        .trim(::csv::Trim::All)
        .from_reader(reader);

    let headers: Vec<String> = rdr
        .headers()
        .map_err(csv_err)?
        .iter()
        .map(|h| h.trim().to_ascii_lowercase())
        .collect();

    let mut personas = Vec::new();
    for record in rdr.records() {
        let record = record.map_err(csv_err)?;
        let row: HashMap<&str, &str> = headers
            .iter()
            .map(String::as_str)
            .zip(record.iter())
            .filter(|(_, v)| !v.is_empty())
            .collect();

        let get = |keys: &[&str]| -> Option<String> {
            keys.iter()
                .find_map(|k| row.get(k))
                .map(|v| v.to_string())
        };
        let list = |keys: &[&str]| get(keys).map(|v| split_semicolons(&v)).unwrap_or_default();
        let row_number = personas.len() + 1;

        let weight = match get(&["weight"]) {
            None => 1.0,
            Some(raw) => match raw.parse::<f64>() {
                Ok(w) if w.is_finite() && w >= 0.0 => w,
                Ok(w) => {
                    return Err(PersonaError::invalid(
                        source_name,
                        format!("row {row_number}: weight must be finite and >= 0, got {w}"),
                    ))
                }
                Err(_) => 1.0,
            },
        };

        personas.push(PersonaSpec {
            name: get(&["name"]).unwrap_or_else(|| format!("Persona {row_number}")),
            age: get(&["age"]),
            gender: get(&["gender"]),
            income: get(&["income"]),
            region: get(&["region"]),
            occupation: get(&["occupation"]),
            education: get(&["education"]),
            household: get(&["household"]),
            purchase_frequency: get(&["purchase_frequency", "purchase_freq"]),
            usage_context: get(&["usage", "usage_context"]),
            background: get(&["background"]),
            habits: list(&["habits"]),
            motivations: list(&["motivations"]),
            pain_points: list(&["pain_points"]),
            preferred_channels: list(&["preferred_channels"]),
            notes: get(&["notes"]),
            source: get(&["persona_source", "source"]),
            descriptors: list(&["descriptors", "traits"]),
            weight,
            context: Vec::new(),
        });
    }

    if personas.is_empty() {
        return Err(PersonaError::invalid(
            source_name,
            "CSV did not yield any personas",
        ));
    }
    Ok(personas)
}

const CSV_COLUMNS: [&str; 19] = [
    "name",
    "age",
    "gender",
    "income",
    "region",
    "occupation",
    "education",
    "household",
    "purchase_frequency",
    "usage_context",
    "background",
    "habits",
    "motivations",
    "pain_points",
    "preferred_channels",
    "descriptors",
    "notes",
    "source",
    "weight",
];

/// Writes personas with the columns the reader understands; weights get six
/// decimals.
pub fn write_personas_csv<W: Write>(writer: W, personas: &[PersonaSpec]) -> Result<(), PersonaError> {
    let csv_err = |source| PersonaError::Csv {
        source_name: "persona CSV output".to_string(),
        source,
    };
    let opt = |v: &Option<String>| v.clone().unwrap_or_default();
    let join = |v: &[String]| v.join(";");

    let mut wtr = ::csv::Writer::from_writer(writer);
    wtr.write_record(CSV_COLUMNS).map_err(csv_err)?;
    for p in personas {
        wtr.write_record([
            p.name.clone(),
            opt(&p.age),
            opt(&p.gender),
            opt(&p.income),
            opt(&p.region),
            opt(&p.occupation),
            opt(&p.education),
            opt(&p.household),
            opt(&p.purchase_frequency),
            opt(&p.usage_context),
            opt(&p.background),
            join(&p.habits),
            join(&p.motivations),
            join(&p.pain_points),
            join(&p.preferred_channels),
            join(&p.descriptors),
            opt(&p.notes),
            opt(&p.source),
            format!("{:.6}", p.weight),
        ])
        .map_err(csv_err)?;
    }
    wtr.flush().map_err(|source| PersonaError::Csv {
        source_name: "persona CSV output".to_string(),
        source: source.into(),
    })?;
    Ok(())
}
