//! Record codec: CSV header + row -> [`Reading`] on the producer side,
//! [`Reading`] <-> JSON object payload on the bus.

use crate::error::CodecError;
use crate::models::Reading;
use serde_json::Value;

/// Splits one delimited line, honouring quotes so `"Cairo, EG"` stays one value.
fn split_record(line: &str, delimiter: u8) -> Result<Vec<String>, CodecError> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .delimiter(delimiter)
        .from_reader(line.as_bytes());

    let mut record = csv::StringRecord::new();
    match reader.read_record(&mut record) {
        Ok(true) => Ok(record.iter().map(str::to_string).collect()),
        Ok(false) => Err(CodecError::EmptyRow),
        Err(e) => Err(CodecError::Decode {
            reason: format!("unparseable row {line:?}: {e}"),
        }),
    }
}

/// Parses the header row into ordered field names.
pub fn parse_header(line: &str, delimiter: u8) -> Result<Vec<String>, CodecError> {
    let line = line.trim_start_matches('\u{feff}').trim();
    if line.is_empty() {
        return Err(CodecError::EmptyRow);
    }
    Ok(split_record(line, delimiter)?
        .into_iter()
        .map(|name| name.trim().to_string())
        .collect())
}

/// Builds a reading from a data row. The value count must match the header exactly.
pub fn decode_row(header: &[String], line: &str, delimiter: u8) -> Result<Reading, CodecError> {
    let line = line.trim();
    if line.is_empty() {
        return Err(CodecError::EmptyRow);
    }

    let values = split_record(line, delimiter)?;
    if values.len() != header.len() {
        return Err(CodecError::MalformedRow {
            expected: header.len(),
            found: values.len(),
            line: line.to_string(),
        });
    }

    Ok(header.iter().cloned().zip(values).collect())
}

/// Transport encoding: a JSON object with field names exactly as in the header.
pub fn encode(reading: &Reading) -> serde_json::Result<String> {
    serde_json::to_string(reading)
}

/// Inverse of [`encode`]. Also accepts numeric / boolean values from other
/// producers; `null` means the field is absent.
pub fn decode_payload(payload: &[u8]) -> Result<Reading, CodecError> {
    let value: Value = serde_json::from_slice(payload).map_err(|e| CodecError::Decode {
        reason: format!("invalid JSON: {e}"),
    })?;

    let Value::Object(map) = value else {
        return Err(CodecError::Decode {
            reason: format!("expected a JSON object, got {}", kind_of(&value)),
        });
    };

    let mut reading = Reading::new();
    for (field, value) in map {
        match value {
            Value::Null => {}
            Value::String(s) => reading.insert(field, s),
            other => reading.insert(field, other.to_string()),
        }
    }
    Ok(reading)
}

fn kind_of(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header() -> Vec<String> {
        parse_header(
            "timestamp,city,temperature_c,humidity,pressure,wind_speed,weather",
            b',',
        )
        .unwrap()
    }

    #[test]
    fn quoted_delimiter_does_not_split_value() {
        let reading = decode_row(
            &header(),
            r#"2025-01-01T10:00:00Z,"Cairo, EG",36.2,15,1012,4.1,"clear sky""#,
            b',',
        )
        .unwrap();
        assert_eq!(reading.city(), "Cairo, EG");
        assert_eq!(reading.get("weather"), Some("clear sky"));
        assert_eq!(reading.get("temperature_c"), Some("36.2"));
    }

    #[test]
    fn field_count_mismatch_is_rejected() {
        let err = decode_row(&header(), "2025-01-01T10:00:00Z,Cairo,36.2", b',').unwrap_err();
        assert!(matches!(
            err,
            CodecError::MalformedRow { expected: 7, found: 3, .. }
        ));
    }

    #[test]
    fn empty_line_is_rejected() {
        assert!(matches!(decode_row(&header(), "   ", b','), Err(CodecError::EmptyRow)));
        assert!(matches!(parse_header("", b','), Err(CodecError::EmptyRow)));
    }

    #[test]
    fn header_strips_bom_and_whitespace() {
        let h = parse_header("\u{feff}timestamp, city ,temperature_c\r", b',').unwrap();
        assert_eq!(h, vec!["timestamp", "city", "temperature_c"]);
    }

    #[test]
    fn custom_delimiter() {
        let h = parse_header("city;humidity", b';').unwrap();
        let r = decode_row(&h, "Oslo;81", b';').unwrap();
        assert_eq!(r.get("humidity"), Some("81"));
    }

    #[test]
    fn payload_preserves_rule_fields() {
        let reading = decode_row(
            &header(),
            "2025-01-01T10:00:00Z,Cairo,36.2,15,1012,4.1,haze",
            b',',
        )
        .unwrap();
        let payload = encode(&reading).unwrap();
        let back = decode_payload(payload.as_bytes()).unwrap();
        for field in ["timestamp", "city", "temperature_c", "humidity", "pressure", "wind_speed"] {
            assert_eq!(back.get(field), reading.get(field), "field {field}");
        }
        assert_eq!(back, reading);
    }

    #[test]
    fn payload_accepts_numbers_and_skips_nulls() {
        let r = decode_payload(br#"{"temperature_c": 36.0, "humidity": null, "city": "Cairo"}"#)
            .unwrap();
        assert_eq!(r.get("temperature_c"), Some("36.0"));
        assert_eq!(r.get("humidity"), None);
    }

    #[test]
    fn non_object_payload_is_a_decode_error() {
        assert!(matches!(decode_payload(b"[1,2]"), Err(CodecError::Decode { .. })));
        assert!(matches!(decode_payload(b"not json"), Err(CodecError::Decode { .. })));
    }
}
