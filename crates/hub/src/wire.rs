//! Line protocol spoken by the measurement device: inbound readings and the
//! outbound command vocabulary.
//!
//! ```text
//! soil_moisture,sensor_id=0 value=277 1724263913297627400
//! dht,humidity=55.0,temperature=21.5,sensor_id=1 value=55.0;21.5 1724263913297627400
//! ```

use std::fmt;

// ---------------------------------------------------------------------------
// Inbound readings
// ---------------------------------------------------------------------------

/// The `value=` field of a reading.  Compound sensors (DHT) report several
/// sub-fields separated by `;`, named after the non-`sensor_id` tags.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Single(f64),
    Compound(Vec<(String, f64)>),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Measurement {
    pub measurement: String,
    /// Tags in wire order.
    pub tags: Vec<(String, String)>,
    pub sensor_id: String,
    pub value: FieldValue,
    pub timestamp_ns: i64,
}

impl Measurement {
    pub fn label(&self) -> String {
        channel_label(&self.measurement, &self.sensor_id)
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum DecodeError {
    #[error("empty line")]
    Empty,
    #[error("missing tag section")]
    MissingTags,
    #[error("malformed tag '{0}'")]
    MalformedTag(String),
    #[error("missing sensor_id tag")]
    MissingSensorId,
    #[error("missing value field")]
    MissingValue,
    #[error("invalid value '{0}'")]
    InvalidValue(String),
    #[error("missing timestamp")]
    MissingTimestamp,
    #[error("invalid timestamp '{0}'")]
    InvalidTimestamp(String),
}

/// Channel label used throughout the hub: `"{measurement}_{sensor_id}"`.
pub fn channel_label(measurement: &str, sensor_id: &str) -> String {
    format!("{measurement}_{sensor_id}")
}

/// Decode one line of the device's line protocol.
pub fn parse_line(line: &str) -> Result<Measurement, DecodeError> {
    let mut parts = line.split_whitespace();
    let series = parts.next().ok_or(DecodeError::Empty)?;
    let field = parts.next().ok_or(DecodeError::MissingValue)?;
    let ts = parts.next().ok_or(DecodeError::MissingTimestamp)?;

    let (measurement, tag_str) = series.split_once(',').ok_or(DecodeError::MissingTags)?;
    if measurement.is_empty() {
        return Err(DecodeError::MissingTags);
    }

    let mut tags = Vec::new();
    for tag in tag_str.split(',') {
        match tag.split_once('=') {
            Some((k, v)) if !k.is_empty() => tags.push((k.to_string(), v.to_string())),
            _ => return Err(DecodeError::MalformedTag(tag.to_string())),
        }
    }

    let sensor_id = tags
        .iter()
        .find(|(k, _)| k == "sensor_id")
        .map(|(_, v)| v.clone())
        .filter(|v| !v.is_empty())
        .ok_or(DecodeError::MissingSensorId)?;

    let raw = match field.split_once('=') {
        Some(("value", raw)) => raw,
        _ => return Err(DecodeError::MissingValue),
    };

    let value = if raw.contains(';') {
        let values = raw
            .split(';')
            .map(parse_finite)
            .collect::<Result<Vec<_>, _>>()?;
        let names: Vec<&str> = tags
            .iter()
            .filter(|(k, _)| k != "sensor_id")
            .map(|(k, _)| k.as_str())
            .collect();
        let named = names.len() == values.len();
        let fields = values
            .into_iter()
            .enumerate()
            .map(|(i, v)| {
                let name = if named {
                    names[i].to_string()
                } else {
                    format!("field_{i}")
                };
                (name, v)
            })
            .collect();
        FieldValue::Compound(fields)
    } else {
        FieldValue::Single(parse_finite(raw)?)
    };

    Ok(Measurement {
        measurement: measurement.to_string(),
        tags,
        sensor_id,
        value,
        timestamp_ns: parse_timestamp(ts)?,
    })
}

/// Best-effort channel label for a line that failed to decode, so the
/// failure can be attributed to the right channel.
pub fn recover_label(line: &str) -> Option<String> {
    let series = line.split_whitespace().next()?;
    let (measurement, tags) = series.split_once(',')?;
    if measurement.is_empty() {
        return None;
    }
    tags.split(',')
        .find_map(|t| t.strip_prefix("sensor_id="))
        .filter(|id| !id.is_empty())
        .map(|id| channel_label(measurement, id))
}

fn parse_finite(s: &str) -> Result<f64, DecodeError> {
    match s.trim().parse::<f64>() {
        Ok(v) if v.is_finite() => Ok(v),
        _ => Err(DecodeError::InvalidValue(s.to_string())),
    }
}

/// Unix nanoseconds; fractional unix seconds are accepted too since older
/// proxies emit them.
fn parse_timestamp(s: &str) -> Result<i64, DecodeError> {
    if let Ok(ns) = s.parse::<i64>() {
        return Ok(ns);
    }
    match s.parse::<f64>() {
        Ok(secs) if secs.is_finite() && secs >= 0.0 => Ok((secs * 1e9) as i64),
        _ => Err(DecodeError::InvalidTimestamp(s.to_string())),
    }
}

// ---------------------------------------------------------------------------
// Topics
// ---------------------------------------------------------------------------

/// Topic the device publishes readings of a sensor type on.
pub fn sensor_topic(kind: &str) -> String {
    format!("sensor/{kind}")
}

/// Topic processed aggregates are republished on.
pub fn processed_topic(topic: &str) -> String {
    format!("processed_{topic}")
}

// ---------------------------------------------------------------------------
// Outbound commands
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceCommand {
    SetInterval(u64),
    AddSensor { pin: String, kind: String, id: String },
    RemoveSensor { pin: String },
    ClearAll,
    Restart,
}

impl fmt::Display for DeviceCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SetInterval(ms) => write!(f, "SET_INTERVAL {ms}"),
            Self::AddSensor { pin, kind, id } => write!(f, "ADD_SENSOR {pin} {kind} {id}"),
            Self::RemoveSensor { pin } => write!(f, "REMOVE_SENSOR {pin}"),
            Self::ClearAll => write!(f, "CLEAR_ALL"),
            Self::Restart => write!(f, "RESTART"),
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    // -- parse_line: valid input ---------------------------------------------

    #[test]
    fn parse_single_value_line() {
        let m = parse_line("soil_moisture,sensor_id=0 value=277 1724263913297627400").unwrap();
        assert_eq!(m.measurement, "soil_moisture");
        assert_eq!(m.sensor_id, "0");
        assert_eq!(m.value, FieldValue::Single(277.0));
        assert_eq!(m.timestamp_ns, 1_724_263_913_297_627_400);
        assert_eq!(m.label(), "soil_moisture_0");
    }

    #[test]
    fn parse_keeps_extra_tags_in_order() {
        let m = parse_line("soil_moisture,room=tent,sensor_id=3 value=512.5 1").unwrap();
        assert_eq!(
            m.tags,
            vec![
                ("room".to_string(), "tent".to_string()),
                ("sensor_id".to_string(), "3".to_string()),
            ]
        );
        assert_eq!(m.value, FieldValue::Single(512.5));
    }

    #[test]
    fn parse_compound_value_names_fields_after_tags() {
        let m = parse_line(
            "dht,humidity=55.0,temperature=21.5,sensor_id=1 value=55.0;21.5 1724263913297627400",
        )
        .unwrap();
        assert_eq!(m.label(), "dht_1");
        assert_eq!(
            m.value,
            FieldValue::Compound(vec![
                ("humidity".to_string(), 55.0),
                ("temperature".to_string(), 21.5),
            ])
        );
    }

    #[test]
    fn parse_compound_value_falls_back_to_positional_names() {
        let m = parse_line("dht,sensor_id=1 value=55.0;21.5 1").unwrap();
        assert_eq!(
            m.value,
            FieldValue::Compound(vec![
                ("field_0".to_string(), 55.0),
                ("field_1".to_string(), 21.5),
            ])
        );
    }

    #[test]
    fn parse_fractional_seconds_timestamp() {
        let m = parse_line("soil_moisture,sensor_id=0 value=277 1724263913.5").unwrap();
        assert_eq!(m.timestamp_ns, 1_724_263_913_500_000_000);
    }

    // -- parse_line: malformed input -----------------------------------------

    #[test]
    fn parse_empty_line() {
        assert_eq!(parse_line("   "), Err(DecodeError::Empty));
    }

    #[test]
    fn parse_missing_value_field() {
        assert_eq!(
            parse_line("soil_moisture,sensor_id=0 reading=277 1"),
            Err(DecodeError::MissingValue)
        );
    }

    #[test]
    fn parse_missing_timestamp() {
        assert_eq!(
            parse_line("soil_moisture,sensor_id=0 value=277"),
            Err(DecodeError::MissingTimestamp)
        );
    }

    #[test]
    fn parse_missing_tags() {
        assert_eq!(parse_line("soil_moisture value=1 1"), Err(DecodeError::MissingTags));
    }

    #[test]
    fn parse_missing_sensor_id() {
        assert_eq!(
            parse_line("soil_moisture,room=tent value=1 1"),
            Err(DecodeError::MissingSensorId)
        );
    }

    #[test]
    fn parse_malformed_tag() {
        assert_eq!(
            parse_line("soil_moisture,sensor_id value=1 1"),
            Err(DecodeError::MalformedTag("sensor_id".into()))
        );
    }

    #[test]
    fn parse_non_numeric_value() {
        assert_eq!(
            parse_line("soil_moisture,sensor_id=0 value=abc 1"),
            Err(DecodeError::InvalidValue("abc".into()))
        );
    }

    #[test]
    fn parse_rejects_nan() {
        assert!(matches!(
            parse_line("soil_moisture,sensor_id=0 value=NaN 1"),
            Err(DecodeError::InvalidValue(_))
        ));
    }

    #[test]
    fn parse_garbage_timestamp() {
        assert_eq!(
            parse_line("soil_moisture,sensor_id=0 value=1 soon"),
            Err(DecodeError::InvalidTimestamp("soon".into()))
        );
    }

    // -- recover_label -------------------------------------------------------

    #[test]
    fn recover_label_from_line_without_value() {
        assert_eq!(
            recover_label("soil_moisture,sensor_id=4 1724263913"),
            Some("soil_moisture_4".to_string())
        );
    }

    #[test]
    fn recover_label_none_without_sensor_id() {
        assert_eq!(recover_label("soil_moisture,room=a value=1 1"), None);
        assert_eq!(recover_label("garbage"), None);
        assert_eq!(recover_label(""), None);
    }

    // -- topics --------------------------------------------------------------

    #[test]
    fn topic_helpers() {
        assert_eq!(sensor_topic("soil_moisture"), "sensor/soil_moisture");
        assert_eq!(processed_topic("sensor/dht"), "processed_sensor/dht");
    }

    // -- DeviceCommand -------------------------------------------------------

    #[test]
    fn commands_render_as_space_delimited_tokens() {
        assert_eq!(DeviceCommand::SetInterval(500).to_string(), "SET_INTERVAL 500");
        assert_eq!(
            DeviceCommand::AddSensor {
                pin: "A0".into(),
                kind: "soil_moisture".into(),
                id: "0".into(),
            }
            .to_string(),
            "ADD_SENSOR A0 soil_moisture 0"
        );
        assert_eq!(
            DeviceCommand::RemoveSensor { pin: "A0".into() }.to_string(),
            "REMOVE_SENSOR A0"
        );
        assert_eq!(DeviceCommand::ClearAll.to_string(), "CLEAR_ALL");
        assert_eq!(DeviceCommand::Restart.to_string(), "RESTART");
    }
}
