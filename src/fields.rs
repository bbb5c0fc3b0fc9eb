//! The fixed set of values exposed for every thermostat.
//!
//! Each [`FieldDescriptor`] says how to pull a typed [`FieldValue`] out of a [`LogRow`] and
//! which icon represents that value. Entities are built from this table; there is no
//! per-field entity type.

use crate::store::LogRow;

/// Battery voltage above which the battery is reported as full.
pub const BATTERY_FULL_VOLTS: f64 = 2.4;
/// Battery voltage above which the battery is reported as half full.
pub const BATTERY_HALF_VOLTS: f64 = 2.2;

#[derive(Clone, Copy, Debug, PartialEq, Eq, strum::IntoStaticStr)]
#[strum(serialize_all = "kebab-case")]
pub enum FieldKind {
    Text,
    Integer,
    Float,
    Boolean,
}

#[derive(Clone, Debug, PartialEq)]
pub enum FieldValue {
    /// Mode code as reported by the thermostat (e.g. `A`, `M`, `I`).
    Text(String),
    Percent(i64),
    /// Hundredths of a degree Celsius.
    Celsius(i64),
    /// Millivolts.
    Volts(i64),
    Flag(bool),
}

/// Degrees Celsius from the hundredths stored in the log.
pub fn celsius(centi: i64) -> f64 {
    centi as f64 / 100.0
}

/// Volts from the millivolts stored in the log.
pub fn volts(milli: i64) -> f64 {
    milli as f64 / 1000.0
}

/// Both thresholds are exclusive: exactly 2.4V is `half` and exactly 2.2V is `low`.
pub fn battery_icon(volts: f64) -> &'static str {
    if volts > BATTERY_FULL_VOLTS {
        "full"
    } else if volts > BATTERY_HALF_VOLTS {
        "half"
    } else {
        "low"
    }
}

impl FieldValue {
    pub fn as_f64(&self) -> Option<f64> {
        match *self {
            FieldValue::Text(_) | FieldValue::Flag(_) => None,
            FieldValue::Percent(v) => Some(v as f64),
            FieldValue::Celsius(v) => Some(celsius(v)),
            FieldValue::Volts(v) => Some(volts(v)),
        }
    }

    pub fn is_set(&self) -> bool {
        matches!(self, FieldValue::Flag(true))
    }
}

impl std::fmt::Display for FieldValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FieldValue::Text(t) => f.write_str(t),
            FieldValue::Percent(v) => write!(f, "{v}"),
            FieldValue::Celsius(v) => write!(f, "{:.2}", celsius(*v)),
            FieldValue::Volts(v) => write!(f, "{:.3}", volts(*v)),
            FieldValue::Flag(v) => write!(f, "{v}"),
        }
    }
}

impl serde::Serialize for FieldValue {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            FieldValue::Text(t) => serializer.serialize_str(t),
            FieldValue::Percent(v) => serializer.serialize_i64(*v),
            FieldValue::Celsius(v) => serializer.serialize_f64(celsius(*v)),
            FieldValue::Volts(v) => serializer.serialize_f64(volts(*v)),
            FieldValue::Flag(v) => serializer.serialize_bool(*v),
        }
    }
}

pub struct FieldDescriptor {
    /// Stable identifier, part of the entity unique id.
    pub key: &'static str,
    pub name: &'static str,
    pub unit: Option<&'static str>,
    pub kind: FieldKind,
    pub extract: fn(&LogRow) -> FieldValue,
    pub icon: fn(&FieldValue) -> &'static str,
    /// Every icon `icon` may return, for listings. The first one is shown until a value is read.
    pub icons: &'static [&'static str],
}

impl std::fmt::Debug for FieldDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FieldDescriptor").field("key", &self.key).finish_non_exhaustive()
    }
}

pub static FIELDS: [FieldDescriptor; 8] = [
    FieldDescriptor {
        key: "mode",
        name: "mode",
        unit: None,
        kind: FieldKind::Text,
        extract: |row| FieldValue::Text(row.mode.clone()),
        icon: |_| "thermostat",
        icons: &["thermostat"],
    },
    FieldDescriptor {
        key: "valve",
        name: "valve opening",
        unit: Some("%"),
        kind: FieldKind::Integer,
        extract: |row| FieldValue::Percent(row.valve_percent_open),
        icon: |_| "percent",
        icons: &["percent"],
    },
    FieldDescriptor {
        key: "current-temperature",
        name: "current temperature",
        unit: Some("°C"),
        kind: FieldKind::Float,
        extract: |row| FieldValue::Celsius(row.current_temp_centi),
        icon: |_| "thermometer",
        icons: &["thermometer"],
    },
    FieldDescriptor {
        key: "target-temperature",
        name: "target temperature",
        unit: Some("°C"),
        kind: FieldKind::Float,
        extract: |row| FieldValue::Celsius(row.target_temp_centi),
        icon: |_| "thermometer",
        icons: &["thermometer"],
    },
    FieldDescriptor {
        key: "battery-voltage",
        name: "battery voltage",
        unit: Some("V"),
        kind: FieldKind::Float,
        extract: |row| FieldValue::Volts(row.battery_millivolts),
        icon: |v| battery_icon(v.as_f64().unwrap_or(0.0)),
        icons: &["low", "half", "full"],
    },
    FieldDescriptor {
        key: "error",
        name: "error",
        unit: None,
        kind: FieldKind::Boolean,
        extract: |row| FieldValue::Flag(row.error_flag_raw != 0),
        icon: |v| if v.is_set() { "alert" } else { "ok" },
        icons: &["ok", "alert"],
    },
    FieldDescriptor {
        key: "window",
        name: "window",
        unit: None,
        kind: FieldKind::Boolean,
        extract: |row| FieldValue::Flag(row.window_open_raw != 0),
        icon: |v| if v.is_set() { "open" } else { "closed" },
        icons: &["closed", "open"],
    },
    FieldDescriptor {
        key: "force",
        name: "forced heating",
        unit: None,
        kind: FieldKind::Boolean,
        extract: |row| FieldValue::Flag(row.force_raw != 0),
        icon: |v| if v.is_set() { "on" } else { "off" },
        icons: &["off", "on"],
    },
];

pub fn field_by_key(key: &str) -> Option<&'static FieldDescriptor> {
    FIELDS.iter().find(|field| field.key == key)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn sample_row() -> LogRow {
        LogRow {
            address: "10".to_string(),
            id: 1,
            time: jiff::Timestamp::from_second(1000).unwrap(),
            mode: "I".to_string(),
            valve_percent_open: 42,
            current_temp_centi: 2150,
            target_temp_centi: 2200,
            battery_millivolts: 2950,
            error_flag_raw: 0,
            window_open_raw: 0,
            force_raw: 1,
        }
    }

    fn project(key: &str, row: &LogRow) -> (FieldValue, &'static str) {
        let field = field_by_key(key).unwrap();
        let value = (field.extract)(row);
        let icon = (field.icon)(&value);
        (value, icon)
    }

    #[test]
    fn scaling_is_exact_division() {
        for raw in [-500, 0, 1, 99, 2150, 2200, 2999, 123456] {
            assert_eq!(celsius(raw), raw as f64 / 100.0);
            assert_eq!(volts(raw), raw as f64 / 1000.0);
        }
        assert_eq!(celsius(2150), 21.5);
        assert_eq!(volts(2950), 2.95);
    }

    #[test]
    fn battery_thresholds_are_exclusive() {
        assert_eq!(battery_icon(2.41), "full");
        assert_eq!(battery_icon(2.40), "half");
        assert_eq!(battery_icon(2.21), "half");
        assert_eq!(battery_icon(2.20), "low");
        assert_eq!(battery_icon(0.0), "low");
        // Voltages derived from the raw millivolts land on the same boundaries.
        assert_eq!(battery_icon(volts(2400)), "half");
        assert_eq!(battery_icon(volts(2200)), "low");
        assert_eq!(battery_icon(volts(2401)), "full");
    }

    #[test]
    fn flags_are_nonzero_raw_values() {
        let mut row = sample_row();
        for (raw, expected) in [(0, false), (1, true), (2, true), (-1, true)] {
            row.error_flag_raw = raw;
            row.window_open_raw = raw;
            row.force_raw = raw;
            for key in ["error", "window", "force"] {
                assert_eq!(project(key, &row).0, FieldValue::Flag(expected), "{key} {raw}");
            }
        }
    }

    #[test]
    fn sample_row_projection() {
        let row = sample_row();
        assert_eq!(project("mode", &row), (FieldValue::Text("I".into()), "thermostat"));
        assert_eq!(project("valve", &row), (FieldValue::Percent(42), "percent"));
        assert_eq!(project("current-temperature", &row).0.as_f64(), Some(21.5));
        assert_eq!(project("target-temperature", &row).0.as_f64(), Some(22.0));
        assert_eq!(project("battery-voltage", &row), (FieldValue::Volts(2950), "full"));
        assert_eq!(project("error", &row), (FieldValue::Flag(false), "ok"));
        assert_eq!(project("window", &row), (FieldValue::Flag(false), "closed"));
        assert_eq!(project("force", &row), (FieldValue::Flag(true), "on"));
    }

    #[test]
    fn rendering_keeps_fixed_precision() {
        assert_eq!(FieldValue::Celsius(2150).to_string(), "21.50");
        assert_eq!(FieldValue::Celsius(2200).to_string(), "22.00");
        assert_eq!(FieldValue::Volts(2950).to_string(), "2.950");
        assert_eq!(FieldValue::Flag(true).to_string(), "true");
        assert_eq!(
            serde_json::to_string(&[FieldValue::Celsius(2150), FieldValue::Flag(false)]).unwrap(),
            "[21.5,false]"
        );
    }

    #[test]
    fn keys_are_unique_and_icons_listed() {
        let row = sample_row();
        for (idx, field) in FIELDS.iter().enumerate() {
            assert!(FIELDS[idx + 1..].iter().all(|other| other.key != field.key));
            let icon = (field.icon)(&(field.extract)(&row));
            assert!(field.icons.contains(&icon), "{} -> {icon}", field.key);
        }
    }
}
