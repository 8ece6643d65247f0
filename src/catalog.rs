use crate::api::{Feature, FeatureSet, Property, ValueError};

/// A value read from the backend.
///
/// The feature endpoint is loosely typed, so a property that is numeric on
/// one appliance generation may be a string on another. Whatever arrives is
/// carried as-is.
#[derive(Clone, Debug, PartialEq)]
pub enum Reading {
    Float(f64),
    Integer(i64),
    Text(String),
}

impl Reading {
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Reading::Float(value) => Some(*value),
            Reading::Integer(value) => Some(*value as f64),
            Reading::Text(_) => None,
        }
    }
}

impl std::fmt::Display for Reading {
    fn fmt(&self, fmt: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Reading::Float(value) => write!(fmt, "{value}"),
            Reading::Integer(value) => write!(fmt, "{value}"),
            Reading::Text(value) => fmt.write_str(value),
        }
    }
}

impl serde::Serialize for Reading {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Reading::Float(value) => serializer.serialize_f64(*value),
            Reading::Integer(value) => serializer.serialize_i64(*value),
            Reading::Text(value) => serializer.serialize_str(value),
        }
    }
}

/// Measurement unit, as declared in the catalogs or reported on the wire.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Unit {
    Celsius,
    KilowattHour,
    CubicMeter,
    Watt,
    Percent,
    Hour,
}

impl Unit {
    /// Parse the unit name used by the feature endpoint.
    pub fn from_wire(name: &str) -> Option<Self> {
        Some(match name {
            "celsius" => Unit::Celsius,
            "kilowattHour" => Unit::KilowattHour,
            "cubicMeter" => Unit::CubicMeter,
            "watt" => Unit::Watt,
            "percent" => Unit::Percent,
            "hour" => Unit::Hour,
            _ => return None,
        })
    }

    pub fn symbol(&self) -> &'static str {
        match self {
            Unit::Celsius => "°C",
            Unit::KilowattHour => "kWh",
            Unit::CubicMeter => "m³",
            Unit::Watt => "W",
            Unit::Percent => "%",
            Unit::Hour => "h",
        }
    }

    /// Device class implied by the unit alone.
    ///
    /// Gas consumption is metered in kWh or m³ depending on the
    /// installation, so consumption descriptions resolve their class from
    /// the reported unit when they carry no static one.
    pub fn device_class(&self) -> Option<DeviceClass> {
        match self {
            Unit::KilowattHour => Some(DeviceClass::Energy),
            Unit::CubicMeter => Some(DeviceClass::Gas),
            _ => None,
        }
    }
}

impl std::fmt::Display for Unit {
    fn fmt(&self, fmt: &mut std::fmt::Formatter) -> std::fmt::Result {
        fmt.write_str(self.symbol())
    }
}

impl serde::Serialize for Unit {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.symbol())
    }
}

#[derive(
    Clone, Copy, Debug, PartialEq, Eq, serde::Serialize, strum::Display, strum::IntoStaticStr,
)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum DeviceClass {
    Energy,
    Gas,
    Power,
    Temperature,
}

/// Long term statistics treatment of a published value.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, serde::Serialize, strum::Display, strum::IntoStaticStr,
)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum StateClass {
    Measurement,
    TotalIncreasing,
}

/// Successful probe of one description against one scope.
#[derive(Clone, Debug, PartialEq)]
pub struct Sample {
    pub value: Reading,
    /// Unit reported by the backend alongside the value, if any.
    pub unit: Option<Unit>,
}

/// One probing scope over a feature listing.
///
/// The prefix is empty for the appliance itself, or names a collection
/// member such as `heating.circuits.1`. Description getters address
/// features relative to it.
#[derive(Clone, Copy)]
pub struct Source<'a> {
    features: &'a FeatureSet,
    prefix: &'a str,
}

impl<'a> Source<'a> {
    pub fn new(features: &'a FeatureSet, prefix: &'a str) -> Self {
        Self { features, prefix }
    }

    fn feature(&self, name: &str) -> Result<&'a Feature, ValueError> {
        if self.prefix.is_empty() {
            self.features.feature(name)
        } else {
            self.features.feature(&format!("{}.{}", self.prefix, name))
        }
    }

    /// Read a scalar property of a feature.
    pub fn value(&self, feature: &str, property: &str) -> Result<Sample, ValueError> {
        let feature = self.feature(feature)?;
        sample(feature, property, feature.property(property)?)
    }

    /// Read the head of a consumption series, the entry covering the
    /// current period.
    pub fn series_head(&self, feature: &str, property: &str) -> Result<Sample, ValueError> {
        let feature = self.feature(feature)?;
        let series = feature.property(property)?;
        let malformed = || ValueError::Malformed(feature.feature.clone(), property.to_string());
        let head = series
            .value
            .as_ref()
            .and_then(|value| value.as_array())
            .and_then(|entries| entries.first())
            .ok_or_else(malformed)?;
        Ok(Sample {
            value: reading(feature, property, head)?,
            unit: series.unit.as_deref().and_then(Unit::from_wire),
        })
    }
}

fn sample(feature: &Feature, name: &str, property: &Property) -> Result<Sample, ValueError> {
    let value = property.value.as_ref().ok_or_else(|| {
        ValueError::PropertyMissing(feature.feature.clone(), name.to_string())
    })?;
    Ok(Sample {
        value: reading(feature, name, value)?,
        unit: property.unit.as_deref().and_then(Unit::from_wire),
    })
}

fn reading(feature: &Feature, name: &str, value: &serde_json::Value) -> Result<Reading, ValueError> {
    match value {
        serde_json::Value::Number(number) => {
            if let Some(value) = number.as_i64() {
                Ok(Reading::Integer(value))
            } else if let Some(value) = number.as_f64() {
                Ok(Reading::Float(value))
            } else {
                Err(ValueError::Malformed(feature.feature.clone(), name.to_string()))
            }
        }
        serde_json::Value::String(text) => Ok(Reading::Text(text.clone())),
        _ => Err(ValueError::Malformed(feature.feature.clone(), name.to_string())),
    }
}

/// Static description of one published measurement.
#[derive(Clone, Copy)]
pub struct SensorSpec {
    /// Stable identifier within its catalog.
    pub key: &'static str,
    /// Human readable name. Discovery prefixes it with the account name.
    pub name: &'static str,
    /// Unit to assume when the backend does not report one.
    pub unit: Option<Unit>,
    pub device_class: Option<DeviceClass>,
    pub state_class: Option<StateClass>,
    pub icon: Option<&'static str>,
    /// Extract the current value from a probing scope.
    pub read: fn(&Source<'_>) -> Result<Sample, ValueError>,
}

const BLANK: SensorSpec = SensorSpec {
    key: "",
    name: "",
    unit: None,
    device_class: None,
    state_class: None,
    icon: None,
    read: |_| Err(ValueError::FeatureMissing(String::new())),
};

macro_rules! sensors {
    ($(
        $key:literal, $name:literal
        $(, unit: $unit:ident)?
        $(, class: $class:ident)?
        $(, state: $state:ident)?
        $(, icon: $icon:literal)?
        => $read:expr;
    )*) => {
        [$(SensorSpec {
            key: $key,
            name: $name,
            $(unit: Some(Unit::$unit),)?
            $(device_class: Some(DeviceClass::$class),)?
            $(state_class: Some(StateClass::$state),)?
            $(icon: Some($icon),)?
            read: $read,
            ..BLANK
        }),*]
    };
}

/// Descriptions probed once against the appliance itself.
pub static GLOBAL_SENSORS: [SensorSpec; 16] = sensors![
    "outside_temperature", "Outside Temperature", unit: Celsius, class: Temperature
        => |s| s.value("heating.sensors.temperature.outside", "value");
    "return_temperature", "Return Temperature", unit: Celsius, class: Temperature
        => |s| s.value("heating.sensors.temperature.return", "value");
    "boiler_temperature", "Boiler Temperature", unit: Celsius, class: Temperature
        => |s| s.value("heating.boiler.sensors.temperature.main", "value");
    "hotwater_gas_consumption_today", "Hot water gas consumption today",
        unit: KilowattHour, class: Gas
        => |s| s.series_head("heating.gas.consumption.dhw", "day");
    "hotwater_gas_consumption_heating_this_week", "Hot water gas consumption this week",
        unit: KilowattHour, class: Gas, state: TotalIncreasing
        => |s| s.series_head("heating.gas.consumption.dhw", "week");
    "hotwater_gas_consumption_heating_this_month", "Hot water gas consumption this month",
        unit: KilowattHour, class: Gas, state: TotalIncreasing
        => |s| s.series_head("heating.gas.consumption.dhw", "month");
    "hotwater_gas_consumption_heating_this_year", "Hot water gas consumption this year",
        unit: KilowattHour, class: Energy, state: TotalIncreasing
        => |s| s.series_head("heating.gas.consumption.dhw", "year");
    "gas_consumption_heating_today", "Heating gas consumption today",
        unit: KilowattHour, class: Gas, state: TotalIncreasing
        => |s| s.series_head("heating.gas.consumption.total", "day");
    "gas_consumption_heating_this_week", "Heating gas consumption this week",
        unit: KilowattHour, class: Gas, state: TotalIncreasing
        => |s| s.series_head("heating.gas.consumption.total", "week");
    "gas_consumption_heating_this_month", "Heating gas consumption this month",
        unit: KilowattHour, class: Gas, state: TotalIncreasing
        => |s| s.series_head("heating.gas.consumption.total", "month");
    "gas_consumption_heating_this_year", "Heating gas consumption this year",
        unit: KilowattHour, class: Energy, state: TotalIncreasing
        => |s| s.series_head("heating.gas.consumption.total", "year");
    "power_production_current", "Power production current", unit: Watt, class: Power
        => |s| s.value("heating.power.production.current", "value");
    "power_production_today", "Power production today", unit: KilowattHour, class: Energy
        => |s| s.series_head("heating.power.production", "day");
    "power_production_this_week", "Power production this week", unit: KilowattHour, class: Energy
        => |s| s.series_head("heating.power.production", "week");
    "power_production_this_month", "Power production this month", unit: KilowattHour, class: Energy
        => |s| s.series_head("heating.power.production", "month");
    "power_production_this_year", "Power production this year", unit: KilowattHour, class: Energy
        => |s| s.series_head("heating.power.production", "year");
];

/// Descriptions probed against every heating circuit.
pub static CIRCUIT_SENSORS: [SensorSpec; 1] = sensors![
    "supply_temperature", "Supply Temperature", unit: Celsius
        => |s| s.value("sensors.temperature.supply", "value");
];

/// Descriptions probed against every burner.
pub static BURNER_SENSORS: [SensorSpec; 3] = sensors![
    "burner_starts", "Burner Starts", icon: "mdi:counter"
        => |s| s.value("statistics", "starts");
    "burner_hours", "Burner Hours", unit: Hour, icon: "mdi:counter"
        => |s| s.value("statistics", "hours");
    "burner_modulation", "Burner Modulation", unit: Percent, icon: "mdi:percent"
        => |s| s.value("modulation", "value");
];

/// Descriptions probed against every compressor.
pub static COMPRESSOR_SENSORS: [SensorSpec; 7] = sensors![
    "compressor_starts", "Compressor Starts", icon: "mdi:counter"
        => |s| s.value("statistics", "starts");
    "compressor_hours", "Compressor Hours", unit: Hour, icon: "mdi:counter"
        => |s| s.value("statistics", "hours");
    "compressor_hours_loadclass1", "Compressor Hours Load Class 1", unit: Hour, icon: "mdi:counter"
        => |s| s.value("statistics", "hoursLoadClassOne");
    "compressor_hours_loadclass2", "Compressor Hours Load Class 2", unit: Hour, icon: "mdi:counter"
        => |s| s.value("statistics", "hoursLoadClassTwo");
    "compressor_hours_loadclass3", "Compressor Hours Load Class 3", unit: Hour, icon: "mdi:counter"
        => |s| s.value("statistics", "hoursLoadClassThree");
    "compressor_hours_loadclass4", "Compressor Hours Load Class 4", unit: Hour, icon: "mdi:counter"
        => |s| s.value("statistics", "hoursLoadClassFour");
    "compressor_hours_loadclass5", "Compressor Hours Load Class 5", unit: Hour, icon: "mdi:counter"
        => |s| s.value("statistics", "hoursLoadClassFive");
];

/// The four description catalogs, in discovery order.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, serde::Serialize, strum::Display, strum::IntoStaticStr,
)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum Collection {
    Device,
    Circuit,
    Burner,
    Compressor,
}

impl Collection {
    pub const ALL: [Collection; 4] = [
        Collection::Device,
        Collection::Circuit,
        Collection::Burner,
        Collection::Compressor,
    ];

    /// Descriptions probed against each scope of this collection.
    pub fn sensors(&self) -> &'static [SensorSpec] {
        match self {
            Collection::Device => &GLOBAL_SENSORS,
            Collection::Circuit => &CIRCUIT_SENSORS,
            Collection::Burner => &BURNER_SENSORS,
            Collection::Compressor => &COMPRESSOR_SENSORS,
        }
    }

    /// Feature listing the member identifiers, `None` for the appliance
    /// itself.
    pub fn membership(&self) -> Option<&'static str> {
        match self {
            Collection::Device => None,
            Collection::Circuit => Some("heating.circuits"),
            Collection::Burner => Some("heating.burners"),
            Collection::Compressor => Some("heating.compressors"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn listing() -> FeatureSet {
        FeatureSet::from_response(serde_json::json!({
            "data": [
                {
                    "feature": "heating.sensors.temperature.outside",
                    "isEnabled": true,
                    "properties": {"value": {"type": "number", "value": 11.4, "unit": "celsius"}}
                },
                {
                    "feature": "heating.gas.consumption.dhw",
                    "isEnabled": true,
                    "properties": {
                        "day": {"type": "array", "value": [1.2, 3.4, 0.9], "unit": "cubicMeter"},
                        "week": {"type": "array", "value": [], "unit": "cubicMeter"}
                    }
                },
                {
                    "feature": "heating.circuits.0.sensors.temperature.supply",
                    "isEnabled": true,
                    "properties": {"value": {"type": "number", "value": 37.5, "unit": "celsius"}}
                },
                {
                    "feature": "heating.burners.0.statistics",
                    "isEnabled": true,
                    "properties": {
                        "starts": {"type": "number", "value": 6543},
                        "hours": {"type": "number", "value": 1203.5}
                    }
                },
                {
                    "feature": "heating.burners.0.modulation",
                    "isEnabled": true,
                    "properties": {"value": {"type": "string", "value": "unavailable"}}
                },
                {
                    "feature": "heating.power.production.current",
                    "isEnabled": true,
                    "properties": {"value": {"type": "boolean", "value": false}}
                },
                {
                    "feature": "heating.power.production",
                    "isEnabled": true,
                    "properties": {"day": {"type": "array", "value": [0.4], "unit": "kilowattHour"}}
                }
            ]
        }))
        .unwrap()
    }

    fn spec(catalog: &'static [SensorSpec], key: &str) -> &'static SensorSpec {
        catalog.iter().find(|spec| spec.key == key).unwrap()
    }

    #[test]
    fn scalar_values_carry_the_reported_unit() {
        let listing = listing();
        let source = Source::new(&listing, "");
        let read = spec(&GLOBAL_SENSORS, "outside_temperature").read;
        let sample = read(&source).unwrap();
        assert_eq!(sample.value, Reading::Float(11.4));
        assert_eq!(sample.unit, Some(Unit::Celsius));
    }

    #[test]
    fn series_yield_the_current_period_entry() {
        let listing = listing();
        let source = Source::new(&listing, "");
        let read = spec(&GLOBAL_SENSORS, "hotwater_gas_consumption_today").read;
        let sample = read(&source).unwrap();
        assert_eq!(sample.value, Reading::Float(1.2));
        assert_eq!(sample.unit, Some(Unit::CubicMeter));
    }

    #[test]
    fn an_empty_series_is_malformed() {
        let listing = listing();
        let source = Source::new(&listing, "");
        let read = spec(&GLOBAL_SENSORS, "hotwater_gas_consumption_heating_this_week").read;
        assert_eq!(
            read(&source).unwrap_err(),
            ValueError::Malformed(
                "heating.gas.consumption.dhw".to_string(),
                "week".to_string()
            )
        );
    }

    #[test]
    fn prefixed_scopes_address_member_features() {
        let listing = listing();
        let circuit = Source::new(&listing, "heating.circuits.0");
        let read = spec(&CIRCUIT_SENSORS, "supply_temperature").read;
        assert_eq!(read(&circuit).unwrap().value, Reading::Float(37.5));

        let burner = Source::new(&listing, "heating.burners.0");
        let starts = spec(&BURNER_SENSORS, "burner_starts").read;
        assert_eq!(starts(&burner).unwrap().value, Reading::Integer(6543));
        let hours = spec(&BURNER_SENSORS, "burner_hours").read;
        assert_eq!(hours(&burner).unwrap().value, Reading::Float(1203.5));
    }

    #[test]
    fn string_properties_are_passed_through() {
        let listing = listing();
        let burner = Source::new(&listing, "heating.burners.0");
        let read = spec(&BURNER_SENSORS, "burner_modulation").read;
        assert_eq!(
            read(&burner).unwrap().value,
            Reading::Text("unavailable".to_string())
        );
    }

    #[test]
    fn non_scalar_values_are_malformed() {
        let listing = listing();
        let source = Source::new(&listing, "");
        let read = spec(&GLOBAL_SENSORS, "power_production_current").read;
        assert_eq!(
            read(&source).unwrap_err(),
            ValueError::Malformed(
                "heating.power.production.current".to_string(),
                "value".to_string()
            )
        );
    }

    #[test]
    fn absent_features_and_properties_are_told_apart() {
        let listing = listing();
        let source = Source::new(&listing, "");
        let missing = spec(&GLOBAL_SENSORS, "return_temperature").read;
        assert!(matches!(
            missing(&source).unwrap_err(),
            ValueError::FeatureMissing(_)
        ));

        let burner = Source::new(&listing, "heating.burners.1");
        let starts = spec(&BURNER_SENSORS, "burner_starts").read;
        assert!(matches!(
            starts(&burner).unwrap_err(),
            ValueError::FeatureMissing(_)
        ));

        let week = spec(&GLOBAL_SENSORS, "power_production_this_week").read;
        assert_eq!(
            week(&source).unwrap_err(),
            ValueError::PropertyMissing(
                "heating.power.production".to_string(),
                "week".to_string()
            )
        );
    }

    #[test]
    fn unit_symbols_and_class_fallbacks() {
        assert_eq!(Unit::from_wire("kilowattHour"), Some(Unit::KilowattHour));
        assert_eq!(Unit::from_wire("joule"), None);
        assert_eq!(Unit::CubicMeter.device_class(), Some(DeviceClass::Gas));
        assert_eq!(Unit::KilowattHour.device_class(), Some(DeviceClass::Energy));
        assert_eq!(Unit::Celsius.device_class(), None);
        assert_eq!(Unit::Hour.symbol(), "h");
        assert_eq!(StateClass::TotalIncreasing.to_string(), "total_increasing");
        assert_eq!(DeviceClass::Temperature.to_string(), "temperature");
    }

    #[test]
    fn catalog_keys_are_distinct() {
        for collection in Collection::ALL {
            let sensors = collection.sensors();
            for (i, a) in sensors.iter().enumerate() {
                for b in &sensors[i + 1..] {
                    assert_ne!(a.key, b.key, "{collection} catalog");
                }
            }
        }
    }

    #[test]
    fn catalog_order_is_stable() {
        assert_eq!(GLOBAL_SENSORS[0].key, "outside_temperature");
        assert_eq!(GLOBAL_SENSORS[15].key, "power_production_this_year");
        assert_eq!(CIRCUIT_SENSORS[0].key, "supply_temperature");
        assert_eq!(BURNER_SENSORS[2].key, "burner_modulation");
        assert_eq!(COMPRESSOR_SENSORS[6].key, "compressor_hours_loadclass5");
    }
}
