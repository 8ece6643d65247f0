use std::collections::BTreeMap;

use serde::Deserialize;

/// Failure to extract a value from a feature listing.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum ValueError {
    #[error("the device does not offer the `{0}` feature")]
    FeatureMissing(String),
    #[error("the `{0}` feature has no `{1}` property")]
    PropertyMissing(String, String),
    #[error("the `{0}` feature property `{1}` has an unexpected shape")]
    Malformed(String, String),
}

/// One entry of the feature listing returned by the `features/` endpoint.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Feature {
    pub feature: String,
    #[serde(default)]
    pub is_enabled: bool,
    #[serde(default)]
    pub is_ready: bool,
    #[serde(default)]
    pub properties: BTreeMap<String, Property>,
}

#[derive(Debug, Deserialize)]
pub struct Property {
    #[serde(rename = "type", default)]
    pub kind: Option<String>,
    #[serde(default)]
    pub value: Option<serde_json::Value>,
    #[serde(default)]
    pub unit: Option<String>,
}

impl Feature {
    /// Look up a property of this feature.
    pub fn property(&self, name: &str) -> Result<&Property, ValueError> {
        self.properties
            .get(name)
            .ok_or_else(|| ValueError::PropertyMissing(self.feature.clone(), name.to_string()))
    }
}

#[derive(Debug, Deserialize)]
struct FeaturesResponse {
    data: Vec<Feature>,
}

/// Feature listing of one device, indexed by the full dotted feature name.
#[derive(Debug, Default)]
pub struct FeatureSet {
    features: BTreeMap<String, Feature>,
}

impl FeatureSet {
    /// Index the `{"data": [...]}` document returned by the `features/`
    /// endpoint.
    pub fn from_response(document: serde_json::Value) -> Result<Self, serde_json::Error> {
        let response: FeaturesResponse = serde_json::from_value(document)?;
        let features = response
            .data
            .into_iter()
            .map(|feature| (feature.feature.clone(), feature))
            .collect();
        Ok(Self { features })
    }

    /// Look up an enabled feature by its full dotted name.
    ///
    /// The backend also reports features the appliance does not have,
    /// flagged `isEnabled: false`. Those expose no usable values and count
    /// as missing here.
    pub fn feature(&self, name: &str) -> Result<&Feature, ValueError> {
        match self.features.get(name) {
            Some(feature) if feature.is_enabled => Ok(feature),
            _ => Err(ValueError::FeatureMissing(name.to_string())),
        }
    }

    /// Member identifiers of an entity collection feature such as
    /// `heating.circuits`.
    pub fn members(&self, name: &str) -> Result<Vec<String>, ValueError> {
        let enabled = self.feature(name)?.property("enabled")?;
        let malformed = || ValueError::Malformed(name.to_string(), "enabled".to_string());
        let items = enabled
            .value
            .as_ref()
            .and_then(|value| value.as_array())
            .ok_or_else(malformed)?;
        items
            .iter()
            .map(|item| match item {
                serde_json::Value::String(id) => Ok(id.clone()),
                serde_json::Value::Number(id) => Ok(id.to_string()),
                _ => Err(malformed()),
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.features.len()
    }

    pub fn is_empty(&self) -> bool {
        self.features.is_empty()
    }
}

#[derive(Debug, Deserialize)]
pub struct InstallationsResponse {
    pub data: Vec<Installation>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Installation {
    pub id: i64,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub gateways: Vec<Gateway>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Gateway {
    pub serial: String,
    #[serde(default)]
    pub devices: Vec<Device>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Device {
    pub id: String,
    #[serde(default)]
    pub model_id: String,
    #[serde(default)]
    pub device_type: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
}

impl Device {
    pub fn is_online(&self) -> bool {
        self.status.as_deref() == Some("Online")
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
                    "isReady": true,
                    "properties": {
                        "value": {"type": "number", "value": -3.7, "unit": "celsius"},
                        "status": {"type": "string", "value": "connected"}
                    }
                },
                {
                    "feature": "heating.boiler.sensors.temperature.main",
                    "isEnabled": false,
                    "properties": {
                        "value": {"type": "number", "value": 0.0}
                    }
                },
                {
                    "feature": "heating.circuits",
                    "isEnabled": true,
                    "properties": {
                        "enabled": {"type": "array", "value": ["0", "2"]}
                    }
                },
                {
                    "feature": "heating.burners",
                    "isEnabled": true,
                    "properties": {}
                }
            ]
        }))
        .unwrap()
    }

    #[test]
    fn indexes_features_by_name() {
        let listing = listing();
        assert_eq!(listing.len(), 4);
        let outside = listing.feature("heating.sensors.temperature.outside").unwrap();
        assert!(outside.is_ready);
        let value = outside.property("value").unwrap();
        assert_eq!(value.unit.as_deref(), Some("celsius"));
        assert_eq!(value.value, Some(serde_json::json!(-3.7)));
    }

    #[test]
    fn disabled_features_count_as_missing() {
        let listing = listing();
        let error = listing
            .feature("heating.boiler.sensors.temperature.main")
            .unwrap_err();
        assert_eq!(
            error,
            ValueError::FeatureMissing("heating.boiler.sensors.temperature.main".to_string())
        );
    }

    #[test]
    fn unknown_property_is_reported_with_context() {
        let listing = listing();
        let outside = listing.feature("heating.sensors.temperature.outside").unwrap();
        assert_eq!(
            outside.property("slope").unwrap_err(),
            ValueError::PropertyMissing(
                "heating.sensors.temperature.outside".to_string(),
                "slope".to_string()
            )
        );
    }

    #[test]
    fn collection_members_come_from_the_enabled_property() {
        let listing = listing();
        assert_eq!(listing.members("heating.circuits").unwrap(), ["0", "2"]);
        assert_eq!(
            listing.members("heating.compressors"),
            Err(ValueError::FeatureMissing("heating.compressors".to_string()))
        );
        assert_eq!(
            listing.members("heating.burners"),
            Err(ValueError::PropertyMissing(
                "heating.burners".to_string(),
                "enabled".to_string()
            ))
        );
    }

    #[test]
    fn parses_the_installation_listing() {
        let response: InstallationsResponse = serde_json::from_value(serde_json::json!({
            "data": [{
                "id": 1442253,
                "description": "Home",
                "gateways": [{
                    "serial": "7633107093013213",
                    "devices": [
                        {"id": "0", "modelId": "E3_Vitodens_200_0421", "deviceType": "heating", "status": "Online"},
                        {"id": "gateway", "modelId": "Heatbox1", "deviceType": "vitoconnect", "status": "Offline"}
                    ]
                }]
            }]
        }))
        .unwrap();
        let device = &response.data[0].gateways[0].devices[0];
        assert_eq!(device.model_id, "E3_Vitodens_200_0421");
        assert!(device.is_online());
        assert!(!response.data[0].gateways[0].devices[1].is_online());
    }
}
