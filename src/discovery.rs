use std::sync::Arc;

use crate::api::{FeatureSet, ValueError};
use crate::catalog::{Collection, DeviceClass, Reading, Sample, SensorSpec, Source, StateClass, Unit};
use crate::connection::{self, DeviceIdentity, DeviceView, HeatingType};

/// Scope an entity was discovered against.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Target {
    pub collection: Collection,
    /// Collection member identifier, `None` for the appliance itself.
    pub member: Option<String>,
}

impl Target {
    /// Feature name prefix of this scope, empty for the appliance itself.
    pub fn prefix(&self) -> String {
        match (&self.member, self.collection.membership()) {
            (Some(id), Some(base)) => format!("{base}.{id}"),
            _ => String::new(),
        }
    }
}

impl std::fmt::Display for Target {
    fn fmt(&self, fmt: &mut std::fmt::Formatter) -> std::fmt::Result {
        match &self.member {
            Some(id) => write!(fmt, "{} {}", self.collection, id),
            None => write!(fmt, "{}", self.collection),
        }
    }
}

/// Outcome of evaluating one description against one scope.
#[derive(Debug, Clone, PartialEq)]
pub enum Probe {
    Value(Sample),
    /// The appliance does not expose what the description reads.
    Unsupported(ValueError),
    /// The appliance answered with something unusable.
    Invalid(ValueError),
}

pub fn probe(spec: &SensorSpec, source: &Source<'_>) -> Probe {
    match (spec.read)(source) {
        Ok(sample) => Probe::Value(sample),
        Err(error @ (ValueError::FeatureMissing(_) | ValueError::PropertyMissing(..))) => {
            Probe::Unsupported(error)
        }
        Err(error @ ValueError::Malformed(..)) => Probe::Invalid(error),
    }
}

/// One published measurement of the adapted device.
pub struct SensorEntity {
    spec: &'static SensorSpec,
    target: Target,
    name: String,
    unit: Option<Unit>,
    device_class: Option<DeviceClass>,
    identity: Arc<DeviceIdentity>,
    last_value: Option<Reading>,
}

impl SensorEntity {
    pub fn key(&self) -> &'static str {
        self.spec.key
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn target(&self) -> &Target {
        &self.target
    }

    pub fn unit(&self) -> Option<Unit> {
        self.unit
    }

    pub fn device_class(&self) -> Option<DeviceClass> {
        self.device_class
    }

    pub fn state_class(&self) -> Option<StateClass> {
        self.spec.state_class
    }

    pub fn icon(&self) -> Option<&'static str> {
        self.spec.icon
    }

    pub fn device(&self) -> &DeviceIdentity {
        &self.identity
    }

    /// Stable identifier, unique across every entity of the device.
    pub fn unique_id(&self) -> String {
        format!("{}-{}", self.identity.serial, self.name)
    }

    pub fn state(&self) -> Option<&Reading> {
        self.last_value.as_ref()
    }

    pub fn available(&self) -> bool {
        self.last_value.is_some()
    }

    /// Re-read the value from the backend.
    ///
    /// Never fails. A backend error is logged and the previous value stays
    /// in place until a later poll succeeds.
    pub async fn refresh(&mut self, device: &DeviceView) {
        match device.features().await {
            Ok(features) => {
                let prefix = self.target.prefix();
                let source = Source::new(&features, &prefix);
                self.apply(probe(self.spec, &source));
            }
            Err(error) => log_refresh_error(&error),
        }
    }

    fn apply(&mut self, probe: Probe) {
        match probe {
            Probe::Value(sample) => self.last_value = Some(sample.value),
            // Features drop off the listing while the appliance is being
            // serviced and come back with it. The value stays as it was.
            Probe::Unsupported(_) => {}
            Probe::Invalid(error) => {
                tracing::error!(
                    message = "unable to decode data from ViCare server",
                    entity = self.name.as_str(),
                    error = (&error as &dyn std::error::Error),
                );
            }
        }
    }
}

fn log_refresh_error(error: &connection::Error) {
    match error {
        connection::Error::RateLimited { reset_at } => {
            tracing::error!(message = "ViCare API rate limit exceeded", reset_at = ?reset_at);
        }
        connection::Error::Decode(_) | connection::Error::InvalidData(_) => {
            tracing::error!(
                message = "unable to decode data from ViCare server",
                error = (error as &dyn std::error::Error),
            );
        }
        _ => {
            tracing::error!(
                message = "unable to retrieve data from ViCare server",
                error = (error as &dyn std::error::Error),
            );
        }
    }
}

/// Probe every catalog against the device and build the entity set.
///
/// Entities come out in catalog order: the appliance itself first, then
/// circuits, burners and compressors. Within a collection the descriptions
/// keep their declaration order, each expanded across the members in the
/// order the backend lists them. Probing the same backend state twice
/// yields the same set.
pub async fn discover(device: &DeviceView) -> Result<Vec<SensorEntity>, connection::Error> {
    let features = device.features().await?;
    Ok(discover_in(
        &features,
        device.account_name(),
        device.heating_type(),
        device.identity(),
    ))
}

pub(crate) fn discover_in(
    features: &FeatureSet,
    account: &str,
    heating_type: HeatingType,
    identity: &Arc<DeviceIdentity>,
) -> Vec<SensorEntity> {
    let mut entities = Vec::new();
    for collection in Collection::ALL {
        let targets = targets(features, collection, heating_type);
        for spec in collection.sensors() {
            for target in &targets {
                let prefix = target.prefix();
                let source = Source::new(features, &prefix);
                let name = entity_name(account, spec, target, targets.len());
                match probe(spec, &source) {
                    Probe::Value(sample) => {
                        tracing::debug!(message = "found entity", name = name.as_str());
                        let unit = sample.unit.or(spec.unit);
                        let device_class = spec
                            .device_class
                            .or_else(|| unit.and_then(|unit| unit.device_class()));
                        entities.push(SensorEntity {
                            spec,
                            target: target.clone(),
                            name,
                            unit,
                            device_class,
                            identity: Arc::clone(identity),
                            last_value: Some(sample.value),
                        });
                    }
                    Probe::Unsupported(ValueError::FeatureMissing(feature)) => {
                        tracing::info!(
                            message = "feature not supported",
                            name = name.as_str(),
                            feature = feature.as_str(),
                        );
                    }
                    Probe::Unsupported(error) => {
                        tracing::debug!(
                            message = "attribute not available",
                            name = name.as_str(),
                            error = (&error as &dyn std::error::Error),
                        );
                    }
                    Probe::Invalid(error) => {
                        tracing::error!(
                            message = "unable to decode data from ViCare server",
                            name = name.as_str(),
                            error = (&error as &dyn std::error::Error),
                        );
                    }
                }
            }
        }
    }
    entities
}

/// Scopes to probe for one collection.
///
/// A membership feature the appliance does not have means the collection is
/// empty, not that discovery failed.
fn targets(
    features: &FeatureSet,
    collection: Collection,
    heating_type: HeatingType,
) -> Vec<Target> {
    let Some(membership) = collection.membership() else {
        return vec![Target {
            collection,
            member: None,
        }];
    };
    let attempted = match collection {
        Collection::Burner => heating_type.probes_burners(),
        Collection::Compressor => heating_type.probes_compressors(),
        _ => true,
    };
    if !attempted {
        return Vec::new();
    }
    match features.members(membership) {
        Ok(members) => members
            .into_iter()
            .map(|id| Target {
                collection,
                member: Some(id),
            })
            .collect(),
        Err(ValueError::FeatureMissing(_) | ValueError::PropertyMissing(..)) => {
            tracing::info!(message = "no members found", %collection);
            Vec::new()
        }
        Err(error) => {
            tracing::error!(
                message = "unable to decode data from ViCare server",
                %collection,
                error = (&error as &dyn std::error::Error),
            );
            Vec::new()
        }
    }
}

/// The member id is appended to the display name only when the collection
/// has more than one member.
fn entity_name(account: &str, spec: &SensorSpec, target: &Target, members: usize) -> String {
    let mut name = format!("{account} {}", spec.name);
    if members > 1 {
        if let Some(id) = &target.member {
            name.push(' ');
            name.push_str(id);
        }
    }
    name
}
