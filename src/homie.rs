use std::collections::BTreeMap;
use std::time::Duration;

use homie5::client::{Publish, QoS, Subscription};
use homie5::device_description::{
    DeviceDescriptionBuilder, HomieDeviceDescription, HomieNodeDescription,
    HomiePropertyDescription, PropertyDescriptionBuilder,
};
use homie5::{Homie5DeviceProtocol, HomieDataType, HomieDeviceStatus, HomieDomain, HomieID};
use tokio_util::task::AbortOnDropHandle;

use crate::catalog::{Reading, Unit};
use crate::connection::DeviceView;
use crate::discovery::{SensorEntity, Target};

/// Options of the homie MQTT bridge.
#[derive(clap::Parser, Clone)]
#[group(id = "homie::Args")]
pub struct Args {
    /// Host name of the MQTT broker to publish the device to.
    #[arg(long, default_value = "localhost")]
    mqtt_host: String,
    /// Port of the MQTT broker.
    #[arg(long, default_value_t = 1883)]
    mqtt_port: u16,
    /// User name to authenticate with the MQTT broker.
    #[arg(long)]
    mqtt_username: Option<String>,
    /// Password to authenticate with the MQTT broker.
    #[arg(long)]
    mqtt_password: Option<String>,
    /// Topic domain under which the homie device is published.
    #[arg(long, default_value = "homie")]
    homie_domain: String,
    /// Identifier of the published homie device. Derived from the gateway
    /// serial when not given.
    #[arg(long)]
    device_id: Option<String>,
}

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("`{0}` is not a valid homie domain")]
    Domain(String),
    #[error("`{0}` cannot be turned into a homie identifier")]
    Identifier(String),
    #[error("could not render the homie device description")]
    Description(#[source] homie5::Homie5ProtocolError),
    #[error("could not publish to the MQTT broker")]
    Publish(#[source] rumqttc::v5::ClientError),
    #[error("could not subscribe with the MQTT broker")]
    Subscribe(#[source] rumqttc::v5::ClientError),
}

/// Expose the discovered entities as one homie 5 device and keep the
/// published values current.
pub async fn run(
    args: Args,
    device: DeviceView,
    entities: Vec<SensorEntity>,
) -> Result<(), Error> {
    let device_id = match &args.device_id {
        Some(id) => homie_id(id)?,
        None => homie_id(&format!("vicare-{}", device.identity().serial))?,
    };
    let domain = homie_domain(&args.homie_domain)?;
    let (protocol, last_will) = Homie5DeviceProtocol::new(device_id.clone(), domain);

    let mut options =
        rumqttc::v5::MqttOptions::new(device_id.to_string(), args.mqtt_host, args.mqtt_port);
    options.set_keep_alive(Duration::from_secs(30));
    if let (Some(username), Some(password)) = (&args.mqtt_username, &args.mqtt_password) {
        options.set_credentials(username, password);
    }
    options.set_last_will(convert_last_will(last_will));
    let (mqtt, event_loop) = rumqttc::v5::AsyncClient::new(options, 64);
    let connection_task = AbortOnDropHandle::new(tokio::spawn(drive_connection(event_loop)));

    let entities = bind(entities)?;
    let description = describe(
        &format!("{} {}", device.account_name(), device.identity().model),
        &entities,
    );
    let mut bridge = ViCareDevice {
        mqtt,
        protocol,
        state: HomieDeviceStatus::Init,
        description,
        connection_task,
        device,
        entities,
    };
    tracing::info!(
        message = "publishing the homie device",
        device = %device_id,
        properties = bridge.entities.len(),
    );
    bridge.publish_device().await?;
    bridge.poll().await
}

struct ViCareDevice {
    mqtt: rumqttc::v5::AsyncClient,
    protocol: Homie5DeviceProtocol,
    state: HomieDeviceStatus,
    description: HomieDeviceDescription,
    #[allow(unused)] // exists for its drop handler
    connection_task: AbortOnDropHandle<()>,
    device: DeviceView,
    entities: Vec<BoundEntity>,
}

/// An entity together with the homie node and property it publishes to.
struct BoundEntity {
    entity: SensorEntity,
    node: HomieID,
    property: HomieID,
}

impl ViCareDevice {
    async fn publish_device(&mut self) -> Result<(), Error> {
        for step in homie5::homie_device_publish_steps() {
            match step {
                homie5::DevicePublishStep::DeviceStateInit => {
                    self.state = HomieDeviceStatus::Init;
                    let p = self.protocol.publish_state(self.state);
                    self.mqtt.homie_publish(p).await.map_err(Error::Publish)?;
                }
                homie5::DevicePublishStep::DeviceDescription => {
                    let p = self
                        .protocol
                        .publish_description(&self.description)
                        .map_err(Error::Description)?;
                    self.mqtt.homie_publish(p).await.map_err(Error::Publish)?;
                }
                homie5::DevicePublishStep::PropertyValues => {
                    self.publish_values().await?;
                    // rumqttc can reorder these publishes past the later
                    // `$state = ready` one unless the task yields here.
                    tokio::task::yield_now().await;
                }
                homie5::DevicePublishStep::SubscribeProperties => {
                    // An empty subscription set surfaces as an error in the
                    // event loop, so it has to be skipped up front.
                    let mut p = self
                        .protocol
                        .subscribe_props(&self.description)
                        .map_err(Error::Description)?
                        .peekable();
                    if p.peek().is_some() {
                        self.mqtt.homie_subscribe(p).await.map_err(Error::Subscribe)?;
                    }
                }
                homie5::DevicePublishStep::DeviceStateReady => {
                    self.state = HomieDeviceStatus::Ready;
                    let p = self.protocol.publish_state(self.state);
                    self.mqtt.homie_publish(p).await.map_err(Error::Publish)?;
                }
            }
        }
        Ok(())
    }

    async fn publish_values(&self) -> Result<(), Error> {
        for bound in &self.entities {
            if let Some(value) = bound.entity.state() {
                let p = self
                    .protocol
                    .publish_value(&bound.node, &bound.property, value.to_string(), true);
                self.mqtt.homie_publish(p).await.map_err(Error::Publish)?;
            }
        }
        Ok(())
    }

    async fn poll(&mut self) -> Result<(), Error> {
        let mut interval = tokio::time::interval(self.device.scan_interval());
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        // The first tick fires immediately and those values were already
        // published right after discovery.
        interval.tick().await;
        loop {
            interval.tick().await;
            self.refresh_values().await?;
        }
    }

    /// Refresh every entity and publish the values that changed.
    ///
    /// The first refresh fetches the feature listing once and the remaining
    /// entities are served from the session cache.
    async fn refresh_values(&mut self) -> Result<(), Error> {
        let previous: Vec<Option<Reading>> = self
            .entities
            .iter()
            .map(|bound| bound.entity.state().cloned())
            .collect();
        let device = &self.device;
        futures::future::join_all(
            self.entities
                .iter_mut()
                .map(|bound| bound.entity.refresh(device)),
        )
        .await;
        for (bound, previous) in self.entities.iter().zip(previous) {
            let Some(value) = bound.entity.state() else {
                continue;
            };
            if previous.as_ref() == Some(value) {
                continue;
            }
            tracing::debug!(
                message = "publishing a changed value",
                node = %bound.node,
                property = %bound.property,
                value = %value,
            );
            let p = self
                .protocol
                .publish_value(&bound.node, &bound.property, value.to_string(), true);
            self.mqtt.homie_publish(p).await.map_err(Error::Publish)?;
        }
        Ok(())
    }
}

async fn drive_connection(mut event_loop: rumqttc::v5::EventLoop) {
    use rumqttc::v5::Event;
    use rumqttc::v5::mqttbytes::v5::Packet;
    loop {
        match event_loop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(_))) => {
                tracing::info!(message = "connected to the MQTT broker");
            }
            Ok(event) => tracing::trace!(message = "mqtt event", event = ?event),
            Err(error) => {
                tracing::warn!(
                    message = "lost the connection to the MQTT broker",
                    error = (&error as &dyn std::error::Error),
                );
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
        }
    }
}

fn bind(entities: Vec<SensorEntity>) -> Result<Vec<BoundEntity>, Error> {
    entities
        .into_iter()
        .map(|entity| {
            let node = homie_id(&entity.target().to_string())?;
            let property = homie_id(entity.key())?;
            Ok(BoundEntity {
                entity,
                node,
                property,
            })
        })
        .collect()
}

fn describe(name: &str, entities: &[BoundEntity]) -> HomieDeviceDescription {
    let mut builder = DeviceDescriptionBuilder::new().name(name);
    let mut order: Vec<&HomieID> = Vec::new();
    for bound in entities {
        if !order.contains(&&bound.node) {
            order.push(&bound.node);
        }
    }
    for node_id in order {
        let mut name = None;
        let mut properties = BTreeMap::new();
        for bound in entities.iter().filter(|bound| &bound.node == node_id) {
            name.get_or_insert_with(|| node_name(bound.entity.target()));
            properties.insert(bound.property.clone(), describe_property(&bound.entity));
        }
        builder = builder.add_node(
            node_id.clone(),
            HomieNodeDescription {
                name,
                r#type: None,
                properties,
            },
        );
    }
    builder.build()
}

fn describe_property(entity: &SensorEntity) -> HomiePropertyDescription {
    let builder = PropertyDescriptionBuilder::new(datatype(entity.state()));
    let builder = match entity.unit() {
        Some(unit) => builder.unit(homie_unit(unit)),
        None => builder,
    };
    builder.build()
}

fn datatype(value: Option<&Reading>) -> HomieDataType {
    match value {
        Some(Reading::Integer(_)) => HomieDataType::Integer,
        Some(Reading::Text(_)) => HomieDataType::String,
        Some(Reading::Float(_)) | None => HomieDataType::Float,
    }
}

fn homie_unit(unit: Unit) -> &'static str {
    match unit {
        Unit::Celsius => homie5::HOMIE_UNIT_DEGREE_CELSIUS,
        Unit::KilowattHour => "kWh",
        Unit::CubicMeter => "m³",
        Unit::Watt => "W",
        Unit::Percent => "%",
        Unit::Hour => "h",
    }
}

fn node_name(target: &Target) -> String {
    let mut name = target.to_string();
    if let Some(first) = name.get_mut(0..1) {
        first.make_ascii_uppercase();
    }
    name
}

// `HomieDomain` only converts from `&'static str` or an owned string.
fn homie_domain(label: &str) -> Result<HomieDomain, Error> {
    HomieDomain::try_from(label.to_string()).map_err(|_| Error::Domain(label.to_string()))
}

/// Squash a label into the homie id character set.
fn homie_id(label: &str) -> Result<HomieID, Error> {
    let mut id = String::with_capacity(label.len());
    for c in label.chars() {
        if c.is_ascii_alphanumeric() {
            id.extend(c.to_lowercase());
        } else if !id.is_empty() && !id.ends_with('-') {
            id.push('-');
        }
    }
    while id.ends_with('-') {
        id.pop();
    }
    HomieID::try_from(id).map_err(|_| Error::Identifier(label.to_string()))
}

fn convert_last_will(will: homie5::client::LastWill) -> rumqttc::v5::mqttbytes::v5::LastWill {
    rumqttc::v5::mqttbytes::v5::LastWill {
        topic: will.topic.into(),
        message: will.message.into(),
        qos: convert_qos(will.qos),
        retain: will.retain,
        properties: None,
    }
}

trait MqttClientExt {
    type PublishError;
    type SubscribeError;
    async fn homie_publish(&self, p: Publish) -> Result<(), Self::PublishError>;
    async fn homie_subscribe(
        &self,
        subs: impl Iterator<Item = Subscription> + Send,
    ) -> Result<(), Self::SubscribeError>;
}

impl MqttClientExt for rumqttc::v5::AsyncClient {
    type PublishError = rumqttc::v5::ClientError;
    type SubscribeError = rumqttc::v5::ClientError;
    async fn homie_publish(&self, p: Publish) -> Result<(), Self::PublishError> {
        self.publish(p.topic, convert_qos(p.qos), p.retain, p.payload)
            .await
    }

    async fn homie_subscribe(
        &self,
        subs: impl Iterator<Item = Subscription> + Send,
    ) -> Result<(), Self::SubscribeError> {
        self.subscribe_many(
            subs.map(|sub| {
                rumqttc::v5::mqttbytes::v5::Filter::new(sub.topic, convert_qos(sub.qos))
            }),
        )
        .await
    }
}

pub fn convert_qos(homie: QoS) -> rumqttc::v5::mqttbytes::QoS {
    match homie {
        QoS::AtMostOnce => rumqttc::v5::mqttbytes::QoS::AtMostOnce,
        QoS::AtLeastOnce => rumqttc::v5::mqttbytes::QoS::AtLeastOnce,
        QoS::ExactlyOnce => rumqttc::v5::mqttbytes::QoS::ExactlyOnce,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::FeatureSet;
    use crate::catalog::Collection;
    use crate::connection::{DeviceIdentity, HeatingType};
    use crate::discovery::discover_in;
    use std::sync::Arc;

    fn bound_entities() -> Vec<BoundEntity> {
        let listing = FeatureSet::from_response(serde_json::json!({
            "data": [
                {
                    "feature": "heating.sensors.temperature.outside",
                    "isEnabled": true,
                    "properties": {"value": {"type": "number", "value": 11.4, "unit": "celsius"}}
                },
                {
                    "feature": "heating.burners",
                    "isEnabled": true,
                    "properties": {"enabled": {"type": "array", "value": ["0"]}}
                },
                {
                    "feature": "heating.burners.0.statistics",
                    "isEnabled": true,
                    "properties": {"starts": {"type": "number", "value": 6543}}
                }
            ]
        }))
        .unwrap();
        let identity = Arc::new(DeviceIdentity {
            serial: "7633107093013106".to_string(),
            model: "E3_Vitodens_200_0421".to_string(),
            online: true,
        });
        bind(discover_in(&listing, "ViCare", HeatingType::Auto, &identity)).unwrap()
    }

    #[test]
    fn domains_parse_from_borrowed_labels() {
        assert!(homie_domain("homie").is_ok());
        assert!(homie_domain("heating-lab").is_ok());
        assert!(matches!(homie_domain(""), Err(Error::Domain(_))));
    }

    #[test]
    fn labels_become_homie_ids() {
        assert_eq!(
            homie_id("outside_temperature").unwrap().to_string(),
            "outside-temperature"
        );
        assert_eq!(homie_id("circuit 0").unwrap().to_string(), "circuit-0");
        assert_eq!(
            homie_id("Vitodens 200-W!").unwrap().to_string(),
            "vitodens-200-w"
        );
        assert!(homie_id("__ !!").is_err());
    }

    #[test]
    fn nodes_group_the_entities_by_target() {
        let entities = bound_entities();
        let description = describe("ViCare E3_Vitodens_200_0421", &entities);
        let device_node = homie_id("device").unwrap();
        let burner_node = homie_id("burner 0").unwrap();
        let outside = homie_id("outside_temperature").unwrap();
        let starts = homie_id("burner_starts").unwrap();
        assert!(
            description
                .get_property_by_id(&device_node, &outside)
                .is_some()
        );
        assert!(
            description
                .get_property_by_id(&burner_node, &starts)
                .is_some()
        );
        assert!(
            description
                .get_property_by_id(&device_node, &starts)
                .is_none()
        );
    }

    #[test]
    fn property_descriptions_carry_datatype_and_unit() {
        let entities = bound_entities();
        let description = describe("ViCare", &entities);

        let device_node = homie_id("device").unwrap();
        let outside = homie_id("outside_temperature").unwrap();
        let pd = description
            .get_property_by_id(&device_node, &outside)
            .unwrap();
        assert_eq!(pd.datatype, HomieDataType::Float);
        assert_eq!(pd.unit.as_deref(), Some("°C"));

        let burner_node = homie_id("burner 0").unwrap();
        let starts = homie_id("burner_starts").unwrap();
        let pd = description
            .get_property_by_id(&burner_node, &starts)
            .unwrap();
        assert_eq!(pd.datatype, HomieDataType::Integer);
        assert_eq!(pd.unit, None);
    }

    #[test]
    fn node_names_read_like_the_targets() {
        let device = Target {
            collection: Collection::Device,
            member: None,
        };
        assert_eq!(node_name(&device), "Device");
        let burner = Target {
            collection: Collection::Burner,
            member: Some("0".to_string()),
        };
        assert_eq!(node_name(&burner), "Burner 0");
    }

    #[test]
    fn datatypes_follow_the_seeded_reading() {
        assert_eq!(datatype(Some(&Reading::Float(1.5))), HomieDataType::Float);
        assert_eq!(datatype(Some(&Reading::Integer(3))), HomieDataType::Integer);
        assert_eq!(
            datatype(Some(&Reading::Text("auto".to_string()))),
            HomieDataType::String
        );
        assert_eq!(datatype(None), HomieDataType::Float);
    }
}
