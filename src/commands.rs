pub mod catalog {
    use crate::catalog::{Collection, DeviceClass, SensorSpec, StateClass};
    use crate::output;

    /// Search and output the known measurement descriptions.
    #[derive(clap::Parser)]
    pub struct Args {
        /// Show only descriptions whose key, name or collection contains this
        /// string (case insensitive).
        filter: Option<String>,
        #[clap(flatten)]
        output: output::Args,
    }

    #[derive(thiserror::Error, Debug)]
    pub enum Error {
        #[error("could not write the catalog listing")]
        Output(#[from] output::Error),
    }

    #[derive(serde::Serialize)]
    struct Description {
        collection: Collection,
        key: &'static str,
        name: &'static str,
        unit: Option<&'static str>,
        device_class: Option<DeviceClass>,
        state_class: Option<StateClass>,
        icon: Option<&'static str>,
    }

    fn is_match(filter: Option<&str>, collection: Collection, spec: &SensorSpec) -> bool {
        let Some(filter) = filter else { return true };
        let filter = filter.to_lowercase();
        spec.key.contains(&filter)
            || spec.name.to_lowercase().contains(&filter)
            || collection.to_string().contains(&filter)
    }

    pub fn run(args: Args) -> Result<(), Error> {
        let mut output = args.output.open()?;
        output.headers(vec![
            "collection",
            "key",
            "name",
            "unit",
            "device class",
            "state class",
            "icon",
        ])?;
        for collection in Collection::ALL {
            for spec in collection.sensors() {
                if !is_match(args.filter.as_deref(), collection, spec) {
                    continue;
                }
                output.result(
                    || {
                        vec![
                            collection.to_string(),
                            spec.key.to_string(),
                            spec.name.to_string(),
                            spec.unit.map(|u| u.symbol().to_string()).unwrap_or_default(),
                            spec.device_class
                                .map(|c| c.to_string())
                                .unwrap_or_default(),
                            spec.state_class.map(|c| c.to_string()).unwrap_or_default(),
                            spec.icon.unwrap_or_default().to_string(),
                        ]
                    },
                    || Description {
                        collection,
                        key: spec.key,
                        name: spec.name,
                        unit: spec.unit.map(|u| u.symbol()),
                        device_class: spec.device_class,
                        state_class: spec.state_class,
                        icon: spec.icon,
                    },
                )?;
            }
        }
        output.commit()?;
        Ok(())
    }

}

pub mod devices {
    use crate::{connection, output};

    /// List every device the ViCare account can reach.
    #[derive(clap::Parser)]
    pub struct Args {
        #[clap(flatten)]
        connection: connection::Args,
        #[clap(flatten)]
        output: output::Args,
    }

    #[derive(thiserror::Error, Debug)]
    pub enum Error {
        #[error("could not open the ViCare session")]
        Session(#[source] connection::Error),
        #[error("could not list the account devices")]
        List(#[source] connection::Error),
        #[error("could not write the device listing")]
        Output(#[from] output::Error),
    }

    #[derive(serde::Serialize)]
    struct Record<'a> {
        installation: i64,
        description: Option<&'a str>,
        gateway: &'a str,
        device: &'a str,
        model: &'a str,
        device_type: Option<&'a str>,
        online: bool,
    }

    pub async fn run(args: Args) -> Result<(), Error> {
        let session = connection::Session::open(args.connection)
            .await
            .map_err(Error::Session)?;
        let devices = session.devices().await.map_err(Error::List)?;
        let mut output = args.output.open()?;
        output.headers(vec![
            "installation",
            "description",
            "gateway",
            "device",
            "model",
            "type",
            "online",
        ])?;
        for record in &devices {
            output.result(
                || {
                    vec![
                        record.route.installation_id.to_string(),
                        record.installation_description.clone().unwrap_or_default(),
                        record.route.gateway_serial.clone(),
                        record.route.device_id.clone(),
                        record.model_id.clone(),
                        record.device_type.clone().unwrap_or_default(),
                        record.online.to_string(),
                    ]
                },
                || Record {
                    installation: record.route.installation_id,
                    description: record.installation_description.as_deref(),
                    gateway: &record.route.gateway_serial,
                    device: &record.route.device_id,
                    model: &record.model_id,
                    device_type: record.device_type.as_deref(),
                    online: record.online,
                },
            )?;
        }
        output.commit()?;
        Ok(())
    }
}

pub mod read {
    use crate::catalog::{DeviceClass, Reading, StateClass, Unit};
    use crate::{connection, discovery, output};

    /// Discover the device capabilities and output every supported entity
    /// with its current value.
    #[derive(clap::Parser)]
    pub struct Args {
        #[clap(flatten)]
        connection: connection::Args,
        #[clap(flatten)]
        output: output::Args,
    }

    #[derive(thiserror::Error, Debug)]
    pub enum Error {
        #[error("could not open the ViCare session")]
        Session(#[source] connection::Error),
        #[error("could not discover the device capabilities")]
        Discover(#[source] connection::Error),
        #[error("could not write the entity listing")]
        Output(#[from] output::Error),
    }

    #[derive(serde::Serialize)]
    struct Entity<'a> {
        unique_id: String,
        name: &'a str,
        key: &'a str,
        target: String,
        value: Option<&'a Reading>,
        unit: Option<Unit>,
        device_class: Option<DeviceClass>,
        state_class: Option<StateClass>,
        available: bool,
    }

    pub async fn run(args: Args) -> Result<(), Error> {
        let device = connection::open_device(args.connection)
            .await
            .map_err(Error::Session)?;
        let entities = discovery::discover(&device).await.map_err(Error::Discover)?;
        tracing::info!(
            message = "discovered the supported entities",
            count = entities.len(),
        );
        let mut output = args.output.open()?;
        output.headers(vec!["name", "target", "value", "unit", "class"])?;
        for entity in &entities {
            output.result(
                || {
                    vec![
                        entity.name().to_string(),
                        entity.target().to_string(),
                        entity
                            .state()
                            .map(|value| value.to_string())
                            .unwrap_or_default(),
                        entity
                            .unit()
                            .map(|unit| unit.symbol().to_string())
                            .unwrap_or_default(),
                        entity
                            .device_class()
                            .map(|class| class.to_string())
                            .unwrap_or_default(),
                    ]
                },
                || Entity {
                    unique_id: entity.unique_id(),
                    name: entity.name(),
                    key: entity.key(),
                    target: entity.target().to_string(),
                    value: entity.state(),
                    unit: entity.unit(),
                    device_class: entity.device_class(),
                    state_class: entity.state_class(),
                    available: entity.available(),
                },
            )?;
        }
        output.commit()?;
        Ok(())
    }
}

pub mod homie {
    use crate::{connection, discovery, homie};

    /// Expose the device as a homie 5 device over MQTT, refreshing the
    /// entity values on the configured scan interval.
    #[derive(clap::Parser)]
    pub struct Args {
        #[clap(flatten)]
        connection: connection::Args,
        #[clap(flatten)]
        homie: homie::Args,
    }

    #[derive(thiserror::Error, Debug)]
    pub enum Error {
        #[error("could not open the ViCare session")]
        Session(#[source] connection::Error),
        #[error("could not discover the device capabilities")]
        Discover(#[source] connection::Error),
        #[error("the homie bridge failed")]
        Bridge(#[source] homie::Error),
    }

    pub async fn run(args: Args) -> Result<(), Error> {
        let device = connection::open_device(args.connection)
            .await
            .map_err(Error::Session)?;
        let entities = discovery::discover(&device).await.map_err(Error::Discover)?;
        tracing::info!(
            message = "discovered the supported entities",
            count = entities.len(),
        );
        homie::run(args.homie, device, entities)
            .await
            .map_err(Error::Bridge)
    }
}
