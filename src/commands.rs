pub mod fields {
    use crate::fields::{FIELDS, FieldDescriptor};

    /// List the values exposed for every thermostat.
    #[derive(clap::Parser)]
    pub struct Args {
        #[clap(flatten)]
        output: crate::output::Args,
        /// Only list fields whose key or name contains this text.
        filter: Option<String>,
    }

    #[derive(thiserror::Error, Debug)]
    pub enum Error {
        #[error("could not output the field list")]
        Output(#[from] crate::output::Error),
    }

    #[derive(serde::Serialize)]
    pub struct FieldSchema {
        pub key: &'static str,
        pub name: &'static str,
        pub kind: &'static str,
        pub unit: Option<&'static str>,
        pub icons: &'static [&'static str],
    }

    impl From<&'static FieldDescriptor> for FieldSchema {
        fn from(field: &'static FieldDescriptor) -> Self {
            Self {
                key: field.key,
                name: field.name,
                kind: field.kind.into(),
                unit: field.unit,
                icons: field.icons,
            }
        }
    }

    impl FieldSchema {
        pub fn is_match(&self, pattern: &str) -> bool {
            let pattern = pattern.to_lowercase();
            self.key.contains(&pattern) || self.name.to_lowercase().contains(&pattern)
        }
    }

    pub fn run(args: Args) -> Result<(), Error> {
        let mut output = args.output.to_output()?;
        output.table_headers(&["Key", "Name", "Type", "Unit", "Icons"])?;
        for schema in FIELDS.iter().map(FieldSchema::from) {
            if let Some(pattern) = &args.filter {
                if !schema.is_match(pattern) {
                    continue;
                }
            }
            output.result(
                || {
                    vec![
                        schema.key.to_string(),
                        schema.name.to_string(),
                        schema.kind.to_string(),
                        schema.unit.unwrap_or_default().to_string(),
                        schema.icons.join(", "),
                    ]
                },
                || &schema,
            )?;
        }
        Ok(output.commit()?)
    }
}

pub mod validate {
    /// Check that the database and thermostat configuration is usable.
    #[derive(clap::Parser)]
    pub struct Args {
        #[clap(flatten)]
        config: crate::config::Args,
    }

    #[derive(thiserror::Error, Debug)]
    pub enum Error {
        #[error("configuration is invalid ({})", .0.reason())]
        Invalid(#[from] crate::config::ValidationError),
    }

    pub fn run(args: Args) -> Result<(), Error> {
        args.config.validate()?;
        for spec in &args.config.thermostats {
            tracing::info!(address = %spec.address, name = %spec.name, "thermostat configured");
        }
        println!("ok");
        Ok(())
    }
}

pub mod read {
    use crate::entity::ThermostatEntity;
    use crate::fields::FieldValue;

    /// Read the latest values of the configured thermostats once.
    #[derive(clap::Parser)]
    pub struct Args {
        #[clap(flatten)]
        config: crate::config::Args,
        #[clap(flatten)]
        output: crate::output::Args,
    }

    #[derive(thiserror::Error, Debug)]
    pub enum Error {
        #[error("configuration is invalid ({})", .0.reason())]
        Invalid(#[from] crate::config::ValidationError),
        #[error("could not output the values")]
        Output(#[from] crate::output::Error),
    }

    #[derive(serde::Serialize)]
    pub struct EntityRecord<'a> {
        pub unique_id: &'a str,
        pub name: &'a str,
        pub value: Option<&'a FieldValue>,
        pub unit: Option<&'static str>,
        pub icon: &'static str,
        pub available: bool,
        pub updated_at: Option<String>,
        pub manufacturer: &'static str,
        pub model: &'static str,
    }

    impl<'a> EntityRecord<'a> {
        fn new(entity: &'a ThermostatEntity, identity: &crate::entity::DeviceIdentity) -> Self {
            Self {
                unique_id: entity.unique_id(),
                name: entity.display_name(),
                value: entity.value(),
                unit: entity.unit(),
                icon: entity.icon(),
                available: entity.available(),
                updated_at: entity.last_updated().map(|t| t.to_string()),
                manufacturer: identity.manufacturer,
                model: identity.model,
            }
        }

        fn table_row(&self) -> Vec<String> {
            vec![
                self.unique_id.to_string(),
                self.name.to_string(),
                self.value.map(|v| v.to_string()).unwrap_or_default(),
                self.unit.unwrap_or_default().to_string(),
                self.icon.to_string(),
                self.available.to_string(),
                self.updated_at.clone().unwrap_or_default(),
            ]
        }
    }

    pub fn run(args: Args) -> Result<(), Error> {
        args.config.validate()?;
        let store = args.config.store();
        let mut thermostats = args.config.thermostats();
        let now = jiff::Timestamp::now();
        for thermostat in &mut thermostats {
            thermostat.refresh(&store, now);
        }
        let mut output = args.output.to_output()?;
        output.table_headers(&["Unique ID", "Name", "Value", "Unit", "Icon", "Available", "Logged"])?;
        for thermostat in &thermostats {
            for entity in thermostat.entities() {
                let record = EntityRecord::new(entity, thermostat.identity());
                output.result(|| record.table_row(), || &record)?;
            }
        }
        Ok(output.commit()?)
    }
}

pub mod serve {
    use crate::homie::ThermostatBridge;
    use std::sync::Arc;

    /// Publish the configured thermostats to an MQTT broker as a Homie device.
    #[derive(clap::Parser)]
    pub struct Args {
        #[clap(flatten)]
        config: crate::config::Args,
        #[clap(flatten)]
        homie: crate::homie::Args,
    }

    #[derive(thiserror::Error, Debug)]
    pub enum Error {
        #[error("configuration is invalid ({})", .0.reason())]
        Invalid(#[from] crate::config::ValidationError),
        #[error("could not start the async runtime")]
        Runtime(#[source] std::io::Error),
        #[error("the homie bridge failed")]
        Homie(#[from] crate::homie::Error),
    }

    pub fn run(args: Args) -> Result<(), Error> {
        args.config.validate()?;
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .build()
            .map_err(Error::Runtime)?;
        runtime.block_on(async move {
            let store = Arc::new(args.config.store());
            tracing::info!(
                database = ?store.path(),
                thermostats = args.config.thermostats.len(),
                poll_interval = %args.config.poll_interval,
                "starting the homie bridge"
            );
            let bridge = ThermostatBridge::new(
                &args.homie,
                store,
                args.config.thermostats(),
                *args.config.poll_interval,
            )?;
            bridge.run().await?;
            Ok(())
        })
    }
}
