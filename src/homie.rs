//! Publishes the configured thermostats as a Homie v5 device over MQTT.

mod node;

use crate::entity::Thermostat;
use crate::homie::node::{PropertyUpdate, ThermostatNode};
use crate::store::{self, LogStore};
use homie5::client::{Publish, QoS};
use homie5::device_description::HomieDeviceDescription;
use homie5::{Homie5DeviceProtocol, HomieDeviceStatus, HomieDomain};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tokio_util::task::AbortOnDropHandle;

pub use node::InvalidId;

const RECONNECT_DELAY: Duration = Duration::from_secs(5);

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("could not parse the MQTT broker URL `{0}`")]
    BrokerUrl(String, #[source] Box<dyn std::error::Error + Send + Sync>),
    #[error(transparent)]
    InvalidId(#[from] InvalidId),
    #[error("could not serialize the homie device description")]
    Description(#[source] Box<dyn std::error::Error + Send + Sync>),
    #[error("could not publish to the MQTT broker")]
    Publish(#[source] rumqttc::v5::ClientError),
    #[error("could not wait for the interrupt signal")]
    Signal(#[source] std::io::Error),
}

#[derive(clap::Parser, Clone, Debug)]
#[group(id = "homie::Args")]
pub struct Args {
    /// MQTT broker to publish to, e.g. `mqtt://localhost:1883?client_id=openhr20`.
    #[arg(long)]
    pub mqtt: String,

    /// The homie device ID under which the thermostats are published.
    #[arg(long, default_value = "openhr20")]
    pub device_id: String,

    /// Request capacity of the MQTT client.
    #[arg(long, default_value = "64")]
    pub mqtt_capacity: usize,
}

/// The setup context: owns the broker connection, the protocol state and every thermostat.
pub struct ThermostatBridge {
    mqtt: rumqttc::v5::AsyncClient,
    protocol: Homie5DeviceProtocol,
    state: HomieDeviceStatus,
    description: HomieDeviceDescription,
    nodes: Vec<ThermostatNode>,
    store: Arc<dyn LogStore>,
    poll_interval: Duration,
    #[allow(unused)] // exists for its drop handler
    event_loop_task: AbortOnDropHandle<()>,
}

impl ThermostatBridge {
    pub fn new(
        args: &Args,
        store: Arc<dyn LogStore>,
        thermostats: Vec<Thermostat>,
        poll_interval: Duration,
    ) -> Result<Self, Error> {
        let device_id = node::homie_id(args.device_id.clone())?;
        let (protocol, last_will) = Homie5DeviceProtocol::new(device_id, HomieDomain::Default);
        let mut options = rumqttc::v5::MqttOptions::parse_url(args.mqtt.clone())
            .map_err(|e| Error::BrokerUrl(args.mqtt.clone(), e.into()))?;
        options.set_last_will(rumqttc::v5::mqttbytes::v5::LastWill::new(
            last_will.topic,
            last_will.message,
            convert_qos(last_will.qos),
            last_will.retain,
            None,
        ));
        let (mqtt, mut event_loop) = rumqttc::v5::AsyncClient::new(options, args.mqtt_capacity);
        let event_loop_task = AbortOnDropHandle::new(tokio::spawn(async move {
            loop {
                match event_loop.poll().await {
                    Ok(event) => tracing::trace!(?event, "mqtt event"),
                    Err(e) => {
                        tracing::warn!(
                            error = (&e as &dyn std::error::Error),
                            "mqtt connection failed, will reconnect"
                        );
                        tokio::time::sleep(RECONNECT_DELAY).await;
                    }
                }
            }
        }));

        let nodes = thermostats
            .into_iter()
            .map(ThermostatNode::new)
            .collect::<Result<Vec<_>, _>>()?;
        let mut description =
            homie5::device_description::DeviceDescriptionBuilder::new().name("OpenHR20 thermostats");
        for node in &nodes {
            description = description.add_node(node.node_id().clone(), node.description());
        }
        Ok(Self {
            mqtt,
            protocol,
            state: HomieDeviceStatus::Init,
            description: description.build(),
            nodes,
            store,
            poll_interval,
            event_loop_task,
        })
    }

    async fn publish(&self, p: Publish) -> Result<(), Error> {
        self.mqtt
            .publish(p.topic, convert_qos(p.qos), p.retain, p.payload)
            .await
            .map_err(Error::Publish)
    }

    async fn publish_state(&mut self, state: HomieDeviceStatus) -> Result<(), Error> {
        self.state = state;
        let p = self.protocol.publish_state(state);
        self.publish(p).await
    }

    async fn publish_updates(&self, updates: Vec<PropertyUpdate>) -> Result<(), Error> {
        for update in updates {
            let PropertyUpdate { node_id, prop_id, value } = update;
            tracing::debug!(node = ?node_id, property = ?prop_id, value = %value, "publishing value");
            let p = self.protocol.publish_value(&node_id, &prop_id, value, true);
            self.publish(p).await?;
        }
        Ok(())
    }

    pub async fn publish_device(&mut self) -> Result<(), Error> {
        for step in homie5::homie_device_publish_steps() {
            match step {
                homie5::DevicePublishStep::DeviceStateInit => {
                    self.publish_state(HomieDeviceStatus::Init).await?;
                }
                homie5::DevicePublishStep::DeviceDescription => {
                    let p = self
                        .protocol
                        .publish_description(&self.description)
                        .map_err(|e| Error::Description(e.into()))?;
                    self.publish(p).await?;
                }
                homie5::DevicePublishStep::PropertyValues => {
                    tracing::debug!("reading initial thermostat values…");
                    self.poll().await;
                    let updates = self.nodes.iter().flat_map(ThermostatNode::property_values);
                    self.publish_updates(updates.collect()).await?;
                    // Let the value publishes go out before `$state` flips.
                    tokio::task::yield_now().await;
                }
                homie5::DevicePublishStep::SubscribeProperties => {
                    // Nothing is settable, so there is nothing to subscribe to.
                }
                homie5::DevicePublishStep::DeviceStateReady => {
                    // Stale thermostats are reported through their `available` property.
                    tracing::debug!("device becomes ready...");
                    self.publish_state(HomieDeviceStatus::Ready).await?;
                }
            }
        }
        Ok(())
    }

    /// Refresh every entity of every thermostat. Each entity runs its own query.
    async fn poll(&mut self) -> Vec<PropertyUpdate> {
        let store = &self.store;
        let fetches = self.nodes.iter().map(|node| {
            let entities = node.thermostat().entities().iter();
            futures::future::join_all(entities.map(|entity| {
                store::fetch_latest(Arc::clone(store), entity.address().to_string())
            }))
        });
        let outcomes = futures::future::join_all(fetches).await;
        let now = jiff::Timestamp::now();
        let mut updates = Vec::new();
        for (node, outcomes) in self.nodes.iter_mut().zip(outcomes) {
            updates.extend(node.apply(outcomes, now));
        }
        updates
    }

    /// One polling cycle: read every thermostat and publish what changed.
    async fn poll_and_publish(&mut self) -> Result<(), Error> {
        let updates = self.poll().await;
        self.publish_updates(updates).await
    }

    /// Publish the device and keep it up to date until interrupted.
    pub async fn run(mut self) -> Result<(), Error> {
        self.publish_device().await?;
        tracing::info!(state = ?self.state, nodes = self.nodes.len(), "device published");
        let mut interval = tokio::time::interval(self.poll_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately and the device was just read.
        interval.tick().await;
        let shutdown = tokio::signal::ctrl_c();
        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                _ = interval.tick() => self.poll_and_publish().await?,
                signal = &mut shutdown => {
                    signal.map_err(Error::Signal)?;
                    tracing::info!("interrupted, disconnecting");
                    break;
                }
            }
        }
        self.publish_state(HomieDeviceStatus::Disconnected).await?;
        if let Err(e) = self.mqtt.disconnect().await {
            tracing::debug!(error = (&e as &dyn std::error::Error), "disconnect failed");
        }
        Ok(())
    }
}

pub fn convert_qos(homie: QoS) -> rumqttc::v5::mqttbytes::QoS {
    match homie {
        QoS::AtMostOnce => rumqttc::v5::mqttbytes::QoS::AtMostOnce,
        QoS::AtLeastOnce => rumqttc::v5::mqttbytes::QoS::AtLeastOnce,
        QoS::ExactlyOnce => rumqttc::v5::mqttbytes::QoS::ExactlyOnce,
    }
}
