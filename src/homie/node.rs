//! A thermostat as a Homie node.
//!
//! Every field descriptor becomes one property, plus an `available` property that turns false
//! once any of the thermostat's values goes stale or can't be read.

use crate::entity::Thermostat;
use crate::fields::FieldKind;
use crate::store::{self, LogRow};
use homie5::device_description::{
    HomieNodeDescription, HomiePropertyDescription, PropertyDescriptionBuilder,
};
use homie5::{HomieDataType, HomieID};
use std::collections::BTreeMap;

pub(crate) const NODE_TYPE: &str = "OpenHR20 thermostat";

#[derive(Debug, thiserror::Error)]
#[error("`{0}` is not a valid homie ID")]
pub struct InvalidId(String, #[source] Box<dyn std::error::Error + Send + Sync>);

pub(crate) fn homie_id(id: String) -> Result<HomieID, InvalidId> {
    HomieID::try_from(id.clone()).map_err(|e| InvalidId(id, e.into()))
}

/// Homie IDs only admit lowercase letters, digits and hyphens.
fn node_id_for(address: &str) -> String {
    let address = address
        .chars()
        .map(|c| match c.to_ascii_lowercase() {
            c @ ('a'..='z' | '0'..='9') => c,
            _ => '-',
        })
        .collect::<String>();
    format!("thermostat-{}", address.trim_matches('-'))
}

fn datatype(kind: FieldKind) -> HomieDataType {
    match kind {
        FieldKind::Text => HomieDataType::String,
        FieldKind::Integer => HomieDataType::Integer,
        FieldKind::Float => HomieDataType::Float,
        FieldKind::Boolean => HomieDataType::Boolean,
    }
}

/// A property value to publish.
#[derive(Debug, PartialEq)]
pub(crate) struct PropertyUpdate {
    pub node_id: HomieID,
    pub prop_id: HomieID,
    pub value: String,
}

pub(crate) struct ThermostatNode {
    node_id: HomieID,
    available_id: HomieID,
    /// Parallel to the thermostat's entities.
    prop_ids: Vec<HomieID>,
    thermostat: Thermostat,
    available: bool,
}

impl ThermostatNode {
    pub(crate) fn new(thermostat: Thermostat) -> Result<Self, InvalidId> {
        let node_id = homie_id(node_id_for(&thermostat.identity().address))?;
        let prop_ids = thermostat
            .entities()
            .iter()
            .map(|entity| homie_id(entity.descriptor().key.to_string()))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            node_id,
            available_id: HomieID::new_const("available"),
            prop_ids,
            available: thermostat.available(),
            thermostat,
        })
    }

    pub(crate) fn node_id(&self) -> &HomieID {
        &self.node_id
    }

    pub(crate) fn thermostat(&self) -> &Thermostat {
        &self.thermostat
    }

    pub(crate) fn available(&self) -> bool {
        self.available
    }

    pub(crate) fn description(&self) -> HomieNodeDescription {
        let mut properties = BTreeMap::new();
        for (entity, prop_id) in self.thermostat.entities().iter().zip(&self.prop_ids) {
            let descriptor = entity.descriptor();
            let mut builder = PropertyDescriptionBuilder::new(datatype(descriptor.kind)).retained(true);
            if let Some(unit) = descriptor.unit {
                builder = builder.unit(unit);
            }
            let mut description: HomiePropertyDescription = builder.build();
            description.name = Some(descriptor.name.to_string());
            description.settable = false;
            properties.insert(prop_id.clone(), description);
        }
        let mut available = PropertyDescriptionBuilder::new(HomieDataType::Boolean)
            .retained(true)
            .build();
        available.name = Some("values are fresh".to_string());
        properties.insert(self.available_id.clone(), available);
        HomieNodeDescription {
            name: Some(self.thermostat.identity().name.clone()),
            r#type: Some(NODE_TYPE.to_string()),
            properties,
        }
    }

    fn update(&self, prop_id: &HomieID, value: String) -> PropertyUpdate {
        PropertyUpdate {
            node_id: self.node_id.clone(),
            prop_id: prop_id.clone(),
            value,
        }
    }

    /// Every property that currently has a value.
    pub(crate) fn property_values(&self) -> Vec<PropertyUpdate> {
        let entities = self.thermostat.entities().iter().zip(&self.prop_ids);
        let mut updates = entities
            .filter_map(|(entity, prop_id)| Some(self.update(prop_id, entity.value()?.to_string())))
            .collect::<Vec<_>>();
        updates.push(self.update(&self.available_id, self.available.to_string()));
        updates
    }

    /// Apply one fetch outcome per entity, in entity order, and return what must be republished.
    pub(crate) fn apply(
        &mut self,
        outcomes: Vec<Result<Option<LogRow>, store::Error>>,
        now: jiff::Timestamp,
    ) -> Vec<PropertyUpdate> {
        let mut changed = Vec::new();
        let entities = self.thermostat.entities_mut().iter_mut();
        for ((entity, outcome), prop_id) in entities.zip(outcomes).zip(&self.prop_ids) {
            let previous = entity.value().cloned();
            entity.apply(outcome, now);
            match entity.value() {
                Some(value) if Some(value) != previous.as_ref() => {
                    changed.push((prop_id.clone(), value.to_string()));
                }
                _ => {}
            }
        }
        let mut updates = changed
            .into_iter()
            .map(|(prop_id, value)| self.update(&prop_id, value))
            .collect::<Vec<_>>();
        let available = self.thermostat.available();
        if available != self.available {
            self.available = available;
            updates.push(self.update(&self.available_id, available.to_string()));
        }
        updates
    }
}
