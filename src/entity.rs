use crate::fields::{FIELDS, FieldDescriptor, FieldValue};
use crate::store::{self, LogRow, LogStore};
use std::time::Duration;

/// Entities become unavailable once no fresh row has arrived for this many poll intervals.
pub const STALE_AFTER_POLLS: u32 = 3;

pub const MANUFACTURER: &str = "OpenHR20";
pub const MODEL: &str = "HR20";

/// Whether a row logged at `logged_at` is still fresh at `now`.
pub fn is_fresh(logged_at: jiff::Timestamp, now: jiff::Timestamp, poll_interval: Duration) -> bool {
    let age = now.duration_since(logged_at);
    let max_age = poll_interval.saturating_mul(STALE_AFTER_POLLS);
    match jiff::SignedDuration::try_from(max_age) {
        Ok(max_age) => age <= max_age,
        Err(_) => true,
    }
}

/// The physical thermostat that a group of entities describes.
#[derive(Clone, Debug, PartialEq, Eq, serde::Serialize)]
pub struct DeviceIdentity {
    pub address: String,
    pub name: String,
    pub manufacturer: &'static str,
    pub model: &'static str,
}

impl DeviceIdentity {
    pub fn new(address: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            name: name.into(),
            manufacturer: MANUFACTURER,
            model: MODEL,
        }
    }
}

#[derive(Clone, Copy, Debug)]
pub struct Policy {
    pub poll_interval: Duration,
    /// Availability reported before the first fresh row is seen.
    pub initially_available: bool,
}

/// One value of one thermostat as presented to the hub.
#[derive(Debug)]
pub struct ThermostatEntity {
    unique_id: String,
    display_name: String,
    address: String,
    descriptor: &'static FieldDescriptor,
    value: Option<FieldValue>,
    icon: &'static str,
    available: bool,
    last_updated: Option<jiff::Timestamp>,
    poll_interval: Duration,
}

impl ThermostatEntity {
    pub fn new(
        device: &DeviceIdentity,
        descriptor: &'static FieldDescriptor,
        policy: Policy,
    ) -> Self {
        Self {
            unique_id: format!("{}-{}", device.address, descriptor.key),
            display_name: format!("{} {}", device.name, descriptor.name),
            address: device.address.clone(),
            descriptor,
            value: None,
            icon: descriptor.icons[0],
            available: policy.initially_available,
            last_updated: None,
            poll_interval: policy.poll_interval,
        }
    }

    pub fn unique_id(&self) -> &str {
        &self.unique_id
    }
    pub fn display_name(&self) -> &str {
        &self.display_name
    }
    pub fn address(&self) -> &str {
        &self.address
    }
    pub fn descriptor(&self) -> &'static FieldDescriptor {
        self.descriptor
    }
    pub fn value(&self) -> Option<&FieldValue> {
        self.value.as_ref()
    }
    pub fn unit(&self) -> Option<&'static str> {
        self.descriptor.unit
    }
    pub fn icon(&self) -> &'static str {
        self.icon
    }
    pub fn available(&self) -> bool {
        self.available
    }
    /// Log time of the row the current value was derived from.
    pub fn last_updated(&self) -> Option<jiff::Timestamp> {
        self.last_updated
    }

    /// Fetch the latest row and project it onto this entity.
    ///
    /// Returns `true` if anything visible to the hub has changed.
    pub fn refresh(&mut self, store: &dyn LogStore, now: jiff::Timestamp) -> bool {
        let outcome = store.latest(&self.address);
        self.apply(outcome, now)
    }

    /// Project an already fetched outcome onto this entity.
    ///
    /// Fetch failures are logged and turn the entity unavailable, the last known value stays.
    /// An empty result changes nothing.
    pub fn apply(
        &mut self,
        outcome: Result<Option<LogRow>, store::Error>,
        now: jiff::Timestamp,
    ) -> bool {
        let before = (self.value.clone(), self.icon, self.available);
        match outcome {
            Ok(Some(row)) => {
                let value = (self.descriptor.extract)(&row);
                self.icon = (self.descriptor.icon)(&value);
                self.value = Some(value);
                self.available = is_fresh(row.time, now, self.poll_interval);
                self.last_updated = Some(row.time);
                if !self.available {
                    tracing::debug!(
                        address = %self.address,
                        field = self.descriptor.key,
                        logged_at = %row.time,
                        "latest row is stale"
                    );
                }
            }
            Ok(None) => {
                tracing::trace!(
                    address = %self.address,
                    field = self.descriptor.key,
                    "no rows logged for this address"
                );
            }
            Err(e) => {
                let kind = if e.is_malformed_row() {
                    "malformed row"
                } else {
                    "storage unavailable"
                };
                tracing::warn!(
                    address = %self.address,
                    field = self.descriptor.key,
                    kind,
                    error = (&e as &dyn std::error::Error),
                    "could not refresh the entity"
                );
                self.available = false;
            }
        }
        before != (self.value.clone(), self.icon, self.available)
    }
}

/// All entities exposed for one thermostat.
#[derive(Debug)]
pub struct Thermostat {
    identity: DeviceIdentity,
    entities: Vec<ThermostatEntity>,
}

impl Thermostat {
    pub fn new(identity: DeviceIdentity, policy: Policy) -> Self {
        let entities = FIELDS
            .iter()
            .map(|descriptor| ThermostatEntity::new(&identity, descriptor, policy))
            .collect();
        Self { identity, entities }
    }

    pub fn identity(&self) -> &DeviceIdentity {
        &self.identity
    }

    pub fn entities(&self) -> &[ThermostatEntity] {
        &self.entities
    }

    pub fn entities_mut(&mut self) -> &mut [ThermostatEntity] {
        &mut self.entities
    }

    /// Refresh every entity on its own. Returns the indices of entities that changed.
    pub fn refresh(&mut self, store: &dyn LogStore, now: jiff::Timestamp) -> Vec<usize> {
        self.entities
            .iter_mut()
            .enumerate()
            .filter_map(|(idx, entity)| entity.refresh(store, now).then_some(idx))
            .collect()
    }

    pub fn available(&self) -> bool {
        self.entities.iter().all(ThermostatEntity::available)
    }
}
