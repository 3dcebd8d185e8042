use std::collections::{BTreeSet, HashMap};

use crate::measurement::{Device, MetricKind};

struct Entry {
    device: Device,
    sources: BTreeSet<usize>,
}

/// The devices known behind one gateway, in the order they were first seen.
///
/// Sources are indices into the coordinator's client list. A device stays
/// registered once discovered, even if a later discovery no longer lists it.
#[derive(Default)]
pub struct DeviceRegistry {
    order: Vec<String>,
    entries: HashMap<String, Entry>,
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records that `source` can serve `discovered`. Returns true when the
    /// serial number was not known before.
    pub fn register(&mut self, source: usize, discovered: Device) -> bool {
        if let Some(entry) = self.entries.get_mut(&discovered.serial_number) {
            entry.sources.insert(source);
            let known = &mut entry.device;
            known.capabilities.extend(discovered.capabilities);
            if known.display_name.is_none() {
                known.display_name = discovered.display_name;
            }
            if known.model.is_none() {
                known.model = discovered.model;
            }
            if discovered.firmware_version.is_some() {
                known.firmware_version = discovered.firmware_version;
            }
            known.manufacturers.extend(discovered.manufacturers);
            return false;
        }

        let serial = discovered.serial_number.clone();
        self.order.push(serial.clone());
        self.entries.insert(
            serial,
            Entry {
                device: discovered,
                sources: BTreeSet::from([source]),
            },
        );
        true
    }

    pub fn extend_capabilities(
        &mut self,
        serial_number: &str,
        kinds: impl IntoIterator<Item = MetricKind>,
    ) {
        if let Some(entry) = self.entries.get_mut(serial_number) {
            entry.device.capabilities.extend(kinds);
        }
    }

    pub fn get(&self, serial_number: &str) -> Option<&Device> {
        self.entries.get(serial_number).map(|e| &e.device)
    }

    pub fn devices(&self) -> impl Iterator<Item = &Device> {
        self.order.iter().filter_map(|sn| self.get(sn))
    }

    pub fn sources(&self, serial_number: &str) -> impl Iterator<Item = usize> + '_ {
        self.entries
            .get(serial_number)
            .into_iter()
            .flat_map(|e| e.sources.iter().copied())
    }

    /// Every (source, device) pair to fetch on a tick.
    pub fn fetch_pairs(&self) -> Vec<(usize, Device)> {
        self.order
            .iter()
            .filter_map(|sn| self.entries.get(sn))
            .flat_map(|e| e.sources.iter().map(|s| (*s, e.device.clone())))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}
