use std::collections::{BTreeMap, HashMap};

use playground_process::SupervisedProcess;
use playground_proto::{DisplayItem, ServiceKind, ServiceStatus};

pub struct ServiceRecord {
    pub name: String,
    pub kind: ServiceKind,
    pub ordinal: u32,
    pub version: String,
    pub status: ServiceStatus,
    pub process: SupervisedProcess,
}

impl ServiceRecord {
    pub fn display_item(&self) -> DisplayItem {
        DisplayItem {
            name: self.name.clone(),
            service_id: self.kind,
            pid: Some(self.process.pid),
            status: self.status,
            version: self.version.clone(),
        }
    }
}

/// Supervised services keyed by name. Ordinals are never reused.
#[derive(Default)]
pub struct ServiceTable {
    records: BTreeMap<String, ServiceRecord>,
    next_ordinal: HashMap<ServiceKind, u32>,
}

impl ServiceTable {
    pub fn allocate(&mut self, kind: ServiceKind) -> (String, u32) {
        let next = self.next_ordinal.entry(kind).or_insert(0);
        let ordinal = *next;
        *next += 1;
        (format!("{kind}-{ordinal}"), ordinal)
    }

    pub fn insert(&mut self, record: ServiceRecord) {
        self.records.insert(record.name.clone(), record);
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut ServiceRecord> {
        self.records.get_mut(name)
    }

    pub fn remove(&mut self, name: &str) -> Option<ServiceRecord> {
        self.records.remove(name)
    }

    pub fn name_for_pid(&self, pid: u32) -> Option<String> {
        self.records
            .values()
            .find(|r| r.process.pid == pid)
            .map(|r| r.name.clone())
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Rows in boot order, then by ordinal.
    pub fn display_items(&self) -> Vec<DisplayItem> {
        let mut rows: Vec<&ServiceRecord> = self.records.values().collect();
        rows.sort_by_key(|r| (r.kind, r.ordinal));
        rows.into_iter().map(ServiceRecord::display_item).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ordinals_are_per_kind_and_monotonic() {
        let mut table = ServiceTable::default();
        assert_eq!(table.allocate(ServiceKind::Tidb), ("tidb-0".to_string(), 0));
        assert_eq!(table.allocate(ServiceKind::Tidb), ("tidb-1".to_string(), 1));
        assert_eq!(table.allocate(ServiceKind::Pd), ("pd-0".to_string(), 0));
        assert!(table.is_empty());
    }
}
