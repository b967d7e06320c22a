//! Cluster alarms.
//!
//! An alarm marks a member as degraded (out of space, corrupt). Alarms are
//! raised and cleared through the log and persisted in the `alarm` bucket
//! keyed by `(member, alarm type)`; the applier quiesces writes while a
//! NOSPACE or CORRUPT alarm is active anywhere in the cluster.

use std::collections::BTreeSet;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex;

use serde::Deserialize;
use serde::Serialize;

use crate::storage::Backend;
use crate::storage::BatchTx;
use crate::storage::Bucket;
use crate::storage::TxReader;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum AlarmType {
    None,
    Nospace,
    Corrupt,
}

impl AlarmType {
    fn name(&self) -> &'static str {
        match self {
            AlarmType::None => "NONE",
            AlarmType::Nospace => "NOSPACE",
            AlarmType::Corrupt => "CORRUPT",
        }
    }
}

/// One raised alarm.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AlarmMember {
    pub member_id: crate::types::MemberId,
    pub alarm: AlarmType,
}

fn record_key(m: &AlarmMember) -> Vec<u8> {
    format!("{}-{}", m.member_id, m.alarm.name()).into_bytes()
}

/// The alarm table.
#[derive(Debug)]
pub struct AlarmStore {
    be: Arc<Backend>,
    types: Mutex<HashMap<AlarmType, BTreeSet<crate::types::MemberId>>>,
}

impl AlarmStore {
    pub fn new(be: Arc<Backend>) -> Self {
        let store = Self {
            be,
            types: Mutex::new(HashMap::new()),
        };
        store.restore();
        store
    }

    /// Reload raised alarms from the backend.
    pub fn restore(&self) {
        let tx = self.be.read_tx();
        let mut types: HashMap<AlarmType, BTreeSet<crate::types::MemberId>> = HashMap::new();
        for (_k, raw) in tx.unsafe_range(Bucket::Alarm, &[], Some(&[0]), 0) {
            let m: AlarmMember = serde_json::from_slice(&raw).expect("alarm record is well formed");
            types.entry(m.alarm).or_default().insert(m.member_id);
        }
        *self.types.lock().unwrap() = types;
    }

    /// Raise an alarm. Returns `None` when it was already raised.
    pub fn activate(&self, tx: &mut BatchTx<'_>, m: AlarmMember) -> Option<AlarmMember> {
        let mut types = self.types.lock().unwrap();
        if !types.entry(m.alarm).or_default().insert(m.member_id) {
            return None;
        }
        tx.unsafe_put(Bucket::Alarm, &record_key(&m), &serde_json::to_vec(&m).expect("alarm serializes"));
        tracing::warn!(member = %m.member_id, alarm = m.alarm.name(), "alarm raised");
        Some(m)
    }

    /// Clear an alarm. Returns `None` when it was not raised.
    pub fn deactivate(&self, tx: &mut BatchTx<'_>, m: AlarmMember) -> Option<AlarmMember> {
        let mut types = self.types.lock().unwrap();
        if !types.entry(m.alarm).or_default().remove(&m.member_id) {
            return None;
        }
        tx.unsafe_delete(Bucket::Alarm, &record_key(&m));
        tracing::info!(member = %m.member_id, alarm = m.alarm.name(), "alarm cleared");
        Some(m)
    }

    /// All raised alarms, or those of one type for `AlarmType::None`-free
    /// queries.
    pub fn get(&self, of: AlarmType) -> Vec<AlarmMember> {
        let types = self.types.lock().unwrap();
        let mut out = Vec::new();
        for (t, members) in types.iter() {
            if of != AlarmType::None && *t != of {
                continue;
            }
            out.extend(members.iter().map(|id| AlarmMember {
                member_id: *id,
                alarm: *t,
            }));
        }
        out.sort_by_key(|m| (m.alarm, m.member_id));
        out
    }

    /// Whether any member has this alarm raised.
    pub fn is_raised(&self, of: AlarmType) -> bool {
        self.types.lock().unwrap().get(&of).map(|s| !s.is_empty()).unwrap_or(false)
    }
}
