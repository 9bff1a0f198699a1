//! In-memory registry of live instances: ID allocation, lookup, reload.

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::{Arc, Mutex};

use chrono::Utc;
use tracing::{info, warn};

use grove_types::{paths, InstanceState};

use crate::instance::Instance;
use crate::persist;

/// Ordered characters used to build instance IDs. Single-character IDs are
/// assigned first (digits 1-9, then a-z), giving 35 slots before
/// two-character combinations.
const ID_ALPHABET: [char; 35] = [
    '1', '2', '3', '4', '5', '6', '7', '8', '9', 'a', 'b', 'c', 'd', 'e', 'f', 'g', 'h', 'i',
    'j', 'k', 'l', 'm', 'n', 'o', 'p', 'q', 'r', 's', 't', 'u', 'v', 'w', 'x', 'y', 'z',
];

struct Inner {
    instances: HashMap<String, Arc<Instance>>,
    /// IDs handed out to in-flight setups, not yet registered.
    reserved: HashSet<String>,
}

/// The registry. A single mutex protects the map, the reservation set, and
/// ID allocation.
pub struct Registry {
    inner: Mutex<Inner>,
}

impl Registry {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                instances: HashMap::new(),
                reserved: HashSet::new(),
            }),
        }
    }

    /// Reserve the lowest unused ID. The reservation holds the slot while
    /// setup runs; [`release_id`](Registry::release_id) or
    /// [`insert`](Registry::insert) clears it.
    pub fn allocate_id(&self) -> String {
        let mut inner = self.inner.lock().unwrap();
        let id = Self::next_unused(&inner);
        inner.reserved.insert(id.clone());
        id
    }

    fn next_unused(inner: &Inner) -> String {
        let taken =
            |id: &str| inner.instances.contains_key(id) || inner.reserved.contains(id);
        for c in ID_ALPHABET {
            let id = c.to_string();
            if !taken(&id) {
                return id;
            }
        }
        for a in ID_ALPHABET {
            for b in ID_ALPHABET {
                let id = format!("{a}{b}");
                if !taken(&id) {
                    return id;
                }
            }
        }
        // Extremely unlikely: fall back to random hex.
        let bytes: [u8; 4] = rand::random();
        bytes.iter().map(|b| format!("{b:02x}")).collect()
    }

    /// Drop an unused reservation after a failed setup.
    pub fn release_id(&self, id: &str) {
        self.inner.lock().unwrap().reserved.remove(id);
    }

    /// Register an instance, consuming any reservation of its ID.
    pub fn insert(&self, instance: Arc<Instance>) {
        let mut inner = self.inner.lock().unwrap();
        inner.reserved.remove(&instance.id);
        inner.instances.insert(instance.id.clone(), instance);
    }

    pub fn get(&self, id: &str) -> Option<Arc<Instance>> {
        self.inner.lock().unwrap().instances.get(id).cloned()
    }

    pub fn remove(&self, id: &str) -> Option<Arc<Instance>> {
        self.inner.lock().unwrap().instances.remove(id)
    }

    /// All live instances, in no particular order.
    pub fn snapshot(&self) -> Vec<Arc<Instance>> {
        self.inner.lock().unwrap().instances.values().cloned().collect()
    }

    /// Reload persisted records from a previous daemon run.
    ///
    /// Instances persisted in a non-terminal state lost their child when the
    /// daemon died, so they reload as `CRASHED` with ended-at = now;
    /// terminal states are preserved verbatim.
    pub fn load_persisted(&self, root: &Path) {
        let records = persist::load_records(&paths::instances_dir(root));
        for mut record in records {
            let rewritten = !record.state.is_terminal();
            if rewritten {
                record.state = InstanceState::Crashed;
                record.ended_at = Utc::now().timestamp();
            }
            let instance = Instance::from_record(
                &record,
                paths::instance_log(root, &record.id),
                paths::instance_record(root, &record.id),
            );
            if rewritten {
                instance.persist();
                warn!(instance = %record.id, "reloaded mid-run instance as CRASHED");
            }
            self.insert(instance);
        }
        let count = self.inner.lock().unwrap().instances.len();
        if count > 0 {
            info!(count, "reloaded persisted instances");
        }
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}
