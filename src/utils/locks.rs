// Per-site serialization of mutating operations.
//
// The store is the one shared mutable resource; install, uninstall and
// migration runs against the SAME site name must not interleave. Different
// sites stay fully concurrent (disjoint paths, units and store entries).

use std::collections::HashMap;
use std::sync::{Arc, Mutex, OnceLock};

static SITE_LOCKS: OnceLock<Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>> = OnceLock::new();

/// Fetch (or create) the mutex guarding a site name.
///
/// Lock keys are case-insensitive, matching store entry naming.
pub fn site_lock(site_name: &str) -> Arc<tokio::sync::Mutex<()>> {
    let key = site_name.trim().to_ascii_lowercase();
    let table = SITE_LOCKS.get_or_init(|| Mutex::new(HashMap::new()));
    let mut map = table.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
    map.entry(key)
        .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
        .clone()
}
