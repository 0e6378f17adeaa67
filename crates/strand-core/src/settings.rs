//! Live settings registry
//!
//! Named integer variables that can be read cheaply from hot paths, updated
//! at runtime, and observed through change listeners. A variable's initial
//! value may be overridden from the environment: `tcp.connect.timeout`
//! becomes `STRAND_TCP_CONNECT_TIMEOUT`.
//!
//! ```ignore
//! static CONNECT_TIMEOUT: ... = settings::int_var("tcp.connect.timeout", 5000, "...");
//! let to = settings::int_var("tcp.connect.timeout", 5000, "tcp connect timeout").get();
//! ```

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Mutex, OnceLock, RwLock};

use crate::env::env_get_opt;

type Listener = Box<dyn Fn(i64, i64) + Send + Sync>;

/// A named integer setting with change notification.
pub struct IntVar {
    name: String,
    description: &'static str,
    value: AtomicI64,
    listeners: Mutex<Vec<Listener>>,
}

impl IntVar {
    fn new(name: String, description: &'static str, initial: i64) -> Self {
        Self {
            name,
            description,
            value: AtomicI64::new(initial),
            listeners: Mutex::new(Vec::new()),
        }
    }

    /// Registered name, e.g. `tcp.connect.timeout`.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Human-readable description.
    pub fn description(&self) -> &'static str {
        self.description
    }

    /// Current value.
    #[inline]
    pub fn get(&self) -> i64 {
        self.value.load(Ordering::Relaxed)
    }

    /// Update the value, notifying listeners with (old, new). Listeners run
    /// synchronously on the calling thread; a no-op when the value is
    /// unchanged.
    pub fn set(&self, new: i64) {
        let old = self.value.swap(new, Ordering::Relaxed);
        if old == new {
            return;
        }
        let listeners = self.listeners.lock().unwrap();
        for cb in listeners.iter() {
            cb(old, new);
        }
    }

    /// Register a change listener. Lives for the life of the process.
    pub fn on_change<F>(&self, cb: F)
    where
        F: Fn(i64, i64) + Send + Sync + 'static,
    {
        self.listeners.lock().unwrap().push(Box::new(cb));
    }
}

fn registry() -> &'static RwLock<HashMap<String, &'static IntVar>> {
    static REGISTRY: OnceLock<RwLock<HashMap<String, &'static IntVar>>> = OnceLock::new();
    REGISTRY.get_or_init(|| RwLock::new(HashMap::new()))
}

/// Environment key for a setting name: `tcp.connect.timeout` ->
/// `STRAND_TCP_CONNECT_TIMEOUT`.
fn env_key(name: &str) -> String {
    let mut key = String::with_capacity(name.len() + 7);
    key.push_str("STRAND_");
    for c in name.chars() {
        match c {
            '.' | '-' => key.push('_'),
            c => key.push(c.to_ascii_uppercase()),
        }
    }
    key
}

/// Look up or register an integer setting.
///
/// The first caller for a given name fixes the default (possibly overridden
/// by the environment); later callers get the same `&'static IntVar`
/// regardless of the default they pass.
pub fn int_var(name: &str, default: i64, description: &'static str) -> &'static IntVar {
    if let Some(var) = registry().read().unwrap().get(name) {
        return *var;
    }

    let mut map = registry().write().unwrap();
    // Re-check under the write lock; another thread may have won.
    if let Some(var) = map.get(name) {
        return *var;
    }
    let initial = env_get_opt::<i64>(&env_key(name)).unwrap_or(default);
    let var: &'static IntVar = Box::leak(Box::new(IntVar::new(
        name.to_string(),
        description,
        initial,
    )));
    map.insert(name.to_string(), var);
    var
}

/// Look up an existing setting without registering one.
pub fn lookup(name: &str) -> Option<&'static IntVar> {
    registry().read().unwrap().get(name).copied()
}
