//! Connection manager
//!
//! Maps `connect` requests onto shared registrations. Requests whose options
//! shape the delivered data identically share one registration (and one
//! initial read); each request still gets its own callback slot and its own
//! disconnect. A registration is torn down when its last slot disconnects.
//!
//! Registration identity is a structural [`RegistrationKey`], hashed as a
//! whole, so two option sets can only collide if they are equal.

use std::sync::Arc;

use hashbrown::HashMap;
use indexmap::IndexMap;
use parking_lot::Mutex;
use serde_json::Value;
use tracing::debug;

use crate::keys::is_collection_member_key;

/// Consumer callback: the new value (`None` when absent) and the key it belongs to.
pub type Callback = Arc<dyn Fn(Option<&Value>, &str) + Send + Sync>;

/// Projection applied to a value before delivery.
///
/// Identity is the underlying closure allocation: clones of one selector
/// share a registration, two separately built selectors never do.
#[derive(Clone)]
pub struct Selector(Arc<dyn Fn(Option<&Value>) -> Option<Value> + Send + Sync>);

impl Selector {
    pub fn new<F>(select: F) -> Self
    where
        F: Fn(Option<&Value>) -> Option<Value> + Send + Sync + 'static,
    {
        Self(Arc::new(select))
    }

    pub fn select(&self, value: Option<&Value>) -> Option<Value> {
        (self.0)(value)
    }

    fn id(&self) -> usize {
        Arc::as_ptr(&self.0) as *const () as usize
    }
}

impl std::fmt::Debug for Selector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Selector({:#x})", self.id())
    }
}

/// Options of a `connect` request.
#[derive(Clone)]
pub struct ConnectOptions {
    /// Key or collection key to observe
    pub key: String,
    pub callback: Callback,
    /// For a collection key: deliver the whole snapshot at once instead of one call per member
    pub wait_for_collection_callback: bool,
    /// Deliver the current value right after connecting
    pub init_with_stored_values: bool,
    /// Allow sharing a registration with an identical request
    pub reuse_connection: bool,
    /// `false` pins the key against eviction while connected
    pub can_evict: bool,
    pub selector: Option<Selector>,
}

impl ConnectOptions {
    pub fn new<F>(key: impl Into<String>, callback: F) -> Self
    where
        F: Fn(Option<&Value>, &str) + Send + Sync + 'static,
    {
        Self {
            key: key.into(),
            callback: Arc::new(callback),
            wait_for_collection_callback: false,
            init_with_stored_values: true,
            reuse_connection: true,
            can_evict: true,
            selector: None,
        }
    }

    pub fn wait_for_collection_callback(mut self, wait: bool) -> Self {
        self.wait_for_collection_callback = wait;
        self
    }

    pub fn init_with_stored_values(mut self, init: bool) -> Self {
        self.init_with_stored_values = init;
        self
    }

    pub fn reuse_connection(mut self, reuse: bool) -> Self {
        self.reuse_connection = reuse;
        self
    }

    pub fn can_evict(mut self, can_evict: bool) -> Self {
        self.can_evict = can_evict;
        self
    }

    pub fn selector(mut self, selector: Selector) -> Self {
        self.selector = Some(selector);
        self
    }
}

impl std::fmt::Debug for ConnectOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectOptions")
            .field("key", &self.key)
            .field("wait_for_collection_callback", &self.wait_for_collection_callback)
            .field("init_with_stored_values", &self.init_with_stored_values)
            .field("reuse_connection", &self.reuse_connection)
            .field("can_evict", &self.can_evict)
            .field("selector", &self.selector)
            .finish()
    }
}

/// Everything that decides whether two requests may share a registration.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct RegistrationKey {
    key: String,
    wait_for_collection_callback: bool,
    init_with_stored_values: bool,
    selector: Option<usize>,
    /// Registrations from before a `clear` are never reused after it
    session: u64,
    /// Set for requests that must not share
    unique: Option<u64>,
}

/// Identifies one callback slot of one registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionHandle {
    pub registration_id: u64,
    pub callback_id: u64,
}

/// What a `connect` call has to do next.
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectOutcome {
    /// A new registration: the caller performs the initial delivery
    New,
    /// Joined a registration that already delivered; this is what it last delivered
    Delivered { value: Option<Value>, key: String },
    /// Joined a registration whose initial delivery is still in flight
    Pending,
}

/// Read-only view of a registration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistrationInfo {
    pub registration_id: u64,
    pub key: String,
    pub wait_for_collection_callback: bool,
    pub init_with_stored_values: bool,
    pub can_evict: bool,
}

/// How a change to some key reaches a registration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Delivery {
    /// The changed key's own value
    Value,
    /// The snapshot of this collection
    Collection(String),
}

struct Registration {
    info: RegistrationInfo,
    registration_key: RegistrationKey,
    selector: Option<Selector>,
    /// Callback slots in connect order
    callbacks: IndexMap<u64, Callback>,
    /// Initial delivery done
    is_connection_made: bool,
    last_value: Option<Value>,
    last_key: Option<String>,
}

#[derive(Default)]
struct ConnectionState {
    registrations: HashMap<u64, Registration>,
    by_key: HashMap<RegistrationKey, u64>,
    next_registration_id: u64,
    next_callback_id: u64,
    next_unique: u64,
    session: u64,
}

/// Registry of live registrations and their callback slots.
#[derive(Default)]
pub struct ConnectionManager {
    state: Mutex<ConnectionState>,
}

impl ConnectionManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `options`, joining an identical registration when allowed.
    ///
    /// `is_collection_key` tells whether `options.key` is a registered collection key.
    pub fn connect(
        &self,
        options: ConnectOptions,
        is_collection_key: bool,
    ) -> (ConnectionHandle, ConnectOutcome) {
        let mut state = self.state.lock();

        let must_be_unique = !options.reuse_connection
            || !options.init_with_stored_values
            || (is_collection_key && !options.wait_for_collection_callback);
        let unique = if must_be_unique {
            state.next_unique += 1;
            Some(state.next_unique)
        } else {
            None
        };
        let registration_key = RegistrationKey {
            key: options.key.clone(),
            wait_for_collection_callback: options.wait_for_collection_callback,
            init_with_stored_values: options.init_with_stored_values,
            selector: options.selector.as_ref().map(Selector::id),
            session: state.session,
            unique,
        };

        state.next_callback_id += 1;
        let callback_id = state.next_callback_id;

        let existing = state.by_key.get(&registration_key).copied();
        if let Some(registration_id) = existing {
            if let Some(registration) = state.registrations.get_mut(&registration_id) {
                registration.callbacks.insert(callback_id, options.callback);
                let outcome = if registration.is_connection_made {
                    ConnectOutcome::Delivered {
                        value: registration.last_value.clone(),
                        key: registration
                            .last_key
                            .clone()
                            .unwrap_or_else(|| registration.info.key.clone()),
                    }
                } else {
                    ConnectOutcome::Pending
                };
                debug!(key = %options.key, registration_id, "joined existing connection");
                return (ConnectionHandle { registration_id, callback_id }, outcome);
            }
        }

        state.next_registration_id += 1;
        let registration_id = state.next_registration_id;
        let mut callbacks = IndexMap::new();
        callbacks.insert(callback_id, options.callback);
        state.by_key.insert(registration_key.clone(), registration_id);
        state.registrations.insert(
            registration_id,
            Registration {
                info: RegistrationInfo {
                    registration_id,
                    key: options.key,
                    // Only a collection key has a snapshot to deliver
                    wait_for_collection_callback: options.wait_for_collection_callback
                        && is_collection_key,
                    init_with_stored_values: options.init_with_stored_values,
                    can_evict: options.can_evict,
                },
                registration_key,
                selector: options.selector,
                callbacks,
                is_connection_made: !options.init_with_stored_values,
                last_value: None,
                last_key: None,
            },
        );
        (ConnectionHandle { registration_id, callback_id }, ConnectOutcome::New)
    }

    /// Remove one callback slot. Returns the registration if this was its last slot.
    pub fn disconnect(&self, handle: ConnectionHandle) -> Option<RegistrationInfo> {
        let mut state = self.state.lock();
        let registration = state.registrations.get_mut(&handle.registration_id)?;
        registration.callbacks.shift_remove(&handle.callback_id);
        if !registration.callbacks.is_empty() {
            return None;
        }
        let registration = state.registrations.remove(&handle.registration_id)?;
        state.by_key.remove(&registration.registration_key);
        debug!(
            key = %registration.info.key,
            registration_id = handle.registration_id,
            "connection torn down"
        );
        Some(registration.info)
    }

    /// Tear down every registration.
    pub fn disconnect_all(&self) -> Vec<RegistrationInfo> {
        let mut state = self.state.lock();
        state.by_key.clear();
        state.registrations.drain().map(|(_, registration)| registration.info).collect()
    }

    /// Start a new session: later connects never join earlier registrations.
    pub fn refresh_session_id(&self) {
        self.state.lock().session += 1;
    }

    pub fn registration(&self, registration_id: u64) -> Option<RegistrationInfo> {
        let state = self.state.lock();
        state.registrations.get(&registration_id).map(|registration| registration.info.clone())
    }

    pub fn registration_count(&self) -> usize {
        self.state.lock().registrations.len()
    }

    pub fn callback_count(&self, registration_id: u64) -> usize {
        let state = self.state.lock();
        state
            .registrations
            .get(&registration_id)
            .map_or(0, |registration| registration.callbacks.len())
    }

    /// Registrations affected by a change to `key`, in registration order.
    ///
    /// `owning_collection` is the collection `key` belongs to, if any.
    /// Registrations still waiting for their initial delivery are skipped;
    /// that delivery reads the cache and so already includes the change.
    pub fn subscribers(&self, key: &str, owning_collection: Option<&str>) -> Vec<(u64, Delivery)> {
        let state = self.state.lock();
        let mut subscribers: Vec<(u64, Delivery)> = state
            .registrations
            .values()
            .filter(|registration| registration.is_connection_made)
            .filter_map(|registration| {
                let info = &registration.info;
                if info.key == key {
                    if info.wait_for_collection_callback {
                        return Some((info.registration_id, Delivery::Collection(info.key.clone())));
                    }
                    return Some((info.registration_id, Delivery::Value));
                }
                if is_collection_member_key(&info.key, key)
                    && owning_collection == Some(info.key.as_str())
                {
                    return Some(if info.wait_for_collection_callback {
                        (info.registration_id, Delivery::Collection(info.key.clone()))
                    } else {
                        (info.registration_id, Delivery::Value)
                    });
                }
                None
            })
            .collect();
        subscribers.sort_by_key(|(registration_id, _)| *registration_id);
        subscribers
    }

    /// Deliver `value` for `source_key` to every slot of a registration.
    ///
    /// With a selector, the selected value is delivered, and nothing is
    /// delivered if it equals the previous selection. Callbacks run with no
    /// lock held.
    pub fn fire(&self, registration_id: u64, value: Option<&Value>, source_key: &str) {
        let (callbacks, delivered) = {
            let mut state = self.state.lock();
            let Some(registration) = state.registrations.get_mut(&registration_id) else {
                return;
            };
            let delivered = match &registration.selector {
                Some(selector) => {
                    let selected = selector.select(value);
                    if registration.is_connection_made && registration.last_value == selected {
                        registration.last_key = Some(source_key.to_owned());
                        return;
                    }
                    selected
                }
                None => value.cloned(),
            };
            registration.is_connection_made = true;
            registration.last_value = delivered.clone();
            registration.last_key = Some(source_key.to_owned());
            let callbacks: Vec<Callback> = registration.callbacks.values().cloned().collect();
            (callbacks, delivered)
        };
        for callback in callbacks {
            callback(delivered.as_ref(), source_key);
        }
    }

    /// Deliver to a single slot without touching registration state.
    pub fn fire_one(&self, handle: ConnectionHandle, value: Option<&Value>, source_key: &str) {
        let callback = {
            let state = self.state.lock();
            state
                .registrations
                .get(&handle.registration_id)
                .and_then(|registration| registration.callbacks.get(&handle.callback_id))
                .cloned()
        };
        if let Some(callback) = callback {
            callback(value, source_key);
        }
    }
}

impl std::fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("registrations", &self.registration_count())
            .finish()
    }
}
