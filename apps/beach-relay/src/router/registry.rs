use std::collections::HashMap;

use transport_bus::TransportId;

use super::stream::{Origin, StreamHandle};
use super::RouteError;
use crate::protocol::{RecipientId, Role, Scope, StreamKey, SubscriptionId};

pub(crate) struct StreamEntry {
    pub handle: StreamHandle,
    pub origin: Origin,
}

/// At most one live stream per key, plus the reverse index used to route
/// inbound frames by the subscription they arrived on.
#[derive(Default)]
pub(crate) struct Registry {
    streams: HashMap<StreamKey, StreamEntry>,
    subscriptions: HashMap<(TransportId, SubscriptionId), StreamKey>,
}

impl Registry {
    pub fn get(&self, key: &StreamKey) -> Option<&StreamEntry> {
        self.streams.get(key)
    }

    pub fn lookup(
        &self,
        transport: TransportId,
        subscription_id: &SubscriptionId,
    ) -> Option<&StreamEntry> {
        self.subscriptions
            .get(&(transport, subscription_id.clone()))
            .and_then(|key| self.streams.get(key))
    }

    /// Inserts `entry`, returning the stream it supersedes under the same key.
    pub fn insert(&mut self, entry: StreamEntry) -> Option<StreamEntry> {
        let key = entry.handle.key().clone();
        let superseded = self.remove(&key);
        self.subscriptions.insert(
            (
                entry.handle.transport_id(),
                entry.handle.subscription_id().clone(),
            ),
            key.clone(),
        );
        self.streams.insert(key, entry);
        superseded
    }

    pub fn remove(&mut self, key: &StreamKey) -> Option<StreamEntry> {
        let entry = self.streams.remove(key)?;
        self.subscriptions.remove(&(
            entry.handle.transport_id(),
            entry.handle.subscription_id().clone(),
        ));
        Some(entry)
    }

    pub fn remove_subscription(
        &mut self,
        transport: TransportId,
        subscription_id: &SubscriptionId,
    ) -> Option<StreamEntry> {
        let key = self
            .subscriptions
            .get(&(transport, subscription_id.clone()))?
            .clone();
        self.remove(&key)
    }

    pub fn remove_transport(&mut self, transport: TransportId) -> Vec<StreamEntry> {
        let keys: Vec<StreamKey> = self
            .streams
            .iter()
            .filter(|(_, entry)| entry.handle.transport_id() == transport)
            .map(|(key, _)| key.clone())
            .collect();
        keys.iter().filter_map(|key| self.remove(key)).collect()
    }

    /// Maps addressing fields to exactly one stream. A named recipient only
    /// ever resolves to that recipient's own stream.
    pub fn resolve(
        &self,
        scope: &Scope,
        recipient: Option<&RecipientId>,
    ) -> Result<&StreamEntry, RouteError> {
        let key = StreamKey::from_addressing(scope.clone(), recipient.cloned());
        if let Some(entry) = self.streams.get(&key) {
            return Ok(entry);
        }
        if recipient.is_none() && self.has_viewers(scope) {
            return Err(RouteError::RecipientRequired(scope.clone()));
        }
        Err(RouteError::NoStream(key))
    }

    pub fn keys_for_scope(&self, scope: &Scope) -> Vec<StreamKey> {
        let mut keys: Vec<StreamKey> = self
            .streams
            .keys()
            .filter(|key| &key.scope == scope)
            .cloned()
            .collect();
        keys.sort();
        keys
    }

    pub fn len(&self) -> usize {
        self.streams.len()
    }

    pub fn count_role(&self, role: Role) -> usize {
        self.streams.keys().filter(|key| key.role == role).count()
    }

    fn has_viewers(&self, scope: &Scope) -> bool {
        self.streams
            .keys()
            .any(|key| &key.scope == scope && key.role == Role::Viewer)
    }
}
