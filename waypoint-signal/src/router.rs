//! Message Router: classifies inbound frames and forwards or broadcasts.
//!
//! The router is a stateless dispatcher over the registry and the presence
//! store. It never tracks which identities are in a call; every relay frame
//! carries its own target. Targeted routing is best-effort unicast: a frame
//! addressed to an unregistered identity is logged and dropped, because the
//! target may legitimately have disconnected between invitation and relay
//! and the protocol has no NACK channel.
//!
//! A send failure is evidence the transport is dead and triggers the same
//! cleanup as an explicit close. Broadcasts iterate every connection and
//! drop only the failing ones, so a dead peer never stalls delivery to
//! healthy peers.

use std::sync::Arc;

use log::{debug, info, warn};
use serde::Serialize;

use crate::presence::{PresenceStore, PresenceUpdate};
use crate::protocol::{
    ClientAction, ClientFrame, ClientId, PresenceEvent, PresenceRecord, RelayFrame, ServerEvent,
};
use crate::registry::ConnectionRegistry;

pub struct MessageRouter {
    registry: Arc<ConnectionRegistry>,
    presence: Arc<PresenceStore>,
}

impl MessageRouter {
    pub fn new(registry: Arc<ConnectionRegistry>, presence: Arc<PresenceStore>) -> Self {
        Self { registry, presence }
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    pub fn presence(&self) -> &Arc<PresenceStore> {
        &self.presence
    }

    /// Classify and route one raw inbound frame from `sender`.
    ///
    /// Unparseable frames (malformed JSON, missing fields, unknown
    /// discriminators) are dropped without closing the connection.
    pub async fn dispatch(&self, sender: ClientId, raw: &str) {
        let frame: ClientFrame = match serde_json::from_str(raw) {
            Ok(frame) => frame,
            Err(e) => {
                warn!("Dropping unparseable frame from {sender}: {e}");
                return;
            }
        };

        match frame {
            ClientFrame::Announce(event) => self.handle_announce(sender, event).await,
            ClientFrame::Relay(relay) => self.handle_relay(sender, relay).await,
            ClientFrame::Control(action) => self.handle_control(sender, action).await,
        }
    }

    async fn handle_announce(&self, sender: ClientId, event: PresenceEvent) {
        let update = match event {
            PresenceEvent::Connection { name, coordinates } => {
                info!("Presence announce from {sender} ({name})");
                PresenceUpdate::announce(name, coordinates)
            }
            PresenceEvent::ConnectionUpdate {
                coordinates,
                speed,
                is_supported,
                permission_status,
            } => PresenceUpdate {
                coordinates,
                speed,
                is_supported,
                permission_status,
                ..PresenceUpdate::default()
            },
        };

        let roster = self.presence.upsert(sender, update).await;
        self.broadcast_roster(roster).await;
    }

    async fn handle_control(&self, sender: ClientId, action: ClientAction) {
        match action {
            ClientAction::GetUsers => {
                let users = self.presence.snapshot().await;
                self.unicast(sender, &ServerEvent::Users { users }, "roster reply")
                    .await;
            }
            ClientAction::CallInvitation {
                caller_id,
                receiver_id,
                caller_name,
            } => {
                info!("Forwarding call invitation from {caller_id} to {receiver_id}");
                self.unicast(
                    receiver_id,
                    &ServerEvent::CallInvitation {
                        caller_id,
                        caller_name,
                    },
                    "call invitation",
                )
                .await;
            }
            ClientAction::Connect { user_id, my_id } => {
                info!("Call accepted by {my_id}, notifying {user_id}");
                self.unicast(
                    user_id,
                    &ServerEvent::CallAccepted { from: my_id },
                    "call acceptance",
                )
                .await;
            }
            ClientAction::Deny => {
                // Deliberately not relayed; the caller infers denial from
                // the absence of an acceptance.
                debug!("Call denied by {sender}");
            }
            ClientAction::UpdateSpeed {
                speed,
                is_supported,
                permission_status,
            } => {
                let update = PresenceUpdate {
                    speed: Some(speed),
                    is_supported,
                    permission_status,
                    ..PresenceUpdate::default()
                };
                let roster = self.presence.upsert(sender, update).await;
                self.broadcast_roster(roster).await;
            }
            ClientAction::Hangup { target } => {
                info!("Hangup from {sender}, notifying {target}");
                self.unicast(target, &ServerEvent::CallEnded { from: sender }, "hangup")
                    .await;
            }
        }
    }

    /// Stamp the sender identity and forward the negotiation frame
    /// untouched. The payload is never parsed.
    async fn handle_relay(&self, sender: ClientId, mut relay: RelayFrame) {
        relay.source = Some(sender);
        debug!(
            "Relaying {} from {sender} to {}",
            relay.action.as_str(),
            relay.target
        );
        let target = relay.target;
        let kind = relay.action.as_str();
        self.unicast(target, &relay, kind).await;
    }

    /// Best-effort unicast. Target-not-found is an expected condition under
    /// churn and only logged; a send failure marks the target's transport
    /// dead and runs its lifecycle cleanup.
    async fn unicast<T: Serialize>(&self, target: ClientId, frame: &T, kind: &str) {
        match self.registry.lookup(target).await {
            Some(handle) => {
                if handle.send(frame).is_err() {
                    warn!("Send failed for {kind} to {target}, cleaning up connection");
                    self.disconnect(target).await;
                }
            }
            None => debug!("Dropping {kind}: target {target} not registered"),
        }
    }

    /// Broadcast a roster snapshot to every registered connection.
    ///
    /// Handles are copied under a short registry read lock and all sends
    /// happen outside it. Failing connections are removed and the updated
    /// roster is re-sent to the survivors, so the last broadcast any client
    /// sees reflects the connections that are actually alive.
    pub async fn broadcast_roster(&self, roster: Vec<PresenceRecord>) {
        let mut event = ServerEvent::NewUser { users: roster };
        loop {
            let handles = self.registry.handles().await;
            let mut failed = Vec::new();
            for (id, handle) in &handles {
                if handle.send(&event).is_err() {
                    failed.push(*id);
                }
            }
            if failed.is_empty() {
                return;
            }

            let mut any_removed = false;
            for id in failed {
                warn!("Send failed during roster broadcast, dropping connection {id}");
                any_removed |= self.remove_connection(id).await;
            }
            if !any_removed {
                return;
            }
            event = ServerEvent::NewUser {
                users: self.presence.snapshot().await,
            };
        }
    }

    /// Lifecycle cleanup for one connection: unregister, drop its presence
    /// record, broadcast the updated roster. Runs its effects exactly once;
    /// the registry removal is the idempotence guard, so calling this from
    /// both a close path and an error path is safe.
    pub async fn disconnect(&self, id: ClientId) {
        if self.remove_connection(id).await {
            let roster = self.presence.snapshot().await;
            self.broadcast_roster(roster).await;
        }
    }

    async fn remove_connection(&self, id: ClientId) -> bool {
        if self.registry.unregister(id).await.is_none() {
            return false;
        }
        self.presence.remove(id).await;
        info!("Connection {id} closed");
        true
    }
}
