//! Connection lifecycle for Hark.
//!
//! The hub owns the presence registry and the outbound queue of every live
//! connection. Each connection is driven through a [`Session`]:
//!
//! ```text
//! Anonymous ──register──▶ Registered(user) ──disconnect──▶ Terminated
//!     │                                                        ▲
//!     └──────────────────────disconnect────────────────────────┘
//! ```
//!
//! The registry is updated before any call to the user store, and the
//! registry lock is never held across an `.await`. Anything done after a store
//! call checks the binding generation first, so a slow lookup cannot announce
//! or persist a presence that has already changed.

use crate::ids::{ConnectionId, UserId};
use crate::presence::{Generation, PresenceRegistry};
use crate::router::{RelayError, RelayKind, RelayRequest, SignalingRouter};
use crate::store::{StoreError, UserStore};
use dashmap::DashMap;
use hark_protocol::{ClientEvent, ServerEvent};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};

/// Sending half of a connection's outbound queue.
pub type EventSender = mpsc::UnboundedSender<Arc<ServerEvent>>;

/// Receiving half of a connection's outbound queue.
///
/// Yields `None` once the hub has dropped the connection.
pub type EventReceiver = mpsc::UnboundedReceiver<Arc<ServerEvent>>;

/// Hub configuration.
#[derive(Debug, Clone)]
pub struct HubConfig {
    /// Close a connection when its user registers from another connection.
    pub evict_displaced: bool,
    /// Answer status queries for unknown users with an `error` event.
    pub report_unknown_users: bool,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            evict_displaced: true,
            report_unknown_users: false,
        }
    }
}

/// Lifecycle state of a connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
    /// Connected, no identity yet.
    Anonymous,
    /// Bound to a user.
    Registered(UserId),
    /// Disconnected. No further events are processed.
    Terminated,
}

/// Per-connection state owned by the connection's task.
#[derive(Debug)]
pub struct Session {
    id: ConnectionId,
    state: SessionState,
}

impl Session {
    fn new(id: ConnectionId) -> Self {
        Self {
            id,
            state: SessionState::Anonymous,
        }
    }

    #[must_use]
    pub fn id(&self) -> &ConnectionId {
        &self.id
    }

    #[must_use]
    pub fn state(&self) -> &SessionState {
        &self.state
    }

    /// The user this session registered as, if any.
    #[must_use]
    pub fn user(&self) -> Option<&UserId> {
        match &self.state {
            SessionState::Registered(user) => Some(user),
            _ => None,
        }
    }

    #[must_use]
    pub fn is_terminated(&self) -> bool {
        self.state == SessionState::Terminated
    }
}

/// What handling an event amounted to.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    /// Nothing happened (empty registration, terminated session).
    Ignored,
    /// The session was bound to a user.
    Registered {
        user: UserId,
        /// Whether the online status was broadcast.
        announced: bool,
    },
    /// A payload was delivered to its target.
    Relayed(RelayKind),
    /// The event was refused and the sender was told why.
    Rejected(RelayError),
    /// A status reply was sent.
    StatusReplied,
    /// A status query got no reply because the user is unknown.
    StatusSuppressed,
}

impl Outcome {
    /// Metric label.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Outcome::Ignored => "ignored",
            Outcome::Registered { .. } => "registered",
            Outcome::Relayed(_) => "relayed",
            Outcome::Rejected(err) => err.kind(),
            Outcome::StatusReplied => "status",
            Outcome::StatusSuppressed => "status_suppressed",
        }
    }
}

/// Hub statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HubStats {
    /// Number of live connections.
    pub connections: usize,
    /// Number of online users.
    pub online_users: usize,
}

/// The connection lifecycle controller.
pub struct Hub {
    presence: RwLock<PresenceRegistry>,
    connections: DashMap<ConnectionId, EventSender>,
    store: Arc<dyn UserStore>,
    router: SignalingRouter,
    config: HubConfig,
}

impl Hub {
    /// Create a hub with default configuration.
    #[must_use]
    pub fn new(store: Arc<dyn UserStore>) -> Self {
        Self::with_config(store, HubConfig::default())
    }

    /// Create a hub with custom configuration.
    #[must_use]
    pub fn with_config(store: Arc<dyn UserStore>, config: HubConfig) -> Self {
        info!("Creating hub with config: {:?}", config);
        Self {
            presence: RwLock::new(PresenceRegistry::new()),
            connections: DashMap::new(),
            store,
            router: SignalingRouter::new(),
            config,
        }
    }

    #[must_use]
    pub fn config(&self) -> &HubConfig {
        &self.config
    }

    /// Get hub statistics.
    #[must_use]
    pub fn stats(&self) -> HubStats {
        HubStats {
            connections: self.connections.len(),
            online_users: self.presence().online_count(),
        }
    }

    /// Whether `user` is online.
    #[must_use]
    pub fn is_online(&self, user: &str) -> bool {
        self.presence().is_online(user)
    }

    /// Connection currently bound to `user`.
    #[must_use]
    pub fn lookup_connection(&self, user: &str) -> Option<ConnectionId> {
        self.presence().lookup_connection(user).cloned()
    }

    /// User currently bound to `connection`.
    #[must_use]
    pub fn lookup_user(&self, connection: &str) -> Option<UserId> {
        self.presence().lookup_user(connection).cloned()
    }

    /// Snapshot of online users.
    #[must_use]
    pub fn online_users(&self) -> Vec<UserId> {
        self.presence().online_users()
    }

    /// Accept a new connection.
    ///
    /// Returns the session to drive and the queue of events to write to it.
    pub fn connect(&self) -> (Session, EventReceiver) {
        let id = ConnectionId::generate();
        let (tx, rx) = mpsc::unbounded_channel();
        self.connections.insert(id.clone(), tx);

        debug!(connection = %id, "Connection opened");
        (Session::new(id), rx)
    }

    /// Handle one event from `session`.
    ///
    /// Replies and errors for the sender go to its own queue.
    pub async fn handle(&self, session: &mut Session, event: ClientEvent) -> Outcome {
        if session.is_terminated() {
            debug!(connection = %session.id, event = event.name(), "Event on terminated session");
            return Outcome::Ignored;
        }

        match event {
            ClientEvent::Register(user) => self.register(session, user).await,
            ClientEvent::Status(user) => self.query_status(session, user).await,
            ClientEvent::PrivateMessage(msg) => self.relay(session, msg.into()),
            ClientEvent::CallUser(offer) => self.relay(session, offer.into()),
            ClientEvent::MakeAnswer(answer) => self.relay(session, answer.into()),
            ClientEvent::IceCandidate(candidate) => self.relay(session, candidate.into()),
        }
    }

    /// Tear down `session`.
    ///
    /// If the connection still owns a presence binding, the user goes offline
    /// and everyone is told. Calling this twice is a no-op.
    pub async fn disconnect(&self, session: &mut Session) {
        let previous = std::mem::replace(&mut session.state, SessionState::Terminated);
        if previous == SessionState::Terminated {
            return;
        }

        self.connections.remove(&session.id);
        let user = self.presence_mut().unregister(session.id.as_str());
        debug!(connection = %session.id, user = ?user, "Connection closed");

        if let Some(user) = user {
            self.announce_offline(&user).await;
        }
    }

    /// Send an event to every live connection.
    ///
    /// Returns the number of connections it was queued for.
    pub fn broadcast(&self, event: ServerEvent) -> usize {
        let event = Arc::new(event);
        let count = self
            .connections
            .iter()
            .filter(|entry| entry.value().send(Arc::clone(&event)).is_ok())
            .count();

        trace!(event = event.name(), recipients = count, "Broadcast");
        count
    }

    /// Send an event to one connection.
    ///
    /// Returns `false` if the connection is gone.
    pub fn send_to(&self, connection: &ConnectionId, event: ServerEvent) -> bool {
        self.connections
            .get(connection)
            .is_some_and(|tx| tx.send(Arc::new(event)).is_ok())
    }

    async fn register(&self, session: &mut Session, user: Option<String>) -> Outcome {
        let Some(user) = user.filter(|u| !u.is_empty()).map(UserId::from) else {
            debug!(connection = %session.id, "Ignoring register without user id");
            return Outcome::Ignored;
        };

        let registration = self
            .presence_mut()
            .register(user.clone(), session.id.clone());
        session.state = SessionState::Registered(user.clone());

        if let Some(previous) = &registration.replaced {
            self.announce_offline(previous).await;
        }
        if let Some(stale) = &registration.displaced {
            self.displace(stale, &user);
        }

        let known = match self.store.admit_user(&user).await {
            Ok(Some(_)) => true,
            Ok(None) => {
                debug!(user = %user, "Unknown user registered, not announcing");
                false
            }
            Err(e) => {
                warn!(user = %user, error = %e, "User lookup failed");
                true
            }
        };

        if !known {
            return Outcome::Registered {
                user,
                announced: false,
            };
        }

        if !self.is_current(&user, registration.generation) {
            debug!(user = %user, "Registration superseded before announcement");
            return Outcome::Registered {
                user,
                announced: false,
            };
        }

        self.broadcast(ServerEvent::status(user.as_str(), true));
        self.persist_online(&user, registration.generation).await;

        Outcome::Registered {
            user,
            announced: true,
        }
    }

    async fn query_status(&self, session: &Session, user: Option<String>) -> Outcome {
        let Some(user) = user.filter(|u| !u.is_empty()).map(UserId::from) else {
            return self.reject(session, RelayError::MissingField("userId"));
        };

        match self.store.find_user(&user).await {
            Ok(Some(_)) => {
                let online = self.is_online(user.as_str());
                self.send_to(&session.id, ServerEvent::status(user.into_string(), online));
                Outcome::StatusReplied
            }
            Ok(None) => {
                debug!(connection = %session.id, user = %user, "Status query for unknown user");
                if self.config.report_unknown_users {
                    self.send_to(
                        &session.id,
                        ServerEvent::error(format!("User {} not found", user)),
                    );
                }
                Outcome::StatusSuppressed
            }
            Err(e) => {
                warn!(user = %user, error = %e, "User lookup failed during status query");
                Outcome::StatusSuppressed
            }
        }
    }

    fn relay(&self, session: &Session, request: RelayRequest) -> Outcome {
        let kind = request.kind;
        let routed = {
            let presence = self.presence();
            self.router.route(&presence, &session.id, request)
        };

        match routed {
            Ok(delivery) => {
                if self.send_to(&delivery.target, delivery.event) {
                    Outcome::Relayed(kind)
                } else {
                    let recipient = delivery.recipient.into_string();
                    self.reject(session, RelayError::NotConnected(recipient))
                }
            }
            Err(err) => self.reject(session, err),
        }
    }

    fn reject(&self, session: &Session, err: RelayError) -> Outcome {
        debug!(connection = %session.id, error = %err, "Rejected event");
        self.send_to(&session.id, err.to_event());
        Outcome::Rejected(err)
    }

    /// Handle a connection that lost its binding to a newer registration.
    fn displace(&self, stale: &ConnectionId, user: &UserId) {
        if !self.config.evict_displaced {
            debug!(connection = %stale, user = %user, "Displaced connection left open");
            return;
        }

        // Dropping the sender ends the stale connection's queue after the notice.
        if let Some((_, tx)) = self.connections.remove(stale) {
            let notice = ServerEvent::error(format!("User {} registered from another connection", user));
            let _ = tx.send(Arc::new(notice));
            debug!(connection = %stale, user = %user, "Evicted displaced connection");
        }
    }

    async fn announce_offline(&self, user: &UserId) {
        self.broadcast(ServerEvent::status(user.as_str(), false));
        self.persist_offline(user).await;
    }

    async fn persist_online(&self, user: &UserId, generation: Generation) {
        if !self.is_current(user, generation) {
            debug!(user = %user, generation, "Skipping stale online write");
            return;
        }
        if let Err(e) = self.store.set_user_status(user, true).await {
            log_store_error(user, &e);
        }
    }

    async fn persist_offline(&self, user: &UserId) {
        if self.is_online(user.as_str()) {
            debug!(user = %user, "User is back online, skipping offline write");
            return;
        }
        if let Err(e) = self.store.set_user_status(user, false).await {
            log_store_error(user, &e);
        }
    }

    fn is_current(&self, user: &UserId, generation: Generation) -> bool {
        self.presence().is_current(user.as_str(), generation)
    }

    fn presence(&self) -> RwLockReadGuard<'_, PresenceRegistry> {
        self.presence.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn presence_mut(&self) -> RwLockWriteGuard<'_, PresenceRegistry> {
        self.presence.write().unwrap_or_else(PoisonError::into_inner)
    }
}

fn log_store_error(user: &UserId, err: &StoreError) {
    match err {
        StoreError::NotFound(_) => debug!(user = %user, "No user record to update status"),
        StoreError::Unavailable(_) => warn!(user = %user, error = %err, "Failed to persist user status"),
    }
}
