//! Per-connection state machine.
//!
//! ```text
//! Unauthenticated ──authenticate──► Authenticated ──joinProject──► RoomJoined
//!        │                              ▲   │                        │
//!        │                              └───┼────── leaveProject ────┘
//!        └──────────────────────────────────┴──────── close ───────► Closed
//! ```
//!
//! A session translates decoded [`ClientIntent`]s into registry mutations
//! and broadcasts. It never fails towards the client: intents that cannot
//! be honoured are dropped and logged.

use crate::auth::Credential;
use crate::broadcast::{Broadcaster, ChannelId, ClientChannel, SendOutcome};
use crate::metrics::TaskMutation;
use crate::protocol::{ClientIntent, Notification, ProjectId, ServerEvent, User};
use crate::registry::{Notice, RoomRegistry};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Unauthenticated,
    Authenticated,
    RoomJoined,
    Closed,
}

/// Shared room state a session mutates. Borrowed from the hub per intent.
pub struct Rooms<'a> {
    pub registry: &'a mut RoomRegistry,
    pub broadcaster: &'a mut Broadcaster,
}

impl Rooms<'_> {
    fn relay(&mut self, project_id: &str, notices: Vec<Notice>, exclude: ChannelId) {
        for notice in notices {
            self.broadcaster.broadcast(project_id, &notice.event, Some(exclude));
        }
    }
}

/// A task mutation whose metrics have to be recomputed.
#[derive(Debug, Clone, PartialEq)]
pub struct MetricsJob {
    pub project_id: ProjectId,
    pub mutation: TaskMutation,
}

#[derive(Debug, Clone)]
struct Membership {
    project_id: ProjectId,
    user: User,
}

/// One client connection as seen by the hub.
#[derive(Debug)]
pub struct Session {
    channel: ClientChannel,
    state: SessionState,
    membership: Option<Membership>,
}

impl Session {
    pub fn new(channel: ClientChannel) -> Self {
        Self {
            channel,
            state: SessionState::Unauthenticated,
            membership: None,
        }
    }

    pub fn id(&self) -> ChannelId {
        self.channel.id()
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Project the session is currently in, if any.
    pub fn project_id(&self) -> Option<&str> {
        self.membership.as_ref().map(|m| m.project_id.as_str())
    }

    pub fn user(&self) -> Option<&User> {
        self.membership.as_ref().map(|m| &m.user)
    }

    /// Admit the session once the handshake verified `credential`.
    pub fn authenticate(&mut self, credential: &Credential) {
        if self.state == SessionState::Unauthenticated {
            log::trace!(
                "Session {} authenticated ({}-byte token)",
                self.id(),
                credential.token().len()
            );
            self.state = SessionState::Authenticated;
        }
    }

    /// Apply one intent. Returns a metrics job for task mutations.
    pub fn handle(&mut self, intent: ClientIntent, rooms: &mut Rooms<'_>) -> Option<MetricsJob> {
        match self.state {
            SessionState::Unauthenticated | SessionState::Closed => {
                log::debug!(
                    "Session {}: dropping {} in state {:?}",
                    self.id(),
                    intent.name(),
                    self.state
                );
                return None;
            }
            SessionState::Authenticated | SessionState::RoomJoined => {}
        }

        match intent {
            ClientIntent::JoinProject { project_id, user } => {
                self.join(project_id, user, rooms);
                None
            }
            ClientIntent::LeaveProject {
                project_id,
                user_id,
            } => {
                let Some(membership) = &self.membership else {
                    log::debug!("Session {}: leaveProject outside a room", self.id());
                    return None;
                };
                if membership.project_id != project_id || membership.user.id != user_id {
                    log::warn!(
                        "Session {}: leaveProject for {project_id}/{user_id} does not match {}/{}",
                        self.id(),
                        membership.project_id,
                        membership.user.id
                    );
                    return None;
                }
                self.leave(rooms);
                None
            }
            other => self.handle_in_room(other, rooms),
        }
    }

    fn join(&mut self, project_id: ProjectId, user: User, rooms: &mut Rooms<'_>) {
        if project_id.trim().is_empty() || user.id.trim().is_empty() {
            log::warn!("Session {}: joinProject without projectId or user id", self.id());
            return;
        }
        let switching = self
            .membership
            .as_ref()
            .is_some_and(|current| current.project_id != project_id || current.user.id != user.id);
        if switching {
            self.leave(rooms);
        }

        let (members, notices) = rooms.registry.join(&project_id, user.clone());
        rooms.broadcaster.subscribe(self.channel.clone(), &project_id);
        let snapshot = ServerEvent::UsersOnline { users: members };
        if rooms.broadcaster.send_to(self.id(), &snapshot) == SendOutcome::Closed {
            log::debug!("Session {}: closed before member snapshot", self.id());
        }
        rooms.relay(&project_id, notices, self.id());

        log::info!(
            "User {} ({}) joined project {project_id}",
            user.display_name,
            user.id
        );
        self.membership = Some(Membership { project_id, user });
        self.state = SessionState::RoomJoined;
    }

    fn handle_in_room(&mut self, intent: ClientIntent, rooms: &mut Rooms<'_>) -> Option<MetricsJob> {
        let Some(membership) = &self.membership else {
            log::debug!("Session {}: {} before joinProject", self.id(), intent.name());
            return None;
        };
        let project_id = membership.project_id.clone();
        let own_id = self.id();

        // Per-user intents must name the session's own user.
        let claimed_user = match &intent {
            ClientIntent::StartEditing { user_id, .. }
            | ClientIntent::StopEditing { user_id, .. }
            | ClientIntent::CursorMove { user_id, .. } => Some(user_id.as_str()),
            _ => None,
        };
        if let Some(claimed) = claimed_user {
            if claimed != membership.user.id {
                log::warn!(
                    "Session {own_id}: {} claims user {claimed}, session user is {}",
                    intent.name(),
                    membership.user.id
                );
                return None;
            }
        }

        match intent {
            ClientIntent::CreateTask { task } => {
                rooms
                    .broadcaster
                    .broadcast(&project_id, &ServerEvent::TaskCreated { task: task.clone() }, None);
                Some(MetricsJob {
                    project_id,
                    mutation: TaskMutation::Created { task },
                })
            }
            ClientIntent::UpdateTask { task_id, changes } => {
                if task_id.is_empty() {
                    log::warn!("Session {own_id}: updateTask without taskId");
                    return None;
                }
                let event = ServerEvent::TaskUpdated {
                    task_id: task_id.clone(),
                    changes: changes.clone(),
                };
                rooms.broadcaster.broadcast(&project_id, &event, None);
                Some(MetricsJob {
                    project_id,
                    mutation: TaskMutation::Updated { task_id, changes },
                })
            }
            ClientIntent::DeleteTask { task_id } => {
                if task_id.is_empty() {
                    log::warn!("Session {own_id}: deleteTask without taskId");
                    return None;
                }
                let event = ServerEvent::TaskDeleted {
                    task_id: task_id.clone(),
                };
                rooms.broadcaster.broadcast(&project_id, &event, None);
                Some(MetricsJob {
                    project_id,
                    mutation: TaskMutation::Deleted { task_id },
                })
            }
            ClientIntent::RequestApproval { update } => {
                let notification = Notification::approval_requested(&membership.user, &project_id, &update);
                rooms
                    .broadcaster
                    .broadcast(&project_id, &ServerEvent::ApprovalRequested { update }, None);
                rooms
                    .broadcaster
                    .broadcast(&project_id, &ServerEvent::Notification { notification }, None);
                None
            }
            ClientIntent::UpdateApprovalStatus {
                update_id,
                status,
                approver_id,
            } => {
                let event = ServerEvent::ApprovalStatusChanged {
                    update_id,
                    status,
                    approver_id,
                };
                rooms.broadcaster.broadcast(&project_id, &event, None);
                None
            }
            ClientIntent::AddComment { update_id, comment } => {
                let event = ServerEvent::CommentAdded { update_id, comment };
                rooms.broadcaster.broadcast(&project_id, &event, None);
                None
            }
            ClientIntent::StartEditing { task_id, user_id } => {
                if task_id.is_empty() {
                    log::warn!("Session {own_id}: startEditing without taskId");
                    return None;
                }
                let notices = rooms.registry.start_editing(&task_id, &user_id);
                rooms.relay(&project_id, notices, own_id);
                None
            }
            ClientIntent::StopEditing { task_id, user_id } => {
                let notices = rooms.registry.stop_editing(&task_id, &user_id);
                rooms.relay(&project_id, notices, own_id);
                None
            }
            ClientIntent::CursorMove { position, user_id } => {
                let event = ServerEvent::CursorMove { position, user_id };
                rooms
                    .broadcaster
                    .broadcast_volatile(&project_id, &event, Some(own_id));
                None
            }
            ClientIntent::JoinProject { .. } | ClientIntent::LeaveProject { .. } => None,
        }
    }

    /// Leave the current room, if any, cleaning up presence and edits.
    ///
    /// Safe to call repeatedly; only the first call emits anything.
    pub fn leave(&mut self, rooms: &mut Rooms<'_>) {
        let Some(Membership { project_id, user }) = self.membership.take() else {
            return;
        };
        let notices = rooms.registry.purge_user(&project_id, &user.id);
        rooms.broadcaster.unsubscribe(self.id(), &project_id);
        rooms.relay(&project_id, notices, self.id());

        log::info!("User {} left project {project_id}", user.id);
        if self.state == SessionState::RoomJoined {
            self.state = SessionState::Authenticated;
        }
    }

    /// Transport went away. Idempotent.
    pub fn close(&mut self, rooms: &mut Rooms<'_>) {
        if self.state == SessionState::Closed {
            return;
        }
        self.leave(rooms);
        self.state = SessionState::Closed;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broadcast::{ChannelReceiver, Frame};
    use crate::protocol::{CursorPosition, UserRole};
    use serde_json::json;

    struct Fixture {
        registry: RoomRegistry,
        broadcaster: Broadcaster,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                registry: RoomRegistry::new(),
                broadcaster: Broadcaster::new(),
            }
        }

        fn rooms(&mut self) -> Rooms<'_> {
            Rooms {
                registry: &mut self.registry,
                broadcaster: &mut self.broadcaster,
            }
        }

        fn connect(&mut self) -> (Session, ChannelReceiver) {
            let (channel, rx) = ClientChannel::new(4);
            let mut session = Session::new(channel);
            session.authenticate(&Credential::new("token"));
            (session, rx)
        }

        fn handle(&mut self, session: &mut Session, intent: ClientIntent) -> Option<MetricsJob> {
            let mut rooms = self.rooms();
            session.handle(intent, &mut rooms)
        }
    }

    fn user(id: &str) -> User {
        User::new(id, format!("User {id}"), format!("{id}@example.com"), UserRole::TeamMember)
    }

    fn join(project: &str, id: &str) -> ClientIntent {
        ClientIntent::JoinProject {
            project_id: project.into(),
            user: user(id),
        }
    }

    fn drain(rx: &mut ChannelReceiver) -> Vec<ServerEvent> {
        std::iter::from_fn(|| rx.try_recv())
            .map(|frame: Frame| ServerEvent::decode(&frame).unwrap())
            .collect()
    }

    #[test]
    fn test_join_sends_snapshot_and_notifies_others() {
        let mut fx = Fixture::new();
        let (mut a, mut a_rx) = fx.connect();
        let (mut b, mut b_rx) = fx.connect();

        fx.handle(&mut a, join("P1", "A"));
        assert_eq!(a.state(), SessionState::RoomJoined);
        assert_eq!(drain(&mut a_rx), vec![ServerEvent::UsersOnline { users: vec![user("A")] }]);

        fx.handle(&mut b, join("P1", "B"));
        assert_eq!(
            drain(&mut b_rx),
            vec![ServerEvent::UsersOnline {
                users: vec![user("A"), user("B")]
            }]
        );
        assert_eq!(drain(&mut a_rx), vec![ServerEvent::UserJoined { user: user("B") }]);
    }

    #[test]
    fn test_unauthenticated_session_drops_everything() {
        let mut fx = Fixture::new();
        let (channel, mut rx) = ClientChannel::new(4);
        let mut session = Session::new(channel);

        fx.handle(&mut session, join("P1", "A"));
        assert_eq!(session.state(), SessionState::Unauthenticated);
        assert!(drain(&mut rx).is_empty());
        assert_eq!(fx.registry.room_count(), 0);
    }

    #[test]
    fn test_empty_project_id_is_dropped() {
        let mut fx = Fixture::new();
        let (mut a, mut a_rx) = fx.connect();
        fx.handle(&mut a, join("", "A"));
        assert_eq!(a.state(), SessionState::Authenticated);
        assert!(drain(&mut a_rx).is_empty());
    }

    #[test]
    fn test_in_room_intent_before_join_is_dropped() {
        let mut fx = Fixture::new();
        let (mut a, mut a_rx) = fx.connect();
        let job = fx.handle(&mut a, ClientIntent::CreateTask { task: json!({"id": "T1"}) });
        assert!(job.is_none());
        assert!(drain(&mut a_rx).is_empty());
    }

    #[test]
    fn test_task_events_reach_sender_too() {
        let mut fx = Fixture::new();
        let (mut a, mut a_rx) = fx.connect();
        let (mut b, mut b_rx) = fx.connect();
        fx.handle(&mut a, join("P1", "A"));
        fx.handle(&mut b, join("P1", "B"));
        drain(&mut a_rx);
        drain(&mut b_rx);

        let job = fx.handle(
            &mut a,
            ClientIntent::UpdateTask {
                task_id: "T1".into(),
                changes: json!({"percentComplete": 60}),
            },
        );
        let expected = ServerEvent::TaskUpdated {
            task_id: "T1".into(),
            changes: json!({"percentComplete": 60}),
        };
        assert_eq!(drain(&mut a_rx), vec![expected.clone()]);
        assert_eq!(drain(&mut b_rx), vec![expected]);
        assert_eq!(job.unwrap().project_id, "P1");
    }

    #[test]
    fn test_request_approval_emits_notification() {
        let mut fx = Fixture::new();
        let (mut a, mut a_rx) = fx.connect();
        fx.handle(&mut a, join("P1", "A"));
        drain(&mut a_rx);

        fx.handle(&mut a, ClientIntent::RequestApproval { update: json!({"id": "U1"}) });
        let events = drain(&mut a_rx);
        assert_eq!(events.len(), 2);
        assert_eq!(events[0], ServerEvent::ApprovalRequested { update: json!({"id": "U1"}) });
        match &events[1] {
            ServerEvent::Notification { notification } => {
                assert_eq!(notification.title, "New Approval Request");
                assert_eq!(notification.action_url.as_deref(), Some("/projects/P1?approval=U1"));
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn test_editing_and_cursor_exclude_sender() {
        let mut fx = Fixture::new();
        let (mut a, mut a_rx) = fx.connect();
        let (mut b, mut b_rx) = fx.connect();
        fx.handle(&mut a, join("P1", "A"));
        fx.handle(&mut b, join("P1", "B"));
        drain(&mut a_rx);
        drain(&mut b_rx);

        fx.handle(
            &mut a,
            ClientIntent::StartEditing {
                task_id: "T1".into(),
                user_id: "A".into(),
            },
        );
        fx.handle(
            &mut a,
            ClientIntent::CursorMove {
                position: CursorPosition::new(1.0, 2.0),
                user_id: "A".into(),
            },
        );

        assert!(drain(&mut a_rx).is_empty());
        assert_eq!(
            drain(&mut b_rx),
            vec![
                ServerEvent::UserStartedEditing {
                    user_id: "A".into(),
                    task_id: "T1".into()
                },
                ServerEvent::CursorMove {
                    position: CursorPosition::new(1.0, 2.0),
                    user_id: "A".into()
                },
            ]
        );
    }

    #[test]
    fn test_spoofed_user_id_is_dropped() {
        let mut fx = Fixture::new();
        let (mut a, _a_rx) = fx.connect();
        let (mut b, mut b_rx) = fx.connect();
        fx.handle(&mut a, join("P1", "A"));
        fx.handle(&mut b, join("P1", "B"));
        drain(&mut b_rx);

        fx.handle(
            &mut a,
            ClientIntent::StartEditing {
                task_id: "T1".into(),
                user_id: "B".into(),
            },
        );
        assert!(drain(&mut b_rx).is_empty());
        assert!(fx.registry.list_editors("T1").is_empty());
    }

    #[test]
    fn test_close_purges_and_is_idempotent() {
        let mut fx = Fixture::new();
        let (mut a, _a_rx) = fx.connect();
        let (mut b, mut b_rx) = fx.connect();
        fx.handle(&mut a, join("P1", "A"));
        fx.handle(&mut b, join("P1", "B"));
        fx.handle(
            &mut a,
            ClientIntent::StartEditing {
                task_id: "T1".into(),
                user_id: "A".into(),
            },
        );
        drain(&mut b_rx);

        a.close(&mut fx.rooms());
        assert_eq!(a.state(), SessionState::Closed);
        assert_eq!(
            drain(&mut b_rx),
            vec![
                ServerEvent::UserLeft { user_id: "A".into() },
                ServerEvent::UserStoppedEditing {
                    user_id: "A".into(),
                    task_id: "T1".into()
                },
            ]
        );

        a.close(&mut fx.rooms());
        assert!(drain(&mut b_rx).is_empty());
        assert!(!fx.broadcaster.is_subscribed(a.id(), "P1"));
    }

    #[test]
    fn test_graceful_leave_allows_rejoin() {
        let mut fx = Fixture::new();
        let (mut a, mut a_rx) = fx.connect();
        fx.handle(&mut a, join("P1", "A"));
        fx.handle(
            &mut a,
            ClientIntent::LeaveProject {
                project_id: "P1".into(),
                user_id: "A".into(),
            },
        );
        assert_eq!(a.state(), SessionState::Authenticated);
        assert_eq!(fx.registry.room_count(), 0);

        fx.handle(&mut a, join("P1", "A"));
        assert_eq!(a.state(), SessionState::RoomJoined);
        assert_eq!(drain(&mut a_rx).len(), 2);
    }

    #[test]
    fn test_join_other_project_leaves_previous() {
        let mut fx = Fixture::new();
        let (mut a, _a_rx) = fx.connect();
        fx.handle(&mut a, join("P1", "A"));
        fx.handle(&mut a, join("P2", "A"));

        assert!(!fx.registry.is_member("P1", "A"));
        assert!(fx.registry.is_member("P2", "A"));
        assert!(!fx.broadcaster.is_subscribed(a.id(), "P1"));
        assert_eq!(a.project_id(), Some("P2"));
    }
}
