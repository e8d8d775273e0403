//! Authoritative "who is present where" and "who is editing what".
//!
//! ```text
//! projects: ProjectId ──► { UserId ──► User }
//! editing:  TaskId    ──► { UserId }
//! ```
//!
//! Pure in-memory state with a single owner (the hub task). Every mutation
//! returns the [`Notice`]s that have to be fanned out to the project room,
//! so nothing here touches a socket.
//!
//! Empty rooms and empty editing sessions are pruned as soon as they empty,
//! so an entry exists if and only if it has at least one member.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use crate::protocol::{ProjectId, ServerEvent, TaskId, User, UserId};

/// An event produced by a registry mutation, attributed to the user who
/// caused it. The caller decides who receives it (normally everyone in the
/// room but the actor's channel).
#[derive(Debug, Clone, PartialEq)]
pub struct Notice {
    pub actor: UserId,
    pub event: ServerEvent,
}

impl Notice {
    fn new(actor: &str, event: ServerEvent) -> Self {
        Self {
            actor: actor.to_string(),
            event,
        }
    }
}

/// Presence and co-editing state for the whole process.
#[derive(Debug, Default)]
pub struct RoomRegistry {
    rooms: HashMap<ProjectId, BTreeMap<UserId, User>>,
    editing: HashMap<TaskId, BTreeSet<UserId>>,
}

impl RoomRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `user` to the project room, overwriting a previous record with
    /// the same id. Returns the member snapshot and the join notice.
    pub fn join(&mut self, project_id: &str, user: User) -> (Vec<User>, Vec<Notice>) {
        let members = self.rooms.entry(project_id.to_string()).or_default();
        let notice = Notice::new(&user.id, ServerEvent::UserJoined { user: user.clone() });
        members.insert(user.id.clone(), user);

        let snapshot = members.values().cloned().collect();
        (snapshot, vec![notice])
    }

    /// Remove `user_id` from the project room. Absent users are a no-op.
    pub fn leave(&mut self, project_id: &str, user_id: &str) -> Vec<Notice> {
        let Some(members) = self.rooms.get_mut(project_id) else {
            return Vec::new();
        };
        let removed = members.remove(user_id).is_some();
        if members.is_empty() {
            self.rooms.remove(project_id);
            log::debug!("Room {project_id} removed (empty)");
        }

        if removed {
            vec![Notice::new(
                user_id,
                ServerEvent::UserLeft {
                    user_id: user_id.to_string(),
                },
            )]
        } else {
            Vec::new()
        }
    }

    /// Record that `user_id` started editing `task_id`.
    pub fn start_editing(&mut self, task_id: &str, user_id: &str) -> Vec<Notice> {
        let editors = self.editing.entry(task_id.to_string()).or_default();
        if !editors.insert(user_id.to_string()) {
            return Vec::new();
        }
        vec![Notice::new(
            user_id,
            ServerEvent::UserStartedEditing {
                user_id: user_id.to_string(),
                task_id: task_id.to_string(),
            },
        )]
    }

    /// Record that `user_id` stopped editing `task_id`.
    pub fn stop_editing(&mut self, task_id: &str, user_id: &str) -> Vec<Notice> {
        if self.remove_editor(task_id, user_id) {
            vec![stopped_editing(user_id, task_id)]
        } else {
            Vec::new()
        }
    }

    /// Members of a room, ordered by user id. Empty if the room is unknown.
    pub fn list_members(&self, project_id: &str) -> Vec<User> {
        self.rooms
            .get(project_id)
            .map(|members| members.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Users currently editing a task. Empty if nobody is.
    pub fn list_editors(&self, task_id: &str) -> Vec<UserId> {
        self.editing
            .get(task_id)
            .map(|editors| editors.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// `leave` plus removal of the user from every editing session.
    ///
    /// The registry does not know which project a task belongs to, so all
    /// sessions are scanned: O(total editors) per call.
    pub fn purge_user(&mut self, project_id: &str, user_id: &str) -> Vec<Notice> {
        let mut notices = self.leave(project_id, user_id);

        let mut emptied = Vec::new();
        let mut stopped = Vec::new();
        for (task_id, editors) in self.editing.iter_mut() {
            if editors.remove(user_id) {
                stopped.push(task_id.clone());
                if editors.is_empty() {
                    emptied.push(task_id.clone());
                }
            }
        }
        for task_id in &emptied {
            self.editing.remove(task_id);
        }

        stopped.sort();
        notices.extend(stopped.iter().map(|task_id| stopped_editing(user_id, task_id)));
        notices
    }

    /// Ids of all non-empty rooms.
    pub fn rooms(&self) -> Vec<ProjectId> {
        let mut ids: Vec<_> = self.rooms.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Ids of all tasks with at least one editor.
    pub fn editing_tasks(&self) -> Vec<TaskId> {
        let mut ids: Vec<_> = self.editing.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }

    pub fn is_member(&self, project_id: &str, user_id: &str) -> bool {
        self.rooms
            .get(project_id)
            .is_some_and(|members| members.contains_key(user_id))
    }

    fn remove_editor(&mut self, task_id: &str, user_id: &str) -> bool {
        let Some(editors) = self.editing.get_mut(task_id) else {
            return false;
        };
        let removed = editors.remove(user_id);
        if editors.is_empty() {
            self.editing.remove(task_id);
        }
        removed
    }
}

fn stopped_editing(user_id: &str, task_id: &str) -> Notice {
    Notice::new(
        user_id,
        ServerEvent::UserStoppedEditing {
            user_id: user_id.to_string(),
            task_id: task_id.to_string(),
        },
    )
}
