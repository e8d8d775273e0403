//! Event vocabulary shared by the realtime server and its clients.
//!
//! Wire format (JSON text frames):
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │ {"event": "<camelCaseName>", "args": { <camelCase fields> }}  │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! Tasks, partial tasks, approval updates and comments belong to the
//! project store, not to this layer, so they travel as opaque JSON values.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::SystemTime;
use thiserror::Error;
use uuid::Uuid;

pub type ProjectId = String;
pub type UserId = String;
pub type TaskId = String;

/// Role of a user inside the organisation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum UserRole {
    Admin,
    ProjectManager,
    TeamLead,
    TeamMember,
    Stakeholder,
}

/// Identity of a connected user. Owned by the auth system.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
    pub id: UserId,
    pub display_name: String,
    pub email_address: String,
    pub role: UserRole,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub team_id: Option<String>,
}

impl User {
    pub fn new(
        id: impl Into<UserId>,
        display_name: impl Into<String>,
        email_address: impl Into<String>,
        role: UserRole,
    ) -> Self {
        Self {
            id: id.into(),
            display_name: display_name.into(),
            email_address: email_address.into(),
            role,
            team_id: None,
        }
    }

    pub fn with_team(mut self, team_id: impl Into<String>) -> Self {
        self.team_id = Some(team_id.into());
        self
    }
}

/// Review state of an approval request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ApprovalStatus {
    Pending,
    Approved,
    Rejected,
    Reverted,
}

/// Pointer position on the shared report canvas.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct CursorPosition {
    pub x: f64,
    pub y: f64,
}

impl CursorPosition {
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }
}

/// Aggregate project health figures pushed after task mutations.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectMetrics {
    pub project_id: ProjectId,
    pub overall_progress: f64,
    pub tasks_completed: u32,
    pub tasks_total: u32,
    pub health_score: f64,
    pub critical_path_tasks: u32,
    pub blocked_tasks: u32,
    pub overdue_tasks: u32,
    pub team_velocity: f64,
    pub burndown_rate: f64,
    pub resource_utilization: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NotificationKind {
    Task,
    Approval,
    Comment,
    System,
}

/// A user-facing notification record.
///
/// Only the read flag is ever mutated after creation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Notification {
    pub id: String,
    pub kind: NotificationKind,
    pub title: String,
    pub message: String,
    pub owner_user_id: UserId,
    pub project_id: ProjectId,
    /// Milliseconds since the Unix epoch.
    pub created_at: u64,
    #[serde(default)]
    pub read: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action_url: Option<String>,
}

impl Notification {
    pub fn new(
        kind: NotificationKind,
        title: impl Into<String>,
        message: impl Into<String>,
        owner_user_id: impl Into<UserId>,
        project_id: impl Into<ProjectId>,
    ) -> Self {
        Self {
            id: notification_id(),
            kind,
            title: title.into(),
            message: message.into(),
            owner_user_id: owner_user_id.into(),
            project_id: project_id.into(),
            created_at: now_millis(),
            read: false,
            action_url: None,
        }
    }

    pub fn with_action_url(mut self, url: impl Into<String>) -> Self {
        self.action_url = Some(url.into());
        self
    }

    /// Notification raised when `requester` asks for approval of `update`.
    pub fn approval_requested(requester: &User, project_id: &str, update: &Value) -> Self {
        let update_id = update
            .get("id")
            .and_then(Value::as_str)
            .unwrap_or_default();
        Self::new(
            NotificationKind::Approval,
            "New Approval Request",
            format!(
                "{} requested approval for a task update",
                requester.display_name
            ),
            requester.id.clone(),
            project_id,
        )
        .with_action_url(format!("/projects/{project_id}?approval={update_id}"))
    }
}

/// Milliseconds since the Unix epoch.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// `<millis>-<9 base36 chars>`, unique enough for client-side dedup.
fn notification_id() -> String {
    const ALPHABET: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";
    let mut entropy = Uuid::new_v4().as_u128();
    let mut suffix = String::with_capacity(9);
    for _ in 0..9 {
        suffix.push(ALPHABET[(entropy % 36) as usize] as char);
        entropy /= 36;
    }
    format!("{}-{suffix}", now_millis())
}

/// Client → server intents.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(
    tag = "event",
    content = "args",
    rename_all = "camelCase",
    rename_all_fields = "camelCase"
)]
pub enum ClientIntent {
    JoinProject { project_id: ProjectId, user: User },
    LeaveProject { project_id: ProjectId, user_id: UserId },
    CreateTask { task: Value },
    UpdateTask { task_id: TaskId, changes: Value },
    DeleteTask { task_id: TaskId },
    RequestApproval { update: Value },
    UpdateApprovalStatus {
        update_id: String,
        status: ApprovalStatus,
        approver_id: UserId,
    },
    AddComment { update_id: String, comment: Value },
    StartEditing { task_id: TaskId, user_id: UserId },
    StopEditing { task_id: TaskId, user_id: UserId },
    CursorMove { position: CursorPosition, user_id: UserId },
}

impl ClientIntent {
    /// Wire name of the intent, for logging.
    pub fn name(&self) -> &'static str {
        match self {
            Self::JoinProject { .. } => "joinProject",
            Self::LeaveProject { .. } => "leaveProject",
            Self::CreateTask { .. } => "createTask",
            Self::UpdateTask { .. } => "updateTask",
            Self::DeleteTask { .. } => "deleteTask",
            Self::RequestApproval { .. } => "requestApproval",
            Self::UpdateApprovalStatus { .. } => "updateApprovalStatus",
            Self::AddComment { .. } => "addComment",
            Self::StartEditing { .. } => "startEditing",
            Self::StopEditing { .. } => "stopEditing",
            Self::CursorMove { .. } => "cursorMove",
        }
    }

    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(ProtocolError::Encode)
    }

    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(text).map_err(ProtocolError::Decode)
    }
}

/// Server → client events.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(
    tag = "event",
    content = "args",
    rename_all = "camelCase",
    rename_all_fields = "camelCase"
)]
pub enum ServerEvent {
    UserJoined { user: User },
    UserLeft { user_id: UserId },
    UsersOnline { users: Vec<User> },
    TaskCreated { task: Value },
    TaskUpdated { task_id: TaskId, changes: Value },
    TaskDeleted { task_id: TaskId },
    ApprovalRequested { update: Value },
    ApprovalStatusChanged {
        update_id: String,
        status: ApprovalStatus,
        approver_id: UserId,
    },
    CommentAdded { update_id: String, comment: Value },
    UserStartedEditing { user_id: UserId, task_id: TaskId },
    UserStoppedEditing { user_id: UserId, task_id: TaskId },
    CursorMove { position: CursorPosition, user_id: UserId },
    Notification { notification: Notification },
    MetricsUpdated { metrics: ProjectMetrics },
}

impl ServerEvent {
    pub fn name(&self) -> &'static str {
        match self {
            Self::UserJoined { .. } => "userJoined",
            Self::UserLeft { .. } => "userLeft",
            Self::UsersOnline { .. } => "usersOnline",
            Self::TaskCreated { .. } => "taskCreated",
            Self::TaskUpdated { .. } => "taskUpdated",
            Self::TaskDeleted { .. } => "taskDeleted",
            Self::ApprovalRequested { .. } => "approvalRequested",
            Self::ApprovalStatusChanged { .. } => "approvalStatusChanged",
            Self::CommentAdded { .. } => "commentAdded",
            Self::UserStartedEditing { .. } => "userStartedEditing",
            Self::UserStoppedEditing { .. } => "userStoppedEditing",
            Self::CursorMove { .. } => "cursorMove",
            Self::Notification { .. } => "notification",
            Self::MetricsUpdated { .. } => "metricsUpdated",
        }
    }

    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(ProtocolError::Encode)
    }

    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(text).map_err(ProtocolError::Decode)
    }
}

/// Protocol errors.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("Serialization error: {0}")]
    Encode(#[source] serde_json::Error),
    #[error("Deserialization error: {0}")]
    Decode(#[source] serde_json::Error),
}
