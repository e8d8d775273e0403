//! The hub: single owner of all room state.
//!
//! ```text
//! conn task ──┐                          ┌──► channel A (writer task)
//! conn task ──┼── HubCommand (mpsc) ──► Hub ──► channel B (writer task)
//! conn task ──┘        ▲                 └──► channel C (writer task)
//!                      │
//!              metrics task (PublishMetrics)
//! ```
//!
//! Connection tasks never touch the registry or broadcaster directly: they
//! post commands to one queue, so intents from one connection are handled
//! in arrival order and every room sees one global event order.

use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::auth::Credential;
use crate::broadcast::{BroadcastStats, Broadcaster, ChannelId, ClientChannel};
use crate::metrics::MetricsProvider;
use crate::protocol::{ClientIntent, ProjectId, ProjectMetrics, ServerEvent, TaskId, User, UserId};
use crate::registry::RoomRegistry;
use crate::session::{MetricsJob, Rooms, Session, SessionState};

/// Messages understood by the hub task.
#[derive(Debug)]
pub enum HubCommand {
    /// A connection passed the handshake.
    Attach {
        channel: ClientChannel,
        credential: Credential,
    },
    Intent {
        channel_id: ChannelId,
        intent: ClientIntent,
    },
    /// Transport closed.
    Detach { channel_id: ChannelId },
    PublishMetrics {
        project_id: ProjectId,
        metrics: ProjectMetrics,
    },
    Members {
        project_id: ProjectId,
        reply: oneshot::Sender<Vec<User>>,
    },
    Editors {
        task_id: TaskId,
        reply: oneshot::Sender<Vec<UserId>>,
    },
    Stats { reply: oneshot::Sender<HubStats> },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("Hub has shut down")]
pub struct HubClosed;

/// Hub-wide statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HubStats {
    pub sessions: usize,
    pub joined_sessions: usize,
    pub rooms: usize,
    pub editing_tasks: usize,
    pub intents_processed: u64,
    pub metrics_published: u64,
    pub broadcast: BroadcastStats,
}

/// Cloneable front door to the hub task.
#[derive(Debug, Clone)]
pub struct HubHandle {
    tx: mpsc::UnboundedSender<HubCommand>,
}

impl HubHandle {
    pub fn attach(&self, channel: ClientChannel, credential: Credential) -> Result<(), HubClosed> {
        self.send(HubCommand::Attach {
            channel,
            credential,
        })
    }

    pub fn intent(&self, channel_id: ChannelId, intent: ClientIntent) -> Result<(), HubClosed> {
        self.send(HubCommand::Intent { channel_id, intent })
    }

    pub fn detach(&self, channel_id: ChannelId) -> Result<(), HubClosed> {
        self.send(HubCommand::Detach { channel_id })
    }

    /// Current members of a project room.
    pub async fn members(&self, project_id: &str) -> Result<Vec<User>, HubClosed> {
        let (reply, rx) = oneshot::channel();
        self.send(HubCommand::Members {
            project_id: project_id.to_string(),
            reply,
        })?;
        rx.await.map_err(|_| HubClosed)
    }

    /// Users currently editing a task.
    pub async fn editors(&self, task_id: &str) -> Result<Vec<UserId>, HubClosed> {
        let (reply, rx) = oneshot::channel();
        self.send(HubCommand::Editors {
            task_id: task_id.to_string(),
            reply,
        })?;
        rx.await.map_err(|_| HubClosed)
    }

    pub async fn stats(&self) -> Result<HubStats, HubClosed> {
        let (reply, rx) = oneshot::channel();
        self.send(HubCommand::Stats { reply })?;
        rx.await.map_err(|_| HubClosed)
    }

    fn send(&self, command: HubCommand) -> Result<(), HubClosed> {
        self.tx.send(command).map_err(|_| HubClosed)
    }
}

/// State owned by the hub task.
pub struct Hub {
    registry: RoomRegistry,
    broadcaster: Broadcaster,
    sessions: HashMap<ChannelId, Session>,
    provider: Arc<dyn MetricsProvider>,
    /// Weak so background metrics tasks do not keep the hub alive.
    feedback: mpsc::WeakUnboundedSender<HubCommand>,
    intents_processed: u64,
    metrics_published: u64,
}

impl Hub {
    /// Start the hub task. It stops once every [`HubHandle`] is dropped.
    pub fn spawn(provider: Arc<dyn MetricsProvider>) -> (HubHandle, JoinHandle<()>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let hub = Hub {
            registry: RoomRegistry::new(),
            broadcaster: Broadcaster::new(),
            sessions: HashMap::new(),
            provider,
            feedback: tx.downgrade(),
            intents_processed: 0,
            metrics_published: 0,
        };
        let task = tokio::spawn(hub.run(rx));
        (HubHandle { tx }, task)
    }

    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<HubCommand>) {
        log::debug!("Hub started");
        while let Some(command) = rx.recv().await {
            self.dispatch(command);
            self.evict_lagging();
        }

        // Every handle is gone: close what is left so rooms empty cleanly.
        let ids: Vec<_> = self.sessions.keys().copied().collect();
        for id in ids {
            self.detach(id);
        }
        log::debug!("Hub stopped");
    }

    fn dispatch(&mut self, command: HubCommand) {
        match command {
            HubCommand::Attach {
                channel,
                credential,
            } => {
                let mut session = Session::new(channel);
                session.authenticate(&credential);
                log::debug!("Session {} attached", session.id());
                self.sessions.insert(session.id(), session);
            }
            HubCommand::Intent { channel_id, intent } => self.intent(channel_id, intent),
            HubCommand::Detach { channel_id } => self.detach(channel_id),
            HubCommand::PublishMetrics {
                project_id,
                metrics,
            } => {
                self.broadcaster
                    .broadcast(&project_id, &ServerEvent::MetricsUpdated { metrics }, None);
                self.metrics_published += 1;
            }
            HubCommand::Members { project_id, reply } => {
                let _ = reply.send(self.registry.list_members(&project_id));
            }
            HubCommand::Editors { task_id, reply } => {
                let _ = reply.send(self.registry.list_editors(&task_id));
            }
            HubCommand::Stats { reply } => {
                let _ = reply.send(self.stats());
            }
        }
    }

    fn intent(&mut self, channel_id: ChannelId, intent: ClientIntent) {
        let Some(session) = self.sessions.get_mut(&channel_id) else {
            log::debug!("Dropping {} from unknown session {channel_id}", intent.name());
            return;
        };
        log::trace!("Session {channel_id}: {}", intent.name());

        let mut rooms = Rooms {
            registry: &mut self.registry,
            broadcaster: &mut self.broadcaster,
        };
        let job = session.handle(intent, &mut rooms);
        self.intents_processed += 1;

        if let Some(job) = job {
            self.recompute_metrics(job);
        }
    }

    fn detach(&mut self, channel_id: ChannelId) {
        let Some(mut session) = self.sessions.remove(&channel_id) else {
            return;
        };
        let mut rooms = Rooms {
            registry: &mut self.registry,
            broadcaster: &mut self.broadcaster,
        };
        session.close(&mut rooms);
        log::debug!("Session {channel_id} detached");
    }

    /// Close sessions whose reliable lane overflowed. Closing broadcasts
    /// `userLeft`, which may evict further peers, so repeat until quiet.
    fn evict_lagging(&mut self) {
        loop {
            let evicted = self.broadcaster.take_evicted();
            if evicted.is_empty() {
                return;
            }
            for channel_id in evicted {
                log::warn!("Session {channel_id} is lagging; closing it");
                self.detach(channel_id);
            }
        }
    }

    fn recompute_metrics(&self, job: MetricsJob) {
        let provider = self.provider.clone();
        let feedback = self.feedback.clone();
        tokio::spawn(async move {
            let Some(metrics) = provider.recompute(&job.project_id, &job.mutation).await else {
                return;
            };
            if let Some(tx) = feedback.upgrade() {
                let _ = tx.send(HubCommand::PublishMetrics {
                    project_id: job.project_id,
                    metrics,
                });
            }
        });
    }

    fn stats(&self) -> HubStats {
        HubStats {
            sessions: self.sessions.len(),
            joined_sessions: self
                .sessions
                .values()
                .filter(|s| s.state() == SessionState::RoomJoined)
                .count(),
            rooms: self.registry.room_count(),
            editing_tasks: self.registry.editing_tasks().len(),
            intents_processed: self.intents_processed,
            metrics_published: self.metrics_published,
            broadcast: self.broadcaster.stats(),
        }
    }
}
