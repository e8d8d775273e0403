//! Room-scoped fan-out of server events to client channels.
//!
//! Every connected client owns a [`ClientChannel`] with two lanes:
//!
//! ```text
//!                 ┌── reliable (bounded, evicting) ──┐
//! Broadcaster ────┤                                  ├──► writer task ──► WebSocket
//!                 └── volatile (bounded, lossy)   ───┘
//! ```
//!
//! Reliable events are never dropped while the channel keeps up. A client
//! that lets its reliable lane fill is lagging: it is pruned from every room
//! and reported through [`Broadcaster::take_evicted`] so its session can be
//! closed. Volatile events (cursor moves) are simply discarded when their
//! lane is full. Neither lane ever blocks the sender. Events are encoded
//! once per broadcast and the frame is shared between recipients.

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use uuid::Uuid;

use crate::protocol::{ProjectId, ServerEvent};

pub type ChannelId = Uuid;

/// An encoded event, shared by every recipient of one broadcast.
pub type Frame = Arc<str>;

/// Default capacity of the reliable lane.
pub const DEFAULT_RELIABLE_CAPACITY: usize = 1024;

/// Default capacity of the volatile lane.
pub const DEFAULT_VOLATILE_CAPACITY: usize = 32;

/// Outcome of a single send attempt on a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    Delivered,
    /// Volatile lane full; event discarded.
    Dropped,
    /// Receiver gone; channel should be forgotten.
    Closed,
    /// Reliable lane full: the receiver is not keeping up and has to be
    /// evicted, since the event cannot be dropped.
    Lagging,
}

/// Sending half of a client's outbound lanes.
#[derive(Debug, Clone)]
pub struct ClientChannel {
    id: ChannelId,
    reliable: mpsc::Sender<Frame>,
    volatile: mpsc::Sender<Frame>,
}

impl ClientChannel {
    /// Create a channel with the default reliable capacity.
    pub fn new(volatile_capacity: usize) -> (Self, ChannelReceiver) {
        Self::with_capacity(DEFAULT_RELIABLE_CAPACITY, volatile_capacity)
    }

    /// Create a channel and the receiver its writer task drains.
    pub fn with_capacity(reliable_capacity: usize, volatile_capacity: usize) -> (Self, ChannelReceiver) {
        let (reliable_tx, reliable_rx) = mpsc::channel(reliable_capacity.max(1));
        let (volatile_tx, volatile_rx) = mpsc::channel(volatile_capacity.max(1));
        let channel = Self {
            id: Uuid::new_v4(),
            reliable: reliable_tx,
            volatile: volatile_tx,
        };
        let receiver = ChannelReceiver {
            reliable: reliable_rx,
            volatile: volatile_rx,
        };
        (channel, receiver)
    }

    pub fn id(&self) -> ChannelId {
        self.id
    }

    pub fn is_closed(&self) -> bool {
        self.reliable.is_closed()
    }

    /// Queue a frame on the reliable lane without waiting.
    pub fn send_frame(&self, frame: Frame) -> SendOutcome {
        match self.reliable.try_send(frame) {
            Ok(()) => SendOutcome::Delivered,
            Err(TrySendError::Full(_)) => SendOutcome::Lagging,
            Err(TrySendError::Closed(_)) => SendOutcome::Closed,
        }
    }

    /// Offer a frame on the volatile lane without waiting.
    pub fn offer_frame(&self, frame: Frame) -> SendOutcome {
        match self.volatile.try_send(frame) {
            Ok(()) => SendOutcome::Delivered,
            Err(TrySendError::Full(_)) => SendOutcome::Dropped,
            Err(TrySendError::Closed(_)) => SendOutcome::Closed,
        }
    }

    /// Encode and queue a single event for this channel only.
    pub fn send_event(&self, event: &ServerEvent) -> SendOutcome {
        match event.encode() {
            Ok(text) => self.send_frame(Arc::from(text)),
            Err(e) => {
                log::error!("Failed to encode {}: {e}", event.name());
                SendOutcome::Dropped
            }
        }
    }
}

/// Receiving half of a client's outbound lanes.
#[derive(Debug)]
pub struct ChannelReceiver {
    reliable: mpsc::Receiver<Frame>,
    volatile: mpsc::Receiver<Frame>,
}

impl ChannelReceiver {
    /// Next frame to write, reliable lane first.
    ///
    /// Returns `None` once the reliable lane is closed.
    pub async fn recv(&mut self) -> Option<Frame> {
        tokio::select! {
            biased;
            frame = self.reliable.recv() => frame,
            Some(frame) = self.volatile.recv() => Some(frame),
        }
    }

    /// Non-blocking variant of [`recv`](Self::recv).
    pub fn try_recv(&mut self) -> Option<Frame> {
        self.reliable
            .try_recv()
            .ok()
            .or_else(|| self.volatile.try_recv().ok())
    }
}

/// Result of one broadcast.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeliveryReport {
    pub delivered: usize,
    pub dropped: usize,
    /// Channels removed from the room, dead or lagging.
    pub pruned: usize,
    /// Of `pruned`, channels evicted for a full reliable lane.
    pub lagging: usize,
}

/// Statistics for monitoring broadcast health.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BroadcastStats {
    pub messages_sent: u64,
    pub messages_dropped: u64,
    pub dead_channels_pruned: u64,
    pub lagging_channels_evicted: u64,
    pub active_rooms: usize,
    pub active_channels: usize,
}

/// Project room → subscribed channels.
#[derive(Debug, Default)]
pub struct Broadcaster {
    rooms: HashMap<ProjectId, HashMap<ChannelId, ClientChannel>>,
    messages_sent: u64,
    messages_dropped: u64,
    dead_channels_pruned: u64,
    lagging_channels_evicted: u64,
    /// Lagging channels not yet collected by [`Broadcaster::take_evicted`].
    evicted: Vec<ChannelId>,
}

impl Broadcaster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a channel to a room's delivery set.
    pub fn subscribe(&mut self, channel: ClientChannel, project_id: &str) {
        self.rooms
            .entry(project_id.to_string())
            .or_default()
            .insert(channel.id(), channel);
    }

    /// Remove a channel from a room's delivery set.
    pub fn unsubscribe(&mut self, channel_id: ChannelId, project_id: &str) -> bool {
        let Some(room) = self.rooms.get_mut(project_id) else {
            return false;
        };
        let removed = room.remove(&channel_id).is_some();
        if room.is_empty() {
            self.rooms.remove(project_id);
        }
        removed
    }

    /// Deliver `event` to every live channel in the room except `exclude`.
    ///
    /// Dead channels are pruned from the room; the failure is logged and
    /// counted, never returned.
    pub fn broadcast(
        &mut self,
        project_id: &str,
        event: &ServerEvent,
        exclude: Option<ChannelId>,
    ) -> DeliveryReport {
        self.fan_out(project_id, event, exclude, ClientChannel::send_frame)
    }

    /// Best-effort variant for high-frequency events. A channel whose
    /// volatile lane is full simply misses this event.
    pub fn broadcast_volatile(
        &mut self,
        project_id: &str,
        event: &ServerEvent,
        exclude: Option<ChannelId>,
    ) -> DeliveryReport {
        self.fan_out(project_id, event, exclude, ClientChannel::offer_frame)
    }

    /// Deliver `event` to a single subscribed channel, wherever it is.
    pub fn send_to(&mut self, channel_id: ChannelId, event: &ServerEvent) -> SendOutcome {
        let Some(channel) = self
            .rooms
            .values()
            .find_map(|room| room.get(&channel_id))
        else {
            return SendOutcome::Closed;
        };
        let outcome = channel.send_event(event);
        match outcome {
            SendOutcome::Delivered => self.messages_sent += 1,
            SendOutcome::Lagging => self.evict(channel_id),
            SendOutcome::Dropped | SendOutcome::Closed => {}
        }
        outcome
    }

    /// Channels evicted for lagging since the last call. Their sessions
    /// should be closed; they no longer receive anything.
    pub fn take_evicted(&mut self) -> Vec<ChannelId> {
        std::mem::take(&mut self.evicted)
    }

    fn evict(&mut self, channel_id: ChannelId) {
        self.rooms.retain(|project_id, room| {
            if room.remove(&channel_id).is_some() {
                log::warn!("Evicted lagging channel {channel_id} from room {project_id}");
            }
            !room.is_empty()
        });
        self.lagging_channels_evicted += 1;
        self.evicted.push(channel_id);
    }

    fn fan_out(
        &mut self,
        project_id: &str,
        event: &ServerEvent,
        exclude: Option<ChannelId>,
        send: fn(&ClientChannel, Frame) -> SendOutcome,
    ) -> DeliveryReport {
        let mut report = DeliveryReport::default();
        let Some(room) = self.rooms.get_mut(project_id) else {
            return report;
        };

        let frame: Frame = match event.encode() {
            Ok(text) => Arc::from(text),
            Err(e) => {
                log::error!("Failed to encode {} for room {project_id}: {e}", event.name());
                return report;
            }
        };

        let mut dead = Vec::new();
        let mut lagging = Vec::new();
        for (id, channel) in room.iter() {
            if Some(*id) == exclude {
                continue;
            }
            match send(channel, frame.clone()) {
                SendOutcome::Delivered => report.delivered += 1,
                SendOutcome::Dropped => report.dropped += 1,
                SendOutcome::Closed => dead.push(*id),
                SendOutcome::Lagging => lagging.push(*id),
            }
        }

        for id in &dead {
            room.remove(id);
        }
        report.pruned = dead.len();
        report.lagging = lagging.len();
        if room.is_empty() {
            self.rooms.remove(project_id);
        }
        for id in lagging {
            self.evict(id);
        }
        report.pruned += report.lagging;

        if !dead.is_empty() {
            log::warn!(
                "Pruned {} dead channel(s) from room {project_id} during {}",
                dead.len(),
                event.name()
            );
        }
        if report.dropped > 0 {
            log::trace!(
                "Dropped {} volatile {} frame(s) in room {project_id}",
                report.dropped,
                event.name()
            );
        }

        self.messages_sent += report.delivered as u64;
        self.messages_dropped += report.dropped as u64;
        self.dead_channels_pruned += dead.len() as u64;
        report
    }

    /// Number of channels subscribed to a room.
    pub fn subscriber_count(&self, project_id: &str) -> usize {
        self.rooms.get(project_id).map_or(0, HashMap::len)
    }

    pub fn is_subscribed(&self, channel_id: ChannelId, project_id: &str) -> bool {
        self.rooms
            .get(project_id)
            .is_some_and(|room| room.contains_key(&channel_id))
    }

    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }

    pub fn stats(&self) -> BroadcastStats {
        BroadcastStats {
            messages_sent: self.messages_sent,
            messages_dropped: self.messages_dropped,
            dead_channels_pruned: self.dead_channels_pruned,
            lagging_channels_evicted: self.lagging_channels_evicted,
            active_rooms: self.rooms.len(),
            active_channels: self.rooms.values().map(HashMap::len).sum(),
        }
    }
}
