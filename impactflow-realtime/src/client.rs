//! WebSocket client with automatic reconnect and room resubscription.
//!
//! ```text
//!            connect()              link up
//! Disconnected ──────► Connecting ──────────► Connected
//!      ▲                  │  ▲                    │
//!      │ disconnect()     │  └── retry_delay ◄────┤ link lost
//!      │                  ▼                       │
//!      └───────────── Failed ◄── max_retries / 401
//! ```
//!
//! The controller remembers the last `joinProject` it was asked to send and
//! re-sends it on every (re)connection before announcing
//! [`ClientEvent::Connected`], so the server-side room membership is
//! restored before the application sends anything else.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::AUTHORIZATION;
use tokio_tungstenite::tungstenite::http::{HeaderValue, StatusCode};
use tokio_tungstenite::tungstenite::Message;

use crate::protocol::{ClientIntent, ProjectId, ServerEvent, User, UserId};

/// Client connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    /// Retries exhausted or credentials refused. Terminal until the next
    /// [`ReconnectController::connect`].
    Failed,
}

/// Events delivered to the application.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    /// Connection established (after the remembered join was re-sent).
    Connected,
    /// Connection lost unexpectedly; a retry is scheduled.
    Disconnected,
    Server(ServerEvent),
    /// `max_retries` consecutive attempts failed.
    GaveUp,
    /// The server refused the credential.
    AuthenticationFailed,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ClientError {
    #[error("Connection failed: {0}")]
    Connect(String),
    #[error("Authentication rejected: {0}")]
    Authentication(String),
    #[error("Connection driver stopped unexpectedly")]
    Stopped,
}

/// Reconnect policy.
#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    pub max_retries: u32,
    pub retry_delay: Duration,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            max_retries: 5,
            retry_delay: Duration::from_secs(1),
        }
    }
}

/// One live transport: text frames out, text frames in.
///
/// The link is considered lost once `incoming` yields `None`.
#[derive(Debug)]
pub struct Link {
    pub outgoing: mpsc::UnboundedSender<String>,
    pub incoming: mpsc::UnboundedReceiver<String>,
}

/// Opens transports to the server.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self) -> Result<Link, ClientError>;
}

/// [`Connector`] over a real WebSocket, authenticating with a bearer token.
#[derive(Debug, Clone)]
pub struct WsConnector {
    url: String,
    token: String,
}

impl WsConnector {
    pub fn new(url: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            token: token.into(),
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl Connector for WsConnector {
    async fn connect(&self) -> Result<Link, ClientError> {
        let mut request = self
            .url
            .as_str()
            .into_client_request()
            .map_err(|e| ClientError::Connect(e.to_string()))?;
        let bearer = HeaderValue::from_str(&format!("Bearer {}", self.token))
            .map_err(|e| ClientError::Connect(e.to_string()))?;
        request.headers_mut().insert(AUTHORIZATION, bearer);

        let ws_stream = match tokio_tungstenite::connect_async(request).await {
            Ok((ws, _)) => ws,
            Err(tungstenite::Error::Http(response)) if response.status() == StatusCode::UNAUTHORIZED => {
                return Err(ClientError::Authentication(format!(
                    "server answered {}",
                    response.status()
                )));
            }
            Err(e) => return Err(ClientError::Connect(e.to_string())),
        };
        let (mut ws_writer, mut ws_reader) = ws_stream.split();

        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<String>();
        let (in_tx, in_rx) = mpsc::unbounded_channel::<String>();

        // Writer task: forward outgoing channel to WebSocket
        tokio::spawn(async move {
            while let Some(text) = out_rx.recv().await {
                if ws_writer.send(Message::text(text)).await.is_err() {
                    break;
                }
            }
            let _ = ws_writer.close().await;
        });

        // Reader task: dropping `in_tx` signals a lost link
        tokio::spawn(async move {
            while let Some(msg) = ws_reader.next().await {
                match msg {
                    Ok(Message::Text(text)) => {
                        if in_tx.send(text.to_string()).is_err() {
                            break;
                        }
                    }
                    Ok(Message::Close(_)) | Err(_) => break,
                    Ok(_) => {}
                }
            }
        });

        Ok(Link {
            outgoing: out_tx,
            incoming: in_rx,
        })
    }
}

#[derive(Debug)]
enum Command {
    Emit(ClientIntent),
    Disconnect,
}

enum Attempt {
    Linked(Link),
    Failed(ClientError),
    Cancelled,
}

enum SessionEnd {
    Lost,
    Stopped,
}

/// Background task owning the transport and the reconnect loop.
struct Driver {
    connector: Arc<dyn Connector>,
    config: ReconnectConfig,
    commands: mpsc::UnboundedReceiver<Command>,
    events: mpsc::UnboundedSender<ClientEvent>,
    state: Arc<RwLock<ConnectionState>>,
    retry_count: Arc<AtomicU32>,
    remembered: Option<(ProjectId, User)>,
}

impl Driver {
    async fn run(mut self) -> Self {
        let mut retries = 0u32;
        loop {
            self.set_state(ConnectionState::Connecting).await;
            match self.attempt().await {
                Attempt::Linked(link) => {
                    retries = 0;
                    self.retry_count.store(0, Ordering::SeqCst);
                    match self.session(link).await {
                        SessionEnd::Stopped => break,
                        SessionEnd::Lost => {
                            log::warn!("Connection lost");
                            self.set_state(ConnectionState::Disconnected).await;
                            self.notify(ClientEvent::Disconnected);
                        }
                    }
                }
                Attempt::Failed(ClientError::Authentication(reason)) => {
                    log::error!("Authentication rejected: {reason}");
                    self.set_state(ConnectionState::Failed).await;
                    self.notify(ClientEvent::AuthenticationFailed);
                    return self;
                }
                Attempt::Failed(e) => log::warn!("{e}"),
                Attempt::Cancelled => break,
            }

            if retries >= self.config.max_retries {
                log::error!("Giving up after {retries} reconnect attempt(s)");
                self.set_state(ConnectionState::Failed).await;
                self.notify(ClientEvent::GaveUp);
                return self;
            }
            retries += 1;
            self.retry_count.store(retries, Ordering::SeqCst);
            self.set_state(ConnectionState::Disconnected).await;
            log::info!(
                "Reconnecting in {:?} (attempt {retries}/{})",
                self.config.retry_delay,
                self.config.max_retries
            );
            if !self.backoff().await {
                break;
            }
        }

        self.set_state(ConnectionState::Disconnected).await;
        self
    }

    async fn attempt(&mut self) -> Attempt {
        let connector = self.connector.clone();
        let connecting = connector.connect();
        tokio::pin!(connecting);
        loop {
            tokio::select! {
                biased;
                command = self.commands.recv() => match command {
                    Some(Command::Emit(intent)) => self.offline(intent),
                    Some(Command::Disconnect) | None => {
                        self.remembered = None;
                        return Attempt::Cancelled;
                    }
                },
                result = &mut connecting => {
                    return match result {
                        Ok(link) => Attempt::Linked(link),
                        Err(e) => Attempt::Failed(e),
                    };
                }
            }
        }
    }

    async fn session(&mut self, mut link: Link) -> SessionEnd {
        if let Some((project_id, user)) = &self.remembered {
            log::info!("Rejoining project {project_id} as {}", user.id);
            let replay = ClientIntent::JoinProject {
                project_id: project_id.clone(),
                user: user.clone(),
            };
            send(&link, &replay);
        }
        self.set_state(ConnectionState::Connected).await;
        log::info!("Connected");
        self.notify(ClientEvent::Connected);

        loop {
            tokio::select! {
                frame = link.incoming.recv() => match frame {
                    Some(text) => match ServerEvent::decode(&text) {
                        Ok(event) => self.notify(ClientEvent::Server(event)),
                        Err(e) => log::warn!("Ignoring undecodable server frame: {e}"),
                    },
                    None => return SessionEnd::Lost,
                },
                command = self.commands.recv() => match command {
                    Some(Command::Emit(intent)) => {
                        self.remember(&intent);
                        send(&link, &intent);
                    }
                    Some(Command::Disconnect) | None => {
                        self.remembered = None;
                        return SessionEnd::Stopped;
                    }
                },
            }
        }
    }

    /// Wait out the retry delay. Returns `false` if told to stop meanwhile.
    async fn backoff(&mut self) -> bool {
        let delay = tokio::time::sleep(self.config.retry_delay);
        tokio::pin!(delay);
        loop {
            tokio::select! {
                _ = &mut delay => return true,
                command = self.commands.recv() => match command {
                    Some(Command::Emit(intent)) => self.offline(intent),
                    Some(Command::Disconnect) | None => {
                        self.remembered = None;
                        return false;
                    }
                },
            }
        }
    }

    fn remember(&mut self, intent: &ClientIntent) {
        match intent {
            ClientIntent::JoinProject { project_id, user } => {
                self.remembered = Some((project_id.clone(), user.clone()));
            }
            ClientIntent::LeaveProject { project_id, .. } => {
                if self
                    .remembered
                    .as_ref()
                    .is_some_and(|(current, _)| current == project_id)
                {
                    self.remembered = None;
                }
            }
            _ => {}
        }
    }

    fn offline(&mut self, intent: ClientIntent) {
        match intent {
            ClientIntent::JoinProject { .. } | ClientIntent::LeaveProject { .. } => {
                self.remember(&intent);
            }
            other => log::warn!("Not connected; dropping {}", other.name()),
        }
    }

    fn notify(&self, event: ClientEvent) {
        let _ = self.events.send(event);
    }

    async fn set_state(&self, state: ConnectionState) {
        *self.state.write().await = state;
    }
}

fn send(link: &Link, intent: &ClientIntent) {
    match intent.encode() {
        Ok(text) => {
            if link.outgoing.send(text).is_err() {
                log::debug!("Link closed; {} not sent", intent.name());
            }
        }
        Err(e) => log::error!("Failed to encode {}: {e}", intent.name()),
    }
}

/// Application-facing reconnecting client.
pub struct ReconnectController {
    commands: mpsc::UnboundedSender<Command>,
    idle: Option<Driver>,
    running: Option<JoinHandle<Driver>>,
    state: Arc<RwLock<ConnectionState>>,
    retry_count: Arc<AtomicU32>,
    event_rx: Option<mpsc::UnboundedReceiver<ClientEvent>>,
}

impl ReconnectController {
    pub fn new(connector: Arc<dyn Connector>, config: ReconnectConfig) -> Self {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let state = Arc::new(RwLock::new(ConnectionState::Disconnected));
        let retry_count = Arc::new(AtomicU32::new(0));
        let driver = Driver {
            connector,
            config,
            commands: command_rx,
            events: event_tx,
            state: state.clone(),
            retry_count: retry_count.clone(),
            remembered: None,
        };
        Self {
            commands: command_tx,
            idle: Some(driver),
            running: None,
            state,
            retry_count,
            event_rx: Some(event_rx),
        }
    }

    /// Client for a WebSocket URL with the default reconnect policy.
    pub fn websocket(url: impl Into<String>, token: impl Into<String>) -> Self {
        Self::new(Arc::new(WsConnector::new(url, token)), ReconnectConfig::default())
    }

    /// Take the event receiver (can only be called once).
    pub fn take_event_rx(&mut self) -> Option<mpsc::UnboundedReceiver<ClientEvent>> {
        self.event_rx.take()
    }

    /// Start connecting. No-op while a connection loop is already active.
    pub async fn connect(&mut self) -> Result<(), ClientError> {
        if let Some(handle) = &self.running {
            if !handle.is_finished() {
                return Ok(());
            }
        }
        self.reclaim().await?;
        let Some(driver) = self.idle.take() else {
            return Err(ClientError::Stopped);
        };
        self.retry_count.store(0, Ordering::SeqCst);
        self.running = Some(tokio::spawn(driver.run()));
        Ok(())
    }

    /// Send an intent. While not connected only join/leave are kept (as the
    /// membership to restore); everything else is dropped with a warning.
    pub fn emit(&self, intent: ClientIntent) {
        if self.commands.send(Command::Emit(intent)).is_err() {
            log::warn!("Client driver is gone; intent dropped");
        }
    }

    pub fn join_project(&self, project_id: impl Into<ProjectId>, user: User) {
        self.emit(ClientIntent::JoinProject {
            project_id: project_id.into(),
            user,
        });
    }

    pub fn leave_project(&self, project_id: impl Into<ProjectId>, user_id: impl Into<UserId>) {
        self.emit(ClientIntent::LeaveProject {
            project_id: project_id.into(),
            user_id: user_id.into(),
        });
    }

    /// Close the connection, forget the remembered join and cancel any
    /// pending retry.
    pub async fn disconnect(&mut self) -> Result<(), ClientError> {
        if self.running.is_some() {
            let _ = self.commands.send(Command::Disconnect);
        }
        self.reclaim().await?;
        if let Some(driver) = self.idle.as_mut() {
            while driver.commands.try_recv().is_ok() {}
            driver.remembered = None;
        }
        *self.state.write().await = ConnectionState::Disconnected;
        Ok(())
    }

    pub async fn state(&self) -> ConnectionState {
        *self.state.read().await
    }

    /// Consecutive failed attempts since the last successful connection.
    pub fn retry_count(&self) -> u32 {
        self.retry_count.load(Ordering::SeqCst)
    }

    async fn reclaim(&mut self) -> Result<(), ClientError> {
        if let Some(handle) = self.running.take() {
            match handle.await {
                Ok(driver) => self.idle = Some(driver),
                Err(e) => {
                    log::error!("Client driver panicked: {e}");
                    return Err(ClientError::Stopped);
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::UserRole;
    use serde_json::json;
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use tokio::time::timeout;

    #[derive(Debug, Clone, Copy)]
    enum Step {
        Accept,
        Refuse,
        Reject,
    }

    /// The server half of a scripted link.
    struct ServerEnd {
        to_client: mpsc::UnboundedSender<String>,
        from_client: mpsc::UnboundedReceiver<String>,
    }

    struct ScriptedConnector {
        script: Mutex<VecDeque<Step>>,
        attempts: AtomicU32,
        ends: mpsc::UnboundedSender<ServerEnd>,
    }

    impl ScriptedConnector {
        fn new(steps: &[Step]) -> (Arc<Self>, mpsc::UnboundedReceiver<ServerEnd>) {
            let (ends, ends_rx) = mpsc::unbounded_channel();
            let connector = Arc::new(Self {
                script: Mutex::new(steps.iter().copied().collect()),
                attempts: AtomicU32::new(0),
                ends,
            });
            (connector, ends_rx)
        }

        fn attempts(&self) -> u32 {
            self.attempts.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Connector for ScriptedConnector {
        async fn connect(&self) -> Result<Link, ClientError> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            let step = self.script.lock().unwrap().pop_front().unwrap_or(Step::Refuse);
            match step {
                Step::Accept => {
                    let (out_tx, out_rx) = mpsc::unbounded_channel();
                    let (in_tx, in_rx) = mpsc::unbounded_channel();
                    let _ = self.ends.send(ServerEnd {
                        to_client: in_tx,
                        from_client: out_rx,
                    });
                    Ok(Link {
                        outgoing: out_tx,
                        incoming: in_rx,
                    })
                }
                Step::Refuse => Err(ClientError::Connect("connection refused".into())),
                Step::Reject => Err(ClientError::Authentication("401".into())),
            }
        }
    }

    fn alice() -> User {
        User::new("A", "Alice", "alice@example.com", UserRole::ProjectManager)
    }

    fn controller(connector: Arc<ScriptedConnector>) -> (ReconnectController, mpsc::UnboundedReceiver<ClientEvent>) {
        let mut controller = ReconnectController::new(connector, ReconnectConfig::default());
        let events = controller.take_event_rx().unwrap();
        (controller, events)
    }

    async fn next(events: &mut mpsc::UnboundedReceiver<ClientEvent>) -> ClientEvent {
        timeout(Duration::from_secs(60), events.recv())
            .await
            .expect("timed out")
            .expect("event channel closed")
    }

    fn decode_intent(text: &str) -> ClientIntent {
        ClientIntent::decode(text).unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn test_join_replayed_before_connected() {
        let (connector, mut ends) = ScriptedConnector::new(&[Step::Accept]);
        let (mut client, mut events) = controller(connector);

        client.join_project("P1", alice());
        client.connect().await.unwrap();
        assert_eq!(next(&mut events).await, ClientEvent::Connected);

        let mut end = ends.recv().await.unwrap();
        let first = end.from_client.try_recv().expect("join must precede Connected");
        assert_eq!(
            decode_intent(&first),
            ClientIntent::JoinProject {
                project_id: "P1".into(),
                user: alice()
            }
        );
        assert_eq!(client.state().await, ConnectionState::Connected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_after_drop_rejoins() {
        let (connector, mut ends) = ScriptedConnector::new(&[Step::Accept, Step::Refuse, Step::Accept]);
        let (mut client, mut events) = controller(connector.clone());

        client.connect().await.unwrap();
        assert_eq!(next(&mut events).await, ClientEvent::Connected);
        client.join_project("P1", alice());
        let mut first = ends.recv().await.unwrap();
        assert!(matches!(
            decode_intent(&first.from_client.recv().await.unwrap()),
            ClientIntent::JoinProject { .. }
        ));

        drop(first);
        assert_eq!(next(&mut events).await, ClientEvent::Disconnected);
        assert_eq!(next(&mut events).await, ClientEvent::Connected);
        assert_eq!(connector.attempts(), 3);
        assert_eq!(client.retry_count(), 0);

        let mut second = ends.recv().await.unwrap();
        let replay = second.from_client.try_recv().unwrap();
        assert_eq!(
            decode_intent(&replay),
            ClientIntent::JoinProject {
                project_id: "P1".into(),
                user: alice()
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_gives_up_after_max_retries() {
        let (connector, mut ends) = ScriptedConnector::new(&[Step::Accept]);
        let (mut client, mut events) = controller(connector.clone());

        client.connect().await.unwrap();
        assert_eq!(next(&mut events).await, ClientEvent::Connected);
        drop(ends.recv().await.unwrap());

        assert_eq!(next(&mut events).await, ClientEvent::Disconnected);
        assert_eq!(next(&mut events).await, ClientEvent::GaveUp);
        assert_eq!(client.state().await, ConnectionState::Failed);
        assert_eq!(client.retry_count(), 5);
        assert_eq!(connector.attempts(), 6);

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(connector.attempts(), 6);
    }

    #[tokio::test(start_paused = true)]
    async fn test_authentication_rejection_is_not_retried() {
        let (connector, _ends) = ScriptedConnector::new(&[Step::Reject, Step::Accept]);
        let (mut client, mut events) = controller(connector.clone());

        client.connect().await.unwrap();
        assert_eq!(next(&mut events).await, ClientEvent::AuthenticationFailed);
        assert_eq!(client.state().await, ConnectionState::Failed);

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(connector.attempts(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_cancels_pending_retry() {
        let (connector, mut ends) = ScriptedConnector::new(&[Step::Refuse, Step::Accept]);
        let (mut client, _events) = controller(connector.clone());

        client.join_project("P1", alice());
        client.connect().await.unwrap();
        while connector.attempts() < 1 {
            tokio::task::yield_now().await;
        }
        client.disconnect().await.unwrap();
        assert_eq!(client.state().await, ConnectionState::Disconnected);

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(connector.attempts(), 1);

        // The remembered join was forgotten along with the retry.
        client.connect().await.unwrap();
        let mut end = ends.recv().await.unwrap();
        tokio::task::yield_now().await;
        assert!(end.from_client.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_emit_while_disconnected_is_dropped() {
        let (connector, mut ends) = ScriptedConnector::new(&[Step::Accept]);
        let (mut client, mut events) = controller(connector);

        client.emit(ClientIntent::CreateTask { task: json!({"id": "T1"}) });
        client.connect().await.unwrap();
        assert_eq!(next(&mut events).await, ClientEvent::Connected);

        let mut end = ends.recv().await.unwrap();
        assert!(end.from_client.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_server_events_are_forwarded() {
        let (connector, mut ends) = ScriptedConnector::new(&[Step::Accept]);
        let (mut client, mut events) = controller(connector);

        client.connect().await.unwrap();
        assert_eq!(next(&mut events).await, ClientEvent::Connected);
        let end = ends.recv().await.unwrap();

        let event = ServerEvent::TaskDeleted { task_id: "T1".into() };
        end.to_client.send(event.encode().unwrap()).unwrap();
        end.to_client.send("garbage".into()).unwrap();
        assert_eq!(next(&mut events).await, ClientEvent::Server(event));
    }

    #[tokio::test]
    async fn test_initial_state() {
        let (connector, _ends) = ScriptedConnector::new(&[]);
        let (client, _events) = controller(connector);
        assert_eq!(client.state().await, ConnectionState::Disconnected);
        assert_eq!(client.retry_count(), 0);
    }

    #[tokio::test]
    async fn test_take_event_rx() {
        let (connector, _ends) = ScriptedConnector::new(&[]);
        let mut client = ReconnectController::new(connector, ReconnectConfig::default());
        assert!(client.take_event_rx().is_some());
        assert!(client.take_event_rx().is_none());
    }
}
