//! Mesh engine actor
//!
//! One task owns the reassembly store and the broadcast scheduler. Transport
//! packets, scheduler ticks, public commands and gateway results are handled
//! one at a time inside that task; callers only hold a cheap [`MeshEngine`]
//! handle that talks to it over channels.

use crate::adapter::{self, ListenHandle, MeshTransport};
use crate::codec::{self, MessageId};
use crate::connectivity::ConnectivityFlag;
use crate::error::{MeshError, MeshResult};
use crate::gateway::{FailureStage, GatewayRelay, GatewayResponse};
use crate::reassembly::{ChunkOutcome, CompletedMessage, MessageRole, Progress, ReassemblyStore};
use crate::scheduler::BroadcastScheduler;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

/// Characters of message text shown by [`MeshEngine::current_broadcast_info`]
const PREVIEW_CHARS: usize = 60;

const COMMAND_BUFFER: usize = 64;
const EVENT_BUFFER: usize = 256;

#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Scheduler period
    pub tick_interval: Duration,
    /// Wait before listening again after a full clear
    pub relisten_delay: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_millis(250),
            relisten_delay: Duration::from_millis(500),
        }
    }
}

impl From<&shared::config::MeshConfig> for EngineConfig {
    fn from(config: &shared::config::MeshConfig) -> Self {
        Self {
            tick_interval: Duration::from_millis(config.tick_interval_ms),
            relisten_delay: Duration::from_millis(config.relisten_delay_ms),
        }
    }
}

/// Notifications published to [`MeshEngine::subscribe`] receivers
#[derive(Debug, Clone, PartialEq)]
pub enum MeshEvent {
    /// Every chunk of a message heard on the channel has arrived
    MessageCompleted {
        id: MessageId,
        role: MessageRole,
        text: String,
    },
    /// An acknowledgement completed; `response` is `None` if it was not a gateway result
    AckReceived {
        id: MessageId,
        response: Option<GatewayResponse>,
    },
    /// This node submitted a request and queued the result for broadcast
    GatewayResult {
        id: MessageId,
        response: GatewayResponse,
    },
    /// A completed message was queued for rebroadcast without submission
    RelayScheduled {
        id: MessageId,
        role: MessageRole,
        chunks: usize,
    },
    /// Everything was cleared and broadcasting stopped
    Cleared,
}

/// Message currently under the broadcast cursor
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BroadcastInfo {
    pub id: MessageId,
    pub preview: String,
}

/// Snapshot of one reassembly entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageSummary {
    pub id: MessageId,
    pub role: MessageRole,
    pub progress: Progress,
    pub text: Option<String>,
}

enum Command {
    Broadcast {
        text: String,
        reply: oneshot::Sender<MeshResult<MessageId>>,
    },
    Start,
    Stop,
    ClearAll {
        reply: oneshot::Sender<()>,
    },
    Relisten {
        epoch: u64,
    },
    CurrentInfo {
        reply: oneshot::Sender<Option<BroadcastInfo>>,
    },
    Progress {
        id: MessageId,
        reply: oneshot::Sender<Option<Progress>>,
    },
    Messages {
        reply: oneshot::Sender<Vec<MessageSummary>>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

/// Gateway outcome delivered back into the actor
struct GatewayDone {
    id: MessageId,
    epoch: u64,
    response: GatewayResponse,
}

/// Handle to a running mesh engine
#[derive(Clone)]
pub struct MeshEngine {
    commands: mpsc::Sender<Command>,
    events: broadcast::Sender<MeshEvent>,
}

impl MeshEngine {
    /// Start listening on `transport` and spawn the engine task
    ///
    /// Without a gateway the node only ever relays completed requests.
    pub async fn spawn(
        transport: Arc<dyn MeshTransport>,
        gateway: Option<Arc<GatewayRelay>>,
        connectivity: ConnectivityFlag,
        config: EngineConfig,
    ) -> MeshResult<Self> {
        adapter::check_packet_size(transport.as_ref())?;
        let listener = transport.listen().await?;

        let (commands_tx, commands_rx) = mpsc::channel(COMMAND_BUFFER);
        let (gateway_tx, gateway_rx) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(EVENT_BUFFER);

        info!(
            "Starting mesh engine (tick {:?}, gateway {})",
            config.tick_interval,
            if gateway.is_some() { "enabled" } else { "disabled" }
        );

        let actor = EngineActor {
            transport,
            gateway,
            connectivity,
            config,
            store: ReassemblyStore::new(),
            scheduler: BroadcastScheduler::new(),
            listener: Some(listener),
            commands: commands_rx,
            self_commands: commands_tx.downgrade(),
            gateway_tx,
            gateway_rx,
            events: events.clone(),
            epoch: 0,
        };
        tokio::spawn(actor.run());

        Ok(Self {
            commands: commands_tx,
            events,
        })
    }

    async fn request<T>(&self, build: impl FnOnce(oneshot::Sender<T>) -> Command) -> MeshResult<T> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(build(reply))
            .await
            .map_err(|_| MeshError::EngineStopped)?;
        response.await.map_err(|_| MeshError::EngineStopped)
    }

    async fn send(&self, command: Command) -> MeshResult<()> {
        self.commands
            .send(command)
            .await
            .map_err(|_| MeshError::EngineStopped)
    }

    /// Encode `text` as a new request, store it and start repeating it
    pub async fn broadcast_message(&self, text: impl Into<String>) -> MeshResult<MessageId> {
        let text = text.into();
        self.request(|reply| Command::Broadcast { text, reply })
            .await?
    }

    pub async fn start_broadcasting(&self) -> MeshResult<()> {
        self.send(Command::Start).await
    }

    /// Stop repeating; queued messages are kept
    pub async fn stop_broadcasting(&self) -> MeshResult<()> {
        self.send(Command::Stop).await
    }

    /// Stop broadcasting, forget every message and restart listening after a delay
    pub async fn clear_all_and_stop(&self) -> MeshResult<()> {
        self.request(|reply| Command::ClearAll { reply }).await
    }

    pub async fn current_broadcast_info(&self) -> MeshResult<Option<BroadcastInfo>> {
        self.request(|reply| Command::CurrentInfo { reply }).await
    }

    pub async fn progress_for(&self, id: MessageId) -> MeshResult<Option<Progress>> {
        self.request(|reply| Command::Progress { id, reply }).await
    }

    /// Snapshot of every message the node knows about, ordered by id
    pub async fn messages(&self) -> MeshResult<Vec<MessageSummary>> {
        self.request(|reply| Command::Messages { reply }).await
    }

    pub fn subscribe(&self) -> broadcast::Receiver<MeshEvent> {
        self.events.subscribe()
    }

    /// Stop the engine task; later calls on any handle fail with `EngineStopped`
    pub async fn shutdown(&self) -> MeshResult<()> {
        self.request(|reply| Command::Shutdown { reply }).await
    }
}

struct EngineActor {
    transport: Arc<dyn MeshTransport>,
    gateway: Option<Arc<GatewayRelay>>,
    connectivity: ConnectivityFlag,
    config: EngineConfig,
    store: ReassemblyStore,
    scheduler: BroadcastScheduler,
    listener: Option<ListenHandle>,
    commands: mpsc::Receiver<Command>,
    /// Lets delayed work post back without keeping the engine alive
    self_commands: mpsc::WeakSender<Command>,
    gateway_tx: mpsc::UnboundedSender<GatewayDone>,
    gateway_rx: mpsc::UnboundedReceiver<GatewayDone>,
    events: broadcast::Sender<MeshEvent>,
    /// Bumped on every full clear; older gateway results are dropped
    epoch: u64,
}

async fn next_packet(listener: &mut Option<ListenHandle>) -> Option<Vec<u8>> {
    match listener {
        Some(handle) => handle.recv().await,
        None => std::future::pending().await,
    }
}

impl EngineActor {
    async fn run(mut self) {
        let mut ticker = tokio::time::interval(self.config.tick_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let running = self.scheduler.is_running();

            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(Command::Shutdown { reply }) => {
                        self.scheduler.stop(self.transport.as_ref()).await;
                        let _ = reply.send(());
                        break;
                    }
                    Some(command) => self.handle_command(command).await,
                    None => break,
                },
                packet = next_packet(&mut self.listener) => match packet {
                    Some(bytes) => self.on_packet(&bytes),
                    None => {
                        warn!("Transport listener closed");
                        self.listener = None;
                    }
                },
                Some(done) = self.gateway_rx.recv() => self.on_gateway_done(done),
                _ = ticker.tick(), if running => {
                    self.scheduler.tick(self.transport.as_ref()).await;
                }
            }
        }

        info!("Mesh engine stopped");
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::Broadcast { text, reply } => {
                let _ = reply.send(self.broadcast(text));
            }
            Command::Start => self.scheduler.start(),
            Command::Stop => self.scheduler.stop(self.transport.as_ref()).await,
            Command::ClearAll { reply } => {
                self.clear_all().await;
                let _ = reply.send(());
            }
            Command::Relisten { epoch } => self.relisten(epoch).await,
            Command::CurrentInfo { reply } => {
                let _ = reply.send(self.current_info());
            }
            Command::Progress { id, reply } => {
                let _ = reply.send(self.store.get(id).map(|entry| entry.progress()));
            }
            Command::Messages { reply } => {
                let summaries = self
                    .store
                    .iter()
                    .map(|entry| MessageSummary {
                        id: entry.id(),
                        role: entry.role(),
                        progress: entry.progress(),
                        text: entry.text().map(str::to_string),
                    })
                    .collect();
                let _ = reply.send(summaries);
            }
            // Handled in the run loop
            Command::Shutdown { reply } => {
                let _ = reply.send(());
            }
        }
    }

    fn broadcast(&mut self, text: String) -> MeshResult<MessageId> {
        let id =
            codec::fresh_message_id(|id| self.store.contains(id) || self.scheduler.contains(id))?;
        let chunks = codec::encode_with_id(&text, id, false)?;
        info!("Broadcasting message {} ({} chunks)", id, chunks.len());

        self.store
            .insert_complete(id, MessageRole::Request, chunks.clone(), text);
        self.scheduler.enqueue(id, chunks);
        Ok(id)
    }

    async fn clear_all(&mut self) {
        self.scheduler.stop(self.transport.as_ref()).await;
        self.listener = None;
        self.store.clear();
        self.scheduler.clear();
        self.epoch += 1;

        info!(
            "Cleared all messages, listening again in {:?}",
            self.config.relisten_delay
        );

        let commands = self.self_commands.clone();
        let epoch = self.epoch;
        let delay = self.config.relisten_delay;
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(commands) = commands.upgrade() {
                let _ = commands.send(Command::Relisten { epoch }).await;
            }
        });

        self.publish(MeshEvent::Cleared);
    }

    async fn relisten(&mut self, epoch: u64) {
        if epoch != self.epoch || self.listener.is_some() {
            return;
        }
        match self.transport.listen().await {
            Ok(listener) => {
                debug!("Listening again after clear");
                self.listener = Some(listener);
            }
            Err(e) => error!("Failed to restart listening: {}", e),
        }
    }

    fn current_info(&self) -> Option<BroadcastInfo> {
        let (id, _) = self.scheduler.current_entry()?;
        let preview = match self.store.get(id).and_then(|entry| entry.text()) {
            Some(text) if text.chars().count() > PREVIEW_CHARS => {
                format!("{}...", text.chars().take(PREVIEW_CHARS).collect::<String>())
            }
            Some(text) => text.to_string(),
            None => "Broadcasting...".to_string(),
        };
        Some(BroadcastInfo { id, preview })
    }

    fn on_packet(&mut self, bytes: &[u8]) {
        if let ChunkOutcome::Completed(message) = self.store.on_chunk(bytes) {
            self.on_completed(message);
        }
    }

    fn on_completed(&mut self, message: CompletedMessage) {
        self.publish(MeshEvent::MessageCompleted {
            id: message.id,
            role: message.role,
            text: message.text.clone(),
        });

        match message.role {
            MessageRole::Ack => {
                let response = serde_json::from_str::<GatewayResponse>(&message.text).ok();
                match &response {
                    Some(result) => info!(
                        "Acknowledgement for message {} received (success: {})",
                        message.id, result.success
                    ),
                    None => warn!("Acknowledgement for message {} is not a gateway result", message.id),
                }
                self.publish(MeshEvent::AckReceived {
                    id: message.id,
                    response,
                });

                // Offline nodes carry the result further; it replaces the request entry
                if !self.connectivity.is_online() {
                    self.relay(message);
                }
            }
            MessageRole::Request => match &self.gateway {
                Some(gateway) if self.connectivity.is_online() => {
                    info!("Acting as gateway for message {}", message.id);
                    self.spawn_gateway(gateway.clone(), message.id, message.text);
                }
                _ => self.relay(message),
            },
        }
    }

    fn relay(&mut self, message: CompletedMessage) {
        let chunks = message.chunks.len();
        info!(
            "Relaying {:?} {} ({} chunks)",
            message.role, message.id, chunks
        );
        self.scheduler.enqueue(message.id, message.chunks);
        self.publish(MeshEvent::RelayScheduled {
            id: message.id,
            role: message.role,
            chunks,
        });
    }

    fn spawn_gateway(&self, gateway: Arc<GatewayRelay>, id: MessageId, text: String) {
        let done = self.gateway_tx.clone();
        let epoch = self.epoch;

        tokio::spawn(async move {
            let response = match tokio::spawn(async move { gateway.process(&text).await }).await {
                Ok(response) => response,
                Err(e) => {
                    error!("Gateway task for message {} aborted: {}", id, e);
                    GatewayResponse::failed(
                        FailureStage::GatewayProcessing,
                        format!("Gateway processing failed: {}", e),
                    )
                }
            };
            let _ = done.send(GatewayDone {
                id,
                epoch,
                response,
            });
        });
    }

    fn on_gateway_done(&mut self, done: GatewayDone) {
        if done.epoch != self.epoch {
            debug!("Dropping gateway result for message {} from before a clear", done.id);
            return;
        }

        let text = done.response.ack_text();
        let chunks = match codec::encode_with_id(&text, done.id, true) {
            Ok(chunks) => chunks,
            Err(e) => {
                error!("Failed to encode acknowledgement for message {}: {}", done.id, e);
                return;
            }
        };

        info!(
            "Queueing acknowledgement for message {} ({} chunks)",
            done.id,
            chunks.len()
        );
        self.store
            .insert_complete(done.id, MessageRole::Ack, chunks.clone(), text);
        self.scheduler.enqueue(done.id, chunks);
        self.publish(MeshEvent::GatewayResult {
            id: done.id,
            response: done.response,
        });
    }

    fn publish(&self, event: MeshEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }
}
