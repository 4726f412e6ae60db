//! Async node runtime
//!
//! Each node runs as one tokio task owning its [`LsmNode`]. The task
//! multiplexes inbound frames from the network and commands from its
//! [`NodeHandle`]; completions are handed back through oneshot channels and
//! the status is published on a watch channel.

use super::transport::{InMemoryNetwork, Transport};
use super::{LsmNode, LsmStage, LsmStatus, NodeEvent};
use crate::error::LsmError;
use crate::models::PartyId;
use crate::protocol::{
    DetectEvent, Envelope, ExecuteEvent, ExecutionOutcome, ScanId, SettlementPlan, Step,
};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, error, info, warn};

type Ack = oneshot::Sender<Result<(), LsmError>>;

enum NodeCommand {
    StartDetect {
        done: oneshot::Sender<DetectEvent>,
        ack: Ack,
    },
    Execute {
        plan: SettlementPlan,
        done: oneshot::Sender<ExecutionOutcome>,
        ack: Ack,
    },
    BroadcastDeadlock {
        scan_id: ScanId,
        reason: String,
        ack: Ack,
    },
    SetStage(LsmStage),
    Shutdown,
}

/// Handle on a running node task
#[derive(Clone)]
pub struct NodeHandle {
    party: PartyId,
    commands: mpsc::UnboundedSender<NodeCommand>,
    status: watch::Receiver<LsmStatus>,
}

impl NodeHandle {
    pub fn party(&self) -> &PartyId {
        &self.party
    }

    pub fn status(&self) -> LsmStatus {
        self.status.borrow().clone()
    }

    /// Start a detection round; the receiver resolves when it completes or
    /// loses to another round
    pub async fn start_detect(&self) -> Result<oneshot::Receiver<DetectEvent>, LsmError> {
        let (done, rx) = oneshot::channel();
        let (ack, ack_rx) = oneshot::channel();
        self.send(NodeCommand::StartDetect { done, ack })?;
        self.acked(ack_rx).await?;
        Ok(rx)
    }

    /// Execute a plan; the receiver resolves with the reported outcome
    pub async fn execute(&self, plan: SettlementPlan) -> Result<oneshot::Receiver<ExecutionOutcome>, LsmError> {
        let (done, rx) = oneshot::channel();
        let (ack, ack_rx) = oneshot::channel();
        self.send(NodeCommand::Execute { plan, done, ack })?;
        self.acked(ack_rx).await?;
        Ok(rx)
    }

    pub async fn broadcast_deadlock(&self, scan_id: ScanId, reason: String) -> Result<(), LsmError> {
        let (ack, ack_rx) = oneshot::channel();
        self.send(NodeCommand::BroadcastDeadlock { scan_id, reason, ack })?;
        self.acked(ack_rx).await
    }

    pub fn set_stage(&self, stage: LsmStage) -> Result<(), LsmError> {
        self.send(NodeCommand::SetStage(stage))
    }

    pub fn shutdown(&self) {
        let _ = self.commands.send(NodeCommand::Shutdown);
    }

    fn send(&self, command: NodeCommand) -> Result<(), LsmError> {
        self.commands.send(command).map_err(|_| self.stopped())
    }

    async fn acked(&self, ack: oneshot::Receiver<Result<(), LsmError>>) -> Result<(), LsmError> {
        ack.await.map_err(|_| self.stopped())?
    }

    fn stopped(&self) -> LsmError {
        LsmError::NodeStopped {
            party: self.party.to_string(),
        }
    }
}

/// Register `node` on `network` and run it on the current tokio runtime
pub fn spawn(node: LsmNode, network: &InMemoryNetwork) -> Result<NodeHandle, LsmError> {
    let party = node.party().clone();
    let inbox = network.register(&party)?;
    let (commands_tx, commands) = mpsc::unbounded_channel();
    let (status_tx, status) = watch::channel(node.status().clone());

    let runtime = NodeRuntime {
        node,
        inbox,
        commands,
        transport: Arc::new(network.clone()),
        status: status_tx,
        detect_waiter: None,
        execute_waiters: BTreeMap::new(),
    };
    tokio::spawn(runtime.run());

    Ok(NodeHandle {
        party,
        commands: commands_tx,
        status,
    })
}

struct NodeRuntime {
    node: LsmNode,
    inbox: mpsc::UnboundedReceiver<Vec<u8>>,
    commands: mpsc::UnboundedReceiver<NodeCommand>,
    transport: Arc<dyn Transport>,
    status: watch::Sender<LsmStatus>,

    detect_waiter: Option<oneshot::Sender<DetectEvent>>,
    execute_waiters: BTreeMap<ScanId, oneshot::Sender<ExecutionOutcome>>,
}

impl NodeRuntime {
    async fn run(mut self) {
        info!(party = %self.node.party(), "node started");
        loop {
            tokio::select! {
                Some(frame) = self.inbox.recv() => self.on_frame(&frame),
                command = self.commands.recv() => match command {
                    Some(NodeCommand::Shutdown) | None => break,
                    Some(command) => self.on_command(command),
                },
            }
        }
        info!(party = %self.node.party(), "node stopped");
    }

    fn on_frame(&mut self, frame: &[u8]) {
        let envelope = match Envelope::decode(frame) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!(party = %self.node.party(), error = %e, "discarding undecodable frame");
                return;
            }
        };
        match self.node.handle(envelope) {
            Ok(step) => self.apply(step),
            Err(e) => error!(party = %self.node.party(), error = %e, "failed to handle message"),
        }
    }

    fn on_command(&mut self, command: NodeCommand) {
        match command {
            NodeCommand::StartDetect { done, ack } => {
                self.detect_waiter = Some(done);
                let result = self.node.start_detect().map(|step| self.apply(step));
                if result.is_err() {
                    self.detect_waiter = None;
                }
                let _ = ack.send(result);
            }
            NodeCommand::Execute { plan, done, ack } => {
                self.execute_waiters.insert(plan.scan_id.clone(), done);
                let scan_id = plan.scan_id.clone();
                let result = self.node.execute(plan).map(|step| self.apply(step));
                if result.is_err() {
                    self.execute_waiters.remove(&scan_id);
                }
                let _ = ack.send(result);
            }
            NodeCommand::BroadcastDeadlock { scan_id, reason, ack } => {
                let result = self
                    .node
                    .broadcast_deadlock(scan_id, reason)
                    .map(|step| self.apply(step));
                let _ = ack.send(result);
            }
            NodeCommand::SetStage(stage) => {
                self.node.set_stage(stage);
                self.publish();
            }
            NodeCommand::Shutdown => {}
        }
    }

    /// Send outbound envelopes, resolve waiters, publish status
    fn apply(&mut self, step: Step<NodeEvent>) {
        for envelope in &step.outbound {
            if let Err(e) = self.transport.send(envelope) {
                error!(party = %self.node.party(), to = %envelope.to, error = %e, "send failed");
            }
        }
        for event in step.events {
            match event {
                NodeEvent::Detect(event) => match self.detect_waiter.take() {
                    Some(waiter) => {
                        let _ = waiter.send(event);
                    }
                    None => debug!(?event, "detect event with no waiter"),
                },
                NodeEvent::Execute(ExecuteEvent::Finished { scan_id, outcome }) => {
                    match self.execute_waiters.remove(&scan_id) {
                        Some(waiter) => {
                            let _ = waiter.send(outcome);
                        }
                        None => debug!(scan = %scan_id, "execution outcome with no waiter"),
                    }
                }
            }
        }
        self.publish();
    }

    fn publish(&self) {
        self.status.send_replace(self.node.status().clone());
    }
}
