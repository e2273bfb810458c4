//! Scope registry
//!
//! One registry per scope name per node. All mutations (local joins and
//! leaves, monitor callbacks, inbound peer messages, node up/down) are commands
//! on a single queue, applied one at a time by a dedicated task. Reads are
//! served from an immutable [`MembershipView`] published after every change,
//! so readers never wait on the queue.

use std::collections::HashMap;

use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tracing::{debug, info, warn};

use crate::cluster::PeerSender;
use crate::error::{PgError, PgResult};
use crate::pg::protocol::{Header, PgMessage};
use crate::pg::session::{EpochBook, PeerInfo, PeerSession};
use crate::pg::table::{GroupSnapshot, MembershipTable, MembershipView, TableDiff};
use crate::runtime::{MonitorRef, ProcessTable};
use crate::types::{Epoch, ExitReason, GroupName, Member, NodeId, Pid, ScopeName};

/// Membership change notification
#[derive(Debug, Clone, PartialEq)]
pub enum MembershipEvent {
    /// Occurrences added to `group`
    Joined { group: GroupName, members: Vec<Member> },
    /// Occurrences removed from `group`
    Left { group: GroupName, members: Vec<Member> },
}

impl MembershipEvent {
    pub fn group(&self) -> &str {
        match self {
            MembershipEvent::Joined { group, .. } | MembershipEvent::Left { group, .. } => group,
        }
    }
}

type Reply<T> = oneshot::Sender<PgResult<T>>;

enum Command {
    Join { group: GroupName, members: Vec<Member>, reply: Reply<()> },
    Leave { group: GroupName, members: Vec<Member>, reply: Reply<()> },
    LocalExit { pid: Pid, reason: ExitReason },
    NodeUp { node: NodeId, sender: PeerSender },
    NodeDown { node: NodeId },
    Inbound { node: NodeId, message: PgMessage },
    Resync { node: NodeId, reply: Reply<()> },
    Peers { reply: oneshot::Sender<Vec<PeerInfo>> },
    Flush { reply: oneshot::Sender<()> },
    Shutdown { reply: oneshot::Sender<()> },
}

/// Handle to a running scope registry
#[derive(Debug, Clone)]
pub struct ScopeRegistry {
    name: ScopeName,
    node: NodeId,
    commands: mpsc::UnboundedSender<Command>,
    view: watch::Receiver<MembershipView>,
    events: broadcast::Sender<MembershipEvent>,
}

impl ScopeRegistry {
    /// Start a registry for `name` on the node owning `processes`
    pub fn start(name: impl Into<ScopeName>, processes: ProcessTable, event_buffer: usize) -> Self {
        let name = name.into();
        let node = processes.node();
        let (commands, queue) = mpsc::unbounded_channel();
        let (view_tx, view) = watch::channel(MembershipView::default());
        let (events, _) = broadcast::channel(event_buffer.max(1));

        let actor = ScopeActor {
            name: name.clone(),
            node,
            processes,
            table: MembershipTable::new(),
            sessions: HashMap::new(),
            epochs: HashMap::new(),
            local: HashMap::new(),
            view_tx,
            events: events.clone(),
            self_tx: commands.downgrade(),
        };
        tokio::spawn(actor.run(queue));
        info!(scope = %name, node = %node.short(), "scope registry started");

        Self { name, node, commands, view, events }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn node(&self) -> NodeId {
        self.node
    }

    fn submit(&self, command: Command) -> PgResult<()> {
        self.commands
            .send(command)
            .map_err(|_| PgError::RegistryStopped(self.name.clone()))
    }

    async fn call<T>(&self, make: impl FnOnce(Reply<T>) -> Command) -> PgResult<T> {
        let (reply, response) = oneshot::channel();
        self.submit(make(reply))?;
        response
            .await
            .map_err(|_| PgError::RegistryStopped(self.name.clone()))?
    }

    /// Add one occurrence of a live local process to `group`
    pub async fn join(&self, group: &str, member: Member) -> PgResult<()> {
        self.join_many(group, vec![member]).await
    }

    /// Join several processes at once; nothing is applied unless all are valid
    pub async fn join_many(&self, group: &str, members: Vec<Member>) -> PgResult<()> {
        let group = group.to_string();
        self.call(|reply| Command::Join { group, members, reply }).await
    }

    /// Remove one occurrence of `member` from `group`
    pub async fn leave(&self, group: &str, member: Member) -> PgResult<()> {
        self.leave_many(group, vec![member]).await
    }

    /// Leave with several processes at once; nothing is applied unless every
    /// occurrence exists
    pub async fn leave_many(&self, group: &str, members: Vec<Member>) -> PgResult<()> {
        let group = group.to_string();
        self.call(|reply| Command::Leave { group, members, reply }).await
    }

    /// Point-in-time copy of `group`: local and mirrored occurrences
    pub fn get_members(&self, group: &str) -> Vec<Member> {
        self.view.borrow().members(group)
    }

    /// Occurrences in `group` owned by this node
    pub fn get_local_members(&self, group: &str) -> Vec<Member> {
        self.view.borrow().members_on(group, self.node)
    }

    /// Names of all non-empty groups
    pub fn which_groups(&self) -> Vec<GroupName> {
        self.view.borrow().groups()
    }

    /// Current immutable view of the whole scope
    pub fn view(&self) -> MembershipView {
        self.view.borrow().clone()
    }

    /// Receiver that is notified every time the view changes
    pub fn watch(&self) -> watch::Receiver<MembershipView> {
        self.view.clone()
    }

    /// Stream of join/leave events
    pub fn subscribe(&self) -> broadcast::Receiver<MembershipEvent> {
        self.events.subscribe()
    }

    /// A node connected; a session is opened and full state exchanged
    pub fn node_up(&self, node: NodeId, sender: PeerSender) -> PgResult<()> {
        self.submit(Command::NodeUp { node, sender })
    }

    /// A node disconnected; everything it owned is purged
    pub fn node_down(&self, node: NodeId) -> PgResult<()> {
        self.submit(Command::NodeDown { node })
    }

    /// Hand over a message received from `node`
    pub fn deliver(&self, node: NodeId, message: PgMessage) -> PgResult<()> {
        self.submit(Command::Inbound { node, message })
    }

    /// Ask `node` to send its full state again
    pub async fn resync(&self, node: NodeId) -> PgResult<()> {
        self.call(|reply| Command::Resync { node, reply }).await
    }

    /// Sessions with remote nodes
    pub async fn peers(&self) -> PgResult<Vec<PeerInfo>> {
        let (reply, response) = oneshot::channel();
        self.submit(Command::Peers { reply })?;
        response.await.map_err(|_| PgError::RegistryStopped(self.name.clone()))
    }

    /// Wait until every command queued before this call has been applied
    pub async fn flush(&self) -> PgResult<()> {
        let (reply, response) = oneshot::channel();
        self.submit(Command::Flush { reply })?;
        response.await.map_err(|_| PgError::RegistryStopped(self.name.clone()))
    }

    /// Stop the registry, releasing every monitor it holds
    pub async fn shutdown(&self) -> PgResult<()> {
        let (reply, response) = oneshot::channel();
        self.submit(Command::Shutdown { reply })?;
        response.await.map_err(|_| PgError::RegistryStopped(self.name.clone()))
    }

    pub fn is_stopped(&self) -> bool {
        self.commands.is_closed()
    }
}

/// Registrations of one local process
#[derive(Debug)]
struct LocalEntry {
    monitor: MonitorRef,
    groups: HashMap<GroupName, usize>,
}

struct ScopeActor {
    name: ScopeName,
    node: NodeId,
    processes: ProcessTable,
    table: MembershipTable,
    sessions: HashMap<NodeId, PeerSession>,
    epochs: HashMap<NodeId, EpochBook>,
    local: HashMap<Pid, LocalEntry>,
    view_tx: watch::Sender<MembershipView>,
    events: broadcast::Sender<MembershipEvent>,
    self_tx: mpsc::WeakUnboundedSender<Command>,
}

impl ScopeActor {
    async fn run(mut self, mut queue: mpsc::UnboundedReceiver<Command>) {
        while let Some(command) = queue.recv().await {
            match command {
                Command::Join { group, members, reply } => {
                    let _ = reply.send(self.join(group, members));
                }
                Command::Leave { group, members, reply } => {
                    let _ = reply.send(self.leave(group, members));
                }
                Command::LocalExit { pid, reason } => self.local_exit(pid, reason),
                Command::NodeUp { node, sender } => self.node_up(node, sender),
                Command::NodeDown { node } => self.node_down(node),
                Command::Inbound { node, message } => self.inbound(node, message),
                Command::Resync { node, reply } => {
                    let _ = reply.send(self.resync(node));
                }
                Command::Peers { reply } => {
                    let _ = reply.send(self.sessions.values().map(PeerSession::info).collect());
                }
                Command::Flush { reply } => {
                    let _ = reply.send(());
                }
                Command::Shutdown { reply } => {
                    self.withdraw();
                    self.release_monitors();
                    let _ = reply.send(());
                    break;
                }
            }
        }
        self.withdraw();
        self.release_monitors();
        info!(scope = %self.name, "scope registry stopped");
    }

    /// Tell every peer this scope no longer holds any members: an empty full
    /// sync in the session's epoch replaces everything they mirror for us.
    fn withdraw(&mut self) {
        for (node, mut session) in self.sessions.drain() {
            let header = Header::new(self.name.clone(), self.node, session.local_epoch());
            session.send(&PgMessage::FullSyncReply { header, groups: GroupSnapshot::new() });
            let info = session.retire();
            debug!(scope = %self.name, peer = %node.short(), sent = info.frames_sent, "session withdrawn");
        }
    }

    fn release_monitors(&mut self) {
        for (_, entry) in self.local.drain() {
            self.processes.demonitor(entry.monitor);
        }
    }

    fn header(&self, epoch: Epoch) -> Header {
        Header::new(self.name.clone(), self.node, epoch)
    }

    fn publish(&self) {
        self.view_tx.send_replace(self.table.view());
    }

    fn emit(&self, event: MembershipEvent) {
        let _ = self.events.send(event);
    }

    fn emit_diff(&self, diff: TableDiff) {
        for (group, members) in diff.left {
            self.emit(MembershipEvent::Left { group, members });
        }
        for (group, members) in diff.joined {
            self.emit(MembershipEvent::Joined { group, members });
        }
    }

    /// Send a delta to every live session, each stamped with its own epoch
    fn broadcast(&mut self, make: impl Fn(Header) -> PgMessage) {
        let name = self.name.clone();
        let node = self.node;
        for session in self.sessions.values_mut() {
            let message = make(Header::new(name.clone(), node, session.local_epoch()));
            session.send(&message);
        }
    }

    fn join(&mut self, group: GroupName, members: Vec<Member>) -> PgResult<()> {
        if members.is_empty() {
            return Ok(());
        }

        // Validate everything and install missing monitors before touching
        // the table, so a failed batch leaves no trace.
        let mut installed: Vec<(Pid, MonitorRef)> = Vec::new();
        for member in &members {
            let needs_monitor = !self.local.contains_key(&member.pid)
                && !installed.iter().any(|(pid, _)| *pid == member.pid);
            let valid = member.is_local_to(self.node)
                && self.processes.is_alive(member.pid)
                && (!needs_monitor || match self.install_monitor(member.pid) {
                    Some(monitor) => {
                        installed.push((member.pid, monitor));
                        true
                    }
                    None => false,
                });
            if !valid {
                for (_, monitor) in installed {
                    self.processes.demonitor(monitor);
                }
                return Err(PgError::InvalidMember(*member));
            }
        }
        for (pid, monitor) in installed {
            self.local.insert(pid, LocalEntry { monitor, groups: HashMap::new() });
        }

        for member in &members {
            if let Some(entry) = self.local.get_mut(&member.pid) {
                *entry.groups.entry(group.clone()).or_insert(0) += 1;
            }
            self.table.add(&group, *member);
            let g = group.clone();
            let m = *member;
            self.broadcast(|header| PgMessage::JoinDelta { header, group: g.clone(), member: m });
        }

        debug!(scope = %self.name, group = %group, count = members.len(), "local join");
        self.publish();
        self.emit(MembershipEvent::Joined { group, members });
        Ok(())
    }

    fn install_monitor(&self, pid: Pid) -> Option<MonitorRef> {
        let weak = self.self_tx.clone();
        self.processes.monitor(
            pid,
            Box::new(move |pid, reason| {
                if let Some(tx) = weak.upgrade() {
                    let _ = tx.send(Command::LocalExit { pid, reason });
                }
            }),
        )
    }

    fn leave(&mut self, group: GroupName, members: Vec<Member>) -> PgResult<()> {
        let mut wanted: HashMap<Member, usize> = HashMap::new();
        for member in &members {
            *wanted.entry(*member).or_insert(0) += 1;
        }
        for (member, count) in &wanted {
            let held = if member.is_local_to(self.node) {
                self.local
                    .get(&member.pid)
                    .and_then(|entry| entry.groups.get(&group).copied())
                    .unwrap_or(0)
            } else {
                0
            };
            if held < *count {
                return Err(PgError::NotMember { group, member: *member });
            }
        }

        for member in &members {
            self.table.remove(&group, member);
            self.forget_occurrence(member.pid, &group);
            let g = group.clone();
            let m = *member;
            self.broadcast(|header| PgMessage::LeaveDelta { header, group: g.clone(), member: m });
        }

        debug!(scope = %self.name, group = %group, count = members.len(), "local leave");
        self.publish();
        self.emit(MembershipEvent::Left { group, members });
        Ok(())
    }

    /// Drop one occurrence from the local index, releasing the monitor when
    /// the process no longer belongs to any group
    fn forget_occurrence(&mut self, pid: Pid, group: &str) {
        let Some(entry) = self.local.get_mut(&pid) else {
            return;
        };
        if let Some(count) = entry.groups.get_mut(group) {
            *count -= 1;
            if *count == 0 {
                entry.groups.remove(group);
            }
        }
        if entry.groups.is_empty() {
            if let Some(entry) = self.local.remove(&pid) {
                self.processes.demonitor(entry.monitor);
            }
        }
    }

    fn local_exit(&mut self, pid: Pid, reason: ExitReason) {
        let Some(entry) = self.local.remove(&pid) else {
            return;
        };
        let member = Member::new(self.node, pid);
        info!(scope = %self.name, member = %member, reason = %reason, groups = entry.groups.len(), "member exited, leaving its groups");

        let mut groups: Vec<(GroupName, usize)> = entry.groups.into_iter().collect();
        groups.sort();
        for (group, count) in &groups {
            for _ in 0..*count {
                self.table.remove(group, &member);
                let g = group.clone();
                self.broadcast(|header| PgMessage::LeaveDelta { header, group: g.clone(), member });
            }
        }
        self.publish();
        for (group, count) in groups {
            self.emit(MembershipEvent::Left { group, members: vec![member; count] });
        }
    }

    fn node_up(&mut self, node: NodeId, sender: PeerSender) {
        if node == self.node {
            return;
        }
        if self.sessions.contains_key(&node) {
            warn!(scope = %self.name, peer = %node.short(), "node-up for a live session, resetting it");
            self.node_down(node);
        }

        let epoch = self.processes.epoch_clock().next();
        let mut session = PeerSession::open(node, epoch, sender);
        let groups = self.table.owned_by(self.node);
        session.send(&PgMessage::FullSyncReply { header: self.header(epoch), groups });
        session.send(&PgMessage::FullSyncRequest { header: self.header(epoch) });
        self.sessions.insert(node, session);
        debug!(scope = %self.name, peer = %node.short(), epoch, "session opened");
    }

    fn node_down(&mut self, node: NodeId) {
        if let Some(session) = self.sessions.remove(&node) {
            let info = session.retire();
            debug!(scope = %self.name, peer = %node.short(), sent = info.frames_sent, received = info.frames_received, "session retired");
        }
        self.epochs.entry(node).or_default().retire();

        let removed = self.table.purge_by_owner(node);
        if removed.is_empty() {
            return;
        }
        info!(scope = %self.name, peer = %node.short(), groups = removed.len(), "purged members of down node");
        self.publish();
        for (group, members) in removed {
            self.emit(MembershipEvent::Left { group, members });
        }
    }

    fn inbound(&mut self, node: NodeId, message: PgMessage) {
        let header = message.header().clone();
        if header.node != node || header.scope != self.name {
            warn!(scope = %self.name, peer = %node.short(), kind = message.kind(), "misrouted message dropped");
            return;
        }
        let Some(session) = self.sessions.get_mut(&node) else {
            debug!(scope = %self.name, peer = %node.short(), kind = message.kind(), "message without session dropped");
            return;
        };
        session.observe();
        let local_epoch = session.local_epoch();
        let book = self.epochs.entry(node).or_default();

        match message {
            PgMessage::FullSyncReply { groups, .. } => {
                if !book.accepts_sync(header.epoch) {
                    debug!(scope = %self.name, peer = %node.short(), epoch = header.epoch, floor = book.floor(), "stale full sync dropped");
                    return;
                }
                book.advance(header.epoch);
                session.mark_synced(header.epoch);
                self.apply_snapshot(node, groups);
            }
            PgMessage::FullSyncRequest { .. } => {
                if !book.accepts_sync(header.epoch) {
                    debug!(scope = %self.name, peer = %node.short(), epoch = header.epoch, "stale sync request dropped");
                    return;
                }
                let groups = self.table.owned_by(self.node);
                let reply = PgMessage::FullSyncReply { header: self.header(local_epoch), groups };
                if let Some(session) = self.sessions.get_mut(&node) {
                    session.send(&reply);
                }
            }
            PgMessage::JoinDelta { group, member, .. } | PgMessage::LeaveDelta { group, member, .. }
                if !book.accepts_delta(header.epoch) || member.node != node =>
            {
                debug!(scope = %self.name, peer = %node.short(), group = %group, epoch = header.epoch, current = ?book.current(), "stale or foreign delta dropped");
            }
            PgMessage::JoinDelta { group, member, .. } => {
                self.table.add(&group, member);
                self.publish();
                self.emit(MembershipEvent::Joined { group, members: vec![member] });
            }
            PgMessage::LeaveDelta { group, member, .. } => {
                if !self.table.remove(&group, &member) {
                    warn!(scope = %self.name, peer = %node.short(), group = %group, member = %member, "leave delta for unknown occurrence");
                    return;
                }
                self.publish();
                self.emit(MembershipEvent::Left { group, members: vec![member] });
            }
        }
    }

    fn apply_snapshot(&mut self, node: NodeId, mut groups: GroupSnapshot) {
        for (group, members) in groups.iter_mut() {
            let before = members.len();
            members.retain(|member| member.node == node);
            if members.len() != before {
                warn!(scope = %self.name, peer = %node.short(), group = %group, "foreign members in full sync ignored");
            }
        }
        groups.retain(|_, members| !members.is_empty());

        let diff = self.table.replace_owner(node, &groups);
        debug!(scope = %self.name, peer = %node.short(), groups = groups.len(), "full sync applied");
        if diff.is_empty() {
            return;
        }
        self.publish();
        self.emit_diff(diff);
    }

    fn resync(&mut self, node: NodeId) -> PgResult<()> {
        let (name, own) = (self.name.clone(), self.node);
        let session = self
            .sessions
            .get_mut(&node)
            .ok_or(PgError::NodeNotConnected(node))?;
        let header = Header::new(name, own, session.local_epoch());
        if session.send(&PgMessage::FullSyncRequest { header }) {
            Ok(())
        } else {
            Err(PgError::ChannelClosed(node))
        }
    }
}
