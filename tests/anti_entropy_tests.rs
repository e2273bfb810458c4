//! Session and epoch tests for a single scope registry
//!
//! A fake peer is attached through a raw channel: the test plays the remote
//! node by calling `deliver` with hand-built messages and reads what the
//! registry sends back.

use ream_pg::pg::{GroupSnapshot, Header, SessionState};
use ream_pg::*;
use bytes::Bytes;
use tokio::sync::mpsc;

const SCOPE: &str = "pg";

struct FakePeer {
    node: NodeId,
    outbound: mpsc::UnboundedReceiver<Bytes>,
}

impl FakePeer {
    fn attach(registry: &ScopeRegistry) -> Self {
        Self::attach_as(registry, NodeId::new())
    }

    /// Connect under a fixed node id, as a restarted node would
    fn attach_as(registry: &ScopeRegistry, node: NodeId) -> Self {
        let (tx, outbound) = mpsc::unbounded_channel();
        registry.node_up(node, PeerSender::new(node, tx)).unwrap();
        Self { node, outbound }
    }

    fn header(&self, epoch: Epoch) -> Header {
        Header::new(SCOPE, self.node, epoch)
    }

    fn member(&self, pid: u64) -> Member {
        Member::new(self.node, Pid::from_raw(pid))
    }

    fn reply(&self, epoch: Epoch, groups: &[(&str, Vec<Member>)]) -> PgMessage {
        let groups: GroupSnapshot = groups
            .iter()
            .map(|(group, members)| (group.to_string(), members.clone()))
            .collect();
        PgMessage::FullSyncReply { header: self.header(epoch), groups }
    }

    fn join(&self, epoch: Epoch, group: &str, member: Member) -> PgMessage {
        PgMessage::JoinDelta { header: self.header(epoch), group: group.to_string(), member }
    }

    fn leave(&self, epoch: Epoch, group: &str, member: Member) -> PgMessage {
        PgMessage::LeaveDelta { header: self.header(epoch), group: group.to_string(), member }
    }

    /// Everything the registry has sent so far
    fn drain(&mut self) -> Vec<PgMessage> {
        let mut messages = Vec::new();
        while let Ok(frame) = self.outbound.try_recv() {
            messages.push(PgMessage::decode(&frame).unwrap());
        }
        messages
    }
}

fn registry() -> (ProcessTable, ScopeRegistry) {
    let processes = ProcessTable::new(NodeId::new());
    let registry = ScopeRegistry::start(SCOPE, processes.clone(), 64);
    (processes, registry)
}

async fn synced_peer(registry: &ScopeRegistry, epoch: Epoch, groups: &[(&str, Vec<Member>)]) -> FakePeer {
    let mut peer = FakePeer::attach(registry);
    registry.deliver(peer.node, peer.reply(epoch, groups)).unwrap();
    registry.flush().await.unwrap();
    peer.drain();
    peer
}

#[cfg(test)]
mod session_open_tests {
    use super::*;

    #[tokio::test]
    async fn test_node_up_sends_local_state_then_request() {
        let (processes, registry) = registry();
        let a = processes.spawn();
        registry.join("g", a).await.unwrap();

        let mut peer = FakePeer::attach(&registry);
        registry.flush().await.unwrap();

        let sent = peer.drain();
        assert_eq!(sent.len(), 2);
        match &sent[0] {
            PgMessage::FullSyncReply { header, groups } => {
                assert_eq!(header.scope, SCOPE);
                assert_eq!(header.node, processes.node());
                assert_eq!(groups.get("g"), Some(&vec![a]));
            }
            other => panic!("expected full sync reply, got {:?}", other),
        }
        assert_eq!(sent[1].kind(), "FULL_SYNC_REQUEST");
        assert_eq!(sent[0].header().epoch, sent[1].header().epoch);
    }

    #[tokio::test]
    async fn test_full_sync_reply_installs_mirror_and_marks_synced() {
        let (_processes, registry) = registry();
        let peer = FakePeer::attach(&registry);
        let (x, y) = (peer.member(1), peer.member(2));

        registry.deliver(peer.node, peer.reply(7, &[("g", vec![x, y, y])])).unwrap();
        registry.flush().await.unwrap();

        assert_eq!(registry.get_members("g"), vec![x, y, y]);
        assert!(registry.get_local_members("g").is_empty());

        let peers = registry.peers().await.unwrap();
        assert_eq!(peers.len(), 1);
        assert_eq!(peers[0].node, peer.node);
        assert_eq!(peers[0].state, SessionState::Synced);
        assert_eq!(peers[0].remote_epoch, Some(7));
    }

    #[tokio::test]
    async fn test_reconnect_draws_a_higher_local_epoch() {
        let (_processes, registry) = registry();
        let mut first = FakePeer::attach(&registry);
        registry.flush().await.unwrap();
        let before = first.drain()[0].header().epoch;

        registry.node_down(first.node).unwrap();
        let (tx, mut outbound) = mpsc::unbounded_channel();
        registry.node_up(first.node, PeerSender::new(first.node, tx)).unwrap();
        registry.flush().await.unwrap();

        let frame = outbound.try_recv().unwrap();
        let after = PgMessage::decode(&frame).unwrap().header().epoch;
        assert!(after > before);
    }

    #[tokio::test]
    async fn test_messages_without_session_are_dropped() {
        let (_processes, registry) = registry();
        let stranger = NodeId::new();
        let member = Member::new(stranger, Pid::from_raw(1));

        let reply = PgMessage::FullSyncReply {
            header: Header::new(SCOPE, stranger, 1),
            groups: [("g".to_string(), vec![member])].into_iter().collect(),
        };
        registry.deliver(stranger, reply).unwrap();
        registry.flush().await.unwrap();

        assert!(registry.get_members("g").is_empty());
    }
}

#[cfg(test)]
mod epoch_tests {
    use super::*;

    /// Only deltas from the current epoch mutate the table
    #[tokio::test]
    async fn test_deltas_apply_only_in_current_epoch() {
        let (_processes, registry) = registry();
        let peer = synced_peer(&registry, 5, &[]).await;
        let x = peer.member(1);

        registry.deliver(peer.node, peer.join(4, "g", x)).unwrap();
        registry.deliver(peer.node, peer.join(6, "g", x)).unwrap();
        registry.flush().await.unwrap();
        assert!(registry.get_members("g").is_empty());

        registry.deliver(peer.node, peer.join(5, "g", x)).unwrap();
        registry.flush().await.unwrap();
        assert_eq!(registry.get_members("g"), vec![x]);

        registry.deliver(peer.node, peer.leave(4, "g", x)).unwrap();
        registry.flush().await.unwrap();
        assert_eq!(registry.get_members("g"), vec![x]);

        registry.deliver(peer.node, peer.leave(5, "g", x)).unwrap();
        registry.flush().await.unwrap();
        assert!(registry.get_members("g").is_empty());
    }

    #[tokio::test]
    async fn test_deltas_before_full_sync_are_dropped() {
        let (_processes, registry) = registry();
        let peer = FakePeer::attach(&registry);
        let x = peer.member(1);

        registry.deliver(peer.node, peer.join(1, "g", x)).unwrap();
        registry.flush().await.unwrap();

        assert!(registry.get_members("g").is_empty());
    }

    #[tokio::test]
    async fn test_node_down_purges_and_blocks_stragglers() {
        let (processes, registry) = registry();
        let local = processes.spawn();
        registry.join("g", local).await.unwrap();

        let peer = synced_peer(&registry, 5, &[]).await;
        let x = peer.member(1);
        registry.deliver(peer.node, peer.join(5, "g", x)).unwrap();
        registry.flush().await.unwrap();
        assert_eq!(registry.get_members("g").len(), 2);

        registry.node_down(peer.node).unwrap();
        registry.deliver(peer.node, peer.join(5, "g", x)).unwrap();
        registry.flush().await.unwrap();
        assert_eq!(registry.get_members("g"), vec![local]);

        // A new session must not accept a snapshot from the dead epoch
        let (tx, _outbound) = mpsc::unbounded_channel();
        registry.node_up(peer.node, PeerSender::new(peer.node, tx)).unwrap();
        registry.deliver(peer.node, peer.reply(5, &[("g", vec![x])])).unwrap();
        registry.flush().await.unwrap();
        assert_eq!(registry.get_members("g"), vec![local]);

        registry.deliver(peer.node, peer.reply(6, &[("g", vec![x])])).unwrap();
        registry.flush().await.unwrap();
        assert_eq!(registry.get_members("g").len(), 2);
    }

    #[tokio::test]
    async fn test_fresher_full_sync_replaces_mirror() {
        let (_processes, registry) = registry();
        let peer = synced_peer(&registry, 3, &[]).await;
        let (x, y, z) = (peer.member(1), peer.member(2), peer.member(3));
        registry.deliver(peer.node, peer.reply(3, &[("a", vec![x, y]), ("b", vec![z])])).unwrap();
        registry.flush().await.unwrap();
        assert_eq!(registry.get_members("a"), vec![x, y]);

        let mut events = registry.subscribe();
        registry.deliver(peer.node, peer.reply(4, &[("a", vec![y])])).unwrap();
        registry.flush().await.unwrap();

        assert_eq!(registry.get_members("a"), vec![y]);
        assert!(registry.get_members("b").is_empty());
        assert_eq!(registry.which_groups(), vec!["a".to_string()]);

        let mut left = Vec::new();
        while let Ok(event) = events.try_recv() {
            if let MembershipEvent::Left { group, members } = event {
                left.push((group, members));
            }
        }
        left.sort();
        assert_eq!(left, vec![("a".to_string(), vec![x]), ("b".to_string(), vec![z])]);

        // Going back to an older epoch is refused
        registry.deliver(peer.node, peer.reply(3, &[])).unwrap();
        registry.flush().await.unwrap();
        assert_eq!(registry.get_members("a"), vec![y]);
    }

    #[tokio::test]
    async fn test_foreign_members_are_ignored() {
        let (processes, registry) = registry();
        let peer = synced_peer(&registry, 2, &[]).await;
        let other = Member::new(NodeId::new(), Pid::from_raw(9));
        let ours = processes.spawn();

        registry.deliver(peer.node, peer.join(2, "g", other)).unwrap();
        registry.deliver(peer.node, peer.reply(2, &[("g", vec![other, ours, peer.member(1)])])).unwrap();
        registry.flush().await.unwrap();

        assert_eq!(registry.get_members("g"), vec![peer.member(1)]);
    }

    #[tokio::test]
    async fn test_misrouted_messages_are_dropped() {
        let (_processes, registry) = registry();
        let peer = synced_peer(&registry, 1, &[]).await;
        let x = peer.member(1);

        let wrong_scope = PgMessage::JoinDelta {
            header: Header::new("other", peer.node, 1),
            group: "g".to_string(),
            member: x,
        };
        registry.deliver(peer.node, wrong_scope).unwrap();
        registry.deliver(NodeId::new(), peer.join(1, "g", x)).unwrap();
        registry.flush().await.unwrap();

        assert!(registry.get_members("g").is_empty());
    }
}

#[cfg(test)]
mod resync_tests {
    use super::*;

    #[tokio::test]
    async fn test_sync_request_is_answered_with_local_state() {
        let (processes, registry) = registry();
        let a = processes.spawn();
        let b = processes.spawn();
        let mut peer = synced_peer(&registry, 4, &[]).await;
        registry.join("g", a).await.unwrap();
        registry.join("h", b).await.unwrap();
        peer.drain();

        registry
            .deliver(peer.node, PgMessage::FullSyncRequest { header: peer.header(4) })
            .unwrap();
        registry.flush().await.unwrap();

        let sent = peer.drain();
        assert_eq!(sent.len(), 1);
        match &sent[0] {
            PgMessage::FullSyncReply { groups, .. } => {
                assert_eq!(groups.get("g"), Some(&vec![a]));
                assert_eq!(groups.get("h"), Some(&vec![b]));
            }
            other => panic!("expected full sync reply, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_reply_only_carries_local_members() {
        let (processes, registry) = registry();
        let a = processes.spawn();
        registry.join("g", a).await.unwrap();
        let first = synced_peer(&registry, 1, &[]).await;
        registry.deliver(first.node, first.join(1, "g", first.member(1))).unwrap();

        let mut second = FakePeer::attach(&registry);
        registry.flush().await.unwrap();

        match &second.drain()[0] {
            PgMessage::FullSyncReply { groups, .. } => assert_eq!(groups.get("g"), Some(&vec![a])),
            other => panic!("expected full sync reply, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_resync_sends_request() {
        let (_processes, registry) = registry();
        let mut peer = synced_peer(&registry, 1, &[]).await;

        registry.resync(peer.node).await.unwrap();
        registry.flush().await.unwrap();

        let sent = peer.drain();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].kind(), "FULL_SYNC_REQUEST");
    }

    #[tokio::test]
    async fn test_resync_errors() {
        let (_processes, registry) = registry();
        let unknown = NodeId::new();
        assert_eq!(registry.resync(unknown).await, Err(PgError::NodeNotConnected(unknown)));

        let peer = FakePeer::attach(&registry);
        let node = peer.node;
        drop(peer);
        assert_eq!(registry.resync(node).await, Err(PgError::ChannelClosed(node)));
    }

    #[tokio::test]
    async fn test_duplicate_node_up_resets_session() {
        let (_processes, registry) = registry();
        let peer = synced_peer(&registry, 3, &[]).await;
        registry.deliver(peer.node, peer.join(3, "g", peer.member(1))).unwrap();
        registry.flush().await.unwrap();
        assert_eq!(registry.get_members("g").len(), 1);

        let (tx, _outbound) = mpsc::unbounded_channel();
        registry.node_up(peer.node, PeerSender::new(peer.node, tx)).unwrap();
        registry.flush().await.unwrap();

        assert!(registry.get_members("g").is_empty());
        let peers = registry.peers().await.unwrap();
        assert_eq!(peers.len(), 1);
        assert_eq!(peers[0].state, SessionState::Connecting);
    }
}

#[cfg(test)]
mod restart_tests {
    use super::*;
    use std::time::Duration;

    /// A node restarted under the same id draws epochs from a fresh clock
    /// and must still be accepted after its old session went down
    #[tokio::test]
    async fn test_restarted_peer_with_fresh_clock_is_accepted() {
        let (_processes, registry) = registry();
        let node = NodeId::from_bytes([9; 16]);

        let before_restart = EpochClock::new();
        let peer = FakePeer::attach_as(&registry, node);
        let old = peer.member(1);
        registry.deliver(node, peer.reply(before_restart.next(), &[("g", vec![old])])).unwrap();
        registry.flush().await.unwrap();
        assert_eq!(registry.get_members("g"), vec![old]);

        registry.node_down(node).unwrap();
        std::thread::sleep(Duration::from_millis(2));

        let restarted = EpochClock::new();
        let peer = FakePeer::attach_as(&registry, node);
        let new = peer.member(2);
        registry.deliver(node, peer.reply(restarted.next(), &[("g", vec![new])])).unwrap();
        registry.flush().await.unwrap();

        assert_eq!(registry.get_members("g"), vec![new]);
    }

    #[tokio::test]
    async fn test_max_epoch_does_not_stop_registry() {
        let (processes, registry) = registry();
        let peer = synced_peer(&registry, u64::MAX, &[]).await;
        registry.deliver(peer.node, peer.join(u64::MAX, "g", peer.member(1))).unwrap();

        registry.node_down(peer.node).unwrap();
        registry.flush().await.unwrap();
        assert!(registry.get_members("g").is_empty());

        let local = processes.spawn();
        registry.join("g", local).await.unwrap();
        assert_eq!(registry.get_members("g"), vec![local]);
    }

    #[tokio::test]
    async fn test_rejected_epoch_does_not_raise_floor() {
        let (_processes, registry) = registry();
        let peer = synced_peer(&registry, 5, &[]).await;
        registry.deliver(peer.node, peer.join(u64::MAX, "g", peer.member(1))).unwrap();
        registry.node_down(peer.node).unwrap();

        let peer = FakePeer::attach_as(&registry, peer.node);
        let x = peer.member(2);
        registry.deliver(peer.node, peer.reply(6, &[("g", vec![x])])).unwrap();
        registry.flush().await.unwrap();

        assert_eq!(registry.get_members("g"), vec![x]);
    }
}

#[cfg(test)]
mod shutdown_tests {
    use super::*;

    #[tokio::test]
    async fn test_shutdown_sends_empty_snapshot_to_peers() {
        let (processes, registry) = registry();
        let a = processes.spawn();
        registry.join("g", a).await.unwrap();

        let mut peer = FakePeer::attach(&registry);
        registry.flush().await.unwrap();
        let session_epoch = peer.drain()[0].header().epoch;

        registry.shutdown().await.unwrap();

        let sent = peer.drain();
        assert_eq!(sent.len(), 1);
        match &sent[0] {
            PgMessage::FullSyncReply { header, groups } => {
                assert_eq!(header.epoch, session_epoch);
                assert!(groups.is_empty());
            }
            other => panic!("expected full sync reply, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_empty_snapshot_clears_mirror() {
        let (_processes, registry) = registry();
        let peer = synced_peer(&registry, 8, &[("g", vec![])]).await;
        registry.deliver(peer.node, peer.join(8, "g", peer.member(1))).unwrap();
        registry.flush().await.unwrap();
        assert_eq!(registry.get_members("g").len(), 1);

        registry.deliver(peer.node, peer.reply(8, &[])).unwrap();
        registry.flush().await.unwrap();

        assert!(registry.get_members("g").is_empty());
    }
}
