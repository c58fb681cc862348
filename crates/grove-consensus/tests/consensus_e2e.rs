//! End-to-end agreement across a hand-driven cluster.

mod common;

use common::{app_trx, Cluster};
use grove_consensus::{drop_reason, EngineState, HealthStatus};
use grove_storage::BlockStore;
use grove_types::{HbMsg, HbPayload, Identity, Phase};

#[tokio::test]
async fn test_payload_committed_once_at_height_ten() {
    let mut cluster = Cluster::new(4, 0);
    let group = cluster.group_id();

    for i in 1..=9 {
        cluster.commit_next(app_trx(&group, &format!("warmup-{}", i))).await;
    }
    for node in &mut cluster.nodes {
        assert_eq!(node.psyncer.height(), 10);
        node.drain_commits();
    }

    assert_eq!(cluster.proposer_index(10, 0), 2);
    let payload = app_trx(&group, "payload");
    let block_id = cluster.commit_next(payload.clone()).await;

    for node in &mut cluster.nodes {
        assert_eq!(node.store.get_highest_block(&group).unwrap(), Some((10, block_id)));
        let committed = node.store.get_block(&group, 10).unwrap().unwrap();
        assert_eq!(committed.block.header.producer, cluster.seed.group_item.producers.producers()[2].node_id);
        assert!(committed.block.trx_ids().any(|id| id == payload.id));
        assert!(committed.votes.len() >= 3);

        let events = node.drain_commits();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].height, 10);
        assert_eq!(events[0].trx_ids, vec![payload.id]);
        assert_eq!(node.psyncer.state(), EngineState::Idle);
        assert_eq!(node.psyncer.health(), HealthStatus::Healthy);
    }

    // the same payload is never applied a second time
    let proposer = cluster.proposer_index(11, 0);
    let receipt = cluster.nodes[proposer]
        .psyncer
        .submit_trxs(vec![payload.clone()])
        .unwrap();
    assert_eq!(receipt.committed, vec![payload.id]);
    cluster.commit_next(app_trx(&group, "next")).await;
    for node in &cluster.nodes {
        let block = node.store.get_block(&group, 11).unwrap().unwrap();
        assert!(!block.block.trx_ids().any(|id| id == payload.id));
    }
}

#[tokio::test]
async fn test_replayed_votes_are_counted_once() {
    let mut cluster = Cluster::new(4, 0);
    let group = cluster.group_id();
    let proposer = cluster.proposer_index(1, 0);

    cluster.nodes[proposer]
        .psyncer
        .submit_trxs(vec![app_trx(&group, "a")])
        .unwrap();
    cluster.nodes[proposer].psyncer.try_propose().await.unwrap();
    let sent = cluster.nodes[proposer].transport.take();
    let proposal = sent.iter().find(|m| m.phase() == Phase::Propose).unwrap().clone();
    let vote = sent.iter().find(|m| m.phase() == Phase::Vote).unwrap().clone();

    let target = (proposer + 1) % 4;
    let node = &mut cluster.nodes[target];
    node.psyncer.handle_hb_msg(proposal).await.unwrap();
    for _ in 0..3 {
        node.psyncer.handle_hb_msg(vote.clone()).await.unwrap();
    }

    // the proposer's vote and the node's own vote
    assert_eq!(node.psyncer.current_round().votes().len(), 2);
    assert_eq!(node.psyncer.height(), 1);
    assert_eq!(node.psyncer.state(), EngineState::Voting);
}

#[tokio::test]
async fn test_equivocating_vote_is_rejected() {
    let mut cluster = Cluster::new(4, 0);
    let group = cluster.group_id();
    let voter = cluster.nodes[3].identity.clone();

    let vote_for = |byte: u8| {
        HbMsg::unsigned(
            group.clone(),
            voter.node_id(),
            1,
            0,
            HbPayload::Vote {
                block_id: grove_types::BlockId::from_bytes([byte; 32]),
            },
        )
        .signed(voter.as_ref())
    };

    let node = &mut cluster.nodes[0];
    node.psyncer.handle_hb_msg(vote_for(1)).await.unwrap();
    assert!(node.psyncer.handle_hb_msg(vote_for(2)).await.is_err());
    assert_eq!(node.metrics.dropped_count(drop_reason::VALIDATION), 1);
    assert_eq!(node.psyncer.current_round().votes().len(), 1);
}

#[tokio::test]
async fn test_lagging_observer_catches_up_through_sync() {
    let mut cluster = Cluster::new(4, 1);
    let group = cluster.group_id();
    let observer = 4;
    assert!(!cluster.nodes[observer].psyncer.role().producer);
    assert!(cluster.nodes[observer].psyncer.role().user);

    cluster.muted.insert(observer);
    for i in 1..=3 {
        cluster.commit_next(app_trx(&group, &format!("missed-{}", i))).await;
    }
    assert_eq!(cluster.nodes[observer].psyncer.height(), 1);

    cluster.muted.clear();
    let last = cluster.commit_next(app_trx(&group, "seen")).await;
    cluster.run_until_quiet().await;

    let lagging = &cluster.nodes[observer];
    assert_eq!(lagging.psyncer.height(), 5);
    assert_eq!(lagging.store.get_highest_block(&group).unwrap(), Some((4, last)));
    for height in 1..=4 {
        assert_eq!(lagging.block_id_at(height), cluster.nodes[0].block_id_at(height));
    }
}

#[tokio::test]
async fn test_stale_commit_is_dropped() {
    let mut cluster = Cluster::new(4, 0);
    let group = cluster.group_id();
    cluster.commit_next(app_trx(&group, "a")).await;

    // every producer announced its commit; the announcements arrive late
    let before = cluster.nodes[0].metrics.dropped_count(drop_reason::STALE);
    let certificate = cluster.nodes[1].store.get_block(&group, 1).unwrap().unwrap();
    let announce = HbMsg::unsigned(
        group.clone(),
        cluster.nodes[1].identity.node_id(),
        1,
        certificate.round,
        HbPayload::Commit { certificate },
    )
    .signed(cluster.nodes[1].identity.as_ref());
    cluster.nodes[0].psyncer.handle_hb_msg(announce).await.unwrap();

    assert_eq!(cluster.nodes[0].metrics.dropped_count(drop_reason::STALE), before + 1);
    assert_eq!(cluster.nodes[0].psyncer.height(), 2);
}
