//! Safety under arbitrary delivery order, loss and an equivocating proposer.
//!
//! Producer 1 proposes round 0 of height 1 and is faulty: it signs two
//! different blocks, votes for both, and also claims a round it is not
//! eligible for. The honest producers see any interleaving of these messages
//! with their own, lose some of them and time out at arbitrary points. No two
//! honest producers may ever commit different blocks at the same height.

mod common;

use common::{app_trx, identity, seed, TestNode, test_config};
use grove_types::{Block, BlockId, GroupSeed, HbMsg, HbPayload, Identity};
use proptest::prelude::*;
use std::collections::VecDeque;

const BYZANTINE: usize = 1;
const NODES: usize = 4;

#[derive(Debug, Clone)]
enum Step {
    /// Deliver the in-flight message at this index (modulo the queue length).
    Deliver(usize),
    /// Drop the in-flight message at this index.
    Drop(usize),
    /// Fire the deadline of an honest node.
    Deadline(usize),
}

fn step_strategy() -> impl Strategy<Value = Step> {
    prop_oneof![
        6 => any::<usize>().prop_map(Step::Deliver),
        1 => any::<usize>().prop_map(Step::Drop),
        1 => (0..NODES).prop_map(Step::Deadline),
    ]
}

fn byzantine_messages(seed: &GroupSeed, split: &[bool]) -> Vec<(usize, HbMsg)> {
    let byz = identity(BYZANTINE);
    let group = seed.group_id().clone();
    let head = seed.genesis_block.id();
    let block = |nonce: &str| {
        Block::new(
            group.clone(),
            1,
            head,
            byz.node_id(),
            7,
            vec![app_trx(&group, nonce)],
        )
    };
    let sign = |round: u64, payload: HbPayload| {
        HbMsg::unsigned(group.clone(), byz.node_id(), 1, round, payload).signed(byz.as_ref())
    };

    let x = block("x");
    let y = block("y");
    let mut out = Vec::new();
    for to in (0..NODES).filter(|i| *i != BYZANTINE) {
        let chosen = if split[to] { &x } else { &y };
        out.push((
            to,
            sign(
                0,
                HbPayload::Propose {
                    block: chosen.clone(),
                    justify: vec![],
                },
            ),
        ));
        out.push((to, sign(0, HbPayload::Vote { block_id: x.id() })));
        out.push((to, sign(0, HbPayload::Vote { block_id: y.id() })));
        // not eligible for round 2 and carries no justification
        out.push((
            to,
            sign(
                2,
                HbPayload::Propose {
                    block: block("z"),
                    justify: vec![],
                },
            ),
        ));
    }
    out
}

fn committed_ids(nodes: &[TestNode], height: u64) -> Vec<BlockId> {
    nodes
        .iter()
        .enumerate()
        .filter(|(i, _)| *i != BYZANTINE)
        .filter_map(|(_, node)| node.block_id_at(height))
        .collect()
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(48))]

    /// Property: honest producers never commit conflicting blocks.
    #[test]
    fn prop_no_conflicting_commits(
        split in prop::collection::vec(any::<bool>(), NODES),
        steps in prop::collection::vec(step_strategy(), 50..400),
    ) {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .start_paused(true)
            .build()
            .unwrap();

        runtime.block_on(async {
            let seed = seed("safety", NODES);
            let group = seed.group_id().clone();
            let mut nodes: Vec<TestNode> = (0..NODES)
                .map(|i| TestNode::new(&seed, i, test_config()))
                .collect();

            for (i, node) in nodes.iter_mut().enumerate() {
                if i != BYZANTINE {
                    node.psyncer
                        .submit_trxs(vec![app_trx(&group, &format!("honest-{}", i))])
                        .unwrap();
                }
            }

            let mut in_flight: VecDeque<(usize, HbMsg)> =
                byzantine_messages(&seed, &split).into_iter().collect();

            for step in steps {
                for (from, node) in nodes.iter().enumerate() {
                    for msg in node.transport.take() {
                        if from == BYZANTINE {
                            continue;
                        }
                        for to in (0..NODES).filter(|to| *to != from && *to != BYZANTINE) {
                            in_flight.push_back((to, msg.clone()));
                        }
                    }
                }

                match step {
                    Step::Deliver(i) if !in_flight.is_empty() => {
                        let index = i % in_flight.len();
                        if let Some((to, msg)) = in_flight.remove(index) {
                            let _ = nodes[to].psyncer.handle_hb_msg(msg).await;
                        }
                    }
                    Step::Drop(i) if !in_flight.is_empty() => {
                        let index = i % in_flight.len();
                        in_flight.remove(index);
                    }
                    Step::Deadline(node) if node != BYZANTINE => {
                        let _ = nodes[node].psyncer.on_deadline().await;
                    }
                    _ => {}
                }
            }

            for height in 1..=3 {
                let ids = committed_ids(&nodes, height);
                if let Some(first) = ids.first() {
                    assert!(
                        ids.iter().all(|id| id == first),
                        "conflicting commits at height {}: {:?}",
                        height,
                        ids
                    );
                }
            }
        });
    }
}
