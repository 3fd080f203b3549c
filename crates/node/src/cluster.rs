//! Local committee runner
//!
//! Starts every alive member as its own `Node` task, wired together by a
//! `LocalNetwork` and one `InMemoryLedger`, anchors the origin, submits the
//! configured requests and waits until every alive member holds the latest
//! anchored state.

use crate::config::NodeConfig;
use anyhow::{bail, Context, Result};
use sc_consensus::messages::event_channel;
use sc_consensus::{
    ConsensusError, LocalNetwork, MultisigSigner, Node, NodeEvent, Operator, StateManager,
};
use sc_ledger::InMemoryLedger;
use sc_state::{
    hash_data, Address, BatchStore, BlockingRunner, HashValue, MemoryBatchStore, PersistentStore,
    Request, RequestCode, RequestId, StateTransaction, TaskRunner, VirtualState,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Final view of one member
#[derive(Debug, Clone)]
pub struct MemberReport {
    pub index: u16,
    pub alive: bool,
    pub state_index: Option<u32>,
    pub state_hash: Option<HashValue>,
}

#[derive(Debug, Clone)]
pub struct ClusterReport {
    /// Latest anchored state index on the ledger
    pub anchored_index: Option<u32>,
    pub members: Vec<MemberReport>,
}

impl ClusterReport {
    /// Every alive member holds the same, latest anchored state
    pub fn converged(&self) -> bool {
        let mut alive = self.members.iter().filter(|m| m.alive);
        let Some(first) = alive.next() else {
            return false;
        };
        first.state_index.is_some()
            && first.state_index == self.anchored_index
            && alive.all(|m| m.state_index == first.state_index && m.state_hash == first.state_hash)
    }
}

struct Member {
    index: u16,
    solid_state: watch::Receiver<Option<Arc<VirtualState>>>,
    handle: JoinHandle<Result<(), ConsensusError>>,
}

fn make_request(n: u32) -> Request {
    Request {
        id: RequestId::new(hash_data(&[b"sc-node request", &n.to_le_bytes()]), 0),
        sender: Address::from_seed("sc-node client"),
        code: RequestCode::SET_VARS,
        args: vec![(format!("request-{}", n), n.to_le_bytes().to_vec())],
        deposit: 0,
        timelock: 0,
    }
}

fn open_store(config: &NodeConfig, index: u16) -> Result<Arc<dyn BatchStore>> {
    match &config.data_dir {
        Some(dir) => {
            let path = dir.join(format!("peer-{}", index));
            let store = PersistentStore::open(&path)
                .with_context(|| format!("opening store of peer #{}", index))?;
            Ok(Arc::new(store))
        }
        None => Ok(Arc::new(MemoryBatchStore::new())),
    }
}

/// Run the committee until it converges or the timeout expires
pub async fn run_cluster(config: &NodeConfig) -> Result<ClusterReport> {
    config.validate()?;
    if let Some(dir) = &config.data_dir {
        // the ledger is not persisted, old member state could never be anchored again
        if dir.join("peer-0").exists() {
            bail!("data directory {:?} already holds member stores", dir);
        }
        std::fs::create_dir_all(dir)?;
    }

    let consensus = config.consensus_config();
    let size = config.committee_size;
    let (senders, receivers): (Vec<_>, Vec<_>) = (0..size).map(|_| event_channel()).unzip();
    let network = LocalNetwork::new(senders.clone(), config.quorum);
    for &dead in &config.dead_peers {
        network.set_alive(dead, false);
    }

    let signers = MultisigSigner::generate_committee(
        config.committee_seed.as_bytes(),
        size,
        config.quorum,
    )?;
    let verifier = MultisigSigner::verifier(signers[0].public_keys(), config.quorum)?;
    let ledger = InMemoryLedger::new(consensus.address, Arc::new(verifier));
    let runner: Arc<dyn TaskRunner> = Arc::new(BlockingRunner::new(config.max_tasks)?);

    tracing::info!(
        committee_size = size,
        quorum = config.quorum,
        dead_peers = ?config.dead_peers,
        address = %consensus.address,
        "Starting local committee"
    );

    let mut members = Vec::new();
    for (i, events) in receivers.into_iter().enumerate() {
        let index = i as u16;
        if config.is_dead(index) {
            continue;
        }
        let committee = Arc::new(network.member(index));
        let connection = Arc::new(ledger.connect(senders[i].clone()));
        let operator = Operator::new(
            committee.clone(),
            Arc::new(signers[i].clone()),
            runner.clone(),
            connection.clone(),
            senders[i].clone(),
            consensus.clone(),
        )?;
        let state_mgr = StateManager::new(
            committee,
            open_store(config, index)?,
            connection,
            senders[i].clone(),
            consensus.clone(),
        )?;
        let node = Node::new(index, size, operator, state_mgr, consensus.clone());
        let solid_state = node.subscribe();
        members.push(Member {
            index,
            solid_state,
            handle: tokio::spawn(node.run(events)),
        });
    }

    let origin = StateTransaction::origin(
        consensus.address,
        config.origin_balance,
        chrono::Utc::now().timestamp_nanos_opt().unwrap_or_default(),
    );
    ledger.post_origin(origin)?;
    for n in 0..config.requests {
        ledger.post_request(make_request(n))?;
    }

    let waited = tokio::time::timeout(
        Duration::from_secs(config.timeout_secs),
        wait_for_convergence(&ledger, &members, consensus.timer_tick_period),
    )
    .await;
    if waited.is_err() {
        tracing::warn!(timeout_secs = config.timeout_secs, "Committee did not converge in time");
    }

    let report = build_report(config, &ledger, &members);
    for (i, sender) in senders.iter().enumerate() {
        if sender.send(NodeEvent::Shutdown).is_err() {
            tracing::debug!(peer = i, "Node queue already closed");
        }
    }
    for member in members {
        member
            .handle
            .await
            .with_context(|| format!("node #{} panicked", member.index))?
            .with_context(|| format!("node #{} failed", member.index))?;
    }
    Ok(report)
}

async fn wait_for_convergence(ledger: &InMemoryLedger, members: &[Member], poll: Duration) {
    let mut timer = tokio::time::interval(poll);
    loop {
        timer.tick().await;
        if members.iter().any(|m| m.handle.is_finished()) {
            tracing::error!("A node stopped before the committee converged");
            return;
        }
        if ledger.pending_requests() > 0 {
            continue;
        }
        let anchored = ledger.state_index();
        let done = members.iter().all(|m| {
            m.solid_state.borrow().as_ref().map(|s| s.state_index()) == anchored
        });
        if done {
            return;
        }
    }
}

fn build_report(config: &NodeConfig, ledger: &InMemoryLedger, members: &[Member]) -> ClusterReport {
    let members = (0..config.committee_size)
        .map(|index| {
            let state = members
                .iter()
                .find(|m| m.index == index)
                .and_then(|m| m.solid_state.borrow().clone());
            MemberReport {
                index,
                alive: !config.is_dead(index),
                state_index: state.as_ref().map(|s| s.state_index()),
                state_hash: state.as_ref().map(|s| s.hash()),
            }
        })
        .collect();
    ClusterReport {
        anchored_index: ledger.state_index(),
        members,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fast_config() -> NodeConfig {
        NodeConfig {
            requests: 6,
            max_batch_size: 4,
            leader_rotation_ms: 200,
            sync_retry_ms: 50,
            timer_tick_ms: 10,
            timeout_secs: 30,
            ..NodeConfig::default()
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_committee_converges() {
        let report = run_cluster(&fast_config()).await.unwrap();
        assert!(report.converged(), "{:?}", report);
        assert!(report.anchored_index.unwrap() >= 2);
        assert!(report.members.iter().all(|m| m.alive));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_dead_peer_is_tolerated_with_sled_stores() {
        let dir = tempfile::tempdir().unwrap();
        let config = NodeConfig {
            dead_peers: vec![2],
            data_dir: Some(dir.path().join("data")),
            ..fast_config()
        };
        let report = run_cluster(&config).await.unwrap();
        assert!(report.converged(), "{:?}", report);
        let dead = &report.members[2];
        assert!(!dead.alive);
        assert_eq!(dead.state_index, None);

        // the same directory can't be reused with a fresh ledger
        assert!(run_cluster(&config).await.is_err());
    }

    #[test]
    fn test_report_convergence() {
        let member = |index, state_index, hash: u8| MemberReport {
            index,
            alive: true,
            state_index,
            state_hash: state_index.map(|_| HashValue([hash; 32])),
        };
        let report = ClusterReport {
            anchored_index: Some(3),
            members: vec![member(0, Some(3), 1), member(1, Some(3), 1)],
        };
        assert!(report.converged());

        let lagging = ClusterReport {
            anchored_index: Some(3),
            members: vec![member(0, Some(3), 1), member(1, Some(2), 1)],
        };
        assert!(!lagging.converged());

        let diverged = ClusterReport {
            anchored_index: Some(3),
            members: vec![member(0, Some(3), 1), member(1, Some(3), 2)],
        };
        assert!(!diverged.converged());
    }
}
