//! Deterministic execution of a batch of requests
//!
//! Every honest committee member runs the same `VmTask` and must arrive at a
//! byte-identical result transaction essence. Nothing in here may read the
//! clock, the environment or any other non-deterministic input.

use crate::batch::{batch_hash, Batch, Mutation, StateUpdate};
use crate::error::StateError;
use crate::hashing::{hash_data, HashValue};
use crate::state::VirtualState;
use crate::transaction::{Output, StateBlock, StateTransaction, TransactionId, TxEssence};
use crate::types::{Address, Request, RequestCode, RequestId};
use std::sync::Arc;

/// Immutable snapshot of everything needed to compute one batch
#[derive(Debug, Clone)]
pub struct VmTask {
    pub leader_index: u16,
    /// Program the committee was configured with. Passed through for an
    /// external executor: the built-in request codes don't depend on it and it
    /// is not part of the result essence.
    pub program_hash: HashValue,
    pub address: Address,
    /// Derived from the current anchoring transaction id
    pub entropy: HashValue,
    /// Tokens currently held by the contract address
    pub balance: u64,
    pub owner_address: Address,
    pub reward_address: Option<Address>,
    pub minimum_reward: u64,
    pub requests: Vec<Request>,
    pub timestamp: i64,
    pub virtual_state: Arc<VirtualState>,
    /// Round id the task was dispatched for
    pub batch_hash: HashValue,
}

impl VmTask {
    pub fn state_index(&self) -> u32 {
        self.virtual_state.state_index()
    }

    pub fn request_ids(&self) -> Vec<RequestId> {
        self.requests.iter().map(|r| r.id).collect()
    }
}

/// Output of a finished task
#[derive(Debug, Clone)]
pub struct VmResult {
    pub task: VmTask,
    /// Batch for `task.state_index() + 1`, not yet tagged with a transaction id
    pub batch: Batch,
    /// Unsigned anchoring transaction
    pub result_tx: StateTransaction,
}

impl VmResult {
    /// Batch hash recomputed from what was actually executed
    pub fn computed_batch_hash(&self) -> HashValue {
        batch_hash(&self.task.request_ids(), self.task.timestamp, self.task.leader_index)
    }
}

/// Run all requests of the task and build the resulting transaction
pub fn run_task(task: &VmTask) -> Result<VmResult, StateError> {
    let mut balance = task.balance;
    let mut rewards: Vec<Output> = Vec::new();
    let mut updates = Vec::with_capacity(task.requests.len());

    for req in &task.requests {
        if !req.is_ready(task.timestamp / 1_000_000_000) {
            return Err(StateError::RequestNotReady(req.id.to_string()));
        }
        balance = balance
            .checked_add(req.deposit)
            .ok_or(StateError::ArithmeticOverflow)?;

        let mut su = StateUpdate::new(req.id, task.timestamp);
        let (proceed, paid) = handle_rewards(task, req);
        if paid > 0 {
            if let Some(reward_address) = task.reward_address {
                balance = balance.checked_sub(paid).ok_or(StateError::ArithmeticOverflow)?;
                add_reward(&mut rewards, reward_address, paid)?;
            }
        }
        if proceed {
            su.mutations = run_request(task, req);
        }
        updates.push(su);
    }

    let batch = Batch::new(updates)?.with_state_index(task.state_index() + 1);
    let next_state = task.virtual_state.apply_batch(&batch)?;

    let result_tx = StateTransaction::new(TxEssence {
        address: task.address,
        balance,
        rewards,
        state: StateBlock {
            state_index: next_state.state_index(),
            state_hash: next_state.hash(),
            timestamp: task.timestamp,
            request_ids: task.request_ids(),
        },
    });

    Ok(VmResult {
        task: task.clone(),
        batch,
        result_tx,
    })
}

/// Returns whether to continue processing the request and how much reward it pays
fn handle_rewards(task: &VmTask, req: &Request) -> (bool, u64) {
    if task.reward_address.is_none() || task.minimum_reward == 0 {
        return (true, 0);
    }
    if req.sender == task.address {
        // no rewards from itself
        return (true, 0);
    }
    if req.deposit >= task.minimum_reward {
        (true, task.minimum_reward)
    } else {
        // not enough for the reward: whole deposit is taken, state untouched
        tracing::debug!(
            request = %req.id,
            deposit = req.deposit,
            minimum_reward = task.minimum_reward,
            "Reward not covered, request is NOP"
        );
        (false, req.deposit)
    }
}

fn add_reward(rewards: &mut Vec<Output>, address: Address, amount: u64) -> Result<(), StateError> {
    match rewards.iter_mut().find(|o| o.address == address) {
        Some(out) => {
            out.amount = out
                .amount
                .checked_add(amount)
                .ok_or(StateError::ArithmeticOverflow)?;
        }
        None => rewards.push(Output { address, amount }),
    }
    Ok(())
}

/// Built-in processor
fn run_request(task: &VmTask, req: &Request) -> Vec<Mutation> {
    if req.code.is_protected() && req.sender != task.owner_address {
        tracing::warn!(
            request = %req.id,
            code = ?req.code,
            owner = %task.owner_address,
            "Protected request is not authorised"
        );
        return Vec::new();
    }
    match req.code.base() {
        RequestCode::NOP => Vec::new(),
        RequestCode::SET_VARS => req
            .args
            .iter()
            .map(|(key, value)| Mutation::Set {
                key: key.clone(),
                value: value.clone(),
            })
            .collect(),
        RequestCode::DEL_VARS => req
            .args
            .iter()
            .map(|(key, _)| Mutation::Del { key: key.clone() })
            .collect(),
        RequestCode::RANDOM => req
            .args
            .iter()
            .map(|(key, _)| Mutation::Set {
                key: key.clone(),
                value: hash_data(&[task.entropy.as_bytes(), &req.id.to_bytes(), key.as_bytes()])
                    .0
                    .to_vec(),
            })
            .collect(),
        other => {
            tracing::warn!(request = %req.id, code = ?other, "No entry point for request code");
            Vec::new()
        }
    }
}

/// Entropy for the round following the given anchoring transaction
pub fn entropy_from(state_tx_id: &TransactionId) -> HashValue {
    *state_tx_id
}
