//! Addresses and requests

use crate::hashing::{hash_data, HashValue};
use borsh::{BorshDeserialize, BorshSerialize};
use serde::{Deserialize, Serialize};
use std::fmt;

/// A 32-byte ledger address
#[derive(
    Clone,
    Copy,
    Default,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    BorshSerialize,
    BorshDeserialize,
    Serialize,
    Deserialize,
)]
pub struct Address(pub [u8; 32]);

impl Address {
    /// Derive an address from an arbitrary seed (test committees, CLI)
    pub fn from_seed(seed: &str) -> Self {
        Address(hash_data(&[b"address", seed.as_bytes()]).0)
    }

    /// Parse a base58 address
    pub fn from_base58(s: &str) -> Option<Self> {
        let bytes = bs58::decode(s).into_vec().ok()?;
        let arr: [u8; 32] = bytes.try_into().ok()?;
        Some(Address(arr))
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&bs58::encode(self.0).into_string())
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = self.to_string();
        write!(f, "Address({})", &s[..s.len().min(8)])
    }
}

/// Request id: containing transaction id plus position of the request block in it
#[derive(
    Clone,
    Copy,
    Default,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    BorshSerialize,
    BorshDeserialize,
    Serialize,
    Deserialize,
)]
pub struct RequestId {
    pub tx_id: HashValue,
    pub index: u16,
}

impl RequestId {
    pub fn new(tx_id: HashValue, index: u16) -> Self {
        Self { tx_id, index }
    }

    pub fn to_bytes(&self) -> [u8; 34] {
        let mut out = [0u8; 34];
        out[..32].copy_from_slice(&self.tx_id.0);
        out[32..].copy_from_slice(&self.index.to_le_bytes());
        out
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[{}]", self.tx_id.short(), self.index)
    }
}

impl fmt::Debug for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RequestId({})", self)
    }
}

/// Request code. The top bit marks protected requests which must be
/// authorised by the contract owner.
#[derive(
    Clone,
    Copy,
    Default,
    PartialEq,
    Eq,
    Hash,
    BorshSerialize,
    BorshDeserialize,
    Serialize,
    Deserialize,
)]
pub struct RequestCode(pub u16);

impl RequestCode {
    const PROTECTED_FLAG: u16 = 0x8000;

    /// Does nothing besides taking the reward
    pub const NOP: RequestCode = RequestCode(0);
    /// Sets every argument as a state variable
    pub const SET_VARS: RequestCode = RequestCode(1);
    /// Deletes every argument key from the state
    pub const DEL_VARS: RequestCode = RequestCode(2);
    /// Stores 32 bytes of entropy under every argument key
    pub const RANDOM: RequestCode = RequestCode(3);

    pub fn protected(self) -> Self {
        RequestCode(self.0 | Self::PROTECTED_FLAG)
    }

    pub fn is_protected(&self) -> bool {
        self.0 & Self::PROTECTED_FLAG != 0
    }

    /// Code with the protection flag cleared
    pub fn base(&self) -> RequestCode {
        RequestCode(self.0 & !Self::PROTECTED_FLAG)
    }
}

impl fmt::Debug for RequestCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_protected() {
            write!(f, "RequestCode({}, protected)", self.base().0)
        } else {
            write!(f, "RequestCode({})", self.0)
        }
    }
}

/// A request to the smart contract, carried by a ledger transaction
#[derive(Debug, Clone, PartialEq, Eq, BorshSerialize, BorshDeserialize, Serialize, Deserialize)]
pub struct Request {
    pub id: RequestId,
    /// Address which signed the containing transaction
    pub sender: Address,
    pub code: RequestCode,
    /// Arguments, in the order given by the sender
    pub args: Vec<(String, Vec<u8>)>,
    /// Tokens sent to the contract together with the request
    pub deposit: u64,
    /// Unix seconds before which the request must not be processed
    pub timelock: u32,
}

impl Request {
    /// A request is ready once every input is known and its time lock expired
    pub fn is_ready(&self, now_unix_secs: i64) -> bool {
        i64::from(self.timelock) <= now_unix_secs
    }
}
