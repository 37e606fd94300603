//! Protobuf messages exchanged between peers.
//!
//! Fixed size values (addresses, hashes, signatures) travel as raw bytes,
//! `U256` values as 32 byte big-endian integers.

#[derive(Clone, PartialEq, prost::Message)]
pub struct Message {
    #[prost(bytes = "vec", tag = "1")]
    pub to: Vec<u8>,
    #[prost(bytes = "vec", tag = "2")]
    pub from: Vec<u8>,
    #[prost(message, repeated, tag = "3")]
    pub objective_payloads: Vec<ObjectivePayload>,
    #[prost(message, repeated, tag = "4")]
    pub ledger_payloads: Vec<LedgerPayload>,
    #[prost(message, repeated, tag = "5")]
    pub payments: Vec<Voucher>,
    #[prost(string, repeated, tag = "6")]
    pub rejected_objectives: Vec<String>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct ObjectivePayload {
    #[prost(string, tag = "1")]
    pub objective_id: String,
    #[prost(message, optional, tag = "2")]
    pub state: Option<SignedState>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct SignedState {
    #[prost(message, optional, tag = "1")]
    pub state: Option<State>,
    /// One entry per participant, empty where the signature is missing.
    #[prost(bytes = "vec", repeated, tag = "2")]
    pub signatures: Vec<Vec<u8>>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct State {
    #[prost(bytes = "vec", tag = "1")]
    pub chain_id: Vec<u8>,
    #[prost(bytes = "vec", repeated, tag = "2")]
    pub participants: Vec<Vec<u8>>,
    #[prost(uint64, tag = "3")]
    pub channel_nonce: u64,
    #[prost(bytes = "vec", tag = "4")]
    pub app_definition: Vec<u8>,
    #[prost(uint32, tag = "5")]
    pub challenge_duration: u32,
    #[prost(bytes = "vec", tag = "6")]
    pub app_data: Vec<u8>,
    #[prost(message, repeated, tag = "7")]
    pub outcome: Vec<SingleAssetExit>,
    #[prost(uint64, tag = "8")]
    pub turn_num: u64,
    #[prost(bool, tag = "9")]
    pub is_final: bool,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct SingleAssetExit {
    #[prost(bytes = "vec", tag = "1")]
    pub asset: Vec<u8>,
    #[prost(bytes = "vec", tag = "2")]
    pub metadata: Vec<u8>,
    #[prost(message, repeated, tag = "3")]
    pub allocations: Vec<Allocation>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct Allocation {
    #[prost(bytes = "vec", tag = "1")]
    pub destination: Vec<u8>,
    #[prost(bytes = "vec", tag = "2")]
    pub amount: Vec<u8>,
    #[prost(uint32, tag = "3")]
    pub allocation_type: u32,
    #[prost(bytes = "vec", tag = "4")]
    pub metadata: Vec<u8>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct LedgerPayload {
    #[prost(string, tag = "1")]
    pub objective_id: String,
    #[prost(bytes = "vec", tag = "2")]
    pub ledger_id: Vec<u8>,
    #[prost(oneof = "ledger_payload::Update", tags = "3, 4")]
    pub update: Option<ledger_payload::Update>,
}

pub mod ledger_payload {
    #[derive(Clone, PartialEq, prost::Oneof)]
    pub enum Update {
        #[prost(message, tag = "3")]
        Proposed(super::SignedProposal),
        #[prost(message, tag = "4")]
        Countersigned(super::Countersigned),
    }
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct SignedProposal {
    #[prost(bytes = "vec", tag = "1")]
    pub ledger_id: Vec<u8>,
    #[prost(uint64, tag = "2")]
    pub turn_num: u64,
    #[prost(bytes = "vec", tag = "3")]
    pub signature: Vec<u8>,
    #[prost(oneof = "signed_proposal::Proposal", tags = "4, 5")]
    pub proposal: Option<signed_proposal::Proposal>,
}

pub mod signed_proposal {
    #[derive(Clone, PartialEq, prost::Oneof)]
    pub enum Proposal {
        #[prost(message, tag = "4")]
        Add(super::Add),
        #[prost(message, tag = "5")]
        Remove(super::Remove),
    }
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct Guarantee {
    #[prost(bytes = "vec", tag = "1")]
    pub amount: Vec<u8>,
    #[prost(bytes = "vec", tag = "2")]
    pub target: Vec<u8>,
    #[prost(bytes = "vec", tag = "3")]
    pub left: Vec<u8>,
    #[prost(bytes = "vec", tag = "4")]
    pub right: Vec<u8>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct Add {
    #[prost(message, optional, tag = "1")]
    pub guarantee: Option<Guarantee>,
    #[prost(bytes = "vec", tag = "2")]
    pub left_deposit: Vec<u8>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct Remove {
    #[prost(bytes = "vec", tag = "1")]
    pub target: Vec<u8>,
    #[prost(bytes = "vec", tag = "2")]
    pub left_amount: Vec<u8>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct Countersigned {
    #[prost(uint64, tag = "1")]
    pub turn_num: u64,
    #[prost(bytes = "vec", tag = "2")]
    pub signature: Vec<u8>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct Voucher {
    #[prost(bytes = "vec", tag = "1")]
    pub channel_id: Vec<u8>,
    #[prost(bytes = "vec", tag = "2")]
    pub amount: Vec<u8>,
    #[prost(bytes = "vec", tag = "3")]
    pub signature: Vec<u8>,
}
