use super::{state::State, ChannelError};
use crate::{abiencode::types::Signature, sig::Signer};

/// A state together with one signature slot per participant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedState {
    state: State,
    sigs: Vec<Option<Signature>>,
}

impl SignedState {
    pub fn new(state: State) -> Self {
        let sigs = vec![None; state.participants.len()];
        Self { state, sigs }
    }

    pub fn state(&self) -> &State {
        &self.state
    }

    pub fn signatures(&self) -> &[Option<Signature>] {
        &self.sigs
    }

    pub fn signature(&self, index: usize) -> Option<Signature> {
        self.sigs.get(index).copied().flatten()
    }

    /// Sign with `signer`, which has to be one of the participants.
    pub fn sign(&mut self, signer: &Signer) -> Result<Signature, ChannelError> {
        let index = self
            .state
            .participants
            .iter()
            .position(|p| *p == signer.address())
            .ok_or(ChannelError::NotAParticipant(signer.address()))?;
        let sig = self.state.sign(signer)?;
        self.sigs[index] = Some(sig);
        Ok(sig)
    }

    /// Check that every present signature belongs to the participant of its
    /// slot.
    pub fn verify(&self) -> Result<(), ChannelError> {
        if self.sigs.len() != self.state.participants.len() {
            return Err(ChannelError::SignatureCount {
                expected: self.state.participants.len(),
                got: self.sigs.len(),
            });
        }
        for (index, sig) in self.sigs.iter().enumerate() {
            if let Some(sig) = sig {
                if self.state.recover_signer_index(*sig)? != index {
                    return Err(ChannelError::WrongSigner { index });
                }
            }
        }
        Ok(())
    }

    /// Copy the signatures of `other` into empty slots. Both must be over the
    /// same state.
    pub fn merge(&mut self, other: &SignedState) -> Result<(), ChannelError> {
        if self.state != other.state {
            return Err(ChannelError::StateMismatch);
        }
        for (mine, theirs) in self.sigs.iter_mut().zip(&other.sigs) {
            if mine.is_none() {
                *mine = *theirs;
            }
        }
        Ok(())
    }

    pub fn has_signature_for(&self, index: usize) -> bool {
        self.signature(index).is_some()
    }

    pub fn has_all_signatures(&self) -> bool {
        self.sigs.iter().all(Option::is_some)
    }

    /// Signatures in participant order, available only once complete.
    pub fn complete_signatures(&self) -> Option<Vec<Signature>> {
        self.sigs.iter().copied().collect()
    }

    pub fn into_parts(self) -> (State, Vec<Option<Signature>>) {
        (self.state, self.sigs)
    }

    pub(crate) fn from_parts(state: State, sigs: Vec<Option<Signature>>) -> Self {
        Self { state, sigs }
    }
}
