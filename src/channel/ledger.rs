use core::ops::{Deref, DerefMut};

use super::{Channel, ChannelError, State};

/// A [Channel] with exactly two participants, funded directly on-chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TwoPartyLedger(Channel);

impl TwoPartyLedger {
    pub fn new(pre_fund: State, my_index: usize) -> Result<Self, ChannelError> {
        Self::try_from(Channel::new(pre_fund, my_index)?)
    }

    pub fn into_channel(self) -> Channel {
        self.0
    }
}

impl TryFrom<Channel> for TwoPartyLedger {
    type Error = ChannelError;

    fn try_from(channel: Channel) -> Result<Self, Self::Error> {
        match channel.participants().len() {
            2 => Ok(Self(channel)),
            n => Err(ChannelError::NotTwoParty(n)),
        }
    }
}

impl Deref for TwoPartyLedger {
    type Target = Channel;

    fn deref(&self) -> &Channel {
        &self.0
    }
}

impl DerefMut for TwoPartyLedger {
    fn deref_mut(&mut self) -> &mut Channel {
        &mut self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::state::tests::{signers, test_state};

    #[test]
    fn exactly_two_participants() {
        let signers = signers(3);
        assert!(TwoPartyLedger::new(test_state(&signers[..2], &[1, 1]), 0).is_ok());
        assert!(matches!(
            TwoPartyLedger::new(test_state(&signers, &[1, 1, 1]), 0),
            Err(ChannelError::NotTwoParty(3))
        ));
    }
}
