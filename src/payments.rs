//! Vouchers: cumulative payments inside a virtual payment channel.
//!
//! A voucher states the total amount the payer has sent so far, signed by
//! the payer. Only the largest voucher of a channel matters, so vouchers can
//! be lost, repeated or reordered without harm.

use std::collections::BTreeMap;

use serde::Serialize;
use thiserror::Error;

use crate::{
    abiencode::{
        self,
        types::{Address, Hash, Signature, U256},
    },
    sig::{self, Signer},
};

#[derive(Debug, Error)]
pub enum PaymentError {
    #[error("channel {0} is not registered")]
    UnknownChannel(Hash),
    #[error("channel {0} is already registered")]
    AlreadyRegistered(Hash),
    #[error("only the payer of {0} can create vouchers")]
    NotThePayer(Hash),
    #[error("voucher amount must be positive")]
    ZeroAmount,
    #[error("{requested} exceeds the channel balance of {available}")]
    InsufficientFunds { requested: U256, available: U256 },
    #[error("voucher is not signed by the payer {0}")]
    WrongSigner(Address),
    #[error(transparent)]
    Signature(#[from] sig::Error),
    #[error(transparent)]
    Encoding(#[from] abiencode::Error),
}

#[derive(Serialize)]
struct VoucherPayload {
    channel_id: Hash,
    amount: U256,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Voucher {
    pub channel_id: Hash,
    /// Cumulative amount paid.
    pub amount: U256,
    pub signature: Signature,
}

impl Voucher {
    /// `keccak256(abi.encode(channelId, amount))`
    pub fn hash(channel_id: Hash, amount: U256) -> Result<Hash, abiencode::Error> {
        abiencode::to_args_hash(&VoucherPayload { channel_id, amount })
    }

    pub fn signed(channel_id: Hash, amount: U256, signer: &Signer) -> Result<Self, PaymentError> {
        Ok(Self {
            channel_id,
            amount,
            signature: signer.sign_eth(Self::hash(channel_id, amount)?),
        })
    }

    pub fn recover_signer(&self) -> Result<Address, PaymentError> {
        let hash = Self::hash(self.channel_id, self.amount)?;
        Ok(sig::recover_signer(hash, self.signature)?)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VoucherInfo {
    pub channel_payer: Address,
    pub channel_payee: Address,
    pub starting_balance: U256,
    pub largest_voucher: Option<Voucher>,
}

impl VoucherInfo {
    pub fn paid(&self) -> U256 {
        self.largest_voucher
            .map_or(U256::zero(), |v| v.amount)
    }

    pub fn remaining(&self) -> U256 {
        self.starting_balance - self.paid()
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Balance {
    pub paid: U256,
    pub remaining: U256,
}

/// Tracks vouchers for every payment channel I pay from or into.
#[derive(Debug, Clone)]
pub struct VoucherManager {
    me: Address,
    vouchers: BTreeMap<Hash, VoucherInfo>,
}

impl VoucherManager {
    pub fn new(me: Address) -> Self {
        Self {
            me,
            vouchers: BTreeMap::new(),
        }
    }

    pub fn register(
        &mut self,
        channel_id: Hash,
        payer: Address,
        payee: Address,
        starting_balance: U256,
    ) -> Result<(), PaymentError> {
        if self.vouchers.contains_key(&channel_id) {
            return Err(PaymentError::AlreadyRegistered(channel_id));
        }
        self.vouchers.insert(
            channel_id,
            VoucherInfo {
                channel_payer: payer,
                channel_payee: payee,
                starting_balance,
                largest_voucher: None,
            },
        );
        Ok(())
    }

    pub fn remove(&mut self, channel_id: &Hash) -> Option<VoucherInfo> {
        self.vouchers.remove(channel_id)
    }

    pub fn channel_registered(&self, channel_id: &Hash) -> bool {
        self.vouchers.contains_key(channel_id)
    }

    pub fn info(&self, channel_id: &Hash) -> Option<&VoucherInfo> {
        self.vouchers.get(channel_id)
    }

    /// Restore tracking from a stored [VoucherInfo].
    pub fn restore(&mut self, channel_id: Hash, info: VoucherInfo) {
        self.vouchers.insert(channel_id, info);
    }

    fn info_mut(&mut self, channel_id: &Hash) -> Result<&mut VoucherInfo, PaymentError> {
        self.vouchers
            .get_mut(channel_id)
            .ok_or(PaymentError::UnknownChannel(*channel_id))
    }

    /// Pay `amount` more. The returned voucher carries the new total.
    pub fn create_voucher(
        &mut self,
        channel_id: Hash,
        amount: U256,
        signer: &Signer,
    ) -> Result<Voucher, PaymentError> {
        let me = self.me;
        let info = self.info_mut(&channel_id)?;
        if info.channel_payer != me {
            return Err(PaymentError::NotThePayer(channel_id));
        }
        if amount.is_zero() {
            return Err(PaymentError::ZeroAmount);
        }
        let available = info.remaining();
        if amount > available {
            return Err(PaymentError::InsufficientFunds {
                requested: amount,
                available,
            });
        }

        let voucher = Voucher::signed(channel_id, info.paid() + amount, signer)?;
        info.largest_voucher = Some(voucher);
        Ok(voucher)
    }

    /// Accept a voucher and return how much it adds to what was paid before.
    /// Vouchers that do not raise the total are ignored.
    pub fn receive_voucher(&mut self, voucher: Voucher) -> Result<U256, PaymentError> {
        let signer = voucher.recover_signer()?;
        let info = self.info_mut(&voucher.channel_id)?;
        if signer != info.channel_payer {
            return Err(PaymentError::WrongSigner(info.channel_payer));
        }
        if voucher.amount > info.starting_balance {
            return Err(PaymentError::InsufficientFunds {
                requested: voucher.amount,
                available: info.starting_balance,
            });
        }

        let paid = info.paid();
        if voucher.amount <= paid {
            return Ok(U256::zero());
        }
        info.largest_voucher = Some(voucher);
        Ok(voucher.amount - paid)
    }

    pub fn balance(&self, channel_id: &Hash) -> Result<Balance, PaymentError> {
        let info = self
            .vouchers
            .get(channel_id)
            .ok_or(PaymentError::UnknownChannel(*channel_id))?;
        Ok(Balance {
            paid: info.paid(),
            remaining: info.remaining(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{rngs::StdRng, SeedableRng};

    const CHANNEL: Hash = Hash([7; 32]);

    fn parties() -> (Signer, Signer) {
        (
            Signer::new(&mut StdRng::seed_from_u64(10)),
            Signer::new(&mut StdRng::seed_from_u64(11)),
        )
    }

    fn managers(payer: &Signer, payee: &Signer, balance: u64) -> (VoucherManager, VoucherManager) {
        let mut a = VoucherManager::new(payer.address());
        let mut b = VoucherManager::new(payee.address());
        for m in [&mut a, &mut b] {
            m.register(CHANNEL, payer.address(), payee.address(), balance.into())
                .unwrap();
        }
        (a, b)
    }

    #[test]
    fn amounts_are_cumulative() {
        let (payer, payee) = parties();
        let (mut a, mut b) = managers(&payer, &payee, 10);
        let v1 = a.create_voucher(CHANNEL, 3.into(), &payer).unwrap();
        let v2 = a.create_voucher(CHANNEL, 4.into(), &payer).unwrap();
        assert_eq!(v2.amount, U256::from(7));

        assert_eq!(b.receive_voucher(v2).unwrap(), U256::from(7));
        // An older voucher arriving late changes nothing.
        assert_eq!(b.receive_voucher(v1).unwrap(), U256::zero());

        let balance = b.balance(&CHANNEL).unwrap();
        assert_eq!(balance.paid, U256::from(7));
        assert_eq!(balance.remaining, U256::from(3));
        assert_eq!(a.balance(&CHANNEL).unwrap(), balance);
    }

    #[test]
    fn monotonic_high_water_mark() {
        let (payer, payee) = parties();
        let (_, mut b) = managers(&payer, &payee, 100);
        let deltas: Vec<u64> = [10u64, 25, 20, 40]
            .into_iter()
            .map(|amount| {
                let v = Voucher::signed(CHANNEL, amount.into(), &payer).unwrap();
                b.receive_voucher(v).unwrap().as_u64()
            })
            .collect();
        assert_eq!(deltas, vec![10, 15, 0, 15]);
        assert_eq!(b.balance(&CHANNEL).unwrap().paid, U256::from(40));
    }

    #[test]
    fn payer_limits() {
        let (payer, payee) = parties();
        let (mut a, mut b) = managers(&payer, &payee, 10);
        assert!(matches!(
            a.create_voucher(CHANNEL, 0.into(), &payer),
            Err(PaymentError::ZeroAmount)
        ));
        assert!(matches!(
            a.create_voucher(CHANNEL, 11.into(), &payer),
            Err(PaymentError::InsufficientFunds { .. })
        ));
        assert!(matches!(
            b.create_voucher(CHANNEL, 1.into(), &payee),
            Err(PaymentError::NotThePayer(_))
        ));
        a.create_voucher(CHANNEL, 10.into(), &payer).unwrap();
        assert!(a.create_voucher(CHANNEL, 1.into(), &payer).is_err());
    }

    #[test]
    fn bad_vouchers_leave_no_trace() {
        let (payer, payee) = parties();
        let (_, mut b) = managers(&payer, &payee, 10);

        let forged = Voucher::signed(CHANNEL, 5.into(), &payee).unwrap();
        assert!(matches!(
            b.receive_voucher(forged),
            Err(PaymentError::WrongSigner(_))
        ));

        let too_much = Voucher::signed(CHANNEL, 11.into(), &payer).unwrap();
        assert!(b.receive_voucher(too_much).is_err());

        let mut tampered = Voucher::signed(CHANNEL, 2.into(), &payer).unwrap();
        tampered.amount = 9.into();
        assert!(b.receive_voucher(tampered).is_err());

        let elsewhere = Voucher::signed(Hash([8; 32]), 1.into(), &payer).unwrap();
        assert!(matches!(
            b.receive_voucher(elsewhere),
            Err(PaymentError::UnknownChannel(_))
        ));

        assert_eq!(b.balance(&CHANNEL).unwrap().paid, U256::zero());
    }

    #[test]
    fn registration() {
        let (payer, payee) = parties();
        let (mut a, _) = managers(&payer, &payee, 10);
        assert!(a.channel_registered(&CHANNEL));
        assert!(matches!(
            a.register(CHANNEL, payer.address(), payee.address(), 1.into()),
            Err(PaymentError::AlreadyRegistered(_))
        ));
        assert!(a.remove(&CHANNEL).is_some());
        assert!(!a.channel_registered(&CHANNEL));
        assert!(a.balance(&CHANNEL).is_err());
    }
}
