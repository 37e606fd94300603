use super::{recover_signer, Error, Signer};
use crate::{
    abiencode::{self, as_bytes},
    Hash,
};
use rand::{rngs::StdRng, SeedableRng};
use serde::Serialize;

fn data() -> Hash {
    /*
    ```solidity
    function verify_sig(address signer, bytes memory sig) public pure {
        bytes memory d;
        d = "\xa1\xa2\xa3\xa4";
        require(Sig.verify(abi.encode(d), sig, signer), "invalid signature");
    }
    ```
    */

    #[derive(Serialize, Debug)]
    #[serde(transparent)]
    struct Bytes {
        #[serde(with = "as_bytes")]
        value: Vec<u8>,
    }
    let d = Bytes {
        value: vec![0xa1, 0xa2, 0xa3, 0xa4],
    };

    abiencode::to_hash(&d).unwrap()
}

#[test]
fn address_from_known_key() {
    // Well known test key, do not use for anything else.
    let key: [u8; 32] =
        hex::decode("4c0883a69102937d6231471b5dbb6204fe5129617082792ae468d01a3f362318")
            .unwrap()
            .try_into()
            .unwrap();
    let signer = Signer::from_bytes(&key).unwrap();
    assert_eq!(
        hex::encode(signer.address().0),
        "2c7536e3605d9c16a7a3d7b1898e529396a65c23"
    );
}

#[test]
fn zero_key_is_rejected() {
    assert!(matches!(
        Signer::from_bytes(&[0u8; 32]),
        Err(Error::InvalidKey)
    ));
}

#[test]
fn sign_and_recover() {
    let mut rng = StdRng::seed_from_u64(0);
    let signer = Signer::new(&mut rng);
    let msg = data();
    let sig = signer.sign_eth(msg);

    assert!(sig.0[64] == 27 || sig.0[64] == 28);
    assert_eq!(recover_signer(msg, sig).unwrap(), signer.address());
}

#[test]
fn different_seeds_give_different_signers() {
    let a = Signer::new(&mut StdRng::seed_from_u64(0));
    let b = Signer::new(&mut StdRng::seed_from_u64(1));
    let a_again = Signer::new(&mut StdRng::seed_from_u64(0));
    assert_ne!(a.address(), b.address());
    assert_eq!(a.address(), a_again.address());
}

#[test]
fn other_message_recovers_other_address() {
    let mut rng = StdRng::seed_from_u64(0);
    let signer = Signer::new(&mut rng);
    let sig = signer.sign_eth(data());

    let mut other = data();
    other.0[0] ^= 0xff;
    // Recovery of a mismatching hash either fails or yields a stranger.
    match recover_signer(other, sig) {
        Ok(addr) => assert_ne!(addr, signer.address()),
        Err(_) => {}
    }
}

#[test]
fn recovery_id_below_offset_is_an_error() {
    let mut rng = StdRng::seed_from_u64(0);
    let signer = Signer::new(&mut rng);
    let mut sig = signer.sign_eth(data());
    sig.0[64] = 1;

    assert!(matches!(
        recover_signer(data(), sig),
        Err(Error::InvalidRecoveryId(1))
    ));
}
