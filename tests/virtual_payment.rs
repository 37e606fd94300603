use std::time::Duration;

use nitro::{
    channel::outcome::{Allocation, Exit, SingleAssetExit},
    engine::{
        chainservice::{MockChain, MockChainService},
        config::EngineConfig,
        messageservice::MessageRouter,
        policy::PermissivePolicy,
        store::MemStore,
    },
    protocols::ObjectiveId,
    query::ChannelStatus,
    sig::Signer,
    Address, NitroClient, U256,
};
use rand::{rngs::StdRng, SeedableRng};
use tokio::{sync::broadcast, time::timeout};

struct Party {
    client: NitroClient<MemStore>,
    completed: broadcast::Receiver<ObjectiveId>,
}

fn party(seed: u64, chain: &MockChain, router: &MessageRouter) -> Party {
    let signer = Signer::new(&mut StdRng::seed_from_u64(seed));
    let address = signer.address();
    let (msg, peers) = router.connect(address).unwrap();
    let client = NitroClient::new(
        signer,
        MemStore::new(address),
        msg,
        peers,
        MockChainService::new(chain.clone(), 1337.into()),
        chain.subscribe().unwrap(),
        Box::new(PermissivePolicy),
        EngineConfig::default(),
    );
    let completed = client.completed_objectives();
    Party { client, completed }
}

fn two_party_outcome(first: Address, second: Address, amounts: [u64; 2]) -> Exit {
    Exit::single(SingleAssetExit {
        asset: Address::default(),
        metadata: vec![],
        allocations: vec![
            Allocation::simple(first.into(), amounts[0].into()),
            Allocation::simple(second.into(), amounts[1].into()),
        ],
    })
}

async fn wait_for(party: &mut Party, id: &ObjectiveId) {
    timeout(Duration::from_secs(10), async {
        loop {
            let done = party.completed.recv().await.unwrap();
            if &done == id {
                return;
            }
        }
    })
    .await
    .unwrap_or_else(|_| panic!("{} did not complete {}", party.client.address(), id))
}

#[tokio::test]
async fn pay_through_an_intermediary() {
    let chain = MockChain::new();
    let router = MessageRouter::new();
    let mut alice = party(1, &chain, &router);
    let mut bob = party(2, &chain, &router);
    let mut carol = party(3, &chain, &router);
    let (a, b, c) = (
        alice.client.address(),
        bob.client.address(),
        carol.client.address(),
    );

    // Ledgers Alice-Bob and Bob-Carol, funded on chain.
    let ab = alice
        .client
        .create_ledger_channel(b, 100, two_party_outcome(a, b, [100, 100]))
        .await
        .unwrap();
    let bc = bob
        .client
        .create_ledger_channel(c, 100, two_party_outcome(b, c, [100, 100]))
        .await
        .unwrap();
    wait_for(&mut alice, &ab).await;
    wait_for(&mut bob, &ab).await;
    wait_for(&mut bob, &bc).await;
    wait_for(&mut carol, &bc).await;
    let ab_id = ab.channel_id().unwrap();
    let bc_id = bc.channel_id().unwrap();
    assert_eq!(chain.holdings(&ab_id).unwrap()[&Address::default()], U256::from(200));

    // Virtual channel Alice-Carol through Bob.
    let (vf, v_id) = alice
        .client
        .create_virtual_payment_channel(vec![b], c, 100, two_party_outcome(a, c, [10, 0]))
        .await
        .unwrap();
    wait_for(&mut alice, &vf).await;
    wait_for(&mut bob, &vf).await;
    wait_for(&mut carol, &vf).await;

    let ledger = alice.client.get_ledger_channel(&ab_id).unwrap();
    assert_eq!(ledger.balance.client_balance, U256::from(90));
    assert_eq!(ledger.balance.hub_balance, U256::from(100));
    assert_eq!(ledger.balance.guarantees.len(), 1);
    assert_eq!(ledger.balance.guarantees[0].amount, U256::from(10));

    let payment = carol.client.get_payment_channel(&v_id).unwrap();
    assert_eq!(payment.status, ChannelStatus::Ready);
    assert_eq!(payment.balance.payer, a);
    assert_eq!(payment.balance.payee, c);

    // Pay and see the voucher arrive.
    let mut vouchers = carol.client.received_vouchers();
    alice.client.pay(v_id, 4.into()).await.unwrap();
    let voucher = timeout(Duration::from_secs(10), vouchers.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(voucher.channel_id, v_id);
    assert_eq!(voucher.amount, U256::from(4));
    let payment = carol.client.get_payment_channel(&v_id).unwrap();
    assert_eq!(payment.balance.paid_so_far, U256::from(4));
    assert_eq!(payment.balance.remaining_funds, U256::from(6));

    // Close the virtual channel, the payment ends up in the ledgers.
    let vd = alice.client.close_virtual_channel(v_id).await.unwrap();
    wait_for(&mut alice, &vd).await;
    wait_for(&mut bob, &vd).await;
    wait_for(&mut carol, &vd).await;

    let ledger = alice.client.get_ledger_channel(&ab_id).unwrap();
    assert_eq!(ledger.balance.client_balance, U256::from(96));
    assert_eq!(ledger.balance.hub_balance, U256::from(104));
    assert!(ledger.balance.guarantees.is_empty());

    let ledger = carol.client.get_ledger_channel(&bc_id).unwrap();
    assert_eq!(ledger.balance.client, b);
    assert_eq!(ledger.balance.client_balance, U256::from(96));
    assert_eq!(ledger.balance.hub_balance, U256::from(104));

    let payment = carol.client.get_payment_channel(&v_id).unwrap();
    assert_eq!(payment.status, ChannelStatus::Complete);
    assert_eq!(payment.balance.paid_so_far, U256::from(4));

    // Close Alice-Bob on chain.
    let dd = alice.client.close_ledger_channel(ab_id).await.unwrap();
    wait_for(&mut alice, &dd).await;
    wait_for(&mut bob, &dd).await;
    assert!(chain.holdings(&ab_id).unwrap().is_empty());
}

#[tokio::test]
async fn second_ledger_with_the_same_peer_is_refused() {
    let chain = MockChain::new();
    let router = MessageRouter::new();
    let mut alice = party(1, &chain, &router);
    let mut bob = party(2, &chain, &router);
    let (a, b) = (alice.client.address(), bob.client.address());

    let ab = alice
        .client
        .create_ledger_channel(b, 100, two_party_outcome(a, b, [5, 5]))
        .await
        .unwrap();
    wait_for(&mut alice, &ab).await;
    wait_for(&mut bob, &ab).await;

    assert!(alice
        .client
        .create_ledger_channel(b, 100, two_party_outcome(a, b, [1, 1]))
        .await
        .is_err());
}
