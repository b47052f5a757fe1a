use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;

use tokenkit::contracts::Code;
use tokenkit::runtime::{ExportOptions, Receipt, RunTransaction, RuntimeError};
use tokenkit::script::{decode_tx, Transaction, TxOut, Txid};
use tokenkit::{
    HoldingSource, Jig, KitError, Location, MockRun, Network, OfferParams, OrderLock, Owner,
    RunInstance, TokenKit,
};

async fn coins<R: RunInstance + ?Sized>(kit: &TokenKit<R>, amounts: &[u64]) -> Code {
    let code = kit
        .ft()
        .deploy(json!({
            "className": "FooCoin",
            "metadata": { "name": "Foo Coin" },
            "symbol": "FOO",
            "decimals": 2,
        }))
        .await
        .unwrap();
    let me = kit.run().owner_address();
    let recipients = amounts.iter().map(|amount| (*amount, me.clone())).collect();
    kit.ft().mint(&code.origin(), recipients).await.unwrap();
    code
}

async fn art<R: RunInstance + ?Sized>(kit: &TokenKit<R>) -> Code {
    let code = kit
        .nft()
        .deploy(json!({ "className": "FooArt", "metadata": { "name": "Foo Art" } }))
        .await
        .unwrap();
    let me = kit.run().owner_address();
    kit.nft().mint(&code.origin(), vec![me.clone(), me]).await.unwrap();
    code
}

#[tokio::test]
async fn test_offer_from_box_and_take() {
    let run = Arc::new(MockRun::new());
    let kit = TokenKit::new(run.clone());
    let seller = run.owner_address();
    let code = coins(&kit, &[3000, 2000]).await;

    let mut jigbox = kit.ft().get_jig_box(&code.origin()).await.unwrap();
    let offer = kit
        .dex()
        .create_offer(OfferParams {
            source: Some(HoldingSource::Box {
                jigbox: &mut jigbox,
                amount: Some(1000),
            }),
            address: seller.clone(),
            satoshis: 5000,
        })
        .await
        .unwrap();
    assert_eq!(offer.amount, Some(1000));
    assert_eq!(jigbox.balance().unwrap(), 4000);
    let lock = OrderLock::new(seller.clone(), 5000).unwrap();
    assert_eq!(offer.owner(), Some(&Owner::OrderLock(lock.clone())));

    // cancel baton
    let raw = run.fetch_tx(&offer.location().txid).await.unwrap();
    let offer_tx = decode_tx(&raw).unwrap();
    assert_eq!(offer_tx.output[0].value.to_sat(), 546);
    assert_eq!(
        offer_tx.output[offer.location().vout().unwrap() as usize].script_pubkey,
        lock.script().unwrap()
    );

    let listed = kit.dex().list_offers(&code.origin()).await.unwrap();
    assert_eq!(listed, vec![offer.clone()]);

    let txid = kit.dex().take_offer(&offer.location()).await.unwrap();
    let take_tx = decode_tx(&run.fetch_tx(&txid).await.unwrap()).unwrap();
    assert_eq!(take_tx.output[0], lock.designated_output().unwrap());
    assert_eq!(take_tx.input[0].previous_output.txid, offer.location().txid);

    assert!(kit.dex().list_offers(&code.origin()).await.unwrap().is_empty());
    jigbox.sync().await.unwrap();
    assert_eq!(jigbox.balance().unwrap(), 5000);

    let err = kit.dex().take_offer(&offer.location()).await.unwrap_err();
    assert!(matches!(err, KitError::Runtime(RuntimeError::Spent(_))));
}

#[tokio::test]
async fn test_offer_from_unit_and_cancel() {
    let run = Arc::new(MockRun::new());
    let kit = TokenKit::new(run.clone());
    let code = art(&kit).await;

    let pieces = kit.nft().get_jig_box(&code.origin()).await.unwrap();
    let piece = pieces.jigs()[0].clone();
    let offer = kit
        .dex()
        .create_offer(OfferParams {
            source: Some(HoldingSource::Unit(piece.clone())),
            address: run.owner_address(),
            satoshis: 100_000,
        })
        .await
        .unwrap();
    assert_eq!(offer.origin(), piece.origin());
    assert_eq!(offer.number, Some(1));
    assert!(offer.owner().and_then(Owner::as_order_lock).is_some());

    let txid = kit.dex().cancel_offer(&offer.location()).await.unwrap();
    let cancel_tx = decode_tx(&run.fetch_tx(&txid).await.unwrap()).unwrap();
    assert_eq!(cancel_tx.input.len(), 2);
    assert_eq!(cancel_tx.input[1].previous_output.txid, offer.location().txid);
    assert_eq!(cancel_tx.input[1].previous_output.vout, 0);

    let returned = run.sync_jig(&offer).await.unwrap();
    assert_eq!(returned.owner(), Some(&Owner::from(run.owner_address())));
    assert!(kit.dex().list_offers(&code.origin()).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_offer_source_is_required() {
    let run = Arc::new(MockRun::new());
    let kit = TokenKit::new(run.clone());
    let code = coins(&kit, &[10]).await;
    let address = run.owner_address();

    let err = kit
        .dex()
        .create_offer(OfferParams {
            source: None,
            address: address.clone(),
            satoshis: 1000,
        })
        .await
        .unwrap_err();
    assert!(matches!(err, KitError::InvalidOfferSource));

    let mut jigbox = kit.ft().get_jig_box(&code.origin()).await.unwrap();
    let err = kit
        .dex()
        .create_offer(OfferParams {
            source: Some(HoldingSource::Box {
                jigbox: &mut jigbox,
                amount: None,
            }),
            address,
            satoshis: 1000,
        })
        .await
        .unwrap_err();
    assert_eq!(err.to_string(), "offer must be created from a jig or jigbox with amount");
    assert_eq!(jigbox.balance().unwrap(), 10);
}

#[tokio::test]
async fn test_zero_amount_box_offer_is_rejected_locally() {
    let run = Arc::new(MockRun::new());
    let kit = TokenKit::new(run.clone());
    let code = coins(&kit, &[10, 5]).await;
    let mut jigbox = kit.ft().get_jig_box(&code.origin()).await.unwrap();

    let err = kit
        .dex()
        .create_offer(OfferParams {
            source: Some(HoldingSource::Box {
                jigbox: &mut jigbox,
                amount: Some(0),
            }),
            address: run.owner_address(),
            satoshis: 1000,
        })
        .await
        .unwrap_err();
    assert!(matches!(err, KitError::InvalidOfferSource), "{err}");

    jigbox.sync().await.unwrap();
    assert_eq!(jigbox.balance().unwrap(), 15);
    assert_eq!(jigbox.jigs().len(), 2);
    assert!(kit.dex().list_offers(&code.origin()).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_offer_params_are_validated() {
    let run = Arc::new(MockRun::new());
    let kit = TokenKit::new(run.clone());
    let code = art(&kit).await;
    let pieces = kit.nft().get_jig_box(&code.origin()).await.unwrap();
    let piece = pieces.jigs()[0].clone();

    let err = kit
        .dex()
        .create_offer(OfferParams {
            source: Some(HoldingSource::Unit(piece.clone())),
            address: "not an address".into(),
            satoshis: 1000,
        })
        .await
        .unwrap_err();
    assert_eq!(err.to_string(), "'address' is invalid. must be a Bitcoin address");

    let err = kit
        .dex()
        .create_offer(OfferParams {
            source: Some(HoldingSource::Unit(piece.clone())),
            address: run.owner_address(),
            satoshis: 0,
        })
        .await
        .unwrap_err();
    assert_eq!(err.to_string(), "'satoshis' is invalid. must be a number");

    let err = kit
        .dex()
        .create_offer(OfferParams {
            source: Some(HoldingSource::Unit(piece)),
            address: run.owner_address(),
            satoshis: 100,
        })
        .await
        .unwrap_err();
    assert!(matches!(err, KitError::OrderLock(_)));
}

#[tokio::test]
async fn test_take_requires_an_offer() {
    let run = Arc::new(MockRun::new());
    let kit = TokenKit::new(run.clone());
    let code = art(&kit).await;
    let pieces = kit.nft().get_jig_box(&code.origin()).await.unwrap();

    let err = kit.dex().take_offer(&pieces.jigs()[0].location()).await.unwrap_err();
    assert!(matches!(err, KitError::NotAnOffer(_)));
}

/// Delegates to a mock runtime but rejects every unlocking script.
struct Rejecting {
    inner: MockRun,
}

#[async_trait]
impl RunInstance for Rejecting {
    fn network(&self) -> Network {
        self.inner.network()
    }
    fn owner_address(&self) -> String {
        self.inner.owner_address()
    }
    fn purse_address(&self) -> String {
        self.inner.purse_address()
    }
    async fn next_owner(&self) -> Result<Owner, RuntimeError> {
        self.inner.next_owner().await
    }
    async fn load_code(&self, location: &Location) -> Result<Code, RuntimeError> {
        self.inner.load_code(location).await
    }
    async fn sync_code(&self, code: &Code) -> Result<Code, RuntimeError> {
        self.inner.sync_code(code).await
    }
    async fn load_jig(&self, location: &Location) -> Result<Jig, RuntimeError> {
        self.inner.load_jig(location).await
    }
    async fn sync_jig(&self, jig: &Jig) -> Result<Jig, RuntimeError> {
        self.inner.sync_jig(jig).await
    }
    async fn publish(&self, tx: RunTransaction) -> Result<Receipt, RuntimeError> {
        self.inner.publish(tx).await
    }
    async fn export(&self, tx: &RunTransaction, options: ExportOptions) -> Result<String, RuntimeError> {
        self.inner.export(tx, options).await
    }
    async fn rollback(&self, tx: &RunTransaction) -> Result<(), RuntimeError> {
        self.inner.rollback(tx).await
    }
    async fn inventory(&self) -> Result<Vec<Jig>, RuntimeError> {
        self.inner.inventory().await
    }
    async fn unspent(&self, class: &Location) -> Result<Vec<Location>, RuntimeError> {
        self.inner.unspent(class).await
    }
    async fn fetch_tx(&self, txid: &Txid) -> Result<String, RuntimeError> {
        self.inner.fetch_tx(txid).await
    }
    async fn broadcast(&self, rawtx: &str) -> Result<Txid, RuntimeError> {
        self.inner.broadcast(rawtx).await
    }
    async fn sign_with_purse(&self, tx: &mut Transaction) -> Result<(), RuntimeError> {
        self.inner.sign_with_purse(tx).await
    }
    async fn verify_script(&self, _tx: &Transaction, vin: usize, _locked: &TxOut) -> Result<(), RuntimeError> {
        Err(RuntimeError::Verification {
            vin,
            reason: "interpreter refused".into(),
        })
    }
}

#[tokio::test]
async fn test_verification_failure_is_fatal() {
    let run = Arc::new(Rejecting {
        inner: MockRun::new(),
    });
    let kit = TokenKit::new(run.clone());
    let code = art(&kit).await;
    let pieces = kit.nft().get_jig_box(&code.origin()).await.unwrap();

    let offer = kit
        .dex()
        .create_offer(OfferParams {
            source: Some(HoldingSource::Unit(pieces.jigs()[0].clone())),
            address: run.owner_address(),
            satoshis: 1000,
        })
        .await
        .unwrap();

    let err = kit.dex().take_offer(&offer.location()).await.unwrap_err();
    match err {
        KitError::ScriptVerification { vin, reason } => {
            assert_eq!(vin, 0);
            assert_eq!(reason, "interpreter refused");
        }
        other => panic!("unexpected error: {other}"),
    }
    // still locked
    assert_eq!(kit.dex().list_offers(&code.origin()).await.unwrap(), vec![offer]);
}
