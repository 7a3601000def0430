//! End to end wallet flows against the in-memory repository and chain.

mod common;

use common::*;
use hdwallet_rs::network::Network;
use hdwallet_rs::primitives::bip32::HdKey;
use hdwallet_rs::storage::KeyFilter;
use hdwallet_rs::transaction_builder::Fee;
use hdwallet_rs::transaction_signer;
use hdwallet_rs::types::{KeyType, Scheme, WitnessType};
use hdwallet_rs::wallet::{WalletOptions, IMPORT_PATH_PREFIX};
use hdwallet_rs::WalletError;

#[tokio::test]
async fn test_legacy_send_end_to_end() {
    let fx = Fixture::new();
    let mut wallet = fx.create("e2e", &[], options(WitnessType::Legacy)).await;
    let key = wallet.get_key(None, None, 0).await.unwrap();
    assert!(key.address.starts_with('1'));

    wallet.utxo_add(&key.address, 100_000_000, &txid(1), 0, 1).await.unwrap();
    assert_eq!(wallet.balance().await.unwrap(), 100_000_000);

    let dest = fx.foreign_address("e2e-dest").await;
    let tx = wallet
        .send_to(&dest, 50_000_000, Some(Fee::Amount(1_000)), false)
        .await
        .unwrap();

    assert_eq!(tx.outputs.len(), 2);
    assert_eq!(tx.output_total, 99_999_000);
    assert_eq!(tx.fee, 1_000);
    assert!(tx.complete);
    assert!(transaction_signer::verify(&tx).unwrap());
    assert_eq!(fx.chain.broadcasts().await, vec![tx.raw.clone()]);

    let change: Vec<_> = tx.change_outputs().collect();
    assert_eq!(change.len(), 1);
    assert_eq!(change[0].value, 49_999_000);
    assert_eq!(wallet.balance().await.unwrap(), 49_999_000);

    let utxos = wallet.utxos(None, None, 0, None).await.unwrap();
    assert_eq!(utxos.len(), 1);
    assert_eq!(utxos[0].txid, tx.txid);
}

#[tokio::test]
async fn test_segwit_send_with_estimated_fee() {
    let fx = Fixture::new();
    let mut wallet = fx.create("segwit", &[], options(WitnessType::Segwit)).await;
    let key = wallet.get_key(None, None, 0).await.unwrap();
    assert!(key.address.starts_with("bc1q"));
    wallet.utxo_add(&key.address, 1_000_000, &txid(2), 1, 3).await.unwrap();

    let dest = fx.foreign_address("segwit-dest").await;
    let tx = wallet.send_to(&dest, 400_000, None, false).await.unwrap();

    assert!(tx.complete);
    assert!(transaction_signer::verify(&tx).unwrap());
    assert_eq!(tx.input_total, tx.output_total + tx.fee);
    assert!(tx.fee_per_kb >= Network::Bitcoin.fee_min() && tx.fee_per_kb <= Network::Bitcoin.fee_max());
    assert_eq!(wallet.balance().await.unwrap(), 1_000_000 - 400_000 - tx.fee);
}

#[tokio::test]
async fn test_offline_send_is_not_broadcast_or_stored() {
    let fx = Fixture::new();
    let mut wallet = fx.create("offline", &[], options(WitnessType::Legacy)).await;
    let key = wallet.get_key(None, None, 0).await.unwrap();
    wallet.utxo_add(&key.address, 500_000, &txid(3), 0, 2).await.unwrap();

    let dest = fx.foreign_address("offline-dest").await;
    let tx = wallet.send_to(&dest, 100_000, Some(Fee::Amount(2_000)), true).await.unwrap();
    assert!(tx.complete);
    assert!(fx.chain.broadcasts().await.is_empty());
    assert_eq!(wallet.balance().await.unwrap(), 500_000);
    assert_eq!(wallet.transactions(None, None).await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_single_key_wallet_sends_change_to_main_key() {
    let fx = Fixture::new();
    let wif = single_key(7).wif();
    let mut wallet = fx
        .create(
            "single",
            &[&wif],
            WalletOptions {
                scheme: Scheme::Single,
                ..options(WitnessType::Legacy)
            },
        )
        .await;
    let main = wallet.main_key().await.unwrap();
    let key = wallet.get_key(None, None, 0).await.unwrap();
    assert_eq!(key.id, main.id());
    assert_eq!(wallet.new_key(None, None, None).await.unwrap().id(), main.id());

    wallet.utxo_add(&key.address, 100_000, &txid(4), 0, 1).await.unwrap();
    let dest = fx.foreign_address("single-dest").await;
    let tx = wallet.send_to(&dest, 20_000, Some(Fee::Amount(1_000)), false).await.unwrap();

    let change: Vec<_> = tx.change_outputs().collect();
    assert_eq!(change.len(), 1);
    assert_eq!(change[0].address.as_deref(), Some(key.address.as_str()));
    assert_eq!(wallet.balance().await.unwrap(), 79_000);
}

#[tokio::test]
async fn test_single_key_legacy_send_end_to_end() {
    let fx = Fixture::new();
    let wif = single_key(8).wif();
    let mut wallet = fx
        .create(
            "single-e2e",
            &[&wif],
            WalletOptions {
                scheme: Scheme::Single,
                ..options(WitnessType::Legacy)
            },
        )
        .await;
    let key = wallet.get_key(None, None, 0).await.unwrap();
    assert!(key.address.starts_with('1'));
    wallet.utxo_add(&key.address, 100_000_000, &txid(12), 0, 1).await.unwrap();

    let dest = fx.foreign_address("single-e2e-dest").await;
    let tx = wallet
        .send_to(&dest, 50_000_000, Some(Fee::Amount(1_000)), false)
        .await
        .unwrap();

    assert_eq!(tx.input_total, 100_000_000);
    assert_eq!(tx.outputs.len(), 2);
    assert_eq!(tx.output_total, 99_999_000);
    assert_eq!(tx.fee, 1_000);
    assert!(tx.complete);
    assert!(transaction_signer::verify(&tx).unwrap());
    assert_eq!(fx.chain.broadcasts().await, vec![tx.raw.clone()]);

    let change: Vec<_> = tx.change_outputs().collect();
    assert_eq!(change.len(), 1);
    assert_eq!(change[0].value, 49_999_000);
    assert_eq!(change[0].address.as_deref(), Some(key.address.as_str()));
    assert_eq!(wallet.balance().await.unwrap(), 49_999_000);
}

#[tokio::test]
async fn test_insufficient_funds() {
    let fx = Fixture::new();
    let mut wallet = fx.create("poor", &[], options(WitnessType::Legacy)).await;
    let dest = fx.foreign_address("poor-dest").await;

    let empty = wallet.send_to(&dest, 10_000, Some(Fee::Amount(1_000)), false).await;
    assert!(matches!(empty, Err(WalletError::InsufficientFunds(_))));

    let key = wallet.get_key(None, None, 0).await.unwrap();
    wallet.utxo_add(&key.address, 10_000, &txid(5), 0, 1).await.unwrap();
    let short = wallet.send_to(&dest, 100_000_000, Some(Fee::Amount(1_000)), false).await;
    assert!(matches!(short, Err(WalletError::InsufficientFunds(_))));
    assert!(fx.chain.broadcasts().await.is_empty());
}

#[tokio::test]
async fn test_create_configuration_errors() {
    let fx = Fixture::new();
    fx.create("taken", &[], options(WitnessType::Legacy)).await;

    let duplicate = fx.try_create("taken", &[], options(WitnessType::Legacy)).await;
    assert!(matches!(duplicate, Err(WalletError::Configuration(_))));

    let numeric = fx.try_create("12345", &[], options(WitnessType::Legacy)).await;
    assert!(matches!(numeric, Err(WalletError::Configuration(_))));

    let passphrase = "abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon about";
    let no_network = fx.try_create("phrase", &[passphrase], WalletOptions::default()).await;
    assert!(matches!(no_network, Err(WalletError::Configuration(_))));

    let doge = fx
        .try_create(
            "doge",
            &[],
            WalletOptions {
                network: Some(Network::Dogecoin),
                witness_type: Some(WitnessType::Segwit),
                ..Default::default()
            },
        )
        .await;
    assert!(matches!(doge, Err(WalletError::Configuration(_))));

    let tprv = HdKey::from_seed(&[3; 32], Network::Testnet).unwrap().wif();
    let mismatch = fx.try_create("mismatch", &[&tprv], options(WitnessType::Legacy)).await;
    assert!(matches!(mismatch, Err(WalletError::Configuration(_))));

    let (a, b) = (single_key(1).wif(), public_hex(&single_key(2)));
    let single_multi = fx
        .try_create(
            "single-multi",
            &[&a, &b],
            WalletOptions {
                scheme: Scheme::Single,
                ..options(WitnessType::Legacy)
            },
        )
        .await;
    assert!(matches!(single_multi, Err(WalletError::Configuration(_))));

    let threshold = fx
        .try_create(
            "threshold",
            &[&a, &b],
            WalletOptions {
                sigs_required: Some(3),
                ..options(WitnessType::Legacy)
            },
        )
        .await;
    assert!(matches!(threshold, Err(WalletError::Configuration(_))));

    let plain_key = fx.try_create("plain", &[&a], options(WitnessType::Legacy)).await;
    assert!(matches!(plain_key, Err(WalletError::Configuration(_))));
}

#[tokio::test]
async fn test_passphrase_wallet_is_deterministic() {
    let fx = Fixture::new();
    let passphrase = "abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon about";
    let mut first = fx.create("phrase-1", &[passphrase], options(WitnessType::Legacy)).await;
    let mut second = fx.create("phrase-2", &[passphrase], options(WitnessType::Legacy)).await;
    let a = first.get_key(None, None, 0).await.unwrap();
    let b = second.get_key(None, None, 0).await.unwrap();
    assert_eq!(a.address, b.address);
    assert_eq!(a.path, "m/44'/0'/0'/0/0");
}

#[tokio::test]
async fn test_open_by_name_and_id() {
    let fx = Fixture::new();
    let mut created = fx.create("reopen", &[], options(WitnessType::Segwit)).await;
    let key = created.get_key(None, None, 0).await.unwrap();

    let mut by_name = fx.open("reopen").await.unwrap();
    assert_eq!(by_name.id(), created.id());
    assert_eq!(by_name.get_key(None, None, 0).await.unwrap().address, key.address);

    let by_id = fx.open(&created.id().to_string()).await.unwrap();
    assert_eq!(by_id.name(), "reopen");
    assert_eq!(by_id.record().witness_type, WitnessType::Segwit);

    assert!(matches!(fx.open("missing").await, Err(WalletError::NotFound(_))));
}

#[tokio::test]
async fn test_new_account_and_key_sequence() {
    let fx = Fixture::new();
    let mut wallet = fx.create("accounts", &[], options(WitnessType::Legacy)).await;

    let first = wallet.new_key(None, None, None).await.unwrap();
    let second = wallet.new_key(None, None, Some("rent")).await.unwrap();
    assert_eq!(first.path(), "m/44'/0'/0'/0/1");
    assert_eq!(second.path(), "m/44'/0'/0'/0/2");
    assert_eq!(second.record.name, "rent");
    let change = wallet.new_key_change(None, None, None).await.unwrap();
    assert_eq!(change.path(), "m/44'/0'/0'/1/0");

    let account = wallet.new_account("savings", None).await.unwrap();
    assert_eq!(account.path(), "m/44'/0'/1'");
    assert_eq!(account.record.account_id, 1);
    assert_eq!(account.record.name, "savings");
    let key = wallet.get_key(Some(1), None, 0).await.unwrap();
    assert_eq!(key.path, "m/44'/0'/1'/0/0");
    let change = wallet.get_key(Some(1), None, 1).await.unwrap();
    assert_eq!(change.path, "m/44'/0'/1'/1/0");

    let explicit = wallet.new_account("cold", Some(5)).await.unwrap();
    assert_eq!(explicit.path(), "m/44'/0'/5'");
}

#[tokio::test]
async fn test_import_master_key_upgrades_public_keys() {
    let fx = Fixture::new();
    let master = HdKey::from_seed(&[9; 32], Network::Bitcoin).unwrap();
    let mut account = master.clone();
    for index in [0x8000_002c, 0x8000_0000, 0x8000_0000] {
        account = account.derive_child(index).unwrap();
    }
    let xpub = account.public().wif();

    let mut wallet = fx.create("watch", &[&xpub], options(WitnessType::Legacy)).await;
    let watched = wallet.get_key(None, None, 0).await.unwrap();
    assert!(!watched.is_private);
    assert_eq!(watched.path, "M/0/0");
    let dest = fx.foreign_address("watch-dest").await;
    assert!(matches!(
        wallet.new_account("nope", None).await,
        Err(WalletError::Configuration(_))
    ));

    wallet.import_master_key(&master.wif(), "master").await.unwrap();
    let upgraded = wallet.key(watched.id).await.unwrap();
    assert!(upgraded.is_private());
    assert_eq!(upgraded.address(), watched.address);
    assert_eq!(upgraded.path(), "m/44'/0'/0'/0/0");
    assert!(wallet.main_key().await.unwrap().is_private());

    wallet.utxo_add(&watched.address, 80_000, &txid(6), 0, 1).await.unwrap();
    let tx = wallet.send_to(&dest, 30_000, Some(Fee::Amount(1_500)), false).await.unwrap();
    assert!(tx.complete);

    let public_keys = wallet.keys(KeyFilter::wallet(wallet.id()).private(false)).await.unwrap();
    assert!(public_keys.is_empty());
}

#[tokio::test]
async fn test_import_standalone_keys_and_spend() {
    let fx = Fixture::new();
    let mut wallet = fx.create("imports", &[], options(WitnessType::Legacy)).await;

    let wif = single_key(20).wif();
    let imported = wallet.import_key(&wif, None, "paper").await.unwrap().unwrap();
    assert_eq!(imported.path(), format!("{}00001", IMPORT_PATH_PREFIX));
    assert_eq!(imported.record.key_type, KeyType::Single);
    assert_eq!(imported.record.name, "paper");
    assert!(imported.is_private());
    assert!(wallet.import_key(&wif, None, "again").await.unwrap().is_none());

    let watched = wallet
        .import_key(&public_hex(&single_key(21)), None, "")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(watched.path(), "import_key_00002");
    assert_eq!(watched.record.name, "import_key_00002");
    assert!(!watched.is_private());

    wallet.utxo_add(imported.address(), 200_000, &txid(13), 0, 2).await.unwrap();
    let dest = fx.foreign_address("imports-dest").await;
    let tx = wallet.send_to(&dest, 50_000, Some(Fee::Amount(2_000)), false).await.unwrap();
    assert!(tx.complete);
    assert!(transaction_signer::verify(&tx).unwrap());
    assert_eq!(tx.inputs[0].key_id, imported.id());
    let change: Vec<_> = tx.change_outputs().collect();
    assert_eq!(change.len(), 1);
    assert_ne!(change[0].address.as_deref(), Some(imported.address()));
}

#[tokio::test]
async fn test_import_key_routes_master_to_watch_only_wallet() {
    let fx = Fixture::new();
    let master = HdKey::from_seed(&[14; 32], Network::Bitcoin).unwrap();
    let mut account = master.clone();
    for index in [0x8000_002c, 0x8000_0000, 0x8000_0000] {
        account = account.derive_child(index).unwrap();
    }
    let xpub = account.public().wif();
    let mut wallet = fx.create("watch-import", &[&xpub], options(WitnessType::Legacy)).await;
    let watched = wallet.get_key(None, None, 0).await.unwrap();

    let main = wallet.import_key(&master.wif(), None, "master").await.unwrap().unwrap();
    assert!(main.is_private());
    assert_eq!(main.path(), "m");
    assert!(wallet.key(watched.id).await.unwrap().is_private());
}

#[tokio::test]
async fn test_accounts_and_networks() {
    let fx = Fixture::new();
    let mut wallet = fx.create("listing", &[], options(WitnessType::Legacy)).await;
    assert_eq!(wallet.accounts(None).await.unwrap(), vec![0]);
    assert_eq!(wallet.networks().await.unwrap(), vec![Network::Bitcoin]);

    wallet.new_account("second", None).await.unwrap();
    wallet.new_account("cold", Some(5)).await.unwrap();
    assert_eq!(wallet.accounts(None).await.unwrap(), vec![0, 1, 5]);
    let account_keys = wallet.keys_accounts(None, None).await.unwrap();
    let paths: Vec<&str> = account_keys.iter().map(|k| k.path.as_str()).collect();
    assert_eq!(paths, vec!["m/44'/0'/0'", "m/44'/0'/1'", "m/44'/0'/5'"]);
    assert_eq!(wallet.keys_accounts(Some(1), None).await.unwrap().len(), 1);
    assert!(wallet.keys_accounts(None, Some(Network::Litecoin)).await.unwrap().is_empty());
    assert_eq!(wallet.accounts(Some(Network::Litecoin)).await.unwrap(), vec![0]);

    let testnet_wif = single_key(22).with_network(Network::Testnet).wif();
    let imported = wallet.import_key(&testnet_wif, None, "testnet").await.unwrap().unwrap();
    assert_ne!(imported.record.network, Network::Bitcoin);
    assert_eq!(
        wallet.networks().await.unwrap(),
        vec![Network::Bitcoin, imported.record.network]
    );
}

#[tokio::test]
async fn test_public_master_and_wif_export() {
    let fx = Fixture::new();
    let mut wallet = fx.create("export", &[], options(WitnessType::Segwit)).await;

    let masters = wallet.public_master(None, None, false).await.unwrap();
    assert_eq!(masters.len(), 1);
    assert_eq!(masters[0].path(), "m/84'/0'/0'");
    assert!(!masters[0].is_private());
    assert!(!masters[0].record.is_private);
    assert!(masters[0].record.wif.starts_with("xpub"));
    let private = wallet.public_master(None, None, true).await.unwrap();
    assert!(private[0].is_private());

    let public_wifs = wallet.wif(false, None).await.unwrap();
    assert_eq!(public_wifs, vec![masters[0].record.wif.clone()]);
    let private_wifs = wallet.wif(true, None).await.unwrap();
    assert!(private_wifs[0].starts_with("xprv"));
    assert_eq!(
        wallet.public_master(Some(1), None, false).await.unwrap()[0].path(),
        "m/84'/0'/1'"
    );

    let mut watch = fx.create("export-watch", &[&public_wifs[0]], options(WitnessType::Segwit)).await;
    assert_eq!(
        watch.get_key(None, None, 0).await.unwrap().address,
        wallet.get_key(None, None, 0).await.unwrap().address
    );
    assert!(matches!(watch.wif(true, None).await, Err(WalletError::Key(_))));
    assert_eq!(watch.wif(false, None).await.unwrap(), public_wifs);
    assert!(matches!(
        watch.public_master(Some(3), None, false).await,
        Err(WalletError::Key(_))
    ));
}

#[tokio::test]
async fn test_transaction_files_need_a_location() {
    let fx = Fixture::new();
    let mut wallet = fx.create("tx-files", &[], options(WitnessType::Legacy)).await;
    assert!(matches!(
        wallet.transaction_load(None, None).await,
        Err(WalletError::InvalidInput(_))
    ));
    assert!(matches!(
        wallet.transaction_load(Some(txid(1).as_str()), None).await,
        Err(WalletError::Configuration(_))
    ));

    let dir = tempfile::TempDir::new().unwrap();
    let missing = dir.path().join("missing.tx");
    assert!(matches!(
        wallet.transaction_load(None, Some(missing.as_path())).await,
        Err(WalletError::NotFound(_))
    ));
}

#[tokio::test]
async fn test_sweep_spends_everything() {
    let fx = Fixture::new();
    let mut wallet = fx.create("sweep", &[], options(WitnessType::Legacy)).await;
    let keys = wallet.get_keys(None, None, 0, 2, false).await.unwrap();
    wallet.utxo_add(&keys[0].address, 60_000, &txid(7), 0, 1).await.unwrap();
    wallet.utxo_add(&keys[1].address, 40_000, &txid(8), 0, 1).await.unwrap();

    let dest = fx.foreign_address("sweep-dest").await;
    let tx = wallet
        .sweep(vec![(dest.clone(), 0)], None, Some(Fee::Amount(2_000)), false)
        .await
        .unwrap();
    assert_eq!(tx.inputs.len(), 2);
    assert_eq!(tx.outputs.len(), 1);
    assert_eq!(tx.outputs[0].value, 98_000);
    assert_eq!(tx.fee, 2_000);
    assert!(tx.complete);
    assert_eq!(wallet.balance().await.unwrap(), 0);

    let nothing_left = wallet.sweep(vec![(dest, 0)], None, Some(Fee::Amount(2_000)), false).await;
    assert!(matches!(nothing_left, Err(WalletError::InsufficientFunds(_))));
}

#[tokio::test]
async fn test_sweep_rejects_unbalanced_outputs() {
    let fx = Fixture::new();
    let mut wallet = fx.create("sweep-bad", &[], options(WitnessType::Legacy)).await;
    let key = wallet.get_key(None, None, 0).await.unwrap();
    wallet.utxo_add(&key.address, 60_000, &txid(9), 0, 1).await.unwrap();

    let dest = fx.foreign_address("sweep-bad-dest").await;
    let result = wallet
        .sweep(vec![(dest, 10_000)], None, Some(Fee::Amount(2_000)), false)
        .await;
    assert!(matches!(result, Err(WalletError::InvalidInput(_))));
    assert_eq!(wallet.balance().await.unwrap(), 60_000);
}

#[tokio::test]
async fn test_utxos_update_reconciles_with_chain() {
    let fx = Fixture::new();
    let mut wallet = fx.create("reconcile", &[], options(WitnessType::Legacy)).await;
    let key = wallet.get_key(None, None, 0).await.unwrap();
    let funding = fx.chain.fund(&key.address, 30_000, Some(99)).await;

    assert_eq!(wallet.utxos_update(None, None).await.unwrap(), 1);
    assert_eq!(wallet.balance().await.unwrap(), 30_000);
    let utxos = wallet.utxos(None, None, 0, None).await.unwrap();
    assert_eq!(utxos[0].txid, funding);
    assert_eq!(utxos[0].confirmations, 2);

    wallet.utxo_add(&key.address, 5_000, &txid(10), 0, 1).await.unwrap();
    assert_eq!(wallet.balance().await.unwrap(), 35_000);
    assert_eq!(wallet.utxos_update(None, None).await.unwrap(), 0);
    assert_eq!(wallet.balance().await.unwrap(), 30_000);
}

#[tokio::test]
async fn test_delete_removes_wallet() {
    let fx = Fixture::new();
    let wallet = fx.create("doomed", &[], options(WitnessType::Legacy)).await;
    let id = wallet.id();
    wallet.delete().await.unwrap();
    assert!(matches!(fx.open("doomed").await, Err(WalletError::NotFound(_))));
    assert!(matches!(fx.open(&id.to_string()).await, Err(WalletError::NotFound(_))));
}
