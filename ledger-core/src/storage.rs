//! Write-through journal using RocksDB
//!
//! # Column Families
//!
//! - `wallets` - Latest wallet state (key: wallet_id)
//! - `entries` - Append-only entries (key: wallet_id || sequence_be)
//! - `holds` - Hold records (key: hold_id)
//! - `idempotency` - Recorded request outcomes (key: wallet_id || key)
//!
//! A mutation is written as one `WriteBatch`, so the wallet state, its new
//! entry, the touched hold and the idempotency record land together or not
//! at all.

use crate::{
    config::RocksDBConfig,
    error::{Error, Result},
    ledger::{IdempotencyRecord, Mutation},
    types::{Hold, IdempotencyKey, LedgerEntry, Wallet, WalletId},
};
use rocksdb::{
    ColumnFamily, ColumnFamilyDescriptor, Direction, IteratorMode, Options, WriteBatch,
    WriteOptions, DB,
};
use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};

/// Column family names
const CF_WALLETS: &str = "wallets";
const CF_ENTRIES: &str = "entries";
const CF_HOLDS: &str = "holds";
const CF_IDEMPOTENCY: &str = "idempotency";

/// Everything persisted for one wallet, as loaded at startup
#[derive(Debug)]
pub(crate) struct StoredWallet {
    pub wallet: Wallet,
    pub entries: Vec<LedgerEntry>,
    pub holds: Vec<Hold>,
    pub idempotency: Vec<(IdempotencyKey, IdempotencyRecord)>,
}

/// RocksDB-backed ledger journal
pub struct LedgerStore {
    db: DB,
    path: PathBuf,
    sync_writes: bool,
}

impl fmt::Debug for LedgerStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LedgerStore")
            .field("path", &self.path)
            .field("sync_writes", &self.sync_writes)
            .finish()
    }
}

impl LedgerStore {
    /// Open or create the journal
    pub fn open(path: impl AsRef<Path>, tuning: &RocksDBConfig) -> Result<Self> {
        let path = path.as_ref();
        std::fs::create_dir_all(path)?;

        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_write_buffer_size(tuning.write_buffer_size_mb * 1024 * 1024);
        db_opts.set_max_write_buffer_number(tuning.max_write_buffer_number);
        db_opts.set_max_background_jobs(tuning.max_background_jobs);

        let cf_descriptors = vec![
            ColumnFamilyDescriptor::new(CF_WALLETS, Self::cf_options_lz4()),
            ColumnFamilyDescriptor::new(CF_ENTRIES, Self::cf_options_zstd()),
            ColumnFamilyDescriptor::new(CF_HOLDS, Self::cf_options_lz4()),
            ColumnFamilyDescriptor::new(CF_IDEMPOTENCY, Self::cf_options_lz4()),
        ];

        let db = DB::open_cf_descriptors(&db_opts, path, cf_descriptors)?;

        tracing::info!(path = ?path, "Opened ledger journal");

        Ok(Self {
            db,
            path: path.to_path_buf(),
            sync_writes: tuning.sync_writes,
        })
    }

    fn cf_options_zstd() -> Options {
        let mut opts = Options::default();
        opts.set_compression_type(rocksdb::DBCompressionType::Zstd);
        opts
    }

    fn cf_options_lz4() -> Options {
        let mut opts = Options::default();
        // Point lookups on every mutation, favour speed
        opts.set_compression_type(rocksdb::DBCompressionType::Lz4);
        opts
    }

    fn cf_handle(&self, name: &str) -> Result<&ColumnFamily> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| Error::Storage(format!("Column family {} not found", name)))
    }

    /// Commit one mutation atomically
    pub(crate) fn commit(&self, mutation: &Mutation) -> Result<()> {
        let mut batch = WriteBatch::default();
        let wallet_id = mutation.wallet.wallet_id;

        let cf_wallets = self.cf_handle(CF_WALLETS)?;
        batch.put_cf(
            cf_wallets,
            wallet_id.as_uuid().as_bytes(),
            bincode::serialize(&mutation.wallet)?,
        );

        if let Some(entry) = &mutation.entry {
            let cf_entries = self.cf_handle(CF_ENTRIES)?;
            batch.put_cf(
                cf_entries,
                Self::entry_key(&wallet_id, entry.sequence),
                bincode::serialize(entry)?,
            );
        }

        if let Some(hold) = &mutation.hold {
            let cf_holds = self.cf_handle(CF_HOLDS)?;
            batch.put_cf(
                cf_holds,
                hold.hold_id.as_uuid().as_bytes(),
                bincode::serialize(hold)?,
            );
        }

        if let Some((key, record)) = &mutation.idempotency {
            let cf_idem = self.cf_handle(CF_IDEMPOTENCY)?;
            batch.put_cf(
                cf_idem,
                Self::idempotency_key(&wallet_id, key),
                bincode::serialize(record)?,
            );
        }

        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(self.sync_writes);
        self.db.write_opt(batch, &write_opts)?;

        tracing::trace!(wallet_id = %wallet_id, "Mutation journaled");
        Ok(())
    }

    /// Load every wallet with its entries, holds and idempotency records
    pub(crate) fn load(&self) -> Result<Vec<StoredWallet>> {
        let mut wallets: HashMap<WalletId, StoredWallet> = HashMap::new();

        for item in self.db.iterator_cf(self.cf_handle(CF_WALLETS)?, IteratorMode::Start) {
            let (_, value) = item?;
            let wallet: Wallet = bincode::deserialize(&value)?;
            wallets.insert(
                wallet.wallet_id,
                StoredWallet {
                    wallet,
                    entries: Vec::new(),
                    holds: Vec::new(),
                    idempotency: Vec::new(),
                },
            );
        }

        for stored in wallets.values_mut() {
            stored.entries = self.wallet_entries(&stored.wallet.wallet_id)?;
        }

        for item in self.db.iterator_cf(self.cf_handle(CF_HOLDS)?, IteratorMode::Start) {
            let (_, value) = item?;
            let hold: Hold = bincode::deserialize(&value)?;
            match wallets.get_mut(&hold.wallet_id) {
                Some(stored) => stored.holds.push(hold),
                None => {
                    return Err(Error::Storage(format!(
                        "Hold {} references unknown wallet {}",
                        hold.hold_id, hold.wallet_id
                    )))
                }
            }
        }

        for item in self.db.iterator_cf(self.cf_handle(CF_IDEMPOTENCY)?, IteratorMode::Start) {
            let (key, value) = item?;
            if key.len() < 16 {
                return Err(Error::Storage("Malformed idempotency key".to_string()));
            }
            let wallet_id = WalletId::from_uuid(Self::uuid_prefix(&key)?);
            let idem_key = String::from_utf8(key[16..].to_vec())
                .map_err(|e| Error::Storage(format!("Malformed idempotency key: {}", e)))?;
            let record: IdempotencyRecord = bincode::deserialize(&value)?;
            if let Some(stored) = wallets.get_mut(&wallet_id) {
                stored.idempotency.push((IdempotencyKey::new(idem_key), record));
            }
        }

        let mut loaded: Vec<StoredWallet> = wallets.into_values().collect();
        loaded.sort_by_key(|s| s.wallet.wallet_id);
        Ok(loaded)
    }

    /// Entries of one wallet in sequence order
    pub fn wallet_entries(&self, wallet_id: &WalletId) -> Result<Vec<LedgerEntry>> {
        let cf = self.cf_handle(CF_ENTRIES)?;
        let prefix: &[u8] = wallet_id.as_uuid().as_bytes();

        let mut entries = Vec::new();
        for item in self
            .db
            .iterator_cf(cf, IteratorMode::From(prefix, Direction::Forward))
        {
            let (key, value) = item?;
            if !key.starts_with(prefix) {
                break;
            }
            entries.push(bincode::deserialize(&value)?);
        }
        Ok(entries)
    }

    // Key helpers

    fn entry_key(wallet_id: &WalletId, sequence: u64) -> Vec<u8> {
        let mut key = wallet_id.as_uuid().as_bytes().to_vec();
        key.extend_from_slice(&sequence.to_be_bytes());
        key
    }

    fn idempotency_key(wallet_id: &WalletId, key: &IdempotencyKey) -> Vec<u8> {
        let mut out = wallet_id.as_uuid().as_bytes().to_vec();
        out.extend_from_slice(key.as_str().as_bytes());
        out
    }

    fn uuid_prefix(key: &[u8]) -> Result<uuid::Uuid> {
        let bytes: [u8; 16] = key[..16]
            .try_into()
            .map_err(|_| Error::Storage("Malformed key prefix".to_string()))?;
        Ok(uuid::Uuid::from_bytes(bytes))
    }
}
