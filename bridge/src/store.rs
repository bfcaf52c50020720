// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Typed record stores over the embedded byte-keyed backend.
//!
//! Three logical stores exist, one backend directory each: `metadata`,
//! `eth_transfers` and `kaon_transfers`. Each store serializes one record
//! type with the canonical encoding and owns a single-writer mutex that
//! callers hold across read-modify-write sections. Peer broadcast happens
//! strictly outside the guard so network waits never block other writers.

use crate::encoding::BridgeRecordEncoding;
use crate::error::{BridgeError, BridgeResult};
use crate::types::{BridgeMetadata, EthOriginTransfer, KaonOriginTransfer};
use std::marker::PhantomData;
use std::path::Path;
use tokio::sync::{Mutex, MutexGuard};

/// Store key of the singleton metadata record: the ASCII type name.
pub const METADATA_KEY: &str = "Metadata";

pub struct RecordStore<T> {
    db: sled::Db,
    write_lock: Mutex<()>,
    _record: PhantomData<fn() -> T>,
}

impl<T: BridgeRecordEncoding> RecordStore<T> {
    pub fn open<P: AsRef<Path>>(path: P) -> BridgeResult<Self> {
        let db = sled::open(path.as_ref())
            .map_err(|e| BridgeError::Backend(format!("open {:?}: {}", path.as_ref(), e)))?;
        Ok(Self {
            db,
            write_lock: Mutex::new(()),
            _record: PhantomData,
        })
    }

    /// Exclusive section for a read-modify-write sequence. Dropping the
    /// guard unlocks.
    pub async fn lock(&self) -> MutexGuard<'_, ()> {
        self.write_lock.lock().await
    }

    pub fn get(&self, key: &str) -> BridgeResult<Option<T>> {
        let bytes = self
            .db
            .get(key.as_bytes())
            .map_err(|e| BridgeError::Backend(e.to_string()))?;
        match bytes {
            Some(bytes) => Ok(Some(T::from_canonical_bytes(&bytes)?)),
            None => Ok(None),
        }
    }

    pub fn put(&self, key: &str, record: &T) -> BridgeResult<()> {
        let bytes = record.to_canonical_bytes()?;
        self.db
            .insert(key.as_bytes(), bytes)
            .map_err(|e| BridgeError::Backend(e.to_string()))?;
        Ok(())
    }

    /// Drop every record. Only wired to the `--reset` startup flag.
    pub fn reset(&self) -> BridgeResult<()> {
        self.db
            .clear()
            .map_err(|e| BridgeError::Backend(e.to_string()))
    }

    pub fn flush(&self) -> BridgeResult<()> {
        self.db
            .flush()
            .map(|_| ())
            .map_err(|e| BridgeError::Backend(e.to_string()))
    }
}

pub type MetadataStore = RecordStore<BridgeMetadata>;
pub type EthTransferStore = RecordStore<EthOriginTransfer>;
pub type KaonTransferStore = RecordStore<KaonOriginTransfer>;

impl RecordStore<BridgeMetadata> {
    pub fn get_metadata(&self) -> BridgeResult<Option<BridgeMetadata>> {
        self.get(METADATA_KEY)
    }

    pub fn put_metadata(&self, metadata: &BridgeMetadata) -> BridgeResult<()> {
        self.put(METADATA_KEY, metadata)
    }
}
