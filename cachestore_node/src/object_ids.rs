use cachestore_api::{DataServer, Error, Result, RetryPolicy};
use cachestore_id::ObjectId;
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::debug;

/// How many object ids to ask the server for at a time.
pub(crate) const OBJECT_ID_BATCH: u32 = 1000;

/// Hands out ids for new objects from blocks reserved on the server.
#[derive(Debug)]
pub(crate) struct NewObjectIds {
    server: Arc<dyn DataServer>,
    retry: RetryPolicy,
    batch: u32,
    block: Mutex<IdBlock>,
}

#[derive(Debug, Default)]
struct IdBlock {
    next: u64,
    /// One past the last id in the block.
    end: u64,
}

impl NewObjectIds {
    pub(crate) fn new(server: Arc<dyn DataServer>, retry: RetryPolicy, batch: u32) -> Self {
        Self {
            server,
            retry,
            batch: batch.max(1),
            block: Mutex::new(IdBlock::default()),
        }
    }

    pub(crate) fn next(&self) -> Result<ObjectId> {
        let mut block = self.block.lock();
        if block.next >= block.end {
            let first = self
                .retry
                .run("new_object_ids", || self.server.new_object_ids(self.batch))?;
            debug!(first = %first, count = self.batch, "reserved object ids");
            block.next = first.as_u64();
            block.end = first.as_u64() + u64::from(self.batch);
        }
        let oid = ObjectId::new(block.next)
            .map_err(|e| Error::IllegalState(format!("server handed out a bad object id: {e}")))?;
        block.next += 1;
        Ok(oid)
    }
}
