//! Key/value table over partitions
//!
//! Every request payload starts with the table name as a size-prefixed
//! string, followed by the operation's fields:
//!
//! | Opcode         | Request fields               | Response payload        |
//! |----------------|------------------------------|-------------------------|
//! | `Noop`         | none                         | empty                   |
//! | `Get`          | sized key                    | sized value, `-1` absent |
//! | `Set`          | sized key, sized value       | empty                   |
//! | `TableUpsert`  | i64 key, i32 a, i32 b        | empty                   |
//! | `Query`        | none                         | i64 entry count         |
//!
//! Batched calls submit every request before awaiting any of them, so one
//! stalled partition delays only its own result.

use crate::actor_ref::ResponseFuture;
use crate::client::RpcClient;
use crate::error::{Result, RpcError};
use futures::future::join_all;
use rand::Rng;
use std::sync::Arc;
use tpc_codec::{
    construct_complete, write_request_header, BufferAllocator, BufferError, Frame, IoBuffer, Opcode,
    HEADER_SIZE,
};
use tracing::trace;

/// Row of the upsert benchmark table
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Item {
    pub key: i64,
    pub a: i32,
    pub b: i32,
}

impl Item {
    pub const ENCODED_LEN: usize = 16;
}

/// Named table reached through an [`RpcClient`]
#[derive(Clone, Debug)]
pub struct Table {
    name: String,
    client: Arc<RpcClient>,
}

impl Table {
    pub fn new(name: impl Into<String>, client: Arc<RpcClient>) -> Self {
        Self {
            name: name.into(),
            client,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn client(&self) -> &Arc<RpcClient> {
        &self.client
    }

    /// Round trip to one partition without touching data
    pub async fn noop(&self, partition_id: u32) -> Result<()> {
        let request = self.request(partition_id, Opcode::Noop, 0, |_| Ok(()))?;
        let response = self.submit(partition_id, request)?.await?;
        expect_opcode(&response, Opcode::Noop)
    }

    /// Noop against a random partition; returns the partition used
    pub async fn noop_random(&self) -> Result<u32> {
        let partition_id = rand::thread_rng().gen_range(0..self.client.partition_count());
        self.noop(partition_id).await?;
        Ok(partition_id)
    }

    /// `concurrency` noops to one partition in flight at once
    pub async fn concurrent_noop(&self, concurrency: usize, partition_id: u32) -> Result<()> {
        let mut futures = Vec::with_capacity(concurrency);
        for _ in 0..concurrency {
            let request = self.request(partition_id, Opcode::Noop, 0, |_| Ok(()))?;
            futures.push(self.submit(partition_id, request)?);
        }
        first_error(join_all(futures).await, Opcode::Noop)
    }

    pub async fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let partition_id = self.client.partition_for_key(key);
        let request = self.request(partition_id, Opcode::Get, 4 + key.len(), |buffer| {
            buffer.write_sized_bytes(Some(key))
        })?;
        let mut response = self.submit(partition_id, request)?.await?;
        expect_opcode(&response, Opcode::Get)?;
        Ok(response.buffer_mut().read_sized_bytes()?)
    }

    pub async fn set(&self, key: &[u8], value: &[u8]) -> Result<()> {
        let partition_id = self.client.partition_for_key(key);
        let request = self.request(partition_id, Opcode::Set, 8 + key.len() + value.len(), |buffer| {
            write_set(buffer, key, value)
        })?;
        let response = self.submit(partition_id, request)?.await?;
        expect_opcode(&response, Opcode::Set)
    }

    pub async fn upsert(&self, item: Item) -> Result<()> {
        let partition_id = self.client.partition_for_key(&item.key);
        let request = self.upsert_request(partition_id, item)?;
        let response = self.submit(partition_id, request)?.await?;
        expect_opcode(&response, Opcode::TableUpsert)
    }

    /// Upsert a batch; every item is attempted and the first failure reported
    pub async fn upsert_all(&self, items: &[Item]) -> Result<()> {
        let mut futures = Vec::with_capacity(items.len());
        for item in items {
            let partition_id = self.client.partition_for_key(&item.key);
            let request = self.upsert_request(partition_id, *item)?;
            futures.push(self.submit(partition_id, request)?);
        }
        first_error(join_all(futures).await, Opcode::TableUpsert)
    }

    /// Entry count of the table summed over all partitions
    pub async fn query_all(&self) -> Result<u64> {
        let partitions = self.client.partition_count();
        let mut futures = Vec::with_capacity(partitions as usize);
        for partition_id in 0..partitions {
            let request = self.request(partition_id, Opcode::Query, 0, |_| Ok(()))?;
            futures.push(self.submit(partition_id, request)?);
        }

        let mut total = 0u64;
        for response in join_all(futures).await {
            let mut response = response?;
            expect_opcode(&response, Opcode::Query)?;
            let count = response.buffer_mut().read_i64()?;
            total += u64::try_from(count).map_err(|_| {
                RpcError::unexpected_response("non-negative count", count.to_string())
            })?;
        }
        Ok(total)
    }

    pub fn new_pipeline(&self) -> Pipeline {
        Pipeline {
            table: self.clone(),
            requests: Vec::new(),
        }
    }

    fn submit(&self, partition_id: u32, request: IoBuffer) -> Result<ResponseFuture> {
        self.client.partition_ref(partition_id)?.submit(request)
    }

    fn upsert_request(&self, partition_id: u32, item: Item) -> Result<IoBuffer> {
        self.request(partition_id, Opcode::TableUpsert, Item::ENCODED_LEN, |buffer| {
            buffer.write_i64(item.key);
            buffer.write_i32(item.a);
            buffer.write_i32(item.b);
            Ok(())
        })
    }

    /// Complete request frame: header, table name, then `fields`
    fn request(
        &self,
        partition_id: u32,
        opcode: Opcode,
        fields_len: usize,
        fields: impl FnOnce(&mut IoBuffer) -> std::result::Result<(), BufferError>,
    ) -> Result<IoBuffer> {
        if partition_id >= self.client.partition_count() {
            return Err(RpcError::invalid_partition(
                partition_id,
                self.client.partition_count(),
            ));
        }
        let mut buffer = self
            .client
            .allocator()
            .allocate(HEADER_SIZE + 4 + self.name.len() + fields_len);
        write_request_header(&mut buffer, partition_id, opcode);
        buffer.write_string(&self.name)?;
        fields(&mut buffer)?;
        construct_complete(&mut buffer)?;
        Ok(buffer)
    }
}

fn write_set(buffer: &mut IoBuffer, key: &[u8], value: &[u8]) -> std::result::Result<(), BufferError> {
    buffer.write_sized_bytes(Some(key))?;
    buffer.write_sized_bytes(Some(value))
}

fn expect_opcode(response: &Frame, expected: Opcode) -> Result<()> {
    if response.opcode() == expected {
        Ok(())
    } else {
        Err(RpcError::unexpected_response(
            format!("{expected:?}"),
            format!("{:?}", response.opcode()),
        ))
    }
}

fn first_error(results: Vec<Result<Frame>>, expected: Opcode) -> Result<()> {
    let mut first = None;
    for result in results {
        let checked = result.and_then(|frame| expect_opcode(&frame, expected));
        if let Err(e) = checked {
            first.get_or_insert(e);
        }
    }
    first.map_or(Ok(()), Err)
}

/// Requests prepared up front and executed as one batch
///
/// Results come back in the order the requests were added; a failed or
/// timed-out request does not hold back the others.
#[derive(Debug)]
pub struct Pipeline {
    table: Table,
    requests: Vec<(u32, IoBuffer)>,
}

impl Pipeline {
    pub fn noop(&mut self, partition_id: u32) -> Result<&mut Self> {
        let request = self.table.request(partition_id, Opcode::Noop, 0, |_| Ok(()))?;
        self.requests.push((partition_id, request));
        Ok(self)
    }

    pub fn get(&mut self, key: &[u8]) -> Result<&mut Self> {
        let partition_id = self.table.client.partition_for_key(key);
        let request = self
            .table
            .request(partition_id, Opcode::Get, 4 + key.len(), |buffer| {
                buffer.write_sized_bytes(Some(key))
            })?;
        self.requests.push((partition_id, request));
        Ok(self)
    }

    pub fn set(&mut self, key: &[u8], value: &[u8]) -> Result<&mut Self> {
        let partition_id = self.table.client.partition_for_key(key);
        let request = self.table.request(
            partition_id,
            Opcode::Set,
            8 + key.len() + value.len(),
            |buffer| write_set(buffer, key, value),
        )?;
        self.requests.push((partition_id, request));
        Ok(self)
    }

    pub fn upsert(&mut self, item: Item) -> Result<&mut Self> {
        let partition_id = self.table.client.partition_for_key(&item.key);
        let request = self.table.upsert_request(partition_id, item)?;
        self.requests.push((partition_id, request));
        Ok(self)
    }

    pub fn len(&self) -> usize {
        self.requests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.requests.is_empty()
    }

    /// Submit everything, then wait for all responses
    pub async fn execute(self) -> Vec<Result<Frame>> {
        let Pipeline { table, requests } = self;
        trace!(table = %table.name, requests = requests.len(), "Executing pipeline");
        let pending: Vec<_> = requests
            .into_iter()
            .map(|(partition_id, request)| table.submit(partition_id, request))
            .collect();
        join_all(pending.into_iter().map(|submitted| async move { submitted?.await })).await
    }
}
