//! In-memory partition store
//!
//! Reference [`RequestHandler`] behind the table protocol. Each partition is a
//! separately locked map of tables, so worker reactors serving different
//! partitions never contend.

use crate::error::{Result, RpcError};
use crate::server::RequestHandler;
use parking_lot::Mutex;
use std::collections::HashMap;
use tpc_codec::{FrameHeader, IoBuffer, Opcode};

#[derive(Default)]
struct TableData {
    entries: HashMap<Vec<u8>, Vec<u8>>,
    items: HashMap<i64, (i32, i32)>,
}

impl TableData {
    fn len(&self) -> usize {
        self.entries.len() + self.items.len()
    }
}

type Partition = HashMap<String, TableData>;

/// Per-partition maps of named tables
pub struct MemoryStore {
    partitions: Vec<Mutex<Partition>>,
}

impl MemoryStore {
    pub fn new(partition_count: u32) -> Self {
        Self {
            partitions: (0..partition_count).map(|_| Mutex::new(HashMap::new())).collect(),
        }
    }

    pub fn partition_count(&self) -> u32 {
        self.partitions.len() as u32
    }

    /// Entries and items held by `table` across all partitions
    pub fn len(&self, table: &str) -> usize {
        self.partitions
            .iter()
            .map(|partition| partition.lock().get(table).map_or(0, TableData::len))
            .sum()
    }

    pub fn is_empty(&self, table: &str) -> bool {
        self.len(table) == 0
    }

    /// Upserted item, wherever it lives
    pub fn item(&self, table: &str, key: i64) -> Option<(i32, i32)> {
        self.partitions
            .iter()
            .find_map(|partition| partition.lock().get(table)?.items.get(&key).copied())
    }

    fn partition(&self, partition_id: u32) -> Result<&Mutex<Partition>> {
        self.partitions
            .get(partition_id as usize)
            .ok_or_else(|| RpcError::invalid_partition(partition_id, self.partition_count()))
    }
}

impl RequestHandler for MemoryStore {
    fn handle(&self, header: &FrameHeader, payload: &mut IoBuffer, response: &mut IoBuffer) -> Result<()> {
        let partition = self.partition(header.partition_id)?;
        if header.opcode == Opcode::Noop {
            return Ok(());
        }

        let table = payload
            .read_string()?
            .ok_or_else(|| RpcError::malformed("missing table name"))?;
        let mut partition = partition.lock();

        match header.opcode {
            Opcode::Noop => {}
            Opcode::Get => {
                let key = read_key(payload)?;
                let value = partition
                    .get(&table)
                    .and_then(|data| data.entries.get(&key));
                response.write_sized_bytes(value.map(Vec::as_slice))?;
            }
            Opcode::Set => {
                let key = read_key(payload)?;
                let data = partition.entry(table).or_default();
                match payload.read_sized_bytes()? {
                    Some(value) => {
                        data.entries.insert(key, value);
                    }
                    None => {
                        data.entries.remove(&key);
                    }
                }
            }
            Opcode::TableUpsert => {
                let key = payload.read_i64()?;
                let a = payload.read_i32()?;
                let b = payload.read_i32()?;
                partition.entry(table).or_default().items.insert(key, (a, b));
            }
            Opcode::Query => {
                let count = partition.get(&table).map_or(0, TableData::len);
                response.write_i64(count as i64);
            }
        }
        Ok(())
    }
}

fn read_key(payload: &mut IoBuffer) -> Result<Vec<u8>> {
    payload
        .read_sized_bytes()?
        .ok_or_else(|| RpcError::malformed("null key"))
}
