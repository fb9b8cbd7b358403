//! Raw buffers and the key multiplexer.
//!
//! - [`RawBuffer`]: one pre-sized table, a write cursor and output routing
//! - [`RawBufferList`]: the buffers one decoder writes to, indexed by key
//! - [`RawBufferLibrary`]: lists by decoder name, with a `"*"` fallback list
//!
//! A buffer moves through `Empty -> Filling -> Full -> Flushed (loc = 0)`.
//! Decoders only ever write at the cursor; the caller observes fullness and
//! runs the flush pass.

use crate::config::BufferTemplate;
use crate::schema::Schema;
use crate::table::Table;
use daq_core::{limits, BufferKey, ConfigError, PacketError, SchemaError};
use once_cell::unsync::OnceCell;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use tracing::{debug, warn};

/// List name matching any decoder without a list of its own.
pub const WILDCARD_LIST: &str = "*";

/// Schema provider consulted when buffers are allocated.
///
/// Every decoder implements this; the buffer layer does not need to know
/// anything else about it.
pub trait SchemaSource {
    /// Decoder name; also the name of its buffer list.
    fn name(&self) -> &str;

    /// Partitions of keys that share one schema.
    ///
    /// Decoders without per-channel variation return `[[BufferKey::Any]]`.
    fn key_groups(&self) -> Vec<Vec<BufferKey>> {
        vec![vec![BufferKey::Any]]
    }

    fn schema(&self, key: &BufferKey) -> Result<Schema, SchemaError>;

    /// Upper bound on rows written into one buffer by one packet.
    fn max_rows_per_packet(&self) -> usize {
        1
    }
}

// =============================================================================
// RawBuffer
// =============================================================================

/// A table plus the metadata needed to fill and route it.
#[derive(Debug, Clone, PartialEq)]
pub struct RawBuffer {
    /// Allocated by the owning decoder; `None` until then.
    pub table: Option<Table>,
    pub key_list: Vec<BufferKey>,
    /// `destination[:group]`.
    pub out_stream: String,
    pub out_name: String,
    /// Opaque post-processing instructions, carried through untouched.
    pub proc_spec: Option<Value>,
    /// Next row to write.
    pub loc: usize,
    pub fill_safety: usize,
    /// Unexpanded templates for a buffer whose keys are still a wildcard.
    pub(crate) template: Option<BufferTemplate>,
}

impl RawBuffer {
    pub fn new(
        key_list: Vec<BufferKey>,
        out_stream: impl Into<String>,
        out_name: impl Into<String>,
    ) -> Self {
        Self {
            table: None,
            key_list,
            out_stream: out_stream.into(),
            out_name: out_name.into(),
            proc_spec: None,
            loc: 0,
            fill_safety: limits::DEFAULT_FILL_SAFETY,
            template: None,
        }
    }

    pub fn with_table(mut self, table: Table) -> Self {
        self.table = Some(table);
        self
    }

    pub fn with_proc_spec(mut self, proc_spec: Value) -> Self {
        self.proc_spec = Some(proc_spec);
        self
    }

    /// Row capacity; zero while unallocated.
    pub fn capacity(&self) -> usize {
        self.table.as_ref().map_or(0, Table::size)
    }

    pub fn is_full(&self) -> bool {
        self.capacity().saturating_sub(self.loc) < self.fill_safety
    }

    pub fn is_empty(&self) -> bool {
        self.loc == 0
    }

    /// Keys still waiting for a decoder's key groups.
    pub fn has_wildcard_keys(&self) -> bool {
        self.key_list.len() == 1 && self.key_list[0].is_any()
    }

    /// Index of the next free row.
    ///
    /// Fails with `BufferOverflow` when no row is left; the cursor is not
    /// touched either way. Call [`RawBuffer::commit_row`] after the row is
    /// written.
    pub fn claim_row(&self) -> Result<usize, PacketError> {
        let capacity = self.capacity();
        if self.loc >= capacity {
            return Err(PacketError::BufferOverflow {
                key: self.key_list.first().cloned().unwrap_or(BufferKey::Any),
                capacity,
            });
        }
        Ok(self.loc)
    }

    pub fn commit_row(&mut self) {
        self.loc += 1;
    }

    pub fn table_mut(&mut self) -> Option<&mut Table> {
        self.table.as_mut()
    }

    /// Reset the cursor. The table keeps its allocation.
    pub fn clear(&mut self) {
        self.loc = 0;
    }
}

// =============================================================================
// RawBufferList
// =============================================================================

/// The buffers one decoder writes to.
///
/// Keys map injectively onto buffers; a key claimed twice is rejected at
/// construction. The key index is built on first lookup and kept until the
/// key lists change.
#[derive(Debug, Clone)]
pub struct RawBufferList {
    name: String,
    buffers: Vec<RawBuffer>,
    index: OnceCell<HashMap<BufferKey, usize>>,
}

impl RawBufferList {
    pub fn new(name: impl Into<String>, buffers: Vec<RawBuffer>) -> Result<Self, ConfigError> {
        let name = name.into();
        check_unique_keys(&name, &buffers)?;
        Ok(Self {
            name,
            buffers,
            index: OnceCell::new(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn len(&self) -> usize {
        self.buffers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffers.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &RawBuffer> {
        self.buffers.iter()
    }

    /// Mutable access to every buffer. Key lists must not be edited through
    /// this; use [`RawBufferList::replace_buffers`] instead.
    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut RawBuffer> {
        self.buffers.iter_mut()
    }

    /// Swap in a new set of buffers, re-checking key uniqueness.
    pub fn replace_buffers(&mut self, buffers: Vec<RawBuffer>) -> Result<(), ConfigError> {
        check_unique_keys(&self.name, &buffers)?;
        self.buffers = buffers;
        self.index = OnceCell::new();
        Ok(())
    }

    pub(crate) fn take_buffers(&mut self) -> Vec<RawBuffer> {
        self.index = OnceCell::new();
        std::mem::take(&mut self.buffers)
    }

    pub(crate) fn rename(&mut self, name: &str) {
        self.name = name.to_string();
    }

    fn index(&self) -> &HashMap<BufferKey, usize> {
        self.index.get_or_init(|| {
            let mut index = HashMap::new();
            for (i, buffer) in self.buffers.iter().enumerate() {
                for key in &buffer.key_list {
                    index.insert(key.clone(), i);
                }
            }
            debug!(list = %self.name, keys = index.len(), "Built key index");
            index
        })
    }

    fn position(&self, key: &BufferKey) -> Option<usize> {
        let index = self.index();
        index
            .get(key)
            .or_else(|| index.get(&BufferKey::Any))
            .copied()
    }

    /// Buffer routed for `key`. A buffer keyed `Any` catches keys nobody else claims.
    pub fn buffer_for(&self, key: &BufferKey) -> Option<&RawBuffer> {
        let i = self.position(key)?;
        self.buffers.get(i)
    }

    pub fn buffer_for_mut(&mut self, key: &BufferKey) -> Option<&mut RawBuffer> {
        let i = self.position(key)?;
        self.buffers.get_mut(i)
    }

    pub fn contains_key(&self, key: &BufferKey) -> bool {
        self.position(key).is_some()
    }

    pub fn any_full(&self) -> bool {
        self.buffers.iter().any(RawBuffer::is_full)
    }

    pub fn all_full(&self) -> bool {
        self.buffers.iter().all(RawBuffer::is_full)
    }

    /// Reset the cursor of every full buffer; returns how many were reset.
    pub fn clear_full(&mut self) -> usize {
        let mut cleared = 0;
        for buffer in self.buffers.iter_mut().filter(|b| b.is_full()) {
            buffer.clear();
            cleared += 1;
        }
        cleared
    }

    /// Distinct output streams, in buffer order.
    pub fn out_streams(&self) -> Vec<&str> {
        let mut streams: Vec<&str> = Vec::new();
        for buffer in &self.buffers {
            if !streams.contains(&buffer.out_stream.as_str()) {
                streams.push(&buffer.out_stream);
            }
        }
        streams
    }

    /// Allocate every buffer's table from `source`.
    ///
    /// The keys of one buffer must lie within one key group of the source.
    /// Each buffer gets `fill_safety = max(1, max_rows_per_packet)`, and
    /// `size` must be at least that.
    pub fn allocate_from(&mut self, source: &dyn SchemaSource, size: usize) -> Result<(), ConfigError> {
        let groups = source.key_groups();
        let fill_safety = source.max_rows_per_packet().max(1);
        for buffer in &mut self.buffers {
            if buffer.key_list.is_empty() {
                warn!(list = %self.name, buffer = %buffer.out_name, "Buffer has no keys, not allocating");
                continue;
            }
            if size < fill_safety {
                return Err(ConfigError::CapacityBelowSafety {
                    buffer: buffer.out_name.clone(),
                    capacity: size,
                    fill_safety,
                });
            }
            allocate_buffer(source, &groups, buffer, size, fill_safety)?;
        }
        Ok(())
    }

    /// Allocate the buffers that have no table yet and whose keys `source`
    /// can already describe.
    ///
    /// Buffers whose keys the source does not know yet stay unallocated and
    /// are retried on the next call. Returns the number of buffers allocated.
    pub fn allocate_pending(&mut self, source: &dyn SchemaSource, size: usize) -> Result<usize, ConfigError> {
        let groups = source.key_groups();
        let fill_safety = source.max_rows_per_packet().max(1);
        let mut allocated = 0;
        for buffer in self.buffers.iter_mut().filter(|b| b.table.is_none() && !b.key_list.is_empty()) {
            if size < fill_safety {
                return Err(ConfigError::CapacityBelowSafety {
                    buffer: buffer.out_name.clone(),
                    capacity: size,
                    fill_safety,
                });
            }
            match allocate_buffer(source, &groups, buffer, size, fill_safety) {
                Ok(()) => allocated += 1,
                Err(ConfigError::Schema(
                    SchemaError::UnknownKey { .. } | SchemaError::SchemaNotBuilt { .. },
                )) => {
                    debug!(decoder = source.name(), buffer = %buffer.out_name, "Keys not known yet, deferring allocation");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(allocated)
    }
}

fn allocate_buffer(
    source: &dyn SchemaSource,
    groups: &[Vec<BufferKey>],
    buffer: &mut RawBuffer,
    size: usize,
    fill_safety: usize,
) -> Result<(), ConfigError> {
    let key = schema_key(source, groups, buffer)?;
    let schema = source.schema(&key)?;
    buffer.table = Some(schema.allocate(size)?);
    buffer.fill_safety = fill_safety;
    buffer.loc = 0;
    debug!(
        decoder = source.name(),
        buffer = %buffer.out_name,
        size,
        fill_safety,
        "Allocated buffer"
    );
    Ok(())
}

/// Key whose schema a buffer is allocated with.
fn schema_key(
    source: &dyn SchemaSource,
    groups: &[Vec<BufferKey>],
    buffer: &RawBuffer,
) -> Result<BufferKey, ConfigError> {
    if buffer.has_wildcard_keys() {
        return Ok(BufferKey::Any);
    }
    let group_of = |key: &BufferKey| groups.iter().position(|g| g.contains(key));
    let first = &buffer.key_list[0];
    let Some(group) = group_of(first) else {
        return Err(SchemaError::UnknownKey {
            decoder: source.name().to_string(),
            key: first.clone(),
        }
        .into());
    };
    for key in &buffer.key_list[1..] {
        match group_of(key) {
            Some(g) if g == group => {}
            Some(_) => {
                return Err(ConfigError::KeysSpanGroups {
                    decoder: source.name().to_string(),
                    buffer: buffer.out_name.clone(),
                })
            }
            None => {
                return Err(SchemaError::UnknownKey {
                    decoder: source.name().to_string(),
                    key: key.clone(),
                }
                .into())
            }
        }
    }
    Ok(first.clone())
}

fn check_unique_keys(list: &str, buffers: &[RawBuffer]) -> Result<(), ConfigError> {
    let mut seen = HashMap::new();
    for (i, buffer) in buffers.iter().enumerate() {
        for key in &buffer.key_list {
            if seen.insert(key, i).is_some() {
                return Err(ConfigError::DuplicateKey {
                    list: list.to_string(),
                    key: key.clone(),
                });
            }
        }
    }
    Ok(())
}

// =============================================================================
// RawBufferLibrary
// =============================================================================

/// Buffer lists by decoder name.
#[derive(Debug, Clone, Default)]
pub struct RawBufferLibrary {
    lists: BTreeMap<String, RawBufferList>,
}

impl RawBufferLibrary {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, list: RawBufferList) {
        self.lists.insert(list.name().to_string(), list);
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.lists.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = &RawBufferList> {
        self.lists.values()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut RawBufferList> {
        self.lists.values_mut()
    }

    /// The list for `decoder`, falling back to the `"*"` list.
    pub fn get(&self, decoder: &str) -> Option<&RawBufferList> {
        self.lists
            .get(decoder)
            .or_else(|| self.lists.get(WILDCARD_LIST))
    }

    pub fn get_mut(&mut self, decoder: &str) -> Option<&mut RawBufferList> {
        if self.lists.contains_key(decoder) {
            self.lists.get_mut(decoder)
        } else {
            self.lists.get_mut(WILDCARD_LIST)
        }
    }

    /// Bind wildcard lists and keys to a concrete decoder.
    ///
    /// If `source` has no list of its own, the `"*"` list is copied under the
    /// decoder's name with `{name}` replaced by it. Buffers keyed `"*"` then
    /// take the decoder's keys: one buffer per key when the buffer name has a
    /// `{key}` template, otherwise the single key group's keys.
    pub fn resolve_wildcards(&mut self, source: &dyn SchemaSource) -> Result<(), ConfigError> {
        let decoder = source.name();
        if !self.lists.contains_key(decoder) {
            let Some(wildcard) = self.lists.get(WILDCARD_LIST) else {
                return Ok(());
            };
            let mut list = wildcard.clone();
            list.rename(decoder);
            let buffers = list
                .take_buffers()
                .into_iter()
                .map(|b| crate::config::bind_list_name(b, decoder))
                .collect();
            list.replace_buffers(buffers)?;
            self.lists.insert(decoder.to_string(), list);
        }

        let groups = source.key_groups();
        let any_only = groups.len() == 1 && groups[0] == [BufferKey::Any];
        let Some(list) = self.lists.get_mut(decoder) else {
            return Ok(());
        };
        let mut resolved = Vec::new();
        for buffer in list.take_buffers() {
            if buffer.has_wildcard_keys() && (buffer.template.is_some() || !any_only) {
                resolved.extend(crate::config::bind_keys(buffer, decoder, &groups)?);
            } else {
                resolved.push(buffer);
            }
        }
        list.replace_buffers(resolved)
    }

    pub fn any_full(&self) -> bool {
        self.lists.values().any(RawBufferList::any_full)
    }

    pub fn all_full(&self) -> bool {
        self.lists.values().all(RawBufferList::all_full)
    }

    pub fn clear_full(&mut self) -> usize {
        self.lists.values_mut().map(RawBufferList::clear_full).sum()
    }

    /// Distinct output streams over all lists.
    pub fn out_streams(&self) -> Vec<&str> {
        let mut streams: Vec<&str> = Vec::new();
        for stream in self.lists.values().flat_map(RawBufferList::out_streams) {
            if !streams.contains(&stream) {
                streams.push(stream);
            }
        }
        streams
    }
}
