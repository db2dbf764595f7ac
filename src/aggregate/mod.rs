//! Hash aggregation over block streams.
//!
//! The aggregator consumes blocks, groups rows by the key columns under
//! one of several key strategies, and keeps per-group function states in
//! an arena. Results can be finalized into plain columns or handed on as
//! aggregate-state columns for a later merge, possibly on another machine.

pub mod arena;
pub mod data;
pub mod function;
pub mod state;

pub use data::{AggregatedData, Method, MethodKind};
pub use function::{create_from_description, create_function, AggregateFunction};

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Arc;
use std::time::Instant;

use crate::aggregate::arena::{Arena, StatePtr};
use crate::aggregate::data::{choose_method, hash128_key, pack128, DeterministicState};
use crate::aggregate::state::{AggregateStateColumn, StatesHolder};
use crate::block::{Block, Column, ColumnWithTypeAndName, DataType, Value};
use crate::config::OverflowMode;
use crate::error::{Error, Result};
use crate::stream::BlockStream;

/// One aggregate to compute: the function, its argument columns (by
/// position, or by name resolved at the first block) and the output name.
pub struct AggregateDescription {
    pub function: Arc<dyn AggregateFunction>,
    pub arguments: Vec<usize>,
    pub argument_names: Vec<String>,
    pub column_name: String,
}

impl AggregateDescription {
    pub fn by_position(
        function: Arc<dyn AggregateFunction>,
        arguments: Vec<usize>,
        column_name: impl Into<String>,
    ) -> Self {
        Self { function, arguments, argument_names: Vec::new(), column_name: column_name.into() }
    }

    pub fn by_name(
        function: Arc<dyn AggregateFunction>,
        argument_names: Vec<String>,
        column_name: impl Into<String>,
    ) -> Self {
        Self { function, arguments: Vec::new(), argument_names, column_name: column_name.into() }
    }
}

/// Something a method table stores per group. The HASHED table keeps the
/// key tuple next to the pointer; everything else stores the bare pointer.
trait GroupSlot {
    fn ptr(&self) -> StatePtr;
    fn ptr_mut(&mut self) -> &mut StatePtr;
}

impl GroupSlot for StatePtr {
    fn ptr(&self) -> StatePtr {
        *self
    }
    fn ptr_mut(&mut self) -> &mut StatePtr {
        self
    }
}

impl GroupSlot for (Vec<Value>, StatePtr) {
    fn ptr(&self) -> StatePtr {
        self.1
    }
    fn ptr_mut(&mut self) -> &mut StatePtr {
        &mut self.1
    }
}

/// What to do with each matched row.
enum RowAction<'a> {
    /// Feed argument columns through `add`.
    Add(&'a [Vec<&'a Column>]),
    /// Fold shipped states through `merge`.
    Merge(&'a [&'a AggregateStateColumn]),
}

pub struct Aggregator {
    keys: Vec<usize>,
    key_names: Vec<String>,
    aggregates: Vec<AggregateDescription>,
    overflow_row: bool,
    max_rows_to_group_by: usize,
    group_by_overflow_mode: OverflowMode,

    functions: Vec<Arc<dyn AggregateFunction>>,
    offsets: Vec<usize>,
    total_size: usize,
    all_trivial: bool,
    layout_ready: bool,
    sample_keys: Vec<(String, DataType)>,
}

impl Aggregator {
    pub fn new(keys: Vec<usize>, aggregates: Vec<AggregateDescription>) -> Self {
        Self {
            keys,
            key_names: Vec::new(),
            aggregates,
            overflow_row: false,
            max_rows_to_group_by: 0,
            group_by_overflow_mode: OverflowMode::Throw,
            functions: Vec::new(),
            offsets: Vec::new(),
            total_size: 0,
            all_trivial: true,
            layout_ready: false,
            sample_keys: Vec::new(),
        }
    }

    pub fn with_key_names(key_names: Vec<String>, aggregates: Vec<AggregateDescription>) -> Self {
        let mut aggregator = Self::new(Vec::new(), aggregates);
        aggregator.key_names = key_names;
        aggregator
    }

    /// Collect rows rejected under the overflow policy into a sentinel
    /// group emitted with default keys.
    pub fn overflow_row(mut self, enabled: bool) -> Self {
        self.overflow_row = enabled;
        self
    }

    pub fn group_by_limit(mut self, max_rows: usize, mode: OverflowMode) -> Self {
        self.max_rows_to_group_by = max_rows;
        self.group_by_overflow_mode = mode;
        self
    }

    pub fn keys_size(&self) -> usize {
        self.keys.len().max(self.key_names.len())
    }

    pub fn aggregates_size(&self) -> usize {
        self.aggregates.len()
    }

    /// Computes state offsets and the total region size. Cheap and
    /// idempotent; everything else waits for the first block.
    fn initialize_layout(&mut self) {
        if self.layout_ready {
            return;
        }
        self.functions = self.aggregates.iter().map(|a| a.function.clone()).collect();
        self.offsets = Vec::with_capacity(self.aggregates.len());
        self.total_size = 0;
        self.all_trivial = true;
        for function in &self.functions {
            self.offsets.push(self.total_size);
            self.total_size += function.state_size();
            if !function.has_trivial_destructor() {
                self.all_trivial = false;
            }
        }
        self.layout_ready = true;
    }

    /// Resolves names into positions and remembers the key layout.
    fn initialize_with_block(&mut self, block: &Block) -> Result<()> {
        self.initialize_layout();
        if self.keys.is_empty() && !self.key_names.is_empty() {
            for name in &self.key_names {
                self.keys.push(block.position_by_name(name)?);
            }
        }
        for aggregate in &mut self.aggregates {
            if aggregate.arguments.is_empty() && !aggregate.argument_names.is_empty() {
                for name in &aggregate.argument_names {
                    aggregate.arguments.push(block.position_by_name(name)?);
                }
            }
        }
        if self.sample_keys.is_empty() {
            for &position in &self.keys {
                let column = block.at(position);
                self.sample_keys.push((column.name.clone(), column.data_type.clone()));
            }
        }
        Ok(())
    }

    /// Constructs every function's state inside a fresh region. If one
    /// constructor fails, the already-built states are rolled back and the
    /// group pointer stays null.
    fn create_states(&self, arena: &mut Arena) -> Result<StatePtr> {
        let ptr = arena.alloc(self.total_size);
        for (j, function) in self.functions.iter().enumerate() {
            let offset = self.offsets[j];
            let size = function.state_size();
            let region = arena.slice_mut(ptr, self.total_size);
            if let Err(e) = function.create(&mut region[offset..offset + size]) {
                for rollback in 0..j {
                    let offset = self.offsets[rollback];
                    let size = self.functions[rollback].state_size();
                    let region = arena.slice_mut(ptr, self.total_size);
                    self.functions[rollback].destroy(&mut region[offset..offset + size]);
                }
                return Err(e);
            }
        }
        Ok(ptr)
    }

    fn apply(&self, arena: &mut Arena, ptr: StatePtr, action: &RowAction, row: usize) -> Result<()> {
        for (j, function) in self.functions.iter().enumerate() {
            let offset = self.offsets[j];
            let size = function.state_size();
            let region = arena.slice_mut(ptr, self.total_size);
            let state = &mut region[offset..offset + size];
            match action {
                RowAction::Add(args) => function.add(state, &args[j], row)?,
                RowAction::Merge(columns) => function.merge(state, columns[j].state_bytes(row)?)?,
            }
        }
        Ok(())
    }

    /// The per-row loop shared by aggregation and stream merging. Returns
    /// false when reading should stop (break overflow mode).
    #[allow(clippy::too_many_arguments)]
    fn process_rows<K, V>(
        &self,
        map: &mut HashMap<K, V, DeterministicState>,
        arena: &mut Arena,
        start_row: usize,
        rows: usize,
        key_of: &mut dyn FnMut(usize) -> Result<K>,
        value_of: &mut dyn FnMut(usize) -> Result<V>,
        action: RowAction,
        no_more_keys: &mut bool,
        overflow_ptr: Option<StatePtr>,
    ) -> Result<bool>
    where
        K: Eq + Hash,
        V: GroupSlot,
    {
        for i in start_row..rows {
            let key = key_of(i)?;

            if !*no_more_keys
                && self.max_rows_to_group_by != 0
                && map.len() >= self.max_rows_to_group_by
                && !map.contains_key(&key)
            {
                match self.group_by_overflow_mode {
                    OverflowMode::Throw => {
                        return Err(Error::LimitExceeded(format!(
                            "too many rows to GROUP BY: {} groups, maximum {}",
                            map.len(),
                            self.max_rows_to_group_by
                        )))
                    }
                    OverflowMode::Break => return Ok(false),
                    // New groups stop being accepted; existing groups keep
                    // aggregating and rejected rows go to the sentinel.
                    OverflowMode::Any => *no_more_keys = true,
                }
            }

            let ptr = if !*no_more_keys {
                match map.entry(key) {
                    Entry::Occupied(e) => e.into_mut().ptr(),
                    Entry::Vacant(v) => {
                        let slot = v.insert(value_of(i)?);
                        let created = self.create_states(arena)?;
                        *slot.ptr_mut() = created;
                        created
                    }
                }
            } else {
                match map.get(&key).map(|v| v.ptr()).or(overflow_ptr) {
                    Some(ptr) => ptr,
                    None => continue,
                }
            };
            self.apply(arena, ptr, &action, i)?;
        }
        Ok(true)
    }

    /// Aggregates one block into `data`. Returns false when reading
    /// further blocks should stop.
    pub fn execute_block(&mut self, block: &Block, data: &mut AggregatedData) -> Result<bool> {
        self.initialize_with_block(block)?;
        data.bind(
            self.functions.clone(),
            self.offsets.clone(),
            self.total_size,
            self.all_trivial,
        );

        let materialized;
        let block = if block.iter().any(|c| c.column.is_const()) {
            materialized = block.materialize()?;
            &materialized
        } else {
            block
        };

        let key_columns: Vec<&Column> = self.keys.iter().map(|&p| &block.at(p).column).collect();
        let arg_columns: Vec<Vec<&Column>> = self
            .aggregates
            .iter()
            .map(|a| a.arguments.iter().map(|&p| &block.at(p).column).collect())
            .collect();
        let rows = block.rows();

        if data.method.is_none() {
            let mut key_sizes = Vec::new();
            let kind = choose_method(&key_columns, &mut key_sizes);
            tracing::trace!(method = kind.name(), "aggregation method");
            data.method = Some(Method::new(kind));
            data.key_sizes = key_sizes;
        }

        let kind = data.kind().unwrap_or(MethodKind::WithoutKey);
        if (kind == MethodKind::WithoutKey || self.overflow_row) && data.without_key.is_none() {
            data.without_key = Some(self.create_states(&mut data.arena)?);
        }

        if kind == MethodKind::WithoutKey {
            let ptr = data
                .without_key
                .ok_or_else(|| Error::Logical("keyless state missing".into()))?;
            // Single count() aggregations account whole blocks at once.
            if self.functions.len() == 1 {
                let offset = self.offsets[0];
                let size = self.functions[0].state_size();
                let region = data.arena.slice_mut(ptr, self.total_size);
                if self.functions[0].add_delta(&mut region[offset..offset + size], rows as u64) {
                    return Ok(true);
                }
            }
            for i in 0..rows {
                self.apply(&mut data.arena, ptr, &RowAction::Add(&arg_columns), i)?;
            }
            return Ok(true);
        }

        let overflow_ptr = if self.overflow_row { data.without_key } else { None };
        let mut no_more_keys = data.no_more_keys;
        let key_sizes = data.key_sizes.clone();
        let (method, arena) = (&mut data.method, &mut data.arena);
        let action = RowAction::Add(&arg_columns);
        let more = match method {
            Some(Method::Key64(map)) => self.process_rows(
                map,
                arena,
                0,
                rows,
                &mut |i| key_columns[0].key_bits(i),
                &mut |_| Ok(StatePtr::NULL),
                action,
                &mut no_more_keys,
                overflow_ptr,
            )?,
            Some(Method::Keys128(map)) => self.process_rows(
                map,
                arena,
                0,
                rows,
                &mut |i| pack128(&key_columns, i, &key_sizes),
                &mut |_| Ok(StatePtr::NULL),
                action,
                &mut no_more_keys,
                overflow_ptr,
            )?,
            Some(Method::KeyString(map)) | Some(Method::KeyFixedString(map)) => self.process_rows(
                map,
                arena,
                0,
                rows,
                &mut |i| Ok(key_columns[0].get_data_at(i)?.to_vec()),
                &mut |_| Ok(StatePtr::NULL),
                action,
                &mut no_more_keys,
                overflow_ptr,
            )?,
            Some(Method::Hashed(map)) => self.process_rows(
                map,
                arena,
                0,
                rows,
                &mut |i| hash128_key(&key_columns, i),
                &mut |i| {
                    let tuple: Vec<Value> = key_columns.iter().map(|c| c.get(i)).collect();
                    Ok((tuple, StatePtr::NULL))
                },
                action,
                &mut no_more_keys,
                overflow_ptr,
            )?,
            Some(Method::WithoutKey) | None => {
                return Err(Error::Logical("unknown aggregated data variant".into()))
            }
        };
        data.no_more_keys = no_more_keys;
        Ok(more)
    }

    /// Consumes a whole stream. The result fits in memory by contract.
    pub fn execute(&mut self, stream: &mut dyn BlockStream, data: &mut AggregatedData) -> Result<()> {
        tracing::trace!("aggregating");
        let started = Instant::now();
        let mut src_rows = 0usize;
        let mut src_bytes = 0usize;

        stream.read_prefix()?;
        loop {
            let block = stream.read()?;
            if block.is_empty() {
                break;
            }
            src_rows += block.rows();
            src_bytes += block.bytes();
            if !self.execute_block(&block, data)? {
                stream.cancel();
                break;
            }
        }
        if !stream.is_cancelled() {
            stream.read_suffix()?;
        }

        tracing::debug!(
            src_rows,
            src_bytes,
            groups = data.size(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "aggregated"
        );
        Ok(())
    }

    /// Turns a result into a block. Final mode runs each function's
    /// finalizer; non-final mode emits aggregate-state columns sharing
    /// ownership of the arena.
    pub fn convert_to_block(&self, mut data: AggregatedData, final_: bool) -> Result<Block> {
        if data.is_empty() {
            return Ok(Block::new());
        }
        let started = Instant::now();
        let rows = data.size();

        let mut key_columns: Vec<Column> = Vec::with_capacity(self.sample_keys.len());
        for (_, data_type) in &self.sample_keys {
            key_columns.push(Column::new(data_type)?);
        }
        let mut groups: Vec<StatePtr> = Vec::with_capacity(rows);

        let kind = data.kind().unwrap_or(MethodKind::WithoutKey);
        if kind == MethodKind::WithoutKey || self.overflow_row {
            if let Some(ptr) = data.without_key {
                for column in key_columns.iter_mut() {
                    column.push_default();
                }
                groups.push(ptr);
            }
        }

        match data.method.as_ref() {
            None | Some(Method::WithoutKey) => {}
            Some(Method::Key64(map)) => {
                for (&key, &ptr) in map.iter() {
                    key_columns[0].push_key_bits(key)?;
                    groups.push(ptr);
                }
            }
            Some(Method::Keys128(map)) => {
                for (&key, &ptr) in map.iter() {
                    let bytes = key.to_le_bytes();
                    let mut offset = 0usize;
                    for (column, &size) in key_columns.iter_mut().zip(data.key_sizes.iter()) {
                        column.push_raw(&bytes[offset..offset + size])?;
                        offset += size;
                    }
                    groups.push(ptr);
                }
            }
            Some(Method::KeyString(map)) | Some(Method::KeyFixedString(map)) => {
                for (key, &ptr) in map.iter() {
                    key_columns[0].push_value(&Value::Bytes(key.clone()))?;
                    groups.push(ptr);
                }
            }
            Some(Method::Hashed(map)) => {
                for (_, (tuple, ptr)) in map.iter() {
                    for (column, value) in key_columns.iter_mut().zip(tuple.iter()) {
                        column.push_value(value)?;
                    }
                    groups.push(*ptr);
                }
            }
        }

        let mut block = Block::new();
        for ((name, data_type), column) in self.sample_keys.iter().zip(key_columns) {
            block.insert(ColumnWithTypeAndName::new(name.clone(), data_type.clone(), column));
        }

        if final_ {
            for (j, aggregate) in self.aggregates.iter().enumerate() {
                let function = &self.functions[j];
                let offset = self.offsets[j];
                let size = function.state_size();
                let mut column = Column::new(&function.result_type())?;
                for &ptr in &groups {
                    let region = data.arena.slice(ptr, self.total_size);
                    function.insert_result(&region[offset..offset + size], &mut column)?;
                }
                block.insert(ColumnWithTypeAndName::new(
                    aggregate.column_name.clone(),
                    function.result_type(),
                    column,
                ));
            }
            // `data` drops here and destroys the states.
        } else {
            // The state columns take shared ownership of the arena.
            data.owns_states = false;
            let arena = std::mem::take(&mut data.arena);
            let holder = Arc::new(StatesHolder::new(
                arena,
                groups.clone(),
                self.functions.clone(),
                self.offsets.clone(),
                self.total_size,
            ));
            for (j, aggregate) in self.aggregates.iter().enumerate() {
                let function = self.functions[j].clone();
                let column = AggregateStateColumn::new(
                    function.clone(),
                    self.offsets[j],
                    holder.clone(),
                    groups.clone(),
                );
                block.insert(ColumnWithTypeAndName::new(
                    aggregate.column_name.clone(),
                    DataType::AggregateState(function.description()),
                    Column::AggregateState(column),
                ));
            }
        }

        block.check_sizes()?;
        tracing::debug!(
            rows,
            bytes = block.bytes(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "converted aggregated data to block"
        );
        Ok(block)
    }

    /// Folds one function's states: merge src into dst, then destroy src.
    fn merge_and_destroy_region(&self, arena: &mut Arena, dst: StatePtr, src: StatePtr) -> Result<()> {
        let mut scratch = vec![0u8; self.total_size];
        scratch.copy_from_slice(arena.slice(src, self.total_size));
        for (j, function) in self.functions.iter().enumerate() {
            let offset = self.offsets[j];
            let size = function.state_size();
            let region = arena.slice_mut(dst, self.total_size);
            function.merge(&mut region[offset..offset + size], &scratch[offset..offset + size])?;
        }
        for (j, function) in self.functions.iter().enumerate() {
            if function.has_trivial_destructor() {
                continue;
            }
            let offset = self.offsets[j];
            let size = function.state_size();
            let region = arena.slice_mut(src, self.total_size);
            function.destroy(&mut region[offset..offset + size]);
        }
        Ok(())
    }

    fn merge_map<K, V>(
        &self,
        dst: &mut HashMap<K, V, DeterministicState>,
        src: HashMap<K, V, DeterministicState>,
        base: u32,
        arena: &mut Arena,
    ) -> Result<()>
    where
        K: Eq + Hash,
        V: GroupSlot,
    {
        for (key, mut value) in src {
            let src_ptr = value.ptr().rebase(base);
            match dst.entry(key) {
                Entry::Occupied(e) => {
                    let dst_ptr = e.get().ptr();
                    if src_ptr.is_null() || dst_ptr.is_null() {
                        continue;
                    }
                    self.merge_and_destroy_region(arena, dst_ptr, src_ptr)?;
                }
                Entry::Vacant(v) => {
                    // New key: transfer ownership of the (rebased) state.
                    *value.ptr_mut() = src_ptr;
                    v.insert(value);
                }
            }
        }
        Ok(())
    }

    /// Two-phase merge of results aggregated separately (for example by
    /// different threads). All inputs must use the same method.
    pub fn merge_many(&mut self, many: Vec<AggregatedData>) -> Result<AggregatedData> {
        if many.is_empty() {
            return Err(Error::InvalidArgument("empty set of aggregated data to merge".into()));
        }
        self.initialize_layout();
        tracing::trace!(results = many.len(), "merging aggregated data");
        let started = Instant::now();

        let mut iter = many.into_iter();
        let mut res = match iter.next() {
            Some(first) => first,
            None => return Err(Error::InvalidArgument("empty set of aggregated data to merge".into())),
        };
        let mut merged_rows = res.size();

        for mut current in iter {
            merged_rows += current.size();
            if current.is_empty() {
                continue;
            }
            if res.is_empty() {
                res = current;
                continue;
            }
            if res.kind() != current.kind() {
                return Err(Error::InvalidArgument(
                    "cannot merge different aggregated data variants".into(),
                ));
            }

            // Absorb the source arena so transferred states stay alive.
            current.owns_states = false;
            let base = res.arena.absorb(std::mem::take(&mut current.arena))?;

            match (res.without_key, current.without_key.take()) {
                (Some(dst), Some(src)) => {
                    self.merge_and_destroy_region(&mut res.arena, dst, src.rebase(base))?
                }
                (None, Some(src)) => res.without_key = Some(src.rebase(base)),
                _ => {}
            }

            match (res.method.as_mut(), current.method.take()) {
                (Some(Method::Key64(dst)), Some(Method::Key64(src))) => {
                    self.merge_map(dst, src, base, &mut res.arena)?
                }
                (Some(Method::Keys128(dst)), Some(Method::Keys128(src))) => {
                    self.merge_map(dst, src, base, &mut res.arena)?
                }
                (Some(Method::KeyString(dst)), Some(Method::KeyString(src))) => {
                    self.merge_map(dst, src, base, &mut res.arena)?
                }
                (Some(Method::KeyFixedString(dst)), Some(Method::KeyFixedString(src))) => {
                    self.merge_map(dst, src, base, &mut res.arena)?
                }
                (Some(Method::Hashed(dst)), Some(Method::Hashed(src))) => {
                    self.merge_map(dst, src, base, &mut res.arena)?
                }
                (Some(Method::WithoutKey), Some(Method::WithoutKey)) | (None, None) => {}
                _ => {
                    return Err(Error::InvalidArgument(
                        "cannot merge different aggregated data variants".into(),
                    ))
                }
            }
        }

        tracing::debug!(
            from_rows = merged_rows,
            to_rows = res.size(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "merged aggregated data"
        );
        Ok(res)
    }

    /// Streaming merge: folds blocks of key columns plus aggregate-state
    /// columns (the non-final output shape) into `data`.
    pub fn merge_stream(&mut self, stream: &mut dyn BlockStream, data: &mut AggregatedData) -> Result<()> {
        self.initialize_layout();
        data.bind(
            self.functions.clone(),
            self.offsets.clone(),
            self.total_size,
            self.all_trivial,
        );
        let keys_size = self.keys_size();

        stream.read_prefix()?;
        loop {
            let block = stream.read()?;
            if block.is_empty() {
                break;
            }
            tracing::trace!(rows = block.rows(), "merging aggregated block");

            if self.sample_keys.is_empty() {
                for i in 0..keys_size {
                    let column = block.at(i);
                    self.sample_keys.push((column.name.clone(), column.data_type.clone()));
                }
            }

            let key_columns: Vec<&Column> = (0..keys_size).map(|i| &block.at(i).column).collect();
            let mut aggregate_columns: Vec<&AggregateStateColumn> = Vec::new();
            for j in 0..self.aggregates.len() {
                match &block.at(keys_size + j).column {
                    Column::AggregateState(column) => aggregate_columns.push(column),
                    other => {
                        return Err(Error::InvalidArgument(format!(
                            "aggregate-state column expected at position {}, got {}",
                            keys_size + j,
                            other.data_type()
                        )))
                    }
                }
            }
            let rows = block.rows();

            if data.method.is_none() {
                let mut key_sizes = Vec::new();
                let kind = choose_method(&key_columns, &mut key_sizes);
                data.method = Some(Method::new(kind));
                data.key_sizes = key_sizes;
            }
            let kind = data.kind().unwrap_or(MethodKind::WithoutKey);

            if kind == MethodKind::WithoutKey || self.overflow_row {
                if data.without_key.is_none() {
                    data.without_key = Some(self.create_states(&mut data.arena)?);
                }
                let ptr = data
                    .without_key
                    .ok_or_else(|| Error::Logical("keyless state missing".into()))?;
                if rows > 0 {
                    self.apply(&mut data.arena, ptr, &RowAction::Merge(&aggregate_columns), 0)?;
                }
            }
            if kind == MethodKind::WithoutKey {
                continue;
            }
            let start_row = if self.overflow_row { 1 } else { 0 };

            let mut no_more_keys = false;
            let key_sizes = data.key_sizes.clone();
            let (method, arena) = (&mut data.method, &mut data.arena);
            let action = RowAction::Merge(&aggregate_columns);
            match method {
                Some(Method::Key64(map)) => self.process_rows(
                    map,
                    arena,
                    start_row,
                    rows,
                    &mut |i| key_columns[0].key_bits(i),
                    &mut |_| Ok(StatePtr::NULL),
                    action,
                    &mut no_more_keys,
                    None,
                )?,
                Some(Method::Keys128(map)) => self.process_rows(
                    map,
                    arena,
                    start_row,
                    rows,
                    &mut |i| pack128(&key_columns, i, &key_sizes),
                    &mut |_| Ok(StatePtr::NULL),
                    action,
                    &mut no_more_keys,
                    None,
                )?,
                Some(Method::KeyString(map)) | Some(Method::KeyFixedString(map)) => self.process_rows(
                    map,
                    arena,
                    start_row,
                    rows,
                    &mut |i| Ok(key_columns[0].get_data_at(i)?.to_vec()),
                    &mut |_| Ok(StatePtr::NULL),
                    action,
                    &mut no_more_keys,
                    None,
                )?,
                Some(Method::Hashed(map)) => self.process_rows(
                    map,
                    arena,
                    start_row,
                    rows,
                    &mut |i| hash128_key(&key_columns, i),
                    &mut |i| {
                        let tuple: Vec<Value> = key_columns.iter().map(|c| c.get(i)).collect();
                        Ok((tuple, StatePtr::NULL))
                    },
                    action,
                    &mut no_more_keys,
                    None,
                )?,
                Some(Method::WithoutKey) | None => {
                    return Err(Error::Logical("unknown aggregated data variant".into()))
                }
            };
        }
        if !stream.is_cancelled() {
            stream.read_suffix()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::BlocksStream;

    fn kv_block(keys: &[&str], values: &[u64]) -> Block {
        let mut k = Column::new(&DataType::String).unwrap();
        for key in keys {
            k.push_value(&Value::Bytes(key.as_bytes().to_vec())).unwrap();
        }
        Block::with_columns(vec![
            ColumnWithTypeAndName::new("k", DataType::String, k),
            ColumnWithTypeAndName::new("v", DataType::UInt64, Column::UInt64(values.to_vec())),
        ])
        .unwrap()
    }

    fn sum_count_aggregator() -> Aggregator {
        Aggregator::new(
            vec![0],
            vec![
                AggregateDescription::by_position(
                    create_function("sum", &[DataType::UInt64]).unwrap(),
                    vec![1],
                    "sum_v",
                ),
                AggregateDescription::by_position(create_function("count", &[]).unwrap(), vec![], "cnt"),
            ],
        )
    }

    fn result_rows(block: &Block) -> Vec<(Vec<u8>, u64, u64)> {
        let mut rows = Vec::new();
        for i in 0..block.rows() {
            let key = match block.at(0).column.get(i) {
                Value::Bytes(b) => b,
                other => panic!("unexpected key {other:?}"),
            };
            let sum = block.at(1).column.get(i).as_u64().unwrap();
            let count = block.at(2).column.get(i).as_u64().unwrap();
            rows.push((key, sum, count));
        }
        rows.sort();
        rows
    }

    #[test]
    fn test_group_by_string_key() {
        // GROUP BY k SELECT k, sum(v), count() over a single block.
        let mut aggregator = sum_count_aggregator();
        let mut data = AggregatedData::new();
        let block = kv_block(&["a", "b", "a", "b", "a"], &[1, 2, 3, 4, 5]);
        assert!(aggregator.execute_block(&block, &mut data).unwrap());
        assert_eq!(data.kind(), Some(MethodKind::KeyString));

        let result = aggregator.convert_to_block(data, true).unwrap();
        assert_eq!(
            result_rows(&result),
            vec![(b"a".to_vec(), 9, 3), (b"b".to_vec(), 6, 2)]
        );
    }

    #[test]
    fn test_hashed_method_multi_key() {
        // Two keys, one of variable length: the HASHED method.
        let mut k2 = Column::new(&DataType::String).unwrap();
        for key in ["x", "x", "y", "x", "x"] {
            k2.push_value(&Value::Bytes(key.as_bytes().to_vec())).unwrap();
        }
        let mut block = kv_block(&["a", "b", "a", "b", "a"], &[1, 2, 3, 4, 5]);
        block.insert(ColumnWithTypeAndName::new("k2", DataType::String, k2));

        let mut aggregator = Aggregator::new(
            vec![0, 2],
            vec![AggregateDescription::by_position(
                create_function("sum", &[DataType::UInt64]).unwrap(),
                vec![1],
                "sum_v",
            )],
        );
        let mut data = AggregatedData::new();
        aggregator.execute_block(&block, &mut data).unwrap();
        assert_eq!(data.kind(), Some(MethodKind::Hashed));
        assert_eq!(data.size(), 3);

        let result = aggregator.convert_to_block(data, true).unwrap();
        assert_eq!(result.rows(), 3);
        assert_eq!(result.columns(), 3);
    }

    #[test]
    fn test_key64_method() {
        let block = Block::with_columns(vec![
            ColumnWithTypeAndName::new("k", DataType::Int32, Column::Int32(vec![-1, 7, -1])),
            ColumnWithTypeAndName::new("v", DataType::UInt64, Column::UInt64(vec![1, 2, 3])),
        ])
        .unwrap();
        let mut aggregator = Aggregator::new(
            vec![0],
            vec![AggregateDescription::by_position(
                create_function("sum", &[DataType::UInt64]).unwrap(),
                vec![1],
                "s",
            )],
        );
        let mut data = AggregatedData::new();
        aggregator.execute_block(&block, &mut data).unwrap();
        assert_eq!(data.kind(), Some(MethodKind::Key64));

        let result = aggregator.convert_to_block(data, true).unwrap();
        let mut seen: Vec<(i64, u64)> = (0..result.rows())
            .map(|i| {
                (
                    result.at(0).column.get(i).as_i64().unwrap(),
                    result.at(1).column.get(i).as_u64().unwrap(),
                )
            })
            .collect();
        seen.sort();
        assert_eq!(seen, vec![(-1, 4), (7, 2)]);
    }

    #[test]
    fn test_overflow_any_keeps_first_group() {
        let mut aggregator =
            sum_count_aggregator().group_by_limit(1, OverflowMode::Any);
        let mut data = AggregatedData::new();
        let block = kv_block(&["a", "b", "a", "b", "a"], &[1, 2, 3, 4, 5]);
        assert!(aggregator.execute_block(&block, &mut data).unwrap());

        let result = aggregator.convert_to_block(data, true).unwrap();
        // One group survives; the other key's rows are dropped.
        assert_eq!(result_rows(&result), vec![(b"a".to_vec(), 9, 3)]);
    }

    #[test]
    fn test_overflow_any_with_overflow_row() {
        let mut aggregator = sum_count_aggregator()
            .group_by_limit(1, OverflowMode::Any)
            .overflow_row(true);
        let mut data = AggregatedData::new();
        let block = kv_block(&["a", "b", "a", "b", "a"], &[1, 2, 3, 4, 5]);
        assert!(aggregator.execute_block(&block, &mut data).unwrap());

        let result = aggregator.convert_to_block(data, true).unwrap();
        // The sentinel group carries the rejected rows under a default key.
        assert_eq!(
            result_rows(&result),
            vec![(b"".to_vec(), 6, 2), (b"a".to_vec(), 9, 3)]
        );
    }

    #[test]
    fn test_overflow_throw_and_break() {
        let mut aggregator = sum_count_aggregator().group_by_limit(1, OverflowMode::Throw);
        let mut data = AggregatedData::new();
        let block = kv_block(&["a", "b"], &[1, 2]);
        assert!(matches!(
            aggregator.execute_block(&block, &mut data),
            Err(Error::LimitExceeded(_))
        ));

        let mut aggregator = sum_count_aggregator().group_by_limit(1, OverflowMode::Break);
        let mut data = AggregatedData::new();
        let block = kv_block(&["a", "b"], &[1, 2]);
        assert!(!aggregator.execute_block(&block, &mut data).unwrap());
    }

    #[test]
    fn test_two_phase_merge_equivalence() {
        // agg(S) == merge(agg(S1), agg(S2)) group-wise.
        let s = kv_block(&["a", "b", "a", "c", "b", "a"], &[1, 2, 3, 4, 5, 6]);
        let s1 = kv_block(&["a", "b", "a"], &[1, 2, 3]);
        let s2 = kv_block(&["c", "b", "a"], &[4, 5, 6]);

        let mut direct_agg = sum_count_aggregator();
        let mut direct = AggregatedData::new();
        direct_agg.execute_block(&s, &mut direct).unwrap();
        let direct_block = direct_agg.convert_to_block(direct, true).unwrap();

        let mut merged_agg = sum_count_aggregator();
        let mut part1 = AggregatedData::new();
        merged_agg.execute_block(&s1, &mut part1).unwrap();
        let mut part2 = AggregatedData::new();
        merged_agg.execute_block(&s2, &mut part2).unwrap();
        let merged = merged_agg.merge_many(vec![part1, part2]).unwrap();
        let merged_block = merged_agg.convert_to_block(merged, true).unwrap();

        assert_eq!(result_rows(&direct_block), result_rows(&merged_block));
    }

    #[test]
    fn test_streamed_merge_of_intermediate_states() {
        // Non-final output of two partial aggregations, folded by a
        // second-phase aggregator reading them as a stream.
        let s1 = kv_block(&["a", "b"], &[1, 2]);
        let s2 = kv_block(&["b", "c"], &[10, 20]);

        let mut phase1 = sum_count_aggregator();
        let mut d1 = AggregatedData::new();
        phase1.execute_block(&s1, &mut d1).unwrap();
        let b1 = phase1.convert_to_block(d1, false).unwrap();
        let mut d2 = AggregatedData::new();
        phase1.execute_block(&s2, &mut d2).unwrap();
        let b2 = phase1.convert_to_block(d2, false).unwrap();

        let mut phase2 = Aggregator::with_key_names(
            vec!["k".into()],
            vec![
                AggregateDescription::by_name(
                    create_function("sum", &[DataType::UInt64]).unwrap(),
                    vec!["v".into()],
                    "sum_v",
                ),
                AggregateDescription::by_name(create_function("count", &[]).unwrap(), vec![], "cnt"),
            ],
        );
        let mut stream = BlocksStream::new(vec![b1, b2]);
        let mut data = AggregatedData::new();
        phase2.merge_stream(&mut stream, &mut data).unwrap();
        let result = phase2.convert_to_block(data, true).unwrap();
        assert_eq!(
            result_rows(&result),
            vec![(b"a".to_vec(), 1, 1), (b"b".to_vec(), 12, 2), (b"c".to_vec(), 20, 1)]
        );
    }

    #[test]
    fn test_merge_different_variants_fails() {
        let string_block = kv_block(&["a"], &[1]);
        let numeric_block = Block::with_columns(vec![
            ColumnWithTypeAndName::new("k", DataType::UInt64, Column::UInt64(vec![1])),
            ColumnWithTypeAndName::new("v", DataType::UInt64, Column::UInt64(vec![1])),
        ])
        .unwrap();

        let mut a1 = sum_count_aggregator();
        let mut d1 = AggregatedData::new();
        a1.execute_block(&string_block, &mut d1).unwrap();

        let mut a2 = sum_count_aggregator();
        let mut d2 = AggregatedData::new();
        a2.execute_block(&numeric_block, &mut d2).unwrap();

        let mut merger = sum_count_aggregator();
        assert!(merger.merge_many(vec![d1, d2]).is_err());
    }

    #[test]
    fn test_uniq_exact_groups_destroyed_cleanly() {
        // Non-trivial states: build, finalize, and let Drop reclaim.
        let mut aggregator = Aggregator::new(
            vec![0],
            vec![AggregateDescription::by_position(
                create_function("uniqExact", &[DataType::UInt64]).unwrap(),
                vec![1],
                "u",
            )],
        );
        let block = kv_block(&["a", "a", "b", "a"], &[1, 1, 5, 2]);
        let mut data = AggregatedData::new();
        aggregator.execute_block(&block, &mut data).unwrap();

        let result = aggregator.convert_to_block(data, true).unwrap();
        let rows: Vec<(Vec<u8>, u64)> = {
            let mut rows: Vec<(Vec<u8>, u64)> = (0..result.rows())
                .map(|i| {
                    let key = match result.at(0).column.get(i) {
                        Value::Bytes(b) => b,
                        other => panic!("unexpected key {other:?}"),
                    };
                    (key, result.at(1).column.get(i).as_u64().unwrap())
                })
                .collect();
            rows.sort();
            rows
        };
        assert_eq!(rows, vec![(b"a".to_vec(), 2), (b"b".to_vec(), 1)]);

        // Dropping a half-finished aggregation must also reclaim states.
        let mut data = AggregatedData::new();
        aggregator.execute_block(&block, &mut data).unwrap();
        drop(data);
    }
}
