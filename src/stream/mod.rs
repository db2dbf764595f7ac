//! Pull-based block streams.
//!
//! Every operator is a source of blocks. The contract:
//! - `read()` returns the next block; an empty block means end-of-stream
//!   and stays empty on further calls
//! - `read_prefix()` / `read_suffix()` run exactly once around a normal
//!   completion; the suffix is skipped after cancellation
//! - `cancel()` is idempotent, sets an atomic flag and recurses into
//!   children; a cancelled stream returns an empty block at its next
//!   checkpoint

pub mod aggregating;
pub mod distinct;
pub mod expression;
pub mod filter;
pub mod limit;
pub mod merging_aggregated;
pub mod merging_sorted;
pub mod profile;
pub mod pushing_to_views;
pub mod sort;

pub use aggregating::AggregatingStream;
pub use distinct::DistinctStream;
pub use expression::ExpressionStream;
pub use filter::FilterStream;
pub use limit::LimitStream;
pub use merging_aggregated::MergingAggregatedStream;
pub use merging_sorted::{AggregatingMergedStream, CollapsingMergedStream, MergingSortedStream, SummingMergedStream};
pub use profile::{ProfileInfo, ProfilingStream, QueryProcess, Quota};
pub use pushing_to_views::PushingToViewsOutput;
pub use sort::{MergeSortingStream, PartialSortingStream, SortColumnDescription};

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::block::Block;
use crate::error::Result;

pub trait BlockStream: Send {
    /// Short operator name for profiling output.
    fn name(&self) -> &'static str;

    fn read(&mut self) -> Result<Block>;

    /// Setup that may fail. Called once before the first read.
    fn read_prefix(&mut self) -> Result<()> {
        Ok(())
    }

    /// Finalization that may fail. Called once after a clean end-of-stream,
    /// never after cancellation.
    fn read_suffix(&mut self) -> Result<()> {
        Ok(())
    }

    /// Asks this stream and its children to stop producing as soon as
    /// possible. Idempotent; may race with `read()`.
    fn cancel(&self);

    fn is_cancelled(&self) -> bool;
}

/// The per-operator cancellation flag.
#[derive(Default)]
pub struct CancelFlag(AtomicBool);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn get(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// A sink for blocks, the write half of the stream protocol.
pub trait BlockOutput: Send {
    fn write(&mut self, block: &Block) -> Result<()>;

    fn write_prefix(&mut self) -> Result<()> {
        Ok(())
    }

    fn write_suffix(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Drives a stream to completion into an output, honoring the
/// prefix/suffix contract on both sides.
pub fn copy_data(from: &mut dyn BlockStream, to: &mut dyn BlockOutput) -> Result<()> {
    from.read_prefix()?;
    to.write_prefix()?;
    loop {
        let block = from.read()?;
        if block.is_empty() || from.is_cancelled() {
            break;
        }
        to.write(&block)?;
    }
    if !from.is_cancelled() {
        from.read_suffix()?;
        to.write_suffix()?;
    }
    Ok(())
}

/// Drains a stream into a list of blocks.
pub fn read_all(stream: &mut dyn BlockStream) -> Result<Vec<Block>> {
    stream.read_prefix()?;
    let mut blocks = Vec::new();
    loop {
        let block = stream.read()?;
        if block.is_empty() {
            break;
        }
        blocks.push(block);
    }
    if !stream.is_cancelled() {
        stream.read_suffix()?;
    }
    Ok(blocks)
}

/// Source producing one in-memory block.
pub struct OneBlockStream {
    block: Option<Block>,
    cancelled: CancelFlag,
}

impl OneBlockStream {
    pub fn new(block: Block) -> Self {
        Self { block: Some(block), cancelled: CancelFlag::new() }
    }
}

impl BlockStream for OneBlockStream {
    fn name(&self) -> &'static str {
        "OneBlock"
    }

    fn read(&mut self) -> Result<Block> {
        if self.cancelled.get() {
            return Ok(Block::new());
        }
        Ok(self.block.take().unwrap_or_default())
    }

    fn cancel(&self) {
        self.cancelled.set();
    }

    fn is_cancelled(&self) -> bool {
        self.cancelled.get()
    }
}

/// Source producing a fixed list of in-memory blocks.
pub struct BlocksStream {
    blocks: VecDeque<Block>,
    cancelled: CancelFlag,
}

impl BlocksStream {
    pub fn new(blocks: Vec<Block>) -> Self {
        Self { blocks: blocks.into(), cancelled: CancelFlag::new() }
    }
}

impl BlockStream for BlocksStream {
    fn name(&self) -> &'static str {
        "Blocks"
    }

    fn read(&mut self) -> Result<Block> {
        if self.cancelled.get() {
            return Ok(Block::new());
        }
        Ok(self.blocks.pop_front().unwrap_or_default())
    }

    fn cancel(&self) {
        self.cancelled.set();
    }

    fn is_cancelled(&self) -> bool {
        self.cancelled.get()
    }
}
