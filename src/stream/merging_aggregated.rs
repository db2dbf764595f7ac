use crate::aggregate::{AggregatedData, Aggregator};
use crate::block::Block;
use crate::error::Result;
use crate::stream::{BlockStream, CancelFlag};

/// Second aggregation phase: folds blocks of aggregate-state columns (the
/// non-final output shape, possibly shipped over the wire) into one local
/// table and emits the combined result.
pub struct MergingAggregatedStream {
    input: Box<dyn BlockStream>,
    aggregator: Aggregator,
    final_: bool,
    executed: bool,
    cancelled: CancelFlag,
}

impl MergingAggregatedStream {
    pub fn new(input: Box<dyn BlockStream>, aggregator: Aggregator, final_: bool) -> Self {
        Self { input, aggregator, final_, executed: false, cancelled: CancelFlag::new() }
    }
}

impl BlockStream for MergingAggregatedStream {
    fn name(&self) -> &'static str {
        "MergingAggregated"
    }

    fn read(&mut self) -> Result<Block> {
        if self.executed || self.cancelled.get() {
            return Ok(Block::new());
        }
        self.executed = true;
        let mut data = AggregatedData::new();
        self.aggregator.merge_stream(self.input.as_mut(), &mut data)?;
        if self.cancelled.get() {
            return Ok(Block::new());
        }
        self.aggregator.convert_to_block(data, self.final_)
    }

    fn read_prefix(&mut self) -> Result<()> {
        Ok(())
    }

    fn cancel(&self) {
        self.cancelled.set();
        self.input.cancel();
    }

    fn is_cancelled(&self) -> bool {
        self.cancelled.get()
    }
}
