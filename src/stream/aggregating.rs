use crate::aggregate::{AggregatedData, Aggregator};
use crate::block::Block;
use crate::error::Result;
use crate::stream::{BlockStream, CancelFlag};

/// Pipeline breaker: consumes its whole input, aggregates it, then emits
/// the result as one block. In final mode the aggregate functions are
/// finalized; otherwise the block carries aggregate-state columns for a
/// downstream merge.
pub struct AggregatingStream {
    input: Box<dyn BlockStream>,
    aggregator: Aggregator,
    final_: bool,
    executed: bool,
    cancelled: CancelFlag,
}

impl AggregatingStream {
    pub fn new(input: Box<dyn BlockStream>, aggregator: Aggregator, final_: bool) -> Self {
        Self { input, aggregator, final_, executed: false, cancelled: CancelFlag::new() }
    }
}

impl BlockStream for AggregatingStream {
    fn name(&self) -> &'static str {
        "Aggregating"
    }

    fn read(&mut self) -> Result<Block> {
        if self.executed || self.cancelled.get() {
            return Ok(Block::new());
        }
        self.executed = true;
        let mut data = AggregatedData::new();
        self.aggregator.execute(self.input.as_mut(), &mut data)?;
        if self.cancelled.get() {
            return Ok(Block::new());
        }
        self.aggregator.convert_to_block(data, self.final_)
    }

    fn read_prefix(&mut self) -> Result<()> {
        // The input's prefix runs inside execute(); nothing to set up here.
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
