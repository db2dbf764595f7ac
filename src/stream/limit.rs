use crate::block::Block;
use crate::error::Result;
use crate::stream::{BlockStream, CancelFlag};

/// Emits at most `limit` rows after skipping `offset`, then cancels its
/// input.
pub struct LimitStream {
    input: Box<dyn BlockStream>,
    limit: usize,
    offset: usize,
    /// Rows of input consumed so far.
    pos: usize,
    done: bool,
    cancelled: CancelFlag,
}

impl LimitStream {
    pub fn new(input: Box<dyn BlockStream>, limit: usize, offset: usize) -> Self {
        Self { input, limit, offset, pos: 0, done: false, cancelled: CancelFlag::new() }
    }
}

impl BlockStream for LimitStream {
    fn name(&self) -> &'static str {
        "Limit"
    }

    fn read(&mut self) -> Result<Block> {
        loop {
            if self.done || self.cancelled.get() {
                return Ok(Block::new());
            }
            let block = self.input.read()?;
            if block.is_empty() {
                self.done = true;
                return Ok(block);
            }
            let rows = block.rows();
            let block_start = self.pos;
            self.pos += rows;

            let emit_from = self.offset.max(block_start);
            let emit_to = (self.offset + self.limit).min(self.pos);
            if self.pos >= self.offset + self.limit {
                self.done = true;
                self.input.cancel();
            }
            if emit_from >= emit_to {
                if self.done {
                    return Ok(Block::new());
                }
                continue;
            }
            if emit_from == block_start && emit_to == self.pos {
                return Ok(block);
            }
            return block.cut(emit_from - block_start, emit_to - emit_from);
        }
    }

    fn read_prefix(&mut self) -> Result<()> {
        self.input.read_prefix()
    }

    fn read_suffix(&mut self) -> Result<()> {
        self.input.read_suffix()
    }

    fn cancel(&self) {
        self.cancelled.set();
        self.input.cancel();
    }

    fn is_cancelled(&self) -> bool {
        self.cancelled.get()
    }
}
