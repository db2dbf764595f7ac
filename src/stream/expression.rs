use crate::block::Block;
use crate::error::Result;
use crate::expr::ExpressionActions;
use crate::stream::{BlockStream, CancelFlag};

/// Applies a compiled expression program to every block.
pub struct ExpressionStream {
    input: Box<dyn BlockStream>,
    actions: ExpressionActions,
    cancelled: CancelFlag,
}

impl ExpressionStream {
    pub fn new(input: Box<dyn BlockStream>, actions: ExpressionActions) -> Self {
        Self { input, actions, cancelled: CancelFlag::new() }
    }
}

impl BlockStream for ExpressionStream {
    fn name(&self) -> &'static str {
        "Expression"
    }

    fn read(&mut self) -> Result<Block> {
        if self.cancelled.get() {
            return Ok(Block::new());
        }
        let mut block = self.input.read()?;
        if block.is_empty() {
            return Ok(block);
        }
        self.actions.execute(&mut block)?;
        Ok(block)
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
