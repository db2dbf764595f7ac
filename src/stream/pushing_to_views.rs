use std::sync::Arc;

use crate::block::Block;
use crate::error::Result;
use crate::expr::ExpressionActions;
use crate::storage::MemoryStorage;
use crate::stream::BlockOutput;

/// A materialized view: the compiled SELECT transform and the storage its
/// results land in.
pub struct View {
    pub transform: ExpressionActions,
    pub storage: Arc<MemoryStorage>,
}

/// Writes each block to every dependent materialized view, then to the
/// base storage. Dependents run first so a failing view never leaves the
/// base ahead of its views.
pub struct PushingToViewsOutput {
    base: Arc<MemoryStorage>,
    views: Vec<View>,
}

impl PushingToViewsOutput {
    pub fn new(base: Arc<MemoryStorage>, views: Vec<View>) -> Self {
        Self { base, views }
    }
}

impl BlockOutput for PushingToViewsOutput {
    fn write(&mut self, block: &Block) -> Result<()> {
        for view in &self.views {
            let mut transformed = block.clone();
            view.transform.execute(&mut transformed)?;
            view.storage.append(transformed)?;
        }
        self.base.append(block.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::{Column, ColumnWithTypeAndName, DataType, Value};
    use crate::expr::{Expression, ExpressionAction};
    use crate::stream::{copy_data, BlocksStream};

    #[test]
    fn test_views_receive_transformed_blocks_before_base() {
        let base = MemoryStorage::new("base", vec![("x".into(), DataType::UInt64)]);
        let view_storage = MemoryStorage::new("doubled", vec![("y".into(), DataType::UInt64)]);
        let transform = ExpressionActions::default()
            .add(ExpressionAction::AddColumn {
                name: "y".into(),
                expression: Expression::call(
                    "multiply",
                    vec![
                        Expression::column("x"),
                        Expression::literal(Value::UInt64(2), DataType::UInt64),
                    ],
                ),
            })
            .add(ExpressionAction::Project { names: vec!["y".into()] });

        let block = Block::with_columns(vec![ColumnWithTypeAndName::new(
            "x",
            DataType::UInt64,
            Column::UInt64(vec![1, 2, 3]),
        )])
        .unwrap();

        let mut source = BlocksStream::new(vec![block]);
        let mut output = PushingToViewsOutput::new(
            base.clone(),
            vec![View { transform, storage: view_storage.clone() }],
        );
        copy_data(&mut source, &mut output).unwrap();

        assert_eq!(base.rows().unwrap(), 3);
        assert_eq!(view_storage.rows().unwrap(), 3);
        let mut stream = view_storage.read().unwrap();
        let blocks = crate::stream::read_all(stream.as_mut()).unwrap();
        assert_eq!(blocks[0].at(0).name, "y");
        assert_eq!(blocks[0].at(0).column.get(2), Value::UInt64(6));
    }

    #[test]
    fn test_failing_view_blocks_base_write() {
        let base = MemoryStorage::new("base", vec![("x".into(), DataType::UInt64)]);
        let view_storage = MemoryStorage::new("bad", vec![]);
        // The transform references a column the block does not have.
        let transform = ExpressionActions::default().add(ExpressionAction::AddColumn {
            name: "y".into(),
            expression: Expression::column("missing"),
        });

        let block = Block::with_columns(vec![ColumnWithTypeAndName::new(
            "x",
            DataType::UInt64,
            Column::UInt64(vec![1]),
        )])
        .unwrap();
        let mut output =
            PushingToViewsOutput::new(base.clone(), vec![View { transform, storage: view_storage }]);
        assert!(output.write(&block).is_err());
        // Dependents run first: the base saw nothing.
        assert_eq!(base.rows().unwrap(), 0);
    }
}
