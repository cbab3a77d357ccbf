//! Segmenter interface.
//!
//! When every scheduler rejects a fusion, the caller partitions it into
//! schedulable groups and compiles each separately. The partitioning here is
//! deliberately simple: pointwise runs accumulate into a group, and every
//! reduction, matmul, or opaque op ends one. Tensors crossing a group
//! boundary become global intermediate buffers, listed as outputs of the
//! producing group and inputs of every consuming group.

use kiln_ir::{ExprId, ExprKind, Fusion, ValId};

use crate::error::Result;

/// One schedulable slice of a fusion, described by reference into the
/// original graph.
#[derive(Debug, Clone, PartialEq)]
pub struct Segment {
    pub exprs: Vec<ExprId>,
    /// Fusion inputs and intermediate buffers this group reads.
    pub inputs: Vec<ValId>,
    /// Fusion outputs and intermediate buffers this group materializes.
    pub outputs: Vec<ValId>,
}

fn ends_group(kind: &ExprKind) -> bool {
    matches!(
        kind,
        ExprKind::Reduction { .. }
            | ExprKind::Welford { .. }
            | ExprKind::Matmul
            | ExprKind::Linear
            | ExprKind::Mma { .. }
            | ExprKind::Sdpa
            | ExprKind::Reshard
    )
}

/// Partition the fusion into segments along its topological order.
pub fn segment_fusion(fusion: &Fusion) -> Result<Vec<Segment>> {
    let order = fusion.topo_exprs();
    let mut groups: Vec<Vec<ExprId>> = Vec::new();
    let mut current: Vec<ExprId> = Vec::new();
    for expr in order {
        current.push(expr);
        if ends_group(&fusion.expr(expr).kind) {
            groups.push(std::mem::take(&mut current));
        }
    }
    if !current.is_empty() {
        groups.push(current);
    }

    // Group index of each produced val.
    let mut produced_in = std::collections::HashMap::new();
    for (index, group) in groups.iter().enumerate() {
        for &expr in group {
            for &output in &fusion.expr(expr).outputs {
                produced_in.insert(output, index);
            }
        }
    }

    let fusion_outputs: Vec<ValId> = fusion.outputs().iter().map(|o| o.val).collect();
    let segments = groups
        .iter()
        .enumerate()
        .map(|(index, group)| {
            let mut inputs = Vec::new();
            let mut outputs = Vec::new();
            for &expr in group {
                for &input in &fusion.expr(expr).inputs {
                    let external = match produced_in.get(&input) {
                        Some(&producer) => producer != index,
                        None => fusion.inputs().contains(&input),
                    };
                    if external && !inputs.contains(&input) {
                        inputs.push(input);
                    }
                }
                for &output in &fusion.expr(expr).outputs {
                    // A val leaving the group is an intermediate buffer; a
                    // fusion output always materializes.
                    let escapes = fusion_outputs.contains(&output)
                        || fusion.uses(output).iter().any(|&use_expr| {
                            produced_in.get(&fusion.expr(use_expr).outputs[0]).copied() != Some(index)
                        });
                    if escapes && !outputs.contains(&output) {
                        outputs.push(output);
                    }
                }
            }
            Segment { exprs: group.clone(), inputs, outputs }
        })
        .collect();
    Ok(segments)
}
