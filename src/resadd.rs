//! Tiled residual addition
//!
//! Computes `C = clamp((A >> shift) + B)` with an optional ReLU floor. Both
//! operands are staged in the accumulator: A lands with overwrite intent and
//! the right shift applied on the way in, B lands on the same rows with
//! accumulate intent, and the store applies the activation and saturation.

use crate::error::{SchedError, SchedResult};
use crate::hardware::{
    AcceleratorConfig, Activation, Dataflow, Instruction, InstructionSink, LocalAddr, WriteIntent,
    ELEM_BYTES,
};
use crate::tiling::round_up_to;

/// One elementwise-add problem over row-major I x J matrices
#[derive(Debug, Clone, Copy)]
pub struct ResaddOp {
    pub rows: usize,
    pub cols: usize,
    pub shift: i32,
    pub a: u64,
    pub b: u64,
    pub c: u64,
    pub relu: bool,
}

/// Emits tiled residual-add instruction sequences
pub struct ResaddScheduler {
    config: AcceleratorConfig,
}

impl ResaddScheduler {
    pub fn new(config: AcceleratorConfig) -> Self {
        Self { config }
    }

    fn spad_rows_needed(&self, tile_i: usize, tile_j: usize) -> usize {
        let dim = self.config.dim;
        2 * round_up_to(tile_i, dim) * tile_j.div_ceil(dim)
    }

    fn acc_rows_needed(&self, tile_i: usize, tile_j: usize) -> usize {
        let dim = self.config.dim;
        round_up_to(tile_i, dim) * tile_j.div_ceil(dim)
    }

    /// Shrink the larger tile dimension one step at a time until both
    /// operands fit the scratchpad budget and the output fits the
    /// accumulator.
    pub fn tile_auto(&self, rows: usize, cols: usize) -> (usize, usize) {
        let mut tile_i = rows;
        let mut tile_j = cols;
        while self.spad_rows_needed(tile_i, tile_j) > self.config.spad_rows()
            || self.acc_rows_needed(tile_i, tile_j) > self.config.acc_rows
        {
            if tile_i > tile_j {
                tile_i -= 1;
            } else {
                tile_j -= 1;
            }
        }
        (tile_i, tile_j)
    }

    pub fn schedule<S: InstructionSink>(
        &self,
        op: &ResaddOp,
        tile_i: usize,
        tile_j: usize,
        sink: &mut S,
    ) -> SchedResult<()> {
        if op.shift < 0 {
            return Err(SchedError::unsupported(
                "negative shifts are not validated on the accelerator path",
            ));
        }
        if tile_i == 0 || tile_j == 0 {
            return Err(SchedError::config("tiling factors must be positive"));
        }
        if self.spad_rows_needed(tile_i, tile_j) > self.config.spad_rows()
            || self.acc_rows_needed(tile_i, tile_j) > self.config.acc_rows
        {
            return Err(SchedError::capacity("residual-add tile does not fit"));
        }

        sink.issue(Instruction::ConfigStore {
            stride: (op.cols * ELEM_BYTES) as u64,
            pool: None,
        })?;
        sink.issue(Instruction::ConfigEx {
            dataflow: Dataflow::WeightStationary,
            act: if op.relu {
                Activation::Relu
            } else {
                Activation::None
            },
            sys_shift: 0,
            acc_shift: 0,
            relu6_shift: 0,
            conv: None,
        })?;

        let mut i = 0;
        while i < op.rows {
            let i_tile = tile_i.min(op.rows - i);
            let mut j = 0;
            while j < op.cols {
                let j_tile = tile_j.min(op.cols - j);
                let offset = ((i * op.cols + j) * ELEM_BYTES) as u64;
                self.tile(
                    op,
                    i_tile,
                    j_tile,
                    op.a + offset,
                    op.b + offset,
                    op.c + offset,
                    sink,
                )?;
                j += tile_j;
            }
            i += tile_i;
        }

        sink.issue(Instruction::Flush)
    }

    /// One tile, both operands resident: A shifted in with overwrite
    /// intent, B summed on top, the result stored back out.
    #[allow(clippy::too_many_arguments)]
    fn tile<S: InstructionSink>(
        &self,
        op: &ResaddOp,
        i_len: usize,
        j_len: usize,
        a: u64,
        b: u64,
        c: u64,
        sink: &mut S,
    ) -> SchedResult<()> {
        let dim = self.config.dim;
        let blocks = (j_len / dim).clamp(1, self.config.max_block_len());
        let rounded_j_blocks = round_up_to(j_len, dim) / dim;
        let stride = (op.cols * ELEM_BYTES) as u64;

        sink.issue(Instruction::ConfigLoad {
            stride,
            scale: 1.0,
            shift: op.shift,
            shrunk: true,
        })?;
        let mut i = 0;
        while i < i_len {
            let rows = dim.min(i_len - i);
            let mut j = 0;
            while j < j_len {
                let cols = (blocks * dim).min(j_len - j);
                sink.issue(Instruction::MoveIn {
                    dram: a + ((i * op.cols + j) * ELEM_BYTES) as u64,
                    local: LocalAddr::acc(
                        (i * rounded_j_blocks + j) as u32,
                        WriteIntent::Overwrite,
                    ),
                    cols: cols as u16,
                    rows: rows as u16,
                })?;
                j += blocks * dim;
            }
            i += dim;
        }

        sink.issue(Instruction::ConfigLoad {
            stride,
            scale: 1.0,
            shift: 0,
            shrunk: true,
        })?;
        let mut i = 0;
        while i < i_len {
            let rows = dim.min(i_len - i);
            let mut j = 0;
            while j < j_len {
                let cols = (blocks * dim).min(j_len - j);
                sink.issue(Instruction::MoveIn {
                    dram: b + ((i * op.cols + j) * ELEM_BYTES) as u64,
                    local: LocalAddr::acc(
                        (i * rounded_j_blocks + j) as u32,
                        WriteIntent::Accumulate,
                    ),
                    cols: cols as u16,
                    rows: rows as u16,
                })?;
                j += blocks * dim;
            }
            i += dim;
        }

        let mut i = 0;
        while i < i_len {
            let rows = dim.min(i_len - i);
            let mut j = 0;
            while j < j_len {
                let cols = dim.min(j_len - j);
                sink.issue(Instruction::MoveOut {
                    dram: c + ((i * op.cols + j) * ELEM_BYTES) as u64,
                    local: LocalAddr::acc(
                        (i * rounded_j_blocks + j) as u32,
                        WriteIntent::Overwrite,
                    ),
                    cols: cols as u16,
                    rows: rows as u16,
                })?;
                j += dim;
            }
            i += dim;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::Program;

    #[test]
    fn test_tile_auto_fits() {
        let config = AcceleratorConfig::new(4, 2, 64, 64);
        let sched = ResaddScheduler::new(config);
        let (ti, tj) = sched.tile_auto(100, 100);
        assert!(sched.spad_rows_needed(ti, tj) <= config.spad_rows());
        assert!(sched.acc_rows_needed(ti, tj) <= config.acc_rows);
        // Determinism of the shrink loop
        assert_eq!((ti, tj), sched.tile_auto(100, 100));
    }

    #[test]
    fn test_small_problem_single_tile() {
        let sched = ResaddScheduler::new(AcceleratorConfig::default());
        assert_eq!(sched.tile_auto(16, 16), (16, 16));
    }

    #[test]
    fn test_rejects_negative_shift() {
        let config = AcceleratorConfig::default();
        let sched = ResaddScheduler::new(config);
        let mut program = Program::new(config);
        let op = ResaddOp {
            rows: 16,
            cols: 16,
            shift: -1,
            a: 0,
            b: 0,
            c: 0,
            relu: false,
        };
        assert!(sched.schedule(&op, 16, 16, &mut program).is_err());
    }
}
