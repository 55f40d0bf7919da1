//! Tile scheduler for a scratchpad-based systolic array accelerator
//!
//! This library decides how to partition matrix-multiply, convolution and
//! residual-add problems that exceed the accelerator's on-chip capacity,
//! and emits the exact move-in/compute/move-out instruction sequence for
//! every tile. A functional model of the accelerator executes the same
//! instruction stream so results can be cross-checked against the CPU
//! reference implementations.
//!
//! # Example
//!
//! ```rust
//! use systolic_tiler::{run_matmul, AcceleratorConfig, Dram, ExecMode, MatmulOp, Operand};
//!
//! let config = AcceleratorConfig::default();
//! let mut dram = Dram::new();
//! let a = dram.alloc_elems(4 * 4);
//! let b = dram.alloc_elems(4 * 4);
//! let c = dram.alloc_elems(4 * 4);
//! dram.write_elems(a, &[1; 16]).unwrap();
//! dram.write_elems(b, &[2; 16]).unwrap();
//!
//! let op = MatmulOp::new(4, 4, 4, Operand::new(a, 4), Operand::new(b, 4), Operand::new(c, 4));
//! let program = run_matmul(config, &mut dram, &op, ExecMode::Ws, None).unwrap();
//! assert!(!program.is_empty());
//! assert_eq!(dram.read_elems(c, 16).unwrap(), vec![8; 16]);
//! ```

pub mod conv;
pub mod cpu;
pub mod error;
pub mod executor;
pub mod hardware;
pub mod matmul;
pub mod resadd;
pub mod tiling;

pub use conv::{ConvOp, ConvParams, ConvScheduler, ConvTile, PoolParams, RowBudget};
pub use error::{SchedError, SchedResult};
pub use executor::Accelerator;
pub use hardware::{
    Acc, AcceleratorConfig, Activation, Dataflow, Dram, Elem, ExecMode, Instruction,
    InstructionSink, LocalAddr, Program, Scale, WriteIntent,
};
pub use matmul::{Bias, MatmulOp, MatmulScheduler, Operand, TileShape};
pub use resadd::{ResaddOp, ResaddScheduler};
pub use tiling::AxisTiling;

/// Schedule a tiled matmul and execute it on the accelerator model, or run
/// the CPU reference when `ExecMode::Cpu` is requested. Tile extents are
/// chosen from capacity when not given.
pub fn run_matmul(
    config: AcceleratorConfig,
    dram: &mut Dram,
    op: &MatmulOp,
    mode: ExecMode,
    tile: Option<TileShape>,
) -> SchedResult<Program> {
    let dataflow = match mode {
        ExecMode::Cpu => {
            cpu::matmul(dram, op)?;
            return Ok(Program::new(config));
        }
        ExecMode::Os => Dataflow::OutputStationary,
        ExecMode::Ws => Dataflow::WeightStationary,
    };

    let sched = MatmulScheduler::new(config);
    let tile = tile.unwrap_or_else(|| sched.tile_auto(op.dim_i, op.dim_j, op.dim_k));
    let mut program = Program::new(config);
    sched.schedule(op, tile, dataflow, &mut program)?;
    Accelerator::new(config, dram).run(&program)?;
    Ok(program)
}

/// Schedule a tiled convolution and execute it, or run the CPU reference.
/// The accelerator path only supports the weight-stationary discipline.
pub fn run_conv(
    config: AcceleratorConfig,
    dram: &mut Dram,
    op: &ConvOp,
    mode: ExecMode,
    tile: Option<ConvTile>,
) -> SchedResult<Program> {
    match mode {
        ExecMode::Cpu => {
            cpu::conv(dram, op)?;
            return Ok(Program::new(config));
        }
        ExecMode::Os => {
            return Err(SchedError::unsupported(
                "convolutions do not support the output-stationary dataflow",
            ));
        }
        ExecMode::Ws => {}
    }

    let sched = ConvScheduler::new(config);
    let tile = match tile {
        Some(t) => t,
        None => sched.tile_auto(&op.params, op.pool.as_ref())?,
    };
    let mut program = Program::new(config);
    sched.schedule(op, &tile, &mut program)?;
    Accelerator::new(config, dram).run(&program)?;
    Ok(program)
}

/// Depthwise convolution entry point; no fused pooling on this path
pub fn run_conv_dw(
    config: AcceleratorConfig,
    dram: &mut Dram,
    op: &ConvOp,
    mode: ExecMode,
    tile: Option<ConvTile>,
) -> SchedResult<Program> {
    match mode {
        ExecMode::Cpu => {
            cpu::conv_dw(dram, op)?;
            return Ok(Program::new(config));
        }
        ExecMode::Os => {
            return Err(SchedError::unsupported(
                "convolutions do not support the output-stationary dataflow",
            ));
        }
        ExecMode::Ws => {}
    }

    let sched = ConvScheduler::new(config);
    let tile = match tile {
        Some(t) => t,
        None => sched.tile_auto_dw(&op.params)?,
    };
    let mut program = Program::new(config);
    sched.schedule_dw(op, &tile, &mut program)?;
    Accelerator::new(config, dram).run(&program)?;
    Ok(program)
}

/// First-layer convolution entry point. Falls back to the general path when
/// the packed row layout does not fit the array width.
pub fn run_conv_first(
    config: AcceleratorConfig,
    dram: &mut Dram,
    op: &ConvOp,
    mode: ExecMode,
    tile: Option<ConvTile>,
) -> SchedResult<Program> {
    if mode == ExecMode::Ws && op.params.in_channels * op.params.kernel_dim > config.dim {
        return run_conv(config, dram, op, mode, tile);
    }
    match mode {
        ExecMode::Cpu => {
            cpu::conv(dram, op)?;
            return Ok(Program::new(config));
        }
        ExecMode::Os => {
            return Err(SchedError::unsupported(
                "convolutions do not support the output-stationary dataflow",
            ));
        }
        ExecMode::Ws => {}
    }

    let sched = ConvScheduler::new(config);
    let tile = match tile {
        Some(t) => t,
        None => sched.tile_auto_first(&op.params, op.pool.as_ref())?,
    };
    let mut program = Program::new(config);
    sched.schedule_first(op, &tile, &mut program)?;
    Accelerator::new(config, dram).run(&program)?;
    Ok(program)
}

/// Residual add entry point: negative shifts and `ExecMode::Cpu` run on the
/// CPU reference, any other non-WS mode is rejected.
pub fn run_resadd(
    config: AcceleratorConfig,
    dram: &mut Dram,
    op: &ResaddOp,
    mode: ExecMode,
) -> SchedResult<Program> {
    if mode == ExecMode::Cpu || op.shift < 0 {
        cpu::resadd(dram, op)?;
        return Ok(Program::new(config));
    }
    if mode != ExecMode::Ws {
        return Err(SchedError::unsupported(
            "residual add only runs weight-stationary",
        ));
    }

    let sched = ResaddScheduler::new(config);
    let (tile_i, tile_j) = sched.tile_auto(op.rows, op.cols);
    let mut program = Program::new(config);
    sched.schedule(op, tile_i, tile_j, &mut program)?;
    Accelerator::new(config, dram).run(&program)?;
    Ok(program)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    /// Deterministic fill so accelerator/CPU runs see identical inputs
    fn fill_elems(dram: &mut Dram, addr: u64, n: usize, seed: &mut u64) {
        for i in 0..n {
            *seed = seed.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
            let v = ((*seed >> 33) % 256) as i64 - 128;
            dram.write_elem(addr + i as u64, v as i8).unwrap();
        }
    }

    fn fill_accs(dram: &mut Dram, addr: u64, n: usize, seed: &mut u64) {
        for i in 0..n {
            *seed = seed.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
            let v = ((*seed >> 33) % 2001) as i64 - 1000;
            dram.write_acc(addr + (i * 4) as u64, v as i32).unwrap();
        }
    }

    fn matmul_parity(
        dim_i: usize,
        dim_j: usize,
        dim_k: usize,
        mode: ExecMode,
        bias: Option<bool>,
        tile: Option<TileShape>,
        shift: u32,
        act: Activation,
    ) {
        let config = AcceleratorConfig::default();
        let mut dram = Dram::new();
        let mut seed = 0xfeed_beef_u64;

        let a = dram.alloc_elems(dim_i * dim_k);
        let b = dram.alloc_elems(dim_k * dim_j);
        let c_hw = dram.alloc_elems(dim_i * dim_j);
        let c_ref = dram.alloc_elems(dim_i * dim_j);
        fill_elems(&mut dram, a, dim_i * dim_k, &mut seed);
        fill_elems(&mut dram, b, dim_k * dim_j, &mut seed);

        let d = bias.map(|repeating| {
            let rows = if repeating { 1 } else { dim_i };
            let addr = dram.alloc_accs(rows * dim_j);
            fill_accs(&mut dram, addr, rows * dim_j, &mut seed);
            if repeating {
                Bias::repeating(addr, dim_j)
            } else {
                Bias::new(addr, dim_j)
            }
        });

        let mut op = MatmulOp::new(
            dim_i,
            dim_j,
            dim_k,
            Operand::new(a, dim_k),
            Operand::new(b, dim_j),
            Operand::new(c_hw, dim_j),
        );
        op.d = d;
        op.shift = shift;
        op.act = act;

        run_matmul(config, &mut dram, &op, mode, tile).unwrap();

        let mut ref_op = op;
        ref_op.c = Operand::new(c_ref, dim_j);
        cpu::matmul(&mut dram, &ref_op).unwrap();

        assert_eq!(
            dram.read_elems(c_hw, dim_i * dim_j).unwrap(),
            dram.read_elems(c_ref, dim_i * dim_j).unwrap()
        );
    }

    #[test]
    fn test_matmul_parity_exact_multiple() {
        matmul_parity(32, 32, 32, ExecMode::Ws, None, None, 0, Activation::None);
        matmul_parity(32, 32, 32, ExecMode::Os, None, None, 0, Activation::None);
    }

    #[test]
    fn test_matmul_parity_boundary_padding() {
        // 45x39x67 pads to 48x48x80 with a 3x3x5 tile grid.
        matmul_parity(45, 39, 67, ExecMode::Ws, None, None, 5, Activation::None);
        matmul_parity(45, 39, 67, ExecMode::Os, None, None, 5, Activation::None);
    }

    #[test]
    fn test_matmul_parity_multi_k_chunks() {
        // Single-block tiles force the reduction across separate tile calls.
        let tile = TileShape { i: 1, j: 1, k: 1 };
        matmul_parity(45, 39, 67, ExecMode::Ws, None, Some(tile), 5, Activation::None);
        matmul_parity(45, 39, 67, ExecMode::Os, None, Some(tile), 5, Activation::None);
    }

    #[test]
    fn test_matmul_parity_smaller_than_tile() {
        matmul_parity(3, 2, 5, ExecMode::Ws, None, None, 0, Activation::None);
        matmul_parity(3, 2, 5, ExecMode::Os, None, None, 0, Activation::None);
    }

    #[test]
    fn test_matmul_parity_bias() {
        matmul_parity(20, 24, 40, ExecMode::Ws, Some(false), None, 4, Activation::None);
        matmul_parity(20, 24, 40, ExecMode::Os, Some(false), None, 4, Activation::None);
        let tile = TileShape { i: 1, j: 1, k: 1 };
        matmul_parity(20, 24, 40, ExecMode::Ws, Some(false), Some(tile), 4, Activation::None);
    }

    #[test]
    fn test_matmul_parity_repeating_bias() {
        matmul_parity(20, 24, 40, ExecMode::Ws, Some(true), None, 4, Activation::None);
        matmul_parity(20, 24, 40, ExecMode::Os, Some(true), None, 4, Activation::None);
    }

    #[test]
    fn test_matmul_parity_relu() {
        matmul_parity(17, 18, 19, ExecMode::Ws, Some(false), None, 6, Activation::Relu);
    }

    fn conv_setup(
        params: ConvParams,
        pool: Option<PoolParams>,
        bias: bool,
        dw: bool,
    ) -> (Dram, ConvOp, u64) {
        let p = params;
        let mut dram = Dram::new();
        let mut seed = 0x0ddc_0ffe_u64;
        let out_px = pool
            .filter(|w| w.stride != 0)
            .map(|w| w.out_dim(p.out_dim))
            .unwrap_or(p.out_dim);

        let input = dram.alloc_elems(p.batch_size * p.in_dim * p.in_dim * p.in_channels);
        let n_weights = if dw {
            p.kernel_dim * p.kernel_dim * p.out_channels
        } else {
            p.kernel_dim * p.kernel_dim * p.in_channels * p.out_channels
        };
        let weights = dram.alloc_elems(n_weights);
        let out_hw = dram.alloc_elems(p.batch_size * out_px * out_px * p.out_channels);
        let out_ref = dram.alloc_elems(p.batch_size * out_px * out_px * p.out_channels);
        fill_elems(
            &mut dram,
            input,
            p.batch_size * p.in_dim * p.in_dim * p.in_channels,
            &mut seed,
        );
        fill_elems(&mut dram, weights, n_weights, &mut seed);

        let mut op = ConvOp::new(p, input, weights, out_hw);
        if bias {
            let b = dram.alloc_accs(p.out_channels);
            fill_accs(&mut dram, b, p.out_channels, &mut seed);
            op = op.with_bias(b);
        }
        if let Some(pool) = pool {
            op = op.with_pool(pool);
        }
        (dram, op, out_ref)
    }

    fn out_len(op: &ConvOp) -> usize {
        let p = op.params;
        let out_px = op
            .pool
            .filter(|w| w.stride != 0)
            .map(|w| w.out_dim(p.out_dim))
            .unwrap_or(p.out_dim);
        p.batch_size * out_px * out_px * p.out_channels
    }

    #[test]
    fn test_conv_parity_pooled_borders() {
        // 8x8x16 input, 32 output channels, 3x3 stride-1 kernel with
        // padding 1, 2x2/2 pooling: a 4x4x32 pooled output with zero-filled
        // receptive fields on all four borders.
        let params = ConvParams::new(2, 8, 16, 32, 1, 1, 3);
        assert_eq!(params.out_dim, 8);
        let pool = PoolParams {
            size: 2,
            stride: 2,
            padding: 0,
        };
        let (mut dram, op, out_ref) = conv_setup(params, Some(pool), true, false);
        assert_eq!(pool.out_dim(params.out_dim), 4);

        run_conv(AcceleratorConfig::default(), &mut dram, &op, ExecMode::Ws, None).unwrap();
        let mut ref_op = op;
        ref_op.output = out_ref;
        cpu::conv(&mut dram, &ref_op).unwrap();

        assert_eq!(
            dram.read_elems(op.output, out_len(&op)).unwrap(),
            dram.read_elems(out_ref, out_len(&op)).unwrap()
        );
    }

    #[test]
    fn test_conv_parity_no_pool() {
        let params = ConvParams::new(1, 8, 16, 16, 1, 1, 3);
        let (mut dram, op, out_ref) = conv_setup(params, None, true, false);

        run_conv(AcceleratorConfig::default(), &mut dram, &op, ExecMode::Ws, None).unwrap();
        let mut ref_op = op;
        ref_op.output = out_ref;
        cpu::conv(&mut dram, &ref_op).unwrap();

        assert_eq!(
            dram.read_elems(op.output, out_len(&op)).unwrap(),
            dram.read_elems(out_ref, out_len(&op)).unwrap()
        );
    }

    #[test]
    fn test_conv_parity_strided_no_bias() {
        let params = ConvParams::new(1, 9, 8, 16, 2, 1, 3);
        let (mut dram, op, out_ref) = conv_setup(params, None, false, false);

        run_conv(AcceleratorConfig::default(), &mut dram, &op, ExecMode::Ws, None).unwrap();
        let mut ref_op = op;
        ref_op.output = out_ref;
        cpu::conv(&mut dram, &ref_op).unwrap();

        assert_eq!(
            dram.read_elems(op.output, out_len(&op)).unwrap(),
            dram.read_elems(out_ref, out_len(&op)).unwrap()
        );
    }

    #[test]
    fn test_conv_parity_channel_chunks() {
        // A kchs tile smaller than in_channels splits the reduction across
        // calls: intermediate chunks suppress the store, later chunks the
        // bias.
        let params = ConvParams::new(1, 6, 32, 16, 1, 1, 3);
        let (mut dram, op, out_ref) = conv_setup(params, None, true, false);
        let tile = ConvTile {
            batches: 1,
            porows: 6,
            pocols: 6,
            pochs: 16,
            kchs: 16,
        };

        run_conv(
            AcceleratorConfig::default(),
            &mut dram,
            &op,
            ExecMode::Ws,
            Some(tile),
        )
        .unwrap();
        let mut ref_op = op;
        ref_op.output = out_ref;
        cpu::conv(&mut dram, &ref_op).unwrap();

        assert_eq!(
            dram.read_elems(op.output, out_len(&op)).unwrap(),
            dram.read_elems(out_ref, out_len(&op)).unwrap()
        );
    }

    #[test]
    fn test_conv_parity_spatial_tiles() {
        // Force spatial tiling so boundary tiles propagate padding.
        let params = ConvParams::new(1, 12, 8, 8, 1, 1, 3);
        let (mut dram, op, out_ref) = conv_setup(params, None, true, false);
        let tile = ConvTile {
            batches: 1,
            porows: 5,
            pocols: 5,
            pochs: 8,
            kchs: 8,
        };

        run_conv(
            AcceleratorConfig::default(),
            &mut dram,
            &op,
            ExecMode::Ws,
            Some(tile),
        )
        .unwrap();
        let mut ref_op = op;
        ref_op.output = out_ref;
        cpu::conv(&mut dram, &ref_op).unwrap();

        assert_eq!(
            dram.read_elems(op.output, out_len(&op)).unwrap(),
            dram.read_elems(out_ref, out_len(&op)).unwrap()
        );
    }

    #[test]
    fn test_conv_rejects_os() {
        let params = ConvParams::new(1, 8, 16, 16, 1, 1, 3);
        let (mut dram, op, _) = conv_setup(params, None, false, false);
        assert!(run_conv(
            AcceleratorConfig::default(),
            &mut dram,
            &op,
            ExecMode::Os,
            None
        )
        .is_err());
    }

    #[test]
    fn test_conv_dw_parity() {
        let params = ConvParams::new(2, 8, 4, 4, 1, 1, 3);
        let (mut dram, op, out_ref) = conv_setup(params, None, true, true);

        run_conv_dw(AcceleratorConfig::default(), &mut dram, &op, ExecMode::Ws, None).unwrap();
        let mut ref_op = op;
        ref_op.output = out_ref;
        cpu::conv_dw(&mut dram, &ref_op).unwrap();

        assert_eq!(
            dram.read_elems(op.output, out_len(&op)).unwrap(),
            dram.read_elems(out_ref, out_len(&op)).unwrap()
        );
    }

    #[test]
    fn test_conv_first_parity() {
        // 3-channel input, kernel 3: packed rows of 9 elements fit the
        // 16-wide array. Small spatial tiles exercise both the border ring
        // and the packed interior.
        let params = ConvParams::new(1, 10, 3, 16, 1, 1, 3);
        let (mut dram, op, out_ref) = conv_setup(params, None, true, false);
        let tile = ConvTile {
            batches: 1,
            porows: 3,
            pocols: 3,
            pochs: 16,
            kchs: 3,
        };

        run_conv_first(
            AcceleratorConfig::default(),
            &mut dram,
            &op,
            ExecMode::Ws,
            Some(tile),
        )
        .unwrap();
        let mut ref_op = op;
        ref_op.output = out_ref;
        cpu::conv(&mut dram, &ref_op).unwrap();

        assert_eq!(
            dram.read_elems(op.output, out_len(&op)).unwrap(),
            dram.read_elems(out_ref, out_len(&op)).unwrap()
        );
    }

    fn resadd_setup(rows: usize, cols: usize, shift: i32, relu: bool) -> (Dram, ResaddOp, u64) {
        let mut dram = Dram::new();
        let mut seed = 0x5eed_u64;
        let a = dram.alloc_elems(rows * cols);
        let b = dram.alloc_elems(rows * cols);
        let c_hw = dram.alloc_elems(rows * cols);
        let c_ref = dram.alloc_elems(rows * cols);
        fill_elems(&mut dram, a, rows * cols, &mut seed);
        fill_elems(&mut dram, b, rows * cols, &mut seed);
        (
            dram,
            ResaddOp {
                rows,
                cols,
                shift,
                a,
                b,
                c: c_hw,
                relu,
            },
            c_ref,
        )
    }

    #[test]
    fn test_resadd_parity() {
        let (mut dram, op, c_ref) = resadd_setup(45, 39, 2, false);
        run_resadd(AcceleratorConfig::default(), &mut dram, &op, ExecMode::Ws).unwrap();
        let mut ref_op = op;
        ref_op.c = c_ref;
        cpu::resadd(&mut dram, &ref_op).unwrap();
        assert_eq!(
            dram.read_elems(op.c, op.rows * op.cols).unwrap(),
            dram.read_elems(c_ref, op.rows * op.cols).unwrap()
        );
    }

    #[test]
    fn test_resadd_parity_relu() {
        let (mut dram, op, c_ref) = resadd_setup(20, 33, 1, true);
        run_resadd(AcceleratorConfig::default(), &mut dram, &op, ExecMode::Ws).unwrap();
        let mut ref_op = op;
        ref_op.c = c_ref;
        cpu::resadd(&mut dram, &ref_op).unwrap();
        assert_eq!(
            dram.read_elems(op.c, op.rows * op.cols).unwrap(),
            dram.read_elems(c_ref, op.rows * op.cols).unwrap()
        );
    }

    #[test]
    fn test_resadd_negative_shift_routes_to_cpu() {
        let (mut dram, op, c_ref) = resadd_setup(16, 16, -2, false);
        let program =
            run_resadd(AcceleratorConfig::default(), &mut dram, &op, ExecMode::Ws).unwrap();
        // No instructions were issued; the CPU reference produced the
        // output.
        assert!(program.is_empty());
        let mut ref_op = op;
        ref_op.c = c_ref;
        cpu::resadd(&mut dram, &ref_op).unwrap();
        assert_eq!(
            dram.read_elems(op.c, 256).unwrap(),
            dram.read_elems(c_ref, 256).unwrap()
        );
    }
}
