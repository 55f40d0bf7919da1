//! Tiled matrix multiplication scheduling
//!
//! Decomposes `C = activation((A x B + D) >> shift)` into a 3-D grid of tiles
//! that fit on-chip and emits the move-in/compute/move-out sequence for every
//! tile under one of two dataflow disciplines. Output-stationary keeps one
//! output tile resident in the array across the reduction; weight-stationary
//! keeps an operand tile loaded and sweeps the row tiles, which amortizes
//! operand reloads whenever B is reused.

use serde::{Deserialize, Serialize};

use crate::error::{SchedError, SchedResult};
use crate::hardware::{
    AcceleratorConfig, Activation, AddressMap, Dataflow, Instruction, InstructionSink, LocalAddr,
    Scale, WriteIntent, ACC_BYTES, ELEM_BYTES,
};
use crate::tiling::AxisTiling;

/// A main-storage operand: base byte address plus row stride in elements
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Operand {
    pub addr: u64,
    pub stride: usize,
}

impl Operand {
    pub fn new(addr: u64, stride: usize) -> Self {
        Self { addr, stride }
    }
}

/// The bias operand: one row per output row, or a single row broadcast to
/// every output row when `repeating` is set
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Bias {
    pub addr: u64,
    pub stride: usize,
    pub repeating: bool,
}

impl Bias {
    pub fn new(addr: u64, stride: usize) -> Self {
        Self {
            addr,
            stride,
            repeating: false,
        }
    }

    pub fn repeating(addr: u64, stride: usize) -> Self {
        Self {
            addr,
            stride,
            repeating: true,
        }
    }
}

/// One matrix multiplication problem
#[derive(Debug, Clone, Copy)]
pub struct MatmulOp {
    pub dim_i: usize,
    pub dim_j: usize,
    pub dim_k: usize,
    pub a: Operand,
    pub b: Operand,
    pub d: Option<Bias>,
    pub c: Operand,
    pub a_scale: Scale,
    pub b_scale: Scale,
    pub d_scale: Scale,
    pub act: Activation,
    pub shift: u32,
    pub relu6_shift: u32,
}

impl MatmulOp {
    pub fn new(
        dim_i: usize,
        dim_j: usize,
        dim_k: usize,
        a: Operand,
        b: Operand,
        c: Operand,
    ) -> Self {
        Self {
            dim_i,
            dim_j,
            dim_k,
            a,
            b,
            d: None,
            c,
            a_scale: 1.0,
            b_scale: 1.0,
            d_scale: 1.0,
            act: Activation::None,
            shift: 0,
            relu6_shift: 0,
        }
    }

    pub fn with_bias(mut self, d: Bias) -> Self {
        self.d = Some(d);
        self
    }
}

/// Tile extents in blocks of the array dimension
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TileShape {
    pub i: usize,
    pub j: usize,
    pub k: usize,
}

impl std::fmt::Display for TileShape {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}x{}x{}", self.i, self.j, self.k)
    }
}

/// What the accumulator holds when a tile's reduction starts
///
/// `Zero` means a fresh output tile with no bias: the first write must
/// overwrite whatever a previous tile left behind. `Partial` means earlier
/// reduction chunks already accumulated into these rows.
#[derive(Debug, Clone, Copy)]
pub(crate) enum AccInit {
    Zero,
    Bias {
        addr: u64,
        stride: usize,
        scale: Scale,
        repeating: bool,
    },
    Partial,
}

struct TileArgs {
    a: u64,
    b: u64,
    c: Option<u64>,
    acc_init: AccInit,
    i: usize,
    j: usize,
    k: usize,
    pad_i: usize,
    pad_j: usize,
    pad_k: usize,
}

/// Emits tiled matmul instruction sequences for one accelerator instance
pub struct MatmulScheduler {
    config: AcceleratorConfig,
}

impl MatmulScheduler {
    pub fn new(config: AcceleratorConfig) -> Self {
        Self { config }
    }

    /// Derive tile extents from the capacity constants alone: the
    /// accumulator budget is split evenly between the I and J extents and
    /// the remaining scratchpad half-partition goes to K.
    pub fn tile_auto(&self, dim_i: usize, dim_j: usize, dim_k: usize) -> TileShape {
        let dim = self.config.dim;
        let partition_rows = self.config.spad_rows() / 2;
        let mats_in_partition = partition_rows / dim;
        let mats_in_acc = self.config.acc_rows / dim;
        let max_tile_i_j = mats_in_acc.isqrt().max(1);
        let max_tile_k = (mats_in_partition / max_tile_i_j).max(1);

        TileShape {
            i: (crate::tiling::round_up_to(dim_i, dim) / dim).min(max_tile_i_j),
            j: (crate::tiling::round_up_to(dim_j, dim) / dim).min(max_tile_i_j),
            k: (crate::tiling::round_up_to(dim_k, dim) / dim).min(max_tile_k),
        }
    }

    /// Validate the tiling factors and emit the full tiled operation
    pub fn schedule<S: InstructionSink>(
        &self,
        op: &MatmulOp,
        tile: TileShape,
        dataflow: Dataflow,
        sink: &mut S,
    ) -> SchedResult<()> {
        let dim = self.config.dim;

        if tile.i == 0 || tile.j == 0 || tile.k == 0 {
            return Err(SchedError::config("tiling factors must be positive"));
        }
        let i_padded = crate::tiling::round_up_to(op.dim_i, dim);
        let j_padded = crate::tiling::round_up_to(op.dim_j, dim);
        let k_padded = crate::tiling::round_up_to(op.dim_k, dim);
        if tile.i * dim > i_padded || tile.j * dim > j_padded || tile.k * dim > k_padded {
            return Err(SchedError::config(format!(
                "tile {} exceeds the padded problem size {}x{}x{}",
                tile, i_padded, j_padded, k_padded
            )));
        }
        // Rejects tiles whose A and B regions would cross, or whose C
        // overflows the accumulator.
        AddressMap::for_matmul_tile(&self.config, tile.i, tile.j, tile.k)?;
        if tile.i > 65535 || tile.j > 65535 || tile.k > 65535 {
            return Err(SchedError::config(
                "tiling factors must fit in 16 bits of the loop encoding",
            ));
        }

        if dataflow == Dataflow::WeightStationary && op.dim_k <= tile.k * dim {
            self.outer_fit_c(op, tile, sink)
        } else {
            self.outer(op, tile, dataflow, sink)
        }
    }

    /// Schedule with automatically chosen tile extents
    pub fn schedule_auto<S: InstructionSink>(
        &self,
        op: &MatmulOp,
        dataflow: Dataflow,
        sink: &mut S,
    ) -> SchedResult<()> {
        let tile = self.tile_auto(op.dim_i, op.dim_j, op.dim_k);
        self.schedule(op, tile, dataflow, sink)
    }

    fn outer<S: InstructionSink>(
        &self,
        op: &MatmulOp,
        tile: TileShape,
        dataflow: Dataflow,
        sink: &mut S,
    ) -> SchedResult<()> {
        let dim = self.config.dim;
        let i_axis = AxisTiling::new(op.dim_i, tile.i, dim);
        let j_axis = AxisTiling::new(op.dim_j, tile.j, dim);
        let k_axis = AxisTiling::new(op.dim_k, tile.k, dim);

        sink.issue(Instruction::ConfigEx {
            dataflow,
            act: op.act,
            sys_shift: 0,
            acc_shift: op.shift,
            relu6_shift: op.relu6_shift,
            conv: None,
        })?;
        sink.issue(Instruction::ConfigStore {
            stride: (op.c.stride * ELEM_BYTES) as u64,
            pool: None,
        })?;

        for i0 in 0..i_axis.tiles {
            for j0 in 0..j_axis.tiles {
                for k0 in 0..k_axis.tiles {
                    let acc_init = if k0 == 0 {
                        match op.d {
                            Some(d) => {
                                let bias_row = if d.repeating { 0 } else { i_axis.offset(i0) };
                                AccInit::Bias {
                                    addr: d.addr
                                        + ((bias_row * d.stride + j_axis.offset(j0)) * ACC_BYTES)
                                            as u64,
                                    stride: d.stride,
                                    scale: op.d_scale,
                                    repeating: d.repeating,
                                }
                            }
                            None => AccInit::Zero,
                        }
                    } else {
                        AccInit::Partial
                    };

                    let c = if k0 == k_axis.tiles - 1 {
                        Some(
                            op.c.addr
                                + ((i_axis.offset(i0) * op.c.stride + j_axis.offset(j0))
                                    * ELEM_BYTES) as u64,
                        )
                    } else {
                        None
                    };

                    let args = TileArgs {
                        a: op.a.addr
                            + ((i_axis.offset(i0) * op.a.stride + k_axis.offset(k0)) * ELEM_BYTES)
                                as u64,
                        b: op.b.addr
                            + ((k_axis.offset(k0) * op.b.stride + j_axis.offset(j0)) * ELEM_BYTES)
                                as u64,
                        c,
                        acc_init,
                        i: i_axis.extent(i0),
                        j: j_axis.extent(j0),
                        k: k_axis.extent(k0),
                        pad_i: i_axis.pad(i0),
                        pad_j: j_axis.pad(j0),
                        pad_k: k_axis.pad(k0),
                    };

                    match dataflow {
                        Dataflow::OutputStationary => self.tile_os(op, &args, sink)?,
                        Dataflow::WeightStationary => self.tile_ws(op, &args, sink)?,
                    }
                }
            }
        }

        sink.issue(Instruction::Flush)
    }

    /// Move the bias tile into the accumulator, scaled, with a broadcast
    /// stride when one bias row serves every output row.
    fn move_in_bias<S: InstructionSink>(
        &self,
        args: &TileArgs,
        map: &AddressMap,
        sink: &mut S,
    ) -> SchedResult<()> {
        let AccInit::Bias {
            addr,
            stride,
            scale,
            repeating,
        } = args.acc_init
        else {
            return Ok(());
        };
        let dim = self.config.dim;
        let d_blocks = args.j.min(self.config.max_block_len_acc());

        sink.issue(Instruction::ConfigLoad {
            stride: if repeating {
                0
            } else {
                (stride * ACC_BYTES) as u64
            },
            scale,
            shift: 0,
            shrunk: false,
        })?;

        for i in 0..args.i {
            let mut j = 0;
            while j < args.j {
                let blocks = d_blocks.min(args.j - j);
                let bias_row = if repeating { 0 } else { i };
                let dram = addr + ((bias_row * stride + j) * dim * ACC_BYTES) as u64;
                let cols = blocks * dim - if j + blocks >= args.j { args.pad_j } else { 0 };
                let rows = dim - if i == args.i - 1 { args.pad_i } else { 0 };
                sink.issue(Instruction::MoveIn {
                    dram,
                    local: map.d.offset(((i * args.j + j) * dim) as u32),
                    cols: cols as u16,
                    rows: rows as u16,
                })?;
                j += blocks;
            }
        }
        Ok(())
    }

    fn move_in_b<S: InstructionSink>(
        &self,
        op: &MatmulOp,
        args: &TileArgs,
        map: &AddressMap,
        sink: &mut S,
    ) -> SchedResult<()> {
        let dim = self.config.dim;
        let b_blocks = args.j.min(self.config.max_block_len());

        sink.issue(Instruction::ConfigLoad {
            stride: (op.b.stride * ELEM_BYTES) as u64,
            scale: op.b_scale,
            shift: 0,
            shrunk: false,
        })?;

        let mut j = 0;
        while j < args.j {
            let blocks = b_blocks.min(args.j - j);
            for k in 0..args.k {
                let dram = args.b + ((k * op.b.stride + j) * dim * ELEM_BYTES) as u64;
                let cols = blocks * dim - if j + blocks >= args.j { args.pad_j } else { 0 };
                let rows = dim - if k == args.k - 1 { args.pad_k } else { 0 };
                sink.issue(Instruction::MoveIn {
                    dram,
                    local: map.b.offset(((k * args.j + j) * dim) as u32),
                    cols: cols as u16,
                    rows: rows as u16,
                })?;
            }
            j += blocks;
        }
        Ok(())
    }

    /// Single-tile sequence, output-stationary: every (i, j) output block
    /// loops the reduction in the array, and only the final reduction step
    /// carries the true output address out of the preload.
    fn tile_os<S: InstructionSink>(
        &self,
        op: &MatmulOp,
        args: &TileArgs,
        sink: &mut S,
    ) -> SchedResult<()> {
        let dim = self.config.dim;
        let map = AddressMap::for_matmul_tile(&self.config, args.i, args.j, args.k)?;
        let a_blocks = args.k.min(self.config.max_block_len());

        self.move_in_bias(args, &map, sink)?;
        self.move_in_b(op, args, &map, sink)?;

        sink.issue(Instruction::ConfigLoad {
            stride: (op.a.stride * ELEM_BYTES) as u64,
            scale: op.a_scale,
            shift: 0,
            shrunk: false,
        })?;
        for i in 0..args.i {
            let mut k = 0;
            while k < args.k {
                let blocks = a_blocks.min(args.k - k);
                let dram = args.a + ((i * op.a.stride + k) * dim * ELEM_BYTES) as u64;
                let cols = blocks * dim - if k + blocks >= args.k { args.pad_k } else { 0 };
                let rows = dim - if i == args.i - 1 { args.pad_i } else { 0 };
                sink.issue(Instruction::MoveIn {
                    dram,
                    local: map.a.offset(((i * args.k + k) * dim) as u32),
                    cols: cols as u16,
                    rows: rows as u16,
                })?;
                k += blocks;
            }
        }

        for i in 0..args.i {
            for j in 0..args.j {
                let c_row = map.c.row + ((i * args.j + j) * dim) as u32;

                for k in 0..args.k {
                    let a_sp = map.a.offset(((i * args.k + k) * dim) as u32);
                    let b_sp = map.b.offset(((k * args.j + j) * dim) as u32);

                    // The true output address rides only on the final
                    // reduction step; a tile with nothing in the accumulator
                    // must overwrite rather than sum with stale data.
                    let out = if k == args.k - 1 {
                        let intent = match args.acc_init {
                            AccInit::Zero => WriteIntent::Overwrite,
                            _ => WriteIntent::Accumulate,
                        };
                        LocalAddr::acc(c_row, intent)
                    } else {
                        LocalAddr::GARBAGE
                    };

                    let a_cols = dim - if k == args.k - 1 { args.pad_k } else { 0 };
                    let a_rows = dim - if i == args.i - 1 { args.pad_i } else { 0 };
                    let b_cols = dim - if j == args.j - 1 { args.pad_j } else { 0 };
                    let b_rows = a_cols;
                    let c_cols = b_cols;
                    let c_rows = a_rows;

                    sink.issue(Instruction::Preload {
                        bd: LocalAddr::GARBAGE,
                        c: out,
                        bd_cols: dim as u16,
                        bd_rows: dim as u16,
                        c_cols: c_cols as u16,
                        c_rows: c_rows as u16,
                    })?;
                    sink.issue(Instruction::Compute {
                        accumulate: k != 0,
                        a: a_sp,
                        bd: b_sp,
                        a_cols: a_cols as u16,
                        a_rows: a_rows as u16,
                        bd_cols: b_cols as u16,
                        bd_rows: b_rows as u16,
                    })?;
                }
            }
        }

        self.move_out_c(op, args, &map, sink)
    }

    /// Single-tile sequence, weight-stationary: for each column tile and
    /// reduction step, preload B once and sweep every row tile in one pass.
    /// The reference hardware prefers row-tile batches of 8; the ordering
    /// here matches its unrolled loop for any row count.
    fn tile_ws<S: InstructionSink>(
        &self,
        op: &MatmulOp,
        args: &TileArgs,
        sink: &mut S,
    ) -> SchedResult<()> {
        let dim = self.config.dim;
        let map = AddressMap::for_matmul_tile(&self.config, args.i, args.j, args.k)?;
        let a_blocks = args.k.min(self.config.max_block_len());

        self.move_in_bias(args, &map, sink)?;
        self.move_in_b(op, args, &map, sink)?;

        sink.issue(Instruction::ConfigLoad {
            stride: (op.a.stride * ELEM_BYTES) as u64,
            scale: op.a_scale,
            shift: 0,
            shrunk: false,
        })?;
        let mut k = 0;
        while k < args.k {
            let blocks = a_blocks.min(args.k - k);
            for i in 0..args.i {
                let dram = args.a + ((i * op.a.stride + k) * dim * ELEM_BYTES) as u64;
                let cols = blocks * dim - if k + blocks >= args.k { args.pad_k } else { 0 };
                let rows = dim - if i == args.i - 1 { args.pad_i } else { 0 };
                sink.issue(Instruction::MoveIn {
                    dram,
                    local: map.a.offset(((i * args.k + k) * dim) as u32),
                    cols: cols as u16,
                    rows: rows as u16,
                })?;
            }
            k += blocks;
        }

        for j in 0..args.j {
            let b_cols = dim - if j == args.j - 1 { args.pad_j } else { 0 };
            let c_cols = b_cols;
            let c_row_base = map.c.row + (j * dim) as u32;

            for k in 0..args.k {
                let b_sp = map.b.offset(((k * args.j + j) * dim) as u32);
                let b_rows = dim - if k == args.k - 1 { args.pad_k } else { 0 };
                let a_cols = b_rows;
                let a_sp = map.a.offset((k * dim) as u32);

                // A fresh tile with no bias overwrites on the first
                // reduction step instead of summing with stale rows.
                let intent = match args.acc_init {
                    AccInit::Zero if k == 0 => WriteIntent::Overwrite,
                    _ => WriteIntent::Accumulate,
                };

                for i in 0..args.i {
                    let rows = dim - if i == args.i - 1 { args.pad_i } else { 0 };
                    let target = LocalAddr::acc(c_row_base + (i * args.j * dim) as u32, intent);

                    if i == 0 {
                        sink.issue(Instruction::Preload {
                            bd: b_sp,
                            c: target,
                            bd_cols: b_cols as u16,
                            bd_rows: b_rows as u16,
                            c_cols: c_cols as u16,
                            c_rows: rows as u16,
                        })?;
                        sink.issue(Instruction::Compute {
                            accumulate: false,
                            a: a_sp,
                            bd: LocalAddr::GARBAGE,
                            a_cols: a_cols as u16,
                            a_rows: rows as u16,
                            bd_cols: dim as u16,
                            bd_rows: dim as u16,
                        })?;
                    } else {
                        sink.issue(Instruction::Preload {
                            bd: LocalAddr::GARBAGE,
                            c: target,
                            bd_cols: b_cols as u16,
                            bd_rows: b_rows as u16,
                            c_cols: c_cols as u16,
                            c_rows: rows as u16,
                        })?;
                        sink.issue(Instruction::Compute {
                            accumulate: true,
                            a: a_sp.offset((i * args.k * dim) as u32),
                            bd: LocalAddr::GARBAGE,
                            a_cols: a_cols as u16,
                            a_rows: rows as u16,
                            bd_cols: dim as u16,
                            bd_rows: dim as u16,
                        })?;
                    }
                }
            }
        }

        self.move_out_c(op, args, &map, sink)
    }

    fn move_out_c<S: InstructionSink>(
        &self,
        op: &MatmulOp,
        args: &TileArgs,
        map: &AddressMap,
        sink: &mut S,
    ) -> SchedResult<()> {
        let Some(c) = args.c else {
            return Ok(());
        };
        let dim = self.config.dim;
        for i in 0..args.i {
            let rows = dim - if i == args.i - 1 { args.pad_i } else { 0 };
            for j in 0..args.j {
                let cols = dim - if j == args.j - 1 { args.pad_j } else { 0 };
                sink.issue(Instruction::MoveOut {
                    dram: c + ((i * op.c.stride + j) * dim * ELEM_BYTES) as u64,
                    local: map.c.offset(((i * args.j + j) * dim) as u32),
                    cols: cols as u16,
                    rows: rows as u16,
                })?;
            }
        }
        Ok(())
    }

    /// Outer loop for problems whose whole reduction dimension fits one
    /// tile: the K loop disappears, A move-in is hoisted out of the column
    /// loop, B move-in rides inside the compute sweep, and the bias is folded
    /// into the move-out pass instead of a full accumulator pre-pass.
    fn outer_fit_c<S: InstructionSink>(
        &self,
        op: &MatmulOp,
        tile: TileShape,
        sink: &mut S,
    ) -> SchedResult<()> {
        let dim = self.config.dim;
        let i_axis = AxisTiling::new(op.dim_i, tile.i, dim);
        let j_axis = AxisTiling::new(op.dim_j, tile.j, dim);
        let k_axis = AxisTiling::new(op.dim_k, tile.k, dim);
        let k = k_axis.extent(0);
        let pad_k = k_axis.pad(0);
        let a_blocks = k.min(self.config.max_block_len());

        sink.issue(Instruction::ConfigEx {
            dataflow: Dataflow::WeightStationary,
            act: op.act,
            sys_shift: 0,
            acc_shift: op.shift,
            relu6_shift: op.relu6_shift,
            conv: None,
        })?;
        sink.issue(Instruction::ConfigStore {
            stride: (op.c.stride * ELEM_BYTES) as u64,
            pool: None,
        })?;

        for i0 in 0..i_axis.tiles {
            let i = i_axis.extent(i0);
            let pad_i = i_axis.pad(i0);

            sink.issue(Instruction::ConfigLoad {
                stride: (op.a.stride * ELEM_BYTES) as u64,
                scale: op.a_scale,
                shift: 0,
                shrunk: false,
            })?;
            let mut kk = 0;
            while kk < k {
                let blocks = a_blocks.min(k - kk);
                let cols = blocks * dim - if kk + blocks >= k { pad_k } else { 0 };
                for ii in 0..i {
                    let dram = op.a.addr
                        + (((i_axis.offset(i0) + ii * dim) * op.a.stride + kk * dim) * ELEM_BYTES)
                            as u64;
                    let rows = dim - if ii == i - 1 { pad_i } else { 0 };
                    sink.issue(Instruction::MoveIn {
                        dram,
                        local: LocalAddr::spad(((ii * k + kk) * dim) as u32),
                        cols: cols as u16,
                        rows: rows as u16,
                    })?;
                }
                kk += blocks;
            }

            for j0 in 0..j_axis.tiles {
                let acc_init = match op.d {
                    Some(d) => {
                        let bias_row = if d.repeating { 0 } else { i_axis.offset(i0) };
                        AccInit::Bias {
                            addr: d.addr
                                + ((bias_row * d.stride + j_axis.offset(j0)) * ACC_BYTES) as u64,
                            stride: d.stride,
                            scale: op.d_scale,
                            repeating: d.repeating,
                        }
                    }
                    None => AccInit::Zero,
                };
                let args = TileArgs {
                    a: 0,
                    b: op.b.addr + ((j_axis.offset(j0)) * ELEM_BYTES) as u64,
                    c: Some(
                        op.c.addr
                            + ((i_axis.offset(i0) * op.c.stride + j_axis.offset(j0)) * ELEM_BYTES)
                                as u64,
                    ),
                    acc_init,
                    i,
                    j: j_axis.extent(j0),
                    k,
                    pad_i,
                    pad_j: j_axis.pad(j0),
                    pad_k,
                };
                self.tile_ws_fit_c(op, &args, sink)?;
            }
        }

        sink.issue(Instruction::Flush)
    }

    /// Single-tile weight-stationary sequence for the fit-C path: A is
    /// already resident, B moves in just ahead of each use, the first
    /// reduction step lands with overwrite intent so no accumulator
    /// pre-pass is needed, and the bias is summed in during move-out.
    fn tile_ws_fit_c<S: InstructionSink>(
        &self,
        op: &MatmulOp,
        args: &TileArgs,
        sink: &mut S,
    ) -> SchedResult<()> {
        let dim = self.config.dim;
        let map = AddressMap::for_matmul_tile(&self.config, args.i, args.j, args.k)?;

        sink.issue(Instruction::ConfigLoad {
            stride: (op.b.stride * ELEM_BYTES) as u64,
            scale: op.b_scale,
            shift: 0,
            shrunk: false,
        })?;

        for j in 0..args.j {
            let b_cols = dim - if j == args.j - 1 { args.pad_j } else { 0 };
            let c_cols = b_cols;

            for k in 0..args.k {
                let b_sp = map.b.offset(((k * args.j + j) * dim) as u32);
                let b_rows = dim - if k == args.k - 1 { args.pad_k } else { 0 };
                let a_cols = b_rows;
                let a_sp = LocalAddr::spad((k * dim) as u32);

                sink.issue(Instruction::MoveIn {
                    dram: args.b + ((k * op.b.stride + j) * dim * ELEM_BYTES) as u64,
                    local: b_sp,
                    cols: b_cols as u16,
                    rows: b_rows as u16,
                })?;

                // First reduction step overwrites, the rest accumulate on
                // the same physical rows.
                let target_base = if k == 0 {
                    LocalAddr::acc((j * dim) as u32, WriteIntent::Overwrite)
                } else {
                    LocalAddr::acc((j * dim) as u32, WriteIntent::Accumulate)
                };

                for i in 0..args.i {
                    let rows = dim - if i == args.i - 1 { args.pad_i } else { 0 };
                    let target = target_base.offset((i * args.j * dim) as u32);

                    if i == 0 {
                        sink.issue(Instruction::Preload {
                            bd: b_sp,
                            c: target,
                            bd_cols: b_cols as u16,
                            bd_rows: b_rows as u16,
                            c_cols: c_cols as u16,
                            c_rows: rows as u16,
                        })?;
                        sink.issue(Instruction::Compute {
                            accumulate: false,
                            a: a_sp,
                            bd: LocalAddr::GARBAGE,
                            a_cols: a_cols as u16,
                            a_rows: rows as u16,
                            bd_cols: dim as u16,
                            bd_rows: dim as u16,
                        })?;
                    } else {
                        sink.issue(Instruction::Preload {
                            bd: LocalAddr::GARBAGE,
                            c: target,
                            bd_cols: b_cols as u16,
                            bd_rows: b_rows as u16,
                            c_cols: c_cols as u16,
                            c_rows: rows as u16,
                        })?;
                        sink.issue(Instruction::Compute {
                            accumulate: true,
                            a: a_sp.offset((i * args.k * dim) as u32),
                            bd: LocalAddr::GARBAGE,
                            a_cols: a_cols as u16,
                            a_rows: rows as u16,
                            bd_cols: dim as u16,
                            bd_rows: dim as u16,
                        })?;
                    }
                }
            }
        }

        // Move-out, with the bias summed into the accumulator rows first.
        if let AccInit::Bias {
            addr,
            stride,
            scale,
            repeating,
        } = args.acc_init
        {
            sink.issue(Instruction::ConfigLoad {
                stride: if repeating {
                    0
                } else {
                    (stride * ACC_BYTES) as u64
                },
                scale,
                shift: 0,
                shrunk: false,
            })?;
            let c = args.c.unwrap_or(0);
            for i in 0..args.i {
                let bias_row = if repeating { 0 } else { i };
                let rows = dim - if i == args.i - 1 { args.pad_i } else { 0 };
                for j in 0..args.j {
                    let cols = dim - if j == args.j - 1 { args.pad_j } else { 0 };
                    let local = LocalAddr::acc(
                        ((i * args.j + j) * dim) as u32,
                        WriteIntent::Accumulate,
                    );
                    sink.issue(Instruction::MoveIn {
                        dram: addr + ((bias_row * stride + j) * dim * ACC_BYTES) as u64,
                        local,
                        cols: cols as u16,
                        rows: rows as u16,
                    })?;
                    sink.issue(Instruction::MoveOut {
                        dram: c + ((i * op.c.stride + j) * dim * ELEM_BYTES) as u64,
                        local,
                        cols: cols as u16,
                        rows: rows as u16,
                    })?;
                }
            }
        } else {
            self.move_out_c(op, args, &map, sink)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::Program;

    #[test]
    fn test_auto_tile_reference_instance() {
        let sched = MatmulScheduler::new(AcceleratorConfig::default());
        // 64 accumulator matrices split 8x8; half the scratchpad holds 512
        // matrices, leaving 64 along K.
        let tile = sched.tile_auto(1000, 1000, 1000);
        assert_eq!(tile, TileShape { i: 8, j: 8, k: 64 });

        let tile = sched.tile_auto(45, 39, 67);
        assert_eq!(tile, TileShape { i: 3, j: 3, k: 5 });
    }

    #[test]
    fn test_auto_tile_deterministic() {
        let sched = MatmulScheduler::new(AcceleratorConfig::default());
        let a = sched.tile_auto(123, 456, 789);
        let b = sched.tile_auto(123, 456, 789);
        assert_eq!(a, b);
    }

    #[test]
    fn test_rejects_bad_tiles() {
        let config = AcceleratorConfig::new(4, 2, 64, 64);
        let sched = MatmulScheduler::new(config);
        let mut program = Program::new(config);
        let op = MatmulOp::new(
            8,
            8,
            8,
            Operand::new(0, 8),
            Operand::new(0, 8),
            Operand::new(0, 8),
        );

        let zero = TileShape { i: 0, j: 1, k: 1 };
        assert!(sched
            .schedule(&op, zero, Dataflow::WeightStationary, &mut program)
            .is_err());

        let oversized = TileShape { i: 3, j: 1, k: 1 };
        assert!(sched
            .schedule(&op, oversized, Dataflow::WeightStationary, &mut program)
            .is_err());

        // A (4*4*4) + B (4*4*4) rows overflow the 128-row scratchpad
        let too_big = TileShape { i: 2, j: 2, k: 2 };
        let op_big = MatmulOp::new(
            32,
            32,
            32,
            Operand::new(0, 32),
            Operand::new(0, 32),
            Operand::new(0, 32),
        );
        assert!(sched
            .schedule(&op_big, too_big, Dataflow::WeightStationary, &mut program)
            .is_err());
    }

    #[test]
    fn test_schedule_emits_flush_last() {
        let config = AcceleratorConfig::default();
        let sched = MatmulScheduler::new(config);
        let mut program = Program::new(config);
        let op = MatmulOp::new(
            16,
            16,
            16,
            Operand::new(0x100, 16),
            Operand::new(0x200, 16),
            Operand::new(0x300, 16),
        );
        sched
            .schedule_auto(&op, Dataflow::OutputStationary, &mut program)
            .unwrap();
        assert!(matches!(
            program.instructions.last(),
            Some(Instruction::Flush)
        ));
        assert!(program.count("compute_preloaded") > 0);
    }
}
