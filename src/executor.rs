//! Functional model of the accelerator
//!
//! Consumes the instruction stream and mutates scratchpad, accumulator and
//! main storage with the same input/output behavior as the hardware: block
//! move-ins with load-config scaling, preload/compute under both dataflow
//! disciplines, the implicit-im2col compute when the execute config carries
//! convolution geometry, and the pooling-aware structured store. It is not
//! cycle accurate; it exists as the hardware end of the issuer boundary and
//! to cross-check the instruction sequences against the CPU reference.

use crate::error::{SchedError, SchedResult};
use crate::hardware::{
    rounding_right_shift, scale_acc, scale_and_sat, scale_elem, Acc, AcceleratorConfig,
    Activation, ConvGeometry, Dataflow, Dram, Elem, Instruction, InstructionSink, LocalAddr,
    MemSpace, Program, Scale, StorePool, WriteIntent, ACC_BYTES, ELEM_BYTES,
};

#[derive(Debug, Clone, Copy)]
struct LoadState {
    stride: u64,
    scale: Scale,
    shift: i32,
    shrunk: bool,
}

#[derive(Debug, Clone, Copy)]
struct StoreState {
    stride: u64,
    pool: Option<StorePool>,
}

#[derive(Debug, Clone, Copy)]
struct ExecState {
    dataflow: Dataflow,
    act: Activation,
    acc_shift: u32,
    relu6_shift: u32,
    conv: Option<ConvGeometry>,
}

#[derive(Debug, Clone, Copy)]
struct PreloadState {
    bd: LocalAddr,
    c: LocalAddr,
    bd_cols: u16,
    bd_rows: u16,
    c_cols: u16,
    c_rows: u16,
}

/// Executes instructions against simulated scratchpad/accumulator state and
/// a shared `Dram`
pub struct Accelerator<'a> {
    config: AcceleratorConfig,
    dram: &'a mut Dram,
    spad: Vec<Elem>,
    acc_mem: Vec<Acc>,
    load: LoadState,
    store: StoreState,
    exec: ExecState,
    preload: PreloadState,
    /// Stationary operand resident in the array, dim x dim
    stationary: Vec<Elem>,
    /// In-array accumulators for the output-stationary discipline
    array_acc: Vec<Acc>,
    conv_step: usize,
    conv_block: usize,
}

impl<'a> Accelerator<'a> {
    pub fn new(config: AcceleratorConfig, dram: &'a mut Dram) -> Self {
        let dim = config.dim;
        Self {
            config,
            dram,
            spad: vec![0; config.bank_num * config.bank_rows * dim],
            acc_mem: vec![0; config.acc_rows * dim],
            load: LoadState {
                stride: 0,
                scale: 1.0,
                shift: 0,
                shrunk: false,
            },
            store: StoreState {
                stride: 0,
                pool: None,
            },
            exec: ExecState {
                dataflow: Dataflow::WeightStationary,
                act: Activation::None,
                acc_shift: 0,
                relu6_shift: 0,
                conv: None,
            },
            preload: PreloadState {
                bd: LocalAddr::GARBAGE,
                c: LocalAddr::GARBAGE,
                bd_cols: 0,
                bd_rows: 0,
                c_cols: 0,
                c_rows: 0,
            },
            stationary: vec![0; dim * dim],
            array_acc: vec![0; dim * dim],
            conv_step: 0,
            conv_block: 0,
        }
    }

    /// Execute a full recorded program
    pub fn run(&mut self, program: &Program) -> SchedResult<()> {
        for instr in &program.instructions {
            self.execute(*instr)?;
        }
        Ok(())
    }

    pub fn execute(&mut self, instr: Instruction) -> SchedResult<()> {
        match instr {
            Instruction::ConfigEx {
                dataflow,
                act,
                acc_shift,
                relu6_shift,
                conv,
                ..
            } => {
                self.exec = ExecState {
                    dataflow,
                    act,
                    acc_shift,
                    relu6_shift,
                    conv,
                };
                self.conv_step = 0;
                self.conv_block = 0;
                Ok(())
            }
            Instruction::ConfigLoad {
                stride,
                scale,
                shift,
                shrunk,
            } => {
                self.load = LoadState {
                    stride,
                    scale,
                    shift,
                    shrunk,
                };
                Ok(())
            }
            Instruction::ConfigStore { stride, pool } => {
                self.store = StoreState { stride, pool };
                Ok(())
            }
            Instruction::MoveIn {
                dram,
                local,
                cols,
                rows,
            } => self.move_in(dram, local, cols as usize, rows as usize),
            Instruction::MoveOut {
                dram,
                local,
                cols,
                rows,
            } => self.move_out(dram, local, cols as usize, rows as usize),
            Instruction::Preload {
                bd,
                c,
                bd_cols,
                bd_rows,
                c_cols,
                c_rows,
            } => {
                self.preload = PreloadState {
                    bd,
                    c,
                    bd_cols,
                    bd_rows,
                    c_cols,
                    c_rows,
                };
                Ok(())
            }
            Instruction::Compute {
                accumulate,
                a,
                bd,
                a_cols,
                a_rows,
                bd_cols,
                bd_rows,
            } => self.compute(
                accumulate,
                a,
                bd,
                a_cols as usize,
                a_rows as usize,
                bd_cols as usize,
                bd_rows as usize,
            ),
            Instruction::Flush => Ok(()),
        }
    }

    fn spad_at(&self, row: usize, col: usize) -> SchedResult<Elem> {
        let dim = self.config.dim;
        self.spad
            .get(row * dim + col)
            .copied()
            .ok_or_else(|| SchedError::memory(format!("scratchpad row {} out of range", row)))
    }

    fn move_in(&mut self, dram: u64, local: LocalAddr, cols: usize, rows: usize) -> SchedResult<()> {
        if local.is_garbage() {
            return Ok(());
        }
        let dim = self.config.dim;
        if rows > dim {
            return Err(SchedError::config(format!(
                "move-in of {} rows exceeds the array height",
                rows
            )));
        }
        let load = self.load;

        for r in 0..rows {
            let src = dram + r as u64 * load.stride;
            let blocks = cols.div_ceil(dim);
            for blk in 0..blocks {
                let block_cols = dim.min(cols - blk * dim);
                let target_row = local.row as usize + blk * dim + r;
                for c in 0..block_cols {
                    let col_idx = blk * dim + c;
                    match local.space {
                        MemSpace::Spad => {
                            let v = self.dram.read_elem(src + (col_idx * ELEM_BYTES) as u64)?;
                            let at = target_row * dim + c;
                            if at >= self.spad.len() {
                                return Err(SchedError::memory(format!(
                                    "scratchpad row {} out of range",
                                    target_row
                                )));
                            }
                            self.spad[at] = scale_elem(v, load.scale);
                        }
                        MemSpace::Acc(intent) => {
                            let v = if load.shrunk {
                                let e = self.dram.read_elem(src + (col_idx * ELEM_BYTES) as u64)?;
                                rounding_right_shift(e as Acc, load.shift)
                            } else {
                                let a = self.dram.read_acc(src + (col_idx * ACC_BYTES) as u64)?;
                                scale_acc(a, load.scale)
                            };
                            let at = target_row * dim + c;
                            if at >= self.acc_mem.len() {
                                return Err(SchedError::memory(format!(
                                    "accumulator row {} out of range",
                                    target_row
                                )));
                            }
                            match intent {
                                WriteIntent::Overwrite => self.acc_mem[at] = v,
                                WriteIntent::Accumulate => self.acc_mem[at] += v,
                            }
                        }
                        MemSpace::Garbage => {}
                    }
                }
            }
        }
        Ok(())
    }

    fn move_out(&mut self, dram: u64, local: LocalAddr, cols: usize, rows: usize) -> SchedResult<()> {
        if local.is_garbage() {
            return Ok(());
        }
        if rows == 0 {
            return self.structured_store(dram, local, cols);
        }
        let dim = self.config.dim;
        if cols > dim || rows > dim {
            return Err(SchedError::config(
                "plain move-out is limited to one array tile",
            ));
        }

        for r in 0..rows {
            let dst = dram + r as u64 * self.store.stride;
            for c in 0..cols {
                match local.space {
                    MemSpace::Spad => {
                        let v = self.spad_at(local.row as usize + r, c)?;
                        self.dram.write_elem(dst + (c * ELEM_BYTES) as u64, v)?;
                    }
                    MemSpace::Acc(_) => {
                        let at = (local.row as usize + r) * dim + c;
                        let v = *self.acc_mem.get(at).ok_or_else(|| {
                            SchedError::memory("accumulator row out of range".to_string())
                        })?;
                        let v = scale_and_sat(v, self.exec.act, self.exec.acc_shift, self.exec.relu6_shift);
                        self.dram.write_elem(dst + (c * ELEM_BYTES) as u64, v)?;
                    }
                    MemSpace::Garbage => {}
                }
            }
        }
        Ok(())
    }

    /// The `rows == 0` store: walks a whole output tile plane under the
    /// store configuration, max-pooling when a window is configured
    fn structured_store(&mut self, dram: u64, local: LocalAddr, channels: usize) -> SchedResult<()> {
        let dim = self.config.dim;
        let Some(p) = self.store.pool else {
            return Err(SchedError::config(
                "structured store issued without a store configuration",
            ));
        };
        if !matches!(local.space, MemSpace::Acc(_)) {
            return Err(SchedError::config(
                "structured store reads the accumulator",
            ));
        }
        let orows = p.orows as usize;
        let ocols = p.ocols as usize;
        let base_row = local.row as usize;

        let read = |mem: &[Acc], row: usize, ch: usize| -> SchedResult<Acc> {
            mem.get(row * dim + ch)
                .copied()
                .ok_or_else(|| SchedError::memory("accumulator row out of range".to_string()))
        };

        if p.pool_stride == 0 {
            // Identity store of the flattened tile plane.
            for orow in 0..orows {
                for ocol in 0..ocols {
                    let row = base_row + orow * ocols + ocol;
                    let dst = dram + ((orow * p.out_dim as usize + ocol) as u64) * self.store.stride;
                    for ch in 0..channels {
                        let v = read(&self.acc_mem, row, ch)?;
                        let v = scale_and_sat(v, self.exec.act, self.exec.acc_shift, self.exec.relu6_shift);
                        self.dram.write_elem(dst + (ch * ELEM_BYTES) as u64, v)?;
                    }
                }
            }
            return Ok(());
        }

        let pool_stride = p.pool_stride as usize;
        let pool_size = p.pool_size as usize;
        for porow in 0..p.porows as usize {
            for pocol in 0..p.pocols as usize {
                let dst =
                    dram + ((porow * p.out_dim as usize + pocol) as u64) * self.store.stride;
                for ch in 0..channels {
                    let mut running_max: Acc = 0;
                    let mut initialized = false;
                    for pwrow in 0..pool_size {
                        let orow = (porow * pool_stride + pwrow) as i64 - p.upad as i64;
                        for pwcol in 0..pool_size {
                            let ocol = (pocol * pool_stride + pwcol) as i64 - p.lpad as i64;
                            if orow < 0
                                || orow >= orows as i64
                                || ocol < 0
                                || ocol >= ocols as i64
                            {
                                if !initialized || running_max < 0 {
                                    running_max = 0;
                                    initialized = true;
                                }
                            } else {
                                let row =
                                    base_row + orow as usize * ocols + ocol as usize;
                                let v = read(&self.acc_mem, row, ch)?;
                                let v = scale_and_sat(
                                    v,
                                    self.exec.act,
                                    self.exec.acc_shift,
                                    self.exec.relu6_shift,
                                ) as Acc;
                                if !initialized || v > running_max {
                                    running_max = v;
                                    initialized = true;
                                }
                            }
                        }
                    }
                    self.dram
                        .write_elem(dst + (ch * ELEM_BYTES) as u64, running_max as Elem)?;
                }
            }
        }
        Ok(())
    }

    /// Load a spad sub-matrix zero-padded to dim x dim
    fn load_spad_matrix(&self, addr: LocalAddr, rows: usize, cols: usize) -> SchedResult<Vec<Acc>> {
        let dim = self.config.dim;
        if !matches!(addr.space, MemSpace::Spad) {
            return Err(SchedError::config(
                "compute operands must live in the scratchpad",
            ));
        }
        let mut m = vec![0; dim * dim];
        for r in 0..rows.min(dim) {
            for c in 0..cols.min(dim) {
                m[r * dim + c] = self.spad_at(addr.row as usize + r, c)? as Acc;
            }
        }
        Ok(m)
    }

    fn load_stationary(&mut self, addr: LocalAddr, rows: usize, cols: usize) -> SchedResult<()> {
        let m = self.load_spad_matrix(addr, rows, cols)?;
        for (dst, src) in self.stationary.iter_mut().zip(m.iter()) {
            *dst = *src as Elem;
        }
        Ok(())
    }

    /// Write a result matrix to the accumulator with the address's intent
    fn write_result(&mut self, c: LocalAddr, rows: usize, cols: usize, m: &[Acc]) -> SchedResult<()> {
        let dim = self.config.dim;
        let MemSpace::Acc(intent) = c.space else {
            return Err(SchedError::config(
                "compute results must target the accumulator",
            ));
        };
        for r in 0..rows.min(dim) {
            for col in 0..cols.min(dim) {
                let at = (c.row as usize + r) * dim + col;
                if at >= self.acc_mem.len() {
                    return Err(SchedError::memory(
                        "accumulator row out of range".to_string(),
                    ));
                }
                match intent {
                    WriteIntent::Overwrite => self.acc_mem[at] = m[r * dim + col],
                    WriteIntent::Accumulate => self.acc_mem[at] += m[r * dim + col],
                }
            }
        }
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn compute(
        &mut self,
        accumulate: bool,
        a: LocalAddr,
        bd: LocalAddr,
        a_cols: usize,
        a_rows: usize,
        bd_cols: usize,
        bd_rows: usize,
    ) -> SchedResult<()> {
        if let Some(g) = self.exec.conv {
            return self.compute_im2col(g, a, a_cols, a_rows);
        }
        let dim = self.config.dim;
        let p = self.preload;

        match self.exec.dataflow {
            Dataflow::WeightStationary => {
                if !p.bd.is_garbage() {
                    self.load_stationary(p.bd, p.bd_rows as usize, p.bd_cols as usize)?;
                }
                let a_mat = self.load_spad_matrix(a, a_rows, a_cols)?;
                let mut out = vec![0; dim * dim];
                for i in 0..dim {
                    for j in 0..dim {
                        let mut sum: Acc = 0;
                        for k in 0..dim {
                            sum += a_mat[i * dim + k] * self.stationary[k * dim + j] as Acc;
                        }
                        out[i * dim + j] = sum;
                    }
                }
                if !p.c.is_garbage() {
                    self.write_result(p.c, p.c_rows as usize, p.c_cols as usize, &out)?;
                }
                Ok(())
            }
            Dataflow::OutputStationary => {
                let a_mat = self.load_spad_matrix(a, a_rows, a_cols)?;
                let b_mat = self.load_spad_matrix(bd, bd_rows, bd_cols)?;
                for i in 0..dim {
                    for j in 0..dim {
                        let mut sum: Acc = 0;
                        for k in 0..dim {
                            sum += a_mat[i * dim + k] * b_mat[k * dim + j];
                        }
                        let at = i * dim + j;
                        if accumulate {
                            self.array_acc[at] += sum;
                        } else {
                            self.array_acc[at] = sum;
                        }
                    }
                }
                if !p.c.is_garbage() {
                    let snapshot = self.array_acc.clone();
                    self.write_result(p.c, p.c_rows as usize, p.c_cols as usize, &snapshot)?;
                }
                Ok(())
            }
        }
    }

    /// Convolution compute: the receptive-field row for every output pixel
    /// is reconstructed from the configured geometry instead of an explicit
    /// im2col operand
    fn compute_im2col(
        &mut self,
        g: ConvGeometry,
        a: LocalAddr,
        a_cols: usize,
        a_rows: usize,
    ) -> SchedResult<()> {
        let dim = self.config.dim;
        let p = self.preload;

        if !p.bd.is_garbage() {
            self.load_stationary(p.bd, p.bd_rows as usize, p.bd_cols as usize)?;
        }

        let kdim = (g.kdim as usize).max(1);
        let ocols = g.ocols as usize;
        let stride = g.stride as usize;
        let icols = (ocols - 1) * stride + kdim;
        let krow = self.conv_step / kdim;
        let kcol = self.conv_step % kdim;
        let c_cols = p.c_cols as usize;

        let mut out = vec![0; dim * dim];
        for r in 0..a_rows.min(dim) {
            let pix = self.conv_block * dim + r;
            let orow = pix / ocols;
            let ocol = pix % ocols;
            let irow = orow * stride + krow;
            let icol = ocol * stride + kcol;
            let a_row = a.row as usize + irow * icols + icol;
            for j in 0..c_cols.min(dim) {
                let mut sum: Acc = 0;
                for k in 0..a_cols.min(dim) {
                    sum += self.spad_at(a_row, k)? as Acc * self.stationary[k * dim + j] as Acc;
                }
                out[r * dim + j] = sum;
            }
        }
        if !p.c.is_garbage() {
            self.write_result(p.c, p.c_rows as usize, c_cols, &out)?;
        }

        self.conv_step += 1;
        if self.conv_step == g.kdim2 as usize {
            self.conv_step = 0;
            self.conv_block += 1;
            if self.conv_block > g.row_turn as usize {
                self.conv_block = 0;
            }
        }
        Ok(())
    }
}

impl InstructionSink for Accelerator<'_> {
    fn issue(&mut self, instr: Instruction) -> SchedResult<()> {
        self.execute(instr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_config() -> AcceleratorConfig {
        AcceleratorConfig::new(4, 2, 64, 64)
    }

    #[test]
    fn test_spad_round_trip() {
        let config = small_config();
        let mut dram = Dram::new();
        let src = dram.alloc_elems(16);
        let dst = dram.alloc_elems(16);
        let data: Vec<i8> = (0..16).map(|x| x as i8 - 8).collect();
        dram.write_elems(src, &data).unwrap();

        let mut accel = Accelerator::new(config, &mut dram);
        accel
            .execute(Instruction::ConfigLoad {
                stride: 4,
                scale: 1.0,
                shift: 0,
                shrunk: false,
            })
            .unwrap();
        accel
            .execute(Instruction::MoveIn {
                dram: src,
                local: LocalAddr::spad(0),
                cols: 4,
                rows: 4,
            })
            .unwrap();
        accel
            .execute(Instruction::ConfigStore {
                stride: 4,
                pool: None,
            })
            .unwrap();
        accel
            .execute(Instruction::MoveOut {
                dram: dst,
                local: LocalAddr::spad(0),
                cols: 4,
                rows: 4,
            })
            .unwrap();
        drop(accel);

        assert_eq!(dram.read_elems(dst, 16).unwrap(), data);
    }

    #[test]
    fn test_acc_accumulate_intent() {
        let config = small_config();
        let mut dram = Dram::new();
        let src = dram.alloc_accs(4);
        let out = dram.alloc_elems(4);
        dram.write_accs(src, &[5, 6, 7, 8]).unwrap();

        let mut accel = Accelerator::new(config, &mut dram);
        accel
            .execute(Instruction::ConfigLoad {
                stride: 0,
                scale: 1.0,
                shift: 0,
                shrunk: false,
            })
            .unwrap();
        // Same source landed twice: overwrite then accumulate doubles it.
        accel
            .execute(Instruction::MoveIn {
                dram: src,
                local: LocalAddr::acc(0, WriteIntent::Overwrite),
                cols: 4,
                rows: 1,
            })
            .unwrap();
        accel
            .execute(Instruction::MoveIn {
                dram: src,
                local: LocalAddr::acc(0, WriteIntent::Accumulate),
                cols: 4,
                rows: 1,
            })
            .unwrap();
        accel
            .execute(Instruction::ConfigStore {
                stride: 4,
                pool: None,
            })
            .unwrap();
        accel
            .execute(Instruction::MoveOut {
                dram: out,
                local: LocalAddr::acc(0, WriteIntent::Overwrite),
                cols: 4,
                rows: 1,
            })
            .unwrap();
        drop(accel);

        assert_eq!(dram.read_elems(out, 4).unwrap(), vec![10, 12, 14, 16]);
    }

    #[test]
    fn test_ws_single_tile_matmul() {
        let config = small_config();
        let dim = config.dim;
        let mut dram = Dram::new();
        let a = dram.alloc_elems(dim * dim);
        let b = dram.alloc_elems(dim * dim);
        let c = dram.alloc_elems(dim * dim);
        let a_data: Vec<i8> = (0..16).map(|x| x as i8).collect();
        let b_data: Vec<i8> = (0..16).map(|x| (x % 5) as i8).collect();
        dram.write_elems(a, &a_data).unwrap();
        dram.write_elems(b, &b_data).unwrap();

        let mut accel = Accelerator::new(config, &mut dram);
        for instr in [
            Instruction::ConfigEx {
                dataflow: Dataflow::WeightStationary,
                act: Activation::None,
                sys_shift: 0,
                acc_shift: 0,
                relu6_shift: 0,
                conv: None,
            },
            Instruction::ConfigStore {
                stride: 4,
                pool: None,
            },
            Instruction::ConfigLoad {
                stride: 4,
                scale: 1.0,
                shift: 0,
                shrunk: false,
            },
            Instruction::MoveIn {
                dram: a,
                local: LocalAddr::spad(0),
                cols: 4,
                rows: 4,
            },
            Instruction::MoveIn {
                dram: b,
                local: LocalAddr::spad(64),
                cols: 4,
                rows: 4,
            },
            Instruction::Preload {
                bd: LocalAddr::spad(64),
                c: LocalAddr::acc(0, WriteIntent::Overwrite),
                bd_cols: 4,
                bd_rows: 4,
                c_cols: 4,
                c_rows: 4,
            },
            Instruction::Compute {
                accumulate: false,
                a: LocalAddr::spad(0),
                bd: LocalAddr::GARBAGE,
                a_cols: 4,
                a_rows: 4,
                bd_cols: 4,
                bd_rows: 4,
            },
            Instruction::MoveOut {
                dram: c,
                local: LocalAddr::acc(0, WriteIntent::Overwrite),
                cols: 4,
                rows: 4,
            },
        ] {
            accel.execute(instr).unwrap();
        }
        drop(accel);

        // Reference product computed by hand over the same data.
        let mut expected = vec![0i8; dim * dim];
        for i in 0..dim {
            for j in 0..dim {
                let mut sum: i32 = 0;
                for k in 0..dim {
                    sum += a_data[i * dim + k] as i32 * b_data[k * dim + j] as i32;
                }
                expected[i * dim + j] = sum.clamp(-128, 127) as i8;
            }
        }
        assert_eq!(dram.read_elems(c, dim * dim).unwrap(), expected);
    }
}
