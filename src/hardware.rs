//! Hardware interface definitions for the accelerator
//!
//! Capability descriptor, local address model, the instruction set issued to
//! the accelerator, and the flat main-storage model the instructions address.
//! The raw two-word encoding lives behind `Instruction::encode`; everything
//! else in the crate works with the typed forms.

use serde::{Deserialize, Serialize};

use crate::error::{SchedError, SchedResult};

/// Element type held in the scratchpad and in main-storage operands.
pub type Elem = i8;
/// Accumulator type, also the bias element type.
pub type Acc = i32;
/// Scale factor applied to operands during move-in.
pub type Scale = f32;

pub const ELEM_MAX: Acc = Elem::MAX as Acc;
pub const ELEM_MIN: Acc = Elem::MIN as Acc;
pub const ELEM_BYTES: usize = std::mem::size_of::<Elem>();
pub const ACC_BYTES: usize = std::mem::size_of::<Acc>();

/// Scratchpad/accumulator address width in the instruction encoding.
pub const ADDR_LEN: u32 = 32;

/// Configuration for the target accelerator instance
///
/// The tiling logic takes all capacity decisions from this descriptor, so the
/// same scheduler can target differently-sized instances and be tested
/// against synthetic small ones.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct AcceleratorConfig {
    /// Size of the NxN systolic array (native tile granularity)
    pub dim: usize,
    /// Number of scratchpad banks
    pub bank_num: usize,
    /// Rows per scratchpad bank
    pub bank_rows: usize,
    /// Rows in the accumulator memory
    pub acc_rows: usize,
    /// Largest single move-in request, in bytes per row
    pub max_bytes: usize,
}

impl AcceleratorConfig {
    pub fn new(dim: usize, bank_num: usize, bank_rows: usize, acc_rows: usize) -> Self {
        Self {
            dim,
            bank_num,
            bank_rows,
            acc_rows,
            max_bytes: 64,
        }
    }

    /// Total scratchpad rows across all banks
    pub fn spad_rows(&self) -> usize {
        self.bank_num * self.bank_rows
    }

    /// Largest move-in block length, in matrices of `dim` columns
    pub fn max_block_len(&self) -> usize {
        let len = self.max_bytes / (self.dim * ELEM_BYTES);
        len.max(1)
    }

    /// Largest accumulator move-in block length, in matrices of `dim` columns
    pub fn max_block_len_acc(&self) -> usize {
        let len = self.max_bytes / (self.dim * ACC_BYTES);
        len.max(1)
    }
}

impl Default for AcceleratorConfig {
    /// The reference hardware instance: 16x16 array, 4 banks of 4096 rows,
    /// 1024 accumulator rows.
    fn default() -> Self {
        Self::new(16, 4, 4096, 1024)
    }
}

/// Dataflow discipline of the systolic array
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Dataflow {
    OutputStationary,
    WeightStationary,
}

/// Where a tiled operation should run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExecMode {
    Os,
    Ws,
    Cpu,
}

/// Activation applied when results leave the accumulator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Activation {
    None,
    Relu,
    Relu6,
}

/// Whether a write to the accumulator replaces or adds to the resident value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WriteIntent {
    Overwrite,
    Accumulate,
}

/// Memory space a local address points into
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MemSpace {
    Spad,
    Acc(WriteIntent),
    /// Sentinel address: no transfer happens at this target
    Garbage,
}

/// A scratchpad or accumulator row address
///
/// The accumulator space and the accumulate-vs-overwrite intent are carried
/// explicitly and only packed into the two high address bits by `encode`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalAddr {
    pub space: MemSpace,
    pub row: u32,
}

impl LocalAddr {
    pub const GARBAGE: LocalAddr = LocalAddr {
        space: MemSpace::Garbage,
        row: 0,
    };

    pub fn spad(row: u32) -> Self {
        Self {
            space: MemSpace::Spad,
            row,
        }
    }

    pub fn acc(row: u32, intent: WriteIntent) -> Self {
        Self {
            space: MemSpace::Acc(intent),
            row,
        }
    }

    pub fn is_garbage(&self) -> bool {
        self.space == MemSpace::Garbage
    }

    /// Same address, advanced by `rows`
    pub fn offset(&self, rows: u32) -> Self {
        debug_assert!(!self.is_garbage());
        Self {
            space: self.space,
            row: self.row + rows,
        }
    }

    /// Pack into the hardware address format: bit 31 selects the accumulator
    /// space, bit 30 the accumulate intent.
    pub fn encode(&self) -> u32 {
        match self.space {
            MemSpace::Garbage => u32::MAX,
            MemSpace::Spad => self.row,
            MemSpace::Acc(WriteIntent::Overwrite) => (1 << (ADDR_LEN - 1)) | self.row,
            MemSpace::Acc(WriteIntent::Accumulate) => (3 << (ADDR_LEN - 2)) | self.row,
        }
    }
}

/// The four region bases for one matmul tile
///
/// A grows from scratchpad row 0, B is carved from the top of the scratchpad
/// downward, D and C live in the accumulator space on the same physical rows
/// with different write intents. The two scratchpad regions must never cross.
#[derive(Debug, Clone, Copy)]
pub struct AddressMap {
    pub a: LocalAddr,
    pub b: LocalAddr,
    pub d: LocalAddr,
    pub c: LocalAddr,
}

impl AddressMap {
    /// Region bases for a tile of `tile_i` x `tile_j` x `tile_k` blocks of
    /// `dim`. Fails when A and B together overflow the scratchpad or C
    /// overflows the accumulator.
    pub fn for_matmul_tile(
        config: &AcceleratorConfig,
        tile_i: usize,
        tile_j: usize,
        tile_k: usize,
    ) -> SchedResult<Self> {
        let a_rows = tile_i * tile_k * config.dim;
        let b_rows = tile_k * tile_j * config.dim;
        if a_rows + b_rows > config.spad_rows() {
            return Err(SchedError::capacity(format!(
                "scratchpad cannot hold A ({} rows) and B ({} rows) of {} available",
                a_rows,
                b_rows,
                config.spad_rows()
            )));
        }
        let c_rows = tile_i * tile_j * config.dim;
        if c_rows > config.acc_rows {
            return Err(SchedError::capacity(format!(
                "accumulator cannot hold C ({} rows of {})",
                c_rows, config.acc_rows
            )));
        }
        Ok(Self {
            a: LocalAddr::spad(0),
            b: LocalAddr::spad((config.spad_rows() - b_rows) as u32),
            d: LocalAddr::acc(0, WriteIntent::Overwrite),
            c: LocalAddr::acc(0, WriteIntent::Accumulate),
        })
    }

    /// Region bases for convolution tiles: the top bank is reserved for
    /// weights, inputs grow from row 0.
    pub fn for_conv_tile(config: &AcceleratorConfig) -> Self {
        Self {
            a: LocalAddr::spad(0),
            b: LocalAddr::spad(((config.bank_num - 1) * config.bank_rows) as u32),
            d: LocalAddr::acc(0, WriteIntent::Overwrite),
            c: LocalAddr::acc(0, WriteIntent::Accumulate),
        }
    }
}

/// Implicit-im2col geometry carried by the execute configuration
///
/// `kdim2` is the number of kernel-position steps per output block and
/// `kdim` the kernel width used to split a step into (row, column); the
/// first-layer packed layout uses `kdim == 1` so every step is a whole
/// kernel row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConvGeometry {
    pub ocols: u16,
    pub row_turn: u16,
    pub kdim: u16,
    pub stride: u16,
    pub channels: u16,
    pub row_left: u16,
    pub kdim2: u16,
    pub weight_double_bank: bool,
    pub weight_triple_bank: bool,
}

/// Pooling-aware store configuration
///
/// `pool_stride == 0` selects the identity (flattened) store over
/// `orows` x `ocols` pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorePool {
    pub pool_stride: u16,
    pub pool_size: u16,
    pub out_dim: u16,
    pub porows: u16,
    pub pocols: u16,
    pub orows: u16,
    pub ocols: u16,
    pub upad: u16,
    pub lpad: u16,
}

/// One accelerator instruction
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum Instruction {
    ConfigEx {
        dataflow: Dataflow,
        act: Activation,
        sys_shift: u32,
        acc_shift: u32,
        relu6_shift: u32,
        conv: Option<ConvGeometry>,
    },
    ConfigLoad {
        /// Byte stride between source rows; 0 broadcasts one row
        stride: u64,
        scale: Scale,
        /// Rounding right shift applied on shrunk accumulator loads
        shift: i32,
        /// Source elements are `Elem`-sized even when the target is the
        /// accumulator
        shrunk: bool,
    },
    ConfigStore {
        stride: u64,
        pool: Option<StorePool>,
    },
    MoveIn {
        dram: u64,
        local: LocalAddr,
        cols: u16,
        rows: u16,
    },
    MoveOut {
        dram: u64,
        local: LocalAddr,
        cols: u16,
        rows: u16,
    },
    Preload {
        bd: LocalAddr,
        c: LocalAddr,
        bd_cols: u16,
        bd_rows: u16,
        c_cols: u16,
        c_rows: u16,
    },
    Compute {
        /// Reuse the stationary operand from the previous preload
        accumulate: bool,
        a: LocalAddr,
        bd: LocalAddr,
        a_cols: u16,
        a_rows: u16,
        bd_cols: u16,
        bd_rows: u16,
    },
    Flush,
}

pub const FUNCT_CONFIG: u8 = 0;
pub const FUNCT_MVIN: u8 = 2;
pub const FUNCT_MVOUT: u8 = 3;
pub const FUNCT_COMPUTE_PRELOADED: u8 = 4;
pub const FUNCT_COMPUTE_ACCUMULATE: u8 = 5;
pub const FUNCT_PRELOAD: u8 = 6;
pub const FUNCT_FLUSH: u8 = 7;

const CONFIG_EX: u64 = 0;
const CONFIG_LD: u64 = 1;
const CONFIG_ST: u64 = 2;

fn pack_xfer(rows: u16, cols: u16, addr: u32) -> u64 {
    ((rows as u64) << (ADDR_LEN + 16)) | ((cols as u64) << ADDR_LEN) | addr as u64
}

impl Instruction {
    /// Raw hardware encoding: the funct selector plus the two 64-bit operand
    /// words, bit-for-bit the layout the accelerator decodes.
    pub fn encode(&self) -> (u8, u64, u64) {
        match *self {
            Instruction::ConfigEx {
                dataflow,
                act,
                sys_shift,
                acc_shift,
                relu6_shift,
                conv,
            } => {
                let mode = match dataflow {
                    Dataflow::OutputStationary => 0u64,
                    Dataflow::WeightStationary => 1u64,
                };
                let act = match act {
                    Activation::None => 0u64,
                    Activation::Relu => 1u64,
                    Activation::Relu6 => 2u64,
                };
                let g = conv.unwrap_or(ConvGeometry {
                    ocols: 0,
                    row_turn: 0,
                    kdim: 0,
                    stride: 0,
                    channels: 1,
                    row_left: 0,
                    kdim2: 0,
                    weight_double_bank: false,
                    weight_triple_bank: false,
                });
                let rs1 = ((g.weight_triple_bank as u64) << 59)
                    | ((g.weight_double_bank as u64) << 58)
                    | ((g.row_left as u64) << 54)
                    | ((g.row_turn as u64) << 42)
                    | ((acc_shift as u64) << 32)
                    | (act << 3)
                    | (mode << 2)
                    | CONFIG_EX;
                let rs2 = ((g.ocols as u64) << 56)
                    | ((g.kdim2 as u64) << 50)
                    | ((g.kdim as u64) << 47)
                    | ((relu6_shift as u64) << 32)
                    | ((g.channels as u64) << 23)
                    | ((g.stride as u64) << 20)
                    | sys_shift as u64;
                (FUNCT_CONFIG, rs1, rs2)
            }
            Instruction::ConfigLoad {
                stride,
                scale,
                shift,
                shrunk,
            } => {
                let scale_bits = if shrunk {
                    (shift as f32).to_bits()
                } else {
                    scale.to_bits()
                };
                let rs1 = ((scale_bits as u64) << 32) | ((shrunk as u64) << 2) | CONFIG_LD;
                (FUNCT_CONFIG, rs1, stride)
            }
            Instruction::ConfigStore { stride, pool } => {
                let p = pool.unwrap_or(StorePool {
                    pool_stride: 0,
                    pool_size: 0,
                    out_dim: 0,
                    porows: 0,
                    pocols: 0,
                    orows: 0,
                    ocols: 0,
                    upad: 0,
                    lpad: 0,
                });
                let rs1 = ((p.ocols as u64 & 0xff) << 56)
                    | ((p.orows as u64 & 0xff) << 48)
                    | ((p.pocols as u64 & 0xff) << 40)
                    | ((p.porows as u64 & 0xff) << 32)
                    | ((p.out_dim as u64 & 0xff) << 24)
                    | ((p.lpad as u64) << 10)
                    | ((p.upad as u64) << 8)
                    | ((p.pool_size as u64) << 6)
                    | ((p.pool_stride as u64) << 4)
                    | CONFIG_ST;
                (FUNCT_CONFIG, rs1, stride)
            }
            Instruction::MoveIn {
                dram,
                local,
                cols,
                rows,
            } => (FUNCT_MVIN, dram, pack_xfer(rows, cols, local.encode())),
            Instruction::MoveOut {
                dram,
                local,
                cols,
                rows,
            } => (FUNCT_MVOUT, dram, pack_xfer(rows, cols, local.encode())),
            Instruction::Preload {
                bd,
                c,
                bd_cols,
                bd_rows,
                c_cols,
                c_rows,
            } => (
                FUNCT_PRELOAD,
                pack_xfer(bd_rows, bd_cols, bd.encode()),
                pack_xfer(c_rows, c_cols, c.encode()),
            ),
            Instruction::Compute {
                accumulate,
                a,
                bd,
                a_cols,
                a_rows,
                bd_cols,
                bd_rows,
            } => {
                let funct = if accumulate {
                    FUNCT_COMPUTE_ACCUMULATE
                } else {
                    FUNCT_COMPUTE_PRELOADED
                };
                (
                    funct,
                    pack_xfer(a_rows, a_cols, a.encode()),
                    pack_xfer(bd_rows, bd_cols, bd.encode()),
                )
            }
            Instruction::Flush => (FUNCT_FLUSH, 0, 0),
        }
    }

    pub fn mnemonic(&self) -> &'static str {
        match self {
            Instruction::ConfigEx { .. } => "config_ex",
            Instruction::ConfigLoad { .. } => "config_ld",
            Instruction::ConfigStore { .. } => "config_st",
            Instruction::MoveIn { .. } => "mvin",
            Instruction::MoveOut { .. } => "mvout",
            Instruction::Preload { .. } => "preload",
            Instruction::Compute {
                accumulate: false, ..
            } => "compute_preloaded",
            Instruction::Compute {
                accumulate: true, ..
            } => "compute_accumulated",
            Instruction::Flush => "flush",
        }
    }
}

/// Consumer of the instruction stream
///
/// The tile sequencers only depend on this boundary; a `Program` records the
/// stream, an `Accelerator` executes it.
pub trait InstructionSink {
    fn issue(&mut self, instr: Instruction) -> SchedResult<()>;
}

/// A recorded instruction stream for one tiled operation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Program {
    pub config: AcceleratorConfig,
    pub instructions: Vec<Instruction>,
}

impl Program {
    pub fn new(config: AcceleratorConfig) -> Self {
        Self {
            config,
            instructions: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.instructions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instructions.is_empty()
    }

    /// Number of instructions with the given mnemonic
    pub fn count(&self, mnemonic: &str) -> usize {
        self.instructions
            .iter()
            .filter(|i| i.mnemonic() == mnemonic)
            .count()
    }

    /// Export to JSON format
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }
}

impl InstructionSink for Program {
    fn issue(&mut self, instr: Instruction) -> SchedResult<()> {
        self.instructions.push(instr);
        Ok(())
    }
}

impl std::fmt::Display for Program {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "Instruction stream")?;
        writeln!(f, "==================")?;
        writeln!(
            f,
            "Target: {}x{} array, {} banks x {} rows, {} accumulator rows",
            self.config.dim,
            self.config.dim,
            self.config.bank_num,
            self.config.bank_rows,
            self.config.acc_rows
        )?;
        writeln!(f, "Total instructions: {}", self.len())?;
        for name in [
            "config_ex",
            "config_ld",
            "config_st",
            "mvin",
            "mvout",
            "preload",
            "compute_preloaded",
            "compute_accumulated",
            "flush",
        ] {
            let n = self.count(name);
            if n > 0 {
                writeln!(f, "  {:<20} {}", name, n)?;
            }
        }
        Ok(())
    }
}

/// Bytes reserved at the bottom of main storage as a pinned zero region.
///
/// Move-ins that substitute boundary padding read from here with a broadcast
/// stride instead of a retained software buffer.
pub const ZERO_PAGE_BYTES: usize = 64;

/// Flat byte-addressable main storage shared by the accelerator model, the
/// CPU reference and the callers.
#[derive(Debug, Clone)]
pub struct Dram {
    data: Vec<u8>,
}

impl Dram {
    pub const ZERO_PAGE: u64 = 0;

    pub fn new() -> Self {
        Self {
            data: vec![0; ZERO_PAGE_BYTES],
        }
    }

    /// Reserve `bytes` and return the base address
    pub fn alloc(&mut self, bytes: usize) -> u64 {
        let base = self.data.len() as u64;
        self.data.resize(self.data.len() + bytes, 0);
        base
    }

    pub fn alloc_elems(&mut self, n: usize) -> u64 {
        self.alloc(n * ELEM_BYTES)
    }

    pub fn alloc_accs(&mut self, n: usize) -> u64 {
        self.alloc(n * ACC_BYTES)
    }

    fn check(&self, addr: u64, bytes: usize) -> SchedResult<usize> {
        let addr = addr as usize;
        if addr + bytes > self.data.len() {
            return Err(SchedError::memory(format!(
                "access of {} bytes at {:#x} beyond storage end {:#x}",
                bytes,
                addr,
                self.data.len()
            )));
        }
        Ok(addr)
    }

    pub fn read_elem(&self, addr: u64) -> SchedResult<Elem> {
        let at = self.check(addr, ELEM_BYTES)?;
        Ok(self.data[at] as Elem)
    }

    pub fn write_elem(&mut self, addr: u64, value: Elem) -> SchedResult<()> {
        let at = self.check(addr, ELEM_BYTES)?;
        self.data[at] = value as u8;
        Ok(())
    }

    pub fn read_acc(&self, addr: u64) -> SchedResult<Acc> {
        let at = self.check(addr, ACC_BYTES)?;
        let bytes: [u8; ACC_BYTES] = self.data[at..at + ACC_BYTES].try_into().unwrap_or_default();
        Ok(Acc::from_le_bytes(bytes))
    }

    pub fn write_acc(&mut self, addr: u64, value: Acc) -> SchedResult<()> {
        let at = self.check(addr, ACC_BYTES)?;
        self.data[at..at + ACC_BYTES].copy_from_slice(&value.to_le_bytes());
        Ok(())
    }

    pub fn write_elems(&mut self, addr: u64, values: &[Elem]) -> SchedResult<()> {
        for (i, &v) in values.iter().enumerate() {
            self.write_elem(addr + (i * ELEM_BYTES) as u64, v)?;
        }
        Ok(())
    }

    pub fn read_elems(&self, addr: u64, n: usize) -> SchedResult<Vec<Elem>> {
        (0..n)
            .map(|i| self.read_elem(addr + (i * ELEM_BYTES) as u64))
            .collect()
    }

    pub fn write_accs(&mut self, addr: u64, values: &[Acc]) -> SchedResult<()> {
        for (i, &v) in values.iter().enumerate() {
            self.write_acc(addr + (i * ACC_BYTES) as u64, v)?;
        }
        Ok(())
    }

    pub fn read_accs(&self, addr: u64, n: usize) -> SchedResult<Vec<Acc>> {
        (0..n)
            .map(|i| self.read_acc(addr + (i * ACC_BYTES) as u64))
            .collect()
    }
}

impl Default for Dram {
    fn default() -> Self {
        Self::new()
    }
}

/// Shift while rounding to nearest (ties to even), as the accelerator does
/// when scaling accumulator values down. Negative shifts shift left.
pub fn rounding_right_shift(x: Acc, shift: i32) -> Acc {
    if shift <= 0 {
        return x << (-shift) as u32;
    }
    let shift = shift as u32;
    let r = x >> shift;
    let round_bit = (x >> (shift - 1)) & 1;
    let sticky = if shift <= 1 {
        0
    } else {
        ((x & ((1 << (shift - 1)) - 1)) != 0) as Acc
    };
    let lsb = r & 1;
    r + (round_bit & (sticky | lsb))
}

/// Clamp to the element range
pub fn saturate(x: Acc) -> Elem {
    x.clamp(ELEM_MIN, ELEM_MAX) as Elem
}

/// Scale an accumulator value down, saturate, and apply the activation: the
/// transformation every value undergoes when leaving the accumulator.
pub fn scale_and_sat(x: Acc, act: Activation, shift: u32, relu6_shift: u32) -> Elem {
    let x = rounding_right_shift(x, shift as i32);
    let x = x.clamp(ELEM_MIN, ELEM_MAX);
    let x = match act {
        Activation::None => x,
        Activation::Relu => x.max(0),
        Activation::Relu6 => x.clamp(0, 6 << relu6_shift),
    };
    x as Elem
}

/// Move-in scaling of a scratchpad element
pub fn scale_elem(x: Elem, scale: Scale) -> Elem {
    if scale == 1.0 {
        return x;
    }
    saturate((x as Scale * scale).round() as Acc)
}

/// Move-in scaling of an accumulator element
pub fn scale_acc(x: Acc, scale: Scale) -> Acc {
    if scale == 1.0 {
        return x;
    }
    (x as Scale * scale).round() as Acc
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_capacities() {
        let config = AcceleratorConfig::default();
        assert_eq!(config.spad_rows(), 16384);
        assert_eq!(config.max_block_len(), 4);
        assert_eq!(config.max_block_len_acc(), 1);
    }

    #[test]
    fn test_addr_encoding() {
        assert_eq!(LocalAddr::spad(42).encode(), 42);
        assert_eq!(
            LocalAddr::acc(5, WriteIntent::Overwrite).encode(),
            (1 << 31) | 5
        );
        assert_eq!(
            LocalAddr::acc(5, WriteIntent::Accumulate).encode(),
            (3 << 30) | 5
        );
        assert_eq!(LocalAddr::GARBAGE.encode(), u32::MAX);
    }

    #[test]
    fn test_mvin_encoding() {
        let instr = Instruction::MoveIn {
            dram: 0x1000,
            local: LocalAddr::spad(7),
            cols: 16,
            rows: 12,
        };
        let (funct, rs1, rs2) = instr.encode();
        assert_eq!(funct, FUNCT_MVIN);
        assert_eq!(rs1, 0x1000);
        assert_eq!(rs2, (12u64 << 48) | (16u64 << 32) | 7);
    }

    #[test]
    fn test_matmul_address_map() {
        let config = AcceleratorConfig::new(4, 2, 64, 64);
        let map = AddressMap::for_matmul_tile(&config, 2, 2, 4).unwrap();
        assert_eq!(map.a.row, 0);
        assert_eq!(map.b.row, (128 - 2 * 4 * 4) as u32);

        // A (4*4*4) + B (4*4*4) = 128 rows exactly fills the scratchpad
        assert!(AddressMap::for_matmul_tile(&config, 4, 4, 4).is_err());
        assert!(AddressMap::for_matmul_tile(&config, 2, 4, 4).is_ok());
    }

    #[test]
    fn test_rounding_right_shift() {
        assert_eq!(rounding_right_shift(8, 2), 2);
        assert_eq!(rounding_right_shift(10, 2), 2); // 2.5 -> 2, ties to even
        assert_eq!(rounding_right_shift(6, 2), 2); // 1.5 -> 2
        assert_eq!(rounding_right_shift(7, 2), 2); // 1.75 -> 2
        assert_eq!(rounding_right_shift(5, 2), 1); // 1.25 -> 1
        assert_eq!(rounding_right_shift(4, -1), 8);
    }

    #[test]
    fn test_dram_round_trip() {
        let mut dram = Dram::new();
        let addr = dram.alloc_elems(4);
        dram.write_elems(addr, &[1, -2, 3, -128]).unwrap();
        assert_eq!(dram.read_elems(addr, 4).unwrap(), vec![1, -2, 3, -128]);

        let acc_addr = dram.alloc_accs(2);
        dram.write_accs(acc_addr, &[123456, -7]).unwrap();
        assert_eq!(dram.read_accs(acc_addr, 2).unwrap(), vec![123456, -7]);
    }

    #[test]
    fn test_zero_page() {
        let dram = Dram::new();
        assert_eq!(dram.read_elems(Dram::ZERO_PAGE, 16).unwrap(), vec![0; 16]);
    }
}
