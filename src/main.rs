//! Tile scheduler CLI
//!
//! Usage:
//!   systolic-tiler matmul 45 39 67 --bias --shift 4
//!   systolic-tiler conv --in-dim 8 --in-channels 16 --out-channels 32 --kernel 3 --padding 1 --pool 2
//!   systolic-tiler resadd 64 64 --shift 2 --relu
//!
//! Schedules the operation for the configured accelerator, executes the
//! instruction stream on the functional model, cross-checks the result
//! against the CPU reference, and prints a summary (or the program as JSON).

use clap::{Parser, Subcommand};
use colored::Colorize;

use systolic_tiler::{
    cpu, run_conv, run_conv_dw, run_conv_first, run_matmul, run_resadd, AcceleratorConfig,
    ConvOp, ConvParams, Dram, ExecMode, MatmulOp, MatmulScheduler, Operand, PoolParams, Program,
    ResaddOp, SchedResult,
};

#[derive(Parser, Debug)]
#[command(name = "systolic-tiler")]
#[command(author = "FPGA Team")]
#[command(version = "0.1.0")]
#[command(about = "Schedules tiled operations for a systolic array accelerator")]
struct Args {
    #[command(subcommand)]
    command: Command,

    /// Systolic array size (NxN)
    #[arg(short = 'n', long = "array-size", default_value = "16")]
    array_size: usize,

    /// Number of scratchpad banks
    #[arg(long = "banks", default_value = "4")]
    banks: usize,

    /// Rows per scratchpad bank
    #[arg(long = "bank-rows", default_value = "4096")]
    bank_rows: usize,

    /// Accumulator rows
    #[arg(long = "acc-rows", default_value = "1024")]
    acc_rows: usize,

    /// Execution mode: ws, os or cpu
    #[arg(short = 'm', long = "mode", default_value = "ws", value_parser = parse_mode)]
    mode: ExecMode,

    /// Output the instruction stream as JSON
    #[arg(short = 'j', long = "json")]
    json_output: bool,

    /// Verbose output
    #[arg(short = 'v', long = "verbose")]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Tiled matrix multiplication C = A x B (+ bias)
    Matmul {
        i: usize,
        j: usize,
        k: usize,
        #[arg(long)]
        bias: bool,
        #[arg(long, default_value = "0")]
        shift: u32,
        #[arg(long)]
        relu: bool,
    },
    /// Tiled convolution with optional fused max pooling
    Conv {
        #[arg(long, default_value = "1")]
        batch: usize,
        #[arg(long = "in-dim")]
        in_dim: usize,
        #[arg(long = "in-channels")]
        in_channels: usize,
        #[arg(long = "out-channels")]
        out_channels: usize,
        #[arg(long, default_value = "1")]
        stride: usize,
        #[arg(long, default_value = "0")]
        padding: usize,
        #[arg(long)]
        kernel: usize,
        /// Pooling window size (stride defaults to the window size)
        #[arg(long)]
        pool: Option<usize>,
        #[arg(long = "pool-stride")]
        pool_stride: Option<usize>,
        #[arg(long)]
        bias: bool,
        /// Depthwise: one input channel per output channel
        #[arg(long)]
        depthwise: bool,
        /// First-layer path (kernel columns packed into the channel
        /// dimension where they fit)
        #[arg(long)]
        first: bool,
        #[arg(long, default_value = "0")]
        shift: u32,
    },
    /// Tiled residual add C = (A >> shift) + B
    Resadd {
        rows: usize,
        cols: usize,
        #[arg(long, default_value = "0", allow_hyphen_values = true)]
        shift: i32,
        #[arg(long)]
        relu: bool,
    },
}

fn parse_mode(s: &str) -> Result<ExecMode, String> {
    match s.to_lowercase().as_str() {
        "ws" => Ok(ExecMode::Ws),
        "os" => Ok(ExecMode::Os),
        "cpu" => Ok(ExecMode::Cpu),
        other => Err(format!("unknown mode '{}', expected ws, os or cpu", other)),
    }
}

fn fill_elems(dram: &mut Dram, addr: u64, n: usize, seed: &mut u64) -> SchedResult<()> {
    for i in 0..n {
        *seed = seed
            .wrapping_mul(6364136223846793005)
            .wrapping_add(1442695040888963407);
        let v = ((*seed >> 33) % 256) as i64 - 128;
        dram.write_elem(addr + i as u64, v as i8)?;
    }
    Ok(())
}

fn fill_accs(dram: &mut Dram, addr: u64, n: usize, seed: &mut u64) -> SchedResult<()> {
    for i in 0..n {
        *seed = seed
            .wrapping_mul(6364136223846793005)
            .wrapping_add(1442695040888963407);
        let v = ((*seed >> 33) % 2001) as i64 - 1000;
        dram.write_acc(addr + (i * 4) as u64, v as i32)?;
    }
    Ok(())
}

fn main() {
    let args = Args::parse();
    let config = AcceleratorConfig::new(args.array_size, args.banks, args.bank_rows, args.acc_rows);

    let result = match &args.command {
        Command::Matmul {
            i,
            j,
            k,
            bias,
            shift,
            relu,
        } => run_matmul_demo(config, &args, *i, *j, *k, *bias, *shift, *relu),
        Command::Conv {
            batch,
            in_dim,
            in_channels,
            out_channels,
            stride,
            padding,
            kernel,
            pool,
            pool_stride,
            bias,
            depthwise,
            first,
            shift,
        } => run_conv_demo(
            config,
            &args,
            ConvParams::new(
                *batch,
                *in_dim,
                *in_channels,
                *out_channels,
                *stride,
                *padding,
                *kernel,
            ),
            pool.map(|size| PoolParams {
                size,
                stride: pool_stride.unwrap_or(size),
                padding: 0,
            }),
            *bias,
            *depthwise,
            *first,
            *shift,
        ),
        Command::Resadd {
            rows,
            cols,
            shift,
            relu,
        } => run_resadd_demo(config, &args, *rows, *cols, *shift, *relu),
    };

    match result {
        Ok((program, matches)) => {
            if args.json_output {
                match program.to_json() {
                    Ok(json) => println!("{}", json),
                    Err(e) => {
                        eprintln!("{}: failed to serialize program: {}", "Error".red(), e);
                        std::process::exit(1);
                    }
                }
            } else {
                print_program(&program, matches, args.verbose);
            }
            if !matches {
                std::process::exit(1);
            }
        }
        Err(e) => {
            eprintln!("{}: {}", "Scheduling error".red(), e);
            std::process::exit(1);
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn run_matmul_demo(
    config: AcceleratorConfig,
    args: &Args,
    i: usize,
    j: usize,
    k: usize,
    bias: bool,
    shift: u32,
    relu: bool,
) -> SchedResult<(Program, bool)> {
    let mut dram = Dram::new();
    let mut seed = 0x5eed_u64;
    let a = dram.alloc_elems(i * k);
    let b = dram.alloc_elems(k * j);
    let c = dram.alloc_elems(i * j);
    let c_ref = dram.alloc_elems(i * j);
    fill_elems(&mut dram, a, i * k, &mut seed)?;
    fill_elems(&mut dram, b, k * j, &mut seed)?;

    let mut op = MatmulOp::new(
        i,
        j,
        k,
        Operand::new(a, k),
        Operand::new(b, j),
        Operand::new(c, j),
    );
    if bias {
        let d = dram.alloc_accs(i * j);
        fill_accs(&mut dram, d, i * j, &mut seed)?;
        op = op.with_bias(systolic_tiler::Bias::new(d, j));
    }
    op.shift = shift;
    if relu {
        op.act = systolic_tiler::Activation::Relu;
    }

    if args.verbose {
        let tile = MatmulScheduler::new(config).tile_auto(i, j, k);
        println!("{}: {}", "Auto tile (IxJxK blocks)".green(), tile);
    }

    let program = run_matmul(config, &mut dram, &op, args.mode, None)?;

    let mut ref_op = op;
    ref_op.c = Operand::new(c_ref, j);
    cpu::matmul(&mut dram, &ref_op)?;
    let matches = dram.read_elems(c, i * j)? == dram.read_elems(c_ref, i * j)?;
    Ok((program, matches))
}

#[allow(clippy::too_many_arguments)]
fn run_conv_demo(
    config: AcceleratorConfig,
    args: &Args,
    params: ConvParams,
    pool: Option<PoolParams>,
    bias: bool,
    depthwise: bool,
    first: bool,
    shift: u32,
) -> SchedResult<(Program, bool)> {
    let mut dram = Dram::new();
    let mut seed = 0x0ddc_0ffe_u64;
    let p = params;
    let out_px = pool
        .filter(|w| w.stride != 0)
        .map(|w| w.out_dim(p.out_dim))
        .unwrap_or(p.out_dim);
    let out_len = p.batch_size * out_px * out_px * p.out_channels;

    let input = dram.alloc_elems(p.batch_size * p.in_dim * p.in_dim * p.in_channels);
    let n_weights = if depthwise {
        p.kernel_dim * p.kernel_dim * p.out_channels
    } else {
        p.kernel_dim * p.kernel_dim * p.in_channels * p.out_channels
    };
    let weights = dram.alloc_elems(n_weights);
    let output = dram.alloc_elems(out_len);
    let out_ref = dram.alloc_elems(out_len);
    fill_elems(
        &mut dram,
        input,
        p.batch_size * p.in_dim * p.in_dim * p.in_channels,
        &mut seed,
    )?;
    fill_elems(&mut dram, weights, n_weights, &mut seed)?;

    let mut op = ConvOp::new(p, input, weights, output);
    if bias {
        let b = dram.alloc_accs(p.out_channels);
        fill_accs(&mut dram, b, p.out_channels, &mut seed)?;
        op = op.with_bias(b);
    }
    if let Some(pool) = pool {
        op = op.with_pool(pool);
    }
    op.shift = shift;

    let program = if depthwise {
        run_conv_dw(config, &mut dram, &op, args.mode, None)?
    } else if first {
        run_conv_first(config, &mut dram, &op, args.mode, None)?
    } else {
        run_conv(config, &mut dram, &op, args.mode, None)?
    };

    let mut ref_op = op;
    ref_op.output = out_ref;
    if depthwise {
        cpu::conv_dw(&mut dram, &ref_op)?;
    } else {
        cpu::conv(&mut dram, &ref_op)?;
    }
    let matches = dram.read_elems(output, out_len)? == dram.read_elems(out_ref, out_len)?;
    Ok((program, matches))
}

fn run_resadd_demo(
    config: AcceleratorConfig,
    args: &Args,
    rows: usize,
    cols: usize,
    shift: i32,
    relu: bool,
) -> SchedResult<(Program, bool)> {
    let mut dram = Dram::new();
    let mut seed = 0xadd_u64;
    let a = dram.alloc_elems(rows * cols);
    let b = dram.alloc_elems(rows * cols);
    let c = dram.alloc_elems(rows * cols);
    let c_ref = dram.alloc_elems(rows * cols);
    fill_elems(&mut dram, a, rows * cols, &mut seed)?;
    fill_elems(&mut dram, b, rows * cols, &mut seed)?;

    let op = ResaddOp {
        rows,
        cols,
        shift,
        a,
        b,
        c,
        relu,
    };
    let program = run_resadd(config, &mut dram, &op, args.mode)?;

    let mut ref_op = op;
    ref_op.c = c_ref;
    cpu::resadd(&mut dram, &ref_op)?;
    let matches = dram.read_elems(c, rows * cols)? == dram.read_elems(c_ref, rows * cols)?;
    Ok((program, matches))
}

fn print_program(program: &Program, matches: bool, verbose: bool) {
    println!("{}", "Scheduling Results".bold().green());
    println!("{}", "=".repeat(50));
    println!();
    println!(
        "{}: {}x{} systolic array",
        "Target".cyan(),
        program.config.dim,
        program.config.dim
    );
    println!(
        "{}: {} banks x {} rows scratchpad, {} accumulator rows",
        "Memory".cyan(),
        program.config.bank_num,
        program.config.bank_rows,
        program.config.acc_rows
    );
    println!("{}: {}", "Instructions".cyan(), program.len());
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
        let n = program.count(name);
        if n > 0 {
            println!("  {:<20} {}", name, n);
        }
    }
    println!();
    if program.is_empty() {
        println!("({})", "computed on the CPU reference path".yellow());
    }
    if matches {
        println!("{}: accelerator and CPU outputs match", "PASSED".bold().green());
    } else {
        println!("{}: accelerator and CPU outputs differ", "FAILED".bold().red());
    }

    if verbose {
        println!();
        println!("{}", "Instruction stream".bold().yellow());
        println!("{}", "-".repeat(50));
        for (idx, instr) in program.instructions.iter().enumerate() {
            let (funct, rs1, rs2) = instr.encode();
            println!(
                "{:>6}  {:<20} funct={} rs1={:#018x} rs2={:#018x}",
                idx,
                instr.mnemonic(),
                funct,
                rs1,
                rs2
            );
        }
    }
}
