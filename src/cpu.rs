//! CPU reference implementations
//!
//! Straightforward loops with the same mathematical contract as the
//! accelerator path, used as a fallback compute mode and for cross-checking.
//! They share the fixed-point helpers with the accelerator model, including
//! the per-element move-in quantization, so results are bit-identical.

use crate::conv::ConvOp;
use crate::error::SchedResult;
use crate::hardware::{
    rounding_right_shift, scale_acc, scale_and_sat, scale_elem, Acc, Dram, ACC_BYTES, ELEM_BYTES,
    ELEM_MAX, ELEM_MIN,
};
use crate::matmul::MatmulOp;
use crate::resadd::ResaddOp;

/// Reference matmul: `C = act((A x B + D) >> shift)`
pub fn matmul(dram: &mut Dram, op: &MatmulOp) -> SchedResult<()> {
    for i in 0..op.dim_i {
        for j in 0..op.dim_j {
            let mut result: Acc = match op.d {
                Some(d) => {
                    let bias_row = if d.repeating { 0 } else { i };
                    let addr = d.addr + ((bias_row * d.stride + j) * ACC_BYTES) as u64;
                    scale_acc(dram.read_acc(addr)?, op.d_scale)
                }
                None => 0,
            };

            for k in 0..op.dim_k {
                let a = dram.read_elem(op.a.addr + ((i * op.a.stride + k) * ELEM_BYTES) as u64)?;
                let b = dram.read_elem(op.b.addr + ((k * op.b.stride + j) * ELEM_BYTES) as u64)?;
                result +=
                    scale_elem(a, op.a_scale) as Acc * scale_elem(b, op.b_scale) as Acc;
            }

            dram.write_elem(
                op.c.addr + ((i * op.c.stride + j) * ELEM_BYTES) as u64,
                scale_and_sat(result, op.act, op.shift, op.relu6_shift),
            )?;
        }
    }
    Ok(())
}

fn conv_pixel(dram: &Dram, op: &ConvOp, b: usize, orow: usize, ocol: usize, och: usize) -> SchedResult<Acc> {
    let p = &op.params;
    let mut opixel: Acc = match op.bias {
        Some(bias) => dram.read_acc(bias + (och * ACC_BYTES) as u64)?,
        None => 0,
    };

    for krow in 0..p.kernel_dim {
        let irow = (orow * p.stride + krow) as i64 - p.padding as i64;
        for kcol in 0..p.kernel_dim {
            let icol = (ocol * p.stride + kcol) as i64 - p.padding as i64;
            for kch in 0..p.in_channels {
                let ipixel = if irow < 0
                    || irow >= p.in_dim as i64
                    || icol < 0
                    || icol >= p.in_dim as i64
                {
                    0
                } else {
                    let at = ((b * p.in_dim * p.in_dim) as i64
                        + irow * p.in_dim as i64
                        + icol) as usize
                        * p.in_channels
                        + kch;
                    dram.read_elem(op.input + (at * ELEM_BYTES) as u64)?
                };
                let weight = dram.read_elem(
                    op.weights
                        + (((krow * p.kernel_dim * p.in_channels + kcol * p.in_channels + kch)
                            * p.out_channels
                            + och)
                            * ELEM_BYTES) as u64,
                )?;
                opixel += weight as Acc * ipixel as Acc;
            }
        }
    }
    Ok(opixel)
}

fn conv_without_pool(dram: &mut Dram, op: &ConvOp) -> SchedResult<()> {
    let p = op.params;
    for b in 0..p.batch_size {
        for orow in 0..p.out_dim {
            for ocol in 0..p.out_dim {
                for och in 0..p.out_channels {
                    let opixel = conv_pixel(dram, op, b, orow, ocol, och)?;
                    let at = (b * p.out_dim * p.out_dim + orow * p.out_dim + ocol)
                        * p.out_channels
                        + och;
                    dram.write_elem(
                        op.output + (at * ELEM_BYTES) as u64,
                        scale_and_sat(opixel, op.act, op.shift, op.relu6_shift),
                    )?;
                }
            }
        }
    }
    Ok(())
}

/// Reference convolution with optional fused max pooling
pub fn conv(dram: &mut Dram, op: &ConvOp) -> SchedResult<()> {
    let Some(pool) = op.pool.filter(|p| p.stride != 0) else {
        return conv_without_pool(dram, op);
    };

    let p = op.params;
    let pool_out_dim = pool.out_dim(p.out_dim);

    for b in 0..p.batch_size {
        for porow in 0..pool_out_dim {
            for pocol in 0..pool_out_dim {
                for poch in 0..p.out_channels {
                    let mut running_max: Acc = 0;
                    let mut initialized = false;

                    for pwrow in 0..pool.size {
                        let orow = (porow * pool.stride + pwrow) as i64 - pool.padding as i64;
                        for pwcol in 0..pool.size {
                            let ocol = (pocol * pool.stride + pwcol) as i64 - pool.padding as i64;

                            if orow < 0
                                || orow >= p.out_dim as i64
                                || ocol < 0
                                || ocol >= p.out_dim as i64
                            {
                                // A window cell past the output edge floors
                                // the max at zero.
                                if !initialized || running_max < 0 {
                                    running_max = 0;
                                    initialized = true;
                                }
                            } else {
                                let opixel =
                                    conv_pixel(dram, op, b, orow as usize, ocol as usize, poch)?;
                                let opixel = scale_and_sat(
                                    opixel,
                                    op.act,
                                    op.shift,
                                    op.relu6_shift,
                                ) as Acc;
                                if !initialized || opixel > running_max {
                                    running_max = opixel;
                                    initialized = true;
                                }
                            }
                        }
                    }

                    let at = (b * pool_out_dim * pool_out_dim + porow * pool_out_dim + pocol)
                        * p.out_channels
                        + poch;
                    dram.write_elem(op.output + (at * ELEM_BYTES) as u64, running_max as i8)?;
                }
            }
        }
    }
    Ok(())
}

/// Reference depthwise convolution: output channel `och` convolves input
/// channel `och` only
pub fn conv_dw(dram: &mut Dram, op: &ConvOp) -> SchedResult<()> {
    let p = op.params;
    for b in 0..p.batch_size {
        for orow in 0..p.out_dim {
            for ocol in 0..p.out_dim {
                for och in 0..p.out_channels {
                    let mut opixel: Acc = match op.bias {
                        Some(bias) => dram.read_acc(bias + (och * ACC_BYTES) as u64)?,
                        None => 0,
                    };
                    for krow in 0..p.kernel_dim {
                        let irow = (orow * p.stride + krow) as i64 - p.padding as i64;
                        for kcol in 0..p.kernel_dim {
                            let icol = (ocol * p.stride + kcol) as i64 - p.padding as i64;
                            let ipixel = if irow < 0
                                || irow >= p.in_dim as i64
                                || icol < 0
                                || icol >= p.in_dim as i64
                            {
                                0
                            } else {
                                let at = ((b * p.in_dim * p.in_dim) as i64
                                    + irow * p.in_dim as i64
                                    + icol) as usize
                                    * p.in_channels
                                    + och;
                                dram.read_elem(op.input + (at * ELEM_BYTES) as u64)?
                            };
                            let weight = dram.read_elem(
                                op.weights
                                    + (((krow * p.kernel_dim + kcol) * p.out_channels + och)
                                        * ELEM_BYTES) as u64,
                            )?;
                            opixel += weight as Acc * ipixel as Acc;
                        }
                    }
                    let at = (b * p.out_dim * p.out_dim + orow * p.out_dim + ocol)
                        * p.out_channels
                        + och;
                    dram.write_elem(
                        op.output + (at * ELEM_BYTES) as u64,
                        scale_and_sat(opixel, op.act, op.shift, op.relu6_shift),
                    )?;
                }
            }
        }
    }
    Ok(())
}

/// Reference residual add: `C = clamp((A >> shift) + B)` with an optional
/// ReLU floor
pub fn resadd(dram: &mut Dram, op: &ResaddOp) -> SchedResult<()> {
    let minimum = if op.relu { 0 } else { ELEM_MIN };

    for i in 0..op.rows {
        for j in 0..op.cols {
            let at = ((i * op.cols + j) * ELEM_BYTES) as u64;
            let a = dram.read_elem(op.a + at)? as Acc;
            let b = dram.read_elem(op.b + at)? as Acc;
            let result = rounding_right_shift(a, op.shift) + b;
            let result = result.clamp(minimum, ELEM_MAX);
            dram.write_elem(op.c + at, result as i8)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::matmul::{Bias, Operand};

    #[test]
    fn test_matmul_known_values() {
        let mut dram = Dram::new();
        let a = dram.alloc_elems(4);
        let b = dram.alloc_elems(4);
        let c = dram.alloc_elems(4);
        dram.write_elems(a, &[1, 2, 3, 4]).unwrap();
        dram.write_elems(b, &[5, 6, 7, 8]).unwrap();

        let op = MatmulOp::new(2, 2, 2, Operand::new(a, 2), Operand::new(b, 2), Operand::new(c, 2));
        matmul(&mut dram, &op).unwrap();
        assert_eq!(dram.read_elems(c, 4).unwrap(), vec![19, 22, 43, 50]);
    }

    #[test]
    fn test_matmul_bias_and_saturation() {
        let mut dram = Dram::new();
        let a = dram.alloc_elems(1);
        let b = dram.alloc_elems(1);
        let c = dram.alloc_elems(1);
        let d = dram.alloc_accs(1);
        dram.write_elems(a, &[100]).unwrap();
        dram.write_elems(b, &[100]).unwrap();
        dram.write_accs(d, &[50]).unwrap();

        let op = MatmulOp::new(1, 1, 1, Operand::new(a, 1), Operand::new(b, 1), Operand::new(c, 1))
            .with_bias(Bias::new(d, 1));
        matmul(&mut dram, &op).unwrap();
        // 100*100 + 50 saturates to the element maximum
        assert_eq!(dram.read_elems(c, 1).unwrap(), vec![127]);
    }

    #[test]
    fn test_resadd_relu_floor() {
        let mut dram = Dram::new();
        let a = dram.alloc_elems(2);
        let b = dram.alloc_elems(2);
        let c = dram.alloc_elems(2);
        dram.write_elems(a, &[-64, 8]).unwrap();
        dram.write_elems(b, &[-10, 3]).unwrap();

        let mut op = ResaddOp {
            rows: 1,
            cols: 2,
            shift: 1,
            a,
            b,
            c,
            relu: false,
        };
        resadd(&mut dram, &op).unwrap();
        assert_eq!(dram.read_elems(c, 2).unwrap(), vec![-42, 7]);

        op.relu = true;
        resadd(&mut dram, &op).unwrap();
        assert_eq!(dram.read_elems(c, 2).unwrap(), vec![0, 7]);
    }
}
