use crate::{init::*, plan::Conv3dParams, tensor::*};

#[cfg(not(feature = "test-cuda"))]
pub const TEST_DEVICE: Device = Device::Cpu;

#[cfg(feature = "test-cuda")]
pub const TEST_DEVICE: Device = Device::Cuda(0);

#[cfg(not(feature = "test-f64"))]
pub type TestDtype = f32;

#[cfg(feature = "test-f64")]
pub type TestDtype = f64;

pub fn tolerance() -> f64 {
    match TestDtype::DTYPE {
        Dtype::Float32 => 1e-4,
        Dtype::Float64 => 1e-10,
    }
}

pub fn setup() {
    set_default_device(TEST_DEVICE);
    set_default_dtype(TestDtype::DTYPE);
}

pub fn assert_all_close<T: Copy + Into<f64>>(actual: &[T], expected: &[T]) -> Result<(), Error> {
    assert_eq!(actual.len(), expected.len(), "lengths differ");
    let tol = tolerance();
    for (i, (&a, &e)) in actual.iter().zip(expected.iter()).enumerate() {
        let (a, e): (f64, f64) = (a.into(), e.into());
        if a.is_nan() && e.is_nan() {
            continue;
        }
        assert!(
            (a - e).abs() <= tol * (1.0 + e.abs()),
            "index {i}: {a} != {e}\nactual {actual:?}\nexpected {expected:?}",
            actual = actual.iter().map(|&x| x.into()).collect::<Vec<f64>>(),
            expected = expected.iter().map(|&x| x.into()).collect::<Vec<f64>>(),
        );
    }
    Ok(())
}

/// A tensor of the default dtype holding `values`.
pub fn tensor(values: &[f64], shape: impl Into<Vec<usize>>) -> Result<Tensor, Error> {
    match Dtype::default() {
        Dtype::Float32 => {
            let values: Vec<f32> = values.iter().map(|&x| x as f32).collect();
            copy_slice(&values, shape)
        }
        Dtype::Float64 => copy_slice(values, shape),
    }
}

/// Normally distributed values, returned both as a tensor and as they were stored.
pub fn random(shape: impl Into<Vec<usize>>) -> Result<(Tensor, Vec<f64>), Error> {
    let x = sample_normal(shape)?;
    let values = x.to_f64_vec()?;
    Ok((x, values))
}

pub fn dot(a: &[f64], b: &[f64]) -> f64 {
    a.iter().zip(b).map(|(a, b)| a * b).sum()
}

/// Grouped volumetric convolution evaluated directly from its definition.
pub fn direct_conv3d(
    data: &[f64],
    data_dims: [usize; 5],
    filters: &[f64],
    filter_dims: [usize; 5],
    biases: Option<&[f64]>,
    params: &Conv3dParams,
) -> Result<(Vec<f64>, [usize; 5]), Error> {
    let [h, w, t, c, batch] = data_dims;
    let [fh, fw, ft, fc, k] = filter_dims;
    let [oh, ow, ot] = params.output_dims([h, w, t], [fh, fw, ft])?;
    let filters_per_group = k / (c / fc);
    let mut out = vec![0.0; oh * ow * ot * k * batch];
    for n in 0..batch {
        for kk in 0..k {
            let group = kk / filters_per_group;
            for z in 0..ot {
                for x in 0..ow {
                    for y in 0..oh {
                        let mut acc = biases.map_or(0.0, |b| b[kk]);
                        for ci in 0..fc {
                            let ch = group * fc + ci;
                            for dt in 0..ft {
                                for dx in 0..fw {
                                    for dy in 0..fh {
                                        let v = (y * params.stride_y + dy) as isize
                                            - params.pad_top as isize;
                                        let u = (x * params.stride_x + dx) as isize
                                            - params.pad_left as isize;
                                        let s = (z * params.stride_t + dt) as isize
                                            - params.pad_t as isize;
                                        if v < 0
                                            || u < 0
                                            || s < 0
                                            || v >= h as isize
                                            || u >= w as isize
                                            || s >= t as isize
                                        {
                                            continue;
                                        }
                                        let (v, u, s) = (v as usize, u as usize, s as usize);
                                        let d = data[v + h * (u + w * (s + t * (ch + c * n)))];
                                        let f = filters[dy + fh * (dx + fw * (dt + ft * (ci + fc * kk)))];
                                        acc += d * f;
                                    }
                                }
                            }
                        }
                        out[y + oh * (x + ow * (z + ot * (kk + k * n)))] = acc;
                    }
                }
            }
        }
    }
    Ok((out, [oh, ow, ot, k, batch]))
}

/// Channels `start..start + count` of every image of a (h, w, t, c, n) buffer.
pub fn channel_slice(values: &[f64], dims: [usize; 5], start: usize, count: usize) -> Vec<f64> {
    let [h, w, t, c, n] = dims;
    let vol = h * w * t;
    let mut out = Vec::with_capacity(vol * count * n);
    for image in 0..n {
        let base = image * vol * c + start * vol;
        out.extend_from_slice(&values[base..base + vol * count]);
    }
    out
}
