use std::cell::{Ref, RefMut};
use std::ops::{Deref, DerefMut};

use crate::{
    backend::Backend,
    context::{with_default_context, Context, Scratch},
    cpu::Cpu,
    init::zeros_on,
    pipeline::{self, BackwardBufs, ForwardBufs},
    plan::{dims5, BackwardPlan, BackwardShapes, Conv3dParams, ForwardPlan},
    tensor::*,
};

#[cfg(feature = "cuda")]
use crate::cuda::Cuda;

fn check_dtype(expected: Dtype, x: &Tensor) -> Result<(), Error> {
    if x.dtype() != expected {
        return Err(Error::DtypeMismatch {
            expected,
            found: x.dtype(),
        });
    }
    Ok(())
}

fn check_device(expected: Device, x: &Tensor) -> Result<(), Error> {
    if x.device() != expected {
        return Err(Error::DeviceMismatch {
            expected,
            found: x.device(),
        });
    }
    Ok(())
}

fn check_alias(name: &'static str, dst: &Tensor, others: &[Option<&Tensor>]) -> Result<(), Error> {
    if others.iter().flatten().any(|x| dst.is_same_as(x)) {
        return Err(Error::Aliased(name));
    }
    Ok(())
}

fn borrow_mut<'a>(name: &'static str, x: &'a Tensor) -> Result<RefMut<'a, Storage>, Error> {
    x.storage.try_borrow_mut().map_err(|_| Error::Aliased(name))
}

fn buf<'a, T: Element, B: Backend<T>>(
    backend: &B,
    storage: &'a Storage,
) -> Result<&'a B::Buf, Error> {
    B::buf(storage).ok_or(Error::DeviceMismatch {
        expected: backend.device(),
        found: storage.device(),
    })
}

fn buf_mut<'a, T: Element, B: Backend<T>>(
    backend: &B,
    storage: &'a mut Storage,
) -> Result<&'a mut B::Buf, Error> {
    let found = storage.device();
    B::buf_mut(storage).ok_or(Error::DeviceMismatch {
        expected: backend.device(),
        found,
    })
}

fn no_workspace() -> Error {
    Error::compute(Stage::Workspace, "no workspace was acquired")
}

struct ForwardArgs<'a> {
    output_mult: Scalar,
    data_mult: Scalar,
    output: &'a mut Storage,
    data: &'a Storage,
    filters: &'a Storage,
    biases: Option<&'a Storage>,
    scratch: Scratch<'a>,
}

fn forward_on<T: Element, B: Backend<T>>(
    backend: &B,
    plan: &ForwardPlan,
    args: ForwardArgs<'_>,
) -> Result<(), Error> {
    let workspace = args.scratch.workspace.ok_or_else(no_workspace)?;
    let bufs = ForwardBufs {
        output: buf_mut::<T, B>(backend, args.output)?,
        data: buf::<T, B>(backend, args.data)?,
        filters: buf::<T, B>(backend, args.filters)?,
        biases: args.biases.map(|b| buf::<T, B>(backend, b)).transpose()?,
        workspace: buf_mut::<T, B>(backend, workspace)?,
        ones: args.scratch.ones.map(|o| buf::<T, B>(backend, o)).transpose()?,
    };
    pipeline::forward(
        backend,
        plan,
        T::from_scalar(args.output_mult),
        T::from_scalar(args.data_mult),
        bufs,
    )
}

/// Volumetric convolution into a preallocated output:
/// `output = output_mult * output + data_mult * conv(data, filters) [+ biases]`.
///
/// `data` is (height, width, depth, channels, batch) and `filters` is
/// (height, width, depth, channels per group, filters). The filter bank splits into
/// `channels / channels per group` groups that each see their own slice of input channels.
/// Biases are added as is, independent of both multipliers.
///
/// On error the contents of `output` are unspecified.
#[allow(clippy::too_many_arguments)]
pub fn conv3d_forward<S: Into<Scalar>>(
    ctx: &mut Context,
    output: &mut Tensor,
    output_mult: S,
    data: &Tensor,
    data_mult: S,
    filters: &Tensor,
    biases: Option<&Tensor>,
    params: &Conv3dParams,
) -> Result<(), Error> {
    let output_mult = output_mult.into();
    let data_mult = data_mult.into();
    forward_impl(
        ctx,
        output,
        output_mult,
        data,
        data_mult,
        filters,
        biases,
        params,
    )
    .inspect_err(|err| tracing::warn!(%err, stage = ?err.stage(), "conv3d forward failed"))
}

#[allow(clippy::too_many_arguments)]
fn forward_impl(
    ctx: &mut Context,
    output: &mut Tensor,
    output_mult: Scalar,
    data: &Tensor,
    data_mult: Scalar,
    filters: &Tensor,
    biases: Option<&Tensor>,
    params: &Conv3dParams,
) -> Result<(), Error> {
    let dtype = output.dtype();
    let device = output.device();
    for x in [Some(data), Some(filters), biases].into_iter().flatten() {
        check_dtype(dtype, x)?;
        check_device(device, x)?;
    }
    check_alias("output", output, &[Some(data), Some(filters), biases])?;

    let plan = ForwardPlan::new(
        dims5(output.shape())?,
        dims5(data.shape())?,
        dims5(filters.shape())?,
        biases.map(Tensor::numel),
        params,
    )?;
    tracing::debug!(
        num_groups = plan.groups.num_groups,
        filter_volume = plan.groups.filter_volume,
        output_pixels = plan.groups.num_output_pixels,
        batch = plan.batch,
        workspace_len = plan.workspace_len,
        "planned conv3d forward"
    );
    if plan.batch == 0 || device == Device::Phantom {
        return Ok(());
    }

    let scratch = ctx.acquire(device, dtype, plan.workspace_len, plan.ones_len)?;
    let mut output = borrow_mut("output", output)?;
    let data = data.storage.borrow();
    let filters = filters.storage.borrow();
    let biases: Option<Ref<'_, Storage>> = biases.map(|b| b.storage.borrow());
    let args = ForwardArgs {
        output_mult,
        data_mult,
        output: output.deref_mut(),
        data: data.deref(),
        filters: filters.deref(),
        biases: biases.as_deref(),
        scratch,
    };

    match (device, dtype) {
        (Device::Phantom, _) => Ok(()),
        (Device::Cpu, Dtype::Float32) => forward_on::<f32, _>(&Cpu, &plan, args),
        (Device::Cpu, Dtype::Float64) => forward_on::<f64, _>(&Cpu, &plan, args),
        #[cfg(feature = "cuda")]
        (Device::Cuda(ordinal), Dtype::Float32) => {
            forward_on::<f32, _>(&Cuda::new(ordinal)?, &plan, args)
        }
        #[cfg(feature = "cuda")]
        (Device::Cuda(ordinal), Dtype::Float64) => {
            forward_on::<f64, _>(&Cuda::new(ordinal)?, &plan, args)
        }
        #[cfg(not(feature = "cuda"))]
        (Device::Cuda(_), _) => Err(Error::DeviceUnavailable(device)),
    }
}

struct BackwardArgs<'a> {
    der_data: Option<&'a mut Storage>,
    der_filters: Option<&'a mut Storage>,
    der_biases: Option<&'a mut Storage>,
    data: Option<&'a Storage>,
    filters: Option<&'a Storage>,
    der_output: &'a Storage,
    scratch: Scratch<'a>,
}

fn backward_on<T: Element, B: Backend<T>>(
    backend: &B,
    plan: &BackwardPlan,
    args: BackwardArgs<'_>,
) -> Result<(), Error> {
    let bufs = BackwardBufs {
        der_data: args.der_data.map(|s| buf_mut::<T, B>(backend, s)).transpose()?,
        der_filters: args.der_filters.map(|s| buf_mut::<T, B>(backend, s)).transpose()?,
        der_biases: args.der_biases.map(|s| buf_mut::<T, B>(backend, s)).transpose()?,
        data: args.data.map(|s| buf::<T, B>(backend, s)).transpose()?,
        filters: args.filters.map(|s| buf::<T, B>(backend, s)).transpose()?,
        der_output: buf::<T, B>(backend, args.der_output)?,
        workspace: args
            .scratch
            .workspace
            .map(|s| buf_mut::<T, B>(backend, s))
            .transpose()?,
        ones: args.scratch.ones.map(|s| buf::<T, B>(backend, s)).transpose()?,
    };
    if plan.spatial.is_some() && bufs.workspace.is_none() {
        return Err(no_workspace());
    }
    pipeline::backward(backend, plan, bufs)
}

/// Gradients of [conv3d_forward] with respect to its input, filters and biases.
///
/// Only gradients with a destination are computed. The input gradient needs `filters`,
/// the filter gradient needs `data`; a missing requirement is a shape mismatch. Filter and
/// bias gradients are sums over the batch and overwrite their destinations, which need not
/// be zeroed beforehand.
///
/// On error the contents of every destination are unspecified.
#[allow(clippy::too_many_arguments)]
pub fn conv3d_backward(
    ctx: &mut Context,
    der_data: Option<&mut Tensor>,
    der_filters: Option<&mut Tensor>,
    der_biases: Option<&mut Tensor>,
    data: Option<&Tensor>,
    filters: Option<&Tensor>,
    der_output: &Tensor,
    params: &Conv3dParams,
) -> Result<(), Error> {
    backward_impl(
        ctx,
        der_data,
        der_filters,
        der_biases,
        data,
        filters,
        der_output,
        params,
    )
    .inspect_err(|err| tracing::warn!(%err, stage = ?err.stage(), "conv3d backward failed"))
}

#[allow(clippy::too_many_arguments)]
fn backward_impl(
    ctx: &mut Context,
    der_data: Option<&mut Tensor>,
    der_filters: Option<&mut Tensor>,
    der_biases: Option<&mut Tensor>,
    data: Option<&Tensor>,
    filters: Option<&Tensor>,
    der_output: &Tensor,
    params: &Conv3dParams,
) -> Result<(), Error> {
    let dtype = der_output.dtype();
    let device = der_output.device();
    let der_data = der_data.as_deref();
    let der_filters = der_filters.as_deref();
    let der_biases = der_biases.as_deref();

    for x in [der_data, der_filters, der_biases, data, filters]
        .into_iter()
        .flatten()
    {
        check_dtype(dtype, x)?;
        check_device(device, x)?;
    }
    let inputs = [data, filters, Some(der_output)];
    if let Some(x) = der_data {
        check_alias("der_data", x, &inputs)?;
        check_alias("der_data", x, &[der_filters, der_biases])?;
    }
    if let Some(x) = der_filters {
        check_alias("der_filters", x, &inputs)?;
        check_alias("der_filters", x, &[der_biases])?;
    }
    if let Some(x) = der_biases {
        check_alias("der_biases", x, &inputs)?;
    }

    let dims = |x: Option<&Tensor>| x.map(|x| dims5(x.shape())).transpose();
    let shapes = BackwardShapes {
        der_data: dims(der_data)?,
        der_filters: dims(der_filters)?,
        num_der_biases: der_biases.map(Tensor::numel),
        data: dims(data)?,
        filters: dims(filters)?,
        der_output: dims5(der_output.shape())?,
    };
    let plan = BackwardPlan::new(&shapes, params)?;
    tracing::debug!(
        der_data = plan.der_data,
        der_filters = plan.der_filters,
        der_biases = plan.der_biases,
        num_groups = ?plan.spatial.map(|s| s.groups.num_groups),
        batch = plan.batch,
        workspace_len = plan.workspace_len,
        "planned conv3d backward"
    );
    if device == Device::Phantom {
        return Ok(());
    }
    if plan.batch == 0 || plan.num_output_pixels == 0 {
        // sums with no terms
        for x in [der_filters, der_biases].into_iter().flatten() {
            x.fill_storage_with_zeros()?;
        }
        return Ok(());
    }

    let scratch = ctx.acquire(device, dtype, plan.workspace_len, plan.ones_len)?;
    let mut der_data = der_data.map(|x| borrow_mut("der_data", x)).transpose()?;
    let mut der_filters = der_filters
        .map(|x| borrow_mut("der_filters", x))
        .transpose()?;
    let mut der_biases = der_biases
        .map(|x| borrow_mut("der_biases", x))
        .transpose()?;
    let data = data.map(|x| x.storage.borrow());
    let filters = filters.map(|x| x.storage.borrow());
    let der_output = der_output.storage.borrow();
    let args = BackwardArgs {
        der_data: der_data.as_deref_mut(),
        der_filters: der_filters.as_deref_mut(),
        der_biases: der_biases.as_deref_mut(),
        data: data.as_deref(),
        filters: filters.as_deref(),
        der_output: der_output.deref(),
        scratch,
    };

    match (device, dtype) {
        (Device::Phantom, _) => Ok(()),
        (Device::Cpu, Dtype::Float32) => backward_on::<f32, _>(&Cpu, &plan, args),
        (Device::Cpu, Dtype::Float64) => backward_on::<f64, _>(&Cpu, &plan, args),
        #[cfg(feature = "cuda")]
        (Device::Cuda(ordinal), Dtype::Float32) => {
            backward_on::<f32, _>(&Cuda::new(ordinal)?, &plan, args)
        }
        #[cfg(feature = "cuda")]
        (Device::Cuda(ordinal), Dtype::Float64) => {
            backward_on::<f64, _>(&Cuda::new(ordinal)?, &plan, args)
        }
        #[cfg(not(feature = "cuda"))]
        (Device::Cuda(_), _) => Err(Error::DeviceUnavailable(device)),
    }
}

impl Tensor {
    /// Convolves `self` with `filters`, returning a freshly allocated output on the same
    /// device. Uses this thread's default [Context].
    pub fn conv3d(
        &self,
        filters: &Tensor,
        biases: Option<&Tensor>,
        params: &Conv3dParams,
    ) -> Result<Tensor, Error> {
        let [h, w, t, _, batch] = dims5(self.shape())?;
        let [fh, fw, ft, _, num_filters] = dims5(filters.shape())?;
        let [oh, ow, ot] = params.output_dims([h, w, t], [fh, fw, ft])?;
        let mut output = zeros_on([oh, ow, ot, num_filters, batch], self.dtype(), self.device())?;
        with_default_context(|ctx| {
            conv3d_forward(
                ctx,
                &mut output,
                self.dtype().zero(),
                self,
                self.dtype().one(),
                filters,
                biases,
                params,
            )
        })?;
        Ok(output)
    }
}
