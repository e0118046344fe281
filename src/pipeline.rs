//! Per-image unfold / grouped multiply loops, written once against [Backend].

use crate::{
    backend::{Accumulation, Backend, GemmConfig, GemvConfig, Transpose},
    plan::{BackwardPlan, ForwardPlan},
    tensor::{Element, Error, Stage},
};

pub(crate) struct ForwardBufs<'a, B> {
    pub output: &'a mut B,
    pub data: &'a B,
    pub filters: &'a B,
    pub biases: Option<&'a B>,
    pub workspace: &'a mut B,
    pub ones: Option<&'a B>,
}

pub(crate) struct BackwardBufs<'a, B> {
    pub der_data: Option<&'a mut B>,
    pub der_filters: Option<&'a mut B>,
    pub der_biases: Option<&'a mut B>,
    pub data: Option<&'a B>,
    pub filters: Option<&'a B>,
    pub der_output: &'a B,
    pub workspace: Option<&'a mut B>,
    pub ones: Option<&'a B>,
}

fn missing(what: &str) -> Error {
    Error::ShapeMismatch(format!("{what} is required but was not supplied"))
}

/// `output = output_mult * output + data_mult * conv(data, filters) [+ biases]`, image by image.
pub(crate) fn forward<T: Element, B: Backend<T>>(
    backend: &B,
    plan: &ForwardPlan,
    output_mult: T,
    data_mult: T,
    bufs: ForwardBufs<'_, B::Buf>,
) -> Result<(), Error> {
    let ForwardBufs {
        output,
        data,
        filters,
        biases,
        workspace,
        ones,
    } = bufs;
    let geometry = &plan.geometry;
    let groups = &plan.groups;
    let pixels = groups.num_output_pixels;
    let patches = groups.patches();
    let filter_blocks = groups.filters();
    let output_blocks = groups.outputs();

    let bias = match (plan.has_biases, biases) {
        (false, _) => None,
        (true, Some(biases)) => Some((biases, ones.ok_or_else(|| missing("ones vector"))?)),
        (true, None) => return Err(missing("bias")),
    };

    for n in 0..plan.batch {
        tracing::trace!(image = n, "conv3d forward");
        let image = plan.output_images.block(n);

        backend
            .vol2row(
                B::view_mut(workspace, 0..patches.len())?,
                B::view(data, plan.data_images.block(n))?,
                geometry,
            )
            .map_err(|e| e.at(Stage::Unfold))?;

        for g in 0..groups.num_groups {
            let cfg = GemmConfig {
                transa: Transpose::No,
                transb: Transpose::No,
                m: pixels,
                n: groups.num_filters_per_group,
                k: groups.filter_volume,
                alpha: data_mult,
                lda: pixels,
                ldb: groups.filter_volume,
                beta: output_mult,
                ldc: pixels,
            };
            backend
                .gemm(
                    &cfg,
                    B::view(workspace, patches.block(g))?,
                    B::view(filters, filter_blocks.block(g))?,
                    B::view_mut(output, output_blocks.block_at(image.start, g))?,
                )
                .map_err(|e| e.at(Stage::Multiply))?;
        }

        if let Some((biases, ones)) = bias {
            // rank one update: ones (pixels x 1) times biases (1 x filters)
            let cfg = GemmConfig {
                transa: Transpose::No,
                transb: Transpose::No,
                m: pixels,
                n: plan.num_filters,
                k: 1,
                alpha: T::one(),
                lda: pixels,
                ldb: 1,
                beta: T::one(),
                ldc: pixels,
            };
            backend
                .gemm(
                    &cfg,
                    B::view(ones, 0..pixels)?,
                    B::view(biases, 0..plan.num_filters)?,
                    B::view_mut(output, image)?,
                )
                .map_err(|e| e.at(Stage::BiasBroadcast))?;
        }
    }
    Ok(())
}

/// Computes whichever of the input, filter and bias gradients have a destination.
///
/// Bias and filter gradients sum over the batch: each destination is overwritten by its
/// first image and accumulated into afterwards. The input gradient of every image is
/// independent and overwritten.
pub(crate) fn backward<T: Element, B: Backend<T>>(
    backend: &B,
    plan: &BackwardPlan,
    bufs: BackwardBufs<'_, B::Buf>,
) -> Result<(), Error> {
    let BackwardBufs {
        mut der_data,
        mut der_filters,
        mut der_biases,
        data,
        filters,
        der_output,
        mut workspace,
        ones,
    } = bufs;
    let pixels = plan.num_output_pixels;
    let num_filters = plan.num_filters;

    let mut bias_mode = Accumulation::Overwrite;
    let mut filter_mode = Accumulation::Overwrite;

    for n in 0..plan.batch {
        tracing::trace!(image = n, "conv3d backward");
        let image = plan.der_output_images.block(n);

        if let Some(der_biases) = der_biases.as_deref_mut() {
            let ones = ones.ok_or_else(|| missing("ones vector"))?;
            let cfg = GemvConfig {
                trans: Transpose::Yes,
                m: pixels,
                n: num_filters,
                alpha: T::one(),
                lda: pixels,
                incx: 1,
                beta: bias_mode.beta(),
                incy: 1,
            };
            backend
                .gemv(
                    &cfg,
                    B::view(der_output, image.clone())?,
                    B::view(ones, 0..pixels)?,
                    B::view_mut(der_biases, 0..num_filters)?,
                )
                .map_err(|e| e.at(Stage::BiasReduce))?;
            bias_mode = Accumulation::Accumulate;
        }

        if let Some(der_data) = der_data.as_deref_mut() {
            let spatial = plan.spatial()?;
            let groups = &spatial.groups;
            let patches = groups.patches();
            let filters = filters.ok_or_else(|| missing("filters"))?;
            let workspace = workspace.as_deref_mut().ok_or_else(|| missing("workspace"))?;

            for g in 0..groups.num_groups {
                let cfg = GemmConfig {
                    transa: Transpose::No,
                    transb: Transpose::Yes,
                    m: pixels,
                    n: groups.filter_volume,
                    k: groups.num_filters_per_group,
                    alpha: T::one(),
                    lda: pixels,
                    ldb: groups.filter_volume,
                    beta: Accumulation::Overwrite.beta(),
                    ldc: pixels,
                };
                backend
                    .gemm(
                        &cfg,
                        B::view(der_output, groups.outputs().block_at(image.start, g))?,
                        B::view(filters, groups.filters().block(g))?,
                        B::view_mut(workspace, patches.block(g))?,
                    )
                    .map_err(|e| e.at(Stage::Multiply))?;
            }

            backend
                .row2vol(
                    B::view_mut(der_data, spatial.data_images.block(n))?,
                    B::view(workspace, 0..patches.len())?,
                    &spatial.geometry,
                )
                .map_err(|e| e.at(Stage::Fold))?;
        }

        if let Some(der_filters) = der_filters.as_deref_mut() {
            let spatial = plan.spatial()?;
            let groups = &spatial.groups;
            let patches = groups.patches();
            let data = data.ok_or_else(|| missing("data"))?;
            let workspace = workspace.as_deref_mut().ok_or_else(|| missing("workspace"))?;

            backend
                .vol2row(
                    B::view_mut(workspace, 0..patches.len())?,
                    B::view(data, spatial.data_images.block(n))?,
                    &spatial.geometry,
                )
                .map_err(|e| e.at(Stage::Unfold))?;

            for g in 0..groups.num_groups {
                let cfg = GemmConfig {
                    transa: Transpose::Yes,
                    transb: Transpose::No,
                    m: groups.filter_volume,
                    n: groups.num_filters_per_group,
                    k: pixels,
                    alpha: T::one(),
                    lda: pixels,
                    ldb: pixels,
                    beta: filter_mode.beta(),
                    ldc: groups.filter_volume,
                };
                backend
                    .gemm(
                        &cfg,
                        B::view(workspace, patches.block(g))?,
                        B::view(der_output, groups.outputs().block_at(image.start, g))?,
                        B::view_mut(der_filters, groups.filters().block(g))?,
                    )
                    .map_err(|e| e.at(Stage::Multiply))?;
            }
            filter_mode = Accumulation::Accumulate;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        cpu::Cpu,
        plan::{BackwardShapes, Conv3dParams},
    };

    #[test]
    fn test_forward_single_image_by_hand() -> Result<(), Error> {
        // 3x1x1 input, two channels in two groups, one 2x1x1 filter per group.
        let plan = ForwardPlan::new(
            [2, 1, 1, 2, 1],
            [3, 1, 1, 2, 1],
            [2, 1, 1, 1, 2],
            Some(2),
            &Conv3dParams::default(),
        )?;
        let data = vec![1.0f64, 2.0, 3.0, 10.0, 20.0, 30.0];
        let filters = vec![1.0, -1.0, 0.5, 0.5];
        let biases = vec![100.0, 200.0];
        let mut output = vec![f64::NAN; 4];
        let mut workspace = vec![0.0; plan.workspace_len];
        let ones = vec![1.0; plan.ones_len];
        forward::<f64, Cpu>(
            &Cpu,
            &plan,
            0.0,
            1.0,
            ForwardBufs {
                output: &mut output,
                data: &data,
                filters: &filters,
                biases: Some(&biases),
                workspace: &mut workspace,
                ones: Some(&ones),
            },
        )?;
        assert_eq!(output, vec![99.0, 99.0, 215.0, 225.0]);
        Ok(())
    }

    #[test]
    fn test_backward_bias_only_needs_no_workspace() -> Result<(), Error> {
        let shapes = BackwardShapes {
            num_der_biases: Some(2),
            der_output: [2, 1, 1, 2, 2],
            ..Default::default()
        };
        let plan = BackwardPlan::new(&shapes, &Conv3dParams::default())?;
        let der_output = vec![1.0f32, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0, 8.0];
        let mut der_biases = vec![f32::NAN; 2];
        let ones = vec![1.0; plan.ones_len];
        backward::<f32, Cpu>(
            &Cpu,
            &plan,
            BackwardBufs {
                der_data: None,
                der_filters: None,
                der_biases: Some(&mut der_biases),
                data: None,
                filters: None,
                der_output: &der_output,
                workspace: None,
                ones: Some(&ones),
            },
        )?;
        assert_eq!(der_biases, vec![1.0 + 2.0 + 5.0 + 6.0, 3.0 + 4.0 + 7.0 + 8.0]);
        Ok(())
    }
}
