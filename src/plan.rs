//! Shape and group planning for volumetric convolution.
//!
//! Everything here is a pure function of tensor extents. A plan is built, checked and sized
//! (workspace included) before any buffer is touched.

use std::ops::Range;

use crate::tensor::Error;

/// Strides and zero padding of a volumetric convolution.
///
/// Time padding is applied on both ends of the time axis.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Conv3dParams {
    pub stride_y: usize,
    pub stride_x: usize,
    pub stride_t: usize,
    pub pad_top: usize,
    pub pad_bottom: usize,
    pub pad_left: usize,
    pub pad_right: usize,
    pub pad_t: usize,
}

impl Default for Conv3dParams {
    fn default() -> Self {
        Self {
            stride_y: 1,
            stride_x: 1,
            stride_t: 1,
            pad_top: 0,
            pad_bottom: 0,
            pad_left: 0,
            pad_right: 0,
            pad_t: 0,
        }
    }
}

impl Conv3dParams {
    pub fn with_stride(mut self, y: usize, x: usize, t: usize) -> Self {
        self.stride_y = y;
        self.stride_x = x;
        self.stride_t = t;
        self
    }

    pub fn with_padding(
        mut self,
        top: usize,
        bottom: usize,
        left: usize,
        right: usize,
        t: usize,
    ) -> Self {
        self.pad_top = top;
        self.pad_bottom = bottom;
        self.pad_left = left;
        self.pad_right = right;
        self.pad_t = t;
        self
    }

    /// Output (height, width, depth) for an input of `data` extents and a filter of
    /// `filter` extents.
    pub fn output_dims(&self, data: [usize; 3], filter: [usize; 3]) -> Result<[usize; 3], Error> {
        if self.stride_y == 0 || self.stride_x == 0 || self.stride_t == 0 {
            return Err(Error::ShapeMismatch(format!(
                "strides must be positive, got ({}, {}, {})",
                self.stride_y, self.stride_x, self.stride_t
            )));
        }
        let padded = [
            data[0] + self.pad_top + self.pad_bottom,
            data[1] + self.pad_left + self.pad_right,
            data[2] + 2 * self.pad_t,
        ];
        let strides = [self.stride_y, self.stride_x, self.stride_t];
        let mut out = [0; 3];
        for axis in 0..3 {
            if filter[axis] == 0 || padded[axis] < filter[axis] {
                return Err(Error::ShapeMismatch(format!(
                    "filter extents {filter:?} do not fit padded input extents {padded:?}"
                )));
            }
            out[axis] = (padded[axis] - filter[axis]) / strides[axis] + 1;
        }
        Ok(out)
    }
}

/// Reads a shape as (height, width, depth, channels, batch).
pub fn dims5(shape: &[usize]) -> Result<[usize; 5], Error> {
    if shape.iter().skip(5).any(|&d| d != 1) {
        return Err(Error::ShapeMismatch(format!(
            "expected at most 5 non-singleton dimensions, got {shape:?}"
        )));
    }
    let mut dims = [1; 5];
    for (d, &s) in dims.iter_mut().zip(shape.iter()) {
        *d = s;
    }
    Ok(dims)
}

/// `count` equally sized, contiguous blocks of `block_len` elements.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Partition {
    pub block_len: usize,
    pub count: usize,
}

impl Partition {
    pub fn new(block_len: usize, count: usize) -> Self {
        Self { block_len, count }
    }

    pub fn len(&self) -> usize {
        self.block_len * self.count
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn block(&self, i: usize) -> Range<usize> {
        self.block_at(0, i)
    }

    /// Block `i` of a partition that starts at `base`.
    pub fn block_at(&self, base: usize, i: usize) -> Range<usize> {
        debug_assert!(i < self.count);
        let start = base + i * self.block_len;
        start..start + self.block_len
    }
}

/// Everything the unfold/fold transforms need to know about one image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Geometry {
    pub height: usize,
    pub width: usize,
    pub depth: usize,
    pub channels: usize,
    pub filter_height: usize,
    pub filter_width: usize,
    pub filter_depth: usize,
    pub stride_y: usize,
    pub stride_x: usize,
    pub stride_t: usize,
    pub pad_top: usize,
    pub pad_left: usize,
    pub pad_t: usize,
    pub out_height: usize,
    pub out_width: usize,
    pub out_depth: usize,
}

impl Geometry {
    pub fn new(data: [usize; 4], filter: [usize; 3], params: &Conv3dParams) -> Result<Self, Error> {
        let [out_height, out_width, out_depth] =
            params.output_dims([data[0], data[1], data[2]], filter)?;
        Ok(Self {
            height: data[0],
            width: data[1],
            depth: data[2],
            channels: data[3],
            filter_height: filter[0],
            filter_width: filter[1],
            filter_depth: filter[2],
            stride_y: params.stride_y,
            stride_x: params.stride_x,
            stride_t: params.stride_t,
            pad_top: params.pad_top,
            pad_left: params.pad_left,
            pad_t: params.pad_t,
            out_height,
            out_width,
            out_depth,
        })
    }

    pub fn num_output_pixels(&self) -> usize {
        self.out_height * self.out_width * self.out_depth
    }

    /// Columns of the patch matrix: one per filter tap and input channel.
    pub fn patch_len(&self) -> usize {
        self.filter_height * self.filter_width * self.filter_depth * self.channels
    }

    /// Elements of one image.
    pub fn volume(&self) -> usize {
        self.height * self.width * self.depth * self.channels
    }

    /// Elements of the unfolded patch matrix of one image.
    pub fn rows_len(&self) -> usize {
        self.num_output_pixels() * self.patch_len()
    }

    /// Information passed to device kernels, in the order they unpack it.
    pub fn info(&self) -> Vec<usize> {
        vec![
            self.height,
            self.width,
            self.depth,
            self.channels,
            self.filter_height,
            self.filter_width,
            self.filter_depth,
            self.stride_y,
            self.stride_x,
            self.stride_t,
            self.pad_top,
            self.pad_left,
            self.pad_t,
            self.out_height,
            self.out_width,
            self.out_depth,
        ]
    }
}

/// How filters, patches and outputs split into independent groups.
///
/// ```text
///                   filter_volume               filters_per_group
///                 +------------+------------+   +-----------+-----------+
///                 |            |            |   |  group 0  |     0     |
///  output_pixels  |  group 0   |  group 1   | x +-----------+-----------+
///                 |            |            |   |     0     |  group 1  |
///                 +------------+------------+   +-----------+-----------+
///                          patches                       filters
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GroupLayout {
    pub num_groups: usize,
    pub num_filters_per_group: usize,
    pub num_output_pixels: usize,
    pub filter_volume: usize,
}

impl GroupLayout {
    /// Derives the grouping of `channels` input channels convolved with a filter bank of
    /// `filter` = (height, width, depth, channels per group, filters).
    pub fn new(channels: usize, filter: [usize; 5], num_output_pixels: usize) -> Result<Self, Error> {
        let [fh, fw, ft, filter_channels, num_filters] = filter;
        if filter_channels == 0 || channels % filter_channels != 0 || channels < filter_channels {
            return Err(Error::ShapeMismatch(format!(
                "input has {channels} channels, which is not a positive multiple of the filter's {filter_channels}"
            )));
        }
        let num_groups = channels / filter_channels;
        if num_filters % num_groups != 0 {
            return Err(Error::ShapeMismatch(format!(
                "{num_filters} filters cannot be split into {num_groups} groups"
            )));
        }
        Ok(Self {
            num_groups,
            num_filters_per_group: num_filters / num_groups,
            num_output_pixels,
            filter_volume: fh * fw * ft * filter_channels,
        })
    }

    pub fn filters(&self) -> Partition {
        Partition::new(
            self.filter_volume * self.num_filters_per_group,
            self.num_groups,
        )
    }

    pub fn patches(&self) -> Partition {
        Partition::new(self.num_output_pixels * self.filter_volume, self.num_groups)
    }

    pub fn outputs(&self) -> Partition {
        Partition::new(
            self.num_output_pixels * self.num_filters_per_group,
            self.num_groups,
        )
    }

    pub fn scratch_len(&self) -> usize {
        self.patches().len()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ForwardPlan {
    pub geometry: Geometry,
    pub groups: GroupLayout,
    pub batch: usize,
    pub num_filters: usize,
    pub data_images: Partition,
    pub output_images: Partition,
    pub has_biases: bool,
    pub workspace_len: usize,
    pub ones_len: usize,
}

impl ForwardPlan {
    pub fn new(
        output: [usize; 5],
        data: [usize; 5],
        filters: [usize; 5],
        num_biases: Option<usize>,
        params: &Conv3dParams,
    ) -> Result<Self, Error> {
        let [h, w, t, c, batch] = data;
        let [fh, fw, ft, _, num_filters] = filters;
        let geometry = Geometry::new([h, w, t, c], [fh, fw, ft], params)?;
        let groups = GroupLayout::new(c, filters, geometry.num_output_pixels())?;

        let expected = [
            geometry.out_height,
            geometry.out_width,
            geometry.out_depth,
            num_filters,
            batch,
        ];
        if output != expected {
            return Err(Error::ShapeMismatch(format!(
                "output has extents {output:?}, expected {expected:?}"
            )));
        }
        if let Some(n) = num_biases {
            if n != num_filters {
                return Err(Error::ShapeMismatch(format!(
                    "{n} biases for {num_filters} filters"
                )));
            }
        }

        let pixels = geometry.num_output_pixels();
        Ok(Self {
            geometry,
            groups,
            batch,
            num_filters,
            data_images: Partition::new(geometry.volume(), batch),
            output_images: Partition::new(pixels * num_filters, batch),
            has_biases: num_biases.is_some(),
            workspace_len: groups.scratch_len(),
            ones_len: if num_biases.is_some() { pixels } else { 0 },
        })
    }
}

/// The part of a backward plan that exists when the input or filter gradient is requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpatialPlan {
    pub geometry: Geometry,
    pub groups: GroupLayout,
    pub data_images: Partition,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackwardPlan {
    pub batch: usize,
    pub num_output_pixels: usize,
    pub num_filters: usize,
    pub der_output_images: Partition,
    pub spatial: Option<SpatialPlan>,
    pub der_data: bool,
    pub der_filters: bool,
    pub der_biases: bool,
    pub workspace_len: usize,
    pub ones_len: usize,
}

/// Extents of the tensors taking part in a backward call. `None` marks an absent tensor.
#[derive(Debug, Clone, Copy, Default)]
pub struct BackwardShapes {
    pub der_data: Option<[usize; 5]>,
    pub der_filters: Option<[usize; 5]>,
    pub num_der_biases: Option<usize>,
    pub data: Option<[usize; 5]>,
    pub filters: Option<[usize; 5]>,
    pub der_output: [usize; 5],
}

impl BackwardPlan {
    pub fn new(shapes: &BackwardShapes, params: &Conv3dParams) -> Result<Self, Error> {
        let [oh, ow, ot, num_filters, batch] = shapes.der_output;
        let num_output_pixels = oh * ow * ot;

        if let (Some(der_data), Some(data)) = (shapes.der_data, shapes.data) {
            if der_data != data {
                return Err(Error::ShapeMismatch(format!(
                    "input gradient has extents {der_data:?}, input has {data:?}"
                )));
            }
        }
        if let (Some(der_filters), Some(filters)) = (shapes.der_filters, shapes.filters) {
            if der_filters != filters {
                return Err(Error::ShapeMismatch(format!(
                    "filter gradient has extents {der_filters:?}, filters have {filters:?}"
                )));
            }
        }

        // The input gradient is shaped by the filters it is multiplied with, the filter
        // gradient by the data it is correlated with.
        let volume_and_filter = match (shapes.der_data, shapes.der_filters) {
            (Some(der_data), _) => {
                let filters = shapes.filters.ok_or_else(|| {
                    Error::ShapeMismatch("input gradient requested without filters".into())
                })?;
                Some((der_data, filters))
            }
            (None, Some(der_filters)) => {
                let data = shapes.data.ok_or_else(|| {
                    Error::ShapeMismatch("filter gradient requested without input data".into())
                })?;
                Some((data, der_filters))
            }
            (None, None) => None,
        };
        if shapes.der_filters.is_some() && shapes.data.is_none() {
            return Err(Error::ShapeMismatch(
                "filter gradient requested without input data".into(),
            ));
        }

        let spatial = match volume_and_filter {
            Some((volume, filter)) => {
                let [h, w, t, c, n] = volume;
                let [fh, fw, ft, _, k] = filter;
                let geometry = Geometry::new([h, w, t, c], [fh, fw, ft], params)?;
                let groups = GroupLayout::new(c, filter, geometry.num_output_pixels())?;
                let expected = [
                    geometry.out_height,
                    geometry.out_width,
                    geometry.out_depth,
                    k,
                    n,
                ];
                if shapes.der_output != expected {
                    return Err(Error::ShapeMismatch(format!(
                        "output gradient has extents {:?}, expected {expected:?}",
                        shapes.der_output
                    )));
                }
                Some(SpatialPlan {
                    geometry,
                    groups,
                    data_images: Partition::new(geometry.volume(), n),
                })
            }
            None => None,
        };

        if let Some(n) = shapes.num_der_biases {
            if n != num_filters {
                return Err(Error::ShapeMismatch(format!(
                    "{n} bias gradients for {num_filters} output channels"
                )));
            }
        }

        Ok(Self {
            batch,
            num_output_pixels,
            num_filters,
            der_output_images: Partition::new(num_output_pixels * num_filters, batch),
            spatial,
            der_data: shapes.der_data.is_some(),
            der_filters: shapes.der_filters.is_some(),
            der_biases: shapes.num_der_biases.is_some(),
            workspace_len: spatial.map_or(0, |s| s.groups.scratch_len()),
            ones_len: if shapes.num_der_biases.is_some() {
                num_output_pixels
            } else {
                0
            },
        })
    }

    pub fn spatial(&self) -> Result<&SpatialPlan, Error> {
        self.spatial.as_ref().ok_or_else(|| {
            Error::ShapeMismatch("no input or filter gradient was planned".into())
        })
    }
}
