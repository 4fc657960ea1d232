// SPDX-License-Identifier: GPL-3.0-only

//! Dense tensor helpers
//!
//! Frames are `N×C×H×W` arrays and sequences are `N×T×C×H×W` arrays, both
//! `f32`. The kernels in [`conv`] and [`resample`] operate on frames; the
//! helpers here move between the two layouts and assemble channel stacks.

pub mod conv;
pub mod resample;

use crate::errors::{DepthError, DepthResult};
use ndarray::{Array4, Array5, ArrayView4, Axis, s};

/// Batch of frames, `N×C×H×W`
pub type Tensor4 = Array4<f32>;
/// Batch of sequences, `N×T×C×H×W`
pub type Tensor5 = Array5<f32>;

pub use conv::{conv2d, leaky_relu, pixel_shuffle, relu, sigmoid};
pub use resample::{
    Padding, avg_pool2, flow_warp, resize_bicubic, resize_bilinear, upsample_nearest,
};

/// Concatenate frames along the channel axis
pub fn concat_channels(parts: &[ArrayView4<'_, f32>]) -> DepthResult<Tensor4> {
    if parts.is_empty() {
        return Err(DepthError::shape("concat_channels", "at least one part", &[]));
    }
    let (n, _, h, w) = parts[0].dim();
    for part in parts {
        let (pn, _, ph, pw) = part.dim();
        if (pn, ph, pw) != (n, h, w) {
            return Err(DepthError::shape(
                "concat_channels",
                format!("{}×C×{}×{}", n, h, w),
                part.shape(),
            ));
        }
    }
    Ok(ndarray::concatenate(Axis(1), parts)?)
}

/// Concatenate sequences along the channel axis
pub fn concat_sequence_channels(parts: &[ndarray::ArrayView5<'_, f32>]) -> DepthResult<Tensor5> {
    if parts.is_empty() {
        return Err(DepthError::shape("concat_sequence_channels", "at least one part", &[]));
    }
    let (n, t, _, h, w) = parts[0].dim();
    for part in parts {
        let (pn, pt, _, ph, pw) = part.dim();
        if (pn, pt, ph, pw) != (n, t, h, w) {
            return Err(DepthError::shape(
                "concat_sequence_channels",
                format!("{}×{}×C×{}×{}", n, t, h, w),
                part.shape(),
            ));
        }
    }
    Ok(ndarray::concatenate(Axis(2), parts)?)
}

/// Take channels `[start, start + len)` of a sequence
pub fn sequence_channels(seq: &Tensor5, start: usize, len: usize) -> DepthResult<Tensor5> {
    if start + len > seq.dim().2 {
        return Err(DepthError::shape(
            "sequence_channels",
            format!("at least {} channels", start + len),
            seq.shape(),
        ));
    }
    Ok(seq.slice(s![.., .., start..start + len, .., ..]).to_owned())
}

/// Take channels `[start, start + len)` of a frame
pub fn channel_slice(frame: &Tensor4, start: usize, len: usize) -> DepthResult<Tensor4> {
    if start + len > frame.dim().1 {
        return Err(DepthError::shape(
            "channel_slice",
            format!("at least {} channels", start + len),
            frame.shape(),
        ));
    }
    Ok(frame.slice(s![.., start..start + len, .., ..]).to_owned())
}

/// Split a frame into `parts` equal channel chunks
pub fn chunk_channels(frame: &Tensor4, parts: usize) -> DepthResult<Vec<Tensor4>> {
    let channels = frame.dim().1;
    if parts == 0 || channels % parts != 0 {
        return Err(DepthError::shape(
            "chunk_channels",
            format!("channel count divisible by {}", parts),
            frame.shape(),
        ));
    }
    let len = channels / parts;
    (0..parts)
        .map(|i| channel_slice(frame, i * len, len))
        .collect()
}

/// Frame `t` of a sequence
pub fn frame_at(seq: &Tensor5, t: usize) -> Tensor4 {
    seq.index_axis(Axis(1), t).to_owned()
}

/// Number of frames in a sequence
pub fn frame_count(seq: &Tensor5) -> usize {
    seq.dim().1
}

/// Stack per-frame tensors into a sequence
pub fn stack_frames(frames: &[Tensor4]) -> DepthResult<Tensor5> {
    if frames.is_empty() {
        return Err(DepthError::shape("stack_frames", "at least one frame", &[]));
    }
    let views: Vec<_> = frames.iter().map(|f| f.view()).collect();
    Ok(ndarray::stack(Axis(1), &views)?)
}

/// Merge the batch and time axes: `N×T×C×H×W` → `(N·T)×C×H×W`
pub fn fold_time(seq: &Tensor5) -> DepthResult<Tensor4> {
    let (n, t, c, h, w) = seq.dim();
    Ok(seq
        .as_standard_layout()
        .into_owned()
        .into_shape_with_order((n * t, c, h, w))?)
}

/// Split the merged batch axis again: `(N·T)×C×H×W` → `N×T×C×H×W`
pub fn unfold_time(frames: Tensor4, n: usize, t: usize) -> DepthResult<Tensor5> {
    let (nt, c, h, w) = frames.dim();
    if nt != n * t {
        return Err(DepthError::shape(
            "unfold_time",
            format!("{}·{} frames", n, t),
            frames.shape(),
        ));
    }
    Ok(frames
        .as_standard_layout()
        .into_owned()
        .into_shape_with_order((n, t, c, h, w))?)
}

/// Check the `N×C×H×W` dimensions of a frame, `None` entries are not checked
pub fn expect_dims(
    context: &'static str,
    frame: &Tensor4,
    expected: [Option<usize>; 4],
) -> DepthResult<()> {
    let actual = frame.shape();
    let matches = expected
        .iter()
        .zip(actual)
        .all(|(e, a)| e.is_none_or(|e| e == *a));
    if matches {
        Ok(())
    } else {
        let described: Vec<String> = expected
            .iter()
            .map(|e| e.map_or_else(|| "*".to_string(), |v| v.to_string()))
            .collect();
        Err(DepthError::shape(context, described.join("×"), actual))
    }
}
