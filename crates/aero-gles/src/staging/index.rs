//! Index conversions for topologies and index widths the backend cannot consume directly.
//!
//! All helpers work on absolute vertex indices (`u32`) and honour the fixed primitive-restart
//! index: a restart value terminates the current fan/loop without bridging into the next one.

use crate::backend::BackendCaps;
use crate::descriptor::IndexFormat;
use crate::gl::{IndexType, PrimitiveMode};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConversionMode {
    None,
    /// `u8` indices promoted to `u16`.
    WidenIndices,
    TriangleFan,
    LineLoop,
    StrideRepack,
}

/// How the indices of a draw must be converted, if at all.
pub fn index_conversion(
    mode: PrimitiveMode,
    index_type: Option<IndexType>,
    caps: &BackendCaps,
) -> ConversionMode {
    match mode {
        PrimitiveMode::TriangleFan if !caps.supports_triangle_fan => ConversionMode::TriangleFan,
        PrimitiveMode::LineLoop if !caps.supports_line_loop => ConversionMode::LineLoop,
        _ if index_type == Some(IndexType::U8) && !caps.supports_u8_indices => {
            ConversionMode::WidenIndices
        }
        _ => ConversionMode::None,
    }
}

/// Decodes little-endian indices of type `ty`.
pub fn read_indices(bytes: &[u8], ty: IndexType) -> Vec<u32> {
    match ty {
        IndexType::U8 => bytes.iter().map(|&b| u32::from(b)).collect(),
        IndexType::U16 => bytes
            .chunks_exact(2)
            .map(|c| u32::from(u16::from_le_bytes([c[0], c[1]])))
            .collect(),
        IndexType::U32 => bytes
            .chunks_exact(4)
            .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect(),
    }
}

/// Splits `indices` into primitives separated by `restart`.
fn primitives(indices: &[u32], restart: Option<u32>) -> impl Iterator<Item = &[u32]> {
    indices
        .split(move |&i| Some(i) == restart)
        .filter(|run| !run.is_empty())
}

/// Triangle fan to triangle list: triangle `i` of each fan is `(v0, v[i], v[i+1])`.
pub fn expand_triangle_fan(indices: &[u32], restart: Option<u32>) -> Vec<u32> {
    let mut out = Vec::with_capacity(indices.len().saturating_sub(2) * 3);
    for fan in primitives(indices, restart) {
        if fan.len() < 3 {
            continue;
        }
        for i in 1..fan.len() - 1 {
            out.extend_from_slice(&[fan[0], fan[i], fan[i + 1]]);
        }
    }
    out
}

/// Line loop to line list: `N` vertices become `N` segments, the last one closing the loop.
pub fn expand_line_loop(indices: &[u32], restart: Option<u32>) -> Vec<u32> {
    let mut out = Vec::with_capacity(indices.len() * 2);
    for run in primitives(indices, restart) {
        if run.len() < 2 {
            continue;
        }
        for pair in run.windows(2) {
            out.extend_from_slice(&[pair[0], pair[1]]);
        }
        out.extend_from_slice(&[run[run.len() - 1], run[0]]);
    }
    out
}

/// `u8` to `u16` promotion. With restart enabled `0xFF` must become `0xFFFF` to stay a restart.
pub fn widen_u8_indices(bytes: &[u8], restart: bool) -> Vec<u16> {
    bytes
        .iter()
        .map(|&b| {
            if restart && b == 0xFF {
                0xFFFF
            } else {
                u16::from(b)
            }
        })
        .collect()
}

/// Smallest and largest vertex referenced, ignoring restart indices.
pub fn index_bounds(indices: &[u32], restart: Option<u32>) -> Option<(u32, u32)> {
    indices
        .iter()
        .copied()
        .filter(|&i| Some(i) != restart)
        .fold(None, |acc, i| match acc {
            None => Some((i, i)),
            Some((lo, hi)) => Some((lo.min(i), hi.max(i))),
        })
}

/// Encodes restart-free list indices in the narrowest native width, padded to four bytes.
pub fn pack_indices(indices: &[u32]) -> (IndexFormat, Vec<u8>) {
    // 0xFFFF stays reserved so strip restart never triggers on converted data.
    let narrow = indices.iter().all(|&i| i < 0xFFFF);
    let mut bytes = if narrow {
        let narrow: Vec<u16> = indices.iter().map(|&i| i as u16).collect();
        bytemuck::cast_slice::<u16, u8>(&narrow).to_vec()
    } else {
        bytemuck::cast_slice::<u32, u8>(indices).to_vec()
    };
    bytes.resize(bytes.len().next_multiple_of(4), 0);
    let format = if narrow { IndexFormat::U16 } else { IndexFormat::U32 };
    (format, bytes)
}
