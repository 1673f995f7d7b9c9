//! CPU repacking of vertex streams the backend cannot read in place.

use half::f16;

use crate::error::StagingError;
use crate::gl::AttribType;
use crate::vertex_layout::{SourceFormat, StreamPlan, VertexFormat};

/// Repacks `count` output elements of `stream` from `data` into the stream's packed layout.
///
/// Output element `k` reads source element `first + k / repeat`. `repeat` is 1 except when an
/// instance divisor the backend cannot express is unrolled into per-instance data.
pub fn repack_stream(
    data: &[u8],
    stream: &StreamPlan,
    first: u64,
    count: u64,
    repeat: u32,
) -> Result<Vec<u8>, StagingError> {
    let stride = u64::from(stream.layout.array_stride);
    let source_stride = u64::from(stream.source_stride);
    let repeat = u64::from(repeat.max(1));
    let mut out = vec![0u8; (stride * count) as usize];

    let targets: Vec<(usize, usize, VertexFormat)> = stream
        .sources
        .iter()
        .filter_map(|source| {
            stream
                .layout
                .attributes
                .iter()
                .find(|a| a.location == source.location)
                .map(|a| (source.offset as usize, a.offset as usize, a.format))
        })
        .collect();

    if count > 0 {
        let last = first + (count - 1) / repeat;
        let end = stream.base_offset + last * source_stride + u64::from(stream.element_span());
        if end > data.len() as u64 {
            return Err(StagingError::VertexRangeOutOfBounds {
                offset: stream.base_offset + first * source_stride,
                len: end - (stream.base_offset + first * source_stride),
                buffer_len: data.len() as u64,
            });
        }
    }

    for k in 0..count {
        let element = first + k / repeat;
        let src_base = (stream.base_offset + element * source_stride) as usize;
        let dst_base = (k * stride) as usize;
        for (source, &(src_offset, dst_offset, target)) in stream.sources.iter().zip(&targets) {
            let size = source.format.size() as usize;
            let src = &data[src_base + src_offset..src_base + src_offset + size];
            let dst = &mut out[dst_base + dst_offset..dst_base + dst_offset + target.size() as usize];
            convert_element(src, &source.format, target, dst);
        }
    }
    Ok(out)
}

/// Writes one attribute element in `target` format.
fn convert_element(src: &[u8], format: &SourceFormat, target: VertexFormat, dst: &mut [u8]) {
    if !format.native().1 {
        dst[..src.len()].copy_from_slice(src);
        return;
    }

    if format.integer {
        let components = usize::from(format.components);
        for i in 0..components {
            let value = read_integer(src, format.component_type, i);
            dst[i * 4..i * 4 + 4].copy_from_slice(&(value as i32).to_le_bytes());
        }
        return;
    }

    let values = read_floats(src, format);
    for (i, value) in values.iter().enumerate() {
        dst[i * 4..i * 4 + 4].copy_from_slice(&value.to_le_bytes());
    }
}

fn read_integer(src: &[u8], ty: AttribType, index: usize) -> i64 {
    let size = ty.component_size() as usize;
    let b = &src[index * size..index * size + size];
    match ty {
        AttribType::Byte => i64::from(b[0] as i8),
        AttribType::UnsignedByte => i64::from(b[0]),
        AttribType::Short => i64::from(i16::from_le_bytes([b[0], b[1]])),
        AttribType::UnsignedShort => i64::from(u16::from_le_bytes([b[0], b[1]])),
        AttribType::Int | AttribType::Fixed => {
            i64::from(i32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        }
        _ => i64::from(u32::from_le_bytes([b[0], b[1], b[2], b[3]])),
    }
}

fn read_floats(src: &[u8], format: &SourceFormat) -> Vec<f32> {
    let ty = format.component_type;
    if ty.is_packed() {
        return unpack_2_10_10_10(
            u32::from_le_bytes([src[0], src[1], src[2], src[3]]),
            ty == AttribType::Int2101010Rev,
            format.normalized,
        )
        .to_vec();
    }

    (0..usize::from(format.components))
        .map(|i| match ty {
            AttribType::Float => {
                let b = &src[i * 4..i * 4 + 4];
                f32::from_le_bytes([b[0], b[1], b[2], b[3]])
            }
            AttribType::HalfFloat => {
                f16::from_bits(u16::from_le_bytes([src[i * 2], src[i * 2 + 1]])).to_f32()
            }
            AttribType::Fixed => read_integer(src, ty, i) as f32 / 65536.0,
            _ => {
                let value = read_integer(src, ty, i);
                if format.normalized {
                    normalize(value, ty.component_size() * 8, ty.is_signed())
                } else {
                    value as f32
                }
            }
        })
        .collect()
}

/// GLES 3.0 normalization: signed values map `[-2^(b-1)+1, 2^(b-1)-1]` onto `[-1, 1]`.
fn normalize(value: i64, bits: u32, signed: bool) -> f32 {
    if signed {
        let max = ((1i64 << (bits - 1)) - 1) as f32;
        (value as f32 / max).max(-1.0)
    } else {
        let max = ((1i64 << bits) - 1) as f32;
        value as f32 / max
    }
}

fn unpack_2_10_10_10(packed: u32, signed: bool, normalized: bool) -> [f32; 4] {
    let field = |shift: u32, bits: u32| -> i64 {
        let raw = (packed >> shift) & ((1 << bits) - 1);
        if signed {
            // Sign-extend from `bits`.
            let shift = 32 - bits;
            i64::from(((raw << shift) as i32) >> shift)
        } else {
            i64::from(raw)
        }
    };
    let component = |value: i64, bits: u32| {
        if normalized {
            normalize(value, bits, signed)
        } else {
            value as f32
        }
    };
    [
        component(field(0, 10), 10),
        component(field(10, 10), 10),
        component(field(20, 10), 10),
        component(field(30, 2), 2),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::BackendCaps;
    use crate::gl;
    use crate::shader::testing::DeclCompiler;
    use crate::shader::ProgramReflection;
    use crate::share_group::ShareGroup;
    use crate::state::{AttributeSlot, MAX_VERTEX_ATTRIBS};
    use crate::vertex_layout::plan_vertex_streams;

    fn plan_for(slots: Vec<(usize, AttributeSlot)>) -> (StreamPlan, std::sync::Arc<ShareGroup>) {
        let group = ShareGroup::new(Box::new(DeclCompiler));
        let name = group.gen_buffer();
        group.buffer_data(name, &[0; 4], gl::STATIC_DRAW).unwrap();
        let buffer = group.acquire(name).unwrap();

        let mut attributes: Vec<AttributeSlot> =
            (0..MAX_VERTEX_ATTRIBS).map(|_| AttributeSlot::default()).collect();
        let mut mask = 0;
        for (i, mut slot) in slots {
            slot.enabled = true;
            slot.buffer = Some(buffer.clone());
            attributes[i] = slot;
            mask |= 1 << i;
        }
        let reflection = ProgramReflection {
            attribute_mask: mask,
            ..ProgramReflection::default()
        };
        let mut plan = plan_vertex_streams(&attributes, &reflection, &BackendCaps::default())
            .unwrap();
        (plan.streams.remove(0), group)
    }

    fn floats(bytes: &[u8]) -> Vec<f32> {
        bytes
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect()
    }

    #[test]
    fn unaligned_stride_is_compacted() {
        let (stream, _group) = plan_for(vec![(
            0,
            AttributeSlot {
                components: 2,
                component_type: AttribType::Float,
                stride: 10,
                ..AttributeSlot::default()
            },
        )]);
        assert!(stream.repack);

        let mut data = Vec::new();
        for v in 0..3u8 {
            data.extend_from_slice(&f32::from(v).to_le_bytes());
            data.extend_from_slice(&(f32::from(v) + 0.5).to_le_bytes());
            data.extend_from_slice(&[0xAA, 0xBB]);
        }

        let out = repack_stream(&data, &stream, 1, 2, 1).unwrap();
        assert_eq!(floats(&out), vec![1.0, 1.5, 2.0, 2.5]);
    }

    #[test]
    fn scaled_bytes_become_floats() {
        let (stream, _group) = plan_for(vec![(
            0,
            AttributeSlot {
                components: 3,
                component_type: AttribType::Byte,
                normalized: true,
                stride: 4,
                ..AttributeSlot::default()
            },
        )]);

        let data = [127u8, 0x81, 0x80, 0];
        let out = repack_stream(&data, &stream, 0, 1, 1).unwrap();
        assert_eq!(floats(&out), vec![1.0, -1.0, -1.0]);
    }

    #[test]
    fn half_and_fixed_inputs_convert() {
        let half = SourceFormat {
            component_type: AttribType::HalfFloat,
            components: 3,
            normalized: false,
            integer: false,
        };
        let mut src = Vec::new();
        for v in [1.0f32, -2.0, 0.25] {
            src.extend_from_slice(&f16::from_f32(v).to_bits().to_le_bytes());
        }
        assert_eq!(read_floats(&src, &half), vec![1.0, -2.0, 0.25]);

        let fixed = SourceFormat {
            component_type: AttribType::Fixed,
            components: 1,
            ..half
        };
        assert_eq!(read_floats(&0x0001_8000i32.to_le_bytes(), &fixed), vec![1.5]);
    }

    #[test]
    fn packed_signed_normalized_unpacks() {
        // x = 511, y = -511, z = 0, w = -1
        let packed: u32 = 511 | ((-511i32 as u32 & 0x3FF) << 10) | (0b11 << 30);
        assert_eq!(
            unpack_2_10_10_10(packed, true, true),
            [1.0, -1.0, 0.0, -1.0]
        );
        assert_eq!(unpack_2_10_10_10(packed, true, false)[1], -511.0);
    }

    #[test]
    fn divisor_unrolling_repeats_elements() {
        let (stream, _group) = plan_for(vec![(
            0,
            AttributeSlot {
                components: 1,
                component_type: AttribType::Float,
                divisor: 2,
                ..AttributeSlot::default()
            },
        )]);
        assert!(stream.repack);

        let data: Vec<u8> = [10.0f32, 20.0]
            .iter()
            .flat_map(|v| v.to_le_bytes())
            .collect();
        let out = repack_stream(&data, &stream, 0, 4, 2).unwrap();
        assert_eq!(floats(&out), vec![10.0, 10.0, 20.0, 20.0]);
    }

    #[test]
    fn reads_past_the_buffer_are_rejected() {
        let (stream, _group) = plan_for(vec![(
            0,
            AttributeSlot {
                components: 3,
                component_type: AttribType::Float,
                stride: 14,
                ..AttributeSlot::default()
            },
        )]);
        let err = repack_stream(&[0; 20], &stream, 0, 2, 1).unwrap_err();
        assert!(matches!(err, StagingError::VertexRangeOutOfBounds { .. }));
    }
}
