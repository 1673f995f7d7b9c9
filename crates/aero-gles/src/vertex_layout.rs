//! Mapping of GL attribute pointers onto native vertex-buffer slots.
//!
//! Enabled attributes that share a source buffer, stride and divisor and fit inside one stride
//! window are interleaved into one native slot. A slot is repacked into staging memory when any
//! of its attributes has no native format or its stride/offsets break the backend's alignment.

use tracing::warn;

use crate::backend::BackendCaps;
use crate::error::DrawError;
use crate::gl::AttribType;
use crate::shader::ProgramReflection;
use crate::share_group::BufferKey;
use crate::state::AttributeSlot;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VertexFormat {
    Uint8x2,
    Uint8x4,
    Sint8x2,
    Sint8x4,
    Unorm8x2,
    Unorm8x4,
    Snorm8x2,
    Snorm8x4,
    Uint16x2,
    Uint16x4,
    Sint16x2,
    Sint16x4,
    Unorm16x2,
    Unorm16x4,
    Snorm16x2,
    Snorm16x4,
    Float16x2,
    Float16x4,
    Float32,
    Float32x2,
    Float32x3,
    Float32x4,
    Uint32,
    Uint32x2,
    Uint32x3,
    Uint32x4,
    Sint32,
    Sint32x2,
    Sint32x3,
    Sint32x4,
    Unorm10_10_10_2,
}

impl VertexFormat {
    pub const fn size(self) -> u32 {
        use VertexFormat::*;
        match self {
            Uint8x2 | Sint8x2 | Unorm8x2 | Snorm8x2 => 2,
            Uint8x4 | Sint8x4 | Unorm8x4 | Snorm8x4 => 4,
            Uint16x2 | Sint16x2 | Unorm16x2 | Snorm16x2 | Float16x2 => 4,
            Uint16x4 | Sint16x4 | Unorm16x4 | Snorm16x4 | Float16x4 => 8,
            Float32 | Uint32 | Sint32 | Unorm10_10_10_2 => 4,
            Float32x2 | Uint32x2 | Sint32x2 => 8,
            Float32x3 | Uint32x3 | Sint32x3 => 12,
            Float32x4 | Uint32x4 | Sint32x4 => 16,
        }
    }

    fn float32(components: u8) -> Self {
        match components {
            1 => Self::Float32,
            2 => Self::Float32x2,
            3 => Self::Float32x3,
            _ => Self::Float32x4,
        }
    }

    fn uint32(components: u8) -> Self {
        match components {
            1 => Self::Uint32,
            2 => Self::Uint32x2,
            3 => Self::Uint32x3,
            _ => Self::Uint32x4,
        }
    }

    fn sint32(components: u8) -> Self {
        match components {
            1 => Self::Sint32,
            2 => Self::Sint32x2,
            3 => Self::Sint32x3,
            _ => Self::Sint32x4,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VertexStepMode {
    Vertex,
    Instance,
}

/// Source-side description of one attribute element.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SourceFormat {
    pub component_type: AttribType,
    pub components: u8,
    pub normalized: bool,
    pub integer: bool,
}

impl SourceFormat {
    pub fn of(slot: &AttributeSlot) -> Self {
        Self {
            component_type: slot.component_type,
            components: slot.components,
            normalized: slot.normalized,
            integer: slot.integer,
        }
    }

    pub fn size(&self) -> u32 {
        if self.component_type.is_packed() {
            4
        } else {
            u32::from(self.components) * self.component_type.component_size()
        }
    }

    /// Native format the attribute is fed as, and whether the data must be converted to it.
    pub fn native(&self) -> (VertexFormat, bool) {
        use VertexFormat::*;

        let n = self.components;
        let pair_or_quad = n == 2 || n == 4;
        let pick = |two: VertexFormat, four: VertexFormat| if n == 2 { two } else { four };

        match self.component_type {
            AttribType::Float => (VertexFormat::float32(n), false),
            AttribType::HalfFloat if pair_or_quad => (pick(Float16x2, Float16x4), false),
            AttribType::HalfFloat | AttribType::Fixed => (VertexFormat::float32(n), true),
            AttribType::UnsignedInt2101010Rev if self.normalized => (Unorm10_10_10_2, false),
            AttribType::Int2101010Rev | AttribType::UnsignedInt2101010Rev => (Float32x4, true),
            AttribType::Int if self.integer => (VertexFormat::sint32(n), false),
            AttribType::UnsignedInt if self.integer => (VertexFormat::uint32(n), false),
            ty if self.integer => {
                let native = match ty {
                    AttribType::Byte if pair_or_quad => Some(pick(Sint8x2, Sint8x4)),
                    AttribType::UnsignedByte if pair_or_quad => Some(pick(Uint8x2, Uint8x4)),
                    AttribType::Short if pair_or_quad => Some(pick(Sint16x2, Sint16x4)),
                    AttribType::UnsignedShort if pair_or_quad => Some(pick(Uint16x2, Uint16x4)),
                    _ => None,
                };
                match native {
                    Some(format) => (format, false),
                    None if ty.is_signed() => (VertexFormat::sint32(n), true),
                    None => (VertexFormat::uint32(n), true),
                }
            }
            ty if self.normalized => {
                let native = match ty {
                    AttribType::Byte if pair_or_quad => Some(pick(Snorm8x2, Snorm8x4)),
                    AttribType::UnsignedByte if pair_or_quad => Some(pick(Unorm8x2, Unorm8x4)),
                    AttribType::Short if pair_or_quad => Some(pick(Snorm16x2, Snorm16x4)),
                    AttribType::UnsignedShort if pair_or_quad => {
                        Some(pick(Unorm16x2, Unorm16x4))
                    }
                    _ => None,
                };
                match native {
                    Some(format) => (format, false),
                    None => (VertexFormat::float32(n), true),
                }
            }
            // Integer data read as unnormalized floats has no native format.
            _ => (VertexFormat::float32(n), true),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct VertexAttributeLayout {
    pub location: u32,
    pub format: VertexFormat,
    pub offset: u32,
}

/// Native layout of one vertex-buffer slot.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct VertexBufferLayout {
    pub array_stride: u32,
    pub step_mode: VertexStepMode,
    pub attributes: Vec<VertexAttributeLayout>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StreamSource {
    pub location: u32,
    /// Byte offset relative to the stream's base offset.
    pub offset: u32,
    pub format: SourceFormat,
}

/// How one native vertex-buffer slot is fed from a GL buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamPlan {
    pub buffer: BufferKey,
    /// Source offset of element 0.
    pub base_offset: u64,
    pub source_stride: u32,
    pub divisor: u32,
    pub sources: Vec<StreamSource>,
    pub repack: bool,
    pub layout: VertexBufferLayout,
}

impl StreamPlan {
    /// Source bytes one element spans, from the base offset.
    pub fn element_span(&self) -> u32 {
        self.sources
            .iter()
            .map(|s| s.offset + s.format.size())
            .max()
            .unwrap_or(0)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VertexStreamPlan {
    pub streams: Vec<StreamPlan>,
}

impl VertexStreamPlan {
    pub fn layouts(&self) -> Vec<VertexBufferLayout> {
        self.streams.iter().map(|s| s.layout.clone()).collect()
    }
}

struct Member {
    location: u32,
    offset: u64,
    format: SourceFormat,
}

pub fn plan_vertex_streams(
    attributes: &[AttributeSlot],
    reflection: &ProgramReflection,
    caps: &BackendCaps,
) -> Result<VertexStreamPlan, DrawError> {
    // (buffer, stride, divisor) -> members, in first-seen attribute order.
    let mut groups: Vec<((BufferKey, u32, u32), Vec<Member>)> = Vec::new();
    for (location, slot) in attributes.iter().enumerate() {
        if !slot.enabled || !reflection.consumes_attribute(location) {
            continue;
        }
        let Some(buffer) = slot.buffer_key() else {
            return Err(DrawError::InvalidOperation(
                "enabled vertex attribute has no buffer bound",
            ));
        };
        let key = (buffer, slot.effective_stride(), slot.divisor);
        let member = Member {
            location: location as u32,
            offset: slot.offset,
            format: SourceFormat::of(slot),
        };
        match groups.iter_mut().find(|(k, _)| *k == key) {
            Some((_, members)) => members.push(member),
            None => groups.push((key, vec![member])),
        }
    }

    let align = u64::from(caps.vertex_buffer_alignment.max(1));
    let mut streams = Vec::new();
    for ((buffer, stride, divisor), mut members) in groups {
        members.sort_by_key(|m| (m.offset, m.location));

        let mut windows: Vec<Vec<Member>> = Vec::new();
        for member in members {
            let fits = windows.last().is_some_and(|window| {
                let base = window[0].offset;
                member.offset - base + u64::from(member.format.size()) <= u64::from(stride)
            });
            match windows.last_mut() {
                Some(window) if fits => window.push(member),
                _ => windows.push(vec![member]),
            }
        }

        for window in windows {
            let base_offset = window[0].offset;
            let sources: Vec<StreamSource> = window
                .iter()
                .map(|m| StreamSource {
                    location: m.location,
                    offset: (m.offset - base_offset) as u32,
                    format: m.format,
                })
                .collect();

            let needs_conversion = sources.iter().any(|s| s.format.native().1);
            let misaligned = u64::from(stride) % align != 0
                || base_offset % align != 0
                || sources.iter().any(|s| u64::from(s.offset) % align != 0);
            let repack = needs_conversion
                || misaligned
                || stride > caps.max_vertex_stride
                || (divisor > 1 && !caps.supports_instance_divisor);

            let step_mode = if divisor == 0 {
                VertexStepMode::Vertex
            } else {
                VertexStepMode::Instance
            };

            let layout = if repack {
                packed_layout(&sources, step_mode, align as u32)
            } else {
                let mut attributes: Vec<_> = sources
                    .iter()
                    .map(|s| VertexAttributeLayout {
                        location: s.location,
                        format: s.format.native().0,
                        offset: s.offset,
                    })
                    .collect();
                attributes.sort_by_key(|a| a.location);
                VertexBufferLayout {
                    array_stride: stride,
                    step_mode,
                    attributes,
                }
            };

            streams.push(StreamPlan {
                buffer,
                base_offset,
                source_stride: stride,
                divisor,
                sources,
                repack,
                layout,
            });
        }
    }

    if streams.len() > caps.max_vertex_buffers as usize {
        warn!(
            streams = streams.len(),
            max = caps.max_vertex_buffers,
            "draw needs more vertex buffers than the backend exposes"
        );
        return Err(DrawError::InvalidOperation("too many vertex buffer streams"));
    }
    Ok(VertexStreamPlan { streams })
}

/// Tightly packed (alignment-padded) layout used for repacked streams.
fn packed_layout(sources: &[StreamSource], step_mode: VertexStepMode, align: u32) -> VertexBufferLayout {
    let mut offset = 0u32;
    let mut attributes = Vec::with_capacity(sources.len());
    for source in sources {
        let format = source.format.native().0;
        attributes.push(VertexAttributeLayout {
            location: source.location,
            format,
            offset,
        });
        offset = align_up(offset + format.size(), align);
    }
    attributes.sort_by_key(|a| a.location);
    VertexBufferLayout {
        array_stride: offset.max(align),
        step_mode,
        attributes,
    }
}

pub(crate) fn align_up(value: u32, align: u32) -> u32 {
    value.div_ceil(align) * align
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gl;
    use crate::share_group::{BufferRef, ShareGroup};
    use crate::shader::testing::DeclCompiler;
    use crate::state::MAX_VERTEX_ATTRIBS;
    use std::sync::Arc;

    fn reflection(mask: u32) -> ProgramReflection {
        ProgramReflection {
            attribute_mask: mask,
            ..ProgramReflection::default()
        }
    }

    fn slot(buffer: &BufferRef, ty: AttribType, components: u8, stride: u32, offset: u64) -> AttributeSlot {
        AttributeSlot {
            enabled: true,
            components,
            component_type: ty,
            stride,
            offset,
            buffer: Some(buffer.clone()),
            ..AttributeSlot::default()
        }
    }

    fn buffer(group: &Arc<ShareGroup>) -> BufferRef {
        let name = group.gen_buffer();
        group.buffer_data(name, &[0; 256], gl::STATIC_DRAW).unwrap();
        group.acquire(name).unwrap()
    }

    fn attrs(slots: Vec<(usize, AttributeSlot)>) -> Vec<AttributeSlot> {
        let mut out: Vec<AttributeSlot> =
            (0..MAX_VERTEX_ATTRIBS).map(|_| AttributeSlot::default()).collect();
        for (i, s) in slots {
            out[i] = s;
        }
        out
    }

    #[test]
    fn interleaved_attributes_share_one_slot() {
        let group = ShareGroup::new(Box::new(DeclCompiler));
        let buf = buffer(&group);
        let attributes = attrs(vec![
            (0, slot(&buf, AttribType::Float, 3, 24, 0)),
            (1, slot(&buf, AttribType::Float, 3, 24, 12)),
        ]);

        let plan = plan_vertex_streams(&attributes, &reflection(0b11), &BackendCaps::default())
            .unwrap();
        assert_eq!(plan.streams.len(), 1);
        let stream = &plan.streams[0];
        assert!(!stream.repack);
        assert_eq!(stream.layout.array_stride, 24);
        assert_eq!(
            stream.layout.attributes,
            vec![
                VertexAttributeLayout {
                    location: 0,
                    format: VertexFormat::Float32x3,
                    offset: 0
                },
                VertexAttributeLayout {
                    location: 1,
                    format: VertexFormat::Float32x3,
                    offset: 12
                },
            ]
        );
    }

    #[test]
    fn unaligned_stride_and_missing_formats_force_repack() {
        let group = ShareGroup::new(Box::new(DeclCompiler));
        let buf = buffer(&group);

        let attributes = attrs(vec![(0, slot(&buf, AttribType::Float, 3, 14, 0))]);
        let plan = plan_vertex_streams(&attributes, &reflection(1), &BackendCaps::default())
            .unwrap();
        assert!(plan.streams[0].repack);
        assert_eq!(plan.streams[0].layout.array_stride, 12);

        let attributes = attrs(vec![(0, slot(&buf, AttribType::UnsignedByte, 3, 4, 0))]);
        let plan = plan_vertex_streams(&attributes, &reflection(1), &BackendCaps::default())
            .unwrap();
        assert!(plan.streams[0].repack);
        assert_eq!(
            plan.streams[0].layout.attributes[0].format,
            VertexFormat::Float32x3
        );
    }

    #[test]
    fn attributes_the_program_ignores_are_skipped() {
        let group = ShareGroup::new(Box::new(DeclCompiler));
        let buf = buffer(&group);
        let mut unbound = AttributeSlot::default();
        unbound.enabled = true;
        let attributes = attrs(vec![
            (0, slot(&buf, AttribType::Float, 4, 0, 0)),
            (5, unbound),
        ]);

        let plan = plan_vertex_streams(&attributes, &reflection(1), &BackendCaps::default())
            .unwrap();
        assert_eq!(plan.streams.len(), 1);

        let err = plan_vertex_streams(&attributes, &reflection(0b100001), &BackendCaps::default())
            .unwrap_err();
        assert!(matches!(err, DrawError::InvalidOperation(_)));
    }

    #[test]
    fn normalized_bytes_map_to_native_formats() {
        let format = SourceFormat {
            component_type: AttribType::UnsignedByte,
            components: 4,
            normalized: true,
            integer: false,
        };
        assert_eq!(format.native(), (VertexFormat::Unorm8x4, false));

        let ints = SourceFormat {
            normalized: false,
            integer: true,
            ..format
        };
        assert_eq!(ints.native(), (VertexFormat::Uint8x4, false));

        let scaled = SourceFormat {
            normalized: false,
            ..format
        };
        assert_eq!(scaled.native(), (VertexFormat::Float32x4, true));
    }
}
