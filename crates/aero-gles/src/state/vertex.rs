use crate::gl::AttribType;
use crate::share_group::{BufferKey, BufferRef};

pub const MAX_VERTEX_ATTRIBS: usize = 16;

/// One generic vertex attribute as set by `glVertexAttrib{I}Pointer` and friends.
#[derive(Debug, PartialEq)]
pub struct AttributeSlot {
    pub enabled: bool,
    pub components: u8,
    pub component_type: AttribType,
    pub normalized: bool,
    /// Set by `glVertexAttribIPointer`; the shader reads integers.
    pub integer: bool,
    /// Stride as specified by the application; zero means tightly packed.
    pub stride: u32,
    pub offset: u64,
    pub buffer: Option<BufferRef>,
    pub divisor: u32,
}

impl Default for AttributeSlot {
    fn default() -> Self {
        Self {
            enabled: false,
            components: 4,
            component_type: AttribType::Float,
            normalized: false,
            integer: false,
            stride: 0,
            offset: 0,
            buffer: None,
            divisor: 0,
        }
    }
}

impl AttributeSlot {
    pub fn element_size(&self) -> u32 {
        if self.component_type.is_packed() {
            4
        } else {
            u32::from(self.components) * self.component_type.component_size()
        }
    }

    pub fn effective_stride(&self) -> u32 {
        if self.stride == 0 {
            self.element_size()
        } else {
            self.stride
        }
    }

    pub fn buffer_key(&self) -> Option<BufferKey> {
        self.buffer.as_ref().map(BufferRef::key)
    }

    /// Everything but the buffer reference, for change detection.
    pub(crate) fn format_eq(&self, other: &AttributeSlot) -> bool {
        self.components == other.components
            && self.component_type == other.component_type
            && self.normalized == other.normalized
            && self.integer == other.integer
            && self.stride == other.stride
            && self.offset == other.offset
    }
}

/// Attribute state container: either a named vertex-array object or the context's default set.
#[derive(Debug)]
pub struct VertexArrayObject {
    attributes: Vec<AttributeSlot>,
    element_buffer: Option<BufferRef>,
}

impl VertexArrayObject {
    pub fn new(attribute_count: usize) -> Self {
        Self {
            attributes: (0..attribute_count).map(|_| AttributeSlot::default()).collect(),
            element_buffer: None,
        }
    }

    pub fn attributes(&self) -> &[AttributeSlot] {
        &self.attributes
    }

    pub fn attribute(&self, index: usize) -> Option<&AttributeSlot> {
        self.attributes.get(index)
    }

    pub(crate) fn attribute_mut(&mut self, index: usize) -> Option<&mut AttributeSlot> {
        self.attributes.get_mut(index)
    }

    pub fn element_buffer(&self) -> Option<&BufferRef> {
        self.element_buffer.as_ref()
    }

    /// Returns `true` if the binding changed.
    pub(crate) fn set_element_buffer(&mut self, buffer: Option<BufferRef>) -> bool {
        if self.element_buffer == buffer {
            return false;
        }
        self.element_buffer = buffer;
        true
    }

    /// Detaches every reference to the buffer `key` (GL unbinds a deleted buffer from the
    /// current vertex array). Reports whether attribute and element bindings changed.
    pub(crate) fn detach_buffer(&mut self, key: BufferKey) -> (bool, bool) {
        let mut attribs = false;
        for slot in &mut self.attributes {
            if slot.buffer_key() == Some(key) {
                slot.buffer = None;
                attribs = true;
            }
        }
        let mut element = false;
        if self.element_buffer.as_ref().map(BufferRef::key) == Some(key) {
            self.element_buffer = None;
            element = true;
        }
        (attribs, element)
    }
}
