//! Objects shared between the contexts of a share group.
//!
//! Buffers, programs and textures live in generational arenas behind a single lock. Every
//! binding point holds an [`ObjectRef`], a counted handle; GL names hold one more reference.
//! An object is destroyed exactly once, when its last reference goes away, and the destruction
//! is appended to a log that every context of the group drains before its next draw.

use std::fmt;
use std::hash::{Hash, Hasher};
use std::marker::PhantomData;
use std::ops::Range;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use hashbrown::HashMap;
use tracing::debug;

use crate::error::{GlError, ProgramError};
use crate::gl::{BufferUsage, TextureTarget};
use crate::shader::{LinkedProgram, ShaderCompiler};

/// GL object name (`GLuint`). Zero is never a valid object.
pub type ObjectId = u32;

/// Stable arena address of a shared object. A key outlives its object only as a stale value:
/// the slot generation advances on destruction, so stale keys never resolve again.
pub struct ObjectKey<T> {
    index: u32,
    generation: u32,
    _marker: PhantomData<fn() -> T>,
}

impl<T> ObjectKey<T> {
    fn new(index: u32, generation: u32) -> Self {
        Self {
            index,
            generation,
            _marker: PhantomData,
        }
    }

    pub fn index(self) -> u32 {
        self.index
    }

    pub fn generation(self) -> u32 {
        self.generation
    }
}

impl<T> Clone for ObjectKey<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for ObjectKey<T> {}

impl<T> PartialEq for ObjectKey<T> {
    fn eq(&self, other: &Self) -> bool {
        self.index == other.index && self.generation == other.generation
    }
}

impl<T> Eq for ObjectKey<T> {}

impl<T> Hash for ObjectKey<T> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.index.hash(state);
        self.generation.hash(state);
    }
}

impl<T> fmt::Debug for ObjectKey<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ObjectKey({}v{})", self.index, self.generation)
    }
}

pub type BufferKey = ObjectKey<BufferObject>;
pub type ProgramKey = ObjectKey<ProgramObject>;
pub type TextureKey = ObjectKey<TextureObject>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BufferObject {
    data: Vec<u8>,
    usage: BufferUsage,
    version: u64,
    last_update: Option<Range<u64>>,
}

impl Default for BufferObject {
    fn default() -> Self {
        Self {
            data: Vec::new(),
            usage: BufferUsage::StaticDraw,
            version: 0,
            last_update: None,
        }
    }
}

impl BufferObject {
    /// CPU shadow of the buffer contents.
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn len(&self) -> u64 {
        self.data.len() as u64
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn usage(&self) -> BufferUsage {
        self.usage
    }

    /// Advances on every data update.
    pub fn version(&self) -> u64 {
        self.version
    }

    /// Byte range touched by the update that produced the current version, or `None` if the
    /// whole store was respecified.
    pub fn last_update(&self) -> Option<Range<u64>> {
        self.last_update.clone()
    }
}

#[derive(Debug)]
pub struct ProgramObject {
    linked: Arc<LinkedProgram>,
    uniform_data: Vec<u8>,
    uniform_version: u64,
}

impl ProgramObject {
    fn new(linked: LinkedProgram) -> Self {
        let size = linked
            .reflection
            .default_block
            .map_or(0, |block| block.size as usize);
        Self {
            linked: Arc::new(linked),
            uniform_data: vec![0; size],
            uniform_version: 0,
        }
    }

    pub fn linked(&self) -> &Arc<LinkedProgram> {
        &self.linked
    }

    /// Contents of the default uniform block.
    pub fn uniform_data(&self) -> &[u8] {
        &self.uniform_data
    }

    pub fn uniform_version(&self) -> u64 {
        self.uniform_version
    }
}

#[derive(Debug, Default)]
pub struct TextureObject {
    target: Option<TextureTarget>,
}

impl TextureObject {
    /// Target fixed by the first bind, if any.
    pub fn target(&self) -> Option<TextureTarget> {
        self.target
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DestroyedObject {
    Buffer(BufferKey),
    Program(ProgramKey),
    Texture(TextureKey),
}

struct Slot<T> {
    generation: u32,
    refs: u32,
    name: Option<ObjectId>,
    value: Option<T>,
}

/// Generational arena plus the GL name table for one object kind.
pub struct ObjectTable<T> {
    slots: Vec<Slot<T>>,
    free: Vec<u32>,
    names: HashMap<ObjectId, u32>,
    next_name: ObjectId,
}

impl<T> ObjectTable<T> {
    fn new() -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            names: HashMap::new(),
            next_name: 1,
        }
    }

    /// Inserts `value` under a fresh name. The name holds the first reference.
    fn insert(&mut self, value: T) -> (ObjectId, ObjectKey<T>) {
        let name = self.next_name;
        self.next_name += 1;

        let index = match self.free.pop() {
            Some(index) => {
                let slot = &mut self.slots[index as usize];
                slot.refs = 1;
                slot.name = Some(name);
                slot.value = Some(value);
                index
            }
            None => {
                self.slots.push(Slot {
                    generation: 0,
                    refs: 1,
                    name: Some(name),
                    value: Some(value),
                });
                (self.slots.len() - 1) as u32
            }
        };
        self.names.insert(name, index);
        (name, ObjectKey::new(index, self.slots[index as usize].generation))
    }

    pub fn key(&self, name: ObjectId) -> Option<ObjectKey<T>> {
        let index = *self.names.get(&name)?;
        let slot = self.slots.get(index as usize)?;
        Some(ObjectKey::new(index, slot.generation))
    }

    fn slot(&self, key: ObjectKey<T>) -> Option<&Slot<T>> {
        self.slots
            .get(key.index as usize)
            .filter(|slot| slot.generation == key.generation && slot.value.is_some())
    }

    fn slot_mut(&mut self, key: ObjectKey<T>) -> Option<&mut Slot<T>> {
        self.slots
            .get_mut(key.index as usize)
            .filter(|slot| slot.generation == key.generation && slot.value.is_some())
    }

    pub fn get(&self, key: ObjectKey<T>) -> Option<&T> {
        self.slot(key)?.value.as_ref()
    }

    pub fn get_mut(&mut self, key: ObjectKey<T>) -> Option<&mut T> {
        self.slot_mut(key)?.value.as_mut()
    }

    pub fn ref_count(&self, key: ObjectKey<T>) -> Option<u32> {
        self.slot(key).map(|slot| slot.refs)
    }

    pub fn live(&self) -> usize {
        self.slots.iter().filter(|slot| slot.value.is_some()).count()
    }

    fn retain(&mut self, key: ObjectKey<T>) -> bool {
        match self.slot_mut(key) {
            Some(slot) => {
                slot.refs += 1;
                true
            }
            None => false,
        }
    }

    /// Drops one reference. Returns the object if that was the last one.
    fn release(&mut self, key: ObjectKey<T>) -> Option<T> {
        let slot = self.slot_mut(key)?;
        slot.refs = slot.refs.saturating_sub(1);
        if slot.refs > 0 {
            return None;
        }
        let value = slot.value.take();
        slot.generation = slot.generation.wrapping_add(1);
        slot.name = None;
        self.free.push(key.index);
        value
    }

    /// Detaches `name` from its object without touching the reference count.
    fn unname(&mut self, name: ObjectId) -> Option<ObjectKey<T>> {
        let index = self.names.remove(&name)?;
        let slot = self.slots.get_mut(index as usize)?;
        slot.name = None;
        Some(ObjectKey::new(index, slot.generation))
    }
}

/// Object kinds that live in a share group.
pub trait SharedObject: Sized + Send + 'static {
    fn table(objects: &SharedObjects) -> &ObjectTable<Self>;
    fn table_mut(objects: &mut SharedObjects) -> &mut ObjectTable<Self>;
    fn destroyed(key: ObjectKey<Self>) -> DestroyedObject;
}

impl SharedObject for BufferObject {
    fn table(objects: &SharedObjects) -> &ObjectTable<Self> {
        &objects.buffers
    }

    fn table_mut(objects: &mut SharedObjects) -> &mut ObjectTable<Self> {
        &mut objects.buffers
    }

    fn destroyed(key: ObjectKey<Self>) -> DestroyedObject {
        DestroyedObject::Buffer(key)
    }
}

impl SharedObject for ProgramObject {
    fn table(objects: &SharedObjects) -> &ObjectTable<Self> {
        &objects.programs
    }

    fn table_mut(objects: &mut SharedObjects) -> &mut ObjectTable<Self> {
        &mut objects.programs
    }

    fn destroyed(key: ObjectKey<Self>) -> DestroyedObject {
        DestroyedObject::Program(key)
    }
}

impl SharedObject for TextureObject {
    fn table(objects: &SharedObjects) -> &ObjectTable<Self> {
        &objects.textures
    }

    fn table_mut(objects: &mut SharedObjects) -> &mut ObjectTable<Self> {
        &mut objects.textures
    }

    fn destroyed(key: ObjectKey<Self>) -> DestroyedObject {
        DestroyedObject::Texture(key)
    }
}

/// Identity of a context registered with a share group. The group only keeps a weak
/// reference, used to tell live contexts from dropped ones.
#[derive(Debug)]
pub struct ContextTag {
    id: u64,
}

impl ContextTag {
    pub fn id(&self) -> u64 {
        self.id
    }
}

struct ContextCursor {
    tag: Weak<ContextTag>,
    id: u64,
    seen: u64,
}

/// Lock-protected contents of a [`ShareGroup`].
pub struct SharedObjects {
    buffers: ObjectTable<BufferObject>,
    programs: ObjectTable<ProgramObject>,
    textures: ObjectTable<TextureObject>,
    compiler: Box<dyn ShaderCompiler>,
    destroyed_log: Vec<(u64, DestroyedObject)>,
    destroy_seq: u64,
    contexts: Vec<ContextCursor>,
    next_context_id: u64,
}

impl SharedObjects {
    pub fn buffer(&self, key: BufferKey) -> Option<&BufferObject> {
        self.buffers.get(key)
    }

    pub fn program(&self, key: ProgramKey) -> Option<&ProgramObject> {
        self.programs.get(key)
    }

    pub fn texture(&self, key: TextureKey) -> Option<&TextureObject> {
        self.textures.get(key)
    }

    pub fn buffer_key(&self, name: ObjectId) -> Option<BufferKey> {
        self.buffers.key(name)
    }

    pub fn program_key(&self, name: ObjectId) -> Option<ProgramKey> {
        self.programs.key(name)
    }

    pub fn texture_key(&self, name: ObjectId) -> Option<TextureKey> {
        self.textures.key(name)
    }

    fn write_uniform(&mut self, key: ProgramKey, location: u32, bytes: &[u8]) -> Result<(), GlError> {
        let program = self
            .programs
            .get_mut(key)
            .ok_or(GlError::InvalidOperation)?;
        let uniform = program
            .linked
            .reflection
            .uniform(location)
            .ok_or(GlError::InvalidOperation)?;
        if bytes.len() > uniform.size as usize {
            return Err(GlError::InvalidValue);
        }
        let start = uniform.offset as usize;
        let end = start + bytes.len();
        let dst = program
            .uniform_data
            .get_mut(start..end)
            .ok_or(GlError::InvalidOperation)?;
        if dst == bytes {
            return Ok(());
        }
        dst.copy_from_slice(bytes);
        program.uniform_version += 1;
        Ok(())
    }

    fn release<T: SharedObject>(&mut self, key: ObjectKey<T>) -> Option<T> {
        let value = T::table_mut(self).release(key)?;
        self.log_destroyed(T::destroyed(key));
        Some(value)
    }

    fn log_destroyed(&mut self, object: DestroyedObject) {
        debug!(?object, "shared object destroyed");
        self.destroy_seq += 1;
        self.destroyed_log.push((self.destroy_seq, object));
        self.trim_destroyed_log();
    }

    fn trim_destroyed_log(&mut self) {
        self.contexts.retain(|cursor| cursor.tag.strong_count() > 0);
        match self.contexts.iter().map(|cursor| cursor.seen).min() {
            Some(min_seen) => self.destroyed_log.retain(|(seq, _)| *seq > min_seen),
            None => self.destroyed_log.clear(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ObjectCounts {
    pub buffers: usize,
    pub programs: usize,
    pub textures: usize,
}

pub struct ShareGroup {
    objects: Mutex<SharedObjects>,
}

impl fmt::Debug for ShareGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ShareGroup")
            .field("objects", &self.object_counts())
            .finish_non_exhaustive()
    }
}

impl ShareGroup {
    pub fn new(compiler: Box<dyn ShaderCompiler>) -> Arc<Self> {
        Arc::new(Self {
            objects: Mutex::new(SharedObjects {
                buffers: ObjectTable::new(),
                programs: ObjectTable::new(),
                textures: ObjectTable::new(),
                compiler,
                destroyed_log: Vec::new(),
                destroy_seq: 0,
                contexts: Vec::new(),
                next_context_id: 1,
            }),
        })
    }

    /// Never call while holding this guard: [`ObjectRef`] clone/drop, or anything that may
    /// release an object.
    pub(crate) fn lock(&self) -> MutexGuard<'_, SharedObjects> {
        self.objects.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn gen_buffer(&self) -> ObjectId {
        self.lock().buffers.insert(BufferObject::default()).0
    }

    pub fn is_buffer(&self, name: ObjectId) -> bool {
        self.lock().buffers.key(name).is_some()
    }

    /// `glBufferData` on the named buffer.
    pub fn buffer_data(&self, name: ObjectId, data: &[u8], usage: u32) -> Result<(), GlError> {
        let Some(usage) = BufferUsage::from_gl(usage) else {
            debug!(usage, "invalid buffer usage");
            return Err(GlError::InvalidEnum);
        };
        let mut objects = self.lock();
        let key = objects.buffers.key(name).ok_or(GlError::InvalidOperation)?;
        let buffer = objects
            .buffers
            .get_mut(key)
            .ok_or(GlError::InvalidOperation)?;
        buffer.data.clear();
        buffer.data.extend_from_slice(data);
        buffer.usage = usage;
        buffer.version += 1;
        buffer.last_update = None;
        Ok(())
    }

    /// `glBufferSubData` on the named buffer.
    pub fn buffer_sub_data(&self, name: ObjectId, offset: u64, data: &[u8]) -> Result<(), GlError> {
        let mut objects = self.lock();
        let key = objects.buffers.key(name).ok_or(GlError::InvalidOperation)?;
        let buffer = objects
            .buffers
            .get_mut(key)
            .ok_or(GlError::InvalidOperation)?;
        let end = offset
            .checked_add(data.len() as u64)
            .ok_or(GlError::InvalidValue)?;
        if end > buffer.len() {
            debug!(offset, len = data.len(), size = buffer.len(), "buffer_sub_data out of range");
            return Err(GlError::InvalidValue);
        }
        if data.is_empty() {
            return Ok(());
        }
        buffer.data[offset as usize..end as usize].copy_from_slice(data);
        buffer.version += 1;
        buffer.last_update = Some(offset..end);
        Ok(())
    }

    pub fn delete_buffer(&self, name: ObjectId) {
        self.delete::<BufferObject>(name);
    }

    /// Compiles and links a program. Returns its name.
    pub fn create_program(
        &self,
        vertex_source: &str,
        fragment_source: &str,
    ) -> Result<ObjectId, ProgramError> {
        let mut objects = self.lock();
        let linked =
            LinkedProgram::link(objects.compiler.as_mut(), vertex_source, fragment_source)?;
        Ok(objects.programs.insert(ProgramObject::new(linked)).0)
    }

    pub fn delete_program(&self, name: ObjectId) {
        self.delete::<ProgramObject>(name);
    }

    /// Writes `bytes` to the default-block uniform at `location` of the named program.
    pub fn set_uniform(&self, program: ObjectId, location: u32, bytes: &[u8]) -> Result<(), GlError> {
        let mut objects = self.lock();
        let key = objects
            .programs
            .key(program)
            .ok_or(GlError::InvalidOperation)?;
        objects.write_uniform(key, location, bytes)
    }

    /// Like [`Self::set_uniform`] for a program that may no longer have a name (a current
    /// program flagged for deletion).
    pub(crate) fn set_program_uniform(
        &self,
        program: ProgramKey,
        location: u32,
        bytes: &[u8],
    ) -> Result<(), GlError> {
        self.lock().write_uniform(program, location, bytes)
    }

    pub fn gen_texture(&self) -> ObjectId {
        self.lock().textures.insert(TextureObject::default()).0
    }

    pub fn delete_texture(&self, name: ObjectId) {
        self.delete::<TextureObject>(name);
    }

    /// Current reference count of the named object (name reference included).
    pub fn ref_count<T: SharedObject>(&self, name: ObjectId) -> Option<u32> {
        let objects = self.lock();
        let table = T::table(&objects);
        table.ref_count(table.key(name)?)
    }

    pub fn object_counts(&self) -> ObjectCounts {
        let objects = self.lock();
        ObjectCounts {
            buffers: objects.buffers.live(),
            programs: objects.programs.live(),
            textures: objects.textures.live(),
        }
    }

    /// Number of live contexts attached to this group.
    pub fn context_count(&self) -> usize {
        self.lock()
            .contexts
            .iter()
            .filter(|cursor| cursor.tag.strong_count() > 0)
            .count()
    }

    fn delete<T: SharedObject>(&self, name: ObjectId) {
        let destroyed = {
            let mut objects = self.lock();
            let Some(key) = T::table_mut(&mut objects).unname(name) else {
                return;
            };
            objects.release(key)
        };
        // Object storage is freed outside the lock.
        drop(destroyed);
    }

    /// Takes a counted reference to the named object.
    pub(crate) fn acquire<T: SharedObject>(
        self: &Arc<Self>,
        name: ObjectId,
    ) -> Result<ObjectRef<T>, GlError> {
        let mut objects = self.lock();
        let table = T::table_mut(&mut objects);
        let key = table.key(name).ok_or(GlError::InvalidOperation)?;
        if !table.retain(key) {
            return Err(GlError::InvalidOperation);
        }
        Ok(ObjectRef {
            group: Arc::clone(self),
            key,
        })
    }

    /// Like [`Self::acquire`], also fixing the texture's target on first bind. Binding to a
    /// target of another type is `GL_INVALID_OPERATION`.
    pub(crate) fn acquire_texture(
        self: &Arc<Self>,
        name: ObjectId,
        target: TextureTarget,
    ) -> Result<ObjectRef<TextureObject>, GlError> {
        let mut objects = self.lock();
        let key = objects.textures.key(name).ok_or(GlError::InvalidOperation)?;
        let texture = objects
            .textures
            .get_mut(key)
            .ok_or(GlError::InvalidOperation)?;
        match texture.target {
            Some(existing) if existing != target => {
                debug!(name, ?existing, ?target, "texture bound to a target of another type");
                return Err(GlError::InvalidOperation);
            }
            Some(_) => {}
            None => texture.target = Some(target),
        }
        objects.textures.retain(key);
        Ok(ObjectRef {
            group: Arc::clone(self),
            key,
        })
    }

    pub(crate) fn register_context(&self) -> Arc<ContextTag> {
        let mut objects = self.lock();
        let id = objects.next_context_id;
        objects.next_context_id += 1;
        let tag = Arc::new(ContextTag { id });
        let seen = objects.destroy_seq;
        objects.contexts.push(ContextCursor {
            tag: Arc::downgrade(&tag),
            id,
            seen,
        });
        tag
    }

    /// Destructions the context has not seen yet, oldest first.
    pub(crate) fn drain_destroyed(&self, tag: &ContextTag) -> Vec<DestroyedObject> {
        let mut objects = self.lock();
        let latest = objects.destroy_seq;
        let Some(cursor) = objects.contexts.iter_mut().find(|c| c.id == tag.id) else {
            return Vec::new();
        };
        let seen = std::mem::replace(&mut cursor.seen, latest);
        let drained = objects
            .destroyed_log
            .iter()
            .filter(|(seq, _)| *seq > seen)
            .map(|(_, object)| *object)
            .collect();
        objects.trim_destroyed_log();
        drained
    }
}

/// Counted reference to a shared object. Cloning adds a reference, dropping removes one; both
/// take the share-group lock.
pub struct ObjectRef<T: SharedObject> {
    group: Arc<ShareGroup>,
    key: ObjectKey<T>,
}

pub type BufferRef = ObjectRef<BufferObject>;
pub type ProgramRef = ObjectRef<ProgramObject>;
pub type TextureRef = ObjectRef<TextureObject>;

impl<T: SharedObject> ObjectRef<T> {
    pub fn key(&self) -> ObjectKey<T> {
        self.key
    }

    pub fn group(&self) -> &Arc<ShareGroup> {
        &self.group
    }
}

impl<T: SharedObject> Clone for ObjectRef<T> {
    fn clone(&self) -> Self {
        T::table_mut(&mut self.group.lock()).retain(self.key);
        Self {
            group: Arc::clone(&self.group),
            key: self.key,
        }
    }
}

impl<T: SharedObject> Drop for ObjectRef<T> {
    fn drop(&mut self) {
        let destroyed = self.group.lock().release(self.key);
        drop(destroyed);
    }
}

impl<T: SharedObject> PartialEq for ObjectRef<T> {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key && Arc::ptr_eq(&self.group, &other.group)
    }
}

impl<T: SharedObject> Eq for ObjectRef<T> {}

impl<T: SharedObject> fmt::Debug for ObjectRef<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("ObjectRef").field(&self.key).finish()
    }
}
