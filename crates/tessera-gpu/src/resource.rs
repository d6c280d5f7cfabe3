//! Reference-counted GPU resource handles.
//!
//! `Buffer` and `Texture` are cheap to clone. Every clone refers to the same
//! native object; when the last one drops the object is retired into the
//! owning device's [`DeferredDeletionQueue`] and destroyed after the next
//! flush.

use std::fmt;
use std::sync::Arc;

use ash::vk;
use gpu_allocator::MemoryLocation;
use parking_lot::Mutex;

use crate::deferred::{DeferredDeletionQueue, RetiredResource};

/// Shared deletion queue a device hands to every handle it creates.
pub type RetireQueue = Arc<Mutex<DeferredDeletionQueue>>;

/// Buffer creation parameters.
#[derive(Debug, Clone)]
pub struct BufferDesc {
    /// Debug name.
    pub name: String,
    /// Size in bytes.
    pub size: u64,
    /// Usage flags.
    pub usage: vk::BufferUsageFlags,
    /// Memory location.
    pub location: MemoryLocation,
}

impl BufferDesc {
    /// Create a descriptor for a buffer of `size` bytes.
    pub fn new(
        name: impl Into<String>,
        size: u64,
        usage: vk::BufferUsageFlags,
        location: MemoryLocation,
    ) -> Self {
        Self {
            name: name.into(),
            size,
            usage,
            location,
        }
    }
}

/// A device buffer handle.
#[derive(Clone)]
pub struct Buffer {
    inner: Arc<BufferInner>,
}

struct BufferInner {
    raw: vk::Buffer,
    desc: BufferDesc,
    retire: RetireQueue,
}

impl Buffer {
    /// Wrap a native buffer created by a device backend.
    ///
    /// The buffer is retired into `retire` once the last handle drops.
    pub fn new(raw: vk::Buffer, desc: BufferDesc, retire: RetireQueue) -> Self {
        Self {
            inner: Arc::new(BufferInner { raw, desc, retire }),
        }
    }

    /// Get the raw buffer handle.
    pub fn raw(&self) -> vk::Buffer {
        self.inner.raw
    }

    /// Size in bytes.
    pub fn size(&self) -> u64 {
        self.inner.desc.size
    }

    /// Usage flags the buffer was created with.
    pub fn usage(&self) -> vk::BufferUsageFlags {
        self.inner.desc.usage
    }

    /// Memory location the buffer lives in.
    pub fn location(&self) -> MemoryLocation {
        self.inner.desc.location
    }

    /// Debug name.
    pub fn name(&self) -> &str {
        &self.inner.desc.name
    }

    /// Whether both handles refer to the same buffer.
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Drop for BufferInner {
    fn drop(&mut self) {
        self.retire.lock().retire(RetiredResource::Buffer(self.raw));
    }
}

impl fmt::Debug for Buffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Buffer")
            .field("name", &self.name())
            .field("raw", &self.raw())
            .field("size", &self.size())
            .finish()
    }
}

/// Texture creation parameters.
///
/// Also used as the template of transient render targets, in which case the
/// extent is overwritten on every resolve.
#[derive(Debug, Clone)]
pub struct TextureDesc {
    /// Debug name.
    pub name: String,
    /// Pixel format.
    pub format: vk::Format,
    /// Size in pixels.
    pub extent: vk::Extent2D,
    /// Usage flags.
    pub usage: vk::ImageUsageFlags,
    /// Filtering used when the texture is sampled.
    pub filter: vk::Filter,
}

impl TextureDesc {
    /// Create a 1x1, linearly filtered texture descriptor.
    pub fn new(name: impl Into<String>, format: vk::Format, usage: vk::ImageUsageFlags) -> Self {
        Self {
            name: name.into(),
            format,
            extent: vk::Extent2D {
                width: 1,
                height: 1,
            },
            usage,
            filter: vk::Filter::LINEAR,
        }
    }

    /// Set the extent.
    pub fn with_extent(mut self, extent: vk::Extent2D) -> Self {
        self.extent = extent;
        self
    }

    /// Set the sampling filter.
    pub fn with_filter(mut self, filter: vk::Filter) -> Self {
        self.filter = filter;
        self
    }

    /// Image aspect implied by the format.
    pub fn aspect(&self) -> vk::ImageAspectFlags {
        aspect_for_format(self.format)
    }
}

/// Image aspect flags for a format.
pub fn aspect_for_format(format: vk::Format) -> vk::ImageAspectFlags {
    match format {
        vk::Format::D16_UNORM | vk::Format::X8_D24_UNORM_PACK32 | vk::Format::D32_SFLOAT => {
            vk::ImageAspectFlags::DEPTH
        }
        vk::Format::D16_UNORM_S8_UINT
        | vk::Format::D24_UNORM_S8_UINT
        | vk::Format::D32_SFLOAT_S8_UINT => {
            vk::ImageAspectFlags::DEPTH | vk::ImageAspectFlags::STENCIL
        }
        vk::Format::S8_UINT => vk::ImageAspectFlags::STENCIL,
        _ => vk::ImageAspectFlags::COLOR,
    }
}

/// A device texture handle.
///
/// Besides the native image and its default view, a texture carries its
/// current layout. All clones share it; the render graph updates it as it
/// records transitions.
#[derive(Clone)]
pub struct Texture {
    inner: Arc<TextureInner>,
}

struct TextureInner {
    image: vk::Image,
    view: vk::ImageView,
    desc: TextureDesc,
    layout: Mutex<vk::ImageLayout>,
    retire: RetireQueue,
}

impl Texture {
    /// Wrap a native image and view created by a device backend.
    ///
    /// The texture starts in `UNDEFINED` layout.
    pub fn new(
        image: vk::Image,
        view: vk::ImageView,
        desc: TextureDesc,
        retire: RetireQueue,
    ) -> Self {
        Self {
            inner: Arc::new(TextureInner {
                image,
                view,
                desc,
                layout: Mutex::new(vk::ImageLayout::UNDEFINED),
                retire,
            }),
        }
    }

    /// Get the raw image handle.
    pub fn raw(&self) -> vk::Image {
        self.inner.image
    }

    /// Get the default image view.
    pub fn view(&self) -> vk::ImageView {
        self.inner.view
    }

    /// Size in pixels.
    pub fn extent(&self) -> vk::Extent2D {
        self.inner.desc.extent
    }

    /// Pixel format.
    pub fn format(&self) -> vk::Format {
        self.inner.desc.format
    }

    /// Usage flags the image was created with.
    pub fn usage(&self) -> vk::ImageUsageFlags {
        self.inner.desc.usage
    }

    /// Sampling filter.
    pub fn filter(&self) -> vk::Filter {
        self.inner.desc.filter
    }

    /// Debug name.
    pub fn name(&self) -> &str {
        &self.inner.desc.name
    }

    /// Image aspect implied by the format.
    pub fn aspect(&self) -> vk::ImageAspectFlags {
        self.inner.desc.aspect()
    }

    /// Full subresource range of the image.
    pub fn subresource_range(&self) -> vk::ImageSubresourceRange {
        vk::ImageSubresourceRange {
            aspect_mask: self.aspect(),
            base_mip_level: 0,
            level_count: 1,
            base_array_layer: 0,
            layer_count: 1,
        }
    }

    /// Layout the image is in once all recorded work has run.
    pub fn current_layout(&self) -> vk::ImageLayout {
        *self.inner.layout.lock()
    }

    /// Record a layout transition.
    pub fn set_layout(&self, layout: vk::ImageLayout) {
        *self.inner.layout.lock() = layout;
    }

    /// Whether both handles refer to the same image.
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Drop for TextureInner {
    fn drop(&mut self) {
        self.retire.lock().retire(RetiredResource::Image {
            image: self.image,
            view: self.view,
        });
    }
}

impl fmt::Debug for Texture {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Texture")
            .field("name", &self.name())
            .field("raw", &self.raw())
            .field("extent", &self.extent())
            .field("format", &self.format())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ash::vk::Handle;

    #[test]
    fn depth_formats_map_to_depth_aspect() {
        assert_eq!(
            aspect_for_format(vk::Format::D32_SFLOAT),
            vk::ImageAspectFlags::DEPTH
        );
        assert_eq!(
            aspect_for_format(vk::Format::D24_UNORM_S8_UINT),
            vk::ImageAspectFlags::DEPTH | vk::ImageAspectFlags::STENCIL
        );
        assert_eq!(
            aspect_for_format(vk::Format::R16G16B16A16_SFLOAT),
            vk::ImageAspectFlags::COLOR
        );
    }

    #[test]
    fn last_clone_retires_the_buffer() {
        let retire = RetireQueue::default();
        let buffer = Buffer::new(
            vk::Buffer::from_raw(42),
            BufferDesc::new(
                "test",
                64,
                vk::BufferUsageFlags::VERTEX_BUFFER,
                MemoryLocation::GpuOnly,
            ),
            retire.clone(),
        );
        let clone = buffer.clone();
        drop(buffer);
        assert_eq!(retire.lock().pending_count(), 0);
        drop(clone);
        assert_eq!(retire.lock().pending_count(), 1);
    }

    #[test]
    fn layout_is_shared_between_clones() {
        let texture = Texture::new(
            vk::Image::from_raw(1),
            vk::ImageView::from_raw(2),
            TextureDesc::new(
                "color",
                vk::Format::R8G8B8A8_UNORM,
                vk::ImageUsageFlags::SAMPLED,
            ),
            RetireQueue::default(),
        );
        let clone = texture.clone();
        texture.set_layout(vk::ImageLayout::GENERAL);
        assert_eq!(clone.current_layout(), vk::ImageLayout::GENERAL);
    }
}
