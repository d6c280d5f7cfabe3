//! Growable linear allocator over one device buffer.
//!
//! A `Heap` hands out byte offsets into a single buffer, bumping a committed
//! size. When a request does not fit, the heap moves to a larger buffer and
//! copies the committed bytes across on the device. Offsets therefore stay
//! valid across growth, but the backing buffer does not: bind
//! [`Heap::buffer`] at record time rather than caching it.
//!
//! Space is never reclaimed. [`Heap::free`] exists so owners can release
//! ranges through one path, but it does nothing.

use std::fmt;
use std::ops::Deref;
use std::sync::Arc;

use ash::vk;
use parking_lot::Mutex;
use tessera_gpu::{Buffer, BufferDesc, GpuDevice, GpuError, MemoryLocation, Result};

/// Bytes at the start of every heap that are never handed out, so that an
/// offset of zero can mean "unset".
pub const HEAP_RESERVED_BYTES: u64 = 128;

/// Capacity of a heap created with the default configuration.
pub const DEFAULT_HEAP_CAPACITY: u64 = 1024;

/// Heap configuration.
#[derive(Debug, Clone)]
pub struct HeapConfig {
    /// Debug name of the backing buffer.
    pub name: String,
    /// Usage of the backing buffer. Transfer source and destination are
    /// always added so the heap can grow.
    pub usage: vk::BufferUsageFlags,
    /// Memory location of the backing buffer.
    pub location: MemoryLocation,
    /// Initial buffer size in bytes.
    pub initial_capacity: u64,
}

impl Default for HeapConfig {
    fn default() -> Self {
        Self {
            name: "heap".to_string(),
            usage: vk::BufferUsageFlags::STORAGE_BUFFER,
            location: MemoryLocation::GpuOnly,
            initial_capacity: DEFAULT_HEAP_CAPACITY,
        }
    }
}

impl HeapConfig {
    /// Create a config with the given name and usage.
    pub fn new(name: impl Into<String>, usage: vk::BufferUsageFlags) -> Self {
        Self {
            name: name.into(),
            usage,
            ..Self::default()
        }
    }

    /// Vertex storage.
    pub fn vertices() -> Self {
        Self::new("vertex_heap", vk::BufferUsageFlags::VERTEX_BUFFER)
    }

    /// Index storage.
    pub fn indices() -> Self {
        Self::new("index_heap", vk::BufferUsageFlags::INDEX_BUFFER)
    }

    /// Set the initial capacity.
    pub fn with_initial_capacity(mut self, capacity: u64) -> Self {
        self.initial_capacity = capacity;
        self
    }

    /// Set the memory location.
    pub fn with_location(mut self, location: MemoryLocation) -> Self {
        self.location = location;
        self
    }

    fn buffer_desc(&self, capacity: u64) -> BufferDesc {
        BufferDesc::new(
            self.name.clone(),
            capacity,
            self.usage | vk::BufferUsageFlags::TRANSFER_SRC | vk::BufferUsageFlags::TRANSFER_DST,
            self.location,
        )
    }
}

struct HeapInner {
    config: HeapConfig,
    buffer: Buffer,
    size: u64,
    extend_count: u32,
}

/// A growable bump allocator over one device buffer.
///
/// Cloning a `Heap` yields another handle to the same allocator.
#[derive(Clone)]
pub struct Heap {
    device: Arc<dyn GpuDevice>,
    inner: Arc<Mutex<HeapInner>>,
}

impl Heap {
    /// Create a heap with its initial buffer.
    pub fn new(device: Arc<dyn GpuDevice>, config: HeapConfig) -> Result<Self> {
        let capacity = config.initial_capacity.max(HEAP_RESERVED_BYTES);
        let buffer = device.create_buffer(&config.buffer_desc(capacity))?;
        tracing::debug!(name = %config.name, capacity, "Created heap");

        Ok(Self {
            device,
            inner: Arc::new(Mutex::new(HeapInner {
                config,
                buffer,
                size: HEAP_RESERVED_BYTES,
                extend_count: 0,
            })),
        })
    }

    /// Reserve `size` bytes and return their offset.
    ///
    /// Grows the backing buffer to 1.25x the required size if needed.
    #[cfg_attr(feature = "profiling-tracy", tracing::instrument(level = "trace", skip(self)))]
    pub fn alloc(&self, size: u64) -> Result<u64> {
        let mut inner = self.inner.lock();
        let offset = inner.size;
        let overflow = || {
            GpuError::AllocationFailed(format!(
                "{} cannot hold {size} more bytes after {offset}",
                inner.config.name
            ))
        };
        let required = offset.checked_add(size).ok_or_else(overflow)?;
        if required > inner.buffer.size() {
            let capacity = required.checked_add(required >> 2).ok_or_else(overflow)?;
            self.extend(&mut inner, capacity)?;
        }
        inner.size = required;
        tracing::trace!(name = %inner.config.name, offset, size, "Heap alloc");
        Ok(offset)
    }

    /// Reserve `size` bytes and tie the range's lifetime to the returned value.
    pub fn alloc_owned(&self, size: u64) -> Result<HeapRangeOwned> {
        let offset = self.alloc(size)?;
        Ok(HeapRangeOwned {
            range: self.range(offset, size),
        })
    }

    /// A non-owning view of `[offset, offset + size)`.
    pub fn range(&self, offset: u64, size: u64) -> HeapRange {
        HeapRange {
            heap: self.clone(),
            offset,
            size,
        }
    }

    /// Release the allocation at `offset`.
    ///
    /// Heaps never reuse space, so this only records the call. Callers must
    /// not assume memory has been returned.
    pub fn free(&self, offset: u64) {
        tracing::trace!(name = %self.name(), offset, "Heap free (space is not reclaimed)");
    }

    /// Copy `data` to `offset` in the backing buffer.
    pub fn write(&self, offset: u64, data: &[u8]) -> Result<()> {
        let buffer = self.buffer();
        self.device.write_buffer(&buffer, offset, data)
    }

    /// The current backing buffer. Replaced whenever the heap grows.
    pub fn buffer(&self) -> Buffer {
        self.inner.lock().buffer.clone()
    }

    /// Bytes committed so far, including the reserved prefix.
    pub fn committed(&self) -> u64 {
        self.inner.lock().size
    }

    /// Size of the backing buffer in bytes.
    pub fn capacity(&self) -> u64 {
        self.inner.lock().buffer.size()
    }

    /// How many times the heap has grown.
    pub fn extend_count(&self) -> u32 {
        self.inner.lock().extend_count
    }

    /// Debug name.
    pub fn name(&self) -> String {
        self.inner.lock().config.name.clone()
    }

    fn extend(&self, inner: &mut HeapInner, capacity: u64) -> Result<()> {
        let new_buffer = self
            .device
            .create_buffer(&inner.config.buffer_desc(capacity))?;
        let old_buffer = inner.buffer.clone();
        let committed = inner.size;

        // The copy completes before submit_once returns, so any later read of
        // the new buffer sees the old contents.
        self.device.submit_once(&mut |rec| {
            rec.copy_buffer(
                &old_buffer,
                &new_buffer,
                &[vk::BufferCopy {
                    src_offset: 0,
                    dst_offset: 0,
                    size: committed,
                }],
            );
        })?;

        tracing::debug!(
            name = %inner.config.name,
            old_capacity = old_buffer.size(),
            new_capacity = capacity,
            committed,
            "Heap grew"
        );
        inner.buffer = new_buffer;
        inner.extend_count += 1;
        Ok(())
    }
}

impl fmt::Debug for Heap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("Heap")
            .field("name", &inner.config.name)
            .field("committed", &inner.size)
            .field("capacity", &inner.buffer.size())
            .finish()
    }
}

/// A view of a byte range inside a heap.
#[derive(Debug, Clone)]
pub struct HeapRange {
    heap: Heap,
    offset: u64,
    size: u64,
}

impl HeapRange {
    /// Offset of the range within the heap.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Size of the range in bytes.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// One past the last byte of the range.
    pub fn end(&self) -> u64 {
        self.offset + self.size
    }

    /// The heap the range lives in.
    pub fn heap(&self) -> &Heap {
        &self.heap
    }

    /// Copy bytes to `offset` relative to the start of the range.
    pub fn set_data(&self, offset: u64, data: &[u8]) -> Result<()> {
        let end = offset.saturating_add(data.len() as u64);
        if end > self.size {
            return Err(GpuError::OutOfBounds {
                what: "heap range",
                offset,
                end,
                size: self.size,
            });
        }
        self.heap.write(self.offset + offset, data)
    }

    /// Copy a slice of plain-old-data values to `offset` relative to the
    /// start of the range.
    pub fn set_pod<T: bytemuck::Pod>(&self, offset: u64, data: &[T]) -> Result<()> {
        self.set_data(offset, bytemuck::cast_slice(data))
    }
}

/// A heap range that is released when dropped.
#[derive(Debug)]
pub struct HeapRangeOwned {
    range: HeapRange,
}

impl Deref for HeapRangeOwned {
    type Target = HeapRange;

    fn deref(&self) -> &HeapRange {
        &self.range
    }
}

impl Drop for HeapRangeOwned {
    fn drop(&mut self) {
        self.range.heap.free(self.range.offset);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tessera_gpu::HeadlessDevice;

    fn heap() -> (Arc<HeadlessDevice>, Heap) {
        let device = Arc::new(HeadlessDevice::new());
        let heap = Heap::new(device.clone(), HeapConfig::vertices()).unwrap();
        (device, heap)
    }

    #[test]
    fn offsets_never_overlap_and_skip_reserved_prefix() {
        let (_device, heap) = heap();
        let sizes = [1, 17, 0, 300, 64, 2048, 5, 4096];

        let mut previous: Option<(u64, u64)> = None;
        for size in sizes {
            let offset = heap.alloc(size).unwrap();
            assert!(offset >= HEAP_RESERVED_BYTES);
            if let Some((prev_offset, prev_size)) = previous {
                assert!(offset >= prev_offset + prev_size);
            }
            previous = Some((offset, size));
        }
    }

    #[test]
    fn growth_preserves_committed_bytes() {
        let (device, heap) = heap();
        let range = heap.alloc_owned(256).unwrap();
        let pattern: Vec<u8> = (0..=255).collect();
        range.set_data(0, &pattern).unwrap();
        let before = heap.buffer();

        heap.alloc(heap.capacity() * 4).unwrap();

        let after = heap.buffer();
        assert!(!before.ptr_eq(&after));
        assert!(heap.extend_count() >= 1);
        let contents = device.read_buffer(&after).unwrap();
        let start = range.offset() as usize;
        assert_eq!(&contents[start..start + 256], pattern.as_slice());
    }

    #[test]
    fn growth_reserves_a_quarter_of_headroom() {
        let (_device, heap) = heap();
        heap.alloc(2000).unwrap();
        let required = HEAP_RESERVED_BYTES + 2000;
        assert_eq!(heap.capacity(), required + (required >> 2));
        assert_eq!(heap.committed(), required);
    }

    #[test]
    fn end_to_end_offsets_and_growth() {
        let (device, heap) = heap();
        assert_eq!(heap.committed(), HEAP_RESERVED_BYTES);

        assert_eq!(heap.alloc(100).unwrap(), 128);
        assert_eq!(heap.alloc(50).unwrap(), 228);
        let written: Vec<u8> = (0..150).map(|i| (i * 7 % 251) as u8).collect();
        heap.write(128, &written).unwrap();
        assert_eq!(heap.extend_count(), 0);

        assert_eq!(heap.alloc(2000).unwrap(), 278);
        assert_eq!(heap.extend_count(), 1);

        let contents = device.read_buffer(&heap.buffer()).unwrap();
        assert_eq!(&contents[128..278], written.as_slice());
    }

    #[test]
    fn old_buffer_is_destroyed_after_flush() {
        let (device, heap) = heap();
        heap.alloc(4096).unwrap();
        assert_eq!(device.stats().live_buffers, 2);
        device.flush().unwrap();
        assert_eq!(device.stats().live_buffers, 1);
    }

    #[test]
    fn free_does_not_reclaim_space() {
        let (_device, heap) = heap();
        let first = heap.alloc_owned(64).unwrap();
        let first_offset = first.offset();
        drop(first);
        let second = heap.alloc(64).unwrap();
        assert_eq!(second, first_offset + 64);
    }

    #[test]
    fn set_data_is_bounded_by_the_range() {
        let (_device, heap) = heap();
        let range = heap.alloc_owned(8).unwrap();
        assert!(range.set_pod(0, &[1u32, 2u32]).is_ok());
        assert!(matches!(
            range.set_data(4, &[0; 8]),
            Err(GpuError::OutOfBounds { .. })
        ));
        assert!(matches!(
            range.set_data(u64::MAX - 2, &[0; 8]),
            Err(GpuError::OutOfBounds { .. })
        ));
    }

    #[test]
    fn oversized_alloc_fails_without_committing() {
        let (_device, heap) = heap();
        assert_eq!(heap.alloc(16).unwrap(), 128);

        assert!(matches!(
            heap.alloc(u64::MAX - 64),
            Err(GpuError::AllocationFailed(_))
        ));
        assert!(matches!(
            heap.alloc(u64::MAX / 4 * 3),
            Err(GpuError::AllocationFailed(_))
        ));
        assert_eq!(heap.committed(), 144);
        assert_eq!(heap.extend_count(), 0);
        assert_eq!(heap.alloc(16).unwrap(), 144);
    }

    #[test]
    fn location_survives_growth() {
        let device = Arc::new(HeadlessDevice::new());
        let config = HeapConfig::indices()
            .with_location(MemoryLocation::CpuToGpu)
            .with_initial_capacity(256);
        let heap = Heap::new(device, config).unwrap();
        assert_eq!(heap.buffer().location(), MemoryLocation::CpuToGpu);

        let range = heap.alloc_owned(6).unwrap();
        range.set_pod(0, &[0u16, 1, 2]).unwrap();
        heap.alloc(1024).unwrap();

        assert_eq!(heap.extend_count(), 1);
        assert_eq!(heap.buffer().location(), MemoryLocation::CpuToGpu);
    }
}
