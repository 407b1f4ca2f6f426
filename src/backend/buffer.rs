// Transfer buffers for vertex, index, staging and uniform data
//
// A TransferBuffer is `instance_count` elements of `instance_size` bytes,
// each starting on a multiple of the alignment the buffer was created with.
// Per-frame uniform data lives in one buffer with one element per frame
// slot, so the stride has to honour minUniformBufferOffsetAlignment.
//
// Host writes need HOST_VISIBLE memory. Device-local buffers are filled
// through a temporary staging buffer and a one-shot copy.

use anyhow::{Context, Result};
use ash::vk;
use bytemuck::Pod;
use std::sync::Arc;

use super::GraphicsDevice;
use crate::error::GpuError;

/// Round `instance_size` up to a multiple of `min_offset_alignment`.
pub fn aligned_stride(
    instance_size: vk::DeviceSize,
    min_offset_alignment: vk::DeviceSize,
) -> vk::DeviceSize {
    if min_offset_alignment == 0 {
        return instance_size;
    }
    instance_size.div_ceil(min_offset_alignment) * min_offset_alignment
}

/// Byte offset of element `index`. Panics if `index >= count`.
pub fn element_offset(index: u32, count: u32, stride: vk::DeviceSize) -> vk::DeviceSize {
    assert!(
        index < count,
        "element {} out of range ({} elements)",
        index,
        count
    );
    index as vk::DeviceSize * stride
}

/// Bytes covered by mapping `size` at `offset`. Panics if the range leaves
/// the buffer.
pub fn mapped_len(
    size: vk::DeviceSize,
    offset: vk::DeviceSize,
    buffer_size: vk::DeviceSize,
) -> vk::DeviceSize {
    assert!(
        offset <= buffer_size,
        "map offset {} is past the end of a {} byte buffer",
        offset,
        buffer_size
    );
    if size == vk::WHOLE_SIZE {
        return buffer_size - offset;
    }
    assert!(
        size <= buffer_size - offset,
        "map of {} bytes at offset {} overruns a {} byte buffer",
        size,
        offset,
        buffer_size
    );
    size
}

/// Grow `[offset, offset + size)` to `atom` boundaries as required for
/// non-coherent flushes. Ranges running into the end of the allocation
/// become WHOLE_SIZE.
pub fn atom_aligned_range(
    offset: vk::DeviceSize,
    size: vk::DeviceSize,
    atom: vk::DeviceSize,
    memory_size: vk::DeviceSize,
) -> (vk::DeviceSize, vk::DeviceSize) {
    let atom = atom.max(1);
    let start = offset / atom * atom;
    if size == vk::WHOLE_SIZE {
        return (start, vk::WHOLE_SIZE);
    }
    let end = (offset + size).div_ceil(atom) * atom;
    if end >= memory_size {
        (start, vk::WHOLE_SIZE)
    } else {
        (start, end - start)
    }
}

/// Copy `data` into `dst` at `offset`. Panics if it does not fit.
pub fn copy_into(dst: &mut [u8], data: &[u8], offset: usize) {
    let end = offset
        .checked_add(data.len())
        .filter(|&end| end <= dst.len());
    let Some(end) = end else {
        panic!(
            "write of {} bytes at offset {} overruns mapping of {} bytes",
            data.len(),
            offset,
            dst.len()
        );
    };
    dst[offset..end].copy_from_slice(data);
}

struct Mapping {
    ptr: *mut u8,
    len: usize,
}

pub struct TransferBuffer {
    device: Arc<GraphicsDevice>,
    buffer: vk::Buffer,
    memory: vk::DeviceMemory,
    memory_size: vk::DeviceSize,
    mapping: Option<Mapping>,

    buffer_size: vk::DeviceSize,
    instance_count: u32,
    instance_size: vk::DeviceSize,
    alignment_size: vk::DeviceSize,
    usage: vk::BufferUsageFlags,
    memory_properties: vk::MemoryPropertyFlags,
}

impl TransferBuffer {
    pub fn new(
        device: Arc<GraphicsDevice>,
        instance_size: vk::DeviceSize,
        instance_count: u32,
        usage: vk::BufferUsageFlags,
        memory_properties: vk::MemoryPropertyFlags,
        min_offset_alignment: vk::DeviceSize,
    ) -> Result<Self> {
        let alignment_size = aligned_stride(instance_size, min_offset_alignment);
        let buffer_size = alignment_size * instance_count as vk::DeviceSize;

        let (buffer, memory) = device.create_buffer(buffer_size, usage, memory_properties)?;
        let memory_size = unsafe { device.device.get_buffer_memory_requirements(buffer) }.size;

        log::debug!(
            "Created buffer: {} x {} bytes (stride {}), {:?}",
            instance_count,
            instance_size,
            alignment_size,
            usage
        );

        Ok(Self {
            device,
            buffer,
            memory,
            memory_size,
            mapping: None,
            buffer_size,
            instance_count,
            instance_size,
            alignment_size,
            usage,
            memory_properties,
        })
    }

    /// Device-local buffer holding `data`, uploaded through a staging buffer.
    pub fn device_local_with_data<T: Pod>(
        device: Arc<GraphicsDevice>,
        data: &[T],
        usage: vk::BufferUsageFlags,
    ) -> Result<Self> {
        let buffer = Self::new(
            device,
            std::mem::size_of::<T>() as vk::DeviceSize,
            data.len() as u32,
            usage | vk::BufferUsageFlags::TRANSFER_DST,
            vk::MemoryPropertyFlags::DEVICE_LOCAL,
            1,
        )?;
        buffer.upload_via_staging(bytemuck::cast_slice(data))?;
        Ok(buffer)
    }

    // =========================================================================
    // MAPPING
    // =========================================================================

    /// Map `size` bytes starting at `offset`. Writes are relative to the
    /// start of the mapping.
    ///
    /// Panics on memory that is not HOST_VISIBLE or on a second map.
    pub fn map(&mut self, size: vk::DeviceSize, offset: vk::DeviceSize) -> Result<()> {
        assert!(
            self.memory_properties
                .contains(vk::MemoryPropertyFlags::HOST_VISIBLE),
            "cannot map a buffer without HOST_VISIBLE memory"
        );
        assert!(self.mapping.is_none(), "buffer is already mapped");

        let len = mapped_len(size, offset, self.buffer_size);
        let ptr = unsafe {
            self.device
                .device
                .map_memory(self.memory, offset, size, vk::MemoryMapFlags::empty())
        }
        .context("Failed to map buffer memory")?;

        self.mapping = Some(Mapping {
            ptr: ptr.cast(),
            len: len as usize,
        });
        Ok(())
    }

    pub fn unmap(&mut self) {
        if self.mapping.take().is_some() {
            unsafe { self.device.device.unmap_memory(self.memory) };
        }
    }

    pub fn is_mapped(&self) -> bool {
        self.mapping.is_some()
    }

    fn mapped_slice(&mut self) -> &mut [u8] {
        let Some(mapping) = &self.mapping else {
            panic!("cannot access an unmapped buffer");
        };
        // SAFETY: the driver mapped `len` bytes at `ptr` and nothing else
        // aliases the mapping while we hold &mut self
        unsafe { std::slice::from_raw_parts_mut(mapping.ptr, mapping.len) }
    }

    // =========================================================================
    // WRITES
    // =========================================================================

    /// Copy `size` bytes of `data` to `offset` within the mapping.
    ///
    /// With `size == WHOLE_SIZE` all of `data` goes to the start of the
    /// mapping, which must be large enough to hold it.
    pub fn write_bytes(&mut self, data: &[u8], size: vk::DeviceSize, offset: vk::DeviceSize) {
        let slice = self.mapped_slice();
        if size == vk::WHOLE_SIZE {
            copy_into(slice, data, 0);
        } else {
            let size = size as usize;
            assert!(
                data.len() >= size,
                "write of {} bytes from a {} byte slice",
                size,
                data.len()
            );
            copy_into(slice, &data[..size], offset as usize);
        }
    }

    pub fn write_value<T: Pod>(&mut self, value: &T, offset: vk::DeviceSize) {
        let bytes = bytemuck::bytes_of(value);
        self.write_bytes(bytes, bytes.len() as vk::DeviceSize, offset);
    }

    /// Write `value` into element `index`.
    pub fn write_to_index<T: Pod>(&mut self, value: &T, index: u32) {
        assert!(
            std::mem::size_of::<T>() as vk::DeviceSize <= self.instance_size,
            "value is larger than one element"
        );
        self.write_value(value, self.index_offset(index));
    }

    /// Copy `len` bytes out of the mapping, starting at `offset`.
    pub fn read_bytes(&mut self, offset: vk::DeviceSize, len: usize) -> Vec<u8> {
        let slice = self.mapped_slice();
        let start = offset as usize;
        slice[start..start + len].to_vec()
    }

    // =========================================================================
    // CACHE MANAGEMENT
    // =========================================================================

    fn is_coherent(&self) -> bool {
        self.memory_properties
            .contains(vk::MemoryPropertyFlags::HOST_COHERENT)
    }

    fn mapped_range(&self, size: vk::DeviceSize, offset: vk::DeviceSize) -> vk::MappedMemoryRange {
        let (offset, size) = atom_aligned_range(
            offset,
            size,
            self.device.non_coherent_atom_size(),
            self.memory_size,
        );
        vk::MappedMemoryRange::builder()
            .memory(self.memory)
            .offset(offset)
            .size(size)
            .build()
    }

    /// Make host writes in the range visible to the device.
    ///
    /// No-op on HOST_COHERENT memory.
    pub fn flush(&self, size: vk::DeviceSize, offset: vk::DeviceSize) -> Result<()> {
        if self.is_coherent() {
            return Ok(());
        }
        assert!(self.mapping.is_some(), "cannot flush an unmapped buffer");
        let range = self.mapped_range(size, offset);
        unsafe { self.device.device.flush_mapped_memory_ranges(&[range]) }
            .map_err(GpuError::FlushFailed)?;
        Ok(())
    }

    /// Make device writes in the range visible to the host.
    ///
    /// No-op on HOST_COHERENT memory.
    pub fn invalidate(&self, size: vk::DeviceSize, offset: vk::DeviceSize) -> Result<()> {
        if self.is_coherent() {
            return Ok(());
        }
        assert!(self.mapping.is_some(), "cannot invalidate an unmapped buffer");
        let range = self.mapped_range(size, offset);
        unsafe { self.device.device.invalidate_mapped_memory_ranges(&[range]) }
            .map_err(GpuError::InvalidateFailed)?;
        Ok(())
    }

    pub fn flush_index(&self, index: u32) -> Result<()> {
        self.flush(self.alignment_size, self.index_offset(index))
    }

    pub fn invalidate_index(&self, index: u32) -> Result<()> {
        self.invalidate(self.alignment_size, self.index_offset(index))
    }

    // =========================================================================
    // DESCRIPTORS
    // =========================================================================

    pub fn descriptor_info(&self, size: vk::DeviceSize, offset: vk::DeviceSize) -> vk::DescriptorBufferInfo {
        vk::DescriptorBufferInfo {
            buffer: self.buffer,
            offset,
            range: size,
        }
    }

    pub fn descriptor_info_for_index(&self, index: u32) -> vk::DescriptorBufferInfo {
        self.descriptor_info(self.alignment_size, self.index_offset(index))
    }

    // =========================================================================
    // STAGING
    // =========================================================================

    /// Fill this buffer from `data` via a temporary host-visible buffer.
    ///
    /// Blocks until the copy has finished.
    pub fn upload_via_staging(&self, data: &[u8]) -> Result<()> {
        assert!(
            self.usage.contains(vk::BufferUsageFlags::TRANSFER_DST),
            "staging target needs TRANSFER_DST usage"
        );
        let size = data.len() as vk::DeviceSize;
        assert!(size <= self.buffer_size, "staged data larger than buffer");

        let mut staging = TransferBuffer::new(
            self.device.clone(),
            size,
            1,
            vk::BufferUsageFlags::TRANSFER_SRC,
            vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
            1,
        )
        .context("Failed to create staging buffer")?;

        staging.map(vk::WHOLE_SIZE, 0)?;
        staging.write_bytes(data, vk::WHOLE_SIZE, 0);
        staging.unmap();

        let region = vk::BufferCopy {
            src_offset: 0,
            dst_offset: 0,
            size,
        };
        self.device.copy_buffer(staging.buffer, self.buffer, region)
    }

    // =========================================================================
    // ACCESSORS
    // =========================================================================

    fn index_offset(&self, index: u32) -> vk::DeviceSize {
        element_offset(index, self.instance_count, self.alignment_size)
    }

    pub fn buffer(&self) -> vk::Buffer {
        self.buffer
    }

    pub fn buffer_size(&self) -> vk::DeviceSize {
        self.buffer_size
    }

    pub fn instance_count(&self) -> u32 {
        self.instance_count
    }

    pub fn instance_size(&self) -> vk::DeviceSize {
        self.instance_size
    }

    pub fn alignment_size(&self) -> vk::DeviceSize {
        self.alignment_size
    }

    pub fn usage(&self) -> vk::BufferUsageFlags {
        self.usage
    }

    pub fn memory_properties(&self) -> vk::MemoryPropertyFlags {
        self.memory_properties
    }
}

impl Drop for TransferBuffer {
    fn drop(&mut self) {
        self.unmap();
        unsafe {
            self.device.device.destroy_buffer(self.buffer, None);
            self.device.device.free_memory(self.memory, None);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stride_rounds_up_to_alignment() {
        assert_eq!(aligned_stride(64, 256), 256);
        assert_eq!(aligned_stride(256, 256), 256);
        assert_eq!(aligned_stride(257, 256), 512);
        assert_eq!(aligned_stride(12, 4), 12);
        assert_eq!(aligned_stride(13, 1), 13);
    }

    #[test]
    fn zero_alignment_keeps_size() {
        assert_eq!(aligned_stride(100, 0), 100);
    }

    #[test]
    fn stride_is_a_minimal_multiple() {
        for size in 1..=300u64 {
            for align in [1u64, 4, 16, 64, 256] {
                let stride = aligned_stride(size, align);
                assert!(stride >= size);
                assert_eq!(stride % align, 0);
                assert!(stride - size < align);
            }
        }
    }

    #[test]
    fn element_offsets_step_by_stride() {
        let stride = aligned_stride(80, 256);
        assert_eq!(element_offset(0, 3, stride), 0);
        assert_eq!(element_offset(1, 3, stride), 256);
        assert_eq!(element_offset(2, 3, stride), 512);
    }

    #[test]
    #[should_panic(expected = "element 3 out of range (3 elements)")]
    fn element_index_past_count_panics() {
        element_offset(3, 3, 64);
    }

    #[test]
    fn indexed_elements_round_trip_without_touching_neighbours() {
        let count = 3u32;
        for (size, align) in [(20u64, 64u64), (80, 256), (12, 4), (7, 1)] {
            let stride = aligned_stride(size, align);
            let mut backing = vec![0u8; (stride * count as u64) as usize];
            let at = |i: u32| element_offset(i, count, stride) as usize;

            for i in 0..count {
                copy_into(&mut backing, &vec![i as u8 + 1; size as usize], at(i));
            }
            // Rewrite the middle element
            copy_into(&mut backing, &vec![0xAB; size as usize], at(1));

            let read = |i: u32| backing[at(i)..at(i) + size as usize].to_vec();
            assert_eq!(read(0), vec![1; size as usize]);
            assert_eq!(read(1), vec![0xAB; size as usize]);
            assert_eq!(read(2), vec![3; size as usize]);
            // Padding between elements stays zero
            assert!(backing[size as usize..at(1)].iter().all(|&b| b == 0));
        }
    }

    #[test]
    #[should_panic(expected = "overruns mapping")]
    fn writes_past_the_mapping_panic() {
        let mut backing = vec![0u8; 16];
        copy_into(&mut backing, &[1; 8], 12);
    }

    #[test]
    fn whole_size_maps_the_rest_of_the_buffer() {
        assert_eq!(mapped_len(vk::WHOLE_SIZE, 0, 512), 512);
        assert_eq!(mapped_len(vk::WHOLE_SIZE, 256, 512), 256);
        assert_eq!(mapped_len(vk::WHOLE_SIZE, 512, 512), 0);
        assert_eq!(mapped_len(64, 128, 512), 64);
    }

    #[test]
    #[should_panic(expected = "past the end")]
    fn map_offset_beyond_buffer_panics() {
        mapped_len(vk::WHOLE_SIZE, 600, 512);
    }

    #[test]
    #[should_panic(expected = "overruns")]
    fn map_range_beyond_buffer_panics() {
        mapped_len(128, 448, 512);
    }

    #[test]
    fn flush_ranges_expand_to_atoms() {
        assert_eq!(atom_aligned_range(70, 10, 64, 1024), (64, 64));
        assert_eq!(atom_aligned_range(128, 64, 64, 1024), (128, 64));
        assert_eq!(atom_aligned_range(0, 1, 1, 1024), (0, 1));
    }

    #[test]
    fn flush_ranges_reaching_the_end_use_whole_size() {
        assert_eq!(atom_aligned_range(960, 60, 64, 1000), (960, vk::WHOLE_SIZE));
        assert_eq!(atom_aligned_range(100, vk::WHOLE_SIZE, 64, 1000), (64, vk::WHOLE_SIZE));
    }
}
