// GPU buffers for vertex, index, uniform, indirect and staging data
//
// Buffers own a dedicated VkDeviceMemory picked by an explicit memory-type
// scan, so host-visible/coherent requirements are honoured exactly.

use anyhow::{bail, ensure, Context, Result};
use ash::vk;
use std::ptr::NonNull;
use std::sync::Arc;

use super::command::ImmediateSubmitter;
use super::GraphicsContext;

/// Find the lowest memory type allowed by `type_bits` whose flags contain `required`.
pub fn find_memory_type(
    memory_properties: &vk::PhysicalDeviceMemoryProperties,
    type_bits: u32,
    required: vk::MemoryPropertyFlags,
) -> Option<u32> {
    (0..memory_properties.memory_type_count).find(|&i| {
        let allowed = type_bits & (1 << i) != 0;
        allowed
            && memory_properties.memory_types[i as usize]
                .property_flags
                .contains(required)
    })
}

/// A buffer with its own memory allocation.
///
/// Destroyed on drop; never shared or reference counted.
pub struct GpuBuffer {
    pub buffer: vk::Buffer,
    pub size: vk::DeviceSize,
    pub usage: vk::BufferUsageFlags,
    memory: vk::DeviceMemory,
    memory_flags: vk::MemoryPropertyFlags,
    allocation_size: vk::DeviceSize,
    mapped: Option<NonNull<u8>>,
    ctx: Arc<GraphicsContext>,
}

impl GpuBuffer {
    /// Create a buffer, optionally filled with `initial_data`.
    ///
    /// Initial data requires host-visible memory; the write is flushed when the
    /// chosen memory type is not host-coherent.
    pub fn new(
        ctx: &Arc<GraphicsContext>,
        usage: vk::BufferUsageFlags,
        memory_properties: vk::MemoryPropertyFlags,
        size: vk::DeviceSize,
        initial_data: Option<&[u8]>,
    ) -> Result<Self> {
        ensure!(size > 0, "Cannot create an empty buffer");

        let needs_address = usage.contains(vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS);
        if needs_address && !ctx.features.buffer_device_address {
            bail!("{} does not support buffer device addresses", ctx.device_name());
        }

        let buffer_info = vk::BufferCreateInfo::default()
            .size(size)
            .usage(usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);

        let buffer = unsafe { ctx.device.create_buffer(&buffer_info, None) }
            .context("Failed to create buffer")?;

        let requirements = unsafe { ctx.device.get_buffer_memory_requirements(buffer) };

        let Some(memory_type_index) = find_memory_type(
            &ctx.memory_properties,
            requirements.memory_type_bits,
            memory_properties,
        ) else {
            unsafe { ctx.device.destroy_buffer(buffer, None) };
            bail!(
                "No memory type satisfies {:?} (allowed type bits {:#b})",
                memory_properties,
                requirements.memory_type_bits
            );
        };
        let memory_flags =
            ctx.memory_properties.memory_types[memory_type_index as usize].property_flags;

        let mut flags_info =
            vk::MemoryAllocateFlagsInfo::default().flags(vk::MemoryAllocateFlags::DEVICE_ADDRESS);
        let mut alloc_info = vk::MemoryAllocateInfo::default()
            .allocation_size(requirements.size)
            .memory_type_index(memory_type_index);
        if needs_address {
            alloc_info = alloc_info.push_next(&mut flags_info);
        }

        let memory = match unsafe { ctx.device.allocate_memory(&alloc_info, None) } {
            Ok(memory) => memory,
            Err(e) => {
                unsafe { ctx.device.destroy_buffer(buffer, None) };
                return Err(e).context("Failed to allocate buffer memory");
            }
        };

        if let Err(e) = unsafe { ctx.device.bind_buffer_memory(buffer, memory, 0) } {
            unsafe {
                ctx.device.destroy_buffer(buffer, None);
                ctx.device.free_memory(memory, None);
            }
            return Err(e).context("Failed to bind buffer memory");
        }

        let gpu_buffer = Self {
            buffer,
            size,
            usage,
            memory,
            memory_flags,
            allocation_size: requirements.size,
            mapped: None,
            ctx: ctx.clone(),
        };

        if let Some(data) = initial_data {
            gpu_buffer.upload_unmapped(data)?;
        }

        Ok(gpu_buffer)
    }

    /// Create a host-visible buffer that stays mapped for its whole lifetime.
    pub fn new_mapped(
        ctx: &Arc<GraphicsContext>,
        usage: vk::BufferUsageFlags,
        size: vk::DeviceSize,
    ) -> Result<Self> {
        let mut buffer = Self::new(
            ctx,
            usage,
            vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
            size,
            None,
        )?;

        let ptr = unsafe {
            ctx.device
                .map_memory(buffer.memory, 0, vk::WHOLE_SIZE, vk::MemoryMapFlags::empty())
        }
        .context("Failed to map buffer memory")?;
        buffer.mapped = NonNull::new(ptr.cast::<u8>());

        Ok(buffer)
    }

    /// Host-visible buffer holding `data`, used as a copy source.
    pub fn staging(ctx: &Arc<GraphicsContext>, data: &[u8]) -> Result<Self> {
        Self::new(
            ctx,
            vk::BufferUsageFlags::TRANSFER_SRC | vk::BufferUsageFlags::TRANSFER_DST,
            vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
            data.len() as vk::DeviceSize,
            Some(data),
        )
    }

    pub fn is_host_visible(&self) -> bool {
        self.memory_flags
            .contains(vk::MemoryPropertyFlags::HOST_VISIBLE)
    }

    pub fn is_coherent(&self) -> bool {
        self.memory_flags
            .contains(vk::MemoryPropertyFlags::HOST_COHERENT)
    }

    /// Copy bytes into a persistently mapped buffer.
    pub fn write(&self, offset: vk::DeviceSize, data: &[u8]) -> Result<()> {
        let ptr = self
            .mapped
            .context("write() requires a persistently mapped buffer")?;
        ensure!(
            offset + data.len() as vk::DeviceSize <= self.size,
            "Write of {} bytes at {} overruns buffer of {} bytes",
            data.len(),
            offset,
            self.size
        );

        unsafe {
            std::ptr::copy_nonoverlapping(
                data.as_ptr(),
                ptr.as_ptr().add(offset as usize),
                data.len(),
            );
        }
        self.flush(offset, data.len() as vk::DeviceSize)
    }

    /// Read the whole buffer back; the memory must be host-visible.
    pub fn read(&self) -> Result<Vec<u8>> {
        ensure!(self.is_host_visible(), "Cannot read device-local memory directly");

        let mut out = vec![0u8; self.size as usize];
        self.with_mapping(|ptr| {
            if !self.is_coherent() {
                let range = self.aligned_range(0, self.size);
                unsafe { self.ctx.device.invalidate_mapped_memory_ranges(&[range]) }
                    .context("Failed to invalidate mapped range")?;
            }
            unsafe { std::ptr::copy_nonoverlapping(ptr, out.as_mut_ptr(), out.len()) };
            Ok(())
        })?;
        Ok(out)
    }

    /// GPU virtual address; the buffer must have been created with SHADER_DEVICE_ADDRESS.
    pub fn device_address(&self) -> Result<vk::DeviceAddress> {
        ensure!(
            self.usage.contains(vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS),
            "Buffer was not created with SHADER_DEVICE_ADDRESS usage"
        );
        let info = vk::BufferDeviceAddressInfo::default().buffer(self.buffer);
        Ok(unsafe { self.ctx.device.get_buffer_device_address(&info) })
    }

    fn upload_unmapped(&self, data: &[u8]) -> Result<()> {
        ensure!(
            self.is_host_visible(),
            "Initial data requires host-visible memory"
        );
        ensure!(
            data.len() as vk::DeviceSize <= self.size,
            "Initial data of {} bytes overruns buffer of {} bytes",
            data.len(),
            self.size
        );

        self.with_mapping(|ptr| {
            unsafe { std::ptr::copy_nonoverlapping(data.as_ptr(), ptr, data.len()) };
            self.flush(0, data.len() as vk::DeviceSize)
        })
    }

    fn with_mapping<R>(&self, f: impl FnOnce(*mut u8) -> Result<R>) -> Result<R> {
        if let Some(ptr) = self.mapped {
            return f(ptr.as_ptr());
        }

        let ptr = unsafe {
            self.ctx
                .device
                .map_memory(self.memory, 0, vk::WHOLE_SIZE, vk::MemoryMapFlags::empty())
        }
        .context("Failed to map buffer memory")?;
        let result = f(ptr.cast::<u8>());
        unsafe { self.ctx.device.unmap_memory(self.memory) };
        result
    }

    fn flush(&self, offset: vk::DeviceSize, len: vk::DeviceSize) -> Result<()> {
        if self.is_coherent() || len == 0 {
            return Ok(());
        }
        let range = self.aligned_range(offset, len);
        unsafe { self.ctx.device.flush_mapped_memory_ranges(&[range]) }
            .context("Failed to flush mapped range")?;
        Ok(())
    }

    fn aligned_range(&self, offset: vk::DeviceSize, len: vk::DeviceSize) -> vk::MappedMemoryRange<'static> {
        let atom = self.ctx.properties.limits.non_coherent_atom_size;
        let (offset, size) = align_to_atom(offset, len, atom, self.allocation_size);
        vk::MappedMemoryRange::default()
            .memory(self.memory)
            .offset(offset)
            .size(size)
    }
}

/// Expand `[offset, offset + len)` to `atom` boundaries; runs to the end of
/// the allocation become WHOLE_SIZE.
pub fn align_to_atom(
    offset: vk::DeviceSize,
    len: vk::DeviceSize,
    atom: vk::DeviceSize,
    allocation_size: vk::DeviceSize,
) -> (vk::DeviceSize, vk::DeviceSize) {
    let atom = atom.max(1);
    let start = offset / atom * atom;
    let end = (offset + len).div_ceil(atom) * atom;
    if end >= allocation_size {
        (start, vk::WHOLE_SIZE)
    } else {
        (start, end - start)
    }
}

impl Drop for GpuBuffer {
    fn drop(&mut self) {
        unsafe {
            if self.mapped.take().is_some() {
                self.ctx.device.unmap_memory(self.memory);
            }
            self.ctx.device.destroy_buffer(self.buffer, None);
            self.ctx.device.free_memory(self.memory, None);
        }
    }
}

/// Upload `data` into a new device-local buffer through a staging copy.
pub fn upload_device_local(
    ctx: &Arc<GraphicsContext>,
    submitter: &ImmediateSubmitter,
    usage: vk::BufferUsageFlags,
    data: &[u8],
) -> Result<GpuBuffer> {
    let staging = GpuBuffer::staging(ctx, data)?;
    let buffer = GpuBuffer::new(
        ctx,
        usage | vk::BufferUsageFlags::TRANSFER_DST | vk::BufferUsageFlags::TRANSFER_SRC,
        vk::MemoryPropertyFlags::DEVICE_LOCAL,
        data.len() as vk::DeviceSize,
        None,
    )?;

    submitter.submit(|device, cmd| {
        let region = vk::BufferCopy {
            src_offset: 0,
            dst_offset: 0,
            size: data.len() as vk::DeviceSize,
        };
        unsafe { device.cmd_copy_buffer(cmd, staging.buffer, buffer.buffer, &[region]) };
    })?;

    Ok(buffer)
}

/// Debug copy-back of any buffer created with TRANSFER_SRC usage.
pub fn read_back_buffer(
    ctx: &Arc<GraphicsContext>,
    submitter: &ImmediateSubmitter,
    source: &GpuBuffer,
) -> Result<Vec<u8>> {
    ensure!(
        source.usage.contains(vk::BufferUsageFlags::TRANSFER_SRC),
        "Read-back requires TRANSFER_SRC usage"
    );

    let staging = GpuBuffer::new(
        ctx,
        vk::BufferUsageFlags::TRANSFER_DST,
        vk::MemoryPropertyFlags::HOST_VISIBLE,
        source.size,
        None,
    )?;

    submitter.submit(|device, cmd| {
        let region = vk::BufferCopy {
            src_offset: 0,
            dst_offset: 0,
            size: source.size,
        };
        unsafe { device.cmd_copy_buffer(cmd, source.buffer, staging.buffer, &[region]) };
    })?;

    staging.read()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn memory_properties(types: &[vk::MemoryPropertyFlags]) -> vk::PhysicalDeviceMemoryProperties {
        let mut props = vk::PhysicalDeviceMemoryProperties {
            memory_type_count: types.len() as u32,
            ..Default::default()
        };
        for (i, &flags) in types.iter().enumerate() {
            props.memory_types[i] = vk::MemoryType {
                property_flags: flags,
                heap_index: 0,
            };
        }
        props
    }

    const DEVICE: vk::MemoryPropertyFlags = vk::MemoryPropertyFlags::DEVICE_LOCAL;
    const HOST: vk::MemoryPropertyFlags = vk::MemoryPropertyFlags::from_raw(
        vk::MemoryPropertyFlags::HOST_VISIBLE.as_raw()
            | vk::MemoryPropertyFlags::HOST_COHERENT.as_raw(),
    );

    #[test]
    fn picks_lowest_sufficient_type() {
        let props = memory_properties(&[DEVICE, HOST, HOST | vk::MemoryPropertyFlags::HOST_CACHED]);
        assert_eq!(find_memory_type(&props, 0b111, HOST), Some(1));
        assert_eq!(find_memory_type(&props, 0b111, DEVICE), Some(0));
    }

    #[test]
    fn respects_type_bits() {
        let props = memory_properties(&[HOST, HOST | vk::MemoryPropertyFlags::HOST_CACHED]);
        assert_eq!(find_memory_type(&props, 0b10, HOST), Some(1));
        assert_eq!(find_memory_type(&props, 0b00, HOST), None);
    }

    #[test]
    fn selected_type_is_superset_of_request() {
        let types = [
            DEVICE,
            vk::MemoryPropertyFlags::HOST_VISIBLE,
            HOST,
            DEVICE | HOST,
        ];
        let props = memory_properties(&types);
        let requests = [
            DEVICE,
            vk::MemoryPropertyFlags::HOST_VISIBLE,
            HOST,
            DEVICE | vk::MemoryPropertyFlags::HOST_VISIBLE,
        ];
        for type_bits in 0u32..16 {
            for &request in &requests {
                let expected = (0..types.len() as u32)
                    .find(|&i| type_bits & (1 << i) != 0 && types[i as usize].contains(request));
                let found = find_memory_type(&props, type_bits, request);
                assert_eq!(found, expected, "bits {type_bits:#b} request {request:?}");
                if let Some(i) = found {
                    assert!(types[i as usize].contains(request));
                }
            }
        }
    }

    #[test]
    fn missing_memory_type_yields_none() {
        let props = memory_properties(&[HOST]);
        assert_eq!(find_memory_type(&props, 0b1, DEVICE), None);
    }

    #[test]
    fn flush_ranges_align_to_atom() {
        assert_eq!(align_to_atom(10, 20, 64, 1024), (0, 64));
        assert_eq!(align_to_atom(70, 100, 64, 1024), (64, 128));
        assert_eq!(align_to_atom(0, 1000, 64, 1024), (0, vk::WHOLE_SIZE));
        assert_eq!(align_to_atom(3, 4, 0, 1024), (3, 4));
    }
}
