use crate::{
    AccelerationStructure, AccelerationStructureDesc, AccelerationStructureReference, Allocation,
    Buffer, BufferDesc, BufferPiece, CommandEncoder, CommandEncoderDesc, DescriptorSet,
    DescriptorWrite, DeviceError, Memory, MemoryRequirements, MemoryRequirementsKind, SyncPoint,
};

/// Hands out buffers and raw memory blocks. Callable from any thread.
pub trait MemoryManager: Send + Sync {
    fn get_buffer(&self, desc: BufferDesc) -> Result<Buffer, DeviceError>;
    fn release_buffer(&self, buffer: Buffer);
    fn get_memory(
        &self,
        name: &str,
        requirements: MemoryRequirements,
        memory: Memory,
    ) -> Result<Allocation, DeviceError>;
    fn release_memory(&self, allocation: Allocation);
    /// Make host writes into a mapped range visible to the device.
    fn flush_buffer(&self, piece: BufferPiece, size: u64);
}

pub trait AccelerationStructureDevice: Send + Sync {
    fn create_acceleration_structure(
        &self,
        desc: &AccelerationStructureDesc,
    ) -> Result<AccelerationStructure, DeviceError>;
    fn destroy_acceleration_structure(&self, acceleration_structure: AccelerationStructure);
    fn get_acceleration_structure_memory_requirements(
        &self,
        acceleration_structure: AccelerationStructure,
        kind: MemoryRequirementsKind,
    ) -> MemoryRequirements;
    fn bind_acceleration_structure_memory(
        &self,
        acceleration_structure: AccelerationStructure,
        allocation: &Allocation,
    ) -> Result<(), DeviceError>;
    fn get_acceleration_structure_reference(
        &self,
        acceleration_structure: AccelerationStructure,
    ) -> AccelerationStructureReference;
}

pub trait DescriptorDevice: Send + Sync {
    fn create_descriptor_set(&self, name: &str) -> Result<DescriptorSet, DeviceError>;
    fn destroy_descriptor_set(&self, set: DescriptorSet);
    fn update_descriptor_sets(&self, writes: &[DescriptorWrite]);
}

pub trait CommandDevice: Send + Sync {
    fn create_command_encoder(&self, desc: CommandEncoderDesc) -> CommandEncoder {
        CommandEncoder::new(desc)
    }
    fn submit(&self, encoder: &mut CommandEncoder) -> Result<SyncPoint, DeviceError>;
    fn wait_for(&self, sp: &SyncPoint, timeout_ms: u32) -> bool;
}

/// Everything the acceleration structure code needs from a GPU.
pub trait Device:
    MemoryManager + AccelerationStructureDevice + DescriptorDevice + CommandDevice
{
}

impl<T> Device for T where
    T: MemoryManager + AccelerationStructureDevice + DescriptorDevice + CommandDevice
{
}
