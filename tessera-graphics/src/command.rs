use crate::{
    AccelerationStructure, AccelerationStructureFlags, AccelerationStructureMesh,
    AccelerationStructureType, Barrier, BufferPiece,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BuildMode {
    /// Build from scratch into the destination.
    Build,
    /// Refit the destination in place, using itself as the source.
    Update,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AccelerationStructureCopyMode {
    Clone,
    Compact,
}

#[derive(Clone, Debug)]
pub enum Command {
    CopyBufferToBuffer {
        src: BufferPiece,
        dst: BufferPiece,
        size: u64,
    },
    Barrier(Barrier),
    BuildAccelerationStructure {
        ty: AccelerationStructureType,
        flags: AccelerationStructureFlags,
        dst: AccelerationStructure,
        src: Option<AccelerationStructure>,
        meshes: Vec<AccelerationStructureMesh>,
        instance_data: Option<BufferPiece>,
        instance_count: u32,
        scratch: BufferPiece,
    },
    CopyAccelerationStructure {
        src: AccelerationStructure,
        dst: AccelerationStructure,
        mode: AccelerationStructureCopyMode,
    },
}

/// Records commands for later submission.
///
/// The encoder is backend-agnostic: it keeps a plain list of commands,
/// and the device translates them at submission time.
#[derive(Debug)]
pub struct CommandEncoder {
    name: String,
    commands: Vec<Command>,
    is_recording: bool,
}

impl CommandEncoder {
    pub fn new(desc: super::CommandEncoderDesc) -> Self {
        Self {
            name: desc.name.to_string(),
            commands: Vec::new(),
            is_recording: false,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Begin a new recording, discarding whatever was there before.
    pub fn start(&mut self) {
        self.commands.clear();
        self.is_recording = true;
    }

    pub fn finish(&mut self) {
        self.is_recording = false;
    }

    pub fn is_recording(&self) -> bool {
        self.is_recording
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    pub fn commands(&self) -> &[Command] {
        &self.commands
    }

    /// Hand the recorded list over to the backend.
    pub fn take_commands(&mut self) -> Vec<Command> {
        self.is_recording = false;
        std::mem::take(&mut self.commands)
    }

    fn push(&mut self, command: Command) {
        debug_assert!(
            self.is_recording,
            "Encoder '{}' is not recording",
            self.name
        );
        self.commands.push(command);
    }

    pub fn barrier(&mut self, barrier: Barrier) {
        self.push(Command::Barrier(barrier));
    }

    pub fn transfer(&mut self) -> TransferCommandEncoder {
        TransferCommandEncoder { encoder: self }
    }

    pub fn acceleration_structure(&mut self) -> AccelerationStructureCommandEncoder {
        AccelerationStructureCommandEncoder { encoder: self }
    }
}

pub struct TransferCommandEncoder<'a> {
    encoder: &'a mut CommandEncoder,
}

impl TransferCommandEncoder<'_> {
    pub fn copy_buffer_to_buffer(&mut self, src: BufferPiece, dst: BufferPiece, size: u64) {
        self.encoder
            .push(Command::CopyBufferToBuffer { src, dst, size });
    }
}

pub struct AccelerationStructureCommandEncoder<'a> {
    encoder: &'a mut CommandEncoder,
}

impl AccelerationStructureCommandEncoder<'_> {
    pub fn build_bottom_level(
        &mut self,
        acceleration_structure: AccelerationStructure,
        flags: AccelerationStructureFlags,
        meshes: &[AccelerationStructureMesh],
        mode: BuildMode,
        scratch_data: BufferPiece,
    ) {
        self.encoder.push(Command::BuildAccelerationStructure {
            ty: AccelerationStructureType::BottomLevel,
            flags,
            dst: acceleration_structure,
            src: match mode {
                BuildMode::Build => None,
                BuildMode::Update => Some(acceleration_structure),
            },
            meshes: meshes.to_vec(),
            instance_data: None,
            instance_count: 0,
            scratch: scratch_data,
        });
    }

    pub fn build_top_level(
        &mut self,
        acceleration_structure: AccelerationStructure,
        flags: AccelerationStructureFlags,
        instance_count: u32,
        instance_data: BufferPiece,
        mode: BuildMode,
        scratch_data: BufferPiece,
    ) {
        self.encoder.push(Command::BuildAccelerationStructure {
            ty: AccelerationStructureType::TopLevel,
            flags,
            dst: acceleration_structure,
            src: match mode {
                BuildMode::Build => None,
                BuildMode::Update => Some(acceleration_structure),
            },
            meshes: Vec::new(),
            instance_data: Some(instance_data),
            instance_count,
            scratch: scratch_data,
        });
    }

    pub fn copy(
        &mut self,
        src: AccelerationStructure,
        dst: AccelerationStructure,
        mode: AccelerationStructureCopyMode,
    ) {
        self.encoder
            .push(Command::CopyAccelerationStructure { src, dst, mode });
    }
}
