//! Executable images: where they come from and how they are validated.
//!
//! Two formats are loaded. A flat binary is copied to
//! [`USER_CODE_BASE`](kernel_info::memory::USER_CODE_BASE) and entered at its
//! first byte. A static ELF64 executable (`ET_EXEC`) has its `PT_LOAD`
//! segments copied to their link addresses. Images that need a dynamic
//! loader (`ET_DYN`, `PT_INTERP`) are refused with
//! [`ExecError::DynamicUnsupported`].

use crate::ProcessError;
use bitfield_struct::bitfield;
use kernel_memory_addresses::{PhysicalAddress, VirtualAddress};
use kernel_vmem::{TemporaryWindow, WindowBackend};

/// Why an executable image was rejected.
#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum ExecError {
    #[error("image is shorter than its headers")]
    TooShort,
    #[error("not an ELF image")]
    BadMagic,
    #[error("not a 64-bit ELF image")]
    BadClass,
    #[error("not a little-endian ELF image")]
    BadEndianness,
    #[error("unsupported ELF version")]
    BadVersion,
    #[error("machine type {0:#x} is not x86-64")]
    BadMachine(u16),
    #[error("ELF type {0} is not an executable")]
    BadType(u16),
    #[error("image needs a dynamic loader")]
    DynamicUnsupported,
    #[error("malformed program header")]
    BadProgramHeader,
    #[error("image data out of bounds")]
    OutOfBounds,
    #[error("image has nothing to load")]
    Empty,
}

const ET_EXEC: u16 = 2;
const ET_DYN: u16 = 3;
const EM_X86_64: u16 = 62;
pub(crate) const PT_LOAD: u32 = 1;
pub(crate) const PT_INTERP: u32 = 3;

/// Size of the ELF64 file header.
pub const ELF_HEADER_SIZE: usize = 64;

/// Size of an ELF64 program header.
pub const PROGRAM_HEADER_SIZE: usize = 56;

#[inline]
fn le16(x: &[u8]) -> u16 {
    u16::from_le_bytes([x[0], x[1]])
}

#[inline]
fn le32(x: &[u8]) -> u32 {
    u32::from_le_bytes([x[0], x[1], x[2], x[3]])
}

#[inline]
fn le64(x: &[u8]) -> u64 {
    u64::from_le_bytes([x[0], x[1], x[2], x[3], x[4], x[5], x[6], x[7]])
}

/// The fields of the ELF64 file header the loader uses.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct ElfHeader {
    pub entry: VirtualAddress,
    pub phoff: u64,
    pub phentsize: u16,
    pub phnum: u16,
}

impl ElfHeader {
    /// Validate and decode a file header.
    ///
    /// # Errors
    /// The first check that fails, in the order magic, class, byte order,
    /// version, machine, type.
    pub fn parse(bytes: &[u8]) -> Result<Self, ExecError> {
        use ExecError::{BadClass, BadEndianness, BadMachine, BadMagic, BadProgramHeader, BadType, BadVersion, TooShort};
        if bytes.len() < ELF_HEADER_SIZE {
            return Err(TooShort);
        }
        if &bytes[0..4] != b"\x7FELF" {
            return Err(BadMagic);
        }
        // ELFCLASS64
        if bytes[4] != 2 {
            return Err(BadClass);
        }
        // ELFDATA2LSB
        if bytes[5] != 1 {
            return Err(BadEndianness);
        }
        if bytes[6] != 1 || le32(&bytes[20..24]) != 1 {
            return Err(BadVersion);
        }
        let machine = le16(&bytes[18..20]);
        if machine != EM_X86_64 {
            return Err(BadMachine(machine));
        }
        match le16(&bytes[16..18]) {
            ET_EXEC => {}
            ET_DYN => return Err(ExecError::DynamicUnsupported),
            other => return Err(BadType(other)),
        }

        let header = Self {
            entry: VirtualAddress::canonical(le64(&bytes[24..32])),
            phoff: le64(&bytes[32..40]),
            phentsize: le16(&bytes[54..56]),
            phnum: le16(&bytes[56..58]),
        };
        if usize::from(header.phentsize) != PROGRAM_HEADER_SIZE {
            return Err(BadProgramHeader);
        }
        Ok(header)
    }

    /// File offset of program header `index`.
    #[must_use]
    pub fn program_header_offset(&self, index: u16) -> u64 {
        self.phoff + u64::from(index) * u64::from(self.phentsize)
    }
}

/// `Elf64_Phdr.p_flags` (SVr4): bit0=X, bit1=W, bit2=R.
#[bitfield(u32)]
#[derive(PartialEq, Eq)]
pub struct SegmentFlags {
    pub execute: bool,
    pub write: bool,
    pub read: bool,
    #[bits(29)]
    __: u32,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct ProgramHeader {
    pub kind: u32,
    pub flags: SegmentFlags,
    pub offset: u64,
    pub vaddr: u64,
    pub filesz: u64,
    pub memsz: u64,
}

impl ProgramHeader {
    /// # Errors
    /// [`ExecError::TooShort`] for less than one program header of input.
    pub fn parse(bytes: &[u8]) -> Result<Self, ExecError> {
        let s = bytes.get(..PROGRAM_HEADER_SIZE).ok_or(ExecError::TooShort)?;
        Ok(Self {
            kind: le32(&s[0..4]),
            flags: SegmentFlags::from_bits(le32(&s[4..8])),
            offset: le64(&s[8..16]),
            vaddr: le64(&s[16..24]),
            filesz: le64(&s[32..40]),
            memsz: le64(&s[40..48]),
        })
    }

    #[must_use]
    pub const fn is_load(&self) -> bool {
        self.kind == PT_LOAD
    }

    /// Check a `PT_LOAD` segment against the image length and the lower half.
    ///
    /// # Errors
    /// [`ExecError::BadProgramHeader`] or [`ExecError::OutOfBounds`].
    pub fn validate_load(&self, image_len: u64) -> Result<(), ExecError> {
        if self.filesz > self.memsz {
            return Err(ExecError::BadProgramHeader);
        }
        if self.offset.checked_add(self.filesz).is_none_or(|end| end > image_len) {
            return Err(ExecError::OutOfBounds);
        }
        if self
            .vaddr
            .checked_add(self.memsz)
            .is_none_or(|end| end > VirtualAddress::LOWER_HALF_END)
        {
            return Err(ExecError::OutOfBounds);
        }
        Ok(())
    }
}

/// Format of an executable image.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ExecutableKind {
    Elf,
    Binary,
}

impl ExecutableKind {
    /// ELF if the image starts with the ELF magic, flat binary otherwise.
    #[must_use]
    pub fn detect(prefix: &[u8]) -> Self {
        if prefix.starts_with(b"\x7FELF") {
            Self::Elf
        } else {
            Self::Binary
        }
    }
}

/// Where the bytes of an executable image live.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ImageSource<'a> {
    /// Placed in physical memory by the boot loader.
    Physical { base: PhysicalAddress, size: u64 },
    /// Already readable, for example read from a filesystem.
    Bytes(&'a [u8]),
}

impl ImageSource<'_> {
    #[must_use]
    pub const fn len(&self) -> u64 {
        match self {
            Self::Physical { size, .. } => *size,
            Self::Bytes(bytes) => bytes.len() as u64,
        }
    }

    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Copy image bytes from `offset` into `buf`.
    ///
    /// # Errors
    /// [`ExecError::OutOfBounds`] past the image end, or a window error.
    #[allow(clippy::cast_possible_truncation)]
    pub fn read<B: WindowBackend>(
        &self,
        window: &TemporaryWindow<B>,
        offset: u64,
        buf: &mut [u8],
    ) -> Result<(), ProcessError> {
        let end = offset
            .checked_add(buf.len() as u64)
            .filter(|&end| end <= self.len())
            .ok_or(ExecError::OutOfBounds)?;
        match self {
            Self::Physical { base, .. } => window.read_physical(*base + offset, buf)?,
            Self::Bytes(bytes) => buf.copy_from_slice(&bytes[offset as usize..end as usize]),
        }
        Ok(())
    }

    /// Detect the format from the first bytes.
    ///
    /// # Errors
    /// A window error while reading physical memory.
    pub fn kind<B: WindowBackend>(&self, window: &TemporaryWindow<B>) -> Result<ExecutableKind, ProcessError> {
        let mut magic = [0u8; 4];
        if self.len() < magic.len() as u64 {
            return Ok(ExecutableKind::Binary);
        }
        self.read(window, 0, &mut magic)?;
        Ok(ExecutableKind::detect(&magic))
    }
}

/// Looks up executables by path.
pub trait ExecutableSource {
    fn open(&self, path: &str) -> Option<ImageSource<'_>>;
}

/// Whole-file reads from a filesystem.
pub trait ReadFile {
    fn read(&self, path: &str) -> Option<&[u8]>;
}

/// Serves executables from a [`ReadFile`] filesystem.
pub struct FsExecutables<R>(pub R);

impl<R: ReadFile> ExecutableSource for FsExecutables<R> {
    fn open(&self, path: &str) -> Option<ImageSource<'_>> {
        self.0.read(path).map(ImageSource::Bytes)
    }
}

/// Everything needed to build a process from an image.
#[derive(Debug, Copy, Clone)]
pub struct ProcessDescriptor<'a> {
    pub image: ImageSource<'a>,
    pub kind: ExecutableKind,
    /// Program name followed by its arguments.
    pub command_line: &'a str,
}

impl<'a> ProcessDescriptor<'a> {
    #[must_use]
    pub const fn new(image: ImageSource<'a>, kind: ExecutableKind, command_line: &'a str) -> Self {
        Self {
            image,
            kind,
            command_line,
        }
    }

    /// Resolve the program (the first word of `command_line`) through
    /// `source` and detect its format.
    ///
    /// # Errors
    /// [`ProcessError::ExecutableNotFound`], or a window error while reading
    /// the image.
    pub fn open<S, B>(source: &'a S, window: &TemporaryWindow<B>, command_line: &'a str) -> Result<Self, ProcessError>
    where
        S: ExecutableSource + ?Sized,
        B: WindowBackend,
    {
        let path = command_line.split_whitespace().next().unwrap_or_default();
        let image = source.open(path).ok_or(ProcessError::ExecutableNotFound)?;
        let kind = image.kind(window)?;
        Ok(Self::new(image, kind, command_line))
    }
}
