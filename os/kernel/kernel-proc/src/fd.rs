use crate::ProcessError;
use kernel_info::memory::MAX_FILE_DESCRIPTORS;

/// Opaque handle of an open file, owned by the filesystem layer.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub struct FileHandle(pub u64);

/// Per-process file descriptor slots.
///
/// The table is plain data; replacement and clone copy it as is.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct FdTable {
    slots: [Option<FileHandle>; MAX_FILE_DESCRIPTORS],
}

impl Default for FdTable {
    fn default() -> Self {
        Self::new()
    }
}

impl FdTable {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            slots: [None; MAX_FILE_DESCRIPTORS],
        }
    }

    /// Put `handle` into the lowest free slot and return its descriptor.
    ///
    /// # Errors
    /// [`ProcessError::TooManyFiles`] if every slot is taken.
    pub fn install(&mut self, handle: FileHandle) -> Result<usize, ProcessError> {
        let fd = self
            .slots
            .iter()
            .position(Option::is_none)
            .ok_or(ProcessError::TooManyFiles)?;
        self.slots[fd] = Some(handle);
        Ok(fd)
    }

    /// Free `fd`, returning what it held.
    pub fn close(&mut self, fd: usize) -> Option<FileHandle> {
        self.slots.get_mut(fd)?.take()
    }

    #[must_use]
    pub fn get(&self, fd: usize) -> Option<FileHandle> {
        self.slots.get(fd).copied().flatten()
    }

    /// Number of open descriptors.
    #[must_use]
    pub fn open_count(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }
}
