use crate::ProcessError;
use crate::args::{build_argument_block, split_command_line};
use crate::cpu::CpuState;
use crate::exec::{
    ELF_HEADER_SIZE, ElfHeader, ExecError, ExecutableKind, ImageSource, PROGRAM_HEADER_SIZE, PT_INTERP, PT_LOAD,
    ProcessDescriptor, ProgramHeader,
};
use crate::process::{ClaimKind, Pid, Process, ProcessLayout, ProcessState, SegmentClaim};
use alloc::vec::Vec;
use kernel_info::config::KernelConfig;
use kernel_info::memory::{
    PROCESS_HEAP_ALIGNMENT, PROCESS_HEAP_MAX_SIZE, PROCESS_KERNEL_STACK_TOP, USER_CODE_BASE, USER_STACK_TOP,
};
use kernel_memory_addresses::{FRAME_SIZE, PhysicalAddress, VirtualAddress, align_down, align_up, frames_for};
use kernel_vmem::{FrameAlloc, MapError, PageAccess, PagingEngine, Privilege, WindowBackend, WindowError};
use log::{debug, trace, warn};

/// Where [`ProcessManager::map_anonymous`] puts a mapping.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Placement {
    /// Exactly here; fails if any page is taken.
    Fixed(VirtualAddress),
    /// The first free range at or above this address.
    Hint(VirtualAddress),
}

/// Initial content of freshly claimed frames.
#[derive(Copy, Clone)]
enum Fill {
    Zero,
    CopyFrom(PhysicalAddress),
}

/// Builds and tears down process address spaces.
pub struct ProcessManager<'a, B: WindowBackend, F: FrameAlloc + ?Sized> {
    paging: PagingEngine<'a, B, F>,
    config: KernelConfig,
}

impl<'a, B: WindowBackend, F: FrameAlloc + ?Sized> ProcessManager<'a, B, F> {
    pub const fn new(paging: PagingEngine<'a, B, F>, config: KernelConfig) -> Self {
        Self { paging, config }
    }

    #[must_use]
    pub const fn paging(&self) -> PagingEngine<'a, B, F> {
        self.paging
    }

    #[must_use]
    pub const fn config(&self) -> &KernelConfig {
        &self.config
    }

    /// Build a runnable process from `descriptor`.
    ///
    /// # Errors
    /// Any failure while validating the image or claiming memory; everything
    /// claimed up to that point is released again.
    pub fn create(&self, descriptor: &ProcessDescriptor<'_>, pid: Pid) -> Result<Process, ProcessError> {
        let mut process = Process::new(pid, 0);
        if let Err(e) = self.build(&mut process, descriptor) {
            warn!("creating process {pid} failed: {e}");
            self.destroy(&mut process);
            return Err(e);
        }
        process.state = ProcessState::Runnable;
        debug!(
            "created process {pid}: entry {:?}, {} frames",
            process.layout.entry,
            process.claimed_pages()
        );
        Ok(process)
    }

    /// Build the process that takes over `parent`'s pid, parent and open
    /// files. `parent` itself is left as it is.
    ///
    /// # Errors
    /// See [`create`](Self::create).
    pub fn create_replacement(
        &self,
        parent: &Process,
        descriptor: &ProcessDescriptor<'_>,
    ) -> Result<Process, ProcessError> {
        let mut process = self.create(descriptor, parent.pid())?;
        process.parent_pid = parent.parent_pid;
        process.fds = parent.fds;
        Ok(process)
    }

    /// Duplicate `parent` into a new process with its own copy of every
    /// claimed frame, mapped at the same addresses.
    ///
    /// # Errors
    /// [`ProcessError::Released`] for a destroyed parent, or any failure to
    /// claim memory; the partial child is released again.
    pub fn clone(&self, parent: &Process, pid: Pid) -> Result<Process, ProcessError> {
        let mut child = Process::new(pid, parent.pid());
        child.current = parent.current;
        child.user_mode = parent.user_mode;
        child.layout = parent.layout;
        child.fds = parent.fds;

        if let Err(e) = self.copy_address_space(parent, &mut child) {
            warn!("cloning process {} failed: {e}", parent.pid());
            self.destroy(&mut child);
            return Err(e);
        }
        child.state = ProcessState::Runnable;
        debug!("cloned process {} into {pid}", parent.pid());
        Ok(child)
    }

    /// Release the page tables and every claimed frame of `process`.
    /// Returns the number of frames handed back; a second call returns 0.
    ///
    /// If the tables cannot be walked, nothing is released: the claimed
    /// frames are still mapped by them. A later call retries.
    pub fn destroy(&self, process: &mut Process) -> u64 {
        let mut freed = 0;
        if !process.root.is_zero() {
            match self.paging.delete_address_space(process.root) {
                Ok(tables) => freed += tables,
                Err(e) => {
                    warn!("cannot release process {} yet: {e}", process.pid());
                    return 0;
                }
            }
            process.root = PhysicalAddress::zero();
        }

        let frames = self.paging.frames();
        for kind in ClaimKind::ALL {
            for claim in process.claims_mut(kind).drain(..) {
                frames.free_frames(claim.base, claim.pages);
                freed += claim.pages;
            }
        }
        if freed > 0 {
            debug!("released process {}: {freed} frames", process.pid());
        }
        freed
    }

    /// Frames [`destroy`](Self::destroy) would release.
    ///
    /// # Errors
    /// Fails if the window has no free slot to walk the tables.
    pub fn owned_frames(&self, process: &Process) -> Result<u64, WindowError> {
        let tables = if process.root.is_zero() {
            0
        } else {
            self.paging.table_frame_count(process.root)?
        };
        Ok(tables + process.claimed_pages())
    }

    /// Move the program break up by `increment` bytes, mapping zeroed pages
    /// as needed. Returns the previous break.
    ///
    /// # Errors
    /// [`ProcessError::HeapExhausted`] beyond the heap size limit, or any
    /// failure to claim memory.
    pub fn grow_heap(&self, process: &mut Process, increment: u64) -> Result<VirtualAddress, ProcessError> {
        Self::ensure_live(process)?;
        let old = process.layout.program_break;
        let new = old
            .as_u64()
            .checked_add(increment)
            .filter(|&end| end - process.layout.heap_start.as_u64() <= PROCESS_HEAP_MAX_SIZE)
            .ok_or(ProcessError::HeapExhausted)?;

        let mapped_end = align_up(old.as_u64(), FRAME_SIZE);
        let new_end = align_up(new, FRAME_SIZE);
        if new_end > mapped_end {
            self.claim(
                process,
                ClaimKind::Heap,
                VirtualAddress::new(mapped_end),
                new_end - mapped_end,
                PageAccess::ReadWrite,
                Privilege::User,
                Fill::Zero,
            )?;
        }
        process.layout.program_break = VirtualAddress::new(new);
        trace!("process {} break {old:?} -> {new:#x}", process.pid());
        Ok(old)
    }

    /// Map `size` bytes of zeroed user memory. Returns the start address.
    ///
    /// # Errors
    /// - [`ProcessError::MappingCollision`] if a fixed range is taken.
    /// - [`ProcessError::AddressSpaceExhausted`] if no hinted range is found.
    /// - [`ProcessError::Map`] for an empty, unaligned or kernel range.
    pub fn map_anonymous(
        &self,
        process: &mut Process,
        placement: Placement,
        size: u64,
        access: PageAccess,
    ) -> Result<VirtualAddress, ProcessError> {
        Self::ensure_live(process)?;
        if size == 0 {
            return Err(ProcessError::Map(MapError::InvalidRange));
        }
        let virt = match placement {
            Placement::Fixed(virt) if !virt.is_page_aligned() => return Err(ProcessError::Map(MapError::Misaligned)),
            Placement::Fixed(virt) => virt,
            Placement::Hint(hint) => {
                self.paging
                    .find_free_virtual_range(process.root, hint, size)?
                    .ok_or(ProcessError::AddressSpaceExhausted)?
                    .start
            }
        };
        if virt.is_higher_half() {
            return Err(ProcessError::Map(MapError::InvalidRange));
        }
        self.claim(process, ClaimKind::Heap, virt, size, access, Privilege::User, Fill::Zero)?;
        Ok(virt)
    }

    /// Extend the user stack down to the page containing `fault`.
    ///
    /// # Errors
    /// [`ProcessError::StackLimit`] if `fault` is not below the stack or
    /// beyond its growth limit, or any failure to claim memory.
    pub fn grow_stack(&self, process: &mut Process, fault: VirtualAddress) -> Result<(), ProcessError> {
        Self::ensure_live(process)?;
        let bottom = process.layout.stack_bottom;
        let limit = process
            .layout
            .stack_top
            .as_u64()
            .saturating_sub(self.config.max_user_stack_bytes);
        if fault.is_higher_half() || fault.as_u64() >= bottom.as_u64() || fault.as_u64() < limit {
            return Err(ProcessError::StackLimit(fault));
        }

        let new_bottom = fault.align_down();
        self.claim(
            process,
            ClaimKind::Stack,
            new_bottom,
            bottom - new_bottom,
            PageAccess::ReadWrite,
            Privilege::User,
            Fill::Zero,
        )?;
        process.layout.stack_bottom = new_bottom;
        debug!("process {} stack grown to {new_bottom:?}", process.pid());
        Ok(())
    }

    const fn ensure_live(process: &Process) -> Result<(), ProcessError> {
        if process.root.is_zero() {
            return Err(ProcessError::Released);
        }
        Ok(())
    }

    fn build(&self, process: &mut Process, descriptor: &ProcessDescriptor<'_>) -> Result<(), ProcessError> {
        process.root = self.paging.new_root()?;

        let (entry, image_start, image_end) = match descriptor.kind {
            ExecutableKind::Binary => self.load_binary(process, &descriptor.image)?,
            ExecutableKind::Elf => self.load_elf(process, &descriptor.image)?,
        };

        let tokens = split_command_line(descriptor.command_line);
        let args_start = image_end.align_up();
        let (argc, argv, args_end) = if tokens.is_empty() {
            (0, VirtualAddress::default(), args_start)
        } else {
            let block = build_argument_block(&tokens, args_start);
            let claim = self.claim(
                process,
                ClaimKind::Args,
                args_start,
                block.len() as u64,
                PageAccess::ReadOnly,
                Privilege::User,
                Fill::Zero,
            )?;
            self.fill(&claim, 0, &ImageSource::Bytes(&block), 0, block.len() as u64)?;
            (tokens.len() as u64, args_start, claim.end())
        };

        let stack_bytes = self.config.user_stack_pages * FRAME_SIZE;
        let stack_bottom = USER_STACK_TOP - stack_bytes;
        self.claim(
            process,
            ClaimKind::Stack,
            stack_bottom,
            stack_bytes,
            PageAccess::ReadWrite,
            Privilege::User,
            Fill::Zero,
        )?;

        let kernel_stack_bytes = self.config.kernel_stack_pages * FRAME_SIZE;
        self.claim(
            process,
            ClaimKind::KernelStack,
            PROCESS_KERNEL_STACK_TOP - kernel_stack_bytes,
            kernel_stack_bytes,
            PageAccess::ReadWrite,
            Privilege::Kernel,
            Fill::Zero,
        )?;

        let heap_start = VirtualAddress::new(align_up(args_end.as_u64(), PROCESS_HEAP_ALIGNMENT));
        process.layout = ProcessLayout {
            entry,
            image_start,
            image_end,
            argc,
            argv,
            heap_start,
            program_break: heap_start,
            stack_top: USER_STACK_TOP,
            stack_bottom,
            kernel_stack_top: PROCESS_KERNEL_STACK_TOP,
        };

        let mut state = CpuState::user(entry, USER_STACK_TOP - 8);
        state.regs.rdi = argc;
        state.regs.rsi = argv.as_u64();
        process.current = state;
        process.user_mode = state;
        Ok(())
    }

    /// Copy a flat binary to [`USER_CODE_BASE`]; it is entered at its first
    /// byte.
    fn load_binary(
        &self,
        process: &mut Process,
        image: &ImageSource<'_>,
    ) -> Result<(VirtualAddress, VirtualAddress, VirtualAddress), ProcessError> {
        if image.is_empty() {
            return Err(ExecError::Empty.into());
        }
        let size = image.len();
        let claim = self.claim(
            process,
            ClaimKind::Code,
            USER_CODE_BASE,
            size,
            PageAccess::ReadWrite,
            Privilege::User,
            Fill::Zero,
        )?;
        self.fill(&claim, 0, image, 0, size)?;
        Ok((USER_CODE_BASE, USER_CODE_BASE, USER_CODE_BASE + size))
    }

    /// Copy the `PT_LOAD` segments of a static ELF executable to their link
    /// addresses. All headers are checked before anything is mapped.
    fn load_elf(
        &self,
        process: &mut Process,
        image: &ImageSource<'_>,
    ) -> Result<(VirtualAddress, VirtualAddress, VirtualAddress), ProcessError> {
        let window = self.paging.window();
        let mut raw = [0u8; ELF_HEADER_SIZE];
        if image.len() < ELF_HEADER_SIZE as u64 {
            return Err(ExecError::TooShort.into());
        }
        image.read(window, 0, &mut raw)?;
        let header = ElfHeader::parse(&raw)?;

        let mut segments = Vec::new();
        for index in 0..header.phnum {
            let mut raw = [0u8; PROGRAM_HEADER_SIZE];
            image.read(window, header.program_header_offset(index), &mut raw)?;
            let ph = ProgramHeader::parse(&raw)?;
            match ph.kind {
                PT_INTERP => return Err(ExecError::DynamicUnsupported.into()),
                PT_LOAD => {
                    ph.validate_load(image.len())?;
                    if ph.memsz > 0 {
                        segments.push(ph);
                    }
                }
                _ => {}
            }
        }
        if segments.is_empty() {
            return Err(ExecError::Empty.into());
        }

        let mut start = u64::MAX;
        let mut end = 0;
        for ph in &segments {
            let page = align_down(ph.vaddr, FRAME_SIZE);
            let bytes = align_up(ph.vaddr + ph.memsz, FRAME_SIZE) - page;
            let access = if ph.flags.write() {
                PageAccess::ReadWrite
            } else {
                PageAccess::ReadOnly
            };
            let claim = self.claim(
                process,
                ClaimKind::Code,
                VirtualAddress::new(page),
                bytes,
                access,
                Privilege::User,
                Fill::Zero,
            )?;
            self.fill(&claim, ph.vaddr - page, image, ph.offset, ph.filesz)?;
            start = start.min(ph.vaddr);
            end = end.max(ph.vaddr + ph.memsz);
        }
        Ok((header.entry, VirtualAddress::new(start), VirtualAddress::new(end)))
    }

    fn copy_address_space(&self, parent: &Process, child: &mut Process) -> Result<(), ProcessError> {
        Self::ensure_live(parent)?;
        child.root = self.paging.new_root()?;
        for kind in ClaimKind::ALL {
            for claim in parent.claims(kind) {
                self.claim(
                    child,
                    kind,
                    claim.virt,
                    claim.len(),
                    claim.access,
                    claim.privilege,
                    Fill::CopyFrom(claim.base),
                )?;
            }
        }
        Ok(())
    }

    /// Take contiguous frames for `bytes` at `virt`, fill them, map them into
    /// the process and record the claim. Nothing is kept on error.
    #[allow(clippy::too_many_arguments)]
    fn claim(
        &self,
        process: &mut Process,
        kind: ClaimKind,
        virt: VirtualAddress,
        bytes: u64,
        access: PageAccess,
        privilege: Privilege,
        fill: Fill,
    ) -> Result<SegmentClaim, ProcessError> {
        let pages = frames_for(bytes);
        let frames = self.paging.frames();
        let base = frames.request_frames(pages).ok_or(ProcessError::OutOfFrames)?;
        let claim = SegmentClaim {
            base,
            pages,
            virt,
            access,
            privilege,
        };

        let mapped = self
            .prepare(&claim, fill)
            .map_err(ProcessError::from)
            .and_then(|()| {
                self.paging
                    .map(process.root, base, virt, claim.len(), access, privilege)
                    .map_err(ProcessError::from)
            });
        if let Err(e) = mapped {
            frames.free_frames(base, pages);
            return Err(e);
        }
        process.claims_mut(kind).push(claim);
        Ok(claim)
    }

    fn prepare(&self, claim: &SegmentClaim, fill: Fill) -> Result<(), WindowError> {
        let window = self.paging.window();
        for i in 0..claim.pages {
            let frame = claim.base + i * FRAME_SIZE;
            match fill {
                Fill::Zero => window.zero_frame(frame)?,
                Fill::CopyFrom(source) => window.copy_frame(source + i * FRAME_SIZE, frame)?,
            }
        }
        Ok(())
    }

    /// Copy `len` image bytes from `offset` to byte `at` of `claim`.
    #[allow(clippy::cast_possible_truncation)]
    fn fill(
        &self,
        claim: &SegmentClaim,
        at: u64,
        source: &ImageSource<'_>,
        offset: u64,
        len: u64,
    ) -> Result<(), ProcessError> {
        let window = self.paging.window();
        let mut done = 0;
        while done < len {
            let pos = at + done;
            let in_frame = pos % FRAME_SIZE;
            let n = (FRAME_SIZE - in_frame).min(len - done);
            let mut mapping = window.map(claim.base + align_down(pos, FRAME_SIZE))?;
            source.read(
                window,
                offset + done,
                &mut mapping.bytes_mut()[in_frame as usize..(in_frame + n) as usize],
            )?;
            done += n;
        }
        Ok(())
    }
}
