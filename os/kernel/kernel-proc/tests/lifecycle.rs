use kernel_info::config::KernelConfig;
use kernel_info::memory::USER_CODE_BASE;
use kernel_memory_addresses::{PhysicalAddress, VirtualAddress};
use kernel_proc::{
    Cpu, Dispatch, ExecError, ExecutableKind, FileHandle, ImageSource, ProcessDescriptor, ProcessError,
    ProcessManager, ProcessState, Scheduler,
};
use kernel_vmem::testing::SimulatedMachine;

#[derive(Default)]
struct NullCpu {
    switches: usize,
}

impl Cpu for NullCpu {
    fn switch_address_space(&mut self, _root: PhysicalAddress) {
        self.switches += 1;
    }

    fn set_kernel_stack(&mut self, _top: VirtualAddress) {}

    fn switch_to_kernel_stack(&mut self) {}
}

/// A bare ELF64 file header for a foreign machine.
fn foreign_elf(machine: u16) -> [u8; 64] {
    let mut header = [0u8; 64];
    header[..8].copy_from_slice(b"\x7FELF\x02\x01\x01\x00");
    header[16..18].copy_from_slice(&2u16.to_le_bytes());
    header[18..20].copy_from_slice(&machine.to_le_bytes());
    header[20..24].copy_from_slice(&1u32.to_le_bytes());
    header[54..56].copy_from_slice(&56u16.to_le_bytes());
    header
}

#[test]
fn fork_exec_exit_wait() {
    let machine = SimulatedMachine::new(512);
    let manager = ProcessManager::new(machine.paging(), KernelConfig::DEFAULT);
    let mut scheduler = Scheduler::new(&KernelConfig::DEFAULT);
    let mut cpu = NullCpu::default();
    let idle = machine.frames.used();

    let init = ProcessDescriptor::new(ImageSource::Bytes(b"\xEB\xFE"), ExecutableKind::Binary, "init");
    let mut first = manager.create(&init, scheduler.next_pid()).unwrap();
    first.fds.install(FileHandle(1)).unwrap();
    scheduler.queue(first);
    assert!(matches!(scheduler.dispatch(&mut cpu, &manager), Ok(Dispatch::Resume { pid: 1, .. })));

    // fork
    let parent = scheduler.current().unwrap();
    let mut child = manager.clone(parent, scheduler.next_pid()).unwrap();
    child.current.regs.rax = 0;
    let child_pid = child.pid();
    scheduler.queue(child);
    assert_eq!(scheduler.child_count(1), 1);

    // exec with an image for the wrong machine keeps the caller intact
    let image = foreign_elf(183);
    let foreign = ProcessDescriptor::new(ImageSource::Bytes(&image), ExecutableKind::Elf, "arm64-tool");
    let caller = scheduler.get(child_pid).unwrap();
    let root = caller.root();
    let frames = machine.frames.used();
    assert_eq!(
        manager.create_replacement(caller, &foreign).unwrap_err(),
        ProcessError::Exec(ExecError::BadMachine(183))
    );
    assert_eq!(machine.frames.used(), frames);
    let caller = scheduler.get(child_pid).unwrap();
    assert_eq!(caller.root(), root);
    assert_eq!(caller.fds.get(0), Some(FileHandle(1)));
    let code = machine.paging().translate(root, USER_CODE_BASE).unwrap().unwrap();
    let mut bytes = [0u8; 2];
    machine.ram.read(code, &mut bytes);
    assert_eq!(&bytes, b"\xEB\xFE");

    // exec that succeeds
    let halt = ProcessDescriptor::new(ImageSource::Bytes(b"\xF4"), ExecutableKind::Binary, "hlt now");
    let replacement = manager.create_replacement(caller, &halt).unwrap();
    scheduler.replace(child_pid, replacement, &manager).unwrap();
    let replaced = scheduler.get(child_pid).unwrap();
    assert_eq!(replaced.parent_pid(), 1);
    assert_eq!(replaced.layout().argc, 2);

    // exit and wait
    scheduler.terminate(child_pid, 17, &manager).unwrap();
    assert_eq!(scheduler.get(child_pid).unwrap().state(), ProcessState::Zombie);
    assert!(scheduler.has_terminated_child(1));
    assert_eq!(scheduler.reap_child(1), Some((child_pid, 17)));

    scheduler.terminate(1, 0, &manager).unwrap();
    assert_eq!(scheduler.dispatch(&mut cpu, &manager), Ok(Dispatch::Halt));
    assert_eq!(machine.frames.used(), idle);
    assert_eq!(cpu.switches, 1);
}
