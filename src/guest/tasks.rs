//! Task and memory-map enumeration through the guest's own structures.

use super::types::{Instance, TypeOracle};
use super::{GuestMemory, KERNEL_SPACE};
use crate::prelude::*;

pub const VM_READ: u64 = 0x1;
pub const VM_WRITE: u64 = 0x2;
pub const VM_EXEC: u64 = 0x4;
pub const VM_MAYSHARE: u64 = 0x80;

/// Kernel stacks span two pages.
pub const KERNEL_STACK_SIZE: u64 = 0x2000;

/// One virtual memory area of a process.
///
/// `off` is the offset of the mapping into the backing file, in page units.
/// `name` is empty for anonymous mappings that could not be classified.
#[derive(Debug, Clone)]
pub struct VmaInfo {
    pub start: u64,
    pub end: u64,
    pub ino: u64,
    pub off: u64,
    pub flags: u64,
    pub name: String,
}

impl VmaInfo {
    pub fn is_file_backed(&self) -> bool {
        self.ino != 0
    }

    pub fn describe(&self) -> String {
        format!(
            "{:#016x}-{:#016x} {}{}{}{} {:>8x} {}",
            self.start,
            self.end,
            if self.flags & VM_READ != 0 { 'r' } else { '-' },
            if self.flags & VM_WRITE != 0 { 'w' } else { '-' },
            if self.flags & VM_EXEC != 0 { 'x' } else { '-' },
            if self.flags & VM_MAYSHARE != 0 { 's' } else { 'p' },
            self.off,
            if self.name.is_empty() { "<anonymous>" } else { &self.name },
        )
    }
}

/// A task's kernel stack: the page-aligned bottom and the live stack
/// pointer.
#[derive(Debug, Clone, Copy)]
pub struct TaskStack {
    pub bottom: u64,
    pub rsp: u64,
}

pub struct TaskManager<'a> {
    oracle: &'a dyn TypeOracle,
    memory: &'a dyn GuestMemory,
}

impl<'a> TaskManager<'a> {
    pub fn new(oracle: &'a dyn TypeOracle, memory: &'a dyn GuestMemory) -> Self {
        TaskManager { oracle, memory }
    }

    fn member(&self, instance: &Instance, name: &str, deref: bool) -> Result<Instance> {
        instance.member(self.oracle, self.memory, KERNEL_SPACE, name, deref)
    }

    /// Follow `task.tasks.next` to the next task in the circular list.
    fn next_task(&self, task: &Instance) -> Result<Instance> {
        let task_struct = self.oracle.base_type("task_struct")?;
        let tasks_offset = task_struct.member_offset("tasks")?;
        let next = self
            .member(&self.member(task, "tasks", false)?, "next", false)?
            .value_u64(self.memory, KERNEL_SPACE)?;
        self.oracle
            .instance_at("task_struct", next - tasks_offset)
    }

    /// Visit every task, calling `visit` with each `task_struct` instance.
    fn for_each_task(&self, mut visit: impl FnMut(&Instance) -> Result<()>) -> Result<()> {
        let init_task = self.oracle.variable("init_task")?;
        let mut task = self.next_task(&init_task)?;
        let mut guard = 0u32;
        while task.address != init_task.address {
            visit(&task)?;
            task = self.next_task(&task)?;
            guard += 1;
            if guard > 0x10000 {
                bail!("task list does not cycle back to init_task");
            }
        }
        visit(&init_task)
    }

    /// Kernel stack of every task, from `task.thread.sp0` / `thread.sp`.
    pub fn stacks(&self) -> Result<Vec<TaskStack>> {
        let mut stacks = Vec::new();
        self.for_each_task(|task| {
            let thread = self.member(task, "thread", false)?;
            let sp0 = self
                .member(&thread, "sp0", false)?
                .value_u64(self.memory, KERNEL_SPACE)?;
            let rsp = self
                .member(&thread, "sp", false)?
                .value_u64(self.memory, KERNEL_SPACE)?;
            stacks.push(TaskStack {
                bottom: sp0 - KERNEL_STACK_SIZE,
                rsp,
            });
            Ok(())
        })?;
        Ok(stacks)
    }

    fn task_for_pid(&self, pid: i32) -> Result<Instance> {
        let mut found = None;
        self.for_each_task(|task| {
            let task_pid = self
                .member(task, "pid", false)?
                .value_i32(self.memory, KERNEL_SPACE)?;
            if task_pid == pid && found.is_none() {
                found = Some(task.clone());
            }
            Ok(())
        })?;
        found.ok_or_else(|| anyhow!("no task with pid {pid}"))
    }

    /// Enumerate the VMAs of a process, synthesising the `[vdso]`,
    /// `[heap]`, `[stack]` and `[vvar]` names for anonymous mappings.
    pub fn vmas(&self, pid: i32) -> Result<Vec<VmaInfo>> {
        let task = self.task_for_pid(pid)?;
        let mm = self.member(&task, "mm", true)?;
        if mm.address == 0 {
            bail!("task {pid} has no mm (kernel thread)");
        }

        let map_count = self
            .member(&mm, "map_count", false)?
            .value_i32(self.memory, KERNEL_SPACE)?;

        let vdso_page = self
            .member(&self.member(&mm, "context", false)?, "vdso", false)?
            .value_u64(self.memory, KERNEL_SPACE)?;
        let brk = self
            .member(&mm, "brk", false)?
            .value_u64(self.memory, KERNEL_SPACE)?;
        let start_brk = self
            .member(&mm, "start_brk", false)?
            .value_u64(self.memory, KERNEL_SPACE)?;
        let start_stack = self
            .member(&mm, "start_stack", false)?
            .value_u64(self.memory, KERNEL_SPACE)?;

        let mut vmas = Vec::new();
        let mut prev_name = String::new();
        let mut vma = self.member(&mm, "mmap", true)?;

        for index in 0..map_count {
            let start = self
                .member(&vma, "vm_start", false)?
                .value_u64(self.memory, KERNEL_SPACE)?;
            let end = self
                .member(&vma, "vm_end", false)?
                .value_u64(self.memory, KERNEL_SPACE)?;
            let flags = self
                .member(&vma, "vm_flags", false)?
                .value_u64(self.memory, KERNEL_SPACE)?;

            let file_ptr = self
                .member(&vma, "vm_file", false)?
                .value_u64(self.memory, KERNEL_SPACE)?;

            let (ino, off, mut name) = if file_ptr != 0 {
                let file = self.member(&vma, "vm_file", true)?;
                let off = self
                    .member(&vma, "vm_pgoff", false)?
                    .value_u64(self.memory, KERNEL_SPACE)?;
                let ino = self
                    .member(
                        &self.member(&self.member(&file, "f_mapping", true)?, "host", true)?,
                        "i_ino",
                        false,
                    )?
                    .value_u64(self.memory, KERNEL_SPACE)?;
                let dentry = self
                    .member(&self.member(&file, "f_path", false)?, "dentry", true)?;
                (ino, off, self.dentry_path(&dentry)?)
            } else {
                (0, 0, String::new())
            };

            if name.is_empty() {
                name = classify_anonymous(ClassifyAnon {
                    start,
                    end,
                    vdso_page,
                    brk,
                    start_brk,
                    start_stack,
                    last: index == map_count - 1,
                    prev_name: &prev_name,
                });
            }
            prev_name = name.clone();

            vmas.push(VmaInfo {
                start,
                end,
                ino,
                off,
                flags,
                name,
            });

            vma = self.member(&vma, "vm_next", true)?;
            if vma.address == 0 {
                break;
            }
        }

        Ok(vmas)
    }

    /// Walk `d_parent` up to the root, collecting the path.
    fn dentry_path(&self, dentry: &Instance) -> Result<String> {
        let mut dentry = dentry.clone();
        let mut path = String::new();
        for _ in 0..64 {
            let name_ptr = self
                .member(&self.member(&dentry, "d_name", false)?, "name", false)?
                .value_u64(self.memory, KERNEL_SPACE)?;
            let component = self.memory.read_cstr(name_ptr, 256, KERNEL_SPACE)?;
            if component == "/" {
                return Ok(path);
            }
            path.insert_str(0, &component);
            path.insert(0, '/');
            dentry = self.member(&dentry, "d_parent", true)?;
        }
        Ok(path)
    }
}

struct ClassifyAnon<'a> {
    start: u64,
    end: u64,
    vdso_page: u64,
    brk: u64,
    start_brk: u64,
    start_stack: u64,
    last: bool,
    prev_name: &'a str,
}

/// Name an anonymous mapping the way the kernel's own maps file would.
fn classify_anonymous(vma: ClassifyAnon) -> String {
    if vma.start == vma.vdso_page {
        "[vdso]".to_string()
    } else if vma.start <= vma.brk && vma.end >= vma.start_brk {
        "[heap]".to_string()
    } else if vma.start <= vma.start_stack && vma.end >= vma.start_stack {
        "[stack]".to_string()
    } else if vma.last {
        "[vvar]".to_string()
    } else if vma.prev_name.ends_with(".heap") {
        vma.prev_name.to_string()
    } else {
        format!("{}.heap", vma.prev_name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> ClassifyAnon<'static> {
        ClassifyAnon {
            start: 0x7f0000000000,
            end: 0x7f0000001000,
            vdso_page: 0x7fff00000000,
            brk: 0x2000000,
            start_brk: 0x1000000,
            start_stack: 0x7ffffffde000,
            last: false,
            prev_name: "/usr/lib/libc.so.6",
        }
    }

    #[test]
    fn recognises_special_mappings() {
        let vdso = ClassifyAnon {
            start: 0x7fff00000000,
            ..base()
        };
        assert_eq!(classify_anonymous(vdso), "[vdso]");

        let heap = ClassifyAnon {
            start: 0x1800000,
            end: 0x1900000,
            ..base()
        };
        assert_eq!(classify_anonymous(heap), "[heap]");

        let stack = ClassifyAnon {
            start: 0x7ffffffdd000,
            end: 0x7ffffffff000,
            ..base()
        };
        assert_eq!(classify_anonymous(stack), "[stack]");

        let vvar = ClassifyAnon { last: true, ..base() };
        assert_eq!(classify_anonymous(vvar), "[vvar]");
    }

    #[test]
    fn other_anonymous_mappings_borrow_the_previous_name() {
        assert_eq!(classify_anonymous(base()), "/usr/lib/libc.so.6.heap");
        let chained = ClassifyAnon {
            prev_name: "/usr/lib/libc.so.6.heap",
            ..base()
        };
        assert_eq!(classify_anonymous(chained), "/usr/lib/libc.so.6.heap");
    }
}
