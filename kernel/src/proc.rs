use core::mem;
use core::ptr;
use core::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use crate::file::file::filedup;
use crate::file::{File, INode};
use crate::fs::fs;
use crate::kalloc::KMEM;
use crate::memlayout::{TRAMPOLINE, TRAPFRAME};
use crate::param::{NCPU, NOFILE, NPROC, ROOTDEV};
use crate::printf;
use crate::proc::Procstate::{RUNNABLE, RUNNING, SLEEPING, UNUSED, USED, ZOMBIE};
use crate::riscv::{intr_get, intr_on, r_tp, PageTable, PGSIZE, PTE_R, PTE_W, PTE_X};
use crate::spinlock::{pop_off, push_off, Spinlock};
use crate::string::safestrcpy;
use crate::trap::usertrapret;
use crate::vm::{
    copyin, copyout, kvmmap, mappages, trampoline, uvmalloc, uvmcopy, uvmcreate, uvmdealloc,
    uvmfirst, uvmfree, uvmunmap,
};
use crate::KSTACK;

extern "C" {
    fn swtch(old: *mut Context, new: *mut Context);
}

// Saved registers for kernel context switches.
#[derive(Copy, Clone)]
pub(crate) struct Context {
    ra: u64,
    sp: u64,

    // callee-saved
    s0: u64,
    s1: u64,
    s2: u64,
    s3: u64,
    s4: u64,
    s5: u64,
    s6: u64,
    s7: u64,
    s8: u64,
    s9: u64,
    s10: u64,
    s11: u64,
}

impl Context {
    const fn zeroed() -> Self {
        Context {
            ra: 0,
            sp: 0,
            s0: 0,
            s1: 0,
            s2: 0,
            s3: 0,
            s4: 0,
            s5: 0,
            s6: 0,
            s7: 0,
            s8: 0,
            s9: 0,
            s10: 0,
            s11: 0,
        }
    }
}

// Per-CPU state.
#[derive(Copy, Clone)]
pub struct Cpu {
    proc: *mut Proc, // The process running on this cpu, or null.
    context: Context, // swtch() here to enter scheduler().
    pub noff: u8,    // Depth of push_off() nesting.
    pub intena: bool, // Were interrupts enabled before push_off()?
}

impl Cpu {
    const fn default() -> Self {
        Cpu {
            proc: ptr::null_mut(),
            context: Context::zeroed(),
            noff: 0,
            intena: false,
        }
    }
}

static mut CPUS: [Cpu; NCPU] = [Cpu::default(); NCPU];
static mut PROCS: [Proc; NPROC] = [Proc::default(); NPROC];

static mut INIT_PROC: *mut Proc = ptr::null_mut();

extern "C" {
    static trampoline: u8; // trampoline.S
}

// per-process data for the trap handling code in trampoline.S.
// sits in a page by itself just under the trampoline page in the
// user page table. not specially mapped in the kernel page table.
// uservec in trampoline.S saves user registers in the trapframe,
// then initializes registers from the trapframe's
// kernel_sp, kernel_hartid, kernel_satp, and jumps to kernel_trap.
// usertrapret() and userret in trampoline.S set up
// the trapframe's kernel_*, restore user registers from the
// trapframe, switch to the user page table, and enter user space.
// the trapframe includes callee-saved user registers like s0-s11 because the
// return-to-user path via usertrapret() doesn't return through
// the entire kernel call stack.
#[repr(C)]
pub struct Trapframe {
    /*   0 */ pub kernel_satp: u64, // kernel page table
    /*   8 */ pub kernel_sp: u64, // top of process's kernel stack
    /*  16 */ pub kernel_trap: u64, // usertrap()
    /*  24 */ pub epc: u64, // saved user program counter
    /*  32 */ pub kernel_hartid: u64, // saved kernel tp
    /*  40 */ pub ra: u64,
    /*  48 */ pub sp: u64,
    /*  56 */ pub gp: u64,
    /*  64 */ pub tp: u64,
    /*  72 */ pub t0: u64,
    /*  80 */ pub t1: u64,
    /*  88 */ pub t2: u64,
    /*  96 */ pub s0: u64,
    /* 104 */ pub s1: u64,
    /* 112 */ pub a0: u64,
    /* 120 */ pub a1: u64,
    /* 128 */ pub a2: u64,
    /* 136 */ pub a3: u64,
    /* 144 */ pub a4: u64,
    /* 152 */ pub a5: u64,
    /* 160 */ pub a6: u64,
    /* 168 */ pub a7: u64,
    /* 176 */ pub s2: u64,
    /* 184 */ pub s3: u64,
    /* 192 */ pub s4: u64,
    /* 200 */ pub s5: u64,
    /* 208 */ pub s6: u64,
    /* 216 */ pub s7: u64,
    /* 224 */ pub s8: u64,
    /* 232 */ pub s9: u64,
    /* 240 */ pub s10: u64,
    /* 248 */ pub s11: u64,
    /* 256 */ pub t3: u64,
    /* 264 */ pub t4: u64,
    /* 272 */ pub t5: u64,
    /* 280 */ pub t6: u64,
}

impl Trapframe {
    const fn zeroed() -> Self {
        // SAFETY: all-zero is a valid bit pattern for a struct of u64 fields.
        unsafe { mem::zeroed() }
    }
}

#[derive(Copy, Clone, Eq, PartialEq)]
enum Procstate {
    UNUSED,
    USED,
    SLEEPING,
    RUNNABLE,
    RUNNING,
    ZOMBIE,
}

const PROC_NAME_LEN: usize = 16;

// Per-process state
pub struct Proc {
    pub(crate) lock: Spinlock,

    // p->lock must be held when using these:
    state: Procstate,              // Process state
    chan: *const u8,               // If non-null, sleeping on chan
    killed: u8,                   // If non-zero, have been killed
    xstate: i32,                  // Exit status to be returned to parent's wait
    pub pid: u32,                 // Process ID

    // wait_lock must be held when using this:
    parent: *mut Proc, // Parent process

    // these are private to the process, so p->lock need not be held.
    pub(crate) kstack: usize,              // Virtual address of kernel stack
    pub(crate) sz: usize,                  // Size of process memory (bytes)
    pub(crate) pagetable: *mut PageTable,   // User page table
    pub(crate) trapframe: *mut Trapframe,   // data page for trampoline.S
    context: Context,                      // swtch() here to run process
    pub(crate) ofile: [*mut File; NOFILE],  // Open files
    pub(crate) cwd: *mut INode,             // Current directory
    pub(crate) name: [u8; PROC_NAME_LEN],   // Process name (debugging)
}

unsafe impl Sync for Proc {}

impl Proc {
    const fn default() -> Self {
        Proc {
            lock: Spinlock::init_lock("proc"),
            state: UNUSED,
            chan: ptr::null(),
            killed: 0,
            xstate: 0,
            pid: 0,
            parent: ptr::null_mut(),
            kstack: 0,
            sz: 0,
            pagetable: ptr::null_mut(),
            trapframe: ptr::null_mut(),
            context: Context::zeroed(),
            ofile: [ptr::null_mut(); NOFILE],
            cwd: ptr::null_mut(),
            name: [0; PROC_NAME_LEN],
        }
    }

    pub fn killed(&mut self) -> bool {
        self.lock.acquire();
        let k = self.killed != 0;
        self.lock.release();
        k
    }

    pub fn setkilled(&mut self) {
        self.lock.acquire();
        self.killed = 1;
        self.lock.release();
    }
}

static NEXT_PID: AtomicU32 = AtomicU32::new(1);
// helps ensure that wakeups of wait()ing
// parents are not lost. helps obey the
// memory model when using p->parent.
// must be acquired before any p->lock.
static mut WAIT_LOCK: Spinlock = Spinlock::init_lock("wait_lock");

// Must be called with interrupts disabled,
// to prevent race with process being moved
// to a different CPU.
pub fn cpuid() -> usize {
    r_tp() as usize
}

// Return this CPU's cpu struct.
// Interrupts must be disabled.
pub fn mycpu() -> &'static mut Cpu {
    unsafe { &mut CPUS[cpuid()] }
}

// Return the current struct proc *, or panic if none (never called
// outside process context).
pub fn myproc() -> &'static mut Proc {
    push_off();
    let c = mycpu();
    let p = c.proc;
    pop_off();
    unsafe { p.as_mut().expect("myproc: no current process") }
}

fn allocpid() -> u32 {
    NEXT_PID.fetch_add(1, Ordering::Relaxed)
}

// Allocate a page for each process's kernel stack.
// Map it high in memory, followed by an invalid
// guard page.
pub fn proc_mapstacks(kpgtbl: &mut PageTable) {
    for idx in 0..NPROC {
        unsafe {
            let pa: *mut u8 = KMEM.kalloc();
            if pa.is_null() {
                panic!("kalloc");
            }
            let va = KSTACK!(idx);
            kvmmap(kpgtbl, va, pa.expose_addr(), PGSIZE, PTE_R | PTE_W);
        }
    }
}

// initialize the proc table.
pub fn procinit() {
    unsafe {
        for idx in 0..NPROC {
            PROCS[idx].kstack = KSTACK!(idx);
        }
    }
}

// a user program that calls exec("/init")
// assembled from ../user/initcode.S
// od -t xC ../user/initcode
const INITCODE: [u8; 52] = [
    0x17, 0x05, 0x00, 0x00, 0x13, 0x05, 0x45, 0x02, 0x97, 0x05, 0x00, 0x00, 0x93, 0x85, 0x35,
    0x02, 0x93, 0x08, 0x70, 0x00, 0x73, 0x00, 0x00, 0x00, 0x93, 0x08, 0x20, 0x00, 0x73, 0x00,
    0x00, 0x00, 0xef, 0xf0, 0x9f, 0xff, 0x2f, 0x69, 0x6e, 0x69, 0x74, 0x00, 0x00, 0x24, 0x00,
    0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
];

// Set up first user process.
pub fn userinit() {
    let p = allocproc().expect("userinit: out of process slots");

    unsafe {
        INIT_PROC = p as *mut Proc;
    }

    // allocate one user page and copy initcode's instructions
    // and data into it.
    let pagetable = unsafe { &mut *p.pagetable };
    uvmfirst(pagetable, INITCODE.as_ptr(), INITCODE.len());
    p.sz = PGSIZE;

    // prepare for the very first "return" from kernel to user.
    let tf = unsafe { &mut *p.trapframe };
    tf.epc = 0; // user program counter
    tf.sp = PGSIZE as u64; // user stack pointer

    safestrcpy(p.name.as_mut_ptr(), b"initcode\0".as_ptr(), p.name.len());
    // p.cwd is left unset here; the root directory isn't resolvable until
    // the file system has been initialized by forkret's first invocation.

    p.state = RUNNABLE;

    p.lock.release();
}

// A fork child's very first scheduling by scheduler()
// will swtch to forkret.
extern "C" fn forkret() {
    static FIRST: AtomicBool = AtomicBool::new(true);

    // Still holding p->lock from scheduler.
    myproc().lock.release();

    if FIRST.swap(false, Ordering::AcqRel) {
        // File system initialization must be run in the context of a
        // regular process (e.g., because it calls sleep), and thus cannot
        // be run from main().
        fs::fsinit(ROOTDEV);

        let p = myproc();
        p.cwd = fs::namei(b"/\0").map_or(ptr::null_mut(), |ip| ip as *mut INode);
    }

    usertrapret();
}

// Look in the process table for an UNUSED proc.
// If found, initialize state required to run in the kernel,
// and return with p->lock held.
// If there are no free procs, or a memory allocation fails, return None.
fn allocproc() -> Option<&'static mut Proc> {
    let mut found = None;
    for i in 0..NPROC {
        let p = unsafe { &mut PROCS[i] };
        p.lock.acquire();

        if p.state == UNUSED {
            found = Some(p);
            break;
        }

        p.lock.release();
    }

    let p = found?;
    p.pid = allocpid();
    p.state = USED;

    // Allocate a trapframe page.
    let trapframe_ptr: *mut Trapframe = unsafe { KMEM.kalloc() };
    if trapframe_ptr.is_null() {
        freeproc(p);
        p.lock.release();
        return None;
    }
    p.trapframe = trapframe_ptr;

    // An empty user page table.
    p.pagetable = match proc_pagetable(p) {
        Some(pt) => pt as *mut PageTable,
        None => {
            freeproc(p);
            p.lock.release();
            return None;
        }
    };

    // Set up new context to start executing at forkret,
    // which returns to user space.
    p.context = Context::zeroed();
    p.context.ra = forkret as usize as u64;
    p.context.sp = (p.kstack + PGSIZE) as u64;

    Some(p)
}

// free a proc structure and the data hanging from it,
// including user pages.
// p->lock must be held.
fn freeproc(p: &mut Proc) {
    if !p.trapframe.is_null() {
        unsafe { KMEM.kfree(p.trapframe) };
    }
    p.trapframe = ptr::null_mut();

    if !p.pagetable.is_null() {
        proc_freepagetable(unsafe { &mut *p.pagetable }, p.sz);
    }
    p.pagetable = ptr::null_mut();

    p.sz = 0;
    p.pid = 0;
    p.parent = ptr::null_mut();
    p.name = [0; PROC_NAME_LEN];
    p.chan = ptr::null();
    p.killed = 0;
    p.xstate = 0;
    p.state = UNUSED;
}

// Create a user page table for a given process, with no user memory,
// but with trampoline and trapframe pages.
pub(crate) fn proc_pagetable(p: &mut Proc) -> Option<&'static mut PageTable> {
    // An empty page table.
    let pagetable = uvmcreate()?;

    // map the trampoline code (for system call return)
    // at the highest user virtual address.
    // only the supervisor uses it, on the way
    // to/from user space, so not PTE_U.
    let trampoline_addr = (unsafe { &trampoline } as *const u8).expose_addr();
    if mappages(pagetable, TRAMPOLINE, trampoline_addr, PGSIZE, PTE_R | PTE_X) != 0 {
        uvmfree(pagetable, 0);
        return None;
    }

    // map the trapframe page just below the trampoline page, for
    // trampoline.S.
    let trapframe_addr = (p.trapframe as *const Trapframe).expose_addr();
    if mappages(pagetable, TRAPFRAME, trapframe_addr, PGSIZE, PTE_R | PTE_W) != 0 {
        uvmunmap(pagetable, TRAMPOLINE, 1, false);
        uvmfree(pagetable, 0);
        return None;
    }

    Some(pagetable)
}

// Free a process's page table, and free the
// physical memory it refers to.
pub(crate) fn proc_freepagetable(pagetable: &mut PageTable, sz: usize) {
    uvmunmap(pagetable, TRAMPOLINE, 1, false);
    uvmunmap(pagetable, TRAPFRAME, 1, false);
    uvmfree(pagetable, sz);
}

// Grow or shrink user memory by n bytes.
// Returns 0 on success, -1 on failure.
pub fn growproc(n: i32) -> i32 {
    let p = myproc();
    let mut sz = p.sz;
    let pagetable = unsafe { &mut *p.pagetable };

    if n > 0 {
        sz = uvmalloc(pagetable, sz, sz + n as usize, PTE_W);
        if sz == 0 {
            return -1;
        }
    } else if n < 0 {
        sz = uvmdealloc(pagetable, sz, (sz as isize + n as isize) as usize);
    }
    p.sz = sz;
    0
}

// Create a new process, copying the parent.
// Sets up child kernel stack to return as if from fork() system call.
pub fn fork() -> i32 {
    let p = myproc();

    let np = match allocproc() {
        Some(np) => np,
        None => return -1,
    };

    // Copy user memory from parent to child.
    if uvmcopy(unsafe { &mut *p.pagetable }, unsafe { &mut *np.pagetable }, p.sz) < 0 {
        freeproc(np);
        np.lock.release();
        return -1;
    }
    np.sz = p.sz;

    // copy saved user registers.
    unsafe {
        *np.trapframe = core::ptr::read(p.trapframe);
        (*np.trapframe).a0 = 0;
    }

    // increment reference counts on open file descriptors.
    for i in 0..NOFILE {
        if !p.ofile[i].is_null() {
            np.ofile[i] = filedup(p.ofile[i]);
        }
    }
    if !p.cwd.is_null() {
        np.cwd = unsafe { (*p.cwd).idup() as *mut INode };
    }

    np.name = p.name;

    let pid = np.pid;

    np.lock.release();

    unsafe {
        WAIT_LOCK.acquire();
        np.parent = p as *mut Proc;
        WAIT_LOCK.release();
    }

    np.lock.acquire();
    np.state = RUNNABLE;
    np.lock.release();

    pid as i32
}

// Pass p's abandoned children to init.
// Caller must hold wait_lock.
fn reparent(p: *mut Proc) {
    for i in 0..NPROC {
        let pp = unsafe { &mut PROCS[i] };
        if pp.parent == p {
            pp.parent = unsafe { INIT_PROC };
            wakeup(unsafe { INIT_PROC } as *const Proc);
        }
    }
}

// Exit the current process. Does not return.
// An exited process remains in the zombie state
// until its parent calls wait().
pub fn exit(status: i32) -> ! {
    let p = myproc();

    if ptr::eq(p, unsafe { INIT_PROC }) {
        panic!("init exiting");
    }

    // Close all open files.
    for fd in 0..NOFILE {
        if !p.ofile[fd].is_null() {
            let f = p.ofile[fd];
            p.ofile[fd] = ptr::null_mut();
            crate::file::file::fileclose(unsafe { &mut *f });
        }
    }

    if !p.cwd.is_null() {
        crate::log::begin_op();
        unsafe { (*p.cwd).iput(); }
        crate::log::end_op();
        p.cwd = ptr::null_mut();
    }

    unsafe {
        WAIT_LOCK.acquire();

        reparent(p as *mut Proc);

        // Parent might be sleeping in wait().
        wakeup(p.parent as *const Proc);

        p.lock.acquire();

        p.xstate = status;
        p.state = ZOMBIE;

        WAIT_LOCK.release();
    }

    sched();
    unreachable!("zombie exit");
}

// Wait for a child process to exit and return its pid.
// Return -1 if this process has no children.
pub fn wait(addr: usize) -> i32 {
    let p = myproc();

    unsafe {
        WAIT_LOCK.acquire();
    }

    loop {
        let mut havekids = false;
        for i in 0..NPROC {
            let np = unsafe { &mut PROCS[i] };
            if ptr::eq(np.parent, p as *const Proc as *mut Proc) {
                np.lock.acquire();
                havekids = true;
                if np.state == ZOMBIE {
                    let pid = np.pid;
                    if addr != 0
                        && copyout(
                            unsafe { &mut *p.pagetable },
                            addr,
                            &np.xstate as *const i32 as *const u8,
                            mem::size_of::<i32>(),
                        ) < 0
                    {
                        np.lock.release();
                        unsafe { WAIT_LOCK.release(); }
                        return -1;
                    }
                    freeproc(np);
                    np.lock.release();
                    unsafe { WAIT_LOCK.release(); }
                    return pid as i32;
                }
                np.lock.release();
            }
        }

        if !havekids || p.killed() {
            unsafe { WAIT_LOCK.release(); }
            return -1;
        }

        sleep(p as *const Proc, unsafe { &mut WAIT_LOCK });
    }
}

// Per-CPU process scheduler.
// Each CPU calls scheduler() after setting itself up.
// Scheduler never returns. It loops, doing:
//  - choose a process to run.
//  - swtch to start running that process.
//  - eventually that process transfers control
//    via swtch back to the scheduler.
pub fn scheduler() -> ! {
    let c = mycpu();
    c.proc = ptr::null_mut();

    loop {
        // avoid deadlock by ensuring devices can interrupt.
        intr_on();

        for i in 0..NPROC {
            let p = unsafe { &mut PROCS[i] };
            p.lock.acquire();
            if p.state == RUNNABLE {
                // Switch to chosen process. It is the process's job
                // to release its lock and then reacquire it
                // before jumping back to us.
                p.state = RUNNING;
                c.proc = p as *mut Proc;

                unsafe { swtch(&mut c.context, &mut p.context) };

                // Process is done running for now.
                // It should have changed its p->state before coming back.
                c.proc = ptr::null_mut();
            }
            p.lock.release();
        }
    }
}

// Switch to scheduler. Must hold only p->lock and have changed
// proc's state. Saves and restores intena because intena is a
// property of this kernel thread, not this CPU.
fn sched() {
    let p = myproc();

    if p.state == RUNNING {
        panic!("sched running");
    }
    if intr_get() {
        panic!("sched interruptible");
    }

    let intena = mycpu().intena;
    unsafe { swtch(&mut p.context, &mut mycpu().context) };
    mycpu().intena = intena;
}

// Give up the CPU for one scheduling round.
pub fn proc_yield() {
    let p = myproc();
    p.lock.acquire();
    p.state = RUNNABLE;
    sched();
    p.lock.release();
}

// Atomically release lock and sleep on chan.
// Reacquires lock when awakened.
pub fn sleep<T>(chan: *const T, lk: &mut Spinlock) {
    let p = myproc();

    // Must acquire p->lock in order to change p->state and then call
    // sched. Once we hold p->lock, we can be guaranteed that we won't
    // miss any wakeup (wakeup locks p->lock), so it's okay to release
    // lk.
    p.lock.acquire();
    lk.release();

    p.chan = chan as *const u8;
    p.state = SLEEPING;

    sched();

    // Tidy up.
    p.chan = ptr::null();

    p.lock.release();
    lk.acquire();
}

// Wake up all processes sleeping on chan.
// Must be called without any p->lock held.
pub fn wakeup<T>(chan: *const T) {
    let chan = chan as *const u8;
    let caller = myproc() as *const Proc;
    for i in 0..NPROC {
        let p = unsafe { &mut PROCS[i] };
        if p as *const Proc != caller {
            p.lock.acquire();
            if p.state == SLEEPING && p.chan == chan {
                p.state = RUNNABLE;
            }
            p.lock.release();
        }
    }
}

// Kill the process with the given pid.
// The victim won't exit until it tries to return
// to user space (see usertrap() in trap.rs).
pub fn kill(pid: u32) -> i32 {
    for i in 0..NPROC {
        let p = unsafe { &mut PROCS[i] };
        p.lock.acquire();
        if p.pid == pid {
            p.killed = 1;
            if p.state == SLEEPING {
                // Wake process from sleep().
                p.state = RUNNABLE;
            }
            p.lock.release();
            return 0;
        }
        p.lock.release();
    }
    -1
}

pub fn killed(p: &mut Proc) -> bool {
    p.killed()
}

pub fn setkilled(p: &mut Proc) {
    p.setkilled()
}

// Copy to either a user address, or kernel address,
// depending on usr_dst.
// Returns 0 on success, -1 on error.
pub fn either_copyout(user_dst: bool, dst: *mut u8, src: *const u8, len: usize) -> i32 {
    let p = myproc();
    if user_dst {
        copyout(unsafe { &mut *p.pagetable }, dst as usize, src, len)
    } else {
        crate::string::memmove(dst, src, len);
        0
    }
}

// Copy from either a user address, or kernel address,
// depending on usr_src.
// Returns 0 on success, -1 on error.
pub fn either_copyin(dst: *mut u8, user_src: bool, src: *const u8, len: usize) -> i32 {
    let p = myproc();
    if user_src {
        copyin(unsafe { &mut *p.pagetable }, dst, src as usize, len)
    } else {
        crate::string::memmove(dst, src, len);
        0
    }
}

// Print a process listing to the console, for debugging.
// Runs when a user types ^P on the console.
// No lock to avoid wedging a stuck machine further.
pub fn procdump() {
    printf!("\n");
    for i in 0..NPROC {
        let p = unsafe { &PROCS[i] };
        if p.state == UNUSED {
            continue;
        }
        let state = match p.state {
            UNUSED => "unused",
            USED => "used",
            SLEEPING => "sleep ",
            RUNNABLE => "runble",
            RUNNING => "run   ",
            ZOMBIE => "zombie",
        };
        printf!("{} {}\n", p.pid, state);
    }
}
