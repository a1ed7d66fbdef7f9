use crate::file::FDType::FD_PIPE;
use crate::file::file::{fileclose, filealloc};
use crate::file::File;
use crate::kalloc::KMEM;
use crate::proc::{killed, myproc, sleep, wakeup};
use crate::spinlock::Spinlock;
use crate::vm::{copyin, copyout};

const PIPESIZE: usize = 512;

pub struct Pipe {
    lock: Spinlock,
    data: [u8; PIPESIZE],
    nread: u32,      // number of bytes read
    nwrite: u32,     // number of bytes written
    readopen: bool,  // read fd is still open
    writeopen: bool, // write fd is still open
}

// Allocate a pipe: a read end and a write end sharing one Pipe buffer.
// Returns the two File descriptors (already ref-counted to 1 each by
// filealloc), or None if either a file or the pipe page couldn't be
// allocated.
pub(crate) fn pipealloc() -> Option<(*mut File, *mut File)> {
    let rf = filealloc()?;
    let wf = match filealloc() {
        Some(wf) => wf,
        None => {
            fileclose(rf);
            return None;
        }
    };

    let pi: *mut Pipe = unsafe { KMEM.kalloc() };
    if pi.is_null() {
        fileclose(rf);
        fileclose(wf);
        return None;
    }

    unsafe {
        (*pi).lock = Spinlock::init_lock("pipe");
        (*pi).readopen = true;
        (*pi).writeopen = true;
        (*pi).nwrite = 0;
        (*pi).nread = 0;
        (*pi).data = [0; PIPESIZE];
    }

    rf.file_type = FD_PIPE;
    rf.readable = true;
    rf.writable = false;
    rf.pipe = pi;

    wf.file_type = FD_PIPE;
    wf.readable = false;
    wf.writable = true;
    wf.pipe = pi;

    Some((rf as *mut File, wf as *mut File))
}

impl Pipe {
    pub(crate) fn close(self: &mut Self, writable: bool) {
        self.lock.acquire();
        if writable {
            self.writeopen = false;
            wakeup(&self.nread as *const u32);
        } else {
            self.readopen = false;
            wakeup(&self.nwrite as *const u32);
        }
        if !self.readopen && !self.writeopen {
            self.lock.release();
            unsafe { KMEM.kfree(self as *mut Pipe) };
        } else {
            self.lock.release();
        }
    }

    pub(crate) fn write(self: &mut Self, addr: usize, n: i32) -> i32 {
        let p = myproc();
        let mut i = 0;

        self.lock.acquire();
        while i < n {
            if !self.readopen || killed(p) {
                self.lock.release();
                return -1;
            }
            if self.nwrite == self.nread + PIPESIZE as u32 {
                // buffer full: wake any reader, then wait for space.
                wakeup(&self.nread as *const u32);
                sleep(&self.nwrite as *const u32, &mut self.lock);
            } else {
                let mut ch: u8 = 0;
                if copyin(
                    unsafe { &mut *p.pagetable },
                    &mut ch as *mut u8,
                    addr + i as usize,
                    1,
                ) == -1
                {
                    break;
                }
                self.data[(self.nwrite as usize) % PIPESIZE] = ch;
                self.nwrite += 1;
                i += 1;
            }
        }
        wakeup(&self.nread as *const u32);
        self.lock.release();

        i
    }

    pub(crate) fn read(self: &mut Self, addr: usize, n: i32) -> i32 {
        let p = myproc();

        self.lock.acquire();

        while self.nread == self.nwrite && self.writeopen {
            if killed(p) {
                self.lock.release();
                return -1;
            }
            sleep(&self.nread as *const u32, &mut self.lock);
        }

        let mut i = 0;
        while i < n {
            if self.nread == self.nwrite {
                break;
            }
            let ch = self.data[(self.nread as usize) % PIPESIZE];
            self.nread += 1;
            if copyout(
                unsafe { &mut *p.pagetable },
                addr + i as usize,
                &ch as *const u8,
                1,
            ) == -1
            {
                break;
            }
            i += 1;
        }
        wakeup(&self.nwrite as *const u32);
        self.lock.release();

        i
    }
}
