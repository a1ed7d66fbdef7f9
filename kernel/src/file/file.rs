use core::mem::size_of;

use crate::file::FDType::{FD_DEVICE, FD_INODE, FD_NONE, FD_PIPE};
use crate::file::{File, INode, DEVSW};
use crate::log::{begin_op, end_op};
use crate::param::{MAXOPBLOCKS, NFILE};
use crate::proc::{either_copyout, myproc};
use crate::spinlock::Spinlock;
use crate::stat::{FileType, Stat};

struct FTable {
    lock: Spinlock,
    file: [File; NFILE],
}

static mut FTABLE: FTable = FTable {
    lock: Spinlock::init_lock("ftable"),
    file: [File::create(); NFILE],
};

pub fn fileinit() {
    // empty: FTABLE's statics already establish an all-free table.
}

// Allocate a file structure.
pub fn filealloc() -> Option<&'static mut File> {
    unsafe {
        FTABLE.lock.acquire();
        for f in &mut FTABLE.file {
            if f.ref_cnt == 0 {
                f.ref_cnt = 1;
                FTABLE.lock.release();
                return Some(f);
            }
        }

        FTABLE.lock.release();
        None
    }
}

// Increment ref count for file f.
pub(crate) fn filedup(f: *mut File) -> *mut File {
    unsafe {
        FTABLE.lock.acquire();
        let fr = f.as_mut().unwrap();
        if fr.ref_cnt < 1 {
            panic!("filedup");
        }
        fr.ref_cnt += 1;
        FTABLE.lock.release();
    }
    f
}

// Close file f.  (Decrement ref count, close when reaches 0.)
pub(crate) fn fileclose(f: &mut File) {
    unsafe {
        FTABLE.lock.acquire();
        if f.ref_cnt < 1 {
            panic!("fileclose");
        }

        f.ref_cnt -= 1;
        if f.ref_cnt > 0 {
            FTABLE.lock.release();
            return;
        }

        let file_type = f.file_type;
        let pipe = f.pipe;
        let writable = f.writable;
        let ip = f.ip;

        f.ref_cnt = 0;
        f.file_type = FD_NONE;
        FTABLE.lock.release();

        if file_type == FD_PIPE {
            (*pipe).close(writable);
        } else if file_type == FD_INODE || file_type == FD_DEVICE {
            begin_op();
            (*ip).iput();
            end_op();
        }
    }
}

// Get metadata about file f.
// addr is a user virtual address, pointing to a struct stat.
pub(crate) fn filestat(f: &mut File, addr: usize) -> i32 {
    let p = myproc();
    unsafe {
        if f.file_type == FD_INODE || f.file_type == FD_DEVICE {
            let ip = &mut *f.ip;
            ip.ilock();
            let st = Stat {
                dev: ip.dev as i32,
                ino: ip.inum,
                file_type: ip.file_type,
                nlink: ip.nlink,
                size: ip.size as u64,
            };
            ip.iunlock();
            if either_copyout(
                true,
                addr as *mut u8,
                &st as *const Stat as *const u8,
                size_of::<Stat>(),
            ) < 0
            {
                return -1;
            }
            return 0;
        }
    }
    -1
}

// Read from file f.
pub(crate) fn fileread(f: &mut File, addr: usize, n: usize) -> i32 {
    if !f.readable {
        return -1;
    }

    match f.file_type {
        FD_PIPE => unsafe { (*f.pipe).read(addr, n as i32) },
        FD_DEVICE => unsafe {
            if f.major < 0 || f.major as usize >= DEVSW.len() || DEVSW[f.major as usize].is_none()
            {
                return -1;
            }
            let dev = DEVSW[f.major as usize].unwrap();
            (*dev).read(true, addr, n)
        },
        FD_INODE => unsafe {
            let ip = &mut *f.ip;
            ip.ilock();
            let r = ip.readi(true, addr as *mut u8, f.off, n);
            if r > 0 {
                f.off += r as u32;
            }
            ip.iunlock();
            r as i32
        },
        FD_NONE => panic!("fileread"),
    }
}

// Write to file f.
pub(crate) fn filewrite(f: &mut File, addr: usize, n: usize) -> i32 {
    if !f.writable {
        return -1;
    }

    match f.file_type {
        FD_PIPE => unsafe { (*f.pipe).write(addr, n as i32) },
        FD_DEVICE => unsafe {
            if f.major < 0 || f.major as usize >= DEVSW.len() || DEVSW[f.major as usize].is_none()
            {
                return -1;
            }
            let dev = DEVSW[f.major as usize].unwrap();
            (*dev).write(true, addr, n)
        },
        FD_INODE => unsafe {
            // write a few blocks at a time to avoid exceeding the
            // maximum log transaction size, including i-node, indirect
            // block, allocation blocks, and 2 blocks of slop for
            // non-aligned writes.
            let max = ((MAXOPBLOCKS - 4) / 2) * crate::fs::BSIZE;
            let mut i = 0;
            let mut ret = 0i32;
            while i < n {
                let n1 = core::cmp::min(n - i, max);

                begin_op();
                let ip = &mut *f.ip;
                ip.ilock();
                let r = ip.writei(true, (addr + i) as *mut u8, f.off, n1);
                if r > 0 {
                    f.off += r as u32;
                }
                ip.iunlock();
                end_op();

                if r != n1 as isize {
                    ret = -1;
                    break;
                }
                i += r as usize;
            }
            if ret == -1 {
                -1
            } else {
                i as i32
            }
        },
        FD_NONE => panic!("filewrite"),
    }
}
