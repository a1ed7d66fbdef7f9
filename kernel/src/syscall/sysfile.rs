use core::mem;

use crate::exec::exec;
use crate::file::fcntl::{O_CREATE, O_RDONLY, O_RDWR, O_TRUNC, O_WRONLY};
use crate::file::file::{fileclose, filedup, filestat, fileread, filewrite};
use crate::file::FDType::{FD_DEVICE, FD_INODE};
use crate::file::{File, INode};
use crate::fs::fs::{dirlink, dirlookup, ialloc, namei, nameiparent};
use crate::fs::Dirent;
use crate::kalloc::KMEM;
use crate::log::{begin_op, end_op};
use crate::param::{MAXARG, MAXPATH, NDEV, NOFILE};
use crate::pipe::pipealloc;
use crate::proc::myproc;
use crate::riscv::PGSIZE;
use crate::stat::FileType;
use crate::stat::FileType::{T_DEVICE, T_DIR, T_FILE};
use crate::string::strlen;
use crate::syscall::syscall::{argaddr, argint, argstr, fetchaddr, fetchstr};
use crate::vm::copyout;
use core::ptr;

// Fetch the nth word-sized system call argument as a file descriptor
// and return both the descriptor and the pointer to its File struct.
fn argfd(n: u8) -> Option<(usize, *mut File)> {
    let fd = argint(n) as i64;
    if fd < 0 || fd as usize >= NOFILE {
        return None;
    }
    let fd = fd as usize;
    let p = myproc();
    if p.ofile[fd].is_null() {
        return None;
    }
    Some((fd, p.ofile[fd]))
}

// Allocate a file descriptor for the given file.
// Takes over file reference from caller on success.
fn fdalloc(f: *mut File) -> Option<usize> {
    let p = myproc();

    for fd in 0..NOFILE {
        if p.ofile[fd].is_null() {
            p.ofile[fd] = f;
            return Some(fd);
        }
    }

    None
}

pub(crate) fn sys_dup() -> i64 {
    let (_, f) = match argfd(0) {
        Some(x) => x,
        None => return -1,
    };

    let fd = match fdalloc(f) {
        Some(fd) => fd,
        None => return -1,
    };

    filedup(f);
    fd as i64
}

pub(crate) fn sys_read() -> i64 {
    let addr = argaddr(1);
    let n = argint(2);
    let (_, f) = match argfd(0) {
        Some(x) => x,
        None => return -1,
    };

    fileread(unsafe { &mut *f }, addr, n as usize) as i64
}

pub(crate) fn sys_write() -> i64 {
    let addr = argaddr(1);
    let n = argint(2);
    let (_, f) = match argfd(0) {
        Some(x) => x,
        None => return -1,
    };

    filewrite(unsafe { &mut *f }, addr, n as usize) as i64
}

pub(crate) fn sys_close() -> i64 {
    let (fd, f) = match argfd(0) {
        Some(x) => x,
        None => return -1,
    };

    myproc().ofile[fd] = ptr::null_mut();
    fileclose(unsafe { &mut *f });
    0
}

pub(crate) fn sys_fstat() -> i64 {
    let (_, f) = match argfd(0) {
        Some(x) => x,
        None => return -1,
    };
    let st = argaddr(1);

    filestat(unsafe { &mut *f }, st) as i64
}

pub(crate) fn sys_link() -> i64 {
    let mut old: [u8; MAXPATH] = [0; MAXPATH];
    let mut new: [u8; MAXPATH] = [0; MAXPATH];

    if argstr(0, old.as_mut_ptr(), MAXPATH) < 0 || argstr(1, new.as_mut_ptr(), MAXPATH) < 0 {
        return -1;
    }

    begin_op();

    let oldlen = crate::string::strlen(old.as_ptr());
    let ip = match namei(&old[..oldlen]) {
        Some(ip) => ip,
        None => {
            end_op();
            return -1;
        }
    };

    ip.ilock();
    if ip.file_type == T_DIR {
        ip.iunlockput();
        end_op();
        return -1;
    }

    ip.nlink += 1;
    ip.iupdate();
    ip.iunlock();

    let newlen = crate::string::strlen(new.as_ptr());
    let (dp, name) = nameiparent(&new[..newlen]);
    let dp = match dp {
        Some(dp) => dp,
        None => {
            ip.ilock();
            ip.nlink -= 1;
            ip.iupdate();
            ip.iunlockput();
            end_op();
            return -1;
        }
    };

    dp.ilock();
    if dp.dev != ip.dev || dirlink(dp, name, ip.inum as u16).is_none() {
        dp.iunlockput();
        ip.ilock();
        ip.nlink -= 1;
        ip.iupdate();
        ip.iunlockput();
        end_op();
        return -1;
    }
    dp.iunlockput();
    ip.iput();

    end_op();

    0
}

fn isdirempty(dp: &mut INode) -> bool {
    let sz = mem::size_of::<Dirent>();
    let mut de = Dirent {
        inum: 0,
        name: [0; crate::fs::DIRSIZ],
    };

    let mut off = 2 * sz as u32;
    while off < dp.size {
        if dp.readi(false, &mut de, off, sz) != sz {
            panic!("isdirempty: readi");
        }
        if de.inum != 0 {
            return false;
        }
        off += sz as u32;
    }
    true
}

pub(crate) fn sys_unlink() -> i64 {
    let mut path: [u8; MAXPATH] = [0; MAXPATH];
    if argstr(0, path.as_mut_ptr(), MAXPATH) < 0 {
        return -1;
    }

    begin_op();

    let pathlen = crate::string::strlen(path.as_ptr());
    let (dp, name) = nameiparent(&path[..pathlen]);
    let dp = match dp {
        Some(dp) => dp,
        None => {
            end_op();
            return -1;
        }
    };

    dp.ilock();

    if name == b"." || name == b".." {
        dp.iunlockput();
        end_op();
        return -1;
    }

    let mut off = 0u32;
    let ip = match dirlookup(dp, name, &mut off) {
        Some(ip) => ip,
        None => {
            dp.iunlockput();
            end_op();
            return -1;
        }
    };
    ip.ilock();

    if ip.nlink < 1 {
        panic!("unlink: nlink < 1");
    }
    if ip.file_type == T_DIR && !isdirempty(ip) {
        ip.iunlockput();
        dp.iunlockput();
        end_op();
        return -1;
    }

    let de = Dirent {
        inum: 0,
        name: [0; crate::fs::DIRSIZ],
    };
    if dp.writei(false, &de as *const Dirent as *mut Dirent, off, mem::size_of::<Dirent>())
        != mem::size_of::<Dirent>() as isize
    {
        panic!("unlink: writei");
    }

    if ip.file_type == T_DIR {
        dp.nlink -= 1;
        dp.iupdate();
    }
    dp.iunlockput();

    ip.nlink -= 1;
    ip.iupdate();
    ip.iunlockput();

    end_op();

    0
}

pub(crate) fn sys_exec() -> i64 {
    let mut uarg: usize = 0;
    let uargv = argaddr(1);

    let mut path: [u8; MAXPATH] = [0; MAXPATH];
    if argstr(0, path.as_mut_ptr(), MAXPATH) < 0 {
        return -1;
    }

    let mut argv: [Option<*mut u8>; MAXARG] = [None; MAXARG];
    let mut i = 0;
    let mut bad = false;
    loop {
        if i >= argv.len() {
            bad = true;
            break;
        }

        if fetchaddr(uargv + mem::size_of::<usize>() * i, &mut uarg) < 0 {
            bad = true;
            break;
        }

        if uarg == 0 {
            argv[i] = None;
            break;
        }

        let ptr: *mut u8 = unsafe { KMEM.kalloc() };
        if ptr.is_null() {
            bad = true;
            break;
        }
        argv[i] = Some(ptr);

        if fetchstr(uarg, argv[i].unwrap(), PGSIZE) < 0 {
            bad = true;
            break;
        }

        i += 1;
    }

    let mut ret = -1;
    if !bad {
        ret = exec(&path, &argv);
    }

    for slot in argv.iter() {
        match slot {
            Some(p) => unsafe { KMEM.kfree(*p) },
            None => break,
        }
    }

    ret as i64
}

pub(crate) fn sys_open() -> i64 {
    let mut path: [u8; MAXPATH] = [0; MAXPATH];
    let omode = argint(1);
    let n = argstr(0, path.as_mut_ptr(), MAXPATH);
    if n < 0 {
        return -1;
    }
    let pathlen = n as usize;

    begin_op();

    let ip: &mut INode;
    if omode & O_CREATE != 0 {
        ip = match create(&path[..pathlen], T_FILE, 0, 0) {
            Some(ip) => ip,
            None => {
                end_op();
                return -1;
            }
        };
    } else {
        let found = match namei(&path[..pathlen]) {
            Some(ip) => ip,
            None => {
                end_op();
                return -1;
            }
        };
        found.ilock();
        if found.file_type == T_DIR && omode != O_RDONLY {
            found.iunlockput();
            end_op();
            return -1;
        }
        ip = found;
    }

    if ip.file_type == T_DEVICE && (ip.major < 0 || ip.major as usize >= NDEV) {
        ip.iunlockput();
        end_op();
        return -1;
    }

    let f = match crate::file::file::filealloc() {
        Some(f) => f,
        None => {
            ip.iunlockput();
            end_op();
            return -1;
        }
    };

    let fd = match fdalloc(f as *mut File) {
        Some(fd) => fd,
        None => {
            fileclose(f);
            ip.iunlockput();
            end_op();
            return -1;
        }
    };

    if ip.file_type == T_DEVICE {
        f.file_type = FD_DEVICE;
        f.major = ip.major;
    } else {
        f.file_type = FD_INODE;
        f.off = 0;
    }
    f.ip = ip as *mut INode;
    f.readable = omode & O_WRONLY == 0;
    f.writable = (omode & O_WRONLY) != 0 || (omode & O_RDWR) != 0;

    if (omode & O_TRUNC) != 0 && ip.file_type == T_FILE {
        ip.itrunc();
    }

    ip.iunlock();
    end_op();

    fd as i64
}

pub(crate) fn sys_mknod() -> i64 {
    begin_op();
    let major = argint(1) as i16;
    let minor = argint(2) as i16;

    let mut path = [0; MAXPATH];
    let n = argstr(0, path.as_mut_ptr(), MAXPATH);
    if n < 0 {
        end_op();
        return -1;
    }

    let ip = create(&path[..n as usize], T_DEVICE, major, minor);
    if ip.is_none() {
        end_op();
        return -1;
    }

    ip.unwrap().iunlockput();
    end_op();
    0
}

pub(crate) fn sys_mkdir() -> i64 {
    begin_op();
    let mut path: [u8; MAXPATH] = [0; MAXPATH];
    let n = argstr(0, path.as_mut_ptr(), MAXPATH);
    if n < 0 {
        end_op();
        return -1;
    }

    let ip = match create(&path[..n as usize], T_DIR, 0, 0) {
        Some(ip) => ip,
        None => {
            end_op();
            return -1;
        }
    };
    ip.iunlockput();
    end_op();
    0
}

pub(crate) fn sys_chdir() -> i64 {
    let p = myproc();

    begin_op();
    let mut path: [u8; MAXPATH] = [0; MAXPATH];
    let n = argstr(0, path.as_mut_ptr(), MAXPATH);
    if n < 0 {
        end_op();
        return -1;
    }

    let ip = match namei(&path[..n as usize]) {
        Some(ip) => ip,
        None => {
            end_op();
            return -1;
        }
    };

    ip.ilock();
    if ip.file_type != T_DIR {
        ip.iunlockput();
        end_op();
        return -1;
    }
    ip.iunlock();

    if !p.cwd.is_null() {
        unsafe { (*p.cwd).iput() };
    }
    end_op();
    p.cwd = ip as *mut INode;
    0
}

pub(crate) fn sys_pipe() -> i64 {
    let fdarray = argaddr(0);

    let (rf, wf) = match pipealloc() {
        Some(pair) => pair,
        None => return -1,
    };

    let fd0 = match fdalloc(rf) {
        Some(fd) => fd,
        None => {
            fileclose(unsafe { &mut *rf });
            fileclose(unsafe { &mut *wf });
            return -1;
        }
    };
    let fd1 = match fdalloc(wf) {
        Some(fd) => fd,
        None => {
            myproc().ofile[fd0] = ptr::null_mut();
            fileclose(unsafe { &mut *rf });
            fileclose(unsafe { &mut *wf });
            return -1;
        }
    };

    let p = myproc();
    if copyout(
        unsafe { &mut *p.pagetable },
        fdarray,
        &(fd0 as i32) as *const i32 as *const u8,
        mem::size_of::<i32>(),
    ) < 0
        || copyout(
            unsafe { &mut *p.pagetable },
            fdarray + mem::size_of::<i32>(),
            &(fd1 as i32) as *const i32 as *const u8,
            mem::size_of::<i32>(),
        ) < 0
    {
        p.ofile[fd0] = ptr::null_mut();
        p.ofile[fd1] = ptr::null_mut();
        fileclose(unsafe { &mut *rf });
        fileclose(unsafe { &mut *wf });
        return -1;
    }

    0
}

fn create<'a>(
    path: &[u8],
    file_type: FileType,
    major: i16,
    minor: i16,
) -> Option<&'a mut INode> {
    let (dp, name) = nameiparent(path);
    let dp = dp?;
    dp.ilock();

    if let Some(ip) = dirlookup(dp, name, &mut 0) {
        dp.iunlockput();
        ip.ilock();
        if file_type == T_FILE && (ip.file_type == T_FILE || ip.file_type == T_DEVICE) {
            return Some(ip);
        }
        ip.iunlockput();
        return None;
    }

    let ip = match ialloc(dp.dev, file_type) {
        Some(ip) => ip,
        None => {
            dp.iunlockput();
            return None;
        }
    };

    ip.ilock();
    ip.major = major;
    ip.minor = minor;
    ip.nlink = 1;
    ip.iupdate();

    if file_type == T_DIR {
        // Create . and .. entries. No ip->nlink++ for ".": avoid cyclic ref count.
        if dirlink(ip, b".", ip.inum as u16).is_none()
            || dirlink(ip, b"..", dp.inum as u16).is_none()
        {
            ip.nlink = 0;
            ip.iupdate();
            ip.iunlockput();
            dp.iunlockput();
            return None;
        }
    }

    if dirlink(dp, name, ip.inum as u16).is_none() {
        ip.nlink = 0;
        ip.iupdate();
        ip.iunlockput();
        dp.iunlockput();
        return None;
    }

    if file_type == T_DIR {
        // now that success is guaranteed:
        dp.nlink += 1; // for ".."
        dp.iupdate();
    }

    dp.iunlockput();

    Some(ip)
}
