use crate::proc::{exit, fork, growproc, kill, myproc, wait};
use crate::syscall::syscall::{argaddr, argint};
use crate::trap::{sleep_ticks, uptime};

pub(crate) fn sys_fork() -> i64 {
    fork() as i64
}

pub(crate) fn sys_exit() -> i64 {
    let n = argint(0);
    exit(n);
}

pub(crate) fn sys_wait() -> i64 {
    let addr = argaddr(0);
    wait(addr) as i64
}

pub(crate) fn sys_getpid() -> i64 {
    myproc().pid as i64
}

pub(crate) fn sys_sbrk() -> i64 {
    let n = argint(0);
    let addr = myproc().sz;
    if growproc(n) < 0 {
        return -1;
    }
    addr as i64
}

pub(crate) fn sys_sleep() -> i64 {
    let n = argint(0);
    sleep_ticks(n as u32) as i64
}

pub(crate) fn sys_kill() -> i64 {
    let pid = argint(0);
    kill(pid as u32) as i64
}

pub(crate) fn sys_uptime() -> i64 {
    uptime() as i64
}
