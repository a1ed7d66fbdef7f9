// File status, shared between the kernel's view of an inode and the
// stat() system call's result handed back to user space.

#[derive(Copy, Clone, Eq, PartialEq)]
#[repr(i16)]
pub enum FileType {
    NO_TYPE = 0,
    T_DIR = 1,    // Directory
    T_FILE = 2,   // File
    T_DEVICE = 3, // Device
}

#[repr(C)]
pub struct Stat {
    pub dev: i32,            // File system's disk device
    pub ino: u32,            // Inode number
    pub file_type: FileType, // Type of file
    pub nlink: i16,          // Number of links to file
    pub size: u64,           // Size of file in bytes
}
