//! Linux magnetic tape ioctl definitions.
//!
//! from: /usr/include/x86_64-linux-gnu/sys/mtio.h; also see: man 4 st
//!
//! Mirrors the teacher's own `linux_mtio.rs` — same command set, trimmed to
//! the operations the Tape Controller  actually issues.

#![allow(dead_code)]

#[repr(C)]
pub struct MtOp {
    pub mt_op: i16,
    pub mt_count: libc::c_int,
}

pub const MTRESET: i16 = 0;
pub const MTFSF: i16 = 1;
pub const MTBSF: i16 = 2;
pub const MTWEOF: i16 = 5;
pub const MTREW: i16 = 6;
pub const MTOFFL: i16 = 7; // rewind and eject
pub const MTNOP: i16 = 8;
pub const MTEOM: i16 = 12; // to end of recorded media
pub const MTERASE: i16 = 13;
pub const MTSEEK: i16 = 22; // seek to block
pub const MTTELL: i16 = 23; // tell block

#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct MtGet {
    pub mt_type: libc::c_long,
    pub mt_resid: libc::c_long,
    pub mt_dsreg: libc::c_long,
    pub mt_gstat: libc::c_long,
    pub mt_erreg: libc::c_long,
    pub mt_fileno: i32,
    pub mt_blkno: i32,
}

pub const GMT_EOF: libc::c_long = 0x8000_0000_u32 as libc::c_long;
pub const GMT_BOT: libc::c_long = 0x4000_0000_u32 as libc::c_long;
pub const GMT_EOT: libc::c_long = 0x2000_0000_u32 as libc::c_long;
pub const GMT_ONLINE: libc::c_long = 0x0100_0000_u32 as libc::c_long;
pub const GMT_DR_OPEN: libc::c_long = 0x0000_4000;

// #define MTIOCTOP _IOW('m', 1, struct mtop)
nix::ioctl_write_ptr!(mtioctop, b'm', 1, MtOp);

// #define MTIOCGET _IOR('m', 2, struct mtget)
nix::ioctl_read!(mtiocget, b'm', 2, MtGet);

pub fn do_op(fd: std::os::unix::io::RawFd, op: i16, count: i32) -> nix::Result<()> {
    let arg = MtOp {
        mt_op: op,
        mt_count: count,
    };
    unsafe { mtioctop(fd, &arg) }.map(|_| ())
}

pub fn get_status(fd: std::os::unix::io::RawFd) -> nix::Result<MtGet> {
    let mut status = MtGet::default();
    unsafe { mtiocget(fd, &mut status) }?;
    Ok(status)
}
