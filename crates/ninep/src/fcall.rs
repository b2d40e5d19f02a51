//! 9P protocol data types and constants.
//!
//! # Protocol
//! 9P2000

use std::mem::{size_of, size_of_val};

use bitflags::bitflags;
use enum_primitive::*;

/// 9P2000 version string
pub const P92000: &str = "9P2000";

/// The version string that comes with `Rversion` when the server does not
/// understand the client's version string
pub const VERSION_UNKNOWN: &str = "unknown";

/*
 * 9P magic numbers
 */
/// Special tag which `Tversion`/`Rversion` must use as `tag`
pub const NOTAG: u16 = !0;

/// Special value which `Tattach` with no auth must use as `afid`
///
/// If the client does not wish to authenticate the connection, or knows that
/// authentication is not required, the afid field in the attach message should
/// be set to `NOFID`
pub const NOFID: u32 = !0;

/// Maximum number of path elements a single `Twalk` may carry
pub const MAXWELEM: usize = 16;

/// Ample room for `Twrite`/`Rread` header
///
/// size[4] Tread/Twrite[1] tag[2] fid[4] offset[8] count[4]
pub const IOHDRSZ: u32 = 24;

/// Default maximum message size the server will negotiate down from
pub const DEFAULT_MSIZE: u32 = 64 * 1024;

/// Smallest legal frame: size[4] type[1] tag[2]
pub const HDRSZ: u32 = 7;

/// The type of I/O
///
/// Open mode to be checked against the permissions for the file.
pub mod om {
    /// Open for read
    pub const READ: u8 = 0;
    /// Write
    pub const WRITE: u8 = 1;
    /// Read and write
    pub const RDWR: u8 = 2;
    /// Execute, == read but check execute permission
    pub const EXEC: u8 = 3;
    /// Mask selecting one of the four access modes above
    pub const ACCESS_MASK: u8 = 3;
    /// Or'ed in (except for exec), truncate file first
    pub const TRUNC: u8 = 0x10;
    /// Or'ed in, close on exec
    pub const CEXEC: u8 = 0x20;
    /// Or'ed in, remove on close
    pub const RCLOSE: u8 = 0x40;
    /// Or'ed in, direct I/O hint
    pub const DIRECT: u8 = 0x80;
}

/// Bits in Stat.mode
pub mod dm {
    /// Mode bit for directories
    pub const DIR: u32 = 0x80000000;
    /// Mode bit for append only files
    pub const APPEND: u32 = 0x40000000;
    /// Mode bit for exclusive use files
    pub const EXCL: u32 = 0x20000000;
    /// Mode bit for mounted channel
    pub const MOUNT: u32 = 0x10000000;
    /// Mode bit for authentication file
    pub const AUTH: u32 = 0x08000000;
    /// Mode bit for non-backed-up files
    pub const TMP: u32 = 0x04000000;
    /// Mode bit for read permission
    pub const READ: u32 = 0x4;
    /// Mode bit for write permission
    pub const WRITE: u32 = 0x2;
    /// Mode bit for execute permission
    pub const EXEC: u32 = 0x1;
}

bitflags! {
    /// Bits in Qid.typ
    ///
    /// QidType can be constructed from std::fs::FileType via From trait
    ///
    /// # Protocol
    /// 9P2000
    #[derive(Copy, Debug, Default, Clone, PartialEq, Eq, PartialOrd, Ord)]
    pub struct QidType: u8 {
        #[doc = "Type bit for directories"]
        const DIR       = 0x80;
        #[doc = "Type bit for append only files"]
        const APPEND    = 0x40;
        #[doc = "Type bit for exclusive use files"]
        const EXCL      = 0x20;
        #[doc = "Type bit for mounted channel"]
        const MOUNT     = 0x10;
        #[doc = "Type bit for authentication file"]
        const AUTH      = 0x08;
        #[doc = "Type bit for not-backed-up file"]
        const TMP       = 0x04;
        #[doc = "Plain file"]
        const FILE      = 0x00;
    }
}

impl From<std::fs::FileType> for QidType {
    fn from(typ: std::fs::FileType) -> Self {
        From::from(&typ)
    }
}

impl<'a> From<&'a std::fs::FileType> for QidType {
    fn from(typ: &'a std::fs::FileType) -> Self {
        if typ.is_dir() {
            QidType::DIR
        } else {
            QidType::FILE
        }
    }
}

/// Server side data type for path tracking
///
/// The server's unique identification for the file being accessed. Two files
/// in the same hierarchy are the same file if and only if their qids' `path`
/// fields are equal.
///
/// # Protocol
/// 9P2000
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord)]
pub struct Qid {
    /// Specify whether the file is a directory, append-only file, etc.
    pub typ: QidType,
    /// Version number for a file; typically, it is incremented every time the file is modified
    pub version: u32,
    /// An integer which is unique among all files in the hierarchy
    pub path: u64,
}

impl Qid {
    /// Wire size of a qid: typ[1] version[4] path[8]
    pub fn size(&self) -> u32 {
        (size_of::<u8>() + size_of::<u32>() + size_of::<u64>()) as u32
    }
}

/// Plan 9 namespace metadata (somewhat like a unix fstat)
///
/// On the wire a stat carries a 16-bit size prefix covering the bytes that
/// follow it. `Twstat` and `Rstat` wrap the record in one more 16-bit length
/// field; the codec preserves that quirk.
///
/// A stat whose integer fields are all `!0` of the appropriate width and
/// whose strings are all empty requests no changes when sent in `Twstat`.
///
/// # Protocol
/// 9P2000
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct Stat {
    /// Server type
    pub typ: u16,
    /// Server subtype
    pub dev: u32,
    /// Unique id from server
    pub qid: Qid,
    /// Permissions, `dm` bits in the high byte and unix-like bits in the low 9
    pub mode: u32,
    /// Last read time, seconds since the epoch
    pub atime: u32,
    /// Last write time, seconds since the epoch
    pub mtime: u32,
    /// File length
    pub length: u64,
    /// Last element of path
    pub name: String,
    /// Owner name
    pub uid: String,
    /// Group name
    pub gid: String,
    /// Last modifier name
    pub muid: String,
}

impl Stat {
    /// Get the wire size of the stat, excluding its own 16-bit size prefix
    pub fn size(&self) -> u16 {
        (size_of_val(&self.typ)
            + size_of_val(&self.dev)
            + self.qid.size() as usize
            + size_of_val(&self.mode)
            + size_of_val(&self.atime)
            + size_of_val(&self.mtime)
            + size_of_val(&self.length)
            + (size_of::<u16>() * 4)
            + self.name.len()
            + self.uid.len()
            + self.gid.len()
            + self.muid.len()) as u16
    }

    /// A stat requesting no changes when sent in `Twstat`
    pub fn no_change() -> Stat {
        Stat {
            typ: !0,
            dev: !0,
            qid: Qid {
                typ: QidType::from_bits_retain(!0),
                version: !0,
                path: !0,
            },
            mode: !0,
            atime: !0,
            mtime: !0,
            length: !0,
            name: String::new(),
            uid: String::new(),
            gid: String::new(),
            muid: String::new(),
        }
    }
}

/// Data type used in `Rread` and `Twrite`
///
/// # Protocol
/// 9P2000
#[derive(Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord)]
pub struct Data(pub Vec<u8>);

enum_from_primitive! {
    #[doc = "Message type, 9P operations"]
    #[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
    pub enum MsgType {
        Tversion        = 100,
        Rversion,
        Tauth           = 102,
        Rauth,
        Tattach         = 104,
        Rattach,
        Terror          = 106,  // Illegal, never sent
        Rerror,
        Tflush          = 108,
        Rflush,
        Twalk           = 110,
        Rwalk,
        Topen           = 112,
        Ropen,
        Tcreate         = 114,
        Rcreate,
        Tread           = 116,
        Rread,
        Twrite          = 118,
        Rwrite,
        Tclunk          = 120,
        Rclunk,
        Tremove         = 122,
        Rremove,
        Tstat           = 124,
        Rstat,
        Twstat          = 126,
        Rwstat,
    }
}

impl MsgType {
    /// If the message type is a T-message a client may legally send
    pub fn is_t(&self) -> bool {
        *self != MsgType::Terror && !self.is_r()
    }

    /// Protocol name of the message type, e.g. "Twalk"
    pub fn name(&self) -> &'static str {
        use crate::MsgType::*;

        match *self {
            Tversion => "Tversion",
            Rversion => "Rversion",
            Tauth => "Tauth",
            Rauth => "Rauth",
            Tattach => "Tattach",
            Rattach => "Rattach",
            Terror => "Terror",
            Rerror => "Rerror",
            Tflush => "Tflush",
            Rflush => "Rflush",
            Twalk => "Twalk",
            Rwalk => "Rwalk",
            Topen => "Topen",
            Ropen => "Ropen",
            Tcreate => "Tcreate",
            Rcreate => "Rcreate",
            Tread => "Tread",
            Rread => "Rread",
            Twrite => "Twrite",
            Rwrite => "Rwrite",
            Tclunk => "Tclunk",
            Rclunk => "Rclunk",
            Tremove => "Tremove",
            Rremove => "Rremove",
            Tstat => "Tstat",
            Rstat => "Rstat",
            Twstat => "Twstat",
            Rwstat => "Rwstat",
        }
    }

    /// If the message type is an R-message
    pub fn is_r(&self) -> bool {
        use crate::MsgType::*;

        matches!(
            *self,
            Rversion
                | Rauth
                | Rattach
                | Rerror
                | Rflush
                | Rwalk
                | Ropen
                | Rcreate
                | Rread
                | Rwrite
                | Rclunk
                | Rremove
                | Rstat
                | Rwstat
        )
    }
}

impl<'a> From<&'a Fcall> for MsgType {
    fn from(fcall: &'a Fcall) -> MsgType {
        match *fcall {
            Fcall::Tversion { .. } => MsgType::Tversion,
            Fcall::Rversion { .. } => MsgType::Rversion,
            Fcall::Tauth { .. } => MsgType::Tauth,
            Fcall::Rauth { .. } => MsgType::Rauth,
            Fcall::Tattach { .. } => MsgType::Tattach,
            Fcall::Rattach { .. } => MsgType::Rattach,
            Fcall::Rerror { .. } => MsgType::Rerror,
            Fcall::Tflush { .. } => MsgType::Tflush,
            Fcall::Rflush => MsgType::Rflush,
            Fcall::Twalk { .. } => MsgType::Twalk,
            Fcall::Rwalk { .. } => MsgType::Rwalk,
            Fcall::Topen { .. } => MsgType::Topen,
            Fcall::Ropen { .. } => MsgType::Ropen,
            Fcall::Tcreate { .. } => MsgType::Tcreate,
            Fcall::Rcreate { .. } => MsgType::Rcreate,
            Fcall::Tread { .. } => MsgType::Tread,
            Fcall::Rread { .. } => MsgType::Rread,
            Fcall::Twrite { .. } => MsgType::Twrite,
            Fcall::Rwrite { .. } => MsgType::Rwrite,
            Fcall::Tclunk { .. } => MsgType::Tclunk,
            Fcall::Rclunk => MsgType::Rclunk,
            Fcall::Tremove { .. } => MsgType::Tremove,
            Fcall::Rremove => MsgType::Rremove,
            Fcall::Tstat { .. } => MsgType::Tstat,
            Fcall::Rstat { .. } => MsgType::Rstat,
            Fcall::Twstat { .. } => MsgType::Twstat,
            Fcall::Rwstat => MsgType::Rwstat,
        }
    }
}

/// A data type encapsulating the various 9P messages
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum Fcall {
    Tversion {
        msize: u32,
        version: String,
    },
    Rversion {
        msize: u32,
        version: String,
    },
    Tauth {
        afid: u32,
        uname: String,
        aname: String,
    },
    Rauth {
        aqid: Qid,
    },
    Tattach {
        fid: u32,
        afid: u32,
        uname: String,
        aname: String,
    },
    Rattach {
        qid: Qid,
    },
    Rerror {
        ename: String,
    },
    Tflush {
        oldtag: u16,
    },
    Rflush,
    Twalk {
        fid: u32,
        newfid: u32,
        wnames: Vec<String>,
    },
    Rwalk {
        wqids: Vec<Qid>,
    },
    Topen {
        fid: u32,
        mode: u8,
    },
    Ropen {
        qid: Qid,
        iounit: u32,
    },
    Tcreate {
        fid: u32,
        name: String,
        perm: u32,
        mode: u8,
    },
    Rcreate {
        qid: Qid,
        iounit: u32,
    },
    Tread {
        fid: u32,
        offset: u64,
        count: u32,
    },
    Rread {
        data: Data,
    },
    Twrite {
        fid: u32,
        offset: u64,
        data: Data,
    },
    Rwrite {
        count: u32,
    },
    Tclunk {
        fid: u32,
    },
    Rclunk,
    Tremove {
        fid: u32,
    },
    Rremove,
    Tstat {
        fid: u32,
    },
    Rstat {
        stat: Stat,
    },
    Twstat {
        fid: u32,
        stat: Stat,
    },
    Rwstat,
}

impl Fcall {
    /// Get the fids which self refers to, excluding any fid it introduces
    pub fn fids(&self) -> Vec<u32> {
        match *self {
            Fcall::Tattach { afid, .. } if afid != NOFID => vec![afid],
            Fcall::Twalk { fid, .. } => vec![fid],
            Fcall::Topen { fid, .. } => vec![fid],
            Fcall::Tcreate { fid, .. } => vec![fid],
            Fcall::Tread { fid, .. } => vec![fid],
            Fcall::Twrite { fid, .. } => vec![fid],
            Fcall::Tclunk { fid } => vec![fid],
            Fcall::Tremove { fid } => vec![fid],
            Fcall::Tstat { fid } => vec![fid],
            Fcall::Twstat { fid, .. } => vec![fid],
            _ => Vec::new(),
        }
    }

    /// Get the fid which self introduces into the fid table, if any
    pub fn newfid(&self) -> Option<u32> {
        match *self {
            Fcall::Tauth { afid, .. } => Some(afid),
            Fcall::Tattach { fid, .. } => Some(fid),
            Fcall::Twalk { newfid, .. } => Some(newfid),
            _ => None,
        }
    }

    /// Get the qids which self contains
    pub fn qids(&self) -> Vec<Qid> {
        match *self {
            Fcall::Rauth { aqid } => vec![aqid],
            Fcall::Rattach { qid } => vec![qid],
            Fcall::Ropen { qid, .. } => vec![qid],
            Fcall::Rcreate { qid, .. } => vec![qid],
            Fcall::Rstat { ref stat } => vec![stat.qid],
            Fcall::Rwalk { ref wqids } => wqids.clone(),
            _ => Vec::new(),
        }
    }
}

/// Envelope for 9P messages
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct Msg {
    /// Chosen and used by the client to identify the message.
    /// The reply to the message will have the same tag
    pub tag: u16,
    /// Message body encapsulating the various 9P messages
    pub body: Fcall,
}
