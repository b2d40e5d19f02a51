use {
    ninep::{fcall::*, serialize::Encodable},
    std::{fs::Metadata, os::unix::prelude::*, path::Path},
    tokio::fs,
};

pub async fn get_qid<T: AsRef<Path> + ?Sized>(path: &T) -> ninep::Result<Qid> {
    Ok(qid_from_attr(&fs::metadata(path.as_ref()).await?))
}

pub fn qid_from_attr(attr: &Metadata) -> Qid {
    Qid {
        typ: From::from(attr.file_type()),
        version: 0,
        path: attr.ino(),
    }
}

/// Build the 9P stat record for a file, naming its owner `uname`.
pub fn stat_from_attr(attr: &Metadata, name: &str, uname: &str) -> Stat {
    let mut mode = attr.permissions().mode() & 0o777;
    if attr.is_dir() {
        mode |= dm::DIR;
    }

    Stat {
        typ: 0,
        dev: 0,
        qid: qid_from_attr(attr),
        mode,
        atime: attr.atime() as u32,
        mtime: attr.mtime() as u32,
        length: if attr.is_dir() { 0 } else { attr.len() },
        name: name.to_owned(),
        uid: uname.to_owned(),
        gid: uname.to_owned(),
        muid: uname.to_owned(),
    }
}

/// Append the wire form of `stat` to `buf`.
pub fn marshal_stat(buf: &mut Vec<u8>, stat: &Stat) -> ninep::Result<()> {
    stat.encode(buf)?;
    Ok(())
}

/// The longest run of whole stat records in `buf[offset..]` that fits in
/// `count` bytes. Directory reads must never split a record.
pub fn whole_records(buf: &[u8], offset: usize, count: usize) -> &[u8] {
    if offset >= buf.len() {
        return &[];
    }

    let mut end = offset;
    while end + 2 <= buf.len() {
        let rec = 2 + u16::from_le_bytes([buf[end], buf[end + 1]]) as usize;
        if end + rec > buf.len() || end + rec - offset > count {
            break;
        }
        end += rec;
    }

    &buf[offset..end]
}
