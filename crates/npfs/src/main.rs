//! npfs is a userspace server which exports a directory tree over 9P2000.
//!
//! By default it exports `/` over TCP on port 5640.

use {
    async_trait::async_trait,
    clap::Parser,
    filetime::FileTime,
    ninep::{
        session::OpCtx,
        srv::{srv_async, Backend, Walked},
        *,
    },
    std::{
        io::SeekFrom,
        os::unix::fs::PermissionsExt,
        path::{Path, PathBuf},
    },
    tokio::{
        fs,
        io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt},
        sync::{Mutex, RwLock},
    },
    tokio_stream::{wrappers::ReadDirStream, StreamExt},
};

mod utils;
use crate::utils::*;

/// Per-fid state: the real path behind the fid, the open file when the fid
/// denotes one, and the marshalled directory listing for sequential reads.
#[derive(Debug, Default)]
struct NpfsFid {
    realpath: RwLock<PathBuf>,
    file: Mutex<Option<fs::File>>,
    dirbuf: Mutex<Option<Vec<u8>>>,
}

impl NpfsFid {
    fn with_path(path: PathBuf) -> NpfsFid {
        NpfsFid {
            realpath: RwLock::new(path),
            ..Default::default()
        }
    }
}

#[derive(Clone)]
struct Npfs {
    realroot: PathBuf,
    uname: String,
}

fn open_options(mode: u8) -> fs::OpenOptions {
    let mut opts = fs::OpenOptions::new();
    match mode & om::ACCESS_MASK {
        om::WRITE => {
            opts.write(true);
        }
        om::RDWR => {
            opts.read(true).write(true);
        }
        // READ and EXEC both read
        _ => {
            opts.read(true);
        }
    }
    if mode & om::TRUNC != 0 {
        opts.write(true).truncate(true);
    }
    opts
}

fn check_name(name: &str) -> ninep::Result<()> {
    if name.is_empty() || name.contains('/') || name == "." || name == ".." {
        return Err(Error::server("invalid file name"));
    }
    Ok(())
}

impl Npfs {
    /// Marshal the stat records of every entry in `path`, in one pass.
    async fn enumerate(&self, path: &Path) -> ninep::Result<Vec<u8>> {
        let mut entries = ReadDirStream::new(fs::read_dir(path).await?);
        let mut buf = Vec::new();

        while let Some(entry) = entries.next().await {
            let entry = entry?;
            let attr = entry.metadata().await?;
            let name = entry.file_name().to_string_lossy().into_owned();
            marshal_stat(&mut buf, &stat_from_attr(&attr, &name, &self.uname))?;
        }
        Ok(buf)
    }
}

#[async_trait]
impl Backend for Npfs {
    type Handle = NpfsFid;

    async fn attach(
        &self,
        _ctx: &OpCtx,
        _afid: Option<&NpfsFid>,
        _uname: &str,
        _aname: &str,
    ) -> ninep::Result<(Qid, NpfsFid)> {
        let qid = get_qid(&self.realroot).await?;
        Ok((qid, NpfsFid::with_path(self.realroot.clone())))
    }

    async fn walk(
        &self,
        _ctx: &OpCtx,
        from: &NpfsFid,
        wnames: &[String],
    ) -> ninep::Result<Walked<NpfsFid>> {
        let mut path = from.realpath.read().await.clone();
        let mut wqids = Vec::new();

        for (i, name) in wnames.iter().enumerate() {
            let step = async {
                match name.as_str() {
                    // ".." stays put at the export root
                    ".." => {
                        if path != self.realroot {
                            path.pop();
                        }
                    }
                    "." => {}
                    _ => {
                        check_name(name)?;
                        path.push(name);
                    }
                }
                get_qid(&path).await
            };

            match step.await {
                Ok(qid) => wqids.push(qid),
                Err(e) => {
                    if i == 0 {
                        return Err(e);
                    }
                    return Ok(Walked {
                        wqids,
                        handle: None,
                    });
                }
            }
        }

        Ok(Walked {
            wqids,
            handle: Some(NpfsFid::with_path(path)),
        })
    }

    async fn open(&self, _ctx: &OpCtx, fid: &NpfsFid, mode: u8) -> ninep::Result<(Qid, u32)> {
        let path = fid.realpath.read().await.clone();
        let qid = get_qid(&path).await?;

        if qid.typ.contains(QidType::DIR) {
            let access = mode & om::ACCESS_MASK;
            if access == om::WRITE || access == om::RDWR || mode & om::TRUNC != 0 {
                return Err(Error::server("is a directory"));
            }
            // The listing is built on the first read.
        } else {
            let file = open_options(mode).open(&path).await?;
            *fid.file.lock().await = Some(file);
        }

        Ok((qid, 0))
    }

    async fn create(
        &self,
        _ctx: &OpCtx,
        dir: &NpfsFid,
        name: &str,
        perm: u32,
        mode: u8,
    ) -> ninep::Result<(Qid, u32, NpfsFid)> {
        check_name(name)?;
        let path = dir.realpath.read().await.join(name);
        let newfid = NpfsFid::with_path(path.clone());

        if perm & dm::DIR != 0 {
            let mut builder = fs::DirBuilder::new();
            builder.mode(perm & 0o777);
            builder.create(&path).await?;
        } else {
            let mut opts = open_options(mode);
            opts.write(true).create_new(true).mode(perm & 0o777);
            let file = opts.open(&path).await?;
            *newfid.file.lock().await = Some(file);
        }

        Ok((get_qid(&path).await?, 0, newfid))
    }

    async fn read(
        &self,
        _ctx: &OpCtx,
        fid: &NpfsFid,
        offset: u64,
        count: u32,
    ) -> ninep::Result<Vec<u8>> {
        {
            let mut file = fid.file.lock().await;
            if let Some(file) = file.as_mut() {
                file.seek(SeekFrom::Start(offset)).await?;
                let mut buf = vec![0; count as usize];
                let bytes = file.read(&mut buf[..]).await?;
                buf.truncate(bytes);
                return Ok(buf);
            }
        }

        // Directory: enumerate once, then serve whole stat records in order.
        // An offset of 0 restarts the enumeration.
        let path = fid.realpath.read().await.clone();
        let mut dirbuf = fid.dirbuf.lock().await;
        let records = match dirbuf.as_ref() {
            Some(records) if offset != 0 => records,
            _ => dirbuf.insert(self.enumerate(&path).await?),
        };

        Ok(whole_records(records, offset as usize, count as usize).to_vec())
    }

    async fn write(
        &self,
        _ctx: &OpCtx,
        fid: &NpfsFid,
        offset: u64,
        data: &[u8],
    ) -> ninep::Result<u32> {
        let mut file = fid.file.lock().await;
        let file = file
            .as_mut()
            .ok_or_else(|| Error::server("fid not open for write"))?;
        file.seek(SeekFrom::Start(offset)).await?;
        Ok(file.write(data).await? as u32)
    }

    async fn remove(&self, _ctx: &OpCtx, fid: &NpfsFid) -> ninep::Result<()> {
        let path = fid.realpath.read().await.clone();
        if path == self.realroot {
            return Err(Error::server("cannot remove the export root"));
        }

        match fs::metadata(&path).await? {
            ref attr if attr.is_dir() => fs::remove_dir(&path).await?,
            _ => fs::remove_file(&path).await?,
        };
        Ok(())
    }

    async fn stat(&self, _ctx: &OpCtx, fid: &NpfsFid) -> ninep::Result<Stat> {
        let path = fid.realpath.read().await.clone();
        let attr = fs::metadata(&path).await?;
        let name = match path.file_name() {
            Some(name) => name.to_string_lossy().into_owned(),
            None => "/".to_owned(),
        };
        Ok(stat_from_attr(&attr, &name, &self.uname))
    }

    async fn wstat(&self, _ctx: &OpCtx, fid: &NpfsFid, stat: &Stat) -> ninep::Result<()> {
        let path = fid.realpath.read().await.clone();

        if stat.mode != !0 {
            fs::set_permissions(&path, PermissionsExt::from_mode(stat.mode & 0o777)).await?;
        }

        if stat.length != !0 {
            fs::OpenOptions::new()
                .write(true)
                .open(&path)
                .await?
                .set_len(stat.length)
                .await?;
        }

        if stat.atime != !0 || stat.mtime != !0 {
            let attr = fs::metadata(&path).await?;
            let atime = if stat.atime != !0 {
                FileTime::from_unix_time(stat.atime as i64, 0)
            } else {
                FileTime::from_last_access_time(&attr)
            };
            let mtime = if stat.mtime != !0 {
                FileTime::from_unix_time(stat.mtime as i64, 0)
            } else {
                FileTime::from_last_modification_time(&attr)
            };

            let target = path.clone();
            tokio::task::spawn_blocking(move || filetime::set_file_times(target, atime, mtime))
                .await
                .map_err(|e| Error::Io(std::io::Error::other(e)))??;
        }

        // Rename goes last so the other updates see the old path. An empty
        // name means no rename.
        if !stat.name.is_empty() {
            check_name(&stat.name)?;
            if path == self.realroot {
                return Err(Error::server("cannot rename the export root"));
            }
            let newpath = match path.parent() {
                Some(parent) => parent.join(&stat.name),
                None => return Err(Error::server("cannot rename the export root")),
            };
            fs::rename(&path, &newpath).await?;
            *fid.realpath.write().await = newpath;
        }

        Ok(())
    }
}

#[derive(Debug, clap::Parser)]
struct Cli {
    /// proto!address!port
    /// where: proto = tcp | unix
    #[arg(default_value = "tcp!0.0.0.0!5640")]
    address: String,

    /// Directory to export
    #[arg(default_value = "/")]
    exportdir: PathBuf,

    /// Owner name reported in stat records
    #[arg(long, default_value = "none")]
    uname: String,
}

async fn npfs_main(
    Cli {
        address,
        exportdir,
        uname,
    }: Cli,
) -> ninep::Result<i32> {
    let exportdir = fs::canonicalize(&exportdir).await?;
    if !fs::metadata(&exportdir).await?.is_dir() {
        return Err(Error::server("export root must be a directory"));
    }

    println!("[*] Exporting: {}", exportdir.display());
    println!("[*] Ready to accept clients: {}", address);
    srv_async(
        Npfs {
            realroot: exportdir,
            uname,
        },
        &address,
    )
    .await
    .and(Ok(0))
}

#[tokio::main]
async fn main() {
    env_logger::init();

    let exit_code = npfs_main(Cli::parse()).await.unwrap_or_else(|e| {
        eprintln!("Error: {:?}", e);
        -1
    });

    std::process::exit(exit_code);
}

#[cfg(test)]
mod tests {
    use super::*;
    use ninep::serialize::Decodable;
    use std::io::Cursor;
    use std::sync::Arc;
    use tokio_util::sync::CancellationToken;

    fn ctx() -> OpCtx {
        OpCtx {
            cancel: CancellationToken::new(),
            peer: Arc::from("test"),
            request_id: 0,
        }
    }

    fn scratch(tag: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("npfs-test-{}-{}", tag, std::process::id()));
        let _ = std::fs::remove_dir_all(&dir);
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn server(root: &Path) -> Npfs {
        Npfs {
            realroot: root.to_owned(),
            uname: "none".to_owned(),
        }
    }

    #[tokio::test]
    async fn walk_partial_returns_prefix_without_handle() {
        let root = scratch("walk-partial");
        std::fs::create_dir(root.join("etc")).unwrap();
        std::fs::write(root.join("etc/hosts"), b"127.0.0.1\n").unwrap();

        let fs = server(&root);
        let (_, rootfid) = fs.attach(&ctx(), None, "none", "").await.unwrap();

        let walked = fs
            .walk(
                &ctx(),
                &rootfid,
                &["etc".to_owned(), "missing".to_owned(), "more".to_owned()],
            )
            .await
            .unwrap();
        assert_eq!(walked.wqids.len(), 1);
        assert!(walked.handle.is_none());

        // A failure on the first element is an error instead.
        assert!(fs
            .walk(&ctx(), &rootfid, &["missing".to_owned()])
            .await
            .is_err());
    }

    #[tokio::test]
    async fn dotdot_stays_at_the_root() {
        let root = scratch("walk-dotdot");
        let fs = server(&root);
        let (root_qid, rootfid) = fs.attach(&ctx(), None, "none", "").await.unwrap();

        let walked = fs
            .walk(&ctx(), &rootfid, &["..".to_owned(), "..".to_owned()])
            .await
            .unwrap();
        assert_eq!(walked.wqids, vec![root_qid, root_qid]);
        let dest = walked.handle.unwrap();
        assert_eq!(*dest.realpath.read().await, root);
    }

    #[tokio::test]
    async fn directory_read_covers_every_entry_once() {
        let root = scratch("dir-read");
        for name in ["a", "b", "c"] {
            std::fs::write(root.join(name), name.as_bytes()).unwrap();
        }

        let fs = server(&root);
        let (_, rootfid) = fs.attach(&ctx(), None, "none", "").await.unwrap();
        fs.open(&ctx(), &rootfid, om::READ).await.unwrap();

        // First read returns whole records only; the count is picked so that
        // it cannot hold all three.
        let full = fs.read(&ctx(), &rootfid, 0, 8192).await.unwrap();
        let first = fs.read(&ctx(), &rootfid, 0, full.len() as u32 - 1).await.unwrap();
        assert!(!first.is_empty() && first.len() < full.len());

        let rest = fs
            .read(&ctx(), &rootfid, first.len() as u64, 8192)
            .await
            .unwrap();
        assert_eq!(first.len() + rest.len(), full.len());

        let eof = fs.read(&ctx(), &rootfid, full.len() as u64, 8192).await.unwrap();
        assert!(eof.is_empty());

        // The concatenation parses into one stat per entry.
        let mut names = Vec::new();
        let mut cur = Cursor::new([first, rest].concat());
        while (cur.position() as usize) < cur.get_ref().len() {
            let stat = Stat::decode(&mut cur).unwrap();
            names.push(stat.name);
        }
        names.sort();
        assert_eq!(names, vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn create_write_read_remove() {
        let root = scratch("create");
        let fs = server(&root);
        let (_, rootfid) = fs.attach(&ctx(), None, "none", "").await.unwrap();

        let (qid, _, newfid) = fs
            .create(&ctx(), &rootfid, "hello", 0o644, om::RDWR)
            .await
            .unwrap();
        assert!(!qid.typ.contains(QidType::DIR));

        assert_eq!(fs.write(&ctx(), &newfid, 0, b"hi there").await.unwrap(), 8);
        assert_eq!(fs.read(&ctx(), &newfid, 3, 64).await.unwrap(), b"there");

        fs.remove(&ctx(), &newfid).await.unwrap();
        assert!(!root.join("hello").exists());
    }

    #[tokio::test]
    async fn wstat_renames_and_truncates() {
        let root = scratch("wstat");
        std::fs::write(root.join("old"), b"0123456789").unwrap();

        let fs = server(&root);
        let (_, rootfid) = fs.attach(&ctx(), None, "none", "").await.unwrap();
        let walked = fs.walk(&ctx(), &rootfid, &["old".to_owned()]).await.unwrap();
        let fid = walked.handle.unwrap();

        let mut change = Stat::no_change();
        change.name = "new".to_owned();
        change.length = 4;
        fs.wstat(&ctx(), &fid, &change).await.unwrap();

        assert!(!root.join("old").exists());
        assert_eq!(std::fs::read(root.join("new")).unwrap(), b"0123");

        // All-sentinel wstat changes nothing.
        fs.wstat(&ctx(), &fid, &Stat::no_change()).await.unwrap();
        assert_eq!(std::fs::read(root.join("new")).unwrap(), b"0123");
    }

    #[tokio::test]
    async fn open_refuses_writable_directory() {
        let root = scratch("open-dir");
        let fs = server(&root);
        let (_, rootfid) = fs.attach(&ctx(), None, "none", "").await.unwrap();

        assert!(fs.open(&ctx(), &rootfid, om::RDWR).await.is_err());
        assert!(fs.open(&ctx(), &rootfid, om::READ | om::TRUNC).await.is_err());
        assert!(fs.open(&ctx(), &rootfid, om::READ).await.is_ok());
    }
}
