//! End-to-end tests driving a full server over an in-process byte stream.

use {
    async_trait::async_trait,
    ninep::{
        serialize::{self, Encodable},
        session::OpCtx,
        srv::{serve_rwc, Backend, Walked},
        *,
    },
    std::collections::{HashMap, HashSet},
    std::hash::{Hash, Hasher},
    tokio::{
        io::{AsyncReadExt, AsyncWriteExt, DuplexStream},
        sync::RwLock,
    },
};

/// A small in-memory tree:
///
/// ```text
/// /
/// ├── etc/
/// │   └── hosts
/// └── slow        (reads never complete)
/// ```
struct TestFs {
    dirs: RwLock<HashSet<String>>,
    files: RwLock<HashMap<String, Vec<u8>>>,
}

impl TestFs {
    fn new() -> TestFs {
        let mut dirs = HashSet::new();
        dirs.insert(String::new());
        dirs.insert("etc".to_owned());

        let mut files = HashMap::new();
        // Big enough that a small negotiated msize cannot return it whole.
        files.insert(
            "etc/hosts".to_owned(),
            "127.0.0.1 localhost\n".repeat(20).into_bytes(),
        );
        files.insert("slow".to_owned(), Vec::new());

        TestFs {
            dirs: RwLock::new(dirs),
            files: RwLock::new(files),
        }
    }

    async fn qid_of(&self, path: &str) -> Option<Qid> {
        if self.dirs.read().await.contains(path) {
            Some(qid(path, true))
        } else if self.files.read().await.contains_key(path) {
            Some(qid(path, false))
        } else {
            None
        }
    }

    async fn stat_of(&self, path: &str) -> Option<Stat> {
        let qid = self.qid_of(path).await?;
        let length = match self.files.read().await.get(path) {
            Some(content) => content.len() as u64,
            None => 0,
        };
        Some(make_stat(path, qid, length))
    }
}

fn qid(path: &str, dir: bool) -> Qid {
    let mut h = std::collections::hash_map::DefaultHasher::new();
    path.hash(&mut h);
    Qid {
        typ: if dir { QidType::DIR } else { QidType::FILE },
        version: 0,
        path: h.finish(),
    }
}

fn base_name(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

fn parent_of(path: &str) -> Option<&str> {
    match path.rsplit_once('/') {
        Some((parent, _)) => Some(parent),
        None if path.is_empty() => None,
        None => Some(""),
    }
}

fn join(dir: &str, name: &str) -> String {
    if dir.is_empty() {
        name.to_owned()
    } else {
        format!("{}/{}", dir, name)
    }
}

fn make_stat(path: &str, qid: Qid, length: u64) -> Stat {
    Stat {
        typ: 0,
        dev: 0,
        qid,
        mode: if qid.typ.contains(QidType::DIR) {
            dm::DIR | 0o755
        } else {
            0o644
        },
        atime: 0,
        mtime: 0,
        length,
        name: if path.is_empty() {
            "/".to_owned()
        } else {
            base_name(path).to_owned()
        },
        uid: "none".to_owned(),
        gid: "none".to_owned(),
        muid: "none".to_owned(),
    }
}

#[async_trait]
impl Backend for TestFs {
    type Handle = String;

    async fn attach(
        &self,
        _ctx: &OpCtx,
        _afid: Option<&String>,
        _uname: &str,
        _aname: &str,
    ) -> Result<(Qid, String)> {
        Ok((qid("", true), String::new()))
    }

    async fn walk(
        &self,
        _ctx: &OpCtx,
        from: &String,
        wnames: &[String],
    ) -> Result<Walked<String>> {
        let mut path = from.clone();
        let mut wqids = Vec::new();

        for (i, name) in wnames.iter().enumerate() {
            path = match name.as_str() {
                ".." => parent_of(&path).unwrap_or("").to_owned(),
                "." => path,
                _ => join(&path, name),
            };

            match self.qid_of(&path).await {
                Some(qid) => wqids.push(qid),
                None => {
                    if i == 0 {
                        return Err(Error::server("file does not exist"));
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
            handle: Some(path),
        })
    }

    async fn open(&self, _ctx: &OpCtx, handle: &String, _mode: u8) -> Result<(Qid, u32)> {
        match self.qid_of(handle).await {
            Some(qid) => Ok((qid, 0)),
            None => Err(Error::server("file does not exist")),
        }
    }

    async fn create(
        &self,
        _ctx: &OpCtx,
        dir: &String,
        name: &str,
        perm: u32,
        _mode: u8,
    ) -> Result<(Qid, u32, String)> {
        let path = join(dir, name);
        if self.qid_of(&path).await.is_some() {
            return Err(Error::server("file already exists"));
        }

        if perm & dm::DIR != 0 {
            self.dirs.write().await.insert(path.clone());
            Ok((qid(&path, true), 0, path))
        } else {
            self.files.write().await.insert(path.clone(), Vec::new());
            Ok((qid(&path, false), 0, path))
        }
    }

    async fn read(
        &self,
        _ctx: &OpCtx,
        handle: &String,
        offset: u64,
        count: u32,
    ) -> Result<Vec<u8>> {
        if handle == "slow" {
            std::future::pending::<()>().await;
        }

        if self.dirs.read().await.contains(handle) {
            // Whole stat records, sorted for determinism.
            let mut names: Vec<String> = Vec::new();
            for dir in self.dirs.read().await.iter() {
                if parent_of(dir) == Some(handle.as_str()) {
                    names.push(dir.clone());
                }
            }
            for file in self.files.read().await.keys() {
                if parent_of(file) == Some(handle.as_str()) {
                    names.push(file.clone());
                }
            }
            names.sort();

            let mut records = Vec::new();
            for name in &names {
                if let Some(stat) = self.stat_of(name).await {
                    stat.encode(&mut records)?;
                }
            }

            let offset = offset as usize;
            if offset >= records.len() {
                return Ok(Vec::new());
            }
            let mut end = offset;
            while end + 2 <= records.len() {
                let rec = 2 + u16::from_le_bytes([records[end], records[end + 1]]) as usize;
                if end + rec - offset > count as usize {
                    break;
                }
                end += rec;
            }
            return Ok(records[offset..end].to_vec());
        }

        let files = self.files.read().await;
        let content = files
            .get(handle)
            .ok_or_else(|| Error::server("file does not exist"))?;
        let start = (offset as usize).min(content.len());
        let end = (start + count as usize).min(content.len());
        Ok(content[start..end].to_vec())
    }

    async fn write(
        &self,
        _ctx: &OpCtx,
        handle: &String,
        offset: u64,
        data: &[u8],
    ) -> Result<u32> {
        let mut files = self.files.write().await;
        let content = files
            .get_mut(handle)
            .ok_or_else(|| Error::server("file does not exist"))?;
        let offset = offset as usize;
        if content.len() < offset + data.len() {
            content.resize(offset + data.len(), 0);
        }
        content[offset..offset + data.len()].copy_from_slice(data);
        Ok(data.len() as u32)
    }

    async fn remove(&self, _ctx: &OpCtx, handle: &String) -> Result<()> {
        if self.dirs.write().await.remove(handle) || self.files.write().await.remove(handle).is_some()
        {
            Ok(())
        } else {
            Err(Error::server("file does not exist"))
        }
    }

    async fn stat(&self, _ctx: &OpCtx, handle: &String) -> Result<Stat> {
        self.stat_of(handle)
            .await
            .ok_or_else(|| Error::server("file does not exist"))
    }

    async fn wstat(&self, _ctx: &OpCtx, _handle: &String, stat: &Stat) -> Result<()> {
        if *stat == Stat::no_change() {
            Ok(())
        } else {
            Err(Error::server("wstat not supported"))
        }
    }
}

/// Spawn a server on one end of a duplex pipe and return the client end.
fn start() -> DuplexStream {
    let _ = env_logger::builder().is_test(true).try_init();

    let (client, server) = tokio::io::duplex(1 << 20);
    tokio::spawn(async move {
        let _ = serve_rwc(TestFs::new(), server, "test").await;
    });
    client
}

async fn send(client: &mut DuplexStream, tag: u16, body: Fcall) {
    let msg = Msg { tag, body };
    let mut payload = Vec::new();
    serialize::write_msg(&mut payload, &msg).unwrap();

    let mut frame = (payload.len() as u32 + 4).to_le_bytes().to_vec();
    frame.extend_from_slice(&payload);
    client.write_all(&frame).await.unwrap();
}

async fn recv(client: &mut DuplexStream) -> Msg {
    let mut szbuf = [0u8; 4];
    client.read_exact(&mut szbuf).await.unwrap();
    let size = u32::from_le_bytes(szbuf) as usize;
    assert!(size >= 7, "reply frame too short");

    let mut payload = vec![0u8; size - 4];
    client.read_exact(&mut payload).await.unwrap();
    let msg = serialize::decode_frame(&payload, DEFAULT_MSIZE).unwrap();
    assert_eq!(size - 4, payload.len());
    msg
}

async fn handshake(client: &mut DuplexStream) {
    send(
        client,
        NOTAG,
        Fcall::Tversion {
            msize: 8192,
            version: P92000.to_owned(),
        },
    )
    .await;
    let reply = recv(client).await;
    assert_eq!(reply.tag, NOTAG);
    assert_eq!(
        reply.body,
        Fcall::Rversion {
            msize: 8192,
            version: P92000.to_owned(),
        }
    );
}

async fn attach(client: &mut DuplexStream, tag: u16, fid: u32) -> Qid {
    send(
        client,
        tag,
        Fcall::Tattach {
            fid,
            afid: NOFID,
            uname: "u".to_owned(),
            aname: String::new(),
        },
    )
    .await;
    let reply = recv(client).await;
    assert_eq!(reply.tag, tag);
    match reply.body {
        Fcall::Rattach { qid } => qid,
        other => panic!("expected Rattach, got {:?}", other),
    }
}

#[tokio::test]
async fn handshake_negotiates_msize_and_version() {
    let mut client = start();
    handshake(&mut client).await;
}

#[tokio::test]
async fn requests_before_tversion_are_gated() {
    let mut client = start();
    send(
        &mut client,
        1,
        Fcall::Tattach {
            fid: 0,
            afid: NOFID,
            uname: "u".to_owned(),
            aname: String::new(),
        },
    )
    .await;

    let reply = recv(&mut client).await;
    assert_eq!(reply.tag, 1);
    assert_eq!(
        reply.body,
        Fcall::Rerror {
            ename: "Dispatch: Tattach not allowed before Tversion".to_owned(),
        }
    );
}

#[tokio::test]
async fn walk_clone_then_walk() {
    let mut client = start();
    handshake(&mut client).await;
    let root_qid = attach(&mut client, 1, 0).await;

    // Pure clone: no qids, fid 1 becomes a second handle on the root.
    send(
        &mut client,
        2,
        Fcall::Twalk {
            fid: 0,
            newfid: 1,
            wnames: vec![],
        },
    )
    .await;
    let reply = recv(&mut client).await;
    assert_eq!(reply.body, Fcall::Rwalk { wqids: vec![] });

    send(
        &mut client,
        3,
        Fcall::Twalk {
            fid: 1,
            newfid: 2,
            wnames: vec!["etc".to_owned(), "hosts".to_owned()],
        },
    )
    .await;
    let reply = recv(&mut client).await;
    match reply.body {
        Fcall::Rwalk { wqids } => {
            assert_eq!(wqids.len(), 2);
            assert!(wqids[0].typ.contains(QidType::DIR));
            assert!(!wqids[1].typ.contains(QidType::DIR));
        }
        other => panic!("expected Rwalk, got {:?}", other),
    }

    // fid 1 still refers to the root, and fid 2 is live.
    send(&mut client, 4, Fcall::Tstat { fid: 1 }).await;
    match recv(&mut client).await.body {
        Fcall::Rstat { stat } => assert_eq!(stat.qid, root_qid),
        other => panic!("expected Rstat, got {:?}", other),
    }
    send(&mut client, 5, Fcall::Tstat { fid: 2 }).await;
    match recv(&mut client).await.body {
        Fcall::Rstat { stat } => assert_eq!(stat.name, "hosts"),
        other => panic!("expected Rstat, got {:?}", other),
    }
}

#[tokio::test]
async fn partial_walk_does_not_bind_newfid() {
    let mut client = start();
    handshake(&mut client).await;
    attach(&mut client, 1, 0).await;

    send(
        &mut client,
        2,
        Fcall::Twalk {
            fid: 0,
            newfid: 9,
            wnames: vec!["etc".to_owned(), "missing".to_owned(), "more".to_owned()],
        },
    )
    .await;
    match recv(&mut client).await.body {
        Fcall::Rwalk { wqids } => assert_eq!(wqids.len(), 1),
        other => panic!("expected Rwalk, got {:?}", other),
    }

    send(&mut client, 3, Fcall::Tstat { fid: 9 }).await;
    assert_eq!(
        recv(&mut client).await.body,
        Fcall::Rerror {
            ename: "unknown fid".to_owned(),
        }
    );
}

#[tokio::test]
async fn directory_reads_fall_on_record_boundaries() {
    let mut client = start();
    handshake(&mut client).await;
    attach(&mut client, 1, 0).await;

    send(&mut client, 2, Fcall::Topen { fid: 0, mode: om::READ }).await;
    match recv(&mut client).await.body {
        Fcall::Ropen { qid, .. } => assert!(qid.typ.contains(QidType::DIR)),
        other => panic!("expected Ropen, got {:?}", other),
    }

    // Read everything once to learn the total, then restart at offset 0
    // with a count that can only hold part of it.
    send(&mut client, 3, Fcall::Tread { fid: 0, offset: 0, count: 8192 }).await;
    let full = match recv(&mut client).await.body {
        Fcall::Rread { data } => data.0,
        other => panic!("expected Rread, got {:?}", other),
    };
    assert!(!full.is_empty());

    send(
        &mut client,
        4,
        Fcall::Tread {
            fid: 0,
            offset: 0,
            count: full.len() as u32 - 1,
        },
    )
    .await;
    let first = match recv(&mut client).await.body {
        Fcall::Rread { data } => data.0,
        other => panic!("expected Rread, got {:?}", other),
    };
    assert!(!first.is_empty() && first.len() < full.len());

    send(
        &mut client,
        5,
        Fcall::Tread {
            fid: 0,
            offset: first.len() as u64,
            count: 8192,
        },
    )
    .await;
    let rest = match recv(&mut client).await.body {
        Fcall::Rread { data } => data.0,
        other => panic!("expected Rread, got {:?}", other),
    };

    // The two reads cover the directory exactly once, on record boundaries.
    assert_eq!([first.clone(), rest].concat(), full);

    send(
        &mut client,
        6,
        Fcall::Tread {
            fid: 0,
            offset: full.len() as u64,
            count: 8192,
        },
    )
    .await;
    match recv(&mut client).await.body {
        Fcall::Rread { data } => assert!(data.0.is_empty()),
        other => panic!("expected Rread, got {:?}", other),
    }

    // A read from the middle of a record is refused.
    send(&mut client, 7, Fcall::Tread { fid: 0, offset: 1, count: 8192 }).await;
    assert_eq!(
        recv(&mut client).await.body,
        Fcall::Rerror {
            ename: "bad offset in directory read".to_owned(),
        }
    );
}

#[tokio::test]
async fn flush_suppresses_the_cancelled_reply() {
    let mut client = start();
    handshake(&mut client).await;
    attach(&mut client, 1, 0).await;

    send(
        &mut client,
        2,
        Fcall::Twalk {
            fid: 0,
            newfid: 3,
            wnames: vec!["slow".to_owned()],
        },
    )
    .await;
    recv(&mut client).await;
    send(&mut client, 3, Fcall::Topen { fid: 3, mode: om::READ }).await;
    recv(&mut client).await;

    // The read never completes on its own; flush it.
    send(&mut client, 5, Fcall::Tread { fid: 3, offset: 0, count: 64 }).await;
    send(&mut client, 6, Fcall::Tflush { oldtag: 5 }).await;

    let reply = recv(&mut client).await;
    assert_eq!(reply.tag, 6);
    assert_eq!(reply.body, Fcall::Rflush);

    // No Rread for tag 5 may follow the Rflush; the next reply must be for
    // a fresh request.
    send(&mut client, 7, Fcall::Tstat { fid: 0 }).await;
    let reply = recv(&mut client).await;
    assert_eq!(reply.tag, 7);

    // Flushing a tag that is no longer in flight is a no-op success.
    send(&mut client, 8, Fcall::Tflush { oldtag: 5 }).await;
    let reply = recv(&mut client).await;
    assert_eq!(reply.tag, 8);
    assert_eq!(reply.body, Fcall::Rflush);
}

#[tokio::test]
async fn clunk_always_removes_the_fid() {
    let mut client = start();
    handshake(&mut client).await;
    attach(&mut client, 1, 0).await;

    send(&mut client, 2, Fcall::Tclunk { fid: 0 }).await;
    assert_eq!(recv(&mut client).await.body, Fcall::Rclunk);

    send(&mut client, 3, Fcall::Tstat { fid: 0 }).await;
    assert_eq!(
        recv(&mut client).await.body,
        Fcall::Rerror {
            ename: "unknown fid".to_owned(),
        }
    );
}

#[tokio::test]
async fn create_write_read_back() {
    let mut client = start();
    handshake(&mut client).await;
    attach(&mut client, 1, 0).await;

    send(
        &mut client,
        2,
        Fcall::Twalk { fid: 0, newfid: 1, wnames: vec![] },
    )
    .await;
    recv(&mut client).await;

    send(
        &mut client,
        3,
        Fcall::Tcreate {
            fid: 1,
            name: "notes".to_owned(),
            perm: 0o644,
            mode: om::RDWR,
        },
    )
    .await;
    match recv(&mut client).await.body {
        Fcall::Rcreate { qid, .. } => assert!(!qid.typ.contains(QidType::DIR)),
        other => panic!("expected Rcreate, got {:?}", other),
    }

    send(
        &mut client,
        4,
        Fcall::Twrite {
            fid: 1,
            offset: 0,
            data: Data(b"hello".to_vec()),
        },
    )
    .await;
    assert_eq!(recv(&mut client).await.body, Fcall::Rwrite { count: 5 });

    send(&mut client, 5, Fcall::Tread { fid: 1, offset: 0, count: 64 }).await;
    assert_eq!(
        recv(&mut client).await.body,
        Fcall::Rread {
            data: Data(b"hello".to_vec()),
        }
    );

    // A directory create must be read-only.
    send(
        &mut client,
        6,
        Fcall::Twalk { fid: 0, newfid: 2, wnames: vec![] },
    )
    .await;
    recv(&mut client).await;
    send(
        &mut client,
        7,
        Fcall::Tcreate {
            fid: 2,
            name: "sub".to_owned(),
            perm: dm::DIR | 0o755,
            mode: om::RDWR,
        },
    )
    .await;
    assert_eq!(
        recv(&mut client).await.body,
        Fcall::Rerror {
            ename: "directory must be created read-only".to_owned(),
        }
    );
}

#[tokio::test]
async fn tversion_resets_the_session() {
    let mut client = start();
    handshake(&mut client).await;
    attach(&mut client, 1, 0).await;

    handshake(&mut client).await;
    send(&mut client, 2, Fcall::Tstat { fid: 0 }).await;
    assert_eq!(
        recv(&mut client).await.body,
        Fcall::Rerror {
            ename: "unknown fid".to_owned(),
        }
    );
}

#[tokio::test]
async fn unknown_version_yields_unknown() {
    let mut client = start();
    send(
        &mut client,
        NOTAG,
        Fcall::Tversion {
            msize: 8192,
            version: "9P1776".to_owned(),
        },
    )
    .await;
    match recv(&mut client).await.body {
        Fcall::Rversion { version, .. } => assert_eq!(version, VERSION_UNKNOWN),
        other => panic!("expected Rversion, got {:?}", other),
    }

    // The session is still gated.
    send(&mut client, 1, Fcall::Tclunk { fid: 0 }).await;
    assert_eq!(
        recv(&mut client).await.body,
        Fcall::Rerror {
            ename: "Dispatch: Tclunk not allowed before Tversion".to_owned(),
        }
    );
}

#[tokio::test]
async fn unsupported_opcodes_get_rerror_not_disconnect() {
    let mut client = start();
    handshake(&mut client).await;

    // An R-message from a client is nonsense but keeps the connection up.
    send(&mut client, 1, Fcall::Rclunk).await;
    assert_eq!(
        recv(&mut client).await.body,
        Fcall::Rerror {
            ename: "Dispatch: Rclunk not supported".to_owned(),
        }
    );

    // A type byte outside the protocol entirely.
    let frame = [
        10u8, 0, 0, 0, // size
        55, // type
        9, 0, // tag
        0, 0, 0, // junk body
    ];
    client.write_all(&frame).await.unwrap();
    let reply = recv(&mut client).await;
    assert_eq!(reply.tag, 9);
    assert_eq!(
        reply.body,
        Fcall::Rerror {
            ename: "Dispatch: type 55 not supported".to_owned(),
        }
    );

    // Still alive.
    attach(&mut client, 2, 0).await;
}

#[tokio::test]
async fn replies_never_exceed_msize() {
    let mut client = start();
    send(
        &mut client,
        NOTAG,
        Fcall::Tversion {
            msize: 256,
            version: P92000.to_owned(),
        },
    )
    .await;
    match recv(&mut client).await.body {
        Fcall::Rversion { msize, .. } => assert_eq!(msize, 256),
        other => panic!("expected Rversion, got {:?}", other),
    }
    attach(&mut client, 1, 0).await;

    send(
        &mut client,
        2,
        Fcall::Twalk {
            fid: 0,
            newfid: 1,
            wnames: vec!["etc".to_owned(), "hosts".to_owned()],
        },
    )
    .await;
    recv(&mut client).await;
    send(&mut client, 3, Fcall::Topen { fid: 1, mode: om::READ }).await;
    recv(&mut client).await;

    // Ask for far more than the negotiated msize allows; the reply must
    // still fit, so the count is clamped server-side.
    send(
        &mut client,
        4,
        Fcall::Tread { fid: 1, offset: 0, count: 100_000 },
    )
    .await;

    let mut szbuf = [0u8; 4];
    client.read_exact(&mut szbuf).await.unwrap();
    let size = u32::from_le_bytes(szbuf) as usize;
    assert!(size <= 256, "reply of {} bytes exceeds msize", size);

    let mut payload = vec![0u8; size - 4];
    client.read_exact(&mut payload).await.unwrap();
    match serialize::decode_frame(&payload, 256).unwrap().body {
        Fcall::Rread { data } => assert_eq!(data.0.len(), (256 - IOHDRSZ) as usize),
        other => panic!("expected Rread, got {:?}", other),
    }
}

#[tokio::test]
async fn walk_with_too_many_elements_is_refused() {
    let mut client = start();
    handshake(&mut client).await;
    attach(&mut client, 1, 0).await;

    let wnames: Vec<String> = (0..17).map(|_| "..".to_owned()).collect();
    send(&mut client, 2, Fcall::Twalk { fid: 0, newfid: 1, wnames }).await;
    assert_eq!(
        recv(&mut client).await.body,
        Fcall::Rerror {
            ename: "too many walk elements".to_owned(),
        }
    );
}
