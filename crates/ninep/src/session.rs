//! Per-connection 9P session state.
//!
//! A [`Session`] owns the fid table and the pending-tag registry for one
//! connection. It enforces the fid state machine (absent → attached → open →
//! clunked) and the Tversion gate; the dispatcher consults it before and
//! after every backend call, holding its locks only across map mutations.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};
use crate::fcall::*;

/// What a fid currently denotes.
///
/// The backend handle is owned by the state holding it; dropping the state
/// releases the handle. Handles are shared through `Arc` so that an in-flight
/// operation keeps its handle alive across a concurrent clunk.
#[derive(Debug)]
pub enum FidState<H> {
    /// The fid denotes a position in the file tree.
    Attached { qid: Qid, handle: Arc<H> },
    /// The fid denotes an opened file.
    Open {
        qid: Qid,
        mode: u8,
        iounit: u32,
        handle: Arc<H>,
        /// Next expected byte offset for directory reads.
        cursor: u64,
    },
}

impl<H> FidState<H> {
    pub fn qid(&self) -> Qid {
        match *self {
            FidState::Attached { qid, .. } | FidState::Open { qid, .. } => qid,
        }
    }

    pub fn handle(&self) -> &Arc<H> {
        match *self {
            FidState::Attached { ref handle, .. } | FidState::Open { ref handle, .. } => handle,
        }
    }

    /// Open mode, if the fid has been opened.
    pub fn open_mode(&self) -> Option<u8> {
        match *self {
            FidState::Open { mode, .. } => Some(mode),
            FidState::Attached { .. } => None,
        }
    }
}

/// Cancellation handles for one in-flight request.
#[derive(Clone, Debug)]
pub struct InFlight {
    /// Fired by Tflush or connection teardown; tells the handler to stop and
    /// drop its reply.
    pub cancel: CancellationToken,
    /// Fired by the handler once its reply has been written or suppressed.
    pub done: CancellationToken,
    /// Distinguishes registrations when a tag number is reused.
    id: u64,
}

impl InFlight {
    fn new(id: u64) -> InFlight {
        InFlight {
            cancel: CancellationToken::new(),
            done: CancellationToken::new(),
            id,
        }
    }
}

/// Request-scoped context passed to every backend call.
#[derive(Clone, Debug)]
pub struct OpCtx {
    /// Advisory cancellation; backends should stop early when it fires.
    pub cancel: CancellationToken,
    /// Peer identity string of the connection.
    pub peer: Arc<str>,
    /// Per-connection request counter.
    pub request_id: u64,
}

/// Per-connection protocol state: negotiated msize and version, the fid
/// table, and the pending-tag set.
pub struct Session<H> {
    max_msize: u32,
    msize: AtomicU32,
    versioned: AtomicBool,
    next_request: AtomicU64,
    fids: RwLock<HashMap<u32, FidState<H>>>,
    pending: Mutex<HashMap<u16, InFlight>>,
}

impl<H> Session<H> {
    /// A fresh session. `msize` starts at the server ceiling and can only be
    /// negotiated down.
    pub fn new(max_msize: u32) -> Session<H> {
        Session {
            max_msize,
            msize: AtomicU32::new(max_msize),
            versioned: AtomicBool::new(false),
            next_request: AtomicU64::new(0),
            fids: RwLock::new(HashMap::new()),
            pending: Mutex::new(HashMap::new()),
        }
    }

    pub fn msize(&self) -> u32 {
        self.msize.load(Ordering::Acquire)
    }

    /// Whether Tversion has completed on this session.
    pub fn versioned(&self) -> bool {
        self.versioned.load(Ordering::Acquire)
    }

    /// Negotiate the protocol version. Always resets the fid table and the
    /// pending tags, whenever it arrives.
    ///
    /// The negotiated msize is `min(client, server ceiling)`; a version not
    /// beginning with "9P2000" yields "unknown" and leaves the session gated.
    pub async fn version(&self, client_msize: u32, client_version: &str) -> (u32, String) {
        self.fids.write().await.clear();
        for (_, inflight) in self.pending.lock().await.drain() {
            inflight.cancel.cancel();
        }

        if !client_version.starts_with(P92000) {
            self.versioned.store(false, Ordering::Release);
            return (client_msize, VERSION_UNKNOWN.to_owned());
        }

        let msize = client_msize.min(self.max_msize);
        self.msize.store(msize, Ordering::Release);
        self.versioned.store(true, Ordering::Release);
        (msize, P92000.to_owned())
    }

    /*
     * Fid table
     */

    /// Bind `fid` to a freshly attached (or authenticated) handle.
    pub async fn bind(&self, fid: u32, qid: Qid, handle: H) -> Result<()> {
        if fid == NOFID {
            return Err(Error::server("cannot use NOFID as a fid"));
        }
        let mut fids = self.fids.write().await;
        if fids.contains_key(&fid) {
            return Err(Error::server("fid already in use"));
        }
        fids.insert(
            fid,
            FidState::Attached {
                qid,
                handle: Arc::new(handle),
            },
        );
        Ok(())
    }

    /// Look up a fid in any state.
    pub async fn any(&self, fid: u32) -> Result<(Qid, Arc<H>)> {
        let fids = self.fids.read().await;
        let state = fids.get(&fid).ok_or_else(|| Error::server("unknown fid"))?;
        Ok((state.qid(), state.handle().clone()))
    }

    /// Look up a fid that must not be open yet (walk source, open, create).
    pub async fn attached(&self, fid: u32) -> Result<(Qid, Arc<H>)> {
        let fids = self.fids.read().await;
        match fids.get(&fid) {
            None => Err(Error::server("unknown fid")),
            Some(FidState::Open { .. }) => Err(Error::server("fid is open")),
            Some(FidState::Attached { qid, handle }) => Ok((*qid, handle.clone())),
        }
    }

    /// Look up an open fid, checking the requested access direction.
    pub async fn open(&self, fid: u32, write: bool) -> Result<(Qid, u8, Arc<H>, u64)> {
        let fids = self.fids.read().await;
        match fids.get(&fid) {
            None => Err(Error::server("unknown fid")),
            Some(FidState::Attached { .. }) => Err(Error::server("fid not open")),
            Some(FidState::Open {
                qid,
                mode,
                handle,
                cursor,
                ..
            }) => {
                let access = mode & om::ACCESS_MASK;
                let allowed = if write {
                    access == om::WRITE || access == om::RDWR
                } else {
                    access == om::READ || access == om::RDWR || access == om::EXEC
                };
                if !allowed {
                    return Err(Error::server(if write {
                        "fid not open for write"
                    } else {
                        "fid not open for read"
                    }));
                }
                Ok((*qid, *mode, handle.clone(), *cursor))
            }
        }
    }

    /// Bind the destination fid of a fully successful walk.
    ///
    /// With `newfid == fid` the source is replaced in place; it must still be
    /// attached. Otherwise `newfid` must be absent.
    pub async fn bind_walked(&self, fid: u32, newfid: u32, qid: Qid, handle: H) -> Result<()> {
        if newfid == NOFID {
            return Err(Error::server("cannot use NOFID as a fid"));
        }
        let mut fids = self.fids.write().await;
        if newfid == fid {
            match fids.get(&fid) {
                None => return Err(Error::server("unknown fid")),
                Some(FidState::Open { .. }) => return Err(Error::server("fid is open")),
                Some(FidState::Attached { .. }) => {}
            }
        } else if fids.contains_key(&newfid) {
            return Err(Error::server("fid already in use"));
        }
        fids.insert(
            newfid,
            FidState::Attached {
                qid,
                handle: Arc::new(handle),
            },
        );
        Ok(())
    }

    /// Transition an attached fid to open.
    pub async fn to_open(&self, fid: u32, qid: Qid, mode: u8, iounit: u32) -> Result<()> {
        let mut fids = self.fids.write().await;
        match fids.remove(&fid) {
            None => Err(Error::server("unknown fid")),
            Some(state @ FidState::Open { .. }) => {
                fids.insert(fid, state);
                Err(Error::server("fid is open"))
            }
            Some(FidState::Attached { handle, .. }) => {
                fids.insert(
                    fid,
                    FidState::Open {
                        qid,
                        mode,
                        iounit,
                        handle,
                        cursor: 0,
                    },
                );
                Ok(())
            }
        }
    }

    /// After a create: the fid now denotes the new file, in open state.
    pub async fn to_created(
        &self,
        fid: u32,
        qid: Qid,
        mode: u8,
        iounit: u32,
        handle: H,
    ) -> Result<()> {
        let mut fids = self.fids.write().await;
        match fids.get(&fid) {
            None => return Err(Error::server("unknown fid")),
            Some(FidState::Open { .. }) => return Err(Error::server("fid is open")),
            Some(FidState::Attached { .. }) => {}
        }
        fids.insert(
            fid,
            FidState::Open {
                qid,
                mode,
                iounit,
                handle: Arc::new(handle),
                cursor: 0,
            },
        );
        Ok(())
    }

    /// Record where the next sequential directory read must begin.
    pub async fn set_cursor(&self, fid: u32, cursor: u64) {
        let mut fids = self.fids.write().await;
        if let Some(FidState::Open { cursor: c, .. }) = fids.get_mut(&fid) {
            *c = cursor;
        }
    }

    /// Remove a fid unconditionally, returning its final state.
    pub async fn remove(&self, fid: u32) -> Result<FidState<H>> {
        self.fids
            .write()
            .await
            .remove(&fid)
            .ok_or_else(|| Error::server("unknown fid"))
    }

    /// Drop every fid, releasing the handles. Used at teardown.
    pub async fn clear_fids(&self) {
        self.fids.write().await.clear();
    }

    /*
     * Pending tags
     */

    /// Register an in-flight request. Rejects NOTAG and duplicate tags.
    pub async fn register_tag(&self, tag: u16) -> Result<InFlight> {
        if tag == NOTAG {
            return Err(Error::server("NOTAG is only valid for Tversion"));
        }
        let mut pending = self.pending.lock().await;
        if pending.contains_key(&tag) {
            return Err(Error::server("duplicate tag"));
        }
        let inflight = InFlight::new(self.next_request.fetch_add(1, Ordering::Relaxed));
        pending.insert(tag, inflight.clone());
        Ok(inflight)
    }

    /// Retire an in-flight request and wake anything waiting on it.
    ///
    /// The registration is only dropped if it is still `inflight`'s own; a
    /// tag number reused after a Tversion reset belongs to someone else.
    pub async fn finish_tag(&self, tag: u16, inflight: &InFlight) {
        {
            let mut pending = self.pending.lock().await;
            if pending.get(&tag).is_some_and(|current| current.id == inflight.id) {
                pending.remove(&tag);
            }
        }
        inflight.done.cancel();
    }

    /// Look up the cancellation handles for a tag, if still in flight.
    pub async fn lookup_tag(&self, tag: u16) -> Option<InFlight> {
        self.pending.lock().await.get(&tag).cloned()
    }

    /// Cancel every in-flight request. Used at teardown.
    pub async fn cancel_all(&self) {
        for inflight in self.pending.lock().await.values() {
            inflight.cancel.cancel();
        }
    }

    #[cfg(test)]
    async fn fid_count(&self) -> usize {
        self.fids.read().await.len()
    }
}
