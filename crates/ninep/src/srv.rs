//! Asynchronous server side 9P library.
//!
//! # Protocol
//! 9P2000

use {
    crate::{
        error::{Error, Result},
        fcall::*,
        serialize,
        session::{OpCtx, Session},
        tracer::{self, SharedTracer, SpanTags},
    },
    async_trait::async_trait,
    bytes::{BufMut, BytesMut},
    futures::sink::SinkExt,
    log::{error, info},
    std::{
        io,
        sync::{
            atomic::{AtomicU64, Ordering},
            Arc,
        },
        time::Duration,
    },
    tokio::{
        io::{AsyncRead, AsyncWrite, WriteHalf},
        net::{TcpListener, TcpStream, UnixListener, UnixStream},
        sync::Mutex,
    },
    tokio_stream::StreamExt,
    tokio_util::codec::{length_delimited::LengthDelimitedCodec, FramedWrite},
    tokio_util::sync::CancellationToken,
};

/// Default server listen address
pub const DEFAULT_ADDR: &str = ":5640";

/// Backoff bounds for temporary accept failures
const ACCEPT_DELAY_MIN: Duration = Duration::from_millis(5);
const ACCEPT_DELAY_MAX: Duration = Duration::from_secs(1);

/// The result of a walk through the backing tree.
#[derive(Debug)]
pub struct Walked<H> {
    /// One qid per successfully traversed path element.
    pub wqids: Vec<Qid>,
    /// Handle for the destination. Present exactly when every element was
    /// walked, including the zero-element clone.
    pub handle: Option<H>,
}

/// The file-tree capability the dispatcher consumes.
///
/// One method per T-message. The dispatcher owns all fid bookkeeping;
/// backends only ever see their own handles. Every method receives an
/// [`OpCtx`] whose cancellation token is advisory: a backend should stop
/// early when it fires but is merely required to terminate eventually.
///
/// An `Err` return is sent to the client as `Rerror` with the error's
/// `Display` form as the message string.
///
/// Implementations must be thread-safe; the server may have several calls in
/// flight at once on the same session.
#[async_trait]
pub trait Backend: Send + Sync + 'static {
    /// Backend-owned state for one fid: a position in the tree or an open
    /// file. Dropping a handle releases whatever it holds.
    type Handle: Send + Sync + 'static;

    /// Begin an authentication exchange on a fresh auth fid.
    ///
    /// The default declines, which is what file servers without
    /// authentication are expected to do.
    async fn auth(&self, _ctx: &OpCtx, _uname: &str, _aname: &str) -> Result<(Qid, Self::Handle)> {
        Err(Error::server("authentication not required"))
    }

    /// Bind a fid to the root of the tree named `aname` for user `uname`.
    async fn attach(
        &self,
        ctx: &OpCtx,
        afid: Option<&Self::Handle>,
        uname: &str,
        aname: &str,
    ) -> Result<(Qid, Self::Handle)>;

    /// Walk from `from` through `wnames`, returning a qid per traversed
    /// element.
    ///
    /// An empty `wnames` is a clone and must yield a handle. A failure on
    /// the first element is an `Err`; a failure on a later element returns
    /// the qids gathered so far and no handle. `".."` walks to the parent
    /// and stays put at the root of the tree.
    async fn walk(
        &self,
        ctx: &OpCtx,
        from: &Self::Handle,
        wnames: &[String],
    ) -> Result<Walked<Self::Handle>>;

    /// Prepare `handle` for I/O. Returns the file's qid and the preferred
    /// I/O unit (0 if the backend has no preference).
    async fn open(&self, ctx: &OpCtx, handle: &Self::Handle, mode: u8) -> Result<(Qid, u32)>;

    /// Create `name` in the directory denoted by `dir` and open it. The
    /// returned handle denotes the new file.
    async fn create(
        &self,
        ctx: &OpCtx,
        dir: &Self::Handle,
        name: &str,
        perm: u32,
        mode: u8,
    ) -> Result<(Qid, u32, Self::Handle)>;

    /// Read up to `count` bytes at `offset`. Short reads are fine; an empty
    /// result means end of file. Directory reads return whole stat records.
    async fn read(
        &self,
        ctx: &OpCtx,
        handle: &Self::Handle,
        offset: u64,
        count: u32,
    ) -> Result<Vec<u8>>;

    /// Write `data` at `offset`, returning the number of bytes written.
    async fn write(
        &self,
        ctx: &OpCtx,
        handle: &Self::Handle,
        offset: u64,
        data: &[u8],
    ) -> Result<u32>;

    /// Release a handle. The fid is gone whatever this returns.
    async fn clunk(&self, _ctx: &OpCtx, _handle: &Self::Handle) -> Result<()> {
        Ok(())
    }

    /// Remove the file behind `handle` and release it.
    async fn remove(&self, ctx: &OpCtx, handle: &Self::Handle) -> Result<()>;

    /// Describe the file behind `handle`.
    async fn stat(&self, ctx: &OpCtx, handle: &Self::Handle) -> Result<Stat>;

    /// Change metadata of the file behind `handle`. Fields at their
    /// "don't touch" sentinel (`!0`, empty strings) request no change.
    async fn wstat(&self, ctx: &OpCtx, handle: &Self::Handle, stat: &Stat) -> Result<()>;
}

#[rustfmt::skip]
async fn dispatch_once<B>(
    msg: &Msg,
    backend: &Arc<B>,
    session: &Arc<Session<B::Handle>>,
    ctx: &OpCtx,
) -> Result<Fcall>
where
    B: Backend,
{
    use crate::Fcall::*;

    let response = match msg.body {
        Tauth { afid, ref uname, ref aname } => {
            let (aqid, handle) = backend.auth(ctx, uname, aname).await?;
            session.bind(afid, aqid, handle).await?;
            Rauth { aqid }
        }
        Tattach { fid, afid, ref uname, ref aname } => {
            let ahandle = match afid {
                NOFID => None,
                _ => Some(session.any(afid).await?.1),
            };
            let (qid, handle) = backend
                .attach(ctx, ahandle.as_deref(), uname, aname)
                .await?;
            session.bind(fid, qid, handle).await?;
            Rattach { qid }
        }
        Twalk { fid, newfid, ref wnames } => {
            if wnames.len() > MAXWELEM {
                return Err(Error::server("too many walk elements"));
            }
            let (src_qid, handle) = session.attached(fid).await?;
            let walked = backend.walk(ctx, &handle, wnames).await?;
            debug_assert!(walked.wqids.len() <= wnames.len());

            match walked.handle {
                Some(dest) if walked.wqids.len() == wnames.len() => {
                    let qid = walked.wqids.last().copied().unwrap_or(src_qid);
                    session.bind_walked(fid, newfid, qid, dest).await?;
                    Rwalk { wqids: walked.wqids }
                }
                // Partial walk: newfid is not bound. A first-element failure
                // must come back as Err from the backend instead.
                _ => {
                    debug_assert!(!walked.wqids.is_empty());
                    Rwalk { wqids: walked.wqids }
                }
            }
        }
        Topen { fid, mode } => {
            let (_, handle) = session.attached(fid).await?;
            let (qid, iounit) = backend.open(ctx, &handle, mode).await?;
            session.to_open(fid, qid, mode, iounit).await?;
            Ropen { qid, iounit }
        }
        Tcreate { fid, ref name, perm, mode } => {
            if perm & dm::DIR != 0 && mode & om::ACCESS_MASK != om::READ {
                return Err(Error::server("directory must be created read-only"));
            }
            let (_, handle) = session.attached(fid).await?;
            let (qid, iounit, created) = backend.create(ctx, &handle, name, perm, mode).await?;
            session.to_created(fid, qid, mode, iounit, created).await?;
            Rcreate { qid, iounit }
        }
        Tread { fid, offset, count } => {
            let (qid, _, handle, cursor) = session.open(fid, false).await?;
            if qid.typ.contains(QidType::DIR) && offset != 0 && offset != cursor {
                return Err(Error::server("bad offset in directory read"));
            }
            let count = count.min(session.msize().saturating_sub(IOHDRSZ));
            let data = backend.read(ctx, &handle, offset, count).await?;
            if qid.typ.contains(QidType::DIR) {
                session.set_cursor(fid, offset + data.len() as u64).await;
            }
            Rread { data: Data(data) }
        }
        Twrite { fid, offset, ref data } => {
            let (qid, _, handle, _) = session.open(fid, true).await?;
            if qid.typ.contains(QidType::DIR) {
                return Err(Error::server("cannot write a directory"));
            }
            let count = backend.write(ctx, &handle, offset, &data.0).await?;
            Rwrite { count }
        }
        Tclunk { fid } => {
            // The fid is removed before the backend runs so that it is gone
            // whatever happens next.
            let state = session.remove(fid).await?;
            match state.open_mode() {
                Some(mode) if mode & om::RCLOSE != 0 => {
                    backend.remove(ctx, state.handle()).await?
                }
                _ => backend.clunk(ctx, state.handle()).await?,
            }
            Rclunk
        }
        Tremove { fid } => {
            let state = session.remove(fid).await?;
            backend.remove(ctx, state.handle()).await?;
            Rremove
        }
        Tstat { fid } => {
            let (_, handle) = session.any(fid).await?;
            Rstat { stat: backend.stat(ctx, &handle).await? }
        }
        Twstat { fid, ref stat } => {
            let (_, handle) = session.any(fid).await?;
            backend.wstat(ctx, &handle, stat).await?;
            Rwstat
        }
        ref body => {
            return Err(Error::server(format!(
                "Dispatch: {} not supported",
                MsgType::from(body).name()
            )))
        }
    };

    Ok(response)
}

type SharedWriter<S> = Arc<Mutex<FramedWrite<WriteHalf<S>, LengthDelimitedCodec>>>;

/// Marshal one reply and hand it to the framed writer as a single atomic
/// frame. A reply that would not fit the negotiated msize is demoted to
/// `Rerror`.
async fn write_reply<S>(writer: &SharedWriter<S>, msize: u32, msg: Msg) -> Result<()>
where
    S: AsyncWrite + Send,
{
    let mut buf = BytesMut::with_capacity(4096).writer();
    serialize::write_msg(&mut buf, &msg)?;
    let mut frozen = buf.into_inner().freeze();

    if frozen.len() as u32 + 4 > msize {
        if let Fcall::Rerror { .. } = msg.body {
            return Err(Error::FrameTooLarge {
                size: frozen.len() as u32 + 4,
                msize,
            });
        }
        let fallback = Msg {
            tag: msg.tag,
            body: Fcall::Rerror {
                ename: "reply exceeds negotiated msize".to_owned(),
            },
        };
        let mut buf = BytesMut::with_capacity(64).writer();
        serialize::write_msg(&mut buf, &fallback)?;
        frozen = buf.into_inner().freeze();
    }

    writer.lock().await.send(frozen).await?;
    Ok(())
}

/// Per-connection read→decode→dispatch→encode→write loop.
///
/// One call per accepted stream. Returns when the peer closes, a transport
/// error occurs, or the frame header cannot be parsed; in-flight requests
/// are cancelled and all fids released on the way out.
async fn serve_stream<B, S>(
    backend: Arc<B>,
    tracer: SharedTracer,
    max_msize: u32,
    stream: S,
    peer: Arc<str>,
) -> Result<()>
where
    B: Backend,
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let (readhalf, writehalf) = tokio::io::split(stream);

    let mut framedread = LengthDelimitedCodec::builder()
        .length_field_offset(0)
        .length_field_length(4)
        .length_adjustment(-4)
        .little_endian()
        .max_frame_length(max_msize as usize)
        .new_read(readhalf);
    let framedwrite = LengthDelimitedCodec::builder()
        .length_field_offset(0)
        .length_field_length(4)
        .length_adjustment(-4)
        .little_endian()
        .new_write(writehalf);
    let framedwrite: SharedWriter<S> = Arc::new(Mutex::new(framedwrite));

    let session: Arc<Session<B::Handle>> = Arc::new(Session::new(max_msize));
    let dead = CancellationToken::new();
    let request_counter = AtomicU64::new(0);

    let conn_span = tracer.span_start("connection", None, &SpanTags::default());
    info!("[{}] serving", peer);

    let result = loop {
        let frame = tokio::select! {
            _ = dead.cancelled() => break Ok(()),
            frame = framedread.next() => frame,
        };

        let bytes = match frame {
            None => break Ok(()),
            Some(Ok(bytes)) => bytes,
            Some(Err(e)) => {
                error!("[{}] read error: {}", peer, e);
                break Err(e.into());
            }
        };

        let request_id = request_counter.fetch_add(1, Ordering::Relaxed) + 1;

        if bytes.len() < 3 {
            // No tag to reply on; the connection is beyond repair.
            error!("[{}] short frame header", peer);
            break Err(Error::MalformedFrame(
                "frame shorter than a 9P header".to_owned(),
            ));
        }
        let tag = u16::from_le_bytes([bytes[1], bytes[2]]);

        let msg = match serialize::decode_frame(&bytes, session.msize()) {
            Ok(msg) => msg,
            Err(Error::UnknownType(t)) => {
                let ename = format!("Dispatch: type {} not supported", t);
                if let Err(e) = write_reply(
                    &framedwrite,
                    session.msize(),
                    Msg { tag, body: Fcall::Rerror { ename } },
                )
                .await
                {
                    error!("[{}] write error: {}", peer, e);
                    break Err(e);
                }
                continue;
            }
            Err(e) => {
                // A body that does not parse is reported on the client's tag;
                // the connection stays up.
                let ename = e.ename();
                error!("[{}] bad frame for tag {}: {}", peer, tag, ename);
                if let Err(e) = write_reply(
                    &framedwrite,
                    session.msize(),
                    Msg { tag, body: Fcall::Rerror { ename } },
                )
                .await
                {
                    error!("[{}] write error: {}", peer, e);
                    break Err(e);
                }
                continue;
            }
        };

        info!("[{}] ← {:?}", peer, msg);
        let typ = MsgType::from(&msg.body);
        let req_tags = SpanTags {
            tag: Some(msg.tag),
            op: Some(typ.name()),
            request_id: Some(request_id),
        };

        // Tversion is the gate and always resets, so it runs inline.
        if let Fcall::Tversion { msize, ref version } = msg.body {
            let span = tracer.span_start(typ.name(), Some(conn_span), &req_tags);
            let (msize, version) = session.version(msize, version).await;
            let reply = Msg {
                tag: msg.tag,
                body: Fcall::Rversion { msize, version },
            };
            let res = write_reply(&framedwrite, session.msize(), reply).await;
            tracer.span_finish(span);
            if let Err(e) = res {
                error!("[{}] write error: {}", peer, e);
                break Err(e);
            }
            continue;
        }

        if !session.versioned() {
            let ename = format!("Dispatch: {} not allowed before Tversion", typ.name());
            if let Err(e) = write_reply(
                &framedwrite,
                session.msize(),
                Msg { tag: msg.tag, body: Fcall::Rerror { ename } },
            )
            .await
            {
                error!("[{}] write error: {}", peer, e);
                break Err(e);
            }
            continue;
        }

        if !typ.is_t() {
            let ename = format!("Dispatch: {} not supported", typ.name());
            if let Err(e) = write_reply(
                &framedwrite,
                session.msize(),
                Msg { tag: msg.tag, body: Fcall::Rerror { ename } },
            )
            .await
            {
                error!("[{}] write error: {}", peer, e);
                break Err(e);
            }
            continue;
        }

        // Tflush runs inline: Rflush may only go out once the old request
        // has replied or been suppressed for good.
        if let Fcall::Tflush { oldtag } = msg.body {
            let span = tracer.span_start(typ.name(), Some(conn_span), &req_tags);
            if let Some(inflight) = session.lookup_tag(oldtag).await {
                inflight.cancel.cancel();
                inflight.done.cancelled().await;
            }
            let reply = Msg {
                tag: msg.tag,
                body: Fcall::Rflush,
            };
            let res = write_reply(&framedwrite, session.msize(), reply).await;
            tracer.span_finish(span);
            if let Err(e) = res {
                error!("[{}] write error: {}", peer, e);
                break Err(e);
            }
            continue;
        }

        let inflight = match session.register_tag(msg.tag).await {
            Ok(inflight) => inflight,
            Err(e) => {
                let reply = Msg {
                    tag: msg.tag,
                    body: Fcall::Rerror { ename: e.ename() },
                };
                if let Err(e) = write_reply(&framedwrite, session.msize(), reply).await {
                    error!("[{}] write error: {}", peer, e);
                    break Err(e);
                }
                continue;
            }
        };

        let backend = backend.clone();
        let session = session.clone();
        let framedwrite = framedwrite.clone();
        let tracer = tracer.clone();
        let peer = peer.clone();
        let dead = dead.clone();
        let ctx = OpCtx {
            cancel: inflight.cancel.clone(),
            peer: peer.clone(),
            request_id,
        };

        tokio::spawn(async move {
            let span = tracer.span_start(typ.name(), Some(conn_span), &req_tags);

            let response = tokio::select! {
                _ = ctx.cancel.cancelled() => None,
                result = dispatch_once(&msg, &backend, &session, &ctx) => {
                    Some(result.unwrap_or_else(|e| {
                        error!("[{}] {}: {}", peer, typ.name(), e);
                        Fcall::Rerror { ename: e.ename() }
                    }))
                }
            };

            // A cancelled request must not reply; its writer lane just closes.
            if let Some(body) = response {
                if !ctx.cancel.is_cancelled() {
                    let reply = Msg { tag: msg.tag, body };
                    let write_span =
                        tracer.span_start("write", Some(span), &SpanTags::default());
                    let res = write_reply(&framedwrite, session.msize(), reply).await;
                    tracer.span_finish(write_span);
                    match res {
                        Ok(()) => info!("[{}] → {} tag {}", peer, typ.name(), msg.tag),
                        Err(e) => {
                            error!("[{}] write error: {}", peer, e);
                            dead.cancel();
                        }
                    }
                }
            }

            session.finish_tag(msg.tag, &inflight).await;
            tracer.span_finish(span);
        });
    };

    session.cancel_all().await;
    session.clear_fids().await;
    tracer.span_finish(conn_span);
    info!("[{}] connection closed", peer);

    result
}

/// Serve one established bidirectional byte stream.
///
/// Useful when the transport is handed in from elsewhere, such as a
/// host-provided service endpoint. `peer` is only used for logging and
/// tracing.
pub async fn serve_rwc<B, S>(backend: B, stream: S, peer: &str) -> Result<()>
where
    B: Backend,
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    serve_stream(
        Arc::new(backend),
        tracer::noop(),
        DEFAULT_MSIZE,
        stream,
        Arc::from(peer),
    )
    .await
}

/// A factory yielding accepted byte streams paired with a peer identity
/// string. The server core never opens or names transports itself.
#[async_trait]
pub trait StreamFactory: Send {
    type Stream: AsyncRead + AsyncWrite + Send + 'static;

    async fn accept(&mut self) -> io::Result<(Self::Stream, String)>;
}

#[async_trait]
impl StreamFactory for TcpListener {
    type Stream = TcpStream;

    async fn accept(&mut self) -> io::Result<(TcpStream, String)> {
        let (stream, peer) = TcpListener::accept(self).await?;
        Ok((stream, peer.to_string()))
    }
}

#[async_trait]
impl StreamFactory for UnixListener {
    type Stream = UnixStream;

    async fn accept(&mut self) -> io::Result<(UnixStream, String)> {
        let (stream, addr) = UnixListener::accept(self).await?;
        Ok((stream, format!("{:?}", addr)))
    }
}

fn is_temporary(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::Interrupted
            | io::ErrorKind::WouldBlock
            | io::ErrorKind::TimedOut
    )
}

/// Controls how new sessions are established.
///
/// One `NetListener` may drive any number of listening transports through
/// [`NetListener::serve`]; [`NetListener::shutdown`] closes them all without
/// tearing down established connections, which drain on their own.
pub struct NetListener<B> {
    backend: Arc<B>,
    tracer: SharedTracer,
    max_msize: u32,
    shutdown: CancellationToken,
}

impl<B: Backend> NetListener<B> {
    pub fn new(backend: B) -> NetListener<B> {
        NetListener {
            backend: Arc::new(backend),
            tracer: tracer::noop(),
            max_msize: DEFAULT_MSIZE,
            shutdown: CancellationToken::new(),
        }
    }

    /// Install a tracer for every connection established through self.
    pub fn with_tracer(mut self, tracer: SharedTracer) -> NetListener<B> {
        self.tracer = tracer;
        self
    }

    /// Lower the msize ceiling offered during version negotiation.
    pub fn with_msize(mut self, max_msize: u32) -> NetListener<B> {
        self.max_msize = max_msize.max(HDRSZ);
        self
    }

    /// Accept a connection from an exotic transport directly.
    pub fn accept<S>(&self, stream: S, peer: &str)
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let backend = self.backend.clone();
        let tracer = self.tracer.clone();
        let max_msize = self.max_msize;
        let peer: Arc<str> = Arc::from(peer);

        tokio::spawn(async move {
            if let Err(e) = serve_stream(backend, tracer, max_msize, stream, peer.clone()).await {
                error!("[{}] {}", peer, e);
            }
        });
    }

    /// Accept connections from `factory` until shutdown or a permanent
    /// accept failure.
    ///
    /// Temporary failures back off exponentially from 5 ms to 1 s; any
    /// successful accept resets the backoff.
    pub async fn serve<F: StreamFactory>(&self, mut factory: F) -> Result<()> {
        let mut delay = Duration::ZERO;

        loop {
            let accepted = tokio::select! {
                _ = self.shutdown.cancelled() => return Ok(()),
                accepted = factory.accept() => accepted,
            };

            match accepted {
                Ok((stream, peer)) => {
                    delay = Duration::ZERO;
                    info!("accepted: {}", peer);
                    self.accept(stream, &peer);
                }
                Err(e) if is_temporary(&e) => {
                    delay = if delay.is_zero() {
                        ACCEPT_DELAY_MIN
                    } else {
                        (delay * 2).min(ACCEPT_DELAY_MAX)
                    };
                    error!("accept error: {}; retrying in {:?}", e, delay);
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Close every listening transport driven by self. Established
    /// connections are left alone.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }
}

async fn srv_async_tcp<B>(backend: B, addr: &str) -> Result<()>
where
    B: Backend,
{
    let listener = TcpListener::bind(addr).await?;
    NetListener::new(backend).serve(listener).await
}

async fn srv_async_unix<B>(backend: B, addr: &str) -> Result<()>
where
    B: Backend,
{
    let listener = UnixListener::bind(addr)?;
    NetListener::new(backend).serve(listener).await
}

/// Split a `proto!address!port` dial string into the protocol and the bind
/// address for it. Unix sockets use the address part alone.
fn parse_proto(arg: &str) -> Option<(&str, String)> {
    let mut split = arg.split('!');
    let (proto, addr, port) = (split.next()?, split.next()?, split.next()?);

    match proto {
        "unix" => Some((proto, addr.to_owned())),
        _ => Some((proto, format!("{}:{}", addr, port))),
    }
}

/// Start a server on `addr`, which takes the form `proto!address!port`
/// where proto is `tcp` or `unix`.
pub async fn srv_async<B>(backend: B, addr: &str) -> Result<()>
where
    B: Backend,
{
    let (proto, listen_addr) =
        parse_proto(addr).ok_or_else(|| Error::BadAddress(addr.to_owned()))?;

    match proto {
        "tcp" => srv_async_tcp(backend, &listen_addr).await,
        "unix" => srv_async_unix(backend, &listen_addr).await,
        _ => Err(Error::BadAddress(addr.to_owned())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dial_strings_parse() {
        assert_eq!(
            parse_proto("tcp!0.0.0.0!5640"),
            Some(("tcp", "0.0.0.0:5640".to_owned()))
        );
        assert_eq!(
            parse_proto("unix!/tmp/sock!0"),
            Some(("unix", "/tmp/sock".to_owned()))
        );
        assert_eq!(parse_proto("tcp!127.0.0.1"), None);
    }
}
