//! Serialize/deserialize 9P messages into/from binary.
//!
//! Integers are little-endian and unsigned. Strings carry a 16-bit length
//! prefix and no terminator. Byte blobs in `Twrite`/`Rread` carry a 32-bit
//! count. Walk name and qid arrays carry a 16-bit count.

use crate::{
    error::{Error, Result},
    fcall::*,
};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use num_traits::FromPrimitive;
use std::io::{Cursor, Read};
use std::mem;
use std::ops::{Shl, Shr};

macro_rules! decode {
    ($decoder:expr) => {
        Decodable::decode(&mut $decoder)?
    };
}

fn read_exact<R: Read + ?Sized>(r: &mut R, size: usize) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    r.take(size as u64).read_to_end(&mut buf)?;
    if buf.len() != size {
        return Err(Error::MalformedFrame(format!(
            "declared length {} overruns the frame",
            size
        )));
    }
    Ok(buf)
}

/// A serializing specific result to overload operators on `Result`
///
/// # Overloaded operators
/// <<, >>, ?
pub struct SResult<T>(Result<T>);

/// A wrapper class of WriteBytesExt to provide operator overloads
/// for serializing
///
/// Operator '<<' serializes the right hand side argument into
/// the left hand side encoder
#[derive(Clone, Debug)]
pub struct Encoder<W> {
    writer: W,
    bytes: usize,
}

impl<W: WriteBytesExt> Encoder<W> {
    pub fn new(writer: W) -> Encoder<W> {
        Encoder { writer, bytes: 0 }
    }

    /// Return total bytes written
    pub fn bytes_written(&self) -> usize {
        self.bytes
    }

    /// Encode data, equivalent to: encoder << data
    pub fn encode<T: Encodable>(&mut self, data: &T) -> Result<usize> {
        let bytes = data.encode(&mut self.writer)?;
        self.bytes += bytes;
        Ok(bytes)
    }

    /// Get inner writer
    pub fn into_inner(self) -> W {
        self.writer
    }
}

impl<'a, T: Encodable, W: WriteBytesExt> Shl<&'a T> for Encoder<W> {
    type Output = SResult<Encoder<W>>;
    fn shl(mut self, rhs: &'a T) -> Self::Output {
        match self.encode(rhs) {
            Ok(_) => SResult(Ok(self)),
            Err(e) => SResult(Err(e)),
        }
    }
}

impl<'a, T: Encodable, W: WriteBytesExt> Shl<&'a T> for SResult<Encoder<W>> {
    type Output = Self;
    fn shl(self, rhs: &'a T) -> Self::Output {
        match self.0 {
            Ok(mut encoder) => match encoder.encode(rhs) {
                Ok(_) => SResult(Ok(encoder)),
                Err(e) => SResult(Err(e)),
            },
            Err(e) => SResult(Err(e)),
        }
    }
}

/// A wrapper class of ReadBytesExt to provide operator overloads
/// for deserializing
#[derive(Clone, Debug)]
pub struct Decoder<R> {
    reader: R,
}

impl<R: ReadBytesExt> Decoder<R> {
    pub fn new(reader: R) -> Decoder<R> {
        Decoder { reader }
    }
    pub fn decode<T: Decodable>(&mut self) -> Result<T> {
        Decodable::decode(&mut self.reader)
    }
    /// Get inner reader
    pub fn into_inner(self) -> R {
        self.reader
    }
}

impl<'a, T: Decodable, R: ReadBytesExt> Shr<&'a mut T> for Decoder<R> {
    type Output = SResult<Decoder<R>>;
    fn shr(mut self, rhs: &'a mut T) -> Self::Output {
        match self.decode() {
            Ok(r) => {
                *rhs = r;
                SResult(Ok(self))
            }
            Err(e) => SResult(Err(e)),
        }
    }
}

impl<'a, T: Decodable, R: ReadBytesExt> Shr<&'a mut T> for SResult<Decoder<R>> {
    type Output = Self;
    fn shr(self, rhs: &'a mut T) -> Self::Output {
        match self.0 {
            Ok(mut decoder) => match decoder.decode() {
                Ok(r) => {
                    *rhs = r;
                    SResult(Ok(decoder))
                }
                Err(e) => SResult(Err(e)),
            },
            Err(e) => SResult(Err(e)),
        }
    }
}

/// Trait representing a type which can be serialized into binary
pub trait Encodable {
    /// Encode self to w and returns the number of bytes encoded
    fn encode<W: WriteBytesExt>(&self, w: &mut W) -> Result<usize>;
}

impl Encodable for u8 {
    fn encode<W: WriteBytesExt>(&self, w: &mut W) -> Result<usize> {
        w.write_u8(*self)?;
        Ok(mem::size_of::<Self>())
    }
}

impl Encodable for u16 {
    fn encode<W: WriteBytesExt>(&self, w: &mut W) -> Result<usize> {
        w.write_u16::<LittleEndian>(*self)?;
        Ok(mem::size_of::<Self>())
    }
}

impl Encodable for u32 {
    fn encode<W: WriteBytesExt>(&self, w: &mut W) -> Result<usize> {
        w.write_u32::<LittleEndian>(*self)?;
        Ok(mem::size_of::<Self>())
    }
}

impl Encodable for u64 {
    fn encode<W: WriteBytesExt>(&self, w: &mut W) -> Result<usize> {
        w.write_u64::<LittleEndian>(*self)?;
        Ok(mem::size_of::<Self>())
    }
}

impl Encodable for String {
    fn encode<W: WriteBytesExt>(&self, w: &mut W) -> Result<usize> {
        if self.len() > u16::MAX as usize {
            return Err(Error::FieldTooLong);
        }
        let mut bytes = (self.len() as u16).encode(w)?;
        w.write_all(self.as_bytes())?;
        bytes += self.len();
        Ok(bytes)
    }
}

impl Encodable for Qid {
    fn encode<W: WriteBytesExt>(&self, w: &mut W) -> Result<usize> {
        match Encoder::new(w) << &self.typ.bits() << &self.version << &self.path {
            SResult(Ok(enc)) => Ok(enc.bytes_written()),
            SResult(Err(e)) => Err(e),
        }
    }
}

impl Encodable for Stat {
    fn encode<W: WriteBytesExt>(&self, w: &mut W) -> Result<usize> {
        let fixed = 2 + 4 + 13 + 4 + 4 + 4 + 8 + 2 * 4;
        let total =
            fixed + self.name.len() + self.uid.len() + self.gid.len() + self.muid.len();
        if total > u16::MAX as usize {
            return Err(Error::FieldTooLong);
        }

        match Encoder::new(w)
            << &(total as u16)
            << &self.typ
            << &self.dev
            << &self.qid
            << &self.mode
            << &self.atime
            << &self.mtime
            << &self.length
            << &self.name
            << &self.uid
            << &self.gid
            << &self.muid
        {
            SResult(Ok(enc)) => Ok(enc.bytes_written()),
            SResult(Err(e)) => Err(e),
        }
    }
}

impl Encodable for Data {
    fn encode<W: WriteBytesExt>(&self, w: &mut W) -> Result<usize> {
        let size = self.0.len();
        let bytes = (size as u32).encode(w)? + size;
        w.write_all(&self.0)?;
        Ok(bytes)
    }
}

impl<T: Encodable> Encodable for Vec<T> {
    fn encode<W: WriteBytesExt>(&self, w: &mut W) -> Result<usize> {
        match self
            .iter()
            .fold(Encoder::new(w) << &(self.len() as u16), |acc, s| acc << s)
        {
            SResult(Ok(enc)) => Ok(enc.bytes_written()),
            SResult(Err(e)) => Err(e),
        }
    }
}

/// The extra 16-bit length `Twstat` and `Rstat` wrap around their stat record
struct WrappedStat<'a>(&'a Stat);

impl Encodable for WrappedStat<'_> {
    fn encode<W: WriteBytesExt>(&self, w: &mut W) -> Result<usize> {
        let inner = self.0.size() as usize + 2;
        if inner > u16::MAX as usize {
            return Err(Error::FieldTooLong);
        }
        let mut bytes = (inner as u16).encode(w)?;
        bytes += self.0.encode(w)?;
        Ok(bytes)
    }
}

impl Encodable for Msg {
    fn encode<W: WriteBytesExt>(&self, w: &mut W) -> Result<usize> {
        use crate::Fcall::*;

        let typ = MsgType::from(&self.body);
        let buf = Encoder::new(w) << &(typ as u8) << &self.tag;

        let buf = match self.body {
            Tversion {
                ref msize,
                ref version,
            } => buf << msize << version,
            Rversion {
                ref msize,
                ref version,
            } => buf << msize << version,
            Tauth {
                ref afid,
                ref uname,
                ref aname,
            } => buf << afid << uname << aname,
            Rauth { ref aqid } => buf << aqid,
            Tattach {
                ref fid,
                ref afid,
                ref uname,
                ref aname,
            } => buf << fid << afid << uname << aname,
            Rattach { ref qid } => buf << qid,
            Rerror { ref ename } => buf << ename,
            Tflush { ref oldtag } => buf << oldtag,
            Rflush => buf,
            Twalk {
                ref fid,
                ref newfid,
                ref wnames,
            } => buf << fid << newfid << wnames,
            Rwalk { ref wqids } => buf << wqids,
            Topen { ref fid, ref mode } => buf << fid << mode,
            Ropen {
                ref qid,
                ref iounit,
            } => buf << qid << iounit,
            Tcreate {
                ref fid,
                ref name,
                ref perm,
                ref mode,
            } => buf << fid << name << perm << mode,
            Rcreate {
                ref qid,
                ref iounit,
            } => buf << qid << iounit,
            Tread {
                ref fid,
                ref offset,
                ref count,
            } => buf << fid << offset << count,
            Rread { ref data } => buf << data,
            Twrite {
                ref fid,
                ref offset,
                ref data,
            } => buf << fid << offset << data,
            Rwrite { ref count } => buf << count,
            Tclunk { ref fid } => buf << fid,
            Rclunk => buf,
            Tremove { ref fid } => buf << fid,
            Rremove => buf,
            Tstat { ref fid } => buf << fid,
            Rstat { ref stat } => buf << &WrappedStat(stat),
            Twstat { ref fid, ref stat } => buf << fid << &WrappedStat(stat),
            Rwstat => buf,
        };

        match buf {
            SResult(Ok(b)) => Ok(b.bytes_written()),
            SResult(Err(e)) => Err(e),
        }
    }
}

/// Trait representing a type which can be deserialized from binary
pub trait Decodable: Sized {
    fn decode<R: ReadBytesExt>(r: &mut R) -> Result<Self>;
}

impl Decodable for u8 {
    fn decode<R: ReadBytesExt>(r: &mut R) -> Result<Self> {
        Ok(r.read_u8()?)
    }
}

impl Decodable for u16 {
    fn decode<R: ReadBytesExt>(r: &mut R) -> Result<Self> {
        Ok(r.read_u16::<LittleEndian>()?)
    }
}

impl Decodable for u32 {
    fn decode<R: ReadBytesExt>(r: &mut R) -> Result<Self> {
        Ok(r.read_u32::<LittleEndian>()?)
    }
}

impl Decodable for u64 {
    fn decode<R: ReadBytesExt>(r: &mut R) -> Result<Self> {
        Ok(r.read_u64::<LittleEndian>()?)
    }
}

impl Decodable for String {
    fn decode<R: ReadBytesExt>(r: &mut R) -> Result<Self> {
        let len: u16 = Decodable::decode(r)?;
        String::from_utf8(read_exact(r, len as usize)?)
            .map_err(|_| Error::MalformedFrame("invalid UTF-8 in string".to_owned()))
    }
}

impl Decodable for Qid {
    fn decode<R: ReadBytesExt>(r: &mut R) -> Result<Self> {
        Ok(Qid {
            typ: QidType::from_bits_retain(decode!(*r)),
            version: Decodable::decode(r)?,
            path: Decodable::decode(r)?,
        })
    }
}

impl Decodable for Stat {
    fn decode<R: ReadBytesExt>(r: &mut R) -> Result<Self> {
        let size: u16 = Decodable::decode(r)?;
        let body = read_exact(r, size as usize)?;
        let mut cur = Cursor::new(&body[..]);

        let stat = Stat {
            typ: decode!(cur),
            dev: decode!(cur),
            qid: decode!(cur),
            mode: decode!(cur),
            atime: decode!(cur),
            mtime: decode!(cur),
            length: decode!(cur),
            name: decode!(cur),
            uid: decode!(cur),
            gid: decode!(cur),
            muid: decode!(cur),
        };

        if cur.position() != body.len() as u64 {
            return Err(Error::MalformedFrame(
                "stat size prefix disagrees with its fields".to_owned(),
            ));
        }
        Ok(stat)
    }
}

impl Decodable for Data {
    fn decode<R: ReadBytesExt>(r: &mut R) -> Result<Self> {
        let len: u32 = Decodable::decode(r)?;
        Ok(Data(read_exact(r, len as usize)?))
    }
}

impl<T: Decodable> Decodable for Vec<T> {
    fn decode<R: ReadBytesExt>(r: &mut R) -> Result<Self> {
        let len: u16 = Decodable::decode(r)?;
        let mut buf = Vec::new();
        for _ in 0..len {
            buf.push(Decodable::decode(r)?);
        }
        Ok(buf)
    }
}

fn decode_wrapped_stat<R: ReadBytesExt>(r: &mut R) -> Result<Stat> {
    let outer: u16 = Decodable::decode(r)?;
    let body = read_exact(r, outer as usize)?;
    let mut cur = Cursor::new(&body[..]);

    let stat: Stat = Decodable::decode(&mut cur)?;
    if cur.position() != body.len() as u64 {
        return Err(Error::MalformedFrame(
            "stat wrapper length disagrees with the stat".to_owned(),
        ));
    }
    Ok(stat)
}

impl Decodable for Msg {
    fn decode<R: ReadBytesExt>(r: &mut R) -> Result<Self> {
        use crate::MsgType::*;

        let mut buf = r;

        let typ_byte: u8 = decode!(buf);
        let msg_type = MsgType::from_u8(typ_byte);
        let tag = decode!(buf);
        let body = match msg_type {
            Some(Tversion) => Fcall::Tversion {
                msize: decode!(buf),
                version: decode!(buf),
            },
            Some(Rversion) => Fcall::Rversion {
                msize: decode!(buf),
                version: decode!(buf),
            },
            Some(Tauth) => Fcall::Tauth {
                afid: decode!(buf),
                uname: decode!(buf),
                aname: decode!(buf),
            },
            Some(Rauth) => Fcall::Rauth { aqid: decode!(buf) },
            Some(Tattach) => Fcall::Tattach {
                fid: decode!(buf),
                afid: decode!(buf),
                uname: decode!(buf),
                aname: decode!(buf),
            },
            Some(Rattach) => Fcall::Rattach { qid: decode!(buf) },
            Some(Rerror) => Fcall::Rerror {
                ename: decode!(buf),
            },
            Some(Tflush) => Fcall::Tflush {
                oldtag: decode!(buf),
            },
            Some(Rflush) => Fcall::Rflush,
            Some(Twalk) => Fcall::Twalk {
                fid: decode!(buf),
                newfid: decode!(buf),
                wnames: decode!(buf),
            },
            Some(Rwalk) => Fcall::Rwalk {
                wqids: decode!(buf),
            },
            Some(Topen) => Fcall::Topen {
                fid: decode!(buf),
                mode: decode!(buf),
            },
            Some(Ropen) => Fcall::Ropen {
                qid: decode!(buf),
                iounit: decode!(buf),
            },
            Some(Tcreate) => Fcall::Tcreate {
                fid: decode!(buf),
                name: decode!(buf),
                perm: decode!(buf),
                mode: decode!(buf),
            },
            Some(Rcreate) => Fcall::Rcreate {
                qid: decode!(buf),
                iounit: decode!(buf),
            },
            Some(Tread) => Fcall::Tread {
                fid: decode!(buf),
                offset: decode!(buf),
                count: decode!(buf),
            },
            Some(Rread) => Fcall::Rread { data: decode!(buf) },
            Some(Twrite) => Fcall::Twrite {
                fid: decode!(buf),
                offset: decode!(buf),
                data: decode!(buf),
            },
            Some(Rwrite) => Fcall::Rwrite {
                count: decode!(buf),
            },
            Some(Tclunk) => Fcall::Tclunk { fid: decode!(buf) },
            Some(Rclunk) => Fcall::Rclunk,
            Some(Tremove) => Fcall::Tremove { fid: decode!(buf) },
            Some(Rremove) => Fcall::Rremove,
            Some(Tstat) => Fcall::Tstat { fid: decode!(buf) },
            Some(Rstat) => Fcall::Rstat {
                stat: decode_wrapped_stat(buf)?,
            },
            Some(Twstat) => Fcall::Twstat {
                fid: decode!(buf),
                stat: decode_wrapped_stat(buf)?,
            },
            Some(Rwstat) => Fcall::Rwstat,
            Some(Terror) | None => return Err(Error::UnknownType(typ_byte)),
        };

        Ok(Msg { tag, body })
    }
}

/// Helper function to read a 9P message from a byte-oriented stream
pub fn read_msg<R: ReadBytesExt>(r: &mut R) -> Result<Msg> {
    Decodable::decode(r)
}

/// Helper function to write a 9P message into a byte-oriented stream
pub fn write_msg<W: WriteBytesExt>(w: &mut W, msg: &Msg) -> Result<usize> {
    msg.encode(w)
}

/// Decode one framed message, `frame` being everything after the 4-byte size.
///
/// Enforces the framing invariants: the full frame is at least 7 bytes, does
/// not exceed `msize`, and is consumed exactly.
pub fn decode_frame(frame: &[u8], msize: u32) -> Result<Msg> {
    let size = frame.len() as u32 + 4;
    if size < HDRSZ {
        return Err(Error::MalformedFrame(format!(
            "frame size {} below minimum {}",
            size, HDRSZ
        )));
    }
    if size > msize {
        return Err(Error::FrameTooLarge { size, msize });
    }

    let mut cur = Cursor::new(frame);
    let msg = match read_msg(&mut cur) {
        Ok(msg) => msg,
        Err(Error::Io(ref e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
            return Err(Error::MalformedFrame("frame truncated".to_owned()))
        }
        Err(e) => return Err(e),
    };

    if cur.position() != frame.len() as u64 {
        return Err(Error::MalformedFrame(format!(
            "{} trailing bytes after message body",
            frame.len() as u64 - cur.position()
        )));
    }
    Ok(msg)
}

#[cfg(test)]
fn roundtrip(msg: Msg) {
    let mut buf = Vec::new();
    let n = msg.encode(&mut buf).unwrap();
    assert_eq!(n, buf.len());

    let actual = decode_frame(&buf, DEFAULT_MSIZE).unwrap();
    assert_eq!(msg, actual);

    // Byte-exactness the other way around.
    let mut again = Vec::new();
    actual.encode(&mut again).unwrap();
    assert_eq!(buf, again);
}

#[test]
fn encoder_test1() {
    let expected: Vec<u8> = (0..10).collect();
    let mut encoder = Vec::new();
    for i in 0..10 {
        (&(i as u8)).encode(&mut encoder).unwrap();
    }
    assert_eq!(expected, encoder);
}

#[test]
fn decoder_test1() {
    let expected: Vec<u8> = (0..10).collect();
    let mut decoder = Cursor::new(expected.clone());
    let mut actual: Vec<u8> = Vec::new();
    while let Ok(i) = u8::decode(&mut decoder) {
        actual.push(i);
    }
    assert_eq!(expected, actual);
}

#[test]
fn msg_roundtrip_all_variants() {
    let qid = Qid {
        typ: QidType::DIR,
        version: 3,
        path: 0xdeadbeef,
    };
    let stat = Stat {
        typ: 0,
        dev: 0,
        qid,
        mode: dm::DIR | 0o755,
        atime: 1_700_000_000,
        mtime: 1_700_000_001,
        length: 0,
        name: "etc".to_owned(),
        uid: "glenda".to_owned(),
        gid: "glenda".to_owned(),
        muid: "glenda".to_owned(),
    };

    for body in [
        Fcall::Tversion {
            msize: 8192,
            version: P92000.to_owned(),
        },
        Fcall::Rversion {
            msize: 8192,
            version: P92000.to_owned(),
        },
        Fcall::Tauth {
            afid: 1,
            uname: "glenda".to_owned(),
            aname: String::new(),
        },
        Fcall::Rauth { aqid: qid },
        Fcall::Tattach {
            fid: 0,
            afid: NOFID,
            uname: "glenda".to_owned(),
            aname: String::new(),
        },
        Fcall::Rattach { qid },
        Fcall::Rerror {
            ename: "file not found".to_owned(),
        },
        Fcall::Tflush { oldtag: 5 },
        Fcall::Rflush,
        Fcall::Twalk {
            fid: 0,
            newfid: 1,
            wnames: vec!["etc".to_owned(), "hosts".to_owned()],
        },
        Fcall::Rwalk {
            wqids: vec![qid, qid],
        },
        Fcall::Topen {
            fid: 1,
            mode: om::READ,
        },
        Fcall::Ropen { qid, iounit: 0 },
        Fcall::Tcreate {
            fid: 1,
            name: "new".to_owned(),
            perm: 0o644,
            mode: om::RDWR,
        },
        Fcall::Rcreate { qid, iounit: 0 },
        Fcall::Tread {
            fid: 1,
            offset: 0,
            count: 128,
        },
        Fcall::Rread {
            data: Data(vec![1, 2, 3]),
        },
        Fcall::Twrite {
            fid: 1,
            offset: 64,
            data: Data(vec![4, 5, 6]),
        },
        Fcall::Rwrite { count: 3 },
        Fcall::Tclunk { fid: 1 },
        Fcall::Rclunk,
        Fcall::Tremove { fid: 1 },
        Fcall::Rremove,
        Fcall::Tstat { fid: 1 },
        Fcall::Rstat { stat: stat.clone() },
        Fcall::Twstat {
            fid: 1,
            stat: stat.clone(),
        },
        Fcall::Rwstat,
    ] {
        roundtrip(Msg { tag: 0xbeef, body });
    }
}

#[test]
fn wstat_double_wrap_on_the_wire() {
    let stat = Stat::no_change();
    let msg = Msg {
        tag: 1,
        body: Fcall::Twstat { fid: 2, stat: stat.clone() },
    };

    let mut buf = Vec::new();
    msg.encode(&mut buf).unwrap();

    // type[1] tag[2] fid[4], then the extra wrapper, then the stat's own size.
    let outer = u16::from_le_bytes([buf[7], buf[8]]);
    let inner = u16::from_le_bytes([buf[9], buf[10]]);
    assert_eq!(outer, stat.size() + 2);
    assert_eq!(inner, stat.size());
}

#[test]
fn stat_size_matches_encoding() {
    let stat = Stat {
        typ: 1,
        dev: 2,
        qid: Qid::default(),
        mode: 0o644,
        atime: 0,
        mtime: 0,
        length: 42,
        name: "hosts".to_owned(),
        uid: "u".to_owned(),
        gid: "g".to_owned(),
        muid: "m".to_owned(),
    };
    let mut buf = Vec::new();
    let n = stat.encode(&mut buf).unwrap();
    assert_eq!(n, stat.size() as usize + 2);
}

#[test]
fn truncated_frame_is_malformed() {
    let msg = Msg {
        tag: 7,
        body: Fcall::Twalk {
            fid: 0,
            newfid: 1,
            wnames: vec!["etc".to_owned()],
        },
    };
    let mut buf = Vec::new();
    msg.encode(&mut buf).unwrap();
    buf.truncate(buf.len() - 2);

    assert!(matches!(
        decode_frame(&buf, DEFAULT_MSIZE),
        Err(Error::MalformedFrame(_))
    ));
}

#[test]
fn trailing_bytes_are_malformed() {
    let msg = Msg {
        tag: 7,
        body: Fcall::Tclunk { fid: 0 },
    };
    let mut buf = Vec::new();
    msg.encode(&mut buf).unwrap();
    buf.push(0);

    assert!(matches!(
        decode_frame(&buf, DEFAULT_MSIZE),
        Err(Error::MalformedFrame(_))
    ));
}

#[test]
fn unknown_type_is_rejected() {
    // Type 42 is not a 9P2000 opcode; tag 0x0102.
    let buf = [42u8, 0x02, 0x01];
    assert!(matches!(
        decode_frame(&buf, DEFAULT_MSIZE),
        Err(Error::UnknownType(42))
    ));
}

#[test]
fn oversized_frame_is_rejected() {
    let msg = Msg {
        tag: 1,
        body: Fcall::Twrite {
            fid: 0,
            offset: 0,
            data: Data(vec![0; 64]),
        },
    };
    let mut buf = Vec::new();
    msg.encode(&mut buf).unwrap();

    assert!(matches!(
        decode_frame(&buf, 32),
        Err(Error::FrameTooLarge { .. })
    ));
}

#[test]
fn overlong_string_fails_encode() {
    let msg = Msg {
        tag: 1,
        body: Fcall::Rerror {
            ename: "x".repeat(u16::MAX as usize + 1),
        },
    };
    let mut buf = Vec::new();
    assert!(matches!(msg.encode(&mut buf), Err(Error::FieldTooLong)));
}
