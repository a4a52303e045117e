//! Handoff wire codec
//!
//! Survivable records (bound listeners and saved startup descriptors) are
//! streamed through an anonymous pipe across the exec boundary. The format
//! is a flat record stream in host byte order -- producer and consumer are
//! always the same binary, so there is nothing to negotiate:
//!
//! ```text
//! record  := [i32 fd][i32 tag][payload]
//! bound   := [i32 listened][u32 addrlen][addrlen bytes of address]
//! saved   := [i32 original fd][i64 offset]
//! ```
//!
//! Reads and writes retry transparently on EINTR/EAGAIN. A clean
//! end-of-stream between records ends decoding; EOF inside a record is a
//! hard error, because half a record means the handoff state is undefined.

use std::io;
use std::os::unix::io::RawFd;

use thiserror::Error;

/// Wire tag for a bound listener record.
pub const TAG_BOUND: i32 = 1;
/// Wire tag reserved for tracked connections (never encoded).
pub const TAG_TRACKED: i32 = 2;
/// Wire tag for a saved startup descriptor record.
pub const TAG_SAVED: i32 = 3;
/// Wire tag reserved for dummy sockets (never encoded).
pub const TAG_DUMMY: i32 = 4;

/// Upper bound on an encoded socket address. Real sockaddr structures are
/// at most a couple hundred bytes; anything bigger is stream corruption.
const MAX_ADDR_LEN: u32 = 4096;

/// Errors produced while encoding or decoding the handoff stream.
#[derive(Error, Debug)]
pub enum CodecError {
    #[error("I/O error on handoff pipe: {0}")]
    Io(#[from] io::Error),

    #[error("handoff stream ended in the middle of a record")]
    TruncatedRecord,

    #[error("unknown record tag {0} in handoff stream")]
    UnknownTag(i32),

    #[error("encoded address length {0} exceeds the sockaddr ceiling")]
    OversizeAddress(u32),
}

/// A record as it crosses the exec boundary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WireRecord {
    Bound { listened: bool, addr: Vec<u8> },
    Saved { fd: RawFd, offset: i64 },
}

/// Encode one record onto the handoff pipe.
pub fn encode(pipe: RawFd, fd: RawFd, record: &WireRecord) -> Result<(), CodecError> {
    write_full(pipe, &fd.to_ne_bytes())?;
    match record {
        WireRecord::Bound { listened, addr } => {
            write_full(pipe, &TAG_BOUND.to_ne_bytes())?;
            write_full(pipe, &(*listened as i32).to_ne_bytes())?;
            write_full(pipe, &(addr.len() as u32).to_ne_bytes())?;
            if !addr.is_empty() {
                write_full(pipe, addr)?;
            }
        }
        WireRecord::Saved { fd, offset } => {
            write_full(pipe, &TAG_SAVED.to_ne_bytes())?;
            write_full(pipe, &fd.to_ne_bytes())?;
            write_full(pipe, &offset.to_ne_bytes())?;
        }
    }
    Ok(())
}

/// Decode the next record from the handoff pipe.
///
/// Returns `Ok(None)` on a clean end-of-stream (the previous generation
/// closed its write end after the last record).
pub fn decode(pipe: RawFd) -> Result<Option<(RawFd, WireRecord)>, CodecError> {
    let mut fd_buf = [0u8; 4];
    if read_full(pipe, &mut fd_buf)? {
        return Ok(None);
    }
    let fd = RawFd::from_ne_bytes(fd_buf);

    let tag = read_i32(pipe)?;
    let record = match tag {
        TAG_BOUND => {
            let listened = read_i32(pipe)? != 0;
            let addrlen = read_u32(pipe)?;
            if addrlen > MAX_ADDR_LEN {
                return Err(CodecError::OversizeAddress(addrlen));
            }
            let mut addr = vec![0u8; addrlen as usize];
            if addrlen > 0 && read_full(pipe, &mut addr)? {
                return Err(CodecError::TruncatedRecord);
            }
            WireRecord::Bound { listened, addr }
        }
        TAG_SAVED => {
            let fd = read_i32(pipe)?;
            let mut off_buf = [0u8; 8];
            if read_full(pipe, &mut off_buf)? {
                return Err(CodecError::TruncatedRecord);
            }
            WireRecord::Saved {
                fd,
                offset: i64::from_ne_bytes(off_buf),
            }
        }
        other => return Err(CodecError::UnknownTag(other)),
    };

    Ok(Some((fd, record)))
}

fn read_i32(pipe: RawFd) -> Result<i32, CodecError> {
    let mut buf = [0u8; 4];
    if read_full(pipe, &mut buf)? {
        return Err(CodecError::TruncatedRecord);
    }
    Ok(i32::from_ne_bytes(buf))
}

fn read_u32(pipe: RawFd) -> Result<u32, CodecError> {
    Ok(read_i32(pipe)? as u32)
}

/// Fill `buf` from the pipe, retrying interruptions.
///
/// Returns `Ok(true)` for EOF before the first byte; EOF after a partial
/// fill is `TruncatedRecord`.
fn read_full(pipe: RawFd, buf: &mut [u8]) -> Result<bool, CodecError> {
    let mut done = 0usize;
    while done < buf.len() {
        let rc = unsafe {
            libc::read(
                pipe,
                buf[done..].as_mut_ptr() as *mut libc::c_void,
                buf.len() - done,
            )
        };
        if rc < 0 {
            let err = io::Error::last_os_error();
            match err.raw_os_error() {
                Some(libc::EINTR) | Some(libc::EAGAIN) => continue,
                _ => return Err(CodecError::Io(err)),
            }
        }
        if rc == 0 {
            if done == 0 {
                return Ok(true);
            }
            return Err(CodecError::TruncatedRecord);
        }
        done += rc as usize;
    }
    Ok(false)
}

/// Write all of `buf` to the pipe, retrying interruptions.
fn write_full(pipe: RawFd, buf: &[u8]) -> Result<(), CodecError> {
    let mut done = 0usize;
    while done < buf.len() {
        let rc = unsafe {
            libc::write(
                pipe,
                buf[done..].as_ptr() as *const libc::c_void,
                buf.len() - done,
            )
        };
        if rc < 0 {
            let err = io::Error::last_os_error();
            match err.raw_os_error() {
                Some(libc::EINTR) | Some(libc::EAGAIN) => continue,
                _ => return Err(CodecError::Io(err)),
            }
        }
        if rc == 0 {
            return Err(CodecError::Io(io::Error::new(
                io::ErrorKind::WriteZero,
                "zero-length write on handoff pipe",
            )));
        }
        done += rc as usize;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pipe_pair() -> (RawFd, RawFd) {
        let mut fds = [0 as RawFd; 2];
        let rc = unsafe { libc::pipe(fds.as_mut_ptr()) };
        assert_eq!(rc, 0, "pipe() failed");
        (fds[0], fds[1])
    }

    fn close(fd: RawFd) {
        unsafe { libc::close(fd) };
    }

    #[test]
    fn test_bound_round_trip() {
        let (rd, wr) = pipe_pair();
        let record = WireRecord::Bound {
            listened: true,
            addr: vec![2, 0, 0x1f, 0x90, 127, 0, 0, 1],
        };
        encode(wr, 7, &record).unwrap();
        close(wr);

        let (fd, decoded) = decode(rd).unwrap().unwrap();
        assert_eq!(fd, 7);
        assert_eq!(decoded, record);
        assert!(decode(rd).unwrap().is_none());
        close(rd);
    }

    #[test]
    fn test_bound_without_address() {
        let (rd, wr) = pipe_pair();
        let record = WireRecord::Bound {
            listened: false,
            addr: Vec::new(),
        };
        encode(wr, 3, &record).unwrap();
        close(wr);

        let (fd, decoded) = decode(rd).unwrap().unwrap();
        assert_eq!(fd, 3);
        assert_eq!(decoded, record);
        close(rd);
    }

    #[test]
    fn test_saved_round_trip() {
        let (rd, wr) = pipe_pair();
        let record = WireRecord::Saved {
            fd: 1,
            offset: 4096,
        };
        encode(wr, 12, &record).unwrap();
        close(wr);

        let (fd, decoded) = decode(rd).unwrap().unwrap();
        assert_eq!(fd, 12);
        assert_eq!(decoded, record);
        close(rd);
    }

    #[test]
    fn test_stream_of_records() {
        let (rd, wr) = pipe_pair();
        let bound = WireRecord::Bound {
            listened: true,
            addr: vec![1, 2, 3],
        };
        let saved = WireRecord::Saved { fd: 0, offset: -1 };
        encode(wr, 4, &bound).unwrap();
        encode(wr, 9, &saved).unwrap();
        close(wr);

        assert_eq!(decode(rd).unwrap(), Some((4, bound)));
        assert_eq!(decode(rd).unwrap(), Some((9, saved)));
        assert!(decode(rd).unwrap().is_none());
        close(rd);
    }

    #[test]
    fn test_clean_eof_is_none() {
        let (rd, wr) = pipe_pair();
        close(wr);
        assert!(decode(rd).unwrap().is_none());
        close(rd);
    }

    #[test]
    fn test_eof_mid_record_is_truncation() {
        let (rd, wr) = pipe_pair();
        // fd plus tag, then nothing: the bound payload is missing.
        write_full(wr, &5_i32.to_ne_bytes()).unwrap();
        write_full(wr, &TAG_BOUND.to_ne_bytes()).unwrap();
        close(wr);

        match decode(rd) {
            Err(CodecError::TruncatedRecord) => (),
            other => panic!("expected truncation, got {:?}", other),
        }
        close(rd);
    }

    #[test]
    fn test_unknown_tag_rejected() {
        let (rd, wr) = pipe_pair();
        write_full(wr, &5_i32.to_ne_bytes()).unwrap();
        write_full(wr, &99_i32.to_ne_bytes()).unwrap();
        close(wr);

        match decode(rd) {
            Err(CodecError::UnknownTag(99)) => (),
            other => panic!("expected unknown tag, got {:?}", other),
        }
        close(rd);
    }

    #[test]
    fn test_oversize_address_rejected() {
        let (rd, wr) = pipe_pair();
        write_full(wr, &5_i32.to_ne_bytes()).unwrap();
        write_full(wr, &TAG_BOUND.to_ne_bytes()).unwrap();
        write_full(wr, &1_i32.to_ne_bytes()).unwrap();
        write_full(wr, &(MAX_ADDR_LEN + 1).to_ne_bytes()).unwrap();
        close(wr);

        match decode(rd) {
            Err(CodecError::OversizeAddress(_)) => (),
            other => panic!("expected oversize address, got {:?}", other),
        }
        close(rd);
    }
}
