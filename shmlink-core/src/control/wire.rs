// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! Length-prefixed JSON messages over a Unix stream socket.
//!
//! Wire format: `[u32 big-endian body length][JSON body]`. Descriptors ride
//! as `SCM_RIGHTS` ancillary data on the first chunk of a message.

use std::io::{ErrorKind, IoSlice, IoSliceMut, Read, Write};
use std::os::fd::{AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::net::UnixStream;

use nix::errno::Errno;
use nix::sys::socket::{recvmsg, sendmsg, ControlMessage, ControlMessageOwned, MsgFlags};
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::ControlError;

/// Upper bound for one message body.
pub const MAX_MESSAGE_SIZE: usize = 64 * 1024;

/// Length prefix size.
pub const HEADER_LEN: usize = 4;

/// Most descriptors accepted with a single message.
const MAX_FDS: usize = 4;

/// Serialize `message` and send it, attaching `fds` to the first chunk.
pub fn send_message<T: Serialize>(
    stream: &UnixStream,
    message: &T,
    fds: &[BorrowedFd<'_>],
) -> Result<(), ControlError> {
    let body = serde_json::to_vec(message)?;
    if body.len() > MAX_MESSAGE_SIZE {
        return Err(ControlError::MessageTooLarge {
            size: body.len(),
            max: MAX_MESSAGE_SIZE,
        });
    }

    let mut frame = Vec::with_capacity(HEADER_LEN + body.len());
    frame.extend_from_slice(&(body.len() as u32).to_be_bytes());
    frame.extend_from_slice(&body);

    let raw_fds: Vec<RawFd> = fds.iter().map(|fd| fd.as_raw_fd()).collect();
    let sent = loop {
        let iov = [IoSlice::new(&frame)];
        let cmsgs = [ControlMessage::ScmRights(&raw_fds)];
        let cmsgs: &[ControlMessage<'_>] = if raw_fds.is_empty() { &[] } else { &cmsgs };
        match sendmsg::<()>(stream.as_raw_fd(), &iov, cmsgs, MsgFlags::MSG_NOSIGNAL, None) {
            Ok(n) => break n,
            Err(Errno::EINTR) => continue,
            Err(Errno::EPIPE) | Err(Errno::ECONNRESET) => return Err(ControlError::Disconnected),
            Err(e) => {
                return Err(ControlError::Syscall {
                    syscall: "sendmsg",
                    source: e,
                })
            }
        }
    };

    if sent < frame.len() {
        let mut writer = stream;
        writer.write_all(&frame[sent..]).map_err(map_io("write"))?;
    }
    Ok(())
}

/// Receive one message and any descriptors sent with it.
///
/// Returns `Ok(None)` when the peer closed the connection cleanly between
/// messages.
pub fn recv_message<T: DeserializeOwned>(
    stream: &UnixStream,
) -> Result<Option<(T, Vec<OwnedFd>)>, ControlError> {
    let mut header = [0u8; HEADER_LEN];
    let mut filled = 0;
    let mut fds = Vec::new();

    while filled < HEADER_LEN {
        let n = recv_chunk(stream, &mut header[filled..], &mut fds)?;
        if n == 0 {
            if filled == 0 && fds.is_empty() {
                return Ok(None);
            }
            return Err(ControlError::Disconnected);
        }
        filled += n;
    }

    let len = u32::from_be_bytes(header) as usize;
    if len > MAX_MESSAGE_SIZE {
        return Err(ControlError::MessageTooLarge {
            size: len,
            max: MAX_MESSAGE_SIZE,
        });
    }

    let mut body = vec![0u8; len];
    let mut reader = stream;
    reader.read_exact(&mut body).map_err(|e| {
        if e.kind() == ErrorKind::UnexpectedEof {
            ControlError::Disconnected
        } else {
            map_io("read")(e)
        }
    })?;

    let message = serde_json::from_slice(&body)?;
    Ok(Some((message, fds)))
}

fn recv_chunk(
    stream: &UnixStream,
    buf: &mut [u8],
    fds: &mut Vec<OwnedFd>,
) -> Result<usize, ControlError> {
    let mut cmsg_buf = nix::cmsg_space!([RawFd; MAX_FDS]);
    loop {
        let mut iov = [IoSliceMut::new(buf)];
        let msg = match recvmsg::<()>(
            stream.as_raw_fd(),
            &mut iov,
            Some(&mut cmsg_buf),
            MsgFlags::MSG_CMSG_CLOEXEC,
        ) {
            Ok(msg) => msg,
            Err(Errno::EINTR) => continue,
            Err(Errno::ECONNRESET) => return Err(ControlError::Disconnected),
            Err(e) => {
                return Err(ControlError::Syscall {
                    syscall: "recvmsg",
                    source: e,
                })
            }
        };

        for cmsg in msg.cmsgs().map_err(|e| ControlError::Syscall {
            syscall: "recvmsg",
            source: e,
        })? {
            if let ControlMessageOwned::ScmRights(received) = cmsg {
                for raw in received {
                    // SAFETY: the kernel installed this descriptor in our table
                    // during recvmsg; nothing else owns it.
                    fds.push(unsafe { OwnedFd::from_raw_fd(raw) });
                }
            }
        }

        if msg.flags.contains(MsgFlags::MSG_CTRUNC) {
            return Err(ControlError::Protocol {
                reason: format!("more than {} descriptors attached", MAX_FDS),
            });
        }
        return Ok(msg.bytes);
    }
}

fn map_io(context: &'static str) -> impl Fn(std::io::Error) -> ControlError {
    move |source| match source.kind() {
        ErrorKind::BrokenPipe | ErrorKind::ConnectionReset => ControlError::Disconnected,
        _ => ControlError::Socket { context, source },
    }
}
