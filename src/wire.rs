// SPDX-License-Identifier: AGPL-3.0-or-later
//! Collector wire protocol.
//!
//! Framing: big-endian u32 length prefix + raw bytes.
//! Payload: one tag byte followed by the message body.
//! Session: client sends `Hello`, collector answers `Accepted` (or `Failure`),
//!          then the client streams `Entry` frames and ends with `Flush`.

use std::io::{self, Read, Write};

pub const SESSION_ID_LEN: usize = 16;
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024; // 16 MiB
const HEADER_LEN: usize = 4;

const TAG_HELLO: u8 = b'H';
const TAG_ACCEPTED: u8 = b'A';
const TAG_FAILURE: u8 = b'X';
const TAG_PING: u8 = b'P';
const TAG_PONG: u8 = b'O';
const TAG_ENTRY: u8 = b'E';
const TAG_FLUSH: u8 = b'F';
const TAG_FLUSHED: u8 = b'D';

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Hello { project: String, log_name: String },
    Accepted { session: [u8; SESSION_ID_LEN] },
    Failure { reason: String },
    Ping,
    Pong,
    Entry { payload: String },
    Flush,
    Flushed,
}

fn invalid(msg: impl Into<String>) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, msg.into())
}

fn utf8(bytes: &[u8]) -> io::Result<String> {
    String::from_utf8(bytes.to_vec()).map_err(|_| invalid("string not valid UTF-8"))
}

impl Message {
    /// Encodes the message as one complete frame, length header included.
    pub fn to_frame(&self) -> io::Result<Vec<u8>> {
        // Header is patched in once the body length is known.
        let mut frame = vec![0u8; HEADER_LEN];
        match self {
            Message::Hello { project, log_name } => {
                let len = u16::try_from(project.len())
                    .map_err(
                        |_| io::Error::new(
                            io::ErrorKind::InvalidInput, "project name too long"
                        )
                    )?;
                frame.push(TAG_HELLO);
                frame.extend_from_slice(&len.to_be_bytes());
                frame.extend_from_slice(project.as_bytes());
                frame.extend_from_slice(log_name.as_bytes());
            }
            Message::Accepted { session } => {
                frame.push(TAG_ACCEPTED);
                frame.extend_from_slice(session);
            }
            Message::Failure { reason } => {
                frame.push(TAG_FAILURE);
                frame.extend_from_slice(reason.as_bytes());
            }
            Message::Ping => frame.push(TAG_PING),
            Message::Pong => frame.push(TAG_PONG),
            Message::Entry { payload } => {
                frame.push(TAG_ENTRY);
                frame.extend_from_slice(payload.as_bytes());
            }
            Message::Flush => frame.push(TAG_FLUSH),
            Message::Flushed => frame.push(TAG_FLUSHED),
        }

        let body_len = frame.len() - HEADER_LEN;
        if body_len > MAX_FRAME_SIZE {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("message of {body_len} bytes exceeds the frame limit"),
            ));
        }
        frame[..HEADER_LEN].copy_from_slice(&(body_len as u32).to_be_bytes());
        Ok(frame)
    }

    /// Parses a frame body: the tag byte and whatever follows it.
    pub fn decode(body: &[u8]) -> io::Result<Self> {
        let (&tag, body) = body.split_first().ok_or_else(|| invalid("empty frame"))?;
        let msg = match tag {
            TAG_HELLO => {
                if body.len() < 2 {
                    return Err(invalid("truncated hello"));
                }
                let len = u16::from_be_bytes([body[0], body[1]]) as usize;
                let rest = &body[2..];
                if rest.len() < len {
                    return Err(invalid("truncated hello"));
                }
                let (project, log_name) = rest.split_at(len);
                Message::Hello {
                    project: utf8(project)?,
                    log_name: utf8(log_name)?,
                }
            }
            TAG_ACCEPTED => {
                let session = body
                    .try_into()
                    .map_err(|_| invalid("bad session id length"))?;
                Message::Accepted { session }
            }
            TAG_FAILURE => Message::Failure { reason: utf8(body)? },
            TAG_PING => Message::Ping,
            TAG_PONG => Message::Pong,
            TAG_ENTRY => Message::Entry { payload: utf8(body)? },
            TAG_FLUSH => Message::Flush,
            TAG_FLUSHED => Message::Flushed,
            other => return Err(invalid(format!("unknown message tag 0x{other:02x}"))),
        };
        Ok(msg)
    }
}

/// Writes `msg` as a single frame.
pub fn send_message<W: Write>(w: &mut W, msg: &Message) -> io::Result<()> {
    w.write_all(&msg.to_frame()?)
}

/// Reads one frame and decodes it. `Ok(None)` means the peer closed the
/// connection between frames.
pub fn recv_message<R: Read>(r: &mut R) -> io::Result<Option<Message>> {
    let mut header = [0u8; HEADER_LEN];
    if let Err(e) = r.read_exact(&mut header) {
        return match e.kind() {
            io::ErrorKind::UnexpectedEof => Ok(None),
            _ => Err(e),
        };
    }

    let len = u32::from_be_bytes(header) as usize;
    if len > MAX_FRAME_SIZE {
        return Err(invalid(format!("incoming frame of {len} bytes is too large")));
    }
    let mut body = vec![0u8; len];
    r.read_exact(&mut body)?;
    Message::decode(&body).map(Some)
}

pub fn session_hex(session: &[u8; SESSION_ID_LEN]) -> String {
    session.iter().map(|b| format!("{b:02x}")).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn hello_survives_the_wire() {
        let hello = Message::Hello {
            project: "acme-prod".to_string(),
            log_name: "nginx/access".to_string(),
        };
        let mut buf = Vec::new();
        send_message(&mut buf, &hello).unwrap();

        let mut r = Cursor::new(buf);
        assert_eq!(recv_message(&mut r).unwrap(), Some(hello));
        assert_eq!(recv_message(&mut r).unwrap(), None);
    }

    #[test]
    fn length_header_counts_tag_and_body() {
        assert_eq!(Message::Ping.to_frame().unwrap(), [0, 0, 0, 1, TAG_PING]);

        let entry = Message::Entry { payload: "hi".to_string() };
        assert_eq!(entry.to_frame().unwrap(), [0, 0, 0, 3, TAG_ENTRY, b'h', b'i']);
    }

    #[test]
    fn clean_eof_is_not_an_error() {
        let mut r = Cursor::new(Vec::<u8>::new());
        assert!(recv_message(&mut r).unwrap().is_none());
    }

    #[test]
    fn eof_inside_a_frame_is_an_error() {
        // Length says 10 bytes but only 3 follow.
        let mut bytes = 10u32.to_be_bytes().to_vec();
        bytes.extend_from_slice(b"Eab");
        let err = recv_message(&mut Cursor::new(bytes)).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }

    #[test]
    fn oversized_frames_are_refused_both_ways() {
        let big = Message::Entry { payload: "x".repeat(MAX_FRAME_SIZE) };
        let mut sent = Vec::new();
        let err = send_message(&mut sent, &big).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
        assert!(sent.is_empty(), "nothing is written for a refused message");

        let header = ((MAX_FRAME_SIZE + 1) as u32).to_be_bytes();
        let err = recv_message(&mut Cursor::new(header.to_vec())).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn garbage_is_rejected() {
        assert!(Message::decode(&[]).is_err());
        assert!(Message::decode(b"Z").is_err());
        assert!(Message::decode(&[TAG_HELLO, 0, 9, b'x']).is_err());
        assert!(Message::decode(&[TAG_ACCEPTED, 1, 2, 3]).is_err());
        assert!(Message::decode(&[TAG_ENTRY, 0xff, 0xfe]).is_err());
    }

    #[test]
    fn session_ids_render_as_hex() {
        let mut session = [0u8; SESSION_ID_LEN];
        session[0] = 0xab;
        session[15] = 0x01;
        assert_eq!(session_hex(&session), "ab000000000000000000000000000001");
    }
}
