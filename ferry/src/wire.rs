//! Wire codec: one tagged request frame per connection, one fixed reply.
//!
//! All integers are little-endian and packed. A page crosses as four
//! sequential `PAGE_REQ` frames of 1024 bytes each; the environment record
//! travels flat inside `START_LEASE`.

use std::io::{self, Read, Write};

use thiserror::Error;

use kern::env::{EnvRecord, Kind, Status, TrapFrame};
use kern::{EnvId, CHUNK};

#[derive(Debug, Error)]
pub enum WireError {
    #[error("i/o: {0}")]
    Io(#[from] io::Error),
    /// Unknown tag or a field no decoder state accepts.
    #[error("malformed frame")]
    BadFrame,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReqType {
    PageReq = 0,
    StartLease = 1,
    DoneLease = 2,
    AbortLease = 3,
    CompletedLease = 4,
    StartIpc = 5,
    DoneIpc = 6,
}

impl ReqType {
    pub fn from_const(tag: u8) -> Option<ReqType> {
        Some(match tag {
            0 => ReqType::PageReq,
            1 => ReqType::StartLease,
            2 => ReqType::DoneLease,
            3 => ReqType::AbortLease,
            4 => ReqType::CompletedLease,
            5 => ReqType::StartIpc,
            6 => ReqType::DoneIpc,
            _ => return None,
        })
    }
}

/// Cross-node IPC delivery notice.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IpcPacket {
    pub dst: EnvId,
    pub src: EnvId,
    pub value: u32,
    pub va: u32,
    pub perm: u32,
    pub from_alien: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Request {
    /// One 1024-byte quarter of a page. Chunk 0 is the allocation point on
    /// the receiving side.
    Page {
        src: EnvId,
        va: u32,
        perm: u32,
        chunk: u8,
        data: Box<[u8; CHUNK]>,
    },
    StartLease {
        src: EnvId,
        record: EnvRecord,
        thisenv: u32,
    },
    DoneLease { src: EnvId },
    AbortLease { src: EnvId },
    CompletedLease { src: EnvId },
    StartIpc(IpcPacket),
    /// Reserved; carried for wire compatibility, ignored by the server.
    DoneIpc { src: EnvId },
}

/// Reply to every request: a status code and an echo of the environment id
/// the request named.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Reply {
    pub status: i32,
    pub env: u32,
}

pub const REPLY_LEN: usize = 8;

/// Flat environment record: five head words, the trap frame, the upcall,
/// five IPC words, alien flag, and the three host fields.
pub const ENV_RECORD_LEN: usize = 5 * 4 + (8 + 3) * 4 + 4 + 5 * 4 + 4 + 3 * 4;

const IPC_PACKET_LEN: usize = 5 * 4 + 1;

impl Request {
    /// The id echoed in this request's reply.
    pub fn echo_id(&self) -> u32 {
        match self {
            Request::Page { src, .. }
            | Request::StartLease { src, .. }
            | Request::DoneLease { src }
            | Request::AbortLease { src }
            | Request::CompletedLease { src }
            | Request::DoneIpc { src } => src.0,
            Request::StartIpc(pkt) => pkt.dst.0,
        }
    }

    pub fn write_to(&self, w: &mut impl Write) -> io::Result<()> {
        match self {
            Request::Page {
                src,
                va,
                perm,
                chunk,
                data,
            } => {
                w.write_all(&[ReqType::PageReq as u8])?;
                w.write_all(&src.0.to_le_bytes())?;
                w.write_all(&va.to_le_bytes())?;
                w.write_all(&perm.to_le_bytes())?;
                w.write_all(&[*chunk])?;
                w.write_all(&data[..])?;
            }
            Request::StartLease {
                src,
                record,
                thisenv,
            } => {
                w.write_all(&[ReqType::StartLease as u8])?;
                w.write_all(&src.0.to_le_bytes())?;
                w.write_all(&encode_env_record(record))?;
                w.write_all(&thisenv.to_le_bytes())?;
            }
            Request::DoneLease { src } => {
                w.write_all(&[ReqType::DoneLease as u8])?;
                w.write_all(&src.0.to_le_bytes())?;
            }
            Request::AbortLease { src } => {
                w.write_all(&[ReqType::AbortLease as u8])?;
                w.write_all(&src.0.to_le_bytes())?;
            }
            Request::CompletedLease { src } => {
                w.write_all(&[ReqType::CompletedLease as u8])?;
                w.write_all(&src.0.to_le_bytes())?;
            }
            Request::StartIpc(pkt) => {
                w.write_all(&[ReqType::StartIpc as u8])?;
                w.write_all(&pkt.dst.0.to_le_bytes())?;
                w.write_all(&pkt.src.0.to_le_bytes())?;
                w.write_all(&pkt.value.to_le_bytes())?;
                w.write_all(&pkt.va.to_le_bytes())?;
                w.write_all(&pkt.perm.to_le_bytes())?;
                w.write_all(&[pkt.from_alien as u8])?;
            }
            Request::DoneIpc { src } => {
                w.write_all(&[ReqType::DoneIpc as u8])?;
                w.write_all(&src.0.to_le_bytes())?;
            }
        }
        Ok(())
    }

    pub fn read_from(r: &mut impl Read) -> Result<Request, WireError> {
        let tag = read_u8(r)?;
        let ty = ReqType::from_const(tag).ok_or(WireError::BadFrame)?;
        Ok(match ty {
            ReqType::PageReq => {
                let src = EnvId(read_u32(r)?);
                let va = read_u32(r)?;
                let perm = read_u32(r)?;
                let chunk = read_u8(r)?;
                let mut data = Box::new([0u8; CHUNK]);
                r.read_exact(&mut data[..])?;
                Request::Page {
                    src,
                    va,
                    perm,
                    chunk,
                    data,
                }
            }
            ReqType::StartLease => {
                let src = EnvId(read_u32(r)?);
                let mut raw = [0u8; ENV_RECORD_LEN];
                r.read_exact(&mut raw)?;
                let record = decode_env_record(&raw)?;
                let thisenv = read_u32(r)?;
                Request::StartLease {
                    src,
                    record,
                    thisenv,
                }
            }
            ReqType::DoneLease => Request::DoneLease {
                src: EnvId(read_u32(r)?),
            },
            ReqType::AbortLease => Request::AbortLease {
                src: EnvId(read_u32(r)?),
            },
            ReqType::CompletedLease => Request::CompletedLease {
                src: EnvId(read_u32(r)?),
            },
            ReqType::StartIpc => {
                let mut raw = [0u8; IPC_PACKET_LEN];
                r.read_exact(&mut raw)?;
                Request::StartIpc(IpcPacket {
                    dst: EnvId(get_u32(&raw, 0)),
                    src: EnvId(get_u32(&raw, 4)),
                    value: get_u32(&raw, 8),
                    va: get_u32(&raw, 12),
                    perm: get_u32(&raw, 16),
                    from_alien: raw[20] != 0,
                })
            }
            ReqType::DoneIpc => Request::DoneIpc {
                src: EnvId(read_u32(r)?),
            },
        })
    }
}

impl Reply {
    pub fn write_to(&self, w: &mut impl Write) -> io::Result<()> {
        w.write_all(&self.status.to_le_bytes())?;
        w.write_all(&self.env.to_le_bytes())?;
        Ok(())
    }

    pub fn read_from(r: &mut impl Read) -> Result<Reply, WireError> {
        let mut raw = [0u8; REPLY_LEN];
        r.read_exact(&mut raw)?;
        Ok(Reply {
            status: i32::from_le_bytes(raw[0..4].try_into().unwrap()),
            env: get_u32(&raw, 4),
        })
    }
}

pub fn encode_env_record(rec: &EnvRecord) -> [u8; ENV_RECORD_LEN] {
    let mut out = [0u8; ENV_RECORD_LEN];
    let mut at = 0;
    let mut put = |v: u32| {
        out[at..at + 4].copy_from_slice(&v.to_le_bytes());
        at += 4;
    };

    put(rec.id.0);
    put(rec.parent.0);
    put(rec.status.to_wire());
    put(rec.kind.to_wire());
    put(rec.runs);
    for reg in rec.tf.regs {
        put(reg);
    }
    put(rec.tf.ip);
    put(rec.tf.sp);
    put(rec.tf.flags);
    put(rec.pgfault_upcall);
    put(rec.ipc_recving as u32);
    put(rec.ipc_dstva);
    put(rec.ipc_value);
    put(rec.ipc_from.0);
    put(rec.ipc_perm);
    put(rec.alien as u32);
    put(rec.host_ip);
    put(rec.host_port as u32);
    put(rec.host_eid.0);
    out
}

pub fn decode_env_record(raw: &[u8; ENV_RECORD_LEN]) -> Result<EnvRecord, WireError> {
    let mut at = 0;
    let mut take = || {
        let v = get_u32(raw, at);
        at += 4;
        v
    };

    let id = EnvId(take());
    let parent = EnvId(take());
    let status = Status::from_wire(take()).ok_or(WireError::BadFrame)?;
    let kind = Kind::from_wire(take()).ok_or(WireError::BadFrame)?;
    let runs = take();
    let mut regs = [0u32; 8];
    for reg in regs.iter_mut() {
        *reg = take();
    }
    let tf = TrapFrame {
        regs,
        ip: take(),
        sp: take(),
        flags: take(),
    };
    let pgfault_upcall = take();
    let ipc_recving = take() != 0;
    let ipc_dstva = take();
    let ipc_value = take();
    let ipc_from = EnvId(take());
    let ipc_perm = take();
    let alien = take() != 0;
    let host_ip = take();
    let host_port = take() as u16;
    let host_eid = EnvId(take());

    Ok(EnvRecord {
        id,
        parent,
        status,
        kind,
        runs,
        tf,
        pgfault_upcall,
        ipc_recving,
        ipc_dstva,
        ipc_value,
        ipc_from,
        ipc_perm,
        alien,
        host_ip,
        host_port,
        host_eid,
    })
}

fn get_u32(raw: &[u8], at: usize) -> u32 {
    u32::from_le_bytes(raw[at..at + 4].try_into().unwrap())
}

fn read_u8(r: &mut impl Read) -> Result<u8, WireError> {
    let mut b = [0u8; 1];
    r.read_exact(&mut b)?;
    Ok(b[0])
}

fn read_u32(r: &mut impl Read) -> Result<u32, WireError> {
    let mut b = [0u8; 4];
    r.read_exact(&mut b)?;
    Ok(u32::from_le_bytes(b))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::BUFFSIZE;
    use kern::{Status, REG_RETVAL};

    fn sample_record() -> EnvRecord {
        let mut tf = TrapFrame {
            ip: 3,
            sp: 0xeebf_d000,
            flags: 0x202,
            ..TrapFrame::default()
        };
        tf.regs[REG_RETVAL] = 0;
        tf.regs[3] = 0xdead_beef;
        EnvRecord {
            id: EnvId(0x0000_1001),
            parent: EnvId(0x0000_1000),
            status: Status::Suspended,
            kind: kern::Kind::User,
            runs: 7,
            tf,
            pgfault_upcall: 0x80_4000,
            ipc_recving: false,
            ipc_dstva: 0xeec0_0000,
            ipc_value: 0,
            ipc_from: EnvId::NONE,
            ipc_perm: 0,
            alien: false,
            host_ip: 0x7f00_0001,
            host_port: 7,
            host_eid: EnvId(0x0000_1001),
        }
    }

    #[test]
    fn env_record_survives_the_wire() {
        let rec = sample_record();
        let decoded = decode_env_record(&encode_env_record(&rec)).unwrap();
        assert_eq!(rec, decoded);
    }

    #[test]
    fn start_lease_frame_round_trip() {
        let req = Request::StartLease {
            src: EnvId(0x1001),
            record: sample_record(),
            thisenv: 0x0080_0004,
        };
        let mut buf = Vec::new();
        req.write_to(&mut buf).unwrap();
        let got = Request::read_from(&mut buf.as_slice()).unwrap();
        assert_eq!(req, got);
    }

    #[test]
    fn page_frame_round_trip_and_size() {
        let mut data = Box::new([0u8; CHUNK]);
        data[0] = 0xaa;
        data[CHUNK - 1] = 0x55;
        let req = Request::Page {
            src: EnvId(0x1001),
            va: 0x0080_0000,
            perm: 0x807,
            chunk: 2,
            data,
        };
        let mut buf = Vec::new();
        req.write_to(&mut buf).unwrap();
        // Every frame fits the MTU-sized buffer the original used.
        assert!(buf.len() <= BUFFSIZE);
        let got = Request::read_from(&mut buf.as_slice()).unwrap();
        assert_eq!(req, got);
        assert_eq!(req.echo_id(), 0x1001);
    }

    #[test]
    fn ipc_frame_round_trip() {
        let req = Request::StartIpc(IpcPacket {
            dst: EnvId(0x1001),
            src: EnvId(0x2001),
            value: 0x100,
            va: 0,
            perm: 0,
            from_alien: true,
        });
        let mut buf = Vec::new();
        req.write_to(&mut buf).unwrap();
        let got = Request::read_from(&mut buf.as_slice()).unwrap();
        assert_eq!(req, got);
        assert_eq!(req.echo_id(), 0x1001);
    }

    #[test]
    fn rejects_unknown_tag_and_truncation() {
        assert!(matches!(
            Request::read_from(&mut [9u8].as_slice()),
            Err(WireError::BadFrame)
        ));
        // StartLease cut short mid-record.
        let req = Request::StartLease {
            src: EnvId(0x1001),
            record: sample_record(),
            thisenv: 0,
        };
        let mut buf = Vec::new();
        req.write_to(&mut buf).unwrap();
        buf.truncate(40);
        assert!(matches!(
            Request::read_from(&mut buf.as_slice()),
            Err(WireError::Io(_))
        ));
    }

    #[test]
    fn record_with_bad_status_is_rejected() {
        let mut raw = encode_env_record(&sample_record());
        raw[8..12].copy_from_slice(&99u32.to_le_bytes());
        assert!(matches!(
            decode_env_record(&raw),
            Err(WireError::BadFrame)
        ));
    }

    #[test]
    fn reply_round_trip() {
        let r = Reply {
            status: -202,
            env: 0x1001,
        };
        let mut buf = Vec::new();
        r.write_to(&mut buf).unwrap();
        assert_eq!(buf.len(), REPLY_LEN);
        assert_eq!(Reply::read_from(&mut buf.as_slice()).unwrap(), r);
    }
}
