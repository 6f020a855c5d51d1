// SPDX-License-Identifier: AGPL-3.0-or-later

//! Gearman wire command codes (protocol.txt ~ fixed by upstream Gearman).
//!
//! Layout of every frame: 4-byte magic, 4-byte big-endian command code,
//! 4-byte big-endian payload length, then the payload itself.

use thiserror::Error;

/// Magic bytes prefixing every frame sent *to* a job server.
pub const REQ_MAGIC: [u8; 4] = *b"\0REQ";
/// Magic bytes prefixing every frame received *from* a job server.
pub const RES_MAGIC: [u8; 4] = *b"\0RES";
/// Fixed length of magic + command + size.
pub const HEADER_LEN: usize = 12;

/// One Gearman wire command.
///
/// The numeric values are fixed by the upstream Gearman protocol and must
/// never be renumbered.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Command {
    CanDo = 1,
    CantDo = 2,
    PreSleep = 4,
    Noop = 6,
    SubmitJob = 7,
    JobCreated = 8,
    GrabJob = 9,
    NoJob = 10,
    JobAssign = 11,
    WorkComplete = 13,
    WorkFail = 14,
    GetStatus = 15,
    EchoReq = 16,
    EchoRes = 17,
    SubmitJobBg = 18,
    SubmitJobHigh = 21,
    SetClientId = 22,
    WorkException = 25,
    WorkData = 28,
    WorkWarning = 29,
    SubmitJobHighBg = 32,
    SubmitJobLow = 33,
    SubmitJobLowBg = 34,
}

/// Returned when a 32-bit command field does not match any known Gearman
/// command.
#[derive(Debug, Error)]
#[error("unknown gearman command code: {0}")]
pub struct UnknownCommand(pub u32);

impl Command {
    /// The fixed set of commands that arrive unsolicited: they bypass the
    /// pending-response FIFO and are fanned out to subscribers instead.
    #[inline]
    pub fn is_unsolicited(self) -> bool {
        matches!(
            self,
            Command::WorkComplete
                | Command::WorkFail
                | Command::Noop
                | Command::WorkData
                | Command::WorkWarning
                | Command::WorkException
        )
    }
}

impl TryFrom<u32> for Command {
    type Error = UnknownCommand;

    fn try_from(v: u32) -> Result<Self, Self::Error> {
        Ok(match v {
            1 => Command::CanDo,
            2 => Command::CantDo,
            4 => Command::PreSleep,
            6 => Command::Noop,
            7 => Command::SubmitJob,
            8 => Command::JobCreated,
            9 => Command::GrabJob,
            10 => Command::NoJob,
            11 => Command::JobAssign,
            13 => Command::WorkComplete,
            14 => Command::WorkFail,
            15 => Command::GetStatus,
            16 => Command::EchoReq,
            17 => Command::EchoRes,
            18 => Command::SubmitJobBg,
            21 => Command::SubmitJobHigh,
            22 => Command::SetClientId,
            25 => Command::WorkException,
            28 => Command::WorkData,
            29 => Command::WorkWarning,
            32 => Command::SubmitJobHighBg,
            33 => Command::SubmitJobLow,
            34 => Command::SubmitJobLowBg,
            other => return Err(UnknownCommand(other)),
        })
    }
}

impl From<Command> for u32 {
    #[inline]
    fn from(c: Command) -> u32 {
        c as u32
    }
}
