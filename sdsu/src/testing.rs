//! Scripted register bus for unit tests.

use crate::bus::{Register, RegisterBus};
use crate::command::{CommandCode, CommandShape, ReplyPolicy};
use crate::error::{Result, SdsuError};
use crate::protocol::{DON, ERR, REPLY_SENTINEL, SYR};

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Access {
    Write(Register, i32),
    Read(Register),
}

/// How the mock answers a trigger
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum MockReply {
    /// Post this word in the reply register
    Value(i32),
    /// Leave the reply register untouched
    Silent,
    /// Fail the trigger write itself
    Fail,
}

type Responder = Box<dyn FnMut(CommandCode, &[i32; 5]) -> MockReply + Send>;

pub(crate) struct MockBus {
    accesses: Vec<Access>,
    args: [i32; 5],
    reply: i32,
    responder: Responder,
    image: Vec<u8>,
    image_pos: usize,
}

/// Answer the way a healthy controller would
pub(crate) fn default_reply(command: CommandCode, args: &[i32; 5]) -> MockReply {
    match command.reply() {
        ReplyPolicy::Done => MockReply::Value(DON),
        ReplyPolicy::Reset => MockReply::Value(SYR),
        ReplyPolicy::Echo => MockReply::Value(args[0]),
        ReplyPolicy::Actual => MockReply::Value(0),
        ReplyPolicy::NoReply => MockReply::Silent,
    }
}

impl MockBus {
    pub(crate) fn new() -> Self {
        Self {
            accesses: Vec::new(),
            args: [0; 5],
            reply: REPLY_SENTINEL,
            responder: Box::new(default_reply),
            image: Vec::new(),
            image_pos: 0,
        }
    }

    pub(crate) fn with_responder(
        mut self,
        responder: impl FnMut(CommandCode, &[i32; 5]) -> MockReply + Send + 'static,
    ) -> Self {
        self.responder = Box::new(responder);
        self
    }

    pub(crate) fn with_image(mut self, image: Vec<u8>) -> Self {
        self.image = image;
        self
    }

    pub(crate) fn accesses(&self) -> &[Access] {
        &self.accesses
    }

    /// Writes only, in order
    pub(crate) fn writes(&self) -> Vec<(Register, i32)> {
        self.accesses
            .iter()
            .filter_map(|a| match a {
                Access::Write(r, v) => Some((*r, *v)),
                Access::Read(_) => None,
            })
            .collect()
    }

    /// Commands triggered so far, in order
    pub(crate) fn triggered(&self) -> Vec<CommandCode> {
        self.writes()
            .into_iter()
            .filter_map(|(r, v)| match r {
                Register::Hcvr => CommandCode::from_trigger(CommandShape::Meta, v),
                Register::Cmdr => CommandCode::from_trigger(CommandShape::Manual, v),
                _ => None,
            })
            .collect()
    }

    pub(crate) fn count(&self, command: CommandCode) -> usize {
        self.triggered().iter().filter(|c| **c == command).count()
    }
}

impl RegisterBus for MockBus {
    fn write(&mut self, register: Register, value: i32) -> Result<()> {
        self.accesses.push(Access::Write(register, value));
        let shape = match register {
            Register::Argument(i) => {
                self.args[usize::from(i) - 1] = value;
                return Ok(());
            }
            Register::Reply => {
                self.reply = value;
                return Ok(());
            }
            Register::Destination => return Ok(()),
            Register::Hcvr => CommandShape::Meta,
            Register::Cmdr => CommandShape::Manual,
        };
        let answer = match CommandCode::from_trigger(shape, value) {
            Some(command) => (self.responder)(command, &self.args),
            None => MockReply::Value(ERR),
        };
        match answer {
            MockReply::Value(v) => self.reply = v,
            MockReply::Silent => {}
            MockReply::Fail => return Err(SdsuError::transport("mock trigger failure")),
        }
        Ok(())
    }

    fn read(&mut self, register: Register) -> Result<i32> {
        self.accesses.push(Access::Read(register));
        Ok(match register {
            Register::Reply => self.reply,
            Register::Argument(i) => self.args[usize::from(i) - 1],
            _ => 0,
        })
    }

    fn read_image(&mut self, buf: &mut [u8]) -> Result<usize> {
        let n = buf.len().min(self.image.len() - self.image_pos);
        buf[..n].copy_from_slice(&self.image[self.image_pos..self.image_pos + n]);
        self.image_pos += n;
        Ok(n)
    }
}
