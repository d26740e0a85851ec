/*!
Command/reply engine.

Every command goes through the same sequence on the register bus:

1. destination word (board and argument count)
2. argument registers 1..=n
3. reply register reset to the "not yet answered" sentinel
4. trigger on HCVR (meta) or CMDR (manual)

The only way to trigger a command is [`CommandEngine::send_command`] or
[`CommandEngine::send_manual_command`], both of which reset the reply
register, so a stale reply can never be read as the answer to a new command.
The returned [`PendingReply`] holds the engine borrowed until it is resolved
or dropped, so a second command cannot be sent while a reply is outstanding.
*/

use crate::addressing::{encode_destination, BoardId};
use crate::bus::RegisterBus;
use crate::command::{CommandCode, CommandShape, ReplyPolicy};
use crate::error::{Result, SdsuError};
use crate::protocol::{
    DEFAULT_REPLY_POLL_MS, DEFAULT_REPLY_TIMEOUT_MS, ERR, MAX_ARGUMENTS, REPLY_SENTINEL,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Cooperative cancellation flag shared between the control thread and any
/// context that wants to stop it (signal handlers, UIs).
#[derive(Debug, Clone, Default)]
pub struct AbortHandle(Arc<AtomicBool>);

impl AbortHandle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request that the in-flight operation stops at its next poll point
    pub fn abort(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn clear(&self) {
        self.0.store(false, Ordering::SeqCst);
    }

    pub fn is_aborted(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// What a reply is checked against
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Expected {
    /// Succeed only on this exact word
    Value(i32),
    /// Any word is data, return it verbatim
    ActualValue,
}

/// Reply polling parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineTiming {
    /// Sleep between reply register reads
    pub poll_interval: Duration,
    /// Give up on a silent controller after this long
    pub reply_timeout: Duration,
}

impl Default for EngineTiming {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(DEFAULT_REPLY_POLL_MS),
            reply_timeout: Duration::from_millis(DEFAULT_REPLY_TIMEOUT_MS),
        }
    }
}

/// Issues commands on a register bus and resolves their replies
pub struct CommandEngine<B: RegisterBus> {
    bus: B,
    abort: AbortHandle,
    timing: EngineTiming,
}

impl<B: RegisterBus> CommandEngine<B> {
    pub fn new(bus: B) -> Self {
        Self::with_abort(bus, AbortHandle::new())
    }

    /// Create an engine that observes an existing abort flag
    pub fn with_abort(bus: B, abort: AbortHandle) -> Self {
        Self {
            bus,
            abort,
            timing: EngineTiming::default(),
        }
    }

    pub fn with_timing(mut self, timing: EngineTiming) -> Self {
        self.timing = timing;
        self
    }

    pub fn timing(&self) -> EngineTiming {
        self.timing
    }

    /// Handle to the abort flag polled by this engine
    pub fn abort_handle(&self) -> AbortHandle {
        self.abort.clone()
    }

    pub fn bus(&self) -> &B {
        &self.bus
    }

    pub fn bus_mut(&mut self) -> &mut B {
        &mut self.bus
    }

    pub fn into_bus(self) -> B {
        self.bus
    }

    /// Send a meta command through the Host Command Vector Register
    pub fn send_command(
        &mut self,
        board: BoardId,
        command: CommandCode,
        args: &[i32],
    ) -> Result<PendingReply<'_, B>> {
        self.send(board, command, args, CommandShape::Meta)
    }

    /// Send a manual command through the legacy Command Register
    pub fn send_manual_command(
        &mut self,
        board: BoardId,
        command: CommandCode,
        args: &[i32],
    ) -> Result<PendingReply<'_, B>> {
        self.send(board, command, args, CommandShape::Manual)
    }

    fn send(
        &mut self,
        board: BoardId,
        command: CommandCode,
        args: &[i32],
        shape: CommandShape,
    ) -> Result<PendingReply<'_, B>> {
        if command.shape() != shape {
            return Err(SdsuError::invalid_argument(
                command.name(),
                format!("{:?} command sent as {:?}", command.shape(), shape),
            ));
        }
        if command.reply() == ReplyPolicy::NoReply {
            return Err(SdsuError::invalid_argument(
                command.name(),
                "command is never answered, use send_without_reply",
            ));
        }
        self.stage(board, command, args)?;
        self.bus.clear_reply()?;
        self.bus.trigger(shape, command.code())?;
        Ok(PendingReply {
            engine: self,
            command,
            args: stash(args),
        })
    }

    /// Trigger a command that the controller never answers. The reply
    /// register is neither cleared nor polled.
    pub fn send_without_reply(
        &mut self,
        board: BoardId,
        command: CommandCode,
        args: &[i32],
    ) -> Result<()> {
        if command.reply() != ReplyPolicy::NoReply {
            return Err(SdsuError::invalid_argument(
                command.name(),
                "command expects a reply, use send_command",
            ));
        }
        self.stage(board, command, args)?;
        self.bus.trigger(command.shape(), command.code())
    }

    fn stage(&mut self, board: BoardId, command: CommandCode, args: &[i32]) -> Result<()> {
        if args.len() > MAX_ARGUMENTS {
            return Err(SdsuError::invalid_argument(
                command.name(),
                format!("{} arguments, at most {}", args.len(), MAX_ARGUMENTS),
            ));
        }
        debug!(command = command.name(), %board, ?args, "sending command");
        self.bus.set_destination(encode_destination(board, args.len())?)?;
        for (i, value) in args.iter().enumerate() {
            self.bus.set_argument(i + 1, *value)?;
        }
        Ok(())
    }

    /// Reset the reply register to the sentinel
    pub fn clear_reply(&mut self) -> Result<()> {
        self.bus.clear_reply()
    }

    /// Poll the reply register until the sentinel is replaced, the abort flag
    /// is raised or the reply timeout expires.
    pub fn get_reply(&mut self, operation: &'static str, expected: Expected) -> Result<i32> {
        let start = Instant::now();
        let reply = loop {
            if self.abort.is_aborted() {
                debug!(operation, "abort observed while waiting for reply");
                return Err(SdsuError::Aborted { operation });
            }
            let value = self.bus.get_reply()?;
            if value != REPLY_SENTINEL {
                break value;
            }
            let elapsed = start.elapsed();
            if elapsed >= self.timing.reply_timeout {
                warn!(
                    operation,
                    elapsed_ms = elapsed.as_millis() as u64,
                    "controller did not reply"
                );
                return Err(SdsuError::Timeout {
                    operation,
                    elapsed_ms: elapsed.as_millis() as u64,
                });
            }
            thread::sleep(self.timing.poll_interval);
        };
        debug!(operation, reply = format_args!("{:#08X}", reply), "reply received");

        match expected {
            Expected::ActualValue => Ok(reply),
            Expected::Value(_) if reply == ERR => Err(SdsuError::ProtocolError { operation }),
            Expected::Value(want) if reply == want => Ok(reply),
            Expected::Value(want) => Err(SdsuError::UnexpectedReply {
                operation,
                got: reply,
                expected: want,
            }),
        }
    }

    /// Send a command and wait for the reply its table entry promises
    pub fn command(&mut self, board: BoardId, command: CommandCode, args: &[i32]) -> Result<i32> {
        let pending = match command.shape() {
            CommandShape::Meta => self.send_command(board, command, args)?,
            CommandShape::Manual => self.send_manual_command(board, command, args)?,
        };
        pending.wait_default()
    }
}

fn stash(args: &[i32]) -> [i32; MAX_ARGUMENTS] {
    let mut out = [0; MAX_ARGUMENTS];
    out[..args.len()].copy_from_slice(args);
    out
}

/// A triggered command whose reply has not been read yet
#[must_use = "a sent command must have its reply resolved"]
pub struct PendingReply<'a, B: RegisterBus> {
    engine: &'a mut CommandEngine<B>,
    command: CommandCode,
    args: [i32; MAX_ARGUMENTS],
}

impl<'a, B: RegisterBus> PendingReply<'a, B> {
    pub fn command(&self) -> CommandCode {
        self.command
    }

    /// Wait for the reply and check it against `expected`
    pub fn wait(self, expected: Expected) -> Result<i32> {
        self.engine.get_reply(self.command.name(), expected)
    }

    /// Wait for the reply the command table specifies for this command
    pub fn wait_default(self) -> Result<i32> {
        let expected = self
            .command
            .expected_reply(&self.args)
            .unwrap_or(Expected::ActualValue);
        self.wait(expected)
    }
}
